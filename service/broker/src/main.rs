extern crate jemallocator;

// jemalloc copes far better than the glibc allocator with the bursts of concurrent
// requests (and the subprocess output buffers they produce) that a pool refill causes.
#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

#[macro_use]
extern crate rocket;

#[macro_use]
extern crate lazy_static;

pub mod apps;
pub mod broker;
pub mod builder;
pub mod config;
pub mod cookie;
pub mod deployer;
pub mod registry;
pub mod reservation;
pub mod routes;
#[cfg(test)]
mod testing;

use crate::broker::{Broker, Cluster};
use crate::config::BrokerConfig;
use error::*;
use result::Result;
use std::net::Ipv4Addr;
use std::sync::Arc;
use term_colors::{cyan, red};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    // Sets the logger to use terminal colors.
    std::env::set_var("RUST_LOG_STYLE", "always");
    env_logger::init();
    if let Err(err) = run().await {
        error!("{}", red(chain(err.as_ref())));
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = BrokerConfig::from_env()?;
    let client = k8s::client::try_default().await?;
    let broker = Arc::new(Broker::new(config, Cluster::kube(client)));

    let token = CancellationToken::new();
    let discovery = registry::spawn_discovery(broker.clone(), token.clone());

    let mut c = rocket::Config::default();
    // If you leave it to the default then it will choose
    // 127.0.0.1 which will not be reachable when running
    // in a container. So please leave this to 0.0.0.0.
    c.address = Ipv4Addr::UNSPECIFIED.into();
    c.port = broker.config.port;
    info!(
        "Serving the reservation broker on port {}",
        cyan(broker.config.port.to_string())
    );
    let served = routes::rocket(c, broker.clone()).launch().await;

    token.cancel();
    if let Err(err) = discovery.await {
        warn!("App discovery failed to join, {:?}", err);
    }
    broker.registry.shutdown().await;
    served.map_err(|err| LaunchFailed {
        reason: err.to_string(),
    })?;
    Ok(())
}

#[derive(Error, BrokerError, Debug)]
#[code(Status::InternalServerError)]
#[error("The HTTP server failed: {reason}")]
struct LaunchFailed {
    reason: String,
}
