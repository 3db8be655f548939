use crate::apps::{AppConfig, RegisteredApps};
use crate::broker::{Broker, Cluster};
use crate::config::BrokerConfig;
use crate::deployer::Deployer;
use crate::reservation::reconciler::{Reconciler, ReconcilerHandle};
use crate::reservation::{AppContext, AuthSettings, PoolMember};
use futures::{pin_mut, select, FutureExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use term_colors::cyan;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type Apps = Arc<HashMap<String, Arc<AppContext>>>;

/// The AppRegistry maps app names to their [AppContext](crate::reservation::AppContext).
///
/// Request handlers only ever see a consistent snapshot of the map. It is replaced wholesale
/// by [sync](AppRegistry::sync), never edited in place, and an app that has been removed
/// from the map has already had its reconciler stopped or is about to.
#[derive(Default)]
pub struct AppRegistry {
    apps: RwLock<Apps>,
    reconcilers: Mutex<HashMap<String, ReconcilerHandle>>,
    deployer: Deployer,
}

impl AppRegistry {
    pub async fn get(&self, name: &str) -> Option<Arc<AppContext>> {
        self.apps.read().await.get(name).cloned()
    }

    pub async fn snapshot(&self) -> Apps {
        self.apps.read().await.clone()
    }

    /// Finds the pool member (of any app) behind one of `addresses`.
    pub async fn member_by_address(
        &self,
        addresses: &[&str],
    ) -> Option<(Arc<AppContext>, PoolMember)> {
        let apps = self.snapshot().await;
        let mut names: Vec<&String> = apps.keys().collect();
        names.sort();
        for name in names {
            let ctx = &apps[name];
            let member = ctx.table.read().await.member_by_address(addresses);
            if let Some(member) = member {
                return Some((ctx.clone(), member));
            }
        }
        None
    }

    /// Brings the registry in line with `apps`.
    ///
    /// Existing apps keep their tables and pick up the new configuration. New apps get a
    /// context and a running reconciler. Every app's pool bundle is then deployed, a failed
    /// deployment is logged and retried on the next pass without unregistering the app.
    /// Apps no longer present have their reconciler stopped and joined once the new map is
    /// in place, after which their namespace and rendered bundle are removed.
    pub async fn sync(
        &self,
        apps: &BTreeMap<String, AppConfig>,
        config: &BrokerConfig,
        cluster: &Cluster,
    ) {
        let mut reconcilers = self.reconcilers.lock().await;
        let current = self.snapshot().await;
        let mut next = HashMap::new();
        for (name, spec) in apps {
            if spec.deployment.selector.is_empty() {
                warn!(
                    "Skipping {} as it has no deployment selector",
                    cyan(name.as_str())
                );
                continue;
            }
            let ctx = match current.get(name) {
                Some(ctx) => {
                    if *ctx.spec().await != *spec {
                        info!("Updating the configuration of {}", cyan(name.as_str()));
                        ctx.set_spec(spec.clone()).await;
                    }
                    ctx.clone()
                }
                None => {
                    info!("Registering {}", cyan(name.as_str()));
                    Arc::new(AppContext::new(spec.clone(), AuthSettings::from(config)))
                }
            };
            let alive = reconcilers
                .get(name)
                .map_or(false, |handle| !handle.is_finished());
            if !alive {
                if let Some(dead) = reconcilers.remove(name) {
                    warn!("Restarting the pod reconciler of {}", cyan(name.as_str()));
                    dead.stop().await;
                }
                let handle = Reconciler::new(
                    ctx.clone(),
                    cluster.directory.clone(),
                    config.poll_interval,
                )
                .spawn();
                reconcilers.insert(name.clone(), handle);
            }
            if let Err(err) = self.deployer.deploy(spec, config, cluster).await {
                warn!(
                    "Failed to deploy the pool bundle of {}, {}",
                    cyan(name.as_str()),
                    error::chain(err.as_ref())
                );
            }
            next.insert(name.clone(), ctx);
        }
        let removed: Vec<String> = reconcilers
            .keys()
            .filter(|name| !next.contains_key(*name))
            .cloned()
            .collect();
        *self.apps.write().await = Arc::new(next);
        for name in removed {
            info!("Removing {}", cyan(name.as_str()));
            if let Some(handle) = reconcilers.remove(&name) {
                handle.stop().await;
            }
        }
        self.deployer.prune(apps, config, cluster).await;
    }

    /// Stops every reconciler and forgets every app.
    pub async fn shutdown(&self) {
        let mut reconcilers = self.reconcilers.lock().await;
        *self.apps.write().await = Arc::new(HashMap::new());
        for (_, handle) in reconcilers.drain() {
            handle.stop().await;
        }
    }
}

/// Reloads the registered apps manifest every scan period until cancelled.
///
/// A manifest that cannot be read or parsed leaves the registry as it is.
pub fn spawn_discovery(broker: Arc<Broker>, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match RegisteredApps::load(&broker.config.apps_manifest).await {
                Ok(manifest) => {
                    broker
                        .registry
                        .sync(&manifest.apps, &broker.config, &broker.cluster)
                        .await
                }
                Err(err) => warn!(
                    "Failed to load the registered apps, {}",
                    error::chain(err.as_ref())
                ),
            }
            let wait = tokio::time::sleep(broker.config.scan_period).fuse();
            let cancelled = token.cancelled().fuse();
            pin_mut!(wait, cancelled);
            let stop = select! {
                _ = wait => false,
                _ = cancelled => true,
            };
            if stop {
                break;
            }
        }
        debug!("Stopped app discovery");
    })
}
