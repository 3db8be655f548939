use crate::broker::Broker;
use crate::cookie;
use crate::reservation::classifier::{classify, Caller, Credentials};
use crate::reservation::status::{self, PodSetStatus};
use crate::reservation::{allocator, AppContext, PoolMember};
use error::*;
use response::Response;
use result::Result;
use rocket::http::Method;
use rocket::{Build, Rocket, State};
use std::path::PathBuf;
use std::sync::Arc;

/// Paths under which pods talk to the broker about themselves. `metadata` and `shutdown`
/// are older spellings of `session`.
const SIDE_CHANNEL: [&str; 3] = ["session", "metadata", "shutdown"];

pub fn rocket(config: rocket::Config, broker: Arc<Broker>) -> Rocket<Build> {
    rocket::custom(config)
        .manage(broker)
        .mount(
            "/",
            routes![healthz, get_app, post_app, delete_app, put_app, patch_app, options_app],
        )
        .register("/", catchers![envelope])
}

/// Anything Rocket answers on its own (unmatched paths, rejected segments) still gets the
/// JSON envelope.
#[catch(default)]
fn envelope(status: Status, _: &rocket::Request) -> Response {
    Response::new(status, status.reason().unwrap_or("Unknown Error"))
}

#[get("/healthz")]
fn healthz() -> Response {
    Response::new(Status::Ok, "OK")
}

/// Reports on a reservation. For end users this also issues the session cookie once
/// their pods are ready.
///
/// ```text
/// curl -H 'x-goog-authenticated-user-email: accounts.google.com:alice@example.com' \
///     http://broker/editor/?r=/editor/desktop
/// ```
#[get("/<app>/<_rest..>")]
async fn get_app(
    app: &str,
    _rest: PathBuf,
    broker: &State<Arc<Broker>>,
    credentials: Credentials,
) -> Result<Response> {
    dispatch(Method::Get, app, broker, &credentials).await
}

/// Leases a pod to the calling user.
#[post("/<app>/<_rest..>")]
async fn post_app(
    app: &str,
    _rest: PathBuf,
    broker: &State<Arc<Broker>>,
    credentials: Credentials,
) -> Result<Response> {
    dispatch(Method::Post, app, broker, &credentials).await
}

/// Ends a lease, either on behalf of the user or of the leased pod itself.
#[delete("/<app>/<_rest..>")]
async fn delete_app(
    app: &str,
    _rest: PathBuf,
    broker: &State<Arc<Broker>>,
    credentials: Credentials,
) -> Result<Response> {
    dispatch(Method::Delete, app, broker, &credentials).await
}

#[put("/<app>/<_rest..>")]
async fn put_app(
    app: &str,
    _rest: PathBuf,
    broker: &State<Arc<Broker>>,
    credentials: Credentials,
) -> Result<Response> {
    dispatch(Method::Put, app, broker, &credentials).await
}

#[patch("/<app>/<_rest..>")]
async fn patch_app(
    app: &str,
    _rest: PathBuf,
    broker: &State<Arc<Broker>>,
    credentials: Credentials,
) -> Result<Response> {
    dispatch(Method::Patch, app, broker, &credentials).await
}

#[options("/<app>/<_rest..>")]
async fn options_app(
    app: &str,
    _rest: PathBuf,
    broker: &State<Arc<Broker>>,
    credentials: Credentials,
) -> Result<Response> {
    dispatch(Method::Options, app, broker, &credentials).await
}

async fn dispatch(
    method: Method,
    app: &str,
    broker: &Broker,
    credentials: &Credentials,
) -> Result<Response> {
    if SIDE_CHANNEL.contains(&app) {
        return side_channel(method, broker, credentials).await;
    }
    let ctx = broker
        .registry
        .get(app)
        .await
        .ok_or_else(|| UnknownApp {
            app: app.to_string(),
        })?;
    match classify(&ctx, credentials).await? {
        Caller::PoolMember { pod } => match method {
            Method::Get => Ok(Response::new(Status::NoContent, "pod has not been reserved")),
            Method::Delete => allocator::remove_unreserved(&ctx, &broker.cluster, &pod).await,
            _ => Err(UnsupportedMethod::Unreserved(method).into()),
        },
        Caller::Workload { user, .. } => match method {
            Method::Get => {
                let status = status::lookup(&ctx, broker.cluster.directory.as_ref(), &user).await?;
                Ok(Response::new(status.code(), status.to_string()))
            }
            Method::Delete => allocator::release(&ctx, &broker.cluster, &broker.config, &user).await,
            _ => Err(UnsupportedMethod::Reserved(method).into()),
        },
        Caller::User {
            user,
            username,
            user_params,
        } => match method {
            Method::Post => {
                allocator::acquire(
                    &ctx,
                    &broker.cluster,
                    &broker.config,
                    &user,
                    &username,
                    user_params,
                )
                .await
            }
            Method::Delete => Ok(allocator::release(&ctx, &broker.cluster, &broker.config, &user)
                .await?
                .with_cookie(cookie::expire_cookie(&ctx.name))),
            _ => user_status(&ctx, broker, credentials, &user).await,
        },
    }
}

async fn user_status(
    ctx: &AppContext,
    broker: &Broker,
    credentials: &Credentials,
    user: &str,
) -> Result<Response> {
    let status = status::lookup(ctx, broker.cluster.directory.as_ref(), user).await?;
    let redirect = credentials.query_param("r");
    let code = match redirect {
        Some(_) => Status::TemporaryRedirect,
        None => status.code(),
    };
    let mut response = Response::new(code, status.to_string());
    if status == PodSetStatus::Ready {
        let value = cookie::make_cookie_value(user, &ctx.name, &ctx.auth.cookie_secret);
        response = response.with_cookie(cookie::set_cookie(&ctx.name, &value));
    }
    if let Some(target) = redirect {
        response = response.with_location(target);
    }
    Ok(response)
}

/// Pods identify themselves here by address alone, across every app.
async fn side_channel(method: Method, broker: &Broker, credentials: &Credentials) -> Result<Response> {
    let addresses = credentials.addresses();
    match method {
        Method::Get => match broker.registry.member_by_address(&addresses).await {
            Some((_, PoolMember::Reserved { user, reservation })) => {
                Ok(Response::json(Status::Ok, &reservation.metadata(&user))
                    .map_err(|source| MetadataUnavailable { source })?)
            }
            _ => Err(NotAPoolMember::Metadata(credentials.source_ip().to_string()).into()),
        },
        Method::Delete => match broker.registry.member_by_address(&addresses).await {
            Some((ctx, PoolMember::Available(pod))) => {
                allocator::remove_unreserved(&ctx, &broker.cluster, &pod).await
            }
            Some((ctx, PoolMember::Reserved { user, .. })) => {
                allocator::release(&ctx, &broker.cluster, &broker.config, &user).await
            }
            None => Err(NotAPoolMember::Managed(credentials.source_ip().to_string()).into()),
        },
        _ => Err(UnsupportedMethod::SideChannel.into()),
    }
}

#[derive(Error, BrokerError, Debug)]
#[code(Status::NotFound)]
#[error("app not found: {app}")]
pub struct UnknownApp {
    app: String,
}

#[derive(Error, BrokerError, Debug)]
pub enum UnsupportedMethod {
    #[error("unsupported request method from source pod without reservation: {0}")]
    #[code(Status::BadRequest)]
    Unreserved(Method),
    #[error("unsupported request method from source pod with reservation: {0}")]
    #[code(Status::BadRequest)]
    Reserved(Method),
    #[error("only GET and DELETE methods are supported")]
    #[code(Status::BadRequest)]
    SideChannel,
}

#[derive(Error, BrokerError, Debug)]
pub enum NotAPoolMember {
    #[error("reservation metadata not found for IP: {0}")]
    #[code(Status::NotFound)]
    Metadata(String),
    #[error("managed pod not found with IP: {0}")]
    #[code(Status::NotFound)]
    Managed(String),
}

#[derive(Error, BrokerError, Debug)]
#[code(Status::InternalServerError)]
#[error("internal server error")]
pub struct MetadataUnavailable {
    #[source]
    source: serde_json::Error,
}
