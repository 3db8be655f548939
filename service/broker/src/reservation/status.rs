use super::AppContext;
use error::*;
use k8s::{PodDirectory, PodRecord};
use result::Result;
use rocket::http::Status;
use std::fmt;

/// The state of the set of pods belonging to one user's instance of an app.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodSetStatus {
    Terminating,
    Shutdown,
    Waiting,
    Ready,
}

impl PodSetStatus {
    /// Any pod being deleted marks the whole set as terminating. Otherwise a single pod
    /// that is not yet ready (or cannot be scheduled) keeps the set waiting.
    pub fn resolve(pods: &[PodRecord]) -> Self {
        if pods.iter().any(|pod| pod.deleting) {
            return PodSetStatus::Terminating;
        }
        if pods.is_empty() {
            return PodSetStatus::Shutdown;
        }
        if pods
            .iter()
            .any(|pod| pod.ready != Some(true) || pod.unscheduled)
        {
            return PodSetStatus::Waiting;
        }
        PodSetStatus::Ready
    }

    pub fn code(&self) -> Status {
        match self {
            PodSetStatus::Waiting => Status::Created,
            _ => Status::Ok,
        }
    }
}

impl fmt::Display for PodSetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PodSetStatus::Terminating => "terminating",
            PodSetStatus::Shutdown => "shutdown",
            PodSetStatus::Waiting => "waiting",
            PodSetStatus::Ready => "ready",
        })
    }
}

/// Reads the pods labelled with the user's instance id straight from the cluster.
pub async fn lookup(
    ctx: &AppContext,
    directory: &dyn PodDirectory,
    user: &str,
) -> Result<PodSetStatus> {
    let pods = directory
        .list_pods(ctx.namespace(), &ctx.instance_selector(user))
        .await
        .map_err(|err| StatusUnavailable {
            app: ctx.name.clone(),
            cause: err.into(),
        })?;
    Ok(PodSetStatus::resolve(&pods))
}

#[derive(Error, BrokerError, Debug)]
#[code(Status::InternalServerError)]
#[error("error fetching status")]
pub struct StatusUnavailable {
    app: String,
    #[source]
    cause: StringError,
}
