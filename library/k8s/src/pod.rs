use chrono::{DateTime, Utc};
use error::*;
use k8s_openapi::api::core::v1::Pod;
use result::Result;
use std::collections::BTreeMap;

/// PodExt is an extension trait used to answer common questions about pods.
pub trait PodExt {
    fn ip(&self) -> Result<String>;
    fn created(&self) -> Option<DateTime<Utc>>;
    fn terminating(&self) -> bool;
    /// The status of the named condition, `None` if the pod does not report it at all.
    fn condition(&self, kind: &str) -> Option<bool>;
    fn ready(&self) -> Option<bool>;
    fn unscheduled(&self) -> bool;
}

impl PodExt for Pod {
    fn ip(&self) -> Result<String> {
        Ok(self
            .status
            .as_ref()
            .ok_or_else(|| PodHasNoStatus {
                name: self.metadata.name.clone().unwrap_or_default(),
            })?
            .pod_ip
            .as_ref()
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| PodHasNoIp {
                name: self.metadata.name.clone().unwrap_or_default(),
            })?
            .clone())
    }

    fn created(&self) -> Option<DateTime<Utc>> {
        self.metadata.creation_timestamp.as_ref().map(|t| t.0)
    }

    fn terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    fn condition(&self, kind: &str) -> Option<bool> {
        self.status
            .as_ref()?
            .conditions
            .as_ref()?
            .iter()
            .find(|condition| condition.type_ == kind)
            .map(|condition| condition.status == "True")
    }

    fn ready(&self) -> Option<bool> {
        self.condition("Ready")
    }

    fn unscheduled(&self) -> bool {
        self.condition("PodScheduled") == Some(false)
    }
}

/// PodRecord is the flattened view of a pod that the rest of the broker works with.
///
/// It holds only what pool bookkeeping and status resolution need, which keeps those
/// components testable without fabricating full [Pod](k8s_openapi::api::core::v1::Pod) objects.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodRecord {
    pub name: String,
    pub ip: Option<String>,
    pub created: Option<DateTime<Utc>>,
    pub deleting: bool,
    pub ready: Option<bool>,
    pub unscheduled: bool,
    pub annotations: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

impl From<&Pod> for PodRecord {
    fn from(pod: &Pod) -> Self {
        Self {
            name: pod.metadata.name.clone().unwrap_or_default(),
            ip: pod.ip().ok(),
            created: pod.created(),
            deleting: pod.terminating(),
            ready: pod.ready(),
            unscheduled: pod.unscheduled(),
            annotations: pod.metadata.annotations.clone().unwrap_or_default(),
            labels: pod.metadata.labels.clone().unwrap_or_default(),
        }
    }
}

#[derive(Error, BrokerError, Debug)]
#[code(Status::InternalServerError)]
#[error(
    "An attempt was made to retrieve the status field of the pod '{name}', however the \
object had no status field. This was likely a premature call to a pod object that had not yet \
been provisioned in Kubernetes."
)]
struct PodHasNoStatus {
    name: String,
}

#[derive(Error, BrokerError, Debug)]
#[code(Status::InternalServerError)]
#[error(
    "An attempt was made to retrieve the IP of the pod '{name}', however the object had no IP. \
This was likely a premature call to a pod object that had not yet been scheduled."
)]
struct PodHasNoIp {
    name: String,
}
