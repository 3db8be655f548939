use crate::client;
use crate::errors::ApiError;
use crate::pod::PodRecord;
use async_trait::async_trait;
use kube::api::ListParams;
use result::Result;

/// A PodDirectory answers "which pods currently match this label selector".
///
/// Failures are reported as-is and are expected to be retried by the caller.
#[async_trait]
pub trait PodDirectory: Send + Sync {
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<PodRecord>>;
}

/// The production [PodDirectory](crate::PodDirectory), backed by the Kubernetes API server.
///
/// ```ignore
/// tokio_test::block_on(async {
///     let pods = KubePodDirectory::new(client::try_default().await.unwrap())
///         .list_pods("editor", "app=editor,app.kubernetes.io/managed-by=pod-broker")
///         .await
///         .unwrap();
///     assert!(pods.iter().all(|pod| !pod.name.is_empty()));
/// })
/// ```
#[derive(Clone)]
pub struct KubePodDirectory {
    client: kube::Client,
}

impl KubePodDirectory {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodDirectory for KubePodDirectory {
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<PodRecord>> {
        let pods = client::pods(&self.client, namespace)
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(ApiError::from)?;
        Ok(pods.items.iter().map(PodRecord::from).collect())
    }
}
