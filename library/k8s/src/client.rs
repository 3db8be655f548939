use crate::errors::ApiError;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::Api;
use result::Result;

/// Returns a new Kubernetes client inferred from the environment (in-cluster service account
/// first, then the local kubeconfig).
///
/// Unlike most of the broker, a failure here is fatal at start up, so callers in `main` are
/// expected to simply propagate it.
pub async fn try_default() -> Result<kube::Client> {
    Ok(kube::Client::try_default().await.map_err(ApiError::from)?)
}

/// Scopes the shared client to a single namespace's pods.
///
/// [kube::Client](kube::Client) is a cheap handle, so every call site gets its own [Api](kube::Api).
pub fn pods<N: AsRef<str>>(client: &kube::Client, namespace: N) -> Api<Pod> {
    Api::namespaced(client.clone(), namespace.as_ref())
}

pub fn namespaces(client: &kube::Client) -> Api<Namespace> {
    Api::all(client.clone())
}
