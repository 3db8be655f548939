use crate::client;
use crate::errors::ApiError;
use async_trait::async_trait;
use either::Either;
use kube::api::{DeleteParams, Patch, PatchParams};
use log::{debug, info};
use os::cmd;
use result::Result;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use term_colors::cyan;

/// A ClusterMutator performs every write the broker makes against the cluster.
///
/// Deletions never wait for the object to actually go away.
#[async_trait]
pub trait ClusterMutator: Send + Sync {
    /// Builds the kustomization rooted at `path` and applies the result.
    async fn apply_manifests(&self, path: &Path) -> Result<()>;
    /// Deletes a whole namespace. A namespace that is already gone counts as deleted.
    async fn delete_namespace(&self, namespace: &str) -> Result<()>;
    /// Sets a label on a pod, or removes it when `value` is `None`.
    async fn label(&self, namespace: &str, pod: &str, key: &str, value: Option<&str>) -> Result<()>;
    async fn annotate(
        &self,
        namespace: &str,
        pod: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()>;
    /// A pod that is already gone counts as deleted.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;
    /// Deletes every object of the given kinds matching `selector`, except those whose
    /// [DELETION_POLICY](crate::DELETION_POLICY) label is `retain_policy`.
    async fn delete_by_kinds(
        &self,
        namespace: &str,
        kinds: &[String],
        selector: &str,
        retain_policy: &str,
    ) -> Result<()>;
    async fn exec_in_pod(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> Result<()>;
    async fn copy_file_to_pod(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        local: &Path,
        remote: &str,
    ) -> Result<()>;
}

/// The production [ClusterMutator](crate::ClusterMutator).
///
/// Pod metadata and pod deletion go through the API server directly. Everything that needs a
/// rendered kustomization, or a shell inside a container, goes through `kustomize` and `kubectl`.
#[derive(Clone)]
pub struct KubeMutator {
    client: kube::Client,
}

impl KubeMutator {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    async fn patch(&self, namespace: &str, pod: &str, patch: Value) -> Result<()> {
        client::pods(&self.client, namespace)
            .patch(pod, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(ApiError::from)?;
        Ok(())
    }
}

#[async_trait]
impl ClusterMutator for KubeMutator {
    async fn apply_manifests(&self, path: &Path) -> Result<()> {
        let dir = path.display().to_string();
        let rendered = cmd!("kustomize", "build", &dir).await?;
        let out = cmd!(stdin = rendered, "kubectl", "apply", "-f", "-").await?;
        debug!("applied {}: {}", cyan(&dir), out);
        Ok(())
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<()> {
        let deleted = client::namespaces(&self.client)
            .delete(namespace, &DeleteParams::default())
            .await
            .map_err(ApiError::from);
        match deleted {
            Ok(_) => info!("deletion of the namespace {} started", cyan(namespace)),
            Err(err) if err.is_not_found() => {
                debug!("the namespace {} was already gone", cyan(namespace))
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    async fn label(&self, namespace: &str, pod: &str, key: &str, value: Option<&str>) -> Result<()> {
        self.patch(namespace, pod, label_patch(key, value)).await
    }

    async fn annotate(
        &self,
        namespace: &str,
        pod: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.patch(namespace, pod, annotation_patch(annotations))
            .await
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let deleted = client::pods(&self.client, namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(ApiError::from);
        match deleted {
            Ok(Either::Left(_)) => info!("deletion of {} started", cyan(name)),
            Ok(Either::Right(_)) => info!("{} deleted", cyan(name)),
            Err(err) if err.is_not_found() => debug!("{} was already gone", cyan(name)),
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    async fn delete_by_kinds(
        &self,
        namespace: &str,
        kinds: &[String],
        selector: &str,
        retain_policy: &str,
    ) -> Result<()> {
        if kinds.is_empty() {
            return Ok(());
        }
        let kinds = kinds.join(",");
        let selector = retaining_selector(selector, retain_policy);
        let out = cmd!(
            "kubectl",
            "delete",
            &kinds,
            "-n",
            namespace,
            "-l",
            &selector,
            "--wait=false"
        )
        .await?;
        debug!("deleted {} matching {}: {}", kinds, cyan(&selector), out);
        Ok(())
    }

    async fn exec_in_pod(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> Result<()> {
        let mut args = vec![
            "exec".to_string(),
            "-n".to_string(),
            namespace.to_string(),
            pod.to_string(),
            "-c".to_string(),
            container.to_string(),
            "--".to_string(),
        ];
        args.extend(command.iter().cloned());
        let debug_string = format!("kubectl {}", args.join(" "));
        let mut kubectl = tokio::process::Command::new("kubectl");
        kubectl.args(&args);
        os::process::exec(None::<&[u8]>, kubectl, debug_string).await?;
        Ok(())
    }

    async fn copy_file_to_pod(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        local: &Path,
        remote: &str,
    ) -> Result<()> {
        let local = local.display().to_string();
        let target = format!("{}/{}:{}", namespace, pod, remote);
        cmd!("kubectl", "cp", &local, &target, "-c", container).await?;
        Ok(())
    }
}

/// A JSON merge patch setting (or, with `None`, removing) a single label.
pub fn label_patch(key: &str, value: Option<&str>) -> Value {
    json!({
        "metadata": {
            "labels": {
                key: value,
            }
        }
    })
}

pub fn annotation_patch(annotations: &BTreeMap<String, String>) -> Value {
    json!({
        "metadata": {
            "annotations": annotations,
        }
    })
}

/// Narrows `selector` so that objects opting out of deletion are never matched.
pub fn retaining_selector(selector: &str, retain_policy: &str) -> String {
    format!(
        "{}, {} notin ({})",
        selector,
        crate::DELETION_POLICY,
        retain_policy
    )
}
