//! Keeps each registered app's pool bundle (the deployment that produces the pre-warmed pods)
//! applied to the cluster.

use crate::apps::AppConfig;
use crate::broker::Cluster;
use crate::builder::TemplateData;
use crate::config::BrokerConfig;
use chrono::Utc;
use result::Result;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use term_colors::cyan;
use tokio::sync::Mutex;

struct Applied {
    checksum: String,
    at: Instant,
}

/// The Deployer renders every app's pool bundle on each discovery pass, but only applies it
/// when the rendered output changed or the resync period has passed since the last apply.
#[derive(Default)]
pub struct Deployer {
    applied: Mutex<HashMap<String, Applied>>,
}

impl Deployer {
    /// Returns whether the bundle was applied on this call.
    pub async fn deploy(
        &self,
        spec: &AppConfig,
        config: &BrokerConfig,
        cluster: &Cluster,
    ) -> Result<bool> {
        let dest = config.app_build_dir.join(&spec.name);
        cluster
            .builder
            .build_overlay(
                &config.app_bundle_dir.join(&spec.name),
                &dest,
                &bundle_data(spec, config),
            )
            .await?;
        let checksum = cluster.builder.checksum(&dest).await?;
        let mut applied = self.applied.lock().await;
        match applied.get(&spec.name) {
            Some(last) if last.checksum == checksum && last.at.elapsed() < config.resync_period => {
                return Ok(false)
            }
            Some(last) if last.checksum == checksum => {
                debug!("Resyncing the pool bundle of {}", cyan(&spec.name))
            }
            _ => info!(
                "The pool bundle of {} has the checksum {}",
                cyan(&spec.name),
                checksum
            ),
        }
        cluster.mutator.apply_manifests(&dest).await?;
        info!("Deployed the pool bundle of {}", cyan(&spec.name));
        // Only recorded once applied, a failed apply is retried on the next pass.
        applied.insert(
            spec.name.clone(),
            Applied {
                checksum,
                at: Instant::now(),
            },
        );
        Ok(true)
    }

    /// Tears down every deployed app that is no longer registered: its namespace goes, as
    /// does its rendered bundle.
    ///
    /// Deployed apps are found by their rendered bundle directories rather than from memory,
    /// so apps removed while the broker was down are cleaned up as well.
    pub async fn prune(
        &self,
        apps: &BTreeMap<String, AppConfig>,
        config: &BrokerConfig,
        cluster: &Cluster,
    ) {
        let mut entries = match tokio::fs::read_dir(&config.app_build_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
            Err(err) => {
                warn!(
                    "Failed to list the deployed apps in {}, {}",
                    config.app_build_dir.display(),
                    err
                );
                return;
            }
        };
        let mut stale = vec![];
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let name = entry.file_name().to_string_lossy().to_string();
                    let is_dir = entry
                        .file_type()
                        .await
                        .map(|t| t.is_dir())
                        .unwrap_or(false);
                    if is_dir && !apps.contains_key(&name) {
                        stale.push((name, entry.path()));
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(
                        "Failed to list the deployed apps in {}, {}",
                        config.app_build_dir.display(),
                        err
                    );
                    return;
                }
            }
        }
        for (name, dir) in stale {
            info!("Removing the deployment of {}", cyan(&name));
            self.applied.lock().await.remove(&name);
            if let Err(err) = cluster.mutator.delete_namespace(&name).await {
                warn!(
                    "Failed to delete the namespace {}, {}",
                    cyan(&name),
                    error::chain(err.as_ref())
                );
            }
            if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
                warn!("Failed to remove {}, {}", dir.display(), err);
            }
        }
    }
}

/// Pool bundles are rendered as though the app were its own user.
fn bundle_data(spec: &AppConfig, config: &BrokerConfig) -> TemplateData {
    TemplateData {
        app: spec.name.clone(),
        namespace: spec.namespace().to_string(),
        user: spec.name.clone(),
        username: spec.name.clone(),
        id: names::pod_id(&spec.name),
        full_name: names::instance_id(&spec.name, &spec.name),
        timestamp: Utc::now().timestamp().to_string(),
        app_params: spec.app_param_defaults(),
        sys_params: config.sys_params.clone(),
        ..Default::default()
    }
}
