//! An in-memory cluster for tests. It answers label selectors the way the API server does
//! and records every mutation made against it.

use crate::apps::{AppConfig, AppParam, DeploymentSpec, ShutdownHook};
use crate::broker::Cluster;
use crate::builder::{Builder, TemplateData};
use crate::config::BrokerConfig;
use crate::reservation::{AppContext, AuthSettings, POOL_MANAGER};
use async_trait::async_trait;
use error::*;
use k8s::{ClusterMutator, PodDirectory, PodRecord};
use result::Result;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const SECRET: &str = "0123456789abcdef";
pub const AUTH_HEADER: &str = "x-goog-authenticated-user-email";

#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    pods: BTreeMap<(String, String), PodRecord>,
    calls: Vec<String>,
    failing: HashSet<String>,
    kinds: Vec<String>,
    checksum: String,
}

impl FakeCluster {
    pub fn add_pod(&self, namespace: &str, pod: PodRecord) {
        self.state
            .lock()
            .unwrap()
            .pods
            .insert((namespace.to_string(), pod.name.clone()), pod);
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<PodRecord> {
        self.state
            .lock()
            .unwrap()
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Makes every subsequent call of `op` fail.
    pub fn fail_on(&self, op: &str) {
        self.state.lock().unwrap().failing.insert(op.to_string());
    }

    pub fn heal(&self, op: &str) {
        self.state.lock().unwrap().failing.remove(op);
    }

    /// The kinds the overlay builder reports.
    pub fn set_kinds(&self, kinds: &[&str]) {
        self.state.lock().unwrap().kinds = kinds.iter().map(|k| k.to_string()).collect();
    }

    /// The checksum the builder reports for any rendered bundle.
    pub fn set_checksum(&self, checksum: &str) {
        self.state.lock().unwrap().checksum = checksum.to_string();
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_to(&self, op: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.split(' ').next() == Some(op))
            .collect()
    }

    fn record(&self, op: &str, call: String) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("{} {}", op, call).trim_end().to_string());
        if state.failing.contains(op) {
            return Err(FakeFailure {
                op: op.to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn with_pod<F: FnOnce(&mut PodRecord)>(&self, namespace: &str, name: &str, f: F) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state
            .pods
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            Some(pod) => {
                f(pod);
                Ok(())
            }
            None => Err(FakeFailure {
                op: format!("no pod {}/{}", namespace, name),
            }
            .into()),
        }
    }
}

#[async_trait]
impl PodDirectory for FakeCluster {
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<PodRecord>> {
        self.record("list_pods", format!("{} {}", namespace, selector))?;
        let state = self.state.lock().unwrap();
        Ok(state
            .pods
            .iter()
            .filter(|((ns, _), pod)| ns == namespace && matches(selector, &pod.labels))
            .map(|(_, pod)| pod.clone())
            .collect())
    }
}

#[async_trait]
impl ClusterMutator for FakeCluster {
    async fn apply_manifests(&self, path: &Path) -> Result<()> {
        self.record("apply", path.display().to_string())
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<()> {
        self.record("delete_namespace", namespace.to_string())
    }

    async fn label(&self, namespace: &str, pod: &str, key: &str, value: Option<&str>) -> Result<()> {
        match value {
            Some(value) => self.record("label", format!("{}/{} {}={}", namespace, pod, key, value))?,
            None => self.record("unlabel", format!("{}/{} {}", namespace, pod, key))?,
        }
        self.with_pod(namespace, pod, |pod| match value {
            Some(value) => {
                pod.labels.insert(key.to_string(), value.to_string());
            }
            None => {
                pod.labels.remove(key);
            }
        })
    }

    async fn annotate(
        &self,
        namespace: &str,
        pod: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.record("annotate", format!("{}/{}", namespace, pod))?;
        self.with_pod(namespace, pod, |pod| {
            pod.annotations
                .extend(annotations.iter().map(|(k, v)| (k.clone(), v.clone())))
        })
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.record("delete_pod", format!("{}/{}", namespace, name))?;
        self.state
            .lock()
            .unwrap()
            .pods
            .remove(&(namespace.to_string(), name.to_string()));
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
        self.record(
            "delete_by_kinds",
            format!(
                "{} {} {}",
                namespace,
                kinds.join(","),
                k8s::mutator::retaining_selector(selector, retain_policy)
            ),
        )
    }

    async fn exec_in_pod(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> Result<()> {
        self.record(
            "exec",
            format!("{}/{} {} {}", namespace, pod, container, command.join(" ")),
        )
    }

    async fn copy_file_to_pod(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        local: &Path,
        remote: &str,
    ) -> Result<()> {
        let contents = std::fs::read_to_string(local).unwrap_or_default();
        self.record(
            "copy",
            format!("{}/{} {} {} {}", namespace, pod, container, remote, contents),
        )
    }
}

#[async_trait]
impl Builder for FakeCluster {
    async fn build_overlay(&self, source: &Path, dest: &Path, data: &TemplateData) -> Result<()> {
        self.record(
            "build",
            format!(
                "{} {} {}",
                source.display(),
                dest.display(),
                data.app_params.get("sessionKey").cloned().unwrap_or_default()
            ),
        )
    }

    async fn discover_object_kinds(&self, dest: &Path) -> Result<Vec<String>> {
        self.record("kinds", dest.display().to_string())?;
        Ok(self.state.lock().unwrap().kinds.clone())
    }

    async fn checksum(&self, dir: &Path) -> Result<String> {
        self.record("checksum", dir.display().to_string())?;
        Ok(self.state.lock().unwrap().checksum.clone())
    }
}

/// Evaluates an equality or set based label selector.
pub fn matches(selector: &str, labels: &BTreeMap<String, String>) -> bool {
    requirements(selector).iter().all(|requirement| {
        let requirement = requirement.trim();
        if requirement.is_empty() {
            return true;
        }
        if let Some((key, values)) = split_set(requirement, " notin ") {
            return labels.get(key).map_or(true, |v| !values.contains(&v.as_str()));
        }
        if let Some((key, values)) = split_set(requirement, " in ") {
            return labels.get(key).map_or(false, |v| values.contains(&v.as_str()));
        }
        if let Some((key, value)) = requirement.split_once("!=") {
            return labels.get(key.trim()).map(String::as_str) != Some(value.trim());
        }
        if let Some((key, value)) = requirement
            .split_once("==")
            .or_else(|| requirement.split_once('='))
        {
            return labels.get(key.trim()).map(String::as_str) == Some(value.trim());
        }
        match requirement.strip_prefix('!') {
            Some(key) => !labels.contains_key(key.trim()),
            None => labels.contains_key(requirement),
        }
    })
}

/// Commas inside a value set do not separate requirements.
fn requirements(selector: &str) -> Vec<&str> {
    let mut out = vec![];
    let mut depth = 0;
    let mut start = 0;
    for (i, c) in selector.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                out.push(&selector[start..i]);
                start = i + 1;
            }
            _ => (),
        }
    }
    out.push(&selector[start..]);
    out
}

fn split_set<'a>(requirement: &'a str, operator: &str) -> Option<(&'a str, Vec<&'a str>)> {
    let (key, values) = requirement.split_once(operator)?;
    let values = values
        .trim()
        .strip_prefix('(')?
        .strip_suffix(')')?
        .split(',')
        .map(str::trim)
        .collect();
    Some((key.trim(), values))
}

#[derive(Error, BrokerError, Debug)]
#[code(Status::InternalServerError)]
#[error("injected failure: {op}")]
pub struct FakeFailure {
    op: String,
}

pub fn cluster() -> (Arc<FakeCluster>, Cluster) {
    let fake = Arc::new(FakeCluster::default());
    let cluster = Cluster {
        directory: fake.clone(),
        mutator: fake.clone(),
        builder: fake.clone(),
    };
    (fake, cluster)
}

/// A pool member labelled the way the `editor` deployment labels its pods.
pub fn pool_pod(name: &str, ip: &str) -> PodRecord {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), "editor".to_string());
    labels.insert(k8s::MANAGED_BY.to_string(), POOL_MANAGER.to_string());
    PodRecord {
        name: name.to_string(),
        ip: Some(ip.to_string()),
        labels,
        ..Default::default()
    }
}

pub fn editor() -> AppConfig {
    AppConfig {
        app_type: crate::apps::AppType::Deployment,
        name: "editor".to_string(),
        deployment: DeploymentSpec {
            selector: "app=editor".to_string(),
        },
        user_params: vec![
            AppParam {
                name: "theme".to_string(),
                default: "light".to_string(),
            },
            AppParam {
                name: "region".to_string(),
                default: "us".to_string(),
            },
        ],
        user_writable_params: vec!["theme".to_string()],
        app_params: vec![AppParam {
            name: "idleTimeout".to_string(),
            default: "3600".to_string(),
        }],
        shutdown_hooks: vec![ShutdownHook {
            container: "desktop".to_string(),
            command: "pkill -TERM editor".to_string(),
        }],
    }
}

pub fn auth() -> AuthSettings {
    AuthSettings {
        cookie_secret: SECRET.to_string(),
        auth_header: AUTH_HEADER.to_string(),
        username_header: Some("x-broker-user".to_string()),
    }
}

pub fn context(spec: AppConfig) -> Arc<AppContext> {
    Arc::new(AppContext::new(spec, auth()))
}

pub fn config() -> BrokerConfig {
    let root = std::env::temp_dir().join(format!("broker-test-{}", names::random_secret()));
    BrokerConfig {
        cookie_secret: SECRET.to_string(),
        auth_header: AUTH_HEADER.to_string(),
        username_header: Some("x-broker-user".to_string()),
        sys_params: BTreeMap::new(),
        port: 0,
        apps_manifest: root.join("apps.json"),
        app_bundle_dir: root.join("apps"),
        user_bundle_dir: root.join("user"),
        app_build_dir: root.join("build"),
        build_dir: root.join("buildusr"),
        scan_period: Duration::from_millis(10),
        resync_period: Duration::from_secs(60),
        poll_interval: Duration::from_millis(10),
    }
}

#[test]
fn selectors() {
    let labels = pool_pod("p", "10.0.0.1").labels;
    assert!(matches("app=editor,app.kubernetes.io/managed-by=pod-broker", &labels));
    assert!(!matches("app=editor, app.kubernetes.io/managed-by notin (pod-broker)", &labels));
    assert!(matches("app in (editor, viewer), app.kubernetes.io/instance notin (x)", &labels));
    assert!(matches("app==editor,!app.kubernetes.io/instance", &labels));
    assert!(!matches("app!=editor", &labels));
    assert!(!matches("app.kubernetes.io/instance=editor-x", &labels));
}
