use error::*;
use result::Result;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::path::Path;

/// The registered apps manifest as written by the app publisher.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RegisteredApps {
    #[serde(default, deserialize_with = "nullable")]
    pub apps: BTreeMap<String, AppConfig>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AppType {
    Deployment,
    Statefulset,
    #[serde(other)]
    Other,
}

impl Default for AppType {
    fn default() -> Self {
        AppType::Other
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(rename = "type", default)]
    pub app_type: AppType,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "nullable")]
    pub deployment: DeploymentSpec,
    #[serde(default, deserialize_with = "nullable")]
    pub user_params: Vec<AppParam>,
    #[serde(default, deserialize_with = "nullable")]
    pub user_writable_params: Vec<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub app_params: Vec<AppParam>,
    #[serde(default, deserialize_with = "nullable")]
    pub shutdown_hooks: Vec<ShutdownHook>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct DeploymentSpec {
    #[serde(default)]
    pub selector: String,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct AppParam {
    pub name: String,
    #[serde(default)]
    pub default: String,
}

/// A script run inside one of the reserved pod's containers just before the pod is deleted.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ShutdownHook {
    pub container: String,
    pub command: String,
}

impl AppConfig {
    /// Apps live in a namespace of the same name.
    pub fn namespace(&self) -> &str {
        &self.name
    }

    pub fn app_param_defaults(&self) -> BTreeMap<String, String> {
        self.app_params
            .iter()
            .map(|p| (p.name.clone(), p.default.clone()))
            .collect()
    }

    /// A user may only set a parameter that is both declared and marked writable.
    pub fn is_user_writable(&self, param: &str) -> bool {
        self.user_params.iter().any(|p| p.name == param)
            && self.user_writable_params.iter().any(|p| p == param)
    }
}

impl RegisteredApps {
    /// Parses a manifest, keeping only deployment apps. Apps are always keyed (and named)
    /// by their `name`, falling back to the manifest key when it is absent.
    pub fn from_json(data: &str) -> std::result::Result<Self, serde_json::Error> {
        let manifest: RegisteredApps = serde_json::from_str(data)?;
        let apps = manifest
            .apps
            .into_iter()
            .filter(|(_, app)| app.app_type == AppType::Deployment)
            .map(|(key, mut app)| {
                if app.name.is_empty() {
                    app.name = key;
                }
                (app.name.clone(), app)
            })
            .collect();
        Ok(Self { apps })
    }

    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ManifestUnreadable {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self::from_json(&data).map_err(|source| ManifestMalformed {
            path: path.display().to_string(),
            source,
        })?)
    }
}

/// The manifest is produced by a Go program, which renders empty collections as `null`.
fn nullable<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Error, BrokerError, Debug)]
#[code(Status::InternalServerError)]
#[error("Failed to read the registered apps manifest at {path}")]
pub struct ManifestUnreadable {
    path: String,
    #[source]
    source: std::io::Error,
}

#[derive(Error, BrokerError, Debug)]
#[code(Status::InternalServerError)]
#[error("The registered apps manifest at {path} is not valid")]
pub struct ManifestMalformed {
    path: String,
    #[source]
    source: serde_json::Error,
}
