use error::*;
use log::info;
use result::Result;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Every variable carrying this prefix is exposed to templates as a system parameter
/// (`POD_BROKER_PARAM_Domain=example.com` becomes `{{.SysParams.Domain}}`).
pub const SYS_PARAM_PREFIX: &str = "POD_BROKER_PARAM_";

pub const DEFAULT_PORT: u16 = 8082;
pub const DEFAULT_APPS_MANIFEST: &str = "/var/run/buildsrc/apps.json";
pub const DEFAULT_APP_BUNDLE_DIR: &str = "/var/run/buildsrc/apps";
pub const DEFAULT_USER_BUNDLE_DIR: &str = "/var/run/buildsrc/user";
pub const DEFAULT_APP_BUILD_DIR: &str = "/var/run/build";
pub const DEFAULT_BUILD_DIR: &str = "/var/run/buildusr";
pub const DEFAULT_SCAN_PERIOD_SECS: u64 = 5;
pub const DEFAULT_RESYNC_PERIOD_SECS: u64 = 60;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;

/// BrokerConfig is read exactly once at start up and is immutable thereafter.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub cookie_secret: String,
    pub auth_header: String,
    pub username_header: Option<String>,
    pub sys_params: BTreeMap<String, String>,
    pub port: u16,
    pub apps_manifest: PathBuf,
    /// Sources of each app's pool bundle, one directory per app.
    pub app_bundle_dir: PathBuf,
    pub user_bundle_dir: PathBuf,
    /// Rendered pool bundles. A directory here is what marks an app as deployed.
    pub app_build_dir: PathBuf,
    pub build_dir: PathBuf,
    pub scan_period: Duration,
    /// Unchanged pool bundles are applied again once this much time has passed.
    pub resync_period: Duration,
    pub poll_interval: Duration,
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Builds a configuration from any set of `(name, value)` pairs. Empty values are
    /// treated as though the variable was never set.
    pub fn from_vars<I: IntoIterator<Item = (String, String)>>(vars: I) -> Result<Self> {
        let vars: BTreeMap<String, String> = vars
            .into_iter()
            .filter(|(_, value)| !value.is_empty())
            .collect();
        let sys_params: BTreeMap<String, String> = vars
            .iter()
            .filter_map(|(name, value)| {
                name.strip_prefix(SYS_PARAM_PREFIX)
                    .filter(|param| !param.is_empty())
                    .map(|param| (param.to_string(), value.clone()))
            })
            .collect();
        let auth_header = sys_params
            .get("AuthHeader")
            .cloned()
            .ok_or_else(|| MissingVariable {
                name: format!("{}AuthHeader", SYS_PARAM_PREFIX),
            })?;
        let username_header = sys_params.get("UsernameHeader").cloned();
        let cookie_secret = match vars.get("COOKIE_SECRET") {
            Some(secret) => secret.clone(),
            None => {
                info!("no COOKIE_SECRET found, generating a random secret value");
                names::random_secret()
            }
        };
        let path = |name: &str, default: &str| {
            PathBuf::from(vars.get(name).map(String::as_str).unwrap_or(default))
        };
        Ok(Self {
            cookie_secret,
            auth_header,
            username_header,
            port: parse(&vars, "BROKER_PORT", DEFAULT_PORT)?,
            apps_manifest: path("BROKER_APPS_MANIFEST", DEFAULT_APPS_MANIFEST),
            app_bundle_dir: path("BROKER_APP_BUNDLE_DIR", DEFAULT_APP_BUNDLE_DIR),
            user_bundle_dir: path("BROKER_USER_BUNDLE_DIR", DEFAULT_USER_BUNDLE_DIR),
            app_build_dir: path("BROKER_APP_BUILD_DIR", DEFAULT_APP_BUILD_DIR),
            build_dir: path("BROKER_BUILD_DIR", DEFAULT_BUILD_DIR),
            scan_period: seconds(&vars, "BROKER_SCAN_PERIOD_SECS", DEFAULT_SCAN_PERIOD_SECS)?,
            resync_period: seconds(
                &vars,
                "BROKER_RESYNC_PERIOD_SECS",
                DEFAULT_RESYNC_PERIOD_SECS,
            )?,
            poll_interval: seconds(&vars, "BROKER_POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL_SECS)?,
            sys_params,
        })
    }
}

fn parse<T>(vars: &BTreeMap<String, String>, name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match vars.get(name) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|err: T::Err| {
            InvalidVariable {
                name: name.to_string(),
                value: value.clone(),
                reason: err.to_string(),
            }
            .into()
        }),
    }
}

fn seconds(vars: &BTreeMap<String, String>, name: &str, default: u64) -> Result<Duration> {
    match parse(vars, name, default)? {
        0 => Err(InvalidVariable {
            name: name.to_string(),
            value: "0".to_string(),
            reason: "must be at least one second".to_string(),
        }
        .into()),
        secs => Ok(Duration::from_secs(secs)),
    }
}

#[derive(Error, BrokerError, Debug)]
#[code(Status::InternalServerError)]
#[error("The required environment variable {name} is not set")]
pub struct MissingVariable {
    name: String,
}

#[derive(Error, BrokerError, Debug)]
#[code(Status::InternalServerError)]
#[error("The environment variable {name} has the invalid value '{value}': {reason}")]
pub struct InvalidVariable {
    name: String,
    value: String,
    reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults() {
        let config = BrokerConfig::from_vars(vars(&[(
            "POD_BROKER_PARAM_AuthHeader",
            "x-goog-authenticated-user-email",
        )]))
        .unwrap();
        assert_eq!(config.auth_header, "x-goog-authenticated-user-email");
        assert_eq!(config.username_header, None);
        assert_eq!(config.port, 8082);
        assert_eq!(config.apps_manifest, PathBuf::from("/var/run/buildsrc/apps.json"));
        assert_eq!(config.user_bundle_dir, PathBuf::from("/var/run/buildsrc/user"));
        assert_eq!(config.build_dir, PathBuf::from("/var/run/buildusr"));
        assert_eq!(config.app_bundle_dir, PathBuf::from("/var/run/buildsrc/apps"));
        assert_eq!(config.app_build_dir, PathBuf::from("/var/run/build"));
        assert_eq!(config.scan_period, Duration::from_secs(5));
        assert_eq!(config.resync_period, Duration::from_secs(60));
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.cookie_secret.len(), 40);
    }

    #[test]
    fn overrides() {
        let config = BrokerConfig::from_vars(vars(&[
            ("POD_BROKER_PARAM_AuthHeader", "x-auth"),
            ("POD_BROKER_PARAM_UsernameHeader", "x-username"),
            ("POD_BROKER_PARAM_Domain", "broker.example.com"),
            ("COOKIE_SECRET", "hunter2"),
            ("BROKER_PORT", "9000"),
            ("BROKER_BUILD_DIR", "/tmp/build"),
            ("BROKER_POLL_INTERVAL_SECS", "7"),
            ("UNRELATED", "value"),
        ]))
        .unwrap();
        assert_eq!(config.username_header.as_deref(), Some("x-username"));
        assert_eq!(config.cookie_secret, "hunter2");
        assert_eq!(config.port, 9000);
        assert_eq!(config.build_dir, PathBuf::from("/tmp/build"));
        assert_eq!(config.poll_interval, Duration::from_secs(7));
        assert_eq!(
            config.sys_params.get("Domain").map(String::as_str),
            Some("broker.example.com")
        );
        assert_eq!(config.sys_params.len(), 3);
    }

    #[test]
    fn auth_header_is_required() {
        let err = BrokerConfig::from_vars(vars(&[("POD_BROKER_PARAM_AuthHeader", "")])).unwrap_err();
        assert!(format!("{}", err).contains("POD_BROKER_PARAM_AuthHeader"));
    }

    #[test]
    fn bad_numbers() {
        let err = BrokerConfig::from_vars(vars(&[
            ("POD_BROKER_PARAM_AuthHeader", "x-auth"),
            ("BROKER_PORT", "eighty"),
        ]))
        .unwrap_err();
        assert!(format!("{}", err).contains("BROKER_PORT"));
        assert!(BrokerConfig::from_vars(vars(&[
            ("POD_BROKER_PARAM_AuthHeader", "x-auth"),
            ("BROKER_SCAN_PERIOD_SECS", "0"),
        ]))
        .is_err());
    }
}
