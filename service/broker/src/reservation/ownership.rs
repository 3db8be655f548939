use chrono::{DateTime, TimeZone, Utc};
use error::*;
use result::Result;
use std::collections::BTreeMap;

pub const USER: &str = "app.broker/user";
pub const SESSION_KEY: &str = "app.broker/session-key";
pub const SESSION_START: &str = "app.broker/session-start";
pub const OBJECT_KINDS: &str = "app.broker/last-applied-object-types";
pub const USER_PARAMS: &str = "app.broker/user-params";

/// The ownership record written onto a reserved pod's annotations.
///
/// It is what allows a restarted broker to rebuild its reservations from the cluster
/// alone, so everything a reservation needs to be released must be in here.
#[derive(Debug, Clone, PartialEq)]
pub struct Ownership {
    pub user: String,
    pub session_key: String,
    pub session_start: Option<DateTime<Utc>>,
    pub object_kinds: Vec<String>,
    pub user_params: BTreeMap<String, String>,
}

impl Ownership {
    pub fn encode(&self) -> Result<BTreeMap<String, String>> {
        let params = serde_json::to_string(&self.user_params)
            .map_err(|source| MalformedOwnership::Params { source })?;
        let mut annotations = BTreeMap::new();
        annotations.insert(USER.to_string(), self.user.clone());
        annotations.insert(SESSION_KEY.to_string(), self.session_key.clone());
        annotations.insert(OBJECT_KINDS.to_string(), self.object_kinds.join(","));
        annotations.insert(USER_PARAMS.to_string(), params);
        if let Some(start) = self.session_start {
            annotations.insert(SESSION_START.to_string(), start.timestamp().to_string());
        }
        Ok(annotations)
    }

    /// Reads an ownership record back. A pod lacking the user or the session key was
    /// never fully claimed and yields an error.
    pub fn decode(annotations: &BTreeMap<String, String>) -> Result<Self> {
        let required = |key: &'static str| {
            annotations
                .get(key)
                .filter(|value| !value.is_empty())
                .cloned()
                .ok_or(MalformedOwnership::Missing { key })
        };
        let user = required(USER)?;
        let session_key = required(SESSION_KEY)?;
        let object_kinds = annotations
            .get(OBJECT_KINDS)
            .map(|kinds| {
                kinds
                    .split(',')
                    .map(str::trim)
                    .filter(|kind| !kind.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        let user_params = match annotations.get(USER_PARAMS).filter(|p| !p.is_empty()) {
            Some(params) => serde_json::from_str(params)
                .map_err(|source| MalformedOwnership::Params { source })?,
            None => BTreeMap::new(),
        };
        let session_start = match annotations.get(SESSION_START).filter(|s| !s.is_empty()) {
            Some(start) => {
                let malformed = || MalformedOwnership::SessionStart {
                    value: start.clone(),
                };
                let seconds: i64 = start.parse().map_err(|_| malformed())?;
                Some(Utc.timestamp_opt(seconds, 0).single().ok_or_else(malformed)?)
            }
            None => None,
        };
        Ok(Self {
            user,
            session_key,
            session_start,
            object_kinds,
            user_params,
        })
    }
}

#[derive(Error, BrokerError, Debug)]
pub enum MalformedOwnership {
    #[error("the pod is missing the {key} annotation")]
    #[code(Status::InternalServerError)]
    Missing { key: &'static str },
    #[error("the user parameters annotation is not a JSON object of strings")]
    #[code(Status::InternalServerError)]
    Params {
        #[source]
        source: serde_json::Error,
    },
    #[error("the session start annotation '{value}' is not a valid unix timestamp")]
    #[code(Status::InternalServerError)]
    SessionStart { value: String },
}
