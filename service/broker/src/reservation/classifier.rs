use super::{AppContext, PodHandle, PoolMember, Reservation};
use crate::cookie;
use error::*;
use result::Result;
use rocket::request::{FromRequest, Outcome, Request};
use std::collections::{BTreeMap, HashMap};

/// Everything about a request that bears on who sent it.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub remote_ip: Option<String>,
    pub forwarded_for: Option<String>,
    /// Keyed by lowercase header name.
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    /// In the order given.
    pub query: Vec<(String, String)>,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for Credentials {
    type Error = std::convert::Infallible;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let mut headers = HashMap::new();
        for header in req.headers().iter() {
            headers
                .entry(header.name().as_str().to_lowercase())
                .or_insert_with(|| header.value().to_string());
        }
        let forwarded_for = headers
            .get("x-forwarded-for")
            .and_then(|value| value.split(',').next())
            .map(|ip| ip.trim().to_string())
            .filter(|ip| !ip.is_empty());
        Outcome::Success(Credentials {
            remote_ip: req.remote().map(|addr| addr.ip().to_string()),
            forwarded_for,
            headers,
            cookies: req
                .cookies()
                .iter()
                .map(|c| (c.name().to_string(), c.value().to_string()))
                .collect(),
            query: req
                .uri()
                .query()
                .map(|q| {
                    q.segments()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect()
                })
                .unwrap_or_default(),
        })
    }
}

impl Credentials {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_lowercase())
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    /// The first value given for `name`.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// The addresses the request may have come from, the direct peer first.
    pub fn addresses(&self) -> Vec<&str> {
        self.remote_ip
            .iter()
            .chain(self.forwarded_for.iter())
            .map(String::as_str)
            .collect()
    }

    /// For use in messages.
    pub fn source_ip(&self) -> &str {
        self.remote_ip.as_deref().unwrap_or("unknown")
    }

    /// A verified session cookie (which may also arrive as a query parameter of the same
    /// name) wins over the auth header.
    pub fn identity(&self, app: &str, secret: &str, auth_header: &str) -> Option<String> {
        let name = cookie::cookie_name(app);
        self.cookies
            .get(&name)
            .map(String::as_str)
            .or_else(|| self.query_param(&name))
            .filter(|value| !value.is_empty())
            .and_then(|value| cookie::verify_cookie_value(value, app, secret))
            .or_else(|| self.header(auth_header).map(String::from))
    }
}

/// Who is calling an app's route.
#[derive(Debug, Clone, PartialEq)]
pub enum Caller {
    User {
        user: String,
        username: String,
        user_params: BTreeMap<String, String>,
    },
    /// A leased pod asking about its own reservation.
    Workload {
        user: String,
        reservation: Reservation,
    },
    /// An unleased pod of the pool.
    PoolMember { pod: PodHandle },
}

/// Identity providers prefix the account, `accounts.google.com:alice@example.com` for
/// example. Only the account is kept.
pub fn normalize_user(identity: &str) -> &str {
    identity.rsplit(':').next().unwrap_or(identity)
}

/// Decides who is calling. A caller without an identity is recognised by its source
/// address, which is matched against the pool's available pods first.
pub async fn classify(ctx: &AppContext, credentials: &Credentials) -> Result<Caller> {
    let identity = credentials.identity(
        &ctx.name,
        &ctx.auth.cookie_secret,
        &ctx.auth.auth_header,
    );
    let identity = match identity {
        Some(identity) => identity,
        None => {
            let addresses = credentials.addresses();
            let member = ctx.table.read().await.member_by_address(&addresses);
            return match member {
                Some(PoolMember::Available(pod)) => Ok(Caller::PoolMember { pod }),
                Some(PoolMember::Reserved { user, reservation }) => {
                    Ok(Caller::Workload { user, reservation })
                }
                None => Err(Unauthenticated {
                    app: ctx.name.clone(),
                    ip: credentials.source_ip().to_string(),
                }
                .into()),
            };
        }
    };
    let user = normalize_user(&identity).to_string();
    let username = ctx
        .auth
        .username_header
        .as_deref()
        .and_then(|header| credentials.header(header))
        .map(String::from)
        .unwrap_or_else(|| user.clone());
    let spec = ctx.spec().await;
    let mut user_params = BTreeMap::new();
    for (key, value) in &credentials.query {
        if spec.is_user_writable(key) && !user_params.contains_key(key) {
            user_params.insert(key.clone(), value.clone());
        }
    }
    Ok(Caller::User {
        user,
        username,
        user_params,
    })
}

#[derive(Error, BrokerError, Debug)]
#[code(Status::Unauthorized)]
#[error("Failed to get user from cookie or auth header")]
pub struct Unauthenticated {
    app: String,
    ip: String,
}
