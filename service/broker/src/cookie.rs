//! Session cookies let a browser prove who it is on later requests without the broker
//! keeping any server side session store.

use rocket::http::Cookie;
use rocket::time::Duration;

/// Five days.
pub const MAX_AGE_SECS: i64 = 432_000;

pub fn cookie_name(app: &str) -> String {
    format!("broker_{}", app)
}

/// `user#<hex sha256("user.app.secret")>`
///
/// The value is matched by regex in the ingress routing rules, so it MUST remain free of
/// characters beyond the user's identity, a `#` and hex digits.
pub fn make_cookie_value(user: &str, app: &str, secret: &str) -> String {
    format!(
        "{}#{}",
        user,
        names::hex_digest(format!("{}.{}.{}", user, app, secret))
    )
}

/// Returns the user a cookie value was issued to, provided its digest checks out.
pub fn verify_cookie_value(value: &str, app: &str, secret: &str) -> Option<String> {
    let mut tokens = value.split('#');
    match (tokens.next(), tokens.next(), tokens.next()) {
        (Some(user), Some(_), None) if !user.is_empty() => {
            if make_cookie_value(user, app, secret) == value {
                Some(user.to_string())
            } else {
                None
            }
        }
        _ => None,
    }
}

/// The session cookie, scoped to the app's path.
pub fn set_cookie(app: &str, value: &str) -> Cookie<'static> {
    Cookie::build((cookie_name(app), value.to_string()))
        .path(format!("/{}/", app))
        .max_age(Duration::seconds(MAX_AGE_SECS))
        .build()
}

/// Instructs the browser to drop the session cookie.
pub fn expire_cookie(app: &str) -> Cookie<'static> {
    Cookie::build((cookie_name(app), String::new()))
        .path(format!("/{}/", app))
        .max_age(Duration::ZERO)
        .build()
}
