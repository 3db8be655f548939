pub use error_derive::BrokerError;
pub use rocket::http::Status;
pub use thiserror;
pub use thiserror::Error;

use log::error;
use rocket::request::Request;
use rocket::response::Responder;
use serde_json::{json, to_string_pretty};
use std::fmt::Write;

/// A type that implements HttpCode is able to tell the HTTP framework which status
/// should be set should an instance of the type be returned to the caller.
///
/// It is almost never implemented by hand. The [BrokerError](error_derive::BrokerError)
/// derive macro implements it from the `#[code(..)]` attribute.
pub trait HttpCode {
    fn http_code(&self) -> Status;
}

/// A BrokerError is the trait to which every error returned by any broker component
/// MUST adhere.
///
/// The easiest way to implement this error type is to derive [Error](thiserror::Error),
/// [BrokerError](error_derive::BrokerError) and [Debug](std::fmt::Debug) together.
///
/// ```
/// use error::*;
///
/// #[derive(Error, BrokerError, Debug)]
/// #[error("This is the string that will show up in the 'status' key of the resulting JSON.")]
/// #[code(Status::BadRequest)]
/// struct MyError {
///     // Causes are logged for server errors, they are never sent to the caller.
///     #[source]
///     cause: std::io::Error,
/// }
/// ```
///
/// The [Display](std::fmt::Display) of an error is what the caller sees. Errors that map to a
/// 5xx status MUST therefore keep their display text generic and put the details into
/// their fields and their [source](std::error::Error::source).
pub trait BrokerError: std::error::Error + HttpCode + Send + Sync {}

/// This conversion supports the automatic boxing of any type that
/// implements [BrokerError](crate::BrokerError).
impl<T: 'static + BrokerError> From<T> for Box<dyn BrokerError> {
    fn from(err: T) -> Self {
        Box::new(err)
    }
}

/// Renders the error followed by its entire chain of causes, one after another.
///
/// This is what ends up in the logs, never in a response body.
pub fn chain<E: std::error::Error + ?Sized>(err: &E) -> String {
    let mut out = format!("{}", err);
    let mut cause = err.source();
    while let Some(c) = cause {
        let _ = write!(out, ", caused by: {}", c);
        cause = c.source();
    }
    out
}

/// The [Responder](rocket::response::Responder) implementation for a [BrokerError](crate::BrokerError)
/// does four things:
///
/// 1. Logs the full error (including its causes) should the status be a server error.
/// 2. Sets the content type to JSON.
/// 3. Sets the HTTP status to the status declared in the error's `#[code(..)]` annotation.
/// 4. Serializes the status envelope and sends the resulting bytes over the wire.
///
/// ```ignore
/// {
///     "code": 404,
///     "status": "No available instances at this time"
/// }
/// ```
impl<'r, 'o: 'r> Responder<'r, 'o> for Box<dyn BrokerError> {
    fn respond_to(self, request: &'r Request<'_>) -> rocket::response::Result<'o> {
        let status = self.http_code();
        if status.code >= 500 {
            error!(
                "{} {} failed: {:?}: {}",
                request.method(),
                request.uri(),
                self,
                chain(self.as_ref())
            );
        }
        let json = json!({
            "code": status.code,
            "status": format!("{}", self),
        });
        let json = to_string_pretty(&json).map_err(|_| Status::InternalServerError)?;
        rocket::Response::build()
            .header(rocket::http::ContentType::JSON)
            .status(status)
            .sized_body(json.len(), std::io::Cursor::new(json))
            .ok()
    }
}

/// A `StringError` is a convenient way to convert a raw String type into a first class
/// BrokerError. This is especially useful when you would like to embed a raw string as
/// [source](std::error::Error::source) for a higher BrokerError.
///
/// ```
/// use error::*;
///
/// #[derive(Error, BrokerError, Debug)]
/// #[code(Status::InternalServerError)]
/// #[error("error creating app")]
/// struct HigherError {
///     #[source]
///     cause: StringError
/// }
///
/// fn do_work() -> Result<(), HigherError> {
///     Err(HigherError{cause: "kubectl exited with status 1".into()})
/// }
/// ```
#[derive(Error, BrokerError, Debug)]
#[code(Status::InternalServerError)]
#[error("{inner}")]
pub struct StringError {
    inner: String,
}

impl<T: AsRef<str>> From<T> for StringError {
    fn from(inner: T) -> Self {
        Self {
            inner: inner.as_ref().to_string(),
        }
    }
}

impl From<Box<dyn BrokerError>> for StringError {
    fn from(inner: Box<dyn BrokerError>) -> Self {
        Self {
            inner: chain(inner.as_ref()),
        }
    }
}
