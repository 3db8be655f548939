use rocket::http::{ContentType, Cookie, Header, Status};
use rocket::request::Request;
use rocket::response::Responder;
use serde::Serialize;
use serde_json::{json, to_string_pretty, Value};

/// A Response is the success counterpart to a [BrokerError](../error/trait.BrokerError.html).
///
/// Most handlers answer with the plain status envelope...
///
/// ```ignore
/// {
///     "code": 202,
///     "status": "terminating"
/// }
/// ```
///
/// ...built via [Response::new](crate::Response::new). Handlers that need to hand back a
/// document of their own (session metadata, for example) use [Response::json](crate::Response::json)
/// instead, in which case the document is sent as-is.
///
/// ```
/// use response::Response;
/// use result::Result;
/// use rocket::get;
/// use rocket::http::Status;
///
/// #[get("/")]
/// async fn reserve() -> Result<Response> {
///     Ok(Response::new(Status::Ok, "assigned pod: editor-7d9c"))
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    code: Status,
    body: Value,
    headers: Vec<Header<'static>>,
}

impl Response {
    /// The `{"code", "status"}` envelope.
    pub fn new<S: Into<String>>(code: Status, status: S) -> Self {
        Self {
            code,
            body: json!({
                "code": code.code,
                "status": status.into(),
            }),
            headers: vec![],
        }
    }

    /// An arbitrary JSON document in place of the envelope.
    pub fn json<T: Serialize>(code: Status, payload: &T) -> serde_json::Result<Self> {
        Ok(Self {
            code,
            body: serde_json::to_value(payload)?,
            headers: vec![],
        })
    }

    pub fn with_header<N: Into<String>, V: Into<String>>(mut self, name: N, value: V) -> Self {
        self.headers.push(Header::new(name.into(), value.into()));
        self
    }

    pub fn with_cookie(self, cookie: Cookie<'_>) -> Self {
        self.with_header("Set-Cookie", cookie.to_string())
    }

    pub fn with_location<V: Into<String>>(self, location: V) -> Self {
        self.with_header("Location", location)
    }

    pub fn code(&self) -> Status {
        self.code
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name().as_str().eq_ignore_ascii_case(name))
            .map(|h| h.value())
    }
}

/// The [Responder](rocket::response::Responder) implementation for a [Response](crate::Response)
/// does three things:
///
/// 1. Sets the content type to JSON.
/// 2. Sets the HTTP status along with any extra headers (cookies, redirects).
/// 3. Serializes the body and sends the resulting bytes over the wire.
impl<'r, 'o: 'r> Responder<'r, 'o> for Response {
    fn respond_to(self, _: &'r Request<'_>) -> rocket::response::Result<'o> {
        let mut response = rocket::Response::build();
        response.header(ContentType::JSON);
        response.status(self.code);
        for header in self.headers {
            response.header_adjoin(header);
        }
        let json = to_string_pretty(&self.body).map_err(|_| Status::InternalServerError)?;
        response.sized_body(json.len(), std::io::Cursor::new(json));
        Ok(response.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use result::Result;
    use rocket::get;
    use rocket::local::blocking::Client;
    use rocket::routes;

    #[get("/")]
    async fn terminating() -> Result<Response> {
        Ok(Response::new(Status::Accepted, "terminating"))
    }

    #[test]
    fn test_envelope() {
        let client = Client::tracked(rocket::build().mount("/", routes![terminating])).unwrap();
        let response = client.get("/").dispatch();
        assert_eq!(response.status(), Status::Accepted);
        let got: serde_json::Value = response.into_json().unwrap();
        let want = serde_json::json!({
            "code": 202,
            "status": "terminating"
        });
        assert_eq!(got, want)
    }

    #[derive(Serialize)]
    struct Metadata {
        ip: String,
        session_key: String,
        user_params: std::collections::BTreeMap<String, String>,
    }

    #[get("/")]
    async fn metadata() -> Result<Response> {
        let mut user_params = std::collections::BTreeMap::new();
        user_params.insert("theme".to_string(), "dark".to_string());
        let metadata = Metadata {
            ip: "10.0.0.7".to_string(),
            session_key: "abc-defg-hij".to_string(),
            user_params,
        };
        Ok(Response::json(Status::Ok, &metadata).map_err(|err| error::StringError::from(err.to_string()))?)
    }

    #[test]
    fn test_document() {
        let client = Client::tracked(rocket::build().mount("/", routes![metadata])).unwrap();
        let response = client.get("/").dispatch();
        assert_eq!(response.status(), Status::Ok);
        let got: serde_json::Value = response.into_json().unwrap();
        let want = serde_json::json!({
            "ip": "10.0.0.7",
            "session_key": "abc-defg-hij",
            "user_params": {"theme": "dark"}
        });
        assert_eq!(got, want)
    }

    #[get("/")]
    async fn redirect() -> Result<Response> {
        Ok(Response::new(Status::TemporaryRedirect, "ready")
            .with_cookie(
                Cookie::build(("broker_editor", "alice#abc"))
                    .path("/editor/")
                    .max_age(rocket::time::Duration::seconds(432_000))
                    .build(),
            )
            .with_location("/editor/"))
    }

    #[test]
    fn test_headers() {
        let client = Client::tracked(rocket::build().mount("/", routes![redirect])).unwrap();
        let response = client.get("/").dispatch();
        assert_eq!(response.status(), Status::TemporaryRedirect);
        assert_eq!(response.headers().get_one("Location"), Some("/editor/"));
        assert_eq!(
            response.headers().get_one("Set-Cookie"),
            Some("broker_editor=alice#abc; Path=/editor/; Max-Age=432000")
        );
    }

    #[test]
    fn header_lookup_ignores_case() {
        let response = Response::new(Status::Ok, "ok").with_location("/x/");
        assert_eq!(response.header("location"), Some("/x/"));
        assert_eq!(response.header("set-cookie"), None);
    }
}
