use error::*;

/// Every failure reported by the kube client is mapped onto one of these.
///
/// The display text is intentionally vague as these can end up in front of end users. The
/// wrapped [kube::Error](kube::Error) is logged by the error responder.
#[derive(Error, BrokerError, Debug)]
pub enum ApiError {
    #[error("The Kubernetes API server rejected our request")]
    #[code(Status::InternalServerError)]
    Api(#[source] kube::Error),
    #[error("Failed to connect to the Kubernetes API server")]
    #[code(Status::InternalServerError)]
    Connection(#[source] kube::Error),
    #[error("Failed to complete a request to the Kubernetes API server")]
    #[code(Status::InternalServerError)]
    Rest(#[source] kube::Error),
}

impl From<kube::Error> for ApiError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(_) => ApiError::Api(err),
            kube::Error::Connection(_) => ApiError::Connection(err),
            _ => ApiError::Rest(err),
        }
    }
}

impl ApiError {
    /// Whether the API server answered with a 404 for the object in question.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ApiError::Api(kube::Error::Api(kube::error::ErrorResponse { code: 404, .. }))
        )
    }
}
