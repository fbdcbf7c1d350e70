use thiserror;

use wharf_core::DistributionErrorCode;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid auth configuration: {0}")]
    InvalidConfig(String),

    #[error("ambiguous auth configuration for {host}: multiple URL-shaped entries {sources:?}")]
    AmbiguousConfig { host: String, sources: Vec<String> },

    #[error("credential helper docker-credential-{0} is not installed")]
    HelperNotInstalled(String),

    #[error("credential helper docker-credential-{helper} failed: {message}")]
    Helper { helper: String, message: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("challenge is missing a realm")]
    MissingRealm,

    #[error("token endpoint {realm} returned status {status}")]
    TokenEndpoint { realm: String, status: u16 },

    #[error("token endpoint returned neither token nor access_token")]
    MissingToken,

    #[error("access to {host} denied: request kept failing with 401 after a fresh token")]
    Denied { host: String },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid auth config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<Error> for wharf_core::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::TokenEndpoint { .. } | Error::MissingToken => {
                wharf_core::Error::coded_message(
                    DistributionErrorCode::Unauthorized,
                    e.to_string(),
                )
            }
            Error::Denied { .. } => {
                wharf_core::Error::coded_message(DistributionErrorCode::Denied, e.to_string())
            }
            other => wharf_core::Error::transport(other),
        }
    }
}
