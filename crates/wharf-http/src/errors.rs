use axum::response::{IntoResponse, Response};
use http::StatusCode;
use thiserror;

use wharf_core::{DistributionErrorCode, ErrorInfo, ErrorResponse, RegistryError};

pub(crate) type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub(crate) enum Error {
    #[error(transparent)]
    Core(#[from] wharf_core::Error),

    #[error("missing header: {0}")]
    MissingHeader(&'static str),

    #[error("unreadable request body: {0}")]
    Body(String),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match self {
            Error::Core(wharf_core::Error::MethodNotAllowed) => {
                (StatusCode::METHOD_NOT_ALLOWED, "").into_response()
            }
            Error::Core(e) => {
                let code = e.code();
                if code == DistributionErrorCode::Unknown {
                    tracing::warn!("internal error serving registry request: {e}");
                }
                into_error_response(RegistryError::new(code, e.to_string()))
            }
            Error::MissingHeader(_) => {
                (StatusCode::BAD_REQUEST, format!("{}", self)).into_response()
            }
            Error::Body(_) => (StatusCode::BAD_REQUEST, format!("{}", self)).into_response(),
        }
    }
}

#[inline]
fn into_error_response(err: RegistryError) -> Response {
    let status = err.code.status_code();
    let body = ErrorResponse {
        errors: vec![ErrorInfo::from(&err)],
    };
    (status, axum::Json(body)).into_response()
}
