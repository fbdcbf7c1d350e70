use http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror;

pub type Result<T> = std::result::Result<T, Error>;

/// Stable error code identifiers defined by the [OCI distribution
/// spec](https://github.com/opencontainers/distribution-spec/blob/main/spec.md#error-codes),
/// plus a catch-all for codes this crate does not recognize.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DistributionErrorCode {
    BlobUnknown,
    BlobUploadInvalid,
    BlobUploadUnknown,
    DigestInvalid,
    ManifestBlobUnknown,
    ManifestInvalid,
    ManifestUnknown,
    NameInvalid,
    NameUnknown,
    SizeInvalid,
    RangeInvalid,
    Unauthorized,
    Denied,
    Unsupported,
    TooManyRequests,
    Unknown,
}

impl DistributionErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistributionErrorCode::BlobUnknown => "BLOB_UNKNOWN",
            DistributionErrorCode::BlobUploadInvalid => "BLOB_UPLOAD_INVALID",
            DistributionErrorCode::BlobUploadUnknown => "BLOB_UPLOAD_UNKNOWN",
            DistributionErrorCode::DigestInvalid => "DIGEST_INVALID",
            DistributionErrorCode::ManifestBlobUnknown => "MANIFEST_BLOB_UNKNOWN",
            DistributionErrorCode::ManifestInvalid => "MANIFEST_INVALID",
            DistributionErrorCode::ManifestUnknown => "MANIFEST_UNKNOWN",
            DistributionErrorCode::NameInvalid => "NAME_INVALID",
            DistributionErrorCode::NameUnknown => "NAME_UNKNOWN",
            DistributionErrorCode::SizeInvalid => "SIZE_INVALID",
            DistributionErrorCode::RangeInvalid => "RANGE_INVALID",
            DistributionErrorCode::Unauthorized => "UNAUTHORIZED",
            DistributionErrorCode::Denied => "DENIED",
            DistributionErrorCode::Unsupported => "UNSUPPORTED",
            DistributionErrorCode::TooManyRequests => "TOOMANYREQUESTS",
            DistributionErrorCode::Unknown => "UNKNOWN",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            DistributionErrorCode::BlobUnknown => StatusCode::NOT_FOUND,
            DistributionErrorCode::BlobUploadInvalid => StatusCode::BAD_REQUEST,
            DistributionErrorCode::BlobUploadUnknown => StatusCode::NOT_FOUND,
            DistributionErrorCode::DigestInvalid => StatusCode::BAD_REQUEST,
            DistributionErrorCode::ManifestBlobUnknown => StatusCode::NOT_FOUND,
            DistributionErrorCode::ManifestInvalid => StatusCode::BAD_REQUEST,
            DistributionErrorCode::ManifestUnknown => StatusCode::NOT_FOUND,
            DistributionErrorCode::NameInvalid => StatusCode::BAD_REQUEST,
            DistributionErrorCode::NameUnknown => StatusCode::NOT_FOUND,
            DistributionErrorCode::SizeInvalid => StatusCode::BAD_REQUEST,
            DistributionErrorCode::RangeInvalid => StatusCode::RANGE_NOT_SATISFIABLE,
            DistributionErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            DistributionErrorCode::Denied => StatusCode::FORBIDDEN,
            DistributionErrorCode::Unsupported => StatusCode::NOT_IMPLEMENTED,
            DistributionErrorCode::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            DistributionErrorCode::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn default_message(&self) -> &'static str {
        match self {
            DistributionErrorCode::BlobUnknown => "blob unknown to registry",
            DistributionErrorCode::BlobUploadInvalid => "blob upload invalid",
            DistributionErrorCode::BlobUploadUnknown => "blob upload unknown to registry",
            DistributionErrorCode::DigestInvalid => {
                "provided digest did not match uploaded content"
            }
            DistributionErrorCode::ManifestBlobUnknown => {
                "manifest references a manifest or blob unknown to registry"
            }
            DistributionErrorCode::ManifestInvalid => "manifest invalid",
            DistributionErrorCode::ManifestUnknown => "manifest unknown to registry",
            DistributionErrorCode::NameInvalid => "invalid repository name",
            DistributionErrorCode::NameUnknown => "repository name not known to registry",
            DistributionErrorCode::SizeInvalid => "provided length did not match content length",
            DistributionErrorCode::RangeInvalid => "requested range not satisfiable",
            DistributionErrorCode::Unauthorized => "authentication required",
            DistributionErrorCode::Denied => "requested access to the resource is denied",
            DistributionErrorCode::Unsupported => "the operation is unsupported",
            DistributionErrorCode::TooManyRequests => "too many requests",
            DistributionErrorCode::Unknown => "unknown error",
        }
    }
}

impl std::str::FromStr for DistributionErrorCode {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        let code = match s {
            "BLOB_UNKNOWN" => DistributionErrorCode::BlobUnknown,
            "BLOB_UPLOAD_INVALID" => DistributionErrorCode::BlobUploadInvalid,
            "BLOB_UPLOAD_UNKNOWN" => DistributionErrorCode::BlobUploadUnknown,
            "DIGEST_INVALID" => DistributionErrorCode::DigestInvalid,
            "MANIFEST_BLOB_UNKNOWN" => DistributionErrorCode::ManifestBlobUnknown,
            "MANIFEST_INVALID" => DistributionErrorCode::ManifestInvalid,
            "MANIFEST_UNKNOWN" => DistributionErrorCode::ManifestUnknown,
            "NAME_INVALID" => DistributionErrorCode::NameInvalid,
            "NAME_UNKNOWN" => DistributionErrorCode::NameUnknown,
            "SIZE_INVALID" => DistributionErrorCode::SizeInvalid,
            "RANGE_INVALID" => DistributionErrorCode::RangeInvalid,
            "UNAUTHORIZED" => DistributionErrorCode::Unauthorized,
            "DENIED" => DistributionErrorCode::Denied,
            "UNSUPPORTED" => DistributionErrorCode::Unsupported,
            "TOOMANYREQUESTS" => DistributionErrorCode::TooManyRequests,
            _ => return Err(()),
        };
        Ok(code)
    }
}

impl std::fmt::Display for DistributionErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A coded registry error as it appears in distribution API error bodies.
#[derive(Clone, Debug)]
pub struct RegistryError {
    pub code: DistributionErrorCode,
    pub message: String,
    pub detail: Option<serde_json::Value>,
}

impl RegistryError {
    pub fn new(code: DistributionErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: None,
        }
    }

    pub fn from_code(code: DistributionErrorCode) -> Self {
        Self::new(code, code.default_message())
    }
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}: {}", self.code, self.code.default_message())
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

/// Wire form of a single error in a distribution `{"errors": [...]}` body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

/// Wire form of a distribution error body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub errors: Vec<ErrorInfo>,
}

impl From<&RegistryError> for ErrorInfo {
    fn from(e: &RegistryError) -> Self {
        ErrorInfo {
            code: e.code.as_str().to_string(),
            message: e.message.clone(),
            detail: e.detail.clone(),
        }
    }
}

impl From<&ErrorInfo> for RegistryError {
    fn from(info: &ErrorInfo) -> Self {
        let code = info
            .code
            .parse::<DistributionErrorCode>()
            .unwrap_or(DistributionErrorCode::Unknown);
        let message = if info.message.is_empty() {
            // keep the raw code visible for codes we don't recognize
            info.code.clone()
        } else {
            info.message.clone()
        };
        RegistryError {
            code,
            message,
            detail: info.detail.clone(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Registry(RegistryError),

    #[error("invalid digest: {0}")]
    InvalidDigest(String),
    #[error("unsupported digest algorithm: {0}")]
    UnsupportedDigestAlgorithm(String),
    #[error("digest mismatch: expected {expected}, computed {actual} over {bytes} bytes")]
    DigestMismatch {
        expected: String,
        actual: String,
        bytes: u64,
    },
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Classify this error by distribution error code. Wrapped errors are
    /// equal-by-code to their cause so callers can match on codes without
    /// caring how many layers an error crossed.
    pub fn code(&self) -> DistributionErrorCode {
        match self {
            Error::Registry(e) => e.code,
            Error::InvalidDigest(_)
            | Error::UnsupportedDigestAlgorithm(_)
            | Error::DigestMismatch { .. } => DistributionErrorCode::DigestInvalid,
            Error::SizeMismatch { .. } => DistributionErrorCode::SizeInvalid,
            Error::InvalidReference(_) => DistributionErrorCode::NameInvalid,
            Error::MethodNotAllowed => DistributionErrorCode::Unsupported,
            Error::Transport(_) | Error::Io(_) => DistributionErrorCode::Unknown,
        }
    }

    pub fn is_code(&self, code: DistributionErrorCode) -> bool {
        self.code() == code
    }

    pub fn coded(code: DistributionErrorCode) -> Self {
        Error::Registry(RegistryError::from_code(code))
    }

    pub fn coded_message(code: DistributionErrorCode, message: impl Into<String>) -> Self {
        Error::Registry(RegistryError::new(code, message))
    }

    pub fn blob_unknown(digest: impl std::fmt::Display) -> Self {
        Error::coded_message(
            DistributionErrorCode::BlobUnknown,
            format!("blob unknown to registry: {digest}"),
        )
    }

    pub fn manifest_unknown(reference: impl std::fmt::Display) -> Self {
        Error::coded_message(
            DistributionErrorCode::ManifestUnknown,
            format!("manifest unknown to registry: {reference}"),
        )
    }

    pub fn name_unknown(repo: impl std::fmt::Display) -> Self {
        Error::coded_message(
            DistributionErrorCode::NameUnknown,
            format!("repository name not known to registry: {repo}"),
        )
    }

    pub fn unsupported(operation: &str) -> Self {
        Error::coded_message(
            DistributionErrorCode::Unsupported,
            format!("operation unsupported by this registry: {operation}"),
        )
    }

    pub fn denied(message: impl Into<String>) -> Self {
        Error::coded_message(DistributionErrorCode::Denied, message)
    }

    pub fn transport<E>(e: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Transport(Box::new(e))
    }
}

impl From<RegistryError> for Error {
    fn from(e: RegistryError) -> Self {
        Error::Registry(e)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn code_round_trip() {
        for code in [
            DistributionErrorCode::BlobUnknown,
            DistributionErrorCode::ManifestUnknown,
            DistributionErrorCode::TooManyRequests,
            DistributionErrorCode::RangeInvalid,
            DistributionErrorCode::Denied,
        ] {
            assert_eq!(code.as_str().parse(), Ok(code));
        }
        assert!("MEOW".parse::<DistributionErrorCode>().is_err());
    }

    #[test]
    fn wrapped_errors_classify_by_code() {
        let err = Error::blob_unknown("sha256:abcd");
        assert!(err.is_code(DistributionErrorCode::BlobUnknown));

        let err = Error::DigestMismatch {
            expected: "aa".into(),
            actual: "bb".into(),
            bytes: 2,
        };
        assert!(err.is_code(DistributionErrorCode::DigestInvalid));
    }

    #[test]
    fn error_body_round_trip() {
        let body = r#"{"errors":[{"code":"MANIFEST_UNKNOWN","message":"nope","detail":{"tag":"latest"}}]}"#;
        let resp: ErrorResponse = serde_json::from_str(body).unwrap();
        let err: RegistryError = (&resp.errors[0]).into();
        assert_eq!(err.code, DistributionErrorCode::ManifestUnknown);
        assert_eq!(err.message, "nope");
        assert!(err.detail.is_some());
    }
}
