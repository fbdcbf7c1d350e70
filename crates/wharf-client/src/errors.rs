//! Decoding of distribution error responses.

use reqwest::{Response, StatusCode};

use wharf_core::{DistributionErrorCode, Error, ErrorResponse, RegistryError};

// error bodies are bounded; anything longer is noise
const MAX_ERROR_BODY: usize = 8 * 1024;

pub(crate) fn transport(e: reqwest::Error) -> Error {
    Error::transport(e)
}

/// Whether a content type is JSON enough to carry an `{"errors": [...]}`
/// body: `application/json` or any `application/...+json` flavor.
fn is_json_media_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.strip_prefix("application/") {
        Some(rest) => rest == "json" || rest.ends_with("+json"),
        None => false,
    }
}

fn code_for_status(status: StatusCode, not_found: DistributionErrorCode) -> DistributionErrorCode {
    match status {
        StatusCode::UNAUTHORIZED => DistributionErrorCode::Unauthorized,
        StatusCode::FORBIDDEN => DistributionErrorCode::Denied,
        StatusCode::NOT_FOUND => not_found,
        StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED => {
            DistributionErrorCode::Unsupported
        }
        StatusCode::RANGE_NOT_SATISFIABLE => DistributionErrorCode::RangeInvalid,
        StatusCode::TOO_MANY_REQUESTS => DistributionErrorCode::TooManyRequests,
        _ => DistributionErrorCode::Unknown,
    }
}

/// Turn an unexpected response into a typed error. A JSON error body is
/// decoded into its first member; otherwise the status line decides, with
/// `not_found` supplying the operation-specific meaning of a bare 404.
pub(crate) async fn error_from_response(
    resp: Response,
    not_found: DistributionErrorCode,
) -> Error {
    let status = resp.status();
    let url = resp.url().clone();
    let json = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(is_json_media_type)
        .unwrap_or(false);

    if json {
        if let Ok(body) = resp.bytes().await {
            let body = &body[..body.len().min(MAX_ERROR_BODY)];
            if let Ok(parsed) = serde_json::from_slice::<ErrorResponse>(body) {
                if let Some(info) = parsed.errors.first() {
                    let mut err: RegistryError = info.into();
                    if err.code == DistributionErrorCode::Unknown
                        && info.code.parse::<DistributionErrorCode>().is_err()
                    {
                        tracing::debug!(code = %info.code, %url, "unrecognized distribution error code");
                    }
                    if err.message.is_empty() {
                        err.message = format!("{url} returned status {status}");
                    }
                    return Error::Registry(err);
                }
            }
        }
    }
    Error::coded_message(
        code_for_status(status, not_found),
        format!("{url} returned unexpected status {status}"),
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn json_media_type_gate() {
        assert!(is_json_media_type("application/json"));
        assert!(is_json_media_type("application/json; charset=utf-8"));
        assert!(is_json_media_type("application/vnd.oci.image.index.v1+json"));
        assert!(!is_json_media_type("text/plain"));
        assert!(!is_json_media_type("application/octet-stream"));
        assert!(!is_json_media_type("text/json+json-ish"));
    }

    #[test]
    fn status_fallbacks() {
        assert_eq!(
            code_for_status(StatusCode::NOT_FOUND, DistributionErrorCode::BlobUnknown),
            DistributionErrorCode::BlobUnknown
        );
        assert_eq!(
            code_for_status(StatusCode::UNAUTHORIZED, DistributionErrorCode::Unknown),
            DistributionErrorCode::Unauthorized
        );
        assert_eq!(
            code_for_status(StatusCode::TOO_MANY_REQUESTS, DistributionErrorCode::Unknown),
            DistributionErrorCode::TooManyRequests
        );
    }
}
