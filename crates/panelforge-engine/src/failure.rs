use std::fmt;
use std::io;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageFailureKind {
    PermissionDenied,
    ReadOnly,
    OutOfSpace,
    Other,
}

impl fmt::Display for StorageFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StorageFailureKind::PermissionDenied => "permission denied",
            StorageFailureKind::ReadOnly => "read-only storage",
            StorageFailureKind::OutOfSpace => "out of space",
            StorageFailureKind::Other => "write failed",
        })
    }
}

/// Classified outcome of a single page transform.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformFailure {
    #[error("no API key configured")]
    MissingCredential,
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),
    #[error("request timed out: {0}")]
    TransportTimeout(String),
    #[error("transport interrupted: {0}")]
    TransportInterrupted(String),
    #[error("TLS failure: {0}")]
    TlsFailure(String),
    #[error("credential rejected ({status}): {message}")]
    AuthRejected { status: u16, message: String },
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("request rejected ({status}): {message}")]
    ProviderValidationError { status: u16, message: String },
    #[error("provider error ({status}): {message}")]
    ServerError { status: u16, message: String },
    #[error("no image returned: {0}")]
    EmptyOrBlockedResult(String),
    #[error("unparseable response: {0}")]
    UnparseableResponse(String),
    #[error("image decode failed: {0}")]
    ImageDecodeFailure(String),
    #[error("storage failure ({kind}): {message}")]
    StorageFailure {
        kind: StorageFailureKind,
        message: String,
    },
}

impl TransformFailure {
    /// Retryable failures count toward the consecutive-failure budget; the rest abort the run.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransformFailure::MissingCredential
            | TransformFailure::NetworkUnreachable(_)
            | TransformFailure::TlsFailure(_)
            | TransformFailure::AuthRejected { .. }
            | TransformFailure::StorageFailure { .. } => false,
            TransformFailure::TransportTimeout(_)
            | TransformFailure::TransportInterrupted(_)
            | TransformFailure::RateLimited(_)
            | TransformFailure::ProviderValidationError { .. }
            | TransformFailure::ServerError { .. }
            | TransformFailure::EmptyOrBlockedResult(_)
            | TransformFailure::UnparseableResponse(_)
            | TransformFailure::ImageDecodeFailure(_) => true,
        }
    }

    pub fn suggestion(&self) -> &'static str {
        match self {
            TransformFailure::MissingCredential => {
                "Set an API key with `panelforge settings set --api-key`."
            }
            TransformFailure::AuthRejected { .. } => {
                "The provider rejected the API key. Check the key and that it has image access."
            }
            TransformFailure::NetworkUnreachable(_) => {
                "Check the network connection and the configured base URL, then retry."
            }
            TransformFailure::TlsFailure(_) => {
                "The secure connection failed. Check the base URL and any proxy in between."
            }
            TransformFailure::TransportTimeout(_) | TransformFailure::TransportInterrupted(_) => {
                "The provider is slow to respond. Retry later or raise the request timeout."
            }
            TransformFailure::RateLimited(_) => {
                "The provider is rate limiting requests. Wait a while or raise the request delay."
            }
            TransformFailure::ProviderValidationError { .. } => {
                "The provider refused the request. Check the model name and API format."
            }
            TransformFailure::ServerError { .. } => {
                "The provider had an internal error. Retry later."
            }
            TransformFailure::EmptyOrBlockedResult(_) => {
                "The model returned no image, possibly due to its safety filter."
            }
            TransformFailure::UnparseableResponse(_) => {
                "The model answered without an image. Try an image-capable model."
            }
            TransformFailure::ImageDecodeFailure(_) => {
                "A page or a returned image could not be decoded."
            }
            TransformFailure::StorageFailure { kind, .. } => match kind {
                StorageFailureKind::OutOfSpace => "Free up storage space and resume.",
                StorageFailureKind::PermissionDenied | StorageFailureKind::ReadOnly => {
                    "The output folder is not writable. Check its permissions and resume."
                }
                StorageFailureKind::Other => {
                    "Writing the output failed. Check the output folder and resume."
                }
            },
        }
    }

    pub fn storage(err: &io::Error) -> Self {
        TransformFailure::StorageFailure {
            kind: storage_failure_kind(err),
            message: err.to_string(),
        }
    }

    /// Maps a non-success HTTP status and its (already truncated) body to a failure class.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 | 403 => TransformFailure::AuthRejected { status, message },
            408 => TransformFailure::TransportTimeout(message),
            429 => TransformFailure::RateLimited(message),
            400..=499 => TransformFailure::ProviderValidationError { status, message },
            _ => TransformFailure::ServerError { status, message },
        }
    }

    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        let message = error_chain_text(err);
        if err.is_timeout() {
            return TransformFailure::TransportTimeout(message);
        }
        if looks_like_tls(&message) {
            return TransformFailure::TlsFailure(message);
        }
        if err.is_connect() {
            return TransformFailure::NetworkUnreachable(message);
        }
        if err.is_decode() {
            return TransformFailure::UnparseableResponse(message);
        }
        TransformFailure::TransportInterrupted(message)
    }
}

fn looks_like_tls(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    ["tls", "certificate", "handshake", "ssl"]
        .iter()
        .any(|needle| lowered.contains(needle))
}

fn error_chain_text(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(cause) = current {
        let text = cause.to_string();
        let trimmed = text.trim();
        if !trimmed.is_empty() && parts.last().map(String::as_str) != Some(trimmed) {
            parts.push(trimmed.to_string());
        }
        current = cause.source();
    }
    parts.join(": ")
}

pub fn storage_failure_kind(err: &io::Error) -> StorageFailureKind {
    if err.kind() == io::ErrorKind::PermissionDenied {
        return StorageFailureKind::PermissionDenied;
    }
    // ENOSPC / EROFS, matched by code so older toolchains without the newer ErrorKinds work.
    match err.raw_os_error() {
        Some(28) => StorageFailureKind::OutOfSpace,
        Some(30) => StorageFailureKind::ReadOnly,
        _ => StorageFailureKind::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_failure_classes() {
        assert!(matches!(
            TransformFailure::from_status(401, "bad key".into()),
            TransformFailure::AuthRejected { status: 401, .. }
        ));
        assert!(matches!(
            TransformFailure::from_status(403, String::new()),
            TransformFailure::AuthRejected { status: 403, .. }
        ));
        assert!(matches!(
            TransformFailure::from_status(429, String::new()),
            TransformFailure::RateLimited(_)
        ));
        assert!(matches!(
            TransformFailure::from_status(400, String::new()),
            TransformFailure::ProviderValidationError { status: 400, .. }
        ));
        assert!(matches!(
            TransformFailure::from_status(503, String::new()),
            TransformFailure::ServerError { status: 503, .. }
        ));
    }

    #[test]
    fn abort_classes_are_not_retryable() {
        assert!(!TransformFailure::MissingCredential.is_retryable());
        assert!(!TransformFailure::NetworkUnreachable("dns".into()).is_retryable());
        assert!(!TransformFailure::TlsFailure("cert".into()).is_retryable());
        assert!(!TransformFailure::from_status(401, String::new()).is_retryable());
        assert!(!TransformFailure::storage(&io::Error::from(io::ErrorKind::PermissionDenied))
            .is_retryable());

        assert!(TransformFailure::RateLimited(String::new()).is_retryable());
        assert!(TransformFailure::TransportTimeout(String::new()).is_retryable());
        assert!(TransformFailure::ImageDecodeFailure(String::new()).is_retryable());
    }

    #[test]
    fn io_errors_classify_by_kind_and_code() {
        assert_eq!(
            storage_failure_kind(&io::Error::from(io::ErrorKind::PermissionDenied)),
            StorageFailureKind::PermissionDenied
        );
        assert_eq!(
            storage_failure_kind(&io::Error::from_raw_os_error(28)),
            StorageFailureKind::OutOfSpace
        );
        assert_eq!(
            storage_failure_kind(&io::Error::from_raw_os_error(30)),
            StorageFailureKind::ReadOnly
        );
        assert_eq!(
            storage_failure_kind(&io::Error::new(io::ErrorKind::Other, "boom")),
            StorageFailureKind::Other
        );
    }

    #[test]
    fn every_failure_has_a_suggestion() {
        let failures = [
            TransformFailure::MissingCredential,
            TransformFailure::EmptyOrBlockedResult("blocked".into()),
            TransformFailure::UnparseableResponse("prose".into()),
        ];
        for failure in failures {
            assert!(!failure.suggestion().is_empty());
        }
    }
}
