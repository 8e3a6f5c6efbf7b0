//! Error types the sync engine branches on
//!
//! Plumbing (files, config, SQLite) uses `anyhow`. These typed errors exist
//! where callers decide between retrying, skipping, and aborting.

/// Credential exchange failed
///
/// `Clone` so every caller waiting on one refresh observes the same error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("token endpoint rejected the request (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("token exchange timed out")]
    Timeout,
    #[error("token exchange failed: {0}")]
    Transport(String),
    #[error("invalid token response: {0}")]
    InvalidResponse(String),
    #[error("token refresh aborted before completing")]
    Aborted,
}

/// Failure below the HTTP layer (no status code was received)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("{0}")]
    Io(String),
}

/// Failure of a single authenticated API request
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("still unauthorized after {attempts} attempts")]
    Unauthorized { attempts: u32 },
    #[error("API returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl RequestError {
    /// 403/404: the endpoint does not exist or is not entitled for this tenant
    pub fn is_unavailable(&self) -> bool {
        matches!(self, RequestError::Status { status: 403 | 404, .. })
    }
}

impl From<TransportError> for RequestError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => RequestError::Timeout,
            TransportError::Io(msg) => RequestError::Transport(msg),
        }
    }
}

/// Page-level fetch failure, classified for the paginated fetcher
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// No credential could be obtained; aborts the phase
    #[error(transparent)]
    Auth(AuthError),
    /// Every candidate endpoint answered 403/404
    #[error("source unavailable (HTTP {status})")]
    Unavailable { status: u16 },
    /// Network, timeout, 5xx, decode: retried in place
    #[error("{0}")]
    Transient(String),
}

impl From<RequestError> for FetchError {
    fn from(err: RequestError) -> Self {
        match err {
            RequestError::Auth(auth) => FetchError::Auth(auth),
            RequestError::Status { status, .. } if status == 403 || status == 404 => {
                FetchError::Unavailable { status }
            }
            other => FetchError::Transient(other.to_string()),
        }
    }
}

/// One record could not be mapped or stored; never propagated past the page
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("record is missing required field `{field}`")]
    MissingField { field: &'static str },
    #[error("storage rejected record {key}: {message}")]
    Storage { key: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_error_classification() {
        let not_found = RequestError::Status {
            status: 404,
            body: String::new(),
        };
        assert!(not_found.is_unavailable());
        assert_eq!(
            FetchError::from(not_found),
            FetchError::Unavailable { status: 404 }
        );

        let server = RequestError::Status {
            status: 503,
            body: "busy".into(),
        };
        assert!(!server.is_unavailable());
        assert!(matches!(FetchError::from(server), FetchError::Transient(_)));

        let auth = RequestError::Auth(AuthError::Timeout);
        assert_eq!(FetchError::from(auth), FetchError::Auth(AuthError::Timeout));
    }

    #[test]
    fn test_repeated_unauthorized_is_transient() {
        let err = FetchError::from(RequestError::Unauthorized { attempts: 3 });
        assert!(matches!(err, FetchError::Transient(_)));
    }

    #[test]
    fn test_transport_error_conversion() {
        assert_eq!(
            RequestError::from(TransportError::Timeout),
            RequestError::Timeout
        );
        assert_eq!(
            RequestError::from(TransportError::Io("reset".into())),
            RequestError::Transport("reset".into())
        );
    }
}
