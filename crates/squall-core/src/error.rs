//! Error types for squall-core

use crate::response::StatusCode;
use thiserror::Error;

/// Result type alias for squall operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced while framing, parsing and dispatching a request.
///
/// Every variant except [`Error::Closed`] and [`Error::Io`] maps to a
/// default HTTP response; those two abort the connection without one.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed PROXY preamble, request line, headers or URL encoding
    #[error("malformed request")]
    BadRequest,

    /// Unknown method, or POST sent to a route that does not accept it
    #[error("method not allowed")]
    NotAllowed,

    /// The route requires authorization and the check failed
    #[error("authorization required for realm {realm:?}")]
    NotAuthorized { realm: String },

    /// No route prefix matches the request URL
    #[error("no handler for URL")]
    NotFound,

    /// Packet or wall-clock budget exceeded while reading
    #[error("request read timed out")]
    RequestTimeout,

    /// Header block or declared body exceeds the configured cap
    #[error("request larger than allowed")]
    TooLarge,

    /// Body allocation failure, upgrade encoding failure, rewrite loop cap
    #[error("internal error: {0}")]
    Internal(&'static str),

    /// Orderly shutdown by the peer, or unrecoverable I/O mid-request
    #[error("peer closed connection")]
    Closed,

    /// I/O error outside the request path (bind, accept)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Status code for the default response, or `None` for fatal errors
    /// that tear the connection down without responding.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::BadRequest => Some(StatusCode::BAD_REQUEST),
            Error::NotAllowed => Some(StatusCode::METHOD_NOT_ALLOWED),
            Error::NotAuthorized { .. } => Some(StatusCode::UNAUTHORIZED),
            Error::NotFound => Some(StatusCode::NOT_FOUND),
            Error::RequestTimeout => Some(StatusCode::REQUEST_TIMEOUT),
            Error::TooLarge => Some(StatusCode::PAYLOAD_TOO_LARGE),
            Error::Internal(_) => Some(StatusCode::INTERNAL_SERVER_ERROR),
            Error::Closed | Error::Io(_) => None,
        }
    }

    /// Fatal errors get no response; the connection is simply dropped.
    pub fn is_fatal(&self) -> bool {
        self.status().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(Error::BadRequest.status(), Some(StatusCode::BAD_REQUEST));
        assert_eq!(Error::NotFound.status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(Error::TooLarge.status(), Some(StatusCode::PAYLOAD_TOO_LARGE));
        assert_eq!(Error::RequestTimeout.status(), Some(StatusCode::REQUEST_TIMEOUT));
        assert!(Error::Closed.status().is_none());
        assert!(Error::Closed.is_fatal());
        assert!(!Error::BadRequest.is_fatal());
    }
}
