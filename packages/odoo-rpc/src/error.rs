//! Error types for the Odoo JSON-RPC client.

use thiserror::Error;

/// Errors produced by [`crate::OdooClient`].
///
/// The variants deliberately separate connectivity problems from
/// server-side faults so callers can decide what is worth retrying.
#[derive(Debug, Error)]
pub enum OdooRpcError {
    /// The HTTP request itself failed (DNS, connect, TLS, timeout).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The server answered with a non-success HTTP status.
    #[error("http status {status}")]
    Http { status: u16 },

    /// The server answered 200 but the JSON-RPC envelope carries a fault.
    #[error("odoo fault (code {code}): {message}")]
    Fault { code: i64, message: String },

    /// Authentication failed or no session could be established.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The response body did not match the expected shape.
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl OdooRpcError {
    /// Whether this error is plausibly recoverable by retrying later.
    ///
    /// Transport failures, 429 and 5xx responses are; faults and decode
    /// errors describe a request the server has rejected and are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            OdooRpcError::Transport(_) => true,
            OdooRpcError::Http { status } => *status == 429 || *status >= 500,
            OdooRpcError::Fault { .. } => false,
            OdooRpcError::Auth(_) => false,
            OdooRpcError::Decode(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_429_is_retryable() {
        assert!(OdooRpcError::Http { status: 429 }.is_retryable());
    }

    #[test]
    fn http_503_is_retryable() {
        assert!(OdooRpcError::Http { status: 503 }.is_retryable());
    }

    #[test]
    fn http_404_is_not_retryable() {
        assert!(!OdooRpcError::Http { status: 404 }.is_retryable());
    }

    #[test]
    fn fault_is_not_retryable() {
        let err = OdooRpcError::Fault {
            code: 200,
            message: "ValidationError".to_string(),
        };
        assert!(!err.is_retryable());
    }
}
