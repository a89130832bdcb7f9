//! Errors raised while talking to the remote catalog.
//!
//! None of these ever reach a filesystem caller. The reconciler and the
//! notifier worker log them, count them in [`PolicyStats`](crate::PolicyStats)
//! and carry on.

use thiserror::Error;

/// Failure of a single catalog call.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Transport-level failure (connect, TLS, timeout, body read).
    #[error("catalog request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The service answered with a non-success status.
    #[error("catalog {operation} returned HTTP {status}: {body}")]
    Status {
        /// Catalog operation that was attempted.
        operation: &'static str,
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },

    /// The response could not be decoded.
    #[error("malformed catalog response: {0}")]
    Decode(String),

    /// The client could not be built from its configuration.
    #[error("invalid catalog configuration: {0}")]
    Config(String),

    /// The catalog is unreachable for a reason other than transport.
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
}

impl CatalogError {
    /// Returns true if the call gave up because its timeout elapsed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CatalogError::Transport(e) if e.is_timeout())
    }
}

/// Result type for catalog operations.
pub type CatalogResult<T> = Result<T, CatalogError>;

/// Longest response body kept in a [`CatalogError::Status`].
pub(crate) const MAX_ERROR_BODY: usize = 512;

/// Truncates a response body for inclusion in an error.
pub(crate) fn truncate_body(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
        body.push('…');
    }
    body
}
