use thiserror::Error;

/// Failure classes the synchronization engine distinguishes.
///
/// The class decides the recovery strategy: transport and server errors are
/// recoverable (backoff / bounded retry), auth is terminal for the current
/// credential, and validation/conflict/not-found always roll back the
/// speculative state and surface to the caller.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

impl SyncError {
    /// Whether the api client may retry the request that produced this error.
    /// Only authority-side failures are retried; everything else either has
    /// its own recovery path (transport → reconnect machine) or must surface.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Server(_))
    }

    /// Terminal for the current credential: reconnecting with the same token
    /// would be rejected again.
    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::Auth(_))
    }

    /// The referenced entity is gone or the mutation is stale; rollback and
    /// discard rather than retry.
    pub fn is_stale(&self) -> bool {
        matches!(self, SyncError::Conflict(_) | SyncError::NotFound(_))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            SyncError::Transport(err.to_string())
        } else {
            SyncError::Server(err.to_string())
        }
    }
}

/// Map a structured authority error `{code, message}` onto the taxonomy.
/// Unknown codes are treated as server-side failures.
pub fn classify_api_error(code: &str, message: &str) -> SyncError {
    match code {
        "unauthorized" | "token_expired" | "forbidden" => SyncError::Auth(message.to_string()),
        "validation" | "bad_request" => SyncError::Validation(message.to_string()),
        "conflict" => SyncError::Conflict(message.to_string()),
        "not_found" => SyncError::NotFound(message.to_string()),
        _ => SyncError::Server(message.to_string()),
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(classify_api_error("not_found", "gone").is_stale());
        assert!(classify_api_error("conflict", "taken").is_stale());
        assert!(classify_api_error("token_expired", "expired").is_auth());
        assert!(classify_api_error("internal", "boom").is_retryable());
        assert!(!classify_api_error("validation", "bad title").is_retryable());
    }
}
