use std::error::Error;
use std::fmt;

use async_trait::async_trait;

/// Error returned by token providers when a token cannot be obtained.
#[derive(Debug, Clone)]
pub struct TokenError {
    message: String,
}

impl TokenError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn from_error(err: impl Error) -> Self {
        Self::new(err.to_string())
    }
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for TokenError {}

/// Credentials collaborator consulted before every stream handshake.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Current access token, or `None` for unauthenticated access.
    async fn get_token(&self) -> Result<Option<String>, TokenError>;

    /// Drops any cached token so the next `get_token` fetches a fresh one.
    fn invalidate_token(&self);
}
