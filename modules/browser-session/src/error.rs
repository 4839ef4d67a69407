use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrowserError>;

#[derive(Debug, Error)]
pub enum BrowserError {
    /// The DevTools connection is gone. The only retryable browser failure.
    #[error("Browser session disconnected: {0}")]
    Disconnected(String),

    #[error("Navigation failed for {url}: {message}")]
    Navigation { url: String, message: String },

    #[error("Script error: {0}")]
    Script(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl BrowserError {
    pub fn is_disconnect(&self) -> bool {
        matches!(self, BrowserError::Disconnected(_))
    }
}
