use thiserror::Error;

pub type Result<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Http { status: u16, message: String },

    #[error("Expected JSON response, got content-type {content_type:?}")]
    NonJson { content_type: Option<String> },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("API returned status {status:?}: {message}")]
    NotOk { status: String, message: String },

    #[error("Missing session credential: {0}")]
    MissingCredential(&'static str),
}

impl ApiError {
    /// Stable, log-friendly reason string recorded in ledger metadata.
    pub fn reason_code(&self) -> String {
        match self {
            ApiError::Timeout(_) => "api_timeout".to_string(),
            ApiError::Network(_) => "api_network_error".to_string(),
            ApiError::Http { status, .. } => format!("api_http_{status}"),
            ApiError::NonJson { .. } => "api_non_json_response".to_string(),
            ApiError::Parse(_) => "api_parse_error".to_string(),
            ApiError::NotOk { status, .. } => {
                if status.is_empty() {
                    "api_status_missing".to_string()
                } else {
                    format!("api_status_{status}")
                }
            }
            ApiError::MissingCredential(name) => format!("api_missing_{name}"),
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout(err.to_string())
        } else if err.is_decode() {
            ApiError::Parse(err.to_string())
        } else {
            ApiError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Parse(err.to_string())
    }
}
