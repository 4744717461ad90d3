use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnricherError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("API error: {message}")]
    Api { message: String },

    #[error("Environment variable error: {0}")]
    Env(#[from] std::env::VarError),
}

pub type Result<T> = std::result::Result<T, EnricherError>;

/// Failure of a single outbound lookup call.
///
/// "No matching item" is not an error; it is `Ok(None)` on the lookup port.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("lookup timed out or was aborted")]
    Timeout,

    #[error("lookup transport failure: {0}")]
    Transport(String),
}

impl LookupError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, LookupError::Timeout)
    }
}

impl From<reqwest::Error> for LookupError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LookupError::Timeout
        } else {
            LookupError::Transport(err.to_string())
        }
    }
}
