use thiserror::Error;

#[derive(Error, Debug)]
pub enum RepoError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Assertion failed: {0}")]
    Assertion(String),

    #[error("Failed to compile model '{model}': {message}")]
    Compile { model: String, message: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Record not found: {model}/{id}")]
    NotFound { model: String, id: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Hashing error: {0}")]
    Hash(#[from] bcrypt::BcryptError),

    #[error("{0}")]
    Other(String),
}

impl RepoError {
    /// Attach the owning model name to a structural error raised while walking a schema tree.
    pub fn in_model(self, model: &str) -> Self {
        match self {
            RepoError::Compile { message, .. } => RepoError::Compile {
                model: model.to_string(),
                message,
            },
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, RepoError>;

/// Conditions that make the connection pool unusable. These are not returned to
/// callers; they are delivered on the repository's fatal channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FatalError {
    #[error("db {db} failed to connect within {timeout_ms}ms")]
    ConnectTimeout { db: String, timeout_ms: u64 },

    #[error("db {db} ran out of reconnection retries")]
    RetriesExhausted { db: String },
}
