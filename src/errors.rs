use thiserror::Error;

#[derive(Debug, Error)]
pub enum MapperError {
    #[error("Cannot resolve field path '{key}': {reason}")]
    Resolution { key: String, reason: String },

    #[error("Unsupported operator '{0}'")]
    UnsupportedOperator(String),

    #[error("Invalid value for '{operator}': {reason}")]
    InvalidValueShape { operator: String, reason: String },

    #[error("Conflicting modifiers on field '{0}'")]
    ConflictingModifier(String),

    #[error("{doc_type} matching query does not exist")]
    DoesNotExist { doc_type: String },

    #[error("{count} or more {doc_type} items returned, instead of 1")]
    MultipleObjectsReturned { doc_type: String, count: usize },

    #[error("Index {index} out of range (result has {len} documents)")]
    IndexRange { index: usize, len: usize },

    #[error("Caller contract violation: {0}")]
    CallerContract(String),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serde JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("BSON: {0}")]
    Bson(#[from] bson::error::Error),
}

impl MapperError {
    pub(crate) fn resolution(key: &str, reason: impl Into<String>) -> Self {
        Self::Resolution { key: key.to_string(), reason: reason.into() }
    }

    pub(crate) fn shape(operator: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValueShape { operator: operator.to_string(), reason: reason.into() }
    }
}

impl From<std::io::Error> for MapperError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
