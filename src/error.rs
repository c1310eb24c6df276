//! Error types for the schema compiler

use thiserror::Error;

use crate::validator::ValidationErrors;

/// Result type for schema operations
pub type Result<T> = std::result::Result<T, SchemaError>;

/// Schema compiler errors
///
/// Data failing a schema is never reported through this type; see
/// [`ValidationErrors`].
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Malformed schema: {0}")]
    MalformedSchema(String),

    #[error("Schema with key or id \"{0}\" already exists")]
    DuplicateIdentifier(String),

    #[error("Can't resolve reference {reference} (missing schema {schema})")]
    MissingReference {
        /// The absolute reference that could not be resolved
        reference: String,
        /// The reference without its fragment, i.e. the document to load
        schema: String,
    },

    #[error("Schema is invalid: {errors}")]
    SchemaInvalid { errors: ValidationErrors },

    #[error("Keyword {keyword} failed to compile: {message}")]
    CompilationFailure { keyword: String, message: String },

    #[error("Invalid keyword definition: {0}")]
    InvalidKeyword(String),

    #[error("Keyword {0} is already defined")]
    KeywordConflict(String),

    #[error("Keyword ordering cycle between: {}", .0.join(", "))]
    KeywordCycle(Vec<String>),

    #[error("Unknown format \"{0}\"")]
    UnknownFormat(String),

    #[error("Invalid pattern: {0}")]
    Regex(#[from] regex::Error),

    #[error("Failed to load schema {uri}: {message}")]
    LoadFailed { uri: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config_crate::ConfigError),
}

impl SchemaError {
    pub(crate) fn compilation(keyword: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CompilationFailure {
            keyword: keyword.into(),
            message: message.into(),
        }
    }

    /// True for the error an async loader can recover from
    pub fn is_missing_reference(&self) -> bool {
        matches!(self, Self::MissingReference { .. })
    }
}
