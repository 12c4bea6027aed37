//! Error types for Hearth.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// An expected build problem. The message is reported to users verbatim.
    #[error("{0}")]
    Build(String),

    #[error("no build service found to handle request: {0}")]
    NoService(String),

    #[error("unknown recipe: {0}")]
    UnknownRecipe(String),

    #[error("terminated")]
    Terminated,

    #[error("result already sealed: {0}")]
    Sealed(String),

    #[error("remote call failed: {0}")]
    Remote(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Human readable summary used when an error is recorded as a feature.
    ///
    /// Build errors carry a message meant for users; anything else is
    /// reported as unexpected.
    pub fn summary(&self) -> String {
        match self {
            Error::Build(message) => message.clone(),
            Error::Terminated => "Command terminated".to_string(),
            other => format!("Unexpected error: {other}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
