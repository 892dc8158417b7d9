//! Error type shared by every stage of the join.

use std::any::Any;

pub type Result<T> = std::result::Result<T, JoinError>;

/// Which input a row source error came from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Side {
    Build,
    Probe,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Build => f.write_str("build"),
            Side::Probe => f.write_str("probe"),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum JoinError {
    /// A row source failed while producing a chunk.
    #[error("{side} side source failed: {message}")]
    Source { side: Side, message: String },

    /// A filter or other condition could not be evaluated.
    #[error("predicate evaluation failed: {0}")]
    Predicate(String),

    /// A join key could not be serialized.
    #[error("cannot serialize join key column {column}: {message}")]
    Codec { column: usize, message: String },

    /// A worker thread panicked; the payload is kept as text.
    #[error("join worker panicked: {0}")]
    Panic(String),

    #[error("invalid join config: {0}")]
    InvalidConfig(String),

    #[error("hash join executor is not opened")]
    NotOpened,

    #[error("internal hash join error: {0}")]
    Internal(String),
}

impl JoinError {
    pub fn source_failed(side: Side, message: impl Into<String>) -> Self {
        JoinError::Source {
            side,
            message: message.into(),
        }
    }

    /// Turns a payload caught by `catch_unwind` into an error.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        JoinError::Panic(message)
    }
}

/// Runs one worker body, turning a panic into [`JoinError::Panic`].
pub(crate) fn recover_panic<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let err = JoinError::from_panic(payload);
        tracing::warn!(%err, "recovered join worker panic");
        Err(err)
    })
}
