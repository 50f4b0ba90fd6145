//! Error types shared by the reactive and image layers.

use thiserror::Error;

use crate::reactive::CellId;

/// Errors surfaced by cells, mirrors and image reads.
///
/// Nothing in the engine swallows these: a failure raised by a user function
/// during a recompute is returned to whoever performed the write that
/// triggered it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReactiveError {
    /// A write reached a cell whose `end` companion has already fired.
    #[error("cell {0} has ended")]
    Ended(CellId),

    /// The property is neither an own key of the target nor a member of
    /// its prototype chain.
    #[error("no property `{0}`")]
    MissingProperty(String),

    #[error("index {index} out of bounds for array of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("`{0}` is not callable")]
    NotCallable(String),

    /// A snapshot or serialization reached an object or array that
    /// contains itself.
    #[error("cyclic data graph")]
    Cycle,

    /// Raised by user code (mirror functions, methods, getters).
    #[error("{0}")]
    Failed(String),
}

impl ReactiveError {
    /// Build a user-level failure from any displayable message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ReactiveError>;
