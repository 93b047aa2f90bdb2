//! Allocator error types.

use std::fmt;

use thiserror::Error;

/// A predicate expression that can never be evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },

    #[error("undeclared reference to '{0}'")]
    UndeclaredReference(String),

    #[error("type error: {0}")]
    Type(String),
}

/// A predicate expression that failed for one particular device.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("no such key: {0}")]
    NoSuchKey(String),

    #[error("no such overload: {0}")]
    NoSuchOverload(String),

    #[error("expression evaluated to {0}, expected bool")]
    NotBool(&'static str),
}

/// Where a selector expression came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorOwner {
    /// A request in the named claim (`namespace/name`).
    Claim(String),
    /// The named device class.
    Class(String),
}

impl fmt::Display for SelectorOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectorOwner::Claim(key) => write!(f, "claim {key}"),
            SelectorOwner::Class(name) => write!(f, "class {name}"),
        }
    }
}

/// Errors raised while preparing or running an allocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocatorError {
    #[error("request {request}: device class {class} does not exist")]
    MissingClass { request: String, class: String },

    #[error("{owner}: selector #{index}: {source}")]
    Compile {
        owner: SelectorOwner,
        index: usize,
        source: CompileError,
    },

    #[error("{owner}: selector #{index}: runtime error: {source}")]
    Eval {
        owner: SelectorOwner,
        index: usize,
        source: EvalError,
    },

    #[error("claim {claim}: request {request}: device count must be at least 1")]
    InvalidCount { claim: String, request: String },
}

impl AllocatorError {
    /// Whether the error depends on the device inventory being examined.
    pub fn is_runtime(&self) -> bool {
        matches!(self, AllocatorError::Eval { .. })
    }
}

pub type AllocatorResult<T> = Result<T, AllocatorError>;
