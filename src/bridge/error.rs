use thiserror::Error;

use super::handle::Handle;
use crate::runtime::{StandardClass, Value};

/// Errors raised by bridge operations on behalf of native callers.
///
/// None of these abort: each becomes a managed exception of the class given
/// by [`BridgeError::exception_class`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("invalid handle {0:#x}")]
    InvalidHandle(Handle),

    #[error("missing keyword{}: {}", plural(.0), .0.join(", "))]
    MissingKeyword(Vec<String>),

    #[error("unknown keyword{}: {}", plural(.0), .0.join(", "))]
    UnknownKeyword(Vec<String>),

    #[error("{0}")]
    Argument(String),

    #[error("{0}")]
    Type(String),

    #[error("{0}")]
    NotImplemented(String),

    #[error("a bridge is already installed for this process")]
    AlreadyInstalled,

    #[error("no bridge has been installed")]
    NotInstalled,

    #[error("invalid configuration: {0}")]
    Config(String),
}

fn plural(keys: &[String]) -> &'static str {
    if keys.len() > 1 { "s" } else { "" }
}

impl BridgeError {
    pub fn exception_class(&self) -> StandardClass {
        match self {
            Self::InvalidHandle(_) | Self::Type(_) => StandardClass::TypeError,
            Self::MissingKeyword(_) | Self::UnknownKeyword(_) | Self::Argument(_) => {
                StandardClass::ArgumentError
            }
            Self::NotImplemented(_) => StandardClass::NotImplementedError,
            Self::AlreadyInstalled | Self::NotInstalled | Self::Config(_) => {
                StandardClass::RuntimeError
            }
        }
    }
}

/// Conditions that cannot be recovered from. They pass through every
/// primitive and end the process at the outermost boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FatalError {
    #[error("uncaught throw {0}")]
    UncaughtThrow(String),

    #[error("{0} should not return")]
    ShouldNotReturn(&'static str),

    #[error("{0} called without holding the execution lock")]
    LockNotHeld(&'static str),

    #[error("panic in native callback {name}: {message}")]
    NativePanic { name: &'static str, message: String },

    #[error("{0} called before a bridge was installed")]
    NotInstalled(&'static str),
}

/// A non-local exit travelling up the native call chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unwind {
    /// A raised exception object.
    Raise(Value),
    /// A tagged throw looking for its `catch`.
    Throw { tag: Value, value: Value },
    Fatal(FatalError),
}

impl Unwind {
    pub fn status(&self) -> Status {
        match self {
            Self::Raise(_) => Status::RAISE,
            Self::Throw { .. } => Status::THROW,
            Self::Fatal(_) => Status::FATAL,
        }
    }

    /// The managed values this exit keeps alive.
    pub(crate) fn values(&self) -> Vec<Value> {
        match self {
            Self::Raise(exception) => vec![*exception],
            Self::Throw { tag, value } => vec![*tag, *value],
            Self::Fatal(_) => Vec::new(),
        }
    }
}

/// Kind of non-local exit, numbered like the managed runtime's jump tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub i32);

impl Status {
    pub const NONE: Self = Self(0);
    pub const RETURN: Self = Self(1);
    pub const BREAK: Self = Self(2);
    pub const NEXT: Self = Self(3);
    pub const RETRY: Self = Self(4);
    pub const REDO: Self = Self(5);
    pub const RAISE: Self = Self(6);
    pub const THROW: Self = Self(7);
    pub const FATAL: Self = Self(8);

    pub fn is_ok(self) -> bool {
        self == Self::NONE
    }
}

/// Result of any primitive that may exit non-locally.
pub type Flow<T> = Result<T, Unwind>;
