//! Error types.
//!
//! [`Error`] separates caller misuse (detected before anything is sent), failures raised inside
//! the target process ([`FriendlyOperationException`]) and transport failures
//! ([`TransportError`]), which are passed through untouched.

use std::fmt;

use crate::protocol::ExceptionInfo;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Out-of-band argument kinds that may appear at most once in an argument list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Async,
    OperationTypeInfo,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Async => f.write_str("Async token"),
            TokenKind::OperationTypeInfo => f.write_str("OperationTypeInfo"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid static operation `{0}`: expected `Namespace.Type.Operation`")]
    InvalidStaticOperation(String),

    #[error("{0} must not be empty")]
    EmptyName(&'static str),

    #[error("invalid operation type info: {0}")]
    InvalidTypeInfo(&'static str),

    #[error("argument {index}: expected a value but received a type reference (`{type_name}`)")]
    TypeReferenceArgument { index: usize, type_name: String },

    #[error("argument {index}: the variable belongs to a different connection")]
    DifferentConnection { index: usize },

    #[error("more than one {0} in the argument list")]
    DuplicateArgument(TokenKind),

    #[error("an {0} cannot be used here")]
    UnexpectedToken(TokenKind),

    #[error("construction cannot be asynchronous")]
    AsyncConstruction,

    #[error("the Async token is already bound or completed")]
    AsyncAlreadyUsed,

    #[error("the Async token cannot be marked completed once used or completed")]
    InvalidCompletion,

    #[error("the remote variable has been released")]
    Released,

    #[error("the variable holds a plain value returned by the target process, not a handle")]
    NoHandle,

    #[error("unexpected response: expected {0}")]
    UnexpectedResponse(&'static str),

    #[error(transparent)]
    Remote(#[from] FriendlyOperationException),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure of the channel to the target process.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection to the target process is closed")]
    Disconnected,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Failure raised while executing an operation inside the target process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendlyOperationException {
    info: ExceptionInfo,
}

impl FriendlyOperationException {
    /// Wraps the record received from the target process.
    pub fn new(info: ExceptionInfo) -> Self {
        Self { info }
    }

    pub fn info(&self) -> &ExceptionInfo {
        &self.info
    }

    pub fn message(&self) -> &str {
        &self.info.message
    }

    pub fn into_info(self) -> ExceptionInfo {
        self.info
    }
}

impl fmt::Display for FriendlyOperationException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let info = &self.info;
        let stack_trace = match info.stack_trace.as_deref() {
            Some(stack_trace) if !stack_trace.is_empty() => stack_trace,
            _ => return f.write_str(&info.message),
        };
        write!(
            f,
            "{}\nExceptionType: {}\nSource: {}\nStackTrace:\n{}\nHelpLink: {}",
            info.message,
            info.exception_type.as_deref().unwrap_or_default(),
            info.source.as_deref().unwrap_or_default(),
            stack_trace,
            info.help_link.as_deref().unwrap_or_default(),
        )
    }
}

impl std::error::Error for FriendlyOperationException {}
