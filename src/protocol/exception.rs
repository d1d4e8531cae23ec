use std::error::Error;

use serde::{Deserialize, Serialize};

/// Sanitized form of a failure raised inside the target process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    pub message: String,
    pub exception_type: Option<String>,
    pub source: Option<String>,
    pub stack_trace: Option<String>,
    pub help_link: Option<String>,
}

impl ExceptionInfo {
    /// Record of an expected failure: only the message survives.
    pub fn information(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    /// Sanitizes an error raised while executing a request.
    ///
    /// [`InformationError`]s keep their message only. Any other error is reduced to its innermost
    /// cause.
    pub fn from_error(error: &(dyn Error + 'static)) -> Self {
        if let Some(information) = error.downcast_ref::<InformationError>() {
            return Self::information(information.message());
        }

        let mut innermost = error;
        while let Some(cause) = innermost.source() {
            innermost = cause;
        }

        Self {
            message: innermost.to_string(),
            ..Default::default()
        }
    }

    /// Sets the full name of the exception type.
    pub fn with_exception_type(mut self, exception_type: impl Into<String>) -> Self {
        self.exception_type = Some(exception_type.into());
        self
    }

    /// Sets what raised the failure, usually `Type.Operation`.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Sets the stack trace captured where the failure was raised.
    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = Some(stack_trace.into());
        self
    }

    /// Sets the help link.
    pub fn with_help_link(mut self, help_link: impl Into<String>) -> Self {
        self.help_link = Some(help_link.into());
        self
    }

    /// Whether type, source and stack were stripped.
    pub fn is_information(&self) -> bool {
        self.exception_type.is_none() && self.source.is_none() && self.stack_trace.is_none()
    }
}

/// Expected, control-flow style failure of an executor.
///
/// It crosses the boundary with its message only.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct InformationError(String);

impl InformationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("outer failure")]
    struct Outer(#[source] Inner);

    #[derive(Debug, thiserror::Error)]
    #[error("inner failure")]
    struct Inner;

    #[test]
    fn test_from_error_walks_to_innermost_cause() {
        let info = ExceptionInfo::from_error(&Outer(Inner));
        assert_eq!(info.message, "inner failure");
    }

    #[test]
    fn test_information_keeps_message_only() {
        let info = ExceptionInfo::from_error(&InformationError::new("no such operation"));
        assert_eq!(info.message, "no such operation");
        assert_eq!(info.exception_type, None);
        assert_eq!(info.stack_trace, None);
        assert!(info.is_information());
    }
}
