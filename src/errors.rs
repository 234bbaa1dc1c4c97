//! Failure classification and the wire error shape.
//!
//! Every failure the runtime reports is reduced to a [`ReportableError`]
//! (`errorType` / `errorMessage` / `trace`). Conversion must never panic,
//! even for error values whose `Display` impl does.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::Serialize;
use thiserror::Error;

/// Failure classes with a fixed wire `errorType` string.
#[derive(Debug, Error)]
pub enum RuntimeErrorKind {
    #[error("cannot load handler module: {0}")]
    ImportModule(String),
    #[error("handler not found: {0}")]
    HandlerNotFound(String),
    #[error("malformed handler name: {0}")]
    MalformedHandlerName(String),
    #[error("handler code failed to parse: {0}")]
    UserCodeSyntax(String),
    #[error("streaming handler misbehaved: {0}")]
    MalformedStreamingHandler(String),
    #[error("invalid streaming operation: {0}")]
    InvalidStreamingOperation(String),
    #[error("unhandled background failure: {0}")]
    UnhandledRejection(String),
}

impl RuntimeErrorKind {
    pub fn error_type(&self) -> &'static str {
        match self {
            RuntimeErrorKind::ImportModule(_) => "ImportModuleError",
            RuntimeErrorKind::HandlerNotFound(_) => "HandlerNotFound",
            RuntimeErrorKind::MalformedHandlerName(_) => "MalformedHandlerName",
            RuntimeErrorKind::UserCodeSyntax(_) => "UserCodeSyntaxError",
            RuntimeErrorKind::MalformedStreamingHandler(_) => "MalformedStreamingHandler",
            RuntimeErrorKind::InvalidStreamingOperation(_) => "InvalidStreamingOperation",
            RuntimeErrorKind::UnhandledRejection(_) => "UnhandledPromiseRejection",
        }
    }

    pub fn to_reportable(&self) -> ReportableError {
        ReportableError::new(self.error_type(), self.to_string())
    }
}

/// Wire shape posted to the control plane for any failure.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ReportableError {
    #[serde(rename = "errorType")]
    pub error_type: String,
    #[serde(rename = "errorMessage")]
    pub error_message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub trace: Vec<String>,
}

impl ReportableError {
    /// Both fields are control-character escaped at construction so every
    /// path out of this module is wire-safe.
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: escape_control(&error_type.into()),
            error_message: escape_control(&message.into()),
            trace: Vec::new(),
        }
    }

    pub fn with_trace(mut self, trace: Vec<String>) -> Self {
        self.trace = trace.into_iter().map(|l| escape_control(&l)).collect();
        self
    }

    /// Fixed fallback for error values that cannot be rendered at all.
    pub fn handled() -> Self {
        Self {
            error_type: "handled".to_string(),
            error_message: "error formatting failed while reporting".to_string(),
            trace: Vec::new(),
        }
    }

    /// Render any displayable value, guarding against `Display` impls that
    /// panic. This path never panics.
    pub fn from_display(value: &dyn fmt::Display) -> Self {
        match catch_unwind(AssertUnwindSafe(|| value.to_string())) {
            Ok(message) => Self::new("Error", message),
            Err(_) => Self::handled(),
        }
    }

    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "handler panicked".to_string());
        Self::new("Error", message)
    }
}

impl fmt::Display for ReportableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.error_message)
    }
}

impl std::error::Error for ReportableError {}

/// Reduce an `anyhow::Error` to the wire shape. A `ReportableError` or
/// [`RuntimeErrorKind`] anywhere at the top of the chain keeps its type;
/// anything else becomes the generic `Error` type with the cause chain as
/// the trace.
pub fn to_reportable(err: &anyhow::Error) -> ReportableError {
    if let Some(reportable) = err.downcast_ref::<ReportableError>() {
        return reportable.clone();
    }
    if let Some(kind) = err.downcast_ref::<RuntimeErrorKind>() {
        return kind.to_reportable();
    }

    let rendered = catch_unwind(AssertUnwindSafe(|| {
        let trace: Vec<String> = err.chain().map(|cause| cause.to_string()).collect();
        let message = trace.first().cloned().unwrap_or_default();
        (message, trace)
    }));
    match rendered {
        Ok((message, trace)) => ReportableError::new("Error", message).with_trace(trace),
        Err(_) => ReportableError::handled(),
    }
}

/// DEL (`0x7F`) breaks the control plane's header parsing; escape it the way
/// the protocol expects.
pub fn escape_control(value: &str) -> String {
    value.replace('\u{7f}', "%7F")
}

/// A condition that cannot be resolved within one invocation. The process
/// terminates with `exit_code` after a best-effort report.
#[derive(Debug)]
pub struct Fatal {
    pub error: ReportableError,
    pub exit_code: i32,
}

impl Fatal {
    /// Error escaping an invocation's handling, or a failed report.
    pub const EXIT_UNCAUGHT: i32 = 129;
    /// Unhandled failure in background work.
    pub const EXIT_BACKGROUND: i32 = 128;

    pub fn uncaught(error: ReportableError) -> Self {
        Self {
            error,
            exit_code: Self::EXIT_UNCAUGHT,
        }
    }

    pub fn background(error: ReportableError) -> Self {
        Self {
            error,
            exit_code: Self::EXIT_BACKGROUND,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_fixed_wire_strings() {
        assert_eq!(
            RuntimeErrorKind::ImportModule("m".into()).error_type(),
            "ImportModuleError"
        );
        assert_eq!(
            RuntimeErrorKind::MalformedStreamingHandler("h".into()).error_type(),
            "MalformedStreamingHandler"
        );
        assert_eq!(
            RuntimeErrorKind::InvalidStreamingOperation("op".into()).error_type(),
            "InvalidStreamingOperation"
        );
        assert_eq!(
            RuntimeErrorKind::UnhandledRejection("r".into()).error_type(),
            "UnhandledPromiseRejection"
        );
    }

    #[test]
    fn serializes_with_camel_case_keys() {
        let err = ReportableError::new("RangeError", "bad");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["errorType"], "RangeError");
        assert_eq!(json["errorMessage"], "bad");
        assert!(json.get("trace").is_none());

        let err = err.with_trace(vec!["a".into(), "b".into()]);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["trace"], serde_json::json!(["a", "b"]));
    }

    #[test]
    fn escapes_delete_character() {
        let err = ReportableError::new("Bad\u{7f}Type", "msg\u{7f}");
        assert_eq!(err.error_type, "Bad%7FType");
        assert_eq!(err.error_message, "msg%7F");
    }

    #[test]
    fn anyhow_chain_becomes_trace() {
        let err = anyhow::anyhow!("root cause")
            .context("middle")
            .context("outer");
        let reportable = to_reportable(&err);
        assert_eq!(reportable.error_type, "Error");
        assert_eq!(reportable.error_message, "outer");
        assert_eq!(reportable.trace, vec!["outer", "middle", "root cause"]);
    }

    #[test]
    fn downcast_keeps_reportable_identity() {
        let err = anyhow::Error::new(ReportableError::new("RangeError", "bad"));
        let reportable = to_reportable(&err);
        assert_eq!(reportable.error_type, "RangeError");
        assert_eq!(reportable.error_message, "bad");
    }

    struct Hostile;

    impl fmt::Display for Hostile {
        fn fmt(&self, _f: &mut fmt::Formatter<'_>) -> fmt::Result {
            panic!("hostile accessor")
        }
    }

    #[test]
    fn hostile_display_falls_back_without_panicking() {
        let reportable = ReportableError::from_display(&Hostile);
        assert_eq!(reportable.error_type, "handled");
        assert!(!reportable.error_message.is_empty());
    }

    #[test]
    fn panic_payload_is_rendered() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(
            ReportableError::from_panic(payload.as_ref()).error_message,
            "boom"
        );

        let payload: Box<dyn Any + Send> = Box::new(format!("boom {}", 2));
        assert_eq!(
            ReportableError::from_panic(payload.as_ref()).error_message,
            "boom 2"
        );
    }
}
