use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;

/// Why a single task attempt did not produce a value.
///
/// Every variant is plain data, so a `TaskError` can always be serialized and
/// moved across the execution boundary, no matter what the task itself raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskError {
    /// The task returned an error of its own.
    #[error("{error_type}: {message}")]
    Application {
        /// Short type name of the raised error (e.g. `NameError`).
        error_type: String,
        /// `Display` rendering of the raised error.
        message: String,
        /// Serialized form of the raised error.
        #[serde(default)]
        payload: serde_json::Value,
    },

    /// The worker running the task died before reporting an outcome.
    #[error("AbnormalTermination: {message}")]
    AbnormalTermination {
        /// What the backend observed.
        message: String,
    },

    /// The task ran longer than it was allowed to.
    #[error("Timeout: {message}")]
    Timeout {
        /// Which deadline was exceeded.
        message: String,
    },

    /// The task returned a value that cannot cross the execution boundary.
    #[error("NonSerializableResult: {reason}")]
    NonSerializableResult {
        /// Serializer diagnostic.
        reason: String,
    },

    /// The task returned an error that cannot cross the execution boundary.
    #[error("NonSerializableError: {error_type}: {message} ({reason})")]
    NonSerializableError {
        /// Short type name of the raised error.
        error_type: String,
        /// `Display` rendering of the raised error.
        message: String,
        /// Serializer diagnostic.
        reason: String,
    },
}

impl TaskError {
    /// Build an application error from its parts.
    pub fn application(
        error_type: impl Into<String>,
        message: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::Application {
            error_type: error_type.into(),
            message: message.into(),
            payload,
        }
    }

    /// The worker died (panicked, was killed, exited).
    pub fn abnormal_termination(message: impl Into<String>) -> Self {
        Self::AbnormalTermination {
            message: message.into(),
        }
    }

    /// A deadline was exceeded.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Name used to match errors in retry predicates and reports.
    ///
    /// For application errors this is the raised error's type name; for
    /// the infrastructure variants it is the variant name.
    pub fn error_type(&self) -> &str {
        match self {
            Self::Application { error_type, .. } => error_type,
            Self::NonSerializableError { .. } => "NonSerializableError",
            Self::AbnormalTermination { .. } => "AbnormalTermination",
            Self::Timeout { .. } => "Timeout",
            Self::NonSerializableResult { .. } => "NonSerializableResult",
        }
    }
}

/// A [`TaskError`] paired with the diagnostic trace collected where it was raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// The error itself.
    pub error: TaskError,
    /// Human-readable trace: error source chain plus where it was observed.
    pub trace: String,
}

impl TaskFailure {
    /// Pair an error with a trace.
    pub fn new(error: TaskError, trace: impl Into<String>) -> Self {
        Self {
            error,
            trace: trace.into(),
        }
    }

    /// Append one line of context to the trace.
    pub fn with_context(mut self, context: impl AsRef<str>) -> Self {
        if !self.trace.is_empty() {
            self.trace.push('\n');
        }
        self.trace.push_str(context.as_ref());
        self
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

/// Last path segment of a type name, without generic arguments.
///
/// `my_crate::errors::NameError` becomes `NameError`.
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Render an error and its whole `source()` chain, one cause per line.
pub fn error_chain(err: &dyn Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str("\ncaused by: ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("outer failure")]
    struct Outer {
        #[source]
        inner: std::io::Error,
    }

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name::<std::io::Error>(), "Error");
        assert_eq!(short_type_name::<Vec<String>>(), "Vec");
        assert_eq!(short_type_name::<Outer>(), "Outer");
    }

    #[test]
    fn test_error_chain_includes_sources() {
        let err = Outer {
            inner: std::io::Error::new(std::io::ErrorKind::Other, "disk gone"),
        };
        let chain = error_chain(&err);
        assert_eq!(chain, "outer failure\ncaused by: disk gone");
    }

    #[test]
    fn test_error_type_names() {
        let app = TaskError::application("NameError", "Rand Error", serde_json::Value::Null);
        assert_eq!(app.error_type(), "NameError");
        assert_eq!(app.to_string(), "NameError: Rand Error");
        assert_eq!(TaskError::timeout("x").error_type(), "Timeout");
        assert_eq!(
            TaskError::abnormal_termination("x").error_type(),
            "AbnormalTermination"
        );
    }

    #[test]
    fn test_task_error_is_tagged_by_kind() {
        let json = serde_json::to_value(TaskError::timeout("Unrecoverable timeout")).unwrap();
        assert_eq!(json["kind"], "timeout");
        assert_eq!(json["message"], "Unrecoverable timeout");
    }

    #[test]
    fn test_failure_context_appends_lines() {
        let failure = TaskFailure::new(TaskError::timeout("t"), "")
            .with_context("attempt 1")
            .with_context("worker 3");
        assert_eq!(failure.trace, "attempt 1\nworker 3");
        assert_eq!(failure.to_string(), "Timeout: t");
    }
}
