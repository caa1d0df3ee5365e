//! Error types for orchestration runs.
//!
//! Errors are grouped into categories so callers can tell a bad manifest
//! (abort before touching anything) from a failing external tool (abort the
//! unit and its dependents) or an engine bug.

use std::path::PathBuf;
use thiserror::Error;

/// Categories of orchestration errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid or inconsistent project configuration
    Configuration,
    /// The state lock is held by someone else
    LockContention,
    /// An external tool or hook failed
    ExternalTool,
    /// Persisted state could not be read or written
    State,
    /// A backend does not support the requested operation
    Unsupported,
    /// Engine invariant violated
    Internal,
    /// Filesystem or serialization failure
    Io,
}

impl ErrorCategory {
    /// Whether the error happens before any external side effect.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration)
    }

    /// Get actionable advice for this category.
    pub fn advice(&self) -> &'static str {
        match self {
            Self::Configuration => "Fix the project manifests and run again",
            Self::LockContention => {
                "Wait for the other run to finish, or remove a stale lock with `stackwork state unlock`"
            }
            Self::ExternalTool => "Inspect the tool output above",
            Self::State => "Check the state backend, or restore a state backup",
            Self::Unsupported => "Use a backend that supports this operation",
            Self::Internal => "This is a bug in stackwork, please report it",
            Self::Io => "Check file permissions and disk space",
        }
    }
}

/// Errors that can occur while loading, planning or executing a project.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or missing configuration value.
    #[error("{0}")]
    Config(String),

    /// Two units share the same `stack.unit` key.
    #[error("duplicate unit '{0}'")]
    DuplicateUnit(String),

    /// A dependency points at a unit that does not exist.
    #[error("Error in unit '{source_unit}' dependency, target '{target}' does not exist")]
    MissingDependency { source_unit: String, target: String },

    /// The dependency graph contains a cycle.
    #[error("dependency cycle detected: {path}")]
    DependencyCycle { path: String },

    /// Invalid pre/post hook definition.
    #[error("unit '{unit}': invalid hook: {message}")]
    Hook { unit: String, message: String },

    /// A unit uses a driver type nobody registered.
    #[error("unit '{unit}': unknown unit type '{kind}'")]
    UnknownDriver { unit: String, kind: String },

    /// Stack template could not be rendered.
    #[error("stack '{stack}': template {file}: {message}")]
    Template {
        stack: String,
        file: String,
        message: String,
    },

    /// State lock already exists.
    #[error("state is locked by another process")]
    Locked,

    /// External command failed.
    #[error("{}", format_tool_error(.message, .output))]
    Tool { message: String, output: String },

    /// Persisted state is corrupt or unreadable.
    #[error("load state: {0}")]
    StateLoad(String),

    /// Backend capability missing.
    #[error("{0}")]
    Unsupported(String),

    /// Engine invariant violated.
    #[error("internal error: {0}")]
    Internal(String),

    /// IO error with the offending path.
    #[error("{}: {source}", .path.display())]
    Path {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Build a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Build an internal invariant error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Wrap an IO error with the path it concerns.
    pub fn path(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Path {
            path: path.into(),
            source,
        }
    }

    /// Category of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_)
            | Self::DuplicateUnit(_)
            | Self::MissingDependency { .. }
            | Self::DependencyCycle { .. }
            | Self::Hook { .. }
            | Self::UnknownDriver { .. }
            | Self::Template { .. }
            | Self::Yaml(_) => ErrorCategory::Configuration,
            Self::Locked => ErrorCategory::LockContention,
            Self::Tool { .. } => ErrorCategory::ExternalTool,
            Self::StateLoad(_) => ErrorCategory::State,
            Self::Unsupported(_) => ErrorCategory::Unsupported,
            Self::Internal(_) => ErrorCategory::Internal,
            Self::Path { .. } | Self::Io(_) | Self::Json(_) => ErrorCategory::Io,
        }
    }
}

/// Error output is only appended when it carries more than a stray byte.
fn format_tool_error(message: &str, output: &str) -> String {
    if output.len() > 1 {
        format!("{message}, error output:\n {output}")
    } else {
        message.to_string()
    }
}

/// Result type for orchestration operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_error_appends_output() {
        let err = Error::Tool {
            message: "terraform apply failed".into(),
            output: "Error: bucket exists".into(),
        };
        assert_eq!(
            err.to_string(),
            "terraform apply failed, error output:\n Error: bucket exists"
        );
    }

    #[test]
    fn test_tool_error_skips_trivial_output() {
        let err = Error::Tool {
            message: "exit status 1".into(),
            output: "\n".into(),
        };
        assert_eq!(err.to_string(), "exit status 1");
    }

    #[test]
    fn test_categories() {
        assert!(Error::DuplicateUnit("a.b".into()).category().is_configuration());
        assert_eq!(Error::Locked.category(), ErrorCategory::LockContention);
        assert_eq!(
            Error::internal("bad").category(),
            ErrorCategory::Internal
        );
    }

    #[test]
    fn test_missing_dependency_message() {
        let err = Error::MissingDependency {
            source_unit: "net.subnet".into(),
            target: "net.vpc".into(),
        };
        assert_eq!(
            err.to_string(),
            "Error in unit 'net.subnet' dependency, target 'net.vpc' does not exist"
        );
    }
}
