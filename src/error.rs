//! Error types for isofork.
//!
//! The first group of variants is the taxonomy shared by both sides of the
//! process boundary. Those kinds travel over the wire by their [`ErrorKind`]
//! name and are rehydrated on the parent side with [`ForkError::rehydrate`].

use serde_json::{Value, json};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::worker::TerminationReason;

/// Main error type for isofork.
#[derive(Error, Debug)]
pub enum ForkError {
    #[error("{name} must be a string")]
    NameNotAString { name: Value },

    #[error("{path} must be a string")]
    PathNotAString { path: Value },

    #[error("{path} must be an absolute path")]
    PathNotAbsolute { path: String },

    #[error("module not found for path {path}")]
    ModuleNotFound { path: String },

    #[error("{config} must be an object")]
    ConfigNotAnObject { config: Value },

    #[error("fork {fork} not found")]
    ForkNotFound { fork: String },

    #[error("module {path} must export a function")]
    NotAFunction { path: String },

    #[error("request timeout")]
    RequestTimeout,

    #[error("module {path} could not be loaded: {reason}")]
    ModuleLoadFailed { path: String, reason: String },

    #[error("Invalid worker config: {0}")]
    InvalidConfig(String),

    #[error("Worker '{0}' terminated before the request settled")]
    WorkerTerminated(String),

    #[error("Worker '{0}' is not active")]
    WorkerNotActive(String),

    #[error("Worker '{name}' {reason} before finishing bootstrap")]
    WorkerExited {
        name: String,
        reason: TerminationReason,
    },

    #[error("Worker '{0}' did not report bootstrap in time")]
    StartupTimeout(String),

    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("Worker channel error: {0}")]
    Transport(String),

    /// Error payload produced by the worker's handler, forwarded as-is.
    #[error("Worker error: {0}")]
    Remote(Value),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for isofork operations.
pub type Result<T> = std::result::Result<T, ForkError>;

/// Named error kinds that may cross the process boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NameNotAString,
    PathNotAString,
    PathNotAbsolute,
    ModuleNotFound,
    ConfigNotAnObject,
    ForkNotFound,
    NotAFunction,
    RequestTimeout,
    ModuleLoadFailed,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 9] = [
        Self::NameNotAString,
        Self::PathNotAString,
        Self::PathNotAbsolute,
        Self::ModuleNotFound,
        Self::ConfigNotAnObject,
        Self::ForkNotFound,
        Self::NotAFunction,
        Self::RequestTimeout,
        Self::ModuleLoadFailed,
    ];

    /// Wire name used as the `method` of a bootstrap report.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NameNotAString => "nameNotAString",
            Self::PathNotAString => "pathNotAString",
            Self::PathNotAbsolute => "pathNotAbsolute",
            Self::ModuleNotFound => "moduleNotFound",
            Self::ConfigNotAnObject => "configNotAnObject",
            Self::ForkNotFound => "forkNotFound",
            Self::NotAFunction => "notAFunction",
            Self::RequestTimeout => "requestTimeout",
            Self::ModuleLoadFailed => "moduleLoadFailed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("Unknown error kind: '{}'", s))
    }
}

/// Read a string parameter, falling back to the JSON rendering of other values.
fn param_str(params: &Value, key: &str) -> String {
    match params.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

impl ForkError {
    /// The taxonomy kind of this error, if it belongs to the shared taxonomy.
    pub fn kind(&self) -> Option<ErrorKind> {
        Some(match self {
            Self::NameNotAString { .. } => ErrorKind::NameNotAString,
            Self::PathNotAString { .. } => ErrorKind::PathNotAString,
            Self::PathNotAbsolute { .. } => ErrorKind::PathNotAbsolute,
            Self::ModuleNotFound { .. } => ErrorKind::ModuleNotFound,
            Self::ConfigNotAnObject { .. } => ErrorKind::ConfigNotAnObject,
            Self::ForkNotFound { .. } => ErrorKind::ForkNotFound,
            Self::NotAFunction { .. } => ErrorKind::NotAFunction,
            Self::RequestTimeout => ErrorKind::RequestTimeout,
            Self::ModuleLoadFailed { .. } => ErrorKind::ModuleLoadFailed,
            _ => return None,
        })
    }

    /// Structured parameters of a taxonomy error, as sent over the wire.
    pub fn params(&self) -> Value {
        match self {
            Self::NameNotAString { name } => json!({ "name": name }),
            Self::PathNotAString { path } => json!({ "path": path }),
            Self::PathNotAbsolute { path }
            | Self::ModuleNotFound { path }
            | Self::NotAFunction { path } => json!({ "path": path }),
            Self::ConfigNotAnObject { config } => json!({ "config": config }),
            Self::ForkNotFound { fork } => json!({ "fork": fork }),
            Self::ModuleLoadFailed { path, reason } => json!({ "path": path, "reason": reason }),
            _ => json!({}),
        }
    }

    /// Rebuild a typed error from its kind and wire parameters.
    pub fn rehydrate(kind: ErrorKind, params: &Value) -> Self {
        match kind {
            ErrorKind::NameNotAString => Self::NameNotAString {
                name: params.get("name").cloned().unwrap_or(Value::Null),
            },
            ErrorKind::PathNotAString => Self::PathNotAString {
                path: params.get("path").cloned().unwrap_or(Value::Null),
            },
            ErrorKind::PathNotAbsolute => Self::PathNotAbsolute {
                path: param_str(params, "path"),
            },
            ErrorKind::ModuleNotFound => Self::ModuleNotFound {
                path: param_str(params, "path"),
            },
            ErrorKind::ConfigNotAnObject => Self::ConfigNotAnObject {
                config: params.get("config").cloned().unwrap_or(Value::Null),
            },
            ErrorKind::ForkNotFound => Self::ForkNotFound {
                fork: param_str(params, "fork"),
            },
            ErrorKind::NotAFunction => Self::NotAFunction {
                path: param_str(params, "path"),
            },
            ErrorKind::RequestTimeout => Self::RequestTimeout,
            ErrorKind::ModuleLoadFailed => Self::ModuleLoadFailed {
                path: param_str(params, "path"),
                reason: param_str(params, "reason"),
            },
        }
    }
}
