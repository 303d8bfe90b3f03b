//! IPC protocol for worker subprocess communication.
//!
//! Messages are JSON-serialized and newline-delimited. The parent writes
//! [`Request`]s to the worker's stdin; the worker writes [`Response`]s to its
//! stdout. The first response a worker writes is its bootstrap report.

use crate::error::{ErrorKind, ForkError};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Method name of a successful bootstrap report.
pub const READY_METHOD: &str = "ready";

/// Request from parent to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id, echoed back by the worker.
    pub id: u64,
    /// Positional arguments for the handler.
    #[serde(default)]
    pub params: Vec<Value>,
    /// Originating method name, echoed back for diagnostics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

/// Response (or bootstrap report) from worker to parent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

/// Falsy error payloads do not count as failures.
fn is_empty_error(error: &Value) -> bool {
    match error {
        Value::Null | Value::Bool(false) => true,
        Value::String(s) => s.is_empty(),
        Value::Number(n) => n.as_f64() == Some(0.0),
        _ => false,
    }
}

impl Request {
    /// Create a request.
    pub fn new(id: u64, params: Vec<Value>, method: Option<String>) -> Self {
        Self { id, params, method }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim())
    }
}

impl Response {
    /// Successful reply to a request.
    pub fn success(id: u64, method: Option<String>, result: Value) -> Self {
        Self {
            id: Some(id),
            method,
            result: Some(result),
            error: None,
        }
    }

    /// Failed reply to a request.
    pub fn failure(id: u64, method: Option<String>, error: Value) -> Self {
        Self {
            id: Some(id),
            method,
            result: None,
            error: Some(error),
        }
    }

    /// Bootstrap report of a worker that loaded its handler.
    pub fn ready(name: &str, pid: u32) -> Self {
        Self {
            method: Some(READY_METHOD.to_string()),
            result: Some(json!({ "name": name, "pid": pid })),
            ..Self::default()
        }
    }

    /// Bootstrap report of a worker that could not load its handler.
    pub fn bootstrap_failure(error: &ForkError) -> Self {
        Self {
            method: error.kind().map(|kind| kind.as_str().to_string()),
            error: Some(json!({ "params": error.params() })),
            ..Self::default()
        }
    }

    /// Whether this message carries a non-empty error.
    pub fn is_error(&self) -> bool {
        self.error.as_ref().is_some_and(|e| !is_empty_error(e))
    }

    /// Interpret a bootstrap report.
    ///
    /// Returns the typed error when the report carries an error whose method
    /// names a known error kind; any other first message means success.
    pub fn bootstrap_error(&self) -> Option<ForkError> {
        if !self.is_error() {
            return None;
        }
        let kind: ErrorKind = self.method.as_deref()?.parse().ok()?;
        let params = self
            .error
            .as_ref()
            .and_then(|e| e.get("params"))
            .cloned()
            .unwrap_or(Value::Null);
        Some(ForkError::rehydrate(kind, &params))
    }

    /// Consume a reply into its outcome. A non-empty error takes precedence.
    pub fn into_outcome(self) -> Result<Value, Value> {
        if self.is_error() {
            Err(self.error.unwrap_or(Value::Null))
        } else {
            Ok(self.result.unwrap_or(Value::Null))
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_line_shape() {
        let req = Request::new(7, vec![json!(123), json!("x")], None);
        let line = req.to_line().unwrap();
        assert!(line.ends_with('\n'));
        assert!(!line.contains("method"));

        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value, json!({ "id": 7, "params": [123, "x"] }));
    }

    #[test]
    fn test_request_params_default_to_empty() {
        let req = Request::from_line(r#"{"id": 3}"#).unwrap();
        assert_eq!(req.id, 3);
        assert!(req.params.is_empty());
        assert!(Request::from_line(r#"{"params": []}"#).is_err());
    }

    #[test]
    fn test_success_outcome() {
        let resp = Response::success(1, None, json!({ "response": "ok" }));
        assert_eq!(resp.into_outcome(), Ok(json!({ "response": "ok" })));

        // `"result": null` deserializes to None and settles as null.
        let line = Response::success(2, None, Value::Null).to_line().unwrap();
        let parsed = Response::from_line(&line).unwrap();
        assert_eq!(parsed.id, Some(2));
        assert_eq!(parsed.into_outcome(), Ok(Value::Null));
    }

    #[test]
    fn test_error_takes_precedence() {
        let resp = Response {
            id: Some(1),
            result: Some(json!(1)),
            error: Some(json!({ "message": "boom" })),
            ..Response::default()
        };
        assert_eq!(resp.into_outcome(), Err(json!({ "message": "boom" })));
    }

    #[test]
    fn test_falsy_error_is_ignored() {
        for empty in [Value::Null, json!(false), json!(""), json!(0)] {
            let resp = Response {
                id: Some(1),
                result: Some(json!("fine")),
                error: Some(empty),
                ..Response::default()
            };
            assert!(!resp.is_error());
            assert_eq!(resp.into_outcome(), Ok(json!("fine")));
        }
    }

    #[test]
    fn test_ready_is_not_a_bootstrap_error() {
        let resp = Response::ready("worker", 42);
        assert!(resp.bootstrap_error().is_none());
        assert_eq!(resp.method.as_deref(), Some(READY_METHOD));
    }

    #[test]
    fn test_bootstrap_failure_roundtrip() {
        let err = ForkError::NotAFunction {
            path: "/m/wrong.json".into(),
        };
        let line = Response::bootstrap_failure(&err).to_line().unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(
            value,
            json!({ "method": "notAFunction", "error": { "params": { "path": "/m/wrong.json" } } })
        );

        let parsed = Response::from_line(&line).unwrap();
        match parsed.bootstrap_error() {
            Some(ForkError::NotAFunction { path }) => assert_eq!(path, "/m/wrong.json"),
            other => panic!("Expected NotAFunction, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_method_error_is_not_a_bootstrap_failure() {
        let resp = Response {
            method: Some("somethingElse".into()),
            error: Some(json!("x")),
            ..Response::default()
        };
        assert!(resp.bootstrap_error().is_none());
    }
}
