//! Module resolution and handler loading.
//!
//! A module is a JSON document on disk that names the handler a worker should
//! expose:
//!
//! ```json
//! { "handler": "echo", "options": { "greeting": "hi" } }
//! ```
//!
//! Handlers themselves are compiled into the worker program and collected in
//! a [`HandlerTable`]. Loading a module looks its `handler` up in that table;
//! a document that names nothing the table knows is a non-invocable export.

use crate::error::{ForkError, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

/// Future returned by a handler invocation.
pub type HandlerFuture = Pin<Box<dyn Future<Output = std::result::Result<Value, Value>> + Send>>;

/// A callable exposed by a worker.
///
/// `params` are the positional arguments of the request; `options` is the
/// module document's `options` value (null when absent).
pub trait Handler: Send + Sync {
    fn call(&self, params: Vec<Value>, options: &Value) -> HandlerFuture;
}

struct SyncHandler<F>(F);

impl<F> Handler for SyncHandler<F>
where
    F: Fn(Vec<Value>, &Value) -> std::result::Result<Value, Value> + Send + Sync,
{
    fn call(&self, params: Vec<Value>, options: &Value) -> HandlerFuture {
        let outcome = (self.0)(params, options);
        Box::pin(std::future::ready(outcome))
    }
}

struct AsyncHandler<F>(F);

impl<F, Fut> Handler for AsyncHandler<F>
where
    F: Fn(Vec<Value>, Value) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Value, Value>> + Send + 'static,
{
    fn call(&self, params: Vec<Value>, options: &Value) -> HandlerFuture {
        Box::pin((self.0)(params, options.clone()))
    }
}

/// Named handlers compiled into a worker program.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: BTreeMap<String, Arc<dyn Handler>>,
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler object.
    pub fn register(mut self, name: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    /// Register a synchronous function.
    pub fn sync<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>, &Value) -> std::result::Result<Value, Value> + Send + Sync + 'static,
    {
        self.register(name, Arc::new(SyncHandler(f)))
    }

    /// Register an async function.
    pub fn asynchronous<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, Value>> + Send + 'static,
    {
        self.register(name, Arc::new(AsyncHandler(f)))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// `path` with `.json` appended to its file name (`echo.v2` -> `echo.v2.json`).
fn with_json_extension(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".json");
    PathBuf::from(name)
}

/// Resolve a module path to the document that backs it.
///
/// Tries the path itself, then the path with `.json` appended, then
/// `index.json` inside it.
pub fn resolve_module(path: &Path) -> Option<PathBuf> {
    let candidates = [
        path.to_path_buf(),
        with_json_extension(path),
        path.join("index.json"),
    ];
    candidates.into_iter().find(|candidate| candidate.is_file())
}

/// A handler bound to the options of the module that named it.
#[derive(Clone)]
pub struct LoadedModule {
    pub path: PathBuf,
    pub handler_name: String,
    handler: Arc<dyn Handler>,
    options: Value,
}

impl fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModule")
            .field("path", &self.path)
            .field("handler_name", &self.handler_name)
            .field("options", &self.options)
            .finish()
    }
}

impl LoadedModule {
    /// Invoke the handler.
    pub fn call(&self, params: Vec<Value>) -> HandlerFuture {
        self.handler.call(params, &self.options)
    }
}

/// Load the module at `path` and bind its handler from `table`.
///
/// Fails with `ModuleNotFound` when the path does not resolve,
/// `ModuleLoadFailed` when the document cannot be read or parsed, and
/// `NotAFunction` when it does not name a known handler.
pub fn load_module(path: &Path, table: &HandlerTable) -> Result<LoadedModule> {
    let display = path.display().to_string();
    let resolved = resolve_module(path).ok_or_else(|| ForkError::ModuleNotFound {
        path: display.clone(),
    })?;

    let load_failed = |reason: String| ForkError::ModuleLoadFailed {
        path: display.clone(),
        reason,
    };
    let text = std::fs::read_to_string(&resolved).map_err(|e| load_failed(e.to_string()))?;
    let document: Value = serde_json::from_str(&text).map_err(|e| load_failed(e.to_string()))?;

    let not_a_function = || ForkError::NotAFunction {
        path: display.clone(),
    };
    let handler_name = document
        .get("handler")
        .and_then(Value::as_str)
        .ok_or_else(not_a_function)?;
    let handler = table.get(handler_name).ok_or_else(not_a_function)?;

    Ok(LoadedModule {
        path: resolved,
        handler_name: handler_name.to_string(),
        handler,
        options: document.get("options").cloned().unwrap_or(Value::Null),
    })
}
