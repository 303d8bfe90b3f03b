//! Registry of named workers.
//!
//! A [`Registry`] validates registrations, starts one [`WorkerHandle`] per
//! name and hands out [`Callable`]s bound to those handles. Entries disappear
//! on their own when a worker stops for any reason.

use crate::config::{RegistryConfig, WorkerConfig};
use crate::error::{ForkError, Result};
use crate::module::resolve_module;
use crate::port::get_port;
use crate::worker::WorkerHandle;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, info, instrument};

struct Entry {
    generation: u64,
    handle: Arc<WorkerHandle>,
}

type WorkerMap = Mutex<BTreeMap<String, Entry>>;

fn lock_map(map: &WorkerMap) -> MutexGuard<'_, BTreeMap<String, Entry>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A worker's invocation endpoint.
///
/// Bound to the handle that existed when it was obtained: after that worker
/// stops, calls fail with `WorkerNotActive` even if the name was registered
/// again.
#[derive(Clone)]
pub struct Callable {
    handle: Arc<WorkerHandle>,
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callable")
            .field("name", &self.handle.name())
            .field("state", &self.handle.state())
            .finish()
    }
}

impl Callable {
    /// Invoke the worker's handler with positional arguments.
    pub async fn call(&self, args: Vec<Value>) -> Result<Value> {
        self.handle.invoke(args).await
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn target_path(&self) -> &Path {
        self.handle.target_path()
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.pid()
    }

    /// Debug port assigned to the worker, if any.
    pub fn debug_port(&self) -> Option<u16> {
        self.handle.config().debug_port
    }

    pub fn is_active(&self) -> bool {
        self.handle.is_active()
    }

    /// The underlying worker handle.
    pub fn handle(&self) -> &Arc<WorkerHandle> {
        &self.handle
    }
}

/// Owned set of active workers, keyed by name.
pub struct Registry {
    config: Arc<RegistryConfig>,
    workers: Arc<WorkerMap>,
    generations: AtomicU64,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("config", &self.config)
            .field("workers", &self.names())
            .finish()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl Registry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config: Arc::new(config),
            workers: Arc::new(Mutex::new(BTreeMap::new())),
            generations: AtomicU64::new(0),
        }
    }

    /// Registry using the default configuration plus environment overrides.
    pub fn from_env() -> Self {
        Self::new(RegistryConfig::default().with_env_overrides())
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register a worker for the module at `path`.
    ///
    /// Validates the name, the path and the config, spawns the worker and
    /// waits for its bootstrap report. A worker already registered under
    /// `name` is replaced and stopped.
    pub async fn register(
        &self,
        name: &str,
        path: &Path,
        config: Option<WorkerConfig>,
    ) -> Result<Callable> {
        if name.is_empty() {
            return Err(ForkError::NameNotAString {
                name: Value::String(String::new()),
            });
        }
        let path_str = path.to_str().ok_or_else(|| ForkError::PathNotAString {
            path: Value::String(path.to_string_lossy().into_owned()),
        })?;
        let target = check_target(path_str)?;
        let config = config.unwrap_or_default();
        config.validate()?;

        self.launch(name.to_string(), target, config).await
    }

    /// Register a worker from untyped inputs.
    ///
    /// Same pipeline as [`Registry::register`], with the type checks applied
    /// to the JSON values: `name` and `path` must be strings and `config`, if
    /// given, an object.
    pub async fn register_value(
        &self,
        name: &Value,
        path: &Value,
        config: Option<&Value>,
    ) -> Result<Callable> {
        let name = match name.as_str() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => return Err(ForkError::NameNotAString { name: name.clone() }),
        };
        let path_str = path
            .as_str()
            .ok_or_else(|| ForkError::PathNotAString { path: path.clone() })?;
        let target = check_target(path_str)?;
        let config = match config {
            Some(value) => WorkerConfig::from_value(value)?,
            None => WorkerConfig::default(),
        };

        self.launch(name, target, config).await
    }

    #[instrument(skip(self, target, config), fields(path = %target.display()))]
    async fn launch(&self, name: String, target: PathBuf, mut config: WorkerConfig) -> Result<Callable> {
        if config.debug_port.is_none() && self.config.debug_mode.is_active() {
            let port = get_port().await?;
            debug!(port, "Assigning worker debug port");
            config.debug_port = Some(port);
        }

        let handle = WorkerHandle::new(name.clone(), target, config, Arc::clone(&self.config));
        handle.start().await?;

        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let replaced = {
            let mut workers = lock_map(&self.workers);
            handle.set_stop_hook(remove_on_stop(&self.workers, name.clone(), generation));
            // The hook only fires for stops that happen after it is installed.
            if !handle.is_active() {
                return Err(ForkError::WorkerNotActive(name));
            }
            workers.insert(
                name.clone(),
                Entry {
                    generation,
                    handle: Arc::clone(&handle),
                },
            )
        };

        if let Some(old) = replaced {
            debug!(worker = %name, "Replacing previously registered worker");
            old.handle.stop();
        }

        info!(worker = %name, pid = ?handle.pid(), "Worker registered");
        Ok(Callable { handle })
    }

    /// Look up the active worker registered under `name`.
    ///
    /// An empty name is rejected with `NameNotAString` rather than treated as
    /// a request for every worker; use [`Registry::get_all`] for that.
    pub fn get(&self, name: &str) -> Result<Callable> {
        if name.is_empty() {
            return Err(ForkError::NameNotAString {
                name: Value::String(String::new()),
            });
        }
        lock_map(&self.workers)
            .get(name)
            .map(|entry| Callable {
                handle: Arc::clone(&entry.handle),
            })
            .ok_or_else(|| ForkError::ForkNotFound {
                fork: name.to_string(),
            })
    }

    /// Snapshot of every active worker.
    pub fn get_all(&self) -> BTreeMap<String, Callable> {
        lock_map(&self.workers)
            .iter()
            .map(|(name, entry)| {
                (
                    name.clone(),
                    Callable {
                        handle: Arc::clone(&entry.handle),
                    },
                )
            })
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        lock_map(&self.workers).keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock_map(&self.workers).len()
    }

    pub fn is_empty(&self) -> bool {
        lock_map(&self.workers).is_empty()
    }

    /// Request termination of every active worker. Idempotent.
    ///
    /// Returns without waiting for the processes to exit; see
    /// [`Registry::shutdown`].
    pub fn stop(&self) {
        for handle in self.drain() {
            handle.stop();
        }
    }

    /// Stop every active worker and wait until each process has been reaped.
    pub async fn shutdown(&self) {
        let handles = self.drain();
        for handle in &handles {
            handle.stop();
        }
        for handle in &handles {
            handle.wait_exited().await;
        }
    }

    fn drain(&self) -> Vec<Arc<WorkerHandle>> {
        let workers = std::mem::take(&mut *lock_map(&self.workers));
        if !workers.is_empty() {
            debug!(count = workers.len(), "Stopping workers");
        }
        workers.into_values().map(|entry| entry.handle).collect()
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Path-type, absoluteness and module checks, in that order.
fn check_target(path: &str) -> Result<PathBuf> {
    let target = PathBuf::from(path);
    if !target.is_absolute() {
        return Err(ForkError::PathNotAbsolute {
            path: path.to_string(),
        });
    }
    if resolve_module(&target).is_none() {
        return Err(ForkError::ModuleNotFound {
            path: path.to_string(),
        });
    }
    Ok(target)
}

/// Stop hook removing `name` from the map, unless it was re-registered since.
fn remove_on_stop(workers: &Arc<WorkerMap>, name: String, generation: u64) -> Box<dyn FnOnce() + Send> {
    let workers: Weak<WorkerMap> = Arc::downgrade(workers);
    Box::new(move || {
        let Some(workers) = workers.upgrade() else {
            return;
        };
        let mut workers = lock_map(&workers);
        if workers
            .get(&name)
            .is_some_and(|entry| entry.generation == generation)
        {
            workers.remove(&name);
            debug!(worker = %name, "Worker removed from registry");
        }
    })
}
