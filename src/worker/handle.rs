//! Parent-side handle for one worker process.
//!
//! A [`WorkerHandle`] owns the child process, the request channel and the
//! pending-request table, and drives the lifecycle
//! `Uninitialized -> Starting -> Active -> Stopped`.
//!
//! Two background tasks run per started handle:
//!
//! - the **supervisor** owns the child and its stdout. It interprets the first
//!   message as the bootstrap report, routes every later message to the
//!   pending table, and on stop or exit signals, reaps and classifies the
//!   child.
//! - the **writer** owns the child's stdin and drains the outbox. A write
//!   failure is a fatal transport error and stops the handle.
//!
//! Handle bookkeeping lives behind a mutex that is never held across an await.

use super::ipc::{LineReader, LineWriter};
use super::pending::{Outcome, PendingTable, RequestIds};
use super::protocol::{Request, Response};
use super::signals::{TerminationReason, analyze_exit_status};
use super::spawn::spawn_worker;
use crate::config::{RegistryConfig, WorkerConfig};
use crate::error::{ForkError, Result};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tracing::{Instrument, debug, instrument, trace, warn};

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Uninitialized,
    Starting,
    Active,
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Callback run once when the handle stops.
pub type StopHook = Box<dyn FnOnce() + Send>;

struct Inner {
    state: WorkerState,
    ids: RequestIds,
    pending: PendingTable,
    /// Sender side of the writer task's queue; `None` once stopped.
    outbox: Option<mpsc::UnboundedSender<String>>,
    /// Settles `start()`; taken by whoever decides the bootstrap outcome.
    bootstrap: Option<oneshot::Sender<Result<()>>>,
    pid: Option<u32>,
    supervised: bool,
}

/// Handle to a worker subprocess.
pub struct WorkerHandle {
    name: String,
    target_path: PathBuf,
    config: WorkerConfig,
    registry: Arc<RegistryConfig>,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<WorkerState>,
    exited_tx: watch::Sender<bool>,
    shutdown: Notify,
    on_stop: Mutex<Option<StopHook>>,
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.name)
            .field("target_path", &self.target_path)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

/// Removes an invocation's pending entry if its future is dropped early.
struct PendingGuard<'a> {
    handle: &'a WorkerHandle,
    id: u64,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.handle.lock().pending.remove(self.id) {
            trace!(worker = %self.handle.name, id = self.id, "Invocation abandoned by caller");
        }
    }
}

impl WorkerHandle {
    /// Create an unstarted handle.
    pub fn new(
        name: impl Into<String>,
        target_path: impl Into<PathBuf>,
        config: WorkerConfig,
        registry: Arc<RegistryConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            target_path: target_path.into(),
            config,
            registry,
            inner: Mutex::new(Inner {
                state: WorkerState::Uninitialized,
                ids: RequestIds::default(),
                pending: PendingTable::new(),
                outbox: None,
                bootstrap: None,
                pid: None,
                supervised: false,
            }),
            state_tx: watch::Sender::new(WorkerState::Uninitialized),
            exited_tx: watch::Sender::new(false),
            shutdown: Notify::new(),
            on_stop: Mutex::new(None),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, inner: &mut Inner, state: WorkerState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    /// Install the callback run when this handle stops.
    pub fn set_stop_hook(&self, hook: StopHook) {
        *self.on_stop.lock().unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target_path(&self) -> &Path {
        &self.target_path
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn state(&self) -> WorkerState {
        self.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == WorkerState::Active
    }

    /// OS process id of the worker, once spawned.
    pub fn pid(&self) -> Option<u32> {
        self.lock().pid
    }

    /// Number of invocations currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Spawn the worker and wait for its bootstrap report.
    ///
    /// Returns immediately when already active, and waits for the outcome of
    /// the first call when already starting. On failure the worker is stopped
    /// and reaped before the error is returned.
    #[instrument(skip(self), fields(worker = %self.name))]
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut state_rx = {
            let mut inner = self.lock();
            match inner.state {
                WorkerState::Active => return Ok(()),
                WorkerState::Stopped => return Err(ForkError::WorkerNotActive(self.name.clone())),
                WorkerState::Starting => Some(self.state_tx.subscribe()),
                WorkerState::Uninitialized => {
                    self.set_state(&mut inner, WorkerState::Starting);
                    None
                }
            }
        };

        if let Some(rx) = state_rx.as_mut() {
            let active = rx
                .wait_for(|state| *state != WorkerState::Starting)
                .await
                .is_ok_and(|state| *state == WorkerState::Active);
            return if active {
                Ok(())
            } else {
                Err(ForkError::WorkerNotActive(self.name.clone()))
            };
        }

        let spawned = match spawn_worker(
            &self.registry,
            &self.name,
            &self.target_path,
            self.config.debug_port,
        ) {
            Ok(spawned) => spawned,
            Err(e) => {
                warn!(error = %e, "Failed to spawn worker");
                self.stop();
                return Err(e);
            }
        };

        let pid = spawned.child.id();
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let (bootstrap_tx, bootstrap_rx) = oneshot::channel();
        {
            let mut inner = self.lock();
            if inner.state == WorkerState::Stopped {
                // Stopped while spawning; dropping the child kills it.
                drop(inner);
                self.exited_tx.send_replace(true);
                return Err(ForkError::WorkerNotActive(self.name.clone()));
            }
            inner.outbox = Some(outbox_tx);
            inner.bootstrap = Some(bootstrap_tx);
            inner.pid = pid;
            inner.supervised = true;
        }
        debug!(pid = ?pid, path = %self.target_path.display(), "Worker spawned");

        tokio::spawn(
            Arc::clone(self)
                .write_loop(LineWriter::new(spawned.stdin), outbox_rx)
                .in_current_span(),
        );
        tokio::spawn(
            Arc::clone(self)
                .supervise(spawned.child, LineReader::new(spawned.stdout))
                .in_current_span(),
        );

        let outcome = match tokio::time::timeout(self.registry.startup_timeout, bootstrap_rx).await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ForkError::WorkerNotActive(self.name.clone())),
            Err(_) => Err(ForkError::StartupTimeout(self.name.clone())),
        };

        if let Err(e) = &outcome {
            debug!(error = %e, "Worker failed to start, tearing down");
            self.stop();
            self.wait_exited().await;
        }
        outcome
    }

    /// Invoke the worker's handler with positional `args`.
    ///
    /// Settles exactly once: with the worker's result, its error payload as
    /// [`ForkError::Remote`], [`ForkError::RequestTimeout`], or
    /// [`ForkError::WorkerTerminated`] if the worker stops first.
    pub async fn invoke(&self, args: Vec<Value>) -> Result<Value> {
        let (id, mut rx) = {
            let mut inner = self.lock();
            if inner.state != WorkerState::Active {
                return Err(ForkError::WorkerNotActive(self.name.clone()));
            }
            let id = inner.ids.next_id();
            let line = Request::new(id, args, Some(self.name.clone())).to_line()?;
            let rx = inner.pending.insert(id);
            let queued = inner
                .outbox
                .as_ref()
                .is_some_and(|outbox| outbox.send(line).is_ok());
            if !queued {
                inner.pending.remove(id);
                return Err(ForkError::WorkerTerminated(self.name.clone()));
            }
            (id, rx)
        };
        let mut guard = PendingGuard {
            handle: self,
            id,
            armed: true,
        };
        trace!(worker = %self.name, id, "Request sent");

        let outcome: Outcome = match tokio::time::timeout(self.config.timeout(), &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ForkError::WorkerTerminated(self.name.clone())),
            Err(_) => {
                if self.lock().pending.remove(id) {
                    debug!(worker = %self.name, id, timeout_ms = self.config.timeout_ms, "Request timed out");
                    Err(ForkError::RequestTimeout)
                } else {
                    // Settled between the deadline and the eviction attempt.
                    rx.try_recv()
                        .unwrap_or_else(|_| Err(ForkError::WorkerTerminated(self.name.clone())))
                }
            }
        };
        guard.armed = false;
        outcome
    }

    /// Request termination. Idempotent and non-blocking.
    ///
    /// Every pending invocation is rejected with `WorkerTerminated`, the stop
    /// hook runs, and the supervisor signals and reaps the process in the
    /// background.
    pub fn stop(&self) {
        let (bootstrap, rejected, previous) = {
            let mut inner = self.lock();
            if inner.state == WorkerState::Stopped {
                return;
            }
            let previous = inner.state;
            self.set_state(&mut inner, WorkerState::Stopped);
            inner.outbox = None;
            let rejected = inner
                .pending
                .reject_all(|| ForkError::WorkerTerminated(self.name.clone()));
            if !inner.supervised {
                self.exited_tx.send_replace(true);
            }
            (inner.bootstrap.take(), rejected, previous)
        };

        if let Some(tx) = bootstrap {
            let _ = tx.send(Err(ForkError::WorkerTerminated(self.name.clone())));
        }
        self.shutdown.notify_one();

        let hook = self
            .on_stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(hook) = hook {
            hook();
        }
        debug!(worker = %self.name, from = %previous, rejected, "Worker stopped");
    }

    /// Wait until the worker process has been reaped (or was never spawned).
    pub async fn wait_exited(&self) {
        let mut rx = self.exited_tx.subscribe();
        let _ = rx.wait_for(|exited| *exited).await;
    }

    fn send_signal(&self, child: &Child, sig: Signal) -> bool {
        let Some(pid) = child.id() else {
            return false;
        };
        match signal::kill(Pid::from_raw(pid as i32), sig) {
            Ok(()) => true,
            Err(e) => {
                debug!(worker = %self.name, pid, signal = ?sig, error = %e, "Failed to signal worker");
                false
            }
        }
    }

    async fn write_loop(
        self: Arc<Self>,
        mut writer: LineWriter<ChildStdin>,
        mut outbox: mpsc::UnboundedReceiver<String>,
    ) {
        while let Some(line) = outbox.recv().await {
            if let Err(e) = writer.write_line(&line).await {
                warn!(worker = %self.name, error = %e, "Failed to write to worker");
                self.stop();
                return;
            }
        }
        // Outbox closed by stop(); dropping the writer closes the worker's stdin.
    }

    fn on_bootstrap(&self, report: Response) {
        if let Some(err) = report.bootstrap_error() {
            warn!(worker = %self.name, error = %err, "Worker bootstrap failed");
            let tx = self.lock().bootstrap.take();
            if let Some(tx) = tx {
                let _ = tx.send(Err(err));
            }
            self.stop();
            return;
        }

        if report.is_error() {
            warn!(
                worker = %self.name,
                method = ?report.method,
                "Bootstrap report carries an error of unknown kind, treating worker as started"
            );
        }

        let tx = {
            let mut inner = self.lock();
            if inner.state != WorkerState::Starting {
                return;
            }
            self.set_state(&mut inner, WorkerState::Active);
            inner.bootstrap.take()
        };
        if let Some(tx) = tx {
            let _ = tx.send(Ok(()));
        }
        debug!(worker = %self.name, "Worker active");
    }

    fn on_response(&self, response: Response) {
        let Some(id) = response.id else {
            debug!(worker = %self.name, method = ?response.method, "Dropping message without id");
            return;
        };
        let outcome = response.into_outcome().map_err(ForkError::Remote);
        if self.lock().pending.settle(id, outcome) {
            trace!(worker = %self.name, id, "Request settled");
        } else {
            debug!(worker = %self.name, id, "Dropping response with no pending request");
        }
    }

    async fn supervise(self: Arc<Self>, mut child: Child, mut reader: LineReader<ChildStdout>) {
        let mut bootstrapped = false;
        let mut sent = None;

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    if self.send_signal(&child, Signal::SIGINT) {
                        sent = Some(Signal::SIGINT);
                    }
                    break;
                }
                line = reader.read_line() => match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let message = match Response::from_line(line) {
                            Ok(message) => message,
                            Err(e) => {
                                warn!(worker = %self.name, error = %e, "Dropping unparseable message");
                                continue;
                            }
                        };
                        if bootstrapped {
                            self.on_response(message);
                        } else {
                            bootstrapped = true;
                            self.on_bootstrap(message);
                        }
                    }
                    Ok(None) => {
                        debug!(worker = %self.name, "Worker closed its channel");
                        break;
                    }
                    Err(e) => {
                        warn!(worker = %self.name, error = %e, "Worker channel failed");
                        break;
                    }
                },
            }
        }

        let status = match tokio::time::timeout(self.registry.shutdown_grace, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!(worker = %self.name, error = %e, "Failed to wait for worker");
                None
            }
            Err(_) => {
                debug!(worker = %self.name, "Worker ignored SIGINT, killing it");
                sent = Some(Signal::SIGKILL);
                let _ = child.start_kill();
                child.wait().await.ok()
            }
        };

        let reason = status
            .map(|status| analyze_exit_status(status, sent))
            .unwrap_or(TerminationReason::Unknown);
        if reason.is_requested() || reason.is_success() {
            debug!(worker = %self.name, reason = %reason, "Worker exited");
        } else {
            warn!(worker = %self.name, reason = %reason, "Worker exited unexpectedly");
        }

        let bootstrap = self.lock().bootstrap.take();
        if let Some(tx) = bootstrap {
            let _ = tx.send(Err(ForkError::WorkerExited {
                name: self.name.clone(),
                reason,
            }));
        }
        self.stop();
        self.exited_tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn handle(config: WorkerConfig) -> Arc<WorkerHandle> {
        WorkerHandle::new(
            "unit",
            "/nonexistent/module.json",
            config,
            Arc::new(RegistryConfig::new("/nonexistent/isofork-worker")),
        )
    }

    /// Put a handle into the active state with a captured outbox, no process.
    fn activate(handle: &WorkerHandle) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = handle.lock();
        inner.outbox = Some(tx);
        handle.set_state(&mut inner, WorkerState::Active);
        rx
    }

    #[test]
    fn test_new_handle_is_uninitialized() {
        let handle = handle(WorkerConfig::default());
        assert_eq!(handle.state(), WorkerState::Uninitialized);
        assert_eq!(handle.pid(), None);
        assert_eq!(handle.name(), "unit");
        assert_eq!(WorkerState::Active.to_string(), "active");
    }

    #[tokio::test]
    async fn test_invoke_requires_active() {
        let handle = handle(WorkerConfig::default());
        assert!(matches!(
            handle.invoke(vec![]).await,
            Err(ForkError::WorkerNotActive(_))
        ));
    }

    #[tokio::test]
    async fn test_invoke_settles_from_response() {
        let handle = handle(WorkerConfig::default());
        let mut outbox = activate(&handle);

        let responder = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move {
                let line = outbox.recv().await.unwrap();
                let request = Request::from_line(&line).unwrap();
                assert_eq!(request.method.as_deref(), Some("unit"));
                handle.on_response(Response::success(
                    request.id,
                    None,
                    json!({ "request": request.params[0], "response": "ok" }),
                ));
            })
        };

        let result = handle.invoke(vec![json!(123)]).await.unwrap();
        assert_eq!(result, json!({ "request": 123, "response": "ok" }));
        responder.await.unwrap();
        assert_eq!(handle.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_remote_error_is_forwarded() {
        let handle = handle(WorkerConfig::default());
        let mut outbox = activate(&handle);

        let responder = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move {
                let request = Request::from_line(&outbox.recv().await.unwrap()).unwrap();
                handle.on_response(Response::failure(request.id, None, json!({ "code": 7 })));
            })
        };

        match handle.invoke(vec![]).await {
            Err(ForkError::Remote(payload)) => assert_eq!(payload, json!({ "code": 7 })),
            other => panic!("Expected Remote error, got {:?}", other),
        }
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_then_late_response_is_noop() {
        let handle = handle(WorkerConfig::default().with_timeout(Duration::from_millis(50)));
        let mut outbox = activate(&handle);

        assert!(matches!(
            handle.invoke(vec![json!(1)]).await,
            Err(ForkError::RequestTimeout)
        ));
        assert_eq!(handle.pending_count(), 0);

        // The late answer for the evicted id is dropped quietly.
        let late = Request::from_line(&outbox.recv().await.unwrap()).unwrap();
        handle.on_response(Response::success(late.id, None, json!("late")));
        assert_eq!(handle.pending_count(), 0);

        // The next request still correlates correctly.
        let responder = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move {
                let request = Request::from_line(&outbox.recv().await.unwrap()).unwrap();
                assert_ne!(request.id, late.id);
                handle.on_response(Response::success(request.id, None, json!("fresh")));
            })
        };
        assert_eq!(handle.invoke(vec![json!(2)]).await.unwrap(), json!("fresh"));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_rejects_pending() {
        let handle = handle(WorkerConfig::default());
        let _outbox = activate(&handle);

        let call = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { handle.invoke(vec![]).await })
        };
        while handle.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        handle.stop();
        assert!(matches!(
            call.await.unwrap(),
            Err(ForkError::WorkerTerminated(_))
        ));
        assert_eq!(handle.state(), WorkerState::Stopped);
        assert_eq!(handle.pending_count(), 0);

        // Never spawned, so it counts as exited right away.
        handle.wait_exited().await;
    }

    #[tokio::test]
    async fn test_dropped_invocation_clears_pending() {
        let handle = handle(WorkerConfig::default());
        let _outbox = activate(&handle);

        let call = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { handle.invoke(vec![]).await })
        };
        while handle.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        call.abort();
        let _ = call.await;
        assert_eq!(handle.pending_count(), 0);
    }

    #[test]
    fn test_stop_is_idempotent_and_runs_hook_once() {
        let handle = handle(WorkerConfig::default());
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            handle.set_stop_hook(Box::new(move || {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }));
        }

        handle.stop();
        handle.stop();
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_bootstrap_failure_settles_start() {
        let handle = handle(WorkerConfig::default());
        let (tx, mut rx) = oneshot::channel();
        {
            let mut inner = handle.lock();
            handle.set_state(&mut inner, WorkerState::Starting);
            inner.bootstrap = Some(tx);
        }

        handle.on_bootstrap(Response::bootstrap_failure(&ForkError::NotAFunction {
            path: "/m/wrong".into(),
        }));
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(ForkError::NotAFunction { .. })
        ));
        assert_eq!(handle.state(), WorkerState::Stopped);
    }

    #[test]
    fn test_bootstrap_success_activates() {
        let handle = handle(WorkerConfig::default());
        let (tx, mut rx) = oneshot::channel();
        {
            let mut inner = handle.lock();
            handle.set_state(&mut inner, WorkerState::Starting);
            inner.bootstrap = Some(tx);
        }

        handle.on_bootstrap(Response::ready("unit", 1));
        assert!(rx.try_recv().unwrap().is_ok());
        assert!(handle.is_active());
    }

    #[tokio::test]
    async fn test_start_with_missing_program_fails() {
        let handle = handle(WorkerConfig::default());
        assert!(matches!(handle.start().await, Err(ForkError::Spawn(_))));
        assert_eq!(handle.state(), WorkerState::Stopped);
        assert!(matches!(
            handle.start().await,
            Err(ForkError::WorkerNotActive(_))
        ));
    }
}
