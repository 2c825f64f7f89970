// src/domain/lifecycle.rs

//! Consumer state machine shared by the pull and push adapters.
//!
//! `Lifecycle` owns the derived cancellation scope and the running unit of
//! a consumer (a loop join handle or a callback registration). Adapters
//! supply the launch step and the quiesce step; the guard logic around them
//! lives here once.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::{
    // ---
    log_debug,
    log_info,
    log_warn,
    BusError,
    CancellationScope,
    ConsumerState,
    Result,
};

/// Lock a std mutex, recovering the value if a holder panicked.
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// The running unit of a started consumer.
///
/// `quiesce` must be resumable: if the future is dropped part-way (caller
/// cancelled or the shutdown bound elapsed) a later call continues the
/// same wait.
#[async_trait::async_trait]
pub(crate) trait Quiesce: Send + 'static {
    type Output: Send;

    async fn quiesce(&mut self) -> Result<Self::Output>;
}

struct Status {
    state: ConsumerState,
    scope: Option<CancellationScope>,
}

pub(crate) struct Lifecycle<R> {
    // ---
    name: String,

    /// State and derived scope; `stop` can trigger the scope without
    /// waiting on `running`.
    status: Mutex<Status>,

    /// Serializes start/stop/close against each other.
    running: tokio::sync::Mutex<Option<R>>,

    shutdown_timeout: Option<Duration>,
    closed: AtomicBool,
}

impl<R: Quiesce> Lifecycle<R> {
    // ---

    pub(crate) fn new(name: impl Into<String>, shutdown_timeout: Option<Duration>) -> Self {
        // ---
        Self {
            name: name.into(),
            status: Mutex::new(Status {
                state: ConsumerState::Stopped,
                scope: None,
            }),
            running: tokio::sync::Mutex::new(None),
            shutdown_timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// A running consumer whose derived scope has fired (a parent was
    /// cancelled) reports `Stopping` until `stop` completes.
    pub(crate) fn state(&self) -> ConsumerState {
        // ---
        let status = lock_ignore_poison(&self.status);
        match (status.state, &status.scope) {
            (ConsumerState::Running, Some(scope)) if scope.is_cancelled() => ConsumerState::Stopping,
            (state, _) => state,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Derive a child of `cancel`, hand it to `launch` and record the unit
    /// it returns.
    ///
    /// On launch failure the child scope is triggered and the consumer
    /// stays stopped.
    pub(crate) async fn start<F, Fut>(&self, cancel: &CancellationScope, launch: F) -> Result<()>
    where
        F: FnOnce(CancellationScope) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        // ---
        if cancel.is_cancelled() {
            return Err(BusError::Cancelled);
        }

        let mut running = self.running.lock().await;

        if self.is_closed() {
            return Err(BusError::InvalidState(format!("{}: consumer is closed", self.name)));
        }

        match self.state() {
            ConsumerState::Stopped => {}
            ConsumerState::Running => {
                return Err(BusError::InvalidState(format!(
                    "{}: consumer is already running",
                    self.name
                )));
            }
            ConsumerState::Stopping => {
                return Err(BusError::InvalidState(format!(
                    "{}: consumer is stopping; call stop() again to finish",
                    self.name
                )));
            }
        }

        let scope = cancel.child();
        match launch(scope.clone()).await {
            Ok(unit) => {
                *running = Some(unit);
                let mut status = lock_ignore_poison(&self.status);
                status.scope = Some(scope);
                status.state = ConsumerState::Running;
                drop(status);
                log_info!("{}: consumer started", self.name);
                Ok(())
            }
            Err(err) => {
                scope.cancel();
                log_warn!("{}: consumer failed to start: {}", self.name, err);
                Err(err)
            }
        }
    }

    /// Trigger the scope and wait for the running unit to quiesce.
    ///
    /// Returns `Ok(None)` when the consumer was already stopped. When the
    /// wait is cut short by `cancel` or by the shutdown bound the consumer
    /// stays `Stopping` and the next call resumes the wait.
    pub(crate) async fn stop(&self, cancel: &CancellationScope) -> Result<Option<R::Output>> {
        // ---
        {
            let mut status = lock_ignore_poison(&self.status);
            if status.state == ConsumerState::Stopped {
                return Ok(None);
            }
            if let Some(scope) = &status.scope {
                scope.cancel();
            }
            status.state = ConsumerState::Stopping;
        }
        log_debug!("{}: consumer stopping", self.name);

        let mut running = cancel.run(self.running.lock()).await?;

        // A concurrent stop may have finished while we waited for the lock.
        if self.state() == ConsumerState::Stopped {
            return Ok(None);
        }

        let Some(unit) = running.as_mut() else {
            self.mark_stopped();
            return Ok(None);
        };

        let outcome = match self.shutdown_timeout {
            Some(limit) => match cancel.run(tokio::time::timeout(limit, unit.quiesce())).await {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(_elapsed)) => Err(BusError::Timeout(format!(
                    "{}: in-flight work did not finish within {:?}",
                    self.name, limit
                ))),
                Err(err) => Err(err),
            },
            None => cancel.run(unit.quiesce()).await,
        };

        let result = match outcome {
            Ok(result) => result,
            Err(err) => {
                log_warn!("{}: stop interrupted, consumer still stopping: {}", self.name, err);
                return Err(err);
            }
        };

        *running = None;
        self.mark_stopped();

        match result {
            Ok(output) => {
                log_info!("{}: consumer stopped", self.name);
                Ok(Some(output))
            }
            Err(err) => {
                log_warn!("{}: consumer stopped after failure: {}", self.name, err);
                Err(err)
            }
        }
    }

    fn mark_stopped(&self) {
        // ---
        let mut status = lock_ignore_poison(&self.status);
        status.state = ConsumerState::Stopped;
        status.scope = None;
    }

    /// Refuse further starts, then stop.
    ///
    /// The shutdown bound still applies; there is no caller scope.
    pub(crate) async fn close(&self) -> Result<Option<R::Output>> {
        // ---
        self.closed.store(true, Ordering::Release);
        self.stop(&CancellationScope::new()).await
    }
}
