//! Initialization state machine
//!
//! ```text
//! NotStarted
//!   ↓ initialize()
//! PlatformSetup ──────────┐
//!   ↓ engine connected    │
//! EngineConnected ────────┤ any step fails
//!   ↓ schema bootstrapped │
//! SchemaCreated ──────────┤
//!   ↓                     ▼
//! FullyInitialized      Failed ──▶ NotStarted (next initialize)
//! ```
//!
//! Concurrent `initialize()` calls share one in-flight attempt.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::engine::EngineAdapter;
use crate::error::InitFailure;
use crate::migrations::SchemaBootstrapper;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitializationState {
    NotStarted,
    /// Engine connect in progress
    PlatformSetup,
    /// Engine handle open, schema not yet bootstrapped
    EngineConnected,
    SchemaCreated,
    FullyInitialized,
    Failed,
}

impl InitializationState {
    pub fn can_transition_to(&self, target: InitializationState) -> bool {
        use InitializationState::*;
        match (self, target) {
            (NotStarted, PlatformSetup) => true,
            (PlatformSetup, EngineConnected) => true,
            (EngineConnected, SchemaCreated) => true,
            (SchemaCreated, FullyInitialized) => true,
            // Any in-progress step can fail
            (PlatformSetup | EngineConnected | SchemaCreated, Failed) => true,
            // Retry after failure, reset or close
            (Failed | FullyInitialized, NotStarted) => true,
            (a, b) if *a == b => true,
            _ => false,
        }
    }

    /// Whether an attempt has finished, one way or the other.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InitializationState::FullyInitialized | InitializationState::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InitializationState::NotStarted => "not_started",
            InitializationState::PlatformSetup => "platform_setup",
            InitializationState::EngineConnected => "engine_connected",
            InitializationState::SchemaCreated => "schema_created",
            InitializationState::FullyInitialized => "fully_initialized",
            InitializationState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for InitializationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for InitializationState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "not_started" => Ok(InitializationState::NotStarted),
            "platform_setup" => Ok(InitializationState::PlatformSetup),
            "engine_connected" => Ok(InitializationState::EngineConnected),
            "schema_created" => Ok(InitializationState::SchemaCreated),
            "fully_initialized" => Ok(InitializationState::FullyInitialized),
            "failed" => Ok(InitializationState::Failed),
            _ => Err(format!("Unknown initialization state: {}", s)),
        }
    }
}

type InitAttempt = Shared<BoxFuture<'static, std::result::Result<(), InitFailure>>>;

/// Runs engine connect and schema bootstrap exactly once per successful
/// initialization.
#[derive(Debug, Clone)]
pub struct InitCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    engine: Arc<dyn EngineAdapter>,
    bootstrapper: SchemaBootstrapper,
    state: RwLock<InitializationState>,
    /// Lock order: `in_flight` before `state`
    in_flight: Mutex<Option<InitAttempt>>,
    attempts: AtomicU64,
}

impl std::fmt::Debug for CoordinatorInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorInner")
            .field("engine", &self.engine)
            .field("state", &*self.state.read())
            .field("attempts", &self.attempts.load(Ordering::Relaxed))
            .finish()
    }
}

impl InitCoordinator {
    pub fn new(engine: Arc<dyn EngineAdapter>) -> Self {
        Self::with_bootstrapper(engine, SchemaBootstrapper::new())
    }

    pub fn with_bootstrapper(engine: Arc<dyn EngineAdapter>, bootstrapper: SchemaBootstrapper) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                engine,
                bootstrapper,
                state: RwLock::new(InitializationState::NotStarted),
                in_flight: Mutex::new(None),
                attempts: AtomicU64::new(0),
            }),
        }
    }

    pub fn engine(&self) -> &Arc<dyn EngineAdapter> {
        &self.inner.engine
    }

    pub fn state(&self) -> InitializationState {
        *self.inner.state.read()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == InitializationState::FullyInitialized
    }

    /// Attempts started so far, successful or not.
    pub fn attempts(&self) -> u64 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Brings the engine to `FullyInitialized`.
    ///
    /// Returns at once when already initialized. Joins the running attempt
    /// when there is one, otherwise starts a new attempt; a previous failure
    /// is retried from the beginning. A reset that lands in between sends
    /// the caller round again.
    pub async fn initialize(&self) -> Result<()> {
        loop {
            let attempt = {
                let mut in_flight = self.inner.in_flight.lock();
                if self.state() == InitializationState::FullyInitialized {
                    return Ok(());
                }

                match in_flight.as_ref() {
                    Some(attempt) => attempt.clone(),
                    None => {
                        let inner = Arc::clone(&self.inner);
                        let attempt = async move { inner.run_attempt().await }.boxed().shared();
                        *in_flight = Some(attempt.clone());
                        attempt
                    }
                }
            };

            attempt.await?;
            if self.is_ready() {
                return Ok(());
            }
        }
    }

    /// Returns to `NotStarted` so the next `initialize()` bootstraps again.
    /// Waits for an attempt in flight to settle first.
    pub async fn reset(&self) {
        let _ = self.reset_with(async { Ok(()) }).await;
    }

    /// Runs `work` with the database out of service, then leaves it
    /// `NotStarted`.
    ///
    /// Waits for an attempt in flight, then takes its place: `initialize()`
    /// callers arriving meanwhile wait for `work` and start a fresh attempt
    /// afterwards. The state is `NotStarted` whether or not `work` succeeds.
    pub async fn reset_with<F>(&self, work: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        let _barrier = loop {
            let pending = {
                let mut in_flight = self.inner.in_flight.lock();
                match in_flight.as_ref() {
                    Some(attempt) => attempt.clone(),
                    None => {
                        let (done, released) = oneshot::channel::<()>();
                        let barrier = async move {
                            let _ = released.await;
                            Ok(())
                        }
                        .boxed()
                        .shared();
                        *in_flight = Some(barrier);
                        self.inner.transition(InitializationState::NotStarted);
                        break ResetBarrier {
                            inner: &self.inner,
                            _done: done,
                        };
                    }
                }
            };
            let _ = pending.await;
        };

        work.await
    }
}

/// Marks a reset in flight. Dropping it, also on cancellation, clears the
/// marker and then wakes the callers waiting on it.
struct ResetBarrier<'a> {
    inner: &'a CoordinatorInner,
    _done: oneshot::Sender<()>,
}

impl Drop for ResetBarrier<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.inner.in_flight.lock();
        *in_flight = None;
        self.inner.transition(InitializationState::NotStarted);
    }
}

impl CoordinatorInner {
    async fn run_attempt(self: Arc<Self>) -> std::result::Result<(), InitFailure> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if *self.state.read() == InitializationState::Failed {
            self.transition(InitializationState::NotStarted);
        }
        self.transition(InitializationState::PlatformSetup);
        tracing::info!(attempt, platform = %self.engine.platform(), "Initializing database");

        let result = self.run_steps().await;

        if result.is_err() {
            // A failed attempt's handle is not reused.
            if let Err(e) = self.engine.close().await {
                tracing::warn!(error = %e, "Failed to close engine after initialization failure");
            }
        }

        let mut in_flight = self.in_flight.lock();
        match &result {
            Ok(()) => {
                self.transition(InitializationState::FullyInitialized);
                tracing::info!(attempt, "Database ready");
            }
            Err(failure) => {
                self.transition(InitializationState::Failed);
                tracing::error!(attempt, stage = %failure.stage, error = %failure.message, "Database initialization failed");
            }
        }
        *in_flight = None;

        result
    }

    async fn run_steps(&self) -> std::result::Result<(), InitFailure> {
        self.engine
            .connect()
            .await
            .map_err(|e| InitFailure::new(InitializationState::PlatformSetup, e.to_string()))?;
        self.transition(InitializationState::EngineConnected);

        let applied = self
            .bootstrapper
            .run(self.engine.as_ref())
            .await
            .map_err(|e| InitFailure::new(InitializationState::EngineConnected, e.to_string()))?;
        self.transition(InitializationState::SchemaCreated);

        tracing::debug!(?applied, "Schema bootstrapped");
        Ok(())
    }

    fn transition(&self, to: InitializationState) {
        let mut state = self.state.write();
        let from = *state;
        if from == to {
            return;
        }
        if !from.can_transition_to(to) {
            tracing::warn!(from = %from, to = %to, "Unexpected initialization transition");
        }
        *state = to;
        tracing::debug!(from = %from, to = %to, "Initialization state changed");
    }
}
