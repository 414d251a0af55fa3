//! Periodic snapshot saving for the web engine

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::engine::EngineAdapter;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AutoSaveControl {
    Run,
    Stop,
}

/// Shortest period between periodic saves.
pub const MIN_AUTO_SAVE_INTERVAL: Duration = Duration::from_millis(10);

/// Handle to a running auto-save task.
///
/// The task flushes the engine once on start, then on every tick. Unchanged
/// databases are not rewritten. The controller never listens for process
/// signals itself: the host calls [`teardown`](Self::teardown) from its own
/// shutdown path. Dropping the controller stops the task.
#[derive(Debug)]
pub struct AutoSaveController {
    engine: Arc<dyn EngineAdapter>,
    control: watch::Sender<AutoSaveControl>,
    task: Mutex<Option<JoinHandle<()>>>,
    flushes: Arc<AtomicU64>,
    save_on_shutdown: bool,
}

impl AutoSaveController {
    /// Spawns the save loop. Intervals below [`MIN_AUTO_SAVE_INTERVAL`] are
    /// raised to it.
    pub fn start(engine: Arc<dyn EngineAdapter>, interval: Duration, save_on_shutdown: bool) -> Self {
        if interval < MIN_AUTO_SAVE_INTERVAL {
            tracing::warn!(
                requested_ms = interval.as_millis() as u64,
                "Auto-save interval too short, using the minimum"
            );
        }
        let interval = interval.max(MIN_AUTO_SAVE_INTERVAL);

        let (control, rx) = watch::channel(AutoSaveControl::Run);
        let flushes = Arc::new(AtomicU64::new(0));

        let task = tokio::spawn(run_auto_save(
            Arc::clone(&engine),
            interval,
            rx,
            Arc::clone(&flushes),
        ));

        tracing::info!(
            interval_ms = interval.as_millis() as u64,
            save_on_shutdown,
            "Auto-save started"
        );

        Self {
            engine,
            control,
            task: Mutex::new(Some(task)),
            flushes,
            save_on_shutdown,
        }
    }

    /// Cancels the timer. Safe to call repeatedly, including from a
    /// shutdown handler.
    pub fn stop(&self) {
        let Some(task) = self.task.lock().take() else {
            return;
        };
        self.control.send_replace(AutoSaveControl::Stop);
        // The loop also sees the control change; abort covers a flush in progress.
        task.abort();
        tracing::info!("Auto-save stopped");
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Saves now and waits for the result.
    pub async fn force_sync(&self) -> Result<()> {
        self.engine.flush().await
    }

    /// Shutdown hook: stops the task, then saves once more when
    /// `save_on_shutdown` is set. Only the first call saves.
    pub async fn teardown(&self) -> Result<()> {
        let was_running = self.task.lock().is_some();
        self.stop();
        if !(was_running && self.save_on_shutdown) {
            return Ok(());
        }

        self.flushes.fetch_add(1, Ordering::SeqCst);
        self.engine.flush().await?;
        tracing::info!("Auto-save flushed on teardown");
        Ok(())
    }

    /// Flushes attempted by the controller so far, teardown included.
    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }
}

impl Drop for AutoSaveController {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_auto_save(
    engine: Arc<dyn EngineAdapter>,
    interval: Duration,
    mut control: watch::Receiver<AutoSaveControl>,
    flushes: Arc<AtomicU64>,
) {
    // The first tick completes immediately, which gives the save on start.
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = control.changed() => {
                if changed.is_err() || *control.borrow() == AutoSaveControl::Stop {
                    return;
                }
            }
            _ = ticker.tick() => {
                flushes.fetch_add(1, Ordering::SeqCst);
                if let Err(e) = engine.flush().await {
                    tracing::warn!(error = %e, "Auto-save failed");
                }
            }
        }
    }
}
