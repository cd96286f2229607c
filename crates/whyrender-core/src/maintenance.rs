//! Periodic background maintenance.
//!
//! [`spawn_maintenance`] runs every registered [`MaintenanceTask`] on a
//! tokio interval, off the render path. A task that errors or panics is
//! counted and logged; the loop carries on with the next task and the next
//! tick. Shutdown is a flag checked on each tick, so
//! [`MaintenanceHandle::shutdown`] may be called any number of times.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::counter::ShardedCounter;
use crate::error::Result;

/// One unit of periodic cleanup.
pub trait MaintenanceTask: Send + Sync {
    fn name(&self) -> &str;

    /// Run one pass. Returns how many items were removed.
    fn run(&self) -> Result<usize>;
}

impl<F> MaintenanceTask for (&'static str, F)
where
    F: Fn() -> Result<usize> + Send + Sync,
{
    fn name(&self) -> &str {
        self.0
    }

    fn run(&self) -> Result<usize> {
        (self.1)()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceStatistics {
    pub ticks: u64,
    pub task_runs: u64,
    pub failures: u64,
    pub panics: u64,
    pub items_removed: u64,
}

/// A fixed set of tasks plus their failure counters.
pub struct MaintenanceRunner {
    tasks: Vec<Arc<dyn MaintenanceTask>>,
    ticks: ShardedCounter,
    task_runs: ShardedCounter,
    failures: ShardedCounter,
    panics: ShardedCounter,
    items_removed: ShardedCounter,
}

impl std::fmt::Debug for MaintenanceRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.tasks.iter().map(|t| t.name()).collect();
        f.debug_struct("MaintenanceRunner")
            .field("tasks", &names)
            .finish_non_exhaustive()
    }
}

impl MaintenanceRunner {
    #[must_use]
    pub fn new(tasks: Vec<Arc<dyn MaintenanceTask>>) -> Self {
        Self {
            tasks,
            ticks: ShardedCounter::with_slots(1),
            task_runs: ShardedCounter::with_slots(1),
            failures: ShardedCounter::with_slots(1),
            panics: ShardedCounter::with_slots(1),
            items_removed: ShardedCounter::with_slots(1),
        }
    }

    /// Run every task once. Never panics.
    pub fn run_once(&self) -> MaintenanceStatistics {
        self.ticks.increment();
        let mut pass = MaintenanceStatistics {
            ticks: 1,
            ..MaintenanceStatistics::default()
        };
        for task in &self.tasks {
            pass.task_runs += 1;
            match catch_unwind(AssertUnwindSafe(|| task.run())) {
                Ok(Ok(removed)) => {
                    pass.items_removed += removed as u64;
                    if removed > 0 {
                        debug!(task = task.name(), removed, "maintenance task finished");
                    }
                }
                Ok(Err(err)) => {
                    pass.failures += 1;
                    warn!(task = task.name(), error = %err, "maintenance task failed");
                }
                Err(_) => {
                    pass.panics += 1;
                    warn!(task = task.name(), "maintenance task panicked");
                }
            }
        }
        self.task_runs.add(pass.task_runs);
        self.failures.add(pass.failures);
        self.panics.add(pass.panics);
        self.items_removed.add(pass.items_removed);
        pass
    }

    #[must_use]
    pub fn statistics(&self) -> MaintenanceStatistics {
        MaintenanceStatistics {
            ticks: self.ticks.get(),
            task_runs: self.task_runs.get(),
            failures: self.failures.get(),
            panics: self.panics.get(),
            items_removed: self.items_removed.get(),
        }
    }

    pub fn reset_statistics(&self) {
        for counter in [
            &self.ticks,
            &self.task_runs,
            &self.failures,
            &self.panics,
            &self.items_removed,
        ] {
            counter.reset();
        }
    }
}

/// Handle returned by [`spawn_maintenance`] to control the background task.
#[derive(Debug)]
pub struct MaintenanceHandle {
    task: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    runner: Arc<MaintenanceRunner>,
}

impl MaintenanceHandle {
    /// Signal the task to stop after its current tick. Idempotent.
    pub fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            info!("maintenance: shutdown requested");
        }
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Signal shutdown and wait for the task to finish.
    pub async fn join(mut self) {
        self.shutdown();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    #[must_use]
    pub fn statistics(&self) -> MaintenanceStatistics {
        self.runner.statistics()
    }
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

/// Spawn the maintenance loop on the current tokio runtime.
///
/// The first pass runs one `interval` after spawning.
#[must_use]
pub fn spawn_maintenance(runner: Arc<MaintenanceRunner>, interval: Duration) -> MaintenanceHandle {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    let loop_runner = Arc::clone(&runner);
    let period = interval.max(Duration::from_millis(1));

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if flag.load(Ordering::SeqCst) {
                debug!("maintenance: loop stopped");
                break;
            }
            loop_runner.run_once();
        }
    });

    MaintenanceHandle {
        task: Some(task),
        shutdown,
        runner,
    }
}
