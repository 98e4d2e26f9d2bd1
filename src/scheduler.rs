//! Scheduling Loop
//!
//! Sleeps for the configured interval, runs a cycle, repeats. Shutdown is a
//! `watch` channel flipped to `true`; it interrupts the sleep immediately and
//! stops a running cycle before its next target.

use std::time::Duration;

use tokio::sync::watch;

use crate::coordinator::Coordinator;

/// Drives a [`Coordinator`] on a fixed interval until shutdown
pub struct Scheduler {
    coordinator: Coordinator,
    interval: Duration,
    run_on_start: bool,
    shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(coordinator: Coordinator, shutdown: watch::Receiver<bool>) -> Self {
        let interval = coordinator.config().interval;
        let run_on_start = coordinator.config().run_on_start;
        Self {
            coordinator,
            interval,
            run_on_start,
            shutdown,
        }
    }

    /// Loop until shutdown is signalled. Returns the number of cycles run.
    pub async fn run(mut self) -> u64 {
        let mut cycles = 0u64;
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            run_on_start = self.run_on_start,
            "Scheduler started"
        );

        if self.run_on_start && !self.is_shutdown() {
            self.cycle().await;
            cycles += 1;
        }

        loop {
            if self.is_shutdown() {
                break;
            }
            tracing::debug!("Next backup in {}s", self.interval.as_secs());
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = wait_for_shutdown(&mut self.shutdown) => break,
            }
            if self.is_shutdown() {
                break;
            }
            self.cycle().await;
            cycles += 1;
        }

        tracing::info!(cycles, "Scheduler stopped");
        cycles
    }

    async fn cycle(&self) {
        let shutdown = &self.shutdown;
        let report = self.coordinator.run_cycle_until(|| *shutdown.borrow()).await;
        if report.failed_count() > 0 {
            tracing::warn!(
                failed = report.failed_count(),
                "Cycle finished with failures, retrying next interval"
            );
        }
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Resolves once the flag is `true`. Never resolves if the sender is dropped
/// without signalling.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
