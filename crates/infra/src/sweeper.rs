//! Background expiry sweep.
//!
//! A dedicated thread wakes on an interval, asks the reservation store for
//! rows whose hold window has lapsed, and pushes each one through the
//! manager's expiry transition. The transition is guarded by the row version,
//! so a hold that was extended or closed after the sweep picked it up is left
//! alone. Rows fail independently: one bad row never stops the pass.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info};

use stocklock_core::DomainResult;

use crate::catalog::Catalog;
use crate::ledger_store::LedgerStore;
use crate::manager::ReservationManager;
use crate::reservation_store::ReservationStore;

/// Tuning knobs for the sweep thread.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Thread name, also carried on every log line the sweeper emits.
    pub name: String,
    /// Pause between passes.
    pub interval: Duration,
    /// Most rows one pass will touch; the rest wait for the next pass.
    pub batch_size: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            name: "expiry-sweeper".to_string(),
            interval: Duration::from_secs(60),
            batch_size: 100,
        }
    }
}

impl SweeperConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// Counters accumulated across every pass of a running sweeper.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweeperStats {
    pub passes: u64,
    pub examined: u64,
    pub expired: u64,
    pub conflicts: u64,
    pub failures: u64,
}

/// What a single pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub expired: usize,
    pub conflicts: usize,
    pub failures: usize,
}

/// Expires lapsed holds so their stock returns to the pool.
#[derive(Debug)]
pub struct ExpirySweeper<L, R, C> {
    manager: Arc<ReservationManager<L, R, C>>,
    reservations: R,
}

impl<L, R, C> ExpirySweeper<L, R, C>
where
    L: LedgerStore,
    R: ReservationStore,
    C: Catalog,
{
    pub fn new(manager: Arc<ReservationManager<L, R, C>>, reservations: R) -> Self {
        Self {
            manager,
            reservations,
        }
    }

    /// Run one pass over the rows due right now.
    pub fn sweep_once(&self, batch_size: usize) -> DomainResult<SweepReport> {
        let now = Utc::now();
        let due = self.reservations.expiring_before(now, batch_size)?;
        let mut report = SweepReport {
            examined: due.len(),
            expired: 0,
            conflicts: 0,
            failures: 0,
        };

        for row in due {
            match self.manager.expire(row.tenant_id, row.id) {
                Ok(outcome) if outcome.released_now => {
                    report.expired += 1;
                    debug!(reservation = %row.id, "expired lapsed hold");
                }
                // Extended or closed since the row was picked up.
                Ok(_) => {}
                Err(err) if err.is_retriable() => {
                    report.conflicts += 1;
                    debug!(reservation = %row.id, error = %err, "hold contended, leaving it for the next pass");
                }
                Err(err) if err.is_integrity() => {
                    report.failures += 1;
                    error!(reservation = %row.id, error = %err, "ledger integrity violation during expiry sweep");
                }
                Err(err) => {
                    report.failures += 1;
                    error!(reservation = %row.id, error = %err, "failed to expire hold");
                }
            }
        }
        Ok(report)
    }

    /// Move the sweeper onto its own thread, sweeping every
    /// `config.interval` until the handle shuts it down.
    pub fn spawn(self, config: SweeperConfig) -> SweeperHandle
    where
        L: 'static,
        R: 'static,
        C: 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel();
        let stats = Arc::new(Mutex::new(SweeperStats::default()));
        let loop_stats = stats.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || sweeper_loop(self, config, shutdown_rx, loop_stats))
            .expect("failed to spawn expiry sweeper thread");

        SweeperHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }
}

/// Controls a running sweeper thread.
pub struct SweeperHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<SweeperStats>>,
}

impl SweeperHandle {
    pub fn stats(&self) -> SweeperStats {
        self.stats.lock().unwrap().clone()
    }

    /// Stop the thread and wait for the pass in flight to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn sweeper_loop<L, R, C>(
    sweeper: ExpirySweeper<L, R, C>,
    config: SweeperConfig,
    shutdown: mpsc::Receiver<()>,
    stats: Arc<Mutex<SweeperStats>>,
) where
    L: LedgerStore,
    R: ReservationStore,
    C: Catalog,
{
    info!(
        sweeper = %config.name,
        interval_ms = config.interval.as_millis() as u64,
        batch_size = config.batch_size,
        "expiry sweeper started"
    );

    loop {
        // The interval doubles as the shutdown poll, so a stop request takes
        // effect without waiting out a full sleep.
        match shutdown.recv_timeout(config.interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        match sweeper.sweep_once(config.batch_size) {
            Ok(report) => {
                if report.examined > 0 {
                    debug!(
                        sweeper = %config.name,
                        examined = report.examined,
                        expired = report.expired,
                        conflicts = report.conflicts,
                        failures = report.failures,
                        "sweep pass finished"
                    );
                }
                let mut stats = stats.lock().unwrap();
                stats.passes += 1;
                stats.examined += report.examined as u64;
                stats.expired += report.expired as u64;
                stats.conflicts += report.conflicts as u64;
                stats.failures += report.failures as u64;
            }
            Err(err) => {
                error!(sweeper = %config.name, error = %err, "sweep pass failed");
                let mut stats = stats.lock().unwrap();
                stats.passes += 1;
                stats.failures += 1;
            }
        }
    }

    info!(sweeper = %config.name, "expiry sweeper stopped");
}
