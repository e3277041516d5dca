//! Fixed-size pool of periodogram workers.
//!
//! Each worker is a slot with an explicit life cycle:
//!
//! ```text
//!   Idle ──dispatch──▶ Busy{scan_id} ──report received──▶ Idle
//!     └──────────────────── shutdown ──────────────────▶ Stopped
//! ```
//!
//! The orchestrator talks to workers only through [`ScanRequest`] and
//! [`ScanResponse`] values.  Work runs on a dedicated **rayon** thread pool
//! with one thread per worker, and reports come back over a crossbeam
//! channel.  The series to scan travels inside each request as an
//! `Arc<TimeSeries>` snapshot, so it cannot be mutated while a scan is
//! running.
//!
//! Protocol violations (dispatching to a busy worker, a report for a scan
//! the worker is not running, anything arriving after shutdown) are fatal
//! [`PoolError`]s: they mean the orchestration is broken, not the data.

use std::fmt;
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};

use crate::periodogram::{evaluate_range, grid_frequencies};
use crate::types::{FrequencyGrid, TimeSeries};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised by the worker pool.  None of them is retried.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool needs at least one worker")]
    NoWorkers,

    #[error("failed to start worker threads: {0}")]
    Spawn(String),

    #[error("worker {worker} does not exist (pool has {workers})")]
    UnknownWorker { worker: usize, workers: usize },

    #[error("worker {worker} is still busy with scan {scan_id}")]
    WorkerBusy { worker: usize, scan_id: u64 },

    #[error("worker {worker} reported scan {got} while {state}")]
    UnexpectedResponse {
        worker: usize,
        got: u64,
        state: WorkerState,
    },

    #[error("worker {worker} sent a malformed response: {reason}")]
    MalformedResponse { worker: usize, reason: String },

    #[error("worker {worker} panicked during scan {scan_id}: {message}")]
    WorkerPanicked {
        worker: usize,
        scan_id: u64,
        message: String,
    },

    #[error("worker pool has been shut down")]
    Stopped,

    #[error("timed out after {waited_ms} ms waiting for {pending} worker(s)")]
    Timeout { waited_ms: u128, pending: usize },

    #[error("worker report channel disconnected")]
    Disconnected,
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Command for one worker: evaluate grid indices `range` on `series`.
#[derive(Clone, Debug)]
pub struct ScanRequest {
    pub scan_id: u64,
    pub series: Arc<TimeSeries>,
    pub grid: FrequencyGrid,
    pub range: Range<usize>,
    /// Ask for the grid frequencies too; the scanner caches them.
    pub include_frequencies: bool,
}

/// A worker's answer to a [`ScanRequest`].
#[derive(Clone, Debug, PartialEq)]
pub struct ScanResponse {
    pub worker: usize,
    pub scan_id: u64,
    pub range: Range<usize>,
    pub frequencies: Option<Vec<f64>>,
    pub powers: Vec<f64>,
}

enum WorkerReport {
    Finished(ScanResponse),
    Panicked {
        worker: usize,
        scan_id: u64,
        message: String,
    },
}

/// Life-cycle state of one worker slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Busy { scan_id: u64 },
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Idle => write!(f, "idle"),
            WorkerState::Busy { scan_id } => write!(f, "busy with scan {}", scan_id),
            WorkerState::Stopped => write!(f, "stopped"),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

/// A fixed set of periodogram workers.
pub struct WorkerPool {
    executor: Option<rayon::ThreadPool>,
    workers: Vec<WorkerState>,
    grid: FrequencyGrid,
    report_tx: Sender<WorkerReport>,
    report_rx: Receiver<WorkerReport>,
}

impl WorkerPool {
    /// Start `size` workers for the default frequency `grid`.
    ///
    /// A pool larger than the number of CPU cores is allowed but logged,
    /// since workers will then compete for the same core.
    pub fn new(size: usize, grid: FrequencyGrid) -> Result<Self, PoolError> {
        if size == 0 {
            return Err(PoolError::NoWorkers);
        }

        let cores = num_cpus::get();
        if size > cores {
            warn!(
                "Using {} workers on {} CPU cores; several workers will share a core",
                size, cores
            );
        }

        let executor = rayon::ThreadPoolBuilder::new()
            .num_threads(size)
            .thread_name(|i| format!("prewhiten-worker-{}", i))
            .build()
            .map_err(|e| PoolError::Spawn(e.to_string()))?;

        let (report_tx, report_rx) = unbounded();
        let workers = vec![WorkerState::Idle; size];

        info!(
            "Started {} periodogram workers for a {}-sample grid over [{}, {})",
            size,
            grid.len(),
            grid.range().min,
            grid.range().max,
        );

        Ok(Self {
            executor: Some(executor),
            workers,
            grid,
            report_tx,
            report_rx,
        })
    }

    /// Number of workers.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// The default frequency grid the pool was built for.
    pub fn grid(&self) -> &FrequencyGrid {
        &self.grid
    }

    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.workers.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.executor.is_none()
    }

    /// Hand `request` to an idle worker.
    pub fn dispatch(&mut self, worker: usize, request: ScanRequest) -> Result<(), PoolError> {
        let executor = self.executor.as_ref().ok_or(PoolError::Stopped)?;
        let workers = self.workers.len();
        let slot = self
            .workers
            .get_mut(worker)
            .ok_or(PoolError::UnknownWorker { worker, workers })?;

        match *slot {
            WorkerState::Idle => {}
            WorkerState::Busy { scan_id } => {
                return Err(PoolError::WorkerBusy { worker, scan_id });
            }
            WorkerState::Stopped => return Err(PoolError::Stopped),
        }

        *slot = WorkerState::Busy {
            scan_id: request.scan_id,
        };

        let tx = self.report_tx.clone();
        executor.spawn(move || {
            let scan_id = request.scan_id;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| run_scan(worker, request)));
            let report = match outcome {
                Ok(response) => WorkerReport::Finished(response),
                Err(payload) => WorkerReport::Panicked {
                    worker,
                    scan_id,
                    message: panic_message(payload.as_ref()),
                },
            };
            if tx.send(report).is_err() {
                debug!(
                    "Worker {} finished scan {} after the pool was dropped",
                    worker, scan_id
                );
            }
        });

        Ok(())
    }

    /// Wait until `deadline` for the next worker report.
    ///
    /// Returns `Ok(None)` if the deadline passes first.  A report is only
    /// accepted from a worker that is busy with exactly that scan; the
    /// worker goes back to idle.
    pub fn receive(&mut self, deadline: Instant) -> Result<Option<ScanResponse>, PoolError> {
        if self.is_stopped() {
            return Err(PoolError::Stopped);
        }
        let report = match self.report_rx.recv_deadline(deadline) {
            Ok(report) => report,
            Err(RecvTimeoutError::Timeout) => return Ok(None),
            Err(RecvTimeoutError::Disconnected) => return Err(PoolError::Disconnected),
        };
        self.accept(report).map(Some)
    }

    fn accept(&mut self, report: WorkerReport) -> Result<ScanResponse, PoolError> {
        match report {
            WorkerReport::Panicked {
                worker,
                scan_id,
                message,
            } => Err(PoolError::WorkerPanicked {
                worker,
                scan_id,
                message,
            }),
            WorkerReport::Finished(response) => {
                let workers = self.workers.len();
                let slot = self
                    .workers
                    .get_mut(response.worker)
                    .ok_or(PoolError::UnknownWorker {
                        worker: response.worker,
                        workers,
                    })?;
                match *slot {
                    WorkerState::Busy { scan_id } if scan_id == response.scan_id => {
                        *slot = WorkerState::Idle;
                        Ok(response)
                    }
                    state => Err(PoolError::UnexpectedResponse {
                        worker: response.worker,
                        got: response.scan_id,
                        state,
                    }),
                }
            }
        }
    }

    /// Stop every worker.  Must be called exactly once; later calls fail
    /// with [`PoolError::Stopped`].
    pub fn shutdown(&mut self) -> Result<(), PoolError> {
        let executor = self.executor.take().ok_or(PoolError::Stopped)?;
        for (i, state) in self.workers.iter_mut().enumerate() {
            if let WorkerState::Busy { scan_id } = *state {
                warn!("Stopping worker {} with scan {} still outstanding", i, scan_id);
            }
            *state = WorkerState::Stopped;
        }
        drop(executor);
        info!("Stopped {} periodogram workers", self.workers.len());
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.is_stopped() {
            let _ = self.shutdown();
        }
    }
}

fn run_scan(worker: usize, request: ScanRequest) -> ScanResponse {
    let powers = evaluate_range(&request.series, &request.grid, request.range.clone());
    let frequencies = request
        .include_frequencies
        .then(|| grid_frequencies(&request.grid, request.range.clone()));
    ScanResponse {
        worker,
        scan_id: request.scan_id,
        range: request.range,
        frequencies,
        powers,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
