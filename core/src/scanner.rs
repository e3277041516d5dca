//! Parallel periodogram scan over a [`WorkerPool`].
//!
//! A scan partitions the `K` grid indices into one contiguous chunk per
//! worker, dispatches every chunk, then waits at a barrier until all
//! workers have answered (or the scan timeout expires).  Chunks are
//! stitched back together in index order, so the assembled periodogram is
//! identical to [`crate::periodogram::scan_sequential`].
//!
//! The frequency axis only changes when the grid does, so workers are only
//! asked to send frequencies for the first scan of a grid; afterwards the
//! cached axis is reused.
//!
//! A scan that fails after dispatching (timeout, panic, protocol error)
//! leaves workers busy with reports that may still arrive, so the scanner
//! refuses every later scan with [`ScanError::Aborted`].  Only
//! [`PeriodogramScanner::shutdown`] remains available.

use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;

use crate::config::ConfigError;
use crate::pool::{PoolError, ScanRequest, ScanResponse, WorkerPool};
use crate::types::{FrequencyGrid, FrequencyRange, Periodogram, TimeSeries};

/// How often the barrier logs its progress while waiting.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

/// Errors raised by a scan.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScanError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("invalid scan range: {0}")]
    Range(#[from] ConfigError),

    #[error("scan {scan_id} failed earlier; the worker pool must be rebuilt")]
    Aborted { scan_id: u64 },
}

/// Split `samples` grid indices into `workers` contiguous ranges
/// `[i·K/W, (i+1)·K/W)`.  Sizes differ by at most one.
pub fn partition(samples: usize, workers: usize) -> Vec<Range<usize>> {
    (0..workers)
        .map(|i| i * samples / workers..(i + 1) * samples / workers)
        .collect()
}

/// Fans periodogram scans out over a worker pool.
pub struct PeriodogramScanner {
    pool: WorkerPool,
    timeout: Duration,
    next_scan_id: u64,
    axis: Option<(FrequencyGrid, Vec<f64>)>,
    /// Scan that failed mid-flight, if any.
    failed: Option<u64>,
}

impl PeriodogramScanner {
    pub fn new(pool: WorkerPool, timeout: Duration) -> Self {
        Self {
            pool,
            timeout,
            next_scan_id: 0,
            axis: None,
            failed: None,
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Scan `series` over the pool's grid, or over `range` with the same
    /// sample count when given.
    pub fn scan(
        &mut self,
        series: &Arc<TimeSeries>,
        range: Option<FrequencyRange>,
    ) -> Result<Periodogram, ScanError> {
        if let Some(scan_id) = self.failed {
            return Err(ScanError::Aborted { scan_id });
        }
        let grid = match range {
            Some(range) => self.pool.grid().with_range(range)?,
            None => *self.pool.grid(),
        };

        let scan_id = self.next_scan_id;
        self.next_scan_id += 1;

        let outcome = self.scan_grid(scan_id, series, grid);
        if let Err(e) = &outcome {
            debug!("Scan {} failed, scanner is no longer usable: {}", scan_id, e);
            self.failed = Some(scan_id);
        }
        outcome
    }

    fn scan_grid(
        &mut self,
        scan_id: u64,
        series: &Arc<TimeSeries>,
        grid: FrequencyGrid,
    ) -> Result<Periodogram, ScanError> {
        let cached = matches!(&self.axis, Some((axis_grid, _)) if *axis_grid == grid);

        let chunks = partition(grid.len(), self.pool.size());
        debug!(
            "Scan {}: {} samples over {} workers{}",
            scan_id,
            grid.len(),
            chunks.len(),
            if cached { "" } else { ", requesting frequencies" }
        );

        for (worker, chunk) in chunks.iter().enumerate() {
            self.pool.dispatch(
                worker,
                ScanRequest {
                    scan_id,
                    series: Arc::clone(series),
                    grid,
                    range: chunk.clone(),
                    include_frequencies: !cached,
                },
            )?;
        }

        let responses = self.wait_for_all(chunks.len())?;

        let mut powers = vec![0.0; grid.len()];
        let mut frequencies = if cached { Vec::new() } else { vec![0.0; grid.len()] };
        for response in responses {
            let range = checked_range(&response, &chunks)?;
            powers[range.clone()].copy_from_slice(&response.powers);
            if !cached {
                match &response.frequencies {
                    Some(f) if f.len() == range.len() => frequencies[range].copy_from_slice(f),
                    _ => {
                        return Err(PoolError::MalformedResponse {
                            worker: response.worker,
                            reason: "missing frequency axis".to_string(),
                        }
                        .into())
                    }
                }
            }
        }

        let frequencies = if cached {
            self.axis.as_ref().map(|(_, axis)| axis.clone()).unwrap_or_default()
        } else {
            self.axis = Some((grid, frequencies.clone()));
            frequencies
        };

        Ok(Periodogram::from_parts(frequencies, powers, series.len()))
    }

    /// Barrier: collect one response per dispatched chunk.
    fn wait_for_all(&mut self, expected: usize) -> Result<Vec<ScanResponse>, PoolError> {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut next_report = started + PROGRESS_INTERVAL;
        let mut responses = Vec::with_capacity(expected);

        while responses.len() < expected {
            match self.pool.receive(next_report.min(deadline))? {
                Some(response) => responses.push(response),
                None => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(PoolError::Timeout {
                            waited_ms: now.duration_since(started).as_millis(),
                            pending: expected - responses.len(),
                        });
                    }
                    debug!("Workers done: {} out of {}", responses.len(), expected);
                    next_report += PROGRESS_INTERVAL;
                }
            }
        }
        Ok(responses)
    }

    /// Whether an earlier scan failed and left the pool unusable.
    pub fn is_aborted(&self) -> bool {
        self.failed.is_some()
    }

    /// Stop the pool.  Fails if it was already stopped.
    pub fn shutdown(&mut self) -> Result<(), PoolError> {
        self.pool.shutdown()
    }
}

fn checked_range(
    response: &ScanResponse,
    chunks: &[Range<usize>],
) -> Result<Range<usize>, PoolError> {
    let malformed = |reason: &str| PoolError::MalformedResponse {
        worker: response.worker,
        reason: reason.to_string(),
    };
    if chunks.get(response.worker) != Some(&response.range) {
        return Err(malformed("range differs from the dispatched chunk"));
    }
    if response.powers.len() != response.range.len() {
        return Err(malformed("power count does not match its range"));
    }
    Ok(response.range.clone())
}
