//! Prewhitening engine: iterative extraction of sinusoidal components.
//!
//! # Background
//!
//! A pulsating star's light curve is the sum of many sinusoids.  The
//! strongest one hides the weaker ones in the periodogram through its
//! spectral window, so components are removed one at a time: find the
//! dominant frequency, fit a sinusoid there, subtract it, and search the
//! residual again.  The loop ends once the newest component is no longer
//! significant against the noise.
//!
//! # State machine
//!
//! ```text
//!   SCANNING ─▶ FITTING ─▶ SUBTRACTING ─▶ EVALUATING ─┬─▶ SCANNING
//!                  │                                  └─▶ STOPPED
//!                  └──(degenerate fit)──────────────────▶ STOPPED
//! ```
//!
//! 1. **Scanning**: Lomb-Scargle scan of the current residual over the
//!    worker pool.
//! 2. **Fitting**: refine amplitude and phase (and, with coordinate
//!    descent, frequency) at the periodogram peak.
//! 3. **Subtracting**: `residual − model`, published as a new immutable
//!    snapshot for the next scan.
//! 4. **Evaluating**: SNR from the configured [`NoiseModel`]; below the
//!    threshold, once `min_components` have been accepted, the run stops
//!    and the candidate is discarded.
//!
//! Once a component is accepted, and at least two are known, every
//! accepted component is refitted against the centered series with all
//! the others removed (backfitting, `refit_sweeps` passes).  Fitting one
//! sinusoid at a time leaves a little of each neighbour's spectral window
//! in every fit; without the joint pass that leakage comes back as extra
//! components next to the real ones.
//!
//! The iteration cap stops the run as well.  The worker pool is shut down
//! exactly once, whichever way the run ends.

use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};
use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, PrewhitenConfig};
use crate::noise::NoiseModel;
use crate::pool::{PoolError, WorkerPool};
use crate::refiner::{
    local_fit, RefinerSettings, SeededSampler, SineFitRefiner, Uncertainties, UnitSampler,
};
use crate::report::FrequencyTable;
use crate::scanner::{PeriodogramScanner, ScanError};
use crate::types::{ComponentStats, FrequencyGrid, SineComponent, TimeSeries, TimeSeriesError};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that abort a prewhitening run.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PrewhitenError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid time series: {0}")]
    Series(#[from] TimeSeriesError),

    #[error("periodogram scan failed: {0}")]
    Scan(#[from] ScanError),

    #[error("worker pool failed: {0}")]
    Pool(#[from] PoolError),
}

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Phase of the extraction loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    Scanning,
    Fitting,
    Subtracting,
    Evaluating,
    Stopped,
}

/// Why a run ended.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopReason {
    /// The candidate of `iteration` fell below the SNR threshold.
    BelowThreshold { iteration: usize, snr: f64 },
    /// `max_components` iterations were run.
    IterationCap { iterations: usize },
    /// The fit of `iteration` could not be used.
    DegenerateFit { iteration: usize, reason: String },
}

/// An accepted component and the residual left after removing it.
#[derive(Clone, Debug, PartialEq)]
pub struct ExtractedComponent {
    pub component: SineComponent,
    pub stats: ComponentStats,
    pub residual: Arc<TimeSeries>,
}

/// Output of [`PrewhitenEngine::run`].
#[derive(Clone, Debug, PartialEq)]
pub struct PrewhitenResult {
    /// Components in extraction order.
    pub components: Vec<ExtractedComponent>,
    pub stop_reason: StopReason,
    /// Seed of the random guess generator; replays the run.
    pub seed: u64,
    /// Mean of the input flux (subtracted before the first scan).
    pub mean_flux: f64,
    /// Frequency axis of the retained spectra.
    pub frequencies: Vec<f64>,
    /// Amplitude spectra of the first accepted iterations.
    pub spectra: Vec<Vec<f64>>,
    /// Amplitude spectrum of the final residual.
    pub final_spectrum: Vec<f64>,
    pub elapsed_ms: u64,
}

impl PrewhitenResult {
    /// The final residual, or `None` if nothing was extracted.
    pub fn residual(&self) -> Option<&Arc<TimeSeries>> {
        self.components.last().map(|c| &c.residual)
    }

    /// Flat one-row-per-component table.
    pub fn table(&self) -> FrequencyTable {
        FrequencyTable::from_result(self)
    }
}

/// Amplitude in millimagnitudes, `1250·log10((mean + A) / (mean − A))`.
///
/// Undefined unless `mean > A`.
pub fn magnitude_amplitude(mean_flux: f64, amplitude: f64) -> Option<f64> {
    if !(mean_flux > amplitude) {
        return None;
    }
    let mmag = 1250.0 * ((mean_flux + amplitude) / (mean_flux - amplitude)).log10();
    mmag.is_finite().then_some(mmag)
}

// ---------------------------------------------------------------------------
// PrewhitenEngine
// ---------------------------------------------------------------------------

/// Drives scan, fit, subtract and evaluate until the stopping rule fires.
#[derive(Clone, Debug)]
pub struct PrewhitenEngine {
    config: PrewhitenConfig,
}

struct Extraction {
    components: Vec<ExtractedComponent>,
    stop_reason: StopReason,
    frequencies: Vec<f64>,
    spectra: Vec<Vec<f64>>,
    final_spectrum: Vec<f64>,
}

impl PrewhitenEngine {
    /// Create an engine; the configuration is validated here.
    pub fn new(config: PrewhitenConfig) -> Result<Self, PrewhitenError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PrewhitenConfig {
        &self.config
    }

    /// Extract components from `series`.
    ///
    /// The series is centered first; its mean is kept for the magnitude
    /// amplitudes.
    pub fn run(&self, series: &TimeSeries) -> Result<PrewhitenResult, PrewhitenError> {
        let start = Instant::now();
        let config = &self.config;

        let sampler = match config.seed {
            Some(seed) => SeededSampler::new(seed),
            None => SeededSampler::from_entropy(),
        };
        let seed = sampler.seed();

        let grid = FrequencyGrid::new(config.frequency_range, config.periodogram_samples)?;
        let initial = Arc::new(series.centered());

        info!(
            "Prewhitening {} samples over {:.4}, f=[{}, {}), K={}, workers={}, seed={}",
            series.len(),
            series.time_span(),
            grid.range().min,
            grid.range().max,
            grid.len(),
            config.workers,
            seed,
        );

        let pool = WorkerPool::new(config.workers, grid)?;
        let mut scanner = PeriodogramScanner::new(pool, config.scan_timeout());
        let mut refiner = SineFitRefiner::new(RefinerSettings::from(config), sampler);

        let outcome = self.extract(&mut scanner, &mut refiner, &initial, series.mean_flux());
        let stopped = scanner.shutdown();
        let extraction = outcome?;
        stopped?;

        let elapsed = start.elapsed().as_millis() as u64;
        info!(
            "Prewhitening complete in {} ms: {} components ({:?})",
            elapsed,
            extraction.components.len(),
            extraction.stop_reason,
        );

        Ok(PrewhitenResult {
            components: extraction.components,
            stop_reason: extraction.stop_reason,
            seed,
            mean_flux: series.mean_flux(),
            frequencies: extraction.frequencies,
            spectra: extraction.spectra,
            final_spectrum: extraction.final_spectrum,
            elapsed_ms: elapsed,
        })
    }

    // ======================================================================
    // Internal helpers
    // ======================================================================

    fn extract<S: UnitSampler>(
        &self,
        scanner: &mut PeriodogramScanner,
        refiner: &mut SineFitRefiner<S>,
        centered: &Arc<TimeSeries>,
        mean_flux: f64,
    ) -> Result<Extraction, PrewhitenError> {
        let config = &self.config;
        let window = refiner.settings().polish_window;
        let mut residual = Arc::clone(centered);
        let mut state = EngineState::Scanning;
        let mut components: Vec<ExtractedComponent> = Vec::new();
        let mut spectra = Vec::new();
        let mut frequencies = Vec::new();
        let mut last_spectrum = Vec::new();
        let mut stop_reason = None;

        for iteration in 0..config.max_components {
            transition(&mut state, EngineState::Scanning, iteration);
            let periodogram = scanner.scan(&residual, None)?;
            let amplitudes = periodogram.amplitude_spectrum();
            if frequencies.is_empty() {
                frequencies = periodogram.frequencies.clone();
            }

            transition(&mut state, EngineState::Fitting, iteration);
            let fit = match refiner.refine(
                &residual,
                periodogram.peak_frequency,
                periodogram.peak_power,
            ) {
                Ok(fit) => fit,
                Err(reason) => {
                    warn!("Iteration {}: degenerate fit ({})", iteration, reason);
                    last_spectrum = amplitudes;
                    stop_reason = Some(StopReason::DegenerateFit {
                        iteration,
                        reason: reason.to_string(),
                    });
                    break;
                }
            };

            transition(&mut state, EngineState::Subtracting, iteration);
            let model = fit.component.evaluate_at(residual.times());
            let next = Arc::new(residual.with_flux(&residual.flux() - &model)?);

            transition(&mut state, EngineState::Evaluating, iteration);
            let amplitude = fit.component.amplitude;
            let snr = match config
                .noise_model
                .snr(amplitude, &amplitudes, &next, config.noise_bin_size)
            {
                Some(snr) => snr,
                None => {
                    warn!("Iteration {}: noise level is zero, SNR undefined", iteration);
                    last_spectrum = amplitudes;
                    stop_reason = Some(StopReason::DegenerateFit {
                        iteration,
                        reason: noise_reason(config.noise_model).to_string(),
                    });
                    break;
                }
            };

            if snr < config.snr_threshold && components.len() >= config.min_components {
                info!(
                    "Iteration {}: f={:.6} A={:.6} SNR={:.3} below threshold {}, stopping",
                    iteration,
                    fit.component.frequency(),
                    amplitude,
                    snr,
                    config.snr_threshold,
                );
                last_spectrum = amplitudes;
                stop_reason = Some(StopReason::BelowThreshold { iteration, snr });
                break;
            }

            let magnitude = magnitude_amplitude(mean_flux, amplitude);
            if magnitude.is_none() {
                warn!(
                    "Iteration {}: mean flux {:.6} <= amplitude {:.6}, no magnitude scale",
                    iteration, mean_flux, amplitude
                );
            }
            let stats = ComponentStats {
                snr,
                amplitude_uncertainty: fit.uncertainties.amplitude,
                phase_uncertainty: fit.uncertainties.phase,
                frequency_uncertainty: fit.uncertainties.frequency,
                epoch_phase: fit.component.phase_at(config.epoch),
                rss: fit.rss,
                magnitude_amplitude: magnitude,
            };

            info!(
                "Iteration {}: f={:.6} A={:.6} phase={:.4} SNR={:.3}",
                iteration,
                fit.component.frequency(),
                amplitude,
                fit.component.phase,
                snr,
            );

            if spectra.len() < config.retained_spectra {
                spectra.push(amplitudes);
            }
            components.push(ExtractedComponent {
                component: fit.component,
                stats,
                residual: Arc::clone(&next),
            });

            if components.len() > 1 && config.refit_sweeps > 0 && window > 0.0 {
                let joint =
                    refit_components(centered, &mut components, config.refit_sweeps, window)?;
                refresh_stats(&mut components, &joint, mean_flux, config.epoch);
                debug!(
                    "Iteration {}: refitted {} components, residual rmsd {:.6e}",
                    iteration,
                    components.len(),
                    rms(&joint)
                );
                if let Some(last) = components.last_mut() {
                    last.residual = Arc::clone(&joint);
                }
                residual = joint;
            } else {
                residual = next;
            }
        }

        let stop_reason = match stop_reason {
            Some(reason) => reason,
            None => {
                debug!("Iteration cap reached, scanning the final residual");
                last_spectrum = scanner.scan(&residual, None)?.amplitude_spectrum();
                StopReason::IterationCap {
                    iterations: config.max_components,
                }
            }
        };
        transition(&mut state, EngineState::Stopped, components.len());

        Ok(Extraction {
            components,
            stop_reason,
            frequencies,
            spectra,
            final_spectrum: last_spectrum,
        })
    }
}

/// Backfitting: each component in turn is refitted locally to the centered
/// series minus every other component.  Returns the joint residual.
fn refit_components(
    centered: &TimeSeries,
    components: &mut [ExtractedComponent],
    sweeps: usize,
    window: f64,
) -> Result<Arc<TimeSeries>, TimeSeriesError> {
    let times = centered.times();
    let mut models: Vec<Array1<f64>> = components
        .iter()
        .map(|c| c.component.evaluate_at(times))
        .collect();
    let mut residual = models
        .iter()
        .fold(centered.flux().to_owned(), |acc, model| acc - model);

    for _ in 0..sweeps {
        for (extracted, model) in components.iter_mut().zip(models.iter_mut()) {
            let partial = centered.with_flux(&residual + &*model)?;
            if let Some(local) = local_fit(&partial, extracted.component.frequency(), window) {
                extracted.component = local.component;
                *model = local.component.evaluate_at(times);
            }
            residual = &partial.flux() - &*model;
        }
    }
    Ok(Arc::new(centered.with_flux(residual)?))
}

/// Re-derive the statistics that depend on the fitted parameters.  The
/// SNR that admitted each component is kept.
fn refresh_stats(
    components: &mut [ExtractedComponent],
    residual: &TimeSeries,
    mean_flux: f64,
    epoch: f64,
) {
    let total: f64 = residual.flux().iter().map(|r| r * r).sum();
    for extracted in components.iter_mut() {
        let component = extracted.component;
        let stats = &mut extracted.stats;
        match Uncertainties::from_fit(
            total,
            residual.len(),
            component.amplitude,
            residual.time_span(),
        ) {
            Ok(u) => {
                stats.amplitude_uncertainty = u.amplitude;
                stats.phase_uncertainty = u.phase;
                stats.frequency_uncertainty = u.frequency;
                stats.rss = total;
            }
            Err(reason) => debug!(
                "Keeping uncertainties of f={:.6}: {}",
                component.frequency(),
                reason
            ),
        }
        stats.epoch_phase = component.phase_at(epoch);
        stats.magnitude_amplitude = magnitude_amplitude(mean_flux, component.amplitude);
    }
}

fn rms(series: &TimeSeries) -> f64 {
    (series.flux().iter().map(|y| y * y).sum::<f64>() / series.len() as f64).sqrt()
}

fn transition(state: &mut EngineState, next: EngineState, iteration: usize) {
    debug!("Iteration {}: {:?} -> {:?}", iteration, state, next);
    *state = next;
}

fn noise_reason(model: NoiseModel) -> &'static str {
    match model {
        NoiseModel::SpectrumMedian => "median of the amplitude spectrum is zero",
        NoiseModel::SpectrumStdDev => "amplitude spectrum has zero spread",
        NoiseModel::BinnedResidual => "binned residual has zero noise power",
    }
}
