//! Run configuration for the prewhitening engine.
//!
//! [`PrewhitenConfig::default`] reproduces the fast Lomb-Scargle /
//! least-squares tool: phase-only fitting at the periodogram peak and an
//! SNR measured against the median of the amplitude spectrum.
//! [`PrewhitenConfig::full`] reproduces the slower least-squares tool:
//! seeded random guesses followed by coordinate descent, with noise
//! estimated from binned and detrended residuals.
//!
//! Configurations are plain serde structs, so they can be loaded from a
//! JSON document with every field optional.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::noise::NoiseModel;
use crate::refiner::FitStrategy;
use crate::types::{FrequencyGrid, FrequencyRange};

/// Errors detected while validating a configuration.  All of them are
/// raised before any worker is spawned.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("frequency range [{min}, {max}] is invalid; need 0 < min < max")]
    InvalidFrequencyRange { min: f64, max: f64 },

    #[error("worker count must be at least 1")]
    ZeroWorkers,

    #[error("{0} must be at least 1")]
    ZeroTrials(&'static str),

    #[error("min_components ({min}) exceeds max_components ({max})")]
    ComponentBounds { min: usize, max: usize },

    #[error("noise_bin_size must be at least 2, got {0}")]
    BinTooSmall(usize),

    #[error("snr_threshold must be positive and finite, got {0}")]
    InvalidThreshold(f64),

    #[error("scan timeout must be positive")]
    ZeroTimeout,

    #[error("cannot parse configuration: {0}")]
    Parse(String),
}

/// All options recognised by [`crate::PrewhitenEngine`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrewhitenConfig {
    /// Frequencies searched by the periodogram and the frequency
    /// coordinate of the refiner.
    pub frequency_range: FrequencyRange,

    /// Total periodogram samples `K` across all workers.
    pub periodogram_samples: usize,

    /// Size of the periodogram worker pool.
    pub workers: usize,

    /// Evenly spaced phases tried by the phase grid search.
    pub phase_trials: usize,

    pub fit_strategy: FitStrategy,

    /// Seeded random parameter guesses competing with the periodogram
    /// seed (coordinate-descent strategy only).
    pub random_guesses: usize,

    /// Grid points per coordinate per coordinate-descent pass.
    pub tune_trials: usize,

    /// Maximum coordinate-descent passes; stops early without improvement.
    pub tune_iterations: usize,

    /// Finish every fit with an exact least-squares search within one
    /// periodogram step of the fitted frequency.
    pub local_refinement: bool,

    /// Backfitting sweeps over all accepted components after each new one;
    /// `0` keeps every component as it was first fitted.
    pub refit_sweeps: usize,

    pub noise_model: NoiseModel,

    /// Components with an SNR below this value end the run.
    pub snr_threshold: f64,

    /// Components accepted regardless of SNR before the threshold applies.
    pub min_components: usize,

    /// Hard cap on prewhitening iterations.
    pub max_components: usize,

    /// Samples per bin for [`NoiseModel::BinnedResidual`].
    pub noise_bin_size: usize,

    /// Seed for the random guess generator; drawn from entropy and
    /// recorded in the result when absent.
    pub seed: Option<u64>,

    /// Reference time for the reported epoch phase.
    pub epoch: f64,

    /// Longest wait for all workers to report one scan.
    pub scan_timeout_ms: u64,

    /// Number of leading iterations whose amplitude spectra are kept.
    pub retained_spectra: usize,
}

impl Default for PrewhitenConfig {
    fn default() -> Self {
        Self {
            frequency_range: FrequencyRange::new(0.1, 10.0),
            // oversamples a ~27 day sector by roughly 20
            periodogram_samples: 10_394,
            workers: num_cpus::get(),
            phase_trials: 10_000,
            fit_strategy: FitStrategy::PhaseGrid,
            random_guesses: 0,
            tune_trials: 50_000,
            tune_iterations: 7,
            local_refinement: true,
            refit_sweeps: 3,
            noise_model: NoiseModel::SpectrumMedian,
            snr_threshold: 5.124,
            min_components: 0,
            max_components: 100,
            noise_bin_size: 10,
            seed: None,
            epoch: 0.0,
            scan_timeout_ms: 300_000,
            retained_spectra: 3,
        }
    }
}

impl PrewhitenConfig {
    /// Settings of the exhaustive least-squares variant.
    pub fn full() -> Self {
        Self {
            frequency_range: FrequencyRange::new(1.0 / 60.0, 1.0 / 0.11111),
            fit_strategy: FitStrategy::CoordinateDescent,
            random_guesses: 100_000,
            tune_trials: 400_000 / 7,
            tune_iterations: 7,
            noise_model: NoiseModel::BinnedResidual,
            snr_threshold: 3.0,
            max_components: 10,
            ..Self::default()
        }
    }

    /// Parse a JSON document; missing fields take their default values.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    /// Check every option.  The frequency range and sample count are
    /// checked by building the grid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        FrequencyGrid::new(self.frequency_range, self.periodogram_samples)?;
        if self.workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.phase_trials == 0 {
            return Err(ConfigError::ZeroTrials("phase_trials"));
        }
        if self.fit_strategy == FitStrategy::CoordinateDescent && self.tune_trials == 0 {
            return Err(ConfigError::ZeroTrials("tune_trials"));
        }
        if self.max_components == 0 {
            return Err(ConfigError::ZeroTrials("max_components"));
        }
        if self.min_components > self.max_components {
            return Err(ConfigError::ComponentBounds {
                min: self.min_components,
                max: self.max_components,
            });
        }
        if self.noise_model == NoiseModel::BinnedResidual && self.noise_bin_size < 2 {
            return Err(ConfigError::BinTooSmall(self.noise_bin_size));
        }
        if !(self.snr_threshold.is_finite() && self.snr_threshold > 0.0) {
            return Err(ConfigError::InvalidThreshold(self.snr_threshold));
        }
        if self.scan_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert_eq!(PrewhitenConfig::default().validate(), Ok(()));
        assert_eq!(PrewhitenConfig::full().validate(), Ok(()));
    }

    #[test]
    fn test_validation_failures() {
        let bad_workers = PrewhitenConfig {
            workers: 0,
            ..PrewhitenConfig::default()
        };
        assert_eq!(bad_workers.validate(), Err(ConfigError::ZeroWorkers));

        let bad_range = PrewhitenConfig {
            frequency_range: FrequencyRange::new(5.0, 1.0),
            ..PrewhitenConfig::default()
        };
        assert!(matches!(
            bad_range.validate(),
            Err(ConfigError::InvalidFrequencyRange { .. })
        ));

        let bad_bounds = PrewhitenConfig {
            min_components: 5,
            max_components: 2,
            ..PrewhitenConfig::default()
        };
        assert_eq!(
            bad_bounds.validate(),
            Err(ConfigError::ComponentBounds { min: 5, max: 2 })
        );

        let bad_bins = PrewhitenConfig {
            noise_bin_size: 1,
            ..PrewhitenConfig::full()
        };
        assert_eq!(bad_bins.validate(), Err(ConfigError::BinTooSmall(1)));
    }

    #[test]
    fn test_json_overrides_defaults() {
        let config = PrewhitenConfig::from_json_str(
            r#"{
                "frequency_range": {"min": 0.5, "max": 4.0},
                "workers": 3,
                "fit_strategy": "coordinate_descent",
                "noise_model": "binned_residual",
                "seed": 42
            }"#,
        )
        .unwrap();

        assert_eq!(config.frequency_range, FrequencyRange::new(0.5, 4.0));
        assert_eq!(config.workers, 3);
        assert_eq!(config.fit_strategy, FitStrategy::CoordinateDescent);
        assert_eq!(config.noise_model, NoiseModel::BinnedResidual);
        assert_eq!(config.seed, Some(42));
        assert_eq!(config.phase_trials, PrewhitenConfig::default().phase_trials);
        assert!(config.local_refinement);
        assert_eq!(config.refit_sweeps, 3);
    }

    #[test]
    fn test_json_parse_error() {
        assert!(matches!(
            PrewhitenConfig::from_json_str("{\"workers\": \"many\"}"),
            Err(ConfigError::Parse(_))
        ));
    }
}
