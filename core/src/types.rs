//! Common types shared across the prewhitening pipeline.
//!
//! These structures represent the data objects of a Lomb-Scargle
//! prewhitening run: the photometric time series, the frequency grid a
//! periodogram is evaluated on, the periodogram itself, and the sinusoidal
//! components extracted from the light curve.

use std::f64::consts::{PI, TAU};

use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

// ---------------------------------------------------------------------------
// TimeSeries
// ---------------------------------------------------------------------------

/// Errors raised while constructing a [`TimeSeries`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TimeSeriesError {
    #[error("time series needs at least 2 samples, got {got}")]
    TooFewSamples { got: usize },

    #[error("time and flux columns differ in length ({times} vs {flux})")]
    LengthMismatch { times: usize, flux: usize },

    #[error("non-finite value at sample {index}")]
    NonFinite { index: usize },

    #[error("timestamps are not sorted at sample {index}")]
    Unsorted { index: usize },
}

/// A photometric light curve: flux measured at (possibly irregular) times.
///
/// The series is immutable once built.  Parallel workers receive it behind
/// an [`std::sync::Arc`], so the only way to "change" a series is to build a
/// new one (see [`TimeSeries::with_flux`]).
#[derive(Clone, Debug, PartialEq)]
pub struct TimeSeries {
    times: Array1<f64>,
    flux: Array1<f64>,
    mean_flux: f64,
}

impl TimeSeries {
    /// Build a series from two equal-length columns.
    ///
    /// Rejects fewer than 2 samples, non-finite values and timestamps that
    /// decrease.
    pub fn new(times: Vec<f64>, flux: Vec<f64>) -> Result<Self, TimeSeriesError> {
        if times.len() != flux.len() {
            return Err(TimeSeriesError::LengthMismatch {
                times: times.len(),
                flux: flux.len(),
            });
        }
        Self::from_arrays(Array1::from(times), Array1::from(flux))
    }

    fn from_arrays(times: Array1<f64>, flux: Array1<f64>) -> Result<Self, TimeSeriesError> {
        if times.len() < 2 {
            return Err(TimeSeriesError::TooFewSamples { got: times.len() });
        }
        for (index, (&t, &y)) in times.iter().zip(flux.iter()).enumerate() {
            if !t.is_finite() || !y.is_finite() {
                return Err(TimeSeriesError::NonFinite { index });
            }
            if index > 0 && t < times[index - 1] {
                return Err(TimeSeriesError::Unsorted { index });
            }
        }

        let mean_flux = flux.sum() / flux.len() as f64;
        Ok(Self {
            times,
            flux,
            mean_flux,
        })
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.times.len()
    }

    /// Always `false`; a series holds at least two samples.
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn times(&self) -> ArrayView1<'_, f64> {
        self.times.view()
    }

    pub fn flux(&self) -> ArrayView1<'_, f64> {
        self.flux.view()
    }

    pub fn mean_flux(&self) -> f64 {
        self.mean_flux
    }

    /// Last timestamp minus first timestamp.
    pub fn time_span(&self) -> f64 {
        self.times[self.len() - 1] - self.times[0]
    }

    /// Peak-to-peak flux range.
    pub fn flux_range(&self) -> f64 {
        let (lo, hi) = self
            .flux
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &y| {
                (lo.min(y), hi.max(y))
            });
        hi - lo
    }

    /// Copy of the series with the mean flux subtracted.
    pub fn centered(&self) -> TimeSeries {
        let flux = &self.flux - self.mean_flux;
        let mean_flux = flux.sum() / flux.len() as f64;
        TimeSeries {
            times: self.times.clone(),
            flux,
            mean_flux,
        }
    }

    /// New series sharing these timestamps with a replacement flux column.
    pub fn with_flux(&self, flux: Array1<f64>) -> Result<TimeSeries, TimeSeriesError> {
        if flux.len() != self.len() {
            return Err(TimeSeriesError::LengthMismatch {
                times: self.len(),
                flux: flux.len(),
            });
        }
        Self::from_arrays(self.times.clone(), flux)
    }
}

// ---------------------------------------------------------------------------
// Frequency grid
// ---------------------------------------------------------------------------

/// Closed frequency interval `[min, max]`, in cycles per time unit.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrequencyRange {
    pub min: f64,
    pub max: f64,
}

impl FrequencyRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn width(&self) -> f64 {
        self.max - self.min
    }

    /// Value at fraction `u` of the way from `min` to `max`.
    pub fn lerp(&self, u: f64) -> f64 {
        self.min + self.width() * u
    }
}

/// Evenly spaced frequencies `min + width·i/K` for `i` in `0..K`.
///
/// The upper bound is approached but not sampled.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrequencyGrid {
    range: FrequencyRange,
    samples: usize,
}

impl FrequencyGrid {
    pub fn new(range: FrequencyRange, samples: usize) -> Result<Self, ConfigError> {
        let finite = range.min.is_finite() && range.max.is_finite();
        if !(finite && range.min > 0.0 && range.max > range.min) {
            return Err(ConfigError::InvalidFrequencyRange {
                min: range.min,
                max: range.max,
            });
        }
        if samples == 0 {
            return Err(ConfigError::ZeroTrials("periodogram_samples"));
        }
        Ok(Self { range, samples })
    }

    pub fn range(&self) -> FrequencyRange {
        self.range
    }

    /// Number of grid points `K`.
    pub fn len(&self) -> usize {
        self.samples
    }

    pub fn is_empty(&self) -> bool {
        self.samples == 0
    }

    pub fn step(&self) -> f64 {
        self.range.width() / self.samples as f64
    }

    /// Frequency at grid index `i`.
    pub fn frequency(&self, i: usize) -> f64 {
        self.range.min + self.range.width() * i as f64 / self.samples as f64
    }

    /// Same sample count over a different range.
    pub fn with_range(&self, range: FrequencyRange) -> Result<Self, ConfigError> {
        Self::new(range, self.samples)
    }
}

// ---------------------------------------------------------------------------
// Periodogram
// ---------------------------------------------------------------------------

/// One Lomb-Scargle scan: power at every grid frequency plus its peak.
#[derive(Clone, Debug, PartialEq)]
pub struct Periodogram {
    pub frequencies: Vec<f64>,
    pub powers: Vec<f64>,
    pub peak_index: usize,
    pub peak_frequency: f64,
    pub peak_power: f64,
    /// Sample count of the scanned series, needed for amplitude conversion.
    pub series_len: usize,
}

impl Periodogram {
    /// Assemble a periodogram and locate its peak.
    ///
    /// The peak is the first strict maximum in increasing-frequency order,
    /// so ties resolve to the lowest frequency.
    pub fn from_parts(frequencies: Vec<f64>, powers: Vec<f64>, series_len: usize) -> Self {
        let peak_index = peak_index(&powers);
        let peak_frequency = frequencies.get(peak_index).copied().unwrap_or(0.0);
        let peak_power = powers.get(peak_index).copied().unwrap_or(0.0);
        Self {
            frequencies,
            powers,
            peak_index,
            peak_frequency,
            peak_power,
            series_len,
        }
    }

    /// Sinusoid amplitude implied by `power`: `2·sqrt(power/n)`.
    pub fn amplitude_of(&self, power: f64) -> f64 {
        amplitude_from_power(power, self.series_len)
    }

    pub fn peak_amplitude(&self) -> f64 {
        self.amplitude_of(self.peak_power)
    }

    /// The whole spectrum converted to amplitudes.
    pub fn amplitude_spectrum(&self) -> Vec<f64> {
        self.powers.iter().map(|&p| self.amplitude_of(p)).collect()
    }
}

/// Convert Lomb-Scargle power to the amplitude of the matching sinusoid.
pub fn amplitude_from_power(power: f64, series_len: usize) -> f64 {
    if series_len == 0 || power <= 0.0 {
        return 0.0;
    }
    2.0 * (power / series_len as f64).sqrt()
}

fn peak_index(powers: &[f64]) -> usize {
    let mut best = 0;
    for (i, &p) in powers.iter().enumerate().skip(1) {
        if p > powers[best] {
            best = i;
        }
    }
    best
}

// ---------------------------------------------------------------------------
// SineComponent
// ---------------------------------------------------------------------------

/// A single extracted periodic signal `A·sin(ω·t + φ) + c`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SineComponent {
    pub amplitude: f64,
    /// `2π·frequency`.
    pub angular_frequency: f64,
    /// Phase at `t = 0`, wrapped into `[0, 2π)`.
    pub phase: f64,
    pub vertical_shift: f64,
}

impl SineComponent {
    pub fn new(amplitude: f64, frequency: f64, phase: f64, vertical_shift: f64) -> Self {
        Self {
            amplitude,
            angular_frequency: 2.0 * PI * frequency,
            phase: wrap_phase(phase),
            vertical_shift,
        }
    }

    /// Frequency in cycles per time unit.
    pub fn frequency(&self) -> f64 {
        self.angular_frequency / (2.0 * PI)
    }

    pub fn evaluate(&self, t: f64) -> f64 {
        self.amplitude * (self.angular_frequency * t + self.phase).sin() + self.vertical_shift
    }

    /// Model values at every timestamp.
    pub fn evaluate_at(&self, times: ArrayView1<'_, f64>) -> Array1<f64> {
        times.mapv(|t| self.evaluate(t))
    }

    /// Phase of the sinusoid at time `epoch`, wrapped into `[0, 2π)`.
    pub fn phase_at(&self, epoch: f64) -> f64 {
        wrap_phase(self.angular_frequency * epoch + self.phase)
    }
}

/// Wrap an angle into `[0, 2π)`.
pub fn wrap_phase(phase: f64) -> f64 {
    let wrapped = phase.rem_euclid(TAU);
    // rem_euclid can round up to exactly 2π for tiny negative inputs
    if wrapped >= TAU {
        0.0
    } else {
        wrapped
    }
}

/// Statistics attached to an accepted component.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComponentStats {
    pub snr: f64,
    pub amplitude_uncertainty: f64,
    pub phase_uncertainty: f64,
    pub frequency_uncertainty: f64,
    /// Phase at the configured reference epoch.
    pub epoch_phase: f64,
    /// Residual sum of squares of the fit.
    pub rss: f64,
    /// Amplitude in millimagnitudes, when the mean flux allows it.
    pub magnitude_amplitude: Option<f64>,
}
