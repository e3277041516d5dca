//! Lomb-Scargle periodogram evaluation.
//!
//! # Background
//!
//! The classical Fourier power spectrum assumes evenly spaced samples.
//! Space photometry is not evenly spaced once gaps, momentum dumps and
//! rejected cadences are removed, so the spectrum is estimated with the
//! Lomb-Scargle statistic instead.  For a trial frequency `f` with
//! `ω = 2πf`:
//!
//! 1. choose the time shift `τ` with
//!    `tan(2ωτ) = Σ sin(2ω·tᵢ) / Σ cos(2ω·tᵢ)`, which makes the sine and
//!    cosine terms orthogonal over the sampling;
//! 2. `cosPart = (Σ yᵢ·cos ω(tᵢ−τ))² / Σ cos² ω(tᵢ−τ)`, and `sinPart`
//!    likewise with sine;
//! 3. `power = (cosPart + sinPart) / 2`.
//!
//! Flux must already be mean-subtracted; nothing here normalises it.
//!
//! A term whose denominator is not larger than `n·ε` is treated as the
//! `0/0 → 0` limit (every basis value vanishes, so does the numerator).
//! Non-positive frequencies have no defined shift and evaluate to zero.
//! The returned power is therefore always finite and non-negative.

use std::f64::consts::PI;
use std::ops::Range;

use ndarray::ArrayView1;

use crate::types::{FrequencyGrid, Periodogram, TimeSeries};

/// Lomb-Scargle power of `flux` sampled at `times`, at one frequency.
pub fn lomb_scargle_power(
    frequency: f64,
    times: ArrayView1<'_, f64>,
    flux: ArrayView1<'_, f64>,
) -> f64 {
    if !(frequency.is_finite() && frequency > 0.0) {
        return 0.0;
    }

    let omega = 2.0 * PI * frequency;

    let (sin_sum, cos_sum) = times.iter().fold((0.0, 0.0), |(s, c), &t| {
        let (sin, cos) = (2.0 * omega * t).sin_cos();
        (s + sin, c + cos)
    });
    let tau = f64::atan2(sin_sum, cos_sum) / (2.0 * omega);

    let mut y_cos = 0.0;
    let mut y_sin = 0.0;
    let mut cos_sq = 0.0;
    let mut sin_sq = 0.0;
    for (&t, &y) in times.iter().zip(flux.iter()) {
        let (sin, cos) = (omega * (t - tau)).sin_cos();
        y_cos += y * cos;
        y_sin += y * sin;
        cos_sq += cos * cos;
        sin_sq += sin * sin;
    }

    let floor = times.len() as f64 * f64::EPSILON;
    let cos_part = if cos_sq > floor { y_cos * y_cos / cos_sq } else { 0.0 };
    let sin_part = if sin_sq > floor { y_sin * y_sin / sin_sq } else { 0.0 };

    let power = 0.5 * (cos_part + sin_part);
    if power.is_finite() {
        power.max(0.0)
    } else {
        0.0
    }
}

/// Lomb-Scargle power of a series at one frequency.
pub fn power(frequency: f64, series: &TimeSeries) -> f64 {
    lomb_scargle_power(frequency, series.times(), series.flux())
}

/// Powers for grid indices `range`, in increasing-frequency order.
///
/// This is the unit of work each pool worker performs.
pub fn evaluate_range(series: &TimeSeries, grid: &FrequencyGrid, range: Range<usize>) -> Vec<f64> {
    range.map(|i| power(grid.frequency(i), series)).collect()
}

/// Grid frequencies for indices `range`.
pub fn grid_frequencies(grid: &FrequencyGrid, range: Range<usize>) -> Vec<f64> {
    range.map(|i| grid.frequency(i)).collect()
}

/// Single-threaded scan of the whole grid.
///
/// The parallel [`crate::PeriodogramScanner`] must reproduce this result.
pub fn scan_sequential(series: &TimeSeries, grid: &FrequencyGrid) -> Periodogram {
    let frequencies = grid_frequencies(grid, 0..grid.len());
    let powers = evaluate_range(series, grid, 0..grid.len());
    Periodogram::from_parts(frequencies, powers, series.len())
}
