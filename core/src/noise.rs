//! Noise estimates behind the signal-to-noise stopping rule.
//!
//! Two families are supported:
//!
//! * **spectrum statistics**: the amplitude of the accepted peak compared
//!   with the median (or standard deviation) of the amplitude spectrum it
//!   was picked from;
//! * **binned residual**: the residual left after subtracting the component
//!   is detrended with a "middle line" (bin means joined by straight
//!   segments) and the mean squared deviation from that line is the noise
//!   power.  SNR is then a power ratio, `(A²/2) / noise_power`.
//!
//! Every estimator returns `None` when the noise level is zero or not
//! finite; the engine reports that as a degenerate fit.

use serde::{Deserialize, Serialize};

use crate::types::TimeSeries;

/// How the noise level of an iteration is measured.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseModel {
    /// Peak amplitude over the median of the amplitude spectrum.
    SpectrumMedian,
    /// Peak amplitude over the population standard deviation of the
    /// amplitude spectrum.
    SpectrumStdDev,
    /// Half the squared amplitude over the power of the detrended residual.
    BinnedResidual,
}

impl NoiseModel {
    /// Signal-to-noise ratio of a component with `amplitude`.
    ///
    /// `spectrum` is the amplitude spectrum the component was found in and
    /// `residual` the series left after subtracting it.
    pub fn snr(
        &self,
        amplitude: f64,
        spectrum: &[f64],
        residual: &TimeSeries,
        bin_size: usize,
    ) -> Option<f64> {
        match self {
            NoiseModel::SpectrumMedian => ratio(amplitude, median(spectrum)?),
            NoiseModel::SpectrumStdDev => ratio(amplitude, std_dev(spectrum)?),
            NoiseModel::BinnedResidual => ratio(
                amplitude * amplitude / 2.0,
                binned_noise_power(residual, bin_size)?,
            ),
        }
    }
}

fn ratio(signal: f64, noise: f64) -> Option<f64> {
    if !(noise.is_finite() && noise > 0.0) {
        return None;
    }
    let snr = signal / noise;
    snr.is_finite().then_some(snr)
}

/// Median of `values`; the mean of the two middle values for even counts.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Some(sorted[mid])
    } else {
        Some(0.5 * (sorted[mid - 1] + sorted[mid]))
    }
}

/// Population standard deviation of `values`.
pub fn std_dev(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some(variance.sqrt())
}

// ---------------------------------------------------------------------------
// Middle line
// ---------------------------------------------------------------------------

/// Piecewise-linear trend through a series.
///
/// Nodes are the first sample, the means of consecutive bins of
/// `bin_size` samples taken from the second sample on (a short final bin
/// is averaged over what it holds), and the last sample.
#[derive(Clone, Debug, PartialEq)]
pub struct MiddleLine {
    pub times: Vec<f64>,
    pub values: Vec<f64>,
}

impl MiddleLine {
    pub fn through(series: &TimeSeries, bin_size: usize) -> Self {
        let times = series.times();
        let flux = series.flux();
        let n = series.len();
        let bin_size = bin_size.max(1);

        let mut node_t = vec![times[0]];
        let mut node_y = vec![flux[0]];

        let (mut sum_t, mut sum_y, mut count) = (0.0, 0.0, 0usize);
        for i in 1..n {
            sum_t += times[i];
            sum_y += flux[i];
            count += 1;
            if count == bin_size {
                node_t.push(sum_t / count as f64);
                node_y.push(sum_y / count as f64);
                sum_t = 0.0;
                sum_y = 0.0;
                count = 0;
            }
        }
        if count > 0 {
            node_t.push(sum_t / count as f64);
            node_y.push(sum_y / count as f64);
        }

        node_t.push(times[n - 1]);
        node_y.push(flux[n - 1]);

        Self {
            times: node_t,
            values: node_y,
        }
    }

    /// Trend value at time `t`, interpolated along the segment containing
    /// it.  A zero-width segment takes its left node's value.
    pub fn value_at(&self, t: f64) -> f64 {
        let last = self.times.len() - 1;
        let right = self.times.partition_point(|&x| x < t).clamp(1, last);
        let left = right - 1;
        let dx = self.times[right] - self.times[left];
        if dx <= 0.0 {
            return self.values[left];
        }
        let slope = (self.values[right] - self.values[left]) / dx;
        self.values[left] + slope * (t - self.times[left])
    }
}

/// Mean squared deviation of `series` from its [`MiddleLine`].
pub fn binned_noise_power(series: &TimeSeries, bin_size: usize) -> Option<f64> {
    let line = MiddleLine::through(series, bin_size);
    let total: f64 = series
        .times()
        .iter()
        .zip(series.flux().iter())
        .map(|(&t, &y)| (y - line.value_at(t)).powi(2))
        .sum();
    let power = total / series.len() as f64;
    power.is_finite().then_some(power)
}
