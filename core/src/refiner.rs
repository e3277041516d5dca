//! Least-squares refinement of a single sinusoid.
//!
//! Given the periodogram peak of the current residual, find the sinusoid
//! `A·sin(2πf·t + φ) + c` that minimises the residual sum of squares (RSS).
//!
//! Two strategies are available:
//!
//! * [`FitStrategy::PhaseGrid`] keeps the peak frequency and the amplitude
//!   implied by the peak power, and only searches the phase over an even
//!   grid.
//! * [`FitStrategy::CoordinateDescent`] starts from the phase-grid fit, lets
//!   a batch of seeded random guesses compete with it, then tunes amplitude,
//!   frequency and phase one at a time over even grids until a full pass
//!   stops improving.
//!
//! The vertical shift `c` is solved in closed form at the end.  Every grid
//! is evaluated in parallel with **rayon**; reductions keep the lowest
//! trial index among equal RSS values, so results do not depend on thread
//! scheduling.
//!
//! # Local refinement
//!
//! Both strategies leave the frequency on a grid, so a line that falls
//! between two grid points is fitted up to half a step off.  Subtracting
//! such a fit leaves a residual line next to the original one.  With a
//! non-zero [`RefinerSettings::polish_window`] the fit is finished by
//! [`local_fit`]: a golden-section search over `f ± window` in which, at
//! every trial frequency, `a·sin ωt + b·cos ωt + c` is solved exactly by
//! linear least squares.  The result replaces the grid fit whenever its
//! RSS is not worse.

use std::cmp::Ordering;
use std::f64::consts::{PI, TAU};

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::PrewhitenConfig;
use crate::types::{amplitude_from_power, FrequencyRange, SineComponent, TimeSeries};

/// Lower and upper amplitude bounds, as fractions of the flux range.
const AMPLITUDE_FRACTION: (f64, f64) = (0.01, 0.7);

/// Which optimiser [`SineFitRefiner`] runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStrategy {
    PhaseGrid,
    CoordinateDescent,
}

// ---------------------------------------------------------------------------
// Randomness
// ---------------------------------------------------------------------------

/// Source of uniform samples in `[0, 1)`.
///
/// All randomness of a run flows through one sampler, so a recorded seed
/// replays the run exactly.
pub trait UnitSampler {
    fn next_unit(&mut self) -> f64;
}

/// [`UnitSampler`] backed by a seeded [`StdRng`].
#[derive(Clone, Debug)]
pub struct SeededSampler {
    seed: u64,
    rng: StdRng,
}

impl SeededSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Sampler with a freshly drawn seed; read it back with [`Self::seed`].
    pub fn from_entropy() -> Self {
        Self::new(rand::thread_rng().gen())
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }
}

impl UnitSampler for SeededSampler {
    fn next_unit(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }
}

// ---------------------------------------------------------------------------
// Fit results
// ---------------------------------------------------------------------------

/// Reasons a fit cannot be used.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Degeneracy {
    #[error("fitted amplitude {0} is not positive")]
    NonPositiveAmplitude(f64),

    #[error("fit produced a non-finite {0}")]
    NonFinite(&'static str),

    #[error("time series covers zero time")]
    ZeroTimeSpan,
}

/// One-sigma uncertainties derived from the fit residual.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Uncertainties {
    pub rmsd: f64,
    pub amplitude: f64,
    pub phase: f64,
    pub frequency: f64,
}

impl Uncertainties {
    /// `rmsd = √(rss/n)`, `σA = √(2/n)·rmsd`, `σφ = σA/A` and
    /// `σf = σφ·√3 / (π·time_span)`.
    pub fn from_fit(
        rss: f64,
        samples: usize,
        amplitude: f64,
        time_span: f64,
    ) -> Result<Self, Degeneracy> {
        if !(amplitude > 0.0) {
            return Err(Degeneracy::NonPositiveAmplitude(amplitude));
        }
        if !(time_span > 0.0) {
            return Err(Degeneracy::ZeroTimeSpan);
        }
        let n = samples as f64;
        let rmsd = (rss / n).sqrt();
        let amplitude_sigma = (2.0 / n).sqrt() * rmsd;
        let phase_sigma = amplitude_sigma / amplitude;
        let frequency_sigma = phase_sigma * 3f64.sqrt() / (PI * time_span);

        let out = Self {
            rmsd,
            amplitude: amplitude_sigma,
            phase: phase_sigma,
            frequency: frequency_sigma,
        };
        if [out.rmsd, out.amplitude, out.phase, out.frequency]
            .iter()
            .all(|v| v.is_finite())
        {
            Ok(out)
        } else {
            Err(Degeneracy::NonFinite("uncertainty"))
        }
    }
}

/// A refined component.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Fit {
    pub component: SineComponent,
    /// RSS including the vertical shift.
    pub rss: f64,
    pub uncertainties: Uncertainties,
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Refiner options, taken from [`PrewhitenConfig`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RefinerSettings {
    pub strategy: FitStrategy,
    pub phase_trials: usize,
    pub random_guesses: usize,
    pub tune_trials: usize,
    pub tune_iterations: usize,
    pub frequency_range: FrequencyRange,
    /// Half-width of the local frequency search; `0` disables it.
    pub polish_window: f64,
}

impl From<&PrewhitenConfig> for RefinerSettings {
    fn from(config: &PrewhitenConfig) -> Self {
        Self {
            strategy: config.fit_strategy,
            phase_trials: config.phase_trials,
            random_guesses: config.random_guesses,
            tune_trials: config.tune_trials,
            tune_iterations: config.tune_iterations,
            frequency_range: config.frequency_range,
            polish_window: if config.local_refinement {
                config.frequency_range.width() / config.periodogram_samples as f64
            } else {
                0.0
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct Params {
    amplitude: f64,
    frequency: f64,
    phase: f64,
}

#[derive(Clone, Copy, Debug)]
enum Coordinate {
    Amplitude,
    Frequency,
    Phase,
}

// ---------------------------------------------------------------------------
// SineFitRefiner
// ---------------------------------------------------------------------------

/// Fits one sinusoid to a residual series.
pub struct SineFitRefiner<S: UnitSampler = SeededSampler> {
    settings: RefinerSettings,
    sampler: S,
}

impl<S: UnitSampler> SineFitRefiner<S> {
    pub fn new(settings: RefinerSettings, sampler: S) -> Self {
        Self { settings, sampler }
    }

    pub fn settings(&self) -> &RefinerSettings {
        &self.settings
    }

    pub fn sampler(&self) -> &S {
        &self.sampler
    }

    /// Fit a sinusoid to `series` starting from a periodogram peak at
    /// `frequency` with Lomb-Scargle power `peak_power`.
    pub fn refine(
        &mut self,
        series: &TimeSeries,
        frequency: f64,
        peak_power: f64,
    ) -> Result<Fit, Degeneracy> {
        let amplitude = amplitude_from_power(peak_power, series.len());
        if !(amplitude > 0.0) {
            return Err(Degeneracy::NonPositiveAmplitude(amplitude));
        }

        let (phase, grid_rss) =
            phase_grid(series, amplitude, frequency, self.settings.phase_trials);
        let mut params = Params {
            amplitude,
            frequency,
            phase,
        };
        debug!(
            "Phase grid: A={:.6} f={:.6} phase={:.6} rss={:.6}",
            amplitude, frequency, phase, grid_rss
        );

        if self.settings.strategy == FitStrategy::CoordinateDescent {
            let mut best = grid_rss;
            if let Some((guess, rss)) = self.best_random_guess(series) {
                if rss < best {
                    debug!(
                        "Random guess beats the periodogram seed: rss {:.6} < {:.6}",
                        rss, best
                    );
                    params = guess;
                    best = rss;
                }
            }
            let (tuned, tuned_rss) = self.coordinate_descent(series, params, best);
            params = tuned;
            debug!(
                "Coordinate descent: A={:.6} f={:.6} phase={:.6} rss={:.6}",
                params.amplitude, params.frequency, params.phase, tuned_rss
            );
        }

        self.finish(series, params)
    }

    fn best_random_guess(&mut self, series: &TimeSeries) -> Option<(Params, f64)> {
        if self.settings.random_guesses == 0 {
            return None;
        }
        let span = series.flux_range();
        let range = self.settings.frequency_range;

        // drawn sequentially so the sampler stream is reproducible
        let guesses: Vec<Params> = (0..self.settings.random_guesses)
            .map(|_| Params {
                amplitude: span * amplitude_fraction(self.sampler.next_unit()),
                frequency: range.lerp(self.sampler.next_unit()),
                phase: TAU * self.sampler.next_unit(),
            })
            .collect();

        let (index, rss) = argmin(guesses.len(), |k| {
            let g = guesses[k];
            rss(series, g.amplitude, g.frequency, g.phase, 0.0)
        })?;
        Some((guesses[index], rss))
    }

    fn coordinate_descent(
        &self,
        series: &TimeSeries,
        mut params: Params,
        mut best: f64,
    ) -> (Params, f64) {
        let trials = self.settings.tune_trials;
        if trials == 0 {
            return (params, best);
        }
        let span = series.flux_range();
        let range = self.settings.frequency_range;

        for pass in 0..self.settings.tune_iterations {
            let start = best;
            for coordinate in [Coordinate::Amplitude, Coordinate::Frequency, Coordinate::Phase] {
                let value = |k: usize| {
                    let u = k as f64 / trials as f64;
                    match coordinate {
                        Coordinate::Amplitude => amplitude_fraction(u) * span,
                        Coordinate::Frequency => range.lerp(u),
                        Coordinate::Phase => TAU * u,
                    }
                };
                let with = |v: f64| {
                    let mut p = params;
                    match coordinate {
                        Coordinate::Amplitude => p.amplitude = v,
                        Coordinate::Frequency => p.frequency = v,
                        Coordinate::Phase => p.phase = v,
                    }
                    p
                };

                let found = argmin(trials, |k| {
                    let p = with(value(k));
                    rss(series, p.amplitude, p.frequency, p.phase, 0.0)
                });
                if let Some((k, trial_rss)) = found {
                    if trial_rss < best {
                        params = with(value(k));
                        best = trial_rss;
                    }
                }
            }
            if !(best < start) {
                debug!("Coordinate descent converged after {} passes", pass + 1);
                break;
            }
        }
        (params, best)
    }

    fn finish(&self, series: &TimeSeries, params: Params) -> Result<Fit, Degeneracy> {
        let Params {
            amplitude,
            frequency,
            phase,
        } = params;
        if !(amplitude > 0.0) {
            return Err(Degeneracy::NonPositiveAmplitude(amplitude));
        }
        if !(frequency.is_finite() && phase.is_finite()) {
            return Err(Degeneracy::NonFinite("frequency or phase"));
        }

        let shift = vertical_shift(series, amplitude, frequency, phase);
        let mut component = SineComponent::new(amplitude, frequency, phase, shift);
        let mut total = rss(series, amplitude, frequency, phase, shift);

        let window = self.settings.polish_window;
        if window > 0.0 {
            match local_fit(series, frequency, window) {
                Some(local) if local.rss <= total => {
                    debug!(
                        "Local fit: f {:.8} -> {:.8}, A {:.6} -> {:.6}, rss {:.6e} -> {:.6e}",
                        frequency,
                        local.component.frequency(),
                        amplitude,
                        local.component.amplitude,
                        total,
                        local.rss
                    );
                    component = local.component;
                    total = local.rss;
                }
                Some(_) => {}
                None => debug!(
                    "Local refinement at f={:.6} is singular, keeping grid fit",
                    frequency
                ),
            }
        }

        if !(component.vertical_shift.is_finite() && total.is_finite()) {
            return Err(Degeneracy::NonFinite("residual sum of squares"));
        }

        let uncertainties =
            Uncertainties::from_fit(total, series.len(), component.amplitude, series.time_span())?;
        Ok(Fit {
            component,
            rss: total,
            uncertainties,
        })
    }
}

// ---------------------------------------------------------------------------
// Local refinement
// ---------------------------------------------------------------------------

/// Golden-section steps; the bracket shrinks by 0.618 each step.
const GOLDEN_STEPS: usize = 100;

/// Relative bracket width at which the search stops.
const GOLDEN_TOLERANCE: f64 = 1e-12;

/// Exact least-squares sinusoid at the best frequency near a start value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LocalFit {
    pub component: SineComponent,
    pub rss: f64,
}

/// Least-squares sinusoid with free amplitude, phase and offset, frequency
/// searched in `frequency ± window`.
///
/// `None` when the linear system is singular at every trial frequency,
/// e.g. for fewer than three samples.
pub fn local_fit(series: &TimeSeries, frequency: f64, window: f64) -> Option<LocalFit> {
    if !(frequency.is_finite() && frequency > 0.0 && window > 0.0) {
        return None;
    }
    let mut best = linear_fit(series, frequency);
    let mut evaluate = |f: f64| -> f64 {
        match linear_fit(series, f) {
            Some(fit) => {
                if best.map_or(true, |b| fit.rss < b.rss) {
                    best = Some(fit);
                }
                fit.rss
            }
            None => f64::INFINITY,
        }
    };

    let ratio = (5f64.sqrt() - 1.0) / 2.0;
    let (mut lo, mut hi) = ((frequency - window).max(0.5 * frequency), frequency + window);
    let mut left = hi - ratio * (hi - lo);
    let mut right = lo + ratio * (hi - lo);
    let mut left_rss = evaluate(left);
    let mut right_rss = evaluate(right);

    for _ in 0..GOLDEN_STEPS {
        if hi - lo <= window * GOLDEN_TOLERANCE {
            break;
        }
        if left_rss < right_rss {
            hi = right;
            right = left;
            right_rss = left_rss;
            left = hi - ratio * (hi - lo);
            left_rss = evaluate(left);
        } else {
            lo = left;
            left = right;
            left_rss = right_rss;
            right = lo + ratio * (hi - lo);
            right_rss = evaluate(right);
        }
    }

    best.map(|fit| LocalFit {
        component: fit.component(),
        rss: fit.rss,
    })
}

/// `a·sin ωt + b·cos ωt + c` at a fixed frequency.
#[derive(Clone, Copy, Debug)]
struct LinearFit {
    frequency: f64,
    sin_coef: f64,
    cos_coef: f64,
    shift: f64,
    rss: f64,
}

impl LinearFit {
    /// `a·sin x + b·cos x = A·sin(x + φ)` with `A = √(a²+b²)`, `φ = atan2(b, a)`.
    fn component(&self) -> SineComponent {
        SineComponent::new(
            self.sin_coef.hypot(self.cos_coef),
            self.frequency,
            self.cos_coef.atan2(self.sin_coef),
            self.shift,
        )
    }
}

fn linear_fit(series: &TimeSeries, frequency: f64) -> Option<LinearFit> {
    let omega = 2.0 * PI * frequency;
    let mut normal = [[0.0; 3]; 3];
    let mut rhs = [0.0; 3];
    for (&t, &y) in series.times().iter().zip(series.flux().iter()) {
        let (sin, cos) = (omega * t).sin_cos();
        let basis = [sin, cos, 1.0];
        for i in 0..3 {
            rhs[i] += basis[i] * y;
            for j in 0..3 {
                normal[i][j] += basis[i] * basis[j];
            }
        }
    }
    let [a, b, c] = solve3(normal, rhs)?;

    let rss = series
        .times()
        .iter()
        .zip(series.flux().iter())
        .map(|(&t, &y)| {
            let (sin, cos) = (omega * t).sin_cos();
            let r = y - (a * sin + b * cos + c);
            r * r
        })
        .sum::<f64>();
    if !(a.is_finite() && b.is_finite() && c.is_finite() && rss.is_finite()) {
        return None;
    }
    Some(LinearFit {
        frequency,
        sin_coef: a,
        cos_coef: b,
        shift: c,
        rss,
    })
}

/// Gaussian elimination with partial pivoting.  `None` if a pivot is
/// negligible against the largest matrix entry.
fn solve3(mut m: [[f64; 3]; 3], mut rhs: [f64; 3]) -> Option<[f64; 3]> {
    let scale = m.iter().flatten().fold(0.0f64, |acc, v| acc.max(v.abs()));
    if !(scale > 0.0) {
        return None;
    }
    for col in 0..3 {
        let pivot = (col..3).max_by(|&a, &b| m[a][col].abs().total_cmp(&m[b][col].abs()))?;
        if m[pivot][col].abs() <= scale * 1e-12 {
            return None;
        }
        m.swap(col, pivot);
        rhs.swap(col, pivot);
        for row in col + 1..3 {
            let factor = m[row][col] / m[col][col];
            for k in col..3 {
                m[row][k] -= factor * m[col][k];
            }
            rhs[row] -= factor * rhs[col];
        }
    }
    let mut x = [0.0; 3];
    for row in (0..3).rev() {
        let tail: f64 = (row + 1..3).map(|k| m[row][k] * x[k]).sum();
        x[row] = (rhs[row] - tail) / m[row][row];
    }
    Some(x)
}

// ===========================================================================
// Internal helpers
// ===========================================================================

fn amplitude_fraction(u: f64) -> f64 {
    AMPLITUDE_FRACTION.0 + (AMPLITUDE_FRACTION.1 - AMPLITUDE_FRACTION.0) * u
}

/// RSS of `series` against `A·sin(2πf·t + φ) + c`.
pub fn rss(series: &TimeSeries, amplitude: f64, frequency: f64, phase: f64, shift: f64) -> f64 {
    let omega = 2.0 * PI * frequency;
    series
        .times()
        .iter()
        .zip(series.flux().iter())
        .map(|(&t, &y)| {
            let r = y - (amplitude * (omega * t + phase).sin() + shift);
            r * r
        })
        .sum()
}

/// Offset minimising the RSS for fixed amplitude, frequency and phase.
fn vertical_shift(series: &TimeSeries, amplitude: f64, frequency: f64, phase: f64) -> f64 {
    let omega = 2.0 * PI * frequency;
    let total: f64 = series
        .times()
        .iter()
        .zip(series.flux().iter())
        .map(|(&t, &y)| y - amplitude * (omega * t + phase).sin())
        .sum();
    total / series.len() as f64
}

/// Best of `trials` evenly spaced phases `2πk/trials`.
fn phase_grid(series: &TimeSeries, amplitude: f64, frequency: f64, trials: usize) -> (f64, f64) {
    let trials = trials.max(1);
    let phase_of = |k: usize| TAU * k as f64 / trials as f64;
    argmin(trials, |k| rss(series, amplitude, frequency, phase_of(k), 0.0))
        .map(|(k, r)| (phase_of(k), r))
        .unwrap_or((0.0, f64::INFINITY))
}

/// Index with the smallest value of `f` over `0..trials`, lowest index on
/// ties.  NaN sorts above every number.
fn argmin<F>(trials: usize, f: F) -> Option<(usize, f64)>
where
    F: Fn(usize) -> f64 + Sync,
{
    (0..trials)
        .into_par_iter()
        .map(|k| (k, f(k)))
        .reduce_with(|a, b| match b.1.total_cmp(&a.1).then(b.0.cmp(&a.0)) {
            Ordering::Less => b,
            _ => a,
        })
}
