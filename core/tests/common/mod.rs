//! Synthetic light curves shared by the integration tests.

#![allow(dead_code)]

use std::f64::consts::PI;

use prewhiten_core::TimeSeries;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

/// Injected sinusoid `(amplitude, frequency, phase)`.
pub type Injection = (f64, f64, f64);

/// `n` timestamps `i·cadence + U(0, jitter)`.
pub fn jittered_times(n: usize, cadence: f64, jitter: f64, rng: &mut StdRng) -> Vec<f64> {
    (0..n)
        .map(|i| i as f64 * cadence + jitter * rng.gen::<f64>())
        .collect()
}

/// Sum of `injections` at `times` plus white Gaussian noise of width `sigma`.
pub fn synthetic_flux(
    times: &[f64],
    injections: &[Injection],
    sigma: f64,
    rng: &mut StdRng,
) -> Vec<f64> {
    let normal = Normal::new(0.0, sigma).unwrap();
    times
        .iter()
        .map(|&t| {
            let signal: f64 = injections
                .iter()
                .map(|&(a, f, p)| a * (2.0 * PI * f * t + p).sin())
                .sum();
            signal + normal.sample(rng)
        })
        .collect()
}

/// Irregular light curve with the given components, offset by `mean`.
pub fn light_curve(
    n: usize,
    cadence: f64,
    jitter: f64,
    injections: &[Injection],
    sigma: f64,
    mean: f64,
    seed: u64,
) -> TimeSeries {
    let mut rng = StdRng::seed_from_u64(seed);
    let times = jittered_times(n, cadence, jitter, &mut rng);
    let flux: Vec<f64> = synthetic_flux(&times, injections, sigma, &mut rng)
        .into_iter()
        .map(|y| y + mean)
        .collect();
    TimeSeries::new(times, flux).unwrap()
}

/// SplitMix64 output `i` as a uniform draw in `[0, 1)`.
///
/// Stateless, so a curve's noise depends on nothing but its index.
pub fn splitmix_unit(i: u64) -> f64 {
    const GOLDEN: u64 = 0x9E37_79B9_7F4A_7C15;
    let mut z = i.wrapping_mul(GOLDEN).wrapping_add(GOLDEN);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;
    (z >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
}

/// Like [`light_curve`] but fully deterministic: timestamps
/// `i·cadence + jitter·frac(0.618034·i)` and uniform noise of standard
/// deviation `sigma` drawn from stream `noise_seed`.
pub fn quasi_regular_light_curve(
    n: usize,
    cadence: f64,
    jitter: f64,
    injections: &[Injection],
    sigma: f64,
    mean: f64,
    noise_seed: u64,
) -> TimeSeries {
    let times: Vec<f64> = (0..n)
        .map(|i| i as f64 * cadence + jitter * ((i as f64 * 0.618034) % 1.0))
        .collect();
    let flux: Vec<f64> = times
        .iter()
        .enumerate()
        .map(|(i, &t)| {
            let signal: f64 = injections
                .iter()
                .map(|&(a, f, p)| a * (2.0 * PI * f * t + p).sin())
                .sum();
            let u = splitmix_unit(noise_seed * n as u64 + i as u64);
            mean + signal + sigma * 3f64.sqrt() * (2.0 * u - 1.0)
        })
        .collect();
    TimeSeries::new(times, flux).unwrap()
}
