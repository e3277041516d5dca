//! # prewhiten-core
//!
//! Lomb-Scargle prewhitening of irregularly sampled photometry, with
//! optional Python bindings via [PyO3](https://pyo3.rs).
//!
//! ## Overview
//!
//! Prewhitening repeatedly finds the strongest periodic signal in a light
//! curve, fits a sinusoid to it and subtracts it, until what is left is
//! indistinguishable from noise.
//!
//! | Module          | Purpose                                                   |
//! |-----------------|-----------------------------------------------------------|
//! | [`types`]       | Time series, frequency grid, periodogram, components      |
//! | [`periodogram`] | Lomb-Scargle power at a single frequency                  |
//! | [`pool`]        | Fixed worker pool with an explicit request/response protocol |
//! | [`scanner`]     | Partitioned parallel periodogram scan                     |
//! | [`refiner`]     | Least-squares sinusoid fit (phase grid, coordinate descent) |
//! | [`noise`]       | Noise estimates for the SNR stopping rule                 |
//! | [`prewhiten`]   | The extraction loop                                       |
//! | [`report`]      | Flat result table, CSV and JSON                           |
//! | [`config`]      | Validated, serde-loadable run options                     |
//!
//! ## Rust usage
//!
//! ```no_run
//! use prewhiten_core::{PrewhitenConfig, PrewhitenEngine, TimeSeries};
//!
//! let times: Vec<f64> = (0..500).map(|i| i as f64 * 0.02).collect();
//! let flux: Vec<f64> = times
//!     .iter()
//!     .map(|t| (2.0 * std::f64::consts::PI * 3.0 * t).sin())
//!     .collect();
//! let series = TimeSeries::new(times, flux)?;
//!
//! let engine = PrewhitenEngine::new(PrewhitenConfig::default())?;
//! let result = engine.run(&series)?;
//! result.table().write_csv(std::io::stdout())?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Python usage
//!
//! Built with the `python` feature, the library exposes a module called
//! `prewhiten_core`:
//!
//! ```python
//! import prewhiten_core
//!
//! rows = prewhiten_core.prewhiten(times, flux, '{"snr_threshold": 4.0}')
//! for row in rows:
//!     print(row)
//! ```

pub mod config;
pub mod noise;
pub mod periodogram;
pub mod pool;
pub mod prewhiten;
pub mod refiner;
pub mod report;
pub mod scanner;
pub mod types;

#[cfg(feature = "python")]
pub mod python;

// Re-export the most commonly used items at crate root for convenience.
pub use config::{ConfigError, PrewhitenConfig};
pub use noise::NoiseModel;
pub use pool::{PoolError, WorkerPool};
pub use prewhiten::{PrewhitenEngine, PrewhitenError, PrewhitenResult, StopReason};
pub use refiner::{local_fit, FitStrategy, LocalFit, SeededSampler, SineFitRefiner, UnitSampler};
pub use report::{FrequencyRow, FrequencyTable};
pub use scanner::{PeriodogramScanner, ScanError};
pub use types::{FrequencyGrid, FrequencyRange, Periodogram, SineComponent, TimeSeries};

#[cfg(feature = "python")]
use pyo3::prelude::*;

/// The top-level Python module exposed by this crate.
///
/// Registered items:
/// - `prewhiten(times, flux, config_json=None)`: the extraction loop
/// - `lomb_scargle(times, flux, f_min, f_max, samples)`: a single scan
/// - `FrequencyRow`: one extracted component
#[cfg(feature = "python")]
#[pymodule]
fn prewhiten_core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<FrequencyRow>()?;
    m.add_function(wrap_pyfunction!(python::prewhiten, m)?)?;
    m.add_function(wrap_pyfunction!(python::lomb_scargle, m)?)?;

    // Module-level metadata
    m.add("__version__", env!("CARGO_PKG_VERSION"))?;
    m.add("__doc__", "Lomb-Scargle prewhitening of photometric time series.")?;

    Ok(())
}
