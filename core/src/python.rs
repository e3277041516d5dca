//! Python-facing functions, compiled with the `python` feature.

use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;

use crate::config::PrewhitenConfig;
use crate::periodogram::scan_sequential;
use crate::prewhiten::{PrewhitenEngine, PrewhitenError};
use crate::report::FrequencyRow;
use crate::types::{FrequencyGrid, FrequencyRange, TimeSeries};

fn engine_error(e: PrewhitenError) -> PyErr {
    match e {
        PrewhitenError::Config(_) | PrewhitenError::Series(_) => {
            PyValueError::new_err(e.to_string())
        }
        PrewhitenError::Scan(_) | PrewhitenError::Pool(_) => PyRuntimeError::new_err(e.to_string()),
    }
}

fn value_error<E: std::fmt::Display>(e: E) -> PyErr {
    PyValueError::new_err(e.to_string())
}

/// Prewhiten a light curve and return one `FrequencyRow` per component.
///
/// `config_json` may override any option of the default configuration.
#[pyfunction]
#[pyo3(signature = (times, flux, config_json=None))]
pub fn prewhiten(
    py: Python<'_>,
    times: Vec<f64>,
    flux: Vec<f64>,
    config_json: Option<&str>,
) -> PyResult<Vec<FrequencyRow>> {
    let config = match config_json {
        Some(json) => PrewhitenConfig::from_json_str(json).map_err(value_error)?,
        None => PrewhitenConfig::default(),
    };
    let series = TimeSeries::new(times, flux).map_err(value_error)?;
    let engine = PrewhitenEngine::new(config).map_err(engine_error)?;

    // the run blocks on worker threads; let other Python threads proceed
    let result = py.allow_threads(|| engine.run(&series)).map_err(engine_error)?;
    Ok(result.table().rows)
}

/// Lomb-Scargle powers of the mean-subtracted flux over `samples`
/// frequencies in `[f_min, f_max)`.  Returns `(frequencies, powers)`.
#[pyfunction]
pub fn lomb_scargle(
    times: Vec<f64>,
    flux: Vec<f64>,
    f_min: f64,
    f_max: f64,
    samples: usize,
) -> PyResult<(Vec<f64>, Vec<f64>)> {
    let series = TimeSeries::new(times, flux).map_err(value_error)?.centered();
    let grid = FrequencyGrid::new(FrequencyRange::new(f_min, f_max), samples).map_err(value_error)?;
    let periodogram = scan_sequential(&series, &grid);
    Ok((periodogram.frequencies, periodogram.powers))
}
