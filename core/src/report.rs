//! Flat result table: one row per extracted component.

use std::io::Write;

use serde::{Deserialize, Serialize};

#[cfg(feature = "python")]
use pyo3::prelude::*;

use crate::prewhiten::PrewhitenResult;

/// Column order of [`FrequencyTable::write_csv`].
pub const CSV_HEADER: [&str; 10] = [
    "index",
    "frequency",
    "frequency_uncertainty",
    "snr",
    "amplitude",
    "amplitude_uncertainty",
    "magnitude_amplitude",
    "phase",
    "phase_uncertainty",
    "epoch_phase",
];

/// Errors raised while writing a table.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One extracted component, flattened.
#[cfg_attr(feature = "python", pyclass(get_all))]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrequencyRow {
    /// Position in extraction order, starting at 0.
    pub index: usize,
    /// Cycles per time unit.
    pub frequency: f64,
    pub frequency_uncertainty: f64,
    pub snr: f64,
    /// Amplitude in flux units.
    pub amplitude: f64,
    pub amplitude_uncertainty: f64,
    /// Millimagnitudes; `None` when the mean flux does not exceed the
    /// amplitude.
    pub magnitude_amplitude: Option<f64>,
    /// Phase at `t = 0`, radians in `[0, 2π)`.
    pub phase: f64,
    pub phase_uncertainty: f64,
    /// Phase at the configured epoch.
    pub epoch_phase: f64,
}

#[cfg(feature = "python")]
#[pymethods]
impl FrequencyRow {
    fn __repr__(&self) -> String {
        format!(
            "FrequencyRow(index={}, freq={:.6}, amp={:.6}, SNR={:.2})",
            self.index, self.frequency, self.amplitude, self.snr,
        )
    }
}

/// The rows of a run, in extraction order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrequencyTable {
    pub rows: Vec<FrequencyRow>,
}

impl FrequencyTable {
    pub fn from_result(result: &PrewhitenResult) -> Self {
        let rows = result
            .components
            .iter()
            .enumerate()
            .map(|(index, extracted)| {
                let c = &extracted.component;
                let s = &extracted.stats;
                FrequencyRow {
                    index,
                    frequency: c.frequency(),
                    frequency_uncertainty: s.frequency_uncertainty,
                    snr: s.snr,
                    amplitude: c.amplitude,
                    amplitude_uncertainty: s.amplitude_uncertainty,
                    magnitude_amplitude: s.magnitude_amplitude,
                    phase: c.phase,
                    phase_uncertainty: s.phase_uncertainty,
                    epoch_phase: s.epoch_phase,
                }
            })
            .collect();
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Write a header line and one comma-separated line per row.  An
    /// undefined magnitude amplitude is left empty.
    pub fn write_csv<W: Write>(&self, mut writer: W) -> Result<(), ReportError> {
        writeln!(writer, "{}", CSV_HEADER.join(","))?;
        for row in &self.rows {
            let magnitude = row.magnitude_amplitude.map(|m| m.to_string()).unwrap_or_default();
            writeln!(
                writer,
                "{},{},{},{},{},{},{},{},{},{}",
                row.index,
                row.frequency,
                row.frequency_uncertainty,
                row.snr,
                row.amplitude,
                row.amplitude_uncertainty,
                magnitude,
                row.phase,
                row.phase_uncertainty,
                row.epoch_phase,
            )?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn to_csv_string(&self) -> Result<String, ReportError> {
        let mut buf = Vec::new();
        self.write_csv(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Pretty-printed JSON array of rows.
    pub fn to_json(&self) -> Result<String, ReportError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, ReportError> {
        Ok(serde_json::from_str(json)?)
    }
}
