//! End-to-end tests for the prewhitening engine.
//!
//! ## Test Organization
//!
//! 1. **Extraction** - known sinusoids are recovered in amplitude order
//! 2. **Stopping rule** - threshold, minimum count and iteration cap
//! 3. **Reproducibility** - seeds and subtract-then-refit
//! 4. **Edge Cases** - tiny and invalid inputs
//! 5. **Output** - the flat result table

mod common;

use approx::{assert_abs_diff_eq, assert_relative_eq};
use prewhiten_core::periodogram::power;
use prewhiten_core::types::{amplitude_from_power, TimeSeriesError};
use prewhiten_core::{
    FitStrategy, FrequencyRange, NoiseModel, PrewhitenConfig, PrewhitenEngine, StopReason,
    TimeSeries,
};

const FAST_INJECTIONS: [common::Injection; 3] =
    [(3.0, 0.85, 0.4), (1.5, 1.6, 2.0), (0.8, 2.35, 4.1)];
/// Between points of the 0.005-step periodogram grids.
const OFF_GRID_INJECTIONS: [common::Injection; 3] =
    [(3.0, 0.8523, 0.4), (1.5, 1.6037, 2.0), (0.8, 2.3471, 4.1)];
const OFF_GRID_FULL_INJECTIONS: [common::Injection; 2] = [(2.0, 0.6037, 1.1), (1.0, 1.3521, 0.3)];
const FULL_INJECTIONS: [common::Injection; 2] = [(2.0, 0.6, 1.1), (1.0, 1.35, 0.3)];

/// 400 samples at a 0.075 cadence with up to 0.03 of jitter, σ = 0.3.
fn fast_light_curve(seed: u64) -> TimeSeries {
    common::light_curve(400, 0.075, 0.03, &FAST_INJECTIONS, 0.3, 100.0, seed)
}

fn fast_config() -> PrewhitenConfig {
    PrewhitenConfig {
        frequency_range: FrequencyRange::new(0.1, 5.1),
        periodogram_samples: 1000,
        workers: 4,
        phase_trials: 2000,
        max_components: 8,
        seed: Some(11),
        ..PrewhitenConfig::default()
    }
}

/// 1000 samples at a 0.01 cadence with up to 0.004 of jitter, σ = 0.1.
fn full_light_curve(seed: u64) -> TimeSeries {
    common::light_curve(1000, 0.01, 0.004, &FULL_INJECTIONS, 0.1, 0.0, seed)
}

fn full_config() -> PrewhitenConfig {
    PrewhitenConfig {
        frequency_range: FrequencyRange::new(0.1, 3.1),
        periodogram_samples: 600,
        workers: 3,
        phase_trials: 600,
        random_guesses: 0,
        tune_trials: 600,
        tune_iterations: 4,
        max_components: 5,
        seed: Some(5),
        ..PrewhitenConfig::full()
    }
}

// ============================================================================
// Extraction
// ============================================================================

/// Phase-grid fitting with median-spectrum SNR recovers all three injected
/// sinusoids, strongest first, then stops on the SNR threshold.
#[test]
fn test_fast_engine_extracts_injected_components() {
    let series = fast_light_curve(17);
    let engine = PrewhitenEngine::new(fast_config()).unwrap();
    let result = engine.run(&series).unwrap();

    assert_eq!(result.components.len(), 3, "stop reason {:?}", result.stop_reason);
    for (extracted, &(amplitude, frequency, _)) in
        result.components.iter().zip(FAST_INJECTIONS.iter())
    {
        let c = &extracted.component;
        // within half a periodogram step
        assert_abs_diff_eq!(c.frequency(), frequency, epsilon = 0.0025);
        assert_relative_eq!(c.amplitude, amplitude, max_relative = 0.08);
        assert!(extracted.stats.snr >= 5.124);
        assert!(extracted.stats.magnitude_amplitude.is_some());
    }

    match result.stop_reason {
        StopReason::BelowThreshold { iteration, snr } => {
            assert_eq!(iteration, 3);
            assert!(snr < 5.124);
        }
        other => panic!("unexpected stop reason {:?}", other),
    }

    assert_eq!(result.seed, 11);
    assert_abs_diff_eq!(result.mean_flux, 100.0, epsilon = 0.1);
    assert_eq!(result.spectra.len(), 3);
    assert_eq!(result.frequencies.len(), 1000);
    assert_eq!(result.final_spectrum.len(), 1000);

    // only noise is left
    let residual = result.residual().unwrap();
    let rms = (residual.flux().iter().map(|y| y * y).sum::<f64>() / residual.len() as f64).sqrt();
    assert_relative_eq!(rms, 0.3, max_relative = 0.25);
}

/// Coordinate descent with binned-residual noise, as in the exhaustive
/// least-squares tool.
#[test]
fn test_full_engine_extracts_injected_components() {
    let series = full_light_curve(23);
    let engine = PrewhitenEngine::new(full_config()).unwrap();
    let result = engine.run(&series).unwrap();

    assert_eq!(result.components.len(), 2, "stop reason {:?}", result.stop_reason);
    for (extracted, &(amplitude, frequency, _)) in
        result.components.iter().zip(FULL_INJECTIONS.iter())
    {
        assert_abs_diff_eq!(extracted.component.frequency(), frequency, epsilon = 0.01);
        assert_relative_eq!(extracted.component.amplitude, amplitude, max_relative = 0.06);
        assert!(extracted.stats.snr >= 3.0);
        // zero-mean input has no magnitude scale
        assert_eq!(extracted.stats.magnitude_amplitude, None);
    }
    assert!(matches!(
        result.stop_reason,
        StopReason::BelowThreshold { iteration: 2, .. }
    ));
}

/// Nearly noiseless sinusoids between grid points: the fitted frequencies
/// leave the grid, so subtraction leaves no leakage to extract as extra
/// components.
#[test]
fn test_off_grid_frequencies_extracted_once() {
    let series = common::quasi_regular_light_curve(
        400,
        0.075,
        0.03,
        &OFF_GRID_INJECTIONS,
        1e-3,
        100.0,
        6,
    );
    let config = PrewhitenConfig {
        max_components: 12,
        ..fast_config()
    };
    let result = PrewhitenEngine::new(config).unwrap().run(&series).unwrap();

    assert_eq!(result.components.len(), 3, "stop reason {:?}", result.stop_reason);
    for (extracted, &(amplitude, frequency, _)) in
        result.components.iter().zip(OFF_GRID_INJECTIONS.iter())
    {
        let c = &extracted.component;
        let sigma = extracted.stats.frequency_uncertainty;
        assert!(
            (c.frequency() - frequency).abs() <= sigma,
            "frequency {} vs {} (uncertainty {:e})",
            c.frequency(),
            frequency,
            sigma
        );
        assert_relative_eq!(c.amplitude, amplitude, max_relative = 1e-3);
    }
    assert!(matches!(
        result.stop_reason,
        StopReason::BelowThreshold { iteration: 3, .. }
    ));

    let residual = result.residual().unwrap();
    let rms = (residual.flux().iter().map(|y| y * y).sum::<f64>() / residual.len() as f64).sqrt();
    assert_relative_eq!(rms, 1e-3, max_relative = 0.25);
}

#[test]
fn test_off_grid_frequencies_coordinate_descent() {
    let series = common::quasi_regular_light_curve(
        400,
        0.075,
        0.03,
        &OFF_GRID_INJECTIONS,
        1e-3,
        100.0,
        6,
    );
    let config = PrewhitenConfig {
        fit_strategy: FitStrategy::CoordinateDescent,
        phase_trials: 300,
        random_guesses: 50,
        tune_trials: 300,
        tune_iterations: 3,
        max_components: 12,
        ..fast_config()
    };
    let result = PrewhitenEngine::new(config).unwrap().run(&series).unwrap();

    assert_eq!(result.components.len(), 3, "stop reason {:?}", result.stop_reason);
    for (extracted, &(_, frequency, _)) in
        result.components.iter().zip(OFF_GRID_INJECTIONS.iter())
    {
        assert_abs_diff_eq!(extracted.component.frequency(), frequency, epsilon = 1e-5);
    }
    assert!(matches!(
        result.stop_reason,
        StopReason::BelowThreshold { iteration: 3, .. }
    ));
}

#[test]
fn test_off_grid_frequencies_binned_noise() {
    let series = common::quasi_regular_light_curve(
        1000,
        0.01,
        0.004,
        &OFF_GRID_FULL_INJECTIONS,
        1e-3,
        0.0,
        3,
    );
    let config = PrewhitenConfig {
        phase_trials: 300,
        tune_trials: 300,
        tune_iterations: 3,
        max_components: 8,
        ..full_config()
    };
    let result = PrewhitenEngine::new(config).unwrap().run(&series).unwrap();

    assert_eq!(result.components.len(), 2, "stop reason {:?}", result.stop_reason);
    for (extracted, &(amplitude, frequency, _)) in
        result.components.iter().zip(OFF_GRID_FULL_INJECTIONS.iter())
    {
        assert_abs_diff_eq!(extracted.component.frequency(), frequency, epsilon = 1e-5);
        assert_relative_eq!(extracted.component.amplitude, amplitude, max_relative = 1e-3);
    }
    assert!(matches!(
        result.stop_reason,
        StopReason::BelowThreshold { iteration: 2, .. }
    ));
}

// ============================================================================
// Stopping rule
// ============================================================================

#[test]
fn test_min_components_overrides_threshold() {
    let series = fast_light_curve(3);
    let config = PrewhitenConfig {
        snr_threshold: 1e9,
        min_components: 2,
        ..fast_config()
    };
    let result = PrewhitenEngine::new(config).unwrap().run(&series).unwrap();

    assert_eq!(result.components.len(), 2);
    assert!(matches!(
        result.stop_reason,
        StopReason::BelowThreshold { iteration: 2, .. }
    ));
}

#[test]
fn test_iteration_cap_scans_final_residual() {
    let series = fast_light_curve(4);
    let config = PrewhitenConfig {
        max_components: 2,
        retained_spectra: 1,
        ..fast_config()
    };
    let result = PrewhitenEngine::new(config).unwrap().run(&series).unwrap();

    assert_eq!(result.components.len(), 2);
    assert_eq!(result.stop_reason, StopReason::IterationCap { iterations: 2 });
    assert_eq!(result.spectra.len(), 1);
    assert_eq!(result.final_spectrum.len(), 1000);

    // the strongest line left in the final spectrum is the third injection
    let peak = result
        .final_spectrum
        .iter()
        .enumerate()
        .fold(0, |best, (i, &a)| if a > result.final_spectrum[best] { i } else { best });
    assert_abs_diff_eq!(result.frequencies[peak], 2.35, epsilon = 0.02);
}

// ============================================================================
// Reproducibility
// ============================================================================

#[test]
fn test_same_seed_replays_run() {
    let series = full_light_curve(8);
    let config = PrewhitenConfig {
        random_guesses: 200,
        tune_trials: 150,
        tune_iterations: 2,
        max_components: 2,
        ..full_config()
    };
    let engine = PrewhitenEngine::new(config).unwrap();
    let first = engine.run(&series).unwrap();
    let second = engine.run(&series).unwrap();

    assert_eq!(first.table(), second.table());
    assert_eq!(first.stop_reason, second.stop_reason);
}

#[test]
fn test_missing_seed_is_recorded() {
    let series = fast_light_curve(9);
    let config = PrewhitenConfig {
        seed: None,
        max_components: 1,
        ..fast_config()
    };
    let result = PrewhitenEngine::new(config).unwrap().run(&series).unwrap();

    let replay = PrewhitenConfig {
        seed: Some(result.seed),
        max_components: 1,
        ..fast_config()
    };
    let again = PrewhitenEngine::new(replay).unwrap().run(&series).unwrap();
    assert_eq!(result.table(), again.table());
}

/// Refitting at an extracted frequency after subtraction finds almost
/// nothing.
#[test]
fn test_subtracted_component_does_not_reappear() {
    let series = common::light_curve(500, 0.05, 0.02, &[(2.0, 1.7, 0.9)], 0.0, 10.0, 12);
    let config = PrewhitenConfig {
        frequency_range: FrequencyRange::new(0.2, 4.2),
        periodogram_samples: 800,
        workers: 2,
        phase_trials: 3600,
        max_components: 1,
        seed: Some(1),
        ..PrewhitenConfig::default()
    };
    let result = PrewhitenEngine::new(config).unwrap().run(&series).unwrap();
    assert_eq!(result.components.len(), 1);

    let extracted = &result.components[0];
    let f = extracted.component.frequency();
    let left = amplitude_from_power(power(f, &extracted.residual), extracted.residual.len());
    assert!(
        left < 0.02 * extracted.component.amplitude,
        "amplitude {} left at {}",
        left,
        f
    );
}

// ============================================================================
// Edge Cases
// ============================================================================

#[test]
fn test_short_series_rejected() {
    assert_eq!(
        TimeSeries::new(vec![], vec![]),
        Err(TimeSeriesError::TooFewSamples { got: 0 })
    );
    assert_eq!(
        TimeSeries::new(vec![0.0], vec![1.0]),
        Err(TimeSeriesError::TooFewSamples { got: 1 })
    );
}

#[test]
fn test_two_samples_run_to_completion() {
    let series = TimeSeries::new(vec![0.0, 1.0], vec![1.0, -1.0]).unwrap();
    for noise_model in [
        NoiseModel::SpectrumMedian,
        NoiseModel::SpectrumStdDev,
        NoiseModel::BinnedResidual,
    ] {
        let config = PrewhitenConfig {
            periodogram_samples: 64,
            workers: 2,
            phase_trials: 16,
            fit_strategy: FitStrategy::CoordinateDescent,
            random_guesses: 4,
            tune_trials: 16,
            tune_iterations: 2,
            noise_model,
            max_components: 3,
            seed: Some(2),
            ..PrewhitenConfig::default()
        };
        let result = PrewhitenEngine::new(config).unwrap().run(&series);
        assert!(result.is_ok(), "{:?}: {:?}", noise_model, result.err());
    }
}

// ============================================================================
// Output
// ============================================================================

#[test]
fn test_table_follows_extraction_order() {
    let series = fast_light_curve(17);
    let result = PrewhitenEngine::new(fast_config()).unwrap().run(&series).unwrap();
    let table = result.table();

    assert_eq!(table.len(), result.components.len());
    for (row, extracted) in table.rows.iter().zip(&result.components) {
        assert_eq!(row.frequency, extracted.component.frequency());
        assert_eq!(row.amplitude, extracted.component.amplitude);
        assert_eq!(row.snr, extracted.stats.snr);
        assert_eq!(row.epoch_phase, extracted.stats.epoch_phase);
    }
    assert!(table.rows.windows(2).all(|w| w[0].amplitude > w[1].amplitude));

    let csv = table.to_csv_string().unwrap();
    assert_eq!(csv.lines().count(), table.len() + 1);
}
