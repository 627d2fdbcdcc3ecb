//! Quality score over a cleaned series and the minimum-quality gate.

use serde::{Deserialize, Serialize};

use crate::candle::Candle;
use crate::validation::ValidationReport;

const INTERPOLATION_PENALTY: f64 = 0.2;
const GAP_PENALTY: f64 = 0.3;
const LOW_VOLUME_PENALTY: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityVerdict {
    pub score: f64,
    pub minimum: f64,
    pub passed: bool,
}

/// Score in `[0, 1]`; an empty series scores zero.
pub fn score(candles: &[Candle], report: &ValidationReport) -> f64 {
    if candles.is_empty() {
        return 0.0;
    }

    let total = candles.len() as f64;
    let raw = 1.0
        - INTERPOLATION_PENALTY * (report.interpolated_count as f64 / total)
        - GAP_PENALTY * (report.gap_count as f64 / total)
        - LOW_VOLUME_PENALTY * (report.low_volume_removed as f64 / total);

    raw.clamp(0.0, 1.0)
}

pub fn evaluate(candles: &[Candle], report: &ValidationReport, minimum: f64) -> QualityVerdict {
    let score = score(candles, report);
    QualityVerdict {
        score,
        minimum,
        passed: score >= minimum,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| Candle::new(i as i64 * 60_000, 1.0, 1.0, 1.0, 1.0, 1.0))
            .collect()
    }

    #[test]
    fn clean_series_scores_one() {
        let verdict = evaluate(&candles(50), &ValidationReport::default(), 0.95);
        assert_eq!(verdict.score, 1.0);
        assert!(verdict.passed);
    }

    #[test]
    fn penalties_are_proportional_to_series_length() {
        let report = ValidationReport {
            interpolated_count: 10,
            gap_count: 5,
            low_volume_removed: 20,
            ..ValidationReport::default()
        };
        // 1 - 0.2*0.1 - 0.3*0.05 - 0.1*0.2
        let expected = 1.0 - 0.02 - 0.015 - 0.02;
        assert!((score(&candles(100), &report) - expected).abs() < 1e-12);
    }

    #[test]
    fn heavy_interpolation_fails_the_gate() {
        let report = ValidationReport {
            interpolated_count: 10,
            gap_count: 2,
            ..ValidationReport::default()
        };
        let verdict = evaluate(&candles(40), &report, 0.95);
        assert!(verdict.score < 0.95);
        assert!(!verdict.passed);
    }

    #[test]
    fn score_is_clamped_and_empty_is_zero() {
        let report = ValidationReport {
            gap_count: 100,
            low_volume_removed: 100,
            ..ValidationReport::default()
        };
        assert_eq!(score(&candles(2), &report), 0.0);
        assert_eq!(score(&[], &ValidationReport::default()), 0.0);
        assert!(!evaluate(&[], &ValidationReport::default(), 0.5).passed);
    }
}
