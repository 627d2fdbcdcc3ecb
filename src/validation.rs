//! Candle validation and cleaning pipeline.
//!
//! Stages run in a fixed order and only remove or annotate candles:
//! ordering, completeness, OHLC consistency, close-price outliers, volume floor,
//! gap detection, then optional bounded gap interpolation.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::candle::Candle;
use crate::timeframe::Timeframe;

const MAX_REPORTED_GAPS: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationConfig {
    pub enable_data_validation: bool,
    /// Gap interpolation; the checks still run when this is off.
    pub enable_data_cleaning: bool,
    pub outlier_z_threshold: f64,
    pub min_outlier_sample: usize,
    /// Symbol-appropriate floor, in base-asset units.
    pub min_volume: f64,
    pub max_interpolated_per_gap: u32,
    /// Allowed spacing deviation as a fraction of the timeframe interval.
    pub gap_tolerance_ratio: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            enable_data_validation: true,
            enable_data_cleaning: true,
            outlier_z_threshold: 3.5,
            min_outlier_sample: 10,
            min_volume: 1_000.0,
            max_interpolated_per_gap: 5,
            gap_tolerance_ratio: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    /// Index of the candle preceding the gap in the filtered series.
    pub after_index: usize,
    pub expected_timestamp: i64,
    pub actual_timestamp: i64,
    pub gap_duration_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub input_count: u64,
    pub dropped_rows: u64,
    pub out_of_order_removed: u64,
    pub incomplete_removed: u64,
    pub inconsistent_removed: u64,
    pub outliers_removed: u64,
    pub low_volume_removed: u64,
    pub gap_count: u64,
    /// First gaps only; `gap_count` is the full total.
    pub gaps: Vec<Gap>,
    pub interpolated_count: u64,
    pub output_count: u64,
}

impl ValidationReport {
    /// Every candle the pipeline removed or synthesized.
    pub fn cleaned_records(&self) -> u64 {
        self.out_of_order_removed
            + self.incomplete_removed
            + self.inconsistent_removed
            + self.outliers_removed
            + self.low_volume_removed
            + self.interpolated_count
    }
}

/// Runs every stage over `candles`. `dropped_rows` is the fetch-time count of
/// rows that never became candles; it is carried into the report untouched.
pub fn run_pipeline(
    candles: Vec<Candle>,
    dropped_rows: u64,
    timeframe: Timeframe,
    cfg: &ValidationConfig,
) -> (Vec<Candle>, ValidationReport) {
    let mut report = ValidationReport {
        input_count: candles.len() as u64,
        dropped_rows,
        ..ValidationReport::default()
    };

    let mut series = drop_non_increasing(candles);
    report.out_of_order_removed = report.input_count - series.len() as u64;
    log_stage("ordering", report.out_of_order_removed, series.len());

    if !cfg.enable_data_validation {
        report.output_count = series.len() as u64;
        debug!(
            component = "validation",
            event = "validation.skipped",
            timeframe = timeframe.as_str(),
            candles = series.len()
        );
        return (series, report);
    }

    report.incomplete_removed = retain_counted(&mut series, Candle::is_complete);
    log_stage("completeness", report.incomplete_removed, series.len());

    report.inconsistent_removed = retain_counted(&mut series, Candle::is_consistent);
    log_stage("consistency", report.inconsistent_removed, series.len());

    report.outliers_removed = remove_outliers(&mut series, cfg);
    log_stage("outliers", report.outliers_removed, series.len());

    let min_volume = cfg.min_volume;
    report.low_volume_removed = retain_counted(&mut series, |c| c.volume >= min_volume);
    log_stage("volume", report.low_volume_removed, series.len());

    let gaps = detect_gaps(&series, timeframe, cfg.gap_tolerance_ratio);
    report.gap_count = gaps.len() as u64;
    if !gaps.is_empty() {
        warn!(
            component = "validation",
            event = "validation.stage.gaps",
            timeframe = timeframe.as_str(),
            gap_count = gaps.len(),
            first_expected_ts = gaps[0].expected_timestamp,
            first_actual_ts = gaps[0].actual_timestamp
        );
    }

    if cfg.enable_data_cleaning && !gaps.is_empty() {
        let (filled, added) = interpolate_gaps(
            &series,
            &gaps,
            timeframe.interval_ms(),
            cfg.max_interpolated_per_gap,
        );
        series = filled;
        report.interpolated_count = added;
        log_stage("interpolation", added, series.len());
    }

    report.gaps = gaps.into_iter().take(MAX_REPORTED_GAPS).collect();
    report.output_count = series.len() as u64;
    (series, report)
}

fn log_stage(stage: &'static str, affected: u64, remaining: usize) {
    if affected > 0 {
        warn!(
            component = "validation",
            event = "validation.stage",
            stage,
            affected,
            remaining
        );
    } else {
        debug!(
            component = "validation",
            event = "validation.stage",
            stage,
            affected,
            remaining
        );
    }
}

fn retain_counted(series: &mut Vec<Candle>, keep: impl Fn(&Candle) -> bool) -> u64 {
    let before = series.len();
    series.retain(|candle| keep(candle));
    (before - series.len()) as u64
}

fn drop_non_increasing(candles: Vec<Candle>) -> Vec<Candle> {
    let mut out: Vec<Candle> = Vec::with_capacity(candles.len());
    for candle in candles {
        match out.last() {
            Some(prev) if candle.timestamp <= prev.timestamp => {}
            _ => out.push(candle),
        }
    }
    out
}

fn remove_outliers(series: &mut Vec<Candle>, cfg: &ValidationConfig) -> u64 {
    if series.len() < cfg.min_outlier_sample.max(2) {
        return 0;
    }

    let n = series.len() as f64;
    let mean = series.iter().map(|c| c.close).sum::<f64>() / n;
    let variance = series
        .iter()
        .map(|c| (c.close - mean).powi(2))
        .sum::<f64>()
        / n;
    let stddev = variance.sqrt();
    if !stddev.is_finite() || stddev == 0.0 {
        return 0;
    }

    let threshold = cfg.outlier_z_threshold;
    retain_counted(series, |c| ((c.close - mean) / stddev).abs() <= threshold)
}

fn detect_gaps(series: &[Candle], timeframe: Timeframe, tolerance_ratio: f64) -> Vec<Gap> {
    let interval = timeframe.interval_ms();
    let tolerance = interval as f64 * tolerance_ratio;

    series
        .windows(2)
        .enumerate()
        .filter_map(|(idx, pair)| {
            let expected = pair[0].timestamp.saturating_add(interval);
            let actual = pair[1].timestamp;
            let gap_duration_ms = actual.saturating_sub(expected);
            (gap_duration_ms.saturating_abs() as f64 > tolerance).then_some(Gap {
                after_index: idx,
                expected_timestamp: expected,
                actual_timestamp: actual,
                gap_duration_ms,
            })
        })
        .collect()
}

/// Inserts up to `cap` synthetic candles into each gap, walking linearly from the
/// candle before the gap to the candle after it.
fn interpolate_gaps(series: &[Candle], gaps: &[Gap], interval_ms: i64, cap: u32) -> (Vec<Candle>, u64) {
    let mut out = Vec::with_capacity(series.len());
    let mut added = 0u64;
    let mut gaps = gaps.iter().peekable();

    for (idx, candle) in series.iter().enumerate() {
        out.push(candle.clone());

        let Some(gap) = gaps.next_if(|gap| gap.after_index == idx) else {
            continue;
        };
        let Some(next) = series.get(idx + 1) else {
            continue;
        };

        let missing = next.timestamp.saturating_sub(candle.timestamp) / interval_ms - 1;
        if missing <= 0 {
            continue;
        }
        let fill = missing.min(i64::from(cap));
        let steps = (missing + 1) as f64;

        for k in 1..=fill {
            let frac = k as f64 / steps;
            let timestamp = candle.timestamp.saturating_add(k.saturating_mul(interval_ms));
            out.push(synthesize(candle, next, timestamp, frac));
        }
        added += fill as u64;

        debug!(
            component = "validation",
            event = "validation.gap.filled",
            expected_ts = gap.expected_timestamp,
            actual_ts = gap.actual_timestamp,
            missing,
            filled = fill
        );
    }

    (out, added)
}

fn synthesize(prev: &Candle, next: &Candle, timestamp: i64, frac: f64) -> Candle {
    let lerp = |a: f64, b: f64| a + (b - a) * frac;

    let open = lerp(prev.close, next.open);
    let close = lerp(prev.close, next.close);
    let high = lerp(prev.high, next.high).max(open.max(close));
    let low = lerp(prev.low, next.low).min(open.min(close));

    Candle {
        timestamp,
        open,
        high,
        low,
        close,
        volume: lerp(prev.volume, next.volume),
        interpolated: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: i64 = 3_600_000;

    fn bar(i: i64, close: f64) -> Candle {
        Candle::new(i * HOUR, close, close + 1.0, close - 1.0, close, 5_000.0)
    }

    fn assert_well_formed(series: &[Candle]) {
        for pair in series.windows(2) {
            assert!(pair[0].timestamp < pair[1].timestamp);
        }
        for candle in series {
            assert!(candle.is_consistent(), "{candle:?}");
        }
    }

    #[test]
    fn lone_spike_is_removed_by_outlier_stage() {
        let mut candles: Vec<Candle> = (0..20)
            .map(|i| bar(i, 100.0 + if i % 2 == 0 { 2.0 } else { -2.0 }))
            .collect();
        candles.push(Candle::new(20 * HOUR, 500.0, 501.0, 499.0, 500.0, 5_000.0));

        let (out, report) = run_pipeline(candles, 0, Timeframe::H1, &ValidationConfig::default());
        assert_eq!(report.outliers_removed, 1);
        assert_eq!(out.len(), 20);
        assert!(out.iter().all(|c| c.close < 200.0));
    }

    #[test]
    fn outlier_stage_needs_a_minimum_sample() {
        let mut candles: Vec<Candle> = (0..5).map(|i| bar(i, 100.0)).collect();
        candles.push(Candle::new(5 * HOUR, 500.0, 501.0, 499.0, 500.0, 5_000.0));

        let (out, report) = run_pipeline(candles, 0, Timeframe::H1, &ValidationConfig::default());
        assert_eq!(report.outliers_removed, 0);
        assert_eq!(out.len(), 6);
    }

    #[test]
    fn single_missing_hour_is_interpolated_between_neighbours() {
        let candles = vec![
            Candle::new(0, 99.0, 101.0, 98.0, 100.0, 5_000.0),
            Candle::new(2 * HOUR, 110.0, 112.0, 109.0, 110.0, 7_000.0),
        ];

        let (out, report) = run_pipeline(candles, 0, Timeframe::H1, &ValidationConfig::default());
        assert_eq!(report.gap_count, 1);
        assert_eq!(report.gaps[0].expected_timestamp, HOUR);
        assert_eq!(report.gaps[0].actual_timestamp, 2 * HOUR);
        assert_eq!(report.interpolated_count, 1);
        assert_eq!(out.len(), 3);

        let filled = &out[1];
        assert!(filled.interpolated);
        assert_eq!(filled.timestamp, HOUR);
        assert!(filled.close > 100.0 && filled.close < 110.0);
        assert_eq!(filled.volume, 6_000.0);
        assert_well_formed(&out);
    }

    #[test]
    fn interpolation_is_capped_per_gap() {
        let candles = vec![bar(0, 100.0), bar(20, 120.0)];
        let (out, report) = run_pipeline(candles, 0, Timeframe::H1, &ValidationConfig::default());

        assert_eq!(report.gap_count, 1);
        assert_eq!(report.interpolated_count, 5);
        assert_eq!(out.len(), 7);
        assert_eq!(out.iter().filter(|c| c.interpolated).count(), 5);
        assert_eq!(out[5].timestamp, 5 * HOUR);
        assert_well_formed(&out);
    }

    #[test]
    fn cleaning_disabled_reports_gaps_without_filling() {
        let cfg = ValidationConfig {
            enable_data_cleaning: false,
            ..ValidationConfig::default()
        };
        let (out, report) = run_pipeline(vec![bar(0, 100.0), bar(3, 101.0)], 0, Timeframe::H1, &cfg);
        assert_eq!(report.gap_count, 1);
        assert_eq!(report.interpolated_count, 0);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn extreme_timestamps_saturate_instead_of_overflowing() {
        let at = |ts: i64| Candle::new(ts, 100.0, 101.0, 99.0, 100.0, 5_000.0);
        let candles = vec![at(i64::MIN), at(i64::MAX - HOUR / 2), at(i64::MAX)];

        let (out, report) = run_pipeline(candles, 0, Timeframe::H1, &ValidationConfig::default());

        assert_eq!(report.gap_count, 1);
        assert_eq!(report.gaps[0].expected_timestamp, i64::MIN + HOUR);
        assert_eq!(report.gaps[0].gap_duration_ms, i64::MAX);
        assert_eq!(report.interpolated_count, 5);
        assert_eq!(out.len(), 8);
        assert_eq!(out[5].timestamp, i64::MIN + 5 * HOUR);
        assert_well_formed(&out);
    }

    #[test]
    fn small_spacing_jitter_is_within_tolerance() {
        let candles = vec![bar(0, 100.0), Candle::new(HOUR + 60_000, 100.0, 101.0, 99.0, 100.0, 5_000.0)];
        let (_, report) = run_pipeline(candles, 0, Timeframe::H1, &ValidationConfig::default());
        assert_eq!(report.gap_count, 0);
    }

    #[test]
    fn invalid_candles_are_removed_by_their_stage() {
        let candles = vec![
            bar(0, 100.0),
            Candle::new(HOUR, 100.0, 101.0, 99.0, 0.0, 5_000.0),
            Candle::new(2 * HOUR, 100.0, 99.5, 99.0, 100.0, 5_000.0),
            Candle::new(3 * HOUR, 100.0, 101.0, 99.0, 100.0, 10.0),
            bar(4, 100.0),
            bar(4, 100.5),
            bar(5, 100.0),
        ];

        let cfg = ValidationConfig {
            enable_data_cleaning: false,
            ..ValidationConfig::default()
        };
        let (out, report) = run_pipeline(candles, 2, Timeframe::H1, &cfg);
        assert_eq!(report.input_count, 7);
        assert_eq!(report.dropped_rows, 2);
        assert_eq!(report.out_of_order_removed, 1);
        assert_eq!(report.incomplete_removed, 1);
        assert_eq!(report.inconsistent_removed, 1);
        assert_eq!(report.low_volume_removed, 1);
        assert_eq!(report.cleaned_records(), 4);
        assert_eq!(report.output_count, 3);
        assert_eq!(out.iter().map(|c| c.timestamp).collect::<Vec<_>>(), vec![0, 4 * HOUR, 5 * HOUR]);
    }

    #[test]
    fn validation_disabled_only_enforces_ordering() {
        let cfg = ValidationConfig {
            enable_data_validation: false,
            ..ValidationConfig::default()
        };
        let candles = vec![
            bar(1, 100.0),
            bar(0, 100.0),
            Candle::new(2 * HOUR, 100.0, 99.0, 101.0, 100.0, 1.0),
        ];
        let (out, report) = run_pipeline(candles, 0, Timeframe::H1, &cfg);
        assert_eq!(out.len(), 2);
        assert_eq!(report.out_of_order_removed, 1);
        assert_eq!(report.inconsistent_removed, 0);
        assert_eq!(report.low_volume_removed, 0);
    }
}
