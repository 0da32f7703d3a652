//! Calibration and discrimination statistics over confidence scores.
//!
//! - **ECE**: bin-count-weighted gap between mean confidence and accuracy
//!   across ten equal-width bins `[0,0.1) ... [0.9,1.0]`
//! - **Confidence-accuracy gap**: single-number calibration proxy
//! - **AUROC**: rank-based area under the ROC curve with `correct` as the
//!   positive class

use crate::types::PredictionRecord;
use serde::{Deserialize, Serialize};

/// Number of equal-width confidence bins used for ECE
pub const CALIBRATION_BINS: usize = 10;

/// Records with confidence strictly above this count as high confidence
pub const HIGH_CONFIDENCE_THRESHOLD: f64 = 0.8;

/// Records with confidence strictly below this count as low confidence
pub const LOW_CONFIDENCE_THRESHOLD: f64 = 0.5;

/// Aggregates for one confidence bin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBin {
    pub lower: f64,
    pub upper: f64,
    pub count: u64,
    pub mean_confidence: f64,
    pub accuracy: f64,
}

impl CalibrationBin {
    pub fn gap(&self) -> f64 {
        (self.mean_confidence - self.accuracy).abs()
    }
}

/// Confidence clamped into `[0, 1]`, non-finite values read as 0
pub fn sanitized_confidence(record: &PredictionRecord) -> f64 {
    if record.confidence.is_finite() {
        record.confidence.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn bin_index(confidence: f64) -> usize {
    ((confidence * CALIBRATION_BINS as f64).floor() as usize).min(CALIBRATION_BINS - 1)
}

/// Non-empty calibration bins in ascending confidence order
pub fn calibration_bins(records: &[&PredictionRecord]) -> Vec<CalibrationBin> {
    let mut confidence_sums = [0.0_f64; CALIBRATION_BINS];
    let mut correct_counts = [0_u64; CALIBRATION_BINS];
    let mut counts = [0_u64; CALIBRATION_BINS];

    for record in records {
        let confidence = sanitized_confidence(record);
        let idx = bin_index(confidence);
        confidence_sums[idx] += confidence;
        counts[idx] += 1;
        if record.correct {
            correct_counts[idx] += 1;
        }
    }

    (0..CALIBRATION_BINS)
        .filter(|&i| counts[i] > 0)
        .map(|i| CalibrationBin {
            lower: i as f64 / CALIBRATION_BINS as f64,
            upper: (i + 1) as f64 / CALIBRATION_BINS as f64,
            count: counts[i],
            mean_confidence: confidence_sums[i] / counts[i] as f64,
            accuracy: correct_counts[i] as f64 / counts[i] as f64,
        })
        .collect()
}

/// Expected Calibration Error, 0 for an empty input
pub fn expected_calibration_error(records: &[&PredictionRecord]) -> f64 {
    if records.is_empty() {
        return 0.0;
    }
    let total = records.len() as f64;
    calibration_bins(records)
        .iter()
        .map(|bin| bin.count as f64 / total * bin.gap())
        .sum::<f64>()
        .clamp(0.0, 1.0)
}

/// `|mean(confidence) - accuracy|`, 0 for an empty input
pub fn confidence_accuracy_gap(records: &[&PredictionRecord]) -> f64 {
    if records.is_empty() {
        return 0.0;
    }
    let total = records.len() as f64;
    let mean_confidence = records.iter().map(|r| sanitized_confidence(r)).sum::<f64>() / total;
    let accuracy = records.iter().filter(|r| r.correct).count() as f64 / total;
    (mean_confidence - accuracy).abs()
}

/// Rank-based AUROC with `correct` as the positive class
///
/// Walking records by descending confidence, every incorrect record adds the
/// number of correct records ranked above it. Records sharing a confidence
/// value are ties: each tied correct record counts one half. Returns 0.5
/// when either class is empty.
pub fn auroc(records: &[&PredictionRecord]) -> f64 {
    let positives = records.iter().filter(|r| r.correct).count() as u64;
    let negatives = records.len() as u64 - positives;
    if positives == 0 || negatives == 0 {
        return 0.5;
    }

    let mut ranked: Vec<(f64, bool)> = records
        .iter()
        .map(|r| (sanitized_confidence(r), r.correct))
        .collect();
    ranked.sort_by(|a, b| b.0.total_cmp(&a.0));

    let mut positives_above = 0_u64;
    let mut accumulated = 0.0_f64;
    let mut start = 0;
    while start < ranked.len() {
        let confidence = ranked[start].0;
        let end = ranked[start..]
            .iter()
            .position(|(c, _)| *c != confidence)
            .map_or(ranked.len(), |offset| start + offset);

        let group = &ranked[start..end];
        let group_positives = group.iter().filter(|(_, correct)| *correct).count() as u64;
        let group_negatives = group.len() as u64 - group_positives;

        accumulated += group_negatives as f64 * (positives_above as f64 + 0.5 * group_positives as f64);
        positives_above += group_positives;
        start = end;
    }

    (accumulated / (positives * negatives) as f64).clamp(0.0, 1.0)
}

/// Accuracy over the records whose confidence satisfies `keep`, 0 if none do
pub fn stratified_accuracy<F>(records: &[&PredictionRecord], keep: F) -> f64
where
    F: Fn(f64) -> bool,
{
    let (count, correct) = records
        .iter()
        .filter(|r| keep(sanitized_confidence(r)))
        .fold((0_u64, 0_u64), |(count, correct), r| {
            (count + 1, correct + u64::from(r.correct))
        });
    if count == 0 {
        0.0
    } else {
        correct as f64 / count as f64
    }
}
