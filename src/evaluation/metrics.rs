//! Aggregate metrics over a set of prediction records.

use crate::error::{AsclepiusError, Result};
use crate::evaluation::calibration::{
    auroc, calibration_bins, confidence_accuracy_gap, expected_calibration_error,
    sanitized_confidence, stratified_accuracy, CalibrationBin, HIGH_CONFIDENCE_THRESHOLD,
    LOW_CONFIDENCE_THRESHOLD,
};
use crate::evaluation::confusion::{
    most_confused_pairs, per_label_metrics, ConfusedPair, LabelMetrics,
};
use crate::types::PredictionRecord;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// Number of confused pairs reported when the caller does not choose
pub const DEFAULT_TOP_CONFUSED_PAIRS: usize = 5;

/// Full metric bundle produced by [`compute_advanced_metrics`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvancedMetrics {
    pub total: u64,
    pub correct: u64,
    pub accuracy: f64,
    /// Macro averages over labels that occur as ground truth
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub per_label: BTreeMap<String, LabelMetrics>,
    pub calibration_error: f64,
    pub confidence_accuracy_gap: f64,
    pub auroc: f64,
    pub most_confused_pairs: Vec<ConfusedPair>,
    /// Accuracy over records with confidence > 0.8
    pub high_confidence_accuracy: f64,
    /// Accuracy over records with confidence < 0.5
    pub low_confidence_accuracy: f64,
    pub calibration_bins: Vec<CalibrationBin>,
}

impl AdvancedMetrics {
    /// One-line summary for logs and notifications
    pub fn summary(&self) -> String {
        format!(
            "accuracy={:.3} f1={:.3} ece={:.3} auroc={:.3} n={}",
            self.accuracy, self.f1_score, self.calibration_error, self.auroc, self.total
        )
    }
}

/// Compute metrics with the default number of confused pairs
pub fn calculate_advanced_metrics(records: &[PredictionRecord]) -> Result<AdvancedMetrics> {
    compute_advanced_metrics(records, DEFAULT_TOP_CONFUSED_PAIRS)
}

/// Compute every metric over `records`
///
/// Records are put into a canonical order first, so the result does not
/// depend on the order the caller supplied them in.
pub fn compute_advanced_metrics(
    records: &[PredictionRecord],
    top_n: usize,
) -> Result<AdvancedMetrics> {
    if records.is_empty() {
        return Err(AsclepiusError::EmptyInput(
            "cannot compute metrics over zero prediction records".to_string(),
        ));
    }

    let mut ordered: Vec<&PredictionRecord> = records.iter().collect();
    ordered.sort_by(|a, b| canonical_order(a, b));

    let total = ordered.len() as u64;
    let correct = ordered.iter().filter(|r| r.correct).count() as u64;
    let per_label = per_label_metrics(&ordered);

    let actual_labels: BTreeSet<&str> = ordered.iter().map(|r| r.actual.as_str()).collect();
    let (precision, recall, f1_score) = macro_average(&per_label, &actual_labels);

    Ok(AdvancedMetrics {
        total,
        correct,
        accuracy: correct as f64 / total as f64,
        precision,
        recall,
        f1_score,
        per_label,
        calibration_error: expected_calibration_error(&ordered),
        confidence_accuracy_gap: confidence_accuracy_gap(&ordered),
        auroc: auroc(&ordered),
        most_confused_pairs: most_confused_pairs(&ordered, top_n),
        high_confidence_accuracy: stratified_accuracy(&ordered, |c| {
            c > HIGH_CONFIDENCE_THRESHOLD
        }),
        low_confidence_accuracy: stratified_accuracy(&ordered, |c| c < LOW_CONFIDENCE_THRESHOLD),
        calibration_bins: calibration_bins(&ordered),
    })
}

fn macro_average(
    per_label: &BTreeMap<String, LabelMetrics>,
    actual_labels: &BTreeSet<&str>,
) -> (f64, f64, f64) {
    let n = actual_labels.len() as f64;
    let (p, r, f) = actual_labels
        .iter()
        .filter_map(|label| per_label.get(*label))
        .fold((0.0, 0.0, 0.0), |(p, r, f), m| {
            (p + m.precision, r + m.recall, f + m.f1_score)
        });
    (p / n, r / n, f / n)
}

fn canonical_order(a: &PredictionRecord, b: &PredictionRecord) -> Ordering {
    a.actual
        .cmp(&b.actual)
        .then_with(|| a.predicted.cmp(&b.predicted))
        .then_with(|| sanitized_confidence(a).total_cmp(&sanitized_confidence(b)))
        .then_with(|| a.correct.cmp(&b.correct))
}
