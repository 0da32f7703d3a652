//! One-vs-rest confusion matrices and label confusion statistics.

use crate::types::PredictionRecord;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One-vs-rest confusion counts for a single label
///
/// A record is a positive prediction when `predicted == label`, and a
/// positive instance when `actual == label`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub true_positives: u64,
    pub true_negatives: u64,
    pub false_positives: u64,
    pub false_negatives: u64,
}

impl ConfusionMatrix {
    pub fn one_vs_rest<'a, I>(records: I, label: &str) -> Self
    where
        I: IntoIterator<Item = &'a PredictionRecord>,
    {
        let mut matrix = Self::default();
        for record in records {
            match (record.predicted == label, record.actual == label) {
                (true, true) => matrix.true_positives += 1,
                (true, false) => matrix.false_positives += 1,
                (false, true) => matrix.false_negatives += 1,
                (false, false) => matrix.true_negatives += 1,
            }
        }
        matrix
    }

    pub fn total(&self) -> u64 {
        self.true_positives + self.true_negatives + self.false_positives + self.false_negatives
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.true_positives + self.true_negatives, self.total())
    }

    pub fn precision(&self) -> f64 {
        ratio(
            self.true_positives,
            self.true_positives + self.false_positives,
        )
    }

    pub fn recall(&self) -> f64 {
        ratio(
            self.true_positives,
            self.true_positives + self.false_negatives,
        )
    }

    /// Harmonic mean of precision and recall, 0 when both are 0
    pub fn f1(&self) -> f64 {
        let precision = self.precision();
        let recall = self.recall();
        if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        }
    }

    /// Number of records whose actual label is this label
    pub fn support(&self) -> u64 {
        self.true_positives + self.false_negatives
    }
}

/// Per-label quality figures derived from a one-vs-rest confusion matrix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub support: u64,
    pub confusion: ConfusionMatrix,
}

impl From<ConfusionMatrix> for LabelMetrics {
    fn from(confusion: ConfusionMatrix) -> Self {
        Self {
            accuracy: confusion.accuracy(),
            precision: confusion.precision(),
            recall: confusion.recall(),
            f1_score: confusion.f1(),
            support: confusion.support(),
            confusion,
        }
    }
}

/// A `(predicted, actual)` mix-up and how often it occurred
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusedPair {
    pub predicted: String,
    pub actual: String,
    pub count: u64,
}

/// Metrics for every label seen as either a prediction or a ground truth
pub fn per_label_metrics(records: &[&PredictionRecord]) -> BTreeMap<String, LabelMetrics> {
    let labels: BTreeSet<&str> = records
        .iter()
        .flat_map(|r| [r.actual.as_str(), r.predicted.as_str()])
        .collect();

    labels
        .into_iter()
        .map(|label| {
            let matrix = ConfusionMatrix::one_vs_rest(records.iter().copied(), label);
            (label.to_string(), LabelMetrics::from(matrix))
        })
        .collect()
}

/// The `top_n` most frequent mix-ups among incorrect records
///
/// Ordered by count descending, then by `(predicted, actual)` ascending.
pub fn most_confused_pairs(records: &[&PredictionRecord], top_n: usize) -> Vec<ConfusedPair> {
    let mut counts: BTreeMap<(&str, &str), u64> = BTreeMap::new();
    for record in records.iter().filter(|r| !r.correct) {
        *counts
            .entry((record.predicted.as_str(), record.actual.as_str()))
            .or_insert(0) += 1;
    }

    let mut pairs: Vec<ConfusedPair> = counts
        .into_iter()
        .map(|((predicted, actual), count)| ConfusedPair {
            predicted: predicted.to_string(),
            actual: actual.to_string(),
            count,
        })
        .collect();

    // Stable sort keeps the BTreeMap's lexicographic order among equal counts
    pairs.sort_by(|a, b| b.count.cmp(&a.count));
    pairs.truncate(top_n);
    pairs
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}
