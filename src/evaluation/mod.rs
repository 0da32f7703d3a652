//! Evaluation engine for diagnostic predictions.
//!
//! Turns a batch of [`PredictionRecord`](crate::types::PredictionRecord)s into
//! an [`AdvancedMetrics`] bundle. Everything here is pure and synchronous.
//!
//! # Metrics
//!
//! - **Classification**: accuracy, macro precision/recall/F1, per-label
//!   one-vs-rest breakdown
//! - **Calibration**: Expected Calibration Error over ten bins and the
//!   confidence-accuracy gap
//! - **Discrimination**: AUROC treating `correct` as the positive class
//! - **Diagnostics**: most frequent `(predicted, actual)` mix-ups and
//!   accuracy on high (> 0.8) and low (< 0.5) confidence records
//!
//! # Usage
//!
//! ```rust
//! use asclepius_core::evaluation::calculate_advanced_metrics;
//! use asclepius_core::types::PredictionRecord;
//!
//! let records = vec![
//!     PredictionRecord::new("influenza", "influenza", 0.9),
//!     PredictionRecord::new("influenza", "common_cold", 0.6),
//! ];
//! let metrics = calculate_advanced_metrics(&records).unwrap();
//! assert_eq!(metrics.accuracy, 0.5);
//! ```

pub mod calibration;
pub mod confusion;
pub mod metrics;

pub use calibration::CalibrationBin;
pub use confusion::{ConfusedPair, ConfusionMatrix, LabelMetrics};
pub use metrics::{
    calculate_advanced_metrics, compute_advanced_metrics, AdvancedMetrics,
    DEFAULT_TOP_CONFUSED_PAIRS,
};
