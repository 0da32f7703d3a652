//! Scalar reward for one outcome report.
//!
//! | Signal | Range | Weight |
//! |---|---|---|
//! | diagnosis correct | ±1 | 0.4 |
//! | time to resolution tier | [-1, 1] | 0.2 |
//! | satisfaction (1-5 rescaled) | [-1, 1] | 0.2 |
//! | treatment effective | ±1 | 0.1 |
//! | adverse event | -1 | 0.2 |
//! | 30-day readmission | -1 | 0.1 |
//! | calibration bonus | [-1, 1] | 0.1 |
//!
//! Absent optional signals contribute 0. The total is clamped to [-1, 1].

use crate::types::OutcomeFeedback;
use serde::{Deserialize, Serialize};

const CORRECTNESS_WEIGHT: f64 = 0.4;
const RESOLUTION_WEIGHT: f64 = 0.2;
const SATISFACTION_WEIGHT: f64 = 0.2;
const TREATMENT_WEIGHT: f64 = 0.1;
const ADVERSE_EVENT_PENALTY: f64 = 0.2;
const READMISSION_PENALTY: f64 = 0.1;
const CALIBRATION_WEIGHT: f64 = 0.1;

/// Weighted reward components, summed and clamped into `total`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RewardBreakdown {
    pub correctness: f64,
    pub resolution_time: f64,
    pub satisfaction: f64,
    pub treatment: f64,
    pub adverse_event: f64,
    pub readmission: f64,
    pub calibration: f64,
    pub total: f64,
}

/// Score in `[-1, 1]` for resolving within `hours`
pub fn resolution_tier(hours: f64) -> f64 {
    if hours < 24.0 {
        1.0
    } else if hours < 48.0 {
        0.5
    } else if hours < 72.0 {
        0.0
    } else if hours < 168.0 {
        -0.5
    } else {
        -1.0
    }
}

pub fn reward_breakdown(feedback: &OutcomeFeedback) -> RewardBreakdown {
    let correct = feedback.diagnosis_correct();
    let confidence = if feedback.confidence.is_finite() {
        feedback.confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };

    let correctness = if correct {
        CORRECTNESS_WEIGHT
    } else {
        -CORRECTNESS_WEIGHT
    };

    let resolution_time = feedback
        .time_to_resolution_hours
        .filter(|h| !h.is_nan())
        .map_or(0.0, |h| resolution_tier(h) * RESOLUTION_WEIGHT);

    let satisfaction = feedback
        .satisfaction
        .filter(|s| s.is_finite())
        .map_or(0.0, |s| (s.clamp(1.0, 5.0) - 3.0) / 2.0 * SATISFACTION_WEIGHT);

    let treatment = match feedback.treatment_effective {
        Some(true) => TREATMENT_WEIGHT,
        Some(false) => -TREATMENT_WEIGHT,
        None => 0.0,
    };

    let adverse_event = if feedback.adverse_event {
        -ADVERSE_EVENT_PENALTY
    } else {
        0.0
    };

    let readmission = if feedback.readmitted_30d {
        -READMISSION_PENALTY
    } else {
        0.0
    };

    // Confident and right earns the bonus, confident and wrong pays it back
    let calibration_score = if correct {
        2.0 * confidence - 1.0
    } else {
        1.0 - 2.0 * confidence
    };
    let calibration = calibration_score * CALIBRATION_WEIGHT;

    let sum = correctness
        + resolution_time
        + satisfaction
        + treatment
        + adverse_event
        + readmission
        + calibration;

    RewardBreakdown {
        correctness,
        resolution_time,
        satisfaction,
        treatment,
        adverse_event,
        readmission,
        calibration,
        total: sum.clamp(-1.0, 1.0),
    }
}

/// Reward in `[-1, 1]` for one outcome report
pub fn calculate_reward(feedback: &OutcomeFeedback) -> f64 {
    reward_breakdown(feedback).total
}
