//! Inference service contract and a keyword baseline
//!
//! The diagnosis model is an external collaborator: anything that maps a
//! [`TriageCase`] to a [`Prediction`] can drive the training pipeline.
//! [`RuleBasedInference`] scores symptom overlap against fixed diagnosis
//! profiles and backs the CLI when no model is wired in.

use crate::error::{AsclepiusError, Result};
use crate::types::{Prediction, TriageCase, Urgency};
use async_trait::async_trait;
use std::collections::HashSet;
use tracing::debug;

/// Opaque diagnosis model
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InferenceService: Send + Sync {
    async fn infer(&self, case: &TriageCase) -> Result<Prediction>;
}

/// Typical presentation of a diagnosis
#[derive(Debug, Clone, Copy)]
pub struct DiagnosisProfile {
    pub diagnosis: &'static str,
    pub symptoms: &'static [&'static str],
    pub urgency: Urgency,
}

/// Fixed symptom vocabulary shared by the baseline and the synthetic case generator
pub const DIAGNOSIS_PROFILES: &[DiagnosisProfile] = &[
    DiagnosisProfile {
        diagnosis: "common_cold",
        symptoms: &["runny_nose", "sneezing", "sore_throat", "cough", "congestion"],
        urgency: Urgency::Low,
    },
    DiagnosisProfile {
        diagnosis: "influenza",
        symptoms: &["fever", "myalgia", "fatigue", "cough", "chills", "headache"],
        urgency: Urgency::Medium,
    },
    DiagnosisProfile {
        diagnosis: "covid19",
        symptoms: &["fever", "cough", "loss_of_smell", "fatigue", "shortness_of_breath"],
        urgency: Urgency::Medium,
    },
    DiagnosisProfile {
        diagnosis: "pneumonia",
        symptoms: &["fever", "productive_cough", "shortness_of_breath", "chest_pain", "chills"],
        urgency: Urgency::High,
    },
    DiagnosisProfile {
        diagnosis: "bronchitis",
        symptoms: &["cough", "productive_cough", "wheezing", "fatigue"],
        urgency: Urgency::Low,
    },
    DiagnosisProfile {
        diagnosis: "asthma",
        symptoms: &["wheezing", "shortness_of_breath", "chest_tightness", "cough"],
        urgency: Urgency::Medium,
    },
    DiagnosisProfile {
        diagnosis: "migraine",
        symptoms: &["headache", "nausea", "photophobia", "aura"],
        urgency: Urgency::Low,
    },
    DiagnosisProfile {
        diagnosis: "tension_headache",
        symptoms: &["headache", "neck_pain", "stress"],
        urgency: Urgency::Low,
    },
    DiagnosisProfile {
        diagnosis: "gastroenteritis",
        symptoms: &["diarrhea", "vomiting", "nausea", "abdominal_pain", "fever"],
        urgency: Urgency::Medium,
    },
    DiagnosisProfile {
        diagnosis: "appendicitis",
        symptoms: &[
            "abdominal_pain",
            "right_lower_quadrant_pain",
            "fever",
            "nausea",
            "loss_of_appetite",
        ],
        urgency: Urgency::Critical,
    },
    DiagnosisProfile {
        diagnosis: "urinary_tract_infection",
        symptoms: &["dysuria", "frequent_urination", "pelvic_pain", "fever"],
        urgency: Urgency::Medium,
    },
    DiagnosisProfile {
        diagnosis: "hypertension",
        symptoms: &["headache", "dizziness", "blurred_vision"],
        urgency: Urgency::Medium,
    },
    DiagnosisProfile {
        diagnosis: "myocardial_infarction",
        symptoms: &["chest_pain", "shortness_of_breath", "sweating", "left_arm_pain", "nausea"],
        urgency: Urgency::Critical,
    },
    DiagnosisProfile {
        diagnosis: "anxiety",
        symptoms: &["palpitations", "restlessness", "sweating", "insomnia"],
        urgency: Urgency::Low,
    },
    DiagnosisProfile {
        diagnosis: "allergic_reaction",
        symptoms: &["rash", "itching", "swelling", "hives", "sneezing"],
        urgency: Urgency::High,
    },
];

/// Lowercase, trim and join words with underscores
pub fn normalize_symptom(symptom: &str) -> String {
    symptom
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

/// Keyword-overlap baseline over [`DIAGNOSIS_PROFILES`]
///
/// Picks the profile with the highest Jaccard similarity to the case's
/// symptoms, earliest profile on ties. Confidence grows with similarity.
#[derive(Debug, Clone, Default)]
pub struct RuleBasedInference;

impl RuleBasedInference {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl InferenceService for RuleBasedInference {
    async fn infer(&self, case: &TriageCase) -> Result<Prediction> {
        let symptoms: HashSet<String> = case
            .symptoms
            .iter()
            .map(|s| normalize_symptom(s))
            .filter(|s| !s.is_empty())
            .collect();

        if symptoms.is_empty() {
            return Err(AsclepiusError::Inference {
                case_id: case.id.clone(),
                message: "case has no symptoms".to_string(),
            });
        }

        let mut best: Option<(&DiagnosisProfile, f64)> = None;
        for profile in DIAGNOSIS_PROFILES {
            let overlap = profile
                .symptoms
                .iter()
                .filter(|s| symptoms.contains(**s))
                .count();
            if overlap == 0 {
                continue;
            }
            let union = profile.symptoms.len() + symptoms.len() - overlap;
            let similarity = overlap as f64 / union as f64;
            if best.map_or(true, |(_, top)| similarity > top) {
                best = Some((profile, similarity));
            }
        }

        let (profile, similarity) = best.ok_or_else(|| AsclepiusError::Inference {
            case_id: case.id.clone(),
            message: "no diagnosis profile matches the reported symptoms".to_string(),
        })?;

        let confidence = (0.35 + 0.6 * similarity).min(0.95);
        debug!(
            "Case {} -> {} (similarity {:.2})",
            case.id, profile.diagnosis, similarity
        );

        Ok(Prediction {
            predicted_label: profile.diagnosis.to_string(),
            confidence,
        })
    }
}
