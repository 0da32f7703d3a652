//! Common test utilities and helpers

#![allow(dead_code)]

use asclepius_core::{
    types::Prediction, CaseSourceMode, InferenceService, LearningConfig, LibsqlStore,
    OutcomeFeedback, PatientState, Result, TriageCase,
};
use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

/// Open a file-backed store inside a fresh temp directory
///
/// The directory must outlive the store, so both are returned.
pub async fn create_test_store() -> (LibsqlStore, TempDir) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let store = LibsqlStore::new_local(dir.path().join("asclepius.db"))
        .await
        .expect("Failed to create test store");
    (store, dir)
}

/// Config with synthetic cases and a small batch, deterministic across runs
pub fn synthetic_config(batch_size: usize) -> LearningConfig {
    let mut config = LearningConfig::default();
    config.pipeline.case_source = CaseSourceMode::SyntheticOnly;
    config.pipeline.batch_size = batch_size;
    config.q_learning.seed = Some(7);
    config.bandit.seed = Some(7);
    config
}

/// Inference that always answers with the gold label
pub struct OracleInference;

#[async_trait]
impl InferenceService for OracleInference {
    async fn infer(&self, case: &TriageCase) -> Result<Prediction> {
        Ok(Prediction {
            predicted_label: case.gold_label.clone().unwrap_or_default(),
            confidence: 0.9,
        })
    }
}

pub fn labelled_case(id: &str, symptoms: &[&str], diagnosis: &str) -> TriageCase {
    TriageCase {
        id: id.to_string(),
        symptoms: symptoms.iter().map(|s| s.to_string()).collect(),
        age: Some(40),
        risk_factors: vec![],
        urgency: None,
        gold_label: Some(diagnosis.to_string()),
        created_at: Utc::now(),
    }
}

pub fn feedback(case_id: &str, predicted: &str, actual: &str) -> OutcomeFeedback {
    OutcomeFeedback {
        case_id: case_id.to_string(),
        patient_state: PatientState {
            symptoms: vec!["fever".to_string(), "cough".to_string()],
            age: Some(34),
            risk_factors: vec![],
        },
        predicted_diagnosis: predicted.to_string(),
        actual_diagnosis: actual.to_string(),
        confidence: 0.8,
        time_to_resolution_hours: Some(12.0),
        satisfaction: Some(5.0),
        condition: None,
        treatment: None,
        treatment_effective: None,
        adverse_event: false,
        readmitted_30d: false,
        recorded_at: Utc::now(),
    }
}
