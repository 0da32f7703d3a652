//! Training orchestrator.
//!
//! One call to [`TrainingPipeline::run_training_session`] walks a session
//! through `running -> completed | failed`:
//!
//! 1. allocate a sortable session id and persist the running session
//! 2. measure `accuracy_before` over the outcome lookback window
//! 3. draw one batch from the [`CaseSource`]
//! 4. run inference per case under a timeout, appending an outcome row for
//!    every success; failures are counted and skipped
//! 5. measure `accuracy_after`
//! 6. persist the completed session
//!
//! Any error in steps 2-6 marks the session failed, persists the error
//! message and surfaces as [`AsclepiusError::SessionFailure`]. Every store
//! call runs under `store_timeout` and steps 2-6 together under
//! `session_timeout`, so a stuck store fails the session instead of hanging.

pub mod case_source;

pub use case_source::{
    build_case_source, CaseBatch, CaseSource, FallbackCaseSource, StoreCaseSource,
    SyntheticCaseSource,
};

use crate::config::{LearningConfig, PipelineConfig};
use crate::error::{AsclepiusError, Result};
use crate::evaluation::{compute_advanced_metrics, AdvancedMetrics};
use crate::services::InferenceService;
use crate::storage::{bounded, days_before, LearningStore};
use crate::types::{
    CaseOutcomeRecord, SessionId, SessionUpdate, TrainingSession, TriageCase,
};
use chrono::Utc;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Accuracy assumed when there is nothing to measure
pub const PRIOR_ACCURACY: f64 = 0.5;

pub struct TrainingPipeline {
    store: Arc<dyn LearningStore>,
    inference: Arc<dyn InferenceService>,
    case_source: Arc<dyn CaseSource>,
    config: PipelineConfig,
    top_confused_pairs: usize,
    retention_days: u32,
}

impl TrainingPipeline {
    pub fn new(
        store: Arc<dyn LearningStore>,
        inference: Arc<dyn InferenceService>,
        case_source: Arc<dyn CaseSource>,
        config: &LearningConfig,
    ) -> Self {
        Self {
            store,
            inference,
            case_source,
            config: config.pipeline.clone(),
            top_confused_pairs: config.evaluation.top_confused_pairs,
            retention_days: config.retention.outcome_retention_days,
        }
    }

    /// Pipeline with the case source selected by the configuration
    pub fn from_config(
        store: Arc<dyn LearningStore>,
        inference: Arc<dyn InferenceService>,
        config: &LearningConfig,
    ) -> Self {
        let case_source = build_case_source(&config.pipeline, store.clone());
        Self::new(store, inference, case_source, config)
    }

    pub fn store(&self) -> &Arc<dyn LearningStore> {
        &self.store
    }

    /// Upper bound applied to each store call
    pub fn store_timeout(&self) -> std::time::Duration {
        self.config.store_timeout
    }

    /// Run one evaluation/training session end to end
    pub async fn run_training_session(&self) -> Result<TrainingSession> {
        let mut session = TrainingSession::start(SessionId::generate());
        info!("Starting training session {}", session.session_id);

        bounded(
            self.config.store_timeout,
            "insert session",
            self.store.insert_session(&session),
        )
        .await
        .map_err(|e| AsclepiusError::SessionFailure {
            session_id: session.session_id.to_string(),
            message: format!("could not record session start: {}", e),
        })?;

        let outcome = timeout(self.config.session_timeout, self.execute(&mut session))
            .await
            .unwrap_or_else(|_| {
                Err(AsclepiusError::Timeout {
                    operation: "training session".to_string(),
                    timeout_ms: self.config.session_timeout.as_millis() as u64,
                })
            });

        match outcome {
            Ok(()) => {
                info!(
                    "Training session {} completed in {}ms: {} processed, {} failed, accuracy {:.3} -> {:.3}",
                    session.session_id,
                    session.duration().map_or(0, |d| d.num_milliseconds()),
                    session.cases_processed,
                    session.cases_failed,
                    session.accuracy_before,
                    session.accuracy_after
                );
                Ok(session)
            }
            Err(e) => {
                let message = e.to_string();
                error!("Training session {} failed: {}", session.session_id, message);
                session.fail(message.clone())?;
                let update = SessionUpdate::from_session(&session);
                if let Err(persist_err) = bounded(
                    self.config.store_timeout,
                    "record session failure",
                    self.store.update_session(&session.session_id, &update),
                )
                .await
                {
                    warn!(
                        "Could not record failure of session {}: {}",
                        session.session_id, persist_err
                    );
                }
                Err(AsclepiusError::SessionFailure {
                    session_id: session.session_id.to_string(),
                    message,
                })
            }
        }
    }

    /// Steps 2-6; `session` only becomes completed once the store has it
    async fn execute(&self, session: &mut TrainingSession) -> Result<()> {
        let accuracy_before = self.measure_accuracy().await?;

        let batch = self.case_source.fetch_batch(self.config.batch_size).await?;
        session.case_origin = Some(batch.origin);
        info!(
            "Session {} drew {} {} cases",
            session.session_id,
            batch.cases.len(),
            batch.origin
        );

        for case in &batch.cases {
            match self.process_case(&session.session_id, case).await {
                Ok(()) => session.cases_processed += 1,
                Err(e) if e.is_per_case() => {
                    warn!("Skipping case {}: {}", case.id, e);
                    session.cases_failed += 1;
                }
                Err(e) => {
                    // Inference succeeded but the outcome row was not stored
                    error!("Could not record outcome for case {}: {}", case.id, e);
                    session.cases_failed += 1;
                }
            }
        }

        let accuracy_after = self.measure_accuracy().await?;

        let mut completed = session.clone();
        completed.complete(accuracy_before, accuracy_after)?;
        let update = SessionUpdate::from_session(&completed);
        bounded(
            self.config.store_timeout,
            "complete session",
            self.store.update_session(&completed.session_id, &update),
        )
        .await?;
        *session = completed;
        Ok(())
    }

    async fn process_case(&self, session_id: &SessionId, case: &TriageCase) -> Result<()> {
        let actual = case.gold_label.clone().ok_or_else(|| AsclepiusError::Inference {
            case_id: case.id.clone(),
            message: "case has no confirmed diagnosis".to_string(),
        })?;

        let prediction = timeout(self.config.inference_timeout, self.inference.infer(case))
            .await
            .map_err(|_| AsclepiusError::InferenceTimeout {
                case_id: case.id.clone(),
                timeout_ms: self.config.inference_timeout.as_millis() as u64,
            })??;

        debug!(
            "Case {}: predicted {} ({:.2}), actual {}",
            case.id, prediction.predicted_label, prediction.confidence, actual
        );

        let record = CaseOutcomeRecord {
            case_id: case.id.clone(),
            predicted_label: prediction.predicted_label,
            actual_label: actual,
            confidence: prediction.confidence.clamp(0.0, 1.0),
            session_id: Some(session_id.to_string()),
            timestamp: Utc::now(),
        };
        bounded(
            self.config.store_timeout,
            "append outcome",
            self.store.append_outcome_record(&record),
        )
        .await
    }

    /// Metrics over the outcome lookback window, `None` when it is empty
    pub async fn evaluate_recent(&self) -> Result<Option<AdvancedMetrics>> {
        let since = days_before(Utc::now(), self.config.accuracy_lookback_days)?;
        let outcomes = bounded(
            self.config.store_timeout,
            "read outcomes",
            self.store.read_outcomes_since(since),
        )
        .await?;
        let records: Vec<_> = outcomes
            .iter()
            .map(CaseOutcomeRecord::to_prediction_record)
            .collect();

        if records.is_empty() {
            return Ok(None);
        }
        let metrics = compute_advanced_metrics(&records, self.top_confused_pairs)?;
        debug!("Recent outcomes: {}", metrics.summary());
        Ok(Some(metrics))
    }

    /// Accuracy over the outcome lookback window, [`PRIOR_ACCURACY`] if empty
    pub async fn measure_accuracy(&self) -> Result<f64> {
        Ok(self
            .evaluate_recent()
            .await?
            .map_or(PRIOR_ACCURACY, |m| m.accuracy))
    }

    /// Apply the outcome retention window
    pub async fn purge_expired_outcomes(&self) -> Result<u64> {
        bounded(
            self.config.store_timeout,
            "purge outcomes",
            self.store.purge_outcomes_older_than(self.retention_days),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::inference::MockInferenceService;
    use crate::storage::{InMemoryStore, MockLearningStore, StallingStore};
    use crate::types::{CaseOrigin, Prediction, SessionStatus};
    use async_trait::async_trait;

    struct FixedCases(Vec<TriageCase>);

    #[async_trait]
    impl CaseSource for FixedCases {
        async fn fetch_batch(&self, batch_size: usize) -> Result<CaseBatch> {
            Ok(CaseBatch {
                cases: self.0.iter().take(batch_size).cloned().collect(),
                origin: CaseOrigin::Store,
            })
        }
    }

    fn cases(n: usize) -> Vec<TriageCase> {
        (1..=n)
            .map(|i| TriageCase {
                id: format!("case-{}", i),
                symptoms: vec!["fever".to_string()],
                age: Some(40),
                risk_factors: vec![],
                urgency: None,
                gold_label: Some("influenza".to_string()),
                created_at: Utc::now(),
            })
            .collect()
    }

    fn echo_inference() -> MockInferenceService {
        let mut inference = MockInferenceService::new();
        inference.expect_infer().returning(|case| {
            if case.id == "case-5" {
                Err(AsclepiusError::Inference {
                    case_id: case.id.clone(),
                    message: "model unavailable".to_string(),
                })
            } else {
                Ok(Prediction {
                    predicted_label: "influenza".to_string(),
                    confidence: 0.8,
                })
            }
        });
        inference
    }

    #[tokio::test]
    async fn test_partial_failure_completes_session() {
        let store = Arc::new(InMemoryStore::new());
        let pipeline = TrainingPipeline::new(
            store.clone(),
            Arc::new(echo_inference()),
            Arc::new(FixedCases(cases(10))),
            &LearningConfig::default(),
        );

        let session = pipeline.run_training_session().await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.cases_processed, 9);
        assert_eq!(session.cases_failed, 1);
        assert_eq!(session.accuracy_before, PRIOR_ACCURACY);
        assert_eq!(session.accuracy_after, 1.0);
        assert!((session.improvement_rate - 0.5).abs() < 1e-12);

        let stored = store.read_session(&session.session_id).await.unwrap().unwrap();
        assert_eq!(stored, session);
        assert_eq!(
            store.count_session_outcomes(&session.session_id).await.unwrap(),
            9
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_inference_times_out_per_case() {
        struct SlowInference;

        #[async_trait]
        impl InferenceService for SlowInference {
            async fn infer(&self, _case: &TriageCase) -> Result<Prediction> {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                Ok(Prediction {
                    predicted_label: "influenza".to_string(),
                    confidence: 0.9,
                })
            }
        }

        let pipeline = TrainingPipeline::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(SlowInference),
            Arc::new(FixedCases(cases(2))),
            &LearningConfig::default(),
        );

        let session = pipeline.run_training_session().await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.cases_processed, 0);
        assert_eq!(session.cases_failed, 2);
    }

    #[tokio::test]
    async fn test_store_failure_marks_session_failed() {
        let mut store = MockLearningStore::new();
        store.expect_insert_session().returning(|_| Ok(()));
        store
            .expect_read_outcomes_since()
            .returning(|_| Err(AsclepiusError::Database("disk I/O error".to_string())));
        store
            .expect_update_session()
            .withf(|_, update| {
                update.status == Some(SessionStatus::Failed)
                    && update
                        .error_message
                        .as_deref()
                        .is_some_and(|m| m.contains("disk I/O error"))
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let pipeline = TrainingPipeline::new(
            Arc::new(store),
            Arc::new(MockInferenceService::new()),
            Arc::new(FixedCases(cases(3))),
            &LearningConfig::default(),
        );

        let err = pipeline.run_training_session().await.unwrap_err();
        assert!(matches!(err, AsclepiusError::SessionFailure { .. }));
    }

    #[tokio::test]
    async fn test_batch_size_caps_cases() {
        let mut config = LearningConfig::default();
        config.pipeline.batch_size = 4;

        let mut inference = MockInferenceService::new();
        inference.expect_infer().times(4).returning(|_| {
            Ok(Prediction {
                predicted_label: "common_cold".to_string(),
                confidence: 0.6,
            })
        });

        let pipeline = TrainingPipeline::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(inference),
            Arc::new(FixedCases(cases(10))),
            &config,
        );

        let session = pipeline.run_training_session().await.unwrap();
        assert_eq!(session.cases_processed, 4);
        assert_eq!(session.accuracy_after, 0.0);
    }

    #[tokio::test]
    async fn test_measure_accuracy_defaults_to_prior() {
        let pipeline = TrainingPipeline::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(MockInferenceService::new()),
            Arc::new(FixedCases(vec![])),
            &LearningConfig::default(),
        );
        assert_eq!(pipeline.measure_accuracy().await.unwrap(), PRIOR_ACCURACY);
        assert!(pipeline.evaluate_recent().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_store_read_fails_session() {
        let store = Arc::new(StallingStore::new());
        store.stall("read_outcomes_since");

        let pipeline = TrainingPipeline::new(
            store.clone(),
            Arc::new(echo_inference()),
            Arc::new(FixedCases(cases(3))),
            &LearningConfig::default(),
        );

        let err = pipeline.run_training_session().await.unwrap_err();
        let session_id = match err {
            AsclepiusError::SessionFailure {
                session_id,
                message,
            } => {
                assert!(message.contains("read outcomes timed out"), "{}", message);
                session_id
            }
            other => panic!("expected a session failure, got {:?}", other),
        };

        let stored = store
            .read_session(&SessionId(session_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, SessionStatus::Failed);
        assert!(stored.end_time.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_outcome_writes_count_as_failed_cases() {
        let store = Arc::new(StallingStore::new());
        store.stall("append_outcome_record");

        let pipeline = TrainingPipeline::new(
            store.clone(),
            Arc::new(echo_inference()),
            Arc::new(FixedCases(cases(4))),
            &LearningConfig::default(),
        );

        let session = pipeline.run_training_session().await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.cases_processed, 0);
        assert_eq!(session.cases_failed, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_timeout_fails_session() {
        struct EndlessCases;

        #[async_trait]
        impl CaseSource for EndlessCases {
            async fn fetch_batch(&self, _batch_size: usize) -> Result<CaseBatch> {
                std::future::pending().await
            }
        }

        let mut config = LearningConfig::default();
        config.pipeline.session_timeout = std::time::Duration::from_secs(60);
        let store = Arc::new(InMemoryStore::new());
        let pipeline = TrainingPipeline::new(
            store.clone(),
            Arc::new(MockInferenceService::new()),
            Arc::new(EndlessCases),
            &config,
        );

        let err = pipeline.run_training_session().await.unwrap_err();
        assert!(err.to_string().contains("training session timed out after 60000ms"));

        let sessions = store.list_sessions(10).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].status, SessionStatus::Failed);
    }

    #[tokio::test]
    async fn test_out_of_range_lookback_fails_session() {
        let mut config = LearningConfig::default();
        config.pipeline.accuracy_lookback_days = i64::MAX;

        let store = Arc::new(InMemoryStore::new());
        let pipeline = TrainingPipeline::new(
            store.clone(),
            Arc::new(MockInferenceService::new()),
            Arc::new(FixedCases(cases(2))),
            &config,
        );

        let err = pipeline.run_training_session().await.unwrap_err();
        assert!(matches!(err, AsclepiusError::SessionFailure { .. }));
        let sessions = store.list_sessions(10).await.unwrap();
        assert_eq!(sessions[0].status, SessionStatus::Failed);
    }
}
