//! Reward and policy layer.
//!
//! Outcome feedback flows through [`LearningContext::ingest_outcome`]:
//!
//! 1. [`reward::calculate_reward`] scores the outcome in `[-1, 1]`
//! 2. [`QLearningAgent`] updates Q(state, predicted diagnosis), skipped when
//!    the diagnosis is not in the action catalogue
//! 3. [`TreatmentBandit`] counts the treatment result, when one is reported
//! 4. a feedback outcome row is appended for the scheduler to count
//!
//! Both learners write through to the [`LearningStore`] and are rehydrated
//! by [`LearningContext::load`]. Writes that fail are retried by
//! [`LearningContext::sync_to_store`].

pub mod bandit;
pub mod catalogue;
pub mod keyed_lock;
pub mod q_learning;
pub mod reward;

pub use bandit::{ArmStats, TreatmentBandit};
pub use catalogue::{ActionCatalogueProvider, StaticCatalogue};
pub use keyed_lock::KeyedLocks;
pub use q_learning::{discretize_state, state_action_key, QLearningAgent};
pub use reward::{calculate_reward, reward_breakdown, RewardBreakdown};

use crate::config::LearningConfig;
use crate::error::Result;
use crate::storage::LearningStore;
use crate::types::{BanditArm, CaseOutcomeRecord, OutcomeFeedback};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// What one ingested outcome changed
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub case_id: String,
    pub reward: RewardBreakdown,
    /// `None` when the predicted diagnosis is outside the catalogue
    pub q_value: Option<f64>,
    pub arm: Option<BanditArm>,
    /// False when the feedback outcome row could not be stored
    pub outcome_recorded: bool,
}

/// Owns both learners for the lifetime of the process
pub struct LearningContext {
    store: Arc<dyn LearningStore>,
    q_agent: QLearningAgent,
    bandit: TreatmentBandit,
}

impl LearningContext {
    /// Build both learners and rehydrate them from the store
    pub async fn load(
        store: Arc<dyn LearningStore>,
        config: &LearningConfig,
        catalogue: Arc<dyn ActionCatalogueProvider>,
    ) -> Result<Self> {
        let q_agent = QLearningAgent::new(store.clone(), catalogue, &config.q_learning);
        let bandit = TreatmentBandit::new(store.clone(), &config.bandit);
        q_agent.load_q_table().await?;
        bandit.load_arms().await?;
        Ok(Self {
            store,
            q_agent,
            bandit,
        })
    }

    pub fn q_agent(&self) -> &QLearningAgent {
        &self.q_agent
    }

    pub fn bandit(&self) -> &TreatmentBandit {
        &self.bandit
    }

    /// Feed one real-world outcome to both learners
    ///
    /// The transition is terminal: the next state is the current state.
    pub async fn ingest_outcome(&self, feedback: &OutcomeFeedback) -> Result<IngestReport> {
        let reward = reward_breakdown(feedback);
        let state = &feedback.patient_state;

        let q_value = if self.q_agent.knows_action(&feedback.predicted_diagnosis) {
            Some(
                self.q_agent
                    .learn(state, &feedback.predicted_diagnosis, reward.total, state)
                    .await?,
            )
        } else {
            warn!(
                "Case {}: predicted diagnosis {:?} is not in the catalogue, Q update skipped",
                feedback.case_id, feedback.predicted_diagnosis
            );
            None
        };

        let arm = match (&feedback.treatment, feedback.treatment_effective) {
            (Some(treatment), Some(effective)) => {
                let condition = feedback
                    .condition
                    .as_deref()
                    .unwrap_or(&feedback.actual_diagnosis);
                Some(
                    self.bandit
                        .record_outcome(condition, treatment, effective)
                        .await,
                )
            }
            _ => None,
        };

        let record = CaseOutcomeRecord {
            case_id: feedback.case_id.clone(),
            predicted_label: feedback.predicted_diagnosis.clone(),
            actual_label: feedback.actual_diagnosis.clone(),
            confidence: feedback.confidence.clamp(0.0, 1.0),
            session_id: None,
            timestamp: feedback.recorded_at,
        };
        let outcome_recorded = match self.store.append_outcome_record(&record).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to record outcome for case {}: {}", feedback.case_id, e);
                false
            }
        };

        debug!(
            "Ingested outcome for case {}: reward {:.3}, Q {:?}",
            feedback.case_id, reward.total, q_value
        );

        Ok(IngestReport {
            case_id: feedback.case_id.clone(),
            reward,
            q_value,
            arm,
            outcome_recorded,
        })
    }

    /// Retry learner writes that failed, returning how many rows landed
    pub async fn sync_to_store(&self) -> Result<usize> {
        let q_values = self.q_agent.sync_to_store().await?;
        let arms = self.bandit.sync_to_store().await?;
        Ok(q_values + arms)
    }

    /// Learner rows still waiting for [`Self::sync_to_store`]
    pub fn pending_sync(&self) -> usize {
        self.q_agent.pending_sync() + self.bandit.pending_sync()
    }
}
