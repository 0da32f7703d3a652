//! Asclepius - Continuous-Learning Control Loop for Clinical Decision Support
//!
//! Decides *when* a diagnosis model should be re-evaluated, measures *how*
//! well it performs, and learns a treatment/diagnosis selection policy from
//! real-world outcomes.
//!
//! # Architecture
//!
//! Leaves first:
//! - **Evaluation**: pure metrics over prediction records (accuracy, macro
//!   F1, calibration, AUROC, confusion statistics)
//! - **Learning**: reward function, tabular Q-learning over
//!   (patient state, diagnosis), Thompson Sampling over treatments
//! - **Pipeline**: one evaluation/training session end to end
//! - **Scheduler**: periodic threshold check that triggers the pipeline
//!
//! The store and the diagnosis model are external collaborators behind the
//! [`LearningStore`] and [`InferenceService`] traits.
//!
//! # Example
//!
//! ```ignore
//! use asclepius_core::{LearningConfig, LibsqlStore, RuleBasedInference, TrainingPipeline};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = LearningConfig::load(None)?;
//!     let store = Arc::new(LibsqlStore::new_local("asclepius.db").await?);
//!     let pipeline = TrainingPipeline::from_config(store, Arc::new(RuleBasedInference::new()), &config);
//!
//!     let session = pipeline.run_training_session().await?;
//!     println!("improvement: {:+.3}", session.improvement_rate);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod evaluation;
pub mod learning;
pub mod pipeline;
pub mod scheduler;
pub mod services;
pub mod storage;
pub mod types;

// Re-export commonly used types
pub use config::{CaseSourceMode, LearningConfig};
pub use error::{AsclepiusError, Result};
pub use evaluation::{calculate_advanced_metrics, compute_advanced_metrics, AdvancedMetrics};
pub use learning::{
    calculate_reward, ActionCatalogueProvider, LearningContext, QLearningAgent, StaticCatalogue,
    TreatmentBandit,
};
pub use pipeline::{CaseSource, TrainingPipeline};
pub use scheduler::{CheckOutcome, SchedulerState, SchedulerStatus, TrainingScheduler};
pub use services::{InferenceService, RuleBasedInference};
pub use storage::{InMemoryStore, LearningStore, LibsqlStore};
pub use types::{
    CaseOutcomeRecord, OutcomeFeedback, PatientState, PredictionRecord, SessionId,
    SessionStatus, TrainingSession, TriageCase,
};
