//! Core data types for the Asclepius learning loop
//!
//! This module defines the records exchanged between the evaluation engine,
//! the learners, the training pipeline and the store: prediction records,
//! training sessions, case outcome rows, triage cases, outcome feedback and
//! the persisted learner tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AsclepiusError, Result};

/// Unique, creation-time sortable identifier for training sessions
///
/// Format: `session-<13 digit unix millis>-<8 hex chars>`. The zero-padded
/// millisecond prefix keeps lexicographic order equal to creation order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Allocate a fresh session ID stamped with the current time
    pub fn generate() -> Self {
        Self::generate_at(Utc::now())
    }

    /// Allocate a session ID stamped with the given time
    pub fn generate_at(at: DateTime<Utc>) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!(
            "session-{:013}-{}",
            at.timestamp_millis().max(0),
            &suffix[..8]
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a training session
///
/// `Running` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(SessionStatus::Running),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            other => Err(AsclepiusError::Other(format!(
                "Invalid session status: {}",
                other
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Running)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Where the cases of a training batch came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseOrigin {
    /// Recently stored triage cases with gold labels
    Store,
    /// Seeded synthetic cases from the fixed vocabulary
    Synthetic,
}

impl CaseOrigin {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "store" => Ok(CaseOrigin::Store),
            "synthetic" => Ok(CaseOrigin::Synthetic),
            other => Err(AsclepiusError::Other(format!(
                "Invalid case origin: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for CaseOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaseOrigin::Store => write!(f, "store"),
            CaseOrigin::Synthetic => write!(f, "synthetic"),
        }
    }
}

/// One evaluation/training run of the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSession {
    pub session_id: SessionId,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub cases_processed: u32,
    /// Cases skipped because inference failed, timed out, or the row could not be stored
    pub cases_failed: u32,
    pub accuracy_before: f64,
    pub accuracy_after: f64,
    pub improvement_rate: f64,
    pub status: SessionStatus,
    pub case_origin: Option<CaseOrigin>,
    pub approved: bool,
    pub error_message: Option<String>,
}

impl TrainingSession {
    /// Open a new running session
    pub fn start(session_id: SessionId) -> Self {
        Self {
            session_id,
            start_time: Utc::now(),
            end_time: None,
            cases_processed: 0,
            cases_failed: 0,
            accuracy_before: 0.0,
            accuracy_after: 0.0,
            improvement_rate: 0.0,
            status: SessionStatus::Running,
            case_origin: None,
            approved: false,
            error_message: None,
        }
    }

    /// Transition `running -> completed`
    pub fn complete(&mut self, accuracy_before: f64, accuracy_after: f64) -> Result<()> {
        self.ensure_running()?;
        self.accuracy_before = accuracy_before.clamp(0.0, 1.0);
        self.accuracy_after = accuracy_after.clamp(0.0, 1.0);
        self.improvement_rate = self.accuracy_after - self.accuracy_before;
        self.status = SessionStatus::Completed;
        self.end_time = Some(Utc::now());
        Ok(())
    }

    /// Transition `running -> failed`
    pub fn fail(&mut self, message: impl Into<String>) -> Result<()> {
        self.ensure_running()?;
        self.status = SessionStatus::Failed;
        self.error_message = Some(message.into());
        self.end_time = Some(Utc::now());
        Ok(())
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.end_time.map(|end| end - self.start_time)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(AsclepiusError::InvalidOperation(format!(
                "Session {} is already {}",
                self.session_id, self.status
            )));
        }
        Ok(())
    }
}

/// Partial update applied to a stored session row
///
/// `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionUpdate {
    pub status: Option<SessionStatus>,
    pub end_time: Option<DateTime<Utc>>,
    pub cases_processed: Option<u32>,
    pub cases_failed: Option<u32>,
    pub accuracy_before: Option<f64>,
    pub accuracy_after: Option<f64>,
    pub improvement_rate: Option<f64>,
    pub case_origin: Option<CaseOrigin>,
    pub approved: Option<bool>,
    pub error_message: Option<String>,
}

impl SessionUpdate {
    /// Snapshot every mutable field of a session
    pub fn from_session(session: &TrainingSession) -> Self {
        Self {
            status: Some(session.status),
            end_time: session.end_time,
            cases_processed: Some(session.cases_processed),
            cases_failed: Some(session.cases_failed),
            accuracy_before: Some(session.accuracy_before),
            accuracy_after: Some(session.accuracy_after),
            improvement_rate: Some(session.improvement_rate),
            case_origin: session.case_origin,
            approved: Some(session.approved),
            error_message: session.error_message.clone(),
        }
    }

    pub fn approval() -> Self {
        Self {
            approved: Some(true),
            ..Default::default()
        }
    }

    /// Apply this update to an in-memory session
    pub fn apply_to(&self, session: &mut TrainingSession) {
        if let Some(status) = self.status {
            session.status = status;
        }
        if let Some(end_time) = self.end_time {
            session.end_time = Some(end_time);
        }
        if let Some(n) = self.cases_processed {
            session.cases_processed = n;
        }
        if let Some(n) = self.cases_failed {
            session.cases_failed = n;
        }
        if let Some(v) = self.accuracy_before {
            session.accuracy_before = v;
        }
        if let Some(v) = self.accuracy_after {
            session.accuracy_after = v;
        }
        if let Some(v) = self.improvement_rate {
            session.improvement_rate = v;
        }
        if let Some(origin) = self.case_origin {
            session.case_origin = Some(origin);
        }
        if let Some(approved) = self.approved {
            session.approved = approved;
        }
        if let Some(msg) = &self.error_message {
            session.error_message = Some(msg.clone());
        }
    }
}

/// A single (prediction, ground truth, confidence) tuple fed to the evaluation engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub predicted: String,
    pub actual: String,
    pub confidence: f64,
    pub correct: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl PredictionRecord {
    /// Build a record, deriving `correct` from the labels
    pub fn new(predicted: impl Into<String>, actual: impl Into<String>, confidence: f64) -> Self {
        let predicted = predicted.into();
        let actual = actual.into();
        let correct = predicted == actual;
        Self {
            predicted,
            actual,
            confidence: confidence.clamp(0.0, 1.0),
            correct,
            condition: None,
        }
    }
}

/// One processed case, persisted by the pipeline or by outcome ingestion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseOutcomeRecord {
    pub case_id: String,
    pub predicted_label: String,
    pub actual_label: String,
    pub confidence: f64,
    /// Set for rows written by a training session, `None` for real-world feedback
    pub session_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl CaseOutcomeRecord {
    pub fn to_prediction_record(&self) -> PredictionRecord {
        PredictionRecord::new(
            self.predicted_label.clone(),
            self.actual_label.clone(),
            self.confidence,
        )
    }
}

/// Triage urgency level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

impl Urgency {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Urgency::Low),
            "medium" => Some(Urgency::Medium),
            "high" => Some(Urgency::High),
            "critical" => Some(Urgency::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Urgency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Urgency::Low => write!(f, "low"),
            Urgency::Medium => write!(f, "medium"),
            Urgency::High => write!(f, "high"),
            Urgency::Critical => write!(f, "critical"),
        }
    }
}

/// A case handed to the inference service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriageCase {
    pub id: String,
    pub symptoms: Vec<String>,
    pub age: Option<u32>,
    #[serde(default)]
    pub risk_factors: Vec<String>,
    pub urgency: Option<Urgency>,
    /// Confirmed diagnosis, when known
    pub gold_label: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Output of the opaque inference function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub predicted_label: String,
    pub confidence: f64,
}

/// Patient features the Q-learning agent discretizes into a state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatientState {
    pub symptoms: Vec<String>,
    pub age: Option<u32>,
    #[serde(default)]
    pub risk_factors: Vec<String>,
}

/// A real-world outcome report for one case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeFeedback {
    pub case_id: String,
    pub patient_state: PatientState,
    pub predicted_diagnosis: String,
    pub actual_diagnosis: String,
    pub confidence: f64,
    #[serde(default)]
    pub time_to_resolution_hours: Option<f64>,
    /// Patient-reported satisfaction on a 1-5 scale
    #[serde(default)]
    pub satisfaction: Option<f64>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub treatment: Option<String>,
    #[serde(default)]
    pub treatment_effective: Option<bool>,
    #[serde(default)]
    pub adverse_event: bool,
    #[serde(default)]
    pub readmitted_30d: bool,
    #[serde(default = "Utc::now")]
    pub recorded_at: DateTime<Utc>,
}

impl OutcomeFeedback {
    pub fn diagnosis_correct(&self) -> bool {
        self.predicted_diagnosis == self.actual_diagnosis
    }
}

/// Summary emitted after a scheduled session completes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub session_id: String,
    pub title: String,
    pub message: String,
    pub cases_processed: u32,
    pub improvement_rate: f64,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn for_session(session: &TrainingSession) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session.session_id.to_string(),
            title: "Model training completed".to_string(),
            message: format!(
                "Processed {} cases ({} failed). Accuracy {:.1}% -> {:.1}% ({:+.2}%)",
                session.cases_processed,
                session.cases_failed,
                session.accuracy_before * 100.0,
                session.accuracy_after * 100.0,
                session.improvement_rate * 100.0
            ),
            cases_processed: session.cases_processed,
            improvement_rate: session.improvement_rate,
            created_at: Utc::now(),
        }
    }
}

/// Persisted Q-table row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QTableEntry {
    pub state_action_key: String,
    pub q_value: f64,
}

/// Persisted bandit arm row (Laplace-smoothed counts, both >= 1)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanditArm {
    pub condition_treatment_key: String,
    pub successes: u32,
    pub failures: u32,
}
