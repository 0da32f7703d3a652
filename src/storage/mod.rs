//! Storage layer for the Asclepius learning loop
//!
//! The relational store is an external collaborator reached through the
//! narrow [`LearningStore`] contract. Two backends implement it: libSQL for
//! deployments and an in-memory store for tests.

pub mod libsql;
pub mod memory;
#[cfg(test)]
pub(crate) mod stalling;

pub use self::libsql::LibsqlStore;
pub use self::memory::InMemoryStore;
#[cfg(test)]
pub(crate) use self::stalling::StallingStore;

use crate::error::{AsclepiusError, Result};
use crate::types::{
    BanditArm, CaseOutcomeRecord, Notification, QTableEntry, SessionId, SessionUpdate,
    TrainingSession, TriageCase,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::future::Future;
use tokio::time::timeout;

/// Read/write contract for everything the learning loop persists
///
/// Writes are idempotent upserts or appends and may be retried individually.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LearningStore: Send + Sync {
    /// Store a triage case (upsert by id)
    async fn insert_case(&self, case: &TriageCase) -> Result<()>;

    /// Random sample of labelled cases created at or after `since`
    async fn read_recent_cases(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TriageCase>>;

    /// Append a processed case outcome
    async fn append_outcome_record(&self, record: &CaseOutcomeRecord) -> Result<()>;

    /// Count feedback outcome rows (no session id) inserted at or after `since`
    ///
    /// Counts by insertion time, so feedback carrying an older `timestamp`
    /// still counts once it arrives.
    async fn count_outcomes_since(&self, since: DateTime<Utc>) -> Result<u64>;

    /// All outcome rows recorded at or after `since`, oldest first
    async fn read_outcomes_since(&self, since: DateTime<Utc>) -> Result<Vec<CaseOutcomeRecord>>;

    /// Count outcome rows written under a training session
    async fn count_session_outcomes(&self, session_id: &SessionId) -> Result<u64>;

    async fn insert_session(&self, session: &TrainingSession) -> Result<()>;

    /// Apply a partial update; unknown session ids are an error
    async fn update_session(&self, session_id: &SessionId, update: &SessionUpdate) -> Result<()>;

    async fn read_session(&self, session_id: &SessionId) -> Result<Option<TrainingSession>>;

    /// The completed session with the latest start time
    async fn read_latest_completed_session(&self) -> Result<Option<TrainingSession>>;

    /// Most recent sessions first
    async fn list_sessions(&self, limit: usize) -> Result<Vec<TrainingSession>>;

    async fn upsert_q_value(&self, entry: &QTableEntry) -> Result<()>;

    async fn read_all_q_values(&self) -> Result<Vec<QTableEntry>>;

    async fn upsert_bandit_arm(&self, arm: &BanditArm) -> Result<()>;

    async fn read_all_bandit_arms(&self) -> Result<Vec<BanditArm>>;

    /// Delete outcome rows older than `days`, returning how many were removed
    async fn purge_outcomes_older_than(&self, days: u32) -> Result<u64>;

    async fn insert_notification(&self, notification: &Notification) -> Result<()>;

    /// Most recent notifications first
    async fn list_notifications(&self, limit: usize) -> Result<Vec<Notification>>;
}

/// Run one store call under `limit`
///
/// An elapsed limit becomes [`AsclepiusError::Timeout`] naming `operation`;
/// the pending call is dropped.
pub async fn bounded<T, F>(limit: std::time::Duration, operation: &str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    timeout(limit, call)
        .await
        .map_err(|_| AsclepiusError::Timeout {
            operation: operation.to_string(),
            timeout_ms: limit.as_millis() as u64,
        })?
}

/// `now - days`, or a config error when the window leaves chrono's range
pub fn days_before(now: DateTime<Utc>, days: i64) -> Result<DateTime<Utc>> {
    Duration::try_days(days)
        .and_then(|window| now.checked_sub_signed(window))
        .ok_or_else(|| AsclepiusError::Config(format!("window of {} days is out of range", days)))
}
