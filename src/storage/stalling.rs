//! Test backend whose chosen calls never return.
//!
//! Wraps an [`InMemoryStore`] and parks the named operations forever, the
//! way a store stuck behind a held lock or a dead connection behaves.

use crate::error::Result;
use crate::storage::{InMemoryStore, LearningStore};
use crate::types::{
    BanditArm, CaseOutcomeRecord, Notification, QTableEntry, SessionId, SessionUpdate,
    TrainingSession, TriageCase,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Default)]
pub struct StallingStore {
    inner: InMemoryStore,
    stalled: Mutex<HashSet<&'static str>>,
}

impl StallingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park every later call to `operation`
    pub fn stall(&self, operation: &'static str) {
        self.stalled.lock().unwrap().insert(operation);
    }

    pub fn resume(&self, operation: &'static str) {
        self.stalled.lock().unwrap().remove(operation);
    }

    async fn gate(&self, operation: &'static str) {
        let parked = self.stalled.lock().unwrap().contains(operation);
        if parked {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl LearningStore for StallingStore {
    async fn insert_case(&self, case: &TriageCase) -> Result<()> {
        self.gate("insert_case").await;
        self.inner.insert_case(case).await
    }

    async fn read_recent_cases(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TriageCase>> {
        self.gate("read_recent_cases").await;
        self.inner.read_recent_cases(since, limit).await
    }

    async fn append_outcome_record(&self, record: &CaseOutcomeRecord) -> Result<()> {
        self.gate("append_outcome_record").await;
        self.inner.append_outcome_record(record).await
    }

    async fn count_outcomes_since(&self, since: DateTime<Utc>) -> Result<u64> {
        self.gate("count_outcomes_since").await;
        self.inner.count_outcomes_since(since).await
    }

    async fn read_outcomes_since(&self, since: DateTime<Utc>) -> Result<Vec<CaseOutcomeRecord>> {
        self.gate("read_outcomes_since").await;
        self.inner.read_outcomes_since(since).await
    }

    async fn count_session_outcomes(&self, session_id: &SessionId) -> Result<u64> {
        self.gate("count_session_outcomes").await;
        self.inner.count_session_outcomes(session_id).await
    }

    async fn insert_session(&self, session: &TrainingSession) -> Result<()> {
        self.gate("insert_session").await;
        self.inner.insert_session(session).await
    }

    async fn update_session(&self, session_id: &SessionId, update: &SessionUpdate) -> Result<()> {
        self.gate("update_session").await;
        self.inner.update_session(session_id, update).await
    }

    async fn read_session(&self, session_id: &SessionId) -> Result<Option<TrainingSession>> {
        self.gate("read_session").await;
        self.inner.read_session(session_id).await
    }

    async fn read_latest_completed_session(&self) -> Result<Option<TrainingSession>> {
        self.gate("read_latest_completed_session").await;
        self.inner.read_latest_completed_session().await
    }

    async fn list_sessions(&self, limit: usize) -> Result<Vec<TrainingSession>> {
        self.gate("list_sessions").await;
        self.inner.list_sessions(limit).await
    }

    async fn upsert_q_value(&self, entry: &QTableEntry) -> Result<()> {
        self.gate("upsert_q_value").await;
        self.inner.upsert_q_value(entry).await
    }

    async fn read_all_q_values(&self) -> Result<Vec<QTableEntry>> {
        self.gate("read_all_q_values").await;
        self.inner.read_all_q_values().await
    }

    async fn upsert_bandit_arm(&self, arm: &BanditArm) -> Result<()> {
        self.gate("upsert_bandit_arm").await;
        self.inner.upsert_bandit_arm(arm).await
    }

    async fn read_all_bandit_arms(&self) -> Result<Vec<BanditArm>> {
        self.gate("read_all_bandit_arms").await;
        self.inner.read_all_bandit_arms().await
    }

    async fn purge_outcomes_older_than(&self, days: u32) -> Result<u64> {
        self.gate("purge_outcomes_older_than").await;
        self.inner.purge_outcomes_older_than(days).await
    }

    async fn insert_notification(&self, notification: &Notification) -> Result<()> {
        self.gate("insert_notification").await;
        self.inner.insert_notification(notification).await
    }

    async fn list_notifications(&self, limit: usize) -> Result<Vec<Notification>> {
        self.gate("list_notifications").await;
        self.inner.list_notifications(limit).await
    }
}
