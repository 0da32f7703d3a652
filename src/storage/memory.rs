//! In-memory storage backend
//!
//! Same contract as [`LibsqlStore`](super::LibsqlStore) without any I/O.
//! Nothing survives the process.

use crate::error::{AsclepiusError, Result};
use crate::storage::{days_before, LearningStore};
use crate::types::{
    BanditArm, CaseOutcomeRecord, Notification, QTableEntry, SessionId, SessionStatus,
    SessionUpdate, TrainingSession, TriageCase,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use tokio::sync::RwLock;

struct StoredOutcome {
    record: CaseOutcomeRecord,
    inserted_at: DateTime<Utc>,
}

#[derive(Default)]
struct Tables {
    cases: HashMap<String, TriageCase>,
    outcomes: Vec<StoredOutcome>,
    sessions: HashMap<SessionId, TrainingSession>,
    q_values: HashMap<String, f64>,
    bandit_arms: HashMap<String, BanditArm>,
    notifications: Vec<Notification>,
}

/// Volatile store backed by hash maps
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn newest_first(a: &TrainingSession, b: &TrainingSession) -> std::cmp::Ordering {
    b.start_time
        .cmp(&a.start_time)
        .then_with(|| b.session_id.cmp(&a.session_id))
}

#[async_trait]
impl LearningStore for InMemoryStore {
    async fn insert_case(&self, case: &TriageCase) -> Result<()> {
        self.tables
            .write()
            .await
            .cases
            .insert(case.id.clone(), case.clone());
        Ok(())
    }

    async fn read_recent_cases(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TriageCase>> {
        let tables = self.tables.read().await;
        let mut cases: Vec<TriageCase> = tables
            .cases
            .values()
            .filter(|c| c.gold_label.is_some() && c.created_at >= since)
            .cloned()
            .collect();
        cases.shuffle(&mut rand::thread_rng());
        cases.truncate(limit);
        Ok(cases)
    }

    async fn append_outcome_record(&self, record: &CaseOutcomeRecord) -> Result<()> {
        self.tables.write().await.outcomes.push(StoredOutcome {
            record: record.clone(),
            inserted_at: Utc::now(),
        });
        Ok(())
    }

    async fn count_outcomes_since(&self, since: DateTime<Utc>) -> Result<u64> {
        let tables = self.tables.read().await;
        Ok(tables
            .outcomes
            .iter()
            .filter(|o| o.record.session_id.is_none() && o.inserted_at >= since)
            .count() as u64)
    }

    async fn read_outcomes_since(&self, since: DateTime<Utc>) -> Result<Vec<CaseOutcomeRecord>> {
        let tables = self.tables.read().await;
        let mut outcomes: Vec<CaseOutcomeRecord> = tables
            .outcomes
            .iter()
            .filter(|o| o.record.timestamp >= since)
            .map(|o| o.record.clone())
            .collect();
        outcomes.sort_by_key(|o| o.timestamp);
        Ok(outcomes)
    }

    async fn count_session_outcomes(&self, session_id: &SessionId) -> Result<u64> {
        let tables = self.tables.read().await;
        Ok(tables
            .outcomes
            .iter()
            .filter(|o| o.record.session_id.as_deref() == Some(session_id.as_str()))
            .count() as u64)
    }

    async fn insert_session(&self, session: &TrainingSession) -> Result<()> {
        self.tables
            .write()
            .await
            .sessions
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn update_session(&self, session_id: &SessionId, update: &SessionUpdate) -> Result<()> {
        let mut tables = self.tables.write().await;
        let session = tables.sessions.get_mut(session_id).ok_or_else(|| {
            AsclepiusError::Database(format!("Session not found: {}", session_id))
        })?;
        update.apply_to(session);
        Ok(())
    }

    async fn read_session(&self, session_id: &SessionId) -> Result<Option<TrainingSession>> {
        Ok(self.tables.read().await.sessions.get(session_id).cloned())
    }

    async fn read_latest_completed_session(&self) -> Result<Option<TrainingSession>> {
        let tables = self.tables.read().await;
        Ok(tables
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Completed)
            .min_by(|a, b| newest_first(a, b))
            .cloned())
    }

    async fn list_sessions(&self, limit: usize) -> Result<Vec<TrainingSession>> {
        let tables = self.tables.read().await;
        let mut sessions: Vec<TrainingSession> = tables.sessions.values().cloned().collect();
        sessions.sort_by(newest_first);
        sessions.truncate(limit);
        Ok(sessions)
    }

    async fn upsert_q_value(&self, entry: &QTableEntry) -> Result<()> {
        self.tables
            .write()
            .await
            .q_values
            .insert(entry.state_action_key.clone(), entry.q_value);
        Ok(())
    }

    async fn read_all_q_values(&self) -> Result<Vec<QTableEntry>> {
        let tables = self.tables.read().await;
        Ok(tables
            .q_values
            .iter()
            .map(|(key, value)| QTableEntry {
                state_action_key: key.clone(),
                q_value: *value,
            })
            .collect())
    }

    async fn upsert_bandit_arm(&self, arm: &BanditArm) -> Result<()> {
        self.tables
            .write()
            .await
            .bandit_arms
            .insert(arm.condition_treatment_key.clone(), arm.clone());
        Ok(())
    }

    async fn read_all_bandit_arms(&self) -> Result<Vec<BanditArm>> {
        Ok(self
            .tables
            .read()
            .await
            .bandit_arms
            .values()
            .cloned()
            .collect())
    }

    async fn purge_outcomes_older_than(&self, days: u32) -> Result<u64> {
        let cutoff = days_before(Utc::now(), i64::from(days))?;
        let mut tables = self.tables.write().await;
        let before = tables.outcomes.len();
        tables.outcomes.retain(|o| o.record.timestamp >= cutoff);
        Ok((before - tables.outcomes.len()) as u64)
    }

    async fn insert_notification(&self, notification: &Notification) -> Result<()> {
        self.tables
            .write()
            .await
            .notifications
            .push(notification.clone());
        Ok(())
    }

    async fn list_notifications(&self, limit: usize) -> Result<Vec<Notification>> {
        let tables = self.tables.read().await;
        Ok(tables
            .notifications
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn outcome(case_id: &str, session_id: Option<&str>, age: Duration) -> CaseOutcomeRecord {
        CaseOutcomeRecord {
            case_id: case_id.to_string(),
            predicted_label: "influenza".to_string(),
            actual_label: "influenza".to_string(),
            confidence: 0.8,
            session_id: session_id.map(str::to_string),
            timestamp: Utc::now() - age,
        }
    }

    #[tokio::test]
    async fn test_count_outcomes_ignores_session_rows_and_report_time() {
        let store = InMemoryStore::new();
        store
            .append_outcome_record(&outcome("c1", None, Duration::hours(1)))
            .await
            .unwrap();
        store
            .append_outcome_record(&outcome("c2", Some("session-1"), Duration::hours(1)))
            .await
            .unwrap();
        store
            .append_outcome_record(&outcome("c3", None, Duration::days(10)))
            .await
            .unwrap();

        // c3 reports an outcome from 10 days ago but arrived just now
        let since = Utc::now() - Duration::days(1);
        assert_eq!(store.count_outcomes_since(since).await.unwrap(), 2);
        assert_eq!(store.read_outcomes_since(since).await.unwrap().len(), 2);
        assert_eq!(
            store
                .count_session_outcomes(&SessionId("session-1".to_string()))
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_update_unknown_session_fails() {
        let store = InMemoryStore::new();
        let result = store
            .update_session(&SessionId::generate(), &SessionUpdate::approval())
            .await;
        assert!(matches!(result, Err(AsclepiusError::Database(_))));
    }

    #[tokio::test]
    async fn test_latest_completed_session() {
        let store = InMemoryStore::new();
        assert!(store.read_latest_completed_session().await.unwrap().is_none());

        let mut older = TrainingSession::start(SessionId::generate());
        older.start_time = Utc::now() - Duration::days(2);
        older.complete(0.5, 0.6).unwrap();
        let mut newer = TrainingSession::start(SessionId::generate());
        newer.complete(0.6, 0.7).unwrap();
        let running = TrainingSession::start(SessionId::generate());

        for s in [&older, &newer, &running] {
            store.insert_session(s).await.unwrap();
        }

        let latest = store.read_latest_completed_session().await.unwrap().unwrap();
        assert_eq!(latest.session_id, newer.session_id);
        assert_eq!(store.list_sessions(10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_purge_removes_only_expired_rows() {
        let store = InMemoryStore::new();
        store
            .append_outcome_record(&outcome("old", None, Duration::days(400)))
            .await
            .unwrap();
        store
            .append_outcome_record(&outcome("new", None, Duration::days(1)))
            .await
            .unwrap();

        assert_eq!(store.purge_outcomes_older_than(365).await.unwrap(), 1);
        assert_eq!(store.purge_outcomes_older_than(365).await.unwrap(), 0);
    }
}
