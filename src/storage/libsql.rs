//! LibSQL storage backend implementation
//!
//! Persists cases, outcomes, training sessions, learner tables and
//! notifications in a local libSQL database. The schema is embedded and
//! applied idempotently on open. Timestamps are stored as integer unix
//! milliseconds, booleans as integers.

use crate::error::{AsclepiusError, Result};
use crate::storage::{days_before, LearningStore};
use crate::types::{
    BanditArm, CaseOrigin, CaseOutcomeRecord, Notification, QTableEntry, SessionId,
    SessionStatus, SessionUpdate, TrainingSession, TriageCase, Urgency,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use libsql::{params, Builder, Connection, Database, Value};
use std::path::Path;
use tracing::{debug, info};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS triage_cases (
    id TEXT PRIMARY KEY NOT NULL,
    symptoms TEXT NOT NULL,
    age INTEGER,
    risk_factors TEXT NOT NULL DEFAULT '[]',
    urgency TEXT,
    gold_label TEXT,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_triage_cases_created ON triage_cases(created_at);

CREATE TABLE IF NOT EXISTS case_outcomes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    case_id TEXT NOT NULL,
    predicted_label TEXT NOT NULL,
    actual_label TEXT NOT NULL,
    confidence REAL NOT NULL,
    session_id TEXT,
    recorded_at INTEGER NOT NULL,
    inserted_at INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_case_outcomes_recorded ON case_outcomes(recorded_at);
CREATE INDEX IF NOT EXISTS idx_case_outcomes_session ON case_outcomes(session_id);

CREATE TABLE IF NOT EXISTS training_sessions (
    session_id TEXT PRIMARY KEY NOT NULL,
    start_time INTEGER NOT NULL,
    end_time INTEGER,
    cases_processed INTEGER NOT NULL DEFAULT 0,
    cases_failed INTEGER NOT NULL DEFAULT 0,
    accuracy_before REAL NOT NULL DEFAULT 0,
    accuracy_after REAL NOT NULL DEFAULT 0,
    improvement_rate REAL NOT NULL DEFAULT 0,
    status TEXT NOT NULL CHECK(status IN ('running', 'completed', 'failed')),
    case_origin TEXT,
    approved INTEGER NOT NULL DEFAULT 0,
    error_message TEXT
);
CREATE INDEX IF NOT EXISTS idx_training_sessions_start ON training_sessions(start_time);

CREATE TABLE IF NOT EXISTS q_values (
    state_action_key TEXT PRIMARY KEY NOT NULL,
    q_value REAL NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS bandit_arms (
    condition_treatment_key TEXT PRIMARY KEY NOT NULL,
    successes INTEGER NOT NULL CHECK(successes >= 1),
    failures INTEGER NOT NULL CHECK(failures >= 1),
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS notifications (
    id TEXT PRIMARY KEY NOT NULL,
    session_id TEXT NOT NULL,
    title TEXT NOT NULL,
    message TEXT NOT NULL,
    cases_processed INTEGER NOT NULL,
    improvement_rate REAL NOT NULL,
    created_at INTEGER NOT NULL
);
"#;

/// Databases created before outcome rows carried an insertion time
const ADD_INSERTED_AT: &str = r#"
ALTER TABLE case_outcomes ADD COLUMN inserted_at INTEGER NOT NULL DEFAULT 0;
UPDATE case_outcomes SET inserted_at = recorded_at;
"#;

const SESSION_COLUMNS: &str = "session_id, start_time, end_time, cases_processed, cases_failed, \
     accuracy_before, accuracy_after, improvement_rate, status, case_origin, approved, error_message";

/// LibSQL-backed [`LearningStore`]
///
/// Holds a single connection for its whole lifetime. libSQL gives every
/// connection to `:memory:` its own database, so per-call connections would
/// lose data in memory mode.
pub struct LibsqlStore {
    _db: Database,
    conn: Connection,
}

impl LibsqlStore {
    /// Open (or create) a database file and apply the schema
    pub async fn new_local(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening libSQL database: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    AsclepiusError::Database(format!(
                        "Failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .map_err(|e| AsclepiusError::Database(format!("Failed to open database: {}", e)))?;
        Self::from_database(db).await
    }

    async fn from_database(db: Database) -> Result<Self> {
        let conn = db
            .connect()
            .map_err(|e| AsclepiusError::Database(format!("Failed to get connection: {}", e)))?;
        let store = Self { _db: db, conn };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA)
            .await
            .map_err(|e| AsclepiusError::Database(format!("Schema migration failed: {}", e)))?;

        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM pragma_table_info('case_outcomes') WHERE name = 'inserted_at'",
                params![],
            )
            .await?;
        let has_inserted_at = match rows.next().await? {
            Some(row) => row.get::<i64>(0)? > 0,
            None => false,
        };
        if !has_inserted_at {
            info!("Adding inserted_at to case_outcomes");
            self.conn.execute_batch(ADD_INSERTED_AT).await.map_err(|e| {
                AsclepiusError::Database(format!("Schema migration failed: {}", e))
            })?;
        }
        self.conn
            .execute(
                "CREATE INDEX IF NOT EXISTS idx_case_outcomes_inserted ON case_outcomes(inserted_at)",
                params![],
            )
            .await
            .map_err(|e| AsclepiusError::Database(format!("Schema migration failed: {}", e)))?;

        debug!("libSQL schema is up to date");
        Ok(())
    }

    async fn query_sessions(&self, sql: &str, params: Vec<Value>) -> Result<Vec<TrainingSession>> {
        let mut rows = self.conn.query(sql, params).await?;
        let mut sessions = Vec::new();
        while let Some(row) = rows.next().await? {
            sessions.push(row_to_session(&row)?);
        }
        Ok(sessions)
    }
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| AsclepiusError::Database(format!("Invalid timestamp: {}", ms)))
}

fn text(s: impl Into<String>) -> Value {
    Value::Text(s.into())
}

fn opt_text(s: Option<impl Into<String>>) -> Value {
    s.map(text).unwrap_or(Value::Null)
}

fn opt_int(n: Option<i64>) -> Value {
    n.map(Value::Integer).unwrap_or(Value::Null)
}

fn opt_real(x: Option<f64>) -> Value {
    x.map(Value::Real).unwrap_or(Value::Null)
}

fn row_to_session(row: &libsql::Row) -> Result<TrainingSession> {
    let session_id: String = row.get(0)?;
    let start_time: i64 = row.get(1)?;
    let end_time: Option<i64> = row.get(2)?;
    let cases_processed: i64 = row.get(3)?;
    let cases_failed: i64 = row.get(4)?;
    let status: String = row.get(8)?;
    let case_origin: Option<String> = row.get(9)?;
    let approved: i64 = row.get(10)?;

    Ok(TrainingSession {
        session_id: SessionId(session_id),
        start_time: from_millis(start_time)?,
        end_time: end_time.map(from_millis).transpose()?,
        cases_processed: cases_processed.max(0) as u32,
        cases_failed: cases_failed.max(0) as u32,
        accuracy_before: row.get(5)?,
        accuracy_after: row.get(6)?,
        improvement_rate: row.get(7)?,
        status: SessionStatus::parse(&status)?,
        case_origin: case_origin.as_deref().map(CaseOrigin::parse).transpose()?,
        approved: approved != 0,
        error_message: row.get(11)?,
    })
}

fn row_to_case(row: &libsql::Row) -> Result<TriageCase> {
    let symptoms: String = row.get(1)?;
    let age: Option<i64> = row.get(2)?;
    let risk_factors: String = row.get(3)?;
    let urgency: Option<String> = row.get(4)?;
    let created_at: i64 = row.get(6)?;

    Ok(TriageCase {
        id: row.get(0)?,
        symptoms: serde_json::from_str(&symptoms)?,
        age: age.map(|a| a.max(0) as u32),
        risk_factors: serde_json::from_str(&risk_factors)?,
        urgency: urgency.as_deref().and_then(Urgency::parse),
        gold_label: row.get(5)?,
        created_at: from_millis(created_at)?,
    })
}

fn row_to_outcome(row: &libsql::Row) -> Result<CaseOutcomeRecord> {
    let recorded_at: i64 = row.get(5)?;
    Ok(CaseOutcomeRecord {
        case_id: row.get(0)?,
        predicted_label: row.get(1)?,
        actual_label: row.get(2)?,
        confidence: row.get(3)?,
        session_id: row.get(4)?,
        timestamp: from_millis(recorded_at)?,
    })
}

fn row_to_notification(row: &libsql::Row) -> Result<Notification> {
    let cases_processed: i64 = row.get(4)?;
    let created_at: i64 = row.get(6)?;
    Ok(Notification {
        id: row.get(0)?,
        session_id: row.get(1)?,
        title: row.get(2)?,
        message: row.get(3)?,
        cases_processed: cases_processed.max(0) as u32,
        improvement_rate: row.get(5)?,
        created_at: from_millis(created_at)?,
    })
}

#[async_trait]
impl LearningStore for LibsqlStore {
    async fn insert_case(&self, case: &TriageCase) -> Result<()> {
        let values = vec![
            text(case.id.as_str()),
            text(serde_json::to_string(&case.symptoms)?),
            opt_int(case.age.map(i64::from)),
            text(serde_json::to_string(&case.risk_factors)?),
            opt_text(case.urgency.map(|u| u.to_string())),
            opt_text(case.gold_label.as_deref()),
            Value::Integer(millis(case.created_at)),
        ];
        self.conn
            .execute(
                "INSERT OR REPLACE INTO triage_cases
                 (id, symptoms, age, risk_factors, urgency, gold_label, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                values,
            )
            .await
            .map_err(|e| AsclepiusError::Database(format!("Failed to store case: {}", e)))?;
        Ok(())
    }

    async fn read_recent_cases(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TriageCase>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, symptoms, age, risk_factors, urgency, gold_label, created_at
                 FROM triage_cases
                 WHERE gold_label IS NOT NULL AND created_at >= ?
                 ORDER BY RANDOM()
                 LIMIT ?",
                params![millis(since), limit as i64],
            )
            .await?;

        let mut cases = Vec::new();
        while let Some(row) = rows.next().await? {
            cases.push(row_to_case(&row)?);
        }
        debug!("Read {} labelled cases", cases.len());
        Ok(cases)
    }

    async fn append_outcome_record(&self, record: &CaseOutcomeRecord) -> Result<()> {
        let values = vec![
            text(record.case_id.as_str()),
            text(record.predicted_label.as_str()),
            text(record.actual_label.as_str()),
            Value::Real(record.confidence),
            opt_text(record.session_id.as_deref()),
            Value::Integer(millis(record.timestamp)),
            Value::Integer(millis(Utc::now())),
        ];
        self.conn
            .execute(
                "INSERT INTO case_outcomes
                 (case_id, predicted_label, actual_label, confidence, session_id, recorded_at, inserted_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                values,
            )
            .await
            .map_err(|e| AsclepiusError::Database(format!("Failed to append outcome: {}", e)))?;
        Ok(())
    }

    async fn count_outcomes_since(&self, since: DateTime<Utc>) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM case_outcomes WHERE session_id IS NULL AND inserted_at >= ?",
                params![millis(since)],
            )
            .await?;
        let count = match rows.next().await? {
            Some(row) => row.get::<i64>(0)?,
            None => 0,
        };
        Ok(count.max(0) as u64)
    }

    async fn read_outcomes_since(&self, since: DateTime<Utc>) -> Result<Vec<CaseOutcomeRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT case_id, predicted_label, actual_label, confidence, session_id, recorded_at
                 FROM case_outcomes
                 WHERE recorded_at >= ?
                 ORDER BY recorded_at ASC, id ASC",
                params![millis(since)],
            )
            .await?;

        let mut outcomes = Vec::new();
        while let Some(row) = rows.next().await? {
            outcomes.push(row_to_outcome(&row)?);
        }
        Ok(outcomes)
    }

    async fn count_session_outcomes(&self, session_id: &SessionId) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM case_outcomes WHERE session_id = ?",
                params![session_id.as_str()],
            )
            .await?;
        let count = match rows.next().await? {
            Some(row) => row.get::<i64>(0)?,
            None => 0,
        };
        Ok(count.max(0) as u64)
    }

    async fn insert_session(&self, session: &TrainingSession) -> Result<()> {
        let values = vec![
            text(session.session_id.as_str()),
            Value::Integer(millis(session.start_time)),
            opt_int(session.end_time.map(millis)),
            Value::Integer(i64::from(session.cases_processed)),
            Value::Integer(i64::from(session.cases_failed)),
            Value::Real(session.accuracy_before),
            Value::Real(session.accuracy_after),
            Value::Real(session.improvement_rate),
            text(session.status.to_string()),
            opt_text(session.case_origin.map(|o| o.to_string())),
            Value::Integer(i64::from(session.approved)),
            opt_text(session.error_message.as_deref()),
        ];
        self.conn
            .execute(
                &format!(
                    "INSERT INTO training_sessions ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    SESSION_COLUMNS
                ),
                values,
            )
            .await
            .map_err(|e| AsclepiusError::Database(format!("Failed to insert session: {}", e)))?;
        debug!("Inserted training session {}", session.session_id);
        Ok(())
    }

    async fn update_session(&self, session_id: &SessionId, update: &SessionUpdate) -> Result<()> {
        let values = vec![
            opt_text(update.status.map(|s| s.to_string())),
            opt_int(update.end_time.map(millis)),
            opt_int(update.cases_processed.map(i64::from)),
            opt_int(update.cases_failed.map(i64::from)),
            opt_real(update.accuracy_before),
            opt_real(update.accuracy_after),
            opt_real(update.improvement_rate),
            opt_text(update.case_origin.map(|o| o.to_string())),
            opt_int(update.approved.map(i64::from)),
            opt_text(update.error_message.as_deref()),
            text(session_id.as_str()),
        ];
        let changed = self
            .conn
            .execute(
                "UPDATE training_sessions SET
                    status = COALESCE(?, status),
                    end_time = COALESCE(?, end_time),
                    cases_processed = COALESCE(?, cases_processed),
                    cases_failed = COALESCE(?, cases_failed),
                    accuracy_before = COALESCE(?, accuracy_before),
                    accuracy_after = COALESCE(?, accuracy_after),
                    improvement_rate = COALESCE(?, improvement_rate),
                    case_origin = COALESCE(?, case_origin),
                    approved = COALESCE(?, approved),
                    error_message = COALESCE(?, error_message)
                 WHERE session_id = ?",
                values,
            )
            .await
            .map_err(|e| AsclepiusError::Database(format!("Failed to update session: {}", e)))?;

        if changed == 0 {
            return Err(AsclepiusError::Database(format!(
                "Session not found: {}",
                session_id
            )));
        }
        Ok(())
    }

    async fn read_session(&self, session_id: &SessionId) -> Result<Option<TrainingSession>> {
        let sql = format!(
            "SELECT {} FROM training_sessions WHERE session_id = ?",
            SESSION_COLUMNS
        );
        Ok(self
            .query_sessions(&sql, vec![text(session_id.as_str())])
            .await?
            .into_iter()
            .next())
    }

    async fn read_latest_completed_session(&self) -> Result<Option<TrainingSession>> {
        let sql = format!(
            "SELECT {} FROM training_sessions WHERE status = 'completed'
             ORDER BY start_time DESC, session_id DESC LIMIT 1",
            SESSION_COLUMNS
        );
        Ok(self.query_sessions(&sql, Vec::new()).await?.into_iter().next())
    }

    async fn list_sessions(&self, limit: usize) -> Result<Vec<TrainingSession>> {
        let sql = format!(
            "SELECT {} FROM training_sessions ORDER BY start_time DESC, session_id DESC LIMIT ?",
            SESSION_COLUMNS
        );
        self.query_sessions(&sql, vec![Value::Integer(limit as i64)])
            .await
    }

    async fn upsert_q_value(&self, entry: &QTableEntry) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO q_values (state_action_key, q_value, updated_at)
                 VALUES (?, ?, ?)",
                params![
                    entry.state_action_key.as_str(),
                    entry.q_value,
                    millis(Utc::now())
                ],
            )
            .await
            .map_err(|e| AsclepiusError::Database(format!("Failed to store Q-value: {}", e)))?;
        Ok(())
    }

    async fn read_all_q_values(&self) -> Result<Vec<QTableEntry>> {
        let mut rows = self
            .conn
            .query("SELECT state_action_key, q_value FROM q_values", params![])
            .await?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            entries.push(QTableEntry {
                state_action_key: row.get(0)?,
                q_value: row.get(1)?,
            });
        }
        Ok(entries)
    }

    async fn upsert_bandit_arm(&self, arm: &BanditArm) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO bandit_arms
                 (condition_treatment_key, successes, failures, updated_at)
                 VALUES (?, ?, ?, ?)",
                params![
                    arm.condition_treatment_key.as_str(),
                    i64::from(arm.successes),
                    i64::from(arm.failures),
                    millis(Utc::now())
                ],
            )
            .await
            .map_err(|e| AsclepiusError::Database(format!("Failed to store bandit arm: {}", e)))?;
        Ok(())
    }

    async fn read_all_bandit_arms(&self) -> Result<Vec<BanditArm>> {
        let mut rows = self
            .conn
            .query(
                "SELECT condition_treatment_key, successes, failures FROM bandit_arms",
                params![],
            )
            .await?;
        let mut arms = Vec::new();
        while let Some(row) = rows.next().await? {
            let successes: i64 = row.get(1)?;
            let failures: i64 = row.get(2)?;
            arms.push(BanditArm {
                condition_treatment_key: row.get(0)?,
                successes: successes.max(1) as u32,
                failures: failures.max(1) as u32,
            });
        }
        Ok(arms)
    }

    async fn purge_outcomes_older_than(&self, days: u32) -> Result<u64> {
        let cutoff = days_before(Utc::now(), i64::from(days))?;
        let removed = self
            .conn
            .execute(
                "DELETE FROM case_outcomes WHERE recorded_at < ?",
                params![millis(cutoff)],
            )
            .await
            .map_err(|e| AsclepiusError::Database(format!("Failed to purge outcomes: {}", e)))?;
        if removed > 0 {
            info!("Purged {} outcome records older than {} days", removed, days);
        }
        Ok(removed)
    }

    async fn insert_notification(&self, notification: &Notification) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO notifications
                 (id, session_id, title, message, cases_processed, improvement_rate, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                params![
                    notification.id.as_str(),
                    notification.session_id.as_str(),
                    notification.title.as_str(),
                    notification.message.as_str(),
                    i64::from(notification.cases_processed),
                    notification.improvement_rate,
                    millis(notification.created_at)
                ],
            )
            .await
            .map_err(|e| {
                AsclepiusError::Database(format!("Failed to store notification: {}", e))
            })?;
        Ok(())
    }

    async fn list_notifications(&self, limit: usize) -> Result<Vec<Notification>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, session_id, title, message, cases_processed, improvement_rate, created_at
                 FROM notifications ORDER BY created_at DESC LIMIT ?",
                params![limit as i64],
            )
            .await?;
        let mut notifications = Vec::new();
        while let Some(row) = rows.next().await? {
            notifications.push(row_to_notification(&row)?);
        }
        Ok(notifications)
    }
}
