//! Periodic training scheduler
//!
//! Wakes on a fixed interval, counts feedback outcomes recorded since the
//! last completed session and runs a training session once the count reaches
//! the threshold. After a triggered session it stores a notification and,
//! when enabled, approves sessions that improved accuracy. Every tick also
//! applies the outcome retention window.
//!
//! # Design
//!
//! - First check runs immediately on start, then once per interval
//! - At most one session in flight; overlapping triggers report `Busy`
//! - Each tick runs as its own task; errors and panics are logged and the
//!   loop keeps going
//! - Store calls are bounded by the pipeline's store timeout, so a stuck
//!   store cannot pin the session guard
//! - `stop()` lets an in-flight session finish, then ends the loop

use crate::config::SchedulerConfig;
use crate::error::{AsclepiusError, Result};
use crate::pipeline::TrainingPipeline;
use crate::storage::bounded;
use crate::types::{Notification, SessionUpdate, TrainingSession};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Whether the background loop is alive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Stopped,
    Running,
}

/// Result of one threshold check or manual trigger
#[derive(Debug, Clone)]
pub enum CheckOutcome {
    /// Not enough new feedback outcomes
    Skipped { outcomes: u64, threshold: u64 },
    /// A session ran to completion
    Triggered(TrainingSession),
    /// Another session is still in flight
    Busy,
}

/// Snapshot returned by [`TrainingScheduler::status`]
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub enabled: bool,
    pub interval_secs: u64,
    pub threshold: u64,
    pub auto_approve: bool,
    pub last_check_at: Option<DateTime<Utc>>,
    pub session_in_flight: bool,
    pub last_completed_session: Option<TrainingSession>,
}

struct LoopHandle {
    shutdown_tx: broadcast::Sender<()>,
    task_handle: JoinHandle<()>,
}

struct SchedulerCore {
    pipeline: Arc<TrainingPipeline>,
    config: SchedulerConfig,
    session_guard: tokio::sync::Mutex<()>,
    last_check_at: Mutex<Option<DateTime<Utc>>>,
}

pub struct TrainingScheduler {
    core: Arc<SchedulerCore>,
    handle: Mutex<Option<LoopHandle>>,
}

impl TrainingScheduler {
    pub fn new(pipeline: Arc<TrainingPipeline>, config: SchedulerConfig) -> Self {
        Self {
            core: Arc::new(SchedulerCore {
                pipeline,
                config,
                session_guard: tokio::sync::Mutex::new(()),
                last_check_at: Mutex::new(None),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the background loop; returns false if it was already running or is disabled
    pub fn start(&self) -> bool {
        if !self.core.config.enabled {
            warn!("Scheduler is disabled in configuration, not starting");
            return false;
        }

        let mut handle = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if handle.as_ref().is_some_and(|h| !h.task_handle.is_finished()) {
            debug!("Scheduler already running");
            return false;
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let core = Arc::clone(&self.core);
        let task_handle = tokio::spawn(core.run_loop(shutdown_rx));

        *handle = Some(LoopHandle {
            shutdown_tx,
            task_handle,
        });
        true
    }

    /// Stop the loop and wait for it to exit; a no-op when stopped
    pub async fn stop(&self) -> Result<()> {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let Some(handle) = handle {
            let _ = handle.shutdown_tx.send(());
            handle.task_handle.await.map_err(|e| {
                AsclepiusError::Other(format!("Failed to stop scheduler: {}", e))
            })?;
            info!("Scheduler stopped");
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|h| !h.task_handle.is_finished())
            .unwrap_or(false)
    }

    /// Run a session if enough feedback has accumulated
    pub async fn check_and_train(&self) -> Result<CheckOutcome> {
        self.core.check_and_train().await
    }

    /// Run a session regardless of the threshold
    pub async fn trigger_manual_training(&self) -> Result<CheckOutcome> {
        let Ok(_guard) = self.core.session_guard.try_lock() else {
            info!("Manual training requested while a session is in flight");
            return Ok(CheckOutcome::Busy);
        };
        info!("Manual training triggered");
        let session = self.core.run_session().await?;
        Ok(CheckOutcome::Triggered(session))
    }

    pub async fn status(&self) -> Result<SchedulerStatus> {
        let pipeline = &self.core.pipeline;
        let last_completed_session = bounded(
            pipeline.store_timeout(),
            "read latest completed session",
            pipeline.store().read_latest_completed_session(),
        )
        .await?;
        let config = &self.core.config;

        Ok(SchedulerStatus {
            state: if self.is_running() {
                SchedulerState::Running
            } else {
                SchedulerState::Stopped
            },
            enabled: config.enabled,
            interval_secs: config.interval.as_secs(),
            threshold: config.threshold,
            auto_approve: config.auto_approve,
            last_check_at: *self
                .core
                .last_check_at
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
            session_in_flight: self.core.session_guard.try_lock().is_err(),
            last_completed_session,
        })
    }
}

impl SchedulerCore {
    async fn run_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut timer = interval(self.config.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Starting training scheduler: interval {}s, threshold {}",
            self.config.interval.as_secs(),
            self.config.threshold
        );

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let core = Arc::clone(&self);
                    if let Err(e) = tokio::spawn(async move { core.tick().await }).await {
                        error!("Scheduler tick aborted: {}", e);
                    }
                }

                _ = shutdown_rx.recv() => {
                    info!("Scheduler received shutdown signal");
                    break;
                }
            }
        }
    }

    async fn tick(&self) {
        match self.check_and_train().await {
            Ok(CheckOutcome::Skipped {
                outcomes,
                threshold,
            }) => {
                debug!("{} new outcomes, threshold {}: skipping", outcomes, threshold);
            }
            Ok(CheckOutcome::Triggered(session)) => {
                info!(
                    "Scheduled session {} finished with improvement {:+.4}",
                    session.session_id, session.improvement_rate
                );
            }
            Ok(CheckOutcome::Busy) => {
                info!("Previous training session still running, skipping this tick");
            }
            Err(e) => {
                error!("Scheduler check failed: {}", e);
            }
        }

        if let Err(e) = self.pipeline.purge_expired_outcomes().await {
            warn!("Outcome retention purge failed: {}", e);
        }
    }

    async fn check_and_train(&self) -> Result<CheckOutcome> {
        let Ok(_guard) = self.session_guard.try_lock() else {
            return Ok(CheckOutcome::Busy);
        };

        *self.last_check_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());

        let store = self.pipeline.store();
        let limit = self.pipeline.store_timeout();
        let since = bounded(
            limit,
            "read latest completed session",
            store.read_latest_completed_session(),
        )
        .await?
        .map(|s| s.start_time)
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let outcomes = bounded(limit, "count outcomes", store.count_outcomes_since(since)).await?;

        if outcomes < self.config.threshold {
            return Ok(CheckOutcome::Skipped {
                outcomes,
                threshold: self.config.threshold,
            });
        }

        info!(
            "{} new outcomes reached threshold {}, starting training",
            outcomes, self.config.threshold
        );
        let session = self.run_session().await?;
        Ok(CheckOutcome::Triggered(session))
    }

    /// Caller holds `session_guard`
    async fn run_session(&self) -> Result<TrainingSession> {
        let mut session = self.pipeline.run_training_session().await?;
        let store = self.pipeline.store();
        let limit = self.pipeline.store_timeout();

        let notification = Notification::for_session(&session);
        if let Err(e) = bounded(
            limit,
            "insert notification",
            store.insert_notification(&notification),
        )
        .await
        {
            warn!(
                "Failed to store notification for session {}: {}",
                session.session_id, e
            );
        }

        if self.config.auto_approve && session.improvement_rate > 0.0 {
            let approval = SessionUpdate::approval();
            match bounded(
                limit,
                "approve session",
                store.update_session(&session.session_id, &approval),
            )
            .await
            {
                Ok(()) => {
                    session.approved = true;
                    info!("Auto-approved session {}", session.session_id);
                }
                Err(e) => warn!("Failed to approve session {}: {}", session.session_id, e),
            }
        }

        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CaseSourceMode, LearningConfig};
    use crate::services::InferenceService;
    use crate::storage::{InMemoryStore, LearningStore, StallingStore};
    use crate::types::{CaseOutcomeRecord, Prediction, SessionStatus, TriageCase};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Always predicts the confirmed diagnosis after an optional delay
    struct GoldInference {
        delay: Duration,
    }

    #[async_trait]
    impl InferenceService for GoldInference {
        async fn infer(&self, case: &TriageCase) -> Result<Prediction> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(Prediction {
                predicted_label: case.gold_label.clone().unwrap_or_default(),
                confidence: 0.9,
            })
        }
    }

    fn scheduler_with(
        store: Arc<dyn LearningStore>,
        delay: Duration,
        auto_approve: bool,
    ) -> TrainingScheduler {
        let mut config = LearningConfig::default();
        config.pipeline.case_source = CaseSourceMode::SyntheticOnly;
        config.pipeline.batch_size = 5;
        config.scheduler.auto_approve = auto_approve;
        config.scheduler.interval = Duration::from_secs(3600);

        let pipeline = Arc::new(TrainingPipeline::from_config(
            store,
            Arc::new(GoldInference { delay }),
            &config,
        ));
        TrainingScheduler::new(pipeline, config.scheduler)
    }

    async fn add_feedback(store: &dyn LearningStore, n: usize) {
        for i in 0..n {
            store
                .append_outcome_record(&CaseOutcomeRecord {
                    case_id: format!("fb-{}", i),
                    predicted_label: "influenza".to_string(),
                    actual_label: "common_cold".to_string(),
                    confidence: 0.7,
                    session_id: None,
                    timestamp: Utc::now(),
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_threshold_boundary() {
        let store: Arc<dyn LearningStore> = Arc::new(InMemoryStore::new());
        let scheduler = scheduler_with(store.clone(), Duration::ZERO, false);

        add_feedback(store.as_ref(), 49).await;
        match scheduler.check_and_train().await.unwrap() {
            CheckOutcome::Skipped { outcomes, threshold } => {
                assert_eq!(outcomes, 49);
                assert_eq!(threshold, 50);
            }
            other => panic!("expected skip, got {:?}", other),
        }
        assert!(store.list_sessions(10).await.unwrap().is_empty());

        add_feedback(store.as_ref(), 1).await;
        let session = match scheduler.check_and_train().await.unwrap() {
            CheckOutcome::Triggered(session) => session,
            other => panic!("expected a session, got {:?}", other),
        };
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.cases_processed, 5);
        assert_eq!(store.list_notifications(10).await.unwrap().len(), 1);

        // Feedback counted from the new session's start, so nothing is pending
        assert!(matches!(
            scheduler.check_and_train().await.unwrap(),
            CheckOutcome::Skipped { outcomes: 0, .. }
        ));
    }

    #[tokio::test]
    async fn test_manual_trigger_bypasses_threshold() {
        let store: Arc<dyn LearningStore> = Arc::new(InMemoryStore::new());
        let scheduler = scheduler_with(store.clone(), Duration::ZERO, false);

        let outcome = scheduler.trigger_manual_training().await.unwrap();
        let CheckOutcome::Triggered(session) = outcome else {
            panic!("manual trigger did not run a session");
        };
        assert!(!session.approved);

        let status = scheduler.status().await.unwrap();
        assert_eq!(
            status.last_completed_session.map(|s| s.session_id),
            Some(session.session_id)
        );
        assert!(!status.session_in_flight);
    }

    #[tokio::test]
    async fn test_auto_approve_improving_session() {
        let store: Arc<dyn LearningStore> = Arc::new(InMemoryStore::new());
        let scheduler = scheduler_with(store.clone(), Duration::ZERO, true);

        let CheckOutcome::Triggered(session) = scheduler.trigger_manual_training().await.unwrap()
        else {
            panic!("manual trigger did not run a session");
        };
        // Prior 0.5, then every synthetic case answered correctly
        assert!(session.improvement_rate > 0.0);
        assert!(session.approved);

        let stored = store.read_session(&session.session_id).await.unwrap().unwrap();
        assert!(stored.approved);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_trigger_is_busy() {
        let store: Arc<dyn LearningStore> = Arc::new(InMemoryStore::new());
        let scheduler = Arc::new(scheduler_with(store, Duration::from_secs(10), false));

        let background = Arc::clone(&scheduler);
        let first = tokio::spawn(async move { background.trigger_manual_training().await });
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(scheduler.status().await.unwrap().session_in_flight);
        assert!(matches!(
            scheduler.check_and_train().await.unwrap(),
            CheckOutcome::Busy
        ));
        assert!(matches!(
            scheduler.trigger_manual_training().await.unwrap(),
            CheckOutcome::Busy
        ));

        let finished = first.await.unwrap().unwrap();
        assert!(matches!(finished, CheckOutcome::Triggered(_)));
    }

    #[tokio::test]
    async fn test_start_stop_restart() {
        let store: Arc<dyn LearningStore> = Arc::new(InMemoryStore::new());
        let scheduler = scheduler_with(store, Duration::ZERO, false);

        assert!(scheduler.start());
        assert!(!scheduler.start());
        assert!(scheduler.is_running());

        // First tick runs immediately
        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = scheduler.status().await.unwrap();
        assert_eq!(status.state, SchedulerState::Running);
        assert!(status.last_check_at.is_some());

        scheduler.stop().await.unwrap();
        assert!(!scheduler.is_running());
        assert_eq!(
            scheduler.status().await.unwrap().state,
            SchedulerState::Stopped
        );

        assert!(scheduler.start());
        scheduler.stop().await.unwrap();
        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_scheduler_does_not_start() {
        let mut config = LearningConfig::default();
        config.scheduler.enabled = false;
        let pipeline = Arc::new(TrainingPipeline::from_config(
            Arc::new(InMemoryStore::new()),
            Arc::new(GoldInference {
                delay: Duration::ZERO,
            }),
            &config,
        ));
        let scheduler = TrainingScheduler::new(pipeline, config.scheduler);
        assert!(!scheduler.start());
        assert!(!scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_store_releases_session_guard() {
        let store = Arc::new(StallingStore::new());
        store.stall("read_outcomes_since");
        let scheduler = scheduler_with(store.clone(), Duration::ZERO, false);

        let err = scheduler.trigger_manual_training().await.unwrap_err();
        assert!(matches!(err, AsclepiusError::SessionFailure { .. }));
        assert!(!scheduler.status().await.unwrap().session_in_flight);

        let sessions = store.list_sessions(10).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].status, SessionStatus::Failed);

        // The next check runs instead of reporting Busy
        assert!(matches!(
            scheduler.check_and_train().await.unwrap(),
            CheckOutcome::Skipped { .. }
        ));

        store.stall("count_outcomes_since");
        let err = scheduler.check_and_train().await.unwrap_err();
        assert!(matches!(err, AsclepiusError::Timeout { .. }));
        assert!(!scheduler.status().await.unwrap().session_in_flight);

        store.resume("count_outcomes_since");
        store.resume("read_outcomes_since");
        assert!(matches!(
            scheduler.trigger_manual_training().await.unwrap(),
            CheckOutcome::Triggered(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_tick_does_not_kill_loop() {
        struct CrashingInference {
            calls: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl InferenceService for CrashingInference {
            async fn infer(&self, _case: &TriageCase) -> Result<Prediction> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                panic!("model runtime crashed");
            }
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let mut config = LearningConfig::default();
        config.pipeline.case_source = CaseSourceMode::SyntheticOnly;
        config.pipeline.batch_size = 1;
        config.scheduler.threshold = 0;
        config.scheduler.interval = Duration::from_secs(60);

        let store: Arc<dyn LearningStore> = Arc::new(InMemoryStore::new());
        let pipeline = Arc::new(TrainingPipeline::from_config(
            store.clone(),
            Arc::new(CrashingInference {
                calls: calls.clone(),
            }),
            &config,
        ));
        let scheduler = TrainingScheduler::new(pipeline, config.scheduler);

        assert!(scheduler.start());
        tokio::time::sleep(Duration::from_secs(150)).await;

        // Ticks at 0s, 60s and 120s each crashed inside the session
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(scheduler.is_running());
        assert!(!scheduler.status().await.unwrap().session_in_flight);

        scheduler.stop().await.unwrap();
        assert!(!scheduler.is_running());
    }
}
