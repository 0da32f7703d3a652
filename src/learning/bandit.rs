//! Thompson Sampling over treatments per condition.
//!
//! Each `(condition, treatment)` arm keeps a Beta(successes, failures)
//! posterior starting from the Laplace prior 1/1. Arms are created lazily on
//! first use and written through to the store on every outcome. Arms whose
//! write fails stay pending until [`TreatmentBandit::sync_to_store`].

use crate::config::BanditConfig;
use crate::error::{AsclepiusError, Result};
use crate::learning::keyed_lock::KeyedLocks;
use crate::storage::LearningStore;
use crate::types::BanditArm;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

const KEY_SEPARATOR: &str = "::";

/// z-score for a 95% interval
const Z_95: f64 = 1.96;

pub fn arm_key(condition: &str, treatment: &str) -> String {
    format!("{}{}{}", condition, KEY_SEPARATOR, treatment)
}

fn fresh_arm(key: String) -> BanditArm {
    BanditArm {
        condition_treatment_key: key,
        successes: 1,
        failures: 1,
    }
}

/// Summary statistics for one arm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmStats {
    pub condition: String,
    pub treatment: String,
    pub successes: u32,
    pub failures: u32,
    pub success_rate: f64,
    pub standard_error: f64,
    /// `clamp(1 - 1.96 * standard_error, 0, 1)`
    pub confidence: f64,
}

impl ArmStats {
    fn from_arm(condition: &str, treatment: &str, arm: &BanditArm) -> Self {
        let n = f64::from(arm.successes) + f64::from(arm.failures);
        let p = f64::from(arm.successes) / n;
        let standard_error = (p * (1.0 - p) / n).sqrt();
        Self {
            condition: condition.to_string(),
            treatment: treatment.to_string(),
            successes: arm.successes,
            failures: arm.failures,
            success_rate: p,
            standard_error,
            confidence: (1.0 - Z_95 * standard_error).clamp(0.0, 1.0),
        }
    }
}

pub struct TreatmentBandit {
    store: Arc<dyn LearningStore>,
    arms: RwLock<HashMap<String, BanditArm>>,
    unsynced: Mutex<HashSet<String>>,
    rng: Mutex<StdRng>,
    locks: KeyedLocks,
}

impl TreatmentBandit {
    pub fn new(store: Arc<dyn LearningStore>, config: &BanditConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            store,
            arms: RwLock::new(HashMap::new()),
            unsynced: Mutex::new(HashSet::new()),
            rng: Mutex::new(rng),
            locks: KeyedLocks::new(),
        }
    }

    /// Replace the in-memory arms with the stored ones
    pub async fn load_arms(&self) -> Result<usize> {
        let arms: HashMap<String, BanditArm> = self
            .store
            .read_all_bandit_arms()
            .await?
            .into_iter()
            .map(|arm| (arm.condition_treatment_key.clone(), arm))
            .collect();
        let count = arms.len();
        *self.arms.write().unwrap_or_else(|e| e.into_inner()) = arms;
        self.unsynced.lock().unwrap_or_else(|e| e.into_inner()).clear();
        info!("Loaded {} bandit arms", count);
        Ok(count)
    }

    /// Sample every candidate's posterior and return the best draw
    pub fn select_treatment(
        &self,
        condition: &str,
        candidates: &[String],
    ) -> Result<Option<String>> {
        if candidates.is_empty() {
            return Ok(None);
        }

        let arms = self.arms.read().unwrap_or_else(|e| e.into_inner());
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());

        let mut best: Option<(&String, f64)> = None;
        for treatment in candidates {
            let (alpha, beta) = arms
                .get(&arm_key(condition, treatment))
                .map_or((1.0, 1.0), |arm| {
                    (f64::from(arm.successes), f64::from(arm.failures))
                });
            let posterior = Beta::new(alpha, beta).map_err(|e| {
                AsclepiusError::Other(format!("Invalid Beta({}, {}): {}", alpha, beta, e))
            })?;
            let draw = posterior.sample(&mut *rng);
            if best.map_or(true, |(_, top)| draw > top) {
                best = Some((treatment, draw));
            }
        }

        Ok(best.map(|(treatment, _)| treatment.clone()))
    }

    /// Count one success or failure, returning the updated arm
    pub async fn record_outcome(
        &self,
        condition: &str,
        treatment: &str,
        success: bool,
    ) -> BanditArm {
        let key = arm_key(condition, treatment);
        let _guard = self.locks.lock(&key).await;

        let arm = {
            let mut arms = self.arms.write().unwrap_or_else(|e| e.into_inner());
            let arm = arms
                .entry(key.clone())
                .or_insert_with(|| fresh_arm(key.clone()));
            if success {
                arm.successes = arm.successes.saturating_add(1);
            } else {
                arm.failures = arm.failures.saturating_add(1);
            }
            arm.clone()
        };

        debug!(
            "Arm {} now {}/{}",
            key, arm.successes, arm.failures
        );

        let persisted = self.store.upsert_bandit_arm(&arm).await;
        let mut unsynced = self.unsynced.lock().unwrap_or_else(|e| e.into_inner());
        match persisted {
            Ok(()) => {
                unsynced.remove(&key);
            }
            Err(e) => {
                warn!("Failed to persist bandit arm {}: {}", key, e);
                unsynced.insert(key);
            }
        }
        arm
    }

    /// Replay every arm whose write-through failed, returning how many landed
    pub async fn sync_to_store(&self) -> Result<usize> {
        let pending: Vec<String> = self
            .unsynced
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect();

        let mut written = 0;
        for key in pending {
            let _guard = self.locks.lock(&key).await;
            let arm = self
                .arms
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .get(&key)
                .cloned();
            if let Some(arm) = arm {
                self.store.upsert_bandit_arm(&arm).await?;
                written += 1;
            }
            self.unsynced
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&key);
        }
        if written > 0 {
            info!("Replayed {} bandit arms to the store", written);
        }
        Ok(written)
    }

    /// Number of arms waiting for [`Self::sync_to_store`]
    pub fn pending_sync(&self) -> usize {
        self.unsynced.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Statistics for one arm; unseen arms report the prior
    pub fn arm_stats(&self, condition: &str, treatment: &str) -> ArmStats {
        let key = arm_key(condition, treatment);
        let arms = self.arms.read().unwrap_or_else(|e| e.into_inner());
        match arms.get(&key) {
            Some(arm) => ArmStats::from_arm(condition, treatment, arm),
            None => ArmStats::from_arm(condition, treatment, &fresh_arm(key)),
        }
    }

    /// Statistics for every known arm, ordered by condition then treatment
    pub fn all_arm_stats(&self) -> Vec<ArmStats> {
        let arms = self.arms.read().unwrap_or_else(|e| e.into_inner());
        let mut stats: Vec<ArmStats> = arms
            .values()
            .map(|arm| {
                let (condition, treatment) = arm
                    .condition_treatment_key
                    .split_once(KEY_SEPARATOR)
                    .unwrap_or((arm.condition_treatment_key.as_str(), ""));
                ArmStats::from_arm(condition, treatment, arm)
            })
            .collect();
        stats.sort_by(|a, b| {
            a.condition
                .cmp(&b.condition)
                .then_with(|| a.treatment.cmp(&b.treatment))
        });
        stats
    }

    pub fn len(&self) -> usize {
        self.arms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
