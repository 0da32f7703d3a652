//! Tabular Q-learning over (patient state, diagnosis) pairs.
//!
//! States are discretized into a canonical string and hashed together with
//! the action into a fixed-width key:
//!
//! - symptoms: trimmed, lowercased, sorted
//! - age: floored to the decade (`None` reads as `unknown`)
//! - risk factors: trimmed, sorted
//!
//! Updates follow `Q <- Q + alpha * (r + gamma * max Q(s', .) - Q)` and are
//! written through to the store. The in-memory table is authoritative: a
//! failed write is logged, the key is remembered, and
//! [`QLearningAgent::sync_to_store`] replays it later.

use crate::config::QLearningConfig;
use crate::error::{AsclepiusError, Result};
use crate::learning::catalogue::ActionCatalogueProvider;
use crate::learning::keyed_lock::KeyedLocks;
use crate::storage::LearningStore;
use crate::types::{PatientState, QTableEntry};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Hex characters kept from the SHA-256 digest
const KEY_LENGTH: usize = 16;

/// Canonical string form of a patient state
pub fn discretize_state(state: &PatientState) -> String {
    let mut symptoms: Vec<String> = state
        .symptoms
        .iter()
        .map(|s| s.trim().to_lowercase())
        .collect();
    symptoms.sort();

    let mut risk_factors: Vec<&str> = state.risk_factors.iter().map(|r| r.trim()).collect();
    risk_factors.sort_unstable();

    let age = state
        .age
        .map_or_else(|| "unknown".to_string(), |a| (a / 10 * 10).to_string());

    format!(
        "symptoms={}|age={}|risk={}",
        symptoms.join(","),
        age,
        risk_factors.join(",")
    )
}

/// Deterministic Q-table key for a state and action
pub fn state_action_key(state: &PatientState, action: &str) -> String {
    let canonical = format!("{}#{}", discretize_state(state), action);
    let digest = format!("{:x}", Sha256::digest(canonical.as_bytes()));
    digest[..KEY_LENGTH].to_string()
}

pub struct QLearningAgent {
    store: Arc<dyn LearningStore>,
    catalogue: Arc<dyn ActionCatalogueProvider>,
    learning_rate: f64,
    discount_factor: f64,
    exploration_rate: f64,
    q_table: RwLock<HashMap<String, f64>>,
    /// Keys whose latest value never reached the store
    unsynced: Mutex<HashSet<String>>,
    rng: Mutex<StdRng>,
    locks: KeyedLocks,
}

impl QLearningAgent {
    pub fn new(
        store: Arc<dyn LearningStore>,
        catalogue: Arc<dyn ActionCatalogueProvider>,
        config: &QLearningConfig,
    ) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            store,
            catalogue,
            learning_rate: config.learning_rate,
            discount_factor: config.discount_factor,
            exploration_rate: config.exploration_rate,
            q_table: RwLock::new(HashMap::new()),
            unsynced: Mutex::new(HashSet::new()),
            rng: Mutex::new(rng),
            locks: KeyedLocks::new(),
        }
    }

    /// Replace the in-memory table with the stored one
    pub async fn load_q_table(&self) -> Result<usize> {
        let entries = self.store.read_all_q_values().await?;
        let table: HashMap<String, f64> = entries
            .into_iter()
            .map(|e| (e.state_action_key, e.q_value))
            .collect();
        let count = table.len();
        *self.q_table.write().unwrap_or_else(|e| e.into_inner()) = table;
        self.unsynced.lock().unwrap_or_else(|e| e.into_inner()).clear();
        info!("Loaded {} Q-table entries", count);
        Ok(count)
    }

    /// Q-value for a state and action, 0 when never updated
    pub fn get_q_value(&self, state: &PatientState, action: &str) -> f64 {
        self.q_table
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&state_action_key(state, action))
            .copied()
            .unwrap_or(0.0)
    }

    /// One temporal-difference update, returning the new Q-value
    pub async fn learn(
        &self,
        state: &PatientState,
        action: &str,
        reward: f64,
        next_state: &PatientState,
    ) -> Result<f64> {
        if !reward.is_finite() {
            return Err(AsclepiusError::InvalidOperation(format!(
                "Reward must be finite, got {}",
                reward
            )));
        }

        let key = state_action_key(state, action);
        let _guard = self.locks.lock(&key).await;

        let max_next = self.max_evaluated_q(next_state);
        let updated = {
            let mut table = self.q_table.write().unwrap_or_else(|e| e.into_inner());
            let current = table.get(&key).copied().unwrap_or(0.0);
            let updated = current
                + self.learning_rate * (reward + self.discount_factor * max_next - current);
            table.insert(key.clone(), updated);
            updated
        };

        debug!("Q[{}] ({}) -> {:.4}", key, action, updated);

        let entry = QTableEntry {
            state_action_key: key,
            q_value: updated,
        };
        let persisted = self.store.upsert_q_value(&entry).await;
        let mut unsynced = self.unsynced.lock().unwrap_or_else(|e| e.into_inner());
        match persisted {
            Ok(()) => {
                unsynced.remove(&entry.state_action_key);
            }
            Err(e) => {
                warn!(
                    "Failed to persist Q-value {}: {}. In-memory value kept",
                    entry.state_action_key, e
                );
                unsynced.insert(entry.state_action_key);
            }
        }

        Ok(updated)
    }

    /// Whether `action` belongs to the catalogue
    pub fn knows_action(&self, action: &str) -> bool {
        self.catalogue.actions().iter().any(|a| a == action)
    }

    /// Epsilon-greedy action choice, `None` for an empty catalogue
    pub fn select_action(&self, state: &PatientState) -> Option<String> {
        let actions = self.catalogue.actions();
        if actions.is_empty() {
            return None;
        }

        {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            if rng.gen::<f64>() < self.exploration_rate {
                return actions.choose(&mut *rng).cloned();
            }
        }

        self.rank_actions(state)
            .into_iter()
            .next()
            .map(|(action, _)| action)
    }

    /// Catalogue ordered by Q-value, ties kept in catalogue order
    pub fn rank_actions(&self, state: &PatientState) -> Vec<(String, f64)> {
        let table = self.q_table.read().unwrap_or_else(|e| e.into_inner());
        let mut ranked: Vec<(String, f64)> = self
            .catalogue
            .actions()
            .into_iter()
            .map(|action| {
                let q = table
                    .get(&state_action_key(state, &action))
                    .copied()
                    .unwrap_or(0.0);
                (action, q)
            })
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked
    }

    /// Replay every entry whose write-through failed, returning how many landed
    ///
    /// Keys that fail again stay pending and the first error is returned.
    pub async fn sync_to_store(&self) -> Result<usize> {
        let pending: Vec<QTableEntry> = {
            let unsynced = self.unsynced.lock().unwrap_or_else(|e| e.into_inner());
            let table = self.q_table.read().unwrap_or_else(|e| e.into_inner());
            unsynced
                .iter()
                .filter_map(|key| {
                    table.get(key).map(|value| QTableEntry {
                        state_action_key: key.clone(),
                        q_value: *value,
                    })
                })
                .collect()
        };

        let mut written = 0;
        for entry in &pending {
            let _guard = self.locks.lock(&entry.state_action_key).await;
            // A concurrent update may have landed a newer value
            let current = self
                .q_table
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .get(&entry.state_action_key)
                .copied()
                .unwrap_or(entry.q_value);
            self.store
                .upsert_q_value(&QTableEntry {
                    state_action_key: entry.state_action_key.clone(),
                    q_value: current,
                })
                .await?;
            self.unsynced
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&entry.state_action_key);
            written += 1;
        }
        if written > 0 {
            info!("Replayed {} Q-values to the store", written);
        }
        Ok(written)
    }

    /// Number of entries waiting for [`Self::sync_to_store`]
    pub fn pending_sync(&self) -> usize {
        self.unsynced.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn len(&self) -> usize {
        self.q_table.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Max Q over catalogue actions already evaluated for `state`, 0 if none
    fn max_evaluated_q(&self, state: &PatientState) -> f64 {
        let table = self.q_table.read().unwrap_or_else(|e| e.into_inner());
        self.catalogue
            .actions()
            .iter()
            .filter_map(|action| table.get(&state_action_key(state, action)).copied())
            .fold(None, |best: Option<f64>, q| {
                Some(best.map_or(q, |b| b.max(q)))
            })
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning::catalogue::StaticCatalogue;
    use crate::storage::{InMemoryStore, MockLearningStore};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn state(symptoms: &[&str], age: Option<u32>) -> PatientState {
        PatientState {
            symptoms: symptoms.iter().map(|s| s.to_string()).collect(),
            age,
            risk_factors: vec![],
        }
    }

    fn agent(store: Arc<dyn LearningStore>, exploration_rate: f64) -> QLearningAgent {
        let config = QLearningConfig {
            exploration_rate,
            seed: Some(7),
            ..Default::default()
        };
        QLearningAgent::new(
            store,
            Arc::new(StaticCatalogue::new(["influenza", "common_cold", "covid19"])),
            &config,
        )
    }

    #[test]
    fn test_discretization_is_canonical() {
        let a = state(&["Fever", "cough"], Some(34));
        let b = state(&["cough", "fever "], Some(39));
        assert_eq!(discretize_state(&a), discretize_state(&b));
        assert_eq!(state_action_key(&a, "influenza"), state_action_key(&b, "influenza"));
        assert_eq!(state_action_key(&a, "influenza").len(), KEY_LENGTH);

        let older = state(&["fever", "cough"], Some(40));
        assert_ne!(discretize_state(&a), discretize_state(&older));
        assert_ne!(state_action_key(&a, "influenza"), state_action_key(&a, "covid19"));
    }

    #[tokio::test]
    async fn test_single_update_from_zero() {
        let store = Arc::new(InMemoryStore::new());
        let agent = agent(store.clone(), 0.0);
        let s = state(&["fever"], Some(30));
        let next = state(&["rash"], Some(30));

        let q = agent.learn(&s, "influenza", 1.0, &next).await.unwrap();
        assert!((q - 0.1).abs() < 1e-12);
        assert!((agent.get_q_value(&s, "influenza") - 0.1).abs() < 1e-12);
        assert_eq!(store.read_all_q_values().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_bootstraps_from_next_state() {
        let agent = agent(Arc::new(InMemoryStore::new()), 0.0);
        let s = state(&["fever"], Some(30));
        let next = state(&["rash"], Some(30));

        agent.learn(&next, "covid19", 1.0, &next).await.unwrap();
        let q = agent.learn(&s, "influenza", 0.0, &next).await.unwrap();
        // 0.1 * (0 + 0.9 * 0.1)
        assert!((q - 0.009).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_non_finite_reward_is_rejected() {
        let agent = agent(Arc::new(InMemoryStore::new()), 0.0);
        let s = state(&["fever"], None);
        assert!(agent.learn(&s, "influenza", f64::NAN, &s).await.is_err());
        assert!(agent.is_empty());
    }

    #[tokio::test]
    async fn test_greedy_selection_and_tie_break() {
        let agent = agent(Arc::new(InMemoryStore::new()), 0.0);
        let s = state(&["headache"], Some(50));

        assert_eq!(agent.select_action(&s).as_deref(), Some("influenza"));

        agent.learn(&s, "covid19", 1.0, &s).await.unwrap();
        assert_eq!(agent.select_action(&s).as_deref(), Some("covid19"));

        let ranked = agent.rank_actions(&s);
        assert_eq!(ranked[0].0, "covid19");
        assert_eq!(ranked[1].0, "influenza");
        assert_eq!(ranked[2].0, "common_cold");
    }

    #[tokio::test]
    async fn test_full_exploration_stays_in_catalogue() {
        let agent = agent(Arc::new(InMemoryStore::new()), 1.0);
        let s = state(&["cough"], Some(20));
        for _ in 0..50 {
            let action = agent.select_action(&s).unwrap();
            assert!(["influenza", "common_cold", "covid19"].contains(&action.as_str()));
        }
    }

    #[tokio::test]
    async fn test_load_is_idempotent() {
        let store: Arc<dyn LearningStore> = Arc::new(InMemoryStore::new());
        let writer = agent(store.clone(), 0.0);
        let s = state(&["fever"], Some(60));
        writer.learn(&s, "influenza", 1.0, &s).await.unwrap();
        writer.learn(&s, "covid19", -1.0, &s).await.unwrap();

        let reader = agent(store, 0.0);
        assert_eq!(reader.load_q_table().await.unwrap(), 2);
        assert_eq!(reader.load_q_table().await.unwrap(), 2);
        assert_eq!(reader.len(), 2);
        assert_eq!(
            reader.get_q_value(&s, "influenza"),
            writer.get_q_value(&s, "influenza")
        );
    }

    #[test]
    fn test_empty_catalogue_selects_nothing() {
        let agent = QLearningAgent::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(StaticCatalogue::new(Vec::<String>::new())),
            &QLearningConfig::default(),
        );
        assert!(agent.select_action(&PatientState::default()).is_none());
    }

    #[tokio::test]
    async fn test_failed_write_is_kept_and_replayed() {
        let healthy = Arc::new(AtomicBool::new(false));
        let written = Arc::new(Mutex::new(Vec::new()));

        let mut store = MockLearningStore::new();
        let (flag, rows) = (healthy.clone(), written.clone());
        store.expect_upsert_q_value().returning(move |entry| {
            if flag.load(Ordering::SeqCst) {
                rows.lock().unwrap().push(entry.clone());
                Ok(())
            } else {
                Err(AsclepiusError::Database("database is locked".to_string()))
            }
        });

        let agent = agent(Arc::new(store), 0.0);
        let s = state(&["fever"], Some(30));

        let q = agent.learn(&s, "influenza", 1.0, &s).await.unwrap();
        assert!((q - 0.1).abs() < 1e-12);
        assert_eq!(agent.get_q_value(&s, "influenza"), q);
        assert_eq!(agent.pending_sync(), 1);

        // Still down: the key stays pending
        assert!(agent.sync_to_store().await.is_err());
        assert_eq!(agent.pending_sync(), 1);

        healthy.store(true, Ordering::SeqCst);
        assert_eq!(agent.sync_to_store().await.unwrap(), 1);
        assert_eq!(agent.pending_sync(), 0);
        assert_eq!(agent.sync_to_store().await.unwrap(), 0);

        let rows = written.lock().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state_action_key, state_action_key(&s, "influenza"));
        assert_eq!(rows[0].q_value, q);
    }

    #[tokio::test]
    async fn test_successful_write_clears_pending_key() {
        let fail_next = Arc::new(AtomicBool::new(true));
        let mut store = MockLearningStore::new();
        let flag = fail_next.clone();
        store.expect_upsert_q_value().returning(move |_| {
            if flag.swap(false, Ordering::SeqCst) {
                Err(AsclepiusError::Database("disk I/O error".to_string()))
            } else {
                Ok(())
            }
        });

        let agent = agent(Arc::new(store), 0.0);
        let s = state(&["cough"], Some(20));
        agent.learn(&s, "common_cold", 1.0, &s).await.unwrap();
        assert_eq!(agent.pending_sync(), 1);

        agent.learn(&s, "common_cold", 1.0, &s).await.unwrap();
        assert_eq!(agent.pending_sync(), 0);
    }

    #[test]
    fn test_knows_only_catalogue_actions() {
        let agent = agent(Arc::new(InMemoryStore::new()), 0.0);
        assert!(agent.knows_action("covid19"));
        assert!(!agent.knows_action("Covid19"));
        assert!(!agent.knows_action("appendicitis"));
    }
}
