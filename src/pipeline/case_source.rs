//! Where training batches come from.
//!
//! A batch is drawn from exactly one source and tagged with its
//! [`CaseOrigin`]; stored and synthetic cases are never mixed.

use crate::config::{CaseSourceMode, PipelineConfig};
use crate::error::Result;
use crate::services::inference::DIAGNOSIS_PROFILES;
use crate::storage::{bounded, days_before, LearningStore};
use crate::types::{CaseOrigin, TriageCase};
use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

const RISK_FACTORS: &[&str] = &[
    "smoker",
    "diabetes",
    "obesity",
    "asthma_history",
    "immunocompromised",
];

/// Probability that a synthetic case picks up a symptom from another profile
const NOISE_PROBABILITY: f64 = 0.2;

/// Probability that each risk factor is present on a synthetic case
const RISK_FACTOR_PROBABILITY: f64 = 0.15;

/// Cases for one training session, all from a single origin
#[derive(Debug, Clone)]
pub struct CaseBatch {
    pub cases: Vec<TriageCase>,
    pub origin: CaseOrigin,
}

#[async_trait]
pub trait CaseSource: Send + Sync {
    async fn fetch_batch(&self, batch_size: usize) -> Result<CaseBatch>;
}

/// Random sample of recent labelled cases from the store
pub struct StoreCaseSource {
    store: Arc<dyn LearningStore>,
    lookback_days: i64,
    store_timeout: Duration,
}

impl StoreCaseSource {
    pub fn new(store: Arc<dyn LearningStore>, lookback_days: i64, store_timeout: Duration) -> Self {
        Self {
            store,
            lookback_days,
            store_timeout,
        }
    }
}

#[async_trait]
impl CaseSource for StoreCaseSource {
    async fn fetch_batch(&self, batch_size: usize) -> Result<CaseBatch> {
        let since = days_before(Utc::now(), self.lookback_days)?;
        let cases = bounded(
            self.store_timeout,
            "read recent cases",
            self.store.read_recent_cases(since, batch_size),
        )
        .await?;
        Ok(CaseBatch {
            cases,
            origin: CaseOrigin::Store,
        })
    }
}

/// Seeded generator over the fixed diagnosis vocabulary
///
/// The same seed yields the same sequence of batches.
pub struct SyntheticCaseSource {
    rng: Mutex<StdRng>,
}

impl SyntheticCaseSource {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn generate(&self, count: usize) -> Vec<TriageCase> {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        (0..count).map(|_| synthetic_case(&mut rng)).collect()
    }
}

fn synthetic_case(rng: &mut StdRng) -> TriageCase {
    let profile = &DIAGNOSIS_PROFILES[rng.gen_range(0..DIAGNOSIS_PROFILES.len())];

    let take = rng.gen_range(2..=profile.symptoms.len().min(4));
    let mut symptoms: Vec<String> = profile
        .symptoms
        .choose_multiple(rng, take)
        .map(|s| s.to_string())
        .collect();

    if rng.gen_bool(NOISE_PROBABILITY) {
        let other = &DIAGNOSIS_PROFILES[rng.gen_range(0..DIAGNOSIS_PROFILES.len())];
        if let Some(noise) = other.symptoms.choose(rng) {
            if !symptoms.iter().any(|s| s == noise) {
                symptoms.push(noise.to_string());
            }
        }
    }

    let risk_factors = RISK_FACTORS
        .iter()
        .filter(|_| rng.gen_bool(RISK_FACTOR_PROBABILITY))
        .map(|r| r.to_string())
        .collect();

    TriageCase {
        id: format!("synthetic-{:016x}", rng.gen::<u64>()),
        symptoms,
        age: Some(rng.gen_range(18..=85)),
        risk_factors,
        urgency: Some(profile.urgency),
        gold_label: Some(profile.diagnosis.to_string()),
        created_at: Utc::now(),
    }
}

#[async_trait]
impl CaseSource for SyntheticCaseSource {
    async fn fetch_batch(&self, batch_size: usize) -> Result<CaseBatch> {
        Ok(CaseBatch {
            cases: self.generate(batch_size),
            origin: CaseOrigin::Synthetic,
        })
    }
}

/// Primary source, replaced wholesale by the fallback when it is empty or fails
pub struct FallbackCaseSource {
    primary: Box<dyn CaseSource>,
    fallback: Box<dyn CaseSource>,
}

impl FallbackCaseSource {
    pub fn new(primary: Box<dyn CaseSource>, fallback: Box<dyn CaseSource>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl CaseSource for FallbackCaseSource {
    async fn fetch_batch(&self, batch_size: usize) -> Result<CaseBatch> {
        match self.primary.fetch_batch(batch_size).await {
            Ok(batch) if !batch.cases.is_empty() => Ok(batch),
            Ok(_) => {
                info!("No recent labelled cases, using the synthetic generator");
                self.fallback.fetch_batch(batch_size).await
            }
            Err(e) => {
                warn!("Case store unavailable ({}), using the synthetic generator", e);
                self.fallback.fetch_batch(batch_size).await
            }
        }
    }
}

/// Case source selected by [`CaseSourceMode`]
pub fn build_case_source(
    config: &PipelineConfig,
    store: Arc<dyn LearningStore>,
) -> Arc<dyn CaseSource> {
    match config.case_source {
        CaseSourceMode::StoreOnly => Arc::new(StoreCaseSource::new(
            store,
            config.case_lookback_days,
            config.store_timeout,
        )),
        CaseSourceMode::SyntheticOnly => Arc::new(SyntheticCaseSource::new(config.synthetic_seed)),
        CaseSourceMode::StoreWithFallback => Arc::new(FallbackCaseSource::new(
            Box::new(StoreCaseSource::new(
                store,
                config.case_lookback_days,
                config.store_timeout,
            )),
            Box::new(SyntheticCaseSource::new(config.synthetic_seed)),
        )),
    }
}
