//! Adaptive study-duration estimator.
//!
//! Combines a per-category prior with a task's own completed-duration
//! samples. The prior is the category default scaled by a corrective
//! factor learned from every completed sample in the store.
//!
//! ## Parameter updates
//!
//! Parameters are swapped as a whole (`RwLock<Arc<EstimatorParams>>`):
//! [`DurationEstimator::recommend`] clones the `Arc` and never sees a
//! half-refined set. [`DurationEstimator::refine`] is a pure function of
//! the history multiset, so repeated calls on identical input produce
//! identical parameters.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::classifier::Category;
use crate::error::PersistenceError;
use crate::storage::{HistoryKey, SessionStore, TaskHistory};

const PARAMS_KEY: &str = "estimator_params";
const MIN_FACTOR: f64 = 0.5;
const MAX_FACTOR: f64 = 3.0;

/// Estimator tuning, stored under `[estimator]` in config.toml.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimatorConfig {
    #[serde(default = "default_learning_secs")]
    pub learning_secs: u64,
    #[serde(default = "default_doing_secs")]
    pub doing_secs: u64,
    #[serde(default = "default_doing_secs")]
    pub administrative_secs: u64,
    /// New completed samples required before `refine` retrains.
    #[serde(default = "default_refine_threshold")]
    pub refine_threshold: u64,
    /// Pseudo-count given to the prior when blending with samples.
    #[serde(default = "default_prior_strength")]
    pub prior_strength: f64,
    /// Weight multiplier per step back in time (newest sample weighs 1.0).
    #[serde(default = "default_recency_decay")]
    pub recency_decay: f64,
    #[serde(default = "default_min_secs")]
    pub min_secs: u64,
    #[serde(default = "default_max_secs")]
    pub max_secs: u64,
}

fn default_learning_secs() -> u64 {
    1800
}
fn default_doing_secs() -> u64 {
    1200
}
fn default_refine_threshold() -> u64 {
    1
}
fn default_prior_strength() -> f64 {
    2.0
}
fn default_recency_decay() -> f64 {
    0.8
}
fn default_min_secs() -> u64 {
    300
}
fn default_max_secs() -> u64 {
    7200
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            learning_secs: default_learning_secs(),
            doing_secs: default_doing_secs(),
            administrative_secs: default_doing_secs(),
            refine_threshold: default_refine_threshold(),
            prior_strength: default_prior_strength(),
            recency_decay: default_recency_decay(),
            min_secs: default_min_secs(),
            max_secs: default_max_secs(),
        }
    }
}

impl EstimatorConfig {
    /// Fixed default for a category, before any learned correction.
    pub fn category_default(&self, category: Category) -> u64 {
        match category {
            Category::Learning => self.learning_secs,
            Category::Doing => self.doing_secs,
            Category::Administrative => self.administrative_secs,
        }
    }

    fn clamp(&self, seconds: f64) -> u64 {
        let lo = self.min_secs.min(self.max_secs);
        (seconds.round().max(0.0) as u64).clamp(lo, self.max_secs)
    }
}

/// Learned state. Replaced wholesale on refine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EstimatorParams {
    /// Corrective factor per category; missing means 1.0.
    pub factors: BTreeMap<Category, f64>,
    /// Total completed samples seen by the last refine.
    pub trained_on_samples: u64,
}

impl EstimatorParams {
    pub fn factor(&self, category: Category) -> f64 {
        self.factors.get(&category).copied().unwrap_or(1.0)
    }
}

/// Where a recommendation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationBasis {
    /// No attempts recorded for the key.
    NoData,
    /// Attempts exist but none completed.
    PriorOnly,
    /// Blended with completed-duration samples.
    History,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    pub seconds: u64,
    pub basis: RecommendationBasis,
    /// Completed samples that went into the blend.
    pub samples: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefineOutcome {
    Refined { samples: u64 },
    /// Fewer than `refine_threshold` new samples since the last refine.
    Skipped { new_samples: u64 },
}

pub struct DurationEstimator {
    config: EstimatorConfig,
    params: RwLock<Arc<EstimatorParams>>,
}

impl DurationEstimator {
    pub fn new(config: EstimatorConfig) -> Self {
        Self::with_params(config, EstimatorParams::default())
    }

    pub fn with_params(config: EstimatorConfig, params: EstimatorParams) -> Self {
        Self {
            config,
            params: RwLock::new(Arc::new(params)),
        }
    }

    /// Build from config plus the parameters persisted in `store`.
    ///
    /// Unreadable parameters are logged and replaced by defaults.
    pub fn load(config: EstimatorConfig, store: &dyn SessionStore) -> Result<Self, PersistenceError> {
        let params = match store.kv_get(PARAMS_KEY)? {
            Some(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "discarding unreadable estimator params");
                EstimatorParams::default()
            }),
            None => EstimatorParams::default(),
        };
        Ok(Self::with_params(config, params))
    }

    pub fn persist(&self, store: &dyn SessionStore) -> Result<(), PersistenceError> {
        let json = serde_json::to_string(self.params().as_ref())
            .map_err(|e| PersistenceError::QueryFailed(e.to_string()))?;
        store.kv_set(PARAMS_KEY, &json)
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Snapshot of the current parameters.
    pub fn params(&self) -> Arc<EstimatorParams> {
        match self.params.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    /// Category default scaled by the learned factor.
    pub fn prior(&self, category: Category) -> u64 {
        self.prior_with(&self.params(), category)
    }

    fn prior_with(&self, params: &EstimatorParams, category: Category) -> u64 {
        let base = self.config.category_default(category) as f64;
        self.config.clamp(base * params.factor(category))
    }

    /// Recommend a study length for a task of `category` with `history`.
    pub fn recommend(&self, category: Category, history: &TaskHistory) -> Recommendation {
        let params = self.params();
        let prior = self.prior_with(&params, category);

        if history.attempts() == 0 {
            return Recommendation {
                seconds: prior,
                basis: RecommendationBasis::NoData,
                samples: 0,
            };
        }
        let samples = history.duration_samples();
        if samples.is_empty() {
            return Recommendation {
                seconds: prior,
                basis: RecommendationBasis::PriorOnly,
                samples: 0,
            };
        }

        let n = samples.len() as f64;
        let w = n / (n + self.config.prior_strength.max(0.0));
        let blended = (1.0 - w) * prior as f64 + w * self.smoothed(samples);
        Recommendation {
            seconds: self.config.clamp(blended),
            basis: RecommendationBasis::History,
            samples: samples.len() as u64,
        }
    }

    /// Recommend using the task's own history when it has any attempts,
    /// otherwise the category's.
    pub fn recommend_from_store(
        &self,
        store: &dyn SessionStore,
        description: &str,
        category: Category,
    ) -> Result<Recommendation, PersistenceError> {
        let by_task = store.history_for(&HistoryKey::task(description))?;
        if !by_task.is_empty() {
            return Ok(self.recommend(category, &by_task));
        }
        let by_category = store.history_for(&HistoryKey::Category(category))?;
        Ok(self.recommend(category, &by_category))
    }

    /// Recency-weighted mean, samples oldest first.
    fn smoothed(&self, samples: &[u64]) -> f64 {
        let decay = self.config.recency_decay.clamp(0.0, 1.0);
        let mut weight = 1.0;
        let mut num = 0.0;
        let mut den = 0.0;
        for &s in samples.iter().rev() {
            num += weight * s as f64;
            den += weight;
            weight *= decay;
        }
        if den == 0.0 {
            // decay of 0 still gives the newest sample weight 1
            return samples.last().copied().unwrap_or(0) as f64;
        }
        num / den
    }

    /// Retrain category factors from `histories` if enough new samples arrived.
    ///
    /// Only category-keyed histories are read; task keys would double count.
    pub fn refine(&self, histories: &[(HistoryKey, TaskHistory)]) -> RefineOutcome {
        let mut sums: BTreeMap<Category, (u64, u64)> = BTreeMap::new();
        for (key, history) in histories {
            if let HistoryKey::Category(category) = key {
                let entry = sums.entry(*category).or_insert((0, 0));
                entry.0 += history.duration_samples().iter().sum::<u64>();
                entry.1 += history.completions();
            }
        }
        let total: u64 = sums.values().map(|(_, n)| n).sum();

        let current = self.params();
        let new_samples = total.saturating_sub(current.trained_on_samples);
        if total == current.trained_on_samples || new_samples < self.config.refine_threshold {
            tracing::debug!(new_samples, "estimator refine skipped");
            return RefineOutcome::Skipped { new_samples };
        }

        let mut factors = BTreeMap::new();
        for (category, (sum, count)) in sums {
            if count == 0 {
                continue;
            }
            let default = self.config.category_default(category).max(1) as f64;
            let mean = sum as f64 / count as f64;
            factors.insert(category, (mean / default).clamp(MIN_FACTOR, MAX_FACTOR));
        }
        let next = Arc::new(EstimatorParams {
            factors,
            trained_on_samples: total,
        });

        match self.params.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        tracing::info!(samples = total, "estimator refined");
        RefineOutcome::Refined { samples: total }
    }

    /// Read every history from `store`, refine, and persist on change.
    pub fn refine_from_store(&self, store: &dyn SessionStore) -> Result<RefineOutcome, PersistenceError> {
        let outcome = self.refine(&store.all_histories()?);
        if matches!(outcome, RefineOutcome::Refined { .. }) {
            self.persist(store)?;
        }
        Ok(outcome)
    }
}

impl Default for DurationEstimator {
    fn default() -> Self {
        Self::new(EstimatorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::AnalyticsStore;
    use chrono::Utc;
    use proptest::prelude::*;

    fn history(outcomes: &[(bool, u64)]) -> TaskHistory {
        let mut h = TaskHistory::default();
        for &(completed, secs) in outcomes {
            h.apply(completed, secs, Utc::now());
        }
        h
    }

    #[test]
    fn no_history_returns_category_default() {
        let est = DurationEstimator::default();
        let r = est.recommend(Category::Learning, &TaskHistory::default());
        assert_eq!(r.seconds, 1800);
        assert_eq!(r.basis, RecommendationBasis::NoData);
        let r = est.recommend(Category::Doing, &TaskHistory::default());
        assert_eq!(r.seconds, 1200);
    }

    #[test]
    fn attempts_without_completions_use_prior() {
        let est = DurationEstimator::default();
        let r = est.recommend(Category::Doing, &history(&[(false, 400), (false, 100)]));
        assert_eq!(r.seconds, 1200);
        assert_eq!(r.basis, RecommendationBasis::PriorOnly);
    }

    #[test]
    fn history_pulls_toward_samples() {
        let est = DurationEstimator::default();
        // n=2, w=0.5: halfway between 1200 and 2400
        let r = est.recommend(Category::Doing, &history(&[(true, 2400), (true, 2400)]));
        assert_eq!(r.seconds, 1800);
        assert_eq!(r.basis, RecommendationBasis::History);
        assert_eq!(r.samples, 2);
    }

    #[test]
    fn newer_samples_weigh_more() {
        let est = DurationEstimator::default();
        let rising = est.recommend(Category::Doing, &history(&[(true, 600), (true, 3000)]));
        let falling = est.recommend(Category::Doing, &history(&[(true, 3000), (true, 600)]));
        assert!(rising.seconds > falling.seconds);
    }

    #[test]
    fn recommendation_is_clamped() {
        let est = DurationEstimator::default();
        let many_long: Vec<_> = (0..50).map(|_| (true, 100_000)).collect();
        assert_eq!(est.recommend(Category::Doing, &history(&many_long)).seconds, 7200);
        let many_short: Vec<_> = (0..50).map(|_| (true, 10)).collect();
        assert_eq!(est.recommend(Category::Doing, &history(&many_short)).seconds, 300);
    }

    #[test]
    fn refine_learns_category_factor() {
        let est = DurationEstimator::default();
        let histories = vec![(
            HistoryKey::Category(Category::Doing),
            history(&[(true, 2400), (true, 2400)]),
        )];
        assert_eq!(est.refine(&histories), RefineOutcome::Refined { samples: 2 });
        assert_eq!(est.params().factor(Category::Doing), 2.0);
        assert_eq!(est.prior(Category::Doing), 2400);
        assert_eq!(est.prior(Category::Learning), 1800);
    }

    #[test]
    fn refine_is_idempotent_and_threshold_gated() {
        let est = DurationEstimator::new(EstimatorConfig {
            refine_threshold: 2,
            ..EstimatorConfig::default()
        });
        let one = vec![(HistoryKey::Category(Category::Learning), history(&[(true, 900)]))];
        assert_eq!(est.refine(&one), RefineOutcome::Skipped { new_samples: 1 });

        let two = vec![(
            HistoryKey::Category(Category::Learning),
            history(&[(true, 900), (true, 900)]),
        )];
        assert!(matches!(est.refine(&two), RefineOutcome::Refined { .. }));
        let after_first = est.params();
        assert_eq!(est.refine(&two), RefineOutcome::Skipped { new_samples: 0 });
        assert_eq!(est.params(), after_first);
    }

    #[test]
    fn refine_ignores_task_keys() {
        let est = DurationEstimator::default();
        let histories = vec![(HistoryKey::task("read"), history(&[(true, 9000)]))];
        assert_eq!(est.refine(&histories), RefineOutcome::Skipped { new_samples: 0 });
        assert!(est.params().factors.is_empty());
    }

    #[test]
    fn factor_is_clamped() {
        let est = DurationEstimator::default();
        let histories = vec![(HistoryKey::Category(Category::Doing), history(&[(true, 60)]))];
        est.refine(&histories);
        assert_eq!(est.params().factor(Category::Doing), 0.5);
    }

    #[test]
    fn persisted_params_give_identical_recommendations() {
        let store = AnalyticsStore::open_memory().unwrap();
        let est = DurationEstimator::default();
        est.refine(&[(
            HistoryKey::Category(Category::Learning),
            history(&[(true, 2700), (true, 3000), (true, 2000)]),
        )]);
        est.persist(&store).unwrap();

        let reloaded = DurationEstimator::load(EstimatorConfig::default(), &store).unwrap();
        let h = history(&[(true, 2500), (false, 100)]);
        assert_eq!(
            est.recommend(Category::Learning, &h),
            reloaded.recommend(Category::Learning, &h)
        );
        assert_eq!(est.params(), reloaded.params());
    }

    #[test]
    fn load_tolerates_corrupt_params() {
        let store = AnalyticsStore::open_memory().unwrap();
        store.kv_set(PARAMS_KEY, "not json").unwrap();
        let est = DurationEstimator::load(EstimatorConfig::default(), &store).unwrap();
        assert_eq!(est.params().trained_on_samples, 0);
    }

    proptest! {
        #[test]
        fn recommendation_stays_in_bounds(
            outcomes in prop::collection::vec((any::<bool>(), 0u64..50_000), 0..40)
        ) {
            let est = DurationEstimator::default();
            let r = est.recommend(Category::Learning, &history(&outcomes));
            prop_assert!((300..=7200).contains(&r.seconds));
        }
    }
}
