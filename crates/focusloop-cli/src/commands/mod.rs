pub mod config;
pub mod history;
pub mod session;

use std::sync::Arc;

use focusloop_core::{AnalyticsStore, Classifier, Config, DurationEstimator};

/// Everything a command needs from disk.
pub struct Context {
    pub config: Config,
    pub store: Arc<AnalyticsStore>,
    pub estimator: Arc<DurationEstimator>,
    pub classifier: Classifier,
}

impl Context {
    pub fn open() -> Result<Self, Box<dyn std::error::Error>> {
        let config = Config::load()?;
        let store = Arc::new(AnalyticsStore::open_default()?);
        let estimator = Arc::new(DurationEstimator::load(config.estimator.clone(), store.as_ref())?);
        let classifier = Classifier::new(config.classifier.scheme);
        Ok(Self {
            config,
            store,
            estimator,
            classifier,
        })
    }
}
