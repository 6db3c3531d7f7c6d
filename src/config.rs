//! Search configuration
//!
//! Serializable so deployments can keep it next to their shard manifests.

use crate::distance::DistanceType;
use crate::{KnnError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Brute-force kNN configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KnnConfig {
    /// Distance metric; must be one of the unexpanded L2 variants
    pub metric: DistanceType,

    /// Size of a dedicated rayon pool for dispatch and merge (`None` = global pool)
    pub num_threads: Option<usize>,

    /// Wait for the caller's context to drain before fanning out
    pub sync_before_dispatch: bool,
}

impl Default for KnnConfig {
    fn default() -> Self {
        Self {
            metric: DistanceType::L2Unexpanded,
            num_threads: None,
            sync_before_dispatch: true,
        }
    }
}

impl KnnConfig {
    /// Squared L2 distances
    pub fn l2() -> Self {
        Self::default()
    }

    /// True L2 distances (square root applied after the merge)
    pub fn l2_sqrt() -> Self {
        Self {
            metric: DistanceType::L2SqrtUnexpanded,
            ..Self::default()
        }
    }

    pub fn with_metric(mut self, metric: DistanceType) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads);
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.metric.is_supported_for_knn() {
            return Err(KnnError::UnsupportedMetric(self.metric));
        }
        if self.num_threads == Some(0) {
            return Err(KnnError::Config("num_threads must be at least 1".to_string()));
        }
        Ok(())
    }
}
