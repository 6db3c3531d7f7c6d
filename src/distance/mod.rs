//! Distance metrics understood by the kNN entry point
//!
//! Only the unexpanded L2 family can be served by the sharded brute-force
//! search; the remaining variants exist so callers can express (and get a
//! clean rejection for) the other metrics of the distance family.

pub mod euclidean;

pub use euclidean::l2_squared;

use serde::{Deserialize, Serialize};

/// Distance metric variants
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DistanceType {
    /// ||a||^2 + ||b||^2 - 2<a,b>
    L2Expanded,
    /// sqrt of the expanded form
    L2SqrtExpanded,
    /// Cosine distance via norms and dot product
    CosineExpanded,
    /// Manhattan distance
    L1,
    /// sum((a_i - b_i)^2)
    #[default]
    L2Unexpanded,
    /// sqrt(sum((a_i - b_i)^2))
    L2SqrtUnexpanded,
}

impl DistanceType {
    /// Whether the sharded brute-force search accepts this metric
    pub fn is_supported_for_knn(&self) -> bool {
        matches!(self, DistanceType::L2Unexpanded | DistanceType::L2SqrtUnexpanded)
    }

    /// Whether final distances get a square root after the merge
    pub fn requires_sqrt(&self) -> bool {
        matches!(self, DistanceType::L2SqrtUnexpanded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_metrics() {
        assert!(DistanceType::L2Unexpanded.is_supported_for_knn());
        assert!(DistanceType::L2SqrtUnexpanded.is_supported_for_knn());
        assert!(!DistanceType::L2Expanded.is_supported_for_knn());
        assert!(!DistanceType::CosineExpanded.is_supported_for_knn());
        assert!(!DistanceType::L1.is_supported_for_knn());
    }

    #[test]
    fn test_requires_sqrt() {
        assert!(DistanceType::L2SqrtUnexpanded.requires_sqrt());
        assert!(!DistanceType::L2Unexpanded.requires_sqrt());
        assert!(!DistanceType::L2SqrtExpanded.requires_sqrt());
    }

    #[test]
    fn test_default_metric() {
        assert_eq!(DistanceType::default(), DistanceType::L2Unexpanded);
        assert!(DistanceType::default().is_supported_for_knn());
    }

    #[test]
    fn test_serde_roundtrip_name() {
        let json = serde_json::to_string(&DistanceType::L2SqrtUnexpanded).unwrap();
        assert_eq!(json, "\"L2SqrtUnexpanded\"");
    }
}
