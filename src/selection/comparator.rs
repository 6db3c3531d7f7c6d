//! Ordering policy for top-k selection

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Which end of the distance range counts as "better"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SelectOrder {
    /// Smallest distance first; padding uses +inf
    #[default]
    Nearest,
    /// Largest distance first; padding uses -inf
    Furthest,
}

impl SelectOrder {
    /// Distance written next to a sentinel index
    pub fn neutral(&self) -> f32 {
        match self {
            SelectOrder::Nearest => f32::INFINITY,
            SelectOrder::Furthest => f32::NEG_INFINITY,
        }
    }

    /// `Less` when `a` ranks ahead of `b`
    #[inline]
    pub fn compare(&self, a: f32, b: f32) -> Ordering {
        match self {
            SelectOrder::Nearest => a.total_cmp(&b),
            SelectOrder::Furthest => b.total_cmp(&a),
        }
    }

    /// Strictly better
    #[inline]
    pub fn is_better(&self, a: f32, b: f32) -> bool {
        self.compare(a, b) == Ordering::Less
    }
}
