//! Confidence triage
//!
//! Drops candidates of disabled categories and auto-ignores low-confidence
//! ones. Triage is pure and idempotent, and never touches a flag a human
//! reviewer decided.

use crate::types::{DetectionSettings, EntityCandidate, IgnoreOrigin};

/// Default auto-ignore threshold (effective confidence strictly below is ignored)
pub const DEFAULT_AUTO_IGNORE_THRESHOLD: f64 = 70.0;

/// Per-entity auto-ignore policy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriagePolicy {
    threshold: f64,
}

impl TriagePolicy {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Filter and annotate a detector's raw candidates for one file
    pub fn apply(
        &self,
        candidates: Vec<EntityCandidate>,
        settings: &DetectionSettings,
    ) -> Vec<EntityCandidate> {
        let total = candidates.len();
        let triaged: Vec<EntityCandidate> = candidates
            .into_iter()
            .filter(|c| settings.is_enabled(c.entity))
            .map(|c| self.annotate(c))
            .collect();

        tracing::debug!(
            received = total,
            surfaced = triaged.len(),
            auto_ignored = triaged
                .iter()
                .filter(|c| c.ignore_origin == IgnoreOrigin::Auto)
                .count(),
            "Triage complete"
        );
        triaged
    }

    /// Re-evaluate a single candidate's ignore flag
    pub fn annotate(&self, mut candidate: EntityCandidate) -> EntityCandidate {
        if candidate.ignore_origin == IgnoreOrigin::Human {
            return candidate;
        }
        if candidate.effective_confidence() < self.threshold {
            candidate.ignore = true;
            candidate.ignore_origin = IgnoreOrigin::Auto;
        }
        candidate
    }
}

impl Default for TriagePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_AUTO_IGNORE_THRESHOLD)
    }
}
