//! # Forwarding Score
//!
//! Combines the signals that decide how worthwhile it is to push an item
//! over a link right now:
//!
//! ```text
//! score = (a·relevance + b·(1 − density) + c·quality) · age_decay · distance_gate
//! ```
//!
//! | Term | Range | Source |
//! |------|-------|--------|
//! | relevance | [0, 1] | injected [`RelevanceModel`], 0 by default |
//! | density | [0, 1] | [`DensitySource`]; saturated content scores lower |
//! | quality | [0, ∞) | likes / duplicate observations, 0 without observations |
//! | age_decay | (−∞, 1] | `1 − age/ttl`, or 1 when no TTL is set |
//! | distance_gate | {0, 1} | injected [`ProximityGate`], open by default |
//!
//! Default weights are `a = 0`, `b = 0.6`, `c = 0.4`.
//!
//! Scoring is pure and total: it reads its inputs, never mutates, and maps
//! any non-finite intermediate to 0. Expired items come out ≤ 0 and are
//! rejected by the dispatcher's admission threshold rather than here.

use std::sync::Arc;

use crate::content::{now_ms, ContentItem};
use crate::density::DensitySource;
use crate::identity::ContentId;

pub const DEFAULT_RELEVANCE_WEIGHT: f64 = 0.0;
pub const DEFAULT_DENSITY_WEIGHT: f64 = 0.6;
pub const DEFAULT_QUALITY_WEIGHT: f64 = 0.4;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScoreWeights {
    pub relevance: f64,
    pub density: f64,
    pub quality: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            relevance: DEFAULT_RELEVANCE_WEIGHT,
            density: DEFAULT_DENSITY_WEIGHT,
            quality: DEFAULT_QUALITY_WEIGHT,
        }
    }
}

/// Interest matching between an item and the local user.
pub trait RelevanceModel: Send + Sync {
    /// Relevance in `[0, 1]`. Out-of-range values are clamped.
    fn relevance(&self, item: &ContentItem) -> f64;
}

/// Peer proximity / eligibility check.
pub trait ProximityGate: Send + Sync {
    fn admits(&self, item: &ContentItem) -> bool;
}

/// No interest model wired: every item is equally (ir)relevant.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoInterest;

impl RelevanceModel for NoInterest {
    fn relevance(&self, _item: &ContentItem) -> f64 {
        0.0
    }
}

/// Gate that admits everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysNear;

impl ProximityGate for AlwaysNear {
    fn admits(&self, _item: &ContentItem) -> bool {
        true
    }
}

/// Density source for a node with no watcher: nothing is ever observed.
#[derive(Clone, Copy, Debug, Default)]
pub struct Unobserved;

impl DensitySource for Unobserved {
    fn density(&self, _id: &ContentId) -> f64 {
        0.0
    }
}

/// likes / duplicate observations; 0 before any duplicate was seen.
pub fn quality(item: &ContentItem) -> f64 {
    if item.duplicates == 0 {
        return 0.0;
    }
    item.likes as f64 / item.duplicates as f64
}

/// `1 − age/ttl`, or 1 when the item has no TTL.
pub fn age_decay(item: &ContentItem, now_ms: u64) -> f64 {
    if item.ttl_ms <= 0 {
        return 1.0;
    }
    1.0 - item.age_ms_at(now_ms) as f64 / item.ttl_ms as f64
}

/// Individual terms of one evaluation, kept for telemetry and tests.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScoreBreakdown {
    pub relevance: f64,
    pub density: f64,
    pub quality: f64,
    pub age_decay: f64,
    pub near: bool,
}

impl ScoreBreakdown {
    pub fn combine(&self, weights: &ScoreWeights) -> f64 {
        if !self.near {
            return 0.0;
        }
        let base = weights.relevance * self.relevance
            + weights.density * (1.0 - self.density)
            + weights.quality * self.quality;
        let score = base * self.age_decay;
        if score.is_finite() { score } else { 0.0 }
    }
}

fn unit(value: f64) -> f64 {
    if value.is_finite() { value.clamp(0.0, 1.0) } else { 0.0 }
}

/// Scoring context shared by every dispatcher of a registry.
#[derive(Clone)]
pub struct Scorer {
    weights: ScoreWeights,
    density: Arc<dyn DensitySource>,
    relevance: Arc<dyn RelevanceModel>,
    proximity: Arc<dyn ProximityGate>,
}

impl Scorer {
    pub fn new(density: Arc<dyn DensitySource>) -> Self {
        Self {
            weights: ScoreWeights::default(),
            density,
            relevance: Arc::new(NoInterest),
            proximity: Arc::new(AlwaysNear),
        }
    }

    pub fn without_density() -> Self {
        Self::new(Arc::new(Unobserved))
    }

    pub fn with_weights(mut self, weights: ScoreWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_relevance(mut self, model: Arc<dyn RelevanceModel>) -> Self {
        self.relevance = model;
        self
    }

    pub fn with_proximity(mut self, gate: Arc<dyn ProximityGate>) -> Self {
        self.proximity = gate;
        self
    }

    pub fn weights(&self) -> &ScoreWeights {
        &self.weights
    }

    pub fn breakdown_at(&self, item: &ContentItem, now_ms: u64) -> ScoreBreakdown {
        ScoreBreakdown {
            relevance: unit(self.relevance.relevance(item)),
            density: unit(self.density.density(&item.id())),
            quality: {
                let q = quality(item);
                if q.is_finite() { q } else { 0.0 }
            },
            age_decay: age_decay(item, now_ms),
            near: self.proximity.admits(item),
        }
    }

    pub fn score_at(&self, item: &ContentItem, now_ms: u64) -> f64 {
        self.breakdown_at(item, now_ms).combine(&self.weights)
    }

    /// Score against the wall clock.
    pub fn score(&self, item: &ContentItem) -> f64 {
        self.score_at(item, now_ms())
    }
}

impl std::fmt::Debug for Scorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scorer")
            .field("weights", &self.weights)
            .finish_non_exhaustive()
    }
}
