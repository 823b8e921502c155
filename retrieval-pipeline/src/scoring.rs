use std::{cmp::Ordering, collections::HashMap};

use common::{
    error::AppError,
    storage::types::{product::Product, StoredObject},
};
use serde::{Deserialize, Serialize};

/// Holds optional raw similarities gathered per modality. `None` means the
/// modality never produced a signal for the item, which is distinct from a
/// similarity of zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModalityScores {
    pub text: Option<f32>,
    pub image: Option<f32>,
}

/// Generic wrapper combining an item with its per-modality similarities and
/// the fused hybrid score.
#[derive(Debug, Clone)]
pub struct Scored<T> {
    pub item: T,
    pub scores: ModalityScores,
    pub fused: f32,
}

impl<T> Scored<T> {
    pub fn new(item: T) -> Self {
        Self {
            item,
            scores: ModalityScores::default(),
            fused: 0.0,
        }
    }

    pub const fn with_text_score(mut self, score: f32) -> Self {
        self.scores.text = Some(score);
        self
    }

    pub const fn with_image_score(mut self, score: f32) -> Self {
        self.scores.image = Some(score);
        self
    }

    pub const fn update_fused(&mut self, fused: f32) {
        self.fused = fused;
    }
}

/// Weights used for linear score fusion. The defaults favor text because
/// the catalog descriptions carry more discriminating signal than the
/// image-descriptive channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FusionWeights {
    pub text: f32,
    pub image: f32,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            text: 0.6,
            image: 0.4,
        }
    }
}

impl FusionWeights {
    /// Weights must be finite, non-negative, and sum to 1. Anything else is
    /// a caller bug, not a recoverable condition.
    pub fn validate(&self) -> Result<(), AppError> {
        if !self.text.is_finite() || !self.image.is_finite() {
            return Err(AppError::Validation(
                "fusion weights must be finite".to_string(),
            ));
        }
        if self.text < 0.0 || self.image < 0.0 {
            return Err(AppError::Validation(
                "fusion weights must be non-negative".to_string(),
            ));
        }
        if (self.text + self.image - 1.0).abs() > 1e-3 {
            return Err(AppError::Validation(format!(
                "fusion weights must sum to 1, got {} + {}",
                self.text, self.image
            )));
        }
        Ok(())
    }
}

pub const fn clamp_unit(value: f32) -> f32 {
    value.clamp(0.0, 1.0)
}

/// Map a cosine distance reported by the native index to a similarity in
/// [0,1]. Non-finite distances collapse to zero rather than poisoning the
/// ordering.
pub fn distance_to_similarity(distance: f32) -> f32 {
    if !distance.is_finite() {
        return 0.0;
    }
    clamp_unit(1.0 - distance)
}

/// Cosine similarity clamped into [0,1]; zero-norm vectors score zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    clamp_unit(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

/// The hybrid formula: `w_t * text + w_i * (image ?? 0)`, clamped to [0,1].
///
/// An absent image similarity contributes 0 without renormalizing the
/// weights. Single-modality items therefore top out at `w_t`; that asymmetry
/// is a documented contract, not an artifact.
pub fn fuse_scores(scores: &ModalityScores, weights: FusionWeights) -> f32 {
    let text = scores.text.unwrap_or(0.0);
    let image = scores.image.unwrap_or(0.0);
    clamp_unit(weights.text * text + weights.image * image)
}

/// Join candidate lists on item id, keeping the per-modality score from
/// whichever list carried it.
pub fn merge_scored_by_id<T>(target: &mut HashMap<String, Scored<T>>, incoming: Vec<Scored<T>>)
where
    T: StoredObject + Clone,
{
    for scored in incoming {
        let id = scored.item.get_id().to_owned();
        target
            .entry(id)
            .and_modify(|existing| {
                if let Some(score) = scored.scores.text {
                    existing.scores.text = Some(score);
                }
                if let Some(score) = scored.scores.image {
                    existing.scores.image = Some(score);
                }
            })
            .or_insert_with(|| Scored {
                item: scored.item.clone(),
                scores: scored.scores,
                fused: scored.fused,
            });
    }
}

/// Hybrid score descending; identifier ascending on ties so the ordering is
/// reproducible across runs.
pub fn sort_by_fused_desc<T>(items: &mut [Scored<T>])
where
    T: StoredObject,
{
    items.sort_by(|a, b| {
        b.fused
            .partial_cmp(&a.fused)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.item.get_id().cmp(b.item.get_id()))
    });
}

/// One product with its fused evidence scores.
#[derive(Debug, Clone)]
pub struct FusedResult {
    pub product: Product,
    pub text_similarity: Option<f32>,
    pub image_similarity: Option<f32>,
    pub hybrid_score: f32,
}

/// Join the per-modality candidate lists and rank by hybrid score. Pure and
/// deterministic: identical inputs always yield identical ordering.
pub fn fuse(
    text_candidates: Vec<Scored<Product>>,
    image_candidates: Vec<Scored<Product>>,
    weights: FusionWeights,
) -> Vec<FusedResult> {
    let mut merged: HashMap<String, Scored<Product>> = HashMap::new();
    merge_scored_by_id(&mut merged, text_candidates);
    merge_scored_by_id(&mut merged, image_candidates);

    let mut fused: Vec<Scored<Product>> = merged
        .into_values()
        .map(|mut candidate| {
            let score = fuse_scores(&candidate.scores, weights);
            candidate.update_fused(score);
            candidate
        })
        .collect();
    sort_by_fused_desc(&mut fused);

    fused
        .into_iter()
        .map(|candidate| FusedResult {
            text_similarity: candidate.scores.text,
            image_similarity: candidate.scores.image,
            hybrid_score: candidate.fused,
            product: candidate.item,
        })
        .collect()
}
