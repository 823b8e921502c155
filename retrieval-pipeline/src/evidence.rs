use std::collections::HashMap;

use common::storage::types::review::Review;
use tracing::debug;

use crate::scoring::{FusedResult, Scored};

/// Cap applied during the first allocation pass so one heavily-reviewed
/// product cannot absorb the whole review budget.
const REVIEWS_PER_PRODUCT_FIRST_PASS: usize = 3;

/// The material handed to context building: top-ranked products plus the
/// reviews attributed to them.
#[derive(Debug, Clone, Default)]
pub struct EvidenceSet {
    pub products: Vec<FusedResult>,
    pub reviews: Vec<Scored<Review>>,
}

impl EvidenceSet {
    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }
}

/// Select evidence from ranked candidates.
///
/// Products: the top `max_products` of the fused ranking, order preserved.
/// Reviews: only those attributed to a selected product survive. The budget
/// of `max_reviews` is spread breadth-first, up to three reviews per product
/// in product rank order, and any leftover budget then deepens coverage with
/// the best remaining attributed reviews.
pub fn select_evidence(
    fused: Vec<FusedResult>,
    review_candidates: Vec<Scored<Review>>,
    max_products: usize,
    max_reviews: usize,
) -> EvidenceSet {
    let mut products = fused;
    products.truncate(max_products);

    if products.is_empty() || max_reviews == 0 {
        return EvidenceSet {
            products,
            reviews: Vec::new(),
        };
    }

    // Attributed reviews grouped per selected product, candidate order
    // (best first) preserved within each group.
    let mut per_product: HashMap<&str, Vec<Scored<Review>>> = products
        .iter()
        .map(|result| (result.product.id.as_str(), Vec::new()))
        .collect();
    let mut dropped = 0usize;
    for review in review_candidates {
        match per_product.get_mut(review.item.product_id.as_str()) {
            Some(group) => group.push(review),
            None => dropped += 1,
        }
    }
    if dropped > 0 {
        debug!(count = dropped, "dropped reviews for unselected products");
    }

    let mut selected: Vec<Scored<Review>> = Vec::new();
    let mut taken: HashMap<&str, usize> = HashMap::new();

    // Breadth-first rounds across products in rank order.
    'rounds: for round in 0..REVIEWS_PER_PRODUCT_FIRST_PASS {
        for result in &products {
            if selected.len() >= max_reviews {
                break 'rounds;
            }
            let id = result.product.id.as_str();
            if let Some(review) = per_product.get(id).and_then(|group| group.get(round)) {
                selected.push(review.clone());
                *taken.entry(id).or_insert(0) += 1;
            }
        }
    }

    // Leftover budget deepens coverage beyond the first-pass cap.
    if selected.len() < max_reviews {
        let mut remaining: Vec<Scored<Review>> = products
            .iter()
            .filter_map(|result| {
                let id = result.product.id.as_str();
                per_product
                    .get(id)
                    .map(|group| group.iter().skip(*taken.get(id).unwrap_or(&0)))
            })
            .flatten()
            .cloned()
            .collect();
        remaining.sort_by(|a, b| {
            let score = |r: &Scored<Review>| r.scores.text.unwrap_or(0.0);
            score(b)
                .partial_cmp(&score(a))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.item.id.cmp(&b.item.id))
        });
        for review in remaining {
            if selected.len() >= max_reviews {
                break;
            }
            selected.push(review);
        }
    }

    EvidenceSet {
        products,
        reviews: selected,
    }
}
