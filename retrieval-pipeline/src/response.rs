use serde::Serialize;

use crate::{evidence::EvidenceSet, generation::GenerationOutcome, retriever::RetrieverStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Product,
    Review,
}

/// One evidence item the answer is grounded on, in ranking order.
#[derive(Debug, Clone, Serialize)]
pub struct ProvenanceEntry {
    pub kind: EvidenceKind,
    pub name: String,
    pub similarity_pct: f32,
}

/// Run metadata carried alongside the answer. The flags distinguish "no
/// relevant evidence" from "evidence found but the run degraded somewhere".
#[derive(Debug, Clone, Serialize)]
pub struct ResponseMetadata {
    pub text_embedding_model: Option<String>,
    pub image_embedding_model: Option<String>,
    pub generation_model: Option<String>,
    pub strategy: RetrieverStrategy,
    pub product_count: usize,
    pub review_count: usize,
    pub degraded: bool,
    pub used_fallback_generation: bool,
}

/// The pipeline's final product. Nothing in here is mutated after assembly.
#[derive(Debug, Clone, Serialize)]
pub struct AssembledResponse {
    pub query: String,
    pub answer: String,
    pub provenance: Vec<ProvenanceEntry>,
    pub metadata: ResponseMetadata,
}

/// Merge the generated narrative, the evidence provenance, and the run
/// metadata into one response object.
pub fn assemble(
    query: String,
    outcome: GenerationOutcome,
    evidence: &EvidenceSet,
    mut metadata: ResponseMetadata,
) -> AssembledResponse {
    metadata.product_count = evidence.products.len();
    metadata.review_count = evidence.reviews.len();
    metadata.used_fallback_generation = outcome.used_fallback;

    let mut provenance = Vec::with_capacity(evidence.products.len() + evidence.reviews.len());
    for result in &evidence.products {
        provenance.push(ProvenanceEntry {
            kind: EvidenceKind::Product,
            name: result.product.name.clone(),
            similarity_pct: result.hybrid_score * 100.0,
        });
    }
    for review in &evidence.reviews {
        provenance.push(ProvenanceEntry {
            kind: EvidenceKind::Review,
            name: review.item.title.clone(),
            similarity_pct: review.scores.text.unwrap_or(0.0) * 100.0,
        });
    }

    AssembledResponse {
        query,
        answer: outcome.answer,
        provenance,
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::{FusedResult, Scored};
    use common::storage::types::{
        product::{Availability, Product},
        review::Review,
    };

    fn metadata() -> ResponseMetadata {
        ResponseMetadata {
            text_embedding_model: Some("hashed".into()),
            image_embedding_model: None,
            generation_model: None,
            strategy: RetrieverStrategy::FallbackScan,
            product_count: 0,
            review_count: 0,
            degraded: false,
            used_fallback_generation: false,
        }
    }

    #[test]
    fn provenance_lists_products_then_reviews_in_rank_order() {
        let mut product = Product::new(
            "PROD-1".into(),
            "Acme Laptop".into(),
            "Acme".into(),
            "laptops".into(),
            999.0,
            "sample".into(),
            Availability::InStock,
        );
        product.id = "p1".into();
        let mut review = Review::new(
            "p1".into(),
            "sam".into(),
            true,
            5,
            "Great battery".into(),
            "Lasts all day".into(),
            vec![],
            vec![],
        );
        review.id = "r1".into();

        let evidence = EvidenceSet {
            products: vec![FusedResult {
                product,
                text_similarity: Some(0.85),
                image_similarity: None,
                hybrid_score: 0.51,
            }],
            reviews: vec![Scored::new(review).with_text_score(0.8)],
        };

        let response = assemble(
            "best laptop?".into(),
            crate::generation::GenerationOutcome {
                answer: "The Acme Laptop.".into(),
                used_fallback: false,
            },
            &evidence,
            metadata(),
        );

        assert_eq!(response.provenance.len(), 2);
        assert_eq!(response.provenance[0].kind, EvidenceKind::Product);
        assert_eq!(response.provenance[0].name, "Acme Laptop");
        assert!((response.provenance[0].similarity_pct - 51.0).abs() < 1e-3);
        assert_eq!(response.provenance[1].kind, EvidenceKind::Review);
        assert_eq!(response.provenance[1].name, "Great battery");
        assert_eq!(response.metadata.product_count, 1);
        assert_eq!(response.metadata.review_count, 1);
        assert!(!response.metadata.used_fallback_generation);
    }

    #[test]
    fn fallback_flag_propagates_into_metadata() {
        let response = assemble(
            "anything".into(),
            crate::generation::GenerationOutcome {
                answer: "Found 0 matching items.".into(),
                used_fallback: true,
            },
            &EvidenceSet::default(),
            metadata(),
        );
        assert!(response.metadata.used_fallback_generation);
        assert!(response.provenance.is_empty());
    }
}
