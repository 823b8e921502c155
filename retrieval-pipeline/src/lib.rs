pub mod context;
pub mod evidence;
pub mod generation;
pub mod pipeline;
pub mod response;
pub mod retriever;
pub mod scoring;

use std::time::Duration;

use common::{
    error::AppError, storage::db::SurrealDbClient, utils::embedding::EmbeddingProvider,
};
use tracing::instrument;

pub use generation::{GenerativeClient, OpenAiGenerator};
pub use pipeline::{PipelineStageTimings, PipelineState, StageKind};
pub use response::{AssembledResponse, EvidenceKind, ProvenanceEntry, ResponseMetadata};
pub use retriever::{CandidateFilter, RetrieverStrategy};
pub use scoring::{FusedResult, FusionWeights};

/// Per-request knobs for the retrieval pipeline. The defaults mirror a
/// typical product Q&A deployment; `validate` rejects combinations that can
/// only come from a caller bug.
#[derive(Debug, Clone)]
pub struct RetrievalOptions {
    pub max_products: usize,
    pub max_reviews: usize,
    pub include_reviews: bool,
    pub include_images: bool,
    pub weights: FusionWeights,
    pub num_candidates: usize,
    pub per_item_char_limit: usize,
    pub max_context_chars: usize,
    pub generation_timeout: Duration,
    pub filter: CandidateFilter,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            max_products: 5,
            max_reviews: 5,
            include_reviews: true,
            include_images: true,
            weights: FusionWeights::default(),
            num_candidates: 40,
            per_item_char_limit: 600,
            max_context_chars: 8000,
            generation_timeout: Duration::from_secs(30),
            filter: CandidateFilter::default(),
        }
    }
}

impl RetrievalOptions {
    pub fn validate(&self) -> Result<(), AppError> {
        self.weights.validate()?;
        if self.max_products == 0 {
            return Err(AppError::Validation(
                "max_products must be at least 1".to_string(),
            ));
        }
        if self.num_candidates == 0 {
            return Err(AppError::Validation(
                "num_candidates must be at least 1".to_string(),
            ));
        }
        if self.per_item_char_limit == 0 || self.max_context_chars == 0 {
            return Err(AppError::Validation(
                "context character limits must be positive".to_string(),
            ));
        }
        if self.generation_timeout.is_zero() {
            return Err(AppError::Validation(
                "generation timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Entry point for the surrounding application: turn a natural-language
/// query into a grounded, assembled response.
///
/// Recoverable conditions (empty result set, degraded modality, generation
/// failure) never surface as errors; they show up in the response metadata.
/// Errors mean malformed options or a request that produced no usable query
/// vector at all.
#[instrument(skip_all)]
pub async fn run_retrieval_and_fusion(
    db: &SurrealDbClient,
    embedder: &EmbeddingProvider,
    generator: &dyn GenerativeClient,
    query: &str,
    options: &RetrievalOptions,
) -> Result<AssembledResponse, AppError> {
    options.validate()?;
    pipeline::run(db, embedder, generator, query, options).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::storage::types::{
        product::{Availability, Product},
        review::Review,
    };
    use uuid::Uuid;

    struct StubGenerator;

    #[async_trait]
    impl GenerativeClient for StubGenerator {
        async fn complete(
            &self,
            _system_prompt: &str,
            context: &str,
            _query: &str,
            _max_tokens: u32,
            _temperature: f32,
        ) -> Result<String, AppError> {
            // Echo the first context line so tests can check grounding.
            let first_line = context.lines().next().unwrap_or_default();
            Ok(format!("Based on the catalog: {first_line}"))
        }

        fn model_code(&self) -> Option<String> {
            Some("stub".to_string())
        }
    }

    struct FailingGenerator;

    #[async_trait]
    impl GenerativeClient for FailingGenerator {
        async fn complete(
            &self,
            _system_prompt: &str,
            _context: &str,
            _query: &str,
            _max_tokens: u32,
            _temperature: f32,
        ) -> Result<String, AppError> {
            Err(AppError::GenerationFailed("service unavailable".to_string()))
        }
    }

    async fn setup_db() -> SurrealDbClient {
        let database = &Uuid::new_v4().to_string();
        SurrealDbClient::memory("test_ns", database)
            .await
            .expect("Failed to start in-memory surrealdb")
    }

    async fn seed_catalog(db: &SurrealDbClient, embedder: &EmbeddingProvider) {
        use common::utils::embedding::Modality;

        let items = [
            (
                "gaming-laptop",
                "Vanta Gaming Laptop 16",
                "Vanta",
                "laptops",
                1899.0,
                "High-refresh 16 inch gaming laptop with a dedicated GPU and RGB keyboard",
            ),
            (
                "office-laptop",
                "Plainbook Air 14",
                "Plainbook",
                "laptops",
                749.0,
                "Lightweight office laptop for browsing and documents",
            ),
            (
                "headphones",
                "Quiet Pro Headphones",
                "Hushtec",
                "audio",
                299.0,
                "Noise cancelling over-ear headphones",
            ),
        ];

        for (id, name, brand, category, price, description) in items {
            let mut product = Product::new(
                format!("PROD-{id}"),
                name.into(),
                brand.into(),
                category.into(),
                price,
                description.into(),
                Availability::InStock,
            );
            product.id = id.to_string();
            product.rating = 4.4;
            product.review_count = 8;
            product.text_embedding = Some(
                embedder
                    .embed(description, Modality::Text)
                    .await
                    .expect("embed failed"),
            );
            product.image_embedding = Some(
                embedder
                    .embed(description, Modality::Image)
                    .await
                    .expect("embed failed"),
            );
            db.store_item(product).await.expect("store failed");
        }

        let mut review = Review::new(
            "gaming-laptop".into(),
            "casey".into(),
            true,
            5,
            "Runs every game".into(),
            "The gaming laptop handles every game I throw at it".into(),
            vec!["fast GPU".into(), "great screen".into()],
            vec!["loud fans".into()],
        );
        review.id = "rev-gaming".into();
        review.embedding = Some(
            embedder
                .embed(
                    "The gaming laptop handles every game I throw at it",
                    common::utils::embedding::Modality::Text,
                )
                .await
                .expect("embed failed"),
        );
        db.store_item(review).await.expect("store failed");
    }

    #[tokio::test]
    async fn end_to_end_answers_from_seeded_catalog() {
        let db = setup_db().await;
        let embedder = EmbeddingProvider::new_hashed(32, Some(32));
        seed_catalog(&db, &embedder).await;

        let response = run_retrieval_and_fusion(
            &db,
            &embedder,
            &StubGenerator,
            "gaming laptop with a dedicated GPU",
            &RetrievalOptions::default(),
        )
        .await
        .expect("pipeline failed");

        assert!(!response.answer.is_empty());
        assert!(!response.metadata.used_fallback_generation);
        assert!(response.metadata.product_count > 0);
        assert_eq!(
            response.provenance[0].name, "Vanta Gaming Laptop 16",
            "best text+image match should lead the provenance"
        );
        assert!(response
            .provenance
            .iter()
            .any(|entry| entry.kind == EvidenceKind::Review));
        assert_eq!(response.metadata.text_embedding_model.as_deref(), Some("hashed"));
        assert_eq!(response.metadata.generation_model.as_deref(), Some("stub"));
    }

    #[tokio::test]
    async fn empty_catalog_yields_no_matches_template_not_error() {
        let db = setup_db().await;
        let embedder = EmbeddingProvider::new_hashed(32, None);

        let response = run_retrieval_and_fusion(
            &db,
            &embedder,
            &StubGenerator,
            "anything at all",
            &RetrievalOptions::default(),
        )
        .await
        .expect("empty catalog must not be an error");

        assert_eq!(response.metadata.product_count, 0);
        assert!(response.metadata.used_fallback_generation);
        assert!(!response.answer.is_empty());
        assert!(response.provenance.is_empty());
    }

    #[tokio::test]
    async fn blank_query_fails_both_modalities_and_surfaces_error() {
        let db = setup_db().await;
        let embedder = EmbeddingProvider::new_hashed(32, Some(32));

        let result = run_retrieval_and_fusion(
            &db,
            &embedder,
            &StubGenerator,
            "   ",
            &RetrievalOptions::default(),
        )
        .await;

        assert!(matches!(result, Err(AppError::RetrievalFailed(_))));
    }

    #[tokio::test]
    async fn generation_failure_degrades_but_still_answers() {
        let db = setup_db().await;
        let embedder = EmbeddingProvider::new_hashed(32, Some(32));
        seed_catalog(&db, &embedder).await;

        let response = run_retrieval_and_fusion(
            &db,
            &embedder,
            &FailingGenerator,
            "gaming laptop with a dedicated GPU",
            &RetrievalOptions::default(),
        )
        .await
        .expect("generation failure must be absorbed");

        assert!(response.metadata.used_fallback_generation);
        assert!(response.metadata.degraded);
        assert!(response.answer.starts_with("Found"));
        assert!(response.answer.contains("Vanta Gaming Laptop 16"));
    }

    #[tokio::test]
    async fn text_only_deployment_marks_no_image_model() {
        let db = setup_db().await;
        // Seed with a dual-modality embedder so image vectors exist in the
        // store, then query through a text-only one.
        let seeder = EmbeddingProvider::new_hashed(32, Some(32));
        seed_catalog(&db, &seeder).await;
        let embedder = EmbeddingProvider::new_hashed(32, None);

        let response = run_retrieval_and_fusion(
            &db,
            &embedder,
            &StubGenerator,
            "gaming laptop with a dedicated GPU",
            &RetrievalOptions::default(),
        )
        .await
        .expect("pipeline failed");

        // Image modality was never attempted, so the run is not degraded.
        assert!(!response.metadata.degraded);
        assert!(response.metadata.image_embedding_model.is_none());
        assert!(response.metadata.product_count > 0);
    }

    #[tokio::test]
    async fn partial_index_coverage_scans_quietly_without_degrading() {
        let db = setup_db().await;
        let embedder = EmbeddingProvider::new_hashed(32, Some(32));

        // Only the product text field is indexed; the image and review
        // lookups scan without marking the run degraded.
        db.query(
            "DEFINE INDEX idx_embedding_product_text ON product FIELDS text_embedding \
             HNSW DIMENSION 32 DIST COSINE",
        )
        .await
        .expect("index definition failed");
        seed_catalog(&db, &embedder).await;

        let response = run_retrieval_and_fusion(
            &db,
            &embedder,
            &StubGenerator,
            "gaming laptop with a dedicated GPU",
            &RetrievalOptions::default(),
        )
        .await
        .expect("pipeline failed");

        assert!(!response.metadata.degraded);
        assert!(!response.metadata.used_fallback_generation);
        assert!(response.metadata.product_count > 0);
        assert!(response
            .provenance
            .iter()
            .any(|entry| entry.kind == EvidenceKind::Review));
        assert_eq!(response.metadata.strategy, RetrieverStrategy::NativeIndex);
    }

    #[tokio::test]
    async fn category_filter_narrows_evidence() {
        let db = setup_db().await;
        let embedder = EmbeddingProvider::new_hashed(32, Some(32));
        seed_catalog(&db, &embedder).await;

        let options = RetrievalOptions {
            filter: CandidateFilter {
                category: Some("audio".into()),
                ..CandidateFilter::default()
            },
            ..RetrievalOptions::default()
        };
        let response = run_retrieval_and_fusion(
            &db,
            &embedder,
            &StubGenerator,
            "something for listening to music",
            &options,
        )
        .await
        .expect("pipeline failed");

        assert!(response
            .provenance
            .iter()
            .filter(|entry| entry.kind == EvidenceKind::Product)
            .all(|entry| entry.name == "Quiet Pro Headphones"));
    }

    #[tokio::test]
    async fn malformed_options_are_rejected_up_front() {
        let db = setup_db().await;
        let embedder = EmbeddingProvider::new_hashed(32, None);

        let options = RetrievalOptions {
            weights: FusionWeights {
                text: 0.9,
                image: 0.9,
            },
            ..RetrievalOptions::default()
        };
        let result =
            run_retrieval_and_fusion(&db, &embedder, &StubGenerator, "query", &options).await;
        assert!(matches!(result, Err(AppError::Validation(_))));

        let options = RetrievalOptions {
            max_products: 0,
            ..RetrievalOptions::default()
        };
        let result =
            run_retrieval_and_fusion(&db, &embedder, &StubGenerator, "query", &options).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }
}
