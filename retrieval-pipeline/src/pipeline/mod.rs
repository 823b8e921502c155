use std::time::{Duration, Instant};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{product::Product, review::Review, StoredObject},
    },
    utils::embedding::{EmbeddingProvider, Modality},
};
use tracing::{debug, info, instrument, warn};

use crate::{
    context::build_context,
    evidence::select_evidence,
    generation::{
        generate_answer, no_matches_answer, GenerationOutcome, GenerativeClient,
        DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE,
    },
    response::{assemble, AssembledResponse, ResponseMetadata},
    retriever::{embedding_field, retrieve_products, retrieve_reviews, RetrieverStrategy},
    scoring::{fuse, Scored},
    RetrievalOptions,
};

/// Linear request lifecycle, with one short-circuit: an empty evidence set
/// jumps straight to assembly, since there is nothing to serialize or
/// generate from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Received,
    Embedding,
    Retrieving,
    Fusing,
    SelectingEvidence,
    BuildingContext,
    Generating,
    Assembled,
    Errored,
}

impl PipelineState {
    pub fn can_follow(self, previous: PipelineState) -> bool {
        use PipelineState::{
            Assembled, BuildingContext, Embedding, Errored, Fusing, Generating, Received,
            Retrieving, SelectingEvidence,
        };
        matches!(
            (previous, self),
            (Received, Embedding)
                | (Embedding, Retrieving)
                | (Embedding, Errored)
                | (Retrieving, Fusing)
                | (Fusing, SelectingEvidence)
                | (SelectingEvidence, BuildingContext)
                | (SelectingEvidence, Assembled)
                | (BuildingContext, Generating)
                | (Generating, Assembled)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Embed,
    Retrieve,
    Fuse,
    SelectEvidence,
    BuildContext,
    Generate,
    Assemble,
}

#[derive(Debug, Default, Clone)]
pub struct PipelineStageTimings {
    timings: Vec<(StageKind, Duration)>,
}

impl PipelineStageTimings {
    pub fn record(&mut self, kind: StageKind, duration: Duration) {
        self.timings.push((kind, duration));
    }

    pub fn into_vec(self) -> Vec<(StageKind, Duration)> {
        self.timings
    }

    fn get_stage_ms(&self, kind: StageKind) -> u128 {
        self.timings
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, d)| d.as_millis())
            .unwrap_or(0)
    }

    pub fn embed_ms(&self) -> u128 {
        self.get_stage_ms(StageKind::Embed)
    }

    pub fn retrieve_ms(&self) -> u128 {
        self.get_stage_ms(StageKind::Retrieve)
    }

    pub fn generate_ms(&self) -> u128 {
        self.get_stage_ms(StageKind::Generate)
    }
}

/// Tracks state transitions, degradation, and per-stage timings for one run.
struct RunTracker {
    state: PipelineState,
    degraded: bool,
    timings: PipelineStageTimings,
    current_stage: Option<(StageKind, Instant)>,
}

impl RunTracker {
    fn new() -> Self {
        Self {
            state: PipelineState::Received,
            degraded: false,
            timings: PipelineStageTimings::default(),
            current_stage: None,
        }
    }

    fn transition(&mut self, next: PipelineState) {
        debug_assert!(
            next.can_follow(self.state),
            "invalid pipeline transition {:?} -> {next:?}",
            self.state
        );
        debug!(from = ?self.state, to = ?next, "pipeline transition");
        self.state = next;
    }

    fn begin(&mut self, kind: StageKind) {
        self.finish();
        self.current_stage = Some((kind, Instant::now()));
    }

    fn finish(&mut self) {
        if let Some((kind, started)) = self.current_stage.take() {
            self.timings.record(kind, started.elapsed());
        }
    }

    fn mark_degraded(&mut self, reason: &str) {
        if !self.degraded {
            warn!(%reason, "pipeline degraded");
        }
        self.degraded = true;
    }
}

/// Execute the full retrieval-and-fusion pipeline for one query.
///
/// Recoverable failures (one embedding modality down, native index breaking
/// mid-request, generation failure or timeout) are absorbed and reflected in
/// the response metadata. The only error surfaced for a well-formed request
/// is the simultaneous failure of every usable embedding modality.
#[instrument(skip_all, fields(query_chars = query.chars().count()))]
pub async fn run(
    db: &SurrealDbClient,
    embedder: &EmbeddingProvider,
    generator: &dyn GenerativeClient,
    query: &str,
    options: &RetrievalOptions,
) -> Result<AssembledResponse, AppError> {
    let preview: String = query.chars().take(120).collect();
    info!(preview = %preview.replace('\n', " "), "starting retrieval pipeline");

    let mut tracker = RunTracker::new();
    let pipeline_started = Instant::now();

    // Embed the query, one call per usable modality.
    tracker.transition(PipelineState::Embedding);
    tracker.begin(StageKind::Embed);

    let want_image = options.include_images && embedder.supports(Modality::Image);
    let (text_result, image_result) = tokio::join!(embedder.embed(query, Modality::Text), async {
        if want_image {
            Some(embedder.embed(query, Modality::Image).await)
        } else {
            None
        }
    });

    let text_vector = match text_result {
        Ok(vector) => Some(vector),
        Err(e) => {
            tracker.mark_degraded(&format!("text embedding unavailable: {e}"));
            None
        }
    };
    let image_vector = match image_result {
        Some(Ok(vector)) => Some(vector),
        Some(Err(e)) => {
            tracker.mark_degraded(&format!("image embedding unavailable: {e}"));
            None
        }
        None => None,
    };

    if text_vector.is_none() && image_vector.is_none() {
        tracker.transition(PipelineState::Errored);
        return Err(AppError::RetrievalFailed(
            "no embedding modality produced a query vector".to_string(),
        ));
    }

    // Probe the store's vector-search capability per (table, field) pair,
    // then retrieve per modality. A pair without a usable index scans
    // without affecting the others.
    tracker.transition(PipelineState::Retrieving);
    tracker.begin(StageKind::Retrieve);

    let include_reviews = options.include_reviews && text_vector.is_some();
    let (text_strategy, image_strategy, review_strategy) = tokio::join!(
        async {
            match &text_vector {
                Some(vector) => {
                    RetrieverStrategy::probe(
                        db,
                        Product::table_name(),
                        embedding_field(Modality::Text),
                        vector.len(),
                    )
                    .await
                }
                None => RetrieverStrategy::FallbackScan,
            }
        },
        async {
            match &image_vector {
                Some(vector) => {
                    RetrieverStrategy::probe(
                        db,
                        Product::table_name(),
                        embedding_field(Modality::Image),
                        vector.len(),
                    )
                    .await
                }
                None => RetrieverStrategy::FallbackScan,
            }
        },
        async {
            match &text_vector {
                Some(vector) if include_reviews => {
                    RetrieverStrategy::probe(db, Review::table_name(), "embedding", vector.len())
                        .await
                }
                _ => RetrieverStrategy::FallbackScan,
            }
        },
    );

    let (text_products, image_products, reviews) = tokio::join!(
        async {
            match &text_vector {
                Some(vector) => {
                    products_with_rescan(db, text_strategy, vector, Modality::Text, options).await
                }
                None => Ok((Vec::new(), false)),
            }
        },
        async {
            match &image_vector {
                Some(vector) => {
                    products_with_rescan(db, image_strategy, vector, Modality::Image, options).await
                }
                None => Ok((Vec::new(), false)),
            }
        },
        async {
            match &text_vector {
                Some(vector) if include_reviews => {
                    reviews_with_rescan(db, review_strategy, vector, options).await
                }
                _ => Ok((Vec::new(), false)),
            }
        },
    );

    let (text_products, text_rescanned) = text_products?;
    let (image_products, image_rescanned) = image_products?;
    let (review_candidates, reviews_rescanned) = reviews?;

    let rescanned = text_rescanned || image_rescanned || reviews_rescanned;
    if rescanned {
        tracker.mark_degraded("native vector search failed mid-request, rescanned");
    }
    // Metadata reports the strategy of the dominant product modality.
    let primary_strategy = if text_vector.is_some() {
        text_strategy
    } else {
        image_strategy
    };
    let effective_strategy = if rescanned {
        RetrieverStrategy::FallbackScan
    } else {
        primary_strategy
    };

    // Fuse per-modality candidates into one ranking.
    tracker.transition(PipelineState::Fusing);
    tracker.begin(StageKind::Fuse);
    let fused = fuse(text_products, image_products, options.weights);

    tracker.transition(PipelineState::SelectingEvidence);
    tracker.begin(StageKind::SelectEvidence);
    let evidence = select_evidence(
        fused,
        review_candidates,
        options.max_products,
        options.max_reviews,
    );

    let metadata = ResponseMetadata {
        text_embedding_model: text_vector
            .as_ref()
            .and_then(|_| embedder.model_code(Modality::Text)),
        image_embedding_model: image_vector
            .as_ref()
            .and_then(|_| embedder.model_code(Modality::Image)),
        generation_model: generator.model_code(),
        strategy: effective_strategy,
        product_count: 0,
        review_count: 0,
        degraded: tracker.degraded,
        used_fallback_generation: false,
    };

    // Nothing matched: answer with the deterministic template, never a
    // fabricated narrative.
    if evidence.is_empty() {
        info!("no candidates matched the query");
        tracker.transition(PipelineState::Assembled);
        tracker.begin(StageKind::Assemble);
        let outcome = GenerationOutcome {
            answer: no_matches_answer(),
            used_fallback: true,
        };
        let response = assemble(query.to_string(), outcome, &evidence, metadata);
        tracker.finish();
        log_completion(&tracker, pipeline_started);
        return Ok(response);
    }

    tracker.transition(PipelineState::BuildingContext);
    tracker.begin(StageKind::BuildContext);
    let context = build_context(
        &evidence,
        options.per_item_char_limit,
        options.max_context_chars,
    );
    debug!(
        components = context.component_count,
        chars = context.char_len,
        "context built"
    );

    tracker.transition(PipelineState::Generating);
    tracker.begin(StageKind::Generate);
    let outcome = generate_answer(
        generator,
        &context.text,
        query,
        &evidence,
        DEFAULT_MAX_TOKENS,
        DEFAULT_TEMPERATURE,
        options.generation_timeout,
    )
    .await;
    if outcome.used_fallback {
        tracker.mark_degraded("generation fell back to templated summary");
    }

    tracker.transition(PipelineState::Assembled);
    tracker.begin(StageKind::Assemble);
    let mut metadata = metadata;
    metadata.degraded = tracker.degraded;
    let response = assemble(query.to_string(), outcome, &evidence, metadata);
    tracker.finish();
    log_completion(&tracker, pipeline_started);

    Ok(response)
}

fn log_completion(tracker: &RunTracker, started: Instant) {
    info!(
        total_ms = started.elapsed().as_millis(),
        embed_ms = tracker.timings.embed_ms(),
        retrieve_ms = tracker.timings.retrieve_ms(),
        generate_ms = tracker.timings.generate_ms(),
        degraded = tracker.degraded,
        "retrieval pipeline finished"
    );
}

/// Native retrieval that downgrades to a scan when the index breaks
/// mid-request. Returns whether the downgrade happened.
async fn products_with_rescan(
    db: &SurrealDbClient,
    strategy: RetrieverStrategy,
    vector: &[f32],
    modality: Modality,
    options: &RetrievalOptions,
) -> Result<(Vec<Scored<Product>>, bool), AppError> {
    match retrieve_products(
        db,
        strategy,
        vector,
        modality,
        &options.filter,
        options.num_candidates,
        options.num_candidates,
    )
    .await
    {
        Ok(candidates) => Ok((candidates, false)),
        Err(e) if strategy == RetrieverStrategy::NativeIndex => {
            warn!(%modality, error = %e, "native product retrieval failed, rescanning");
            let candidates = retrieve_products(
                db,
                RetrieverStrategy::FallbackScan,
                vector,
                modality,
                &options.filter,
                options.num_candidates,
                options.num_candidates,
            )
            .await?;
            Ok((candidates, true))
        }
        Err(e) => Err(e),
    }
}

async fn reviews_with_rescan(
    db: &SurrealDbClient,
    strategy: RetrieverStrategy,
    vector: &[f32],
    options: &RetrievalOptions,
) -> Result<(Vec<Scored<Review>>, bool), AppError> {
    match retrieve_reviews(db, strategy, vector, options.num_candidates, options.num_candidates)
        .await
    {
        Ok(candidates) => Ok((candidates, false)),
        Err(e) if strategy == RetrieverStrategy::NativeIndex => {
            warn!(error = %e, "native review retrieval failed, rescanning");
            let candidates = retrieve_reviews(
                db,
                RetrieverStrategy::FallbackScan,
                vector,
                options.num_candidates,
                options.num_candidates,
            )
            .await?;
            Ok((candidates, true))
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions_are_linear() {
        use PipelineState::{
            Assembled, BuildingContext, Embedding, Errored, Fusing, Generating, Received,
            Retrieving, SelectingEvidence,
        };

        let happy_path = [
            Received,
            Embedding,
            Retrieving,
            Fusing,
            SelectingEvidence,
            BuildingContext,
            Generating,
            Assembled,
        ];
        for pair in happy_path.windows(2) {
            assert!(pair[1].can_follow(pair[0]), "{pair:?} should be allowed");
        }

        // Errored is reachable from embedding only.
        assert!(Errored.can_follow(Embedding));
        assert!(!Errored.can_follow(Retrieving));
        assert!(!Errored.can_follow(Generating));

        // Empty evidence short-circuits to assembly.
        assert!(Assembled.can_follow(SelectingEvidence));

        // No skipping otherwise, no going back.
        assert!(!Fusing.can_follow(Embedding));
        assert!(!Embedding.can_follow(Retrieving));
        assert!(!Generating.can_follow(SelectingEvidence));
    }

    #[test]
    fn stage_timings_report_recorded_stages_only() {
        let mut timings = PipelineStageTimings::default();
        timings.record(StageKind::Embed, Duration::from_millis(12));
        timings.record(StageKind::Retrieve, Duration::from_millis(30));

        assert_eq!(timings.embed_ms(), 12);
        assert_eq!(timings.retrieve_ms(), 30);
        assert_eq!(timings.generate_ms(), 0);
        assert_eq!(timings.into_vec().len(), 2);
    }
}
