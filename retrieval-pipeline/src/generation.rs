use std::{sync::Arc, time::Duration};

use async_openai::{
    types::{
        ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
        CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use common::error::AppError;
use tracing::{instrument, warn};

use crate::evidence::EvidenceSet;

/// System role pinned for every generation call. The model answers only
/// from the supplied context and must not invent products outside it.
pub const SYSTEM_PROMPT: &str = "You are a domain expert on the product catalog given as context. \
Answer the user's question using ONLY the information in the context. \
Never mention or invent products that are not present in the context. \
If the context does not contain enough information to answer, say so plainly. \
Be specific: name products, prices, and characteristics. Be concise but complete.";

pub const DEFAULT_TEMPERATURE: f32 = 0.3;
pub const DEFAULT_MAX_TOKENS: u32 = 1000;

/// Seam for the external generative service, so the pipeline and its tests
/// never depend on a live endpoint.
#[async_trait]
pub trait GenerativeClient: Send + Sync {
    async fn complete(
        &self,
        system_prompt: &str,
        context: &str,
        query: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, AppError>;

    /// Model identifier for response metadata, when the backend has one.
    fn model_code(&self) -> Option<String> {
        None
    }
}

/// Chat-completion backed generator.
pub struct OpenAiGenerator {
    client: Arc<Client<async_openai::config::OpenAIConfig>>,
    model: String,
}

impl OpenAiGenerator {
    pub fn new(client: Arc<Client<async_openai::config::OpenAIConfig>>, model: String) -> Self {
        Self { client, model }
    }
}

#[async_trait]
impl GenerativeClient for OpenAiGenerator {
    async fn complete(
        &self,
        system_prompt: &str,
        context: &str,
        query: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, AppError> {
        let user_message = format!(
            "Context from the catalog:\n==================\n{context}\n\nUser question:\n==================\n{query}"
        );

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .temperature(temperature)
            .max_tokens(max_tokens)
            .messages([
                ChatCompletionRequestSystemMessage::from(system_prompt).into(),
                ChatCompletionRequestUserMessage::from(user_message).into(),
            ])
            .build()
            .map_err(AppError::OpenAI)?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| AppError::GenerationFailed(e.to_string()))?;

        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| AppError::GenerationFailed("empty completion content".to_string()))
    }

    fn model_code(&self) -> Option<String> {
        Some(self.model.clone())
    }
}

/// Outcome of a generation attempt, including whether the deterministic
/// fallback produced the answer.
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub answer: String,
    pub used_fallback: bool,
}

/// Invoke the generator with a bounded wait. Timeout, error, or an empty
/// completion all degrade to the deterministic evidence summary so the
/// caller always gets an answer.
#[instrument(level = "debug", skip_all, fields(timeout_secs = timeout.as_secs()))]
pub async fn generate_answer(
    generator: &dyn GenerativeClient,
    context: &str,
    query: &str,
    evidence: &EvidenceSet,
    max_tokens: u32,
    temperature: f32,
    timeout: Duration,
) -> GenerationOutcome {
    let attempt = tokio::time::timeout(
        timeout,
        generator.complete(SYSTEM_PROMPT, context, query, max_tokens, temperature),
    )
    .await;

    match attempt {
        Ok(Ok(answer)) => GenerationOutcome {
            answer,
            used_fallback: false,
        },
        Ok(Err(e)) => {
            warn!(error = %e, "generation failed; using templated summary");
            GenerationOutcome {
                answer: fallback_summary(evidence),
                used_fallback: true,
            }
        }
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis(), "generation timed out; using templated summary");
            GenerationOutcome {
                answer: fallback_summary(evidence),
                used_fallback: true,
            }
        }
    }
}

/// Deterministic summary built straight from the evidence. Used whenever the
/// generative collaborator cannot answer.
pub fn fallback_summary(evidence: &EvidenceSet) -> String {
    if evidence.products.is_empty() {
        return no_matches_answer();
    }
    let names: Vec<&str> = evidence
        .products
        .iter()
        .map(|result| result.product.name.as_str())
        .collect();
    format!(
        "Found {} matching items: {}, ordered by relevance.",
        names.len(),
        names.join(", ")
    )
}

pub fn no_matches_answer() -> String {
    "I could not find any products matching your query.".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::FusedResult;
    use common::storage::types::product::{Availability, Product};

    struct StubGenerator;

    #[async_trait]
    impl GenerativeClient for StubGenerator {
        async fn complete(
            &self,
            _system_prompt: &str,
            _context: &str,
            _query: &str,
            _max_tokens: u32,
            _temperature: f32,
        ) -> Result<String, AppError> {
            Ok("The Acme laptop is the best fit.".to_string())
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
            Err(AppError::GenerationFailed("boom".to_string()))
        }
    }

    struct SlowGenerator;

    #[async_trait]
    impl GenerativeClient for SlowGenerator {
        async fn complete(
            &self,
            _system_prompt: &str,
            _context: &str,
            _query: &str,
            _max_tokens: u32,
            _temperature: f32,
        ) -> Result<String, AppError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("too late".to_string())
        }
    }

    fn evidence_with(names: &[&str]) -> EvidenceSet {
        EvidenceSet {
            products: names
                .iter()
                .map(|name| {
                    let mut p = Product::new(
                        format!("PROD-{name}"),
                        (*name).to_string(),
                        "Acme".into(),
                        "laptops".into(),
                        999.0,
                        "sample".into(),
                        Availability::InStock,
                    );
                    p.id = (*name).to_lowercase();
                    FusedResult {
                        product: p,
                        text_similarity: Some(0.8),
                        image_similarity: None,
                        hybrid_score: 0.48,
                    }
                })
                .collect(),
            reviews: Vec::new(),
        }
    }

    #[tokio::test]
    async fn successful_generation_passes_through() {
        let outcome = generate_answer(
            &StubGenerator,
            "1. Acme laptop",
            "best laptop?",
            &evidence_with(&["Acme Laptop"]),
            DEFAULT_MAX_TOKENS,
            DEFAULT_TEMPERATURE,
            Duration::from_secs(5),
        )
        .await;

        assert!(!outcome.used_fallback);
        assert_eq!(outcome.answer, "The Acme laptop is the best fit.");
    }

    #[tokio::test]
    async fn collaborator_error_falls_back_to_summary() {
        let outcome = generate_answer(
            &FailingGenerator,
            "context",
            "query",
            &evidence_with(&["Alpha Laptop", "Beta Laptop"]),
            DEFAULT_MAX_TOKENS,
            DEFAULT_TEMPERATURE,
            Duration::from_secs(5),
        )
        .await;

        assert!(outcome.used_fallback);
        assert_eq!(
            outcome.answer,
            "Found 2 matching items: Alpha Laptop, Beta Laptop, ordered by relevance."
        );
    }

    #[tokio::test]
    async fn timeout_falls_back_to_summary() {
        let outcome = generate_answer(
            &SlowGenerator,
            "context",
            "query",
            &evidence_with(&["Alpha Laptop"]),
            DEFAULT_MAX_TOKENS,
            DEFAULT_TEMPERATURE,
            Duration::from_millis(50),
        )
        .await;

        assert!(outcome.used_fallback);
        assert!(outcome.answer.starts_with("Found 1 matching items"));
    }

    #[test]
    fn empty_evidence_summary_reports_no_matches() {
        let summary = fallback_summary(&EvidenceSet::default());
        assert_eq!(summary, no_matches_answer());
    }
}
