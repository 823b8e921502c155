use std::{
    collections::hash_map::DefaultHasher,
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

use anyhow::{anyhow, Result};
use async_openai::{types::CreateEmbeddingRequestArgs, Client};

use crate::{error::AppError, utils::config::AppConfig};

/// Signal type behind a similarity computation. `Image` embeds
/// image-descriptive text; the vision model itself lives behind the
/// collaborator boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Modality {
    Text,
    Image,
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Modality::Text => f.write_str("text"),
            Modality::Image => f.write_str("image"),
        }
    }
}

#[derive(Clone)]
pub struct EmbeddingProvider {
    inner: EmbeddingInner,
}

#[derive(Clone)]
enum EmbeddingInner {
    OpenAI {
        client: Arc<Client<async_openai::config::OpenAIConfig>>,
        text_model: String,
        text_dimensions: usize,
        /// None when the deployment carries no image-descriptive model.
        image_model: Option<String>,
        image_dimensions: usize,
    },
    /// Deterministic bag-of-tokens embedding. Offline runs and tests.
    Hashed {
        text_dimension: usize,
        image_dimension: Option<usize>,
    },
}

impl EmbeddingProvider {
    pub fn backend_label(&self) -> &'static str {
        match self.inner {
            EmbeddingInner::Hashed { .. } => "hashed",
            EmbeddingInner::OpenAI { .. } => "openai",
        }
    }

    pub fn dimension(&self, modality: Modality) -> usize {
        match (&self.inner, modality) {
            (EmbeddingInner::Hashed { text_dimension, .. }, Modality::Text) => *text_dimension,
            (EmbeddingInner::Hashed { image_dimension, .. }, Modality::Image) => {
                image_dimension.unwrap_or(0)
            }
            (EmbeddingInner::OpenAI { text_dimensions, .. }, Modality::Text) => *text_dimensions,
            (
                EmbeddingInner::OpenAI {
                    image_dimensions, ..
                },
                Modality::Image,
            ) => *image_dimensions,
        }
    }

    pub fn model_code(&self, modality: Modality) -> Option<String> {
        match (&self.inner, modality) {
            (EmbeddingInner::OpenAI { text_model, .. }, Modality::Text) => {
                Some(text_model.clone())
            }
            (EmbeddingInner::OpenAI { image_model, .. }, Modality::Image) => image_model.clone(),
            (EmbeddingInner::Hashed { .. }, Modality::Text) => Some("hashed".to_string()),
            (EmbeddingInner::Hashed { image_dimension, .. }, Modality::Image) => {
                image_dimension.map(|_| "hashed".to_string())
            }
        }
    }

    pub fn supports(&self, modality: Modality) -> bool {
        match (&self.inner, modality) {
            (_, Modality::Text) => true,
            (EmbeddingInner::OpenAI { image_model, .. }, Modality::Image) => image_model.is_some(),
            (EmbeddingInner::Hashed { image_dimension, .. }, Modality::Image) => {
                image_dimension.is_some()
            }
        }
    }

    /// Embed `text` in the requested modality. Fails with
    /// `EmbeddingUnavailable` when the input is empty after trimming or the
    /// modality has no configured model; both are recoverable conditions for
    /// the pipeline.
    pub async fn embed(&self, text: &str, modality: Modality) -> Result<Vec<f32>, AppError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(AppError::EmbeddingUnavailable(format!(
                "{modality} embedding input is empty after trimming"
            )));
        }

        match &self.inner {
            EmbeddingInner::Hashed {
                text_dimension,
                image_dimension,
            } => match modality {
                Modality::Text => Ok(hashed_embedding(trimmed, *text_dimension, "")),
                Modality::Image => {
                    let dimension = image_dimension.ok_or_else(|| {
                        AppError::EmbeddingUnavailable(
                            "no image-descriptive model configured".to_string(),
                        )
                    })?;
                    Ok(hashed_embedding(trimmed, dimension, "img:"))
                }
            },
            EmbeddingInner::OpenAI {
                client,
                text_model,
                text_dimensions,
                image_model,
                image_dimensions,
            } => {
                let (model, dimensions) = match modality {
                    Modality::Text => (text_model.clone(), *text_dimensions),
                    Modality::Image => {
                        let model = image_model.clone().ok_or_else(|| {
                            AppError::EmbeddingUnavailable(
                                "no image-descriptive model configured".to_string(),
                            )
                        })?;
                        (model, *image_dimensions)
                    }
                };

                let request = CreateEmbeddingRequestArgs::default()
                    .model(model)
                    .input([trimmed])
                    .dimensions(dimensions as u32)
                    .build()
                    .map_err(AppError::OpenAI)?;

                let response = client
                    .embeddings()
                    .create(request)
                    .await
                    .map_err(|e| AppError::EmbeddingUnavailable(e.to_string()))?;

                response
                    .data
                    .into_iter()
                    .next()
                    .map(|item| item.embedding)
                    .ok_or_else(|| {
                        AppError::EmbeddingUnavailable(
                            "no embedding data received from API".to_string(),
                        )
                    })
            }
        }
    }

    pub fn new_openai(
        client: Arc<Client<async_openai::config::OpenAIConfig>>,
        text_model: String,
        text_dimensions: usize,
        image_model: Option<String>,
        image_dimensions: usize,
    ) -> Self {
        EmbeddingProvider {
            inner: EmbeddingInner::OpenAI {
                client,
                text_model,
                text_dimensions,
                image_model,
                image_dimensions,
            },
        }
    }

    pub fn new_hashed(text_dimension: usize, image_dimension: Option<usize>) -> Self {
        EmbeddingProvider {
            inner: EmbeddingInner::Hashed {
                text_dimension: text_dimension.max(1),
                image_dimension: image_dimension.map(|d| d.max(1)),
            },
        }
    }

    pub fn from_config(
        config: &AppConfig,
        openai_client: Option<Arc<Client<async_openai::config::OpenAIConfig>>>,
    ) -> Result<Self> {
        match config.embedding_backend.to_ascii_lowercase().as_str() {
            "hashed" => Ok(Self::new_hashed(
                config.text_embedding_dimensions,
                config
                    .image_embedding_model
                    .as_ref()
                    .map(|_| config.image_embedding_dimensions),
            )),
            "openai" => {
                let client = openai_client
                    .ok_or_else(|| anyhow!("openai embedding backend requires a client"))?;
                Ok(Self::new_openai(
                    client,
                    config.text_embedding_model.clone(),
                    config.text_embedding_dimensions,
                    config.image_embedding_model.clone(),
                    config.image_embedding_dimensions,
                ))
            }
            other => Err(anyhow!(
                "unknown embedding backend '{other}'. Expected 'openai' or 'hashed'."
            )),
        }
    }
}

// Helper functions for hashed embeddings
fn hashed_embedding(text: &str, dimension: usize, salt: &str) -> Vec<f32> {
    let dim = dimension.max(1);
    let mut vector = vec![0.0f32; dim];

    for token in tokens(text) {
        let idx = bucket(&format!("{salt}{token}"), dim);
        if let Some(slot) = vector.get_mut(idx) {
            *slot += 1.0;
        }
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut vector {
            *value /= norm;
        }
    }

    vector
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_ascii_lowercase())
}

fn bucket(token: &str, dimension: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    token.hash(&mut hasher);
    (hasher.finish() as usize) % dimension
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hashed_embedding_is_deterministic_and_normalized() {
        let provider = EmbeddingProvider::new_hashed(16, Some(8));

        let a = provider
            .embed("gaming laptop", Modality::Text)
            .await
            .expect("embed failed");
        let b = provider
            .embed("gaming laptop", Modality::Text)
            .await
            .expect("embed failed");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);

        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn modalities_are_salted_apart() {
        let provider = EmbeddingProvider::new_hashed(16, Some(16));
        let text = provider
            .embed("red backpack", Modality::Text)
            .await
            .expect("embed failed");
        let image = provider
            .embed("red backpack", Modality::Image)
            .await
            .expect("embed failed");
        assert_ne!(text, image);
    }

    #[tokio::test]
    async fn empty_input_is_unavailable() {
        let provider = EmbeddingProvider::new_hashed(16, None);
        let err = provider.embed("   ", Modality::Text).await;
        assert!(matches!(err, Err(AppError::EmbeddingUnavailable(_))));
    }

    #[tokio::test]
    async fn missing_image_model_is_unavailable() {
        let provider = EmbeddingProvider::new_hashed(16, None);
        assert!(!provider.supports(Modality::Image));
        let err = provider.embed("red backpack", Modality::Image).await;
        assert!(matches!(err, Err(AppError::EmbeddingUnavailable(_))));
    }
}
