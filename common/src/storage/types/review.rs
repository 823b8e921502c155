use crate::{error::AppError, stored_object};
use uuid::Uuid;

stored_object!(Review, "review", {
    /// Weak reference to the reviewed product; lookup key only
    product_id: String,
    author: String,
    verified_purchase: bool,
    /// 1 through 5
    rating: u8,
    title: String,
    content: String,
    /// Extracted upsides, strongest first
    pros: Vec<String>,
    /// Extracted downsides, strongest first
    cons: Vec<String>,
    helpful_votes: u32,
    /// Content embedding; None until indexed
    embedding: Option<Vec<f32>>
});

impl Review {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        product_id: String,
        author: String,
        verified_purchase: bool,
        rating: u8,
        title: String,
        content: String,
        pros: Vec<String>,
        cons: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            product_id,
            author,
            verified_purchase,
            rating: rating.clamp(1, 5),
            title,
            content,
            pros,
            cons,
            helpful_votes: 0,
            embedding: None,
        }
    }

    pub fn with_embedding(
        mut self,
        embedding: Vec<f32>,
        expected_dimension: usize,
    ) -> Result<Self, AppError> {
        if embedding.len() != expected_dimension {
            return Err(AppError::Validation(format!(
                "embedding for review {} has dimension {}, expected {}",
                self.id,
                embedding.len(),
                expected_dimension
            )));
        }
        self.embedding = Some(embedding);
        Ok(self)
    }
}
