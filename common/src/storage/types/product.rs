use crate::{error::AppError, stored_object};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    InStock,
    OutOfStock,
    PreOrder,
    Discontinued,
}

impl Availability {
    pub fn label(self) -> &'static str {
        match self {
            Availability::InStock => "in stock",
            Availability::OutOfStock => "out of stock",
            Availability::PreOrder => "pre-order",
            Availability::Discontinued => "discontinued",
        }
    }
}

impl From<String> for Availability {
    fn from(s: String) -> Self {
        match s.to_lowercase().as_str() {
            "in_stock" => Availability::InStock,
            "out_of_stock" | "agotado" => Availability::OutOfStock,
            "pre_order" => Availability::PreOrder,
            "discontinued" => Availability::Discontinued,
            _ => Availability::InStock,
        }
    }
}

stored_object!(Product, "product", {
    /// Stable catalog code (e.g. PROD-042), distinct from the record id
    code: String,
    name: String,
    brand: String,
    category: String,
    price_usd: f64,
    description: String,
    availability: Availability,
    /// Average review rating, 0.0 when unreviewed
    rating: f32,
    review_count: u32,
    /// Free-form technical specifications, when the catalog carries them
    specifications: Option<serde_json::Value>,
    /// Description embedding; None until the indexer has run
    text_embedding: Option<Vec<f32>>,
    /// Image-descriptive embedding; None for products never image-indexed
    image_embedding: Option<Vec<f32>>
});

impl Product {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        code: String,
        name: String,
        brand: String,
        category: String,
        price_usd: f64,
        description: String,
        availability: Availability,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            code,
            name,
            brand,
            category,
            price_usd,
            description,
            availability,
            rating: 0.0,
            review_count: 0,
            specifications: None,
            text_embedding: None,
            image_embedding: None,
        }
    }

    /// Attach a description embedding, rejecting malformed lengths outright
    /// rather than truncating or padding.
    pub fn with_text_embedding(
        mut self,
        embedding: Vec<f32>,
        expected_dimension: usize,
    ) -> Result<Self, AppError> {
        if embedding.len() != expected_dimension {
            return Err(AppError::Validation(format!(
                "text embedding for product {} has dimension {}, expected {}",
                self.id,
                embedding.len(),
                expected_dimension
            )));
        }
        self.text_embedding = Some(embedding);
        Ok(self)
    }

    /// Attach an image-descriptive embedding under the same length contract.
    pub fn with_image_embedding(
        mut self,
        embedding: Vec<f32>,
        expected_dimension: usize,
    ) -> Result<Self, AppError> {
        if embedding.len() != expected_dimension {
            return Err(AppError::Validation(format!(
                "image embedding for product {} has dimension {}, expected {}",
                self.id,
                embedding.len(),
                expected_dimension
            )));
        }
        self.image_embedding = Some(embedding);
        Ok(self)
    }

    pub fn with_rating(mut self, rating: f32, review_count: u32) -> Self {
        self.rating = rating.clamp(0.0, 5.0);
        self.review_count = review_count;
        self
    }

    pub fn with_specifications(mut self, specifications: serde_json::Value) -> Self {
        self.specifications = Some(specifications);
        self
    }
}
