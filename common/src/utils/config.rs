use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub openai_api_key: String,
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
    /// "openai" or "hashed" (deterministic, offline)
    #[serde(default = "default_embedding_backend")]
    pub embedding_backend: String,
    #[serde(default = "default_text_embedding_model")]
    pub text_embedding_model: String,
    #[serde(default = "default_text_embedding_dimensions")]
    pub text_embedding_dimensions: usize,
    /// Unset means the deployment has no image-descriptive model and
    /// retrieval runs text-only.
    #[serde(default)]
    pub image_embedding_model: Option<String>,
    #[serde(default = "default_image_embedding_dimensions")]
    pub image_embedding_dimensions: usize,
    #[serde(default = "default_generation_model")]
    pub generation_model: String,
    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_embedding_backend() -> String {
    "openai".to_string()
}

fn default_text_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

const fn default_text_embedding_dimensions() -> usize {
    384
}

const fn default_image_embedding_dimensions() -> usize {
    512
}

fn default_generation_model() -> String {
    "gpt-4o-mini".to_string()
}

const fn default_generation_timeout_secs() -> u64 {
    30
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}
