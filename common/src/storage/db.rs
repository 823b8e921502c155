use crate::error::AppError;

use super::types::StoredObject;
use serde::Deserialize;
use std::{collections::HashMap, ops::Deref};
use surrealdb::{
    engine::any::{connect, Any},
    opt::auth::Root,
    Error, Surreal,
};
use tracing::debug;

/// Names of the HNSW indexes the retriever probes for.
pub const PRODUCT_TEXT_INDEX: &str = "idx_embedding_product_text";
pub const PRODUCT_IMAGE_INDEX: &str = "idx_embedding_product_image";
pub const REVIEW_TEXT_INDEX: &str = "idx_embedding_review_text";

#[derive(Clone)]
pub struct SurrealDbClient {
    pub client: Surreal<Any>,
}

impl SurrealDbClient {
    pub async fn new(
        address: &str,
        username: &str,
        password: &str,
        namespace: &str,
        database: &str,
    ) -> Result<Self, Error> {
        let db = connect(address).await?;

        db.signin(Root { username, password }).await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }

    pub async fn ensure_initialized(
        &self,
        text_dimension: usize,
        image_dimension: usize,
    ) -> Result<(), AppError> {
        self.build_indexes(text_dimension, image_dimension).await?;
        Ok(())
    }

    /// Define the cosine HNSW indexes used by the native retrieval path,
    /// plus the scalar indexes backing candidate filters.
    pub async fn build_indexes(
        &self,
        text_dimension: usize,
        image_dimension: usize,
    ) -> Result<(), Error> {
        self.client
            .query(format!(
                "DEFINE INDEX IF NOT EXISTS {PRODUCT_TEXT_INDEX} ON product FIELDS text_embedding HNSW DIMENSION {text_dimension} DIST COSINE"
            ))
            .await?;
        self.client
            .query(format!(
                "DEFINE INDEX IF NOT EXISTS {PRODUCT_IMAGE_INDEX} ON product FIELDS image_embedding HNSW DIMENSION {image_dimension} DIST COSINE"
            ))
            .await?;
        self.client
            .query(format!(
                "DEFINE INDEX IF NOT EXISTS {REVIEW_TEXT_INDEX} ON review FIELDS embedding HNSW DIMENSION {text_dimension} DIST COSINE"
            ))
            .await?;

        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_product_category ON product FIELDS category")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_product_brand ON product FIELDS brand")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_review_product ON review FIELDS product_id")
            .await?;

        Ok(())
    }

    /// Probe whether a KNN query against `field` on `table` is answerable,
    /// i.e. the table's index catalog holds an HNSW index on that field with
    /// a matching dimension. Ran once per (table, field) pair per request to
    /// pick the retrieval strategy. A KNN query on an unindexed table does
    /// not error, it silently returns zero rows, so presence cannot be
    /// inferred from query failure.
    pub async fn knn_index_available(&self, table: &str, field: &str, dimension: usize) -> bool {
        let info: Option<TableInfo> = match self.client.query(format!("INFO FOR TABLE {table}")).await
        {
            Ok(mut response) => match response.take(0) {
                Ok(info) => info,
                Err(err) => {
                    debug!(%table, %field, error = %err, "unreadable table info");
                    None
                }
            },
            Err(err) => {
                debug!(%table, %field, error = %err, "table info query failed");
                None
            }
        };
        info.is_some_and(|info| {
            info.indexes
                .values()
                .any(|definition| hnsw_definition_matches(definition, field, dimension))
        })
    }

    pub async fn store_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client
            .create((T::table_name(), item.get_id()))
            .content(item)
            .await
    }

    pub async fn get_all_stored_items<T>(&self) -> Result<Vec<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select(T::table_name()).await
    }

    pub async fn get_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select((T::table_name(), id)).await
    }

    pub async fn delete_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.delete((T::table_name(), id)).await
    }
}

/// Shape of the `INFO FOR TABLE` result; only the index catalog matters here.
#[derive(Debug, Deserialize)]
struct TableInfo {
    #[serde(default)]
    indexes: HashMap<String, String>,
}

/// Match one index definition from the table catalog against the HNSW shape
/// the native retrieval path needs: it must cover `field` and declare the
/// query vector's dimension.
fn hnsw_definition_matches(definition: &str, field: &str, dimension: usize) -> bool {
    let tokens: Vec<&str> = definition.split_whitespace().collect();
    if !tokens.contains(&"HNSW") {
        return false;
    }
    let field_matches = tokens
        .windows(2)
        .any(|pair| (pair[0] == "FIELDS" || pair[0] == "COLUMNS") && pair[1].trim_end_matches(',') == field);
    let dimension_matches = tokens
        .windows(2)
        .any(|pair| pair[0] == "DIMENSION" && pair[1].parse::<usize>() == Ok(dimension));
    field_matches && dimension_matches
}

impl Deref for SurrealDbClient {
    type Target = Surreal<Any>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SurrealDbClient {
    /// Create an in-memory SurrealDB client for testing.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, Error> {
        let db = connect("mem://").await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }
}
