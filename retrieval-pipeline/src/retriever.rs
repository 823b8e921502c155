use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{product::deserialize_flexible_id, product::Product, review::Review, StoredObject},
    },
    utils::embedding::Modality,
};
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, collections::HashMap};
use surrealdb::sql::Thing;
use tracing::{debug, instrument};

use crate::scoring::{cosine_similarity, distance_to_similarity, Scored};

/// Search breadth for the HNSW walk on the native path.
const KNN_EF: usize = 40;

/// How a similarity query gets answered: delegated to the store's HNSW
/// index, or brute-forced over every embedded row. Chosen once per (table,
/// field) pair by [`RetrieverStrategy::probe`] instead of branching at each
/// call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrieverStrategy {
    NativeIndex,
    FallbackScan,
}

impl RetrieverStrategy {
    pub async fn probe(
        db: &SurrealDbClient,
        table: &str,
        field: &str,
        dimension: usize,
    ) -> Self {
        if db.knn_index_available(table, field, dimension).await {
            RetrieverStrategy::NativeIndex
        } else {
            debug!(%table, %field, "no usable vector index; falling back to scan");
            RetrieverStrategy::FallbackScan
        }
    }
}

/// Attribute predicate rendered into WHERE clauses and applied before
/// similarity scoring, so in-filter matches are never crowded out of the
/// candidate list by out-of-filter rows that merely scored higher.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CandidateFilter {
    pub category: Option<String>,
    pub brand: Option<String>,
    pub price_min: Option<f64>,
    pub price_max: Option<f64>,
}

impl CandidateFilter {
    fn where_clauses(&self) -> Vec<String> {
        let mut clauses = Vec::new();
        if let Some(category) = &self.category {
            clauses.push(format!("string::lowercase(category) = '{}'", escape(&category.to_lowercase())));
        }
        if let Some(brand) = &self.brand {
            clauses.push(format!("string::lowercase(brand) = '{}'", escape(&brand.to_lowercase())));
        }
        if let Some(min) = self.price_min {
            clauses.push(format!("price_usd >= {min}"));
        }
        if let Some(max) = self.price_max {
            clauses.push(format!("price_usd <= {max}"));
        }
        clauses
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

pub(crate) const fn embedding_field(modality: Modality) -> &'static str {
    match modality {
        Modality::Text => "text_embedding",
        Modality::Image => "image_embedding",
    }
}

/// Score row returned by the native KNN query; full rows are fetched in a
/// second pass and rejoined on id.
#[derive(Debug, Deserialize)]
struct KnnScoreRow {
    #[serde(deserialize_with = "deserialize_flexible_id")]
    id: String,
    distance: Option<f32>,
}

/// Retrieve product candidates for one modality, best matches first.
///
/// Unfiltered native requests ask the index for `num_candidates` and
/// truncate to `limit`; filtered and fallback requests scan every row that
/// passes the filter and carries an embedding. Both return the same shape.
#[instrument(level = "debug", skip(db, query_vector, filter))]
pub async fn retrieve_products(
    db: &SurrealDbClient,
    strategy: RetrieverStrategy,
    query_vector: &[f32],
    modality: Modality,
    filter: &CandidateFilter,
    num_candidates: usize,
    limit: usize,
) -> Result<Vec<Scored<Product>>, AppError> {
    let field = embedding_field(modality);
    if strategy == RetrieverStrategy::NativeIndex && filter.where_clauses().is_empty() {
        let rows =
            knn_query::<Product>(db, Product::table_name(), field, query_vector, num_candidates)
                .await?;
        return Ok(attach_scores(rows, modality, limit));
    }
    // The KNN operator truncates to the nearest rows before any other WHERE
    // condition runs, so filtered requests take the scan path: the filter
    // prunes candidates before anything gets scored.
    scan_products(db, field, modality, filter, query_vector, limit).await
}

async fn scan_products(
    db: &SurrealDbClient,
    field: &str,
    modality: Modality,
    filter: &CandidateFilter,
    query_vector: &[f32],
    limit: usize,
) -> Result<Vec<Scored<Product>>, AppError> {
    let candidates: Vec<Product> =
        fetch_filtered(db, Product::table_name(), field, &filter.where_clauses()).await?;
    scan_candidates(
        candidates,
        query_vector.to_vec(),
        modality,
        limit,
        move |product| match modality {
            Modality::Text => product.text_embedding.as_deref(),
            Modality::Image => product.image_embedding.as_deref(),
        },
    )
    .await
}

/// Retrieve review candidates by content similarity (text modality only).
#[instrument(level = "debug", skip(db, query_vector))]
pub async fn retrieve_reviews(
    db: &SurrealDbClient,
    strategy: RetrieverStrategy,
    query_vector: &[f32],
    num_candidates: usize,
    limit: usize,
) -> Result<Vec<Scored<Review>>, AppError> {
    match strategy {
        RetrieverStrategy::NativeIndex => {
            let rows = knn_query::<Review>(
                db,
                Review::table_name(),
                "embedding",
                query_vector,
                num_candidates,
            )
            .await?;
            Ok(attach_scores(rows, Modality::Text, limit))
        }
        RetrieverStrategy::FallbackScan => {
            let candidates: Vec<Review> =
                fetch_filtered(db, Review::table_name(), "embedding", &[]).await?;
            scan_candidates(
                candidates,
                query_vector.to_vec(),
                Modality::Text,
                limit,
                |review| review.embedding.as_deref(),
            )
            .await
        }
    }
}

async fn knn_query<T>(
    db: &SurrealDbClient,
    table: &str,
    field: &str,
    query_vector: &[f32],
    num_candidates: usize,
) -> Result<Vec<(T, f32)>, AppError>
where
    T: for<'de> Deserialize<'de> + StoredObject,
{
    let take = num_candidates.max(1);
    let query = format!(
        "SELECT id, vector::distance::knn() AS distance FROM {table} \
         WHERE {field} <|{take},{KNN_EF}|> {query_vector:?} ORDER BY distance"
    );
    let score_rows: Vec<KnnScoreRow> = db.query(query).await?.take(0)?;
    if score_rows.is_empty() {
        return Ok(Vec::new());
    }

    let thing_ids: Vec<Thing> = score_rows
        .iter()
        .map(|row| Thing::from((table, row.id.as_str())))
        .collect();
    let items: Vec<T> = db
        .query("SELECT * FROM type::table($table) WHERE id IN $things")
        .bind(("table", table.to_owned()))
        .bind(("things", thing_ids))
        .await?
        .take(0)?;

    let mut item_map: HashMap<String, T> = items
        .into_iter()
        .map(|item| (item.get_id().to_owned(), item))
        .collect();

    let mut results = Vec::with_capacity(score_rows.len());
    for row in score_rows {
        if let Some(item) = item_map.remove(&row.id) {
            results.push((item, row.distance.unwrap_or(f32::INFINITY)));
        }
    }
    Ok(results)
}

fn attach_scores<T>(rows: Vec<(T, f32)>, modality: Modality, limit: usize) -> Vec<Scored<T>>
where
    T: StoredObject,
{
    let mut scored: Vec<Scored<T>> = rows
        .into_iter()
        .map(|(item, distance)| {
            let similarity = distance_to_similarity(distance);
            match modality {
                Modality::Text => Scored::new(item).with_text_score(similarity),
                Modality::Image => Scored::new(item).with_image_score(similarity),
            }
        })
        .collect();

    sort_candidates(&mut scored, modality);
    scored.truncate(limit);
    scored
}

async fn fetch_filtered<T>(
    db: &SurrealDbClient,
    table: &str,
    field: &str,
    filter_clauses: &[String],
) -> Result<Vec<T>, AppError>
where
    T: for<'de> Deserialize<'de>,
{
    let mut conditions = vec![format!("{field} != NONE")];
    conditions.extend_from_slice(filter_clauses);
    let query = format!("SELECT * FROM {table} WHERE {}", conditions.join(" AND "));
    let rows: Vec<T> = db.query(query).await?.take(0)?;
    Ok(rows)
}

/// Brute-force cosine scoring, O(N·D). Fine while the catalog stays in the
/// low thousands; larger deployments need the native index. Runs on a
/// blocking worker so a slow scan cannot stall the request executor.
///
/// Rows whose stored embedding is missing or has the wrong dimension are
/// skipped entirely, never treated as similarity zero.
async fn scan_candidates<T, F>(
    candidates: Vec<T>,
    query_vector: Vec<f32>,
    modality: Modality,
    limit: usize,
    embedding_of: F,
) -> Result<Vec<Scored<T>>, AppError>
where
    T: StoredObject + Send + 'static,
    F: Fn(&T) -> Option<&[f32]> + Send + 'static,
{
    let mut scored = tokio::task::spawn_blocking(move || {
        let expected = query_vector.len();
        let mut scored: Vec<Scored<T>> = Vec::new();
        for candidate in candidates {
            let Some(embedding) = embedding_of(&candidate) else {
                continue;
            };
            if embedding.len() != expected {
                continue;
            }
            let similarity = cosine_similarity(&query_vector, embedding);
            scored.push(match modality {
                Modality::Text => Scored::new(candidate).with_text_score(similarity),
                Modality::Image => Scored::new(candidate).with_image_score(similarity),
            });
        }
        scored
    })
    .await?;

    sort_candidates(&mut scored, modality);
    scored.truncate(limit);
    Ok(scored)
}

fn sort_candidates<T>(candidates: &mut [Scored<T>], modality: Modality)
where
    T: StoredObject,
{
    candidates.sort_by(|a, b| {
        let score = |c: &Scored<T>| match modality {
            Modality::Text => c.scores.text.unwrap_or(0.0),
            Modality::Image => c.scores.image.unwrap_or(0.0),
        };
        score(b)
            .partial_cmp(&score(a))
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.item.get_id().cmp(b.item.get_id()))
    });
}
