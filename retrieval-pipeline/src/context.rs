use std::fmt::Write as _;

use common::storage::types::review::Review;
use tracing::debug;

use crate::{evidence::EvidenceSet, scoring::Scored};

/// Pros and cons carried into a product block, at most three of each.
const MAX_PROS_PER_PRODUCT: usize = 3;
const MAX_CONS_PER_PRODUCT: usize = 3;

/// The serialized prompt material for one generation call. Built once per
/// request and discarded afterwards.
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub text: String,
    pub component_count: usize,
    pub char_len: usize,
}

/// Serialize the evidence set into numbered product blocks, best match
/// first.
///
/// Each block is internally bounded by `per_item_char_limit` (applied to the
/// description, cut at a word boundary with an ellipsis marker). The whole
/// context is bounded by `max_context_chars`: when the concatenation would
/// overflow, trailing lowest-ranked blocks are dropped whole, never cut
/// mid-block, so the generative call can rely on the ceiling.
pub fn build_context(
    evidence: &EvidenceSet,
    per_item_char_limit: usize,
    max_context_chars: usize,
) -> Context {
    let mut text = String::new();
    let mut component_count = 0usize;

    for (position, result) in evidence.products.iter().enumerate() {
        let block = product_block(position + 1, result, &evidence.reviews, per_item_char_limit);
        let separator = if text.is_empty() { 0 } else { 1 };
        let block_chars = block.chars().count();
        if text.chars().count() + separator + block_chars > max_context_chars {
            debug!(
                kept = component_count,
                dropped = evidence.products.len() - component_count,
                "context ceiling reached; dropping trailing blocks"
            );
            break;
        }
        if separator > 0 {
            text.push('\n');
        }
        text.push_str(&block);
        component_count += 1;
    }

    let char_len = text.chars().count();
    Context {
        text,
        component_count,
        char_len,
    }
}

fn product_block(
    position: usize,
    result: &crate::scoring::FusedResult,
    reviews: &[Scored<Review>],
    per_item_char_limit: usize,
) -> String {
    let product = &result.product;
    let mut block = String::new();

    let _ = writeln!(block, "{position}. {} (Brand: {})", product.name, product.brand);
    let _ = writeln!(
        block,
        "   Price: ${:.2} USD | Category: {}",
        product.price_usd, product.category
    );
    let _ = writeln!(
        block,
        "   Availability: {} | Rating: {:.1}/5.0 ({} reviews)",
        product.availability.label(),
        product.rating,
        product.review_count
    );
    let _ = writeln!(
        block,
        "   Description: {}",
        truncate_at_word_boundary(&product.description, per_item_char_limit)
    );
    if let Some(specifications) = &product.specifications {
        let _ = writeln!(block, "   Specifications: {specifications}");
    }
    let _ = writeln!(
        block,
        "   Similarity: text {} | image {} | hybrid {}",
        percentage(result.text_similarity),
        percentage(result.image_similarity),
        percentage(Some(result.hybrid_score))
    );

    let (pros, cons) = collect_pros_cons(&product.id, reviews);
    if !pros.is_empty() {
        let _ = writeln!(block, "   Pros: {}", pros.join("; "));
    }
    if !cons.is_empty() {
        let _ = writeln!(block, "   Cons: {}", cons.join("; "));
    }

    block
}

fn percentage(similarity: Option<f32>) -> String {
    similarity.map_or_else(|| "n/a".to_string(), |value| format!("{:.1}%", value * 100.0))
}

fn collect_pros_cons(product_id: &str, reviews: &[Scored<Review>]) -> (Vec<String>, Vec<String>) {
    let mut pros = Vec::new();
    let mut cons = Vec::new();
    for review in reviews {
        if review.item.product_id != product_id {
            continue;
        }
        for pro in &review.item.pros {
            if pros.len() < MAX_PROS_PER_PRODUCT && !pros.contains(pro) {
                pros.push(pro.clone());
            }
        }
        for con in &review.item.cons {
            if cons.len() < MAX_CONS_PER_PRODUCT && !cons.contains(con) {
                cons.push(con.clone());
            }
        }
        if pros.len() >= MAX_PROS_PER_PRODUCT && cons.len() >= MAX_CONS_PER_PRODUCT {
            break;
        }
    }
    (pros, cons)
}

/// Cut `text` to at most `limit` characters, backing up to the last word
/// boundary and appending an ellipsis marker. Short inputs pass through
/// untouched.
fn truncate_at_word_boundary(text: &str, limit: usize) -> String {
    if limit == 0 {
        return "…".to_string();
    }
    if text.chars().count() <= limit {
        return text.to_string();
    }

    let prefix: String = text.chars().take(limit).collect();
    let cut = prefix
        .rfind(char::is_whitespace)
        .filter(|&idx| idx > 0)
        .unwrap_or(prefix.len());
    let mut truncated: String = prefix[..cut].trim_end().to_string();
    truncated.push('…');
    truncated
}
