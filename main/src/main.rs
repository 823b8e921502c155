use std::{
    io::{self, Write},
    sync::Arc,
    time::Duration,
};

use tokio::io::{AsyncBufReadExt, BufReader};

use clap::{Args, Parser, Subcommand};
use common::{
    storage::db::SurrealDbClient,
    utils::{config::get_config, embedding::EmbeddingProvider},
};
use retrieval_pipeline::{
    run_retrieval_and_fusion, CandidateFilter, EvidenceKind, FusionWeights, GenerativeClient,
    OpenAiGenerator, RetrievalOptions,
};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "shopsense", about = "Product Q&A over a hybrid retrieval catalog")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer a single question and exit
    Ask {
        /// The natural-language question
        query: String,
        #[command(flatten)]
        options: QueryArgs,
        /// Print the full response as JSON instead of formatted text
        #[arg(long)]
        json: bool,
    },
    /// Interactive question loop
    Chat {
        #[command(flatten)]
        options: QueryArgs,
    },
}

#[derive(Args)]
struct QueryArgs {
    /// Maximum products in the evidence set
    #[arg(long, default_value_t = 5)]
    max_products: usize,
    /// Maximum reviews in the evidence set
    #[arg(long, default_value_t = 5)]
    max_reviews: usize,
    /// Skip review evidence entirely
    #[arg(long)]
    no_reviews: bool,
    /// Skip the image-descriptive similarity channel
    #[arg(long)]
    no_images: bool,
    /// Weight of the text similarity channel (image gets the remainder)
    #[arg(long, default_value_t = 0.6)]
    text_weight: f32,
    /// Restrict candidates to one category
    #[arg(long)]
    category: Option<String>,
    /// Restrict candidates to one brand
    #[arg(long)]
    brand: Option<String>,
    /// Minimum price in USD
    #[arg(long)]
    price_min: Option<f64>,
    /// Maximum price in USD
    #[arg(long)]
    price_max: Option<f64>,
}

impl QueryArgs {
    fn to_options(&self, generation_timeout: Duration) -> RetrievalOptions {
        RetrievalOptions {
            max_products: self.max_products,
            max_reviews: self.max_reviews,
            include_reviews: !self.no_reviews,
            include_images: !self.no_images,
            weights: FusionWeights {
                text: self.text_weight,
                image: 1.0 - self.text_weight,
            },
            filter: CandidateFilter {
                category: self.category.clone(),
                brand: self.brand.clone(),
                price_min: self.price_min,
                price_max: self.price_max,
            },
            generation_timeout,
            ..RetrievalOptions::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    let config = get_config()?;

    let db = SurrealDbClient::new(
        &config.surrealdb_address,
        &config.surrealdb_username,
        &config.surrealdb_password,
        &config.surrealdb_namespace,
        &config.surrealdb_database,
    )
    .await?;
    db.ensure_initialized(
        config.text_embedding_dimensions,
        config.image_embedding_dimensions,
    )
    .await?;

    let openai_client = Arc::new(async_openai::Client::with_config(
        async_openai::config::OpenAIConfig::new()
            .with_api_key(&config.openai_api_key)
            .with_api_base(&config.openai_base_url),
    ));
    let embedder = EmbeddingProvider::from_config(&config, Some(openai_client.clone()))?;
    info!(
        embedding_backend = embedder.backend_label(),
        generation_model = %config.generation_model,
        "clients initialized"
    );
    let generator = OpenAiGenerator::new(openai_client, config.generation_model.clone());
    let generation_timeout = Duration::from_secs(config.generation_timeout_secs);

    match cli.command {
        Command::Ask {
            query,
            options,
            json,
        } => {
            let response = run_retrieval_and_fusion(
                &db,
                &embedder,
                &generator,
                &query,
                &options.to_options(generation_timeout),
            )
            .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                print_response(&response);
            }
        }
        Command::Chat { options } => {
            chat_loop(&db, &embedder, &generator, &options.to_options(generation_timeout)).await?;
        }
    }

    Ok(())
}

async fn chat_loop(
    db: &SurrealDbClient,
    embedder: &EmbeddingProvider,
    generator: &dyn GenerativeClient,
    options: &RetrievalOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("Ask about the catalog. '/exit' to quit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let query = line.trim().to_string();
        if query.is_empty() {
            continue;
        }
        if query.eq_ignore_ascii_case("/exit") {
            break;
        }

        match run_retrieval_and_fusion(db, embedder, generator, &query, options).await {
            Ok(response) => print_response(&response),
            Err(e) => eprintln!("error: {e}"),
        }
    }
    Ok(())
}

fn print_response(response: &retrieval_pipeline::AssembledResponse) {
    println!("\n{}\n", response.answer);

    if !response.provenance.is_empty() {
        println!("Sources:");
        for entry in &response.provenance {
            let kind = match entry.kind {
                EvidenceKind::Product => "product",
                EvidenceKind::Review => "review",
            };
            println!("  [{kind}] {} ({:.1}%)", entry.name, entry.similarity_pct);
        }
    }

    let meta = &response.metadata;
    let mut notes = Vec::new();
    if meta.degraded {
        notes.push("degraded");
    }
    if meta.used_fallback_generation {
        notes.push("fallback answer");
    }
    if notes.is_empty() {
        println!(
            "({} products, {} reviews)",
            meta.product_count, meta.review_count
        );
    } else {
        println!(
            "({} products, {} reviews; {})",
            meta.product_count,
            meta.review_count,
            notes.join(", ")
        );
    }
}
