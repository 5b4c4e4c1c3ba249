use std::sync::Arc;

use agora_core::completion::{CompletionBackend, CompletionConfig, OpenAiCompletionClient};
use agora_core::{AgoraConfig, TableNames};
use clap::Parser;
use tokio::sync::broadcast;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "agora.toml")]
    config: String,

    /// Check database connectivity and the search trigger, then exit
    #[arg(long)]
    health: bool,

    /// Create tables, trigger and indexes if missing, then exit
    #[arg(long)]
    setup_db: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience; production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load config
    let config = match AgoraConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // Init logging
    agora_core::telemetry::init(&config.service);

    // Connect to DB
    let pool = match agora_core::db::create_pool(&config.database).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    let tables = TableNames::from_config(&config.database);

    if args.setup_db {
        match agora_core::db::setup_schema(&pool, &tables).await {
            Ok(()) => println!(
                "✅ Schema ready ({}, {}, {})",
                tables.projects, tables.conversations, tables.messages
            ),
            Err(e) => {
                println!("❌ Schema setup failed: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    if args.health {
        match agora_core::db::health_check(&pool).await {
            Ok(v) => println!("✅ PostgreSQL connected: {}", v),
            Err(e) => {
                println!("❌ PostgreSQL connection failed: {}", e);
                std::process::exit(1);
            }
        }

        match agora_core::db::check_search_trigger(&pool).await {
            Ok(true) => println!("✅ Knowledge search trigger present"),
            Ok(false) => {
                println!("❌ Knowledge search trigger missing (run with --setup-db)");
                std::process::exit(1);
            }
            Err(e) => {
                println!("❌ Search trigger check failed: {}", e);
                std::process::exit(1);
            }
        }

        println!("✅ Agora DB health check passed");
        return Ok(());
    }

    let client = OpenAiCompletionClient::new(CompletionConfig::from(&config.llm))?;
    if config.llm.resolved_api_key().is_empty() {
        tracing::warn!("No LLM API key configured; requests are sent without Authorization");
    }
    let completion: Arc<dyn CompletionBackend> = Arc::new(client);

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    tracing::info!(
        model = %config.llm.model,
        table_prefix = %config.database.table_prefix,
        "Starting Agora server"
    );

    agora_server::http::start_http_server(pool, config, completion, tx.subscribe()).await?;

    Ok(())
}
