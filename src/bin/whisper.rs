//! whisper CLI: operator surface over the sync engine.
//!
//! Usage:
//!   whisper ingest <dir> [--config path]
//!   whisper show <id>
//!   whisper search <query> [--limit n]
//!   whisper list [--tag t] [--limit n]
//!   whisper tag <id> [tags...]
//!   whisper delete <id>
//!   whisper mirror <id>

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use whisper_sync::ingest::{list_sources, read_draft};
use whisper_sync::{
    Config, HashingEmbedder, SyncEngine, Whisper, WhisperFilter, WhisperPatch,
};

#[derive(Parser)]
#[command(
    name = "whisper",
    version,
    about = "Store whispers in the primary store and mirror their tags into a graph"
)]
struct Cli {
    /// Path to a YAML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest every .md and .txt file in a directory
    Ingest {
        /// Directory to read
        dir: PathBuf,
    },
    /// Print one whisper
    Show {
        id: String,
    },
    /// Full-text search
    Search {
        query: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// List whispers, newest first
    List {
        /// Only whispers with this tag
        #[arg(long)]
        tag: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Replace a whisper's tags (no tags clears them)
    Tag {
        id: String,
        tags: Vec<String>,
    },
    /// Delete a whisper from both stores
    Delete {
        id: String,
    },
    /// Show what the graph mirror holds for a whisper
    Mirror {
        id: String,
    },
}

fn log_level(verbose: u8) -> tracing::Level {
    match verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    }
}

fn init_tracing(verbose: u8) {
    tracing_subscriber::fmt()
        .with_max_level(log_level(verbose))
        .with_writer(std::io::stderr)
        .init();
}

async fn open_engine(config_path: Option<&Path>) -> Result<SyncEngine, String> {
    let config = Config::load(config_path).map_err(|e| format!("Failed to load config: {}", e))?;
    let embedder = Arc::new(HashingEmbedder::new(config.embedding.dimensions));
    SyncEngine::connect(&config, embedder)
        .await
        .map_err(|e| format!("Failed to open stores: {}", e))
}

fn print_whisper_line(w: &Whisper) {
    let first_line = w.raw_text.lines().next().unwrap_or_default();
    let preview: String = first_line.chars().take(60).collect();
    println!(
        "{:<36}  {:<10}  {:<24}  {}",
        w.id,
        w.created_at.format("%Y-%m-%d").to_string(),
        w.tag_list().join(","),
        preview
    );
}

async fn cmd_ingest(engine: Arc<SyncEngine>, dir: &Path) -> i32 {
    let files = match list_sources(dir) {
        Ok(files) => files,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    if files.is_empty() {
        println!("No .md or .txt files in {}", dir.display());
        return 0;
    }

    let mut tasks = JoinSet::new();
    for path in files {
        let engine = Arc::clone(&engine);
        tasks.spawn(async move {
            let draft = read_draft(&path).await.map_err(|e| e.to_string())?;
            engine
                .upsert(draft)
                .await
                .map(|w| (path.clone(), w))
                .map_err(|e| format!("{}: {}", path.display(), e))
        });
    }

    let mut ok = 0usize;
    let mut failed = 0usize;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok((path, w))) => {
                ok += 1;
                println!("{}  {}", w.id, path.display());
            }
            Ok(Err(e)) => {
                failed += 1;
                eprintln!("Error: {}", e);
            }
            Err(e) => {
                failed += 1;
                eprintln!("Error: ingest task failed: {}", e);
            }
        }
    }
    println!("Ingested {} file(s), {} failed", ok, failed);
    if failed > 0 {
        1
    } else {
        0
    }
}

async fn cmd_show(engine: &SyncEngine, id: &str) -> i32 {
    match engine.get(id).await {
        Ok(Some(w)) => {
            println!("id:          {}", w.id);
            println!("source_path: {}", w.source_path);
            println!("created_at:  {}", w.created_at.to_rfc3339());
            println!("updated_at:  {}", w.updated_at.to_rfc3339());
            println!("revision:    {}", w.revision);
            println!("tags:        {}", w.tag_list().join(", "));
            if let Some(tokens) = w.tokens {
                println!("tokens:      {}", tokens);
            }
            if let Some(embedding) = &w.embedding {
                println!("embedding:   {} dims", embedding.len());
            }
            println!();
            println!("{}", w.raw_text);
            0
        }
        Ok(None) => {
            eprintln!("Error: whisper '{}' not found", id);
            1
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

async fn cmd_search(engine: &SyncEngine, query: &str, limit: usize) -> i32 {
    match engine.search_text(query, limit).await {
        Ok(hits) if hits.is_empty() => {
            println!("No matches.");
            0
        }
        Ok(hits) => {
            hits.iter().for_each(print_whisper_line);
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

async fn cmd_list(engine: &SyncEngine, tag: Option<String>, limit: usize) -> i32 {
    let mut filter = WhisperFilter::new().with_limit(limit);
    if let Some(tag) = tag {
        filter = filter.with_tag(tag);
    }
    match engine.find(&filter).await {
        Ok(whispers) if whispers.is_empty() => {
            println!("No whispers.");
            0
        }
        Ok(whispers) => {
            println!("{:<36}  {:<10}  {:<24}  {}", "ID", "CREATED", "TAGS", "TEXT");
            println!("{}", "-".repeat(96));
            whispers.iter().for_each(print_whisper_line);
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

async fn cmd_tag(engine: &SyncEngine, id: &str, tags: Vec<String>) -> i32 {
    match engine.update(id, WhisperPatch::new().with_tags(tags)).await {
        Ok(Some(w)) => {
            println!("Tagged {}: [{}]", w.id, w.tag_list().join(", "));
            0
        }
        Ok(None) => {
            eprintln!("Error: whisper '{}' not found", id);
            1
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

async fn cmd_delete(engine: &SyncEngine, id: &str) -> i32 {
    match engine.delete(id).await {
        Ok(true) => {
            println!("Deleted {}", id);
            0
        }
        Ok(false) => {
            eprintln!("Warning: whisper '{}' not found; mirror cleaned anyway", id);
            1
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

async fn cmd_mirror(engine: &SyncEngine, id: &str) -> i32 {
    match engine.mirror_view(id).await {
        Ok(Some(view)) => {
            println!("node:          {}", view.node.node);
            println!("source_path:   {}", view.source_path().unwrap_or("-"));
            println!("revision:      {}", view.revision());
            println!("tags_revision: {}", view.tags_revision());
            println!("tags:          {}", view.tags.join(", "));
            match view.year {
                Some(year) => println!("year:          {}", year),
                None => println!("year:          -"),
            }
            println!("text_prefix:   {}", view.text_prefix().unwrap_or(""));
            0
        }
        Ok(None) => {
            eprintln!("Mirror has no node for '{}'", id);
            1
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let engine = match open_engine(cli.config.as_deref()).await {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let code = match cli.command {
        Commands::Ingest { dir } => cmd_ingest(Arc::clone(&engine), &dir).await,
        Commands::Show { id } => cmd_show(&engine, &id).await,
        Commands::Search { query, limit } => cmd_search(&engine, &query, limit).await,
        Commands::List { tag, limit } => cmd_list(&engine, tag, limit).await,
        Commands::Tag { id, tags } => cmd_tag(&engine, &id, tags).await,
        Commands::Delete { id } => cmd_delete(&engine, &id).await,
        Commands::Mirror { id } => cmd_mirror(&engine, &id).await,
    };

    // Let queued mirror jobs finish before the process exits
    let stats = engine.shutdown().await;
    if stats.abandoned > 0 {
        eprintln!(
            "Warning: {} mirror job(s) abandoned; the graph mirror is behind",
            stats.abandoned
        );
    }
    std::process::exit(code);
}
