//! # docket CLI
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docket init` | Create the SQLite database and run schema migrations |
//! | `docket ingest` | Ingest the historical corpus |
//! | `docket fetch` | Pull recent live filings into the index |
//! | `docket query "<text>"` | Hybrid query over corpus and live filings |
//! | `docket get <id>` | Print a full record |
//! | `docket stats` | Index and cache statistics |
//! | `docket serve` | Start the HTTP API |
//! | `docket completions <shell>` | Print shell completions |
//!
//! ## Examples
//!
//! ```bash
//! docket init --config ./config/docket.toml
//! docket ingest --root ./data/contracts
//! docket query "exclusivity clause distribution" --doc-type Services
//! docket query "termination for convenience \$ACME" --live --json
//! docket serve
//! ```

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use docket::app::Docket;
use docket::config;
use docket::live::recent;
use docket::migrate;
use docket::models::{DateRange, QueryRequest, RecordSource, SearchFilters};
use docket::server;

/// docket: hybrid retrieval over historical and live contract filings.
#[derive(Parser)]
#[command(name = "docket", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docket.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Ingest the historical corpus.
    ///
    /// Documents already in the index (same native id or same normalized
    /// text) are reported as duplicates and not embedded again.
    Ingest {
        /// Corpus root, overriding `corpus.root`.
        #[arg(long)]
        root: Option<PathBuf>,

        /// Maximum number of documents to ingest.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Fetch recent live filings and ingest them.
    Fetch {
        /// Company name or ticker.
        #[arg(long)]
        entity: Option<String>,

        /// Days back from today, overriding `live.days_back`.
        #[arg(long)]
        days: Option<i64>,
    },

    /// Run a hybrid query.
    Query {
        /// Query text.
        text: String,

        /// Contract or form type.
        #[arg(long)]
        doc_type: Option<String>,

        /// Company name or ticker.
        #[arg(long)]
        entity: Option<String>,

        /// Filed on or after this date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,

        /// Filed on or before this date (YYYY-MM-DD).
        #[arg(long)]
        until: Option<String>,

        /// `historical` or `live`.
        #[arg(long)]
        source: Option<String>,

        /// Clause tag.
        #[arg(long)]
        clause: Option<String>,

        /// Always consult the live source.
        #[arg(long)]
        live: bool,

        /// Number of results.
        #[arg(long)]
        top_k: Option<usize>,

        /// Print the response as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print a record by id, including superseded records.
    Get {
        id: String,

        /// Print the record as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show index and cache statistics.
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Start the HTTP API on `[server].bind`.
    Serve,

    /// Print shell completions to stdout.
    Completions { shell: Shell },
}

fn parse_date(flag: &str, value: Option<String>) -> Result<Option<NaiveDate>> {
    value
        .map(|v| {
            NaiveDate::parse_from_str(&v, "%Y-%m-%d")
                .with_context(|| format!("--{} must be YYYY-MM-DD, got '{}'", flag, v))
        })
        .transpose()
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "docket", &mut std::io::stdout());
        return Ok(());
    }

    init_tracing();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { root, limit } => {
            let docket = Docket::open(cfg).await?;
            let summary = docket.ingest_corpus(root.as_deref(), limit).await?;
            println!("Corpus ingestion complete:");
            println!("  discovered:    {}", summary.discovered);
            println!("  inserted:      {}", summary.inserted);
            println!("  duplicates:    {}", summary.duplicates);
            println!("  failed:        {}", summary.failed);
            println!("  skipped_short: {}", summary.skipped_short);
            println!("  unreadable:    {}", summary.unreadable);
        }
        Commands::Fetch { entity, days } => {
            let mut criteria = recent(days.unwrap_or(cfg.live.days_back));
            criteria.entity = entity;
            let docket = Docket::open(cfg).await?;
            let summary = docket.fetch_live(&criteria).await?;
            println!("Live fetch complete:");
            println!("  fetched:    {}", summary.discovered);
            println!("  inserted:   {}", summary.inserted);
            println!("  duplicates: {}", summary.duplicates);
            println!("  failed:     {}", summary.failed);
        }
        Commands::Query {
            text,
            doc_type,
            entity,
            since,
            until,
            source,
            clause,
            live,
            top_k,
            json,
        } => {
            let from = parse_date("since", since)?;
            let to = parse_date("until", until)?;
            if let (Some(f), Some(t)) = (from, to) {
                if f > t {
                    bail!("--since must not be after --until");
                }
            }
            let source = source
                .map(|s| s.parse::<RecordSource>().map_err(anyhow::Error::msg))
                .transpose()?;
            let req = QueryRequest {
                text,
                filters: SearchFilters {
                    doc_type,
                    entity,
                    date_range: (from.is_some() || to.is_some()).then(|| DateRange::new(from, to)),
                    source,
                    clause_tag: clause,
                },
                include_live: live,
                top_k,
            };

            let docket = Docket::open(cfg).await?;
            let response = docket.query(&req).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
                return Ok(());
            }
            for warning in &response.warnings {
                println!("warning: {}", warning);
            }
            if response.results.is_empty() {
                println!("No results.");
            }
            for (i, result) in response.results.iter().enumerate() {
                let meta = &result.metadata;
                println!(
                    "{}. [{:.3}] {} / {}",
                    i + 1,
                    result.score,
                    result.source,
                    meta.doc_type.as_deref().unwrap_or("(untyped)")
                );
                if let Some(entity) = meta.entity.as_deref().or(meta.ticker.as_deref()) {
                    println!("    entity: {}", entity);
                }
                if let Some(date) = meta.filing_date {
                    println!("    filed: {}", date);
                }
                if let Some(url) = &meta.source_url {
                    println!("    url: {}", url);
                }
                println!("    id: {}", result.id);
                println!();
            }
        }
        Commands::Get { id, json } => {
            let docket = Docket::open(cfg).await?;
            let Some(record) = docket.get(&id).await? else {
                bail!("record not found: {}", id);
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&record)?);
                return Ok(());
            }
            println!("--- Record ---");
            println!("id:            {}", record.id);
            println!("source:        {}", record.source);
            println!("native_id:     {}", record.source_native_id);
            println!("revision:      {}", record.revision);
            println!("content_hash:  {}", record.content_hash);
            println!("model:         {}", record.model);
            println!("ingested_at:   {}", record.ingested_at.to_rfc3339());
            if let Some(newer) = &record.superseded_by {
                println!("superseded_by: {}", newer);
            }
            println!("metadata:      {}", serde_json::to_string(&record.metadata)?);
            println!();
            println!("--- Text ---");
            println!("{}", record.text);
        }
        Commands::Stats { json } => {
            let docket = Docket::open(cfg).await?;
            let stats = docket.stats().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
                return Ok(());
            }
            let idx = &stats.index;
            println!("docket: index stats");
            println!("===================");
            println!();
            println!("  Database:    {}", docket.config().db.path.display());
            println!("  Model:       {} ({} dims)", idx.model, idx.dims);
            println!();
            println!("  Records:     {}", idx.total_records);
            println!("  Active:      {}", idx.active_records);
            println!("  Superseded:  {}", idx.superseded_records);
            println!("  Historical:  {}", idx.historical_records);
            println!("  Live:        {}", idx.live_records);
            println!("  Graph nodes: {}", idx.graph_nodes);
            if let Some(last) = idx.last_ingested_at {
                println!("  Last ingest: {}", last.to_rfc3339());
            }
            println!();
            if stats.cache_enabled {
                println!(
                    "  Cache:       {} entries, {} hits, {} misses",
                    stats.cache.entries, stats.cache.hits, stats.cache.misses
                );
            } else {
                println!("  Cache:       disabled");
            }
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}
