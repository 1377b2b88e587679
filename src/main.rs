//! # Docs Harness CLI (`dsh`)
//!
//! The `dsh` binary is the primary interface for Docs Harness. It provides
//! commands for database initialization, project management, scraping,
//! search, document retrieval, and starting the HTTP query server.
//!
//! ## Usage
//!
//! ```bash
//! dsh --config ./config/dsh.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dsh init` | Create the SQLite database and run schema migrations |
//! | `dsh project add <id> <url>` | Register a documentation site |
//! | `dsh project list` | List registered projects and their states |
//! | `dsh project remove <id>` | Delete a project and all its data |
//! | `dsh scrape <id>` | Crawl a project and rebuild its search index |
//! | `dsh status <id>` | Show a project's state and statistics |
//! | `dsh search "<query>"` | Search indexed documentation |
//! | `dsh get <project> <path>` | Print a stored document |
//! | `dsh serve` | Start the HTTP API server |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! dsh init
//!
//! # Register and scrape the Tokio docs
//! dsh project add tokio https://tokio.rs --max-depth 4
//! dsh scrape tokio
//!
//! # Search across all projects
//! dsh search "graceful shutdown"
//!
//! # Start the API server for AI-assistant integration
//! dsh serve
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use docs_harness::config::{self, Config};
use docs_harness::embedding;
use docs_harness::fetch::HttpFetcher;
use docs_harness::index::{IndexManager, KeywordBackend, SearchBackend, VectorBackend};
use docs_harness::lifecycle::LifecycleManager;
use docs_harness::models::{ProjectConfigPatch, Selectors};
use docs_harness::robots::RobotsMode;
use docs_harness::{db, notify, search, server, store};

/// Docs Harness CLI — a documentation crawler and local search knowledge
/// base for AI assistants.
#[derive(Parser)]
#[command(
    name = "dsh",
    about = "Docs Harness — crawl documentation sites into a local, searchable knowledge base",
    version,
    long_about = "Docs Harness crawls documentation websites into a local SQLite knowledge base, \
    builds keyword (and optionally vector) search indexes, and serves queries over a JSON HTTP API \
    for AI-assistant integration."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/dsh.toml`. Storage, server, crawl, search,
    /// embedding, and webhook settings are read from this file.
    #[arg(long, global = true, default_value = "./config/dsh.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables (projects,
    /// documents, docs_fts, doc_vectors, index_state). This command is
    /// idempotent — running it multiple times is safe.
    Init,

    /// Manage documentation projects.
    Project {
        #[command(subcommand)]
        action: ProjectAction,
    },

    /// Crawl a project and rebuild its search index.
    ///
    /// Runs the crawl in the foreground and prints a summary when done.
    /// Incremental by default: previously scraped pages that were not
    /// re-visited are kept. Use `--full` to prune them.
    Scrape {
        /// Project id.
        id: String,

        /// Prune documents that this crawl did not visit.
        #[arg(long)]
        full: bool,
    },

    /// Show a project's state, statistics, and last scrape outcome.
    Status {
        /// Project id.
        id: String,
    },

    /// Search indexed documentation.
    ///
    /// Queries the published search indexes and prints ranked results with
    /// normalized scores and snippets.
    Search {
        /// The search query string.
        query: String,

        /// Restrict the search to one project.
        #[arg(long)]
        project: Option<String>,

        /// Maximum number of results to return.
        #[arg(long)]
        limit: Option<i64>,
    },

    /// Print a stored document.
    Get {
        /// Project id.
        project: String,

        /// Document path (as shown in search results).
        path: String,
    },

    /// Start the HTTP API server.
    ///
    /// Binds to the address configured in `[server].bind` and serves the
    /// project, scrape, search, and document endpoints.
    Serve,
}

/// Project management subcommands.
#[derive(Subcommand)]
enum ProjectAction {
    /// Register a new documentation site.
    ///
    /// Crawl settings not given here are filled in from the `[crawl]`
    /// section of the config file and frozen into the project.
    Add {
        /// Project id (letters, digits, `-`, `_`; max 64 characters).
        id: String,

        /// Base URL to crawl from (http or https).
        base_url: String,

        /// Maximum link depth from the base URL (1-20).
        #[arg(long)]
        max_depth: Option<u32>,

        /// Maximum number of pages to fetch.
        #[arg(long)]
        max_pages: Option<u32>,

        /// Only crawl URLs matching one of these glob patterns (repeatable).
        #[arg(long = "include")]
        include: Vec<String>,

        /// Never crawl URLs matching one of these glob patterns (repeatable).
        #[arg(long = "exclude")]
        exclude: Vec<String>,

        /// Minimum delay between requests to the same host, in milliseconds.
        #[arg(long)]
        rate_limit_ms: Option<u64>,

        /// robots.txt handling: `strict`, `permissive`, or `ignore`.
        #[arg(long)]
        robots: Option<String>,

        /// CSS selector for the page content root.
        #[arg(long)]
        content_selector: Option<String>,

        /// Also build a vector index (requires an embedding provider).
        #[arg(long)]
        vector: bool,
    },

    /// List registered projects and their states.
    List,

    /// Delete a project, its documents, and its indexes.
    Remove {
        /// Project id.
        id: String,
    },
}

fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("docs_harness=info,dsh=info,warn"),
            1 => EnvFilter::new("docs_harness=debug,dsh=debug,info"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn build_manager(cfg: Config) -> anyhow::Result<Arc<LifecycleManager>> {
    let cfg = Arc::new(cfg);
    let pool = db::connect(&cfg).await?;

    let mut backends: Vec<Arc<dyn SearchBackend>> = vec![Arc::new(KeywordBackend)];
    if let Some(provider) = embedding::create_provider(&cfg.embedding)? {
        backends.push(Arc::new(VectorBackend::new(provider, cfg.embedding.clone())));
    }
    let index = Arc::new(IndexManager::new(backends));

    let fetcher = Arc::new(HttpFetcher::new(
        &cfg.crawl.user_agent,
        Duration::from_secs(cfg.crawl.request_timeout_secs),
    )?);
    let sink = notify::sink_from_config(&cfg.webhook)?;

    Ok(Arc::new(LifecycleManager::new(
        pool, cfg, fetcher, index, sink,
    )))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose, cli.quiet);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            db::connect(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Project { action } => {
            let manager = build_manager(cfg).await?;
            match action {
                ProjectAction::Add {
                    id,
                    base_url,
                    max_depth,
                    max_pages,
                    include,
                    exclude,
                    rate_limit_ms,
                    robots,
                    content_selector,
                    vector,
                } => {
                    let robots_mode = match robots.as_deref() {
                        Some(s) => Some(RobotsMode::parse(s).ok_or_else(|| {
                            anyhow::anyhow!("invalid robots mode '{}' (strict/permissive/ignore)", s)
                        })?),
                        None => None,
                    };
                    let patch = ProjectConfigPatch {
                        max_depth,
                        max_pages,
                        include_patterns: (!include.is_empty()).then_some(include),
                        exclude_patterns: (!exclude.is_empty()).then_some(exclude),
                        rate_limit_delay_ms: rate_limit_ms,
                        robots_mode,
                        custom_selectors: content_selector.map(|css| Selectors {
                            content: Some(css),
                            ..Default::default()
                        }),
                        headers: None,
                        vector_index: vector.then_some(true),
                    };
                    let project = manager.create_project(&id, &base_url, patch).await?;
                    println!("Created project '{}' for {}", project.id, project.base_url);
                }
                ProjectAction::List => {
                    let projects = manager.list_projects().await?;
                    if projects.is_empty() {
                        println!("No projects registered.");
                    }
                    for p in projects {
                        println!(
                            "{:<24} {:<10} {:>6} pages  {}",
                            p.id,
                            p.state.as_str(),
                            p.pages_scraped,
                            p.base_url
                        );
                    }
                }
                ProjectAction::Remove { id } => {
                    manager.delete_project(&id).await?;
                    println!("Removed project '{}'.", id);
                }
            }
        }
        Commands::Scrape { id, full } => {
            let manager = build_manager(cfg).await?;
            let handle = manager.start_scrape(&id, full).await?;
            println!("Scraping '{}'...", id);
            handle.await?;

            let status = manager.status(&id).await?;
            println!(
                "Finished: state={} pages={} words={} errors={}",
                status.project.state.as_str(),
                status.stats.page_count,
                status.stats.total_words,
                status.project.page_errors,
            );
            if let Some(err) = status.project.last_error {
                println!("Last error: {}", err);
            }
        }
        Commands::Status { id } => {
            let manager = build_manager(cfg).await?;
            let status = manager.status(&id).await?;
            println!("Project:  {}", status.project.id);
            println!("URL:      {}", status.project.base_url);
            println!("State:    {}", status.project.state.as_str());
            println!("Pages:    {}", status.stats.page_count);
            println!("Words:    {}", status.stats.total_words);
            println!("Index:    {} bytes", status.stats.index_size_bytes);
            if let Some(at) = status.project.last_scraped_at {
                println!("Scraped:  {}", at.to_rfc3339());
            }
            if let Some(ms) = status.project.last_scrape_duration_ms {
                println!("Duration: {} ms", ms);
            }
            if let Some(err) = status.project.last_error {
                println!("Error:    {}", err);
            }
        }
        Commands::Search {
            query,
            project,
            limit,
        } => {
            let manager = build_manager(cfg).await?;
            let response = search::search(
                manager.pool(),
                manager.index(),
                &manager.config().search,
                &query,
                project.as_deref(),
                limit,
            )
            .await?;

            if response.results.is_empty() {
                println!("No results ({} ms).", response.query_time_ms);
            }
            for (i, r) in response.results.iter().enumerate() {
                println!("{}. [{:.3}] {} — {}", i + 1, r.score, r.title, r.url);
                println!("   {}/{}", r.project, r.path);
                if !r.snippet.is_empty() {
                    println!("   {}", r.snippet);
                }
            }
            if response.total > response.results.len() {
                println!(
                    "({} of {} results shown, {} ms)",
                    response.results.len(),
                    response.total,
                    response.query_time_ms
                );
            }
        }
        Commands::Get { project, path } => {
            let manager = build_manager(cfg).await?;
            match store::get_document(manager.pool(), &project, &path).await? {
                Some(doc) => {
                    println!("# {}", doc.title);
                    println!("URL: {}", doc.url);
                    println!("Scraped: {}", doc.scraped_at.to_rfc3339());
                    println!();
                    println!("{}", doc.body);
                }
                None => {
                    anyhow::bail!("document '{}' not found in project '{}'", path, project);
                }
            }
        }
        Commands::Serve => {
            let manager = build_manager(cfg).await?;
            server::serve(manager).await?;
        }
    }

    Ok(())
}
