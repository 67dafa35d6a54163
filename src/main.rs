mod content;
mod crawl;
mod db;
mod error;
mod fetch;
mod parser;
mod schedule;
mod settings;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use url::Url;

use crate::content::ContentDir;
use crate::crawl::Crawler;
use crate::db::{MetadataStore, NewScheduleEntry, UpsertOutcome};
use crate::fetch::EngineFetcher;
use crate::settings::Settings;

#[derive(Parser)]
#[command(name = "site_scraper", about = "Scheduled site crawler and raw page structurer")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the metadata store schema
    Init,
    /// Manage the crawl schedule
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
    /// Crawl due sites until none is due
    Crawl {
        /// Stop after one site
        #[arg(long)]
        once: bool,
    },
    /// Structure saved pages into parsed documents
    Parse {
        /// Content directory (default: RAW_DATA_DIR)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Crawl every due site, then parse
    Run,
    /// Show store statistics
    Stats,
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// Register a site (or update an existing one by URL)
    Add {
        url: String,
        #[arg(short, long)]
        title: Option<String>,
        /// Crawl interval in hours
        #[arg(long, default_value_t = 24, value_parser = clap::value_parser!(u32).range(1..))]
        interval_hours: u32,
    },
    /// List registered sites
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = Settings::load()?;
    let store = db::connect(&settings)
        .await
        .context("Cannot open metadata store")?;

    let result = match cli.command {
        Commands::Init => {
            println!("Schema ready ({:?} backend).", settings.store_backend);
            Ok(())
        }
        Commands::Schedule { action } => run_schedule(store.as_ref(), action).await,
        Commands::Crawl { once } => crawl_loop(&settings, Arc::clone(&store), once).await,
        Commands::Parse { dir } => {
            let root = dir.unwrap_or_else(|| settings.raw_data_dir.clone());
            parse(store.as_ref(), &root).await
        }
        Commands::Run => {
            let t_crawl = Instant::now();
            crawl_loop(&settings, Arc::clone(&store), false).await?;
            println!("Crawled in {}", format_duration(t_crawl.elapsed()));

            let t_parse = Instant::now();
            parse(store.as_ref(), &settings.raw_data_dir).await?;
            println!("Parsed in {}", format_duration(t_parse.elapsed()));
            Ok(())
        }
        Commands::Stats => {
            let s = store.stats().await?;
            let due = schedule::due_count(&store.active_schedule().await?, Utc::now());
            println!("Pages:        {}", s.pages);
            println!("Parsed pages: {}", s.parsed_pages);
            println!("Sites:        {}", s.schedule_entries);
            println!("Active:       {}", s.active_entries);
            println!("Due now:      {}", due);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

async fn run_schedule(store: &dyn MetadataStore, action: ScheduleAction) -> anyhow::Result<()> {
    match action {
        ScheduleAction::Add { url, title, interval_hours } => {
            let url = url.trim().to_string();
            let parsed = Url::parse(&url).with_context(|| format!("Not an absolute URL: {url}"))?;
            let title = title.unwrap_or_else(|| parsed.host_str().unwrap_or(&url).to_string());
            let entry = NewScheduleEntry {
                title,
                url,
                interval_secs: i64::from(interval_hours) * 3600,
            };
            match store.add_schedule_entry(&entry).await? {
                UpsertOutcome::Created => println!("Added {} ({})", entry.url, entry.title),
                UpsertOutcome::Updated => println!("Updated {} ({})", entry.url, entry.title),
            }
            Ok(())
        }
        ScheduleAction::List => {
            let entries = store.list_schedule().await?;
            if entries.is_empty() {
                println!("No sites scheduled. Add one with 'schedule add <url>'.");
                return Ok(());
            }
            let now = Utc::now();
            println!(
                "{:>3} | {:<24} | {:<40} | {:>6} | {:<16} | {:<3}",
                "#", "Title", "URL", "Every", "Last scraped", "Due"
            );
            println!("{}", "-".repeat(108));
            for e in &entries {
                let last = e
                    .scraped_at
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "never".into());
                let due = if !e.is_active {
                    "off"
                } else if schedule::is_due(e, now) {
                    "yes"
                } else {
                    "no"
                };
                println!(
                    "{:>3} | {:<24} | {:<40} | {:>5}h | {:<16} | {:<3}",
                    e.id,
                    truncate(&e.title, 24),
                    truncate(&e.url, 40),
                    e.interval_secs / 3600,
                    last,
                    due
                );
            }
            Ok(())
        }
    }
}

/// Crawl due sites until none is left, then close the browser.
async fn crawl_loop(settings: &Settings, store: Arc<dyn MetadataStore>, once: bool) -> anyhow::Result<()> {
    let fetcher = Arc::new(EngineFetcher::new(settings)?);
    let crawler = Crawler::new(
        Arc::clone(&fetcher) as Arc<dyn fetch::Fetcher>,
        Arc::clone(&store),
        ContentDir::new(&settings.raw_data_dir),
        settings.effective_concurrency(),
    );

    let result = schedule::run_due(store.as_ref(), &crawler, once).await;
    fetcher.shutdown().await;
    let runs = result.context("Crawl schedule unavailable")?;

    if runs.is_empty() {
        println!("No sites due.");
    }
    for run in &runs {
        match run.summary {
            Some(s) => println!(
                "{}: {} fetched, {} persisted, {} files, {} failed",
                run.entry.url, s.fetched, s.persisted, s.saved_files, s.failed
            ),
            None => println!("{}: skipped, start URL unusable", run.entry.url),
        }
    }
    Ok(())
}

async fn parse(store: &dyn MetadataStore, root: &std::path::Path) -> anyhow::Result<()> {
    let summary = parser::batch::parse_content_dir(store, root).await?;
    summary.print();
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
