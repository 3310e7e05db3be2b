mod auth;
mod config;
mod entity;
mod error;
mod extract;
mod navigator;
mod page;
mod pipeline;
mod service;
mod store;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::{Credentials, RunConfig, SiteProfile};
use crate::navigator::HttpNavigator;
use crate::service::{RunResultSummary, Service};
use crate::store::Store;

#[derive(Parser)]
#[command(name = "gated_harvest", about = "Sign in, walk a listing and store every linked entity")]
struct Cli {
    /// SQLite file holding extracted entities
    #[arg(long, global = true, default_value = store::DEFAULT_DB_PATH)]
    db: PathBuf,
    /// Site profile (JSON); built-in defaults when omitted
    #[arg(long, global = true)]
    profile: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Authenticate, collect the listing and extract every candidate
    Run {
        /// Listing location to collect candidates from
        #[arg(short, long)]
        query: String,
    },
    /// Stored entities table
    Entities {
        /// Max rows to display
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },
    /// Show store statistics
    Stats,
    /// Answer JSON-lines requests on stdin/stdout
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { query } => {
            let service = build_service(&cli.db, cli.profile.as_deref())?;
            let config = RunConfig {
                credentials: Credentials::from_env()?,
                listing_query: query,
            };

            let cancel = CancellationToken::new();
            let interrupt = {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    while tokio::signal::ctrl_c().await.is_ok() {
                        if cancel.is_cancelled() {
                            warn!("second interrupt, exiting immediately");
                            std::process::exit(130);
                        }
                        warn!("interrupt received, stopping after the current entity");
                        cancel.cancel();
                    }
                })
            };
            let result = service.start_run_with(config, cancel).await;
            interrupt.abort();

            for failure in &result.failures {
                println!(
                    "  failed [{}] {}: {}",
                    failure.step, failure.identifier, failure.reason
                );
            }
            let summary = RunResultSummary::from(&result);
            println!("{} in {}", summary.message, format_duration(result.elapsed));
            if summary.success {
                Ok(())
            } else {
                Err(anyhow::anyhow!(summary.message))
            }
        }
        Commands::Entities { limit } => {
            let store = Store::open_at(&cli.db)?;
            let rows = store.list(Some(limit))?;
            if rows.is_empty() {
                println!("No entities stored. Run 'run' first.");
                return Ok(());
            }

            let columns: BTreeSet<&str> = rows
                .iter()
                .flat_map(|e| e.fields.keys().map(String::as_str))
                .collect();

            let mut header = format!("{:>3} | {:<48}", "#", "Identifier");
            for c in &columns {
                header.push_str(&format!(" | {:<24}", c));
            }
            header.push_str(&format!(" | {:<19}", "Extracted"));
            println!("{}", header);
            println!("{}", "-".repeat(header.chars().count()));

            for (i, e) in rows.iter().enumerate() {
                let mut line = format!("{:>3} | {:<48}", i + 1, truncate(&e.identifier, 48));
                for c in &columns {
                    let value = e.field(c).unwrap_or("");
                    line.push_str(&format!(" | {:<24}", truncate(value, 24)));
                }
                line.push_str(&format!(
                    " | {:<19}",
                    e.extracted_at.format("%Y-%m-%d %H:%M:%S")
                ));
                println!("{}", line);
            }

            println!("\n{} entities", rows.len());
            Ok(())
        }
        Commands::Stats => {
            let store = Store::open_at(&cli.db)?;
            let s = store.stats()?;
            println!("Entities:   {}", s.total);
            match s.last_write {
                Some(at) => println!("Last write: {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
                None => println!("Last write: -"),
            }
            Ok(())
        }
        Commands::Serve => {
            let service = build_service(&cli.db, cli.profile.as_deref())?;
            let interrupt = {
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    while tokio::signal::ctrl_c().await.is_ok() {
                        if !service.cancel_current() {
                            warn!("interrupt with no run in progress, exiting");
                            std::process::exit(130);
                        }
                        warn!("interrupt received, cancelling the current run");
                    }
                })
            };
            let handle = service::spawn(service);
            let served = service::serve_lines(
                &handle,
                BufReader::new(tokio::io::stdin()),
                tokio::io::stdout(),
            )
            .await;
            interrupt.abort();
            served
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        eprintln!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn build_service(db: &Path, profile: Option<&Path>) -> anyhow::Result<Arc<Service<HttpNavigator>>> {
    let profile = match profile {
        Some(path) => SiteProfile::load(path)?,
        None => SiteProfile::default(),
    };
    let store = Store::open_at(db)?;
    let service = Service::new(store, profile, Box::new(HttpNavigator::new))?;
    Ok(Arc::new(service))
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
