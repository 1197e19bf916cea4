mod ai;
mod classify;
mod config;
mod db;
mod dispatch;
mod extract;
mod fallback;
mod fetch;
mod models;
mod pipeline;
mod profile;
mod retry;
mod score;
mod search;
mod stage;
mod text;
mod worker;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::ai::ModelRouter;
use crate::config::PipelineConfig;
use crate::db::Database;
use crate::fetch::HttpFetcher;
use crate::models::{JobPosting, NewJobPosting};
use crate::pipeline::{Pipeline, Trigger, TriggerReason};
use crate::profile::JsonProfileStore;
use crate::search::GoogleSearch;
use crate::stage::{Stage, StageService};
use crate::text::truncate;
use crate::worker::spawn_worker;

#[derive(Parser)]
#[command(name = "scout")]
#[command(about = "Discover, score and track job postings for a user profile")]
struct Cli {
    /// Database file (defaults to the platform data directory)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Directory holding <user>.json profiles
    #[arg(long, global = true)]
    profiles: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Run discovery once for a user
    Discover {
        /// User id (profile file name without .json)
        user: String,
    },

    /// Read user ids from stdin, one per line, and run discovery for each
    Listen,

    /// List stored postings
    List {
        /// Only postings for this user
        #[arg(short, long)]
        user: Option<String>,

        /// Filter by stage (default, wishlist, applied, interview, offer, rejected)
        #[arg(short, long)]
        stage: Option<Stage>,
    },

    /// Show posting details
    Show {
        /// Posting ID
        id: i64,
    },

    /// Move a posting to another stage
    Stage {
        /// Posting ID
        id: i64,

        /// Target stage
        stage: Stage,

        #[arg(short, long)]
        user: String,
    },

    /// Attach a note to a posting (empty text clears it)
    Note {
        /// Posting ID
        id: i64,

        text: String,

        #[arg(short, long)]
        user: String,
    },

    /// Track a job found elsewhere
    Wishlist {
        #[arg(short, long)]
        user: String,

        #[arg(short, long)]
        title: String,

        #[arg(short, long)]
        company: String,

        /// Posting URL
        #[arg(long)]
        url: String,

        #[arg(short, long)]
        location: Option<String>,
    },

    /// Delete a posting
    Delete {
        /// Posting ID
        id: i64,

        #[arg(short, long)]
        user: String,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,scout=debug".into()))
        .with(fmt::layer())
        .init();
}

fn open_database(path: Option<&PathBuf>) -> Result<Database> {
    match path {
        Some(path) => Database::open_at(path),
        None => Database::open(),
    }
}

fn profile_store(dir: Option<PathBuf>) -> Result<JsonProfileStore> {
    match dir {
        Some(dir) => Ok(JsonProfileStore::new(dir)),
        None => JsonProfileStore::open_default(),
    }
}

/// Wires the live search, fetch and model backends into a pipeline.
fn build_pipeline(db: Arc<Database>, profiles: JsonProfileStore) -> Result<Pipeline> {
    let mut config = PipelineConfig::from_env()?;

    let (router, usable) = ModelRouter::for_models(&config.models).context("Failed to set up text models")?;
    if usable.len() < config.models.len() {
        warn!(configured = ?config.models, usable = ?usable, "Some models are unavailable");
    }
    config.models = usable;

    let search = GoogleSearch::new()?;
    let fetcher = HttpFetcher::new(config.fetch_timeout)?;

    info!(
        profiles = %profiles.dir().display(),
        models = ?config.models,
        retry_budget_secs = config.retry.total_budget(config.models.len()).as_secs(),
        "Pipeline ready"
    );

    Ok(Pipeline::new(
        Arc::new(config),
        db,
        Arc::new(profiles),
        Arc::new(search),
        Arc::new(fetcher),
        Arc::new(router),
    ))
}

fn format_salary(job: &JobPosting) -> String {
    match (job.salary_min, job.salary_max) {
        (0, 0) => "-".to_string(),
        (min, max) if min == max => format!("{} {}", job.currency, min),
        (min, 0) => format!("{} {}+", job.currency, min),
        (min, max) => format!("{} {}-{}", job.currency, min, max),
    }
    .trim()
    .to_string()
}

fn print_list(label: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    println!("\n{}:", label);
    for item in items {
        println!("  - {}", item);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let db = Arc::new(open_database(cli.db.as_ref())?);

    match cli.command {
        Commands::Init => {
            db.init()?;
            println!("Database initialized at {}", db.path().display());
        }

        Commands::Discover { user } => {
            db.ensure_initialized()?;
            let pipeline = build_pipeline(db.clone(), profile_store(cli.profiles)?)?;
            let report = pipeline.run(&Trigger::new(user.as_str(), TriggerReason::Manual)).await?;

            println!("{}", report);
            println!("Postings stored for {}: {}", user, db.count_for_user(&user)?);
        }

        Commands::Listen => {
            db.ensure_initialized()?;
            let pipeline = Arc::new(build_pipeline(db.clone(), profile_store(cli.profiles)?)?);
            let (sender, handle) = spawn_worker(pipeline);

            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
                let user = line.trim();
                if user.is_empty() {
                    continue;
                }
                if !sender.send(Trigger::new(user, TriggerReason::ProfileUpdated))? {
                    println!("Run for {} already queued", user);
                }
            }

            drop(sender);
            let runs = handle.await.context("Discovery worker panicked")?;
            println!("Completed {} run(s)", runs);
        }

        Commands::List { user, stage } => {
            db.ensure_initialized()?;
            let postings = db.list_postings(user.as_deref(), stage)?;
            if postings.is_empty() {
                println!("No postings found.");
            } else {
                println!(
                    "{:<6} {:<13} {:>5} {:<30} {:<20} {:<18}",
                    "ID", "STAGE", "SCORE", "TITLE", "COMPANY", "LOCATION"
                );
                println!("{}", "-".repeat(97));
                for job in postings {
                    println!(
                        "{:<6} {:<13} {:>5} {:<30} {:<20} {:<18}",
                        job.id,
                        job.stage.label(),
                        job.match_score,
                        truncate(&job.title, 28),
                        truncate(&job.company, 18),
                        truncate(&job.location, 16)
                    );
                }
            }
        }

        Commands::Show { id } => {
            db.ensure_initialized()?;
            match db.get_posting(id)? {
                Some(job) => {
                    println!("Posting #{}", job.id);
                    println!("Title: {}", job.title);
                    println!("Company: {}", job.company);
                    println!("Location: {}", job.location);
                    if job.stage.is_terminal() {
                        println!("Stage: {} (closed)", job.stage.label());
                    } else {
                        println!("Stage: {}", job.stage.label());
                    }
                    println!("Match: {}/100", job.match_score);
                    if !job.employment_type.is_empty() {
                        println!("Type: {}", job.employment_type);
                    }
                    if !job.remote_type.is_empty() {
                        println!("Remote: {}", job.remote_type);
                    }
                    println!("Salary: {}", format_salary(&job));
                    println!("URL: {}", job.source_url);
                    if let Some(posted) = &job.posted_at {
                        println!("Posted: {}", posted);
                    }
                    println!("Found: {}", job.created_at);
                    if let Some(note) = &job.note {
                        println!("Note: {}", note);
                    }
                    if !job.ai_summary.is_empty() {
                        println!("\n--- Match ---\n{}", textwrap::fill(&job.ai_summary, 80));
                    }
                    print_list("Skills", &job.skills);
                    print_list("Responsibilities", &job.responsibilities);
                    print_list("Qualifications", &job.qualifications);
                    if !job.description.is_empty() {
                        println!("\n--- Description ---\n{}", textwrap::fill(&job.description, 80));
                    }
                }
                None => {
                    println!("Posting #{} not found.", id);
                }
            }
        }

        Commands::Stage { id, stage, user } => {
            db.ensure_initialized()?;
            let posting = StageService::new(db).transition(&user, id, stage)?;
            println!("Posting #{} is now {}.", posting.id, posting.stage.label());
        }

        Commands::Note { id, text, user } => {
            db.ensure_initialized()?;
            StageService::new(db).set_note(&user, id, Some(&text))?;
            if text.trim().is_empty() {
                println!("Cleared note on posting #{}.", id);
            } else {
                println!("Saved note on posting #{}.", id);
            }
        }

        Commands::Wishlist {
            user,
            title,
            company,
            url,
            location,
        } => {
            db.ensure_initialized()?;
            let id = StageService::new(db).wishlist(NewJobPosting {
                user_id: user,
                title,
                company,
                location: location.unwrap_or_default(),
                source_url: url,
                ..NewJobPosting::default()
            })?;
            println!("Added posting #{} to the wishlist.", id);
        }

        Commands::Delete { id, user } => {
            db.ensure_initialized()?;
            StageService::new(db).delete(&user, id)?;
            println!("Deleted posting #{}.", id);
        }
    }

    Ok(())
}
