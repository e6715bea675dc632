//! Marketpost CLI - operator commands against the daemon's SQLite store

use anyhow::{bail, Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::sync::Arc;
use tabled::{Table, Tabled};

use marketpost_core::application::{
    EnqueueOutcome, LeaseManager, MaintenanceScheduler, RateLimiter, SubjectDraft, SubjectService,
};
use marketpost_core::domain::{ApiEnvironment, Job, JobStatus, RateLimitStatus};
use marketpost_core::port::id_provider::UuidProvider;
use marketpost_core::port::time_provider::SystemTimeProvider;
use marketpost_core::port::{Maintenance, VersionedStore};
use marketpost_daemon::Settings;
use marketpost_infra_sqlite::{create_pool, run_migrations, SqliteMaintenance, SqliteRecordStore};

#[derive(Parser)]
#[command(name = "marketpost")]
#[command(about = "Marketpost operator CLI", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Database path or sqlite: URL (defaults to the daemon's configured database)
    #[arg(long, env = "MARKETPOST_DB")]
    db: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage subjects
    Subject {
        #[command(subcommand)]
        command: SubjectCommands,
    },

    /// Enqueue a posting job for a pending subject
    Enqueue {
        /// Subject ID
        subject_id: String,
    },

    /// List jobs
    Jobs {
        /// Only jobs in this status (queued, running, succeeded, failed)
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Re-enqueue subjects whose latest job failed with an error code
    Requeue {
        /// Error code, e.g. REAUTHORIZATION_REQUIRED
        #[arg(long)]
        code: String,
    },

    /// Show posting cadence for a worker
    RateLimit {
        /// Worker ID whose history to show
        #[arg(short, long)]
        worker: String,

        /// Only this destination (default: every configured destination)
        #[arg(short, long)]
        destination: Option<String>,
    },

    /// Run maintenance operations
    Maintenance {
        /// Force VACUUM even if under the size threshold
        #[arg(long)]
        force_vacuum: bool,
    },

    /// Show job counts and store size
    Status,

    /// Recover marketplace credentials after the refresh token was rejected
    Auth {
        #[command(subcommand)]
        command: AuthCommands,
    },
}

#[derive(Subcommand)]
enum AuthCommands {
    /// Print the consent page URL for the configured application
    Url,

    /// Exchange an authorization code from the consent redirect
    Code {
        /// Code from the redirect's `code` query parameter
        code: String,
    },

    /// Replace the stored refresh token
    SetRefreshToken {
        /// Refresh token issued for the configured environment
        token: String,
    },
}

#[derive(Subcommand)]
enum SubjectCommands {
    /// Create or update a subject
    Put {
        /// Subject ID
        id: String,

        #[arg(short, long)]
        title: String,

        /// Destination name; repeat for several
        #[arg(short, long = "destination", required = true)]
        destinations: Vec<String>,

        /// Payload as JSON string
        #[arg(long, default_value = "{}")]
        payload: String,

        /// Save without moving an existing subject back to pending
        #[arg(long)]
        no_trigger: bool,
    },
}

#[derive(Tabled)]
struct JobRow {
    id: String,
    subject: String,
    status: String,
    attempts: u32,
    created: String,
    lease_owner: String,
    error: String,
}

impl From<&Job> for JobRow {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            subject: job.subject_id.clone(),
            status: job.status.to_string(),
            attempts: job.attempts,
            created: format_millis(Some(job.created_at)),
            lease_owner: job.lease_owner.clone().unwrap_or_else(|| "-".to_string()),
            error: job
                .last_error
                .as_ref()
                .map(|e| e.code.clone())
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

#[derive(Tabled)]
struct RateLimitRow {
    destination: String,
    posted_24h: String,
    min_gap: String,
    last_post: String,
    next_available: String,
}

impl From<&RateLimitStatus> for RateLimitRow {
    fn from(status: &RateLimitStatus) -> Self {
        Self {
            destination: status.destination.clone(),
            posted_24h: match status.max_per_day {
                Some(max) => format!("{}/{}", status.daily_count, max),
                None => format!("{}/-", status.daily_count),
            },
            min_gap: status
                .min_gap_ms
                .map(|ms| format!("{}m", ms / 60_000))
                .unwrap_or_else(|| "-".to_string()),
            last_post: format_millis(status.last_post_at),
            next_available: status
                .next_available_at
                .map(|t| format_millis(Some(t)))
                .unwrap_or_else(|| "now".to_string()),
        }
    }
}

fn format_millis(millis: Option<i64>) -> String {
    millis
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn print_credentials_stored(environment: ApiEnvironment) {
    println!(
        "{} {}",
        "✓ Credentials stored for".green().bold(),
        environment
    );
    println!("Requeue rejected jobs with: marketpost requeue --code REAUTHORIZATION_REQUIRED");
}

fn parse_status(status: &str) -> Result<JobStatus> {
    status
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid --status: {}", e))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load()?;
    if let Some(db) = cli.db {
        settings.database.path = Some(db);
    }

    let pool = create_pool(&settings.database_url()?)
        .await
        .context("Failed to open database")?;
    run_migrations(&pool).await.context("Migration failed")?;

    let time_provider = Arc::new(SystemTimeProvider);
    let id_provider = Arc::new(UuidProvider);
    let store: Arc<dyn VersionedStore> = Arc::new(SqliteRecordStore::new(pool.clone()));
    let leases = LeaseManager::new(store.clone(), time_provider.clone(), id_provider.clone());

    match cli.command {
        Commands::Subject {
            command:
                SubjectCommands::Put {
                    id,
                    title,
                    destinations,
                    payload,
                    no_trigger,
                },
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("Invalid JSON payload")?;
            let subjects = SubjectService::new(store.clone(), time_provider.clone());
            let subject = subjects
                .upsert(
                    SubjectDraft {
                        id,
                        title,
                        destinations,
                        payload,
                    },
                    !no_trigger,
                )
                .await?;

            println!(
                "{} {} ({})",
                "✓ Subject saved:".green().bold(),
                subject.id,
                subject.status
            );
        }

        Commands::Enqueue { subject_id } => match leases.enqueue(&subject_id).await? {
            EnqueueOutcome::Enqueued(job_id) => {
                println!("{} {}", "✓ Job enqueued:".green().bold(), job_id);
            }
            EnqueueOutcome::AlreadyActive(job_id) => {
                println!("{} {}", "○ Subject already has a live job:".yellow(), job_id);
            }
            EnqueueOutcome::NotTriggered(status) => {
                bail!("subject {} is {}, not pending", subject_id, status);
            }
        },

        Commands::Jobs { status } => {
            let status = status.as_deref().map(parse_status).transpose()?;
            let jobs = leases.list_jobs(status).await?;
            if jobs.is_empty() {
                println!("{}", "No jobs".yellow());
            } else {
                let rows: Vec<JobRow> = jobs.iter().map(JobRow::from).collect();
                println!("{}", Table::new(rows));
            }
        }

        Commands::Requeue { code } => {
            let requeued = leases.requeue_failed(&code).await?;
            if requeued.is_empty() {
                println!("{}", format!("No failed subjects with code {}", code).yellow());
            } else {
                println!(
                    "{}",
                    format!("✓ Requeued {} subject(s)", requeued.len())
                        .green()
                        .bold()
                );
                for job_id in requeued {
                    println!("  • {}", job_id);
                }
            }
        }

        Commands::RateLimit {
            worker,
            destination,
        } => {
            let limiter = RateLimiter::new(
                store.clone(),
                time_provider.clone(),
                id_provider,
                settings.rate_limits(),
            );
            let destinations = match destination {
                Some(d) => vec![d],
                None => limiter.destinations(),
            };
            let mut rows = Vec::with_capacity(destinations.len());
            for destination in destinations {
                let status = limiter.status(&destination, &worker).await?;
                rows.push(RateLimitRow::from(&status));
            }
            println!("{}", format!("Rate limits for {}", worker).cyan().bold());
            println!("{}", Table::new(rows));
        }

        Commands::Maintenance { force_vacuum } => {
            println!("{}", "Running maintenance...".cyan().bold());
            println!();

            let maintenance = Arc::new(SqliteMaintenance::new(pool, time_provider));
            let before = maintenance.get_stats().await?;
            let scheduler = MaintenanceScheduler::new(
                maintenance.clone(),
                settings.maintenance_config(),
                settings.maintenance.interval_hours,
            );
            let after = scheduler.run_now().await?;
            if force_vacuum {
                let reclaimed = maintenance.vacuum().await?;
                println!("  {} VACUUM reclaimed {:.2} MB", "✓".green(), reclaimed);
            }

            println!(
                "  {} {} finished jobs removed",
                "✓".green(),
                before.job_count - after.job_count
            );
            println!(
                "  {} {} posting history records removed",
                "✓".green(),
                before.posting_history_count - after.posting_history_count
            );
            println!(
                "  {} {:.2} MB → {:.2} MB",
                "DB Size:".bold(),
                before.db_size_mb,
                after.db_size_mb
            );
        }

        Commands::Status => {
            let counts = leases.count_by_status().await?;
            let stats = SqliteMaintenance::new(pool, time_provider)
                .get_stats()
                .await?;

            println!("{}", "System Status".cyan().bold());
            println!();
            for status in [
                JobStatus::Queued,
                JobStatus::Running,
                JobStatus::Succeeded,
                JobStatus::Failed,
            ] {
                let count = counts.get(&status).copied().unwrap_or(0);
                println!("  {:<10} {}", format!("{}:", status).bold(), count);
            }
            println!();
            println!("  {} {:.2} MB", "DB Size:".bold(), stats.db_size_mb);
            println!(
                "  {} {}",
                "Posting history:".bold(),
                stats.posting_history_count
            );
        }

        Commands::Auth { command } => match command {
            AuthCommands::Url => {
                println!("{}", "Open this URL and approve access:".cyan().bold());
                println!("{}", settings.authorize_url()?);
                println!();
                println!("Then run: marketpost auth code <code>");
            }
            AuthCommands::Code { code } => {
                let tokens = settings.token_manager(store.clone(), time_provider.clone())?;
                tokens
                    .authorize_with_code(&code)
                    .await
                    .context("Authorization code exchange failed")?;
                print_credentials_stored(tokens.environment());
            }
            AuthCommands::SetRefreshToken { token } => {
                let tokens = settings.token_manager(store.clone(), time_provider.clone())?;
                tokens
                    .install_refresh_token(&token)
                    .await
                    .context("Failed to store refresh token")?;
                print_credentials_stored(tokens.environment());
            }
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_subject_put_requires_a_destination() {
        let parsed = Cli::try_parse_from(["marketpost", "subject", "put", "inv-1", "--title", "Lamp"]);
        assert!(parsed.is_err());

        let parsed = Cli::try_parse_from([
            "marketpost", "subject", "put", "inv-1", "--title", "Lamp", "-d", "facebook", "-d",
            "craigslist",
        ])
        .unwrap();
        match parsed.command {
            Commands::Subject {
                command: SubjectCommands::Put { destinations, .. },
            } => assert_eq!(destinations, vec!["facebook", "craigslist"]),
            _ => panic!("expected subject put"),
        }
    }

    #[test]
    fn test_auth_subcommands_parse() {
        let parsed = Cli::try_parse_from(["marketpost", "auth", "code", "v^1.1#abc"]).unwrap();
        match parsed.command {
            Commands::Auth {
                command: AuthCommands::Code { code },
            } => assert_eq!(code, "v^1.1#abc"),
            _ => panic!("expected auth code"),
        }

        let parsed =
            Cli::try_parse_from(["marketpost", "auth", "set-refresh-token", "renewed"]).unwrap();
        assert!(matches!(
            parsed.command,
            Commands::Auth {
                command: AuthCommands::SetRefreshToken { .. }
            }
        ));
        assert!(Cli::try_parse_from(["marketpost", "auth", "code"]).is_err());
    }

    #[test]
    fn test_parse_status_rejects_unknown() {
        assert_eq!(parse_status("failed").unwrap(), JobStatus::Failed);
        assert!(parse_status("done").is_err());
    }

    #[test]
    fn test_format_millis() {
        assert_eq!(format_millis(Some(0)), "1970-01-01 00:00:00");
        assert_eq!(format_millis(None), "-");
    }
}
