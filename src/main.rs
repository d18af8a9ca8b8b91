use anyhow::{Context, Result};
use chrono::{Local, NaiveTime};
use clap::{Parser, Subcommand};

use pauser::config::{PauserConfig, CONFIG_ERROR_EXIT_CODE};
use pauser::controller::{Controller, ReconcileOutcome, RetryPolicy};
use pauser::jellyfin::{count_active, JellyfinClient};
use pauser::schedule::DesiredState;
use pauser::tdarr::TdarrClient;

#[derive(Parser)]
#[command(
    name = "pauser",
    about = "Playback-aware pause/resume controller for Tdarr transcode nodes",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control loop (the default when no subcommand is given)
    Run,

    /// Poll Jellyfin once and print session activity
    Status,

    /// Pause Tdarr transcode nodes now
    Pause {
        /// Also cancel in-flight worker items
        #[arg(long)]
        cancel_workers: bool,
    },

    /// Resume Tdarr transcode nodes now
    Resume,

    /// Show configured schedule windows and the desired state at a time
    Schedule {
        /// Evaluate at HH:MM instead of now
        #[arg(long)]
        at: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();

    // Configuration errors are fatal and non-retried, with their own exit
    // code so orchestrators can tell them apart from runtime failures.
    let config = match PauserConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            std::process::exit(CONFIG_ERROR_EXIT_CODE);
        }
    };

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            tracing::info!(
                poll_sec = config.poll_interval.as_secs(),
                jellyfin = %config.jellyfin_url,
                tdarr = %config.tdarr_url,
                windows = config.schedule.windows().len(),
                "Starting pauser daemon"
            );
            if config.jellyfin_api_key.is_none() {
                tracing::warn!(
                    "JELLYFIN_API_KEY is not set; session polling may fail if Jellyfin requires authentication"
                );
            }
            pauser::serve(config).await?;
        }
        Commands::Status => {
            let client = JellyfinClient::new(
                &config.jellyfin_url,
                config.jellyfin_api_key.clone(),
                config.call_timeout,
            )?;
            let sessions = client
                .sessions()
                .await
                .context("failed to fetch Jellyfin sessions")?;

            if sessions.is_empty() {
                println!("No Jellyfin sessions.");
            } else {
                println!("{:<20} | {:<20} | {:<8} | Media", "User", "Client", "Paused");
                println!("{:-<20}-|-{:-<20}-|-{:-<8}-|-{:-<10}", "", "", "", "");
                for s in &sessions {
                    println!(
                        "{:<20} | {:<20} | {:<8} | {}",
                        s.user_name.as_deref().unwrap_or("-"),
                        s.client.as_deref().unwrap_or("-"),
                        s.play_state
                            .as_ref()
                            .and_then(|p| p.is_paused)
                            .map(|p| p.to_string())
                            .unwrap_or_else(|| "-".to_string()),
                        s.now_playing_item
                            .as_ref()
                            .and_then(|n| n.media_type.as_deref())
                            .unwrap_or("-")
                    );
                }
            }
            println!("\n{} active video session(s)", count_active(&sessions));
        }
        Commands::Pause { cancel_workers } => {
            let outcome =
                transition(&config, DesiredState::Paused, cancel_workers || config.cancel_workers)
                    .await?;
            if outcome == ReconcileOutcome::Failed {
                anyhow::bail!("failed to pause Tdarr nodes");
            }
            println!("Tdarr nodes paused.");
        }
        Commands::Resume => {
            let outcome = transition(&config, DesiredState::Running, false).await?;
            if outcome == ReconcileOutcome::Failed {
                anyhow::bail!("failed to resume Tdarr nodes");
            }
            println!("Tdarr nodes resumed.");
        }
        Commands::Schedule { at } => {
            let t = match at {
                Some(s) => NaiveTime::parse_from_str(&s, "%H:%M")
                    .with_context(|| format!("invalid --at value {:?}, expected HH:MM", s))?,
                None => Local::now().time(),
            };

            if config.schedule.windows().is_empty() {
                println!("No schedule windows configured (PAUSE_WINDOWS is unset).");
            } else {
                println!("Windows (later entries win on overlap):");
                for w in config.schedule.windows() {
                    println!("  {}", w);
                }
            }
            println!("Default state: {}", config.schedule.default_state());
            println!(
                "Desired state at {}: {}",
                t.format("%H:%M"),
                config.schedule.desired_at(t)
            );
        }
    }

    Ok(())
}

/// One-shot manual transition with the same retry semantics as the loop.
async fn transition(
    config: &PauserConfig,
    desired: DesiredState,
    cancel_workers: bool,
) -> Result<ReconcileOutcome> {
    let target = TdarrClient::new(&config.tdarr_url, config.call_timeout)?;
    let retry = RetryPolicy {
        limit: config.retry_limit,
        base: config.retry_base,
    };
    let mut controller = Controller::new(target, retry, cancel_workers);
    Ok(controller.reconcile(desired).await)
}

fn init_tracing() {
    // RUST_LOG wins; LOG_LEVEL is kept for compatibility with the container
    // environment this tool grew up in.
    let filter = if let Ok(filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        filter
    } else if let Ok(level) = std::env::var("LOG_LEVEL") {
        tracing_subscriber::EnvFilter::new(level.to_lowercase())
    } else {
        tracing_subscriber::EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
