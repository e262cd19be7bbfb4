//! autocount - Automated sequential counting for channel-based chat services
//!
//! Offline commands (`channel`, `account`, `participant`, `pacing`, `hours`,
//! `status`, `redact`) edit or read the state file directly. Online commands (`run`,
//! `scan`, `fix`, `rescan`) start a supervisor against the live service.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use libautocount::client::discord::DiscordClientFactory;
use libautocount::config::Config;
use libautocount::store::{IdentityRecord, PersistedState, RunHours, StateStore};
use libautocount::types::{ScanResult, StatusSnapshot};
use libautocount::{AutocountError, SupervisorBuilder, SupervisorHandle};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "autocount")]
#[command(version)]
#[command(about = "Automated sequential counting for channel-based chat services")]
#[command(long_about = "\
autocount - Automated sequential counting for channel-based chat services

DESCRIPTION:
    autocount posts consecutive integers to a counting channel, rotating
    between several accounts so that no account posts twice in a row.

    It reads recent channel activity to stay in sync with other counters,
    watches for counting bots announcing a reset, and slows down or speeds
    up automatically around the service's rate limits.

USAGE:
    # One-time setup
    autocount channel set 123456789012345678
    autocount account add alice --token <TOKEN>
    autocount account add bob --stdin < bob.token

    # Count until interrupted
    autocount run

    # Inspect or correct the count without counting
    autocount scan
    autocount fix

SIGNALS:
    SIGTERM, SIGINT - Graceful stop (finishes the current step, saves state)

CONFIGURATION:
    Configuration file: ~/.config/autocount/config.toml
    State file:         ~/.local/share/autocount/state.json

EXIT CODES:
    0 - Success
    1 - Runtime or configuration error
    2 - Authentication error (no usable account)
    3 - Invalid input
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: ~/.config/autocount/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// State file (overrides the configured path)
    #[arg(long, global = true, env = "AUTOCOUNT_STATE", value_name = "PATH")]
    state: Option<PathBuf>,

    /// Output format (text or json)
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Count until stopped, a count limit is reached, or no account remains
    Run {
        /// Skip the initial scan and ignore reset messages already posted
        #[arg(long)]
        force: bool,

        /// Resume from 1 automatically after a reset
        #[arg(long)]
        auto_restart: bool,

        /// Stop after this many successful sends in this run (not saved)
        #[arg(long, value_name = "N")]
        limit: Option<u64>,
    },

    /// Read recent channel activity without changing anything
    Scan,

    /// Correct the local count from the last few messages
    Fix,

    /// Search further back for a reset announcement
    Rescan,

    /// Show the saved counting state
    Status,

    /// Manage the counting channel
    Channel {
        #[command(subcommand)]
        action: ChannelAction,
    },

    /// Manage counting accounts
    Account {
        #[command(subcommand)]
        action: AccountAction,
    },

    /// Manage the names of counting bots whose messages are not counts
    Participant {
        #[command(subcommand)]
        action: ParticipantAction,
    },

    /// Manage the pacing delay bounds
    Pacing {
        #[command(subcommand)]
        action: PacingAction,
    },

    /// Restrict counting to certain local hours
    Hours {
        #[command(subcommand)]
        action: HoursAction,
    },

    /// Print a copy of the state with channel, accounts and tokens replaced
    Redact {
        /// Write to a file instead of stdout
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum ChannelAction {
    /// Set the channel to count in
    Set {
        /// Channel id
        id: String,
    },
}

#[derive(Subcommand, Debug)]
enum AccountAction {
    /// Add an account
    Add {
        /// Name used in logs and status output
        label: String,

        /// Account token
        #[arg(long, env = "AUTOCOUNT_TOKEN", hide_env_values = true, conflicts_with = "stdin")]
        token: Option<String>,

        /// Read the token from stdin (for automation/agents)
        #[arg(long)]
        stdin: bool,

        /// Custom user agent for this account
        #[arg(long)]
        user_agent: Option<String>,
    },

    /// Remove an account
    Remove {
        label: String,
    },

    /// List accounts (without showing tokens)
    List,
}

#[derive(Subcommand, Debug)]
enum ParticipantAction {
    /// Treat authors whose name contains NAME as a counting bot
    Add { name: String },

    /// Stop treating NAME as a counting bot
    Remove { name: String },

    /// List counting bot names
    List,
}

#[derive(Subcommand, Debug)]
enum PacingAction {
    /// Set the minimum and maximum delay between sends (e.g. 800ms, 2s)
    Set {
        #[arg(long, value_parser = humantime::parse_duration)]
        min: Duration,

        #[arg(long, value_parser = humantime::parse_duration)]
        max: Duration,
    },
}

#[derive(Subcommand, Debug)]
enum HoursAction {
    /// Only count from START to END (local hours, 0-23, may wrap midnight)
    Set { start: u8, end: u8 },

    /// Count at any hour
    Clear,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    libautocount::logging::init_default(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        let code = e
            .downcast_ref::<AutocountError>()
            .map(AutocountError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    let state_path = cli
        .state
        .clone()
        .unwrap_or_else(|| config.state.expand_path());
    let store = StateStore::new(state_path);
    let format = cli.format;

    match cli.command {
        Commands::Run {
            force,
            auto_restart,
            limit,
        } => run_counting(config, store, force, auto_restart, limit, format).await,
        Commands::Scan => {
            let handle = spawn_supervisor(config, store)?;
            let result = handle.scan_now().await;
            finish_online(&handle, result, format).await
        }
        Commands::Fix => {
            let handle = spawn_supervisor(config, store)?;
            let result = handle.fix_mismatch().await;
            finish_online(&handle, result, format).await
        }
        Commands::Rescan => {
            let handle = spawn_supervisor(config, store)?;
            let result = handle.deep_rescan().await;
            finish_online(&handle, result, format).await
        }
        Commands::Status => show_status(&config, &store, format),
        Commands::Channel {
            action: ChannelAction::Set { id },
        } => {
            let id = id.trim().to_string();
            if id.is_empty() {
                return Err(AutocountError::InvalidInput("channel id cannot be empty".into()).into());
            }
            store.update(&config.runner, |state| {
                state.channel_id = Some(id.clone());
                Ok(())
            })?;
            println!("✓ Channel set to {}", id);
            Ok(())
        }
        Commands::Account { action } => account_command(&config, &store, action, format),
        Commands::Participant { action } => participant_command(&config, &store, action, format),
        Commands::Pacing {
            action: PacingAction::Set { min, max },
        } => {
            store.update(&config.runner, |state| {
                state.set_pacing(millis(min), millis(max))
            })?;
            println!(
                "✓ Pacing set to {} - {}",
                humantime::format_duration(min),
                humantime::format_duration(max)
            );
            Ok(())
        }
        Commands::Hours { action } => {
            let hours = match action {
                HoursAction::Set { start, end } => Some(RunHours::new(start, end)?),
                HoursAction::Clear => None,
            };
            store.update(&config.runner, |state| {
                state.run_hours = hours;
                Ok(())
            })?;
            match hours {
                Some(h) => println!("✓ Counting limited to {:02}:00-{:02}:00", h.start_hour, h.end_hour),
                None => println!("✓ Counting allowed at any hour"),
            }
            Ok(())
        }
        Commands::Redact { output } => {
            let state = store.load_or_default(&config.runner)?;
            let json = serde_json::to_string_pretty(&state.redacted())?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json + "\n")
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    println!("✓ Redacted state written to {}", path.display());
                }
                None => println!("{}", json),
            }
            Ok(())
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn spawn_supervisor(config: Config, store: StateStore) -> Result<SupervisorHandle> {
    let factory = Arc::new(DiscordClientFactory::new(config.api.clone()));
    Ok(SupervisorBuilder::new(config, store, factory).spawn()?)
}

async fn run_counting(
    config: Config,
    store: StateStore,
    force: bool,
    auto_restart: bool,
    limit: Option<u64>,
    format: OutputFormat,
) -> Result<()> {
    let handle = spawn_supervisor(config, store)?;

    if auto_restart {
        handle.set_auto_restart(true).await?;
    }
    let interrupted = setup_signal_handlers()?;

    if let Err(e) = handle.start_with_limit(force, limit).await {
        let _ = handle.shutdown().await;
        return Err(e.into());
    }
    info!("autocount running");

    let status = tokio::select! {
        _ = interrupted => {
            info!("Received shutdown signal, stopping gracefully...");
            handle.stop().await?;
            handle.status()
        }
        status = handle.wait_for(Duration::MAX, |s| !s.phase.is_running()) => {
            status.unwrap_or_else(|| handle.status())
        }
    };
    handle.shutdown().await?;

    print_status(&status, format)?;
    if status.phase == libautocount::Phase::Stalled {
        return Err(AutocountError::NoUsableIdentity.into());
    }
    Ok(())
}

/// Forward SIGINT/SIGTERM to the async side as a one-shot notification
#[cfg(unix)]
fn setup_signal_handlers() -> Result<tokio::sync::oneshot::Receiver<()>> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("Signal setup failed")?;
    let (tx, rx) = tokio::sync::oneshot::channel();

    std::thread::spawn(move || {
        if signals.forever().next().is_some() {
            let _ = tx.send(());
        }
    });

    Ok(rx)
}

#[cfg(not(unix))]
fn setup_signal_handlers() -> Result<tokio::sync::oneshot::Receiver<()>> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send(());
        }
    });
    Ok(rx)
}

async fn finish_online(
    handle: &SupervisorHandle,
    result: libautocount::Result<ScanResult>,
    format: OutputFormat,
) -> Result<()> {
    if let Err(e) = handle.shutdown().await {
        warn!("supervisor did not shut down cleanly: {}", e);
    }
    let result = result?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        OutputFormat::Text => {
            match &result.last_author {
                Some(author) => println!("Observed count: {} (by {})", result.observed_count, author),
                None => println!("Observed count: none"),
            }
            match result.reset_observed_at {
                Some(at) => println!("Reset:          detected at {}", at.to_rfc3339()),
                None => println!("Reset:          none"),
            }
            println!("Messages read:  {}", result.sample_size);
        }
    }
    Ok(())
}

fn print_status(status: &StatusSnapshot, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(status)?),
        OutputFormat::Text => {
            println!("Phase:          {}", status.phase);
            println!("Count:          {}", status.current_count);
            println!("Sent this run:  {}", status.counts_this_session);
            if status.recent_rate_limits > 0 {
                println!("Rate limited:   {} of the last events", status.recent_rate_limits);
            }
            if !status.unusable_identities.is_empty() {
                println!("Unusable:       {}", status.unusable_identities.join(", "));
            }
            if let Some(error) = &status.last_error {
                println!("Last error:     {}", error);
            }
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct AccountView<'a> {
    label: &'a str,
    message_count: u64,
    user_agent: Option<&'a str>,
}

#[derive(Serialize)]
struct StatusView<'a> {
    channel_id: Option<&'a str>,
    current_count: u64,
    counting_active: bool,
    reset_pending: bool,
    last_account: Option<&'a str>,
    auto_restart: bool,
    count_limit: Option<u64>,
    run_hours: Option<RunHours>,
    min_delay_ms: u64,
    max_delay_ms: u64,
    accounts: Vec<AccountView<'a>>,
}

fn account_views(state: &PersistedState) -> Vec<AccountView<'_>> {
    state
        .identities
        .iter()
        .map(|i| AccountView {
            label: &i.label,
            message_count: i.message_count,
            user_agent: i.user_agent.as_deref(),
        })
        .collect()
}

fn show_status(config: &Config, store: &StateStore, format: OutputFormat) -> Result<()> {
    let state = store.load_or_default(&config.runner)?;
    let view = StatusView {
        channel_id: state.channel_id.as_deref(),
        current_count: state.counter.current_count,
        counting_active: state.counter.counting_active,
        reset_pending: state.counter.reset_pending,
        last_account: state
            .counter
            .last_identity_index
            .and_then(|i| state.identities.get(i))
            .map(|i| i.label.as_str()),
        auto_restart: state.auto_restart,
        count_limit: state.count_limit,
        run_hours: state.run_hours,
        min_delay_ms: state.pacing.min_delay_ms,
        max_delay_ms: state.pacing.max_delay_ms,
        accounts: account_views(&state),
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&view)?),
        OutputFormat::Text => {
            println!("Channel:        {}", view.channel_id.unwrap_or("(not set)"));
            println!("Count:          {}", view.current_count);
            println!("Active:         {}", if view.counting_active { "yes" } else { "no" });
            if view.reset_pending {
                println!("Reset pending:  next value is 1");
            }
            println!("Last account:   {}", view.last_account.unwrap_or("-"));
            println!("Auto restart:   {}", if view.auto_restart { "on" } else { "off" });
            match view.count_limit {
                Some(limit) => println!("Count limit:    {}", limit),
                None => println!("Count limit:    none"),
            }
            if let Some(hours) = view.run_hours {
                println!("Run hours:      {:02}:00-{:02}:00", hours.start_hour, hours.end_hour);
            }
            println!(
                "Pacing:         {} - {}",
                humantime::format_duration(Duration::from_millis(view.min_delay_ms)),
                humantime::format_duration(Duration::from_millis(view.max_delay_ms))
            );
            println!("Accounts:       {}", view.accounts.len());
        }
    }
    Ok(())
}

fn account_command(
    config: &Config,
    store: &StateStore,
    action: AccountAction,
    format: OutputFormat,
) -> Result<()> {
    match action {
        AccountAction::Add {
            label,
            token,
            stdin,
            user_agent,
        } => {
            let token = if stdin {
                use std::io::Read;
                let mut buffer = String::new();
                std::io::stdin().read_to_string(&mut buffer)?;
                buffer.trim().to_string()
            } else {
                token.ok_or_else(|| {
                    AutocountError::InvalidInput("provide --token or --stdin".to_string())
                })?
            };
            let record = IdentityRecord {
                label: label.trim().to_string(),
                token: token.trim().to_string(),
                user_agent: user_agent.filter(|ua| !ua.trim().is_empty()),
                message_count: 0,
            };
            store.update(&config.runner, |state| state.add_identity(record))?;
            println!("✓ Added account '{}'", label.trim());
            Ok(())
        }
        AccountAction::Remove { label } => {
            store.update(&config.runner, |state| state.remove_identity(&label).map(|_| ()))?;
            println!("✓ Removed account '{}'", label);
            Ok(())
        }
        AccountAction::List => {
            let state = store.load_or_default(&config.runner)?;
            let accounts = account_views(&state);
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&accounts)?),
                OutputFormat::Text => {
                    if accounts.is_empty() {
                        println!("No accounts configured");
                    }
                    for account in accounts {
                        match account.user_agent {
                            Some(ua) => println!(
                                "{}  ({} messages, user agent: {})",
                                account.label, account.message_count, ua
                            ),
                            None => println!("{}  ({} messages)", account.label, account.message_count),
                        }
                    }
                }
            }
            Ok(())
        }
    }
}

fn participant_command(
    config: &Config,
    store: &StateStore,
    action: ParticipantAction,
    format: OutputFormat,
) -> Result<()> {
    match action {
        ParticipantAction::Add { name } => {
            store.update(&config.runner, |state| state.add_participant(&name))?;
            println!("✓ Added counting bot '{}'", name.trim());
        }
        ParticipantAction::Remove { name } => {
            let mut removed = String::new();
            store.update(&config.runner, |state| {
                removed = state.remove_participant(&name)?;
                Ok(())
            })?;
            println!("✓ Removed counting bot '{}'", removed);
        }
        ParticipantAction::List => {
            let state = store.load_or_default(&config.runner)?;
            match format {
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&state.automated_participants)?
                ),
                OutputFormat::Text => {
                    if state.automated_participants.is_empty() {
                        println!("No counting bots configured");
                    }
                    for name in &state.automated_participants {
                        println!("{}", name);
                    }
                }
            }
        }
    }
    Ok(())
}
