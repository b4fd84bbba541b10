//! ewok - task counter and new-task signal relay
//!
//! Counts submitted tasks with timing, and tells the bot service when new
//! tasks become available. All state lives in a JSON store; the bot service
//! is reached over one persistent WebSocket.
//!
//! ## Signal watching
//!
//! `ewok watch` reads the watched element's state from stdin, one JSON object
//! per line (`{"id": 1, "disabled": false, "hidden": false, "classes":
//! ["enabled"]}`, or `null` once the element is gone), and sends a single
//! signal on the first disabled -> enabled transition.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser as ClapParser, Subcommand};
use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ewok::{
    bot::{BotApi, BotError},
    channel::{ChannelClient, ChannelError, WsConnector},
    config::{Config, ConfigError},
    counter::{KeyChord, Submission, TaskCounter},
    detector::{DetectorOutcome, SharedLocator, SignalDetector},
    export::{self, ExportError},
    format::{average_seconds, format_time, rph},
    store::{Store, StoreError},
};

/// ewok - task counter and new-task signal relay
#[derive(ClapParser, Debug)]
#[command(name = "ewok", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the config file (defaults to <config dir>/ewok/config.toml)
    #[arg(long, global = true, env = "EWOK_CONFIG")]
    config: Option<PathBuf>,

    /// Bot service WebSocket URL (overrides the config file)
    #[arg(long, global = true, env = "EWOK_URL")]
    url: Option<String>,

    /// Path to the state file (overrides the config file)
    #[arg(long, global = true, env = "EWOK_STORE")]
    store: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register a user id with the bot service and remember it
    Login {
        /// Numeric user id
        user_id: String,
    },

    /// Forget the stored user id
    Logout,

    /// Ask the bot service whether it is online
    Status,

    /// Start counting submitted tasks
    Start,

    /// Stop counting and add the session to the worked time
    Stop,

    /// Record one task submission
    Submit {
        /// Name of the submitted task
        task: String,

        /// Submitted with ctrl+Enter instead of a click
        #[arg(long)]
        ctrl_enter: bool,

        /// The submit control was inactive when the key was pressed
        #[arg(long, requires = "ctrl_enter")]
        submit_inactive: bool,
    },

    /// Send the recorded tasks to the bot service
    Report,

    /// Fetch time and payout totals for the recorded tasks
    Stats,

    /// Write the recorded tasks as a CSV report
    Export {
        /// Directory to write the report into
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },

    /// Clear all recorded tasks and counters (keeps the user id and settings)
    Reset,

    /// Show counting state, worked time and per-task totals
    Summary,

    /// Show or change settings
    Settings {
        /// Warn when a task is submitted while counting is stopped
        #[arg(long)]
        warn_if_forgot_to_start: Option<bool>,
    },

    /// Watch the element feed on stdin and signal the bot on new tasks
    Watch {
        /// Re-arm after each signal instead of exiting
        #[arg(long)]
        repeat: bool,
    },
}

#[derive(Error, Debug)]
pub enum EwokError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Bot(#[from] BotError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("export error: {0}")]
    Export(#[from] ExportError),

    #[error("not logged in; run `ewok login <user-id>` first")]
    NotLoggedIn,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolved configuration and the handles every command needs.
struct App {
    config: Config,
    store: Store,
    url: String,
}

impl App {
    fn bot(&self) -> BotApi {
        let channel = ChannelClient::new(
            WsConnector::new(self.url.clone()),
            self.config.channel_config(),
        );
        BotApi::new(channel).with_signal_text(self.config.detector.signal_text.clone())
    }

    fn user_id(&self) -> Result<String, EwokError> {
        self.store.user_id().ok_or(EwokError::NotLoggedIn)
    }
}

#[tokio::main]
async fn main() -> Result<(), EwokError> {
    let cli = Cli::parse();
    init_tracing();

    let config_path = cli.config.clone().or_else(Config::default_path);
    let mut config = match &config_path {
        Some(path) => Config::load_or_default(path)?,
        None => Config::default(),
    };
    if let Some(store) = cli.store {
        config.store.path = Some(store);
    }
    let url = cli.url.unwrap_or_else(|| config.endpoint.url.clone());
    let store = Store::open(config.store_path())?;
    let app = App { config, store, url };

    match cli.command {
        Commands::Login { user_id } => run_login(&app, user_id).await,
        Commands::Logout => run_logout(&app),
        Commands::Status => run_status(&app).await,
        Commands::Start => run_start(&app),
        Commands::Stop => run_stop(&app),
        Commands::Submit {
            task,
            ctrl_enter,
            submit_inactive,
        } => run_submit(&app, task, ctrl_enter, submit_inactive),
        Commands::Report => run_report(&app).await,
        Commands::Stats => run_stats(&app).await,
        Commands::Export { dir } => run_export(&app, dir),
        Commands::Reset => run_reset(&app),
        Commands::Summary => run_summary(&app),
        Commands::Settings {
            warn_if_forgot_to_start,
        } => run_settings(&app, warn_if_forgot_to_start),
        Commands::Watch { repeat } => run_watch(&app, repeat).await,
    }
}

/// Tracing goes to stderr; stdout carries command output.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ewok=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// ── Account ────────────────────────────────────────────────────────

async fn run_login(app: &App, user_id: String) -> Result<(), EwokError> {
    let user_id = user_id.trim().to_string();
    let bot = app.bot();
    let result = bot.login(&user_id).await;
    bot.channel().close();

    match result {
        Ok(()) => {
            app.store.set_user_id(&user_id)?;
            println!("Login successful!");
            Ok(())
        }
        Err(BotError::InvalidUserId) => {
            eprintln!("ewok login: User ID should only contain digits.");
            std::process::exit(1);
        }
        Err(BotError::NotAuthorized) => {
            eprintln!("ewok login: User not authorized");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("ewok login: Error logging in: {}", e);
            std::process::exit(1);
        }
    }
}

fn run_logout(app: &App) -> Result<(), EwokError> {
    app.store.logout()?;
    println!("Logged out.");
    Ok(())
}

async fn run_status(app: &App) -> Result<(), EwokError> {
    let user_id = app.user_id()?;
    let bot = app.bot();

    let text = match bot.channel().connect().await {
        Err(e) => {
            tracing::debug!(error = %e, "connect failed");
            "Connection Error".to_string()
        }
        Ok(()) => match bot.status(&user_id).await {
            Ok(status) => status.to_string(),
            Err(e) => {
                tracing::debug!(error = %e, "status request failed");
                "Offline".to_string()
            }
        },
    };
    bot.channel().close();

    println!("{}", text);
    Ok(())
}

// ── Counting ───────────────────────────────────────────────────────

fn run_start(app: &App) -> Result<(), EwokError> {
    if app.store.start_counting(now_ms())? {
        println!("Counting started.");
    } else {
        println!("Already counting.");
    }
    Ok(())
}

fn run_stop(app: &App) -> Result<(), EwokError> {
    match app.store.stop_counting(now_ms())? {
        Some(seconds) => println!(
            "Counting stopped after {}.",
            format_time((seconds * 1000.0).round() as u64)
        ),
        None => println!("Counting is not running."),
    }
    Ok(())
}

fn run_submit(
    app: &App,
    task: String,
    ctrl_enter: bool,
    submit_inactive: bool,
) -> Result<(), EwokError> {
    let mut counter = TaskCounter::resume(app.store.clone())?;
    let at = Utc::now();
    let outcome = if ctrl_enter {
        counter.on_key(&KeyChord::new(true, "Enter"), !submit_inactive, &task, at)?
    } else {
        counter.on_click(&task, at)?
    };

    match outcome {
        Submission::Recorded { task, elapsed } => {
            println!(
                "Recorded '{}' in {}.",
                task,
                format_time(elapsed.as_millis() as u64)
            );
        }
        Submission::Discarded { warn: true } => {
            eprintln!("You have submitted a task but ewok is not started!");
            eprintln!("You can disable this warning in the settings.");
        }
        Submission::Discarded { warn: false } | Submission::Ignored => {}
    }
    Ok(())
}

// ── Reports ────────────────────────────────────────────────────────

async fn run_report(app: &App) -> Result<(), EwokError> {
    let user_id = app.user_id()?;
    let tasks = app.store.load()?.tasks;
    let bot = app.bot();
    let result = bot.process_tasks(&user_id, &tasks).await;
    bot.channel().close();

    match result {
        Ok(_) => {
            println!("Tasks report sent.");
            Ok(())
        }
        Err(BotError::NoTasks) => {
            println!("No tasks have been recorded yet.");
            Ok(())
        }
        Err(e) => {
            eprintln!("ewok report: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run_stats(app: &App) -> Result<(), EwokError> {
    let user_id = app.user_id()?;
    let tasks = app.store.load()?.tasks;
    let bot = app.bot();
    let result = bot.get_task_stats(&user_id, &tasks).await;
    bot.channel().close();

    let stats = match result {
        Ok(stats) => stats,
        Err(BotError::NoTasks) => {
            println!("No tasks have been recorded yet.");
            return Ok(());
        }
        Err(e) => {
            eprintln!("ewok stats: {}", e);
            std::process::exit(1);
        }
    };

    app.store
        .set_server_totals(stats.total_time.clone(), stats.total_payout.clone())?;
    println!("Total time:   {}", display_total(&stats.total_time));
    println!("Total payout: {}", display_total(&stats.total_payout));
    Ok(())
}

fn run_export(app: &App, dir: PathBuf) -> Result<(), EwokError> {
    let tasks = app.store.load()?.tasks;
    match export::write_report(&tasks, &dir) {
        Ok(path) => {
            println!("Wrote {}", path.display());
            Ok(())
        }
        Err(ExportError::NoTasks) => {
            eprintln!(
                "ewok export: No tasks have been recorded yet. \
                 Please complete some tasks before attempting to export."
            );
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}

fn run_reset(app: &App) -> Result<(), EwokError> {
    app.store.reset()?;
    println!("All recorded tasks cleared.");
    Ok(())
}

fn run_summary(app: &App) -> Result<(), EwokError> {
    let data = app.store.load()?;
    let worked_ms = (data.session_seconds(now_ms()) * 1000.0).round() as u64;
    let task_time = data.total_task_time();
    let task_count = data.total_task_count();

    println!(
        "Status:        {}",
        if data.is_counting { "Counting" } else { "Stopped" }
    );
    println!("Worked time:   {}", format_time(worked_ms));
    println!("Tasks:         {}", data.task_count);
    println!("Task time:     {}", format_time(task_time));
    println!("Avg per task:  {} s", average_seconds(task_time, task_count));
    println!("RPH:           {}", rph(task_time, task_count));
    if let Some(name) = &data.current_task_name {
        println!("Current task:  {}", name);
    }
    println!("Server time:   {}", display_total(&data.total_time));
    println!("Server payout: {}", display_total(&data.total_payout));

    if !data.tasks.is_empty() {
        println!();
        println!(
            "{:<32} {:>6} {:>10} {:>6} {:>8}",
            "TASK", "COUNT", "TIME", "RPH", "AVG (s)"
        );
        for (name, task) in &data.tasks {
            println!(
                "{:<32} {:>6} {:>10} {:>6} {:>8}",
                name,
                task.task_count,
                format_time(task.time),
                rph(task.time, task.task_count),
                average_seconds(task.time, task.task_count),
            );
        }
    }
    Ok(())
}

fn run_settings(app: &App, warn_if_forgot_to_start: Option<bool>) -> Result<(), EwokError> {
    if let Some(enabled) = warn_if_forgot_to_start {
        app.store.set_warn_if_forgot_to_start(enabled)?;
        println!("Settings saved.");
    }
    let settings = app.store.load()?.settings;
    println!(
        "warn-if-forgot-to-start = {}",
        settings.warn_if_forgot_to_start
    );
    Ok(())
}

/// Server totals arrive as whatever JSON the service chose; show strings
/// without quotes and missing values as 0.
fn display_total(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "0".to_string(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ── Signal watching ────────────────────────────────────────────────

async fn run_watch(app: &App, repeat: bool) -> Result<(), EwokError> {
    let bot = app.bot();
    let cancel = CancellationToken::new();
    let locator = SharedLocator::new();

    // Log connection state changes for as long as we watch.
    let mut status_rx = bot.channel().subscribe();
    let status_handle = tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let status = *status_rx.borrow_and_update();
            tracing::info!(
                state = ?status.state,
                reconnect_attempts = status.reconnect_attempts,
                exhausted = status.exhausted,
                "channel status"
            );
        }
    });

    if app.store.user_id().is_some() {
        if let Err(e) = bot.channel().connect().await {
            tracing::warn!(error = %e, "initial connect failed");
        }
    }

    let feed_locator = locator.clone();
    let feed_cancel = cancel.clone();
    let feed_handle = tokio::spawn(async move {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        let mut lines = LinesStream::new(stdin.lines());
        while let Some(line) = lines.next().await {
            match line {
                Ok(line) => {
                    if let Err(e) = feed_locator.apply_feed_line(&line) {
                        tracing::warn!(error = %e, "ignoring malformed element line");
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "element feed read failed");
                    break;
                }
            }
        }
        tracing::info!("element feed ended");
        feed_cancel.cancel();
    });

    loop {
        let detector = SignalDetector::new(
            Arc::new(app.store.clone()),
            Arc::new(locator.clone()),
            Arc::new(bot.clone()),
        )
        .with_poll_interval(app.config.poll_interval());

        let outcome = tokio::select! {
            outcome = detector.run(cancel.clone()) => outcome,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received Ctrl+C");
                cancel.cancel();
                DetectorOutcome::Cancelled
            }
        };

        match outcome {
            DetectorOutcome::SignalSent { delivered } => {
                if delivered {
                    println!("New tasks available: signal sent.");
                } else {
                    println!("New tasks available: signal could not be delivered.");
                }
                if !repeat {
                    break;
                }
            }
            DetectorOutcome::Cancelled => break,
        }
    }

    bot.channel().close();
    feed_handle.abort();
    status_handle.abort();
    Ok(())
}
