//! # Greeter
//!
//! Sends birthday and anniversary greetings at 9am in each user's local time.
//!
//! Usage:
//!   greeter run                   # Start the scheduler, workers and gateway
//!   greeter find-due              # One eligibility pass, then exit
//!   greeter dispatch              # Publish records due now
//!   greeter recover               # One recovery sweep
//!   greeter stats                 # Run bookkeeping and message counts
//!   greeter add-user ...          # Insert or update a user
//!   greeter init-config           # Write a default config file

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use greeter_channels::{SqliteUserStore, create_sender};
use greeter_core::User;
use greeter_core::config::{GreeterConfig, expand_path};
use greeter_core::traits::SystemClock;
use greeter_gateway::AppState;
use greeter_scheduler::SchedulerEngine;

#[derive(Parser)]
#[command(
    name = "greeter",
    version,
    about = "🎂 Greeter: timezone-aware birthday and anniversary messages"
)]
struct Cli {
    /// Config file (default ~/.greeter/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the periodic loops, the worker pool and the gateway until Ctrl-C
    Run,
    /// Create records for occurrences due in the lookahead window
    FindDue,
    /// Publish records whose send time has come
    Dispatch,
    /// Re-publish stuck records
    Recover,
    /// Print scheduler run stats and message counts as JSON
    Stats,
    /// Insert or update a user in the user table
    AddUser {
        #[arg(long)]
        id: String,
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        #[arg(long)]
        email: String,
        /// IANA timezone, e.g. America/New_York
        #[arg(long)]
        timezone: String,
        /// YYYY-MM-DD
        #[arg(long)]
        birthday: Option<NaiveDate>,
        /// YYYY-MM-DD
        #[arg(long)]
        anniversary: Option<NaiveDate>,
    },
    /// Write the default config and exit
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<GreeterConfig> {
    let config = match path {
        Some(p) => GreeterConfig::load_from(p)?,
        None => GreeterConfig::load()?,
    };
    Ok(config)
}

fn open_users(config: &GreeterConfig) -> Result<Arc<SqliteUserStore>> {
    let path = expand_path(&config.users_database_path);
    let users = SqliteUserStore::open(&path)
        .with_context(|| format!("opening user store at {}", path.display()))?;
    Ok(Arc::new(users))
}

fn build_engine(config: &GreeterConfig) -> Result<Arc<SchedulerEngine>> {
    let users = open_users(config)?;
    let sender = create_sender(config)?;
    tracing::info!("📮 Sender: {}", sender.name());
    let engine = SchedulerEngine::from_config(config, users, sender, Arc::new(SystemClock))?;
    Ok(Arc::new(engine))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "greeter=debug,greeter_scheduler=debug,greeter_channels=debug,greeter_gateway=debug,tower_http=debug"
    } else {
        "greeter=info,greeter_scheduler=info,greeter_channels=info,greeter_gateway=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    if let Command::InitConfig { force } = &cli.command {
        let path = cli.config.clone().unwrap_or_else(GreeterConfig::default_path);
        if path.exists() && !force {
            println!("⚠️  {} already exists (use --force to overwrite)", path.display());
            return Ok(());
        }
        GreeterConfig::default().save_to(&path)?;
        println!("✅ Wrote default config to {}", path.display());
        return Ok(());
    }

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Run => run(config).await?,
        Command::FindDue => {
            let created = build_engine(&config)?.run_eligibility_tick().await?;
            println!("🔎 Created {created} record(s)");
        }
        Command::Dispatch => {
            let published = build_engine(&config)?.run_dispatch_tick().await?;
            println!("📨 Published {published} job(s)");
        }
        Command::Recover => {
            let recovered = build_engine(&config)?.run_recovery_tick().await?;
            println!("🩹 Recovered {recovered} record(s)");
        }
        Command::Stats => {
            let engine = build_engine(&config)?;
            let store = engine.store();
            let messages: serde_json::Map<_, _> = store
                .count_by_type()?
                .into_iter()
                .map(|(mt, counts)| (mt.as_str().to_string(), serde_json::json!(counts)))
                .collect();
            let stats = serde_json::json!({
                "schedulers": store.run_stats()?,
                "messages": messages,
                "queue": engine.queue().depth().await?,
            });
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::AddUser {
            id,
            first_name,
            last_name,
            email,
            timezone,
            birthday,
            anniversary,
        } => {
            let users = open_users(&config)?;
            users.upsert_user(&User {
                id: id.clone(),
                first_name,
                last_name,
                email,
                timezone,
                birthday_date: birthday,
                anniversary_date: anniversary,
                deleted_at: None,
            })?;
            println!("✅ Saved user {id}");
        }
        Command::InitConfig { .. } => {}
    }
    Ok(())
}

async fn run(config: GreeterConfig) -> Result<()> {
    let engine = build_engine(&config)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let gateway = if config.gateway.enabled {
        let state = AppState::new(engine.store(), engine.queue(), engine.breaker());
        let gateway_config = config.gateway.clone();
        let rx = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = greeter_gateway::start(&gateway_config, state, rx).await {
                tracing::error!("❌ Gateway failed: {e}");
            }
        }))
    } else {
        None
    };

    let scheduler = tokio::spawn(engine.clone().run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("🛑 Shutdown requested, draining in-flight jobs...");
    shutdown_tx.send(true)?;

    scheduler.await?;
    if let Some(gateway) = gateway {
        gateway.await?;
    }
    tracing::info!("👋 Greeter stopped");
    Ok(())
}
