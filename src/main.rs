//! crondeck CLI entry point.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use crondeck::config::Config;
use crondeck::notify::mail::NullMailSink;
use crondeck::scheduler::runtime::SchedulerRuntime;
use crondeck::scheduler::trigger::CronTrigger;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "crondeck", version)]
#[command(about = "Cron job scheduler and dispatcher for webhooks and GitHub Actions")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler service (default when no subcommand is given)
    Start,
    /// Validate a five-field cron expression and print its next fire times
    ValidateCron {
        /// The cron expression, e.g. "*/5 * * * *"
        expression: String,
        /// How many upcoming fire times to print
        #[arg(short, long, default_value_t = 5)]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match cli.command.unwrap_or(Command::Start) {
        Command::Start => run_service().await,
        Command::ValidateCron { expression, count } => validate_cron(&expression, count).await,
    }
}

fn init_tracing(debug: bool) {
    let default_directive = if debug { "crondeck=debug,info" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_service() -> anyhow::Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;
    config.validate()?;

    tracing::info!(
        database_url = %config.database_url,
        timezone = %config.timezone_name,
        "starting crondeck"
    );

    let pool = crondeck::db::connect(&config.database_url)
        .await
        .context("failed to open database")?;
    crondeck::db::ensure_schema(&pool)
        .await
        .context("failed to bootstrap schema")?;

    let runtime = SchedulerRuntime::new(pool, config, Arc::new(NullMailSink))
        .context("failed to build scheduler runtime")?;

    let is_leader = runtime.start().await?;
    if is_leader {
        tracing::info!("this process is the scheduling leader");
    } else {
        tracing::info!("another process holds the scheduler lock, serving as follower");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");

    runtime.stop().await;
    Ok(())
}

async fn validate_cron(expression: &str, count: usize) -> anyhow::Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;

    let trigger = match CronTrigger::parse(expression, config.timezone) {
        Ok(trigger) => trigger,
        Err(error) => {
            println!("invalid: {error}");
            std::process::exit(1);
        }
    };

    println!(
        "valid: '{}' in {}",
        trigger.expression(),
        config.timezone_name
    );
    for fire in trigger.preview(count) {
        let local = fire.with_timezone(&config.timezone);
        println!(
            "  {} ({} UTC)",
            local.format("%Y-%m-%d %H:%M %Z"),
            fire.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}
