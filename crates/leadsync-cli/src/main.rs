use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use leadsync_pipeline::{maybe_build_scheduler, Pipeline, PipelineConfig};
use leadsync_storage::{PgStatusStore, PgStoreConfig};
use leadsync_web::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "leadsync")]
#[command(about = "Relays admitted CRM opportunities to Google Ads as offline conversions")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the HTTP trigger (and the cron trigger when enabled).
    Serve,
    /// Execute one pipeline run and print its report as JSON.
    Run,
    /// Apply pending database migrations.
    Migrate,
    /// Validate configuration without touching the network.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = PipelineConfig::from_env().context("loading configuration")?;
    init_tracing(&config);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let addr: SocketAddr = config
                .bind_address
                .parse()
                .with_context(|| format!("parsing LEADSYNC_BIND {:?}", config.bind_address))?;
            let store = connect_store(&config).await?;
            let pipeline = Arc::new(Pipeline::from_config(&config, Arc::new(store))?);

            let mut scheduler = maybe_build_scheduler(pipeline.clone(), &config).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.sync_cron, "scheduler started");
            }

            leadsync_web::serve(addr, AppState::new(pipeline)).await?;

            if let Some(sched) = scheduler.as_mut() {
                sched.shutdown().await.context("stopping scheduler")?;
            }
        }
        Commands::Run => {
            let store = connect_store(&config).await?;
            let pipeline = Pipeline::from_config(&config, Arc::new(store))?;
            let report = pipeline.run_once().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Migrate => {
            connect_store(&config).await?;
            println!("migrations applied");
        }
        Commands::CheckConfig => {
            println!(
                "configuration ok: customer={} conversion_action={} stages={} window_days={} scheduler={}",
                config.google_ads.customer_id,
                config.conversion.conversion_action(),
                config.query.stages.join(","),
                config.query.window_days,
                if config.scheduler_enabled { config.sync_cron.as_str() } else { "off" },
            );
        }
    }

    Ok(())
}

/// Connects the status log and brings its schema up to date.
async fn connect_store(config: &PipelineConfig) -> Result<PgStatusStore> {
    let store = PgStatusStore::connect(&PgStoreConfig::new(config.database_url.clone()))
        .await
        .context("connecting to status database")?;
    store.migrate().await.context("applying migrations")?;
    info!("status database ready");
    Ok(store)
}

fn init_tracing(config: &PipelineConfig) {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => match config.log_level.parse::<EnvFilter>() {
            Ok(filter) => filter,
            Err(e) => {
                eprintln!(
                    "WARN: LEADSYNC_LOG='{}' is not a valid tracing filter ({e}); falling back to 'info'",
                    config.log_level
                );
                EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);

    if config.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "leadsync starting");
}
