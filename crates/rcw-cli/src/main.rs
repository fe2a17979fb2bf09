use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rcw_sync::{build_scheduler, PreviewOutcome, WatchConfig, WatchPipeline};
use rcw_web::AppState;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "rcw-cli")]
#[command(about = "Rewards catalog watcher command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP server, plus the cron scheduler when enabled.
    Serve,
    /// Execute one scheduled-path run (persists and notifies) and exit.
    RunOnce,
    /// Preview a catalog check without persisting or notifying.
    Check {
        #[arg(long, default_value_t = 0)]
        min_points: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let config = WatchConfig::from_env();
    let pipeline = Arc::new(WatchPipeline::from_config(config)?);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            // Scheduler handle must stay alive for the life of the server.
            let _scheduler = build_scheduler(Arc::clone(&pipeline)).await?;
            let port = pipeline.config().web_port;
            info!(port, "starting http server");
            rcw_web::serve(AppState::new(pipeline), port, shutdown_signal()).await?;
        }
        Commands::RunOnce => {
            let summary = pipeline.run_scheduled().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Check { min_points } => match pipeline.preview(min_points).await? {
            PreviewOutcome::NoNewProducts => println!("No new products"),
            PreviewOutcome::NothingAboveThreshold { min_points } => {
                println!("No new products above {min_points} points");
            }
            PreviewOutcome::Report { stats, digest_html } => {
                println!("{}", serde_json::to_string_pretty(&stats)?);
                println!("{digest_html}");
            }
        },
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl-c");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("received shutdown signal, starting graceful shutdown");
}
