use clap::Parser;
use page_capture::{load_config, setup_logging, validate_config_file, Cli, CliRunner, Commands};
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let args = Cli::parse();

    // Setup logging
    setup_logging(args.verbose)?;

    info!("Starting page-capture v{}", env!("CARGO_PKG_VERSION"));

    // Validation needs neither a pool nor a store
    if let Commands::Validate { config } = &args.command {
        return validate_config_file(config).await;
    }

    let config = load_config(&args).await?;
    let cli_runner = CliRunner::new(config, &args.command)?;

    // Setup graceful shutdown
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let _shutdown_handler = setup_shutdown_handler(shutdown_tx);

    let result = cli_runner.run(args.command, shutdown_rx).await;

    info!("Shutting down...");
    cli_runner.service.shutdown().await;

    if let Err(e) = &result {
        error!("Application error: {:#}", e);
    }

    info!("page-capture stopped");
    result
}

fn setup_shutdown_handler(
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!("Failed to create SIGTERM handler: {}", e);
                if signal::ctrl_c().await.is_ok() {
                    info!("Received SIGINT");
                    let _ = shutdown_tx.send(());
                }
                return;
            }
        };

        tokio::select! {
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("Failed to listen for SIGINT: {}", e);
                    return;
                }
                info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
        }

        let _ = shutdown_tx.send(());
    })
}
