use crate::metrics::install_recorder;
use crate::server::{self, AppState};
use crate::service::CaptureService;
use crate::{
    utils, BrowserKind, CaptureMode, CaptureRequest, Config, Metrics, RequestOptions,
    RequestViewport, SessionStatus,
};
use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use metrics_exporter_prometheus::PrometheusHandle;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "page-capture")]
#[command(about = "Capture sequences of rendered web pages into a downloadable archive")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Maximum concurrent browser instances")]
    pub max_browsers: Option<usize>,

    #[arg(long, global = true, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP capture API
    Serve {
        #[arg(long, help = "Bind address, e.g. 0.0.0.0:8080")]
        bind: Option<String>,

        #[arg(long, help = "Do not expose /metrics")]
        no_metrics: bool,
    },

    /// Capture one site and write its archive
    Capture(CaptureArgs),

    /// Validate a configuration file
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    Links,
    Interactive,
}

impl From<ModeArg> for CaptureMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Links => CaptureMode::Links,
            ModeArg::Interactive => CaptureMode::Interactive,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct CaptureArgs {
    #[arg(short, long, help = "Starting URL")]
    pub url: String,

    #[arg(short, long, help = "Archive path (default: capture-<host>-<id>.zip)")]
    pub output: Option<PathBuf>,

    #[arg(short, long, value_enum, default_value = "links", help = "Traversal mode")]
    pub mode: ModeArg,

    #[arg(long, help = "Maximum link/click depth")]
    pub max_depth: Option<u32>,

    #[arg(long, help = "Maximum pages (links mode)")]
    pub max_pages: Option<usize>,

    #[arg(long, help = "Maximum clicked elements (interactive mode)")]
    pub max_elements: Option<usize>,

    #[arg(long, help = "Viewport width")]
    pub width: Option<u32>,

    #[arg(long, help = "Viewport height")]
    pub height: Option<u32>,

    #[arg(long, help = "Settle time after each load in milliseconds")]
    pub wait: Option<u64>,

    #[arg(long, help = "Settle time after each click in milliseconds")]
    pub click_delay: Option<u64>,

    #[arg(long = "selector", help = "Only click elements matching this selector (repeatable)")]
    pub selectors: Vec<String>,

    #[arg(long, help = "Emulate a mobile device")]
    pub mobile: bool,
}

impl CaptureArgs {
    pub fn to_request(&self) -> CaptureRequest {
        let viewport = match (self.width, self.height) {
            (None, None) => None,
            (width, height) => Some(RequestViewport {
                width: width.unwrap_or(1920),
                height: height.unwrap_or(1080),
            }),
        };

        CaptureRequest {
            url: self.url.clone(),
            options: Some(RequestOptions {
                mode: Some(self.mode.into()),
                max_depth: self.max_depth,
                max_pages: self.max_pages,
                max_elements: self.max_elements,
                viewport,
                wait_after_load: self.wait,
                click_delay: self.click_delay,
                selectors: (!self.selectors.is_empty()).then(|| self.selectors.clone()),
                browser: self.mobile.then_some(BrowserKind::ChromiumMobile),
                ..Default::default()
            }),
        }
    }
}

/// Defaults, then the `--config` file, then environment, then flags.
pub async fn load_config(args: &Cli) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => read_config_file(path).await?,
        None => Config::default(),
    };

    config.apply_env()?;

    if let Some(max) = args.max_browsers {
        config.pool.max_instances = max;
    }
    if let Some(chrome_path) = &args.chrome_path {
        config.browser.chrome_path = Some(chrome_path.clone());
    }

    config.validate()?;

    info!("Configuration loaded successfully");
    info!("Max browsers: {}", config.pool.max_instances);
    info!("Browser idle timeout: {:?}", config.pool.idle_timeout);
    info!("Session retention: {:?}", config.store.retention);

    Ok(config)
}

async fn read_config_file(path: &Path) -> anyhow::Result<Config> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let config = serde_json::from_str(&content)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(config)
}

pub async fn validate_config_file(path: &Path) -> anyhow::Result<()> {
    println!("Validating configuration: {}", path.display());

    let config = read_config_file(path).await?;
    config.validate()?;

    println!("Configuration is valid:");
    println!("  Bind: {}", config.server.bind);
    println!("  Max browsers: {}", config.pool.max_instances);
    println!("  Idle timeout: {:?}", config.pool.idle_timeout);
    println!("  Navigation timeout: {:?}", config.capture.navigation_timeout);
    println!("  Job timeout: {:?}", config.job_timeout);
    match &config.store.path {
        Some(path) => println!("  Session store: {}", path.display()),
        None => println!("  Session store: in-memory"),
    }

    Ok(())
}

pub struct CliRunner {
    pub config: Config,
    pub service: Arc<CaptureService>,
    metrics_handle: Option<PrometheusHandle>,
}

impl CliRunner {
    /// The Prometheus recorder, when wanted, is installed before any metric
    /// handle is registered.
    pub fn new(config: Config, command: &Commands) -> anyhow::Result<Self> {
        let metrics_handle = match command {
            Commands::Serve { no_metrics: false, .. } => Some(install_recorder()?),
            _ => None,
        };
        let metrics = Arc::new(Metrics::new());
        let service = Arc::new(CaptureService::from_config(config.clone(), metrics)?);

        Ok(Self {
            config,
            service,
            metrics_handle,
        })
    }

    pub async fn run(
        &self,
        command: Commands,
        shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        match command {
            Commands::Serve { bind, .. } => self.run_server(bind, shutdown).await,
            Commands::Capture(args) => self.run_capture(args, shutdown).await,
            Commands::Validate { config } => validate_config_file(&config).await,
        }
    }

    async fn run_server(
        &self,
        bind: Option<String>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let bind = bind.unwrap_or_else(|| self.config.server.bind.clone());
        self.service.start_background_tasks();

        let state = AppState::new(self.service.clone(), self.metrics_handle.clone());
        server::serve(state, &bind, async move {
            let _ = shutdown.recv().await;
        })
        .await?;
        Ok(())
    }

    async fn run_capture(
        &self,
        args: CaptureArgs,
        mut shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let session = self.service.submit(args.to_request()).await?;
        let id = session.session_id;
        info!("Capturing {} as session {}", args.url, id);

        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        ticker.tick().await;
        let finished = loop {
            tokio::select! {
                done = self.service.wait(&id) => break done?,
                _ = ticker.tick() => {
                    if let Some(progress) = self.service.progress(&id) {
                        println!(
                            "Progress: {} captured, {} failed",
                            progress.captured, progress.failed
                        );
                    }
                }
                _ = shutdown.recv() => {
                    warn!("Interrupted, cancelling capture {}", id);
                    self.service.cancel(&id).await?;
                    bail!("capture cancelled");
                }
            }
        };

        if finished.status != SessionStatus::Completed {
            bail!(
                "capture failed: {}",
                finished.error.as_deref().unwrap_or("unknown error")
            );
        }

        let (default_name, bytes) = self.service.archive(&id).await?;
        let output = args.output.unwrap_or_else(|| PathBuf::from(default_name));
        fs::write(&output, &bytes)
            .await
            .with_context(|| format!("writing {}", output.display()))?;

        if let Some(result) = &finished.result {
            println!("Capture complete:");
            println!("  Pages: {}", result.total_pages);
            println!("  Succeeded: {}", result.success_count);
            println!("  Failed: {}", result.failure_count);
        }
        println!(
            "  Archive: {} ({})",
            output.display(),
            utils::format_bytes(bytes.len())
        );
        Ok(())
    }
}

pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    Ok(())
}
