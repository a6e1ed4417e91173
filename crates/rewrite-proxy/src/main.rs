use clap::Parser;
use rewrite_proxy::config::{Config, Overrides};
use rewrite_proxy::metrics::{self, MetricsServer};
use rewrite_proxy::proxy::ProxyServer;
use rewrite_proxy::scripting::{RhaiValidator, SandboxLimits, ScriptRegistry};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Reverse proxy that rewrites origin responses with Rhai scripts
#[derive(Parser, Debug)]
#[command(name = "rewrite-proxy")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Optional YAML configuration file
    #[arg(short, long, env = "CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Origin URL every request is forwarded to
    #[arg(short, long, env = "SOURCE_URL")]
    origin: Option<String>,

    /// Listen port
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Directory holding the transformation scripts
    #[arg(long, env = "SCRIPTS_DIR")]
    scripts_dir: Option<String>,

    /// File name suffix that marks a script
    #[arg(long, env = "SCRIPT_SUFFIX")]
    script_suffix: Option<String>,

    /// Per-script time budget in milliseconds
    #[arg(long, env = "SCRIPT_TIMEOUT_MS")]
    script_timeout_ms: Option<u64>,

    /// Serve Prometheus metrics on this port
    #[arg(long, env = "METRICS_PORT")]
    metrics_port: Option<u16>,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            origin: self.origin.clone(),
            port: self.port,
            scripts_dir: self.scripts_dir.clone(),
            script_suffix: self.script_suffix.clone(),
            script_timeout_ms: self.script_timeout_ms,
            metrics_port: self.metrics_port,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), anyhow::Error> {
    let config = Config::load(args.config.as_deref(), &args.overrides())?;

    info!("rewrite-proxy v{} starting", env!("CARGO_PKG_VERSION"));

    let validator = RhaiValidator::new(&SandboxLimits::from_config(&config.scripts));
    let registry = ScriptRegistry::load(&config.scripts.dir, &config.scripts.suffix, &validator)?;
    metrics::set_scripts_loaded(registry.len());
    info!(
        "Loaded {} scripts from {}",
        registry.len(),
        config.scripts.dir
    );

    if let Some(ref metrics_config) = config.metrics {
        let server = MetricsServer::new(metrics_config.port);
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server stopped: {}", e);
            }
        });
    }

    let server = ProxyServer::new(config, registry)?;

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down");
            Ok(())
        }
    }
}
