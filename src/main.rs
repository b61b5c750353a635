use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use tndr_lsp_client::config::{self, ClientConfiguration, HintSettings};
use tndr_lsp_client::lifecycle::LifecycleController;
use tndr_lsp_client::locator::ExecutableLocator;
use tndr_lsp_client::logging::{LogConfig, init_logging};
use tndr_lsp_client::middleware::MiddlewarePipeline;
use tndr_lsp_client::session::TndrSessionFactory;

/// CLI arguments for the tndr LSP client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the tndr executable (overrides TNDR_PATH env var and discovery)
    #[arg(long, value_name = "PATH")]
    server_path: Option<PathBuf>,

    /// Workspace root directory (defaults to current directory)
    #[arg(long, value_name = "DIR")]
    root: Option<PathBuf>,

    /// File the server writes its internal gopls log to
    #[arg(long, value_name = "FILE")]
    gopls_log: Option<PathBuf>,

    /// Trace RPC between the server and its embedded gopls
    #[arg(long)]
    gopls_rpc_trace: bool,

    /// File the server writes its own log to
    #[arg(long, value_name = "FILE")]
    server_log: Option<PathBuf>,

    /// Enable the server's pprof profiling endpoint
    #[arg(long)]
    pprof: bool,

    /// Debug HTTP listen address for the server (host:port)
    #[arg(long, value_name = "ADDR")]
    http: Option<String>,

    /// Attach parameter-hint commands to callable completions
    #[arg(long)]
    parameter_hints: bool,

    /// Log level (overrides RUST_LOG env var)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log file path (overrides TNDR_LOG_FILE env var)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,
}

/// Resolve the executable discovery strategy from CLI args and environment
fn build_locator(server_path_arg: Option<PathBuf>) -> ExecutableLocator {
    // Priority: CLI arg > TNDR_PATH env var > PATH and fallback discovery
    let override_path =
        server_path_arg.or_else(|| std::env::var("TNDR_PATH").ok().map(PathBuf::from));

    let locator = ExecutableLocator::from_env();
    match override_path {
        Some(path) => locator.override_path(path),
        None => locator,
    }
}

fn build_configuration(args: &Args) -> Result<ClientConfiguration, config::ConfigError> {
    let root = args.root.clone().unwrap_or_else(|| {
        std::env::current_dir().unwrap_or_else(|e| {
            eprintln!("Failed to get current directory: {e}");
            std::process::exit(1);
        })
    });

    let mut builder = ClientConfiguration::builder()
        .gopls_rpc_trace(args.gopls_rpc_trace)
        .pprof(args.pprof)
        .root_uri(format!("file://{}", root.to_string_lossy()))
        .hints(HintSettings::new().with_generic(args.parameter_hints));

    if let Some(path) = &args.gopls_log {
        builder = builder.gopls_log(path);
    }
    if let Some(path) = &args.server_log {
        builder = builder.log(path);
    }
    if let Some(address) = &args.http {
        builder = builder.http(address.clone());
    }

    builder.build()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log_config =
        LogConfig::from_env().with_overrides(args.log_level.clone(), args.log_file.clone());
    if let Err(e) = init_logging(log_config) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let config = match build_configuration(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    let locator = build_locator(args.server_path.clone());
    let middleware = Arc::new(MiddlewarePipeline::new(
        config.hints.clone(),
        Arc::new(|_scope, _section| serde_json::Value::Null),
    ));

    let factory = TndrSessionFactory::new(locator, middleware);

    // Rebuilt on every (re)start so a SIGHUP restart picks up live settings
    let fallback = config;
    let mut controller = LifecycleController::with_config_provider(factory, move || {
        build_configuration(&args).unwrap_or_else(|e| {
            warn!("Configuration reload failed, keeping previous settings: {e}");
            fallback.clone()
        })
    });

    info!("Starting tndr LSP client");
    if let Err(e) = controller.start().await {
        eprintln!("Failed to start the tndr server: {e}");
        std::process::exit(1);
    }

    let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;

    loop {
        tokio::select! {
            event = controller.next_event() => {
                if let Some(notice) = controller.handle_transport_event(event).await {
                    eprintln!("{notice}");
                }
            }
            _ = sighup.recv() => {
                info!("SIGHUP received, restarting server");
                if let Err(e) = controller.restart().await {
                    eprintln!("Failed to restart the tndr server: {e}");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, shutting down");
                controller.stop().await;
                break;
            }
        }
    }

    info!("tndr LSP client exited");
    Ok(())
}
