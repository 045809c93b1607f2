use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{ArgAction, Parser};
use llamagate_config::{load_default, load_from_path, GatewayConfig};
use llamagate_core::{host_queue, GatewayError, HostQueue};
use llamagate_proxy::{PortChange, ProxyOptions, ProxyServer};
use llamagate_telemetry::{MetricsRecorder, NoopMetricsRecorder, PrometheusMetricsRecorder};
use tracing::{info, warn};

/// How often queued host actions are run.
const HOST_TICK: Duration = Duration::from_millis(100);

/// llamagated - llama.cpp-compatible loopback gateway
///
/// Serves the llama.cpp server API on 127.0.0.1 and forwards completions to
/// the configured chat-completion backends, failing over between them.
///
/// Configuration discovery rules:
/// 1. If `--config PATH` (or `-c PATH`) is provided, that path is used.
/// 2. Otherwise, `llamagate_config::load_default()` is used, which probes:
///    - `/etc/llamagate/llamagate.toml`
///    - `./llamagate.toml`
#[derive(Debug, Parser)]
#[command(
    name = "llamagated",
    version,
    about = "llama.cpp-compatible gateway daemon",
    long_about = "llamagated exposes the llama.cpp server API on loopback and forwards completion requests to OpenAI, Anthropic or custom chat-completion backends.",
    disable_help_subcommand = true
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long = "config", short = 'c', value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log level (overrides RUST_LOG and the configuration file).
    ///
    /// Accepts standard tracing levels (trace, debug, info, warn, error) or a
    /// full filter expression (e.g. "info,llamagate_proxy=debug").
    #[arg(long = "log-level", short = 'L', value_name = "LEVEL")]
    log_level: Option<String>,

    /// Requested listen port, overriding `gateway.listen_port`.
    #[arg(long = "port", value_name = "PORT")]
    port: Option<u16>,

    /// Print loaded configuration summary and exit.
    #[arg(long = "print-config", action = ArgAction::SetTrue)]
    print_config: bool,

    /// Validate configuration and exit without starting the gateway.
    #[arg(long = "check-config", action = ArgAction::SetTrue)]
    check_config: bool,
}

fn main() {
    let cli = Cli::parse();

    // Config is read before telemetry so its log level can take part in the
    // filter; load errors are reported once logging is up.
    let loaded = load_config(cli.config.as_ref());

    let level = resolve_log_level(&cli, loaded.as_ref().ok());
    if let Err(err) = llamagate_telemetry::init(level.as_deref()) {
        eprintln!("llamagated: failed to initialise telemetry: {}", err);
        process::exit(1);
    }

    let mut config = match loaded {
        Ok(cfg) => {
            match &cli.config {
                Some(path) => info!("loaded configuration from {}", path.display()),
                None => info!("loaded configuration from default locations"),
            }
            cfg
        }
        Err(err) => {
            tracing::error!("failed to load configuration: {}", err);
            process::exit(1);
        }
    };

    if let Some(port) = cli.port {
        config.gateway.listen_port = port;
    }

    if let Err(err) = config.validate() {
        tracing::error!("configuration validation failed: {}", err);
        process::exit(1);
    }

    if cli.check_config {
        info!("configuration is valid");
        return;
    }

    if cli.print_config {
        print_config_summary(&config);
        return;
    }

    if let Err(err) = run_blocking(config, cli.config) {
        tracing::error!("llamagated terminated with error: {:#}", err);
        process::exit(1);
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<GatewayConfig, GatewayError> {
    match path {
        Some(path) => load_from_path(path),
        None => load_default(),
    }
}

/// CLI flag, then `RUST_LOG`, then the configuration file, then `info`.
fn resolve_log_level(cli: &Cli, config: Option<&GatewayConfig>) -> Option<String> {
    if cli.log_level.is_some() {
        return cli.log_level.clone();
    }
    if std::env::var("RUST_LOG").is_ok() {
        return None;
    }
    config.and_then(|c| c.log_level()).map(str::to_string)
}

fn run_blocking(config: GatewayConfig, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    rt.block_on(run(config, config_path))
}

async fn run(config: GatewayConfig, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let metrics: Arc<dyn MetricsRecorder> = if config.metrics_enabled() {
        Arc::new(PrometheusMetricsRecorder::new())
    } else {
        Arc::new(NoopMetricsRecorder)
    };

    let (dispatcher, mut host) = host_queue();

    // Host-owned setting; only ever written from the host tick.
    let listen_port = Arc::new(AtomicU16::new(config.gateway.listen_port));

    let observed_port = Arc::clone(&listen_port);
    let server = ProxyServer::builder(config.backend_configs())
        .active(config.gateway.active_backend)
        .options(ProxyOptions::from(&config.gateway))
        .metrics(metrics)
        .port_observer(move |change: PortChange| {
            let setting = Arc::clone(&observed_port);
            let queued = dispatcher.enqueue(move || {
                setting.store(change.bound, Ordering::SeqCst);
                info!(
                    requested = change.requested,
                    bound = change.bound,
                    "listen port setting updated"
                );
            });
            if let Err(err) = queued {
                warn!("could not report port change: {}", err);
            }
        })
        .build()
        .context("failed to build gateway")?;

    let port = server
        .start(config.gateway.listen_port)
        .await
        .context("failed to start gateway")?;
    info!(
        port,
        backends = server.selector().len(),
        "llamagated ready on http://127.0.0.1:{}",
        port
    );

    let mut reload = ReloadSignal::new().context("failed to install reload signal handler")?;
    let mut tick = tokio::time::interval(HOST_TICK);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                host.drain();
            }
            result = &mut shutdown => {
                if let Err(err) = result {
                    warn!("failed to listen for shutdown signal: {}", err);
                }
                info!("shutdown requested");
                break;
            }
            _ = reload.recv() => {
                reload_backends(&server, config_path.as_ref());
            }
        }
    }

    server.stop().await;
    finish_host(&mut host);
    info!(
        port = listen_port.load(Ordering::SeqCst),
        "llamagated stopped"
    );
    Ok(())
}

/// Run whatever is still queued so no host update is lost on exit.
fn finish_host(host: &mut HostQueue) {
    let ran = host.drain();
    if ran > 0 {
        info!(ran, "ran pending host actions before exit");
    }
}

/// Re-read the configuration file and swap in its backend list.
///
/// Listener settings are not applied; they need a restart.
fn reload_backends(server: &ProxyServer, config_path: Option<&PathBuf>) {
    info!("reloading backends from configuration");
    let config = match load_config(config_path).and_then(|cfg| cfg.validate().map(|_| cfg)) {
        Ok(cfg) => cfg,
        Err(err) => {
            warn!("keeping current backends, reload failed: {}", err);
            return;
        }
    };
    server.update_backends(config.backend_configs(), config.gateway.active_backend);
}

#[cfg(unix)]
struct ReloadSignal(tokio::signal::unix::Signal);

#[cfg(unix)]
impl ReloadSignal {
    fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self(signal(SignalKind::hangup())?))
    }

    async fn recv(&mut self) {
        if self.0.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
struct ReloadSignal;

#[cfg(not(unix))]
impl ReloadSignal {
    fn new() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) {
        std::future::pending::<()>().await;
    }
}

/// Print a concise summary of the loaded configuration.
fn print_config_summary(cfg: &GatewayConfig) {
    println!("llamagated configuration summary:");
    println!("  gateway.listen_port        = {}", cfg.gateway.listen_port);
    println!("  gateway.max_port_fallbacks = {}", cfg.gateway.max_port_fallbacks);
    println!("  gateway.max_attempts       = {}", cfg.gateway.max_attempts);
    println!(
        "  gateway.upstream_timeout   = {}",
        seconds(cfg.gateway.upstream_timeout_secs)
    );
    println!(
        "  gateway.client_timeout     = {}",
        seconds(cfg.gateway.client_read_timeout_secs)
    );
    println!("  gateway.active_backend     = {}", cfg.gateway.active_backend);
    println!(
        "  telemetry.log_level        = {}",
        cfg.log_level().unwrap_or("<default>")
    );
    println!("  telemetry.metrics          = {}", cfg.metrics_enabled());

    println!("  backends:");
    if cfg.backends.is_empty() {
        println!("    <none configured>");
    } else {
        for backend in cfg.backend_configs() {
            // Debug output redacts the API key.
            println!("    - {:?}", backend);
        }
    }
}

fn seconds(secs: u64) -> String {
    if secs == 0 {
        "<none>".to_string()
    } else {
        format!("{}s", secs)
    }
}
