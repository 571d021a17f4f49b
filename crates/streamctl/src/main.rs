//! streamctl binary: control-plane server, disk logger and worker
//! supervision in one process.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use streamctl::bridge::{FragmentSender, SocketSlot};
use streamctl::shutdown::{run_until_shutdown, spawn_signal_listener};
use streamctl::transport;
use streamctl::{
    Config, ControlPlaneClient, ControlPlaneService, DiskLogger, HttpEventSource, ProcessManager,
    STREAMCTL_VERSION, ServerConfig, Teardown, WorkerClient,
};

/// Filter directives used when `RUST_LOG` is unset.
fn default_directives(level: Option<&str>) -> String {
    let level = match level {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("streamctl={level},hyper=warn")
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = std::env::var("STREAMCTL_LOG").ok();
        EnvFilter::new(default_directives(level.as_deref()))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::from_env();
    tracing::info!(
        version = STREAMCTL_VERSION,
        mode = config.mode.as_str(),
        log_dir = %config.log_dir.display(),
        workers = config.workers.len(),
        "Starting streamctl"
    );
    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("failed to create log directory {}", config.log_dir.display()))?;

    // Signals first, so an early Ctrl-C is not lost.
    let (intent_tx, mut intents) = mpsc::channel(4);
    spawn_signal_listener(intent_tx).context("failed to install signal handlers")?;

    let service = Arc::new(ControlPlaneService::headless());
    let server = transport::start(ServerConfig::from(&config), service.clone())
        .await
        .context("failed to start control-plane server")?;
    let control_plane = ControlPlaneClient::new(server.addr());
    let control_url = format!("http://{}", server.addr());

    let transport_token = CancellationToken::new();
    let socket = SocketSlot::bind_loopback()
        .await
        .context("failed to bind UDP control socket")?;
    let (sender, sender_task) =
        FragmentSender::spawn(socket, config.sender_queue_capacity, transport_token.clone());

    let logger = DiskLogger::for_mode(
        HttpEventSource::new(control_plane.clone(), WorkerClient::default()),
        &config.log_dir,
        config.mode,
        config.rotate_bytes,
        config.logger_poll_interval,
    )
    .spawn();

    let processes =
        Arc::new(ProcessManager::default().with_timeout_action(config.timeout_action));
    for command in &config.workers {
        let command = command
            .clone()
            .with_env("STREAMCTL_CONTROL_URL", control_url.as_str())
            .with_env("STREAMCTL_MODE", config.mode.as_str());
        match processes.spawn(&command).await {
            Ok(pid) => {
                if !processes.probe_alive(pid, config.liveness_grace).await {
                    service
                        .alert(
                            "Worker failed to start",
                            &format!("{} (pid {pid}) exited during startup", command.name),
                        )
                        .await;
                }
            }
            Err(e) => {
                tracing::error!(name = %command.name, error = %e, "Failed to spawn worker");
                service
                    .alert("Worker failed to start", &format!("{}: {e}", command.name))
                    .await;
            }
        }
    }

    let intent = run_until_shutdown(&mut intents, service.presenter().as_ref()).await;
    tracing::info!(?intent, "Shutting down");

    let teardown = Teardown::new(
        &config,
        control_plane,
        processes,
        service.whois(),
        service.presenter(),
    )
    .with_sender(sender, transport_token)
    .with_server(server)
    .with_logger(logger);
    let report = teardown.run().await;

    if let Err(e) = sender_task.await {
        tracing::error!(error = %e, "Fragment sender task panicked");
    }
    if !report.remaining.is_empty() || !report.join.timed_out.is_empty() {
        tracing::warn!(?report, "Shutdown finished with leftovers");
    }
    Ok(())
}
