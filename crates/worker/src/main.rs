mod cli;
mod config;
mod shutdown;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use drover_core::events::{EventBus, WorkerEvent};
use drover_core::models::ConnectionConfig;
use drover_engine::executor::{ExecutorConfig, ProcessExecutor};
use drover_engine::heartbeat::HeartbeatService;
use drover_engine::security::SecurityPolicy;
use drover_engine::{Engine, EngineSettings};
use drover_transport::{CommunicationManager, Transport};

use crate::cli::Cli;
use crate::shutdown::{ShutdownPhase, watch_ctrl_c};

/// Surface the interesting domain events in the log stream.
fn spawn_event_logger(events: &EventBus) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            };
            match event {
                WorkerEvent::ProtocolFallback { from, to, reason } => {
                    warn!(?from, ?to, reason, "protocol fallback");
                }
                WorkerEvent::ProtocolUpgrade { from, to } => {
                    info!(?from, ?to, "protocol upgrade");
                }
                WorkerEvent::ReconnectionSuccess { attempt, replayed } => {
                    info!(attempt, replayed, "reconnected to master");
                }
                WorkerEvent::MessageDropped {
                    message_type,
                    reason,
                    dropped_count,
                } => {
                    warn!(message_type, reason, dropped_count, "message dropped");
                }
                _ => {}
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let identity = config::ensure_identity()?;
    let node_id = if cli.node_id.is_empty() {
        identity.machine_code.clone()
    } else {
        cli.node_id.clone()
    };

    let connection = ConnectionConfig {
        master_url: cli.master_url.clone(),
        node_id: node_id.clone(),
        api_key: cli.api_key.clone(),
        machine_code: identity.machine_code.clone(),
        secret_key: cli.secret_key.clone(),
        stream_port: cli.stream_port,
        prefer_stream: !cli.no_stream,
        heartbeat_interval: Duration::from_secs(cli.heartbeat_interval.max(1)),
        reconnect_base_delay: Duration::from_secs(cli.reconnect_base_delay.max(1)),
        reconnect_max_delay: Duration::from_secs(cli.reconnect_max_delay.max(1)),
    };

    let events = EventBus::new();
    spawn_event_logger(&events);

    let transport: Arc<CommunicationManager> = Arc::new(CommunicationManager::new(events.clone()));
    info!(master = %connection.master_url, node_id = %node_id, "connecting to master");
    while !transport.connect(&connection).await {
        warn!("master unreachable, retrying in 10s");
        tokio::time::sleep(Duration::from_secs(10)).await;
    }
    info!(protocol = ?transport.current_protocol(), "connected");

    let executor = Arc::new(ProcessExecutor::new(ExecutorConfig {
        default_timeout: Duration::from_secs(cli.task_timeout.max(1)),
        scoped_tmp: cli.scoped_tmp,
        security: SecurityPolicy {
            scan_sources: cli.scan_sources,
            scan_archives: cli.scan_archives,
        },
        ..Default::default()
    }));

    let engine = Engine::builder(transport.clone(), executor)
        .settings(EngineSettings {
            max_concurrent: cli.max_concurrent as usize,
            memory_limit_mb: cli.memory_limit_mb,
            cpu_limit_seconds: cli.cpu_limit_secs,
            persist_path: cli.persist_queue.clone(),
            ..Default::default()
        })
        .events(events.clone())
        .build();

    let heartbeat = {
        let engine = engine.clone();
        HeartbeatService::new(
            transport.clone(),
            &node_id,
            connection.heartbeat_interval,
            Arc::new(move || engine.task_counts()),
        )
    };

    engine.start().await;
    heartbeat.start().await;
    info!(workers = cli.max_concurrent, "drover worker ready");

    let mut shutdown = watch_ctrl_c();
    match shutdown.next().await {
        ShutdownPhase::Drain => {
            info!(
                grace_secs = cli.stop_grace,
                "stop requested, draining in-flight runs (press CTRL+C again to exit immediately)"
            );
        }
        ShutdownPhase::Exit => std::process::exit(130),
    }

    let stop = {
        let engine = engine.clone();
        let grace = Duration::from_secs(cli.stop_grace);
        tokio::spawn(async move { engine.stop(grace).await })
    };
    tokio::select! {
        _ = stop => {}
        phase = shutdown.next() => {
            if phase == ShutdownPhase::Exit {
                warn!("stop requested again, exiting immediately");
                std::process::exit(130);
            }
        }
    }

    heartbeat.stop().await;
    transport.disconnect().await;
    info!("drover worker stopped");
    Ok(())
}
