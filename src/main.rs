use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use health_reminders::api::reminder_routes;
use health_reminders::config::{DeliveryConfig, ServerConfig};
use health_reminders::reminders::{DeliveryAgent, LogSink, spawn_delivery_loop};
use health_reminders::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let server_config = ServerConfig::from_env().context("Invalid server configuration")?;
    let delivery_config = DeliveryConfig::from_env().context("Invalid delivery configuration")?;

    let _log_guard = init_tracing(server_config.log_dir.as_deref());

    let port = server_config.port;
    eprintln!("🔔 Health Reminders v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", server_config.db_path.display());
    eprintln!("   API: http://0.0.0.0:{}/api", port);
    eprintln!("   History WS: ws://0.0.0.0:{}/ws/notifications", port);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&server_config.db_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to open database at {}",
                    server_config.db_path.display()
                )
            })?,
    );

    // ── Delivery Agent ───────────────────────────────────────────────────
    let agent = Arc::new(DeliveryAgent::new(
        Arc::clone(&db),
        Arc::new(LogSink),
        delivery_config.clone(),
    ));
    let cancel = CancellationToken::new();

    let loop_handle = if delivery_config.enabled {
        eprintln!(
            "   Delivery: every {}s (lookahead {}s, catch-up {}s)",
            delivery_config.tick_interval.as_secs(),
            delivery_config.lookahead.as_secs(),
            delivery_config.catchup_window.as_secs(),
        );
        Some(spawn_delivery_loop(Arc::clone(&agent), cancel.child_token()))
    } else {
        eprintln!("   Delivery: disabled");
        None
    };
    eprintln!("   Waiting for identity handshake on POST /api/identity\n");

    // ── Bridge API ───────────────────────────────────────────────────────
    let app = reminder_routes(Arc::clone(&db), Arc::clone(&agent));
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind port {port}"))?;
    info!(port, "Bridge API started");

    let shutdown = cancel.child_token();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");
    cancel.cancel();

    if let Some(handle) = loop_handle {
        handle.await.context("Delivery loop panicked")?;
    }
    server
        .await
        .context("Bridge API task panicked")?
        .context("Bridge API failed")?;

    Ok(())
}

/// Stderr logging, plus a daily-rolling file when `log_dir` is set.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// life of the process.
fn init_tracing(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer().with_target(false);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "health-reminders.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    guard
}
