use anyhow::Context;
use fillrelay::api::{self, AppState};
use fillrelay::config::{Config, SinkKind};
use fillrelay::orchestration::{BulkFetcher, Reconciler};
use fillrelay::sink::{LogSink, NotificationSink, WebhookSink};
use fillrelay::stream::{HyperliquidStreamConnector, StreamListener};
use fillrelay::{init_db, FillHistorySource, HyperliquidDataSource, Repository};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

const INBOX_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .init();

    let config = Config::from_env().context("Configuration error")?;
    let user = config.monitored_user.clone();

    let pool = init_db(&config.database_path)
        .await
        .context("Failed to initialize database")?;
    let repo = Arc::new(Repository::new(pool));

    let source: Arc<dyn FillHistorySource> = Arc::new(HyperliquidDataSource::with_timeout(
        config.hyperliquid_api_url.clone(),
        config.fetch_timeout,
    ));
    let fetcher = Arc::new(
        BulkFetcher::new(source, user.clone(), config.fetch_retry, config.recovery_scan)
            .with_attempt_timeout(config.fetch_timeout),
    );

    let sink: Arc<dyn NotificationSink> = match &config.sink {
        SinkKind::Log => Arc::new(LogSink),
        SinkKind::Webhook { url } => Arc::new(WebhookSink::new(url.clone())),
    };

    let reconciler = Reconciler::new(
        user.clone(),
        config.reconciler_config(),
        fetcher,
        repo,
        sink,
    );
    let status = reconciler.subscribe_status();

    let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = StreamListener::new(
        Arc::new(HyperliquidStreamConnector::new(
            config.hyperliquid_ws_url.clone(),
        )),
        user.clone(),
        config.listener_config(),
        inbox_tx.clone(),
    );

    let mut reconciler_task = tokio::spawn(reconciler.run(inbox_rx, shutdown_rx.clone()));
    let listener_task = tokio::spawn(listener.run(shutdown_rx.clone()));

    let app = api::create_router(AppState::new(status, inbox_tx));
    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let tcp = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!(%addr, user = %user, "Server listening");

    let mut server_shutdown = shutdown_rx.clone();
    let server_task = tokio::spawn(async move {
        axum::serve(tcp, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.wait_for(|stop| *stop).await;
            })
            .await
    });

    let early_exit = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
            None
        }
        joined = &mut reconciler_task => Some(joined),
    };

    shutdown_tx.send_replace(true);

    let reconciler_result = match early_exit {
        Some(joined) => {
            warn!("Reconciler exited before shutdown");
            joined
        }
        None => reconciler_task.await,
    };
    if let Err(e) = listener_task.await {
        warn!(error = %e, "Stream listener task failed");
    }
    match server_task.await {
        Ok(Err(e)) => warn!(error = %e, "Server error"),
        Err(e) => warn!(error = %e, "Server task failed"),
        Ok(Ok(())) => {}
    }

    reconciler_result
        .context("Reconciler task panicked")?
        .context("Reconciler failed")?;
    info!("Shutdown complete");
    Ok(())
}
