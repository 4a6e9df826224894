use anyhow::Result;
use energy_client::domain::Reading;
use relay_service::{
    api::{self, AppState},
    config::AppConfig,
    metrics_server,
    monitor::Monitor,
    observability,
    ota::{FirmwareRepository, OtaService},
    pipeline::Pipeline,
    pubsub::{BroadcastHub, PubSub, ALL_TOPICS, ENERGY_UPDATE_EVENT},
    registry::Registry,
    relay::Relay,
    reset::ResetTracker,
    sinks::{MonitorSink, PublishSink},
    sources::{RelayQueueSource, SubscriptionSource},
    store::{MemoryStore, PgStore, Store},
    transform,
};
use sqlx::postgres::PgPoolOptions;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;

    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    let store: Arc<dyn Store> = match &cfg.database {
        Some(db) => {
            let pool = PgPoolOptions::new()
                .max_connections(db.max_connections)
                .connect(&db.uri)
                .await?;
            Arc::new(PgStore::new(pool))
        }
        None => {
            tracing::warn!("no [database] section, state is kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let bus: Arc<dyn PubSub> = Arc::new(BroadcastHub::new(cfg.relay.channel_capacity));

    // Bus subscriber: liveness monitor. Subscribed before anything can publish.
    let monitor = Arc::new(Monitor::new(
        cfg.relay.cache_capacity,
        cfg.liveness.staleness_threshold(),
        cfg.liveness.tick_interval(),
    ));
    let monitor_pipeline: Pipeline<_, Reading, _> = Pipeline {
        name: "monitor",
        source: SubscriptionSource::new(bus.as_ref(), ALL_TOPICS, ENERGY_UPDATE_EVENT).await,
        transforms: vec![Arc::new(transform::ReadingValidation)],
        sink: MonitorSink::new(monitor.clone()),
    };

    // Relay -> bus publisher.
    let (queue, queue_source) = RelayQueueSource::channel(cfg.relay.channel_capacity);
    let publish_pipeline: Pipeline<_, Reading, _> = Pipeline {
        name: "publish",
        source: queue_source,
        transforms: Vec::new(),
        sink: PublishSink::new(
            bus.clone(),
            cfg.relay.publish_max_retries,
            Duration::from_millis(cfg.relay.publish_retry_backoff_ms),
        ),
    };

    let state = AppState {
        relay: Arc::new(Relay::new(store.clone(), cfg.relay.cache_capacity, queue)),
        resets: Arc::new(ResetTracker::new(
            store.clone(),
            time::Duration::hours(cfg.reset.session_ttl_hours),
        )),
        registry: Arc::new(Registry::new(store.clone())),
        ota: Arc::new(OtaService::new(
            store,
            FirmwareRepository::new(&cfg.ota.firmware_dir, cfg.ota.public_base_url.clone()),
        )),
        monitor: monitor.clone(),
        bus,
        device_token: cfg.http.device_auth_token.as_deref().map(Arc::from),
    };
    if state.device_token.is_none() {
        tracing::warn!("http.device_auth_token not set, device routes are open");
    }
    let app = api::router(state, cfg.http.max_body_bytes);

    let cancel = CancellationToken::new();
    let ticker = tokio::spawn(monitor.run(cancel.clone()));
    let monitor_task = tokio::spawn(monitor_pipeline.run());

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
            return;
        }
        tracing::info!("shutdown requested");
        signal_cancel.cancel();
    });

    let listener = tokio::net::TcpListener::bind(&cfg.http.bind_addr).await?;
    tracing::info!(addr = %cfg.http.bind_addr, "relay listening");

    let shutdown = cancel.clone();
    let server = async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok::<_, anyhow::Error>(())
    };
    // The router owns the relay's queue sender, so the publisher drains once the server stops.
    let publisher = async { publish_pipeline.run().await.map_err(anyhow::Error::from) };

    let result = tokio::try_join!(server, publisher);

    cancel.cancel();
    monitor_task.abort();
    let _ = ticker.await;

    result.map(|_| ())
}
