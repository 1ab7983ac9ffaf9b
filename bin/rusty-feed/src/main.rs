//! # Rusty-Feed Worker
//!
//! Assembles the engine from the configured plugins and runs the async ingestion consumer
//! until SIGINT or SIGTERM.
//!
//! This is wiring only. The broker is the in-process `LocalBroker`, and nothing in this
//! process publishes to it: posts arrive once a request surface embedding `FeedService`
//! calls `create_post_async`, or once a networked broker plugin replaces `LocalBroker`
//! behind the same `MessageBroker` port. Until then the worker idles until it is signalled.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use rf_broker_local::LocalBroker;
use rf_config::{IndexBackend, LogFormat, Settings};
use rf_core::{OrderedIndex, SystemClock};
use rf_db_sqlite::SqliteFeedStore;
use rf_engine::ids::epoch_from_date;
use rf_engine::{EngineConfig, FeedService, StoreGuard, VotePolicy};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("loading settings")?;
    init_tracing(&settings);

    // 1. Durable store
    let durable = Arc::new(
        SqliteFeedStore::new(&settings.database.url, settings.database.max_connections)
            .await
            .context("opening the durable store")?,
    );

    // 2. Ordered index
    let index = build_index(&settings)?;

    // 3. Broker
    let broker = Arc::new(LocalBroker::new(settings.ingest.queue_capacity));

    // 4. Engine
    let service = FeedService::new(
        engine_config(&settings)?,
        durable,
        index,
        broker.clone(),
        Arc::new(SystemClock),
    )
    .context("building the feed service")?;
    let mut registry = Registry::with_prefix("rusty_feed");
    service.metrics().register(&mut registry);

    let (stop_tx, stop_rx) = watch::channel(false);
    let consumer = service.ingest_consumer();
    let worker = tokio::spawn(async move { consumer.run(stop_rx).await });

    info!(
        index = ?settings.index.backend,
        queue_capacity = settings.ingest.queue_capacity,
        "🚀 Rusty-Feed worker running"
    );
    shutdown_signal().await;

    // Stop intake first, then let the consumer finish its current delivery.
    broker.close();
    if stop_tx.send(true).is_err() {
        warn!("consumer already gone");
    }
    match tokio::time::timeout(Duration::from_secs(10), worker).await {
        Ok(Ok(Ok(()))) => info!("consumer stopped"),
        Ok(Ok(Err(e))) => warn!(error = %e, "consumer ended with an error"),
        Ok(Err(e)) => warn!(error = %e, "consumer task panicked"),
        Err(_) => warn!("consumer did not stop in time"),
    }

    let mut exposition = String::new();
    encode(&mut exposition, &registry).context("encoding metrics")?;
    info!(metrics = %exposition, "final counters");
    Ok(())
}

fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log.level));
    match settings.log.format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

fn build_index(settings: &Settings) -> anyhow::Result<Arc<dyn OrderedIndex>> {
    match settings.index.backend {
        #[cfg(feature = "index-redis")]
        IndexBackend::Redis => {
            let url = settings
                .index
                .redis_url
                .as_ref()
                .context("index.redis_url is required for the redis backend")?;
            Ok(Arc::new(rf_index_redis::RedisIndex::new(url, settings.index.pool_size)?))
        }
        #[cfg(feature = "index-memory")]
        IndexBackend::Memory => Ok(Arc::new(rf_index_memory::MemoryIndex::new())),
        #[allow(unreachable_patterns)]
        other => anyhow::bail!("index backend {other:?} was not compiled in"),
    }
}

fn engine_config(settings: &Settings) -> anyhow::Result<EngineConfig> {
    Ok(EngineConfig {
        machine_id: settings.machine_id,
        id_epoch: epoch_from_date(&settings.id_epoch)?,
        key_prefix: settings.index.key_prefix.clone(),
        intersection_ttl: settings.index.intersection_ttl(),
        vote: VotePolicy {
            score_per_vote: settings.vote.score_per_vote,
            grace_window: Duration::from_secs(settings.vote.grace_window_secs),
            post_reduced_weight: settings.vote.post_reduced_weight,
            comment_reduced_weight: settings.vote.comment_reduced_weight,
        },
        wire_format: settings.ingest.wire_format,
        redelivery_backoff: Duration::from_millis(settings.ingest.redelivery_backoff_ms),
        guard: StoreGuard::new(
            Duration::from_millis(settings.store.op_timeout_ms),
            settings.store.max_retries,
            Duration::from_millis(settings.store.retry_base_ms),
        ),
        max_page_size: settings.pagination.max_page_size,
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
