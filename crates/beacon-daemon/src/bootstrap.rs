// SPDX-License-Identifier: MIT OR Apache-2.0

//! Construction of the full runner from configuration.
//!
//! Lifecycle: config → telemetry → kv → store → trust registry → queue →
//! executor → transparency log → router; background loops spawn last and
//! are joined in reverse order on shutdown.

use crate::consumer::{Consumer, spawn_queue_maintenance};
use crate::{AppState, build_app};
use anyhow::Context as _;
use axum::Router;
use beacon_admission::{AdmissionConfig, AdmissionPipeline};
use beacon_config::{PortStrategy, ProviderBackend, RunnerConfig};
use beacon_core::{Clock, SystemClock};
use beacon_executor::{ExecutorConfig, MultiRegionExecutor, StaticGeoIpResolver};
use beacon_kv::{Kv, MemoryKv, RedisKv};
use beacon_provider::ProviderClient;
use beacon_provider_mock::{MockProvider, MockProviderClient};
use beacon_queue::{QueueConfig, WorkQueue};
use beacon_store::{JobStore, MemoryStore, OutboxPublisher, PgStore};
use beacon_telemetry::Metrics;
use beacon_translog::TransparencyLog;
use beacon_trust::{ReceiptSigner, TrustRegistry, spawn_reloader};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A fully wired runner.
pub struct Runner {
    /// Shared handler state.
    pub state: AppState,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// Build a runner from configuration, using the provider backend the
/// configuration selects.
pub async fn build(config: RunnerConfig) -> anyhow::Result<Runner> {
    build_with_provider(config, None).await
}

/// Build a runner, optionally injecting a provider client (the real
/// marketplace client is wired this way by the embedding service).
pub async fn build_with_provider(
    config: RunnerConfig,
    provider_override: Option<Arc<dyn ProviderClient>>,
) -> anyhow::Result<Runner> {
    for warning in beacon_config::validate(&config).context("invalid configuration")? {
        warn!(%warning, "configuration warning");
    }
    let config = Arc::new(config);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let metrics = Metrics::new();

    let kv: Arc<dyn Kv> = match &config.redis_url {
        Some(url) => Arc::new(
            RedisKv::connect(url)
                .await
                .context("redis connection failed")?,
        ),
        None => Arc::new(MemoryKv::new(clock.clone())),
    };

    let store: Arc<dyn JobStore> = match &config.database_url {
        Some(url) => Arc::new(
            PgStore::connect(url, Duration::from_secs(config.db_timeout_secs))
                .await
                .context("postgres connection failed")?,
        ),
        None => Arc::new(MemoryStore::new(clock.clone())),
    };

    let registry = Arc::new(match &config.trusted_keys_file {
        Some(path) => {
            TrustRegistry::from_file(path, clock.clone()).context("trusted keys load failed")?
        }
        None => TrustRegistry::empty(clock.clone()),
    });

    let queue = Arc::new(WorkQueue::new(
        kv.clone(),
        clock.clone(),
        QueueConfig {
            name: config.jobs_queue_name.clone(),
            visibility_timeout: Duration::from_secs(config.visibility_timeout_secs),
            max_attempts: config.max_queue_attempts,
            backoff_base: Duration::from_secs(config.retry_backoff_base_secs),
            max_backoff: Duration::from_secs(300),
        },
        queue_breaker_config(),
    ));

    let signer = match &config.receipt_private_key {
        Some(seed) => Some(ReceiptSigner::from_b64(seed).context("receipt key load failed")?),
        None => None,
    };

    let provider: Arc<dyn ProviderClient> = match provider_override {
        Some(client) => client,
        None => match config.provider_backend {
            ProviderBackend::Mock => Arc::new(MockProviderClient::new(demo_fleet())),
            ProviderBackend::Real => anyhow::bail!(
                "provider_backend = \"real\" requires the marketplace client to be \
                 injected via build_with_provider"
            ),
        },
    };

    let translog = Arc::new(TransparencyLog::default());
    let executor = Arc::new(MultiRegionExecutor::new(
        provider,
        Arc::new(StaticGeoIpResolver::mock_fleet()),
        store.clone(),
        translog.clone(),
        kv.clone(),
        signer,
        metrics.clone(),
        clock.clone(),
        ExecutorConfig::default(),
    ));

    let pipeline = Arc::new(AdmissionPipeline::new(
        registry.clone(),
        store.clone(),
        kv.clone(),
        metrics.clone(),
        clock.clone(),
        AdmissionConfig {
            trust_enforce: config.trust_enforce,
            sig_bypass: config.sig_bypass,
            replay_protection: config.replay_protection_enabled,
            max_skew: Duration::from_secs(config.timestamp_max_skew_secs),
            max_age: Duration::from_secs(config.timestamp_max_age_secs),
        },
        config.jobs_queue_name.clone(),
    ));

    let state = AppState {
        pipeline,
        store: store.clone(),
        queue: queue.clone(),
        executor: executor.clone(),
        translog,
        metrics,
        config: config.clone(),
    };

    // Background loops. Spawn order is the reverse of join order.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    if config.trusted_keys_file.is_some() {
        handles.push(spawn_reloader(
            registry,
            Duration::from_secs(config.trusted_keys_reload_secs),
            shutdown_rx.clone(),
        ));
    }

    let publisher = OutboxPublisher::new(
        store.clone(),
        queue.clone(),
        Duration::from_millis(config.outbox_tick_ms),
    );
    handles.push(tokio::spawn(publisher.run(shutdown_rx.clone())));

    handles.push(spawn_queue_maintenance(
        queue.clone(),
        Duration::from_secs(1),
        shutdown_rx.clone(),
    ));

    for i in 0..config.worker_count {
        let consumer = Consumer::new(
            format!("worker-{i}"),
            queue.clone(),
            store.clone(),
            executor.clone(),
            Duration::from_secs(config.worker_fetch_timeout_secs),
        );
        handles.push(tokio::spawn(consumer.run(shutdown_rx.clone())));
    }

    info!(
        queue = %config.jobs_queue_name,
        workers = config.worker_count,
        "runner assembled"
    );

    Ok(Runner {
        state,
        shutdown_tx,
        handles,
    })
}

fn queue_breaker_config() -> beacon_breaker::BreakerConfig {
    beacon_breaker::BreakerConfig {
        max_failures: 5,
        open_timeout: Duration::from_secs(30),
        half_open_max_requests: 1,
        success_threshold: 1,
    }
}

/// The simulated fleet wired for `provider_backend = "mock"`: one healthy
/// provider per canonical region.
fn demo_fleet() -> Vec<MockProvider> {
    vec![
        MockProvider::healthy("mock-us-1", "US"),
        MockProvider::healthy("mock-eu-1", "EU"),
        MockProvider::healthy("mock-asia-1", "ASIA"),
    ]
}

impl Runner {
    /// The HTTP router over this runner's state.
    pub fn router(&self) -> Router {
        build_app(self.state.clone())
    }

    /// Bind a listener according to the configured port strategy.
    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        let port = self.state.config.http_port;
        match self.state.config.port_strategy {
            PortStrategy::Fixed => TcpListener::bind(("0.0.0.0", port))
                .await
                .with_context(|| format!("cannot bind fixed port {port}")),
            PortStrategy::Fallback => {
                for candidate in port..port.saturating_add(10) {
                    if let Ok(listener) = TcpListener::bind(("0.0.0.0", candidate)).await {
                        if candidate != port {
                            warn!(requested = port, bound = candidate, "fell back to a nearby port");
                        }
                        return Ok(listener);
                    }
                }
                anyhow::bail!("no free port in {port}..{}", port.saturating_add(10))
            }
            PortStrategy::Ephemeral => TcpListener::bind(("0.0.0.0", 0))
                .await
                .context("cannot bind ephemeral port"),
        }
    }

    /// Serve until interrupted, then shut the background loops down.
    pub async fn serve(mut self) -> anyhow::Result<()> {
        let listener = self.bind().await?;
        let addr = listener.local_addr().context("listener address")?;
        info!(%addr, "http surface listening");

        let router = self.router();
        let shutdown_tx = self.shutdown_tx.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                info!("interrupt received; shutting down");
                let _ = shutdown_tx.send(true);
            })
            .await
            .context("http server failed")?;

        self.join_background().await;
        Ok(())
    }

    /// Flip the shutdown signal and join every loop, newest first.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        self.join_background().await;
    }

    async fn join_background(&mut self) {
        while let Some(handle) = self.handles.pop() {
            if let Err(err) = handle.await {
                warn!(error = %err, "background task join failed");
            }
        }
    }
}
