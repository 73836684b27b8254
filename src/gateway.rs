use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::amqp::{AmqpDialer, Connection, ConnectionHandle, Dialer};
use crate::cache::CacheServer;
use crate::config::{Config, ConnectionConfig};
use crate::dispatch::{MessageDispatcher, StatusDispatcher};
use crate::export::metrics::GatewayMetrics;
use crate::export::scrape::ScrapeCollector;
use crate::export::Exporter;
use crate::health::HealthRecord;

/// Gateway wires the bus connections, dispatchers, cache and scrape endpoint.
pub struct Gateway {
    cfg: Config,
    exporter: Exporter,
    metrics: Arc<GatewayMetrics>,
    health: Arc<HealthRecord>,
    cache: Arc<CacheServer>,
    connections: Vec<ConnectionHandle>,
    done: Vec<oneshot::Receiver<()>>,
    dispatchers: Vec<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
    /// Stops receive tasks. Cancelled first on shutdown.
    connections_cancel: CancellationToken,
    cancel: CancellationToken,
}

impl Gateway {
    /// Creates the gateway and registers its metrics. Nothing runs until
    /// [`Gateway::start`].
    pub fn new(cfg: Config) -> Result<Self> {
        let exporter = Exporter::new(&cfg.exporter.addr);
        let metrics = Arc::new(
            GatewayMetrics::new(exporter.registry()).context("registering gateway metrics")?,
        );
        let health = Arc::new(HealthRecord::new());
        let cache = Arc::new(CacheServer::new(cfg.cache.ttl));

        let collector = ScrapeCollector::new(
            Arc::clone(cache.cache()),
            Arc::clone(&health),
            cfg.exporter.use_timestamp,
        )
        .context("creating scrape collector")?;
        exporter
            .registry()
            .register(Box::new(collector))
            .context("registering scrape collector")?;

        let cancel = CancellationToken::new();

        Ok(Self {
            cfg,
            exporter,
            metrics,
            health,
            cache,
            connections: Vec::new(),
            done: Vec::new(),
            dispatchers: Vec::new(),
            local_addr: None,
            connections_cancel: cancel.child_token(),
            cancel,
        })
    }

    /// Start every component, connecting over AMQP 1.0.
    pub async fn start(&mut self) -> Result<()> {
        let unique_name = self.cfg.unique_name.clone();
        let prefetch = self.cfg.prefetch;

        self.start_with(|_, conn| AmqpDialer::new(&conn.url, &unique_name, prefetch))
            .await
    }

    /// Start every component, building one dialer per configured connection.
    ///
    /// Fails if any endpoint cannot be reached on the first attempt.
    pub async fn start_with<D, F>(&mut self, mut dialer_for: F) -> Result<()>
    where
        D: Dialer,
        F: FnMut(usize, &ConnectionConfig) -> Result<D>,
    {
        // 1. Scrape endpoint first so health checks respond while connecting.
        let addr = self
            .exporter
            .start()
            .await
            .context("starting metrics exporter")?;
        self.local_addr = Some(addr);

        // 2. Cache ingestion worker.
        self.cache
            .start(self.cancel.child_token())
            .await
            .context("starting cache server")?;

        // 3. Connections. The first dial of each must succeed.
        for (index, conn) in self.cfg.connections.iter().enumerate() {
            let settings = self
                .cfg
                .connection_settings(index)
                .with_context(|| format!("missing settings for connection {index}"))?;
            let dialer = dialer_for(index, conn)
                .with_context(|| format!("configuring connection {index}"))?;
            let metrics = self.metrics.connection(dialer.endpoint());

            let mut handle =
                Connection::start(settings, dialer, metrics, &self.connections_cancel).await?;

            if let Some(done) = handle.take_done() {
                self.done.push(done);
            }
            self.connections.push(handle);
        }

        // 4. Fan-in.
        let messages = MessageDispatcher::new(&mut self.connections, self.cancel.child_token());
        let status = StatusDispatcher::new(&mut self.connections, self.cancel.child_token());

        self.dispatchers.push(tokio::spawn(
            messages.run(Arc::clone(&self.cache), Arc::clone(&self.metrics)),
        ));
        self.dispatchers
            .push(tokio::spawn(status.run(Arc::clone(&self.health))));

        info!(
            connections = self.connections.len(),
            addr = %addr,
            "gateway started",
        );

        Ok(())
    }

    /// Resolves once every connection has received its configured message
    /// count. Never resolves when no count is configured.
    pub async fn drained(&mut self) {
        if self.cfg.message_count.is_none() || self.done.is_empty() {
            std::future::pending::<()>().await;
        }

        for done in std::mem::take(&mut self.done) {
            // A connection that ended some other way will not produce more.
            let _ = done.await;
        }

        info!("all connections drained");
    }

    /// Gracefully stop all components.
    ///
    /// Connections stop first so the dispatchers can forward what is
    /// already buffered before the cache worker drains and exits.
    pub async fn stop(&mut self) -> Result<()> {
        self.connections_cancel.cancel();
        for handle in &mut self.connections {
            handle.join().await;
        }

        for task in self.dispatchers.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "dispatcher task join failed");
            }
        }

        self.cancel.cancel();

        self.cache.wait_for_shutdown().await;

        if let Err(e) = self.exporter.stop().await {
            error!(error = %e, "error stopping metrics exporter");
        }

        info!("gateway stopped");

        Ok(())
    }

    /// Address the scrape endpoint is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn health(&self) -> &Arc<HealthRecord> {
        &self.health
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    pub fn cache(&self) -> &Arc<CacheServer> {
        &self.cache
    }

    pub fn connections(&self) -> &[ConnectionHandle] {
        &self.connections
    }
}
