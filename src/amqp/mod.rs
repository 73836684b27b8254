//! Per-endpoint connection lifecycle.
//!
//! A [`Connection`] dials its endpoint once during [`Connection::start`]
//! (failure there is fatal to the caller), then runs a receive task that
//! pushes accepted bodies into a bounded message buffer, reports link
//! status, and reconnects with a fixed backoff after transport faults.

pub mod transport;

use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use prometheus::Counter;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::health::LinkStatus;
use crate::incoming::DataSource;

pub use transport::{AmqpDialer, AmqpLink, Dialer, Endpoint, Link, LinkError};

/// Default delay between reconnect attempts.
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

/// A message body as received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub body: Vec<u8>,
    pub received_at: SystemTime,
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Active,
    Reconnecting,
    Closed,
}

/// Runtime settings for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Position of this connection in the configured list.
    pub index: usize,
    pub data_source: DataSource,
    /// Capacity of the message buffer.
    pub buffer_size: usize,
    pub reconnect_backoff: Duration,
    /// Stop after this many messages.
    pub message_count: Option<u64>,
}

/// Counters updated by the receive task.
#[derive(Debug, Clone)]
pub struct ConnectionMetrics {
    pub received: Counter,
    pub reconnects: Counter,
}

/// Handle to a running connection and its output streams.
///
/// The stream receivers are meant to be taken once by the dispatchers.
pub struct ConnectionHandle {
    index: usize,
    endpoint: String,
    data_source: DataSource,
    state: watch::Receiver<ConnectionState>,
    messages: Option<mpsc::Receiver<RawMessage>>,
    status: Option<mpsc::UnboundedReceiver<LinkStatus>>,
    done: Option<oneshot::Receiver<()>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ConnectionHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn data_source(&self) -> DataSource {
        self.data_source
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribe to lifecycle state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn take_messages(&mut self) -> Option<mpsc::Receiver<RawMessage>> {
        self.messages.take()
    }

    pub fn take_status(&mut self) -> Option<mpsc::UnboundedReceiver<LinkStatus>> {
        self.status.take()
    }

    /// Resolves once bounded-count mode has received every message.
    pub fn take_done(&mut self) -> Option<oneshot::Receiver<()>> {
        self.done.take()
    }

    /// Ask the receive task to release the transport and stop. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Waits for the receive task to exit.
    pub async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(endpoint = %self.endpoint, error = %e, "connection task join failed");
            }
        }
    }
}

/// Why the receive loop ended.
enum Exit {
    /// Shutdown signal or explicit close.
    Cancelled,
    /// Peer closed the link.
    RemoteClosed,
    /// Bounded-count mode reached its limit.
    Drained,
    /// The message buffer consumer went away.
    BufferClosed,
}

/// The receive side of one bus endpoint.
pub struct Connection<D: Dialer> {
    settings: ConnectionSettings,
    dialer: D,
    metrics: ConnectionMetrics,
    messages: mpsc::Sender<RawMessage>,
    status: mpsc::UnboundedSender<LinkStatus>,
    done: Option<oneshot::Sender<()>>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
}

impl<D: Dialer> Connection<D> {
    /// Dial the endpoint and spawn the receive task.
    ///
    /// Returns an error if the first dial fails; callers treat this as
    /// fatal. `ctx` is the process shutdown signal.
    pub async fn start(
        settings: ConnectionSettings,
        dialer: D,
        metrics: ConnectionMetrics,
        ctx: &CancellationToken,
    ) -> Result<ConnectionHandle> {
        let endpoint = dialer.endpoint().to_string();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (msg_tx, msg_rx) = mpsc::channel(settings.buffer_size.max(1));
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        let cancel = ctx.child_token();

        state_tx.send_replace(ConnectionState::Connecting);
        let link = dialer
            .dial()
            .await
            .with_context(|| format!("connecting to {endpoint}"))?;

        info!(
            endpoint = %endpoint,
            data_source = %settings.data_source,
            "connected to bus endpoint",
        );
        state_tx.send_replace(ConnectionState::Active);
        let _ = status_tx.send(LinkStatus::Up);

        let handle_settings = settings.clone();
        let connection = Self {
            settings,
            dialer,
            metrics,
            messages: msg_tx,
            status: status_tx,
            done: Some(done_tx),
            state: state_tx,
            cancel: cancel.clone(),
        };

        let task = tokio::spawn(connection.run(link));

        Ok(ConnectionHandle {
            index: handle_settings.index,
            endpoint,
            data_source: handle_settings.data_source,
            state: state_rx,
            messages: Some(msg_rx),
            status: Some(status_rx),
            done: Some(done_rx),
            cancel,
            task: Some(task),
        })
    }

    async fn run(mut self, mut link: D::Link) {
        let mut received: u64 = 0;

        let exit = loop {
            if self
                .settings
                .message_count
                .is_some_and(|limit| received >= limit)
            {
                break Exit::Drained;
            }

            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => break Exit::Cancelled,
                outcome = link.recv() => outcome,
            };

            match outcome {
                Ok(body) => {
                    received += 1;
                    self.metrics.received.inc();

                    let message = RawMessage {
                        body,
                        received_at: SystemTime::now(),
                    };

                    tokio::select! {
                        _ = self.cancel.cancelled() => break Exit::Cancelled,
                        sent = self.messages.send(message) => {
                            if sent.is_err() {
                                break Exit::BufferClosed;
                            }
                        }
                    }
                }
                Err(LinkError::Closed) => break Exit::RemoteClosed,
                Err(LinkError::Transport(reason)) => {
                    warn!(
                        endpoint = self.dialer.endpoint(),
                        reason = %reason,
                        "receive failed, reconnecting",
                    );
                    match self.reconnect(&mut link).await {
                        Some(fresh) => link = fresh,
                        None => break Exit::Cancelled,
                    }
                }
            }
        };

        link.close().await;
        self.state.send_replace(ConnectionState::Closed);

        let endpoint = self.dialer.endpoint();
        match exit {
            Exit::Drained => {
                info!(endpoint, received, "message count reached, connection done");
                if let Some(done) = self.done.take() {
                    let _ = done.send(());
                }
            }
            Exit::RemoteClosed => info!(endpoint, "link closed by peer"),
            Exit::BufferClosed => info!(endpoint, "message consumer gone, stopping"),
            Exit::Cancelled => info!(endpoint, "connection closed"),
        }
    }

    /// Close the faulted link and redial until success or shutdown.
    ///
    /// Reports `Down` once for the fault and once per failed attempt, and
    /// `Up` on success. Returns `None` if shutdown was requested.
    async fn reconnect(&mut self, link: &mut D::Link) -> Option<D::Link> {
        self.state.send_replace(ConnectionState::Reconnecting);
        let _ = self.status.send(LinkStatus::Down);

        loop {
            link.close().await;

            info!(
                endpoint = self.dialer.endpoint(),
                backoff = ?self.settings.reconnect_backoff,
                "reconnect attempt scheduled",
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.settings.reconnect_backoff) => {}
            }

            self.metrics.reconnects.inc();

            let attempt = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                attempt = self.dialer.dial() => attempt,
            };

            match attempt {
                Ok(fresh) => {
                    info!(endpoint = self.dialer.endpoint(), "reconnected");
                    self.state.send_replace(ConnectionState::Active);
                    let _ = self.status.send(LinkStatus::Up);
                    return Some(fresh);
                }
                Err(e) => {
                    warn!(
                        endpoint = self.dialer.endpoint(),
                        error = %e,
                        "reconnect attempt failed",
                    );
                    let _ = self.status.send(LinkStatus::Down);
                }
            }
        }
    }
}
