//! Transport seam between the connection state machine and the wire.
//!
//! [`Dialer`] opens links and [`Link`] yields accepted message bodies.
//! The AMQP 1.0 implementation uses `fe2o3-amqp`; other implementations
//! exist so the reconnect logic can be driven without a broker.

use std::future::Future;

use anyhow::{bail, Context, Result};
use fe2o3_amqp::connection::ConnectionHandle;
use fe2o3_amqp::link::receiver::CreditMode;
use fe2o3_amqp::link::{LinkStateError, RecvError};
use fe2o3_amqp::session::SessionHandle;
use fe2o3_amqp::types::messaging::{AmqpValue, Body, Data};
use fe2o3_amqp::types::primitives::Value;
use fe2o3_amqp::{Connection, Receiver, Session};
use thiserror::Error;
use tracing::debug;

/// Errors surfaced by [`Link::recv`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The peer closed the link deliberately. The connection stops
    /// without reconnecting.
    #[error("link closed by peer")]
    Closed,

    /// Any other receive failure. The connection reconnects.
    #[error("transport fault: {0}")]
    Transport(String),
}

/// Opens receiving links to one bus endpoint.
pub trait Dialer: Send + Sync + 'static {
    type Link: Link;

    /// Endpoint URL, for logging and metric labels.
    fn endpoint(&self) -> &str;

    /// Dial the endpoint and attach a receiving link.
    fn dial(&self) -> impl Future<Output = Result<Self::Link>> + Send;
}

/// An attached receiving link.
pub trait Link: Send + 'static {
    /// Wait for the next message, accept it and return its body.
    fn recv(&mut self) -> impl Future<Output = Result<Vec<u8>, LinkError>> + Send;

    /// Release the transport. Calling it on a closed link does nothing.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// A parsed `amqp://host:port/address` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// URL as configured.
    pub url: String,
    pub scheme: String,
    /// `host[:port]`, possibly with credentials.
    pub authority: String,
    /// Source address of the receiving link (the URL path without its
    /// leading slash).
    pub address: String,
}

impl Endpoint {
    /// Parse an endpoint URL. A missing scheme defaults to `amqp`.
    pub fn parse(url: &str) -> Result<Self> {
        let trimmed = url.trim();
        if trimmed.is_empty() {
            bail!("endpoint URL is empty");
        }

        let (scheme, rest) = match trimmed.split_once("://") {
            Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
            None => ("amqp".to_string(), trimmed),
        };

        if scheme != "amqp" && scheme != "amqps" {
            bail!("unsupported scheme {scheme:?} in endpoint {trimmed}");
        }

        let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
        if authority.is_empty() {
            bail!("endpoint {trimmed} has no host");
        }

        let address = path.trim_matches('/');
        if address.is_empty() {
            bail!("endpoint {trimmed} has no source address");
        }

        Ok(Self {
            url: trimmed.to_string(),
            scheme,
            authority: authority.to_string(),
            address: address.to_string(),
        })
    }

    /// URL of the broker itself, without the source address.
    pub fn broker_url(&self) -> String {
        format!("{}://{}", self.scheme, self.authority)
    }
}

/// AMQP 1.0 dialer for a single endpoint.
#[derive(Debug, Clone)]
pub struct AmqpDialer {
    endpoint: Endpoint,
    container_id: String,
    link_name: String,
    prefetch: u32,
}

impl AmqpDialer {
    /// Creates a dialer. `prefetch` is the credit window; 0 requests one
    /// message at a time.
    pub fn new(url: &str, unique_name: &str, prefetch: u32) -> Result<Self> {
        let endpoint = Endpoint::parse(url)?;

        Ok(Self {
            endpoint,
            container_id: format!("telemetry-gateway-{unique_name}"),
            link_name: format!("rcv{unique_name}"),
            prefetch,
        })
    }

    fn credit_mode(&self) -> CreditMode {
        CreditMode::Auto(self.prefetch.max(1))
    }
}

impl Dialer for AmqpDialer {
    type Link = AmqpLink;

    fn endpoint(&self) -> &str {
        &self.endpoint.url
    }

    async fn dial(&self) -> Result<AmqpLink> {
        let broker = self.endpoint.broker_url();

        let mut connection = Connection::open(self.container_id.clone(), broker.as_str())
            .await
            .with_context(|| format!("opening connection to {broker}"))?;

        let mut session = match Session::begin(&mut connection).await {
            Ok(session) => session,
            Err(e) => {
                let _ = connection.close().await;
                return Err(e).context("beginning session");
            }
        };

        let attached = Receiver::builder()
            .name(self.link_name.clone())
            .source(self.endpoint.address.clone())
            .credit_mode(self.credit_mode())
            .attach(&mut session)
            .await;

        let receiver = match attached {
            Ok(receiver) => receiver,
            Err(e) => {
                let _ = session.end().await;
                let _ = connection.close().await;
                return Err(e)
                    .with_context(|| format!("attaching receiver to {}", self.endpoint.address));
            }
        };

        Ok(AmqpLink {
            connection: Some(connection),
            session: Some(session),
            receiver: Some(receiver),
        })
    }
}

/// Receiving link plus the session and connection that carry it.
pub struct AmqpLink {
    connection: Option<ConnectionHandle<()>>,
    session: Option<SessionHandle<()>>,
    receiver: Option<Receiver>,
}

impl Link for AmqpLink {
    async fn recv(&mut self) -> Result<Vec<u8>, LinkError> {
        let Some(receiver) = self.receiver.as_mut() else {
            return Err(LinkError::Transport("link is not attached".to_string()));
        };

        loop {
            let delivery = receiver
                .recv::<Body<Value>>()
                .await
                .map_err(classify_recv_error)?;

            receiver
                .accept(&delivery)
                .await
                .map_err(|e| LinkError::Transport(format!("accepting delivery: {e}")))?;

            match body_bytes(delivery.into_message().body) {
                Some(bytes) => return Ok(bytes),
                None => debug!("skipping message with unsupported body section"),
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut receiver) = self.receiver.take() {
            if let Err(e) = receiver.close().await {
                debug!(error = %e, "closing receiver");
            }
        }
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.end().await {
                debug!(error = %e, "ending session");
            }
        }
        if let Some(mut connection) = self.connection.take() {
            if let Err(e) = connection.close().await {
                debug!(error = %e, "closing connection");
            }
        }
    }
}

fn classify_recv_error(err: RecvError) -> LinkError {
    match err {
        RecvError::LinkStateError(LinkStateError::RemoteClosed) => LinkError::Closed,
        other => LinkError::Transport(other.to_string()),
    }
}

/// Extract the payload from binary or string value sections, or from
/// (concatenated) data sections.
fn body_bytes(body: Body<Value>) -> Option<Vec<u8>> {
    match body {
        Body::Value(AmqpValue(Value::Binary(bytes))) => Some(bytes.into_vec()),
        Body::Value(AmqpValue(Value::String(text))) => Some(text.into_bytes()),
        Body::Data(batch) => Some(
            batch
                .into_iter()
                .flat_map(|Data(bytes)| bytes.into_vec())
                .collect(),
        ),
        _ => None,
    }
}
