//! External service contracts.
//!
//! The engine never talks to a directory, a control transport, or a
//! bulk-data broker directly — it consumes these three traits. Concrete
//! adapters (cloud directory clients, WebSocket multiplexers, relay
//! listeners, polling streams) live outside this crate and only need to
//! satisfy these contracts.

use std::time::Duration;

use async_trait::async_trait;
use farsock_wire::{CodecId, Message, NameRecord, RecordKind, Reference};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ProxyError;

/// What a directory lookup should match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryTarget {
    /// A specific control-channel address.
    Address(Reference),
    /// A named host (unresolved application-level name).
    Host(String),
    /// A set of locally bound addresses.
    Bound(Vec<String>),
    /// Every record of the requested kind.
    Any,
}

/// A directory query: target plus the record kinds of interest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameQuery {
    pub target: QueryTarget,
    pub kind: RecordKind,
}

impl NameQuery {
    pub fn new(target: QueryTarget, kind: RecordKind) -> Self {
        NameQuery { target, kind }
    }

    /// Proxies able to service a named host.
    pub fn proxies_for_host(host: impl Into<String>) -> Self {
        NameQuery::new(QueryTarget::Host(host.into()), RecordKind::PROXY)
    }

    /// Every proxy currently in the directory.
    pub fn any_proxies() -> Self {
        NameQuery::new(QueryTarget::Any, RecordKind::PROXY)
    }

    /// Split a bound-address query into one sub-query per address.
    ///
    /// Every other target is already a single lookup.
    pub fn expand(&self) -> Vec<NameQuery> {
        match &self.target {
            QueryTarget::Bound(addrs) if !addrs.is_empty() => addrs
                .iter()
                .map(|a| NameQuery::new(QueryTarget::Bound(vec![a.clone()]), self.kind))
                .collect(),
            _ => vec![self.clone()],
        }
    }
}

/// The name/directory service.
#[async_trait]
pub trait NameService: Send + Sync {
    /// Stream matching records; the receiver closes when the query is done.
    async fn lookup(
        &self,
        query: NameQuery,
    ) -> Result<mpsc::Receiver<NameRecord>, ProxyError>;

    /// Create, merge, or prune a record. With `add_reference` the record's
    /// references are added to the stored entry; without it they are removed.
    async fn update(&self, record: &NameRecord, add_reference: bool)
        -> Result<(), ProxyError>;
}

/// Request/response RPC to one specific proxy.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// One logical RPC. `timeout` of `None` relies on cancellation alone.
    /// No ordering guarantee across concurrent calls.
    async fn call(
        &self,
        proxy: &NameRecord,
        msg: Message,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Message, ProxyError>;
}

/// Brokers the bulk-data channel for a link.
#[async_trait]
pub trait StreamService: Send + Sync {
    async fn create_connection(
        &self,
        stream_id: Reference,
        remote_id: Reference,
        proxy: &NameRecord,
        codec: CodecId,
    ) -> Result<Box<dyn Connection>, ProxyError>;
}

/// One brokered bulk-data channel, owned by exactly one link.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Transport-specific string the remote peer uses to attach.
    fn connection_string(&self) -> String;

    /// Whether the remote drains this connection by polling.
    fn is_polled(&self) -> bool;

    /// Wait until the remote peer attaches its side, then hand over the
    /// message stream. The mechanism is transport-specific: an accept, a
    /// relay handshake, or the first poll.
    async fn open(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<MessageStream, ProxyError>;

    /// Tear down the channel. Safe to call on a half-open connection.
    async fn close(&mut self);
}

/// FIFO duplex message pipe between a link and its transport.
pub struct MessageStream {
    tx: mpsc::Sender<Message>,
    rx: mpsc::Receiver<Message>,
}

impl MessageStream {
    /// Two cross-wired endpoints; each side's `send` feeds the other's
    /// `recv` queue, bounded at `capacity`.
    pub fn pair(capacity: usize) -> (MessageStream, MessageStream) {
        let capacity = capacity.max(1);
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (
            MessageStream { tx: a_tx, rx: b_rx },
            MessageStream { tx: b_tx, rx: a_rx },
        )
    }

    pub async fn send(
        &self,
        msg: Message,
        cancel: &CancellationToken,
    ) -> Result<(), ProxyError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ProxyError::Cancelled),
            sent = self.tx.send(msg) => {
                sent.map_err(|_| ProxyError::Socket(farsock_wire::FaultCode::Closed))
            }
        }
    }

    pub async fn recv(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Message, ProxyError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ProxyError::Cancelled),
            msg = self.rx.recv() => {
                msg.ok_or(ProxyError::Socket(farsock_wire::FaultCode::Closed))
            }
        }
    }

    /// A standalone sender for this stream's outbound direction.
    pub fn sender(&self) -> mpsc::Sender<Message> {
        self.tx.clone()
    }

    /// Split into raw halves for independent pump tasks.
    pub fn into_split(self) -> (mpsc::Sender<Message>, mpsc::Receiver<Message>) {
        (self.tx, self.rx)
    }
}

/// The injected service bundle. Passed into every socket constructor —
/// there is no process-wide default provider.
#[derive(Clone)]
pub struct Services {
    pub directory: std::sync::Arc<dyn NameService>,
    pub control: std::sync::Arc<dyn ControlChannel>,
    pub streams: std::sync::Arc<dyn StreamService>,
}
