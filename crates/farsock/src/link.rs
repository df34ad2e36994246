//! One control+data session bound to one remote proxy.
//!
//! A link owns exactly one bulk-data [`Connection`], created and destroyed
//! with it, and runs two pump tasks once open:
//!   - Inbound: stream → filter → owning socket's receive pipe
//!   - Outbound: socket's bounded send pipe → stream
//!
//! Lifecycle: Created → AwaitingBrokering → Open → Closing → Closed.

use bytes::Bytes;
use farsock_wire::{CodecId, Content, FaultCode, Message, MessageType, NameRecord, Reference};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::rpc;
use crate::service::{Connection, MessageStream, Services};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Created,
    AwaitingBrokering,
    Open,
    Closing,
    Closed,
}

/// What a link does when the remote side closes or the receive path fails.
///
/// `Fail` propagates the fault to the owning socket (unicast); `Reconnect`
/// detaches quietly and lets the socket acquire a replacement (broadcast).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosePolicy {
    Fail,
    Reconnect,
}

/// Lifecycle events a link surfaces to its owning socket.
#[derive(Debug)]
pub enum LinkEvent {
    /// The remote side closed the link (Close message, `Closed` fault, or
    /// the transport dropping the stream).
    RemoteClosed { link_id: Reference },
    /// The receive path observed a non-success fault.
    ReceiveError {
        link_id: Reference,
        error: ProxyError,
    },
}

/// Split an outbound payload into maximal wire fragments.
///
/// An empty payload stays a single zero-length fragment — the logical
/// end-of-stream marker.
pub fn fragments(payload: Bytes, max_fragment: u32) -> Vec<Bytes> {
    let max = max_fragment.max(1) as usize;
    if payload.len() <= max {
        return vec![payload];
    }
    let mut rest = payload;
    let mut out = Vec::with_capacity(rest.len() / max + 1);
    while rest.len() > max {
        out.push(rest.split_to(max));
    }
    out.push(rest);
    out
}

/// One control+data session with one remote proxy.
pub struct ProxyLink {
    link_id: Reference,
    socket_id: Reference,
    proxy: NameRecord,
    remote_id: Reference,
    local_address: String,
    peer_address: String,
    stream_id: Reference,
    codec: CodecId,
    policy: ClosePolicy,
    state: LinkState,
    services: Services,
    config: ProxyConfig,
    /// Link-scoped token, child of the owning socket's. Cancelling it
    /// stops both pumps.
    cancel: CancellationToken,
    connection: Option<Box<dyn Connection>>,
    stream: Option<MessageStream>,
    stream_tx: Option<mpsc::Sender<Message>>,
    pumps: Vec<JoinHandle<()>>,
}

impl ProxyLink {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        socket_id: Reference,
        proxy: NameRecord,
        remote_id: Reference,
        local_address: String,
        peer_address: String,
        policy: ClosePolicy,
        codec: CodecId,
        services: Services,
        config: ProxyConfig,
        parent: &CancellationToken,
    ) -> Self {
        ProxyLink {
            link_id: Reference::generate(),
            socket_id,
            proxy,
            remote_id,
            local_address,
            peer_address,
            stream_id: Reference::generate(),
            codec,
            policy,
            state: LinkState::Created,
            services,
            config,
            cancel: parent.child_token(),
            connection: None,
            stream: None,
            stream_tx: None,
            pumps: Vec::new(),
        }
    }

    pub fn link_id(&self) -> Reference {
        self.link_id
    }

    pub fn remote_id(&self) -> Reference {
        self.remote_id
    }

    pub fn stream_id(&self) -> Reference {
        self.stream_id
    }

    pub fn proxy(&self) -> &NameRecord {
        &self.proxy
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    pub fn peer_address(&self) -> &str {
        &self.peer_address
    }

    pub fn policy(&self) -> ClosePolicy {
        self.policy
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Broker a fresh bulk-data connection and tell the remote how to
    /// attach to it.
    ///
    /// Returns without doing anything if cancelled before a connection
    /// could be created; the link then has nothing to release.
    pub async fn begin_open(&mut self, cancel: &CancellationToken) -> Result<(), ProxyError> {
        if cancel.is_cancelled() {
            return Ok(());
        }

        let connection = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            created = self.services.streams.create_connection(
                self.stream_id,
                self.remote_id,
                &self.proxy,
                self.codec,
            ) => created?,
        };

        let open = Content::OpenRequest {
            stream_id: self.stream_id,
            codec: self.codec,
            connection_string: connection.connection_string(),
            polled: connection.is_polled(),
            max_fragment: self.config.max_fragment,
        };
        self.connection = Some(connection);
        self.state = LinkState::AwaitingBrokering;

        let msg = Message::request(self.socket_id, self.remote_id, open);
        let response =
            rpc::call(&self.services, &self.proxy, msg, self.config.rpc_timeout, cancel).await?;
        rpc::check(response)?;
        Ok(())
    }

    /// Wait for the remote peer to attach its side of the bulk-data
    /// channel. On failure or cancellation the caller must treat the link
    /// as dead and [`close`](Self::close) it, releasing the half-open
    /// connection.
    pub async fn try_complete_open(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<(), ProxyError> {
        let Some(connection) = self.connection.as_mut() else {
            return Err(ProxyError::Fault("open before brokering".into()));
        };

        let stream = connection.open(cancel).await?;
        self.stream_tx = Some(stream.sender());
        self.stream = Some(stream);
        self.state = LinkState::Open;
        debug!(
            link = ?self.link_id,
            proxy = %self.proxy.name,
            stream = ?self.stream_id,
            "link: open handshake complete"
        );
        Ok(())
    }

    /// Wire the open stream into the owning socket's pipes and start the
    /// pump tasks. Returns the bounded outbound sender the socket writes
    /// `Data` messages into.
    pub fn wire(
        &mut self,
        data_tx: mpsc::Sender<Message>,
        event_tx: mpsc::Sender<LinkEvent>,
    ) -> mpsc::Sender<Message> {
        let depth = self.config.send_queue_depth.clamp(1, 3);
        let (pipe_tx, mut pipe_rx) = mpsc::channel::<Message>(depth);

        let Some(stream) = self.stream.take() else {
            warn!(link = ?self.link_id, "link: wire called before open");
            return pipe_tx;
        };
        let (stream_tx, mut stream_rx) = stream.into_split();
        let link_id = self.link_id;

        // Outbound pump: socket pipe → stream.
        let out_cancel = self.cancel.clone();
        self.pumps.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = out_cancel.cancelled() => break,
                    next = pipe_rx.recv() => {
                        let Some(msg) = next else { break };
                        if stream_tx.send(msg).await.is_err() {
                            trace!(link = ?link_id, "link: outbound stream gone");
                            break;
                        }
                    }
                }
            }
        }));

        // Inbound pump: stream → filter → socket.
        let in_cancel = self.cancel.clone();
        self.pumps.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = in_cancel.cancelled() => break,
                    next = stream_rx.recv() => {
                        let Some(msg) = next else {
                            let _ = event_tx
                                .send(LinkEvent::RemoteClosed { link_id })
                                .await;
                            break;
                        };
                        if msg.type_id == MessageType::Close
                            || (msg.is_response && msg.error == FaultCode::Closed)
                        {
                            trace!(link = ?link_id, "link: remote close");
                            let _ = event_tx
                                .send(LinkEvent::RemoteClosed { link_id })
                                .await;
                            break;
                        }
                        if !msg.error.is_success() {
                            let _ = event_tx
                                .send(LinkEvent::ReceiveError {
                                    link_id,
                                    error: ProxyError::Socket(msg.error),
                                })
                                .await;
                            break;
                        }
                        if msg.type_id == MessageType::Data && !msg.is_response {
                            if data_tx.send(msg).await.is_err() {
                                break;
                            }
                        } else {
                            trace!(
                                link = ?link_id,
                                type_id = ?msg.type_id,
                                "link: dropping stray message"
                            );
                        }
                    }
                }
            }
        }));

        pipe_tx
    }

    /// Push one option to the remote socket.
    pub async fn set_option(
        &self,
        option: u32,
        value: u64,
        cancel: &CancellationToken,
    ) -> Result<(), ProxyError> {
        let msg = Message::request(
            self.socket_id,
            self.remote_id,
            Content::SetOptionRequest { option, value },
        );
        let response =
            rpc::call(&self.services, &self.proxy, msg, self.config.rpc_timeout, cancel).await?;
        rpc::check(response).map(|_| ())
    }

    /// Read one option from the remote socket.
    pub async fn get_option(
        &self,
        option: u32,
        cancel: &CancellationToken,
    ) -> Result<u64, ProxyError> {
        let msg = Message::request(
            self.socket_id,
            self.remote_id,
            Content::GetOptionRequest { option },
        );
        let response =
            rpc::call(&self.services, &self.proxy, msg, self.config.rpc_timeout, cancel).await?;
        match rpc::check(response)?.content {
            Content::GetOptionResponse { value } => Ok(value),
            _ => Err(ProxyError::Fault("malformed get-option response".into())),
        }
    }

    /// Tear the link down from both ends.
    ///
    /// Concurrently (a) issues a Close RPC — `Closed` and `Timeout` mean
    /// the remote is already gone, not an error — and (b) sends a close
    /// marker down the data stream and closes the connection, each under
    /// the independent close timeout. Fails only if both halves fail.
    pub async fn close(&mut self, cancel: &CancellationToken) -> Result<(), ProxyError> {
        if self.state == LinkState::Closed {
            return Ok(());
        }
        self.state = LinkState::Closing;
        self.cancel.cancel();

        let close_timeout = self.config.close_timeout;
        let stream_tx = self.stream_tx.take();
        let connection = self.connection.take();
        let socket_id = self.socket_id;
        let remote_id = self.remote_id;

        let rpc_half = async {
            let msg = Message::request(socket_id, remote_id, Content::CloseRequest);
            match rpc::call(&self.services, &self.proxy, msg, Some(close_timeout), cancel).await
            {
                Ok(resp) if resp.is_success() => Ok(()),
                Ok(resp) if matches!(resp.error, FaultCode::Closed | FaultCode::Timeout) => {
                    Ok(())
                }
                Ok(resp) => Err(ProxyError::Socket(resp.error)),
                Err(err) if err.is_timeout() || err.is_closed() => Ok(()),
                Err(err) => Err(err),
            }
        };

        let stream_half = async move {
            let had_any = stream_tx.is_some() || connection.is_some();
            if let Some(tx) = stream_tx {
                let goodbye = Message::request(socket_id, remote_id, Content::CloseRequest);
                let _ = tokio::time::timeout(close_timeout, tx.send(goodbye)).await;
            }
            if let Some(mut conn) = connection {
                let _ = tokio::time::timeout(close_timeout, conn.close()).await;
            }
            if had_any {
                Ok(())
            } else {
                // Never brokered — nothing was torn down on this path.
                Err(ProxyError::Socket(FaultCode::Closed))
            }
        };

        let (rpc_result, stream_result) = tokio::join!(rpc_half, stream_half);

        self.state = LinkState::Closed;
        for pump in self.pumps.drain(..) {
            pump.abort();
        }

        match (rpc_result, stream_result) {
            (Err(err), Err(_)) => {
                warn!(link = ?self.link_id, error = %err, "link: close failed on both paths");
                Err(err)
            }
            _ => Ok(()),
        }
    }
}

/// Close a dead or unwanted link off the caller's path.
pub(crate) fn close_async(mut link: ProxyLink) {
    tokio::spawn(async move {
        let token = CancellationToken::new();
        if let Err(err) = link.close(&token).await {
            debug!(link = ?link.link_id(), error = %err, "link: async close failed");
        }
    });
}

impl std::fmt::Debug for ProxyLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyLink")
            .field("link_id", &self.link_id)
            .field("proxy", &self.proxy.name)
            .field("remote_id", &self.remote_id)
            .field("state", &self.state)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
