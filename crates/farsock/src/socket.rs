//! Socket orchestration over 0..N links.
//!
//! A [`ProxySocket`] turns the links the acquisition pipeline produces
//! into one logical socket. The link set and the option cache are the
//! only state touched from multiple tasks; each sits behind its own lock.
//!
//! Unicast sockets hold exactly 0 or 1 link and die with it. Broadcast
//! sockets hold 0..N links with `Reconnect` policy: a lost link is
//! replaced, not fatal.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Buf, Bytes};
use farsock_wire::{
    CodecId, Content, FaultCode, Message, NameRecord, RecordKind, Reference, SocketInfo,
};
use futures::future::join_all;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::link::{close_async, fragments, ClosePolicy, LinkEvent, ProxyLink};
use crate::pipeline::{self, PipelineParams};
use crate::retry::{self, RetryPredicate};
use crate::service::{NameQuery, QueryTarget, Services};

/// Socket flavor — replaces a class hierarchy with a tagged variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketMode {
    /// TCP-client style: exactly one link, failure is fatal.
    Unicast,
    /// UDP / listening-TCP / discovery style: N persistent links,
    /// failures absorbed by relinking.
    Broadcast,
}

/// One attached link as the socket tracks it.
struct LinkHandle {
    link: Arc<AsyncMutex<ProxyLink>>,
    outbound: mpsc::Sender<Message>,
    policy: ClosePolicy,
    proxy: NameRecord,
    remote_id: Reference,
}

/// Leftover bytes of a partially consumed `Data` payload.
#[derive(Default)]
struct ReadCursor {
    pending: Bytes,
}

/// A virtual socket whose descriptor lives on remote proxies.
pub struct ProxySocket {
    id: Reference,
    mode: SocketMode,
    codec: CodecId,
    info: Mutex<SocketInfo>,
    links: Mutex<HashMap<Reference, LinkHandle>>,
    option_cache: Mutex<HashMap<u32, u64>>,
    services: Services,
    config: ProxyConfig,
    cancel: CancellationToken,
    closed: AtomicBool,
    data_tx: mpsc::Sender<Message>,
    data_rx: AsyncMutex<mpsc::Receiver<Message>>,
    event_tx: mpsc::Sender<LinkEvent>,
    read_cursor: AsyncMutex<ReadCursor>,
    /// The query bind ran with — reused when acquiring replacement links.
    bound_query: Mutex<Option<NameQuery>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProxySocket {
    pub fn new(
        mode: SocketMode,
        info: SocketInfo,
        codec: CodecId,
        services: Services,
        config: ProxyConfig,
    ) -> Arc<Self> {
        let (data_tx, data_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(16);

        let socket = Arc::new(ProxySocket {
            id: Reference::generate(),
            mode,
            codec,
            info: Mutex::new(info),
            links: Mutex::new(HashMap::new()),
            option_cache: Mutex::new(HashMap::new()),
            services,
            config,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            data_tx,
            data_rx: AsyncMutex::new(data_rx),
            event_tx,
            read_cursor: AsyncMutex::new(ReadCursor::default()),
            bound_query: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        });

        socket.spawn_event_loop(event_rx);
        socket
    }

    pub fn id(&self) -> Reference {
        self.id
    }

    pub fn mode(&self) -> SocketMode {
        self.mode
    }

    pub fn link_count(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    /// Names of the proxies currently linked.
    pub fn linked_proxies(&self) -> Vec<String> {
        self.links
            .lock()
            .unwrap()
            .values()
            .map(|h| h.proxy.name.clone())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Connect this unicast socket to `address`.
    ///
    /// Runs the discovery → ping → link pipeline and keeps exactly the
    /// first successful link. The working proxy is recorded as a reference
    /// on the host's directory record; candidates that failed terminally
    /// have their references removed.
    pub async fn connect(
        self: &Arc<Self>,
        address: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ProxyError> {
        if self.mode != SocketMode::Unicast {
            return Err(ProxyError::Fault("connect on a broadcast socket".into()));
        }
        if self.is_closed() {
            return Err(ProxyError::Socket(FaultCode::Closed));
        }
        if self.link_count() > 0 {
            return Err(ProxyError::Fault("socket already connected".into()));
        }

        self.info.lock().unwrap().address = address.to_string();

        let acq_cancel = linked_token(&self.cancel, cancel);
        let (drops_tx, mut drops_rx) = mpsc::channel::<NameRecord>(8);
        let params = self.pipeline_params(
            NameQuery::proxies_for_host(address),
            Some(address.to_string()),
            HashSet::new(),
            Some(drops_tx),
        );
        let (links_tx, mut links_rx) = mpsc::channel(2);
        let run = tokio::spawn(pipeline::run(params, links_tx, acq_cancel.clone()));

        // Prune references to proxies that could not reach the host.
        let bookkeeping = {
            let socket = self.clone();
            let host = address.to_string();
            tokio::spawn(async move {
                while let Some(record) = drops_rx.recv().await {
                    socket.update_host_reference(&host, &record, false).await;
                }
            })
        };

        match links_rx.recv().await {
            Some(link) => {
                let proxy = link.proxy().clone();
                // First link wins; stop acquiring and let the pipeline
                // close any straggler handshakes.
                acq_cancel.cancel();
                drop(links_rx);
                self.attach_link(link);
                self.update_host_reference(address, &proxy, true).await;
                let _ = run.await;
                let _ = bookkeeping.await;
                info!(socket = ?self.id, host = address, proxy = %proxy.name, "socket: connected");
                Ok(())
            }
            None => {
                let result = run.await;
                let _ = bookkeeping.await;
                match result {
                    Ok(Err(err)) => Err(err),
                    Ok(Ok(())) => Err(ProxyError::NotFound),
                    Err(_) => Err(ProxyError::Fault("acquisition task failed".into())),
                }
            }
        }
    }

    /// Bind this broadcast socket, linking every proxy that matches.
    ///
    /// An empty address list is the wildcard "any proxy". The call
    /// completes on the first successful link; the remaining candidates
    /// keep attaching in the background.
    pub async fn bind(
        self: &Arc<Self>,
        addresses: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), ProxyError> {
        if self.mode != SocketMode::Broadcast {
            return Err(ProxyError::Fault("bind on a unicast socket".into()));
        }
        if self.is_closed() {
            return Err(ProxyError::Socket(FaultCode::Closed));
        }

        let query = if addresses.is_empty() {
            NameQuery::any_proxies()
        } else {
            NameQuery::new(QueryTarget::Bound(addresses.to_vec()), RecordKind::PROXY)
        };
        *self.bound_query.lock().unwrap() = Some(query.clone());
        self.info.lock().unwrap().address = addresses.join(",");

        let acq_cancel = linked_token(&self.cancel, cancel);
        let params = self.pipeline_params(query, None, HashSet::new(), None);
        let (links_tx, mut links_rx) = mpsc::channel(8);
        let run = tokio::spawn(pipeline::run(params, links_tx, acq_cancel.clone()));

        let Some(first) = links_rx.recv().await else {
            return match run.await {
                Ok(Err(err)) => Err(err),
                Ok(Ok(())) => Err(ProxyError::NotFound),
                Err(_) => Err(ProxyError::Fault("acquisition task failed".into())),
            };
        };
        self.attach_link(first);
        info!(socket = ?self.id, "socket: bound");

        // Later candidates attach as their handshakes complete.
        let socket = self.clone();
        let drain = tokio::spawn(async move {
            while let Some(link) = links_rx.recv().await {
                socket.attach_link(link);
            }
            match run.await {
                Ok(Err(err)) if !err.is_cancelled() => {
                    debug!(error = %err, "socket: background acquisition ended");
                }
                _ => {}
            }
        });
        self.tasks.lock().unwrap().push(drain);
        Ok(())
    }

    /// Send a payload.
    ///
    /// Unicast: fragments the buffer per the negotiated maximum and queues
    /// it on the single link's bounded pipe (backpressure against a slow
    /// proxy). An empty buffer sends the zero-length end-of-stream marker.
    ///
    /// Broadcast: fans the datagram out to every current link, best
    /// effort, with no delivery guarantee to any particular one.
    pub async fn send(&self, payload: &[u8], cancel: &CancellationToken) -> Result<(), ProxyError> {
        if self.is_closed() {
            return Err(ProxyError::Socket(FaultCode::Closed));
        }
        let payload = Bytes::copy_from_slice(payload);

        match self.mode {
            SocketMode::Unicast => {
                let (remote_id, outbound) = {
                    let links = self.links.lock().unwrap();
                    let Some(handle) = links.values().next() else {
                        return Err(ProxyError::Socket(FaultCode::Closed));
                    };
                    (handle.remote_id, handle.outbound.clone())
                };
                for fragment in fragments(payload, self.config.max_fragment) {
                    let msg = Message::data(self.id, remote_id, fragment);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
                        sent = outbound.send(msg) => {
                            if sent.is_err() {
                                return Err(ProxyError::Socket(FaultCode::Closed));
                            }
                        }
                    }
                }
                Ok(())
            }
            SocketMode::Broadcast => {
                let targets: Vec<(Reference, mpsc::Sender<Message>)> = self
                    .links
                    .lock()
                    .unwrap()
                    .values()
                    .map(|h| (h.remote_id, h.outbound.clone()))
                    .collect();
                for (remote_id, outbound) in targets {
                    let msg = Message::data(self.id, remote_id, payload.clone());
                    if let Err(err) = outbound.try_send(msg) {
                        debug!(socket = ?self.id, error = %err, "socket: broadcast send dropped");
                    }
                }
                Ok(())
            }
        }
    }

    /// Receive into `buf`, returning the number of bytes written.
    ///
    /// Unicast reads are stream-oriented: leftover bytes from the previous
    /// message are drained first, then messages are pulled until the buffer
    /// fills or a zero-length payload — the end-of-stream marker — ends the
    /// read pass. Broadcast reads return the first datagram available from
    /// any link.
    pub async fn recv(&self, buf: &mut [u8], cancel: &CancellationToken) -> Result<usize, ProxyError> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.mode {
            SocketMode::Broadcast => {
                let mut rx = self.data_rx.lock().await;
                loop {
                    let msg = tokio::select! {
                        _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
                        msg = rx.recv() => {
                            msg.ok_or(ProxyError::Socket(FaultCode::Closed))?
                        }
                    };
                    if let Content::Data { payload } = msg.content {
                        let n = payload.len().min(buf.len());
                        buf[..n].copy_from_slice(&payload[..n]);
                        return Ok(n);
                    }
                }
            }
            SocketMode::Unicast => {
                let mut cursor = self.read_cursor.lock().await;
                let mut filled = 0;

                if !cursor.pending.is_empty() {
                    let n = cursor.pending.len().min(buf.len());
                    buf[..n].copy_from_slice(&cursor.pending[..n]);
                    cursor.pending.advance(n);
                    filled = n;
                    if filled == buf.len() {
                        return Ok(filled);
                    }
                }

                let mut rx = self.data_rx.lock().await;
                loop {
                    let msg = tokio::select! {
                        _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
                        msg = rx.recv() => match msg {
                            Some(msg) => msg,
                            None if filled > 0 => return Ok(filled),
                            None => return Err(ProxyError::Socket(FaultCode::Closed)),
                        }
                    };
                    let Content::Data { payload } = msg.content else {
                        continue;
                    };
                    if payload.is_empty() {
                        // End of stream for this read pass.
                        return Ok(filled);
                    }
                    let n = payload.len().min(buf.len() - filled);
                    buf[filled..filled + n].copy_from_slice(&payload[..n]);
                    filled += n;
                    if n < payload.len() {
                        cursor.pending = payload.slice(n..);
                    }
                    if filled == buf.len() {
                        return Ok(filled);
                    }
                }
            }
        }
    }

    /// Set a socket option.
    ///
    /// With no links yet, the value is cached and merged into the
    /// `SocketInfo` of every future link. With links, it is pushed to all
    /// of them concurrently.
    pub async fn set_option(
        &self,
        option: u32,
        value: u64,
        cancel: &CancellationToken,
    ) -> Result<(), ProxyError> {
        if self.is_closed() {
            return Err(ProxyError::Socket(FaultCode::Closed));
        }
        self.option_cache.lock().unwrap().insert(option, value);

        let links: Vec<Arc<AsyncMutex<ProxyLink>>> = self
            .links
            .lock()
            .unwrap()
            .values()
            .map(|h| h.link.clone())
            .collect();
        if links.is_empty() {
            return Ok(());
        }

        let results = join_all(links.iter().map(|link| async {
            link.lock().await.set_option(option, value, cancel).await
        }))
        .await;
        results.into_iter().find(|r| r.is_err()).unwrap_or(Ok(()))
    }

    /// Get a socket option: from the first link when one exists, otherwise
    /// the cached value or zero.
    pub async fn get_option(
        &self,
        option: u32,
        cancel: &CancellationToken,
    ) -> Result<u64, ProxyError> {
        let link = self
            .links
            .lock()
            .unwrap()
            .values()
            .next()
            .map(|h| h.link.clone());
        match link {
            Some(link) => {
                let guard = link.lock().await;
                guard.get_option(option, cancel).await
            }
            None => Ok(self
                .option_cache
                .lock()
                .unwrap()
                .get(&option)
                .copied()
                .unwrap_or(0)),
        }
    }

    /// Close every member link concurrently.
    ///
    /// Individual close failures are logged and absorbed; the call fails
    /// only if every link's close failed.
    pub async fn close(&self, cancel: &CancellationToken) -> Result<(), ProxyError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.cancel.cancel();

        let handles: Vec<LinkHandle> = self
            .links
            .lock()
            .unwrap()
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        if handles.is_empty() {
            return Ok(());
        }

        let results = join_all(handles.iter().map(|handle| {
            let link = handle.link.clone();
            async move { link.lock().await.close(cancel).await }
        }))
        .await;

        let total = results.len();
        let mut failures = 0;
        let mut last_failure = None;
        for result in results {
            if let Err(err) = result {
                debug!(socket = ?self.id, error = %err, "socket: link close failed");
                failures += 1;
                last_failure = Some(err);
            }
        }
        match last_failure {
            Some(err) if failures == total => Err(err),
            _ => Ok(()),
        }
    }

    // ── internals ───────────────────────────────────────────────────

    fn spawn_event_loop(self: &Arc<Self>, mut event_rx: mpsc::Receiver<LinkEvent>) {
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = event_rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let Some(socket) = weak.upgrade() else { break };
                socket.handle_link_event(event);
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }

    /// React to a link lifecycle event per the link's close policy.
    fn handle_link_event(self: &Arc<Self>, event: LinkEvent) {
        let (link_id, reason) = match event {
            LinkEvent::RemoteClosed { link_id } => (link_id, None),
            LinkEvent::ReceiveError { link_id, error } => (link_id, Some(error)),
        };
        let Some(handle) = self.links.lock().unwrap().remove(&link_id) else {
            return; // already torn down
        };

        match handle.policy {
            ClosePolicy::Reconnect => {
                info!(
                    socket = ?self.id,
                    link = ?link_id,
                    proxy = %handle.proxy.name,
                    error = reason.as_ref().map(tracing::field::display),
                    "socket: link detached, acquiring replacement"
                );
                let link = handle.link.clone();
                tokio::spawn(async move {
                    let _ = link.lock().await.close(&CancellationToken::new()).await;
                });
                self.spawn_relink();
            }
            ClosePolicy::Fail => {
                warn!(
                    socket = ?self.id,
                    link = ?link_id,
                    error = reason.as_ref().map(tracing::field::display),
                    "socket: link failed, closing socket"
                );
                let link = handle.link.clone();
                let socket = self.clone();
                tokio::spawn(async move {
                    let token = CancellationToken::new();
                    let _ = link.lock().await.close(&token).await;
                    let _ = socket.close(&token).await;
                });
            }
        }
    }

    /// Acquire a replacement link for the socket's standing binding.
    fn spawn_relink(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        let socket = self.clone();
        let handle = tokio::spawn(async move {
            let Some(query) = socket.bound_query.lock().unwrap().clone() else {
                return;
            };
            let exclude: HashSet<String> = socket
                .links
                .lock()
                .unwrap()
                .values()
                .map(|h| h.proxy.id.clone())
                .collect();
            let params = socket.pipeline_params(query, None, exclude, None);
            let (links_tx, mut links_rx) = mpsc::channel(4);
            let cancel = socket.cancel.child_token();
            let run = tokio::spawn(pipeline::run(params, links_tx, cancel));
            while let Some(link) = links_rx.recv().await {
                socket.attach_link(link);
            }
            match run.await {
                Ok(Err(err)) if !err.is_cancelled() => {
                    warn!(socket = ?socket.id, error = %err, "socket: relink failed");
                }
                _ => {}
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }

    /// Attach a live link: take the socket lock, wire the link's pipes
    /// into the socket's, and track it.
    fn attach_link(&self, mut link: ProxyLink) {
        if self.is_closed() {
            close_async(link);
            return;
        }
        let mut links = self.links.lock().unwrap();
        if links.values().any(|h| h.proxy.id == link.proxy().id) {
            drop(links);
            debug!(socket = ?self.id, proxy = %link.proxy().name, "socket: duplicate link, closing");
            close_async(link);
            return;
        }
        let link_id = link.link_id();
        let outbound = link.wire(self.data_tx.clone(), self.event_tx.clone());
        let handle = LinkHandle {
            policy: link.policy(),
            proxy: link.proxy().clone(),
            remote_id: link.remote_id(),
            outbound,
            link: Arc::new(AsyncMutex::new(link)),
        };
        info!(
            socket = ?self.id,
            link = ?link_id,
            proxy = %handle.proxy.name,
            "socket: link attached"
        );
        links.insert(link_id, handle);
    }

    fn pipeline_params(
        &self,
        query: NameQuery,
        ping_address: Option<String>,
        exclude: HashSet<String>,
        drops: Option<mpsc::Sender<NameRecord>>,
    ) -> PipelineParams {
        let info = merged_info(
            &self.info.lock().unwrap(),
            &self.option_cache.lock().unwrap(),
        );
        PipelineParams {
            services: self.services.clone(),
            config: self.config.clone(),
            socket_id: self.id,
            info,
            query,
            ping_address,
            policy: match self.mode {
                SocketMode::Unicast => ClosePolicy::Fail,
                SocketMode::Broadcast => ClosePolicy::Reconnect,
            },
            link_concurrency: match self.mode {
                SocketMode::Unicast => Some(1),
                SocketMode::Broadcast => None,
            },
            codec: self.codec,
            exclude,
            socket_cancel: self.cancel.clone(),
            drops,
        }
    }

    /// Add or remove one proxy reference on a host's directory record,
    /// retrying transient directory faults with linear backoff.
    async fn update_host_reference(&self, host: &str, proxy: &NameRecord, add: bool) {
        let mut record = NameRecord::new(host, RecordKind::HOST);
        record.references.insert(proxy.address);
        let directory = self.services.directory.clone();
        let result = retry::retry(
            self.config.directory_retry,
            RetryPredicate::Directory,
            &CancellationToken::new(),
            |_, _| {
                let directory = directory.clone();
                let record = record.clone();
                async move { directory.update(&record, add).await }
            },
        )
        .await;
        if let Err(err) = result {
            debug!(host, proxy = %proxy.name, error = %err, "socket: host record update failed");
        }
    }
}

impl Drop for ProxySocket {
    fn drop(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

/// Base socket description with the cached options merged in; a cached
/// value wins over one already present in the base set.
fn merged_info(base: &SocketInfo, cache: &HashMap<u32, u64>) -> SocketInfo {
    let mut info = base.clone();
    info.options.retain(|p| !cache.contains_key(&p.option));
    for (&option, &value) in cache {
        info.options.push(farsock_wire::Property { option, value });
    }
    info
}

/// A token cancelled when either parent fires.
fn linked_token(a: &CancellationToken, b: &CancellationToken) -> CancellationToken {
    let token = a.child_token();
    let watched = token.clone();
    let b = b.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = b.cancelled() => watched.cancel(),
            _ = watched.cancelled() => {}
        }
    });
    token
}
