//! In-process mock services: a directory, a control channel answering for
//! any number of fake proxies, and a stream broker wired over channels.
//! Tests drive the proxy side of each link through the broker's retained
//! stream halves.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use farsock::{
    MessageStream, NameQuery, NameService, ProxyError, Services, StreamService,
};
use farsock_wire::{
    CodecId, Content, FaultCode, Message, MessageType, NameRecord, RecordKind, Reference,
    SocketInfo,
};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

// ── Directory ────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockDirectory {
    records: Mutex<Vec<NameRecord>>,
}

impl MockDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(MockDirectory::default())
    }

    /// Register a proxy record and return it.
    pub fn add_proxy(&self, name: &str) -> NameRecord {
        let record = NameRecord {
            id: name.to_string(),
            address: Reference::generate(),
            name: name.to_string(),
            kind: RecordKind::PROXY,
            references: BTreeSet::new(),
        };
        self.records.lock().unwrap().push(record.clone());
        record
    }

    /// Reference set of the named host record, empty if absent.
    pub fn host_references(&self, host: &str) -> BTreeSet<Reference> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.name == host && r.kind.contains(RecordKind::HOST))
            .map(|r| r.references.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl NameService for MockDirectory {
    async fn lookup(
        &self,
        query: NameQuery,
    ) -> Result<mpsc::Receiver<NameRecord>, ProxyError> {
        let matching: Vec<NameRecord> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.kind.contains(query.kind))
            .cloned()
            .collect();
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            for record in matching {
                if tx.send(record).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn update(
        &self,
        record: &NameRecord,
        add_reference: bool,
    ) -> Result<(), ProxyError> {
        let mut records = self.records.lock().unwrap();
        match records
            .iter_mut()
            .find(|r| r.name == record.name && r.kind == record.kind)
        {
            Some(existing) => {
                if add_reference {
                    existing.references.extend(record.references.iter().copied());
                } else {
                    for reference in &record.references {
                        existing.references.remove(reference);
                    }
                }
            }
            None if add_reference => {
                let mut created = record.clone();
                created.id = record.name.clone();
                records.push(created);
            }
            None => {}
        }
        Ok(())
    }
}

// ── Stream broker ────────────────────────────────────────────────────

struct StreamEntry {
    proxy_side: Option<MessageStream>,
    attach_tx: watch::Sender<bool>,
}

#[derive(Default)]
pub struct MockStreams {
    entries: Mutex<HashMap<Reference, StreamEntry>>,
    order: Mutex<Vec<Reference>>,
    created: AtomicUsize,
    closed: Arc<AtomicUsize>,
}

impl MockStreams {
    pub fn new() -> Arc<Self> {
        Arc::new(MockStreams::default())
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Remote side attached (driven by the control channel's OpenRequest).
    pub fn mark_attached(&self, stream_id: Reference) {
        if let Some(entry) = self.entries.lock().unwrap().get(&stream_id) {
            let _ = entry.attach_tx.send(true);
        }
    }

    /// Take the proxy-side half of the nth created stream (creation order)
    /// to drive it from a test.
    pub fn take_proxy_side(&self, index: usize) -> Option<MessageStream> {
        let stream_id = *self.order.lock().unwrap().get(index)?;
        self.entries
            .lock()
            .unwrap()
            .get_mut(&stream_id)?
            .proxy_side
            .take()
    }
}

pub struct MockConnection {
    stream_id: Reference,
    link_half: Option<MessageStream>,
    attached: watch::Receiver<bool>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl farsock::Connection for MockConnection {
    fn connection_string(&self) -> String {
        format!("mock://{}", self.stream_id)
    }

    fn is_polled(&self) -> bool {
        false
    }

    async fn open(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<MessageStream, ProxyError> {
        let mut attached = self.attached.clone();
        tokio::select! {
            _ = cancel.cancelled() => Err(ProxyError::Cancelled),
            changed = attached.wait_for(|v| *v) => match changed {
                Ok(_) => self
                    .link_half
                    .take()
                    .ok_or_else(|| ProxyError::Fault("stream already opened".into())),
                Err(_) => Err(ProxyError::Socket(FaultCode::Closed)),
            }
        }
    }

    async fn close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StreamService for MockStreams {
    async fn create_connection(
        &self,
        stream_id: Reference,
        _remote_id: Reference,
        _proxy: &NameRecord,
        _codec: CodecId,
    ) -> Result<Box<dyn farsock::Connection>, ProxyError> {
        let (link_half, proxy_half) = MessageStream::pair(8);
        let (attach_tx, attach_rx) = watch::channel(false);
        self.entries.lock().unwrap().insert(
            stream_id,
            StreamEntry {
                proxy_side: Some(proxy_half),
                attach_tx,
            },
        );
        self.order.lock().unwrap().push(stream_id);
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            stream_id,
            link_half: Some(link_half),
            attached: attach_rx,
            closed: self.closed.clone(),
        }))
    }
}

// ── Control channel ──────────────────────────────────────────────────

#[derive(Clone)]
pub struct ProxyBehavior {
    /// Ping succeeds.
    pub reachable: bool,
    /// Link RPC answers with this fault instead of a LinkResponse.
    pub link_fault: Option<FaultCode>,
    /// Open RPC answers with this fault instead of attaching the stream.
    pub open_fault: Option<FaultCode>,
    /// Artificial latency before answering anything.
    pub delay: Option<Duration>,
}

impl Default for ProxyBehavior {
    fn default() -> Self {
        ProxyBehavior {
            reachable: true,
            link_fault: None,
            open_fault: None,
            delay: None,
        }
    }
}

pub struct MockControl {
    streams: Arc<MockStreams>,
    behaviors: Mutex<HashMap<Reference, ProxyBehavior>>,
    link_infos: Mutex<HashMap<Reference, SocketInfo>>,
    options: Mutex<HashMap<(Reference, u32), u64>>,
    calls: Mutex<Vec<(String, MessageType)>>,
    pending: Arc<AtomicUsize>,
}

struct PendingGuard(Arc<AtomicUsize>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockControl {
    pub fn new(streams: Arc<MockStreams>) -> Arc<Self> {
        Arc::new(MockControl {
            streams,
            behaviors: Mutex::new(HashMap::new()),
            link_infos: Mutex::new(HashMap::new()),
            options: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            pending: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn set_behavior(&self, proxy: &NameRecord, behavior: ProxyBehavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(proxy.address, behavior);
    }

    /// The SocketInfo carried by the last LinkRequest this proxy answered.
    pub fn link_info(&self, proxy: &NameRecord) -> Option<SocketInfo> {
        self.link_infos.lock().unwrap().get(&proxy.address).cloned()
    }

    pub fn option_value(&self, remote_id: Reference, option: u32) -> Option<u64> {
        self.options.lock().unwrap().get(&(remote_id, option)).copied()
    }

    pub fn calls_of(&self, type_id: MessageType) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, t)| *t == type_id)
            .count()
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl farsock::ControlChannel for MockControl {
    async fn call(
        &self,
        proxy: &NameRecord,
        msg: Message,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Message, ProxyError> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let _guard = PendingGuard(self.pending.clone());
        self.calls
            .lock()
            .unwrap()
            .push((proxy.name.clone(), msg.type_id));

        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&proxy.address)
            .cloned()
            .unwrap_or_default();

        if let Some(delay) = behavior.delay {
            // Honor the caller's timeout like a real transport would.
            if let Some(budget) = timeout.filter(|t| *t < delay) {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
                    _ = tokio::time::sleep(budget) => return Err(ProxyError::Timeout),
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        match &msg.content {
            Content::PingRequest { .. } => {
                if behavior.reachable {
                    Ok(Message::response_to(&msg, Content::PingResponse))
                } else {
                    Err(ProxyError::Timeout)
                }
            }
            Content::LinkRequest { info } => {
                if let Some(code) = behavior.link_fault {
                    return Ok(Message::error_response_to(&msg, code));
                }
                self.link_infos
                    .lock()
                    .unwrap()
                    .insert(proxy.address, info.clone());
                Ok(Message::response_to(
                    &msg,
                    Content::LinkResponse {
                        remote_id: Reference::generate(),
                        local_address: "10.0.0.2:50000".into(),
                        peer_address: format!("{}:4840", proxy.name),
                    },
                ))
            }
            Content::OpenRequest { stream_id, .. } => {
                if let Some(code) = behavior.open_fault {
                    return Ok(Message::error_response_to(&msg, code));
                }
                self.streams.mark_attached(*stream_id);
                Ok(Message::response_to(&msg, Content::OpenResponse))
            }
            Content::SetOptionRequest { option, value } => {
                self.options
                    .lock()
                    .unwrap()
                    .insert((msg.target, *option), *value);
                Ok(Message::response_to(&msg, Content::SetOptionResponse))
            }
            Content::GetOptionRequest { option } => {
                let value = self
                    .options
                    .lock()
                    .unwrap()
                    .get(&(msg.target, *option))
                    .copied()
                    .unwrap_or(0);
                Ok(Message::response_to(&msg, Content::GetOptionResponse { value }))
            }
            Content::CloseRequest => {
                Ok(Message::response_to(&msg, Content::CloseResponse))
            }
            _ => Ok(Message::error_response_to(&msg, FaultCode::Fatal)),
        }
    }
}

// ── Harness ──────────────────────────────────────────────────────────

pub struct Harness {
    pub services: Services,
    pub directory: Arc<MockDirectory>,
    pub control: Arc<MockControl>,
    pub streams: Arc<MockStreams>,
}

pub fn harness() -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let directory = MockDirectory::new();
    let streams = MockStreams::new();
    let control = MockControl::new(streams.clone());
    let services = Services {
        directory: directory.clone(),
        control: control.clone(),
        streams: streams.clone(),
    };
    Harness {
        services,
        directory,
        control,
        streams,
    }
}

/// Poll until `predicate` holds, panicking after two seconds.
pub async fn wait_until(what: &str, predicate: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
