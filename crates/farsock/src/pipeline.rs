//! Link acquisition: discovery → ping → link → attach.
//!
//! One bounded channel per stage hand-off, one error side-channel with
//! bounded retry re-injection, explicit in-flight accounting for the
//! completion signal. The attach step itself lives in the socket layer —
//! this module emits live links on a channel and reports terminally
//! dropped candidates so the socket can do its directory bookkeeping.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use farsock_wire::{CodecId, Content, Message, NameRecord, RecordKind, Reference, SocketInfo};
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::link::{close_async, ClosePolicy, LinkState, ProxyLink};
use crate::retry::{self, RetryPredicate};
use crate::rpc;
use crate::service::{NameQuery, Services};
use crate::stage;

/// One discovered proxy flowing through the pipeline.
#[derive(Debug, Clone)]
struct Candidate {
    record: NameRecord,
    attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailedAt {
    Ping,
    Link,
}

struct StageFailure {
    candidate: Candidate,
    at: FailedAt,
    error: ProxyError,
}

/// Everything one acquisition run needs.
pub struct PipelineParams {
    pub services: Services,
    pub config: ProxyConfig,
    pub socket_id: Reference,
    /// Socket description sent in the Link request, options already merged.
    pub info: SocketInfo,
    pub query: NameQuery,
    /// Target address to ping before committing — connect path only.
    pub ping_address: Option<String>,
    pub policy: ClosePolicy,
    /// `Some(1)` for unicast (no racing duplicate connects), `None` for
    /// unbounded broadcast linking.
    pub link_concurrency: Option<usize>,
    pub codec: CodecId,
    /// Record ids to skip — proxies the socket is already linked to.
    pub exclude: HashSet<String>,
    /// Parent token for the links themselves; links outlive the pipeline.
    pub socket_cancel: CancellationToken,
    /// Terminally dropped candidates, for directory reference pruning.
    pub drops: Option<mpsc::Sender<NameRecord>>,
}

/// In-flight candidate accounting: the explicit completion signal.
struct Tracker {
    inflight: AtomicUsize,
    discovery_done: AtomicBool,
    idle: Notify,
}

impl Tracker {
    fn new() -> Arc<Self> {
        Arc::new(Tracker {
            inflight: AtomicUsize::new(0),
            discovery_done: AtomicBool::new(false),
            idle: Notify::new(),
        })
    }

    fn add(&self) {
        self.inflight.fetch_add(1, Ordering::AcqRel);
    }

    /// A candidate reached a terminal state (link produced or dropped).
    fn settle(&self) {
        if self.inflight.fetch_sub(1, Ordering::AcqRel) == 1
            && self.discovery_done.load(Ordering::Acquire)
        {
            self.idle.notify_waiters();
        }
    }

    fn finish_discovery(&self) {
        self.discovery_done.store(true, Ordering::Release);
        if self.inflight.load(Ordering::Acquire) == 0 {
            self.idle.notify_waiters();
        }
    }

    async fn wait_idle(&self, cancel: &CancellationToken) {
        loop {
            let notified = self.idle.notified();
            if cancel.is_cancelled()
                || (self.discovery_done.load(Ordering::Acquire)
                    && self.inflight.load(Ordering::Acquire) == 0)
            {
                return;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = notified => {}
            }
        }
    }
}

/// Shared worker context.
struct StageCtx {
    services: Services,
    config: ProxyConfig,
    socket_id: Reference,
    info: SocketInfo,
    ping_address: Option<String>,
    policy: ClosePolicy,
    codec: CodecId,
    internal: CancellationToken,
    socket_cancel: CancellationToken,
}

/// Run one acquisition pass over every candidate the directory yields.
///
/// Live links are emitted on `links_tx` as their handshakes complete.
/// Returns `Ok(())` once at least one link was produced and the candidate
/// set drained, `Err` with the last relevant fault (or `NotFound`) when
/// every candidate was exhausted without a link.
pub async fn run(
    params: PipelineParams,
    links_tx: mpsc::Sender<ProxyLink>,
    cancel: CancellationToken,
) -> Result<(), ProxyError> {
    let internal = cancel.child_token();
    let tracker = Tracker::new();
    let last_error: Arc<Mutex<Option<ProxyError>>> = Arc::new(Mutex::new(None));
    let produced = Arc::new(AtomicUsize::new(0));

    let ctx = Arc::new(StageCtx {
        services: params.services,
        config: params.config,
        socket_id: params.socket_id,
        info: params.info,
        ping_address: params.ping_address,
        policy: params.policy,
        codec: params.codec,
        internal: internal.clone(),
        socket_cancel: params.socket_cancel,
    });

    let (ping_tx, ping_rx) = mpsc::channel::<Candidate>(16);
    let (link_tx, link_rx) = mpsc::channel::<Candidate>(16);
    let (live_tx, mut live_rx) = mpsc::channel::<ProxyLink>(8);
    let (err_tx, mut err_rx) = mpsc::channel::<StageFailure>(16);

    let with_ping = ctx.ping_address.is_some();
    let entry_tx = if with_ping {
        ping_tx.clone()
    } else {
        link_tx.clone()
    };

    // Discovery: bounded concurrent lookups, one candidate per record.
    let discovery = {
        let ctx = ctx.clone();
        let tracker = tracker.clone();
        let last_error = last_error.clone();
        let exclude = params.exclude;
        let query = params.query;
        tokio::spawn(async move {
            let semaphore =
                Arc::new(Semaphore::new(ctx.config.discovery_concurrency.max(1)));
            let seen: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
            let mut lookups = JoinSet::new();

            for sub in query.expand() {
                let ctx = ctx.clone();
                let tracker = tracker.clone();
                let last_error = last_error.clone();
                let semaphore = semaphore.clone();
                let seen = seen.clone();
                let exclude = exclude.clone();
                let entry_tx = entry_tx.clone();
                lookups.spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return;
                    };
                    let directory = ctx.services.directory.clone();
                    let lookup = retry::retry(
                        ctx.config.directory_retry,
                        RetryPredicate::Directory,
                        &ctx.internal,
                        |_, _| {
                            let directory = directory.clone();
                            let sub = sub.clone();
                            async move { directory.lookup(sub).await }
                        },
                    )
                    .await;
                    let mut records = match lookup {
                        Ok(records) => records,
                        Err(err) => {
                            warn!(error = %err, "pipeline: directory lookup failed");
                            *last_error.lock().unwrap() = Some(err);
                            return;
                        }
                    };
                    loop {
                        let record = tokio::select! {
                            _ = ctx.internal.cancelled() => break,
                            record = records.recv() => match record {
                                Some(record) => record,
                                None => break,
                            },
                        };
                        if !record.kind.contains(RecordKind::PROXY) {
                            continue;
                        }
                        if !seen.lock().unwrap().insert(record.id.clone())
                            || exclude.contains(&record.id)
                        {
                            continue;
                        }
                        trace!(proxy = %record.name, "pipeline: candidate discovered");
                        tracker.add();
                        if entry_tx
                            .send(Candidate { record, attempt: 0 })
                            .await
                            .is_err()
                        {
                            tracker.settle();
                            break;
                        }
                    }
                });
            }

            while lookups.join_next().await.is_some() {}
            tracker.finish_discovery();
        })
    };

    // Ping stage — connect path only. Verifies the target is reachable
    // through the candidate before committing to a link.
    let ping_stage = with_ping.then(|| {
        let ctx = ctx.clone();
        stage::spawn_stage(
            "ping",
            ping_rx,
            link_tx.clone(),
            err_tx.clone(),
            None,
            internal.clone(),
            move |candidate: Candidate| {
                let ctx = ctx.clone();
                async move { ping_candidate(&ctx, candidate).await }
            },
        )
    });

    // Link stage: Link RPC, then the open handshake.
    let link_stage = {
        let ctx = ctx.clone();
        stage::spawn_stage(
            "link",
            link_rx,
            live_tx.clone(),
            err_tx.clone(),
            params.link_concurrency,
            internal.clone(),
            move |candidate: Candidate| {
                let ctx = ctx.clone();
                async move { link_candidate(&ctx, candidate).await }
            },
        )
    };

    // Error stage: bounded retry re-injection back into the failing stage.
    let error_stage = {
        let ctx = ctx.clone();
        let tracker = tracker.clone();
        let last_error = last_error.clone();
        let drops = params.drops.clone();
        let ping_retry_tx = ping_tx.clone();
        let link_retry_tx = link_tx.clone();
        tokio::spawn(async move {
            while let Some(failure) = err_rx.recv().await {
                let StageFailure {
                    mut candidate,
                    at,
                    error,
                } = failure;
                candidate.attempt += 1;
                let cap = match at {
                    FailedAt::Ping => ctx.config.ping_attempts,
                    FailedAt::Link => ctx.config.link_attempts,
                };
                let retry_target = match at {
                    FailedAt::Ping => &ping_retry_tx,
                    FailedAt::Link => &link_retry_tx,
                };
                if !ctx.internal.is_cancelled()
                    && ctx.config.retryable.should_retry(&error)
                    && candidate.attempt < cap
                {
                    debug!(
                        proxy = %candidate.record.name,
                        attempt = candidate.attempt,
                        error = %error,
                        "pipeline: requeueing candidate"
                    );
                    match retry_target.send(candidate).await {
                        Ok(()) => continue,
                        // Stage already gone — terminal drop instead.
                        Err(mpsc::error::SendError(returned)) => candidate = returned,
                    }
                }
                debug!(
                    proxy = %candidate.record.name,
                    attempts = candidate.attempt,
                    error = %error,
                    "pipeline: candidate dropped"
                );
                if let Some(drops) = &drops {
                    let _ = drops.send(candidate.record.clone()).await;
                }
                *last_error.lock().unwrap() = Some(error);
                tracker.settle();
            }
        })
    };

    // Forwarder: hand live links to the socket; close stragglers the
    // socket no longer wants instead of leaking them.
    let forwarder = {
        let tracker = tracker.clone();
        let produced = produced.clone();
        tokio::spawn(async move {
            while let Some(link) = live_rx.recv().await {
                produced.fetch_add(1, Ordering::AcqRel);
                if let Err(mpsc::error::SendError(link)) = links_tx.send(link).await {
                    debug!(link = ?link.link_id(), "pipeline: socket gone, closing straggler");
                    close_async(link);
                }
                tracker.settle();
            }
        })
    };

    // Only the spawned tasks may keep the stage channels alive now.
    drop(ping_tx);
    drop(link_tx);
    drop(live_tx);
    drop(err_tx);

    tracker.wait_idle(&cancel).await;
    internal.cancel();

    let _ = discovery.await;
    if let Some(handle) = ping_stage {
        let _ = handle.await;
    }
    let _ = link_stage.await;
    let _ = error_stage.await;
    let _ = forwarder.await;

    if produced.load(Ordering::Acquire) > 0 {
        return Ok(());
    }
    if cancel.is_cancelled() {
        return Err(ProxyError::Cancelled);
    }
    let last = last_error.lock().unwrap().take();
    Err(last.unwrap_or(ProxyError::NotFound))
}

/// Verify the target is reachable through this candidate, with an
/// escalating per-attempt timeout.
async fn ping_candidate(
    ctx: &StageCtx,
    candidate: Candidate,
) -> Result<Option<Candidate>, StageFailure> {
    let address = ctx.ping_address.clone().unwrap_or_default();
    let timeout = ctx.config.ping_timeout * (candidate.attempt + 1);
    let msg = Message::request(
        ctx.socket_id,
        candidate.record.address,
        Content::PingRequest { address },
    );
    let result = rpc::call(
        &ctx.services,
        &candidate.record,
        msg,
        Some(timeout),
        &ctx.internal,
    )
    .await
    .and_then(rpc::check);

    match result {
        Ok(_) => Ok(Some(candidate)),
        Err(err) if err.is_cancelled() => Ok(None),
        Err(error) => Err(StageFailure {
            candidate,
            at: FailedAt::Ping,
            error,
        }),
    }
}

/// Issue the Link RPC and run the open handshake. Any failure closes the
/// half-open link asynchronously; cancellation drops the item silently.
async fn link_candidate(
    ctx: &StageCtx,
    candidate: Candidate,
) -> Result<Option<ProxyLink>, StageFailure> {
    let fail = |candidate, error| StageFailure {
        candidate,
        at: FailedAt::Link,
        error,
    };

    let msg = Message::request(
        ctx.socket_id,
        candidate.record.address,
        Content::LinkRequest {
            info: ctx.info.clone(),
        },
    );
    let response = match rpc::call(
        &ctx.services,
        &candidate.record,
        msg,
        ctx.config.rpc_timeout,
        &ctx.internal,
    )
    .await
    {
        Ok(response) => response,
        Err(err) if err.is_cancelled() => return Ok(None),
        Err(err) => return Err(fail(candidate, err)),
    };
    if !response.is_success() {
        return Err(fail(candidate, ProxyError::Socket(response.error)));
    }
    let (remote_id, local_address, peer_address) = match response.content {
        Content::LinkResponse {
            remote_id,
            local_address,
            peer_address,
        } => (remote_id, local_address, peer_address),
        _ => {
            return Err(fail(
                candidate,
                ProxyError::Fault("malformed link response".into()),
            ))
        }
    };

    let mut link = ProxyLink::new(
        ctx.socket_id,
        candidate.record.clone(),
        remote_id,
        local_address,
        peer_address,
        ctx.policy,
        ctx.codec,
        ctx.services.clone(),
        ctx.config.clone(),
        &ctx.socket_cancel,
    );

    let opened = async {
        link.begin_open(&ctx.internal).await?;
        if link.state() == LinkState::Created {
            // Cancelled before a connection was brokered.
            return Err(ProxyError::Cancelled);
        }
        link.try_complete_open(&ctx.internal).await
    }
    .await;

    match opened {
        Ok(()) if ctx.internal.is_cancelled() => {
            // Opened after the cancellation point — still closed, never leaked.
            close_async(link);
            Ok(None)
        }
        Ok(()) => Ok(Some(link)),
        Err(err) => {
            let cancelled = err.is_cancelled();
            close_async(link);
            if cancelled {
                Ok(None)
            } else {
                Err(fail(candidate, err))
            }
        }
    }
}
