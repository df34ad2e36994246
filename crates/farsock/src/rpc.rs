//! Control-channel RPC helpers.
//!
//! `call` allocates the sequence id and performs one request/response
//! exchange. `broadcast` fans a request out to every proxy the directory
//! knows about and lets the caller decide, response by response, when the
//! answer is good enough.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use farsock_wire::{Message, NameRecord};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::service::{NameQuery, Services};

/// Process-wide sequence counter. Correlation only needs uniqueness per
/// source, so one counter serves every socket.
static SEQUENCE: AtomicU32 = AtomicU32::new(1);

pub fn next_sequence() -> u32 {
    SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// One request/response exchange with `proxy`.
///
/// Allocates the sequence id and returns the raw response; use [`check`]
/// when a non-success response should become an error.
pub async fn call(
    services: &Services,
    proxy: &NameRecord,
    mut msg: Message,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<Message, ProxyError> {
    msg.sequence_id = next_sequence();
    services.control.call(proxy, msg, timeout, cancel).await
}

/// Fail on a response carrying a non-success fault code.
pub fn check(response: Message) -> Result<Message, ProxyError> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(ProxyError::Socket(response.error))
    }
}

/// The broadcast handler's verdict on one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Good answer — end the whole broadcast now.
    Done,
    /// Not it — requeue this candidate for the next round.
    Retry,
}

/// Send `msg` to every `Proxy`-type record and collect responses as they
/// arrive, not waiting for the slowest candidate.
///
/// Each round calls all remaining candidates concurrently with a timeout
/// that grows with the candidate's attempt count. `Done` ends the
/// broadcast immediately and cancels every still-pending call. `Retry`,
/// faults, and timeouts requeue the candidate until its attempt cap.
///
/// Returns `Ok(())` once `Done` is signalled, `Err(NotFound)` when every
/// candidate is exhausted, `Err(Cancelled)` when the caller cancels.
pub async fn broadcast<F>(
    services: &Services,
    config: &ProxyConfig,
    msg: Message,
    mut on_response: F,
    cancel: &CancellationToken,
) -> Result<(), ProxyError>
where
    F: FnMut(Message, &NameRecord) -> Disposition + Send,
{
    // Collect all proxy candidates, de-duplicated by record id so one
    // proxy cannot answer twice in a round.
    let mut lookup = services.directory.lookup(NameQuery::any_proxies()).await?;
    let mut seen = HashSet::new();
    let mut round: Vec<(NameRecord, u32)> = Vec::new();
    while let Some(record) = lookup.recv().await {
        if seen.insert(record.id.clone()) {
            round.push((record, 0));
        }
    }
    debug!(candidates = round.len(), "broadcast: starting");

    let call_cancel = cancel.child_token();

    while !round.is_empty() {
        if cancel.is_cancelled() {
            return Err(ProxyError::Cancelled);
        }

        let mut calls = JoinSet::new();
        for (record, attempt) in round.drain(..) {
            let services = services.clone();
            let msg = msg.clone();
            let token = call_cancel.clone();
            let timeout = config.broadcast_timeout * (attempt + 1);
            calls.spawn(async move {
                let result = call(&services, &record, msg, Some(timeout), &token).await;
                (record, attempt, result)
            });
        }

        let mut next = Vec::new();
        while let Some(joined) = calls.join_next().await {
            let Ok((record, attempt, result)) = joined else {
                continue;
            };
            match result {
                Ok(response) => match on_response(response, &record) {
                    Disposition::Done => {
                        debug!(proxy = %record.name, "broadcast: done");
                        call_cancel.cancel();
                        calls.abort_all();
                        while calls.join_next().await.is_some() {}
                        return Ok(());
                    }
                    Disposition::Retry => {
                        requeue(&mut next, record, attempt, config.broadcast_attempts);
                    }
                },
                Err(err) if err.is_cancelled() => {}
                Err(err) => {
                    debug!(proxy = %record.name, error = %err, "broadcast: candidate faulted");
                    requeue(&mut next, record, attempt, config.broadcast_attempts);
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(ProxyError::Cancelled);
        }
        round = next;
    }

    Err(ProxyError::NotFound)
}

fn requeue(
    next: &mut Vec<(NameRecord, u32)>,
    record: NameRecord,
    attempt: u32,
    cap: u32,
) {
    if attempt + 1 < cap {
        next.push((record, attempt + 1));
    } else {
        debug!(proxy = %record.name, attempts = attempt + 1, "broadcast: candidate exhausted");
    }
}
