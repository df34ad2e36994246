//! Minimal pipeline stage runner.
//!
//! A stage pulls items from a bounded input channel, runs its worker under
//! an optional concurrency bound, pushes results to the next stage's
//! channel and failures to a shared error side-channel. Completion is
//! explicit: when the input closes and in-flight workers drain, the
//! stage's clones of the downstream senders drop, closing them in turn.
//!
//! A worker returning `Ok(None)` consumes its item silently — the shape
//! used when cancellation drops an item with no retry.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::trace;

pub fn spawn_stage<I, O, E, F, Fut>(
    name: &'static str,
    mut input: mpsc::Receiver<I>,
    output: mpsc::Sender<O>,
    errors: mpsc::Sender<E>,
    concurrency: Option<usize>,
    cancel: CancellationToken,
    worker: F,
) -> JoinHandle<()>
where
    I: Send + 'static,
    O: Send + 'static,
    E: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<O>, E>> + Send + 'static,
{
    tokio::spawn(async move {
        let semaphore = concurrency.map(|n| Arc::new(Semaphore::new(n.max(1))));
        let worker = Arc::new(worker);
        let mut in_flight = JoinSet::new();

        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => break,
                item = input.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            let permit = match &semaphore {
                Some(sem) => {
                    let acquired = tokio::select! {
                        _ = cancel.cancelled() => break,
                        permit = sem.clone().acquire_owned() => permit,
                    };
                    match acquired {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    }
                }
                None => None,
            };

            let worker = worker.clone();
            let output = output.clone();
            let errors = errors.clone();
            in_flight.spawn(async move {
                let _permit = permit;
                match worker(item).await {
                    Ok(Some(out)) => {
                        let _ = output.send(out).await;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        let _ = errors.send(err).await;
                    }
                }
            });
        }

        // Drain in-flight workers before completion; workers observe
        // cancellation through their own futures.
        while in_flight.join_next().await.is_some() {}
        trace!(stage = name, "stage: drained");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn routes_outputs_and_errors() {
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (err_tx, mut err_rx) = mpsc::channel(8);

        let handle = spawn_stage(
            "parity",
            in_rx,
            out_tx,
            err_tx,
            Some(2),
            CancellationToken::new(),
            |n: u32| async move {
                if n % 2 == 0 {
                    Ok(Some(n * 10))
                } else {
                    Err(n)
                }
            },
        );

        for n in 0..6u32 {
            in_tx.send(n).await.unwrap();
        }
        drop(in_tx);
        handle.await.unwrap();

        let mut outs = Vec::new();
        while let Some(v) = out_rx.recv().await {
            outs.push(v);
        }
        outs.sort_unstable();
        assert_eq!(outs, vec![0, 20, 40]);

        let mut errs = Vec::new();
        while let Some(v) = err_rx.recv().await {
            errs.push(v);
        }
        errs.sort_unstable();
        assert_eq!(errs, vec![1, 3, 5]);
    }

    #[tokio::test]
    async fn respects_concurrency_bound() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (err_tx, _err_rx) = mpsc::channel::<()>(1);

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let running_w = running.clone();
        let peak_w = peak.clone();

        let handle = spawn_stage(
            "bounded",
            in_rx,
            out_tx,
            err_tx,
            Some(2),
            CancellationToken::new(),
            move |n: u32| {
                let running = running_w.clone();
                let peak = peak_w.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, ()>(Some(n))
                }
            },
        );

        for n in 0..8u32 {
            in_tx.send(n).await.unwrap();
        }
        drop(in_tx);
        handle.await.unwrap();

        let mut count = 0;
        while out_rx.recv().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 8);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn consumed_items_produce_nothing() {
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel::<u32>(4);
        let (err_tx, _err_rx) = mpsc::channel::<()>(1);

        let handle = spawn_stage(
            "drop-all",
            in_rx,
            out_tx,
            err_tx,
            None,
            CancellationToken::new(),
            |_n: u32| async { Ok::<_, ()>(None) },
        );

        in_tx.send(1).await.unwrap();
        in_tx.send(2).await.unwrap();
        drop(in_tx);
        handle.await.unwrap();
        assert!(out_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn cancellation_stops_intake() {
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel::<u32>(4);
        let (err_tx, _err_rx) = mpsc::channel::<()>(1);
        let cancel = CancellationToken::new();

        let handle = spawn_stage(
            "cancelled",
            in_rx,
            out_tx,
            err_tx,
            None,
            cancel.clone(),
            |n: u32| async move { Ok::<_, ()>(Some(n)) },
        );

        cancel.cancel();
        handle.await.unwrap();
        // Items sent after cancellation never reach a worker.
        let _ = in_tx.try_send(9);
        assert!(out_rx.recv().await.is_none());
    }
}
