//! Broadcast sockets and the all-proxy broadcast RPC: persistent links
//! per proxy, relink after a remote close, fan-out send, and the
//! Done/Retry round semantics.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{harness, wait_until, ProxyBehavior};
use farsock::{rpc, Disposition, ProxyConfig, ProxyError, ProxySocket, SocketMode};
use farsock_wire::{CodecId, Content, FaultCode, Message, Reference, SocketInfo};
use tokio_util::sync::CancellationToken;

fn broadcast_socket(h: &common::Harness) -> Arc<ProxySocket> {
    ProxySocket::new(
        SocketMode::Broadcast,
        SocketInfo {
            family: 2,
            kind: 2,
            protocol: 17,
            ..SocketInfo::default()
        },
        CodecId::Binary,
        h.services.clone(),
        ProxyConfig::default(),
    )
}

#[tokio::test]
async fn bind_links_every_discovered_proxy() {
    let h = harness();
    h.directory.add_proxy("p1");
    h.directory.add_proxy("p2");
    h.directory.add_proxy("p3");

    let socket = broadcast_socket(&h);
    socket.bind(&[], &CancellationToken::new()).await.unwrap();

    wait_until("all proxies linked", || socket.link_count() == 3).await;
    let mut proxies = socket.linked_proxies();
    proxies.sort();
    assert_eq!(proxies, vec!["p1", "p2", "p3"]);
}

#[tokio::test]
async fn remote_close_is_absorbed_by_relinking() {
    let h = harness();
    h.directory.add_proxy("p1");

    let socket = broadcast_socket(&h);
    socket.bind(&[], &CancellationToken::new()).await.unwrap();
    assert_eq!(socket.link_count(), 1);

    // Drive a remote-initiated close down the first link's data stream.
    let proxy_stream = h.streams.take_proxy_side(0).expect("proxy side of link 0");
    let close = Message::request(
        Reference::generate(),
        socket.id(),
        Content::CloseRequest,
    );
    proxy_stream
        .send(close, &CancellationToken::new())
        .await
        .unwrap();

    // The link is replaced rather than failing the socket.
    wait_until("replacement link", || h.streams.created() == 2).await;
    wait_until("link set restored", || socket.link_count() == 1).await;
    assert!(!socket.is_closed());
    socket
        .send(b"still alive", &CancellationToken::new())
        .await
        .unwrap();
}

#[tokio::test]
async fn send_fans_out_to_every_link() {
    let h = harness();
    h.directory.add_proxy("p1");
    h.directory.add_proxy("p2");

    let socket = broadcast_socket(&h);
    socket.bind(&[], &CancellationToken::new()).await.unwrap();
    wait_until("both proxies linked", || socket.link_count() == 2).await;

    socket
        .send(b"hello mesh", &CancellationToken::new())
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    for index in 0..2 {
        let mut proxy_stream = h
            .streams
            .take_proxy_side(index)
            .expect("proxy side present");
        let msg = proxy_stream.recv(&cancel).await.unwrap();
        match msg.content {
            Content::Data { payload } => assert_eq!(&payload[..], b"hello mesh"),
            other => panic!("expected data, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn recv_delivers_first_datagram_from_any_link() {
    let h = harness();
    h.directory.add_proxy("p1");
    h.directory.add_proxy("p2");

    let socket = broadcast_socket(&h);
    socket.bind(&[], &CancellationToken::new()).await.unwrap();
    wait_until("both proxies linked", || socket.link_count() == 2).await;

    let cancel = CancellationToken::new();
    let proxy_stream = h.streams.take_proxy_side(1).expect("proxy side present");
    proxy_stream
        .send(
            Message::data(
                Reference::generate(),
                socket.id(),
                bytes::Bytes::from_static(b"announce"),
            ),
            &cancel,
        )
        .await
        .unwrap();

    let mut buf = [0u8; 64];
    let n = socket.recv(&mut buf, &cancel).await.unwrap();
    assert_eq!(&buf[..n], b"announce");
}

#[tokio::test]
async fn broadcast_rpc_done_short_circuits() {
    let h = harness();
    let _p1 = h.directory.add_proxy("p1");
    let _p2 = h.directory.add_proxy("p2");
    let p3 = h.directory.add_proxy("p3");
    h.control.set_behavior(
        &p3,
        ProxyBehavior {
            delay: Some(Duration::from_millis(800)),
            ..ProxyBehavior::default()
        },
    );

    let msg = Message::request(
        Reference::generate(),
        Reference::NULL,
        Content::PingRequest { address: "*".into() },
    );
    let started = Instant::now();
    let result = rpc::broadcast(
        &h.services,
        &ProxyConfig::default(),
        msg,
        |_response, record| {
            if record.name == "p2" {
                Disposition::Done
            } else {
                Disposition::Retry
            }
        },
        &CancellationToken::new(),
    )
    .await;

    assert!(result.is_ok());
    // Done arrives without waiting for the slowest candidate.
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "broadcast waited for the slow candidate"
    );
    // Every still-pending per-candidate call was cancelled before return.
    assert_eq!(h.control.pending_calls(), 0);
}

#[tokio::test]
async fn broadcast_rpc_exhausts_candidates_to_not_found() {
    let h = harness();
    h.directory.add_proxy("p1");
    h.directory.add_proxy("p2");

    let config = ProxyConfig::default();
    let rounds = AtomicUsize::new(0);
    let msg = Message::request(
        Reference::generate(),
        Reference::NULL,
        Content::PingRequest { address: "*".into() },
    );
    let err = rpc::broadcast(
        &h.services,
        &config,
        msg,
        |_response, _record| {
            rounds.fetch_add(1, Ordering::SeqCst);
            Disposition::Retry
        },
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, ProxyError::NotFound), "got {err:?}");
    // Each candidate was offered its full attempt budget.
    assert_eq!(
        rounds.load(Ordering::SeqCst) as u32,
        2 * config.broadcast_attempts
    );
}

#[tokio::test]
async fn receive_error_detaches_and_relinks() {
    let h = harness();
    h.directory.add_proxy("p1");

    let socket = broadcast_socket(&h);
    socket.bind(&[], &CancellationToken::new()).await.unwrap();

    // A faulted response on the data path detaches the link.
    let proxy_stream = h.streams.take_proxy_side(0).expect("proxy side of link 0");
    let probe = Message::request(
        Reference::generate(),
        socket.id(),
        Content::PollRequest { budget: 1 },
    );
    let faulted = Message::error_response_to(&probe, FaultCode::Fatal);
    proxy_stream
        .send(faulted, &CancellationToken::new())
        .await
        .unwrap();

    wait_until("replacement link", || h.streams.created() == 2).await;
    wait_until("link set restored", || socket.link_count() == 1).await;
    assert!(!socket.is_closed());
}
