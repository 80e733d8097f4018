//! Host session manager against in-memory transports and PTY.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::{
    eventually, wait_until, MockChannel, MockFactory, MockPty, BAD_DESCRIPTION, EARLY_CANDIDATE,
    MOCK_ANSWER, MOCK_OFFER,
};
use termshare::host::{HostConfig, HostSession, LinkState};
use termshare::network::{
    ChannelKind, PeerState, RelayConfig, RelayConnection, RelayHandle, RelayInbound,
    TransportEvent,
};
use termshare::protocol::{Envelope, Message, PeerId, WindowSize};
use tokio::time::timeout;

const HOST_SIZE: WindowSize = WindowSize { rows: 30, cols: 100 };

struct Harness {
    host: HostSession,
    pty: Arc<MockPty>,
    factory: Arc<MockFactory>,
    /// What the host sends to the relay.
    relay_rx: RelayInbound,
    /// Keeps the relay side of the connection open.
    _relay_tx: RelayHandle,
}

async fn harness() -> Harness {
    let (host_end, relay_end) = RelayConnection::pair(RelayConfig::default()).await;
    let pty = MockPty::new(HOST_SIZE);
    let factory = MockFactory::new();
    let config = HostConfig {
        keepalive_interval: Duration::from_millis(50),
        winsize_retry_interval: Duration::from_millis(20),
        winsize_retry_attempts: 25,
    };
    let host = HostSession::new(config, pty.clone(), host_end.handle, factory.clone());
    Harness {
        host,
        pty,
        factory,
        relay_rx: relay_end.inbound,
        _relay_tx: relay_end.handle,
    }
}

fn offer_from(peer: &str) -> Envelope {
    Envelope::new(Message::Offer {
        sdp: MOCK_OFFER.to_string(),
    })
    .with_from(PeerId::new(peer))
    .with_to(PeerId::host())
}

async fn next_sent(rx: &mut RelayInbound) -> Envelope {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("host sent nothing")
        .expect("relay closed")
}

/// Accepts an offer from `peer` and consumes the answer.
async fn add_viewer(h: &mut Harness, peer: &str) {
    h.host.handle_envelope(offer_from(peer)).await;
    let answer = next_sent(&mut h.relay_rx).await;
    assert_eq!(answer.to, Some(PeerId::new(peer)));
}

#[tokio::test]
async fn test_offer_creates_link_and_answers() {
    let mut h = harness().await;

    h.host.handle_envelope(offer_from("v1")).await;

    let answer = next_sent(&mut h.relay_rx).await;
    assert_eq!(
        answer.message,
        Message::Answer {
            sdp: MOCK_ANSWER.to_string()
        }
    );
    assert_eq!(answer.from, Some(PeerId::host()));
    assert_eq!(answer.to, Some(PeerId::new("v1")));

    assert_eq!(h.factory.transport(0).remote_description().as_deref(), Some(MOCK_OFFER));
    assert_eq!(h.host.link_state(&PeerId::new("v1")).await, Some(LinkState::Negotiating));
}

#[tokio::test]
async fn test_answer_goes_out_before_early_candidates() {
    let mut h = harness().await;
    h.factory.set_early_candidates(true);

    h.host.handle_envelope(offer_from("v1")).await;

    let first = next_sent(&mut h.relay_rx).await;
    assert_eq!(
        first.message,
        Message::Answer {
            sdp: MOCK_ANSWER.to_string()
        }
    );
    let second = next_sent(&mut h.relay_rx).await;
    assert_eq!(
        second.message,
        Message::IceCandidate {
            candidate: EARLY_CANDIDATE.to_string()
        }
    );
    assert_eq!(second.to, Some(PeerId::new("v1")));
}

#[tokio::test]
async fn test_duplicate_offer_is_ignored() {
    let mut h = harness().await;
    add_viewer(&mut h, "v1").await;

    h.host.handle_envelope(offer_from("v1")).await;

    assert_eq!(h.factory.count(), 1);
    assert_eq!(h.host.link_count().await, 1);
    assert!(!h.factory.transport(0).is_closed());
}

#[tokio::test]
async fn test_bad_offer_only_affects_its_viewer() {
    let mut h = harness().await;
    add_viewer(&mut h, "good").await;

    let bad = Envelope::new(Message::Offer {
        sdp: BAD_DESCRIPTION.to_string(),
    })
    .with_from(PeerId::new("bad"))
    .with_to(PeerId::host());
    h.host.handle_envelope(bad).await;

    assert_eq!(h.host.peers().await, vec![PeerId::new("good")]);
    assert!(h.factory.transport(1).is_closed());
    assert!(!h.factory.transport(0).is_closed());
}

#[tokio::test]
async fn test_transport_construction_failure_is_contained() {
    let mut h = harness().await;
    add_viewer(&mut h, "v1").await;

    h.factory.set_failing(true);
    h.host.handle_envelope(offer_from("v2")).await;

    assert_eq!(h.host.peers().await, vec![PeerId::new("v1")]);
}

#[tokio::test]
async fn test_envelopes_for_other_peers_are_skipped() {
    let h = harness().await;

    let offer = Envelope::new(Message::Offer {
        sdp: MOCK_OFFER.to_string(),
    })
    .with_from(PeerId::new("v1"))
    .with_to(PeerId::new("v2"));
    h.host.handle_envelope(offer).await;

    assert_eq!(h.factory.count(), 0);
}

#[tokio::test]
async fn test_remote_candidate_applied_to_its_link() {
    let mut h = harness().await;
    add_viewer(&mut h, "v1").await;

    let candidate = Envelope::new(Message::IceCandidate {
        candidate: "{\"candidate\":\"c1\"}".to_string(),
    })
    .with_from(PeerId::new("v1"))
    .with_to(PeerId::host());
    h.host.handle_envelope(candidate).await;

    assert_eq!(h.factory.transport(0).candidates(), vec!["{\"candidate\":\"c1\"}"]);
}

#[tokio::test]
async fn test_candidate_for_unknown_peer_is_harmless() {
    let mut h = harness().await;
    add_viewer(&mut h, "v1").await;

    let candidate = Envelope::new(Message::IceCandidate {
        candidate: "{}".to_string(),
    })
    .with_from(PeerId::new("ghost"));
    h.host.handle_envelope(candidate).await;

    assert!(h.factory.transport(0).candidates().is_empty());
    assert_eq!(h.host.link_count().await, 1);
}

#[tokio::test]
async fn test_local_candidates_are_sent_to_viewer() {
    let mut h = harness().await;
    add_viewer(&mut h, "v1").await;

    h.factory
        .transport(0)
        .emit(TransportEvent::LocalCandidate("{\"candidate\":\"local\"}".to_string()))
        .await;

    let sent = next_sent(&mut h.relay_rx).await;
    assert_eq!(
        sent.message,
        Message::IceCandidate {
            candidate: "{\"candidate\":\"local\"}".to_string()
        }
    );
    assert_eq!(sent.to, Some(PeerId::new("v1")));
}

#[tokio::test]
async fn test_connected_link_gets_window_size_after_retries() {
    let mut h = harness().await;
    add_viewer(&mut h, "v1").await;
    let transport = h.factory.transport(0);

    transport.emit(TransportEvent::StateChanged(PeerState::Connected)).await;
    let host = &h.host;
    assert!(eventually(|| async move { host.link_state(&PeerId::new("v1")).await == Some(LinkState::Connected) }).await);

    // The config channel shows up a few retry intervals later.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let control = transport.open_channel(ChannelKind::Control).await;

    assert!(wait_until(|| !control.sent().is_empty()).await);
    let envelopes = control.sent_envelopes();
    assert_eq!(envelopes.len(), 1);
    assert_eq!(envelopes[0].message, Message::WindowSizeUpdate(HOST_SIZE));
    assert_eq!(envelopes[0].to, Some(PeerId::new("v1")));
}

#[tokio::test]
async fn test_window_size_retry_gives_up() {
    let (host_end, _relay_end) = RelayConnection::pair(RelayConfig::default()).await;
    let factory = MockFactory::new();
    let config = HostConfig {
        keepalive_interval: Duration::from_secs(5),
        winsize_retry_interval: Duration::from_millis(5),
        winsize_retry_attempts: 3,
    };
    let host = HostSession::new(config, MockPty::new(HOST_SIZE), host_end.handle, factory.clone());
    host.handle_envelope(offer_from("v1")).await;

    let delivered = timeout(Duration::from_secs(1), host.deliver_window_size(&PeerId::new("v1")))
        .await
        .unwrap();
    assert!(!delivered);

    // No link at all: gives up at once.
    assert!(!host.deliver_window_size(&PeerId::new("ghost")).await);
}

#[tokio::test]
async fn test_output_reaches_only_open_data_channels() {
    let mut h = harness().await;
    for peer in ["v1", "v2", "v3"] {
        add_viewer(&mut h, peer).await;
    }

    let ch1 = h.factory.transport(0).open_channel(ChannelKind::Data).await;
    let ch2 = h.factory.transport(1).open_channel(ChannelKind::Data).await;
    assert!(wait_until(|| h.pty.refreshes() == 2).await);

    let reached = h.host.broadcast_output(b"ls\n").await;
    assert_eq!(reached, 2);
    assert_eq!(ch1.sent_bytes(), b"ls\n");
    assert_eq!(ch2.sent_bytes(), b"ls\n");

    // A late channel gets a refresh, not a replay.
    let ch3 = h.factory.transport(2).open_channel(ChannelKind::Data).await;
    assert!(wait_until(|| h.pty.refreshes() == 3).await);
    assert!(ch3.sent().is_empty());
}

#[tokio::test]
async fn test_failing_viewer_does_not_block_others() {
    let mut h = harness().await;
    add_viewer(&mut h, "v1").await;
    add_viewer(&mut h, "v2").await;

    let broken = h.factory.transport(0).open_channel(ChannelKind::Data).await;
    let healthy = h.factory.transport(1).open_channel(ChannelKind::Data).await;
    assert!(wait_until(|| h.pty.refreshes() == 2).await);
    broken.set_failing(true);

    assert_eq!(h.host.broadcast_output(b"x").await, 1);
    assert_eq!(healthy.sent_bytes(), b"x");
}

#[tokio::test]
async fn test_viewer_keystrokes_reach_pty_in_order() {
    let mut h = harness().await;
    add_viewer(&mut h, "v1").await;
    let transport = h.factory.transport(0);

    for chunk in ["e", "c", "h", "o", "\r"] {
        transport
            .emit(TransportEvent::ChannelMessage {
                kind: ChannelKind::Data,
                data: Bytes::from(chunk),
            })
            .await;
    }

    assert!(wait_until(|| h.pty.written() == b"echo\r").await);
}

#[tokio::test]
async fn test_concurrent_viewers_input_stays_unmixed() {
    let mut h = harness().await;
    add_viewer(&mut h, "v1").await;
    add_viewer(&mut h, "v2").await;
    h.pty.set_trickle(true);

    let first = h.factory.transport(0);
    let second = h.factory.transport(1);
    let typing = |transport: Arc<common::MockTransport>, chunk: &'static str| async move {
        for _ in 0..5 {
            transport
                .emit(TransportEvent::ChannelMessage {
                    kind: ChannelKind::Data,
                    data: Bytes::from(chunk),
                })
                .await;
        }
    };
    tokio::join!(typing(first, "aaaa"), typing(second, "bbbb"));

    assert!(wait_until(|| h.pty.written().len() == 40).await);
    let written = h.pty.written();
    for chunk in written.chunks(4) {
        assert!(chunk == b"aaaa" || chunk == b"bbbb", "mixed input: {:?}", written);
    }
    assert_eq!(written.iter().filter(|&&b| b == b'a').count(), 20);
}

#[tokio::test]
async fn test_refresh_request_on_config_channel() {
    let mut h = harness().await;
    add_viewer(&mut h, "v1").await;
    let transport = h.factory.transport(0);
    transport.open_channel(ChannelKind::Control).await;

    let request = Envelope::new(Message::RefreshRequest)
        .with_from(PeerId::new("v1"))
        .encode()
        .unwrap();
    transport
        .emit(TransportEvent::ChannelMessage {
            kind: ChannelKind::Control,
            data: Bytes::from(request),
        })
        .await;
    // Unknown or garbled control messages are ignored.
    transport
        .emit(TransportEvent::ChannelMessage {
            kind: ChannelKind::Control,
            data: Bytes::from_static(b"{\"type\":\"passcode\"}"),
        })
        .await;

    assert!(wait_until(|| h.pty.refreshes() == 1).await);
    assert_eq!(h.host.link_count().await, 1);
}

#[tokio::test]
async fn test_disconnect_and_failure_remove_links() {
    let mut h = harness().await;
    for peer in ["v1", "v2", "v3"] {
        add_viewer(&mut h, peer).await;
    }
    let data = h.factory.transport(0).open_channel(ChannelKind::Data).await;

    for i in 0..3 {
        h.factory
            .transport(i)
            .emit(TransportEvent::StateChanged(PeerState::Connected))
            .await;
    }
    let host = &h.host;
    assert!(eventually(|| async move { host.link_state(&PeerId::new("v3")).await == Some(LinkState::Connected) }).await);

    h.factory
        .transport(0)
        .emit(TransportEvent::StateChanged(PeerState::Disconnected))
        .await;
    h.factory
        .transport(1)
        .emit(TransportEvent::StateChanged(PeerState::Failed))
        .await;

    assert!(eventually(|| async move { host.link_count().await == 1 }).await);
    assert_eq!(h.host.peers().await, vec![PeerId::new("v3")]);
    assert!(h.factory.transport(0).is_closed());
    assert!(h.factory.transport(1).is_closed());
    assert!(data.is_closed());
}

#[tokio::test]
async fn test_link_count_tracks_connected_viewers() {
    let mut h = harness().await;
    let peers: Vec<String> = (0..5).map(|i| format!("viewer-{}", i)).collect();
    for peer in &peers {
        add_viewer(&mut h, peer).await;
    }
    assert_eq!(h.host.link_count().await, 5);

    for i in 0..5 {
        h.factory
            .transport(i)
            .emit(TransportEvent::StateChanged(PeerState::Connected))
            .await;
    }
    for i in [1, 3] {
        h.factory
            .transport(i)
            .emit(TransportEvent::StateChanged(PeerState::Closed))
            .await;
    }

    let host = &h.host;
    assert!(eventually(|| async move { host.link_count().await == 3 }).await);
    let mut expected = vec![
        PeerId::new("viewer-0"),
        PeerId::new("viewer-2"),
        PeerId::new("viewer-4"),
    ];
    expected.sort();
    assert_eq!(h.host.peers().await, expected);
}

#[tokio::test]
async fn test_idle_wait_ends_with_last_viewer() {
    let mut h = harness().await;
    let poll = Duration::from_millis(10);

    // No viewers yet: already idle.
    timeout(Duration::from_secs(1), h.host.wait_until_idle(poll))
        .await
        .unwrap();

    add_viewer(&mut h, "v1").await;
    assert!(timeout(Duration::from_millis(100), h.host.wait_until_idle(poll))
        .await
        .is_err());

    let host = h.host.clone();
    let idle = tokio::spawn(async move { host.wait_until_idle(poll).await });
    h.factory
        .transport(0)
        .emit(TransportEvent::StateChanged(PeerState::Closed))
        .await;
    timeout(Duration::from_secs(2), idle).await.unwrap().unwrap();
    assert_eq!(h.host.link_count().await, 0);
}

#[tokio::test]
async fn test_local_resize_updates_pty_and_viewers() {
    let mut h = harness().await;
    add_viewer(&mut h, "v1").await;
    let transport = h.factory.transport(0);
    let control = transport.open_channel(ChannelKind::Control).await;
    transport.emit(TransportEvent::StateChanged(PeerState::Connected)).await;
    assert!(wait_until(|| control.sent().len() == 1).await);

    let bigger = WindowSize::new(50, 160);
    h.host.on_local_resize(bigger).await;

    assert!(wait_until(|| control.sent().len() == 2).await);
    assert_eq!(control.sent_envelopes()[1].message, Message::WindowSizeUpdate(bigger));
}

#[tokio::test]
async fn test_keepalive_is_broadcast() {
    let mut h = harness().await;

    let host = h.host.clone();
    let task = tokio::spawn(async move { host.run_keepalive().await });

    for _ in 0..2 {
        let ping = next_sent(&mut h.relay_rx).await;
        assert_eq!(ping.message, Message::KeepalivePing);
        assert_eq!(ping.from, Some(PeerId::host()));
        assert_eq!(ping.to, None);
    }
    task.abort();
}

#[tokio::test]
async fn test_shutdown_closes_everything_once() {
    let mut h = harness().await;
    add_viewer(&mut h, "v1").await;
    add_viewer(&mut h, "v2").await;
    let data: Arc<MockChannel> = h.factory.transport(0).open_channel(ChannelKind::Data).await;
    assert!(wait_until(|| h.pty.refreshes() == 1).await);

    h.host.shutdown().await;
    h.host.shutdown().await;

    assert_eq!(h.host.link_count().await, 0);
    assert!(h.factory.transport(0).is_closed());
    assert!(h.factory.transport(1).is_closed());
    assert!(data.is_closed());

    // New viewers are refused once shut down.
    h.host.handle_envelope(offer_from("v3")).await;
    assert_eq!(h.factory.count(), 2);
}
