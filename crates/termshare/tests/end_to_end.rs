//! Host and viewer meeting through a real relay, with in-memory transports.
//!
//! The relay path is real; the peer-to-peer path is bridged by hand by
//! replaying what one side's mock channels received into the other side.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::{eventually, wait_until, MockChannel, MockFactory, MockPty, RecordingScreen, MOCK_ANSWER, MOCK_OFFER};
use termshare::host::{HostConfig, HostSession, LinkState};
use termshare::network::connection::session_url;
use termshare::network::{ChannelKind, PeerState, RelayConfig, RelayConnection, TransportEvent};
use termshare::protocol::{Message, PeerId, WindowSize};
use termshare::relay::RelayServer;
use termshare::viewer::{ViewerConfig, ViewerSession};
use tokio::sync::oneshot;
use tokio::time::timeout;

const HOST_SIZE: WindowSize = WindowSize { rows: 30, cols: 100 };

#[tokio::test]
async fn test_viewer_joins_host_through_relay() {
    let server = RelayServer::bind("127.0.0.1:0", RelayConfig::default())
        .await
        .unwrap();
    let base = format!("ws://{}", server.local_addr().unwrap());
    let sessions = server.sessions();
    let (stop, stopped) = oneshot::channel::<()>();
    let relay_task = tokio::spawn(server.run(async move {
        let _ = stopped.await;
    }));

    // Host side.
    let host_url = session_url(&base, "e2e", &PeerId::host()).unwrap();
    let (host_relay, host_inbound) = RelayConnection::connect(&host_url, RelayConfig::default())
        .await
        .unwrap()
        .into_parts();
    let pty = MockPty::new(HOST_SIZE);
    let host_factory = MockFactory::new();
    let host = HostSession::new(
        HostConfig {
            winsize_retry_interval: Duration::from_millis(20),
            ..HostConfig::default()
        },
        pty.clone(),
        host_relay,
        host_factory.clone(),
    );
    let runner = host.clone();
    tokio::spawn(async move { runner.run_relay(host_inbound).await });

    let sessions_ref = &sessions;
    assert!(
        eventually(|| async move { sessions_ref.members("e2e").await.contains(&PeerId::host()) })
            .await
    );

    // Viewer side, with a terminal smaller than the host's.
    let viewer_url = session_url(&base, "e2e", &PeerId::new("v1")).unwrap();
    let (viewer_relay, viewer_inbound) =
        RelayConnection::connect(&viewer_url, RelayConfig::default())
            .await
            .unwrap()
            .into_parts();
    let viewer_factory = MockFactory::new();
    let screen = RecordingScreen::new();
    let (viewer, _events) = ViewerSession::connect(
        ViewerConfig::default(),
        PeerId::new("v1"),
        viewer_relay,
        viewer_factory.as_ref(),
        screen.clone(),
        WindowSize::new(24, 80),
    )
    .await
    .unwrap();
    let runner = viewer.clone();
    tokio::spawn(async move { runner.run_relay(viewer_inbound).await });

    // Offer and answer cross the relay.
    let host_ref = &host;
    assert!(eventually(|| async move { host_ref.link_count().await == 1 }).await);
    let host_transport = host_factory.transport(0);
    assert_eq!(host_transport.remote_description().as_deref(), Some(MOCK_OFFER));
    let viewer_transport = viewer_factory.transport(0);
    assert!(wait_until(|| viewer_transport.remote_description().as_deref() == Some(MOCK_ANSWER)).await);

    // The peer link comes up and the host opens the viewer's channels.
    let host_data = host_transport.open_channel(ChannelKind::Data).await;
    let host_control = host_transport.open_channel(ChannelKind::Control).await;
    host_transport
        .emit(TransportEvent::StateChanged(PeerState::Connected))
        .await;
    assert!(
        eventually(|| async move {
            host_ref.link_state(&PeerId::new("v1")).await == Some(LinkState::Connected)
        })
        .await
    );

    let viewer_control = MockChannel::new(ChannelKind::Control);
    viewer
        .handle_transport_event(TransportEvent::ChannelOpen(viewer_control.clone()))
        .await;
    viewer
        .handle_transport_event(TransportEvent::StateChanged(PeerState::Connected))
        .await;

    // Window size: host's config channel to the viewer.
    assert!(wait_until(|| !host_control.sent().is_empty()).await);
    for message in host_control.sent() {
        viewer
            .handle_transport_event(TransportEvent::ChannelMessage {
                kind: ChannelKind::Control,
                data: Bytes::from(message),
            })
            .await;
    }
    assert!(viewer.is_muted().await);
    assert!(screen.messages()[0].contains("100x30"));

    // Output while muted never reaches the screen.
    assert_eq!(host.broadcast_output(b"secret").await, 1);
    for chunk in host_data.sent() {
        viewer
            .handle_transport_event(TransportEvent::ChannelMessage {
                kind: ChannelKind::Data,
                data: Bytes::from(chunk),
            })
            .await;
    }
    assert!(screen.output().is_empty());

    // Enlarging the viewer asks the host for a repaint over the config channel.
    let refreshes_before = pty.refreshes();
    viewer.on_local_resize(HOST_SIZE).await;
    let request = viewer_control.sent();
    assert_eq!(request.len(), 1);
    host_transport
        .emit(TransportEvent::ChannelMessage {
            kind: ChannelKind::Control,
            data: Bytes::from(request[0].clone()),
        })
        .await;
    assert!(wait_until(|| pty.refreshes() == refreshes_before + 1).await);

    viewer.stop("Bye!").await;
    assert_eq!(timeout(Duration::from_secs(1), viewer.wait()).await.unwrap(), "Bye!");

    host.shutdown().await;
    assert!(host_transport.is_closed());
    assert_eq!(host.link_count().await, 0);

    let _ = stop.send(());
    timeout(Duration::from_secs(5), relay_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_second_viewer_gets_its_own_link() {
    let server = RelayServer::bind("127.0.0.1:0", RelayConfig::default())
        .await
        .unwrap();
    let base = format!("ws://{}", server.local_addr().unwrap());
    let sessions = server.sessions();
    let (stop, stopped) = oneshot::channel::<()>();
    let relay_task = tokio::spawn(server.run(async move {
        let _ = stopped.await;
    }));

    let host_url = session_url(&base, "pair", &PeerId::host()).unwrap();
    let (host_relay, host_inbound) = RelayConnection::connect(&host_url, RelayConfig::default())
        .await
        .unwrap()
        .into_parts();
    let host_factory = MockFactory::new();
    let host = HostSession::new(
        HostConfig::default(),
        MockPty::new(HOST_SIZE),
        host_relay,
        host_factory.clone(),
    );
    let runner = host.clone();
    tokio::spawn(async move { runner.run_relay(host_inbound).await });
    let sessions_ref = &sessions;
    assert!(
        eventually(|| async move { sessions_ref.members("pair").await.contains(&PeerId::host()) })
            .await
    );

    let mut viewers: Vec<ViewerSession> = Vec::new();
    let mut factories: Vec<Arc<MockFactory>> = Vec::new();
    for name in ["v1", "v2"] {
        let url = session_url(&base, "pair", &PeerId::new(name)).unwrap();
        let (relay, inbound) = RelayConnection::connect(&url, RelayConfig::default())
            .await
            .unwrap()
            .into_parts();
        let factory = MockFactory::new();
        let (viewer, _events) = ViewerSession::connect(
            ViewerConfig::default(),
            PeerId::new(name),
            relay,
            factory.as_ref(),
            RecordingScreen::new(),
            HOST_SIZE,
        )
        .await
        .unwrap();
        let runner = viewer.clone();
        tokio::spawn(async move { runner.run_relay(inbound).await });
        viewers.push(viewer);
        factories.push(factory);
    }

    let host_ref = &host;
    assert!(eventually(|| async move { host_ref.link_count().await == 2 }).await);
    assert_eq!(host.peers().await, vec![PeerId::new("v1"), PeerId::new("v2")]);

    // Each viewer only sees the answer meant for it.
    for factory in &factories {
        let transport = factory.transport(0);
        assert!(wait_until(|| transport.remote_description().as_deref() == Some(MOCK_ANSWER)).await);
    }

    // One viewer leaving does not disturb the other link.
    host_factory
        .transport(0)
        .emit(TransportEvent::StateChanged(PeerState::Closed))
        .await;
    assert!(eventually(|| async move { host_ref.link_count().await == 1 }).await);
    assert_eq!(host.peers().await.len(), 1);
    assert!(!viewers[1].is_stopped());

    for viewer in &viewers {
        viewer.stop("Bye!").await;
    }
    host.shutdown().await;
    let _ = stop.send(());
    timeout(Duration::from_secs(5), relay_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
