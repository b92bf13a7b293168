//! Integration tests for the link lifecycle against the in-memory platform.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::watch;

use fieldpainter_link::bluetooth::mock::MockPlatform;
use fieldpainter_link::bluetooth::{AdapterStatus, Command, TelemetryEvent, TelemetryListener};
use fieldpainter_link::state::DEFAULT_BATTERY_DISPLAY;
use fieldpainter_link::{
    ConnectionState, LinkConfig, LinkError, LinkManager, Peer, RobotController, RobotStatus,
};

const WAIT: Duration = Duration::from_secs(2);

fn robot() -> Peer {
    Peer::new("00:11:22:33:44:55".parse().unwrap(), Some("FieldPainterBot".into()))
}

fn setup() -> (Arc<MockPlatform>, LinkManager) {
    let platform = Arc::new(MockPlatform::new());
    let config = LinkConfig {
        accept_retry_delay: Duration::from_millis(10),
        ..LinkConfig::default()
    };
    let link = LinkManager::new(platform.clone(), config);
    (platform, link)
}

async fn wait_for_state(rx: &mut watch::Receiver<ConnectionState>, state: ConnectionState) {
    tokio::time::timeout(WAIT, rx.wait_for(|current| *current == state))
        .await
        .expect("timed out waiting for state")
        .expect("state channel closed");
}

/// Connect as client and return the robot's end of the link.
async fn connect(platform: &MockPlatform, link: &LinkManager) -> DuplexStream {
    let mut state = link.subscribe_state();
    link.connect(robot());
    let remote = tokio::time::timeout(WAIT, platform.next_remote())
        .await
        .unwrap()
        .unwrap();
    wait_for_state(&mut state, ConnectionState::Connected).await;
    remote
}

async fn read_line(reader: &mut BufReader<DuplexStream>) -> String {
    let mut line = String::new();
    tokio::time::timeout(WAIT, reader.read_line(&mut line))
        .await
        .unwrap()
        .unwrap();
    line
}

async fn expect_eof(remote: &mut DuplexStream) {
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(WAIT, remote.read(&mut buf))
        .await
        .expect("remote end still open")
        .unwrap();
    assert_eq!(n, 0);
}

type Events = Arc<Mutex<Vec<TelemetryEvent>>>;

fn collecting_listener() -> (Events, Arc<dyn TelemetryListener>) {
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let listener: Arc<dyn TelemetryListener> =
        Arc::new(move |event: TelemetryEvent| sink.lock().push(event));
    (events, listener)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for condition");
}

async fn wait_for_events(events: &Mutex<Vec<TelemetryEvent>>, count: usize) {
    wait_until(|| events.lock().len() >= count).await;
}

#[tokio::test]
async fn test_client_connect_and_ordered_send() {
    let (platform, link) = setup();
    let remote = connect(&platform, &link).await;

    assert_eq!(link.state(), ConnectionState::Connected);
    assert_eq!(link.connected_peer(), Some(robot()));

    for message in ["A\n", "B\n", "C\n"] {
        link.try_send(message).unwrap();
    }

    let mut reader = BufReader::new(remote);
    assert_eq!(read_line(&mut reader).await, "A\n");
    assert_eq!(read_line(&mut reader).await, "B\n");
    assert_eq!(read_line(&mut reader).await, "C\n");

    let stats = link.stats();
    assert_eq!(stats.messages_enqueued, 3);
    assert_eq!(stats.sessions_opened, 1);
}

#[tokio::test]
async fn test_send_while_disconnected_reports_error() {
    let (_platform, link) = setup();

    let ok_called = Arc::new(Mutex::new(false));
    let error = Arc::new(Mutex::new(None));
    {
        let ok_called = ok_called.clone();
        let error = error.clone();
        link.send(
            "FORWARD\n",
            move || *ok_called.lock() = true,
            move |e| *error.lock() = Some(e),
        );
    }

    assert!(!*ok_called.lock());
    assert_eq!(*error.lock(), Some(LinkError::NotConnected));
    assert_eq!(link.try_send("x"), Err(LinkError::NotConnected));
    assert_eq!(link.stats().messages_enqueued, 0);
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let (platform, link) = setup();

    link.disconnect();
    link.disconnect();
    assert_eq!(link.state(), ConnectionState::Disconnected);

    let mut remote = connect(&platform, &link).await;
    link.disconnect();
    link.disconnect();

    assert_eq!(link.state(), ConnectionState::Disconnected);
    assert!(link.connected_peer().is_none());
    expect_eof(&mut remote).await;
}

#[tokio::test]
async fn test_remote_close_drops_link() {
    let (platform, link) = setup();
    let mut remote = connect(&platform, &link).await;
    let mut state = link.subscribe_state();

    // Send loop sits idle on an empty queue; end of stream alone must end it.
    remote.shutdown().await.unwrap();
    wait_for_state(&mut state, ConnectionState::Disconnected).await;

    expect_eof(&mut remote).await;
    assert_eq!(link.try_send("A\n"), Err(LinkError::NotConnected));
}

#[tokio::test]
async fn test_write_failure_drops_link() {
    let (platform, link) = setup();
    platform.break_writes(true);
    let mut remote = connect(&platform, &link).await;
    let mut state = link.subscribe_state();

    link.try_send("A\n").unwrap();
    wait_for_state(&mut state, ConnectionState::Disconnected).await;

    // The receive loop went down with the send loop and released its half.
    expect_eof(&mut remote).await;
    assert!(link.connected_peer().is_none());
    assert_eq!(link.try_send("B\n"), Err(LinkError::NotConnected));
    assert_eq!(link.stats().messages_written, 0);
}

#[tokio::test]
async fn test_refused_connect_returns_to_disconnected() {
    let (platform, link) = setup();
    platform.refuse_connections(true);

    let handle = link.connect(robot());
    tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();

    assert_eq!(link.state(), ConnectionState::Disconnected);
    assert_eq!(link.stats().sessions_opened, 0);

    // No automatic retry; a new attempt works once the robot accepts.
    platform.refuse_connections(false);
    connect(&platform, &link).await;
}

#[tokio::test]
async fn test_connect_without_adapter_fails() {
    let (platform, link) = setup();
    platform.set_adapter_status(AdapterStatus::PoweredOff);

    let handle = link.connect(robot());
    tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
    assert_eq!(link.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_disconnect_abandons_pending_connect() {
    let (platform, link) = setup();
    platform.hold_connects(true);

    let handle = link.connect(robot());
    let mut remote = tokio::time::timeout(WAIT, platform.next_remote())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(link.state(), ConnectionState::Connecting);

    link.disconnect();
    assert_eq!(link.state(), ConnectionState::Disconnected);

    platform.release_connect();
    tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();

    assert_eq!(link.state(), ConnectionState::Disconnected);
    assert!(link.connected_peer().is_none());
    expect_eof(&mut remote).await;
}

#[tokio::test]
async fn test_second_connect_ignored_while_connecting() {
    let (platform, link) = setup();
    platform.hold_connects(true);

    link.connect(robot());
    let _remote = tokio::time::timeout(WAIT, platform.next_remote())
        .await
        .unwrap()
        .unwrap();

    let other = Peer::new("AA:BB:CC:DD:EE:FF".parse().unwrap(), None);
    let second = link.connect(other);
    tokio::time::timeout(WAIT, second).await.unwrap().unwrap();

    let mut state = link.subscribe_state();
    platform.release_connect();
    wait_for_state(&mut state, ConnectionState::Connected).await;
    assert_eq!(link.connected_peer(), Some(robot()));
}

#[tokio::test]
async fn test_discovery_rejected_without_adapter() {
    let (platform, link) = setup();

    platform.set_adapter_status(AdapterStatus::PoweredOff);
    assert_eq!(link.start_discovery().await, Err(LinkError::NoAdapter));
    assert_eq!(link.state(), ConnectionState::Disconnected);

    platform.set_adapter_status(AdapterStatus::PermissionDenied);
    assert_eq!(link.start_discovery().await, Err(LinkError::PermissionDenied));
}

#[tokio::test]
async fn test_discovery_rejected_while_connecting() {
    let (platform, link) = setup();
    platform.hold_connects(true);

    link.connect(robot());
    let _remote = tokio::time::timeout(WAIT, platform.next_remote())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(link.start_discovery().await, Err(LinkError::Busy));
    assert_eq!(link.state(), ConnectionState::Connecting);

    let mut state = link.subscribe_state();
    platform.release_connect();
    wait_for_state(&mut state, ConnectionState::Connected).await;

    // Once connected the radio is free for scanning again.
    link.start_discovery().await.unwrap();
    assert_eq!(link.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_discovery_deduplicates_peers() {
    let (platform, link) = setup();
    link.start_discovery().await.unwrap();

    let address = "00:11:22:33:44:55".parse().unwrap();
    let nameless = Peer::new(address, None);

    tokio::time::timeout(WAIT, async {
        while !platform.announce(nameless.clone()) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let mut peers = link.subscribe_peers();
    assert!(platform.announce(robot()));
    assert!(platform.announce(robot()));
    assert!(platform.announce(Peer::new("AA:BB:CC:DD:EE:FF".parse().unwrap(), None)));

    tokio::time::timeout(WAIT, peers.wait_for(|peers| peers.len() == 2))
        .await
        .unwrap()
        .unwrap();

    let found = link.peers();
    assert_eq!(found.len(), 2);
    assert_eq!(found[0].address, address);
    assert_eq!(found[0].label(), "FieldPainterBot");
    assert_eq!(found[1].label(), "AA:BB:CC:DD:EE:FF");

    // A new cycle starts from an empty list.
    link.start_discovery().await.unwrap();
    assert!(link.peers().is_empty());
}

#[tokio::test]
async fn test_server_accepts_robot() {
    let (platform, link) = setup();
    let mut state = link.subscribe_state();

    link.start_server();
    link.start_server();
    assert_eq!(link.state(), ConnectionState::Listening);

    wait_until(|| platform.is_listening()).await;

    let remote = platform.dial_in(robot()).unwrap();
    wait_for_state(&mut state, ConnectionState::Connected).await;

    link.try_send("SPRAY\n").unwrap();
    let mut reader = BufReader::new(remote);
    assert_eq!(read_line(&mut reader).await, "SPRAY\n");
}

#[tokio::test]
async fn test_server_replaces_previous_client() {
    let (platform, link) = setup();
    let mut state = link.subscribe_state();
    link.start_server();

    wait_until(|| platform.is_listening()).await;

    let mut first = platform.dial_in(robot()).unwrap();
    wait_for_state(&mut state, ConnectionState::Connected).await;

    let other = Peer::new("AA:BB:CC:DD:EE:FF".parse().unwrap(), None);
    let second = platform.dial_in(other.clone()).unwrap();

    expect_eof(&mut first).await;
    wait_until(|| link.connected_peer() == Some(other.clone())).await;
    assert_eq!(link.state(), ConnectionState::Connected);

    link.try_send("LEFT\n").unwrap();
    let mut reader = BufReader::new(second);
    assert_eq!(read_line(&mut reader).await, "LEFT\n");
}

#[tokio::test]
async fn test_server_keeps_listening_after_peer_drop() {
    let (platform, link) = setup();
    let mut state = link.subscribe_state();
    link.start_server();

    wait_until(|| platform.is_listening()).await;

    let remote = platform.dial_in(robot()).unwrap();
    wait_for_state(&mut state, ConnectionState::Connected).await;

    drop(remote);
    wait_for_state(&mut state, ConnectionState::Listening).await;

    // The same endpoint takes the reconnect.
    let _remote = platform.dial_in(robot()).unwrap();
    wait_for_state(&mut state, ConnectionState::Connected).await;

    link.disconnect();
    assert_eq!(link.state(), ConnectionState::Disconnected);
    wait_until(|| !platform.is_listening()).await;
}

#[tokio::test]
async fn test_server_endpoint_closed() {
    let (platform, link) = setup();
    let mut state = link.subscribe_state();
    link.start_server();
    wait_until(|| platform.is_listening()).await;

    platform.close_listener();
    wait_for_state(&mut state, ConnectionState::Disconnected).await;

    // The dead endpoint is forgotten, so the server can be started again.
    link.start_server();
    assert_eq!(link.state(), ConnectionState::Listening);
    wait_until(|| platform.is_listening()).await;
    assert!(platform.dial_in(robot()).is_some());
    wait_for_state(&mut state, ConnectionState::Connected).await;
}

#[tokio::test]
async fn test_server_endpoint_closed_keeps_session() {
    let (platform, link) = setup();
    let mut state = link.subscribe_state();
    link.start_server();
    wait_until(|| platform.is_listening()).await;

    let remote = platform.dial_in(robot()).unwrap();
    wait_for_state(&mut state, ConnectionState::Connected).await;

    platform.close_listener();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(link.state(), ConnectionState::Connected);

    // Nothing left to listen with, so a dropped robot means Disconnected.
    drop(remote);
    wait_for_state(&mut state, ConnectionState::Disconnected).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(link.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_server_listen_failure() {
    let (platform, link) = setup();
    platform.fail_listen(true);
    let mut state = link.subscribe_state();

    link.start_server();
    assert_eq!(*state.borrow_and_update(), ConnectionState::Listening);
    wait_for_state(&mut state, ConnectionState::Disconnected).await;

    // A later start is allowed again.
    platform.fail_listen(false);
    link.start_server();
    assert_eq!(link.state(), ConnectionState::Listening);
}

#[tokio::test]
async fn test_connect_cancels_server() {
    let (platform, link) = setup();
    link.start_server();

    wait_until(|| platform.is_listening()).await;

    connect(&platform, &link).await;
    wait_until(|| !platform.is_listening()).await;
}

#[tokio::test]
async fn test_telemetry_reaches_listener() {
    let (platform, link) = setup();
    let (events, listener) = collecting_listener();
    link.set_listener(listener);

    let mut remote = connect(&platform, &link).await;
    remote
        .write_all(b"BATTERY:85\ngarbage\nSPRAY:40\r\nPROGRESS:12")
        .await
        .unwrap();

    wait_for_events(&events, 3).await;
    assert_eq!(
        *events.lock(),
        vec![
            TelemetryEvent::Battery(85),
            TelemetryEvent::SprayLevel(40),
            TelemetryEvent::Progress(12),
        ]
    );

    let stats = link.stats();
    assert_eq!(stats.records_received, 4);
    assert_eq!(stats.unrecognized_records, 1);
}

#[tokio::test]
async fn test_listener_replacement() {
    let (platform, link) = setup();
    let (first, first_listener) = collecting_listener();
    let (second, second_listener) = collecting_listener();

    link.set_listener(first_listener);
    let mut remote = connect(&platform, &link).await;

    remote.write_all(b"BATTERY:50\n").await.unwrap();
    wait_for_events(&first, 1).await;

    link.set_listener(second_listener);
    remote.write_all(b"BATTERY:49\n").await.unwrap();
    wait_for_events(&second, 1).await;

    assert_eq!(*first.lock(), vec![TelemetryEvent::Battery(50)]);
    assert_eq!(*second.lock(), vec![TelemetryEvent::Battery(49)]);
}

#[tokio::test]
async fn test_cleared_listener_drops_telemetry() {
    let (platform, link) = setup();
    let (events, listener) = collecting_listener();
    link.set_listener(listener);

    let mut remote = connect(&platform, &link).await;
    remote.write_all(b"BATTERY:60\n").await.unwrap();
    wait_for_events(&events, 1).await;

    link.clear_listener();
    remote.write_all(b"BATTERY:59\n").await.unwrap();
    wait_until(|| link.stats().records_received == 2).await;

    assert_eq!(*events.lock(), vec![TelemetryEvent::Battery(60)]);
    assert_eq!(link.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_status_tracks_telemetry() {
    let (platform, link) = setup();
    let status = RobotStatus::new();
    link.set_listener(status.clone());

    assert_eq!(status.snapshot().battery_display(), DEFAULT_BATTERY_DISPLAY);

    let mut remote = connect(&platform, &link).await;
    remote.write_all(b"BATTERY:15\nPROGRESS:100\n").await.unwrap();

    wait_until(|| status.snapshot().is_complete()).await;

    // Last report survives the disconnect.
    link.disconnect();
    assert_eq!(status.snapshot().battery_display(), 15);
}

#[tokio::test]
async fn test_controller_drive_commands() {
    let (platform, link) = setup();
    let controller = RobotController::new(link.clone());

    assert_eq!(
        controller.press(Command::Forward),
        Err(LinkError::NotConnected)
    );

    let remote = connect(&platform, &link).await;
    controller.press(Command::Forward).unwrap();
    controller.release(Command::Forward).unwrap();

    let mut reader = BufReader::new(remote);
    assert_eq!(
        read_line(&mut reader).await,
        "{\"command\":\"FORWARD\",\"state\":\"pressed\"}\n"
    );
    assert_eq!(
        read_line(&mut reader).await,
        "{\"command\":\"FORWARD\",\"state\":\"released\"}\n"
    );
}

#[tokio::test]
async fn test_pattern_upload_gates_on_success() {
    let (platform, link) = setup();
    let controller = RobotController::new(link.clone());
    let pattern = r#"{"items": [{"Type of Movement": "walk"}]}"#;

    let completed = Arc::new(Mutex::new(false));
    let failed = Arc::new(Mutex::new(None));

    {
        let completed = completed.clone();
        let failed = failed.clone();
        controller.upload_pattern(
            pattern,
            move || *completed.lock() = true,
            move |e| *failed.lock() = Some(e),
        );
    }
    assert!(!*completed.lock());
    assert_eq!(*failed.lock(), Some(LinkError::NotConnected));

    let remote = connect(&platform, &link).await;
    {
        let completed = completed.clone();
        controller.upload_pattern(pattern, move || *completed.lock() = true, |_| {});
    }
    assert!(*completed.lock());

    let mut reader = BufReader::new(remote);
    let line = read_line(&mut reader).await;
    assert!(line.starts_with("{\"items\":["));
    assert!(line.ends_with("}\n"));
}
