// ABOUTME: Integration tests for client session lifecycle
// ABOUTME: Handshake, heartbeat timing, FIFO delivery and cleanup under paused time

use std::time::Duration;

use campus_relay::bus::EventBus;
use campus_relay::frame::EncodedFrame;
use campus_relay::session::{ClientSession, CloseReason, SessionState, SessionSummary};
use campus_relay::shutdown::Shutdown;
use chrono::Utc;
use serde_json::{json, Value};
use table_watcher::{ChangeEvent, ChangeOperation, TableName, TableSet};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const HEARTBEAT: Duration = Duration::from_secs(25);

fn start(
    bus: &std::sync::Arc<EventBus>,
    tables: TableSet,
    sink_capacity: usize,
    shutdown: Shutdown,
) -> (mpsc::Receiver<EncodedFrame>, JoinHandle<SessionSummary>) {
    let session = ClientSession::open(bus, tables, HEARTBEAT);
    let (tx, rx) = mpsc::channel(sink_capacity);
    (rx, tokio::spawn(session.run(tx, shutdown)))
}

fn insert(table: TableName, id: i64) -> ChangeEvent {
    ChangeEvent::new(
        table,
        ChangeOperation::Insert,
        json!({ "id": id }).as_object().cloned(),
        None,
        Utc::now(),
    )
    .unwrap()
}

fn parse(frame: &EncodedFrame) -> Value {
    serde_json::from_str(&frame.json).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_connection_established_is_first_frame() {
    let bus = EventBus::new(16);
    let (mut rx, handle) = start(&bus, "students,grades".parse().unwrap(), 16, Shutdown::new());

    let first = rx.recv().await.unwrap();
    assert_eq!(first.event, "connection_established");
    let value = parse(&first);
    assert_eq!(value["type"], "connection_established");
    assert_eq!(value["data"]["tables"], json!(["students", "grades"]));
    assert_eq!(value["data"]["heartbeat_interval_secs"], 25);
    assert!(value["data"]["session_id"].is_string());

    drop(rx);
    let summary = handle.await.unwrap();
    assert_eq!(summary.close_reason, CloseReason::ClientGone);
    assert_eq!(summary.frames_written, 1);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_within_each_interval_when_idle() {
    let bus = EventBus::new(16);
    let (mut rx, handle) = start(&bus, TableSet::all(), 16, Shutdown::new());
    assert_eq!(rx.recv().await.unwrap().event, "connection_established");

    for _ in 0..3 {
        let before = Instant::now();
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.event, "heartbeat");
        assert!(parse(&frame)["data"].is_null());
        assert!(before.elapsed() <= HEARTBEAT);
    }

    drop(rx);
    let summary = handle.await.unwrap();
    assert_eq!(summary.heartbeats_written, 3);
    assert_eq!(summary.events_written, 0);
}

#[tokio::test(start_paused = true)]
async fn test_events_written_in_fifo_order() {
    let bus = EventBus::new(16);
    let (mut rx, handle) = start(&bus, "courses".parse().unwrap(), 16, Shutdown::new());
    assert_eq!(rx.recv().await.unwrap().event, "connection_established");

    for id in 0..5 {
        bus.publish(insert(TableName::Courses, id));
        bus.publish(insert(TableName::Faculty, 100 + id));
    }

    for id in 0..5 {
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.event, "courses_inserted");
        let value = parse(&frame);
        assert_eq!(value["data"]["table"], "courses");
        assert_eq!(value["data"]["new_record"]["id"], id);
    }

    drop(rx);
    let summary = handle.await.unwrap();
    assert_eq!(summary.events_written, 5);
    assert_eq!(summary.dropped, 0);
}

#[tokio::test(start_paused = true)]
async fn test_client_disconnect_unregisters_subscriber() {
    let bus = EventBus::new(16);
    let _bystander = bus.subscribe(TableSet::all());
    let before = bus.subscriber_count();

    let (mut rx, handle) = start(&bus, TableSet::all(), 16, Shutdown::new());
    rx.recv().await.unwrap();
    assert_eq!(bus.subscriber_count(), before + 1);

    drop(rx);
    let summary = handle.await.unwrap();
    assert_eq!(summary.close_reason, CloseReason::ClientGone);
    assert_eq!(summary.final_state, SessionState::Closed);
    assert_eq!(bus.subscriber_count(), before);
    assert!(!bus.is_registered(summary.subscriber_id));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_drains_session() {
    let bus = EventBus::new(16);
    let shutdown = Shutdown::new();
    let (mut rx, handle) = start(&bus, TableSet::all(), 16, shutdown.clone());
    rx.recv().await.unwrap();

    shutdown.trigger();
    let summary = handle.await.unwrap();
    assert_eq!(summary.close_reason, CloseReason::Shutdown);
    assert_eq!(summary.final_state, SessionState::Closed);
    assert_eq!(bus.subscriber_count(), 0);
    // The writer is gone, so the transport ends.
    assert!(rx.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_stalled_client_is_disconnected() {
    let bus = EventBus::new(16);
    // Room for the handshake only; the reader never drains it.
    let (_rx, handle) = start(&bus, "grades".parse().unwrap(), 1, Shutdown::new());
    tokio::task::yield_now().await;
    bus.publish(insert(TableName::Grades, 1));

    let started = Instant::now();
    let summary = handle.await.unwrap();
    assert_eq!(summary.close_reason, CloseReason::WriteStalled);
    assert_eq!(summary.final_state, SessionState::Closed);
    assert_eq!(summary.events_written, 0);
    assert!(started.elapsed() <= HEARTBEAT * 2);
    assert_eq!(bus.subscriber_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_external_unsubscribe_ends_session() {
    let bus = EventBus::new(16);
    let session = ClientSession::open(&bus, TableSet::all(), HEARTBEAT);
    let subscriber_id = session.subscriber_id();
    let (tx, mut rx) = mpsc::channel(16);
    let handle = tokio::spawn(session.run(tx, Shutdown::new()));
    rx.recv().await.unwrap();

    assert!(bus.unsubscribe(subscriber_id));
    let summary = handle.await.unwrap();
    assert_eq!(summary.close_reason, CloseReason::Unsubscribed);
}
