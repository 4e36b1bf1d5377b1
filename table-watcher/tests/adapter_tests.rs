use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use table_watcher::{
    AdapterConfig, ChangeError, ChangeEvent, ChangeFeed, ChangeOperation, ChangeSourceAdapter,
    FeedError, FeedState, FeedStream, RawChange, TableName,
};
use tokio::sync::mpsc;
use tokio::time::Instant;

type Notifications = mpsc::UnboundedSender<Result<RawChange, FeedError>>;

enum Attempt {
    Refuse,
    Accept(mpsc::UnboundedReceiver<Result<RawChange, FeedError>>),
}

#[derive(Clone, Default)]
struct ScriptedFeed {
    script: Arc<Mutex<VecDeque<Attempt>>>,
    attempts: Arc<Mutex<Vec<Instant>>>,
}

impl ScriptedFeed {
    fn refuse(&self) {
        self.script.lock().unwrap().push_back(Attempt::Refuse);
    }

    fn accept(&self) -> Notifications {
        let (tx, rx) = mpsc::unbounded_channel();
        self.script.lock().unwrap().push_back(Attempt::Accept(rx));
        tx
    }

    fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChangeFeed for ScriptedFeed {
    async fn subscribe(&self, _table: TableName) -> Result<FeedStream, FeedError> {
        self.attempts.lock().unwrap().push(Instant::now());
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Attempt::Refuse) => Err(FeedError::Connection("connection refused".into())),
            Some(Attempt::Accept(rx)) => Ok(futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed()),
            None => futures::future::pending().await,
        }
    }
}

fn student_update(id: i64) -> RawChange {
    RawChange {
        schema: Some("public".into()),
        table: Some("students".into()),
        operation: ChangeOperation::Update,
        record: json!({"id": id, "status": "graduated"}).as_object().cloned(),
        old_record: json!({"id": id, "status": "active"}).as_object().cloned(),
        commit_timestamp: None,
        truncated: false,
    }
}

fn fast_config() -> AdapterConfig {
    AdapterConfig {
        backoff_initial: Duration::from_secs(1),
        backoff_max: Duration::from_secs(30),
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn delivers_notifications_in_order_and_skips_bad_ones() {
    let feed = ScriptedFeed::default();
    let notifications = feed.accept();
    let adapter = ChangeSourceAdapter::new(feed, fast_config());

    let (tx, mut rx) = mpsc::unbounded_channel::<ChangeEvent>();
    assert!(adapter.start(TableName::Students, move |event| {
        let _ = tx.send(event);
    }));

    notifications.send(Ok(student_update(1))).unwrap();
    notifications
        .send(Err(FeedError::Payload(ChangeError::Malformed("truncated".into()))))
        .unwrap();
    let mut wrong_table = student_update(99);
    wrong_table.table = Some("courses".into());
    notifications.send(Ok(wrong_table)).unwrap();
    notifications.send(Ok(student_update(2))).unwrap();
    notifications.send(Ok(student_update(3))).unwrap();

    let mut ids = Vec::new();
    for _ in 0..3 {
        let event = rx.recv().await.unwrap();
        assert_eq!(event.table(), TableName::Students);
        ids.push(event.new_record().unwrap()["id"].as_i64().unwrap());
    }
    assert_eq!(ids, vec![1, 2, 3]);

    let status = adapter.status().get(TableName::Students).unwrap();
    assert_eq!(status.state, FeedState::Live);
    assert_eq!(status.events, 3);

    adapter.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn retries_with_exponential_backoff() {
    let feed = ScriptedFeed::default();
    feed.refuse();
    feed.refuse();
    feed.refuse();
    let _notifications = feed.accept();
    let observed = feed.clone();
    let adapter = ChangeSourceAdapter::new(feed, fast_config());

    adapter.start(TableName::Courses, |_| {});
    let board = adapter.status();
    wait_until(|| {
        board
            .get(TableName::Courses)
            .is_some_and(|s| s.state == FeedState::Live)
    })
    .await;

    let times = observed.attempt_times();
    assert_eq!(times.len(), 4);
    let gaps: Vec<u64> = times
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).as_secs())
        .collect();
    assert_eq!(gaps, vec![1, 2, 4]);
    assert_eq!(board.get(TableName::Courses).unwrap().reconnects, 1);

    adapter.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn resubscribes_after_feed_drops() {
    let feed = ScriptedFeed::default();
    let first = feed.accept();
    let second = feed.accept();
    let observed = feed.clone();
    let adapter = ChangeSourceAdapter::new(feed, fast_config());

    let (tx, mut rx) = mpsc::unbounded_channel::<ChangeEvent>();
    adapter.start(TableName::Students, move |event| {
        let _ = tx.send(event);
    });

    first.send(Ok(student_update(1))).unwrap();
    assert!(rx.recv().await.is_some());

    drop(first);
    second.send(Ok(student_update(2))).unwrap();
    let event = rx.recv().await.unwrap();
    assert_eq!(event.new_record().unwrap()["id"], 2);
    assert_eq!(observed.attempt_times().len(), 2);

    let status = adapter.status().get(TableName::Students).unwrap();
    assert_eq!(status.state, FeedState::Live);
    assert_eq!(status.reconnects, 1);

    adapter.stop_all().await;
}

#[tokio::test]
async fn no_callbacks_after_stop_returns() {
    let feed = ScriptedFeed::default();
    let notifications = feed.accept();
    let adapter = ChangeSourceAdapter::new(feed, fast_config());

    let (tx, mut rx) = mpsc::unbounded_channel::<ChangeEvent>();
    adapter.start(TableName::Grades, move |event| {
        let _ = tx.send(event);
    });

    let mut first = student_update(1);
    first.table = Some("grades".into());
    notifications.send(Ok(first)).unwrap();
    assert!(rx.recv().await.is_some());

    adapter.stop(TableName::Grades).await;
    adapter.stop(TableName::Grades).await;

    // The subscription stream was dropped with the task.
    assert!(notifications.is_closed());
    // The callback (and its sender) went away with the task.
    assert!(rx.recv().await.is_none());
    assert_eq!(
        adapter.status().get(TableName::Grades).unwrap().state,
        FeedState::Stopped
    );
    assert!(adapter.watched().is_empty());
}

#[tokio::test]
async fn stop_interrupts_pending_subscription() {
    let feed = ScriptedFeed::default();
    let adapter = ChangeSourceAdapter::new(feed, fast_config());

    adapter.start(TableName::Faculty, |_| {});
    assert!(!adapter.start(TableName::Faculty, |_| {}));
    tokio::time::sleep(Duration::from_millis(20)).await;

    tokio::time::timeout(Duration::from_secs(1), adapter.stop(TableName::Faculty))
        .await
        .expect("stop should not wait for the pending subscribe");
    assert_eq!(
        adapter.status().get(TableName::Faculty).unwrap().state,
        FeedState::Stopped
    );
}
