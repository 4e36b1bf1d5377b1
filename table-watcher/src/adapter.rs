use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::change::ChangeEvent;
use crate::feed::ChangeFeed;
use crate::status::{FeedState, FeedStatusBoard};
use crate::table::{TableName, TableSet};

#[derive(Debug, Clone, Copy)]
pub struct AdapterConfig {
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        }
    }
}

struct Subscription {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Keeps one native subscription per watched table and turns each native
/// notification into a [`ChangeEvent`].
///
/// Each table is served by its own task, so callbacks for one table never
/// run concurrently and arrive in the order the store emitted them. A lost
/// subscription is re-established with exponential backoff; nothing is
/// replayed for the gap.
pub struct ChangeSourceAdapter<F: ChangeFeed> {
    feed: Arc<F>,
    config: AdapterConfig,
    status: FeedStatusBoard,
    subscriptions: Mutex<HashMap<TableName, Subscription>>,
}

impl<F: ChangeFeed> ChangeSourceAdapter<F> {
    pub fn new(feed: F, config: AdapterConfig) -> Self {
        Self {
            feed: Arc::new(feed),
            config,
            status: FeedStatusBoard::new(),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Begins watching `table`. Returns `false` if it was already watched.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<C>(&self, table: TableName, on_event: C) -> bool
    where
        C: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        let mut subscriptions = self.lock();
        if subscriptions
            .get(&table)
            .is_some_and(|sub| !sub.task.is_finished())
        {
            debug!(table = %table, "change feed already running");
            return false;
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_subscription(
            Arc::clone(&self.feed),
            table,
            on_event,
            self.config,
            self.status.clone(),
            stop_rx,
        ));
        subscriptions.insert(
            table,
            Subscription {
                stop: stop_tx,
                task,
            },
        );
        true
    }

    /// Cancels the subscription for `table`. Once this returns no further
    /// callbacks for `table` will run. Stopping an unwatched table is a no-op.
    pub async fn stop(&self, table: TableName) {
        let subscription = self.lock().remove(&table);
        if let Some(subscription) = subscription {
            shutdown(table, subscription).await;
        }
    }

    pub async fn stop_all(&self) {
        let drained: Vec<(TableName, Subscription)> = self.lock().drain().collect();
        for (table, subscription) in drained {
            shutdown(table, subscription).await;
        }
    }

    pub fn watched(&self) -> TableSet {
        self.lock().keys().copied().collect()
    }

    pub fn status(&self) -> FeedStatusBoard {
        self.status.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TableName, Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

async fn shutdown(table: TableName, subscription: Subscription) {
    let _ = subscription.stop.send(());
    if let Err(err) = subscription.task.await {
        warn!(table = %table, error = %err, "change feed task ended abnormally");
    }
}

async fn run_subscription<F, C>(
    feed: Arc<F>,
    table: TableName,
    on_event: C,
    config: AdapterConfig,
    status: FeedStatusBoard,
    mut stop: oneshot::Receiver<()>,
) where
    F: ChangeFeed,
    C: Fn(ChangeEvent) + Send + Sync + 'static,
{
    let mut backoff = Backoff::new(config.backoff_initial, config.backoff_max);
    status.set_state(table, FeedState::Connecting);

    'subscribe: loop {
        let subscribed = tokio::select! {
            biased;
            _ = &mut stop => break 'subscribe,
            result = feed.subscribe(table) => result,
        };

        match subscribed {
            Ok(mut notifications) => {
                backoff.reset();
                status.set_state(table, FeedState::Live);
                info!(table = %table, "change feed live");

                loop {
                    let next = tokio::select! {
                        biased;
                        _ = &mut stop => break 'subscribe,
                        next = notifications.next() => next,
                    };
                    match next {
                        Some(Ok(raw)) => match ChangeEvent::from_raw(table, raw, Utc::now()) {
                            Ok(event) => {
                                status.record_event(table);
                                on_event(event);
                            }
                            Err(err) => {
                                warn!(table = %table, error = %err, "skipping change notification");
                            }
                        },
                        Some(Err(err)) if !err.is_fatal() => {
                            warn!(table = %table, error = %err, "skipping change notification");
                        }
                        Some(Err(err)) => {
                            warn!(table = %table, error = %err, "change feed lost");
                            break;
                        }
                        None => {
                            warn!(table = %table, "change feed ended");
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                warn!(table = %table, error = %err, "failed to subscribe to change feed");
            }
        }

        status.set_state(table, FeedState::Reconnecting);
        let delay = backoff.next_delay();
        debug!(table = %table, delay_ms = delay.as_millis() as u64, "retrying change feed");
        tokio::select! {
            biased;
            _ = &mut stop => break 'subscribe,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    status.set_state(table, FeedState::Stopped);
    debug!(table = %table, "change feed stopped");
}
