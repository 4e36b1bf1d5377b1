// ABOUTME: Client session lifecycle for one open stream
// ABOUTME: Single writer loop draining the subscriber inbox and emitting heartbeats

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use table_watcher::TableSet;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

use crate::bus::{EventBus, Registration, Subscriber, SubscriberId};
use crate::frame::{EncodedFrame, Frame, CONNECTION_ESTABLISHED, HEARTBEAT};
use crate::shutdown::Shutdown;

/// Heartbeat interval used when none is configured.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// Lifecycle of a [`ClientSession`]. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Registered on the bus, handshake not yet written.
    Connecting,
    /// Handshake written; relaying events and heartbeats.
    Streaming,
    /// Loop has ended; releasing the bus registration.
    Draining,
    /// Unregistered. Nothing more is written.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client went away while the session was idle.
    ClientGone,
    /// A write failed because the transport was closed.
    WriteFailed,
    /// A write did not complete within one heartbeat interval.
    WriteStalled,
    Shutdown,
    /// The subscriber was removed from the bus from outside the session.
    Unsubscribed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("client transport closed")]
pub struct TransportClosed;

/// Outbound half of a client transport. Only the session's writer loop
/// writes to it.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: EncodedFrame) -> Result<(), TransportClosed>;

    /// Resolves once the client side of the transport is gone.
    async fn closed(&self);
}

#[async_trait]
impl FrameSink for mpsc::Sender<EncodedFrame> {
    async fn send(&mut self, frame: EncodedFrame) -> Result<(), TransportClosed> {
        mpsc::Sender::send(self, frame)
            .await
            .map_err(|_| TransportClosed)
    }

    async fn closed(&self) {
        mpsc::Sender::closed(self).await
    }
}

/// What a finished session did, returned by [`ClientSession::run`].
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub subscriber_id: SubscriberId,
    pub frames_written: u64,
    pub events_written: u64,
    pub heartbeats_written: u64,
    /// Events the bus dropped because this session's inbox was full
    pub dropped: u64,
    pub close_reason: CloseReason,
    /// Always `Closed`: the bus registration is gone by the time this is built.
    pub final_state: SessionState,
}

/// One open stream: a registered subscriber plus the writer loop state.
///
/// `run` consumes the session, so a closed session cannot be reused.
pub struct ClientSession {
    id: Uuid,
    subscriber: Subscriber,
    registration: Registration,
    heartbeat_interval: Duration,
    state: SessionState,
    seq: u64,
    events_written: u64,
    heartbeats_written: u64,
}

impl ClientSession {
    /// Registers a subscriber for `tables` and returns the session in `Connecting`.
    ///
    /// Events published after this returns are queued for the session, even
    /// before [`ClientSession::run`] has written the handshake.
    ///
    /// # Arguments
    ///
    /// * `bus` - Bus to subscribe on
    /// * `tables` - Already resolved filter (watched, granted and requested)
    /// * `heartbeat_interval` - Idle time before a heartbeat is sent; also the
    ///   longest a single write may take
    ///
    /// # Examples
    ///
    /// ```
    /// # use std::time::Duration;
    /// # use campus_relay::{ClientSession, EventBus, SessionState};
    /// # use table_watcher::TableSet;
    /// let bus = EventBus::new(32);
    /// let session = ClientSession::open(&bus, TableSet::all(), Duration::from_secs(25));
    /// assert_eq!(session.state(), SessionState::Connecting);
    /// assert!(bus.is_registered(session.subscriber_id()));
    ///
    /// // Dropping an unstarted session still unregisters it.
    /// drop(session);
    /// assert_eq!(bus.subscriber_count(), 0);
    /// ```
    pub fn open(bus: &Arc<EventBus>, tables: TableSet, heartbeat_interval: Duration) -> Self {
        let (subscriber, registration) = bus.register(tables);
        let id = Uuid::new_v4();
        tracing::debug!(
            session_id = %id,
            subscriber = subscriber.id(),
            tables = %tables,
            "stream session opened"
        );
        Self {
            id,
            subscriber,
            registration,
            heartbeat_interval,
            state: SessionState::Connecting,
            seq: 0,
            events_written: 0,
            heartbeats_written: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn subscriber_id(&self) -> SubscriberId {
        self.subscriber.id()
    }

    pub fn tables(&self) -> TableSet {
        self.subscriber.filter()
    }

    /// Current state. Only `Connecting` is observable from outside, since
    /// [`ClientSession::run`] consumes the session; its outcome is reported
    /// through [`SessionSummary::final_state`].
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Runs the writer loop until the client leaves, a write fails, or
    /// shutdown is signalled, then unregisters from the bus.
    ///
    /// The `connection_established` frame is always the first write. After
    /// that each inbox event becomes one frame, in inbox order, and a
    /// heartbeat is written whenever nothing arrives for one heartbeat
    /// interval.
    ///
    /// # Returns
    ///
    /// A [`SessionSummary`] with the close reason and frame counts. The
    /// subscriber is already unregistered when it is returned.
    pub async fn run<S: FrameSink>(mut self, mut sink: S, shutdown: Shutdown) -> SessionSummary {
        let established =
            Frame::connection_established(self.id, self.tables(), self.heartbeat_interval);
        let reason = match self.write(&mut sink, established).await {
            Ok(()) => {
                self.transition(SessionState::Streaming);
                self.stream(&mut sink, &shutdown).await
            }
            Err(reason) => reason,
        };

        self.transition(SessionState::Draining);
        self.registration.release();
        self.transition(SessionState::Closed);

        let summary = SessionSummary {
            session_id: self.id,
            subscriber_id: self.subscriber.id(),
            frames_written: self.seq,
            events_written: self.events_written,
            heartbeats_written: self.heartbeats_written,
            dropped: self.subscriber.dropped(),
            close_reason: reason,
            final_state: self.state,
        };
        tracing::info!(
            session_id = %summary.session_id,
            reason = ?summary.close_reason,
            frames = summary.frames_written,
            events = summary.events_written,
            heartbeats = summary.heartbeats_written,
            dropped = summary.dropped,
            "stream session closed"
        );
        summary
    }

    async fn stream<S: FrameSink>(&mut self, sink: &mut S, shutdown: &Shutdown) -> CloseReason {
        let heartbeat_interval = self.heartbeat_interval;
        loop {
            let frame = tokio::select! {
                biased;

                _ = shutdown.wait() => return CloseReason::Shutdown,
                _ = sink.closed() => return CloseReason::ClientGone,
                next = timeout(heartbeat_interval, self.subscriber.recv()) => match next {
                    Ok(Some(event)) => match Frame::change(&event) {
                        Ok(frame) => frame,
                        Err(e) => {
                            tracing::error!(session_id = %self.id, "Failed to serialize change event: {}", e);
                            continue;
                        }
                    },
                    Ok(None) => return CloseReason::Unsubscribed,
                    Err(_) => Frame::heartbeat(),
                },
            };

            if let Err(reason) = self.write(sink, frame).await {
                return reason;
            }
        }
    }

    async fn write<S: FrameSink>(&mut self, sink: &mut S, frame: Frame) -> Result<(), CloseReason> {
        let encoded = match frame.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                // Don't end the stream over one bad frame
                tracing::error!(session_id = %self.id, "Failed to serialize frame: {}", e);
                return Ok(());
            }
        };

        match timeout(self.heartbeat_interval, sink.send(encoded)).await {
            Ok(Ok(())) => {
                self.seq += 1;
                match frame.kind.as_str() {
                    HEARTBEAT => self.heartbeats_written += 1,
                    CONNECTION_ESTABLISHED => {}
                    _ => self.events_written += 1,
                }
                tracing::trace!(session_id = %self.id, seq = self.seq, kind = %frame.kind, "frame written");
                Ok(())
            }
            Ok(Err(TransportClosed)) => Err(CloseReason::WriteFailed),
            Err(_) => {
                tracing::warn!(session_id = %self.id, "client write stalled, closing stream");
                Err(CloseReason::WriteStalled)
            }
        }
    }

    fn transition(&mut self, next: SessionState) {
        tracing::debug!(session_id = %self.id, from = ?self.state, to = ?next, "session state");
        self.state = next;
    }
}
