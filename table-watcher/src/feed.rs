use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_postgres::tls::{MakeTlsConnect, TlsConnect};
use tokio_postgres::{AsyncMessage, NoTls, Socket};
use tracing::debug;

use crate::change::{ChangeError, RawChange};
use crate::sql::{channel_name, quote_ident};
use crate::table::TableName;

const NOTIFICATION_BUFFER: usize = 1024;

#[derive(Debug, Error)]
pub enum FeedError {
    /// The subscription is gone and must be re-established.
    #[error("feed connection failed: {0}")]
    Connection(String),
    /// A single notification could not be understood.
    #[error(transparent)]
    Payload(#[from] ChangeError),
}

impl FeedError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, FeedError::Connection(_))
    }
}

/// Live notifications for one table. The stream ending means the
/// subscription was lost.
pub type FeedStream = BoxStream<'static, Result<RawChange, FeedError>>;

/// A store-native row-change subscription API.
#[async_trait]
pub trait ChangeFeed: Send + Sync + 'static {
    async fn subscribe(&self, table: TableName) -> Result<FeedStream, FeedError>;
}

/// PostgreSQL `LISTEN/NOTIFY` feed. One dedicated connection per table.
#[derive(Debug, Clone)]
pub struct PgNotifyFeed {
    database_url: String,
    channel_prefix: String,
    tls: bool,
}

impl PgNotifyFeed {
    pub fn new(database_url: impl Into<String>, channel_prefix: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            channel_prefix: channel_prefix.into(),
            tls: false,
        }
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn channel_for(&self, table: TableName) -> String {
        channel_name(&self.channel_prefix, table)
    }
}

#[async_trait]
impl ChangeFeed for PgNotifyFeed {
    async fn subscribe(&self, table: TableName) -> Result<FeedStream, FeedError> {
        let channel = self.channel_for(table);
        if self.tls {
            let connector = TlsConnector::builder()
                .build()
                .map_err(|err| FeedError::Connection(format!("failed to build TLS connector: {err}")))?;
            listen(&self.database_url, MakeTlsConnector::new(connector), &channel).await
        } else {
            listen(&self.database_url, NoTls, &channel).await
        }
    }
}

async fn listen<T>(database_url: &str, tls: T, channel: &str) -> Result<FeedStream, FeedError>
where
    T: MakeTlsConnect<Socket> + Send + 'static,
    T::Stream: Send + 'static,
    T::TlsConnect: Send,
    <T::TlsConnect as TlsConnect<Socket>>::Future: Send,
{
    let (client, mut connection) = tokio_postgres::connect(database_url, tls)
        .await
        .map_err(|err| FeedError::Connection(err.to_string()))?;

    let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
    let listen_channel = channel.to_string();
    tokio::spawn(async move {
        let mut messages = stream::poll_fn(move |cx| connection.poll_message(cx));
        while let Some(message) = messages.next().await {
            match message {
                Ok(AsyncMessage::Notification(note)) => {
                    if tx.send(Ok(note.payload().to_string())).await.is_err() {
                        break;
                    }
                }
                Ok(AsyncMessage::Notice(notice)) => {
                    debug!(channel = %listen_channel, notice = %notice.message(), "postgres notice");
                }
                Ok(_) => {}
                Err(err) => {
                    let _ = tx.send(Err(FeedError::Connection(err.to_string()))).await;
                    break;
                }
            }
        }
        debug!(channel = %listen_channel, "notification connection closed");
    });

    client
        .batch_execute(&format!("LISTEN {}", quote_ident(channel)))
        .await
        .map_err(|err| FeedError::Connection(format!("LISTEN {channel} failed: {err}")))?;

    // The client lives inside the stream; dropping the stream closes the connection.
    let notifications = stream::unfold((rx, client), |(mut rx, client)| async move {
        let item = rx.recv().await?;
        let change = item.and_then(|payload| RawChange::parse(&payload).map_err(FeedError::from));
        Some((change, (rx, client)))
    });
    Ok(notifications.boxed())
}
