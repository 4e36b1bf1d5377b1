pub mod adapter;
pub mod backoff;
pub mod change;
pub mod feed;
pub mod sql;
pub mod status;
pub mod table;

pub use adapter::{AdapterConfig, ChangeSourceAdapter};
pub use backoff::Backoff;
pub use change::{ChangeError, ChangeEvent, ChangeOperation, RawChange};
pub use feed::{ChangeFeed, FeedError, FeedStream, PgNotifyFeed};
pub use status::{FeedState, FeedStatus, FeedStatusBoard};
pub use table::{TableName, TableSet, UnknownTable};
