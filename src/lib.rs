// ABOUTME: Library root for campus-relay
// ABOUTME: Event bus, client sessions and the HTTP stream endpoint fed by table-watcher

pub mod auth;
pub mod bus;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod session;
pub mod shutdown;

pub use auth::{Authenticator, Principal, StaticTokenAuthenticator};
pub use bus::{EventBus, PublishOutcome, Registration, Subscriber, SubscriberId};
pub use config::RelayConfig;
pub use endpoint::{router, AppState};
pub use error::{AuthError, StreamError};
pub use session::{ClientSession, CloseReason, FrameSink, SessionState, SessionSummary};
pub use shutdown::Shutdown;
