// Cziczere Sync Engine: real-time session runtime
// One WebSocket channel, two push-feed subscriptions and a handful of
// one-shot HTTP calls, all folded into a single observable state store.

pub mod api;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod credentials;
pub mod feed;
pub mod optimistic;
pub mod session;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use api::HttpApi;
pub use config::SyncConfig;
pub use connection::{ConnectionManager, ConnectionSettings, TungsteniteConnector};
pub use correlator::MessageCorrelator;
pub use credentials::StaticCredentials;
pub use feed::{PushFeedMultiplexer, SseDocumentFeed};
pub use optimistic::OptimisticTracker;
pub use session::SyncSession;
pub use store::{Action, ApplicationSnapshot, StateStore};
