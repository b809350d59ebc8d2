pub mod app;
pub mod config;
pub mod counter;
pub mod document;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod state;
pub mod stats;
pub mod storage;

pub use app::router;
pub use config::Config;
pub use counter::{CounterStore, Subscription, SubscriptionHandle};
pub use document::{DocumentStore, StoreError};
pub use models::{CounterField, DailyStats};
pub use state::AppState;
pub use stats::{aggregate, MemberRecord, TeamStats};
pub use storage::LocalDocumentStore;
