pub mod config;
pub mod data;
pub mod error;
pub mod feed;
pub mod notifications;
pub mod notifier;
pub mod realtime;
pub mod session;
pub mod views;

pub use config::Config;
pub use data::{DataAccess, Query, RestClient, SqliteBackend};
pub use error::FeedError;
pub use feed::{ChangeEvent, ChangeFeed, MemoryTransport, Operation, SubscriptionHandle};
pub use notifications::{Notification, NotificationStore};
pub use session::{AdminSession, MountedView};
pub use rusqlite_migration;
