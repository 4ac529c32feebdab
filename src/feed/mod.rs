pub use filter::RowFilter;
pub use memory_transport::MemoryTransport;
pub use subscriber::{ChangeFeed, SubscriptionHandle};
pub use transport::{Transport, TransportEvent};
pub use types::*;

pub mod filter;
pub mod memory_transport;
pub mod subscriber;
pub mod transport;
pub mod types;
