pub use dashboard::{DailyTotals, DashboardLoader, DashboardStats};
pub use messages::{MessageStatus, MessagesLoader, MessagesModel, CONTACT_MESSAGES};
pub use orders::{OrderStatus, OrdersLoader, OrdersModel, StatusCounts};
pub use patch::{PatchOutcome, PatchView};
pub use reload::{Loader, ReloadView, ResolvePolicy};

pub mod dashboard;
pub mod messages;
pub mod orders;
pub mod patch;
pub mod reload;

/// Tells a screen its view model changed and should be redrawn.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ViewEvent {
    /// A reload was applied; carries its generation.
    Reloaded(u64),
    /// A reload finished but a newer result was already displayed.
    Discarded(u64),
    LoadFailed(u64),
    RowChanged(String),
    RowRemoved(String),
}
