pub use alert::{AlertOutcome, AlertSound, BellPlayer, SilentPlayer, SoundPlayer, Tone};
pub use store::{
    Notification, NotificationKind, NotificationRule, NotificationSink, NotificationStore,
    StoreEvent, NEW_ORDER_TITLE,
};
pub use telegram::{format_order_message, TelegramNotifier};

pub mod alert;
pub mod store;
pub mod telegram;
