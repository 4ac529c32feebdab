use thiserror::Error;

/// Errors a caller of the change feed is expected to tell apart. They travel
/// inside `anyhow::Error`; use `downcast_ref::<FeedError>()` to match on them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("channel '{0}' is already subscribed")]
    DuplicateChannel(String),

    #[error("table '{0}' is not known to the backend")]
    UnknownTable(String),

    #[error("invalid row filter '{0}', expected column=eq.value")]
    InvalidFilter(String),

    #[error("malformed change event: {0}")]
    MalformedEvent(String),
}
