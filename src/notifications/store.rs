use std::sync::mpsc::Receiver;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::feed::filter::value_text;
use crate::feed::{ChangeEvent, Operation, Row, RowFilter};
use crate::notifier::Notifier;

pub const NEW_ORDER_TITLE: &str = "New order!";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Order,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Notification {
    /// Identity of the row that triggered it.
    pub id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub read: bool,
    /// When the notification was created locally, not when the row was.
    pub timestamp: DateTime<Utc>,
    /// The triggering row, for navigating to it.
    pub source: Row,
}

impl Notification {
    /// Builds the new-order notification for an `orders` row. Rows without
    /// an id can't be deduplicated and yield nothing.
    pub fn for_order(row: &Row) -> Option<Self> {
        let id = row.get("id").and_then(value_text)?;
        let customer = row
            .get("customer_name")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .unwrap_or("Unknown customer");
        let total = row
            .get("total")
            .and_then(value_text)
            .unwrap_or_else(|| "0".to_string());
        Some(Self {
            id,
            kind: NotificationKind::Order,
            title: NEW_ORDER_TITLE.to_string(),
            message: format!("{} - {}", customer, total),
            read: false,
            timestamp: Utc::now(),
            source: row.clone(),
        })
    }
}

/// Which change events turn into notifications.
#[derive(Clone, Debug, PartialEq)]
pub struct NotificationRule {
    pub table: String,
    pub operation: Operation,
    pub filter: Option<RowFilter>,
}

impl NotificationRule {
    /// Orders placed through the storefront.
    pub fn website_orders() -> Self {
        Self {
            table: "orders".to_string(),
            operation: Operation::Insert,
            filter: Some(RowFilter {
                column: "source".to_string(),
                value: "website".to_string(),
            }),
        }
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if event.table != self.table || !self.operation.accepts(event.operation) {
            return false;
        }
        match (&self.filter, event.new_row.as_ref()) {
            (None, Some(_)) => true,
            (Some(filter), Some(row)) => filter.matches(row),
            (_, None) => false,
        }
    }
}

/// Side effects of a new notification, such as a sound or a bot message.
/// Failures are the sink's to log; they never reach the store.
pub trait NotificationSink {
    fn on_notification(&mut self, notification: &Notification);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreEvent {
    Added(String),
    Read(String),
    AllRead,
    Cleared(String),
}

/// The session's notifications, most recent first. The unread count is
/// always computed from the list.
pub struct NotificationStore {
    rule: NotificationRule,
    items: Vec<Notification>,
    sinks: Vec<Box<dyn NotificationSink>>,
    changes: Notifier<StoreEvent>,
}

impl NotificationStore {
    pub fn new(rule: NotificationRule) -> Self {
        Self {
            rule,
            items: Vec::new(),
            sinks: Vec::new(),
            changes: Notifier::new(),
        }
    }

    pub fn with_sink(mut self, sink: impl NotificationSink + 'static) -> Self {
        self.add_sink(sink);
        self
    }

    pub fn add_sink(&mut self, sink: impl NotificationSink + 'static) {
        self.sinks.push(Box::new(sink));
    }

    pub fn rule(&self) -> &NotificationRule {
        &self.rule
    }

    /// Turns a qualifying event into a notification at the head of the list.
    /// Events for a row already in the list are ignored, so redelivery is
    /// harmless.
    pub fn on_change_event(&mut self, event: &ChangeEvent) -> Option<&Notification> {
        if !self.rule.matches(event) {
            return None;
        }
        let row = event.new_row.as_ref()?;
        let Some(notification) = Notification::for_order(row) else {
            log::warn!("Ignoring '{}' row without an id", event.table);
            return None;
        };
        if self.items.iter().any(|n| n.id == notification.id) {
            log::debug!("Duplicate delivery for {}, ignored", notification.id);
            return None;
        }

        log::info!("New notification {}: {}", notification.id, notification.message);
        for sink in &mut self.sinks {
            sink.on_notification(&notification);
        }
        self.changes.notify(StoreEvent::Added(notification.id.clone()));
        self.items.insert(0, notification);
        self.items.first()
    }

    /// Returns true if the notification went from unread to read.
    pub fn mark_as_read(&mut self, id: &str) -> bool {
        let Some(notification) = self.items.iter_mut().find(|n| n.id == id && !n.read) else {
            return false;
        };
        notification.read = true;
        self.changes.notify(StoreEvent::Read(id.to_string()));
        true
    }

    /// Returns how many notifications changed.
    pub fn mark_all_as_read(&mut self) -> usize {
        let mut changed = 0;
        for notification in self.items.iter_mut().filter(|n| !n.read) {
            notification.read = true;
            changed += 1;
        }
        if changed > 0 {
            self.changes.notify(StoreEvent::AllRead);
        }
        changed
    }

    pub fn clear(&mut self, id: &str) -> Option<Notification> {
        let index = self.items.iter().position(|n| n.id == id)?;
        let removed = self.items.remove(index);
        self.changes.notify(StoreEvent::Cleared(id.to_string()));
        Some(removed)
    }

    pub fn notifications(&self) -> &[Notification] {
        &self.items
    }

    pub fn get(&self, id: &str) -> Option<&Notification> {
        self.items.iter().find(|n| n.id == id)
    }

    pub fn unread_count(&self) -> usize {
        self.items.iter().filter(|n| !n.read).count()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Receives a `StoreEvent` after every change to the list.
    pub fn observer(&self) -> Receiver<StoreEvent> {
        self.changes.observer()
    }
}

impl Default for NotificationStore {
    fn default() -> Self {
        Self::new(NotificationRule::website_orders())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn website_order(id: &str, customer: &str, total: i64) -> ChangeEvent {
        ChangeEvent::insert(
            "orders",
            json!({"id": id, "customer_name": customer, "total": total, "source": "website"})
                .as_object()
                .cloned()
                .unwrap(),
        )
    }

    fn assert_consistent(store: &NotificationStore) {
        let unread = store.notifications().iter().filter(|n| !n.read).count();
        assert_eq!(store.unread_count(), unread);
    }

    struct CountingSink(Rc<RefCell<Vec<String>>>);

    impl NotificationSink for CountingSink {
        fn on_notification(&mut self, notification: &Notification) {
            self.0.borrow_mut().push(notification.id.clone());
        }
    }

    #[test]
    fn website_order_becomes_notification() {
        let mut store = NotificationStore::default();
        let created = store
            .on_change_event(&website_order("abc123", "Aziz", 150000))
            .cloned()
            .expect("notification");

        assert!(created.title.contains("New order"));
        assert!(created.message.contains("Aziz"));
        assert!(created.message.contains("150000"));
        assert!(!created.read);
        assert_eq!(created.source["id"], "abc123");
        assert_eq!(store.len(), 1);
        assert_eq!(store.unread_count(), 1);
    }

    #[test]
    fn duplicate_delivery_is_ignored() {
        let sounds = Rc::new(RefCell::new(Vec::new()));
        let mut store = NotificationStore::default().with_sink(CountingSink(sounds.clone()));
        let event = website_order("abc123", "Aziz", 150000);

        assert!(store.on_change_event(&event).is_some());
        assert!(store.on_change_event(&event).is_none());
        assert_eq!(store.len(), 1);
        assert_eq!(store.unread_count(), 1);
        assert_eq!(*sounds.borrow(), vec!["abc123"]);
    }

    #[test]
    fn newest_first() {
        let mut store = NotificationStore::default();
        store.on_change_event(&website_order("1", "Aziz", 100));
        store.on_change_event(&website_order("2", "Dilnoza", 200));

        let ids: Vec<&str> = store.notifications().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "1"]);
        assert_eq!(store.unread_count(), 2);
    }

    #[test]
    fn ignores_events_outside_the_rule() {
        let mut store = NotificationStore::default();
        let admin = ChangeEvent::insert(
            "orders",
            json!({"id": "x", "source": "admin"}).as_object().cloned().unwrap(),
        );
        let update = ChangeEvent::update(
            "orders",
            json!({"id": "y"}).as_object().cloned().unwrap(),
            json!({"id": "y", "source": "website"}).as_object().cloned().unwrap(),
        );
        let no_id = ChangeEvent::insert(
            "orders",
            json!({"source": "website"}).as_object().cloned().unwrap(),
        );
        assert!(store.on_change_event(&admin).is_none());
        assert!(store.on_change_event(&update).is_none());
        assert!(store.on_change_event(&no_id).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn mark_as_read_is_idempotent() {
        let mut store = NotificationStore::default();
        store.on_change_event(&website_order("1", "Aziz", 100));
        store.on_change_event(&website_order("2", "Aziz", 100));

        assert!(store.mark_as_read("1"));
        assert!(!store.mark_as_read("1"));
        assert!(!store.mark_as_read("missing"));
        assert_eq!(store.unread_count(), 1);
        assert_consistent(&store);
    }

    #[test]
    fn mark_all_then_more_reads_stays_at_zero() {
        let mut store = NotificationStore::default();
        for id in ["1", "2", "3"] {
            store.on_change_event(&website_order(id, "Aziz", 100));
        }
        assert_eq!(store.mark_all_as_read(), 3);
        assert_eq!(store.mark_all_as_read(), 0);
        for id in ["1", "2", "3", "1"] {
            store.mark_as_read(id);
        }
        assert_eq!(store.unread_count(), 0);
        assert_consistent(&store);
    }

    #[test]
    fn clear_only_counts_unread() {
        let mut store = NotificationStore::default();
        store.on_change_event(&website_order("1", "Aziz", 100));
        store.on_change_event(&website_order("2", "Aziz", 100));
        store.mark_as_read("2");
        assert_eq!(store.unread_count(), 1);

        assert!(store.clear("2").is_some());
        assert_eq!(store.unread_count(), 1);
        assert!(store.clear("1").is_some());
        assert_eq!(store.unread_count(), 0);
        assert!(store.clear("1").is_none());
        assert_eq!(store.unread_count(), 0);
        assert_consistent(&store);
    }

    #[test]
    fn unread_count_tracks_arbitrary_sequences() {
        let mut store = NotificationStore::default();
        let steps: Vec<(&str, &str)> = vec![
            ("add", "1"), ("add", "2"), ("read", "1"), ("add", "1"), ("clear", "2"),
            ("add", "3"), ("read", "3"), ("read", "3"), ("all", ""), ("add", "4"),
            ("clear", "4"), ("clear", "4"), ("add", "2"), ("read", "9"),
        ];
        for (op, id) in steps {
            match op {
                "add" => {
                    store.on_change_event(&website_order(id, "Aziz", 1));
                }
                "read" => {
                    store.mark_as_read(id);
                }
                "clear" => {
                    store.clear(id);
                }
                _ => {
                    store.mark_all_as_read();
                }
            }
            assert_consistent(&store);
        }
        assert_eq!(store.unread_count(), 1);
    }

    #[test]
    fn observers_see_each_change() {
        let mut store = NotificationStore::default();
        let events = store.observer();
        store.on_change_event(&website_order("1", "Aziz", 100));
        store.mark_as_read("1");
        store.clear("1");

        let seen: Vec<StoreEvent> = events.try_iter().collect();
        assert_eq!(
            seen,
            vec![
                StoreEvent::Added("1".to_string()),
                StoreEvent::Read("1".to_string()),
                StoreEvent::Cleared("1".to_string()),
            ]
        );
    }
}
