use std::{
    sync::{
        mpsc::{channel, Receiver, Sender},
        Arc, RwLock,
    },
    thread::{self, JoinHandle},
};

/// Fans a cloneable event out to every live observer. Clones share the same
/// observer list. Receivers that have been dropped are pruned the next time
/// something is published.
#[derive(Clone)]
pub struct Notifier<Event: Send + Clone + 'static> {
    senders: Arc<RwLock<Vec<Sender<Event>>>>,
}

impl<Event: Send + Clone + 'static> Default for Notifier<Event> {
    fn default() -> Self {
        Self {
            senders: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

impl<Event: Send + Clone + 'static> Notifier<Event> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers `event` to every observer, returning how many received it.
    pub fn notify(&self, event: Event) -> usize {
        match self.senders.write() {
            Ok(mut senders) => {
                senders.retain(|tx| tx.send(event.clone()).is_ok());
                senders.len()
            }
            Err(_) => {
                log::error!("Notifier lock poisoned, dropping event");
                0
            }
        }
    }

    pub fn observer(&self) -> Receiver<Event> {
        let (tx, rx) = channel();
        match self.senders.write() {
            Ok(mut senders) => senders.push(tx),
            Err(_) => log::error!("Notifier lock poisoned, observer will never receive"),
        }
        rx
    }

    /// Runs `callback` for every event on a dedicated thread. The thread ends
    /// once every clone of this notifier has been dropped.
    pub fn observe(&self, mut callback: impl FnMut(Event) + Send + 'static) -> JoinHandle<()> {
        let rx = self.observer();
        thread::spawn(move || {
            for event in rx.iter() {
                callback(event);
            }
        })
    }

    pub fn observer_count(&self) -> usize {
        self.senders.read().map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::Notifier;
    use crate::feed::ChangeEvent;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn order(id: &str) -> ChangeEvent {
        ChangeEvent::insert("orders", json!({"id": id}).as_object().unwrap().clone())
    }

    #[test]
    fn delivers_to_every_observer() {
        let notifier = Notifier::<ChangeEvent>::new();
        let rx1 = notifier.observer();
        let rx2 = notifier.observer();

        assert_eq!(notifier.notify(order("a1")), 2);

        let first = rx1.recv_timeout(Duration::from_millis(100)).unwrap();
        let second = rx2.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(first.row_id().as_deref(), Some("a1"));
        assert_eq!(second.row_id().as_deref(), Some("a1"));
    }

    #[test]
    fn prunes_dropped_observers() {
        let notifier = Notifier::<ChangeEvent>::new();
        {
            let _gone = notifier.observer();
        }
        let live = notifier.observer();
        assert_eq!(notifier.observer_count(), 2);

        assert_eq!(notifier.notify(order("b2")), 1);
        assert_eq!(notifier.observer_count(), 1);
        assert!(live.recv_timeout(Duration::from_millis(100)).is_ok());
    }

    #[test]
    fn observe_preserves_publish_order() {
        let notifier = Notifier::<ChangeEvent>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let handle = notifier.observe(move |event| {
            seen_clone.lock().unwrap().push(event.row_id().unwrap_or_default());
        });

        notifier.notify(order("1"));
        notifier.notify(order("2"));
        notifier.notify(order("3"));
        drop(notifier);
        handle.join().unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["1", "2", "3"]);
    }

    #[test]
    fn notify_without_observers_is_harmless() {
        let notifier = Notifier::<String>::new();
        assert_eq!(notifier.notify("nobody".to_string()), 0);
    }
}
