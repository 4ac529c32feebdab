use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError};
use std::time::Duration;

use anyhow::Result;

use crate::error::FeedError;
use crate::feed::filter::RowFilter;
use crate::feed::transport::{Transport, TransportEvent};
use crate::feed::{ChangeEvent, ChannelSpec, Operation, SubscriptionState};

type Callback = Box<dyn FnMut(&ChangeEvent)>;

struct Subscription {
    id: u64,
    spec: ChannelSpec,
    state: SubscriptionState,
    /// Taken out while the callback runs so it may unsubscribe itself.
    callback: Option<Callback>,
}

struct FeedInner {
    transport: Box<dyn Transport>,
    subscriptions: HashMap<String, Subscription>,
    known_tables: HashSet<String>,
    next_id: u64,
}

impl FeedInner {
    /// Detaches subscription `id` from `channel` and hands it back. The
    /// caller drops it once the feed is no longer borrowed, since its callback
    /// may own other handles.
    fn remove(&mut self, channel: &str, id: u64) -> Option<Subscription> {
        let matches = self
            .subscriptions
            .get(channel)
            .is_some_and(|sub| sub.id == id);
        if !matches {
            return None;
        }
        let removed = self.subscriptions.remove(channel);
        if let Err(e) = self.transport.leave(channel) {
            log::warn!("Failed to leave channel '{}': {}", channel, e);
        }
        log::info!("Unsubscribed from channel '{}'", channel);
        removed
    }
}

/// Subscribes callbacks to named channels of the backend's change feed and
/// delivers events to them, in the order the transport reported them, from
/// `pump`. Everything runs on the thread that owns the feed; only the
/// transport may do its work elsewhere.
pub struct ChangeFeed {
    inner: Rc<RefCell<FeedInner>>,
    events: Receiver<TransportEvent>,
}

impl ChangeFeed {
    pub fn new(mut transport: impl Transport + 'static) -> Result<Self> {
        let (tx, rx) = channel();
        transport.open(tx)?;
        Ok(Self {
            inner: Rc::new(RefCell::new(FeedInner {
                transport: Box::new(transport),
                subscriptions: HashMap::new(),
                known_tables: HashSet::new(),
                next_id: 1,
            })),
            events: rx,
        })
    }

    /// Restricts subscriptions to these tables. With no known tables every
    /// name is accepted.
    pub fn with_known_tables<I, S>(self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.borrow_mut().known_tables = tables.into_iter().map(Into::into).collect();
        self
    }

    /// Opens `channel` for `operation` events on `table`, optionally narrowed
    /// by `row_filter` (`column=eq.value`). The subscription starts pending
    /// and becomes active once the transport confirms it. A channel name can
    /// only be used by one open subscription at a time.
    pub fn subscribe(
        &self,
        channel: &str,
        table: &str,
        operation: Operation,
        row_filter: Option<&str>,
        callback: impl FnMut(&ChangeEvent) + 'static,
    ) -> Result<SubscriptionHandle> {
        let filter = row_filter.map(RowFilter::parse).transpose()?;

        let mut inner = self.inner.borrow_mut();
        let taken = inner
            .subscriptions
            .get(channel)
            .is_some_and(|sub| sub.state != SubscriptionState::Closed);
        if taken {
            return Err(FeedError::DuplicateChannel(channel.to_string()).into());
        }
        if !inner.known_tables.is_empty() && !inner.known_tables.contains(table) {
            return Err(FeedError::UnknownTable(table.to_string()).into());
        }

        let spec = ChannelSpec {
            channel: channel.to_string(),
            table: table.to_string(),
            operation,
            filter,
        };
        inner.transport.join(&spec)?;

        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscriptions.insert(
            channel.to_string(),
            Subscription {
                id,
                spec,
                state: SubscriptionState::Pending,
                callback: Some(Box::new(callback)),
            },
        );
        log::info!(
            "Subscribed channel '{}' to {} on '{}'",
            channel,
            operation.as_str(),
            table
        );

        Ok(SubscriptionHandle {
            id,
            channel: channel.to_string(),
            feed: Rc::downgrade(&self.inner),
            released: Cell::new(false),
        })
    }

    /// Like `subscribe`, but the handler receives the current state behind
    /// `target` on every event instead of capturing a copy of it. Once the
    /// owner of `target` drops it, events are ignored.
    pub fn subscribe_into<S: 'static>(
        &self,
        channel: &str,
        table: &str,
        operation: Operation,
        row_filter: Option<&str>,
        target: Weak<RefCell<S>>,
        mut handler: impl FnMut(&mut S, &ChangeEvent) + 'static,
    ) -> Result<SubscriptionHandle> {
        let channel_name = channel.to_string();
        self.subscribe(channel, table, operation, row_filter, move |event| {
            let Some(target) = target.upgrade() else {
                log::debug!("Target of '{}' is gone, ignoring event", channel_name);
                return;
            };
            match target.try_borrow_mut() {
                Ok(mut state) => handler(&mut state, event),
                Err(_) => log::warn!("Target of '{}' is busy, event skipped", channel_name),
            };
        })
    }

    /// Closes the subscription behind `handle`. Repeated calls do nothing.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        handle.unsubscribe();
    }

    /// Dispatches everything the transport has reported so far and returns
    /// how many callbacks ran.
    pub fn pump(&self) -> usize {
        let mut delivered = 0;
        while let Ok(event) = self.events.try_recv() {
            delivered += self.dispatch(event);
        }
        delivered
    }

    /// Waits up to `timeout` for the transport to report something, then
    /// pumps.
    pub fn pump_timeout(&self, timeout: Duration) -> usize {
        match self.events.recv_timeout(timeout) {
            Ok(event) => self.dispatch(event) + self.pump(),
            Err(RecvTimeoutError::Timeout) => 0,
            Err(RecvTimeoutError::Disconnected) => {
                log::debug!("Transport sink disconnected");
                0
            }
        }
    }

    fn dispatch(&self, event: TransportEvent) -> usize {
        match event {
            TransportEvent::Joined(channel) => {
                self.transition(&channel, SubscriptionState::Active);
                0
            }
            TransportEvent::Rejoining(channel) => {
                self.transition(&channel, SubscriptionState::Pending);
                0
            }
            TransportEvent::Closed(channel) => {
                self.transition(&channel, SubscriptionState::Closed);
                0
            }
            TransportEvent::Change(channel, change) => self.deliver(&channel, &change),
        }
    }

    fn transition(&self, channel: &str, to: SubscriptionState) {
        let released = {
            let mut inner = self.inner.borrow_mut();
            let Some(sub) = inner.subscriptions.get_mut(channel) else {
                return;
            };
            if sub.state == SubscriptionState::Closed {
                return;
            }
            log::debug!("Channel '{}': {:?} -> {:?}", channel, sub.state, to);
            sub.state = to;
            if to == SubscriptionState::Closed {
                sub.callback.take()
            } else {
                None
            }
        };
        drop(released);
    }

    fn deliver(&self, channel: &str, change: &ChangeEvent) -> usize {
        let (id, mut callback) = {
            let mut inner = self.inner.borrow_mut();
            let Some(sub) = inner.subscriptions.get_mut(channel) else {
                log::debug!("Dropping event for detached channel '{}'", channel);
                return 0;
            };
            if sub.state == SubscriptionState::Closed || !sub.spec.matches(change) {
                return 0;
            }
            match sub.callback.take() {
                Some(callback) => (sub.id, callback),
                None => return 0,
            }
        };

        callback(change);

        let mut inner = self.inner.borrow_mut();
        if let Some(sub) = inner.subscriptions.get_mut(channel) {
            if sub.id == id && sub.state != SubscriptionState::Closed {
                sub.callback = Some(callback);
            }
        }
        1
    }

    pub fn state(&self, channel: &str) -> Option<SubscriptionState> {
        self.inner
            .borrow()
            .subscriptions
            .get(channel)
            .map(|sub| sub.state)
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.borrow().subscriptions.len()
    }

    /// Drops every subscription and the transport connection.
    pub fn close(&self) {
        let subscriptions = {
            let mut inner = self.inner.borrow_mut();
            let subscriptions = std::mem::take(&mut inner.subscriptions);
            for channel in subscriptions.keys() {
                if let Err(e) = inner.transport.leave(channel) {
                    log::warn!("Failed to leave channel '{}': {}", channel, e);
                }
            }
            inner.transport.close();
            subscriptions
        };
        drop(subscriptions);
    }
}

impl Drop for ChangeFeed {
    fn drop(&mut self) {
        let subscriptions = match self.inner.try_borrow_mut() {
            Ok(mut inner) => {
                inner.transport.close();
                std::mem::take(&mut inner.subscriptions)
            }
            Err(_) => return,
        };
        drop(subscriptions);
    }
}

/// Keeps a channel open. Dropping the handle unsubscribes, so a subscription
/// can't outlive the scope that owns it.
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: u64,
    channel: String,
    feed: Weak<RefCell<FeedInner>>,
    released: Cell<bool>,
}

impl SubscriptionHandle {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn state(&self) -> SubscriptionState {
        if self.released.get() {
            return SubscriptionState::Closed;
        }
        let Some(feed) = self.feed.upgrade() else {
            return SubscriptionState::Closed;
        };
        let inner = feed.borrow();
        match inner.subscriptions.get(&self.channel) {
            Some(sub) if sub.id == self.id => sub.state,
            _ => SubscriptionState::Closed,
        }
    }

    pub fn unsubscribe(&self) {
        if self.released.get() {
            return;
        }
        let Some(feed) = self.feed.upgrade() else {
            self.released.set(true);
            return;
        };
        let removed = match feed.try_borrow_mut() {
            Ok(mut inner) => inner.remove(&self.channel, self.id),
            Err(_) => {
                log::error!("Change feed busy, could not unsubscribe '{}'", self.channel);
                return;
            }
        };
        self.released.set(true);
        drop(removed);
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
