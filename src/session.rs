use std::cell::{Ref, RefCell, RefMut};
use std::rc::Rc;
use std::time::Duration;

use anyhow::Result;

use crate::config::Config;
use crate::feed::{ChangeFeed, Operation, RowFilter, SubscriptionHandle, SubscriptionState};
use crate::notifications::{AlertSound, BellPlayer, NotificationStore, TelegramNotifier};
use crate::realtime::PhoenixTransport;
use crate::views::{Loader, PatchView, ReloadView};

/// Channel the session listens on for new storefront orders.
pub const ORDER_NOTIFICATIONS: &str = "order_notifications";

/// Shell layout shared by every screen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LayoutState {
    sidebar_open: bool,
}

impl LayoutState {
    pub fn is_sidebar_open(&self) -> bool {
        self.sidebar_open
    }

    pub fn toggle_sidebar(&mut self) {
        self.sidebar_open = !self.sidebar_open;
    }

    pub fn open_sidebar(&mut self) {
        self.sidebar_open = true;
    }

    pub fn close_sidebar(&mut self) {
        self.sidebar_open = false;
    }
}

/// A view model a screen can mount against the change feed.
pub trait ScreenView {
    /// Called when the screen goes away.
    fn teardown(&mut self);

    fn on_change(&mut self, event: &crate::feed::ChangeEvent);
}

impl<L: Loader> ScreenView for ReloadView<L> {
    fn teardown(&mut self) {
        ReloadView::teardown(self);
    }

    fn on_change(&mut self, event: &crate::feed::ChangeEvent) {
        ReloadView::on_change(self, event);
    }
}

impl ScreenView for PatchView {
    fn teardown(&mut self) {
        self.load(Vec::new());
    }

    fn on_change(&mut self, event: &crate::feed::ChangeEvent) {
        self.apply(event);
    }
}

/// A view bound to one channel for as long as its screen is shown. Dropping
/// it unsubscribes and tears the view down.
pub struct MountedView<V: ScreenView> {
    view: Rc<RefCell<V>>,
    subscription: SubscriptionHandle,
}

impl<V: ScreenView> MountedView<V> {
    pub fn view(&self) -> Ref<'_, V> {
        self.view.borrow()
    }

    pub fn view_mut(&self) -> RefMut<'_, V> {
        self.view.borrow_mut()
    }

    pub fn channel(&self) -> &str {
        self.subscription.channel()
    }

    pub fn state(&self) -> SubscriptionState {
        self.subscription.state()
    }

    pub fn unmount(self) {}
}

impl<V: ScreenView> Drop for MountedView<V> {
    fn drop(&mut self) {
        self.subscription.unsubscribe();
        match self.view.try_borrow_mut() {
            Ok(mut view) => view.teardown(),
            Err(_) => log::warn!("View of '{}' busy during unmount", self.subscription.channel()),
        }
    }
}

/// Everything that lives for one signed-in admin: the change feed, the
/// notification list behind the header bell, and the layout. Screens get
/// what they need from here.
pub struct AdminSession {
    feed: ChangeFeed,
    notifications: Rc<RefCell<NotificationStore>>,
    order_notifications: Option<SubscriptionHandle>,
    layout: LayoutState,
}

impl AdminSession {
    /// Subscribes `store` to the events its rule describes.
    pub fn start(feed: ChangeFeed, store: NotificationStore) -> Result<Self> {
        let rule = store.rule().clone();
        let notifications = Rc::new(RefCell::new(store));
        let filter = rule.filter.as_ref().map(RowFilter::to_wire);
        let handle = feed.subscribe_into(
            ORDER_NOTIFICATIONS,
            &rule.table,
            rule.operation,
            filter.as_deref(),
            Rc::downgrade(&notifications),
            |store, event| {
                store.on_change_event(event);
            },
        )?;
        log::info!("Admin session started");
        Ok(Self {
            feed,
            notifications,
            order_notifications: Some(handle),
            layout: LayoutState::default(),
        })
    }

    /// Starts a session against the hosted backend, with the alert bell and,
    /// when configured, the Telegram bot as notification sinks.
    pub fn connect(config: &Config) -> Result<Self> {
        let feed = ChangeFeed::new(PhoenixTransport::new(config.clone()))?
            .with_known_tables(config.tables.iter().cloned());
        let mut store = NotificationStore::default()
            .with_sink(AlertSound::new(BellPlayer::stderr(), config.alert_sound.clone()));
        if let Some(telegram) = &config.telegram {
            store.add_sink(TelegramNotifier::new(telegram.clone())?);
        }
        Self::start(feed, store)
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    pub fn notifications(&self) -> Ref<'_, NotificationStore> {
        self.notifications.borrow()
    }

    pub fn notifications_mut(&self) -> RefMut<'_, NotificationStore> {
        self.notifications.borrow_mut()
    }

    pub fn layout(&self) -> &LayoutState {
        &self.layout
    }

    pub fn layout_mut(&mut self) -> &mut LayoutState {
        &mut self.layout
    }

    /// Binds a reload view to `operation` events on `table` and starts its
    /// first load.
    pub fn mount_reload<L: Loader>(
        &self,
        channel: &str,
        table: &str,
        operation: Operation,
        mut view: ReloadView<L>,
    ) -> Result<MountedView<ReloadView<L>>> {
        view.start_reload();
        self.mount(channel, table, operation, view)
    }

    /// Binds a patch view to every change on its table.
    pub fn mount_patch(&self, channel: &str, view: PatchView) -> Result<MountedView<PatchView>> {
        let table = view.table().to_string();
        self.mount(channel, &table, Operation::All, view)
    }

    fn mount<V: ScreenView + 'static>(
        &self,
        channel: &str,
        table: &str,
        operation: Operation,
        view: V,
    ) -> Result<MountedView<V>> {
        let view = Rc::new(RefCell::new(view));
        let subscription = self.feed.subscribe_into(
            channel,
            table,
            operation,
            None,
            Rc::downgrade(&view),
            |view, event| view.on_change(event),
        )?;
        Ok(MountedView { view, subscription })
    }

    /// Delivers pending change events to the store and mounted views.
    pub fn pump(&self) -> usize {
        self.feed.pump()
    }

    pub fn pump_timeout(&self, timeout: Duration) -> usize {
        self.feed.pump_timeout(timeout)
    }

    /// Closes every channel and the connection. Mounted views still held by
    /// screens stop receiving events.
    pub fn sign_out(mut self) {
        if let Some(handle) = self.order_notifications.take() {
            handle.unsubscribe();
        }
        self.feed.close();
        log::info!(
            "Signed out with {} unread notifications",
            self.notifications.borrow().unread_count()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{ChangeEvent, MemoryTransport};
    use serde_json::json;

    fn session() -> Result<(MemoryTransport, AdminSession)> {
        let transport = MemoryTransport::new();
        let feed = ChangeFeed::new(transport.clone())?;
        let session = AdminSession::start(feed, NotificationStore::default())?;
        session.pump();
        Ok((transport, session))
    }

    fn order(id: &str, source: &str, status: &str) -> ChangeEvent {
        ChangeEvent::insert(
            "orders",
            json!({"id": id, "customer_name": "Aziz", "total": 150000, "source": source, "status": status})
                .as_object()
                .cloned()
                .unwrap(),
        )
    }

    #[test]
    fn website_orders_reach_the_bell() -> Result<()> {
        let (transport, session) = session()?;
        assert_eq!(
            session.feed().state(ORDER_NOTIFICATIONS),
            Some(SubscriptionState::Active)
        );
        transport.publish(&order("abc123", "website", "new"))?;
        transport.publish(&order("admin1", "admin", "new"))?;
        session.pump();

        let store = session.notifications();
        assert_eq!(store.len(), 1);
        assert_eq!(store.unread_count(), 1);
        assert!(store.notifications()[0].message.contains("Aziz"));
        Ok(())
    }

    #[test]
    fn mounted_patch_view_follows_its_table() -> Result<()> {
        let (transport, session) = session()?;
        let mounted = session.mount_patch("orders_status", PatchView::new("orders"))?;
        session.pump();
        assert_eq!(mounted.state(), SubscriptionState::Active);

        transport.publish(&order("o1", "admin", "new"))?;
        transport.publish(&ChangeEvent::update(
            "orders",
            json!({"id": "o1", "status": "new"}).as_object().cloned().unwrap(),
            json!({"id": "o1", "status": "completed"}).as_object().cloned().unwrap(),
        ))?;
        session.pump();
        assert_eq!(mounted.view().get("o1").unwrap()["status"], "completed");
        Ok(())
    }

    #[test]
    fn unmounting_releases_the_channel() -> Result<()> {
        let (transport, session) = session()?;
        let mounted = session.mount_patch("orders_status", PatchView::new("orders"))?;
        session.pump();
        mounted.unmount();
        assert_eq!(session.feed().state("orders_status"), None);
        assert!(!transport.joined().contains(&"orders_status".to_string()));

        // The name is free again.
        let again = session.mount_patch("orders_status", PatchView::new("orders"))?;
        assert_eq!(again.channel(), "orders_status");
        Ok(())
    }

    #[test]
    fn sign_out_closes_everything() -> Result<()> {
        let (transport, session) = session()?;
        let mounted = session.mount_patch("orders_status", PatchView::new("orders"))?;
        session.sign_out();
        assert!(transport.joined().is_empty());
        assert_eq!(mounted.state(), SubscriptionState::Closed);
        Ok(())
    }

    #[test]
    fn sidebar_toggles() {
        let mut layout = LayoutState::default();
        assert!(!layout.is_sidebar_open());
        layout.toggle_sidebar();
        assert!(layout.is_sidebar_open());
        layout.close_sidebar();
        assert!(!layout.is_sidebar_open());
    }
}
