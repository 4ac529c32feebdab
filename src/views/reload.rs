use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::data::DataAccess;
use crate::feed::ChangeEvent;
use crate::notifier::Notifier;
use crate::views::ViewEvent;

/// Fetches a complete view model from the data-access layer.
pub trait Loader: Send + Sync + 'static {
    type Model: Send + 'static;

    fn load(&self, data: &dyn DataAccess) -> Result<Self::Model>;
}

/// Which result wins when two reloads of the same view overlap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResolvePolicy {
    /// Whichever load finishes last is displayed, even if it started first.
    #[default]
    LastResolved,
    /// Results of loads started before the displayed one are discarded.
    LastStarted,
}

struct Loaded<M> {
    generation: u64,
    result: Result<M>,
}

/// A view model that is thrown away and fetched again on every change event.
///
/// Loads run one after another on a worker thread owned by the view and are
/// numbered in the order they were started. Results are applied on the
/// owner's thread by `poll`, so a change event can queue a reload while an
/// earlier one is still in flight. After `teardown` results are dropped on
/// arrival and the worker exits.
pub struct ReloadView<L: Loader> {
    loader: Arc<L>,
    data: Arc<dyn DataAccess>,
    policy: ResolvePolicy,
    model: Option<L::Model>,
    last_started: u64,
    displayed: u64,
    in_flight: usize,
    live: bool,
    worker: Option<Sender<u64>>,
    results_tx: Sender<Loaded<L::Model>>,
    results_rx: Receiver<Loaded<L::Model>>,
    changes: Notifier<ViewEvent>,
}

impl<L: Loader> ReloadView<L> {
    pub fn new(loader: L, data: Arc<dyn DataAccess>) -> Self {
        let (results_tx, results_rx) = channel();
        Self {
            loader: Arc::new(loader),
            data,
            policy: ResolvePolicy::default(),
            model: None,
            last_started: 0,
            displayed: 0,
            in_flight: 0,
            live: true,
            worker: None,
            results_tx,
            results_rx,
            changes: Notifier::new(),
        }
    }

    pub fn with_policy(mut self, policy: ResolvePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> ResolvePolicy {
        self.policy
    }

    /// Allocates the generation number of a new load.
    pub fn begin(&mut self) -> u64 {
        self.last_started += 1;
        self.last_started
    }

    /// Queues a load on the view's worker and returns its generation.
    /// Nothing is started once the view is torn down.
    pub fn start_reload(&mut self) -> Option<u64> {
        if !self.live {
            return None;
        }
        let generation = self.begin();
        let sent = self.worker().send(generation);
        if let Err(e) = sent {
            log::error!("Reload worker is gone, reload #{} not started: {}", generation, e);
            self.worker = None;
            return None;
        }
        self.in_flight += 1;
        log::debug!("Queued reload #{}", generation);
        Some(generation)
    }

    fn worker(&mut self) -> &Sender<u64> {
        let (loader, data, results) = (&self.loader, &self.data, &self.results_tx);
        self.worker.get_or_insert_with(|| {
            let (tx, rx) = channel::<u64>();
            let loader = loader.clone();
            let data = data.clone();
            let results = results.clone();
            thread::spawn(move || {
                for generation in rx {
                    let result = loader.load(data.as_ref());
                    if results.send(Loaded { generation, result }).is_err() {
                        break;
                    }
                }
                log::debug!("Reload worker exiting");
            });
            tx
        })
    }

    /// Loads on the calling thread and applies the result.
    pub fn reload_blocking(&mut self) -> Result<bool> {
        let generation = self.begin();
        let result = self.loader.load(self.data.as_ref());
        self.resolve(generation, result)
    }

    /// Applies the outcome of load `generation`. Returns whether the model
    /// changed; a failed load leaves the previous model on display.
    pub fn resolve(&mut self, generation: u64, result: Result<L::Model>) -> Result<bool> {
        if !self.live {
            log::debug!("Reload #{} finished after teardown, ignored", generation);
            return Ok(false);
        }
        let model = match result {
            Ok(model) => model,
            Err(e) => {
                self.changes.notify(ViewEvent::LoadFailed(generation));
                return Err(e.context(format!("Reload #{} failed", generation)));
            }
        };
        if self.policy == ResolvePolicy::LastStarted && generation < self.displayed {
            log::debug!(
                "Reload #{} is older than displayed #{}, discarded",
                generation,
                self.displayed
            );
            self.changes.notify(ViewEvent::Discarded(generation));
            return Ok(false);
        }

        self.model = Some(model);
        self.displayed = generation;
        self.changes.notify(ViewEvent::Reloaded(generation));
        Ok(true)
    }

    /// Applies every finished background load. Returns how many changed the
    /// model.
    pub fn poll(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(loaded) = self.results_rx.try_recv() {
            applied += self.finish(loaded);
        }
        applied
    }

    /// Waits for every in-flight load, up to `timeout`.
    pub fn poll_timeout(&mut self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut applied = self.poll();
        while self.in_flight > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.results_rx.recv_timeout(remaining) {
                Ok(loaded) => applied += self.finish(loaded),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        applied
    }

    fn finish(&mut self, loaded: Loaded<L::Model>) -> usize {
        self.in_flight = self.in_flight.saturating_sub(1);
        match self.resolve(loaded.generation, loaded.result) {
            Ok(true) => 1,
            Ok(false) => 0,
            Err(e) => {
                log::error!("{:#}", e);
                0
            }
        }
    }

    /// Reacts to a change on the watched table by reloading everything. The
    /// event's content doesn't matter.
    pub fn on_change(&mut self, event: &ChangeEvent) {
        log::debug!(
            "{} on '{}', reloading view",
            event.operation.as_str(),
            event.table
        );
        self.start_reload();
    }

    /// Marks the view as gone. Loads still running finish but change nothing.
    pub fn teardown(&mut self) {
        if self.live {
            log::debug!("Tearing down view with {} loads in flight", self.in_flight);
        }
        self.live = false;
        self.model = None;
        self.worker = None;
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn model(&self) -> Option<&L::Model> {
        self.model.as_ref()
    }

    /// Generation of the displayed model, 0 before the first load.
    pub fn displayed_generation(&self) -> u64 {
        self.displayed
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn observer(&self) -> Receiver<ViewEvent> {
        self.changes.observer()
    }
}
