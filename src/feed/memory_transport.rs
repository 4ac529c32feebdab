use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use anyhow::Result;

use crate::feed::transport::{Transport, TransportEvent};
use crate::feed::{ChangeEvent, ChannelSpec};

#[derive(Default)]
struct MemoryState {
    sink: Option<Sender<TransportEvent>>,
    channels: Vec<ChannelSpec>,
    manual_confirm: bool,
}

/// In-process transport. Clones share state, so one clone can be given to a
/// `ChangeFeed` while another plays the backend.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    /// A transport that confirms joins immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport whose channels stay pending until `confirm` is called.
    pub fn manual() -> Self {
        let transport = Self::default();
        if let Ok(mut state) = transport.state.lock() {
            state.manual_confirm = true;
        }
        transport
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow::anyhow!("Failed to acquire memory transport lock"))
    }

    fn send(state: &MemoryState, event: TransportEvent) -> bool {
        match &state.sink {
            Some(sink) => sink.send(event).is_ok(),
            None => false,
        }
    }

    pub fn confirm(&self, channel: &str) -> Result<()> {
        let state = self.lock()?;
        Self::send(&state, TransportEvent::Joined(channel.to_string()));
        Ok(())
    }

    /// Sends `event` to `channel` as-is, whether or not that channel is still
    /// joined or would match it.
    pub fn deliver(&self, channel: &str, event: ChangeEvent) -> Result<bool> {
        let state = self.lock()?;
        Ok(Self::send(
            &state,
            TransportEvent::Change(channel.to_string(), event),
        ))
    }

    /// Routes `event` to every joined channel whose spec matches it, the way
    /// the backend filters server side. Returns the number of channels hit.
    pub fn publish(&self, event: &ChangeEvent) -> Result<usize> {
        let state = self.lock()?;
        let mut delivered = 0;
        for spec in state.channels.iter().filter(|spec| spec.matches(event)) {
            if Self::send(
                &state,
                TransportEvent::Change(spec.channel.clone(), event.clone()),
            ) {
                delivered += 1;
            }
        }
        log::debug!(
            "MEMORY PUBLISH: {} on '{}' to {} channel(s)",
            event.operation.as_str(),
            event.table,
            delivered
        );
        Ok(delivered)
    }

    /// Simulates a dropped connection that the transport recovers from.
    pub fn reconnect(&self) -> Result<()> {
        let state = self.lock()?;
        for spec in &state.channels {
            Self::send(&state, TransportEvent::Rejoining(spec.channel.clone()));
        }
        for spec in &state.channels {
            Self::send(&state, TransportEvent::Joined(spec.channel.clone()));
        }
        Ok(())
    }

    /// Simulates the backend closing one channel.
    pub fn close_channel(&self, channel: &str) -> Result<()> {
        let mut state = self.lock()?;
        state.channels.retain(|spec| spec.channel != channel);
        Self::send(&state, TransportEvent::Closed(channel.to_string()));
        Ok(())
    }

    pub fn joined(&self) -> Vec<String> {
        self.lock()
            .map(|state| state.channels.iter().map(|s| s.channel.clone()).collect())
            .unwrap_or_default()
    }

    /// Publishes every event arriving on `changes` until its sender side is
    /// gone.
    pub fn follow(&self, changes: Receiver<ChangeEvent>) -> JoinHandle<()> {
        let transport = self.clone();
        thread::spawn(move || {
            for event in changes.iter() {
                if let Err(e) = transport.publish(&event) {
                    log::error!("Failed to publish change: {}", e);
                }
            }
        })
    }
}

impl Transport for MemoryTransport {
    fn open(&mut self, sink: Sender<TransportEvent>) -> Result<()> {
        self.lock()?.sink = Some(sink);
        Ok(())
    }

    fn join(&mut self, spec: &ChannelSpec) -> Result<()> {
        let mut state = self.lock()?;
        state.channels.retain(|s| s.channel != spec.channel);
        state.channels.push(spec.clone());
        if !state.manual_confirm {
            Self::send(&state, TransportEvent::Joined(spec.channel.clone()));
        }
        Ok(())
    }

    fn leave(&mut self, channel: &str) -> Result<()> {
        self.lock()?.channels.retain(|spec| spec.channel != channel);
        Ok(())
    }

    fn close(&mut self) {
        if let Ok(mut state) = self.lock() {
            state.channels.clear();
            state.sink = None;
        }
    }
}
