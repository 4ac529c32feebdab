use std::sync::mpsc::Sender;

use anyhow::Result;

use crate::feed::{ChangeEvent, ChannelSpec};

/// What a transport reports back to the change feed. Everything is keyed by
/// channel name.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// The backend confirmed the channel; deliveries follow.
    Joined(String),
    /// The connection dropped and the transport is re-establishing the
    /// channel on its own.
    Rejoining(String),
    Change(String, ChangeEvent),
    /// The backend closed or refused the channel.
    Closed(String),
}

/// The connection to a backend's realtime endpoint. Implementations own any
/// retry/backoff; the change feed only sees `TransportEvent`s.
pub trait Transport {
    /// Hands the transport the sink it reports into. Called once, before any
    /// `join`.
    fn open(&mut self, sink: Sender<TransportEvent>) -> Result<()>;

    fn join(&mut self, spec: &ChannelSpec) -> Result<()>;

    fn leave(&mut self, channel: &str) -> Result<()>;

    /// Drops every channel and the connection itself.
    fn close(&mut self);
}
