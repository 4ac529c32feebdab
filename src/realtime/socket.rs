use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{Shutdown, TcpStream};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};
use url::Url;

use crate::config::Config;
use crate::feed::transport::{Transport, TransportEvent};
use crate::feed::ChannelSpec;
use crate::realtime::protocol::{self, Inbound};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

enum Command {
    Join(ChannelSpec),
    Leave(String),
    Shutdown,
}

enum Exit {
    Shutdown,
    Disconnected(anyhow::Error),
}

/// Transport for the hosted backend's realtime websocket. A background
/// thread owns the socket, keeps it alive with heartbeats and reconnects with
/// the configured backoff, rejoining every channel it was asked to hold.
pub struct PhoenixTransport {
    config: Config,
    commands: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
}

impl PhoenixTransport {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            commands: None,
            worker: None,
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .as_ref()
            .context("Realtime transport is not open")?
            .send(command)
            .map_err(|_| anyhow::anyhow!("Realtime worker has stopped"))
    }
}

impl Transport for PhoenixTransport {
    fn open(&mut self, sink: Sender<TransportEvent>) -> Result<()> {
        if self.commands.is_some() {
            anyhow::bail!("Realtime transport already open");
        }
        let (tx, rx) = channel();
        let worker = Worker {
            url: self.config.realtime_url()?,
            access_token: self.config.anon_key.clone(),
            heartbeat_interval: self.config.heartbeat_interval,
            config: self.config.clone(),
            sink,
            commands: rx,
            channels: Vec::new(),
            pending_joins: HashMap::new(),
            pending_heartbeat: None,
            next_ref: 1,
        };
        let handle = thread::Builder::new()
            .name("realtime-socket".to_string())
            .spawn(move || worker.run())?;
        self.commands = Some(tx);
        self.worker = Some(handle);
        Ok(())
    }

    fn join(&mut self, spec: &ChannelSpec) -> Result<()> {
        self.send(Command::Join(spec.clone()))
    }

    fn leave(&mut self, channel: &str) -> Result<()> {
        self.send(Command::Leave(channel.to_string()))
    }

    fn close(&mut self) {
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(Command::Shutdown);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for PhoenixTransport {
    fn drop(&mut self) {
        self.close();
    }
}

type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

struct Worker {
    url: Url,
    access_token: String,
    heartbeat_interval: Duration,
    config: Config,
    sink: Sender<TransportEvent>,
    commands: Receiver<Command>,
    channels: Vec<ChannelSpec>,
    /// Join ref -> channel.
    pending_joins: HashMap<String, String>,
    pending_heartbeat: Option<String>,
    next_ref: u64,
}

impl Worker {
    fn run(mut self) {
        let mut attempt = 0;
        loop {
            match self.connect() {
                Ok((mut socket, control)) => {
                    attempt = 0;
                    let exit = self.session(&mut socket);
                    let _ = socket.close(None);
                    let _ = control.shutdown(Shutdown::Both);
                    match exit {
                        Exit::Shutdown => {
                            log::info!("Realtime socket shut down");
                            return;
                        }
                        Exit::Disconnected(e) => log::warn!("Realtime socket dropped: {:#}", e),
                    }
                }
                Err(e) => log::warn!("Realtime connect failed: {:#}", e),
            }

            self.pending_joins.clear();
            self.pending_heartbeat = None;
            for spec in &self.channels {
                if self.sink.send(TransportEvent::Rejoining(spec.channel.clone())).is_err() {
                    return;
                }
            }

            let delay = self.config.backoff(attempt);
            attempt += 1;
            log::info!("Reconnecting in {:?} (attempt {})", delay, attempt);
            if self.wait(delay) {
                return;
            }
        }
    }

    fn make_ref(&mut self) -> String {
        let reference = self.next_ref.to_string();
        self.next_ref += 1;
        reference
    }

    fn connect(&mut self) -> Result<(Socket, TcpStream)> {
        let host = self.url.host_str().context("Realtime URL has no host")?;
        let port = self
            .url
            .port_or_known_default()
            .context("Realtime URL has no port")?;
        let stream = TcpStream::connect((host, port))
            .with_context(|| format!("Failed to connect to {}:{}", host, port))?;
        stream.set_nodelay(true)?;
        let control = stream.try_clone()?;

        let (mut socket, _response) = tungstenite::client_tls(self.url.as_str(), stream)
            .map_err(|e| anyhow::anyhow!("Websocket handshake failed: {}", e))?;
        // Reads time out so commands and heartbeats get a turn.
        control.set_read_timeout(Some(POLL_INTERVAL))?;
        log::info!("Realtime socket connected to {}", host);

        let specs = self.channels.clone();
        for spec in &specs {
            self.send_join(&mut socket, spec)?;
        }
        Ok((socket, control))
    }

    fn send_join(&mut self, socket: &mut Socket, spec: &ChannelSpec) -> Result<()> {
        let reference = self.make_ref();
        let frame = protocol::join_frame(spec, &self.access_token, &reference);
        self.pending_joins.insert(reference, spec.channel.clone());
        write_frame(socket, &frame)
    }

    fn session(&mut self, socket: &mut Socket) -> Exit {
        let mut last_heartbeat = Instant::now();
        loop {
            match self.apply_commands(Some(&mut *socket)) {
                Ok(true) => return Exit::Shutdown,
                Ok(false) => {}
                Err(e) => return Exit::Disconnected(e),
            }

            if last_heartbeat.elapsed() >= self.heartbeat_interval {
                if self.pending_heartbeat.is_some() {
                    return Exit::Disconnected(anyhow::anyhow!("Heartbeat timed out"));
                }
                let reference = self.make_ref();
                if let Err(e) = write_frame(socket, &protocol::heartbeat_frame(&reference)) {
                    return Exit::Disconnected(e);
                }
                self.pending_heartbeat = Some(reference);
                last_heartbeat = Instant::now();
            }

            match socket.read() {
                Ok(Message::Text(text)) => {
                    if !self.handle_text(socket, text.as_str()) {
                        return Exit::Shutdown;
                    }
                }
                Ok(Message::Close(_)) => {
                    return Exit::Disconnected(anyhow::anyhow!("Server closed the connection"))
                }
                Ok(_) => {}
                Err(tungstenite::Error::Io(e))
                    if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) => return Exit::Disconnected(e.into()),
            }
        }
    }

    /// Applies queued commands. Returns true on shutdown. Without a socket
    /// only the channel list is updated.
    fn apply_commands(&mut self, mut socket: Option<&mut Socket>) -> Result<bool> {
        loop {
            let command = match self.commands.try_recv() {
                Ok(command) => command,
                Err(TryRecvError::Empty) => return Ok(false),
                Err(TryRecvError::Disconnected) => return Ok(true),
            };
            if self.apply(command, socket.as_deref_mut())? {
                return Ok(true);
            }
        }
    }

    fn apply(&mut self, command: Command, socket: Option<&mut Socket>) -> Result<bool> {
        match command {
            Command::Join(spec) => {
                self.channels.retain(|s| s.channel != spec.channel);
                self.channels.push(spec.clone());
                if let Some(socket) = socket {
                    self.send_join(socket, &spec)?;
                }
            }
            Command::Leave(channel) => {
                self.channels.retain(|s| s.channel != channel);
                self.pending_joins.retain(|_, c| *c != channel);
                if let Some(socket) = socket {
                    let reference = self.make_ref();
                    write_frame(socket, &protocol::leave_frame(&channel, &reference))?;
                }
            }
            Command::Shutdown => return Ok(true),
        }
        Ok(false)
    }

    /// Sleeps for `delay` while still taking commands. Returns true on
    /// shutdown.
    fn wait(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match self.commands.recv_timeout(remaining) {
                Ok(command) => match self.apply(command, None) {
                    Ok(true) => return true,
                    Ok(false) => {}
                    Err(e) => log::warn!("Command failed while disconnected: {}", e),
                },
                Err(RecvTimeoutError::Timeout) => return false,
                Err(RecvTimeoutError::Disconnected) => return true,
            }
        }
    }

    /// Returns false once nobody listens to the sink any more.
    fn handle_text(&mut self, socket: &mut Socket, text: &str) -> bool {
        log::debug!("REALTIME RECV: {}", text);
        let inbound = match protocol::decode(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                log::warn!("Skipping realtime frame: {:#}", e);
                return true;
            }
        };
        let report = match inbound {
            Inbound::Reply { reference, ok, response, .. } => {
                let Some(reference) = reference else {
                    return true;
                };
                if self.pending_heartbeat.as_deref() == Some(reference.as_str()) {
                    self.pending_heartbeat = None;
                    return true;
                }
                let Some(channel) = self.pending_joins.remove(&reference) else {
                    return true;
                };
                if ok {
                    TransportEvent::Joined(channel)
                } else {
                    log::error!("Join of '{}' refused: {}", channel, response);
                    self.channels.retain(|s| s.channel != channel);
                    TransportEvent::Closed(channel)
                }
            }
            Inbound::Change { channel, event } => TransportEvent::Change(channel, event),
            Inbound::Closed { channel } => {
                if !self.channels.iter().any(|s| s.channel == channel) {
                    return true;
                }
                self.channels.retain(|s| s.channel != channel);
                TransportEvent::Closed(channel)
            }
            Inbound::ChannelError { channel } => {
                let Some(spec) = self.channels.iter().find(|s| s.channel == channel).cloned() else {
                    return true;
                };
                if let Err(e) = self.send_join(socket, &spec) {
                    log::warn!("Failed to rejoin '{}': {}", channel, e);
                }
                TransportEvent::Rejoining(channel)
            }
            Inbound::Ignored { topic, event } => {
                log::debug!("Ignoring '{}' on '{}'", event, topic);
                return true;
            }
        };
        self.sink.send(report).is_ok()
    }
}

fn write_frame(socket: &mut Socket, frame: &protocol::Frame) -> Result<()> {
    let text = frame.encode()?;
    log::debug!("REALTIME SEND: {}", text);
    socket.send(Message::text(text))?;
    Ok(())
}
