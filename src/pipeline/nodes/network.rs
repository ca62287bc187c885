//! Network bridge pair carrying one graph edge between two hosts.
//!
//! [`NetworkSink`] sends each packet as one framed message and blocks for an
//! `ACK` before forwarding the packet locally. [`NetworkSource`] accepts
//! connections, acknowledges every message, and re-emits the packet on the
//! channel the sink received it on (carried in the `net.channel` property).
//! One request is in flight per connection; there is no pipelining.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::graph::DEFAULT_CHANNEL;
use crate::pipeline::module::{lock, Module, ModuleCore, SharedModule};
use crate::pipeline::packet::{read_message, write_message, Packet, MAX_MESSAGE_LEN};
use crate::pipeline::shutdown::{ShutdownSignal, WorkerGroup};
use clap::{value_parser, Arg, ArgMatches, Command};
use std::io::{ErrorKind, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Property naming the channel a bridged packet travels on.
pub const CHANNEL_PROPERTY: &str = "net.channel";
pub const ACK: &[u8] = b"ACK";
pub const NAK: &[u8] = b"NAK";

const RETRY_INTERVAL: Duration = Duration::from_millis(100);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Strip an optional `tcp://` scheme and map a `*` host to all interfaces.
pub fn normalize_address(address: &str) -> String {
    let address = address.strip_prefix("tcp://").unwrap_or(address);
    match address.strip_prefix("*:") {
        Some(port) => format!("0.0.0.0:{}", port),
        None => address.to_string(),
    }
}

#[derive(Debug, Clone)]
struct SinkSettings {
    address: String,
    connect_timeout: Duration,
}

pub struct NetworkSink {
    core: ModuleCore,
    settings: Mutex<SinkSettings>,
    stream: Mutex<Option<TcpStream>>,
}

impl NetworkSink {
    pub fn new(id: &str) -> Self {
        Self::with_settings(
            ModuleCore::new(id),
            SinkSettings {
                address: "localhost:7467".into(),
                connect_timeout: Duration::from_secs(30),
            },
        )
    }

    fn with_settings(core: ModuleCore, settings: SinkSettings) -> Self {
        Self {
            core,
            settings: Mutex::new(settings),
            stream: Mutex::new(None),
        }
    }

    pub fn address(&self) -> String {
        lock(&self.settings).address.clone()
    }

    /// Connect, retrying until the peer binds or the timeout expires.
    fn connect(&self) -> PipelineResult<TcpStream> {
        let settings = lock(&self.settings).clone();
        let address = normalize_address(&settings.address);
        let deadline = Instant::now() + settings.connect_timeout;
        loop {
            match TcpStream::connect(&address) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_read_timeout(Some(settings.connect_timeout))?;
                    tracing::info!(module = %self.core.id(), %address, "bridge connected");
                    return Ok(stream);
                }
                Err(e) if Instant::now() < deadline => {
                    tracing::trace!(module = %self.core.id(), %address, "connect failed: {}", e);
                    std::thread::sleep(RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(PipelineError::RemoteCommunication(format!(
                        "cannot reach {}: {}",
                        address, e
                    )))
                }
            }
        }
    }

    fn send(&self, body: &[u8]) -> PipelineResult<()> {
        let mut guard = lock(&self.stream);
        if guard.is_none() {
            *guard = Some(self.connect()?);
        }
        let Some(stream) = guard.as_mut() else {
            return Err(PipelineError::RemoteCommunication("no connection".into()));
        };
        let exchange = write_message(stream, body).and_then(|_| read_message(stream));
        match exchange {
            Ok(reply) if reply == ACK => Ok(()),
            Ok(reply) => {
                *guard = None;
                Err(PipelineError::RemoteCommunication(format!(
                    "expected ACK from {}, got {:?}",
                    self.address(),
                    String::from_utf8_lossy(&reply)
                )))
            }
            Err(e) => {
                *guard = None;
                Err(PipelineError::RemoteCommunication(format!(
                    "exchange with {} failed: {}",
                    self.address(),
                    e
                )))
            }
        }
    }
}

impl Module for NetworkSink {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn type_name(&self) -> &str {
        "NetworkSink"
    }

    fn setup_options(&self, cmd: Command) -> Command {
        cmd.arg(
            Arg::new("sinkaddress")
                .long("sinkaddress")
                .default_value("localhost:7467")
                .help("remote bridge address (host:port)"),
        )
        .arg(
            Arg::new("connecttimeout")
                .long("connecttimeout")
                .value_parser(value_parser!(u64))
                .default_value("30000")
                .help("milliseconds to keep retrying the connection"),
        )
    }

    fn apply_options(&self, matches: &ArgMatches) -> PipelineResult<()> {
        let mut settings = lock(&self.settings);
        if let Some(address) = matches.get_one::<String>("sinkaddress") {
            settings.address = address.clone();
        }
        if let Some(ms) = matches.get_one::<u64>("connecttimeout") {
            settings.connect_timeout = Duration::from_millis(*ms);
        }
        Ok(())
    }

    fn on_incoming_data(&self, packet: &mut Packet, channel: &str) -> PipelineResult<()> {
        let mut wire = packet.clone();
        wire.set_property(CHANNEL_PROPERTY, channel);
        self.send(&wire.encode()?)?;
        self.core.submit_data(packet, DEFAULT_CHANNEL)
    }

    fn shutdown(&self) {
        lock(&self.stream).take();
    }

    fn on_read_property(&self, name: &str) -> String {
        match name {
            "sinkaddress" => self.address(),
            _ => String::new(),
        }
    }

    fn duplicate(&self) -> PipelineResult<SharedModule> {
        Ok(Arc::new(Self::with_settings(
            self.core.duplicate(),
            lock(&self.settings).clone(),
        )))
    }
}

pub struct NetworkSource {
    core: Arc<ModuleCore>,
    address: Mutex<String>,
    local_addr: Mutex<Option<SocketAddr>>,
    workers: WorkerGroup,
}

impl NetworkSource {
    pub fn new(id: &str) -> Self {
        Self {
            core: Arc::new(ModuleCore::new(id)),
            address: Mutex::new("0.0.0.0:7467".into()),
            local_addr: Mutex::new(None),
            workers: WorkerGroup::new(),
        }
    }

    /// Bound address, once initialized.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }
}

impl Module for NetworkSource {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn type_name(&self) -> &str {
        "NetworkSource"
    }

    fn setup_options(&self, cmd: Command) -> Command {
        cmd.arg(
            Arg::new("sourceaddress")
                .long("sourceaddress")
                .default_value("0.0.0.0:7467")
                .help("address to listen on (host:port, * for all interfaces)"),
        )
    }

    fn apply_options(&self, matches: &ArgMatches) -> PipelineResult<()> {
        if let Some(address) = matches.get_one::<String>("sourceaddress") {
            *lock(&self.address) = address.clone();
        }
        Ok(())
    }

    fn initialize(&self) -> PipelineResult<()> {
        if self.local_addr().is_some() {
            return Ok(());
        }
        let address = normalize_address(&lock(&self.address));
        let listener = TcpListener::bind(&address).map_err(|e| PipelineError::Initialization {
            module: self.core.id().to_string(),
            message: format!("cannot bind {}: {}", address, e),
        })?;
        listener.set_nonblocking(true)?;
        let bound = listener.local_addr()?;
        *lock(&self.local_addr) = Some(bound);
        tracing::info!(module = %self.core.id(), %bound, "bridge listening");

        let core = self.core.clone();
        self.workers
            .spawn(format!("{}-serve", core.id()), move |signal| {
                serve(&core, &listener, &signal)
            })?;
        Ok(())
    }

    fn start_processing(&self, signal: &ShutdownSignal) -> PipelineResult<()> {
        let own = self.workers.signal();
        crossbeam_channel::select! {
            recv(signal.receiver()) -> _ => {},
            recv(own.receiver()) -> _ => {},
        }
        Ok(())
    }

    fn shutdown(&self) {
        self.workers.shutdown();
    }
}

fn serve(core: &ModuleCore, listener: &TcpListener, signal: &ShutdownSignal) {
    while !signal.is_triggered() {
        match listener.accept() {
            Ok((stream, peer)) => {
                tracing::info!(module = %core.id(), %peer, "bridge peer connected");
                if let Err(e) = handle_connection(core, stream, signal) {
                    tracing::error!(module = %core.id(), %peer, "bridge connection failed: {}", e);
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                signal.wait_timeout(POLL_INTERVAL);
            }
            Err(e) => {
                tracing::error!(module = %core.id(), "accept failed: {}", e);
                signal.wait_timeout(POLL_INTERVAL);
            }
        }
    }
}

fn handle_connection(
    core: &ModuleCore,
    mut stream: TcpStream,
    signal: &ShutdownSignal,
) -> PipelineResult<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(POLL_INTERVAL))?;
    stream.set_nodelay(true)?;
    while let Some(body) = read_interruptible(&mut stream, signal)? {
        let mut packet = match Packet::decode(&body) {
            Ok(packet) => packet,
            Err(e) => {
                write_message(&mut stream, NAK)?;
                return Err(e);
            }
        };
        let channel = match packet.properties.remove(CHANNEL_PROPERTY) {
            Some(serde_json::Value::String(c)) if !c.is_empty() => c,
            _ => DEFAULT_CHANNEL.to_string(),
        };
        write_message(&mut stream, ACK)?;
        if let Err(e) = core.submit_data(&mut packet, &channel) {
            tracing::error!(module = %core.id(), "bridged packet dispatch failed: {}", e);
        }
    }
    Ok(())
}

/// One framed message, or `None` on clean close or shutdown.
fn read_interruptible(
    stream: &mut TcpStream,
    signal: &ShutdownSignal,
) -> PipelineResult<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    if !read_full(stream, &mut len_buf, signal)? {
        return Ok(None);
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(PipelineError::Protocol(format!(
            "message of {} bytes exceeds limit",
            len
        )));
    }
    let mut body = vec![0u8; len];
    if !read_full(stream, &mut body, signal)? {
        return Ok(None);
    }
    Ok(Some(body))
}

fn read_full(
    stream: &mut TcpStream,
    buf: &mut [u8],
    signal: &ShutdownSignal,
) -> PipelineResult<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(PipelineError::Protocol("connection closed mid-message".into()))
            }
            Ok(n) => filled += n,
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) =>
            {
                if signal.is_triggered() {
                    return Ok(false);
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}
