use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::cache::WorldCache;
use crate::correlator::Correlator;
use crate::error::LinkError;
use crate::models::{Event, LinkOptions};
use crate::protocol::{encode_hello, FrameDecoder, Message, PROTOCOL_VERSION};

static DNS_CACHE: Lazy<DashMap<String, (SocketAddr, SystemTime)>> = Lazy::new(DashMap::new);
const DNS_CACHE_TTL: u64 = 300; // 5 minutes

/// Default listener port of the remote mod.
pub const DEFAULT_PORT: u16 = 4711;

/// Connection lifecycle as observed by senders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Between connections; sends block until the outcome is known.
    Connecting,
    Connected,
    /// Reconnect ceiling exhausted or session closed; terminal.
    Failed,
}

/// The single transport endpoint of a client.
///
/// Owns the write half behind an async mutex (writers are serialized so no
/// two tasks interleave partial frames) and a supervisor task that owns the
/// read half, dispatches inbound messages, and drives reconnection.
pub(crate) struct Session {
    shared: Arc<SessionShared>,
}

struct SessionShared {
    host: String,
    port: u16,
    options: LinkOptions,
    writer: Mutex<Option<OwnedWriteHalf>>,
    state_tx: watch::Sender<SessionState>,
    state_rx: watch::Receiver<SessionState>,
    generation: AtomicU64,
    closed: AtomicBool,
    correlator: Arc<Correlator>,
    cache: Arc<WorldCache>,
    events: broadcast::Sender<Event>,
}

impl Session {
    /// Establishes the first connection and spawns the supervisor task.
    ///
    /// Fails fast when the initial connect, resolve, or handshake fails;
    /// reconnection policy only applies to a connection that was lost.
    pub async fn connect(
        address: &str,
        options: LinkOptions,
        correlator: Arc<Correlator>,
        cache: Arc<WorldCache>,
        events: broadcast::Sender<Event>,
    ) -> Result<Self, LinkError> {
        let (host, port) = parse_address(address, DEFAULT_PORT)?;
        let (stream, decoder) = establish(&host, port, &options).await?;
        let (read_half, write_half) = stream.into_split();

        let (state_tx, state_rx) = watch::channel(SessionState::Connected);
        let shared = Arc::new(SessionShared {
            host,
            port,
            options,
            writer: Mutex::new(Some(write_half)),
            state_tx,
            state_rx,
            generation: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            correlator,
            cache,
            events,
        });

        info!(host = %shared.host, port = shared.port, "connected");
        tokio::spawn(supervise(shared.clone(), read_half, decoder));

        Ok(Self { shared })
    }

    /// Writes one encoded frame (or batch of frames) to the socket.
    ///
    /// Blocks while a reconnect is in progress; fails with `ConnectionLost`
    /// once the session is in its terminal state.
    pub async fn send(&self, bytes: &[u8]) -> Result<(), LinkError> {
        self.await_connected().await?;
        let mut guard = self.shared.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(LinkError::ConnectionLost);
        };
        writer.write_all(bytes).await.map_err(|e| {
            warn!(error = %e, "write failed");
            LinkError::ConnectionLost
        })
    }

    async fn await_connected(&self) -> Result<(), LinkError> {
        let mut rx = self.shared.state_rx.clone();
        let state = rx
            .wait_for(|s| *s != SessionState::Connecting)
            .await
            .map_err(|_| LinkError::ConnectionLost)?;
        match *state {
            SessionState::Connected => Ok(()),
            _ => Err(LinkError::ConnectionLost),
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.state_rx.borrow() == SessionState::Connected
    }

    /// Bumped once per established connection; in-flight requests never
    /// survive a generation change.
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    /// Tears the session down. Pending and future calls fail with
    /// `ConnectionLost`.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        // The Failed state doubles as the shutdown signal: the read loop and
        // any backoff sleep select on it through the watch channel.
        let _ = self.shared.state_tx.send(SessionState::Failed);
        self.shared.correlator.fail_all(|| LinkError::ConnectionLost);
    }
}

/// Resolves, connects, and completes the version handshake.
///
/// The returned decoder already holds any bytes the server sent after its
/// hello, so nothing is lost between handshake and read loop.
async fn establish(
    host: &str,
    port: u16,
    options: &LinkOptions,
) -> Result<(TcpStream, FrameDecoder), LinkError> {
    let resolved = resolve_dns(host, port)?;

    let mut stream = timeout(options.connect_timeout, TcpStream::connect(resolved))
        .await
        .map_err(|_| LinkError::ConnectionError("connect timed out".to_string()))?
        .map_err(|e| LinkError::ConnectionError(e.to_string()))?;

    stream.set_nodelay(true).map_err(LinkError::IoError)?;

    stream
        .write_all(encode_hello().as_bytes())
        .await
        .map_err(LinkError::IoError)?;

    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 1024];
    let hello = loop {
        if let Some(msg) = decoder.next_message()? {
            break msg;
        }
        let n = timeout(options.read_timeout, stream.read(&mut buf))
            .await
            .map_err(|_| LinkError::Handshake("timed out waiting for server hello".to_string()))?
            .map_err(LinkError::IoError)?;
        if n == 0 {
            return Err(LinkError::Handshake(
                "connection closed during handshake".to_string(),
            ));
        }
        decoder.extend(&buf[..n]);
    };

    match hello {
        Message::Hello { version } if version == PROTOCOL_VERSION => Ok((stream, decoder)),
        Message::Hello { version } => Err(LinkError::Handshake(format!(
            "protocol version mismatch: remote speaks {}, client speaks {}",
            version, PROTOCOL_VERSION
        ))),
        other => Err(LinkError::Handshake(format!(
            "expected hello, got {:?}",
            other
        ))),
    }
}

/// Owns the read half for the lifetime of the session: runs the read loop,
/// fails in-flight requests on disconnect, reconnects with backoff.
async fn supervise(shared: Arc<SessionShared>, read_half: OwnedReadHalf, decoder: FrameDecoder) {
    let mut conn = Some((read_half, decoder));
    loop {
        let (read_half, decoder) = match conn.take() {
            Some(live) => live,
            None => match reconnect(&shared).await {
                Some(live) => live,
                None => return,
            },
        };

        read_loop(&shared, read_half, decoder).await;

        // The connection is gone. Everything in flight dies with it.
        *shared.writer.lock().await = None;
        shared.correlator.fail_all(|| LinkError::ConnectionLost);

        if shared.closed.load(Ordering::SeqCst) {
            let _ = shared.state_tx.send(SessionState::Failed);
            return;
        }
        let _ = shared.state_tx.send(SessionState::Connecting);
    }
}

async fn reconnect(shared: &Arc<SessionShared>) -> Option<(OwnedReadHalf, FrameDecoder)> {
    let max = shared.options.max_reconnect_attempts;
    for attempt in 1..=max {
        if shared.closed.load(Ordering::SeqCst) {
            return None;
        }
        match establish(&shared.host, shared.port, &shared.options).await {
            Ok((stream, decoder)) => {
                let (read_half, write_half) = stream.into_split();
                *shared.writer.lock().await = Some(write_half);
                let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
                let _ = shared.state_tx.send(SessionState::Connected);
                info!(attempt, generation, "reconnected");
                return Some((read_half, decoder));
            }
            Err(e) => {
                warn!(attempt, max, error = %e, "reconnect attempt failed");
                if attempt == max {
                    break;
                }
                let delay = backoff_delay(shared.options.backoff_base, attempt);
                debug!(delay_ms = delay.as_millis() as u64, "backing off");
                let mut state_rx = shared.state_rx.clone();
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = state_rx.wait_for(|s| *s == SessionState::Failed) => return None,
                }
            }
        }
    }

    warn!(max, "reconnect ceiling exhausted; session failed");
    let _ = shared.state_tx.send(SessionState::Failed);
    shared.correlator.fail_all(|| LinkError::ConnectionLost);
    None
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base * (1u32 << (attempt - 1).min(16))
}

async fn read_loop(shared: &Arc<SessionShared>, mut read_half: OwnedReadHalf, mut decoder: FrameDecoder) {
    let mut buf = [0u8; 4096];
    loop {
        loop {
            match decoder.next_message() {
                Ok(Some(msg)) => dispatch(shared, msg),
                Ok(None) => break,
                Err(LinkError::MalformedFrame(reason)) => {
                    warn!(%reason, "skipping malformed frame");
                }
                Err(e) => {
                    warn!(error = %e, "stream corrupted; dropping connection");
                    return;
                }
            }
        }

        let mut state_rx = shared.state_rx.clone();
        tokio::select! {
            _ = state_rx.wait_for(|s| *s == SessionState::Failed) => return,
            read = read_half.read(&mut buf) => match read {
                Ok(0) => {
                    info!("connection closed by remote");
                    return;
                }
                Ok(n) => decoder.extend(&buf[..n]),
                Err(e) => {
                    warn!(error = %e, "read failed");
                    return;
                }
            }
        }
    }
}

// Delivery is serialized through this single task: responses resolve in
// arrival order and the cache sees events before any subscriber does.
fn dispatch(shared: &Arc<SessionShared>, msg: Message) {
    match msg {
        Message::Response(response) => shared.correlator.resolve(response),
        Message::Event(event) => {
            shared.cache.apply_event(&event);
            let _ = shared.events.send(event);
        }
        Message::Hello { version } => {
            warn!(version, "unexpected hello after handshake");
        }
    }
}

pub(crate) fn parse_address(address: &str, default_port: u16) -> Result<(String, u16), LinkError> {
    let (host, port) = if let Some((host, port_str)) = address.split_once(':') {
        let port = port_str
            .parse::<u16>()
            .map_err(|e| LinkError::InvalidPort(e.to_string()))?;
        (host, port)
    } else {
        (address, default_port)
    };
    if host.is_empty() {
        return Err(LinkError::InvalidAddress(address.to_string()));
    }
    Ok((host.to_string(), port))
}

fn resolve_dns(host: &str, port: u16) -> Result<SocketAddr, LinkError> {
    let cache_key = format!("{}:{}", host, port);

    if let Some(entry) = DNS_CACHE.get(&cache_key) {
        let (addr, timestamp) = *entry.value();
        if timestamp
            .elapsed()
            .map(|d| d.as_secs() < DNS_CACHE_TTL)
            .unwrap_or(false)
        {
            return Ok(addr);
        }
    }

    let addrs: Vec<SocketAddr> = format!("{}:{}", host, port)
        .to_socket_addrs()
        .map_err(|e| LinkError::DnsError(e.to_string()))?
        .collect();

    let addr = addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| LinkError::DnsError("No addresses resolved".to_string()))?;

    DNS_CACHE.insert(cache_key, (addr, SystemTime::now()));
    Ok(addr)
}
