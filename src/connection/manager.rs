//! Persistent device connection with automatic reconnection and reply correlation

use anyhow::{anyhow, Result};
use commander_shared::codec::{self, FrameDecoder};
use commander_shared::Envelope;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::transport::{Connection, TransportError};

/// Configuration for connection manager
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Device endpoint address
    pub server_addr: String,
    pub connect_timeout: Duration,
    /// Reconnection delay (initial)
    pub reconnect_delay: Duration,
    /// Maximum reconnection delay
    pub max_reconnect_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            server_addr: commander_shared::defaults::SERVER_ADDR.into(),
            connect_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
        }
    }
}

/// Requests awaiting a reply, keyed by correlation id
#[derive(Clone, Default)]
pub struct PendingReplies {
    inner: Arc<Mutex<HashMap<u64, oneshot::Sender<Envelope>>>>,
}

impl PendingReplies {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Envelope>>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, correlation_id: u64) -> oneshot::Receiver<Envelope> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(correlation_id, tx);
        rx
    }

    /// Hand a reply to whoever registered its correlation id
    ///
    /// Returns false when nobody is waiting for it.
    pub fn complete(&self, reply: Envelope) -> bool {
        let Some(id) = reply.correlation_id() else {
            return false;
        };
        match self.lock().remove(&id) {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    pub fn cancel(&self, correlation_id: u64) {
        self.lock().remove(&correlation_id);
    }

    /// Drop every waiter; their receivers resolve with an error
    pub fn fail_all(&self) -> usize {
        let mut pending = self.lock();
        let count = pending.len();
        pending.clear();
        count
    }

    /// Whether a request with this id is still waiting for its reply
    pub fn contains(&self, correlation_id: u64) -> bool {
        self.lock().contains_key(&correlation_id)
    }
}

/// Sending side of the connection, handed to request sessions
#[derive(Clone)]
pub struct RequestLink {
    outbound_tx: mpsc::Sender<Envelope>,
    pending: PendingReplies,
    correlation_id: Arc<AtomicU64>,
}

impl RequestLink {
    pub fn next_correlation_id(&self) -> u64 {
        self.correlation_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Queue a request and return the receiver its reply will arrive on
    pub async fn exchange(
        &self,
        request: Envelope,
    ) -> Result<oneshot::Receiver<Envelope>, TransportError> {
        let id = request
            .correlation_id()
            .ok_or_else(|| TransportError::Protocol("request has no header".into()))?;

        let reply = self.pending.register(id);
        if self.outbound_tx.send(request).await.is_err() {
            self.pending.cancel(id);
            return Err(TransportError::Send("connection task is not running".into()));
        }
        Ok(reply)
    }

    /// Stop waiting for a reply (e.g. after a timeout)
    pub fn abandon(&self, correlation_id: u64) {
        self.pending.cancel(correlation_id);
    }
}

/// Owns the background connection task for one device endpoint
pub struct ConnectionManager {
    link: RequestLink,
    task: JoinHandle<()>,
}

impl ConnectionManager {
    /// Open the first connection and start the connection loop
    ///
    /// Reconnects after this point are announced on `reconnects`.
    pub async fn connect(
        config: ConnectionConfig,
        reconnects: broadcast::Sender<Connection>,
    ) -> Result<(Self, Connection), TransportError> {
        let stream = open(&config)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let connection = Connection {
            epoch: 1,
            peer: config.server_addr.clone(),
        };
        info!("[CONN] Connected to {}", config.server_addr);

        let (outbound_tx, outbound_rx) = mpsc::channel::<Envelope>(100);
        let pending = PendingReplies::default();

        let task = tokio::spawn(connection_loop(
            stream,
            config,
            outbound_rx,
            pending.clone(),
            reconnects,
        ));

        let link = RequestLink {
            outbound_tx,
            pending,
            correlation_id: Arc::new(AtomicU64::new(0)),
        };

        Ok((Self { link, task }, connection))
    }

    pub fn link(&self) -> RequestLink {
        self.link.clone()
    }

    /// Stop the connection task and fail everything still waiting
    pub fn shutdown(&self) {
        self.task.abort();
        let abandoned = self.link.pending.fail_all();
        if abandoned > 0 {
            debug!("[CONN] Shutdown dropped {} pending request(s)", abandoned);
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn open(config: &ConnectionConfig) -> Result<TcpStream> {
    match timeout(config.connect_timeout, TcpStream::connect(&config.server_addr)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => Err(anyhow!("{}: {}", config.server_addr, e)),
        Err(_) => Err(anyhow!(
            "{}: connect timed out after {:?}",
            config.server_addr,
            config.connect_timeout
        )),
    }
}

/// Main connection loop with reconnection logic
async fn connection_loop(
    mut stream: TcpStream,
    config: ConnectionConfig,
    mut outbound_rx: mpsc::Receiver<Envelope>,
    pending: PendingReplies,
    reconnects: broadcast::Sender<Connection>,
) {
    let mut epoch = 1;

    loop {
        match handle_connection(stream, &mut outbound_rx, &pending).await {
            Ok(()) => {
                debug!("[CONN] Outbound channel closed, stopping");
                pending.fail_all();
                return;
            }
            Err(reason) => {
                warn!("[CONN] Disconnected from {} (epoch {}): {}", config.server_addr, epoch, reason);
            }
        }

        let abandoned = pending.fail_all();
        if abandoned > 0 {
            warn!("[CONN] {} pending request(s) lost with the connection", abandoned);
        }

        stream = reconnect(&config).await;
        epoch += 1;
        info!("[CONN] Reconnected to {} (epoch {})", config.server_addr, epoch);

        // No subscribers is fine; nobody cares about this epoch yet
        let _ = reconnects.send(Connection {
            epoch,
            peer: config.server_addr.clone(),
        });
    }
}

/// Retry until connected, with exponential backoff
async fn reconnect(config: &ConnectionConfig) -> TcpStream {
    let mut delay = config.reconnect_delay;

    loop {
        tokio::time::sleep(delay).await;

        match open(config).await {
            Ok(stream) => return stream,
            Err(e) => {
                delay = std::cmp::min(delay * 2, config.max_reconnect_delay);
                warn!("[CONN] Reconnect failed: {} (next attempt in {:?})", e, delay);
            }
        }
    }
}

/// Pump one live connection until it fails or the outbound side is dropped
async fn handle_connection(
    stream: TcpStream,
    outbound_rx: &mut mpsc::Receiver<Envelope>,
    pending: &PendingReplies,
) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    let mut decoder = FrameDecoder::new();
    let mut read_buf = vec![0u8; 4096];

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                let Some(envelope) = outbound else {
                    return Ok(());
                };
                // Requests queued while disconnected may have timed out already
                match envelope.correlation_id() {
                    Some(id) if pending.contains(id) => {}
                    id => {
                        debug!("[CONN] Discarding abandoned request: correlation_id={:?}", id);
                        continue;
                    }
                }
                let encoded = codec::encode(&envelope)?;
                writer.write_all(&encoded).await?;
            }

            read = reader.read(&mut read_buf) => {
                let n = read?;
                if n == 0 {
                    return Err(anyhow!("Device closed connection"));
                }
                decoder.extend(&read_buf[..n]);

                while let Some(reply) = decoder.decode_next()? {
                    let id = reply.correlation_id();
                    if !pending.complete(reply) {
                        debug!("[CONN] Dropping reply with no waiter: correlation_id={:?}", id);
                    }
                }
            }
        }
    }
}
