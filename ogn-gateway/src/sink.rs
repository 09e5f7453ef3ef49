//! BaseStation outputs.
//!
//! Each output runs in its own task fed by a bounded queue, so a slow or
//! reconnecting consumer never holds up the APRS read loop or any other
//! output. Lines leave a sink in the order they were queued.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use ogn_core::basestation;
use ogn_core::config::SinkConfig;
use ogn_core::{Aircraft, Beacon, SinkFilter};

/// Connection state of one output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Reconnect and queueing behaviour of a sink.
#[derive(Debug, Clone)]
pub struct SinkOptions {
    pub retry_delay: Duration,
    /// `None` retries forever.
    pub max_retries: Option<u32>,
    pub queue: usize,
}

impl Default for SinkOptions {
    fn default() -> Self {
        SinkOptions {
            retry_delay: Duration::from_secs(5),
            max_retries: None,
            queue: 1024,
        }
    }
}

/// Delivery counters, shared with the worker task.
#[derive(Debug, Default)]
pub struct SinkStats {
    pub sent: AtomicU64,
    pub dropped: AtomicU64,
    pub filtered: AtomicU64,
}

struct Worker {
    tx: mpsc::Sender<String>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// One downstream BaseStation consumer.
pub struct Sink {
    name: String,
    address: String,
    filter: SinkFilter,
    matched_data: bool,
    options: SinkOptions,
    state: Arc<watch::Sender<SinkState>>,
    stats: Arc<SinkStats>,
    worker: Option<Worker>,
}

impl Sink {
    pub fn new(name: &str, address: &str, filter: SinkFilter, matched_data: bool) -> Self {
        Sink::with_options(name, address, filter, matched_data, SinkOptions::default())
    }

    pub fn with_options(
        name: &str,
        address: &str,
        filter: SinkFilter,
        matched_data: bool,
        options: SinkOptions,
    ) -> Self {
        let (state, _) = watch::channel(SinkState::Disconnected);
        Sink {
            name: name.to_string(),
            address: address.to_string(),
            filter,
            matched_data,
            options,
            state: Arc::new(state),
            stats: Arc::new(SinkStats::default()),
            worker: None,
        }
    }

    pub fn from_config(config: &SinkConfig) -> Self {
        let options = SinkOptions {
            retry_delay: Duration::from_secs(config.retry_secs),
            max_retries: config.max_retries,
            queue: config.queue,
        };
        Sink::with_options(
            &config.name,
            &config.address(),
            config.filter(),
            config.matched_data,
            options,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> SinkState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SinkState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> &SinkStats {
        &self.stats
    }

    /// Whether the worker task is alive (it stops after `disconnect` or
    /// when a retry cap is exhausted).
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.task.is_finished())
    }

    /// Start the worker. It connects in the background, retrying with the
    /// configured delay, and then drains the queue.
    pub fn connect(&mut self) {
        if self.is_running() {
            return;
        }
        let (tx, rx) = mpsc::channel(self.options.queue.max(1));
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.connection().run(rx, shutdown_rx));
        self.worker = Some(Worker { tx, shutdown, task });
    }

    fn connection(&self) -> SinkConnection {
        SinkConnection {
            name: self.name.clone(),
            address: self.address.clone(),
            options: self.options.clone(),
            state: Arc::clone(&self.state),
            stats: Arc::clone(&self.stats),
        }
    }

    /// Stop the worker and close the connection. Queued lines are dropped.
    pub async fn disconnect(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = worker.shutdown.send(());
        if let Err(e) = worker.task.await {
            warn!(sink = %self.name, error = %e, "sink worker ended abnormally");
        }
        self.state.send_replace(SinkState::Disconnected);
        info!(sink = %self.name, "Disconnected");
    }

    /// The output's predicate over an accepted beacon.
    pub fn accepts(&self, beacon: &Beacon, aircraft: &Aircraft) -> bool {
        self.filter.accepts(beacon, aircraft)
    }

    /// Queue one line. Never waits: a full queue drops the line.
    pub fn send(&self, line: String) -> bool {
        let Some(worker) = &self.worker else {
            debug!(sink = %self.name, "not connected, dropping line");
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        match worker.tx.try_send(line) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(sink = %self.name, "output queue full, dropping line");
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Filter, encode and queue an accepted beacon. Returns whether it was queued.
    pub fn process(&self, beacon: &Beacon, aircraft: &Aircraft) -> bool {
        if !self.accepts(beacon, aircraft) {
            self.stats.filtered.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let matched = self.matched_data.then_some(aircraft);
        self.send(basestation::encode_now(beacon, matched))
    }
}

impl std::fmt::Display for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

// ---------------------------------------------------------------------------
// Worker task
// ---------------------------------------------------------------------------

/// Why a connection stopped serving the queue.
enum Served {
    /// Write failure or peer close; reconnect.
    Lost,
    /// Shutdown requested or the queue closed.
    Stopped,
}

struct SinkConnection {
    name: String,
    address: String,
    options: SinkOptions,
    state: Arc<watch::Sender<SinkState>>,
    stats: Arc<SinkStats>,
}

impl SinkConnection {
    fn set_state(&self, state: SinkState) {
        self.state.send_replace(state);
    }

    /// Connect, retrying with a fixed delay. `None` when the retry cap is hit.
    async fn connect_with_retry(&self) -> Option<TcpStream> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.set_state(SinkState::Connecting);
            info!(sink = %self.name, address = %self.address, attempt, "Attempting to connect");

            match TcpStream::connect(&self.address).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    self.set_state(SinkState::Connected);
                    info!(sink = %self.name, "Connection successful");
                    return Some(stream);
                }
                Err(e) => {
                    self.set_state(SinkState::Disconnected);
                    warn!(sink = %self.name, address = %self.address, error = %e, "Unable to connect");
                }
            }

            if self.options.max_retries.is_some_and(|max| attempt >= max) {
                error!(sink = %self.name, attempts = attempt, "giving up on output");
                return None;
            }
            tokio::time::sleep(self.options.retry_delay).await;
        }
    }

    /// Run the output loop until shutdown, the queue closes, or the retry
    /// cap is exhausted.
    async fn run(self, mut rx: mpsc::Receiver<String>, mut shutdown_rx: oneshot::Receiver<()>) {
        loop {
            let stream = tokio::select! {
                _ = &mut shutdown_rx => break,
                stream = self.connect_with_retry() => match stream {
                    Some(s) => s,
                    None => break,
                },
            };
            let (mut reader, mut writer) = stream.into_split();
            match self.serve(&mut reader, &mut writer, &mut rx, &mut shutdown_rx).await {
                Served::Lost => continue,
                Served::Stopped => break,
            }
        }

        self.set_state(SinkState::Disconnected);
        debug!(sink = %self.name, "output worker stopped");
    }

    /// Drain the queue into one established connection. A line whose write
    /// fails is dropped; the lines queued behind it wait for the next
    /// connection.
    async fn serve<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        rx: &mut mpsc::Receiver<String>,
        shutdown_rx: &mut oneshot::Receiver<()>,
    ) -> Served
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = [0u8; 512];
        loop {
            tokio::select! {
                _ = &mut *shutdown_rx => return Served::Stopped,

                line = rx.recv() => {
                    let Some(line) = line else { return Served::Stopped };
                    debug!(sink = %self.name, "Sending: {}", line);
                    let mut data = line.into_bytes();
                    data.push(b'\n');
                    match writer.write_all(&data).await {
                        Ok(()) => {
                            self.stats.sent.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            warn!(sink = %self.name, error = %e, "Unable to send message");
                            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                            self.set_state(SinkState::Disconnected);
                            return Served::Lost;
                        }
                    }
                }

                // Consumers don't talk back; a read only tells us the peer went away
                result = reader.read(&mut buf) => match result {
                    Ok(0) | Err(_) => {
                        warn!(sink = %self.name, "connection closed by peer");
                        self.set_state(SinkState::Disconnected);
                        return Served::Lost;
                    }
                    Ok(n) => debug!(sink = %self.name, "ignoring {} bytes from consumer", n),
                },
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
