//! APRS-IS client for the OGN feed.
//!
//! Logs in with a read-only passcode, sends `#keepalive` periodically and
//! hands every received beacon line to a callback. Server comments (lines
//! starting with `#`) are logged and not forwarded.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{interval_at, sleep, Instant};
use tracing::{debug, info, warn};

use ogn_core::config::FeedConfig;

pub const APRS_SERVER_HOST: &str = "aprs.glidernet.org";
/// Full feed, no server-side filter.
pub const APRS_PORT_FULL: u16 = 10152;
/// Filtered feed.
pub const APRS_PORT_FILTER: u16 = 14580;

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(240);
pub const RETRY_WAIT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("unable to connect to {address} after {attempts} attempt(s): {source}")]
    Exhausted {
        address: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("not connected")]
    NotConnected,

    #[error("connection lost: {0}")]
    Io(#[from] io::Error),
}

struct Session {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    buf: Vec<u8>,
}

enum Event {
    Line(String),
    Keepalive,
    Closed,
    Failed(io::Error),
}

/// Connection to an APRS-IS server.
pub struct AprsClient {
    host: String,
    port: u16,
    user: String,
    passcode: String,
    filter: Option<String>,
    retry_wait: Duration,
    keepalive: Duration,
    session: Option<Session>,
}

impl AprsClient {
    pub fn new(user: &str, passcode: &str) -> Self {
        AprsClient {
            host: APRS_SERVER_HOST.to_string(),
            port: APRS_PORT_FULL,
            user: user.to_string(),
            passcode: passcode.to_string(),
            filter: None,
            retry_wait: RETRY_WAIT,
            keepalive: KEEPALIVE_INTERVAL,
            session: None,
        }
    }

    pub fn from_config(config: &FeedConfig) -> Self {
        let mut client = AprsClient::new(&config.user, &config.passcode).with_server(&config.host, config.port);
        if let Some(filter) = &config.filter {
            client.filter = Some(filter.clone());
        }
        client
    }

    pub fn with_server(mut self, host: &str, port: u16) -> Self {
        self.host = host.to_string();
        self.port = port;
        self
    }

    /// Set a server-side filter and switch to the filter port.
    pub fn with_filter(mut self, filter: &str) -> Self {
        self.filter = Some(filter.to_string());
        self.port = APRS_PORT_FILTER;
        self
    }

    pub fn with_retry_wait(mut self, wait: Duration) -> Self {
        self.retry_wait = wait;
        self
    }

    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive = interval;
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn login_line(&self) -> String {
        let mut line = format!(
            "user {} pass {} vers ogn-basestation {}",
            self.user,
            self.passcode,
            env!("CARGO_PKG_VERSION")
        );
        if let Some(filter) = &self.filter {
            line.push_str(" filter ");
            line.push_str(filter);
        }
        line
    }

    async fn open(&self, address: &str) -> io::Result<Session> {
        let stream = TcpStream::connect(address).await?;
        let (reader, mut writer) = stream.into_split();
        let login = format!("{}\n", self.login_line());
        writer.write_all(login.as_bytes()).await?;
        Ok(Session {
            reader: BufReader::new(reader),
            writer,
            buf: Vec::with_capacity(512),
        })
    }

    /// Connect and log in. `retries` caps the number of attempts; `None`
    /// retries until it succeeds.
    pub async fn connect(&mut self, retries: Option<u32>) -> Result<(), ConnectError> {
        let address = self.address();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            info!(address = %address, attempt, "Connect to OGN");
            match self.open(&address).await {
                Ok(session) => {
                    self.session = Some(session);
                    info!(address = %address, "Connected to OGN");
                    return Ok(());
                }
                Err(e) => {
                    warn!(address = %address, error = %e, "Connect error");
                    if retries.is_some_and(|max| attempt >= max) {
                        return Err(ConnectError::Exhausted {
                            address,
                            attempts: attempt,
                            source: e,
                        });
                    }
                }
            }
            sleep(self.retry_wait).await;
        }
    }

    pub async fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.writer.shutdown().await {
                debug!(error = %e, "error closing OGN connection");
            }
            info!("Disconnected from OGN");
        }
    }

    async fn next_event(&mut self, keepalive: &mut tokio::time::Interval) -> Event {
        let Some(session) = self.session.as_mut() else {
            return Event::Closed;
        };
        let result = tokio::select! {
            _ = keepalive.tick() => return Event::Keepalive,
            result = session.reader.read_until(b'\n', &mut session.buf) => result,
        };
        match result {
            Ok(0) => Event::Closed,
            Ok(_) => {
                let line = String::from_utf8_lossy(&session.buf).trim_end().to_string();
                session.buf.clear();
                Event::Line(line)
            }
            Err(e) => Event::Failed(e),
        }
    }

    /// Read lines until the connection drops. With `autoreconnect` the
    /// client reconnects (retrying forever) and keeps going; otherwise the
    /// loss ends the call.
    pub async fn run<F>(&mut self, mut on_message: F, autoreconnect: bool) -> Result<(), ConnectError>
    where
        F: FnMut(&str),
    {
        let mut keepalive = interval_at(Instant::now() + self.keepalive, self.keepalive);
        loop {
            if self.session.is_none() {
                if !autoreconnect {
                    return Err(ConnectError::NotConnected);
                }
                self.connect(None).await?;
                keepalive.reset();
            }

            match self.next_event(&mut keepalive).await {
                Event::Line(line) => {
                    if line.is_empty() {
                        continue;
                    }
                    if line.starts_with('#') {
                        debug!("Server: {}", line);
                        continue;
                    }
                    on_message(&line);
                }
                Event::Keepalive => {
                    let Some(session) = self.session.as_mut() else {
                        continue;
                    };
                    if let Err(e) = session.writer.write_all(b"#keepalive\n").await {
                        warn!(error = %e, "keepalive failed");
                        self.session = None;
                        if !autoreconnect {
                            return Err(ConnectError::Io(e));
                        }
                    } else {
                        debug!("Sent keepalive");
                    }
                }
                Event::Closed => {
                    warn!("OGN server closed the connection");
                    self.session = None;
                    if !autoreconnect {
                        return Ok(());
                    }
                }
                Event::Failed(e) => {
                    warn!(error = %e, "OGN connection error");
                    self.session = None;
                    if !autoreconnect {
                        return Err(ConnectError::Io(e));
                    }
                }
            }
        }
    }
}

impl std::fmt::Display for AprsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AprsClient({}@{})", self.user, self.address())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
