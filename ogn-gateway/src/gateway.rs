//! Gateway orchestration: APRS feed in, BaseStation lines out.
//!
//! [`Pipeline`] is the synchronous per-beacon path (decode, sweep,
//! validate, fan out). [`Gateway`] adds the upstream connection, the
//! eviction ticker and connect/disconnect of every output.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ogn_core::config::Config;
use ogn_core::{aprs, validate, AircraftRegistry, Beacon, DecodeError, Enrich, NoEnrichment, Verdict};

use crate::aprs_client::{AprsClient, ConnectError};
use crate::ddb::DeviceDatabase;
use crate::sink::Sink;

/// Running totals for the per-beacon path.
#[derive(Debug, Default, Clone, Copy)]
pub struct PipelineStats {
    pub lines: u64,
    pub decode_errors: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub evicted: u64,
}

pub struct Pipeline {
    registry: Arc<Mutex<AircraftRegistry>>,
    ddb: Option<DeviceDatabase>,
    sinks: Vec<Sink>,
    pub stats: PipelineStats,
}

impl Pipeline {
    pub fn new(registry: AircraftRegistry, ddb: Option<DeviceDatabase>, sinks: Vec<Sink>) -> Self {
        Pipeline {
            registry: Arc::new(Mutex::new(registry)),
            ddb,
            sinks,
            stats: PipelineStats::default(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let registry = AircraftRegistry::new(config.tracking.sweep_interval(), config.tracking.timeout());
        let ddb = DeviceDatabase::from_config(&config.ddb);
        let sinks = config.sinks.iter().map(Sink::from_config).collect();
        Pipeline::new(registry, ddb, sinks)
    }

    pub fn registry(&self) -> MutexGuard<'_, AircraftRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ddb(&self) -> Option<&DeviceDatabase> {
        self.ddb.as_ref()
    }

    pub fn sinks(&self) -> &[Sink] {
        &self.sinks
    }

    pub fn sinks_mut(&mut self) -> &mut [Sink] {
        &mut self.sinks
    }

    /// Decode one raw APRS line and process it. Decode failures are logged
    /// and dropped.
    pub fn process_line(&mut self, raw: &str) -> Option<Verdict> {
        self.stats.lines += 1;
        match aprs::parse(raw, Utc::now()) {
            Ok(beacon) => Some(self.process_beacon(&beacon)),
            Err(DecodeError::Comment(_)) => None,
            Err(e) => {
                self.stats.decode_errors += 1;
                debug!(error = %e, raw, "Error decoding beacon");
                None
            }
        }
    }

    pub fn process_beacon(&mut self, beacon: &Beacon) -> Verdict {
        self.process_beacon_at(beacon, Utc::now())
    }

    /// Process a decoded beacon with `now` as the eviction clock.
    pub fn process_beacon_at(&mut self, beacon: &Beacon, now: DateTime<Utc>) -> Verdict {
        let enricher: &dyn Enrich = match &self.ddb {
            Some(db) => db,
            None => &NoEnrichment,
        };

        let verdict = {
            let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(evicted) = registry.sweep_if_due(now) {
                self.stats.evicted += evicted as u64;
                if evicted > 0 {
                    info!(evicted, remaining = registry.len(), "Removed inactive aircraft");
                }
            }
            validate::accept(&mut registry, beacon, enricher)
        };

        match &verdict {
            Verdict::Accepted(aircraft) => {
                self.stats.accepted += 1;
                debug!(device_id = %beacon.device_id, kind = %beacon.beacon_kind, "Accepted beacon");
                for sink in &self.sinks {
                    sink.process(beacon, aircraft);
                }
            }
            Verdict::Rejected(reason) => {
                self.stats.rejected += 1;
                debug!(device_id = %beacon.device_id, %reason, "Discarding beacon");
            }
        }
        verdict
    }

    /// Run eviction sweeps on a timer, independent of beacon arrival.
    pub fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let mut guard = registry.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(evicted) = guard.sweep_if_due(Utc::now()) {
                    if evicted > 0 {
                        info!(evicted, remaining = guard.len(), "Removed inactive aircraft");
                    }
                }
            }
        })
    }
}

/// Upstream feed plus the processing pipeline.
pub struct Gateway {
    upstream: AprsClient,
    pipeline: Pipeline,
    autoreconnect: bool,
    sweeper: Option<JoinHandle<()>>,
}

impl Gateway {
    pub fn new(upstream: AprsClient, pipeline: Pipeline) -> Self {
        Gateway {
            upstream,
            pipeline,
            autoreconnect: true,
            sweeper: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let mut gateway = Gateway::new(AprsClient::from_config(&config.feed), Pipeline::from_config(config));
        gateway.autoreconnect = config.feed.autoreconnect;
        gateway
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn upstream(&self) -> &AprsClient {
        &self.upstream
    }

    /// Load the device database, start every output and the eviction ticker,
    /// then connect upstream (retrying until it succeeds).
    pub async fn connect(&mut self) -> Result<(), ConnectError> {
        if let Some(db) = self.pipeline.ddb() {
            if let Err(e) = db.load().await {
                warn!(error = %e, "device database unavailable, continuing without enrichment");
            }
        }

        for sink in self.pipeline.sinks_mut() {
            info!(sink = %sink, "Starting output");
            sink.connect();
        }

        if self.sweeper.is_none() {
            let period = self
                .pipeline
                .registry()
                .sweep_interval()
                .to_std()
                .unwrap_or(Duration::from_secs(300))
                .max(Duration::from_secs(1));
            self.sweeper = Some(self.pipeline.spawn_sweeper(period));
        }

        self.upstream.connect(None).await
    }

    /// Forward beacons until the upstream connection ends (never, with
    /// autoreconnect).
    pub async fn run(&mut self) -> Result<(), ConnectError> {
        let pipeline = &mut self.pipeline;
        self.upstream
            .run(
                |line| {
                    pipeline.process_line(line);
                },
                self.autoreconnect,
            )
            .await
    }

    /// Close the upstream and every output. Best effort: never fails.
    pub async fn disconnect(&mut self) {
        self.upstream.disconnect().await;
        for sink in self.pipeline.sinks_mut() {
            sink.disconnect().await;
        }
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
        let stats = self.pipeline.stats;
        info!(
            lines = stats.lines,
            accepted = stats.accepted,
            rejected = stats.rejected,
            decode_errors = stats.decode_errors,
            "Gateway stopped"
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
