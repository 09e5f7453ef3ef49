//! Per-aircraft state keyed by OGN device id.
//!
//! Pure logic, no I/O. The registry creates an [`Aircraft`] on the first
//! beacon from an unseen device, enriches it once from the device database,
//! and forgets it again after a period of inactivity.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::ddb::Enrich;
use crate::types::*;

/// Default interval between eviction sweeps.
pub const SWEEP_INTERVAL_SECS: i64 = 5 * 60;

/// Default inactivity after which an aircraft is evicted.
pub const INACTIVITY_TIMEOUT_SECS: i64 = 10 * 60;

// ---------------------------------------------------------------------------
// Aircraft state
// ---------------------------------------------------------------------------

/// Mutable state for a single tracked aircraft.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Aircraft {
    pub device_id: String,
    pub last_seen: DateTime<Utc>,
    pub icao: Option<Icao>,
    pub registration: Option<String>,
    pub competition_number: Option<String>,
    pub tracking_allowed: bool,
}

impl Aircraft {
    pub fn new(device_id: &str, timestamp: DateTime<Utc>) -> Self {
        Aircraft {
            device_id: device_id.to_string(),
            last_seen: timestamp,
            icao: None,
            registration: None,
            competition_number: None,
            tracking_allowed: true,
        }
    }

    /// Set the ICAO address from a hex string. Anything other than exactly
    /// six hex digits is refused and leaves the current value alone.
    pub fn set_icao_hex(&mut self, hex: &str) -> bool {
        match icao_from_hex(hex) {
            Some(icao) => {
                self.icao = Some(icao);
                true
            }
            None => false,
        }
    }

    pub fn icao_hex(&self) -> Option<String> {
        self.icao.as_ref().map(icao_to_string)
    }

    /// A beacon stamped at or after `last_seen` is not older than what we have.
    pub fn is_not_older(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.last_seen
    }

    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.last_seen < now - timeout
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// All aircraft currently known to the gateway.
pub struct AircraftRegistry {
    aircraft: HashMap<String, Aircraft>,
    sweep_interval: Duration,
    timeout: Duration,
    last_sweep: Option<DateTime<Utc>>,

    // Counters
    pub created: u64,
    pub evicted: u64,
}

impl Default for AircraftRegistry {
    fn default() -> Self {
        AircraftRegistry::new(
            Duration::seconds(SWEEP_INTERVAL_SECS),
            Duration::seconds(INACTIVITY_TIMEOUT_SECS),
        )
    }
}

impl AircraftRegistry {
    pub fn new(sweep_interval: Duration, timeout: Duration) -> Self {
        AircraftRegistry {
            aircraft: HashMap::new(),
            sweep_interval,
            timeout,
            last_sweep: None,
            created: 0,
            evicted: 0,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    pub fn len(&self) -> usize {
        self.aircraft.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aircraft.is_empty()
    }

    pub fn find(&self, device_id: &str) -> Option<&Aircraft> {
        self.aircraft.get(device_id)
    }

    /// Look up an aircraft, creating and enriching it on first sight.
    ///
    /// Returns the aircraft and whether it was created by this call.
    pub fn get_or_create(
        &mut self,
        device_id: &str,
        timestamp: DateTime<Utc>,
        enricher: &dyn Enrich,
    ) -> (&mut Aircraft, bool) {
        let mut created = false;
        let aircraft = self
            .aircraft
            .entry(device_id.to_string())
            .or_insert_with(|| {
                created = true;
                let mut ac = Aircraft::new(device_id, timestamp);
                enricher.enrich(&mut ac);
                ac
            });
        if created {
            self.created += 1;
        }
        (aircraft, created)
    }

    /// Remove every aircraft not seen since `now - timeout`. Returns count removed.
    pub fn evict_older_than(&mut self, now: DateTime<Utc>, timeout: Duration) -> usize {
        let stale: Vec<String> = self
            .aircraft
            .iter()
            .filter(|(_, ac)| ac.is_stale(now, timeout))
            .map(|(k, _)| k.clone())
            .collect();
        let count = stale.len();
        for k in stale {
            self.aircraft.remove(&k);
        }
        self.evicted += count as u64;
        count
    }

    /// Run an eviction sweep when the sweep interval has elapsed.
    ///
    /// The first call only arms the schedule.
    pub fn sweep_if_due(&mut self, now: DateTime<Utc>) -> Option<usize> {
        match self.last_sweep {
            Some(last) if now - last < self.sweep_interval => None,
            Some(_) => {
                self.last_sweep = Some(now);
                Some(self.evict_older_than(now, self.timeout))
            }
            None => {
                self.last_sweep = Some(now);
                None
            }
        }
    }

    /// All aircraft, most recently seen first.
    pub fn snapshot(&self) -> Vec<&Aircraft> {
        let mut all: Vec<_> = self.aircraft.values().collect();
        all.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        all
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
