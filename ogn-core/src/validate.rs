//! Decide whether a decoded beacon is forwarded.
//!
//! The validator is the only place that moves `Aircraft::last_seen`. It acts
//! as a per-device ordering gate over a feed that may deliver duplicates or
//! reorder reports from different receivers: a beacon older than the last
//! accepted one is dropped so that position trails never jump backwards.

use crate::ddb::Enrich;
use crate::tracker::{Aircraft, AircraftRegistry};
use crate::types::*;

/// Why a beacon was not forwarded. These are expected outcomes, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Status or other non-position message.
    NotPosition,
    /// Receiver telemetry or an unclassified source.
    NotAircraft(BeaconKind),
    /// The device owner opted out of tracking in the device database.
    TrackingNotAllowed,
    /// Timestamp strictly older than the last accepted beacon.
    Stale,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::NotPosition => write!(f, "not a position message"),
            Rejection::NotAircraft(kind) => write!(f, "not an aircraft beacon ({kind})"),
            Rejection::TrackingNotAllowed => write!(f, "tracking not allowed"),
            Rejection::Stale => write!(f, "older than last accepted beacon"),
        }
    }
}

/// Outcome of [`accept`].
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// The beacon is fresh; carries the aircraft state after the update.
    Accepted(Aircraft),
    Rejected(Rejection),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted(_))
    }
}

/// Run a beacon through the type filter, opt-out gate and freshness gate.
pub fn accept(registry: &mut AircraftRegistry, beacon: &Beacon, enricher: &dyn Enrich) -> Verdict {
    if beacon.message_kind != MessageKind::Position {
        return Verdict::Rejected(Rejection::NotPosition);
    }
    if !beacon.beacon_kind.is_aircraft() {
        return Verdict::Rejected(Rejection::NotAircraft(beacon.beacon_kind));
    }

    let (aircraft, _created) = registry.get_or_create(&beacon.device_id, beacon.timestamp, enricher);

    if !aircraft.tracking_allowed {
        return Verdict::Rejected(Rejection::TrackingNotAllowed);
    }
    if !aircraft.is_not_older(beacon.timestamp) {
        return Verdict::Rejected(Rejection::Stale);
    }

    aircraft.last_seen = beacon.timestamp;
    Verdict::Accepted(aircraft.clone())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
