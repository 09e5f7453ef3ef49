//! Shared types, error enums, and the decoded beacon record for ogn-core.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// All errors produced by ogn-core.
#[derive(Debug, Error)]
pub enum OgnError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("device database error: {0}")]
    Ddb(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, OgnError>;

/// Reasons a raw APRS line could not be turned into a [`Beacon`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("empty line")]
    Empty,
    #[error("server comment: {0}")]
    Comment(String),
    #[error("missing APRS header in {0:?}")]
    MissingHeader(String),
    #[error("unsupported APRS body: {0:?}")]
    UnsupportedBody(String),
    #[error("invalid timestamp: {0:?}")]
    BadTimestamp(String),
    #[error("invalid position: {0:?}")]
    BadPosition(String),
}

// ---------------------------------------------------------------------------
// ICAO address helpers
// ---------------------------------------------------------------------------

/// 3-byte ICAO address. Only ever built from exactly six hex digits.
pub type Icao = [u8; 3];

/// Format ICAO address as 6-char uppercase hex string.
pub fn icao_to_string(icao: &Icao) -> String {
    format!("{:02X}{:02X}{:02X}", icao[0], icao[1], icao[2])
}

/// Parse a 6-char hex string into an ICAO address.
pub fn icao_from_hex(hex: &str) -> Option<Icao> {
    if hex.len() != 6 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let val = u32::from_str_radix(hex, 16).ok()?;
    Some([
        ((val >> 16) & 0xFF) as u8,
        ((val >> 8) & 0xFF) as u8,
        (val & 0xFF) as u8,
    ])
}

// ---------------------------------------------------------------------------
// Beacon record
// ---------------------------------------------------------------------------

/// APRS message class of a beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Position,
    Status,
}

/// Origin of a beacon, derived from the APRS destination call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BeaconKind {
    Flarm,
    Tracker,
    Fanet,
    Spot,
    Spider,
    Skylines,
    Lt24,
    Naviter,
    PilotAware,
    Flymaster,
    Capturs,
    Inreach,
    AprsAircraft,
    Receiver,
    AprsReceiver,
    Unknown,
}

impl BeaconKind {
    /// Receiver telemetry and unclassified sources never describe an aircraft.
    pub fn is_aircraft(self) -> bool {
        !matches!(
            self,
            BeaconKind::Receiver | BeaconKind::AprsReceiver | BeaconKind::Unknown
        )
    }
}

impl std::fmt::Display for BeaconKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BeaconKind::Flarm => "flarm",
            BeaconKind::Tracker => "tracker",
            BeaconKind::Fanet => "fanet",
            BeaconKind::Spot => "spot",
            BeaconKind::Spider => "spider",
            BeaconKind::Skylines => "skylines",
            BeaconKind::Lt24 => "lt24",
            BeaconKind::Naviter => "naviter",
            BeaconKind::PilotAware => "pilot_aware",
            BeaconKind::Flymaster => "flymaster",
            BeaconKind::Capturs => "capturs",
            BeaconKind::Inreach => "inreach",
            BeaconKind::AprsAircraft => "aprs_aircraft",
            BeaconKind::Receiver => "receiver",
            BeaconKind::AprsReceiver => "aprs_receiver",
            BeaconKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// One decoded report from the tracking feed. Units are metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Beacon {
    pub device_id: String,
    pub message_kind: MessageKind,
    pub beacon_kind: BeaconKind,
    pub timestamp: DateTime<Utc>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude_m: Option<f64>,
    pub ground_speed_kmh: Option<f64>,
    pub track_deg: Option<f64>,
    pub climb_rate_ms: Option<f64>,
    pub squawk: Option<String>,
}

impl Beacon {
    /// A position beacon with no optional fields set.
    pub fn position(device_id: &str, beacon_kind: BeaconKind, timestamp: DateTime<Utc>) -> Self {
        Beacon {
            device_id: device_id.to_string(),
            message_kind: MessageKind::Position,
            beacon_kind,
            timestamp,
            latitude: None,
            longitude: None,
            altitude_m: None,
            ground_speed_kmh: None,
            track_deg: None,
            climb_rate_ms: None,
            squawk: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
