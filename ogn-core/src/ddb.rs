//! OGN Device Database (DDB) snapshot and aircraft enrichment.
//!
//! A snapshot is built from the DDB JSON download plus an optional
//! registration → ICAO table, and is never modified afterwards; a refresh
//! builds a new snapshot and swaps it in whole.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::debug;

use crate::tracker::Aircraft;
use crate::types::*;

/// Public download location of the OGN DDB in JSON form.
pub const DDB_URL: &str = "https://ddb.glidernet.org/download/?j=1";

/// Length of the transport-type tag in front of the device address
/// (`FLR`, `OGN`, `ICA`, ...).
const DEVICE_PREFIX_LEN: usize = 3;

// ---------------------------------------------------------------------------
// Enrichment seam
// ---------------------------------------------------------------------------

/// Applies external metadata to a freshly created aircraft.
pub trait Enrich {
    fn enrich(&self, aircraft: &mut Aircraft);
}

/// Pass-through used when matched data is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEnrichment;

impl Enrich for NoEnrichment {
    fn enrich(&self, _aircraft: &mut Aircraft) {}
}

// ---------------------------------------------------------------------------
// Key derivation
// ---------------------------------------------------------------------------

/// Hardware address part of a device id: everything after the 3-char prefix.
///
/// `"FLRDDEEFF"` → `Some("DDEEFF")`. Ids too short to carry an address
/// yield `None`.
pub fn device_address(device_id: &str) -> Option<&str> {
    device_id
        .get(DEVICE_PREFIX_LEN..)
        .filter(|addr| !addr.is_empty())
}

/// Trailing six characters of a device id, used as the fallback ICAO field.
pub fn trailing_address(device_id: &str) -> &str {
    let start = device_id.len().saturating_sub(6);
    device_id.get(start..).unwrap_or(device_id)
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// One row of the device database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdbEntry {
    pub registration: Option<String>,
    pub icao: Option<Icao>,
    pub tracked: bool,
    pub competition_number: Option<String>,
}

#[derive(Deserialize)]
struct RawDocument {
    devices: Vec<RawDevice>,
}

#[derive(Deserialize)]
struct RawDevice {
    device_id: String,
    #[serde(default)]
    registration: String,
    #[serde(default)]
    tracked: String,
    #[serde(default)]
    cn: String,
}

#[derive(Deserialize)]
struct RawIcao {
    icao: String,
}

/// Immutable view of the device database.
#[derive(Debug, Clone, Default)]
pub struct DdbSnapshot {
    entries: HashMap<String, DdbEntry>,
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

impl DdbSnapshot {
    /// Build a snapshot from the DDB JSON document and an optional
    /// `{"<registration>": {"icao": "<hex>"}}` table.
    ///
    /// A document without any device is rejected, so a truncated download
    /// never replaces a good snapshot.
    pub fn from_json(devices_json: &str, icao_json: Option<&str>) -> Result<Self> {
        let doc: RawDocument =
            serde_json::from_str(devices_json).map_err(|e| OgnError::Ddb(e.to_string()))?;
        if doc.devices.is_empty() {
            return Err(OgnError::Ddb("no device records found".into()));
        }

        let icao_table: HashMap<String, RawIcao> = match icao_json {
            Some(text) => serde_json::from_str(text).map_err(|e| OgnError::Ddb(e.to_string()))?,
            None => HashMap::new(),
        };

        let mut entries = HashMap::with_capacity(doc.devices.len());
        for dev in doc.devices {
            let registration = non_empty(dev.registration);
            let icao = registration
                .as_deref()
                .and_then(|reg| icao_table.get(reg))
                .and_then(|row| icao_from_hex(row.icao.trim()));
            let entry = DdbEntry {
                registration,
                icao,
                tracked: dev.tracked == "Y",
                competition_number: non_empty(dev.cn),
            };
            entries.insert(dev.device_id.to_ascii_uppercase(), entry);
        }

        Ok(DdbSnapshot { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find the entry for a feed device id (`"FLRDDEEFF"` → key `"DDEEFF"`).
    pub fn lookup(&self, device_id: &str) -> Option<&DdbEntry> {
        let address = device_address(device_id)?;
        self.entries.get(&address.to_ascii_uppercase())
    }
}

impl Enrich for DdbSnapshot {
    fn enrich(&self, aircraft: &mut Aircraft) {
        let Some(entry) = self.lookup(&aircraft.device_id) else {
            debug!(device_id = %aircraft.device_id, "no device database entry");
            return;
        };
        aircraft.registration = entry.registration.clone();
        aircraft.tracking_allowed = entry.tracked;
        aircraft.competition_number = entry.competition_number.clone();
        if let Some(icao) = entry.icao {
            aircraft.icao = Some(icao);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    const DDB_SAMPLE: &str = r#"{"devices":[
        {"device_type":"F","device_id":"DDEEFF","aircraft_model":"ASK-21","registration":"D-KABC","cn":"BC","tracked":"Y","identified":"Y"},
        {"device_type":"F","device_id":"dd1234","aircraft_model":"LS-4","registration":"D-5678","cn":"","tracked":"N","identified":"Y"},
        {"device_type":"O","device_id":"A1B2C3","aircraft_model":"","registration":"","cn":"","tracked":"Y","identified":"N"}
    ]}"#;

    const ICAO_SAMPLE: &str = r#"{"D-KABC":{"icao":"3dd4f1"},"D-5678":{"icao":"not-hex"}}"#;

    #[test]
    fn test_device_address() {
        assert_eq!(device_address("FLRDDEEFF"), Some("DDEEFF"));
        assert_eq!(device_address("FLR"), None);
        assert_eq!(device_address("FL"), None);
    }

    #[test]
    fn test_trailing_address() {
        assert_eq!(trailing_address("FLRDDEEFF"), "DDEEFF");
        assert_eq!(trailing_address("ICA3D1A2B"), "3D1A2B");
        assert_eq!(trailing_address("ABC"), "ABC");
    }

    #[test]
    fn test_from_json() {
        let snap = DdbSnapshot::from_json(DDB_SAMPLE, Some(ICAO_SAMPLE)).unwrap();
        assert_eq!(snap.len(), 3);

        let e = snap.lookup("FLRDDEEFF").unwrap();
        assert_eq!(e.registration.as_deref(), Some("D-KABC"));
        assert_eq!(e.competition_number.as_deref(), Some("BC"));
        assert!(e.tracked);
        assert_eq!(e.icao, Some([0x3D, 0xD4, 0xF1]));
    }

    #[test]
    fn test_lookup_case_insensitive() {
        let snap = DdbSnapshot::from_json(DDB_SAMPLE, None).unwrap();
        assert!(snap.lookup("FLRDD1234").is_some());
        assert!(snap.lookup("flrddeeff").is_some());
    }

    #[test]
    fn test_empty_fields_are_absent() {
        let snap = DdbSnapshot::from_json(DDB_SAMPLE, None).unwrap();
        let e = snap.lookup("OGNA1B2C3").unwrap();
        assert!(e.registration.is_none());
        assert!(e.competition_number.is_none());
    }

    #[test]
    fn test_invalid_icao_ignored() {
        let snap = DdbSnapshot::from_json(DDB_SAMPLE, Some(ICAO_SAMPLE)).unwrap();
        assert!(snap.lookup("FLRDD1234").unwrap().icao.is_none());
    }

    #[test]
    fn test_rejects_empty_and_malformed() {
        assert!(DdbSnapshot::from_json(r#"{"devices":[]}"#, None).is_err());
        assert!(DdbSnapshot::from_json("<html>", None).is_err());
        assert!(DdbSnapshot::from_json(DDB_SAMPLE, Some("[1,2]")).is_err());
    }

    #[test]
    fn test_enrich_matched() {
        let snap = DdbSnapshot::from_json(DDB_SAMPLE, Some(ICAO_SAMPLE)).unwrap();
        let mut ac = Aircraft::new("FLRDDEEFF", Utc::now());
        snap.enrich(&mut ac);
        assert_eq!(ac.registration.as_deref(), Some("D-KABC"));
        assert_eq!(ac.competition_number.as_deref(), Some("BC"));
        assert_eq!(ac.icao_hex().as_deref(), Some("3DD4F1"));
        assert!(ac.tracking_allowed);
    }

    #[test]
    fn test_enrich_not_tracked() {
        let snap = DdbSnapshot::from_json(DDB_SAMPLE, None).unwrap();
        let mut ac = Aircraft::new("FLRDD1234", Utc::now());
        snap.enrich(&mut ac);
        assert!(!ac.tracking_allowed);
    }

    #[test]
    fn test_enrich_unmatched_is_noop() {
        let snap = DdbSnapshot::from_json(DDB_SAMPLE, None).unwrap();
        let mut ac = Aircraft::new("FLR000000", Utc::now());
        snap.enrich(&mut ac);
        assert!(ac.registration.is_none());
        assert!(ac.icao.is_none());
        assert!(ac.tracking_allowed);
    }

    #[test]
    fn test_empty_snapshot_enrich_is_noop() {
        let snap = DdbSnapshot::default();
        let mut ac = Aircraft::new("FLRDDEEFF", Utc::now());
        snap.enrich(&mut ac);
        assert!(ac.registration.is_none());
    }
}
