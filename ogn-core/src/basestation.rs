//! BaseStation (SBS-1) output encoding.
//!
//! Every accepted beacon becomes one `MSG,3` (airborne position) line:
//!
//! ```text
//! MSG,3,,,<icao>,,<date>,<time>,<date>,<time>,<callsign>,<alt ft>,<speed kt>,
//!     <track>,<lat>,<lon>,<vrate fpm>,<squawk>,<alert>,<emergency>,<ident>,<ground>
//! ```
//!
//! Both date/time pairs carry the instant the line was generated, not the
//! beacon time. Absent values are empty fields.

use std::fmt;

use chrono::{Local, NaiveDateTime};

use crate::ddb::trailing_address;
use crate::tracker::Aircraft;
use crate::types::*;

pub const METERS_TO_FEET: f64 = 3.2808;
pub const KMH_PER_KNOT: f64 = 1.852;
pub const MS_TO_FPM: f64 = 196.85;

// Conversions round to the nearest integer, halves away from zero
// (`f64::round`), so 2.5 kt renders as 3 rather than the banker's 2.

pub fn meters_to_feet(m: f64) -> i64 {
    (m * METERS_TO_FEET).round() as i64
}

pub fn kmh_to_knots(kmh: f64) -> i64 {
    (kmh / KMH_PER_KNOT).round() as i64
}

pub fn ms_to_fpm(ms: f64) -> i64 {
    (ms * MS_TO_FPM).round() as i64
}

/// Field values of one `MSG,3` line, already in BaseStation units.
#[derive(Debug, Clone, PartialEq)]
pub struct SbsMessage {
    pub icao: String,
    pub callsign: Option<String>,
    pub altitude_ft: Option<i64>,
    pub ground_speed_kts: Option<i64>,
    pub track_deg: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub vertical_rate_fpm: Option<i64>,
    pub squawk: Option<String>,
    pub alert: bool,
    pub emergency: bool,
    pub ident: bool,
    pub on_ground: bool,
    pub generated: NaiveDateTime,
}

fn opt<T: fmt::Display>(v: &Option<T>) -> String {
    v.as_ref().map(|x| x.to_string()).unwrap_or_default()
}

fn opt_fixed(v: Option<f64>, decimals: usize) -> String {
    v.map(|x| format!("{x:.decimals$}")).unwrap_or_default()
}

impl fmt::Display for SbsMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let date = self.generated.format("%Y/%m/%d");
        let time = self.generated.format("%H:%M:%S%.3f");
        write!(
            f,
            "MSG,3,,,{icao},,{date},{time},{date},{time},{cs},{alt},{spd},{trk},{lat},{lon},{vr},{sq},{a},{e},{i},{g}",
            icao = self.icao,
            cs = opt(&self.callsign),
            alt = opt(&self.altitude_ft),
            spd = opt(&self.ground_speed_kts),
            trk = opt_fixed(self.track_deg, 1),
            lat = opt_fixed(self.latitude, 5),
            lon = opt_fixed(self.longitude, 5),
            vr = opt(&self.vertical_rate_fpm),
            sq = opt(&self.squawk),
            a = self.alert as u8,
            e = self.emergency as u8,
            i = self.ident as u8,
            g = self.on_ground as u8,
        )
    }
}

/// Build the message for a beacon. Pass `aircraft` only when matched
/// (device database) data should be used for ICAO and callsign.
pub fn to_message(beacon: &Beacon, aircraft: Option<&Aircraft>, generated: NaiveDateTime) -> SbsMessage {
    let icao = aircraft
        .and_then(|ac| ac.icao_hex())
        .unwrap_or_else(|| trailing_address(&beacon.device_id).to_string());

    SbsMessage {
        icao,
        callsign: aircraft.and_then(|ac| ac.registration.clone()),
        altitude_ft: beacon.altitude_m.map(meters_to_feet),
        ground_speed_kts: beacon.ground_speed_kmh.map(kmh_to_knots),
        track_deg: beacon.track_deg,
        latitude: beacon.latitude,
        longitude: beacon.longitude,
        vertical_rate_fpm: beacon.climb_rate_ms.map(ms_to_fpm),
        squawk: beacon.squawk.clone(),
        alert: false,
        emergency: false,
        ident: false,
        on_ground: false,
        generated,
    }
}

/// Encode a beacon as one BaseStation line (without the trailing newline).
pub fn encode(beacon: &Beacon, aircraft: Option<&Aircraft>, generated: NaiveDateTime) -> String {
    to_message(beacon, aircraft, generated).to_string()
}

/// [`encode`] stamped with the local wall clock.
pub fn encode_now(beacon: &Beacon, aircraft: Option<&Aircraft>) -> String {
    encode(beacon, aircraft, Local::now().naive_local())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};

    fn generated() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_milli_opt(14, 3, 7, 250)
            .unwrap()
    }

    fn full_beacon() -> Beacon {
        let mut b = Beacon::position(
            "FLRDDEEFF",
            BeaconKind::Flarm,
            Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap(),
        );
        b.latitude = Some(44.256916666);
        b.longitude = Some(6.000533333);
        b.altitude_m = Some(100.0);
        b.ground_speed_kmh = Some(100.0);
        b.track_deg = Some(342.04);
        b.climb_rate_ms = Some(1.0);
        b
    }

    fn matched_aircraft() -> Aircraft {
        let mut ac = Aircraft::new("FLRDDEEFF", Utc::now());
        ac.registration = Some("D-KABC".into());
        ac.set_icao_hex("3DD4F1");
        ac
    }

    #[test]
    fn test_unit_conversions() {
        assert_eq!(meters_to_feet(100.0), 328);
        assert_eq!(kmh_to_knots(100.0), 54);
        assert_eq!(ms_to_fpm(1.0), 197);
        assert_eq!(ms_to_fpm(-2.5), -492);
    }

    #[test]
    fn test_halves_round_away_from_zero() {
        assert_eq!(kmh_to_knots(0.5 * KMH_PER_KNOT), 1);
        assert_eq!(kmh_to_knots(2.5 * KMH_PER_KNOT), 3);
        assert_eq!(ms_to_fpm(-2.5 / MS_TO_FPM), -3);
    }

    #[test]
    fn test_encode_full_line() {
        let line = encode(&full_beacon(), None, generated());
        assert_eq!(
            line,
            "MSG,3,,,DDEEFF,,2024/06/01,14:03:07.250,2024/06/01,14:03:07.250,,328,54,342.0,44.25692,6.00053,197,,0,0,0,0"
        );
    }

    #[test]
    fn test_encode_field_count() {
        let line = encode(&full_beacon(), None, generated());
        assert_eq!(line.split(',').count(), 22);
    }

    #[test]
    fn test_absent_fields_are_empty() {
        let b = Beacon::position(
            "FLRDDEEFF",
            BeaconKind::Flarm,
            Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap(),
        );
        let line = encode(&b, None, generated());
        assert_eq!(
            line,
            "MSG,3,,,DDEEFF,,2024/06/01,14:03:07.250,2024/06/01,14:03:07.250,,,,,,,,,0,0,0,0"
        );
    }

    #[test]
    fn test_matched_data_used() {
        let ac = matched_aircraft();
        let fields: Vec<String> = encode(&full_beacon(), Some(&ac), generated())
            .split(',')
            .map(String::from)
            .collect();
        assert_eq!(fields[4], "3DD4F1");
        assert_eq!(fields[10], "D-KABC");
    }

    #[test]
    fn test_matched_without_icao_falls_back() {
        let mut ac = Aircraft::new("FLRDDEEFF", Utc::now());
        ac.registration = Some("D-KABC".into());
        let fields: Vec<String> = encode(&full_beacon(), Some(&ac), generated())
            .split(',')
            .map(String::from)
            .collect();
        assert_eq!(fields[4], "DDEEFF");
        assert_eq!(fields[10], "D-KABC");
    }

    #[test]
    fn test_unmatched_aircraft_has_blank_callsign() {
        let ac = Aircraft::new("FLRDDEEFF", Utc::now());
        let fields: Vec<String> = encode(&full_beacon(), Some(&ac), generated())
            .split(',')
            .map(String::from)
            .collect();
        assert_eq!(fields[4], "DDEEFF");
        assert_eq!(fields[10], "");
    }

    #[test]
    fn test_squawk_rendered() {
        let mut b = full_beacon();
        b.squawk = Some("7000".into());
        let fields: Vec<String> = encode(&b, None, generated())
            .split(',')
            .map(String::from)
            .collect();
        assert_eq!(fields[17], "7000");
    }

    #[test]
    fn test_encode_deterministic_apart_from_generation_time() {
        let ac = matched_aircraft();
        let a = encode_now(&full_beacon(), Some(&ac));
        let b = encode_now(&full_beacon(), Some(&ac));
        let strip = |line: &str| -> Vec<String> {
            line.split(',')
                .enumerate()
                .filter(|(i, _)| !(6..=9).contains(i))
                .map(|(_, f)| f.to_string())
                .collect()
        };
        assert_eq!(strip(&a), strip(&b));
    }

    #[test]
    fn test_zero_values_are_not_blank() {
        let mut b = full_beacon();
        b.altitude_m = Some(0.0);
        b.ground_speed_kmh = Some(0.0);
        let fields: Vec<String> = encode(&b, None, generated())
            .split(',')
            .map(String::from)
            .collect();
        assert_eq!(fields[11], "0");
        assert_eq!(fields[12], "0");
    }
}
