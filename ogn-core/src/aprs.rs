//! Decode OGN APRS lines into [`Beacon`] records.
//!
//! Handles the subset of the OGN flavour of APRS that the gateway needs:
//! - `CALL>DEST,PATH:/hhmmssh...` position reports (`/` or `@` body)
//! - `CALL>DEST,PATH:>hhmmssh...` status reports
//! - `#...` server comments (reported as [`DecodeError::Comment`])
//!
//! Values are converted to metric on the way in: feet → metres, knots →
//! km/h, feet per minute → metres per second.

use chrono::{DateTime, Duration, NaiveTime, Utc};

use crate::types::{Beacon, BeaconKind, DecodeError, MessageKind};

const FEET_TO_M: f64 = 0.3048;
const KNOTS_TO_KMH: f64 = 1.852;
const FPM_TO_MS: f64 = 0.00508;

/// Destination calls (tocalls) used by OGN sources.
const DESTINATIONS: &[(&str, BeaconKind)] = &[
    ("OGFLR", BeaconKind::Flarm),
    ("OGNTRK", BeaconKind::Tracker),
    ("OGNFNT", BeaconKind::Fanet),
    ("OGSPOT", BeaconKind::Spot),
    ("OGSPID", BeaconKind::Spider),
    ("OGSKYL", BeaconKind::Skylines),
    ("OGLT24", BeaconKind::Lt24),
    ("OGNAVI", BeaconKind::Naviter),
    ("OGPAW", BeaconKind::PilotAware),
    ("OGFLYM", BeaconKind::Flymaster),
    ("OGCAPT", BeaconKind::Capturs),
    ("OGINREACH", BeaconKind::Inreach),
    ("OGNSDR", BeaconKind::Receiver),
];

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

struct Header<'a> {
    source: &'a str,
    destination: &'a str,
    path: &'a str,
}

fn split_header(raw: &str) -> Result<(Header<'_>, &str), DecodeError> {
    let missing = || DecodeError::MissingHeader(raw.to_string());

    let (head, body) = raw.split_once(':').ok_or_else(missing)?;
    let (source, rest) = head.split_once('>').ok_or_else(missing)?;
    let (destination, path) = rest.split_once(',').unwrap_or((rest, ""));

    if source.is_empty() || destination.is_empty() {
        return Err(missing());
    }

    Ok((
        Header {
            source,
            destination,
            path,
        },
        body,
    ))
}

/// Classify the sender from its destination call and digipeater path.
pub fn classify(destination: &str, path: &str) -> BeaconKind {
    if let Some((_, kind)) = DESTINATIONS.iter().find(|(d, _)| *d == destination) {
        return *kind;
    }
    if destination == "APRS" {
        // Receivers inject via the GLIDERN servers over TCPIP; aircraft via qAS
        if path.contains("GLIDERN") || path.contains("TCPIP") {
            return BeaconKind::AprsReceiver;
        }
        return BeaconKind::AprsAircraft;
    }
    BeaconKind::Unknown
}

// ---------------------------------------------------------------------------
// Field decoders
// ---------------------------------------------------------------------------

/// Decode an `hhmmssh` timestamp, anchored to the day of `reference`.
///
/// A result more than 12 hours away from the reference is moved by one day,
/// so a beacon stamped 23:59:58 that arrives at 00:00:01 lands on the
/// previous day.
pub fn decode_timestamp(field: &str, reference: DateTime<Utc>) -> Result<DateTime<Utc>, DecodeError> {
    let bad = || DecodeError::BadTimestamp(field.to_string());

    let digits = field.strip_suffix('h').ok_or_else(bad)?;
    if digits.len() != 6 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad());
    }
    let time = NaiveTime::parse_from_str(digits, "%H%M%S").map_err(|_| bad())?;
    let candidate = reference.date_naive().and_time(time).and_utc();

    if candidate - reference > Duration::hours(12) {
        Ok(candidate - Duration::days(1))
    } else if reference - candidate > Duration::hours(12) {
        Ok(candidate + Duration::days(1))
    } else {
        Ok(candidate)
    }
}

/// Decode `DDMM.mmN` / `DDDMM.mmE` into signed decimal degrees.
fn decode_coordinate(field: &str, degree_digits: usize, hemispheres: (char, char)) -> Option<f64> {
    let hemisphere = field.chars().last()?;
    let number = field.get(..field.len() - 1)?;
    let degrees: f64 = number.get(..degree_digits)?.parse().ok()?;
    let minutes: f64 = number.get(degree_digits..)?.parse().ok()?;
    if minutes >= 60.0 {
        return None;
    }
    let value = degrees + minutes / 60.0;
    match hemisphere {
        h if h == hemispheres.0 => Some(value),
        h if h == hemispheres.1 => Some(-value),
        _ => None,
    }
}

/// Parse the `!Wab!` precision enhancement into extra thousandths of a minute.
fn decode_precision(comment: &str) -> Option<(f64, f64)> {
    let start = comment.find("!W")?;
    let field = comment.get(start + 2..start + 5)?;
    let mut chars = field.chars();
    let lat = chars.next()?.to_digit(10)?;
    let lon = chars.next()?.to_digit(10)?;
    if chars.next()? != '!' {
        return None;
    }
    Some((lat as f64 / 1000.0, lon as f64 / 1000.0))
}

fn decode_climb_rate(comment: &str) -> Option<f64> {
    comment
        .split_whitespace()
        .find_map(|tok| tok.strip_suffix("fpm"))
        .and_then(|v| v.parse::<f64>().ok())
        .map(|fpm| fpm * FPM_TO_MS)
}

// ---------------------------------------------------------------------------
// Body decoders
// ---------------------------------------------------------------------------

fn decode_position(
    header: &Header<'_>,
    body: &str,
    reference: DateTime<Utc>,
) -> Result<Beacon, DecodeError> {
    let bad = || DecodeError::BadPosition(body.to_string());

    // hhmmssh + lat(8) + table + lon(9) + symbol
    let timestamp = decode_timestamp(body.get(0..7).ok_or_else(bad)?, reference)?;
    let lat_field = body.get(7..15).ok_or_else(bad)?;
    let lon_field = body.get(16..25).ok_or_else(bad)?;
    let symbol_code = body.get(25..26).ok_or_else(bad)?;
    let mut rest = body.get(26..).unwrap_or("");

    let mut latitude = decode_coordinate(lat_field, 2, ('N', 'S')).ok_or_else(bad)?;
    let mut longitude = decode_coordinate(lon_field, 3, ('E', 'W')).ok_or_else(bad)?;

    let mut kind = classify(header.destination, header.path);
    // Old-style APRS receivers are only recognisable by the house symbol
    if kind == BeaconKind::AprsAircraft && symbol_code == "&" {
        kind = BeaconKind::AprsReceiver;
    }

    let mut track_deg = None;
    let mut ground_speed_kmh = None;
    if let Some((course, speed)) = rest.get(0..3).zip(rest.get(3..7)) {
        if let (Some(speed), Ok(course)) = (speed.strip_prefix('/'), course.parse::<f64>()) {
            if let Ok(knots) = speed.parse::<f64>() {
                track_deg = Some(course);
                ground_speed_kmh = Some(knots * KNOTS_TO_KMH);
                rest = &rest[7..];
            }
        }
    }

    let mut altitude_m = None;
    if let Some(after) = rest.strip_prefix("/A=") {
        let end = after
            .char_indices()
            .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && c == '-')))
            .map(|(i, _)| i)
            .unwrap_or(after.len());
        altitude_m = after[..end].parse::<f64>().ok().map(|ft| ft * FEET_TO_M);
        rest = &after[end..];
    }

    let comment = rest.trim();
    if let Some((dlat, dlon)) = decode_precision(comment) {
        latitude += dlat / 60.0 * latitude.signum();
        longitude += dlon / 60.0 * longitude.signum();
    }

    Ok(Beacon {
        device_id: header.source.to_string(),
        message_kind: MessageKind::Position,
        beacon_kind: kind,
        timestamp,
        latitude: Some(latitude),
        longitude: Some(longitude),
        altitude_m,
        ground_speed_kmh,
        track_deg,
        climb_rate_ms: decode_climb_rate(comment),
        squawk: None,
    })
}

fn decode_status(
    header: &Header<'_>,
    body: &str,
    reference: DateTime<Utc>,
) -> Result<Beacon, DecodeError> {
    let timestamp = match body.get(0..7) {
        Some(field) if field.ends_with('h') => decode_timestamp(field, reference)?,
        _ => reference,
    };

    Ok(Beacon {
        device_id: header.source.to_string(),
        message_kind: MessageKind::Status,
        beacon_kind: classify(header.destination, header.path),
        timestamp,
        latitude: None,
        longitude: None,
        altitude_m: None,
        ground_speed_kmh: None,
        track_deg: None,
        climb_rate_ms: None,
        squawk: None,
    })
}

/// Decode one raw APRS line. `reference` anchors the day of `hhmmss` stamps.
pub fn parse(raw: &str, reference: DateTime<Utc>) -> Result<Beacon, DecodeError> {
    let raw = raw.trim_end_matches(['\r', '\n']);
    if raw.trim().is_empty() {
        return Err(DecodeError::Empty);
    }
    if let Some(comment) = raw.strip_prefix('#') {
        return Err(DecodeError::Comment(comment.trim().to_string()));
    }

    let (header, body) = split_header(raw)?;

    match body.chars().next() {
        Some('/') | Some('@') => decode_position(&header, &body[1..], reference),
        Some('>') => decode_status(&header, &body[1..], reference),
        _ => Err(DecodeError::UnsupportedBody(body.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn reference() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 16, 10, 0).unwrap()
    }

    const FLARM: &str = "FLRDDA5BA>OGFLR,qAS,LFMX:/160829h4415.41N/00600.03E'342/049/A=005524 !W52! id0ADDA5BA -454fpm -1.1rot 8.8dB 0e +51.2kHz gps4x5";

    #[test]
    fn test_parse_flarm_position() {
        let b = parse(FLARM, reference()).unwrap();
        assert_eq!(b.device_id, "FLRDDA5BA");
        assert_eq!(b.message_kind, MessageKind::Position);
        assert_eq!(b.beacon_kind, BeaconKind::Flarm);
        assert_eq!(b.timestamp, Utc.with_ymd_and_hms(2024, 6, 1, 16, 8, 29).unwrap());
        assert_eq!(b.track_deg, Some(342.0));
    }

    #[test]
    fn test_parse_units_converted() {
        let b = parse(FLARM, reference()).unwrap();
        assert!((b.altitude_m.unwrap() - 5524.0 * 0.3048).abs() < 1e-9);
        assert!((b.ground_speed_kmh.unwrap() - 49.0 * 1.852).abs() < 1e-9);
        assert!((b.climb_rate_ms.unwrap() - (-454.0 * 0.00508)).abs() < 1e-9);
    }

    #[test]
    fn test_parse_precision_enhancement() {
        let b = parse(FLARM, reference()).unwrap();
        let lat = 44.0 + 15.415 / 60.0;
        let lon = 6.0 + 0.032 / 60.0;
        assert!((b.latitude.unwrap() - lat).abs() < 1e-9);
        assert!((b.longitude.unwrap() - lon).abs() < 1e-9);
    }

    #[test]
    fn test_parse_southern_western_hemisphere() {
        let raw = "OGN123456>OGNTRK,qAS,Station:/160829h3330.00S/07030.00W'000/000/A=000100";
        let b = parse(raw, reference()).unwrap();
        assert_eq!(b.beacon_kind, BeaconKind::Tracker);
        assert!((b.latitude.unwrap() + 33.5).abs() < 1e-9);
        assert!((b.longitude.unwrap() + 70.5).abs() < 1e-9);
    }

    #[test]
    fn test_parse_without_course_speed() {
        let raw = "FLRDDEEFF>OGFLR,qAS,Station:/160829h4903.50N/07201.75W'/A=001234";
        let b = parse(raw, reference()).unwrap();
        assert!(b.track_deg.is_none());
        assert!(b.ground_speed_kmh.is_none());
        assert!(b.altitude_m.is_some());
        assert!(b.climb_rate_ms.is_none());
    }

    #[test]
    fn test_parse_negative_altitude() {
        let raw = "FLRDDEEFF>OGFLR,qAS,Station:/160829h4903.50N/07201.75W'090/010/A=-00050 +0fpm";
        let b = parse(raw, reference()).unwrap();
        assert!((b.altitude_m.unwrap() + 50.0 * 0.3048).abs() < 1e-9);
    }

    #[test]
    fn test_parse_receiver_position() {
        let raw = "LFMX>OGNSDR,TCPIP*,qAC,GLIDERN1:/160830h4415.41NI00600.03E&/A=001975";
        let b = parse(raw, reference()).unwrap();
        assert_eq!(b.beacon_kind, BeaconKind::Receiver);
        assert!(!b.beacon_kind.is_aircraft());
    }

    #[test]
    fn test_parse_legacy_aprs_receiver() {
        let raw = "LFMX>APRS,TCPIP*,qAC,GLIDERN1:/160830h4415.41NI00600.03E&/A=001975";
        let b = parse(raw, reference()).unwrap();
        assert_eq!(b.beacon_kind, BeaconKind::AprsReceiver);
    }

    #[test]
    fn test_parse_legacy_aprs_aircraft() {
        let raw = "FLRDDA5BA>APRS,qAS,LFMX:/160829h4415.41N/00600.03E'342/049/A=005524";
        let b = parse(raw, reference()).unwrap();
        assert_eq!(b.beacon_kind, BeaconKind::AprsAircraft);
    }

    #[test]
    fn test_parse_status() {
        let raw = "LFMX>OGNSDR,TCPIP*,qAC,GLIDERN1:>160830h v0.2.8.RPI-GPU CPU:0.5";
        let b = parse(raw, reference()).unwrap();
        assert_eq!(b.message_kind, MessageKind::Status);
        assert!(b.latitude.is_none());
    }

    #[test]
    fn test_parse_comment() {
        let err = parse("# aprsc 2.1.4-g408ed49", reference()).unwrap_err();
        assert!(matches!(err, DecodeError::Comment(_)));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse("", reference()), Err(DecodeError::Empty));
        assert!(matches!(
            parse("garbage", reference()),
            Err(DecodeError::MissingHeader(_))
        ));
        assert!(matches!(
            parse("FLRDDEEFF>OGFLR,qAS,X:;object", reference()),
            Err(DecodeError::UnsupportedBody(_))
        ));
        assert!(matches!(
            parse("FLRDDEEFF>OGFLR,qAS,X:/1608", reference()),
            Err(DecodeError::BadPosition(_))
        ));
        assert!(matches!(
            parse("FLRDDEEFF>OGFLR,qAS,X:/996099h4903.50N/07201.75W'", reference()),
            Err(DecodeError::BadTimestamp(_))
        ));
    }

    #[test]
    fn test_parse_multibyte_after_symbol() {
        let raw = "FLRDDEEFF>OGFLR,qAS,LFMX:/160829h4415.41N/00600.03E'12é4567 hello";
        let b = parse(raw, reference()).unwrap();
        assert!(b.track_deg.is_none());
        assert!(b.ground_speed_kmh.is_none());
        assert!(b.latitude.is_some());
    }

    proptest! {
        #[test]
        fn prop_parse_never_panics(tail in any::<String>()) {
            let positioned = format!("FLRDDEEFF>OGFLR,qAS,LFMX:/160829h4415.41N/00600.03E'{tail}");
            let _ = parse(&positioned, reference());
            let status = format!("LFMX>OGNSDR,TCPIP*,qAC,GLIDERN1:>{tail}");
            let _ = parse(&status, reference());
            let _ = parse(&tail, reference());
        }
    }

    #[test]
    fn test_timestamp_rolls_back_across_midnight() {
        let reference = Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 5).unwrap();
        let ts = decode_timestamp("235958h", reference).unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 6, 1, 23, 59, 58).unwrap());
    }

    #[test]
    fn test_timestamp_rolls_forward_across_midnight() {
        let reference = Utc.with_ymd_and_hms(2024, 6, 1, 23, 59, 59).unwrap();
        let ts = decode_timestamp("000001h", reference).unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 1).unwrap());
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("OGFLR", "qAS,X"), BeaconKind::Flarm);
        assert_eq!(classify("OGNFNT", "qAS,X"), BeaconKind::Fanet);
        assert_eq!(classify("OGXYZ", "qAS,X"), BeaconKind::Unknown);
    }
}
