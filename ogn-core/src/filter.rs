//! Per-output predicates over accepted `(beacon, aircraft)` pairs.
//!
//! Each output carries its own [`SinkFilter`]. The common thresholds are
//! plain data so they can come from the config file; anything else can be
//! expressed with [`SinkFilter::custom`].

use std::fmt;
use std::sync::Arc;

use crate::tracker::Aircraft;
use crate::types::Beacon;

type Predicate = Arc<dyn Fn(&Beacon, &Aircraft) -> bool + Send + Sync>;

/// Decides which accepted beacons an output receives. The default passes
/// everything.
#[derive(Clone, Default)]
pub struct SinkFilter {
    /// Forward only beacons strictly faster than this (km/h). Beacons
    /// without a ground speed are dropped when set.
    pub min_ground_speed_kmh: Option<f64>,
    /// Forward only beacons at or below this altitude (m). Beacons
    /// without an altitude are dropped when set.
    pub max_altitude_m: Option<f64>,
    custom: Option<Predicate>,
}

impl SinkFilter {
    pub fn always() -> Self {
        SinkFilter::default()
    }

    pub fn min_ground_speed(kmh: f64) -> Self {
        SinkFilter {
            min_ground_speed_kmh: Some(kmh),
            ..SinkFilter::default()
        }
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Beacon, &Aircraft) -> bool + Send + Sync + 'static,
    {
        SinkFilter {
            custom: Some(Arc::new(f)),
            ..SinkFilter::default()
        }
    }

    pub fn with_max_altitude(mut self, meters: f64) -> Self {
        self.max_altitude_m = Some(meters);
        self
    }

    pub fn is_pass_all(&self) -> bool {
        self.min_ground_speed_kmh.is_none() && self.max_altitude_m.is_none() && self.custom.is_none()
    }

    pub fn accepts(&self, beacon: &Beacon, aircraft: &Aircraft) -> bool {
        if let Some(min) = self.min_ground_speed_kmh {
            match beacon.ground_speed_kmh {
                Some(speed) if speed > min => {}
                _ => return false,
            }
        }
        if let Some(max) = self.max_altitude_m {
            match beacon.altitude_m {
                Some(alt) if alt <= max => {}
                _ => return false,
            }
        }
        match &self.custom {
            Some(f) => f(beacon, aircraft),
            None => true,
        }
    }
}

impl fmt::Debug for SinkFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkFilter")
            .field("min_ground_speed_kmh", &self.min_ground_speed_kmh)
            .field("max_altitude_m", &self.max_altitude_m)
            .field("custom", &self.custom.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
