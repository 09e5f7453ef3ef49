//! ogn-core: Pure decode + tracking library for the OGN to BaseStation gateway.
//!
//! No async and no sockets: the beacon record, the per-aircraft registry,
//! the freshness gate, device database enrichment and BaseStation encoding.
//! `ogn-gateway` wraps these with networking and the runtime.

pub mod aprs;
pub mod basestation;
pub mod config;
pub mod ddb;
pub mod filter;
pub mod tracker;
pub mod types;
pub mod validate;

// Re-export commonly used types at crate root
pub use aprs::parse;
pub use basestation::{encode, encode_now};
pub use ddb::{DdbSnapshot, Enrich, NoEnrichment};
pub use filter::SinkFilter;
pub use tracker::{Aircraft, AircraftRegistry};
pub use types::*;
pub use validate::{accept, Rejection, Verdict};
