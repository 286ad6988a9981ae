use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

pub const UNKNOWN_HEX: &str = "#000000";

/// A completed sighting, persisted once and broadcast to live subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VehicleRecord {
    pub vehicle_id: String,
    pub vehicle_type: String,
    pub keyframe_url: String,
    pub plate_url: String,
    pub color: String,
    pub color_hex: String,
    pub vehicle_number: String,
    pub model: String,
    pub location: String,
    /// Capture instant embedded in the vehicle id; `None` when unparseable,
    /// in which case the store falls back to insertion time.
    pub timestamp: Option<NaiveDateTime>,
    pub status: String,
}

/// Color worker output split into name and hex code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColorReading {
    pub name: String,
    pub hex: String,
}

impl ColorReading {
    /// Parse the `"<name>|<hex>"` encoding. Only the first `|` separates;
    /// without one the whole string is the name and the hex is unknown.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once('|') {
            Some((name, hex)) => Self {
                name: name.trim().to_string(),
                hex: hex.trim().to_string(),
            },
            None => Self {
                name: raw.trim().to_string(),
                hex: UNKNOWN_HEX.to_string(),
            },
        }
    }
}
