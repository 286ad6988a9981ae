//! Parsing of the durable vehicle id
//! (`<uuid>_<YYYYMMDD>_<HHMMSS>_<vehicle_type>_<location>`) and the asset
//! URLs derived from it.

use chrono::{NaiveDate, NaiveDateTime};

pub const UNKNOWN_LOCATION: &str = "UNKNOWN";

/// Site label: everything after the fourth underscore-delimited token.
/// Locations may themselves contain underscores (`NORTH_GATE`).
pub fn extract_location(vehicle_id: &str) -> String {
    let parts: Vec<&str> = vehicle_id.split('_').collect();
    if parts.len() < 5 {
        return UNKNOWN_LOCATION.to_string();
    }
    let location = parts[4..].join("_");
    if location.is_empty() {
        UNKNOWN_LOCATION.to_string()
    } else {
        location
    }
}

/// Capture instant from the date and time tokens, or `None` if either is
/// malformed.
pub fn extract_timestamp(vehicle_id: &str) -> Option<NaiveDateTime> {
    let mut parts = vehicle_id.split('_').skip(1);
    let date = parts.next()?;
    let time = parts.next()?;

    let year = digits(date, 0, 4)?;
    let month = digits(date, 4, 6)?;
    let day = digits(date, 6, 8)?;
    let hour = digits(time, 0, 2)?;
    let minute = digits(time, 2, 4)?;
    let second = digits(time, 4, 6)?;

    NaiveDate::from_ymd_opt(year as i32, month, day)?.and_hms_opt(hour, minute, second)
}

fn digits(token: &str, start: usize, end: usize) -> Option<u32> {
    let slice = token.get(start..end)?;
    if !slice.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    slice.parse().ok()
}

/// Builds keyframe and plate-crop URLs under the static file tree
/// `<base>/<location>/<YYYY-MM-DD>/...`.
#[derive(Debug, Clone)]
pub struct AssetUrls {
    base: String,
}

impl AssetUrls {
    pub fn new(base: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub fn keyframe(&self, vehicle_id: &str, location: &str, date: NaiveDate) -> String {
        format!(
            "{}/{}/{}/keyframes/{}.jpg",
            self.base,
            location,
            date.format("%Y-%m-%d"),
            vehicle_id
        )
    }

    pub fn plate(&self, vehicle_id: &str, location: &str, date: NaiveDate) -> String {
        format!(
            "{}/{}/{}/plates/{}_plate.jpg",
            self.base,
            location,
            date.format("%Y-%m-%d"),
            vehicle_id
        )
    }
}
