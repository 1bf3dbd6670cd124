/// Utility helpers shared by the worker and master sides.
///
/// This module contains:
/// - Wall-clock helpers
/// - Measurement key helpers (flattening, pattern matching)
///
/// IMPORTANT:
/// - No transport or table logic should live here.
///
use chrono::Utc;

use crate::schema::EventTime;

/// Separator used when flattening a nested field into one key.
///
/// Example: group "ipm2", subkey "sum" -> "ipm2__sum"
pub const KEY_SEPARATOR: &str = "__";

/// Returns the current wall clock as a (seconds, nanoseconds) pair.
pub fn now_event_time() -> EventTime {
    let now = Utc::now();
    EventTime::new(now.timestamp(), now.timestamp_subsec_nanos())
}

/// Flattens a group/subkey pair into one measurement key.
pub fn flat_key(group: &str, subkey: &str) -> String {
    format!("{}{}{}", group, KEY_SEPARATOR, subkey)
}

/// True when `key` contains any of the given substrings.
///
/// Used for the forward / never-forward rules on the worker and the
/// metadata exclusion list of the master alignment check.
pub fn contains_any(key: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| key.contains(p.as_str()))
}
