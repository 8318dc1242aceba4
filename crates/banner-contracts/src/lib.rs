pub mod events;
pub mod layers;
pub mod materials;
pub mod models;
pub mod runs;
pub mod stages;
pub mod verdict;

use chrono::{SecondsFormat, Utc};

/// RFC 3339 UTC timestamp with microsecond precision, shared by every on-disk record.
pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
