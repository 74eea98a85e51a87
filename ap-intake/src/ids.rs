//! Event id minting and month-partition helpers shared by every
//! producer (Notification Worker, Timer Poller, Enricher, Router).

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Mint a sortable lexicographic event id. UUIDv7 places a 48-bit
/// millisecond timestamp in the leading bytes, so the lowercase-hex
/// string form sorts the same way insertion order does — exactly the
/// "sortable lexicographic event id" the data model calls for, without
/// a hand-rolled ULID encoder.
pub fn new_event_id() -> String {
    Uuid::now_v7().to_string()
}

/// The `YYYYMM` partition key for a given instant, used as the
/// Transaction Log's partition key.
pub fn yyyymm(at: DateTime<Utc>) -> String {
    at.format("%Y%m").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yyyymm_formats_as_six_digits() {
        let at = DateTime::parse_from_rfc3339("2024-03-07T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(yyyymm(at), "202403");
    }

    #[test]
    fn event_ids_are_lexicographically_increasing_over_time() {
        let a = new_event_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_event_id();
        assert!(a < b);
    }
}
