//! Identifier and timestamp helpers.
//!
//! Request ids are UUIDv7, so they sort by generation time and double as
//! the id of the note or space a create command materializes.
//! Command timestamps travel as Unix seconds.

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

/// Generate a new UUIDv7 identifier.
#[inline]
pub fn new_v7() -> Uuid {
    Uuid::now_v7()
}

/// Check if a UUID is version 7.
#[inline]
pub fn is_v7(uuid: &Uuid) -> bool {
    uuid.get_version_num() == 7
}

/// Current time as Unix seconds.
#[inline]
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// Convert a command's Unix-seconds timestamp to a `DateTime`.
///
/// Out-of-range values fall back to the current time.
pub fn from_unix(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_v7_is_version_7() {
        assert!(is_v7(&new_v7()));
        assert!(!is_v7(&Uuid::new_v4()));
    }

    #[test]
    fn test_v7_ordering() {
        let id1 = new_v7();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = new_v7();
        assert!(id2 > id1);
    }

    #[test]
    fn test_from_unix() {
        let dt = from_unix(1_700_000_000);
        assert_eq!(dt.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_unix_now_is_recent() {
        let now = unix_now();
        assert!(now > 1_700_000_000);
    }
}
