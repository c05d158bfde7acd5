//! # Hybrid Logical Clock
//!
//! Blocks carry an HLC timestamp next to their number. On the wire it is a
//! string, `2026-03-01T12:00:00.000000001Z_0`: nanosecond UTC wall time, an
//! underscore, and a logical counter that breaks ties when two events land on
//! the same nanosecond (or when the wall clock steps backwards).
//!
//! Strings are what peers send, so lookups accept strings. Ordering goes
//! through the parsed form: `_10` sorts after `_9` even though the strings
//! don't.

use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HlcError {
    #[error("malformed HLC timestamp: {0}")]
    Malformed(String),
}

/// A parsed HLC timestamp. Ordered by wall time, then counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HlcTimestamp {
    pub nanos: i64,
    pub counter: u32,
}

impl HlcTimestamp {
    /// The epoch timestamp, used by genesis blocks.
    pub const ZERO: HlcTimestamp = HlcTimestamp {
        nanos: 0,
        counter: 0,
    };

    /// Sort key for storage indexes: big-endian, sign-flipped nanos followed
    /// by the big-endian counter, so byte order equals timestamp order.
    pub fn index_key(&self) -> [u8; 12] {
        let mut key = [0u8; 12];
        key[..8].copy_from_slice(&((self.nanos as u64) ^ (1 << 63)).to_be_bytes());
        key[8..].copy_from_slice(&self.counter.to_be_bytes());
        key
    }
}

impl fmt::Display for HlcTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let wall = DateTime::<Utc>::from_timestamp_nanos(self.nanos);
        write!(
            f,
            "{}_{}",
            wall.to_rfc3339_opts(SecondsFormat::Nanos, true),
            self.counter
        )
    }
}

impl FromStr for HlcTimestamp {
    type Err = HlcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || HlcError::Malformed(s.to_string());
        let (wall, counter) = s.rsplit_once('_').ok_or_else(malformed)?;
        let nanos = DateTime::parse_from_rfc3339(wall)
            .map_err(|_| malformed())?
            .timestamp_nanos_opt()
            .ok_or_else(malformed)?;
        let counter = counter.parse().map_err(|_| malformed())?;
        Ok(Self { nanos, counter })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse_roundtrip() {
        let ts = HlcTimestamp {
            nanos: 1_772_366_400_000_000_001,
            counter: 12,
        };
        let rendered = ts.to_string();
        assert!(rendered.ends_with("Z_12"));
        assert_eq!(rendered.parse::<HlcTimestamp>().unwrap(), ts);
    }

    #[test]
    fn zero_renders_as_epoch() {
        assert_eq!(
            HlcTimestamp::ZERO.to_string(),
            "1970-01-01T00:00:00.000000000Z_0"
        );
    }

    #[test]
    fn index_key_orders_like_timestamps() {
        let a = HlcTimestamp { nanos: 5, counter: 9 };
        let b = HlcTimestamp { nanos: 5, counter: 10 };
        let c = HlcTimestamp { nanos: 6, counter: 0 };
        let before_epoch = HlcTimestamp { nanos: -1, counter: 0 };
        assert!(a.index_key() < b.index_key());
        assert!(b.index_key() < c.index_key());
        assert!(before_epoch.index_key() < HlcTimestamp::ZERO.index_key());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!("yesterday".parse::<HlcTimestamp>().is_err());
        assert!("2026-01-01T00:00:00Z_x".parse::<HlcTimestamp>().is_err());
    }
}
