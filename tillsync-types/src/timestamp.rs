//! Remote-assigned timestamps used as the replication ordering key.
//!
//! The backend stamps every catalog row with `updated_at`; the replica only
//! ever compares these values, so the representation is a plain count of
//! milliseconds since the Unix epoch. Remote payloads may carry the value as
//! an integer or as an RFC 3339 string and both forms decode to the same
//! timestamp.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Returns the current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self(millis)
    }

    /// Creates a timestamp from milliseconds since the epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns milliseconds since the epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Parses an RFC 3339 string (e.g. `2024-05-01T09:30:00.250Z`).
    pub fn parse_rfc3339(s: &str) -> crate::Result<Self> {
        let parsed = DateTime::parse_from_rfc3339(s)
            .map_err(|e| crate::Error::InvalidTimestamp(format!("{s}: {e}")))?;
        let millis = parsed.timestamp_millis();
        if millis < 0 {
            return Err(crate::Error::InvalidTimestamp(format!(
                "{s}: before the Unix epoch"
            )));
        }
        Ok(Self(millis as u64))
    }

    /// Formats as RFC 3339 with millisecond precision.
    #[must_use]
    pub fn to_rfc3339(&self) -> String {
        DateTime::<Utc>::from_timestamp_millis(self.0 as i64)
            .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
            .unwrap_or_else(|| self.0.to_string())
    }

    /// Returns the time elapsed from `self` until `later`, or zero if `later`
    /// is not after `self`.
    #[must_use]
    pub fn elapsed_until(&self, later: Timestamp) -> Duration {
        Duration::from_millis(later.0.saturating_sub(self.0))
    }

    /// Returns a timestamp `duration` earlier, saturating at the epoch.
    #[must_use]
    pub fn saturating_sub(&self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration.as_millis() as u64))
    }

    /// Returns a timestamp `duration` later.
    #[must_use]
    pub fn saturating_add(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_millis() as u64))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_rfc3339())
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(TimestampVisitor)
    }
}

/// Largest value storage can hold (a signed 64-bit column).
const MAX_MILLIS: u64 = i64::MAX as u64;

struct TimestampVisitor;

impl Visitor<'_> for TimestampVisitor {
    type Value = Timestamp;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("milliseconds since the epoch or an RFC 3339 string")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Timestamp, E> {
        if v > MAX_MILLIS {
            return Err(E::custom(format!("timestamp out of range: {v}")));
        }
        Ok(Timestamp(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Timestamp, E> {
        u64::try_from(v)
            .map(Timestamp)
            .map_err(|_| E::custom(format!("negative timestamp: {v}")))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Timestamp, E> {
        if v.is_finite() && v >= 0.0 && v < MAX_MILLIS as f64 {
            Ok(Timestamp(v as u64))
        } else {
            Err(E::custom(format!("invalid timestamp: {v}")))
        }
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Timestamp, E> {
        Timestamp::parse_rfc3339(v).map_err(E::custom)
    }
}
