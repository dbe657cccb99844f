//! Object versions.
//!
//! An [`ObjectVersion`] is the HLC stamp allocated when a consistency record
//! is inserted. It is written to backends as object metadata and read back
//! by the drift filter, so its text form must order the same way as its
//! numeric form: a zero-padded 20 digit decimal of the packed HLC value.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::hlc::HlcTimestamp;

/// Width of the textual version representation (`u64::MAX` has 20 digits).
pub const VERSION_WIDTH: usize = 20;

/// Comparable version of an object, derived from the insertion stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectVersion(HlcTimestamp);

impl ObjectVersion {
    /// Wraps an HLC timestamp.
    #[must_use]
    pub const fn new(ts: HlcTimestamp) -> Self {
        Self(ts)
    }

    /// Returns the underlying HLC timestamp.
    #[must_use]
    pub const fn timestamp(&self) -> HlcTimestamp {
        self.0
    }

    /// Returns the physical component as a UTC date time.
    #[must_use]
    pub fn physical_time(&self) -> DateTime<Utc> {
        let millis = i64::try_from(self.0.physical_time()).unwrap_or(i64::MAX);
        Utc.timestamp_millis_opt(millis).single().unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl From<HlcTimestamp> for ObjectVersion {
    fn from(ts: HlcTimestamp) -> Self {
        Self(ts)
    }
}

impl fmt::Display for ObjectVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:0width$}", self.0.as_raw(), width = VERSION_WIDTH)
    }
}

impl FromStr for ObjectVersion {
    type Err = ParseObjectVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseObjectVersionError(s.to_string()));
        }
        trimmed
            .parse::<u64>()
            .map(|raw| Self(HlcTimestamp::from_raw(raw)))
            .map_err(|_| ParseObjectVersionError(s.to_string()))
    }
}

/// Error parsing an object version string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseObjectVersionError(String);

impl fmt::Display for ParseObjectVersionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid object version '{}'", self.0)
    }
}

impl std::error::Error for ParseObjectVersionError {}
