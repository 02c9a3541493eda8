use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A Swift `X-Timestamp`: seconds since the epoch with five decimal places.
///
/// The cluster emits timestamps in the canonical `%016.5f` form, optionally
/// followed by a `_<hex>` offset suffix. Remote stores that only expose
/// `Last-Modified` get a synthesized timestamp floored to whole seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Timestamp {
    /// Microseconds since the epoch.
    micros: i64,
    /// True when derived from `Last-Modified` rather than a cluster timestamp.
    #[serde(default)]
    synthesized: bool,
}

impl Timestamp {
    pub fn from_micros(micros: i64) -> Self {
        Self {
            micros,
            synthesized: false,
        }
    }

    pub fn from_secs(secs: i64) -> Self {
        Self {
            micros: secs * 1_000_000,
            synthesized: false,
        }
    }

    /// Synthesize from `Last-Modified`, floored to whole seconds.
    pub fn from_last_modified(last_modified: &DateTime<Utc>) -> Self {
        Self {
            micros: last_modified.timestamp() * 1_000_000,
            synthesized: true,
        }
    }

    pub fn micros(&self) -> i64 {
        self.micros
    }

    pub fn secs(&self) -> i64 {
        self.micros / 1_000_000
    }

    pub fn is_synthesized(&self) -> bool {
        self.synthesized
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.secs(), ((self.micros % 1_000_000) * 1000) as u32)
    }
}

impl fmt::Display for Timestamp {
    /// The canonical `%016.5f` form used on the wire.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:010}.{:05}",
            self.micros / 1_000_000,
            (self.micros % 1_000_000) / 10
        )
    }
}

impl FromStr for Timestamp {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        // Tolerate an `_<hex-offset>` suffix; ordering only needs the base.
        let base = value.split('_').next().unwrap_or(value);
        let (secs_part, frac_part) = match base.split_once('.') {
            Some((s, f)) => (s, f),
            None => (base, ""),
        };
        let secs: i64 = secs_part
            .parse()
            .map_err(|_| anyhow!("invalid timestamp: {}", value))?;
        let mut frac = frac_part.to_string();
        frac.truncate(6);
        while frac.len() < 6 {
            frac.push('0');
        }
        let frac_micros: i64 = if frac.is_empty() {
            0
        } else {
            frac.parse()
                .map_err(|_| anyhow!("invalid timestamp: {}", value))?
        };
        Ok(Self {
            micros: secs * 1_000_000 + frac_micros,
            synthesized: false,
        })
    }
}

// The synthesized flag is bookkeeping, not identity.
impl PartialEq for Timestamp {
    fn eq(&self, other: &Self) -> bool {
        self.micros == other.micros
    }
}

impl Eq for Timestamp {}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.micros.cmp(&other.micros)
    }
}
