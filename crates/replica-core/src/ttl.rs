//! Time-to-live literals

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

const MILLIS_PER_MINUTE: i64 = 60 * 1000;
const MILLIS_PER_HOUR: i64 = 60 * MILLIS_PER_MINUTE;
const MILLIS_PER_DAY: i64 = 24 * MILLIS_PER_HOUR;

/// How long a stored entity lives after it is first written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ttl {
    Minutes(u32),
    Hours(u32),
    Days(u32),
    Millis(i64),
    #[default]
    Infinite,
}

impl Ttl {
    /// Duration in milliseconds, `None` when infinite.
    pub fn millis(&self) -> Option<i64> {
        match *self {
            Ttl::Minutes(n) => Some(i64::from(n) * MILLIS_PER_MINUTE),
            Ttl::Hours(n) => Some(i64::from(n) * MILLIS_PER_HOUR),
            Ttl::Days(n) => Some(i64::from(n) * MILLIS_PER_DAY),
            Ttl::Millis(n) => Some(n),
            Ttl::Infinite => None,
        }
    }

    pub fn is_infinite(&self) -> bool {
        matches!(self, Ttl::Infinite)
    }

    /// `now + duration`, or `None` for an infinite TTL.
    pub fn calculate_expiration(&self, now: i64) -> Option<i64> {
        self.millis().map(|ms| now.saturating_add(ms))
    }
}

impl FromStr for Ttl {
    type Err = Error;

    /// Accepts `"5m"`, `"2h"`, `"6d"`, `"250ms"`, the long forms
    /// `"5 minutes"`/`"1 hour"`/`"6 days"`, and `""` or `"infinite"`.
    fn from_str(s: &str) -> Result<Self> {
        let literal = s.trim();
        if literal.is_empty() || literal.eq_ignore_ascii_case("infinite") {
            return Ok(Ttl::Infinite);
        }

        let split = literal
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| Error::InvalidTtl(format!("missing unit in {:?}", s)))?;
        let (count, unit) = literal.split_at(split);
        if count.is_empty() {
            return Err(Error::InvalidTtl(format!("missing count in {:?}", s)));
        }
        let count: u32 = count
            .parse()
            .map_err(|e| Error::InvalidTtl(format!("{:?}: {}", s, e)))?;

        match unit.trim().to_lowercase().as_str() {
            "m" | "minute" | "minutes" => Ok(Ttl::Minutes(count)),
            "h" | "hour" | "hours" => Ok(Ttl::Hours(count)),
            "d" | "day" | "days" => Ok(Ttl::Days(count)),
            "ms" => Ok(Ttl::Millis(i64::from(count))),
            other => Err(Error::InvalidTtl(format!("unknown unit {:?}", other))),
        }
    }
}

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ttl::Minutes(n) => write!(f, "{}m", n),
            Ttl::Hours(n) => write!(f, "{}h", n),
            Ttl::Days(n) => write!(f, "{}d", n),
            Ttl::Millis(n) => write!(f, "{}ms", n),
            Ttl::Infinite => write!(f, "infinite"),
        }
    }
}
