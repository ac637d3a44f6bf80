//! Query granularity, truncates the timestamp of the row into its bucket

use serde::{Deserialize, Serialize};
use snafu::{Snafu, ensure};
use strength_reduce::StrengthReducedU64;

use crate::common::types::Timestamp;

const SECOND: u64 = 1000;
const MINUTE: u64 = 60 * SECOND;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;
const WEEK: u64 = 7 * DAY;
/// 1970-01-05T00:00:00Z, the first Monday after the epoch
const WEEK_ORIGIN: Timestamp = 4 * DAY as Timestamp;

#[allow(missing_docs)]
#[derive(Debug, Snafu)]
pub enum GranularityError {
    #[snafu(display("Duration of the granularity should be positive"))]
    ZeroDuration,
}

/// Granularity of the timestamp
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Granularity {
    /// Millisecond precision, timestamps are kept as-is
    #[default]
    None,
    Second,
    Minute,
    FiveMinute,
    FifteenMinute,
    ThirtyMinute,
    Hour,
    SixHour,
    Day,
    /// Weeks start at Monday
    Week,
    /// All of the timestamps fall into a single bucket
    All,
    /// Fixed duration buckets aligned to the origin
    #[serde(rename_all = "camelCase")]
    Duration { duration_ms: u64, origin: Timestamp },
}

impl Granularity {
    /// Validate the granularity and create the bucketer
    pub fn bucketer(&self) -> Result<Bucketer, GranularityError> {
        let (duration, origin) = match *self {
            Self::None => return Ok(Bucketer::Identity),
            Self::All => return Ok(Bucketer::All),
            Self::Second => (SECOND, 0),
            Self::Minute => (MINUTE, 0),
            Self::FiveMinute => (5 * MINUTE, 0),
            Self::FifteenMinute => (15 * MINUTE, 0),
            Self::ThirtyMinute => (30 * MINUTE, 0),
            Self::Hour => (HOUR, 0),
            Self::SixHour => (6 * HOUR, 0),
            Self::Day => (DAY, 0),
            Self::Week => (WEEK, WEEK_ORIGIN),
            Self::Duration {
                duration_ms,
                origin,
            } => {
                ensure!(duration_ms > 0, ZeroDurationSnafu);
                (duration_ms, origin)
            }
        };
        Ok(Bucketer::Fixed {
            duration: StrengthReducedU64::new(duration),
            origin,
        })
    }
}

/// Truncates the timestamps
#[derive(Debug, Clone, Copy)]
pub enum Bucketer {
    /// Keep the timestamp
    Identity,
    /// Every timestamp maps to [`Timestamp::MIN`]
    All,
    /// Fixed duration bucket
    Fixed {
        /// Duration of the bucket
        duration: StrengthReducedU64,
        /// Start of one of the buckets
        origin: Timestamp,
    },
}

impl Bucketer {
    /// Start of the bucket the timestamp falls into
    #[inline]
    pub fn truncate(&self, timestamp: Timestamp) -> Timestamp {
        match *self {
            Self::Identity => timestamp,
            Self::All => Timestamp::MIN,
            Self::Fixed { duration, origin } => {
                let offset = timestamp as i128 - origin as i128;
                let d = duration.get() as i128;
                let bucket = if offset >= 0 {
                    // Strength reduced division in the common non-negative case
                    let q = (offset as u64) / duration;
                    q as i128 * d
                } else {
                    -((-offset - 1) / d + 1) * d
                };
                (origin as i128 + bucket).clamp(Timestamp::MIN as i128, Timestamp::MAX as i128)
                    as Timestamp
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        let hour = Granularity::Hour.bucketer().unwrap();
        assert_eq!(hour.truncate(3_600_000 * 5 + 17), 3_600_000 * 5);
        assert_eq!(hour.truncate(-1), -3_600_000);
        assert_eq!(hour.truncate(0), 0);

        assert_eq!(Granularity::None.bucketer().unwrap().truncate(17), 17);
        assert_eq!(
            Granularity::All.bucketer().unwrap().truncate(17),
            Timestamp::MIN
        );
    }

    #[test]
    fn test_week_starts_at_monday() {
        let week = Granularity::Week.bucketer().unwrap();
        // 1970-01-01 is a Thursday, its week starts at 1969-12-29
        assert_eq!(week.truncate(0), -3 * DAY as Timestamp);
        // 1970-01-12 is a Monday
        assert_eq!(week.truncate(11 * DAY as Timestamp), 11 * DAY as Timestamp);
    }

    #[test]
    fn test_duration_with_origin() {
        let granularity = Granularity::Duration {
            duration_ms: 10,
            origin: 3,
        };
        let bucketer = granularity.bucketer().unwrap();
        assert_eq!(bucketer.truncate(3), 3);
        assert_eq!(bucketer.truncate(12), 3);
        assert_eq!(bucketer.truncate(13), 13);
        assert_eq!(bucketer.truncate(2), -7);

        assert!(
            Granularity::Duration {
                duration_ms: 0,
                origin: 0
            }
            .bucketer()
            .is_err()
        );
    }

    #[test]
    fn test_serde() {
        let granularity: Granularity = serde_json::from_str(r#""fifteenMinute""#).unwrap();
        assert_eq!(granularity, Granularity::FifteenMinute);
        let granularity: Granularity =
            serde_json::from_str(r#"{"duration": {"durationMs": 5, "origin": 1}}"#).unwrap();
        assert_eq!(
            granularity,
            Granularity::Duration {
                duration_ms: 5,
                origin: 1
            }
        );
    }
}
