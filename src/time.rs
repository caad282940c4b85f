//! CCSDS Day Segmented (CDS) time code as used by the SLE services, according to
//! [CCSDS 301.0-B-4](https://public.ccsds.org/Pubs/301x0b4e1.pdf) section 3.3 .
//!
//! SLE conveys the time code with an implicit preamble field: the 16 bit day segment is
//! followed by the 32 bit milliseconds of day and either a 16 bit microsecond field
//! (8 octets total) or a 32 bit picosecond field (10 octets total).
use crate::ByteConversionError;
use chrono::{DateTime, TimeZone, Utc};
use core::cmp::Ordering;
use core::hash::{Hash, Hasher};
use core::time::Duration;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

pub const DAYS_CCSDS_TO_UNIX: i32 = -4383;
pub const SECONDS_PER_DAY: u32 = 86400;
pub const MS_PER_DAY: u32 = SECONDS_PER_DAY * 1000;
/// Length of the CDS time code with microsecond resolution.
pub const CDS_US_PREC_LEN: usize = 8;
/// Length of the CDS time code with picosecond resolution.
pub const CDS_PS_PREC_LEN: usize = 10;

// One additional second is allowed for days with a leap second.
const MAX_MS_OF_DAY: u32 = MS_PER_DAY + 999;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmillisPrecision {
    Microseconds(u16),
    Picoseconds(u32),
}

impl SubmillisPrecision {
    fn as_picoseconds(&self) -> u64 {
        match self {
            SubmillisPrecision::Microseconds(us) => *us as u64 * 1_000_000,
            SubmillisPrecision::Picoseconds(ps) => *ps as u64,
        }
    }

    fn as_nanoseconds(&self) -> u32 {
        (self.as_picoseconds() / 1000) as u32
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum TimestampError {
    #[error("byte conversion error: {0}")]
    ByteConversion(#[from] ByteConversionError),
    #[error("invalid cds time code length {0}, expected 8 or 10")]
    InvalidLength(usize),
    #[error("datetime with date before ccsds epoch")]
    DateBeforeCcsdsEpoch,
    #[error("invalid ccsds days {0}")]
    InvalidCcsdsDays(i64),
    #[error("invalid milliseconds of day {0}")]
    InvalidMsOfDay(u32),
    #[error("invalid submillisecond field {0}")]
    InvalidSubmillis(u32),
    #[error("system time before unix epoch")]
    SystemTime,
}

/// Convert UNIX days to CCSDS days
///
///  - CCSDS epoch: 1958 January 1
///  - UNIX Epoch: 1970 January 1
pub const fn unix_to_ccsds_days(unix_days: i64) -> i64 {
    unix_days - DAYS_CCSDS_TO_UNIX as i64
}

/// Convert CCSDS days to UNIX days
///
///  - CCSDS epoch: 1958 January 1
///  - UNIX Epoch: 1970 January 1
pub const fn ccsds_to_unix_days(ccsds_days: i64) -> i64 {
    ccsds_days + DAYS_CCSDS_TO_UNIX as i64
}

/// CDS timestamp with a 16 bit day segment and sub-millisecond precision.
///
/// Equality, ordering and hashing are chronological, so a timestamp with microsecond
/// precision compares equal to the same instant expressed with picosecond precision.
///
/// # Example
///
/// ```
/// use sleservices::time::{CdsTimestamp, SubmillisPrecision};
///
/// let stamp = CdsTimestamp::new(4383, 1500, SubmillisPrecision::Microseconds(250)).unwrap();
/// let raw = stamp.to_vec();
/// assert_eq!(raw.len(), 8);
/// assert_eq!(CdsTimestamp::from_bytes(&raw).unwrap(), stamp);
/// assert_eq!(stamp.unix_seconds(), 1);
/// ```
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
#[serde(try_from = "CdsFields")]
pub struct CdsTimestamp {
    ccsds_days: u16,
    ms_of_day: u32,
    submillis: SubmillisPrecision,
}

/// Unchecked fields of a deserialized [CdsTimestamp].
#[derive(Deserialize)]
struct CdsFields {
    ccsds_days: u16,
    ms_of_day: u32,
    submillis: SubmillisPrecision,
}

impl TryFrom<CdsFields> for CdsTimestamp {
    type Error = TimestampError;

    fn try_from(fields: CdsFields) -> Result<Self, Self::Error> {
        Self::new(fields.ccsds_days, fields.ms_of_day, fields.submillis)
    }
}

impl CdsTimestamp {
    pub fn new(
        ccsds_days: u16,
        ms_of_day: u32,
        submillis: SubmillisPrecision,
    ) -> Result<Self, TimestampError> {
        if ms_of_day > MAX_MS_OF_DAY {
            return Err(TimestampError::InvalidMsOfDay(ms_of_day));
        }
        match submillis {
            SubmillisPrecision::Microseconds(us) if us > 999 => {
                return Err(TimestampError::InvalidSubmillis(us as u32))
            }
            SubmillisPrecision::Picoseconds(ps) if ps > 999_999_999 => {
                return Err(TimestampError::InvalidSubmillis(ps))
            }
            _ => (),
        }
        Ok(Self {
            ccsds_days,
            ms_of_day,
            submillis,
        })
    }

    /// Current time with microsecond precision.
    pub fn from_now() -> Result<Self, TimestampError> {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_err(|_| TimestampError::SystemTime)?;
        Self::from_unix_parts(now.as_secs() as i64, now.subsec_nanos(), false)
    }

    /// Current time with picosecond precision. The system clock only provides nanoseconds,
    /// so the last three digits of the picosecond field are always zero.
    pub fn from_now_with_ps_prec() -> Result<Self, TimestampError> {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_err(|_| TimestampError::SystemTime)?;
        Self::from_unix_parts(now.as_secs() as i64, now.subsec_nanos(), true)
    }

    /// Microsecond precision timestamp from a [chrono] date.
    pub fn from_date_time(dt: &DateTime<Utc>) -> Result<Self, TimestampError> {
        Self::from_unix_parts(dt.timestamp(), dt.timestamp_subsec_nanos(), false)
    }

    fn from_unix_parts(
        unix_seconds: i64,
        subsec_nanos: u32,
        pico_prec: bool,
    ) -> Result<Self, TimestampError> {
        let unix_days = unix_seconds.div_euclid(SECONDS_PER_DAY as i64);
        let secs_of_day = unix_seconds.rem_euclid(SECONDS_PER_DAY as i64) as u32;
        let ccsds_days = unix_to_ccsds_days(unix_days);
        if ccsds_days < 0 {
            return Err(TimestampError::DateBeforeCcsdsEpoch);
        }
        if ccsds_days > u16::MAX as i64 {
            return Err(TimestampError::InvalidCcsdsDays(ccsds_days));
        }
        // Leap second representation of chrono.
        let (secs_of_day, subsec_nanos) = if subsec_nanos >= 1_000_000_000 {
            (secs_of_day + 1, subsec_nanos - 1_000_000_000)
        } else {
            (secs_of_day, subsec_nanos)
        };
        let submillis = if pico_prec {
            SubmillisPrecision::Picoseconds((subsec_nanos % 1_000_000) * 1000)
        } else {
            SubmillisPrecision::Microseconds(((subsec_nanos / 1000) % 1000) as u16)
        };
        Ok(Self {
            ccsds_days: ccsds_days as u16,
            ms_of_day: secs_of_day * 1000 + subsec_nanos / 1_000_000,
            submillis,
        })
    }

    #[inline]
    pub fn ccsds_days(&self) -> u16 {
        self.ccsds_days
    }

    #[inline]
    pub fn ms_of_day(&self) -> u32 {
        self.ms_of_day
    }

    #[inline]
    pub fn submillis(&self) -> SubmillisPrecision {
        self.submillis
    }

    #[inline]
    pub fn is_pico_prec(&self) -> bool {
        matches!(self.submillis, SubmillisPrecision::Picoseconds(_))
    }

    pub fn unix_seconds(&self) -> i64 {
        ccsds_to_unix_days(self.ccsds_days as i64) * SECONDS_PER_DAY as i64
            + (self.ms_of_day / 1000) as i64
    }

    pub fn to_date_time(&self) -> Option<DateTime<Utc>> {
        let nanos = (self.ms_of_day % 1000) * 1_000_000 + self.submillis.as_nanoseconds();
        Utc.timestamp_opt(self.unix_seconds(), nanos).single()
    }

    /// Absolute distance between two timestamps.
    pub fn abs_diff(&self, other: &CdsTimestamp) -> Duration {
        let (lhs, rhs) = (self.picos_since_epoch(), other.picos_since_epoch());
        let diff = lhs.abs_diff(rhs);
        Duration::new(
            (diff / 1_000_000_000_000) as u64,
            ((diff % 1_000_000_000_000) / 1000) as u32,
        )
    }

    fn picos_since_epoch(&self) -> u128 {
        (self.ccsds_days as u128 * MS_PER_DAY as u128 + self.ms_of_day as u128) * 1_000_000_000
            + self.submillis.as_picoseconds() as u128
    }

    #[inline]
    pub fn len_written(&self) -> usize {
        if self.is_pico_prec() {
            CDS_PS_PREC_LEN
        } else {
            CDS_US_PREC_LEN
        }
    }

    pub fn write_to_bytes(&self, buf: &mut [u8]) -> Result<usize, ByteConversionError> {
        let len = self.len_written();
        if buf.len() < len {
            return Err(ByteConversionError::ToSliceTooSmall {
                found: buf.len(),
                expected: len,
            });
        }
        buf[0..2].copy_from_slice(&self.ccsds_days.to_be_bytes());
        buf[2..6].copy_from_slice(&self.ms_of_day.to_be_bytes());
        match self.submillis {
            SubmillisPrecision::Microseconds(us) => buf[6..8].copy_from_slice(&us.to_be_bytes()),
            SubmillisPrecision::Picoseconds(ps) => buf[6..10].copy_from_slice(&ps.to_be_bytes()),
        }
        Ok(len)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut vec = vec![0; self.len_written()];
        // The vector is always large enough.
        let _ = self.write_to_bytes(&mut vec);
        vec
    }

    /// Read a timestamp from a raw buffer. The precision is derived from the buffer length,
    /// which must be exactly 8 or 10 octets.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, TimestampError> {
        if buf.len() < CDS_US_PREC_LEN {
            return Err(ByteConversionError::FromSliceTooSmall {
                found: buf.len(),
                expected: CDS_US_PREC_LEN,
            }
            .into());
        }
        let ccsds_days = u16::from_be_bytes([buf[0], buf[1]]);
        let ms_of_day = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);
        let submillis = match buf.len() {
            CDS_US_PREC_LEN => SubmillisPrecision::Microseconds(u16::from_be_bytes([buf[6], buf[7]])),
            CDS_PS_PREC_LEN => {
                SubmillisPrecision::Picoseconds(u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]))
            }
            len => return Err(TimestampError::InvalidLength(len)),
        };
        Self::new(ccsds_days, ms_of_day, submillis)
    }
}

impl PartialEq for CdsTimestamp {
    fn eq(&self, other: &Self) -> bool {
        self.picos_since_epoch() == other.picos_since_epoch()
    }
}

impl Eq for CdsTimestamp {}

impl PartialOrd for CdsTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CdsTimestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.picos_since_epoch().cmp(&other.picos_since_epoch())
    }
}

impl Hash for CdsTimestamp {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.picos_since_epoch().hash(state);
    }
}

impl TryFrom<DateTime<Utc>> for CdsTimestamp {
    type Error = TimestampError;

    fn try_from(dt: DateTime<Utc>) -> Result<Self, Self::Error> {
        Self::from_date_time(&dt)
    }
}
