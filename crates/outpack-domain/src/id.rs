//! Time-ordered packet identifiers: `YYYYMMDD-HHMMSS-FFFFRRRR`.
//!
//! `FFFF` encodes the fractional second as `floor(frac * 65536)` and `RRRR`
//! is two random bytes, so ids created later sort lexicographically after
//! ids created earlier (down to 1/65536 s resolution).

use rand::{rngs::OsRng, RngCore};
use time::OffsetDateTime;

use crate::error::OutpackError;

pub const ID_LENGTH: usize = 24;

/// Generate a fresh id for the current wall-clock time.
#[must_use]
pub fn new_id() -> String {
    let mut random = [0u8; 2];
    OsRng.fill_bytes(&mut random);
    id_from_parts(OffsetDateTime::now_utc(), random)
}

/// Build an id from an explicit time and random suffix.
#[must_use]
pub fn id_from_parts(time: OffsetDateTime, random: [u8; 2]) -> String {
    let time = time.to_offset(time::UtcOffset::UTC);
    let fraction = (u64::from(time.nanosecond()) << 16) / 1_000_000_000;
    format!(
        "{:04}{:02}{:02}-{:02}{:02}{:02}-{fraction:04x}{}",
        time.year(),
        u8::from(time.month()),
        time.day(),
        time.hour(),
        time.minute(),
        time.second(),
        hex::encode(random)
    )
}

/// Whether `id` matches `[0-9]{8}-[0-9]{6}-[0-9a-f]{8}`.
#[must_use]
pub fn is_valid_id(id: &str) -> bool {
    let bytes = id.as_bytes();
    if bytes.len() != ID_LENGTH {
        return false;
    }
    bytes.iter().enumerate().all(|(i, b)| match i {
        8 | 15 => *b == b'-',
        0..=7 | 9..=14 => b.is_ascii_digit(),
        _ => matches!(b, b'0'..=b'9' | b'a'..=b'f'),
    })
}

pub fn validate_id(id: &str) -> Result<(), OutpackError> {
    if is_valid_id(id) {
        Ok(())
    } else {
        Err(OutpackError::MalformedId(id.to_string()))
    }
}
