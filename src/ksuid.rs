//! K-sortable unique identifiers, used as message correlation ids.
//!
//! 20 bytes: a big-endian `u32` of seconds since [`EPOCH_OFFSET`] followed by
//! 16 random bytes, rendered as 27 base62 characters. The string form sorts
//! lexically in creation-second order.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use rand::RngCore;
use thiserror::Error;

/// Seconds between the Unix epoch and the KSUID epoch (2014-05-13T16:53:20Z).
pub const EPOCH_OFFSET: i64 = 1_400_000_000;
pub const ENCODED_LEN: usize = 27;

const TIMESTAMP_LEN: usize = 4;
const PAYLOAD_LEN: usize = 16;
const TOTAL_LEN: usize = TIMESTAMP_LEN + PAYLOAD_LEN;

const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KsuidError {
    #[error("a ksuid has {ENCODED_LEN} characters, got {0}")]
    InvalidLength(usize),
    #[error("'{0}' is not a base62 character")]
    InvalidCharacter(char),
    #[error("value does not fit in {TOTAL_LEN} bytes")]
    Overflow,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ksuid([u8; TOTAL_LEN]);

impl Ksuid {
    /// A fresh id for the current second.
    pub fn new() -> Self {
        let mut payload = [0u8; PAYLOAD_LEN];
        rand::rng().fill_bytes(&mut payload);
        Self::from_parts(Utc::now(), payload)
    }

    /// Instants outside the representable range are clamped to it.
    pub fn from_parts(at: DateTime<Utc>, payload: [u8; PAYLOAD_LEN]) -> Self {
        let seconds = (at.timestamp() - EPOCH_OFFSET).clamp(0, i64::from(u32::MAX)) as u32;
        let mut bytes = [0u8; TOTAL_LEN];
        bytes[..TIMESTAMP_LEN].copy_from_slice(&seconds.to_be_bytes());
        bytes[TIMESTAMP_LEN..].copy_from_slice(&payload);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; TOTAL_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TOTAL_LEN] {
        &self.0
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        let mut raw = [0u8; TIMESTAMP_LEN];
        raw.copy_from_slice(&self.0[..TIMESTAMP_LEN]);
        let seconds = i64::from(u32::from_be_bytes(raw)) + EPOCH_OFFSET;
        DateTime::from_timestamp(seconds, 0).unwrap_or(DateTime::UNIX_EPOCH)
    }

    pub fn payload(&self) -> &[u8] {
        &self.0[TIMESTAMP_LEN..]
    }
}

impl Default for Ksuid {
    fn default() -> Self {
        Self::new()
    }
}

/// Generates a new correlation id string.
pub fn correlation_id() -> String {
    Ksuid::new().to_string()
}

impl fmt::Display for Ksuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut digits = Vec::with_capacity(ENCODED_LEN);
        let mut number: Vec<u32> = self.0.iter().map(|&b| u32::from(b)).collect();

        while !number.is_empty() {
            let mut quotient = Vec::with_capacity(number.len());
            let mut remainder = 0u32;
            for &digit in &number {
                let acc = digit + remainder * 256;
                let q = acc / 62;
                remainder = acc % 62;
                if !quotient.is_empty() || q > 0 {
                    quotient.push(q);
                }
            }
            digits.push(ALPHABET[remainder as usize]);
            number = quotient;
        }
        digits.resize(ENCODED_LEN.max(digits.len()), b'0');
        digits.reverse();

        let encoded: String = digits.into_iter().map(char::from).collect();
        f.write_str(&encoded)
    }
}

impl fmt::Debug for Ksuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ksuid({self})")
    }
}

fn base62_value(c: u8) -> Result<u32, KsuidError> {
    match c {
        b'0'..=b'9' => Ok(u32::from(c - b'0')),
        b'A'..=b'Z' => Ok(u32::from(c - b'A') + 10),
        b'a'..=b'z' => Ok(u32::from(c - b'a') + 36),
        other => Err(KsuidError::InvalidCharacter(char::from(other))),
    }
}

impl FromStr for Ksuid {
    type Err = KsuidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != ENCODED_LEN {
            return Err(KsuidError::InvalidLength(s.chars().count()));
        }
        let mut number = s.bytes().map(base62_value).collect::<Result<Vec<_>, _>>()?;

        let mut out = Vec::with_capacity(TOTAL_LEN);
        while !number.is_empty() {
            let mut quotient = Vec::with_capacity(number.len());
            let mut remainder = 0u32;
            for &digit in &number {
                let acc = digit + remainder * 62;
                let q = acc / 256;
                remainder = acc % 256;
                if !quotient.is_empty() || q > 0 {
                    quotient.push(q);
                }
            }
            out.push(remainder as u8);
            number = quotient;
        }
        if out.len() > TOTAL_LEN {
            return Err(KsuidError::Overflow);
        }
        out.resize(TOTAL_LEN, 0);
        out.reverse();

        let mut bytes = [0u8; TOTAL_LEN];
        bytes.copy_from_slice(&out);
        Ok(Self(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn from_hex(hex: &str) -> [u8; TOTAL_LEN] {
        let mut bytes = [0u8; TOTAL_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).unwrap();
        }
        bytes
    }

    #[test]
    fn known_vector() {
        let id = Ksuid::from_bytes(from_hex("0669F7EFB5A1CD34B5F99D1154FB6853345C9735"));
        assert_eq!(id.to_string(), "0ujtsYcgvSTl8PAuAdqWYSMnLOv");
        assert_eq!(id.timestamp(), Utc.with_ymd_and_hms(2017, 10, 10, 4, 0, 47).unwrap());

        let parsed: Ksuid = "0ujtsYcgvSTl8PAuAdqWYSMnLOv".parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn extremes() {
        assert_eq!(Ksuid::from_bytes([0; TOTAL_LEN]).to_string(), "0".repeat(ENCODED_LEN));
        assert_eq!(
            Ksuid::from_bytes([0xFF; TOTAL_LEN]).to_string(),
            "aWgEPTl1tmebfsQzFP4bxwgy80V"
        );
        assert_eq!("aWgEPTl1tmebfsQzFP4bxwgy80W".parse::<Ksuid>(), Err(KsuidError::Overflow));
    }

    #[test]
    fn new_ids_are_27_chars_and_parse_back() {
        for _ in 0..100 {
            let id = Ksuid::new();
            let s = id.to_string();
            assert_eq!(s.len(), ENCODED_LEN);
            assert_eq!(s.parse::<Ksuid>().unwrap(), id);
        }
    }

    #[test]
    fn later_seconds_sort_later() {
        let early = Ksuid::from_parts(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(), [0xFF; 16]);
        let late = Ksuid::from_parts(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap(), [0x00; 16]);
        assert!(early.to_string() < late.to_string());
        assert!(early < late);
    }

    #[test]
    fn rejects_malformed() {
        assert_eq!("abc".parse::<Ksuid>(), Err(KsuidError::InvalidLength(3)));
        assert_eq!(
            "0ujtsYcgvSTl8PAuAdqWYSMnLO-".parse::<Ksuid>(),
            Err(KsuidError::InvalidCharacter('-'))
        );
    }

    #[test]
    fn timestamps_before_the_epoch_clamp() {
        let id = Ksuid::from_parts(DateTime::UNIX_EPOCH, [1; 16]);
        assert_eq!(id.timestamp().timestamp(), EPOCH_OFFSET);
    }
}
