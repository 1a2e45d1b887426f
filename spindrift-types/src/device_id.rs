//! Device identity for spindrift.
//!
//! A device is identified by the SHA-256 of its TLS certificate. The textual
//! form is the Syncthing-compatible encoding: the 32 digest bytes are base32
//! encoded (52 characters, no padding), a Luhn mod-32 check character is
//! appended to each 13-character group, and the resulting 56 characters are
//! chunked into 8 dash-separated groups of 7:
//!
//! `KHQNO2S-5QSILRK-YX4JZZ4-7L77APM-QNVGZJT-EKU7IFI-PNEPBMY-4MXFMQD`

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// First 8 bytes of the digest, used as the vector-clock counter id.
pub type ShortId = u64;

/// Errors from parsing a textual device id.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceIdError {
    /// The string is not 56 base32 characters (after dash removal).
    #[error("device id has invalid length {0}, expected 56 characters")]
    InvalidLength(usize),

    /// A character outside the base32 alphabet.
    #[error("device id contains invalid character {0:?}")]
    InvalidCharacter(char),

    /// A Luhn check character does not match its group.
    #[error("device id check digit mismatch in group {0}")]
    CheckDigitMismatch(usize),

    /// The trailing base32 bits were not zero.
    #[error("device id has non-zero padding bits")]
    TrailingBits,
}

/// The SHA-256 certificate digest identifying a device.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId([u8; 32]);

impl DeviceId {
    /// Wrap a raw SHA-256 certificate digest.
    pub fn from_sha256(digest: [u8; 32]) -> Self {
        Self(digest)
    }

    /// Build a DeviceId from a byte slice, which must be 32 bytes long.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        <[u8; 32]>::try_from(bytes).ok().map(Self)
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First dash group of the textual form, for logs.
    pub fn short(&self) -> String {
        self.to_string()[..7].to_string()
    }

    /// First 8 digest bytes as a big-endian u64, the vector-clock id.
    pub fn short_id(&self) -> ShortId {
        u64::from_be_bytes(self.0[..8].try_into().unwrap())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = base32_encode(&self.0);
        let mut luhnified = Vec::with_capacity(56);
        for group in data.chunks(13) {
            luhnified.extend_from_slice(group);
            luhnified.push(luhn32(group));
        }
        for (i, chunk) in luhnified.chunks(7).enumerate() {
            if i > 0 {
                f.write_str("-")?;
            }
            f.write_str(std::str::from_utf8(chunk).unwrap())?;
        }
        Ok(())
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.short())
    }
}

impl FromStr for DeviceId {
    type Err = DeviceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stripped: Vec<u8> = s
            .bytes()
            .filter(|b| *b != b'-' && *b != b' ')
            .map(|b| b.to_ascii_uppercase())
            .collect();
        if stripped.len() != 56 {
            return Err(DeviceIdError::InvalidLength(stripped.len()));
        }
        let mut data = Vec::with_capacity(52);
        for (i, group) in stripped.chunks(14).enumerate() {
            for &c in group {
                if !ALPHABET.contains(&c) {
                    return Err(DeviceIdError::InvalidCharacter(c as char));
                }
            }
            if luhn32(&group[..13]) != group[13] {
                return Err(DeviceIdError::CheckDigitMismatch(i));
            }
            data.extend_from_slice(&group[..13]);
        }
        let bytes = base32_decode(&data)?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for DeviceId {
    type Error = DeviceIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.to_string()
    }
}

/// Base32 (RFC 4648 alphabet, no padding) of the 32 digest bytes: 52 chars.
fn base32_encode(bytes: &[u8; 32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(52);
    let mut buf = 0u16;
    let mut bits = 0u8;
    for &b in bytes {
        buf = (buf << 8) | b as u16;
        bits += 8;
        while bits >= 5 {
            out.push(ALPHABET[((buf >> (bits - 5)) & 0x1f) as usize]);
            bits -= 5;
        }
    }
    if bits > 0 {
        out.push(ALPHABET[((buf << (5 - bits)) & 0x1f) as usize]);
    }
    out
}

fn base32_decode(chars: &[u8]) -> Result<[u8; 32], DeviceIdError> {
    debug_assert_eq!(chars.len(), 52);
    let mut out = [0u8; 32];
    let mut n = 0;
    let mut buf = 0u16;
    let mut bits = 0u8;
    for &c in chars {
        let v = ALPHABET
            .iter()
            .position(|a| *a == c)
            .ok_or(DeviceIdError::InvalidCharacter(c as char))? as u16;
        buf = (buf << 5) | v;
        bits += 5;
        if bits >= 8 {
            if n == 32 {
                return Err(DeviceIdError::TrailingBits);
            }
            out[n] = (buf >> (bits - 8)) as u8;
            n += 1;
            bits -= 8;
        }
    }
    if buf & ((1 << bits) - 1) != 0 {
        return Err(DeviceIdError::TrailingBits);
    }
    Ok(out)
}

/// Luhn mod-32 check character over the base32 alphabet.
fn luhn32(group: &[u8]) -> u8 {
    let n = 32i32;
    let mut factor = 1i32;
    let mut sum = 0i32;
    for &c in group {
        let codepoint = ALPHABET.iter().position(|a| *a == c).unwrap() as i32;
        let addend = factor * codepoint;
        factor = if factor == 2 { 1 } else { 2 };
        sum += addend / n + addend % n;
    }
    let check = (n - sum % n) % n;
    ALPHABET[check as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID_1: &str = "KHQNO2S-5QSILRK-YX4JZZ4-7L77APM-QNVGZJT-EKU7IFI-PNEPBMY-4MXFMQD";
    const ID_2: &str = "VUV42CZ-IQD5A37-RPEBPM4-VVQK6E4-6WSKC7B-PVJQHHD-4PZD44V-ENC6WAZ";
    const ID_3: &str = "O4LHPKG-O6BQ36W-MUOVKTI-MKAVHSC-Y7EC3U4-DHNLEDE-MZBJWQN-UIX6QAL";

    #[test]
    fn known_ids_parse() {
        for id in [ID_1, ID_2, ID_3] {
            let parsed: DeviceId = id.parse().unwrap();
            assert_eq!(parsed.to_string(), id);
        }
    }

    #[test]
    fn digest_roundtrip() {
        let id = DeviceId::from_sha256([0xa7; 32]);
        let text = id.to_string();
        let restored: DeviceId = text.parse().unwrap();
        assert_eq!(id, restored);
    }

    #[test]
    fn display_is_chunked() {
        let text = DeviceId::from_sha256([3; 32]).to_string();
        assert_eq!(text.len(), 63); // 56 chars + 7 dashes
        assert_eq!(text.split('-').count(), 8);
        assert!(text.split('-').all(|g| g.len() == 7));
    }

    #[test]
    fn corrupted_check_digit_fails() {
        let mut text = ID_1.to_string();
        // flip the last character, which is a data-or-check position
        let last = text.pop().unwrap();
        text.push(if last == 'A' { 'B' } else { 'A' });
        assert!(text.parse::<DeviceId>().is_err());
    }

    #[test]
    fn wrong_length_fails() {
        assert_eq!(
            "ABCDEFG".parse::<DeviceId>(),
            Err(DeviceIdError::InvalidLength(7))
        );
    }

    #[test]
    fn invalid_character_fails() {
        let text = ID_1.replace('K', "1"); // '1' is not in the base32 alphabet
        assert!(matches!(
            text.parse::<DeviceId>(),
            Err(DeviceIdError::InvalidCharacter('1')) | Err(DeviceIdError::InvalidLength(_))
        ));
    }

    #[test]
    fn short_is_first_group() {
        let id: DeviceId = ID_1.parse().unwrap();
        assert_eq!(id.short(), "KHQNO2S");
    }

    #[test]
    fn short_id_is_first_eight_bytes() {
        let id = DeviceId::from_sha256([
            0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23,
            24, 25, 26, 27, 28, 29, 30, 31,
        ]);
        assert_eq!(id.short_id(), u64::from_be_bytes([0, 1, 2, 3, 4, 5, 6, 7]));
    }

    #[test]
    fn dashes_and_case_are_tolerated() {
        let relaxed = ID_1.replace('-', "").to_lowercase();
        let parsed: DeviceId = relaxed.parse().unwrap();
        assert_eq!(parsed.to_string(), ID_1);
    }
}
