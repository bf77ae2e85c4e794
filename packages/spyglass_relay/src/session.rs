//! Session addressing.
//!
//! Every message published by an engine starts with a 16-byte session id;
//! the relay routes on its 32-character lowercase hex rendering.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SessionError;

const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

/// 16-byte session identifier, displayed as 32 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId([u8; 16]);

impl SessionId {
    /// Raw length of an id inside an engine message.
    pub const LENGTH: usize = 16;

    /// Length of the hex rendering.
    pub const HEX_LENGTH: usize = 32;

    /// The zeroed id used by standalone engines, which host exactly one session.
    pub const STANDALONE: SessionId = SessionId([0; 16]);

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        SessionId(bytes)
    }

    /// Extracts the id from an engine message: the first 16 bytes of the buffer.
    pub fn from_message(message: &[u8]) -> Result<Self, SessionError> {
        if message.len() < Self::LENGTH {
            return Err(SessionError::Truncated(message.len()));
        }
        let mut bytes = [0u8; Self::LENGTH];
        bytes.copy_from_slice(&message[..Self::LENGTH]);
        Ok(SessionId(bytes))
    }

    /// Parses a hex rendering. Exactly 32 hex characters; case is accepted on
    /// input, the canonical form is lowercase.
    pub fn parse(hex: &str) -> Result<Self, SessionError> {
        if hex.len() != Self::HEX_LENGTH || !hex.is_ascii() {
            return Err(SessionError::InvalidId(hex.to_string()));
        }
        let mut bytes = [0u8; Self::LENGTH];
        for (i, chunk) in hex.as_bytes().chunks_exact(2).enumerate() {
            let high = hex_value(chunk[0]).ok_or_else(|| SessionError::InvalidId(hex.to_string()))?;
            let low = hex_value(chunk[1]).ok_or_else(|| SessionError::InvalidId(hex.to_string()))?;
            bytes[i] = (high << 4) | low;
        }
        Ok(SessionId(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(Self::HEX_LENGTH);
        for byte in &self.0 {
            out.push(HEX_CHARS[(byte >> 4) as usize] as char);
            out.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
        }
        out
    }
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.to_hex())
    }
}

impl TryFrom<String> for SessionId {
    type Error = SessionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        SessionId::parse(&value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.to_hex()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_rendering_is_lowercase_most_significant_nibble_first() {
        let id = SessionId::from_bytes([
            0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0xfe, 0xdc, 0xba, 0x98, 0x76, 0x54,
            0x32, 0x10,
        ]);
        assert_eq!(id.to_hex(), "0123456789abcdeffedcba9876543210");
    }

    #[test]
    fn extracts_first_sixteen_bytes_of_message() {
        let mut message = vec![0xaa; 16];
        message.extend_from_slice(b"payload");
        let id = SessionId::from_message(&message).unwrap();
        assert_eq!(id.to_hex(), "aa".repeat(16));
    }

    #[test]
    fn short_message_is_rejected() {
        let err = SessionId::from_message(&[1, 2, 3]).unwrap_err();
        assert_eq!(err, SessionError::Truncated(3));
    }

    #[test]
    fn parse_roundtrips_and_accepts_uppercase() {
        let hex = "0123456789abcdeffedcba9876543210";
        let id = SessionId::parse(hex).unwrap();
        assert_eq!(id.to_hex(), hex);

        let upper = SessionId::parse(&hex.to_uppercase()).unwrap();
        assert_eq!(upper, id);
    }

    #[test]
    fn parse_rejects_wrong_length_and_non_hex() {
        assert!(SessionId::parse("abc").is_err());
        assert!(SessionId::parse(&"0".repeat(33)).is_err());
        assert!(SessionId::parse(&"g".repeat(32)).is_err());
    }

    #[test]
    fn standalone_id_is_all_zeroes() {
        assert_eq!(SessionId::STANDALONE.to_hex(), "0".repeat(32));
    }
}
