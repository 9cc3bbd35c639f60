//! Hex identifiers used on the wire.
//!
//! Format: `0x` followed by a fixed number of hex digits.
//!
//! - [`Address`] - 20-byte account address (wallets, broker, tokens)
//! - [`HexId`] - 32-byte identifier (channel ids, app-session ids)
//!
//! Both are normalized to lowercase so that comparisons are case-insensitive.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A 20-byte account address in the form `0x...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// The zero address (native token).
    pub fn zero() -> Self {
        Self(format!("0x{}", "0".repeat(40)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0[2..].bytes().all(|b| b == b'0')
    }
}

/// A 32-byte opaque identifier in the form `0x...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HexId(String);

impl HexId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Channel identifiers are opaque 32-byte ids.
pub type ChannelId = HexId;

/// App-session identifiers are opaque 32-byte ids.
pub type AppSessionId = HexId;

fn parse_hex(s: &str, digits: usize) -> Result<String, AddressParseError> {
    let body = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .ok_or_else(|| AddressParseError::MissingPrefix(s.to_string()))?;

    if body.len() != digits {
        return Err(AddressParseError::WrongLength {
            expected: digits,
            got: body.len(),
        });
    }

    if let Some(c) = body.chars().find(|c| !c.is_ascii_hexdigit()) {
        return Err(AddressParseError::InvalidDigit(c));
    }

    Ok(format!("0x{}", body.to_ascii_lowercase()))
}

macro_rules! hex_newtype {
    ($name:ident, $digits:expr) => {
        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = AddressParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_hex(s, $digits).map(Self)
            }
        }

        impl TryFrom<String> for $name {
            type Error = AddressParseError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                s.parse()
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

hex_newtype!(Address, 40);
hex_newtype!(HexId, 64);

/// Error parsing a hex address or identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressParseError {
    #[error("hex value must start with '0x', got: {0}")]
    MissingPrefix(String),
    #[error("expected {expected} hex digits, got {got}")]
    WrongLength { expected: usize, got: usize },
    #[error("invalid hex digit '{0}'")]
    InvalidDigit(char),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_address_normalizes_case() {
        let a: Address = "0xDE8792E863d73C751e07c4A88a600d2c5AB0Ff74".parse().unwrap();
        assert_eq!(a.as_str(), "0xde8792e863d73c751e07c4a88a600d2c5ab0ff74");
        let b: Address = "0xde8792e863d73c751e07c4a88a600d2c5ab0ff74".parse().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn reject_bad_addresses() {
        assert!(matches!(
            "de8792e863d73c751e07c4a88a600d2c5ab0ff74".parse::<Address>(),
            Err(AddressParseError::MissingPrefix(_))
        ));
        assert!(matches!(
            "0x1234".parse::<Address>(),
            Err(AddressParseError::WrongLength { expected: 40, got: 4 })
        ));
        assert!(matches!(
            "0xzz8792e863d73c751e07c4a88a600d2c5ab0ff74".parse::<Address>(),
            Err(AddressParseError::InvalidDigit('z'))
        ));
    }

    #[test]
    fn zero_address() {
        assert!(Address::zero().is_zero());
        let a: Address = "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913".parse().unwrap();
        assert!(!a.is_zero());
    }

    #[test]
    fn channel_id_serde() {
        let raw = format!("\"0x{}\"", "ab".repeat(32));
        let id: ChannelId = serde_json::from_str(&raw).unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), raw);
        assert!(serde_json::from_str::<ChannelId>("\"0xabcd\"").is_err());
    }
}
