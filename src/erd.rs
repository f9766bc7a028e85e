//! ERD identifiers and the bus constants shared by every module.

use std::fmt;

use serde::Deserialize;

/// Well-known ERD holding the one-byte appliance type.
pub const APPLIANCE_TYPE_ERD: Erd = Erd(0x0008);

/// Bus address used until an appliance answers identification.
pub const BROADCAST_ADDRESS: u8 = 0xFF;

/// Address the bridge itself uses on the appliance bus.
pub const DEFAULT_CLIENT_ADDRESS: u8 = 0xE4;

/// Maximum number of ERDs kept in the polling list.
pub const POLLING_LIST_CAPACITY: usize = 256;

/// Equipment Resource Descriptor: a 16-bit name for one appliance data point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "ErdRepr")]
pub struct Erd(pub u16);

impl Erd {
    pub fn value(self) -> u16 {
        self.0
    }

    /// Parse `0x1234`, `0X1234` or bare hex digits.
    pub fn parse_hex(s: &str) -> Option<Erd> {
        let cleaned = s.trim().trim_start_matches("0x").trim_start_matches("0X");
        if cleaned.is_empty() || cleaned.len() > 4 {
            return None;
        }
        u16::from_str_radix(cleaned, 16).ok().map(Erd)
    }
}

impl fmt::Display for Erd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

impl From<u16> for Erd {
    fn from(value: u16) -> Self {
        Erd(value)
    }
}

/// YAML catalogs may spell an ERD as a number or as a hex string.
#[derive(Deserialize)]
#[serde(untagged)]
enum ErdRepr {
    Number(u16),
    Hex(String),
}

impl TryFrom<ErdRepr> for Erd {
    type Error = String;

    fn try_from(repr: ErdRepr) -> Result<Self, Self::Error> {
        match repr {
            ErdRepr::Number(n) => Ok(Erd(n)),
            ErdRepr::Hex(s) => Erd::parse_hex(&s).ok_or_else(|| format!("invalid ERD: {}", s)),
        }
    }
}

/// Identifier handed to the ERD client with each request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestId(pub u8);

impl RequestId {
    pub fn next(self) -> RequestId {
        RequestId(self.0.wrapping_add(1))
    }
}
