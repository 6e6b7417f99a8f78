use rand::Rng;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// High-order byte shared by every address of a fleet, configured as two hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacPrefix(u8);

impl MacPrefix {
    pub fn value(&self) -> u8 {
        self.0
    }
}

impl FromStr for MacPrefix {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.len() > 2 || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(AddressError::MalformedPrefix(s.to_string()));
        }

        u8::from_str_radix(trimmed, 16)
            .map(MacPrefix)
            .map_err(|_| AddressError::MalformedPrefix(s.to_string()))
    }
}

impl TryFrom<String> for MacPrefix {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl<'de> serde::Deserialize<'de> for MacPrefix {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

/// A link-layer style address: the prefix byte followed by 40 bits of device index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress([u8; 6]);

impl DeviceAddress {
    /// Number of distinct device indices an address can encode.
    pub const INDEX_SPACE: u64 = 1 << 40;

    pub fn derive(prefix: MacPrefix, index: u64) -> Self {
        let index_bytes = (index & (Self::INDEX_SPACE - 1)).to_be_bytes();

        let mut octets = [0u8; 6];
        octets[0] = prefix.value();
        octets[1..].copy_from_slice(&index_bytes[3..]);
        DeviceAddress(octets)
    }

    pub fn random<R: Rng + ?Sized>(prefix: MacPrefix, rng: &mut R) -> Self {
        Self::derive(prefix, rng.gen_range(0..Self::INDEX_SPACE))
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// The address without separators, used as a storage key.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|octet| format!("{:02x}", octet)).collect()
    }

    pub fn from_hex(s: &str) -> Result<Self, AddressError> {
        if s.len() != 12 || !s.is_ascii() {
            return Err(AddressError::MalformedAddress(s.to_string()));
        }

        let mut octets = [0u8; 6];
        for (i, octet) in octets.iter_mut().enumerate() {
            *octet = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).map_err(|_| AddressError::MalformedAddress(s.to_string()))?;
        }
        Ok(DeviceAddress(octets))
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", a, b, c, d, e, g)
    }
}

#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    index: u64,
    address: DeviceAddress,
    tenant_token: String,
}

impl DeviceIdentity {
    pub fn new(index: u64, address: DeviceAddress, tenant_token: impl Into<String>) -> Self {
        DeviceIdentity {
            index,
            address,
            tenant_token: tenant_token.into(),
        }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn tenant_token(&self) -> &str {
        &self.tenant_token
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum AddressError {
    #[error("malformed MAC prefix '{0}', expected one byte as hex (e.g. 'ff')")]
    MalformedPrefix(String),
    #[error("malformed device address '{0}'")]
    MalformedAddress(String),
}
