//! Addresses, capability identifiers and application scope tokens

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::hash;

/// Length of an address in bytes
pub const ADDRESS_LEN: usize = 32;
/// Length of a capability identifier in bytes
pub const API_ID_LEN: usize = 65;
/// Length of an application token in bytes
pub const APP_TOKEN_LEN: usize = 4;

/// Content hash identifying an identity, object or frame
///
/// Addresses are computed once from content and never change. Identities are
/// addressed by the hash of their verifying key, frames by the hash of their
/// signed bytes, and dynamic objects by the hash of their genesis parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address([u8; ADDRESS_LEN]);

impl Address {
    /// Create an address from raw bytes
    pub fn from_bytes(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    /// Hash content into its address
    pub fn from_content(content: &[u8]) -> Self {
        Self(hash::hash(content))
    }

    /// Hash several domain-separated parts into an address
    pub fn from_parts(domain: &[u8], parts: &[&[u8]]) -> Self {
        let mut h = hash::hasher();
        h.update(domain);
        for part in parts {
            h.update(&(part.len() as u64).to_le_bytes());
            h.update(part);
        }
        Self(h.finalize())
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    /// Abbreviated form for log fields
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let array: [u8; ADDRESS_LEN] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(array))
    }
}

/// Capability identifier naming the binary schema of an object
///
/// Used to route newly shared objects to consumers that declared interest in
/// the schema.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct ApiId([u8; API_ID_LEN]);

impl ApiId {
    /// Create a capability identifier from raw bytes
    pub fn from_bytes(bytes: [u8; API_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Derive a capability identifier from a schema name
    ///
    /// The first byte is a version tag, the rest two domain-separated digests.
    pub fn from_schema(name: &str) -> Self {
        let mut bytes = [0u8; API_ID_LEN];
        bytes[0] = 0x01;
        bytes[1..33].copy_from_slice(Address::from_parts(b"HGX_API_v1", &[name.as_bytes()]).as_bytes());
        bytes[33..].copy_from_slice(
            Address::from_parts(b"HGX_API_v1_ext", &[name.as_bytes()]).as_bytes(),
        );
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; API_ID_LEN] {
        &self.0
    }
}

impl TryFrom<Vec<u8>> for ApiId {
    type Error = String;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        let len = value.len();
        let bytes: [u8; API_ID_LEN] = value
            .try_into()
            .map_err(|_| format!("api_id must be {API_ID_LEN} bytes, got {len}"))?;
        Ok(Self(bytes))
    }
}

impl From<ApiId> for Vec<u8> {
    fn from(value: ApiId) -> Self {
        value.0.to_vec()
    }
}

impl fmt::Debug for ApiId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiId({})", hex::encode(&self.0[..9]))
    }
}

impl fmt::Display for ApiId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "api:{}", hex::encode(self.0))
    }
}

/// Application scope token
///
/// Unique per (identity, application) pair. Private objects are reachable only
/// from sessions holding the token they were created under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AppToken([u8; APP_TOKEN_LEN]);

impl AppToken {
    /// Create a token from raw bytes
    pub fn from_bytes(bytes: [u8; APP_TOKEN_LEN]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; APP_TOKEN_LEN] {
        &self.0
    }
}

impl fmt::Display for AppToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "token:{}", hex::encode(self.0))
    }
}

impl FromStr for AppToken {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex_str = s.strip_prefix("token:").unwrap_or(s);
        let bytes = hex::decode(hex_str)?;
        let array: [u8; APP_TOKEN_LEN] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(array))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_is_content_derived() {
        let a = Address::from_content(b"frame body");
        let b = Address::from_content(b"frame body");
        let c = Address::from_content(b"other body");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_address_parts_are_length_prefixed() {
        let a = Address::from_parts(b"d", &[b"ab", b"c"]);
        let b = Address::from_parts(b"d", &[b"a", b"bc"]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_address_hex_roundtrip() {
        let address = Address::from_content(b"x");
        let parsed: Address = address.to_string().parse().unwrap();
        assert_eq!(parsed, address);
    }

    #[test]
    fn test_api_id_rejects_wrong_length() {
        let err = ApiId::try_from(vec![0u8; 12]).unwrap_err();
        assert!(err.contains("65"));
    }

    #[test]
    fn test_api_id_json_roundtrip() {
        let api = ApiId::from_schema("hgx.test.note");
        let json = serde_json::to_string(&api).unwrap();
        let back: ApiId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, api);
    }

    #[test]
    fn test_app_token_parse() {
        let token = AppToken::from_bytes([0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(token.to_string(), "token:deadbeef");
        assert_eq!("token:deadbeef".parse::<AppToken>().unwrap(), token);
        assert_eq!("deadbeef".parse::<AppToken>().unwrap(), token);
    }
}
