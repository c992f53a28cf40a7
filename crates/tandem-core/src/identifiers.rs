//! Core identifier types
//!
//! Addresses name the two counterparties and the multisig that backs a
//! channel. They appear verbatim inside log keys, so a valid address never
//! contains the `/` separator.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::TandemError;

/// Prefix used for every hex-rendered binary value
const HEX_PREFIX: &str = "0x";

fn encode_prefixed(bytes: &[u8]) -> String {
    format!("{HEX_PREFIX}{}", hex::encode(bytes))
}

fn decode_prefixed(s: &str) -> Result<Vec<u8>, hex::FromHexError> {
    hex::decode(s.strip_prefix(HEX_PREFIX).unwrap_or(s))
}

/// Participant or multisig address
///
/// Ordering is plain byte order of the textual form; the canonical
/// `alice`/`bob` assignment of a channel is the sorted pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    /// Wrap an address string without validation
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Borrow the textual form
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check that the address can be embedded in a log key
    pub fn validate(&self) -> Result<(), TandemError> {
        if self.0.is_empty() {
            return Err(TandemError::invalid("address cannot be empty"));
        }
        if self.0.contains('/') {
            return Err(TandemError::invalid(format!(
                "address {} contains the log key separator",
                self.0
            )));
        }
        Ok(())
    }

    /// Return `(self, other)` in canonical sorted order
    pub fn sorted_pair<'a>(&'a self, other: &'a Address) -> (&'a Address, &'a Address) {
        if self <= other {
            (self, other)
        } else {
            (other, self)
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = TandemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let address = Self::new(s);
        address.validate()?;
        Ok(address)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identifier of an app channel within its state channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppId(String);

impl AppId {
    /// Wrap an existing app id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the app id both peers compute for an install request
    ///
    /// `blake3(multisig ‖ 0 ‖ request_id ‖ 0 ‖ app_name)`, hex rendered.
    pub fn derive(multisig: &Address, request_id: &RequestId, app_name: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(multisig.as_str().as_bytes());
        hasher.update(&[0]);
        hasher.update(request_id.as_str().as_bytes());
        hasher.update(&[0]);
        hasher.update(app_name.as_bytes());
        Self(encode_prefixed(hasher.finalize().as_bytes()))
    }

    /// Borrow the textual form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller-supplied identifier of one logical protocol instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Wrap a caller-supplied request id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random request id
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the textual form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// 32-byte blake3 digest
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Hash arbitrary bytes
    pub fn of(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode_prefixed(&self.0))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

impl FromStr for Digest {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = decode_prefixed(s)?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(array))
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Detached signature over a `Digest`
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Signature(Vec<u8>);

impl Signature {
    /// Wrap raw signature bytes
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode_prefixed(&self.0))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({self})")
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        decode_prefixed(&s)
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}

/// Render bytes the way every binary value in Tandem is rendered
pub fn to_prefixed_hex(bytes: &[u8]) -> String {
    encode_prefixed(bytes)
}

/// Parse a `0x`-prefixed (or bare) hex string
pub fn from_prefixed_hex(s: &str) -> Result<Vec<u8>, TandemError> {
    decode_prefixed(s).map_err(|e| TandemError::serialization(format!("invalid hex {s}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_rejects_separator() {
        assert!("0xabc".parse::<Address>().is_ok());
        assert!("0xa/bc".parse::<Address>().is_err());
        assert!("".parse::<Address>().is_err());
    }

    #[test]
    fn test_sorted_pair_is_order_independent() {
        let a = Address::new("0xaaa");
        let b = Address::new("0xbbb");
        assert_eq!(a.sorted_pair(&b), (&a, &b));
        assert_eq!(b.sorted_pair(&a), (&a, &b));
    }

    #[test]
    fn test_app_id_is_deterministic() {
        let multisig = Address::new("0xmultisig");
        let request = RequestId::new("req-1");
        let first = AppId::derive(&multisig, &request, "paymentApp");
        let second = AppId::derive(&multisig, &request, "paymentApp");
        let other = AppId::derive(&multisig, &RequestId::new("req-2"), "paymentApp");

        assert_eq!(first, second);
        assert_ne!(first, other);
        assert!(first.as_str().starts_with("0x"));
    }

    #[test]
    fn test_digest_hex_serialization() {
        let digest = Digest::of(b"tandem");
        let json = serde_json::to_string(&digest).unwrap();
        assert!(json.starts_with("\"0x"));

        let decoded: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, digest);
        assert!(serde_json::from_str::<Digest>("\"0x1234\"").is_err());
    }

    #[test]
    fn test_signature_hex_serialization() {
        let signature = Signature::from_bytes(vec![1, 2, 3, 255]);
        let json = serde_json::to_string(&signature).unwrap();
        assert_eq!(json, "\"0x010203ff\"");
        assert_eq!(serde_json::from_str::<Signature>(&json).unwrap(), signature);
    }
}
