//! The blake3 content address used for ciphertext chunks.

use std::{fmt, str::FromStr};

use serde::{
    de::{self, SeqAccess},
    ser::SerializeTuple,
    Deserialize, Deserializer, Serialize, Serializer,
};

/// Address of an encrypted chunk: the blake3 hash of its ciphertext.
///
/// Hashing the ciphertext rather than the plaintext means a peer holding only
/// a download capability can still verify and route chunks it cannot decrypt.
#[derive(PartialEq, Eq, Copy, Clone, Hash)]
pub struct CtHash(blake3::Hash);

impl CtHash {
    /// Hash the given ciphertext.
    pub fn new(ciphertext: impl AsRef<[u8]>) -> Self {
        Self(blake3::hash(ciphertext.as_ref()))
    }

    /// Bytes of the hash.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Create a `CtHash` from its raw bytes representation.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(blake3::Hash::from_bytes(bytes))
    }

    /// Convert the hash to a hex string.
    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    /// First five bytes as hex, for log output.
    pub fn fmt_short(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.as_bytes()[..5])
    }
}

impl fmt::Debug for CtHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CtHash({self})")
    }
}

impl fmt::Display for CtHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = [0u8; 52];
        data_encoding::BASE32_NOPAD.encode_mut(self.as_bytes(), &mut out);
        let text = std::str::from_utf8_mut(out.as_mut()).expect("base32 is ascii");
        text.make_ascii_lowercase();
        f.write_str(text)
    }
}

impl FromStr for CtHash {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() == 64 {
            let mut out = [0u8; 32];
            if hex::decode_to_slice(bytes, &mut out).is_ok() {
                return Ok(Self::from_bytes(out));
            }
        }
        anyhow::ensure!(bytes.len() == 52, "invalid base32 length");
        let mut upper = [0u8; 52];
        upper.copy_from_slice(bytes);
        upper.make_ascii_uppercase();
        let mut out = [0u8; 32];
        data_encoding::BASE32_NOPAD
            .decode_mut(&upper, &mut out)
            .map_err(|_| anyhow::anyhow!("invalid base32"))?;
        Ok(Self::from_bytes(out))
    }
}

impl AsRef<[u8]> for CtHash {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl From<[u8; 32]> for CtHash {
    fn from(value: [u8; 32]) -> Self {
        Self(blake3::Hash::from(value))
    }
}

impl From<CtHash> for [u8; 32] {
    fn from(value: CtHash) -> Self {
        *value.as_bytes()
    }
}

impl From<blake3::Hash> for CtHash {
    fn from(value: blake3::Hash) -> Self {
        Self(value)
    }
}

impl PartialOrd for CtHash {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CtHash {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.as_bytes().cmp(other.0.as_bytes())
    }
}

impl Serialize for CtHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            let mut tup = serializer.serialize_tuple(32)?;
            for byte in self.as_bytes() {
                tup.serialize_element(byte)?;
            }
            tup.end()
        }
    }
}

impl<'de> Deserialize<'de> for CtHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(de::Error::custom)
        } else {
            deserializer.deserialize_tuple(32, FixedVisitor)
        }
    }
}

struct FixedVisitor;

impl<'de> de::Visitor<'de> for FixedVisitor {
    type Value = CtHash;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "an array of 32 bytes")
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut bytes = [0u8; 32];
        for (idx, byte) in bytes.iter_mut().enumerate() {
            *byte = seq
                .next_element()?
                .ok_or_else(|| de::Error::invalid_length(idx, &self))?;
        }
        Ok(CtHash::from_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_roundtrip_display() {
        let hash = CtHash::new(b"hello");
        let text = hash.to_string();
        assert_eq!(text.len(), 52);
        assert_eq!(text.parse::<CtHash>().unwrap(), hash);
        assert_eq!(hash.to_hex().parse::<CtHash>().unwrap(), hash);
    }

    #[test]
    fn hash_postcard_is_plain_bytes() {
        let hash = CtHash::new(b"hello");
        let bytes = postcard::to_stdvec(&hash).unwrap();
        assert_eq!(bytes.as_slice(), hash.as_bytes());
        let back: CtHash = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back, hash);
    }

    #[test]
    fn rejects_garbage() {
        assert!("not a hash".parse::<CtHash>().is_err());
    }
}
