//! The long-lived node identity key.
//!
//! Every node carries one ed25519 keypair, generated on first run and stored
//! at `<system_dir>/node.key`. The blake3 digest of the public key is the
//! node's stable identity on multicast and tracker announcements and the
//! value handshake tokens are bound to.

use std::{fmt, path::Path, str::FromStr};

use anyhow::Context;
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

/// Public identity of a node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey([u8; 32]);

/// A node is identified by its public key.
pub type NodeId = PublicKey;

impl PublicKey {
    /// The raw public key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse from raw bytes, checking that they form a valid curve point.
    pub fn from_bytes(bytes: &[u8; 32]) -> anyhow::Result<Self> {
        VerifyingKey::from_bytes(bytes).context("invalid public key")?;
        Ok(Self(*bytes))
    }

    /// Stable digest of this identity, as used on the wire.
    pub fn digest(&self) -> [u8; 32] {
        *blake3::hash(&self.0).as_bytes()
    }

    /// First five bytes of the key as hex, for log output.
    pub fn fmt_short(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0[..5])
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({self})")
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&data_encoding::HEXLOWER.encode(&self.0))
    }
}

impl FromStr for PublicKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        anyhow::ensure!(s.len() == 64, "invalid public key length");
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Self::from_bytes(&bytes)
    }
}

/// The node's secret identity key.
#[derive(Clone)]
pub struct SecretKey(SigningKey);

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey(..)")
    }
}

impl SecretKey {
    /// Generate a new key with the given randomness source.
    pub fn generate<R: CryptoRngCore + ?Sized>(rng: &mut R) -> Self {
        Self(SigningKey::generate(rng))
    }

    /// Create from the raw secret bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self(SigningKey::from_bytes(bytes))
    }

    /// The raw secret bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// The corresponding public identity.
    pub fn public(&self) -> PublicKey {
        PublicKey(self.0.verifying_key().to_bytes())
    }
}

impl FromStr for SecretKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        anyhow::ensure!(s.len() == 64, "invalid secret key length");
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self::from_bytes(&bytes))
    }
}

/// Load the node key from `key_path`, or generate one and store it there.
///
/// A fresh key is written to a temporary file first and moved into place, so
/// a crash cannot leave a truncated key file behind.
pub async fn load_node_key(key_path: &Path) -> anyhow::Result<SecretKey> {
    if key_path.exists() {
        let text = tokio::fs::read_to_string(key_path).await?;
        let key = text.trim().parse().context("invalid node key file")?;
        return Ok(key);
    }

    let key = SecretKey::generate(&mut rand_core::OsRng);
    let encoded = data_encoding::HEXLOWER.encode(&key.to_bytes());

    let parent = key_path
        .parent()
        .with_context(|| format!("no parent directory for '{}'", key_path.display()))?;
    tokio::fs::create_dir_all(parent).await?;

    let (file, temp_path) = tempfile::NamedTempFile::new_in(parent)
        .context("unable to create tempfile")?
        .into_parts();
    let mut file = tokio::fs::File::from_std(file);
    file.write_all(encoded.as_bytes())
        .await
        .context("unable to write node key")?;
    file.flush().await?;
    drop(file);

    tokio::fs::rename(&temp_path, key_path)
        .await
        .context("failed to move node key into place")?;
    temp_path.keep().ok();

    Ok(key)
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;

    #[test]
    fn public_key_text_roundtrip() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let key = SecretKey::generate(&mut rng);
        let public = key.public();
        assert_eq!(public.to_string().parse::<PublicKey>().unwrap(), public);
        assert_eq!(
            data_encoding::HEXLOWER
                .encode(&key.to_bytes())
                .parse::<SecretKey>()
                .unwrap()
                .public(),
            public
        );
    }

    #[test]
    fn digest_is_stable() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let key = SecretKey::generate(&mut rng);
        assert_eq!(key.public().digest(), key.public().digest());
    }

    #[tokio::test]
    async fn load_generates_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.key");
        let first = load_node_key(&path).await.unwrap();
        let second = load_node_key(&path).await.unwrap();
        assert_eq!(first.public(), second.public());
    }
}
