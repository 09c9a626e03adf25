//! Signed meta records.
//!
//! One [`Meta`] describes one `(path, revision)` pair: the kind of filesystem
//! object, its encrypted path, and for files the ordered list of encrypted
//! chunks. A [`SignedMeta`] carries the writer signature over the canonical
//! encoding and is what travels between peers and into the index.

use std::fmt;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use ed25519_dalek::Signature;
use serde::{Deserialize, Serialize};
use skiff_base::{CtHash, Secret, SecretError};

/// Opaque identifier of a logical path, identical across peers of a folder.
///
/// Computed as a keyed blake3 hash of the normalized relative path under the
/// folder's path key, so peers without read capability learn nothing about
/// the name.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PathId([u8; 32]);

impl PathId {
    /// Derive the id for a normalized relative path.
    pub fn compute(path_key: &[u8; 32], normalized_path: &[u8]) -> Self {
        Self(*blake3::keyed_hash(path_key, normalized_path).as_bytes())
    }

    /// The raw id bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// First five bytes as hex, for log output.
    pub fn fmt_short(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0[..5])
    }
}

impl fmt::Debug for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PathId({})", self.fmt_short())
    }
}

/// Identifies one meta record: a path id at a specific revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathRevision {
    /// The logical path.
    pub path_id: PathId,
    /// Writer-assigned revision, wall-clock milliseconds.
    pub revision: u64,
}

/// What kind of filesystem object a meta record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetaKind {
    /// Regular file with a chunk list.
    File,
    /// Directory.
    Directory,
    /// Symbolic link; the target is carried encrypted.
    Symlink,
    /// Tombstone for a removed path.
    Deleted,
}

/// A path (or symlink target) encrypted under the folder path key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPath {
    iv: [u8; 12],
    ciphertext: Vec<u8>,
}

impl EncryptedPath {
    /// Encrypt a normalized path.
    ///
    /// The IV is derived from the plaintext, so the same path always encrypts
    /// to the same bytes within one folder.
    pub fn seal(path_key: &[u8; 32], plaintext: &[u8]) -> Result<Self, SecretError> {
        let mut iv = [0u8; 12];
        iv.copy_from_slice(&blake3::keyed_hash(path_key, plaintext).as_bytes()[..12]);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(path_key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|_| SecretError::InvalidSecret("path encryption failed"))?;
        Ok(Self { iv, ciphertext })
    }

    /// Decrypt back to the normalized path bytes.
    pub fn open(&self, path_key: &[u8; 32]) -> Result<Vec<u8>, SecretError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(path_key));
        cipher
            .decrypt(Nonce::from_slice(&self.iv), self.ciphertext.as_slice())
            .map_err(|_| SecretError::InvalidSecret("path decryption failed"))
    }
}

/// One encrypted chunk of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// blake3 of the ciphertext.
    pub ct_hash: CtHash,
    /// Ciphertext length in bytes (plaintext length + 16 byte tag).
    pub size: u32,
    /// Nonce the chunk was encrypted with.
    pub iv: [u8; 12],
}

impl ChunkInfo {
    /// Plaintext length of this chunk.
    pub fn plaintext_size(&self) -> u32 {
        self.size.saturating_sub(16)
    }
}

/// Description of one `(path, revision)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    /// The logical path this record describes.
    pub path_id: PathId,
    /// Writer-assigned revision. Higher wins.
    pub revision: u64,
    /// Object kind.
    pub kind: MetaKind,
    /// The relative path, encrypted under the folder path key.
    pub encrypted_path: EncryptedPath,
    /// Plaintext size in bytes. Zero for non-files.
    pub size: u64,
    /// Modification time, seconds since the unix epoch.
    pub mtime: i64,
    /// Ordered chunk list. Empty for non-files.
    pub chunks: Vec<ChunkInfo>,
    /// Encrypted symlink target, for [`MetaKind::Symlink`].
    pub symlink_target: Option<EncryptedPath>,
}

impl Meta {
    /// The `(path, revision)` identifier of this record.
    pub fn path_revision(&self) -> PathRevision {
        PathRevision {
            path_id: self.path_id,
            revision: self.revision,
        }
    }

    /// Plaintext byte offset at which chunk `idx` starts.
    pub fn chunk_plaintext_offset(&self, idx: usize) -> u64 {
        self.chunks[..idx]
            .iter()
            .map(|c| c.plaintext_size() as u64)
            .sum()
    }

    /// Position of a chunk in this record's chunk list.
    pub fn chunk_index(&self, ct_hash: &CtHash) -> Option<usize> {
        self.chunks.iter().position(|c| c.ct_hash == *ct_hash)
    }
}

/// A meta record plus the folder writer's signature over its canonical
/// encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedMeta {
    meta: Meta,
    signature: Signature,
}

impl SignedMeta {
    /// Sign a record with the folder writer key.
    ///
    /// Fails with `CapabilityInsufficient` below read-write capability.
    pub fn sign(meta: Meta, secret: &Secret) -> Result<Self, SecretError> {
        let bytes = canonical_bytes(&meta);
        let signature = secret.sign(&bytes)?;
        Ok(Self { meta, signature })
    }

    /// Verify the signature against any derivation of the folder secret.
    pub fn verify(&self, secret: &Secret) -> Result<(), SecretError> {
        secret.verify(&canonical_bytes(&self.meta), &self.signature)
    }

    /// The signed record.
    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    /// The writer signature.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Shorthand for the record's `(path, revision)` pair.
    pub fn path_revision(&self) -> PathRevision {
        self.meta.path_revision()
    }
}

fn canonical_bytes(meta: &Meta) -> Vec<u8> {
    postcard::to_stdvec(meta).expect("meta serialization is infallible")
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use skiff_base::Capability;

    use super::*;

    fn secret() -> Secret {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        Secret::generate(&mut rng)
    }

    fn sample_meta(secret: &Secret, revision: u64) -> Meta {
        let path_key = secret.path_key().unwrap();
        Meta {
            path_id: PathId::compute(&path_key, b"docs/readme.txt"),
            revision,
            kind: MetaKind::File,
            encrypted_path: EncryptedPath::seal(&path_key, b"docs/readme.txt").unwrap(),
            size: 5,
            mtime: 1_700_000_000,
            chunks: vec![ChunkInfo {
                ct_hash: CtHash::new(b"ciphertext"),
                size: 21,
                iv: [3u8; 12],
            }],
            symlink_target: None,
        }
    }

    #[test]
    fn sign_verify_roundtrip() {
        let secret = secret();
        let signed = SignedMeta::sign(sample_meta(&secret, 1), &secret).unwrap();
        signed.verify(&secret).unwrap();
        let download = secret.derive(Capability::Download).unwrap();
        signed.verify(&download).unwrap();
    }

    #[test]
    fn verify_rejects_tamper() {
        let secret = secret();
        let signed = SignedMeta::sign(sample_meta(&secret, 1), &secret).unwrap();
        let mut tampered = signed.clone();
        tampered.meta.revision = 2;
        assert!(tampered.verify(&secret).is_err());
    }

    #[test]
    fn readonly_cannot_sign() {
        let secret = secret();
        let ro = secret.derive(Capability::ReadOnly).unwrap();
        assert!(SignedMeta::sign(sample_meta(&secret, 1), &ro).is_err());
    }

    #[test]
    fn path_roundtrip_and_determinism() {
        let secret = secret();
        let path_key = secret.path_key().unwrap();
        let a = EncryptedPath::seal(&path_key, b"a/b/c").unwrap();
        let b = EncryptedPath::seal(&path_key, b"a/b/c").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.open(&path_key).unwrap(), b"a/b/c");
    }

    #[test]
    fn path_id_differs_per_folder() {
        let mut rng = ChaCha8Rng::seed_from_u64(12);
        let other = Secret::generate(&mut rng);
        let a = PathId::compute(&secret().path_key().unwrap(), b"x");
        let b = PathId::compute(&other.path_key().unwrap(), b"x");
        assert_ne!(a, b);
    }

    #[test]
    fn signed_meta_postcard_roundtrip() {
        let secret = secret();
        let signed = SignedMeta::sign(sample_meta(&secret, 9), &secret).unwrap();
        let bytes = postcard::to_stdvec(&signed).unwrap();
        let back: SignedMeta = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back, signed);
        back.verify(&secret).unwrap();
    }
}
