//! Folder secrets.
//!
//! A folder is identified and protected by a single capability token, the
//! [`Secret`]. Four levels exist, in descending privilege: owner, read-write,
//! read-only and download-only. Any secret can derive every weaker one with a
//! one-way function, and all derivations of the same folder agree on the
//! public [`FolderId`] fingerprint.

use std::{cmp::Ordering, fmt, str::FromStr};

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};

const WRITER_CONTEXT: &str = "skiff v1 writer key";
const CONTENT_CONTEXT: &str = "skiff v1 content key";
const PATH_CONTEXT: &str = "skiff v1 path key";
const TOKEN_CONTEXT: &str = "skiff v1 token key";

/// Current version marker in the textual secret form.
const TEXT_VERSION: char = '1';

/// Errors produced by [`Secret`] operations.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    /// The textual form could not be parsed.
    #[error("invalid secret: {0}")]
    InvalidSecret(&'static str),
    /// The operation needs a stronger capability than this secret carries.
    #[error("capability {has} is insufficient, {needs} required")]
    CapabilityInsufficient {
        /// Capability of the secret the operation was attempted on.
        has: Capability,
        /// Weakest capability that permits the operation.
        needs: Capability,
    },
    /// Signature verification failed.
    #[error("bad signature")]
    BadSignature(#[from] ed25519_dalek::SignatureError),
}

/// Access level of a [`Secret`], in descending privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// Holds the root seed. Can rotate subordinate keys.
    Owner,
    /// Can sign new meta records.
    ReadWrite,
    /// Can decrypt paths and content.
    ReadOnly,
    /// Can verify and route ciphertext only.
    Download,
}

impl Capability {
    /// Privilege rank, higher is stronger.
    fn rank(&self) -> u8 {
        match self {
            Capability::Owner => 3,
            Capability::ReadWrite => 2,
            Capability::ReadOnly => 1,
            Capability::Download => 0,
        }
    }

    fn tag(&self) -> char {
        match self {
            Capability::Owner => 'A',
            Capability::ReadWrite => 'B',
            Capability::ReadOnly => 'C',
            Capability::Download => 'D',
        }
    }

    fn from_tag(tag: char) -> Option<Self> {
        match tag {
            'A' => Some(Capability::Owner),
            'B' => Some(Capability::ReadWrite),
            'C' => Some(Capability::ReadOnly),
            'D' => Some(Capability::Download),
            _ => None,
        }
    }
}

impl PartialOrd for Capability {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Capability {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Owner => "owner",
            Capability::ReadWrite => "read-write",
            Capability::ReadOnly => "read-only",
            Capability::Download => "download",
        };
        f.write_str(name)
    }
}

/// Public fingerprint of a folder, identical across all derivations of its
/// secret.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FolderId([u8; 32]);

impl FolderId {
    /// The raw fingerprint bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hex form, used in file names and peer URLs.
    pub fn to_hex(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0)
    }

    /// First five bytes as hex, for log output.
    pub fn fmt_short(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0[..5])
    }
}

impl fmt::Debug for FolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FolderId({})", self.to_hex())
    }
}

impl fmt::Display for FolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for FolderId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        anyhow::ensure!(s.len() == 64, "invalid folder id length");
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

/// A folder capability token.
///
/// The key material per level:
///
/// - owner: 32 byte root seed, everything below derives from it
/// - read-write: ed25519 signing key for meta records
/// - read-only: the writer's verifying key plus the symmetric content key
/// - download: the verifying key alone
#[derive(Clone)]
pub struct Secret {
    kind: SecretKind,
}

#[derive(Clone)]
enum SecretKind {
    Owner { seed: [u8; 32], signing: SigningKey },
    ReadWrite { signing: SigningKey },
    ReadOnly { verifying: VerifyingKey, content_key: [u8; 32] },
    Download { verifying: VerifyingKey },
}

impl Secret {
    /// Generate a fresh owner secret.
    pub fn generate<R: CryptoRngCore + ?Sized>(rng: &mut R) -> Self {
        let mut seed = [0u8; 32];
        rng.fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    /// Build the owner secret from a 32 byte root seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(&blake3::derive_key(WRITER_CONTEXT, &seed));
        Self {
            kind: SecretKind::Owner { seed, signing },
        }
    }

    /// The capability level of this secret.
    pub fn capability(&self) -> Capability {
        match &self.kind {
            SecretKind::Owner { .. } => Capability::Owner,
            SecretKind::ReadWrite { .. } => Capability::ReadWrite,
            SecretKind::ReadOnly { .. } => Capability::ReadOnly,
            SecretKind::Download { .. } => Capability::Download,
        }
    }

    /// Derive a secret of the given (equal or weaker) capability.
    ///
    /// Derivation is deterministic and one-way: the reverse direction is a
    /// key-recovery problem.
    pub fn derive(&self, target: Capability) -> Result<Secret, SecretError> {
        if target > self.capability() {
            return Err(SecretError::CapabilityInsufficient {
                has: self.capability(),
                needs: target,
            });
        }
        let kind = match target {
            Capability::Owner => self.kind.clone(),
            Capability::ReadWrite => SecretKind::ReadWrite {
                signing: self.signing_key().expect("rank checked").clone(),
            },
            Capability::ReadOnly => SecretKind::ReadOnly {
                verifying: self.verifying_key(),
                content_key: self.content_key().expect("rank checked"),
            },
            Capability::Download => SecretKind::Download {
                verifying: self.verifying_key(),
            },
        };
        Ok(Secret { kind })
    }

    /// The public fingerprint identifying this folder.
    ///
    /// Identical for every derivation of the same folder's secret.
    pub fn folder_id(&self) -> FolderId {
        FolderId(*blake3::hash(self.verifying_key().as_bytes()).as_bytes())
    }

    /// Sign `msg` with the folder writer key.
    ///
    /// Needs read-write capability or better.
    pub fn sign(&self, msg: &[u8]) -> Result<Signature, SecretError> {
        let signing = self
            .signing_key()
            .ok_or(SecretError::CapabilityInsufficient {
                has: self.capability(),
                needs: Capability::ReadWrite,
            })?;
        Ok(signing.sign(msg))
    }

    /// Verify a writer signature. Possible at every capability level.
    pub fn verify(&self, msg: &[u8], signature: &Signature) -> Result<(), SecretError> {
        self.verifying_key()
            .verify_strict(msg, signature)
            .map_err(SecretError::BadSignature)
    }

    /// Symmetric key for chunk content encryption.
    ///
    /// Needs read-only capability or better.
    pub fn content_key(&self) -> Result<[u8; 32], SecretError> {
        match &self.kind {
            SecretKind::Owner { signing, .. } | SecretKind::ReadWrite { signing } => {
                Ok(blake3::derive_key(CONTENT_CONTEXT, &signing.to_bytes()))
            }
            SecretKind::ReadOnly { content_key, .. } => Ok(*content_key),
            SecretKind::Download { .. } => Err(SecretError::CapabilityInsufficient {
                has: Capability::Download,
                needs: Capability::ReadOnly,
            }),
        }
    }

    /// Symmetric key for path-id derivation and path encryption.
    ///
    /// Needs read-only capability or better.
    pub fn path_key(&self) -> Result<[u8; 32], SecretError> {
        let content = self.content_key()?;
        Ok(blake3::derive_key(PATH_CONTEXT, &content))
    }

    /// Keyed-hash key for handshake session tokens.
    ///
    /// Derived from the public verifying key, so every capability level can
    /// compute and check tokens.
    pub fn token_key(&self) -> [u8; 32] {
        blake3::derive_key(TOKEN_CONTEXT, self.verifying_key().as_bytes())
    }

    fn verifying_key(&self) -> VerifyingKey {
        match &self.kind {
            SecretKind::Owner { signing, .. } | SecretKind::ReadWrite { signing } => {
                signing.verifying_key()
            }
            SecretKind::ReadOnly { verifying, .. } | SecretKind::Download { verifying } => {
                *verifying
            }
        }
    }

    fn signing_key(&self) -> Option<&SigningKey> {
        match &self.kind {
            SecretKind::Owner { signing, .. } | SecretKind::ReadWrite { signing } => Some(signing),
            _ => None,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match &self.kind {
            SecretKind::Owner { seed, .. } => seed.to_vec(),
            SecretKind::ReadWrite { signing } => signing.to_bytes().to_vec(),
            SecretKind::ReadOnly {
                verifying,
                content_key,
            } => {
                let mut out = Vec::with_capacity(64);
                out.extend_from_slice(verifying.as_bytes());
                out.extend_from_slice(content_key);
                out
            }
            SecretKind::Download { verifying } => verifying.as_bytes().to_vec(),
        }
    }

    fn from_payload(capability: Capability, payload: &[u8]) -> Result<Self, SecretError> {
        let kind = match capability {
            Capability::Owner => {
                let seed: [u8; 32] = payload
                    .try_into()
                    .map_err(|_| SecretError::InvalidSecret("bad payload length"))?;
                return Ok(Self::from_seed(seed));
            }
            Capability::ReadWrite => {
                let bytes: [u8; 32] = payload
                    .try_into()
                    .map_err(|_| SecretError::InvalidSecret("bad payload length"))?;
                SecretKind::ReadWrite {
                    signing: SigningKey::from_bytes(&bytes),
                }
            }
            Capability::ReadOnly => {
                if payload.len() != 64 {
                    return Err(SecretError::InvalidSecret("bad payload length"));
                }
                let verifying_bytes: [u8; 32] = payload[..32].try_into().expect("length checked");
                let verifying = VerifyingKey::from_bytes(&verifying_bytes)
                    .map_err(|_| SecretError::InvalidSecret("bad verifying key"))?;
                let content_key: [u8; 32] = payload[32..].try_into().expect("length checked");
                SecretKind::ReadOnly {
                    verifying,
                    content_key,
                }
            }
            Capability::Download => {
                let bytes: [u8; 32] = payload
                    .try_into()
                    .map_err(|_| SecretError::InvalidSecret("bad payload length"))?;
                let verifying = VerifyingKey::from_bytes(&bytes)
                    .map_err(|_| SecretError::InvalidSecret("bad verifying key"))?;
                SecretKind::Download { verifying }
            }
        };
        Ok(Secret { kind })
    }
}

impl fmt::Display for Secret {
    /// Textual form: capability tag, version character, base32 payload
    /// followed by a one byte blake3 checksum.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut payload = self.payload();
        let check = blake3::hash(&payload).as_bytes()[0];
        payload.push(check);
        let mut text = data_encoding::BASE32_NOPAD.encode(&payload);
        text.make_ascii_lowercase();
        write!(f, "{}{}{}", self.capability().tag(), TEXT_VERSION, text)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Secret({}, {})",
            self.capability(),
            self.folder_id().fmt_short()
        )
    }
}

impl FromStr for Secret {
    type Err = SecretError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        let tag = chars
            .next()
            .ok_or(SecretError::InvalidSecret("empty string"))?;
        let capability =
            Capability::from_tag(tag).ok_or(SecretError::InvalidSecret("unknown tag"))?;
        let version = chars
            .next()
            .ok_or(SecretError::InvalidSecret("missing version"))?;
        if version != TEXT_VERSION {
            return Err(SecretError::InvalidSecret("unsupported version"));
        }
        let body = chars.as_str().to_ascii_uppercase();
        let mut payload = data_encoding::BASE32_NOPAD
            .decode(body.as_bytes())
            .map_err(|_| SecretError::InvalidSecret("bad base32"))?;
        let check = payload
            .pop()
            .ok_or(SecretError::InvalidSecret("empty payload"))?;
        if blake3::hash(&payload).as_bytes()[0] != check {
            return Err(SecretError::InvalidSecret("checksum mismatch"));
        }
        Self::from_payload(capability, &payload)
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;

    fn owner() -> Secret {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        Secret::generate(&mut rng)
    }

    #[test]
    fn folder_id_stable_across_derivations() {
        let secret = owner();
        let id = secret.folder_id();
        for cap in [
            Capability::Owner,
            Capability::ReadWrite,
            Capability::ReadOnly,
            Capability::Download,
        ] {
            assert_eq!(secret.derive(cap).unwrap().folder_id(), id);
        }
        // second-order derivations agree too
        let ro = secret.derive(Capability::ReadOnly).unwrap();
        assert_eq!(ro.derive(Capability::Download).unwrap().folder_id(), id);
    }

    #[test]
    fn derive_refuses_upgrades() {
        let secret = owner();
        let download = secret.derive(Capability::Download).unwrap();
        for cap in [
            Capability::Owner,
            Capability::ReadWrite,
            Capability::ReadOnly,
        ] {
            assert!(matches!(
                download.derive(cap),
                Err(SecretError::CapabilityInsufficient { .. })
            ));
        }
        let ro = secret.derive(Capability::ReadOnly).unwrap();
        assert!(ro.derive(Capability::ReadWrite).is_err());
    }

    #[test]
    fn sign_and_verify_across_levels() {
        let secret = owner();
        let rw = secret.derive(Capability::ReadWrite).unwrap();
        let sig = rw.sign(b"record").unwrap();
        for cap in [Capability::ReadOnly, Capability::Download] {
            let weaker = secret.derive(cap).unwrap();
            weaker.verify(b"record", &sig).unwrap();
            assert!(matches!(
                weaker.sign(b"record"),
                Err(SecretError::CapabilityInsufficient { .. })
            ));
        }
        assert!(rw.verify(b"tampered", &sig).is_err());
    }

    #[test]
    fn download_has_no_content_key() {
        let secret = owner();
        let download = secret.derive(Capability::Download).unwrap();
        assert!(matches!(
            download.content_key(),
            Err(SecretError::CapabilityInsufficient { .. })
        ));
        assert!(download.path_key().is_err());
        // but tokens still work
        let _ = download.token_key();
    }

    #[test]
    fn content_key_agrees_between_writer_and_reader() {
        let secret = owner();
        let rw = secret.derive(Capability::ReadWrite).unwrap();
        let ro = secret.derive(Capability::ReadOnly).unwrap();
        assert_eq!(rw.content_key().unwrap(), ro.content_key().unwrap());
        assert_eq!(rw.path_key().unwrap(), ro.path_key().unwrap());
    }

    #[test]
    fn text_roundtrip() {
        let secret = owner();
        for cap in [
            Capability::Owner,
            Capability::ReadWrite,
            Capability::ReadOnly,
            Capability::Download,
        ] {
            let derived = secret.derive(cap).unwrap();
            let text = derived.to_string();
            assert_eq!(text.chars().next().unwrap(), cap.tag());
            let parsed: Secret = text.parse().unwrap();
            assert_eq!(parsed.capability(), cap);
            assert_eq!(parsed.folder_id(), secret.folder_id());
        }
    }

    #[test]
    fn text_rejects_corruption() {
        let text = owner().to_string();
        assert!(matches!(
            "Z1abc".parse::<Secret>(),
            Err(SecretError::InvalidSecret(_))
        ));
        assert!("".parse::<Secret>().is_err());
        // flip a payload character
        let mut corrupted = text.clone();
        let last = corrupted.pop().unwrap();
        corrupted.push(if last == 'a' { 'b' } else { 'a' });
        assert!(corrupted.parse::<Secret>().is_err());
    }
}
