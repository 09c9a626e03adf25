//! The peer wire protocol.
//!
//! Every frame on a session is a `u32` big-endian length prefix followed by a
//! postcard-encoded [`Message`]; the enum's variant index is the first
//! payload byte, so the tag values below are literal on the wire. Two
//! single-byte frames outside the tag space carry the transport-level
//! keepalive probe and its reply.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use skiff_base::{CtHash, FolderId, Secret};
use skiff_sync::{PathRevision, SignedMeta};

/// Upper bound on one frame. Has to fit a full-size chunk block reply.
pub const MAX_FRAME_SIZE: usize = 32 * 1024 * 1024;

const PING_BYTE: u8 = 0xff;
const PONG_BYTE: u8 = 0xfe;

/// First message on a session, exactly once per direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Keyed hash binding folder membership to the sender's node digest.
    pub auth_token: [u8; 32],
    /// Software name, for state display.
    pub client_name: String,
    /// Software version string.
    pub user_agent: String,
    /// Folder this session carries.
    pub folder_id: FolderId,
}

/// Which chunks of a meta record a peer claims to hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bitfield {
    len: u32,
    bits: Vec<u8>,
}

impl Bitfield {
    /// All-zero bitfield for `len` chunks.
    pub fn new(len: usize) -> Self {
        Self {
            len: len as u32,
            bits: vec![0; len.div_ceil(8)],
        }
    }

    /// Number of chunk slots.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// True when there are no slots.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether bit `idx` is set.
    pub fn get(&self, idx: usize) -> bool {
        if idx >= self.len() {
            return false;
        }
        self.bits[idx / 8] & (1 << (idx % 8)) != 0
    }

    /// Set bit `idx`.
    pub fn set(&mut self, idx: usize, value: bool) {
        if idx >= self.len() {
            return;
        }
        if value {
            self.bits[idx / 8] |= 1 << (idx % 8);
        } else {
            self.bits[idx / 8] &= !(1 << (idx % 8));
        }
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        (0..self.len()).filter(|&i| self.get(i)).count()
    }

    /// Whether every bit is set.
    pub fn is_full(&self) -> bool {
        self.count() == self.len()
    }
}

/// The session message set. Variant order fixes the wire tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Tag 0. First legal message in each direction.
    Handshake(Handshake),
    /// Tag 1. Sender will not serve block requests.
    Choke,
    /// Tag 2. Sender will serve block requests again.
    Unchoke,
    /// Tag 3. Sender wants something from the receiver.
    Interested,
    /// Tag 4. Sender no longer wants anything.
    NotInterested,
    /// Tag 5. Announce a meta record and which of its chunks are held.
    HaveMeta {
        /// The announced record.
        revision: PathRevision,
        /// Chunks of that record the sender holds.
        bitfield: Bitfield,
    },
    /// Tag 6. Incremental chunk availability.
    HaveChunk {
        /// The newly assembled chunk.
        ct_hash: CtHash,
    },
    /// Tag 7. Ask for a signed meta record.
    MetaRequest {
        /// Record being requested.
        revision: PathRevision,
    },
    /// Tag 8. Reply to a [`Message::MetaRequest`].
    MetaReply {
        /// The signed record.
        meta: SignedMeta,
        /// Chunks of that record the sender holds.
        bitfield: Bitfield,
    },
    /// Tag 9. Ask for a ciphertext range.
    BlockRequest {
        /// Chunk address.
        ct_hash: CtHash,
        /// Offset into the ciphertext.
        offset: u32,
        /// Number of bytes wanted.
        size: u32,
    },
    /// Tag 10. Reply to a [`Message::BlockRequest`].
    BlockReply {
        /// Chunk address.
        ct_hash: CtHash,
        /// Offset into the ciphertext.
        offset: u32,
        /// The ciphertext bytes.
        data: Bytes,
    },
}

/// One frame as seen by the session actor.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Keepalive probe.
    Ping,
    /// Keepalive reply.
    Pong,
    /// A protocol message.
    Message(Message),
}

/// Length-prefixed postcard codec for session frames.
#[derive(Debug, Default)]
pub struct SessionCodec;

impl Decoder for SessionCodec {
    type Item = Frame;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len_bytes: [u8; 4] = src[..4].try_into().expect("length checked");
        let frame_len = u32::from_be_bytes(len_bytes) as usize;
        anyhow::ensure!(
            frame_len <= MAX_FRAME_SIZE,
            "frame too large: {frame_len} bytes"
        );
        if src.len() < 4 + frame_len {
            src.reserve(4 + frame_len - src.len());
            return Ok(None);
        }
        if frame_len == 1 && src[4] == PING_BYTE {
            src.advance(5);
            return Ok(Some(Frame::Ping));
        }
        if frame_len == 1 && src[4] == PONG_BYTE {
            src.advance(5);
            return Ok(Some(Frame::Pong));
        }
        let message = postcard::from_bytes(&src[4..4 + frame_len])?;
        src.advance(4 + frame_len);
        Ok(Some(Frame::Message(message)))
    }
}

impl Encoder<Frame> for SessionCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Frame::Ping => {
                dst.put_u32(1);
                dst.put_u8(PING_BYTE);
            }
            Frame::Pong => {
                dst.put_u32(1);
                dst.put_u8(PONG_BYTE);
            }
            Frame::Message(message) => {
                let payload = postcard::to_stdvec(&message)?;
                anyhow::ensure!(
                    payload.len() <= MAX_FRAME_SIZE,
                    "frame too large: {} bytes",
                    payload.len()
                );
                dst.put_u32(payload.len() as u32);
                dst.extend_from_slice(&payload);
            }
        }
        Ok(())
    }
}

/// The session token for a node digest in a folder.
///
/// `keyed_hash(token_key, folder_id || digest)`: anyone holding any
/// derivation of the folder secret can compute it, nobody else can, and it
/// pins the folder to the transport peer's long-lived identity. Each side
/// sends the token over its own digest and checks the one it expects for the
/// remote digest.
pub fn handshake_token(secret: &Secret, node_digest: &[u8; 32]) -> [u8; 32] {
    let mut input = [0u8; 64];
    input[..32].copy_from_slice(secret.folder_id().as_bytes());
    input[32..].copy_from_slice(node_digest);
    *blake3::keyed_hash(&secret.token_key(), &input).as_bytes()
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use skiff_base::Capability;

    use super::*;

    fn secret() -> Secret {
        let mut rng = ChaCha8Rng::seed_from_u64(51);
        Secret::generate(&mut rng)
    }

    fn roundtrip(message: Message) -> Message {
        let mut codec = SessionCodec;
        let mut buf = BytesMut::new();
        codec.encode(Frame::Message(message), &mut buf).unwrap();
        match codec.decode(&mut buf).unwrap().unwrap() {
            Frame::Message(message) => {
                assert!(buf.is_empty());
                message
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn message_tags_are_stable() {
        // the first payload byte is the wire tag
        let cases: Vec<(Message, u8)> = vec![
            (Message::Choke, 1),
            (Message::Unchoke, 2),
            (Message::Interested, 3),
            (Message::NotInterested, 4),
            (
                Message::HaveChunk {
                    ct_hash: CtHash::new(b"x"),
                },
                6,
            ),
            (
                Message::BlockRequest {
                    ct_hash: CtHash::new(b"x"),
                    offset: 0,
                    size: 1,
                },
                9,
            ),
        ];
        for (message, tag) in cases {
            let payload = postcard::to_stdvec(&message).unwrap();
            assert_eq!(payload[0], tag, "{message:?}");
        }
    }

    #[test]
    fn codec_roundtrips() {
        let messages = vec![
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::HaveChunk {
                ct_hash: CtHash::new(b"chunk"),
            },
            Message::BlockRequest {
                ct_hash: CtHash::new(b"chunk"),
                offset: 4,
                size: 1024,
            },
            Message::BlockReply {
                ct_hash: CtHash::new(b"chunk"),
                offset: 4,
                data: Bytes::from_static(b"ciphertext bytes"),
            },
        ];
        for message in messages {
            assert_eq!(roundtrip(message.clone()), message);
        }
    }

    #[test]
    fn codec_handles_partial_input() {
        let mut codec = SessionCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::Message(Message::Interested), &mut buf)
            .unwrap();
        let full = buf.clone();

        let mut partial = BytesMut::from(&full[..3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[3..]);
        assert_eq!(
            codec.decode(&mut partial).unwrap().unwrap(),
            Frame::Message(Message::Interested)
        );
    }

    #[test]
    fn codec_rejects_oversized_frames() {
        let mut codec = SessionCodec;
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        buf.put_u8(0);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn ping_pong_frames() {
        let mut codec = SessionCodec;
        let mut buf = BytesMut::new();
        codec.encode(Frame::Ping, &mut buf).unwrap();
        codec.encode(Frame::Pong, &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Frame::Ping);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Frame::Pong);
    }

    #[test]
    fn bitfield_bits() {
        let mut bitfield = Bitfield::new(10);
        assert_eq!(bitfield.len(), 10);
        assert_eq!(bitfield.count(), 0);
        bitfield.set(0, true);
        bitfield.set(9, true);
        assert!(bitfield.get(0));
        assert!(!bitfield.get(5));
        assert!(bitfield.get(9));
        // out of range is ignored
        bitfield.set(10, true);
        assert!(!bitfield.get(10));
        assert_eq!(bitfield.count(), 2);
        assert!(!bitfield.is_full());
        for i in 0..10 {
            bitfield.set(i, true);
        }
        assert!(bitfield.is_full());
    }

    #[test]
    fn tokens_agree_across_capabilities() {
        let secret = secret();
        let digest = [9u8; 32];
        let from_owner = handshake_token(&secret, &digest);
        let from_download = handshake_token(
            &secret.derive(Capability::Download).unwrap(),
            &digest,
        );
        assert_eq!(from_owner, from_download);
    }

    #[test]
    fn tokens_differ_per_digest_and_folder() {
        let secret = secret();
        let mut rng = ChaCha8Rng::seed_from_u64(52);
        let other = Secret::generate(&mut rng);
        assert_ne!(
            handshake_token(&secret, &[1u8; 32]),
            handshake_token(&secret, &[2u8; 32])
        );
        assert_ne!(
            handshake_token(&secret, &[1u8; 32]),
            handshake_token(&other, &[1u8; 32])
        );
    }
}
