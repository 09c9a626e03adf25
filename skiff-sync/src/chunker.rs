//! Content-defined chunking and chunk encryption.
//!
//! Files are split on content-defined boundaries with a table-driven rolling
//! hash, so a small edit shifts at most a couple of chunk boundaries instead
//! of re-addressing the whole file. Each chunk is then sealed with
//! ChaCha20-Poly1305 under the folder content key; chunks are addressed by
//! the blake3 hash of their ciphertext.
//!
//! The IV of a chunk is derived from its plaintext with a keyed hash rather
//! than drawn at random, which makes sealing deterministic: the same
//! plaintext under the same folder secret always yields the same ciphertext
//! and therefore the same address, so identical content deduplicates across
//! peers.

use std::io::{self, Read};
use std::sync::OnceLock;

use bytes::{Bytes, BytesMut};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use skiff_base::CtHash;

use crate::meta::ChunkInfo;

/// Smallest chunk the splitter will emit (final chunk of a file excepted).
pub const MIN_CHUNK_SIZE: usize = 64 * 1024;
/// Hard upper bound on chunk size.
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;
/// Mask bits for the boundary test, tuned for a ~1 MiB mean chunk.
const MASK_BITS: u32 = 20;

const TABLE_CONTEXT: &str = "skiff v1 chunker table";

/// The per-byte gear table, filled deterministically from blake3 so every
/// build of the daemon splits identically.
fn gear_table() -> &'static [u64; 256] {
    static TABLE: OnceLock<[u64; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut bytes = [0u8; 256 * 8];
        let mut hasher = blake3::Hasher::new_derive_key(TABLE_CONTEXT);
        hasher.update(b"gear");
        hasher.finalize_xof().fill(&mut bytes);
        let mut table = [0u64; 256];
        for (i, chunk) in bytes.chunks_exact(8).enumerate() {
            table[i] = u64::from_le_bytes(chunk.try_into().expect("chunks of 8"));
        }
        table
    })
}

/// Content-defined splitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunker {
    min_size: usize,
    max_size: usize,
    mask: u64,
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE, MASK_BITS)
    }
}

impl Chunker {
    /// Create a splitter with explicit bounds. `mask_bits` sets the mean
    /// chunk size to roughly `2^mask_bits` bytes.
    pub fn new(min_size: usize, max_size: usize, mask_bits: u32) -> Self {
        assert!(min_size < max_size, "min_size must be below max_size");
        Self {
            min_size,
            max_size,
            mask: (1u64 << mask_bits) - 1,
        }
    }

    /// Find the cut point for the chunk starting at the beginning of `data`.
    ///
    /// Returns `None` if more input is needed before a decision can be made.
    /// With `eof` set, always returns a cut (the remainder becomes the final,
    /// possibly short, chunk).
    pub fn cut_point(&self, data: &[u8], eof: bool) -> Option<usize> {
        if data.len() >= self.max_size {
            if let Some(boundary) = self.scan(&data[..self.max_size]) {
                return Some(boundary);
            }
            return Some(self.max_size);
        }
        if let Some(boundary) = self.scan(data) {
            return Some(boundary);
        }
        if eof {
            if data.is_empty() {
                return None;
            }
            return Some(data.len());
        }
        None
    }

    fn scan(&self, data: &[u8]) -> Option<usize> {
        if data.len() <= self.min_size {
            return None;
        }
        let table = gear_table();
        let mut state: u64 = 0;
        // The rolling state has an effective 64 byte window through the
        // shift; preheat it over the tail of the minimum region.
        let preheat = self.min_size.saturating_sub(64);
        for (idx, &byte) in data[preheat..].iter().enumerate() {
            state = (state << 1).wrapping_add(table[byte as usize]);
            let pos = preheat + idx + 1;
            if pos > self.min_size && state & self.mask == 0 {
                return Some(pos);
            }
        }
        None
    }

    /// Split everything read from `reader` into plaintext chunks.
    pub fn split<R: Read>(&self, reader: R) -> Chunks<R> {
        Chunks {
            chunker: self.clone(),
            reader,
            buf: BytesMut::with_capacity(self.max_size.min(4 * 1024 * 1024)),
            eof: false,
        }
    }
}

/// Iterator over the plaintext chunks of a reader.
#[derive(Debug)]
pub struct Chunks<R> {
    chunker: Chunker,
    reader: R,
    buf: BytesMut,
    eof: bool,
}

impl<R: Read> Iterator for Chunks<R> {
    type Item = io::Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if !self.eof && self.buf.len() < self.chunker.max_size {
                let mut scratch = [0u8; 64 * 1024];
                match self.reader.read(&mut scratch) {
                    Ok(0) => self.eof = true,
                    Ok(n) => {
                        self.buf.extend_from_slice(&scratch[..n]);
                        continue;
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Some(Err(err)),
                }
            }
            match self.chunker.cut_point(&self.buf, self.eof) {
                Some(cut) => return Some(Ok(self.buf.split_to(cut).freeze())),
                None if self.eof => return None,
                None => continue,
            }
        }
    }
}

/// A freshly sealed chunk: its descriptor plus the ciphertext bytes.
#[derive(Debug, Clone)]
pub struct SealedChunk {
    /// Descriptor to store in the meta record.
    pub info: ChunkInfo,
    /// The ciphertext.
    pub ciphertext: Bytes,
}

/// Errors from sealing or opening chunks.
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    /// Authenticated decryption failed.
    #[error("chunk decryption failed")]
    Decrypt,
    /// Encryption failed.
    #[error("chunk encryption failed")]
    Encrypt,
    /// The ciphertext does not match the expected address.
    #[error("ciphertext hash mismatch")]
    HashMismatch,
}

/// Seals and opens chunks under a folder content key.
#[derive(Clone)]
pub struct ChunkCipher {
    key: [u8; 32],
}

impl std::fmt::Debug for ChunkCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChunkCipher(..)")
    }
}

impl ChunkCipher {
    /// Create a cipher from the folder content key.
    pub fn new(content_key: [u8; 32]) -> Self {
        Self { key: content_key }
    }

    /// Encrypt one plaintext chunk.
    pub fn seal(&self, plaintext: &[u8]) -> Result<SealedChunk, ChunkError> {
        let mut iv = [0u8; 12];
        iv.copy_from_slice(&blake3::keyed_hash(&self.key, plaintext).as_bytes()[..12]);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|_| ChunkError::Encrypt)?;
        let info = ChunkInfo {
            ct_hash: CtHash::new(&ciphertext),
            size: ciphertext.len() as u32,
            iv,
        };
        Ok(SealedChunk {
            info,
            ciphertext: Bytes::from(ciphertext),
        })
    }

    /// Decrypt a chunk, verifying its address first.
    pub fn open(&self, info: &ChunkInfo, ciphertext: &[u8]) -> Result<Vec<u8>, ChunkError> {
        if CtHash::new(ciphertext) != info.ct_hash {
            return Err(ChunkError::HashMismatch);
        }
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        cipher
            .decrypt(Nonce::from_slice(&info.iv), ciphertext)
            .map_err(|_| ChunkError::Decrypt)
    }
}

/// Chunk and seal everything read from `reader`.
///
/// Returns the descriptor list and the total plaintext size. Ciphertext is
/// dropped after hashing; it is re-derived on demand when serving blocks.
pub fn index_chunks<R: Read>(
    chunker: &Chunker,
    cipher: &ChunkCipher,
    reader: R,
) -> io::Result<(Vec<ChunkInfo>, u64)> {
    let mut infos = Vec::new();
    let mut total = 0u64;
    for chunk in chunker.split(reader) {
        let chunk = chunk?;
        total += chunk.len() as u64;
        let sealed = cipher
            .seal(&chunk)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        infos.push(sealed.info);
    }
    Ok((infos, total))
}
