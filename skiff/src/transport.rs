//! The transport seam.
//!
//! Peer sessions are generic over any byte stream; what the session layer
//! needs from the transport below is an established stream plus the remote
//! node's authenticated identity. In production deployments that identity
//! comes from the TLS layer's peer certificate; this module provides the
//! plain-stream stand-in used for direct TCP: each side writes its public
//! key first and reads the peer's.

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use skiff_base::{NodeId, PublicKey, SecretKey};

/// Exchange node identities over a fresh stream.
///
/// Both sides call this symmetrically right after connecting.
pub async fn exchange_node_ids<S>(stream: &mut S, local: &SecretKey) -> Result<NodeId>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(local.public().as_bytes())
        .await
        .context("failed to send node id")?;
    stream.flush().await?;

    let mut remote = [0u8; 32];
    stream
        .read_exact(&mut remote)
        .await
        .context("failed to read peer node id")?;
    PublicKey::from_bytes(&remote).context("peer sent an invalid node id")
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;

    #[tokio::test]
    async fn exchange_is_symmetric() {
        let mut rng = ChaCha8Rng::seed_from_u64(71);
        let alice = SecretKey::generate(&mut rng);
        let bob = SecretKey::generate(&mut rng);
        let (mut a, mut b) = tokio::io::duplex(256);

        let (a_result, b_result) = tokio::join!(
            exchange_node_ids(&mut a, &alice),
            exchange_node_ids(&mut b, &bob),
        );
        assert_eq!(a_result.unwrap(), bob.public());
        assert_eq!(b_result.unwrap(), alice.public());
    }
}
