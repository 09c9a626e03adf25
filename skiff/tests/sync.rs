//! End-to-end synchronization scenarios over in-memory transports.

use std::{path::Path, time::Duration};

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tokio_util::codec::Framed;

use skiff::{folder::FolderParams, FolderGroup};
use skiff_base::{Capability, Secret, SecretKey};
use skiff_net::{proto::SessionCodec, read_handshake};
use skiff_sync::meta::{MetaKind, PathId};

struct Node {
    group: FolderGroup,
    root: std::path::PathBuf,
    _dirs: (tempfile::TempDir, tempfile::TempDir),
}

fn folder_secret(seed: u64) -> Secret {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    Secret::generate(&mut rng)
}

fn spawn_node(secret: Secret, node_seed: u64) -> Node {
    let root_dir = tempfile::tempdir().unwrap();
    let system_dir = tempfile::tempdir().unwrap();
    let root = root_dir.path().join("sync");
    std::fs::create_dir_all(&root).unwrap();

    let mut rng = ChaCha8Rng::seed_from_u64(node_seed);
    let node = SecretKey::generate(&mut rng).public();

    let mut params = FolderParams::new(secret, root.clone(), system_dir.path().to_path_buf(), node);
    // tests want snappy scheduling, not production cadence
    params.rechoke_interval = Duration::from_millis(100);
    params.pump_interval = Duration::from_millis(100);
    params.poll_interval = Duration::from_secs(3600);

    Node {
        group: FolderGroup::spawn(params).unwrap(),
        root,
        _dirs: (root_dir, system_dir),
    }
}

/// Connect two folder groups the way the daemon does, over a duplex pipe.
async fn connect(a: &Node, b: &Node) -> Result<(), skiff_net::SessionError> {
    let (stream_a, stream_b) = tokio::io::duplex(4 * 1024 * 1024);
    a.group
        .connect_session(stream_a, b.group.local_node())
        .await;
    let mut framed = Framed::new(stream_b, SessionCodec);
    let handshake = read_handshake(&mut framed).await?;
    b.group
        .accept_session(framed, a.group.local_node(), handshake)
        .await
}

async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..600 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

fn read_file(path: &Path) -> Option<Vec<u8>> {
    std::fs::read(path).ok()
}

#[tokio::test(flavor = "multi_thread")]
async fn two_node_single_file_sync() {
    let secret = folder_secret(1);
    let a = spawn_node(secret.clone(), 11);
    std::fs::create_dir_all(a.root.join("sub")).unwrap();
    std::fs::write(a.root.join("sub/hello.txt"), b"hi").unwrap();

    let b = spawn_node(secret.clone(), 12);
    connect(&a, &b).await.unwrap();

    let target = b.root.join("sub/hello.txt");
    wait_for("file to appear on node b", || {
        read_file(&target).as_deref() == Some(b"hi")
    })
    .await;

    // exactly one current file record for the path, verified and assembled
    let path_key = secret.path_key().unwrap();
    let path_id = PathId::compute(&path_key, b"sub/hello.txt");
    let current = b.group.index().current_meta(&path_id).unwrap().unwrap();
    assert_eq!(current.meta().kind, MetaKind::File);
    assert_eq!(current.meta().size, 2);
    current.verify(&secret).unwrap();
    assert!(b.group.index().is_assembled_path(&path_id).unwrap());
    let file_metas: Vec<_> = b
        .group
        .index()
        .all_meta()
        .unwrap()
        .into_iter()
        .filter(|m| m.meta().path_id == path_id)
        .collect();
    assert_eq!(file_metas.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn deletion_propagates() {
    let secret = folder_secret(2);
    let a = spawn_node(secret.clone(), 21);
    std::fs::write(a.root.join("doomed.txt"), b"bye").unwrap();

    let b = spawn_node(secret.clone(), 22);
    connect(&a, &b).await.unwrap();

    let target = b.root.join("doomed.txt");
    wait_for("file to appear on node b", || target.exists()).await;

    std::fs::remove_file(a.root.join("doomed.txt")).unwrap();
    wait_for("deletion to propagate", || !target.exists()).await;

    let path_key = secret.path_key().unwrap();
    let path_id = PathId::compute(&path_key, b"doomed.txt");
    let current = b.group.index().current_meta(&path_id).unwrap().unwrap();
    assert_eq!(current.meta().kind, MetaKind::Deleted);
}

#[tokio::test(flavor = "multi_thread")]
async fn readonly_node_receives_but_cannot_write() {
    let secret = folder_secret(3);
    let a = spawn_node(secret.clone(), 31);
    std::fs::write(a.root.join("classified.txt"), b"for your eyes only").unwrap();

    let readonly = secret.derive(Capability::ReadOnly).unwrap();
    let c = spawn_node(readonly.clone(), 32);
    connect(&a, &c).await.unwrap();

    let target = c.root.join("classified.txt");
    wait_for("read-only node to receive content", || {
        read_file(&target).as_deref() == Some(b"for your eyes only".as_slice())
    })
    .await;

    // the read-only capability cannot produce records node a would accept
    let stored = c.group.index().all_meta().unwrap();
    let meta = stored[0].meta().clone();
    assert!(skiff_sync::SignedMeta::sign(meta, &readonly).is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn revision_race_converges_to_newest() {
    let secret = folder_secret(4);

    let a = spawn_node(secret.clone(), 41);
    std::fs::write(a.root.join("file.txt"), b"v1").unwrap();
    let path_key = secret.path_key().unwrap();
    let path_id = PathId::compute(&path_key, b"file.txt");
    wait_for("node a to index v1", || {
        a.group.index().current_meta(&path_id).unwrap().is_some()
    })
    .await;
    let rev_a = a
        .group
        .index()
        .current_meta(&path_id)
        .unwrap()
        .unwrap()
        .meta()
        .revision;

    // revisions are wall-clock milliseconds; a later write wins
    tokio::time::sleep(Duration::from_millis(30)).await;

    let b = spawn_node(secret.clone(), 42);
    std::fs::write(b.root.join("file.txt"), b"v2 is better").unwrap();
    wait_for("node b to index v2", || {
        b.group
            .index()
            .current_meta(&path_id)
            .unwrap()
            .map(|m| m.meta().revision > rev_a)
            .unwrap_or(false)
    })
    .await;
    let rev_b = b
        .group
        .index()
        .current_meta(&path_id)
        .unwrap()
        .unwrap()
        .meta()
        .revision;
    assert!(rev_b > rev_a);

    connect(&a, &b).await.unwrap();

    wait_for("both nodes to converge on v2", || {
        read_file(&a.root.join("file.txt")).as_deref() == Some(b"v2 is better".as_slice())
            && read_file(&b.root.join("file.txt")).as_deref() == Some(b"v2 is better".as_slice())
    })
    .await;

    // both keep the losing revision as history and agree on the current one
    for node in [&a, &b] {
        let index = node.group.index();
        assert_eq!(
            index.current_meta(&path_id).unwrap().unwrap().meta().revision,
            rev_b
        );
        let revisions: Vec<u64> = index
            .all_meta()
            .unwrap()
            .into_iter()
            .filter(|m| m.meta().path_id == path_id)
            .map(|m| m.meta().revision)
            .collect();
        assert!(revisions.contains(&rev_a), "history lost on a node");
        assert!(revisions.contains(&rev_b));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn download_only_node_routes_ciphertext_it_cannot_read() {
    let secret = folder_secret(5);
    let a = spawn_node(secret.clone(), 51);
    std::fs::write(a.root.join("data.bin"), vec![7u8; 4096]).unwrap();

    let download = secret.derive(Capability::Download).unwrap();
    assert!(download.content_key().is_err());

    let d = spawn_node(download.clone(), 52);
    connect(&a, &d).await.unwrap();

    let path_key = secret.path_key().unwrap();
    let path_id = PathId::compute(&path_key, b"data.bin");
    wait_for("download node to fetch all chunks", || {
        let index = d.group.index();
        match index.current_meta(&path_id).unwrap() {
            Some(meta) => meta
                .meta()
                .chunks
                .iter()
                .all(|c| index.is_assembled_chunk(&c.ct_hash).unwrap()),
            None => false,
        }
    })
    .await;

    // chunk metadata is served, plaintext never appears
    let meta = d.group.index().current_meta(&path_id).unwrap().unwrap();
    let ct = meta.meta().chunks[0].ct_hash;
    let (size, _iv) = d.group.index().get_chunk_size_iv(&ct).unwrap();
    assert_eq!(size, meta.meta().chunks[0].size);
    assert!(!d.root.join("data.bin").exists());

    // and a second read-write peer can fetch those chunks from the
    // download-only node: the ciphertext routes through
    let b = spawn_node(secret.clone(), 53);
    connect(&d, &b).await.unwrap();
    wait_for("rw node to sync through the download-only node", || {
        read_file(&b.root.join("data.bin")).map(|v| v.len()) == Some(4096)
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn late_write_propagates() {
    let secret = folder_secret(6);
    let a = spawn_node(secret.clone(), 61);
    let b = spawn_node(secret.clone(), 62);
    connect(&a, &b).await.unwrap();

    // give the sessions a moment to become ready, then write
    tokio::time::sleep(Duration::from_millis(300)).await;
    std::fs::write(a.root.join("later.txt"), b"created after connect").unwrap();

    wait_for("late write to propagate", || {
        read_file(&b.root.join("later.txt")).as_deref()
            == Some(b"created after connect".as_slice())
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_connections_are_rejected() {
    let secret = folder_secret(7);
    let a = spawn_node(secret.clone(), 71);
    let b = spawn_node(secret.clone(), 72);
    connect(&a, &b).await.unwrap();
    // a second transport between the same two nodes is refused: the dial
    // side drops the stream, so the accept side sees no handshake at all
    assert!(connect(&a, &b).await.is_err());

    tokio::time::sleep(Duration::from_millis(500)).await;
    let state = a.group.state().await.unwrap();
    assert!(state.peers.len() <= 1, "duplicate peer registered");
}

#[tokio::test(flavor = "multi_thread")]
async fn larger_file_with_many_chunks() {
    let secret = folder_secret(8);
    let a = spawn_node(secret.clone(), 81);
    // ~200 KiB of patterned data; with production chunk bounds this is a
    // single chunk, which still exercises the request/assemble path end to
    // end with real sizes
    let data: Vec<u8> = (0..200 * 1024).map(|i| (i % 251) as u8).collect();
    std::fs::write(a.root.join("big.bin"), &data).unwrap();

    let b = spawn_node(secret.clone(), 82);
    connect(&a, &b).await.unwrap();

    wait_for("large file to sync", || {
        read_file(&b.root.join("big.bin")).as_deref() == Some(data.as_slice())
    })
    .await;
}
