//! Daemon-level test: two full daemons over real TCP.

use std::time::Duration;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use skiff::{config::FolderSettings, Config, Daemon};
use skiff_base::Secret;

async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..600 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

fn quiet_config(data_dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.listen_port = 0; // ephemeral
    config.data_dir = Some(data_dir.to_path_buf());
    config.multicast.enabled = false;
    config.control.listen = None;
    config
}

#[tokio::test(flavor = "multi_thread")]
async fn two_daemons_sync_over_tcp() {
    let mut rng = ChaCha8Rng::seed_from_u64(91);
    let secret = Secret::generate(&mut rng);
    let secret_text = secret.to_string();

    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let root_a = dir_a.path().join("sync");
    let root_b = dir_b.path().join("sync");
    std::fs::create_dir_all(&root_a).unwrap();
    std::fs::create_dir_all(&root_b).unwrap();
    std::fs::write(root_a.join("hello.txt"), b"hi").unwrap();

    let mut config_a = quiet_config(&dir_a.path().join("state"));
    config_a.folders.push(FolderSettings {
        secret: secret_text.clone(),
        path: root_a.clone(),
        ignore: Vec::new(),
    });
    let daemon_a = Daemon::spawn(config_a).await.unwrap();

    let daemon_b = Daemon::spawn(quiet_config(&dir_b.path().join("state")))
        .await
        .unwrap();
    let folder_id = daemon_b
        .add_folder(FolderSettings {
            secret: secret_text,
            path: root_b.clone(),
            ignore: Vec::new(),
        })
        .await
        .unwrap();
    assert_eq!(folder_id, secret.folder_id());

    // discovery is off; introduce the peers by hand
    let mut target = daemon_a.local_addr();
    target.set_ip("127.0.0.1".parse().unwrap());
    daemon_b.dial(folder_id, target).await.unwrap();

    wait_for("file to sync between daemons", || {
        std::fs::read(root_b.join("hello.txt")).ok().as_deref() == Some(b"hi")
    })
    .await;

    // both ends report the session in their state snapshots
    let group_a = daemon_a.registry().get(&folder_id).await.unwrap();
    let state = group_a.state().await.unwrap();
    assert_eq!(state.peers.len(), 1);
    assert_eq!(state.peers[0].client_name, "skiff");
}
