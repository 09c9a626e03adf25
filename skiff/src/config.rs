//! Daemon configuration.
//!
//! Loaded once from a toml file and published as a process-wide read-mostly
//! snapshot: readers keep a [`tokio::sync::watch`] receiver and see a fresh
//! `Arc<Config>` whenever a writer publishes one. Nothing mutates in place.

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Default peer listen port.
pub const DEFAULT_LISTEN_PORT: u16 = 42310;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// TCP port for peer connections.
    pub listen_port: u16,
    /// Where the node key, indexes and staging areas live. Defaults to the
    /// platform data directory.
    pub data_dir: Option<PathBuf>,
    /// Control plane settings.
    pub control: ControlSettings,
    /// Local multicast discovery settings.
    pub multicast: MulticastSettings,
    /// UDP tracker urls, `udp://host:port`.
    pub trackers: Vec<String>,
    /// Seconds between full-tree poller sweeps.
    pub poll_interval_secs: u64,
    /// Synchronized folders.
    pub folders: Vec<FolderSettings>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_LISTEN_PORT,
            data_dir: None,
            control: ControlSettings::default(),
            multicast: MulticastSettings::default(),
            trackers: Vec::new(),
            poll_interval_secs: 600,
            folders: Vec::new(),
        }
    }
}

/// Control plane websocket settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControlSettings {
    /// Where to serve the control websocket; disabled when unset.
    pub listen: Option<SocketAddr>,
    /// Origins allowed to connect. An empty list admits only requests
    /// without an Origin header (non-browser clients).
    pub allowed_origins: Vec<String>,
}

/// Local multicast discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MulticastSettings {
    /// Whether multicast discovery runs at all.
    pub enabled: bool,
    /// IPv4 group.
    pub group_v4: String,
    /// IPv6 group.
    pub group_v6: String,
    /// Group UDP port.
    pub port: u16,
    /// Seconds between repeat announcements.
    pub repeat_interval_secs: u64,
}

impl Default for MulticastSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            group_v4: "239.51.38.65".to_string(),
            group_v6: "ff08::bd02".to_string(),
            port: 28914,
            repeat_interval_secs: 30,
        }
    }
}

/// One synchronized folder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FolderSettings {
    /// The folder secret in its textual form.
    pub secret: String,
    /// Root of the synchronized tree.
    pub path: PathBuf,
    /// Relative path prefixes to ignore.
    #[serde(default)]
    pub ignore: Vec<String>,
}

impl Config {
    /// Read and parse a toml config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Resolve the system directory holding the node key and per-folder
    /// state.
    pub fn system_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        if let Some(dir) = std::env::var_os("SKIFF_DATA_DIR") {
            return Ok(PathBuf::from(dir));
        }
        let base = dirs_next::data_dir()
            .context("operating environment provides no directory for application data")?;
        Ok(base.join("skiff"))
    }

    /// The poller sweep interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

/// Shared read-mostly snapshot of the configuration.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    tx: watch::Sender<Arc<Config>>,
}

impl ConfigHandle {
    /// Wrap an initial configuration.
    pub fn new(config: Config) -> Self {
        let (tx, _) = watch::channel(Arc::new(config));
        Self { tx }
    }

    /// The current snapshot.
    pub fn get(&self) -> Arc<Config> {
        self.tx.borrow().clone()
    }

    /// Subscribe to snapshot changes.
    pub fn watch(&self) -> watch::Receiver<Arc<Config>> {
        self.tx.subscribe()
    }

    /// Publish a whole new snapshot.
    pub fn replace(&self, config: Config) {
        self.tx.send_replace(Arc::new(config));
    }

    /// Set one top-level key from its JSON representation and publish the
    /// result. Fails when the key or value does not fit the schema.
    pub fn set_key(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let current = self.get();
        let mut as_value =
            serde_json::to_value(current.as_ref()).context("config serialization failed")?;
        let object = as_value
            .as_object_mut()
            .context("config is not a json object")?;
        anyhow::ensure!(object.contains_key(key), "unknown config key: {key}");
        object.insert(key.to_string(), value);
        let updated: Config =
            serde_json::from_value(as_value).context("updated config does not fit the schema")?;
        self.replace(updated);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_empty() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.listen_port, DEFAULT_LISTEN_PORT);
        assert!(config.multicast.enabled);
        assert!(config.folders.is_empty());
    }

    #[test]
    fn full_file_parses() {
        let text = r#"
            listen_port = 5000
            trackers = ["udp://tracker.example.org:6969"]
            poll_interval_secs = 120

            [control]
            listen = "127.0.0.1:9090"
            allowed_origins = ["http://localhost:9090"]

            [multicast]
            enabled = false

            [[folders]]
            secret = "A1abcdef"
            path = "/home/user/sync"
            ignore = [".git"]
        "#;
        let config: Config = toml::from_str(text).unwrap();
        assert_eq!(config.listen_port, 5000);
        assert!(!config.multicast.enabled);
        assert_eq!(config.folders.len(), 1);
        assert_eq!(config.folders[0].ignore, vec![".git".to_string()]);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<Config>("listne_port = 1").is_err());
    }

    #[test]
    fn set_key_publishes_snapshot() {
        let handle = ConfigHandle::new(Config::default());
        let mut watcher = handle.watch();
        handle
            .set_key("listen_port", serde_json::json!(5555))
            .unwrap();
        assert_eq!(handle.get().listen_port, 5555);
        assert!(watcher.has_changed().unwrap());

        assert!(handle.set_key("bogus", serde_json::json!(1)).is_err());
        assert!(handle
            .set_key("listen_port", serde_json::json!("not a port"))
            .is_err());
    }
}
