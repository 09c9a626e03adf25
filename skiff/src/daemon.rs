//! Daemon assembly.
//!
//! Owns the node key, the folder registry, the peer listener, the discovery
//! composite and the control server, and wires candidates and inbound
//! connections into folder groups.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{net::TcpStream, sync::mpsc};
use tokio_util::{codec::Framed, task::AbortOnDropHandle};
use tracing::{debug, info, warn};

use skiff_base::{node_key::load_node_key, FolderId, NodeId, Secret, SecretKey};
use skiff_net::{
    discovery::{
        multicast::{MulticastConfig, MulticastDiscovery},
        tracker::{TrackerConfig, TrackerDiscovery},
        PeerCandidate,
    },
    proto::SessionCodec,
    read_handshake, CompositeDiscovery, Discovery,
};

use crate::{
    config::{Config, ConfigHandle, FolderSettings},
    control::{ControlCommand, ControlNotification, ControlPublisher, ControlServer},
    folder::{FolderGroup, FolderParams},
    registry::Registry,
    transport::exchange_node_ids,
};

const COMMAND_CAP: usize = 64;

/// The running daemon.
#[derive(Debug)]
pub struct Daemon {
    config: ConfigHandle,
    registry: Registry,
    node_key: SecretKey,
    publisher: ControlPublisher,
    commands: mpsc::Sender<ControlCommand>,
    local_addr: SocketAddr,
    _control: Option<ControlServer>,
    _tasks: Vec<AbortOnDropHandle<()>>,
}

impl Daemon {
    /// Bring the whole daemon up from a configuration.
    pub async fn spawn(config: Config) -> Result<Self> {
        let system_dir = config.system_dir()?;
        tokio::fs::create_dir_all(&system_dir)
            .await
            .context("failed to create system dir")?;
        let node_key = load_node_key(&system_dir.join("node.key"))
            .await
            .context("failed to load node key")?;
        let local_node = node_key.public();
        info!(node = %local_node.fmt_short(), "node identity loaded");

        let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.listen_port))
            .await
            .with_context(|| format!("failed to bind peer port {}", config.listen_port))?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "listening for peers");

        let registry = Registry::new();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAP);

        let control = match config.control.listen {
            Some(listen) => Some(
                ControlServer::spawn(
                    listen,
                    config.control.allowed_origins.clone(),
                    commands_tx.clone(),
                )
                .await?,
            ),
            None => None,
        };
        let publisher = control
            .as_ref()
            .map(|server| server.publisher())
            .unwrap_or_default();

        let mut discovery = CompositeDiscovery::new();
        if config.multicast.enabled {
            let multicast_config = MulticastConfig {
                group_v4: config
                    .multicast
                    .group_v4
                    .parse()
                    .context("invalid multicast IPv4 group")?,
                group_v6: config
                    .multicast
                    .group_v6
                    .parse()
                    .context("invalid multicast IPv6 group")?,
                port: config.multicast.port,
                repeat_interval: Duration::from_secs(config.multicast.repeat_interval_secs.max(1)),
            };
            match MulticastDiscovery::spawn(
                multicast_config,
                local_node.digest(),
                local_addr.port(),
            )
            .await
            {
                Ok(multicast) => discovery.add(multicast),
                Err(err) => warn!("multicast discovery unavailable: {err:#}"),
            }
        }
        for url in &config.trackers {
            discovery.add(TrackerDiscovery::spawn(
                TrackerConfig::new(url.clone(), local_addr.port()),
                local_node.digest(),
            ));
        }
        let discovery = Arc::new(discovery);

        let config = ConfigHandle::new(config);
        let daemon = Self {
            config: config.clone(),
            registry: registry.clone(),
            node_key: node_key.clone(),
            publisher: publisher.clone(),
            commands: commands_tx,
            local_addr,
            _control: control,
            _tasks: Vec::new(),
        };

        let mut tasks = Vec::new();

        // folders from the config file
        for settings in &config.get().folders {
            if let Err(err) = daemon.add_folder(settings.clone()).await {
                warn!(path = %settings.path.display(), "folder failed to start: {err:#}");
            }
        }

        // accept loop
        {
            let registry = registry.clone();
            let node_key = node_key.clone();
            tasks.push(AbortOnDropHandle::new(tokio::spawn(async move {
                loop {
                    let (stream, from) = match listener.accept().await {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!("accept failed: {err}");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            continue;
                        }
                    };
                    let registry = registry.clone();
                    let node_key = node_key.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_incoming(stream, node_key, registry).await {
                            debug!(%from, "inbound connection failed: {err:#}");
                        }
                    });
                }
            })));
        }

        // discovery dial loop
        {
            let (candidates, merge_tasks) = discovery.candidates();
            let registry = registry.clone();
            let node_key = node_key.clone();
            tasks.push(AbortOnDropHandle::new(tokio::spawn(async move {
                let _merge_tasks = merge_tasks;
                let mut candidates = candidates;
                while let Some(candidate) = candidates.recv().await {
                    let registry = registry.clone();
                    let node_key = node_key.clone();
                    tokio::spawn(async move {
                        if let Err(err) = dial_candidate(&candidate, node_key, registry).await {
                            debug!(?candidate, "dial failed: {err:#}");
                        }
                    });
                }
            })));
        }

        // control command loop
        {
            let daemon_commands = DaemonCommands {
                config: config.clone(),
                registry: registry.clone(),
                publisher: publisher.clone(),
                node_key: node_key.clone(),
                discovery: discovery.clone(),
            };
            tasks.push(AbortOnDropHandle::new(tokio::spawn(
                daemon_commands.run(commands_rx),
            )));
        }

        let mut daemon = daemon;
        daemon._tasks = tasks;

        // folders need announcing once groups are up
        for folder_id in registry.folder_ids().await {
            discovery.add_folder(folder_id);
        }

        Ok(daemon)
    }

    /// Where the peer listener is bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Our node identity.
    pub fn node_id(&self) -> NodeId {
        self.node_key.public()
    }

    /// The folder registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Queue a control command as if it came over the websocket.
    pub async fn command(&self, command: ControlCommand) {
        self.commands.send(command).await.ok();
    }

    /// Start a folder group from settings and register it.
    pub async fn add_folder(&self, settings: FolderSettings) -> Result<FolderId> {
        let group = spawn_folder(
            &settings,
            &self.config.get(),
            self.node_key.public(),
            &self.publisher,
        )?;
        let folder_id = group.folder_id();
        self.registry.register(group).await;
        self.publisher.notify(ControlNotification::FolderAdded {
            folder_id: folder_id.to_hex(),
            config: serde_json::to_value(&settings).unwrap_or_default(),
        });
        Ok(folder_id)
    }

    /// Dial a peer for a folder by hand, bypassing discovery.
    pub async fn dial(&self, folder_id: FolderId, endpoint: SocketAddr) -> Result<()> {
        let candidate = PeerCandidate {
            folder_id,
            endpoint,
            source: "manual",
        };
        dial_candidate(&candidate, self.node_key.clone(), self.registry.clone()).await
    }

    /// Run until interrupted.
    pub async fn run_until_shutdown(&self) -> Result<()> {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;
        info!("shutting down");
        Ok(())
    }
}

fn spawn_folder(
    settings: &FolderSettings,
    config: &Config,
    local_node: NodeId,
    publisher: &ControlPublisher,
) -> Result<FolderGroup> {
    let secret: Secret = settings
        .secret
        .parse()
        .context("folder secret does not parse")?;
    let mut params = FolderParams::new(
        secret,
        settings.path.clone(),
        config.system_dir()?,
        local_node,
    );
    params.ignore = settings.ignore.clone();
    params.poll_interval = config.poll_interval();
    match FolderGroup::spawn(params) {
        Ok(group) => Ok(group),
        Err(err) => {
            // surfaced as degraded so the operator sees it in the UI
            publisher.notify(ControlNotification::FolderStateChanged {
                folder_id: "unknown".to_string(),
                key: "state".to_string(),
                value: serde_json::json!("degraded"),
            });
            Err(err)
        }
    }
}

async fn handle_incoming(
    mut stream: TcpStream,
    node_key: SecretKey,
    registry: Registry,
) -> Result<()> {
    let remote_node = exchange_node_ids(&mut stream, &node_key).await?;
    let mut framed = Framed::new(stream, SessionCodec);
    let handshake = read_handshake(&mut framed)
        .await
        .context("peer sent no handshake")?;
    let Some(group) = registry.get(&handshake.folder_id).await else {
        debug!(folder = %handshake.folder_id.fmt_short(), "handshake for unknown folder");
        return Ok(());
    };
    group
        .accept_session(framed, remote_node, handshake)
        .await
        .context("session rejected")?;
    Ok(())
}

async fn dial_candidate(
    candidate: &PeerCandidate,
    node_key: SecretKey,
    registry: Registry,
) -> Result<()> {
    let Some(group) = registry.get(&candidate.folder_id).await else {
        // candidates for folders we do not carry are dropped
        return Ok(());
    };
    let mut stream = tokio::time::timeout(
        Duration::from_secs(10),
        TcpStream::connect(candidate.endpoint),
    )
    .await
    .context("connect timed out")??;
    let remote_node = exchange_node_ids(&mut stream, &node_key).await?;
    if remote_node == node_key.public() {
        debug!("discovered ourselves, dropping");
        return Ok(());
    }
    group.connect_session(stream, remote_node).await;
    Ok(())
}

struct DaemonCommands {
    config: ConfigHandle,
    registry: Registry,
    publisher: ControlPublisher,
    node_key: SecretKey,
    discovery: Arc<CompositeDiscovery>,
}

impl DaemonCommands {
    async fn run(self, mut commands: mpsc::Receiver<ControlCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                ControlCommand::AddFolder { secret, path } => {
                    let settings = FolderSettings {
                        secret,
                        path: path.into(),
                        ignore: Vec::new(),
                    };
                    match spawn_folder(
                        &settings,
                        &self.config.get(),
                        self.node_key.public(),
                        &self.publisher,
                    ) {
                        Ok(group) => {
                            let folder_id = group.folder_id();
                            self.registry.register(group).await;
                            self.discovery.add_folder(folder_id);
                            self.publisher.notify(ControlNotification::FolderAdded {
                                folder_id: folder_id.to_hex(),
                                config: serde_json::to_value(&settings).unwrap_or_default(),
                            });
                        }
                        Err(err) => warn!("add_folder failed: {err:#}"),
                    }
                }
                ControlCommand::RemoveFolder { folder_id } => {
                    let Ok(folder_id) = folder_id.parse::<FolderId>() else {
                        warn!("remove_folder with invalid id");
                        continue;
                    };
                    // clearing the registry entry first makes in-flight
                    // session dispatch short-circuit
                    if self.registry.unregister(&folder_id).await.is_some() {
                        self.discovery.remove_folder(folder_id);
                        self.publisher.notify(ControlNotification::FolderRemoved {
                            folder_id: folder_id.to_hex(),
                        });
                    }
                }
                ControlCommand::SetConfig { key, value } => {
                    match self.config.set_key(&key, value.clone()) {
                        Ok(()) => {
                            self.publisher
                                .notify(ControlNotification::GlobalConfigChanged { key, value });
                        }
                        Err(err) => warn!("set_config failed: {err:#}"),
                    }
                }
                ControlCommand::Shutdown => {
                    info!("shutdown requested through control plane");
                    std::process::exit(0);
                }
                ControlCommand::Restart => {
                    // the service manager restarts us on this exit code
                    info!("restart requested through control plane");
                    std::process::exit(64);
                }
            }
        }
    }
}
