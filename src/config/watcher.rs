//! Configuration file watcher for hot-reload support.
//!
//! Polls the configuration file and compares content hashes, so touching a
//! file or reordering its bindings does not trigger a reload. Hot-reload is
//! disabled by default.

use super::error::ConfigResult;
use super::hash::{content_hash, ContentHash};
use super::loader::ConfigLoader;
use super::types::DataplaneConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Configuration for the file watcher.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Polling interval for file changes.
    pub poll_interval: Duration,
    /// Whether hot-reload is enabled.
    pub enabled: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            enabled: false,
        }
    }
}

impl WatcherConfig {
    /// Create a new watcher config with hot-reload enabled.
    #[must_use]
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    /// Set the poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Event emitted when configuration changes.
#[derive(Debug, Clone)]
pub enum ConfigEvent {
    /// Content changed and the new configuration loaded successfully.
    Changed {
        /// The new configuration.
        config: Arc<DataplaneConfig>,
        /// Its content hash.
        hash: ContentHash,
    },
    /// The file changed but could not be loaded.
    Error(String),
}

struct Snapshot {
    config: DataplaneConfig,
    hash: ContentHash,
}

/// Watches a configuration file for content changes.
pub struct ConfigWatcher {
    config_path: PathBuf,
    watcher_config: WatcherConfig,
    loader: Arc<ConfigLoader>,
    current: Arc<RwLock<Snapshot>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl ConfigWatcher {
    /// Create a new configuration watcher.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial configuration cannot be loaded.
    pub fn new<P: AsRef<Path>>(
        config_path: P,
        loader: ConfigLoader,
        watcher_config: WatcherConfig,
    ) -> ConfigResult<Self> {
        let config_path = config_path.as_ref().to_path_buf();
        let config = loader.load(&config_path)?;
        let hash = content_hash(&config)?;

        Ok(Self {
            config_path,
            watcher_config,
            loader: Arc::new(loader),
            current: Arc::new(RwLock::new(Snapshot { config, hash })),
            shutdown_tx: None,
        })
    }

    /// Get the current configuration.
    pub async fn get_config(&self) -> DataplaneConfig {
        self.current.read().await.config.clone()
    }

    /// Content hash of the current configuration.
    pub async fn content_hash(&self) -> ContentHash {
        self.current.read().await.hash
    }

    /// Start watching for configuration changes.
    ///
    /// Returns a receiver for configuration events.
    pub fn start(&mut self) -> mpsc::Receiver<ConfigEvent> {
        let (event_tx, event_rx) = mpsc::channel(16);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        self.shutdown_tx = Some(shutdown_tx);

        if !self.watcher_config.enabled {
            return event_rx;
        }

        let config_path = self.config_path.clone();
        let poll_interval = self.watcher_config.poll_interval;
        let current = Arc::clone(&self.current);
        let loader = Arc::clone(&self.loader);

        info!(path = %config_path.display(), ?poll_interval, "Configuration watcher started");

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Some(event) = Self::poll(&config_path, &loader, &current).await {
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
            debug!("Configuration watcher stopped");
        });

        event_rx
    }

    async fn poll(
        path: &Path,
        loader: &ConfigLoader,
        current: &RwLock<Snapshot>,
    ) -> Option<ConfigEvent> {
        let loaded = loader
            .load(path)
            .and_then(|config| content_hash(&config).map(|hash| (config, hash)));

        match loaded {
            Ok((config, hash)) => {
                let mut snapshot = current.write().await;
                if snapshot.hash == hash {
                    return None;
                }
                info!(previous = %snapshot.hash, next = %hash, "Configuration content changed");
                snapshot.config = config.clone();
                snapshot.hash = hash;
                Some(ConfigEvent::Changed {
                    config: Arc::new(config),
                    hash,
                })
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Configuration reload failed");
                Some(ConfigEvent::Error(e.to_string()))
            }
        }
    }

    /// Stop watching for configuration changes.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
    }

    /// Force a reload, returning the new configuration and whether its
    /// content differs from the previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be loaded.
    pub async fn reload(&self) -> ConfigResult<(DataplaneConfig, bool)> {
        let config = self.loader.load(&self.config_path)?;
        let hash = content_hash(&config)?;
        let mut snapshot = self.current.write().await;
        let changed = snapshot.hash != hash;
        snapshot.config = config.clone();
        snapshot.hash = hash;
        Ok((config, changed))
    }
}
