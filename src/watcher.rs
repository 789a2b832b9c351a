//! Configuration file watching and hot reload.
//!
//! Observes a YAML snapshot file and notifies registered callbacks with the
//! full latest snapshot on every change. Change events are debounced so a
//! burst of editor writes produces a single reload. Callbacks run serially
//! and each receives the complete snapshot, so they can be idempotent
//! reconcilers.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use notify::RecursiveMode;
use notify_debouncer_mini::new_debouncer;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{load_config, ConfigError};
use crate::shutdown::Shutdown;
use crate::types::BrokerConfig;

/// Default debounce window for file change events.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Callback invoked with the latest snapshot. Serialized by the watcher.
pub type ConfigCallback = Arc<dyn Fn(Arc<BrokerConfig>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Errors that can occur while starting the watcher.
#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    /// The initial configuration could not be loaded.
    #[error("initial configuration invalid: {0}")]
    InitialLoad(#[from] ConfigError),

    /// The file watcher could not be created or attached.
    #[error("could not watch '{path}': {message}")]
    Watch { path: String, message: String },
}

/// Watches a configuration file and fans out snapshots to callbacks.
pub struct ConfigWatcher {
    path: PathBuf,
    debounce: Duration,
    callbacks: Vec<ConfigCallback>,
}

impl ConfigWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            debounce: DEFAULT_DEBOUNCE,
            callbacks: Vec::new(),
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Register a reconfiguration callback. All callbacks receive every
    /// snapshot, in registration order.
    pub fn add_callback(&mut self, callback: ConfigCallback) {
        self.callbacks.push(callback);
    }

    /// Load the initial snapshot, deliver it to all callbacks, then watch
    /// for changes in a background task. The task exits cleanly on
    /// shutdown; it is not supervised.
    ///
    /// A missing file yields an empty snapshot; an unparseable file at
    /// startup is an error. Later parse failures keep the previous
    /// snapshot.
    pub async fn start(&self, shutdown: Shutdown) -> Result<(), WatcherError> {
        let initial = match load_config(&self.path) {
            Ok(config) => config,
            Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %self.path.display(), "configuration file not found, starting empty");
                BrokerConfig::default()
            }
            Err(e) => return Err(e.into()),
        };

        let initial = Arc::new(initial);
        for callback in &self.callbacks {
            callback(initial.clone()).await;
        }

        let (change_tx, change_rx) = mpsc::channel::<()>(1);
        let mut debouncer = new_debouncer(self.debounce, move |result| {
            if let Ok(_events) = result {
                // Coalesce: a queued notification is as good as many.
                let _ = change_tx.try_send(());
            }
        })
        .map_err(|e| WatcherError::Watch {
            path: self.path.display().to_string(),
            message: e.to_string(),
        })?;

        // Watch the parent directory so file replacement (the common
        // editor and configmap update pattern) is still observed.
        let watch_root = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();
        debouncer
            .watcher()
            .watch(&watch_root, RecursiveMode::NonRecursive)
            .map_err(|e| WatcherError::Watch {
                path: watch_root.display().to_string(),
                message: e.to_string(),
            })?;

        info!(path = %self.path.display(), "watching configuration");

        tokio::spawn(watch_loop(
            self.path.clone(),
            self.callbacks.clone(),
            debouncer,
            change_rx,
            shutdown,
        ));

        Ok(())
    }
}

async fn watch_loop(
    path: PathBuf,
    callbacks: Vec<ConfigCallback>,
    // Held so the watcher thread stays alive for the loop's lifetime.
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    mut change_rx: mpsc::Receiver<()>,
    shutdown: Shutdown,
) {
    loop {
        tokio::select! {
            changed = change_rx.recv() => {
                if changed.is_none() {
                    return;
                }
                match load_config(&path) {
                    Ok(config) => {
                        debug!(path = %path.display(), "configuration reloaded");
                        let config = Arc::new(config);
                        for callback in &callbacks {
                            callback(config.clone()).await;
                        }
                    }
                    Err(e) => {
                        error!(
                            path = %path.display(),
                            error = %e,
                            "could not reload configuration, keeping previous snapshot"
                        );
                    }
                }
            }
            _ = shutdown.cancelled() => {
                debug!("configuration watcher stopped");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::time::timeout;

    fn counting_callback(seen: Arc<Mutex<Vec<usize>>>) -> ConfigCallback {
        Arc::new(move |config: Arc<BrokerConfig>| {
            let seen = seen.clone();
            Box::pin(async move {
                seen.lock().unwrap().push(config.triggers.len());
            })
        })
    }

    #[tokio::test]
    async fn test_initial_snapshot_is_delivered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "triggers:\n  t:\n    target:\n      url: https://example.com/t\n",
        )
        .unwrap();

        let seen: Arc<Mutex<Vec<usize>>> = Arc::default();
        let mut watcher = ConfigWatcher::new(&path).with_debounce(Duration::from_millis(50));
        watcher.add_callback(counting_callback(seen.clone()));

        let shutdown = Shutdown::new();
        watcher.start(shutdown.clone()).await.unwrap();

        assert_eq!(seen.lock().unwrap().as_slice(), [1]);
        shutdown.initiate();
    }

    #[tokio::test]
    async fn test_missing_file_yields_empty_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.yaml");

        let seen: Arc<Mutex<Vec<usize>>> = Arc::default();
        let mut watcher = ConfigWatcher::new(&path).with_debounce(Duration::from_millis(50));
        watcher.add_callback(counting_callback(seen.clone()));

        let shutdown = Shutdown::new();
        watcher.start(shutdown.clone()).await.unwrap();

        assert_eq!(seen.lock().unwrap().as_slice(), [0]);
        shutdown.initiate();
    }

    #[tokio::test]
    async fn test_invalid_initial_config_fails_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "triggers: [not, a, map]").unwrap();

        let watcher = ConfigWatcher::new(&path);
        let result = watcher.start(Shutdown::new()).await;
        assert!(matches!(result, Err(WatcherError::InitialLoad(_))));
    }

    #[tokio::test]
    async fn test_change_is_observed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "triggers: {}\n").unwrap();

        let seen: Arc<Mutex<Vec<usize>>> = Arc::default();
        let mut watcher = ConfigWatcher::new(&path).with_debounce(Duration::from_millis(50));
        watcher.add_callback(counting_callback(seen.clone()));

        let shutdown = Shutdown::new();
        watcher.start(shutdown.clone()).await.unwrap();

        std::fs::write(
            &path,
            "triggers:\n  t:\n    target:\n      url: https://example.com/t\n",
        )
        .unwrap();

        let observed = timeout(Duration::from_secs(5), async {
            loop {
                if seen.lock().unwrap().last() == Some(&1) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(observed.is_ok(), "change was not observed: {seen:?}");
        shutdown.initiate();
    }
}
