use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use notify::{
    Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher,
    event::{CreateKind, ModifyKind},
};
use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tokio::{
    sync::mpsc::UnboundedReceiver,
    task::JoinHandle,
    time::{Duration, sleep},
};
use tracing::{error, info, warn};

use crate::loader::{EngineLoader, file_path};

/// Something that reacts to files appearing, changing or disappearing.
#[async_trait]
pub trait WatchedType: Send + Sync + 'static {
    fn is_relevant(&self, path: &Path) -> bool;
    async fn on_create_or_modify(&self, path: &Path) -> Result<()>;
    async fn on_remove(&self, path: &Path) -> Result<()>;

    async fn reload(&self, path: &Path) -> Result<()> {
        self.on_create_or_modify(path).await
    }
}

/// Owns the background tasks watching one directory. Dropping it does not
/// stop them; call [`DirectoryWatcher::shutdown`].
pub struct DirectoryWatcher {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl DirectoryWatcher {
    /// Polls `dir` every `interval` and forwards relevant create/modify/remove
    /// events to `watched`. With `initial_scan`, existing relevant files are
    /// reloaded first.
    pub async fn new(
        dir: PathBuf,
        watched: Arc<dyn WatchedType>,
        interval: Duration,
        initial_scan: bool,
    ) -> Result<DirectoryWatcher> {
        if !dir.is_dir() {
            let msg = format!("Directory {} does not exist", dir.display());
            warn!(%msg);
            bail!(msg);
        }

        if initial_scan {
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if watched.is_relevant(&path) {
                    try_reload(&watched, &path).await;
                }
            }
        }

        let (tx, mut rx): (_, UnboundedReceiver<notify::Result<Event>>) = tokio::sync::mpsc::unbounded_channel();

        let mut watcher = PollWatcher::new(
            move |res| {
                // receiver gone means nobody is listening any more
                let _ = tx.send(res);
            },
            Config::default().with_poll_interval(interval),
        )
        .context("failed to create PollWatcher")?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", dir.display()))?;

        // keeps the poller alive for as long as the task runs
        let handle_watcher = tokio::spawn(async move {
            let _watcher = watcher;
            futures::future::pending::<()>().await;
        });

        let handle_dispatch = tokio::spawn(async move {
            while let Some(res) = rx.recv().await {
                match res {
                    Ok(Event {
                        kind: EventKind::Create(CreateKind::Any | CreateKind::File) | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any),
                        paths,
                        ..
                    }) => {
                        for path in paths.iter().filter(|p| watched.is_relevant(p)) {
                            if let Err(e) = watched.on_create_or_modify(path).await {
                                warn!(?path, ?e, "Failed to handle create/modify");
                            }
                        }
                    }
                    Ok(Event {
                        kind: EventKind::Remove(_),
                        paths,
                        ..
                    }) => {
                        for path in paths.iter().filter(|p| watched.is_relevant(p)) {
                            if let Err(e) = watched.on_remove(path).await {
                                warn!(?path, ?e, "Failed to handle removal");
                            }
                        }
                    }
                    Err(e) => warn!(?e, "Watcher error"),
                    _ => {}
                }
            }
        });

        Ok(DirectoryWatcher {
            handles: Mutex::new(vec![handle_dispatch, handle_watcher]),
        })
    }

    /// Aborts the watcher tasks; no events are dispatched afterwards.
    pub fn shutdown(&self) {
        if let Ok(mut guard) = self.handles.lock() {
            for handle in guard.drain(..) {
                handle.abort();
            }
        }
    }
}

async fn try_reload(watched: &Arc<dyn WatchedType>, path: &Path) {
    const MAX_RETRIES: usize = 3;

    for attempt in 0..MAX_RETRIES {
        match watched.reload(path).await {
            Ok(_) => return,
            Err(e) if attempt + 1 == MAX_RETRIES => {
                error!("Failed to reload {:?}: {e:?}", path);
            }
            Err(e) => {
                warn!("Retrying reload {:?} (attempt {}): {e:?}", path, attempt + 1);
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Drops the loader's cached engine whenever the local engine file changes,
/// so the next job compiles the new bytes.
pub struct EngineFileWatcher {
    file: PathBuf,
    loader: EngineLoader,
}

impl EngineFileWatcher {
    pub fn new(file: PathBuf, loader: EngineLoader) -> Self {
        Self { file, loader }
    }

    /// Starts watching the engine file of `loader`. Fails when the loader
    /// has no local engine file.
    pub async fn watch(loader: EngineLoader, interval: Duration) -> Result<DirectoryWatcher> {
        let Some(location) = loader.location() else {
            bail!("the built-in engine has no file to watch");
        };
        if location.starts_with("http://") || location.starts_with("https://") {
            bail!("{location} is not a local file");
        }
        let file = file_path(location)?;
        let file = std::fs::canonicalize(&file).unwrap_or(file);
        let dir = match file.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        info!(file = %file.display(), "watching layout engine");
        let watched: Arc<dyn WatchedType> = Arc::new(Self::new(file, loader));
        DirectoryWatcher::new(dir, watched, interval, false).await
    }
}

#[async_trait]
impl WatchedType for EngineFileWatcher {
    fn is_relevant(&self, path: &Path) -> bool {
        path == self.file || path.file_name() == self.file.file_name() && path.parent() == self.file.parent()
    }

    async fn on_create_or_modify(&self, path: &Path) -> Result<()> {
        info!(path = %path.display(), "layout engine changed");
        self.loader.invalidate().await;
        Ok(())
    }

    async fn on_remove(&self, path: &Path) -> Result<()> {
        warn!(path = %path.display(), "layout engine removed");
        self.loader.invalidate().await;
        Ok(())
    }
}
