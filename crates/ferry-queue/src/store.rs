//! Queue persistence
//!
//! The queue is saved as one JSON document: every unfinished, non-list item
//! with its sources and stored blocks. Writes go to a sibling `.tmp` file
//! that is renamed over the old one.

use crate::error::{QueueError, Result};
use crate::item::QueueItem;
use crate::manager::{QueueManager, validate_target};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::task::JoinHandle;

/// Current queue file format
pub const QUEUE_FILE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct QueueFile {
    version: u32,
    items: Vec<QueueItem>,
}

/// JSON queue file
#[derive(Debug, Clone)]
pub struct QueueStore {
    path: PathBuf,
}

impl QueueStore {
    /// Store at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Write `items`, skipping file lists and finished items
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or serialized.
    pub async fn save(&self, items: &[QueueItem]) -> Result<usize> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let items: Vec<QueueItem> = items
            .iter()
            .filter(|item| !item.is_file_list() && !item.is_finished())
            .cloned()
            .collect();
        let count = items.len();

        let file = QueueFile {
            version: QUEUE_FILE_VERSION,
            items,
        };
        let json = serde_json::to_string_pretty(&file)?;

        let temp = self.temp_path();
        fs::write(&temp, json).await?;
        fs::rename(&temp, &self.path).await?;

        tracing::debug!("Saved {} items to {}", count, self.path.display());
        Ok(count)
    }

    /// Read items back
    ///
    /// A missing file is an empty queue. Entries with an invalid target are
    /// skipped; block records outside the file are dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or was written
    /// by a newer version.
    pub async fn load(&self) -> Result<Vec<QueueItem>> {
        let json = match fs::read_to_string(&self.path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let file: QueueFile = serde_json::from_str(&json)?;
        if file.version > QUEUE_FILE_VERSION {
            return Err(QueueError::Serialization(Cow::Owned(format!(
                "queue file version {} is newer than supported version {}",
                file.version, QUEUE_FILE_VERSION
            ))));
        }

        let mut items = Vec::with_capacity(file.items.len());
        for mut item in file.items {
            if validate_target(&item.target).is_err() {
                tracing::warn!("Skipping stored item {}", item.target.display());
                continue;
            }
            if let Some(layout) = item.layout() {
                let count = layout.block_count();
                item.completed.retain(|&index, _| index < count);
            }
            item.downloaded = item.completed_bytes();
            items.push(item);
        }

        tracing::debug!("Loaded {} items from {}", items.len(), self.path.display());
        Ok(items)
    }
}

impl QueueManager {
    /// Save the queue and clear the dirty flag
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written; the queue stays
    /// dirty.
    pub async fn save(&self, store: &QueueStore) -> Result<usize> {
        let items: Vec<QueueItem> = {
            let mut state = self.state.lock().await;
            state.dirty = false;
            state.items.values().cloned().collect()
        };

        match store.save(&items).await {
            Ok(count) => Ok(count),
            Err(e) => {
                self.state.lock().await.dirty = true;
                Err(e)
            }
        }
    }

    /// Save only if something changed since the last save
    ///
    /// # Errors
    ///
    /// Returns the errors of [`save`](Self::save).
    pub async fn save_if_dirty(&self, store: &QueueStore) -> Result<bool> {
        if !self.is_dirty().await {
            return Ok(false);
        }
        self.save(store).await.map(|_| true)
    }

    /// Load stored items into the queue
    ///
    /// Items whose target is already queued keep the queued copy. Returns the
    /// number of items added.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`QueueStore::load`].
    pub async fn load_from(&self, store: &QueueStore) -> Result<usize> {
        let items = store.load().await?;

        let mut state = self.state.lock().await;
        let mut added = 0;
        for item in items {
            if state.items.contains_key(&item.target) {
                continue;
            }
            state.insert(item);
            added += 1;
        }

        tracing::info!("Restored {} queued items", added);
        Ok(added)
    }

    /// Save the queue periodically while the manager is alive
    pub fn spawn_autosave(self: &Arc<Self>, store: QueueStore) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let interval = self.config.autosave_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if let Err(e) = manager.save_if_dirty(&store).await {
                    tracing::error!("Failed to save queue: {}", e);
                }
            }
        })
    }
}
