//! Integrity recheck of partially downloaded files
//!
//! Re-hashes the temp file of a waiting item block by block and keeps only
//! the blocks that match the stored tree. A file whose root already matches
//! is moved into place.

use crate::error::{QueueError, Result};
use crate::event::{ItemUpdate, QueueEvent};
use crate::manager::QueueManager;
use ferry_files::tree_hash::compute_tree_hash;
use ferry_files::{BlockLayout, MIN_BLOCK_SIZE};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};

/// Stage or result of a recheck
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecheckOutcome {
    /// Recheck queued
    Started,
    /// No temp file on disk
    NoFile,
    /// Temp file shorter than one block
    FileTooSmall,
    /// The item is being downloaded
    DownloadsRunning,
    /// No matching tree is stored
    NoTree,
    /// Temp file already matched the root and was moved to the target
    AlreadyFinished,
    /// Blocks re-marked from the file contents
    Done,
}

impl RecheckOutcome {
    /// User-facing message
    pub fn message(self) -> &'static str {
        match self {
            RecheckOutcome::Started => "Started...",
            RecheckOutcome::NoFile => "Unfinished file not found",
            RecheckOutcome::FileTooSmall => "Unfinished file too small",
            RecheckOutcome::DownloadsRunning => "Downloads running, please disconnect them",
            RecheckOutcome::NoTree => "No full tree available",
            RecheckOutcome::AlreadyFinished => "File is already finished",
            RecheckOutcome::Done => "Done.",
        }
    }
}

impl fmt::Display for RecheckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl QueueManager {
    /// Recheck an item's temp file against its stored tree
    ///
    /// Emits [`QueueEvent::Recheck`] when starting and again with the
    /// outcome.
    ///
    /// # Errors
    ///
    /// - [`QueueError::NotFound`] if `target` is not queued
    /// - [`QueueError::Io`] if the temp file cannot be resized or read
    pub async fn recheck(&self, target: &Path) -> Result<RecheckOutcome> {
        self.emit(QueueEvent::Recheck {
            target: target.to_path_buf(),
            outcome: RecheckOutcome::Started,
        });

        let outcome = self.run_recheck(target).await?;

        tracing::info!("Recheck of {}: {}", target.display(), outcome);
        self.emit(QueueEvent::Recheck {
            target: target.to_path_buf(),
            outcome,
        });
        Ok(outcome)
    }

    /// Run [`recheck`](Self::recheck) in the background
    pub fn spawn_recheck(self: &Arc<Self>, target: PathBuf) -> RecheckOutcome {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = manager.recheck(&target).await {
                tracing::warn!("Recheck of {} failed: {}", target.display(), e);
            }
        });
        RecheckOutcome::Started
    }

    async fn run_recheck(&self, target: &Path) -> Result<RecheckOutcome> {
        let (temp_target, size, content_id, running) = {
            let state = self.state.lock().await;
            let item = state
                .items
                .get(target)
                .ok_or_else(|| QueueError::NotFound(target.to_path_buf()))?;
            (
                item.temp_target.clone(),
                item.size,
                item.content_id,
                item.is_running(),
            )
        };

        let on_disk = match fs::metadata(&temp_target).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RecheckOutcome::NoFile);
            }
            Err(e) => return Err(e.into()),
        };

        let layout = size.map(BlockLayout::for_file_size);
        let block_size = layout.map_or(MIN_BLOCK_SIZE, |l| l.block_size());
        if on_disk < block_size {
            return Ok(RecheckOutcome::FileTooSmall);
        }

        if running {
            return Ok(RecheckOutcome::DownloadsRunning);
        }

        let (Some(layout), Some(content_id)) = (layout, content_id) else {
            return Ok(RecheckOutcome::NoTree);
        };
        let Some(expected) = self
            .trees
            .get(&content_id)
            .filter(|tree| tree.block_size == layout.block_size())
        else {
            return Ok(RecheckOutcome::NoTree);
        };

        if on_disk != layout.file_size() {
            let file = OpenOptions::new().write(true).open(&temp_target).await?;
            file.set_len(layout.file_size()).await?;
        }

        let path = temp_target.clone();
        let hashed = tokio::task::spawn_blocking(move || compute_tree_hash(&path, block_size))
            .await
            .map_err(|e| QueueError::Io(Cow::Owned(e.to_string())))??;

        let mut state = self.state.lock().await;
        let item = state
            .items
            .get_mut(target)
            .ok_or_else(|| QueueError::NotFound(target.to_path_buf()))?;
        if item.is_running() {
            return Ok(RecheckOutcome::DownloadsRunning);
        }

        item.completed.clear();
        if hashed.root == expected.root {
            for (index, leaf) in hashed.leaves.iter().enumerate() {
                item.mark_block(index as u64, *leaf, true);
            }
            item.downloaded = item.completed_bytes();
            drop(state);

            self.complete_item(target).await?;
            return Ok(RecheckOutcome::AlreadyFinished);
        }

        let mut good = 0usize;
        for (index, leaf) in hashed.leaves.iter().enumerate() {
            let index = index as u64;
            if expected.leaf(index) == Some(leaf) {
                item.mark_block(index, *leaf, true);
                good += 1;
            }
        }
        item.set_waiting();
        let downloaded = item.downloaded;
        state.dirty = true;
        drop(state);

        tracing::debug!(
            "Recheck kept {} of {} blocks of {}",
            good,
            hashed.leaf_count(),
            target.display()
        );
        self.emit(QueueEvent::Updated {
            target: target.to_path_buf(),
            update: ItemUpdate::progress(downloaded, 0.0),
        });
        Ok(RecheckOutcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::manager::AddRequest;
    use crate::source::UserId;
    use ferry_files::tree_hash::{DEFAULT_MAX_LEVELS, choose_block_size, compute_tree_hash_from_data};
    use tempfile::TempDir;

    fn setup() -> (TempDir, QueueManager) {
        let dir = TempDir::new().unwrap();
        let config = QueueConfig {
            list_dir: dir.path().join("lists"),
            ..QueueConfig::default()
        };
        (dir, QueueManager::new(config).unwrap())
    }

    async fn queue(manager: &QueueManager, target: &Path, data: &[u8]) {
        let block_size = choose_block_size(data.len() as u64, DEFAULT_MAX_LEVELS);
        let tree = compute_tree_hash_from_data(data, block_size).unwrap();
        let user = UserId::from_bytes([7u8; 24]);
        manager
            .add(
                AddRequest::new(target, data.len() as u64, user, "hub")
                    .with_content_id(tree.content_id()),
            )
            .await
            .unwrap();
        manager.add_tree(target, user, tree).await.unwrap();
    }

    #[test]
    fn test_messages() {
        assert_eq!(RecheckOutcome::Done.message(), "Done.");
        assert_eq!(
            RecheckOutcome::DownloadsRunning.to_string(),
            "Downloads running, please disconnect them"
        );
    }

    #[tokio::test]
    async fn test_recheck_missing_file() {
        let (dir, manager) = setup();
        let target = dir.path().join("f.bin");
        queue(&manager, &target, &[1u8; 1000]).await;

        assert_eq!(manager.recheck(&target).await.unwrap(), RecheckOutcome::NoFile);
    }

    #[tokio::test]
    async fn test_recheck_too_small() {
        let (dir, manager) = setup();
        let target = dir.path().join("f.bin");
        let data = vec![1u8; 3 * MIN_BLOCK_SIZE as usize];
        queue(&manager, &target, &data).await;

        let temp = manager.item(&target).await.unwrap().temp_target().to_path_buf();
        std::fs::write(&temp, &data[..100]).unwrap();

        assert_eq!(
            manager.recheck(&target).await.unwrap(),
            RecheckOutcome::FileTooSmall
        );
    }

    #[tokio::test]
    async fn test_recheck_file_within_one_block_too_small() {
        let (dir, manager) = setup();
        let target = dir.path().join("f.bin");
        let data = vec![4u8; 1000];
        queue(&manager, &target, &data).await;

        let temp = manager.item(&target).await.unwrap().temp_target().to_path_buf();
        std::fs::write(&temp, &data).unwrap();

        assert_eq!(
            manager.recheck(&target).await.unwrap(),
            RecheckOutcome::FileTooSmall
        );
        assert!(!target.exists());
        assert!(manager.item(&target).await.is_some());
    }

    #[tokio::test]
    async fn test_recheck_keeps_good_blocks() {
        let (dir, manager) = setup();
        let target = dir.path().join("f.bin");
        let data: Vec<u8> = (0..3 * MIN_BLOCK_SIZE as usize).map(|i| (i % 251) as u8).collect();
        queue(&manager, &target, &data).await;

        let mut damaged = data.clone();
        damaged[MIN_BLOCK_SIZE as usize + 3] ^= 0x01;
        let temp = manager.item(&target).await.unwrap().temp_target().to_path_buf();
        std::fs::write(&temp, &damaged).unwrap();

        assert_eq!(manager.recheck(&target).await.unwrap(), RecheckOutcome::Done);

        let item = manager.item(&target).await.unwrap();
        let blocks: Vec<u64> = item.completed_blocks().keys().copied().collect();
        assert_eq!(blocks, vec![0, 2]);
        assert_eq!(item.downloaded(), 2 * MIN_BLOCK_SIZE);
    }

    #[tokio::test]
    async fn test_recheck_complete_file_finishes() {
        let (dir, manager) = setup();
        let target = dir.path().join("f.bin");
        let data = vec![9u8; 2 * MIN_BLOCK_SIZE as usize];
        queue(&manager, &target, &data).await;

        let temp = manager.item(&target).await.unwrap().temp_target().to_path_buf();
        std::fs::write(&temp, &data).unwrap();

        assert_eq!(
            manager.recheck(&target).await.unwrap(),
            RecheckOutcome::AlreadyFinished
        );
        assert_eq!(std::fs::read(&target).unwrap(), data);
        assert!(manager.item(&target).await.is_none());
    }

    #[tokio::test]
    async fn test_recheck_without_tree() {
        let (dir, manager) = setup();
        let target = dir.path().join("f.bin");
        let user = UserId::from_bytes([7u8; 24]);
        manager
            .add(AddRequest::new(&target, 2 * MIN_BLOCK_SIZE, user, "hub"))
            .await
            .unwrap();

        let temp = manager.item(&target).await.unwrap().temp_target().to_path_buf();
        std::fs::write(&temp, vec![0u8; 2 * MIN_BLOCK_SIZE as usize]).unwrap();

        assert_eq!(manager.recheck(&target).await.unwrap(), RecheckOutcome::NoTree);
    }
}
