//! One active download connection.
//!
//! A [`Download`] owns its temp file handle and its hash tree. Bytes are
//! hashed and written as they arrive; a block counts as stored only once it
//! is complete and, when a tree is known, its leaf matches. Nothing here
//! takes the queue lock; the manager applies the results.

use crate::progress::DownloadProgress;
use crate::source::UserId;
use ferry_files::{BlockLayout, HashTree, LeafHash, MIN_BLOCK_SIZE, TreeHash, TreeHashError};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

/// Result of [`QueueManager::on_transfer_complete`](crate::QueueManager::on_transfer_complete)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Whole file verified and moved to the target
    Finished,
    /// Blocks are still missing; the item is waiting again
    Incomplete,
}

/// What the manager decided to fetch
pub(crate) struct DownloadPlan {
    pub target: PathBuf,
    pub temp_target: PathBuf,
    pub source: UserId,
    pub layout: Option<BlockLayout>,
    pub start: u64,
    pub end: Option<u64>,
    pub expected: Option<Arc<TreeHash>>,
    pub abort: Arc<AtomicBool>,
    pub bytes_at_start: u64,
}

/// A block that reached the temp file
#[derive(Debug, Clone, Copy)]
pub(crate) struct StoredBlock {
    pub index: u64,
    pub leaf: LeafHash,
    pub verified: bool,
    pub len: u64,
}

/// Why incoming bytes could not be stored
#[derive(Debug)]
pub(crate) enum AcceptError {
    /// Block `index` did not match its negotiated leaf
    Corrupt(u64),
    /// Local write failed
    Write(std::io::Error),
    /// Internal tree misuse
    Tree(TreeHashError),
}

/// Failed [`Download::accept`], with the blocks stored before the failure
#[derive(Debug)]
pub(crate) struct Rejected {
    pub error: AcceptError,
    pub stored: Vec<StoredBlock>,
}

/// An active transfer of one item from one source
#[derive(Debug)]
pub struct Download {
    pub(crate) target: PathBuf,
    pub(crate) temp_target: PathBuf,
    pub(crate) source: UserId,
    layout: Option<BlockLayout>,
    start: u64,
    end: Option<u64>,
    pos: u64,
    expected: Option<Arc<TreeHash>>,
    tree: HashTree,
    block_start: u64,
    file: File,
    abort: Arc<AtomicBool>,
    failed: bool,
    progress: DownloadProgress,
}

impl Download {
    /// Open the temp file and position at the planned start
    pub(crate) async fn open(plan: DownloadPlan) -> std::io::Result<Self> {
        if let Some(parent) = plan.temp_target.parent() {
            fs::create_dir_all(parent).await?;
        }

        let size = plan.layout.map(|l| l.file_size());
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(size.is_none())
            .open(&plan.temp_target)
            .await?;

        if let Some(size) = size {
            if file.metadata().await?.len() < size {
                file.set_len(size).await?;
            }
        }
        file.seek(SeekFrom::Start(plan.start)).await?;

        let block_size = plan.layout.map_or(MIN_BLOCK_SIZE, |l| l.block_size());
        let tree = HashTree::new(block_size).map_err(std::io::Error::other)?;

        Ok(Self {
            target: plan.target,
            temp_target: plan.temp_target,
            source: plan.source,
            layout: plan.layout,
            start: plan.start,
            end: plan.end,
            pos: plan.start,
            expected: plan.expected,
            tree,
            block_start: plan.start,
            file,
            abort: plan.abort,
            failed: false,
            progress: DownloadProgress::new(plan.bytes_at_start, size),
        })
    }

    /// Get target path
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Source delivering the bytes
    pub fn source(&self) -> &UserId {
        &self.source
    }

    /// First byte requested from the source
    pub fn start(&self) -> u64 {
        self.start
    }

    /// End of the requested range (`None` while the size is unknown)
    pub fn end(&self) -> Option<u64> {
        self.end
    }

    /// Next file offset expected from the source
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Get block size
    pub fn block_size(&self) -> u64 {
        self.tree.block_size()
    }

    /// Whether negotiated leaf metadata is checked per block
    pub fn has_tree(&self) -> bool {
        self.expected.is_some()
    }

    /// Get progress
    pub fn progress(&self) -> &DownloadProgress {
        &self.progress
    }

    /// Whether the connection should stop
    ///
    /// Set when the item is removed or paused, or after a verification or
    /// write failure.
    pub fn is_aborted(&self) -> bool {
        self.failed || self.abort.load(Ordering::Acquire)
    }

    /// Whether the whole requested range has arrived
    pub fn is_range_complete(&self) -> bool {
        self.end.is_some_and(|end| self.pos >= end)
    }

    /// Bytes of the current block received so far
    pub(crate) fn partial_len(&self) -> u64 {
        self.pos - self.block_start
    }

    pub(crate) fn update_progress(&mut self, bytes_done: u64) {
        self.progress.update(bytes_done);
    }

    fn current_block_end(&self) -> u64 {
        match self.layout {
            Some(layout) => layout.block_range(layout.block_index(self.pos)).end,
            None => (self.pos / MIN_BLOCK_SIZE + 1) * MIN_BLOCK_SIZE,
        }
    }

    /// Take the next bytes from the source, storing every completed block
    ///
    /// On failure the blocks completed earlier in the same call are still
    /// returned, as they are already on disk.
    pub(crate) async fn accept(&mut self, mut data: &[u8]) -> Result<Vec<StoredBlock>, Rejected> {
        let mut stored = Vec::new();

        while !data.is_empty() {
            let remaining = self.end.map_or(u64::MAX, |end| end.saturating_sub(self.pos));
            if remaining == 0 {
                tracing::trace!(extra = data.len(), "ignoring bytes past the requested range");
                break;
            }

            let block_end = self.current_block_end();
            let room = (block_end - self.pos).min(remaining);
            let take = usize::try_from(room).unwrap_or(usize::MAX).min(data.len());
            let chunk = &data[..take];

            if let Err(error) = self.write_chunk(chunk).await {
                return Err(Rejected { error, stored });
            }
            self.pos += take as u64;
            data = &data[take..];

            if self.pos == block_end {
                match self.seal_block() {
                    Ok(block) => stored.push(block),
                    Err(error) => return Err(Rejected { error, stored }),
                }
            }
        }

        // Unknown size: the final short block is sealed on completion
        Ok(stored)
    }

    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), AcceptError> {
        self.tree.update(chunk).map_err(AcceptError::Tree)?;
        if let Err(e) = self.file.write_all(chunk).await {
            self.failed = true;
            return Err(AcceptError::Write(e));
        }
        Ok(())
    }

    /// Close the block ending at the current position
    fn seal_block(&mut self) -> Result<StoredBlock, AcceptError> {
        if self.tree.buffered_bytes() > 0 {
            // Short final block
            self.tree.finalize();
        }
        let leaf = self
            .tree
            .leaves()
            .last()
            .copied()
            .ok_or(AcceptError::Tree(TreeHashError::Sealed))?;

        let offset = self.block_start;
        let len = self.pos - offset;
        let index = offset / self.tree.block_size();

        let verified = match &self.expected {
            Some(expected) => {
                if expected.leaf(index) != Some(&leaf) {
                    self.pos = offset;
                    self.failed = true;
                    return Err(AcceptError::Corrupt(index));
                }
                true
            }
            None => false,
        };

        self.block_start = self.pos;
        Ok(StoredBlock {
            index,
            leaf,
            verified,
            len,
        })
    }

    /// Seal any trailing bytes and sync the temp file
    ///
    /// Returns the block written last, if the range ended inside one, and the
    /// root over the transferred range.
    pub(crate) async fn finish(&mut self) -> Result<(Option<StoredBlock>, LeafHash), AcceptError> {
        // Known layouts seal their last block in `accept`; anything left is
        // an unfinished block and is not stored
        let trailing = if self.layout.is_none() && self.partial_len() > 0 {
            Some(self.seal_block()?)
        } else {
            None
        };

        if let Err(e) = self.file.flush().await {
            return Err(AcceptError::Write(e));
        }
        if let Err(e) = self.file.sync_data().await {
            return Err(AcceptError::Write(e));
        }

        Ok((trailing, self.tree.finalize()))
    }

    /// Mark the connection unusable
    pub(crate) fn poison(&mut self) {
        self.failed = true;
    }
}
