//! Queue items.

use crate::error::{QueueError, Result};
use crate::priority::Priority;
use crate::source::{SourceList, UserId};
use ferry_files::{BlockLayout, ContentId, LeafHash};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Item status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    /// Not being transferred
    #[default]
    Waiting,
    /// A source is delivering bytes
    Running,
    /// Size reached and verified
    Finished,
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Waiting => write!(f, "Waiting"),
            Self::Running => write!(f, "Running"),
            Self::Finished => write!(f, "Finished"),
        }
    }
}

/// Item kind flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemFlags {
    /// The payload is a peer's file list
    pub user_list: bool,
    /// Only a subtree of the list was requested
    pub partial_list: bool,
    /// Opened for viewing, not kept
    pub client_view: bool,
    /// Text payload
    pub text: bool,
}

impl ItemFlags {
    /// Flags for a full file-list request
    #[must_use]
    pub fn user_list() -> Self {
        Self {
            user_list: true,
            ..Self::default()
        }
    }
}

/// A block written to the temp file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedBlock {
    /// Leaf hash of the stored block
    #[serde(with = "leaf_text")]
    pub leaf: LeafHash,
    /// Checked against negotiated tree metadata
    pub verified: bool,
}

mod leaf_text {
    use ferry_files::{LeafHash, decode_base32, encode_base32};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(leaf: &LeafHash, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&encode_base32(leaf))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<LeafHash, D::Error> {
        let text = String::deserialize(d)?;
        let bytes = decode_base32(&text).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("leaf hash must be 32 bytes"))
    }
}

/// One requested file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub(crate) target: PathBuf,
    pub(crate) temp_target: PathBuf,
    pub(crate) size: Option<u64>,
    pub(crate) content_id: Option<ContentId>,
    pub(crate) priority: Priority,
    #[serde(skip)]
    pub(crate) status: QueueStatus,
    #[serde(default)]
    pub(crate) flags: ItemFlags,
    #[serde(default)]
    pub(crate) downloaded: u64,
    pub(crate) added: u64,
    #[serde(default)]
    pub(crate) sources: SourceList,
    #[serde(default)]
    pub(crate) completed: BTreeMap<u64, CompletedBlock>,
    #[serde(skip)]
    pub(crate) last_error: Option<String>,
    #[serde(skip)]
    pub(crate) running_from: Option<UserId>,
    #[serde(skip)]
    pub(crate) abort: Option<Arc<AtomicBool>>,
    #[serde(skip)]
    pub(crate) initial_dir: Option<String>,
}

impl QueueItem {
    /// Create a waiting item
    #[must_use]
    pub fn new(
        target: PathBuf,
        temp_target: PathBuf,
        size: Option<u64>,
        content_id: Option<ContentId>,
        priority: Priority,
        flags: ItemFlags,
        added: u64,
    ) -> Self {
        Self {
            target,
            temp_target,
            size,
            content_id,
            priority,
            status: QueueStatus::Waiting,
            flags,
            downloaded: 0,
            added,
            sources: SourceList::new(),
            completed: BTreeMap::new(),
            last_error: None,
            running_from: None,
            abort: None,
            initial_dir: None,
        }
    }

    /// Get target path
    #[must_use]
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Get temp file path
    #[must_use]
    pub fn temp_target(&self) -> &Path {
        &self.temp_target
    }

    /// Declared size, if known
    #[must_use]
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// Declared content id, if known
    #[must_use]
    pub fn content_id(&self) -> Option<ContentId> {
        self.content_id
    }

    /// Get priority
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Get status
    #[must_use]
    pub fn status(&self) -> QueueStatus {
        self.status
    }

    /// Get flags
    #[must_use]
    pub fn flags(&self) -> ItemFlags {
        self.flags
    }

    /// Bytes stored so far
    #[must_use]
    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    /// Creation time (UNIX seconds)
    #[must_use]
    pub fn added(&self) -> u64 {
        self.added
    }

    /// Get sources
    #[must_use]
    pub fn sources(&self) -> &SourceList {
        &self.sources
    }

    /// Blocks stored in the temp file
    #[must_use]
    pub fn completed_blocks(&self) -> &BTreeMap<u64, CompletedBlock> {
        &self.completed
    }

    /// Last local error, if the item was suspended
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Source currently delivering bytes
    #[must_use]
    pub fn running_from(&self) -> Option<&UserId> {
        self.running_from.as_ref()
    }

    /// Directory to show first when a file list opens
    #[must_use]
    pub fn initial_dir(&self) -> Option<&str> {
        self.initial_dir.as_deref()
    }

    /// Check if item is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status == QueueStatus::Running
    }

    /// Check if item is finished
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.status == QueueStatus::Finished
    }

    /// Whether the item is a file-list request
    #[must_use]
    pub fn is_file_list(&self) -> bool {
        self.flags.user_list
    }

    /// Block layout, once the size is known
    #[must_use]
    pub fn layout(&self) -> Option<BlockLayout> {
        self.size.map(BlockLayout::for_file_size)
    }

    /// Directory containing the target
    #[must_use]
    pub fn directory(&self) -> PathBuf {
        self.target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }

    /// Whether the selection rule may pick this item
    ///
    /// With `user` given, that user must be one of the good sources.
    #[must_use]
    pub fn is_candidate(&self, user: Option<&UserId>) -> bool {
        self.status == QueueStatus::Waiting
            && self.priority > Priority::Paused
            && match user {
                Some(user) => self.sources.is_good(user),
                None => self.sources.has_candidates(),
            }
    }

    /// Fail if `size` or `content_id` contradicts what is already known
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ContentConflict`] on a mismatch.
    pub fn check_identity(&self, size: Option<u64>, content_id: Option<ContentId>) -> Result<()> {
        if matches!((self.size, size), (Some(known), Some(claimed)) if known != claimed) {
            return Err(QueueError::conflict(
                "A file with a different size already exists in the queue",
            ));
        }

        if matches!((self.content_id, content_id), (Some(known), Some(claimed)) if known != claimed)
        {
            return Err(QueueError::conflict(
                "A file with a different content id already exists in the queue",
            ));
        }

        Ok(())
    }

    /// Fill in size and content id that were still unknown
    pub(crate) fn learn_identity(&mut self, size: Option<u64>, content_id: Option<ContentId>) {
        if self.size.is_none() {
            self.size = size;
        }
        if self.content_id.is_none() {
            self.content_id = content_id;
        }
    }

    /// Bytes covered by completed blocks
    #[must_use]
    pub fn completed_bytes(&self) -> u64 {
        match self.layout() {
            Some(layout) => self
                .completed
                .keys()
                .map(|&index| {
                    let range = layout.block_range(index);
                    range.end - range.start
                })
                .sum(),
            None => 0,
        }
    }

    /// Whether every block has been stored
    #[must_use]
    pub fn all_blocks_complete(&self) -> bool {
        match self.layout() {
            Some(layout) => (0..layout.block_count()).all(|i| self.completed.contains_key(&i)),
            None => false,
        }
    }

    /// First run of consecutive missing blocks, as `start..end` indices
    #[must_use]
    pub fn first_missing_run(&self) -> Option<std::ops::Range<u64>> {
        let layout = self.layout()?;
        let count = layout.block_count();
        let start = (0..count).find(|i| !self.completed.contains_key(i))?;
        let end = (start..count)
            .find(|i| self.completed.contains_key(i))
            .unwrap_or(count);
        Some(start..end)
    }

    /// Record a stored block
    pub(crate) fn mark_block(&mut self, index: u64, leaf: LeafHash, verified: bool) {
        self.completed.insert(index, CompletedBlock { leaf, verified });
    }

    /// Forget blocks not checked against tree metadata
    ///
    /// Returns the number of blocks dropped.
    pub(crate) fn drop_unverified(&mut self) -> usize {
        let before = self.completed.len();
        self.completed.retain(|_, block| block.verified);
        self.downloaded = self.completed_bytes();
        before - self.completed.len()
    }

    /// Leaves of all completed blocks in file order
    pub(crate) fn completed_leaves(&self) -> Vec<LeafHash> {
        self.completed.values().map(|block| block.leaf).collect()
    }

    /// Return to waiting, detaching the current source
    pub(crate) fn set_waiting(&mut self) {
        self.status = QueueStatus::Waiting;
        self.running_from = None;
        self.abort = None;
        self.downloaded = self.completed_bytes();
    }

    /// Raise the abort flag of the running download
    pub(crate) fn abort_download(&self) -> bool {
        match &self.abort {
            Some(flag) => {
                flag.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_files::MIN_BLOCK_SIZE;

    fn item(size: u64) -> QueueItem {
        QueueItem::new(
            PathBuf::from("/d/file.bin"),
            PathBuf::from("/d/file.bin.part"),
            Some(size),
            Some(ContentId::from_bytes([1u8; 32])),
            Priority::Normal,
            ItemFlags::default(),
            0,
        )
    }

    #[test]
    fn test_identity_conflicts() {
        let item = item(100);
        assert!(item.check_identity(Some(100), None).is_ok());
        assert!(item.check_identity(Some(200), None).is_err());
        assert!(
            item.check_identity(Some(100), Some(ContentId::from_bytes([2u8; 32])))
                .is_err()
        );
    }

    #[test]
    fn test_learn_identity_never_overwrites() {
        let mut item = item(100);
        item.learn_identity(Some(500), Some(ContentId::from_bytes([9u8; 32])));
        assert_eq!(item.size(), Some(100));
        assert_eq!(item.content_id(), Some(ContentId::from_bytes([1u8; 32])));
    }

    #[test]
    fn test_missing_runs() {
        let mut item = item(4 * MIN_BLOCK_SIZE + 10);
        assert_eq!(item.first_missing_run(), Some(0..5));

        item.mark_block(0, [0u8; 32], false);
        item.mark_block(2, [0u8; 32], true);
        assert_eq!(item.first_missing_run(), Some(1..2));
        assert_eq!(item.completed_bytes(), 2 * MIN_BLOCK_SIZE);

        for i in 0..5 {
            item.mark_block(i, [0u8; 32], true);
        }
        assert!(item.all_blocks_complete());
        assert_eq!(item.first_missing_run(), None);
        assert_eq!(item.completed_bytes(), 4 * MIN_BLOCK_SIZE + 10);
    }

    #[test]
    fn test_drop_unverified() {
        let mut item = item(3 * MIN_BLOCK_SIZE);
        item.mark_block(0, [0u8; 32], true);
        item.mark_block(1, [0u8; 32], false);
        item.mark_block(2, [0u8; 32], false);

        assert_eq!(item.drop_unverified(), 2);
        assert_eq!(item.downloaded(), MIN_BLOCK_SIZE);
    }

    #[test]
    fn test_paused_is_not_candidate() {
        let mut item = item(100);
        let user = UserId::from_bytes([4u8; 24]);
        item.sources.add(user, "hub").unwrap();
        assert!(item.is_candidate(Some(&user)));

        item.priority = Priority::Paused;
        assert!(!item.is_candidate(None));
    }
}
