//! Queue management
//!
//! The [`QueueManager`] is the aggregate root of the download queue. All
//! item, source and index mutations happen inside one critical section, so
//! invariants such as "a user is in at most one source list per item" hold
//! trivially. Disk writes of verified blocks, hashing and file moves happen
//! outside the lock.
//!
//! # Transfer Flow
//!
//! ```text
//! add() ──> Waiting ──start_download()──> Running ──on_transfer_complete()──> Finished
//!               ^                            │
//!               └── on_source_disconnected() ┤
//!               └── corrupt block / root ────┘  (source marked bad)
//! ```

use crate::config::QueueConfig;
use crate::download::{AcceptError, Completion, Download, DownloadPlan, Rejected, StoredBlock};
use crate::error::{QueueError, Result};
use crate::event::{ItemUpdate, QueueEvent};
use crate::item::{ItemFlags, QueueItem, QueueStatus};
use crate::priority::Priority;
use crate::source::{SourceFailure, UserId};
use crate::trees::{MemoryTreeStore, TreeStore};
use ferry_files::tree_hash::compute_merkle_root;
use ferry_files::{ContentId, TreeHash};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::sync::{Mutex, broadcast};

/// Longest accepted target path in bytes
pub const MAX_TARGET_LEN: usize = 4096;

/// A request to queue a file from a source
#[derive(Debug, Clone)]
pub struct AddRequest {
    /// Absolute target path
    pub target: PathBuf,
    /// Declared size (`None` until learned)
    pub size: Option<u64>,
    /// Declared content id
    pub content_id: Option<ContentId>,
    /// Source offering the file
    pub user: UserId,
    /// Hub the source was seen on
    pub hub: String,
    /// Item flags
    pub flags: ItemFlags,
    /// Explicit priority (`None` picks one by size)
    pub priority: Option<Priority>,
}

impl AddRequest {
    /// Request a file of known size
    pub fn new(
        target: impl Into<PathBuf>,
        size: u64,
        user: UserId,
        hub: impl Into<String>,
    ) -> Self {
        Self {
            target: target.into(),
            size: Some(size),
            content_id: None,
            user,
            hub: hub.into(),
            flags: ItemFlags::default(),
            priority: None,
        }
    }

    /// Set the declared content id
    #[must_use]
    pub fn with_content_id(mut self, content_id: ContentId) -> Self {
        self.content_id = Some(content_id);
        self
    }

    /// Set an explicit priority
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set item flags
    #[must_use]
    pub fn with_flags(mut self, flags: ItemFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// Items plus the directory index, guarded together
#[derive(Debug, Default)]
pub(crate) struct QueueState {
    pub(crate) items: BTreeMap<PathBuf, QueueItem>,
    pub(crate) by_dir: BTreeMap<PathBuf, BTreeSet<PathBuf>>,
    pub(crate) dirty: bool,
}

impl QueueState {
    pub(crate) fn insert(&mut self, item: QueueItem) {
        self.by_dir
            .entry(item.directory())
            .or_default()
            .insert(item.target.clone());
        self.items.insert(item.target.clone(), item);
    }

    pub(crate) fn remove(&mut self, target: &Path) -> Option<QueueItem> {
        let item = self.items.remove(target)?;
        let dir = item.directory();
        if let Some(targets) = self.by_dir.get_mut(&dir) {
            targets.remove(target);
            if targets.is_empty() {
                self.by_dir.remove(&dir);
            }
        }
        Some(item)
    }

    /// Highest priority first, then oldest, then by target
    pub(crate) fn next_candidate(&self, user: Option<&UserId>) -> Option<&QueueItem> {
        self.items
            .values()
            .filter(|item| item.is_candidate(user))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.added.cmp(&b.added))
                    .then_with(|| a.target.cmp(&b.target))
            })
    }

    pub(crate) fn is_user_running(&self, user: &UserId) -> bool {
        self.items
            .values()
            .any(|item| item.running_from.as_ref() == Some(user))
    }
}

/// Download queue manager
///
/// Owns every queued item, picks what to fetch next, and verifies bytes as
/// they arrive. Thread-safe; share it behind an `Arc`.
pub struct QueueManager {
    pub(crate) config: QueueConfig,
    pub(crate) state: Mutex<QueueState>,
    pub(crate) trees: Arc<dyn TreeStore>,
    events: broadcast::Sender<QueueEvent>,
}

impl QueueManager {
    /// Create a manager with an in-memory tree store
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidConfig`] if the configuration is invalid.
    pub fn new(config: QueueConfig) -> Result<Self> {
        Self::with_tree_store(config, Arc::new(MemoryTreeStore::new()))
    }

    /// Create a manager with a custom tree store
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidConfig`] if the configuration is invalid.
    pub fn with_tree_store(config: QueueConfig, trees: Arc<dyn TreeStore>) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(config.event_capacity);

        Ok(Self {
            config,
            state: Mutex::new(QueueState::default()),
            trees,
            events,
        })
    }

    /// Get configuration
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Get tree store
    pub fn trees(&self) -> &Arc<dyn TreeStore> {
        &self.trees
    }

    /// Subscribe to queue events
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: QueueEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn emit_sources(&self, item: &QueueItem) {
        self.emit(QueueEvent::SourcesUpdated {
            target: item.target.clone(),
            sources: item.sources.clone(),
        });
    }

    fn emit_update(&self, target: &Path, update: ItemUpdate) {
        self.emit(QueueEvent::Updated {
            target: target.to_path_buf(),
            update,
        });
    }

    // ============ Commands ============

    /// Queue a file, or add a source to an already queued one
    ///
    /// Zero-byte files are created at the target instead of being queued.
    /// Returns whether a connection to the source is wanted.
    ///
    /// # Errors
    ///
    /// - [`QueueError::InvalidTarget`] for a relative or overlong target, or
    ///   a new item whose target already exists on disk
    /// - [`QueueError::ContentConflict`] if the size or content id differs
    ///   from the queued item
    /// - [`QueueError::AlreadyFinished`] if the queued item is finished
    /// - [`QueueError::DuplicateSource`] if the source already failed for the
    ///   item
    pub async fn add(&self, req: AddRequest) -> Result<bool> {
        validate_target(&req.target)?;
        let is_list = req.flags.user_list;

        if req.size == Some(0) && !is_list {
            if !self.config.skip_zero_byte {
                create_empty(&req.target).await?;
                tracing::info!("Created empty file {}", req.target.display());
            }
            return Ok(false);
        }

        let mut state = self.state.lock().await;

        if let Some(item) = state.items.get_mut(&req.target) {
            if item.is_finished() {
                return Err(QueueError::AlreadyFinished(req.target));
            }
            item.check_identity(req.size, req.content_id)?;
            item.learn_identity(req.size, req.content_id);

            match item.sources.add(req.user, req.hub) {
                Ok(()) => {
                    tracing::debug!(
                        "Added source {} to {}",
                        req.user,
                        req.target.display()
                    );
                    self.emit_sources(item);
                }
                // Same request again
                Err(QueueError::DuplicateSource(_)) if item.sources.is_good(&req.user) => {}
                Err(e) => return Err(e),
            }

            let priority = item.priority;
            state.dirty = true;
            return Ok(priority != Priority::Paused && !state.is_user_running(&req.user));
        }

        if !is_list && fs::try_exists(&req.target).await.unwrap_or(false) {
            return Err(QueueError::invalid_target(
                "File already exists at the target location",
            ));
        }

        let priority = if is_list {
            Priority::Highest
        } else {
            req.priority
                .unwrap_or_else(|| Priority::for_size(req.size, &self.config))
        };
        let id_text = req.content_id.map(|id| id.to_base32());
        let temp_target = self.config.temp_target(&req.target, id_text.as_deref());

        let mut item = QueueItem::new(
            req.target.clone(),
            temp_target,
            req.size,
            req.content_id,
            priority,
            req.flags,
            now_secs(),
        );
        item.sources.add(req.user, req.hub)?;

        tracing::info!(
            "Queued {} (size={:?}, root={}, priority={})",
            req.target.display(),
            req.size,
            id_text.as_deref().unwrap_or("-"),
            priority
        );

        self.emit(QueueEvent::Added(Box::new(item.clone())));
        state.insert(item);
        state.dirty = true;

        Ok(priority != Priority::Paused && !state.is_user_running(&req.user))
    }

    /// Queue a file-list request from `user`
    ///
    /// Lists are stored under the configured list directory, named after the
    /// user, always at highest priority, and never persisted.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`add`](Self::add).
    pub async fn add_list(
        &self,
        user: UserId,
        hub: impl Into<String>,
        flags: ItemFlags,
        initial_dir: Option<String>,
    ) -> Result<bool> {
        let name = if flags.partial_list {
            format!("{user}.partial")
        } else {
            user.to_base32()
        };
        let target = self.config.list_dir.join(name);

        let request = AddRequest {
            target: target.clone(),
            size: None,
            content_id: None,
            user,
            hub: hub.into(),
            flags: ItemFlags {
                user_list: true,
                ..flags
            },
            priority: Some(Priority::Highest),
        };
        let want = self.add(request).await?;

        if initial_dir.is_some() {
            let mut state = self.state.lock().await;
            if let Some(item) = state.items.get_mut(&target) {
                item.initial_dir = initial_dir;
            }
        }

        Ok(want)
    }

    /// Relocate an item and its temp file
    ///
    /// If `new_target` names an identical item (same size and content id),
    /// the sources are merged into it and this item is removed.
    ///
    /// # Errors
    ///
    /// - [`QueueError::NotFound`] if `target` is not queued
    /// - [`QueueError::Running`] if the item is running
    /// - [`QueueError::ContentConflict`] if `new_target` names a different item
    pub async fn move_item(&self, target: &Path, new_target: &Path) -> Result<()> {
        validate_target(new_target)?;
        if target == new_target {
            return Ok(());
        }

        let mut state = self.state.lock().await;

        let item = state
            .items
            .get(target)
            .ok_or_else(|| QueueError::NotFound(target.to_path_buf()))?;
        if item.is_running() {
            return Err(QueueError::Running(target.to_path_buf()));
        }

        if let Some(existing) = state.items.get(new_target) {
            if existing.size != item.size
                || existing.content_id != item.content_id
                || existing.is_finished()
            {
                return Err(QueueError::conflict(
                    "A different file is already queued at the new target",
                ));
            }

            let Some(moved) = state.remove(target) else {
                return Err(QueueError::NotFound(target.to_path_buf()));
            };
            let Some(existing) = state.items.get_mut(new_target) else {
                return Err(QueueError::NotFound(new_target.to_path_buf()));
            };
            let merged = existing.sources.merge(&moved.sources);
            let keep_temp = existing.temp_target == moved.temp_target;
            self.emit_sources(existing);
            state.dirty = true;
            drop(state);

            if !keep_temp {
                remove_file_quiet(&moved.temp_target).await;
            }
            tracing::info!(
                "Merged {} into {} ({} new sources)",
                target.display(),
                new_target.display(),
                merged
            );
            self.emit(QueueEvent::Removed {
                target: target.to_path_buf(),
            });
            return Ok(());
        }

        let Some(mut item) = state.remove(target) else {
            return Err(QueueError::NotFound(target.to_path_buf()));
        };
        let id_text = item.content_id.map(|id| id.to_base32());
        let new_temp = self.config.temp_target(new_target, id_text.as_deref());

        if new_temp != item.temp_target {
            if let Err(e) = move_file(&item.temp_target, &new_temp).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    state.insert(item);
                    return Err(e.into());
                }
            }
        }

        item.target = new_target.to_path_buf();
        item.temp_target = new_temp;
        state.insert(item);
        state.dirty = true;
        drop(state);

        tracing::info!("Moved {} to {}", target.display(), new_target.display());
        self.emit(QueueEvent::Moved {
            from: target.to_path_buf(),
            to: new_target.to_path_buf(),
        });
        Ok(())
    }

    /// Set an item's priority
    ///
    /// Pausing a running item raises its abort flag.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NotFound`] if `target` is not queued.
    pub async fn set_priority(&self, target: &Path, priority: Priority) -> Result<()> {
        self.update_priority(target, |_| priority).await.map(|_| ())
    }

    /// Raise an item's priority one step
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NotFound`] if `target` is not queued.
    pub async fn increment_priority(&self, target: &Path) -> Result<Priority> {
        self.update_priority(target, Priority::increment).await
    }

    /// Lower an item's priority one step
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NotFound`] if `target` is not queued.
    pub async fn decrement_priority(&self, target: &Path) -> Result<Priority> {
        self.update_priority(target, Priority::decrement).await
    }

    async fn update_priority(
        &self,
        target: &Path,
        f: impl FnOnce(Priority) -> Priority,
    ) -> Result<Priority> {
        let mut state = self.state.lock().await;
        let item = state
            .items
            .get_mut(target)
            .ok_or_else(|| QueueError::NotFound(target.to_path_buf()))?;

        let priority = f(item.priority);
        if priority == item.priority {
            return Ok(priority);
        }

        item.priority = priority;
        if priority == Priority::Paused && item.abort_download() {
            tracing::debug!("Paused running item {}", target.display());
        }
        state.dirty = true;
        drop(state);

        self.emit_update(target, ItemUpdate::priority(priority));
        Ok(priority)
    }

    /// Remove an item
    ///
    /// A running item has its abort flag raised; its temp file is deleted
    /// once the connection reports the disconnect.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NotFound`] if `target` is not queued.
    pub async fn remove(&self, target: &Path) -> Result<()> {
        let mut state = self.state.lock().await;
        let item = state
            .remove(target)
            .ok_or_else(|| QueueError::NotFound(target.to_path_buf()))?;
        state.dirty = true;
        drop(state);

        if !item.abort_download() && !item.is_finished() {
            remove_file_quiet(&item.temp_target).await;
        }

        tracing::info!("Removed {} from queue", target.display());
        self.emit(QueueEvent::Removed {
            target: target.to_path_buf(),
        });
        Ok(())
    }

    /// Re-admit bad sources of an item
    ///
    /// Clears the record of `user`, or of every bad source when `None`.
    /// Returns the number of re-admitted sources.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NotFound`] if `target` is not queued.
    pub async fn readd(&self, target: &Path, user: Option<UserId>) -> Result<usize> {
        let mut state = self.state.lock().await;
        let item = state
            .items
            .get_mut(target)
            .ok_or_else(|| QueueError::NotFound(target.to_path_buf()))?;

        let count = item.sources.readd(user.as_ref());
        if count > 0 {
            self.emit_sources(item);
            state.dirty = true;
        }
        Ok(count)
    }

    /// Record a classified failure of `user` for an item
    ///
    /// A missing tree on a file below `max_size_without_tree` only flags the
    /// source. Otherwise the source moves to the bad list and, if it is
    /// delivering the item, its download is aborted.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NotFound`] if `target` is not queued.
    pub async fn report_failure(
        &self,
        target: &Path,
        user: UserId,
        reason: SourceFailure,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let item = state
            .items
            .get_mut(target)
            .ok_or_else(|| QueueError::NotFound(target.to_path_buf()))?;

        if self.fail_source(item, &user, reason) {
            self.emit_sources(item);
            state.dirty = true;
        }
        Ok(())
    }

    /// Apply a failure to one item; returns whether the source lists changed
    fn fail_source(&self, item: &mut QueueItem, user: &UserId, reason: SourceFailure) -> bool {
        let small = item
            .size
            .is_some_and(|size| size < self.config.max_size_without_tree);

        if reason == SourceFailure::NoTree && small {
            tracing::debug!(
                "{} has no tree for {}, tolerated for small file",
                user,
                item.target.display()
            );
            return item.sources.set_no_tree(user);
        }

        if !item.sources.report_failure(user, reason) {
            return false;
        }

        tracing::warn!(
            "Source {} failed for {}: {}",
            user,
            item.target.display(),
            reason
        );
        if item.running_from.as_ref() == Some(user) {
            item.abort_download();
        }
        true
    }

    /// Remove `user` as a source of an item permanently
    ///
    /// `reason` of `None` means dismissed by the user. A file-list request
    /// left without sources is removed.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NotFound`] if `target` is not queued.
    pub async fn remove_source(
        &self,
        target: &Path,
        user: UserId,
        reason: Option<SourceFailure>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.items.contains_key(target) {
            return Err(QueueError::NotFound(target.to_path_buf()));
        }
        let removed = self.remove_source_locked(&mut state, target, &user, reason);
        drop(state);

        self.finish_removals(removed).await;
        Ok(())
    }

    /// Remove `user` from every item where it is a good source
    ///
    /// Returns the number of items affected.
    pub async fn remove_source_everywhere(
        &self,
        user: UserId,
        reason: Option<SourceFailure>,
    ) -> usize {
        let mut state = self.state.lock().await;
        let targets: Vec<PathBuf> = state
            .items
            .values()
            .filter(|item| item.sources.is_good(&user))
            .map(|item| item.target.clone())
            .collect();

        let mut removed = Vec::new();
        for target in &targets {
            removed.extend(self.remove_source_locked(&mut state, target, &user, reason));
        }
        drop(state);

        tracing::info!("Removed source {} from {} items", user, targets.len());
        self.finish_removals(removed).await;
        targets.len()
    }

    /// Returns items dropped from the queue because they lost their last source
    fn remove_source_locked(
        &self,
        state: &mut QueueState,
        target: &Path,
        user: &UserId,
        reason: Option<SourceFailure>,
    ) -> Option<QueueItem> {
        let item = state.items.get_mut(target)?;
        if !item.sources.remove(user, reason) {
            return None;
        }
        if item.running_from.as_ref() == Some(user) {
            item.abort_download();
        }
        state.dirty = true;

        if item.is_file_list() && !item.sources.has_candidates() {
            return state.remove(target);
        }
        self.emit_sources(item);
        None
    }

    async fn finish_removals(&self, removed: impl IntoIterator<Item = QueueItem>) {
        for item in removed {
            if !item.is_running() {
                remove_file_quiet(&item.temp_target).await;
            }
            tracing::debug!("Dropped list request {}", item.target.display());
            self.emit(QueueEvent::Removed {
                target: item.target,
            });
        }
    }

    /// Accept tree metadata delivered by `user` for an item
    ///
    /// The tree must hash to the item's content id and fit its block
    /// layout, otherwise the peer is reported with [`SourceFailure::BadTree`].
    /// Stored blocks that contradict a valid tree are dropped; the rest are
    /// marked verified.
    ///
    /// # Errors
    ///
    /// - [`QueueError::NotFound`] if `target` is not queued
    /// - [`QueueError::SourceFailed`] if the tree is invalid
    pub async fn add_tree(&self, target: &Path, user: UserId, tree: TreeHash) -> Result<()> {
        let mut state = self.state.lock().await;
        let item = state
            .items
            .get_mut(target)
            .ok_or_else(|| QueueError::NotFound(target.to_path_buf()))?;

        let root_ok = item
            .content_id
            .is_some_and(|id| tree.validate() && tree.root == *id.as_bytes());
        let layout_ok = item.layout().is_some_and(|layout| {
            layout.block_size() == tree.block_size
                && layout.file_size() == tree.file_size
                && layout.block_count() == tree.leaf_count() as u64
        });

        if !(root_ok && layout_ok) {
            if self.fail_source(item, &user, SourceFailure::BadTree) {
                self.emit_sources(item);
                state.dirty = true;
            }
            return Err(QueueError::SourceFailed {
                user,
                reason: SourceFailure::BadTree,
            });
        }

        let before = item.completed.len();
        item.completed.retain(|&index, block| match tree.leaf(index) {
            Some(leaf) if *leaf == block.leaf => {
                block.verified = true;
                true
            }
            _ => false,
        });
        let dropped = before - item.completed.len();
        if dropped > 0 {
            item.downloaded = item.completed_bytes();
            tracing::warn!(
                "Dropped {} stored blocks of {} that contradict the tree",
                dropped,
                target.display()
            );
            self.emit_update(target, ItemUpdate::progress(item.downloaded, 0.0));
        }
        state.dirty = true;
        drop(state);

        tracing::debug!(
            "Stored tree {} ({} leaves) from {}",
            tree.content_id(),
            tree.leaf_count(),
            user
        );
        self.trees.insert(tree);
        Ok(())
    }

    // ============ Transfers ============

    /// Start downloading the next item `user` can supply
    ///
    /// Marks the item running, opens its temp file and positions at the first
    /// missing block. Returns `None` when nothing is eligible or the user is
    /// already delivering another item.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Io`] if the temp file cannot be opened; the item
    /// is then paused.
    pub async fn start_download(&self, user: &UserId) -> Result<Option<Download>> {
        let (target, plan) = {
            let mut state = self.state.lock().await;
            if state.is_user_running(user) {
                return Ok(None);
            }
            let Some(target) = state.next_candidate(Some(user)).map(|i| i.target.clone()) else {
                return Ok(None);
            };
            let Some(item) = state.items.get_mut(&target) else {
                return Ok(None);
            };

            let layout = item.layout();
            let (start, end) = match layout {
                Some(layout) => match item.first_missing_run() {
                    Some(run) => (
                        layout.block_range(run.start).start,
                        Some(layout.block_range(run.end - 1).end),
                    ),
                    // All blocks stored, only verification is left
                    None => (layout.file_size(), Some(layout.file_size())),
                },
                None => (0, None),
            };

            let expected = item
                .content_id
                .and_then(|id| self.trees.get(&id))
                .filter(|tree| {
                    layout.is_some_and(|l| {
                        l.block_size() == tree.block_size && l.file_size() == tree.file_size
                    })
                });

            let abort = Arc::new(AtomicBool::new(false));
            item.status = QueueStatus::Running;
            item.running_from = Some(*user);
            item.abort = Some(Arc::clone(&abort));
            item.last_error = None;

            tracing::debug!(
                "Starting {} from {} at offset {} (tree: {})",
                target.display(),
                user,
                start,
                expected.is_some()
            );

            let plan = DownloadPlan {
                target: target.clone(),
                temp_target: item.temp_target.clone(),
                source: *user,
                layout,
                start,
                end,
                expected,
                abort,
                bytes_at_start: item.completed_bytes(),
            };
            (target, plan)
        };

        self.emit_update(&target, ItemUpdate::status(QueueStatus::Running));

        match Download::open(plan).await {
            Ok(download) => Ok(Some(download)),
            Err(e) => {
                self.suspend(&target, &e.to_string()).await;
                Err(e.into())
            }
        }
    }

    /// Feed bytes delivered by the source
    ///
    /// Bytes go straight to the temp file. A completed block is recorded once
    /// its leaf matches negotiated tree metadata, when known.
    ///
    /// # Errors
    ///
    /// - [`QueueError::Aborted`] if the item was removed or paused; disconnect
    /// - [`QueueError::VerificationFailed`] if a block did not match its
    ///   leaf; the source is marked bad and the item is waiting again
    /// - [`QueueError::Io`] if the write failed; the item is paused
    pub async fn on_bytes_received(&self, download: &mut Download, bytes: &[u8]) -> Result<()> {
        if download.is_aborted() {
            return Err(QueueError::Aborted);
        }

        let blocks = match download.accept(bytes).await {
            Ok(blocks) => blocks,
            Err(Rejected { error, stored }) => {
                self.record_blocks(download, &stored).await;
                return Err(self.handle_accept_error(download, error).await);
            }
        };

        if !self.record_blocks(download, &blocks).await {
            download.poison();
            return Err(QueueError::Aborted);
        }
        Ok(())
    }

    /// Apply stored blocks to the item and publish progress
    ///
    /// Returns `false` if the item is gone or no longer running from the
    /// download's source.
    async fn record_blocks(&self, download: &mut Download, blocks: &[StoredBlock]) -> bool {
        let mut state = self.state.lock().await;
        let Some(item) = state.items.get_mut(&download.target) else {
            return false;
        };
        if item.running_from != Some(download.source) {
            return false;
        }

        let done = if item.size.is_some() {
            for block in blocks {
                tracing::trace!(
                    "Stored block {} ({} bytes, verified: {}) of {}",
                    block.index,
                    block.len,
                    block.verified,
                    download.target.display()
                );
                item.mark_block(block.index, block.leaf, block.verified);
            }
            item.completed_bytes() + download.partial_len()
        } else {
            download.position()
        };
        item.downloaded = done;
        if !blocks.is_empty() {
            state.dirty = true;
        }
        drop(state);

        download.update_progress(done);
        self.emit_update(
            &download.target,
            ItemUpdate::progress(done, download.progress().speed_bytes_per_sec),
        );
        true
    }

    async fn handle_accept_error(&self, download: &mut Download, err: AcceptError) -> QueueError {
        download.poison();
        let target = download.target.clone();

        match err {
            AcceptError::Corrupt(index) => {
                tracing::warn!(
                    "Block {} of {} from {} does not match the tree",
                    index,
                    target.display(),
                    download.source
                );

                let mut state = self.state.lock().await;
                if let Some(item) = state.items.get_mut(&target) {
                    if item.sources.report_failure(&download.source, SourceFailure::BadTree) {
                        self.emit_sources(item);
                    }
                    if item.running_from == Some(download.source) {
                        item.set_waiting();
                        self.emit_update(&target, ItemUpdate::status(QueueStatus::Waiting));
                    }
                    state.dirty = true;
                }

                QueueError::VerificationFailed {
                    target,
                    reason: SourceFailure::BadTree,
                }
            }
            AcceptError::Write(e) => {
                self.suspend(&target, &e.to_string()).await;
                e.into()
            }
            AcceptError::Tree(e) => {
                self.detach(&target, &download.source).await;
                e.into()
            }
        }
    }

    /// Pause an item after a local failure
    async fn suspend(&self, target: &Path, message: &str) {
        tracing::error!("Suspending {}: {}", target.display(), message);

        let mut state = self.state.lock().await;
        if let Some(item) = state.items.get_mut(target) {
            item.set_waiting();
            item.priority = Priority::Paused;
            item.last_error = Some(message.to_string());
            state.dirty = true;
        }
        drop(state);

        self.emit_update(
            target,
            ItemUpdate {
                status: Some(QueueStatus::Waiting),
                priority: Some(Priority::Paused),
                last_error: Some(message.to_string()),
                ..ItemUpdate::default()
            },
        );
    }

    /// Return an item to waiting if `source` is delivering it
    async fn detach(&self, target: &Path, source: &UserId) -> bool {
        let mut state = self.state.lock().await;
        match state.items.get_mut(target) {
            Some(item) if item.running_from.as_ref() == Some(source) => {
                item.set_waiting();
                let downloaded = item.downloaded;
                drop(state);
                self.emit_update(
                    target,
                    ItemUpdate {
                        status: Some(QueueStatus::Waiting),
                        downloaded: Some(downloaded),
                        ..ItemUpdate::default()
                    },
                );
                true
            }
            _ => false,
        }
    }

    /// The connection for a download closed
    ///
    /// If the item was running from that source it returns to waiting;
    /// bytes of an unfinished block are discarded. The temp file of an item
    /// removed while running is deleted here.
    pub async fn on_source_disconnected(&self, download: Download) {
        let aborted = download.is_aborted();
        let target = download.target.clone();
        let temp_target = download.temp_target.clone();
        let source = download.source;
        drop(download);

        if self.detach(&target, &source).await {
            tracing::debug!("{} disconnected from {}", source, target.display());
            return;
        }

        let gone = !self.state.lock().await.items.contains_key(&target);
        if aborted && gone {
            remove_file_quiet(&temp_target).await;
        }
    }

    /// The source delivered the whole requested range
    ///
    /// Computes the root over all stored leaves and compares it with the
    /// content id. On a match the item finishes, the temp file moves to the
    /// target and the item leaves the queue unless `keep_finished` is set.
    ///
    /// # Errors
    ///
    /// - [`QueueError::Aborted`] if the item was removed or paused
    /// - [`QueueError::VerificationFailed`] on a root mismatch; the source is
    ///   marked bad, unverified blocks are dropped and the item is waiting
    /// - [`QueueError::Io`] if the temp file could not be synced or moved
    pub async fn on_transfer_complete(&self, mut download: Download) -> Result<Completion> {
        if download.is_aborted() {
            self.on_source_disconnected(download).await;
            return Err(QueueError::Aborted);
        }

        let (trailing, range_root) = match download.finish().await {
            Ok(result) => result,
            Err(e) => return Err(self.handle_accept_error(&mut download, e).await),
        };

        let target = download.target.clone();
        let source = download.source;
        let received = download.position();
        drop(download);

        let mut state = self.state.lock().await;
        let Some(item) = state.items.get_mut(&target) else {
            return Err(QueueError::Aborted);
        };
        if item.running_from != Some(source) {
            return Err(QueueError::Aborted);
        }

        if item.size.is_some() {
            if let Some(block) = trailing {
                item.mark_block(block.index, block.leaf, block.verified);
            }
            if !item.all_blocks_complete() {
                item.set_waiting();
                let downloaded = item.downloaded;
                state.dirty = true;
                drop(state);
                self.emit_update(&target, ItemUpdate::progress(downloaded, 0.0));
                self.emit_update(&target, ItemUpdate::status(QueueStatus::Waiting));
                return Ok(Completion::Incomplete);
            }

            if let Some(id) = item.content_id {
                let root = compute_merkle_root(&item.completed_leaves());
                if root != *id.as_bytes() {
                    tracing::warn!(
                        "Root mismatch for {} from {}: expected {}, got {}",
                        target.display(),
                        source,
                        id,
                        ContentId::from_bytes(root)
                    );
                    if self.fail_source(item, &source, SourceFailure::ChecksumMismatch) {
                        self.emit_sources(item);
                    }
                    let dropped = item.drop_unverified();
                    item.set_waiting();
                    let downloaded = item.downloaded;
                    state.dirty = true;
                    drop(state);

                    tracing::debug!("Dropped {} unverified blocks", dropped);
                    self.emit_update(
                        &target,
                        ItemUpdate {
                            status: Some(QueueStatus::Waiting),
                            downloaded: Some(downloaded),
                            ..ItemUpdate::default()
                        },
                    );
                    return Err(QueueError::VerificationFailed {
                        target,
                        reason: SourceFailure::ChecksumMismatch,
                    });
                }
            }
        } else {
            // File lists learn their size from the data
            item.size = Some(received);
        }

        tracing::debug!(
            "Range root for {}: {}",
            target.display(),
            ContentId::from_bytes(range_root)
        );
        drop(state);

        self.complete_item(&target).await?;
        Ok(Completion::Finished)
    }

    /// Finish a fully stored item: move it into place and announce it
    ///
    /// The item counts as running while its file is moved. A failed move
    /// suspends it with the temp file left in place.
    pub(crate) async fn complete_item(&self, target: &Path) -> Result<()> {
        let (temp_target, size, content_id) = {
            let mut state = self.state.lock().await;
            let item = state
                .items
                .get_mut(target)
                .ok_or_else(|| QueueError::NotFound(target.to_path_buf()))?;
            item.status = QueueStatus::Running;
            item.running_from = None;
            item.abort = None;
            let size = item.size.unwrap_or(item.downloaded);
            (item.temp_target.clone(), size, item.content_id)
        };

        if let Err(e) = move_file(&temp_target, target).await {
            tracing::error!(
                "Failed to move {} to {}: {}",
                temp_target.display(),
                target.display(),
                e
            );
            self.suspend(target, &e.to_string()).await;
            return Err(e.into());
        }

        {
            let mut state = self.state.lock().await;
            if let Some(item) = state.items.get_mut(target) {
                item.status = QueueStatus::Finished;
                item.downloaded = size;
                item.last_error = None;
            }
            state.dirty = true;
        }

        tracing::info!("Finished {} ({} bytes)", target.display(), size);
        self.emit_update(target, ItemUpdate::status(QueueStatus::Finished));
        self.emit(QueueEvent::Finished {
            target: target.to_path_buf(),
            size,
            content_id,
        });

        if !self.config.keep_finished {
            let removed = self.state.lock().await.remove(target).is_some();
            if removed {
                self.emit(QueueEvent::Removed {
                    target: target.to_path_buf(),
                });
            }
        }
        Ok(())
    }

    // ============ Snapshots ============

    /// Snapshot of one item
    pub async fn item(&self, target: &Path) -> Option<QueueItem> {
        self.state.lock().await.items.get(target).cloned()
    }

    /// Snapshot of all items, ordered by target
    pub async fn items(&self) -> Vec<QueueItem> {
        self.state.lock().await.items.values().cloned().collect()
    }

    /// Snapshot of the items in one directory
    pub async fn items_in_dir(&self, dir: &Path) -> Vec<QueueItem> {
        let state = self.state.lock().await;
        state
            .by_dir
            .get(dir)
            .into_iter()
            .flatten()
            .filter_map(|target| state.items.get(target).cloned())
            .collect()
    }

    /// Item the selection rule would pick next
    pub async fn next_candidate(&self, user: Option<&UserId>) -> Option<QueueItem> {
        self.state.lock().await.next_candidate(user).cloned()
    }

    /// Number of queued items
    pub async fn len(&self) -> usize {
        self.state.lock().await.items.len()
    }

    /// Check if the queue is empty
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.items.is_empty()
    }

    /// Whether there are unsaved changes
    pub async fn is_dirty(&self) -> bool {
        self.state.lock().await.dirty
    }
}

/// Check that a target is usable
///
/// # Errors
///
/// Returns [`QueueError::InvalidTarget`] for relative, overlong or nameless
/// paths.
pub fn validate_target(target: &Path) -> Result<()> {
    if target.as_os_str().len() > MAX_TARGET_LEN {
        return Err(QueueError::invalid_target("Target filename too long"));
    }
    if !target.is_absolute() {
        return Err(QueueError::invalid_target(
            "Invalid target file (missing directory, check default download directory setting)",
        ));
    }
    if target.file_name().is_none_or(|name| name.is_empty()) {
        return Err(QueueError::invalid_target("Invalid target file name"));
    }
    Ok(())
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

async fn create_empty(target: &Path) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::File::create(target).await.map(|_| ())
}

/// Rename, falling back to copy and delete across file systems
pub(crate) async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).await?;
    }
    match fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(e),
        Err(_) => {
            fs::copy(from, to).await?;
            fs::remove_file(from).await
        }
    }
}

pub(crate) async fn remove_file_quiet(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Failed to delete {}: {}", path.display(), e);
        }
    }
}
