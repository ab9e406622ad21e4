//! Queue test fixture
//!
//! Wraps a [`QueueManager`] rooted in a temporary directory and plays the
//! role of the transport: it opens downloads and feeds them bytes in chunks.
//!
//! # Example
//!
//! ```no_run
//! use ferry_integration_tests::fixtures::{QueueFixture, peer, sample_data};
//!
//! # async fn run() {
//! let fixture = QueueFixture::new();
//! let data = sample_data(100_000, 1);
//! fixture.queue(&data, peer(1), true).await;
//! fixture.transfer(peer(1), &data, 8192).await.unwrap();
//! # }
//! ```

use ferry_files::tree_hash::{DEFAULT_MAX_LEVELS, choose_block_size, compute_tree_hash_from_data};
use ferry_files::TreeHash;
use ferry_queue::{AddRequest, Completion, QueueConfig, QueueManager, QueueStore, Result, UserId};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

static NEXT_FILE: AtomicU32 = AtomicU32::new(0);

/// Deterministic pseudo-random payload
pub fn sample_data(len: usize, seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

/// Peer identity from one byte
pub fn peer(n: u8) -> UserId {
    UserId::from_bytes([n; 24])
}

/// Tree for `data` with the block size its length selects
pub fn tree_for(data: &[u8]) -> TreeHash {
    let block_size = choose_block_size(data.len() as u64, DEFAULT_MAX_LEVELS);
    compute_tree_hash_from_data(data, block_size).unwrap_or_else(|e| panic!("tree: {e}"))
}

/// A queue manager in a scratch directory
pub struct QueueFixture {
    dir: TempDir,
    /// Manager under test
    pub manager: Arc<QueueManager>,
}

impl QueueFixture {
    /// Fixture with default settings
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Fixture with adjusted settings
    pub fn with_config(adjust: impl FnOnce(&mut QueueConfig)) -> Self {
        let dir = TempDir::new().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let mut config = QueueConfig {
            list_dir: dir.path().join("lists"),
            queue_file: dir.path().join("queue.json"),
            ..QueueConfig::default()
        };
        adjust(&mut config);

        let manager = QueueManager::new(config).unwrap_or_else(|e| panic!("manager: {e}"));
        Self {
            dir,
            manager: Arc::new(manager),
        }
    }

    /// Another manager sharing this fixture's directory
    pub fn restart(&self) -> Arc<QueueManager> {
        let manager = QueueManager::new(self.manager.config().clone())
            .unwrap_or_else(|e| panic!("manager: {e}"));
        Arc::new(manager)
    }

    /// Scratch directory
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Persisted queue file
    pub fn store(&self) -> QueueStore {
        QueueStore::new(&self.manager.config().queue_file)
    }

    /// Fresh target path in the download directory
    pub fn target(&self) -> PathBuf {
        let n = NEXT_FILE.fetch_add(1, Ordering::Relaxed);
        self.dir.path().join("downloads").join(format!("file-{n}.bin"))
    }

    /// Queue `data` from `user` under its content id, optionally delivering its tree
    pub async fn queue(&self, data: &[u8], user: UserId, with_tree: bool) -> PathBuf {
        let target = self.target();
        let tree = tree_for(data);

        self.manager
            .add(
                AddRequest::new(&target, data.len() as u64, user, "hub.test:411")
                    .with_content_id(tree.content_id()),
            )
            .await
            .unwrap_or_else(|e| panic!("add: {e}"));

        if with_tree {
            self.manager
                .add_tree(&target, user, tree)
                .await
                .unwrap_or_else(|e| panic!("add_tree: {e}"));
        }
        target
    }

    /// Run one connection from `user`, sending the requested range of
    /// `data` in `chunk` sized pieces
    pub async fn transfer(&self, user: UserId, data: &[u8], chunk: usize) -> Result<Completion> {
        self.transfer_with(user, chunk, |_, range| data[range].to_vec())
            .await
    }

    /// Like [`transfer`](Self::transfer), with the bytes for each requested
    /// range produced by `serve`
    pub async fn transfer_with(
        &self,
        user: UserId,
        chunk: usize,
        serve: impl Fn(&Path, std::ops::Range<usize>) -> Vec<u8>,
    ) -> Result<Completion> {
        let mut download = self
            .manager
            .start_download(&user)
            .await?
            .unwrap_or_else(|| panic!("nothing to download from {user}"));

        let start = download.start() as usize;
        let end = download
            .end()
            .unwrap_or_else(|| panic!("download of unknown size")) as usize;
        let bytes = serve(download.target(), start..end);

        for piece in bytes.chunks(chunk.max(1)) {
            if let Err(e) = self.manager.on_bytes_received(&mut download, piece).await {
                self.manager.on_source_disconnected(download).await;
                return Err(e);
            }
        }
        self.manager.on_transfer_complete(download).await
    }
}

impl Default for QueueFixture {
    fn default() -> Self {
        Self::new()
    }
}
