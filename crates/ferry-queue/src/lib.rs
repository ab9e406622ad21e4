//! # FERRY Queue
//!
//! Download queue for the FERRY file-sharing client.
//!
//! The queue owns every requested file, tracks which peers can supply it and
//! why others failed, picks what to fetch next, and feeds incoming bytes
//! through a hash tree so nothing unverified is ever marked finished.
//!
//! # Example
//!
//! ```no_run
//! use ferry_queue::{AddRequest, QueueConfig, QueueManager, UserId};
//! use std::sync::Arc;
//!
//! # async fn run() -> ferry_queue::Result<()> {
//! let manager = Arc::new(QueueManager::new(QueueConfig::default())?);
//! let peer = UserId::from_bytes([7u8; 24]);
//!
//! manager
//!     .add(AddRequest::new("/downloads/file.bin", 4096, peer, "hub.example:411"))
//!     .await?;
//!
//! if let Some(mut download) = manager.start_download(&peer).await? {
//!     manager.on_bytes_received(&mut download, &[0u8; 4096]).await?;
//!     manager.on_transfer_complete(download).await?;
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod download;
pub mod error;
pub mod event;
pub mod item;
pub mod manager;
pub mod priority;
pub mod progress;
pub mod recheck;
pub mod source;
pub mod store;
pub mod trees;

pub use config::QueueConfig;
pub use download::{Completion, Download};
pub use error::{QueueError, Result};
pub use event::{ItemUpdate, QueueEvent};
pub use item::{CompletedBlock, ItemFlags, QueueItem, QueueStatus};
pub use manager::{AddRequest, QueueManager};
pub use priority::Priority;
pub use progress::DownloadProgress;
pub use recheck::RecheckOutcome;
pub use source::{BadSource, Source, SourceFailure, SourceList, UserId};
pub use store::QueueStore;
pub use trees::{MemoryTreeStore, TreeStore};
