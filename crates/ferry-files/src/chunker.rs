//! Block layout of a file.

use crate::tree_hash::{DEFAULT_MAX_LEVELS, choose_block_size};
use std::ops::Range;

/// Fixed-size blocks covering a file of known size
///
/// Every block is `block_size` bytes except possibly the last one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    file_size: u64,
    block_size: u64,
}

impl BlockLayout {
    /// Layout with the block size chosen for `file_size`
    #[must_use]
    pub fn for_file_size(file_size: u64) -> Self {
        Self::with_block_size(file_size, choose_block_size(file_size, DEFAULT_MAX_LEVELS))
    }

    /// Layout with an explicit block size
    ///
    /// A zero block size is bumped to one byte.
    #[must_use]
    pub fn with_block_size(file_size: u64, block_size: u64) -> Self {
        Self {
            file_size,
            block_size: block_size.max(1),
        }
    }

    /// Get file size
    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Get block size
    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Calculate number of blocks (an empty file still has one)
    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.file_size.div_ceil(self.block_size).max(1)
    }

    /// Block containing byte `offset`
    #[must_use]
    pub fn block_index(&self, offset: u64) -> u64 {
        offset / self.block_size
    }

    /// Byte range of block `index`, clipped to the file end
    #[must_use]
    pub fn block_range(&self, index: u64) -> Range<u64> {
        let start = index.saturating_mul(self.block_size).min(self.file_size);
        let end = start.saturating_add(self.block_size).min(self.file_size);
        start..end
    }

    /// Round `offset` down to a block boundary
    #[must_use]
    pub fn align_down(&self, offset: u64) -> u64 {
        offset - offset % self.block_size
    }

    /// Whether `index` is the final block
    #[must_use]
    pub fn is_last(&self, index: u64) -> bool {
        index + 1 == self.block_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_count() {
        let layout = BlockLayout::with_block_size(1000, 256);
        assert_eq!(layout.block_count(), 4);
        assert_eq!(BlockLayout::with_block_size(1024, 256).block_count(), 4);
        assert_eq!(BlockLayout::with_block_size(0, 256).block_count(), 1);
    }

    #[test]
    fn test_last_block_is_short() {
        let layout = BlockLayout::with_block_size(1000, 256);
        assert_eq!(layout.block_range(0), 0..256);
        assert_eq!(layout.block_range(3), 768..1000);
        assert!(layout.is_last(3));
        assert!(!layout.is_last(2));
        assert_eq!(layout.block_range(9), 1000..1000);
    }

    #[test]
    fn test_align_down() {
        let layout = BlockLayout::with_block_size(10_000, 1024);
        assert_eq!(layout.align_down(0), 0);
        assert_eq!(layout.align_down(1023), 0);
        assert_eq!(layout.align_down(1024), 1024);
        assert_eq!(layout.align_down(5000), 4096);
        assert_eq!(layout.block_index(5000), 4);
    }
}
