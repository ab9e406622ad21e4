//! Property-based tests for FERRY
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// Hash Tree Properties
// ============================================================================

mod tree_properties {
    use super::*;
    use ferry_files::tree_hash::{compute_merkle_root, compute_tree_hash_from_data, leaf_hash};
    use ferry_files::{HashTree, TreeHashError};

    proptest! {
        /// Feeding the same bytes in any split yields the same tree
        #[test]
        fn chunking_invariance(
            data in prop::collection::vec(any::<u8>(), 0..20_000),
            cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..8),
            block_shift in 0u32..4,
        ) {
            let block_size = 1024u64 << block_shift;
            let expected = compute_tree_hash_from_data(&data, block_size).unwrap();

            let mut points: Vec<usize> = cuts.iter().map(|i| i.index(data.len() + 1)).collect();
            points.sort_unstable();

            let mut tree = HashTree::new(block_size).unwrap();
            let mut last = 0;
            for point in points {
                tree.update(&data[last..point]).unwrap();
                last = point;
            }
            tree.update(&data[last..]).unwrap();
            let actual = tree.into_tree_hash();

            prop_assert_eq!(actual.root, expected.root);
            prop_assert_eq!(actual.leaves, expected.leaves);
        }

        /// Finalizing twice returns the same root and seals the tree
        #[test]
        fn finalize_idempotent(data in prop::collection::vec(any::<u8>(), 0..5000)) {
            let mut tree = HashTree::new(1024).unwrap();
            tree.update(&data).unwrap();
            let first = tree.finalize();
            prop_assert_eq!(tree.finalize(), first);
            prop_assert_eq!(tree.update(b"more"), Err(TreeHashError::Sealed));
        }

        /// A file within one block has its leaf hash as root
        #[test]
        fn single_block_root_is_leaf(data in prop::collection::vec(any::<u8>(), 0..1024)) {
            let tree = compute_tree_hash_from_data(&data, 1024).unwrap();
            prop_assert_eq!(tree.leaf_count(), 1);
            prop_assert_eq!(tree.root, leaf_hash(&data));
        }

        /// Stored leaves always reproduce the stored root
        #[test]
        fn leaves_reproduce_root(data in prop::collection::vec(any::<u8>(), 0..10_000)) {
            let tree = compute_tree_hash_from_data(&data, 1024).unwrap();
            prop_assert_eq!(compute_merkle_root(&tree.leaves), tree.root);
            prop_assert!(tree.validate());
        }

        /// Any single flipped byte fails its block's leaf check
        #[test]
        fn flipped_byte_detected(
            data in prop::collection::vec(any::<u8>(), 1..4096),
            index in any::<prop::sample::Index>(),
            mask in 1u8..=255,
        ) {
            let tree = compute_tree_hash_from_data(&data, 1024).unwrap();
            let pos = index.index(data.len());
            let block = pos / 1024;

            let mut corrupt = data[block * 1024..((block + 1) * 1024).min(data.len())].to_vec();
            corrupt[pos % 1024] ^= mask;
            prop_assert!(!tree.verify_leaf(block as u64, &corrupt));
        }
    }
}

// ============================================================================
// Block Layout Properties
// ============================================================================

mod layout_properties {
    use super::*;
    use ferry_files::BlockLayout;
    use ferry_files::tree_hash::{DEFAULT_MAX_LEVELS, MIN_BLOCK_SIZE, choose_block_size};

    proptest! {
        /// Block sizes are powers of two at or above the floor
        #[test]
        fn block_size_power_of_two(size in any::<u64>(), levels in 1u32..=32) {
            let block_size = choose_block_size(size, levels);
            prop_assert!(block_size.is_power_of_two());
            prop_assert!(block_size >= MIN_BLOCK_SIZE);
            prop_assert_eq!(block_size, choose_block_size(size, levels));
        }

        /// Larger files never get smaller blocks
        #[test]
        fn block_size_monotonic(a in any::<u64>(), b in any::<u64>()) {
            let (small, large) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(
                choose_block_size(small, DEFAULT_MAX_LEVELS)
                    <= choose_block_size(large, DEFAULT_MAX_LEVELS)
            );
        }

        /// The leaf count stays within the level limit
        #[test]
        fn block_count_bounded(size in 0u64..(1u64 << 50)) {
            let layout = BlockLayout::for_file_size(size);
            prop_assert!(layout.block_count() <= 1u64 << (DEFAULT_MAX_LEVELS - 1));
        }

        /// Block ranges tile the file without gaps
        #[test]
        fn block_ranges_tile_file(size in 1u64..(64 << 20)) {
            let layout = BlockLayout::for_file_size(size);
            let mut next = 0;
            for index in 0..layout.block_count() {
                let range = layout.block_range(index);
                prop_assert_eq!(range.start, next);
                prop_assert!(range.end > range.start);
                prop_assert_eq!(layout.block_index(range.start), index);
                next = range.end;
            }
            prop_assert_eq!(next, size);
            prop_assert!(layout.is_last(layout.block_count() - 1));
        }
    }
}

// ============================================================================
// Queue Model Properties
// ============================================================================

mod queue_properties {
    use super::*;
    use ferry_files::ContentId;
    use ferry_queue::{Priority, SourceFailure, SourceList, UserId};

    proptest! {
        /// Priority steps clamp at both ends
        #[test]
        fn priority_clamping(steps in prop::collection::vec(any::<bool>(), 0..40)) {
            let mut priority = Priority::Normal;
            for up in steps {
                priority = if up { priority.increment() } else { priority.decrement() };
                prop_assert!(Priority::ALL.contains(&priority));
            }
            prop_assert_eq!(Priority::Highest.increment(), Priority::Highest);
            prop_assert_eq!(Priority::Paused.decrement(), Priority::Paused);
        }

        /// A user sits in at most one list, once
        #[test]
        fn source_in_one_list(ops in prop::collection::vec((0u8..4, 0u8..4), 0..50)) {
            let mut sources = SourceList::new();
            for (op, n) in ops {
                let user = UserId::from_bytes([n; 24]);
                match op {
                    0 => { let _ = sources.add(user, "hub"); }
                    1 => { sources.report_failure(&user, SourceFailure::ChecksumMismatch); }
                    2 => { sources.remove(&user, None); }
                    _ => { sources.readd(Some(&user)); }
                }

                for n in 0..4u8 {
                    let user = UserId::from_bytes([n; 24]);
                    let good = sources.good().iter().filter(|s| s.user == user).count();
                    let bad = sources.bad().iter().filter(|s| s.user == user).count();
                    prop_assert!(good + bad <= 1);
                }
            }
        }

        /// Content ids parse back from base-32 in any case
        #[test]
        fn content_id_case_insensitive(bytes in any::<[u8; 32]>()) {
            let id = ContentId::from_bytes(bytes);
            let text = id.to_base32();
            prop_assert!(!text.contains('='));
            prop_assert_eq!(text.to_lowercase().parse::<ContentId>().unwrap(), id);
        }
    }
}
