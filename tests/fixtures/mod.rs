//! Test fixtures

mod queue;

pub use queue::{QueueFixture, peer, sample_data, tree_for};
