//! Shared fixtures for FERRY integration tests.

pub mod fixtures;
