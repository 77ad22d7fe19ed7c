#![allow(dead_code)]
//! Shared test utilities for integration tests.
//!
//! # Modules
//!
//! - `fixtures`: paths to the WAT contracts shared with `wasmhost-core`
//! - `assertions`: assertion helpers with descriptive failure messages

pub mod assertions;
pub mod fixtures;

pub use assertions::{assert_error_contains, assert_ok};
pub use fixtures::{counter_contract, counter_state, TestDir};
