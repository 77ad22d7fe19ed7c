//! Fixture locations and scratch directories.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// Fixture directory of the core crate, relative to the workspace root.
pub const FIXTURE_DIR: &str = "crates/wasmhost-core/tests/fixtures";

/// The counter contract, written directly against the `WasmLib` imports.
pub fn counter_contract() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join(FIXTURE_DIR)
        .join("counter.wat")
}

/// A state file holding `counter = value` as an `Int64`.
pub fn counter_state(dir: &TestDir, value: i64) -> PathBuf {
    let path = dir.path("state.json");
    let json = serde_json::json!({
        "counter": wasmhost_types::encoding::base64_encode(&value.to_le_bytes()),
    });
    std::fs::write(&path, json.to_string()).expect("write state fixture");
    path
}

/// Temporary directory removed on drop.
pub struct TestDir {
    dir: TempDir,
}

impl TestDir {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("create temp dir"),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}
