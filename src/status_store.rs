//! Atomic JSON persistence of per-pipeline state.
//!
//! Grounded in spec.md §9 ("write to a sibling temp file and rename") and
//! the atomic-write idiom used elsewhere in the pack (plain
//! `std::fs::rename`, no extra crate — see `other_examples/..oddjobs..daemon`).
//! Not present in the retrieved `codar.workflow` source (`status.py` was not
//! part of the filtered original-source pack); the JSON shape and
//! rewrite-on-every-change behavior are specified directly in spec.md §6.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};

use crate::schema::{PipelineState, StatusMap};

/// Guards the in-memory view of the status file so concurrent callbacks
/// (run/pipeline completions from different threads) serialize their
/// updates; each update still republishes the whole document atomically.
pub struct StatusStore {
    path: PathBuf,
    states: Mutex<StatusMap>,
}

impl StatusStore {
    /// Open (or create) the status file at `path`, loading any existing
    /// state so a restarted engine invocation doesn't clobber prior runs'
    /// records before it has re-admitted them.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let states = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("read status file {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("parse status file {}", path.display()))?
        } else {
            StatusMap::new()
        };
        Ok(StatusStore {
            path,
            states: Mutex::new(states),
        })
    }

    /// Record `state` and atomically rewrite the whole document: write to a
    /// sibling temp file, then rename over the destination so readers never
    /// observe a partially-written file.
    pub fn set_state(&self, state: PipelineState) -> Result<()> {
        let mut states = self.states.lock().unwrap();
        states.insert(state.id.clone(), state);
        write_atomic(&self.path, &*states)
    }
}

fn write_atomic(path: &Path, states: &StatusMap) -> Result<()> {
    let json = serde_json::to_string_pretty(states).context("serialize status map")?;
    let tmp_path = sibling_temp_path(path);
    std::fs::write(&tmp_path, json)
        .with_context(|| format!("write temp status file {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("rename {} to {}", tmp_path.display(), path.display()))?;
    Ok(())
}

fn sibling_temp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "status".to_string());
    let tmp_name = format!(".{file_name}.tmp.{}", std::process::id());
    match path.parent() {
        Some(parent) => parent.join(tmp_name),
        None => PathBuf::from(tmp_name),
    }
}
