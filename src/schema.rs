//! Shared JSON types: the producer input document, the status-file shape,
//! and the per-pipeline/run description structs. These are the only
//! structures that cross a process boundary (producer file on disk, status
//! file on disk), so their `Deserialize`/`Serialize` impls are the wire
//! contract.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One element of the producer input document (spec.md §6).
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineDescription {
    /// Coerced to string at load time; see `Id`.
    pub id: Id,
    pub working_dir: String,
    pub runs: Vec<RunDescription>,
    #[serde(default)]
    pub kill_on_partial_failure: bool,
    #[serde(default)]
    pub post_process_script: Option<String>,
    #[serde(default)]
    pub post_process_args: Vec<String>,
    #[serde(default)]
    pub post_process_stop_on_failure: bool,
    #[serde(default)]
    pub node_layout: Option<Vec<HashMap<String, u32>>>,
}

/// Pipeline/run ids may arrive as JSON strings or numbers; both coerce to
/// `String`, the way `Pipeline.from_data` does (`pipe_id = str(data["id"])`).
#[derive(Debug, Clone)]
pub struct Id(pub String);

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        let s = match value {
            serde_json::Value::String(s) => s,
            serde_json::Value::Number(n) => n.to_string(),
            other => {
                return Err(serde::de::Error::custom(format!(
                    "pipeline id must be a string or number, got {other}"
                )));
            }
        };
        Ok(Id(s))
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunDescription {
    pub name: String,
    pub exe: String,
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default = "default_nprocs")]
    pub nprocs: u32,
    #[serde(default)]
    pub stdout_path: Option<String>,
    #[serde(default)]
    pub stderr_path: Option<String>,
    #[serde(default)]
    pub return_path: Option<String>,
    #[serde(default)]
    pub walltime_path: Option<String>,
    #[serde(default)]
    pub sleep_after: Option<f64>,
}

fn default_nprocs() -> u32 {
    1
}

/// Lifecycle phase of a pipeline, per spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    NotStarted,
    Running,
    Done,
    Killed,
}

/// Terminal reason, per spec.md §3 and §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    Succeeded,
    Failed,
    Timeout,
    Exception,
    Nofit,
}

impl Reason {
    /// Priority order used by `get_state()` when more than one run has a
    /// non-SUCCEEDED reason: EXCEPTION > TIMEOUT > FAILED > SUCCEEDED.
    fn rank(self) -> u8 {
        match self {
            Reason::Exception => 3,
            Reason::Timeout => 2,
            Reason::Failed => 1,
            Reason::Succeeded => 0,
            Reason::Nofit => 4,
        }
    }

    /// Combine reasons observed across a pipeline's runs, keeping the
    /// highest-priority one.
    pub fn combine(self, other: Reason) -> Reason {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

/// Persisted per-pipeline record in the status file.
///
/// `reason` and `return_codes` are only populated once `phase` is no longer
/// `NotStarted`/`Running` (NOFIT is the one exception: it is attached at
/// `NotStarted`, since a no-fit pipeline never starts).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub id: String,
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_codes: Option<HashMap<String, Option<i32>>>,
}

impl PipelineState {
    pub fn not_started(id: impl Into<String>) -> Self {
        PipelineState {
            id: id.into(),
            phase: Phase::NotStarted,
            reason: None,
            return_codes: None,
        }
    }

    pub fn nofit(id: impl Into<String>) -> Self {
        PipelineState {
            id: id.into(),
            phase: Phase::NotStarted,
            reason: Some(Reason::Nofit),
            return_codes: None,
        }
    }

    pub fn running(id: impl Into<String>) -> Self {
        PipelineState {
            id: id.into(),
            phase: Phase::Running,
            reason: None,
            return_codes: None,
        }
    }

    pub fn killed(id: impl Into<String>) -> Self {
        PipelineState {
            id: id.into(),
            phase: Phase::Killed,
            reason: None,
            return_codes: None,
        }
    }

    pub fn done(
        id: impl Into<String>,
        reason: Reason,
        return_codes: HashMap<String, Option<i32>>,
    ) -> Self {
        PipelineState {
            id: id.into(),
            phase: Phase::Done,
            reason: Some(reason),
            return_codes: Some(return_codes),
        }
    }
}

/// The status file as a whole: a map keyed by pipeline id, written atomically
/// by `status_store.rs`.
pub type StatusMap = HashMap<String, PipelineState>;
