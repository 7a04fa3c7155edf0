//! File producer: reads one JSON array document of pipeline descriptions and
//! feeds them to the consumer in file order.
//!
//! Grounded in `codar.workflow.consumer`'s driving script (`main()` reading a
//! single JSON document rather than JSON Lines, per spec.md §6) and
//! `codar.workflow.model.Pipeline.from_data`/`Run.from_data` for how a
//! description is turned into live `Pipeline`/`Run` objects. Malformed
//! entries are logged and skipped rather than aborting the whole file, per
//! spec.md §7.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::warn;

use crate::consumer::PipelineRunner;
use crate::pipeline::Pipeline;
use crate::run::{self, Run, RETURN_NAME, STDERR_NAME, STDOUT_NAME, WALLTIME_NAME};
use crate::schema::{PipelineDescription, RunDescription};

/// Read `path` as a JSON array of pipeline descriptions and admit each into
/// `runner`, in file order, from the calling thread.
pub fn run_file_producer(path: &Path, runner: &Arc<PipelineRunner>) -> Result<()> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("read producer input file {}", path.display()))?;
    let entries: Vec<serde_json::Value> = serde_json::from_str(&contents)
        .with_context(|| format!("parse producer input file {}", path.display()))?;

    for (index, entry) in entries.into_iter().enumerate() {
        let pipeline = match build_pipeline(entry) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                warn!(index, error = %e, "skipping malformed pipeline description");
                continue;
            }
        };
        let id = pipeline.id.clone();
        if let Err(e) = runner.add_pipeline(pipeline) {
            warn!(pipeline = %id, error = %e, "pipeline not admitted");
        }
    }
    Ok(())
}

fn build_pipeline(value: serde_json::Value) -> Result<Arc<Pipeline>> {
    let desc: PipelineDescription =
        serde_json::from_value(value).context("malformed pipeline description")?;

    let working_dir = PathBuf::from(&desc.working_dir);
    let mut seen_names = std::collections::HashSet::new();
    let mut runs = Vec::with_capacity(desc.runs.len());
    for run_desc in desc.runs {
        if !seen_names.insert(run_desc.name.clone()) {
            anyhow::bail!("duplicate run name '{}' within pipeline", run_desc.name);
        }
        runs.push(build_run(&working_dir, run_desc));
    }

    Ok(Arc::new(Pipeline::new(
        desc.id.to_string(),
        working_dir,
        runs,
        desc.kill_on_partial_failure,
        desc.post_process_script,
        desc.post_process_args,
        desc.post_process_stop_on_failure,
        desc.node_layout,
    )))
}

fn build_run(pipeline_dir: &Path, desc: RunDescription) -> Arc<Run> {
    let run_dir = resolve_dir(pipeline_dir, desc.working_dir.as_deref());

    let stdout_path = run::resolve_output_path(&run_dir, STDOUT_NAME, &desc.name, desc.stdout_path.as_deref());
    let stderr_path = run::resolve_output_path(&run_dir, STDERR_NAME, &desc.name, desc.stderr_path.as_deref());
    let return_path = run::resolve_output_path(&run_dir, RETURN_NAME, &desc.name, desc.return_path.as_deref());
    let walltime_path =
        run::resolve_output_path(&run_dir, WALLTIME_NAME, &desc.name, desc.walltime_path.as_deref());

    Arc::new(Run::new(
        desc.name,
        desc.exe,
        desc.args,
        desc.env,
        run_dir,
        desc.timeout.map(Duration::from_secs_f64),
        desc.nprocs,
        stdout_path,
        stderr_path,
        return_path,
        walltime_path,
        desc.sleep_after.map(Duration::from_secs_f64),
    ))
}

fn resolve_dir(pipeline_dir: &Path, override_dir: Option<&str>) -> PathBuf {
    match override_dir {
        Some(p) => {
            let p = Path::new(p);
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                pipeline_dir.join(p)
            }
        }
        None => pipeline_dir.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn build_pipeline_rejects_duplicate_run_names() {
        let value = serde_json::json!({
            "id": "p1",
            "working_dir": "/tmp",
            "runs": [
                {"name": "a", "exe": "/bin/true", "args": []},
                {"name": "a", "exe": "/bin/true", "args": []}
            ]
        });
        let result = build_pipeline(value);
        assert!(result.is_err());
    }

    #[test]
    fn build_pipeline_coerces_numeric_id_and_defaults() {
        let value = serde_json::json!({
            "id": 42,
            "working_dir": "/tmp",
            "runs": [
                {"name": "a", "exe": "/bin/true", "args": []}
            ]
        });
        let pipeline = build_pipeline(value).unwrap();
        assert_eq!(pipeline.id, "42");
        assert_eq!(pipeline.runs.len(), 1);
        assert_eq!(pipeline.runs[0].nprocs, 1);
    }

    #[test]
    fn build_run_resolves_relative_working_dir_under_pipeline_dir() {
        let run = build_run(
            Path::new("/pipeline/dir"),
            RunDescription {
                name: "a".into(),
                exe: "/bin/true".into(),
                args: vec![],
                env: HashMap::new(),
                working_dir: Some("sub".into()),
                timeout: None,
                nprocs: 1,
                stdout_path: None,
                stderr_path: None,
                return_path: None,
                walltime_path: None,
                sleep_after: None,
            },
        );
        assert_eq!(run.working_dir, PathBuf::from("/pipeline/dir/sub"));
        assert_eq!(
            run.stdout_path,
            PathBuf::from("/pipeline/dir/sub/codar.workflow.stdout.a")
        );
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let value = serde_json::json!({
            "id": "p1",
            "working_dir": "/tmp",
            "runs": [
                {"name": "a", "args": []}
            ]
        });
        let result = build_pipeline(value);
        assert!(result.is_err());
    }
}
