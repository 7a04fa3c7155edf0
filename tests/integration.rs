//! Integration tests for the `workflow` binary against spec.md §8 scenarios.
//!
//! Each test writes a producer input file, invokes the compiled binary with
//! a status file enabled, waits for it to drain, then inspects the status
//! file and the per-run output files it wrote.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

/// Path to the compiled binary, resolved the way `cargo test` lays out the
/// target directory (test binary sits in `deps/`, the bin one level up).
fn binary() -> PathBuf {
    let mut p = std::env::current_exe().expect("current exe");
    p.pop();
    if p.ends_with("deps") {
        p.pop();
    }
    p.push("workflow");
    if cfg!(windows) {
        p.set_extension("exe");
    }
    p
}

fn write_producer_file(dir: &Path, pipelines: &serde_json::Value) -> PathBuf {
    let path = dir.join("pipelines.json");
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(serde_json::to_string_pretty(pipelines).unwrap().as_bytes())
        .unwrap();
    path
}

fn status_path(dir: &Path) -> PathBuf {
    dir.join("status.json")
}

fn read_status(dir: &Path) -> serde_json::Value {
    let contents = std::fs::read_to_string(status_path(dir)).expect("read status file");
    serde_json::from_str(&contents).expect("status file is valid JSON")
}

fn run_engine(dir: &Path, producer_file: &Path, extra_args: &[&str]) -> std::process::Output {
    Command::new(binary())
        .args([
            "--runner",
            "none",
            "--max-procs",
            "8",
            "--producer",
            "file",
            "--producer-input-file",
        ])
        .arg(producer_file)
        .arg("--status-file")
        .arg(status_path(dir))
        .args(extra_args)
        .output()
        .expect("run workflow binary")
}

fn spawn_engine(dir: &Path, producer_file: &Path) -> Child {
    Command::new(binary())
        .args([
            "--runner",
            "none",
            "--max-procs",
            "8",
            "--producer",
            "file",
            "--producer-input-file",
        ])
        .arg(producer_file)
        .arg("--status-file")
        .arg(status_path(dir))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn workflow binary")
}

#[test]
fn single_short_run_succeeds() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path();
    let pipelines = serde_json::json!([{
        "id": "p1",
        "working_dir": dir,
        "runs": [
            {"name": "echo", "exe": "/bin/echo", "args": ["hello"], "nprocs": 1}
        ]
    }]);
    let producer_file = write_producer_file(dir, &pipelines);

    let output = run_engine(dir, &producer_file, &[]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let returncode = std::fs::read_to_string(dir.join("codar.workflow.return.echo")).unwrap();
    assert_eq!(returncode, "0\n");
    let walltime = std::fs::read_to_string(dir.join("codar.workflow.walltime.echo")).unwrap();
    assert!(walltime.trim().parse::<f64>().is_ok());

    let status = read_status(dir);
    assert_eq!(status["p1"]["phase"], "DONE");
    assert_eq!(status["p1"]["reason"], "SUCCEEDED");
}

#[test]
fn timeout_kills_the_run() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path();
    let pipelines = serde_json::json!([{
        "id": "p-timeout",
        "working_dir": dir,
        "runs": [
            {"name": "sleepy", "exe": "/bin/sleep", "args": ["60"], "nprocs": 1, "timeout": 2}
        ]
    }]);
    let producer_file = write_producer_file(dir, &pipelines);

    let output = run_engine(dir, &producer_file, &[]);
    assert!(output.status.success());

    let status = read_status(dir);
    assert_eq!(status["p-timeout"]["phase"], "DONE");
    assert_eq!(status["p-timeout"]["reason"], "TIMEOUT");

    let returncode = std::fs::read_to_string(dir.join("codar.workflow.return.sleepy")).unwrap();
    assert_ne!(returncode.trim(), "0");
}

#[test]
fn partial_failure_kills_sibling_run() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path();
    let pipelines = serde_json::json!([{
        "id": "p-partial",
        "working_dir": dir,
        "kill_on_partial_failure": true,
        "runs": [
            {"name": "a", "exe": "/bin/false", "args": [], "nprocs": 1},
            {"name": "b", "exe": "/bin/sleep", "args": ["30"], "nprocs": 1}
        ]
    }]);
    let producer_file = write_producer_file(dir, &pipelines);

    let output = run_engine(dir, &producer_file, &[]);
    assert!(output.status.success());

    let status = read_status(dir);
    assert_eq!(status["p-partial"]["phase"], "DONE");
    assert_eq!(status["p-partial"]["reason"], "FAILED");

    assert!(dir.join("codar.workflow.return.a").exists());
    assert!(dir.join("codar.workflow.return.b").exists());
}

#[test]
fn oversized_pipeline_is_recorded_as_nofit() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path();
    let pipelines = serde_json::json!([{
        "id": "p-huge",
        "working_dir": dir,
        "runs": [
            {"name": "huge", "exe": "/bin/true", "args": [], "nprocs": 100}
        ]
    }]);
    let producer_file = write_producer_file(dir, &pipelines);

    let output = run_engine(dir, &producer_file, &[]);
    assert!(output.status.success());

    let status = read_status(dir);
    assert_eq!(status["p-huge"]["phase"], "NOT_STARTED");
    assert_eq!(status["p-huge"]["reason"], "NOFIT");
    assert!(!dir.join("codar.workflow.return.huge").exists());
}

#[test]
fn sigint_transitions_running_pipeline_to_killed() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path();
    let pipelines = serde_json::json!([{
        "id": "p-signal",
        "working_dir": dir,
        "runs": [
            {"name": "long", "exe": "/bin/sleep", "args": ["60"], "nprocs": 1}
        ]
    }]);
    let producer_file = write_producer_file(dir, &pipelines);

    let mut child = spawn_engine(dir, &producer_file);
    std::thread::sleep(Duration::from_millis(500));

    unsafe {
        libc::kill(child.id() as i32, libc::SIGINT);
    }

    let status = child
        .wait_timeout(Duration::from_secs(10))
        .expect("wait for engine to exit after SIGINT");
    assert!(status.success());

    let status = read_status(dir);
    assert_eq!(status["p-signal"]["phase"], "KILLED");
}

/// Minimal `wait_timeout` so this test doesn't depend on an extra crate:
/// polls `try_wait` until it returns an exit status or the deadline passes.
trait WaitTimeoutExt {
    fn wait_timeout(&mut self, timeout: Duration) -> Option<std::process::ExitStatus>;
}

impl WaitTimeoutExt for Child {
    fn wait_timeout(&mut self, timeout: Duration) -> Option<std::process::ExitStatus> {
        let start = std::time::Instant::now();
        loop {
            if let Ok(Some(status)) = self.try_wait() {
                return Some(status);
            }
            if start.elapsed() >= timeout {
                return None;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}
