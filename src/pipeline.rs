//! Sequences starts of a pipeline's runs, aggregates their terminations,
//! applies kill-on-partial-failure, spawns the post-process step, and
//! derives the aggregated lifecycle state.
//!
//! Grounded in `codar.workflow.model.Pipeline`: the same `active_runs`
//! bookkeeping under a state lock, the same starter-thread/`sleep_after`
//! sequencing, the same `force_kill_all` join-before-kill ordering to
//! race-proof the active set, and the same reason-priority `get_state`
//! derivation (EXCEPTION > TIMEOUT > FAILED > SUCCEEDED).

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::warn;

use crate::error::WorkflowError;
use crate::launcher::Launcher;
use crate::node_layout::NodeLayout;
use crate::run::{Run, resolve_output_path};
use crate::schema::{PipelineState, Reason};

pub type RunCallback = Arc<dyn Fn(&Arc<Run>) + Send + Sync>;
pub type PipelineCallback = Arc<dyn Fn(&Arc<Pipeline>) + Send + Sync>;

const STDOUT_NAME: &str = "codar.workflow.stdout";
const STDERR_NAME: &str = "codar.workflow.stderr";
const RETURN_NAME: &str = "codar.workflow.return";
const WALLTIME_NAME: &str = "codar.workflow.walltime";
const POST_PROCESS_NAME: &str = "post-process";

struct PipelineInternalState {
    running: bool,
    force_killed: bool,
    active_runs: HashSet<String>,
}

pub struct Pipeline {
    pub id: String,
    pub working_dir: PathBuf,
    pub runs: Vec<Arc<Run>>,
    pub kill_on_partial_failure: bool,
    pub post_process_script: Option<String>,
    pub post_process_args: Vec<String>,
    pub post_process_stop_on_failure: bool,
    pub node_layout: Option<Vec<HashMap<String, u32>>>,

    total_nodes: Mutex<Option<u32>>,
    state: Mutex<PipelineInternalState>,
    done_callbacks: Mutex<Vec<PipelineCallback>>,
    fatal_callbacks: Mutex<Vec<PipelineCallback>>,
    starter_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    post_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Pipeline {
    pub fn new(
        id: impl Into<String>,
        working_dir: PathBuf,
        runs: Vec<Arc<Run>>,
        kill_on_partial_failure: bool,
        post_process_script: Option<String>,
        post_process_args: Vec<String>,
        post_process_stop_on_failure: bool,
        node_layout: Option<Vec<HashMap<String, u32>>>,
    ) -> Self {
        Pipeline {
            id: id.into(),
            working_dir,
            runs,
            kill_on_partial_failure,
            post_process_script,
            post_process_args,
            post_process_stop_on_failure,
            node_layout,
            total_nodes: Mutex::new(None),
            state: Mutex::new(PipelineInternalState {
                running: false,
                force_killed: false,
                active_runs: HashSet::new(),
            }),
            done_callbacks: Mutex::new(Vec::new()),
            fatal_callbacks: Mutex::new(Vec::new()),
            starter_thread: Mutex::new(None),
            post_thread: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub fn new_for_test(id: &str, working_dir: PathBuf) -> Self {
        Pipeline::new(id, working_dir, vec![], false, None, vec![], false, None)
    }

    #[cfg(test)]
    pub fn set_total_nodes_for_test(&self, nodes: u32) {
        *self.total_nodes.lock().unwrap() = Some(nodes);
    }

    pub fn add_done_callback(&self, cb: PipelineCallback) {
        self.done_callbacks.lock().unwrap().push(cb);
    }

    pub fn add_fatal_callback(&self, cb: PipelineCallback) {
        self.fatal_callbacks.lock().unwrap().push(cb);
    }

    fn fire_done_callbacks(self: &Arc<Self>) {
        let cbs = self.done_callbacks.lock().unwrap().clone();
        for cb in cbs {
            cb(self);
        }
    }

    fn fire_fatal_callbacks(self: &Arc<Self>) {
        let cbs = self.fatal_callbacks.lock().unwrap().clone();
        for cb in cbs {
            cb(self);
        }
    }

    /// Resolve the node layout (explicit or default full-occupancy) and set
    /// each run's `tasks_per_node`/`nodes`, accumulating `total_nodes`.
    /// Must be called before `get_nodes_used()`. A producer-supplied layout
    /// that omits a run or shares a node between runs is a malformed
    /// description, not a crash: it is rejected so the caller can skip this
    /// pipeline without taking the whole engine down.
    pub fn set_ppn(&self, ppn: u32) -> Result<(), WorkflowError> {
        let layout = match &self.node_layout {
            Some(explicit) => NodeLayout::from_explicit(explicit.clone()),
            None => {
                let names: Vec<String> = self.runs.iter().map(|r| r.name.clone()).collect();
                NodeLayout::default_no_share_layout(ppn, &names)
            }
        };

        let mut total = 0u32;
        for run in &self.runs {
            let node = layout.get_node_containing_code(&run.name).ok_or_else(|| {
                WorkflowError::MalformedDescription(format!(
                    "run '{}' is not hosted on exactly one node",
                    run.name
                ))
            })?;
            if node.len() != 1 {
                return Err(WorkflowError::MalformedDescription(format!(
                    "node hosting run '{}' is shared with another run",
                    run.name
                )));
            }
            let tasks = node[&run.name];
            let tasks_per_node = tasks.min(run.nprocs);
            let nodes = run.nprocs.div_ceil(tasks_per_node);
            run.set_layout(tasks_per_node, nodes);
            total += nodes;
        }
        *self.total_nodes.lock().unwrap() = Some(total);
        Ok(())
    }

    /// Requires `set_ppn` to have been called.
    pub fn get_nodes_used(&self) -> u32 {
        self.total_nodes
            .lock()
            .unwrap()
            .expect("set_ppn must be called before getting node usage")
    }

    /// Register consumer/self callbacks on every run, mark running, then
    /// start the runs in a dedicated thread (in declaration order,
    /// separated by each run's `sleep_after`) so callers never block.
    pub fn start(self: &Arc<Self>, launcher: Launcher, run_finished_external: RunCallback) {
        {
            let mut st = self.state.lock().unwrap();
            for run in &self.runs {
                run.set_launcher(launcher.clone());
                run.add_callback(Arc::clone(&run_finished_external));
                let pipeline = Arc::clone(self);
                run.add_callback(Arc::new(move |r: &Arc<Run>| pipeline.run_finished(r)));
                st.active_runs.insert(run.name.clone());
            }
            st.running = true;
        }

        let pipeline = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("pipeline-{}-starter", self.id))
            .spawn(move || pipeline.start_runs_sequentially())
            .expect("spawn pipeline starter thread");
        *self.starter_thread.lock().unwrap() = Some(handle);
    }

    fn start_runs_sequentially(self: Arc<Self>) {
        for run in &self.runs {
            run.start();
            if let Some(sleep_after) = run.sleep_after {
                std::thread::sleep(sleep_after);
            }
        }
    }

    fn run_finished(self: &Arc<Self>, run: &Arc<Run>) {
        let mut fire_done = false;
        let mut to_kill: Vec<Arc<Run>> = Vec::new();
        let mut spawn_post_process = false;
        {
            let mut st = self.state.lock().unwrap();
            st.active_runs.remove(&run.name);
            if st.active_runs.is_empty() {
                spawn_post_process = !st.force_killed;
                fire_done = true;
            } else if self.kill_on_partial_failure && !run.succeeded().unwrap_or(false) {
                warn!(pipeline = %self.id, run = %run.name, "run failed, killing remaining");
                to_kill = self
                    .runs
                    .iter()
                    .filter(|r| st.active_runs.contains(&r.name))
                    .cloned()
                    .collect();
            }
        }

        for r in &to_kill {
            r.kill();
        }
        if spawn_post_process {
            self.run_post_process_script();
        }
        // Must run without the state lock held: callbacks may call
        // get_state() or other locking methods on this pipeline.
        if fire_done {
            self.fire_done_callbacks();
        }
    }

    fn run_post_process_script(self: &Arc<Self>) {
        let Some(script) = self.post_process_script.clone() else {
            return;
        };
        let pipeline = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("pipeline-{}-post-process", self.id))
            .spawn(move || pipeline.post_process_thread(script))
            .expect("spawn post-process thread");
        *self.post_thread.lock().unwrap() = Some(handle);
    }

    fn post_process_thread(self: Arc<Self>, script: String) {
        let stdout_path = resolve_output_path(&self.working_dir, STDOUT_NAME, POST_PROCESS_NAME, None);
        let stderr_path = resolve_output_path(&self.working_dir, STDERR_NAME, POST_PROCESS_NAME, None);
        let return_path = resolve_output_path(&self.working_dir, RETURN_NAME, POST_PROCESS_NAME, None);
        let walltime_path =
            resolve_output_path(&self.working_dir, WALLTIME_NAME, POST_PROCESS_NAME, None);

        let start_time = Instant::now();
        let result = (|| -> std::io::Result<Option<i32>> {
            let out = std::fs::File::create(&stdout_path)?;
            let err = std::fs::File::create(&stderr_path)?;
            let status = std::process::Command::new(&script)
                .args(&self.post_process_args)
                .current_dir(&self.working_dir)
                .stdout(out)
                .stderr(err)
                .status()?;
            Ok(status.code())
        })();
        let elapsed = start_time.elapsed();

        let rval = match &result {
            Ok(code) => *code,
            Err(e) => {
                warn!(pipeline = %self.id, error = %e, "failed to run post process script");
                None
            }
        };

        if let Ok(mut f) = std::fs::File::create(&return_path) {
            use std::io::Write;
            let _ = match rval {
                Some(code) => writeln!(f, "{code}"),
                None => writeln!(f, "None"),
            };
        }
        if let Ok(mut f) = std::fs::File::create(&walltime_path) {
            use std::io::Write;
            let _ = writeln!(f, "{}", elapsed.as_secs_f64());
        }

        if rval != Some(0) && self.post_process_stop_on_failure {
            self.fire_fatal_callbacks();
        }
    }

    /// Derive the current lifecycle state under the pipeline's lock.
    pub fn get_state(&self) -> PipelineState {
        let st = self.state.lock().unwrap();
        if !st.running {
            return PipelineState::not_started(self.id.clone());
        }
        if st.force_killed {
            return PipelineState::killed(self.id.clone());
        }
        if !st.active_runs.is_empty() {
            return PipelineState::running(self.id.clone());
        }

        let mut return_codes = HashMap::new();
        let mut reason = Reason::Succeeded;
        for run in &self.runs {
            return_codes.insert(run.name.clone(), run.returncode());
            let run_reason = if run.exception() {
                Reason::Exception
            } else if run.timed_out().unwrap_or(false) {
                Reason::Timeout
            } else if run.returncode() != Some(0) {
                Reason::Failed
            } else {
                Reason::Succeeded
            };
            reason = reason.combine(run_reason);
        }
        PipelineState::done(self.id.clone(), reason, return_codes)
    }

    /// Kill all active runs and skip post-processing. Joins the starter
    /// thread first so the active set is guaranteed fully populated before
    /// deciding whether anything needs killing (races otherwise: the
    /// starter thread might not have called `run.start()` on every run
    /// yet).
    pub fn force_kill_all(self: &Arc<Self>) {
        self.join_starter();
        let to_kill: Vec<Arc<Run>> = {
            let mut st = self.state.lock().unwrap();
            if st.active_runs.is_empty() {
                return;
            }
            st.force_killed = true;
            self.runs
                .iter()
                .filter(|r| st.active_runs.contains(&r.name))
                .cloned()
                .collect()
        };
        for r in &to_kill {
            r.kill();
        }
    }

    fn join_starter(&self) {
        if let Some(handle) = self.starter_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Join the starter thread, every run, then the post-process thread if
    /// one was launched.
    pub fn join_all(&self) {
        self.join_starter();
        for run in &self.runs {
            run.join();
        }
        if let Some(handle) = self.post_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn make_run(name: &str, exe: &str, args: Vec<String>, dir: &std::path::Path) -> Arc<Run> {
        Arc::new(Run::new(
            name,
            exe,
            args,
            Map::new(),
            dir.to_path_buf(),
            None,
            1,
            dir.join(format!("stdout.{name}")),
            dir.join(format!("stderr.{name}")),
            dir.join(format!("return.{name}")),
            dir.join(format!("walltime.{name}")),
            None,
        ))
    }

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "codar-pipeline-test-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn single_successful_run_reports_succeeded() {
        let dir = tempdir();
        let run = make_run("a", "/bin/true", vec![], &dir);
        let pipeline = Arc::new(Pipeline::new(
            "p1",
            dir.clone(),
            vec![run],
            false,
            None,
            vec![],
            false,
            None,
        ));
        pipeline.set_ppn(1).unwrap();

        let noop: RunCallback = Arc::new(|_r: &Arc<Run>| {});
        pipeline.start(Launcher::None, noop);
        pipeline.join_all();

        let state = pipeline.get_state();
        assert_eq!(state.reason, Some(Reason::Succeeded));
    }

    #[test]
    fn partial_failure_cascade_kills_sibling() {
        let dir = tempdir();
        let a = make_run("a", "/bin/false", vec![], &dir);
        let b = make_run(
            "b",
            "/bin/sh",
            vec!["-c".into(), "sleep 30".into()],
            &dir,
        );
        let pipeline = Arc::new(Pipeline::new(
            "p2",
            dir.clone(),
            vec![a, b],
            true,
            None,
            vec![],
            false,
            None,
        ));
        pipeline.set_ppn(1).unwrap();

        let finished_count = Arc::new(AtomicUsize::new(0));
        let fc = Arc::clone(&finished_count);
        let cb: RunCallback = Arc::new(move |_r: &Arc<Run>| {
            fc.fetch_add(1, Ordering::SeqCst);
        });
        pipeline.start(Launcher::None, cb);
        pipeline.join_all();

        assert_eq!(finished_count.load(Ordering::SeqCst), 2);
        let state = pipeline.get_state();
        assert_eq!(state.reason, Some(Reason::Failed));
    }
}
