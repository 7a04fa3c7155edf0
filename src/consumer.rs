//! Main scheduling loop: admits pipelines, blocks until nodes free, dispatches
//! to pipeline supervisors, and handles global stop/kill.
//!
//! Grounded in `codar.workflow.consumer.PipelineRunner`: the same admission
//! checks in `add_pipeline` (closed-for-new, duplicate id, no-fit), the same
//! per-run node reclamation in `run_finished`, the same ADIOS-scan-then-
//! persist in `pipeline_finished`, and the same `run_pipelines` loop shape.
//! Collapses the original's two condition variables (`job_list_cv`,
//! `free_cv`) into one guarding a single `Scheduler` struct: both always need
//! to be read together to decide whether anything can be popped, so a single
//! lock removes a lock-ordering hazard without changing observable behavior.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex};

use tracing::{error, warn};

use crate::adios;
use crate::error::WorkflowError;
use crate::job_list::JobList;
use crate::launcher::Launcher;
use crate::pipeline::{Pipeline, PipelineCallback, RunCallback};
use crate::run::Run;
use crate::schema::PipelineState;
use crate::status_store::StatusStore;

struct Scheduler {
    job_list: JobList,
    free_nodes: u32,
}

struct ConsumerState {
    running: HashMap<String, Arc<Pipeline>>,
    known_ids: HashSet<String>,
    process_pipelines: bool,
    allow_new_pipelines: bool,
    killed: bool,
}

pub struct PipelineRunner {
    launcher: Launcher,
    max_nodes: u32,
    ppn: u32,
    status_store: Option<Arc<StatusStore>>,

    scheduler: Mutex<Scheduler>,
    scheduler_cv: Condvar,
    state: Mutex<ConsumerState>,
}

impl PipelineRunner {
    pub fn new(
        launcher: Launcher,
        max_nodes: u32,
        ppn: u32,
        status_store: Option<Arc<StatusStore>>,
    ) -> Self {
        PipelineRunner {
            launcher,
            max_nodes,
            ppn,
            status_store,
            scheduler: Mutex::new(Scheduler {
                job_list: JobList::new(),
                free_nodes: max_nodes,
            }),
            scheduler_cv: Condvar::new(),
            state: Mutex::new(ConsumerState {
                running: HashMap::new(),
                known_ids: HashSet::new(),
                process_pipelines: true,
                allow_new_pipelines: true,
                killed: false,
            }),
        }
    }

    fn allow_new_pipelines(&self) -> bool {
        self.state.lock().unwrap().allow_new_pipelines
    }

    fn process_pipelines(&self) -> bool {
        self.state.lock().unwrap().process_pipelines
    }

    fn persist(&self, state: PipelineState) {
        if let Some(store) = &self.status_store
            && let Err(e) = store.set_state(state)
        {
            error!(error = %e, "failed to persist status file");
        }
    }

    /// Called by the producer thread. Rejects new pipelines once `stop()` or
    /// `kill_all()` has run, rejects a duplicate id, admits `set_ppn`-derived
    /// node cost against `max_nodes`, persisting `NOFIT` and discarding it if
    /// it exceeds the budget, otherwise enqueues it for scheduling.
    pub fn add_pipeline(&self, pipeline: Arc<Pipeline>) -> Result<(), WorkflowError> {
        {
            let mut st = self.state.lock().unwrap();
            if !st.allow_new_pipelines {
                return Err(WorkflowError::PipelinesClosed);
            }
            if !st.known_ids.insert(pipeline.id.clone()) {
                return Err(WorkflowError::DuplicatePipelineId(pipeline.id.clone()));
            }
        }

        pipeline.set_ppn(self.ppn)?;
        let nodes = pipeline.get_nodes_used();
        if nodes > self.max_nodes {
            warn!(
                pipeline = %pipeline.id,
                nodes,
                max_nodes = self.max_nodes,
                "pipeline does not fit, discarding"
            );
            self.persist(PipelineState::nofit(pipeline.id.clone()));
            return Err(WorkflowError::NoFit(pipeline.id.clone(), nodes, self.max_nodes));
        }

        self.persist(PipelineState::not_started(pipeline.id.clone()));
        {
            let mut sched = self.scheduler.lock().unwrap();
            sched.job_list.add(pipeline);
        }
        self.scheduler_cv.notify_all();
        Ok(())
    }

    /// Disallow further admission; the main loop exits once the pending
    /// queue drains naturally.
    pub fn stop(&self) {
        self.state.lock().unwrap().allow_new_pipelines = false;
        self.scheduler_cv.notify_all();
    }

    /// Disallow further admission and scheduling, then force-kill every
    /// currently running pipeline. The main loop observes `!process_pipelines`
    /// and proceeds to join.
    pub fn kill_all(&self) {
        let pipelines: Vec<Arc<Pipeline>> = {
            let mut st = self.state.lock().unwrap();
            st.killed = true;
            st.allow_new_pipelines = false;
            st.process_pipelines = false;
            st.running.values().cloned().collect()
        };
        self.scheduler_cv.notify_all();
        for p in &pipelines {
            p.force_kill_all();
        }
    }

    /// Reclaim a terminated run's nodes immediately, rather than waiting for
    /// its whole pipeline to finish, per spec.md §4.6/§5.
    fn run_finished(&self, run: &Arc<Run>) {
        {
            let mut sched = self.scheduler.lock().unwrap();
            sched.free_nodes += run.get_nodes_used();
        }
        self.scheduler_cv.notify_all();
    }

    fn pipeline_finished(&self, pipeline: &Arc<Pipeline>) {
        if let Err(e) = adios::write_adios_file_sizes(&pipeline.working_dir) {
            warn!(pipeline = %pipeline.id, error = %e, "failed to scan adios file sizes");
        }
        {
            let mut st = self.state.lock().unwrap();
            st.running.remove(&pipeline.id);
        }
        self.persist(pipeline.get_state());
    }

    fn pipeline_fatal(&self, pipeline: &Arc<Pipeline>) {
        error!(pipeline = %pipeline.id, "post-process failed fatally, killing all pipelines");
        self.kill_all();
    }

    /// The single consumer thread's scheduling loop: block for admitted
    /// work, block for enough free capacity to run the largest fitting
    /// pipeline, dispatch it, repeat. Exits once the pending queue is
    /// drained with no new admissions allowed, or once killed.
    pub fn run_pipelines(self: &Arc<Self>) {
        loop {
            {
                let mut sched = self.scheduler.lock().unwrap();
                while sched.job_list.is_empty() && self.allow_new_pipelines() {
                    sched = self.scheduler_cv.wait(sched).unwrap();
                }
                if sched.job_list.is_empty() && !self.allow_new_pipelines() {
                    drop(sched);
                    self.join_running();
                    return;
                }
            }

            let popped = {
                let mut sched = self.scheduler.lock().unwrap();
                loop {
                    if let Some(p) = sched.job_list.pop(sched.free_nodes) {
                        sched.free_nodes -= p.get_nodes_used();
                        break Some(p);
                    }
                    if !self.process_pipelines() {
                        break None;
                    }
                    sched = self.scheduler_cv.wait(sched).unwrap();
                }
            };

            let Some(pipeline) = popped else {
                self.join_running();
                return;
            };

            self.dispatch(pipeline);
        }
    }

    fn dispatch(self: &Arc<Self>, pipeline: Arc<Pipeline>) {
        let consumer = Arc::clone(self);
        let run_finished_cb: RunCallback = Arc::new(move |r: &Arc<Run>| consumer.run_finished(r));

        let consumer = Arc::clone(self);
        let done_cb: PipelineCallback = Arc::new(move |p: &Arc<Pipeline>| consumer.pipeline_finished(p));

        let consumer = Arc::clone(self);
        let fatal_cb: PipelineCallback = Arc::new(move |p: &Arc<Pipeline>| consumer.pipeline_fatal(p));

        pipeline.add_done_callback(done_cb);
        pipeline.add_fatal_callback(fatal_cb);

        {
            let mut st = self.state.lock().unwrap();
            st.running.insert(pipeline.id.clone(), Arc::clone(&pipeline));
        }
        self.persist(PipelineState::running(pipeline.id.clone()));
        pipeline.start(self.launcher.clone(), run_finished_cb);
    }

    /// Collect the running set under the state lock, then join outside it:
    /// `join_all` blocks, and a pipeline's own completion callback
    /// (`pipeline_finished`) needs that same lock to remove itself.
    fn join_running(&self) {
        let pipelines: Vec<Arc<Pipeline>> = {
            let st = self.state.lock().unwrap();
            st.running.values().cloned().collect()
        };
        for p in &pipelines {
            p.join_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::Run;
    use std::collections::HashMap as Map;
    use std::path::PathBuf;

    fn tempdir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "codar-consumer-test-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

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

    #[test]
    fn oversized_pipeline_is_rejected_as_nofit() {
        let dir = tempdir("nofit");
        // ppn=1 means a run needing nprocs=8 spans 8 nodes, over a budget of 1.
        let eight_run = Arc::new(Run::new(
            "eight",
            "/bin/true",
            vec![],
            Map::new(),
            dir.clone(),
            None,
            8,
            dir.join("stdout.eight"),
            dir.join("stderr.eight"),
            dir.join("return.eight"),
            dir.join("walltime.eight"),
            None,
        ));
        let oversized = Arc::new(Pipeline::new(
            "p-oversized",
            dir.clone(),
            vec![eight_run],
            false,
            None,
            vec![],
            false,
            None,
        ));

        let runner = Arc::new(PipelineRunner::new(Launcher::None, 1, 1, None));
        let result = runner.add_pipeline(oversized);
        assert!(matches!(result, Err(WorkflowError::NoFit(_, 8, 1))));
    }

    #[test]
    fn duplicate_pipeline_id_is_rejected() {
        let dir = tempdir("dup");
        let run_a = make_run("a", "/bin/true", vec![], &dir);
        let pipeline_a = Arc::new(Pipeline::new(
            "dup-id",
            dir.clone(),
            vec![run_a],
            false,
            None,
            vec![],
            false,
            None,
        ));
        let run_b = make_run("a", "/bin/true", vec![], &dir);
        let pipeline_b = Arc::new(Pipeline::new(
            "dup-id",
            dir.clone(),
            vec![run_b],
            false,
            None,
            vec![],
            false,
            None,
        ));

        let runner = Arc::new(PipelineRunner::new(Launcher::None, 4, 1, None));
        runner.add_pipeline(pipeline_a).unwrap();
        let result = runner.add_pipeline(pipeline_b);
        assert!(matches!(result, Err(WorkflowError::DuplicatePipelineId(_))));
    }

    #[test]
    fn stop_rejects_further_admission() {
        let dir = tempdir("stop");
        let runner = Arc::new(PipelineRunner::new(Launcher::None, 4, 1, None));
        runner.stop();

        let run = make_run("a", "/bin/true", vec![], &dir);
        let pipeline = Arc::new(Pipeline::new(
            "late",
            dir.clone(),
            vec![run],
            false,
            None,
            vec![],
            false,
            None,
        ));
        let result = runner.add_pipeline(pipeline);
        assert!(matches!(result, Err(WorkflowError::PipelinesClosed)));
    }

    #[test]
    fn single_pipeline_drains_to_completion() {
        let dir = tempdir("drain");
        let run = make_run("a", "/bin/true", vec![], &dir);
        let pipeline = Arc::new(Pipeline::new(
            "solo",
            dir.clone(),
            vec![run],
            false,
            None,
            vec![],
            false,
            None,
        ));

        let runner = Arc::new(PipelineRunner::new(Launcher::None, 1, 1, None));
        runner.add_pipeline(pipeline).unwrap();
        runner.stop();

        let loop_runner = Arc::clone(&runner);
        let handle = std::thread::spawn(move || loop_runner.run_pipelines());
        handle.join().unwrap();

        let st = runner.state.lock().unwrap();
        assert!(st.running.is_empty());
    }
}
