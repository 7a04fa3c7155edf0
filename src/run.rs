//! Supervises a single process within a pipeline: spawn into its own
//! process group, wait with an optional timeout, escalate to SIGTERM/SIGKILL
//! on timeout or external kill, reap the whole group, and persist the
//! return code and walltime before notifying callbacks.
//!
//! Grounded in `codar.workflow.model.Run`: the same state machine
//! (`_killed`, `_timeout_pending`, `_timed_out`, `_exception`, `_end_time`),
//! the same `CONT → TERM → sleep(KILL_WAIT) → KILL` escalation, and the same
//! exponential-backoff process-group reap (`_pgroup_wait`).

use std::collections::HashMap;
use std::io::Write;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::launcher::Launcher;

/// Grace period between SIGTERM and SIGKILL when terminating a run.
const KILL_WAIT: Duration = Duration::from_secs(30);
/// `pgroup_wait` escalates to SIGKILL once backoff exceeds this.
const WAIT_DELAY_KILL: Duration = Duration::from_secs(30);
/// `pgroup_wait` gives up and logs an error once backoff exceeds this.
const WAIT_DELAY_GIVE_UP: Duration = Duration::from_secs(120);

pub(crate) const STDOUT_NAME: &str = "codar.workflow.stdout";
pub(crate) const STDERR_NAME: &str = "codar.workflow.stderr";
pub(crate) const RETURN_NAME: &str = "codar.workflow.return";
pub(crate) const WALLTIME_NAME: &str = "codar.workflow.walltime";

/// Resolve an output-file path: an explicit override is used as-is if
/// absolute, else joined under `working_dir`; absent, the default name is
/// joined under `working_dir`. Mirrors `codar.workflow.model._get_path`.
pub fn resolve_output_path(
    working_dir: &std::path::Path,
    default_name: &str,
    run_name: &str,
    override_path: Option<&str>,
) -> PathBuf {
    match override_path {
        Some(p) => {
            let p = std::path::Path::new(p);
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                working_dir.join(p)
            }
        }
        None => working_dir.join(format!("{default_name}.{run_name}")),
    }
}

/// Raised by query properties (`succeeded`, `timed_out`, `killed`) when
/// called before the run has terminated.
#[derive(Debug, Clone, Copy)]
pub struct NotDoneError;

impl std::fmt::Display for NotDoneError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "not available until run is done")
    }
}

impl std::error::Error for NotDoneError {}

type Callback = Arc<dyn Fn(&Arc<Run>) + Send + Sync>;

struct RunState {
    start_time: Option<Instant>,
    end_time: Option<Instant>,
    killed: bool,
    timeout_pending: bool,
    timed_out: bool,
    exception: bool,
    pid: Option<i32>,
    pgid: Option<i32>,
    returncode: Option<i32>,
}

impl RunState {
    fn new() -> Self {
        RunState {
            start_time: None,
            end_time: None,
            killed: false,
            timeout_pending: false,
            timed_out: false,
            exception: false,
            pid: None,
            pgid: None,
            returncode: None,
        }
    }
}

pub struct Run {
    pub name: String,
    pub exe: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: PathBuf,
    pub timeout: Option<Duration>,
    pub nprocs: u32,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub return_path: PathBuf,
    pub walltime_path: PathBuf,
    pub sleep_after: Option<Duration>,

    launcher: Mutex<Launcher>,
    nodes: AtomicU32,
    tasks_per_node: AtomicU32,

    state: Mutex<RunState>,
    callbacks: Mutex<Vec<Callback>>,
    supervision_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    kill_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Run {
    pub fn new(
        name: impl Into<String>,
        exe: impl Into<String>,
        args: Vec<String>,
        env: HashMap<String, String>,
        working_dir: PathBuf,
        timeout: Option<Duration>,
        nprocs: u32,
        stdout_path: PathBuf,
        stderr_path: PathBuf,
        return_path: PathBuf,
        walltime_path: PathBuf,
        sleep_after: Option<Duration>,
    ) -> Self {
        Run {
            name: name.into(),
            exe: exe.into(),
            args,
            env,
            working_dir,
            timeout,
            nprocs,
            stdout_path,
            stderr_path,
            return_path,
            walltime_path,
            sleep_after,
            launcher: Mutex::new(Launcher::None),
            nodes: AtomicU32::new(0),
            tasks_per_node: AtomicU32::new(0),
            state: Mutex::new(RunState::new()),
            callbacks: Mutex::new(Vec::new()),
            supervision_thread: Mutex::new(None),
            kill_thread: Mutex::new(None),
        }
    }

    /// Minimal constructor used by unit tests that don't need real output
    /// file paths.
    #[cfg(test)]
    pub fn new_for_test(name: &str, exe: &str, args: Vec<String>, nprocs: u32, nodes: u32) -> Self {
        let run = Run::new(
            name,
            exe,
            args,
            HashMap::new(),
            PathBuf::from("/tmp"),
            None,
            nprocs,
            PathBuf::from("/tmp/stdout"),
            PathBuf::from("/tmp/stderr"),
            PathBuf::from("/tmp/return"),
            PathBuf::from("/tmp/walltime"),
            None,
        );
        run.nodes.store(nodes, Ordering::SeqCst);
        run.tasks_per_node.store(nprocs.min(nodes.max(1)), Ordering::SeqCst);
        run
    }

    pub fn set_launcher(&self, launcher: Launcher) {
        *self.launcher.lock().unwrap() = launcher;
    }

    /// Set by the owning pipeline's `set_ppn`, per spec.md §4.2.
    pub fn set_layout(&self, tasks_per_node: u32, nodes: u32) {
        self.tasks_per_node.store(tasks_per_node, Ordering::SeqCst);
        self.nodes.store(nodes, Ordering::SeqCst);
    }

    pub fn nodes(&self) -> u32 {
        self.nodes.load(Ordering::SeqCst)
    }

    pub fn tasks_per_node(&self) -> u32 {
        self.tasks_per_node.load(Ordering::SeqCst)
    }

    /// Number of nodes this run occupies; requires `set_layout` to have been
    /// called (i.e. the owning pipeline's `set_ppn`).
    pub fn get_nodes_used(&self) -> u32 {
        self.nodes()
    }

    pub fn add_callback(&self, cb: Callback) {
        self.callbacks.lock().unwrap().push(cb);
    }

    fn fire_callbacks(self: &Arc<Self>) {
        let callbacks = self.callbacks.lock().unwrap().clone();
        for cb in callbacks {
            cb(self);
        }
    }

    pub fn exception(&self) -> bool {
        self.state.lock().unwrap().exception
    }

    pub fn succeeded(&self) -> Result<bool, NotDoneError> {
        let st = self.state.lock().unwrap();
        if st.exception {
            return Ok(false);
        }
        if st.end_time.is_none() {
            return Err(NotDoneError);
        }
        Ok(!st.killed && !st.timed_out && st.returncode == Some(0))
    }

    pub fn timed_out(&self) -> Result<bool, NotDoneError> {
        let st = self.state.lock().unwrap();
        if st.end_time.is_none() {
            return Err(NotDoneError);
        }
        Ok(st.timed_out)
    }

    pub fn killed(&self) -> Result<bool, NotDoneError> {
        let st = self.state.lock().unwrap();
        if st.end_time.is_none() {
            return Err(NotDoneError);
        }
        Ok(st.killed)
    }

    pub fn returncode(&self) -> Option<i32> {
        self.state.lock().unwrap().returncode
    }

    pub fn pid(&self) -> Option<i32> {
        self.state.lock().unwrap().pid
    }

    fn log_prefix(&self) -> &str {
        &self.name
    }

    /// Launch this run asynchronously on a dedicated supervision thread.
    /// Termination is observed through registered callbacks, invoked
    /// exactly once, without this thread holding any internal lock.
    pub fn start(self: &Arc<Self>) {
        let run = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("run-{}", run.name))
            .spawn(move || run.run_body())
            .expect("spawn run supervision thread");
        *self.supervision_thread.lock().unwrap() = Some(handle);
    }

    fn run_body(self: Arc<Self>) {
        let argv = {
            let launcher = self.launcher.lock().unwrap().clone();
            launcher.wrap(&self)
        };
        let argv = match argv {
            Ok(argv) => argv,
            Err(e) => {
                error!(run = self.log_prefix(), error = %e, "launcher wrap failed");
                let mut st = self.state.lock().unwrap();
                st.exception = true;
                st.end_time = Some(Instant::now());
                drop(st);
                self.fire_callbacks();
                return;
            }
        };

        let start_time = Instant::now();
        {
            let mut st = self.state.lock().unwrap();
            st.start_time = Some(start_time);
        }

        // Hold one lock across the killed check and the spawn: if `kill()`
        // ran in the gap between them, it would see no pgid yet, set
        // `killed` and return without dispatching a kill thread, and this
        // run would then spawn an unmanaged, never-signaled child.
        let mut st = self.state.lock().unwrap();
        if st.killed {
            info!(run = self.log_prefix(), "not starting, killed before start");
            st.end_time = Some(Instant::now());
            drop(st);
            self.fire_callbacks();
            return;
        }

        let mut child = match self.popen(&argv) {
            Ok(child) => child,
            Err(e) => {
                error!(run = self.log_prefix(), error = %e, "spawn failed");
                st.exception = true;
                st.end_time = Some(Instant::now());
                drop(st);
                self.fire_callbacks();
                return;
            }
        };

        let pid = child.id() as i32;
        let pgid = pid; // setpgid(0, 0) in pre_exec makes the child its own group leader
        st.pid = Some(pid);
        st.pgid = Some(pgid);
        drop(st);
        info!(run = self.log_prefix(), pid, pgid, ?argv, "started");

        let status = match wait_with_timeout(&mut child, self.timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                warn!(run = self.log_prefix(), "killing (timeout)");
                self.state.lock().unwrap().timeout_pending = true;

                let already_killed = self.state.lock().unwrap().killed;
                if !already_killed {
                    term_kill(pgid);
                }
                let status = child.wait().expect("wait for child after timeout kill");
                if !already_killed {
                    let mut st = self.state.lock().unwrap();
                    if status.code() != Some(0) {
                        st.timed_out = true;
                    }
                    st.timeout_pending = false;
                }
                status
            }
            Err(e) => {
                error!(run = self.log_prefix(), error = %e, "wait failed");
                let mut st = self.state.lock().unwrap();
                st.exception = true;
                st.end_time = Some(Instant::now());
                drop(st);
                self.fire_callbacks();
                return;
            }
        };

        pgroup_wait(pgid, self.log_prefix());

        let end_time = Instant::now();
        // A child killed by an uncaught signal (the normal outcome of a
        // timeout or external kill, since e.g. `sleep` doesn't trap
        // SIGTERM/SIGKILL) has no exit code on Unix. Fall back to the
        // negated signal number, matching Python's `Popen.returncode`
        // convention, so a return file is always produced.
        let returncode = status.code().unwrap_or_else(|| -status.signal().unwrap_or(0));
        {
            let mut st = self.state.lock().unwrap();
            st.end_time = Some(end_time);
            st.returncode = Some(returncode);
        }
        info!(run = self.log_prefix(), pid, returncode, "done");

        let walltime = end_time.duration_since(start_time).as_secs_f64();
        if let Err(e) = self.save_walltime(walltime) {
            error!(run = self.log_prefix(), error = %e, "failed to write walltime file");
        }
        if let Err(e) = self.save_returncode(returncode) {
            error!(run = self.log_prefix(), error = %e, "failed to write return file");
        }

        self.fire_callbacks();
    }

    fn popen(&self, argv: &[String]) -> std::io::Result<Child> {
        let out = std::fs::File::create(&self.stdout_path)?;
        let err = std::fs::File::create(&self.stderr_path)?;

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(&self.working_dir)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(out))
            .stderr(Stdio::from(err));

        // Place the child in its own process group so group-wide signals
        // (CONT/TERM/KILL) sent by this engine never affect the engine
        // itself, and so engine-level signals never propagate to children.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        cmd.spawn()
    }

    fn save_returncode(&self, code: i32) -> std::io::Result<()> {
        let mut f = std::fs::File::create(&self.return_path)?;
        writeln!(f, "{code}")
    }

    fn save_walltime(&self, walltime: f64) -> std::io::Result<()> {
        let mut f = std::fs::File::create(&self.walltime_path)?;
        writeln!(f, "{walltime}")
    }

    /// Idempotent, thread-safe external kill. Short-circuits if already
    /// killed, if a timeout kill is pending, or if the run already
    /// terminated naturally. Otherwise dispatches CONT→TERM→KILL on a
    /// separate thread so the caller never blocks holding its own lock.
    pub fn kill(self: &Arc<Self>) {
        let pgid = {
            let mut st = self.state.lock().unwrap();
            if st.killed || st.timeout_pending || st.end_time.is_some() {
                return;
            }
            st.killed = true;
            st.pgid
        };

        if let Some(pgid) = pgid {
            warn!(run = self.log_prefix(), "kill requested");
            let handle = std::thread::spawn(move || term_kill(pgid));
            *self.kill_thread.lock().unwrap() = Some(handle);
        }
    }

    /// Join this run's supervision thread, then its kill thread if one was
    /// dispatched. Idempotent: a second call after the handles have been
    /// taken is a no-op, matching `Thread.join()`'s own idempotence.
    pub fn join(&self) {
        if let Some(handle) = self.supervision_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.join_kill_thread();
    }

    fn join_kill_thread(&self) {
        if let Some(handle) = self.kill_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// Wait for `child` to exit, polling if a timeout is configured so we can
/// detect expiry without blocking indefinitely. Returns `Ok(None)` if the
/// timeout elapsed with the child still running.
fn wait_with_timeout(
    child: &mut Child,
    timeout: Option<Duration>,
) -> std::io::Result<Option<std::process::ExitStatus>> {
    match timeout {
        None => child.wait().map(Some),
        Some(timeout) => {
            let start = Instant::now();
            let poll_interval = Duration::from_millis(100);
            loop {
                if let Some(status) = child.try_wait()? {
                    return Ok(Some(status));
                }
                if start.elapsed() >= timeout {
                    return Ok(None);
                }
                std::thread::sleep(poll_interval.min(timeout));
            }
        }
    }
}

/// Issue signals to the entire process group: give processes a chance to
/// exit cleanly with CONT+TERM, then KILL after `KILL_WAIT`, tolerating the
/// group having already exited (ESRCH).
fn term_kill(pgid: i32) {
    unsafe {
        libc::kill(-pgid, libc::SIGCONT);
        libc::kill(-pgid, libc::SIGTERM);
    }
    std::thread::sleep(KILL_WAIT);
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

/// Wait until the process group led by `pgid` no longer exists, probing
/// with the null signal in exponential backoff starting at 1s. Escalates to
/// SIGKILL past `WAIT_DELAY_KILL`, gives up and logs past
/// `WAIT_DELAY_GIVE_UP`. Inspired by the `proctrack_pgid` plugin from Slurm.
fn pgroup_wait(pgid: i32, log_prefix: &str) {
    debug!(run = log_prefix, "pgroup_wait max delay {WAIT_DELAY_GIVE_UP:?}");
    let mut delay = Duration::from_secs(1);
    let mut signum = 0;
    loop {
        let rc = unsafe { libc::kill(-pgid, signum) };
        if rc != 0 && std::io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH) {
            break;
        }
        std::thread::sleep(delay);
        delay *= 2;
        if delay > WAIT_DELAY_KILL {
            signum = libc::SIGKILL;
            warn!(run = log_prefix, ?delay, "pgroup still exists, sending KILL");
        }
        if delay > WAIT_DELAY_GIVE_UP {
            error!(run = log_prefix, "pgroup did not exit");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn make_run(exe: &str, args: Vec<String>, timeout: Option<Duration>) -> Arc<Run> {
        let dir = std::env::temp_dir().join(format!("codar-run-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        Arc::new(Run::new(
            "t",
            exe,
            args,
            HashMap::new(),
            dir.clone(),
            timeout,
            1,
            dir.join("stdout"),
            dir.join("stderr"),
            dir.join("return"),
            dir.join("walltime"),
            None,
        ))
    }

    #[test]
    fn successful_run_reports_succeeded_and_return_file() {
        let run = make_run("/bin/true", vec![], None);
        let done = Arc::new(AtomicBool::new(false));
        let done2 = Arc::clone(&done);
        run.add_callback(Arc::new(move |_r: &Arc<Run>| {
            done2.store(true, Ordering::SeqCst);
        }));
        run.start();
        for _ in 0..100 {
            if done.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(run.succeeded().unwrap(), true);
        assert_eq!(run.returncode(), Some(0));
        let contents = std::fs::read_to_string(&run.return_path).unwrap();
        assert_eq!(contents, "0\n");
    }

    #[test]
    fn failing_run_reports_not_succeeded() {
        let run = make_run("/bin/false", vec![], None);
        let done = Arc::new(AtomicBool::new(false));
        let done2 = Arc::clone(&done);
        run.add_callback(Arc::new(move |_r: &Arc<Run>| {
            done2.store(true, Ordering::SeqCst);
        }));
        run.start();
        for _ in 0..100 {
            if done.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(run.succeeded().unwrap(), false);
        assert_eq!(run.returncode(), Some(1));
    }

    #[test]
    fn killed_run_writes_return_file_with_negated_signal() {
        let run = make_run("/bin/sleep", vec!["30".into()], None);
        let done = Arc::new(AtomicBool::new(false));
        let done2 = Arc::clone(&done);
        run.add_callback(Arc::new(move |_r: &Arc<Run>| {
            done2.store(true, Ordering::SeqCst);
        }));
        run.start();
        std::thread::sleep(Duration::from_millis(200));
        run.kill();
        for _ in 0..200 {
            if done.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(run.returncode(), Some(-libc::SIGTERM));
        let contents = std::fs::read_to_string(&run.return_path).unwrap();
        assert_eq!(contents, format!("{}\n", -libc::SIGTERM));
    }

    #[test]
    fn resolve_output_path_joins_relative_override_under_working_dir() {
        let wd = std::path::Path::new("/tmp/pipeline-dir");
        let p = resolve_output_path(wd, STDOUT_NAME, "myrun", Some("custom.out"));
        assert_eq!(p, wd.join("custom.out"));
    }

    #[test]
    fn resolve_output_path_keeps_absolute_override() {
        let wd = std::path::Path::new("/tmp/pipeline-dir");
        let p = resolve_output_path(wd, STDOUT_NAME, "myrun", Some("/abs/out"));
        assert_eq!(p, std::path::PathBuf::from("/abs/out"));
    }

    #[test]
    fn resolve_output_path_uses_default_name_when_absent() {
        let wd = std::path::Path::new("/tmp/pipeline-dir");
        let p = resolve_output_path(wd, STDOUT_NAME, "myrun", None);
        assert_eq!(p, wd.join("codar.workflow.stdout.myrun"));
    }
}
