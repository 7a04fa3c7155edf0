//! MPI-style launchers that prefix a run's command line with the
//! site-specific process-placement tool (`mpiexec`, `aprun`, `srun`), or
//! none at all for a plain local process.
//!
//! Grounded in `codar.workflow.model.MPIRunner`/`Runner`: each launcher is a
//! small, fixed argument template; `wrap` resolves the launcher executable on
//! `PATH` and splices in the per-run process/node/tasks-per-node counts.

use crate::error::WorkflowError;
use crate::run::Run;

/// One of the fixed launcher templates, or none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Launcher {
    None,
    Mpi(MpiRunner),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MpiRunner {
    exe: String,
    nprocs_arg: String,
    nodes_arg: Option<String>,
    tasks_per_node_arg: Option<String>,
}

impl Launcher {
    pub fn mpiexec() -> Self {
        Launcher::Mpi(MpiRunner {
            exe: "mpiexec".into(),
            nprocs_arg: "-n".into(),
            nodes_arg: None,
            tasks_per_node_arg: None,
        })
    }

    pub fn aprun() -> Self {
        Launcher::Mpi(MpiRunner {
            exe: "aprun".into(),
            nprocs_arg: "-n".into(),
            nodes_arg: None,
            tasks_per_node_arg: Some("-N".into()),
        })
    }

    pub fn srun() -> Self {
        Launcher::Mpi(MpiRunner {
            exe: "srun".into(),
            nprocs_arg: "-n".into(),
            nodes_arg: Some("-N".into()),
            tasks_per_node_arg: None,
        })
    }

    /// Parse the `--launcher` CLI value into a `Launcher`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(Launcher::None),
            "mpiexec" => Some(Launcher::mpiexec()),
            "aprun" => Some(Launcher::aprun()),
            "srun" => Some(Launcher::srun()),
            _ => None,
        }
    }

    /// Build the full argv for launching `run`: launcher prefix (if any)
    /// followed by the run's own executable and arguments.
    ///
    /// A launcher executable missing from `PATH` is a fatal configuration
    /// error *for this run* (spec.md §4.1) — it surfaces through
    /// `WorkflowError::LauncherNotFound`, which `Run::spawn` turns into an
    /// EXCEPTION outcome rather than aborting the whole process.
    pub fn wrap(&self, run: &Run) -> Result<Vec<String>, WorkflowError> {
        match self {
            Launcher::None => {
                let mut argv = vec![run.exe.clone()];
                argv.extend(run.args.iter().cloned());
                Ok(argv)
            }
            Launcher::Mpi(mpi) => mpi.wrap(run),
        }
    }
}

impl MpiRunner {
    fn wrap(&self, run: &Run) -> Result<Vec<String>, WorkflowError> {
        let exe_path = which(&self.exe)
            .ok_or_else(|| WorkflowError::LauncherNotFound(self.exe.clone()))?;

        let mut argv = vec![exe_path, self.nprocs_arg.clone(), run.nprocs.to_string()];
        if let Some(nodes_arg) = &self.nodes_arg {
            argv.push(nodes_arg.clone());
            argv.push(run.nodes().to_string());
        }
        if let Some(tpn_arg) = &self.tasks_per_node_arg {
            argv.push(tpn_arg.clone());
            argv.push(run.tasks_per_node().to_string());
        }
        argv.push(run.exe.clone());
        argv.extend(run.args.iter().cloned());
        Ok(argv)
    }
}

/// `shutil.which` equivalent: search `PATH` for an executable named `exe`.
/// Absolute/relative paths containing a separator are returned unchanged if
/// they exist and are executable, matching `shutil.which`'s own behavior.
fn which(exe: &str) -> Option<String> {
    use std::os::unix::fs::PermissionsExt;

    if exe.contains('/') {
        return is_executable_file(exe).then(|| exe.to_string());
    }

    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(exe);
        if is_executable_file(candidate.to_str().unwrap_or_default()) {
            return candidate.to_str().map(|s| s.to_string());
        }
    }
    None
}

fn is_executable_file(path: &str) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}
