//! The job registry: a map from `JobId` to `Job`, plus the launch-mode
//! dispatch that decides whether a `start` call is a fresh launch or the
//! re-exec re-entry of an already-running one.
//!
//! Despite the name, this is a registry and launcher, not a planner: there
//! is no queueing, priority, or fairness policy here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, RwLock};

use tracing::debug;

use crate::error::{Error, Result};
use crate::job::{Job, JobId};
use crate::status::Status;
use crate::stream::Stream;

pub struct Scheduler {
    trampoline_path: PathBuf,
    jobs: RwLock<HashMap<JobId, Arc<Job>>>,
    in_flight: Arc<(Mutex<usize>, Condvar)>,
}

impl Scheduler {
    pub fn new(trampoline_path: impl Into<PathBuf>) -> Self {
        Scheduler {
            trampoline_path: trampoline_path.into(),
            jobs: RwLock::new(HashMap::new()),
            in_flight: Arc::new((Mutex::new(0), Condvar::new())),
        }
    }

    /// Convenience constructor pointing the trampoline at this binary,
    /// resolved via `/proc/self/exe`.
    pub fn with_self_trampoline() -> Result<Self> {
        let exe = std::env::current_exe().map_err(Error::SpawnFailed)?;
        Ok(Self::new(exe))
    }

    /// Launches `executable` as a new isolated job, or — if `executable` is
    /// the trampoline binary itself — treats this call as the re-exec
    /// re-entry and dispatches straight into child mode (see `job.rs`'s
    /// `exec_as_child`, which only returns on failure). The CLI glue
    /// normally avoids this branch entirely by dispatching on the `child`
    /// subcommand directly; the path comparison here exists for library
    /// consumers that call `Scheduler::start` without going through it.
    pub fn start(&self, executable: &str, mem: u64, args: &[String]) -> Result<JobId> {
        if Path::new(executable) == self.trampoline_path {
            let job_id = JobId::parse(args.first().map(String::as_str).unwrap_or_default())
                .map_err(|_| Error::SpawnFailed(invalid_reexec_argv()))?;
            let real_executable = args.get(1).ok_or_else(invalid_reexec_argv)?;
            let real_args = &args[2.min(args.len())..];
            return Err(crate::job::exec_as_child(
                job_id,
                mem,
                real_executable,
                real_args,
            ));
        }

        let job = Job::new(JobId::new());
        let id = job.id();
        self.enter();

        let in_flight = Arc::clone(&self.in_flight);
        let started = job.start_isolated(&self.trampoline_path, mem, executable, args, move || {
            let (lock, cvar) = &*in_flight;
            let mut n = lock.lock().unwrap();
            *n -= 1;
            if *n == 0 {
                cvar.notify_all();
            }
        });

        match started {
            Ok(()) => {
                self.jobs.write().unwrap().insert(id, job);
                debug!(job = %id, "job registered");
                Ok(id)
            }
            Err(e) => {
                self.leave();
                Err(e)
            }
        }
    }

    pub fn stop(&self, id: JobId) -> Result<Status> {
        let job = self.get(id)?;
        job.stop()?;
        Ok(job.status())
    }

    pub fn status(&self, id: JobId) -> Result<Status> {
        Ok(self.get(id)?.status())
    }

    pub fn output(&self, id: JobId) -> Result<Arc<Stream>> {
        Ok(self.get(id)?.output())
    }

    /// Number of jobs ever registered (terminal or not).
    pub fn size(&self) -> usize {
        self.jobs.read().unwrap().len()
    }

    /// Blocks until every job started through this Scheduler has reached a
    /// terminal status.
    pub fn wait(&self) {
        let (lock, cvar) = &*self.in_flight;
        let mut n = lock.lock().unwrap();
        while *n > 0 {
            n = cvar.wait(n).unwrap();
        }
    }

    fn get(&self, id: JobId) -> Result<Arc<Job>> {
        self.jobs
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(Error::NotFound(id))
    }

    fn enter(&self) {
        let (lock, _) = &*self.in_flight;
        *lock.lock().unwrap() += 1;
    }

    fn leave(&self) {
        let (lock, cvar) = &*self.in_flight;
        let mut n = lock.lock().unwrap();
        *n -= 1;
        if *n == 0 {
            cvar.notify_all();
        }
    }
}

fn invalid_reexec_argv() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        "re-exec argv missing job id / executable",
    )
}
