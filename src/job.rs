//! A single job: one child process, its output stream, and its status.
//!
//! Launching a job is a two-stage self-exec handshake. The parent clones a
//! new process directly into fresh mount, PID, and network namespaces (a raw
//! `clone(2)` with those namespace flags set, not a post-fork `unshare(2)` —
//! `CLONE_NEWPID` only takes effect for the *children* of the process that
//! requests it, never for that process's own subsequent `exec`, so the
//! namespace has to be created at clone time, not after). That cloned
//! process execs the *trampoline* binary (conventionally this same binary,
//! reached via `/proc/self/exe`) re-entered in `child` mode; the trampoline
//! attaches to the memory cgroup and then execs directly into the user's
//! program. Because the clone happened with `CLONE_NEWPID` set, the
//! trampoline — and therefore the user's program after it — is PID 1 of the
//! new namespace from the moment it's born.
//!
//! The clone-to-exec window between the parent's `clone(2)` call and the
//! child's `execve(2)` only uses async-signal-safe libc calls (`close`,
//! `dup2`, `setpgid`, `execve`, `_exit`): the surrounding process is
//! multi-threaded (other jobs' pump/reaper threads may be running), and a
//! freshly cloned child only contains the calling thread — any lock held by
//! a thread that "vanished" in the child would otherwise deadlock it. Every
//! path and argument byte the child needs is therefore prepared as a raw
//! pointer *before* the clone call.

use std::ffi::CString;
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::status::{self, Status};
use crate::stream::{Channel, Line, Stream};

/// Globally-unique job identifier, rendered as a canonical UUID
/// (8-4-4-4-12 hex) everywhere it is displayed or passed on a command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        JobId(Uuid::new_v4())
    }

    /// Parses a canonical UUID string as produced by `Display`.
    pub fn parse(s: &str) -> std::result::Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(JobId)
    }

    #[cfg(test)]
    pub fn nil() -> Self {
        JobId(Uuid::nil())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// A running or completed job: its child process, output stream, and
/// status, all independently lockable so that `status()`/`output()` never
/// block on a slow pipe.
pub struct Job {
    id: JobId,
    stream: Arc<Stream>,
    status: Mutex<Status>,
    child_pid: Mutex<Option<i32>>,
}

impl Job {
    pub fn new(id: JobId) -> Arc<Self> {
        Arc::new(Job {
            id,
            stream: Stream::new(),
            status: Mutex::new(Status::Idle),
            child_pid: Mutex::new(None),
        })
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn status(&self) -> Status {
        *self.status.lock().unwrap()
    }

    pub fn output(&self) -> Arc<Stream> {
        Arc::clone(&self.stream)
    }

    /// Spawns `executable` under a fresh mount/PID/network namespace via
    /// the trampoline at `trampoline_path`, re-entering it in `child` mode.
    /// Blocks only until the clone itself has succeeded or failed; the
    /// child's lifetime is driven by background threads. `on_done` runs
    /// once the job reaches a terminal status (used by the Scheduler to
    /// drain its wait-group).
    pub fn start_isolated(
        self: &Arc<Self>,
        trampoline_path: &Path,
        mem: u64,
        executable: &str,
        args: &[String],
        on_done: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        let spawned = spawn_isolated(trampoline_path, self.id, mem, executable, args);
        let (pid, stdout, stderr) = match spawned {
            Ok(parts) => parts,
            Err(e) => {
                *self.status.lock().unwrap() = Status::Errored(status::NO_EXIT_CODE);
                return Err(e);
            }
        };

        *self.child_pid.lock().unwrap() = Some(pid);
        *self.status.lock().unwrap() = Status::Running;
        info!(job = %self.id, pid, "job started");

        let t_out = {
            let stream = Arc::clone(&self.stream);
            thread::spawn(move || pump(stdout, Channel::Output, &stream))
        };
        let t_err = {
            let stream = Arc::clone(&self.stream);
            thread::spawn(move || pump(stderr, Channel::Error, &stream))
        };

        let job = Arc::clone(self);
        thread::spawn(move || {
            let _ = t_out.join();
            let _ = t_err.join();

            let mut raw_status: libc::c_int = 0;
            // SAFETY: pid was returned by our own clone(2) call above and
            // has not been waited on by anyone else.
            let wait_rc = unsafe { libc::waitpid(pid as libc::pid_t, &mut raw_status, 0) };

            {
                let mut guard = job.status.lock().unwrap();
                if !guard.is_terminal() {
                    *guard = if wait_rc < 0 {
                        warn!(job = %job.id, error = %io::Error::last_os_error(), "waitpid failed");
                        Status::Errored(status::NO_EXIT_CODE)
                    } else if wifexited(raw_status) {
                        // 126/127 are the trampoline's own exit codes when it
                        // could not exec the user's program at all (see
                        // `exec_as_child` / main.rs's `child` handler) — the
                        // classic shell convention for "not executable" /
                        // "not found". Those are a launch failure, not a
                        // completed run of the user's program.
                        match wexitstatus(raw_status) {
                            126 | 127 => Status::Errored(status::NO_EXIT_CODE),
                            code => Status::Exited(code),
                        }
                    } else {
                        Status::Errored(status::NO_EXIT_CODE)
                    };
                }
            }
            job.stream.close();
            debug!(job = %job.id, status = ?job.status(), "job finished");
            on_done();
        });

        Ok(())
    }

    /// Sends SIGKILL to the child's process group. Fails if the job is not
    /// currently running.
    pub fn stop(&self) -> Result<()> {
        let mut guard = self.status.lock().unwrap();
        if *guard != Status::Running {
            return Err(Error::StopFailed {
                job: self.id,
                reason: "job is not running".to_string(),
            });
        }
        let pid = self
            .child_pid
            .lock()
            .unwrap()
            .expect("running job has a pid");

        // Negative pid targets the whole process group. The cloned
        // trampoline process called `setpgid(0, 0)` before execing itself,
        // making it its own group leader with this pid as the group id too,
        // so this reaches the user program and anything it forked as well.
        // SAFETY: pid is a valid process id recorded at spawn time.
        let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            return Err(Error::StopFailed {
                job: self.id,
                reason: err.to_string(),
            });
        }
        *guard = Status::Killed(status::NO_EXIT_CODE);
        drop(guard);
        // Closing here (rather than waiting for the reaper thread's
        // post-waitpid close) keeps the §5 ordering invariant intact: once a
        // caller observes `Status::Killed`, the stream must already be
        // closed. The reaper's later `close()` is a no-op since close is
        // idempotent; any output the killed child was still writing is
        // expected to be cut short.
        self.stream.close();
        Ok(())
    }
}

fn wifexited(status: libc::c_int) -> bool {
    (status & 0x7f) == 0
}

fn wexitstatus(status: libc::c_int) -> i32 {
    (status >> 8) & 0xff
}

/// Builds the trampoline's argv, clones a process directly into fresh
/// mount/PID/network namespaces, and execs the trampoline in it. Returns the
/// new pid and the parent's read ends of the child's stdout/stderr pipes.
fn spawn_isolated(
    trampoline_path: &Path,
    job_id: JobId,
    mem: u64,
    executable: &str,
    args: &[String],
) -> Result<(i32, File, File)> {
    let to_cstring = |s: &[u8]| -> Result<CString> {
        CString::new(s).map_err(|_| {
            Error::SpawnFailed(io::Error::new(
                io::ErrorKind::InvalidInput,
                "argument contains a NUL byte",
            ))
        })
    };

    let program = to_cstring(trampoline_path.as_os_str().as_bytes())?;

    let mut owned_args = vec![to_cstring(trampoline_path.as_os_str().as_bytes())?];
    owned_args.push(to_cstring(b"child")?);
    if mem > 0 {
        owned_args.push(to_cstring(b"--mem")?);
        owned_args.push(to_cstring(mem.to_string().as_bytes())?);
    }
    owned_args.push(to_cstring(job_id.to_string().as_bytes())?);
    owned_args.push(to_cstring(executable.as_bytes())?);
    for a in args {
        owned_args.push(to_cstring(a.as_bytes())?);
    }

    let mut argv: Vec<*const libc::c_char> =
        owned_args.iter().map(|c| c.as_ptr()).collect();
    argv.push(std::ptr::null());

    let (stdout_r, stdout_w) = make_pipe()?;
    let (stderr_r, stderr_w) = make_pipe()?;
    // SAFETY: a literal C string with a single trailing NUL.
    let devnull = unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
    if devnull < 0 {
        let err = io::Error::last_os_error();
        close_all(&[stdout_r, stdout_w, stderr_r, stderr_w]);
        return Err(Error::SpawnFailed(err));
    }

    let flags = (libc::SIGCHLD as libc::c_ulong)
        | (libc::CLONE_NEWNS as libc::c_ulong)
        | (libc::CLONE_NEWPID as libc::c_ulong)
        | (libc::CLONE_NEWNET as libc::c_ulong);

    // SAFETY: `flags` requests a plain copy-on-write child (no CLONE_VM), so
    // passing a null child stack makes this behave like fork(2) with the
    // given namespaces applied at creation time. Everything the child
    // branch touches (`program`, `argv`, the raw fds) was fully prepared
    // above the call, so the child only ever calls async-signal-safe libc
    // functions between here and `execve`.
    let pid = unsafe {
        libc::syscall(
            libc::SYS_clone,
            flags,
            std::ptr::null_mut::<libc::c_void>(),
            std::ptr::null_mut::<libc::c_int>(),
            std::ptr::null_mut::<libc::c_int>(),
            0u64,
        )
    };

    if pid < 0 {
        let err = io::Error::last_os_error();
        close_all(&[stdout_r, stdout_w, stderr_r, stderr_w, devnull]);
        return Err(Error::SpawnFailed(err));
    }

    if pid == 0 {
        // Child: new mount/PID/network namespace, about to become its
        // namespace's PID 1. Only async-signal-safe calls from here on.
        unsafe {
            libc::setpgid(0, 0);
            libc::close(stdout_r);
            libc::close(stderr_r);
            libc::dup2(devnull, libc::STDIN_FILENO);
            libc::dup2(stdout_w, libc::STDOUT_FILENO);
            libc::dup2(stderr_w, libc::STDERR_FILENO);
            if stdout_w != libc::STDOUT_FILENO {
                libc::close(stdout_w);
            }
            if stderr_w != libc::STDERR_FILENO {
                libc::close(stderr_w);
            }
            libc::close(devnull);
            let envp = libc::environ as *const *const libc::c_char;
            libc::execve(program.as_ptr(), argv.as_ptr(), envp);
            // execve only returns on failure.
            libc::_exit(127);
        }
    }

    // Parent: drop the ends the child owns now.
    close_all(&[stdout_w, stderr_w, devnull]);

    // SAFETY: stdout_r/stderr_r are open, valid, and owned exclusively by
    // this call from here on.
    let stdout = unsafe { File::from_raw_fd(stdout_r) };
    let stderr = unsafe { File::from_raw_fd(stderr_r) };
    Ok((pid as i32, stdout, stderr))
}

fn make_pipe() -> Result<(RawFd, RawFd)> {
    let mut fds = [0i32; 2];
    // SAFETY: fds is a valid 2-element buffer.
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(Error::SpawnFailed(io::Error::last_os_error()));
    }
    Ok((fds[0], fds[1]))
}

fn close_all(fds: &[RawFd]) {
    for &fd in fds {
        if fd >= 0 {
            // SAFETY: each fd here was either just opened by us or is a
            // no-op on an already-consumed value; closing twice on these
            // paths never happens since callers only pass still-open fds.
            unsafe {
                libc::close(fd);
            }
        }
    }
}

fn pump(mut reader: impl io::Read, channel: Channel, stream: &Arc<Stream>) {
    let mut buf = [0u8; crate::stream::MAX_LINE_BYTES];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let line = Line::new(channel, buf[..n].to_vec());
                if stream.write(line).is_err() {
                    // Stream already closed (e.g. job was stopped); the
                    // child may still be producing output we no longer
                    // care to buffer.
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

/// Child-mode entry point: attaches to the memory cgroup (if requested)
/// then `execve`s directly into the user's program, replacing this
/// process's image. Only returns on failure — success never returns. Runs
/// inside the namespaces `spawn_isolated`'s clone already created, so this
/// is the process that becomes (or rather, stays) PID 1 there.
pub fn exec_as_child(job_id: JobId, mem: u64, executable: &str, args: &[String]) -> Error {
    if mem > 0
        && let Err(e) = attach_memory_cgroup(job_id, mem)
    {
        return e;
    }
    let err = Command::new(executable).args(args).exec();
    Error::SpawnFailed(err)
}

fn attach_memory_cgroup(job_id: JobId, mem: u64) -> Result<()> {
    let dir: PathBuf = ["/sys/fs/cgroup/memory", &job_id.to_string()]
        .iter()
        .collect();
    let cgroup_err = |source| Error::CgroupFailed { job: job_id, source };

    fs::create_dir(&dir).map_err(cgroup_err)?;
    fs::set_permissions(&dir, fs::Permissions::from_mode(0o755)).map_err(cgroup_err)?;

    let limit_path = dir.join("memory.limit_in_bytes");
    fs::write(&limit_path, mem.to_string()).map_err(cgroup_err)?;
    fs::set_permissions(&limit_path, fs::Permissions::from_mode(0o644)).map_err(cgroup_err)?;

    let procs_path = dir.join("cgroup.procs");
    fs::write(&procs_path, std::process::id().to_string()).map_err(cgroup_err)?;
    fs::set_permissions(&procs_path, fs::Permissions::from_mode(0o700)).map_err(cgroup_err)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_displays_as_canonical_uuid() {
        let id = JobId::new();
        let text = id.to_string();
        let parts: Vec<&str> = text.split('-').collect();
        assert_eq!(parts.len(), 5);
        assert_eq!(
            parts.iter().map(|p| p.len()).collect::<Vec<_>>(),
            vec![8, 4, 4, 4, 12]
        );
    }

    #[test]
    fn job_id_round_trips_through_parse() {
        let id = JobId::new();
        let parsed = JobId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn fresh_job_is_idle_with_empty_output() {
        let job = Job::new(JobId::new());
        assert_eq!(job.status(), Status::Idle);
        assert!(!job.output().is_closed());
    }

    #[test]
    fn stop_on_idle_job_fails() {
        let job = Job::new(JobId::new());
        assert!(matches!(job.stop(), Err(Error::StopFailed { .. })));
    }

    #[test]
    fn wait_status_helpers_decode_normal_exit() {
        // A raw wait status for "exited with code 3" is the code in the
        // high byte, zero in the low 7 bits (no signal).
        let raw = 3 << 8;
        assert!(wifexited(raw));
        assert_eq!(wexitstatus(raw), 3);
    }

    #[test]
    fn wait_status_helpers_decode_signal_death_as_not_exited() {
        // Killed by signal 9: low 7 bits hold the signal number, not zero.
        let raw = 9;
        assert!(!wifexited(raw));
    }
}
