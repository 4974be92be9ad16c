//! nsjob — entry point.
//!
//! Job output goes to stdout as it streams in; tracing logs go to stderr.
//! This binary is also its own trampoline: `child` is the hidden re-exec
//! entry point invoked via `/proc/self/exe`, never by a user directly.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use nsjob::{Channel, JobId, Scheduler, Status};

#[derive(Debug, Parser)]
#[command(name = "nsjob")]
#[command(about = "Runs a command as an isolated, trackable job", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a command as an isolated job and stream its output.
    Run {
        /// Memory limit in bytes for the job's cgroup (0 = unlimited).
        #[arg(long, default_value = "0")]
        mem: u64,

        /// Executable and arguments to run.
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// [Internal] Trampoline re-exec entry point — not for direct use.
    #[command(hide = true)]
    Child {
        #[arg(long, default_value = "0")]
        mem: u64,

        job_id: String,

        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// Run a fixed set of concurrent demonstration jobs.
    Examples,
}

fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    // Logs always go to stderr so stdout carries only job output.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    if let Err(e) = run(cli) {
        tracing::error!("{e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    // Namespace and cgroup isolation both require elevated privileges.
    if !is_root() {
        anyhow::bail!("nsjob must run as root to create namespaces and cgroups");
    }

    match cli.command {
        Command::Run { mem, command } => run_job(mem, command),
        Command::Child {
            mem,
            job_id,
            command,
        } => {
            let job_id = JobId::parse(&job_id).context("invalid job id in child argv")?;
            let executable = command.first().context("child: missing executable")?;
            let err = nsjob::job::exec_as_child(job_id, mem, executable, &command[1..]);
            // exec_as_child only returns on failure (cgroup attach or the
            // final execve itself); the parent's Job maps exit codes 126/127
            // to Errored rather than a completed run, so report failure the
            // same way a shell would rather than going through the generic
            // anyhow exit(1) path.
            tracing::error!("{err:#}");
            std::process::exit(127);
        }
        Command::Examples => run_examples(),
    }
}

fn run_job(mem: u64, command: Vec<String>) -> Result<()> {
    let scheduler = Scheduler::with_self_trampoline().context("resolve current exe")?;
    let executable = &command[0];
    let args = &command[1..];

    let id = scheduler
        .start(executable, mem, args)
        .context("start job")?;
    info!(job = %id, "job started");

    let output = scheduler.output(id)?;
    let mut sub = Arc::clone(&output).subscribe();
    while let Some(line) = sub.next() {
        use std::io::Write;
        let mut out: Box<dyn Write> = match line.channel {
            Channel::Output => Box::new(std::io::stdout()),
            Channel::Error => Box::new(std::io::stderr()),
        };
        let _ = out.write_all(&line.bytes);
    }

    scheduler.wait();
    let status = scheduler.status(id)?;
    info!(job = %id, ?status, "job finished");

    std::process::exit(status.exit_code().max(0));
}

/// Mirrors the original's `examples` sub-command: a handful of jobs running
/// concurrently, including one that deliberately fails to start.
fn run_examples() -> Result<()> {
    let scheduler = Arc::new(Scheduler::with_self_trampoline().context("resolve current exe")?);

    std::thread::scope(|scope| {
        for i in 0..3 {
            let scheduler = Arc::clone(&scheduler);
            scope.spawn(move || example_ok(i, &scheduler));
        }
        let scheduler = Arc::clone(&scheduler);
        scope.spawn(move || example_bad_executable(&scheduler));
    });

    scheduler.wait();
    Ok(())
}

fn example_ok(i: u32, scheduler: &Scheduler) {
    let id = match scheduler.start("sleep", 0, &["0.1".to_string()]) {
        Ok(id) => id,
        Err(e) => {
            warn!(example = i, "unexpected start failure: {e}");
            return;
        }
    };
    info!(example = i, job = %id, "started");

    if let Ok(output) = scheduler.output(id) {
        let mut sub = output.subscribe();
        while let Some(line) = sub.next() {
            info!(example = i, "{}", String::from_utf8_lossy(&line.bytes));
        }
    }
    if let Ok(status) = scheduler.status(id) {
        info!(example = i, ?status, "finished");
    }
}

/// Unlike the user's program, the trampoline itself always launches
/// successfully (it's just this binary re-exec'd into new namespaces), so
/// `start` here returns `Ok` even though the executable doesn't exist. The
/// failure to `execve` the user's program only surfaces later, as the
/// child's asynchronous transition to `Errored` — observed by draining the
/// job's output to a close and then checking its terminal status.
fn example_bad_executable(scheduler: &Scheduler) {
    let id = match scheduler.start("./unknown-nsjob-example-binary", 0, &[]) {
        Ok(id) => id,
        Err(e) => {
            warn!("unexpected start failure: {e}");
            return;
        }
    };

    if let Ok(output) = scheduler.output(id) {
        let mut sub = output.subscribe();
        while sub.next().is_some() {}
    }
    match scheduler.status(id) {
        Ok(Status::Errored(_)) => info!(job = %id, "expected: nonexistent executable errored"),
        Ok(status) => warn!(job = %id, ?status, "expected Errored for a nonexistent executable"),
        Err(e) => warn!(job = %id, "unexpected status lookup failure: {e}"),
    }
}

#[cfg(unix)]
fn is_root() -> bool {
    // SAFETY: geteuid takes no arguments and cannot fail.
    unsafe { libc::geteuid() == 0 }
}
