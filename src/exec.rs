use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc::{STDIN_FILENO, STDOUT_FILENO};
use nix::sys::signal::Signal;
use nix::sys::wait::{self, WaitPidFlag};
use nix::unistd::{self, ForkResult, Pid};
use std::convert::Infallible;
use std::env;
use std::ffi::CString;
use std::io::{self, Write};
use std::os::unix::io::RawFd;
use tracing::{debug, warn};

use crate::builtins::{self, BuiltinKind};
use crate::error::{Result, ShellError};
use crate::jobs::{Job, JobFilter, JobId, Lookup, ProcessRecord};
use crate::parser::{Command, Connector, Pipeline, SimpleCommand};
use crate::redirect::{self, StdioBackup};
use crate::shell::Shell;
use crate::signals::{self, SignalMask};

/// Where control goes after forking one pipeline stage.
enum Launch {
    ParentContinues(Pid),
    /// The child either exec'd or exited; this arm is never observed.
    ReplacedOrTerminated(Infallible),
}

/// One OS pipe between two adjacent stages. Ends are closed on drop.
#[derive(Debug)]
struct PipeSegment {
    read: Option<RawFd>,
    write: Option<RawFd>,
}

impl PipeSegment {
    fn open() -> Result<PipeSegment> {
        let (read, write) = unistd::pipe2(OFlag::O_CLOEXEC).map_err(ShellError::sys("pipe"))?;
        Ok(PipeSegment {
            read: Some(read),
            write: Some(write),
        })
    }

    fn close(&mut self) {
        for fd in [self.read.take(), self.write.take()].into_iter().flatten() {
            let _ = unistd::close(fd);
        }
    }
}

impl Drop for PipeSegment {
    fn drop(&mut self) {
        self.close();
    }
}

/// Runs the pipelines of one input line, honouring `&&` and `||` between
/// them. Returns the status of the last pipeline that ran.
pub fn run_pipeline_list(shell: &mut Shell, pipelines: &[Pipeline]) -> Result<i32> {
    let mut status = 0;
    for pipeline in pipelines {
        let skip = match pipeline.connector {
            Connector::None => false,
            Connector::And => status != 0,
            Connector::Or => status == 0,
        };
        if skip {
            debug!(pipeline = %pipeline.source_text, "skipped by connector");
            continue;
        }
        status = run_pipeline(shell, pipeline)?;
        shell.last_status = status;
    }
    Ok(status)
}

/// Launches one pipeline and, for a foreground pipeline, waits until it
/// completes or stops.
///
/// Only fatal errors (no more processes or pipes) come back as `Err`; every
/// per-command failure is reported and folded into the returned status.
pub fn run_pipeline(shell: &mut Shell, pipeline: &Pipeline) -> Result<i32> {
    let stages = pipeline.commands.len();
    if stages == 0 {
        return Ok(0);
    }
    let foreground = !pipeline.background;

    if stages == 1 && foreground {
        let Command::Simple(cmd) = &pipeline.commands[0];
        match cmd.argv.first() {
            None => return Ok(run_in_shell(shell, cmd, None)),
            Some(name) => {
                if let Some(kind) = BuiltinKind::lookup(name) {
                    return Ok(run_in_shell(shell, cmd, Some(kind)));
                }
            }
        }
    }

    let mut pipes = Vec::with_capacity(stages - 1);
    for _ in 1..stages {
        pipes.push(PipeSegment::open()?);
    }

    let mut job = Job::new(pipeline.source_text.clone(), foreground);
    let mut last_stage_failed = false;
    for (index, command) in pipeline.commands.iter().enumerate() {
        if let Err(e) = spawn_stage(shell, &mut job, &pipes, index, command) {
            if e.is_fatal() {
                return Err(e);
            }
            eprintln!("jobsh: {}", e);
            last_stage_failed = index + 1 == stages;
        }
        if index > 0 {
            pipes[index - 1].close();
        }
    }
    drop(pipes);

    if job.processes.is_empty() {
        return Ok(1);
    }
    if !foreground {
        let _mask = SignalMask::block()?;
        let id = shell.jobs.push(job);
        if let Some(job) = shell.jobs.get(Lookup::Id(id), JobFilter::Background) {
            println!(
                "[{}] ({}) {}",
                id,
                job.pgid.map_or(0, Pid::as_raw),
                job.command_text()
            );
        }
        return Ok(0);
    }

    let status = run_in_foreground(shell, job, false)?;
    Ok(if last_stage_failed { 1 } else { status })
}

/// Resumes a job from the table, either in the foreground (waiting for it)
/// or in the background.
pub fn continue_job(shell: &mut Shell, id: JobId, foreground: bool) -> Result<i32> {
    if foreground {
        let mut job = {
            let _mask = SignalMask::block()?;
            shell
                .jobs
                .remove(|job| job.id == id)
                .ok_or_else(|| ShellError::NoSuchJob(format!("%{}", id)))?
        };
        job.foreground = true;
        println!("{}", job.command_text());
        return run_in_foreground(shell, job, true);
    }

    let job = shell
        .jobs
        .get_mut(Lookup::Id(id), JobFilter::Any)
        .ok_or_else(|| ShellError::NoSuchJob(format!("%{}", id)))?;
    job.mark_running();
    job.foreground = false;
    if let Err(e) = job.signal(Signal::SIGCONT) {
        warn!(job = id, "SIGCONT: {}", e);
    }
    println!("[{}] {}", id, job.command_text());
    Ok(0)
}

/// Gives `job` the terminal, waits for it, and takes the terminal back.
/// A job that stopped is kept in the table.
fn run_in_foreground(shell: &mut Shell, mut job: Job, resume: bool) -> Result<i32> {
    if let Some(pgid) = job.pgid {
        shell.terminal.give_to(pgid, job.saved_term_modes.as_ref());
    }
    if resume {
        job.mark_running();
        if let Err(e) = job.signal(Signal::SIGCONT) {
            warn!(job = job.id, "SIGCONT: {}", e);
        }
    }

    wait_for_job(&mut job);

    if let Some(modes) = shell.terminal.reclaim() {
        job.saved_term_modes = Some(modes);
    }
    let status = job.last_status();
    if job.is_stopped() {
        let _mask = SignalMask::block()?;
        job.notified = true;
        let id = if job.id == 0 {
            shell.jobs.push(job)
        } else {
            let id = job.id;
            shell.jobs.reinsert(job);
            id
        };
        let line_job = shell.jobs.get(Lookup::Id(id), JobFilter::Foreground);
        if let Some(job) = line_job {
            println!("{}", job.status_line());
        }
    }
    Ok(status)
}

/// Blocks until every process of the job has either exited or stopped.
fn wait_for_job(job: &mut Job) {
    let Some(pgid) = job.pgid else {
        return;
    };
    let group = Pid::from_raw(-pgid.as_raw());
    while !job.is_completed() && !job.is_stopped() {
        match wait::waitpid(group, Some(WaitPidFlag::WUNTRACED)) {
            Ok(status) => {
                if !job.update(status) {
                    warn!(?status, "waited on a process outside the job");
                }
            }
            Err(Errno::EINTR) => continue,
            Err(e) => {
                // Nothing left in the group to wait for.
                warn!(job = job.id, pgid = pgid.as_raw(), "waitpid: {}", e);
                for p in job.processes.iter_mut().filter(|p| !p.completed) {
                    p.completed = true;
                    p.stopped = false;
                }
                break;
            }
        }
    }
}

/// Puts `pid` into the job's process group, making it the leader if the job
/// has no group yet. Called for every stage from both sides of the fork.
fn join_process_group(job_pgid: &mut Option<Pid>, pid: Pid) -> Pid {
    let pgid = *job_pgid.get_or_insert(pid);
    if let Err(e) = unistd::setpgid(pid, pgid) {
        // EACCES after the child exec'd, ESRCH after it exited: it joined already.
        debug!(pid = pid.as_raw(), pgid = pgid.as_raw(), "setpgid: {}", e);
    }
    pgid
}

fn spawn_stage(
    shell: &mut Shell,
    job: &mut Job,
    pipes: &[PipeSegment],
    index: usize,
    command: &Command,
) -> Result<()> {
    let Command::Simple(cmd) = command;
    redirect::preflight(&cmd.redirections)?;

    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
    // The child arm never produces a value; the variant records that in the type.
    #[allow(unreachable_code)]
    let launch = match unsafe { unistd::fork() }.map_err(ShellError::sys("fork"))? {
        ForkResult::Parent { child } => Launch::ParentContinues(child),
        ForkResult::Child => Launch::ReplacedOrTerminated(run_child(shell, job, pipes, index, cmd)),
    };
    match launch {
        Launch::ParentContinues(pid) => {
            job.processes.push(ProcessRecord::new(pid));
            let pgid = join_process_group(&mut job.pgid, pid);
            debug!(
                pid = pid.as_raw(),
                pgid = pgid.as_raw(),
                stage = index,
                argv = ?cmd.argv,
                "spawned stage"
            );
            Ok(())
        }
        Launch::ReplacedOrTerminated(never) => match never {},
    }
}

/// Body of a forked stage: set up process group, terminal, descriptors and
/// environment, then run a built-in or exec the program.
fn run_child(
    shell: &mut Shell,
    job: &mut Job,
    pipes: &[PipeSegment],
    index: usize,
    cmd: &SimpleCommand,
) -> Infallible {
    shell.in_child = true;
    let pgid = join_process_group(&mut job.pgid, unistd::getpid());
    if job.foreground {
        shell.terminal.give_to(pgid, None);
    }
    signals::reset_for_child();

    if index > 0 {
        if let Some(read) = pipes[index - 1].read {
            if unistd::dup2(read, STDIN_FILENO).is_err() {
                exit_child(1);
            }
        }
    }
    if index < pipes.len() {
        if let Some(write) = pipes[index].write {
            if unistd::dup2(write, STDOUT_FILENO).is_err() {
                exit_child(1);
            }
        }
    }
    for fd in pipes.iter().flat_map(|p| [p.read, p.write]).flatten() {
        let _ = unistd::close(fd);
    }

    for binding in &cmd.env_bindings {
        if let Some((name, value)) = binding.split_once('=') {
            env::set_var(name, value);
        }
    }
    if let Err(e) = redirect::resolve(&cmd.redirections, true) {
        eprintln!("jobsh: {}", e);
        exit_child(1);
    }

    let Some(name) = cmd.argv.first() else {
        exit_child(0);
    };
    if let Some(kind) = BuiltinKind::lookup(name) {
        let status = builtins::run_builtin(shell, kind, &cmd.argv);
        exit_child(status);
    }
    let err = exec_program(&cmd.argv);
    eprintln!("jobsh: {}", err);
    exit_child(exec_failure_status(&err))
}

/// Replaces the process image with `argv[0]`, searched in `PATH`. Only
/// returns on failure.
pub fn exec_program(argv: &[String]) -> ShellError {
    let args: std::result::Result<Vec<CString>, _> =
        argv.iter().map(|a| CString::new(a.as_bytes())).collect();
    let args = match args {
        Ok(args) if !args.is_empty() => args,
        Ok(_) => return ShellError::Usage("nothing to execute".into()),
        Err(_) => return ShellError::Usage(format!("{}: argument contains a NUL byte", argv[0])),
    };
    match unistd::execvp(&args[0], &args) {
        Ok(never) => match never {},
        Err(Errno::ENOENT) => ShellError::CommandNotFound(argv[0].clone()),
        Err(source) => ShellError::Exec {
            program: argv[0].clone(),
            source,
        },
    }
}

/// Shell convention: 127 when the program is missing, 126 when it is not
/// runnable.
pub fn exec_failure_status(err: &ShellError) -> i32 {
    match err {
        ShellError::CommandNotFound(_) => 127,
        _ => 126,
    }
}

fn exit_child(status: i32) -> ! {
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
    unsafe { nix::libc::_exit(status) }
}

/// Runs a single foreground built-in (or a bare assignment/redirection)
/// inside the shell's own process, with stdio backed up around it.
fn run_in_shell(shell: &mut Shell, cmd: &SimpleCommand, kind: Option<BuiltinKind>) -> i32 {
    let permanent = kind == Some(BuiltinKind::Exec);
    let backup = StdioBackup::save();
    match redirect::resolve(&cmd.redirections, permanent) {
        Ok(dirty) => {
            let status = match kind {
                Some(kind) => builtins::run_builtin(shell, kind, &cmd.argv),
                None => {
                    for binding in &cmd.env_bindings {
                        if let Some((name, value)) = binding.split_once('=') {
                            env::set_var(name, value);
                        }
                    }
                    0
                }
            };
            backup.restore(dirty);
            status
        }
        Err(e) => {
            backup.restore(Default::default());
            eprintln!("jobsh: {}", e);
            1
        }
    }
}
