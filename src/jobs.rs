use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::termios::Termios;
use nix::sys::wait::{self, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::Result;
use crate::signals::SignalMask;

pub type JobId = u64;

const HARVEST_ATTEMPTS: usize = 50;
const HARVEST_INTERVAL: Duration = Duration::from_millis(10);

/// One process of a job and the last state change seen for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: Pid,
    /// Exit code, or the signal number if the process was killed or stopped.
    pub exit_or_signal: i32,
    pub signaled: bool,
    pub stopped: bool,
    pub completed: bool,
}

impl ProcessRecord {
    pub fn new(pid: Pid) -> Self {
        ProcessRecord {
            pid,
            exit_or_signal: 0,
            signaled: false,
            stopped: false,
            completed: false,
        }
    }

    /// Applies a status reported by `waitpid` for this process.
    pub fn update(&mut self, status: WaitStatus) {
        match status {
            WaitStatus::Exited(_, code) => {
                self.completed = true;
                self.stopped = false;
                self.signaled = false;
                self.exit_or_signal = code;
            }
            WaitStatus::Signaled(_, sig, _) => {
                self.completed = true;
                self.stopped = false;
                self.signaled = true;
                self.exit_or_signal = sig as i32;
            }
            WaitStatus::Stopped(_, sig) => {
                self.stopped = true;
                self.exit_or_signal = sig as i32;
            }
            WaitStatus::Continued(_) => self.stopped = false,
            _ => {}
        }
    }
}

/// Derived state of a whole job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Running,
    Stopped,
    Completed,
}

/// Represents one pipeline invocation.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    /// `None` until the first stage is spawned.
    pub pgid: Option<Pid>,
    pub processes: Vec<ProcessRecord>,
    pub foreground: bool,
    pub notified: bool,
    pub saved_term_modes: Option<Termios>,
    pub display_text: String,
}

impl Job {
    pub fn new(display_text: impl Into<String>, foreground: bool) -> Self {
        Job {
            id: 0,
            pgid: None,
            processes: Vec::new(),
            foreground,
            notified: false,
            saved_term_modes: None,
            display_text: display_text.into(),
        }
    }

    pub fn state(&self) -> JobState {
        if self.processes.iter().all(|p| p.completed) {
            JobState::Completed
        } else if self.processes.iter().all(|p| p.completed || p.stopped) {
            JobState::Stopped
        } else {
            JobState::Running
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state() == JobState::Completed
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == JobState::Stopped
    }

    pub fn has_pid(&self, pid: Pid) -> bool {
        self.processes.iter().any(|p| p.pid == pid)
    }

    /// Records `status` against the matching process. Returns false if the
    /// pid is not part of this job.
    pub fn update(&mut self, status: WaitStatus) -> bool {
        let Some(pid) = status.pid() else {
            return false;
        };
        match self.processes.iter_mut().find(|p| p.pid == pid) {
            Some(record) => {
                record.update(status);
                debug!(job = self.id, pid = pid.as_raw(), ?status, "process state changed");
                true
            }
            None => false,
        }
    }

    /// Status of the last stage: exit code, or signal number if it was
    /// killed or stopped.
    pub fn last_status(&self) -> i32 {
        self.processes.last().map_or(0, |p| p.exit_or_signal)
    }

    /// Forgets stop state ahead of sending SIGCONT.
    pub fn mark_running(&mut self) {
        for p in self.processes.iter_mut().filter(|p| !p.completed) {
            p.stopped = false;
        }
        self.notified = false;
    }

    /// Sends `sig` to the whole process group.
    pub fn signal(&self, sig: Signal) -> nix::Result<()> {
        match self.pgid {
            Some(pgid) => signal::killpg(pgid, sig),
            None => Ok(()),
        }
    }

    /// The command as shown by `jobs` and in notifications.
    pub fn command_text(&self) -> String {
        if self.foreground {
            self.display_text.clone()
        } else {
            format!("{} &", self.display_text)
        }
    }

    fn state_word(&self) -> String {
        match self.state() {
            JobState::Running => "Running".into(),
            JobState::Stopped => "Stopped".into(),
            JobState::Completed => match self.processes.last() {
                Some(last) if last.signaled => match Signal::try_from(last.exit_or_signal) {
                    Ok(sig) => format!("Killed ({})", sig.as_str()),
                    Err(_) => format!("Killed ({})", last.exit_or_signal),
                },
                Some(last) if last.exit_or_signal != 0 => format!("Exit {}", last.exit_or_signal),
                _ => "Done".into(),
            },
        }
    }

    /// `[jid] (pgid) State command`
    pub fn status_line(&self) -> String {
        let pgid = self
            .pgid
            .map_or_else(|| "-".to_string(), |p| p.as_raw().to_string());
        format!(
            "[{}] ({}) {} {}",
            self.id,
            pgid,
            self.state_word(),
            self.command_text()
        )
    }
}

/// Which key a job lookup matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Id(JobId),
    Pid(Pid),
    Pgid(Pid),
    /// The job with the highest id.
    MostRecent,
}

/// Restricts a lookup to jobs of a given kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobFilter {
    Any,
    Foreground,
    Background,
    Stopped,
}

impl JobFilter {
    fn accepts(self, job: &Job) -> bool {
        match self {
            JobFilter::Any => true,
            JobFilter::Foreground => job.foreground,
            JobFilter::Background => !job.foreground,
            JobFilter::Stopped => job.is_stopped(),
        }
    }
}

/// Manages the shell's active jobs, in insertion order.
#[derive(Debug)]
pub struct JobList {
    jobs: Vec<Job>,
    next_jid: JobId,
}

impl Default for JobList {
    fn default() -> Self {
        Self::new()
    }
}

impl JobList {
    /// Creates a new, empty job list.
    pub fn new() -> Self {
        JobList {
            jobs: Vec::new(),
            next_jid: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter()
    }

    /// Returns the next job id. Numbering starts over at 1 once the table
    /// has emptied.
    pub fn next_id(&mut self) -> JobId {
        if self.is_empty() {
            self.next_jid = 1;
        }
        let id = self.next_jid;
        self.next_jid += 1;
        id
    }

    /// Adds a job under a fresh id and returns that id.
    pub fn push(&mut self, mut job: Job) -> JobId {
        job.id = self.next_id();
        let id = job.id;
        debug!(job = id, pgid = ?job.pgid, "job added");
        self.jobs.push(job);
        id
    }

    /// Puts back a job that was taken out with [`JobList::remove`],
    /// keeping its id and position.
    pub fn reinsert(&mut self, job: Job) {
        let at = self.jobs.partition_point(|j| j.id < job.id);
        self.next_jid = self.next_jid.max(job.id + 1);
        self.jobs.insert(at, job);
    }

    pub fn position(&self, lookup: Lookup, filter: JobFilter) -> Option<usize> {
        let matches = |job: &Job| {
            filter.accepts(job)
                && match lookup {
                    Lookup::Id(id) => job.id == id,
                    Lookup::Pid(pid) => job.has_pid(pid),
                    Lookup::Pgid(pgid) => job.pgid == Some(pgid),
                    Lookup::MostRecent => true,
                }
        };
        match lookup {
            Lookup::MostRecent => self
                .jobs
                .iter()
                .enumerate()
                .filter(|(_, job)| matches(job))
                .max_by_key(|(_, job)| job.id)
                .map(|(i, _)| i),
            _ => self.jobs.iter().position(matches),
        }
    }

    pub fn get(&self, lookup: Lookup, filter: JobFilter) -> Option<&Job> {
        self.position(lookup, filter).map(|i| &self.jobs[i])
    }

    pub fn get_mut(&mut self, lookup: Lookup, filter: JobFilter) -> Option<&mut Job> {
        self.position(lookup, filter).map(move |i| &mut self.jobs[i])
    }

    /// Removes and returns the job at `index`. Its processes are left alone.
    pub fn remove_at(&mut self, index: usize) -> Job {
        self.jobs.remove(index)
    }

    /// Removes the first job matching `pred`.
    pub fn remove<F: FnMut(&Job) -> bool>(&mut self, mut pred: F) -> Option<Job> {
        let index = self.jobs.iter().position(|job| pred(job))?;
        Some(self.jobs.remove(index))
    }

    /// Records a wait status against whichever job owns the pid.
    pub fn record_status(&mut self, status: WaitStatus) -> bool {
        self.jobs.iter_mut().any(|job| job.update(status))
    }

    /// Turns recorded state changes into user notifications.
    ///
    /// Completed jobs are dropped; background ones are reported. Stopped jobs
    /// are reported once per stop. Running jobs become eligible again.
    pub fn collect_notifications(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        let mut i = 0;
        while i < self.jobs.len() {
            let job = &mut self.jobs[i];
            match job.state() {
                JobState::Completed => {
                    let job = self.remove_at(i);
                    debug!(job = job.id, "job completed");
                    if !job.foreground {
                        lines.push(job.status_line());
                    }
                    continue;
                }
                JobState::Stopped if !job.notified => {
                    job.notified = true;
                    lines.push(job.status_line());
                }
                JobState::Running => job.notified = false,
                JobState::Stopped => {}
            }
            i += 1;
        }
        lines
    }

    /// Drains every pending child state change without blocking, then
    /// prints the resulting notifications.
    pub fn update_and_notify(&mut self) -> Result<()> {
        let _mask = SignalMask::block()?;
        let flags = WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED;
        loop {
            match wait::waitpid(Pid::from_raw(-1), Some(flags)) {
                Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => break,
                Ok(status) => {
                    if !self.record_status(status) {
                        warn!(?status, "reaped a process that belongs to no job");
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!("waitpid: {}", e);
                    break;
                }
            }
        }
        for line in self.collect_notifications() {
            println!("{}", line);
        }
        Ok(())
    }

    /// Kills every remaining job and reaps what it can, without blocking
    /// for long. Used once, at shell exit.
    pub fn harvest_all(&mut self) {
        let _mask = SignalMask::block().ok();
        debug!(jobs = self.len(), "harvesting jobs at exit");
        for job in self.jobs.drain(..) {
            if job.is_completed() {
                continue;
            }
            debug!(job = job.id, "killing job at exit");
            if let Err(e) = job.signal(Signal::SIGKILL) {
                debug!(job = job.id, "killpg: {}", e);
            }
        }

        let mut remaining = true;
        let mut attempts = 0;
        while attempts < HARVEST_ATTEMPTS {
            match wait::waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {
                    attempts += 1;
                    thread::sleep(HARVEST_INTERVAL);
                }
                Ok(_) | Err(Errno::EINTR) => {}
                Err(Errno::ECHILD) => {
                    remaining = false;
                    break;
                }
                Err(e) => {
                    warn!("waitpid: {}", e);
                    break;
                }
            }
        }
        if remaining {
            warn!("some child processes are still running at exit");
        }
    }

    /// Prints the list of jobs.
    pub fn list_jobs(&self) {
        for job in self.iter() {
            println!("{}", job.status_line());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(n: i32) -> Pid {
        Pid::from_raw(n)
    }

    fn job_with(pids: &[i32], foreground: bool) -> Job {
        let mut job = Job::new("sleep 5", foreground);
        job.pgid = Some(pid(pids[0]));
        job.processes = pids.iter().map(|&p| ProcessRecord::new(pid(p))).collect();
        job
    }

    #[test]
    fn ids_restart_only_when_table_empties() {
        let mut jobs = JobList::new();
        assert_eq!(jobs.push(job_with(&[100], false)), 1);
        assert_eq!(jobs.push(job_with(&[200], false)), 2);
        jobs.remove(|j| j.id == 1);
        assert_eq!(jobs.push(job_with(&[300], false)), 3);
        jobs.remove(|_| true);
        jobs.remove(|_| true);
        assert!(jobs.is_empty());
        assert_eq!(jobs.push(job_with(&[400], false)), 1);
    }

    #[test]
    fn lookups_scan_every_process() {
        let mut jobs = JobList::new();
        jobs.push(job_with(&[10, 11, 12], false));
        jobs.push(job_with(&[20, 21], true));

        assert_eq!(jobs.get(Lookup::Pid(pid(12)), JobFilter::Any).map(|j| j.id), Some(1));
        assert_eq!(jobs.get(Lookup::Pid(pid(21)), JobFilter::Any).map(|j| j.id), Some(2));
        assert!(jobs.get(Lookup::Pid(pid(21)), JobFilter::Background).is_none());
        assert_eq!(jobs.get(Lookup::Pgid(pid(20)), JobFilter::Foreground).map(|j| j.id), Some(2));
        assert!(jobs.get(Lookup::Pgid(pid(11)), JobFilter::Any).is_none());
        assert_eq!(jobs.get(Lookup::Id(1), JobFilter::Background).map(|j| j.id), Some(1));
        assert_eq!(jobs.get(Lookup::MostRecent, JobFilter::Any).map(|j| j.id), Some(2));
        assert_eq!(jobs.get(Lookup::MostRecent, JobFilter::Background).map(|j| j.id), Some(1));
        assert!(jobs.get(Lookup::MostRecent, JobFilter::Stopped).is_none());
    }

    #[test]
    fn job_state_follows_its_processes() {
        let mut job = job_with(&[10, 11], true);
        assert_eq!(job.state(), JobState::Running);

        assert!(job.update(WaitStatus::Stopped(pid(10), Signal::SIGTSTP)));
        assert_eq!(job.state(), JobState::Running);
        assert!(job.update(WaitStatus::Stopped(pid(11), Signal::SIGTSTP)));
        assert_eq!(job.state(), JobState::Stopped);
        assert_eq!(job.last_status(), Signal::SIGTSTP as i32);

        assert!(job.update(WaitStatus::Continued(pid(10))));
        assert_eq!(job.state(), JobState::Running);

        assert!(job.update(WaitStatus::Exited(pid(10), 0)));
        assert!(job.update(WaitStatus::Signaled(pid(11), Signal::SIGKILL, false)));
        assert_eq!(job.state(), JobState::Completed);
        assert_eq!(job.last_status(), Signal::SIGKILL as i32);
        assert!(!job.update(WaitStatus::Exited(pid(99), 0)));
    }

    #[test]
    fn completed_background_job_is_reported_and_removed() {
        let mut jobs = JobList::new();
        jobs.push(job_with(&[10], false));
        assert!(jobs.record_status(WaitStatus::Exited(pid(10), 0)));

        let lines = jobs.collect_notifications();
        assert_eq!(lines, vec!["[1] (10) Done sleep 5 &".to_string()]);
        assert!(jobs.is_empty());
    }

    #[test]
    fn completed_foreground_job_is_removed_silently() {
        let mut jobs = JobList::new();
        jobs.push(job_with(&[10], true));
        jobs.record_status(WaitStatus::Exited(pid(10), 3));
        assert!(jobs.collect_notifications().is_empty());
        assert!(jobs.is_empty());
    }

    #[test]
    fn stop_is_reported_once_per_stop() {
        let mut jobs = JobList::new();
        jobs.push(job_with(&[10], false));

        jobs.record_status(WaitStatus::Stopped(pid(10), Signal::SIGTSTP));
        assert_eq!(jobs.collect_notifications(), vec!["[1] (10) Stopped sleep 5 &".to_string()]);
        assert!(jobs.collect_notifications().is_empty());

        jobs.get_mut(Lookup::Id(1), JobFilter::Any).unwrap().mark_running();
        assert!(jobs.collect_notifications().is_empty());

        jobs.record_status(WaitStatus::Stopped(pid(10), Signal::SIGSTOP));
        assert_eq!(jobs.collect_notifications().len(), 1);
    }

    #[test]
    fn continued_status_rearms_notification() {
        let mut jobs = JobList::new();
        jobs.push(job_with(&[10], false));
        jobs.record_status(WaitStatus::Stopped(pid(10), Signal::SIGTSTP));
        assert_eq!(jobs.collect_notifications().len(), 1);

        jobs.record_status(WaitStatus::Continued(pid(10)));
        assert!(jobs.collect_notifications().is_empty());
        assert!(!jobs.get(Lookup::Id(1), JobFilter::Any).unwrap().notified);
    }

    #[test]
    fn reinsert_keeps_id_and_order() {
        let mut jobs = JobList::new();
        jobs.push(job_with(&[10], false));
        jobs.push(job_with(&[20], false));
        jobs.push(job_with(&[30], false));
        let index = jobs.position(Lookup::Id(2), JobFilter::Any).unwrap();
        let job = jobs.remove_at(index);
        jobs.reinsert(job);
        let ids: Vec<_> = jobs.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(jobs.push(job_with(&[40], false)), 4);
    }

    #[test]
    fn status_line_describes_how_the_job_ended() {
        let mut job = job_with(&[10], false);
        job.id = 4;
        job.update(WaitStatus::Exited(pid(10), 2));
        assert_eq!(job.status_line(), "[4] (10) Exit 2 sleep 5 &");

        let mut job = job_with(&[10], true);
        job.id = 1;
        job.update(WaitStatus::Signaled(pid(10), Signal::SIGKILL, false));
        assert_eq!(job.status_line(), "[1] (10) Killed (SIGKILL) sleep 5");
    }
}
