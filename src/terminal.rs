use nix::libc::STDIN_FILENO;
use nix::sys::signal::{self, Signal};
use nix::sys::termios::{self, SetArg, Termios};
use nix::unistd::{self, Pid};
use std::os::unix::io::RawFd;
use tracing::debug;

use crate::error::{Result, ShellError};
use crate::signals;

/// The shell's view of its controlling terminal.
///
/// A non-interactive shell (stdin is not a terminal) never touches the
/// terminal; every method is then a no-op.
#[derive(Debug)]
pub struct Terminal {
    fd: RawFd,
    interactive: bool,
    shell_pgid: Pid,
    /// Foreground group found at start-up, given the terminal back at exit.
    original_pgid: Pid,
    shell_modes: Option<Termios>,
}

impl Terminal {
    /// Takes control of the terminal if stdin is one.
    ///
    /// Waits until the shell is in the foreground, moves it into its own
    /// process group and saves the terminal modes to restore after each job.
    pub fn init() -> Result<Terminal> {
        let fd = STDIN_FILENO;
        if !unistd::isatty(fd).unwrap_or(false) {
            let pgid = unistd::getpgrp();
            return Ok(Terminal {
                fd,
                interactive: false,
                shell_pgid: pgid,
                original_pgid: pgid,
                shell_modes: None,
            });
        }

        loop {
            let pgrp = unistd::getpgrp();
            match unistd::tcgetpgrp(fd) {
                Ok(owner) if owner == pgrp => break,
                Ok(_) => {
                    let _ = signal::killpg(pgrp, Signal::SIGTTIN);
                }
                Err(e) => return Err(ShellError::sys("tcgetpgrp")(e)),
            }
        }

        let original_pgid = unistd::getpgrp();
        signals::ignore_job_control_signals()?;

        let shell_pgid = unistd::getpid();
        // EPERM here means we already lead a session; the group is ours anyway.
        if let Err(e) = unistd::setpgid(shell_pgid, shell_pgid) {
            debug!("setpgid for shell: {}", e);
        }
        let shell_pgid = unistd::getpgrp();
        unistd::tcsetpgrp(fd, shell_pgid).map_err(ShellError::sys("tcsetpgrp"))?;
        let shell_modes = termios::tcgetattr(fd).ok();
        debug!(pgid = shell_pgid.as_raw(), "shell owns the terminal");

        Ok(Terminal {
            fd,
            interactive: true,
            shell_pgid,
            original_pgid,
            shell_modes,
        })
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    /// Hands the terminal to `pgid`, restoring the job's own modes if it has
    /// been in the foreground before.
    pub fn give_to(&self, pgid: Pid, modes: Option<&Termios>) {
        if !self.interactive {
            return;
        }
        if let Err(e) = unistd::tcsetpgrp(self.fd, pgid) {
            debug!(pgid = pgid.as_raw(), "tcsetpgrp to job: {}", e);
        }
        if let Some(modes) = modes {
            let _ = termios::tcsetattr(self.fd, SetArg::TCSADRAIN, modes);
        }
    }

    /// Takes the terminal back after a foreground job finished or stopped.
    ///
    /// Returns the modes the job left behind so they can be restored when it
    /// is continued in the foreground.
    pub fn reclaim(&self) -> Option<Termios> {
        if !self.interactive {
            return None;
        }
        if let Err(e) = unistd::tcsetpgrp(self.fd, self.shell_pgid) {
            debug!("tcsetpgrp to shell: {}", e);
        }
        let job_modes = termios::tcgetattr(self.fd).ok();
        if let Some(modes) = &self.shell_modes {
            let _ = termios::tcsetattr(self.fd, SetArg::TCSADRAIN, modes);
        }
        job_modes
    }

    /// Returns the terminal to whoever owned it before the shell started.
    pub fn release(&self) {
        if !self.interactive {
            return;
        }
        if let Some(modes) = &self.shell_modes {
            let _ = termios::tcsetattr(self.fd, SetArg::TCSADRAIN, modes);
        }
        if let Err(e) = unistd::tcsetpgrp(self.fd, self.original_pgid) {
            debug!(pgid = self.original_pgid.as_raw(), "tcsetpgrp on exit: {}", e);
        }
    }
}
