use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use once_cell::sync::Lazy;
use signal_hook::consts::signal::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Result, ShellError};

// Each handler only raises its flag; the work happens on the main flow.
static CHILD_PENDING: Lazy<Arc<AtomicBool>> = Lazy::new(|| Arc::new(AtomicBool::new(false)));
static INTERRUPTED: Lazy<Arc<AtomicBool>> = Lazy::new(|| Arc::new(AtomicBool::new(false)));
static RESIZED: Lazy<Arc<AtomicBool>> = Lazy::new(|| Arc::new(AtomicBool::new(false)));

/// Signals the shell handles for its whole lifetime.
const HANDLED: [Signal; 3] = [Signal::SIGCHLD, Signal::SIGINT, Signal::SIGWINCH];

/// Signals an interactive shell ignores so that job control works.
const JOB_CONTROL: [Signal; 4] = [
    Signal::SIGTSTP,
    Signal::SIGTTIN,
    Signal::SIGTTOU,
    Signal::SIGQUIT,
];

/// Installs signal handlers for the shell, including:
/// - SIGCHLD: marks that children changed state and need reaping.
/// - SIGINT: (Ctrl-C) marks that the prompt should be redrawn. The foreground
///   job gets its own copy from the terminal driver.
/// - SIGWINCH: marks that the terminal size changed.
pub fn install_signal_handlers() -> Result<()> {
    signal_hook::flag::register(SIGCHLD, Arc::clone(&CHILD_PENDING))?;
    signal_hook::flag::register(SIGINT, Arc::clone(&INTERRUPTED))?;
    signal_hook::flag::register(SIGWINCH, Arc::clone(&RESIZED))?;
    Ok(())
}

/// Ignores the job-control signals; only done by an interactive shell.
pub fn ignore_job_control_signals() -> Result<()> {
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    for sig in JOB_CONTROL {
        unsafe { signal::sigaction(sig, &ignore) }.map_err(ShellError::sys("sigaction"))?;
    }
    Ok(())
}

/// Undoes [`ignore_job_control_signals`] before the shell replaces itself.
/// Caught signals reset on their own across exec; ignored ones do not.
pub fn default_job_control_signals() {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for sig in JOB_CONTROL {
        let _ = unsafe { signal::sigaction(sig, &default) };
    }
}

/// Puts every disposition the shell touched back to default and clears the
/// signal mask. Called in a forked child before it runs anything.
pub fn reset_for_child() {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for sig in HANDLED.iter().chain(JOB_CONTROL.iter()) {
        let _ = unsafe { signal::sigaction(*sig, &default) };
    }
    let _ = signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None);
}

/// Returns true (once) if a SIGCHLD arrived since the last call.
pub fn take_child_pending() -> bool {
    CHILD_PENDING.swap(false, Ordering::SeqCst)
}

/// Returns true (once) if a SIGINT arrived since the last call.
pub fn take_interrupt() -> bool {
    INTERRUPTED.swap(false, Ordering::SeqCst)
}

/// Returns true (once) if a SIGWINCH arrived since the last call.
pub fn take_resize() -> bool {
    RESIZED.swap(false, Ordering::SeqCst)
}

/// Blocks the shell's handled signals until dropped.
///
/// Hold one around any read-then-write sequence on the job table.
#[must_use]
pub struct SignalMask {
    previous: SigSet,
}

impl SignalMask {
    pub fn block() -> Result<SignalMask> {
        let mut set = SigSet::empty();
        for sig in HANDLED {
            set.add(sig);
        }
        let mut previous = SigSet::empty();
        signal::sigprocmask(SigmaskHow::SIG_BLOCK, Some(&set), Some(&mut previous))
            .map_err(ShellError::sys("sigprocmask"))?;
        Ok(SignalMask { previous })
    }
}

impl Drop for SignalMask {
    fn drop(&mut self) {
        let _ = signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_guard_restores_previous_mask() {
        let before = SigSet::thread_get_mask().unwrap();
        {
            let _guard = SignalMask::block().unwrap();
            let inside = SigSet::thread_get_mask().unwrap();
            assert!(inside.contains(Signal::SIGCHLD));
            assert!(inside.contains(Signal::SIGWINCH));
        }
        let after = SigSet::thread_get_mask().unwrap();
        assert_eq!(before.contains(Signal::SIGCHLD), after.contains(Signal::SIGCHLD));
        assert_eq!(before.contains(Signal::SIGINT), after.contains(Signal::SIGINT));
    }

    #[test]
    fn pending_flags_are_consumed_once() {
        RESIZED.store(true, Ordering::SeqCst);
        assert!(take_resize());
        assert!(!take_resize());
    }
}
