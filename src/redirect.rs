use nix::errno::Errno;
use nix::fcntl::{self, FcntlArg, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{self, AccessFlags};
use std::os::unix::io::RawFd;
use std::path::Path;
use tracing::debug;

use crate::error::{Result, ShellError};
use crate::parser::{RedirectOp, Redirection};

/// Descriptors at or above this are the shell's own bookkeeping slots and
/// are never reachable from a redirection.
pub const RESERVED_FD_BASE: RawFd = 10;

const STDIO_SLOTS: usize = 3;

/// Which of stdin/stdout/stderr were rebound or closed for good.
///
/// A dirty slot must not get the shell's original descriptor back.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DirtySlots([bool; STDIO_SLOTS]);

impl DirtySlots {
    fn mark(&mut self, fd: RawFd) {
        if let Some(slot) = usize::try_from(fd).ok().and_then(|i| self.0.get_mut(i)) {
            *slot = true;
        }
    }

    pub fn is_dirty(&self, fd: RawFd) -> bool {
        usize::try_from(fd)
            .ok()
            .and_then(|i| self.0.get(i).copied())
            .unwrap_or(false)
    }
}

/// Applies `redirections` in order to the current process.
///
/// With `in_child_about_to_exec` set every redirection is applied for real
/// and each rebinding or close of 0/1/2 marks that slot dirty. Otherwise a
/// built-in is about to run inside the shell: everything is validated, but
/// only stdin/stdout/stderr are touched (the caller holds a
/// [`StdioBackup`] for those) and higher descriptors are left alone.
pub fn resolve(redirections: &[Redirection], in_child_about_to_exec: bool) -> Result<DirtySlots> {
    let mut resolver = Resolver {
        in_child: in_child_about_to_exec,
        dirty: DirtySlots::default(),
    };
    for redirection in redirections {
        resolver.apply(redirection)?;
    }
    Ok(resolver.dirty)
}

/// Checks what can be checked before forking: descriptor numbers are in
/// range and input files are readable.
pub fn preflight(redirections: &[Redirection]) -> Result<()> {
    for r in redirections {
        check_range(left_fd(r))?;
        if let Some(right) = r.right_fd {
            check_range(right)?;
        }
        if let (RedirectOp::In, Some(path)) = (r.op, &r.filename) {
            unistd::access(path.as_path(), AccessFlags::R_OK).map_err(|source| {
                ShellError::Open {
                    path: path.clone(),
                    mode: open_mode(r),
                    source,
                }
            })?;
        }
    }
    Ok(())
}

struct Resolver {
    in_child: bool,
    dirty: DirtySlots,
}

impl Resolver {
    fn apply(&mut self, r: &Redirection) -> Result<()> {
        let left = left_fd(r);
        check_range(left)?;
        match r.op {
            RedirectOp::In | RedirectOp::Out | RedirectOp::Clobber | RedirectOp::InOut => {
                let fd = open_target(r)?;
                self.install(fd, &[left])
            }
            RedirectOp::ErrOut => {
                let fd = open_target(r)?;
                self.install(fd, &[1, 2])
            }
            RedirectOp::DupIn | RedirectOp::DupOut => {
                let right = r.right_fd.ok_or(ShellError::BadDescriptor(left))?;
                check_range(right)?;
                check_access(right, r.op)?;
                if !self.applies_to(left) {
                    debug!(fd = left, "skipping dup onto shell descriptor");
                    return Ok(());
                }
                if right != left {
                    unistd::dup2(right, left).map_err(|_| ShellError::BadDescriptor(left))?;
                }
                self.touched(left);
                Ok(())
            }
            RedirectOp::Close => {
                if !self.applies_to(left) {
                    debug!(fd = left, "skipping close of shell descriptor");
                    return Ok(());
                }
                match unistd::close(left) {
                    Ok(()) | Err(Errno::EBADF) => {}
                    Err(_) => return Err(ShellError::BadDescriptor(left)),
                }
                self.touched(left);
                Ok(())
            }
        }
    }

    /// Whether a rebinding of `fd` is carried out in this mode.
    fn applies_to(&self, fd: RawFd) -> bool {
        self.in_child || (fd as usize) < STDIO_SLOTS
    }

    fn touched(&mut self, fd: RawFd) {
        if self.in_child {
            self.dirty.mark(fd);
        }
    }

    /// Moves the freshly opened `fd` onto each of `targets`.
    fn install(&mut self, fd: RawFd, targets: &[RawFd]) -> Result<()> {
        let mut keep_open = false;
        let mut result = Ok(());
        for &target in targets {
            if !self.applies_to(target) {
                debug!(fd = target, "skipping redirection onto shell descriptor");
                continue;
            }
            if target == fd {
                keep_open = true;
            } else if unistd::dup2(fd, target).is_err() {
                result = Err(ShellError::BadDescriptor(target));
                break;
            }
            self.touched(target);
        }
        if !keep_open {
            let _ = unistd::close(fd);
        }
        result
    }
}

/// The descriptor a redirection rebinds when none was written.
fn left_fd(r: &Redirection) -> RawFd {
    r.left_fd.unwrap_or(match r.op {
        RedirectOp::In | RedirectOp::InOut | RedirectOp::DupIn => 0,
        RedirectOp::Out
        | RedirectOp::Clobber
        | RedirectOp::ErrOut
        | RedirectOp::DupOut
        | RedirectOp::Close => 1,
    })
}

fn check_range(fd: RawFd) -> Result<()> {
    if (0..RESERVED_FD_BASE).contains(&fd) {
        Ok(())
    } else {
        Err(ShellError::BadDescriptor(fd))
    }
}

fn check_access(fd: RawFd, op: RedirectOp) -> Result<()> {
    let flags = fcntl::fcntl(fd, FcntlArg::F_GETFL).map_err(|_| ShellError::BadDescriptor(fd))?;
    let flags = OFlag::from_bits_truncate(flags);
    if access_allows(flags, op) {
        Ok(())
    } else {
        let access = if op == RedirectOp::DupIn { "reading" } else { "writing" };
        Err(ShellError::DescriptorAccess { fd, access })
    }
}

fn access_allows(flags: OFlag, op: RedirectOp) -> bool {
    let mode = flags & OFlag::O_ACCMODE;
    match op {
        RedirectOp::DupIn => mode == OFlag::O_RDONLY || mode == OFlag::O_RDWR,
        RedirectOp::DupOut => mode == OFlag::O_WRONLY || mode == OFlag::O_RDWR,
        _ => true,
    }
}

fn open_flags(r: &Redirection) -> OFlag {
    let write = if r.append { OFlag::O_APPEND } else { OFlag::O_TRUNC };
    match r.op {
        RedirectOp::In => OFlag::O_RDONLY,
        RedirectOp::InOut => OFlag::O_RDWR | OFlag::O_CREAT,
        _ => OFlag::O_WRONLY | OFlag::O_CREAT | write,
    }
}

fn open_mode(r: &Redirection) -> &'static str {
    match r.op {
        RedirectOp::In => "reading",
        RedirectOp::InOut => "reading and writing",
        _ if r.append => "appending",
        _ => "writing",
    }
}

fn open_target(r: &Redirection) -> Result<RawFd> {
    let path = r.filename.as_deref().unwrap_or(Path::new(""));
    fcntl::open(path, open_flags(r), Mode::from_bits_truncate(0o666)).map_err(|source| {
        ShellError::Open {
            path: path.to_path_buf(),
            mode: open_mode(r),
            source,
        }
    })
}

/// Copies of the shell's stdin/stdout/stderr, parked in the reserved range
/// while a built-in runs with its redirections in place.
#[derive(Debug)]
pub struct StdioBackup {
    saved: [Option<RawFd>; STDIO_SLOTS],
}

impl StdioBackup {
    pub fn save() -> StdioBackup {
        let mut saved = [None; STDIO_SLOTS];
        for (fd, slot) in saved.iter_mut().enumerate() {
            *slot = fcntl::fcntl(fd as RawFd, FcntlArg::F_DUPFD_CLOEXEC(RESERVED_FD_BASE)).ok();
        }
        StdioBackup { saved }
    }

    /// Puts the shell's descriptors back, except in dirty slots.
    pub fn restore(self, dirty: DirtySlots) {
        for (fd, saved) in self.saved.iter().enumerate() {
            let fd = fd as RawFd;
            if !dirty.is_dirty(fd) {
                match saved {
                    Some(backup) => {
                        let _ = unistd::dup2(*backup, fd);
                    }
                    None => {
                        let _ = unistd::close(fd);
                    }
                }
            }
            if let Some(backup) = saved {
                let _ = unistd::close(*backup);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn redirection(op: RedirectOp, left_fd: Option<RawFd>) -> Redirection {
        Redirection {
            left_fd,
            right_fd: None,
            filename: None,
            op,
            append: false,
        }
    }

    #[test]
    fn unnumbered_redirections_pick_the_natural_descriptor() {
        assert_eq!(left_fd(&redirection(RedirectOp::In, None)), 0);
        assert_eq!(left_fd(&redirection(RedirectOp::InOut, None)), 0);
        assert_eq!(left_fd(&redirection(RedirectOp::Out, None)), 1);
        assert_eq!(left_fd(&redirection(RedirectOp::Close, None)), 1);
        assert_eq!(left_fd(&redirection(RedirectOp::Out, Some(2))), 2);
    }

    #[test]
    fn reserved_descriptors_are_out_of_range() {
        assert!(check_range(0).is_ok());
        assert!(check_range(9).is_ok());
        assert!(matches!(check_range(RESERVED_FD_BASE), Err(ShellError::BadDescriptor(10))));
        assert!(matches!(check_range(-1), Err(ShellError::BadDescriptor(-1))));
    }

    #[test]
    fn dup_needs_matching_access_mode() {
        assert!(access_allows(OFlag::O_RDONLY, RedirectOp::DupIn));
        assert!(access_allows(OFlag::O_RDWR, RedirectOp::DupIn));
        assert!(!access_allows(OFlag::O_WRONLY, RedirectOp::DupIn));
        assert!(access_allows(OFlag::O_WRONLY | OFlag::O_APPEND, RedirectOp::DupOut));
        assert!(!access_allows(OFlag::O_RDONLY, RedirectOp::DupOut));
    }

    #[test]
    fn output_truncates_unless_appending() {
        let mut r = redirection(RedirectOp::Out, None);
        assert!(open_flags(&r).contains(OFlag::O_TRUNC));
        r.append = true;
        assert!(open_flags(&r).contains(OFlag::O_APPEND));
        assert!(!open_flags(&r).contains(OFlag::O_TRUNC));
        assert_eq!(open_mode(&r), "appending");
        assert_eq!(open_flags(&redirection(RedirectOp::In, None)), OFlag::O_RDONLY);
    }

    #[test]
    fn preflight_names_missing_input_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut r = redirection(RedirectOp::In, Some(0));
        r.filename = Some(dir.path().join("missing_file"));
        let err = preflight(&[r]).unwrap_err();
        assert!(err.to_string().contains("missing_file"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn preflight_accepts_readable_input_and_rejects_reserved_dup() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut r = redirection(RedirectOp::In, None);
        r.filename = Some(PathBuf::from(file.path()));
        assert!(preflight(&[r]).is_ok());

        let mut dup = redirection(RedirectOp::DupOut, Some(2));
        dup.right_fd = Some(12);
        assert!(matches!(preflight(&[dup]), Err(ShellError::BadDescriptor(12))));
    }

    #[test]
    fn dirty_slots_only_track_stdio() {
        let mut dirty = DirtySlots::default();
        dirty.mark(1);
        dirty.mark(7);
        assert!(dirty.is_dirty(1));
        assert!(!dirty.is_dirty(0));
        assert!(!dirty.is_dirty(7));
    }
}
