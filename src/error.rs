use std::io;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use thiserror::Error;

/// Syntax errors reported by the command-line parser.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unterminated {0} quote")]
    UnterminatedQuote(char),
    #[error("syntax error near unexpected token `{0}'")]
    UnexpectedToken(String),
    #[error("syntax error: unexpected end of line")]
    UnexpectedEnd,
    #[error("missing target for redirection `{0}'")]
    MissingRedirectTarget(String),
    #[error("{0}: ambiguous redirect")]
    BadDescriptorWord(String),
}

/// Everything that can go wrong while running a command line.
#[derive(Debug, Error)]
pub enum ShellError {
    #[error("{}: cannot open for {mode}: {source}", path.display())]
    Open {
        path: PathBuf,
        mode: &'static str,
        source: nix::Error,
    },
    #[error("{0}: bad file descriptor")]
    BadDescriptor(RawFd),
    #[error("{fd}: descriptor not open for {access}")]
    DescriptorAccess { fd: RawFd, access: &'static str },
    #[error("{0}: command not found")]
    CommandNotFound(String),
    #[error("{program}: {source}")]
    Exec {
        program: String,
        source: nix::Error,
    },
    #[error("{context}: {source}")]
    Sys {
        context: &'static str,
        source: nix::Error,
    },
    #[error("{0}: no such job")]
    NoSuchJob(String),
    #[error("no current job")]
    NoCurrentJob,
    #[error("no suitable background job")]
    NoSuitableJob,
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl ShellError {
    /// Wraps a failed system call that leaves the shell unable to continue.
    pub fn sys(context: &'static str) -> impl FnOnce(nix::Error) -> ShellError {
        move |source| ShellError::Sys { context, source }
    }

    /// Process or pipe creation failures; the shell cannot work around these.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ShellError::Sys { .. })
    }
}

pub type Result<T> = std::result::Result<T, ShellError>;

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;

    #[test]
    fn open_error_names_file_and_mode() {
        let err = ShellError::Open {
            path: PathBuf::from("missing_file"),
            mode: "reading",
            source: Errno::ENOENT,
        };
        let msg = err.to_string();
        assert!(msg.contains("missing_file"));
        assert!(msg.contains("reading"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn only_system_failures_are_fatal() {
        assert!(ShellError::sys("fork")(Errno::EAGAIN).is_fatal());
        assert!(!ShellError::NoCurrentJob.is_fatal());
        assert!(!ShellError::CommandNotFound("nope".into()).is_fatal());
    }
}
