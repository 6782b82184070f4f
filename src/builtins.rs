use nix::unistd::Pid;
use std::env;
use std::io::{self, Write};
use std::path::PathBuf;

use crate::error::{Result, ShellError};
use crate::exec;
use crate::jobs::{JobFilter, JobId, Lookup};
use crate::shell::Shell;
use crate::signals;

/// Commands implemented inside the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinKind {
    Exit,
    Cd,
    Jobs,
    Fg,
    Bg,
    Export,
    Unset,
    Exec,
}

impl BuiltinKind {
    pub fn lookup(name: &str) -> Option<BuiltinKind> {
        let kind = match name {
            "exit" | "quit" => BuiltinKind::Exit,
            "cd" => BuiltinKind::Cd,
            "jobs" => BuiltinKind::Jobs,
            "fg" => BuiltinKind::Fg,
            "bg" => BuiltinKind::Bg,
            "export" => BuiltinKind::Export,
            "unset" => BuiltinKind::Unset,
            "exec" => BuiltinKind::Exec,
            _ => return None,
        };
        Some(kind)
    }
}

/// Runs a built-in and returns its exit status. Errors are reported here.
pub fn run_builtin(shell: &mut Shell, kind: BuiltinKind, argv: &[String]) -> i32 {
    let result = match kind {
        BuiltinKind::Exit => builtin_exit(shell, argv),
        BuiltinKind::Cd => builtin_cd(argv),
        BuiltinKind::Jobs => {
            if !shell.in_child {
                shell.reap_and_notify();
            }
            shell.jobs.list_jobs();
            Ok(0)
        }
        BuiltinKind::Fg => builtin_fg_bg(shell, argv, true),
        BuiltinKind::Bg => builtin_fg_bg(shell, argv, false),
        BuiltinKind::Export => builtin_export(argv),
        BuiltinKind::Unset => {
            for name in &argv[1..] {
                env::remove_var(name);
            }
            Ok(0)
        }
        BuiltinKind::Exec => builtin_exec(shell, argv),
    };
    let status = match result {
        Ok(status) => status,
        Err(e) => {
            eprintln!("jobsh: {}: {}", argv[0], e);
            1
        }
    };
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
    status
}

fn builtin_exit(shell: &mut Shell, argv: &[String]) -> Result<i32> {
    let code = match argv.get(1) {
        Some(arg) => arg
            .parse::<i32>()
            .map_err(|_| ShellError::Usage(format!("{}: numeric argument required", arg)))?,
        None => shell.last_status,
    };
    if shell.in_child {
        return Ok(code);
    }
    shell.shutdown_harvest();
    let _ = io::stdout().flush();
    std::process::exit(code);
}

fn builtin_cd(argv: &[String]) -> Result<i32> {
    let target = match argv.get(1).map(String::as_str) {
        None => dirs_next::home_dir().ok_or_else(|| ShellError::Usage("HOME not set".into()))?,
        Some("-") => {
            let dir = env::var_os("OLDPWD").ok_or_else(|| ShellError::Usage("OLDPWD not set".into()))?;
            println!("{}", dir.to_string_lossy());
            PathBuf::from(dir)
        }
        Some(dir) => PathBuf::from(dir),
    };
    let previous = env::current_dir().ok();
    env::set_current_dir(&target)
        .map_err(|e| ShellError::Usage(format!("{}: {}", target.display(), e)))?;
    if let Some(previous) = previous {
        env::set_var("OLDPWD", previous);
    }
    if let Ok(now) = env::current_dir() {
        env::set_var("PWD", now);
    }
    Ok(0)
}

/// How a job was named on the command line.
fn parse_job_spec(spec: Option<&str>) -> Option<Lookup> {
    match spec {
        None | Some("%") | Some("%%") | Some("%+") => Some(Lookup::MostRecent),
        Some(spec) => match spec.strip_prefix('%') {
            Some(id) => id.parse::<JobId>().ok().map(Lookup::Id),
            None => spec
                .parse::<i32>()
                .ok()
                .filter(|pid| *pid > 0)
                .map(|pid| Lookup::Pid(Pid::from_raw(pid))),
        },
    }
}

fn builtin_fg_bg(shell: &mut Shell, argv: &[String], foreground: bool) -> Result<i32> {
    if shell.in_child {
        return Err(ShellError::Usage("no job control in this context".into()));
    }
    shell.reap_and_notify();

    let spec = argv.get(1).map(String::as_str);
    let lookup = parse_job_spec(spec)
        .ok_or_else(|| ShellError::NoSuchJob(spec.unwrap_or_default().to_string()))?;
    let filter = match (lookup, foreground) {
        (Lookup::MostRecent, false) => JobFilter::Stopped,
        _ => JobFilter::Any,
    };
    // A bare number names a member process or, failing that, a group.
    let found = shell.jobs.get(lookup, filter).or_else(|| match lookup {
        Lookup::Pid(pid) => shell.jobs.get(Lookup::Pgid(pid), filter),
        _ => None,
    });
    let id = match found {
        Some(job) => job.id,
        None => {
            return Err(match (lookup, foreground) {
                (Lookup::MostRecent, true) => ShellError::NoCurrentJob,
                (Lookup::MostRecent, false) => ShellError::NoSuitableJob,
                _ => ShellError::NoSuchJob(spec.unwrap_or_default().to_string()),
            })
        }
    };
    exec::continue_job(shell, id, foreground)
}

fn builtin_export(argv: &[String]) -> Result<i32> {
    if argv.len() == 1 {
        let mut vars: Vec<_> = env::vars().collect();
        vars.sort();
        for (name, value) in vars {
            println!("export {}={:?}", name, value);
        }
        return Ok(0);
    }
    for arg in &argv[1..] {
        let (name, value) = match arg.split_once('=') {
            Some((name, value)) => (name, Some(value)),
            None => (arg.as_str(), None),
        };
        if !is_valid_name(name) {
            return Err(ShellError::Usage(format!("`{}': not a valid identifier", arg)));
        }
        if let Some(value) = value {
            env::set_var(name, value);
        }
    }
    Ok(0)
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// `exec` with no program keeps its redirections (the caller already
/// applied them for good). With a program, the shell image is replaced.
fn builtin_exec(shell: &mut Shell, argv: &[String]) -> Result<i32> {
    if argv.len() == 1 {
        return Ok(0);
    }
    let _ = io::stdout().flush();
    signals::default_job_control_signals();
    let err = exec::exec_program(&argv[1..]);
    if shell.terminal.is_interactive() && !shell.in_child {
        signals::ignore_job_control_signals()?;
    }
    eprintln!("jobsh: {}", err);
    Ok(exec::exec_failure_status(&err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_knows_every_builtin() {
        assert_eq!(BuiltinKind::lookup("quit"), Some(BuiltinKind::Exit));
        assert_eq!(BuiltinKind::lookup("exit"), Some(BuiltinKind::Exit));
        assert_eq!(BuiltinKind::lookup("fg"), Some(BuiltinKind::Fg));
        assert_eq!(BuiltinKind::lookup("exec"), Some(BuiltinKind::Exec));
        assert_eq!(BuiltinKind::lookup("ls"), None);
    }

    #[test]
    fn job_specs() {
        assert_eq!(parse_job_spec(None), Some(Lookup::MostRecent));
        assert_eq!(parse_job_spec(Some("%%")), Some(Lookup::MostRecent));
        assert_eq!(parse_job_spec(Some("%3")), Some(Lookup::Id(3)));
        assert_eq!(parse_job_spec(Some("1234")), Some(Lookup::Pid(Pid::from_raw(1234))));
        assert_eq!(parse_job_spec(Some("%x")), None);
        assert_eq!(parse_job_spec(Some("-5")), None);
    }

    #[test]
    fn export_rejects_bad_names() {
        assert!(is_valid_name("PATH"));
        assert!(is_valid_name("_x1"));
        assert!(!is_valid_name("1x"));
        assert!(!is_valid_name(""));
        assert!(builtin_export(&["export".into(), "9bad=1".into()]).is_err());
    }
}
