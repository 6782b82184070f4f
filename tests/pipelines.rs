use std::fs;
use std::path::Path;
use std::process::{Command, Output};

fn jobsh(line: &str, dir: Option<&Path>) -> Output {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_jobsh"));
    cmd.arg("-c").arg(line);
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    cmd.output().expect("failed to run jobsh")
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

#[test]
fn two_stage_pipeline_passes_bytes_through() {
    let out = jobsh("echo hi | wc -c", None);
    assert_eq!(out.status.code(), Some(0));
    assert_eq!(stdout(&out).trim(), "3");
}

#[test]
fn output_redirection_truncates_and_appends() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("f"), "old contents\n").unwrap();
    let out = jobsh("echo one > f; echo two > f; echo three >> f", Some(dir.path()));
    assert_eq!(out.status.code(), Some(0));
    assert_eq!(fs::read_to_string(dir.path().join("f")).unwrap(), "two\nthree\n");
}

#[test]
fn missing_input_file_is_named_and_fails() {
    let dir = tempfile::tempdir().unwrap();
    let out = jobsh("cat < missing_file", Some(dir.path()));
    assert_ne!(out.status.code(), Some(0));
    assert!(stderr(&out).contains("missing_file"), "stderr: {}", stderr(&out));
}

#[test]
fn later_pipelines_still_run_after_a_failed_one() {
    let dir = tempfile::tempdir().unwrap();
    let out = jobsh("cat < missing_file; echo still here", Some(dir.path()));
    assert_eq!(stdout(&out), "still here\n");
    assert_eq!(out.status.code(), Some(0));
}

#[test]
fn and_or_short_circuit() {
    let out = jobsh("false && echo no", None);
    assert_eq!(stdout(&out), "");
    assert_eq!(out.status.code(), Some(1));

    let out = jobsh("false || echo yes", None);
    assert_eq!(stdout(&out), "yes\n");
    assert_eq!(out.status.code(), Some(0));

    let out = jobsh("true && echo a || echo b", None);
    assert_eq!(stdout(&out), "a\n");
}

#[test]
fn stderr_can_join_stdout_in_a_pipe() {
    let out = jobsh("sh -c 'echo err >&2' 2>&1 | cat", None);
    assert_eq!(stdout(&out), "err\n");
    assert_eq!(stderr(&out), "");
}

#[test]
fn closing_stdin_leaves_stdout_working() {
    let out = jobsh("sh -c 'echo out' <&-", None);
    assert_eq!(stdout(&out), "out\n");
    assert_eq!(out.status.code(), Some(0));
}

#[test]
fn builtin_redirection_leaves_shell_stdout_alone() {
    let dir = tempfile::tempdir().unwrap();
    let out = jobsh("jobs > listing; echo after", Some(dir.path()));
    assert_eq!(stdout(&out), "after\n");
    assert!(dir.path().join("listing").exists());
}

#[test]
fn unknown_program_exits_127() {
    let out = jobsh("definitely-not-a-command-jobsh", None);
    assert_eq!(out.status.code(), Some(127));
    assert!(stderr(&out).contains("command not found"));
}

#[test]
fn syntax_error_exits_2() {
    let out = jobsh("echo 'unterminated", None);
    assert_eq!(out.status.code(), Some(2));
    assert!(stderr(&out).contains("quote"));
}

#[test]
fn killed_stage_reports_signal_number() {
    let out = jobsh("sh -c 'kill -TERM $$'", None);
    assert_eq!(out.status.code(), Some(15));
}

#[test]
fn exit_and_cd_builtins() {
    assert_eq!(jobsh("exit 3", None).status.code(), Some(3));

    let out = jobsh("cd /; pwd", None);
    assert_eq!(stdout(&out), "/\n");
}

#[test]
fn environment_bindings_reach_only_their_command() {
    let out = jobsh("JOBSH_T=inner sh -c 'echo $JOBSH_T'; echo \"[$JOBSH_T]\"", None);
    assert_eq!(stdout(&out), "inner\n[]\n");
}

#[cfg(target_os = "linux")]
#[test]
fn pipes_do_not_leak_into_children() {
    let alone = jobsh("ls /proc/self/fd", None);
    let piped = jobsh("ls /proc/self/fd | cat", None);
    assert_eq!(stdout(&alone), stdout(&piped));
}

#[cfg(target_os = "linux")]
#[test]
fn shell_holds_no_pipe_ends_after_launch() {
    let before = jobsh("ls /proc/$$/fd", None);
    let after = jobsh("true | true | true; ls /proc/$$/fd", None);
    assert_eq!(stdout(&before), stdout(&after));
    let fds: Vec<i32> = stdout(&after).lines().filter_map(|l| l.parse().ok()).collect();
    assert!(fds.starts_with(&[0, 1, 2]), "fds: {:?}", fds);
    assert!(fds.iter().all(|&fd| fd < 10), "fds: {:?}", fds);
}
