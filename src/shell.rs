use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::error::Result;
use crate::exec::run_pipeline_list;
use crate::jobs::JobList;
use crate::parser::parse_command_line;
use crate::signals;
use crate::terminal::Terminal;

/// Global prompt string.
pub static PROMPT: &str = "jobsh> ";

const HISTORY_FILE: &str = ".jobsh_history";

/// Status of a line that failed to parse.
const SYNTAX_ERROR_STATUS: i32 = 2;

/// Status after the user interrupted the line being typed.
const INTERRUPTED_STATUS: i32 = 130;

/// Command-line options of the shell.
#[derive(Debug, Clone)]
pub struct Options {
    /// Print a prompt before reading each line.
    pub emit_prompt: bool,
    pub verbose: bool,
    /// Run this one line instead of reading input (`-c`).
    pub command: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            emit_prompt: true,
            verbose: false,
            command: None,
        }
    }
}

/// Everything the executor and built-ins share: the job table, the
/// terminal, and the status of the last pipeline.
pub struct Shell {
    pub jobs: JobList,
    pub terminal: Terminal,
    pub last_status: i32,
    pub options: Options,
    /// Set in a forked stage; built-ins then must not touch the job table.
    pub in_child: bool,
}

impl Shell {
    pub fn new(options: Options) -> Result<Shell> {
        let terminal = Terminal::init()?;
        signals::install_signal_handlers()?;
        debug!(interactive = terminal.is_interactive(), "shell initialized");
        Ok(Shell {
            jobs: JobList::new(),
            terminal,
            last_status: 0,
            options,
            in_child: false,
        })
    }

    /// Runs until end of input (or the single `-c` line) and returns the
    /// shell's exit status.
    pub fn run(&mut self) -> i32 {
        if let Some(line) = self.options.command.clone() {
            self.run_or_die(&line);
        } else if self.terminal.is_interactive() && self.options.emit_prompt {
            self.run_editor();
        } else {
            self.run_plain();
        }
        self.shutdown_harvest();
        self.last_status
    }

    /// Reads lines with the line editor, keeping history in the home
    /// directory.
    fn run_editor(&mut self) {
        let mut editor = match DefaultEditor::new() {
            Ok(editor) => editor,
            Err(e) => {
                warn!("line editor unavailable: {}", e);
                return self.run_plain();
            }
        };
        let history = history_path();
        if let Some(path) = &history {
            let _ = editor.load_history(path);
        }

        loop {
            self.poll_signals();
            match editor.readline(PROMPT) {
                Ok(line) => {
                    if !line.trim().is_empty() {
                        let _ = editor.add_history_entry(line.as_str());
                    }
                    self.run_or_die(&line);
                }
                Err(ReadlineError::Interrupted) => self.last_status = INTERRUPTED_STATUS,
                Err(ReadlineError::Eof) => break,
                Err(e) => {
                    eprintln!("jobsh: error reading input: {}", e);
                    break;
                }
            }
        }

        if let Some(path) = &history {
            if let Err(e) = editor.save_history(path) {
                debug!("saving history: {}", e);
            }
        }
    }

    /// Reads lines straight from stdin, as when input is a script or pipe.
    fn run_plain(&mut self) {
        let stdin = io::stdin();
        loop {
            self.poll_signals();
            if self.options.emit_prompt {
                print!("{}", PROMPT);
                let _ = io::stdout().flush();
            }

            let mut cmdline = String::new();
            match stdin.lock().read_line(&mut cmdline) {
                Ok(0) => break,
                Ok(_) => self.run_or_die(&cmdline),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    eprintln!("jobsh: error reading input: {}", e);
                    break;
                }
            }
        }
    }

    fn run_or_die(&mut self, line: &str) {
        if let Err(e) = self.run_line(line) {
            eprintln!("jobsh: {}", e);
            self.shutdown_harvest();
            let _ = io::stdout().flush();
            std::process::exit(1);
        }
    }

    /// Parses and runs one input line. Only fatal errors are returned.
    pub fn run_line(&mut self, line: &str) -> Result<()> {
        if line.trim().is_empty() {
            return Ok(());
        }
        debug!(line = line.trim_end(), "received command");
        let pipelines = match parse_command_line(line, self.last_status) {
            Ok(pipelines) => pipelines,
            Err(e) => {
                eprintln!("jobsh: {}", e);
                self.last_status = SYNTAX_ERROR_STATUS;
                return Ok(());
            }
        };
        let status = run_pipeline_list(self, &pipelines)?;
        self.last_status = status;
        let _ = io::stdout().flush();
        Ok(())
    }

    /// Reaps finished and stopped children and prints what changed.
    pub fn reap_and_notify(&mut self) {
        if let Err(e) = self.jobs.update_and_notify() {
            warn!("updating jobs: {}", e);
        }
        let _ = io::stdout().flush();
    }

    /// Kills and reaps every job the shell still owns, then hands the
    /// terminal back.
    pub fn shutdown_harvest(&mut self) {
        self.jobs.harvest_all();
        self.terminal.release();
    }

    /// Handles whatever the signal handlers flagged since the last prompt.
    fn poll_signals(&mut self) {
        if signals::take_child_pending() {
            self.reap_and_notify();
        }
        if signals::take_interrupt() {
            debug!("interrupted at prompt");
            if self.options.emit_prompt {
                println!();
            }
        }
        if signals::take_resize() {
            debug!("terminal resized");
        }
    }
}

fn history_path() -> Option<PathBuf> {
    dirs_next::home_dir().map(|home| home.join(HISTORY_FILE))
}
