mod builtins;
mod error;
mod exec;
mod jobs;
mod parser;
mod redirect;
mod shell;
mod signals;
mod terminal;
mod utils;

use std::env;
use std::process;

use shell::{Options, Shell};

fn main() {
    // Parse command-line arguments.
    let mut options = Options::default();
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" => utils::print_usage(),
            "-v" => options.verbose = true,
            "-p" => options.emit_prompt = false,
            "-c" => match args.next() {
                Some(line) => options.command = Some(line),
                None => utils::error("-c: option requires an argument"),
            },
            _ => utils::print_usage(),
        }
    }

    utils::init_logging(options.verbose);

    let mut shell = match Shell::new(options) {
        Ok(shell) => shell,
        Err(e) => utils::error(&e.to_string()),
    };
    process::exit(shell.run());
}
