use std::io;
use std::process;
use tracing_subscriber::EnvFilter;

/// Environment variable holding a log filter such as `jobsh=debug`.
pub const LOG_ENV: &str = "JOBSH_LOG";

pub fn print_usage() -> ! {
    println!("Usage: jobsh [-hvp] [-c command]");
    println!("   -h   Print this help message");
    println!("   -v   Enable verbose mode");
    println!("   -p   Do not print a command prompt");
    println!("   -c   Run the given command line and exit");
    process::exit(1);
}

pub fn error(msg: &str) -> ! {
    eprintln!("jobsh: {}", msg);
    process::exit(1);
}

/// Sends diagnostics to stderr. `JOBSH_LOG` overrides the default level,
/// which is `warn`, or `debug` in verbose mode.
pub fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .without_time()
        .with_target(false)
        .try_init();
}
