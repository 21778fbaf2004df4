use std::{sync::Arc, time::Duration};

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = env!("CARGO_PKG_DESCRIPTION")
)]
pub struct Args {
    /// Turns all log categories up to Debug, for more information check RUST_LOG env variable.
    #[arg(short, long)]
    verbose: bool,

    /// Turns all log categories up to Trace in the log file.
    #[arg(long)]
    enable_tracing_level_log_file: bool,

    /// Directory where the log files are written.
    #[arg(long, default_value = "./logs")]
    log_path: Option<String>,

    /// Settings file to load. Relative paths are placed in the user configuration folder.
    #[arg(long, value_name = "FILE", default_value = "settings.json")]
    settings_file: String,

    /// Deletes the settings file before starting.
    #[arg(long)]
    reset: bool,

    /// Stops after this many seconds instead of waiting for Ctrl+C.
    #[arg(long, value_name = "SECONDS")]
    duration: Option<u64>,

    /// Interval in seconds between per-source statistics reports, 0 disables them.
    #[arg(long, value_name = "SECONDS", default_value = "10")]
    stats_interval: u64,
}

#[derive(Debug)]
struct Manager {
    clap_matches: Args,
}

lazy_static! {
    static ref MANAGER: Arc<Manager> = Arc::new(Manager::new());
}

impl Manager {
    fn new() -> Self {
        Self {
            clap_matches: Args::parse(),
        }
    }
}

// Construct our manager, should be done inside main
pub fn init() {
    MANAGER.as_ref();
}

// Check if the verbosity parameter was used
pub fn is_verbose() -> bool {
    MANAGER.clap_matches.verbose
}

pub fn is_tracing() -> bool {
    MANAGER.clap_matches.enable_tracing_level_log_file
}

pub fn log_path() -> String {
    let log_path =
        MANAGER.clap_matches.log_path.clone().expect(
            "Clap arg \"log-path\" should always be \"Some(_)\" because of the default value.",
        );

    std::fs::create_dir_all(&log_path)
        .unwrap_or_else(|_| panic!("Failed to create log path: {log_path:?}"));

    log_path
}

pub fn settings_file() -> String {
    MANAGER.clap_matches.settings_file.clone()
}

pub fn is_reset() -> bool {
    MANAGER.clap_matches.reset
}

pub fn duration() -> Option<Duration> {
    MANAGER.clap_matches.duration.map(Duration::from_secs)
}

pub fn stats_interval() -> Option<Duration> {
    match MANAGER.clap_matches.stats_interval {
        0 => None,
        seconds => Some(Duration::from_secs(seconds)),
    }
}

// Return the command line used to start this application
pub fn command_line_string() -> String {
    std::env::args().collect::<Vec<String>>().join(" ")
}

// Return a clone of current Args struct
pub fn command_line() -> String {
    format!("{:#?}", MANAGER.clap_matches)
}
