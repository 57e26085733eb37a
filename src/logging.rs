//! tracing-subscriber setup.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Level directive for the `-v` count when `RUST_LOG` is not set. `quiet`
/// pins it to errors.
pub(crate) fn default_directive(verbose: u8, quiet: bool) -> String {
    let level = match verbose {
        _ if quiet => "error",
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    format!("email_parse_cli={level},tower_http={level}")
}

/// Install the global subscriber.
///
/// With `interactive` set and no log file, nothing is installed so log lines
/// cannot tear through the terminal UI. `silent` keeps stderr to errors only;
/// a log file still gets the `-v` level.
pub(crate) fn init(
    verbose: u8,
    log_file: Option<&Path>,
    interactive: bool,
    silent: bool,
) -> Result<()> {
    if interactive && log_file.is_none() {
        return Ok(());
    }

    let quiet = silent && log_file.is_none();
    let filter = match EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => {
            EnvFilter::try_new(default_directive(verbose, quiet)).context("build log filter")?
        }
    };

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open log file {}", path.display()))?;
            tracing_subscriber::registry()
                .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                .with(filter)
                .try_init()
                .context("install log subscriber")?;
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(filter)
                .try_init()
                .context("install log subscriber")?;
        }
    }
    Ok(())
}
