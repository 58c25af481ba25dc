//! Process-wide tracing subscriber
//!
//! Wire logs go to targets `nimbus::client`, `nimbus::send` and
//! `nimbus::recv`. `RUST_LOG` wins over the verbosity flag when set.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Filter directive for a `-v` count
pub const fn filter_directive(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "warn,nimbus=info",
        _ => "info,nimbus=debug,nimbus_cli=debug",
    }
}

/// Open (append) the log file, owner-only on unix
///
/// # Errors
///
/// Returns the I/O error if the file cannot be created or opened.
pub fn open_log_file(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    let _ = options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        let _ = options.mode(0o600);
    }
    options.open(path)
}

/// Install the global subscriber
///
/// Writes to `log_file` when given and openable, stderr otherwise. Calling
/// this twice leaves the first subscriber in place.
pub fn init(verbose: u8, log_file: Option<&Path>) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter_directive(verbose)))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file, failure) = match log_file.map(|path| (path, open_log_file(path))) {
        Some((_, Ok(file))) => (Some(file), None),
        Some((path, Err(err))) => (None, Some(format!("{}: {err}", path.display()))),
        None => (None, None),
    };

    let file_layer = file.map(|file| fmt::layer().with_ansi(false).with_writer(Mutex::new(file)));
    let stderr_layer = file_layer
        .is_none()
        .then(|| fmt::layer().with_writer(io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .ok(); // Ignore error if already initialized

    if let Some(failure) = failure {
        tracing::warn!(target: "nimbus::client", "cannot open log file {failure}, logging to stderr");
    }
}
