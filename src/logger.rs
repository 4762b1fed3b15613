//! Session logger for the editing core.
//!
//! One log file per session, truncated at startup, living under the OS data
//! directory (override with `RETOUCHFE_LOG_DIR` for headless/CI runs):
//!   Windows:  `%APPDATA%\RetouchFE\retouchfe.log`
//!   Linux:    `~/.local/share/RetouchFE/retouchfe.log`
//!   macOS:    `~/Library/Application Support/RetouchFE/retouchfe.log`
//!
//! Lines are stamped with the time elapsed since `init()` and the emitting
//! thread, so interleaved output from the worker pool can be told apart from
//! control-thread activity and per-stage inference timing can be read
//! straight off the log. Use the `log_info!` / `log_warn!` / `log_err!`
//! macros anywhere in the crate.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

struct Logger {
    file: Mutex<File>,
    path: PathBuf,
    started: Instant,
}

static LOGGER: OnceLock<Logger> = OnceLock::new();

/// Path of the current session log, once `init()` has run.
pub fn log_path() -> Option<&'static PathBuf> {
    LOGGER.get().map(|l| &l.path)
}

/// Emit one level-tagged line. I/O errors are swallowed — logging must never
/// take down an edit in progress.
pub fn write(level: &str, msg: &str) {
    let Some(logger) = LOGGER.get() else {
        return;
    };
    let elapsed = logger.started.elapsed();
    let thread = std::thread::current();
    let name = thread.name().unwrap_or("worker");
    if let Ok(mut file) = logger.file.lock() {
        let _ = writeln!(
            file,
            "[{:>9.3}s] [{:5}] [{}] {}",
            elapsed.as_secs_f64(),
            level,
            name,
            msg
        );
    }
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {{
        $crate::logger::write("INFO", &format!($($arg)*));
    }};
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        $crate::logger::write("WARN", &format!($($arg)*));
    }};
}

#[macro_export]
macro_rules! log_err {
    ($($arg:tt)*) => {{
        $crate::logger::write("ERROR", &format!($($arg)*));
    }};
}

/// Open (truncating) the session log and install a panic hook that mirrors
/// panic messages into it before the default handler runs. Safe to call more
/// than once; only the first call wins.
pub fn init() {
    let path = resolve_log_path();
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }

    let file = match OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&path)
    {
        Ok(f) => f,
        Err(e) => {
            eprintln!("[logger] cannot open {}: {}", path.display(), e);
            return;
        }
    };

    if LOGGER
        .set(Logger {
            file: Mutex::new(file),
            path,
            started: Instant::now(),
        })
        .is_err()
    {
        return;
    }

    write("INFO", &format!("RetouchFE {} session log", env!("CARGO_PKG_VERSION")));

    // Worker panics are caught at the job boundary and surfaced as errors;
    // the hook records them here too, with the thread that blew up.
    let prev = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        write("PANIC", &info.to_string());
        prev(info);
    }));
}

fn resolve_log_path() -> PathBuf {
    if let Ok(dir) = std::env::var("RETOUCHFE_LOG_DIR") {
        return PathBuf::from(dir).join("retouchfe.log");
    }
    data_dir().join("RetouchFE").join("retouchfe.log")
}

/// Platform data directory (without the app sub-folder).
fn data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata);
        }
    }
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support");
        }
    }
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg);
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local").join("share");
    }
    PathBuf::from(".")
}
