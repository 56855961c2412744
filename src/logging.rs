//! Timestamped, source-located log lines for the sync pipeline.
//!
//! Provides the [`synclog!`] macro, which writes lines in the format:
//!
//! ```text
//! 20261018T02:00:04.118 - src/pipeline.rs:212 - pipeline: selecting -> unwrapping
//! ```
//!
//! On a terminal the timestamp and location are dimmed, stage names are
//! highlighted and remote file names get a stable colour so the same export
//! is easy to follow across lines.
//!
//! Lines go to stderr unless [`set_writer`] installs another destination
//! (tests capture into a buffer this way). A custom writer disables colour.
//!
//! Never pass key material, passphrases or passwords to the macro.

use std::io::{self, IsTerminal, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{LazyLock, Mutex};
use std::time::SystemTime;

static COLOUR_ENABLED: AtomicBool = AtomicBool::new(false);

static LOG_WRITER: LazyLock<Mutex<Box<dyn Write + Send>>> =
    LazyLock::new(|| Mutex::new(Box::new(io::stderr())));

/// Call once at startup. Turns colour on when stderr is a terminal.
pub fn init() {
    COLOUR_ENABLED.store(io::stderr().is_terminal(), Ordering::Relaxed);
}

/// Send all subsequent [`synclog!`] output to `w` and disable colour.
pub fn set_writer(w: Box<dyn Write + Send>) {
    COLOUR_ENABLED.store(false, Ordering::Relaxed);
    let mut guard = LOG_WRITER.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    *guard = w;
}

pub fn colour_enabled() -> bool {
    COLOUR_ENABLED.load(Ordering::Relaxed)
}

const RESET: &str = "\x1b[0m";
const DIM: &str = "\x1b[2m";
const STAGE_COLOUR: &str = "\x1b[96m"; // bright cyan

const FILE_COLOURS: &[&str] = &[
    "\x1b[92m", // bright green
    "\x1b[93m", // bright yellow
    "\x1b[94m", // bright blue
    "\x1b[95m", // bright magenta
    "\x1b[32m", // green
    "\x1b[33m", // yellow
    "\x1b[34m", // blue
    "\x1b[35m", // magenta
];

fn hash_colour(name: &str) -> &'static str {
    let hash: u32 = name
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
    FILE_COLOURS[(hash as usize) % FILE_COLOURS.len()]
}

/// Format a pipeline stage name, highlighted on a terminal.
pub fn stage(name: &str) -> String {
    if colour_enabled() {
        format!("{STAGE_COLOUR}{name}{RESET}")
    } else {
        name.to_string()
    }
}

/// Format a remote or local file name with a colour derived from its text.
pub fn file_name(name: &str) -> String {
    if colour_enabled() {
        format!("{}{name}{RESET}", hash_colour(name))
    } else {
        name.to_string()
    }
}

/// Format the current wall-clock time (UTC) as `YYYYMMDDTHH:MM:SS.mmm`.
pub fn format_timestamp() -> String {
    let duration = SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = duration.as_secs();
    let millis = duration.subsec_millis();

    let time_secs = secs % 86400;
    let hours = time_secs / 3600;
    let minutes = (time_secs % 3600) / 60;
    let seconds = time_secs % 60;

    // Civil date from days since epoch (Howard Hinnant's algorithm).
    let days = (secs / 86400) as i64;
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };

    format!(
        "{:04}{:02}{:02}T{:02}:{:02}:{:02}.{:03}",
        y, m, d, hours, minutes, seconds, millis
    )
}

/// Write one line to the current writer. Use [`synclog!`] instead.
pub fn emit(file: &str, line: u32, msg: &str) {
    let ts = format_timestamp();
    let formatted = if colour_enabled() {
        format!("{DIM}{ts}{RESET} {DIM}{file}:{line}{RESET} {msg}")
    } else {
        format!("{ts} - {file}:{line} - {msg}")
    };
    let mut writer = LOG_WRITER.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let _ = writeln!(*writer, "{formatted}");
}

/// Emit a log line with timestamp and source location.
///
/// ```ignore
/// synclog!("selector: {} candidate(s) in {}", count, dir);
/// synclog!("selector: picked {}", logging::file_name(&file.filename));
/// ```
#[macro_export]
macro_rules! synclog {
    ($($arg:tt)*) => {{
        $crate::logging::emit(file!(), line!(), &format!($($arg)*));
    }};
}
