use std::env;
use std::io::{stderr, Write};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use log::{Level, LevelFilter, Log, Metadata, Record};
use once_cell::sync::OnceCell;

pub const RESET: &str = "\x1b[0m";
pub const RED: &str = "\x1b[31m";
pub const GREEN: &str = "\x1b[32m";
pub const YELLOW: &str = "\x1b[33m";
pub const CYAN: &str = "\x1b[36m";
pub const GRAY: &str = "\x1b[90m";

/// The supervisor's log channel is bounded and producers never block on a
/// full channel. Losing a log line is preferable to deadlocking a fork or
/// the shutdown path behind the drain thread.
const LOG_CHANNEL_CAPACITY: usize = 200;

static BCTOR_LOGGER: OnceCell<BctorLogger> = OnceCell::new();
static LOG_SENDER: OnceCell<Sender<String>> = OnceCell::new();

/// Set in the forked child, where the drain thread does not exist and log
/// lines have to go straight to stderr.
static DIRECT: AtomicBool = AtomicBool::new(false);

/// Initializes the global logger and hands back the receiving end of the
/// log channel for the drain thread.
pub fn init() -> Result<Receiver<String>> {
    let level_filter = if let Ok(log_level_str) = env::var("BCTOR_LOG_LEVEL") {
        LevelFilter::from_str(&log_level_str).unwrap_or(LevelFilter::Info)
    } else {
        LevelFilter::Info
    };

    let (tx, rx) = crossbeam_channel::bounded(LOG_CHANNEL_CAPACITY);
    LOG_SENDER
        .set(tx)
        .expect("logger initialized more than once");

    let logger = BCTOR_LOGGER.get_or_init(|| BctorLogger::new(level_filter.to_level()));
    log::set_logger(logger)
        .map(|()| log::set_max_level(level_filter))
        .expect("set logger failed");

    Ok(rx)
}

/// Switches the process to direct stderr logging. Called immediately after
/// fork in the child.
pub fn set_direct() {
    DIRECT.store(true, Ordering::SeqCst);
}

fn emit(line: String) {
    if DIRECT.load(Ordering::SeqCst) {
        let _ = write!(stderr(), "{}\r\n", line);
        return;
    }
    if let Some(tx) = LOG_SENDER.get() {
        match tx.try_send(line) {
            Ok(()) | Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {}
        }
    } else {
        let _ = write!(stderr(), "{}\r\n", line);
    }
}

/// SUCCESS is not a `log` level; it is its own severity prefix on the
/// supervisor console.
pub fn success(msg: &str) {
    emit(format!("{}SUCCESS:{} {}", GREEN, RESET, msg));
}

/// Routes a raw output line captured from a batch workload into the log
/// channel, prefixed with the producing container.
pub fn container_output(id: &str, line: &str) {
    emit(format!("{}[{}]{} {}", GRAY, id, RESET, line));
}

pub struct BctorLogger {
    level: Option<Level>,
}

impl BctorLogger {
    fn new(level: Option<Level>) -> Self {
        Self { level }
    }
}

impl Log for BctorLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        if let Some(level) = self.level {
            metadata.level() <= level
        } else {
            false
        }
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let prefix = match record.level() {
                Level::Error => format!("{}ERROR:{}", RED, RESET),
                Level::Warn => format!("{}WARN:{}", YELLOW, RESET),
                Level::Info => format!("{}INFO:{}", CYAN, RESET),
                Level::Debug | Level::Trace => format!("{}DEBUG:{}", GRAY, RESET),
            };
            let line = if record.level() <= Level::Warn {
                format!(
                    "{} {} {}",
                    prefix,
                    chrono::Local::now().format("%H:%M:%S"),
                    record.args()
                )
            } else {
                format!("{} {}", prefix, record.args())
            };
            emit(line);
        }
    }

    fn flush(&self) {
        let _ = stderr().flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_before_init_does_not_panic() {
        // The sender may not be installed when a forked child logs early.
        emit("orphan line".to_string());
    }

    #[test]
    fn test_success_prefix() {
        let line = format!("{}SUCCESS:{} done", GREEN, RESET);
        assert!(line.contains("SUCCESS:"));
    }
}
