//! The supervisor console: raw-mode terminal multiplexing, command parsing
//! and boxed output frames.

pub mod commands;
pub mod frame;
pub mod multiplexer;

pub use commands::Command;
pub use multiplexer::{capture_logs, Multiplexer, RawModeGuard, PROMPT};
