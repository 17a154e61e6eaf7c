//! The TTY multiplexer: one physical terminal in raw mode, many pty
//! masters. Keystrokes go either into the supervisor's line buffer or
//! verbatim to the attached container; container output is fanned out to
//! stdout only while that container is the active one.

use std::collections::HashMap;
use std::io::{self, Write};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{Context, Result};
use crossbeam_channel::Sender;
use nix::sys::termios::{self, SetArg, Termios};
use nix::unistd::{self, Pid};

use crate::container::ExecutionMode;
use crate::logger;
use crate::reaper::Event;

pub const PROMPT: &str = "bctor ❯ ";

/// Ctrl+X detaches from a container back to supervisor mode.
const DETACH_BYTE: u8 = 0x18;

/// Restores the terminal attributes saved at startup, no matter how the
/// supervisor exits.
pub struct RawModeGuard {
    original: Termios,
}

impl RawModeGuard {
    pub fn new() -> Result<Self> {
        let original = termios::tcgetattr(0).context("failed to read terminal attributes")?;
        let mut raw = original.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(0, SetArg::TCSANOW, &raw)
            .context("failed to put the terminal into raw mode")?;
        Ok(Self { original })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = termios::tcsetattr(0, SetArg::TCSANOW, &self.original);
    }
}

struct Target {
    pty: RawFd,
    pid: Pid,
    mode: ExecutionMode,
}

#[derive(Default)]
struct MuxState {
    active: Option<String>,
    line: Vec<u8>,
}

pub struct Multiplexer {
    targets: Mutex<HashMap<String, Target>>,
    state: Mutex<MuxState>,
    events: Sender<Event>,
}

impl Multiplexer {
    pub fn new(events: Sender<Event>) -> Arc<Self> {
        Arc::new(Self {
            targets: Mutex::new(HashMap::new()),
            state: Mutex::new(MuxState::default()),
            events,
        })
    }

    /// Adopts a container's pty master and starts its output reader.
    pub fn register(self: &Arc<Self>, id: &str, pty: RawFd, pid: Pid, mode: ExecutionMode) {
        self.targets.lock().unwrap().insert(
            id.to_string(),
            Target { pty, pid, mode },
        );

        let mux = Arc::clone(self);
        let id = id.to_string();
        let _ = thread::Builder::new()
            .name(format!("pty-{}", id))
            .spawn(move || mux.pipe_output(&id, pty, mode));
    }

    /// Drops a container's pty and closes the master descriptor.
    pub fn unregister(&self, id: &str) {
        if let Some(target) = self.targets.lock().unwrap().remove(id) {
            let _ = unistd::close(target.pty);
        }
        let mut state = self.state.lock().unwrap();
        if state.active.as_deref() == Some(id) {
            state.active = None;
            drop(state);
            self.println_above_prompt(&format!("[!] {} ended. Back to supervisor.", id));
            self.refresh_prompt();
        }
    }

    pub fn workload_pid(&self, id: &str) -> Option<Pid> {
        self.targets.lock().unwrap().get(id).map(|t| t.pid)
    }

    pub fn known_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.targets.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn active_id(&self) -> Option<String> {
        self.state.lock().unwrap().active.clone()
    }

    pub fn attach(&self, id: &str) -> bool {
        let known = self.targets.lock().unwrap().contains_key(id);
        if known {
            let mut state = self.state.lock().unwrap();
            state.active = Some(id.to_string());
            state.line.clear();
        }
        known
    }

    fn detach(&self) {
        self.state.lock().unwrap().active = None;
        self.println_above_prompt("[!] Detached. Back to Supervisor.");
        self.refresh_prompt();
    }

    /// Per-container reader. Interactive output reaches stdout only while
    /// this container is attached; the read failing (EIO once the workload
    /// is gone) is the workload-exit signal for interactive containers.
    fn pipe_output(&self, id: &str, pty: RawFd, mode: ExecutionMode) {
        let mut buf = [0u8; 4096];
        loop {
            match unistd::read(pty, &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if self.state.lock().unwrap().active.as_deref() == Some(id) {
                        let mut out = io::stdout();
                        let _ = out.write_all(&buf[..n]);
                        let _ = out.flush();
                    }
                }
            }
        }

        if mode == ExecutionMode::Interactive {
            let _ = self.events.send(Event::OutputClosed(id.to_string()));
        }
    }

    /// Feeds keystrokes to the attached container, normalizing CR to LF.
    pub fn write_to(&self, id: &str, data: &[u8]) {
        let targets = self.targets.lock().unwrap();
        let target = match targets.get(id) {
            Some(t) => t,
            None => return,
        };

        let normalized: Vec<u8> = data
            .iter()
            .map(|b| if *b == b'\r' { b'\n' } else { *b })
            .collect();
        if let Err(e) = write_all_fd(target.pty, &normalized) {
            drop(targets);
            self.println_above_prompt(&format!("[!] Write error [{}]: {}", id, e));
        }
    }

    pub fn refresh_prompt(&self) {
        let state = self.state.lock().unwrap();
        if state.active.is_some() {
            return;
        }
        let line = String::from_utf8_lossy(&state.line).to_string();
        drop(state);
        let mut out = io::stdout();
        let _ = write!(out, "\r\x1b[K{}{}", PROMPT, line);
        let _ = out.flush();
    }

    /// Prints a full line without corrupting the prompt, then redraws it.
    pub fn println_above_prompt(&self, line: &str) {
        let mut out = io::stdout();
        let _ = write!(out, "\r\x1b[K{}\r\n", line);
        let _ = out.flush();
    }

    /// Prints a pre-rendered block (a frame) that already carries its own
    /// carriage returns.
    pub fn print_block(&self, block: &str) {
        let mut out = io::stdout();
        let _ = write!(out, "\r\x1b[K{}", block);
        let _ = out.flush();
    }

    /// The dedicated stdin thread. Raw-mode bytes either feed the
    /// supervisor line editor or go straight to the attached pty.
    pub fn run_stdin_loop(&self) {
        let mut buf = [0u8; 4096];
        self.refresh_prompt();
        loop {
            let n = match unistd::read(0, &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };

            let active = self.active_id();
            if let Some(id) = active {
                if n == 1 && buf[0] == DETACH_BYTE {
                    self.detach();
                    continue;
                }
                self.write_to(&id, &buf[..n]);
                continue;
            }

            self.handle_supervisor_input(&buf[..n]);
        }
    }

    fn handle_supervisor_input(&self, input: &[u8]) {
        for b in input {
            match *b {
                // Ctrl+C aborts the half-typed line
                3 => {
                    self.state.lock().unwrap().line.clear();
                    print_direct("^C\r\n");
                    self.refresh_prompt();
                }
                b'\r' | b'\n' => {
                    let line = {
                        let mut state = self.state.lock().unwrap();
                        let line = String::from_utf8_lossy(&state.line).trim().to_string();
                        state.line.clear();
                        line
                    };
                    print_direct("\r\n");

                    if line.is_empty() {
                        self.refresh_prompt();
                    } else if self.events.send(Event::Command(line)).is_err() {
                        return;
                    }
                }
                8 | 127 => {
                    let mut state = self.state.lock().unwrap();
                    if state.line.pop().is_some() {
                        drop(state);
                        print_direct("\x08 \x08");
                    }
                }
                _ => {
                    self.state.lock().unwrap().line.push(*b);
                    let mut out = io::stdout();
                    let _ = out.write_all(&[*b]);
                    let _ = out.flush();
                }
            }
        }
    }
}

fn print_direct(s: &str) {
    let mut out = io::stdout();
    let _ = out.write_all(s.as_bytes());
    let _ = out.flush();
}

fn write_all_fd(fd: RawFd, mut data: &[u8]) -> nix::Result<()> {
    while !data.is_empty() {
        let written = unistd::write(fd, data)?;
        data = &data[written..];
    }
    Ok(())
}

/// Reads a batch workload's stdout/stderr socket line by line into the log
/// channel; EOF doubles as the workload-exit signal for batch containers.
pub fn capture_logs(id: String, fd: RawFd, events: Sender<Event>) {
    let mut pending = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match unistd::read(fd, &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=pos).collect();
                    let text = String::from_utf8_lossy(&line).trim_end().to_string();
                    logger::container_output(&id, &text);
                }
            }
        }
    }
    if !pending.is_empty() {
        let text = String::from_utf8_lossy(&pending).trim_end().to_string();
        logger::container_output(&id, &text);
    }
    let _ = unistd::close(fd);
    let _ = events.send(Event::OutputClosed(id));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use nix::fcntl::{open, OFlag};
    use nix::sys::stat::Mode;

    fn test_mux() -> Arc<Multiplexer> {
        let (tx, _rx) = unbounded();
        // the receiver is dropped; sends fail silently which is fine here
        Multiplexer::new(tx)
    }

    #[test]
    fn test_attach_unknown_container_is_rejected() {
        let mux = test_mux();
        assert!(!mux.attach("bctor-z9"));
        assert_eq!(mux.active_id(), None);
    }

    #[test]
    fn test_attach_and_unregister_clear_active() {
        let (tx, _rx) = unbounded();
        let mux = Multiplexer::new(tx);
        let fd = open("/dev/null", OFlag::O_RDONLY, Mode::empty()).unwrap();
        mux.register("bctor-a1", fd, Pid::from_raw(1234), ExecutionMode::Batch);

        assert!(mux.attach("bctor-a1"));
        assert_eq!(mux.active_id(), Some("bctor-a1".to_string()));
        assert_eq!(mux.workload_pid("bctor-a1"), Some(Pid::from_raw(1234)));

        mux.unregister("bctor-a1");
        assert_eq!(mux.active_id(), None);
        assert_eq!(mux.workload_pid("bctor-a1"), None);
    }

    #[test]
    fn test_capture_logs_splits_lines_and_reports_eof() {
        let (tx, rx) = unbounded();
        let (read_fd, write_fd) = unistd::pipe().unwrap();
        unistd::write(write_fd, b"hello\nwor").unwrap();
        unistd::write(write_fd, b"ld\ntail").unwrap();
        unistd::close(write_fd).unwrap();

        capture_logs("bctor-a1".to_string(), read_fd, tx);

        match rx.try_recv().unwrap() {
            Event::OutputClosed(id) => assert_eq!(id, "bctor-a1"),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
