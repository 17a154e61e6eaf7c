//! The reaper thread: one blocking wait-any-child loop feeding the
//! supervisor's event loop. Exit events for a given PID are delivered in
//! the order the kernel reports them.

use std::thread;
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::Sender;
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

/// Everything the supervisor's single event loop reacts to.
#[derive(Debug)]
pub enum Event {
    /// A direct child (an init, or an orphaned workload reparented to us
    /// through the subreaper flag) was reaped.
    Exited { pid: Pid, status: WaitStatus },
    /// A termination signal arrived for the supervisor itself.
    Signal(i32),
    /// A container's output stream hung up: its workload is gone.
    OutputClosed(String),
    /// A line typed at the supervisor prompt.
    Command(String),
}

pub fn start(events: Sender<Event>) -> Result<()> {
    thread::Builder::new()
        .name("reaper".to_string())
        .spawn(move || loop {
            match waitpid(Pid::from_raw(-1), None) {
                Ok(status) => {
                    let pid = match status.pid() {
                        Some(pid) => pid,
                        None => continue,
                    };
                    log::debug!("reaped pid {} ({:?})", pid, status);
                    if events.send(Event::Exited { pid, status }).is_err() {
                        return;
                    }
                }
                Err(Errno::EINTR) => continue,
                // no children right now; new launches will bring some
                Err(Errno::ECHILD) => {
                    thread::sleep(Duration::from_millis(100));
                }
                Err(e) => {
                    log::error!("reaper wait failed: {}", e);
                    thread::sleep(Duration::from_millis(100));
                }
            }
        })?;
    Ok(())
}
