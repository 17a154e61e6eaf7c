use std::thread;

use anyhow::Result;
use crossbeam_channel::Sender;
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;

use crate::reaper::Event;

/// Spawns the signal handler thread. Termination signals directed at the
/// supervisor are turned into events so the event loop can forward them to
/// every live init process, giving the pod tree ordinary Unix semantics.
pub fn start_forwarder(events: Sender<Event>) -> Result<()> {
    let mut signals = Signals::new(&[SIGINT, SIGTERM, SIGQUIT, SIGHUP])?;

    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            for sig in signals.forever() {
                if events.send(Event::Signal(sig)).is_err() {
                    return;
                }
            }
        })?;

    Ok(())
}
