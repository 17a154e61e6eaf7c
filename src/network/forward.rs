//! TCP port forwarding into pod namespaces. Each session owns a host
//! listener; every accepted connection is served by a thread that dials
//! 127.0.0.1:<port> from inside the pod's network namespace and then
//! shuttles bytes both ways until either side hangs up.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::fcntl::{open, OFlag};
use nix::sched::{setns, CloneFlags};
use nix::sys::stat::Mode;
use nix::unistd::{close, dup};

const DIAL_TIMEOUT: Duration = Duration::from_secs(2);

struct Session {
    port: u16,
    listener: TcpListener,
    stopping: Arc<AtomicBool>,
    netns_fd: RawFd,
}

impl Session {
    fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        // unblocks the accept loop; the thread sees the flag and exits
        unsafe {
            libc::shutdown(self.listener.as_raw_fd(), libc::SHUT_RDWR);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = close(self.netns_fd);
    }
}

/// Sessions are keyed by pod letter; a session never outlives its pod.
#[derive(Default)]
pub struct PortForwarder {
    sessions: Mutex<HashMap<char, Vec<Session>>>,
}

impl PortForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a listener on 0.0.0.0:<port>. Takes ownership of `netns_fd`,
    /// a descriptor of the pod's network namespace.
    pub fn add_session(&self, pod: char, port: u16, netns_fd: RawFd) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .with_context(|| format!("failed to listen on 0.0.0.0:{}", port))?;
        let stopping = Arc::new(AtomicBool::new(false));

        let accept_listener = listener
            .try_clone()
            .context("failed to clone forward listener")?;
        // the accept loop carries its own namespace descriptor so it never
        // races pod teardown
        let accept_netns = dup(netns_fd).context("failed to dup namespace descriptor")?;
        let accept_stopping = stopping.clone();
        thread::Builder::new()
            .name(format!("forward-{}", port))
            .spawn(move || {
                accept_loop(accept_listener, accept_stopping, accept_netns, port);
                let _ = close(accept_netns);
            })
            .context("failed to spawn forward thread")?;

        self.sessions
            .lock()
            .unwrap()
            .entry(pod)
            .or_default()
            .push(Session {
                port,
                listener,
                stopping,
                netns_fd,
            });
        Ok(())
    }

    pub fn ports(&self, pod: char) -> Vec<u16> {
        self.sessions
            .lock()
            .unwrap()
            .get(&pod)
            .map(|sessions| sessions.iter().map(|s| s.port).collect())
            .unwrap_or_default()
    }

    /// Closes every listener of a pod. In-flight copies drain on their own.
    pub fn cancel_pod(&self, pod: char) {
        if let Some(sessions) = self.sessions.lock().unwrap().remove(&pod) {
            for session in &sessions {
                log::info!("closing forward :{} for pod [{}]", session.port, pod);
                session.stop();
            }
        }
    }

    pub fn cancel_all(&self) {
        let pods: Vec<char> = self.sessions.lock().unwrap().keys().copied().collect();
        for pod in pods {
            self.cancel_pod(pod);
        }
    }
}

fn accept_loop(listener: TcpListener, stopping: Arc<AtomicBool>, netns_fd: RawFd, port: u16) {
    loop {
        let (conn, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(_) => {
                if !stopping.load(Ordering::SeqCst) {
                    log::warn!("forward :{} accept failed, stopping", port);
                }
                return;
            }
        };
        log::debug!("forward :{} connection from {}", port, peer);

        let conn_netns = match dup(netns_fd) {
            Ok(fd) => fd,
            Err(_) => return,
        };
        thread::Builder::new()
            .name(format!("forward-conn-{}", port))
            .spawn(move || {
                if let Err(e) = handle_connection(conn, conn_netns, port) {
                    log::debug!("forward :{} connection ended: {:#}", port, e);
                }
                let _ = close(conn_netns);
            })
            .ok();
    }
}

/// Dials the pod-local port from inside the pod's namespace. The thread
/// enters the namespace only for the dial and restores the host namespace
/// before moving any bytes.
fn handle_connection(host_conn: TcpStream, netns_fd: RawFd, port: u16) -> Result<()> {
    let container_conn = dial_in_namespace(netns_fd, port)?;

    let mut host_read = host_conn.try_clone()?;
    let mut container_write = container_conn.try_clone()?;
    let uplink = thread::spawn(move || {
        let _ = copy_stream(&mut host_read, &mut container_write);
    });

    let mut container_read = container_conn;
    let mut host_write = host_conn;
    let _ = copy_stream(&mut container_read, &mut host_write);

    let _ = uplink.join();
    Ok(())
}

fn dial_in_namespace(netns_fd: RawFd, port: u16) -> Result<TcpStream> {
    let original = open(
        "/proc/self/ns/net",
        OFlag::O_RDONLY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .context("failed to open the host network namespace")?;

    setns(netns_fd, CloneFlags::CLONE_NEWNET)
        .context("failed to enter the pod network namespace")?;

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let dialed = TcpStream::connect_timeout(&addr, DIAL_TIMEOUT);

    let restored = setns(original, CloneFlags::CLONE_NEWNET);
    let _ = close(original);
    restored.context("failed to restore the host network namespace")?;

    dialed.with_context(|| format!("failed to dial 127.0.0.1:{} inside the pod", port))
}

fn copy_stream(from: &mut TcpStream, to: &mut TcpStream) -> std::io::Result<()> {
    let mut buf = [0u8; 4096];
    loop {
        let n = from.read(&mut buf)?;
        if n == 0 {
            let _ = to.shutdown(Shutdown::Write);
            return Ok(());
        }
        to.write_all(&buf[..n])?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ports_tracks_sessions_per_pod() -> Result<()> {
        let forwarder = PortForwarder::new();
        assert!(forwarder.ports('a').is_empty());

        // a session against our own namespace: the fd is only stored
        let netns = open(
            "/proc/self/ns/net",
            OFlag::O_RDONLY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;
        forwarder.add_session('a', 0x7fec, netns)?;
        assert_eq!(forwarder.ports('a'), vec![0x7fec]);
        assert!(forwarder.ports('b').is_empty());

        forwarder.cancel_pod('a');
        assert!(forwarder.ports('a').is_empty());
        Ok(())
    }

    #[test]
    fn test_copy_stream_forwards_until_eof() -> Result<()> {
        let upstream = TcpListener::bind("127.0.0.1:0")?;
        let mut ingress = TcpStream::connect(upstream.local_addr()?)?;
        let (mut from, _) = upstream.accept()?;

        let downstream = TcpListener::bind("127.0.0.1:0")?;
        let mut to = TcpStream::connect(downstream.local_addr()?)?;
        let (mut egress, _) = downstream.accept()?;

        ingress.write_all(b"ping")?;
        ingress.shutdown(Shutdown::Write)?;
        copy_stream(&mut from, &mut to)?;

        // the payload arrives and the half-close propagates as EOF
        let mut buf = Vec::new();
        egress.read_to_end(&mut buf)?;
        assert_eq!(buf, b"ping");
        Ok(())
    }
}
