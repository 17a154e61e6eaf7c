//! The per-launch IPC bundle. Everything is created before the init fork so
//! both sides inherit every descriptor; each side then closes the ends it
//! does not own. Single-byte handshakes travel over pipes, the PID and
//! namespace descriptors travel over the seqpacket sockets, and a batch
//! workload's stdout/stderr travel over a stream socketpair.

use std::io::{Read, Write};
use std::os::unix::io::{IntoRawFd, RawFd};

use anyhow::{bail, Context, Result};
use mio::unix::pipe::{self, Receiver, Sender};
use nix::pty::openpty;
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::unistd;

use super::message::Message;

/// One-way, one-byte handshake pipe.
pub struct SignalPipe {
    sender: Option<Sender>,
    receiver: Option<Receiver>,
}

impl SignalPipe {
    pub fn new() -> Result<Self> {
        let (sender, receiver) = pipe::new()?;
        // Handshakes are blocking by design: the waiting process is
        // expected to park until its peer progresses.
        sender
            .set_nonblocking(false)
            .context("failed to set pipe sender to blocking")?;
        receiver
            .set_nonblocking(false)
            .context("failed to set pipe receiver to blocking")?;
        Ok(Self {
            sender: Some(sender),
            receiver: Some(receiver),
        })
    }

    pub fn notify(&mut self, msg: Message) -> Result<()> {
        let sender = self
            .sender
            .as_mut()
            .context("signal pipe sender already closed")?;
        sender.write_all(&[msg as u8])?;
        Ok(())
    }

    pub fn wait(&mut self) -> Result<Message> {
        let receiver = self
            .receiver
            .as_mut()
            .context("signal pipe receiver already closed")?;
        let mut buf = [0u8; 1];
        receiver
            .read_exact(&mut buf)
            .context("peer closed the signal pipe before signaling")?;
        Ok(Message::from(buf[0]))
    }

    /// Parks until the write end is gone. Used by the NetRoot init to keep
    /// the pod namespaces pinned after its workload exits.
    pub fn wait_until_closed(&mut self) -> Result<()> {
        let receiver = self
            .receiver
            .as_mut()
            .context("signal pipe receiver already closed")?;
        let mut buf = [0u8; 16];
        loop {
            match receiver.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(_) => continue,
                Err(e) => bail!("keep-alive wait failed: {}", e),
            }
        }
    }

    pub fn close_sender(&mut self) {
        self.sender.take();
    }

    pub fn close_receiver(&mut self) {
        self.receiver.take();
    }

    /// Detaches the write end as a raw descriptor the caller now owns.
    pub fn take_sender_fd(&mut self) -> Option<RawFd> {
        self.sender.take().map(|s| s.into_raw_fd())
    }
}

/// A seqpacket (or stream, for logs) socketpair with one end per process.
pub struct SocketPair {
    sup: Option<RawFd>,
    init: Option<RawFd>,
}

impl SocketPair {
    fn new(kind: SockType) -> Result<Self> {
        let (sup, init) = socketpair(AddressFamily::Unix, kind, None, SockFlag::SOCK_CLOEXEC)
            .context("failed to create socketpair")?;
        Ok(Self {
            sup: Some(sup),
            init: Some(init),
        })
    }

    pub fn seqpacket() -> Result<Self> {
        Self::new(SockType::SeqPacket)
    }

    pub fn stream() -> Result<Self> {
        Self::new(SockType::Stream)
    }

    pub fn sup_fd(&self) -> Result<RawFd> {
        self.sup.context("supervisor socket end already closed")
    }

    pub fn init_fd(&self) -> Result<RawFd> {
        self.init.context("init socket end already closed")
    }

    pub fn close_sup(&mut self) {
        if let Some(fd) = self.sup.take() {
            let _ = unistd::close(fd);
        }
    }

    pub fn close_init(&mut self) {
        if let Some(fd) = self.init.take() {
            let _ = unistd::close(fd);
        }
    }

    pub fn take_sup_fd(&mut self) -> Option<RawFd> {
        self.sup.take()
    }
}

impl Drop for SocketPair {
    fn drop(&mut self) {
        self.close_sup();
        self.close_init();
    }
}

pub struct PtyPair {
    master: Option<RawFd>,
    slave: Option<RawFd>,
}

impl PtyPair {
    pub fn new() -> Result<Self> {
        let pty = openpty(None, None).context("failed to open pty pair")?;
        Ok(Self {
            master: Some(pty.master),
            slave: Some(pty.slave),
        })
    }

    pub fn master_fd(&self) -> Result<RawFd> {
        self.master.context("pty master already closed")
    }

    pub fn slave_fd(&self) -> Result<RawFd> {
        self.slave.context("pty slave already closed")
    }

    pub fn take_master_fd(&mut self) -> Option<RawFd> {
        self.master.take()
    }

    pub fn close_master(&mut self) {
        if let Some(fd) = self.master.take() {
            let _ = unistd::close(fd);
        }
    }

    pub fn close_slave(&mut self) {
        if let Some(fd) = self.slave.take() {
            let _ = unistd::close(fd);
        }
    }
}

impl Drop for PtyPair {
    fn drop(&mut self) {
        self.close_master();
        self.close_slave();
    }
}

/// Every channel a single container launch needs.
pub struct IpcBundle {
    /// init → supervisor: "I entered my new user namespace".
    pub userns_ready: SignalPipe,
    /// supervisor → init: "uid/gid maps are written, continue".
    pub userns_map: SignalPipe,
    /// supervisor → workload: "the pod network is wired, exec now".
    pub net_ready: SignalPipe,
    /// supervisor → NetRoot init: closing the write end releases the init.
    pub keep_alive: SignalPipe,
    /// init → supervisor seqpacket: workload pid, then created-namespace fds.
    pub init_sup: SocketPair,
    /// supervisor → init seqpacket: borrowed namespace fds for joiners.
    pub sup_init: SocketPair,
    /// workload → supervisor stream: batch stdout/stderr.
    pub log: SocketPair,
    pub pty: PtyPair,
}

impl IpcBundle {
    pub fn new() -> Result<Self> {
        Ok(Self {
            userns_ready: SignalPipe::new()?,
            userns_map: SignalPipe::new()?,
            net_ready: SignalPipe::new()?,
            keep_alive: SignalPipe::new()?,
            init_sup: SocketPair::seqpacket()?,
            sup_init: SocketPair::seqpacket()?,
            log: SocketPair::stream()?,
            pty: PtyPair::new()?,
        })
    }

    /// Supervisor side, right after fork: drop every end the init owns.
    pub fn close_init_ends(&mut self) {
        self.userns_ready.close_sender();
        self.userns_map.close_receiver();
        self.net_ready.close_receiver();
        self.keep_alive.close_receiver();
        self.init_sup.close_init();
        self.sup_init.close_init();
        self.log.close_init();
        self.pty.close_slave();
    }

    /// Init side, right after fork: drop every end the supervisor owns.
    pub fn close_sup_ends(&mut self) {
        self.userns_ready.close_receiver();
        self.userns_map.close_sender();
        self.net_ready.close_sender();
        self.keep_alive.close_sender();
        self.init_sup.close_sup();
        self.sup_init.close_sup();
        self.log.close_sup();
        self.pty.close_master();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::waitpid;
    use nix::unistd::{self, ForkResult};
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_signal_pipe_across_fork() -> Result<()> {
        let mut pipe = SignalPipe::new()?;
        match unsafe { unistd::fork()? } {
            ForkResult::Parent { child } => {
                pipe.close_sender();
                let msg = pipe.wait().context("failed to wait for child signal")?;
                assert_eq!(msg, Message::UserNsReady);
                waitpid(child, None)?;
            }
            ForkResult::Child => {
                pipe.close_receiver();
                pipe.notify(Message::UserNsReady).unwrap();
                std::process::exit(0);
            }
        }
        Ok(())
    }

    #[test]
    #[serial]
    fn test_signal_pipe_peer_death_unblocks_wait() -> Result<()> {
        let mut pipe = SignalPipe::new()?;
        match unsafe { unistd::fork()? } {
            ForkResult::Parent { child } => {
                pipe.close_sender();
                // The child exits without signaling; wait must error out
                // instead of blocking forever.
                assert!(pipe.wait().is_err());
                waitpid(child, None)?;
            }
            ForkResult::Child => {
                pipe.close_receiver();
                std::process::exit(0);
            }
        }
        Ok(())
    }

    #[test]
    fn test_wait_until_closed_returns_on_eof() -> Result<()> {
        let mut pipe = SignalPipe::new()?;
        pipe.close_sender();
        pipe.wait_until_closed()?;
        Ok(())
    }

    #[test]
    fn test_take_sender_fd_leaves_pipe_open() -> Result<()> {
        let mut pipe = SignalPipe::new()?;
        let fd = pipe.take_sender_fd().unwrap();
        // the detached fd still feeds the receiver
        unistd::write(fd, &[Message::MappingWritten as u8])?;
        assert_eq!(pipe.wait()?, Message::MappingWritten);
        unistd::close(fd)?;
        pipe.wait_until_closed()?;
        Ok(())
    }

    #[test]
    fn test_socket_pair_close_is_idempotent() -> Result<()> {
        let mut pair = SocketPair::seqpacket()?;
        assert!(pair.sup_fd().is_ok());
        pair.close_sup();
        pair.close_sup();
        assert!(pair.sup_fd().is_err());
        pair.close_init();
        Ok(())
    }
}
