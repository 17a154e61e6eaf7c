//! The namespace-descriptor wire protocol. Both directions use the same
//! message shape over a seqpacket socket: one in-band count byte, `count`
//! namespace type tags, and exactly `count` descriptors in the ancillary
//! SCM_RIGHTS payload, in tag order. Seqpacket keeps message boundaries, so
//! the in-band count can always be trusted to describe this message alone.

use std::os::unix::io::RawFd;

use anyhow::{Context, Result};
use nix::cmsg_space;
use nix::fcntl::{open, OFlag};
use nix::sys::socket::{self, ControlMessage, ControlMessageOwned, MsgFlags};
use nix::sys::stat::Mode;
use nix::sys::uio::IoVec;
use nix::unistd::Pid;

use crate::container::{ContainerSpec, NamespaceType};
use crate::syscall::SyscallError;

/// Most messages carry at most the seven namespace kinds.
const MAX_FDS: usize = 8;

pub fn send_workload_pid(fd: RawFd, pid: Pid) -> Result<()> {
    let buf = (pid.as_raw() as u32).to_le_bytes();
    let iov = [IoVec::from_slice(&buf)];
    socket::sendmsg(fd, &iov, &[], MsgFlags::empty(), None)
        .context("failed to send workload pid")?;
    Ok(())
}

pub fn recv_workload_pid(fd: RawFd) -> Result<Pid> {
    let mut buf = [0u8; 4];
    let bytes = {
        let iov = [IoVec::from_mut_slice(&mut buf)];
        let msg = socket::recvmsg(fd, &iov, None, MsgFlags::empty())
            .context("failed to receive workload pid")?;
        msg.bytes
    };
    if bytes != 4 {
        return Err(SyscallError::protocol(format!(
            "workload pid message is {} bytes, expected 4",
            bytes
        ))
        .into());
    }
    Ok(Pid::from_raw(u32::from_le_bytes(buf) as i32))
}

/// Sends `entries` as one message. An empty set is valid and is sent as a
/// bare zero count with no ancillary data.
pub fn send_namespace_fds(fd: RawFd, entries: &[(NamespaceType, RawFd)]) -> Result<()> {
    let mut buf = Vec::with_capacity(1 + entries.len());
    buf.push(entries.len() as u8);
    let mut fds = Vec::with_capacity(entries.len());
    for (ns, nsfd) in entries {
        buf.push(ns.tag());
        fds.push(*nsfd);
    }

    let iov = [IoVec::from_slice(&buf)];
    if fds.is_empty() {
        socket::sendmsg(fd, &iov, &[], MsgFlags::empty(), None)
    } else {
        let cmsg = [ControlMessage::ScmRights(&fds)];
        socket::sendmsg(fd, &iov, &cmsg, MsgFlags::empty(), None)
    }
    .context("failed to send namespace fds")?;
    Ok(())
}

/// Receives one namespace-descriptor message, validating that the in-band
/// count, the type tags and the ancillary descriptor count agree. Any
/// disagreement is a protocol violation, fatal to the peer.
pub fn recv_namespace_fds(fd: RawFd) -> Result<Vec<(NamespaceType, RawFd)>> {
    let mut buf = [0u8; 1 + MAX_FDS];
    let mut received: Vec<RawFd> = Vec::new();
    let bytes = {
        let iov = [IoVec::from_mut_slice(&mut buf)];
        let mut cmsgspace = cmsg_space!([RawFd; MAX_FDS]);
        let msg = socket::recvmsg(fd, &iov, Some(&mut cmsgspace), MsgFlags::empty())
            .context("failed to receive namespace fds")?;
        for cmsg in msg.cmsgs() {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                received.extend(fds);
            }
        }
        msg.bytes
    };

    if bytes == 0 {
        return Err(SyscallError::protocol(
            "peer closed before sending namespace fds",
        )
        .into());
    }

    let count = buf[0] as usize;
    if bytes != 1 + count {
        return Err(SyscallError::protocol(format!(
            "namespace message is {} bytes for count {}",
            bytes, count
        ))
        .into());
    }
    if received.len() != count {
        return Err(SyscallError::protocol(format!(
            "fd count mismatch: expected {}, got {}",
            count,
            received.len()
        ))
        .into());
    }

    let mut out = Vec::with_capacity(count);
    for (i, nsfd) in received.into_iter().enumerate() {
        let ns = NamespaceType::from_tag(buf[1 + i])
            .map_err(|_| SyscallError::protocol(format!("unknown namespace tag {}", buf[1 + i])))?;
        out.push((ns, nsfd));
    }
    Ok(out)
}

/// Opens a descriptor for every namespace this container created (not
/// joined), from the init's own /proc view. A namespace that cannot be
/// opened is skipped; the supervisor simply cannot share it later.
pub fn collect_created_namespace_fds(spec: &ContainerSpec) -> Vec<(NamespaceType, RawFd)> {
    let mut out = Vec::new();
    for ns in spec.created_namespaces() {
        let path = format!("/proc/self/ns/{}", ns.proc_name());
        match open(path.as_str(), OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty()) {
            Ok(fd) => out.push((ns, fd)),
            Err(e) => log::debug!("could not open {}: {}", path, e),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::{error_kind, ErrorKind};
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use nix::sys::stat::fstat;
    use nix::unistd::close;

    fn seqpacket_pair() -> (RawFd, RawFd) {
        socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::empty(),
        )
        .unwrap()
    }

    fn open_dev_null() -> RawFd {
        open("/dev/null", OFlag::O_RDONLY, Mode::empty()).unwrap()
    }

    #[test]
    fn test_workload_pid_round_trip() -> Result<()> {
        let (tx, rx) = seqpacket_pair();
        send_workload_pid(tx, Pid::from_raw(4242))?;
        assert_eq!(recv_workload_pid(rx)?, Pid::from_raw(4242));
        close(tx)?;
        close(rx)?;
        Ok(())
    }

    #[test]
    fn test_namespace_fds_preserve_order() -> Result<()> {
        let (tx, rx) = seqpacket_pair();
        let a = open_dev_null();
        let b = open_dev_null();
        send_namespace_fds(tx, &[(NamespaceType::User, a), (NamespaceType::Net, b)])?;

        let received = recv_namespace_fds(rx)?;
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].0, NamespaceType::User);
        assert_eq!(received[1].0, NamespaceType::Net);
        // the fds arrive renumbered but must stay usable
        for (_, fd) in &received {
            assert!(fstat(*fd).is_ok());
            close(*fd)?;
        }
        close(a)?;
        close(b)?;
        close(tx)?;
        close(rx)?;
        Ok(())
    }

    #[test]
    fn test_empty_namespace_set() -> Result<()> {
        let (tx, rx) = seqpacket_pair();
        send_namespace_fds(tx, &[])?;
        assert!(recv_namespace_fds(rx)?.is_empty());
        close(tx)?;
        close(rx)?;
        Ok(())
    }

    #[test]
    fn test_count_without_fds_is_protocol_violation() -> Result<()> {
        let (tx, rx) = seqpacket_pair();
        // claim one descriptor but attach no ancillary data
        let buf = [1u8, NamespaceType::Net.tag()];
        let iov = [IoVec::from_slice(&buf)];
        socket::sendmsg(tx, &iov, &[], MsgFlags::empty(), None)?;

        let err = recv_namespace_fds(rx).expect_err("count/fd mismatch must fail");
        assert_eq!(error_kind(&err), Some(ErrorKind::Protocol));
        close(tx)?;
        close(rx)?;
        Ok(())
    }

    #[test]
    fn test_unknown_tag_is_protocol_violation() -> Result<()> {
        let (tx, rx) = seqpacket_pair();
        let fd = open_dev_null();
        let buf = [1u8, 0x7f];
        let iov = [IoVec::from_slice(&buf)];
        let fds = [fd];
        let cmsg = [ControlMessage::ScmRights(&fds)];
        socket::sendmsg(tx, &iov, &cmsg, MsgFlags::empty(), None)?;

        let err = recv_namespace_fds(rx).expect_err("unknown tag must fail");
        assert_eq!(error_kind(&err), Some(ErrorKind::Protocol));
        close(fd)?;
        close(tx)?;
        close(rx)?;
        Ok(())
    }

    #[test]
    fn test_peer_eof_is_protocol_violation() -> Result<()> {
        let (tx, rx) = seqpacket_pair();
        close(tx)?;
        let err = recv_namespace_fds(rx).expect_err("eof must fail");
        assert_eq!(error_kind(&err), Some(ErrorKind::Protocol));
        close(rx)?;
        Ok(())
    }

    #[test]
    fn test_collect_created_namespace_fds() {
        // a spec that creates nothing harvests nothing
        let mut spec = ContainerSpec::shell("bctor-a1");
        spec.namespaces = Default::default();
        assert!(collect_created_namespace_fds(&spec).is_empty());
    }
}
