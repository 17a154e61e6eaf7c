//! An interface trait so the rest of bctor can call the kernel facilities
//! it needs without having to worry about their implementation details.

use std::any::Any;
use std::fmt;
use std::path::Path;

use anyhow::Result;
use caps::{errors::CapsError, CapSet, Capability, CapsHashSet};
use nix::{mount::MsFlags, sched::CloneFlags};

pub mod linux;
pub mod test;

use linux::LinuxSyscall;
use test::TestHelperSyscall;

/// Classifies syscall failures the way the launch and teardown paths need
/// to tell them apart: a missing capability is fatal only to the affected
/// container, a protocol violation gets the peer killed, and resource
/// exhaustion triggers reverse-order unwinding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The current credential set lacks a required capability.
    Privilege,
    /// setns was asked to enter the namespace the thread is already in.
    AlreadyInNamespace,
    /// The SCM_RIGHTS count/tags/ancillary sizes disagree.
    Protocol,
    /// The kernel could not allocate the requested resource.
    Exhausted,
    /// Any other errno.
    Os,
}

#[derive(Debug)]
pub struct SyscallError {
    pub kind: ErrorKind,
    pub source: Option<nix::Error>,
    context: String,
}

impl SyscallError {
    pub fn new(kind: ErrorKind, source: nix::Error, context: impl Into<String>) -> Self {
        Self {
            kind,
            source: Some(source),
            context: context.into(),
        }
    }

    pub fn protocol(context: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Protocol,
            source: None,
            context: context.into(),
        }
    }

    pub fn already_in_namespace(context: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::AlreadyInNamespace,
            source: None,
            context: context.into(),
        }
    }

    pub fn from_errno(errno: nix::Error, context: impl Into<String>) -> Self {
        let kind = match errno {
            nix::errno::Errno::EPERM
            | nix::errno::Errno::EACCES => ErrorKind::Privilege,
            nix::errno::Errno::ENOMEM
            | nix::errno::Errno::ENOSPC
            | nix::errno::Errno::EMFILE
            | nix::errno::Errno::ENFILE => ErrorKind::Exhausted,
            _ => ErrorKind::Os,
        };
        Self::new(kind, errno, context)
    }
}

impl fmt::Display for SyscallError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.source {
            Some(err) => write!(f, "{}: {:?}: {}", self.context, self.kind, err),
            None => write!(f, "{}: {:?}", self.context, self.kind),
        }
    }
}

impl std::error::Error for SyscallError {}

/// Looks through an error chain for a `SyscallError` and reports its kind.
pub fn error_kind(err: &anyhow::Error) -> Option<ErrorKind> {
    err.downcast_ref::<SyscallError>().map(|e| e.kind)
}

/// The kernel facilities required for container management.
pub trait Syscall {
    fn as_any(&self) -> &dyn Any;
    fn fork(&self) -> Result<ForkResult>;
    fn unshare(&self, flags: CloneFlags) -> Result<()>;
    fn set_ns(&self, rawfd: i32, nstype: CloneFlags) -> Result<()>;
    fn pivot_rootfs(&self, path: &Path) -> Result<()>;
    fn set_capability(&self, cset: CapSet, value: &CapsHashSet) -> Result<(), CapsError>;
    fn drop_bounding_except(&self, keep: &CapsHashSet) -> Result<()>;
    fn enable_ambient(&self, cap: Capability) -> Result<()>;
    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<(), nix::Error>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForkResult {
    Parent { child: nix::unistd::Pid },
    Child,
}

pub fn create_syscall() -> Box<dyn Syscall> {
    if cfg!(test) {
        Box::new(TestHelperSyscall::default())
    } else {
        Box::new(LinuxSyscall)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_error_kind_classification() {
        let err = SyscallError::from_errno(
            nix::Error::Sys(nix::errno::Errno::EPERM),
            "unshare(user)",
        );
        assert_eq!(err.kind, ErrorKind::Privilege);

        let err = SyscallError::from_errno(
            nix::Error::Sys(nix::errno::Errno::EMFILE),
            "open(/proc/self/ns/net)",
        );
        assert_eq!(err.kind, ErrorKind::Exhausted);

        let err = SyscallError::from_errno(
            nix::Error::Sys(nix::errno::Errno::EINVAL),
            "setns(net)",
        );
        assert_eq!(err.kind, ErrorKind::Os);
    }

    #[test]
    fn test_error_kind_through_anyhow() {
        let err: anyhow::Error = SyscallError::protocol("fd count mismatch").into();
        assert_eq!(error_kind(&err), Some(ErrorKind::Protocol));
        assert_eq!(error_kind(&anyhow!("plain")), None);
    }
}
