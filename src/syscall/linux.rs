//! Implements the Syscall trait for Linux systems

use std::any::Any;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use caps::{errors::CapsError, CapSet, Capability, CapsHashSet};
use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{setns, unshare, CloneFlags};
use nix::sys::stat::{fstat, stat};
use nix::unistd::{self, pivot_root, Pid};

use super::{ForkResult, Syscall, SyscallError};

#[derive(Clone)]
pub struct LinuxSyscall;

/// The /proc/self/ns entry for a namespace clone flag.
fn ns_proc_name(nstype: CloneFlags) -> Option<&'static str> {
    if nstype == CloneFlags::CLONE_NEWUSER {
        Some("user")
    } else if nstype == CloneFlags::CLONE_NEWNET {
        Some("net")
    } else if nstype == CloneFlags::CLONE_NEWNS {
        Some("mnt")
    } else if nstype == CloneFlags::CLONE_NEWPID {
        Some("pid")
    } else if nstype == CloneFlags::CLONE_NEWIPC {
        Some("ipc")
    } else if nstype == CloneFlags::CLONE_NEWUTS {
        Some("uts")
    } else if nstype == CloneFlags::CLONE_NEWCGROUP {
        Some("cgroup")
    } else {
        None
    }
}

impl Syscall for LinuxSyscall {
    fn as_any(&self) -> &dyn Any {
        self
    }

    /// Forks via the raw syscall so that the calling thread is the one
    /// continued in the child. Callers serialize forks behind the launch
    /// lock; the rest of the process must be quiescent with respect to the
    /// cloned address space.
    fn fork(&self) -> Result<ForkResult> {
        #[cfg(target_arch = "x86_64")]
        let res = unsafe { libc::syscall(libc::SYS_fork) };
        // Architectures without SYS_fork spell it as clone(SIGCHLD).
        #[cfg(not(target_arch = "x86_64"))]
        let res = unsafe {
            libc::syscall(
                libc::SYS_clone,
                libc::SIGCHLD as libc::c_ulong,
                0usize,
                0usize,
                0usize,
                0usize,
            )
        };

        let pid = Errno::result(res)
            .map_err(|e| SyscallError::from_errno(e, "fork failed"))?;
        if pid == 0 {
            Ok(ForkResult::Child)
        } else {
            Ok(ForkResult::Parent {
                child: Pid::from_raw(pid as i32),
            })
        }
    }

    /// Disassociate parts of the execution context of the calling thread.
    fn unshare(&self, flags: CloneFlags) -> Result<()> {
        unshare(flags).map_err(|e| SyscallError::from_errno(e, format!("unshare({:?})", flags)))?;
        Ok(())
    }

    /// Moves the calling thread into the namespace behind `rawfd`. Entering
    /// the namespace the thread is already a member of is reported as its
    /// own error kind, distinguishable from the EINVAL the kernel returns
    /// for mismatched namespace types.
    fn set_ns(&self, rawfd: i32, nstype: CloneFlags) -> Result<()> {
        if let Some(name) = ns_proc_name(nstype) {
            let target = fstat(rawfd)
                .map_err(|e| SyscallError::from_errno(e, format!("fstat ns fd {}", rawfd)))?;
            let current = stat(format!("/proc/self/ns/{}", name).as_str()).map_err(|e| {
                SyscallError::from_errno(e, format!("stat /proc/self/ns/{}", name))
            })?;
            if target.st_ino == current.st_ino && target.st_dev == current.st_dev {
                return Err(SyscallError::already_in_namespace(format!(
                    "setns({}): already a member",
                    name
                ))
                .into());
            }
        }

        setns(rawfd, nstype)
            .map_err(|e| SyscallError::from_errno(e, format!("setns({:?})", nstype)))?;
        Ok(())
    }

    /// Makes `path` the root of the mount namespace. The sequence is fatal
    /// at every step and performs no partial recovery: re-privatize /, bind
    /// the new root onto itself, stack the old root under .pivot_old,
    /// pivot, then detach and remove the old root.
    fn pivot_rootfs(&self, path: &Path) -> Result<()> {
        self.mount(
            None,
            Path::new("/"),
            None,
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            None,
        )
        .context("failed to make / rprivate")?;

        self.mount(
            Some(path),
            path,
            None,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None,
        )
        .with_context(|| format!("failed to bind {:?} onto itself", path))?;

        let put_old = path.join(".pivot_old");
        fs::create_dir_all(&put_old)
            .with_context(|| format!("failed to create {:?}", put_old))?;

        unistd::chdir(path).with_context(|| format!("failed to chdir to {:?}", path))?;
        pivot_root(path, &put_old)
            .map_err(|e| SyscallError::from_errno(e, "pivot_root"))?;
        unistd::chdir("/").context("failed to chdir to new /")?;

        umount2("/.pivot_old", MntFlags::MNT_DETACH)
            .map_err(|e| SyscallError::from_errno(e, "umount old root"))?;
        fs::remove_dir_all("/.pivot_old").context("failed to remove old root")?;
        Ok(())
    }

    fn set_capability(&self, cset: CapSet, value: &CapsHashSet) -> Result<(), CapsError> {
        match cset {
            // caps::set cannot write the bounding set, each extra bit has
            // to be dropped through prctl instead
            CapSet::Bounding => {
                let supported = caps::runtime::thread_all_supported();
                for c in supported.difference(value) {
                    caps::drop(None, CapSet::Bounding, *c)?;
                }
                Ok(())
            }
            _ => caps::set(None, cset, value),
        }
    }

    /// Drops every bounding-set capability the running kernel supports
    /// except those in `keep`. Iteration is bounded by the kernel's
    /// CAP_LAST_CAP through the runtime probe, not a compile-time constant.
    fn drop_bounding_except(&self, keep: &CapsHashSet) -> Result<()> {
        let supported = caps::runtime::thread_all_supported();
        for c in supported.difference(keep) {
            caps::drop(None, CapSet::Bounding, *c)
                .map_err(|e| anyhow::anyhow!("failed to drop {:?} from bounding set: {}", c, e))?;
        }
        Ok(())
    }

    /// Raising an ambient capability requires the bit in both permitted and
    /// inheritable first. The three raises are applied as one operation;
    /// bits raised here are dropped again if a later step fails.
    fn enable_ambient(&self, cap: Capability) -> Result<()> {
        let mut raised = Vec::new();
        for cset in [CapSet::Permitted, CapSet::Inheritable, CapSet::Ambient].iter() {
            let had = caps::has_cap(None, *cset, cap)
                .map_err(|e| anyhow::anyhow!("failed to probe {:?}: {}", cset, e))?;
            if had {
                continue;
            }
            if let Err(e) = caps::raise(None, *cset, cap) {
                for undo in raised.iter().rev() {
                    let _ = caps::drop(None, *undo, cap);
                }
                return Err(anyhow::anyhow!(
                    "failed to raise {:?} in {:?}: {}",
                    cap,
                    cset,
                    e
                ));
            }
            raised.push(*cset);
        }
        Ok(())
    }

    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<(), nix::Error> {
        mount(source, target, fstype, flags, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::{error_kind, ErrorKind};

    #[test]
    fn test_ns_proc_name() {
        assert_eq!(ns_proc_name(CloneFlags::CLONE_NEWUSER), Some("user"));
        assert_eq!(ns_proc_name(CloneFlags::CLONE_NEWNET), Some("net"));
        assert_eq!(ns_proc_name(CloneFlags::CLONE_NEWNS), Some("mnt"));
        assert_eq!(ns_proc_name(CloneFlags::CLONE_NEWCGROUP), Some("cgroup"));
        assert_eq!(ns_proc_name(CloneFlags::CLONE_FILES), None);
    }

    #[test]
    fn test_setns_same_namespace_is_distinguished() -> anyhow::Result<()> {
        // Entering our own net namespace must fail with the dedicated kind,
        // not EINVAL.
        let syscall = LinuxSyscall;
        let fd = nix::fcntl::open(
            "/proc/self/ns/net",
            nix::fcntl::OFlag::O_RDONLY | nix::fcntl::OFlag::O_CLOEXEC,
            nix::sys::stat::Mode::empty(),
        )?;
        let err = syscall
            .set_ns(fd, CloneFlags::CLONE_NEWNET)
            .expect_err("setns into own namespace should be rejected");
        assert_eq!(error_kind(&err), Some(ErrorKind::AlreadyInNamespace));
        nix::unistd::close(fd)?;
        Ok(())
    }
}
