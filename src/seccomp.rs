//! Seccomp profile application. Profile contents are a closed, named set;
//! the BPF program itself is compiled and installed by libseccomp.

use anyhow::{anyhow, Result};
use libseccomp::{ScmpAction, ScmpFilterContext, ScmpSyscall};

/// The profiles a container spec can ask for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Profile {
    DebugShell,
    Workload,
    Hello,
    IpLink,
    Ls,
    Batch,
}

/// Syscalls no workload gets to make, regardless of profile. All of them
/// reconfigure the sandbox the init just finished building.
const BASELINE_DENY: [&str; 9] = [
    "mount",
    "umount2",
    "pivot_root",
    "setns",
    "unshare",
    "init_module",
    "delete_module",
    "kexec_load",
    "open_by_handle_at",
];

fn extra_denied(profile: Profile) -> &'static [&'static str] {
    match profile {
        // the debug shell keeps everything the baseline allows
        Profile::DebugShell => &[],
        Profile::Workload => &["ptrace", "process_vm_readv", "process_vm_writev"],
        Profile::Hello => &["ptrace", "socket", "connect"],
        Profile::IpLink => &["ptrace"],
        Profile::Ls => &["ptrace", "socket", "connect"],
        Profile::Batch => &["ptrace", "process_vm_readv", "process_vm_writev"],
    }
}

/// Installs the profile's filter on the calling thread. Loading the filter
/// also sets no_new_privs, so this must run after capabilities are final
/// and immediately before exec.
pub fn apply(profile: Profile) -> Result<()> {
    let mut ctx = ScmpFilterContext::new_filter(ScmpAction::Allow)
        .map_err(|e| anyhow!("failed to create seccomp filter: {}", e))?;

    for name in BASELINE_DENY.iter().chain(extra_denied(profile)) {
        let syscall = match ScmpSyscall::from_name(name) {
            Ok(s) => s,
            // unknown on this kernel/arch, nothing to deny
            Err(_) => continue,
        };
        ctx.add_rule(ScmpAction::Errno(libc::EPERM), syscall)
            .map_err(|e| anyhow!("failed to add rule for {}: {}", name, e))?;
    }

    ctx.load()
        .map_err(|e| anyhow!("failed to load seccomp profile {:?}: {}", profile, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profiles_have_disjoint_baseline() {
        for profile in [
            Profile::DebugShell,
            Profile::Workload,
            Profile::Hello,
            Profile::IpLink,
            Profile::Ls,
            Profile::Batch,
        ]
        .iter()
        {
            for name in extra_denied(*profile) {
                assert!(
                    !BASELINE_DENY.contains(name),
                    "{} duplicated in profile {:?}",
                    name,
                    profile
                );
            }
        }
    }
}
