//! Handles management of capabilities

use anyhow::Result;
use caps::{CapSet, Capability, CapsHashSet};

use crate::syscall::Syscall;

fn to_set(caps: &[Capability]) -> CapsHashSet {
    let mut capabilities = CapsHashSet::new();
    for c in caps {
        capabilities.insert(*c);
    }
    capabilities
}

/// Reduces the workload to its allow-list: every other bounding-set bit is
/// dropped, then effective/permitted/inheritable are set to exactly the
/// allowed set. Ambient bits are raised last since they require permitted
/// and inheritable to already contain the capability.
pub fn apply(allow: &[Capability], syscall: &dyn Syscall) -> Result<()> {
    let allowed = to_set(allow);
    log::debug!("dropping bounding capabilities to {:?}", allowed);
    syscall.drop_bounding_except(&allowed)?;

    syscall.set_capability(CapSet::Effective, &allowed)?;
    syscall.set_capability(CapSet::Permitted, &allowed)?;
    syscall.set_capability(CapSet::Inheritable, &allowed)?;

    // ambient may be unavailable on older kernels, the workload still runs
    for cap in allow {
        if let Err(e) = syscall.enable_ambient(*cap) {
            log::error!("failed to raise ambient {:?}: {}", cap, e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::test::TestHelperSyscall;

    #[test]
    fn test_apply_allow_list() {
        let syscall = TestHelperSyscall::default();
        let allow = vec![Capability::CAP_SYS_ADMIN, Capability::CAP_NET_BIND_SERVICE];
        apply(&allow, &syscall).unwrap();

        let expected = to_set(&allow);
        assert_eq!(syscall.get_bounding_keep_args(), vec![expected.clone()]);

        let sets: Vec<_> = syscall
            .get_set_capability_args()
            .into_iter()
            .map(|(cset, caps)| {
                assert_eq!(caps, expected);
                cset
            })
            .collect();
        assert_eq!(
            format!("{:?}", sets),
            format!(
                "{:?}",
                vec![CapSet::Effective, CapSet::Permitted, CapSet::Inheritable]
            )
        );

        assert_eq!(syscall.get_ambient_args(), allow);
    }

    #[test]
    fn test_apply_empty_allow_list() {
        let syscall = TestHelperSyscall::default();
        apply(&[], &syscall).unwrap();
        assert_eq!(syscall.get_bounding_keep_args(), vec![CapsHashSet::new()]);
        assert!(syscall.get_ambient_args().is_empty());
    }
}
