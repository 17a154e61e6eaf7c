use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use anyhow::{bail, Result};

/// Host addresses handed out inside the pod subnet. .1 belongs to the
/// bridge, so leases run from .10 through .253.
const FIRST_HOST: u8 = 10;
const LAST_HOST: u8 = 253;

/// Hands out pod addresses within the subnet. Carries its own lock; the
/// registry mutex is never held across an allocation.
pub struct IpAllocator {
    base: Ipv4Addr,
    used: Mutex<HashSet<Ipv4Addr>>,
}

impl IpAllocator {
    pub fn new(base: Ipv4Addr) -> Self {
        Self {
            base,
            used: Mutex::new(HashSet::new()),
        }
    }

    /// First free host address, skipping anything still leased.
    pub fn allocate(&self) -> Result<Ipv4Addr> {
        let mut used = self.used.lock().unwrap();
        let octets = self.base.octets();
        for host in FIRST_HOST..=LAST_HOST {
            let candidate = Ipv4Addr::new(octets[0], octets[1], octets[2], host);
            if !used.contains(&candidate) {
                used.insert(candidate);
                return Ok(candidate);
            }
        }
        bail!("no available addresses in the pod subnet")
    }

    /// Returns a leased address to the free set.
    pub fn release(&self, ip: Ipv4Addr) {
        self.used.lock().unwrap().remove(&ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_is_unique() {
        let alloc = IpAllocator::new(Ipv4Addr::new(10, 0, 0, 0));
        let a = alloc.allocate().unwrap();
        let b = alloc.allocate().unwrap();
        assert_ne!(a, b);
        assert_eq!(a, Ipv4Addr::new(10, 0, 0, 10));
        assert_eq!(b, Ipv4Addr::new(10, 0, 0, 11));
    }

    #[test]
    fn test_release_allows_reuse() {
        let alloc = IpAllocator::new(Ipv4Addr::new(10, 0, 0, 0));
        let a = alloc.allocate().unwrap();
        let _b = alloc.allocate().unwrap();
        alloc.release(a);
        // the freed address is the lowest available again
        assert_eq!(alloc.allocate().unwrap(), a);
    }

    #[test]
    fn test_exhaustion_fails_and_recovers() {
        let alloc = IpAllocator::new(Ipv4Addr::new(10, 0, 0, 0));
        let mut leased = Vec::new();
        for _ in FIRST_HOST..=LAST_HOST {
            leased.push(alloc.allocate().unwrap());
        }
        assert!(alloc.allocate().is_err());

        alloc.release(leased[0]);
        assert_eq!(alloc.allocate().unwrap(), leased[0]);
    }
}
