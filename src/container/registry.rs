use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use nix::unistd::{self, Pid};

use super::container::{Container, ContainerStatus};
use super::spec::{NamespaceType, ShareSpec};
use super::split_container_id;

/// An open descriptor onto /proc/<init>/ns/<type>, kept by the supervisor
/// so later containers can setns into it. The refcount equals the number of
/// live containers that created (1) or joined (N) the namespace; the fd is
/// closed exactly once, when the count returns to zero.
#[derive(Debug)]
pub struct NamespaceHandle {
    pub ns: NamespaceType,
    pub fd: RawFd,
    pub refs: u32,
}

#[derive(Default)]
struct Inner {
    containers: HashMap<String, Container>,
    handles: HashMap<String, HashMap<NamespaceType, NamespaceHandle>>,
}

/// Which PID of a container matched a lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PidRole {
    Init,
    Workload,
}

/// A row for the console's `list` views.
#[derive(Clone, Debug)]
pub struct ContainerSummary {
    pub id: String,
    pub status: ContainerStatus,
    pub init_pid: Option<Pid>,
    pub workload_pid: Option<Pid>,
    pub is_net_root: bool,
    pub ip: Option<String>,
}

/// The process-global pod registry. One mutex guards the container map and
/// the namespace-handle map together; every read and mutation goes through
/// it.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, container: Container) {
        let mut inner = self.inner.lock().unwrap();
        inner.containers.insert(container.id().to_string(), container);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().unwrap().containers.contains_key(id)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().containers.is_empty()
    }

    /// Runs `f` on the container under the registry lock.
    pub fn with_container<R>(&self, id: &str, f: impl FnOnce(&mut Container) -> R) -> Option<R> {
        let mut inner = self.inner.lock().unwrap();
        inner.containers.get_mut(id).map(f)
    }

    pub fn remove(&self, id: &str) -> Option<Container> {
        self.inner.lock().unwrap().containers.remove(id)
    }

    /// Exact reaper lookup: a PID matches either an init or a workload and
    /// resolves exactly one container.
    pub fn find_by_pid(&self, pid: Pid) -> Option<(String, PidRole)> {
        let inner = self.inner.lock().unwrap();
        for (id, c) in inner.containers.iter() {
            if c.init_pid == Some(pid) {
                return Some((id.clone(), PidRole::Init));
            }
            if c.workload_pid == Some(pid) {
                return Some((id.clone(), PidRole::Workload));
            }
        }
        None
    }

    pub fn summaries(&self) -> Vec<ContainerSummary> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<ContainerSummary> = inner
            .containers
            .values()
            .map(|c| ContainerSummary {
                id: c.id().to_string(),
                status: c.status,
                init_pid: c.init_pid,
                workload_pid: c.workload_pid,
                is_net_root: c.is_net_root(),
                ip: c.net.as_ref().map(|n| n.ip.to_string()),
            })
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        rows
    }

    pub fn all_init_pids(&self) -> Vec<Pid> {
        let inner = self.inner.lock().unwrap();
        inner.containers.values().filter_map(|c| c.init_pid).collect()
    }

    /// Live members of a pod, excluding containers already marked Exited.
    pub fn pod_members(&self, letter: char) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut ids: Vec<String> = inner
            .containers
            .values()
            .filter(|c| c.pod_letter() == Some(letter) && c.status != ContainerStatus::Exited)
            .map(|c| c.id().to_string())
            .collect();
        ids.sort();
        ids
    }

    /// Allocates the next free pod letter. A letter is in use iff some
    /// registered container id begins with it.
    pub fn next_pod_letter(&self) -> Result<char> {
        let inner = self.inner.lock().unwrap();
        let used: Vec<char> = inner
            .containers
            .keys()
            .filter_map(|id| split_container_id(id).map(|(letter, _)| letter))
            .collect();
        for letter in b'a'..=b'z' {
            let letter = letter as char;
            if !used.contains(&letter) {
                return Ok(letter);
            }
        }
        bail!("alphabet exhausted: kill a pod to free up a letter")
    }

    pub fn next_member_index(&self, letter: char) -> u32 {
        let inner = self.inner.lock().unwrap();
        inner
            .containers
            .keys()
            .filter_map(|id| split_container_id(id))
            .filter(|(l, _)| *l == letter)
            .map(|(_, index)| index)
            .max()
            .unwrap_or(0)
            + 1
    }

    /// Registers the namespaces a container created, each starting at one
    /// reference (the creator itself).
    pub fn register_handles(&self, id: &str, fds: Vec<(NamespaceType, RawFd)>) {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.handles.entry(id.to_string()).or_default();
        for (ns, fd) in fds {
            entry.insert(ns, NamespaceHandle { ns, fd, refs: 1 });
        }
    }

    /// Returns the source container's descriptors in share order and
    /// atomically takes one reference per share.
    pub fn borrow_handles(&self, shares: &[ShareSpec]) -> Result<Vec<(NamespaceType, RawFd)>> {
        let mut inner = self.inner.lock().unwrap();
        let mut out = Vec::with_capacity(shares.len());
        // validate before mutating any refcount
        for share in shares {
            let handle = inner
                .handles
                .get(&share.from)
                .and_then(|m| m.get(&share.ns))
                .with_context(|| {
                    format!("missing namespace handle {:?} for {}", share.ns, share.from)
                })?;
            out.push((share.ns, handle.fd));
        }
        for share in shares {
            if let Some(handle) = inner
                .handles
                .get_mut(&share.from)
                .and_then(|m| m.get_mut(&share.ns))
            {
                handle.refs += 1;
            }
        }
        Ok(out)
    }

    /// Drops every reference an exiting container held: one on each handle
    /// it created and one on each source handle it joined. Descriptors are
    /// closed when their count reaches zero.
    pub fn release_handles(&self, id: &str, shares: &[ShareSpec]) {
        let mut inner = self.inner.lock().unwrap();

        let mut decrements: Vec<(String, NamespaceType)> = inner
            .handles
            .get(id)
            .map(|m| m.keys().map(|ns| (id.to_string(), *ns)).collect())
            .unwrap_or_default();
        for share in shares {
            decrements.push((share.from.clone(), share.ns));
        }

        for (owner, ns) in decrements {
            let mut closed = false;
            if let Some(map) = inner.handles.get_mut(&owner) {
                if let Some(handle) = map.get_mut(&ns) {
                    handle.refs = handle.refs.saturating_sub(1);
                    if handle.refs == 0 {
                        let _ = unistd::close(handle.fd);
                        closed = true;
                    }
                }
                if closed {
                    map.remove(&ns);
                }
            }
            if closed {
                let now_empty = inner
                    .handles
                    .get(&owner)
                    .map(|map| map.is_empty())
                    .unwrap_or(false);
                if now_empty {
                    inner.handles.remove(&owner);
                }
            }
        }
    }

    /// The descriptor of one of a container's created namespaces,
    /// duplicated so the caller owns its copy independently of teardown.
    pub fn dup_handle(&self, id: &str, ns: NamespaceType) -> Result<RawFd> {
        let inner = self.inner.lock().unwrap();
        let handle = inner
            .handles
            .get(id)
            .and_then(|m| m.get(&ns))
            .with_context(|| format!("no {:?} handle registered for {}", ns, id))?;
        let fd = unistd::dup(handle.fd).context("failed to dup namespace handle")?;
        Ok(fd)
    }

    #[cfg(test)]
    fn handle_refs(&self, id: &str, ns: NamespaceType) -> Option<u32> {
        let inner = self.inner.lock().unwrap();
        inner.handles.get(id).and_then(|m| m.get(&ns)).map(|h| h.refs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::spec::ContainerSpec;
    use nix::fcntl::{fcntl, FcntlArg};

    fn open_dummy_fd() -> RawFd {
        nix::fcntl::open(
            "/dev/null",
            nix::fcntl::OFlag::O_RDONLY,
            nix::sys::stat::Mode::empty(),
        )
        .unwrap()
    }

    fn fd_is_open(fd: RawFd) -> bool {
        fcntl(fd, FcntlArg::F_GETFD).is_ok()
    }

    #[test]
    fn test_letter_allocation_and_reuse() {
        let registry = Registry::new();
        assert_eq!(registry.next_pod_letter().unwrap(), 'a');
        registry.insert(Container::new(ContainerSpec::shell("bctor-a1")));
        assert_eq!(registry.next_pod_letter().unwrap(), 'b');
        registry.insert(Container::new(ContainerSpec::shell("bctor-b1")));
        assert_eq!(registry.next_pod_letter().unwrap(), 'c');

        // killing pod a frees its letter for the next allocation
        registry.remove("bctor-a1");
        assert_eq!(registry.next_pod_letter().unwrap(), 'a');
    }

    #[test]
    fn test_member_index_allocation() {
        let registry = Registry::new();
        registry.insert(Container::new(ContainerSpec::shell("bctor-a1")));
        assert_eq!(registry.next_member_index('a'), 2);
        registry.insert(Container::new(ContainerSpec::shell("bctor-a2")));
        registry.insert(Container::new(ContainerSpec::shell("bctor-a3")));
        assert_eq!(registry.next_member_index('a'), 4);
        assert_eq!(registry.next_member_index('b'), 1);
    }

    #[test]
    fn test_handle_refcount_conservation() {
        let registry = Registry::new();
        let fd = open_dummy_fd();
        registry.register_handles("bctor-a1", vec![(NamespaceType::Net, fd)]);
        assert_eq!(registry.handle_refs("bctor-a1", NamespaceType::Net), Some(1));

        let shares = vec![ShareSpec {
            from: "bctor-a1".to_string(),
            ns: NamespaceType::Net,
        }];
        let borrowed = registry.borrow_handles(&shares).unwrap();
        assert_eq!(borrowed, vec![(NamespaceType::Net, fd)]);
        assert_eq!(registry.handle_refs("bctor-a1", NamespaceType::Net), Some(2));

        // the joiner exits first: the handle survives for the creator
        registry.release_handles("bctor-a2", &shares);
        assert_eq!(registry.handle_refs("bctor-a1", NamespaceType::Net), Some(1));
        assert!(fd_is_open(fd));

        // the creator exits: the refcount returns to zero and the fd closes
        registry.release_handles("bctor-a1", &[]);
        assert_eq!(registry.handle_refs("bctor-a1", NamespaceType::Net), None);
        assert!(!fd_is_open(fd));
    }

    #[test]
    fn test_borrow_missing_handle_fails_without_side_effects() {
        let registry = Registry::new();
        let fd = open_dummy_fd();
        registry.register_handles("bctor-a1", vec![(NamespaceType::Net, fd)]);

        let shares = vec![
            ShareSpec {
                from: "bctor-a1".to_string(),
                ns: NamespaceType::Net,
            },
            ShareSpec {
                from: "bctor-a1".to_string(),
                ns: NamespaceType::User,
            },
        ];
        assert!(registry.borrow_handles(&shares).is_err());
        // the failed borrow must not leak a reference on the first handle
        assert_eq!(registry.handle_refs("bctor-a1", NamespaceType::Net), Some(1));
        registry.release_handles("bctor-a1", &[]);
    }

    #[test]
    fn test_find_by_pid_is_exact() {
        let registry = Registry::new();
        let mut a1 = Container::new(ContainerSpec::shell("bctor-a1"));
        a1.set_created(Pid::from_raw(100));
        a1.set_running(Pid::from_raw(101));
        registry.insert(a1);

        let mut a2 = Container::new(ContainerSpec::shell("bctor-a2"));
        a2.set_created(Pid::from_raw(200));
        a2.set_running(Pid::from_raw(201));
        registry.insert(a2);

        assert_eq!(
            registry.find_by_pid(Pid::from_raw(100)),
            Some(("bctor-a1".to_string(), PidRole::Init))
        );
        assert_eq!(
            registry.find_by_pid(Pid::from_raw(201)),
            Some(("bctor-a2".to_string(), PidRole::Workload))
        );
        assert_eq!(registry.find_by_pid(Pid::from_raw(999)), None);
    }

    #[test]
    fn test_pod_members_excludes_exited() {
        let registry = Registry::new();
        registry.insert(Container::new(ContainerSpec::shell("bctor-a1")));
        let mut gone = Container::new(ContainerSpec::shell("bctor-a2"));
        gone.set_created(Pid::from_raw(1));
        gone.set_running(Pid::from_raw(2));
        gone.set_exited();
        registry.insert(gone);
        registry.insert(Container::new(ContainerSpec::shell("bctor-b1")));

        assert_eq!(registry.pod_members('a'), vec!["bctor-a1".to_string()]);
    }
}
