use std::path::PathBuf;

use anyhow::{bail, Result};
use caps::Capability;
use nix::sched::CloneFlags;

use crate::seccomp::Profile;

/// The namespace kinds a container can create or join. The discriminants
/// are the wire tags used when namespace descriptors travel between the
/// init and the supervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum NamespaceType {
    User = 0,
    Net = 1,
    Mnt = 2,
    Pid = 3,
    Ipc = 4,
    Uts = 5,
    Cgroup = 6,
}

impl NamespaceType {
    pub const ALL: [NamespaceType; 7] = [
        NamespaceType::User,
        NamespaceType::Net,
        NamespaceType::Mnt,
        NamespaceType::Pid,
        NamespaceType::Ipc,
        NamespaceType::Uts,
        NamespaceType::Cgroup,
    ];

    pub fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => NamespaceType::User,
            1 => NamespaceType::Net,
            2 => NamespaceType::Mnt,
            3 => NamespaceType::Pid,
            4 => NamespaceType::Ipc,
            5 => NamespaceType::Uts,
            6 => NamespaceType::Cgroup,
            _ => bail!("unknown namespace tag {}", tag),
        })
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn clone_flag(self) -> CloneFlags {
        match self {
            NamespaceType::User => CloneFlags::CLONE_NEWUSER,
            NamespaceType::Net => CloneFlags::CLONE_NEWNET,
            NamespaceType::Mnt => CloneFlags::CLONE_NEWNS,
            NamespaceType::Pid => CloneFlags::CLONE_NEWPID,
            NamespaceType::Ipc => CloneFlags::CLONE_NEWIPC,
            NamespaceType::Uts => CloneFlags::CLONE_NEWUTS,
            NamespaceType::Cgroup => CloneFlags::CLONE_NEWCGROUP,
        }
    }

    /// Name of the /proc/<pid>/ns entry.
    pub fn proc_name(self) -> &'static str {
        match self {
            NamespaceType::User => "user",
            NamespaceType::Net => "net",
            NamespaceType::Mnt => "mnt",
            NamespaceType::Pid => "pid",
            NamespaceType::Ipc => "ipc",
            NamespaceType::Uts => "uts",
            NamespaceType::Cgroup => "cgroup",
        }
    }
}

/// A namespace borrowed from another container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShareSpec {
    pub from: String,
    pub ns: NamespaceType,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NamespaceConfig {
    pub user: bool,
    pub net: bool,
    pub mnt: bool,
    pub pid: bool,
    pub ipc: bool,
    pub uts: bool,
    pub cgroup: bool,
}

impl NamespaceConfig {
    pub fn contains(&self, ns: NamespaceType) -> bool {
        match ns {
            NamespaceType::User => self.user,
            NamespaceType::Net => self.net,
            NamespaceType::Mnt => self.mnt,
            NamespaceType::Pid => self.pid,
            NamespaceType::Ipc => self.ipc,
            NamespaceType::Uts => self.uts,
            NamespaceType::Cgroup => self.cgroup,
        }
    }

    pub fn any_enabled(&self) -> bool {
        NamespaceType::ALL.iter().any(|ns| self.contains(*ns))
    }

    pub fn types(&self) -> Vec<NamespaceType> {
        NamespaceType::ALL
            .iter()
            .copied()
            .filter(|ns| self.contains(*ns))
            .collect()
    }
}

#[derive(Clone, Debug)]
pub struct FsConfig {
    pub rootfs: PathBuf,
    pub read_only: bool,
    pub proc: bool,
    pub sys: bool,
    pub dev: bool,
    pub use_tmpfs: bool,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            rootfs: PathBuf::from("/dev/shm/bctor-root/"),
            read_only: false,
            proc: true,
            sys: true,
            dev: true,
            use_tmpfs: true,
        }
    }
}

/// cgroup v2 limit bundle. `None` in the spec disables cgroup setup.
#[derive(Clone, Debug)]
pub struct CgroupLimits {
    pub path: PathBuf,
    pub cpu_max: String,
    pub memory_max: String,
    pub pids_max: String,
    pub io_max: String,
}

impl Default for CgroupLimits {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/sys/fs/cgroup/bctor"),
            cpu_max: "50000 100000".to_string(),
            memory_max: "12M".to_string(),
            pids_max: "5".to_string(),
            io_max: String::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    Interactive,
    Batch,
}

#[derive(Clone, Debug)]
pub struct WorkloadSpec {
    pub path: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub mode: ExecutionMode,
}

impl Default for WorkloadSpec {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/bin/sh"),
            args: vec!["sh".to_string()],
            env: vec![
                "PATH=/bin:/usr/bin".to_string(),
                "HOME=/".to_string(),
                "TERM=xterm".to_string(),
            ],
            mode: ExecutionMode::Interactive,
        }
    }
}

/// Immutable description of a container. Everything the init child and the
/// supervisor-side launcher need to know.
#[derive(Clone, Debug)]
pub struct ContainerSpec {
    pub id: String,
    pub namespaces: NamespaceConfig,
    pub shares: Vec<ShareSpec>,
    pub fs: FsConfig,
    pub allow_caps: Vec<Capability>,
    pub cgroups: Option<CgroupLimits>,
    pub seccomp: Profile,
    pub workload: WorkloadSpec,
    pub is_net_root: bool,
}

impl ContainerSpec {
    /// Baseline: a new user + mount + net namespace around an interactive
    /// busybox shell. The cgroup limits are carried but only applied when
    /// the creation set asks for a cgroup namespace.
    pub fn shell(id: &str) -> Self {
        Self {
            id: id.to_string(),
            namespaces: NamespaceConfig {
                user: true,
                net: true,
                mnt: true,
                ..Default::default()
            },
            shares: Vec::new(),
            fs: FsConfig::default(),
            allow_caps: vec![Capability::CAP_SYS_ADMIN],
            cgroups: Some(CgroupLimits {
                path: PathBuf::from(format!("/sys/fs/cgroup/bctor/{}", id)),
                ..Default::default()
            }),
            seccomp: Profile::DebugShell,
            workload: WorkloadSpec::default(),
            is_net_root: false,
        }
    }

    /// The pod's first container. Creates the namespaces every later member
    /// joins and owns the pod's network identity.
    pub fn creator(id: &str, mode: ExecutionMode, profile: Profile) -> Self {
        let mut spec = Self::shell(id);
        spec.is_net_root = true;
        spec.workload.mode = mode;
        spec.seccomp = profile;
        spec
    }

    /// A pod member that borrows user/net/mnt from the pod's NetRoot.
    pub fn joiner(id: &str, root_id: &str, mode: ExecutionMode, profile: Profile) -> Self {
        let mut spec = Self::shell(id);
        spec.workload.mode = mode;
        spec.seccomp = profile;
        spec.namespaces.user = false;
        spec.shares = vec![
            ShareSpec {
                from: root_id.to_string(),
                ns: NamespaceType::User,
            },
            ShareSpec {
                from: root_id.to_string(),
                ns: NamespaceType::Net,
            },
            ShareSpec {
                from: root_id.to_string(),
                ns: NamespaceType::Mnt,
            },
        ];
        spec
    }

    /// Rewrites the workload to `sh -c <cmd>` in batch mode.
    pub fn with_batch_command(mut self, cmd: &str) -> Self {
        self.workload.mode = ExecutionMode::Batch;
        self.workload.path = PathBuf::from("/bin/sh");
        self.workload.args = vec!["sh".to_string(), "-c".to_string(), cmd.to_string()];
        self.seccomp = Profile::Batch;
        self
    }

    pub fn joins(&self, ns: NamespaceType) -> bool {
        self.shares.iter().any(|s| s.ns == ns)
    }

    /// Namespaces this container creates itself: requested minus joined.
    pub fn created_namespaces(&self) -> Vec<NamespaceType> {
        self.namespaces
            .types()
            .into_iter()
            .filter(|ns| !self.joins(*ns))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_tag_round_trip() {
        for ns in NamespaceType::ALL.iter() {
            assert_eq!(NamespaceType::from_tag(ns.tag()).unwrap(), *ns);
        }
        assert!(NamespaceType::from_tag(7).is_err());
    }

    #[test]
    fn test_creator_defaults() {
        let spec = ContainerSpec::creator("bctor-a1", ExecutionMode::Interactive, Profile::DebugShell);
        assert!(spec.is_net_root);
        assert!(spec.namespaces.user && spec.namespaces.net && spec.namespaces.mnt);
        assert!(!spec.namespaces.pid);
        assert_eq!(spec.fs.rootfs, PathBuf::from("/dev/shm/bctor-root/"));
        assert_eq!(spec.allow_caps, vec![Capability::CAP_SYS_ADMIN]);
        assert_eq!(
            spec.created_namespaces(),
            vec![NamespaceType::User, NamespaceType::Net, NamespaceType::Mnt]
        );
    }

    #[test]
    fn test_joiner_shares_from_root() {
        let spec = ContainerSpec::joiner(
            "bctor-a2",
            "bctor-a1",
            ExecutionMode::Interactive,
            Profile::DebugShell,
        );
        assert!(!spec.is_net_root);
        assert!(spec.joins(NamespaceType::User));
        assert!(spec.joins(NamespaceType::Net));
        assert!(spec.joins(NamespaceType::Mnt));
        // user is joined, so the only created namespaces are net and mnt
        // minus the shared ones: nothing except what is not in shares
        assert_eq!(spec.created_namespaces(), Vec::<NamespaceType>::new());
        assert!(spec.shares.iter().all(|s| s.from == "bctor-a1"));
    }

    #[test]
    fn test_batch_command_rewrites_workload() {
        let spec = ContainerSpec::creator("bctor-b1", ExecutionMode::Batch, Profile::Batch)
            .with_batch_command("echo hi");
        assert_eq!(spec.workload.mode, ExecutionMode::Batch);
        assert_eq!(
            spec.workload.args,
            vec!["sh".to_string(), "-c".to_string(), "echo hi".to_string()]
        );
    }
}
