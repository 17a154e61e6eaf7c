use std::fmt::Display;
use std::os::unix::io::RawFd;

use nix::unistd::Pid;

use super::spec::ContainerSpec;
use crate::network::NetResources;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerStatus {
    /// A slot has been claimed in the registry but the init fork has not
    /// returned yet.
    Initializing,
    /// The init process exists.
    Created,
    /// The workload PID has been received.
    Running,
    /// The workload exited; the init may still be pinned by keep-alive.
    Stopped,
    /// The init exited, teardown is complete.
    Exited,
}

impl Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let print = match self {
            ContainerStatus::Initializing => "Initializing",
            ContainerStatus::Created => "Created",
            ContainerStatus::Running => "Running",
            ContainerStatus::Stopped => "Stopped",
            ContainerStatus::Exited => "Exited",
        };
        write!(f, "{}", print)
    }
}

/// A launched container as the supervisor sees it. Mutated only under the
/// registry lock; destroyed only by the reaper.
#[derive(Debug)]
pub struct Container {
    pub spec: ContainerSpec,
    pub status: ContainerStatus,
    pub init_pid: Option<Pid>,
    pub workload_pid: Option<Pid>,
    pub net: Option<NetResources>,
    /// Write end of the keep-alive pipe, held by the supervisor for the
    /// pod's NetRoot. Closing it releases the init.
    pub keep_alive_fd: Option<RawFd>,
}

impl Container {
    pub fn new(spec: ContainerSpec) -> Self {
        Self {
            spec,
            status: ContainerStatus::Initializing,
            init_pid: None,
            workload_pid: None,
            net: None,
            keep_alive_fd: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn pod_letter(&self) -> Option<char> {
        super::split_container_id(&self.spec.id).map(|(letter, _)| letter)
    }

    pub fn is_net_root(&self) -> bool {
        self.spec.is_net_root
    }

    /// The workload can be signaled while it is running or has stopped but
    /// not been torn down.
    pub fn can_kill(&self) -> bool {
        self.status == ContainerStatus::Running
    }

    pub fn set_created(&mut self, init_pid: Pid) {
        debug_assert!(self.status == ContainerStatus::Initializing);
        self.init_pid = Some(init_pid);
        self.status = ContainerStatus::Created;
    }

    pub fn set_running(&mut self, workload_pid: Pid) {
        debug_assert!(self.init_pid.is_some());
        self.workload_pid = Some(workload_pid);
        self.status = ContainerStatus::Running;
    }

    pub fn set_stopped(&mut self) {
        if self.status == ContainerStatus::Running {
            self.status = ContainerStatus::Stopped;
        }
    }

    pub fn set_exited(&mut self) {
        self.workload_pid = None;
        self.status = ContainerStatus::Exited;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::spec::ContainerSpec;

    #[test]
    fn test_lifecycle_transitions() {
        let mut c = Container::new(ContainerSpec::shell("bctor-a1"));
        assert_eq!(c.status, ContainerStatus::Initializing);
        assert!(c.init_pid.is_none());

        c.set_created(Pid::from_raw(100));
        assert_eq!(c.status, ContainerStatus::Created);
        // workload pid is nonzero only from Running onward
        assert!(c.workload_pid.is_none());

        c.set_running(Pid::from_raw(101));
        assert_eq!(c.status, ContainerStatus::Running);
        assert!(c.can_kill());

        c.set_stopped();
        assert_eq!(c.status, ContainerStatus::Stopped);
        assert!(c.workload_pid.is_some());

        c.set_exited();
        assert_eq!(c.status, ContainerStatus::Exited);
        assert!(c.workload_pid.is_none());
    }

    #[test]
    fn test_stopped_is_idempotent() {
        let mut c = Container::new(ContainerSpec::shell("bctor-a1"));
        c.set_created(Pid::from_raw(100));
        c.set_running(Pid::from_raw(101));
        c.set_stopped();
        c.set_stopped();
        assert_eq!(c.status, ContainerStatus::Stopped);
    }

    #[test]
    fn test_pod_letter() {
        let c = Container::new(ContainerSpec::shell("bctor-b3"));
        assert_eq!(c.pod_letter(), Some('b'));
    }
}
