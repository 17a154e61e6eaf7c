//! # bctor
//! A multi-container pod runtime for Linux. A single supervisor process
//! launches containers through an intermediate init process, brokers
//! namespace sharing between the members of a pod over SCM_RIGHTS, wires
//! each pod into a bridged NAT network and multiplexes the controlling
//! terminal across the pod's pseudo-terminals.

pub mod capabilities;
pub mod cgroups;
pub mod console;
pub mod container;
pub mod logger;
pub mod network;
pub mod process;
pub mod reaper;
pub mod rootfs;
pub mod seccomp;
pub mod signal;
pub mod supervisor;
pub mod syscall;
pub mod utils;
