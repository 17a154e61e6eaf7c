//! The supervisor side of the launch dance: fork the init, complete the
//! user-namespace handshake, hand over borrowed namespaces, collect the
//! workload pid and the created namespaces, wire the pod network and
//! publish the container as Running.

use anyhow::{Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{self, Pid};

use super::channel::IpcBundle;
use super::{fds, init};
use crate::container::{ContainerSpec, ExecutionMode, NamespaceType};
use crate::process::message::Message;
use crate::supervisor::Supervisor;
use crate::syscall::{ForkResult, Syscall, SyscallError};
use crate::{console, logger, utils};

/// Launches one container. The caller has already claimed the container's
/// id in the registry (state Initializing). On failure the init child, if
/// it exists, is killed; the reaper tears the claim down.
pub fn launch(sup: &Supervisor, spec: &ContainerSpec) -> Result<()> {
    let mut bundle = IpcBundle::new().context("failed to create IPC bundle")?;

    // Forks are serialized process-wide; the forking thread is the only
    // one manipulating the address space until exec.
    let child = {
        let _guard = sup.launch_lock.lock().unwrap();
        match sup.syscall.fork()? {
            ForkResult::Child => init::run(spec, &mut bundle, &sup.syscall),
            ForkResult::Parent { child } => child,
        }
    };

    sup.registry
        .with_container(&spec.id, |c| c.set_created(child));
    bundle.close_init_ends();

    if let Err(e) = supervise_launch(sup, spec, &mut bundle, child) {
        // protocol violations and handshake failures are fatal to this
        // container only; make sure the peer does not linger half-built
        let _ = kill(child, Signal::SIGKILL);
        return Err(e);
    }
    Ok(())
}

fn supervise_launch(
    sup: &Supervisor,
    spec: &ContainerSpec,
    bundle: &mut IpcBundle,
    child: Pid,
) -> Result<()> {
    setup_user_mapping(spec, bundle, child)?;

    if !spec.shares.is_empty() {
        let borrowed = sup
            .registry
            .borrow_handles(&spec.shares)
            .context("failed to borrow shared namespaces")?;
        fds::send_namespace_fds(bundle.sup_init.sup_fd()?, &borrowed)
            .context("failed to send shared namespaces")?;
    }
    bundle.sup_init.close_sup();

    let sock = bundle.init_sup.sup_fd()?;
    let workload_pid = fds::recv_workload_pid(sock)?;
    let created = fds::recv_namespace_fds(sock)?;
    bundle.init_sup.close_sup();
    sup.registry.register_handles(&spec.id, created.clone());

    let netres = if spec.is_net_root {
        let netns_fd = created
            .iter()
            .find(|(ns, _)| *ns == NamespaceType::Net)
            .map(|(_, fd)| *fd)
            .ok_or_else(|| {
                SyscallError::protocol("NetRoot init sent no network namespace")
            })?;

        let res = sup
            .network
            .configure_pod(&spec.id, netns_fd)
            .context("network setup failed")?;
        logger::success(&format!("network configured: {} at {}", spec.id, res.ip));

        // release the workload only once the namespace is wired
        bundle.net_ready.notify(Message::NetReady)?;
        Some(res)
    } else {
        None
    };
    bundle.net_ready.close_sender();

    let keep_alive_fd = if spec.is_net_root {
        bundle.keep_alive.take_sender_fd()
    } else {
        bundle.keep_alive.close_sender();
        None
    };

    let pty_master = bundle
        .pty
        .take_master_fd()
        .context("pty master missing at finalize")?;

    sup.registry.with_container(&spec.id, |c| {
        c.set_running(workload_pid);
        c.net = netres.clone();
        c.keep_alive_fd = keep_alive_fd;
    });

    sup.mux
        .register(&spec.id, pty_master, workload_pid, spec.workload.mode);

    match spec.workload.mode {
        ExecutionMode::Batch => {
            let log_fd = bundle
                .log
                .take_sup_fd()
                .context("log socket missing at finalize")?;
            let id = spec.id.clone();
            let events = sup.events_tx.clone();
            std::thread::Builder::new()
                .name(format!("logs-{}", id))
                .spawn(move || console::capture_logs(id, log_fd, events))
                .context("failed to spawn log capture thread")?;
        }
        ExecutionMode::Interactive => bundle.log.close_sup(),
    }

    log::info!(
        "container {} running (init {}, workload {})",
        spec.id,
        child,
        workload_pid
    );
    Ok(())
}

/// A container creating its own user namespace gets its single-uid maps
/// written from outside, then the continue byte. Everyone else just gets
/// the continue byte.
fn setup_user_mapping(spec: &ContainerSpec, bundle: &mut IpcBundle, child: Pid) -> Result<()> {
    let creates_user = spec.namespaces.user && !spec.joins(NamespaceType::User);
    if creates_user {
        let msg = bundle
            .userns_ready
            .wait()
            .context("init died before entering its user namespace")?;
        if msg != Message::UserNsReady {
            return Err(SyscallError::protocol(format!(
                "unexpected message {:?} during userns handshake",
                msg
            ))
            .into());
        }
        write_id_maps(child)?;
    }
    bundle.userns_map.notify(Message::MappingWritten)?;
    bundle.userns_map.close_sender();
    bundle.userns_ready.close_receiver();
    Ok(())
}

/// Maps root inside the namespace onto the supervisor's own uid/gid.
/// setgroups must be denied before gid_map can be written from userspace.
fn write_id_maps(child: Pid) -> Result<()> {
    let uid = unistd::getuid();
    let gid = unistd::getgid();

    utils::write_file(
        format!("/proc/{}/uid_map", child),
        format!("0 {} 1\n", uid),
    )
    .context("failed to write uid_map")?;
    utils::write_file(format!("/proc/{}/setgroups", child), "deny")
        .context("failed to write setgroups")?;
    utils::write_file(
        format!("/proc/{}/gid_map", child),
        format!("0 {} 1\n", gid),
    )
    .context("failed to write gid_map")?;
    Ok(())
}
