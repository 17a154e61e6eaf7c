//! The init child: the intermediate process between the supervisor and the
//! workload. It materializes the namespace configuration, finishes the
//! rootfs inside the new mount namespace, forks the workload and forwards
//! the workload's pid plus the namespaces the kernel created for it.

use std::os::unix::io::RawFd;
use std::path::Path;

use anyhow::{Context, Result};
use nix::mount::MsFlags;
use nix::sched::CloneFlags;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{self, dup2, setsid, Pid};

use super::channel::IpcBundle;
use super::fds;
use super::message::Message;
use crate::container::{ContainerSpec, ExecutionMode, NamespaceType};
use crate::syscall::{ForkResult, Syscall, SyscallError};
use crate::{capabilities, cgroups, logger, network, rootfs, seccomp, utils};

/// Entry point of the forked init. Never returns to the supervisor's code.
pub fn run(spec: &ContainerSpec, bundle: &mut IpcBundle, syscall: &dyn Syscall) -> ! {
    logger::set_direct();
    bundle.close_sup_ends();

    match init_process(spec, bundle, syscall) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            log::error!("init {} failed: {:#}", spec.id, e);
            std::process::exit(1);
        }
    }
}

fn init_process(spec: &ContainerSpec, bundle: &mut IpcBundle, syscall: &dyn Syscall) -> Result<i32> {
    let shared = receive_shared_fds(spec, bundle)?;

    setup_user_namespace(spec, bundle, &shared, syscall)?;
    join_shared_namespaces(&shared, syscall)?;
    unshare_remaining(spec, syscall)?;

    let creates_mnt = spec.namespaces.mnt && !spec.joins(NamespaceType::Mnt);
    if creates_mnt {
        // child mounts must not leak back into the host namespace
        syscall
            .mount(
                None,
                Path::new("/"),
                None,
                MsFlags::MS_REC | MsFlags::MS_PRIVATE,
                None,
            )
            .context("failed to privatize mount propagation")?;
    }

    if spec.namespaces.net && !spec.joins(NamespaceType::Net) {
        network::loopback_up().context("failed to bring up loopback")?;
    }

    if spec.namespaces.cgroup {
        if let Some(limits) = &spec.cgroups {
            cgroups::apply(limits, unistd::getpid())
                .context("failed to apply cgroup limits")?;
        }
    }

    match syscall.fork().context("failed to fork workload")? {
        ForkResult::Child => workload_process(spec, bundle, syscall),
        ForkResult::Parent { child } => init_parent(spec, bundle, child),
    }
}

/// A joiner receives the namespaces it was promised, in the order
/// its share list names them. Any disagreement kills the launch.
fn receive_shared_fds(
    spec: &ContainerSpec,
    bundle: &mut IpcBundle,
) -> Result<Vec<(NamespaceType, RawFd)>> {
    if spec.shares.is_empty() {
        return Ok(Vec::new());
    }

    let received = fds::recv_namespace_fds(bundle.sup_init.init_fd()?)?;
    if received.len() != spec.shares.len() {
        return Err(SyscallError::protocol(format!(
            "expected {} shared namespaces, got {}",
            spec.shares.len(),
            received.len()
        ))
        .into());
    }
    for (got, want) in received.iter().zip(spec.shares.iter()) {
        if got.0 != want.ns {
            return Err(SyscallError::protocol(format!(
                "shared namespace order mismatch: expected {:?}, got {:?}",
                want.ns, got.0
            ))
            .into());
        }
    }
    bundle.sup_init.close_init();
    Ok(received)
}

/// Entering the user namespace: a creator unshares and then parks
/// until the supervisor has written its uid/gid maps; a joiner setns-es
/// into the received descriptor.
fn setup_user_namespace(
    spec: &ContainerSpec,
    bundle: &mut IpcBundle,
    shared: &[(NamespaceType, RawFd)],
    syscall: &dyn Syscall,
) -> Result<()> {
    if let Some((_, fd)) = shared.iter().find(|(ns, _)| *ns == NamespaceType::User) {
        syscall
            .set_ns(*fd, CloneFlags::CLONE_NEWUSER)
            .context("failed to join shared user namespace")?;
        let _ = unistd::close(*fd);
        return Ok(());
    }

    if spec.namespaces.user {
        syscall
            .unshare(CloneFlags::CLONE_NEWUSER)
            .context("failed to unshare user namespace")?;
        bundle.userns_ready.notify(Message::UserNsReady)?;
        let msg = bundle
            .userns_map
            .wait()
            .context("failed to wait for uid/gid maps")?;
        if msg != Message::MappingWritten {
            return Err(SyscallError::protocol(format!(
                "unexpected message {:?} while waiting for maps",
                msg
            ))
            .into());
        }
    }
    Ok(())
}

/// Joins the remaining shares, in share order.
fn join_shared_namespaces(
    shared: &[(NamespaceType, RawFd)],
    syscall: &dyn Syscall,
) -> Result<()> {
    for (ns, fd) in shared {
        if *ns == NamespaceType::User {
            continue;
        }
        syscall
            .set_ns(*fd, ns.clone_flag())
            .with_context(|| format!("failed to join shared {:?} namespace", ns))?;
        let _ = unistd::close(*fd);
    }
    Ok(())
}

/// Everything still requested but neither joined nor USER goes into a
/// single unshare call.
fn unshare_remaining(spec: &ContainerSpec, syscall: &dyn Syscall) -> Result<()> {
    let mut flags = CloneFlags::empty();
    for ns in spec.created_namespaces() {
        if ns == NamespaceType::User {
            continue;
        }
        flags |= ns.clone_flag();
    }
    if flags.is_empty() {
        return Ok(());
    }
    syscall.unshare(flags).context("failed to unshare namespaces")
}

/// The workload child: wire stdio, finish the filesystem, shed privileges,
/// wait for the network when we own it, exec. A returned exec is exit 127.
fn workload_process(spec: &ContainerSpec, bundle: &mut IpcBundle, syscall: &dyn Syscall) -> ! {
    let result = (|| -> Result<()> {
        setup_io(spec, bundle)?;

        if spec.namespaces.mnt && !spec.joins(NamespaceType::Mnt) {
            rootfs::prepare_rootfs(&spec.fs, syscall)?;
            syscall.pivot_rootfs(&spec.fs.rootfs)?;
            rootfs::mount_virtual_fs(&spec.fs, syscall)?;
        }

        capabilities::apply(&spec.allow_caps, syscall)?;
        seccomp::apply(spec.seccomp)?;

        if spec.is_net_root {
            let msg = bundle.net_ready.wait()?;
            if msg != Message::NetReady {
                return Err(SyscallError::protocol(format!(
                    "unexpected message {:?} while waiting for network",
                    msg
                ))
                .into());
            }
        }

        utils::do_exec(&spec.workload.path, &spec.workload.args, &spec.workload.env)
    })();

    if let Err(e) = result {
        eprintln!("exec failed: {:#}", e);
    }
    std::process::exit(127);
}

fn setup_io(spec: &ContainerSpec, bundle: &mut IpcBundle) -> Result<()> {
    match spec.workload.mode {
        ExecutionMode::Interactive => {
            let slave = bundle.pty.slave_fd()?;
            // new session with the pty slave as the controlling terminal
            setsid().context("failed to create session")?;
            if unsafe { libc::ioctl(slave, libc::TIOCSCTTY) } < 0 {
                log::warn!("could not set controlling terminal");
            }
            dup2(slave, 0).context("failed to dup pty onto stdin")?;
            dup2(slave, 1).context("failed to dup pty onto stdout")?;
            dup2(slave, 2).context("failed to dup pty onto stderr")?;
            if slave > 2 {
                bundle.pty.close_slave();
            }
            bundle.log.close_init();
        }
        ExecutionMode::Batch => {
            let log_fd = bundle.log.init_fd()?;
            dup2(log_fd, 1).context("failed to dup log socket onto stdout")?;
            dup2(log_fd, 2).context("failed to dup log socket onto stderr")?;
            bundle.log.close_init();
            bundle.pty.close_slave();
        }
    }
    Ok(())
}

/// The init after forking the workload. Publishes the workload and
/// the created namespaces upward, then adopts the workload's fate. A
/// NetRoot init additionally stays parked on keep-alive so the kernel keeps
/// the pod's namespaces valid for late joiners.
fn init_parent(spec: &ContainerSpec, bundle: &mut IpcBundle, workload: Pid) -> Result<i32> {
    bundle.pty.close_slave();
    bundle.log.close_init();

    let sock = bundle.init_sup.init_fd()?;
    fds::send_workload_pid(sock, workload).context("failed to send workload pid")?;

    let created = fds::collect_created_namespace_fds(spec);
    fds::send_namespace_fds(sock, &created).context("failed to send namespace fds")?;
    for (_, fd) in created {
        let _ = unistd::close(fd);
    }
    bundle.init_sup.close_init();

    let status = waitpid(workload, None).context("failed to wait for workload")?;

    if spec.is_net_root {
        log::info!(
            "init {}: workload done, holding namespaces for joiners",
            spec.id
        );
        bundle.keep_alive.wait_until_closed()?;
        log::info!("init {}: released by supervisor", spec.id);
    }

    Ok(match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
        _ => 0,
    })
}
