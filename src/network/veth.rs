//! veth plumbing. The host side of every pair is enslaved to the pod
//! bridge; the peer is pushed into the pod's network namespace by fd and
//! configured from inside, on a thread that setns-es in and restores its
//! original namespace before it ends.

use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::stream::TryStreamExt;
use nix::fcntl::{open, OFlag};
use nix::sched::{setns, CloneFlags};
use nix::sys::stat::Mode;
use nix::unistd::close;
use rtnetlink::Handle;

use super::with_netlink;

/// Interface migration between namespaces is asynchronous; poll for about
/// a second before declaring the peer lost.
const MIGRATION_ATTEMPTS: u32 = 50;
const MIGRATION_DELAY: Duration = Duration::from_millis(20);

pub(super) async fn link_index(handle: &Handle, name: &str) -> Result<u32> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    let msg = links
        .try_next()
        .await
        .with_context(|| format!("failed to look up link {}", name))?
        .with_context(|| format!("link {} not found", name))?;
    Ok(msg.header.index)
}

/// Creates the `ve-`/`vp-` pair, attaches the host side to the bridge and
/// moves the peer into the namespace behind `netns_fd` (no PID lookup).
/// On any failure the half-built pair is deleted before returning.
pub fn create_veth_pair(bridge: &str, host: &str, peer: &str, netns_fd: RawFd) -> Result<()> {
    let bridge = bridge.to_string();
    let host = host.to_string();
    let peer = peer.to_string();

    with_netlink(move |handle| async move {
        handle
            .link()
            .add()
            .veth(host.clone(), peer.clone())
            .execute()
            .await
            .with_context(|| format!("failed to create veth pair {}/{}", host, peer))?;

        let result = async {
            let bridge_index = link_index(&handle, &bridge).await?;
            let host_index = link_index(&handle, &host).await?;
            handle
                .link()
                .set(host_index)
                .master(bridge_index)
                .execute()
                .await
                .with_context(|| format!("failed to attach {} to {}", host, bridge))?;
            handle
                .link()
                .set(host_index)
                .up()
                .execute()
                .await
                .with_context(|| format!("failed to bring up {}", host))?;

            let peer_index = link_index(&handle, &peer).await?;
            handle
                .link()
                .set(peer_index)
                .setns_by_fd(netns_fd)
                .execute()
                .await
                .with_context(|| format!("failed to move {} into the pod namespace", peer))?;
            Ok(())
        }
        .await;

        if result.is_err() {
            if let Ok(host_index) = link_index(&handle, &host).await {
                let _ = handle.link().del(host_index).execute().await;
            }
        }
        result
    })
}

/// Renames the migrated peer to eth0 and gives it its address, default
/// route and a live loopback. Runs on a dedicated OS thread: setns binds
/// the calling kernel thread, and the original namespace is restored
/// before the thread finishes.
pub fn configure_in_namespace(
    netns_fd: RawFd,
    peer: &str,
    ip: Ipv4Addr,
    prefix: u8,
    gateway: Ipv4Addr,
) -> Result<()> {
    let peer = peer.to_string();

    let worker = thread::Builder::new()
        .name("netns-config".to_string())
        .spawn(move || -> Result<()> {
            let original = open(
                "/proc/self/ns/net",
                OFlag::O_RDONLY | OFlag::O_CLOEXEC,
                Mode::empty(),
            )
            .context("failed to open the host network namespace")?;

            setns(netns_fd, CloneFlags::CLONE_NEWNET)
                .context("failed to enter the pod network namespace")?;

            let result = configure_current_namespace(&peer, ip, prefix, gateway);

            let restored = setns(original, CloneFlags::CLONE_NEWNET);
            let _ = close(original);
            restored.context("failed to restore the host network namespace")?;
            result
        })
        .context("failed to spawn namespace configuration thread")?;

    worker
        .join()
        .map_err(|_| anyhow!("namespace configuration thread panicked"))?
}

fn configure_current_namespace(
    peer: &str,
    ip: Ipv4Addr,
    prefix: u8,
    gateway: Ipv4Addr,
) -> Result<()> {
    let peer = peer.to_string();
    with_netlink(move |handle| async move {
        let mut index = None;
        for _ in 0..MIGRATION_ATTEMPTS {
            let mut links = handle.link().get().match_name(peer.clone()).execute();
            if let Ok(Some(msg)) = links.try_next().await {
                index = Some(msg.header.index);
                break;
            }
            tokio::time::sleep(MIGRATION_DELAY).await;
        }
        let index = index
            .with_context(|| format!("interface {} not found after migration", peer))?;

        // the kernel refuses to rename a live interface
        handle
            .link()
            .set(index)
            .down()
            .execute()
            .await
            .context("failed to set the peer down for rename")?;
        handle
            .link()
            .set(index)
            .name("eth0".to_string())
            .execute()
            .await
            .with_context(|| format!("failed to rename {} to eth0", peer))?;

        handle
            .address()
            .add(index, std::net::IpAddr::V4(ip), prefix)
            .execute()
            .await
            .with_context(|| format!("failed to assign {}/{}", ip, prefix))?;
        handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .context("failed to bring up eth0")?;

        if let Ok(lo) = link_index(&handle, "lo").await {
            let _ = handle.link().set(lo).up().execute().await;
        }

        handle
            .route()
            .add()
            .v4()
            .gateway(gateway)
            .execute()
            .await
            .with_context(|| format!("failed to add default route via {}", gateway))?;
        Ok(())
    })
}

/// Deletes a host-side link by name; its peer vanishes with it.
pub fn delete_link(name: &str) -> Result<()> {
    let name = name.to_string();
    with_netlink(move |handle| async move {
        let index = link_index(&handle, &name).await?;
        handle
            .link()
            .del(index)
            .execute()
            .await
            .with_context(|| format!("failed to delete link {}", name))?;
        Ok(())
    })
}

/// Brings up loopback in the current namespace. Called by the init of a
/// container that just unshared its network namespace.
pub fn loopback_up() -> Result<()> {
    with_netlink(|handle| async move {
        let lo = link_index(&handle, "lo").await?;
        handle
            .link()
            .set(lo)
            .up()
            .execute()
            .await
            .context("failed to bring up lo")?;
        Ok(())
    })
}
