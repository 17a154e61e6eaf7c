//! The pod network plane: one bridge and MASQUERADE rule for the life of
//! the supervisor, one veth pair and address per pod, and TCP port
//! forwarding into pod namespaces.

use std::future::Future;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::str::FromStr;

use anyhow::{bail, Context, Result};

pub mod forward;
pub mod ip;
pub mod nat;
pub mod veth;

pub use forward::PortForwarder;
pub use ip::IpAllocator;
pub use veth::loopback_up;

pub const DEFAULT_BRIDGE: &str = "bctor0";
pub const DEFAULT_SUBNET: &str = "10.0.0.0/24";

/// Runs a closure against a netlink handle on a private current-thread
/// runtime. The netlink socket binds to whichever network namespace the
/// calling thread is in, which is exactly what the in-namespace
/// configuration paths rely on.
pub(crate) fn with_netlink<T, F, Fut>(f: F) -> Result<T>
where
    F: FnOnce(rtnetlink::Handle) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
        .context("failed to build netlink runtime")?;
    rt.block_on(async move {
        let (connection, handle, _) =
            rtnetlink::new_connection().context("failed to open netlink socket")?;
        tokio::spawn(connection);
        f(handle).await
    })
}

/// A pod subnet in CIDR form.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Subnet {
    pub base: Ipv4Addr,
    pub prefix: u8,
}

impl Subnet {
    /// The bridge owns the first host address and routes the pod's egress.
    pub fn gateway(&self) -> Ipv4Addr {
        let o = self.base.octets();
        Ipv4Addr::new(o[0], o[1], o[2], 1)
    }

    pub fn cidr(&self) -> String {
        format!("{}/{}", self.base, self.prefix)
    }
}

impl FromStr for Subnet {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('/');
        let base: Ipv4Addr = parts
            .next()
            .context("empty subnet")?
            .parse()
            .with_context(|| format!("invalid subnet address in {:?}", s))?;
        let prefix: u8 = parts
            .next()
            .with_context(|| format!("missing prefix length in {:?}", s))?
            .parse()
            .with_context(|| format!("invalid prefix length in {:?}", s))?;
        if parts.next().is_some() || prefix > 32 {
            bail!("invalid subnet {:?}", s);
        }
        Ok(Subnet { base, prefix })
    }
}

/// The network identity a NetRoot owns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetResources {
    pub bridge: String,
    pub host_veth: String,
    pub peer_veth: String,
    pub ip: Ipv4Addr,
}

pub struct NetworkPlane {
    pub bridge: String,
    pub subnet: Subnet,
    out_iface: String,
    alloc: IpAllocator,
}

impl NetworkPlane {
    /// Global one-time host wiring. Any failure here is fatal to the whole
    /// program: without the bridge and the NAT rule no pod can function.
    pub fn setup(bridge: &str, subnet: Subnet) -> Result<Self> {
        nat::enable_ip_forwarding()?;
        let out_iface = nat::default_route_interface()?;
        nat::add_masquerade_rule(&subnet.cidr(), &out_iface)?;
        ensure_bridge(bridge, subnet.gateway(), subnet.prefix)?;

        log::info!(
            "network ready: bridge {} {} nat out {}",
            bridge,
            subnet.cidr(),
            out_iface
        );
        Ok(Self {
            bridge: bridge.to_string(),
            subnet,
            out_iface,
            alloc: IpAllocator::new(subnet.base),
        })
    }

    /// Wires a fresh pod given the descriptor of its new network
    /// namespace. Partial state is unwound in reverse order on failure.
    pub fn configure_pod(&self, id: &str, netns_fd: RawFd) -> Result<NetResources> {
        let ip = self.alloc.allocate()?;

        let suffix = format!("{:04x}", fastrand::u16(..));
        let host_veth = format!("ve-{}", suffix);
        let peer_veth = format!("vp-{}", suffix);

        if let Err(e) = veth::create_veth_pair(&self.bridge, &host_veth, &peer_veth, netns_fd) {
            self.alloc.release(ip);
            return Err(e).with_context(|| format!("veth setup failed for {}", id));
        }

        if let Err(e) = veth::configure_in_namespace(
            netns_fd,
            &peer_veth,
            ip,
            self.subnet.prefix,
            self.subnet.gateway(),
        ) {
            let _ = veth::delete_link(&host_veth);
            self.alloc.release(ip);
            return Err(e).with_context(|| format!("interface setup failed inside {}", id));
        }

        Ok(NetResources {
            bridge: self.bridge.clone(),
            host_veth,
            peer_veth,
            ip,
        })
    }

    /// Pod teardown: dropping the host side takes the in-namespace peer
    /// with it, then the address goes back to the allocator.
    pub fn teardown_pod(&self, res: &NetResources) {
        if let Err(e) = veth::delete_link(&res.host_veth) {
            log::warn!("failed to delete {}: {:#}", res.host_veth, e);
        }
        self.alloc.release(res.ip);
    }

    /// Global teardown at shutdown, once no containers remain.
    pub fn teardown(&self) {
        if let Err(e) = veth::delete_link(&self.bridge) {
            log::warn!("failed to delete bridge {}: {:#}", self.bridge, e);
        }
        if let Err(e) = nat::remove_masquerade_rule(&self.subnet.cidr(), &self.out_iface) {
            log::warn!("failed to remove NAT rule: {:#}", e);
        }
    }
}

/// Creates the bridge if it does not exist yet, addresses it and brings it
/// up. An already-present bridge (say, from a previous supervisor run) is
/// reused as-is.
fn ensure_bridge(name: &str, gateway: Ipv4Addr, prefix: u8) -> Result<()> {
    let name = name.to_string();
    with_netlink(move |handle| async move {
        let existing = veth::link_index(&handle, &name).await;
        let index = match existing {
            Ok(index) => index,
            Err(_) => {
                handle
                    .link()
                    .add()
                    .bridge(name.clone())
                    .execute()
                    .await
                    .with_context(|| format!("failed to create bridge {}", name))?;
                veth::link_index(&handle, &name).await?
            }
        };

        if let Err(e) = handle
            .address()
            .add(index, std::net::IpAddr::V4(gateway), prefix)
            .execute()
            .await
        {
            // already addressed from a previous run
            log::debug!("bridge address add: {}", e);
        }

        handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .with_context(|| format!("failed to bring up bridge {}", name))?;
        Ok(())
    })
}
