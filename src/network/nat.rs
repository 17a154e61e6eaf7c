//! Host-side plumbing that is not netlink: IPv4 forwarding, the MASQUERADE
//! rule for the pod subnet, and default-route interface discovery.

use std::fs;
use std::process::Command;

use anyhow::{bail, Context, Result};

pub fn enable_ip_forwarding() -> Result<()> {
    fs::write("/proc/sys/net/ipv4/ip_forward", "1")
        .context("failed to enable net.ipv4.ip_forward")
}

/// The interface carrying the default route, from /proc/net/route. The
/// kernel prints the destination as zero-padded little-endian hex, so the
/// default route is the line whose destination is all zeros.
pub fn default_route_interface() -> Result<String> {
    let table = fs::read_to_string("/proc/net/route").context("failed to read routing table")?;
    parse_default_route(&table)
}

fn parse_default_route(table: &str) -> Result<String> {
    for line in table.lines().skip(1) {
        let mut fields = line.split_whitespace();
        let iface = match fields.next() {
            Some(name) => name,
            None => continue,
        };
        if fields.next() == Some("00000000") {
            return Ok(iface.to_string());
        }
    }
    bail!("no default route found")
}

pub fn add_masquerade_rule(subnet: &str, out_iface: &str) -> Result<()> {
    run_iptables(&["-A", "POSTROUTING", "-s", subnet, "-o", out_iface, "-j", "MASQUERADE"])
}

pub fn remove_masquerade_rule(subnet: &str, out_iface: &str) -> Result<()> {
    run_iptables(&["-D", "POSTROUTING", "-s", subnet, "-o", out_iface, "-j", "MASQUERADE"])
}

fn run_iptables(args: &[&str]) -> Result<()> {
    let status = Command::new("iptables")
        .arg("-t")
        .arg("nat")
        .args(args)
        .status()
        .context("failed to run iptables")?;
    if !status.success() {
        bail!("iptables {:?} exited with {}", args, status);
    }
    Ok(())
}
