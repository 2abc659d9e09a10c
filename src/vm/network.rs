// Host Network Plane
//
// One-shot preparation of the host side of guest networking (bridge, NAT,
// forwarding) plus the iptables reaper that clears stale DNAT rules for a
// guest IP or a whole subnet prefix. Everything here drives the usual host
// utilities; only the resulting state (bridge present, MASQUERADE + FORWARD
// rules installed) is contract.

use crate::error::{Error, Result};
use crate::vm::{run_host_command, run_host_command_capture};
use anyhow::Context;
use tokio::process::Command;
use tracing::{info, warn};

/// Save the current firewall state and, if the bridge does not already
/// exist, create it and install NAT/forwarding for the guest subnet.
///
/// A second call with the same bridge name is a no-op. Any failure here is
/// fatal to daemon startup.
pub async fn setup_bridge_and_firewall(
    backup_path: &str,
    bridge_name: &str,
    bridge_ip: &str,
    bridge_subnet: &str,
) -> anyhow::Result<()> {
    let saved = run_host_command_capture(&mut Command::new("iptables-save"), "iptables-save")
        .await
        .context("failed to snapshot firewall state")?;
    tokio::fs::write(backup_path, saved)
        .await
        .with_context(|| format!("failed to write firewall backup to {backup_path}"))?;

    let egress = default_egress_interface().await?;

    if bridge_exists(bridge_name).await? {
        info!("bridge {bridge_name} already present, networking already set up");
        return Ok(());
    }

    let egress_forwarding = format!("net.ipv4.conf.{egress}.forwarding=1");
    let bridge_forwarding = format!("net.ipv4.conf.{bridge_name}.forwarding=1");
    let steps: &[(&str, Vec<&str>)] = &[
        ("ip", vec!["link", "add", bridge_name, "type", "bridge"]),
        ("ip", vec!["link", "set", bridge_name, "up"]),
        ("ip", vec!["addr", "add", bridge_ip, "dev", bridge_name, "scope", "host"]),
        (
            "iptables",
            vec![
                "-t", "nat", "-A", "POSTROUTING", "-s", bridge_subnet, "-o", egress.as_str(),
                "-j", "MASQUERADE",
            ],
        ),
        ("sysctl", vec!["-w", egress_forwarding.as_str()]),
        ("sysctl", vec!["-w", bridge_forwarding.as_str()]),
        (
            "iptables",
            vec!["-t", "filter", "-I", "FORWARD", "-s", bridge_subnet, "-j", "ACCEPT"],
        ),
        (
            "iptables",
            vec!["-t", "filter", "-I", "FORWARD", "-d", bridge_subnet, "-j", "ACCEPT"],
        ),
    ];

    for (program, args) in steps {
        run_host_command(Command::new(program).args(args), "host network setup").await?;
    }

    info!("host networking prepared: bridge {bridge_name}, egress {egress}");
    Ok(())
}

/// Whether a bridge with the given name exists on the host.
pub async fn bridge_exists(name: &str) -> Result<bool> {
    let output = run_host_command_capture(
        Command::new("ip").args(["link", "show", "type", "bridge"]),
        "list bridges",
    )
    .await?;
    Ok(listing_names_bridge(&output, name))
}

/// Remove the bridge if present; absence is success.
pub async fn cleanup_bridge(name: &str) -> Result<()> {
    let present = Command::new("ip")
        .args(["link", "show", name])
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false);
    if !present {
        return Ok(());
    }

    run_host_command(Command::new("ip").args(["link", "delete", name]), "delete bridge").await?;
    info!("deleted bridge {name}");
    Ok(())
}

/// Delete every PREROUTING DNAT rule whose redirect target starts with
/// `ip_prefix` (a full guest IP, any port; or an octet prefix covering a
/// subnet). Rules are deleted in descending line order so the numbering
/// stays valid while we work; failures are collected and the remainder is
/// still attempted.
pub async fn reap_dnat_rules(ip_prefix: &str) -> anyhow::Result<()> {
    info!("deleting DNAT rules targeting {ip_prefix}");
    let listing = run_host_command_capture(
        Command::new("iptables").args(["-t", "nat", "-L", "PREROUTING", "-n", "--line-numbers"]),
        "list PREROUTING rules",
    )
    .await
    .context("failed to list iptables rules")?;

    let mut failures = Vec::new();
    for rule in dnat_rule_numbers(&listing, ip_prefix) {
        let number = rule.to_string();
        match run_host_command(
            Command::new("iptables").args(["-t", "nat", "-D", "PREROUTING", number.as_str()]),
            "delete PREROUTING rule",
        )
        .await
        {
            Ok(()) => info!("deleted PREROUTING rule {rule}"),
            Err(e) => {
                warn!("failed to delete PREROUTING rule {rule}: {e}");
                failures.push(format!("rule {rule}: {e}"));
            }
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("failed to delete iptables rules: {}", failures.join("; "))
    }
}

/// Discover the interface carrying the host's default route.
pub async fn default_egress_interface() -> anyhow::Result<String> {
    let routes = run_host_command_capture(
        Command::new("ip").args(["route", "show", "default"]),
        "read default route",
    )
    .await
    .context("failed to read the default route")?;
    egress_interface_from(&routes)
        .ok_or_else(|| anyhow::anyhow!("host has no default route, cannot set up NAT"))
}

/// The complete octets covered by a CIDR's mask, e.g. `10.20.1.0/24` ->
/// `10.20.1`. Used to sweep a whole subnet's DNAT rules at startup.
pub fn ip_prefix_of(cidr: &str) -> Result<String> {
    let (addr, prefix_len) = super::ip_pool::parse_cidr(cidr)?;
    let complete_octets = (prefix_len / 8) as usize;
    if complete_octets == 0 {
        return Err(Error::InvalidConfig(format!(
            "mask /{prefix_len} covers no complete octet in {cidr}"
        )));
    }
    let octets = addr.octets();
    Ok(octets[..complete_octets]
        .iter()
        .map(|o| o.to_string())
        .collect::<Vec<_>>()
        .join("."))
}

fn listing_names_bridge(listing: &str, name: &str) -> bool {
    let needle = format!("{name}:");
    listing.lines().any(|line| line.contains(&needle))
}

fn egress_interface_from(routes: &str) -> Option<String> {
    // "default via 192.168.0.1 dev eth0 proto dhcp ..."
    let line = routes.lines().find(|l| l.trim_start().starts_with("default"))?;
    let mut fields = line.split_whitespace();
    while let Some(field) = fields.next() {
        if field == "dev" {
            return fields.next().map(|s| s.to_string());
        }
    }
    None
}

/// Line numbers of PREROUTING rules redirecting to the given prefix,
/// descending.
fn dnat_rule_numbers(listing: &str, ip_prefix: &str) -> Vec<u32> {
    let mut numbers: Vec<u32> = listing
        .lines()
        .filter(|line| line_targets_prefix(line, ip_prefix))
        .filter_map(|line| line.split_whitespace().next()?.parse().ok())
        .collect();
    numbers.sort_unstable_by(|a, b| b.cmp(a));
    numbers
}

fn line_targets_prefix(line: &str, ip_prefix: &str) -> bool {
    let Some(pos) = line.find("to:") else {
        return false;
    };
    let target = line[pos + 3..]
        .split_whitespace()
        .next()
        .unwrap_or_default();
    match target.strip_prefix(ip_prefix) {
        // Full IP followed by a port, an octet prefix followed by the rest
        // of an address, or an exact match. `10.20.1.5` must not select
        // `10.20.1.50`.
        Some(rest) => rest.is_empty() || rest.starts_with(':') || rest.starts_with('.'),
        None => false,
    }
}
