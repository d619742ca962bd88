// Shared utilities for Linux TC (traffic control) shaping on the tunnel interface

use super::runner::{CommandRunner, args};
use crate::error::EnforcementError;
use std::net::{IpAddr, Ipv4Addr};

const ROOT_HANDLE: &str = "1:";

/// Check if TC (traffic control) is available
pub async fn check_tc_available(runner: &dyn CommandRunner) -> bool {
    runner
        .run("tc", &args(["qdisc", "show"]))
        .await
        .map(|out| out.success)
        .unwrap_or(false)
}

/// Per-address class minor id, also used as the filter priority.
///
/// Derived from the low 16 bits of the address so a restarted process finds
/// the same objects. Unique within a /16; wider tunnels can collide, so
/// callers must track which address owns an id.
pub fn class_minor(address: Ipv4Addr) -> Result<u32, EnforcementError> {
    match u32::from(address) & 0xffff {
        0 => Err(EnforcementError::unsupported(format!(
            "{address} has no usable tc class id"
        ))),
        minor => Ok(minor),
    }
}

fn classid(minor: u32) -> String {
    format!("{}{:x}", ROOT_HANDLE, minor)
}

fn rate_kbit(rate_mbps: f64) -> String {
    let kbit = (rate_mbps * 1000.0).round().max(1.0) as u64;
    format!("{}kbit", kbit)
}

pub fn require_ipv4(address: IpAddr) -> Result<Ipv4Addr, EnforcementError> {
    match address {
        IpAddr::V4(v4) => Ok(v4),
        IpAddr::V6(_) => Err(EnforcementError::unsupported(format!(
            "tc shaping is IPv4-only, cannot throttle {address}"
        ))),
    }
}

/// Setup TC root HTB qdisc on the interface (once per process)
pub async fn setup_tc_htb_root(
    runner: &dyn CommandRunner,
    interface: &str,
) -> Result<(), EnforcementError> {
    let existing = runner
        .run_checked("tc", &args(["qdisc", "show", "dev", interface]))
        .await?;

    if existing.stdout.contains("htb") {
        return Ok(());
    }

    // Remove any existing root qdisc first
    let _ = runner
        .run("tc", &args(["qdisc", "del", "dev", interface, "root"]))
        .await?;

    // Unclassified traffic bypasses shaping (default 0)
    runner
        .run_checked(
            "tc",
            &args([
                "qdisc", "add", "dev", interface, "root", "handle", ROOT_HANDLE, "htb", "default",
                "0",
            ]),
        )
        .await?;

    log::info!("Installed HTB root qdisc on {interface}");
    Ok(())
}

/// Create an HTB class capped at `rate_mbps` and steer `address` into it
pub async fn add_address_shaping(
    runner: &dyn CommandRunner,
    interface: &str,
    address: Ipv4Addr,
    rate_mbps: f64,
) -> Result<(), EnforcementError> {
    let minor = class_minor(address)?;
    let class = classid(minor);
    let rate = rate_kbit(rate_mbps);
    let prio = minor.to_string();
    let dst = format!("{address}/32");

    runner
        .run_checked(
            "tc",
            &args([
                "class",
                "add",
                "dev",
                interface,
                "parent",
                ROOT_HANDLE,
                "classid",
                class.as_str(),
                "htb",
                "rate",
                rate.as_str(),
                "ceil",
                rate.as_str(), // Ceiling = no bursting above rate
            ]),
        )
        .await?;

    let filter = runner
        .run_checked(
            "tc",
            &args([
                "filter",
                "add",
                "dev",
                interface,
                "parent",
                ROOT_HANDLE,
                "protocol",
                "ip",
                "prio",
                prio.as_str(),
                "u32",
                "match",
                "ip",
                "dst",
                dst.as_str(),
                "flowid",
                class.as_str(),
            ]),
        )
        .await;

    if let Err(e) = filter {
        // Don't leave a class behind that nothing feeds
        let _ = remove_address_shaping(runner, interface, address).await;
        return Err(e);
    }

    log::debug!("Shaping {address} to {rate} on {interface}");
    Ok(())
}

/// Remove the filter and class for `address`; missing objects are not an error
pub async fn remove_address_shaping(
    runner: &dyn CommandRunner,
    interface: &str,
    address: Ipv4Addr,
) -> Result<(), EnforcementError> {
    let minor = class_minor(address)?;
    let class = classid(minor);
    let prio = minor.to_string();

    // The filter references the class, so it goes first
    runner
        .run(
            "tc",
            &args([
                "filter", "del", "dev", interface, "parent", ROOT_HANDLE, "protocol", "ip",
                "prio", prio.as_str(),
            ]),
        )
        .await?;

    runner
        .run(
            "tc",
            &args(["class", "del", "dev", interface, "classid", class.as_str()]),
        )
        .await?;

    Ok(())
}
