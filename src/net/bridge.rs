//! Idempotent bridge device management.
//!
//! The bridge is a shared host resource that outlives any single container
//! attachment, so every mutation here is convergent: creation tolerates
//! "already exists", adoption verifies the device kind, and address
//! assignment is planned against observed state instead of applied blindly.

use ipnet::Ipv4Net;

use crate::net::error::{NetError, NetResult};
use crate::net::netlink::NetlinkHandle;

/// What to do about a desired address given the addresses already assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrAction {
    NoOp,
    Add,
    Conflict,
}

/// Pure convergence decision for [`ensure_addr`]. Address comparison includes
/// host bits and prefix, matching what the kernel reports per assignment.
pub fn plan_addr(existing: &[Ipv4Net], want: Ipv4Net) -> AddrAction {
    if existing.iter().any(|a| *a == want) {
        return AddrAction::NoOp;
    }
    if existing.is_empty() {
        AddrAction::Add
    } else {
        AddrAction::Conflict
    }
}

/// Ensure a bridge named `name` exists, is a bridge, and is up.
///
/// Creation races with concurrent invocations are resolved by adoption: the
/// kernel rejects the duplicate create and the existing device is used after
/// a kind check. The device is brought up unconditionally.
pub async fn ensure_bridge(nl: &NetlinkHandle, name: &str, mtu: u32) -> NetResult<u32> {
    nl.add_bridge(name, mtu).await?;

    if !nl.link_is_bridge(name).await? {
        return Err(NetError::Conflict(format!(
            "{:?} already exists but is not a bridge",
            name
        )));
    }

    let index = nl.get_link_index(name).await?;
    nl.set_link_up(index).await?;
    Ok(index)
}

/// Ensure `want` is assigned to the link. A different pre-existing address is
/// a fatal configuration conflict, never silently reassigned. Used for both
/// the bridge's own address and the per-container gateway address.
pub async fn ensure_addr(
    nl: &NetlinkHandle,
    link_index: u32,
    link_name: &str,
    want: Ipv4Net,
) -> NetResult<()> {
    let existing = nl.list_ipv4_addresses(link_index).await?;
    match plan_addr(&existing, want) {
        AddrAction::NoOp => Ok(()),
        AddrAction::Add => nl.add_address(link_index, want).await,
        AddrAction::Conflict => Err(NetError::Conflict(format!(
            "{:?} already has an IP address different from {}",
            link_name, want
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[test]
    fn empty_device_gets_address_added() {
        assert_eq!(plan_addr(&[], net("10.244.0.1/16")), AddrAction::Add);
    }

    #[test]
    fn matching_address_is_noop() {
        assert_eq!(
            plan_addr(&[net("10.244.0.1/16")], net("10.244.0.1/16")),
            AddrAction::NoOp
        );
    }

    #[test]
    fn differing_address_is_conflict() {
        assert_eq!(
            plan_addr(&[net("10.10.0.1/16")], net("10.244.0.1/16")),
            AddrAction::Conflict
        );
    }

    #[test]
    fn differing_prefix_on_same_address_is_conflict() {
        assert_eq!(
            plan_addr(&[net("10.244.0.1/24")], net("10.244.0.1/16")),
            AddrAction::Conflict
        );
    }

    #[test]
    fn match_among_several_is_noop() {
        let existing = [net("172.16.0.1/12"), net("10.244.0.1/16")];
        assert_eq!(plan_addr(&existing, net("10.244.0.1/16")), AddrAction::NoOp);
    }
}
