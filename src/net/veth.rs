//! Veth pair provisioning across the host/container namespace boundary.
//!
//! Link construction is two-phase: the pair is created inside the container
//! namespace (on a pinned thread, see [`NetNs::run_inside`]) and the host end
//! is pushed back out through a pre-opened host namespace fd. The move
//! invalidates the host end's kernel index, so it is re-resolved by name
//! before being attached to the bridge.

use std::os::unix::io::AsRawFd;

use ipnet::Ipv4Net;
use uuid::Uuid;

use crate::net::error::{NetError, NetResult};
use crate::net::netlink::{block_on_current, NetlinkHandle};
use crate::net::netns::NetNs;

/// Generated host-side veth name, within IFNAMSIZ.
pub fn host_veth_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("veth{}", &id[..11])
}

/// Create the container's veth pair and attach the host end to the bridge.
pub async fn setup_veth(
    nl: &NetlinkHandle,
    netns: &NetNs,
    bridge_index: u32,
    bridge_name: &str,
    if_name: &str,
    mtu: u32,
    hairpin: bool,
) -> NetResult<()> {
    let host_name = host_veth_name();
    let host_ns = NetNs::host()?;

    // Phase 1, inside the container namespace: create the pair, bring the
    // container end up, move the host end out. These steps share one pinned
    // thread; interleaving them with another namespace switch would corrupt
    // which namespace the links land in.
    {
        let cont_end = if_name.to_string();
        let host_end = host_name.clone();
        netns
            .run_inside(move || {
                block_on_current(async move {
                    let nl = NetlinkHandle::new()?;
                    nl.add_veth(&cont_end, &host_end, mtu).await?;
                    let cont_index = nl.get_link_index(&cont_end).await?;
                    nl.set_link_up(cont_index).await?;
                    let host_index = nl.get_link_index(&host_end).await?;
                    nl.set_link_netns_fd(host_index, host_ns.as_raw_fd()).await?;
                    Ok(())
                })
            })
            .await
            .map_err(|e| {
                NetError::Link(format!(
                    "failed to create veth pair {:?}/{:?}: {}",
                    if_name, host_name, e
                ))
            })?;
    }

    // Phase 2, on the host: the move changed the host end's ifindex, so
    // resolve it by name again before touching it.
    let host_index = nl.get_link_index(&host_name).await.map_err(|e| {
        NetError::Link(format!(
            "failed to lookup {:?} after namespace move: {}",
            host_name, e
        ))
    })?;

    if mtu > 0 {
        nl.set_link_mtu(host_index, mtu).await.map_err(|e| {
            NetError::Link(format!("failed to set MTU on {:?}: {}", host_name, e))
        })?;
    }

    nl.set_link_up(host_index).await.map_err(|e| {
        NetError::Link(format!("failed to bring up {:?}: {}", host_name, e))
    })?;

    nl.set_link_master(host_index, bridge_index)
        .await
        .map_err(|e| {
            NetError::Link(format!(
                "failed to connect {:?} to bridge {:?}: {}",
                host_name, bridge_name, e
            ))
        })?;

    set_hairpin(&host_name, hairpin).await?;

    Ok(())
}

/// Set reflective-relay mode on a bridge port.
async fn set_hairpin(dev: &str, on: bool) -> NetResult<()> {
    let mode = if on { "on" } else { "off" };
    let output = tokio::process::Command::new("bridge")
        .args(["link", "set", "dev", dev, "hairpin", mode])
        .output()
        .await
        .map_err(NetError::Io)?;
    if !output.status.success() {
        return Err(NetError::Link(format!(
            "failed to set hairpin {} on {:?}: {}",
            mode,
            dev,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Whether `if_name` is present inside the namespace. Lookup failures of any
/// kind mean "does not exist"; this is what makes re-invoking an attach on an
/// already-provisioned container a no-op.
pub async fn interface_exists(netns: &NetNs, if_name: &str) -> bool {
    let if_name = if_name.to_string();
    netns
        .run_inside(move || {
            block_on_current(async move {
                let nl = NetlinkHandle::new()?;
                nl.get_link_index(&if_name).await?;
                Ok(())
            })
        })
        .await
        .is_ok()
}

/// Remove `if_name` from the namespace, returning the IPv4 address it carried
/// so NAT teardown can target the right subnet.
///
/// The namespace is usually already gone when detach runs; namespace and
/// lookup failures therefore downgrade to `Ok(None)`. Only a real deletion
/// failure propagates.
pub async fn remove_interface(netns: &NetNs, if_name: &str) -> NetResult<Option<Ipv4Net>> {
    let if_name = if_name.to_string();
    let result = netns
        .run_inside(move || {
            block_on_current(async move {
                let nl = NetlinkHandle::new()?;
                let index = match nl.get_link_index(&if_name).await {
                    Ok(index) => index,
                    Err(_) => return Ok(None),
                };
                let addr = nl.list_ipv4_addresses(index).await?.into_iter().next();
                nl.del_link(index).await?;
                Ok(addr)
            })
        })
        .await;

    match result {
        Ok(addr) => Ok(addr),
        Err(NetError::Namespace(e)) => {
            tracing::debug!(error = %e, "interface removal skipped, namespace unavailable");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_veth_name_fits_ifnamsiz() {
        let name = host_veth_name();
        assert!(name.starts_with("veth"));
        assert!(name.len() <= 15);
    }

    #[test]
    fn host_veth_names_are_unique() {
        assert_ne!(host_veth_name(), host_veth_name());
    }
}
