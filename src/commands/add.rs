//! Attach orchestration: bridge, veth, address allocation, gateway, NAT.
//!
//! Ordered so that by the time the address manager is asked to allocate, the
//! datapath it will configure already exists, and every step before it is
//! individually convergent.

use std::path::Path;

use tracing::info;

use crate::config::NetConf;
use crate::ipam::{self, PluginContext};
use crate::net::bridge::{ensure_addr, ensure_bridge};
use crate::net::netlink::NetlinkHandle;
use crate::net::netns::NetNs;
use crate::net::veth::{interface_exists, setup_veth};
use crate::net::{enable_ip4_forwarding, nat, NetError, NetResult};

use super::CmdArgs;

pub async fn cmd_add(conf: &NetConf, args: &CmdArgs) -> NetResult<ipam::AllocationResult> {
    let nl = NetlinkHandle::new()?;

    let bridge_index = ensure_bridge(&nl, &conf.bridge, conf.mtu).await?;
    let bridge_addr = conf.compute_bridge_address()?;
    ensure_addr(&nl, bridge_index, &conf.bridge, bridge_addr).await?;

    let netns = NetNs::open(Path::new(&args.netns))?;

    if interface_exists(&netns, &args.if_name).await {
        info!(
            container_id = %args.container_id,
            if_name = %args.if_name,
            "container already has its interface, skipping veth setup"
        );
    } else {
        setup_veth(
            &nl,
            &netns,
            bridge_index,
            &conf.bridge,
            &args.if_name,
            conf.link_mtu(),
            conf.hairpin_mode,
        )
        .await?;
    }

    let ctx = PluginContext {
        command: "ADD",
        container_id: &args.container_id,
        netns: &args.netns,
        if_name: &args.if_name,
    };
    let mut result = ipam::execute(&conf.ipam.plugin, &ctx, &args.raw_config).await?;

    {
        let ip4 = result
            .ip4
            .as_mut()
            .ok_or_else(|| NetError::Ipam("address manager returned no IPv4 config".to_string()))?;

        if conf.is_gateway && ip4.gateway.is_none() {
            ip4.gateway = Some(ipam::derive_gateway(ip4.ip));
        }
        if conf.is_default_gateway {
            ipam::reconcile_default_route(ip4)?;
        }
    }

    {
        let if_name = args.if_name.clone();
        let result = result.clone();
        netns
            .run_inside(move || ipam::configure_iface(&if_name, &result))
            .await?;
    }

    if let Some(ip4) = &result.ip4 {
        let alloc_net = ip4.ip;

        if conf.is_gateway {
            if let Some(gw) = ip4.gateway {
                let gw_addr = ipnet::Ipv4Net::new(gw, alloc_net.prefix_len())
                    .map_err(|e| NetError::Config(format!("invalid gateway address: {}", e)))?;
                ensure_addr(&nl, bridge_index, &conf.bridge, gw_addr).await?;
            }
            enable_ip4_forwarding()?;
        }

        if conf.ip_masq {
            let chain = nat::format_chain_name(&conf.name, &args.container_id);
            let comment = nat::format_comment(&conf.name, &args.container_id);
            nat::setup_masquerade(alloc_net, &chain, &comment).await?;
        }
    }

    // DNS in the result comes from the network config, not the plugin
    result.dns = conf.dns.clone();
    Ok(result)
}
