//! Delegation to an external address-manager plugin.
//!
//! The plugin is a standalone executable found on a configurable search path.
//! It receives the raw network config on stdin plus the invocation identity in
//! environment variables, and answers on stdout with either an allocation
//! result or a structured error.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::config::DnsConf;
use crate::net::netlink::{block_on_current, NetlinkHandle};
use crate::net::{NetError, NetResult};

pub const PLUGIN_PATH_ENV: &str = "STITCH_PLUGIN_PATH";
pub const DEFAULT_PLUGIN_PATH: &str = "/opt/stitch/bin";

/// What the plugin allocated, and what this agent fills in around it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AllocationResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip4: Option<Ip4Config>,
    #[serde(default)]
    pub dns: DnsConf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ip4Config {
    pub ip: Ipv4Net,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Route {
    pub dst: Ipv4Net,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<Ipv4Addr>,
}

/// Structured failure a plugin reports on stdout.
#[derive(Debug, Deserialize)]
struct PluginError {
    code: i64,
    msg: String,
}

/// Identity of the invocation, passed to the plugin via environment.
pub struct PluginContext<'a> {
    pub command: &'a str,
    pub container_id: &'a str,
    pub netns: &'a str,
    pub if_name: &'a str,
}

/// Resolve `plugin` against the colon-separated search path.
fn find_plugin(plugin: &str) -> NetResult<PathBuf> {
    if plugin.is_empty() {
        return Err(NetError::Config("ipam type not specified".to_string()));
    }
    let search_path =
        std::env::var(PLUGIN_PATH_ENV).unwrap_or_else(|_| DEFAULT_PLUGIN_PATH.to_string());
    for dir in search_path.split(':').filter(|d| !d.is_empty()) {
        let candidate = PathBuf::from(dir).join(plugin);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(NetError::Ipam(format!(
        "plugin {:?} not found on {}",
        plugin, search_path
    )))
}

/// Run the plugin and hand back its stdout. The raw config bytes go to the
/// plugin untouched so fields this agent does not model still reach it.
async fn invoke(
    plugin: &str,
    ctx: &PluginContext<'_>,
    raw_config: &[u8],
) -> NetResult<Vec<u8>> {
    let path = find_plugin(plugin)?;
    debug!(plugin = %path.display(), command = ctx.command, "invoking address manager");

    let mut child = tokio::process::Command::new(&path)
        .env("STITCH_COMMAND", ctx.command)
        .env("STITCH_CONTAINERID", ctx.container_id)
        .env("STITCH_NETNS", ctx.netns)
        .env("STITCH_IFNAME", ctx.if_name)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| NetError::Ipam(format!("failed to spawn {}: {}", path.display(), e)))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(raw_config).await.map_err(NetError::Io)?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| NetError::Ipam(format!("failed to wait for {}: {}", path.display(), e)))?;

    if !output.status.success() {
        // well-behaved plugins report errors as JSON on stdout
        if let Ok(pe) = serde_json::from_slice::<PluginError>(&output.stdout) {
            return Err(NetError::Ipam(format!(
                "{} failed (code {}): {}",
                plugin, pe.code, pe.msg
            )));
        }
        return Err(NetError::Ipam(format!(
            "{} failed: {}",
            plugin,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(output.stdout)
}

/// Allocate an address for the container.
pub async fn execute(
    plugin: &str,
    ctx: &PluginContext<'_>,
    raw_config: &[u8],
) -> NetResult<AllocationResult> {
    let stdout = invoke(plugin, ctx, raw_config).await?;
    serde_json::from_slice(&stdout)
        .map_err(|e| NetError::Ipam(format!("unparseable result from {}: {}", plugin, e)))
}

/// Release the container's allocation. Output is ignored; only failure matters.
pub async fn cleanup(plugin: &str, ctx: &PluginContext<'_>, raw_config: &[u8]) -> NetResult<()> {
    invoke(plugin, ctx, raw_config).await.map(|_| ())
}

/// Gateway for an allocation whose plugin left it unset: the first usable
/// address of the network, which is where the bridge address lands too.
pub fn derive_gateway(net: Ipv4Net) -> Ipv4Addr {
    crate::net::next_ip(net.trunc().network())
}

/// Make the allocation carry exactly one default route through its gateway.
///
/// An existing equal default route is left alone, a gatewayless one is
/// ignored, and one through a different gateway is a conflict rather than a
/// silent override.
pub fn reconcile_default_route(ip4: &mut Ip4Config) -> NetResult<()> {
    let gateway = ip4.gateway.ok_or_else(|| {
        NetError::Ipam("default gateway requested but allocation has no gateway".to_string())
    })?;

    let mut have_matching = false;
    for route in &ip4.routes {
        if route.dst.prefix_len() != 0 {
            continue;
        }
        match route.gw {
            Some(gw) if gw == gateway => have_matching = true,
            Some(gw) => {
                return Err(NetError::Conflict(format!(
                    "allocation routes default via {} but the bridge gateway is {}",
                    gw, gateway
                )))
            }
            None => {}
        }
    }
    if !have_matching {
        ip4.routes.push(Route {
            dst: Ipv4Net::default(),
            gw: Some(gateway),
        });
    }
    Ok(())
}

/// Apply the allocation to the container's interface. Runs on a
/// namespace-pinned thread, so it is synchronous and drives its own runtime.
pub fn configure_iface(if_name: &str, result: &AllocationResult) -> NetResult<()> {
    let ip4 = result
        .ip4
        .as_ref()
        .ok_or_else(|| NetError::Ipam("allocation has no IPv4 config".to_string()))?;

    block_on_current(async {
        let nl = NetlinkHandle::new()?;
        let index = nl.get_link_index(if_name).await?;
        nl.add_address(index, ip4.ip).await?;
        nl.set_link_up(index).await?;

        // loopback may not exist in minimal namespaces
        if let Ok(lo) = nl.get_link_index("lo").await {
            let _ = nl.set_link_up(lo).await;
        }

        for route in &ip4.routes {
            nl.add_route_v4(route.dst, route.gw, index).await?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn ip4(gateway: Option<&str>, routes: Vec<Route>) -> Ip4Config {
        Ip4Config {
            ip: net("10.244.1.7/24"),
            gateway: gateway.map(ip),
            routes,
        }
    }

    #[test]
    fn gateway_is_first_usable_address() {
        assert_eq!(derive_gateway(net("10.1.0.0/24")), ip("10.1.0.1"));
        assert_eq!(derive_gateway(net("192.168.5.128/25")), ip("192.168.5.129"));
    }

    #[test]
    fn default_route_appended_when_absent() {
        let mut c = ip4(Some("10.244.1.1"), vec![]);
        reconcile_default_route(&mut c).unwrap();
        assert_eq!(
            c.routes,
            vec![Route {
                dst: net("0.0.0.0/0"),
                gw: Some(ip("10.244.1.1")),
            }]
        );
    }

    #[test]
    fn matching_default_route_is_not_duplicated() {
        let existing = Route {
            dst: net("0.0.0.0/0"),
            gw: Some(ip("10.244.1.1")),
        };
        let mut c = ip4(Some("10.244.1.1"), vec![existing.clone()]);
        reconcile_default_route(&mut c).unwrap();
        assert_eq!(c.routes, vec![existing]);
    }

    #[test]
    fn differing_default_route_is_conflict() {
        let mut c = ip4(
            Some("10.244.1.1"),
            vec![Route {
                dst: net("0.0.0.0/0"),
                gw: Some(ip("10.244.9.9")),
            }],
        );
        assert!(matches!(
            reconcile_default_route(&mut c),
            Err(NetError::Conflict(_))
        ));
    }

    #[test]
    fn gatewayless_default_route_is_ignored() {
        let mut c = ip4(
            Some("10.244.1.1"),
            vec![Route {
                dst: net("0.0.0.0/0"),
                gw: None,
            }],
        );
        reconcile_default_route(&mut c).unwrap();
        assert_eq!(c.routes.len(), 2);
        assert_eq!(c.routes[1].gw, Some(ip("10.244.1.1")));
    }

    #[test]
    fn missing_gateway_is_ipam_error() {
        let mut c = ip4(None, vec![]);
        assert!(matches!(
            reconcile_default_route(&mut c),
            Err(NetError::Ipam(_))
        ));
    }

    #[test]
    fn allocation_result_parses_plugin_output() {
        let json = r#"{
            "ip4": {
                "ip": "10.244.1.7/24",
                "gateway": "10.244.1.1",
                "routes": [{"dst": "10.96.0.0/12", "gw": "10.244.1.1"}]
            },
            "dns": {"nameservers": ["10.96.0.10"]}
        }"#;
        let result: AllocationResult = serde_json::from_str(json).unwrap();
        let ip4 = result.ip4.unwrap();
        assert_eq!(ip4.ip, net("10.244.1.7/24"));
        assert_eq!(ip4.gateway, Some(ip("10.244.1.1")));
        assert_eq!(ip4.routes.len(), 1);
        assert_eq!(result.dns.nameservers, vec!["10.96.0.10"]);
    }
}
