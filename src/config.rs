//! Typed representation of the declarative network intent.
//!
//! Parsed once per invocation from the raw JSON handed in by the runtime.
//! Unknown fields are ignored here but preserved in the raw bytes, which are
//! forwarded verbatim to the delegated address manager.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::net::{next_ip, NetError, NetResult};

pub const DEFAULT_BRIDGE_NAME: &str = "stitch0";

#[derive(Debug, Clone, Deserialize)]
pub struct NetConf {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "bridge", default = "default_bridge_name")]
    pub bridge: String,
    #[serde(rename = "bridgeSubnet", default)]
    pub bridge_subnet: Option<Ipv4Net>,
    #[serde(rename = "bridgeIP", default)]
    pub bridge_ip: Option<String>,
    #[serde(rename = "logToFile", default)]
    pub log_to_file: Option<PathBuf>,
    #[serde(rename = "isGateway", default)]
    pub is_gateway: bool,
    #[serde(rename = "isDefaultGateway", default)]
    pub is_default_gateway: bool,
    #[serde(rename = "ipMasq", default)]
    pub ip_masq: bool,
    #[serde(default)]
    pub mtu: u32,
    #[serde(rename = "linkMTUOverhead", default)]
    pub link_mtu_overhead: u32,
    #[serde(rename = "hairpinMode", default)]
    pub hairpin_mode: bool,
    #[serde(default)]
    pub ipam: IpamConf,
    #[serde(default)]
    pub dns: DnsConf,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct IpamConf {
    /// Name of the delegated address-manager plugin. The rest of the ipam
    /// block is opaque to this agent and travels in the raw config bytes.
    #[serde(rename = "type", default)]
    pub plugin: String,
}

/// DNS settings passed through to the invocation result unmodified.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct DnsConf {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

fn default_bridge_name() -> String {
    DEFAULT_BRIDGE_NAME.to_string()
}

/// Parse the raw declarative input. Requesting a default gateway implies
/// acting as a gateway, normalized here so downstream checks test one flag.
pub fn load(bytes: &[u8]) -> NetResult<NetConf> {
    let mut conf: NetConf = serde_json::from_slice(bytes)
        .map_err(|e| NetError::Config(format!("failed to load network config: {}", e)))?;
    if conf.is_default_gateway {
        conf.is_gateway = true;
    }
    Ok(conf)
}

impl NetConf {
    /// MTU for the veth link: bridge MTU minus the configured overhead.
    /// Falls back to the bridge MTU unchanged when the subtraction
    /// underflows; callers depend on that recovery, so it is not an error.
    pub fn link_mtu(&self) -> u32 {
        self.mtu
            .checked_sub(self.link_mtu_overhead)
            .unwrap_or(self.mtu)
    }

    /// Address the bridge should carry: the explicitly configured one
    /// (validated against the subnet, accepted in plain or CIDR form) or the
    /// first address of the subnet.
    pub fn compute_bridge_address(&self) -> NetResult<Ipv4Net> {
        let subnet = self
            .bridge_subnet
            .ok_or_else(|| NetError::Config("mandatory bridgeSubnet not specified".to_string()))?
            .trunc();

        let addr = match &self.bridge_ip {
            Some(raw) => {
                let ip = if let Ok(ip) = raw.parse::<Ipv4Addr>() {
                    ip
                } else if let Ok(net) = raw.parse::<Ipv4Net>() {
                    net.addr()
                } else {
                    return Err(NetError::Config(format!("invalid bridgeIP {:?}", raw)));
                };
                if !subnet.contains(&ip) {
                    return Err(NetError::Config(format!(
                        "bridgeIP {} is not in bridgeSubnet {}",
                        ip, subnet
                    )));
                }
                ip
            }
            None => next_ip(subnet.network()),
        };

        Ipv4Net::new(addr, subnet.prefix_len())
            .map_err(|e| NetError::Config(format!("invalid bridge address: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf(json: &str) -> NetConf {
        load(json.as_bytes()).unwrap()
    }

    #[test]
    fn bridge_name_defaults_when_absent() {
        let c = conf(r#"{"name": "testnet"}"#);
        assert_eq!(c.bridge, DEFAULT_BRIDGE_NAME);
    }

    #[test]
    fn explicit_bridge_name_is_kept() {
        let c = conf(r#"{"name": "testnet", "bridge": "br7"}"#);
        assert_eq!(c.bridge, "br7");
    }

    #[test]
    fn default_gateway_implies_gateway() {
        let c = conf(r#"{"isDefaultGateway": true}"#);
        assert!(c.is_gateway);
        assert!(c.is_default_gateway);
    }

    #[test]
    fn malformed_input_is_config_error() {
        let err = load(b"{not json").unwrap_err();
        assert!(matches!(err, NetError::Config(_)));
    }

    #[test]
    fn link_mtu_subtracts_overhead() {
        let c = conf(r#"{"mtu": 1500, "linkMTUOverhead": 100}"#);
        assert_eq!(c.link_mtu(), 1400);
    }

    #[test]
    fn link_mtu_clamps_on_underflow() {
        let c = conf(r#"{"mtu": 1500, "linkMTUOverhead": 2000}"#);
        assert_eq!(c.link_mtu(), 1500);
    }

    #[test]
    fn bridge_address_derived_from_subnet() {
        let c = conf(r#"{"bridgeSubnet": "10.244.0.0/16"}"#);
        assert_eq!(
            c.compute_bridge_address().unwrap(),
            "10.244.0.1/16".parse::<Ipv4Net>().unwrap()
        );
    }

    #[test]
    fn explicit_bridge_address_inside_subnet() {
        let c = conf(r#"{"bridgeSubnet": "10.244.0.0/16", "bridgeIP": "10.244.5.5"}"#);
        assert_eq!(
            c.compute_bridge_address().unwrap(),
            "10.244.5.5/16".parse::<Ipv4Net>().unwrap()
        );
    }

    #[test]
    fn explicit_bridge_address_accepts_cidr_form() {
        let c = conf(r#"{"bridgeSubnet": "10.244.0.0/16", "bridgeIP": "10.244.5.5/24"}"#);
        // only the address part matters; the prefix comes from the subnet
        assert_eq!(
            c.compute_bridge_address().unwrap(),
            "10.244.5.5/16".parse::<Ipv4Net>().unwrap()
        );
    }

    #[test]
    fn bridge_address_outside_subnet_is_config_error() {
        let c = conf(r#"{"bridgeSubnet": "10.244.0.0/16", "bridgeIP": "10.5.0.1"}"#);
        assert!(matches!(
            c.compute_bridge_address(),
            Err(NetError::Config(_))
        ));
    }

    #[test]
    fn missing_subnet_is_config_error() {
        let c = conf(r#"{"name": "testnet"}"#);
        assert!(matches!(
            c.compute_bridge_address(),
            Err(NetError::Config(_))
        ));
    }

    #[test]
    fn ipam_plugin_and_dns_parse() {
        let c = conf(
            r#"{
                "name": "testnet",
                "ipam": {"type": "host-local", "subnet": "10.244.1.0/24"},
                "dns": {"nameservers": ["10.244.0.1"], "search": ["cluster.local"]}
            }"#,
        );
        assert_eq!(c.ipam.plugin, "host-local");
        assert_eq!(c.dns.nameservers, vec!["10.244.0.1"]);
        assert_eq!(c.dns.search, vec!["cluster.local"]);
    }
}
