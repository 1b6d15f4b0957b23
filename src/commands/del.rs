//! Detach orchestration. Tolerant by design: the container and its namespace
//! are usually gone before detach runs, and a detach may be retried after a
//! partial failure, so absence at every step is success. Address release is
//! the exception, since leaking allocations poisons the pool.

use std::path::Path;

use tracing::debug;

use crate::config::NetConf;
use crate::ipam::{self, PluginContext};
use crate::net::netns::NetNs;
use crate::net::veth::remove_interface;
use crate::net::{nat, NetResult};

use super::CmdArgs;

pub async fn cmd_del(conf: &NetConf, args: &CmdArgs) -> NetResult<()> {
    let ctx = PluginContext {
        command: "DEL",
        container_id: &args.container_id,
        netns: &args.netns,
        if_name: &args.if_name,
    };
    ipam::cleanup(&conf.ipam.plugin, &ctx, &args.raw_config).await?;

    if args.netns.is_empty() {
        return Ok(());
    }

    let removed = match NetNs::open(Path::new(&args.netns)) {
        Ok(netns) => remove_interface(&netns, &args.if_name).await?,
        Err(e) => {
            debug!(error = %e, "namespace already gone, skipping interface removal");
            None
        }
    };

    if conf.ip_masq {
        let chain = nat::format_chain_name(&conf.name, &args.container_id);
        let comment = nat::format_comment(&conf.name, &args.container_id);
        nat::teardown_masquerade(removed, &chain, &comment).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn write_stub(dir: &Path, name: &str, marker: &Path) {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\ntouch {}\n", marker.display())).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[tokio::test]
    async fn empty_netns_succeeds_after_cleanup_without_firewall_work() {
        let dir = tempfile::tempdir().unwrap();
        let cleanup_marker = dir.path().join("cleanup_ran");
        let firewall_marker = dir.path().join("firewall_ran");
        write_stub(dir.path(), "stub-ipam", &cleanup_marker);
        write_stub(dir.path(), "iptables", &firewall_marker);

        std::env::set_var(crate::ipam::PLUGIN_PATH_ENV, dir.path());
        let orig_path = std::env::var("PATH").unwrap_or_default();
        std::env::set_var("PATH", format!("{}:{}", dir.path().display(), orig_path));

        let conf = crate::config::load(
            br#"{"name": "testnet", "ipMasq": true, "ipam": {"type": "stub-ipam"}}"#,
        )
        .unwrap();
        let args = CmdArgs {
            container_id: "c1".to_string(),
            netns: String::new(),
            if_name: "eth0".to_string(),
            raw_config: b"{}".to_vec(),
        };

        cmd_del(&conf, &args).await.unwrap();

        assert!(cleanup_marker.exists(), "address manager cleanup did not run");
        assert!(
            !firewall_marker.exists(),
            "firewall was invoked despite the missing namespace"
        );
    }
}
