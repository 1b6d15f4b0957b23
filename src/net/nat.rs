//! Masquerade rule lifecycle for a container's allocated subnet.
//!
//! The chain name and rule comment are derived deterministically from the
//! (network name, container id) pair on both attach and detach; nothing is
//! persisted between the two invocations, so the derivation below is the only
//! link between setup and teardown.
//!
//! iptables is always executed with an argv array. The network name and
//! container id come from the runtime unsanitized, and the comment embeds
//! them verbatim; passing it as a single argument keeps hostile values inert.

use std::process::Output;

use ipnet::Ipv4Net;
use sha2::{Digest, Sha512};

use crate::net::error::{NetError, NetResult};

const CHAIN_PREFIX: &str = "STITCH-";
// iptables chain names are capped at 28 usable characters
const MAX_CHAIN_LENGTH: usize = 28;

/// Derivation v1: `("STITCH-" + hex(sha512(name + id)))[..28]`.
///
/// Stable by contract. Changing this algorithm would strand rules installed
/// by earlier attaches, because detach recomputes the name from scratch.
pub fn format_chain_name(network_name: &str, container_id: &str) -> String {
    let digest = Sha512::digest(format!("{}{}", network_name, container_id).as_bytes());
    let mut chain = String::with_capacity(MAX_CHAIN_LENGTH);
    chain.push_str(CHAIN_PREFIX);
    for byte in digest {
        if chain.len() >= MAX_CHAIN_LENGTH {
            break;
        }
        chain.push_str(&format!("{:02x}", byte));
    }
    chain.truncate(MAX_CHAIN_LENGTH);
    chain
}

/// Human-readable rule comment tying the rule back to its owner.
pub fn format_comment(network_name: &str, container_id: &str) -> String {
    format!("name: \"{}\" id: \"{}\"", network_name, container_id)
}

fn rule(spec: &[&str], comment: &str) -> Vec<String> {
    let mut args: Vec<String> = spec.iter().map(|s| s.to_string()).collect();
    args.extend(["-m", "comment", "--comment"].iter().map(|s| s.to_string()));
    args.push(comment.to_string());
    args
}

/// The rule set as (target chain, rule spec) pairs, each spec a flat argv
/// fragment with the comment as one element.
fn masquerade_rules(net: Ipv4Net, chain: &str, comment: &str) -> Vec<(String, Vec<String>)> {
    let net = net.trunc().to_string();
    vec![
        // traffic staying inside the allocated network is never masqueraded
        (chain.to_string(), rule(&["-d", &net, "-j", "ACCEPT"], comment)),
        // multicast is excluded from source translation
        (
            chain.to_string(),
            rule(&["!", "-d", "224.0.0.0/4", "-j", "MASQUERADE"], comment),
        ),
        (
            "POSTROUTING".to_string(),
            rule(&["-s", &net, "-j", chain], comment),
        ),
    ]
}

fn jump_spec(net: Ipv4Net, chain: &str, comment: &str) -> Vec<String> {
    rule(&["-s", &net.trunc().to_string(), "-j", chain], comment)
}

/// Install the masquerade rule set for `net`. Every rule is check-then-add,
/// so a re-invoked attach converges without duplicating rules.
pub async fn setup_masquerade(net: Ipv4Net, chain: &str, comment: &str) -> NetResult<()> {
    // Chain already existing is the steady state after the first attach
    let _ = run_iptables(&["-t", "nat", "-N", chain]).await?;

    for (target, spec) in masquerade_rules(net, chain, comment) {
        ensure_rule(&target, &spec).await?;
    }
    Ok(())
}

/// Remove the masquerade rule set. Absence at every step is success: the
/// chain may never have been installed, or a prior detach already removed it.
///
/// When the caller could not recover the allocated subnet (interface already
/// gone), the POSTROUTING jump is located by chain name in the rule listing
/// so the chain is never left referenced and undeletable.
pub async fn teardown_masquerade(
    net: Option<Ipv4Net>,
    chain: &str,
    comment: &str,
) -> NetResult<()> {
    let net = match net {
        Some(net) => Some(net),
        None => find_jump_source(chain).await?,
    };
    if let Some(net) = net {
        let spec = jump_spec(net, chain, comment);
        let mut args = vec!["-t", "nat", "-D", "POSTROUTING"];
        args.extend(spec.iter().map(String::as_str));
        let _ = run_iptables(&args).await?;
    }
    let _ = run_iptables(&["-t", "nat", "-F", chain]).await?;
    let _ = run_iptables(&["-t", "nat", "-X", chain]).await?;
    Ok(())
}

/// Append the rule unless an identical one is already present.
async fn ensure_rule(target: &str, spec: &[String]) -> NetResult<()> {
    let mut check = vec!["-t", "nat", "-C", target];
    check.extend(spec.iter().map(String::as_str));
    if run_iptables(&check).await?.status.success() {
        return Ok(());
    }

    let mut append = vec!["-t", "nat", "-A", target];
    append.extend(spec.iter().map(String::as_str));
    let output = run_iptables(&append).await?;
    if !output.status.success() {
        return Err(NetError::Firewall {
            cmd: format!("iptables {}", append.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

/// Recover the subnet of the POSTROUTING jump targeting `chain`, if present.
async fn find_jump_source(chain: &str) -> NetResult<Option<Ipv4Net>> {
    let output = run_iptables(&["-t", "nat", "-S", "POSTROUTING"]).await?;
    if !output.status.success() {
        return Ok(None);
    }
    Ok(parse_jump_source(
        &String::from_utf8_lossy(&output.stdout),
        chain,
    ))
}

fn parse_jump_source(listing: &str, chain: &str) -> Option<Ipv4Net> {
    for line in listing.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if !tokens.windows(2).any(|w| w[0] == "-j" && w[1] == chain) {
            continue;
        }
        if let Some(pos) = tokens.iter().position(|t| *t == "-s") {
            if let Some(net) = tokens.get(pos + 1).and_then(|raw| raw.parse().ok()) {
                return Some(net);
            }
        }
    }
    None
}

async fn run_iptables(args: &[&str]) -> NetResult<Output> {
    tokio::process::Command::new("iptables")
        .args(args)
        .output()
        .await
        .map_err(NetError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[test]
    fn chain_name_is_deterministic_across_invocations() {
        // attach and detach must compute the same identity independently
        let add = format_chain_name("testnet", "f81d4fae7dec");
        let del = format_chain_name("testnet", "f81d4fae7dec");
        assert_eq!(add, del);
    }

    #[test]
    fn chain_name_has_prefix_and_fits_iptables_limit() {
        let chain = format_chain_name("testnet", "f81d4fae7dec");
        assert!(chain.starts_with(CHAIN_PREFIX));
        assert_eq!(chain.len(), MAX_CHAIN_LENGTH);
    }

    #[test]
    fn chain_name_differs_per_container() {
        assert_ne!(
            format_chain_name("testnet", "container-a"),
            format_chain_name("testnet", "container-b")
        );
    }

    #[test]
    fn chain_name_differs_per_network() {
        assert_ne!(
            format_chain_name("net-a", "container"),
            format_chain_name("net-b", "container")
        );
    }

    #[test]
    fn comment_names_both_owners() {
        assert_eq!(
            format_comment("testnet", "abc123"),
            "name: \"testnet\" id: \"abc123\""
        );
    }

    #[test]
    fn hostile_container_id_stays_a_single_argument() {
        // a quote-laden id must ride through as one inert argv element, not
        // as shell text that could terminate the rule and run commands
        let id = "x' ; touch /tmp/owned ; echo '";
        let chain = format_chain_name("testnet", id);
        let comment = format_comment("testnet", id);
        for (_, spec) in masquerade_rules(net("10.244.0.0/16"), &chain, &comment) {
            assert_eq!(spec.last().unwrap(), &comment);
            assert_eq!(spec.iter().filter(|arg| arg.contains("touch")).count(), 1);
        }
    }

    #[test]
    fn rules_target_chain_and_postrouting() {
        let chain = format_chain_name("testnet", "abc");
        let comment = format_comment("testnet", "abc");
        let rules = masquerade_rules(net("10.244.0.0/16"), &chain, &comment);
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].0, chain);
        assert_eq!(rules[1].0, chain);
        assert_eq!(rules[2].0, "POSTROUTING");
        assert!(rules[2].1.contains(&"10.244.0.0/16".to_string()));
    }

    #[test]
    fn jump_source_recovered_from_rule_listing() {
        let chain = format_chain_name("testnet", "abc");
        let listing = format!(
            "-P POSTROUTING ACCEPT\n\
             -A POSTROUTING -s 172.17.0.0/16 -j MASQUERADE\n\
             -A POSTROUTING -s 10.88.7.0/24 -m comment --comment \"name: \\\"testnet\\\" id: \\\"abc\\\"\" -j {}\n",
            chain
        );
        assert_eq!(
            parse_jump_source(&listing, &chain),
            Some(net("10.88.7.0/24"))
        );
    }

    #[test]
    fn jump_source_absent_when_no_rule_targets_chain() {
        let chain = format_chain_name("testnet", "abc");
        let listing = "-P POSTROUTING ACCEPT\n-A POSTROUTING -s 172.17.0.0/16 -j MASQUERADE\n";
        assert_eq!(parse_jump_source(listing, &chain), None);
    }
}
