pub mod bridge;
pub mod error;
pub mod nat;
pub mod netlink;
pub mod netns;
pub mod veth;

pub use error::{NetError, NetResult};

use std::net::Ipv4Addr;

/// Next address after `ip` in numeric order.
pub(crate) fn next_ip(ip: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip).wrapping_add(1))
}

/// Turn on IPv4 forwarding host-wide. Required when the bridge acts as the
/// containers' gateway.
pub fn enable_ip4_forwarding() -> NetResult<()> {
    std::fs::write("/proc/sys/net/ipv4/ip_forward", b"1").map_err(|e| {
        NetError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to enable IPv4 forwarding: {}", e),
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_ip_increments_within_octet() {
        assert_eq!(
            next_ip(Ipv4Addr::new(10, 1, 0, 0)),
            Ipv4Addr::new(10, 1, 0, 1)
        );
    }

    #[test]
    fn next_ip_carries_across_octets() {
        assert_eq!(
            next_ip(Ipv4Addr::new(10, 1, 0, 255)),
            Ipv4Addr::new(10, 1, 1, 0)
        );
    }
}
