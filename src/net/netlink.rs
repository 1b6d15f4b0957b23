use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::os::unix::io::RawFd;

use futures::TryStreamExt;
use ipnet::Ipv4Net;
use netlink_packet_route::link::nlas::{Info, InfoKind, Nla as LinkNla};
use netlink_packet_route::AF_INET;

use crate::net::error::{NetError, NetResult};

/// Netlink handle wrapping rtnetlink for all bridge/veth/link/address
/// operations. One handle per namespace: the connection is bound to the
/// namespace the creating thread was in, so in-container work opens its own
/// handle after setns().
pub struct NetlinkHandle {
    handle: rtnetlink::Handle,
    // Keep the connection task alive
    _conn_task: tokio::task::JoinHandle<()>,
}

impl NetlinkHandle {
    pub fn new() -> NetResult<Self> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        let conn_task = tokio::spawn(conn);
        Ok(Self {
            handle,
            _conn_task: conn_task,
        })
    }

    // ── Link lookup ───────────────────────────────────────────────────

    /// Get a link's ifindex by name. Returns NotFound if the link doesn't exist.
    pub async fn get_link_index(&self, name: &str) -> NetResult<u32> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(msg.header.index),
            Ok(None) => Err(NetError::NotFound(format!("link {}", name))),
            Err(e) => {
                // rtnetlink returns an error for "not found" on some kernels
                if e.to_string().contains("No such device") {
                    Err(NetError::NotFound(format!("link {}", name)))
                } else {
                    Err(NetError::Netlink(e))
                }
            }
        }
    }

    /// Whether the named link carries bridge link info. NotFound if absent.
    pub async fn link_is_bridge(&self, name: &str) -> NetResult<bool> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(msg)) => {
                for nla in &msg.nlas {
                    if let LinkNla::Info(infos) = nla {
                        for info in infos {
                            if let Info::Kind(kind) = info {
                                return Ok(matches!(kind, InfoKind::Bridge));
                            }
                        }
                    }
                }
                Ok(false)
            }
            Ok(None) => Err(NetError::NotFound(format!("link {}", name))),
            Err(e) => {
                if e.to_string().contains("No such device") {
                    Err(NetError::NotFound(format!("link {}", name)))
                } else {
                    Err(NetError::Netlink(e))
                }
            }
        }
    }

    // ── Link mutation ─────────────────────────────────────────────────

    /// Create a bridge device. "File exists" is tolerated: another invocation
    /// creating the same bridge first is the expected steady state, and the
    /// caller adopts the device after a kind check.
    pub async fn add_bridge(&self, name: &str, mtu: u32) -> NetResult<()> {
        let mut req = self.handle.link().add().bridge(name.to_string());
        if mtu > 0 {
            req.message_mut().nlas.push(LinkNla::Mtu(mtu));
        }
        match req.execute().await {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("File exists") => Ok(()),
            Err(e) => Err(NetError::Netlink(e)),
        }
    }

    /// Create a veth pair. The MTU applies to the first-named end; the peer
    /// keeps the kernel default until configured separately.
    pub async fn add_veth(&self, name: &str, peer: &str, mtu: u32) -> NetResult<()> {
        let mut req = self
            .handle
            .link()
            .add()
            .veth(name.to_string(), peer.to_string());
        if mtu > 0 {
            req.message_mut().nlas.push(LinkNla::Mtu(mtu));
        }
        req.execute().await.map_err(NetError::Netlink)
    }

    pub async fn set_link_up(&self, index: u32) -> NetResult<()> {
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(NetError::Netlink)
    }

    pub async fn set_link_mtu(&self, index: u32, mtu: u32) -> NetResult<()> {
        self.handle
            .link()
            .set(index)
            .mtu(mtu)
            .execute()
            .await
            .map_err(NetError::Netlink)
    }

    /// Set a link's master (attach to bridge)
    pub async fn set_link_master(&self, index: u32, master_index: u32) -> NetResult<()> {
        self.handle
            .link()
            .set(index)
            .master(master_index)
            .execute()
            .await
            .map_err(NetError::Netlink)
    }

    /// Move a link into the network namespace behind `ns_fd`
    pub async fn set_link_netns_fd(&self, index: u32, ns_fd: RawFd) -> NetResult<()> {
        self.handle
            .link()
            .set(index)
            .setns_by_fd(ns_fd)
            .execute()
            .await
            .map_err(NetError::Netlink)
    }

    /// Delete a link by index. Idempotent against "already gone".
    pub async fn del_link(&self, index: u32) -> NetResult<()> {
        match self.handle.link().del(index).execute().await {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("No such device") => Ok(()),
            Err(e) => Err(NetError::Netlink(e)),
        }
    }

    // ── Addresses ─────────────────────────────────────────────────────

    /// Add an IPv4 address with prefix to a link. Already-assigned is a no-op.
    pub async fn add_address(&self, link_index: u32, net: Ipv4Net) -> NetResult<()> {
        let result = self
            .handle
            .address()
            .add(link_index, IpAddr::V4(net.addr()), net.prefix_len())
            .execute()
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("File exists") => Ok(()),
            Err(e) => Err(NetError::Netlink(e)),
        }
    }

    /// List the IPv4 addresses assigned to a link, with their prefixes.
    pub async fn list_ipv4_addresses(&self, link_index: u32) -> NetResult<Vec<Ipv4Net>> {
        use netlink_packet_route::address::nlas::Nla as AddressNla;

        let mut addrs = self
            .handle
            .address()
            .get()
            .set_link_index_filter(link_index)
            .execute();

        let mut out = Vec::new();
        while let Some(msg) = addrs.try_next().await.map_err(NetError::Netlink)? {
            if u16::from(msg.header.family) != AF_INET {
                continue;
            }
            let mut local = None;
            let mut address = None;
            for nla in &msg.nlas {
                match nla {
                    AddressNla::Local(b) if b.len() == 4 => {
                        local = Some(Ipv4Addr::new(b[0], b[1], b[2], b[3]));
                    }
                    AddressNla::Address(b) if b.len() == 4 => {
                        address = Some(Ipv4Addr::new(b[0], b[1], b[2], b[3]));
                    }
                    _ => {}
                }
            }
            // IFA_LOCAL is the interface address; IFA_ADDRESS the peer on
            // pointopoint links. Prefer local, fall back to address.
            if let Some(ip) = local.or(address) {
                if let Ok(net) = Ipv4Net::new(ip, msg.header.prefix_len) {
                    out.push(net);
                }
            }
        }
        Ok(out)
    }

    // ── Routes ────────────────────────────────────────────────────────

    /// Add an IPv4 route. A zero-prefix destination with a gateway becomes the
    /// default route; without a gateway the route goes out `oif` directly.
    /// "File exists" is tolerated so re-applying an allocation converges.
    pub async fn add_route_v4(
        &self,
        dst: Ipv4Net,
        gateway: Option<Ipv4Addr>,
        oif: u32,
    ) -> NetResult<()> {
        let base = self.handle.route().add().v4();
        let result = match (dst.prefix_len(), gateway) {
            (0, Some(gw)) => base.gateway(gw).execute().await,
            (_, Some(gw)) => {
                base.destination_prefix(dst.network(), dst.prefix_len())
                    .gateway(gw)
                    .execute()
                    .await
            }
            (_, None) => {
                base.destination_prefix(dst.network(), dst.prefix_len())
                    .output_interface(oif)
                    .execute()
                    .await
            }
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("File exists") => Ok(()),
            Err(e) => Err(NetError::Netlink(e)),
        }
    }
}

/// Drive an async netlink future to completion on the current thread.
///
/// Namespace-pinned threads have no ambient runtime; each builds a
/// current-thread runtime so the netlink connection it opens stays inside the
/// namespace the thread entered.
pub fn block_on_current<T>(fut: impl Future<Output = NetResult<T>>) -> NetResult<T> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(NetError::Io)?;
    rt.block_on(fut)
}
