use thiserror::Error;

/// Error type for every networking operation in this crate.
///
/// The first six variants map to the failure classes the invocation reports
/// upward; `Netlink`/`Io` wrap transport failures from the kernel control
/// surface.
#[derive(Debug, Error)]
pub enum NetError {
    /// Malformed or incomplete declarative input
    #[error("config error: {0}")]
    Config(String),
    /// Existing kernel state incompatible with the requested state
    #[error("conflict: {0}")]
    Conflict(String),
    /// Failure creating, moving, or attaching a link
    #[error("link error: {0}")]
    Link(String),
    /// Failure opening or executing within a network namespace
    #[error("namespace error: {0}")]
    Namespace(String),
    /// The delegated address manager failed or returned an unusable result
    #[error("address manager error: {0}")]
    Ipam(String),
    /// NAT rule install/removal failure
    #[error("firewall command '{cmd}' failed: {stderr}")]
    Firewall { cmd: String, stderr: String },
    /// Resource not found (interface, bridge, etc.)
    #[error("not found: {0}")]
    NotFound(String),
    #[error("netlink error: {0}")]
    Netlink(#[from] rtnetlink::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetError {
    /// Stable per-kind exit code reported on the invocation's error channel.
    pub fn exit_code(&self) -> i32 {
        match self {
            NetError::Config(_) => 1,
            NetError::Conflict(_) => 2,
            NetError::Link(_) => 3,
            NetError::Namespace(_) => 4,
            NetError::Ipam(_) => 5,
            NetError::Firewall { .. } => 6,
            NetError::NotFound(_) | NetError::Netlink(_) | NetError::Io(_) => 7,
        }
    }
}

pub type NetResult<T> = Result<T, NetError>;
