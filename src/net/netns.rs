use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use nix::sched::{setns, CloneFlags};
use tokio::sync::oneshot;

use crate::net::error::{NetError, NetResult};

/// Host-openable handle to a container's network namespace.
///
/// A namespace association is a property of the calling OS thread, not of the
/// process. Every closure handed to [`NetNs::run_inside`] therefore executes
/// on its own dedicated thread: the thread enters the namespace, runs the
/// closure, and exits, so the association can never leak into unrelated work
/// scheduled on a pooled thread.
///
/// The handle is closed when the value drops, on every exit path.
#[derive(Debug)]
pub struct NetNs {
    file: File,
}

impl NetNs {
    pub fn open(path: &Path) -> NetResult<Self> {
        let file = File::open(path).map_err(|e| {
            NetError::Namespace(format!("failed to open netns {}: {}", path.display(), e))
        })?;
        Ok(Self { file })
    }

    /// Open the invoking process's own network namespace. The veth setup
    /// captures this before entering the container so the host end of the
    /// pair can be moved back out.
    pub fn host() -> NetResult<File> {
        File::open("/proc/self/ns/net")
            .map_err(|e| NetError::Namespace(format!("failed to open host netns: {}", e)))
    }

    /// Run `f` with this namespace active on a dedicated OS thread.
    pub async fn run_inside<T, F>(&self, f: F) -> NetResult<T>
    where
        F: FnOnce() -> NetResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let ns_file = self
            .file
            .try_clone()
            .map_err(|e| NetError::Namespace(format!("failed to clone netns fd: {}", e)))?;
        let (tx, rx) = oneshot::channel();

        std::thread::spawn(move || {
            let result = setns(ns_file.as_raw_fd(), CloneFlags::CLONE_NEWNET)
                .map_err(|e| NetError::Namespace(format!("setns failed: {}", e)))
                .and_then(|_| f());
            let _ = tx.send(result);
        });

        rx.await
            .map_err(|_| NetError::Namespace("in-namespace thread panicked".to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_missing_namespace_is_namespace_error() {
        let err = NetNs::open(Path::new("/proc/self/ns/definitely-not-a-netns")).unwrap_err();
        assert!(matches!(err, NetError::Namespace(_)));
    }
}
