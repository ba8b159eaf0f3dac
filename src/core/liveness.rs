//! Host liveness context
//!
//! Every worker receives a [`Liveness`] at construction and stops at its next
//! loop boundary once the host has shut down. Contexts form a tree: shutting
//! down a parent also shuts down every child derived from it.

use tokio_util::sync::CancellationToken;

/// Cancellation context standing in for "the host process is still running"
#[derive(Debug, Clone)]
pub struct Liveness {
    token: CancellationToken,
}

impl Liveness {
    /// Create a new root context
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Derive a child context; it dies with this one but can be shut down alone
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    /// Whether the host is still alive
    pub fn is_host_alive(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Signal that the host is going away
    pub fn shutdown(&self) {
        self.token.cancel();
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_propagates_to_children() {
        let root = Liveness::new();
        let child = root.child();
        let grandchild = child.child();
        assert!(grandchild.is_host_alive());

        root.shutdown();
        assert!(!root.is_host_alive());
        assert!(!child.is_host_alive());
        assert!(!grandchild.is_host_alive());
    }

    #[test]
    fn test_child_shutdown_leaves_parent_alive() {
        let root = Liveness::new();
        let child = root.child();
        child.shutdown();
        assert!(!child.is_host_alive());
        assert!(root.is_host_alive());
    }

    #[test]
    fn test_clones_share_state() {
        let a = Liveness::new();
        let b = a.clone();
        b.shutdown();
        assert!(!a.is_host_alive());
    }
}
