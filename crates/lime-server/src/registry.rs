//! Registered node addresses and their channels.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use lime_core::ServerChannel;
use lime_proto::Node;

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Maps registered node addresses to their server channels.
///
/// Addresses are keyed with the instance resolved, so `a@b` and
/// `a@b/default` name the same entry. Registration is first-wins: a node
/// stays taken until the owning session unregisters it.
#[derive(Default)]
pub struct NodeRegistry {
    channels: StdMutex<HashMap<Node, Arc<ServerChannel>>>,
}

impl NodeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `candidate` for `channel`.
    ///
    /// Returns the resolved address on success, or `None` when another
    /// channel already holds it. Check-and-insert happens under one lock,
    /// so concurrent claims of the same address see exactly one winner.
    pub fn try_register(&self, candidate: &Node, channel: &Arc<ServerChannel>) -> Option<Node> {
        let node = candidate.resolve_instance();
        let mut channels = lock(&self.channels);
        if channels.contains_key(&node) {
            return None;
        }
        channels.insert(node.clone(), channel.clone());
        Some(node)
    }

    /// Release `node`'s registration, returning its channel.
    ///
    /// Only removes the entry when it is still held by `channel`, so a
    /// session tearing down cannot evict the address's next owner.
    pub fn unregister(&self, node: &Node, channel: &Arc<ServerChannel>) -> Option<Arc<ServerChannel>> {
        let node = node.resolve_instance();
        let mut channels = lock(&self.channels);
        if channels.get(&node).is_some_and(|current| Arc::ptr_eq(current, channel)) {
            channels.remove(&node)
        } else {
            None
        }
    }

    /// Look up the channel registered for `node`.
    pub fn get(&self, node: &Node) -> Option<Arc<ServerChannel>> {
        lock(&self.channels).get(&node.resolve_instance()).cloned()
    }

    /// The registered addresses, in no particular order.
    pub fn nodes(&self) -> Vec<Node> {
        lock(&self.channels).keys().cloned().collect()
    }

    /// How many addresses are registered.
    pub fn len(&self) -> usize {
        lock(&self.channels).len()
    }

    /// Whether no address is registered.
    pub fn is_empty(&self) -> bool {
        lock(&self.channels).is_empty()
    }
}
