//! In-memory connection indices owned by the hub loop.

use std::collections::{HashMap, HashSet};

use crate::connection::{ConnectionId, Peer};

/// Connection table plus the group and identity indices over it.
///
/// Every registered [`Peer`] is indexed under its own group and its own
/// identity. Insert and remove touch all three maps in one call, so no caller
/// observes a peer that is present in one index but not the other.
#[derive(Default)]
pub struct Registry {
    peers: HashMap<ConnectionId, Peer>,
    by_group: HashMap<String, HashSet<ConnectionId>>,
    by_identity: HashMap<String, HashSet<ConnectionId>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` (and keeps the existing entry) if the id is already registered.
    pub fn insert(&mut self, peer: Peer) -> bool {
        if self.peers.contains_key(&peer.id()) {
            return false;
        }
        self.by_group
            .entry(peer.group().to_string())
            .or_default()
            .insert(peer.id());
        self.by_identity
            .entry(peer.identity().to_string())
            .or_default()
            .insert(peer.id());
        self.peers.insert(peer.id(), peer);
        true
    }

    /// Removes a peer from every index, dropping empty index keys.
    ///
    /// The returned peer owns the last producer handle of its outbound queue;
    /// dropping it closes the queue.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Peer> {
        let peer = self.peers.remove(&id)?;
        detach(&mut self.by_group, peer.group(), id);
        detach(&mut self.by_identity, peer.identity(), id);
        Some(peer)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn group_members(&self, group: &str) -> Vec<ConnectionId> {
        members(&self.by_group, group)
    }

    pub fn identity_members(&self, identity: &str) -> Vec<ConnectionId> {
        members(&self.by_identity, identity)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn group_sizes(&self) -> HashMap<String, usize> {
        sizes(&self.by_group)
    }

    pub fn identity_sizes(&self) -> HashMap<String, usize> {
        sizes(&self.by_identity)
    }
}

fn detach(index: &mut HashMap<String, HashSet<ConnectionId>>, key: &str, id: ConnectionId) {
    if let Some(ids) = index.get_mut(key) {
        ids.remove(&id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}

fn members(index: &HashMap<String, HashSet<ConnectionId>>, key: &str) -> Vec<ConnectionId> {
    index
        .get(key)
        .map(|ids| ids.iter().copied().collect())
        .unwrap_or_default()
}

fn sizes(index: &HashMap<String, HashSet<ConnectionId>>) -> HashMap<String, usize> {
    index
        .iter()
        .map(|(key, ids)| (key.clone(), ids.len()))
        .collect()
}
