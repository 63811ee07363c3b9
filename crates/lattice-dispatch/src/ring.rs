//! The consistent hashring.
//!
//! Each member owns a set of virtual nodes placed by hashing the member id
//! with the virtual node index. A key belongs to the first virtual node
//! clockwise from its hash, so replacing a member moves only the keys in
//! its own slices. State is published copy-on-write: writers build a new
//! state and swap it in under a short lock, and readers clone the current
//! `Arc` without blocking.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

/// A peer node participating in dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Member {
    pub id: String,
    pub address: String,
}

impl Member {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self { id: id.into(), address: address.into() }
    }
}

#[derive(Default)]
struct RingState {
    virtual_nodes: BTreeMap<u64, Arc<Member>>,
}

/// A consistent hashring with virtual nodes.
pub struct Hashring {
    replication_factor: u16,
    state: RwLock<Arc<RingState>>,
}

impl Hashring {
    pub fn new(replication_factor: u16) -> Self {
        Self {
            replication_factor: replication_factor.max(1),
            state: RwLock::new(Arc::new(RingState::default())),
        }
    }

    fn snapshot(&self) -> Arc<RingState> {
        match self.state.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn publish(&self, next: RingState) {
        match self.state.write() {
            Ok(mut guard) => *guard = Arc::new(next),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(next),
        }
    }

    fn virtual_hash(member_id: &str, index: u16) -> u64 {
        let mut bytes = Vec::with_capacity(member_id.len() + 3);
        bytes.extend_from_slice(member_id.as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(&index.to_be_bytes());
        xxh3_64(&bytes)
    }

    /// Add a member, placing its virtual nodes. Replaces any member with
    /// the same id.
    pub fn add_member(&self, member: Member) {
        let current = self.snapshot();
        let mut virtual_nodes: BTreeMap<u64, Arc<Member>> = current
            .virtual_nodes
            .iter()
            .filter(|(_, m)| m.id != member.id)
            .map(|(hash, m)| (*hash, Arc::clone(m)))
            .collect();

        let member = Arc::new(member);
        for index in 0..self.replication_factor {
            virtual_nodes.insert(Self::virtual_hash(&member.id, index), Arc::clone(&member));
        }

        debug!(member = %member.id, vnodes = self.replication_factor, "hashring member added");
        self.publish(RingState { virtual_nodes });
    }

    /// Remove a member and its virtual nodes.
    pub fn remove_member(&self, member_id: &str) {
        let current = self.snapshot();
        let virtual_nodes: BTreeMap<u64, Arc<Member>> = current
            .virtual_nodes
            .iter()
            .filter(|(_, m)| m.id != member_id)
            .map(|(hash, m)| (*hash, Arc::clone(m)))
            .collect();

        debug!(member = member_id, "hashring member removed");
        self.publish(RingState { virtual_nodes });
    }

    /// The owner of a key: the first member clockwise from the key's
    /// hash, wrapping at the top of the ring.
    pub fn find_owner(&self, key_hash: u64) -> Option<Arc<Member>> {
        let state = self.snapshot();
        state
            .virtual_nodes
            .range(key_hash..)
            .next()
            .or_else(|| state.virtual_nodes.iter().next())
            .map(|(_, member)| Arc::clone(member))
    }

    /// Distinct member ids currently on the ring.
    pub fn member_ids(&self) -> Vec<String> {
        let state = self.snapshot();
        let mut ids: Vec<String> =
            state.virtual_nodes.values().map(|m| m.id.clone()).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().virtual_nodes.is_empty()
    }
}
