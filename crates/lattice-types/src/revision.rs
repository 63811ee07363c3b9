//! Revision and snapshot model.
//!
//! A revision is an opaque, total-orderable token identifying a committed
//! state of the store. Two flavors exist: a hybrid logical clock timestamp
//! (timestamp backends) and a transaction id paired with a visibility
//! snapshot (MVCC backends). String parsing is backend-scoped; outside its
//! backend a revision is compared and serialized, never inspected.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RevisionError {
    #[error("invalid revision string: {0:?}")]
    InvalidRevisionString(String),

    #[error("revisions from different backends are not comparable")]
    IncomparableRevisions,
}

/// A totally ordered identifier of a committed state of the store.
///
/// `Revision::None` is the sentinel distinct from every valid revision and
/// orders before all of them. The two valid flavors are never mixed within
/// one backend; comparing across flavors is a programmer error and falls
/// back to flavor ordering so that `Ord` stays lawful.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Revision {
    None,
    Timestamp(HlcTimestamp),
    Snapshot(TxSnapshot),
}

impl Revision {
    pub fn is_none(&self) -> bool {
        matches!(self, Revision::None)
    }

    fn flavor_rank(&self) -> u8 {
        match self {
            Revision::None => 0,
            Revision::Timestamp(_) => 1,
            Revision::Snapshot(_) => 2,
        }
    }
}

impl Ord for Revision {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Revision::None, Revision::None) => Ordering::Equal,
            (Revision::Timestamp(a), Revision::Timestamp(b)) => a.cmp(b),
            (Revision::Snapshot(a), Revision::Snapshot(b)) => a.cmp(b),
            _ => self.flavor_rank().cmp(&other.flavor_rank()),
        }
    }
}

impl PartialOrd for Revision {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Revision::None => write!(f, "none"),
            Revision::Timestamp(ts) => write!(f, "{}.{:010}", ts.nanos, ts.logical),
            Revision::Snapshot(snap) => {
                write!(f, "{}:{}:{}", snap.txid, snap.xmin, snap.xmax)?;
                for xid in &snap.xip {
                    write!(f, ":{xid}")?;
                }
                Ok(())
            }
        }
    }
}

/// A hybrid logical clock timestamp: wall-clock nanoseconds with a logical
/// counter breaking ties between commits in the same nanosecond.
///
/// The snapshot of an HLC revision is the revision itself: a transaction
/// committed at `T` is visible at `R` iff `T <= R`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct HlcTimestamp {
    pub nanos: u64,
    pub logical: u32,
}

impl HlcTimestamp {
    pub fn new(nanos: u64, logical: u32) -> Self {
        Self { nanos, logical }
    }

    /// The next timestamp strictly after `self`, given the current wall
    /// clock reading. Monotonic even when the wall clock regresses.
    pub fn tick(&self, wall_nanos: u64) -> Self {
        if wall_nanos > self.nanos {
            Self { nanos: wall_nanos, logical: 0 }
        } else {
            Self { nanos: self.nanos, logical: self.logical + 1 }
        }
    }

    pub fn visible(&self, committed_at: HlcTimestamp) -> bool {
        committed_at <= *self
    }

    /// Parse the backend's `nanos.logical` string form.
    pub fn parse(s: &str) -> Result<Self, RevisionError> {
        let (nanos, logical) = s
            .split_once('.')
            .ok_or_else(|| RevisionError::InvalidRevisionString(s.to_string()))?;
        let nanos =
            nanos.parse().map_err(|_| RevisionError::InvalidRevisionString(s.to_string()))?;
        let logical =
            logical.parse().map_err(|_| RevisionError::InvalidRevisionString(s.to_string()))?;
        Ok(Self { nanos, logical })
    }
}

/// A transaction id paired with the MVCC visibility snapshot taken when the
/// transaction began, mirroring the backing database's rule: a transaction
/// `T` is visible iff `T < xmin`, or `T <= xmax` and `T` was not in
/// progress when the snapshot was taken.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxSnapshot {
    pub txid: u64,
    pub xmin: u64,
    pub xmax: u64,
    /// Transaction ids in progress at snapshot time, ascending.
    pub xip: Vec<u64>,
}

impl TxSnapshot {
    /// Snapshot covering every transaction up to and including `head`.
    pub fn at_head(head: u64) -> Self {
        Self { txid: head, xmin: head + 1, xmax: head, xip: Vec::new() }
    }

    pub fn visible(&self, txid: u64) -> bool {
        if txid < self.xmin {
            return true;
        }
        if txid > self.xmax {
            return false;
        }
        self.xip.binary_search(&txid).is_err()
    }

    /// Mark the given transaction id as committed within this snapshot,
    /// so a read-write transaction observes its own writes. Returns the
    /// snapshot stamped with that id as its revision identity.
    pub fn mark_complete(mut self, txid: u64) -> Self {
        if let Ok(idx) = self.xip.binary_search(&txid) {
            self.xip.remove(idx);
        }
        if txid > self.xmax {
            for in_progress in self.xmax + 1..txid {
                if self.xip.binary_search(&in_progress).is_err() {
                    self.xip.push(in_progress);
                }
            }
            self.xip.sort_unstable();
            self.xmax = txid;
        }
        self.txid = txid;
        self
    }

    /// Parse the backend's `txid:xmin:xmax[:xip...]` string form.
    pub fn parse(s: &str) -> Result<Self, RevisionError> {
        let parts = s
            .split(':')
            .map(|p| p.parse::<u64>())
            .collect::<Result<Vec<u64>, _>>()
            .map_err(|_| RevisionError::InvalidRevisionString(s.to_string()))?;
        if parts.len() < 3 {
            return Err(RevisionError::InvalidRevisionString(s.to_string()));
        }
        Ok(Self { txid: parts[0], xmin: parts[1], xmax: parts[2], xip: parts[3..].to_vec() })
    }
}

impl Ord for TxSnapshot {
    fn cmp(&self, other: &Self) -> Ordering {
        self.txid.cmp(&other.txid)
    }
}

impl PartialOrd for TxSnapshot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
