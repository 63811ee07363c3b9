//! Consistency resolution.
//!
//! Every public call carries a consistency preference that resolves to a
//! concrete revision before the engine runs.

use lattice_store::{Datastore, StoreError};
use lattice_types::Revision;
use serde::{Deserialize, Serialize};

/// The caller's consistency preference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Consistency {
    /// The cached optimized revision; cheapest, possibly slightly stale.
    #[default]
    MinimizeLatency,
    /// At least as fresh as the given revision.
    AtLeastAsFresh(Revision),
    /// Exactly the given revision.
    AtExactSnapshot(Revision),
    /// The strictly newest committed revision.
    FullyConsistent,
}

/// Resolve the preference to the revision the request will run at.
pub async fn revision_for_consistency(
    datastore: &dyn Datastore,
    consistency: &Consistency,
) -> Result<Revision, StoreError> {
    match consistency {
        Consistency::MinimizeLatency => datastore.optimized_revision().await,
        Consistency::FullyConsistent => datastore.head_revision().await,
        Consistency::AtExactSnapshot(revision) => Ok(revision.clone()),
        Consistency::AtLeastAsFresh(revision) => {
            let optimized = datastore.optimized_revision().await?;
            Ok(if *revision > optimized { revision.clone() } else { optimized })
        }
    }
}
