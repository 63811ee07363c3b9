//! # Lattice Store
//!
//! The revision-versioned datastore abstraction: snapshot reads,
//! serializable read-write transactions, an optimized-revision cache, a
//! watch tail, and garbage collection of dead tuples, behind a uniform
//! interface. The in-memory MVCC backend in [`memory`] is the reference
//! implementation.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use lattice_types::{CaveatDefinition, ObjectDefinition, Relationship, RelationshipUpdate, Revision};
use serde::{Deserialize, Serialize};

pub mod error;
pub mod gc;
pub mod iterator;
pub mod memory;
pub mod migrate;
pub mod options;
pub mod revisions;

pub use error::StoreError;
pub use gc::{collect_once, run_garbage_collector, GarbageCollectable, GcConfig, GcStats};
pub use iterator::{collect_all, BufferedIterator, RelationshipIterator};
pub use memory::{memory_migrations, MemoryDatastore};
pub use migrate::{MigrationDriver, MigrationManager};
pub use options::{
    Cursor, QueryOptions, RelationshipsFilter, ReverseQueryOptions, SortOrder,
    SubjectRelationFilter, SubjectsFilter, SubjectsSelector,
};
pub use revisions::CachedOptimizedRevisions;

/// Capability bits advertised by a datastore. The engine gates behavior on
/// these rather than requiring every backend to implement everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Features {
    pub watch: bool,
    pub caveats: bool,
}

/// Whether the datastore is ready to serve: migrations at head and the
/// schema bootstrap complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyState {
    pub ready: bool,
    pub message: String,
}

/// Options for a read-write transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct RwTxOptions {
    /// Overrides the datastore's configured retry budget.
    pub max_retries: Option<u8>,
    pub disable_retries: bool,
}

/// An object definition plus the revision at which it was last written.
#[derive(Debug, Clone, PartialEq)]
pub struct RevisionedNamespace {
    pub definition: ObjectDefinition,
    pub last_written: Revision,
}

/// A caveat definition plus the revision at which it was last written.
#[derive(Debug, Clone, PartialEq)]
pub struct RevisionedCaveat {
    pub definition: CaveatDefinition,
    pub last_written: Revision,
}

/// A named repair operation exposed by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairOperation {
    pub name: String,
    pub description: String,
}

/// The mutation kinds observable on the watch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOperation {
    Created,
    Deleted,
}

/// One relationship mutation within a committed revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipChange {
    pub operation: ChangeOperation,
    pub relationship: Relationship,
}

/// All relationship mutations committed at a single revision. Watch
/// delivers these in strictly ascending revision order; ordering within a
/// revision is unspecified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionChanges {
    pub revision: Revision,
    pub changes: Vec<RelationshipChange>,
}

/// A stream of committed revisions with their relationship deltas.
pub struct WatchStream {
    rx: tokio::sync::mpsc::Receiver<Result<RevisionChanges, StoreError>>,
}

impl WatchStream {
    pub(crate) fn new(rx: tokio::sync::mpsc::Receiver<Result<RevisionChanges, StoreError>>) -> Self {
        Self { rx }
    }

    /// The next committed revision, `None` once the datastore shuts down.
    pub async fn next(&mut self) -> Option<Result<RevisionChanges, StoreError>> {
        self.rx.recv().await
    }
}

/// A read-only view of the datastore bound to a single revision. Reads
/// never block writes and vice versa.
#[async_trait]
pub trait Reader: Send + Sync {
    /// The object definition with the given name, with the revision at
    /// which it was last written.
    async fn read_namespace_by_name(&self, name: &str) -> Result<RevisionedNamespace, StoreError>;

    async fn list_all_namespaces(&self) -> Result<Vec<RevisionedNamespace>, StoreError>;

    async fn lookup_namespaces_with_names(
        &self,
        names: &[String],
    ) -> Result<Vec<RevisionedNamespace>, StoreError>;

    async fn read_caveat_by_name(&self, name: &str) -> Result<RevisionedCaveat, StoreError>;

    async fn list_all_caveats(&self) -> Result<Vec<RevisionedCaveat>, StoreError>;

    /// Relationships matching the filter, addressed from the resource side.
    async fn query_relationships(
        &self,
        filter: RelationshipsFilter,
        opts: QueryOptions,
    ) -> Result<Box<dyn RelationshipIterator>, StoreError>;

    /// Relationships matching the subjects filter, addressed from the
    /// subject side.
    async fn reverse_query_relationships(
        &self,
        subjects_filter: SubjectsFilter,
        opts: ReverseQueryOptions,
    ) -> Result<Box<dyn RelationshipIterator>, StoreError>;
}

/// The writer surface available inside a read-write transaction.
///
/// A single transaction handle must not be used concurrently; aliased use
/// is detected and reported as [`StoreError::ConcurrentTransactionUse`].
/// Reads performed through the transaction observe its own writes.
#[async_trait]
pub trait ReadWriteTx: Reader {
    /// Apply relationship mutations. Writes on the same tuple within one
    /// transaction coalesce with last-writer-wins semantics in input
    /// order.
    async fn write_relationships(
        &self,
        updates: Vec<RelationshipUpdate>,
    ) -> Result<(), StoreError>;

    /// Tombstone every live relationship matching the filter, up to the
    /// limit. Returns the number removed and whether the limit was
    /// reached.
    async fn delete_relationships(
        &self,
        filter: RelationshipsFilter,
        limit: Option<usize>,
    ) -> Result<(usize, bool), StoreError>;

    async fn write_namespaces(
        &self,
        definitions: Vec<ObjectDefinition>,
    ) -> Result<(), StoreError>;

    async fn delete_namespace(&self, name: &str) -> Result<(), StoreError>;

    async fn write_caveats(&self, definitions: Vec<CaveatDefinition>) -> Result<(), StoreError>;

    async fn delete_caveat(&self, name: &str) -> Result<(), StoreError>;
}

/// The future returned by a transaction user function.
pub type TxFuture<'t> = Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 't>>;

/// A transaction user function. It may run more than once when the
/// transaction is retried after a serialization failure.
pub type TxFn<'f> = &'f (dyn for<'t> Fn(&'t dyn ReadWriteTx) -> TxFuture<'t> + Send + Sync);

/// Constrains a closure to the shape expected by
/// [`Datastore::read_write_tx`], guiding lifetime inference.
pub fn rw_fn<F>(f: F) -> F
where
    F: for<'t> Fn(&'t dyn ReadWriteTx) -> TxFuture<'t> + Send + Sync,
{
    f
}

/// A revision-versioned relationship store.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// A reader bound to the given revision.
    fn snapshot_reader(&self, revision: &Revision) -> Box<dyn Reader>;

    /// Runs `fun` inside a serializable read-write transaction, retrying
    /// on serialization failures with jittered exponential backoff up to
    /// the retry budget. Non-retryable errors surface immediately. On
    /// commit, returns the new revision.
    async fn read_write_tx(
        &self,
        fun: TxFn<'_>,
        opts: RwTxOptions,
    ) -> Result<Revision, StoreError>;

    /// The newest revision that is safe and cheap to read from. Cached
    /// for the revision quantization window so that concurrent requests
    /// share a revision.
    async fn optimized_revision(&self) -> Result<Revision, StoreError>;

    /// The strictly newest committed revision.
    async fn head_revision(&self) -> Result<Revision, StoreError>;

    /// A stream of revisions committed after `after`. Fails with
    /// [`StoreError::WatchDisabled`] when the watch capability is absent.
    async fn watch(&self, after: &Revision) -> Result<WatchStream, StoreError>;

    async fn ready_state(&self) -> Result<ReadyState, StoreError>;

    fn features(&self) -> Features;
}
