//! In-memory MVCC reference backend.
//!
//! Every row is versioned with the transaction id that created it and, once
//! tombstoned, the transaction id that deleted it. Visibility at a revision
//! follows the snapshot rule in [`lattice_types::TxSnapshot`]. Read-write
//! transactions are serialized by a write lock held for the transaction's
//! lifetime; snapshot readers never take it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use lattice_types::{
    CaveatDefinition, ObjectDefinition, Relationship, RelationshipKey, RelationshipUpdate,
    Revision, TxSnapshot, UpdateOperation,
};
use rand::Rng;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::gc::{GarbageCollectable, GcStats};
use crate::iterator::{BufferedIterator, RelationshipIterator};
use crate::migrate::{MigrationDriver, MigrationManager};
use crate::options::{
    by_resource_key, QueryOptions, RelationshipsFilter, ReverseQueryOptions, SortOrder,
    SubjectsFilter,
};
use crate::revisions::CachedOptimizedRevisions;
use crate::{
    ChangeOperation, Datastore, Features, ReadWriteTx, Reader, ReadyState, RelationshipChange,
    RepairOperation, RevisionChanges, RevisionedCaveat, RevisionedNamespace, RwTxOptions, TxFn,
    WatchStream,
};

/// Tuning knobs for the memory backend.
#[derive(Debug, Clone)]
pub struct MemoryOptions {
    pub revision_quantization: Duration,
    pub max_retries: u8,
    pub watch_buffer_length: usize,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            revision_quantization: Duration::from_millis(5),
            max_retries: 10,
            watch_buffer_length: 128,
        }
    }
}

#[derive(Debug, Clone)]
struct VersionedRelationship {
    relationship: Relationship,
    created_txid: u64,
    deleted_txid: Option<u64>,
}

impl VersionedRelationship {
    fn live_at(&self, snapshot: &TxSnapshot) -> bool {
        snapshot.visible(self.created_txid)
            && !self.deleted_txid.map_or(false, |d| snapshot.visible(d))
    }
}

#[derive(Debug, Clone)]
struct VersionedNamespace {
    definition: ObjectDefinition,
    created_txid: u64,
    deleted_txid: Option<u64>,
}

#[derive(Debug, Clone)]
struct VersionedCaveat {
    definition: CaveatDefinition,
    created_txid: u64,
    deleted_txid: Option<u64>,
}

#[derive(Debug)]
struct TxRecord {
    committed_at: SystemTime,
}

struct MemoryState {
    relationships: Vec<VersionedRelationship>,
    namespaces: Vec<VersionedNamespace>,
    caveats: Vec<VersionedCaveat>,
    /// Committed transactions with their commit timestamps, used to map
    /// the GC watermark onto a transaction id.
    transactions: BTreeMap<u64, TxRecord>,
    head_txid: u64,
    /// Per-revision relationship deltas for the watch tail.
    changelog: BTreeMap<u64, RevisionChanges>,
    /// Highest transaction id whose changelog entries were pruned by GC.
    changelog_pruned_through: u64,
    migration_version: String,
}

impl MemoryState {
    fn find_live(&self, key: &RelationshipKey, snapshot: &TxSnapshot) -> Option<usize> {
        self.relationships
            .iter()
            .position(|v| v.live_at(snapshot) && v.relationship.key() == *key)
    }
}

/// The in-memory reference datastore.
pub struct MemoryDatastore {
    state: Arc<RwLock<MemoryState>>,
    /// Serializes read-write transactions; held for a transaction's
    /// lifetime.
    write_serializer: Arc<tokio::sync::Mutex<()>>,
    head_changed: tokio::sync::watch::Sender<u64>,
    optimized: CachedOptimizedRevisions,
    options: MemoryOptions,
    unique_id: Uuid,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::with_options(MemoryOptions::default())
    }

    pub fn with_options(options: MemoryOptions) -> Self {
        let head_version = memory_migrations()
            .and_then(|manager| manager.head_revision())
            .unwrap_or_default();
        Self::build(options, head_version)
    }

    /// A datastore at the empty migration version, for exercising the
    /// migration path.
    pub fn new_unmigrated() -> Self {
        Self::build(MemoryOptions::default(), String::new())
    }

    fn build(options: MemoryOptions, migration_version: String) -> Self {
        let (head_changed, _) = tokio::sync::watch::channel(0u64);
        Self {
            state: Arc::new(RwLock::new(MemoryState {
                relationships: Vec::new(),
                namespaces: Vec::new(),
                caveats: Vec::new(),
                transactions: BTreeMap::new(),
                head_txid: 0,
                changelog: BTreeMap::new(),
                changelog_pruned_through: 0,
                migration_version,
            })),
            write_serializer: Arc::new(tokio::sync::Mutex::new(())),
            head_changed,
            optimized: CachedOptimizedRevisions::new(options.revision_quantization),
            options,
            unique_id: Uuid::new_v4(),
        }
    }

    pub fn unique_id(&self) -> Uuid {
        self.unique_id
    }

    /// Parse a revision string minted by this backend.
    pub fn parse_revision(s: &str) -> Result<Revision, StoreError> {
        TxSnapshot::parse(s)
            .map(Revision::Snapshot)
            .map_err(|e| StoreError::InvalidRevision(e.to_string()))
    }

    pub fn repair_operations() -> Vec<RepairOperation> {
        vec![RepairOperation {
            name: "transaction-ids".to_string(),
            description: "advances the transaction counter past the highest referenced id"
                .to_string(),
        }]
    }

    /// Run a named repair operation.
    pub async fn repair(&self, operation: &str) -> Result<(), StoreError> {
        match operation {
            "transaction-ids" => {
                let mut state = self.state.write().await;
                let referenced = state
                    .relationships
                    .iter()
                    .flat_map(|v| [Some(v.created_txid), v.deleted_txid])
                    .flatten()
                    .max()
                    .unwrap_or(0);
                if referenced > state.head_txid {
                    debug!(from = state.head_txid, to = referenced, "repairing transaction ids");
                    state.head_txid = referenced;
                }
                Ok(())
            }
            other => Err(StoreError::Internal(format!("unknown repair operation: {other}"))),
        }
    }

    async fn commit(&self, txid: u64) -> Revision {
        let mut state = self.state.write().await;
        state.head_txid = txid;
        state.transactions.insert(txid, TxRecord { committed_at: SystemTime::now() });

        let mut changes = Vec::new();
        for v in &state.relationships {
            if v.deleted_txid == Some(txid) && v.created_txid != txid {
                changes.push(RelationshipChange {
                    operation: ChangeOperation::Deleted,
                    relationship: v.relationship.clone(),
                });
            }
            if v.created_txid == txid {
                changes.push(RelationshipChange {
                    operation: ChangeOperation::Created,
                    relationship: v.relationship.clone(),
                });
            }
        }

        let revision = Revision::Snapshot(TxSnapshot::at_head(txid));
        if !changes.is_empty() {
            state
                .changelog
                .insert(txid, RevisionChanges { revision: revision.clone(), changes });
        }
        revision
    }

    async fn rollback(&self, txid: u64) {
        let mut state = self.state.write().await;
        state.relationships.retain(|v| v.created_txid != txid);
        for v in &mut state.relationships {
            if v.deleted_txid == Some(txid) {
                v.deleted_txid = None;
            }
        }
        state.namespaces.retain(|v| v.created_txid != txid);
        for v in &mut state.namespaces {
            if v.deleted_txid == Some(txid) {
                v.deleted_txid = None;
            }
        }
        state.caveats.retain(|v| v.created_txid != txid);
        for v in &mut state.caveats {
            if v.deleted_txid == Some(txid) {
                v.deleted_txid = None;
            }
        }
    }
}

impl Default for MemoryDatastore {
    fn default() -> Self {
        Self::new()
    }
}

async fn sleep_on_err(attempt: u8) {
    let base_ms = 10u64 << attempt.min(6);
    let jitter_ms = rand::thread_rng().gen_range(0..=base_ms);
    tokio::time::sleep(Duration::from_millis(base_ms + jitter_ms)).await;
}

fn snapshot_of(revision: &Revision) -> Result<TxSnapshot, StoreError> {
    match revision {
        Revision::Snapshot(snapshot) => Ok(snapshot.clone()),
        other => Err(StoreError::InvalidRevision(format!(
            "memory datastore requires a snapshot revision, got {other}"
        ))),
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    fn snapshot_reader(&self, revision: &Revision) -> Box<dyn Reader> {
        match snapshot_of(revision) {
            Ok(snapshot) => Box::new(MemoryReader {
                state: Arc::clone(&self.state),
                snapshot,
                init_err: None,
            }),
            Err(err) => Box::new(MemoryReader {
                state: Arc::clone(&self.state),
                snapshot: TxSnapshot::at_head(0),
                init_err: Some(err.to_string()),
            }),
        }
    }

    async fn read_write_tx(
        &self,
        fun: TxFn<'_>,
        opts: RwTxOptions,
    ) -> Result<Revision, StoreError> {
        let max_retries =
            if opts.disable_retries { 0 } else { opts.max_retries.unwrap_or(self.options.max_retries) };

        let mut attempt: u8 = 0;
        loop {
            let serial = self.write_serializer.lock().await;
            let (txid, snapshot) = {
                let state = self.state.read().await;
                let txid = state.head_txid + 1;
                (txid, TxSnapshot::at_head(state.head_txid).mark_complete(txid))
            };

            let rwt = MemoryRwTx {
                state: Arc::clone(&self.state),
                txid,
                snapshot,
                op_lock: tokio::sync::Mutex::new(()),
            };

            match fun(&rwt).await {
                Ok(()) => {
                    let revision = self.commit(txid).await;
                    drop(serial);
                    self.head_changed.send_replace(txid);
                    if attempt > 0 {
                        debug!(retries = attempt, "transaction succeeded after retry");
                    }
                    return Ok(revision);
                }
                Err(err) => {
                    self.rollback(txid).await;
                    drop(serial);

                    if !err.retryable() || opts.disable_retries {
                        return Err(err);
                    }
                    if attempt >= max_retries {
                        return Err(StoreError::MaxRetries {
                            attempts: attempt + 1,
                            last: Box::new(err),
                        });
                    }
                    warn!(error = %err, attempt, "retrying transaction");
                    attempt += 1;
                    sleep_on_err(attempt).await;
                }
            }
        }
    }

    async fn optimized_revision(&self) -> Result<Revision, StoreError> {
        self.optimized
            .optimized_revision(|| async {
                let state = self.state.read().await;
                Ok(Revision::Snapshot(TxSnapshot::at_head(state.head_txid)))
            })
            .await
    }

    async fn head_revision(&self) -> Result<Revision, StoreError> {
        let state = self.state.read().await;
        Ok(Revision::Snapshot(TxSnapshot::at_head(state.head_txid)))
    }

    async fn watch(&self, after: &Revision) -> Result<WatchStream, StoreError> {
        let after_txid = match after {
            Revision::None => 0,
            other => snapshot_of(other)?.txid,
        };

        let (tx, rx) = tokio::sync::mpsc::channel(self.options.watch_buffer_length);
        let state = Arc::clone(&self.state);
        let mut head_rx = self.head_changed.subscribe();

        tokio::spawn(async move {
            let mut last = after_txid;
            loop {
                let (pruned_through, batch): (u64, Vec<RevisionChanges>) = {
                    let state = state.read().await;
                    (
                        state.changelog_pruned_through,
                        state.changelog.range(last + 1..).map(|(_, c)| c.clone()).collect(),
                    )
                };

                if last < pruned_through {
                    let _ = tx.send(Err(StoreError::WatchLagged(pruned_through - last))).await;
                    return;
                }

                for entry in batch {
                    last = match &entry.revision {
                        Revision::Snapshot(s) => s.txid,
                        _ => last,
                    };
                    if tx.send(Ok(entry)).await.is_err() {
                        return;
                    }
                }

                if head_rx.changed().await.is_err() {
                    return;
                }
            }
        });

        Ok(WatchStream::new(rx))
    }

    async fn ready_state(&self) -> Result<ReadyState, StoreError> {
        let head = memory_migrations()?.head_revision()?;
        let state = self.state.read().await;
        if state.migration_version == head {
            Ok(ReadyState {
                ready: true,
                message: format!("memory datastore {} ready", self.unique_id),
            })
        } else {
            Ok(ReadyState {
                ready: false,
                message: format!(
                    "datastore is not migrated: currently at revision `{}`, but requires `{}`",
                    state.migration_version, head
                ),
            })
        }
    }

    fn features(&self) -> Features {
        Features { watch: true, caveats: true }
    }
}

// ============================================================================
// Snapshot reader
// ============================================================================

struct MemoryReader {
    state: Arc<RwLock<MemoryState>>,
    snapshot: TxSnapshot,
    init_err: Option<String>,
}

impl MemoryReader {
    fn check_init(&self) -> Result<(), StoreError> {
        match &self.init_err {
            Some(message) => Err(StoreError::InvalidRevision(message.clone())),
            None => Ok(()),
        }
    }
}

fn query_state(
    state: &MemoryState,
    snapshot: &TxSnapshot,
    filter: &RelationshipsFilter,
    opts: &QueryOptions,
) -> Result<Box<dyn RelationshipIterator>, StoreError> {
    opts.validate()?;

    let mut rows: Vec<Relationship> = state
        .relationships
        .iter()
        .filter(|v| v.live_at(snapshot))
        .filter(|v| filter.matches(&v.relationship))
        .map(|v| v.relationship.clone())
        .collect();

    if opts.sort == SortOrder::ByResource {
        rows.sort_by(|a, b| by_resource_key(a).cmp(&by_resource_key(b)));
        if let Some(after) = &opts.after {
            rows.retain(|r| by_resource_key(r) > by_resource_key(after));
        }
    }

    Ok(Box::new(BufferedIterator::new(rows, opts.sort, opts.limit)))
}

fn reverse_query_state(
    state: &MemoryState,
    snapshot: &TxSnapshot,
    subjects_filter: &SubjectsFilter,
    opts: &ReverseQueryOptions,
) -> Result<Box<dyn RelationshipIterator>, StoreError> {
    let mut filter = RelationshipsFilter::default()
        .with_subjects_selector(subjects_filter.as_selector());
    if let Some(resource_relation) = &opts.resource_relation {
        filter.optional_resource_type = Some(resource_relation.object_type.clone());
        filter.optional_relation = Some(resource_relation.relation.clone());
    }

    query_state(
        state,
        snapshot,
        &filter,
        &QueryOptions { limit: opts.limit, sort: SortOrder::Unsorted, after: None },
    )
}

fn read_namespace_state(
    state: &MemoryState,
    snapshot: &TxSnapshot,
    name: &str,
) -> Result<RevisionedNamespace, StoreError> {
    state
        .namespaces
        .iter()
        .find(|v| {
            v.definition.name == name
                && snapshot.visible(v.created_txid)
                && !v.deleted_txid.map_or(false, |d| snapshot.visible(d))
        })
        .map(|v| RevisionedNamespace {
            definition: v.definition.clone(),
            last_written: Revision::Snapshot(TxSnapshot::at_head(v.created_txid)),
        })
        .ok_or_else(|| StoreError::NamespaceNotFound(name.to_string()))
}

fn list_namespaces_state(
    state: &MemoryState,
    snapshot: &TxSnapshot,
) -> Vec<RevisionedNamespace> {
    state
        .namespaces
        .iter()
        .filter(|v| {
            snapshot.visible(v.created_txid)
                && !v.deleted_txid.map_or(false, |d| snapshot.visible(d))
        })
        .map(|v| RevisionedNamespace {
            definition: v.definition.clone(),
            last_written: Revision::Snapshot(TxSnapshot::at_head(v.created_txid)),
        })
        .collect()
}

fn list_caveats_state(state: &MemoryState, snapshot: &TxSnapshot) -> Vec<RevisionedCaveat> {
    state
        .caveats
        .iter()
        .filter(|v| {
            snapshot.visible(v.created_txid)
                && !v.deleted_txid.map_or(false, |d| snapshot.visible(d))
        })
        .map(|v| RevisionedCaveat {
            definition: v.definition.clone(),
            last_written: Revision::Snapshot(TxSnapshot::at_head(v.created_txid)),
        })
        .collect()
}

fn read_caveat_state(
    state: &MemoryState,
    snapshot: &TxSnapshot,
    name: &str,
) -> Result<RevisionedCaveat, StoreError> {
    state
        .caveats
        .iter()
        .find(|v| {
            v.definition.name == name
                && snapshot.visible(v.created_txid)
                && !v.deleted_txid.map_or(false, |d| snapshot.visible(d))
        })
        .map(|v| RevisionedCaveat {
            definition: v.definition.clone(),
            last_written: Revision::Snapshot(TxSnapshot::at_head(v.created_txid)),
        })
        .ok_or_else(|| StoreError::CaveatNotFound(name.to_string()))
}

#[async_trait]
impl Reader for MemoryReader {
    async fn read_namespace_by_name(&self, name: &str) -> Result<RevisionedNamespace, StoreError> {
        self.check_init()?;
        let state = self.state.read().await;
        read_namespace_state(&state, &self.snapshot, name)
    }

    async fn list_all_namespaces(&self) -> Result<Vec<RevisionedNamespace>, StoreError> {
        self.check_init()?;
        let state = self.state.read().await;
        Ok(list_namespaces_state(&state, &self.snapshot))
    }

    async fn lookup_namespaces_with_names(
        &self,
        names: &[String],
    ) -> Result<Vec<RevisionedNamespace>, StoreError> {
        self.check_init()?;
        let state = self.state.read().await;
        Ok(list_namespaces_state(&state, &self.snapshot)
            .into_iter()
            .filter(|ns| names.contains(&ns.definition.name))
            .collect())
    }

    async fn read_caveat_by_name(&self, name: &str) -> Result<RevisionedCaveat, StoreError> {
        self.check_init()?;
        let state = self.state.read().await;
        read_caveat_state(&state, &self.snapshot, name)
    }

    async fn list_all_caveats(&self) -> Result<Vec<RevisionedCaveat>, StoreError> {
        self.check_init()?;
        let state = self.state.read().await;
        Ok(list_caveats_state(&state, &self.snapshot))
    }

    async fn query_relationships(
        &self,
        filter: RelationshipsFilter,
        opts: QueryOptions,
    ) -> Result<Box<dyn RelationshipIterator>, StoreError> {
        self.check_init()?;
        let state = self.state.read().await;
        query_state(&state, &self.snapshot, &filter, &opts)
    }

    async fn reverse_query_relationships(
        &self,
        subjects_filter: SubjectsFilter,
        opts: ReverseQueryOptions,
    ) -> Result<Box<dyn RelationshipIterator>, StoreError> {
        self.check_init()?;
        let state = self.state.read().await;
        reverse_query_state(&state, &self.snapshot, &subjects_filter, &opts)
    }
}

// ============================================================================
// Read-write transaction
// ============================================================================

struct MemoryRwTx {
    state: Arc<RwLock<MemoryState>>,
    txid: u64,
    /// The transaction's own snapshot, with its own id marked complete so
    /// reads observe pending writes.
    snapshot: TxSnapshot,
    /// Try-locked by every operation; contention means the caller aliased
    /// the transaction handle across tasks.
    op_lock: tokio::sync::Mutex<()>,
}

impl MemoryRwTx {
    fn try_op(&self) -> Result<tokio::sync::MutexGuard<'_, ()>, StoreError> {
        self.op_lock.try_lock().map_err(|_| StoreError::ConcurrentTransactionUse)
    }

    fn apply_update(
        &self,
        state: &mut MemoryState,
        update: RelationshipUpdate,
    ) -> Result<(), StoreError> {
        let key = update.relationship.key();
        let existing = state.find_live(&key, &self.snapshot);

        match update.operation {
            UpdateOperation::Create => {
                if existing.is_some() {
                    return Err(StoreError::RelationshipExists(
                        update.relationship.to_string(),
                    ));
                }
                state.relationships.push(VersionedRelationship {
                    relationship: update.relationship,
                    created_txid: self.txid,
                    deleted_txid: None,
                });
            }
            UpdateOperation::Touch => {
                if let Some(idx) = existing {
                    if state.relationships[idx].relationship == update.relationship {
                        return Ok(());
                    }
                    self.tombstone(state, idx);
                }
                state.relationships.push(VersionedRelationship {
                    relationship: update.relationship,
                    created_txid: self.txid,
                    deleted_txid: None,
                });
            }
            UpdateOperation::Delete => match existing {
                Some(idx) => self.tombstone(state, idx),
                None => {
                    return Err(StoreError::RelationshipNotFound(
                        update.relationship.to_string(),
                    ));
                }
            },
        }
        Ok(())
    }

    /// Tombstone the row, or drop it entirely when it was created by this
    /// transaction and was never visible outside it.
    fn tombstone(&self, state: &mut MemoryState, idx: usize) {
        if state.relationships[idx].created_txid == self.txid {
            state.relationships.remove(idx);
        } else {
            state.relationships[idx].deleted_txid = Some(self.txid);
        }
    }
}

#[async_trait]
impl Reader for MemoryRwTx {
    async fn read_namespace_by_name(&self, name: &str) -> Result<RevisionedNamespace, StoreError> {
        let _op = self.try_op()?;
        let state = self.state.read().await;
        read_namespace_state(&state, &self.snapshot, name)
    }

    async fn list_all_namespaces(&self) -> Result<Vec<RevisionedNamespace>, StoreError> {
        let _op = self.try_op()?;
        let state = self.state.read().await;
        Ok(list_namespaces_state(&state, &self.snapshot))
    }

    async fn lookup_namespaces_with_names(
        &self,
        names: &[String],
    ) -> Result<Vec<RevisionedNamespace>, StoreError> {
        let _op = self.try_op()?;
        let state = self.state.read().await;
        Ok(list_namespaces_state(&state, &self.snapshot)
            .into_iter()
            .filter(|ns| names.contains(&ns.definition.name))
            .collect())
    }

    async fn read_caveat_by_name(&self, name: &str) -> Result<RevisionedCaveat, StoreError> {
        let _op = self.try_op()?;
        let state = self.state.read().await;
        read_caveat_state(&state, &self.snapshot, name)
    }

    async fn list_all_caveats(&self) -> Result<Vec<RevisionedCaveat>, StoreError> {
        let _op = self.try_op()?;
        let state = self.state.read().await;
        Ok(list_caveats_state(&state, &self.snapshot))
    }

    async fn query_relationships(
        &self,
        filter: RelationshipsFilter,
        opts: QueryOptions,
    ) -> Result<Box<dyn RelationshipIterator>, StoreError> {
        let _op = self.try_op()?;
        let state = self.state.read().await;
        query_state(&state, &self.snapshot, &filter, &opts)
    }

    async fn reverse_query_relationships(
        &self,
        subjects_filter: SubjectsFilter,
        opts: ReverseQueryOptions,
    ) -> Result<Box<dyn RelationshipIterator>, StoreError> {
        let _op = self.try_op()?;
        let state = self.state.read().await;
        reverse_query_state(&state, &self.snapshot, &subjects_filter, &opts)
    }
}

#[async_trait]
impl ReadWriteTx for MemoryRwTx {
    async fn write_relationships(
        &self,
        updates: Vec<RelationshipUpdate>,
    ) -> Result<(), StoreError> {
        let _op = self.try_op()?;
        let mut state = self.state.write().await;
        for update in updates {
            self.apply_update(&mut state, update)?;
        }
        Ok(())
    }

    async fn delete_relationships(
        &self,
        filter: RelationshipsFilter,
        limit: Option<usize>,
    ) -> Result<(usize, bool), StoreError> {
        if filter.is_empty() {
            return Err(StoreError::InvalidFilter(
                "deletion filter must constrain at least one field".to_string(),
            ));
        }

        let _op = self.try_op()?;
        let mut state = self.state.write().await;

        let mut matching: Vec<usize> = state
            .relationships
            .iter()
            .enumerate()
            .filter(|(_, v)| v.live_at(&self.snapshot) && filter.matches(&v.relationship))
            .map(|(idx, _)| idx)
            .collect();

        let mut limit_reached = false;
        if let Some(limit) = limit {
            if matching.len() > limit {
                matching.truncate(limit);
                limit_reached = true;
            }
        }

        let deleted = matching.len();
        // Descending order so row removal does not shift pending indices.
        for idx in matching.into_iter().rev() {
            self.tombstone(&mut state, idx);
        }

        Ok((deleted, limit_reached))
    }

    async fn write_namespaces(
        &self,
        definitions: Vec<ObjectDefinition>,
    ) -> Result<(), StoreError> {
        let _op = self.try_op()?;
        let mut state = self.state.write().await;
        for definition in definitions {
            if let Some(idx) = state.namespaces.iter().position(|v| {
                v.definition.name == definition.name
                    && self.snapshot.visible(v.created_txid)
                    && !v.deleted_txid.map_or(false, |d| self.snapshot.visible(d))
            }) {
                if state.namespaces[idx].created_txid == self.txid {
                    state.namespaces.remove(idx);
                } else {
                    state.namespaces[idx].deleted_txid = Some(self.txid);
                }
            }
            state.namespaces.push(VersionedNamespace {
                definition,
                created_txid: self.txid,
                deleted_txid: None,
            });
        }
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), StoreError> {
        let _op = self.try_op()?;
        let mut state = self.state.write().await;
        let idx = state
            .namespaces
            .iter()
            .position(|v| {
                v.definition.name == name
                    && self.snapshot.visible(v.created_txid)
                    && !v.deleted_txid.map_or(false, |d| self.snapshot.visible(d))
            })
            .ok_or_else(|| StoreError::NamespaceNotFound(name.to_string()))?;
        if state.namespaces[idx].created_txid == self.txid {
            state.namespaces.remove(idx);
        } else {
            state.namespaces[idx].deleted_txid = Some(self.txid);
        }
        Ok(())
    }

    async fn write_caveats(&self, definitions: Vec<CaveatDefinition>) -> Result<(), StoreError> {
        let _op = self.try_op()?;
        let mut state = self.state.write().await;
        for definition in definitions {
            if let Some(idx) = state.caveats.iter().position(|v| {
                v.definition.name == definition.name
                    && self.snapshot.visible(v.created_txid)
                    && !v.deleted_txid.map_or(false, |d| self.snapshot.visible(d))
            }) {
                if state.caveats[idx].created_txid == self.txid {
                    state.caveats.remove(idx);
                } else {
                    state.caveats[idx].deleted_txid = Some(self.txid);
                }
            }
            state.caveats.push(VersionedCaveat {
                definition,
                created_txid: self.txid,
                deleted_txid: None,
            });
        }
        Ok(())
    }

    async fn delete_caveat(&self, name: &str) -> Result<(), StoreError> {
        let _op = self.try_op()?;
        let mut state = self.state.write().await;
        let idx = state
            .caveats
            .iter()
            .position(|v| {
                v.definition.name == name
                    && self.snapshot.visible(v.created_txid)
                    && !v.deleted_txid.map_or(false, |d| self.snapshot.visible(d))
            })
            .ok_or_else(|| StoreError::CaveatNotFound(name.to_string()))?;
        if state.caveats[idx].created_txid == self.txid {
            state.caveats.remove(idx);
        } else {
            state.caveats[idx].deleted_txid = Some(self.txid);
        }
        Ok(())
    }
}

// ============================================================================
// Garbage collection
// ============================================================================

#[async_trait]
impl GarbageCollectable for MemoryDatastore {
    async fn delete_expired(
        &self,
        watermark: SystemTime,
        batch_size: usize,
    ) -> Result<GcStats, StoreError> {
        let mut state = self.state.write().await;

        // The watermark transaction: the newest commit older than the
        // cutoff. Tombstones at or below it are unreachable by any reader
        // within the GC window.
        let watermark_txid = state
            .transactions
            .iter()
            .filter(|(_, record)| record.committed_at < watermark)
            .map(|(txid, _)| *txid)
            .max()
            .unwrap_or(0);

        let mut stats = GcStats::default();
        let mut budget = batch_size;

        state.relationships.retain(|v| {
            if budget == 0 {
                return true;
            }
            if v.deleted_txid.map_or(false, |d| d <= watermark_txid) {
                budget -= 1;
                stats.relationships_removed += 1;
                return false;
            }
            true
        });

        state.namespaces.retain(|v| {
            if v.deleted_txid.map_or(false, |d| d <= watermark_txid) {
                stats.namespaces_removed += 1;
                return false;
            }
            true
        });
        state.caveats.retain(|v| {
            if v.deleted_txid.map_or(false, |d| d <= watermark_txid) {
                stats.caveats_removed += 1;
                return false;
            }
            true
        });

        // Watch entries below the watermark are no longer served; the GC
        // window bounds how far back a watch may resume.
        if watermark_txid > 0 {
            let kept = state.changelog.split_off(&(watermark_txid + 1));
            let pruned = state.changelog.len() as u64;
            state.changelog = kept;
            if pruned > 0 {
                state.changelog_pruned_through =
                    state.changelog_pruned_through.max(watermark_txid);
            }

            let retained = state.transactions.split_off(&watermark_txid);
            stats.transactions_removed += state.transactions.len();
            state.transactions = retained;
        }

        Ok(stats)
    }
}

// ============================================================================
// Migrations
// ============================================================================

#[async_trait]
impl MigrationDriver for MemoryDatastore {
    async fn version(&self) -> Result<String, StoreError> {
        Ok(self.state.read().await.migration_version.clone())
    }

    async fn write_version(&self, version: &str, _replaced: &str) -> Result<(), StoreError> {
        self.state.write().await.migration_version = version.to_string();
        Ok(())
    }
}

/// The migration set for the memory backend. Structures exist from
/// construction, so the steps only advance the recorded version.
pub fn memory_migrations() -> Result<MigrationManager<MemoryDatastore>, StoreError> {
    let mut manager = MigrationManager::new();
    manager.register("add-relationship-storage", "", |_ds| Box::pin(async { Ok(()) }))?;
    manager.register("add-caveat-storage", "add-relationship-storage", |_ds| {
        Box::pin(async { Ok(()) })
    })?;
    Ok(manager)
}

#[cfg(test)]
mod tests {
    use lattice_types::CaveatReference;

    use super::*;
    use crate::rw_fn;

    fn viewer(resource_id: &str, subject_id: &str) -> Relationship {
        Relationship::new("document", resource_id, "viewer", "user", subject_id)
    }

    async fn write(ds: &MemoryDatastore, updates: Vec<RelationshipUpdate>) -> Revision {
        ds.read_write_tx(
            &rw_fn(move |rwt| {
                let updates = updates.clone();
                Box::pin(async move { rwt.write_relationships(updates).await })
            }),
            RwTxOptions::default(),
        )
        .await
        .expect("write transaction")
    }

    async fn query_at(
        ds: &MemoryDatastore,
        revision: &Revision,
        filter: RelationshipsFilter,
    ) -> Vec<Relationship> {
        let reader = ds.snapshot_reader(revision);
        let iter = reader.query_relationships(filter, QueryOptions::default()).await.unwrap();
        crate::collect_all(iter).unwrap()
    }

    #[tokio::test]
    async fn snapshot_isolation_across_delete() {
        let ds = MemoryDatastore::new();

        let r1 = write(&ds, vec![RelationshipUpdate::create(viewer("readme", "alice"))]).await;
        let r2 = write(&ds, vec![RelationshipUpdate::delete(viewer("readme", "alice"))]).await;

        let filter = RelationshipsFilter::for_resource_type("document");
        assert_eq!(query_at(&ds, &r1, filter.clone()).await.len(), 1);
        assert_eq!(query_at(&ds, &r2, filter).await.len(), 0);
    }

    #[tokio::test]
    async fn create_duplicate_fails() {
        let ds = MemoryDatastore::new();
        write(&ds, vec![RelationshipUpdate::create(viewer("readme", "alice"))]).await;

        let err = ds
            .read_write_tx(
                &rw_fn(|rwt| {
                    Box::pin(async move {
                        rwt.write_relationships(vec![RelationshipUpdate::create(viewer(
                            "readme", "alice",
                        ))])
                        .await
                    })
                }),
                RwTxOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RelationshipExists(_)));
    }

    #[tokio::test]
    async fn touch_is_idempotent() {
        let ds = MemoryDatastore::new();
        write(&ds, vec![RelationshipUpdate::touch(viewer("readme", "alice"))]).await;
        let r2 = write(&ds, vec![RelationshipUpdate::touch(viewer("readme", "alice"))]).await;

        let rows = query_at(&ds, &r2, RelationshipsFilter::for_resource_type("document")).await;
        assert_eq!(rows.len(), 1);

        // The second touch changed nothing, so the row still carries its
        // original creation transaction.
        let state = ds.state.read().await;
        assert_eq!(state.relationships.len(), 1);
        assert_eq!(state.relationships[0].created_txid, 1);
    }

    #[tokio::test]
    async fn touch_replaces_caveat_context() {
        let ds = MemoryDatastore::new();
        write(&ds, vec![RelationshipUpdate::touch(viewer("readme", "alice"))]).await;

        let caveated = viewer("readme", "alice").with_caveat(CaveatReference::named("has_age"));
        let r2 = write(&ds, vec![RelationshipUpdate::touch(caveated.clone())]).await;

        let rows = query_at(&ds, &r2, RelationshipsFilter::for_resource_type("document")).await;
        assert_eq!(rows, vec![caveated]);
    }

    #[tokio::test]
    async fn create_then_delete_in_one_tx_leaves_nothing() {
        let ds = MemoryDatastore::new();
        let rel = viewer("readme", "alice");
        let r = ds
            .read_write_tx(
                &rw_fn(move |rwt| {
                    let rel = rel.clone();
                    Box::pin(async move {
                        rwt.write_relationships(vec![
                            RelationshipUpdate::create(rel.clone()),
                            RelationshipUpdate::delete(rel),
                        ])
                        .await
                    })
                }),
                RwTxOptions::default(),
            )
            .await
            .unwrap();

        assert!(query_at(&ds, &r, RelationshipsFilter::for_resource_type("document"))
            .await
            .is_empty());
        assert!(ds.state.read().await.relationships.is_empty());
    }

    #[tokio::test]
    async fn delete_then_create_in_one_tx_leaves_one_row() {
        let ds = MemoryDatastore::new();
        write(&ds, vec![RelationshipUpdate::create(viewer("readme", "alice"))]).await;

        let rel = viewer("readme", "alice");
        let r = ds
            .read_write_tx(
                &rw_fn(move |rwt| {
                    let rel = rel.clone();
                    Box::pin(async move {
                        rwt.write_relationships(vec![
                            RelationshipUpdate::delete(rel.clone()),
                            RelationshipUpdate::create(rel),
                        ])
                        .await
                    })
                }),
                RwTxOptions::default(),
            )
            .await
            .unwrap();

        let rows = query_at(&ds, &r, RelationshipsFilter::for_resource_type("document")).await;
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn delete_absent_fails() {
        let ds = MemoryDatastore::new();
        let err = ds
            .read_write_tx(
                &rw_fn(|rwt| {
                    Box::pin(async move {
                        rwt.write_relationships(vec![RelationshipUpdate::delete(viewer(
                            "readme", "ghost",
                        ))])
                        .await
                    })
                }),
                RwTxOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RelationshipNotFound(_)));
    }

    #[tokio::test]
    async fn failed_transaction_rolls_back() {
        let ds = MemoryDatastore::new();
        let err = ds
            .read_write_tx(
                &rw_fn(|rwt| {
                    Box::pin(async move {
                        rwt.write_relationships(vec![RelationshipUpdate::create(viewer(
                            "readme", "alice",
                        ))])
                        .await?;
                        Err(StoreError::Internal("boom".to_string()))
                    })
                }),
                RwTxOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Internal(_)));

        let head = ds.head_revision().await.unwrap();
        assert!(query_at(&ds, &head, RelationshipsFilter::for_resource_type("document"))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn retryable_errors_retry_until_budget() {
        let ds = MemoryDatastore::with_options(MemoryOptions {
            max_retries: 2,
            ..MemoryOptions::default()
        });

        let attempts = std::sync::atomic::AtomicUsize::new(0);
        let err = ds
            .read_write_tx(
                &rw_fn(|_rwt| {
                    attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Box::pin(async move {
                        Err(StoreError::Serialization("simulated conflict".to_string()))
                    })
                }),
                RwTxOptions::default(),
            )
            .await
            .unwrap_err();

        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
        match err {
            StoreError::MaxRetries { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, StoreError::Serialization(_)));
            }
            other => panic!("expected MaxRetries, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_failure() {
        let ds = MemoryDatastore::new();
        let attempts = std::sync::atomic::AtomicUsize::new(0);

        let revision = ds
            .read_write_tx(
                &rw_fn(|rwt| {
                    let attempt = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Box::pin(async move {
                        if attempt == 0 {
                            return Err(StoreError::Serialization("transient".to_string()));
                        }
                        rwt.write_relationships(vec![RelationshipUpdate::create(viewer(
                            "readme", "alice",
                        ))])
                        .await
                    })
                }),
                RwTxOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(query_at(&ds, &revision, RelationshipsFilter::for_resource_type("document"))
            .await
            .len(), 1);
    }

    #[tokio::test]
    async fn rw_tx_sees_own_writes() {
        let ds = MemoryDatastore::new();
        ds.read_write_tx(
            &rw_fn(|rwt| {
                Box::pin(async move {
                    rwt.write_relationships(vec![RelationshipUpdate::create(viewer(
                        "readme", "alice",
                    ))])
                    .await?;
                    let iter = rwt
                        .query_relationships(
                            RelationshipsFilter::for_resource_type("document"),
                            QueryOptions::default(),
                        )
                        .await?;
                    let rows = crate::collect_all(iter)?;
                    assert_eq!(rows.len(), 1);
                    Ok(())
                })
            }),
            RwTxOptions::default(),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn delete_relationships_respects_limit() {
        let ds = MemoryDatastore::new();
        let updates: Vec<_> = (0..10)
            .map(|i| RelationshipUpdate::create(viewer("readme", &format!("user-{i}"))))
            .collect();
        write(&ds, updates).await;

        let r = ds
            .read_write_tx(
                &rw_fn(|rwt| {
                    Box::pin(async move {
                        let (deleted, limited) = rwt
                            .delete_relationships(
                                RelationshipsFilter::for_resource_type("document"),
                                Some(4),
                            )
                            .await?;
                        assert_eq!(deleted, 4);
                        assert!(limited);
                        Ok(())
                    })
                }),
                RwTxOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(query_at(&ds, &r, RelationshipsFilter::for_resource_type("document"))
            .await
            .len(), 6);
    }

    #[tokio::test]
    async fn empty_delete_filter_rejected() {
        let ds = MemoryDatastore::new();
        let err = ds
            .read_write_tx(
                &rw_fn(|rwt| {
                    Box::pin(async move {
                        rwt.delete_relationships(RelationshipsFilter::default(), None)
                            .await
                            .map(|_| ())
                    })
                }),
                RwTxOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidFilter(_)));
    }

    #[tokio::test]
    async fn sorted_query_cursor_resumes() {
        let ds = MemoryDatastore::new();
        let updates: Vec<_> = (0..6)
            .map(|i| RelationshipUpdate::create(viewer(&format!("doc-{i}"), "alice")))
            .collect();
        let r = write(&ds, updates).await;

        let reader = ds.snapshot_reader(&r);
        let mut iter = reader
            .query_relationships(
                RelationshipsFilter::for_resource_type("document"),
                QueryOptions { limit: Some(3), sort: SortOrder::ByResource, after: None },
            )
            .await
            .unwrap();
        let mut first_page = Vec::new();
        while let Some(rel) = iter.next() {
            first_page.push(rel);
        }
        let cursor = iter.cursor().unwrap();
        iter.close();
        assert_eq!(first_page.len(), 3);

        let iter = reader
            .query_relationships(
                RelationshipsFilter::for_resource_type("document"),
                QueryOptions {
                    limit: None,
                    sort: SortOrder::ByResource,
                    after: Some(cursor),
                },
            )
            .await
            .unwrap();
        let second_page = crate::collect_all(iter).unwrap();
        assert_eq!(second_page.len(), 3);
        assert!(first_page.iter().all(|r| !second_page.contains(r)));
    }

    #[tokio::test]
    async fn watch_delivers_in_ascending_order() {
        let ds = MemoryDatastore::new();
        let start = ds.head_revision().await.unwrap();
        let mut stream = ds.watch(&start).await.unwrap();

        write(&ds, vec![RelationshipUpdate::create(viewer("a", "alice"))]).await;
        write(&ds, vec![RelationshipUpdate::create(viewer("b", "bob"))]).await;

        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert!(first.revision < second.revision);
        assert_eq!(first.changes.len(), 1);
        assert!(matches!(first.changes[0].operation, ChangeOperation::Created));
    }

    #[tokio::test]
    async fn gc_removes_only_expired_tombstones() {
        let ds = MemoryDatastore::new();
        write(&ds, vec![RelationshipUpdate::create(viewer("readme", "alice"))]).await;
        write(&ds, vec![RelationshipUpdate::create(viewer("readme", "bob"))]).await;
        write(&ds, vec![RelationshipUpdate::delete(viewer("readme", "alice"))]).await;

        // Everything committed before the watermark; only the tombstoned
        // row may go.
        let watermark = SystemTime::now() + Duration::from_secs(1);
        let stats = ds.delete_expired(watermark, 100).await.unwrap();
        assert_eq!(stats.relationships_removed, 1);

        let head = ds.head_revision().await.unwrap();
        let rows = query_at(&ds, &head, RelationshipsFilter::for_resource_type("document")).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].subject_id, "bob");
    }

    #[tokio::test]
    async fn gc_respects_batch_size() {
        let ds = MemoryDatastore::new();
        let creates: Vec<_> = (0..5)
            .map(|i| RelationshipUpdate::create(viewer("readme", &format!("u{i}"))))
            .collect();
        write(&ds, creates).await;
        let deletes: Vec<_> = (0..5)
            .map(|i| RelationshipUpdate::delete(viewer("readme", &format!("u{i}"))))
            .collect();
        write(&ds, deletes).await;

        let watermark = SystemTime::now() + Duration::from_secs(1);
        let stats = ds.delete_expired(watermark, 2).await.unwrap();
        assert_eq!(stats.relationships_removed, 2);
        let stats = ds.delete_expired(watermark, 100).await.unwrap();
        assert_eq!(stats.relationships_removed, 3);
    }

    #[tokio::test]
    async fn namespaces_are_versioned() {
        let ds = MemoryDatastore::new();
        let def = ObjectDefinition::new("document", vec![]);

        let def2 = def.clone();
        let r1 = ds
            .read_write_tx(
                &rw_fn(move |rwt| {
                    let def = def2.clone();
                    Box::pin(async move { rwt.write_namespaces(vec![def]).await })
                }),
                RwTxOptions::default(),
            )
            .await
            .unwrap();

        let reader = ds.snapshot_reader(&r1);
        let ns = reader.read_namespace_by_name("document").await.unwrap();
        assert_eq!(ns.definition, def);

        let r2 = ds
            .read_write_tx(
                &rw_fn(|rwt| Box::pin(async move { rwt.delete_namespace("document").await })),
                RwTxOptions::default(),
            )
            .await
            .unwrap();

        // Still visible at the old revision, gone at the new one.
        let old_reader = ds.snapshot_reader(&r1);
        assert!(old_reader.read_namespace_by_name("document").await.is_ok());
        let new_reader = ds.snapshot_reader(&r2);
        assert!(matches!(
            new_reader.read_namespace_by_name("document").await,
            Err(StoreError::NamespaceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn optimized_revision_is_quantized() {
        let ds = MemoryDatastore::with_options(MemoryOptions {
            revision_quantization: Duration::from_secs(60),
            ..MemoryOptions::default()
        });

        let first = ds.optimized_revision().await.unwrap();
        write(&ds, vec![RelationshipUpdate::create(viewer("readme", "alice"))]).await;
        let second = ds.optimized_revision().await.unwrap();
        // Within the quantization window the cached revision is reused.
        assert_eq!(first, second);
        let head = ds.head_revision().await.unwrap();
        assert!(head > second);
    }

    #[tokio::test]
    async fn ready_state_tracks_migration_head() {
        let ds = MemoryDatastore::new();
        assert!(ds.ready_state().await.unwrap().ready);

        let unmigrated = MemoryDatastore::new_unmigrated();
        let state = unmigrated.ready_state().await.unwrap();
        assert!(!state.ready);
        assert!(state.message.contains("not migrated"));

        memory_migrations().unwrap().run(&unmigrated, "head", false).await.unwrap();
        assert!(unmigrated.ready_state().await.unwrap().ready);
    }

    #[tokio::test]
    async fn repair_advances_transaction_counter() {
        let ds = MemoryDatastore::new();
        write(&ds, vec![RelationshipUpdate::create(viewer("readme", "alice"))]).await;

        // Simulate a counter reset.
        ds.state.write().await.head_txid = 0;
        ds.repair("transaction-ids").await.unwrap();
        assert_eq!(ds.state.read().await.head_txid, 1);

        assert!(ds.repair("unknown").await.is_err());
    }
}
