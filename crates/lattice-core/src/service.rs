//! The transport-independent permission service.
//!
//! Each operation resolves the caller's consistency preference to a
//! revision, opens a reader or transaction at it, and drives the engine
//! through the dispatcher. Write paths validate against the schema inside
//! the transaction so that the namespace-existence invariant holds at the
//! write snapshot.

use std::sync::Arc;
use std::sync::Mutex;

use lattice_dispatch::{
    ChannelStream, DispatchCheckRequest, DispatchExpandRequest, DispatchLookupResourcesRequest,
    DispatchLookupSubjectsRequest, Dispatcher, ExpandTree, Membership, ResolvedResource,
    ResolvedSubject, ResolverMeta, ResponseMeta, ResultsSetting,
};
use lattice_store::{
    collect_all, rw_fn, Datastore, QueryOptions, ReadWriteTx, RelationshipsFilter,
    RwTxOptions, StoreError, WatchStream,
};
use lattice_types::{
    ObjectAndRelation, ObjectRef, Relationship, RelationshipUpdate, Revision, RewriteNode,
    SchemaDefinition, SubjectRelation,
};
use tracing::{info, instrument};

use crate::caveats::validate_context_keys;
use crate::consistency::{revision_for_consistency, Consistency};
use crate::lookup_resources::encode_offset_cursor;
use crate::{EngineError, Result};

/// The default root depth budget.
pub const DEFAULT_MAX_DEPTH: u32 = 50;

pub struct PermissionService {
    datastore: Arc<dyn Datastore>,
    dispatcher: Arc<dyn Dispatcher>,
    max_depth: u32,
}

#[derive(Debug, Clone)]
pub struct CheckPermissionRequest {
    pub consistency: Consistency,
    pub resource: ObjectRef,
    pub permission: String,
    pub subject: ObjectAndRelation,
    pub context: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct CheckPermissionResponse {
    pub checked_at: Revision,
    pub membership: Membership,
    pub metadata: ResponseMeta,
}

#[derive(Debug, Clone)]
pub struct ExpandPermissionResponse {
    pub expanded_at: Revision,
    pub tree: ExpandTree,
    pub metadata: ResponseMeta,
}

#[derive(Debug, Clone)]
pub struct LookupResourcesRequest {
    pub consistency: Consistency,
    pub resource_type: String,
    pub permission: String,
    pub subject: ObjectAndRelation,
    pub context: serde_json::Map<String, serde_json::Value>,
    pub limit: Option<u64>,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LookupResourcesResponse {
    pub looked_up_at: Revision,
    pub resources: Vec<ResolvedResource>,
    pub cursor: Option<String>,
    pub metadata: ResponseMeta,
}

#[derive(Debug, Clone)]
pub struct LookupSubjectsRequest {
    pub consistency: Consistency,
    pub resource: ObjectRef,
    pub permission: String,
    pub subject_type: String,
    pub context: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct LookupSubjectsResponse {
    pub looked_up_at: Revision,
    pub subjects: Vec<ResolvedSubject>,
    pub metadata: ResponseMeta,
}

#[derive(Debug, Clone)]
pub struct WriteSchemaResponse {
    pub written_at: Revision,
}

#[derive(Debug, Clone)]
pub struct DeleteRelationshipsResponse {
    pub deleted_at: Revision,
    pub deleted: usize,
    pub limit_reached: bool,
}

impl PermissionService {
    pub fn new(datastore: Arc<dyn Datastore>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { datastore, dispatcher, max_depth: DEFAULT_MAX_DEPTH }
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    fn root_meta(&self) -> ResolverMeta {
        ResolverMeta::with_depth(self.max_depth)
    }

    #[instrument(skip(self, req), fields(resource = %req.resource, permission = %req.permission, subject = %req.subject))]
    pub async fn check_permission(
        &self,
        req: CheckPermissionRequest,
    ) -> Result<CheckPermissionResponse> {
        let revision = revision_for_consistency(self.datastore.as_ref(), &req.consistency).await?;

        let dispatch_req = DispatchCheckRequest {
            resource_relation: lattice_types::RelationRef::new(
                req.resource.object_type.clone(),
                req.permission.clone(),
            ),
            resource_ids: vec![req.resource.object_id.clone()],
            subject: req.subject,
            context: req.context,
            results_setting: ResultsSetting::AllowSingleResult,
            revision: revision.clone(),
            metadata: self.root_meta(),
        };

        let resp = self.dispatcher.dispatch_check(dispatch_req).await?;
        let membership = resp.membership_of(&req.resource.object_id).clone();

        Ok(CheckPermissionResponse { checked_at: revision, membership, metadata: resp.metadata })
    }

    pub async fn expand_permission_tree(
        &self,
        consistency: Consistency,
        resource: ObjectRef,
        permission: String,
    ) -> Result<ExpandPermissionResponse> {
        let revision = revision_for_consistency(self.datastore.as_ref(), &consistency).await?;

        let resp = self
            .dispatcher
            .dispatch_expand(DispatchExpandRequest {
                resource,
                relation: permission,
                revision: revision.clone(),
                metadata: self.root_meta(),
            })
            .await?;

        Ok(ExpandPermissionResponse {
            expanded_at: revision,
            tree: resp.tree,
            metadata: resp.metadata,
        })
    }

    pub async fn lookup_resources(
        &self,
        req: LookupResourcesRequest,
    ) -> Result<LookupResourcesResponse> {
        let revision = revision_for_consistency(self.datastore.as_ref(), &req.consistency).await?;

        let offset = match &req.cursor {
            Some(token) => crate::lookup_resources::decode_offset_cursor(token)?,
            None => 0,
        };

        let dispatch_req = DispatchLookupResourcesRequest {
            resource_relation: lattice_types::RelationRef::new(
                req.resource_type.clone(),
                req.permission.clone(),
            ),
            subject: req.subject,
            context: req.context,
            limit: req.limit,
            cursor: req.cursor.clone(),
            revision: revision.clone(),
            metadata: self.root_meta(),
        };

        let (stream, mut rx) = ChannelStream::new(64);
        let dispatcher = Arc::clone(&self.dispatcher);
        let dispatch_fut = async move {
            let result = dispatcher.dispatch_lookup_resources(dispatch_req, &stream).await;
            drop(stream);
            result
        };
        let drain_fut = async {
            let mut resources = Vec::new();
            while let Some(item) = rx.recv().await {
                resources.push(item);
            }
            resources
        };

        let (meta, resources) = tokio::join!(dispatch_fut, drain_fut);
        let metadata = meta?;

        // Another page may exist only when this one filled the limit.
        let cursor = match req.limit {
            Some(limit) if resources.len() as u64 == limit => {
                Some(encode_offset_cursor(offset + resources.len() as u64))
            }
            _ => None,
        };

        Ok(LookupResourcesResponse { looked_up_at: revision, resources, cursor, metadata })
    }

    pub async fn lookup_subjects(
        &self,
        req: LookupSubjectsRequest,
    ) -> Result<LookupSubjectsResponse> {
        let revision = revision_for_consistency(self.datastore.as_ref(), &req.consistency).await?;

        let dispatch_req = DispatchLookupSubjectsRequest {
            resource: req.resource,
            relation: req.permission,
            subject_type: req.subject_type,
            context: req.context,
            revision: revision.clone(),
            metadata: self.root_meta(),
        };

        let (stream, mut rx) = ChannelStream::new(64);
        let dispatcher = Arc::clone(&self.dispatcher);
        let dispatch_fut = async move {
            let result = dispatcher.dispatch_lookup_subjects(dispatch_req, &stream).await;
            drop(stream);
            result
        };
        let drain_fut = async {
            let mut subjects = Vec::new();
            while let Some(item) = rx.recv().await {
                subjects.push(item);
            }
            subjects
        };

        let (meta, subjects) = tokio::join!(dispatch_fut, drain_fut);
        Ok(LookupSubjectsResponse { looked_up_at: revision, subjects, metadata: meta? })
    }

    pub async fn read_relationships(
        &self,
        consistency: Consistency,
        filter: RelationshipsFilter,
        opts: QueryOptions,
    ) -> Result<Vec<Relationship>> {
        let revision = revision_for_consistency(self.datastore.as_ref(), &consistency).await?;
        let reader = self.datastore.snapshot_reader(&revision);
        Ok(collect_all(reader.query_relationships(filter, opts).await?)?)
    }

    /// Apply relationship updates inside one transaction, validating each
    /// against the schema live at the write snapshot.
    #[instrument(skip_all, fields(updates = updates.len()))]
    pub async fn write_relationships(
        &self,
        updates: Vec<RelationshipUpdate>,
    ) -> Result<Revision> {
        let captured: Arc<Mutex<Option<EngineError>>> = Arc::new(Mutex::new(None));

        let result = self
            .datastore
            .read_write_tx(
                &rw_fn(|rwt| {
                    let updates = updates.clone();
                    let captured = captured.clone();
                    Box::pin(async move {
                        for update in &updates {
                            if let Err(err) =
                                validate_update(rwt, &update.relationship).await
                            {
                                return Err(stash_engine_error(&captured, err));
                            }
                        }
                        rwt.write_relationships(updates).await
                    })
                }),
                RwTxOptions::default(),
            )
            .await;

        unstash(result, &captured)
    }

    pub async fn delete_relationships(
        &self,
        filter: RelationshipsFilter,
        limit: Option<usize>,
    ) -> Result<DeleteRelationshipsResponse> {
        let outcome: Arc<Mutex<(usize, bool)>> = Arc::new(Mutex::new((0, false)));

        let revision = self
            .datastore
            .read_write_tx(
                &rw_fn(|rwt| {
                    let filter = filter.clone();
                    let outcome = outcome.clone();
                    Box::pin(async move {
                        let (deleted, limit_reached) =
                            rwt.delete_relationships(filter, limit).await?;
                        if let Ok(mut guard) = outcome.lock() {
                            *guard = (deleted, limit_reached);
                        }
                        Ok(())
                    })
                }),
                RwTxOptions::default(),
            )
            .await?;

        let (deleted, limit_reached) =
            outcome.lock().map(|g| *g).unwrap_or((0, false));
        Ok(DeleteRelationshipsResponse { deleted_at: revision, deleted, limit_reached })
    }

    pub async fn read_schema(&self, consistency: Consistency) -> Result<SchemaDefinition> {
        let revision = revision_for_consistency(self.datastore.as_ref(), &consistency).await?;
        let reader = self.datastore.snapshot_reader(&revision);

        let objects = reader
            .list_all_namespaces()
            .await?
            .into_iter()
            .map(|ns| ns.definition)
            .collect();
        let caveats =
            reader.list_all_caveats().await?.into_iter().map(|c| c.definition).collect();

        Ok(SchemaDefinition { objects, caveats })
    }

    /// Replace the stored schema. Definitions absent from the new schema
    /// are deleted.
    #[instrument(skip_all, fields(objects = schema.objects.len(), caveats = schema.caveats.len()))]
    pub async fn write_schema(&self, schema: SchemaDefinition) -> Result<WriteSchemaResponse> {
        validate_schema(&schema)?;

        let revision = self
            .datastore
            .read_write_tx(
                &rw_fn(|rwt| {
                    let schema = schema.clone();
                    Box::pin(async move {
                        let existing = rwt.list_all_namespaces().await?;
                        for namespace in existing {
                            if schema.object(&namespace.definition.name).is_none() {
                                rwt.delete_namespace(&namespace.definition.name).await?;
                            }
                        }
                        let existing_caveats = rwt.list_all_caveats().await?;
                        for caveat in existing_caveats {
                            if schema.caveat(&caveat.definition.name).is_none() {
                                rwt.delete_caveat(&caveat.definition.name).await?;
                            }
                        }

                        rwt.write_namespaces(schema.objects.clone()).await?;
                        rwt.write_caveats(schema.caveats.clone()).await
                    })
                }),
                RwTxOptions::default(),
            )
            .await?;

        info!("schema written");
        Ok(WriteSchemaResponse { written_at: revision })
    }

    pub async fn watch(&self, after: &Revision) -> Result<WatchStream> {
        if !self.datastore.features().watch {
            return Err(EngineError::Store(StoreError::WatchDisabled));
        }
        Ok(self.datastore.watch(after).await?)
    }
}

/// Validate one relationship against the schema visible to the
/// transaction.
async fn validate_update(
    rwt: &dyn ReadWriteTx,
    relationship: &Relationship,
) -> Result<()> {
    let namespace = rwt.read_namespace_by_name(&relationship.resource_type).await?;
    let relation = namespace
        .definition
        .relation(&relationship.relation)
        .ok_or_else(|| EngineError::RelationNotFound {
            object_type: relationship.resource_type.clone(),
            relation: relationship.relation.clone(),
        })?;

    if relation.is_permission() {
        return Err(EngineError::RelationNotWritable {
            object_type: relationship.resource_type.clone(),
            relation: relationship.relation.clone(),
        });
    }

    // The subject's namespace must be live at the same revision.
    rwt.read_namespace_by_name(&relationship.subject_type).await?;

    let subject_relation = SubjectRelation::from_str_form(&relationship.subject_relation);
    if !relation.admits(&relationship.subject_type, &subject_relation) {
        return Err(EngineError::SubjectTypeNotAllowed {
            object_type: relationship.resource_type.clone(),
            relation: relationship.relation.clone(),
            subject_type: relationship.subject_type.clone(),
        });
    }

    if let Some(reference) = &relationship.caveat {
        let caveat = rwt.read_caveat_by_name(&reference.caveat_name).await?;
        validate_context_keys(&caveat.definition, &reference.context)?;
    }

    Ok(())
}

/// Validate that a schema is internally consistent before storing it.
fn validate_schema(schema: &SchemaDefinition) -> Result<()> {
    for object in &schema.objects {
        for relation in &object.relations {
            for allowed in &relation.allowed_subjects {
                if schema.object(&allowed.object_type).is_none() {
                    return Err(EngineError::Evaluation(format!(
                        "relation `{}#{}` allows unknown object type `{}`",
                        object.name, relation.name, allowed.object_type
                    )));
                }
                if let Some(caveat_name) = &allowed.caveat_name {
                    if schema.caveat(caveat_name).is_none() {
                        return Err(EngineError::Evaluation(format!(
                            "relation `{}#{}` references unknown caveat `{}`",
                            object.name, relation.name, caveat_name
                        )));
                    }
                }
            }
            if let Some(rewrite) = &relation.rewrite {
                validate_rewrite(schema, object, rewrite)?;
            }
        }
    }
    Ok(())
}

fn validate_rewrite(
    schema: &SchemaDefinition,
    object: &lattice_types::ObjectDefinition,
    rewrite: &RewriteNode,
) -> Result<()> {
    match rewrite {
        RewriteNode::This | RewriteNode::Nil => Ok(()),
        RewriteNode::ComputedUserset { relation } => {
            if object.relation(relation).is_none() {
                return Err(EngineError::Evaluation(format!(
                    "`{}` rewrite references unknown relation `{}`",
                    object.name, relation
                )));
            }
            Ok(())
        }
        RewriteNode::TupleToUserset { tupleset, .. } => {
            if object.relation(tupleset).is_none() {
                return Err(EngineError::Evaluation(format!(
                    "`{}` rewrite walks unknown tupleset `{}`",
                    object.name, tupleset
                )));
            }
            Ok(())
        }
        RewriteNode::Union(children) | RewriteNode::Intersection(children) => {
            for child in children {
                validate_rewrite(schema, object, child)?;
            }
            Ok(())
        }
        RewriteNode::Exclusion { base, subtract } => {
            validate_rewrite(schema, object, base)?;
            validate_rewrite(schema, object, subtract)
        }
    }
}

fn stash_engine_error(captured: &Mutex<Option<EngineError>>, err: EngineError) -> StoreError {
    match err {
        EngineError::Store(store_err) => store_err,
        other => {
            let message = other.to_string();
            if let Ok(mut guard) = captured.lock() {
                *guard = Some(other);
            }
            StoreError::InvalidFilter(message)
        }
    }
}

fn unstash(
    result: std::result::Result<Revision, StoreError>,
    captured: &Mutex<Option<EngineError>>,
) -> Result<Revision> {
    match result {
        Ok(revision) => Ok(revision),
        Err(store_err) => {
            if let Ok(mut guard) = captured.lock() {
                if let Some(engine_err) = guard.take() {
                    return Err(engine_err);
                }
            }
            Err(EngineError::Store(store_err))
        }
    }
}
