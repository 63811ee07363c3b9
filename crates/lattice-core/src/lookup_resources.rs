//! LookupResources resolution.
//!
//! The walker starts at the subject and climbs the schema in reverse:
//! reverse relationship queries surface the concrete parents at each
//! step, computed-userset and tuple-to-userset entrypoints climb the
//! rewrites, and a visited set bounds cyclic schemas. Resources reached
//! through pure union paths with no caveats are emitted directly; any
//! other candidate is verified with a dispatched check before emission.

use std::collections::{HashSet, VecDeque};

use base64::Engine as _;
use lattice_dispatch::{
    DispatchCheckRequest, DispatchLookupResourcesRequest, DispatchStream, Membership,
    ResolvedResource, ResponseMeta, ResultsSetting,
};
use lattice_store::{collect_all, ReverseQueryOptions, SubjectRelationFilter, SubjectsFilter};
use lattice_types::{ObjectAndRelation, RelationRef, SubjectRelation};
use tracing::{debug, instrument};

use crate::engine::Engine;
use crate::graph::SchemaIndex;
use crate::{EngineError, Result};

/// Decode the offset carried by an opaque continuation token.
pub(crate) fn decode_offset_cursor(token: &str) -> Result<u64> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(token)
        .map_err(|e| EngineError::InvalidCursor(e.to_string()))?;
    let text =
        String::from_utf8(decoded).map_err(|e| EngineError::InvalidCursor(e.to_string()))?;
    text.parse().map_err(|_| EngineError::InvalidCursor(text))
}

/// Encode an offset as an opaque continuation token.
pub(crate) fn encode_offset_cursor(offset: u64) -> String {
    base64::engine::general_purpose::STANDARD.encode(offset.to_string())
}

/// One node of the reverse walk: a concrete object and relation, plus
/// whether the path so far permits emission without verification.
#[derive(Debug, Clone)]
struct WalkNode {
    node: ObjectAndRelation,
    safe: bool,
}

struct Emitter<'a> {
    stream: &'a dyn DispatchStream<ResolvedResource>,
    to_skip: u64,
    limit: Option<u64>,
    published: u64,
}

impl<'a> Emitter<'a> {
    /// Publish an item, honoring the cursor offset and limit. Returns
    /// false once the limit is reached.
    async fn publish(&mut self, item: ResolvedResource) -> Result<bool> {
        if self.to_skip > 0 {
            self.to_skip -= 1;
            return Ok(true);
        }
        if let Some(limit) = self.limit {
            if self.published >= limit {
                return Ok(false);
            }
        }
        self.stream.publish(item).await?;
        self.published += 1;
        Ok(self.limit.map_or(true, |limit| self.published < limit))
    }
}

impl Engine {
    #[instrument(skip_all, fields(resource = %req.resource_relation, subject = %req.subject))]
    pub(crate) async fn lookup_resources(
        &self,
        req: DispatchLookupResourcesRequest,
        stream: &dyn DispatchStream<ResolvedResource>,
    ) -> Result<ResponseMeta> {
        let reader = self.reader_at(&req.revision);
        let index = SchemaIndex::load(reader.as_ref()).await?;

        // The target must exist before any walking begins.
        let target_object = index.object(&req.resource_relation.object_type)?;
        if target_object.relation(&req.resource_relation.relation).is_none() {
            return Err(EngineError::RelationNotFound {
                object_type: req.resource_relation.object_type.clone(),
                relation: req.resource_relation.relation.clone(),
            });
        }

        let to_skip = match &req.cursor {
            Some(token) => decode_offset_cursor(token)?,
            None => 0,
        };
        let mut emitter = Emitter { stream, to_skip, limit: req.limit, published: 0 };

        let mut meta = Self::base_meta();
        let mut frontier: VecDeque<WalkNode> = VecDeque::new();
        let mut visited: HashSet<ObjectAndRelation> = HashSet::new();
        let mut emitted: HashSet<String> = HashSet::new();
        let mut pending_verification: Vec<String> = Vec::new();

        visited.insert(req.subject.clone());
        frontier.push_back(WalkNode { node: req.subject.clone(), safe: true });

        'walk: while let Some(current) = frontier.pop_front() {
            // A node matching the target relation is a result candidate.
            if current.node.object_type == req.resource_relation.object_type
                && current.node.relation == req.resource_relation.relation
            {
                if current.safe {
                    if emitted.insert(current.node.object_id.clone()) {
                        let more = emitter
                            .publish(ResolvedResource {
                                resource_id: current.node.object_id.clone(),
                                membership: Membership::Member,
                            })
                            .await?;
                        if !more {
                            break 'walk;
                        }
                    }
                } else if !emitted.contains(&current.node.object_id)
                    && !pending_verification.contains(&current.node.object_id)
                {
                    pending_verification.push(current.node.object_id.clone());
                    if pending_verification.len() >= self.chunk_size {
                        let batch = std::mem::take(&mut pending_verification);
                        if !self
                            .verify_and_emit(&req, batch, &mut emitter, &mut emitted, &mut meta)
                            .await?
                        {
                            break 'walk;
                        }
                    }
                }
            }

            // Climb rewrites on the same object.
            for (relation, union_only) in
                index.computed_entrypoints(&current.node.object_type, &current.node.relation)
            {
                let next = ObjectAndRelation::new(
                    current.node.object_type.clone(),
                    current.node.object_id.clone(),
                    relation,
                );
                if visited.insert(next.clone()) {
                    frontier.push_back(WalkNode { node: next, safe: current.safe && union_only });
                }
            }

            // Relations that directly admit this node as a subject.
            let subject_relation = SubjectRelation::from_str_form(&current.node.relation);
            for (object_type, relation) in
                index.direct_entrypoints(&current.node.object_type, &subject_relation)
            {
                let relation_filter = match &subject_relation {
                    SubjectRelation::Ellipsis => SubjectRelationFilter::ellipsis(),
                    SubjectRelation::Relation(name) => SubjectRelationFilter::relation(name.clone()),
                };
                let rows = collect_all(
                    reader
                        .reverse_query_relationships(
                            SubjectsFilter::for_subject_type(current.node.object_type.clone())
                                .with_subject_ids([current.node.object_id.clone()])
                                .with_relation_filter(relation_filter),
                            ReverseQueryOptions {
                                limit: None,
                                resource_relation: Some(RelationRef::new(
                                    object_type.clone(),
                                    relation.clone(),
                                )),
                            },
                        )
                        .await?,
                )?;

                let mut sorted = rows;
                sorted.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));

                for row in sorted {
                    let edge_safe = match &row.caveat {
                        None => current.safe,
                        Some(reference) => {
                            match self
                                .row_caveat_membership(reader.as_ref(), reference, &req.context)
                                .await?
                            {
                                Membership::NotMember => continue,
                                Membership::Member => current.safe,
                                Membership::Conditional(_) => false,
                            }
                        }
                    };

                    let next = ObjectAndRelation::new(
                        object_type.clone(),
                        row.resource_id.clone(),
                        relation.clone(),
                    );
                    if visited.insert(next.clone()) {
                        frontier.push_back(WalkNode { node: next, safe: edge_safe });
                    }
                }
            }

            // Tuple-to-userset arms consuming this relation.
            for entry in
                index.tupleset_entrypoints(&current.node.object_type, &current.node.relation)
            {
                let rows = collect_all(
                    reader
                        .reverse_query_relationships(
                            SubjectsFilter::for_subject_type(current.node.object_type.clone())
                                .with_subject_ids([current.node.object_id.clone()])
                                .with_relation_filter(SubjectRelationFilter::ellipsis()),
                            ReverseQueryOptions {
                                limit: None,
                                resource_relation: Some(RelationRef::new(
                                    entry.object_type.clone(),
                                    entry.tupleset.clone(),
                                )),
                            },
                        )
                        .await?,
                )?;

                let mut sorted = rows;
                sorted.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));

                for row in sorted {
                    let edge_safe = match &row.caveat {
                        None => current.safe && entry.union_only,
                        Some(reference) => {
                            match self
                                .row_caveat_membership(reader.as_ref(), reference, &req.context)
                                .await?
                            {
                                Membership::NotMember => continue,
                                Membership::Member => current.safe && entry.union_only,
                                Membership::Conditional(_) => false,
                            }
                        }
                    };

                    let next = ObjectAndRelation::new(
                        entry.object_type.clone(),
                        row.resource_id.clone(),
                        entry.result_relation.clone(),
                    );
                    if visited.insert(next.clone()) {
                        frontier.push_back(WalkNode { node: next, safe: edge_safe });
                    }
                }
            }
        }

        if !pending_verification.is_empty() {
            self.verify_and_emit(&req, pending_verification, &mut emitter, &mut emitted, &mut meta)
                .await?;
        }

        debug!(published = emitter.published, "lookup resources complete");
        Ok(meta)
    }

    /// Verify candidates with a dispatched check and emit the members and
    /// conditional members. Returns false once the limit is reached.
    async fn verify_and_emit(
        &self,
        req: &DispatchLookupResourcesRequest,
        candidates: Vec<String>,
        emitter: &mut Emitter<'_>,
        emitted: &mut HashSet<String>,
        meta: &mut ResponseMeta,
    ) -> Result<bool> {
        for chunk in candidates.chunks(self.chunk_size) {
            let check_req = DispatchCheckRequest {
                resource_relation: req.resource_relation.clone(),
                resource_ids: chunk.to_vec(),
                subject: req.subject.clone(),
                context: req.context.clone(),
                results_setting: ResultsSetting::RequireAllResults,
                revision: req.revision.clone(),
                metadata: req.metadata.descend(),
            };
            let resp = self.dispatcher()?.dispatch_check(check_req).await?;
            meta.absorb(&resp.metadata);

            for resource_id in chunk {
                let membership = resp.membership_of(resource_id).clone();
                if matches!(membership, Membership::NotMember) {
                    continue;
                }
                if !emitted.insert(resource_id.clone()) {
                    continue;
                }
                let more = emitter
                    .publish(ResolvedResource { resource_id: resource_id.clone(), membership })
                    .await?;
                if !more {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}
