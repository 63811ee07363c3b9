//! LookupSubjects resolution.
//!
//! A forward walk symmetric to check: direct rows yield subjects of the
//! requested type, userset rows and indirect arms re-enter through the
//! dispatcher, and set operators combine per-subject memberships with the
//! same algebra check uses.

use async_recursion::async_recursion;
use lattice_dispatch::{
    ChannelStream, CheckResultsMap, DispatchLookupSubjectsRequest, DispatchStream, Membership,
    ResolvedSubject, ResponseMeta,
};
use lattice_store::{
    collect_all, QueryOptions, RelationshipsFilter, Reader, SubjectRelationFilter,
    SubjectsSelector,
};
use lattice_types::RewriteNode;
use tracing::{debug, instrument};

use crate::engine::Engine;
use crate::membership::{exclude_maps, intersect_maps, union, union_maps};
use crate::Result;

/// Subject id to membership; shares the check results map shape.
type SubjectsMap = CheckResultsMap;

impl Engine {
    #[instrument(skip_all, fields(resource = %req.resource, relation = %req.relation))]
    pub(crate) async fn lookup_subjects(
        &self,
        req: DispatchLookupSubjectsRequest,
        stream: &dyn DispatchStream<ResolvedSubject>,
    ) -> Result<ResponseMeta> {
        let reader = self.reader_at(&req.revision);
        let relation = self
            .load_relation(
                reader.as_ref(),
                &lattice_types::RelationRef::new(
                    req.resource.object_type.clone(),
                    req.relation.clone(),
                ),
            )
            .await?;

        let mut meta = Self::base_meta();
        let subjects = match &relation.rewrite {
            Some(rewrite) => {
                self.lookup_subjects_rewrite(&req, reader.as_ref(), rewrite, &mut meta).await?
            }
            None => self.lookup_subjects_direct(&req, reader.as_ref(), &mut meta).await?,
        };

        debug!(subjects = subjects.len(), "lookup subjects resolved");
        for (subject_id, membership) in subjects {
            stream.publish(ResolvedSubject { subject_id, membership }).await?;
        }
        Ok(meta)
    }

    #[async_recursion]
    async fn lookup_subjects_rewrite(
        &self,
        req: &DispatchLookupSubjectsRequest,
        reader: &dyn Reader,
        rewrite: &RewriteNode,
        meta: &mut ResponseMeta,
    ) -> Result<SubjectsMap> {
        match rewrite {
            RewriteNode::This => self.lookup_subjects_direct(req, reader, meta).await,

            RewriteNode::ComputedUserset { relation } => {
                let sub_req = DispatchLookupSubjectsRequest {
                    relation: relation.clone(),
                    metadata: req.metadata.descend(),
                    ..req.clone()
                };
                self.dispatch_subjects_collect(sub_req, meta).await
            }

            RewriteNode::TupleToUserset { tupleset, computed } => {
                let filter =
                    RelationshipsFilter::for_resource_type(req.resource.object_type.clone())
                        .with_resource_ids([req.resource.object_id.clone()])
                        .with_relation(tupleset.clone())
                        .with_subjects_selector(
                            SubjectsSelector::default()
                                .with_relation_filter(SubjectRelationFilter::ellipsis()),
                        );
                let rows = collect_all(
                    reader.query_relationships(filter, QueryOptions::default()).await?,
                )?;

                let mut maps = Vec::with_capacity(rows.len());
                for row in rows {
                    let sub_req = DispatchLookupSubjectsRequest {
                        resource: row.subject().object(),
                        relation: computed.clone(),
                        subject_type: req.subject_type.clone(),
                        context: req.context.clone(),
                        revision: req.revision.clone(),
                        metadata: req.metadata.descend(),
                    };
                    let mut found = self.dispatch_subjects_collect(sub_req, meta).await?;
                    found =
                        self.gate_with_row_caveat(reader, &row, found, &req.context).await?;
                    maps.push(found);
                }
                Ok(union_maps(maps))
            }

            RewriteNode::Union(children) => {
                let mut maps = Vec::with_capacity(children.len());
                for child in children {
                    maps.push(self.lookup_subjects_rewrite(req, reader, child, meta).await?);
                }
                Ok(union_maps(maps))
            }

            RewriteNode::Intersection(children) => {
                let mut maps = Vec::with_capacity(children.len());
                for child in children {
                    maps.push(self.lookup_subjects_rewrite(req, reader, child, meta).await?);
                }
                let universe: Vec<String> =
                    maps.first().map(|m| m.keys().cloned().collect()).unwrap_or_default();
                Ok(intersect_maps(maps, &universe))
            }

            RewriteNode::Exclusion { base, subtract } => {
                let base_map = self.lookup_subjects_rewrite(req, reader, base, meta).await?;
                let subtract_map =
                    self.lookup_subjects_rewrite(req, reader, subtract, meta).await?;
                Ok(exclude_maps(base_map, &subtract_map))
            }

            RewriteNode::Nil => Ok(SubjectsMap::new()),
        }
    }

    async fn lookup_subjects_direct(
        &self,
        req: &DispatchLookupSubjectsRequest,
        reader: &dyn Reader,
        meta: &mut ResponseMeta,
    ) -> Result<SubjectsMap> {
        let filter = RelationshipsFilter::for_resource_type(req.resource.object_type.clone())
            .with_resource_ids([req.resource.object_id.clone()])
            .with_relation(req.relation.clone());

        let rows =
            collect_all(reader.query_relationships(filter, QueryOptions::default()).await?)?;

        let mut subjects = SubjectsMap::new();
        for row in rows {
            if row.has_ellipsis_subject() {
                if row.subject_type != req.subject_type {
                    continue;
                }
                let membership = match &row.caveat {
                    Some(reference) => {
                        self.row_caveat_membership(reader, reference, &req.context).await?
                    }
                    None => Membership::Member,
                };
                merge_subject(&mut subjects, row.subject_id.clone(), membership);
            } else {
                // A userset row: every subject of the referenced set is a
                // subject here.
                let sub_req = DispatchLookupSubjectsRequest {
                    resource: row.subject().object(),
                    relation: row.subject_relation.clone(),
                    subject_type: req.subject_type.clone(),
                    context: req.context.clone(),
                    revision: req.revision.clone(),
                    metadata: req.metadata.descend(),
                };
                let mut found = self.dispatch_subjects_collect(sub_req, meta).await?;
                found = self.gate_with_row_caveat(reader, &row, found, &req.context).await?;
                for (subject_id, membership) in found {
                    merge_subject(&mut subjects, subject_id, membership);
                }
            }
        }
        Ok(subjects)
    }

    /// Dispatch a subjects lookup and collect the published items into a
    /// map, draining concurrently so publication backpressure never
    /// deadlocks.
    async fn dispatch_subjects_collect(
        &self,
        req: DispatchLookupSubjectsRequest,
        meta: &mut ResponseMeta,
    ) -> Result<SubjectsMap> {
        let dispatcher = self.dispatcher()?;
        let (stream, mut rx) = ChannelStream::new(64);

        let dispatch_fut = async move {
            let result = dispatcher.dispatch_lookup_subjects(req, &stream).await;
            drop(stream);
            result
        };
        let drain_fut = async {
            let mut map = SubjectsMap::new();
            while let Some(item) = rx.recv().await {
                merge_subject(&mut map, item.subject_id, item.membership);
            }
            map
        };

        let (dispatch_result, map) = tokio::join!(dispatch_fut, drain_fut);
        meta.absorb(&dispatch_result?);
        Ok(map)
    }

    /// Apply a userset row's caveat to every subject found through it.
    async fn gate_with_row_caveat(
        &self,
        reader: &dyn Reader,
        row: &lattice_types::Relationship,
        found: SubjectsMap,
        request_context: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<SubjectsMap> {
        let Some(reference) = &row.caveat else { return Ok(found) };

        let edge = self.row_caveat_membership(reader, reference, request_context).await?;
        if matches!(edge, Membership::NotMember) {
            return Ok(SubjectsMap::new());
        }

        let mut gated = SubjectsMap::new();
        for (subject_id, membership) in found {
            let combined = crate::membership::intersect(edge.clone(), membership);
            if !matches!(combined, Membership::NotMember) {
                gated.insert(subject_id, combined);
            }
        }
        Ok(gated)
    }
}

fn merge_subject(map: &mut SubjectsMap, subject_id: String, membership: Membership) {
    if matches!(membership, Membership::NotMember) {
        return;
    }
    match map.remove(&subject_id) {
        Some(existing) => {
            map.insert(subject_id, union(existing, membership));
        }
        None => {
            map.insert(subject_id, membership);
        }
    }
}
