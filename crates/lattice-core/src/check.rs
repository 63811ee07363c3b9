//! Check resolution.
//!
//! A check walks the relation's rewrite tree. Direct arms read stored
//! relationships; indirect arms re-enter through the dispatcher with a
//! reduced depth budget. Results per resource id are combined with the
//! membership algebra, so conditional rows surface as caveat expressions
//! rather than being decided here.

use std::collections::HashMap;

use async_recursion::async_recursion;
use lattice_dispatch::{
    CheckResultsMap, DispatchCheckRequest, DispatchCheckResponse, Membership, ResponseMeta,
    ResultsSetting,
};
use lattice_store::{
    collect_all, QueryOptions, RelationshipsFilter, Reader, SubjectRelationFilter,
    SubjectsSelector,
};
use lattice_types::{CaveatReference, RelationRef, RewriteNode};
use tracing::{debug, instrument};

use crate::engine::{CheckPartial, Engine};
use crate::membership::{exclude_maps, intersect_maps, union, union_maps};
use crate::{EngineError, Result};

/// Rows that point at a userset, grouped by the userset's relation, with
/// the resources that referenced each userset object.
type UsersetGroups = HashMap<RelationRef, HashMap<String, Vec<(String, Option<CaveatReference>)>>>;

impl Engine {
    #[instrument(skip_all, fields(resource = %req.resource_relation, subject = %req.subject))]
    pub(crate) async fn check(
        &self,
        req: DispatchCheckRequest,
    ) -> Result<DispatchCheckResponse> {
        let reader = self.reader_at(&req.revision);
        let relation = self.load_relation(reader.as_ref(), &req.resource_relation).await?;

        let partial = match &relation.rewrite {
            Some(rewrite) => self.check_rewrite(&req, reader.as_ref(), rewrite).await?,
            None => self.check_direct(&req, reader.as_ref()).await?,
        };

        let mut metadata = Self::base_meta();
        metadata.merge(&partial.meta);

        debug!(results = partial.results.len(), "check resolved");
        Ok(DispatchCheckResponse { metadata, results: partial.results })
    }

    #[async_recursion]
    pub(crate) async fn check_rewrite(
        &self,
        req: &DispatchCheckRequest,
        reader: &dyn Reader,
        rewrite: &RewriteNode,
    ) -> Result<CheckPartial> {
        match rewrite {
            RewriteNode::This => self.check_direct(req, reader).await,

            RewriteNode::ComputedUserset { relation } => {
                let sub_req = DispatchCheckRequest {
                    resource_relation: RelationRef::new(
                        req.resource_relation.object_type.clone(),
                        relation.clone(),
                    ),
                    metadata: req.metadata.descend(),
                    ..req.clone()
                };
                let resp = self.dispatcher()?.dispatch_check(sub_req).await?;
                let mut meta = ResponseMeta::default();
                meta.absorb(&resp.metadata);
                Ok(CheckPartial { results: resp.results, meta })
            }

            RewriteNode::TupleToUserset { tupleset, computed } => {
                self.check_tupleset(req, reader, tupleset, computed).await
            }

            RewriteNode::Union(children) => self.check_union(req, reader, children).await,

            RewriteNode::Intersection(children) => {
                let exhaustive = exhaustive_request(req);
                let futures: Vec<_> = children
                    .iter()
                    .map(|child| self.check_rewrite(&exhaustive, reader, child))
                    .collect();
                let partials =
                    crate::concurrency::run_all_bounded(self.concurrency_limit, futures).await?;

                let mut meta = ResponseMeta::default();
                let mut maps = Vec::with_capacity(partials.len());
                for partial in partials {
                    meta.merge(&partial.meta);
                    maps.push(partial.results);
                }
                Ok(CheckPartial { results: intersect_maps(maps, &req.resource_ids), meta })
            }

            RewriteNode::Exclusion { base, subtract } => {
                let exhaustive = exhaustive_request(req);
                let (base_partial, subtract_partial) = futures::try_join!(
                    self.check_rewrite(&exhaustive, reader, base),
                    self.check_rewrite(&exhaustive, reader, subtract),
                )?;

                let mut meta = ResponseMeta::default();
                meta.merge(&base_partial.meta);
                meta.merge(&subtract_partial.meta);
                Ok(CheckPartial {
                    results: exclude_maps(base_partial.results, &subtract_partial.results),
                    meta,
                })
            }

            RewriteNode::Nil => Ok(CheckPartial::default()),
        }
    }

    /// Union: with `ALLOW_SINGLE_RESULT` children run in declaration order
    /// and the first definite member wins; otherwise children run with
    /// bounded concurrency and are joined by index.
    async fn check_union(
        &self,
        req: &DispatchCheckRequest,
        reader: &dyn Reader,
        children: &[RewriteNode],
    ) -> Result<CheckPartial> {
        if req.results_setting == ResultsSetting::AllowSingleResult {
            let mut meta = ResponseMeta::default();
            let mut maps = Vec::new();
            for child in children {
                let partial = self.check_rewrite(req, reader, child).await?;
                meta.merge(&partial.meta);
                let found_member =
                    partial.results.values().any(|m| matches!(m, Membership::Member));
                maps.push(partial.results);
                if found_member {
                    break;
                }
            }
            return Ok(CheckPartial { results: union_maps(maps), meta });
        }

        let futures: Vec<_> =
            children.iter().map(|child| self.check_rewrite(req, reader, child)).collect();
        let partials = crate::concurrency::run_all_bounded(self.concurrency_limit, futures).await?;

        let mut meta = ResponseMeta::default();
        let mut maps = Vec::with_capacity(partials.len());
        for partial in partials {
            meta.merge(&partial.meta);
            maps.push(partial.results);
        }
        Ok(CheckPartial { results: union_maps(maps), meta })
    }

    /// Resolve the stored relationships on the relation itself: direct
    /// subject hits decide immediately, userset rows fan out as
    /// sub-checks.
    pub(crate) async fn check_direct(
        &self,
        req: &DispatchCheckRequest,
        reader: &dyn Reader,
    ) -> Result<CheckPartial> {
        let subject_relation_filter = if req.subject.is_ellipsis() {
            SubjectRelationFilter::ellipsis()
        } else {
            SubjectRelationFilter::relation(req.subject.relation.clone())
        };

        let filter = RelationshipsFilter::for_resource_type(
            req.resource_relation.object_type.clone(),
        )
        .with_resource_ids(req.resource_ids.iter().cloned())
        .with_relation(req.resource_relation.relation.clone())
        .with_subjects_selector(
            SubjectsSelector::for_subject_type(req.subject.object_type.clone())
                .with_subject_ids([req.subject.object_id.clone()])
                .with_relation_filter(subject_relation_filter),
        )
        .with_subjects_selector(
            SubjectsSelector::default()
                .with_relation_filter(SubjectRelationFilter::any_non_ellipsis()),
        );

        let rows =
            collect_all(reader.query_relationships(filter, QueryOptions::default()).await?)?;

        let mut partial = CheckPartial::default();
        let mut userset_groups: UsersetGroups = HashMap::new();

        for row in rows {
            if row.subject() == req.subject {
                // A direct hit; a caveated row contributes conditionally.
                let membership = match &row.caveat {
                    Some(reference) => {
                        self.row_caveat_membership(reader, reference, &req.context).await?
                    }
                    None => Membership::Member,
                };
                merge_result(&mut partial.results, row.resource_id, membership);
            } else if !row.has_ellipsis_subject() {
                userset_groups
                    .entry(RelationRef::new(
                        row.subject_type.clone(),
                        row.subject_relation.clone(),
                    ))
                    .or_default()
                    .entry(row.subject_id.clone())
                    .or_default()
                    .push((row.resource_id.clone(), row.caveat.clone()));
            }
        }

        if self.satisfied(req, &partial.results) {
            return Ok(partial);
        }

        self.dispatch_userset_groups(req, reader, userset_groups, &mut partial).await?;
        Ok(partial)
    }

    /// Tuple-to-userset: walk the tupleset relation's rows, then check the
    /// computed relation on each row's subject.
    async fn check_tupleset(
        &self,
        req: &DispatchCheckRequest,
        reader: &dyn Reader,
        tupleset: &str,
        computed: &str,
    ) -> Result<CheckPartial> {
        let filter = RelationshipsFilter::for_resource_type(
            req.resource_relation.object_type.clone(),
        )
        .with_resource_ids(req.resource_ids.iter().cloned())
        .with_relation(tupleset.to_string())
        .with_subjects_selector(
            SubjectsSelector::default().with_relation_filter(SubjectRelationFilter::ellipsis()),
        );

        let rows =
            collect_all(reader.query_relationships(filter, QueryOptions::default()).await?)?;

        let mut userset_groups: UsersetGroups = HashMap::new();
        for row in rows {
            // The computed relation may be missing on this subject's type;
            // such rows simply contribute nothing.
            let namespace = match reader.read_namespace_by_name(&row.subject_type).await {
                Ok(ns) => ns,
                Err(lattice_store::StoreError::NamespaceNotFound(_)) => continue,
                Err(err) => return Err(EngineError::Store(err)),
            };
            if namespace.definition.relation(computed).is_none() {
                continue;
            }

            userset_groups
                .entry(RelationRef::new(row.subject_type.clone(), computed.to_string()))
                .or_default()
                .entry(row.subject_id.clone())
                .or_default()
                .push((row.resource_id.clone(), row.caveat.clone()));
        }

        let mut partial = CheckPartial::default();
        self.dispatch_userset_groups(req, reader, userset_groups, &mut partial).await?;
        Ok(partial)
    }

    /// Dispatch a sub-check per userset group in bounded chunks and fold
    /// the answers back onto the referencing resources.
    async fn dispatch_userset_groups(
        &self,
        req: &DispatchCheckRequest,
        reader: &dyn Reader,
        userset_groups: UsersetGroups,
        partial: &mut CheckPartial,
    ) -> Result<()> {
        if userset_groups.is_empty() {
            return Ok(());
        }

        // Deterministic dispatch order.
        let mut groups: Vec<_> = userset_groups.into_iter().collect();
        groups.sort_by(|(a, _), (b, _)| a.cmp(b));

        let mut chunk_requests: Vec<DispatchCheckRequest> = Vec::new();
        let mut chunk_entries: Vec<&HashMap<String, Vec<(String, Option<CaveatReference>)>>> =
            Vec::new();

        for (userset_relation, entries) in &groups {
            let mut ids: Vec<String> = entries.keys().cloned().collect();
            ids.sort_unstable();

            for chunk in ids.chunks(self.chunk_size) {
                chunk_requests.push(DispatchCheckRequest {
                    resource_relation: userset_relation.clone(),
                    resource_ids: chunk.to_vec(),
                    subject: req.subject.clone(),
                    context: req.context.clone(),
                    results_setting: ResultsSetting::RequireAllResults,
                    revision: req.revision.clone(),
                    metadata: req.metadata.descend(),
                });
                chunk_entries.push(entries);
            }
        }

        let dispatcher = self.dispatcher()?;
        let futures: Vec<_> = chunk_requests
            .into_iter()
            .map(|sub_req| {
                let dispatcher = dispatcher.clone();
                async move { Ok(dispatcher.dispatch_check(sub_req).await?) }
            })
            .collect();
        let responses =
            crate::concurrency::run_all_bounded(self.concurrency_limit, futures).await?;

        for (resp, entries) in responses.into_iter().zip(chunk_entries) {
            partial.meta.absorb(&resp.metadata);

            for (userset_id, membership) in resp.results {
                if matches!(membership, Membership::NotMember) {
                    continue;
                }
                let Some(references) = entries.get(&userset_id) else { continue };
                for (resource_id, caveat) in references {
                    let edge = match caveat {
                        Some(reference) => {
                            self.row_caveat_membership(reader, reference, &req.context).await?
                        }
                        None => Membership::Member,
                    };
                    let combined = crate::membership::intersect(edge, membership.clone());
                    merge_result(&mut partial.results, resource_id.clone(), combined);
                }
            }

            if self.satisfied(req, &partial.results) {
                return Ok(());
            }
        }

        Ok(())
    }

    /// Whether a single-result check can stop early.
    fn satisfied(&self, req: &DispatchCheckRequest, results: &CheckResultsMap) -> bool {
        req.results_setting == ResultsSetting::AllowSingleResult
            && results.values().any(|m| matches!(m, Membership::Member))
    }
}

fn exhaustive_request(req: &DispatchCheckRequest) -> DispatchCheckRequest {
    DispatchCheckRequest { results_setting: ResultsSetting::RequireAllResults, ..req.clone() }
}

fn merge_result(results: &mut CheckResultsMap, resource_id: String, membership: Membership) {
    if matches!(membership, Membership::NotMember) {
        return;
    }
    match results.remove(&resource_id) {
        Some(existing) => {
            results.insert(resource_id, union(existing, membership));
        }
        None => {
            results.insert(resource_id, membership);
        }
    }
}
