//! Expand resolution.
//!
//! Expand mirrors the rewrite structure as a tree with leaves listing the
//! direct and indirect user sets. Nothing short-circuits: every branch is
//! materialized, and the result is deterministic for a given schema,
//! revision, and resource.

use async_recursion::async_recursion;
use lattice_dispatch::{
    DispatchExpandRequest, DispatchExpandResponse, ExpandTree, ExpandTreeNode, ResponseMeta,
};
use lattice_store::{
    collect_all, QueryOptions, RelationshipsFilter, Reader, SubjectRelationFilter,
    SubjectsSelector,
};
use lattice_types::{ObjectAndRelation, RewriteNode};
use tracing::instrument;

use crate::engine::Engine;
use crate::Result;

impl Engine {
    #[instrument(skip_all, fields(resource = %req.resource, relation = %req.relation))]
    pub(crate) async fn expand(
        &self,
        req: DispatchExpandRequest,
    ) -> Result<DispatchExpandResponse> {
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
        let tree = match &relation.rewrite {
            Some(rewrite) => {
                self.expand_rewrite(&req, reader.as_ref(), rewrite, &mut meta).await?
            }
            None => self.expand_leaf(&req, reader.as_ref(), &req.relation).await?,
        };

        Ok(DispatchExpandResponse { metadata: meta, tree })
    }

    #[async_recursion]
    async fn expand_rewrite(
        &self,
        req: &DispatchExpandRequest,
        reader: &dyn Reader,
        rewrite: &RewriteNode,
        meta: &mut ResponseMeta,
    ) -> Result<ExpandTree> {
        let expanded = ObjectAndRelation::new(
            req.resource.object_type.clone(),
            req.resource.object_id.clone(),
            req.relation.clone(),
        );

        match rewrite {
            RewriteNode::This => self.expand_leaf(req, reader, &req.relation).await,

            RewriteNode::ComputedUserset { relation } => {
                let sub_req = DispatchExpandRequest {
                    resource: req.resource.clone(),
                    relation: relation.clone(),
                    revision: req.revision.clone(),
                    metadata: req.metadata.descend(),
                };
                let resp = self.dispatcher()?.dispatch_expand(sub_req).await?;
                meta.absorb(&resp.metadata);
                Ok(resp.tree)
            }

            RewriteNode::TupleToUserset { tupleset, computed } => {
                let rows = self.tupleset_rows(req, reader, tupleset).await?;

                let mut children = Vec::with_capacity(rows.len());
                for row in rows {
                    let sub_req = DispatchExpandRequest {
                        resource: row.subject().object(),
                        relation: computed.clone(),
                        revision: req.revision.clone(),
                        metadata: req.metadata.descend(),
                    };
                    let resp = self.dispatcher()?.dispatch_expand(sub_req).await?;
                    meta.absorb(&resp.metadata);
                    children.push(resp.tree);
                }

                Ok(ExpandTree { expanded, node: ExpandTreeNode::Union(children) })
            }

            RewriteNode::Union(child_rewrites) => {
                let mut children = Vec::with_capacity(child_rewrites.len());
                for child in child_rewrites {
                    children.push(self.expand_rewrite(req, reader, child, meta).await?);
                }
                Ok(ExpandTree { expanded, node: ExpandTreeNode::Union(children) })
            }

            RewriteNode::Intersection(child_rewrites) => {
                let mut children = Vec::with_capacity(child_rewrites.len());
                for child in child_rewrites {
                    children.push(self.expand_rewrite(req, reader, child, meta).await?);
                }
                Ok(ExpandTree { expanded, node: ExpandTreeNode::Intersection(children) })
            }

            RewriteNode::Exclusion { base, subtract } => {
                let base_tree = self.expand_rewrite(req, reader, base, meta).await?;
                let subtract_tree = self.expand_rewrite(req, reader, subtract, meta).await?;
                Ok(ExpandTree {
                    expanded,
                    node: ExpandTreeNode::Exclusion {
                        base: Box::new(base_tree),
                        subtract: Box::new(subtract_tree),
                    },
                })
            }

            RewriteNode::Nil => {
                Ok(ExpandTree { expanded, node: ExpandTreeNode::Leaf { subjects: vec![] } })
            }
        }
    }

    /// A leaf listing every subject stored on the relation, sorted for
    /// determinism.
    async fn expand_leaf(
        &self,
        req: &DispatchExpandRequest,
        reader: &dyn Reader,
        relation: &str,
    ) -> Result<ExpandTree> {
        let filter = RelationshipsFilter::for_resource_type(req.resource.object_type.clone())
            .with_resource_ids([req.resource.object_id.clone()])
            .with_relation(relation.to_string());

        let rows =
            collect_all(reader.query_relationships(filter, QueryOptions::default()).await?)?;

        let mut subjects: Vec<ObjectAndRelation> = rows.iter().map(|r| r.subject()).collect();
        subjects.sort();
        subjects.dedup();

        Ok(ExpandTree {
            expanded: ObjectAndRelation::new(
                req.resource.object_type.clone(),
                req.resource.object_id.clone(),
                relation.to_string(),
            ),
            node: ExpandTreeNode::Leaf { subjects },
        })
    }

    async fn tupleset_rows(
        &self,
        req: &DispatchExpandRequest,
        reader: &dyn Reader,
        tupleset: &str,
    ) -> Result<Vec<lattice_types::Relationship>> {
        let filter = RelationshipsFilter::for_resource_type(req.resource.object_type.clone())
            .with_resource_ids([req.resource.object_id.clone()])
            .with_relation(tupleset.to_string())
            .with_subjects_selector(
                SubjectsSelector::default()
                    .with_relation_filter(SubjectRelationFilter::ellipsis()),
            );

        let mut rows =
            collect_all(reader.query_relationships(filter, QueryOptions::default()).await?)?;
        rows.sort_by(|a, b| a.subject().cmp(&b.subject()));
        Ok(rows)
    }
}
