//! Dispatch key computation.
//!
//! Every dispatch kind has a canonical fingerprint: the operation tag, the
//! resource relation, the sorted resource ids, the subject triple, the
//! request-shape flags, and the canonicalized caveat context. The
//! fingerprint is hashed with xxh3 for ring placement. The direct handler
//! hashes the whole fingerprint; the prefix handler hashes only the stable
//! prefix so related sub-requests land on the same peer.

use serde_json::Value;
use xxhash_rust::xxh3::xxh3_64;

use crate::{
    DispatchCheckRequest, DispatchExpandRequest, DispatchLookupResourcesRequest,
    DispatchLookupSubjectsRequest, ResultsSetting,
};

const FIELD_SEP: u8 = 0x00;
const SECTION_SEP: u8 = 0x1e;

/// The operation tag of a dispatch fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DispatchKind {
    Check = 1,
    Expand = 2,
    LookupResources = 3,
    LookupSubjects = 4,
}

/// A computed dispatch key: the ring placement hash plus the full
/// canonical fingerprint bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchKey {
    pub routing_hash: u64,
    pub canonical: Vec<u8>,
}

impl DispatchKey {
    /// A stable cache identity for this request shape at a revision.
    pub fn cache_key(&self, revision_str: &str) -> Vec<u8> {
        let mut key = self.canonical.clone();
        key.push(SECTION_SEP);
        key.extend_from_slice(revision_str.as_bytes());
        key
    }
}

/// Computes the dispatch key for each dispatch kind.
pub trait KeyHandler: Send + Sync {
    fn check_key(&self, req: &DispatchCheckRequest) -> DispatchKey;
    fn expand_key(&self, req: &DispatchExpandRequest) -> DispatchKey;
    fn lookup_resources_key(&self, req: &DispatchLookupResourcesRequest) -> DispatchKey;
    fn lookup_subjects_key(&self, req: &DispatchLookupSubjectsRequest) -> DispatchKey;
}

struct Fingerprint {
    bytes: Vec<u8>,
    /// Length of the stable prefix: operation tag, resource relation, and
    /// subject triple.
    prefix_len: usize,
}

fn push_field(bytes: &mut Vec<u8>, field: &str) {
    bytes.extend_from_slice(field.as_bytes());
    bytes.push(FIELD_SEP);
}

/// Serialize the caveat context with sorted keys so that equal contexts
/// always fingerprint identically.
fn push_context(bytes: &mut Vec<u8>, context: &serde_json::Map<String, Value>) {
    let mut keys: Vec<&String> = context.keys().collect();
    keys.sort_unstable();
    for key in keys {
        push_field(bytes, key);
        if let Some(value) = context.get(key) {
            push_field(bytes, &value.to_string());
        }
    }
}

fn fingerprint(
    kind: DispatchKind,
    resource_type: &str,
    resource_relation: &str,
    subject: (&str, &str, &str),
    resource_ids: &[String],
    flags: u8,
    context: &serde_json::Map<String, Value>,
) -> Fingerprint {
    let mut bytes = Vec::with_capacity(64);
    bytes.push(kind as u8);
    bytes.push(SECTION_SEP);
    push_field(&mut bytes, resource_type);
    push_field(&mut bytes, resource_relation);
    bytes.push(SECTION_SEP);
    push_field(&mut bytes, subject.0);
    push_field(&mut bytes, subject.1);
    push_field(&mut bytes, subject.2);
    let prefix_len = bytes.len();

    bytes.push(SECTION_SEP);
    let mut sorted_ids: Vec<&String> = resource_ids.iter().collect();
    sorted_ids.sort_unstable();
    for id in sorted_ids {
        push_field(&mut bytes, id);
    }
    bytes.push(SECTION_SEP);
    bytes.push(flags);
    bytes.push(SECTION_SEP);
    push_context(&mut bytes, context);

    Fingerprint { bytes, prefix_len }
}

fn check_fingerprint(req: &DispatchCheckRequest) -> Fingerprint {
    let flags = match req.results_setting {
        ResultsSetting::RequireAllResults => 1,
        ResultsSetting::AllowSingleResult => 0,
    };
    fingerprint(
        DispatchKind::Check,
        &req.resource_relation.object_type,
        &req.resource_relation.relation,
        (&req.subject.object_type, &req.subject.object_id, &req.subject.relation),
        &req.resource_ids,
        flags,
        &req.context,
    )
}

fn expand_fingerprint(req: &DispatchExpandRequest) -> Fingerprint {
    fingerprint(
        DispatchKind::Expand,
        &req.resource.object_type,
        &req.relation,
        ("", "", ""),
        std::slice::from_ref(&req.resource.object_id),
        0,
        &serde_json::Map::new(),
    )
}

fn lookup_resources_fingerprint(req: &DispatchLookupResourcesRequest) -> Fingerprint {
    fingerprint(
        DispatchKind::LookupResources,
        &req.resource_relation.object_type,
        &req.resource_relation.relation,
        (&req.subject.object_type, &req.subject.object_id, &req.subject.relation),
        &[],
        0,
        &req.context,
    )
}

fn lookup_subjects_fingerprint(req: &DispatchLookupSubjectsRequest) -> Fingerprint {
    fingerprint(
        DispatchKind::LookupSubjects,
        &req.resource.object_type,
        &req.relation,
        (&req.subject_type, "", ""),
        std::slice::from_ref(&req.resource.object_id),
        0,
        &req.context,
    )
}

/// Hashes the entire canonical fingerprint.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectKeyHandler;

impl KeyHandler for DirectKeyHandler {
    fn check_key(&self, req: &DispatchCheckRequest) -> DispatchKey {
        let fp = check_fingerprint(req);
        DispatchKey { routing_hash: xxh3_64(&fp.bytes), canonical: fp.bytes }
    }

    fn expand_key(&self, req: &DispatchExpandRequest) -> DispatchKey {
        let fp = expand_fingerprint(req);
        DispatchKey { routing_hash: xxh3_64(&fp.bytes), canonical: fp.bytes }
    }

    fn lookup_resources_key(&self, req: &DispatchLookupResourcesRequest) -> DispatchKey {
        let fp = lookup_resources_fingerprint(req);
        DispatchKey { routing_hash: xxh3_64(&fp.bytes), canonical: fp.bytes }
    }

    fn lookup_subjects_key(&self, req: &DispatchLookupSubjectsRequest) -> DispatchKey {
        let fp = lookup_subjects_fingerprint(req);
        DispatchKey { routing_hash: xxh3_64(&fp.bytes), canonical: fp.bytes }
    }
}

/// Hashes only the stable prefix of the fingerprint, so that the many
/// sub-requests of a scatter (for example LookupResources over a fixed
/// resource relation) share a ring slot and its caches.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrefixKeyHandler;

impl PrefixKeyHandler {
    fn key_of(fp: Fingerprint) -> DispatchKey {
        DispatchKey { routing_hash: xxh3_64(&fp.bytes[..fp.prefix_len]), canonical: fp.bytes }
    }
}

impl KeyHandler for PrefixKeyHandler {
    fn check_key(&self, req: &DispatchCheckRequest) -> DispatchKey {
        Self::key_of(check_fingerprint(req))
    }

    fn expand_key(&self, req: &DispatchExpandRequest) -> DispatchKey {
        Self::key_of(expand_fingerprint(req))
    }

    fn lookup_resources_key(&self, req: &DispatchLookupResourcesRequest) -> DispatchKey {
        Self::key_of(lookup_resources_fingerprint(req))
    }

    fn lookup_subjects_key(&self, req: &DispatchLookupSubjectsRequest) -> DispatchKey {
        Self::key_of(lookup_subjects_fingerprint(req))
    }
}
