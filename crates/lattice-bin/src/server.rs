//! Server assembly: datastore, dispatch stack, and background loops.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use lattice_config::Config;
use lattice_core::{Engine, LocalDispatcher, PermissionService};
use lattice_dispatch::{
    CachingDispatcher, ClusterDispatcher, ClusterDispatcherConfig, DirectKeyHandler, Dispatcher,
    Hashring, InProcessPeers, Member,
};
use lattice_store::memory::MemoryOptions;
use lattice_store::{run_garbage_collector, Datastore, GcConfig, MemoryDatastore};
use tracing::{info, warn};

use crate::termination::TerminationError;

pub struct ServerHandle {
    pub datastore: Arc<MemoryDatastore>,
    pub service: PermissionService,
    gc_shutdown: Option<tokio::sync::watch::Sender<bool>>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        if let Some(tx) = &self.gc_shutdown {
            let _ = tx.send(true);
        }
    }
}

/// Build the full single-process stack described by the configuration.
pub async fn build(config: &Config) -> Result<ServerHandle> {
    let datastore = Arc::new(MemoryDatastore::with_options(MemoryOptions {
        revision_quantization: Duration::from_millis(config.datastore.revision_quantization_ms),
        max_retries: config.datastore.max_retries,
        watch_buffer_length: config.datastore.watch_buffer_length,
    }));

    let ready = datastore.ready_state().await?;
    if !ready.ready {
        return Err(TerminationError::new(ready.message, 3).into());
    }
    info!(message = %ready.message, "datastore ready");

    // Ring membership: this node plus any configured peers. Peers are
    // reachable only through an in-process transport in this build, so a
    // populated peer list warns rather than silently dropping traffic.
    let ring = Arc::new(Hashring::new(config.dispatch.replication_factor));
    ring.add_member(Member::new(
        config.dispatch.member_id.clone(),
        format!("{}:{}", config.server.host, config.server.port),
    ));
    for peer in &config.dispatch.peers {
        if let Some((id, address)) = peer.split_once('=') {
            warn!(peer = id, "peer configured without a remote transport; keys owned by it will fail");
            ring.add_member(Member::new(id, address));
        }
    }

    let engine = Arc::new(Engine::new(
        Arc::clone(&datastore) as Arc<dyn Datastore>,
        config.dispatch.concurrency_limit,
    ));
    let local = LocalDispatcher::new(Arc::clone(&engine));

    let peers = Arc::new(InProcessPeers::new());
    peers.add_node(
        config.dispatch.member_id.clone(),
        Arc::clone(&local) as Arc<dyn Dispatcher>,
    );

    let cluster = Arc::new(ClusterDispatcher::new(
        Arc::clone(&local) as Arc<dyn Dispatcher>,
        peers,
        ring,
        ClusterDispatcherConfig::new(config.dispatch.member_id.clone())
            .with_key_handler(Arc::new(DirectKeyHandler))
            .with_timeout(Duration::from_secs(config.dispatch.overall_timeout_secs)),
    ));

    let caching = Arc::new(CachingDispatcher::new(
        cluster as Arc<dyn Dispatcher>,
        Arc::new(DirectKeyHandler),
        config.dispatch.cache_capacity,
    ));

    // Recursive sub-questions re-enter through the cache and the ring.
    engine.set_redispatcher(Arc::clone(&caching) as Arc<dyn Dispatcher>);

    let service = PermissionService::new(
        Arc::clone(&datastore) as Arc<dyn Datastore>,
        caching as Arc<dyn Dispatcher>,
    )
    .with_max_depth(config.dispatch.max_depth);

    let gc_shutdown = if config.datastore.gc_enabled {
        let (tx, rx) = tokio::sync::watch::channel(false);
        tokio::spawn(run_garbage_collector(
            Arc::clone(&datastore) as Arc<dyn lattice_store::GarbageCollectable>,
            gc_config(config),
            rx,
        ));
        Some(tx)
    } else {
        warn!("datastore background garbage collection disabled");
        None
    };

    Ok(ServerHandle { datastore, service, gc_shutdown })
}

pub fn gc_config(config: &Config) -> GcConfig {
    GcConfig {
        interval: Duration::from_secs(config.datastore.gc_interval_secs),
        window: Duration::from_secs(config.datastore.gc_window_secs),
        timeout: Duration::from_secs(config.datastore.gc_timeout_secs),
        batch_delete_size: config.datastore.gc_batch_delete_size,
    }
}

#[cfg(test)]
mod tests {
    use lattice_core::service::CheckPermissionRequest;
    use lattice_core::Consistency;
    use lattice_dispatch::Membership;
    use lattice_types::{
        AllowedSubject, ObjectAndRelation, ObjectDefinition, ObjectRef, Relation, Relationship,
        RelationshipUpdate, SchemaDefinition,
    };

    use super::*;

    #[tokio::test]
    async fn built_server_answers_checks() {
        let handle = build(&Config::default()).await.unwrap();

        let schema = SchemaDefinition::new(vec![
            ObjectDefinition::new("user", vec![]),
            ObjectDefinition::new(
                "note",
                vec![Relation::direct("owner", vec![AllowedSubject::direct("user")])],
            ),
        ]);
        handle.service.write_schema(schema).await.unwrap();
        handle
            .service
            .write_relationships(vec![RelationshipUpdate::create(Relationship::new(
                "note", "todo", "owner", "user", "me",
            ))])
            .await
            .unwrap();

        let resp = handle
            .service
            .check_permission(CheckPermissionRequest {
                consistency: Consistency::FullyConsistent,
                resource: ObjectRef::new("note", "todo"),
                permission: "owner".to_string(),
                subject: ObjectAndRelation::ellipsis("user", "me"),
                context: serde_json::Map::new(),
            })
            .await
            .unwrap();
        assert_eq!(resp.membership, Membership::Member);

        handle.shutdown();
    }
}
