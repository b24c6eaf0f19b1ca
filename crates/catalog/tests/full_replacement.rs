#![forbid(unsafe_code)]

use std::sync::Arc;

use meshsync_catalog::{CatalogSyncer, SyncReport, Syncer};
use meshsync_core::{MeshRegistration, SyncSet, WorkKey};
use meshsync_mesh::{MemoryMesh, MeshCall, MeshOp};

fn web(id: &str) -> MeshRegistration { MeshRegistration::new("node-1", "web", id) }

fn set(regs: impl IntoIterator<Item = MeshRegistration>) -> SyncSet { regs.into_iter().collect() }

#[tokio::test]
async fn repeating_a_sync_issues_no_calls() {
    let mesh = Arc::new(MemoryMesh::new());
    let syncer = CatalogSyncer::new(mesh.clone());
    let desired = set([web("web-1"), web("web-2")]);

    let first = syncer.sync(desired.clone()).await.unwrap();
    assert_eq!(first.registered, 2);
    let writes = mesh.catalog_writes();

    let second = syncer.sync(desired).await.unwrap();
    assert!(second.is_noop());
    assert_eq!(second.unchanged, 2);
    assert_eq!(mesh.catalog_writes(), writes);
}

#[tokio::test]
async fn growing_the_set_registers_only_the_newcomer() {
    let mesh = Arc::new(MemoryMesh::new());
    let syncer = CatalogSyncer::new(mesh.clone());
    syncer.sync(set([web("web-1")])).await.unwrap();
    mesh.clear_calls();

    let report = syncer.sync(set([web("web-1"), web("web-2")])).await.unwrap();
    assert_eq!(report, SyncReport { registered: 1, deregistered: 0, unchanged: 1 });
    let calls = mesh.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0], MeshCall::Register(web("web-2").key()));
}

#[tokio::test]
async fn shrinking_the_set_deregisters_the_rest() {
    let mesh = Arc::new(MemoryMesh::new());
    let syncer = CatalogSyncer::new(mesh.clone());
    syncer.sync(set([web("web-1"), web("web-2")])).await.unwrap();

    let report = syncer.sync(SyncSet::new()).await.unwrap();
    assert_eq!(report.deregistered, 2);
    assert!(mesh.registrations().is_empty());
    assert!(syncer.registrations().is_empty());
}

#[tokio::test]
async fn evicting_a_workload_removes_only_its_registrations() {
    let mesh = Arc::new(MemoryMesh::new());
    let syncer = CatalogSyncer::new(mesh.clone());
    let a = MeshRegistration::for_workload(&WorkKey::new("ns1", "pod-a"), "node-1", "web", "web-a");
    let b = MeshRegistration::for_workload(&WorkKey::new("ns1", "pod-b"), "node-1", "web", "web-b");
    syncer.sync(set([a, b.clone()])).await.unwrap();

    let report = syncer.evict_workload(&WorkKey::new("ns1", "pod-a")).await.unwrap();
    assert_eq!(report.deregistered, 1);
    assert_eq!(mesh.registrations(), vec![b]);

    mesh.clear_calls();
    let again = syncer.evict_workload(&WorkKey::new("ns1", "pod-a")).await.unwrap();
    assert!(again.is_noop());
    assert_eq!(mesh.count(MeshOp::Deregister), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_syncs_never_double_register() {
    let mesh = Arc::new(MemoryMesh::new());
    let syncer = Arc::new(CatalogSyncer::new(mesh.clone()));
    let desired = set([web("web-1"), web("web-2"), web("web-3")]);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let (syncer, desired) = (syncer.clone(), desired.clone());
        tasks.push(tokio::spawn(async move { syncer.sync(desired).await }));
    }
    for t in tasks {
        t.await.unwrap().unwrap();
    }
    assert_eq!(mesh.count(MeshOp::Register), 3);
}
