use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nanocloud_controller::nanocloud::k8s::event::MemoryEventRecorder;
use nanocloud_controller::nanocloud::k8s::pod::{ObjectMeta, Pod, PodSpec};
use nanocloud_controller::nanocloud::kubelet::container::{
    CachedRuntime, RunningContainer, RunningPod,
};
use nanocloud_controller::nanocloud::kubelet::pod_workers::PodWorkers;
use nanocloud_controller::nanocloud::test_support::{FakeRuntime, GatedPodSyncer};
use tokio::time::timeout;

fn pod(uid: &str, version: &str) -> Pod {
    let mut metadata = ObjectMeta::named(Some("default"), &format!("pod-{uid}"));
    metadata.uid = Some(uid.to_string());
    metadata.resource_version = Some(version.to_string());
    Pod::new(metadata, PodSpec::default())
}

fn running(uid: &str) -> RunningPod {
    RunningPod {
        uid: uid.to_string(),
        name: format!("pod-{uid}"),
        namespace: "default".to_string(),
        containers: vec![RunningContainer {
            id: format!("ctr-{uid}"),
            name: "app".to_string(),
            image: "registry.local/app:1".to_string(),
            created: None,
        }],
    }
}

struct Kubelet {
    workers: PodWorkers,
    syncer: Arc<GatedPodSyncer>,
    runtime: Arc<FakeRuntime>,
    recorder: Arc<MemoryEventRecorder>,
}

/// Workers over a runtime cache whose period never lapses during a test, so
/// every refresh comes from the freshness floor.
fn kubelet(syncer: GatedPodSyncer) -> Kubelet {
    let syncer = Arc::new(syncer);
    let runtime = Arc::new(FakeRuntime::new(Vec::new()));
    let cache = Arc::new(CachedRuntime::new(runtime.clone(), Duration::from_secs(3600)));
    let recorder = Arc::new(MemoryEventRecorder::new());
    Kubelet {
        workers: PodWorkers::new(syncer.clone(), cache, recorder.clone()),
        syncer,
        runtime,
        recorder,
    }
}

async fn wait_idle(workers: &PodWorkers, uid: &str) {
    timeout(Duration::from_secs(5), async {
        while workers.is_working(uid) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("worker went idle");
}

#[tokio::test]
async fn burst_of_updates_runs_first_and_latest_only() {
    let k = kubelet(GatedPodSyncer::gated());
    let completed = Arc::new(AtomicUsize::new(0));

    for version in ["0", "1", "2", "3"] {
        let completed = completed.clone();
        k.workers.update_pod(
            pod("p1", version),
            Some(Box::new(move || {
                completed.fetch_add(1, Ordering::SeqCst);
            })),
        );
        if version == "0" {
            timeout(Duration::from_secs(5), k.syncer.wait_started(1))
                .await
                .expect("first sync started");
        }
    }
    assert!(k.workers.has_pending_update("p1"));

    k.syncer.release(2);
    wait_idle(&k.workers, "p1").await;

    assert_eq!(k.syncer.synced_versions("p1"), vec!["0", "3"]);
    // Callbacks of superseded updates are dropped with them.
    assert_eq!(completed.load(Ordering::SeqCst), 2);
    assert!(!k.workers.has_pending_update("p1"));
}

#[tokio::test]
async fn later_syncs_see_runtime_state_newer_than_the_previous_sync() {
    let k = kubelet(GatedPodSyncer::open());

    k.workers.update_pod(pod("p1", "1"), None);
    wait_idle(&k.workers, "p1").await;
    assert_eq!(k.runtime.calls(), 1);

    // The container came up after the first sync; the cached snapshot predates
    // it and must be refreshed before the next sync runs.
    k.runtime.set_pods(vec![running("p1")]);
    k.workers.update_pod(pod("p1", "2"), None);
    wait_idle(&k.workers, "p1").await;

    assert_eq!(k.runtime.calls(), 2);
    assert_eq!(k.syncer.saw_running("p1"), vec![false, true]);
}

#[tokio::test]
async fn runtime_failure_is_reported_and_the_worker_keeps_serving() {
    let k = kubelet(GatedPodSyncer::open());
    k.runtime.fail_next(1);

    let completed = Arc::new(AtomicUsize::new(0));
    let counter = completed.clone();
    k.workers.update_pod(
        pod("p1", "1"),
        Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })),
    );
    wait_idle(&k.workers, "p1").await;
    assert_eq!(k.recorder.reasons(), vec!["FailedSync"]);
    assert!(k.syncer.synced_versions("p1").is_empty());
    assert_eq!(completed.load(Ordering::SeqCst), 0);

    let counter = completed.clone();
    k.workers.update_pod(
        pod("p1", "2"),
        Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })),
    );
    wait_idle(&k.workers, "p1").await;
    assert_eq!(k.syncer.synced_versions("p1"), vec!["2"]);
    assert_eq!(completed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn forgotten_pods_restart_with_a_fresh_worker() {
    let k = kubelet(GatedPodSyncer::open());
    k.workers.update_pod(pod("p1", "1"), None);
    k.workers.update_pod(pod("p2", "1"), None);
    wait_idle(&k.workers, "p1").await;
    wait_idle(&k.workers, "p2").await;
    assert_eq!(k.workers.tracked_workers(), 2);

    let desired = ["p2".to_string()].into_iter().collect();
    k.workers.forget_non_existing_workers(&desired);
    assert_eq!(k.workers.tracked_workers(), 1);

    k.workers.update_pod(pod("p1", "2"), None);
    wait_idle(&k.workers, "p1").await;
    assert_eq!(k.workers.tracked_workers(), 2);
    assert_eq!(k.syncer.synced_versions("p1"), vec!["1", "2"]);
}
