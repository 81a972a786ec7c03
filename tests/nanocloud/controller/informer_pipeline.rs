use std::sync::Arc;
use std::time::Duration;

use nanocloud_controller::nanocloud::config::ControllerSettings;
use nanocloud_controller::nanocloud::controller::replicaset::ReplicaSetController;
use nanocloud_controller::nanocloud::controller::watch::{ListWatch, WatchEvent};
use nanocloud_controller::nanocloud::k8s::event::MemoryEventRecorder;
use nanocloud_controller::nanocloud::k8s::pod::Pod;
use nanocloud_controller::nanocloud::k8s::replicaset::ReplicaSet;
use nanocloud_controller::nanocloud::test_support::{
    pod, replica_set, FakeListWatch, FakePodControl, FakeStatusSink,
};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

struct Pipeline {
    controller: Arc<ReplicaSetController>,
    pod_control: Arc<FakePodControl>,
    status: Arc<FakeStatusSink>,
    rs_feed: Arc<FakeListWatch<ReplicaSet>>,
    pod_feed: Arc<FakeListWatch<Pod>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

fn settings() -> ControllerSettings {
    ControllerSettings {
        workers: 4,
        pod_store_sync_poll: Duration::from_millis(10),
        ..Default::default()
    }
}

/// Starts a controller whose backend echoes every create and delete back
/// through the pod feed. ReplicaSets arrive as watch events once both
/// watches are open so that no echoed pod event is emitted into the void.
async fn start(settings: ControllerSettings, sets: Vec<ReplicaSet>, pods: Vec<Pod>) -> Pipeline {
    let pod_control = Arc::new(FakePodControl::new());
    let status = Arc::new(FakeStatusSink::new());
    let controller = Arc::new(ReplicaSetController::new(
        settings.clone(),
        pod_control.clone(),
        status.clone(),
        Arc::new(MemoryEventRecorder::new()),
    ));
    let rs_feed = Arc::new(FakeListWatch::new(Vec::new()));
    let pod_feed = Arc::new(FakeListWatch::new(pods));

    let echo = pod_feed.clone();
    pod_control.on_create(move |pod| echo.emit(WatchEvent::Added(pod)));
    let echo = pod_feed.clone();
    let cache = controller.pods().clone();
    pod_control.on_delete(move |namespace, name| {
        if let Some(pod) = cache.get_by_key(&format!("{namespace}/{name}")) {
            echo.emit(WatchEvent::Deleted {
                object: pod,
                final_state_unknown: false,
            });
        }
    });

    let cancel = CancellationToken::new();
    let rs_source: Arc<dyn ListWatch<ReplicaSet>> = rs_feed.clone();
    let pod_source: Arc<dyn ListWatch<Pod>> = pod_feed.clone();
    let task = tokio::spawn(controller.clone().run(
        rs_source,
        pod_source,
        settings.workers,
        cancel.clone(),
    ));

    timeout(Duration::from_secs(5), async {
        rs_feed.wait_for_watchers(1).await;
        pod_feed.wait_for_watchers(1).await;
    })
    .await
    .expect("informers started");
    for rs in sets {
        rs_feed.emit(WatchEvent::Added(rs));
    }

    Pipeline {
        controller,
        pod_control,
        status,
        rs_feed,
        pod_feed,
        cancel,
        task,
    }
}

impl Pipeline {
    async fn wait_for_replicas(&self, key: &str, replicas: u32) {
        timeout(Duration::from_secs(5), async {
            loop {
                if self.status.last_for(key).map(|s| s.replicas) == Some(replicas) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{key} never reported {replicas} replicas"));
    }

    async fn stop(self) {
        self.cancel.cancel();
        timeout(Duration::from_secs(5), self.task)
            .await
            .expect("controller shut down")
            .expect("controller task");
        assert!(self.controller.queue().is_shutting_down());
    }
}

#[tokio::test]
async fn controller_converges_through_watch_events() {
    let p = start(
        settings(),
        vec![replica_set("default", "web", 3, "web")],
        Vec::new(),
    )
    .await;

    p.wait_for_replicas("default/web", 3).await;
    assert_eq!(p.pod_control.create_count(), 3);
    assert_eq!(p.controller.pods().len(), 3);
    assert!(p
        .controller
        .expectations()
        .satisfied_expectations("default/web"));
    p.stop().await;
}

#[tokio::test]
async fn scaling_down_through_a_modified_event() {
    let pods = (0..4)
        .map(|i| pod("default", &format!("web-{i}"), "web", i))
        .collect();
    let p = start(
        settings(),
        vec![replica_set("default", "web", 4, "web")],
        pods,
    )
    .await;
    p.wait_for_replicas("default/web", 4).await;
    assert_eq!(p.pod_control.create_count(), 0);

    let mut scaled = replica_set("default", "web", 1, "web");
    scaled.metadata.generation = 2;
    p.rs_feed.emit(WatchEvent::Modified(scaled));

    p.wait_for_replicas("default/web", 1).await;
    let mut deleted = p.pod_control.deleted();
    deleted.sort();
    assert_eq!(
        deleted,
        vec!["default/web-1", "default/web-2", "default/web-3"],
        "newest pods go first"
    );
    p.stop().await;
}

#[tokio::test]
async fn relabelled_pod_joins_the_selecting_replica_set() {
    let p = start(
        settings(),
        vec![replica_set("default", "api", 1, "api")],
        vec![pod("default", "stray", "web", 0)],
    )
    .await;
    p.wait_for_replicas("default/api", 1).await;
    assert_eq!(p.pod_control.create_count(), 1);

    // A pod switching its label into the selector makes the set overfull.
    let mut relabelled = pod("default", "stray", "api", 0);
    relabelled.metadata.resource_version = Some("7".to_string());
    p.pod_feed.emit(WatchEvent::Modified(relabelled));

    timeout(Duration::from_secs(5), async {
        while p.pod_control.delete_count() < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("extra pod deleted");
    p.stop().await;
}

#[tokio::test]
async fn one_replica_set_is_never_synced_concurrently() {
    let settings = ControllerSettings {
        workers: 8,
        burst_replicas: 2,
        pod_store_sync_poll: Duration::from_millis(10),
        ..Default::default()
    };
    let p = start(
        settings,
        vec![replica_set("default", "web", 12, "web")],
        Vec::new(),
    )
    .await;
    p.pod_control.set_delay(Duration::from_millis(5));

    for _ in 0..50 {
        p.controller.queue().add("default/web".to_string());
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    p.wait_for_replicas("default/web", 12).await;
    assert_eq!(p.pod_control.create_count(), 12);
    assert!(
        p.pod_control.max_in_flight_per_owner() <= 2,
        "cycles for one key overlapped"
    );
    p.stop().await;
}

#[tokio::test]
async fn expired_pod_watch_relists_and_recovers() {
    let p = start(
        settings(),
        vec![replica_set("default", "web", 2, "web")],
        Vec::new(),
    )
    .await;
    p.wait_for_replicas("default/web", 2).await;

    // The relist no longer contains one of the pods; its tombstone makes
    // the controller create a replacement.
    let survivors: Vec<Pod> = p.controller.pods().list_all().into_iter().take(1).collect();
    p.pod_feed.set_items(survivors);
    p.pod_feed.expire();

    timeout(Duration::from_secs(5), p.pod_feed.wait_for_watchers(2))
        .await
        .expect("pod watch reopened");
    timeout(Duration::from_secs(5), async {
        while p.pod_control.create_count() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("replacement pod created");
    assert_eq!(p.pod_feed.list_calls(), 2);
    p.stop().await;
}
