use std::sync::Arc;

use nanocloud_controller::nanocloud::config::ControllerSettings;
use nanocloud_controller::nanocloud::controller::reconcile::{ReconcileOutcome, Reconciler};
use nanocloud_controller::nanocloud::controller::replicaset::ReplicaSetController;
use nanocloud_controller::nanocloud::controller::watch::EventSink;
use nanocloud_controller::nanocloud::k8s::event::MemoryEventRecorder;
use nanocloud_controller::nanocloud::k8s::pod::Pod;
use nanocloud_controller::nanocloud::test_support::{
    pod, replica_set, with_status, FakePodControl, FakeStatusSink,
};

const KEY: &str = "default/web";

struct Harness {
    controller: Arc<ReplicaSetController>,
    pod_control: Arc<FakePodControl>,
    status: Arc<FakeStatusSink>,
    recorder: Arc<MemoryEventRecorder>,
}

impl Harness {
    fn new(settings: ControllerSettings, replicas: u32, pods: Vec<Pod>) -> Self {
        let pod_control = Arc::new(FakePodControl::new());
        let status = Arc::new(FakeStatusSink::new());
        let recorder = Arc::new(MemoryEventRecorder::new());
        let controller = Arc::new(ReplicaSetController::new(
            settings,
            pod_control.clone(),
            status.clone(),
            recorder.clone(),
        ));
        controller
            .replica_sets()
            .upsert(replica_set("default", "web", replicas, "web"))
            .expect("replicaset key");
        controller.pods().replace(pods);
        Self {
            controller,
            pod_control,
            status,
            recorder,
        }
    }

    /// Delivers the created pods back to the controller the way its pod
    /// informer would.
    fn observe_created(&self, from: usize) {
        for request in self.pod_control.created().into_iter().skip(from) {
            let pod = request.to_pod();
            self.controller.pods().upsert(pod.clone()).expect("pod key");
            EventSink::<Pod>::on_add(self.controller.as_ref(), &pod);
        }
    }

    fn observe_deleted(&self, from: usize) {
        for key in self.pod_control.deleted().into_iter().skip(from) {
            if let Some(pod) = self.controller.pods().remove(&key) {
                EventSink::<Pod>::on_delete(self.controller.as_ref(), &pod, false);
            }
        }
    }

    fn expectations(&self) -> (i64, i64) {
        let record = self
            .controller
            .expectations()
            .get_expectations(KEY)
            .expect("expectations record");
        (record.adds(), record.dels())
    }
}

#[tokio::test]
async fn scale_up_from_zero_creates_and_waits_for_observation() {
    let h = Harness::new(ControllerSettings::default(), 3, Vec::new());

    let outcome = h.controller.reconcile(KEY).await.expect("first sync");
    assert_eq!(outcome, ReconcileOutcome::Synced);
    assert_eq!(h.pod_control.create_count(), 3);
    assert_eq!(h.expectations(), (3, 0));
    // Observed and stored counts are both zero, so nothing is written.
    assert!(h.status.last_for(KEY).is_none());

    // Nothing observed yet: a second cycle must not act again.
    h.controller.reconcile(KEY).await.expect("second sync");
    assert_eq!(h.pod_control.create_count(), 3);

    h.observe_created(0);
    assert!(h.controller.expectations().satisfied_expectations(KEY));

    h.controller.reconcile(KEY).await.expect("third sync");
    assert_eq!(h.pod_control.create_count(), 3);
    assert_eq!(h.status.last_for(KEY).map(|s| s.replicas), Some(3));

    let created = h.pod_control.created();
    assert!(created
        .iter()
        .all(|request| request.name.starts_with("web-") && request.owner.name == "web"));
    let reasons = h.recorder.reasons();
    assert_eq!(
        reasons.iter().filter(|r| r.as_str() == "SuccessfulCreate").count(),
        3
    );
}

#[tokio::test]
async fn scale_down_deletes_not_ready_pods_first() {
    let pods = vec![
        with_status(pod("default", "ready", "web", 0), "Running", true),
        with_status(pod("default", "slow-a", "web", 10), "Running", false),
        with_status(pod("default", "slow-b", "web", 20), "Running", false),
    ];
    let h = Harness::new(ControllerSettings::default(), 1, pods);

    h.controller.reconcile(KEY).await.expect("sync");

    let mut deleted = h.pod_control.deleted();
    deleted.sort();
    assert_eq!(deleted, vec!["default/slow-a", "default/slow-b"]);
    assert_eq!(h.expectations(), (0, 2));

    h.observe_deleted(0);
    assert!(h.controller.expectations().satisfied_expectations(KEY));
    h.controller.reconcile(KEY).await.expect("sync");
    assert_eq!(h.pod_control.delete_count(), 2);
    assert_eq!(h.status.last_for(KEY).map(|s| s.replicas), Some(1));
}

#[tokio::test]
async fn terminal_and_terminating_pods_are_not_counted() {
    let mut terminating = pod("default", "leaving", "web", 0);
    terminating.metadata.deletion_timestamp = Some(chrono::Utc::now());
    let pods = vec![
        with_status(pod("default", "done", "web", 0), "Succeeded", false),
        with_status(pod("default", "crashed", "web", 0), "Failed", false),
        terminating,
        pod("default", "other-app", "api", 0),
    ];
    let h = Harness::new(ControllerSettings::default(), 2, pods);

    h.controller.reconcile(KEY).await.expect("sync");
    assert_eq!(h.pod_control.create_count(), 2);
    assert_eq!(h.pod_control.delete_count(), 0);
}

#[tokio::test]
async fn burst_limit_spreads_large_scale_ups_across_cycles() {
    let settings = ControllerSettings {
        burst_replicas: 500,
        ..Default::default()
    };
    let h = Harness::new(settings, 1000, Vec::new());

    h.controller.reconcile(KEY).await.expect("first sync");
    assert_eq!(h.pod_control.create_count(), 500);
    assert_eq!(h.expectations(), (500, 0));

    h.observe_created(0);
    h.controller.reconcile(KEY).await.expect("second sync");
    assert_eq!(h.pod_control.create_count(), 1000);
    assert_eq!(h.expectations(), (500, 0));

    h.observe_created(500);
    h.controller.reconcile(KEY).await.expect("final sync");
    assert_eq!(h.pod_control.create_count(), 1000);
    assert_eq!(h.status.last_for(KEY).map(|s| s.replicas), Some(1000));
}

#[tokio::test]
async fn failed_creations_are_compensated() {
    let h = Harness::new(ControllerSettings::default(), 3, Vec::new());
    h.pod_control.fail_next_creates(2);

    h.controller.reconcile(KEY).await.expect("sync");
    assert_eq!(h.pod_control.create_count(), 1);
    assert_eq!(h.expectations(), (1, 0));
    assert_eq!(
        h.recorder
            .reasons()
            .iter()
            .filter(|r| r.as_str() == "FailedCreate")
            .count(),
        2
    );

    h.observe_created(0);
    assert_eq!(h.expectations(), (0, 0));

    h.controller.reconcile(KEY).await.expect("retry sync");
    assert_eq!(h.pod_control.create_count(), 3);
}

#[tokio::test]
async fn failed_deletions_are_compensated() {
    let pods = (0..3)
        .map(|i| pod("default", &format!("web-{i}"), "web", i))
        .collect();
    let h = Harness::new(ControllerSettings::default(), 0, pods);
    h.pod_control.fail_next_deletes(3);

    h.controller.reconcile(KEY).await.expect("sync");
    assert_eq!(h.pod_control.delete_count(), 0);
    assert_eq!(h.expectations(), (0, 0));
    assert!(h.controller.expectations().satisfied_expectations(KEY));
}
