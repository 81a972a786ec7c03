/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! ReplicaSet controller: keeps the number of active pods matching a
//! ReplicaSet's selector equal to its replica count.

use crate::nanocloud::config::ControllerSettings;
use crate::nanocloud::controller::cache::WatchCache;
use crate::nanocloud::controller::expectations::ExpectationsLedger;
use crate::nanocloud::controller::pod_control::{
    owner_reference, PodControl, PodCreateRequest, ReplicaSetStatusSink, StatusError,
};
use crate::nanocloud::controller::reconcile::{ReconcileData, ReconcileOutcome, Reconciler};
use crate::nanocloud::controller::runtime::ControllerRuntime;
use crate::nanocloud::controller::watch::{EventSink, Informer, ListWatch};
use crate::nanocloud::controller::workqueue::WorkQueue;
use crate::nanocloud::k8s::event::{EventRecorder, EventType, ObjectReference};
use crate::nanocloud::k8s::pod::Pod;
use crate::nanocloud::k8s::replicaset::{ReplicaSet, ReplicaSetStatus};
use crate::nanocloud::k8s::selector::{Selector, SelectorError};
use crate::nanocloud::k8s::store::{
    meta_key, normalize_namespace, split_key, KeyError, ObjectKey,
};
use crate::nanocloud::logger::{log_debug, log_error, log_info, log_warn};
use crate::nanocloud::observability::metrics::{self, OperationResult, ReplicaOperation};
use futures_util::future::{join_all, BoxFuture};
use rand::Rng;
use std::cmp::Ordering;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub const CONTROLLER_NAME: &str = "replicaset-controller";
const QUEUE_NAME: &str = "replicaset";
const STATUS_UPDATE_RETRIES: usize = 1;
const POD_NAME_SUFFIX_LEN: usize = 5;
const POD_NAME_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

/// Children observed for one ReplicaSet during the fetch phase.
#[derive(Debug, Clone)]
pub enum ObservedReplicas {
    /// The pod cache has not completed its first list.
    PodCacheNotSynced,
    Pods {
        active: Vec<Pod>,
        expectations_satisfied: bool,
    },
}

/// What one sync cycle will do to the ReplicaSet's pods.
#[derive(Debug, Clone, PartialEq)]
pub enum ScaleAction {
    AwaitPodCache,
    /// Earlier creations or deletions have not been observed yet.
    AwaitExpectations,
    InSync,
    Create(usize),
    /// Pods to delete, least useful first.
    Delete(Vec<Pod>),
}

#[derive(Debug, Clone)]
pub struct ReplicaSetPlan {
    pub replica_set: ReplicaSet,
    pub action: ScaleAction,
    pub observed_replicas: u32,
}

pub struct ReplicaSetController {
    replica_sets: WatchCache<ReplicaSet>,
    pods: WatchCache<Pod>,
    expectations: ExpectationsLedger,
    queue: WorkQueue<ObjectKey>,
    pod_control: Arc<dyn PodControl>,
    status_sink: Arc<dyn ReplicaSetStatusSink>,
    recorder: Arc<dyn EventRecorder>,
    settings: ControllerSettings,
}

impl ReplicaSetController {
    pub fn new(
        settings: ControllerSettings,
        pod_control: Arc<dyn PodControl>,
        status_sink: Arc<dyn ReplicaSetStatusSink>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Self {
        Self {
            replica_sets: WatchCache::new(),
            pods: WatchCache::new(),
            expectations: ExpectationsLedger::new(settings.expectations_timeout),
            queue: WorkQueue::new(QUEUE_NAME),
            pod_control,
            status_sink,
            recorder,
            settings,
        }
    }

    pub fn replica_sets(&self) -> &WatchCache<ReplicaSet> {
        &self.replica_sets
    }

    pub fn pods(&self) -> &WatchCache<Pod> {
        &self.pods
    }

    pub fn expectations(&self) -> &ExpectationsLedger {
        &self.expectations
    }

    pub fn queue(&self) -> &WorkQueue<ObjectKey> {
        &self.queue
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn enqueue(&self, rs: &ReplicaSet) {
        match meta_key(&rs.metadata) {
            Ok(key) => self.queue.add(key),
            Err(err) => log_warn(
                CONTROLLER_NAME,
                "Cannot enqueue ReplicaSet",
                &[("error", &err.to_string())],
            ),
        }
    }

    /// Re-enqueues every cached ReplicaSet.
    pub fn resync_all(&self) {
        for key in self.replica_sets.keys() {
            self.queue.add(key);
        }
    }

    /// The ReplicaSet whose selector matches the pod. Overlapping selectors are
    /// resolved by oldest creation timestamp, then by name.
    pub fn get_pod_replica_set(&self, pod: &Pod) -> Option<ReplicaSet> {
        if pod.metadata.labels.is_empty() {
            log_debug(
                CONTROLLER_NAME,
                "Pod has no labels; no ReplicaSet can select it",
                &[("pod", pod.metadata.name_or_empty())],
            );
            return None;
        }
        let namespace = normalize_namespace(pod.metadata.namespace.as_deref());
        let mut candidates: Vec<ReplicaSet> = self
            .replica_sets
            .list_namespace(&namespace, &Selector::everything())
            .into_iter()
            .filter(|rs| {
                rs.spec
                    .selector
                    .to_selector()
                    .map(|selector| selector.matches(&pod.metadata.labels))
                    .unwrap_or(false)
            })
            .collect();

        if candidates.len() > 1 {
            candidates.sort_by(|a, b| {
                a.metadata
                    .creation_timestamp
                    .cmp(&b.metadata.creation_timestamp)
                    .then_with(|| a.metadata.name.cmp(&b.metadata.name))
            });
            log_warn(
                CONTROLLER_NAME,
                "More than one ReplicaSet selects pod; using the oldest",
                &[
                    ("namespace", &namespace),
                    ("pod", pod.metadata.name_or_empty()),
                    ("replicaset", candidates[0].metadata.name_or_empty()),
                    ("candidates", &candidates.len().to_string()),
                ],
            );
        }
        candidates.into_iter().next()
    }

    fn owner_key(&self, pod: &Pod) -> Option<ObjectKey> {
        let rs = self.get_pod_replica_set(pod)?;
        meta_key(&rs.metadata).ok()
    }

    fn add_pod(&self, pod: &Pod) {
        if pod.is_terminating() {
            // A restarted informer can list pods that are already being deleted.
            self.delete_pod(pod, false);
            return;
        }
        if let Some(key) = self.owner_key(pod) {
            self.expectations.creation_observed(&key);
            self.queue.add(key);
        }
    }

    fn update_pod(&self, old: &Pod, new: &Pod) {
        if old == new {
            return;
        }
        if new.is_terminating() {
            // The deletion is handled by the current owner only.
            self.delete_pod(new, false);
            return;
        }
        if let Some(key) = self.owner_key(new) {
            self.queue.add(key);
        }
        if old.metadata.labels != new.metadata.labels {
            if let Some(key) = self.owner_key(old) {
                self.queue.add(key);
            }
        }
    }

    fn delete_pod(&self, pod: &Pod, final_state_unknown: bool) {
        let Some(key) = self.owner_key(pod) else {
            return;
        };
        if final_state_unknown {
            log_debug(
                CONTROLLER_NAME,
                "Pod deletion inferred from relist",
                &[("pod", pod.metadata.name_or_empty()), ("replicaset", &key)],
            );
        }
        self.expectations.deletion_observed(&key);
        self.queue.add(key);
    }

    async fn create_replicas(&self, key: &str, rs: &ReplicaSet, count: usize) {
        self.expectations.expect_creations(key, count);
        log_info(
            CONTROLLER_NAME,
            "Too few replicas; creating",
            &[
                ("replicaset", key),
                ("want", &rs.spec.replicas.to_string()),
                ("creating", &count.to_string()),
            ],
        );

        let base = rs.metadata.name_or_empty();
        let creations = (0..count).map(|_| {
            let request = PodCreateRequest::for_replica_set(rs, generate_pod_name(base));
            async move {
                let name = request.name.clone();
                (name, self.pod_control.create_pod(request).await)
            }
        });

        let reference = ObjectReference::for_replicaset(rs);
        for (name, result) in join_all(creations).await {
            match result {
                Ok(()) => {
                    metrics::record_replica_operation(
                        CONTROLLER_NAME,
                        ReplicaOperation::Create,
                        OperationResult::Success,
                    );
                    self.recorder.record(
                        &reference,
                        EventType::Normal,
                        "SuccessfulCreate",
                        &format!("Created pod: {name}"),
                    );
                }
                Err(err) => {
                    self.expectations.creation_observed(key);
                    metrics::record_replica_operation(
                        CONTROLLER_NAME,
                        ReplicaOperation::Create,
                        OperationResult::Failed,
                    );
                    log_warn(
                        CONTROLLER_NAME,
                        "Failed to create pod",
                        &[
                            ("replicaset", key),
                            ("pod", &name),
                            ("error", &err.to_string()),
                        ],
                    );
                    self.recorder.record(
                        &reference,
                        EventType::Warning,
                        "FailedCreate",
                        &format!("Error creating: {err}"),
                    );
                }
            }
        }
    }

    async fn delete_replicas(&self, key: &str, rs: &ReplicaSet, victims: Vec<Pod>) {
        self.expectations.expect_deletions(key, victims.len());
        log_info(
            CONTROLLER_NAME,
            "Too many replicas; deleting",
            &[
                ("replicaset", key),
                ("want", &rs.spec.replicas.to_string()),
                ("deleting", &victims.len().to_string()),
            ],
        );

        let owner = owner_reference(rs);
        let owner = &owner;
        let deletions = victims.iter().map(|pod| {
            let namespace = normalize_namespace(pod.metadata.namespace.as_deref());
            let name = pod.metadata.name_or_empty().to_string();
            async move {
                let result = self.pod_control.delete_pod(&namespace, &name, owner).await;
                (name, result)
            }
        });

        let reference = ObjectReference::for_replicaset(rs);
        for (name, result) in join_all(deletions).await {
            match result {
                Ok(()) => {
                    metrics::record_replica_operation(
                        CONTROLLER_NAME,
                        ReplicaOperation::Delete,
                        OperationResult::Success,
                    );
                    self.recorder.record(
                        &reference,
                        EventType::Normal,
                        "SuccessfulDelete",
                        &format!("Deleted pod: {name}"),
                    );
                }
                Err(err) => {
                    self.expectations.deletion_observed(key);
                    metrics::record_replica_operation(
                        CONTROLLER_NAME,
                        ReplicaOperation::Delete,
                        OperationResult::Failed,
                    );
                    log_warn(
                        CONTROLLER_NAME,
                        "Failed to delete pod",
                        &[
                            ("replicaset", key),
                            ("pod", &name),
                            ("error", &err.to_string()),
                        ],
                    );
                    self.recorder.record(
                        &reference,
                        EventType::Warning,
                        "FailedDelete",
                        &format!("Error deleting: {err}"),
                    );
                }
            }
        }
    }

    /// Writes the observed replica count back unless the stored status is
    /// already current.
    async fn update_replica_count(
        &self,
        key: &str,
        rs: &ReplicaSet,
        observed_replicas: u32,
    ) -> Result<(), StatusError> {
        if rs.status.replicas == observed_replicas
            && rs.status.observed_generation >= rs.metadata.generation
        {
            return Ok(());
        }
        let status = ReplicaSetStatus {
            replicas: observed_replicas,
            observed_generation: rs.metadata.generation,
        };

        let mut attempt = 0;
        loop {
            match self.status_sink.update_status(key, &status).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < STATUS_UPDATE_RETRIES => {
                    attempt += 1;
                    log_debug(
                        CONTROLLER_NAME,
                        "Retrying status update",
                        &[("replicaset", key), ("error", &err.to_string())],
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Starts both informers, the periodic resync and `workers` queue
    /// workers, then waits for `cancel` and shuts everything down.
    pub async fn run(
        self: Arc<Self>,
        replica_set_feed: Arc<dyn ListWatch<ReplicaSet>>,
        pod_feed: Arc<dyn ListWatch<Pod>>,
        workers: usize,
        cancel: CancellationToken,
    ) {
        self.settings.apply_logging();
        let rs_sink: Arc<dyn EventSink<ReplicaSet>> = self.clone();
        let pod_sink: Arc<dyn EventSink<Pod>> = self.clone();
        let rs_informer = Informer::new(
            "replicasets",
            self.replica_sets.clone(),
            replica_set_feed,
            rs_sink,
        );
        let pod_informer = Informer::new("pods", self.pods.clone(), pod_feed, pod_sink);

        log_info(
            CONTROLLER_NAME,
            "Starting ReplicaSet controller",
            &[("workers", &workers.to_string())],
        );
        let mut tasks = vec![
            tokio::spawn(rs_informer.run(cancel.child_token())),
            tokio::spawn(pod_informer.run(cancel.child_token())),
            tokio::spawn(Arc::clone(&self).resync_loop(cancel.child_token())),
        ];
        let runtime = ControllerRuntime::new(Arc::clone(&self), self.queue.clone());
        tasks.extend(runtime.spawn_workers(workers));

        cancel.cancelled().await;
        self.queue.shut_down();
        for task in tasks {
            if let Err(err) = task.await {
                log_error(
                    CONTROLLER_NAME,
                    "Controller task ended abnormally",
                    &[("error", &err.to_string())],
                );
            }
        }
        log_info(CONTROLLER_NAME, "ReplicaSet controller stopped", &[]);
    }

    async fn resync_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.resync_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => self.resync_all(),
            }
        }
    }
}

/// Decides how many pods to create, or which to delete, to move `active`
/// toward `replicas`. At most `burst` operations are planned per cycle.
pub fn plan_scale(replicas: u32, active: &[Pod], burst: usize) -> ScaleAction {
    let observed = active.len();
    let wanted = replicas as usize;
    match observed.cmp(&wanted) {
        Ordering::Equal => ScaleAction::InSync,
        Ordering::Less => ScaleAction::Create((wanted - observed).min(burst)),
        Ordering::Greater => {
            let count = (observed - wanted).min(burst);
            let mut victims = active.to_vec();
            if replicas != 0 {
                victims.sort_by(deletion_order);
            }
            victims.truncate(count);
            ScaleAction::Delete(victims)
        }
    }
}

/// Orders pods least useful first: unscheduled before scheduled, Pending
/// before Unknown before Running, not ready before ready, newer before older.
pub fn deletion_order(a: &Pod, b: &Pod) -> Ordering {
    a.is_scheduled()
        .cmp(&b.is_scheduled())
        .then_with(|| a.phase().deletion_rank().cmp(&b.phase().deletion_rank()))
        .then_with(|| a.is_ready().cmp(&b.is_ready()))
        .then_with(|| {
            b.metadata
                .creation_timestamp
                .cmp(&a.metadata.creation_timestamp)
        })
        .then_with(|| a.metadata.name.cmp(&b.metadata.name))
}

fn generate_pod_name(base: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..POD_NAME_SUFFIX_LEN)
        .map(|_| POD_NAME_ALPHABET[rng.gen_range(0..POD_NAME_ALPHABET.len())] as char)
        .collect();
    format!("{base}-{suffix}")
}

impl Reconciler for ReplicaSetController {
    type Desired = ReplicaSet;
    type Observed = ObservedReplicas;
    type Plan = ReplicaSetPlan;
    type Error = ReplicaSetError;

    fn kind(&self) -> &'static str {
        CONTROLLER_NAME
    }

    fn fetch(
        &self,
        key: &str,
    ) -> Result<Option<ReconcileData<ReplicaSet, ObservedReplicas>>, ReplicaSetError> {
        let (namespace, _) = split_key(key).map_err(ReplicaSetError::InvalidKey)?;
        let Some(rs) = self.replica_sets.get_by_key(key) else {
            return Ok(None);
        };
        if !self.pods.has_synced() {
            return Ok(Some(ReconcileData {
                desired: rs,
                observed: ObservedReplicas::PodCacheNotSynced,
            }));
        }

        // Checked before listing so a creation observed in between cannot be
        // counted twice.
        let expectations_satisfied = self.expectations.satisfied_expectations(key);
        let selector =
            rs.spec
                .selector
                .to_selector()
                .map_err(|source| ReplicaSetError::InvalidSelector {
                    key: key.to_string(),
                    source,
                })?;
        let active: Vec<Pod> = self
            .pods
            .list_namespace(&namespace, &selector)
            .into_iter()
            .filter(Pod::is_active)
            .collect();

        Ok(Some(ReconcileData {
            desired: rs,
            observed: ObservedReplicas::Pods {
                active,
                expectations_satisfied,
            },
        }))
    }

    fn diff(
        &self,
        _key: &str,
        desired: &ReplicaSet,
        observed: &ObservedReplicas,
    ) -> Result<ReplicaSetPlan, ReplicaSetError> {
        let (action, observed_replicas) = match observed {
            ObservedReplicas::PodCacheNotSynced => (ScaleAction::AwaitPodCache, 0),
            ObservedReplicas::Pods {
                active,
                expectations_satisfied,
            } => {
                let action = if *expectations_satisfied {
                    plan_scale(desired.spec.replicas, active, self.settings.burst_replicas)
                } else {
                    ScaleAction::AwaitExpectations
                };
                (action, u32::try_from(active.len()).unwrap_or(u32::MAX))
            }
        };
        Ok(ReplicaSetPlan {
            replica_set: desired.clone(),
            action,
            observed_replicas,
        })
    }

    fn apply<'a>(
        &'a self,
        key: &'a str,
        plan: ReplicaSetPlan,
    ) -> BoxFuture<'a, Result<ReconcileOutcome, ReplicaSetError>> {
        Box::pin(async move {
            let ReplicaSetPlan {
                replica_set,
                action,
                observed_replicas,
            } = plan;

            match action {
                ScaleAction::AwaitPodCache => {
                    log_debug(
                        CONTROLLER_NAME,
                        "Pod cache not synced; retrying later",
                        &[("replicaset", key)],
                    );
                    return Ok(ReconcileOutcome::RequeueAfter(
                        self.settings.pod_store_sync_poll,
                    ));
                }
                ScaleAction::AwaitExpectations | ScaleAction::InSync => {}
                ScaleAction::Create(count) => {
                    self.create_replicas(key, &replica_set, count).await
                }
                ScaleAction::Delete(victims) => {
                    self.delete_replicas(key, &replica_set, victims).await
                }
            }

            if let Err(err) = self
                .update_replica_count(key, &replica_set, observed_replicas)
                .await
            {
                log_warn(
                    CONTROLLER_NAME,
                    "Failed to update replica count; requeuing",
                    &[("replicaset", key), ("error", &err.to_string())],
                );
                return Ok(ReconcileOutcome::Requeue);
            }
            Ok(ReconcileOutcome::Synced)
        })
    }

    fn on_missing(&self, key: &str) {
        log_debug(
            CONTROLLER_NAME,
            "ReplicaSet has been deleted",
            &[("replicaset", key)],
        );
        self.expectations.delete_expectations(key);
    }

    fn requeue_on_error(&self, error: &ReplicaSetError) -> bool {
        !matches!(
            error,
            ReplicaSetError::InvalidKey(_) | ReplicaSetError::InvalidSelector { .. }
        )
    }
}

impl EventSink<ReplicaSet> for ReplicaSetController {
    fn on_add(&self, rs: &ReplicaSet) {
        self.enqueue(rs);
    }

    fn on_update(&self, old: &ReplicaSet, new: &ReplicaSet) {
        if old.status.replicas != new.status.replicas {
            log_debug(
                CONTROLLER_NAME,
                "Observed updated replica count",
                &[
                    ("replicaset", new.metadata.name_or_empty()),
                    ("old", &old.status.replicas.to_string()),
                    ("new", &new.status.replicas.to_string()),
                ],
            );
        }
        self.enqueue(new);
    }

    fn on_delete(&self, rs: &ReplicaSet, _final_state_unknown: bool) {
        self.enqueue(rs);
    }
}

impl EventSink<Pod> for ReplicaSetController {
    fn on_add(&self, pod: &Pod) {
        self.add_pod(pod);
    }

    fn on_update(&self, old: &Pod, new: &Pod) {
        self.update_pod(old, new);
    }

    fn on_delete(&self, pod: &Pod, final_state_unknown: bool) {
        self.delete_pod(pod, final_state_unknown);
    }
}

/// Errors raised by the ReplicaSet controller.
#[derive(Debug)]
pub enum ReplicaSetError {
    InvalidKey(KeyError),
    /// The selector can never be satisfied as written; retrying cannot help.
    InvalidSelector { key: String, source: SelectorError },
}

impl Display for ReplicaSetError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaSetError::InvalidKey(err) => write!(f, "invalid ReplicaSet key: {}", err),
            ReplicaSetError::InvalidSelector { key, source } => {
                write!(f, "ReplicaSet {} has an invalid selector: {}", key, source)
            }
        }
    }
}

impl Error for ReplicaSetError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ReplicaSetError::InvalidKey(err) => Some(err),
            ReplicaSetError::InvalidSelector { source, .. } => Some(source),
        }
    }
}
