#![allow(dead_code)]

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

//! In-memory collaborators and object builders shared by unit tests and the
//! scenario tests under `tests/`.

use crate::nanocloud::controller::cache::CacheObject;
use crate::nanocloud::controller::pod_control::{
    PodControl, PodControlError, PodCreateRequest, ReplicaSetStatusSink, StatusError,
};
use crate::nanocloud::controller::watch::{
    ListSnapshot, ListWatch, WatchError, WatchEvent, WatchStream,
};
use crate::nanocloud::k8s::pod::{
    ObjectMeta, OwnerReference, Pod, PodCondition, PodSpec, PodStatus, CONDITION_READY,
};
use crate::nanocloud::k8s::replicaset::{
    PodTemplateSpec, ReplicaSet, ReplicaSetSpec, ReplicaSetStatus,
};
use crate::nanocloud::k8s::selector::LabelSelector;
use crate::nanocloud::kubelet::container::{ContainerRuntime, RunningPod, RuntimeError};
use crate::nanocloud::kubelet::pod_workers::{PodSyncer, SyncError};
use crate::nanocloud::util::error::new_error;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use futures_util::future::BoxFuture;
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Decrements `counter` if positive; true when a failure should be injected.
fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Fixed reference time so creation timestamps order deterministically.
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

pub fn replica_set(namespace: &str, name: &str, replicas: u32, app: &str) -> ReplicaSet {
    let mut metadata = ObjectMeta::named(Some(namespace), name);
    metadata.uid = Some(format!("uid-{name}"));
    metadata.creation_timestamp = Some(epoch());
    let mut template = PodTemplateSpec::default();
    template
        .metadata
        .labels
        .insert("app".to_string(), app.to_string());
    ReplicaSet::new(
        metadata,
        ReplicaSetSpec {
            replicas,
            selector: LabelSelector::from_labels([("app", app)]),
            template,
        },
    )
}

/// Pod labelled `app=<app>`, created `age_secs` after [`epoch`].
pub fn pod(namespace: &str, name: &str, app: &str, age_secs: i64) -> Pod {
    let mut metadata = ObjectMeta::named(Some(namespace), name);
    metadata.uid = Some(format!("uid-{name}"));
    metadata
        .labels
        .insert("app".to_string(), app.to_string());
    metadata.creation_timestamp = Some(epoch() + ChronoDuration::seconds(age_secs));
    Pod::new(metadata, PodSpec::default())
}

/// Marks a pod as scheduled, in `phase`, and optionally ready.
pub fn with_status(mut pod: Pod, phase: &str, ready: bool) -> Pod {
    pod.spec.node_name = Some("node-a".to_string());
    pod.status = Some(PodStatus {
        phase: Some(phase.to_string()),
        pod_ip: None,
        conditions: vec![PodCondition {
            condition_type: CONDITION_READY.to_string(),
            status: if ready { "True" } else { "False" }.to_string(),
            ..Default::default()
        }],
    });
    pod
}

type CreateHook = Box<dyn Fn(Pod) + Send + Sync>;
type DeleteHook = Box<dyn Fn(&str, &str) + Send + Sync>;

/// Backend that records every call. Failures can be injected and an optional
/// delay keeps calls in flight long enough to measure concurrency.
#[derive(Default)]
pub struct FakePodControl {
    created: Mutex<Vec<PodCreateRequest>>,
    deleted: Mutex<Vec<String>>,
    fail_creates: AtomicUsize,
    fail_deletes: AtomicUsize,
    in_flight: Mutex<HashMap<String, usize>>,
    max_in_flight: AtomicUsize,
    delay: Mutex<Option<Duration>>,
    on_create: Mutex<Option<CreateHook>>,
    on_delete: Mutex<Option<DeleteHook>>,
}

impl FakePodControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_creates(&self, count: usize) {
        self.fail_creates.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_deletes(&self, count: usize) {
        self.fail_deletes.store(count, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = Some(delay);
    }

    /// Called with the pod of every successful create.
    pub fn on_create(&self, hook: impl Fn(Pod) + Send + Sync + 'static) {
        *lock(&self.on_create) = Some(Box::new(hook));
    }

    /// Called with namespace and name of every successful delete.
    pub fn on_delete(&self, hook: impl Fn(&str, &str) + Send + Sync + 'static) {
        *lock(&self.on_delete) = Some(Box::new(hook));
    }

    pub fn created(&self) -> Vec<PodCreateRequest> {
        lock(&self.created).clone()
    }

    pub fn create_count(&self) -> usize {
        lock(&self.created).len()
    }

    /// `namespace/name` of every pod deleted, in call order.
    pub fn deleted(&self) -> Vec<String> {
        lock(&self.deleted).clone()
    }

    pub fn delete_count(&self) -> usize {
        lock(&self.deleted).len()
    }

    /// Highest number of concurrent calls seen for one owner.
    pub fn max_in_flight_per_owner(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self, owner: &str) {
        let mut in_flight = lock(&self.in_flight);
        let entry = in_flight.entry(owner.to_string()).or_default();
        *entry += 1;
        self.max_in_flight.fetch_max(*entry, Ordering::SeqCst);
    }

    fn leave(&self, owner: &str) {
        if let Some(entry) = lock(&self.in_flight).get_mut(owner) {
            *entry = entry.saturating_sub(1);
        }
    }

    async fn pause(&self) {
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

impl PodControl for FakePodControl {
    fn create_pod(&self, request: PodCreateRequest) -> BoxFuture<'_, Result<(), PodControlError>> {
        Box::pin(async move {
            self.enter(&request.owner.name);
            self.pause().await;
            self.leave(&request.owner.name);
            if take_failure(&self.fail_creates) {
                return Err(PodControlError::Unavailable(new_error("injected create failure")));
            }
            let pod = request.to_pod();
            lock(&self.created).push(request);
            if let Some(hook) = lock(&self.on_create).as_ref() {
                hook(pod);
            }
            Ok(())
        })
    }

    fn delete_pod<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
        owner: &'a OwnerReference,
    ) -> BoxFuture<'a, Result<(), PodControlError>> {
        Box::pin(async move {
            self.enter(&owner.name);
            self.pause().await;
            self.leave(&owner.name);
            if take_failure(&self.fail_deletes) {
                return Err(PodControlError::Unavailable(new_error("injected delete failure")));
            }
            lock(&self.deleted).push(format!("{namespace}/{name}"));
            if let Some(hook) = lock(&self.on_delete).as_ref() {
                hook(namespace, name);
            }
            Ok(())
        })
    }
}

/// Status sink that keeps every update written.
#[derive(Default)]
pub struct FakeStatusSink {
    updates: Mutex<Vec<(String, ReplicaSetStatus)>>,
    failures: AtomicUsize,
    attempts: AtomicUsize,
}

impl FakeStatusSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn updates(&self) -> Vec<(String, ReplicaSetStatus)> {
        lock(&self.updates).clone()
    }

    pub fn last_for(&self, key: &str) -> Option<ReplicaSetStatus> {
        lock(&self.updates)
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, status)| status.clone())
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl ReplicaSetStatusSink for FakeStatusSink {
    fn update_status<'a>(
        &'a self,
        key: &'a str,
        status: &'a ReplicaSetStatus,
    ) -> BoxFuture<'a, Result<(), StatusError>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if take_failure(&self.failures) {
                return Err(StatusError::Conflict(key.to_string()));
            }
            lock(&self.updates).push((key.to_string(), status.clone()));
            Ok(())
        })
    }
}

type EventSender<T> = mpsc::UnboundedSender<Result<WatchEvent<T>, WatchError>>;

struct FeedState<T> {
    items: Vec<T>,
    resource_version: u64,
    list_calls: usize,
    watchers: Vec<EventSender<T>>,
}

/// List/watch feed driven by the test. Every `watch` call opens a fresh
/// stream; `emit` and `expire` reach all open streams.
pub struct FakeListWatch<T> {
    state: Mutex<FeedState<T>>,
    watches_opened: watch::Sender<usize>,
}

impl<T: CacheObject> FakeListWatch<T> {
    pub fn new(items: Vec<T>) -> Self {
        let (watches_opened, _) = watch::channel(0);
        Self {
            state: Mutex::new(FeedState {
                items,
                resource_version: 1,
                list_calls: 0,
                watchers: Vec::new(),
            }),
            watches_opened,
        }
    }

    /// Content returned by subsequent `list` calls.
    pub fn set_items(&self, items: Vec<T>) {
        let mut state = lock(&self.state);
        state.items = items;
        state.resource_version += 1;
    }

    pub fn emit(&self, event: WatchEvent<T>) {
        let mut state = lock(&self.state);
        state.resource_version += 1;
        state
            .watchers
            .retain(|watcher| watcher.send(Ok(event.clone())).is_ok());
    }

    /// Fails every open stream with [`WatchError::Expired`].
    pub fn expire(&self) {
        let mut state = lock(&self.state);
        let version = state.resource_version.to_string();
        for watcher in state.watchers.drain(..) {
            let _ = watcher.send(Err(WatchError::Expired(version.clone())));
        }
    }

    /// Ends every open stream as if the server closed it.
    pub fn close_watches(&self) {
        lock(&self.state).watchers.clear();
    }

    pub fn list_calls(&self) -> usize {
        lock(&self.state).list_calls
    }

    pub fn watches_opened(&self) -> usize {
        *self.watches_opened.borrow()
    }

    /// Resolves once at least `count` watches have been opened.
    pub async fn wait_for_watchers(&self, count: usize) {
        let mut opened = self.watches_opened.subscribe();
        let _ = opened.wait_for(|value| *value >= count).await;
    }
}

impl<T: CacheObject> ListWatch<T> for FakeListWatch<T> {
    fn list(&self) -> BoxFuture<'_, Result<ListSnapshot<T>, WatchError>> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.list_calls += 1;
            Ok(ListSnapshot {
                items: state.items.clone(),
                resource_version: state.resource_version.to_string(),
            })
        })
    }

    fn watch(&self, _resource_version: &str) -> BoxFuture<'_, Result<WatchStream<T>, WatchError>> {
        Box::pin(async move {
            let (sender, receiver) = mpsc::unbounded_channel();
            lock(&self.state).watchers.push(sender);
            self.watches_opened.send_modify(|opened| *opened += 1);
            let events = stream::unfold(receiver, |mut receiver| async move {
                receiver.recv().await.map(|event| (event, receiver))
            });
            Ok(events.boxed())
        })
    }
}

/// Container runtime returning a configurable pod list.
#[derive(Default)]
pub struct FakeRuntime {
    pods: Mutex<Vec<RunningPod>>,
    calls: AtomicUsize,
    failures: AtomicUsize,
}

impl FakeRuntime {
    pub fn new(pods: Vec<RunningPod>) -> Self {
        Self {
            pods: Mutex::new(pods),
            ..Default::default()
        }
    }

    pub fn set_pods(&self, pods: Vec<RunningPod>) {
        *lock(&self.pods) = pods;
    }

    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ContainerRuntime for FakeRuntime {
    fn get_pods(&self) -> BoxFuture<'_, Result<Vec<RunningPod>, RuntimeError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if take_failure(&self.failures) {
                return Err(RuntimeError::Unavailable(new_error("injected runtime failure")));
            }
            Ok(lock(&self.pods).clone())
        })
    }
}

/// Pod syncer that records each sync and, when gated, blocks every sync
/// until the test releases a permit.
pub struct GatedPodSyncer {
    gate: Option<Semaphore>,
    started: watch::Sender<usize>,
    synced: Mutex<Vec<(String, String, bool)>>,
    failures: AtomicUsize,
}

impl GatedPodSyncer {
    fn build(gate: Option<Semaphore>) -> Self {
        let (started, _) = watch::channel(0);
        Self {
            gate,
            started,
            synced: Mutex::new(Vec::new()),
            failures: AtomicUsize::new(0),
        }
    }

    /// Syncs complete immediately.
    pub fn open() -> Self {
        Self::build(None)
    }

    /// Syncs wait for [`GatedPodSyncer::release`].
    pub fn gated() -> Self {
        Self::build(Some(Semaphore::new(0)))
    }

    pub fn release(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Resource versions synced for `uid`, in order.
    pub fn synced_versions(&self, uid: &str) -> Vec<String> {
        lock(&self.synced)
            .iter()
            .filter(|(synced_uid, _, _)| synced_uid == uid)
            .map(|(_, version, _)| version.clone())
            .collect()
    }

    /// Whether the sync of each version saw a running pod.
    pub fn saw_running(&self, uid: &str) -> Vec<bool> {
        lock(&self.synced)
            .iter()
            .filter(|(synced_uid, _, _)| synced_uid == uid)
            .map(|(_, _, running)| *running)
            .collect()
    }

    pub async fn wait_started(&self, count: usize) {
        let mut started = self.started.subscribe();
        let _ = started.wait_for(|value| *value >= count).await;
    }
}

impl PodSyncer for GatedPodSyncer {
    fn sync_pod<'a>(
        &'a self,
        pod: &'a Pod,
        running: Option<&'a RunningPod>,
    ) -> BoxFuture<'a, Result<(), SyncError>> {
        Box::pin(async move {
            lock(&self.synced).push((
                pod.metadata.uid.clone().unwrap_or_default(),
                pod.metadata.resource_version.clone().unwrap_or_default(),
                running.is_some(),
            ));
            self.started.send_modify(|started| *started += 1);
            if let Some(gate) = &self.gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }
            if take_failure(&self.failures) {
                return Err(SyncError::Failed(new_error("injected sync failure")));
            }
            Ok(())
        })
    }
}
