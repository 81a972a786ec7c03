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

//! One worker task per pod. Each pod has at most one sync in flight; updates
//! that arrive meanwhile collapse into a single pending update, and the most
//! recent one wins.

use crate::nanocloud::k8s::event::{EventRecorder, EventType, ObjectReference};
use crate::nanocloud::k8s::pod::Pod;
use crate::nanocloud::k8s::store::object_key;
use crate::nanocloud::kubelet::container::{find_pod_by_uid, PodUid, RunningPod, RuntimeCache, RuntimeError};
use crate::nanocloud::logger::{log_debug, log_error};
use crate::nanocloud::observability::metrics::{self, OperationResult};
use crate::nanocloud::observability::tracing::with_span;
use crate::nanocloud::util::error::BoxError;
use futures_util::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;

const COMPONENT: &str = "pod-workers";

/// Brings the node's containers in line with one pod's spec.
pub trait PodSyncer: Send + Sync {
    fn sync_pod<'a>(
        &'a self,
        pod: &'a Pod,
        running: Option<&'a RunningPod>,
    ) -> BoxFuture<'a, Result<(), SyncError>>;
}

/// Invoked after the update it was submitted with has synced successfully.
pub type UpdateCompleteFn = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug)]
pub enum SyncError {
    Runtime(RuntimeError),
    Failed(BoxError),
}

impl Display for SyncError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Runtime(err) => write!(f, "runtime cache: {}", err),
            SyncError::Failed(err) => write!(f, "{}", err),
        }
    }
}

impl Error for SyncError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SyncError::Runtime(err) => Some(err),
            SyncError::Failed(err) => Some(err.as_ref()),
        }
    }
}

impl From<RuntimeError> for SyncError {
    fn from(err: RuntimeError) -> Self {
        SyncError::Runtime(err)
    }
}

struct WorkUpdate {
    pod: Pod,
    on_complete: Option<UpdateCompleteFn>,
}

#[derive(Default)]
struct WorkerTable {
    pod_updates: HashMap<PodUid, mpsc::Sender<WorkUpdate>>,
    is_working: HashSet<PodUid>,
    last_undelivered: HashMap<PodUid, WorkUpdate>,
}

#[derive(Clone)]
pub struct PodWorkers {
    inner: Arc<PodWorkersInner>,
}

struct PodWorkersInner {
    table: Mutex<WorkerTable>,
    syncer: Arc<dyn PodSyncer>,
    runtime_cache: Arc<dyn RuntimeCache>,
    recorder: Arc<dyn EventRecorder>,
}

/// Identity a pod's worker is keyed by: its UID, or its object key when the
/// UID has not been assigned.
pub fn pod_uid(pod: &Pod) -> PodUid {
    match pod.metadata.uid.as_deref() {
        Some(uid) if !uid.is_empty() => uid.to_string(),
        _ => object_key(pod.metadata.namespace.as_deref(), pod.metadata.name_or_empty()),
    }
}

impl PodWorkers {
    pub fn new(
        syncer: Arc<dyn PodSyncer>,
        runtime_cache: Arc<dyn RuntimeCache>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Self {
        Self {
            inner: Arc::new(PodWorkersInner {
                table: Mutex::new(WorkerTable::default()),
                syncer,
                runtime_cache,
                recorder,
            }),
        }
    }

    fn table(&self) -> MutexGuard<'_, WorkerTable> {
        self.inner
            .table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Submits the latest desired state of a pod. Starts a worker on first
    /// sight; if a sync is already running the update replaces any pending one.
    pub fn update_pod(&self, pod: Pod, on_complete: Option<UpdateCompleteFn>) {
        let uid = pod_uid(&pod);
        let update = WorkUpdate { pod, on_complete };
        let mut table = self.table();

        let sender = match table.pod_updates.get(&uid) {
            Some(sender) => sender.clone(),
            None => {
                let (sender, receiver) = mpsc::channel(1);
                table.pod_updates.insert(uid.clone(), sender.clone());
                let workers = self.clone();
                let worker_uid = uid.clone();
                tokio::spawn(async move { workers.manage_pod_loop(worker_uid, receiver).await });
                sender
            }
        };

        if table.is_working.contains(&uid) {
            table.last_undelivered.insert(uid, update);
            return;
        }
        table.is_working.insert(uid.clone());
        Self::deliver(&mut table, uid, &sender, update);
    }

    fn deliver(
        table: &mut WorkerTable,
        uid: PodUid,
        sender: &mpsc::Sender<WorkUpdate>,
        update: WorkUpdate,
    ) {
        match sender.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(update)) => {
                table.last_undelivered.insert(uid, update);
            }
            Err(TrySendError::Closed(_)) => {
                log_error(
                    COMPONENT,
                    "Pod worker mailbox closed; dropping update",
                    &[("uid", &uid)],
                );
                table.is_working.remove(&uid);
            }
        }
    }

    async fn manage_pod_loop(self, uid: PodUid, mut updates: mpsc::Receiver<WorkUpdate>) {
        let mut min_runtime_cache_time: Option<Instant> = None;
        while let Some(WorkUpdate { pod, on_complete }) = updates.recv().await {
            let result = with_span(
                COMPONENT,
                "sync_pod",
                self.sync_once(&uid, &pod, min_runtime_cache_time),
            )
            .await;

            match result {
                Ok(()) => {
                    min_runtime_cache_time = Some(Instant::now());
                    metrics::record_pod_worker_sync(OperationResult::Success);
                    if let Some(on_complete) = on_complete {
                        on_complete();
                    }
                }
                Err(err) => {
                    metrics::record_pod_worker_sync(OperationResult::Failed);
                    log_error(
                        COMPONENT,
                        "Error syncing pod, skipping",
                        &[
                            ("uid", &uid),
                            ("pod", pod.metadata.name_or_empty()),
                            ("error", &err.to_string()),
                        ],
                    );
                    self.inner.recorder.record(
                        &ObjectReference::for_pod(&pod),
                        EventType::Warning,
                        "FailedSync",
                        &format!("Error syncing pod, skipping: {}", err),
                    );
                }
            }
            self.check_for_updates(&uid);
        }
        log_debug(COMPONENT, "Pod worker stopped", &[("uid", &uid)]);
    }

    async fn sync_once(
        &self,
        uid: &str,
        pod: &Pod,
        min_runtime_cache_time: Option<Instant>,
    ) -> Result<(), SyncError> {
        let cache = &self.inner.runtime_cache;
        if let Some(min) = min_runtime_cache_time {
            cache.force_update_if_older(min).await?;
        }
        let running = cache.get_pods().await?;
        let running_pod = find_pod_by_uid(uid, &running);
        self.inner.syncer.sync_pod(pod, running_pod).await
    }

    /// Hands the pending update to the worker, or marks the pod idle.
    fn check_for_updates(&self, uid: &str) {
        let mut table = self.table();
        let Some(update) = table.last_undelivered.remove(uid) else {
            table.is_working.remove(uid);
            return;
        };
        match table.pod_updates.get(uid).cloned() {
            Some(sender) => Self::deliver(&mut table, uid.to_string(), &sender, update),
            None => {
                table.is_working.remove(uid);
            }
        }
    }

    /// Stops workers for every pod not in `desired`, discarding their pending
    /// updates.
    pub fn forget_non_existing_workers(&self, desired: &HashSet<PodUid>) {
        let mut table = self.table();
        let stale: Vec<PodUid> = table
            .pod_updates
            .keys()
            .filter(|uid| !desired.contains(*uid))
            .cloned()
            .collect();
        for uid in stale {
            // Dropping the sender closes the mailbox and ends the worker loop.
            table.pod_updates.remove(&uid);
            table.last_undelivered.remove(&uid);
            log_debug(COMPONENT, "Forgetting pod worker", &[("uid", &uid)]);
        }
    }

    pub fn is_working(&self, uid: &str) -> bool {
        self.table().is_working.contains(uid)
    }

    pub fn has_pending_update(&self, uid: &str) -> bool {
        self.table().last_undelivered.contains_key(uid)
    }

    pub fn tracked_workers(&self) -> usize {
        self.table().pod_updates.len()
    }
}
