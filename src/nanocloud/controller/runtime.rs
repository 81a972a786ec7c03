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

//! Fixed pool of workers draining a [`WorkQueue`] into a [`Reconciler`].

use crate::nanocloud::controller::reconcile::{ReconcileOutcome, Reconciler};
use crate::nanocloud::controller::workqueue::WorkQueue;
use crate::nanocloud::k8s::store::ObjectKey;
use crate::nanocloud::logger::{log_debug, log_error};
use crate::nanocloud::observability::metrics::{self, ControllerReconcileResult};
use crate::nanocloud::observability::tracing::with_span;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Pairs a reconciler with the queue feeding it. Keys are processed serially
/// per key and concurrently across keys.
pub struct ControllerRuntime<R: Reconciler> {
    reconciler: Arc<R>,
    queue: WorkQueue<ObjectKey>,
}

impl<R: Reconciler> Clone for ControllerRuntime<R> {
    fn clone(&self) -> Self {
        Self {
            reconciler: Arc::clone(&self.reconciler),
            queue: self.queue.clone(),
        }
    }
}

impl<R: Reconciler> ControllerRuntime<R> {
    pub fn new(reconciler: Arc<R>, queue: WorkQueue<ObjectKey>) -> Self {
        Self { reconciler, queue }
    }

    pub fn queue(&self) -> &WorkQueue<ObjectKey> {
        &self.queue
    }

    pub fn reconciler(&self) -> &Arc<R> {
        &self.reconciler
    }

    /// Spawns `count` workers (at least one). Each exits once the queue has
    /// been shut down and drained.
    pub fn spawn_workers(&self, count: usize) -> Vec<JoinHandle<()>> {
        (0..count.max(1))
            .map(|worker| {
                let runtime = self.clone();
                tokio::spawn(async move {
                    while runtime.process_next().await {}
                    log_debug(
                        runtime.reconciler.kind(),
                        "Worker stopped",
                        &[("worker", &worker.to_string())],
                    );
                })
            })
            .collect()
    }

    /// Takes one key off the queue and reconciles it. Returns false once the
    /// queue is shut down.
    pub async fn process_next(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        let kind = self.reconciler.kind();
        let started = Instant::now();
        let result = with_span(kind, "reconcile", self.reconciler.reconcile(&key)).await;
        let elapsed_ms = started.elapsed().as_millis().to_string();

        match result {
            Ok(outcome) => {
                let label = match outcome {
                    ReconcileOutcome::Synced => ControllerReconcileResult::Success,
                    ReconcileOutcome::Skipped => ControllerReconcileResult::Skipped,
                    ReconcileOutcome::Requeue | ReconcileOutcome::RequeueAfter(_) => {
                        ControllerReconcileResult::Requeued
                    }
                };
                metrics::record_controller_reconcile(kind, label);
                log_debug(
                    kind,
                    "Finished syncing",
                    &[("key", &key), ("elapsed_ms", &elapsed_ms)],
                );
                match outcome {
                    ReconcileOutcome::Requeue => self.queue.add(key.clone()),
                    ReconcileOutcome::RequeueAfter(delay) => {
                        self.queue.add_after(key.clone(), delay)
                    }
                    ReconcileOutcome::Synced | ReconcileOutcome::Skipped => {}
                }
            }
            Err(err) => {
                metrics::record_controller_reconcile(kind, ControllerReconcileResult::Error);
                let requeue = self.reconciler.requeue_on_error(&err);
                log_error(
                    kind,
                    "Reconciliation failed",
                    &[
                        ("key", &key),
                        ("error", &err.to_string()),
                        ("requeue", if requeue { "true" } else { "false" }),
                    ],
                );
                if requeue {
                    self.queue.add(key.clone());
                }
            }
        }

        self.queue.done(&key);
        true
    }
}
