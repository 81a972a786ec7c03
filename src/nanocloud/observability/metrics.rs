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

use std::error::Error;
use std::sync::OnceLock;

use prometheus::core::Collector;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static CONTROLLER_RECONCILES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static REPLICA_OPERATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static WORKQUEUE_DEPTH: OnceLock<IntGaugeVec> = OnceLock::new();
static WORKQUEUE_REQUEUES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static POD_WORKER_SYNCS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static WATCH_RESTARTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        Registry::new_custom(Some("nanocloud".to_string()), None)
            .expect("failed to initialise nanocloud metrics registry")
    })
}

fn register_collector<C>(collector: C) -> C
where
    C: Clone + Collector + Send + Sync + 'static,
{
    registry()
        .register(Box::new(collector.clone()))
        .expect("failed to register nanocloud metric collector");
    collector
}

fn counter(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let counter = IntCounterVec::new(Opts::new(name, help), labels)
        .expect("failed to build nanocloud counter");
    register_collector(counter)
}

fn controller_reconciles_total() -> &'static IntCounterVec {
    CONTROLLER_RECONCILES_TOTAL.get_or_init(|| {
        counter(
            "controller_reconciles_total",
            "Controller reconciliation attempts grouped by result",
            &["controller", "result"],
        )
    })
}

fn replica_operations_total() -> &'static IntCounterVec {
    REPLICA_OPERATIONS_TOTAL.get_or_init(|| {
        counter(
            "replica_operations_total",
            "Pod create/delete requests issued by replica controllers grouped by result",
            &["controller", "operation", "result"],
        )
    })
}

fn workqueue_depth() -> &'static IntGaugeVec {
    WORKQUEUE_DEPTH.get_or_init(|| {
        let gauge = IntGaugeVec::new(
            Opts::new("workqueue_depth", "Keys waiting in a controller work queue"),
            &["queue"],
        )
        .expect("failed to build workqueue depth gauge");
        register_collector(gauge)
    })
}

fn workqueue_requeues_total() -> &'static IntCounterVec {
    WORKQUEUE_REQUEUES_TOTAL.get_or_init(|| {
        counter(
            "workqueue_requeues_total",
            "Keys re-added while still being processed",
            &["queue"],
        )
    })
}

fn pod_worker_syncs_total() -> &'static IntCounterVec {
    POD_WORKER_SYNCS_TOTAL.get_or_init(|| {
        counter(
            "pod_worker_syncs_total",
            "Kubelet pod worker sync attempts grouped by result",
            &["result"],
        )
    })
}

fn watch_restarts_total() -> &'static IntCounterVec {
    WATCH_RESTARTS_TOTAL.get_or_init(|| {
        counter(
            "watch_restarts_total",
            "Informer watch restarts grouped by resource and cause",
            &["resource", "cause"],
        )
    })
}

pub fn record_controller_reconcile(controller: &str, result: ControllerReconcileResult) {
    controller_reconciles_total()
        .with_label_values(&[controller, result.as_label()])
        .inc();
}

pub fn record_replica_operation(
    controller: &str,
    operation: ReplicaOperation,
    result: OperationResult,
) {
    replica_operations_total()
        .with_label_values(&[controller, operation.as_label(), result.as_label()])
        .inc();
}

pub fn set_workqueue_depth(queue: &str, depth: usize) {
    workqueue_depth()
        .with_label_values(&[queue])
        .set(i64::try_from(depth).unwrap_or(i64::MAX));
}

pub fn record_workqueue_requeue(queue: &str) {
    workqueue_requeues_total().with_label_values(&[queue]).inc();
}

pub fn record_pod_worker_sync(result: OperationResult) {
    pod_worker_syncs_total()
        .with_label_values(&[result.as_label()])
        .inc();
}

pub fn record_watch_restart(resource: &str, cause: &str) {
    watch_restarts_total()
        .with_label_values(&[resource, cause])
        .inc();
}

/// Encodes all registered metrics using the Prometheus text exposition
/// format.
pub fn gather() -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
    let metric_families = registry().gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|err| Box::new(err) as Box<dyn Error + Send + Sync>)?;
    Ok(buffer)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ControllerReconcileResult {
    Success,
    Skipped,
    Requeued,
    Error,
}

impl ControllerReconcileResult {
    fn as_label(self) -> &'static str {
        match self {
            ControllerReconcileResult::Success => "success",
            ControllerReconcileResult::Skipped => "skipped",
            ControllerReconcileResult::Requeued => "requeued",
            ControllerReconcileResult::Error => "error",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReplicaOperation {
    Create,
    Delete,
}

impl ReplicaOperation {
    fn as_label(self) -> &'static str {
        match self {
            ReplicaOperation::Create => "create",
            ReplicaOperation::Delete => "delete",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OperationResult {
    Success,
    Failed,
}

impl OperationResult {
    fn as_label(self) -> &'static str {
        match self {
            OperationResult::Success => "success",
            OperationResult::Failed => "failed",
        }
    }
}
