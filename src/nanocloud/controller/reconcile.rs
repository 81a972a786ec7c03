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

use futures_util::future::BoxFuture;
use std::error::Error;
use std::time::Duration;

/// How a reconciliation cycle wants its key treated afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Work is complete until the next change event.
    Synced,
    /// The object no longer exists.
    Skipped,
    /// Run again as soon as a worker is free.
    Requeue,
    /// Run again after the delay.
    RequeueAfter(Duration),
}

/// Desired input and observed state gathered during the fetch phase.
pub struct ReconcileData<Desired, Observed> {
    pub desired: Desired,
    pub observed: Observed,
}

type FetchResult<D, O, E> = Result<Option<ReconcileData<D, O>>, E>;

/// Shared reconciliation interface driven by the controller runtime.
pub trait Reconciler: Send + Sync + 'static {
    type Desired: Send + Sync;
    type Observed: Send + Sync;
    type Plan: Send;
    type Error: Error + Send + Sync + 'static;

    /// Returns the logical kind handled by this reconciler (used for diagnostics).
    fn kind(&self) -> &'static str;

    /// Fetches the desired spec and observed state. Returning `Ok(None)` indicates
    /// the resource no longer exists and no further work is required.
    fn fetch(&self, key: &str) -> FetchResult<Self::Desired, Self::Observed, Self::Error>;

    /// Computes the plan needed to align observed state with the desired spec.
    fn diff(
        &self,
        key: &str,
        desired: &Self::Desired,
        observed: &Self::Observed,
    ) -> Result<Self::Plan, Self::Error>;

    /// Applies the previously computed plan to drive the system toward convergence.
    fn apply<'a>(
        &'a self,
        key: &'a str,
        plan: Self::Plan,
    ) -> BoxFuture<'a, Result<ReconcileOutcome, Self::Error>>;

    /// Called when `fetch` finds nothing for the key.
    fn on_missing(&self, _key: &str) {}

    /// Whether a failed cycle should put the key back on the queue.
    fn requeue_on_error(&self, _error: &Self::Error) -> bool {
        true
    }

    /// Runs the full fetch, diff, apply pipeline for one key.
    fn reconcile<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<ReconcileOutcome, Self::Error>> {
        Box::pin(async move {
            let Some(data) = self.fetch(key)? else {
                self.on_missing(key);
                return Ok(ReconcileOutcome::Skipped);
            };
            let plan = self.diff(key, &data.desired, &data.observed)?;
            self.apply(key, plan).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct DummyError;

    impl std::fmt::Display for DummyError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "dummy error")
        }
    }

    impl std::error::Error for DummyError {}

    #[derive(Default)]
    struct CounterReconciler {
        desired: HashMap<String, u32>,
        observed: Mutex<HashMap<String, u32>>,
        missing: Mutex<Vec<String>>,
    }

    impl Reconciler for CounterReconciler {
        type Desired = u32;
        type Observed = u32;
        type Plan = u32;
        type Error = DummyError;

        fn kind(&self) -> &'static str {
            "Counter"
        }

        fn fetch(&self, key: &str) -> FetchResult<u32, u32, DummyError> {
            let Some(desired) = self.desired.get(key).copied() else {
                return Ok(None);
            };
            let observed = self
                .observed
                .lock()
                .expect("observed lock")
                .get(key)
                .copied()
                .unwrap_or(0);
            Ok(Some(ReconcileData { desired, observed }))
        }

        fn diff(&self, _: &str, desired: &u32, observed: &u32) -> Result<u32, DummyError> {
            desired.checked_sub(*observed).ok_or(DummyError)
        }

        fn apply<'a>(
            &'a self,
            key: &'a str,
            plan: u32,
        ) -> BoxFuture<'a, Result<ReconcileOutcome, DummyError>> {
            Box::pin(async move {
                *self
                    .observed
                    .lock()
                    .expect("observed lock")
                    .entry(key.to_string())
                    .or_default() += plan;
                Ok(ReconcileOutcome::Synced)
            })
        }

        fn on_missing(&self, key: &str) {
            self.missing.lock().expect("missing lock").push(key.to_string());
        }
    }

    #[tokio::test]
    async fn reconcile_pipeline_converges() {
        let mut reconciler = CounterReconciler::default();
        reconciler.desired.insert("default/a".to_string(), 3);

        let outcome = reconciler.reconcile("default/a").await.expect("reconcile");
        assert_eq!(outcome, ReconcileOutcome::Synced);
        assert_eq!(
            reconciler.observed.lock().expect("observed lock").get("default/a"),
            Some(&3)
        );

        // A second pass has nothing left to do.
        reconciler.reconcile("default/a").await.expect("reconcile");
        assert_eq!(
            reconciler.observed.lock().expect("observed lock").get("default/a"),
            Some(&3)
        );
    }

    #[tokio::test]
    async fn missing_objects_are_skipped() {
        let reconciler = CounterReconciler::default();
        let outcome = reconciler.reconcile("default/gone").await.expect("reconcile");
        assert_eq!(outcome, ReconcileOutcome::Skipped);
        assert_eq!(
            *reconciler.missing.lock().expect("missing lock"),
            vec!["default/gone".to_string()]
        );
    }

    #[tokio::test]
    async fn diff_errors_surface() {
        let mut reconciler = CounterReconciler::default();
        reconciler.desired.insert("default/a".to_string(), 1);
        reconciler
            .observed
            .lock()
            .expect("observed lock")
            .insert("default/a".to_string(), 2);
        assert!(reconciler.reconcile("default/a").await.is_err());
    }
}
