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

//! View of the pods the container runtime is actually running, and a cache
//! in front of it that pod workers refresh on demand.

use crate::nanocloud::logger::log_debug;
use crate::nanocloud::util::error::BoxError;
use futures_util::future::BoxFuture;
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub type PodUid = String;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub created: Option<Instant>,
}

/// Containers the runtime reports for one pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningPod {
    pub uid: PodUid,
    pub name: String,
    pub namespace: String,
    pub containers: Vec<RunningContainer>,
}

impl RunningPod {
    pub fn find_container(&self, name: &str) -> Option<&RunningContainer> {
        self.containers.iter().find(|container| container.name == name)
    }
}

pub fn find_pod_by_uid<'a>(uid: &str, pods: &'a [RunningPod]) -> Option<&'a RunningPod> {
    pods.iter().find(|pod| pod.uid == uid)
}

/// Container runtime backend.
pub trait ContainerRuntime: Send + Sync {
    fn get_pods(&self) -> BoxFuture<'_, Result<Vec<RunningPod>, RuntimeError>>;
}

/// Cached view of [`ContainerRuntime::get_pods`].
pub trait RuntimeCache: Send + Sync {
    /// Refreshes the snapshot unless it was taken at or after `min`.
    fn force_update_if_older(&self, min: Instant) -> BoxFuture<'_, Result<(), RuntimeError>>;

    fn get_pods(&self) -> BoxFuture<'_, Result<Vec<RunningPod>, RuntimeError>>;
}

#[derive(Debug)]
pub enum RuntimeError {
    Unavailable(BoxError),
}

impl Display for RuntimeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::Unavailable(err) => write!(f, "container runtime unavailable: {err}"),
        }
    }
}

impl Error for RuntimeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RuntimeError::Unavailable(err) => Some(err.as_ref()),
        }
    }
}

struct Snapshot {
    pods: Vec<RunningPod>,
    taken_at: Instant,
}

/// [`RuntimeCache`] over any runtime. Snapshots older than `cache_period` are
/// refreshed on read.
pub struct CachedRuntime {
    runtime: Arc<dyn ContainerRuntime>,
    cache_period: Duration,
    snapshot: Mutex<Option<Snapshot>>,
}

impl CachedRuntime {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, cache_period: Duration) -> Self {
        Self {
            runtime,
            cache_period,
            snapshot: Mutex::new(None),
        }
    }

    async fn refresh(&self, slot: &mut Option<Snapshot>) -> Result<(), RuntimeError> {
        let taken_at = Instant::now();
        let pods = self.runtime.get_pods().await?;
        log_debug(
            "runtime-cache",
            "Refreshed runtime pod snapshot",
            &[("pods", &pods.len().to_string())],
        );
        *slot = Some(Snapshot { pods, taken_at });
        Ok(())
    }
}

impl RuntimeCache for CachedRuntime {
    fn force_update_if_older(&self, min: Instant) -> BoxFuture<'_, Result<(), RuntimeError>> {
        Box::pin(async move {
            let mut slot = self.snapshot.lock().await;
            let stale = slot.as_ref().map_or(true, |snapshot| snapshot.taken_at < min);
            if stale {
                self.refresh(&mut slot).await?;
            }
            Ok(())
        })
    }

    fn get_pods(&self) -> BoxFuture<'_, Result<Vec<RunningPod>, RuntimeError>> {
        Box::pin(async move {
            let mut slot = self.snapshot.lock().await;
            let expired = slot
                .as_ref()
                .map_or(true, |snapshot| snapshot.taken_at.elapsed() > self.cache_period);
            if expired {
                self.refresh(&mut slot).await?;
            }
            Ok(slot
                .as_ref()
                .map(|snapshot| snapshot.pods.clone())
                .unwrap_or_default())
        })
    }
}
