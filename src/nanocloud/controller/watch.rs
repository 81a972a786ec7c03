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

use crate::nanocloud::controller::cache::{CacheObject, WatchCache};
use crate::nanocloud::logger::{log_debug, log_info, log_warn};
use crate::nanocloud::observability::metrics;
use crate::nanocloud::util::error::BoxError;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const BACKOFF_INITIAL_MS: u64 = 200;
const BACKOFF_MAX_MS: u64 = 10_000;
const COMPONENT: &str = "informer";

/// A change delivered by a watch feed.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    /// `final_state_unknown` marks a tombstone: the deletion was inferred
    /// and `object` is the last state the cache held.
    Deleted { object: T, final_state_unknown: bool },
    /// Authoritative full content; anything not listed is gone.
    Resync(Vec<T>),
}

/// Result of a full list call.
#[derive(Debug, Clone)]
pub struct ListSnapshot<T> {
    pub items: Vec<T>,
    pub resource_version: String,
}

pub type WatchStream<T> = BoxStream<'static, Result<WatchEvent<T>, WatchError>>;

/// Source of list and watch calls for one resource type.
pub trait ListWatch<T>: Send + Sync {
    fn list(&self) -> BoxFuture<'_, Result<ListSnapshot<T>, WatchError>>;

    /// Opens a watch starting after `resource_version`.
    fn watch(&self, resource_version: &str) -> BoxFuture<'_, Result<WatchStream<T>, WatchError>>;
}

#[derive(Debug)]
pub enum WatchError {
    /// The requested resource version is no longer available; relist.
    Expired(String),
    Transport(BoxError),
}

impl Display for WatchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            WatchError::Expired(version) => {
                write!(f, "resource version {version} is too old")
            }
            WatchError::Transport(err) => write!(f, "watch transport error: {err}"),
        }
    }
}

impl Error for WatchError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            WatchError::Transport(err) => Some(err.as_ref()),
            WatchError::Expired(_) => None,
        }
    }
}

/// Receives cache changes after they have been applied.
pub trait EventSink<T>: Send + Sync {
    fn on_add(&self, object: &T);
    fn on_update(&self, old: &T, new: &T);
    fn on_delete(&self, object: &T, final_state_unknown: bool);
}

enum Restart {
    Relist,
    Rewatch,
}

/// Keeps a [`WatchCache`] in step with a [`ListWatch`] feed and forwards every
/// applied change to an [`EventSink`].
pub struct Informer<T> {
    resource: &'static str,
    cache: WatchCache<T>,
    feed: Arc<dyn ListWatch<T>>,
    sink: Arc<dyn EventSink<T>>,
}

impl<T: CacheObject> Informer<T> {
    pub fn new(
        resource: &'static str,
        cache: WatchCache<T>,
        feed: Arc<dyn ListWatch<T>>,
        sink: Arc<dyn EventSink<T>>,
    ) -> Self {
        Self {
            resource,
            cache,
            feed,
            sink,
        }
    }

    pub fn cache(&self) -> &WatchCache<T> {
        &self.cache
    }

    /// Runs list-then-watch until `cancel` fires. Expired watches trigger a
    /// relist; closed streams and transport errors re-watch after a backoff.
    /// Watches resume from the newest version applied so far, which never
    /// moves backwards between relists.
    pub async fn run(self, cancel: CancellationToken) {
        let mut backoff = Duration::from_millis(BACKOFF_INITIAL_MS);
        let mut resume: Option<String> = None;

        loop {
            let mut applied = match resume.take() {
                Some(version) => version,
                None => {
                    let listed = tokio::select! {
                        _ = cancel.cancelled() => return,
                        listed = self.feed.list() => listed,
                    };
                    match listed {
                        Ok(snapshot) => {
                            self.apply(WatchEvent::Resync(snapshot.items));
                            log_debug(
                                COMPONENT,
                                "Listed resource",
                                &[
                                    ("resource", self.resource),
                                    ("resourceVersion", &snapshot.resource_version),
                                    ("items", &self.cache.len().to_string()),
                                ],
                            );
                            snapshot.resource_version
                        }
                        Err(err) => {
                            self.note_restart("list_error", &err);
                            if !backoff_sleep(&cancel, &mut backoff).await {
                                return;
                            }
                            continue;
                        }
                    }
                }
            };

            let opened = tokio::select! {
                _ = cancel.cancelled() => return,
                opened = self.feed.watch(&applied) => opened,
            };
            let mut stream = match opened {
                Ok(stream) => stream,
                Err(err) => {
                    let expired = matches!(err, WatchError::Expired(_));
                    self.note_restart(if expired { "expired" } else { "watch_error" }, &err);
                    if !expired {
                        resume = Some(applied);
                    }
                    if !backoff_sleep(&cancel, &mut backoff).await {
                        return;
                    }
                    continue;
                }
            };

            let restart = loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    next = stream.next() => match next {
                        Some(Ok(event)) => {
                            backoff = Duration::from_millis(BACKOFF_INITIAL_MS);
                            let version = event_version(&event);
                            self.apply(event);
                            advance_version(&mut applied, version);
                        }
                        Some(Err(WatchError::Expired(_))) => break Restart::Relist,
                        Some(Err(err)) => {
                            self.note_restart("stream_error", &err);
                            break Restart::Rewatch;
                        }
                        None => {
                            metrics::record_watch_restart(self.resource, "closed");
                            break Restart::Rewatch;
                        }
                    }
                }
            };

            match restart {
                Restart::Relist => {
                    metrics::record_watch_restart(self.resource, "expired");
                    log_info(
                        COMPONENT,
                        "Watch expired; relisting",
                        &[("resource", self.resource)],
                    );
                }
                Restart::Rewatch => {
                    resume = Some(applied);
                    if !backoff_sleep(&cancel, &mut backoff).await {
                        return;
                    }
                }
            }
        }
    }

    fn note_restart(&self, cause: &str, err: &WatchError) {
        metrics::record_watch_restart(self.resource, cause);
        log_warn(
            COMPONENT,
            "Watch feed failed",
            &[
                ("resource", self.resource),
                ("cause", cause),
                ("error", &err.to_string()),
            ],
        );
    }

    /// Applies one event to the cache and notifies the sink.
    pub fn apply(&self, event: WatchEvent<T>) {
        match event {
            WatchEvent::Added(object) | WatchEvent::Modified(object) => {
                match self.cache.upsert(object.clone()) {
                    Ok(Some(previous)) => self.sink.on_update(&previous, &object),
                    Ok(None) => self.sink.on_add(&object),
                    Err(err) => log_warn(
                        COMPONENT,
                        "Dropping object without a usable key",
                        &[("resource", self.resource), ("error", &err.to_string())],
                    ),
                }
            }
            WatchEvent::Deleted {
                object,
                final_state_unknown,
            } => {
                let Ok(key) = object.key() else {
                    return;
                };
                match self.cache.remove(&key) {
                    Some(_) => self.sink.on_delete(&object, final_state_unknown),
                    None => log_debug(
                        COMPONENT,
                        "Delete for unknown object ignored",
                        &[("resource", self.resource), ("key", &key)],
                    ),
                }
            }
            WatchEvent::Resync(objects) => {
                let fresh = objects.clone();
                let mut previous = self.cache.replace(objects);
                for object in &fresh {
                    let Ok(key) = object.key() else {
                        continue;
                    };
                    match previous.remove(&key) {
                        Some(old) => self.sink.on_update(&old, object),
                        None => self.sink.on_add(object),
                    }
                }
                for (_, gone) in previous {
                    self.sink.on_delete(&gone, true);
                }
            }
        }
    }
}

/// Resource version carried by an event; the newest one for a resync.
fn event_version<T: CacheObject>(event: &WatchEvent<T>) -> Option<String> {
    match event {
        WatchEvent::Added(object)
        | WatchEvent::Modified(object)
        | WatchEvent::Deleted { object, .. } => object.metadata().resource_version.clone(),
        WatchEvent::Resync(objects) => objects
            .iter()
            .filter_map(|object| object.metadata().resource_version.clone())
            .reduce(|mut newest, candidate| {
                advance_version(&mut newest, Some(candidate));
                newest
            }),
    }
}

/// Moves `applied` to `candidate` unless both are numeric and `candidate` is
/// older. Opaque versions follow delivery order.
fn advance_version(applied: &mut String, candidate: Option<String>) {
    let Some(candidate) = candidate else {
        return;
    };
    let older = match (candidate.parse::<u64>(), applied.parse::<u64>()) {
        (Ok(candidate), Ok(current)) => candidate <= current,
        _ => false,
    };
    if !older {
        *applied = candidate;
    }
}

/// Sleeps for the current backoff and doubles it. Returns false when
/// cancelled.
async fn backoff_sleep(cancel: &CancellationToken, backoff: &mut Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => return false,
        _ = sleep(*backoff) => {}
    }
    let next = *backoff * 2;
    *backoff = if next > Duration::from_millis(BACKOFF_MAX_MS) {
        Duration::from_millis(BACKOFF_MAX_MS)
    } else {
        next
    };
    true
}
