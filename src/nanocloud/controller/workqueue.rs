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

use crate::nanocloud::k8s::store::ObjectKey;
use crate::nanocloud::logger::log_debug;
use crate::nanocloud::observability::metrics;
use std::collections::{HashSet, VecDeque};
use std::fmt::Display;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

/// Deduplicating FIFO of keys awaiting reconciliation.
///
/// A key handed out by [`WorkQueue::get`] stays in the processing set until
/// [`WorkQueue::done`]; adding it again meanwhile only marks it dirty, and it
/// is queued once more when processing completes. Two workers therefore never
/// hold the same key at the same time.
pub struct WorkQueue<K = ObjectKey> {
    inner: Arc<QueueInner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct QueueInner<K> {
    name: String,
    state: Mutex<QueueState<K>>,
    notify: Notify,
}

struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name: name.into(),
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn state(&self) -> MutexGuard<'_, QueueState<K>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Marks `key` as needing work. Ignored after shutdown.
    pub fn add(&self, key: K) {
        let depth = {
            let mut state = self.state();
            if state.shutting_down || state.dirty.contains(&key) {
                return;
            }
            state.dirty.insert(key.clone());
            if state.processing.contains(&key) {
                drop(state);
                metrics::record_workqueue_requeue(&self.inner.name);
                log_debug(
                    "workqueue",
                    "Key marked dirty while in flight",
                    &[("queue", &self.inner.name), ("key", &key.to_string())],
                );
                return;
            }
            state.queue.push_back(key);
            state.queue.len()
        };
        metrics::set_workqueue_depth(&self.inner.name, depth);
        self.inner.notify.notify_one();
    }

    /// Adds `key` once `delay` has elapsed.
    pub fn add_after(&self, key: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Waits for the next key. Returns `None` once the queue is shut down and
    /// every remaining key has been handed out.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let popped = {
                let mut state = self.state();
                match state.queue.pop_front() {
                    Some(key) => {
                        state.dirty.remove(&key);
                        state.processing.insert(key.clone());
                        Some((key, state.queue.len()))
                    }
                    None if state.shutting_down => return None,
                    None => None,
                }
            };

            if let Some((key, depth)) = popped {
                metrics::set_workqueue_depth(&self.inner.name, depth);
                return Some(key);
            }
            notified.await;
        }
    }

    /// Ends processing of `key`, queueing it again if it was re-added meanwhile.
    pub fn done(&self, key: &K) {
        let depth = {
            let mut state = self.state();
            state.processing.remove(key);
            if !state.dirty.contains(key) {
                return;
            }
            state.queue.push_back(key.clone());
            state.queue.len()
        };
        metrics::set_workqueue_depth(&self.inner.name, depth);
        self.inner.notify.notify_one();
    }

    /// Stops accepting keys and wakes every waiting worker.
    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    /// Keys waiting to be handed out, excluding those in flight.
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn queue() -> WorkQueue<String> {
        WorkQueue::new("test")
    }

    #[tokio::test]
    async fn duplicate_adds_are_collapsed() {
        let queue = queue();
        queue.add("default/a".to_string());
        queue.add("default/a".to_string());
        queue.add("default/b".to_string());
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get().await.as_deref(), Some("default/a"));
        assert_eq!(queue.get().await.as_deref(), Some("default/b"));
    }

    #[tokio::test]
    async fn key_added_while_processing_is_requeued_once_after_done() {
        let queue = queue();
        queue.add("default/a".to_string());
        let key = queue.get().await.expect("key");

        queue.add(key.clone());
        queue.add(key.clone());
        assert_eq!(queue.len(), 0, "in-flight key must not be handed out");

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some(key.clone()));
        queue.done(&key);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn get_blocks_until_add() {
        let queue = queue();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.add("default/late".to_string());

        let key = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter timed out")
            .expect("join");
        assert_eq!(key.as_deref(), Some("default/late"));
    }

    #[tokio::test]
    async fn shutdown_wakes_all_waiters() {
        let queue = queue();
        let mut waiters = Vec::new();
        for _ in 0..3 {
            let queue = queue.clone();
            waiters.push(tokio::spawn(async move { queue.get().await }));
        }
        tokio::task::yield_now().await;
        queue.shut_down();

        for waiter in waiters {
            let result = timeout(Duration::from_secs(1), waiter)
                .await
                .expect("waiter timed out")
                .expect("join");
            assert!(result.is_none());
        }
        queue.add("default/ignored".to_string());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn shutdown_drains_remaining_keys_first() {
        let queue = queue();
        queue.add("default/a".to_string());
        queue.shut_down();
        assert_eq!(queue.get().await.as_deref(), Some("default/a"));
        assert!(queue.get().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_delays_the_key() {
        let queue = queue();
        queue.add_after("default/a".to_string(), Duration::from_millis(100));
        tokio::task::yield_now().await;
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(queue.len(), 1);
    }
}
