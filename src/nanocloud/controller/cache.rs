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

//! In-memory mirror of a watched collection. The informer task is the only
//! writer; reconcilers read through cheap clones of the handle.

use crate::nanocloud::k8s::pod::{ObjectMeta, Pod};
use crate::nanocloud::k8s::replicaset::ReplicaSet;
use crate::nanocloud::k8s::selector::Selector;
use crate::nanocloud::k8s::store::{meta_key, normalize_namespace, KeyError, ObjectKey};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Objects that can be mirrored by a [`WatchCache`].
pub trait CacheObject: Clone + Send + Sync + 'static {
    fn metadata(&self) -> &ObjectMeta;

    fn key(&self) -> Result<ObjectKey, KeyError> {
        meta_key(self.metadata())
    }
}

impl CacheObject for Pod {
    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
}

impl CacheObject for ReplicaSet {
    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
}

#[derive(Clone)]
pub struct WatchCache<T> {
    inner: Arc<CacheInner<T>>,
}

struct CacheInner<T> {
    state: RwLock<CacheState<T>>,
    synced: AtomicBool,
}

struct CacheState<T> {
    items: HashMap<ObjectKey, T>,
    by_namespace: HashMap<String, BTreeSet<ObjectKey>>,
}

impl<T> CacheState<T> {
    fn index(&mut self, key: &ObjectKey, namespace: String) {
        self.by_namespace
            .entry(namespace)
            .or_default()
            .insert(key.clone());
    }

    fn unindex(&mut self, key: &ObjectKey, namespace: &str) {
        if let Some(keys) = self.by_namespace.get_mut(namespace) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_namespace.remove(namespace);
            }
        }
    }
}

impl<T: CacheObject> Default for WatchCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: CacheObject> WatchCache<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CacheInner {
                state: RwLock::new(CacheState {
                    items: HashMap::new(),
                    by_namespace: HashMap::new(),
                }),
                synced: AtomicBool::new(false),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState<T>> {
        self.inner
            .state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState<T>> {
        self.inner
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Inserts or replaces an object, returning the previous version.
    pub fn upsert(&self, object: T) -> Result<Option<T>, KeyError> {
        let key = object.key()?;
        let namespace = normalize_namespace(object.metadata().namespace.as_deref());
        let mut state = self.write();
        state.index(&key, namespace);
        Ok(state.items.insert(key, object))
    }

    /// Removes an object by key. Unknown keys are ignored.
    pub fn remove(&self, key: &str) -> Option<T> {
        let mut state = self.write();
        let removed = state.items.remove(key)?;
        let namespace = normalize_namespace(removed.metadata().namespace.as_deref());
        state.unindex(&key.to_string(), &namespace);
        Some(removed)
    }

    /// Swaps the full content for a fresh list and returns what was cached
    /// before. Objects without a usable key are skipped. Marks the cache synced.
    pub fn replace(&self, objects: Vec<T>) -> HashMap<ObjectKey, T> {
        let mut fresh = CacheState {
            items: HashMap::with_capacity(objects.len()),
            by_namespace: HashMap::new(),
        };
        for object in objects {
            if let Ok(key) = object.key() {
                let namespace = normalize_namespace(object.metadata().namespace.as_deref());
                fresh.index(&key, namespace);
                fresh.items.insert(key, object);
            }
        }

        let previous = {
            let mut state = self.write();
            std::mem::replace(&mut *state, fresh)
        };
        self.mark_synced();
        previous.items
    }

    pub fn get_by_key(&self, key: &str) -> Option<T> {
        self.read().items.get(key).cloned()
    }

    /// Every cached object whose labels satisfy `selector`.
    pub fn list(&self, selector: &Selector) -> Vec<T> {
        self.read()
            .items
            .values()
            .filter(|object| selector.matches(&object.metadata().labels))
            .cloned()
            .collect()
    }

    /// Objects in `namespace` whose labels satisfy `selector`, in key order.
    pub fn list_namespace(&self, namespace: &str, selector: &Selector) -> Vec<T> {
        let state = self.read();
        let Some(keys) = state.by_namespace.get(namespace) else {
            return Vec::new();
        };
        keys.iter()
            .filter_map(|key| state.items.get(key))
            .filter(|object| selector.matches(&object.metadata().labels))
            .cloned()
            .collect()
    }

    pub fn list_all(&self) -> Vec<T> {
        self.read().items.values().cloned().collect()
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<ObjectKey> = self.read().items.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once the first full list has been applied.
    pub fn has_synced(&self) -> bool {
        self.inner.synced.load(Ordering::Acquire)
    }

    pub fn mark_synced(&self) {
        self.inner.synced.store(true, Ordering::Release);
    }
}
