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

use super::pod::{ObjectMeta, Pod};
use super::replicaset::ReplicaSet;
use super::store::normalize_namespace;
use crate::nanocloud::logger::{log_info, log_warn};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectReference {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

impl ObjectReference {
    fn from_meta(kind: &str, metadata: &ObjectMeta) -> Self {
        Self {
            kind: Some(kind.to_string()),
            name: metadata.name.clone(),
            namespace: Some(normalize_namespace(metadata.namespace.as_deref())),
            uid: metadata.uid.clone(),
        }
    }

    pub fn for_pod(pod: &Pod) -> Self {
        Self::from_meta("Pod", &pod.metadata)
    }

    pub fn for_replicaset(rs: &ReplicaSet) -> Self {
        Self::from_meta("ReplicaSet", &rs.metadata)
    }

    fn describe(&self) -> String {
        format!(
            "{}/{}/{}",
            self.kind.as_deref().unwrap_or("Object"),
            self.namespace.as_deref().unwrap_or(""),
            self.name.as_deref().unwrap_or("")
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub const fn as_str(self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

/// Sink for user-facing events about managed objects.
pub trait EventRecorder: Send + Sync {
    fn record(
        &self,
        involved: &ObjectReference,
        event_type: EventType,
        reason: &str,
        message: &str,
    );
}

/// Recorder that turns every event into a structured log line.
#[derive(Debug, Default)]
pub struct LoggingEventRecorder {
    component: &'static str,
}

impl LoggingEventRecorder {
    pub fn new(component: &'static str) -> Self {
        Self { component }
    }
}

impl EventRecorder for LoggingEventRecorder {
    fn record(
        &self,
        involved: &ObjectReference,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) {
        let object = involved.describe();
        let metadata = [
            ("object", object.as_str()),
            ("type", event_type.as_str()),
            ("reason", reason),
        ];
        match event_type {
            EventType::Normal => log_info(self.component, message, &metadata),
            EventType::Warning => log_warn(self.component, message, &metadata),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    pub involved: ObjectReference,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
}

/// Recorder that retains events in memory; used by tests and diagnostics.
#[derive(Debug, Default)]
pub struct MemoryEventRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryEventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|event| event.reason).collect()
    }
}

impl EventRecorder for MemoryEventRecorder {
    fn record(
        &self,
        involved: &ObjectReference,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) {
        if let Ok(mut events) = self.events.lock() {
            events.push(RecordedEvent {
                involved: involved.clone(),
                event_type,
                reason: reason.to_string(),
                message: message.to_string(),
            });
        }
    }
}
