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

//! Seams between the ReplicaSet controller and the systems it drives: the
//! backend that creates and deletes pods, and the sink that stores status.

use crate::nanocloud::k8s::pod::{ObjectMeta, OwnerReference, Pod};
use crate::nanocloud::k8s::replicaset::{PodTemplateSpec, ReplicaSet, ReplicaSetStatus};
use crate::nanocloud::k8s::store::normalize_namespace;
use crate::nanocloud::util::error::BoxError;
use futures_util::future::BoxFuture;
use std::error::Error;
use std::fmt::{self, Display, Formatter};

/// Everything the backend needs to start one replica.
#[derive(Debug, Clone, PartialEq)]
pub struct PodCreateRequest {
    pub namespace: String,
    pub name: String,
    pub template: PodTemplateSpec,
    pub owner: OwnerReference,
}

impl PodCreateRequest {
    /// Stamps a request for `name` out of the ReplicaSet's template.
    pub fn for_replica_set(rs: &ReplicaSet, name: String) -> Self {
        Self {
            namespace: normalize_namespace(rs.metadata.namespace.as_deref()),
            name,
            template: rs.spec.template.clone(),
            owner: owner_reference(rs),
        }
    }

    /// The pod object the request describes. Template labels and annotations
    /// are carried over and the owner is attached as controller.
    pub fn to_pod(&self) -> Pod {
        let template_meta = &self.template.metadata;
        let metadata = ObjectMeta {
            name: Some(self.name.clone()),
            namespace: Some(self.namespace.clone()),
            labels: template_meta.labels.clone(),
            annotations: template_meta.annotations.clone(),
            owner_references: vec![self.owner.clone()],
            ..Default::default()
        };
        Pod::new(metadata, self.template.spec.clone())
    }
}

pub fn owner_reference(rs: &ReplicaSet) -> OwnerReference {
    OwnerReference {
        api_version: rs.api_version.clone(),
        kind: rs.kind.clone(),
        name: rs.metadata.name_or_empty().to_string(),
        uid: rs.metadata.uid.clone().unwrap_or_default(),
        controller: true,
    }
}

/// Backend that turns pod requests into running workloads.
pub trait PodControl: Send + Sync {
    fn create_pod(&self, request: PodCreateRequest) -> BoxFuture<'_, Result<(), PodControlError>>;

    /// Deleting a pod that is already gone must report success.
    fn delete_pod<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
        owner: &'a OwnerReference,
    ) -> BoxFuture<'a, Result<(), PodControlError>>;
}

#[derive(Debug)]
pub enum PodControlError {
    NotFound { namespace: String, name: String },
    Rejected(String),
    Unavailable(BoxError),
}

impl Display for PodControlError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PodControlError::NotFound { namespace, name } => {
                write!(f, "pod {namespace}/{name} not found")
            }
            PodControlError::Rejected(reason) => write!(f, "request rejected: {reason}"),
            PodControlError::Unavailable(err) => write!(f, "backend unavailable: {err}"),
        }
    }
}

impl Error for PodControlError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PodControlError::Unavailable(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

/// Persists the status a ReplicaSet controller computed.
pub trait ReplicaSetStatusSink: Send + Sync {
    fn update_status<'a>(
        &'a self,
        key: &'a str,
        status: &'a ReplicaSetStatus,
    ) -> BoxFuture<'a, Result<(), StatusError>>;
}

#[derive(Debug)]
pub enum StatusError {
    /// The stored object changed underneath the update.
    Conflict(String),
    Unavailable(BoxError),
}

impl Display for StatusError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StatusError::Conflict(key) => write!(f, "status update conflict for {key}"),
            StatusError::Unavailable(err) => write!(f, "status backend unavailable: {err}"),
        }
    }
}

impl Error for StatusError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StatusError::Unavailable(err) => Some(err.as_ref()),
            StatusError::Conflict(_) => None,
        }
    }
}
