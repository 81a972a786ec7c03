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

//! Object key helpers shared by the caches, the work queue, and the
//! controllers. Keys take the form `<namespace>/<name>`.

use super::pod::ObjectMeta;
use std::error::Error;
use std::fmt::{self, Display, Formatter};

pub const DEFAULT_NAMESPACE: &str = "default";

/// Stable identifier for a namespaced object.
pub type ObjectKey = String;

pub fn normalize_namespace(namespace: Option<&str>) -> String {
    namespace
        .filter(|ns| !ns.is_empty())
        .unwrap_or(DEFAULT_NAMESPACE)
        .to_string()
}

pub fn object_key(namespace: Option<&str>, name: &str) -> ObjectKey {
    format!("{}/{}", normalize_namespace(namespace), name)
}

/// Derives the key for an object, failing when it carries no name.
pub fn meta_key(metadata: &ObjectMeta) -> Result<ObjectKey, KeyError> {
    match metadata.name.as_deref() {
        Some(name) if !name.is_empty() => Ok(object_key(metadata.namespace.as_deref(), name)),
        _ => Err(KeyError::MissingName),
    }
}

/// Splits a key back into `(namespace, name)`.
pub fn split_key(key: &str) -> Result<(String, String), KeyError> {
    let mut parts = key.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(namespace), Some(name), None) if !name.is_empty() => {
            Ok((normalize_namespace(Some(namespace)), name.to_string()))
        }
        _ => Err(KeyError::Malformed(key.to_string())),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    MissingName,
    Malformed(String),
}

impl Display for KeyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            KeyError::MissingName => write!(f, "object has no name"),
            KeyError::Malformed(key) => write!(f, "malformed object key '{}'", key),
        }
    }
}

impl Error for KeyError {}
