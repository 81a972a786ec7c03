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

//! Label selectors as carried on ReplicaSets, and the compiled form used to
//! match pods in the watch caches.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::fmt::{self, Display, Formatter};

/// Selector as it appears on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LabelSelector {
    #[serde(
        rename = "matchLabels",
        default,
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub match_labels: HashMap<String, String>,
    #[serde(
        rename = "matchExpressions",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: SelectorOperator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

impl LabelSelector {
    pub fn from_labels<I, K, V>(labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            match_labels: labels
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            match_expressions: Vec::new(),
        }
    }

    /// Compiles the selector. An empty selector compiles to one that matches
    /// nothing so a misconfigured controller never adopts every pod in a namespace.
    pub fn to_selector(&self) -> Result<Selector, SelectorError> {
        if self.match_labels.is_empty() && self.match_expressions.is_empty() {
            return Ok(Selector::nothing());
        }

        let mut requirements = Vec::with_capacity(
            self.match_labels.len() + self.match_expressions.len(),
        );
        // BTreeMap keeps the compiled form (and its Display) stable.
        let ordered: BTreeMap<&String, &String> = self.match_labels.iter().collect();
        for (key, value) in ordered {
            validate_key(key)?;
            requirements.push(Requirement::Equals {
                key: key.clone(),
                value: value.clone(),
            });
        }

        for expression in &self.match_expressions {
            validate_key(&expression.key)?;
            let key = expression.key.clone();
            let requirement = match expression.operator {
                SelectorOperator::In | SelectorOperator::NotIn => {
                    if expression.values.is_empty() {
                        return Err(SelectorError::MissingValues { key });
                    }
                    let mut values = expression.values.clone();
                    values.sort();
                    values.dedup();
                    if matches!(expression.operator, SelectorOperator::In) {
                        Requirement::In { key, values }
                    } else {
                        Requirement::NotIn { key, values }
                    }
                }
                SelectorOperator::Exists | SelectorOperator::DoesNotExist => {
                    if !expression.values.is_empty() {
                        return Err(SelectorError::UnexpectedValues { key });
                    }
                    if matches!(expression.operator, SelectorOperator::Exists) {
                        Requirement::Exists { key }
                    } else {
                        Requirement::DoesNotExist { key }
                    }
                }
            };
            requirements.push(requirement);
        }

        Ok(Selector {
            requirements,
            matches_nothing: false,
        })
    }
}

fn validate_key(key: &str) -> Result<(), SelectorError> {
    if key.trim().is_empty() {
        Err(SelectorError::EmptyKey)
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Equals { key: String, value: String },
    In { key: String, values: Vec<String> },
    NotIn { key: String, values: Vec<String> },
    Exists { key: String },
    DoesNotExist { key: String },
}

impl Requirement {
    fn matches(&self, labels: &HashMap<String, String>) -> bool {
        match self {
            Requirement::Equals { key, value } => labels.get(key) == Some(value),
            Requirement::In { key, values } => labels
                .get(key)
                .map(|actual| values.iter().any(|v| v == actual))
                .unwrap_or(false),
            Requirement::NotIn { key, values } => labels
                .get(key)
                .map(|actual| !values.iter().any(|v| v == actual))
                .unwrap_or(true),
            Requirement::Exists { key } => labels.contains_key(key),
            Requirement::DoesNotExist { key } => !labels.contains_key(key),
        }
    }
}

impl Display for Requirement {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Requirement::Equals { key, value } => write!(f, "{}={}", key, value),
            Requirement::In { key, values } => write!(f, "{} in ({})", key, values.join(",")),
            Requirement::NotIn { key, values } => {
                write!(f, "{} notin ({})", key, values.join(","))
            }
            Requirement::Exists { key } => f.write_str(key),
            Requirement::DoesNotExist { key } => write!(f, "!{}", key),
        }
    }
}

/// Compiled selector; all requirements must hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    requirements: Vec<Requirement>,
    matches_nothing: bool,
}

impl Selector {
    /// Selector that matches every label set.
    pub fn everything() -> Self {
        Self {
            requirements: Vec::new(),
            matches_nothing: false,
        }
    }

    pub fn nothing() -> Self {
        Self {
            requirements: Vec::new(),
            matches_nothing: true,
        }
    }

    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        !self.matches_nothing && self.requirements.iter().all(|req| req.matches(labels))
    }

    pub fn is_nothing(&self) -> bool {
        self.matches_nothing
    }
}

impl Display for Selector {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.matches_nothing {
            return f.write_str("<none>");
        }
        let rendered: Vec<String> = self.requirements.iter().map(|r| r.to_string()).collect();
        f.write_str(&rendered.join(","))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorError {
    EmptyKey,
    MissingValues { key: String },
    UnexpectedValues { key: String },
}

impl Display for SelectorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SelectorError::EmptyKey => write!(f, "selector requirement has an empty key"),
            SelectorError::MissingValues { key } => {
                write!(f, "selector requirement '{}' needs at least one value", key)
            }
            SelectorError::UnexpectedValues { key } => {
                write!(f, "selector requirement '{}' must not list values", key)
            }
        }
    }
}

impl Error for SelectorError {}
