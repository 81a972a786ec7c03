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

//! Bookkeeping of creations and deletions a controller has issued but not yet
//! seen reflected in its watch cache. A key with outstanding expectations is
//! not reconciled again until the informer catches up or the record goes
//! stale.

use crate::nanocloud::k8s::store::ObjectKey;
use crate::nanocloud::logger::{log_debug, log_info};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

const COMPONENT: &str = "expectations";

/// Default age after which an unmet expectation stops blocking a sync.
pub const DEFAULT_EXPECTATIONS_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Outstanding expectations for one controlled object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlleeExpectations {
    adds: i64,
    dels: i64,
    timestamp: Instant,
}

impl ControlleeExpectations {
    fn new(adds: i64, dels: i64) -> Self {
        Self {
            adds,
            dels,
            timestamp: Instant::now(),
        }
    }

    pub fn adds(&self) -> i64 {
        self.adds
    }

    pub fn dels(&self) -> i64 {
        self.dels
    }

    /// When the expectation was last set.
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    pub fn fulfilled(&self) -> bool {
        self.adds <= 0 && self.dels <= 0
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.timestamp.elapsed() > timeout
    }

    fn lower(&mut self, adds: i64, dels: i64) {
        self.adds = (self.adds - adds).max(0);
        self.dels = (self.dels - dels).max(0);
    }
}

/// Per-key expectation records shared by a controller and its event handlers.
pub struct ExpectationsLedger {
    records: Mutex<HashMap<ObjectKey, ControlleeExpectations>>,
    timeout: Duration,
}

impl Default for ExpectationsLedger {
    fn default() -> Self {
        Self::new(DEFAULT_EXPECTATIONS_TIMEOUT)
    }
}

impl ExpectationsLedger {
    pub fn new(timeout: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn records(&self) -> MutexGuard<'_, HashMap<ObjectKey, ControlleeExpectations>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records that `count` creations are in flight, replacing any earlier record.
    pub fn expect_creations(&self, key: &str, count: usize) {
        self.set_expectations(key, count, 0);
    }

    /// Records that `count` deletions are in flight, replacing any earlier record.
    pub fn expect_deletions(&self, key: &str, count: usize) {
        self.set_expectations(key, 0, count);
    }

    fn set_expectations(&self, key: &str, adds: usize, dels: usize) {
        let adds = i64::try_from(adds).unwrap_or(i64::MAX);
        let dels = i64::try_from(dels).unwrap_or(i64::MAX);
        self.records()
            .insert(key.to_string(), ControlleeExpectations::new(adds, dels));
    }

    pub fn creation_observed(&self, key: &str) {
        self.lower_expectations(key, 1, 0);
    }

    pub fn deletion_observed(&self, key: &str) {
        self.lower_expectations(key, 0, 1);
    }

    fn lower_expectations(&self, key: &str, adds: i64, dels: i64) {
        let mut records = self.records();
        if let Some(record) = records.get_mut(key) {
            record.lower(adds, dels);
            log_debug(
                COMPONENT,
                "Lowered expectations",
                &[
                    ("key", key),
                    ("adds", &record.adds.to_string()),
                    ("dels", &record.dels.to_string()),
                ],
            );
        }
    }

    /// True when a sync of `key` may mutate children: there is no record,
    /// every expected event has been observed, or the record went stale.
    pub fn satisfied_expectations(&self, key: &str) -> bool {
        let records = self.records();
        let Some(record) = records.get(key) else {
            return true;
        };
        if record.fulfilled() {
            return true;
        }
        if record.is_expired(self.timeout) {
            log_info(
                COMPONENT,
                "Expectations expired; allowing sync",
                &[
                    ("key", key),
                    ("adds", &record.adds.to_string()),
                    ("dels", &record.dels.to_string()),
                ],
            );
            return true;
        }
        log_debug(
            COMPONENT,
            "Controller still waiting on expectations",
            &[
                ("key", key),
                ("adds", &record.adds.to_string()),
                ("dels", &record.dels.to_string()),
            ],
        );
        false
    }

    pub fn delete_expectations(&self, key: &str) {
        self.records().remove(key);
    }

    pub fn get_expectations(&self, key: &str) -> Option<ControlleeExpectations> {
        self.records().get(key).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "default/web";

    #[test]
    fn missing_record_is_satisfied() {
        let ledger = ExpectationsLedger::default();
        assert!(ledger.satisfied_expectations(KEY));
        ledger.creation_observed(KEY);
        assert!(ledger.get_expectations(KEY).is_none());
    }

    #[tokio::test]
    async fn creations_block_until_observed() {
        let ledger = ExpectationsLedger::default();
        ledger.expect_creations(KEY, 2);
        assert!(!ledger.satisfied_expectations(KEY));

        ledger.creation_observed(KEY);
        assert!(!ledger.satisfied_expectations(KEY));
        ledger.creation_observed(KEY);
        assert!(ledger.satisfied_expectations(KEY));
    }

    #[tokio::test]
    async fn counters_floor_at_zero() {
        let ledger = ExpectationsLedger::default();
        ledger.expect_deletions(KEY, 1);
        ledger.deletion_observed(KEY);
        ledger.deletion_observed(KEY);
        let record = ledger.get_expectations(KEY).expect("record");
        assert_eq!((record.adds(), record.dels()), (0, 0));

        // Overshoot must not pre-pay the next round.
        ledger.expect_deletions(KEY, 1);
        assert!(!ledger.satisfied_expectations(KEY));
    }

    #[tokio::test]
    async fn setting_expectations_overwrites_previous_record() {
        let ledger = ExpectationsLedger::default();
        ledger.expect_creations(KEY, 3);
        ledger.expect_deletions(KEY, 2);
        let record = ledger.get_expectations(KEY).expect("record");
        assert_eq!((record.adds(), record.dels()), (0, 2));
    }

    #[tokio::test]
    async fn failed_operation_compensation_nets_to_zero() {
        let ledger = ExpectationsLedger::default();
        ledger.expect_creations(KEY, 1);
        ledger.creation_observed(KEY);
        assert!(ledger.satisfied_expectations(KEY));
        assert!(ledger.get_expectations(KEY).expect("record").fulfilled());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_expectations_release_the_key() {
        let ledger = ExpectationsLedger::new(Duration::from_secs(60));
        ledger.expect_creations(KEY, 5);
        assert!(!ledger.satisfied_expectations(KEY));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!ledger.satisfied_expectations(KEY));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(ledger.satisfied_expectations(KEY));
    }

    #[tokio::test]
    async fn delete_removes_the_record() {
        let ledger = ExpectationsLedger::default();
        ledger.expect_creations(KEY, 1);
        ledger.delete_expectations(KEY);
        assert!(ledger.get_expectations(KEY).is_none());
        assert!(ledger.satisfied_expectations(KEY));
    }
}
