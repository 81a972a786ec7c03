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

use crate::nanocloud::logger::{set_log_format, LogFormat};
use std::env;
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

/// Enum for supported configuration parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Config {
    ControllerWorkers,
    BurstReplicas,
    ExpectationsTimeout,
    ResyncPeriod,
    PodStoreSyncPoll,
    LogFormat,
}

impl Config {
    pub const ALL: [Config; 6] = [
        Config::ControllerWorkers,
        Config::BurstReplicas,
        Config::ExpectationsTimeout,
        Config::ResyncPeriod,
        Config::PodStoreSyncPoll,
        Config::LogFormat,
    ];

    /// Returns the associated environment variable for the config parameter.
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::ControllerWorkers => "NANOCLOUD_CONTROLLER_WORKERS",
            Config::BurstReplicas => "NANOCLOUD_BURST_REPLICAS",
            Config::ExpectationsTimeout => "NANOCLOUD_EXPECTATIONS_TIMEOUT",
            Config::ResyncPeriod => "NANOCLOUD_RESYNC_PERIOD",
            Config::PodStoreSyncPoll => "NANOCLOUD_POD_STORE_SYNC_POLL",
            Config::LogFormat => "NANOCLOUD_LOG_FORMAT",
        }
    }

    /// Returns the default used when the environment variable is unset.
    pub fn default_value(&self) -> &'static str {
        match self {
            Config::ControllerWorkers => "5",
            Config::BurstReplicas => "500",
            Config::ExpectationsTimeout => "5m",
            Config::ResyncPeriod => "30s",
            Config::PodStoreSyncPoll => "100ms",
            Config::LogFormat => "text",
        }
    }

    /// Returns the effective value, either from environment or default.
    pub fn get(&self) -> String {
        env::var(self.env_var())
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| self.default_value().to_string())
    }

    fn get_usize(&self) -> Result<usize, ConfigError> {
        let raw = self.get();
        match raw.parse::<usize>() {
            Ok(value) if value > 0 => Ok(value),
            _ => Err(ConfigError::new(*self, raw, "expected a positive integer")),
        }
    }

    fn get_duration(&self) -> Result<Duration, ConfigError> {
        let raw = self.get();
        match humantime::parse_duration(&raw) {
            Ok(value) if !value.is_zero() => Ok(value),
            Ok(_) => Err(ConfigError::new(*self, raw, "duration must be non-zero")),
            Err(err) => {
                let reason = err.to_string();
                Err(ConfigError::new(*self, raw, reason))
            }
        }
    }
}

/// Effective controller-manager settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSettings {
    /// Number of queue workers per controller.
    pub workers: usize,
    /// Upper bound on creates or deletes issued by one reconciliation cycle.
    pub burst_replicas: usize,
    /// Age after which unmet expectations stop blocking reconciliation.
    pub expectations_timeout: Duration,
    /// Interval at which every known object is re-enqueued.
    pub resync_period: Duration,
    /// Delay before re-checking a pod cache that has not finished its first list.
    pub pod_store_sync_poll: Duration,
    pub log_format: LogFormat,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            workers: 5,
            burst_replicas: 500,
            expectations_timeout: Duration::from_secs(5 * 60),
            resync_period: Duration::from_secs(30),
            pod_store_sync_poll: Duration::from_millis(100),
            log_format: LogFormat::Text,
        }
    }
}

impl ControllerSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let log_format_raw = Config::LogFormat.get();
        let log_format = LogFormat::parse(&log_format_raw).ok_or_else(|| {
            ConfigError::new(Config::LogFormat, log_format_raw.clone(), "expected text or json")
        })?;

        Ok(Self {
            workers: Config::ControllerWorkers.get_usize()?,
            burst_replicas: Config::BurstReplicas.get_usize()?,
            expectations_timeout: Config::ExpectationsTimeout.get_duration()?,
            resync_period: Config::ResyncPeriod.get_duration()?,
            pod_store_sync_poll: Config::PodStoreSyncPoll.get_duration()?,
            log_format,
        })
    }

    /// Switches the process-wide logger to the configured format.
    pub fn apply_logging(&self) {
        set_log_format(self.log_format);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub config: Config,
    pub value: String,
    pub reason: String,
}

impl ConfigError {
    fn new(config: Config, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            config,
            value: value.into(),
            reason: reason.into(),
        }
    }
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid value '{}' for {}: {}",
            self.value,
            self.config.env_var(),
            self.reason
        )
    }
}

impl Error for ConfigError {}
