use std::env;
use std::time::Duration;

use nanocloud_controller::nanocloud::config::{Config, ControllerSettings};
use nanocloud_controller::nanocloud::logger::LogFormat;
use serial_test::serial;

struct EnvGuard {
    key: &'static str,
    previous: Option<String>,
}

impl EnvGuard {
    fn set(config: Config, value: &str) -> Self {
        let key = config.env_var();
        let previous = env::var(key).ok();
        env::set_var(key, value);
        Self { key, previous }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        match &self.previous {
            Some(value) => env::set_var(self.key, value),
            None => env::remove_var(self.key),
        }
    }
}

fn clear_all() -> Vec<EnvGuard> {
    Config::ALL
        .iter()
        .map(|config| {
            let guard = EnvGuard::set(*config, "");
            env::remove_var(config.env_var());
            guard
        })
        .collect()
}

#[test]
#[serial]
fn unset_environment_yields_defaults() {
    let _guards = clear_all();
    let settings = ControllerSettings::from_env().expect("defaults parse");
    assert_eq!(settings, ControllerSettings::default());
    assert_eq!(settings.burst_replicas, 500);
    assert_eq!(settings.expectations_timeout, Duration::from_secs(300));
}

#[test]
#[serial]
fn overrides_are_read_from_the_environment() {
    let _guards = clear_all();
    let _workers = EnvGuard::set(Config::ControllerWorkers, "12");
    let _burst = EnvGuard::set(Config::BurstReplicas, " 50 ");
    let _timeout = EnvGuard::set(Config::ExpectationsTimeout, "90s");
    let _poll = EnvGuard::set(Config::PodStoreSyncPoll, "250ms");
    let _format = EnvGuard::set(Config::LogFormat, "JSON");

    let settings = ControllerSettings::from_env().expect("overrides parse");
    assert_eq!(settings.workers, 12);
    assert_eq!(settings.burst_replicas, 50);
    assert_eq!(settings.expectations_timeout, Duration::from_secs(90));
    assert_eq!(settings.pod_store_sync_poll, Duration::from_millis(250));
    assert_eq!(settings.resync_period, Duration::from_secs(30));
    assert_eq!(settings.log_format, LogFormat::Json);
}

#[test]
#[serial]
fn blank_values_fall_back_to_defaults() {
    let _guards = clear_all();
    let _burst = EnvGuard::set(Config::BurstReplicas, "   ");
    let settings = ControllerSettings::from_env().expect("blank is unset");
    assert_eq!(settings.burst_replicas, 500);
}

#[test]
#[serial]
fn invalid_values_name_the_offending_variable() {
    let _guards = clear_all();
    let cases = [
        (Config::ControllerWorkers, "0"),
        (Config::BurstReplicas, "many"),
        (Config::ExpectationsTimeout, "soon"),
        (Config::ResyncPeriod, "0s"),
        (Config::LogFormat, "xml"),
    ];
    for (config, value) in cases {
        let _guard = EnvGuard::set(config, value);
        let err = ControllerSettings::from_env().expect_err("invalid value rejected");
        assert_eq!(err.config, config);
        assert_eq!(err.value, value);
        assert!(
            err.to_string().contains(config.env_var()),
            "{} does not mention {}",
            err,
            config.env_var()
        );
    }
}
