use serde::Deserialize;
use serde_with::serde_as;
use std::time::Duration;

#[serde_as]
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct EngineSettings {
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub chart_mutex_timeout: Duration,
    pub startup: StartupSettings,
    pub deferred_events: DeferredEventSettings,
    pub shutdown: ShutdownSettings,
    pub machine: MachineSettings,
    pub journal: JournalSettings,
}

#[serde_as]
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct StartupSettings {
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub adoption_frequency: Duration,
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub grace_period: Duration,
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub death_note_polling_frequency: Duration,
}

#[serde_as]
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct DeferredEventSettings {
    pub batch_size: u64,
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub interval: Duration,
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub look_ahead: Duration,
}

#[serde_as]
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct ShutdownSettings {
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub own_chart_polling_frequency: Duration,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct MachineSettings {
    pub cache_size: usize,
}

#[serde_as]
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct JournalSettings {
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub polling_frequency: Duration,
}

fn default_chart_mutex_timeout() -> Duration {
    Duration::from_millis(2000)
}

fn default_adoption_frequency() -> Duration {
    Duration::from_millis(2000)
}

fn default_grace_period() -> Duration {
    Duration::from_millis(30_000)
}

fn default_death_note_polling_frequency() -> Duration {
    Duration::from_millis(500)
}

fn default_batch_size() -> u64 {
    100
}

fn default_interval() -> Duration {
    Duration::from_millis(30_000)
}

fn default_look_ahead() -> Duration {
    Duration::from_millis(30_000)
}

fn default_own_chart_polling_frequency() -> Duration {
    Duration::from_millis(500)
}

fn default_cache_size() -> usize {
    1000
}

fn default_journal_polling_frequency() -> Duration {
    Duration::from_millis(500)
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            chart_mutex_timeout: default_chart_mutex_timeout(),
            startup: StartupSettings::default(),
            deferred_events: DeferredEventSettings::default(),
            shutdown: ShutdownSettings::default(),
            machine: MachineSettings::default(),
            journal: JournalSettings::default(),
        }
    }
}

impl Default for StartupSettings {
    fn default() -> Self {
        Self {
            adoption_frequency: default_adoption_frequency(),
            grace_period: default_grace_period(),
            death_note_polling_frequency: default_death_note_polling_frequency(),
        }
    }
}

impl Default for DeferredEventSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            interval: default_interval(),
            look_ahead: default_look_ahead(),
        }
    }
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            own_chart_polling_frequency: default_own_chart_polling_frequency(),
        }
    }
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            cache_size: default_cache_size(),
        }
    }
}

impl Default for JournalSettings {
    fn default() -> Self {
        Self {
            polling_frequency: default_journal_polling_frequency(),
        }
    }
}

impl EngineSettings {
    /// Enforces the documented minimum for every option. Out-of-range values
    /// are raised to the minimum rather than rejected.
    pub fn clamped(mut self) -> Self {
        self.chart_mutex_timeout = self.chart_mutex_timeout.max(Duration::from_millis(50));
        self.startup.adoption_frequency = self
            .startup
            .adoption_frequency
            .max(Duration::from_millis(10));
        // grace period must cover at least a couple of adoption passes
        self.startup.grace_period = self
            .startup
            .grace_period
            .max(self.startup.adoption_frequency.mul_f64(2.5));
        self.startup.death_note_polling_frequency = self
            .startup
            .death_note_polling_frequency
            .max(Duration::from_millis(50));
        self.deferred_events.batch_size = self.deferred_events.batch_size.max(1);
        self.deferred_events.interval = self.deferred_events.interval.max(Duration::from_millis(50));
        self.deferred_events.look_ahead = self
            .deferred_events
            .look_ahead
            .max(self.deferred_events.interval);
        self.shutdown.own_chart_polling_frequency = self
            .shutdown
            .own_chart_polling_frequency
            .max(Duration::from_millis(50));
        self.machine.cache_size = self.machine.cache_size.max(10);
        self.journal.polling_frequency = self
            .journal
            .polling_frequency
            .max(Duration::from_millis(50));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_documentation() {
        let settings = EngineSettings::default();
        assert_eq!(settings.chart_mutex_timeout, Duration::from_millis(2000));
        assert_eq!(
            settings.startup.adoption_frequency,
            Duration::from_millis(2000)
        );
        assert_eq!(settings.startup.grace_period, Duration::from_millis(30_000));
        assert_eq!(settings.deferred_events.batch_size, 100);
        assert_eq!(
            settings.deferred_events.interval,
            Duration::from_millis(30_000)
        );
        assert_eq!(
            settings.deferred_events.look_ahead,
            Duration::from_millis(30_000)
        );
        assert_eq!(
            settings.shutdown.own_chart_polling_frequency,
            Duration::from_millis(500)
        );
        assert_eq!(settings.machine.cache_size, 1000);
    }

    #[test]
    fn clamping_raises_out_of_range_values() {
        let settings: EngineSettings = serde_json::from_value::<EngineSettings>(serde_json::json!({
            "chart_mutex_timeout": 1,
            "startup": {
                "adoption_frequency": 100,
                "grace_period": 120,
            },
            "deferred_events": {
                "batch_size": 0,
                "interval": 10,
                "look_ahead": 5,
            },
            "machine": { "cache_size": 2 },
        }))
        .unwrap()
        .clamped();

        assert_eq!(settings.chart_mutex_timeout, Duration::from_millis(50));
        assert_eq!(settings.startup.grace_period, Duration::from_millis(250));
        assert_eq!(settings.deferred_events.batch_size, 1);
        assert_eq!(settings.deferred_events.interval, Duration::from_millis(50));
        // look-ahead never undercuts the interval
        assert_eq!(
            settings.deferred_events.look_ahead,
            Duration::from_millis(50)
        );
        assert_eq!(settings.machine.cache_size, 10);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let settings: EngineSettings =
            serde_json::from_value(serde_json::json!({"machine": {"cache_size": 50}})).unwrap();
        assert_eq!(settings.machine.cache_size, 50);
        assert_eq!(settings.chart_mutex_timeout, Duration::from_millis(2000));
    }
}
