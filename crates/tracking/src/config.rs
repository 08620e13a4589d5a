//! Engine configuration read from the environment.

use std::env;
use std::time::Duration;

use realtime::GeoPoint;

/// Engine configuration derived from the host environment.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub staleness_window: Duration,
    pub reap_interval: Duration,
    pub fanout_capacity: usize,
    pub sync: SyncConfig,
    pub simulator: SimulatorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            staleness_window: Duration::from_secs(5 * 60),
            reap_interval: Duration::from_secs(60),
            fanout_capacity: 16,
            sync: SyncConfig::default(),
            simulator: SimulatorConfig::default(),
        }
    }
}

impl Config {
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup, falling back to
    /// the defaults for missing or unparsable values.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let env = Env(&lookup);

        Self {
            staleness_window: env.secs("STALENESS_WINDOW_SECS", defaults.staleness_window),
            reap_interval: env.secs("REAP_INTERVAL_SECS", defaults.reap_interval),
            fanout_capacity: env.usize("FANOUT_CAPACITY", defaults.fanout_capacity).max(1),
            sync: SyncConfig::from_env(&env, defaults.sync),
            simulator: SimulatorConfig::from_env(&env, defaults.simulator),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub interval: Duration,
    pub concurrency: usize,
    pub upsert_timeout: Duration,
    pub speed_annotation: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            concurrency: 8,
            upsert_timeout: Duration::from_secs(5),
            speed_annotation: true,
        }
    }
}

impl SyncConfig {
    fn from_env(env: &Env<'_>, defaults: Self) -> Self {
        Self {
            interval: env.secs("SYNC_INTERVAL_SECS", defaults.interval),
            concurrency: env.usize("SYNC_CONCURRENCY", defaults.concurrency).max(1),
            upsert_timeout: env.secs("SYNC_UPSERT_TIMEOUT_SECS", defaults.upsert_timeout),
            speed_annotation: env.bool("SYNC_SPEED_ANNOTATION", defaults.speed_annotation),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulatorConfig {
    pub tick: Duration,
    pub dwell_min: Duration,
    pub dwell_max: Duration,
    pub speed_min_mph: f64,
    pub speed_max_mph: f64,
    pub arrival_epsilon_km: f64,
    pub bounds: Bounds,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            dwell_min: Duration::from_secs(2),
            dwell_max: Duration::from_secs(3),
            speed_min_mph: 20.0,
            speed_max_mph: 60.0,
            arrival_epsilon_km: 0.01,
            bounds: Bounds::default(),
        }
    }
}

impl SimulatorConfig {
    fn from_env(env: &Env<'_>, defaults: Self) -> Self {
        let dwell_min = env.millis("SIM_DWELL_MIN_MILLIS", defaults.dwell_min);
        let dwell_max = env.millis("SIM_DWELL_MAX_MILLIS", defaults.dwell_max).max(dwell_min);
        let speed_min_mph = env.f64("SIM_SPEED_MIN_MPH", defaults.speed_min_mph).max(0.0);
        let speed_max_mph = env.f64("SIM_SPEED_MAX_MPH", defaults.speed_max_mph).max(speed_min_mph);

        Self {
            tick: env.millis("SIM_TICK_MILLIS", defaults.tick),
            dwell_min,
            dwell_max,
            speed_min_mph,
            speed_max_mph,
            arrival_epsilon_km: env.f64("SIM_ARRIVAL_EPSILON_KM", defaults.arrival_epsilon_km),
            bounds: defaults.bounds,
        }
    }
}

/// Rectangular area random simulator start points are drawn from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min: GeoPoint,
    pub max: GeoPoint,
}

impl Default for Bounds {
    // greater Atlanta, downtown to the suburbs
    fn default() -> Self {
        Self {
            min: GeoPoint { lat: 33.6490, lng: -84.5880 },
            max: GeoPoint { lat: 33.8490, lng: -84.2880 },
        }
    }
}

struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    fn parse<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        (self.0)(key).and_then(|value| value.trim().parse::<T>().ok())
    }

    fn bool(&self, key: &str, default: bool) -> bool {
        (self.0)(key)
            .map(|value| matches!(value.to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(default)
    }

    fn f64(&self, key: &str, default: f64) -> f64 {
        self.parse::<f64>(key).filter(|value| value.is_finite()).unwrap_or(default)
    }

    fn usize(&self, key: &str, default: usize) -> usize {
        self.parse(key).unwrap_or(default)
    }

    // zero durations fall back too: every duration here drives a timer
    fn secs(&self, key: &str, default: Duration) -> Duration {
        self.parse(key).filter(|secs| *secs > 0).map_or(default, Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        self.parse(key).filter(|millis| *millis > 0).map_or(default, Duration::from_millis)
    }
}
