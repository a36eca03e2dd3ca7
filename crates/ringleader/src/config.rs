//! Broker tuning.

use std::time::Duration;

use tracing::warn;

/// Heartbeat cadence and tolerance for the broker's liveness engine.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Interval between broker heartbeats to idle workers; also paces the
    /// event-loop timer.
    pub heartbeat_interval: Duration,
    /// Missed heartbeats tolerated before a worker is purged.
    pub liveness: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: ringproto::mdp::HEARTBEAT_INTERVAL,
            liveness: ringproto::mdp::HEARTBEAT_LIVENESS,
        }
    }
}

impl BrokerConfig {
    /// Defaults, overridden by `RINGLEADER_HEARTBEAT_IVL_MS` and
    /// `RINGLEADER_LIVENESS` where set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = read_env("RINGLEADER_HEARTBEAT_IVL_MS") {
            config.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(liveness) = read_env("RINGLEADER_LIVENESS") {
            config.liveness = liveness;
        }
        config
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_liveness(mut self, liveness: u32) -> Self {
        self.liveness = liveness;
        self
    }

    /// Silence window after which a worker is presumed dead.
    pub fn heartbeat_expiry(&self) -> Duration {
        self.heartbeat_interval * self.liveness
    }
}

fn read_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(var = name, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}
