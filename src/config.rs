use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{MonitorError, MonitorResult};

/// How a manual (SOS) cycle turns a fused decision into an outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualTriggerPolicy {
    /// Any decision obtained for a manual cycle ends in an alert
    ForceAlert,
    /// Alert when the service says so or the fused score reaches `manual_score_threshold`
    ScoreThreshold,
    /// Same rule as motion-triggered cycles
    FollowDecision,
}

impl std::str::FromStr for ManualTriggerPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "force_alert" | "force" => Ok(Self::ForceAlert),
            "score_threshold" | "threshold" => Ok(Self::ScoreThreshold),
            "follow_decision" | "follow" => Ok(Self::FollowDecision),
            other => Err(format!("unknown manual trigger policy: {other}")),
        }
    }
}

/// Process-wide settings, read-only once the host has started.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Magnitude (m/s^2) a sample must strictly exceed to open a cycle
    pub trigger_threshold: f64,
    pub sample_interval_ms: u64,
    pub capture_duration_ms: u64,
    /// Extra time a recording may take beyond `capture_duration_ms` before it counts as stuck
    pub capture_slack_ms: u64,
    pub network_timeout_ms: u64,

    pub endpoint: String,
    pub auth_token: Option<String>,

    pub manual_trigger_policy: ManualTriggerPolicy,
    pub manual_score_threshold: f64,

    pub audio_sample_rate: u32,

    // Sensor supervision
    pub sensor_silence_ms: u64,
    pub max_sensor_restarts: u32,
    pub restart_base_cooldown_ms: u64,

    pub status_interval_ms: u64,
    /// None = capture window + slack + network timeout
    pub shutdown_grace_ms: Option<u64>,
    pub output_dir: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            trigger_threshold: 15.0,
            sample_interval_ms: 200,
            capture_duration_ms: 3000,
            capture_slack_ms: 500,
            network_timeout_ms: 10_000,
            endpoint: "http://127.0.0.1:8000".to_string(),
            auth_token: None,
            manual_trigger_policy: ManualTriggerPolicy::ForceAlert,
            manual_score_threshold: 0.5,
            audio_sample_rate: 16_000,
            sensor_silence_ms: 5000,
            max_sensor_restarts: 60,
            restart_base_cooldown_ms: 2000,
            status_interval_ms: 2000,
            shutdown_grace_ms: None,
            output_dir: "safety_monitor_sessions".to_string(),
        }
    }
}

impl ServiceConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: ServiceConfig = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> MonitorResult<()> {
        if !self.trigger_threshold.is_finite() || self.trigger_threshold <= 0.0 {
            return Err(MonitorError::InvalidConfig(format!(
                "trigger_threshold must be positive, got {}",
                self.trigger_threshold
            )));
        }
        if self.sample_interval_ms == 0 {
            return Err(MonitorError::InvalidConfig(
                "sample_interval_ms must be > 0".to_string(),
            ));
        }
        if self.capture_duration_ms == 0 {
            return Err(MonitorError::InvalidConfig(
                "capture_duration_ms must be > 0".to_string(),
            ));
        }
        if !(1000..=60_000).contains(&self.network_timeout_ms) {
            return Err(MonitorError::InvalidConfig(format!(
                "network_timeout_ms must be within 1000..=60000, got {}",
                self.network_timeout_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.manual_score_threshold) {
            return Err(MonitorError::InvalidConfig(format!(
                "manual_score_threshold must be within [0, 1], got {}",
                self.manual_score_threshold
            )));
        }
        if self.audio_sample_rate == 0 {
            return Err(MonitorError::InvalidConfig(
                "audio_sample_rate must be > 0".to_string(),
            ));
        }
        if self.endpoint.trim().is_empty() {
            return Err(MonitorError::InvalidConfig("endpoint is empty".to_string()));
        }
        Ok(())
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn capture_duration(&self) -> Duration {
        Duration::from_millis(self.capture_duration_ms)
    }

    pub fn capture_slack(&self) -> Duration {
        Duration::from_millis(self.capture_slack_ms)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    pub fn sensor_silence(&self) -> Duration {
        Duration::from_millis(self.sensor_silence_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        let ms = self.shutdown_grace_ms.unwrap_or(
            self.capture_duration_ms + self.capture_slack_ms + self.network_timeout_ms,
        );
        Duration::from_millis(ms)
    }
}
