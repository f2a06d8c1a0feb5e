use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Instant};

/// Tracks how recently a sensor stream produced a sample.
///
/// Cloning shares the underlying timestamp, so the monitor can stamp
/// samples while the host's supervisor polls for silence.
#[derive(Clone, Debug)]
pub struct SensorHealth {
    pub name: String,
    last_update: Arc<Mutex<Instant>>,
    pub silence_threshold: Duration,
}

impl SensorHealth {
    pub fn new(name: &str, silence_threshold: Duration) -> Self {
        SensorHealth {
            name: name.to_string(),
            last_update: Arc::new(Mutex::new(Instant::now())),
            silence_threshold,
        }
    }

    pub fn update(&self) {
        if let Ok(mut time) = self.last_update.lock() {
            *time = Instant::now();
        }
    }

    pub fn time_since_last_update(&self) -> Option<Duration> {
        self.last_update.lock().ok().map(|t| t.elapsed())
    }

    pub fn is_silent(&self) -> bool {
        self.time_since_last_update()
            .map(|d| d > self.silence_threshold)
            .unwrap_or(false)
    }

    pub fn report(&self) -> HealthReport {
        HealthReport {
            healthy: !self.is_silent(),
            silence: self.time_since_last_update().unwrap_or_default(),
        }
    }

    /// Format health status for logging
    pub fn format_status(&self) -> String {
        let report = self.report();
        if report.healthy {
            format!("{} ✓", self.name)
        } else {
            format!("{} ⚠ (silent {:.1}s)", self.name, report.silence.as_secs_f64())
        }
    }
}

/// Snapshot of a sensor's health
#[derive(Clone, Copy, Debug)]
pub struct HealthReport {
    pub healthy: bool,
    pub silence: Duration,
}
