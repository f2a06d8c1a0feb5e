use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::coordinator::{CycleId, CycleState, Outcome};
use crate::sensors::current_timestamp;

/// Snapshot written to `live_status.json` for dashboards and watchdogs
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LiveStatus {
    pub timestamp: f64,
    pub uptime_seconds: u64,
    pub running: bool,
    pub foreground: bool,
    pub cycle_state: CycleState,
    // Motion monitor
    pub samples: u64,
    pub triggers_emitted: u64,
    pub triggers_refused: u64,
    // Detection cycles
    pub cycles_started: u64,
    pub emergencies: u64,
    pub clears: u64,
    pub failures: u64,
    pub cancelled: u64,
    pub triggers_dropped: u64,
    pub last_cycle_id: Option<CycleId>,
    pub last_outcome: Option<Outcome>,
    // Sensor health
    pub sensor_healthy: bool,
    pub sensor_silence_secs: f64,
    pub sensor_restarts: u32,
    pub sensor_restart_pending: bool,
    pub sensor_can_restart: bool,
}

impl LiveStatus {
    pub fn new() -> Self {
        Self {
            timestamp: current_timestamp(),
            uptime_seconds: 0,
            running: false,
            foreground: true,
            cycle_state: CycleState::Idle,
            samples: 0,
            triggers_emitted: 0,
            triggers_refused: 0,
            cycles_started: 0,
            emergencies: 0,
            clears: 0,
            failures: 0,
            cancelled: 0,
            triggers_dropped: 0,
            last_cycle_id: None,
            last_outcome: None,
            sensor_healthy: true,
            sensor_silence_secs: 0.0,
            sensor_restarts: 0,
            sensor_restart_pending: false,
            sensor_can_restart: true,
        }
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn summary(&self) -> String {
        format!(
            "state={} samples={} cycles={} (emergency {}, clear {}, failed {}, cancelled {}) dropped={} restarts={}",
            self.cycle_state.as_str(),
            self.samples,
            self.cycles_started,
            self.emergencies,
            self.clears,
            self.failures,
            self.cancelled,
            self.triggers_dropped,
            self.sensor_restarts
        )
    }
}

impl Default for LiveStatus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_writes_json() {
        let path = std::env::temp_dir().join(format!("live_status_{}.json", std::process::id()));
        let mut status = LiveStatus::new();
        status.cycles_started = 2;
        status.last_outcome = Some(Outcome::Emergency);
        status.save(&path).unwrap();

        let loaded: LiveStatus = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded, status);
        assert!(fs::read_to_string(&path).unwrap().contains("\"last_outcome\": \"emergency\""));
        let _ = fs::remove_file(path);
    }
}
