use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use crate::coordinator::CycleId;
use crate::fusion::Decision;

/// How many delivered cycle ids are remembered for deduplication
pub const DELIVERED_MEMORY: usize = 256;
const OBSERVER_QUEUE: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Sos,
    Info,
    Diagnostic,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub level: AlertLevel,
    pub title: String,
    pub body: String,
    pub decision: Option<Decision>,
}

/// What was delivered, for which cycle, and when
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub cycle_id: CycleId,
    pub notification: Notification,
    pub delivered_at: DateTime<Utc>,
}

/// Somewhere a notification can be shown or stored
pub trait NotificationSurface: Send + Sync {
    fn name(&self) -> &str;
    fn post(&self, record: &AlertRecord) -> anyhow::Result<()>;
}

/// Writes notifications to the log at a level matching their severity
pub struct LogSurface;

impl NotificationSurface for LogSurface {
    fn name(&self) -> &str {
        "log"
    }

    fn post(&self, record: &AlertRecord) -> anyhow::Result<()> {
        let n = &record.notification;
        match n.level {
            AlertLevel::Sos => log::error!("[ALERT] 🚨 {} [{}] {}", n.title, record.cycle_id, n.body),
            AlertLevel::Info => log::info!("[ALERT] {} [{}] {}", n.title, record.cycle_id, n.body),
            AlertLevel::Diagnostic => log::warn!("[ALERT] {} [{}] {}", n.title, record.cycle_id, n.body),
        }
        Ok(())
    }
}

/// Appends one JSON record per line
pub struct JsonlSurface {
    path: Arc<PathBuf>,
    write_lock: Arc<Mutex<()>>,
}

impl JsonlSurface {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Arc::new(path.into()),
            write_lock: Arc::new(Mutex::new(())),
        }
    }
}

fn append_line(path: &Path, write_lock: &Mutex<()>, line: &str) -> anyhow::Result<()> {
    let _serialized = write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    writeln!(file, "{line}")?;
    Ok(())
}

impl NotificationSurface for JsonlSurface {
    fn name(&self) -> &str {
        "jsonl"
    }

    /// Inside a runtime the append runs on the blocking pool and write
    /// errors are logged there; outside one it happens inline.
    fn post(&self, record: &AlertRecord) -> anyhow::Result<()> {
        let line = serde_json::to_string(record)?;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let path = self.path.clone();
                let write_lock = self.write_lock.clone();
                runtime.spawn_blocking(move || {
                    if let Err(e) = append_line(&path, &write_lock, &line) {
                        log::error!("[notifier] Surface jsonl failed: {:#}", e);
                    }
                });
                Ok(())
            }
            Err(_) => append_line(&self.path, &self.write_lock, &line),
        }
    }
}

/// Delivers cycle outcomes to the user, at most once per cycle id.
pub struct AlertNotifier {
    surfaces: Vec<Box<dyn NotificationSurface>>,
    delivered: Mutex<VecDeque<CycleId>>,
    observers: broadcast::Sender<AlertRecord>,
}

impl AlertNotifier {
    pub fn new(surfaces: Vec<Box<dyn NotificationSurface>>) -> Self {
        let (observers, _) = broadcast::channel(OBSERVER_QUEUE);
        Self {
            surfaces,
            delivered: Mutex::new(VecDeque::with_capacity(DELIVERED_MEMORY)),
            observers,
        }
    }

    /// UI feed of every delivered record
    pub fn subscribe(&self) -> broadcast::Receiver<AlertRecord> {
        self.observers.subscribe()
    }

    /// Report a decided cycle. `emergency` is the cycle's outcome, which a
    /// manual trigger policy may raise above the service's `is_emergency`.
    pub fn notify(&self, cycle_id: CycleId, decision: &Decision, emergency: bool) -> Option<AlertRecord> {
        let notification = if emergency {
            Notification {
                level: AlertLevel::Sos,
                title: "Emergency detected".to_string(),
                body: format!(
                    "Risk score {:.2} (confidence {:.2}). {}",
                    decision.fused_risk_score, decision.confidence, decision.message
                )
                .trim_end()
                .to_string(),
                decision: Some(decision.clone()),
            }
        } else {
            Notification {
                level: AlertLevel::Info,
                title: "All clear".to_string(),
                body: format!("Risk score {:.2}, no emergency", decision.fused_risk_score),
                decision: Some(decision.clone()),
            }
        };
        self.deliver(cycle_id, notification)
    }

    /// Report a cycle that could not reach a decision
    pub fn notify_failure(&self, cycle_id: CycleId, reason: &str) -> Option<AlertRecord> {
        self.deliver(
            cycle_id,
            Notification {
                level: AlertLevel::Diagnostic,
                title: "Safety check failed".to_string(),
                body: reason.to_string(),
                decision: None,
            },
        )
    }

    pub fn already_delivered(&self, cycle_id: CycleId) -> bool {
        self.delivered
            .lock()
            .map(|d| d.contains(&cycle_id))
            .unwrap_or(false)
    }

    fn deliver(&self, cycle_id: CycleId, notification: Notification) -> Option<AlertRecord> {
        {
            let mut delivered = match self.delivered.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if delivered.contains(&cycle_id) {
                log::debug!("[notifier] {} already notified, skipping", cycle_id);
                return None;
            }
            if delivered.len() == DELIVERED_MEMORY {
                delivered.pop_front();
            }
            delivered.push_back(cycle_id);
        }

        let record = AlertRecord {
            cycle_id,
            notification,
            delivered_at: Utc::now(),
        };
        for surface in &self.surfaces {
            if let Err(e) = surface.post(&record) {
                log::error!("[notifier] Surface {} failed for {}: {:#}", surface.name(), cycle_id, e);
            }
        }
        let _ = self.observers.send(record.clone());
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Keeps every posted record in memory
    #[derive(Clone, Default)]
    struct MemorySurface {
        posted: Arc<Mutex<Vec<AlertRecord>>>,
    }

    impl NotificationSurface for MemorySurface {
        fn name(&self) -> &str {
            "memory"
        }

        fn post(&self, record: &AlertRecord) -> anyhow::Result<()> {
            self.posted.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    struct BrokenSurface;

    impl NotificationSurface for BrokenSurface {
        fn name(&self) -> &str {
            "broken"
        }

        fn post(&self, _record: &AlertRecord) -> anyhow::Result<()> {
            anyhow::bail!("display gone")
        }
    }

    fn decision(is_emergency: bool, score: f64) -> Decision {
        Decision {
            is_emergency,
            fused_risk_score: score,
            confidence: 0.9,
            message: String::new(),
        }
    }

    #[test]
    fn test_notify_is_idempotent_per_cycle() {
        let memory = MemorySurface::default();
        let notifier = AlertNotifier::new(vec![Box::new(memory.clone())]);

        let first = notifier.notify(CycleId(1), &decision(true, 0.82), true);
        assert_eq!(first.unwrap().notification.level, AlertLevel::Sos);
        assert!(notifier.notify(CycleId(1), &decision(true, 0.82), true).is_none());
        assert!(notifier.notify_failure(CycleId(1), "late failure").is_none());

        assert_eq!(memory.posted.lock().unwrap().len(), 1);
        assert!(notifier.already_delivered(CycleId(1)));
    }

    #[test]
    fn test_levels_follow_outcome() {
        let notifier = AlertNotifier::new(vec![]);
        let clear = notifier.notify(CycleId(1), &decision(false, 0.1), false).unwrap();
        assert_eq!(clear.notification.level, AlertLevel::Info);

        let failure = notifier.notify_failure(CycleId(2), "Microphone permission denied").unwrap();
        assert_eq!(failure.notification.level, AlertLevel::Diagnostic);
        assert_eq!(failure.notification.body, "Microphone permission denied");
        assert!(failure.notification.decision.is_none());

        // Forced alert keeps the service's own verdict in the record
        let forced = notifier.notify(CycleId(3), &decision(false, 0.2), true).unwrap();
        assert_eq!(forced.notification.level, AlertLevel::Sos);
        assert_eq!(forced.notification.decision.map(|d| d.is_emergency), Some(false));
    }

    #[test]
    fn test_memory_is_bounded() {
        let notifier = AlertNotifier::new(vec![]);
        for id in 0..=DELIVERED_MEMORY as u64 {
            assert!(notifier.notify_failure(CycleId(id), "x").is_some());
        }
        // Oldest id evicted, newest still remembered
        assert!(!notifier.already_delivered(CycleId(0)));
        assert!(notifier.already_delivered(CycleId(DELIVERED_MEMORY as u64)));
        assert_eq!(notifier.delivered.lock().unwrap().len(), DELIVERED_MEMORY);
    }

    #[test]
    fn test_failing_surface_does_not_block_others() {
        let memory = MemorySurface::default();
        let notifier = AlertNotifier::new(vec![Box::new(BrokenSurface), Box::new(memory.clone())]);

        assert!(notifier.notify_failure(CycleId(9), "timeout").is_some());
        assert_eq!(memory.posted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_observers_receive_records() {
        let notifier = AlertNotifier::new(vec![]);
        let mut rx = notifier.subscribe();
        notifier.notify(CycleId(4), &decision(true, 0.9), true);

        let record = rx.recv().await.unwrap();
        assert_eq!(record.cycle_id, CycleId(4));
    }

    #[test]
    fn test_jsonl_surface_appends_lines() {
        let path = std::env::temp_dir().join(format!(
            "safety_monitor_alerts_{}_{}.jsonl",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let notifier = AlertNotifier::new(vec![Box::new(JsonlSurface::new(&path))]);
        notifier.notify(CycleId(1), &decision(true, 0.82), true);
        notifier.notify_failure(CycleId(2), "timeout");

        let text = std::fs::read_to_string(&path).unwrap();
        let records: Vec<AlertRecord> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].cycle_id, CycleId(2));
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_jsonl_surface_writes_off_the_runtime() {
        let path = std::env::temp_dir().join(format!(
            "safety_monitor_alerts_rt_{}_{}.jsonl",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let notifier = AlertNotifier::new(vec![Box::new(JsonlSurface::new(&path))]);
        assert!(notifier.notify(CycleId(7), &decision(true, 0.82), true).is_some());

        let mut text = String::new();
        for _ in 0..100 {
            text = std::fs::read_to_string(&path).unwrap_or_default();
            if !text.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let record: AlertRecord = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(record.cycle_id, CycleId(7));
        let _ = std::fs::remove_file(path);
    }
}
