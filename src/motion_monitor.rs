use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::ServiceConfig;
use crate::coordinator::CycleStatus;
use crate::error::SensorFailure;
use crate::health_monitor::SensorHealth;
use crate::permissions::PermissionGate;
use crate::sensors::{current_timestamp, sensor_loop, AccelSource, MotionSample};

const SAMPLE_QUEUE: usize = 64;
const OBSERVER_QUEUE: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Motion,
    /// User-initiated SOS
    Manual,
}

/// Request to open a detection cycle
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Trigger {
    pub source: TriggerSource,
    pub sample: MotionSample,
}

impl Trigger {
    pub fn motion(sample: MotionSample) -> Self {
        Self {
            source: TriggerSource::Motion,
            sample,
        }
    }

    pub fn manual() -> Self {
        Self {
            source: TriggerSource::Manual,
            sample: MotionSample::synthetic(current_timestamp()),
        }
    }
}

/// Edge-triggered threshold detector.
///
/// Fires on the first sample strictly above the threshold, then stays
/// disarmed until a sample at or below the threshold arrives.
#[derive(Debug)]
pub struct TriggerDetector {
    threshold: f64,
    armed: bool,
}

impl TriggerDetector {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            armed: true,
        }
    }

    pub fn observe(&mut self, sample: &MotionSample, cycle_idle: bool) -> Option<Trigger> {
        if sample.magnitude <= self.threshold {
            self.armed = true;
            return None;
        }
        // Above threshold but a cycle is running: drop, keep the arm state
        if !self.armed || !cycle_idle {
            return None;
        }
        self.armed = false;
        Some(Trigger::motion(sample.clone()))
    }
}

#[derive(Debug, Default)]
pub struct MonitorStats {
    pub samples: AtomicU64,
    pub triggers_emitted: AtomicU64,
    /// Triggers the detector raised but the coordinator's queue of one refused
    pub triggers_refused: AtomicU64,
}

impl MonitorStats {
    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    pub fn triggers_emitted(&self) -> u64 {
        self.triggers_emitted.load(Ordering::Relaxed)
    }

    pub fn triggers_refused(&self) -> u64 {
        self.triggers_refused.load(Ordering::Relaxed)
    }
}

pub struct MotionMonitor;

impl MotionMonitor {
    /// Open the sensor and start emitting triggers.
    ///
    /// Opening happens synchronously so a refused subscription is reported
    /// to the caller instead of surfacing later from the task.
    pub fn start(
        config: &ServiceConfig,
        mut source: Box<dyn AccelSource>,
        permissions: &dyn PermissionGate,
        triggers: mpsc::Sender<Trigger>,
        cycle: CycleStatus,
        health: Option<SensorHealth>,
        stats: Arc<MonitorStats>,
    ) -> Result<MonitorHandle, SensorFailure> {
        if !permissions.motion_granted() {
            return Err(SensorFailure::PermissionDenied);
        }
        source.open()?;
        log::info!(
            "[monitor] {} subscribed (threshold {:.1} m/s², every {} ms)",
            source.name(),
            config.trigger_threshold,
            config.sample_interval_ms
        );

        let (sample_tx, sample_rx) = mpsc::channel(SAMPLE_QUEUE);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (observers, _) = broadcast::channel(OBSERVER_QUEUE);

        let reader = tokio::spawn(sensor_loop(
            source,
            sample_tx,
            config.sample_interval(),
            stop_rx,
        ));
        let processor = tokio::spawn(process_samples(
            sample_rx,
            TriggerDetector::new(config.trigger_threshold),
            triggers,
            cycle,
            health,
            observers.clone(),
            stats.clone(),
        ));

        Ok(MonitorHandle {
            stop_tx,
            reader: Some(reader),
            processor: Some(processor),
            observers,
            stats,
        })
    }
}

async fn process_samples(
    mut samples: mpsc::Receiver<MotionSample>,
    mut detector: TriggerDetector,
    triggers: mpsc::Sender<Trigger>,
    cycle: CycleStatus,
    health: Option<SensorHealth>,
    observers: broadcast::Sender<MotionSample>,
    stats: Arc<MonitorStats>,
) {
    while let Some(sample) = samples.recv().await {
        stats.samples.fetch_add(1, Ordering::Relaxed);
        if let Some(health) = health.as_ref() {
            health.update();
        }
        // No observers is fine
        let _ = observers.send(sample.clone());

        let Some(trigger) = detector.observe(&sample, cycle.is_idle()) else {
            continue;
        };

        match triggers.try_send(trigger) {
            Ok(_) => {
                stats.triggers_emitted.fetch_add(1, Ordering::Relaxed);
                log::info!(
                    "[monitor] Trigger at {:.2} m/s² (t={:.3})",
                    sample.magnitude,
                    sample.timestamp
                );
            }
            Err(TrySendError::Full(_)) => {
                stats.triggers_refused.fetch_add(1, Ordering::Relaxed);
                log::debug!("[monitor] Trigger dropped, one already pending");
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("[monitor] Coordinator gone, stopping sample processing");
                break;
            }
        }
    }
}

/// Running monitor. Dropping the handle unsubscribes the sensor.
pub struct MonitorHandle {
    stop_tx: watch::Sender<bool>,
    reader: Option<JoinHandle<Result<(), SensorFailure>>>,
    processor: Option<JoinHandle<()>>,
    observers: broadcast::Sender<MotionSample>,
    stats: Arc<MonitorStats>,
}

impl MonitorHandle {
    /// Live stream of every sample the monitor sees
    pub fn subscribe(&self) -> broadcast::Receiver<MotionSample> {
        self.observers.subscribe()
    }

    pub fn stats(&self) -> Arc<MonitorStats> {
        self.stats.clone()
    }

    /// Resolves once the sensor subscription has ended, with the failure if there was one.
    /// Safe to cancel and call again.
    pub async fn wait(&mut self) -> Result<(), SensorFailure> {
        let mut result = Ok(());
        if let Some(reader) = self.reader.as_mut() {
            result = match reader.await {
                Ok(result) => result,
                Err(e) => Err(SensorFailure::StreamEnded(format!("sensor task aborted: {e}"))),
            };
            self.reader = None;
        }
        if let Some(processor) = self.processor.as_mut() {
            let _ = processor.await;
            self.processor = None;
        }
        result
    }

    /// Unsubscribe and release the sensor
    pub async fn stop(mut self) -> Result<(), SensorFailure> {
        self.stop_tx.send_replace(true);
        self.wait().await
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
    }
}
