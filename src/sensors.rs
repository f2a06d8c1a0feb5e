use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;
use tokio::sync::watch;
use tokio::time::{interval, Duration};

use crate::error::SensorFailure;

/// One accelerometer reading. `magnitude` is always derived from x/y/z.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MotionSample {
    pub timestamp: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub magnitude: f64,
    /// Stand-in for "no motion data" on manual triggers
    #[serde(default)]
    pub synthetic: bool,
}

impl MotionSample {
    pub fn new(x: f64, y: f64, z: f64, timestamp: f64) -> Self {
        Self {
            timestamp,
            x,
            y,
            z,
            magnitude: (x * x + y * y + z * z).sqrt(),
            synthetic: false,
        }
    }

    pub fn synthetic(timestamp: f64) -> Self {
        Self {
            synthetic: true,
            ..Self::new(0.0, 0.0, 0.0, timestamp)
        }
    }
}

/// A subscription to an accelerometer. `open` may be called again after `close`.
#[async_trait]
pub trait AccelSource: Send {
    fn name(&self) -> &str;

    fn open(&mut self) -> Result<(), SensorFailure>;

    /// `Ok(None)` when no fresh reading is available on this tick.
    /// Must not block the calling worker.
    async fn read(&mut self) -> Result<Option<MotionSample>, SensorFailure>;

    fn close(&mut self);
}

/// Builds a fresh source each time the host (re)starts the monitor
pub type SourceFactory = Arc<dyn Fn() -> Box<dyn AccelSource> + Send + Sync>;

/// Poll the source at `period` and forward readings without ever waiting on the consumer.
///
/// Returns `Ok(())` when stopped or when the consumer went away, and the first
/// `SensorFailure` otherwise. The source is closed on every exit path.
pub async fn sensor_loop(
    mut source: Box<dyn AccelSource>,
    tx: Sender<MotionSample>,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) -> Result<(), SensorFailure> {
    let mut ticker = interval(period);
    let mut sample_count = 0u64;
    let mut dropped = 0u64;

    let result = loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break Ok(());
                }
                continue;
            }
        }

        let read = tokio::select! {
            read = source.read() => read,
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break Ok(());
                }
                continue;
            }
        };
        let sample = match read {
            Ok(Some(sample)) => sample,
            Ok(None) => continue,
            Err(failure) => {
                log::error!("[{}] subscription failed: {}", source.name(), failure);
                break Err(failure);
            }
        };

        match tx.try_send(sample) {
            Ok(_) => {
                sample_count += 1;
                if sample_count % 100 == 0 {
                    log::debug!("[{}] {} samples ({} dropped)", source.name(), sample_count, dropped);
                }
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("[{}] Channel closed after {} samples", source.name(), sample_count);
                break Ok(());
            }
            Err(TrySendError::Full(_)) => {
                // Consumer is behind, drop this sample
                dropped += 1;
            }
        }
    };

    source.close();
    result
}

// ─── Termux ─────────────────────────────────────────────────────────────────

/// Reads the device accelerometer through `termux-sensor`.
pub struct TermuxAccelSource {
    opened: bool,
}

impl TermuxAccelSource {
    pub fn new() -> Self {
        Self { opened: false }
    }
}

impl Default for TermuxAccelSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AccelSource for TermuxAccelSource {
    fn name(&self) -> &str {
        "termux-accel"
    }

    fn open(&mut self) -> Result<(), SensorFailure> {
        match Command::new("termux-sensor").arg("-l").output() {
            Ok(output) if output.status.success() => {
                self.opened = true;
                Ok(())
            }
            Ok(output) => Err(SensorFailure::Unavailable(format!(
                "termux-sensor exited with {}",
                output.status
            ))),
            Err(e) => Err(SensorFailure::Unavailable(e.to_string())),
        }
    }

    async fn read(&mut self) -> Result<Option<MotionSample>, SensorFailure> {
        if !self.opened {
            return Err(SensorFailure::StreamEnded("source not open".to_string()));
        }
        let output = tokio::process::Command::new("termux-sensor")
            .arg("-n")
            .arg("1")
            .arg("-s")
            .arg("accelerometer")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SensorFailure::Unavailable(e.to_string()))?;

        let text = String::from_utf8_lossy(&output.stdout);
        Ok(parse_accel_output(&text, current_timestamp()))
    }

    fn close(&mut self) {
        if self.opened {
            // termux-sensor keeps the hardware listener alive until cleaned up.
            // Spawned without waiting; the runtime reaps it.
            let _ = tokio::process::Command::new("termux-sensor").arg("-c").spawn();
            self.opened = false;
        }
    }
}

#[derive(Deserialize)]
struct TermuxReading {
    values: Vec<f64>,
}

/// Accepts either the JSON form `{"<sensor name>": {"values": [x, y, z]}}`
/// or the older `x=.., y=.., z=..` line format.
fn parse_accel_output(output: &str, timestamp: f64) -> Option<MotionSample> {
    if let Ok(map) =
        serde_json::from_str::<std::collections::HashMap<String, TermuxReading>>(output.trim())
    {
        let reading = map.into_values().next()?;
        if let &[x, y, z, ..] = reading.values.as_slice() {
            return Some(MotionSample::new(x, y, z, timestamp));
        }
        return None;
    }

    let mut x = None;
    let mut y = None;
    let mut z = None;
    for part in output.split(',') {
        let part = part.trim();
        let part = part.rsplit(' ').next().unwrap_or(part);
        if let Some(val_str) = part.strip_prefix("x=") {
            x = val_str.trim().parse().ok();
        } else if let Some(val_str) = part.strip_prefix("y=") {
            y = val_str.trim().parse().ok();
        } else if let Some(val_str) = part.strip_prefix("z=") {
            z = val_str.trim().parse().ok();
        }
    }

    Some(MotionSample::new(x?, y?, z?, timestamp))
}

// ─── Simulated ──────────────────────────────────────────────────────────────

/// A device lying still, with an optional impact burst every `impact_every` samples.
pub struct SimulatedAccelSource {
    counter: u64,
    impact_every: Option<u64>,
    opened: bool,
}

impl SimulatedAccelSource {
    pub fn new(impact_every: Option<u64>) -> Self {
        Self {
            counter: 0,
            impact_every: impact_every.filter(|n| *n > 0),
            opened: false,
        }
    }
}

#[async_trait]
impl AccelSource for SimulatedAccelSource {
    fn name(&self) -> &str {
        "simulated-accel"
    }

    fn open(&mut self) -> Result<(), SensorFailure> {
        self.opened = true;
        Ok(())
    }

    async fn read(&mut self) -> Result<Option<MotionSample>, SensorFailure> {
        use std::f64::consts::PI;
        if !self.opened {
            return Err(SensorFailure::StreamEnded("source not open".to_string()));
        }

        let seq = self.counter;
        self.counter += 1;
        let t = seq as f64 * 0.02;

        // Three-sample jolt, well above the default threshold
        if let Some(every) = self.impact_every {
            if seq % every < 3 && seq >= every {
                return Ok(Some(MotionSample::new(12.0, 11.0, 13.0, current_timestamp())));
            }
        }

        Ok(Some(MotionSample::new(
            (t * 2.0 * PI).sin() * 0.5,
            (t * 2.0 * PI).cos() * 0.3,
            9.81 + (t * PI).sin() * 0.1,
            current_timestamp(),
        )))
    }

    fn close(&mut self) {
        self.opened = false;
    }
}

// ─── Scripted ───────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub enum ScriptStep {
    Sample { x: f64, y: f64, z: f64 },
    /// A tick with no fresh reading
    Gap,
    Fail(SensorFailure),
}

/// Replays a fixed sequence of readings, then goes quiet.
pub struct ScriptedAccelSource {
    steps: VecDeque<ScriptStep>,
    seq: u64,
    fail_open: Option<SensorFailure>,
    opens: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl ScriptedAccelSource {
    pub fn new(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
            seq: 0,
            fail_open: None,
            opens: Arc::new(AtomicUsize::new(0)),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Helper: every magnitude as a pure z-axis reading
    pub fn from_magnitudes(magnitudes: &[f64]) -> Self {
        Self::new(
            magnitudes
                .iter()
                .map(|m| ScriptStep::Sample { x: 0.0, y: 0.0, z: *m }),
        )
    }

    pub fn failing_open(mut self, failure: SensorFailure) -> Self {
        self.fail_open = Some(failure);
        self
    }

    /// Share open/close counters with a test
    pub fn with_counters(mut self, opens: Arc<AtomicUsize>, closes: Arc<AtomicUsize>) -> Self {
        self.opens = opens;
        self.closes = closes;
        self
    }
}

#[async_trait]
impl AccelSource for ScriptedAccelSource {
    fn name(&self) -> &str {
        "scripted-accel"
    }

    fn open(&mut self) -> Result<(), SensorFailure> {
        if let Some(failure) = self.fail_open.clone() {
            return Err(failure);
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read(&mut self) -> Result<Option<MotionSample>, SensorFailure> {
        let step = match self.steps.pop_front() {
            Some(step) => step,
            None => return Ok(None),
        };
        self.seq += 1;
        match step {
            ScriptStep::Sample { x, y, z } => Ok(Some(MotionSample::new(x, y, z, self.seq as f64 * 0.2))),
            ScriptStep::Gap => Ok(None),
            ScriptStep::Fail(failure) => Err(failure),
        }
    }

    fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn current_timestamp() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
