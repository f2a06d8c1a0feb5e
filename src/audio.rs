use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{timeout, timeout_at, Duration, Instant};

use crate::error::CaptureError;
use crate::permissions::PermissionGate;

/// Length of every feature vector crossing the extraction boundary
pub const FEATURE_LEN: usize = 13;

/// Fixed-length, finite audio features (MFCC-shaped).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector([f64; FEATURE_LEN]);

impl FeatureVector {
    /// Enforce the extractor contract: exactly 13 finite values.
    pub fn try_from_values(values: Vec<f64>) -> Result<Self, CaptureError> {
        let len = values.len();
        let array: [f64; FEATURE_LEN] = values.try_into().map_err(|_| {
            CaptureError::ExtractionFailed(format!("expected {FEATURE_LEN} features, got {len}"))
        })?;
        if let Some(idx) = array.iter().position(|v| !v.is_finite()) {
            return Err(CaptureError::ExtractionFailed(format!(
                "feature {idx} is not finite"
            )));
        }
        Ok(Self(array))
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }
}

/// Raw mono PCM handed to the extractor
#[derive(Clone, Debug)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

/// The microphone device. `open` acquires it exclusively.
pub trait Microphone: Send + Sync {
    fn open(&self, sample_rate: u32) -> Result<Box<dyn Recorder>, CaptureError>;
}

/// An acquired microphone. `release` must be called exactly once; `MicGuard` does it.
#[async_trait]
pub trait Recorder: Send {
    async fn record(&mut self, duration: Duration) -> Result<AudioBuffer, CaptureError>;

    fn release(&mut self);
}

/// Turns a recording into 13 features. Its numbers are opaque to the pipeline.
pub trait AudioFeatureExtractor: Send + Sync {
    fn extract(&self, buffer: &AudioBuffer) -> anyhow::Result<Vec<f64>>;
}

/// Releases the recorder when dropped, unless already released.
struct MicGuard {
    recorder: Box<dyn Recorder>,
    released: bool,
}

impl MicGuard {
    fn new(recorder: Box<dyn Recorder>) -> Self {
        Self {
            recorder,
            released: false,
        }
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.recorder.release();
        }
    }
}

impl Drop for MicGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Time-boxed audio verification window.
pub struct AudioCaptureWindow {
    microphone: Arc<dyn Microphone>,
    extractor: Arc<dyn AudioFeatureExtractor>,
    permissions: Arc<dyn PermissionGate>,
    sample_rate: u32,
    slack: Duration,
}

impl AudioCaptureWindow {
    pub fn new(
        microphone: Arc<dyn Microphone>,
        extractor: Arc<dyn AudioFeatureExtractor>,
        permissions: Arc<dyn PermissionGate>,
        sample_rate: u32,
        slack: Duration,
    ) -> Self {
        Self {
            microphone,
            extractor,
            permissions,
            sample_rate,
            slack,
        }
    }

    /// Record for `duration` and extract features.
    ///
    /// The microphone is held for at most `duration + slack` and is released
    /// before extraction starts. Recording and extraction together share that
    /// same deadline. Dropping the returned future mid-recording releases the
    /// microphone as well.
    pub async fn capture(&self, duration: Duration) -> Result<FeatureVector, CaptureError> {
        if !self.permissions.microphone_granted() {
            return Err(CaptureError::PermissionDenied);
        }

        let mut guard = MicGuard::new(self.microphone.open(self.sample_rate)?);
        let limit = duration + self.slack;
        let deadline = Instant::now() + limit;
        let recorded = timeout(limit, guard.recorder.record(duration)).await;
        guard.release();
        drop(guard);

        let buffer = match recorded {
            Ok(result) => result?,
            Err(_) => return Err(CaptureError::TimedOut(limit)),
        };
        log::debug!(
            "[audio] Captured {:.2}s at {} Hz",
            buffer.duration().as_secs_f64(),
            buffer.sample_rate
        );

        let extractor = self.extractor.clone();
        let extraction = tokio::task::spawn_blocking(move || extractor.extract(&buffer));
        // A hung extractor keeps its blocking thread, but the cycle moves on
        let values = match timeout_at(deadline, extraction).await {
            Ok(joined) => joined
                .map_err(|e| CaptureError::ExtractionFailed(format!("extractor panicked: {e}")))?
                .map_err(|e| CaptureError::ExtractionFailed(e.to_string()))?,
            Err(_) => {
                log::warn!("[audio] Feature extraction overran the {:?} capture window", limit);
                return Err(CaptureError::TimedOut(limit));
            }
        };

        FeatureVector::try_from_values(values)
    }
}

// ─── Simulated device ───────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SimulatedBehavior {
    Normal,
    /// Recording never completes
    Stall,
    /// Recording ends early with a device error
    FailMidway,
}

/// Synthetic microphone: a tone over deterministic noise.
///
/// Counts opens and releases and refuses a second concurrent `open`
/// like a real exclusive device.
pub struct SimulatedMicrophone {
    amplitude: f32,
    behavior: SimulatedBehavior,
    in_use: Arc<AtomicBool>,
    opens: AtomicUsize,
    releases: Arc<AtomicUsize>,
}

impl SimulatedMicrophone {
    pub fn new(amplitude: f32) -> Self {
        Self {
            amplitude,
            behavior: SimulatedBehavior::Normal,
            in_use: Arc::new(AtomicBool::new(false)),
            opens: AtomicUsize::new(0),
            releases: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn stalling(mut self) -> Self {
        self.behavior = SimulatedBehavior::Stall;
        self
    }

    pub fn failing_midway(mut self) -> Self {
        self.behavior = SimulatedBehavior::FailMidway;
        self
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn in_use(&self) -> bool {
        self.in_use.load(Ordering::SeqCst)
    }

    /// Pretend another app holds the device
    pub fn occupy(&self) {
        self.in_use.store(true, Ordering::SeqCst);
    }
}

impl Microphone for SimulatedMicrophone {
    fn open(&self, sample_rate: u32) -> Result<Box<dyn Recorder>, CaptureError> {
        if self.in_use.swap(true, Ordering::SeqCst) {
            return Err(CaptureError::DeviceUnavailable("microphone busy".to_string()));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimulatedRecorder {
            sample_rate,
            amplitude: self.amplitude,
            behavior: self.behavior,
            in_use: self.in_use.clone(),
            releases: self.releases.clone(),
        }))
    }
}

struct SimulatedRecorder {
    sample_rate: u32,
    amplitude: f32,
    behavior: SimulatedBehavior,
    in_use: Arc<AtomicBool>,
    releases: Arc<AtomicUsize>,
}

#[async_trait]
impl Recorder for SimulatedRecorder {
    async fn record(&mut self, duration: Duration) -> Result<AudioBuffer, CaptureError> {
        match self.behavior {
            SimulatedBehavior::Stall => std::future::pending().await,
            SimulatedBehavior::FailMidway => {
                tokio::time::sleep(duration / 2).await;
                Err(CaptureError::DeviceUnavailable("input stream lost".to_string()))
            }
            SimulatedBehavior::Normal => {
                tokio::time::sleep(duration).await;
                let count = (duration.as_secs_f64() * self.sample_rate as f64) as usize;
                let mut seed = 0x2545_f491_u32;
                let samples = (0..count)
                    .map(|i| {
                        seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                        let noise = (seed >> 8) as f32 / (1u32 << 24) as f32 - 0.5;
                        let t = i as f32 / self.sample_rate as f32;
                        self.amplitude * (t * 440.0 * std::f32::consts::TAU).sin() + 0.01 * noise
                    })
                    .collect();
                Ok(AudioBuffer {
                    samples,
                    sample_rate: self.sample_rate,
                })
            }
        }
    }

    fn release(&mut self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.in_use.store(false, Ordering::SeqCst);
    }
}

/// Log RMS energy of 13 equal time segments. A stand-in for a real MFCC extractor.
pub struct SegmentEnergyExtractor;

impl AudioFeatureExtractor for SegmentEnergyExtractor {
    fn extract(&self, buffer: &AudioBuffer) -> anyhow::Result<Vec<f64>> {
        if buffer.samples.len() < FEATURE_LEN {
            anyhow::bail!(
                "buffer too short for {} segments ({} samples)",
                FEATURE_LEN,
                buffer.samples.len()
            );
        }
        let segment = buffer.samples.len() / FEATURE_LEN;
        Ok(buffer
            .samples
            .chunks(segment)
            .take(FEATURE_LEN)
            .map(|chunk| {
                let mean_sq =
                    chunk.iter().map(|s| (*s as f64) * (*s as f64)).sum::<f64>() / chunk.len() as f64;
                (mean_sq.sqrt() + 1e-6).ln()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::StaticPermissions;
    use tokio::time::Instant;

    struct FixedExtractor(Vec<f64>);

    impl AudioFeatureExtractor for FixedExtractor {
        fn extract(&self, _buffer: &AudioBuffer) -> anyhow::Result<Vec<f64>> {
            Ok(self.0.clone())
        }
    }

    fn window(
        mic: Arc<SimulatedMicrophone>,
        extractor: Arc<dyn AudioFeatureExtractor>,
        permissions: StaticPermissions,
    ) -> AudioCaptureWindow {
        AudioCaptureWindow::new(
            mic,
            extractor,
            Arc::new(permissions),
            16_000,
            Duration::from_millis(500),
        )
    }

    #[test]
    fn test_feature_vector_contract() {
        assert!(FeatureVector::try_from_values(vec![0.5; FEATURE_LEN]).is_ok());
        assert!(matches!(
            FeatureVector::try_from_values(vec![0.5; 12]),
            Err(CaptureError::ExtractionFailed(_))
        ));
        let mut values = vec![0.0; FEATURE_LEN];
        values[4] = f64::INFINITY;
        assert_eq!(
            FeatureVector::try_from_values(values),
            Err(CaptureError::ExtractionFailed("feature 4 is not finite".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_success_releases_once() {
        let mic = Arc::new(SimulatedMicrophone::new(0.3));
        let capture = window(mic.clone(), Arc::new(SegmentEnergyExtractor), StaticPermissions::granted());

        let started = Instant::now();
        let features = capture.capture(Duration::from_secs(3)).await.unwrap();

        assert_eq!(features.as_slice().len(), FEATURE_LEN);
        assert!(features.as_slice().iter().all(|v| v.is_finite()));
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(mic.opens(), 1);
        assert_eq!(mic.releases(), 1);
        assert!(!mic.in_use());
    }

    #[tokio::test]
    async fn test_permission_denied_never_opens() {
        let mic = Arc::new(SimulatedMicrophone::new(0.3));
        let capture = window(mic.clone(), Arc::new(SegmentEnergyExtractor), StaticPermissions::new(false, true));

        let result = capture.capture(Duration::from_secs(3)).await;
        assert_eq!(result, Err(CaptureError::PermissionDenied));
        assert_eq!(mic.opens(), 0);
        assert_eq!(mic.releases(), 0);
    }

    #[tokio::test]
    async fn test_busy_device() {
        let mic = Arc::new(SimulatedMicrophone::new(0.3));
        mic.occupy();
        let capture = window(mic.clone(), Arc::new(SegmentEnergyExtractor), StaticPermissions::granted());

        let result = capture.capture(Duration::from_secs(3)).await;
        assert!(matches!(result, Err(CaptureError::DeviceUnavailable(_))));
        assert_eq!(mic.opens(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_recording_is_bounded() {
        let mic = Arc::new(SimulatedMicrophone::new(0.3).stalling());
        let capture = window(mic.clone(), Arc::new(SegmentEnergyExtractor), StaticPermissions::granted());

        let started = Instant::now();
        let result = capture.capture(Duration::from_secs(3)).await;

        assert_eq!(result, Err(CaptureError::TimedOut(Duration::from_millis(3500))));
        assert!(started.elapsed() <= Duration::from_millis(3500) + Duration::from_millis(10));
        assert_eq!(mic.releases(), 1);
        assert!(!mic.in_use());
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_error_mid_recording_releases() {
        let mic = Arc::new(SimulatedMicrophone::new(0.3).failing_midway());
        let capture = window(mic.clone(), Arc::new(SegmentEnergyExtractor), StaticPermissions::granted());

        let result = capture.capture(Duration::from_secs(3)).await;
        assert!(matches!(result, Err(CaptureError::DeviceUnavailable(_))));
        assert_eq!(mic.releases(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_extractor_output_fails_after_release() {
        let mic = Arc::new(SimulatedMicrophone::new(0.3));
        let capture = window(mic.clone(), Arc::new(FixedExtractor(vec![1.0; 7])), StaticPermissions::granted());

        let result = capture.capture(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(CaptureError::ExtractionFailed(_))));
        assert_eq!(mic.releases(), 1);
    }

    /// Stands in for a feature extractor wedged in native code
    struct HungExtractor(std::time::Duration);

    impl AudioFeatureExtractor for HungExtractor {
        fn extract(&self, _buffer: &AudioBuffer) -> anyhow::Result<Vec<f64>> {
            std::thread::sleep(self.0);
            Ok(vec![0.0; FEATURE_LEN])
        }
    }

    #[tokio::test]
    async fn test_hung_extraction_is_bounded() {
        let mic = Arc::new(SimulatedMicrophone::new(0.3));
        let capture = AudioCaptureWindow::new(
            mic.clone(),
            Arc::new(HungExtractor(std::time::Duration::from_millis(1500))),
            Arc::new(StaticPermissions::granted()),
            16_000,
            Duration::from_millis(100),
        );

        let started = std::time::Instant::now();
        let result = capture.capture(Duration::from_millis(100)).await;

        assert_eq!(result, Err(CaptureError::TimedOut(Duration::from_millis(200))));
        assert!(started.elapsed() < std::time::Duration::from_millis(700));
        assert_eq!(mic.releases(), 1);
        assert!(!mic.in_use());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_capture_releases_microphone() {
        let mic = Arc::new(SimulatedMicrophone::new(0.3));
        let capture = window(mic.clone(), Arc::new(SegmentEnergyExtractor), StaticPermissions::granted());

        let aborted = timeout(Duration::from_secs(1), capture.capture(Duration::from_secs(3))).await;
        assert!(aborted.is_err());
        assert_eq!(mic.opens(), 1);
        assert_eq!(mic.releases(), 1);
        assert!(!mic.in_use());
    }
}
