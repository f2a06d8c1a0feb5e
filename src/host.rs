use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};

use crate::audio::{AudioCaptureWindow, AudioFeatureExtractor, Microphone};
use crate::config::ServiceConfig;
use crate::coordinator::{CoordinatorHandle, CyclePipeline, CycleStatus, DetectionCycleCoordinator, StatsView};
use crate::error::{MonitorError, MonitorResult, SensorFailure};
use crate::fusion::{LocationProvider, RiskEvaluator};
use crate::health_monitor::SensorHealth;
use crate::live_status::LiveStatus;
use crate::motion_monitor::{MonitorHandle, MonitorStats, MotionMonitor, Trigger};
use crate::notifier::{AlertNotifier, AlertRecord};
use crate::permissions::PermissionGate;
use crate::restart_manager::RestartState;
use crate::sensors::{current_timestamp, SourceFactory};

pub const LIVE_STATUS_FILE: &str = "live_status.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostState {
    Stopped,
    Running,
}

/// Everything the host wires together. Cheap to clone.
#[derive(Clone)]
pub struct HostCollaborators {
    pub sources: SourceFactory,
    pub microphone: Arc<dyn Microphone>,
    pub extractor: Arc<dyn AudioFeatureExtractor>,
    pub permissions: Arc<dyn PermissionGate>,
    pub evaluator: Arc<dyn RiskEvaluator>,
    pub location: Arc<dyn LocationProvider>,
    pub notifier: Arc<AlertNotifier>,
}

/// State read by the status writer and `status()`
struct HostShared {
    started: Instant,
    foreground: Arc<AtomicBool>,
    monitor_stats: Arc<MonitorStats>,
    health: SensorHealth,
    restart: Mutex<RestartState>,
    cycle: CycleStatus,
    cycles: StatsView,
}

impl HostShared {
    fn snapshot(&self, running: bool) -> LiveStatus {
        let cycles = self.cycles.snapshot();
        let health = self.health.report();
        let mut status = LiveStatus::new();
        status.timestamp = current_timestamp();
        status.uptime_seconds = self.started.elapsed().as_secs();
        status.running = running;
        status.foreground = self.foreground.load(Ordering::SeqCst);
        status.cycle_state = self.cycle.current();
        status.samples = self.monitor_stats.samples();
        status.triggers_emitted = self.monitor_stats.triggers_emitted();
        status.triggers_refused = self.monitor_stats.triggers_refused();
        status.cycles_started = cycles.cycles_started;
        status.emergencies = cycles.emergencies;
        status.clears = cycles.clears;
        status.failures = cycles.failures;
        status.cancelled = cycles.cancelled;
        status.triggers_dropped = cycles.triggers_dropped;
        status.last_cycle_id = cycles.last_cycle.as_ref().map(|c| c.id);
        status.last_outcome = cycles.last_cycle.as_ref().and_then(|c| c.outcome);
        status.sensor_healthy = health.healthy;
        status.sensor_silence_secs = health.silence.as_secs_f64();
        if let Ok(restart) = self.restart.lock() {
            status.sensor_restarts = restart.restarts;
            status.sensor_restart_pending = restart.restart_needed;
            status.sensor_can_restart = restart.can_restart();
        }
        status
    }

    /// A restarted monitor only counts as recovered once it has delivered a sample
    fn confirm_recovery(&self, samples_at_start: u64) {
        if self.monitor_stats.samples() <= samples_at_start {
            return;
        }
        let _ = self.with_restart(|r| {
            if r.restart_needed {
                r.record_success();
            }
        });
    }

    /// Book a sensor failure: a fresh signal if the sensor had recovered,
    /// otherwise another failed attempt with a longer cooldown
    fn record_sensor_failure(&self) {
        let _ = self.with_restart(|r| {
            if r.restart_needed {
                r.record_failed_attempt();
            } else {
                r.signal_restart();
            }
        });
    }

    fn with_restart<T>(&self, f: impl FnOnce(&mut RestartState) -> T) -> MonitorResult<T> {
        let mut restart = self
            .restart
            .lock()
            .map_err(|_| MonitorError::Internal("Failed to acquire restart lock".to_string()))?;
        Ok(f(&mut restart))
    }
}

struct Running {
    coordinator: CoordinatorHandle,
    shared: Arc<HostShared>,
    stop_tx: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
    status_writer: JoinHandle<()>,
}

/// Owns the whole pipeline and keeps it alive while the app is backgrounded.
///
/// `start` wires coordinator, motion monitor, and status writer; `stop`
/// tears them down in reverse. Foreground transitions are recorded only.
pub struct BackgroundExecutionHost {
    config: ServiceConfig,
    collaborators: HostCollaborators,
    foreground: Arc<AtomicBool>,
    running: Option<Running>,
    last_status: Option<LiveStatus>,
}

impl BackgroundExecutionHost {
    pub fn new(config: ServiceConfig, collaborators: HostCollaborators) -> Self {
        Self {
            config,
            collaborators,
            foreground: Arc::new(AtomicBool::new(true)),
            running: None,
            last_status: None,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn state(&self) -> HostState {
        if self.running.is_some() {
            HostState::Running
        } else {
            HostState::Stopped
        }
    }

    pub fn start(&mut self) -> MonitorResult<()> {
        if self.running.is_some() {
            return Err(MonitorError::AlreadyRunning);
        }
        self.config.validate()?;
        std::fs::create_dir_all(&self.config.output_dir).map_err(|e| {
            MonitorError::Internal(format!("creating {}: {e}", self.config.output_dir))
        })?;

        let c = &self.collaborators;
        let coordinator = DetectionCycleCoordinator::spawn(
            &self.config,
            CyclePipeline {
                capture: AudioCaptureWindow::new(
                    c.microphone.clone(),
                    c.extractor.clone(),
                    c.permissions.clone(),
                    self.config.audio_sample_rate,
                    self.config.capture_slack(),
                ),
                evaluator: c.evaluator.clone(),
                notifier: c.notifier.clone(),
                location: c.location.clone(),
            },
        );

        let shared = Arc::new(HostShared {
            started: Instant::now(),
            foreground: self.foreground.clone(),
            monitor_stats: Arc::new(MonitorStats::default()),
            health: SensorHealth::new("Accel", self.config.sensor_silence()),
            restart: Mutex::new(RestartState::new(
                "Accel",
                self.config.max_sensor_restarts,
                std::time::Duration::from_millis(self.config.restart_base_cooldown_ms),
            )),
            cycle: coordinator.status(),
            cycles: coordinator.stats_view(),
        });

        let (stop_tx, stop_rx) = watch::channel(false);
        let supervisor = tokio::spawn(supervise_sensor(
            self.config.clone(),
            c.sources.clone(),
            c.permissions.clone(),
            coordinator.trigger_sender(),
            shared.clone(),
            stop_rx.clone(),
        ));
        let status_writer = tokio::spawn(write_status(
            self.status_path(),
            self.config.status_interval(),
            shared.clone(),
            stop_rx,
        ));

        log::info!(
            "[host] Started (threshold {:.1} m/s², capture {} ms, endpoint {})",
            self.config.trigger_threshold,
            self.config.capture_duration_ms,
            self.config.endpoint
        );
        self.running = Some(Running {
            coordinator,
            shared,
            stop_tx,
            supervisor,
            status_writer,
        });
        Ok(())
    }

    /// Stop the sensor first, then give any in-flight cycle its grace period
    pub async fn stop(&mut self) -> MonitorResult<()> {
        let running = self.running.take().ok_or(MonitorError::NotRunning)?;
        running.stop_tx.send_replace(true);

        if let Err(e) = running.supervisor.await {
            log::error!("[host] Sensor supervisor ended abnormally: {}", e);
        }
        running.coordinator.shutdown().await?;
        let _ = running.status_writer.await;

        let status = running.shared.snapshot(false);
        if let Err(e) = status.save(&self.status_path()) {
            log::warn!("[host] Failed to write final status: {}", e);
        }
        log::info!("[host] Stopped: {}", status.summary());
        self.last_status = Some(status);
        Ok(())
    }

    /// Record an OS foreground/background transition. The pipeline keeps running either way.
    pub fn set_foreground(&self, foreground: bool) {
        let previous = self.foreground.swap(foreground, Ordering::SeqCst);
        if previous != foreground {
            log::info!(
                "[host] App moved to {}",
                if foreground { "foreground" } else { "background" }
            );
        }
    }

    pub fn is_foreground(&self) -> bool {
        self.foreground.load(Ordering::SeqCst)
    }

    /// User-initiated SOS
    pub fn request_manual(&self) -> MonitorResult<()> {
        self.running
            .as_ref()
            .ok_or(MonitorError::NotRunning)?
            .coordinator
            .request_manual()
    }

    pub fn cycle_status(&self) -> Option<CycleStatus> {
        self.running.as_ref().map(|r| r.coordinator.status())
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<AlertRecord> {
        self.collaborators.notifier.subscribe()
    }

    pub fn status(&self) -> LiveStatus {
        match self.running.as_ref() {
            Some(running) => running.shared.snapshot(true),
            None => self.last_status.clone().unwrap_or_default(),
        }
    }

    fn status_path(&self) -> PathBuf {
        PathBuf::from(&self.config.output_dir).join(LIVE_STATUS_FILE)
    }
}

// ─── Sensor supervision ─────────────────────────────────────────────────────

/// Watch a running monitor until it fails, goes silent, or a stop is requested.
/// Returns None on stop.
async fn watch_monitor(
    monitor: &mut MonitorHandle,
    shared: &HostShared,
    stop: &mut watch::Receiver<bool>,
) -> Option<SensorFailure> {
    let health = &shared.health;
    let samples_at_start = shared.monitor_stats.samples();
    let mut check = interval((health.silence_threshold / 2).max(std::time::Duration::from_millis(10)));
    check.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            result = monitor.wait() => {
                shared.confirm_recovery(samples_at_start);
                return Some(match result {
                    Err(failure) => failure,
                    Ok(()) => SensorFailure::StreamEnded("sensor stream closed".to_string()),
                });
            }
            _ = check.tick() => {
                shared.confirm_recovery(samples_at_start);
                if health.is_silent() {
                    let silence = health.time_since_last_update().unwrap_or_default();
                    log::warn!("[host] {}", health.format_status());
                    return Some(SensorFailure::StreamStalled(silence));
                }
            }
            _ = stop.changed() => return None,
        }
    }
}

/// Keep a motion monitor running, restarting it with backoff after failures
async fn supervise_sensor(
    config: ServiceConfig,
    sources: SourceFactory,
    permissions: Arc<dyn PermissionGate>,
    triggers: mpsc::Sender<Trigger>,
    shared: Arc<HostShared>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        if *stop.borrow() {
            return;
        }

        let started = MotionMonitor::start(
            &config,
            (sources)(),
            permissions.as_ref(),
            triggers.clone(),
            shared.cycle.clone(),
            Some(shared.health.clone()),
            shared.monitor_stats.clone(),
        );

        let failure = match started {
            Ok(mut monitor) => {
                shared.health.update();
                match watch_monitor(&mut monitor, &shared, &mut stop).await {
                    None => {
                        if let Err(e) = monitor.stop().await {
                            log::debug!("[host] Sensor ended with {} during stop", e);
                        }
                        return;
                    }
                    Some(failure) => {
                        let _ = monitor.stop().await;
                        shared.record_sensor_failure();
                        failure
                    }
                }
            }
            Err(failure) => {
                shared.record_sensor_failure();
                failure
            }
        };
        log::error!("[host] Motion sensor failed: {}", failure);

        let (can_restart, wait) = match shared.with_restart(|r| (r.can_restart(), r.wait_time())) {
            Ok(state) => state,
            Err(e) => {
                log::error!("[host] {}", e);
                return;
            }
        };
        if !can_restart {
            log::error!("[host] Giving up on the motion sensor; manual SOS still available");
            return;
        }
        log::info!("[host] Restarting motion sensor in {:.1}s", wait.as_secs_f64());
        tokio::select! {
            _ = sleep(wait) => {}
            _ = stop.changed() => return,
        }
    }
}

async fn write_status(
    path: PathBuf,
    period: std::time::Duration,
    shared: Arc<HostShared>,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let status = shared.snapshot(true);
                if let Err(e) = status.save(&path) {
                    log::warn!("[host] Failed to write {}: {}", path.display(), e);
                }
                let restart = shared
                    .restart
                    .lock()
                    .map(|r| r.status())
                    .unwrap_or_default();
                log::debug!("[host] {} | {} | {}", status.summary(), shared.health.format_status(), restart);
            }
            _ = stop.changed() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{SegmentEnergyExtractor, SimulatedMicrophone};
    use crate::coordinator::CycleState;
    use crate::fusion::{FixedLocation, Location, NoLocation, RiskFusionClient, DETECT_PATH};
    use crate::notifier::AlertLevel;
    use crate::permissions::StaticPermissions;
    use crate::sensors::{AccelSource, ScriptStep, ScriptedAccelSource, SimulatedAccelSource};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;
    use tokio::time::Duration;

    fn temp_output(tag: &str) -> String {
        std::env::temp_dir()
            .join(format!(
                "safety_monitor_host_{}_{}_{}",
                tag,
                std::process::id(),
                chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
            ))
            .to_string_lossy()
            .into_owned()
    }

    fn config(tag: &str) -> ServiceConfig {
        ServiceConfig {
            sample_interval_ms: 10,
            capture_duration_ms: 200,
            capture_slack_ms: 200,
            network_timeout_ms: 1000,
            sensor_silence_ms: 300,
            restart_base_cooldown_ms: 50,
            status_interval_ms: 50,
            output_dir: temp_output(tag),
            ..ServiceConfig::default()
        }
    }

    async fn fusion_server(reply: Value) -> String {
        let app = Router::new().route(
            DETECT_PATH,
            post(move || {
                let reply = reply.clone();
                async move { Json(reply) }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn collaborators(sources: SourceFactory, evaluator: Arc<dyn RiskEvaluator>) -> HostCollaborators {
        HostCollaborators {
            sources,
            microphone: Arc::new(SimulatedMicrophone::new(0.4)),
            extractor: Arc::new(SegmentEnergyExtractor),
            permissions: Arc::new(StaticPermissions::granted()),
            evaluator,
            location: Arc::new(NoLocation),
            notifier: Arc::new(AlertNotifier::new(vec![])),
        }
    }

    fn resting_sources() -> SourceFactory {
        Arc::new(|| Box::new(SimulatedAccelSource::new(None)) as Box<dyn AccelSource>)
    }

    fn unreachable_evaluator() -> Arc<dyn RiskEvaluator> {
        Arc::new(RiskFusionClient::new("http://127.0.0.1:9", Duration::from_secs(1), None).unwrap())
    }

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let cfg = config("lifecycle");
        let mut host = BackgroundExecutionHost::new(cfg.clone(), collaborators(resting_sources(), unreachable_evaluator()));

        assert_eq!(host.state(), HostState::Stopped);
        assert_eq!(host.stop().await, Err(MonitorError::NotRunning));
        assert_eq!(host.request_manual(), Err(MonitorError::NotRunning));

        host.start().unwrap();
        assert_eq!(host.state(), HostState::Running);
        assert_eq!(host.start(), Err(MonitorError::AlreadyRunning));

        host.stop().await.unwrap();
        assert_eq!(host.state(), HostState::Stopped);

        // Restartable after a clean stop
        host.start().unwrap();
        host.stop().await.unwrap();
        let _ = std::fs::remove_dir_all(cfg.output_dir);
    }

    #[tokio::test]
    async fn test_invalid_config_refused() {
        let cfg = ServiceConfig {
            trigger_threshold: -1.0,
            ..config("invalid")
        };
        let mut host = BackgroundExecutionHost::new(cfg, collaborators(resting_sources(), unreachable_evaluator()));
        assert!(matches!(host.start(), Err(MonitorError::InvalidConfig(_))));
        assert_eq!(host.state(), HostState::Stopped);
    }

    #[tokio::test]
    async fn test_impact_to_alert_end_to_end() {
        let base = fusion_server(json!({
            "is_emergency": true,
            "fused_risk_score": 0.82,
            "confidence_level": 0.9,
            "message": "fall detected"
        }))
        .await;
        let cfg = ServiceConfig {
            endpoint: base,
            ..config("e2e")
        };
        let sources: SourceFactory = Arc::new(|| {
            Box::new(ScriptedAccelSource::new(
                std::iter::repeat(ScriptStep::Sample { x: 0.0, y: 0.0, z: 9.8 })
                    .take(5)
                    .chain([ScriptStep::Sample { x: 10.0, y: 10.0, z: 10.0 }])
                    .chain(std::iter::repeat(ScriptStep::Sample { x: 0.0, y: 0.0, z: 9.8 }).take(500)),
            )) as Box<dyn AccelSource>
        });
        let mut collab = collaborators(sources, Arc::new(RiskFusionClient::from_config(&cfg).unwrap()));
        collab.location = Arc::new(FixedLocation(Location { latitude: 40.7, longitude: -74.0 }));

        let mut host = BackgroundExecutionHost::new(cfg.clone(), collab);
        let mut alerts = host.subscribe_alerts();
        host.start().unwrap();

        let record = tokio::time::timeout(Duration::from_secs(5), alerts.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.notification.level, AlertLevel::Sos);
        assert!(record.notification.body.contains("0.82"));

        let mut status = host.cycle_status().unwrap();
        assert!(status.wait_for(CycleState::Idle).await);
        tokio::time::sleep(Duration::from_millis(120)).await;

        let live: LiveStatus = serde_json::from_str(
            &std::fs::read_to_string(PathBuf::from(&cfg.output_dir).join(LIVE_STATUS_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(live.emergencies, 1);
        assert!(live.samples > 0);

        host.stop().await.unwrap();
        assert_eq!(host.status().cycles_started, 1);
        assert!(!host.status().running);
        let _ = std::fs::remove_dir_all(cfg.output_dir);
    }

    #[tokio::test]
    async fn test_background_does_not_pause_pipeline() {
        let base = fusion_server(json!({
            "is_emergency": false,
            "fused_risk_score": 0.3,
            "confidence_level": 0.8
        }))
        .await;
        let cfg = ServiceConfig {
            endpoint: base,
            ..config("background")
        };
        let evaluator = Arc::new(RiskFusionClient::from_config(&cfg).unwrap());
        let mut host = BackgroundExecutionHost::new(cfg.clone(), collaborators(resting_sources(), evaluator));
        let mut alerts = host.subscribe_alerts();
        host.start().unwrap();

        host.set_foreground(false);
        assert!(!host.is_foreground());
        host.request_manual().unwrap();

        // Default policy forces the alert for SOS
        let record = tokio::time::timeout(Duration::from_secs(5), alerts.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.notification.level, AlertLevel::Sos);
        assert!(!host.status().foreground);

        host.stop().await.unwrap();
        let _ = std::fs::remove_dir_all(cfg.output_dir);
    }

    #[tokio::test]
    async fn test_failed_sensor_is_restarted() {
        let cfg = config("restart");
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = builds.clone();
        let sources: SourceFactory = Arc::new(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Box::new(ScriptedAccelSource::new(vec![ScriptStep::Fail(SensorFailure::Unavailable(
                    "driver crashed".to_string(),
                ))])) as Box<dyn AccelSource>
            } else {
                Box::new(SimulatedAccelSource::new(None)) as Box<dyn AccelSource>
            }
        });
        let mut host = BackgroundExecutionHost::new(cfg.clone(), collaborators(sources, unreachable_evaluator()));
        host.start().unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        let status = host.status();
        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert_eq!(status.sensor_restarts, 1);
        assert!(!status.sensor_restart_pending);
        assert!(status.sensor_healthy);

        host.stop().await.unwrap();
        let _ = std::fs::remove_dir_all(cfg.output_dir);
    }

    #[tokio::test]
    async fn test_sensor_failing_after_open_backs_off_and_gives_up() {
        let cfg = ServiceConfig {
            max_sensor_restarts: 3,
            ..config("give_up")
        };
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = builds.clone();
        let sources: SourceFactory = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            // Opens fine, dies on the first read
            Box::new(ScriptedAccelSource::new(vec![ScriptStep::Fail(SensorFailure::Unavailable(
                "driver crashed".to_string(),
            ))])) as Box<dyn AccelSource>
        });
        let mut host = BackgroundExecutionHost::new(cfg.clone(), collaborators(sources, unreachable_evaluator()));
        host.start().unwrap();

        // 50 + 75 + 112 ms of cooldown, then the cap is reached
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let status = host.status();
        assert_eq!(builds.load(Ordering::SeqCst), 4);
        assert_eq!(status.sensor_restarts, 0);
        assert!(status.sensor_restart_pending);
        assert!(!status.sensor_can_restart);

        host.stop().await.unwrap();
        let _ = std::fs::remove_dir_all(cfg.output_dir);
    }

    #[tokio::test]
    async fn test_refused_open_is_retried() {
        let cfg = config("open_refused");
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = builds.clone();
        let sources: SourceFactory = Arc::new(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Box::new(
                    ScriptedAccelSource::from_magnitudes(&[9.8])
                        .failing_open(SensorFailure::Unavailable("sensor busy".to_string())),
                ) as Box<dyn AccelSource>
            } else {
                Box::new(SimulatedAccelSource::new(None)) as Box<dyn AccelSource>
            }
        });
        let mut host = BackgroundExecutionHost::new(cfg.clone(), collaborators(sources, unreachable_evaluator()));
        host.start().unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        let status = host.status();
        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert_eq!(status.sensor_restarts, 1);
        assert!(!status.sensor_restart_pending);
        assert!(status.samples > 0);

        host.stop().await.unwrap();
        let _ = std::fs::remove_dir_all(cfg.output_dir);
    }

    #[tokio::test]
    async fn test_permissions_changed_while_running() {
        let base = fusion_server(json!({
            "is_emergency": false,
            "fused_risk_score": 0.4,
            "confidence_level": 0.7
        }))
        .await;
        let cfg = ServiceConfig {
            endpoint: base,
            max_sensor_restarts: 1,
            ..config("permissions")
        };
        let permissions = Arc::new(StaticPermissions::granted());
        permissions.set_motion(false);
        permissions.set_microphone(false);
        let mut collab = collaborators(resting_sources(), Arc::new(RiskFusionClient::from_config(&cfg).unwrap()));
        collab.permissions = permissions.clone();

        let mut host = BackgroundExecutionHost::new(cfg.clone(), collab);
        let mut alerts = host.subscribe_alerts();
        host.start().unwrap();

        // No motion grant: the monitor never starts, manual SOS still works
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(host.status().samples, 0);
        assert!(!host.status().sensor_can_restart);

        host.request_manual().unwrap();
        let denied = tokio::time::timeout(Duration::from_secs(5), alerts.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(denied.notification.level, AlertLevel::Diagnostic);
        assert!(denied.notification.body.contains("SOS"));

        let mut cycle = host.cycle_status().unwrap();
        assert!(cycle.wait_for(CycleState::Idle).await);
        permissions.set_microphone(true);
        host.request_manual().unwrap();
        let granted = tokio::time::timeout(Duration::from_secs(5), alerts.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(granted.notification.level, AlertLevel::Sos);
        assert_ne!(granted.cycle_id, denied.cycle_id);

        host.stop().await.unwrap();
        let _ = std::fs::remove_dir_all(cfg.output_dir);
    }

    #[tokio::test]
    async fn test_silent_sensor_is_restarted() {
        let cfg = config("silent");
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = builds.clone();
        let sources: SourceFactory = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            // Three readings, then nothing
            Box::new(ScriptedAccelSource::from_magnitudes(&[9.8, 9.8, 9.8])) as Box<dyn AccelSource>
        });
        let mut host = BackgroundExecutionHost::new(cfg.clone(), collaborators(sources, unreachable_evaluator()));
        host.start().unwrap();

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert!(builds.load(Ordering::SeqCst) >= 2);
        assert!(host.status().sensor_restarts >= 1);

        host.stop().await.unwrap();
        let _ = std::fs::remove_dir_all(cfg.output_dir);
    }
}
