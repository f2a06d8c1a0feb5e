use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{timeout, Duration};

use crate::audio::AudioCaptureWindow;
use crate::config::{ManualTriggerPolicy, ServiceConfig};
use crate::error::{CaptureError, MonitorError, MonitorResult, NetworkError};
use crate::fusion::{AudioEvidence, Decision, Evidence, LocationProvider, RiskEvaluator};
use crate::motion_monitor::{Trigger, TriggerSource};
use crate::notifier::AlertNotifier;
use crate::sensors::MotionSample;

/// Monotonic per-process cycle identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CycleId(pub u64);

impl fmt::Display for CycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cycle-{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Idle,
    Triggered,
    Capturing,
    Evaluating,
    Deciding,
    Alerting,
    Clearing,
    Failed,
}

impl CycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleState::Idle => "IDLE",
            CycleState::Triggered => "TRIGGERED",
            CycleState::Capturing => "CAPTURING",
            CycleState::Evaluating => "EVALUATING",
            CycleState::Deciding => "DECIDING",
            CycleState::Alerting => "ALERTING",
            CycleState::Clearing => "CLEARING",
            CycleState::Failed => "FAILED",
        }
    }
}

/// Read-only view of the coordinator's state cell
#[derive(Clone, Debug)]
pub struct CycleStatus {
    rx: watch::Receiver<CycleState>,
}

impl CycleStatus {
    pub(crate) fn new(rx: watch::Receiver<CycleState>) -> Self {
        Self { rx }
    }

    pub fn current(&self) -> CycleState {
        *self.rx.borrow()
    }

    pub fn is_idle(&self) -> bool {
        self.current() == CycleState::Idle
    }

    /// Wait until the cell holds `state`. False if the coordinator is gone.
    pub async fn wait_for(&mut self, state: CycleState) -> bool {
        self.rx.wait_for(|s| *s == state).await.is_ok()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Emergency,
    Clear,
    Failed,
    /// Abandoned at shutdown
    Cancelled,
}

/// Why a cycle ended in `Failed`
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StageError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Network(#[from] NetworkError),
}

/// Record of one trigger's path through the state machine
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DetectionCycle {
    pub id: CycleId,
    pub source: TriggerSource,
    pub trigger_sample: MotionSample,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub decision: Option<Decision>,
    pub outcome: Option<Outcome>,
    pub failure: Option<String>,
}

impl DetectionCycle {
    fn new(id: CycleId, trigger: &Trigger) -> Self {
        Self {
            id,
            source: trigger.source,
            trigger_sample: trigger.sample.clone(),
            started_at: Utc::now(),
            finished_at: None,
            decision: None,
            outcome: None,
            failure: None,
        }
    }

    fn finish(&mut self, outcome: Outcome) {
        self.outcome = Some(outcome);
        self.finished_at = Some(Utc::now());
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CoordinatorStats {
    pub cycles_started: u64,
    pub emergencies: u64,
    pub clears: u64,
    pub failures: u64,
    pub cancelled: u64,
    /// Triggers that reached the coordinator while a cycle was active
    pub triggers_dropped: u64,
    pub last_cycle: Option<DetectionCycle>,
}

/// Shared read access to the coordinator's counters
#[derive(Clone, Debug)]
pub struct StatsView(Arc<Mutex<CoordinatorStats>>);

impl StatsView {
    pub fn snapshot(&self) -> CoordinatorStats {
        self.0.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Collaborators a cycle runs through
pub struct CyclePipeline {
    pub capture: AudioCaptureWindow,
    pub evaluator: Arc<dyn RiskEvaluator>,
    pub notifier: Arc<AlertNotifier>,
    pub location: Arc<dyn LocationProvider>,
}

/// Immutable per-coordinator settings and collaborators shared with cycle tasks
struct CycleContext {
    pipeline: CyclePipeline,
    state: watch::Sender<CycleState>,
    capture_duration: Duration,
    network_timeout: Duration,
    sample_rate: u32,
    manual_policy: ManualTriggerPolicy,
    manual_score_threshold: f64,
}

impl CycleContext {
    fn set(&self, id: CycleId, state: CycleState) {
        log::debug!("[{}] → {}", id, state.as_str());
        self.state.send_replace(state);
    }

    /// Idle → Triggered as one atomic step
    fn try_begin(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == CycleState::Idle {
                *state = CycleState::Triggered;
                true
            } else {
                false
            }
        })
    }

    fn should_alert(&self, source: TriggerSource, decision: &Decision) -> bool {
        match (source, self.manual_policy) {
            (TriggerSource::Motion, _) | (TriggerSource::Manual, ManualTriggerPolicy::FollowDecision) => {
                decision.is_emergency
            }
            (TriggerSource::Manual, ManualTriggerPolicy::ForceAlert) => true,
            (TriggerSource::Manual, ManualTriggerPolicy::ScoreThreshold) => {
                decision.is_emergency || decision.fused_risk_score >= self.manual_score_threshold
            }
        }
    }

    async fn verify(&self, id: CycleId, trigger: &Trigger) -> Result<Decision, StageError> {
        self.set(id, CycleState::Capturing);
        let features = self.pipeline.capture.capture(self.capture_duration).await?;

        self.set(id, CycleState::Evaluating);
        let evidence = Evidence {
            cycle_id: id,
            motion: match trigger.source {
                TriggerSource::Motion => Some(trigger.sample.clone()),
                TriggerSource::Manual => None,
            },
            audio: AudioEvidence {
                features,
                duration: self.capture_duration,
                sample_rate: self.sample_rate,
            },
            location: self.pipeline.location.current(),
            timestamp: Utc::now(),
        };
        let decision = timeout(self.network_timeout, self.pipeline.evaluator.evaluate(&evidence))
            .await
            .unwrap_or(Err(NetworkError::Timeout))?;
        Ok(decision)
    }

    /// Drive one cycle from Triggered to a terminal state and notify.
    /// The caller returns the cell to Idle.
    async fn run_cycle(self: Arc<Self>, id: CycleId, trigger: Trigger) -> DetectionCycle {
        let mut cycle = DetectionCycle::new(id, &trigger);
        log::info!(
            "[{}] TRIGGERED by {:?} ({:.2} m/s²)",
            id,
            trigger.source,
            trigger.sample.magnitude
        );

        match self.verify(id, &trigger).await {
            Ok(decision) => {
                self.set(id, CycleState::Deciding);
                let alert = self.should_alert(trigger.source, &decision);
                if alert {
                    self.set(id, CycleState::Alerting);
                    cycle.finish(Outcome::Emergency);
                } else {
                    self.set(id, CycleState::Clearing);
                    cycle.finish(Outcome::Clear);
                }
                log::info!(
                    "[{}] Decision: emergency={} score={:.2} confidence={:.2} → {}",
                    id,
                    decision.is_emergency,
                    decision.fused_risk_score,
                    decision.confidence,
                    if alert { "ALERT" } else { "CLEAR" }
                );
                self.pipeline.notifier.notify(id, &decision, alert);
                cycle.decision = Some(decision);
            }
            Err(e) => {
                self.set(id, CycleState::Failed);
                log::warn!("[{}] Failed: {}", id, e);
                let reason = match trigger.source {
                    TriggerSource::Manual => format!("SOS request could not be verified: {e}"),
                    TriggerSource::Motion => e.to_string(),
                };
                self.pipeline.notifier.notify_failure(id, &reason);
                cycle.failure = Some(e.to_string());
                cycle.finish(Outcome::Failed);
            }
        }
        cycle
    }
}

struct InFlight {
    id: CycleId,
    trigger: Trigger,
    handle: JoinHandle<DetectionCycle>,
}

async fn join_in_flight(in_flight: &mut Option<InFlight>) -> Result<DetectionCycle, JoinError> {
    match in_flight {
        Some(flight) => (&mut flight.handle).await,
        None => std::future::pending().await,
    }
}

struct CoordinatorLoop {
    ctx: Arc<CycleContext>,
    stats: Arc<Mutex<CoordinatorStats>>,
    shutdown_grace: Duration,
    next_id: u64,
}

impl CoordinatorLoop {
    async fn run(mut self, mut triggers: mpsc::Receiver<Trigger>, mut shutdown: watch::Receiver<bool>) {
        let mut in_flight: Option<InFlight> = None;
        log::info!("[coordinator] Ready");

        loop {
            tokio::select! {
                received = triggers.recv() => {
                    let Some(trigger) = received else { break };
                    if in_flight.is_some() || !self.ctx.try_begin() {
                        log::warn!(
                            "[coordinator] InvariantViolation: {:?} trigger while {}, dropped",
                            trigger.source,
                            self.ctx.state.borrow().as_str()
                        );
                        self.update_stats(|s| s.triggers_dropped += 1);
                        continue;
                    }
                    let id = CycleId(self.next_id);
                    self.next_id += 1;
                    self.update_stats(|s| s.cycles_started += 1);
                    let handle = tokio::spawn(self.ctx.clone().run_cycle(id, trigger.clone()));
                    in_flight = Some(InFlight { id, trigger, handle });
                }
                joined = join_in_flight(&mut in_flight), if in_flight.is_some() => {
                    if let Some(flight) = in_flight.take() {
                        self.complete(flight, joined);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        if let Some(mut flight) = in_flight.take() {
            log::info!(
                "[coordinator] Shutdown with {} in flight, waiting up to {:.1}s",
                flight.id,
                self.shutdown_grace.as_secs_f64()
            );
            match timeout(self.shutdown_grace, &mut flight.handle).await {
                Ok(joined) => self.complete(flight, joined),
                Err(_) => {
                    flight.handle.abort();
                    let _ = (&mut flight.handle).await;
                    self.cancel(flight);
                }
            }
        }
        self.ctx.state.send_replace(CycleState::Idle);
        log::info!("[coordinator] Stopped");
    }

    fn complete(&self, flight: InFlight, joined: Result<DetectionCycle, JoinError>) {
        let cycle = match joined {
            Ok(cycle) => cycle,
            Err(e) => {
                // Panic inside a stage; the user still hears about it
                log::error!("[{}] Cycle task died: {}", flight.id, e);
                let mut cycle = DetectionCycle::new(flight.id, &flight.trigger);
                cycle.failure = Some(format!("cycle task died: {e}"));
                cycle.finish(Outcome::Failed);
                self.ctx
                    .pipeline
                    .notifier
                    .notify_failure(flight.id, "Safety check stopped unexpectedly");
                cycle
            }
        };
        self.record(cycle);
        self.ctx.set(flight.id, CycleState::Idle);
    }

    fn cancel(&self, flight: InFlight) {
        log::warn!("[{}] Cancelled at shutdown", flight.id);
        let mut cycle = DetectionCycle::new(flight.id, &flight.trigger);
        cycle.failure = Some("cancelled by shutdown".to_string());
        cycle.finish(Outcome::Cancelled);
        self.ctx
            .pipeline
            .notifier
            .notify_failure(flight.id, "Safety check cancelled because monitoring stopped");
        self.record(cycle);
    }

    fn record(&self, cycle: DetectionCycle) {
        self.update_stats(|s| {
            match cycle.outcome {
                Some(Outcome::Emergency) => s.emergencies += 1,
                Some(Outcome::Clear) => s.clears += 1,
                Some(Outcome::Failed) | None => s.failures += 1,
                Some(Outcome::Cancelled) => s.cancelled += 1,
            }
            s.last_cycle = Some(cycle);
        });
    }

    fn update_stats(&self, f: impl FnOnce(&mut CoordinatorStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }
}

pub struct DetectionCycleCoordinator;

impl DetectionCycleCoordinator {
    /// Start the coordinator's event loop
    pub fn spawn(config: &ServiceConfig, pipeline: CyclePipeline) -> CoordinatorHandle {
        let (state_tx, state_rx) = watch::channel(CycleState::Idle);
        // Capacity one: at most one trigger waits, the rest are refused at the monitor
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(CoordinatorStats::default()));

        let ctx = Arc::new(CycleContext {
            pipeline,
            state: state_tx,
            capture_duration: config.capture_duration(),
            network_timeout: config.network_timeout(),
            sample_rate: config.audio_sample_rate,
            manual_policy: config.manual_trigger_policy,
            manual_score_threshold: config.manual_score_threshold,
        });
        let event_loop = CoordinatorLoop {
            ctx,
            stats: stats.clone(),
            shutdown_grace: config.shutdown_grace(),
            next_id: 1,
        };
        let task = tokio::spawn(event_loop.run(trigger_rx, shutdown_rx));

        CoordinatorHandle {
            triggers: trigger_tx,
            status: CycleStatus::new(state_rx),
            shutdown_tx,
            task: Some(task),
            stats,
        }
    }
}

pub struct CoordinatorHandle {
    triggers: mpsc::Sender<Trigger>,
    status: CycleStatus,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    stats: Arc<Mutex<CoordinatorStats>>,
}

impl CoordinatorHandle {
    /// Sender the motion monitor feeds triggers into
    pub fn trigger_sender(&self) -> mpsc::Sender<Trigger> {
        self.triggers.clone()
    }

    pub fn status(&self) -> CycleStatus {
        self.status.clone()
    }

    /// Raise a user-initiated SOS cycle
    pub fn request_manual(&self) -> MonitorResult<()> {
        if !self.status.is_idle() {
            return Err(MonitorError::CycleActive);
        }
        match self.triggers.try_send(Trigger::manual()) {
            Ok(()) => {
                log::info!("[coordinator] Manual SOS requested");
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(MonitorError::CycleActive),
            Err(TrySendError::Closed(_)) => Err(MonitorError::NotRunning),
        }
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.stats_view().snapshot()
    }

    pub fn stats_view(&self) -> StatsView {
        StatsView(self.stats.clone())
    }

    /// Stop accepting triggers; an in-flight cycle gets the shutdown grace period
    pub async fn shutdown(mut self) -> MonitorResult<()> {
        self.shutdown_tx.send_replace(true);
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| MonitorError::Internal(format!("coordinator task: {e}")))?;
        }
        Ok(())
    }
}

impl Drop for CoordinatorHandle {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}
