//! Fall and emergency detection pipeline.
//!
//! An accelerometer threshold opens a detection cycle, a short audio window
//! is captured, and a remote fusion service decides whether to alert. At most
//! one cycle runs at a time; the host keeps the whole thing alive in the
//! background and restarts the sensor when it fails.

pub mod audio;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fusion;
pub mod health_monitor;
pub mod host;
pub mod live_status;
pub mod motion_monitor;
pub mod notifier;
pub mod permissions;
pub mod restart_manager;
pub mod sensors;

pub use config::{ManualTriggerPolicy, ServiceConfig};
pub use coordinator::{CycleId, CycleState, CycleStatus, DetectionCycle, DetectionCycleCoordinator, Outcome};
pub use error::{CaptureError, MonitorError, MonitorResult, NetworkError, SensorFailure};
pub use fusion::{Decision, Evidence, RiskEvaluator, RiskFusionClient};
pub use host::{BackgroundExecutionHost, HostCollaborators, HostState};
pub use motion_monitor::{MotionMonitor, Trigger, TriggerSource};
pub use notifier::{AlertNotifier, AlertRecord, Notification};
