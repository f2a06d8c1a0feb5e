use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::audio::FeatureVector;
use crate::config::ServiceConfig;
use crate::coordinator::CycleId;
use crate::error::NetworkError;
use crate::sensors::MotionSample;

pub const DETECT_PATH: &str = "/api/safety/emergency-detections/detect_emergency/";

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

/// Where the device is, if anyone knows
pub trait LocationProvider: Send + Sync {
    fn current(&self) -> Option<Location>;
}

pub struct NoLocation;

impl LocationProvider for NoLocation {
    fn current(&self) -> Option<Location> {
        None
    }
}

pub struct FixedLocation(pub Location);

impl LocationProvider for FixedLocation {
    fn current(&self) -> Option<Location> {
        Some(self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AudioEvidence {
    pub features: FeatureVector,
    pub duration: Duration,
    pub sample_rate: u32,
}

/// Everything one cycle knows when it asks for a verdict
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Evidence {
    pub cycle_id: CycleId,
    /// None for manual triggers
    pub motion: Option<MotionSample>,
    pub audio: AudioEvidence,
    pub location: Option<Location>,
    pub timestamp: DateTime<Utc>,
}

/// Verdict from the fusion service. The service is authoritative.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub is_emergency: bool,
    pub fused_risk_score: f64,
    pub confidence: f64,
    #[serde(default)]
    pub message: String,
}

impl Decision {
    fn checked(self) -> Result<Self, NetworkError> {
        for (name, value) in [
            ("fused_risk_score", self.fused_risk_score),
            ("confidence_level", self.confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(NetworkError::ServerError {
                    status: None,
                    message: format!("{name} out of range: {value}"),
                });
            }
        }
        Ok(self)
    }
}

/// Anything that can turn evidence into a decision. Called at most once per cycle.
#[async_trait]
pub trait RiskEvaluator: Send + Sync {
    async fn evaluate(&self, evidence: &Evidence) -> Result<Decision, NetworkError>;
}

// ─── Wire format ────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct AccelerometerPayload {
    x: f64,
    y: f64,
    z: f64,
}

#[derive(Serialize)]
struct AudioPayload<'a> {
    mfcc: &'a [f64],
    duration: f64,
    sample_rate: u32,
}

#[derive(Serialize)]
struct DetectionRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    accelerometer_data: Option<AccelerometerPayload>,
    audio_data: AudioPayload<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    longitude: Option<f64>,
    timestamp: String,
}

impl<'a> DetectionRequest<'a> {
    fn from_evidence(evidence: &'a Evidence) -> Self {
        Self {
            accelerometer_data: evidence.motion.as_ref().map(|m| AccelerometerPayload {
                x: m.x,
                y: m.y,
                z: m.z,
            }),
            audio_data: AudioPayload {
                mfcc: evidence.audio.features.as_slice(),
                duration: evidence.audio.duration.as_secs_f64(),
                sample_rate: evidence.audio.sample_rate,
            },
            latitude: evidence.location.map(|l| l.latitude),
            longitude: evidence.location.map(|l| l.longitude),
            timestamp: evidence.timestamp.to_rfc3339(),
        }
    }
}

#[derive(Deserialize)]
struct DetectionResponse {
    is_emergency: bool,
    fused_risk_score: f64,
    confidence_level: f64,
    #[serde(default)]
    message: String,
}

/// HTTP client for the remote risk fusion service.
///
/// One POST per cycle, no retries. The cycle id travels as the
/// `Idempotency-Key` header.
pub struct RiskFusionClient {
    client: reqwest::Client,
    url: String,
    auth_token: Option<String>,
}

impl RiskFusionClient {
    pub fn new(endpoint: &str, timeout: Duration, auth_token: Option<String>) -> Result<Self, NetworkError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("safety_monitor/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| NetworkError::Transport(format!("building client: {e}")))?;

        Ok(Self {
            client,
            url: format!("{}{}", endpoint.trim_end_matches('/'), DETECT_PATH),
            auth_token,
        })
    }

    pub fn from_config(config: &ServiceConfig) -> Result<Self, NetworkError> {
        Self::new(&config.endpoint, config.network_timeout(), config.auth_token.clone())
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn map_send_error(e: reqwest::Error) -> NetworkError {
    if e.is_timeout() {
        NetworkError::Timeout
    } else {
        NetworkError::Transport(e.to_string())
    }
}

#[async_trait]
impl RiskEvaluator for RiskFusionClient {
    async fn evaluate(&self, evidence: &Evidence) -> Result<Decision, NetworkError> {
        let mut request = self
            .client
            .post(&self.url)
            .header("Idempotency-Key", evidence.cycle_id.to_string())
            .json(&DetectionRequest::from_evidence(evidence));
        if let Some(token) = self.auth_token.as_deref() {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(map_send_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            log::warn!("[fusion] {} answered HTTP {}: {}", evidence.cycle_id, status.as_u16(), body);
            return Err(NetworkError::ServerError {
                status: Some(status.as_u16()),
                message: format!("HTTP {}", status.as_u16()),
            });
        }

        let body = response.text().await.map_err(map_send_error)?;
        let parsed: DetectionResponse =
            serde_json::from_str(&body).map_err(|e| NetworkError::ServerError {
                status: Some(status.as_u16()),
                message: format!("undecodable response: {e}"),
            })?;

        Decision {
            is_emergency: parsed.is_emergency,
            fused_risk_score: parsed.fused_risk_score,
            confidence: parsed.confidence_level,
            message: parsed.message,
        }
        .checked()
    }
}
