use tokio::time::{Duration, Instant};

const MAX_COOLDOWN_SECS: f64 = 30.0;

/// Restart bookkeeping for one sensor subscription.
///
/// Cooldown grows by 1.5x per failed attempt, capped at 30 seconds, and
/// resets on success.
#[derive(Clone, Debug)]
pub struct RestartState {
    pub name: String,
    pub restart_needed: bool,
    pub next_retry_time: Instant,
    pub attempts: u32,
    pub max_attempts: u32,
    pub base_cooldown: Duration,
    pub current_cooldown: Duration,
    /// Restarts that succeeded over the lifetime of the host
    pub restarts: u32,
}

impl RestartState {
    pub fn new(name: &str, max_attempts: u32, base_cooldown: Duration) -> Self {
        RestartState {
            name: name.to_string(),
            restart_needed: false,
            next_retry_time: Instant::now(),
            attempts: 0,
            max_attempts,
            base_cooldown,
            current_cooldown: base_cooldown,
            restarts: 0,
        }
    }

    /// Signal that the sensor needs a restart; the first retry waits one base cooldown
    pub fn signal_restart(&mut self) {
        if !self.restart_needed {
            log::warn!("[RESTART] Signaling {} restart", self.name);
            self.restart_needed = true;
            self.next_retry_time = Instant::now() + self.current_cooldown;
        }
    }

    /// Check if enough time has passed for retry
    pub fn can_retry(&self) -> bool {
        Instant::now() >= self.next_retry_time && self.restart_needed
    }

    /// Time left before the next retry is allowed
    pub fn wait_time(&self) -> Duration {
        self.next_retry_time.saturating_duration_since(Instant::now())
    }

    /// Record a failed restart attempt and calculate next retry time
    pub fn record_failed_attempt(&mut self) {
        self.attempts += 1;

        self.current_cooldown = Duration::from_secs_f64(
            (self.current_cooldown.as_secs_f64() * 1.5).min(MAX_COOLDOWN_SECS),
        );
        self.next_retry_time = Instant::now() + self.current_cooldown;

        log::warn!(
            "[RESTART] {} restart attempt {} failed, next retry in {:.1}s",
            self.name,
            self.attempts,
            self.current_cooldown.as_secs_f64()
        );
    }

    /// Record a successful restart and reset state
    pub fn record_success(&mut self) {
        log::info!(
            "[RESTART] ✓ {} restarted successfully after {} failed attempt(s)",
            self.name,
            self.attempts
        );
        self.restart_needed = false;
        self.attempts = 0;
        self.restarts += 1;
        self.current_cooldown = self.base_cooldown;
        self.next_retry_time = Instant::now();
    }

    /// Check if max attempts exceeded
    pub fn can_restart(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Get formatted status
    pub fn status(&self) -> String {
        if !self.restart_needed {
            return format!("{}: OK", self.name);
        }

        if !self.can_restart() {
            return format!("{}: MAX_ATTEMPTS_EXCEEDED", self.name);
        }

        if !self.can_retry() {
            return format!(
                "{}: RESTART_PENDING (waiting {:.1}s, attempt {}/{})",
                self.name,
                self.wait_time().as_secs_f64(),
                self.attempts,
                self.max_attempts
            );
        }

        format!(
            "{}: READY_TO_RESTART (attempt {}/{})",
            self.name, self.attempts, self.max_attempts
        )
    }
}
