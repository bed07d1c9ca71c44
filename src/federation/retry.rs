//! Retry policy and per-destination delivery state machine
//!
//! Pure logic with no I/O: the delivery engine and the job queue drive it
//! with observed outcomes and the current time, and wait until the
//! destination is eligible again.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::config::{DeliveryConfig, InboundConfig};

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts allowed, including the first
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before the attempt following attempt number `attempt` (1-based).
    ///
    /// `base * 2^(attempt-1)`, capped at `max_backoff`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let pow = attempt.saturating_sub(1).min(20);
        self.base_backoff
            .saturating_mul(1u32 << pow)
            .min(self.max_backoff)
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows_another(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

impl From<&DeliveryConfig> for RetryPolicy {
    fn from(config: &DeliveryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

impl From<&InboundConfig> for RetryPolicy {
    fn from(config: &InboundConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

/// Add up to 10% random jitter.
pub fn with_jitter(delay: Duration) -> Duration {
    let max_jitter_ms = (delay.as_millis() / 10) as u64;
    if max_jitter_ms == 0 {
        return delay;
    }
    let jitter_ms = rand::thread_rng().gen_range(0..=max_jitter_ms);
    delay + Duration::from_millis(jitter_ms)
}

/// Classified result of one HTTP attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Delivered,
    /// Worth trying again later (408, 429, 5xx, network errors)
    Retryable(String),
    /// The destination refused; retrying cannot help
    Rejected(String),
}

impl AttemptOutcome {
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => Self::Delivered,
            408 | 429 | 500..=599 => Self::Retryable(format!("HTTP {}", status)),
            other => Self::Rejected(format!("HTTP {}", other)),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Retryable(_) => "retryable",
            Self::Rejected(_) => "rejected",
        }
    }
}

/// Where one destination stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationState {
    Pending,
    Delivered,
    Failed,
}

/// What to do after recording an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    /// Wait this long, then attempt again
    RetryAfter(Duration),
    /// The destination reached a terminal state
    Done,
}

/// Delivery progress toward a single inbox
#[derive(Debug, Clone)]
pub struct DestinationDelivery {
    pub url: String,
    attempts: u32,
    state: DestinationState,
    last_error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    next_eligible_at: Option<DateTime<Utc>>,
}

impl DestinationDelivery {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            attempts: 0,
            state: DestinationState::Pending,
            last_error: None,
            started_at: None,
            finished_at: None,
            next_eligible_at: None,
        }
    }

    /// Note that an attempt is going out at `now`. Only the first one sets
    /// the start time.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) {
        self.started_at.get_or_insert(now);
    }

    /// Record the outcome of the attempt that finished at `now`.
    pub fn record(&mut self, outcome: AttemptOutcome, policy: &RetryPolicy, now: DateTime<Utc>) -> NextStep {
        if self.is_terminal() {
            return NextStep::Done;
        }
        self.attempts += 1;
        self.started_at.get_or_insert(now);

        let next = match outcome {
            AttemptOutcome::Delivered => {
                self.state = DestinationState::Delivered;
                self.last_error = None;
                NextStep::Done
            }
            AttemptOutcome::Rejected(error) => {
                self.state = DestinationState::Failed;
                self.last_error = Some(error);
                NextStep::Done
            }
            AttemptOutcome::Retryable(error) => {
                self.last_error = Some(error);
                if policy.allows_another(self.attempts) {
                    NextStep::RetryAfter(policy.delay_after(self.attempts))
                } else {
                    self.state = DestinationState::Failed;
                    NextStep::Done
                }
            }
        };

        match next {
            NextStep::RetryAfter(delay) => {
                let eligible_at = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|delay| now.checked_add_signed(delay))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                self.next_eligible_at = Some(eligible_at);
            }
            NextStep::Done => {
                self.next_eligible_at = None;
                self.finished_at = Some(now);
            }
        }
        next
    }

    /// Whether another attempt may go out at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        !self.is_terminal() && self.next_eligible_at.is_none_or(|at| at <= now)
    }

    /// Time left until the destination is eligible, zero if it already is.
    pub fn wait_from(&self, now: DateTime<Utc>) -> Duration {
        self.next_eligible_at
            .and_then(|at| (at - now).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn state(&self) -> DestinationState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state != DestinationState::Pending
    }

    pub fn is_delivered(&self) -> bool {
        self.state == DestinationState::Delivered
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn next_eligible_at(&self) -> Option<DateTime<Utc>> {
        self.next_eligible_at
    }
}
