//! Reconnect state machine.
//!
//! All connection bookkeeping goes through [`ReconnectMachine::step`]: the
//! session manager feeds it inputs (open, transport ack, failure, retry
//! timer, close, manual reset) and performs the returned [`Effect`]. The
//! machine itself never touches a transport or a timer.

use crate::types::{ConnectionStatus, FailureKind};
use std::time::Duration;

/// Exponential backoff parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
    pub max_delay: Option<Duration>,
}

impl ReconnectPolicy {
    /// Delay before a retry, where `attempt` is the count before this retry.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    /// Full retry schedule, first retry first.
    pub fn schedule(&self) -> Vec<Duration> {
        (0..self.max_attempts).map(|a| self.delay_for(a)).collect()
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(2000),
            max_attempts: 5,
            max_delay: None,
        }
    }
}

/// Reconnect state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    /// Waiting for retry number `attempt`.
    Backoff { attempt: u32, delay: Duration },
    /// Gave up; only a reset leaves this state.
    Failed,
}

/// Inputs that drive the reconnect machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionInput {
    /// Open a connection with the current attempt count.
    Open,
    /// Transport acknowledged the subscription.
    Acknowledged,
    /// Transport reported a failure.
    Failed(FailureKind),
    /// The pending retry timer fired.
    RetryDue,
    /// Caller-initiated teardown.
    Close,
    /// Manual reconnect: clear the attempt count and open.
    Reset,
}

/// What the caller of [`ReconnectMachine::step`] must do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Effect {
    Connect,
    Ready,
    ScheduleRetry { delay: Duration, attempt: u32 },
    GiveUp,
    Disconnect,
    /// Input did not apply to the current state.
    Ignore,
}

/// Pure reconnect state machine with an attempt counter.
#[derive(Debug)]
pub struct ReconnectMachine {
    policy: ReconnectPolicy,
    state: SessionState,
    attempt: u32,
    status: ConnectionStatus,
}

impl ReconnectMachine {
    /// Creates an idle machine with a zero attempt counter.
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: SessionState::Idle,
            attempt: 0,
            status: ConnectionStatus::Disconnected,
        }
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Retries since the last successful connect.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Connection status a caller should see for the current state.
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Backoff policy in use.
    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Override the visible status without changing state (offline signal).
    pub fn force_status(&mut self, status: ConnectionStatus) {
        self.status = status;
    }

    /// Start over for a different subscription.
    pub fn clear_attempts(&mut self) {
        self.attempt = 0;
    }

    /// Applies one input and returns the side effect to perform.
    pub fn step(&mut self, input: SessionInput) -> Effect {
        match (self.state, input) {
            (_, SessionInput::Reset) => {
                self.attempt = 0;
                self.enter(SessionState::Connecting, ConnectionStatus::Connecting);
                Effect::Connect
            }
            (_, SessionInput::Open) => {
                self.enter(SessionState::Connecting, ConnectionStatus::Connecting);
                Effect::Connect
            }
            (_, SessionInput::Close) => {
                self.enter(SessionState::Idle, ConnectionStatus::Disconnected);
                Effect::Disconnect
            }
            (SessionState::Connecting, SessionInput::Acknowledged) => {
                self.attempt = 0;
                self.enter(SessionState::Connected, ConnectionStatus::Connected);
                Effect::Ready
            }
            (SessionState::Connecting | SessionState::Connected, SessionInput::Failed(kind)) => {
                if self.attempt < self.policy.max_attempts {
                    let delay = self.policy.delay_for(self.attempt);
                    self.attempt += 1;
                    self.enter(
                        SessionState::Backoff {
                            attempt: self.attempt,
                            delay,
                        },
                        kind.status(),
                    );
                    Effect::ScheduleRetry {
                        delay,
                        attempt: self.attempt,
                    }
                } else {
                    self.enter(SessionState::Failed, ConnectionStatus::Error);
                    Effect::GiveUp
                }
            }
            (SessionState::Backoff { .. }, SessionInput::RetryDue) => {
                self.enter(SessionState::Connecting, ConnectionStatus::Connecting);
                Effect::Connect
            }
            _ => Effect::Ignore,
        }
    }

    fn enter(&mut self, state: SessionState, status: ConnectionStatus) {
        self.state = state;
        self.status = status;
    }
}
