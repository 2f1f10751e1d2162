//! Connection lifecycle as a pure state machine.
//!
//! The driver task in `channel_manager` feeds inputs in and acts on the
//! returned state (sleeping backoffs, opening sockets); every transition and
//! every backoff delay is computed here, so the whole lifecycle is testable
//! without timers or sockets.

use std::time::Duration;

use crate::config::EngineConfig;

/// Where the live channel currently stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    /// No socket and no retry scheduled. Initial state, and the resting
    /// state after an explicit disconnect.
    Disconnected,
    /// One connect attempt in flight. `attempt` counts the consecutive
    /// failures that preceded it.
    Connecting { attempt: u32 },
    Connected,
    /// Waiting out `delay` before attempt number `attempt`.
    Reconnecting { attempt: u32, delay: Duration },
    /// Retry ceiling exhausted. Terminal until an explicit reconnect.
    GaveUp,
}

impl ChannelState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ChannelState::Connected)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelState::GaveUp)
    }
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelState::Disconnected => write!(f, "disconnected"),
            ChannelState::Connecting { attempt } => write!(f, "connecting (attempt {attempt})"),
            ChannelState::Connected => write!(f, "connected"),
            ChannelState::Reconnecting { attempt, delay } => {
                write!(f, "reconnecting (attempt {attempt} in {delay:?})")
            }
            ChannelState::GaveUp => write!(f, "gave up"),
        }
    }
}

/// Lifecycle inputs, produced by the driver and by user calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelInput {
    ConnectRequested,
    BackoffElapsed,
    AttemptSucceeded,
    AttemptFailed,
    ConnectionLost,
    DisconnectRequested,
}

/// Reconnection timing rules.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the first retry; doubles per consecutive failure.
    pub base_delay: Duration,
    /// Cap on the computed delay.
    pub max_delay: Duration,
    /// Consecutive failures tolerated before giving up.
    pub max_attempts: u32,
    /// Minimum spacing between two attempt starts; an attempt requested
    /// sooner is deferred by the driver, never run concurrently.
    pub min_connect_interval: Duration,
    /// Bound on a single connect + handshake round trip.
    pub connect_timeout: Duration,
}

impl ReconnectPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            base_delay: config.reconnect_base_delay,
            max_delay: config.reconnect_max_delay,
            max_attempts: config.reconnect_max_attempts,
            min_connect_interval: config.connect_min_interval,
            connect_timeout: config.connect_timeout,
        }
    }

    /// Backoff before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let raw = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exp));
        raw.min(self.max_delay)
    }
}

/// Advance the lifecycle. Inputs that make no sense in the current state
/// (e.g. a late `BackoffElapsed` after a disconnect) leave it unchanged.
pub fn step(state: &ChannelState, input: ChannelInput, policy: &ReconnectPolicy) -> ChannelState {
    use ChannelInput::*;
    use ChannelState::*;

    match (state, input) {
        (_, DisconnectRequested) => Disconnected,

        (Disconnected, ConnectRequested) | (GaveUp, ConnectRequested) => Connecting { attempt: 0 },

        (Connecting { .. }, AttemptSucceeded) => Connected,

        (Connecting { attempt }, AttemptFailed) | (Connecting { attempt }, ConnectionLost) => {
            let failures = attempt + 1;
            if failures >= policy.max_attempts {
                GaveUp
            } else {
                Reconnecting {
                    attempt: failures,
                    delay: policy.delay_for(failures),
                }
            }
        }

        (Reconnecting { attempt, .. }, BackoffElapsed) => Connecting { attempt: *attempt },

        // A drop from Connected restarts the failure count; the first retry
        // goes out as soon as the throttle allows.
        (Connected, ConnectionLost) => Reconnecting {
            attempt: 0,
            delay: Duration::ZERO,
        },

        (current, _) => current.clone(),
    }
}
