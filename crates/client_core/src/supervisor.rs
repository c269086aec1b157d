//! Connection lifecycle and retry bookkeeping for a realtime channel.
//!
//! The supervisor never touches a socket or a timer itself. It only decides
//! what the owner should do next; the channel controller carries out each
//! [`Transition`] (open a transport, arm a retry timer, give up).

use std::time::Duration;

use shared::domain::ChannelConnection;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub attempt: u32,
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RetryState {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            interval,
        }
    }

    pub fn exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// What the owner must do after feeding an input to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Open the transport now.
    Open,
    /// The transport is up.
    Opened,
    /// Arm a retry timer for the given interval.
    RetryAfter(Duration),
    /// The retry budget is spent; settle in `Disconnected`.
    GaveUp { attempts: u32 },
    /// Explicit disconnect; cancel any pending timer.
    Closed,
    /// The input does not apply in the current state.
    Ignored,
}

#[derive(Debug, Clone)]
pub struct ReconnectSupervisor {
    state: ChannelConnection,
    retry: RetryState,
}

impl ReconnectSupervisor {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            state: ChannelConnection::Disconnected,
            retry: RetryState::new(max_attempts, interval),
        }
    }

    pub fn state(&self) -> ChannelConnection {
        self.state
    }

    pub fn retry(&self) -> RetryState {
        self.retry
    }

    pub fn attempt(&self) -> u32 {
        self.retry.attempt
    }

    /// Explicit connect. Valid from `Disconnected` and from `Closed`, which is
    /// only left by an explicit caller request.
    pub fn connect(&mut self) -> Transition {
        if !self.state.is_idle() {
            debug!(state = ?self.state, "connect ignored");
            return Transition::Ignored;
        }
        self.retry.attempt = 0;
        self.move_to(ChannelConnection::Connecting);
        Transition::Open
    }

    pub fn on_open(&mut self) -> Transition {
        if self.state != ChannelConnection::Connecting {
            return Transition::Ignored;
        }
        self.retry.attempt = 0;
        self.move_to(ChannelConnection::Connected);
        Transition::Opened
    }

    /// Transport error or close.
    pub fn on_failure(&mut self) -> Transition {
        if !matches!(
            self.state,
            ChannelConnection::Connecting | ChannelConnection::Connected
        ) {
            return Transition::Ignored;
        }
        if self.retry.exhausted() {
            let attempts = self.retry.attempt;
            info!(attempts, "reconnect budget exhausted");
            self.move_to(ChannelConnection::Disconnected);
            return Transition::GaveUp { attempts };
        }
        self.move_to(ChannelConnection::Reconnecting);
        Transition::RetryAfter(self.retry.interval)
    }

    pub fn on_retry_elapsed(&mut self) -> Transition {
        if self.state != ChannelConnection::Reconnecting {
            return Transition::Ignored;
        }
        self.retry.attempt += 1;
        self.move_to(ChannelConnection::Connecting);
        Transition::Open
    }

    pub fn disconnect(&mut self) -> Transition {
        if self.state == ChannelConnection::Closed {
            return Transition::Ignored;
        }
        self.retry.attempt = 0;
        self.move_to(ChannelConnection::Closed);
        Transition::Closed
    }

    fn move_to(&mut self, next: ChannelConnection) {
        info!(
            from = ?self.state,
            to = ?next,
            attempt = self.retry.attempt,
            "channel connection transition"
        );
        self.state = next;
    }
}
