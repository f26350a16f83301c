//! Replay counter enforcement and bounded retransmission
//!
//! The authenticator owns the replay counter of a session: every new
//! message it originates carries a strictly greater value, and the reply it
//! expects must echo that value exactly. The supplicant accepts an
//! authenticator message only with a counter strictly greater than the last
//! one it accepted; an equal counter is a retransmission of something it has
//! already answered.

use std::time::Duration;

use crate::error::{HandshakeError, Result};

/// Outcome of checking an inbound counter on the supplicant side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayCheck {
    /// Strictly greater than anything accepted so far
    Fresh,
    /// Equal to the last accepted counter
    Duplicate,
    /// Older than the last accepted counter
    Stale,
}

#[derive(Debug, Clone, Default)]
pub struct ReplayState {
    /// Last counter used in an authenticator-originated message
    last_sent: Option<u64>,
    /// Counter the authenticator expects the next reply to echo
    awaiting: Option<u64>,
    /// Last counter accepted after MIC verification (supplicant)
    last_accepted: Option<u64>,
    /// Supplicant-originated request counter, kept apart from the above
    last_request_sent: Option<u64>,
    last_request_seen: Option<u64>,
}

impl ReplayState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Authenticator: counter for a new outbound message
    pub fn next_counter(&mut self) -> u64 {
        let next = self.last_sent.map_or(1, |c| c + 1);
        self.last_sent = Some(next);
        self.awaiting = Some(next);
        next
    }

    pub fn last_sent(&self) -> Option<u64> {
        self.last_sent
    }

    /// Authenticator: the reply must echo the outstanding counter
    pub fn check_reply(&self, received: u64) -> Result<()> {
        match self.awaiting {
            Some(expected) if expected == received => Ok(()),
            _ => Err(HandshakeError::ReplayViolation {
                received,
                last: self.last_sent,
            }),
        }
    }

    /// Authenticator: a verified reply closes the outstanding counter so
    /// that a replay of the same reply is rejected
    pub fn consume_reply(&mut self) {
        self.awaiting = None;
    }

    /// Supplicant: classify a counter without changing state
    pub fn classify(&self, received: u64) -> ReplayCheck {
        match self.last_accepted {
            None => ReplayCheck::Fresh,
            Some(last) if received > last => ReplayCheck::Fresh,
            Some(last) if received == last => ReplayCheck::Duplicate,
            Some(_) => ReplayCheck::Stale,
        }
    }

    /// Supplicant: require a fresh counter
    pub fn check_fresh(&self, received: u64) -> Result<()> {
        match self.classify(received) {
            ReplayCheck::Fresh => Ok(()),
            _ => Err(HandshakeError::ReplayViolation {
                received,
                last: self.last_accepted,
            }),
        }
    }

    /// Supplicant: record a counter once the frame's MIC has verified
    pub fn accept(&mut self, received: u64) {
        if self.last_accepted.map_or(true, |last| received > last) {
            self.last_accepted = Some(received);
        }
    }

    pub fn last_accepted(&self) -> Option<u64> {
        self.last_accepted
    }

    /// Supplicant: counter for an EAPOL-Key request
    pub fn next_request_counter(&mut self) -> u64 {
        let next = self.last_request_sent.map_or(1, |c| c + 1);
        self.last_request_sent = Some(next);
        next
    }

    /// Authenticator: requests must carry strictly increasing counters
    pub fn accept_request(&mut self, received: u64) -> Result<()> {
        if self.last_request_seen.map_or(false, |last| received <= last) {
            return Err(HandshakeError::ReplayViolation {
                received,
                last: self.last_request_seen,
            });
        }
        self.last_request_seen = Some(received);
        Ok(())
    }
}

/// Retransmission budget and timer lengths for one role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retransmissions allowed before teardown
    pub max_retries: u32,
    /// Wait after the first transmission of a message
    pub first_timeout: Duration,
    /// Wait after each retransmission
    pub retry_timeout: Duration,
}

impl RetryPolicy {
    pub const AUTHENTICATOR_RETRIES: u32 = 3;
    pub const SUPPLICANT_RETRIES: u32 = 6;

    pub fn authenticator() -> Self {
        Self {
            max_retries: Self::AUTHENTICATOR_RETRIES,
            first_timeout: Duration::from_millis(100),
            retry_timeout: Duration::from_millis(1000),
        }
    }

    /// The supplicant waits longer overall so it does not storm an
    /// authenticator that is itself retrying
    pub fn supplicant() -> Self {
        Self {
            max_retries: Self::SUPPLICANT_RETRIES,
            first_timeout: Duration::from_millis(1000),
            retry_timeout: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Resend the last outbound message and wait `next_timeout`
    Resend { attempt: u32, next_timeout: Duration },
    /// Budget spent: tear the session down
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct RetryBudget {
    policy: RetryPolicy,
    used: u32,
}

impl RetryBudget {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, used: 0 }
    }

    /// Start a new message: full budget, first-transmission timeout
    pub fn restart(&mut self) -> Duration {
        self.used = 0;
        self.policy.first_timeout
    }

    pub fn on_timeout(&mut self) -> RetryDecision {
        if self.used < self.policy.max_retries {
            self.used += 1;
            RetryDecision::Resend {
                attempt: self.used,
                next_timeout: self.policy.retry_timeout,
            }
        } else {
            RetryDecision::Exhausted
        }
    }

    pub fn remaining(&self) -> u32 {
        self.policy.max_retries - self.used
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}
