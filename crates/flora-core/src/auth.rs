//! Two-step challenge/key authentication handshake.
//!
//! 1. Write [`AUTH_CHALLENGE`] and read the answer.
//! 2. If the answer starts with [`AUTH_RESPONSE_PREFIX`], write [`AUTH_KEY`].
//!    Completion of that write counts as success.
//!
//! A mismatching answer or a failed write/read restarts the handshake once.
//! After that, and whenever the deadline passes, the device is treated as
//! authenticated: devices without this feature must not be locked out.

use flora_types::commands::{AUTH_CHALLENGE, AUTH_KEY, AUTH_RESPONSE_PREFIX};

/// What the link should do next for the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    /// Write this payload to the authentication characteristic and start the
    /// deadline for `round`.
    WriteChallenge { payload: Vec<u8>, round: u32 },
    /// Read the authentication characteristic.
    ReadResponse,
    /// Write the key to the authentication characteristic.
    WriteKey { payload: Vec<u8> },
    /// The handshake is over.
    Done(AuthOutcome),
    /// The input did not apply to the current phase.
    Ignored,
}

/// How the handshake ended. Every outcome leads to an authenticated link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// The device accepted the key.
    Verified,
    /// The deadline passed first.
    FallbackTimeout,
    /// The device answered unexpectedly twice.
    FallbackMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    ChallengeSent,
    AwaitingResponse,
    KeySent,
    Done,
}

/// Handshake state for one authentication attempt.
#[derive(Debug, Clone)]
pub struct AuthHandshake {
    phase: Phase,
    round: u32,
    restarted: bool,
}

impl Default for AuthHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthHandshake {
    /// Create a handshake that has not started.
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            round: 0,
            restarted: false,
        }
    }

    /// Current round; deadlines carry it so a restarted round ignores the
    /// deadline of the previous one.
    pub fn round(&self) -> u32 {
        self.round
    }

    /// Returns `true` once an outcome has been reached.
    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Begin round one.
    pub fn start(&mut self) -> AuthStep {
        self.round = 1;
        self.restarted = false;
        self.challenge()
    }

    fn challenge(&mut self) -> AuthStep {
        self.phase = Phase::ChallengeSent;
        AuthStep::WriteChallenge {
            payload: AUTH_CHALLENGE.to_vec(),
            round: self.round,
        }
    }

    fn restart_or_fall_back(&mut self) -> AuthStep {
        if self.restarted {
            self.phase = Phase::Done;
            return AuthStep::Done(AuthOutcome::FallbackMismatch);
        }
        self.restarted = true;
        self.round += 1;
        self.challenge()
    }

    /// A write to the authentication characteristic completed.
    pub fn on_write_ack(&mut self) -> AuthStep {
        match self.phase {
            Phase::ChallengeSent => {
                self.phase = Phase::AwaitingResponse;
                AuthStep::ReadResponse
            }
            Phase::KeySent => {
                self.phase = Phase::Done;
                AuthStep::Done(AuthOutcome::Verified)
            }
            _ => AuthStep::Ignored,
        }
    }

    /// The authentication characteristic answered.
    pub fn on_response(&mut self, value: &[u8]) -> AuthStep {
        match self.phase {
            Phase::AwaitingResponse if value.starts_with(&AUTH_RESPONSE_PREFIX) => {
                self.phase = Phase::KeySent;
                AuthStep::WriteKey {
                    payload: AUTH_KEY.to_vec(),
                }
            }
            Phase::AwaitingResponse => self.restart_or_fall_back(),
            Phase::KeySent => {
                self.phase = Phase::Done;
                AuthStep::Done(AuthOutcome::Verified)
            }
            _ => AuthStep::Ignored,
        }
    }

    /// A write or read of the handshake failed.
    pub fn on_error(&mut self) -> AuthStep {
        match self.phase {
            Phase::ChallengeSent | Phase::AwaitingResponse | Phase::KeySent => {
                self.restart_or_fall_back()
            }
            _ => AuthStep::Ignored,
        }
    }

    /// The deadline of `round` passed.
    pub fn on_deadline(&mut self, round: u32) -> AuthStep {
        if round != self.round || matches!(self.phase, Phase::Idle | Phase::Done) {
            return AuthStep::Ignored;
        }
        self.phase = Phase::Done;
        AuthStep::Done(AuthOutcome::FallbackTimeout)
    }
}
