//! Two-step emergency shutdown gate.
//!
//! Arming mints a short-lived token; only a confirm presenting that token
//! within the window goes through. Every confirm attempt disarms, so a wrong
//! or late confirm forces a fresh arm. Time is an explicit argument and the
//! token generator is injectable, which keeps the expiry and match logic
//! deterministic under test.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

pub const DEFAULT_ARM_WINDOW_MS: i64 = 5000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArmedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Confirmed,
    NotArmed,
    Expired,
    WrongToken,
}

impl ConfirmOutcome {
    pub fn reason(&self) -> &'static str {
        match self {
            ConfirmOutcome::Confirmed => "confirmed",
            ConfirmOutcome::NotArmed => "not armed",
            ConfirmOutcome::Expired => "expired",
            ConfirmOutcome::WrongToken => "invalid token",
        }
    }
}

pub struct KillSwitch {
    window_ms: i64,
    token_source: fn() -> String,
    armed: Option<ArmedToken>,
}

impl KillSwitch {
    pub fn new(window_ms: i64) -> Self {
        Self::with_token_source(window_ms, default_token)
    }

    pub fn with_token_source(window_ms: i64, token_source: fn() -> String) -> Self {
        Self {
            window_ms,
            token_source,
            armed: None,
        }
    }

    /// Mint a fresh token valid until `now + window`, replacing any token
    /// still armed.
    pub fn arm(&mut self, now: DateTime<Utc>) -> ArmedToken {
        let armed = ArmedToken {
            token: (self.token_source)(),
            expires_at: now + Duration::milliseconds(self.window_ms),
        };
        self.armed = Some(armed.clone());
        armed
    }

    /// One-shot check, evaluated in order: not armed, expired, token
    /// mismatch, success. Disarms on every outcome.
    pub fn confirm(&mut self, token: &str, now: DateTime<Utc>) -> ConfirmOutcome {
        match self.armed.take() {
            None => ConfirmOutcome::NotArmed,
            Some(armed) if now > armed.expires_at => ConfirmOutcome::Expired,
            Some(armed) if armed.token != token => ConfirmOutcome::WrongToken,
            Some(_) => ConfirmOutcome::Confirmed,
        }
    }

    /// Current armed token, if any and not yet expired. Never disarms.
    pub fn peek(&self, now: DateTime<Utc>) -> Option<&ArmedToken> {
        self.armed
            .as_ref()
            .filter(|armed| now <= armed.expires_at)
    }
}

fn default_token() -> String {
    Uuid::new_v4().to_string()
}
