// Copyright 2025-Present Traceline, Inc. https://traceline.dev/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// Refresh this far ahead of expiry, unless the midpoint of the token's
/// lifetime comes sooner.
pub const REFRESH_LEAD_SECS: u64 = 30 * 60;

/// Body of the authenticate endpoint's response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    pub token: String,
    pub expires_at: u64,
}

/// A short-lived credential authorizing report uploads. The refresh time
/// is fixed at issuance: the midpoint of the remaining lifetime or thirty
/// minutes before expiry, whichever comes first, clamped to "immediately".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    token: String,
    expires_at: u64,
    refresh_at: u64,
}

impl SessionToken {
    pub fn new(token: String, expires_at: u64, now: u64) -> SessionToken {
        let midpoint = now + expires_at.saturating_sub(now) / 2;
        let early = expires_at.saturating_sub(REFRESH_LEAD_SECS);
        let refresh_at = midpoint.min(early).max(now);
        SessionToken {
            token,
            expires_at,
            refresh_at,
        }
    }

    pub fn from_response(response: SessionResponse, now: u64) -> SessionToken {
        SessionToken::new(response.token, response.expires_at, now)
    }

    pub fn value(&self) -> &str {
        &self.token
    }

    pub fn refresh_at(&self) -> u64 {
        self.refresh_at
    }

    pub fn refresh_due(&self, now: u64) -> bool {
        now >= self.refresh_at
    }

    pub fn expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

/// Report-credential lifecycle. `Abandoned` is terminal: a 4xx from the
/// auth endpoint means the agent credential itself was rejected and
/// reporting stops until a fresh one is configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Missing,
    Active(SessionToken),
    Abandoned,
}

impl AuthState {
    pub fn usable_token(&self, now: u64) -> Option<&str> {
        match self {
            AuthState::Active(token) if !token.expired(now) => Some(token.value()),
            _ => None,
        }
    }

    pub fn refresh_due(&self, now: u64) -> bool {
        match self {
            AuthState::Missing => true,
            AuthState::Active(token) => token.refresh_due(now),
            AuthState::Abandoned => false,
        }
    }

    pub fn is_abandoned(&self) -> bool {
        matches!(self, AuthState::Abandoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_000_000;

    #[test]
    fn long_lived_token_refreshes_at_the_midpoint() {
        // expires_at = now + 7200 -> refresh at now + 3600.
        let token = SessionToken::new("t".into(), NOW + 7200, NOW);
        assert_eq!(token.refresh_at(), NOW + 3600);
        assert!(!token.refresh_due(NOW + 3599));
        assert!(token.refresh_due(NOW + 3600));
    }

    #[test]
    fn near_expiry_token_refreshes_immediately() {
        // expires_at = now + 600: thirty minutes before expiry is in the
        // past, so the refresh clamps to immediate.
        let token = SessionToken::new("t".into(), NOW + 600, NOW);
        assert_eq!(token.refresh_at(), NOW);
        assert!(token.refresh_due(NOW));
    }

    #[test]
    fn lead_time_wins_when_sooner_than_midpoint() {
        // expires_at = now + 4000: midpoint is now+2000, thirty minutes
        // before expiry is now+2200; the midpoint comes first.
        let token = SessionToken::new("t".into(), NOW + 4000, NOW);
        assert_eq!(token.refresh_at(), NOW + 2000);

        // expires_at = now + 10000: midpoint now+5000, lead now+8200.
        let token = SessionToken::new("t".into(), NOW + 10_000, NOW);
        assert_eq!(token.refresh_at(), NOW + 5000);
    }

    #[test]
    fn expiry_invalidates_the_token() {
        let token = SessionToken::new("t".into(), NOW + 100, NOW);
        let auth = AuthState::Active(token);
        assert_eq!(auth.usable_token(NOW), Some("t"));
        assert_eq!(auth.usable_token(NOW + 100), None);
    }

    #[test]
    fn auth_state_refresh_rules() {
        assert!(AuthState::Missing.refresh_due(NOW));
        assert!(!AuthState::Abandoned.refresh_due(NOW));
        assert!(AuthState::Abandoned.usable_token(NOW).is_none());

        let active = AuthState::Active(SessionToken::new("t".into(), NOW + 7200, NOW));
        assert!(!active.refresh_due(NOW + 10));
        assert!(active.refresh_due(NOW + 3600));
    }
}
