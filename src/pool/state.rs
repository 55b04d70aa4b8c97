use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::store::KeyRecord;

/// Lifecycle phase of an upstream key. Exactly one at any time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyPhase {
    Active,
    Leased,
    Cooling,
}

impl KeyPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Leased => "leased",
            Self::Cooling => "cooling",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "leased" => Self::Leased,
            "cooling" => Self::Cooling,
            _ => Self::Active,
        }
    }
}

/// How a lease came back, as seen by the pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReturnClassification {
    RateLimited { retry_after: Option<u64> },
    Upstream5xx,
    AuthRejected,
    TransientClientOrNetwork,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaseOutcome {
    Success,
    Failure(ReturnClassification),
}

#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    pub base_cooldown_seconds: u64,
    pub max_cooldown_seconds: u64,
    pub failure_threshold: u32,
}

#[derive(Clone, Debug)]
pub struct KeyState {
    pub identifier: String,
    pub secret: String,
    pub brief: String,
    pub phase: KeyPhase,
    pub failure_count: u32,
    pub cooldown_entry_count: u32,
    pub current_cooldown_seconds: u64,
    pub cooldown_until: Option<f64>,
    pub in_use_since: Option<f64>,
}

/// Short stable identifier derived from the secret; safe to log.
pub fn derive_identifier(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("key_sha256_{}", &hex[..8])
}

/// Redacted display form: first and last four characters of the secret.
pub fn derive_brief(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

impl KeyState {
    pub fn new(secret: String) -> Self {
        Self {
            identifier: derive_identifier(&secret),
            brief: derive_brief(&secret),
            secret,
            phase: KeyPhase::Active,
            failure_count: 0,
            cooldown_entry_count: 0,
            current_cooldown_seconds: 0,
            cooldown_until: None,
            in_use_since: None,
        }
    }

    /// Rehydrates a persisted row. A leased row belonged to a process that
    /// is gone, so it is reclaimed; an expired cooldown maps straight to
    /// active with its counters preserved.
    pub fn from_record(record: KeyRecord, now: f64) -> Self {
        let mut state = Self {
            identifier: record.identifier,
            brief: derive_brief(&record.secret),
            secret: record.secret,
            phase: KeyPhase::parse(&record.state),
            failure_count: record.failure_count,
            cooldown_entry_count: record.cooldown_entry_count,
            current_cooldown_seconds: record.current_cooldown_seconds,
            cooldown_until: record.cooldown_until,
            in_use_since: record.in_use_since,
        };
        match state.phase {
            KeyPhase::Leased => {
                state.phase = KeyPhase::Active;
                state.in_use_since = None;
            }
            KeyPhase::Cooling => {
                state.refresh(now);
            }
            KeyPhase::Active => {}
        }
        state
    }

    pub fn to_record(&self) -> KeyRecord {
        KeyRecord {
            identifier: self.identifier.clone(),
            secret: self.secret.clone(),
            state: self.phase.as_str().to_string(),
            failure_count: self.failure_count,
            cooldown_entry_count: self.cooldown_entry_count,
            current_cooldown_seconds: self.current_cooldown_seconds,
            cooldown_until: self.cooldown_until,
            in_use_since: self.in_use_since,
        }
    }

    /// Lazy Cooling -> Active transition. Returns true if the key left
    /// cooldown on this observation.
    pub fn refresh(&mut self, now: f64) -> bool {
        if self.phase == KeyPhase::Cooling
            && self.cooldown_until.map_or(true, |until| until <= now)
        {
            self.phase = KeyPhase::Active;
            self.cooldown_until = None;
            return true;
        }
        false
    }

    pub fn lease(&mut self, now: f64) {
        self.phase = KeyPhase::Leased;
        self.in_use_since = Some(now);
    }

    /// The key has proved healthy; every counter resets.
    pub fn note_success(&mut self) {
        self.phase = KeyPhase::Active;
        self.failure_count = 0;
        self.cooldown_entry_count = 0;
        self.current_cooldown_seconds = 0;
        self.cooldown_until = None;
        self.in_use_since = None;
    }

    /// Applies a failed return. Returns true when the key entered cooldown.
    pub fn note_failure(
        &mut self,
        classification: &ReturnClassification,
        policy: &BackoffPolicy,
        now: f64,
    ) -> bool {
        self.failure_count = self.failure_count.saturating_add(1);
        self.in_use_since = None;

        let (cool_down, retry_after) = match classification {
            // Possibly not the key's fault; no cooldown entry.
            ReturnClassification::TransientClientOrNetwork => (false, None),
            // Retrying the same credential cannot succeed.
            ReturnClassification::AuthRejected => (true, None),
            ReturnClassification::RateLimited { retry_after } => {
                (self.failure_count >= policy.failure_threshold, *retry_after)
            }
            ReturnClassification::Upstream5xx => {
                (self.failure_count >= policy.failure_threshold, None)
            }
        };

        if cool_down {
            self.enter_cooldown(policy, retry_after, now);
        } else {
            self.phase = KeyPhase::Active;
        }
        cool_down
    }

    fn enter_cooldown(&mut self, policy: &BackoffPolicy, retry_after: Option<u64>, now: f64) {
        self.cooldown_entry_count = self.cooldown_entry_count.saturating_add(1);
        let exponent = self.cooldown_entry_count - 1;
        let backoff = if exponent >= 63 {
            policy.max_cooldown_seconds
        } else {
            policy
                .base_cooldown_seconds
                .saturating_mul(1u64 << exponent)
                .min(policy.max_cooldown_seconds)
        };
        // An explicit upstream retry-after wins over the computed backoff.
        self.current_cooldown_seconds = match retry_after {
            Some(retry_after) => backoff.max(retry_after),
            None => backoff,
        };
        self.cooldown_until = Some(now + self.current_cooldown_seconds as f64);
        self.phase = KeyPhase::Cooling;
    }

    /// Administrative reset to a pristine active key.
    pub fn reset(&mut self) {
        self.note_success();
    }

    pub fn cooldown_remaining(&self, now: f64) -> f64 {
        match (self.phase, self.cooldown_until) {
            (KeyPhase::Cooling, Some(until)) => (until - now).max(0.0),
            _ => 0.0,
        }
    }

    pub fn status(&self, now: f64) -> KeyStatus {
        let state = match self.phase {
            KeyPhase::Active => "active",
            KeyPhase::Cooling => "cooling_down",
            KeyPhase::Leased => "in_use",
        };
        KeyStatus {
            identifier: self.identifier.clone(),
            brief: self.brief.clone(),
            state,
            cooldown_seconds_remaining: (self.cooldown_remaining(now) * 100.0).round() / 100.0,
            failure_count: self.failure_count,
            cooldown_entry_count: self.cooldown_entry_count,
            current_cooldown_seconds: self.current_cooldown_seconds,
        }
    }
}

/// Externally visible key summary; never carries the secret.
#[derive(Clone, Debug, Serialize)]
pub struct KeyStatus {
    pub identifier: String,
    pub brief: String,
    pub state: &'static str,
    pub cooldown_seconds_remaining: f64,
    pub failure_count: u32,
    pub cooldown_entry_count: u32,
    pub current_cooldown_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base_cooldown_seconds: 10,
            max_cooldown_seconds: 80,
            failure_threshold: 3,
        }
    }

    #[test]
    fn identifier_is_stable_hash_prefix() {
        let a = derive_identifier("sk-upstream-alpha");
        let b = derive_identifier("sk-upstream-alpha");
        let c = derive_identifier("sk-upstream-beta");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("key_sha256_"));
        assert_eq!(a.len(), "key_sha256_".len() + 8);
    }

    #[test]
    fn brief_redacts_the_middle() {
        assert_eq!(derive_brief("sk-abcdefghij-1234"), "sk-a...1234");
        assert_eq!(derive_brief("short"), "****");
    }

    #[test]
    fn backoff_grows_exponentially_and_saturates() {
        let policy = policy();
        let mut key = KeyState::new("sk-upstream-alpha".to_string());

        // Two soft failures stay active.
        for expected in 1..=2 {
            key.lease(0.0);
            let cooled = key.note_failure(&ReturnClassification::Upstream5xx, &policy, 0.0);
            assert!(!cooled);
            assert_eq!(key.phase, KeyPhase::Active);
            assert_eq!(key.failure_count, expected);
        }

        // Third failure crosses the threshold: 10s.
        key.lease(0.0);
        assert!(key.note_failure(&ReturnClassification::Upstream5xx, &policy, 0.0));
        assert_eq!(key.phase, KeyPhase::Cooling);
        assert_eq!(key.current_cooldown_seconds, 10);
        assert_eq!(key.cooldown_until, Some(10.0));

        // Cooldown expires, next failures double: 20s, then 40s, then cap 80s.
        for expected in [20, 40, 80, 80] {
            assert!(key.refresh(key.cooldown_until.unwrap_or(f64::MAX)));
            key.lease(0.0);
            let now = 1000.0;
            assert!(key.note_failure(&ReturnClassification::Upstream5xx, &policy, now));
            assert_eq!(key.current_cooldown_seconds, expected);
            assert_eq!(key.cooldown_until, Some(now + expected as f64));
        }

        // One success clears everything.
        assert!(key.refresh(f64::MAX));
        key.lease(0.0);
        key.note_success();
        assert_eq!(key.phase, KeyPhase::Active);
        assert_eq!(key.failure_count, 0);
        assert_eq!(key.cooldown_entry_count, 0);
        assert_eq!(key.current_cooldown_seconds, 0);
        assert_eq!(key.cooldown_until, None);
    }

    #[test]
    fn auth_rejection_forces_cooldown_below_threshold() {
        let policy = policy();
        let mut key = KeyState::new("sk-upstream-alpha".to_string());
        key.lease(0.0);
        assert!(key.note_failure(&ReturnClassification::AuthRejected, &policy, 0.0));
        assert_eq!(key.phase, KeyPhase::Cooling);
        assert_eq!(key.failure_count, 1);
        assert_eq!(key.current_cooldown_seconds, policy.base_cooldown_seconds);
    }

    #[test]
    fn transient_failure_returns_to_active_without_cooldown() {
        let policy = policy();
        let mut key = KeyState::new("sk-upstream-alpha".to_string());
        for _ in 0..5 {
            key.lease(0.0);
            let cooled = key.note_failure(
                &ReturnClassification::TransientClientOrNetwork,
                &policy,
                0.0,
            );
            assert!(!cooled);
            assert_eq!(key.phase, KeyPhase::Active);
        }
        assert_eq!(key.failure_count, 5);
        assert_eq!(key.cooldown_entry_count, 0);
    }

    #[test]
    fn retry_after_overrides_shorter_backoff() {
        let policy = policy();
        let mut key = KeyState::new("sk-upstream-alpha".to_string());
        key.failure_count = 2;
        key.lease(0.0);
        assert!(key.note_failure(
            &ReturnClassification::RateLimited {
                retry_after: Some(120),
            },
            &policy,
            0.0,
        ));
        assert_eq!(key.current_cooldown_seconds, 120);
    }

    #[test]
    fn record_round_trip_preserves_counters() {
        let policy = policy();
        let mut key = KeyState::new("sk-upstream-alpha".to_string());
        for _ in 0..3 {
            key.lease(0.0);
            key.note_failure(&ReturnClassification::Upstream5xx, &policy, 100.0);
        }
        assert_eq!(key.phase, KeyPhase::Cooling);

        let record = key.to_record();
        let restored = KeyState::from_record(record, 100.0);
        assert_eq!(restored.phase, KeyPhase::Cooling);
        assert_eq!(restored.failure_count, key.failure_count);
        assert_eq!(restored.cooldown_entry_count, key.cooldown_entry_count);
        assert_eq!(
            restored.current_cooldown_seconds,
            key.current_cooldown_seconds
        );
        assert_eq!(restored.cooldown_until, key.cooldown_until);
        assert_eq!(restored.brief, key.brief);
    }

    #[test]
    fn leased_record_is_reclaimed_on_load() {
        let mut key = KeyState::new("sk-upstream-alpha".to_string());
        key.lease(50.0);
        let restored = KeyState::from_record(key.to_record(), 60.0);
        assert_eq!(restored.phase, KeyPhase::Active);
        assert_eq!(restored.in_use_since, None);
    }

    #[test]
    fn expired_cooldown_maps_to_active_on_load() {
        let policy = policy();
        let mut key = KeyState::new("sk-upstream-alpha".to_string());
        key.failure_count = 2;
        key.lease(0.0);
        key.note_failure(&ReturnClassification::Upstream5xx, &policy, 0.0);
        assert_eq!(key.phase, KeyPhase::Cooling);

        let restored = KeyState::from_record(key.to_record(), 1e12);
        assert_eq!(restored.phase, KeyPhase::Active);
        assert_eq!(restored.cooldown_until, None);
        // Counters survive until the next success.
        assert_eq!(restored.failure_count, 3);
        assert_eq!(restored.cooldown_entry_count, 1);
    }

    #[test]
    fn status_reports_remaining_cooldown() {
        let policy = policy();
        let mut key = KeyState::new("sk-upstream-alpha".to_string());
        key.failure_count = 2;
        key.lease(0.0);
        key.note_failure(&ReturnClassification::Upstream5xx, &policy, 0.0);

        let status = key.status(4.0);
        assert_eq!(status.state, "cooling_down");
        assert_eq!(status.cooldown_seconds_remaining, 6.0);
        assert!(!format!("{status:?}").contains("sk-upstream-alpha"));
    }
}
