use tracing::{debug, warn};

use crate::events::{Event, EventBus};
use crate::store::{self, Storage};
use crate::types::{now_rfc3339, AttemptMap, AttemptRecord, FailedAttemptPointer};

pub const DEFAULT_THRESHOLD: u32 = 3;

/// Counts failed logins. The per-username counts live in the store and
/// survive reloads; the session counter and the capture latch belong to this
/// value only, so a new tracker starts a new session.
pub struct AttemptTracker {
    storage: Storage,
    bus: EventBus,
    threshold: u32,
    session_failures: u32,
    triggered: bool,
}

impl AttemptTracker {
    pub fn new(storage: Storage, bus: EventBus, threshold: u32) -> Self {
        Self {
            storage,
            bus,
            threshold: threshold.max(1),
            session_failures: 0,
            triggered: false,
        }
    }

    /// Record one failure for `username` and return its persisted count.
    pub fn record_failure(&mut self, username: &str) -> u32 {
        self.session_failures += 1;

        let now = now_rfc3339();
        let mut attempts: AttemptMap = self.storage.load(store::LOGIN_ATTEMPTS);
        let entry = attempts
            .entry(username.to_string())
            .or_insert_with(|| AttemptRecord {
                username: username.to_string(),
                ..AttemptRecord::default()
            });
        entry.username = username.to_string();
        entry.count = entry.count.saturating_add(1);
        entry.last_attempt = Some(now.clone());
        let count = entry.count;

        if let Err(e) = self.storage.save(store::LOGIN_ATTEMPTS, &attempts) {
            warn!(username, "failed to persist login attempts: {e}");
        }

        let pointer = FailedAttemptPointer {
            username: username.to_string(),
            count,
            timestamp: now,
            locked: false,
        };
        if let Err(e) = self.storage.save(store::LAST_FAILED_ATTEMPT, &pointer) {
            warn!(username, "failed to write last failed attempt: {e}");
        }
        self.bus.publish(Event::FailedAttempt {
            username: username.to_string(),
            count,
        });

        debug!(username, count, session = self.session_failures, "login failure recorded");
        count
    }

    /// True exactly once per session, on the first call after the session
    /// reached the threshold.
    pub fn take_trigger(&mut self) -> bool {
        if self.triggered || self.session_failures < self.threshold {
            return false;
        }
        self.triggered = true;
        true
    }

    pub fn triggered(&self) -> bool {
        self.triggered
    }

    pub fn session_failures(&self) -> u32 {
        self.session_failures
    }

    pub fn remaining(&self) -> u32 {
        self.threshold.saturating_sub(self.session_failures)
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn count_for(&self, username: &str) -> u32 {
        let attempts: AttemptMap = self.storage.load(store::LOGIN_ATTEMPTS);
        attempts.get(username).map(|r| r.count).unwrap_or(0)
    }
}
