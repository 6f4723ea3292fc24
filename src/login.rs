use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::attempts::AttemptTracker;
use crate::camera::{save_capture, CameraDevice, ImageCapture};
use crate::config::Settings;
use crate::events::EventBus;
use crate::geo::GeoResolver;
use crate::recorder::{AttemptSnapshot, DashboardLauncher, IntruderRecorder};
use crate::store::{self, Storage};
use crate::types::{now_rfc3339, CaptureRecord, FailedAttemptPointer};

#[derive(Debug, Clone, PartialEq)]
pub enum LoginOutcome {
    MissingFields,
    Success,
    Invalid { remaining: u32 },
    /// The security protocol ran (or had already run) and the form is
    /// disabled.
    Locked { record: Option<CaptureRecord> },
}

impl LoginOutcome {
    pub fn message(&self) -> String {
        match self {
            LoginOutcome::MissingFields => "Please enter both username and password".into(),
            LoginOutcome::Success => "Login successful! Redirecting...".into(),
            LoginOutcome::Invalid { remaining } => format!(
                "Invalid credentials. {remaining} attempt{} remaining.",
                if *remaining != 1 { "s" } else { "" }
            ),
            LoginOutcome::Locked { .. } => {
                "Security team has been notified with intruder details.".into()
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, LoginOutcome::Locked { .. })
    }
}

/// The login page context.
pub struct LoginPage {
    settings: Settings,
    storage: Storage,
    tracker: AttemptTracker,
    resolver: Arc<dyn GeoResolver>,
    camera: ImageCapture,
    recorder: IntruderRecorder,
    capture_dir: Option<PathBuf>,
    locked: bool,
}

impl LoginPage {
    /// Open the page. Expired captures are pruned first.
    pub fn open(
        settings: Settings,
        storage: Storage,
        bus: EventBus,
        resolver: Arc<dyn GeoResolver>,
        camera: Arc<dyn CameraDevice>,
        launcher: Box<dyn DashboardLauncher>,
    ) -> Self {
        let recorder = IntruderRecorder::new(storage.clone(), bus.clone(), launcher);
        if let Err(e) = recorder.cleanup_expired(OffsetDateTime::now_utc(), settings.retention) {
            warn!("error cleaning up old data: {e}");
        }
        let camera = ImageCapture::new(camera)
            .with_settle(settings.settle)
            .with_quality(settings.jpeg_quality);
        Self {
            tracker: AttemptTracker::new(storage.clone(), bus, settings.threshold),
            settings,
            storage,
            resolver,
            camera,
            recorder,
            capture_dir: None,
            locked: false,
        }
    }

    /// Also keep a copy of every captured frame on disk.
    pub fn with_capture_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.capture_dir = Some(dir.into());
        self
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn tracker(&self) -> &AttemptTracker {
        &self.tracker
    }

    pub async fn submit(&mut self, username: &str, password: &str) -> LoginOutcome {
        let (username, password) = (username.trim(), password.trim());
        if username.is_empty() || password.is_empty() {
            return LoginOutcome::MissingFields;
        }
        if self.locked {
            return LoginOutcome::Locked { record: None };
        }

        if !self.settings.auth_delay.is_zero() {
            tokio::time::sleep(self.settings.auth_delay).await;
        }

        let creds = &self.settings.credentials;
        if username == creds.username && password == creds.password {
            info!(username, "login succeeded");
            return LoginOutcome::Success;
        }

        let count = self.tracker.record_failure(username);
        if self.tracker.take_trigger() {
            warn!(username, count, "maximum login attempts reached, security protocol activated");
            let record = self.capture_intruder(username, count).await;
            self.lock_out(username);
            return LoginOutcome::Locked { record };
        }

        LoginOutcome::Invalid {
            remaining: self.tracker.remaining(),
        }
    }

    /// Geolocation first, then the camera. Neither failure stops the record.
    async fn capture_intruder(&self, username: &str, count: u32) -> Option<CaptureRecord> {
        let location = self.resolver.resolve().await;

        let image = match self.camera.capture().await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("camera access error: {e}");
                None
            }
        };

        if let (Some(dir), Some(bytes)) = (&self.capture_dir, &image) {
            let meta = json!({
                "source": "security_system",
                "reason": "login_attempt",
                "username": username,
                "ip": &location.ip,
            });
            if let Err(e) = save_capture(dir, bytes, Some(meta)).await {
                warn!("failed to save capture to disk: {e}");
            }
        }

        let snapshot = AttemptSnapshot {
            username: username.to_string(),
            count,
        };
        match self.recorder.record_intrusion(&snapshot, location, image.as_deref()) {
            Ok(record) => Some(record),
            Err(e) => {
                error!("error saving intruder data: {e}");
                None
            }
        }
    }

    fn lock_out(&mut self, username: &str) {
        self.locked = true;
        let pointer = FailedAttemptPointer {
            username: username.to_string(),
            count: self.tracker.session_failures(),
            timestamp: now_rfc3339(),
            locked: true,
        };
        if let Err(e) = self.storage.save(store::LAST_FAILED_ATTEMPT, &pointer) {
            warn!("failed to store lockout info: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_message_pluralises() {
        assert_eq!(
            LoginOutcome::Invalid { remaining: 1 }.message(),
            "Invalid credentials. 1 attempt remaining."
        );
        assert_eq!(
            LoginOutcome::Invalid { remaining: 2 }.message(),
            "Invalid credentials. 2 attempts remaining."
        );
    }
}
