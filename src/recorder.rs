use std::time::Duration;

use time::{macros::format_description, OffsetDateTime};
use tracing::{info, warn};

use crate::camera::to_data_url;
use crate::error::StoreError;
use crate::events::{Event, EventBus};
use crate::store::{self, Storage};
use crate::types::{format_rfc3339, parse_rfc3339, unix_millis, CaptureRecord, LocationInfo};

pub const DEFAULT_RETENTION: Duration = Duration::from_secs(2 * 24 * 60 * 60);

/// Who triggered the capture, as known by the attempt tracker.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AttemptSnapshot {
    pub username: String,
    pub count: u32,
}

/// Opens a dashboard context when none is listening.
pub trait DashboardLauncher: Send + Sync {
    fn launch(&self);
}

/// Launcher for setups where no dashboard can be opened.
pub struct NoLauncher;

impl DashboardLauncher for NoLauncher {
    fn launch(&self) {
        info!("no dashboard open; captures are persisted for later");
    }
}

pub struct IntruderRecorder {
    storage: Storage,
    bus: EventBus,
    launcher: Box<dyn DashboardLauncher>,
}

impl IntruderRecorder {
    pub fn new(storage: Storage, bus: EventBus, launcher: Box<dyn DashboardLauncher>) -> Self {
        Self {
            storage,
            bus,
            launcher,
        }
    }

    /// Build, persist and announce one capture. The image is optional and
    /// never blocks recording.
    pub fn record_intrusion(
        &self,
        attempt: &AttemptSnapshot,
        location: LocationInfo,
        image: Option<&[u8]>,
    ) -> Result<CaptureRecord, StoreError> {
        let record = build_record(OffsetDateTime::now_utc(), attempt, location, image);

        // Plain load-modify-store: a concurrent writer can clobber this append.
        let mut intruders: Vec<CaptureRecord> = self.storage.load(store::INTRUDERS);
        intruders.push(record.clone());
        self.storage.save(store::INTRUDERS, &intruders)?;

        info!(
            ip = %record.ip,
            location = %record.location,
            image = %record.filename,
            has_image = record.has_image(),
            "captured intruder data"
        );

        if let Err(e) = self.storage.save(store::LAST_INTRUDER, &record) {
            warn!("failed to write last intruder pointer: {e}");
        }
        self.bus.publish(Event::NewIntruder(record.clone()));

        if !self.bus.dashboard_open() {
            self.launcher.launch();
        }
        Ok(record)
    }

    /// Drop records that are at least `retention` old, or whose timestamp
    /// cannot be read. Returns how many were removed.
    pub fn cleanup_expired(&self, now: OffsetDateTime, retention: Duration) -> Result<usize, StoreError> {
        let intruders: Vec<CaptureRecord> = self.storage.load(store::INTRUDERS);
        let before = intruders.len();
        let kept = prune_expired(intruders, now, retention);
        let removed = before - kept.len();
        self.storage.save(store::INTRUDERS, &kept)?;
        if removed > 0 {
            info!(removed, "pruned expired intruder records");
        }
        Ok(removed)
    }
}

pub fn build_record(
    now: OffsetDateTime,
    attempt: &AttemptSnapshot,
    location: LocationInfo,
    image: Option<&[u8]>,
) -> CaptureRecord {
    let compact = now
        .format(format_description!("[year][month][day]T[hour][minute][second]"))
        .unwrap_or_else(|_| String::from("19700101T000000"));
    CaptureRecord {
        id: unix_millis(now).to_string(),
        timestamp: format_rfc3339(now),
        ip: location.ip,
        location: location.loc,
        city: location.city,
        region: location.region,
        country: location.country,
        org: location.org,
        postal: location.postal,
        filename: format!("Intruder_{compact}.jpg"),
        username: (!attempt.username.is_empty()).then(|| attempt.username.clone()),
        attempts: attempt.count,
        image_data: image.map(to_data_url),
        image_path: None,
        blocked: false,
    }
}

pub fn prune_expired(
    records: Vec<CaptureRecord>,
    now: OffsetDateTime,
    retention: Duration,
) -> Vec<CaptureRecord> {
    records
        .into_iter()
        .filter(|r| match parse_rfc3339(&r.timestamp) {
            Some(ts) => now - ts < retention,
            None => false,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use time::Duration as TimeDuration;

    struct CountingLauncher(Arc<AtomicUsize>);

    impl DashboardLauncher for CountingLauncher {
        fn launch(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn record_at(ts: OffsetDateTime) -> CaptureRecord {
        build_record(ts, &AttemptSnapshot::default(), LocationInfo::unknown(), None)
    }

    #[test]
    fn retention_boundary() {
        let now = OffsetDateTime::now_utc();
        let old = record_at(now - TimeDuration::hours(49));
        let fresh = record_at(now - TimeDuration::hours(47));
        let kept = prune_expired(vec![old, fresh.clone()], now, DEFAULT_RETENTION);
        assert_eq!(kept, vec![fresh]);
    }

    #[test]
    fn unreadable_timestamps_are_pruned() {
        let mut rec = record_at(OffsetDateTime::now_utc());
        rec.timestamp = "yesterday-ish".into();
        assert!(prune_expired(vec![rec], OffsetDateTime::now_utc(), DEFAULT_RETENTION).is_empty());
    }

    #[test]
    fn record_without_image_still_persists_and_launches_dashboard() {
        let storage = Storage::in_memory();
        let launches = Arc::new(AtomicUsize::new(0));
        let recorder = IntruderRecorder::new(
            storage.clone(),
            EventBus::new(),
            Box::new(CountingLauncher(launches.clone())),
        );
        let attempt = AttemptSnapshot { username: "admin".into(), count: 3 };
        let rec = recorder
            .record_intrusion(&attempt, LocationInfo::unknown(), None)
            .unwrap();
        assert_eq!(rec.ip, "unknown");
        assert_eq!(rec.image_data, None);
        assert_eq!(rec.username.as_deref(), Some("admin"));

        let stored: Vec<CaptureRecord> = storage.load(store::INTRUDERS);
        assert_eq!(stored, vec![rec.clone()]);
        let last: Option<CaptureRecord> = storage.load(store::LAST_INTRUDER);
        assert_eq!(last, Some(rec));
        assert_eq!(launches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn open_dashboard_is_not_relaunched() {
        let bus = EventBus::new();
        let _presence = bus.register_dashboard();
        let launches = Arc::new(AtomicUsize::new(0));
        let recorder = IntruderRecorder::new(
            Storage::in_memory(),
            bus,
            Box::new(CountingLauncher(launches.clone())),
        );
        recorder
            .record_intrusion(&AttemptSnapshot::default(), LocationInfo::unknown(), Some(&[1, 2, 3]))
            .unwrap();
        assert_eq!(launches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn collection_round_trip_preserves_order() {
        let now = OffsetDateTime::now_utc();
        let records: Vec<CaptureRecord> = (0..4)
            .map(|i| {
                let mut loc = LocationInfo::unknown();
                loc.ip = format!("10.0.0.{i}");
                build_record(now - TimeDuration::minutes(i), &AttemptSnapshot::default(), loc, None)
            })
            .collect();
        let text = serde_json::to_string(&records).unwrap();
        let back: Vec<CaptureRecord> = serde_json::from_str(&text).unwrap();
        assert_eq!(back, records);
    }
}
