use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use intruder_watch::camera::{CameraDevice, NoCamera, SyntheticCamera};
use intruder_watch::config::Settings;
use intruder_watch::dashboard::Dashboard;
use intruder_watch::events::EventBus;
use intruder_watch::geo::{GeoResolver, IpInfoResolver, StaticResolver};
use intruder_watch::login::{LoginOutcome, LoginPage};
use intruder_watch::recorder::{prune_expired, AttemptSnapshot, IntruderRecorder, NoLauncher};
use intruder_watch::store::{self, Storage};
use intruder_watch::types::{CaptureRecord, LocationInfo, Tier};
use time::OffsetDateTime;

fn fast_settings() -> Settings {
    Settings {
        auth_delay: Duration::ZERO,
        settle: Duration::from_millis(1),
        ..Settings::default()
    }
}

fn located(ip: &str, loc: &str, city: &str, country: &str) -> LocationInfo {
    LocationInfo {
        ip: ip.into(),
        loc: loc.into(),
        city: city.into(),
        country: country.into(),
        ..LocationInfo::unknown()
    }
}

struct CountingResolver {
    calls: Arc<AtomicUsize>,
    answer: LocationInfo,
}

#[async_trait]
impl GeoResolver for CountingResolver {
    async fn resolve(&self) -> LocationInfo {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer.clone()
    }
}

fn page(
    storage: &Storage,
    bus: &EventBus,
    resolver: Arc<dyn GeoResolver>,
    camera: Arc<dyn CameraDevice>,
) -> LoginPage {
    LoginPage::open(
        fast_settings(),
        storage.clone(),
        bus.clone(),
        resolver,
        camera,
        Box::new(NoLauncher),
    )
}

/// A port nothing listens on.
async fn dead_endpoint() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}/json")
}

#[tokio::test]
async fn fewer_than_three_failures_capture_nothing() {
    for failures in 0..3 {
        let storage = Storage::in_memory();
        let bus = EventBus::new();
        let mut login = page(
            &storage,
            &bus,
            Arc::new(StaticResolver::default()),
            Arc::new(SyntheticCamera::new()),
        );
        for _ in 0..failures {
            let outcome = login.submit("admin", "nope").await;
            assert!(matches!(outcome, LoginOutcome::Invalid { .. }));
        }
        assert!(!login.is_locked());
        let intruders: Vec<CaptureRecord> = storage.load(store::INTRUDERS);
        assert!(intruders.is_empty(), "{failures} failures created a record");
    }
}

#[tokio::test]
async fn empty_fields_do_not_count() {
    let storage = Storage::in_memory();
    let mut login = page(
        &storage,
        &EventBus::new(),
        Arc::new(StaticResolver::default()),
        Arc::new(NoCamera),
    );
    assert_eq!(login.submit("  ", "pw").await, LoginOutcome::MissingFields);
    assert_eq!(login.submit("admin", "").await, LoginOutcome::MissingFields);
    assert_eq!(login.tracker().session_failures(), 0);
}

#[tokio::test]
async fn correct_password_logs_in() {
    let storage = Storage::in_memory();
    let mut login = page(
        &storage,
        &EventBus::new(),
        Arc::new(StaticResolver::default()),
        Arc::new(NoCamera),
    );
    assert_eq!(login.submit("admin", "uV#Ejdv0qH").await, LoginOutcome::Success);
}

#[tokio::test]
async fn third_failure_appends_exactly_one_record() {
    let storage = Storage::in_memory();
    let bus = EventBus::new();
    let mut login = page(
        &storage,
        &bus,
        Arc::new(StaticResolver::default()),
        Arc::new(NoCamera),
    );
    for _ in 0..2 {
        login.submit("admin", "nope").await;
    }
    assert!(login.submit("admin", "nope").await.is_locked());
    for _ in 0..4 {
        assert_eq!(
            login.submit("admin", "nope").await,
            LoginOutcome::Locked { record: None }
        );
    }
    let intruders: Vec<CaptureRecord> = storage.load(store::INTRUDERS);
    assert_eq!(intruders.len(), 1);

    // A reload starts a new session: the persisted count keeps growing.
    let mut reloaded = page(
        &storage,
        &bus,
        Arc::new(StaticResolver::default()),
        Arc::new(NoCamera),
    );
    assert!(!reloaded.is_locked());
    reloaded.submit("admin", "nope").await;
    assert_eq!(reloaded.tracker().count_for("admin"), 4);
}

#[tokio::test]
async fn camera_failure_keeps_resolver_data() {
    let storage = Storage::in_memory();
    let mut login = page(
        &storage,
        &EventBus::new(),
        Arc::new(StaticResolver(located("5.6.7.8", "1,2", "Oslo", "NO"))),
        Arc::new(SyntheticCamera::denied()),
    );
    let mut last = LoginOutcome::MissingFields;
    for _ in 0..3 {
        last = login.submit("root", "toor").await;
    }
    let LoginOutcome::Locked { record: Some(rec) } = last else {
        panic!("expected a capture, got {last:?}");
    };
    assert_eq!(rec.ip, "5.6.7.8");
    assert_eq!(rec.city, "Oslo");
    assert_eq!(rec.image_data, None);
    let intruders: Vec<CaptureRecord> = storage.load(store::INTRUDERS);
    assert_eq!(intruders, vec![rec]);
}

#[tokio::test]
async fn admin_scenario_reaches_the_dashboard_as_danger() {
    let bus = EventBus::new();
    let storage = Storage::in_memory().with_events(bus.clone());

    let mut dashboard = Dashboard::new(storage.clone());
    let mut events = dashboard.connect(&bus);
    dashboard.activate();

    let calls = Arc::new(AtomicUsize::new(0));
    let resolver = CountingResolver {
        calls: calls.clone(),
        answer: located("1.2.3.4", "10,20", "X", "Y"),
    };
    let mut login = page(&storage, &bus, Arc::new(resolver), Arc::new(SyntheticCamera::new()));

    assert_eq!(login.submit("admin", "a").await, LoginOutcome::Invalid { remaining: 2 });
    assert_eq!(login.submit("admin", "b").await, LoginOutcome::Invalid { remaining: 1 });
    let outcome = login.submit("admin", "c").await;
    assert_eq!(login.tracker().count_for("admin"), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let LoginOutcome::Locked { record: Some(rec) } = outcome else {
        panic!("expected a capture");
    };
    assert_eq!(rec.ip, "1.2.3.4");
    assert_eq!(rec.location, "10,20");
    assert!(rec
        .image_data
        .as_deref()
        .is_some_and(|d| d.starts_with("data:image/jpeg;base64,")));

    while let Ok(event) = events.try_recv() {
        dashboard.apply(event);
    }
    let marker = dashboard.marker("1.2.3.4").expect("marker for intruder");
    assert_eq!(marker.coordinates, [10.0, 20.0]);
    assert_eq!(marker.tier, Tier::Danger);
    assert_eq!(dashboard.counters().total_ips, 1);
    assert_eq!(dashboard.counters().images_captured, 1);
}

#[tokio::test]
async fn total_failure_still_records_unknown_intruder() {
    let bus = EventBus::new();
    let storage = Storage::in_memory().with_events(bus.clone());
    let mut dashboard = Dashboard::new(storage.clone());
    let mut events = dashboard.connect(&bus);
    dashboard.activate();
    let before = dashboard.counters();

    let resolver = IpInfoResolver::new(dead_endpoint().await);
    let mut login = page(&storage, &bus, Arc::new(resolver), Arc::new(NoCamera));
    let mut last = LoginOutcome::MissingFields;
    for _ in 0..3 {
        last = login.submit("admin", "wrong").await;
    }
    let LoginOutcome::Locked { record: Some(rec) } = last else {
        panic!("expected a capture");
    };
    assert_eq!(rec.ip, "unknown");
    assert_eq!(rec.location, "unknown");
    assert_eq!(rec.image_data, None);

    while let Ok(event) = events.try_recv() {
        dashboard.apply(event);
    }
    let after = dashboard.counters();
    assert_eq!(after.total_ips, before.total_ips + 1);
    assert_eq!(after.images_captured, before.images_captured);
    // The username still links the capture back to its attempt record.
    assert_eq!(dashboard.marker("unknown").unwrap().tier, Tier::Danger);
}

#[tokio::test]
async fn cleanup_racing_an_append_can_lose_it() {
    let storage = Storage::in_memory();
    let recorder = IntruderRecorder::new(storage.clone(), EventBus::new(), Box::new(NoLauncher));
    let now = OffsetDateTime::now_utc();

    // The cleanup pass reads its view first...
    let stale: Vec<CaptureRecord> = storage.load(store::INTRUDERS);
    // ...an append lands in between...
    recorder
        .record_intrusion(&AttemptSnapshot::default(), LocationInfo::unknown(), None)
        .unwrap();
    // ...and the cleanup writes back its stale view. Last writer wins.
    let kept = prune_expired(stale, now, Settings::default().retention);
    storage.save(store::INTRUDERS, &kept).unwrap();

    let intruders: Vec<CaptureRecord> = storage.load(store::INTRUDERS);
    assert!(intruders.is_empty());
}

#[tokio::test]
async fn opening_the_page_prunes_expired_captures() {
    let storage = Storage::in_memory();
    let now = OffsetDateTime::now_utc();
    let mut old = intruder_watch::recorder::build_record(
        now - time::Duration::hours(49),
        &AttemptSnapshot::default(),
        LocationInfo::unknown(),
        None,
    );
    old.id = "old".into();
    let fresh = intruder_watch::recorder::build_record(
        now - time::Duration::hours(47),
        &AttemptSnapshot::default(),
        LocationInfo::unknown(),
        None,
    );
    storage.save(store::INTRUDERS, &vec![old, fresh.clone()]).unwrap();

    let _login = page(
        &storage,
        &EventBus::new(),
        Arc::new(StaticResolver::default()),
        Arc::new(NoCamera),
    );
    let intruders: Vec<CaptureRecord> = storage.load(store::INTRUDERS);
    assert_eq!(intruders, vec![fresh]);
}

#[tokio::test]
async fn file_store_is_shared_between_contexts() {
    let dir = tempfile::tempdir().unwrap();
    let kv = intruder_watch::store::FileStore::open(dir.path()).unwrap();
    let storage = Storage::new(Arc::new(kv));
    let mut login = page(
        &storage,
        &EventBus::new(),
        Arc::new(StaticResolver(located("9.9.9.9", "3,4", "", ""))),
        Arc::new(SyntheticCamera::new()),
    );
    for _ in 0..3 {
        login.submit("guest", "x").await;
    }

    // A dashboard in another process only sees the directory.
    let other = intruder_watch::store::FileStore::open(dir.path()).unwrap();
    let mut dashboard = Dashboard::new(Storage::new(Arc::new(other)));
    dashboard.activate();
    assert_eq!(dashboard.marker("9.9.9.9").unwrap().tier, Tier::Danger);
    assert_eq!(dashboard.counters().images_captured, 1);
}
