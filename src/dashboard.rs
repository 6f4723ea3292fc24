//! Dashboard context: keeps a marker per IP plus aggregate counters in sync
//! with the shared store.
//!
//! Two update paths feed it. A periodic poll reloads everything from the
//! store; pushed events upsert a single record for lower latency. Both land
//! on the same state, and the next poll corrects any drift from a missed or
//! duplicated event.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{DashboardPresence, Event, EventBus};
use crate::geo::{CachedResolver, GeoResolver};
use crate::store::{self, Storage};
use crate::types::{parse_coordinates, AttemptMap, CaptureRecord, LocationInfo, Tier};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Grid size, in degrees, used to group nearby markers while clustering.
const CLUSTER_CELL_DEG: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterMode {
    On,
    Off,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Marker {
    pub ip: String,
    pub coordinates: [f64; 2],
    pub attempts: u32,
    pub tier: Tier,
    pub city: String,
    pub country: String,
    pub org: String,
    pub last_seen: String,
    pub username: Option<String>,
    pub captures: usize,
    pub has_image: bool,
    pub blocked: bool,
    /// The dashboard's own location.
    pub own: bool,
    #[serde(skip)]
    record_ids: BTreeSet<String>,
    #[serde(skip)]
    recorded_attempts: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub total_ips: usize,
    pub suspicious_ips: usize,
    pub blocked_ips: usize,
    pub images_captured: usize,
}

/// Markers drawn together under the current presentation mode.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarkerGroup {
    pub center: [f64; 2],
    pub ips: Vec<String>,
    pub tier: Tier,
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardSnapshot {
    pub counters: Counters,
    pub clustering: ClusterMode,
    pub markers: Vec<Marker>,
}

pub struct Dashboard {
    storage: Storage,
    resolver: Option<CachedResolver<Arc<dyn GeoResolver>>>,
    markers: HashMap<String, Marker>,
    attempts: BTreeMap<String, u32>,
    counters: Counters,
    clustering: ClusterMode,
    own_location: Option<LocationInfo>,
    presence: Option<DashboardPresence>,
}

impl Dashboard {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            resolver: None,
            markers: HashMap::new(),
            attempts: BTreeMap::new(),
            counters: Counters::default(),
            clustering: ClusterMode::On,
            own_location: None,
            presence: None,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn GeoResolver>) -> Self {
        self.resolver = Some(CachedResolver::new(resolver));
        self
    }

    /// Register as an open dashboard and start listening for events.
    pub fn connect(&mut self, bus: &EventBus) -> broadcast::Receiver<Event> {
        self.presence = Some(bus.register_dashboard());
        bus.subscribe()
    }

    /// Initial load.
    pub fn activate(&mut self) {
        self.poll();
        info!(ips = self.counters.total_ips, "dashboard activated");
    }

    /// Reload the collection and the attempt counts and rebuild everything.
    pub fn poll(&mut self) {
        let intruders: Vec<CaptureRecord> = self.storage.load(store::INTRUDERS);
        self.reload_attempts();

        self.markers.clear();
        if let Some(own) = self.own_location.clone() {
            self.insert_own(&own);
        }
        for record in &intruders {
            self.upsert(record);
        }
        self.recount();
        debug!(records = intruders.len(), markers = self.markers.len(), "dashboard polled");
    }

    /// Incremental update from a pushed event.
    pub fn apply(&mut self, event: Event) {
        match event {
            Event::NewIntruder(record) => {
                self.upsert(&record);
                self.recount();
            }
            Event::FailedAttempt { username, count } => {
                let entry = self.attempts.entry(username).or_insert(0);
                *entry = (*entry).max(count);
                self.retier();
                self.recount();
            }
            Event::StorageChanged { key } => {
                if key == store::INTRUDERS || key == store::LOGIN_ATTEMPTS {
                    self.poll();
                }
            }
        }
    }

    /// Poll on a fixed interval and apply pushed events until `shutdown`
    /// fires or the channel closes.
    pub async fn run(
        mut self,
        mut events: broadcast::Receiver<Event>,
        poll_every: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        let mut ticker = tokio::time::interval(poll_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.poll(),
                msg = events.recv() => match msg {
                    Ok(event) => self.apply(event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "dashboard fell behind on events, reloading");
                        self.poll();
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        self
    }

    /// Resolve (once) and pin the dashboard's own location.
    pub async fn locate_self(&mut self) -> Option<LocationInfo> {
        let resolver = self.resolver.as_ref()?;
        let own = resolver.resolve().await;
        if own.is_unknown() {
            return None;
        }
        self.own_location = Some(own.clone());
        self.insert_own(&own);
        self.recount();
        Some(own)
    }

    pub fn toggle_clustering(&mut self) -> ClusterMode {
        self.clustering = match self.clustering {
            ClusterMode::On => ClusterMode::Off,
            ClusterMode::Off => ClusterMode::On,
        };
        self.clustering
    }

    pub fn clustering(&self) -> ClusterMode {
        self.clustering
    }

    /// Markers arranged for display. Grouping never touches marker data.
    pub fn layout(&self) -> Vec<MarkerGroup> {
        let mut markers: Vec<&Marker> = self.markers.values().collect();
        markers.sort_by(|a, b| a.ip.cmp(&b.ip));

        if self.clustering == ClusterMode::Off {
            return markers
                .into_iter()
                .map(|m| MarkerGroup {
                    center: m.coordinates,
                    ips: vec![m.ip.clone()],
                    tier: m.tier,
                })
                .collect();
        }

        let mut cells: BTreeMap<(i64, i64), Vec<&Marker>> = BTreeMap::new();
        for m in markers {
            let cell = (
                (m.coordinates[0] / CLUSTER_CELL_DEG).floor() as i64,
                (m.coordinates[1] / CLUSTER_CELL_DEG).floor() as i64,
            );
            cells.entry(cell).or_default().push(m);
        }
        cells
            .into_values()
            .map(|group| {
                let n = group.len() as f64;
                let lat = group.iter().map(|m| m.coordinates[0]).sum::<f64>() / n;
                let lon = group.iter().map(|m| m.coordinates[1]).sum::<f64>() / n;
                let worst = group.iter().map(|m| m.attempts).max().unwrap_or(0);
                MarkerGroup {
                    center: [lat, lon],
                    ips: group.iter().map(|m| m.ip.clone()).collect(),
                    tier: Tier::for_attempts(worst),
                }
            })
            .collect()
    }

    pub fn marker(&self, ip: &str) -> Option<&Marker> {
        self.markers.get(ip)
    }

    pub fn markers(&self) -> impl Iterator<Item = &Marker> {
        self.markers.values()
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    pub fn snapshot(&self) -> DashboardSnapshot {
        let mut markers: Vec<Marker> = self.markers.values().cloned().collect();
        markers.sort_by(|a, b| a.ip.cmp(&b.ip));
        DashboardSnapshot {
            counters: self.counters,
            clustering: self.clustering,
            markers,
        }
    }

    fn reload_attempts(&mut self) {
        let stored: AttemptMap = self.storage.load(store::LOGIN_ATTEMPTS);
        self.attempts = stored
            .into_iter()
            .map(|(name, rec)| (name, rec.count))
            .collect();
    }

    fn attempts_for(&self, ip: &str, username: Option<&str>, recorded: u32) -> u32 {
        let by_name = username.and_then(|u| self.attempts.get(u)).copied().unwrap_or(0);
        let by_ip = self.attempts.get(ip).copied().unwrap_or(0);
        recorded.max(by_name).max(by_ip)
    }

    fn upsert(&mut self, record: &CaptureRecord) {
        let coordinates = parse_coordinates(&record.location);
        let marker = self.markers.entry(record.ip.clone()).or_insert_with(|| Marker {
            ip: record.ip.clone(),
            coordinates,
            attempts: 0,
            tier: Tier::Safe,
            city: String::new(),
            country: String::new(),
            org: String::new(),
            last_seen: String::new(),
            username: None,
            captures: 0,
            has_image: false,
            blocked: false,
            own: false,
            record_ids: BTreeSet::new(),
            recorded_attempts: 0,
        });

        marker.coordinates = coordinates;
        marker.city = record.city.clone();
        marker.country = record.country.clone();
        marker.org = record.org.clone();
        marker.last_seen = record.timestamp.clone();
        if record.username.is_some() {
            marker.username = record.username.clone();
        }
        marker.record_ids.insert(record.id.clone());
        marker.captures = marker.record_ids.len();
        marker.has_image |= record.has_image();
        marker.blocked |= record.blocked;
        marker.recorded_attempts = marker.recorded_attempts.max(record.attempts);

        let (username, recorded) = (marker.username.clone(), marker.recorded_attempts);
        let attempts = self.attempts_for(&record.ip, username.as_deref(), recorded);
        if let Some(m) = self.markers.get_mut(&record.ip) {
            m.attempts = attempts;
            m.tier = Tier::for_attempts(attempts);
        }
    }

    fn insert_own(&mut self, own: &LocationInfo) {
        let marker = self.markers.entry(own.ip.clone()).or_insert_with(|| Marker {
            ip: own.ip.clone(),
            coordinates: parse_coordinates(&own.loc),
            attempts: 0,
            tier: Tier::Safe,
            city: own.city.clone(),
            country: own.country.clone(),
            org: own.org.clone(),
            last_seen: String::new(),
            username: None,
            captures: 0,
            has_image: false,
            blocked: false,
            own: true,
            record_ids: BTreeSet::new(),
            recorded_attempts: 0,
        });
        marker.own = true;
    }

    fn retier(&mut self) {
        let updates: Vec<(String, u32)> = self
            .markers
            .values()
            .map(|m| {
                let attempts = self.attempts_for(&m.ip, m.username.as_deref(), m.recorded_attempts);
                (m.ip.clone(), attempts)
            })
            .collect();
        for (ip, attempts) in updates {
            if let Some(m) = self.markers.get_mut(&ip) {
                m.attempts = attempts;
                m.tier = Tier::for_attempts(attempts);
            }
        }
    }

    fn recount(&mut self) {
        let markers = self.markers.values();
        let mut c = Counters::default();
        for m in markers {
            c.total_ips += 1;
            if m.attempts > 0 {
                c.suspicious_ips += 1;
            }
            if m.blocked {
                c.blocked_ips += 1;
            }
            if m.has_image {
                c.images_captured += 1;
            }
        }
        self.counters = c;
    }
}
