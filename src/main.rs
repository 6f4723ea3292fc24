use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use intruder_watch::camera::{CameraDevice, NoCamera, StillImageCamera, SyntheticCamera};
use intruder_watch::config::{parse_origins, ServerConfig, Settings};
use intruder_watch::dashboard::{ClusterMode, Dashboard, DashboardSnapshot};
use intruder_watch::events::EventBus;
use intruder_watch::geo::{GeoResolver, IpInfoResolver, StaticResolver};
use intruder_watch::login::LoginPage;
use intruder_watch::recorder::{DashboardLauncher, IntruderRecorder, NoLauncher};
use intruder_watch::server;
use intruder_watch::store::{FileStore, Storage};

/// intruder-watch: fake login demo that captures repeat offenders and keeps a live dashboard.
#[derive(Debug, Parser)]
#[command(
    name = "intruder-watch",
    version,
    about = "Fake login demo that captures repeat offenders and keeps a live dashboard.",
    long_about = None
)]
struct Cli {
    /// Log filter used when RUST_LOG is not set.
    #[arg(long, env = "INTRUDER_WATCH_LOG", default_value = "info", global = true)]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long = "log-json", default_value_t = false, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the upload API.
    Serve(ServeArgs),
    /// Play a login session against the shared store with a dashboard attached.
    Simulate(SimulateArgs),
    /// Print the dashboard built from the shared store.
    Dashboard(DashboardArgs),
    /// Remove captures older than the retention window.
    Cleanup(StoreArgs),
}

#[derive(Debug, Args)]
struct StoreArgs {
    /// Directory holding the shared key-value store.
    #[arg(long, default_value = ".intruder-watch")]
    store: PathBuf,
}

#[derive(Debug, Args)]
struct ServeArgs {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "PORT", default_value_t = 3001)]
    port: u16,

    /// Comma-separated CORS origins. Any origin when unset.
    #[arg(long, env = "ALLOWED_ORIGINS")]
    allowed_origins: Option<String>,

    #[arg(long, default_value = "intruders.json")]
    db_file: PathBuf,

    #[arg(long, default_value = "uploads")]
    upload_dir: PathBuf,
}

#[derive(Debug, Args)]
struct SimulateArgs {
    #[command(flatten)]
    store: StoreArgs,

    #[arg(long, default_value = "admin")]
    username: String,

    /// Number of wrong passwords to submit.
    #[arg(long, default_value_t = 3)]
    attempts: u32,

    /// Serve frames from this image instead of the synthetic test pattern.
    #[arg(long)]
    camera_image: Option<PathBuf>,

    /// Pretend no camera is attached.
    #[arg(long, default_value_t = false, conflicts_with = "camera_image")]
    no_camera: bool,

    #[arg(long, default_value = intruder_watch::geo::DEFAULT_ENDPOINT)]
    geo_endpoint: String,

    /// Skip the geolocation lookup and record "unknown".
    #[arg(long, default_value_t = false)]
    offline: bool,

    /// Also write captured frames (plus metadata) under this directory.
    #[arg(long)]
    capture_dir: Option<PathBuf>,

    /// Simulated authentication round trip in milliseconds.
    #[arg(long = "auth-delay-ms", default_value_t = 1500)]
    auth_delay_ms: u64,

    /// Open the dashboard before the session instead of on first capture.
    #[arg(long, default_value_t = false)]
    dashboard_first: bool,
}

#[derive(Debug, Args)]
struct DashboardArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Print the snapshot as pretty JSON.
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Show markers individually instead of grouped.
    #[arg(long = "no-cluster", default_value_t = false)]
    no_cluster: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_json);

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Simulate(args) => simulate(args).await,
        Command::Dashboard(args) => show_dashboard(args),
        Command::Cleanup(args) => cleanup(args),
    }
}

fn init_tracing(level: &str, json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.to_string().into());

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn open_storage(args: &StoreArgs, bus: Option<EventBus>) -> Result<Storage> {
    let kv = FileStore::open(&args.store)?;
    let storage = Storage::new(Arc::new(kv));
    Ok(match bus {
        Some(bus) => storage.with_events(bus),
        None => storage,
    })
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = ServerConfig {
        bind: format!("{}:{}", args.host, args.port),
        db_file: args.db_file,
        upload_dir: args.upload_dir,
        allowed_origins: args.allowed_origins.as_deref().and_then(parse_origins),
        ..ServerConfig::default()
    };

    println!("intruder-watch API configuration:");
    println!("  bind         : {}", config.bind);
    println!("  db_file      : {}", config.db_file.display());
    println!("  upload_dir   : {}", config.upload_dir.display());
    println!(
        "  origins      : {}",
        config
            .allowed_origins
            .as_ref()
            .map(|o| o.join(", "))
            .unwrap_or_else(|| "<any>".to_string())
    );

    tokio::select! {
        res = server::spawn_server(config) => res,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}

/// Spawns a dashboard task the first time a capture finds none open.
#[derive(Clone)]
struct TaskLauncher {
    storage: Storage,
    bus: EventBus,
    poll_every: Duration,
    /// Used by the dashboard to pin its own location.
    resolver: Option<Arc<dyn GeoResolver>>,
    shutdown: CancellationToken,
    handle: Arc<Mutex<Option<JoinHandle<Dashboard>>>>,
}

impl TaskLauncher {
    fn spawn(&self) {
        let mut slot = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return;
        }
        let mut dashboard = Dashboard::new(self.storage.clone());
        if let Some(resolver) = &self.resolver {
            dashboard = dashboard.with_resolver(resolver.clone());
        }
        let events = dashboard.connect(&self.bus);
        dashboard.activate();
        let (poll_every, shutdown) = (self.poll_every, self.shutdown.clone());
        *slot = Some(tokio::spawn(async move {
            dashboard.locate_self().await;
            dashboard.run(events, poll_every, shutdown).await
        }));
        info!("dashboard opened");
    }
}

impl DashboardLauncher for TaskLauncher {
    fn launch(&self) {
        self.spawn();
    }
}

async fn simulate(args: SimulateArgs) -> Result<()> {
    let bus = EventBus::new();
    let storage = open_storage(&args.store, Some(bus.clone()))?;

    let settings = Settings {
        auth_delay: Duration::from_millis(args.auth_delay_ms),
        geo_endpoint: args.geo_endpoint.clone(),
        ..Settings::default()
    };

    let resolver: Arc<dyn GeoResolver> = if args.offline {
        Arc::new(StaticResolver::default())
    } else {
        Arc::new(IpInfoResolver::new(settings.geo_endpoint.clone()))
    };
    let camera: Arc<dyn CameraDevice> = match (&args.camera_image, args.no_camera) {
        (_, true) => Arc::new(NoCamera),
        (Some(path), false) => Arc::new(StillImageCamera::new(path)),
        (None, false) => Arc::new(SyntheticCamera::new()),
    };

    let shutdown = CancellationToken::new();
    let launcher = TaskLauncher {
        storage: storage.clone(),
        bus: bus.clone(),
        poll_every: settings.poll_interval,
        resolver: (!args.offline).then(|| resolver.clone()),
        shutdown: shutdown.clone(),
        handle: Arc::new(Mutex::new(None)),
    };
    if args.dashboard_first {
        launcher.spawn();
    }

    let mut page = LoginPage::open(
        settings,
        storage,
        bus,
        resolver,
        camera,
        Box::new(launcher.clone()),
    );
    if let Some(dir) = args.capture_dir.as_ref() {
        page = page.with_capture_dir(dir);
    }

    println!("intruder-watch simulation:");
    println!("  store        : {}", args.store.store.display());
    println!("  username     : {}", args.username);
    println!("  attempts     : {}", args.attempts);

    for n in 1..=args.attempts {
        let outcome = page.submit(&args.username, &format!("wrong-password-{n}")).await;
        println!("  [{n}] {}", outcome.message());
        if let intruder_watch::login::LoginOutcome::Locked { record: Some(rec) } = &outcome {
            println!(
                "      captured ip={} location={} image={}",
                rec.ip,
                rec.location,
                if rec.has_image() { "yes" } else { "no" }
            );
        }
    }

    // Let the dashboard drain pending events before closing it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.cancel();
    let handle = launcher.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
    match handle {
        Some(handle) => {
            let dashboard = handle.await?;
            print_dashboard(&dashboard.snapshot(), &dashboard);
        }
        None => println!("\nNo dashboard was opened (no capture happened)."),
    }
    Ok(())
}

fn show_dashboard(args: DashboardArgs) -> Result<()> {
    let storage = open_storage(&args.store, None)?;
    let mut dashboard = Dashboard::new(storage);
    dashboard.activate();
    if args.no_cluster {
        dashboard.toggle_clustering();
    }
    let snapshot = dashboard.snapshot();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print_dashboard(&snapshot, &dashboard);
    }
    Ok(())
}

fn cleanup(args: StoreArgs) -> Result<()> {
    let storage = open_storage(&args, None)?;
    let recorder = IntruderRecorder::new(storage, EventBus::new(), Box::new(NoLauncher));
    let removed = recorder.cleanup_expired(
        OffsetDateTime::now_utc(),
        Settings::default().retention,
    )?;
    if removed == 0 {
        warn!("nothing to prune");
    }
    println!("Removed {removed} expired capture(s).");
    Ok(())
}

const PLACE_MAX: usize = 40;

fn print_dashboard(snapshot: &DashboardSnapshot, dashboard: &Dashboard) {
    let c = &snapshot.counters;
    println!(
        "\nTotal IPs: {}  Suspicious: {}  Blocked: {}  Images: {}",
        c.total_ips, c.suspicious_ips, c.blocked_ips, c.images_captured
    );

    let mut ip_w = 2usize.max("ip".len());
    let mut place_w = "place".len();
    for m in &snapshot.markers {
        ip_w = ip_w.max(m.ip.len());
        place_w = place_w.max(place_cell(&m.city, &m.country).chars().count());
    }
    let coord_w = 18usize;
    let tier_w = "warning".len();

    println!(
        "{:<ip_w$}  {:<coord_w$}  {:>8}  {:<tier_w$}  {:<place_w$}",
        "ip", "coordinates", "attempts", "tier", "place",
    );
    println!(
        "{:-<ip_w$}  {:-<coord_w$}  {:-<8}  {:-<tier_w$}  {:-<place_w$}",
        "", "", "", "", "",
    );
    for m in &snapshot.markers {
        let p = place_cell(&m.city, &m.country);
        let coords = format!("{:.4},{:.4}", m.coordinates[0], m.coordinates[1]);
        println!(
            "{:<ip_w$}  {:<coord_w$}  {:>8}  {:<tier_w$}  {:<place_w$}",
            m.ip,
            coords,
            m.attempts,
            m.tier.as_str(),
            p,
        );
    }

    if snapshot.clustering == ClusterMode::On {
        let groups = dashboard.layout();
        println!("\nClusters: {}", groups.len());
        for g in groups {
            println!(
                "  [{:.2},{:.2}] {} ({})",
                g.center[0],
                g.center[1],
                g.ips.join(", "),
                g.tier.as_str()
            );
        }
    }
}

/// Place column text, cut to 40 characters.
fn place_cell(city: &str, country: &str) -> String {
    place(city, country).chars().take(PLACE_MAX).collect()
}

fn place(city: &str, country: &str) -> String {
    match (city.is_empty(), country.is_empty()) {
        (false, false) => format!("{city}, {country}"),
        (false, true) => city.to_string(),
        (true, false) => country.to_string(),
        (true, true) => "-".to_string(),
    }
}
