use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path as FsPath, PathBuf},
    sync::{Arc, Mutex as StdMutex},
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use axum::{
    extract::{ConnectInfo, DefaultBodyLimit, Multipart, Path, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    services::ServeDir,
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use tracing::{error, info, warn};

use crate::{
    config::ServerConfig,
    error::ApiError,
    types::{now_rfc3339, unix_millis},
};

/// Record kept by the upload API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoredIntruder {
    pub id: String,
    pub ip: String,
    pub location: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub country: String,
    #[serde(default = "one")]
    pub attempts: u32,
    pub timestamp: String,
    #[serde(default)]
    pub image_path: Option<String>,
}

fn one() -> u32 {
    1
}

/// Flat JSON file. Every read-modify-write runs under one lock, so
/// concurrent uploads cannot drop each other's appends.
#[derive(Debug)]
pub struct IntruderDb {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl IntruderDb {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Current contents; unreadable or malformed files read as empty.
    pub async fn read(&self) -> Vec<StoredIntruder> {
        match tokio::fs::read(&self.path).await {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), "database file is malformed: {e}");
                Vec::new()
            }),
            Err(_) => Vec::new(),
        }
    }

    async fn write(&self, records: &[StoredIntruder]) -> Result<()> {
        let body = serde_json::to_vec_pretty(records)?;
        tokio::fs::write(&self.path, body)
            .await
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }

    pub async fn append(&self, record: StoredIntruder) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.read().await;
        records.push(record);
        self.write(&records).await
    }

    /// Remove by id, returning the removed record.
    pub async fn remove(&self, id: &str) -> Result<Option<StoredIntruder>> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.read().await;
        let Some(index) = records.iter().position(|r| r.id == id) else {
            return Ok(None);
        };
        let removed = records.remove(index);
        self.write(&records).await?;
        Ok(Some(removed))
    }
}

/// Fixed-window request counter per client address.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    hits: StdMutex<HashMap<IpAddr, (Instant, u32)>>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            hits: StdMutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, client: IpAddr) -> bool {
        self.check_at(client, Instant::now())
    }

    fn check_at(&self, client: IpAddr, now: Instant) -> bool {
        let mut hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        hits.retain(|_, (start, _)| now.duration_since(*start) < self.window);
        let slot = hits.entry(client).or_insert((now, 0));
        slot.1 += 1;
        slot.1 <= self.limit
    }
}

#[derive(Clone)]
pub struct AppState {
    inner: Arc<ServerState>, // shared between handlers
}

#[derive(Debug)]
struct ServerState {
    db: IntruderDb,
    upload_dir: PathBuf,
    max_upload_bytes: usize,
    limiter: RateLimiter,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            inner: Arc::new(ServerState {
                db: IntruderDb::new(&config.db_file),
                upload_dir: config.upload_dir.clone(),
                max_upload_bytes: config.max_upload_bytes,
                limiter: RateLimiter::new(config.rate_limit, config.rate_window),
            }),
        }
    }
}

pub fn build_router(config: &ServerConfig) -> Router {
    let state = AppState::new(config);

    let api = Router::new()
        .route("/intruders", get(list_intruders).post(create_intruder))
        .route("/intruders/{id}", delete(delete_intruder))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes + 64 * 1024))
        .with_state(state.clone());

    let uploads = ServeDir::new(&config.upload_dir);

    let cors = match &config.allowed_origins {
        Some(origins) => {
            let list: Vec<HeaderValue> = origins
                .iter()
                .filter_map(|o| HeaderValue::from_str(o).ok())
                .collect();
            CorsLayer::new().allow_origin(AllowOrigin::list(list))
        }
        None => CorsLayer::new().allow_origin(Any),
    }
    .allow_methods(Any)
    .allow_headers(Any);

    Router::new()
        .nest("/api", api)
        .nest_service("/uploads", uploads)
        .layer(middleware::from_fn_with_state(state, rate_limit))
        .layer(cors)
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::REFERRER_POLICY,
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(TraceLayer::new_for_http())
}

pub async fn spawn_server(config: ServerConfig) -> Result<()> {
    let app = build_router(&config);

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!("Server running on http://{}", config.bind);
    info!("Upload directory: {}", config.upload_dir.display());
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

async fn rate_limit(State(app): State<AppState>, req: Request, next: Next) -> Response {
    let client = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    if !app.inner.limiter.check(client) {
        warn!(%client, "rate limit exceeded");
        return ApiError::TooManyRequests.into_response();
    }
    next.run(req).await
}

async fn list_intruders(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.inner.db.read().await)
}

async fn create_intruder(
    State(app): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let mut fields: HashMap<String, String> = HashMap::new();
    let mut image: Option<(Option<String>, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Validation(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "image" {
            let is_image = field
                .content_type()
                .map(|ct| ct.starts_with("image/"))
                .unwrap_or(false);
            if !is_image {
                return Err(ApiError::Validation("Only image files are allowed!".into()));
            }
            let original = field.file_name().map(str::to_string);
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::Validation(e.to_string()))?;
            if bytes.len() > app.inner.max_upload_bytes {
                return Err(ApiError::Validation("File too large".into()));
            }
            image = Some((original, bytes.to_vec()));
        } else {
            let value = field
                .text()
                .await
                .map_err(|e| ApiError::Validation(e.to_string()))?;
            fields.insert(name, value);
        }
    }

    let take = |key: &str| fields.get(key).map(|s| s.trim().to_string()).unwrap_or_default();
    let (ip, location) = (take("ip"), take("location"));
    if ip.is_empty() || location.is_empty() {
        return Err(ApiError::Validation("IP and location are required".into()));
    }

    let image_path = match image {
        Some((original, bytes)) => Some(store_image(&app.inner.upload_dir, original.as_deref(), &bytes).await?),
        None => None,
    };

    let record = StoredIntruder {
        id: unix_millis(OffsetDateTime::now_utc()).to_string(),
        ip,
        location,
        city: take("city"),
        country: take("country"),
        attempts: take("attempts").parse::<u32>().ok().filter(|n| *n > 0).unwrap_or(1),
        timestamp: now_rfc3339(),
        image_path,
    };
    app.inner.db.append(record.clone()).await?;
    info!(id = %record.id, ip = %record.ip, "intruder stored");

    Ok((StatusCode::CREATED, Json(record)))
}

async fn delete_intruder(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(removed) = app.inner.db.remove(&id).await? else {
        return Err(ApiError::NotFound("Intruder not found".into()));
    };
    if let Some(path) = removed.image_path.as_deref() {
        if let Err(e) = tokio::fs::remove_file(path).await {
            error!(path, "error deleting image: {e}");
        }
    }
    Ok(Json(json!({ "message": "Intruder deleted successfully" })))
}

async fn store_image(dir: &FsPath, original: Option<&str>, bytes: &[u8]) -> Result<String> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let ext = original
        .and_then(|n| FsPath::new(n).extension())
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default();
    let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000_000);
    let name = format!(
        "intruder-{}-{suffix}{ext}",
        unix_millis(OffsetDateTime::now_utc())
    );
    let path = dir.join(name);
    tokio::fs::write(&path, bytes)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path.to_string_lossy().replace('\\', "/"))
}
