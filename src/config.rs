use std::time::Duration;

use crate::attempts::DEFAULT_THRESHOLD;
use crate::camera::{DEFAULT_JPEG_QUALITY, DEFAULT_SETTLE};
use crate::dashboard::DEFAULT_POLL_INTERVAL;
use crate::geo::DEFAULT_ENDPOINT;
use crate::recorder::DEFAULT_RETENTION;

/// Demo credentials. Checked client-side, so this is insecure by
/// construction and only meant for the demo.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            username: "admin".into(),
            password: "uV#Ejdv0qH".into(),
        }
    }
}

/// Pipeline tunables.
#[derive(Debug, Clone)]
pub struct Settings {
    pub threshold: u32,
    pub settle: Duration,
    pub jpeg_quality: u8,
    pub retention: Duration,
    pub poll_interval: Duration,
    /// Simulated server round trip before a login is judged.
    pub auth_delay: Duration,
    pub geo_endpoint: String,
    pub credentials: Credentials,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            settle: DEFAULT_SETTLE,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            retention: DEFAULT_RETENTION,
            poll_interval: DEFAULT_POLL_INTERVAL,
            auth_delay: Duration::from_millis(1500),
            geo_endpoint: DEFAULT_ENDPOINT.to_string(),
            credentials: Credentials::default(),
        }
    }
}

/// Upload API configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub db_file: std::path::PathBuf,
    pub upload_dir: std::path::PathBuf,
    /// `None` allows any origin.
    pub allowed_origins: Option<Vec<String>>,
    pub max_upload_bytes: usize,
    pub rate_limit: u32,
    pub rate_window: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3001".into(),
            db_file: "intruders.json".into(),
            upload_dir: "uploads".into(),
            allowed_origins: None,
            max_upload_bytes: 5 * 1024 * 1024,
            rate_limit: 100,
            rate_window: Duration::from_secs(15 * 60),
        }
    }
}

/// Split a comma-separated origin list, ignoring blanks.
pub fn parse_origins(raw: &str) -> Option<Vec<String>> {
    let origins: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    (!origins.is_empty()).then_some(origins)
}
