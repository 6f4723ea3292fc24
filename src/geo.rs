use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::GeoError;
use crate::types::LocationInfo;

pub const DEFAULT_ENDPOINT: &str = "https://ipinfo.io/json";

/// Source of the visitor's location. Implementations never fail: a lookup
/// problem yields [`LocationInfo::unknown`].
#[async_trait]
pub trait GeoResolver: Send + Sync {
    async fn resolve(&self) -> LocationInfo;
}

/// Single GET against an ipinfo-style JSON endpoint. No retry, and no
/// timeout beyond the client default.
#[derive(Debug, Clone)]
pub struct IpInfoResolver {
    client: reqwest::Client,
    endpoint: String,
}

impl IpInfoResolver {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }

    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn fetch(&self) -> Result<LocationInfo, GeoError> {
        let resp = self.client.get(&self.endpoint).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(GeoError::Status(status.as_u16()));
        }
        let body = resp.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

impl Default for IpInfoResolver {
    fn default() -> Self {
        Self::new(DEFAULT_ENDPOINT)
    }
}

#[async_trait]
impl GeoResolver for IpInfoResolver {
    async fn resolve(&self) -> LocationInfo {
        match self.fetch().await {
            Ok(info) => {
                info!(ip = %info.ip, loc = %info.loc, "resolved location");
                info
            }
            Err(e) => {
                warn!(endpoint = %self.endpoint, "IP info lookup failed: {e}");
                LocationInfo::unknown()
            }
        }
    }
}

/// Answers with a fixed location without touching the network.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver(pub LocationInfo);

#[async_trait]
impl GeoResolver for StaticResolver {
    async fn resolve(&self) -> LocationInfo {
        self.0.clone()
    }
}

/// Remembers the first successful lookup. Sentinel results are not cached.
pub struct CachedResolver<R> {
    inner: R,
    cached: Mutex<Option<LocationInfo>>,
}

impl<R: GeoResolver> CachedResolver<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            cached: Mutex::new(None),
        }
    }

    pub async fn clear(&self) {
        *self.cached.lock().await = None;
    }
}

#[async_trait]
impl<R: GeoResolver> GeoResolver for CachedResolver<R> {
    async fn resolve(&self) -> LocationInfo {
        let mut cached = self.cached.lock().await;
        if let Some(info) = cached.as_ref() {
            return info.clone();
        }
        let info = self.inner.resolve().await;
        if !info.is_unknown() {
            *cached = Some(info.clone());
        }
        info
    }
}

#[async_trait]
impl<R: GeoResolver + ?Sized> GeoResolver for std::sync::Arc<R> {
    async fn resolve(&self) -> LocationInfo {
        (**self).resolve().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counting {
        calls: Arc<AtomicUsize>,
        answer: LocationInfo,
    }

    #[async_trait]
    impl GeoResolver for Counting {
        async fn resolve(&self) -> LocationInfo {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer.clone()
        }
    }

    #[tokio::test]
    async fn cache_keeps_first_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut answer = LocationInfo::unknown();
        answer.ip = "9.9.9.9".into();
        let cached = CachedResolver::new(Counting { calls: calls.clone(), answer });
        assert_eq!(cached.resolve().await.ip, "9.9.9.9");
        assert_eq!(cached.resolve().await.ip, "9.9.9.9");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        cached.clear().await;
        cached.resolve().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cache_skips_sentinel() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cached = CachedResolver::new(Counting {
            calls: calls.clone(),
            answer: LocationInfo::unknown(),
        });
        cached.resolve().await;
        cached.resolve().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
