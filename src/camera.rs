//! Single-frame camera capture.
//!
//! A capture opens the device, waits for the stream to report its
//! dimensions, lets exposure settle, draws one frame into an off-screen
//! buffer and encodes it as JPEG. The stream is stopped on every path once
//! it was opened.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use image::{codecs::jpeg::JpegEncoder, imageops, Rgb, RgbImage};
use serde_json::{json, Value};
use time::{macros::format_description, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::error::CaptureError;
use crate::types::format_rfc3339;

pub const DEFAULT_SETTLE: Duration = Duration::from_millis(500);
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facing {
    User,
    Environment,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConstraints {
    pub facing: Facing,
    pub width: u32,
    pub height: u32,
    pub audio: bool,
}

impl Default for StreamConstraints {
    fn default() -> Self {
        Self {
            facing: Facing::User,
            width: 1280,
            height: 720,
            audio: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

#[async_trait]
pub trait CameraDevice: Send + Sync {
    /// Acquire exclusive access to the device.
    async fn open(&self, constraints: &StreamConstraints) -> Result<Box<dyn VideoStream>, CaptureError>;
}

#[async_trait]
pub trait VideoStream: Send {
    /// Resolves once the stream knows its dimensions.
    async fn metadata(&mut self) -> Result<FrameSize, CaptureError>;

    /// Draw the current frame scaled into `target`.
    fn draw_frame(&mut self, target: &mut RgbImage) -> Result<(), CaptureError>;

    /// Stop the underlying track. Must tolerate repeated calls.
    fn stop(&mut self);
}

/// Stops the wrapped stream when dropped.
struct StreamGuard {
    stream: Box<dyn VideoStream>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.stream.stop();
    }
}

#[derive(Clone)]
pub struct ImageCapture {
    device: Arc<dyn CameraDevice>,
    constraints: StreamConstraints,
    settle: Duration,
    quality: u8,
}

impl ImageCapture {
    pub fn new(device: Arc<dyn CameraDevice>) -> Self {
        Self {
            device,
            constraints: StreamConstraints::default(),
            settle: DEFAULT_SETTLE,
            quality: DEFAULT_JPEG_QUALITY,
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality.clamp(1, 100);
        self
    }

    pub fn with_constraints(mut self, constraints: StreamConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    /// Grab and encode one frame. Single attempt, no retry.
    pub async fn capture(&self) -> Result<Vec<u8>, CaptureError> {
        let stream = self.device.open(&self.constraints).await?;
        let mut guard = StreamGuard { stream };

        let size = guard.stream.metadata().await?;
        if size.width == 0 || size.height == 0 {
            return Err(CaptureError::Stream(format!(
                "stream reported empty frame size {}x{}",
                size.width, size.height
            )));
        }
        debug!(width = size.width, height = size.height, "camera ready");

        tokio::time::sleep(self.settle).await;

        let mut frame = RgbImage::new(size.width, size.height);
        guard.stream.draw_frame(&mut frame)?;
        drop(guard);

        let bytes = encode_jpeg(&frame, self.quality)?;
        info!(bytes = bytes.len(), "captured camera frame");
        Ok(bytes)
    }
}

pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>, CaptureError> {
    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
    encoder.encode_image(frame)?;
    Ok(out)
}

/// `data:` URL form used for inline storage.
pub fn to_data_url(jpeg: &[u8]) -> String {
    format!(
        "data:image/jpeg;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(jpeg)
    )
}

/// Write a capture under `<dir>/<YYYY-MM-DD>/intruder_<YYYYMMDD_HHMMSS>.jpg`
/// with a `.json` sidecar holding `metadata` plus the capture time.
pub async fn save_capture(
    dir: impl AsRef<Path>,
    jpeg: &[u8],
    metadata: Option<Value>,
) -> Result<PathBuf, CaptureError> {
    let now = OffsetDateTime::now_utc();
    let day = now
        .format(format_description!("[year]-[month]-[day]"))
        .map_err(|e| CaptureError::Stream(e.to_string()))?;
    let stamp = now
        .format(format_description!("[year][month][day]_[hour][minute][second]"))
        .map_err(|e| CaptureError::Stream(e.to_string()))?;

    let day_dir = dir.as_ref().join(day);
    tokio::fs::create_dir_all(&day_dir).await?;
    let path = day_dir.join(format!("intruder_{stamp}.jpg"));
    tokio::fs::write(&path, jpeg).await?;

    let mut sidecar = match metadata {
        Some(Value::Object(map)) => Value::Object(map),
        Some(other) => json!({ "metadata": other }),
        None => json!({}),
    };
    sidecar["timestamp"] = Value::String(format_rfc3339(now));
    let body = serde_json::to_vec_pretty(&sidecar).map_err(|e| CaptureError::Stream(e.to_string()))?;
    tokio::fs::write(path.with_extension("json"), body).await?;

    info!(path = %path.display(), "security image saved");
    Ok(path)
}

/// Always reports a missing device.
#[derive(Debug, Default, Clone)]
pub struct NoCamera;

#[async_trait]
impl CameraDevice for NoCamera {
    async fn open(&self, _: &StreamConstraints) -> Result<Box<dyn VideoStream>, CaptureError> {
        Err(CaptureError::NotFound)
    }
}

/// Serves frames from an image file on disk.
#[derive(Debug, Clone)]
pub struct StillImageCamera {
    path: PathBuf,
}

impl StillImageCamera {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CameraDevice for StillImageCamera {
    async fn open(&self, _: &StreamConstraints) -> Result<Box<dyn VideoStream>, CaptureError> {
        let path = self.path.clone();
        let loaded = tokio::task::spawn_blocking(move || image::open(&path))
            .await
            .map_err(|e| CaptureError::Stream(e.to_string()))?;
        let img = match loaded {
            Ok(img) => img.to_rgb8(),
            Err(image::ImageError::IoError(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CaptureError::NotFound)
            }
            Err(image::ImageError::IoError(e)) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(CaptureError::PermissionDenied(e.to_string()))
            }
            Err(e) => return Err(CaptureError::Stream(e.to_string())),
        };
        Ok(Box::new(BufferStream::new(img, None)))
    }
}

/// Generates a gradient test pattern at the requested resolution.
#[derive(Debug, Clone, Default)]
pub struct SyntheticCamera {
    deny: bool,
    fail_frame: bool,
    releases: Arc<AtomicUsize>,
}

impl SyntheticCamera {
    pub fn new() -> Self {
        Self::default()
    }

    /// Device that refuses access.
    pub fn denied() -> Self {
        Self {
            deny: true,
            ..Self::default()
        }
    }

    /// Device that opens fine but fails to deliver a frame.
    pub fn broken_frames() -> Self {
        Self {
            fail_frame: true,
            ..Self::default()
        }
    }

    /// How many opened streams have been stopped.
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CameraDevice for SyntheticCamera {
    async fn open(&self, c: &StreamConstraints) -> Result<Box<dyn VideoStream>, CaptureError> {
        if self.deny {
            return Err(CaptureError::PermissionDenied("access refused by device".into()));
        }
        let (w, h) = (c.width.max(1), c.height.max(1));
        let pattern = RgbImage::from_fn(w, h, |x, y| {
            Rgb([(x * 255 / w) as u8, (y * 255 / h) as u8, 128])
        });
        let mut stream = BufferStream::new(pattern, Some(self.releases.clone()));
        stream.fail_frame = self.fail_frame;
        Ok(Box::new(stream))
    }
}

struct BufferStream {
    image: RgbImage,
    stopped: bool,
    fail_frame: bool,
    releases: Option<Arc<AtomicUsize>>,
}

impl BufferStream {
    fn new(image: RgbImage, releases: Option<Arc<AtomicUsize>>) -> Self {
        Self {
            image,
            stopped: false,
            fail_frame: false,
            releases,
        }
    }
}

#[async_trait]
impl VideoStream for BufferStream {
    async fn metadata(&mut self) -> Result<FrameSize, CaptureError> {
        Ok(FrameSize {
            width: self.image.width(),
            height: self.image.height(),
        })
    }

    fn draw_frame(&mut self, target: &mut RgbImage) -> Result<(), CaptureError> {
        if self.stopped {
            return Err(CaptureError::Stream("stream already stopped".into()));
        }
        if self.fail_frame {
            return Err(CaptureError::Stream("no frame available".into()));
        }
        if target.dimensions() == self.image.dimensions() {
            target.copy_from_slice(&self.image);
        } else {
            let scaled = imageops::resize(
                &self.image,
                target.width(),
                target.height(),
                imageops::FilterType::Triangle,
            );
            target.copy_from_slice(&scaled);
        }
        Ok(())
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if let Some(r) = &self.releases {
            r.fetch_add(1, Ordering::SeqCst);
        }
        debug!("camera track stopped");
    }
}

impl Drop for BufferStream {
    fn drop(&mut self) {
        if !self.stopped {
            warn!("camera stream dropped without stop");
        }
    }
}
