//! Frame sources.
//!
//! This module provides the sources a shelf can be watched through:
//! - Synthetic frames (`stub://<name>`), for tests and dry runs
//! - A static image file (plain path to a JPEG/PNG)
//! - A "latest frame" file kept fresh by an external camera service
//!   (`watch://<path>`), polled on a background capture thread
//!
//! Every source implements `FrameSource`. The contract:
//! - `next_frame` never blocks longer than its timeout; `Ok(None)` means no
//!   new frame yet
//! - device failures are `SourceError`, never `Ok(None)`
//! - `close` releases the device handle and joins any capture thread

mod capture;
pub mod still;
pub mod synthetic;
pub mod watch;

use std::time::Duration;

pub use capture::{FrameGrabber, ThreadedSource};
pub use still::StillImageSource;
pub use synthetic::{SyntheticConfig, SyntheticSource};
pub use watch::WatchedFileGrabber;

use crate::error::SourceError;
use crate::frame::Frame;

/// Producer of frames for the run loop.
pub trait FrameSource: Send {
    /// Source identifier used in logs and status.
    fn name(&self) -> &str;

    /// Acquire the device. Idempotent.
    fn open(&mut self) -> Result<(), SourceError>;

    /// Newest frame, or `Ok(None)` when nothing new arrived within `timeout`.
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<Frame>, SourceError>;

    /// Release the device. Idempotent.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    fn stats(&self) -> SourceStats;
}

/// Counters reported by every source.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub name: String,
    pub frames_captured: u64,
    pub frames_dropped: u64,
}

/// Settings used to build a source from a URI.
#[derive(Clone, Debug)]
pub struct SourceSettings {
    pub uri: String,
    /// Frame size for synthetic sources.
    pub width: u32,
    pub height: u32,
    /// Pace of synthetic frames, and poll rate of watched files.
    pub target_fps: u32,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            uri: "stub://shelf".to_string(),
            width: 640,
            height: 480,
            target_fps: 10,
        }
    }
}

/// Resolve a source URI to a concrete source. The source is not opened.
pub fn source_from_settings(settings: &SourceSettings) -> Result<Box<dyn FrameSource>, SourceError> {
    let uri = settings.uri.trim();
    if uri.is_empty() {
        return Err(SourceError::Unsupported(String::new()));
    }
    if let Some(name) = uri.strip_prefix("stub://") {
        return Ok(Box::new(SyntheticSource::new(SyntheticConfig {
            name: name.to_string(),
            width: settings.width,
            height: settings.height,
            target_fps: settings.target_fps,
        })));
    }
    if let Some(path) = uri.strip_prefix("watch://") {
        let poll = frame_interval(settings.target_fps);
        return Ok(Box::new(ThreadedSource::new(
            WatchedFileGrabber::new(path),
            poll,
        )));
    }
    if uri.contains("://") {
        return Err(SourceError::Unsupported(uri.to_string()));
    }
    Ok(Box::new(StillImageSource::new(uri)))
}

pub(crate) fn frame_interval(target_fps: u32) -> Duration {
    if target_fps == 0 {
        return Duration::from_millis(100);
    }
    Duration::from_millis((1000 / target_fps.max(1)) as u64)
}
