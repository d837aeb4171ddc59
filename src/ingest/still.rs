//! Static image source.
//!
//! Serves one image file as a shelf camera that never changes. The image is
//! decoded once at `open`; every `next_frame` hands out a fresh frame with a
//! new sequence number. Used for shelf setup against reference photos.

use std::path::PathBuf;
use std::time::Duration;

use image::RgbImage;

use super::{FrameSource, SourceStats};
use crate::error::SourceError;
use crate::frame::Frame;

pub struct StillImageSource {
    path: PathBuf,
    name: String,
    image: Option<RgbImage>,
    frame_count: u64,
}

impl StillImageSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path.display().to_string();
        Self {
            path,
            name,
            image: None,
            frame_count: 0,
        }
    }
}

impl FrameSource for StillImageSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<(), SourceError> {
        if self.image.is_some() {
            return Ok(());
        }
        let image = decode_image_file(&self.name, &self.path)?;
        log::info!(
            "StillImageSource: opened {} ({}x{})",
            self.name,
            image.width(),
            image.height()
        );
        self.image = Some(image);
        Ok(())
    }

    fn next_frame(&mut self, _timeout: Duration) -> Result<Option<Frame>, SourceError> {
        let image = self
            .image
            .as_ref()
            .ok_or_else(|| SourceError::NotOpen(self.name.clone()))?;
        self.frame_count += 1;
        Frame::from_image(image.clone(), self.frame_count, crate::now_ms()).map(Some)
    }

    fn close(&mut self) {
        self.image = None;
    }

    fn is_open(&self) -> bool {
        self.image.is_some()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            name: self.name.clone(),
            frames_captured: self.frame_count,
            frames_dropped: 0,
        }
    }
}

/// Read and decode an image file into RGB8.
pub(crate) fn decode_image_file(name: &str, path: &std::path::Path) -> Result<RgbImage, SourceError> {
    let bytes = std::fs::read(path).map_err(|source| SourceError::Io {
        source_name: name.to_string(),
        source,
    })?;
    let decoded = image::load_from_memory(&bytes).map_err(|e| SourceError::Decode {
        source_name: name.to_string(),
        reason: e.to_string(),
    })?;
    Ok(decoded.to_rgb8())
}
