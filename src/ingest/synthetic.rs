//! Synthetic frame source (`stub://`).
//!
//! Produces a deterministic gradient pattern that shifts every 50 frames,
//! paced to the configured frame rate. Used by tests and dry runs of the
//! service without a camera.

use std::time::{Duration, Instant};

use super::{frame_interval, FrameSource, SourceStats};
use crate::error::SourceError;
use crate::frame::Frame;

#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            name: "shelf".to_string(),
            width: 640,
            height: 480,
            target_fps: 10,
        }
    }
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    name: String,
    open: bool,
    frame_count: u64,
    scene_state: u8,
    last_frame_at: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        let name = format!("stub://{}", config.name);
        Self {
            config,
            name,
            open: false,
            frame_count: 0,
            scene_state: 0,
            last_frame_at: None,
        }
    }

    fn generate_synthetic_pixels(&mut self) -> Vec<u8> {
        let pixel_count = (self.config.width as usize) * (self.config.height as usize) * 3;
        if self.frame_count.is_multiple_of(50) {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 / 3 + self.scene_state as u64 * 17) % 256) as u8;
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<(), SourceError> {
        if !self.open {
            log::info!("SyntheticSource: opened {}", self.name);
            self.open = true;
        }
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<Option<Frame>, SourceError> {
        if !self.open {
            return Err(SourceError::NotOpen(self.name.clone()));
        }

        if let Some(last) = self.last_frame_at {
            let due = last + frame_interval(self.config.target_fps);
            let now = Instant::now();
            if due > now {
                let wait = due - now;
                if wait > timeout {
                    std::thread::sleep(timeout);
                    return Ok(None);
                }
                std::thread::sleep(wait);
            }
        }

        self.frame_count += 1;
        let pixels = self.generate_synthetic_pixels();
        let frame = Frame::new(
            pixels,
            self.config.width,
            self.config.height,
            self.frame_count,
            crate::now_ms(),
        )?;
        self.last_frame_at = Some(Instant::now());
        Ok(Some(frame))
    }

    fn close(&mut self) {
        if self.open {
            log::info!("SyntheticSource: closed {}", self.name);
        }
        self.open = false;
        self.last_frame_at = None;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            name: self.name.clone(),
            frames_captured: self.frame_count,
            frames_dropped: 0,
        }
    }
}
