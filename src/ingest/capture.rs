//! Background capture thread feeding a `LatestFrameSlot`.
//!
//! `ThreadedSource` turns any blocking `FrameGrabber` into a `FrameSource`
//! whose `next_frame` is bounded by its timeout. The capture thread keeps
//! grabbing at its own pace; the run loop only ever sees the newest frame.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use image::RgbImage;

use super::{FrameSource, SourceStats};
use crate::error::SourceError;
use crate::frame::{Frame, LatestFrameSlot, SlotTake};

/// Blocking frame producer driven by a capture thread.
pub trait FrameGrabber: Send + 'static {
    fn name(&self) -> &str;

    /// Acquire the device. Called on the caller's thread before the capture
    /// thread starts, so open failures surface synchronously.
    fn open(&mut self) -> Result<(), SourceError>;

    /// Grab the next image; `Ok(None)` when nothing changed since the last grab.
    fn grab(&mut self) -> Result<Option<RgbImage>, SourceError>;

    fn close(&mut self) {}
}

struct Running<G> {
    stop: Arc<AtomicBool>,
    join: JoinHandle<G>,
}

pub struct ThreadedSource<G: FrameGrabber> {
    name: String,
    grabber: Option<G>,
    running: Option<Running<G>>,
    slot: Arc<LatestFrameSlot>,
    sequence: Arc<AtomicU64>,
    poll_interval: Duration,
}

impl<G: FrameGrabber> ThreadedSource<G> {
    pub fn new(grabber: G, poll_interval: Duration) -> Self {
        Self {
            name: grabber.name().to_string(),
            grabber: Some(grabber),
            running: None,
            slot: Arc::new(LatestFrameSlot::new()),
            sequence: Arc::new(AtomicU64::new(0)),
            poll_interval,
        }
    }
}

impl<G: FrameGrabber> FrameSource for ThreadedSource<G> {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<(), SourceError> {
        if self.running.is_some() {
            return Ok(());
        }
        let mut grabber = self
            .grabber
            .take()
            .ok_or_else(|| SourceError::NotOpen(self.name.clone()))?;
        if let Err(e) = grabber.open() {
            self.grabber = Some(grabber);
            return Err(e);
        }

        self.slot.reset();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let slot = Arc::clone(&self.slot);
        let sequence = Arc::clone(&self.sequence);
        let poll = self.poll_interval;
        let join = std::thread::Builder::new()
            .name("shelf-capture".to_string())
            .spawn(move || capture_loop(grabber, slot, sequence, thread_stop, poll))
            .map_err(|source| SourceError::Io {
                source_name: self.name.clone(),
                source,
            })?;

        log::info!("ThreadedSource: capture thread started for {}", self.name);
        self.running = Some(Running { stop, join });
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<Option<Frame>, SourceError> {
        if self.running.is_none() {
            return Err(SourceError::NotOpen(self.name.clone()));
        }
        match self.slot.take(timeout) {
            SlotTake::Frame(frame) => Ok(Some(frame)),
            SlotTake::Empty => Ok(None),
            SlotTake::Error(e) => Err(e),
            SlotTake::Closed => Err(SourceError::Disconnected {
                source_name: self.name.clone(),
                reason: "capture thread exited".to_string(),
            }),
        }
    }

    fn close(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.stop.store(true, Ordering::SeqCst);
        self.slot.close();
        match running.join.join() {
            Ok(mut grabber) => {
                grabber.close();
                self.grabber = Some(grabber);
            }
            Err(_) => log::error!("ThreadedSource: capture thread for {} panicked", self.name),
        }
        log::info!("ThreadedSource: closed {}", self.name);
    }

    fn is_open(&self) -> bool {
        self.running.is_some()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            name: self.name.clone(),
            frames_captured: self.sequence.load(Ordering::Relaxed),
            frames_dropped: self.slot.dropped(),
        }
    }
}

impl<G: FrameGrabber> Drop for ThreadedSource<G> {
    fn drop(&mut self) {
        self.close();
    }
}

fn capture_loop<G: FrameGrabber>(
    mut grabber: G,
    slot: Arc<LatestFrameSlot>,
    sequence: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
    poll: Duration,
) -> G {
    while !stop.load(Ordering::Relaxed) {
        match grabber.grab() {
            Ok(Some(image)) => {
                let seq = sequence.fetch_add(1, Ordering::Relaxed) + 1;
                match Frame::from_image(image, seq, crate::now_ms()) {
                    Ok(frame) => {
                        if slot.publish(frame) {
                            log::debug!("capture: dropped stale frame before seq {}", seq);
                        }
                    }
                    Err(e) => {
                        slot.publish_error(e);
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                log::warn!("capture: {} grab failed: {}", grabber.name(), e);
                slot.publish_error(e);
            }
        }
        std::thread::sleep(poll);
    }
    grabber
}
