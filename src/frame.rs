//! Frames and the single-slot handoff between capture and processing.
//!
//! - `Frame`: owned RGB8 pixel buffer plus capture metadata. Not `Clone`; a
//!   frame moves from the source to the detection worker and back.
//! - `LatestFrameSlot`: depth-one overwrite buffer. A capture thread publishes
//!   into it, the run loop takes from it. Older frames are dropped, never
//!   queued, so memory stays bounded and the loop always sees the newest frame.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use image::RgbImage;

use crate::error::SourceError;

/// Largest frame accepted from any source (8K RGB).
pub const MAX_FRAME_BYTES: usize = 7680 * 4320 * 3;

pub struct Frame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Wall-clock capture time, milliseconds since the epoch.
    pub captured_at_ms: u64,
    /// Per-source sequence number, strictly increasing.
    pub sequence: u64,
}

impl Frame {
    /// Wrap an RGB8 buffer. The buffer length must be `width * height * 3`.
    pub fn new(
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        sequence: u64,
        captured_at_ms: u64,
    ) -> Result<Self, SourceError> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .filter(|v| *v <= MAX_FRAME_BYTES)
            .unwrap_or(usize::MAX);
        if pixels.len() != expected || expected == 0 {
            return Err(SourceError::BadFrame {
                width,
                height,
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self {
            pixels,
            width,
            height,
            captured_at_ms,
            sequence,
        })
    }

    /// Build a frame from a decoded image.
    pub fn from_image(image: RgbImage, sequence: u64, captured_at_ms: u64) -> Result<Self, SourceError> {
        let (width, height) = image.dimensions();
        Self::new(image.into_raw(), width, height, sequence, captured_at_ms)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Copy of the pixels as an image (used for encoding and annotation).
    pub fn to_image(&self) -> RgbImage {
        // Length was validated in `new`, so the conversion cannot fail.
        RgbImage::from_raw(self.width, self.height, self.pixels.clone())
            .unwrap_or_else(|| RgbImage::new(self.width, self.height))
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .field("captured_at_ms", &self.captured_at_ms)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// LatestFrameSlot: depth-one overwrite buffer
// ----------------------------------------------------------------------------

/// Outcome of waiting on the slot.
#[derive(Debug)]
pub enum SlotTake {
    Frame(Frame),
    Error(SourceError),
    /// Nothing new arrived within the timeout.
    Empty,
    /// The producer has shut down.
    Closed,
}

#[derive(Default)]
struct SlotState {
    item: Option<Result<Frame, SourceError>>,
    closed: bool,
    dropped: u64,
}

/// Single-slot buffer. `publish` overwrites whatever is pending.
#[derive(Default)]
pub struct LatestFrameSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl LatestFrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the pending frame. Returns true when an unconsumed frame was dropped.
    pub fn publish(&self, frame: Frame) -> bool {
        self.put(Ok(frame))
    }

    /// Replace the pending item with a source error.
    pub fn publish_error(&self, err: SourceError) -> bool {
        self.put(Err(err))
    }

    fn put(&self, item: Result<Frame, SourceError>) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        let dropped = state.item.replace(item).is_some();
        if dropped {
            state.dropped += 1;
        }
        drop(state);
        self.ready.notify_all();
        dropped
    }

    /// Wait up to `timeout` for the newest item.
    pub fn take(&self, timeout: Duration) -> SlotTake {
        let deadline = Instant::now() + timeout;
        let Ok(mut state) = self.state.lock() else {
            return SlotTake::Closed;
        };
        loop {
            match state.item.take() {
                Some(Ok(frame)) => return SlotTake::Frame(frame),
                Some(Err(err)) => return SlotTake::Error(err),
                None => {}
            }
            if state.closed {
                return SlotTake::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return SlotTake::Empty;
            }
            state = match self.ready.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(_) => return SlotTake::Closed,
            };
        }
    }

    /// Mark the producer as finished and wake any waiter.
    pub fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
        }
        self.ready.notify_all();
    }

    /// Re-arm after `close` so a reopened producer can publish again.
    pub fn reset(&self) {
        if let Ok(mut state) = self.state.lock() {
            *state = SlotState::default();
        }
    }

    /// Frames overwritten before anyone consumed them.
    pub fn dropped(&self) -> u64 {
        self.state.lock().map(|s| s.dropped).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn make_frame(sequence: u64) -> Frame {
        Frame::new(vec![sequence as u8; 4 * 3 * 3], 4, 3, sequence, 0).unwrap()
    }

    #[test]
    fn frame_rejects_mismatched_buffer() {
        let err = Frame::new(vec![0u8; 10], 4, 3, 1, 0).unwrap_err();
        assert!(matches!(err, SourceError::BadFrame { expected: 36, actual: 10, .. }));
        assert!(Frame::new(Vec::new(), 0, 0, 1, 0).is_err());
    }

    #[test]
    fn slot_keeps_only_the_newest_frame() {
        let slot = LatestFrameSlot::new();
        assert!(!slot.publish(make_frame(1)));
        assert!(slot.publish(make_frame(2)));
        assert!(slot.publish(make_frame(3)));

        match slot.take(Duration::from_millis(10)) {
            SlotTake::Frame(frame) => assert_eq!(frame.sequence, 3),
            other => panic!("expected frame, got {other:?}"),
        }
        assert_eq!(slot.dropped(), 2);
        assert!(matches!(slot.take(Duration::from_millis(10)), SlotTake::Empty));
    }

    #[test]
    fn take_is_bounded_by_timeout() {
        let slot = LatestFrameSlot::new();
        let start = Instant::now();
        assert!(matches!(slot.take(Duration::from_millis(30)), SlotTake::Empty));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn take_wakes_on_publish_and_close() {
        let slot = Arc::new(LatestFrameSlot::new());
        let producer = Arc::clone(&slot);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.publish(make_frame(7));
            std::thread::sleep(Duration::from_millis(20));
            producer.close();
        });

        match slot.take(Duration::from_secs(5)) {
            SlotTake::Frame(frame) => assert_eq!(frame.sequence, 7),
            other => panic!("expected frame, got {other:?}"),
        }
        assert!(matches!(slot.take(Duration::from_secs(5)), SlotTake::Closed));
        handle.join().unwrap();
    }

    #[test]
    fn errors_are_delivered_like_frames() {
        let slot = LatestFrameSlot::new();
        slot.publish_error(SourceError::Unsupported("x".into()));
        assert!(matches!(
            slot.take(Duration::from_millis(5)),
            SlotTake::Error(SourceError::Unsupported(_))
        ));
    }
}
