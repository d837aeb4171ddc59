use anyhow::Result;

use crate::frame::Frame;

use super::result::RawDetection;

/// Detector backend trait.
///
/// The model behind a backend is an external collaborator: the service only
/// needs boxes with confidences in source-image pixel coordinates. Backends
/// run on the detection worker thread and may be abandoned mid-call when
/// they exceed the deadline, so they must not hold locks shared with the
/// run loop.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame. The frame is read-only.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<RawDetection>>;

    /// Optional warm-up hook, called once before the first pass.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
