//! Product detection over captured frames.
//!
//! A `DetectorBackend` turns a frame into raw boxes; `match_detections`
//! partitions those boxes against the region catalog; `DetectionWorker` runs
//! the whole pass on its own thread under a deadline.

mod backend;
pub mod backends;
mod matching;
mod registry;
mod result;
mod worker;

pub use backend::DetectorBackend;
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use matching::{match_detections, DEFAULT_IOU_THRESHOLD};
pub use registry::{BackendRegistry, SharedBackend};
pub use result::{DetectionResult, MatchedProduct, RawDetection};
pub use worker::{DetectionOutput, DetectionPass, DetectionWorker, PendingDetection};
