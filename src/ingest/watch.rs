//! Watched "latest frame" file (`watch://<path>`).
//!
//! An external camera service overwrites a single JPEG with its newest
//! capture (`camera_000_frame.jpg` and friends). This grabber polls the
//! file's modification time and decodes it only when it changed. A file that
//! vanishes after open, or a half-written file that fails to decode, is a
//! source error; an unchanged file is simply "no new frame".

use std::path::PathBuf;
use std::time::SystemTime;

use image::RgbImage;

use super::capture::FrameGrabber;
use super::still::decode_image_file;
use crate::error::SourceError;

pub struct WatchedFileGrabber {
    path: PathBuf,
    name: String,
    last_modified: Option<SystemTime>,
    last_len: u64,
}

impl WatchedFileGrabber {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path.display().to_string();
        Self {
            path,
            name,
            last_modified: None,
            last_len: 0,
        }
    }

    fn disconnected(&self, reason: String) -> SourceError {
        SourceError::Disconnected {
            source_name: self.name.clone(),
            reason,
        }
    }
}

impl FrameGrabber for WatchedFileGrabber {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<(), SourceError> {
        if !self.path.is_file() {
            return Err(self.disconnected("latest frame file does not exist".to_string()));
        }
        self.last_modified = None;
        self.last_len = 0;
        Ok(())
    }

    fn grab(&mut self) -> Result<Option<RgbImage>, SourceError> {
        let meta = std::fs::metadata(&self.path)
            .map_err(|e| self.disconnected(format!("latest frame file unavailable: {e}")))?;
        let modified = meta.modified().ok();
        let len = meta.len();
        if modified.is_some() && modified == self.last_modified && len == self.last_len {
            return Ok(None);
        }
        let image = decode_image_file(&self.name, &self.path)?;
        self.last_modified = modified;
        self.last_len = len;
        Ok(Some(image))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_changed_files_produce_images() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("camera_000_frame.png");
        RgbImage::from_pixel(4, 4, image::Rgb([1, 2, 3]))
            .save(&path)
            .unwrap();

        let mut grabber = WatchedFileGrabber::new(&path);
        grabber.open().unwrap();
        assert!(grabber.grab().unwrap().is_some());
        assert!(grabber.grab().unwrap().is_none());

        RgbImage::from_pixel(8, 8, image::Rgb([9, 9, 9]))
            .save(&path)
            .unwrap();
        let next = grabber.grab().unwrap().expect("changed file decodes");
        assert_eq!(next.dimensions(), (8, 8));

        std::fs::remove_file(&path).unwrap();
        assert!(matches!(
            grabber.grab(),
            Err(SourceError::Disconnected { .. })
        ));
    }

    #[test]
    fn open_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut grabber = WatchedFileGrabber::new(dir.path().join("missing.jpg"));
        assert!(grabber.open().is_err());
    }
}
