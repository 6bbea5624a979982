use image::RgbaImage;
use tracing::debug;

use crate::error::CaptureError;

/// Source of full-screen snapshots. Called from the blocking pool.
pub trait ScreenSource: Send + 'static {
    fn capture(&mut self) -> Result<RgbaImage, CaptureError>;
}

/// Captures the primary monitor, or the first one when none is flagged.
#[derive(Debug, Default)]
pub struct PrimaryMonitor;

impl ScreenSource for PrimaryMonitor {
    fn capture(&mut self) -> Result<RgbaImage, CaptureError> {
        let monitors =
            xcap::Monitor::all().map_err(|err| CaptureError::Backend(err.to_string()))?;
        let count = monitors.len();
        let monitor = pick_primary(monitors, |m| m.is_primary()).ok_or(CaptureError::NoMonitor)?;
        debug!(monitors = count, "capturing monitor");

        let frame = monitor
            .capture_image()
            .map_err(|err| CaptureError::Backend(err.to_string()))?;
        if frame.width() == 0 || frame.height() == 0 {
            return Err(CaptureError::EmptyFrame);
        }
        Ok(frame)
    }
}

fn pick_primary<T>(candidates: Vec<T>, is_primary: impl Fn(&T) -> bool) -> Option<T> {
    let index = candidates.iter().position(is_primary).unwrap_or(0);
    candidates.into_iter().nth(index)
}

/// Replays a fixed frame on every capture.
#[derive(Debug, Clone)]
pub struct StillFrame(pub RgbaImage);

impl ScreenSource for StillFrame {
    fn capture(&mut self) -> Result<RgbaImage, CaptureError> {
        if self.0.width() == 0 || self.0.height() == 0 {
            return Err(CaptureError::EmptyFrame);
        }
        Ok(self.0.clone())
    }
}
