use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use image::RgbaImage;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::events::StatusSnapshot;

/// Minimum spacing between two preview writes.
const PREVIEW_WRITE_SPACING: Duration = Duration::from_secs(1);
const ACTIVITY_REPORT_PERIOD: Duration = Duration::from_secs(30);

/// Presentation side of the runtime: notifications, TX activity and the
/// palette preview file.
#[instrument(name = "status", skip_all)]
pub async fn run(
    mut status_rx: watch::Receiver<StatusSnapshot>,
    mut preview_rx: watch::Receiver<Option<Arc<RgbaImage>>>,
    mut activity_rx: watch::Receiver<u64>,
    preview_path: Option<PathBuf>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut last = status_rx.borrow_and_update().clone();
    let mut last_preview_write: Option<Instant> = None;
    let mut report = tokio::time::interval(ACTIVITY_REPORT_PERIOD);
    report.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut reported_frames = *activity_rx.borrow_and_update();
    let mut status_open = true;
    let mut preview_open = true;
    let mut activity_open = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = status_rx.changed(), if status_open => {
                if changed.is_err() {
                    status_open = false;
                    continue;
                }
                let current = status_rx.borrow_and_update().clone();
                log_transition(&last, &current);
                last = current;
            }
            changed = preview_rx.changed(), if preview_open => {
                if changed.is_err() {
                    preview_open = false;
                    continue;
                }
                let preview = preview_rx.borrow_and_update().clone();
                let (Some(path), Some(preview)) = (preview_path.as_ref(), preview) else {
                    continue;
                };
                if last_preview_write.is_some_and(|at| at.elapsed() < PREVIEW_WRITE_SPACING) {
                    continue;
                }
                last_preview_write = Some(Instant::now());
                let path = path.clone();
                let written = tokio::task::spawn_blocking(move || write_preview(&path, &preview)).await;
                match written {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => warn!("{err:#}"),
                    Err(err) => warn!("preview writer failed: {err}"),
                }
            }
            changed = activity_rx.changed(), if activity_open => {
                if changed.is_err() {
                    activity_open = false;
                }
            }
            _ = report.tick() => {
                let frames = *activity_rx.borrow();
                if frames != reported_frames {
                    debug!(frames = frames.wrapping_sub(reported_frames), "frames sent to controller");
                    reported_frames = frames;
                }
            }
        }
    }
    Ok(())
}

fn log_transition(previous: &StatusSnapshot, current: &StatusSnapshot) {
    if previous.status != current.status && !current.status.is_empty() {
        info!(state = ?current.state, "{}", current.status);
    }
    if previous.indicator != current.indicator {
        info!(indicator = ?current.indicator, mode = ?current.detection_mode, "detection indicator changed");
    }
    if previous.attached_window != current.attached_window {
        if let Some(title) = current.attached_window.as_deref() {
            info!(window = title, "attached to fullscreen window");
        }
    }
    if previous.peer != current.peer {
        if let Some(peer) = current.peer.as_deref() {
            info!(peer, "streaming to controller");
        }
    }
    if previous.sunrise != current.sunrise || previous.sunset != current.sunset {
        info!(sunrise = %current.sunrise, sunset = %current.sunset, timezone = %current.timezone, "sun window updated");
    }
}

/// Writes the palette preview as PNG, replacing the previous file atomically.
pub fn write_preview(path: &Path, preview: &RgbaImage) -> Result<()> {
    let staging = path.with_extension("png.tmp");
    preview
        .save_with_format(&staging, image::ImageFormat::Png)
        .with_context(|| format!("failed to write preview to {}", staging.display()))?;
    std::fs::rename(&staging, path)
        .with_context(|| format!("failed to move preview into {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;
    use tempfile::tempdir;

    #[test]
    fn preview_is_written_as_png() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("palette.png");
        let preview = RgbaImage::from_pixel(640, 360, Rgba([12, 34, 56, 255]));

        write_preview(&path, &preview).unwrap();

        let decoded = image::open(&path).unwrap().to_rgba8();
        assert_eq!(decoded.dimensions(), (640, 360));
        assert_eq!(decoded.get_pixel(10, 10).0, [12, 34, 56, 255]);
        assert!(!path.with_extension("png.tmp").exists());
    }
}
