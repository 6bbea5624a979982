use fast_image_resize as fir;
use image::RgbaImage;

use crate::error::ReduceError;

/// Resolution every frame is reduced at before clustering.
pub const PREVIEW_WIDTH: u32 = 640;
pub const PREVIEW_HEIGHT: u32 = 360;

/// Bilinear resize to exactly `width`×`height`; aspect ratio is not kept.
pub fn downsample(frame: &RgbaImage, width: u32, height: u32) -> Result<RgbaImage, ReduceError> {
    if frame.width() == 0 || frame.height() == 0 {
        return Err(ReduceError::EmptyFrame);
    }
    if frame.dimensions() == (width, height) {
        return Ok(frame.clone());
    }

    let src_view = fir::images::ImageRef::new(
        frame.width(),
        frame.height(),
        frame.as_raw(),
        fir::PixelType::U8x4,
    )
    .map_err(|err| ReduceError::Resize(err.to_string()))?;
    let mut dst_image = fir::images::Image::new(width, height, fir::PixelType::U8x4);
    let options = fir::ResizeOptions::new()
        .resize_alg(fir::ResizeAlg::Convolution(fir::FilterType::Bilinear))
        .use_alpha(false);
    let mut resizer = fir::Resizer::new();
    resizer
        .resize(&src_view, &mut dst_image, Some(&options))
        .map_err(|err| ReduceError::Resize(err.to_string()))?;

    RgbaImage::from_raw(width, height, dst_image.into_vec())
        .ok_or_else(|| ReduceError::Resize("resized buffer has the wrong length".into()))
}
