//! Screen frame → representative LED color(s).

use image::{Rgba, RgbaImage};
use palette::{FromColor, Hsv, Srgb};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::ReduceError;
use crate::processing::resize::{PREVIEW_HEIGHT, PREVIEW_WIDTH, downsample};
use crate::protocol::{DeviceCommand, Rgb};

/// Width of one region band on the downsampled frame.
pub const BAND_WIDTH: u32 = 40;
/// Channels below this collapse the color to black.
pub const NEAR_BLACK: u8 = 10;

const MAX_ITERATIONS: usize = 10;
const CONVERGENCE_EPSILON: f64 = 1.0;
const ATTEMPTS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputMode {
    #[default]
    Static,
    Regional,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColorSample {
    Static(Rgb),
    /// Left-to-right band order.
    Regional(Vec<Rgb>),
}

impl ColorSample {
    pub fn to_command(&self) -> DeviceCommand {
        match self {
            Self::Static([r, g, b]) => DeviceCommand::SetStaticColor(*r, *g, *b),
            Self::Regional(colors) => DeviceCommand::SetRegionColors(colors.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReducerOptions {
    pub saturation_factor: f32,
    /// HSV value forced on every pixel, 0–255 scale.
    pub value: u8,
    pub output_mode: OutputMode,
}

impl Default for ReducerOptions {
    fn default() -> Self {
        Self {
            saturation_factor: 1.0,
            value: 128,
            output_mode: OutputMode::Static,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Reduction {
    pub sample: ColorSample,
    /// Downsampled frame with every reduced span painted in its centroid.
    pub preview: RgbaImage,
}

#[derive(Debug)]
pub struct ColorReducer {
    options: ReducerOptions,
    rng: StdRng,
}

impl ColorReducer {
    pub fn new(options: ReducerOptions, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self { options, rng }
    }

    pub fn set_output_mode(&mut self, mode: OutputMode) {
        self.options.output_mode = mode;
    }

    pub fn set_saturation_factor(&mut self, factor: f32) {
        self.options.saturation_factor = factor;
    }

    pub fn reduce(&mut self, frame: &RgbaImage) -> Result<Reduction, ReduceError> {
        let mut preview = downsample(frame, PREVIEW_WIDTH, PREVIEW_HEIGHT)?;
        saturate(&mut preview, self.options.saturation_factor);
        fix_value(&mut preview, self.options.value);

        let sample = match self.options.output_mode {
            OutputMode::Static => {
                let color = reduce_region(&mut preview, 0, PREVIEW_WIDTH, &mut self.rng)?;
                ColorSample::Static(color)
            }
            OutputMode::Regional => {
                let mut colors = Vec::with_capacity((PREVIEW_WIDTH / BAND_WIDTH) as usize);
                for start in (0..PREVIEW_WIDTH).step_by(BAND_WIDTH as usize) {
                    let end = (start + BAND_WIDTH).min(PREVIEW_WIDTH);
                    colors.push(reduce_region(&mut preview, start, end, &mut self.rng)?);
                }
                ColorSample::Regional(colors)
            }
        };
        Ok(Reduction { sample, preview })
    }
}

/// Multiplies HSV saturation by `factor`, clipped to the valid range.
pub fn saturate(frame: &mut RgbaImage, factor: f32) {
    if (factor - 1.0).abs() <= f32::EPSILON {
        return;
    }
    map_hsv(frame, |hsv| {
        hsv.saturation = (hsv.saturation * factor).clamp(0.0, 1.0);
    });
}

/// Forces the HSV value channel to `value` (0–255 scale).
pub fn fix_value(frame: &mut RgbaImage, value: u8) {
    let value = f32::from(value) / 255.0;
    map_hsv(frame, |hsv| hsv.value = value);
}

fn map_hsv(frame: &mut RgbaImage, mut adjust: impl FnMut(&mut Hsv)) {
    for pixel in frame.pixels_mut() {
        let [r, g, b, a] = pixel.0;
        let rgb: Srgb<f32> = Srgb::new(r, g, b).into_format();
        let mut hsv = Hsv::from_color(rgb);
        adjust(&mut hsv);
        let out: Srgb<u8> = Srgb::<f32>::from_color(hsv).into_format();
        *pixel = Rgba([out.red, out.green, out.blue, a]);
    }
}

/// Single-cluster k-means over columns `start..end`.
///
/// The span is overwritten with the centroid. Centroid channels are
/// truncated; if all three fall below [`NEAR_BLACK`] the result is black.
pub fn reduce_region<R: Rng + ?Sized>(
    frame: &mut RgbaImage,
    start: u32,
    end: u32,
    rng: &mut R,
) -> Result<Rgb, ReduceError> {
    let width = frame.width();
    if start >= end || end > width || frame.height() == 0 {
        return Err(ReduceError::ColumnRange { start, end, width });
    }

    let mut points = Vec::with_capacity(((end - start) * frame.height()) as usize);
    for y in 0..frame.height() {
        for x in start..end {
            let [r, g, b, _] = frame.get_pixel(x, y).0;
            points.push([f64::from(r), f64::from(g), f64::from(b)]);
        }
    }

    let center = best_center(&points, rng);
    let centroid = [center[0] as u8, center[1] as u8, center[2] as u8];

    for y in 0..frame.height() {
        for x in start..end {
            let alpha = frame.get_pixel(x, y)[3];
            frame.put_pixel(x, y, Rgba([centroid[0], centroid[1], centroid[2], alpha]));
        }
    }

    if centroid.iter().all(|channel| *channel < NEAR_BLACK) {
        Ok([0, 0, 0])
    } else {
        Ok(centroid)
    }
}

fn best_center<R: Rng + ?Sized>(points: &[[f64; 3]], rng: &mut R) -> [f64; 3] {
    let mut best: Option<([f64; 3], f64)> = None;
    for _ in 0..ATTEMPTS {
        let mut center = points[rng.random_range(0..points.len())];
        for _ in 0..MAX_ITERATIONS {
            let next = mean(points);
            let shift = distance_sq(&center, &next).sqrt();
            center = next;
            if shift < CONVERGENCE_EPSILON {
                break;
            }
        }
        let compactness: f64 = points.iter().map(|p| distance_sq(p, &center)).sum();
        if best.is_none_or(|(_, score)| compactness < score) {
            best = Some((center, compactness));
        }
    }
    best.map(|(center, _)| center).unwrap_or_default()
}

/// With a single cluster every point is assigned to it.
fn mean(points: &[[f64; 3]]) -> [f64; 3] {
    let mut sum = [0.0f64; 3];
    for point in points {
        for (acc, value) in sum.iter_mut().zip(point) {
            *acc += value;
        }
    }
    let n = points.len() as f64;
    [sum[0] / n, sum[1] / n, sum[2] / n]
}

fn distance_sq(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}
