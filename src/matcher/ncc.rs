use super::roi::{ClippedRoi, Roi};
use crate::frame::Frame;
use image::imageops::{self, FilterType};
use image::GrayImage;
use std::borrow::Cow;
use tracing::trace;

/// Variance below this is treated as a flat (textureless) patch
const FLAT_EPSILON: f64 = 1e-6;

/// Mean difference tolerated when comparing two flat patches
const FLAT_MEAN_TOLERANCE: f64 = 1.0;

/// Best zero-mean normalized cross-correlation of `reference` inside `roi`,
/// clamped to [0, 1].
///
/// Returns 0.0 for an empty frame, an absent reference, a region with no
/// area after clipping, or a reference that cannot be made to fit the region.
pub fn match_score(frame: &Frame, roi: Roi, reference: Option<&GrayImage>) -> f32 {
    if frame.is_empty() || reference.is_none() {
        return 0.0;
    }
    match_gray(&frame.to_gray(), roi, reference)
}

/// `match_score(...) >= threshold`
pub fn is_matched(frame: &Frame, roi: Roi, reference: Option<&GrayImage>, threshold: f32) -> bool {
    match_score(frame, roi, reference) >= threshold
}

/// Same as [`match_score`] on a frame that is already grayscale
pub fn match_gray(frame: &GrayImage, roi: Roi, reference: Option<&GrayImage>) -> f32 {
    let Some(reference) = reference else {
        return 0.0;
    };
    if frame.width() == 0 || frame.height() == 0 {
        return 0.0;
    }
    if reference.width() == 0 || reference.height() == 0 {
        return 0.0;
    }
    let Some(region) = roi.clip(frame.width(), frame.height()) else {
        return 0.0;
    };

    let Some(template) = fit_reference(reference, &region) else {
        trace!("Reference does not fit region {:?}", region);
        return 0.0;
    };

    let sub = imageops::crop_imm(frame, region.x, region.y, region.width, region.height).to_image();
    let score = best_correlation(&sub, &template);

    if score.is_finite() {
        score.clamp(0.0, 1.0) as f32
    } else {
        0.0
    }
}

/// Downscale the reference (keeping aspect ratio) when it is larger than the
/// region along either axis.
fn fit_reference<'a>(reference: &'a GrayImage, region: &ClippedRoi) -> Option<Cow<'a, GrayImage>> {
    let (rw, rh) = reference.dimensions();
    if rw <= region.width && rh <= region.height {
        return Some(Cow::Borrowed(reference));
    }

    let scale = f64::min(
        region.width as f64 / rw as f64,
        region.height as f64 / rh as f64,
    );
    let width = ((rw as f64 * scale).floor() as u32).max(1);
    let height = ((rh as f64 * scale).floor() as u32).max(1);

    if width > region.width || height > region.height {
        return None;
    }

    Some(Cow::Owned(imageops::resize(
        reference,
        width,
        height,
        FilterType::Triangle,
    )))
}

/// Summed-area table with one row/column of zero padding
struct Integral {
    stride: usize,
    sum: Vec<f64>,
    sum_sq: Vec<f64>,
}

impl Integral {
    fn new(image: &GrayImage) -> Self {
        let (w, h) = (image.width() as usize, image.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0.0; stride * (h + 1)];
        let mut sum_sq = vec![0.0; stride * (h + 1)];

        for y in 0..h {
            let mut row = 0.0;
            let mut row_sq = 0.0;
            for x in 0..w {
                let v = image.get_pixel(x as u32, y as u32).0[0] as f64;
                row += v;
                row_sq += v * v;
                let idx = (y + 1) * stride + (x + 1);
                sum[idx] = sum[idx - stride] + row;
                sum_sq[idx] = sum_sq[idx - stride] + row_sq;
            }
        }

        Self {
            stride,
            sum,
            sum_sq,
        }
    }

    /// (sum, sum of squares) over `[x, x + w) x [y, y + h)`
    fn window(&self, x: usize, y: usize, w: usize, h: usize) -> (f64, f64) {
        let s = self.stride;
        let a = y * s + x;
        let b = y * s + x + w;
        let c = (y + h) * s + x;
        let d = (y + h) * s + x + w;
        (
            self.sum[d] - self.sum[b] - self.sum[c] + self.sum[a],
            self.sum_sq[d] - self.sum_sq[b] - self.sum_sq[c] + self.sum_sq[a],
        )
    }
}

/// Maximum correlation coefficient over every placement of `template`
/// inside `image`. `template` must fit inside `image`.
fn best_correlation(image: &GrayImage, template: &GrayImage) -> f64 {
    let (iw, ih) = (image.width() as usize, image.height() as usize);
    let (tw, th) = (template.width() as usize, template.height() as usize);
    let n = (tw * th) as f64;

    let template_pixels: Vec<f64> = template.pixels().map(|p| p.0[0] as f64).collect();
    let template_mean = template_pixels.iter().sum::<f64>() / n;
    let centered: Vec<f64> = template_pixels.iter().map(|v| v - template_mean).collect();
    let template_var = centered.iter().map(|v| v * v).sum::<f64>();
    let template_flat = template_var <= FLAT_EPSILON * n;

    let image_pixels: Vec<f64> = image.pixels().map(|p| p.0[0] as f64).collect();
    let integral = Integral::new(image);

    let mut best = 0.0f64;
    for oy in 0..=(ih - th) {
        for ox in 0..=(iw - tw) {
            let (sum, sum_sq) = integral.window(ox, oy, tw, th);
            let window_var = (sum_sq - sum * sum / n).max(0.0);
            let window_flat = window_var <= FLAT_EPSILON * n;

            let score = if template_flat || window_flat {
                let same_mean = (sum / n - template_mean).abs() <= FLAT_MEAN_TOLERANCE;
                if template_flat && window_flat && same_mean {
                    1.0
                } else {
                    0.0
                }
            } else {
                let mut cross = 0.0;
                for ty in 0..th {
                    let row = (oy + ty) * iw + ox;
                    let trow = ty * tw;
                    for tx in 0..tw {
                        cross += centered[trow + tx] * image_pixels[row + tx];
                    }
                }
                cross / (template_var * window_var).sqrt()
            };

            if score > best {
                best = score;
                if best >= 1.0 {
                    return 1.0;
                }
            }
        }
    }

    best
}
