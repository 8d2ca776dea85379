//! Perceptual pixel comparison between two same-sized rasters
//!
//! Pixels are blended over white, converted to YIQ and compared with a
//! weighted colour delta. A pixel counts as a mismatch when its delta exceeds
//! `MAX_YIQ_DELTA * threshold^2`. Optionally, pixels that look like
//! anti-aliasing along an edge present in both images are drawn but not
//! counted.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::raster::RasterImage;

/// Largest possible YIQ delta between two colours.
const MAX_YIQ_DELTA: f64 = 35215.0;

const DIFF_COLOR: [u8; 3] = [255, 0, 0];
const AA_COLOR: [u8; 3] = [255, 255, 0];

/// Opacity of unchanged pixels in the diff image
const FADE_ALPHA: f64 = 0.1;

/// Options for perceptual comparison
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompareOptions {
    /// Matching threshold in [0, 1]; smaller is more sensitive
    pub threshold: f64,

    /// Exclude anti-aliased edge pixels from the mismatch count
    pub detect_antialiasing: bool,
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self {
            threshold: 0.2,
            detect_antialiasing: true,
        }
    }
}

/// Outcome of comparing a reference capture with a candidate capture
#[derive(Debug, Clone)]
pub struct ComparisonResult {
    pub reference: RasterImage,
    pub candidate: RasterImage,
    pub diff: RasterImage,
    pub mismatch: u64,
    /// `mismatch / (width * height)`
    pub score: f64,
}

impl ComparisonResult {
    /// Boundary-inclusive tolerance gate
    pub fn within(&self, tolerance: f64) -> bool {
        self.score <= tolerance
    }
}

/// Deterministic, side-effect free image comparator
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageComparator {
    options: CompareOptions,
}

impl ImageComparator {
    pub fn new(options: CompareOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &CompareOptions {
        &self.options
    }

    /// Compare `candidate` against `reference`.
    ///
    /// Differing dimensions are a precondition violation and never produce a
    /// score.
    pub fn compare(
        &self,
        reference: RasterImage,
        candidate: RasterImage,
    ) -> Result<ComparisonResult> {
        if reference.dimensions() != candidate.dimensions() {
            return Err(Error::DimensionMismatch {
                reference: reference.dimensions(),
                candidate: candidate.dimensions(),
            });
        }

        let (width, height) = reference.dimensions();
        let a = reference.as_raw();
        let b = candidate.as_raw();
        let mut out = vec![0u8; a.len()];
        let mut mismatch = 0u64;

        if a == b {
            for pos in (0..a.len()).step_by(4) {
                draw_gray_pixel(a, pos, &mut out);
            }
        } else {
            let max_delta = MAX_YIQ_DELTA * self.options.threshold * self.options.threshold;
            let (w, h) = (width as usize, height as usize);

            for y in 0..h {
                for x in 0..w {
                    let pos = (y * w + x) * 4;
                    let delta = color_delta(a, b, pos, pos, false);

                    if delta.abs() > max_delta {
                        if self.options.detect_antialiasing
                            && (antialiased(a, x, y, w, h, b) || antialiased(b, x, y, w, h, a))
                        {
                            draw_pixel(&mut out, pos, AA_COLOR);
                        } else {
                            draw_pixel(&mut out, pos, DIFF_COLOR);
                            mismatch += 1;
                        }
                    } else {
                        draw_gray_pixel(a, pos, &mut out);
                    }
                }
            }
        }

        let diff = RasterImage::from_rgba(width, height, out)?;
        let total = reference.pixel_count();
        let score = if total == 0 {
            0.0
        } else {
            mismatch as f64 / total as f64
        };

        debug!(
            "Compared {}x{} rasters: {} mismatched pixels (score {})",
            width, height, mismatch, score
        );

        Ok(ComparisonResult {
            reference,
            candidate,
            diff,
            mismatch,
            score,
        })
    }
}

fn rgb2y(r: f64, g: f64, b: f64) -> f64 {
    r * 0.298_895_31 + g * 0.586_622_47 + b * 0.114_482_23
}

fn rgb2i(r: f64, g: f64, b: f64) -> f64 {
    r * 0.595_977_99 - g * 0.274_176_10 - b * 0.321_801_89
}

fn rgb2q(r: f64, g: f64, b: f64) -> f64 {
    r * 0.211_470_17 - g * 0.522_617_11 + b * 0.311_146_94
}

/// Blend a channel value over white with opacity `alpha`
fn blend(c: f64, alpha: f64) -> f64 {
    255.0 + (c - 255.0) * alpha
}

fn rgb_over_white(img: &[u8], pos: usize) -> (f64, f64, f64) {
    let (r, g, b, a) = (
        f64::from(img[pos]),
        f64::from(img[pos + 1]),
        f64::from(img[pos + 2]),
        img[pos + 3],
    );
    if a < 255 {
        let alpha = f64::from(a) / 255.0;
        (blend(r, alpha), blend(g, alpha), blend(b, alpha))
    } else {
        (r, g, b)
    }
}

/// Signed perceptual delta between `img1[k]` and `img2[m]`.
///
/// With `y_only` set, only the brightness difference is returned.
fn color_delta(img1: &[u8], img2: &[u8], k: usize, m: usize, y_only: bool) -> f64 {
    if img1[k..k + 4] == img2[m..m + 4] {
        return 0.0;
    }

    let (r1, g1, b1) = rgb_over_white(img1, k);
    let (r2, g2, b2) = rgb_over_white(img2, m);

    let y1 = rgb2y(r1, g1, b1);
    let y2 = rgb2y(r2, g2, b2);
    let y = y1 - y2;

    if y_only {
        return y;
    }

    let i = rgb2i(r1, g1, b1) - rgb2i(r2, g2, b2);
    let q = rgb2q(r1, g1, b1) - rgb2q(r2, g2, b2);
    let delta = 0.5053 * y * y + 0.299 * i * i + 0.1957 * q * q;

    if y1 > y2 {
        -delta
    } else {
        delta
    }
}

fn neighbourhood(x: usize, y: usize, width: usize, height: usize) -> (usize, usize, usize, usize) {
    (
        x.saturating_sub(1),
        y.saturating_sub(1),
        (x + 1).min(width - 1),
        (y + 1).min(height - 1),
    )
}

/// Whether the pixel at (x1, y1) sits on an anti-aliased edge of `img`.
///
/// The pixel must have both a darker and a brighter neighbour, and one of
/// those extremes must lie inside a flat region in both images.
fn antialiased(img: &[u8], x1: usize, y1: usize, width: usize, height: usize, other: &[u8]) -> bool {
    let (x0, y0, x2, y2) = neighbourhood(x1, y1, width, height);
    let pos = (y1 * width + x1) * 4;

    let mut zeroes = usize::from(x1 == x0 || x1 == x2 || y1 == y0 || y1 == y2);
    let mut min = 0.0;
    let mut max = 0.0;
    let mut min_at = (0, 0);
    let mut max_at = (0, 0);

    for x in x0..=x2 {
        for y in y0..=y2 {
            if x == x1 && y == y1 {
                continue;
            }

            let delta = color_delta(img, img, pos, (y * width + x) * 4, true);
            if delta == 0.0 {
                zeroes += 1;
                if zeroes > 2 {
                    return false;
                }
            } else if delta < min {
                min = delta;
                min_at = (x, y);
            } else if delta > max {
                max = delta;
                max_at = (x, y);
            }
        }
    }

    if min == 0.0 || max == 0.0 {
        return false;
    }

    let flat_in_both = |(x, y): (usize, usize)| {
        has_many_siblings(img, x, y, width, height) && has_many_siblings(other, x, y, width, height)
    };
    flat_in_both(min_at) || flat_in_both(max_at)
}

/// More than two identical neighbours around (x1, y1)
fn has_many_siblings(img: &[u8], x1: usize, y1: usize, width: usize, height: usize) -> bool {
    let (x0, y0, x2, y2) = neighbourhood(x1, y1, width, height);
    let pos = (y1 * width + x1) * 4;

    let mut zeroes = usize::from(x1 == x0 || x1 == x2 || y1 == y0 || y1 == y2);
    for x in x0..=x2 {
        for y in y0..=y2 {
            if x == x1 && y == y1 {
                continue;
            }
            let pos2 = (y * width + x) * 4;
            if img[pos..pos + 4] == img[pos2..pos2 + 4] {
                zeroes += 1;
            }
            if zeroes > 2 {
                return true;
            }
        }
    }
    false
}

fn draw_pixel(out: &mut [u8], pos: usize, rgb: [u8; 3]) {
    out[pos..pos + 3].copy_from_slice(&rgb);
    out[pos + 3] = 255;
}

fn draw_gray_pixel(img: &[u8], pos: usize, out: &mut [u8]) {
    let (r, g, b) = (
        f64::from(img[pos]),
        f64::from(img[pos + 1]),
        f64::from(img[pos + 2]),
    );
    let alpha = FADE_ALPHA * f64::from(img[pos + 3]) / 255.0;
    let val = blend(rgb2y(r, g, b), alpha).round().clamp(0.0, 255.0) as u8;
    draw_pixel(out, pos, [val, val, val]);
}
