//! Face normalization shared by enrollment and runtime identification.
//!
//! Crop → CLAHE lighting normalization → eye-line rotation → canonical resize.
//! Embeddings are only comparable when both sides went through the same steps.

use crate::frame::Frame;
use crate::types::BoundingBox;

/// Eye centers `(left, right)` in frame coordinates.
pub type EyeCenters = ((f32, f32), (f32, f32));

#[derive(Debug, Clone)]
pub struct FacePreprocessor {
    /// Side length of the square output crop.
    pub canonical_size: u32,
    /// CLAHE grid is `tiles x tiles`.
    pub clahe_tiles: u32,
    /// CLAHE clip limit, in multiples of the mean histogram bin height.
    pub clahe_clip_limit: f32,
}

impl Default for FacePreprocessor {
    fn default() -> Self {
        Self {
            canonical_size: 150,
            clahe_tiles: 8,
            clahe_clip_limit: 2.0,
        }
    }
}

impl FacePreprocessor {
    /// Produce the canonical face crop for `face` in `frame`.
    ///
    /// Alignment is skipped when `eyes` is `None`. Returns `None` if the face
    /// region does not intersect the frame.
    pub fn prepare(&self, frame: &Frame, face: &BoundingBox, eyes: Option<EyeCenters>) -> Option<Frame> {
        let (x0, y0, _, _) = face.padded_pixels(0, frame.width, frame.height);
        let mut crop = frame.crop(face, 0)?;

        normalize_lighting(
            &mut crop.data,
            crop.width,
            crop.height,
            self.clahe_tiles,
            self.clahe_clip_limit,
        );

        if let Some(((lx, ly), (rx, ry))) = eyes {
            let (ox, oy) = (x0 as f32, y0 as f32);
            let aligned = align_by_eyes(
                &crop.data,
                crop.width,
                crop.height,
                (lx - ox, ly - oy),
                (rx - ox, ry - oy),
            );
            crop.data = aligned;
        }

        let size = self.canonical_size;
        let resized = resize_bilinear(&crop.data, crop.width, crop.height, size, size);
        Some(crop.with_pixels(resized, size, size))
    }
}

/// Contrast-limited adaptive histogram equalization, in place.
///
/// `clip_limit` follows the usual convention: a bin may hold at most
/// `clip_limit * tile_pixels / 256` counts before the excess is spread evenly.
pub fn normalize_lighting(gray: &mut [u8], width: u32, height: u32, tiles: u32, clip_limit: f32) {
    let (w, h) = (width as usize, height as usize);
    let n = tiles.max(1) as usize;
    if w < n || h < n || gray.len() < w * h {
        return;
    }
    let (tile_w, tile_h) = (w / n, h / n);
    let tile_pixels = (tile_w * tile_h) as f32;
    let clip = ((clip_limit * tile_pixels / 256.0).max(1.0)) as u32;

    let mut luts: Vec<[u8; 256]> = Vec::with_capacity(n * n);
    for row in 0..n {
        for col in 0..n {
            let mut hist = [0u32; 256];
            for y in row * tile_h..(row + 1) * tile_h {
                for x in col * tile_w..(col + 1) * tile_w {
                    hist[gray[y * w + x] as usize] += 1;
                }
            }

            let mut excess = 0u32;
            for bin in hist.iter_mut() {
                if *bin > clip {
                    excess += *bin - clip;
                    *bin = clip;
                }
            }
            let share = excess / 256;
            let rest = (excess % 256) as usize;
            for (i, bin) in hist.iter_mut().enumerate() {
                *bin += share + u32::from(i < rest);
            }

            let mut lut = [0u8; 256];
            let mut cdf = 0u32;
            for (i, bin) in hist.iter().enumerate() {
                cdf += bin;
                lut[i] = ((cdf as f32 / tile_pixels) * 255.0).round().clamp(0.0, 255.0) as u8;
            }
            luts.push(lut);
        }
    }

    // Bilinear blend between the four nearest tile centers.
    let last = (n - 1) as f32;
    for y in 0..h {
        let fy = (y as f32 / tile_h as f32 - 0.5).clamp(0.0, last);
        let r0 = fy as usize;
        let r1 = (r0 + 1).min(n - 1);
        let dy = fy - r0 as f32;
        for x in 0..w {
            let fx = (x as f32 / tile_w as f32 - 0.5).clamp(0.0, last);
            let c0 = fx as usize;
            let c1 = (c0 + 1).min(n - 1);
            let dx = fx - c0 as f32;

            let p = gray[y * w + x] as usize;
            let at = |r: usize, c: usize| luts[r * n + c][p] as f32;
            let top = at(r0, c0) * (1.0 - dx) + at(r0, c1) * dx;
            let bottom = at(r1, c0) * (1.0 - dx) + at(r1, c1) * dx;
            gray[y * w + x] = (top * (1.0 - dy) + bottom * dy).round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Rotate the image about the eye midpoint so the eye line becomes horizontal.
///
/// Output has the input's size; pixels sampled from outside are black.
pub fn align_by_eyes(gray: &[u8], width: u32, height: u32, left: (f32, f32), right: (f32, f32)) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let angle = (right.1 - left.1).atan2(right.0 - left.0);
    let (sin, cos) = angle.sin_cos();
    let (cx, cy) = ((left.0 + right.0) / 2.0, (left.1 + right.1) / 2.0);

    let mut out = vec![0u8; w * h];
    for oy in 0..h {
        for ox in 0..w {
            let (px, py) = (ox as f32 - cx, oy as f32 - cy);
            let sx = cos * px - sin * py + cx;
            let sy = sin * px + cos * py + cy;
            out[oy * w + ox] = sample_bilinear(gray, w, h, sx, sy);
        }
    }
    out
}

/// Bilinear resize of a grayscale buffer.
pub fn resize_bilinear(gray: &[u8], width: u32, height: u32, out_w: u32, out_h: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let (ow, oh) = (out_w as usize, out_h as usize);
    if w == 0 || h == 0 {
        return vec![0u8; ow * oh];
    }
    let sx = w as f32 / ow as f32;
    let sy = h as f32 / oh as f32;

    let mut out = vec![0u8; ow * oh];
    for y in 0..oh {
        let src_y = ((y as f32 + 0.5) * sy - 0.5).clamp(0.0, (h - 1) as f32);
        for x in 0..ow {
            let src_x = ((x as f32 + 0.5) * sx - 0.5).clamp(0.0, (w - 1) as f32);
            out[y * ow + x] = sample_bilinear(gray, w, h, src_x, src_y);
        }
    }
    out
}

fn sample_bilinear(gray: &[u8], w: usize, h: usize, x: f32, y: f32) -> u8 {
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let (fx, fy) = (x - x0 as f32, y - y0 as f32);

    let px = |xi: i64, yi: i64| -> f32 {
        if xi >= 0 && yi >= 0 && (xi as usize) < w && (yi as usize) < h {
            gray[yi as usize * w + xi as usize] as f32
        } else {
            0.0
        }
    };

    let v = px(x0, y0) * (1.0 - fx) * (1.0 - fy)
        + px(x0 + 1, y0) * fx * (1.0 - fy)
        + px(x0, y0 + 1) * (1.0 - fx) * fy
        + px(x0 + 1, y0 + 1) * fx * fy;
    v.round().clamp(0.0, 255.0) as u8
}
