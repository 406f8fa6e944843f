//! RTC origin snapping and 16-bit quantization of positions, uvs and colours.

use glam::{DVec3, Mat3, Mat4, Vec2, Vec3};

const Q16: f64 = 65535.0;

/// Axis-aligned bounds of f64 triples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: DVec3,
    pub max: DVec3,
}

impl Aabb {
    pub const EMPTY: Aabb = Aabb {
        min: DVec3::splat(f64::INFINITY),
        max: DVec3::splat(f64::NEG_INFINITY),
    };

    /// Bounds of flat xyz triples.
    pub fn from_flat(positions: &[f64]) -> Self {
        positions.chunks_exact(3).fold(Self::EMPTY, |mut aabb, p| {
            aabb.include(DVec3::new(p[0], p[1], p[2]));
            aabb
        })
    }

    #[inline]
    pub fn include(&mut self, p: DVec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    pub fn center(&self) -> DVec3 {
        (self.min + self.max) * 0.5
    }

    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x
    }
}

/// Snaps `center` to the RTC grid so identical inputs share one origin.
pub fn snap_origin(center: DVec3, cell_size: f64) -> DVec3 {
    if cell_size <= 0.0 {
        return center;
    }
    (center / cell_size).round() * cell_size
}

/// Quantization step per axis; degenerate axes get a unit range.
fn ranges(min: DVec3, max: DVec3) -> DVec3 {
    let r = max - min;
    DVec3::new(
        if r.x > 0.0 { r.x } else { 1.0 },
        if r.y > 0.0 { r.y } else { 1.0 },
        if r.z > 0.0 { r.z } else { 1.0 },
    )
}

/// Decompression: `p = min + q / 65535 * (max - min)` as a column-major affine matrix.
pub fn positions_decompress_matrix(min: DVec3, max: DVec3) -> Mat4 {
    let scale = ranges(min, max) / Q16;
    Mat4::from_translation(min.as_vec3()) * Mat4::from_scale(scale.as_vec3())
}

/// Quantizes flat xyz (already origin-relative) into `[0, 65535]` over `[min, max]`.
pub fn quantize_positions(positions: &[f64], min: DVec3, max: DVec3) -> Vec<u16> {
    let range = ranges(min, max);
    let mut out = Vec::with_capacity(positions.len());

    for p in positions.chunks_exact(3) {
        for axis in 0..3 {
            let t = (p[axis] - min[axis]) / range[axis];
            out.push((t * Q16).round().clamp(0.0, Q16) as u16);
        }
    }

    out
}

/// Quantizes flat uv pairs to u16 and returns the 3x3 (homogeneous 2D) decompress matrix.
pub fn compress_uvs(uvs: &[f32]) -> (Vec<u16>, Mat3) {
    let (mut min, mut max) = (Vec2::splat(f32::INFINITY), Vec2::splat(f32::NEG_INFINITY));
    for uv in uvs.chunks_exact(2) {
        let v = Vec2::new(uv[0], uv[1]);
        min = min.min(v);
        max = max.max(v);
    }

    if uvs.is_empty() {
        min = Vec2::ZERO;
        max = Vec2::ONE;
    }

    let range = (max - min).max(Vec2::splat(f32::EPSILON));
    let mut out = Vec::with_capacity(uvs.len());
    for uv in uvs.chunks_exact(2) {
        for axis in 0..2 {
            let t = (uv[axis] - min[axis]) / range[axis];
            out.push((t * 65535.0).round().clamp(0.0, 65535.0) as u16);
        }
    }

    let scale = range / 65535.0;
    let matrix = Mat3::from_cols(
        Vec3::new(scale.x, 0.0, 0.0),
        Vec3::new(0.0, scale.y, 0.0),
        Vec3::new(min.x, min.y, 1.0),
    );

    (out, matrix)
}

/// Flat RGBA in `[0, 1]` to RGBA8.
pub fn compress_colors(colors: &[f32]) -> Vec<u8> {
    colors
        .iter()
        .map(|&c| (c.clamp(0.0, 1.0) * 255.0).round() as u8)
        .collect()
}
