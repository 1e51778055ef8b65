//! Maps tessellation factors and patch levels to grid resolutions.
//!
//! The grid resolution is the vertex count per axis. The segment count (resolution - 1) is always
//! a multiple of [`ALIGNMENT`], so that the 8x8 compute workgroups cover the grid without partial
//! boundary groups.

use bevy::math::UVec2;

/// Workgroup edge length of the 2D compute stages.
pub const ALIGNMENT: u32 = 8;
/// Workgroup size of the 1D compute stages.
pub const LINEAR_WORKGROUP_SIZE: u32 = 64;
/// Upper bound for the vertex count per axis.
pub const MAX_RESOLUTION: u32 = 1024;
/// Segments generated per unit of tessellation factor.
pub const SEGMENTS_PER_FACTOR: i64 = 4;

const MAX_SEGMENTS: u32 = (MAX_RESOLUTION - 1) / ALIGNMENT * ALIGNMENT;

/// Calculates the square grid resolution for a tessellation factor.
///
/// Never fails, pathological inputs (negative, NaN, huge) are clamped into the valid range.
pub fn calculate_resolution(tessellation_factor: f32) -> UVec2 {
    let factor = if tessellation_factor.is_finite() {
        tessellation_factor.round() as i64
    } else if tessellation_factor == f32::INFINITY {
        i64::MAX / SEGMENTS_PER_FACTOR
    } else {
        0
    };

    let desired = factor.saturating_mul(SEGMENTS_PER_FACTOR).max(1);
    let desired = desired.clamp(ALIGNMENT as i64, (MAX_RESOLUTION - 1) as i64) as u32;

    let segments = desired.div_ceil(ALIGNMENT) * ALIGNMENT;
    let segments = segments.clamp(ALIGNMENT, MAX_SEGMENTS);

    let resolution = (segments + 1).min(MAX_RESOLUTION);

    UVec2::splat(resolution)
}

/// Number of vertices of a grid with the given resolution.
#[inline]
pub fn vertex_count(resolution: UVec2) -> u32 {
    resolution.x * resolution.y
}

/// Number of indices of a grid with the given resolution (two triangles per cell).
#[inline]
pub fn index_count(resolution: UVec2) -> u32 {
    resolution.x.saturating_sub(1) * resolution.y.saturating_sub(1) * 6
}

#[inline]
pub fn triangle_count(resolution: UVec2) -> u32 {
    index_count(resolution) / 3
}

/// Segments along each axis.
#[inline]
pub fn segments(resolution: UVec2) -> UVec2 {
    resolution.saturating_sub(UVec2::ONE)
}

/// A resolution is usable by the compute stages if it spans at least one cell.
#[inline]
pub fn is_valid_resolution(resolution: UVec2) -> bool {
    resolution.x >= 2 && resolution.y >= 2
}

/// Workgroup count for the 8x8 stages covering `size` invocations.
#[inline]
pub fn workgroups_2d(size: UVec2) -> UVec2 {
    UVec2::new(size.x.div_ceil(ALIGNMENT), size.y.div_ceil(ALIGNMENT))
}

/// Workgroup count for the 64 wide stages covering `count` invocations.
#[inline]
pub fn workgroups_1d(count: u32) -> u32 {
    count.div_ceil(LINEAR_WORKGROUP_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn resolution_is_aligned_and_bounded() {
        let mut rng = rand::rng();

        for _ in 0..10_000 {
            let factor = rng.random_range(0.0..2000.0);
            let resolution = calculate_resolution(factor);

            assert_eq!(resolution.x, resolution.y);
            assert!((9..=1025).contains(&resolution.x), "{factor} -> {resolution}");
            assert_eq!((resolution.x - 1) % ALIGNMENT, 0, "{factor} -> {resolution}");
        }
    }

    #[test]
    fn pathological_factors() {
        for factor in [-100.0, -0.4, 0.0, f32::NAN, f32::NEG_INFINITY] {
            assert_eq!(calculate_resolution(factor), UVec2::splat(9));
        }

        for factor in [255.0, 256.0, 1e9, f32::INFINITY] {
            assert_eq!(calculate_resolution(factor), UVec2::splat(MAX_SEGMENTS + 1));
        }
    }

    #[test]
    fn factor_sixteen() {
        // 16 * 4 = 64 segments, already aligned, plus one closing vertex
        assert_eq!(calculate_resolution(16.0), UVec2::splat(65));
        assert_eq!(vertex_count(UVec2::splat(65)), 65 * 65);
        assert_eq!(index_count(UVec2::splat(65)), 64 * 64 * 6);
    }

    #[test]
    fn factor_one_is_raised_to_alignment() {
        assert_eq!(calculate_resolution(1.0), UVec2::splat(9));
    }

    #[test]
    fn unaligned_factors_round_up() {
        // 3 * 4 = 12 -> 16 segments
        assert_eq!(calculate_resolution(3.0), UVec2::splat(17));
        // 2.6 rounds to 3
        assert_eq!(calculate_resolution(2.6), UVec2::splat(17));
        // 33 * 4 = 132 -> 136 segments
        assert_eq!(calculate_resolution(33.0), UVec2::splat(137));
    }

    #[test]
    fn dispatch_sizes() {
        assert_eq!(workgroups_2d(UVec2::splat(65)), UVec2::splat(9));
        assert_eq!(workgroups_2d(UVec2::splat(64)), UVec2::splat(8));
        assert_eq!(workgroups_1d(65 * 65), 67);
        assert_eq!(workgroups_1d(64), 1);
    }

    #[test]
    fn degenerate_resolutions() {
        assert!(!is_valid_resolution(UVec2::new(1, 9)));
        assert_eq!(index_count(UVec2::new(1, 9)), 0);
        assert!(is_valid_resolution(UVec2::splat(2)));
    }
}
