//! Splits a plane into a grid of independently leveled patches.
//!
//! Every patch covers a rectangular window of the full plane uv space. Its tessellation level is
//! selected from the distance between the camera and the world space center of the patch. After
//! all levels are known, each patch computes the edge collapse factors towards its coarser
//! neighbours, which let the index stage drop border vertices so that adjacent patches share
//! exactly the same border vertices.

use crate::{
    lod::select_threshold,
    resolution::is_valid_resolution,
    settings::{PatchLevel, TessellationSettings, DEFAULT_PATCH_LEVEL},
};
use bevy::{
    math::{Affine3A, Vec3A},
    prelude::*,
    render::primitives::{Aabb, Frustum},
};
use itertools::iproduct;

/// Upper bound of a single edge collapse factor.
pub const MAX_EDGE_COLLAPSE: u32 = 64;

/// Anything a patch bounding box can be tested against.
pub trait ViewFrustum {
    /// Whether the axis aligned box around `center` is at least partially inside.
    fn intersects(&self, center: Vec3, half_extent: Vec3) -> bool;
}

impl ViewFrustum for Frustum {
    fn intersects(&self, center: Vec3, half_extent: Vec3) -> bool {
        let aabb = Aabb {
            center: center.into(),
            half_extents: half_extent.into(),
        };

        self.intersects_obb(&aabb, &Affine3A::IDENTITY, true, false)
    }
}

/// Number of border vertices skipped per retained vertex on each side of a patch.
///
/// A factor of one keeps every border vertex.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Reflect)]
pub struct EdgeCollapse {
    /// Towards the patch at `x - 1`.
    pub west: u32,
    /// Towards the patch at `x + 1`.
    pub east: u32,
    /// Towards the patch at `y - 1`.
    pub south: u32,
    /// Towards the patch at `y + 1`.
    pub north: u32,
}

impl EdgeCollapse {
    pub const NONE: Self = Self {
        west: 1,
        east: 1,
        south: 1,
        north: 1,
    };

    pub fn as_uvec4(self) -> UVec4 {
        UVec4::new(self.west, self.east, self.south, self.north)
    }

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl Default for EdgeCollapse {
    fn default() -> Self {
        Self::NONE
    }
}

/// The derived state of a single patch.
///
/// Patches are always computed as a batch for the whole grid, since the edge collapse factors
/// depend on the neighbours.
#[derive(Clone, Debug, PartialEq, Reflect)]
pub struct PatchInfo {
    /// Position of the patch inside the patch grid.
    pub coordinate: UVec2,
    /// `coordinate.y * count.x + coordinate.x`
    pub index: u32,
    /// Start of the patch window inside the plane uv space.
    pub uv_offset: Vec2,
    /// Extent of the patch window inside the plane uv space.
    pub uv_size: Vec2,
    pub local_center: Vec3,
    /// Half extent of the local bounds, including the whole displacement range.
    pub local_half_extent: Vec3,
    pub world_center: Vec3,
    pub world_min: Vec3,
    pub world_max: Vec3,
    /// Distance between the camera and the world center.
    pub distance: f32,
    /// The tessellation factor of the patch.
    pub level: i32,
    pub resolution: UVec2,
    pub visible: bool,
    pub valid: bool,
    pub edge_collapse: EdgeCollapse,
}

impl PatchInfo {
    pub fn world_half_extent(&self) -> Vec3 {
        (self.world_max - self.world_min) / 2.0
    }

    /// The world bounds center, identical to [`Self::world_center`] for affine transforms.
    pub fn world_bounds_center(&self) -> Vec3 {
        (self.world_max + self.world_min) / 2.0
    }

    fn invalidate(&mut self) {
        self.valid = false;
        self.visible = false;
    }
}

/// Computes the patches of the plane, including levels, visibility and edge collapse factors.
pub fn compute_patches(
    settings: &TessellationSettings,
    world_from_local: &Affine3A,
    camera: Vec3,
    frustum: Option<&dyn ViewFrustum>,
) -> Vec<PatchInfo> {
    let count = settings.patch_count.max(UVec2::ONE);

    let mut patches = iproduct!(0..count.y, 0..count.x)
        .map(|(y, x)| {
            let mut patch = patch_bounds(settings, world_from_local, UVec2::new(x, y), count);

            patch.distance = camera.distance(patch.world_center);
            patch.level = select_patch_level(
                patch.distance,
                &settings.patch_levels,
                &settings.patch_distances,
            )
            .factor() as i32;
            patch.resolution = patch.level_resolution();

            patch.visible = match frustum {
                Some(frustum) if settings.patch_culling => {
                    frustum.intersects(patch.world_bounds_center(), patch.world_half_extent())
                }
                _ => true,
            };

            if !patch.is_generatable() {
                patch.invalidate();
            }

            patch
        })
        .collect::<Vec<_>>();

    compute_edge_collapse(&mut patches, count);

    patches
}

impl PatchInfo {
    fn level_resolution(&self) -> UVec2 {
        if self.level <= 0 {
            UVec2::ZERO
        } else {
            crate::resolution::calculate_resolution(self.level as f32)
        }
    }

    /// Whether the level, resolution and uv window allow generating geometry.
    pub fn is_generatable(&self) -> bool {
        self.level > 0
            && is_valid_resolution(self.resolution)
            && is_valid_window(self.uv_offset, self.uv_size)
    }
}

/// Selects the level of a patch at the given distance from the ordered thresholds.
pub fn select_patch_level(distance: f32, levels: &[PatchLevel], distances: &[f32]) -> PatchLevel {
    select_threshold(distance, levels, distances).unwrap_or(DEFAULT_PATCH_LEVEL)
}

/// Whether a uv window lies inside the unit square, with a non empty extent.
pub fn is_valid_window(offset: Vec2, size: Vec2) -> bool {
    offset.cmpge(Vec2::ZERO).all()
        && offset.cmple(Vec2::ONE).all()
        && size.cmpgt(Vec2::ZERO).all()
        && size.cmple(Vec2::ONE).all()
}

/// Computes the uv window and local and world bounds of a patch.
///
/// The height of the bounds covers the full displacement range, so that the bounds stay
/// conservative for positive and negative offsets.
pub fn patch_bounds(
    settings: &TessellationSettings,
    world_from_local: &Affine3A,
    coordinate: UVec2,
    count: UVec2,
) -> PatchInfo {
    let count_f = count.as_vec2();
    let uv_offset = coordinate.as_vec2() / count_f;
    let uv_size = Vec2::ONE / count_f;

    let patch_size = uv_size * settings.plane_size;
    let local_min = (uv_offset - 0.5) * settings.plane_size;
    let planar_center = local_min + patch_size / 2.0;

    let intensity = settings.displacement_intensity;
    let offset = settings.displacement_offset;

    let local_center = Vec3::new(planar_center.x, offset + intensity / 2.0, planar_center.y);
    let local_half_extent = Vec3::new(
        patch_size.x / 2.0,
        (intensity.abs() + offset.max(0.0) + offset.min(0.0).abs()) / 2.0,
        patch_size.y / 2.0,
    );

    let (world_min, world_max) = transformed_bounds(world_from_local, local_center, local_half_extent);

    PatchInfo {
        coordinate,
        index: coordinate.y * count.x + coordinate.x,
        uv_offset,
        uv_size,
        local_center,
        local_half_extent,
        world_center: world_from_local.transform_point3(local_center),
        world_min,
        world_max,
        distance: 0.0,
        level: 0,
        resolution: UVec2::ZERO,
        visible: true,
        valid: true,
        edge_collapse: EdgeCollapse::NONE,
    }
}

/// World space bounds of a local box, computed from all eight corners.
pub fn transformed_bounds(
    world_from_local: &Affine3A,
    center: Vec3,
    half_extent: Vec3,
) -> (Vec3, Vec3) {
    let corners = iproduct!([-1.0, 1.0], [-1.0, 1.0], [-1.0, 1.0])
        .map(|(x, y, z)| center + half_extent * Vec3::new(x, y, z))
        .map(|corner| world_from_local.transform_point3a(Vec3A::from(corner)));

    let (min, max) = corners.fold(
        (Vec3A::splat(f32::MAX), Vec3A::splat(f32::MIN)),
        |(min, max), corner| (min.min(corner), max.max(corner)),
    );

    (min.into(), max.into())
}

/// Computes the edge collapse factors of all patches.
///
/// A patch only collapses towards strictly coarser neighbours. The finer side of each border
/// collapses, the coarser side keeps all of its vertices.
pub fn compute_edge_collapse(patches: &mut [PatchInfo], count: UVec2) {
    let neighbour = |patches: &[PatchInfo], x: i64, y: i64| -> Option<(i32, UVec2)> {
        if x < 0 || y < 0 || x >= count.x as i64 || y >= count.y as i64 {
            return None;
        }

        let patch = patches.get((y * count.x as i64 + x) as usize)?;
        patch.valid.then_some((patch.level, patch.resolution))
    };

    let collapse = iproduct!(0..count.y, 0..count.x)
        .map(|(y, x)| {
            let index = (y * count.x + x) as usize;
            let Some(patch) = patches.get(index) else {
                return EdgeCollapse::NONE;
            };

            if !patch.valid {
                return EdgeCollapse::NONE;
            }

            let (x, y) = (x as i64, y as i64);
            let level = patch.level;
            let resolution = patch.resolution;

            EdgeCollapse {
                west: collapse_factor(level, resolution.y, neighbour(patches, x - 1, y), |r| r.y),
                east: collapse_factor(level, resolution.y, neighbour(patches, x + 1, y), |r| r.y),
                south: collapse_factor(level, resolution.x, neighbour(patches, x, y - 1), |r| r.x),
                north: collapse_factor(level, resolution.x, neighbour(patches, x, y + 1), |r| r.x),
            }
        })
        .collect::<Vec<_>>();

    for (patch, collapse) in patches.iter_mut().zip(collapse) {
        patch.edge_collapse = collapse;
    }
}

fn collapse_factor(
    level: i32,
    resolution: u32,
    neighbour: Option<(i32, UVec2)>,
    axis: impl Fn(UVec2) -> u32,
) -> u32 {
    let Some((neighbour_level, neighbour_resolution)) = neighbour else {
        return 1;
    };

    let neighbour_resolution = axis(neighbour_resolution);

    if resolution < 2 || neighbour_resolution < 2 || neighbour_level >= level {
        return 1;
    }

    let segments = resolution - 1;
    let neighbour_segments = neighbour_resolution - 1;

    if segments <= neighbour_segments {
        return 1;
    }

    (segments / neighbour_segments).clamp(1, MAX_EDGE_COLLAPSE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{collapse_vertex, grid_indices, vertex_position, vertex_uv};
    use bevy::math::Mat4;

    fn patch_settings() -> TessellationSettings {
        TessellationSettings {
            plane_size: Vec2::splat(4000.0),
            patch_count: UVec2::splat(2),
            patch_levels: vec![PatchLevel::Patch64, PatchLevel::Patch16],
            patch_distances: vec![2000.0, 5000.0],
            ..default()
        }
    }

    struct PositiveX;

    impl ViewFrustum for PositiveX {
        fn intersects(&self, center: Vec3, half_extent: Vec3) -> bool {
            center.x + half_extent.x > 0.0
        }
    }

    #[test]
    fn patch_windows_and_indices() {
        let settings = TessellationSettings {
            patch_count: UVec2::new(4, 2),
            ..patch_settings()
        };
        let patches = compute_patches(&settings, &Affine3A::IDENTITY, Vec3::ZERO, None);

        assert_eq!(patches.len(), 8);

        let patch = &patches[6];
        assert_eq!(patch.coordinate, UVec2::new(2, 1));
        assert_eq!(patch.index, 6);
        assert_eq!(patch.uv_offset, Vec2::new(0.5, 0.5));
        assert_eq!(patch.uv_size, Vec2::new(0.25, 0.5));
        assert_eq!(patch.local_center, Vec3::new(500.0, 50.0, 1000.0));
        assert_eq!(patch.local_half_extent, Vec3::new(500.0, 50.0, 1000.0));
    }

    #[test]
    fn bounds_cover_negative_offsets() {
        let settings = TessellationSettings {
            displacement_intensity: 100.0,
            displacement_offset: -40.0,
            ..patch_settings()
        };
        let patch = patch_bounds(&settings, &Affine3A::IDENTITY, UVec2::ZERO, UVec2::ONE);

        assert_eq!(patch.local_center.y, 10.0);
        assert_eq!(patch.local_half_extent.y, 70.0);
    }

    #[test]
    fn bounds_follow_rotation_and_scale() {
        let settings = patch_settings();
        let transform = Affine3A::from_scale_rotation_translation(
            Vec3::new(2.0, 1.0, 1.0),
            Quat::from_rotation_y(std::f32::consts::FRAC_PI_2),
            Vec3::new(0.0, 0.0, 100.0),
        );

        let patches = compute_patches(&settings, &transform, Vec3::ZERO, None);

        for patch in &patches {
            let center = patch.world_bounds_center();
            assert!(center.distance(patch.world_center) < 1e-2);

            // the scaled x extent is rotated onto the z axis
            let half = patch.world_half_extent();
            assert!((half.z - 2000.0).abs() < 1e-2);
            assert!((half.x - 1000.0).abs() < 1e-2);
        }
    }

    #[test]
    fn levels_use_patch_center_distance() {
        let settings = patch_settings();
        // the 2x2 grid has patch centers at (+-1000, 50, +-1000)
        let camera = Vec3::new(-1000.0, 50.0, -1000.0);
        let patches = compute_patches(&settings, &Affine3A::IDENTITY, camera, None);

        assert_eq!(patches[0].distance, 0.0);
        assert_eq!(patches[0].level, 64);
        // 2000 away, the first threshold is inclusive
        assert_eq!(patches[1].distance, 2000.0);
        assert_eq!(patches[1].level, 64);
        // about 2828 away, beyond 2000 and within 5000
        assert!((patches[3].distance - 2828.427).abs() < 1e-2);
        assert_eq!(patches[3].level, 16);
    }

    #[test]
    fn level_of_patch_at_three_thousand() {
        let settings = patch_settings();
        let camera = Vec3::new(1000.0, 50.0, 4000.0);
        let patches = compute_patches(&settings, &Affine3A::IDENTITY, camera, None);

        // the patch center at (1000, 50, 1000) is exactly 3000 away
        assert_eq!(patches[3].distance, 3000.0);
        assert_eq!(patches[3].level, 16);
        assert_eq!(patches[3].resolution, UVec2::splat(65));
    }

    #[test]
    fn empty_levels_fall_back() {
        let settings = TessellationSettings {
            patch_levels: Vec::new(),
            ..patch_settings()
        };
        let patches = compute_patches(&settings, &Affine3A::IDENTITY, Vec3::ZERO, None);

        assert!(patches.iter().all(|patch| patch.level == 16));
    }

    #[test]
    fn culling() {
        let settings = patch_settings();
        let frustum = PositiveX;
        let patches = compute_patches(&settings, &Affine3A::IDENTITY, Vec3::ZERO, Some(&frustum));

        assert!(!patches[0].visible);
        assert!(patches[1].visible);
        assert!(!patches[2].visible);
        assert!(patches[3].visible);
        assert!(patches.iter().all(|patch| patch.valid));

        let unculled = TessellationSettings {
            patch_culling: false,
            ..patch_settings()
        };
        let patches = compute_patches(&unculled, &Affine3A::IDENTITY, Vec3::ZERO, Some(&frustum));
        assert!(patches.iter().all(|patch| patch.visible));
    }

    #[test]
    fn culling_with_camera_frustum() {
        let settings = TessellationSettings {
            patch_count: UVec2::ONE,
            plane_size: Vec2::splat(200.0),
            ..patch_settings()
        };

        let clip_from_view = Mat4::perspective_infinite_reverse_rh(1.0, 1.0, 0.1);
        let frustum = Frustum::from_clip_from_world(&clip_from_view);

        let ahead = Affine3A::from_translation(Vec3::new(0.0, 0.0, -5000.0));
        let patches = compute_patches(&settings, &ahead, Vec3::ZERO, Some(&frustum));
        assert!(patches[0].visible);

        let behind = Affine3A::from_translation(Vec3::new(0.0, 0.0, 5000.0));
        let patches = compute_patches(&settings, &behind, Vec3::ZERO, Some(&frustum));
        assert!(!patches[0].visible);
    }

    fn collapse_pair(levels: [i32; 2]) -> Vec<PatchInfo> {
        let settings = TessellationSettings {
            patch_count: UVec2::new(2, 1),
            ..patch_settings()
        };

        let mut patches = (0..2)
            .map(|x| {
                let mut patch = patch_bounds(
                    &settings,
                    &Affine3A::IDENTITY,
                    UVec2::new(x, 0),
                    UVec2::new(2, 1),
                );
                patch.level = levels[x as usize];
                patch.resolution = patch.level_resolution();
                patch
            })
            .collect::<Vec<_>>();

        compute_edge_collapse(&mut patches, UVec2::new(2, 1));
        patches
    }

    #[test]
    fn finer_patch_collapses_towards_coarser() {
        let patches = collapse_pair([64, 16]);

        // 256 segments against 64 segments
        assert_eq!(patches[0].edge_collapse.east, 4);
        assert_eq!(patches[0].edge_collapse.west, 1);
        assert_eq!(patches[0].edge_collapse.north, 1);
        assert_eq!(patches[1].edge_collapse, EdgeCollapse::NONE);
    }

    #[test]
    fn equal_levels_do_not_collapse() {
        let patches = collapse_pair([32, 32]);

        assert!(patches.iter().all(|patch| patch.edge_collapse.is_none()));
    }

    #[test]
    fn invalid_neighbours_do_not_collapse() {
        let settings = TessellationSettings {
            patch_count: UVec2::new(2, 1),
            ..patch_settings()
        };

        let mut patches = collapse_pair([64, 16]);
        patches[1].level = 0;
        patches[1].resolution = patches[1].level_resolution();
        assert!(!patches[1].is_generatable());
        patches[1].invalidate();

        compute_edge_collapse(&mut patches, settings.patch_count);

        assert!(patches[0].valid);
        assert_eq!(patches[0].edge_collapse, EdgeCollapse::NONE);
        assert!(!patches[1].visible);
    }

    #[test]
    fn collapse_is_clamped() {
        let factor = collapse_factor(
            4096,
            4097,
            Some((1, UVec2::splat(2))),
            |resolution| resolution.x,
        );

        assert_eq!(factor, MAX_EDGE_COLLAPSE);
    }

    #[test]
    fn collapsed_seam_has_no_cracks() {
        let settings = TessellationSettings {
            patch_count: UVec2::new(2, 1),
            ..patch_settings()
        };
        let patches = collapse_pair([64, 16]);
        let (fine, coarse) = (&patches[0], &patches[1]);

        let world = |patch: &PatchInfo, coordinate: UVec2| {
            let uv = vertex_uv(patch.resolution, coordinate, patch.uv_offset, patch.uv_size);
            vertex_position(uv, settings.plane_size, Vec3::ZERO)
        };

        let coarse_border = (0..coarse.resolution.y)
            .map(|y| world(coarse, UVec2::new(0, y)))
            .collect::<Vec<_>>();

        let east = fine.resolution.x - 1;
        let indices = grid_indices(fine.resolution, fine.edge_collapse);

        let mut border_vertices = 0;

        for index in indices {
            let coordinate = UVec2::new(index % fine.resolution.x, index / fine.resolution.x);

            if coordinate.x != east {
                continue;
            }

            border_vertices += 1;

            let position = world(fine, coordinate);
            assert!(
                coarse_border.contains(&position),
                "border vertex {coordinate} at {position} is not shared"
            );
        }

        assert!(border_vertices > 0);

        // every coarse border vertex is matched by a retained fine vertex
        for y in 0..coarse.resolution.y {
            let coordinate = collapse_vertex(
                UVec2::new(east, y * fine.edge_collapse.east),
                fine.resolution,
                fine.edge_collapse,
            );
            assert_eq!(world(fine, coordinate), coarse_border[y as usize]);
        }
    }
}
