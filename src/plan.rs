//! The CPU half of mesh generation.
//!
//! A [`MeshPlan`] describes everything the compute stages need to generate one mesh or one patch.
//! Plans are pure functions of the settings, the transform and the camera. The render world turns
//! every plan whose [`GenerationKey`] changed into a GPU job.

use crate::{
    error::{TessellationError, TessellationResult},
    lod::{continuous_target, distance_to_camera, max_abs_scale, select_discrete_level},
    patch::{compute_patches, is_valid_window, EdgeCollapse, PatchInfo, ViewFrustum},
    resolution::{calculate_resolution, index_count, is_valid_resolution, vertex_count},
    settings::{LodMode, TessellationSettings},
};
use bevy::{math::Affine3A, prelude::*};

/// Identifies the contents of a generated buffer set.
///
/// Two plans with the same key generate identical geometry, so a slot only regenerates when its
/// key changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GenerationKey {
    /// Bumped whenever the settings or the texture contents change.
    pub revision: u64,
    pub level: i32,
    pub resolution: UVec2,
    pub edge_collapse: EdgeCollapse,
    window: [u32; 4],
}

/// The generation input of a single mesh or patch.
#[derive(Clone, Debug, PartialEq, Reflect)]
pub struct MeshPlan {
    /// The slot this plan generates into, the patch index in patch mode.
    pub index: u32,
    /// The effective tessellation factor.
    pub level: i32,
    pub resolution: UVec2,
    pub uv_offset: Vec2,
    pub uv_scale: Vec2,
    /// Local offset added to every vertex.
    pub patch_offset: Vec3,
    pub edge_collapse: EdgeCollapse,
    pub visible: bool,
}

impl MeshPlan {
    /// The plan of a single mesh covering the configured uv window.
    pub fn single(settings: &TessellationSettings, factor: i32) -> Self {
        Self {
            index: 0,
            level: factor,
            resolution: calculate_resolution(factor as f32),
            uv_offset: settings.uv_offset,
            uv_scale: settings.uv_scale,
            patch_offset: Vec3::ZERO,
            edge_collapse: EdgeCollapse::NONE,
            visible: true,
        }
    }

    /// The plan of a patch. Patches window the full plane and ignore the configured uv window.
    pub fn patch(patch: &PatchInfo) -> Self {
        Self {
            index: patch.index,
            level: patch.level,
            resolution: patch.resolution,
            uv_offset: patch.uv_offset,
            uv_scale: patch.uv_size,
            patch_offset: Vec3::ZERO,
            edge_collapse: patch.edge_collapse,
            visible: patch.visible && patch.valid,
        }
    }

    pub fn vertex_count(&self) -> u32 {
        vertex_count(self.resolution)
    }

    pub fn index_count(&self) -> u32 {
        index_count(self.resolution)
    }

    pub fn key(&self, revision: u64) -> GenerationKey {
        GenerationKey {
            revision,
            level: self.level,
            resolution: self.resolution,
            edge_collapse: self.edge_collapse,
            window: [
                self.uv_offset.x.to_bits(),
                self.uv_offset.y.to_bits(),
                self.uv_scale.x.to_bits(),
                self.uv_scale.y.to_bits(),
            ],
        }
    }

    /// Checks that the plan can be generated.
    pub fn validate(&self) -> TessellationResult<()> {
        if self.level <= 0 {
            return Err(TessellationError::InvalidLevel(self.level));
        }

        if !is_valid_resolution(self.resolution) {
            return Err(TessellationError::InvalidResolution(self.resolution));
        }

        if !is_valid_window(self.uv_offset, self.uv_scale) {
            return Err(TessellationError::InvalidPatchWindow {
                offset: self.uv_offset,
                size: self.uv_scale,
            });
        }

        let (vertices, indices) = (self.vertex_count(), self.index_count());
        if vertices == 0 || indices == 0 {
            return Err(TessellationError::EmptyMesh { vertices, indices });
        }

        Ok(())
    }
}

/// The unsmoothed factor the LOD mode selects for the camera, ignoring hysteresis.
pub fn target_factor(
    settings: &TessellationSettings,
    world_from_local: &Affine3A,
    camera: Vec3,
) -> i32 {
    let distance = || distance_to_camera(settings, world_from_local, camera);
    let max_scale = max_abs_scale(world_from_local);

    match settings.lod_mode {
        LodMode::Disabled | LodMode::SpatialPatches => settings.tessellation_factor,
        LodMode::DistanceContinuous | LodMode::DensityTexture => {
            continuous_target(settings, distance(), max_scale).round() as i32
        }
        LodMode::DistanceDiscrete => select_discrete_level(
            distance() / max_scale,
            &settings.discrete_levels,
            &settings.discrete_distances,
        )
        .unwrap_or(settings.tessellation_factor),
    }
}

/// Plans a single mesh for the camera.
pub fn generate_mesh_plan(
    settings: &TessellationSettings,
    world_from_local: &Affine3A,
    camera: Vec3,
) -> MeshPlan {
    MeshPlan::single(settings, target_factor(settings, world_from_local, camera))
}

/// Plans all patches of the plane for the camera.
pub fn generate_patch_plans(
    settings: &TessellationSettings,
    world_from_local: &Affine3A,
    camera: Vec3,
    frustum: Option<&dyn ViewFrustum>,
) -> Vec<MeshPlan> {
    compute_patches(settings, world_from_local, camera, frustum)
        .iter()
        .map(MeshPlan::patch)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::PatchLevel;

    #[test]
    fn single_plan_from_factor() {
        let settings = TessellationSettings::default();
        let plan = generate_mesh_plan(&settings, &Affine3A::IDENTITY, Vec3::new(0.0, 2000.0, 0.0));

        assert_eq!(plan.level, 16);
        assert_eq!(plan.resolution, UVec2::splat(65));
        assert_eq!(plan.vertex_count(), 65 * 65);
        assert_eq!(plan.index_count(), 64 * 64 * 6);
        assert_eq!(plan.validate(), Ok(()));
    }

    #[test]
    fn continuous_plan_follows_distance() {
        let settings = TessellationSettings {
            lod_mode: LodMode::DistanceContinuous,
            ..default()
        };

        let near = generate_mesh_plan(&settings, &Affine3A::IDENTITY, Vec3::new(0.0, 10.0, 0.0));
        let far = generate_mesh_plan(&settings, &Affine3A::IDENTITY, Vec3::new(0.0, 1e6, 0.0));

        assert_eq!(near.level, 64);
        assert_eq!(far.level, 8);
        assert_eq!(far.resolution, UVec2::splat(33));
    }

    #[test]
    fn invalid_plans() {
        let settings = TessellationSettings::default();

        let plan = MeshPlan::single(&settings, 0);
        assert_eq!(plan.validate(), Err(TessellationError::InvalidLevel(0)));

        let plan = MeshPlan {
            resolution: UVec2::new(1, 65),
            ..MeshPlan::single(&settings, 16)
        };
        assert_eq!(
            plan.validate(),
            Err(TessellationError::InvalidResolution(UVec2::new(1, 65)))
        );

        let plan = MeshPlan {
            uv_offset: Vec2::new(-0.5, 0.0),
            ..MeshPlan::single(&settings, 16)
        };
        assert!(matches!(
            plan.validate(),
            Err(TessellationError::InvalidPatchWindow { .. })
        ));
    }

    #[test]
    fn keys_track_generation_inputs() {
        let settings = TessellationSettings::default();
        let plan = MeshPlan::single(&settings, 16);

        assert_eq!(plan.key(3), plan.key(3));
        assert_ne!(plan.key(3), plan.key(4));
        assert_ne!(plan.key(3), MeshPlan::single(&settings, 32).key(3));

        // visibility does not change the generated geometry
        let hidden = MeshPlan {
            visible: false,
            ..plan.clone()
        };
        assert_eq!(hidden.key(3), plan.key(3));

        let collapsed = MeshPlan {
            edge_collapse: EdgeCollapse {
                east: 4,
                ..EdgeCollapse::NONE
            },
            ..plan.clone()
        };
        assert_ne!(collapsed.key(3), plan.key(3));
    }

    #[test]
    fn patch_plans_cover_the_grid() {
        let settings = TessellationSettings {
            lod_mode: LodMode::SpatialPatches,
            plane_size: Vec2::splat(4000.0),
            patch_count: UVec2::splat(2),
            patch_levels: vec![PatchLevel::Patch64, PatchLevel::Patch16],
            patch_distances: vec![2000.0, 5000.0],
            ..default()
        };

        let camera = Vec3::new(-1000.0, 50.0, -1000.0);
        let plans = generate_patch_plans(&settings, &Affine3A::IDENTITY, camera, None);

        assert_eq!(plans.len(), 4);
        assert!(plans.iter().all(|plan| plan.validate().is_ok()));
        assert_eq!(plans[0].level, 64);
        assert_eq!(plans[3].level, 16);
        assert_eq!(plans[3].uv_offset, Vec2::splat(0.5));
        assert_eq!(plans[3].uv_scale, Vec2::splat(0.5));

        // both neighbours of the nearest patch are at the same level
        assert!(plans[0].edge_collapse.is_none());
        // the far corner patch is the coarsest
        assert!(plans[3].edge_collapse.is_none());
        assert!(plans.iter().map(|plan| plan.index).eq(0..4));
    }
}
