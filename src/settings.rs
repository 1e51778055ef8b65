use crate::{error::ConfigIssue, resolution::calculate_resolution};
use anyhow::Result;
use bevy::prelude::*;
use serde::{Deserialize, Serialize};

/// Fallback level for patches when no patch levels are configured.
pub const DEFAULT_PATCH_LEVEL: PatchLevel = PatchLevel::Patch16;
/// Margin applied when the configured LOD distances are inverted.
pub const DISTANCE_MARGIN: f32 = 1000.0;
/// Largest supported patch grid edge.
pub const MAX_PATCH_COUNT: u32 = 32;
/// Largest supported continuous tessellation factor.
pub const MAX_LOD_FACTOR: i32 = 256;

/// Selects how the tessellation factor follows the camera.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Reflect)]
pub enum LodMode {
    /// Always use [`TessellationSettings::tessellation_factor`].
    #[default]
    Disabled,
    /// Smoothly interpolate the factor between the configured distances.
    DistanceContinuous,
    /// Pick the factor from an ordered list of distance thresholds.
    DistanceDiscrete,
    /// Split the plane into independently leveled patches.
    SpatialPatches,
    /// Density texture driven LOD. Sampling the density is not supported yet, this mode evaluates
    /// like [`LodMode::DistanceContinuous`].
    DensityTexture,
}

impl LodMode {
    pub fn is_enabled(self) -> bool {
        self != LodMode::Disabled
    }
}

/// Normal calculation method of the normal stage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Reflect)]
pub enum NormalMethod {
    /// Skip the normal stage and keep the flat normals of the vertex stage.
    Disabled,
    /// Central differences of the displacement source.
    #[default]
    FiniteDifference,
    /// Cross product of the adjacent displaced grid edges.
    GeometryBased,
    /// Blend of finite differences and geometry normals by the smoothing factor.
    Hybrid,
    /// Read the normals from the normal map.
    FromNormalMap,
}

impl NormalMethod {
    pub(crate) fn shader_index(self) -> u32 {
        match self {
            NormalMethod::Disabled => 0,
            NormalMethod::FiniteDifference => 1,
            NormalMethod::GeometryBased => 2,
            NormalMethod::Hybrid => 3,
            NormalMethod::FromNormalMap => 4,
        }
    }
}

/// Tessellation level of a single patch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Reflect)]
pub enum PatchLevel {
    Patch4,
    Patch8,
    #[default]
    Patch16,
    Patch32,
    Patch64,
    Patch128,
}

impl PatchLevel {
    /// The tessellation factor of this level.
    pub fn factor(self) -> u32 {
        match self {
            PatchLevel::Patch4 => 4,
            PatchLevel::Patch8 => 8,
            PatchLevel::Patch16 => 16,
            PatchLevel::Patch32 => 32,
            PatchLevel::Patch64 => 64,
            PatchLevel::Patch128 => 128,
        }
    }

    pub fn resolution(self) -> UVec2 {
        calculate_resolution(self.factor() as f32)
    }
}

/// How a LOD change is compared against the hysteresis threshold.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Reflect)]
pub enum HysteresisComparison {
    /// Commit when the change is strictly larger than the threshold.
    #[default]
    Strict,
    /// Commit when the change is at least the threshold.
    Inclusive,
}

impl HysteresisComparison {
    #[inline]
    pub fn exceeds(self, change: i32, threshold: i32) -> bool {
        match self {
            HysteresisComparison::Strict => change > threshold,
            HysteresisComparison::Inclusive => change >= threshold,
        }
    }
}

/// What happens to the resident geometry when a regeneration fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Reflect)]
pub enum FailurePolicy {
    /// Release the previous buffers, nothing is drawn until a regeneration succeeds.
    #[default]
    DropToInvalid,
    /// Keep drawing the last valid buffers.
    RetainLastValid,
}

/// All parameters controlling the generated plane.
///
/// A copy of these settings is captured whenever geometry is generated, so editing them never
/// affects work that is already in flight.
#[derive(Asset, Clone, Debug, PartialEq, Serialize, Deserialize, Reflect)]
#[serde(default)]
pub struct TessellationSettings {
    /// Size of the plane along the local x and z axis.
    pub plane_size: Vec2,
    /// Base density of the grid, each unit adds four segments per axis.
    pub tessellation_factor: i32,
    /// Scale of the sampled displacement.
    pub displacement_intensity: f32,
    /// Constant added to the displacement.
    pub displacement_offset: f32,
    /// Use the procedural sine wave instead of the displacement texture.
    pub use_sine_wave: bool,
    pub normal_method: NormalMethod,
    /// Blend factor between finite difference and geometry normals in [`NormalMethod::Hybrid`].
    pub normal_smoothing: f32,
    pub invert_normals: bool,

    pub lod_mode: LodMode,
    /// Measure the LOD distance to the closest point on the plane instead of to its pivot.
    pub use_distance_to_bounds: bool,
    pub min_factor: i32,
    pub max_factor: i32,
    pub min_distance: f32,
    pub max_distance: f32,
    /// Speed of the exponential smoothing, zero snaps to the target.
    pub transition_speed: f32,
    /// Minimum level change required to regenerate.
    pub hysteresis: i32,
    pub hysteresis_comparison: HysteresisComparison,

    /// Factors of [`LodMode::DistanceDiscrete`], nearest first.
    pub discrete_levels: Vec<i32>,
    /// Upper distance bound of each discrete level.
    pub discrete_distances: Vec<f32>,

    /// Levels of [`LodMode::SpatialPatches`], nearest first.
    pub patch_levels: Vec<PatchLevel>,
    /// Upper distance bound of each patch level.
    pub patch_distances: Vec<f32>,
    pub patch_count: UVec2,
    pub patch_culling: bool,

    /// Window of the full plane uv space covered by the generated grid.
    pub uv_offset: Vec2,
    pub uv_scale: Vec2,

    pub failure_policy: FailurePolicy,
}

impl Default for TessellationSettings {
    fn default() -> Self {
        Self {
            plane_size: Vec2::splat(1000.0),
            tessellation_factor: 16,
            displacement_intensity: 100.0,
            displacement_offset: 0.0,
            use_sine_wave: true,
            normal_method: NormalMethod::FiniteDifference,
            normal_smoothing: 0.0,
            invert_normals: false,
            lod_mode: LodMode::Disabled,
            use_distance_to_bounds: true,
            min_factor: 8,
            max_factor: 64,
            min_distance: 1000.0,
            max_distance: 50000.0,
            transition_speed: 2.0,
            hysteresis: 2,
            hysteresis_comparison: HysteresisComparison::Strict,
            discrete_levels: vec![64, 32, 16, 8],
            discrete_distances: vec![2000.0, 5000.0, 10000.0, 20000.0],
            patch_levels: vec![
                PatchLevel::Patch64,
                PatchLevel::Patch32,
                PatchLevel::Patch16,
                PatchLevel::Patch8,
                PatchLevel::Patch4,
            ],
            patch_distances: vec![2000.0, 5000.0, 10000.0, 20000.0, 40000.0],
            patch_count: UVec2::splat(4),
            patch_culling: true,
            uv_offset: Vec2::ZERO,
            uv_scale: Vec2::ONE,
            failure_policy: FailurePolicy::DropToInvalid,
        }
    }
}

impl TessellationSettings {
    /// Parses settings from RON, missing fields keep their defaults.
    pub fn from_ron_str(source: &str) -> Result<Self> {
        Ok(ron::from_str(source)?)
    }

    /// Clamps all values into their usable range.
    ///
    /// Every adjustment is reported, none of them prevent generating geometry.
    pub fn sanitize(&mut self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if !(self.plane_size.x > 0.0 && self.plane_size.y > 0.0) {
            issues.push(ConfigIssue::PlaneSize(self.plane_size));
            self.plane_size = Vec2::new(
                positive_or(self.plane_size.x, 1.0),
                positive_or(self.plane_size.y, 1.0),
            );
        }

        if self.tessellation_factor < 1 {
            issues.push(ConfigIssue::TessellationFactor(self.tessellation_factor));
            self.tessellation_factor = 1;
        }

        if !self.displacement_intensity.is_finite() || !self.displacement_offset.is_finite() {
            issues.push(ConfigIssue::Displacement);
            self.displacement_intensity = finite_or(self.displacement_intensity, 0.0);
            self.displacement_offset = finite_or(self.displacement_offset, 0.0);
        }

        let smoothing = finite_or(self.normal_smoothing, 0.0).clamp(0.0, 1.0);
        if smoothing != self.normal_smoothing {
            issues.push(ConfigIssue::NormalSmoothing(self.normal_smoothing));
            self.normal_smoothing = smoothing;
        }

        let min_factor = self.min_factor.clamp(1, MAX_LOD_FACTOR);
        let max_factor = self.max_factor.clamp(min_factor, MAX_LOD_FACTOR);
        if (min_factor, max_factor) != (self.min_factor, self.max_factor) {
            issues.push(ConfigIssue::FactorRange(self.min_factor, self.max_factor));
            self.min_factor = min_factor;
            self.max_factor = max_factor;
        }

        if self.min_distance < 0.0 || !self.min_distance.is_finite() {
            issues.push(ConfigIssue::DistanceRange(self.min_distance, self.max_distance));
            self.min_distance = 0.0;
        }
        if !(self.max_distance > self.min_distance) {
            issues.push(ConfigIssue::DistanceRange(self.min_distance, self.max_distance));
            self.max_distance = self.min_distance + DISTANCE_MARGIN;
        }

        if self.transition_speed < 0.0 || !self.transition_speed.is_finite() {
            issues.push(ConfigIssue::TransitionSpeed(self.transition_speed));
            self.transition_speed = 0.0;
        }

        if self.hysteresis < 0 {
            issues.push(ConfigIssue::Hysteresis(self.hysteresis));
            self.hysteresis = 0;
        }

        let patch_count = self.patch_count.clamp(UVec2::ONE, UVec2::splat(MAX_PATCH_COUNT));
        if patch_count != self.patch_count {
            issues.push(ConfigIssue::PatchCount(self.patch_count));
            self.patch_count = patch_count;
        }

        let uv_offset = self.uv_offset.clamp(Vec2::ZERO, Vec2::ONE);
        let uv_scale = Vec2::new(
            unit_interval_or_one(self.uv_scale.x),
            unit_interval_or_one(self.uv_scale.y),
        );
        if uv_offset != self.uv_offset || uv_scale != self.uv_scale {
            issues.push(ConfigIssue::UvWindow(self.uv_offset, self.uv_scale));
            self.uv_offset = uv_offset;
            self.uv_scale = uv_scale;
        }

        issues
    }

    /// Returns a sanitized copy and logs every adjustment.
    pub fn sanitized(&self) -> Self {
        let mut settings = self.clone();

        for issue in settings.sanitize() {
            warn!("Adjusted tessellation settings: {issue}");
        }

        settings
    }

    /// Whether both settings evaluate the single mesh LOD identically.
    pub fn lod_matches(&self, other: &Self) -> bool {
        self.lod_mode == other.lod_mode
            && self.use_distance_to_bounds == other.use_distance_to_bounds
            && self.min_factor == other.min_factor
            && self.max_factor == other.max_factor
            && self.min_distance == other.min_distance
            && self.max_distance == other.max_distance
            && self.transition_speed == other.transition_speed
            && self.hysteresis == other.hysteresis
            && self.hysteresis_comparison == other.hysteresis_comparison
            && self.discrete_levels == other.discrete_levels
            && self.discrete_distances == other.discrete_distances
    }
}

fn positive_or(value: f32, fallback: f32) -> f32 {
    if value.is_finite() && value > 0.0 {
        value
    } else if value.is_finite() && value < 0.0 {
        -value
    } else {
        fallback
    }
}

fn finite_or(value: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

fn unit_interval_or_one(value: f32) -> f32 {
    if value > 0.0 && value <= 1.0 {
        value
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_clean() {
        let mut settings = TessellationSettings::default();

        assert!(settings.sanitize().is_empty());
        assert_eq!(settings, TessellationSettings::default());
    }

    #[test]
    fn inverted_distances_get_margin() {
        let mut settings = TessellationSettings {
            min_distance: 5000.0,
            max_distance: 2000.0,
            ..default()
        };

        let issues = settings.sanitize();

        assert_eq!(issues.len(), 1);
        assert_eq!(settings.max_distance, 5000.0 + DISTANCE_MARGIN);
    }

    #[test]
    fn degenerate_plane_and_factor() {
        let mut settings = TessellationSettings {
            plane_size: Vec2::new(-200.0, 0.0),
            tessellation_factor: -3,
            patch_count: UVec2::new(0, 100),
            ..default()
        };

        let issues = settings.sanitize();

        assert_eq!(issues.len(), 3);
        assert_eq!(settings.plane_size, Vec2::new(200.0, 1.0));
        assert_eq!(settings.tessellation_factor, 1);
        assert_eq!(settings.patch_count, UVec2::new(1, MAX_PATCH_COUNT));
    }

    #[test]
    fn parse_partial_ron() {
        let settings = TessellationSettings::from_ron_str(
            "(plane_size: (4000.0, 2000.0), lod_mode: SpatialPatches, patch_levels: [Patch32, Patch8])",
        )
        .unwrap();

        assert_eq!(settings.plane_size, Vec2::new(4000.0, 2000.0));
        assert_eq!(settings.lod_mode, LodMode::SpatialPatches);
        assert_eq!(
            settings.patch_levels,
            vec![PatchLevel::Patch32, PatchLevel::Patch8]
        );
        assert_eq!(settings.tessellation_factor, 16);
    }

    #[test]
    fn patch_level_resolutions() {
        assert_eq!(PatchLevel::Patch4.resolution(), UVec2::splat(17));
        assert_eq!(PatchLevel::Patch16.resolution(), UVec2::splat(65));
        assert_eq!(PatchLevel::Patch64.resolution(), UVec2::splat(257));
        assert_eq!(PatchLevel::Patch128.resolution(), UVec2::splat(513));
    }

    #[test]
    fn hysteresis_comparisons() {
        assert!(!HysteresisComparison::Strict.exceeds(2, 2));
        assert!(HysteresisComparison::Inclusive.exceeds(2, 2));
        assert!(HysteresisComparison::Strict.exceeds(3, 2));
    }
}
