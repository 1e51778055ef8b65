//! Distance based level of detail for single mesh planes.
//!
//! Each plane owns a [`LodEvaluator`], that is updated once per frame with a fresh camera
//! distance. The evaluator smooths the target factor over time and only commits a new factor,
//! once it differs from the last committed one by more than the configured hysteresis.

use crate::settings::{LodMode, TessellationSettings, DISTANCE_MARGIN, MAX_LOD_FACTOR};
use bevy::{math::Affine3A, prelude::*};

const SCALE_EPSILON: f32 = 1e-6;
const SNAP_EPSILON: f32 = 1e-4;

/// The level of detail state of a single plane.
///
/// The evaluator is created uninitialized and seeds itself from the settings on its first
/// evaluation, so that every plane starts from its own maximum factor.
#[derive(Clone, Debug, Default, Reflect)]
pub struct LodEvaluator {
    /// Whether the levels have been seeded from the settings.
    pub initialized: bool,
    /// The smoothed, fractional level approaching the target level.
    pub current_level: f32,
    /// The last level that passed the hysteresis check and is used for generation.
    pub last_applied_level: i32,
    /// Set when a new level was committed and the geometry has to be regenerated.
    pub dirty: bool,
    fallback_reported: bool,
}

impl LodEvaluator {
    /// Creates an evaluator already seeded from the settings.
    pub fn new(settings: &TessellationSettings) -> Self {
        let mut evaluator = Self::default();
        evaluator.initialize(settings);
        evaluator
    }

    fn initialize(&mut self, settings: &TessellationSettings) {
        self.current_level = settings.max_factor as f32;
        self.last_applied_level = settings.max_factor;
        self.initialized = true;
    }

    /// Evaluates the LOD mode of the settings and returns whether a new level was committed.
    pub fn evaluate(
        &mut self,
        settings: &TessellationSettings,
        distance: f32,
        max_scale: f32,
        delta_seconds: f32,
    ) -> bool {
        match settings.lod_mode {
            LodMode::Disabled | LodMode::SpatialPatches => false,
            LodMode::DistanceContinuous => {
                self.evaluate_continuous(settings, distance, max_scale, delta_seconds)
            }
            LodMode::DistanceDiscrete => self.evaluate_discrete(settings, distance, max_scale),
            LodMode::DensityTexture => {
                if !self.fallback_reported {
                    debug!("Density texture LOD is evaluated as continuous distance LOD.");
                    self.fallback_reported = true;
                }

                self.evaluate_continuous(settings, distance, max_scale, delta_seconds)
            }
        }
    }

    /// Smoothly interpolates between the maximum and minimum factor across the distance range.
    pub fn evaluate_continuous(
        &mut self,
        settings: &TessellationSettings,
        distance: f32,
        max_scale: f32,
        delta_seconds: f32,
    ) -> bool {
        if !self.initialized {
            self.initialize(settings);
        }

        let target = continuous_target(settings, distance, max_scale);

        self.current_level = if settings.transition_speed > 0.0 {
            interpolate_to(
                self.current_level,
                target,
                delta_seconds,
                settings.transition_speed,
            )
        } else {
            target
        };

        let level = self.current_level.round() as i32;

        self.commit(level, settings)
    }

    /// Picks the factor of the first distance threshold that contains the camera.
    pub fn evaluate_discrete(
        &mut self,
        settings: &TessellationSettings,
        distance: f32,
        max_scale: f32,
    ) -> bool {
        if !self.initialized {
            self.initialize(settings);
        }

        let distance = distance / max_scale.max(SCALE_EPSILON);

        let Some(level) = select_discrete_level(
            distance,
            &settings.discrete_levels,
            &settings.discrete_distances,
        ) else {
            return false;
        };

        let committed = self.commit(level, settings);

        if committed {
            self.current_level = level as f32;
        }

        committed
    }

    fn commit(&mut self, level: i32, settings: &TessellationSettings) -> bool {
        let change = (level - self.last_applied_level).abs();

        if settings
            .hysteresis_comparison
            .exceeds(change, settings.hysteresis)
        {
            self.last_applied_level = level;
            self.dirty = true;
            true
        } else {
            false
        }
    }

    /// The factor used for generation, the authored factor is only replaced while LOD is active.
    pub fn effective_factor(&self, settings: &TessellationSettings) -> i32 {
        match settings.lod_mode {
            LodMode::DistanceContinuous | LodMode::DistanceDiscrete | LodMode::DensityTexture
                if self.initialized =>
            {
                self.last_applied_level
            }
            _ => settings.tessellation_factor,
        }
    }

    /// Returns and clears the dirty flag.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}

/// The unsmoothed, fractional factor of the continuous mode at the given distance. It is only
/// rounded when a level is committed.
pub fn continuous_target(settings: &TessellationSettings, distance: f32, max_scale: f32) -> f32 {
    let max_scale = max_scale.max(SCALE_EPSILON);
    let min_distance = settings.min_distance * max_scale;
    let mut max_distance = settings.max_distance * max_scale;

    if min_distance >= max_distance {
        max_distance = min_distance + DISTANCE_MARGIN;
    }

    let t = if distance <= min_distance {
        0.0
    } else if distance >= max_distance {
        1.0
    } else {
        let t = (distance - min_distance) / (max_distance - min_distance);
        t * t * (3.0 - 2.0 * t)
    };

    let max_factor = settings.max_factor as f32;
    let target = max_factor + (settings.min_factor as f32 - max_factor) * t;

    target.clamp(1.0, MAX_LOD_FACTOR as f32)
}

/// Exponentially moves `current` towards `target`, covering `delta * speed` of the remaining
/// distance each call.
pub fn interpolate_to(current: f32, target: f32, delta_seconds: f32, speed: f32) -> f32 {
    if speed <= 0.0 {
        return target;
    }

    let remaining = target - current;

    if remaining * remaining < SNAP_EPSILON * SNAP_EPSILON {
        return target;
    }

    current + remaining * (delta_seconds * speed).clamp(0.0, 1.0)
}

/// Walks the ordered thresholds from near to far and returns the level of the first threshold
/// containing the distance. Distances beyond all thresholds use the level of the last threshold.
pub fn select_threshold<T: Copy>(distance: f32, levels: &[T], distances: &[f32]) -> Option<T> {
    let first = *levels.first()?;

    if distances.is_empty() {
        return Some(first);
    }

    let count = levels.len().min(distances.len());

    let index = distances[..count]
        .iter()
        .position(|&threshold| distance <= threshold)
        .unwrap_or(count - 1);

    Some(levels[index])
}

/// The factor of the discrete mode. Unlike [`select_threshold`], distances beyond all thresholds
/// use the last level, which is the level following the last crossed threshold.
pub fn select_discrete_level(distance: f32, levels: &[i32], distances: &[f32]) -> Option<i32> {
    let last = *levels.last()?;

    let index = distances
        .iter()
        .take(levels.len())
        .position(|&threshold| distance <= threshold);

    Some(index.map_or(last, |index| levels[index]))
}

/// The largest absolute scale component of the transform, degenerate scales count as one.
pub fn max_abs_scale(world_from_local: &Affine3A) -> f32 {
    let (scale, _, _) = world_from_local.to_scale_rotation_translation();
    let max_scale = scale.abs().max_element();

    if max_scale < SCALE_EPSILON || !max_scale.is_finite() {
        1.0
    } else {
        max_scale
    }
}

/// Distance from the camera to the plane.
///
/// Measures either to the pivot, or to the closest point on the undisplaced plane, which is
/// found in local space by clamping the camera position to the plane rectangle.
pub fn distance_to_camera(
    settings: &TessellationSettings,
    world_from_local: &Affine3A,
    camera: Vec3,
) -> f32 {
    let origin = Vec3::from(world_from_local.translation);

    if !settings.use_distance_to_bounds {
        return camera.distance(origin);
    }

    if world_from_local.matrix3.determinant().abs() < SCALE_EPSILON {
        return camera.distance(origin);
    }

    let local_camera = world_from_local.inverse().transform_point3(camera);
    let half_size = settings.plane_size / 2.0;

    let closest = Vec3::new(
        local_camera.x.clamp(-half_size.x, half_size.x),
        0.0,
        local_camera.z.clamp(-half_size.y, half_size.y),
    );

    camera.distance(world_from_local.transform_point3(closest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn continuous_settings() -> TessellationSettings {
        TessellationSettings {
            lod_mode: LodMode::DistanceContinuous,
            min_distance: 1000.0,
            max_distance: 50000.0,
            min_factor: 8,
            max_factor: 64,
            transition_speed: 0.0,
            ..default()
        }
    }

    #[test]
    fn near_distance_uses_max_factor() {
        assert_eq!(continuous_target(&continuous_settings(), 1000.0, 1.0), 64.0);
    }

    #[test]
    fn far_distance_uses_min_factor() {
        assert_eq!(continuous_target(&continuous_settings(), 50000.0, 1.0), 8.0);
    }

    #[test]
    fn target_is_smoothstep() {
        let settings = continuous_settings();

        // halfway through the range smoothstep is exactly one half
        let middle = (1000.0 + 50000.0) / 2.0;
        assert_eq!(continuous_target(&settings, middle, 1.0), 36.0);

        // scaling the object scales the distance range
        assert_eq!(continuous_target(&settings, 2.0 * middle, 2.0), 36.0);
    }

    #[test]
    fn inverted_distances_use_margin() {
        let settings = TessellationSettings {
            min_distance: 3000.0,
            max_distance: 1000.0,
            ..continuous_settings()
        };

        assert_eq!(continuous_target(&settings, 3000.0, 1.0), 64.0);
        assert_eq!(continuous_target(&settings, 4000.0, 1.0), 8.0);
    }

    #[test]
    fn evaluator_is_seeded_per_instance() {
        let settings = continuous_settings();
        let mut first = LodEvaluator::default();
        let mut second = LodEvaluator::default();

        first.evaluate(&settings, 50000.0, 1.0, 0.016);
        assert!(first.initialized);
        assert!(!second.initialized);

        second.evaluate(&settings, 1000.0, 1.0, 0.016);
        assert_eq!(first.last_applied_level, 8);
        assert_eq!(second.last_applied_level, 64);
        assert!(first.dirty);
        assert!(!second.dirty);
    }

    #[test]
    fn repeated_evaluation_is_idempotent() {
        let mut rng = rand::rng();

        for _ in 0..100 {
            let settings = TessellationSettings {
                transition_speed: rng.random_range(1.0..8.0),
                hysteresis: rng.random_range(0..4),
                ..continuous_settings()
            };
            let distance = rng.random_range(0.0..60000.0);
            let mut evaluator = LodEvaluator::new(&settings);

            // converge
            for _ in 0..1000 {
                evaluator.evaluate(&settings, distance, 1.0, 0.1);
            }

            let level = evaluator.last_applied_level;
            evaluator.take_dirty();

            for _ in 0..100 {
                assert!(!evaluator.evaluate(&settings, distance, 1.0, 0.1));
            }

            assert_eq!(evaluator.last_applied_level, level);
            assert!(!evaluator.dirty);
        }
    }

    #[test]
    fn hysteresis_blocks_small_changes() {
        let settings = TessellationSettings {
            hysteresis: 2,
            ..continuous_settings()
        };
        let mut evaluator = LodEvaluator::new(&settings);

        // target 62 differs from the applied 64 by exactly the hysteresis
        let distance = (1000..50000)
            .map(|distance| distance as f32)
            .find(|&distance| continuous_target(&settings, distance, 1.0).round() == 62.0)
            .unwrap();

        assert!(!evaluator.evaluate(&settings, distance, 1.0, 0.016));
        assert_eq!(evaluator.last_applied_level, 64);
        assert!(!evaluator.dirty);

        assert!(evaluator.evaluate(&settings, 50000.0, 1.0, 0.016));
        assert_eq!(evaluator.last_applied_level, 8);
        assert!(evaluator.take_dirty());
        assert!(!evaluator.dirty);
    }

    #[test]
    fn smoothing_approaches_target() {
        let settings = TessellationSettings {
            transition_speed: 2.0,
            ..continuous_settings()
        };
        let mut evaluator = LodEvaluator::new(&settings);

        evaluator.evaluate(&settings, 50000.0, 1.0, 0.1);
        // 20% of the way from 64 to 8
        assert!((evaluator.current_level - 52.8).abs() < 1e-3);
        assert_eq!(evaluator.last_applied_level, 53);

        for _ in 0..200 {
            evaluator.evaluate(&settings, 50000.0, 1.0, 0.1);
        }
        assert_eq!(evaluator.current_level, 8.0);
    }

    #[test]
    fn discrete_thresholds() {
        let settings = TessellationSettings {
            lod_mode: LodMode::DistanceDiscrete,
            ..default()
        };
        let mut evaluator = LodEvaluator::new(&settings);

        assert!(!evaluator.evaluate(&settings, 1500.0, 1.0, 0.016));
        assert_eq!(evaluator.effective_factor(&settings), 64);

        assert!(evaluator.evaluate(&settings, 7000.0, 1.0, 0.016));
        assert_eq!(evaluator.effective_factor(&settings), 16);

        // beyond the last threshold
        assert!(evaluator.evaluate(&settings, 1e6, 1.0, 0.016));
        assert_eq!(evaluator.effective_factor(&settings), 8);

        // scaled objects scale the thresholds
        assert!(evaluator.evaluate(&settings, 7000.0, 4.0, 0.016));
        assert_eq!(evaluator.effective_factor(&settings), 64);
    }

    #[test]
    fn discrete_hysteresis_comparison() {
        let mut settings = TessellationSettings {
            lod_mode: LodMode::DistanceDiscrete,
            discrete_levels: vec![10, 8],
            discrete_distances: vec![100.0, 200.0],
            max_factor: 10,
            hysteresis: 2,
            ..default()
        };

        let mut evaluator = LodEvaluator::new(&settings);
        assert!(!evaluator.evaluate(&settings, 150.0, 1.0, 0.016));

        settings.hysteresis_comparison = crate::settings::HysteresisComparison::Inclusive;
        assert!(evaluator.evaluate(&settings, 150.0, 1.0, 0.016));
        assert_eq!(evaluator.last_applied_level, 8);
    }

    #[test]
    fn authored_factor_is_kept() {
        let settings = continuous_settings();
        let mut evaluator = LodEvaluator::new(&settings);
        evaluator.evaluate(&settings, 50000.0, 1.0, 0.016);

        assert_eq!(settings.tessellation_factor, 16);
        assert_eq!(evaluator.effective_factor(&settings), 8);

        let disabled = TessellationSettings {
            lod_mode: LodMode::Disabled,
            ..settings
        };
        assert_eq!(evaluator.effective_factor(&disabled), 16);
    }

    #[test]
    fn threshold_selection() {
        let levels = [64, 16];
        let distances = [2000.0, 5000.0];

        assert_eq!(select_threshold(1000.0, &levels, &distances), Some(64));
        assert_eq!(select_threshold(2000.0, &levels, &distances), Some(64));
        assert_eq!(select_threshold(3000.0, &levels, &distances), Some(16));
        assert_eq!(select_threshold(9000.0, &levels, &distances), Some(16));
        assert_eq!(select_threshold(9000.0, &levels, &[]), Some(64));
        assert_eq!(select_threshold::<i32>(9000.0, &[], &distances), None);

        // more levels than distances
        assert_eq!(select_threshold(9000.0, &[1, 2, 3], &[10.0]), Some(1));
    }

    #[test]
    fn discrete_level_beyond_thresholds() {
        let levels = [64, 32, 16];
        let distances = [2000.0, 5000.0];

        assert_eq!(select_discrete_level(1000.0, &levels, &distances), Some(64));
        assert_eq!(select_discrete_level(5000.0, &levels, &distances), Some(32));
        assert_eq!(select_discrete_level(9000.0, &levels, &distances), Some(16));
        assert_eq!(select_discrete_level(9000.0, &[64, 16], &[]), Some(16));
        assert_eq!(select_discrete_level(9000.0, &[], &distances), None);

        // more distances than levels
        assert_eq!(select_discrete_level(3000.0, &[64], &distances), Some(64));

        let settings = TessellationSettings {
            lod_mode: LodMode::DistanceDiscrete,
            discrete_levels: levels.to_vec(),
            discrete_distances: distances.to_vec(),
            hysteresis: 0,
            ..default()
        };
        let mut evaluator = LodEvaluator::new(&settings);
        assert!(evaluator.evaluate(&settings, 9000.0, 1.0, 0.016));
        assert_eq!(evaluator.effective_factor(&settings), 16);
    }

    #[test]
    fn smoothing_rounds_on_commit() {
        let settings = TessellationSettings {
            transition_speed: 1.0,
            hysteresis: 0,
            ..continuous_settings()
        };
        let mut evaluator = LodEvaluator::new(&settings);

        // the raw target is fractional, only the committed level is rounded
        let distance = 20000.0;
        let target = continuous_target(&settings, distance, 1.0);
        assert_ne!(target, target.round());

        for _ in 0..500 {
            evaluator.evaluate(&settings, distance, 1.0, 0.1);
        }

        assert!((evaluator.current_level - target).abs() < 1e-3);
        assert_eq!(evaluator.last_applied_level, target.round() as i32);
    }

    #[test]
    fn distance_to_plane_bounds() {
        let settings = TessellationSettings::default();
        let transform = Affine3A::from_translation(Vec3::new(100.0, 0.0, 0.0));

        // above the plane the closest point is directly below the camera
        let camera = Vec3::new(300.0, 50.0, -200.0);
        assert_eq!(distance_to_camera(&settings, &transform, camera), 50.0);

        // outside the plane the closest point is on the border
        let camera = Vec3::new(1100.0, 0.0, 0.0);
        assert_eq!(distance_to_camera(&settings, &transform, camera), 500.0);

        let pivot = TessellationSettings {
            use_distance_to_bounds: false,
            ..default()
        };
        assert_eq!(distance_to_camera(&pivot, &transform, camera), 1000.0);
    }

    #[test]
    fn scale_of_transform() {
        let transform = Affine3A::from_scale(Vec3::new(1.0, -3.0, 2.0));
        assert!((max_abs_scale(&transform) - 3.0).abs() < 1e-5);
        assert_eq!(max_abs_scale(&Affine3A::from_scale(Vec3::ZERO)), 1.0);
    }
}
