//! Main world components and systems of tessellated planes.
//!
//! Every [`TessellatedPlane`] owns a [`TessellationState`], which evaluates the LOD, partitions
//! the plane into patches and produces the [`MeshPlan`]s that are extracted into the render world
//! each frame.

use crate::{
    debug::DebugTessellation,
    lod::{distance_to_camera, max_abs_scale, LodEvaluator},
    patch::{compute_patches, PatchInfo, ViewFrustum},
    plan::MeshPlan,
    resolution::triangle_count,
    settings::{LodMode, TessellationSettings},
};
use bevy::{
    math::Affine3A,
    prelude::*,
    render::{extract_resource::ExtractResource, primitives::Frustum},
    utils::{HashMap, HashSet},
};
use std::mem;

/// Offset of the fallback camera position above the plane, used when there is no camera.
pub const FALLBACK_CAMERA_HEIGHT: f32 = 2000.0;

/// Stores the components of all tessellated planes, keyed by their main world entity.
#[derive(Resource, Deref, DerefMut)]
pub struct TessellationComponents<C>(pub HashMap<Entity, C>);

impl<C> Default for TessellationComponents<C> {
    fn default() -> Self {
        Self(default())
    }
}

/// Global configuration of the tessellation plugin.
#[derive(Resource, Clone, Debug, Reflect, ExtractResource)]
#[reflect(Resource)]
pub struct TessellationPluginSettings {
    /// Maximum number of meshes and patches generated per frame, the rest is deferred.
    pub max_jobs_per_frame: usize,
    /// Camera movement, in unscaled local units, that triggers recomputing the patch levels.
    pub camera_move_threshold: f32,
    /// Regeneration rate for planes sampling dynamic textures.
    pub render_target_update_fps: f32,
}

impl Default for TessellationPluginSettings {
    fn default() -> Self {
        Self {
            max_jobs_per_frame: 256,
            camera_move_threshold: 100.0,
            render_target_update_fps: 60.0,
        }
    }
}

/// Marks the camera used for LOD and culling. Without a marked camera, the first active 3d
/// camera is used.
#[derive(Component, Clone, Copy, Debug, Default, Reflect)]
#[reflect(Component)]
pub struct TessellationView;

/// Keeps the settings of a plane in sync with a `.tess.ron` asset.
#[derive(Component, Clone, Debug, Default, Deref, DerefMut, Reflect)]
#[reflect(Component)]
pub struct TessellationSettingsHandle(pub Handle<TessellationSettings>);

/// A plane whose geometry is generated by the compute stages.
#[derive(Component, Clone, Debug, Reflect)]
#[reflect(Component)]
#[require(Transform, Visibility, TessellationState, TessellationTextures)]
pub struct TessellatedPlane {
    pub settings: TessellationSettings,
    /// Regenerate as soon as the settings, the textures or the LOD level change. Otherwise the
    /// geometry only changes after [`TessellationState::request_update`].
    pub auto_update: bool,
    /// Regenerate periodically while a dynamic texture source is bound.
    pub auto_update_render_targets: bool,
    /// Log LOD commits and regenerations with the info level.
    pub debug_logging: bool,
}

impl Default for TessellatedPlane {
    fn default() -> Self {
        Self {
            settings: default(),
            auto_update: true,
            auto_update_render_targets: true,
            debug_logging: false,
        }
    }
}

impl TessellatedPlane {
    pub fn new(settings: TessellationSettings) -> Self {
        Self {
            settings,
            ..default()
        }
    }
}

/// A texture sampled by the compute stages.
#[derive(Clone, Debug, PartialEq, Reflect)]
pub enum TextureSource {
    /// An image that only changes when its asset is modified.
    Static(Handle<Image>),
    /// An image updated every frame, for example a render target that is painted into.
    Dynamic {
        image: Handle<Image>,
        /// Overrides [`TessellationPluginSettings::render_target_update_fps`].
        update_fps: Option<f32>,
    },
}

impl TextureSource {
    pub fn image(&self) -> &Handle<Image> {
        match self {
            TextureSource::Static(image) | TextureSource::Dynamic { image, .. } => image,
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, TextureSource::Dynamic { .. })
    }
}

impl From<Handle<Image>> for TextureSource {
    fn from(image: Handle<Image>) -> Self {
        TextureSource::Static(image)
    }
}

/// The textures sampled while generating a plane. Unbound textures sample as white.
#[derive(Component, Clone, Debug, Default, PartialEq, Reflect)]
#[reflect(Component)]
pub struct TessellationTextures {
    /// Height in the red channel.
    pub displacement: Option<TextureSource>,
    /// Subtracted from the height, in the red channel.
    pub mask: Option<TextureSource>,
    /// Tangent space normals with z up.
    pub normal_map: Option<TextureSource>,
}

impl TessellationTextures {
    pub fn sources(&self) -> impl Iterator<Item = &TextureSource> {
        [&self.displacement, &self.mask, &self.normal_map]
            .into_iter()
            .flatten()
    }

    fn dynamic_update_fps(&self) -> Option<Option<f32>> {
        self.sources().find_map(|source| match source {
            TextureSource::Dynamic { update_fps, .. } => Some(*update_fps),
            TextureSource::Static(_) => None,
        })
    }
}

/// The view a plane is evaluated for in a single frame.
pub struct PlaneView<'a> {
    pub world_from_local: Affine3A,
    pub camera: Vec3,
    pub frustum: Option<&'a dyn ViewFrustum>,
    pub delta_seconds: f32,
    pub elapsed_seconds: f32,
    pub freeze_lod: bool,
}

/// The LOD and generation state of a plane.
///
/// Written only by [`update_tessellation`].
#[derive(Component, Clone, Debug, Default, Reflect)]
#[reflect(Component)]
pub struct TessellationState {
    pub lod: LodEvaluator,
    patches: Vec<PatchInfo>,
    plans: Vec<MeshPlan>,
    /// Sanitized copy of the plane settings.
    settings: TessellationSettings,
    /// The settings snapshot of the current revision.
    generation_settings: TessellationSettings,
    source_settings: Option<TessellationSettings>,
    revision: u64,
    pending_revision: bool,
    update_requested: bool,
    textures_changed: bool,
    last_camera: Option<Vec3>,
    #[reflect(ignore)]
    last_world_from_local: Option<Affine3A>,
    last_render_target_update: f32,
}

impl TessellationState {
    /// Regenerates the geometry on the next update, even if auto update is disabled.
    pub fn request_update(&mut self) {
        self.update_requested = true;
    }

    /// The sanitized settings of the current plans.
    pub fn settings(&self) -> &TessellationSettings {
        &self.settings
    }

    pub fn plans(&self) -> &[MeshPlan] {
        &self.plans
    }

    /// The patches of the plane, empty unless the patch LOD is active.
    pub fn patches(&self) -> &[PatchInfo] {
        &self.patches
    }

    /// The settings the current plans are generated with.
    pub fn generation_settings(&self) -> &TessellationSettings {
        &self.generation_settings
    }

    /// Increases whenever the settings or texture contents change.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// The resolution of the single mesh, or of the first patch.
    pub fn resolution(&self) -> Option<UVec2> {
        self.plans.first().map(|plan| plan.resolution)
    }

    /// The number of vertices of all generatable meshes and patches.
    pub fn vertex_count(&self) -> u32 {
        self.valid_plans().map(MeshPlan::vertex_count).sum()
    }

    pub fn triangle_count(&self) -> u32 {
        self.valid_plans()
            .map(|plan| triangle_count(plan.resolution))
            .sum()
    }

    fn valid_plans(&self) -> impl Iterator<Item = &MeshPlan> {
        self.plans.iter().filter(|plan| plan.validate().is_ok())
    }

    /// Evaluates the LOD for the view and updates the plans.
    ///
    /// Returns whether the plans were replaced.
    pub fn update(
        &mut self,
        plane: &TessellatedPlane,
        textures: &TessellationTextures,
        view: &PlaneView,
        plugin_settings: &TessellationPluginSettings,
    ) -> bool {
        let settings_changed = self.source_settings.as_ref() != Some(&plane.settings);

        if settings_changed {
            let settings = plane.settings.sanitized();

            // a new LOD configuration starts over from its own maximum factor
            if !settings.lod_matches(&self.settings) {
                self.lod = LodEvaluator::default();
            }

            self.source_settings = Some(plane.settings.clone());
            self.settings = settings;
            self.patches.clear();
        }

        let mut content_changed = settings_changed || mem::take(&mut self.textures_changed);

        if plane.auto_update_render_targets {
            if let Some(update_fps) = textures.dynamic_update_fps() {
                let fps = update_fps.unwrap_or(plugin_settings.render_target_update_fps);

                if fps > 0.0
                    && view.elapsed_seconds - self.last_render_target_update >= fps.recip()
                {
                    self.last_render_target_update = view.elapsed_seconds;
                    content_changed = true;
                }
            }
        }

        self.pending_revision |= content_changed;

        let apply = plane.auto_update
            || self.plans.is_empty()
            || mem::take(&mut self.update_requested);

        let plans = match self.settings.lod_mode {
            LodMode::SpatialPatches => self.update_patches(view, plugin_settings),
            _ => self.update_single(plane, view),
        };

        if apply {
            if mem::take(&mut self.pending_revision) {
                self.generation_settings = self.settings.clone();
                self.revision += 1;
                log_plane(
                    plane.debug_logging,
                    format_args!("Regenerating tessellated plane, revision {}", self.revision),
                );
            }

            self.plans = plans;
        } else {
            // keep the generated geometry, only the visibility follows the view
            for (plan, new_plan) in self.plans.iter_mut().zip(&plans) {
                plan.visible = new_plan.visible;
            }
        }

        apply
    }

    fn update_single(&mut self, plane: &TessellatedPlane, view: &PlaneView) -> Vec<MeshPlan> {
        let settings = &self.settings;

        if !view.freeze_lod && settings.lod_mode.is_enabled() {
            let distance = distance_to_camera(settings, &view.world_from_local, view.camera);
            let max_scale = max_abs_scale(&view.world_from_local);

            self.lod
                .evaluate(settings, distance, max_scale, view.delta_seconds);
        }

        if self.lod.take_dirty() {
            log_plane(
                plane.debug_logging,
                format_args!(
                    "Committed tessellation level {}",
                    self.lod.last_applied_level
                ),
            );
        }

        vec![MeshPlan::single(
            settings,
            self.lod.effective_factor(settings),
        )]
    }

    fn update_patches(
        &mut self,
        view: &PlaneView,
        plugin_settings: &TessellationPluginSettings,
    ) -> Vec<MeshPlan> {
        let settings = &self.settings;
        let patch_count = (settings.patch_count.x * settings.patch_count.y) as usize;

        let threshold =
            plugin_settings.camera_move_threshold * max_abs_scale(&view.world_from_local);
        let camera_moved = self
            .last_camera
            .is_none_or(|last| last.distance(view.camera) > threshold);
        let transform_changed = self.last_world_from_local != Some(view.world_from_local);

        let stale = self.patches.len() != patch_count;

        if stale || (!view.freeze_lod && (camera_moved || transform_changed)) {
            self.patches = compute_patches(
                settings,
                &view.world_from_local,
                view.camera,
                view.frustum,
            );
            self.last_camera = Some(view.camera);
            self.last_world_from_local = Some(view.world_from_local);
        } else {
            for patch in &mut self.patches {
                patch.visible = patch.valid
                    && match view.frustum {
                        Some(frustum) if settings.patch_culling => frustum
                            .intersects(patch.world_bounds_center(), patch.world_half_extent()),
                        _ => true,
                    };
            }
        }

        self.patches.iter().map(MeshPlan::patch).collect()
    }
}

pub(crate) fn log_plane(verbose: bool, message: std::fmt::Arguments) {
    if verbose {
        info!("{message}");
    } else {
        debug!("{message}");
    }
}

/// Copies loaded or modified settings assets into their planes.
pub(crate) fn apply_settings_assets(
    mut events: EventReader<AssetEvent<TessellationSettings>>,
    settings_assets: Res<Assets<TessellationSettings>>,
    mut planes: Query<(Ref<TessellationSettingsHandle>, &mut TessellatedPlane)>,
) {
    let changed = events
        .read()
        .filter_map(|event| match event {
            AssetEvent::Added { id }
            | AssetEvent::Modified { id }
            | AssetEvent::LoadedWithDependencies { id } => Some(*id),
            _ => None,
        })
        .collect::<HashSet<_>>();

    for (handle, mut plane) in &mut planes {
        if !handle.is_changed() && !changed.contains(&handle.id()) {
            continue;
        }

        let Some(settings) = settings_assets.get(&handle.0) else {
            continue;
        };

        if plane.settings != *settings {
            plane.settings = settings.clone();
        }
    }
}

/// Flags planes whose static textures were loaded or modified.
pub(crate) fn track_texture_changes(
    mut events: EventReader<AssetEvent<Image>>,
    mut planes: Query<(Ref<TessellationTextures>, &mut TessellationState)>,
) {
    let changed = events
        .read()
        .filter_map(|event| match event {
            AssetEvent::Added { id }
            | AssetEvent::Modified { id }
            | AssetEvent::LoadedWithDependencies { id } => Some(*id),
            _ => None,
        })
        .collect::<HashSet<_>>();

    for (textures, mut state) in &mut planes {
        let modified = textures
            .sources()
            .any(|source| changed.contains(&source.image().id()));

        if textures.is_changed() || modified {
            state.textures_changed = true;
        }
    }
}

type CameraItem<'a> = (
    &'a GlobalTransform,
    Option<&'a Camera>,
    Option<&'a Frustum>,
);

/// Picks the marked view, or the first active 3d camera.
fn select_view<'a>(
    marked: impl IntoIterator<Item = CameraItem<'a>>,
    cameras: impl IntoIterator<Item = CameraItem<'a>>,
) -> Option<(Vec3, Option<Frustum>)> {
    fn is_active((_, camera, _): &CameraItem) -> bool {
        camera.is_none_or(|camera| camera.is_active)
    }

    marked
        .into_iter()
        .find(is_active)
        .or_else(|| cameras.into_iter().find(is_active))
        .map(|(transform, _, frustum)| (transform.translation(), frustum.cloned()))
}

/// Updates the LOD, patches and plans of all planes.
#[allow(clippy::type_complexity)]
pub(crate) fn update_tessellation(
    time: Res<Time>,
    plugin_settings: Res<TessellationPluginSettings>,
    debug: Option<Res<DebugTessellation>>,
    marked_views: Query<CameraItem, With<TessellationView>>,
    cameras: Query<CameraItem, (With<Camera3d>, Without<TessellationView>)>,
    mut planes: Query<(
        &TessellatedPlane,
        &TessellationTextures,
        &GlobalTransform,
        &mut TessellationState,
    )>,
) {
    let view = select_view(&marked_views, &cameras);
    let freeze_lod = debug.is_some_and(|debug| debug.freeze_lod);

    for (plane, textures, transform, mut state) in &mut planes {
        let world_from_local = transform.affine();

        let (camera, frustum) = view.unwrap_or_else(|| {
            let origin = Vec3::from(world_from_local.translation);
            (origin + Vec3::Y * FALLBACK_CAMERA_HEIGHT, None)
        });

        let view = PlaneView {
            world_from_local,
            camera,
            frustum: frustum.as_ref().map(|frustum| frustum as &dyn ViewFrustum),
            delta_seconds: time.delta_secs(),
            elapsed_seconds: time.elapsed_secs(),
            freeze_lod,
        };

        state.update(plane, textures, &view, &plugin_settings);
    }
}
