use bevy::{asset::embedded_asset, prelude::*};
use itertools::Itertools;

pub const DEFAULT_VERTEX_SHADER: &str =
    "embedded://bevy_gpu_tessellation/shaders/render/vertex.wgsl";
pub const DEFAULT_FRAGMENT_SHADER: &str =
    "embedded://bevy_gpu_tessellation/shaders/render/fragment.wgsl";
pub(crate) const GENERATE_VERTICES_SHADER: &str =
    "embedded://bevy_gpu_tessellation/shaders/compute/generate_vertices.wgsl";
pub(crate) const DISPLACE_SHADER: &str =
    "embedded://bevy_gpu_tessellation/shaders/compute/displace.wgsl";
pub(crate) const CALCULATE_NORMALS_SHADER: &str =
    "embedded://bevy_gpu_tessellation/shaders/compute/calculate_normals.wgsl";
pub(crate) const GENERATE_INDICES_SHADER: &str =
    "embedded://bevy_gpu_tessellation/shaders/compute/generate_indices.wgsl";

/// Keeps the imported shader modules alive, so that the pipelines can resolve their imports.
#[derive(Default, Resource)]
pub(crate) struct InternalShaders(Vec<Handle<Shader>>);

impl InternalShaders {
    pub(crate) fn load(app: &mut App, shaders: &[&'static str]) {
        let mut shaders = shaders
            .iter()
            .map(|&shader| app.world_mut().resource::<AssetServer>().load(shader))
            .collect_vec();

        let mut internal_shaders = app.world_mut().resource_mut::<InternalShaders>();
        internal_shaders.0.append(&mut shaders);
    }
}

pub(crate) fn load_tessellation_shaders(app: &mut App) {
    embedded_asset!(app, "types.wgsl");
    embedded_asset!(app, "bindings.wgsl");
    embedded_asset!(app, "functions.wgsl");
    embedded_asset!(app, "compute/generate_vertices.wgsl");
    embedded_asset!(app, "compute/displace.wgsl");
    embedded_asset!(app, "compute/calculate_normals.wgsl");
    embedded_asset!(app, "compute/generate_indices.wgsl");
    embedded_asset!(app, "render/bindings.wgsl");
    embedded_asset!(app, "render/vertex.wgsl");
    embedded_asset!(app, "render/fragment.wgsl");

    app.init_resource::<InternalShaders>();

    InternalShaders::load(
        app,
        &[
            "embedded://bevy_gpu_tessellation/shaders/types.wgsl",
            "embedded://bevy_gpu_tessellation/shaders/bindings.wgsl",
            "embedded://bevy_gpu_tessellation/shaders/functions.wgsl",
            "embedded://bevy_gpu_tessellation/shaders/render/bindings.wgsl",
        ],
    );
}
