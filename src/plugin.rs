use crate::{
    render::{
        buffers::{
            prepare_gpu_tessellations, promote_tessellation_jobs, GpuTessellation,
            TessellationDrawLayout,
        },
        compute::{
            prepare_tessellation_jobs, TessellationComputeLabel, TessellationComputeNode,
            TessellationComputePipelines, TessellationJobs,
        },
        draw::{extract_tessellation_phases, TessellationItem, TessellationPass, TessellationPassLabel},
        extract_tessellation, ExtractedTessellation,
    },
    settings::TessellationSettings,
    shaders::load_tessellation_shaders,
    tessellation::{
        apply_settings_assets, track_texture_changes, update_tessellation, TessellatedPlane,
        TessellationComponents, TessellationPluginSettings, TessellationSettingsHandle,
        TessellationState, TessellationTextures, TessellationView,
    },
};
use bevy::{
    core_pipeline::core_3d::graph::{Core3d, Node3d},
    prelude::*,
    render::{
        extract_resource::ExtractResourcePlugin,
        graph::CameraDriverLabel,
        render_graph::{RenderGraph, RenderGraphApp, ViewNodeRunner},
        render_phase::{sort_phase_system, DrawFunctions, ViewSortedRenderPhases},
        render_resource::SpecializedComputePipelines,
        view::VisibilitySystems,
        Render, RenderApp, RenderSet,
    },
    transform::TransformSystem,
};
use bevy_common_assets::ron::RonAssetPlugin;

/// Label of the main world system evaluating the LOD and planning the meshes.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, SystemSet)]
pub struct TessellationUpdateSet;

/// The plugin for GPU tessellated planes.
///
/// Planes are only drawn once a [`TessellationMaterialPlugin`](crate::render::draw::TessellationMaterialPlugin)
/// is added for their material.
#[derive(Default)]
pub struct TessellationPlugin {
    pub settings: TessellationPluginSettings,
}

impl Plugin for TessellationPlugin {
    fn build(&self, app: &mut App) {
        app.add_plugins((
            RonAssetPlugin::<TessellationSettings>::new(&["tess.ron"]),
            ExtractResourcePlugin::<TessellationPluginSettings>::default(),
        ))
        .insert_resource(self.settings.clone())
        .register_type::<TessellatedPlane>()
        .register_type::<TessellationState>()
        .register_type::<TessellationTextures>()
        .register_type::<TessellationView>()
        .register_type::<TessellationSettingsHandle>()
        .register_type::<TessellationPluginSettings>()
        .add_systems(
            PostUpdate,
            (
                (apply_settings_assets, track_texture_changes),
                update_tessellation.in_set(TessellationUpdateSet),
            )
                .chain()
                .after(TransformSystem::TransformPropagate)
                .after(VisibilitySystems::UpdateFrusta),
        );

        let Some(render_app) = app.get_sub_app_mut(RenderApp) else {
            return;
        };

        render_app
            .init_resource::<TessellationComponents<ExtractedTessellation>>()
            .init_resource::<TessellationComponents<GpuTessellation>>()
            .init_resource::<TessellationJobs>()
            .init_resource::<DrawFunctions<TessellationItem>>()
            .init_resource::<ViewSortedRenderPhases<TessellationItem>>()
            .add_systems(
                ExtractSchedule,
                (extract_tessellation, extract_tessellation_phases),
            )
            .add_systems(
                Render,
                (
                    (prepare_gpu_tessellations, prepare_tessellation_jobs)
                        .chain()
                        .in_set(RenderSet::PrepareResources),
                    promote_tessellation_jobs.in_set(RenderSet::PrepareBindGroups),
                    sort_phase_system::<TessellationItem>.in_set(RenderSet::PhaseSort),
                ),
            )
            .add_render_graph_node::<ViewNodeRunner<TessellationPass>>(Core3d, TessellationPassLabel)
            .add_render_graph_edges(
                Core3d,
                (
                    Node3d::MainOpaquePass,
                    TessellationPassLabel,
                    Node3d::MainTransmissivePass,
                ),
            );

        let mut render_graph = render_app.world_mut().resource_mut::<RenderGraph>();
        render_graph.add_node(TessellationComputeLabel, TessellationComputeNode);
        render_graph.add_node_edge(TessellationComputeLabel, CameraDriverLabel);
    }

    fn finish(&self, app: &mut App) {
        load_tessellation_shaders(app);

        let Some(render_app) = app.get_sub_app_mut(RenderApp) else {
            return;
        };

        render_app
            .init_resource::<TessellationDrawLayout>()
            .init_resource::<TessellationComputePipelines>()
            .init_resource::<SpecializedComputePipelines<TessellationComputePipelines>>();
    }
}
