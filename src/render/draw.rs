//! Draws the generated buffers with a material.
//!
//! Every drawable slot of a plane becomes a [`TessellationItem`] in the views of all active 3d
//! cameras. The items are drawn by the [`TessellationPass`] right after the main opaque pass,
//! using the vertex and index buffers of the slot directly.

use crate::{
    debug::DebugTessellation,
    render::buffers::{
        GpuTessellation, TessellationDrawLayout, NORMAL_STRIDE, POSITION_STRIDE, UV_STRIDE,
    },
    shaders::{DEFAULT_FRAGMENT_SHADER, DEFAULT_VERTEX_SHADER},
    tessellation::TessellationComponents,
};
use bevy::{
    core_pipeline::core_3d::CORE_3D_DEPTH_FORMAT,
    ecs::{
        entity::EntityHashSet,
        query::{QueryItem, ROQueryItem},
        system::{lifetimeless::SRes, SystemParamItem},
    },
    math::FloatOrd,
    pbr::{
        MaterialPipeline, MaterialPlugin, MeshPipeline, MeshPipelineViewLayoutKey,
        PreparedMaterial, SetMeshViewBindGroup, MAX_CASCADES_PER_LIGHT, MAX_DIRECTIONAL_LIGHTS,
    },
    prelude::*,
    render::{
        camera::ExtractedCamera,
        render_asset::{prepare_assets, RenderAssetPlugin, RenderAssets},
        render_graph::{NodeRunError, RenderGraphContext, RenderLabel, ViewNode},
        render_phase::{
            AddRenderCommand, CachedRenderPipelinePhaseItem, DrawFunctionId, DrawFunctions,
            PhaseItem, PhaseItemExtraIndex, RenderCommand, RenderCommandResult, SetItemPipeline,
            SortedPhaseItem, TrackedRenderPass, ViewSortedRenderPhases,
        },
        render_resource::*,
        renderer::{RenderContext, RenderDevice},
        sync_world::{MainEntity, RenderEntity},
        texture::GpuImage,
        view::{ExtractedView, ViewDepthTexture, ViewTarget},
        Extract, Render, RenderApp, RenderSet,
    },
};
use derive_more::derive::From;
use std::{hash::Hash, marker::PhantomData, ops::Range};

/// The material used to draw a tessellated plane.
#[derive(Component, Clone, Debug, Deref, DerefMut, Reflect, PartialEq, Eq, From)]
#[reflect(Component, Default)]
pub struct TessellationMaterial<M: Material>(pub Handle<M>);

impl<M: Material> Default for TessellationMaterial<M> {
    fn default() -> Self {
        Self(Handle::default())
    }
}

/// A single mesh or patch in a view, the extra index is the slot of the plane.
pub struct TessellationItem {
    pub representative_entity: (Entity, MainEntity),
    pub draw_function: DrawFunctionId,
    pub pipeline: CachedRenderPipelineId,
    pub batch_range: Range<u32>,
    pub extra_index: PhaseItemExtraIndex,
    pub distance: f32,
}

impl PhaseItem for TessellationItem {
    const AUTOMATIC_BATCHING: bool = false;

    #[inline]
    fn entity(&self) -> Entity {
        self.representative_entity.0
    }

    #[inline]
    fn main_entity(&self) -> MainEntity {
        self.representative_entity.1
    }

    #[inline]
    fn draw_function(&self) -> DrawFunctionId {
        self.draw_function
    }

    #[inline]
    fn batch_range(&self) -> &Range<u32> {
        &self.batch_range
    }

    fn batch_range_mut(&mut self) -> &mut Range<u32> {
        &mut self.batch_range
    }

    fn extra_index(&self) -> PhaseItemExtraIndex {
        self.extra_index
    }

    fn batch_range_and_extra_index_mut(&mut self) -> (&mut Range<u32>, &mut PhaseItemExtraIndex) {
        (&mut self.batch_range, &mut self.extra_index)
    }
}

impl SortedPhaseItem for TessellationItem {
    type SortKey = FloatOrd;

    // front to back
    fn sort_key(&self) -> Self::SortKey {
        FloatOrd(self.distance)
    }
}

impl CachedRenderPipelinePhaseItem for TessellationItem {
    fn cached_pipeline(&self) -> CachedRenderPipelineId {
        self.pipeline
    }
}

pub fn extract_tessellation_phases(
    cameras_3d: Extract<Query<(RenderEntity, &Camera), With<Camera3d>>>,
    mut live_entities: Local<EntityHashSet>,
    mut phases: ResMut<ViewSortedRenderPhases<TessellationItem>>,
) {
    live_entities.clear();

    for (entity, camera) in &cameras_3d {
        if !camera.is_active {
            continue;
        }

        phases.insert_or_clear(entity);
        live_entities.insert(entity);
    }

    phases.retain(|entity, _| live_entities.contains(entity));
}

fn extract_tessellation_materials<M: Material>(
    mut material_instances: ResMut<TessellationComponents<AssetId<M>>>,
    query: Extract<Query<(Entity, &InheritedVisibility, &TessellationMaterial<M>)>>,
) {
    material_instances.clear();

    for (entity, visibility, material) in &query {
        if visibility.get() {
            material_instances.insert(entity, material.id());
        }
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    #[repr(transparent)]
    pub struct TessellationPipelineFlags: u32 {
        const NONE               = 0;
        const WIREFRAME          = 1 << 0;
        const HDR                = 1 << 1;
        const MSAA_RESERVED_BITS = TessellationPipelineFlags::MSAA_MASK_BITS << TessellationPipelineFlags::MSAA_SHIFT_BITS;
    }
}

impl TessellationPipelineFlags {
    const MSAA_MASK_BITS: u32 = 0b111111;
    const MSAA_SHIFT_BITS: u32 = 32 - 6;

    pub fn from_msaa_samples(msaa_samples: u32) -> Self {
        let msaa_bits =
            ((msaa_samples.max(1) - 1) & Self::MSAA_MASK_BITS) << Self::MSAA_SHIFT_BITS;
        Self::from_bits_retain(msaa_bits)
    }

    pub fn from_debug(debug: &DebugTessellation) -> Self {
        let mut flags = TessellationPipelineFlags::NONE;

        if debug.wireframe {
            flags |= TessellationPipelineFlags::WIREFRAME;
        }

        flags
    }

    pub fn msaa_samples(&self) -> u32 {
        ((self.bits() >> Self::MSAA_SHIFT_BITS) & Self::MSAA_MASK_BITS) + 1
    }

    pub fn polygon_mode(&self) -> PolygonMode {
        match self.contains(TessellationPipelineFlags::WIREFRAME) {
            true => PolygonMode::Line,
            false => PolygonMode::Fill,
        }
    }

    pub fn target_format(&self) -> TextureFormat {
        match self.contains(TessellationPipelineFlags::HDR) {
            true => ViewTarget::TEXTURE_FORMAT_HDR,
            false => TextureFormat::bevy_default(),
        }
    }
}

pub struct TessellationRenderKey<M: Material> {
    pub flags: TessellationPipelineFlags,
    pub bind_group_data: M::Data,
}

impl<M: Material> Eq for TessellationRenderKey<M> where M::Data: PartialEq {}

impl<M: Material> PartialEq for TessellationRenderKey<M>
where
    M::Data: PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        self.flags == other.flags && self.bind_group_data == other.bind_group_data
    }
}

impl<M: Material> Clone for TessellationRenderKey<M>
where
    M::Data: Clone,
{
    fn clone(&self) -> Self {
        Self {
            flags: self.flags,
            bind_group_data: self.bind_group_data.clone(),
        }
    }
}

impl<M: Material> Hash for TessellationRenderKey<M>
where
    M::Data: Hash,
{
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.flags.hash(state);
        self.bind_group_data.hash(state);
    }
}

fn vertex_buffer_layout(
    stride: BufferAddress,
    format: VertexFormat,
    location: u32,
) -> VertexBufferLayout {
    VertexBufferLayout {
        array_stride: stride,
        step_mode: VertexStepMode::Vertex,
        attributes: vec![VertexAttribute {
            format,
            offset: 0,
            shader_location: location,
        }],
    }
}

/// The pipeline drawing the generated buffers with the material `M`.
///
/// The default shaders expect the bindings of a [`StandardMaterial`], other materials have to
/// provide their own shaders.
#[derive(Resource)]
pub struct TessellationRenderPipeline<M: Material> {
    view_layout: BindGroupLayout,
    view_layout_multisampled: BindGroupLayout,
    draw_layout: BindGroupLayout,
    material_layout: BindGroupLayout,
    vertex_shader: Handle<Shader>,
    fragment_shader: Handle<Shader>,
    marker: PhantomData<M>,
}

impl<M: Material> FromWorld for TessellationRenderPipeline<M> {
    fn from_world(world: &mut World) -> Self {
        let device = world.resource::<RenderDevice>();
        let mesh_pipeline = world.resource::<MeshPipeline>();
        let draw_layout = world.resource::<TessellationDrawLayout>();

        let vertex_shader = match M::vertex_shader() {
            ShaderRef::Default => world.load_asset(DEFAULT_VERTEX_SHADER),
            ShaderRef::Handle(handle) => handle,
            ShaderRef::Path(path) => world.load_asset(path),
        };

        let fragment_shader = match M::fragment_shader() {
            ShaderRef::Default => world.load_asset(DEFAULT_FRAGMENT_SHADER),
            ShaderRef::Handle(handle) => handle,
            ShaderRef::Path(path) => world.load_asset(path),
        };

        Self {
            view_layout: mesh_pipeline
                .get_view_layout(MeshPipelineViewLayoutKey::empty())
                .clone(),
            view_layout_multisampled: mesh_pipeline
                .get_view_layout(MeshPipelineViewLayoutKey::MULTISAMPLED)
                .clone(),
            draw_layout: draw_layout.0.clone(),
            material_layout: M::bind_group_layout(device),
            vertex_shader,
            fragment_shader,
            marker: PhantomData,
        }
    }
}

impl<M: Material> SpecializedRenderPipeline for TessellationRenderPipeline<M>
where
    M::Data: PartialEq + Eq + Hash + Clone,
{
    type Key = TessellationRenderKey<M>;

    fn specialize(&self, key: Self::Key) -> RenderPipelineDescriptor {
        let mut shader_defs = vec![
            ShaderDefVal::UInt(
                "MAX_DIRECTIONAL_LIGHTS".to_string(),
                MAX_DIRECTIONAL_LIGHTS as u32,
            ),
            ShaderDefVal::UInt(
                "MAX_CASCADES_PER_LIGHT".to_string(),
                MAX_CASCADES_PER_LIGHT as u32,
            ),
        ];

        let mut layout = match key.flags.msaa_samples() {
            1 => vec![self.view_layout.clone()],
            _ => {
                shader_defs.push("MULTISAMPLED".into());
                vec![self.view_layout_multisampled.clone()]
            }
        };

        layout.push(self.draw_layout.clone());
        layout.push(self.material_layout.clone());

        RenderPipelineDescriptor {
            label: Some("tessellation_render_pipeline".into()),
            layout,
            push_constant_ranges: default(),
            vertex: VertexState {
                shader: self.vertex_shader.clone(),
                entry_point: "vertex".into(),
                shader_defs: shader_defs.clone(),
                buffers: vec![
                    vertex_buffer_layout(POSITION_STRIDE, VertexFormat::Float32x4, 0),
                    vertex_buffer_layout(NORMAL_STRIDE, VertexFormat::Float32x4, 1),
                    vertex_buffer_layout(UV_STRIDE, VertexFormat::Float32x2, 2),
                ],
            },
            primitive: PrimitiveState {
                front_face: FrontFace::Ccw,
                cull_mode: Some(Face::Back),
                unclipped_depth: false,
                polygon_mode: key.flags.polygon_mode(),
                conservative: false,
                topology: PrimitiveTopology::TriangleList,
                strip_index_format: None,
            },
            fragment: Some(FragmentState {
                shader: self.fragment_shader.clone(),
                shader_defs,
                entry_point: "fragment".into(),
                targets: vec![Some(ColorTargetState {
                    format: key.flags.target_format(),
                    blend: Some(BlendState::REPLACE),
                    write_mask: ColorWrites::ALL,
                })],
            }),
            depth_stencil: Some(DepthStencilState {
                format: CORE_3D_DEPTH_FORMAT,
                depth_write_enabled: true,
                depth_compare: CompareFunction::GreaterEqual,
                stencil: StencilState::default(),
                bias: DepthBiasState::default(),
            }),
            multisample: MultisampleState {
                count: key.flags.msaa_samples(),
                mask: !0,
                alpha_to_coverage_enabled: false,
            },
            zero_initialize_workgroup_memory: false,
        }
    }
}

/// Binds the draw uniform of the slot.
pub struct SetTessellationDrawBindGroup<const I: usize>;

impl<const I: usize, P: PhaseItem> RenderCommand<P> for SetTessellationDrawBindGroup<I> {
    type Param = SRes<TessellationComponents<GpuTessellation>>;
    type ViewQuery = ();
    type ItemQuery = ();

    #[inline]
    fn render<'w>(
        item: &P,
        _: ROQueryItem<'w, Self::ViewQuery>,
        _: Option<ROQueryItem<'w, Self::ItemQuery>>,
        gpu_tessellations: SystemParamItem<'w, '_, Self::Param>,
        pass: &mut TrackedRenderPass<'w>,
    ) -> RenderCommandResult {
        let Some(draw) = gpu_tessellations
            .into_inner()
            .get(&item.main_entity().id())
            .and_then(|gpu_tessellation| gpu_tessellation.slots.get(item.extra_index().0 as usize))
            .and_then(|slot| slot.draw.as_ref())
        else {
            return RenderCommandResult::Skip;
        };

        pass.set_bind_group(I, &draw.bind_group, &[]);

        RenderCommandResult::Success
    }
}

/// Binds the prepared material of the plane.
pub struct SetTessellationMaterialBindGroup<M: Material, const I: usize>(PhantomData<M>);

impl<M: Material, const I: usize, P: PhaseItem> RenderCommand<P>
    for SetTessellationMaterialBindGroup<M, I>
{
    type Param = (
        SRes<RenderAssets<PreparedMaterial<M>>>,
        SRes<TessellationComponents<AssetId<M>>>,
    );
    type ViewQuery = ();
    type ItemQuery = ();

    #[inline]
    fn render<'w>(
        item: &P,
        _: ROQueryItem<'w, Self::ViewQuery>,
        _: Option<ROQueryItem<'w, Self::ItemQuery>>,
        (materials, material_instances): SystemParamItem<'w, '_, Self::Param>,
        pass: &mut TrackedRenderPass<'w>,
    ) -> RenderCommandResult {
        let Some(material) = material_instances
            .into_inner()
            .get(&item.main_entity().id())
            .and_then(|&id| materials.into_inner().get(id))
        else {
            return RenderCommandResult::Skip;
        };

        pass.set_bind_group(I, &material.bind_group, &[]);

        RenderCommandResult::Success
    }
}

/// Binds the vertex and index buffers of the slot and issues the draw call.
pub struct DrawTessellationMesh;

impl<P: PhaseItem> RenderCommand<P> for DrawTessellationMesh {
    type Param = SRes<TessellationComponents<GpuTessellation>>;
    type ViewQuery = ();
    type ItemQuery = ();

    #[inline]
    fn render<'w>(
        item: &P,
        _: ROQueryItem<'w, Self::ViewQuery>,
        _: Option<ROQueryItem<'w, Self::ItemQuery>>,
        gpu_tessellations: SystemParamItem<'w, '_, Self::Param>,
        pass: &mut TrackedRenderPass<'w>,
    ) -> RenderCommandResult {
        let Some(buffers) = gpu_tessellations
            .into_inner()
            .get(&item.main_entity().id())
            .and_then(|gpu_tessellation| gpu_tessellation.slots.get(item.extra_index().0 as usize))
            .and_then(|slot| slot.buffers.as_ref())
        else {
            return RenderCommandResult::Skip;
        };

        pass.set_vertex_buffer(0, buffers.positions.slice(..));
        pass.set_vertex_buffer(1, buffers.normals.slice(..));
        pass.set_vertex_buffer(2, buffers.uvs.slice(..));
        pass.set_index_buffer(buffers.indices.slice(..), 0, IndexFormat::Uint32);
        pass.draw_indexed(0..buffers.index_count, 0, 0..1);

        RenderCommandResult::Success
    }
}

/// The draw function of a tessellated plane. It sets the pipeline and the bind groups and then
/// draws the indexed slot.
pub(crate) type DrawTessellation<M> = (
    SetItemPipeline,
    SetMeshViewBindGroup<0>,
    SetTessellationDrawBindGroup<1>,
    SetTessellationMaterialBindGroup<M, 2>,
    DrawTessellationMesh,
);

/// Queues every drawable slot of all planes into the views.
#[allow(clippy::too_many_arguments)]
pub(crate) fn queue_tessellation<M: Material>(
    draw_functions: Res<DrawFunctions<TessellationItem>>,
    debug: Option<Res<DebugTessellation>>,
    render_materials: Res<RenderAssets<PreparedMaterial<M>>>,
    pipeline_cache: Res<PipelineCache>,
    render_pipeline: Res<TessellationRenderPipeline<M>>,
    mut pipelines: ResMut<SpecializedRenderPipelines<TessellationRenderPipeline<M>>>,
    mut phases: ResMut<ViewSortedRenderPhases<TessellationItem>>,
    gpu_tessellations: Res<TessellationComponents<GpuTessellation>>,
    material_instances: Res<TessellationComponents<AssetId<M>>>,
    views: Query<(Entity, &ExtractedView, &Msaa)>,
) where
    M::Data: PartialEq + Eq + Hash + Clone,
{
    let Some(draw_function) = draw_functions.read().get_id::<DrawTessellation<M>>() else {
        return;
    };

    for (render_view, view, msaa) in &views {
        let Some(phase) = phases.get_mut(&render_view) else {
            continue;
        };

        let view_position = view.world_from_view.translation();

        for (&entity, &material_id) in material_instances.iter() {
            let Some(gpu_tessellation) = gpu_tessellations.get(&entity) else {
                continue;
            };

            let Some(material) = render_materials.get(material_id) else {
                continue;
            };

            let mut flags = TessellationPipelineFlags::from_msaa_samples(msaa.samples());

            if view.hdr {
                flags |= TessellationPipelineFlags::HDR;
            }
            if let Some(debug) = &debug {
                flags |= TessellationPipelineFlags::from_debug(debug);
            }

            let key = TessellationRenderKey {
                flags,
                bind_group_data: material.key.clone(),
            };

            let pipeline = pipelines.specialize(&pipeline_cache, &render_pipeline, key);

            let distance =
                view_position.distance(gpu_tessellation.world_from_local.translation.into());

            for (slot, _) in gpu_tessellation.drawable_slots() {
                phase.add(TessellationItem {
                    representative_entity: (Entity::PLACEHOLDER, entity.into()),
                    draw_function,
                    pipeline,
                    batch_range: 0..1,
                    extra_index: PhaseItemExtraIndex(slot as u32),
                    distance,
                });
            }
        }
    }
}

#[derive(Debug, Hash, Default, PartialEq, Eq, Clone, RenderLabel)]
pub struct TessellationPassLabel;

/// Draws the tessellation phase of a view on top of the opaque geometry.
#[derive(Default)]
pub struct TessellationPass;

impl ViewNode for TessellationPass {
    type ViewQuery = (
        Entity,
        &'static ExtractedCamera,
        &'static ViewTarget,
        &'static ViewDepthTexture,
    );

    fn run<'w>(
        &self,
        _graph: &mut RenderGraphContext,
        render_context: &mut RenderContext<'w>,
        (view, camera, target, depth): QueryItem<'w, Self::ViewQuery>,
        world: &'w World,
    ) -> Result<(), NodeRunError> {
        let Some(phase) = world
            .get_resource::<ViewSortedRenderPhases<TessellationItem>>()
            .and_then(|phases| phases.get(&view))
        else {
            return Ok(());
        };

        if phase.items.is_empty() {
            return Ok(());
        }

        // call this here, otherwise the order between passes is incorrect
        let color_attachments = [Some(target.get_color_attachment())];
        let depth_stencil_attachment = Some(depth.get_attachment(StoreOp::Store));

        render_context.add_command_buffer_generation_task(move |device| {
            let mut encoder = device.create_command_encoder(&CommandEncoderDescriptor::default());

            let pass = encoder.begin_render_pass(&RenderPassDescriptor {
                label: Some("tessellation_pass"),
                color_attachments: &color_attachments,
                depth_stencil_attachment,
                ..default()
            });
            let mut pass = TrackedRenderPass::new(&device, pass);

            if let Some(viewport) = camera.viewport.as_ref() {
                pass.set_camera_viewport(viewport);
            }

            if let Err(error) = phase.render(&mut pass, world, view) {
                error!("Failed to render the tessellation phase: {error:?}");
            }

            drop(pass);

            encoder.finish()
        });

        Ok(())
    }
}

/// This plugin draws tessellated planes with the material `M`.
///
/// Add a [`TessellationMaterial<M>`] next to the [`TessellatedPlane`](crate::tessellation::TessellatedPlane).
pub struct TessellationMaterialPlugin<M: Material>(PhantomData<M>);

impl<M: Material> Default for TessellationMaterialPlugin<M> {
    fn default() -> Self {
        Self(Default::default())
    }
}

impl<M: Material> Plugin for TessellationMaterialPlugin<M>
where
    M::Data: PartialEq + Eq + Hash + Clone,
{
    fn build(&self, app: &mut App) {
        app.register_type::<TessellationMaterial<M>>();

        // the standard materials are already prepared by their own plugin
        if !app.is_plugin_added::<MaterialPlugin<M>>() {
            app.init_asset::<M>()
                .add_plugins(RenderAssetPlugin::<PreparedMaterial<M>, GpuImage>::default());
        }

        app.sub_app_mut(RenderApp)
            .add_render_command::<TessellationItem, DrawTessellation<M>>()
            .init_resource::<TessellationComponents<AssetId<M>>>()
            .init_resource::<SpecializedRenderPipelines<TessellationRenderPipeline<M>>>()
            .add_systems(ExtractSchedule, extract_tessellation_materials::<M>)
            .add_systems(
                Render,
                queue_tessellation::<M>
                    .in_set(RenderSet::QueueMeshes)
                    .after(prepare_assets::<PreparedMaterial<M>>),
            );
    }

    fn finish(&self, app: &mut App) {
        app.sub_app_mut(RenderApp)
            .init_resource::<TessellationRenderPipeline<M>>()
            .init_resource::<MaterialPipeline<M>>(); // prepare assets depends on this to access the material layout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_flags_store_msaa_samples() {
        for samples in [1, 2, 4, 8] {
            let flags = TessellationPipelineFlags::from_msaa_samples(samples)
                | TessellationPipelineFlags::WIREFRAME;

            assert_eq!(flags.msaa_samples(), samples);
            assert_eq!(flags.polygon_mode(), PolygonMode::Line);
        }

        let flags = TessellationPipelineFlags::from_debug(&DebugTessellation::default());
        assert_eq!(flags.msaa_samples(), 1);
        assert_eq!(flags.polygon_mode(), PolygonMode::Fill);
        assert_eq!(flags.target_format(), TextureFormat::bevy_default());
    }
}
