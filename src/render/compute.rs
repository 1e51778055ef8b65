//! The four compute stages generating the mesh buffers.
//!
//! Every regenerated mesh or patch becomes a [`TessellationJob`] during preparation. The
//! [`TessellationComputeNode`] records all jobs of a frame into a single command encoder, with one
//! compute pass per stage, so every stage observes the complete output of the previous one.

use crate::{
    error::{TessellationError, TessellationResult},
    plan::{GenerationKey, MeshPlan},
    render::{
        buffers::{GpuTessellation, MeshBuffers},
        ExtractedTessellation, ExtractedTextures,
    },
    resolution::{segments, workgroups_1d, workgroups_2d},
    settings::{NormalMethod, TessellationSettings},
    shaders::{
        CALCULATE_NORMALS_SHADER, DISPLACE_SHADER, GENERATE_INDICES_SHADER,
        GENERATE_VERTICES_SHADER,
    },
    tessellation::{log_plane, TessellationComponents, TessellationPluginSettings},
    util::GpuBuffer,
};
use bevy::{
    prelude::*,
    render::{
        render_asset::RenderAssets,
        render_graph::{self, RenderLabel},
        render_resource::{
            binding_types::{sampler, storage_buffer_sized, texture_2d, uniform_buffer},
            *,
        },
        renderer::{RenderContext, RenderDevice},
        texture::{FallbackImage, GpuImage},
    },
};
use itertools::Itertools;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    #[repr(transparent)]
    pub struct TessellationPipelineKey: u32 {
        const NONE      = 0;
        const VERTICES  = 1 << 0;
        const DISPLACE  = 1 << 1;
        const NORMALS   = 1 << 2;
        const INDICES   = 1 << 3;
        const SINE_WAVE = 1 << 4;
        const MASK      = 1 << 5;
        const STAGES    = Self::VERTICES.bits() | Self::DISPLACE.bits() | Self::NORMALS.bits() | Self::INDICES.bits();
    }
}

impl TessellationPipelineKey {
    pub fn from_settings(settings: &TessellationSettings, has_mask: bool) -> Self {
        let mut key = TessellationPipelineKey::NONE;

        if settings.use_sine_wave {
            key |= TessellationPipelineKey::SINE_WAVE;
        }
        if has_mask {
            key |= TessellationPipelineKey::MASK;
        }

        key
    }

    pub fn shader_defs(&self) -> Vec<ShaderDefVal> {
        let mut shader_defs = Vec::new();

        if self.contains(TessellationPipelineKey::SINE_WAVE) {
            shader_defs.push("SINE_WAVE".into());
        }
        if self.contains(TessellationPipelineKey::MASK) {
            shader_defs.push("MASK".into());
        }

        shader_defs
    }
}

/// The compute stages in their dispatch order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComputeStage {
    GenerateVertices,
    Displace,
    CalculateNormals,
    GenerateIndices,
}

impl ComputeStage {
    pub const ALL: [ComputeStage; 4] = [
        ComputeStage::GenerateVertices,
        ComputeStage::Displace,
        ComputeStage::CalculateNormals,
        ComputeStage::GenerateIndices,
    ];

    pub fn label(self) -> &'static str {
        match self {
            ComputeStage::GenerateVertices => "generate_vertices",
            ComputeStage::Displace => "displace",
            ComputeStage::CalculateNormals => "calculate_normals",
            ComputeStage::GenerateIndices => "generate_indices",
        }
    }

    fn key(self) -> TessellationPipelineKey {
        match self {
            ComputeStage::GenerateVertices => TessellationPipelineKey::VERTICES,
            ComputeStage::Displace => TessellationPipelineKey::DISPLACE,
            ComputeStage::CalculateNormals => TessellationPipelineKey::NORMALS,
            ComputeStage::GenerateIndices => TessellationPipelineKey::INDICES,
        }
    }

    fn from_key(key: TessellationPipelineKey) -> Option<Self> {
        ComputeStage::ALL
            .into_iter()
            .find(|stage| key.contains(stage.key()))
    }

    /// The workgroup count covering a grid with the given resolution.
    pub fn workgroups(self, resolution: UVec2) -> UVec3 {
        match self {
            ComputeStage::GenerateVertices => workgroups_2d(resolution).extend(1),
            ComputeStage::Displace | ComputeStage::CalculateNormals => {
                UVec3::new(workgroups_1d(resolution.x * resolution.y), 1, 1)
            }
            ComputeStage::GenerateIndices => workgroups_2d(segments(resolution)).extend(1),
        }
    }
}

/// The parameters shared by all stages.
#[derive(Clone, Debug, Default, PartialEq, ShaderType)]
pub struct TessellationParams {
    pub resolution: UVec2,
    pub vertex_count: u32,
    pub index_count: u32,
    pub plane_size: Vec2,
    pub uv_offset: Vec2,
    pub uv_scale: Vec2,
    /// The uv distance used for finite differences.
    pub texel_size: Vec2,
    pub patch_offset: Vec3,
    pub displacement_intensity: f32,
    pub displacement_offset: f32,
    pub normal_method: u32,
    pub normal_smoothing: f32,
    pub invert_normals: u32,
    pub edge_collapse: UVec4,
}

impl TessellationParams {
    /// Composes the parameters of a plan. Without a displacement texture the finite differences
    /// step one grid cell.
    pub fn new(
        settings: &TessellationSettings,
        plan: &MeshPlan,
        displacement_size: Option<UVec2>,
    ) -> Self {
        let texel_size = match displacement_size {
            Some(size) if !settings.use_sine_wave && size.max_element() > 0 => {
                Vec2::splat(1.0 / size.max_element() as f32)
            }
            _ => plan.uv_scale / segments(plan.resolution).max(UVec2::ONE).as_vec2(),
        };

        Self {
            resolution: plan.resolution,
            vertex_count: plan.vertex_count(),
            index_count: plan.index_count(),
            plane_size: settings.plane_size,
            uv_offset: plan.uv_offset,
            uv_scale: plan.uv_scale,
            texel_size,
            patch_offset: plan.patch_offset,
            displacement_intensity: settings.displacement_intensity,
            displacement_offset: settings.displacement_offset,
            normal_method: settings.normal_method.shader_index(),
            normal_smoothing: settings.normal_smoothing,
            invert_normals: settings.invert_normals as u32,
            edge_collapse: plan.edge_collapse.as_uvec4(),
        }
    }
}

/// The texture views bound to the texture group, unbound or non resident textures resolve to the
/// white fallback image.
pub struct ResolvedTextures<'a> {
    pub displacement: &'a TextureView,
    pub mask: &'a TextureView,
    pub normal_map: &'a TextureView,
    pub displacement_size: Option<UVec2>,
    /// Whether a resident mask is bound, a missing mask is not subtracted.
    pub has_mask: bool,
}

impl<'a> ResolvedTextures<'a> {
    pub fn new(
        textures: &ExtractedTextures,
        images: &'a RenderAssets<GpuImage>,
        fallback: &'a FallbackImage,
    ) -> Self {
        let resolve = |id: Option<AssetId<Image>>| id.and_then(|id| images.get(id));

        let displacement = resolve(textures.displacement);
        let mask = resolve(textures.mask);
        let view = |image: Option<&'a GpuImage>| {
            image.map_or(&fallback.d2.texture_view, |image| &image.texture_view)
        };

        Self {
            displacement: view(displacement),
            mask: view(mask),
            normal_map: view(resolve(textures.normal_map)),
            displacement_size: displacement.map(|image| image.size),
            has_mask: mask.is_some(),
        }
    }
}

/// The cached pipelines of the stages of one plane.
#[derive(Clone, Copy, Debug)]
pub struct StagePipelines {
    pub vertices: CachedComputePipelineId,
    pub displace: CachedComputePipelineId,
    /// Not present when normals are disabled.
    pub normals: Option<CachedComputePipelineId>,
    pub indices: CachedComputePipelineId,
}

enum Readiness {
    Ready,
    Pending,
    Failed(&'static str),
}

impl StagePipelines {
    fn specialize(
        pipeline_cache: &PipelineCache,
        compute_pipelines: &TessellationComputePipelines,
        pipelines: &mut SpecializedComputePipelines<TessellationComputePipelines>,
        key: TessellationPipelineKey,
        normal_method: NormalMethod,
    ) -> Self {
        let mut specialize = |stage: ComputeStage| {
            pipelines.specialize(pipeline_cache, compute_pipelines, key | stage.key())
        };

        Self {
            vertices: specialize(ComputeStage::GenerateVertices),
            displace: specialize(ComputeStage::Displace),
            normals: (normal_method != NormalMethod::Disabled)
                .then(|| specialize(ComputeStage::CalculateNormals)),
            indices: specialize(ComputeStage::GenerateIndices),
        }
    }

    pub fn get(&self, stage: ComputeStage) -> Option<CachedComputePipelineId> {
        match stage {
            ComputeStage::GenerateVertices => Some(self.vertices),
            ComputeStage::Displace => Some(self.displace),
            ComputeStage::CalculateNormals => self.normals,
            ComputeStage::GenerateIndices => Some(self.indices),
        }
    }

    fn readiness(&self, pipeline_cache: &PipelineCache) -> Readiness {
        let mut readiness = Readiness::Ready;

        for stage in ComputeStage::ALL {
            let Some(id) = self.get(stage) else {
                continue;
            };

            match pipeline_cache.get_compute_pipeline_state(id) {
                CachedPipelineState::Ok(_) => {}
                CachedPipelineState::Err(_) => return Readiness::Failed(stage.label()),
                _ => readiness = Readiness::Pending,
            }
        }

        readiness
    }
}

/// A prepared regeneration of one mesh or patch, recorded by the compute node this frame.
pub struct TessellationJob {
    pub entity: Entity,
    pub slot: usize,
    pub key: GenerationKey,
    pub level: i32,
    pub resolution: UVec2,
    pub buffers: MeshBuffers,
    pub pipelines: StagePipelines,
    mesh_bind_group: BindGroup,
    texture_bind_group: BindGroup,
}

/// The jobs recorded this frame.
#[derive(Resource, Default, Deref, DerefMut)]
pub struct TessellationJobs(pub Vec<TessellationJob>);

#[derive(Resource)]
pub struct TessellationComputePipelines {
    pub(crate) mesh_layout: BindGroupLayout,
    pub(crate) texture_layout: BindGroupLayout,
    sampler: Sampler,
    generate_vertices_shader: Handle<Shader>,
    displace_shader: Handle<Shader>,
    calculate_normals_shader: Handle<Shader>,
    generate_indices_shader: Handle<Shader>,
}

impl FromWorld for TessellationComputePipelines {
    fn from_world(world: &mut World) -> Self {
        let device = world.resource::<RenderDevice>();

        let mesh_layout = device.create_bind_group_layout(
            "tessellation_mesh_layout",
            &BindGroupLayoutEntries::sequential(
                ShaderStages::COMPUTE,
                (
                    uniform_buffer::<TessellationParams>(false),
                    storage_buffer_sized(false, None), // positions
                    storage_buffer_sized(false, None), // normals
                    storage_buffer_sized(false, None), // uvs
                    storage_buffer_sized(false, None), // indices
                ),
            ),
        );

        let texture_layout = device.create_bind_group_layout(
            "tessellation_texture_layout",
            &BindGroupLayoutEntries::sequential(
                ShaderStages::COMPUTE,
                (
                    texture_2d(TextureSampleType::Float { filterable: true }), // displacement
                    texture_2d(TextureSampleType::Float { filterable: true }), // mask
                    texture_2d(TextureSampleType::Float { filterable: true }), // normal map
                    sampler(SamplerBindingType::Filtering),
                ),
            ),
        );

        let sampler = device.create_sampler(&SamplerDescriptor {
            label: Some("tessellation_sampler"),
            address_mode_u: AddressMode::ClampToEdge,
            address_mode_v: AddressMode::ClampToEdge,
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Linear,
            ..default()
        });

        Self {
            mesh_layout,
            texture_layout,
            sampler,
            generate_vertices_shader: world.load_asset(GENERATE_VERTICES_SHADER),
            displace_shader: world.load_asset(DISPLACE_SHADER),
            calculate_normals_shader: world.load_asset(CALCULATE_NORMALS_SHADER),
            generate_indices_shader: world.load_asset(GENERATE_INDICES_SHADER),
        }
    }
}

impl SpecializedComputePipeline for TessellationComputePipelines {
    type Key = TessellationPipelineKey;

    fn specialize(&self, key: Self::Key) -> ComputePipelineDescriptor {
        let stage = ComputeStage::from_key(key).unwrap_or(ComputeStage::GenerateVertices);

        let shader = match stage {
            ComputeStage::GenerateVertices => self.generate_vertices_shader.clone(),
            ComputeStage::Displace => self.displace_shader.clone(),
            ComputeStage::CalculateNormals => self.calculate_normals_shader.clone(),
            ComputeStage::GenerateIndices => self.generate_indices_shader.clone(),
        };

        ComputePipelineDescriptor {
            label: Some(format!("tessellation_{}_pipeline", stage.label()).into()),
            layout: vec![self.mesh_layout.clone(), self.texture_layout.clone()],
            push_constant_ranges: default(),
            shader,
            shader_defs: key.shader_defs(),
            entry_point: stage.label().into(),
            zero_initialize_workgroup_memory: false,
        }
    }
}

/// Validates the plan, allocates a fresh buffer set and creates the bind groups of its stages.
#[allow(clippy::too_many_arguments)]
pub fn prepare_mesh_job(
    device: &RenderDevice,
    compute_pipelines: &TessellationComputePipelines,
    pipelines: StagePipelines,
    settings: &TessellationSettings,
    plan: &MeshPlan,
    key: GenerationKey,
    textures: &ResolvedTextures,
    (entity, slot): (Entity, usize),
) -> TessellationResult<TessellationJob> {
    plan.validate()?;

    let buffers = MeshBuffers::new(device, plan.resolution)?;

    let params = TessellationParams::new(settings, plan, textures.displacement_size);
    let params = GpuBuffer::create_labeled("tessellation_params", device, &params);

    let mesh_bind_group = device.create_bind_group(
        "tessellation_mesh_bind_group",
        &compute_pipelines.mesh_layout,
        &BindGroupEntries::sequential((
            &params,
            buffers.positions.as_entire_binding(),
            buffers.normals.as_entire_binding(),
            buffers.uvs.as_entire_binding(),
            buffers.indices.as_entire_binding(),
        )),
    );

    let texture_bind_group = device.create_bind_group(
        "tessellation_texture_bind_group",
        &compute_pipelines.texture_layout,
        &BindGroupEntries::sequential((
            textures.displacement,
            textures.mask,
            textures.normal_map,
            &compute_pipelines.sampler,
        )),
    );

    Ok(TessellationJob {
        entity,
        slot,
        key,
        level: plan.level,
        resolution: plan.resolution,
        buffers,
        pipelines,
        mesh_bind_group,
        texture_bind_group,
    })
}

/// Turns every visible slot whose generation key changed into a job, at most
/// [`TessellationPluginSettings::max_jobs_per_frame`] per frame. Planes that do not fit are
/// deferred as a whole.
#[allow(clippy::too_many_arguments)]
pub(crate) fn prepare_tessellation_jobs(
    device: Res<RenderDevice>,
    pipeline_cache: Res<PipelineCache>,
    compute_pipelines: Res<TessellationComputePipelines>,
    mut pipelines: ResMut<SpecializedComputePipelines<TessellationComputePipelines>>,
    plugin_settings: Res<TessellationPluginSettings>,
    images: Res<RenderAssets<GpuImage>>,
    fallback: Res<FallbackImage>,
    extracted: Res<TessellationComponents<ExtractedTessellation>>,
    mut gpu_tessellations: ResMut<TessellationComponents<GpuTessellation>>,
    mut jobs: ResMut<TessellationJobs>,
) {
    jobs.clear();

    for (&entity, plane) in extracted.iter() {
        let Some(gpu_tessellation) = gpu_tessellations.get_mut(&entity) else {
            continue;
        };

        let settings = &plane.settings;
        let textures = ResolvedTextures::new(&plane.textures, &images, &fallback);
        let key = TessellationPipelineKey::from_settings(settings, textures.has_mask);
        let stages = StagePipelines::specialize(
            &pipeline_cache,
            &compute_pipelines,
            &mut pipelines,
            key,
            settings.normal_method,
        );

        let pending = gpu_tessellation
            .slots
            .iter_mut()
            .zip(&plane.plans)
            .enumerate()
            .filter(|(_, (slot, plan))| {
                plan.visible && slot.needs_generation(&plan.key(plane.revision))
            })
            .collect_vec();

        match stages.readiness(&pipeline_cache) {
            Readiness::Ready => {}
            // retried next frame
            Readiness::Pending => continue,
            Readiness::Failed(stage) => {
                let error = TessellationError::MissingPipeline(stage);

                for (_, (slot, plan)) in pending {
                    let generation_key = plan.key(plane.revision);
                    slot.fail(generation_key, &error, settings.failure_policy, entity, plan.index);
                }

                continue;
            }
        }

        // the patches of a plane share seams and are only scheduled together
        if !fits_job_budget(jobs.len(), pending.len(), plugin_settings.max_jobs_per_frame) {
            break;
        }

        for (index, (slot, plan)) in pending {
            let generation_key = plan.key(plane.revision);

            match prepare_mesh_job(
                &device,
                &compute_pipelines,
                stages,
                settings,
                plan,
                generation_key,
                &textures,
                (entity, index),
            ) {
                Ok(job) => {
                    log_plane(
                        plane.debug_logging,
                        format_args!(
                            "Regenerating slot {index} of {entity} at level {} with resolution {}.",
                            plan.level, plan.resolution
                        ),
                    );
                    jobs.push(job);
                }
                Err(error) => {
                    slot.fail(generation_key, &error, settings.failure_policy, entity, plan.index)
                }
            }
        }
    }
}

/// Whether all pending jobs of a plane fit into the remaining budget of the frame. A plane
/// exceeding the whole budget is still scheduled when it comes first.
fn fits_job_budget(scheduled: usize, pending: usize, max_jobs: usize) -> bool {
    pending == 0 || scheduled == 0 || scheduled + pending <= max_jobs
}

#[derive(Debug, Hash, PartialEq, Eq, Clone, RenderLabel)]
pub struct TessellationComputeLabel;

/// Records the jobs of the frame, one compute pass per stage.
pub struct TessellationComputeNode;

impl render_graph::Node for TessellationComputeNode {
    fn run<'w>(
        &self,
        _graph: &mut render_graph::RenderGraphContext,
        context: &mut RenderContext<'w>,
        world: &'w World,
    ) -> Result<(), render_graph::NodeRunError> {
        let jobs = world.resource::<TessellationJobs>();
        let pipeline_cache = world.resource::<PipelineCache>();

        if jobs.is_empty() {
            return Ok(());
        }

        context.add_command_buffer_generation_task(move |device| {
            let mut encoder = device.create_command_encoder(&CommandEncoderDescriptor {
                label: Some("tessellation_compute_encoder"),
            });

            for stage in ComputeStage::ALL {
                let mut pass = encoder.begin_compute_pass(&ComputePassDescriptor {
                    label: Some(stage.label()),
                    ..default()
                });

                for job in jobs.iter() {
                    let Some(pipeline) = job
                        .pipelines
                        .get(stage)
                        .and_then(|id| pipeline_cache.get_compute_pipeline(id))
                    else {
                        continue;
                    };

                    let workgroups = stage.workgroups(job.resolution);

                    pass.set_pipeline(pipeline);
                    pass.set_bind_group(0, &job.mesh_bind_group, &[]);
                    pass.set_bind_group(1, &job.texture_bind_group, &[]);
                    pass.dispatch_workgroups(workgroups.x, workgroups.y, workgroups.z);
                }
            }

            encoder.finish()
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::EdgeCollapse;

    #[test]
    fn stage_keys() {
        let key = TessellationPipelineKey::SINE_WAVE | TessellationPipelineKey::DISPLACE;

        assert_eq!(ComputeStage::from_key(key), Some(ComputeStage::Displace));
        assert_eq!(ComputeStage::from_key(TessellationPipelineKey::MASK), None);
        assert_eq!(key.shader_defs().len(), 1);
        assert!(TessellationPipelineKey::STAGES.contains(TessellationPipelineKey::NORMALS));
    }

    #[test]
    fn workgroups_cover_the_grid() {
        let resolution = UVec2::splat(65);

        assert_eq!(
            ComputeStage::GenerateVertices.workgroups(resolution),
            UVec3::new(9, 9, 1)
        );
        assert_eq!(
            ComputeStage::Displace.workgroups(resolution),
            UVec3::new(67, 1, 1)
        );
        assert_eq!(
            ComputeStage::GenerateIndices.workgroups(resolution),
            UVec3::new(8, 8, 1)
        );
    }

    #[test]
    fn params_from_plan() {
        let settings = TessellationSettings {
            use_sine_wave: true,
            invert_normals: true,
            ..default()
        };
        let plan = MeshPlan {
            edge_collapse: EdgeCollapse {
                north: 2,
                ..EdgeCollapse::NONE
            },
            ..MeshPlan::single(&settings, 16)
        };

        let params = TessellationParams::new(&settings, &plan, Some(UVec2::new(512, 256)));

        assert_eq!(params.resolution, UVec2::splat(65));
        assert_eq!(params.vertex_count, 65 * 65);
        assert_eq!(params.index_count, 64 * 64 * 6);
        assert_eq!(params.invert_normals, 1);
        assert_eq!(params.edge_collapse, UVec4::new(1, 1, 1, 2));
        // the sine wave ignores the texture resolution
        assert_eq!(params.texel_size, Vec2::splat(1.0 / 64.0));

        let settings = TessellationSettings {
            use_sine_wave: false,
            ..default()
        };
        let params = TessellationParams::new(&settings, &plan, Some(UVec2::new(512, 256)));
        assert_eq!(params.texel_size, Vec2::splat(1.0 / 512.0));

        let params = TessellationParams::new(&settings, &plan, None);
        assert_eq!(params.texel_size, Vec2::splat(1.0 / 64.0));
    }

    #[test]
    fn job_budget_keeps_planes_whole() {
        // 16 patches do not fit behind 250 scheduled jobs
        assert!(!fits_job_budget(250, 16, 256));
        assert!(fits_job_budget(240, 16, 256));
        // a plane larger than the budget is not starved
        assert!(fits_job_budget(0, 300, 256));
        assert!(fits_job_budget(256, 0, 256));
    }
}
