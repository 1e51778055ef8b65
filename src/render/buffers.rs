//! Ownership of the generated GPU geometry.
//!
//! Every plane owns one [`MeshSlot`] per mesh or patch. Jobs always generate into a freshly
//! allocated [`MeshBuffers`] set, which replaces the slot's set once the job is recorded. Buffers
//! are never mutated in place, so the previous set stays intact for anything still using it.

use crate::{
    debug::{level_color, DebugTessellation},
    error::{TessellationError, TessellationResult},
    plan::GenerationKey,
    render::{compute::TessellationJobs, ExtractedTessellation},
    resolution::{index_count, vertex_count},
    settings::FailurePolicy,
    tessellation::TessellationComponents,
    util::GpuBuffer,
};
use bevy::{
    math::Affine3A,
    prelude::*,
    render::{
        render_resource::{binding_types::uniform_buffer, *},
        renderer::{RenderDevice, RenderQueue},
    },
};
use std::mem;

/// Byte stride of a vertex position, padded to a `vec4<f32>`.
pub const POSITION_STRIDE: BufferAddress = 16;
/// Byte stride of a vertex normal, padded to a `vec4<f32>`.
pub const NORMAL_STRIDE: BufferAddress = 16;
pub const UV_STRIDE: BufferAddress = 8;
pub const INDEX_STRIDE: BufferAddress = 4;

/// The vertex and index buffers of a single generated mesh or patch.
#[derive(Clone)]
pub struct MeshBuffers {
    pub positions: Buffer,
    pub normals: Buffer,
    pub uvs: Buffer,
    pub indices: Buffer,
    pub vertex_count: u32,
    pub index_count: u32,
    pub resolution: UVec2,
}

impl MeshBuffers {
    /// Allocates the buffers of a grid with the given resolution.
    ///
    /// Fails without allocating anything if one of the buffers would exceed the device limits.
    pub fn new(device: &RenderDevice, resolution: UVec2) -> TessellationResult<Self> {
        let vertex_count = vertex_count(resolution);
        let index_count = index_count(resolution);

        if vertex_count == 0 || index_count == 0 {
            return Err(TessellationError::EmptyMesh {
                vertices: vertex_count,
                indices: index_count,
            });
        }

        let limits = device.limits();
        let limit = (limits.max_storage_buffer_binding_size as u64).min(limits.max_buffer_size);

        let descriptors = [
            ("positions", POSITION_STRIDE * vertex_count as u64, BufferUsages::VERTEX),
            ("normals", NORMAL_STRIDE * vertex_count as u64, BufferUsages::VERTEX),
            ("uvs", UV_STRIDE * vertex_count as u64, BufferUsages::VERTEX),
            ("indices", INDEX_STRIDE * index_count as u64, BufferUsages::INDEX),
        ];

        if let Some(&(label, size, _)) = descriptors.iter().find(|(_, size, _)| *size > limit) {
            return Err(TessellationError::BufferTooLarge { label, size, limit });
        }

        let [positions, normals, uvs, indices] = descriptors.map(|(label, size, usage)| {
            let label = format!("tessellation_{label}_buffer");

            device.create_buffer(&BufferDescriptor {
                label: Some(label.as_str()),
                size,
                usage: BufferUsages::STORAGE | BufferUsages::COPY_SRC | usage,
                mapped_at_creation: false,
            })
        });

        Ok(Self {
            positions,
            normals,
            uvs,
            indices,
            vertex_count,
            index_count,
            resolution,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.vertex_count > 0 && self.index_count > 0
    }

    /// Releases the buffers in the reverse order of their allocation.
    pub fn release(self) {
        let Self {
            positions,
            normals,
            uvs,
            indices,
            ..
        } = self;

        drop(indices);
        drop(uvs);
        drop(normals);
        drop(positions);
    }
}

/// Per draw data of a slot.
#[derive(Clone, Default, ShaderType)]
pub struct TessellationDrawUniform {
    pub world_from_local: Mat4,
    /// The inverse transpose of the linear part, stored as a 4x4 matrix.
    pub normal_from_local: Mat4,
    /// Debug tint of the slot, the alpha channel is zero when tinting is disabled.
    pub lod_color: Vec4,
}

impl TessellationDrawUniform {
    pub fn new(world_from_local: &Affine3A, level: i32, show_lod: bool) -> Self {
        let linear = Mat3::from(world_from_local.matrix3);
        let normal_from_local = if linear.determinant().abs() > f32::EPSILON {
            linear.inverse().transpose()
        } else {
            Mat3::IDENTITY
        };

        let lod_color = if show_lod {
            level_color(level).to_linear().to_vec4()
        } else {
            Vec4::ZERO
        };

        Self {
            world_from_local: Mat4::from(*world_from_local),
            normal_from_local: Mat4::from_mat3(normal_from_local),
            lod_color,
        }
    }
}

/// The layout of the per slot draw bind group.
#[derive(Resource, Deref)]
pub struct TessellationDrawLayout(pub BindGroupLayout);

impl FromWorld for TessellationDrawLayout {
    fn from_world(world: &mut World) -> Self {
        let device = world.resource::<RenderDevice>();

        Self(device.create_bind_group_layout(
            "tessellation_draw_layout",
            &BindGroupLayoutEntries::single(
                ShaderStages::VERTEX_FRAGMENT,
                uniform_buffer::<TessellationDrawUniform>(false),
            ),
        ))
    }
}

/// The uniform and bind group used to draw a slot.
pub struct SlotDrawData {
    pub uniform: GpuBuffer<TessellationDrawUniform>,
    pub bind_group: BindGroup,
}

/// A generated buffer set owned by a [`MeshSlot`].
pub trait SlotBuffers {
    fn is_valid(&self) -> bool;

    /// Releases the buffers in the reverse order of their allocation.
    fn release(self);
}

impl SlotBuffers for MeshBuffers {
    fn is_valid(&self) -> bool {
        MeshBuffers::is_valid(self)
    }

    fn release(self) {
        MeshBuffers::release(self);
    }
}

/// The resident geometry of one mesh or patch.
pub struct MeshSlot<B = MeshBuffers, D = SlotDrawData> {
    /// The key of the last generation attempt, successful or not.
    pub key: Option<GenerationKey>,
    pub buffers: Option<B>,
    pub draw: Option<D>,
    pub level: i32,
    pub visible: bool,
    /// Set when the generation of [`Self::key`] failed, the error is logged only once.
    pub failed: bool,
}

impl<B, D> Default for MeshSlot<B, D> {
    fn default() -> Self {
        Self {
            key: None,
            buffers: None,
            draw: None,
            level: 0,
            visible: false,
            failed: false,
        }
    }
}

impl<B: SlotBuffers, D> MeshSlot<B, D> {
    /// Whether the slot has to generate geometry for the key.
    pub fn needs_generation(&self, key: &GenerationKey) -> bool {
        self.key.as_ref() != Some(key)
    }

    pub fn is_drawable(&self) -> bool {
        self.visible && self.draw.is_some() && self.buffers.as_ref().is_some_and(B::is_valid)
    }

    /// Replaces the resident buffers with a freshly generated set.
    pub fn promote(&mut self, key: GenerationKey, level: i32, buffers: B) {
        self.key = Some(key);
        self.level = level;
        self.failed = false;

        if let Some(previous) = mem::replace(&mut self.buffers, Some(buffers)) {
            previous.release();
        }
    }

    /// Records a failed generation and applies the failure policy.
    pub fn fail(
        &mut self,
        key: GenerationKey,
        error: &TessellationError,
        policy: FailurePolicy,
        entity: Entity,
        index: u32,
    ) {
        if !self.failed || self.key != Some(key) {
            let stage = match error.is_resource_error() {
                true => "allocate the buffers of",
                false => "generate",
            };
            error!("Failed to {stage} tessellation slot {index} of {entity}: {error}");
        }

        self.key = Some(key);
        self.failed = true;

        if policy == FailurePolicy::DropToInvalid {
            self.release_resources();
        }
    }

    fn release_resources(&mut self) {
        drop(self.draw.take());

        if let Some(buffers) = self.buffers.take() {
            buffers.release();
        }
    }

    /// Releases the draw data first and the buffers last.
    pub fn release(mut self) {
        self.release_resources();
    }
}

/// The render world counterpart of a tessellated plane.
#[derive(Default)]
pub struct GpuTessellation {
    pub slots: Vec<MeshSlot>,
    pub world_from_local: Affine3A,
    pub debug_logging: bool,
}

impl GpuTessellation {
    /// Grows or shrinks the slot list, shrinking releases the slots from last to first.
    pub fn resize(&mut self, count: usize) {
        while self.slots.len() > count {
            if let Some(slot) = self.slots.pop() {
                slot.release();
            }
        }

        self.slots.resize_with(count, MeshSlot::default);
    }

    pub fn release(mut self) {
        self.resize(0);
    }

    pub fn drawable_slots(&self) -> impl Iterator<Item = (usize, &MeshSlot)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_drawable())
    }
}

/// Mirrors the extracted planes, releases despawned planes and resizes the slot lists.
pub(crate) fn prepare_gpu_tessellations(
    extracted: Res<TessellationComponents<ExtractedTessellation>>,
    mut gpu_tessellations: ResMut<TessellationComponents<GpuTessellation>>,
) {
    let removed = gpu_tessellations
        .keys()
        .filter(|entity| !extracted.contains_key(*entity))
        .copied()
        .collect::<Vec<_>>();

    for entity in removed {
        if let Some(gpu_tessellation) = gpu_tessellations.remove(&entity) {
            gpu_tessellation.release();
        }
    }

    for (&entity, plane) in extracted.iter() {
        let gpu_tessellation = gpu_tessellations.entry(entity).or_default();

        gpu_tessellation.resize(plane.plans.len());
        gpu_tessellation.world_from_local = plane.world_from_local;
        gpu_tessellation.debug_logging = plane.debug_logging;

        for (slot, plan) in gpu_tessellation.slots.iter_mut().zip(&plane.plans) {
            slot.visible = plane.visible && plan.visible;
        }
    }
}

/// Swaps the buffers of all recorded jobs into their slots and refreshes the draw uniforms.
pub(crate) fn promote_tessellation_jobs(
    device: Res<RenderDevice>,
    queue: Res<RenderQueue>,
    debug: Option<Res<DebugTessellation>>,
    draw_layout: Res<TessellationDrawLayout>,
    jobs: Res<TessellationJobs>,
    mut gpu_tessellations: ResMut<TessellationComponents<GpuTessellation>>,
) {
    for job in jobs.iter() {
        let Some(slot) = gpu_tessellations
            .get_mut(&job.entity)
            .and_then(|gpu_tessellation| gpu_tessellation.slots.get_mut(job.slot))
        else {
            continue;
        };

        slot.promote(job.key, job.level, job.buffers.clone());
    }

    let show_lod = debug.is_some_and(|debug| debug.show_patch_lod);

    for gpu_tessellation in gpu_tessellations.values_mut() {
        let world_from_local = gpu_tessellation.world_from_local;

        for slot in &mut gpu_tessellation.slots {
            if slot.buffers.is_none() {
                continue;
            }

            let uniform = TessellationDrawUniform::new(&world_from_local, slot.level, show_lod);

            let draw = slot.draw.get_or_insert_with(|| {
                let uniform = GpuBuffer::create_labeled(
                    "tessellation_draw_uniform",
                    &device,
                    &TessellationDrawUniform::default(),
                );
                let bind_group = device.create_bind_group(
                    "tessellation_draw_bind_group",
                    &draw_layout,
                    &BindGroupEntries::single(&uniform),
                );

                SlotDrawData {
                    uniform,
                    bind_group,
                }
            });

            draw.uniform.set_value(uniform);
            draw.uniform.update(&queue);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::MeshPlan;

    #[test]
    fn draw_uniform_normal_matrix() {
        let transform = Affine3A::from_scale_rotation_translation(
            Vec3::new(2.0, 1.0, 4.0),
            Quat::IDENTITY,
            Vec3::new(10.0, 0.0, -5.0),
        );

        let uniform = TessellationDrawUniform::new(&transform, 16, false);

        assert_eq!(uniform.world_from_local.w_axis, Vec4::new(10.0, 0.0, -5.0, 1.0));
        assert_eq!(
            uniform.normal_from_local.x_axis.truncate(),
            Vec3::new(0.5, 0.0, 0.0)
        );
        assert_eq!(
            uniform.normal_from_local.z_axis.truncate(),
            Vec3::new(0.0, 0.0, 0.25)
        );
        assert_eq!(uniform.lod_color, Vec4::ZERO);
    }

    #[test]
    fn degenerate_transform_keeps_normals() {
        let transform = Affine3A::from_scale(Vec3::new(1.0, 0.0, 1.0));
        let uniform = TessellationDrawUniform::new(&transform, 16, true);

        assert_eq!(uniform.normal_from_local, Mat4::IDENTITY);
        assert!(uniform.lod_color.w > 0.0);
    }

    #[derive(Debug, PartialEq)]
    struct TestBuffers(u32);

    impl SlotBuffers for TestBuffers {
        fn is_valid(&self) -> bool {
            self.0 > 0
        }

        fn release(self) {}
    }

    fn resident_slot() -> MeshSlot<TestBuffers, ()> {
        MeshSlot {
            key: Some(key(1)),
            buffers: Some(TestBuffers(1)),
            draw: Some(()),
            level: 16,
            visible: true,
            failed: false,
        }
    }

    fn key(revision: u64) -> GenerationKey {
        MeshPlan::single(&default(), 16).key(revision)
    }

    #[test]
    fn drop_to_invalid_clears_the_slot() {
        let mut slot = resident_slot();
        assert!(slot.is_drawable());

        let error = TessellationError::InvalidLevel(0);
        slot.fail(key(2), &error, FailurePolicy::DropToInvalid, Entity::PLACEHOLDER, 0);

        assert!(slot.failed);
        assert_eq!(slot.buffers, None);
        assert_eq!(slot.draw, None);
        assert!(!slot.is_drawable());
    }

    #[test]
    fn retain_last_valid_keeps_drawing() {
        let mut slot = resident_slot();

        let error = TessellationError::MissingPipeline("displace");
        slot.fail(key(2), &error, FailurePolicy::RetainLastValid, Entity::PLACEHOLDER, 0);

        assert!(slot.failed);
        assert_eq!(slot.buffers, Some(TestBuffers(1)));
        assert_eq!(slot.level, 16);
        assert!(slot.is_drawable());
    }

    #[test]
    fn failed_keys_are_not_retried() {
        let mut slot = resident_slot();
        let error = TessellationError::InvalidLevel(0);

        assert!(slot.needs_generation(&key(2)));
        slot.fail(key(2), &error, FailurePolicy::RetainLastValid, Entity::PLACEHOLDER, 0);

        assert_eq!(slot.key, Some(key(2)));
        assert!(!slot.needs_generation(&key(2)));
        // a new revision is generated again
        assert!(slot.needs_generation(&key(3)));
    }

    #[test]
    fn promote_replaces_the_buffers() {
        let mut slot = resident_slot();
        let error = TessellationError::InvalidLevel(0);
        slot.fail(key(2), &error, FailurePolicy::RetainLastValid, Entity::PLACEHOLDER, 0);

        slot.promote(key(3), 32, TestBuffers(2));

        assert!(!slot.failed);
        assert_eq!(slot.key, Some(key(3)));
        assert_eq!(slot.level, 32);
        assert_eq!(slot.buffers, Some(TestBuffers(2)));
        assert!(slot.is_drawable());

        // an empty set is never drawn
        slot.promote(key(4), 32, TestBuffers(0));
        assert!(!slot.is_drawable());
    }

    #[test]
    fn empty_slots_are_not_drawable() {
        let slot = MeshSlot::<MeshBuffers, SlotDrawData> {
            visible: true,
            ..default()
        };

        assert!(!slot.is_drawable());
        assert!(slot.needs_generation(&key(0)));
    }
}
