//! Blocking read back of generated buffers, for tools and exporters.
//!
//! Never call this from a per frame system, it stalls until the GPU finished all submitted work.

use crate::{
    error::{TessellationError, TessellationResult},
    render::buffers::MeshBuffers,
};
use bevy::{
    prelude::*,
    render::{
        mesh::{Indices, PrimitiveTopology},
        render_asset::RenderAssetUsages,
        render_resource::*,
        renderer::{RenderDevice, RenderQueue},
    },
};

/// A CPU copy of a generated mesh.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MeshData {
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub uvs: Vec<Vec2>,
    pub indices: Vec<u32>,
}

impl MeshData {
    /// Decodes the raw buffer contents, positions and normals are padded to four floats.
    pub fn from_bytes(positions: &[u8], normals: &[u8], uvs: &[u8], indices: &[u8]) -> Self {
        let padded = |bytes: &[u8]| {
            bytemuck::pod_collect_to_vec::<u8, [f32; 4]>(bytes)
                .into_iter()
                .map(|[x, y, z, _]| Vec3::new(x, y, z))
                .collect()
        };

        Self {
            positions: padded(positions),
            normals: padded(normals),
            uvs: bytemuck::pod_collect_to_vec::<u8, [f32; 2]>(uvs)
                .into_iter()
                .map(Vec2::from)
                .collect(),
            indices: bytemuck::pod_collect_to_vec(indices),
        }
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Converts the data into a regular triangle list mesh.
    pub fn into_mesh(self) -> Mesh {
        Mesh::new(PrimitiveTopology::TriangleList, RenderAssetUsages::default())
            .with_inserted_attribute(Mesh::ATTRIBUTE_POSITION, self.positions)
            .with_inserted_attribute(Mesh::ATTRIBUTE_NORMAL, self.normals)
            .with_inserted_attribute(Mesh::ATTRIBUTE_UV_0, self.uvs)
            .with_inserted_indices(Indices::U32(self.indices))
    }
}

fn map_buffer(
    device: &RenderDevice,
    label: &'static str,
    buffer: &Buffer,
) -> TessellationResult<Vec<u8>> {
    let (tx, rx) = async_channel::bounded(1);
    let buffer_slice = buffer.slice(..);

    buffer_slice.map_async(MapMode::Read, move |result| {
        let _ = tx.try_send(result.is_ok());
    });

    device.poll(Maintain::Wait);

    if rx.recv_blocking() != Ok(true) {
        return Err(TessellationError::Readback(label));
    }

    let data = buffer_slice.get_mapped_range().to_vec();
    buffer.unmap();

    Ok(data)
}

/// Copies the buffers of a mesh into staging buffers and blocks until they are mapped.
pub fn read_back_mesh(
    device: &RenderDevice,
    queue: &RenderQueue,
    buffers: &MeshBuffers,
) -> TessellationResult<MeshData> {
    if !buffers.is_valid() {
        return Err(TessellationError::EmptyMesh {
            vertices: buffers.vertex_count,
            indices: buffers.index_count,
        });
    }

    let sources = [
        ("positions", &buffers.positions),
        ("normals", &buffers.normals),
        ("uvs", &buffers.uvs),
        ("indices", &buffers.indices),
    ];

    let staging = sources.map(|(label, source)| {
        let staging = device.create_buffer(&BufferDescriptor {
            label: Some("tessellation_readback_buffer"),
            size: source.size(),
            usage: BufferUsages::COPY_DST | BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        (label, source, staging)
    });

    let mut encoder = device.create_command_encoder(&CommandEncoderDescriptor {
        label: Some("tessellation_readback_encoder"),
    });

    for (_, source, staging) in &staging {
        encoder.copy_buffer_to_buffer(source, 0, staging, 0, source.size());
    }

    queue.submit([encoder.finish()]);

    let [positions, normals, uvs, indices] =
        staging.map(|(label, _, staging)| map_buffer(device, label, &staging));

    Ok(MeshData::from_bytes(
        &positions?,
        &normals?,
        &uvs?,
        &indices?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        grid::{grid_indices, grid_positions},
        patch::EdgeCollapse,
    };

    #[test]
    fn decode_padded_buffers() {
        let positions = [[1.0f32, 2.0, 3.0, 1.0], [4.0, 5.0, 6.0, 1.0]];
        let normals = [[0.0f32, 1.0, 0.0, 0.0], [0.0, -1.0, 0.0, 0.0]];
        let uvs = [[0.0f32, 0.5], [1.0, 0.5]];
        let indices = [0u32, 1, 0];

        let data = MeshData::from_bytes(
            bytemuck::cast_slice(&positions),
            bytemuck::cast_slice(&normals),
            bytemuck::cast_slice(&uvs),
            bytemuck::cast_slice(&indices),
        );

        assert_eq!(data.positions, vec![Vec3::new(1.0, 2.0, 3.0), Vec3::new(4.0, 5.0, 6.0)]);
        assert_eq!(data.normals[1], Vec3::NEG_Y);
        assert_eq!(data.uvs[1], Vec2::new(1.0, 0.5));
        assert_eq!(data.indices, vec![0, 1, 0]);
        assert_eq!(data.triangle_count(), 1);
    }

    #[test]
    fn cpu_grid_converts_to_mesh() {
        let resolution = UVec2::splat(9);
        let positions = grid_positions(resolution, Vec2::splat(100.0), Vec2::ZERO, Vec2::ONE);

        let data = MeshData {
            normals: vec![Vec3::Y; positions.len()],
            uvs: vec![Vec2::ZERO; positions.len()],
            indices: grid_indices(resolution, EdgeCollapse::NONE),
            positions,
        };

        assert_eq!(data.triangle_count(), 8 * 8 * 2);

        let mesh = data.into_mesh();
        assert_eq!(mesh.count_vertices(), 81);
        assert_eq!(mesh.indices().map(Indices::len), Some(8 * 8 * 6));
    }
}
