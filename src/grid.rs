//! Grid math shared by the compute shaders and the CPU side.
//!
//! These functions mirror `generate_vertices.wgsl`, `displace.wgsl` and `generate_indices.wgsl`
//! exactly. They are used to validate read back meshes and to verify that collapsed patch borders
//! only reference vertices the coarser neighbour generates as well.

use crate::patch::EdgeCollapse;
use bevy::prelude::*;
use std::f32::consts::TAU;

/// Number of sine periods of the procedural displacement across the full plane.
pub const SINE_FREQUENCY: f32 = 4.0;

/// The uv of a grid vertex inside the full plane uv space.
#[inline]
pub fn vertex_uv(resolution: UVec2, coordinate: UVec2, uv_offset: Vec2, uv_scale: Vec2) -> Vec2 {
    let fraction = coordinate.as_vec2() / (resolution - UVec2::ONE).as_vec2();
    uv_offset + fraction * uv_scale
}

/// The undisplaced local position of a vertex, the plane spans the local xz plane.
#[inline]
pub fn vertex_position(uv: Vec2, plane_size: Vec2, patch_offset: Vec3) -> Vec3 {
    let planar = (uv - 0.5) * plane_size;
    Vec3::new(planar.x, 0.0, planar.y) + patch_offset
}

/// The procedural displacement in [0, 1] used when the sine wave is enabled.
#[inline]
pub fn sine_height(uv: Vec2) -> f32 {
    0.5 + 0.25 * ((uv.x * TAU * SINE_FREQUENCY).sin() + (uv.y * TAU * SINE_FREQUENCY).sin())
}

#[inline]
fn snap(index: u32, segments: u32, factor: u32) -> u32 {
    if factor <= 1 || index >= segments {
        index
    } else {
        index / factor * factor
    }
}

/// Moves vertices on collapsed borders onto the closest retained vertex below them.
///
/// Only every `factor`-th vertex along a collapsed border is kept, which are exactly the vertices
/// of the coarser neighbour. The border end points are never moved.
pub fn collapse_vertex(coordinate: UVec2, resolution: UVec2, collapse: EdgeCollapse) -> UVec2 {
    let last = resolution - UVec2::ONE;
    let mut coordinate = coordinate;

    if coordinate.x == 0 {
        coordinate.y = snap(coordinate.y, last.y, collapse.west);
    } else if coordinate.x == last.x {
        coordinate.y = snap(coordinate.y, last.y, collapse.east);
    }

    if coordinate.y == 0 {
        coordinate.x = snap(coordinate.x, last.x, collapse.south);
    } else if coordinate.y == last.y {
        coordinate.x = snap(coordinate.x, last.x, collapse.north);
    }

    coordinate
}

#[inline]
pub fn vertex_index(coordinate: UVec2, resolution: UVec2) -> u32 {
    coordinate.y * resolution.x + coordinate.x
}

/// The six indices of a grid cell, counter clockwise when seen from above.
pub fn cell_indices(cell: UVec2, resolution: UVec2, collapse: EdgeCollapse) -> [u32; 6] {
    let index = |offset: UVec2| {
        vertex_index(
            collapse_vertex(cell + offset, resolution, collapse),
            resolution,
        )
    };

    let i00 = index(UVec2::new(0, 0));
    let i10 = index(UVec2::new(1, 0));
    let i01 = index(UVec2::new(0, 1));
    let i11 = index(UVec2::new(1, 1));

    [i00, i01, i10, i10, i01, i11]
}

/// All indices of a grid, including the degenerate triangles of collapsed borders.
pub fn grid_indices(resolution: UVec2, collapse: EdgeCollapse) -> Vec<u32> {
    let cells = resolution - UVec2::ONE;

    (0..cells.y)
        .flat_map(|y| (0..cells.x).map(move |x| UVec2::new(x, y)))
        .flat_map(|cell| cell_indices(cell, resolution, collapse))
        .collect()
}

/// All undisplaced local positions of a grid.
pub fn grid_positions(
    resolution: UVec2,
    plane_size: Vec2,
    uv_offset: Vec2,
    uv_scale: Vec2,
) -> Vec<Vec3> {
    (0..resolution.y)
        .flat_map(|y| (0..resolution.x).map(move |x| UVec2::new(x, y)))
        .map(|coordinate| {
            let uv = vertex_uv(resolution, coordinate, uv_offset, uv_scale);
            vertex_position(uv, plane_size, Vec3::ZERO)
        })
        .collect()
}
