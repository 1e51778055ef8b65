//! This crate renders planes whose geometry is generated on the GPU by compute shaders.
//!
//! # Overview
//! A [`TessellatedPlane`](tessellation::TessellatedPlane) is a flat grid in the XZ plane, which is
//! displaced along Y by a procedural sine wave or a displacement texture.
//! Every frame its [`TessellationState`](tessellation::TessellationState) evaluates the level of
//! detail from the distance to the camera and either plans a single mesh, or partitions the
//! plane into patches of individual levels. Patches outside of the view frustum are culled and
//! the borders between patches of different levels are stitched by collapsing the vertices of
//! the finer side.
//!
//! The plans are extracted into the render world, where every changed mesh is regenerated by four
//! compute stages (vertices, displacement, normals and indices). The generated buffers are drawn
//! directly as vertex and index buffers, see the [`render`] module for more information.
//!
//! # Usage
//! Add the [`TessellationPlugin`] and a [`TessellationMaterialPlugin`](render::draw::TessellationMaterialPlugin)
//! for each material planes are drawn with. Then spawn a plane together with a
//! [`TessellationMaterial`](render::draw::TessellationMaterial).

pub mod debug;
pub mod error;
pub mod grid;
pub mod lod;
pub mod patch;
pub mod plan;
pub mod plugin;
pub mod render;
pub mod resolution;
pub mod settings;
pub mod shaders;
pub mod tessellation;
pub mod util;

#[allow(missing_docs)]
pub mod prelude {
    #[doc(hidden)]
    pub use crate::{
        debug::{camera::DebugCamera, DebugTessellation, TessellationDebugPlugin},
        error::{TessellationError, TessellationResult},
        patch::{EdgeCollapse, PatchInfo},
        plugin::TessellationPlugin,
        render::{
            draw::{TessellationMaterial, TessellationMaterialPlugin},
            readback::{read_back_mesh, MeshData},
        },
        settings::{
            FailurePolicy, HysteresisComparison, LodMode, NormalMethod, PatchLevel,
            TessellationSettings,
        },
        tessellation::{
            TessellatedPlane, TessellationPluginSettings, TessellationSettingsHandle,
            TessellationState, TessellationTextures, TessellationView, TextureSource,
        },
    };
}
