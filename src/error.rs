use bevy::math::{UVec2, Vec2};
use thiserror::Error;

/// A settings value outside of its usable range. The value is clamped and generation continues.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigIssue {
    #[error("plane size {0} is not positive")]
    PlaneSize(Vec2),
    #[error("tessellation factor {0} is below one")]
    TessellationFactor(i32),
    #[error("displacement intensity or offset is not finite")]
    Displacement,
    #[error("normal smoothing {0} is outside of [0, 1]")]
    NormalSmoothing(f32),
    #[error("tessellation factor range {0}..{1} is invalid")]
    FactorRange(i32, i32),
    #[error("LOD distance range {0}..{1} is inverted or negative")]
    DistanceRange(f32, f32),
    #[error("transition speed {0} is negative")]
    TransitionSpeed(f32),
    #[error("hysteresis {0} is negative")]
    Hysteresis(i32),
    #[error("patch count {0} is outside of 1..=32")]
    PatchCount(UVec2),
    #[error("uv window offset {0} scale {1} is outside of the unit square")]
    UvWindow(Vec2, Vec2),
}

/// Reasons a mesh or a single patch can not be generated.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TessellationError {
    #[error("tessellation level {0} is not positive")]
    InvalidLevel(i32),
    #[error("resolution {0} is smaller than 2x2")]
    InvalidResolution(UVec2),
    #[error("patch uv window offset {offset} size {size} is outside of the unit square")]
    InvalidPatchWindow { offset: Vec2, size: Vec2 },
    #[error("mesh has {vertices} vertices and {indices} indices")]
    EmptyMesh { vertices: u32, indices: u32 },
    #[error("{label} buffer needs {size} bytes, the device allows {limit}")]
    BufferTooLarge {
        label: &'static str,
        size: u64,
        limit: u64,
    },
    #[error("compute pipeline for the {0} stage is not available")]
    MissingPipeline(&'static str),
    #[error("reading back the {0} buffer failed")]
    Readback(&'static str),
}

impl TessellationError {
    /// Generation errors only affect a single mesh or patch, resource errors invalidate the
    /// buffer set.
    pub fn is_resource_error(&self) -> bool {
        matches!(
            self,
            TessellationError::BufferTooLarge { .. }
                | TessellationError::MissingPipeline(_)
                | TessellationError::Readback(_)
        )
    }
}

pub type TessellationResult<T> = Result<T, TessellationError>;
