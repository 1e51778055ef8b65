//! The render world half of the tessellation.
//!
//! Each frame the plans of all planes are extracted together with a snapshot of the settings they
//! were planned with. Slots whose generation key changed are regenerated by the compute stages in
//! [`compute`], their buffers are owned by [`buffers`] and drawn by [`draw`].

use crate::{
    plan::MeshPlan,
    settings::TessellationSettings,
    tessellation::{TessellatedPlane, TessellationComponents, TessellationState, TessellationTextures},
};
use bevy::{math::Affine3A, prelude::*, render::Extract};

pub mod buffers;
pub mod compute;
pub mod draw;
pub mod readback;

/// The texture assets bound to the texture group of the compute stages.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ExtractedTextures {
    pub displacement: Option<AssetId<Image>>,
    pub mask: Option<AssetId<Image>>,
    pub normal_map: Option<AssetId<Image>>,
}

impl ExtractedTextures {
    pub fn new(textures: &TessellationTextures) -> Self {
        Self {
            displacement: textures.displacement.as_ref().map(|source| source.image().id()),
            mask: textures.mask.as_ref().map(|source| source.image().id()),
            normal_map: textures.normal_map.as_ref().map(|source| source.image().id()),
        }
    }
}

/// A render world copy of a plane.
pub struct ExtractedTessellation {
    /// The settings of the applied revision, by value.
    pub settings: TessellationSettings,
    pub world_from_local: Affine3A,
    pub plans: Vec<MeshPlan>,
    pub revision: u64,
    pub textures: ExtractedTextures,
    pub visible: bool,
    pub debug_logging: bool,
}

pub(crate) fn extract_tessellation(
    mut extracted: ResMut<TessellationComponents<ExtractedTessellation>>,
    planes: Extract<
        Query<(
            Entity,
            &TessellatedPlane,
            &TessellationState,
            &TessellationTextures,
            &GlobalTransform,
            &InheritedVisibility,
        )>,
    >,
) {
    extracted.clear();

    for (entity, plane, state, textures, transform, visibility) in &planes {
        extracted.insert(
            entity,
            ExtractedTessellation {
                settings: state.generation_settings().clone(),
                world_from_local: transform.affine(),
                plans: state.plans().to_vec(),
                revision: state.revision(),
                textures: ExtractedTextures::new(textures),
                visible: visibility.get(),
                debug_logging: plane.debug_logging,
            },
        );
    }
}
