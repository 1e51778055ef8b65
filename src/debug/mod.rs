//! Contains a debug resource and systems controlling it to visualize the LOD and the patches of
//! tessellated planes.
use crate::{debug::camera::debug_camera_control, tessellation::TessellationState};
use bevy::{
    prelude::*,
    render::{Extract, RenderApp},
};

pub mod camera;

/// Adds the tessellation debug config, a debug camera and debug control systems.
pub struct TessellationDebugPlugin;

impl Plugin for TessellationDebugPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<DebugTessellation>()
            .register_type::<DebugTessellation>()
            .add_systems(Startup, debug_lighting)
            .add_systems(
                Update,
                (
                    debug_camera_control,
                    toggle_debug,
                    print_statistics,
                    draw_patch_bounds,
                ),
            );

        app.sub_app_mut(RenderApp)
            .init_resource::<DebugTessellation>()
            .add_systems(ExtractSchedule, extract_debug);
    }
}

#[derive(Clone, Debug, Default, Resource, Reflect)]
#[reflect(Resource)]
pub struct DebugTessellation {
    pub wireframe: bool,
    /// Tints every mesh and patch by its tessellation level.
    pub show_patch_lod: bool,
    pub show_patch_bounds: bool,
    /// Stops evaluating the LOD, the current levels and patches are kept.
    pub freeze_lod: bool,
}

/// The debug color of a tessellation level, the hue cycles once per power of two.
pub fn level_color(level: i32) -> Color {
    let octave = (level.max(1) as f32).log2();
    Color::hsl((octave * 50.0) % 360.0, 0.8, 0.5)
}

pub fn extract_debug(
    mut debug: ResMut<DebugTessellation>,
    extracted_debug: Extract<Res<DebugTessellation>>,
) {
    *debug = extracted_debug.clone();
}

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}

pub fn toggle_debug(input: Res<ButtonInput<KeyCode>>, mut debug: ResMut<DebugTessellation>) {
    if input.just_pressed(KeyCode::KeyW) {
        debug.wireframe = !debug.wireframe;
        let state = on_off(debug.wireframe);
        info!("Toggled the wireframe view {}.", state);
    }
    if input.just_pressed(KeyCode::KeyL) {
        debug.show_patch_lod = !debug.show_patch_lod;
        let state = on_off(debug.show_patch_lod);
        info!("Toggled the lod view {}.", state);
    }
    if input.just_pressed(KeyCode::KeyB) {
        debug.show_patch_bounds = !debug.show_patch_bounds;
        let state = on_off(debug.show_patch_bounds);
        info!("Toggled the patch bounds {}.", state);
    }
    if input.just_pressed(KeyCode::KeyF) {
        debug.freeze_lod = !debug.freeze_lod;
        let action = if debug.freeze_lod { "Froze" } else { "Unfroze" };
        info!("{} the level of detail.", action);
    }
}

pub(crate) fn print_statistics(
    input: Res<ButtonInput<KeyCode>>,
    planes: Query<(Entity, &TessellationState)>,
) {
    if !input.just_pressed(KeyCode::KeyI) {
        return;
    }

    for (entity, state) in &planes {
        info!(
            "Plane {entity}: resolution {:?}, {} vertices, {} triangles, {} patches, revision {}.",
            state.resolution(),
            state.vertex_count(),
            state.triangle_count(),
            state.patches().len(),
            state.revision()
        );
    }
}

pub(crate) fn draw_patch_bounds(
    debug: Res<DebugTessellation>,
    mut gizmos: Gizmos,
    planes: Query<&TessellationState>,
) {
    if !debug.show_patch_bounds {
        return;
    }

    for state in &planes {
        for patch in state.patches().iter().filter(|patch| patch.valid) {
            let color = if patch.visible {
                level_color(patch.level)
            } else {
                Color::srgb(0.3, 0.3, 0.3)
            };

            let transform = Transform::from_translation(patch.world_bounds_center())
                .with_scale(patch.world_half_extent() * 2.0);

            gizmos.cuboid(transform, color);
        }
    }
}

pub(crate) fn debug_lighting(mut commands: Commands) {
    commands.spawn((
        DirectionalLight {
            illuminance: 20000.0,
            ..default()
        },
        Transform::from_xyz(1.0, 1.0, 0.0).looking_at(Vec3::ZERO, Vec3::Y),
    ));
    commands.insert_resource(AmbientLight {
        brightness: 200.0,
        ..default()
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_colors_differ_per_octave() {
        let colors = [4, 8, 16, 32, 64, 128].map(|level| level_color(level).to_srgba());

        for (i, a) in colors.iter().enumerate() {
            for b in &colors[i + 1..] {
                assert_ne!(a, b);
            }
        }

        assert_eq!(level_color(0), level_color(1));
    }
}
