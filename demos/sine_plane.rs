use bevy::prelude::*;
use bevy_gpu_tessellation::prelude::*;

const PLANE_SIZE: f32 = 4000.0;

fn main() {
    App::new()
        .add_plugins((
            DefaultPlugins,
            TessellationPlugin::default(),
            TessellationDebugPlugin, // enable debug settings and controls
            TessellationMaterialPlugin::<StandardMaterial>::default(),
        ))
        .add_systems(Startup, setup)
        .add_systems(Update, regenerate_on_space)
        .run();
}

fn setup(mut commands: Commands, mut materials: ResMut<Assets<StandardMaterial>>) {
    // Configure the plane and its level of detail. Adapt the settings to your liking.
    let settings = TessellationSettings {
        plane_size: Vec2::splat(PLANE_SIZE),
        displacement_intensity: 200.0,
        use_sine_wave: true,
        normal_method: NormalMethod::Hybrid,
        normal_smoothing: 0.5,
        lod_mode: LodMode::DistanceContinuous,
        min_factor: 4,
        max_factor: 64,
        min_distance: 500.0,
        max_distance: 8000.0,
        ..default()
    };

    commands.spawn((
        TessellatedPlane {
            debug_logging: true,
            ..TessellatedPlane::new(settings)
        },
        TessellationMaterial(materials.add(StandardMaterial {
            base_color: Color::srgb(0.35, 0.55, 0.3),
            ..default()
        })),
    ));

    let transform = Transform::from_xyz(-3000.0, 1500.0, 3000.0).looking_at(Vec3::ZERO, Vec3::Y);
    commands.spawn((DebugCamera::looking_at(&transform), transform));
}

fn regenerate_on_space(input: Res<ButtonInput<KeyCode>>, mut states: Query<&mut TessellationState>) {
    if input.just_pressed(KeyCode::Space) {
        for mut state in &mut states {
            state.request_update();
        }
    }
}
