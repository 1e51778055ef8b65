use bevy::{
    prelude::*,
    render::{
        render_asset::RenderAssetUsages,
        render_resource::{Extent3d, TextureDimension, TextureFormat},
    },
};
use bevy_gpu_tessellation::prelude::*;
use rand::Rng;

const SETTINGS_PATH: &str = "settings/patch_terrain.tess.ron";
const HEIGHT_MAP_SIZE: u32 = 512;
const HILL_COUNT: usize = 48;

fn main() {
    App::new()
        .add_plugins((
            DefaultPlugins,
            TessellationPlugin {
                settings: TessellationPluginSettings {
                    max_jobs_per_frame: 32,
                    ..default()
                },
            },
            TessellationDebugPlugin, // enable debug settings and controls
            TessellationMaterialPlugin::<StandardMaterial>::default(),
        ))
        .add_systems(Startup, setup)
        .run();
}

fn setup(
    mut commands: Commands,
    mut materials: ResMut<Assets<StandardMaterial>>,
    mut images: ResMut<Assets<Image>>,
    asset_server: Res<AssetServer>,
) {
    // The settings are loaded from disk and reapplied whenever the file changes.
    let settings = asset_server.load::<TessellationSettings>(SETTINGS_PATH);

    let displacement = images.add(height_map());

    commands.spawn((
        TessellatedPlane::default(),
        TessellationSettingsHandle(settings),
        TessellationTextures {
            displacement: Some(TextureSource::Static(displacement)),
            ..default()
        },
        TessellationMaterial(materials.add(StandardMaterial {
            base_color: Color::srgb(0.6, 0.55, 0.45),
            ..default()
        })),
    ));

    let transform = Transform::from_xyz(0.0, 2500.0, 12000.0).looking_at(Vec3::ZERO, Vec3::Y);
    commands.spawn((
        DebugCamera::looking_at(&transform),
        transform,
        TessellationView,
    ));
}

/// A height map made of randomly placed smooth hills.
fn height_map() -> Image {
    let mut rng = rand::rng();

    let hills = (0..HILL_COUNT)
        .map(|_| {
            let center = Vec2::new(rng.random(), rng.random());
            let radius = rng.random_range(0.03..0.2);
            let height = rng.random_range(0.2..1.0);
            (center, radius, height)
        })
        .collect::<Vec<_>>();

    let mut data = Vec::with_capacity((HEIGHT_MAP_SIZE * HEIGHT_MAP_SIZE * 4) as usize);

    for y in 0..HEIGHT_MAP_SIZE {
        for x in 0..HEIGHT_MAP_SIZE {
            let uv = Vec2::new(x as f32, y as f32) / (HEIGHT_MAP_SIZE - 1) as f32;

            let height = hills
                .iter()
                .map(|&(center, radius, height)| {
                    let falloff = uv.distance(center) / radius;
                    height * (-falloff * falloff).exp()
                })
                .sum::<f32>()
                .min(1.0);

            let value = (height * 255.0) as u8;
            data.extend_from_slice(&[value, value, value, 255]);
        }
    }

    Image::new(
        Extent3d {
            width: HEIGHT_MAP_SIZE,
            height: HEIGHT_MAP_SIZE,
            depth_or_array_layers: 1,
        },
        TextureDimension::D2,
        data,
        TextureFormat::Rgba8Unorm,
        RenderAssetUsages::RENDER_WORLD,
    )
}
