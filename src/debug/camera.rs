use bevy::{input::mouse::AccumulatedMouseMotion, prelude::*};

/// A fly camera for inspecting the LOD transitions.
#[derive(Component)]
#[require(Camera3d)]
pub struct DebugCamera {
    pub active: bool,
    pub translation_speed: f32,
    pub rotation_speed: f32,
    pub acceleration: f32,
    yaw: f32,
    pitch: f32,
}

impl Default for DebugCamera {
    fn default() -> Self {
        Self {
            active: true,
            translation_speed: 600.0,
            rotation_speed: 0.2,
            acceleration: 1.03,
            yaw: 0.0,
            pitch: 0.0,
        }
    }
}

impl DebugCamera {
    pub fn looking_at(transform: &Transform) -> Self {
        let (yaw, pitch, _) = transform.rotation.to_euler(EulerRot::YXZ);

        Self {
            yaw: yaw.to_degrees(),
            pitch: pitch.to_degrees(),
            ..default()
        }
    }
}

pub(crate) fn debug_camera_control(
    time: Res<Time>,
    mouse_motion: Res<AccumulatedMouseMotion>,
    mouse_buttons: Res<ButtonInput<MouseButton>>,
    keys: Res<ButtonInput<KeyCode>>,
    mut cameras: Query<(&mut Transform, &mut DebugCamera)>,
) {
    let delta_time = time.delta_secs();

    let Some((mut transform, mut camera)) = cameras.iter_mut().find(|(_, camera)| camera.active)
    else {
        return;
    };

    let mut speed_factor = 1.0;
    let mut translation_delta = Vec3::ZERO;

    if keys.pressed(KeyCode::ArrowLeft) {
        translation_delta.x -= 1.0;
    }
    if keys.pressed(KeyCode::ArrowRight) {
        translation_delta.x += 1.0;
    }
    if keys.pressed(KeyCode::PageUp) {
        translation_delta.y += 1.0;
    }
    if keys.pressed(KeyCode::PageDown) {
        translation_delta.y -= 1.0;
    }
    if keys.pressed(KeyCode::ArrowUp) {
        translation_delta.z -= 1.0;
    }
    if keys.pressed(KeyCode::ArrowDown) {
        translation_delta.z += 1.0;
    }
    if keys.pressed(KeyCode::Home) {
        speed_factor = 1.0 / camera.acceleration;
    }
    if keys.pressed(KeyCode::End) {
        speed_factor = camera.acceleration;
    }

    camera.translation_speed *= speed_factor;

    if mouse_buttons.pressed(MouseButton::Right) {
        let rotation_delta = -mouse_motion.delta * camera.rotation_speed;
        camera.yaw += rotation_delta.x;
        camera.pitch = (camera.pitch + rotation_delta.y).clamp(-89.0, 89.0);
    }

    transform.rotation = Quat::from_euler(
        EulerRot::YXZ,
        camera.yaw.to_radians(),
        camera.pitch.to_radians(),
        0.0,
    );

    let heading = Quat::from_rotation_y(camera.yaw.to_radians());
    transform.translation +=
        heading * translation_delta.normalize_or_zero() * camera.translation_speed * delta_time;
}
