//! Camera Module
//!
//! Yaw-only fly camera driven by W/A/S/D and the constant buffer record the
//! vertex shader reads.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

use crate::input::{Key, KeyState};

/// Constant buffer contents: the transform plus padding to a 256 byte view
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct CameraConstants {
    /// Column-major world-view-projection
    pub world_view_projection: [f32; 16],
    padding: [[f32; 4]; 12],
}

const _: () = assert!(std::mem::size_of::<CameraConstants>() == 256);

impl CameraConstants {
    pub fn new(world_view_projection: Mat4) -> Self {
        Self {
            world_view_projection: world_view_projection.to_cols_array(),
            padding: [[0.0; 4]; 12],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraSettings {
    /// Radians per frame while A or D is held
    pub rotation_speed: f32,
    /// World units per frame while W or S is held
    pub move_speed: f32,
    pub fov_degrees: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            rotation_speed: 0.03,
            move_speed: 0.05,
            fov_degrees: 45.0,
            near: 1.0,
            far: 100.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Camera {
    position: Vec3,
    yaw: f32,
    settings: CameraSettings,
}

impl Camera {
    pub fn new(settings: CameraSettings) -> Self {
        Self {
            position: Vec3::new(1.0, 1.0, 0.0),
            yaw: 0.0,
            settings,
        }
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn yaw(&self) -> f32 {
        self.yaw
    }

    /// Apply one frame of held keys. Returns whether the camera moved.
    pub fn update(&mut self, keys: &KeyState) -> bool {
        let (position, yaw) = (self.position, self.yaw);
        let s = &self.settings;

        if keys.is_held(Key::A) {
            self.yaw += s.rotation_speed;
        }
        if keys.is_held(Key::D) {
            self.yaw -= s.rotation_speed;
        }

        let forward = Vec3::new(-self.yaw.sin(), 0.0, self.yaw.cos());
        if keys.is_held(Key::W) {
            self.position += forward * s.move_speed;
        }
        if keys.is_held(Key::S) {
            self.position -= forward * s.move_speed;
        }

        position != self.position || yaw != self.yaw
    }

    /// Projection * rotation * translation, for column vectors.
    pub fn world_view_projection(&self, aspect_ratio: f32) -> Mat4 {
        let s = &self.settings;
        let projection =
            Mat4::perspective_lh(s.fov_degrees.to_radians(), aspect_ratio, s.near, s.far);
        projection * Mat4::from_rotation_y(self.yaw) * Mat4::from_translation(-self.position)
    }

    pub fn constants(&self, aspect_ratio: f32) -> CameraConstants {
        CameraConstants::new(self.world_view_projection(aspect_ratio))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn held(keys: &[Key]) -> KeyState {
        let mut state = KeyState::new();
        for &key in keys {
            state.press(key);
        }
        state
    }

    #[test]
    fn test_initial_state() {
        let camera = Camera::new(CameraSettings::default());
        assert_eq!(camera.position(), Vec3::new(1.0, 1.0, 0.0));
        assert_eq!(camera.yaw(), 0.0);
    }

    #[test]
    fn test_no_keys_changes_nothing() {
        let mut camera = Camera::new(CameraSettings::default());
        let before = camera.constants(16.0 / 9.0);
        assert!(!camera.update(&KeyState::new()));
        assert_eq!(camera.constants(16.0 / 9.0), before);
    }

    #[test]
    fn test_rotate_keys() {
        let mut camera = Camera::new(CameraSettings::default());
        camera.update(&held(&[Key::A]));
        assert!((camera.yaw() - 0.03).abs() < 1e-6);
        camera.update(&held(&[Key::D]));
        camera.update(&held(&[Key::D]));
        assert!((camera.yaw() + 0.03).abs() < 1e-6);
        assert!(!camera.update(&held(&[Key::A, Key::D])));
    }

    #[test]
    fn test_move_along_yaw() {
        let mut camera = Camera::new(CameraSettings::default());
        camera.update(&held(&[Key::W]));
        assert!((camera.position() - Vec3::new(1.0, 1.0, 0.05)).length() < 1e-6);
        camera.update(&held(&[Key::S]));
        assert!((camera.position() - Vec3::new(1.0, 1.0, 0.0)).length() < 1e-6);

        let mut turned = Camera::new(CameraSettings {
            rotation_speed: std::f32::consts::FRAC_PI_2,
            ..CameraSettings::default()
        });
        turned.update(&held(&[Key::A]));
        turned.update(&held(&[Key::W]));
        assert!((turned.position() - Vec3::new(0.95, 1.0, 0.0)).length() < 1e-5);
    }

    #[test]
    fn test_camera_position_maps_to_origin() {
        let camera = Camera::new(CameraSettings::default());
        // a point straight ahead of the camera lands in the middle of the screen
        let ahead = camera.position() + Vec3::new(0.0, 0.0, 10.0);
        let clip = camera.world_view_projection(1.0) * ahead.extend(1.0);
        let ndc = clip.truncate() / clip.w;
        assert!(ndc.x.abs() < 1e-5);
        assert!(ndc.y.abs() < 1e-5);
        assert!(ndc.z > 0.0 && ndc.z < 1.0);
    }

    #[test]
    fn test_constants_layout() {
        let constants = CameraConstants::new(Mat4::IDENTITY);
        let bytes = bytemuck::bytes_of(&constants);
        assert_eq!(bytes.len(), 256);
        assert_eq!(&bytes[0..4], &1.0f32.to_le_bytes());
        assert!(bytes[64..].iter().all(|&b| b == 0));
    }
}
