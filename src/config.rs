//! Configuration Module
//!
//! Handles the viewer's TOML configuration file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::camera::CameraSettings;
use crate::presentation::PresentationMode;
use crate::recorder::DEFAULT_CLEAR_COLOR;
use crate::renderer::RendererSettings;

/// Viewer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Presentation mode: "windowed" or "headless"
    #[serde(default = "default_presentation_mode")]
    pub presentation_mode: String,

    /// Surface width (0 = desktop width when windowed)
    #[serde(default)]
    pub width: u32,

    /// Surface height (0 = desktop height when windowed)
    #[serde(default)]
    pub height: u32,

    /// Use the WARP software rasterizer instead of a hardware adapter
    #[serde(default)]
    pub use_warp_device: bool,

    /// VSync enabled
    #[serde(default = "default_vsync")]
    pub vsync: bool,

    /// OBJ file with the scene triangles
    #[serde(default = "default_scene_path")]
    pub scene_path: PathBuf,

    /// Image sampled by every triangle
    #[serde(default = "default_texture_path")]
    pub texture_path: PathBuf,

    /// Camera yaw change per frame, in radians
    #[serde(default = "default_rotation_speed")]
    pub rotation_speed: f32,

    /// Camera movement per frame, in world units
    #[serde(default = "default_move_speed")]
    pub move_speed: f32,

    /// Vertical field of view, in degrees
    #[serde(default = "default_fov_degrees")]
    pub fov_degrees: f32,

    /// Render target clear colour (RGBA)
    #[serde(default = "default_clear_color")]
    pub clear_color: [f32; 4],

    /// Frames rendered before exiting in headless mode
    #[serde(default = "default_headless_frames")]
    pub headless_frames: u32,
}

/// Surface size used in headless mode when none is configured
pub const HEADLESS_SIZE: (u32, u32) = (1280, 720);

fn default_presentation_mode() -> String {
    if cfg!(windows) { "windowed" } else { "headless" }.to_string()
}

fn default_vsync() -> bool {
    true
}

fn default_scene_path() -> PathBuf {
    PathBuf::from("Assets/SceneData.obj")
}

fn default_texture_path() -> PathBuf {
    PathBuf::from("Assets/Texture.png")
}

fn default_rotation_speed() -> f32 {
    CameraSettings::default().rotation_speed
}

fn default_move_speed() -> f32 {
    CameraSettings::default().move_speed
}

fn default_fov_degrees() -> f32 {
    CameraSettings::default().fov_degrees
}

fn default_clear_color() -> [f32; 4] {
    DEFAULT_CLEAR_COLOR
}

fn default_headless_frames() -> u32 {
    120
}

impl Default for Config {
    fn default() -> Self {
        Self {
            presentation_mode: default_presentation_mode(),
            width: 0,
            height: 0,
            use_warp_device: false,
            vsync: default_vsync(),
            scene_path: default_scene_path(),
            texture_path: default_texture_path(),
            rotation_speed: default_rotation_speed(),
            move_speed: default_move_speed(),
            fov_degrees: default_fov_degrees(),
            clear_color: default_clear_color(),
            headless_frames: default_headless_frames(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    #[allow(dead_code)]
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn mode(&self) -> Result<PresentationMode> {
        self.presentation_mode.parse()
    }

    /// Configured size with headless fallbacks applied to zero dimensions.
    pub fn headless_size(&self) -> (u32, u32) {
        let width = if self.width == 0 { HEADLESS_SIZE.0 } else { self.width };
        let height = if self.height == 0 { HEADLESS_SIZE.1 } else { self.height };
        (width, height)
    }

    pub fn renderer_settings(&self) -> RendererSettings {
        RendererSettings {
            clear_color: self.clear_color,
            vsync: self.vsync,
            camera: CameraSettings {
                rotation_speed: self.rotation_speed,
                move_speed: self.move_speed,
                fov_degrees: self.fov_degrees,
                ..CameraSettings::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.scene_path, PathBuf::from("Assets/SceneData.obj"));
        assert_eq!(config.fov_degrees, 45.0);
        assert_eq!(config.clear_color, [0.0, 0.2, 0.4, 1.0]);
    }

    #[test]
    fn test_partial_override() {
        let config: Config = toml::from_str(
            "presentation_mode = \"headless\"\nwidth = 640\nmove_speed = 0.5\n",
        )
        .unwrap();
        assert_eq!(config.mode().unwrap(), PresentationMode::Headless);
        assert_eq!(config.headless_size(), (640, 720));
        assert_eq!(config.move_speed, 0.5);
        assert!(config.vsync);
    }

    #[test]
    fn test_renderer_settings() {
        let config = Config {
            rotation_speed: 0.1,
            vsync: false,
            ..Config::default()
        };
        let settings = config.renderer_settings();
        assert!(!settings.vsync);
        assert_eq!(settings.camera.rotation_speed, 0.1);
        assert_eq!(settings.camera.near, 1.0);
        assert_eq!(settings.camera.far, 100.0);
    }

    #[test]
    fn test_invalid_mode() {
        let config = Config {
            presentation_mode: "dual".into(),
            ..Config::default()
        };
        assert!(config.mode().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("meshview-config-{}.toml", std::process::id()));
        let config = Config {
            width: 800,
            height: 600,
            headless_frames: 3,
            ..Config::default()
        };
        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
