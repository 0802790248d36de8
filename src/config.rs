// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every field has a default, so a missing file or a partial file still yields
// a complete configuration.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
    pub assets: AssetConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Render Box".to_string(),
            width: 1024,
            height: 768,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub clear_color: [f32; 4],
    /// Minimum number of images requested from the presentation engine
    pub image_count: u32,
    /// Rebuild the swapchain on resize / out-of-date instead of failing
    pub recreate_swapchain: bool,
    /// Bound for fence waits and image acquisition; 0 waits forever
    pub fence_timeout_ms: u64,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "fifo".to_string(),
            clear_color: [0.1, 0.1, 0.1, 1.0],
            image_count: 2,
            recreate_swapchain: true,
            fence_timeout_ms: 5000,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub abort_on_validation_error: bool,
    pub gpu_timing: bool,
    pub show_fps: bool,
    pub log_level: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            abort_on_validation_error: true,
            gpu_timing: true,
            show_fps: true,
            log_level: "info".to_string(),
        }
    }
}

/// Shader binaries and the optional mesh asset
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AssetConfig {
    pub vertex_shader: PathBuf,
    pub fragment_shader: PathBuf,
    /// Vertex stage used instead of `vertex_shader` when a mesh is drawn
    pub mesh_vertex_shader: PathBuf,
    pub mesh: Option<PathBuf>,
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            vertex_shader: PathBuf::from("shaders/triangle.vert.spv"),
            fragment_shader: PathBuf::from("shaders/triangle.frag.spv"),
            mesh_vertex_shader: PathBuf::from("shaders/mesh.vert.spv"),
            mesh: None,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Get present mode as Vulkan enum
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => vk::PresentModeKHR::MAILBOX,
            "fifo" => vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to FIFO",
                    self.graphics.present_mode
                );
                vk::PresentModeKHR::FIFO
            }
        }
    }

    /// Wait bound in the form Vulkan expects (nanoseconds, u64::MAX = forever)
    pub fn wait_timeout_ns(&self) -> u64 {
        match self.graphics.fence_timeout_ms {
            0 => u64::MAX,
            ms => u64::try_from(Duration::from_millis(ms).as_nanos()).unwrap_or(u64::MAX),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_setup() {
        let config = Config::default();
        assert_eq!(config.window.width, 1024);
        assert_eq!(config.window.height, 768);
        assert_eq!(config.graphics.image_count, 2);
        assert_eq!(config.present_mode(), vk::PresentModeKHR::FIFO);
        assert!(config.assets.mesh.is_none());
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let config = Config::from_toml_str(
            r#"
            [graphics]
            present_mode = "mailbox"
            fence_timeout_ms = 0

            [assets]
            mesh = "assets/bunny.obj"
            "#,
        )
        .unwrap();

        assert_eq!(config.present_mode(), vk::PresentModeKHR::MAILBOX);
        assert_eq!(config.wait_timeout_ns(), u64::MAX);
        assert_eq!(config.assets.mesh, Some(PathBuf::from("assets/bunny.obj")));
        assert_eq!(config.window.title, "Render Box");
        assert!(config.debug.validation_layers);
    }

    #[test]
    fn unknown_present_mode_falls_back_to_fifo() {
        let config = Config::from_toml_str("[graphics]\npresent_mode = \"vsync-ish\"\n").unwrap();
        assert_eq!(config.present_mode(), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn timeout_is_converted_to_nanoseconds() {
        let config = Config::from_toml_str("[graphics]\nfence_timeout_ms = 250\n").unwrap();
        assert_eq!(config.wait_timeout_ns(), 250_000_000);
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(Config::from_toml_str("[window\nwidth = 3").is_err());
    }
}
