//! Persistent renderer configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::camera::Camera;
use crate::loader::LoaderConfig;
use crate::util::Result;

/// Renderer settings, stored as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    // Output
    pub width: u32,
    pub height: u32,
    pub clear_color: [f32; 4],
    pub output_dir: PathBuf,

    // Scene
    pub search_paths: Vec<PathBuf>,
    pub linearize_materials: bool,
    pub camera: Camera,
    pub light_dir: [f32; 3],

    // Demo loop
    pub frames: u32,
    pub resize_every: u32,
    pub resize_factor: f32,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            clear_color: [1.0, 1.0, 1.0, 1.0],
            output_dir: PathBuf::from("frames"),
            search_paths: Vec::new(),
            linearize_materials: true,
            camera: Camera::default(),
            light_dir: [0.4, 1.0, -0.5],
            frames: 10,
            resize_every: 3,
            resize_factor: 1.1,
        }
    }
}

impl RendererConfig {
    /// Default location: `<config dir>/headless-rt/config.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|mut p| {
            p.push("headless-rt");
            p.push("config.json");
            p
        })
    }

    /// Read a config file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Read the default config file, falling back to defaults when it is
    /// absent or unreadable.
    pub fn load_or_default() -> Self {
        let Some(path) = Self::default_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::from_file(&path) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable config");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn loader(&self) -> LoaderConfig {
        LoaderConfig::with_search_paths(self.search_paths.clone())
    }

    /// Size after `step` resizes by `resize_factor`.
    pub fn scaled_size(&self, step: u32) -> (u32, u32) {
        let f = self.resize_factor.powi(step as i32);
        let scale = |v: u32| ((v as f32 * f).round() as u32).max(1);
        (scale(self.width), scale(self.height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cfg.json");
        std::fs::write(&path, r#"{ "width": 640, "search_paths": ["assets"] }"#).expect("write");

        let cfg = RendererConfig::from_file(&path).expect("load");
        assert_eq!(cfg.width, 640);
        assert_eq!(cfg.height, 720);
        assert_eq!(cfg.search_paths, vec![PathBuf::from("assets")]);
        assert_eq!(cfg.camera, Camera::default());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("cfg.json");
        let cfg = RendererConfig {
            frames: 3,
            linearize_materials: false,
            ..Default::default()
        };
        cfg.save(&path).expect("save");
        assert_eq!(RendererConfig::from_file(&path).expect("load"), cfg);
    }

    #[test]
    fn test_bad_json_is_config_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cfg.json");
        std::fs::write(&path, "{ width: ").expect("write");
        let err = RendererConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }

    #[test]
    fn test_scaled_size() {
        let cfg = RendererConfig::default();
        assert_eq!(cfg.scaled_size(0), (1280, 720));
        assert_eq!(cfg.scaled_size(1), (1408, 792));
    }
}
