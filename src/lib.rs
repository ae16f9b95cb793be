//! # headless-rt
//!
//! Headless ray-tracing renderer core. Meshes from any source are normalized
//! into one shape, registered as models and instances, and traced through a
//! two-level acceleration structure that is refit or rebuilt frame by frame.
//!
//! ## Modules
//!
//! - [`util`] - Errors, bounding boxes and transform helpers
//! - [`model`] - Normalized mesh model (vertices, triangles, materials)
//! - [`loader`] - OBJ, scene-description and procedural adapters
//! - [`scene`] - Model registry, edit handoff, animation
//! - [`accel`] - Bottom/top-level structure lifecycle over a device seam
//! - [`device`] - Software (and optional wgpu) ray-tracing devices
//! - [`frame`] - Per-frame ordering of resize, refit, trace and resolve
//! - [`output`] - Output images, resolved textures, PNG export
//!
//! ## Example
//!
//! ```ignore
//! use headless_rt::prelude::*;
//!
//! let mut renderer = Renderer::new(RendererConfig::default(), SoftwareDevice::new())?;
//! renderer.load_model(&ModelSource::obj_file("cube.obj"), Mat4::IDENTITY)?;
//! renderer.render()?;
//! renderer.save_frame("frame.png")?;
//! ```

pub mod util;
pub mod model;
pub mod loader;
pub mod scene;
pub mod accel;
pub mod device;
pub mod frame;
pub mod output;
pub mod camera;
pub mod config;
pub mod renderer;

// Re-export commonly used types
pub use util::{Error, Result};
pub use config::RendererConfig;
pub use renderer::Renderer;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::util::{Aabb, Error, Result};
    pub use crate::model::{Material, Mesh, Vertex};
    pub use crate::loader::{LoaderConfig, ModelSource, Primitive, SceneDescription};
    pub use crate::scene::{InstanceId, ModelId, ModelRegistry, SceneEditQueue, SceneUpdate};
    pub use crate::accel::{AccelBackend, BuildFlags};
    pub use crate::device::{RenderBackend, SoftwareDevice, TraceBackend};
    pub use crate::frame::{FrameReport, FrameStep};
    pub use crate::output::TextureHandle;
    pub use crate::camera::Camera;
    pub use crate::config::RendererConfig;
    pub use crate::renderer::Renderer;
    pub use glam::{Mat4, Vec3};
}
