//! Host-facing renderer: scene assembly plus the frame controller.

use std::path::Path;

use glam::{Mat4, Vec3};

use crate::config::RendererConfig;
use crate::device::RenderBackend;
use crate::frame::{FrameController, FrameReport};
use crate::loader::{self, LoaderConfig, ModelSource};
use crate::model::Mesh;
use crate::output::{ResolvedTexture, TextureHandle};
use crate::scene::{InstanceId, ModelId, ModelRegistry, SceneEditQueue};
use crate::util::{Error, Result};

/// A scene and the device that renders it.
pub struct Renderer<B: RenderBackend> {
    config: RendererConfig,
    loader: LoaderConfig,
    registry: ModelRegistry,
    edits: SceneEditQueue,
    frames: FrameController<B>,
    last: Option<FrameReport>,
}

impl<B: RenderBackend> Renderer<B> {
    pub fn new(config: RendererConfig, device: B) -> Result<Self> {
        let mut frames = FrameController::new(device, config.width, config.height)?;
        frames.set_camera(config.camera);
        frames.set_background(config.clear_color, Vec3::from_array(config.light_dir));
        Ok(Self {
            loader: config.loader(),
            config,
            registry: ModelRegistry::new(),
            edits: SceneEditQueue::new(),
            frames,
            last: None,
        })
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Direct scene access for the thread driving the frame loop.
    pub fn registry_mut(&mut self) -> &mut ModelRegistry {
        &mut self.registry
    }

    /// Handle for publishing edits from other threads.
    pub fn edit_queue(&self) -> SceneEditQueue {
        self.edits.clone()
    }

    pub fn frames(&self) -> &FrameController<B> {
        &self.frames
    }

    pub fn device(&self) -> &B {
        self.frames.device()
    }

    fn load_mesh(&self, source: &ModelSource) -> Result<Mesh> {
        let mut mesh = loader::load(source, &self.loader)?;
        if self.config.linearize_materials {
            mesh.linearize_materials();
        }
        Ok(mesh)
    }

    /// Load a model and place one instance of it.
    pub fn load_model(&mut self, source: &ModelSource, transform: Mat4) -> Result<InstanceId> {
        let mesh = self.load_mesh(source)?;
        Ok(self.registry.add_model(mesh, transform))
    }

    /// Load several models. Sources that fail to load or normalize are
    /// skipped with a warning; device and precondition errors abort.
    pub fn load_scene(&mut self, sources: &[(ModelSource, Mat4)]) -> Result<Vec<InstanceId>> {
        let mut placed = Vec::with_capacity(sources.len());
        for (source, transform) in sources {
            match self.load_model(source, *transform) {
                Ok(id) => placed.push(id),
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(source = %source.name(), error = %e, "model skipped");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(placed)
    }

    pub fn add_instance(&mut self, model: ModelId, transform: Mat4) -> Result<InstanceId> {
        self.registry.add_instance(model, transform)
    }

    /// Model behind an instance.
    pub fn model_of(&self, instance: InstanceId) -> Result<ModelId> {
        Ok(self.registry.instance(instance)?.model)
    }

    /// Replace a model's mesh with a newly loaded one of any topology. The
    /// next frame rebuilds its structures.
    pub fn replace_model(&mut self, model: ModelId, source: &ModelSource) -> Result<()> {
        let mesh = self.load_mesh(source)?;
        self.registry.replace_mesh(model, mesh)
    }

    /// Request a new output size for the next frame.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.frames.resize(width, height)
    }

    pub fn size(&self) -> (u32, u32) {
        self.frames.size()
    }

    /// Render a frame with whatever edits have been published.
    pub fn render(&mut self) -> Result<FrameReport> {
        let pending = self.edits.take();
        let report = self.frames.render(&mut self.registry, pending)?;
        self.last = Some(report.clone());
        Ok(report)
    }

    /// Report of the latest frame.
    pub fn last_frame(&self) -> Option<&FrameReport> {
        self.last.as_ref()
    }

    /// Resolved texture; the handle must come from the latest frame.
    pub fn texture(&self, handle: TextureHandle) -> Result<&ResolvedTexture> {
        self.frames.texture(handle)
    }

    /// Write the latest frame as a PNG.
    pub fn save_frame(&self, path: impl AsRef<Path>) -> Result<()> {
        if self.last.is_none() {
            return Err(Error::precondition("save_frame before any frame was rendered"));
        }
        self.frames.resolver().save_png(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SoftwareDevice;
    use crate::loader::Primitive;

    fn renderer() -> Renderer<SoftwareDevice> {
        let config = RendererConfig {
            width: 8,
            height: 6,
            ..Default::default()
        };
        Renderer::new(config, SoftwareDevice::new()).expect("renderer")
    }

    #[test]
    fn test_load_scene_skips_bad_sources() {
        let mut r = renderer();
        let ids = r
            .load_scene(&[
                (ModelSource::procedural(Primitive::Triangle), Mat4::IDENTITY),
                (ModelSource::obj_file("does/not/exist.obj"), Mat4::IDENTITY),
                (
                    ModelSource::procedural(Primitive::Cube { size: 1.0 }),
                    Mat4::from_translation(Vec3::X),
                ),
            ])
            .expect("scene");
        assert_eq!(ids.len(), 2);
        assert_eq!(r.registry().model_count(), 2);
    }

    #[test]
    fn test_linearized_on_load() {
        let mut r = renderer();
        let id = r
            .load_model(&ModelSource::procedural(Primitive::Triangle), Mat4::IDENTITY)
            .expect("load");
        let model = r.model_of(id).expect("model");
        let diffuse = r.registry().mesh(model).expect("mesh").materials()[0].diffuse[0];
        assert!((diffuse - 0.7f32.powf(2.2)).abs() < 1e-5);
    }

    #[test]
    fn test_save_before_render_fails() {
        let r = renderer();
        let dir = tempfile::tempdir().expect("tempdir");
        let err = r.save_frame(dir.path().join("f.png")).unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[test]
    fn test_published_edits_are_consumed() {
        let mut r = renderer();
        let id = r
            .load_model(&ModelSource::procedural(Primitive::Triangle), Mat4::IDENTITY)
            .expect("load");
        r.render().expect("first");

        let queue = r.edit_queue();
        let mut update = crate::scene::SceneUpdate::new();
        update.set_transform(id, Mat4::from_translation(Vec3::Z));
        queue.publish(update);
        let report = r.render().expect("second");
        assert!(report.steps.contains(&crate::frame::FrameStep::TlasRefit));
        assert!(!queue.has_pending());
        assert_eq!(
            r.registry().instance(id).expect("instance").transform,
            Mat4::from_translation(Vec3::Z)
        );
    }
}
