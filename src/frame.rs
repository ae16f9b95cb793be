//! Per-frame orchestration.
//!
//! One frame runs these steps in order, each completing before the next:
//!
//! 1. resize: reallocate the output image when the requested size changed,
//!    invalidating the resolved texture
//! 2. apply pending vertex edits, then build/refit/rebuild bottom-level
//!    structures
//! 3. apply pending transforms, then refit or rebuild the top-level
//!    structure
//! 4. dispatch one ray per pixel at the current output size
//! 5. resolve the output into the host texture
//!
//! A frame with no edits skips 2-3 and submits only the trace dispatch.

use std::collections::BTreeSet;

use glam::Vec3;

use crate::accel::{BlasManager, TlasManager, TlasState};
use crate::camera::Camera;
use crate::device::{ObjectDesc, RenderBackend};
use crate::output::{OutputResolver, ResolvedTexture, TextureHandle};
use crate::scene::{DirtySet, ModelId, ModelRegistry, SceneUpdate};
use crate::util::{Error, Result};

/// One executed step of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStep {
    Resized { width: u32, height: u32 },
    BlasBuilt(ModelId),
    BlasRefit(ModelId),
    BlasRebuilt(ModelId),
    ObjectsUploaded,
    TlasBuilt,
    TlasRefit,
    TlasRebuilt,
    TraceDispatched { width: u32, height: u32 },
    Resolved(TextureHandle),
}

impl FrameStep {
    /// Whether the step records device work that is waited on.
    pub fn is_submission(&self) -> bool {
        !matches!(
            self,
            Self::Resized { .. } | Self::ObjectsUploaded | Self::Resolved(_)
        )
    }
}

/// What a frame did.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameReport {
    pub frame: u64,
    pub steps: Vec<FrameStep>,
    pub submissions: u32,
    pub texture: TextureHandle,
}

impl FrameReport {
    /// Nothing but the trace was submitted.
    pub fn is_static(&self) -> bool {
        self.submissions == 1
    }

    pub fn resized(&self) -> bool {
        self.steps.iter().any(|s| matches!(s, FrameStep::Resized { .. }))
    }

    /// Size of the trace dispatch.
    pub fn dispatch_size(&self) -> Option<(u32, u32)> {
        self.steps.iter().find_map(|s| match s {
            FrameStep::TraceDispatched { width, height } => Some((*width, *height)),
            _ => None,
        })
    }
}

/// Drives a device through frames.
pub struct FrameController<B: RenderBackend> {
    device: B,
    blas: BlasManager,
    tlas: TlasManager,
    resolver: OutputResolver,
    size: (u32, u32),
    objects_uploaded: bool,
    frame: u64,
    camera: Camera,
    clear_color: [f32; 4],
    light_dir: Vec3,
}

impl<B: RenderBackend> FrameController<B> {
    pub fn new(device: B, width: u32, height: u32) -> Result<Self> {
        check_size(width, height)?;
        Ok(Self {
            device,
            blas: BlasManager::new(),
            tlas: TlasManager::new(),
            resolver: OutputResolver::new(),
            size: (width, height),
            objects_uploaded: false,
            frame: 0,
            camera: Camera::default(),
            clear_color: [1.0; 4],
            light_dir: Vec3::Y,
        })
    }

    pub fn device(&self) -> &B {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut B {
        &mut self.device
    }

    pub fn blas(&self) -> &BlasManager {
        &self.blas
    }

    pub fn tlas(&self) -> &TlasManager {
        &self.tlas
    }

    pub fn resolver(&self) -> &OutputResolver {
        &self.resolver
    }

    /// Frames rendered so far.
    pub fn frame_count(&self) -> u64 {
        self.frame
    }

    /// Requested output size; applied at the start of the next frame.
    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn set_camera(&mut self, camera: Camera) {
        self.camera = camera;
    }

    pub fn set_background(&mut self, clear_color: [f32; 4], light_dir: Vec3) {
        self.clear_color = clear_color;
        self.light_dir = light_dir;
    }

    /// Request a new output size. Takes effect at the next frame.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        check_size(width, height)?;
        if self.size != (width, height) {
            tracing::debug!(width, height, "resize requested");
        }
        self.size = (width, height);
        Ok(())
    }

    /// Current resolved texture. Re-query after every resize.
    pub fn texture(&self, handle: TextureHandle) -> Result<&ResolvedTexture> {
        self.resolver.texture(handle)
    }

    /// Render one frame, applying `pending` edits first.
    #[tracing::instrument(skip_all, fields(frame = self.frame))]
    pub fn render(&mut self, registry: &mut ModelRegistry, pending: Option<SceneUpdate>) -> Result<FrameReport> {
        if let Some(update) = &pending {
            update.validate(registry)?;
        }
        let mut steps = Vec::new();

        // 1. resize
        let (width, height) = self.size;
        if self.device.output_size() != Some((width, height)) {
            self.device.allocate_output(width, height)?;
            self.resolver.invalidate();
            steps.push(FrameStep::Resized { width, height });
        }

        // 2. geometry
        if let Some(update) = &pending {
            update.apply_geometry(registry)?;
        }
        let geometry = registry.take_dirty();
        let new_addresses = match self.update_bottom_level(registry, &geometry, &mut steps) {
            Ok(changed) => changed,
            Err(e) => {
                registry.restore_dirty(geometry);
                return Err(e);
            }
        };

        // 3. transforms
        let applied = match &pending {
            Some(update) => update.apply_transforms(registry),
            None => Ok(()),
        };
        let transforms = registry.take_dirty();
        let instances_changed = geometry.instances_added || transforms.instances_added || new_addresses;
        let moved = geometry.transforms || transforms.transforms || !geometry.geometry.is_empty();
        if let Err(e) = applied.and_then(|_| self.update_top_level(registry, instances_changed, moved, &mut steps)) {
            // refit or rebuild again next frame
            registry.restore_dirty(geometry);
            registry.restore_dirty(transforms);
            return Err(e);
        }

        // 4. trace
        let handle = self
            .tlas
            .handle()
            .ok_or_else(|| Error::precondition("trace dispatch without a top-level structure"))?;
        let uniform = self.camera.uniform(width, height, self.clear_color, self.light_dir);
        self.device.update_uniform(&uniform)?;
        self.device.dispatch_rays(handle, width, height)?;
        steps.push(FrameStep::TraceDispatched { width, height });

        // 5. resolve
        let image = self.device.read_output()?;
        let texture = self.resolver.resolve(&image)?;
        steps.push(FrameStep::Resolved(texture));

        let report = FrameReport {
            frame: self.frame,
            submissions: steps.iter().filter(|s| s.is_submission()).count() as u32,
            steps,
            texture,
        };
        tracing::debug!(steps = report.steps.len(), submissions = report.submissions, "frame done");
        self.frame += 1;
        Ok(report)
    }

    /// Returns true when any bottom-level address changed.
    fn update_bottom_level(
        &mut self,
        registry: &ModelRegistry,
        dirty: &DirtySet,
        steps: &mut Vec<FrameStep>,
    ) -> Result<bool> {
        let built: BTreeSet<ModelId> = self
            .blas
            .build_missing(&mut self.device, registry)?
            .into_iter()
            .collect();
        steps.extend(built.iter().map(|&m| FrameStep::BlasBuilt(m)));

        let mut rebuilt = false;
        for &model in dirty.topology.difference(&built) {
            self.blas.build(&mut self.device, registry, model)?;
            steps.push(FrameStep::BlasRebuilt(model));
            rebuilt = true;
        }
        for &model in &dirty.geometry {
            if built.contains(&model) || dirty.topology.contains(&model) {
                continue;
            }
            self.blas.refit(&mut self.device, registry, model)?;
            steps.push(FrameStep::BlasRefit(model));
        }

        if !self.objects_uploaded || dirty.models_added || !dirty.topology.is_empty() {
            let objects: Vec<ObjectDesc> = registry.meshes().iter().map(ObjectDesc::from_mesh).collect();
            self.device.upload_objects(&objects)?;
            self.objects_uploaded = true;
            steps.push(FrameStep::ObjectsUploaded);
        }
        Ok(!built.is_empty() || rebuilt)
    }

    fn update_top_level(
        &mut self,
        registry: &ModelRegistry,
        instances_changed: bool,
        moved: bool,
        steps: &mut Vec<FrameStep>,
    ) -> Result<()> {
        match self.tlas.state() {
            TlasState::Empty => {
                self.tlas.build(&mut self.device, registry, &self.blas)?;
                steps.push(FrameStep::TlasBuilt);
            }
            TlasState::Built { .. } if instances_changed => {
                self.tlas.build(&mut self.device, registry, &self.blas)?;
                steps.push(FrameStep::TlasRebuilt);
            }
            TlasState::Built { .. } if moved => {
                self.tlas.refit(&mut self.device, registry, &self.blas)?;
                steps.push(FrameStep::TlasRefit);
            }
            TlasState::Built { .. } => {}
        }
        Ok(())
    }
}

fn check_size(width: u32, height: u32) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(Error::precondition(format!("invalid output size {}x{}", width, height)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SoftwareDevice;
    use crate::loader::{self, LoaderConfig, ModelSource, Primitive};
    use crate::scene::InstanceId;
    use glam::Mat4;

    fn registry() -> (ModelRegistry, ModelId) {
        let mut registry = ModelRegistry::new();
        let mesh = loader::load(&ModelSource::procedural(Primitive::Cube { size: 1.0 }), &LoaderConfig::default())
            .expect("load");
        let inst = registry.add_model(mesh, Mat4::IDENTITY);
        let model = registry.instance(inst).expect("instance").model;
        (registry, model)
    }

    fn controller(w: u32, h: u32) -> FrameController<SoftwareDevice> {
        let mut fc = FrameController::new(SoftwareDevice::new(), w, h).expect("controller");
        fc.set_camera(Camera::look_at(Vec3::new(0.0, 0.0, 4.0), Vec3::ZERO));
        fc
    }

    #[test]
    fn test_first_frame_order() {
        let (mut registry, model) = registry();
        let mut fc = controller(16, 8);
        let report = fc.render(&mut registry, None).expect("frame");
        assert_eq!(
            report.steps,
            vec![
                FrameStep::Resized { width: 16, height: 8 },
                FrameStep::BlasBuilt(model),
                FrameStep::ObjectsUploaded,
                FrameStep::TlasBuilt,
                FrameStep::TraceDispatched { width: 16, height: 8 },
                FrameStep::Resolved(report.texture),
            ]
        );
        assert_eq!(report.submissions, 3);
        assert!(!report.is_static());
    }

    #[test]
    fn test_static_frame_single_submission() {
        let (mut registry, _) = registry();
        let mut fc = controller(8, 8);
        fc.render(&mut registry, None).expect("first");
        let before = fc.device().submissions();
        let report = fc.render(&mut registry, None).expect("second");
        assert!(report.is_static());
        assert_eq!(fc.device().submissions() - before, 1);
        assert_eq!(report.frame, 1);
    }

    #[test]
    fn test_geometry_edit_refits_both_levels() {
        let (mut registry, model) = registry();
        let mut fc = controller(8, 8);
        fc.render(&mut registry, None).expect("first");

        let lifted: Vec<Vec3> = registry
            .mesh(model)
            .expect("mesh")
            .vertices()
            .iter()
            .map(|v| v.position() + Vec3::Y)
            .collect();
        let mut update = SceneUpdate::new();
        update.set_vertices(model, lifted, None);
        let report = fc.render(&mut registry, Some(update)).expect("frame");
        let blas_at = report.steps.iter().position(|s| *s == FrameStep::BlasRefit(model));
        let tlas_at = report.steps.iter().position(|s| *s == FrameStep::TlasRefit);
        assert!(blas_at.expect("blas refit") < tlas_at.expect("tlas refit"));
        assert_eq!(report.submissions, 3);
    }

    #[test]
    fn test_rejected_update_leaves_scene_untouched() {
        let mut registry = ModelRegistry::new();
        let mesh = loader::load(&ModelSource::procedural(Primitive::Triangle), &LoaderConfig::default())
            .expect("load");
        let inst = registry.add_model(mesh, Mat4::IDENTITY);
        let model = registry.instance(inst).expect("instance").model;
        let mut fc = controller(8, 8);
        fc.render(&mut registry, None).expect("first");

        let shifted: Vec<Vec3> = registry
            .mesh(model)
            .expect("mesh")
            .vertices()
            .iter()
            .map(|v| v.position() + Vec3::X * 10.0)
            .collect();
        let mut bad = SceneUpdate::new();
        bad.set_vertices(model, shifted.clone(), None)
            .set_transform(InstanceId::from_index(99), Mat4::IDENTITY);
        let err = fc.render(&mut registry, Some(bad)).unwrap_err();
        assert!(matches!(err, Error::UnknownInstance(99)));
        assert_eq!(registry.mesh(model).expect("mesh").vertices()[0].position(), Vec3::ZERO);
        assert!(!registry.has_pending_changes());
        assert_eq!(fc.frame_count(), 1);

        let tlas = fc.tlas().handle().expect("tlas");
        let down = Vec3::NEG_Z;
        let report = fc.render(&mut registry, None).expect("static");
        assert!(report.is_static());
        assert!(fc.device().trace(tlas, Vec3::new(0.25, 0.25, 5.0), down).expect("trace").is_some());

        let mut good = SceneUpdate::new();
        good.set_vertices(model, shifted, None);
        let report = fc.render(&mut registry, Some(good)).expect("frame");
        assert!(report.steps.contains(&FrameStep::BlasRefit(model)));
        assert!(report.steps.contains(&FrameStep::TlasRefit));
        let tlas = fc.tlas().handle().expect("tlas");
        assert!(fc.device().trace(tlas, Vec3::new(10.25, 0.25, 5.0), down).expect("trace").is_some());
        assert!(fc.device().trace(tlas, Vec3::new(0.25, 0.25, 5.0), down).expect("trace").is_none());
    }

    #[test]
    fn test_topology_change_rebuilds() {
        let (mut registry, model) = registry();
        let mut fc = controller(8, 8);
        fc.render(&mut registry, None).expect("first");
        let old = fc.blas().address(model).expect("address");

        let sphere = loader::load(
            &ModelSource::procedural(Primitive::Sphere {
                radius: 1.0,
                segments: 8,
                rings: 4,
            }),
            &LoaderConfig::default(),
        )
        .expect("load");
        registry.replace_mesh(model, sphere).expect("replace");
        let report = fc.render(&mut registry, None).expect("frame");
        assert!(report.steps.contains(&FrameStep::BlasRebuilt(model)));
        assert!(report.steps.contains(&FrameStep::TlasRebuilt));
        assert!(report.steps.contains(&FrameStep::ObjectsUploaded));
        assert_ne!(fc.blas().address(model).expect("address"), old);
    }

    #[test]
    fn test_resize_applies_next_frame() {
        let (mut registry, _) = registry();
        let mut fc = controller(10, 5);
        let first = fc.render(&mut registry, None).expect("first");
        fc.resize(11, 6).expect("resize");
        let report = fc.render(&mut registry, None).expect("second");
        assert_eq!(report.steps[0], FrameStep::Resized { width: 11, height: 6 });
        assert_eq!(report.dispatch_size(), Some((11, 6)));
        assert!(report.is_static());
        assert!(fc.texture(first.texture).is_err());
        assert_eq!(fc.texture(report.texture).expect("texture").size(), (11, 6));

        assert!(fc.resize(0, 6).is_err());
    }

    #[test]
    fn test_late_instance_rebuilds_top_level() {
        let (mut registry, model) = registry();
        let mut fc = controller(8, 8);
        fc.render(&mut registry, None).expect("first");
        registry
            .add_instance(model, Mat4::from_translation(Vec3::X * 3.0))
            .expect("instance");
        let report = fc.render(&mut registry, None).expect("frame");
        assert!(report.steps.contains(&FrameStep::TlasRebuilt));
        assert_eq!(fc.tlas().records().len(), 2);
    }
}
