//! Per-model bottom-level structures.

use super::{AccelBackend, AccelHandle, BlasGeometry, BuildFlags, DeviceAddress};
use crate::model::Topology;
use crate::scene::{ModelId, ModelRegistry};
use crate::util::{Error, Result};

/// A built bottom-level structure and the topology it was built from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BuiltBlas {
    pub handle: AccelHandle,
    pub address: DeviceAddress,
    pub topology: Topology,
    pub triangle_count: usize,
}

/// Lifecycle of one model's structure.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum BlasState {
    #[default]
    Unbuilt,
    Built(BuiltBlas),
}

/// Owns one [`BlasState`] per registered model, indexed by [`ModelId`].
#[derive(Debug)]
pub struct BlasManager {
    entries: Vec<BlasState>,
    flags: BuildFlags,
}

impl Default for BlasManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BlasManager {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            flags: BuildFlags::BOTTOM_LEVEL,
        }
    }

    pub fn with_flags(flags: BuildFlags) -> Self {
        Self {
            entries: Vec::new(),
            flags,
        }
    }

    pub fn flags(&self) -> BuildFlags {
        self.flags
    }

    pub fn state(&self, model: ModelId) -> BlasState {
        self.entries.get(model.index()).copied().unwrap_or_default()
    }

    pub fn is_built(&self, model: ModelId) -> bool {
        matches!(self.state(model), BlasState::Built(_))
    }

    pub fn built_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, BlasState::Built(_)))
            .count()
    }

    /// Address referenced by instance records of `model`.
    pub fn address(&self, model: ModelId) -> Result<DeviceAddress> {
        match self.state(model) {
            BlasState::Built(b) => Ok(b.address),
            BlasState::Unbuilt => Err(Error::precondition(format!(
                "{} has no bottom-level structure yet",
                model
            ))),
        }
    }

    /// Build every registered model that is still unbuilt. Returns the
    /// models built, in id order.
    pub fn build_missing<B: AccelBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        registry: &ModelRegistry,
    ) -> Result<Vec<ModelId>> {
        if self.entries.len() < registry.model_count() {
            self.entries.resize(registry.model_count(), BlasState::Unbuilt);
        }
        let mut built = Vec::new();
        for (model, _) in registry.models() {
            if !self.is_built(model) {
                self.build(backend, registry, model)?;
                built.push(model);
            }
        }
        Ok(built)
    }

    /// Full build of one model's structure, replacing any previous one.
    /// The device address changes.
    #[tracing::instrument(skip_all, fields(%model))]
    pub fn build<B: AccelBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        registry: &ModelRegistry,
        model: ModelId,
    ) -> Result<()> {
        let mesh = registry.mesh(model)?;
        if self.entries.len() <= model.index() {
            self.entries.resize(model.index() + 1, BlasState::Unbuilt);
        }
        if let BlasState::Built(old) = self.entries[model.index()] {
            backend.destroy(old.handle);
            self.entries[model.index()] = BlasState::Unbuilt;
        }

        let geometry = BlasGeometry::from_mesh(mesh);
        let handle = backend.build_bottom_level(&geometry, self.flags)?;
        let address = backend.device_address(handle)?;
        self.entries[model.index()] = BlasState::Built(BuiltBlas {
            handle,
            address,
            topology: mesh.topology(),
            triangle_count: mesh.triangle_count(),
        });
        tracing::debug!(tris = mesh.triangle_count(), address = address.0, "bottom-level built");
        Ok(())
    }

    /// Refit one model's structure to its current vertex positions.
    ///
    /// Fails with a precondition violation if the structure was never built
    /// or the mesh topology changed since the build.
    #[tracing::instrument(skip_all, fields(%model))]
    pub fn refit<B: AccelBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        registry: &ModelRegistry,
        model: ModelId,
    ) -> Result<()> {
        let mesh = registry.mesh(model)?;
        let built = match self.state(model) {
            BlasState::Built(b) => b,
            BlasState::Unbuilt => {
                return Err(Error::precondition(format!("refit of unbuilt {}", model)));
            }
        };
        if built.topology != mesh.topology() {
            return Err(Error::precondition(format!(
                "refit of {} after a topology change, a full rebuild is required",
                model
            )));
        }
        backend.update_bottom_level(built.handle, &BlasGeometry::from_mesh(mesh))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SoftwareDevice;
    use crate::loader::{self, LoaderConfig, ModelSource, Primitive};
    use glam::{Mat4, Vec3};

    fn load(p: Primitive) -> crate::model::Mesh {
        loader::load(&ModelSource::procedural(p), &LoaderConfig::default()).expect("load")
    }

    fn setup() -> (SoftwareDevice, ModelRegistry, ModelId) {
        let mut registry = ModelRegistry::new();
        let inst = registry.add_model(load(Primitive::Cube { size: 1.0 }), Mat4::IDENTITY);
        let model = registry.instance(inst).expect("instance").model;
        (SoftwareDevice::new(), registry, model)
    }

    #[test]
    fn test_build_missing() {
        let (mut device, mut registry, model) = setup();
        let mut blas = BlasManager::new();
        assert_eq!(blas.state(model), BlasState::Unbuilt);
        assert!(blas.address(model).is_err());

        assert_eq!(blas.build_missing(&mut device, &registry).expect("build"), vec![model]);
        assert!(blas.is_built(model));
        assert!(blas.build_missing(&mut device, &registry).expect("build").is_empty());

        let second = registry.add_mesh(load(Primitive::Triangle));
        assert_eq!(blas.build_missing(&mut device, &registry).expect("build"), vec![second]);
        assert_eq!(blas.built_count(), 2);
        assert_ne!(blas.address(model).expect("a"), blas.address(second).expect("b"));
    }

    #[test]
    fn test_refit_unbuilt_is_precondition() {
        let (mut device, registry, model) = setup();
        let mut blas = BlasManager::new();
        let err = blas.refit(&mut device, &registry, model).unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[test]
    fn test_refit_after_topology_change_is_precondition() {
        let (mut device, mut registry, model) = setup();
        let mut blas = BlasManager::new();
        blas.build_missing(&mut device, &registry).expect("build");

        registry
            .replace_mesh(model, load(Primitive::Sphere { radius: 1.0, segments: 6, rings: 3 }))
            .expect("replace");
        let err = blas.refit(&mut device, &registry, model).unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));

        // explicit rebuild is the supported path
        let before = blas.address(model).expect("address");
        blas.build(&mut device, &registry, model).expect("rebuild");
        assert_ne!(blas.address(model).expect("address"), before);
        blas.refit(&mut device, &registry, model).expect("refit after rebuild");
    }

    #[test]
    fn test_refit_keeps_address() {
        let (mut device, mut registry, model) = setup();
        let mut blas = BlasManager::new();
        blas.build_missing(&mut device, &registry).expect("build");
        let before = blas.address(model).expect("address");

        let moved: Vec<Vec3> = registry
            .mesh(model)
            .expect("mesh")
            .vertices()
            .iter()
            .map(|v| v.position() * 2.0)
            .collect();
        registry.update_vertices(model, &moved, None).expect("update");
        blas.refit(&mut device, &registry, model).expect("refit");
        assert_eq!(blas.address(model).expect("address"), before);
    }

    #[test]
    fn test_refit_requires_allow_update() {
        let (mut device, registry, model) = setup();
        let mut blas = BlasManager::with_flags(BuildFlags::PREFER_FAST_TRACE);
        blas.build_missing(&mut device, &registry).expect("build");
        let err = blas.refit(&mut device, &registry, model).unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }
}
