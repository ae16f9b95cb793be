//! The top-level structure over all instances.

use super::{
    AccelBackend, AccelHandle, BlasManager, BuildFlags, InstanceRecord, INSTANCE_MASK_ALL,
    INSTANCE_TRIANGLE_CULL_DISABLE,
};
use crate::scene::ModelRegistry;
use crate::util::{Error, Result};

/// Lifecycle of the top-level structure.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum TlasState {
    #[default]
    Empty,
    Built { handle: AccelHandle, instance_count: usize },
}

/// Owns the top-level structure and the records it was built from.
#[derive(Debug)]
pub struct TlasManager {
    state: TlasState,
    records: Vec<InstanceRecord>,
    flags: BuildFlags,
}

impl Default for TlasManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TlasManager {
    pub fn new() -> Self {
        Self {
            state: TlasState::Empty,
            records: Vec::new(),
            flags: BuildFlags::TOP_LEVEL,
        }
    }

    pub fn state(&self) -> TlasState {
        self.state
    }

    pub fn handle(&self) -> Option<AccelHandle> {
        match self.state {
            TlasState::Built { handle, .. } => Some(handle),
            TlasState::Empty => None,
        }
    }

    /// Records in instance insertion order.
    pub fn records(&self) -> &[InstanceRecord] {
        &self.records
    }

    /// One record per instance: custom index is the model slot, every ray
    /// sees it and both faces are hit.
    fn assemble(&mut self, registry: &ModelRegistry, blas: &BlasManager) -> Result<()> {
        self.records = registry
            .instances()
            .iter()
            .map(|inst| {
                Ok(InstanceRecord::new(
                    &inst.transform,
                    inst.model.raw(),
                    INSTANCE_MASK_ALL,
                    0,
                    INSTANCE_TRIANGLE_CULL_DISABLE,
                    blas.address(inst.model)?,
                ))
            })
            .collect::<Result<_>>()?;
        Ok(())
    }

    /// Full build over the current instance set.
    #[tracing::instrument(skip_all, fields(instances = registry.instance_count()))]
    pub fn build<B: AccelBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        registry: &ModelRegistry,
        blas: &BlasManager,
    ) -> Result<()> {
        self.assemble(registry, blas)?;
        if let TlasState::Built { handle, .. } = self.state {
            backend.destroy(handle);
            self.state = TlasState::Empty;
        }
        let handle = backend.build_top_level(&self.records, self.flags)?;
        self.state = TlasState::Built {
            handle,
            instance_count: self.records.len(),
        };
        tracing::debug!(instances = self.records.len(), "top-level built");
        Ok(())
    }

    /// Refit with current transforms and bottom-level addresses.
    ///
    /// Fails with a precondition violation before the first build or when
    /// the instance count changed.
    #[tracing::instrument(skip_all, fields(instances = registry.instance_count()))]
    pub fn refit<B: AccelBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        registry: &ModelRegistry,
        blas: &BlasManager,
    ) -> Result<()> {
        let (handle, instance_count) = match self.state {
            TlasState::Built { handle, instance_count } => (handle, instance_count),
            TlasState::Empty => return Err(Error::precondition("top-level refit before any build")),
        };
        if instance_count != registry.instance_count() {
            return Err(Error::precondition(format!(
                "top-level refit with {} instances, built with {}; rebuild required",
                registry.instance_count(),
                instance_count
            )));
        }
        self.assemble(registry, blas)?;
        backend.update_top_level(handle, &self.records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SoftwareDevice;
    use crate::loader::{self, LoaderConfig, ModelSource, Primitive};
    use glam::{Mat4, Vec3};

    fn scene() -> (SoftwareDevice, ModelRegistry, BlasManager) {
        let mut registry = ModelRegistry::new();
        let tri = loader::load(&ModelSource::procedural(Primitive::Triangle), &LoaderConfig::default())
            .expect("load");
        let cube = loader::load(&ModelSource::procedural(Primitive::Cube { size: 1.0 }), &LoaderConfig::default())
            .expect("load");
        registry.add_model(tri, Mat4::IDENTITY);
        let c = registry.add_model(cube, Mat4::from_translation(Vec3::X * 3.0));
        let cube_model = registry.instance(c).expect("instance").model;
        registry
            .add_instance(cube_model, Mat4::from_translation(Vec3::X * -3.0))
            .expect("add");
        let mut device = SoftwareDevice::new();
        let mut blas = BlasManager::new();
        blas.build_missing(&mut device, &registry).expect("blas");
        (device, registry, blas)
    }

    #[test]
    fn test_records_follow_instances() {
        let (mut device, registry, blas) = scene();
        let mut tlas = TlasManager::new();
        tlas.build(&mut device, &registry, &blas).expect("build");
        let records = tlas.records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].custom_index(), 0);
        assert_eq!(records[1].custom_index(), 1);
        assert_eq!(records[2].custom_index(), 1);
        assert_eq!(records[1].blas_address, records[2].blas_address);
        assert_eq!(records[2].transform[0][3], -3.0);
        for r in records {
            assert_eq!(r.mask(), 0xFF);
            assert_eq!(r.flags(), INSTANCE_TRIANGLE_CULL_DISABLE);
        }
    }

    #[test]
    fn test_refit_before_build_is_precondition() {
        let (mut device, registry, blas) = scene();
        let mut tlas = TlasManager::new();
        assert_eq!(tlas.state(), TlasState::Empty);
        let err = tlas.refit(&mut device, &registry, &blas).unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[test]
    fn test_refit_with_new_instance_is_precondition() {
        let (mut device, mut registry, mut blas) = scene();
        let mut tlas = TlasManager::new();
        tlas.build(&mut device, &registry, &blas).expect("build");

        let model = registry.instances()[0].model;
        registry.add_instance(model, Mat4::IDENTITY).expect("add");
        assert!(matches!(
            tlas.refit(&mut device, &registry, &blas),
            Err(Error::Precondition(_))
        ));

        blas.build_missing(&mut device, &registry).expect("blas");
        tlas.build(&mut device, &registry, &blas).expect("rebuild");
        assert_eq!(tlas.records().len(), 4);
    }

    #[test]
    fn test_refit_updates_transforms() {
        let (mut device, mut registry, blas) = scene();
        let mut tlas = TlasManager::new();
        tlas.build(&mut device, &registry, &blas).expect("build");
        let handle = tlas.handle();

        let first = crate::scene::InstanceId::from_index(0);
        registry
            .set_transform(first, Mat4::from_translation(Vec3::new(0.0, 5.0, 0.0)))
            .expect("transform");
        tlas.refit(&mut device, &registry, &blas).expect("refit");
        assert_eq!(tlas.handle(), handle);
        assert_eq!(tlas.records()[0].transform[1][3], 5.0);
    }
}
