//! Arena of meshes and instances.
//!
//! Both arenas are append-only: a [`ModelId`] or [`InstanceId`] stays valid
//! for the life of the registry, and instance order is insertion order,
//! which is also the order of top-level instance records.

use std::collections::BTreeSet;
use std::fmt;

use glam::Mat4;

use crate::model::Mesh;
use crate::util::{Error, Result};

/// Index of a mesh in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId(u32);

impl ModelId {
    #[inline]
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "model#{}", self.0)
    }
}

/// Index of an instance in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u32);

impl InstanceId {
    #[inline]
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance#{}", self.0)
    }
}

/// A placement of a mesh in the world.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instance {
    pub model: ModelId,
    pub transform: Mat4,
}

/// Changes made since the last frame consumed them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirtySet {
    /// Vertex data changed, topology intact (refit).
    pub geometry: BTreeSet<ModelId>,
    /// Mesh replaced (full rebuild).
    pub topology: BTreeSet<ModelId>,
    /// At least one instance transform changed.
    pub transforms: bool,
    /// Models were appended.
    pub models_added: bool,
    /// Instances were appended.
    pub instances_added: bool,
}

impl DirtySet {
    /// Fold `other` into this set.
    pub fn merge(&mut self, other: DirtySet) {
        self.geometry.extend(other.geometry);
        self.topology.extend(other.topology);
        self.transforms |= other.transforms;
        self.models_added |= other.models_added;
        self.instances_added |= other.instances_added;
    }

    pub fn is_empty(&self) -> bool {
        self.geometry.is_empty()
            && self.topology.is_empty()
            && !self.transforms
            && !self.models_added
            && !self.instances_added
    }
}

/// Owner of all meshes and instances.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    meshes: Vec<Mesh>,
    instances: Vec<Instance>,
    dirty: DirtySet,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mesh without placing it.
    pub fn add_mesh(&mut self, mesh: Mesh) -> ModelId {
        let id = ModelId(self.meshes.len() as u32);
        tracing::debug!(%id, name = mesh.name(), tris = mesh.triangle_count(), "mesh registered");
        self.meshes.push(mesh);
        self.dirty.models_added = true;
        id
    }

    /// Register a mesh and place one instance of it.
    pub fn add_model(&mut self, mesh: Mesh, transform: Mat4) -> InstanceId {
        let model = self.add_mesh(mesh);
        self.push_instance(model, transform)
    }

    /// Place another instance of an existing mesh.
    pub fn add_instance(&mut self, model: ModelId, transform: Mat4) -> Result<InstanceId> {
        self.mesh(model)?;
        Ok(self.push_instance(model, transform))
    }

    fn push_instance(&mut self, model: ModelId, transform: Mat4) -> InstanceId {
        let id = InstanceId(self.instances.len() as u32);
        self.instances.push(Instance { model, transform });
        self.dirty.instances_added = true;
        id
    }

    pub fn mesh(&self, model: ModelId) -> Result<&Mesh> {
        self.meshes.get(model.index()).ok_or(Error::UnknownModel(model.0))
    }

    pub fn meshes(&self) -> &[Mesh] {
        &self.meshes
    }

    /// All models with their ids, in registration order.
    pub fn models(&self) -> impl Iterator<Item = (ModelId, &Mesh)> {
        self.meshes.iter().enumerate().map(|(i, m)| (ModelId(i as u32), m))
    }

    pub fn instance(&self, id: InstanceId) -> Result<&Instance> {
        self.instances.get(id.index()).ok_or(Error::UnknownInstance(id.0))
    }

    /// Instances in insertion order.
    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    /// Ids of every instance of `model`, in insertion order.
    pub fn instances_of(&self, model: ModelId) -> Vec<InstanceId> {
        self.instances
            .iter()
            .enumerate()
            .filter(|(_, inst)| inst.model == model)
            .map(|(i, _)| InstanceId(i as u32))
            .collect()
    }

    pub fn model_count(&self) -> usize {
        self.meshes.len()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn set_transform(&mut self, id: InstanceId, transform: Mat4) -> Result<()> {
        let inst = self
            .instances
            .get_mut(id.index())
            .ok_or(Error::UnknownInstance(id.0))?;
        inst.transform = transform;
        self.dirty.transforms = true;
        Ok(())
    }

    /// Move vertices of a mesh; topology must not change.
    pub fn update_vertices(
        &mut self,
        model: ModelId,
        positions: &[glam::Vec3],
        normals: Option<&[glam::Vec3]>,
    ) -> Result<()> {
        let mesh = self
            .meshes
            .get_mut(model.index())
            .ok_or(Error::UnknownModel(model.0))?;
        mesh.update_vertices(positions, normals)?;
        self.dirty.geometry.insert(model);
        Ok(())
    }

    /// Swap a mesh for one with different topology. The next frame rebuilds
    /// its bottom-level structure from scratch.
    pub fn replace_mesh(&mut self, model: ModelId, mesh: Mesh) -> Result<()> {
        let slot = self
            .meshes
            .get_mut(model.index())
            .ok_or(Error::UnknownModel(model.0))?;
        *slot = mesh;
        self.dirty.geometry.remove(&model);
        self.dirty.topology.insert(model);
        Ok(())
    }

    /// Whether edits are waiting for the next frame.
    pub fn has_pending_changes(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Hand pending changes to the frame controller.
    pub(crate) fn take_dirty(&mut self) -> DirtySet {
        std::mem::take(&mut self.dirty)
    }

    /// Give back changes a failed frame did not finish consuming.
    pub(crate) fn restore_dirty(&mut self, dirty: DirtySet) {
        self.dirty.merge(dirty);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{self, LoaderConfig, ModelSource, Primitive};
    use glam::Vec3;

    fn triangle() -> Mesh {
        loader::load(&ModelSource::procedural(Primitive::Triangle), &LoaderConfig::default()).expect("load")
    }

    #[test]
    fn test_ids_are_stable() {
        let mut reg = ModelRegistry::new();
        let a = reg.add_model(triangle(), Mat4::IDENTITY);
        let b = reg.add_model(triangle(), Mat4::from_translation(Vec3::X));
        assert_eq!(a.raw(), 0);
        assert_eq!(b.raw(), 1);
        let model = reg.instance(a).expect("instance").model;
        let c = reg.add_instance(model, Mat4::IDENTITY).expect("add");
        assert_eq!(c.raw(), 2);
        assert_eq!(reg.model_count(), 2);
        assert_eq!(reg.instance_count(), 3);
        assert_eq!(reg.instances_of(model), vec![a, c]);
        // earlier ids still resolve to the same data
        assert_eq!(reg.instance(b).expect("instance").transform, Mat4::from_translation(Vec3::X));
    }

    #[test]
    fn test_unknown_ids() {
        let mut reg = ModelRegistry::new();
        reg.add_model(triangle(), Mat4::IDENTITY);
        let bogus = ModelId(7);
        assert!(matches!(reg.add_instance(bogus, Mat4::IDENTITY), Err(Error::UnknownModel(7))));
        assert!(matches!(
            reg.set_transform(InstanceId(3), Mat4::IDENTITY),
            Err(Error::UnknownInstance(3))
        ));
    }

    #[test]
    fn test_dirty_tracking() {
        let mut reg = ModelRegistry::new();
        let inst = reg.add_model(triangle(), Mat4::IDENTITY);
        let model = reg.instance(inst).expect("instance").model;
        let first = reg.take_dirty();
        assert!(first.models_added && first.instances_added);
        assert!(!reg.has_pending_changes());

        reg.set_transform(inst, Mat4::from_scale(Vec3::splat(2.0))).expect("transform");
        let moved = [Vec3::ZERO, Vec3::X * 2.0, Vec3::Y * 2.0];
        reg.update_vertices(model, &moved, None).expect("update");
        let dirty = reg.take_dirty();
        assert!(dirty.transforms);
        assert!(dirty.geometry.contains(&model));
        assert!(dirty.topology.is_empty());

        reg.replace_mesh(model, triangle()).expect("replace");
        let dirty = reg.take_dirty();
        assert!(dirty.topology.contains(&model));
        assert!(dirty.geometry.is_empty());
    }

    #[test]
    fn test_restore_dirty_merges() {
        let mut reg = ModelRegistry::new();
        let inst = reg.add_model(triangle(), Mat4::IDENTITY);
        let model = reg.instance(inst).expect("instance").model;
        reg.take_dirty();

        reg.update_vertices(model, &[Vec3::ZERO, Vec3::X, Vec3::Z], None).expect("update");
        let taken = reg.take_dirty();
        reg.set_transform(inst, Mat4::IDENTITY).expect("transform");
        reg.restore_dirty(taken);

        let dirty = reg.take_dirty();
        assert!(dirty.geometry.contains(&model));
        assert!(dirty.transforms);
        assert!(!dirty.instances_added);
    }
}
