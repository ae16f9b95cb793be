//! Pending-edit handoff between an update thread and the frame loop.
//!
//! The update side builds a complete [`SceneUpdate`] and publishes it; the
//! frame loop takes whatever is pending at the start of a frame. The lock
//! is held only to swap the snapshot in or out, so neither side ever sees
//! a half-written set of edits.

use std::collections::BTreeMap;
use std::sync::Arc;

use glam::{Mat4, Vec3};
use parking_lot::Mutex;

use super::{InstanceId, ModelId, ModelRegistry};
use crate::util::{Error, Result};

/// New vertex data for one mesh.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VertexUpdate {
    pub positions: Vec<Vec3>,
    /// Explicit normals; `None` keeps (or re-derives) the current ones.
    pub normals: Option<Vec<Vec3>>,
}

/// A consistent set of edits applied together at a frame boundary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SceneUpdate {
    pub vertices: BTreeMap<ModelId, VertexUpdate>,
    pub transforms: BTreeMap<InstanceId, Mat4>,
}

impl SceneUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_vertices(&mut self, model: ModelId, positions: Vec<Vec3>, normals: Option<Vec<Vec3>>) -> &mut Self {
        self.vertices.insert(model, VertexUpdate { positions, normals });
        self
    }

    pub fn set_transform(&mut self, instance: InstanceId, transform: Mat4) -> &mut Self {
        self.transforms.insert(instance, transform);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() && self.transforms.is_empty()
    }

    /// Fold a newer snapshot into this one; newer entries win.
    pub fn merge(&mut self, newer: SceneUpdate) {
        self.vertices.extend(newer.vertices);
        self.transforms.extend(newer.transforms);
    }

    /// Check every id and vertex/normal count against `registry`.
    /// Nothing is applied unless the whole snapshot passes.
    pub fn validate(&self, registry: &ModelRegistry) -> Result<()> {
        for (&model, update) in &self.vertices {
            let mesh = registry.mesh(model)?;
            if update.positions.len() != mesh.vertex_count() {
                return Err(Error::precondition(format!(
                    "{}: vertex update with {} positions for {} vertices",
                    model,
                    update.positions.len(),
                    mesh.vertex_count()
                )));
            }
            if let Some(normals) = &update.normals {
                if normals.len() != mesh.vertex_count() {
                    return Err(Error::precondition(format!(
                        "{}: {} normals for {} vertices",
                        model,
                        normals.len(),
                        mesh.vertex_count()
                    )));
                }
            }
        }
        for &instance in self.transforms.keys() {
            registry.instance(instance)?;
        }
        Ok(())
    }

    /// Apply vertex edits to the registry.
    pub(crate) fn apply_geometry(&self, registry: &mut ModelRegistry) -> Result<()> {
        for (&model, update) in &self.vertices {
            registry.update_vertices(model, &update.positions, update.normals.as_deref())?;
        }
        Ok(())
    }

    /// Apply transform edits to the registry.
    pub(crate) fn apply_transforms(&self, registry: &mut ModelRegistry) -> Result<()> {
        for (&instance, &transform) in &self.transforms {
            registry.set_transform(instance, transform)?;
        }
        Ok(())
    }
}

/// Shared slot holding the next snapshot. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct SceneEditQueue {
    pending: Arc<Mutex<Option<SceneUpdate>>>,
}

impl SceneEditQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a snapshot. Merges with one not yet consumed.
    pub fn publish(&self, update: SceneUpdate) {
        let mut pending = self.pending.lock();
        match pending.as_mut() {
            Some(existing) => existing.merge(update),
            None => *pending = Some(update),
        }
    }

    /// Take the pending snapshot, leaving the slot empty.
    pub fn take(&self) -> Option<SceneUpdate> {
        self.pending.lock().take()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.lock().is_some()
    }
}
