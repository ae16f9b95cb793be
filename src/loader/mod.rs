//! Model sources and the adapters that turn them into [`Mesh`]es.
//!
//! Every adapter flattens faces into unshared triangle corners, fan-splits
//! polygons with more than three corners and hands the result to
//! [`RawMesh::normalize`](crate::model::RawMesh::normalize), so meshes from
//! any source obey the same invariants.
//!
//! ## Example
//!
//! ```ignore
//! use headless_rt::loader::{self, LoaderConfig, ModelSource};
//!
//! let config = LoaderConfig::with_search_paths(["media/scenes"]);
//! let mesh = loader::load(&ModelSource::obj_file("wuson.obj"), &config)?;
//! ```

mod obj;
mod procedural;
mod scene_desc;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::model::{Material, Mesh};
use crate::util::{Error, Result};

pub use procedural::Primitive;
pub use scene_desc::SceneDescription;

/// Where a model comes from.
#[derive(Debug, Clone)]
pub enum ModelSource {
    /// Wavefront OBJ on disk, resolved through the search paths.
    ObjFile(PathBuf),
    /// Wavefront OBJ (and optional MTL) held in memory.
    ObjText {
        name: String,
        obj: String,
        mtl: Option<String>,
    },
    /// Polygon streams handed over by a host scene description.
    Scene(SceneDescription),
    /// Generated geometry.
    Procedural {
        primitive: Primitive,
        material: Option<Material>,
    },
}

impl ModelSource {
    pub fn obj_file(path: impl Into<PathBuf>) -> Self {
        Self::ObjFile(path.into())
    }

    pub fn procedural(primitive: Primitive) -> Self {
        Self::Procedural {
            primitive,
            material: None,
        }
    }

    /// Human-readable name for logs and errors.
    pub fn name(&self) -> String {
        match self {
            Self::ObjFile(path) => path.display().to_string(),
            Self::ObjText { name, .. } => name.clone(),
            Self::Scene(desc) => desc.name.clone(),
            Self::Procedural { primitive, .. } => primitive.name().to_string(),
        }
    }
}

/// Loader configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Directories tried, in order, for relative model paths.
    pub search_paths: Vec<PathBuf>,
}

impl LoaderConfig {
    pub fn with_search_paths<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            search_paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    /// Locate a model file: as given first, then under each search path.
    pub fn resolve(&self, path: &Path) -> Result<PathBuf> {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        if !path.is_absolute() {
            for dir in &self.search_paths {
                let candidate = dir.join(path);
                if candidate.is_file() {
                    return Ok(candidate);
                }
            }
        }
        let tried: Vec<String> = self.search_paths.iter().map(|p| p.display().to_string()).collect();
        Err(Error::load(
            path.display().to_string(),
            format!("file not found (search paths: [{}])", tried.join(", ")),
        ))
    }
}

/// Load and normalize a model.
#[tracing::instrument(skip_all, fields(source = %source.name()))]
pub fn load(source: &ModelSource, config: &LoaderConfig) -> Result<Mesh> {
    let raw = match source {
        ModelSource::ObjFile(path) => {
            let resolved = config.resolve(path)?;
            obj::load_file(&resolved)?
        }
        ModelSource::ObjText { name, obj, mtl } => obj::load_text(name, obj, mtl.as_deref())?,
        ModelSource::Scene(desc) => scene_desc::convert(desc)?,
        ModelSource::Procedural { primitive, material } => procedural::generate(primitive, material.as_ref()),
    };
    let mesh = raw.normalize()?;
    tracing::debug!(
        vertices = mesh.vertex_count(),
        triangles = mesh.triangle_count(),
        materials = mesh.materials().len(),
        "model loaded"
    );
    Ok(mesh)
}
