//! Vertex and mesh types, and the normalization step shared by all loaders.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};

use super::Material;
use crate::util::{Aabb, Error, Result};

/// Interleaved vertex. Position must stay the first field; acceleration
/// structure builds read positions with the vertex stride.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub color: [f32; 3],
    pub tex_coord: [f32; 2],
}

impl Vertex {
    pub fn new(position: Vec3, normal: Vec3, color: Vec3, tex_coord: Vec2) -> Self {
        Self {
            position: position.to_array(),
            normal: normal.to_array(),
            color: color.to_array(),
            tex_coord: tex_coord.to_array(),
        }
    }

    #[inline]
    pub fn position(&self) -> Vec3 {
        Vec3::from_array(self.position)
    }

    #[inline]
    pub fn normal(&self) -> Vec3 {
        Vec3::from_array(self.normal)
    }
}

/// Loader output before invariants are enforced.
///
/// Material ids are kept signed and unchecked here; [`RawMesh::normalize`]
/// clamps them.
#[derive(Debug, Clone, Default)]
pub struct RawMesh {
    pub name: String,
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub material_indices: Vec<i32>,
    pub materials: Vec<Material>,
    pub textures: Vec<String>,
    /// False when the source had no normals and flat normals must be derived.
    pub has_normals: bool,
}

impl RawMesh {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Append one triangle as three unshared corners.
    pub fn push_triangle(&mut self, corners: [Vertex; 3], material: i32) {
        for v in corners {
            self.indices.push(self.vertices.len() as u32);
            self.vertices.push(v);
        }
        self.material_indices.push(material);
    }

    /// Enforce mesh invariants and produce a [`Mesh`].
    #[tracing::instrument(skip_all, fields(mesh = %self.name, tris = self.indices.len() / 3))]
    pub fn normalize(mut self) -> Result<Mesh> {
        if self.indices.len() % 3 != 0 {
            return Err(Error::consistency(
                &self.name,
                format!("index count {} is not a multiple of 3", self.indices.len()),
            ));
        }
        let tri_count = self.indices.len() / 3;
        if self.material_indices.len() != tri_count {
            return Err(Error::consistency(
                &self.name,
                format!(
                    "{} material indices for {} triangles",
                    self.material_indices.len(),
                    tri_count
                ),
            ));
        }
        let vertex_count = self.vertices.len();
        if let Some(&bad) = self.indices.iter().find(|&&i| i as usize >= vertex_count) {
            return Err(Error::consistency(
                &self.name,
                format!("index {} out of range for {} vertices", bad, vertex_count),
            ));
        }

        if self.materials.is_empty() {
            self.materials.push(Material::default());
        }

        let material_count = self.materials.len() as i32;
        let mut clamped = 0usize;
        let material_indices: Vec<u32> = self
            .material_indices
            .iter()
            .map(|&mi| {
                if mi < 0 || mi >= material_count {
                    clamped += 1;
                    0
                } else {
                    mi as u32
                }
            })
            .collect();
        if clamped > 0 {
            tracing::warn!(
                mesh = %self.name,
                clamped,
                materials = material_count,
                "material indices out of range, using material 0"
            );
        }

        let generated_normals = !self.has_normals;
        if generated_normals {
            compute_face_normals(&mut self.vertices, &self.indices);
        } else {
            for v in &mut self.vertices {
                v.normal = unit_or_up(v.normal()).to_array();
            }
        }

        let topology = Topology::of(&self.indices, vertex_count);
        Ok(Mesh {
            name: self.name,
            vertices: self.vertices,
            indices: self.indices,
            material_indices,
            materials: self.materials,
            textures: self.textures,
            generated_normals,
            topology,
        })
    }
}

/// A loaded, normalized triangle mesh.
#[derive(Debug, Clone)]
pub struct Mesh {
    name: String,
    vertices: Vec<Vertex>,
    indices: Vec<u32>,
    material_indices: Vec<u32>,
    materials: Vec<Material>,
    textures: Vec<String>,
    generated_normals: bool,
    topology: Topology,
}

impl Mesh {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    /// One entry per triangle, always in `[0, materials().len())`.
    pub fn material_indices(&self) -> &[u32] {
        &self.material_indices
    }

    pub fn materials(&self) -> &[Material] {
        &self.materials
    }

    pub fn textures(&self) -> &[String] {
        &self.textures
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Whether normals were derived from faces at load.
    pub fn has_generated_normals(&self) -> bool {
        self.generated_normals
    }

    /// Vertex/index counts and index fingerprint. Refit is only legal
    /// while this stays the same.
    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Positions of triangle `tri`.
    #[inline]
    pub fn triangle(&self, tri: usize) -> [Vec3; 3] {
        let i = &self.indices[tri * 3..tri * 3 + 3];
        [
            self.vertices[i[0] as usize].position(),
            self.vertices[i[1] as usize].position(),
            self.vertices[i[2] as usize].position(),
        ]
    }

    pub fn bounds(&self) -> Aabb {
        let mut b = Aabb::EMPTY;
        for v in &self.vertices {
            b.grow_point(v.position());
        }
        b
    }

    pub fn linearize_materials(&mut self) {
        for m in &mut self.materials {
            m.linearize();
        }
    }

    /// Replace vertex positions (and optionally normals) in place.
    ///
    /// The vertex count must not change. Without explicit normals, meshes
    /// whose normals were derived at load get flat normals recomputed.
    pub(crate) fn update_vertices(&mut self, positions: &[Vec3], normals: Option<&[Vec3]>) -> Result<()> {
        if positions.len() != self.vertices.len() {
            return Err(Error::precondition(format!(
                "mesh '{}': vertex update with {} positions for {} vertices changes topology, replace the mesh instead",
                self.name,
                positions.len(),
                self.vertices.len()
            )));
        }
        if let Some(normals) = normals {
            if normals.len() != self.vertices.len() {
                return Err(Error::precondition(format!(
                    "mesh '{}': {} normals for {} vertices",
                    self.name,
                    normals.len(),
                    self.vertices.len()
                )));
            }
        }

        for (i, v) in self.vertices.iter_mut().enumerate() {
            v.position = positions[i].to_array();
            if let Some(normals) = normals {
                v.normal = unit_or_up(normals[i]).to_array();
            }
        }
        if normals.is_none() && self.generated_normals {
            compute_face_normals(&mut self.vertices, &self.indices);
        }
        Ok(())
    }
}

/// Flat per-triangle normals assigned to all three corners.
pub(crate) fn compute_face_normals(vertices: &mut [Vertex], indices: &[u32]) {
    for tri in indices.chunks_exact(3) {
        let (i0, i1, i2) = (tri[0] as usize, tri[1] as usize, tri[2] as usize);
        let v0 = vertices[i0].position();
        let v1 = vertices[i1].position();
        let v2 = vertices[i2].position();
        let n = unit_or_up((v1 - v0).cross(v2 - v0)).to_array();
        vertices[i0].normal = n;
        vertices[i1].normal = n;
        vertices[i2].normal = n;
    }
}

#[inline]
fn unit_or_up(n: Vec3) -> Vec3 {
    n.try_normalize().unwrap_or(Vec3::Y)
}

/// Shape of a mesh as far as acceleration structures care. Counts are
/// compared directly; the hash only catches reordered indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Topology {
    pub vertex_count: usize,
    pub index_count: usize,
    pub index_hash: u64,
}

impl Topology {
    fn of(indices: &[u32], vertex_count: usize) -> Self {
        let mut hasher = DefaultHasher::new();
        indices.hash(&mut hasher);
        Self {
            vertex_count,
            index_count: indices.len(),
            index_hash: hasher.finish(),
        }
    }
}
