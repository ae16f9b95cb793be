//! Polygon-stream adapter for host scene descriptions.
//!
//! Attributes may be authored per point ("vertex" interpolation) or per
//! face corner ("face-varying"); the stream length decides which.

use glam::{Vec2, Vec3};

use crate::model::{Material, RawMesh, Vertex};
use crate::util::{Error, Result};

/// Polygon mesh as handed over by a scene description.
#[derive(Debug, Clone, Default)]
pub struct SceneDescription {
    pub name: String,
    pub points: Vec<[f32; 3]>,
    /// Corner count of each face.
    pub face_vertex_counts: Vec<u32>,
    /// Point index of each face corner.
    pub face_vertex_indices: Vec<u32>,
    /// Empty, one per point, or one per corner.
    pub normals: Vec<[f32; 3]>,
    /// Empty, one per point, or one per corner.
    pub tex_coords: Vec<[f32; 2]>,
    /// Empty or one per face.
    pub face_material_ids: Vec<i32>,
    pub materials: Vec<Material>,
    pub textures: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Interpolation {
    Missing,
    Vertex,
    FaceVarying,
}

impl SceneDescription {
    fn interpolation(&self, attr: &str, len: usize) -> Result<Interpolation> {
        if len == 0 {
            Ok(Interpolation::Missing)
        } else if len == self.points.len() {
            Ok(Interpolation::Vertex)
        } else if len == self.face_vertex_indices.len() {
            Ok(Interpolation::FaceVarying)
        } else {
            Err(Error::consistency(
                &self.name,
                format!(
                    "{} {} for {} points and {} corners",
                    len,
                    attr,
                    self.points.len(),
                    self.face_vertex_indices.len()
                ),
            ))
        }
    }
}

pub(super) fn convert(desc: &SceneDescription) -> Result<RawMesh> {
    let corner_total: u64 = desc.face_vertex_counts.iter().map(|&c| c as u64).sum();
    if corner_total != desc.face_vertex_indices.len() as u64 {
        return Err(Error::consistency(
            &desc.name,
            format!(
                "face vertex counts sum to {} but {} face vertex indices given",
                corner_total,
                desc.face_vertex_indices.len()
            ),
        ));
    }
    if !desc.face_material_ids.is_empty() && desc.face_material_ids.len() != desc.face_vertex_counts.len() {
        return Err(Error::consistency(
            &desc.name,
            format!(
                "{} face material ids for {} faces",
                desc.face_material_ids.len(),
                desc.face_vertex_counts.len()
            ),
        ));
    }
    if let Some(&bad) = desc.face_vertex_indices.iter().find(|&&i| i as usize >= desc.points.len()) {
        return Err(Error::consistency(
            &desc.name,
            format!("face vertex index {} out of range for {} points", bad, desc.points.len()),
        ));
    }
    let normal_interp = desc.interpolation("normals", desc.normals.len())?;
    let uv_interp = desc.interpolation("texcoords", desc.tex_coords.len())?;

    let corner = |c: usize| -> Vertex {
        let pi = desc.face_vertex_indices[c] as usize;
        let position = Vec3::from_array(desc.points[pi]);
        let normal = match normal_interp {
            Interpolation::Missing => Vec3::ZERO,
            Interpolation::Vertex => Vec3::from_array(desc.normals[pi]),
            Interpolation::FaceVarying => Vec3::from_array(desc.normals[c]),
        };
        let uv = match uv_interp {
            // planar projection from XZ
            Interpolation::Missing => Vec2::new((position.x + 1.0) * 0.5, (position.z + 1.0) * 0.5),
            Interpolation::Vertex => Vec2::from_array(desc.tex_coords[pi]),
            Interpolation::FaceVarying => Vec2::from_array(desc.tex_coords[c]),
        };
        Vertex::new(position, normal, Vec3::ONE, Vec2::new(uv.x, 1.0 - uv.y))
    };

    let mut raw = RawMesh::new(&desc.name);
    raw.materials = desc.materials.clone();
    raw.textures = desc.textures.clone();
    raw.has_normals = normal_interp != Interpolation::Missing;

    let mut skipped = 0usize;
    let mut start = 0usize;
    for (face, &count) in desc.face_vertex_counts.iter().enumerate() {
        let count = count as usize;
        if count < 3 {
            skipped += 1;
        } else {
            let material = desc.face_material_ids.get(face).copied().unwrap_or(0);
            for k in 1..count - 1 {
                raw.push_triangle([corner(start), corner(start + k), corner(start + k + 1)], material);
            }
        }
        start += count;
    }
    if skipped > 0 {
        tracing::warn!(mesh = %desc.name, skipped, "faces with fewer than 3 corners skipped");
    }
    Ok(raw)
}
