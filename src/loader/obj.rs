//! Wavefront OBJ adapter (via `tobj`).

use std::collections::HashMap;
use std::io::{BufReader, Cursor};
use std::path::Path;

use glam::{Vec2, Vec3};

use crate::model::{Material, RawMesh, Vertex};
use crate::util::{Error, Result};

/// Faces are kept as authored and fan-split here so that quads and n-gons
/// split the same way as every other source.
fn load_options() -> tobj::LoadOptions {
    tobj::LoadOptions {
        single_index: false,
        triangulate: false,
        ignore_points: true,
        ignore_lines: true,
        ..Default::default()
    }
}

pub(super) fn load_file(path: &Path) -> Result<RawMesh> {
    let name = path.display().to_string();
    let (models, materials) =
        tobj::load_obj(path, &load_options()).map_err(|e| Error::load(&name, e.to_string()))?;
    let materials = materials.unwrap_or_else(|e| {
        tracing::warn!(source = %name, error = %e, "material library not loaded, using defaults");
        Vec::new()
    });
    Ok(convert(&name, &models, &materials))
}

pub(super) fn load_text(name: &str, obj: &str, mtl: Option<&str>) -> Result<RawMesh> {
    let mut reader = BufReader::new(Cursor::new(obj.as_bytes()));
    let (models, materials) = tobj::load_obj_buf(&mut reader, &load_options(), |_| match mtl {
        Some(text) => tobj::load_mtl_buf(&mut BufReader::new(Cursor::new(text.as_bytes()))),
        None => Err(tobj::LoadError::OpenFileFailed),
    })
    .map_err(|e| Error::load(name, e.to_string()))?;
    let materials = match (materials, mtl) {
        (Ok(materials), _) => materials,
        (Err(_), None) => Vec::new(),
        (Err(e), Some(_)) => {
            tracing::warn!(source = %name, error = %e, "material library not parsed, using defaults");
            Vec::new()
        }
    };
    Ok(convert(name, &models, &materials))
}

/// Concatenate every shape of the file into one raw mesh.
fn convert(name: &str, models: &[tobj::Model], obj_materials: &[tobj::Material]) -> RawMesh {
    let mut raw = RawMesh::new(name);
    let mut textures = Vec::new();
    let mut texture_slots: HashMap<String, u32> = HashMap::new();
    raw.materials = obj_materials
        .iter()
        .map(|m| convert_material(m, &mut textures, &mut texture_slots))
        .collect();
    raw.textures = textures;

    let mut any_normals = false;
    for model in models {
        let mesh = &model.mesh;
        let has_normals = !mesh.normal_indices.is_empty() && !mesh.normals.is_empty();
        any_normals |= has_normals;
        let material = mesh.material_id.map_or(-1, |m| m as i32);

        let corner = |c: usize| -> Vertex {
            let pi = mesh.indices[c] as usize;
            let position = read3(&mesh.positions, pi).unwrap_or(Vec3::ZERO);
            let normal = if has_normals {
                read3(&mesh.normals, mesh.normal_indices[c] as usize).unwrap_or(Vec3::ZERO)
            } else {
                Vec3::ZERO
            };
            let tex_coord = mesh
                .texcoord_indices
                .get(c)
                .and_then(|&ti| read2(&mesh.texcoords, ti as usize))
                .map_or(Vec2::ZERO, |uv| Vec2::new(uv.x, 1.0 - uv.y));
            let color = read3(&mesh.vertex_color, pi).unwrap_or(Vec3::ONE);
            Vertex::new(position, normal, color, tex_coord)
        };

        let mut start = 0usize;
        let mut emit_face = |arity: usize, raw: &mut RawMesh| {
            if arity < 3 {
                tracing::warn!(source = %name, arity, "skipping degenerate face");
            } else {
                for k in 1..arity - 1 {
                    let mut tri = [corner(start), corner(start + k), corner(start + k + 1)];
                    if !has_normals {
                        flat_normal(&mut tri);
                    }
                    raw.push_triangle(tri, material);
                }
            }
            start += arity;
        };

        if mesh.face_arities.is_empty() {
            for _ in 0..mesh.indices.len() / 3 {
                emit_face(3, &mut raw);
            }
        } else {
            for &arity in &mesh.face_arities {
                emit_face(arity as usize, &mut raw);
            }
        }
    }
    raw.has_normals = any_normals;
    raw
}

fn convert_material(
    m: &tobj::Material,
    textures: &mut Vec<String>,
    slots: &mut HashMap<String, u32>,
) -> Material {
    let defaults = Material::default();
    let texture = m.diffuse_texture.as_ref().filter(|t| !t.is_empty()).map(|t| {
        *slots.entry(t.clone()).or_insert_with(|| {
            textures.push(t.clone());
            (textures.len() - 1) as u32
        })
    });
    Material {
        ambient: m.ambient.unwrap_or(defaults.ambient),
        diffuse: m.diffuse.unwrap_or(defaults.diffuse),
        specular: m.specular.unwrap_or(defaults.specular),
        transmittance: parse_color(m.unknown_param.get("Tf")).unwrap_or(defaults.transmittance),
        emission: parse_color(m.unknown_param.get("Ke")).unwrap_or(defaults.emission),
        shininess: m.shininess.unwrap_or(defaults.shininess),
        ior: m.optical_density.unwrap_or(defaults.ior),
        dissolve: m.dissolve.unwrap_or(defaults.dissolve),
        illum: m.illumination_model.map_or(defaults.illum, i32::from),
        texture,
    }
}

fn parse_color(value: Option<&String>) -> Option<[f32; 3]> {
    let mut it = value?.split_whitespace().map(|s| s.parse::<f32>());
    let r = it.next()?.ok()?;
    let g = it.next()?.ok()?;
    let b = it.next()?.ok()?;
    Some([r, g, b])
}

/// Face normal for shapes without normals, when other shapes in the same
/// file do carry them.
fn flat_normal(tri: &mut [Vertex; 3]) {
    let [a, b, c] = [tri[0].position(), tri[1].position(), tri[2].position()];
    let n = (b - a).cross(c - a).try_normalize().unwrap_or(Vec3::Y).to_array();
    for v in tri.iter_mut() {
        v.normal = n;
    }
}

#[inline]
fn read3(data: &[f32], i: usize) -> Option<Vec3> {
    data.get(i * 3..i * 3 + 3).map(Vec3::from_slice)
}

#[inline]
fn read2(data: &[f32], i: usize) -> Option<Vec2> {
    data.get(i * 2..i * 2 + 2).map(Vec2::from_slice)
}
