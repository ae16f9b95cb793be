//! Generated geometry.

use std::f32::consts::PI;

use glam::{Vec2, Vec3};

use crate::model::{Material, RawMesh, Vertex};

/// Built-in shapes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Primitive {
    /// Unit right triangle in the XY plane facing +Z.
    Triangle,
    /// Square in the XZ plane facing +Y, centered at the origin.
    Plane { size: f32, subdivisions: u32 },
    /// Axis-aligned cube centered at the origin.
    Cube { size: f32 },
    /// UV sphere centered at the origin.
    Sphere { radius: f32, segments: u32, rings: u32 },
}

impl Primitive {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Triangle => "triangle",
            Self::Plane { .. } => "plane",
            Self::Cube { .. } => "cube",
            Self::Sphere { .. } => "sphere",
        }
    }
}

fn vertex(p: Vec3, n: Vec3, uv: Vec2) -> Vertex {
    Vertex::new(p, n, Vec3::ONE, uv)
}

/// Two triangles (a, b, c) and (a, c, d); the quad must be wound
/// counter-clockwise around its normal.
fn push_quad(raw: &mut RawMesh, q: [Vertex; 4]) {
    raw.push_triangle([q[0], q[1], q[2]], 0);
    raw.push_triangle([q[0], q[2], q[3]], 0);
}

pub(super) fn generate(primitive: &Primitive, material: Option<&Material>) -> RawMesh {
    let mut raw = RawMesh::new(primitive.name());
    raw.has_normals = true;
    raw.materials.extend(material.copied());

    match *primitive {
        Primitive::Triangle => {
            let n = Vec3::Z;
            raw.push_triangle(
                [
                    vertex(Vec3::ZERO, n, Vec2::new(0.0, 1.0)),
                    vertex(Vec3::X, n, Vec2::new(1.0, 1.0)),
                    vertex(Vec3::Y, n, Vec2::new(0.0, 0.0)),
                ],
                0,
            );
        }
        Primitive::Plane { size, subdivisions } => {
            let n = subdivisions.max(1);
            let step = size / n as f32;
            let half = size * 0.5;
            for iz in 0..n {
                for ix in 0..n {
                    let x0 = -half + ix as f32 * step;
                    let z0 = -half + iz as f32 * step;
                    let (x1, z1) = (x0 + step, z0 + step);
                    let uv = |x: f32, z: f32| Vec2::new((x + half) / size, (z + half) / size);
                    push_quad(
                        &mut raw,
                        [
                            vertex(Vec3::new(x0, 0.0, z0), Vec3::Y, uv(x0, z0)),
                            vertex(Vec3::new(x0, 0.0, z1), Vec3::Y, uv(x0, z1)),
                            vertex(Vec3::new(x1, 0.0, z1), Vec3::Y, uv(x1, z1)),
                            vertex(Vec3::new(x1, 0.0, z0), Vec3::Y, uv(x1, z0)),
                        ],
                    );
                }
            }
        }
        Primitive::Cube { size } => {
            let h = size * 0.5;
            // (normal, u, v) with u x v == normal
            let faces = [
                (Vec3::X, Vec3::Y, Vec3::Z),
                (Vec3::NEG_X, Vec3::Z, Vec3::Y),
                (Vec3::Y, Vec3::Z, Vec3::X),
                (Vec3::NEG_Y, Vec3::X, Vec3::Z),
                (Vec3::Z, Vec3::X, Vec3::Y),
                (Vec3::NEG_Z, Vec3::Y, Vec3::X),
            ];
            for (n, u, v) in faces {
                let c = n * h;
                push_quad(
                    &mut raw,
                    [
                        vertex(c - u * h - v * h, n, Vec2::new(0.0, 1.0)),
                        vertex(c + u * h - v * h, n, Vec2::new(1.0, 1.0)),
                        vertex(c + u * h + v * h, n, Vec2::new(1.0, 0.0)),
                        vertex(c - u * h + v * h, n, Vec2::new(0.0, 0.0)),
                    ],
                );
            }
        }
        Primitive::Sphere { radius, segments, rings } => {
            let segments = segments.max(3);
            let rings = rings.max(2);
            let point = |r: u32, s: u32| -> Vertex {
                let theta = PI * r as f32 / rings as f32;
                let phi = 2.0 * PI * s as f32 / segments as f32;
                let n = Vec3::new(theta.sin() * phi.cos(), theta.cos(), theta.sin() * phi.sin());
                vertex(
                    n * radius,
                    n,
                    Vec2::new(s as f32 / segments as f32, r as f32 / rings as f32),
                )
            };
            for r in 0..rings {
                for s in 0..segments {
                    let a = point(r, s);
                    let b = point(r + 1, s);
                    let c = point(r + 1, s + 1);
                    let d = point(r, s + 1);
                    // pole rows collapse one triangle of the quad
                    if r != 0 {
                        raw.push_triangle([a, d, c], 0);
                    }
                    if r != rings - 1 {
                        raw.push_triangle([a, c, b], 0);
                    }
                }
            }
        }
    }
    raw
}
