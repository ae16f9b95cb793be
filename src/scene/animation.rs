//! Scene animation drivers.

use std::f32::consts::PI;

use glam::{Mat4, Vec3};
use rayon::prelude::*;

use super::{InstanceId, ModelId, ModelRegistry, SceneUpdate};
use crate::util::Result;

/// Arc length between neighbours on the circle.
const CIRCLE_SPACING: f32 = 3.0;

/// Transforms placing `count` instances evenly on a circle that turns with
/// `time`. Neighbours stay [`CIRCLE_SPACING`] apart.
pub fn circle_transforms(count: usize, time: f32) -> Vec<Mat4> {
    if count == 0 {
        return Vec::new();
    }
    let delta = 2.0 * PI / count as f32;
    // a single instance has no neighbour to keep apart from
    let radius = if count > 1 {
        CIRCLE_SPACING / (2.0 * (delta / 2.0).sin())
    } else {
        0.0
    };
    let offset = time * 0.5;
    (0..count)
        .map(|i| {
            Mat4::from_rotation_y(i as f32 * delta + offset) * Mat4::from_translation(Vec3::new(radius, 0.0, 0.0))
        })
        .collect()
}

/// Radial wave: each vertex height follows `|sin(time*4 + r*pi)| * 0.5`
/// where `r` is its distance from the Y axis, keeping the side of the XZ
/// plane it started on. Returns new positions and normals.
pub fn wave_deform(base: &[Vec3], time: f32) -> (Vec<Vec3>, Vec<Vec3>) {
    base.par_iter()
        .map(|&p| {
            let sign_y = if p.y >= 0.0 { 1.0 } else { -1.0 };
            let radius = Vec3::new(p.x, 0.0, p.z).length();
            let arg = time * 4.0 + radius * PI;
            let s = arg.sin();
            let pos = Vec3::new(p.x, sign_y * s.abs() * 0.5, p.z);

            let up = Vec3::new(0.0, sign_y, 0.0);
            let normal = if radius == 0.0 {
                up
            } else {
                let xz_factor = -PI * s * arg.cos();
                let y_factor = 2.0 * sign_y * radius * s.abs();
                Vec3::new(p.x * xz_factor, y_factor, p.z * xz_factor)
                    .try_normalize()
                    .unwrap_or(up)
            };
            (pos, normal)
        })
        .unzip()
}

/// Produces per-frame snapshots for a set of animated instances and an
/// optional deformed mesh.
#[derive(Debug, Clone, Default)]
pub struct Animator {
    circle: Vec<(InstanceId, Mat4)>,
    wave: Option<(ModelId, Vec<Vec3>)>,
}

impl Animator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spin these instances around their base origin. Each keeps its current
    /// transform as the base the spin is composed onto: `base * spin`.
    pub fn with_circle(mut self, registry: &ModelRegistry, instances: &[InstanceId]) -> Result<Self> {
        self.circle = instances
            .iter()
            .map(|&id| Ok((id, registry.instance(id)?.transform)))
            .collect::<Result<_>>()?;
        Ok(self)
    }

    /// Deform this model's rest positions with [`wave_deform`].
    pub fn with_wave(mut self, registry: &ModelRegistry, model: ModelId) -> Result<Self> {
        let rest = registry.mesh(model)?.vertices().iter().map(|v| v.position()).collect();
        self.wave = Some((model, rest));
        Ok(self)
    }

    /// Edits for time `time` (seconds).
    pub fn snapshot(&self, time: f32) -> SceneUpdate {
        let mut update = SceneUpdate::new();
        let transforms = circle_transforms(self.circle.len(), time);
        for ((id, base), spin) in self.circle.iter().zip(transforms) {
            update.set_transform(*id, *base * spin);
        }
        if let Some((model, rest)) = &self.wave {
            let (positions, normals) = wave_deform(rest, time);
            update.set_vertices(*model, positions, Some(normals));
        }
        update
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circle_spacing() {
        let transforms = circle_transforms(6, 0.0);
        assert_eq!(transforms.len(), 6);
        let points: Vec<Vec3> = transforms.iter().map(|m| m.transform_point3(Vec3::ZERO)).collect();
        for i in 0..6 {
            let d = points[i].distance(points[(i + 1) % 6]);
            assert!((d - CIRCLE_SPACING).abs() < 1e-4, "spacing {} at {}", d, i);
            assert!(points[i].y.abs() < 1e-6);
        }
    }

    #[test]
    fn test_circle_rotates_with_time() {
        let a = circle_transforms(4, 0.0)[0].transform_point3(Vec3::ZERO);
        let b = circle_transforms(4, 1.0)[0].transform_point3(Vec3::ZERO);
        assert!((a.length() - b.length()).abs() < 1e-4);
        assert!(a.distance(b) > 0.1);
    }

    #[test]
    fn test_single_instance_stays_put() {
        let t = circle_transforms(1, 3.0);
        assert!(t[0].transform_point3(Vec3::ZERO).length() < 1e-6);
    }

    #[test]
    fn test_circle_composes_onto_base() {
        let mut registry = ModelRegistry::new();
        let mesh = crate::loader::load(
            &crate::loader::ModelSource::procedural(crate::loader::Primitive::Triangle),
            &crate::loader::LoaderConfig::default(),
        )
        .expect("load");
        let base = Mat4::from_translation(Vec3::X);
        let a = registry.add_model(mesh, base);
        let model = registry.instance(a).expect("instance").model;
        let b = registry.add_instance(model, base).expect("add");

        let animator = Animator::new().with_circle(&registry, &[a, b]).expect("circle");
        let update = animator.snapshot(1.0);
        let spins = circle_transforms(2, 1.0);
        for (id, spin) in [a, b].into_iter().zip(spins) {
            let expected = (base * spin).transform_point3(Vec3::ZERO);
            let got = update.transforms[&id].transform_point3(Vec3::ZERO);
            assert!(got.distance(expected) < 1e-5, "{:?} != {:?}", got, expected);
        }
        // instance 0: translate(1,0,0) then rotate 0.5 rad then out by radius 1.5
        let origin = update.transforms[&a].transform_point3(Vec3::ZERO);
        assert!((origin.x - (1.0 + 1.5 * 0.5f32.cos())).abs() < 1e-4);
        assert!((origin.z + 1.5 * 0.5f32.sin()).abs() < 1e-4);
    }

    #[test]
    fn test_wave_keeps_count_and_unit_normals() {
        let base: Vec<Vec3> = (0..50)
            .map(|i| {
                let a = i as f32 * 0.3;
                Vec3::new(a.cos(), if i % 2 == 0 { 0.5 } else { -0.5 }, a.sin())
            })
            .collect();
        let (pos, nrm) = wave_deform(&base, 0.7);
        assert_eq!(pos.len(), base.len());
        for (p, (b, n)) in pos.iter().zip(base.iter().zip(&nrm)) {
            assert_eq!(p.x, b.x);
            assert_eq!(p.z, b.z);
            assert!(p.y.abs() <= 0.5 + 1e-6);
            assert_eq!(p.y >= 0.0, b.y >= 0.0);
            assert!((n.length() - 1.0).abs() < 1e-5);
        }
    }
}
