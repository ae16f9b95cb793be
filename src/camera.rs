//! Look-at camera and the per-frame trace uniform.

use glam::{Mat4, Vec2, Vec3, Vec4};
use serde::{Deserialize, Serialize};
use trace_kernel::TraceUniform;

const Z_NEAR: f32 = 0.1;
const Z_FAR: f32 = 1000.0;

/// Perspective look-at camera.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Camera {
    pub eye: [f32; 3],
    pub target: [f32; 3],
    pub up: [f32; 3],
    /// Vertical field of view in degrees.
    pub fov_y: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            eye: [5.0, 4.0, -4.0],
            target: [0.0, 1.0, 0.0],
            up: [0.0, 1.0, 0.0],
            fov_y: 60.0,
        }
    }
}

impl Camera {
    pub fn look_at(eye: Vec3, target: Vec3) -> Self {
        Self {
            eye: eye.to_array(),
            target: target.to_array(),
            ..Self::default()
        }
    }

    pub fn view(&self) -> Mat4 {
        Mat4::look_at_rh(
            Vec3::from_array(self.eye),
            Vec3::from_array(self.target),
            Vec3::from_array(self.up),
        )
    }

    pub fn projection(&self, aspect: f32) -> Mat4 {
        Mat4::perspective_rh(self.fov_y.to_radians(), aspect, Z_NEAR, Z_FAR)
    }

    /// Uniform for a `width` x `height` dispatch. `instance_count` and the
    /// node count in `dims` are filled in by the device.
    pub fn uniform(&self, width: u32, height: u32, clear_color: [f32; 4], light_dir: Vec3) -> TraceUniform {
        let aspect = width.max(1) as f32 / height.max(1) as f32;
        TraceUniform {
            inv_view: self.view().inverse().to_cols_array_2d(),
            inv_proj: self.projection(aspect).inverse().to_cols_array_2d(),
            clear_color,
            light_dir: light_dir.normalize_or(Vec3::Y).extend(0.0).to_array(),
            dims: [width, height, 0, 0],
        }
    }
}

/// World-space direction of the primary ray through the center of pixel
/// (`x`, `y`). Matches the ray generation of the compute kernel.
pub fn primary_ray(inv_view: &Mat4, inv_proj: &Mat4, x: u32, y: u32, width: u32, height: u32) -> Vec3 {
    let uv = (Vec2::new(x as f32, y as f32) + 0.5) / Vec2::new(width as f32, height as f32);
    let d = Vec2::new(uv.x * 2.0 - 1.0, 1.0 - uv.y * 2.0);
    let target = *inv_proj * Vec4::new(d.x, d.y, 1.0, 1.0);
    inv_view
        .transform_vector3(target.truncate().normalize())
        .normalize()
}
