//! GPU data layouts.
//!
//! vec3 fields are padded to 16 bytes with a trailing scalar so the
//! structs can be bound as WGSL storage arrays without extra padding.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

/// BVH node (32 bytes).
///
/// Internal node: `left_or_first` = left child index, `count` = 0.
/// Leaf node: `left_or_first` = first primitive index, `count` > 0.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct BvhNode {
    pub aabb_min: [f32; 3],
    pub left_or_first: u32,
    pub aabb_max: [f32; 3],
    pub count: u32,
}

impl BvhNode {
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.count > 0
    }

    #[inline]
    pub fn min(&self) -> Vec3 {
        Vec3::from_array(self.aabb_min)
    }

    #[inline]
    pub fn max(&self) -> Vec3 {
        Vec3::from_array(self.aabb_max)
    }
}

/// Triangle in object space with its material slot (48 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuTriangle {
    pub v0: [f32; 3],
    pub material: u32,
    pub v1: [f32; 3],
    pub _pad0: u32,
    pub v2: [f32; 3],
    pub _pad1: u32,
}

impl GpuTriangle {
    pub fn new(v0: Vec3, v1: Vec3, v2: Vec3, material: u32) -> Self {
        Self {
            v0: v0.to_array(),
            material,
            v1: v1.to_array(),
            _pad0: 0,
            v2: v2.to_array(),
            _pad1: 0,
        }
    }
}

/// Top-level instance (80 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuInstance {
    /// Column-major world-to-object matrix.
    pub world_to_object: [[f32; 4]; 4],
    /// Root node of the instance's tree in the global BLAS node array.
    pub blas_root: u32,
    /// Offset of the instance's materials in the global material array.
    pub material_base: u32,
    /// Application-defined index (model slot).
    pub custom_index: u32,
    /// Visibility mask (low 8 bits).
    pub mask: u32,
}

impl GpuInstance {
    pub fn new(object_to_world: &Mat4, blas_root: u32, material_base: u32, custom_index: u32, mask: u32) -> Self {
        Self {
            world_to_object: object_to_world.inverse().to_cols_array_2d(),
            blas_root,
            material_base,
            custom_index,
            mask,
        }
    }
}

/// Material used for shading (32 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuMaterial {
    /// rgb = diffuse, a = dissolve
    pub diffuse_dissolve: [f32; 4],
    /// rgb = emission, a = ior
    pub emission_ior: [f32; 4],
}

/// Per-frame trace parameters (176 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct TraceUniform {
    /// Inverse view matrix (world from view).
    pub inv_view: [[f32; 4]; 4],
    /// Inverse projection matrix (view from clip).
    pub inv_proj: [[f32; 4]; 4],
    /// Color written for rays that miss.
    pub clear_color: [f32; 4],
    /// xyz = direction towards the light (normalized), w unused.
    pub light_dir: [f32; 4],
    /// x = width, y = height, z = TLAS node count, w = instance count.
    pub dims: [u32; 4],
}

impl Default for TraceUniform {
    fn default() -> Self {
        Self {
            inv_view: Mat4::IDENTITY.to_cols_array_2d(),
            inv_proj: Mat4::IDENTITY.to_cols_array_2d(),
            clear_color: [1.0; 4],
            light_dir: [0.0, 1.0, 0.0, 0.0],
            dims: [0; 4],
        }
    }
}
