//! Two-level BVH ray traversal kernel.
//!
//! Provides the GPU data layouts shared by the CPU tracer and the WGSL
//! compute kernel, plus the kernel source itself. All structs are `Pod` and
//! match the WGSL declarations byte for byte.
//!
//! ## Layout
//!
//! - [`BvhNode`]: 32-byte node. Internal nodes store the left child index
//!   (right child is `left + 1`) with `count == 0`; leaves store the first
//!   primitive index and a non-zero count.
//! - [`GpuTriangle`]: positions of one triangle plus its material slot.
//! - [`GpuInstance`]: world-to-object transform and BLAS root of one
//!   top-level instance.
//! - [`GpuMaterial`]: vec4-packed material.
//! - [`TraceUniform`]: camera and frame parameters.
//!
//! ## Usage
//!
//! ```ignore
//! use trace_kernel::{TraceUniform, SHADER_SOURCE, WORKGROUP_SIZE};
//!
//! let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
//!     label: Some("trace_kernel"),
//!     source: wgpu::ShaderSource::Wgsl(SHADER_SOURCE.into()),
//! });
//! let groups_x = width.div_ceil(WORKGROUP_SIZE);
//! ```

mod layout;

pub use layout::{BvhNode, GpuInstance, GpuMaterial, GpuTriangle, TraceUniform};

/// Embedded kernel source.
pub const SHADER_SOURCE: &str = include_str!("shaders/trace.wgsl");

/// Workgroup edge length (must match `@workgroup_size` in the kernel).
pub const WORKGROUP_SIZE: u32 = 8;

/// Traversal stack depth for the top-level tree.
pub const TLAS_STACK_SIZE: usize = 32;

/// Traversal stack depth for bottom-level trees.
pub const BLAS_STACK_SIZE: usize = 64;

/// Ray interval used by both tracers.
pub const T_MIN: f32 = 0.001;
pub const T_MAX: f32 = 10000.0;
