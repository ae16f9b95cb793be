//! Acceleration-structure lifecycle.
//!
//! - [`AccelBackend`] - the device seam: build/update bottom- and top-level
//!   structures and query device addresses
//! - [`BlasManager`] - one bottom-level structure per model
//! - [`TlasManager`] - the single top-level structure over all instances
//! - [`InstanceRecord`] - the 64-byte top-level instance record

mod blas;
mod tlas;

use bytemuck::{Pod, Zeroable};
use glam::Mat4;

use crate::model::{Mesh, Vertex};
use crate::util::{from_transform_3x4, to_transform_3x4, Result};

pub use blas::{BlasManager, BlasState, BuiltBlas};
pub use tlas::{TlasManager, TlasState};

/// Backend-defined handle of a built structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccelHandle(pub u32);

/// Stable address of a bottom-level structure, referenced by instance
/// records. Valid until the structure is destroyed or rebuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DeviceAddress(pub u64);

bitflags::bitflags! {
    /// Build preference bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BuildFlags: u32 {
        /// Structure may later be refit in place.
        const ALLOW_UPDATE = 1 << 0;
        const PREFER_FAST_TRACE = 1 << 1;
        const PREFER_FAST_BUILD = 1 << 2;
    }
}

impl BuildFlags {
    /// Flags for per-model structures: cheap to build, refittable.
    pub const BOTTOM_LEVEL: Self = Self::ALLOW_UPDATE.union(Self::PREFER_FAST_BUILD);
    /// Flags for the instance structure: fast to trace, refittable.
    pub const TOP_LEVEL: Self = Self::PREFER_FAST_TRACE.union(Self::ALLOW_UPDATE);
}

/// Triangle geometry for a bottom-level build.
#[derive(Debug, Clone, Copy)]
pub struct BlasGeometry<'a> {
    /// Positions are read from the start of each vertex.
    pub vertices: &'a [Vertex],
    pub indices: &'a [u32],
    /// Skip any-hit processing.
    pub opaque: bool,
}

impl<'a> BlasGeometry<'a> {
    pub fn from_mesh(mesh: &'a Mesh) -> Self {
        Self {
            vertices: mesh.vertices(),
            indices: mesh.indices(),
            opaque: true,
        }
    }

    #[inline]
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }
}

/// Instance flag: render both faces.
pub const INSTANCE_TRIANGLE_CULL_DISABLE: u8 = 0x01;

/// Mask value that makes an instance visible to every ray.
pub const INSTANCE_MASK_ALL: u8 = 0xFF;

/// Top-level instance record (64 bytes).
///
/// `transform` is the object-to-world matrix as 3 rows of 4; custom index
/// and shader-binding offset are 24-bit fields packed with the 8-bit mask
/// and flags.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceRecord {
    pub transform: [[f32; 4]; 3],
    pub custom_index_and_mask: u32,
    pub sbt_offset_and_flags: u32,
    pub blas_address: u64,
}

impl InstanceRecord {
    pub fn new(
        transform: &Mat4,
        custom_index: u32,
        mask: u8,
        sbt_offset: u32,
        flags: u8,
        blas: DeviceAddress,
    ) -> Self {
        debug_assert!(custom_index <= 0x00FF_FFFF);
        debug_assert!(sbt_offset <= 0x00FF_FFFF);
        Self {
            transform: to_transform_3x4(transform),
            custom_index_and_mask: (custom_index & 0x00FF_FFFF) | ((mask as u32) << 24),
            sbt_offset_and_flags: (sbt_offset & 0x00FF_FFFF) | ((flags as u32) << 24),
            blas_address: blas.0,
        }
    }

    #[inline]
    pub fn custom_index(&self) -> u32 {
        self.custom_index_and_mask & 0x00FF_FFFF
    }

    #[inline]
    pub fn mask(&self) -> u8 {
        (self.custom_index_and_mask >> 24) as u8
    }

    #[inline]
    pub fn sbt_offset(&self) -> u32 {
        self.sbt_offset_and_flags & 0x00FF_FFFF
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        (self.sbt_offset_and_flags >> 24) as u8
    }

    #[inline]
    pub fn blas_address(&self) -> DeviceAddress {
        DeviceAddress(self.blas_address)
    }

    /// Object-to-world matrix.
    #[inline]
    pub fn object_to_world(&self) -> Mat4 {
        from_transform_3x4(&self.transform)
    }
}

/// Device operations on acceleration structures.
///
/// Each build or update call is one device submission.
pub trait AccelBackend {
    /// Build a bottom-level structure from triangle geometry.
    fn build_bottom_level(&mut self, geometry: &BlasGeometry<'_>, flags: BuildFlags) -> Result<AccelHandle>;

    /// Refit a bottom-level structure in place. The structure must have been
    /// built with [`BuildFlags::ALLOW_UPDATE`] and the triangle count must
    /// match.
    fn update_bottom_level(&mut self, handle: AccelHandle, geometry: &BlasGeometry<'_>) -> Result<()>;

    /// Build the top-level structure over instance records.
    fn build_top_level(&mut self, instances: &[InstanceRecord], flags: BuildFlags) -> Result<AccelHandle>;

    /// Refit the top-level structure with new records (same count).
    fn update_top_level(&mut self, handle: AccelHandle, instances: &[InstanceRecord]) -> Result<()>;

    /// Address of a bottom-level structure.
    fn device_address(&self, handle: AccelHandle) -> Result<DeviceAddress>;

    /// Release a structure.
    fn destroy(&mut self, handle: AccelHandle);
}
