//! Ray-tracing devices.
//!
//! - [`SoftwareDevice`] - CPU implementation of acceleration structures and
//!   ray dispatch (SAH trees, rayon across rows)
//! - `GpuDevice` (feature `gpu`) - wgpu compute tracer over the software
//!   device's trees

mod bvh;
mod software;
#[cfg(feature = "gpu")]
mod gpu;

use trace_kernel::{GpuMaterial, TraceUniform};

use crate::accel::{AccelBackend, AccelHandle};
use crate::model::Mesh;
use crate::output::OutputImage;
use crate::util::Result;

pub use bvh::{build_bvh, Bvh, MAX_LEAF_SIZE};
pub use software::{RayHit, SoftwareDevice};
#[cfg(feature = "gpu")]
pub use gpu::GpuDevice;

/// Per-model shading data, addressed by an instance's custom index.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDesc {
    pub materials: Vec<GpuMaterial>,
    /// One entry per triangle.
    pub material_indices: Vec<u32>,
}

impl ObjectDesc {
    pub fn from_mesh(mesh: &Mesh) -> Self {
        Self {
            materials: mesh.materials().iter().map(|m| m.to_gpu()).collect(),
            material_indices: mesh.material_indices().to_vec(),
        }
    }
}

/// Device operations around a trace dispatch.
pub trait TraceBackend {
    /// (Re)allocate the output image. Previous contents are discarded.
    fn allocate_output(&mut self, width: u32, height: u32) -> Result<()>;

    /// Dimensions of the allocated output image.
    fn output_size(&self) -> Option<(u32, u32)>;

    /// Replace the object description table.
    fn upload_objects(&mut self, objects: &[ObjectDesc]) -> Result<()>;

    /// Camera and frame parameters for the next dispatch.
    fn update_uniform(&mut self, uniform: &TraceUniform) -> Result<()>;

    /// Trace one primary ray per pixel into the output image. Dimensions
    /// must match the allocated output.
    fn dispatch_rays(&mut self, tlas: AccelHandle, width: u32, height: u32) -> Result<()>;

    /// Copy the output image back to the host.
    fn read_output(&mut self) -> Result<OutputImage>;
}

/// Everything the frame controller needs from a device.
pub trait RenderBackend: AccelBackend + TraceBackend {}

impl<T: AccelBackend + TraceBackend> RenderBackend for T {}
