//! Normalized mesh model.
//!
//! Every loader produces a [`RawMesh`] (flattened triangle corners plus raw
//! material ids) and then calls [`RawMesh::normalize`], which enforces the
//! invariants every other module relies on:
//!
//! - index count is a multiple of 3 and every index is in range
//! - one material index per triangle, each in `[0, materials.len())`
//! - at least one material
//! - every vertex carries a unit-length normal

mod material;
mod mesh;

pub use material::Material;
pub use mesh::{Mesh, RawMesh, Topology, Vertex};
