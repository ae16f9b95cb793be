//! Utility types shared across the crate.
//!
//! - [`Error`] / [`Result`] - Error handling
//! - [`Aabb`] and transform helpers built on glam

mod error;
mod math;

pub use error::*;
pub use math::*;
