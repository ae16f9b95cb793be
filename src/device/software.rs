//! CPU ray-tracing device.
//!
//! Bottom-level structures are SAH trees over object-space triangles;
//! the top-level structure is a SAH tree over instance world bounds.
//! Device addresses are synthesized from handles and never reused, so a
//! rebuilt structure always gets a new address.

use std::collections::HashMap;

use glam::{Mat4, Vec3};
use rayon::prelude::*;
use trace_kernel::{TraceUniform, T_MAX, T_MIN};

use super::bvh::{build_bvh, Bvh, MAX_LEAF_SIZE};
use super::{ObjectDesc, TraceBackend};
use crate::accel::{AccelBackend, AccelHandle, BlasGeometry, BuildFlags, DeviceAddress, InstanceRecord};
use crate::camera::primary_ray;
use crate::output::{OutputImage, PixelFormat};
use crate::util::{Aabb, Error, Result};

const ADDRESS_BASE: u64 = 0x0001_0000_0000;
const ADDRESS_STRIDE: u64 = 0x1_0000;

/// Leaf size of the instance tree.
const TLAS_LEAF_SIZE: usize = 2;

pub(crate) struct BottomLevel {
    pub(crate) triangles: Vec<[Vec3; 3]>,
    pub(crate) bvh: Bvh,
    flags: BuildFlags,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ResolvedInstance {
    pub(crate) object_to_world: Mat4,
    pub(crate) world_to_object: Mat4,
    pub(crate) blas: AccelHandle,
    pub(crate) custom_index: u32,
    pub(crate) mask: u8,
}

pub(crate) struct TopLevel {
    pub(crate) instances: Vec<ResolvedInstance>,
    /// Instances with geometry; the tree indexes into this list.
    pub(crate) active: Vec<u32>,
    pub(crate) bvh: Bvh,
    flags: BuildFlags,
}

enum Structure {
    Bottom(BottomLevel),
    Top(TopLevel),
}

/// Closest hit of a ray.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayHit {
    pub t: f32,
    /// Position of the instance in the top-level record list.
    pub instance: usize,
    pub custom_index: u32,
    pub primitive: usize,
    /// Unit geometric normal in world space (as wound, not face-forwarded).
    pub normal: Vec3,
}

/// CPU device.
pub struct SoftwareDevice {
    structures: HashMap<AccelHandle, Structure>,
    next_handle: u32,
    objects: Vec<ObjectDesc>,
    uniform: TraceUniform,
    output: Option<OutputImage>,
    submissions: u64,
    revision: u64,
}

impl Default for SoftwareDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareDevice {
    pub fn new() -> Self {
        Self {
            structures: HashMap::new(),
            next_handle: 0,
            objects: Vec::new(),
            uniform: TraceUniform::default(),
            output: None,
            submissions: 0,
            revision: 0,
        }
    }

    /// Builds, updates and dispatches issued so far.
    pub fn submissions(&self) -> u64 {
        self.submissions
    }

    /// Live acceleration structures.
    pub fn structure_count(&self) -> usize {
        self.structures.len()
    }

    /// Bumped whenever structures or object data change.
    pub(crate) fn revision(&self) -> u64 {
        self.revision
    }

    pub(crate) fn objects(&self) -> &[ObjectDesc] {
        &self.objects
    }

    pub(crate) fn uniform(&self) -> &TraceUniform {
        &self.uniform
    }

    pub(crate) fn bottom(&self, handle: AccelHandle) -> Option<&BottomLevel> {
        match self.structures.get(&handle) {
            Some(Structure::Bottom(b)) => Some(b),
            _ => None,
        }
    }

    pub(crate) fn top(&self, handle: AccelHandle) -> Option<&TopLevel> {
        match self.structures.get(&handle) {
            Some(Structure::Top(t)) => Some(t),
            _ => None,
        }
    }

    fn allocate_handle(&mut self) -> AccelHandle {
        let handle = AccelHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    fn address_of(handle: AccelHandle) -> DeviceAddress {
        DeviceAddress(ADDRESS_BASE + handle.0 as u64 * ADDRESS_STRIDE)
    }

    fn handle_at(&self, address: DeviceAddress) -> Option<AccelHandle> {
        let offset = address.0.checked_sub(ADDRESS_BASE)?;
        if offset % ADDRESS_STRIDE != 0 {
            return None;
        }
        let handle = AccelHandle(u32::try_from(offset / ADDRESS_STRIDE).ok()?);
        self.bottom(handle).map(|_| handle)
    }

    fn resolve_instances(&self, records: &[InstanceRecord]) -> Result<Vec<ResolvedInstance>> {
        records
            .iter()
            .enumerate()
            .map(|(i, rec)| {
                let blas = self.handle_at(rec.blas_address()).ok_or_else(|| {
                    Error::device(
                        "build_top_level",
                        format!("instance {} references unknown address {:#x}", i, rec.blas_address),
                    )
                })?;
                let object_to_world = rec.object_to_world();
                Ok(ResolvedInstance {
                    object_to_world,
                    world_to_object: object_to_world.inverse(),
                    blas,
                    custom_index: rec.custom_index(),
                    mask: rec.mask(),
                })
            })
            .collect()
    }

    /// Instances with geometry and their world bounds.
    fn instance_bounds(&self, instances: &[ResolvedInstance]) -> (Vec<u32>, Vec<Aabb>) {
        let mut active = Vec::with_capacity(instances.len());
        let mut bounds = Vec::with_capacity(instances.len());
        for (i, inst) in instances.iter().enumerate() {
            if let Some(blas) = self.bottom(inst.blas).filter(|b| !b.bvh.is_empty()) {
                active.push(i as u32);
                bounds.push(blas.bvh.bounds().transformed(&inst.object_to_world));
            }
        }
        (active, bounds)
    }

    /// Cast a single ray against a top-level structure.
    pub fn trace(&self, tlas: AccelHandle, origin: Vec3, dir: Vec3) -> Result<Option<RayHit>> {
        let top = self
            .top(tlas)
            .ok_or_else(|| Error::device("trace", format!("{:?} is not a top-level structure", tlas)))?;
        Ok(self.trace_top(top, origin, dir))
    }

    fn trace_top(&self, top: &TopLevel, origin: Vec3, dir: Vec3) -> Option<RayHit> {
        let mut best: Option<RayHit> = None;
        top.bvh.traverse(origin, dir, T_MIN, T_MAX, |slot, t_max| {
            let idx = top.active[slot as usize] as usize;
            let inst = &top.instances[idx];
            if inst.mask == 0 {
                return None;
            }
            let blas = self.bottom(inst.blas)?;
            let o = inst.world_to_object.transform_point3(origin);
            let d = inst.world_to_object.transform_vector3(dir);
            let mut closest: Option<(f32, usize)> = None;
            blas.bvh.traverse(o, d, T_MIN, t_max, |prim, t_max| {
                let t = intersect_triangle(o, d, &blas.triangles[prim as usize])?;
                (t > T_MIN && t < t_max).then(|| {
                    closest = Some((t, prim as usize));
                    t
                })
            });
            let (t, prim) = closest?;
            let [a, b, c] = blas.triangles[prim];
            let normal = inst
                .world_to_object
                .transpose()
                .transform_vector3((b - a).cross(c - a))
                .normalize_or_zero();
            best = Some(RayHit {
                t,
                instance: idx,
                custom_index: inst.custom_index,
                primitive: prim,
                normal,
            });
            Some(t)
        });
        best
    }

    fn shade(&self, hit: Option<RayHit>, dir: Vec3) -> [f32; 4] {
        let Some(hit) = hit else {
            return self.uniform.clear_color;
        };
        let n = if hit.normal.dot(dir) > 0.0 { -hit.normal } else { hit.normal };
        let light = Vec3::from_slice(&self.uniform.light_dir[..3]);
        let lambert = n.dot(light).max(0.0);
        let obj = &self.objects[hit.custom_index as usize];
        let mat = &obj.materials[obj.material_indices[hit.primitive] as usize];
        let diffuse = Vec3::from_slice(&mat.diffuse_dissolve[..3]);
        let emission = Vec3::from_slice(&mat.emission_ior[..3]);
        let rgb = diffuse * (0.2 + 0.8 * lambert) + emission;
        [rgb.x, rgb.y, rgb.z, 1.0]
    }

    /// Every traceable instance must have shading data for its triangles.
    fn validate_objects(&self, top: &TopLevel) -> Result<()> {
        for &i in &top.active {
            let inst = &top.instances[i as usize];
            let blas = self.bottom(inst.blas).ok_or_else(|| {
                Error::device("dispatch_rays", format!("instance {} references a destroyed bottom-level", i))
            })?;
            let obj = self.objects.get(inst.custom_index as usize).ok_or_else(|| {
                Error::device(
                    "dispatch_rays",
                    format!(
                        "custom index {} outside object table of {}",
                        inst.custom_index,
                        self.objects.len()
                    ),
                )
            })?;
            let bad_material = obj.material_indices.iter().any(|&m| m as usize >= obj.materials.len());
            if obj.material_indices.len() != blas.triangles.len() || bad_material {
                return Err(Error::device(
                    "dispatch_rays",
                    format!("object {} does not match its geometry", inst.custom_index),
                ));
            }
        }
        Ok(())
    }

    fn trace_into(&self, tlas: AccelHandle, output: &mut OutputImage, width: u32, height: u32) -> Result<()> {
        if output.size() != (width, height) {
            return Err(Error::device(
                "dispatch_rays",
                format!(
                    "dispatch {}x{} does not match output image {}x{}",
                    width,
                    height,
                    output.width(),
                    output.height()
                ),
            ));
        }
        let top = self
            .top(tlas)
            .ok_or_else(|| Error::device("dispatch_rays", format!("{:?} is not a top-level structure", tlas)))?;
        self.validate_objects(top)?;

        let inv_view = Mat4::from_cols_array_2d(&self.uniform.inv_view);
        let inv_proj = Mat4::from_cols_array_2d(&self.uniform.inv_proj);
        let origin = inv_view.transform_point3(Vec3::ZERO);
        let row_len = width as usize * 4;

        output
            .data_mut()
            .par_chunks_mut(row_len)
            .enumerate()
            .for_each(|(y, row)| {
                for x in 0..width as usize {
                    let dir = primary_ray(&inv_view, &inv_proj, x as u32, y as u32, width, height);
                    let color = self.shade(self.trace_top(top, origin, dir), dir);
                    row[x * 4..x * 4 + 4].copy_from_slice(&color);
                }
            });
        Ok(())
    }
}

/// Moller-Trumbore. Returns the hit distance along `dir`.
#[inline]
fn intersect_triangle(origin: Vec3, dir: Vec3, tri: &[Vec3; 3]) -> Option<f32> {
    let e1 = tri[1] - tri[0];
    let e2 = tri[2] - tri[0];
    let p = dir.cross(e2);
    let det = e1.dot(p);
    if det.abs() < 1e-12 {
        return None;
    }
    let inv_det = 1.0 / det;
    let s = origin - tri[0];
    let u = s.dot(p) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = s.cross(e1);
    let v = dir.dot(q) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    Some(e2.dot(q) * inv_det)
}

fn collect_triangles(op: &'static str, geometry: &BlasGeometry<'_>) -> Result<Vec<[Vec3; 3]>> {
    if geometry.indices.len() % 3 != 0 {
        return Err(Error::device(op, format!("{} indices is not a triangle list", geometry.indices.len())));
    }
    let vertices = geometry.vertices;
    geometry
        .indices
        .chunks_exact(3)
        .map(|tri| {
            let fetch = |i: u32| {
                vertices
                    .get(i as usize)
                    .map(|v| v.position())
                    .ok_or_else(|| Error::device(op, format!("index {} beyond {} vertices", i, vertices.len())))
            };
            Ok([fetch(tri[0])?, fetch(tri[1])?, fetch(tri[2])?])
        })
        .collect()
}

fn triangle_bounds(triangles: &[[Vec3; 3]]) -> Vec<Aabb> {
    triangles
        .par_iter()
        .map(|[a, b, c]| Aabb::from_triangle(*a, *b, *c))
        .collect()
}

impl AccelBackend for SoftwareDevice {
    #[tracing::instrument(skip_all, fields(tris = geometry.triangle_count()))]
    fn build_bottom_level(&mut self, geometry: &BlasGeometry<'_>, flags: BuildFlags) -> Result<AccelHandle> {
        let triangles = collect_triangles("build_bottom_level", geometry)?;
        let bvh = build_bvh(&triangle_bounds(&triangles), MAX_LEAF_SIZE);
        let handle = self.allocate_handle();
        self.structures
            .insert(handle, Structure::Bottom(BottomLevel { triangles, bvh, flags }));
        self.submissions += 1;
        self.revision += 1;
        Ok(handle)
    }

    #[tracing::instrument(skip_all, fields(?handle))]
    fn update_bottom_level(&mut self, handle: AccelHandle, geometry: &BlasGeometry<'_>) -> Result<()> {
        let triangles = collect_triangles("update_bottom_level", geometry)?;
        let blas = match self.structures.get_mut(&handle) {
            Some(Structure::Bottom(b)) => b,
            _ => {
                return Err(Error::device(
                    "update_bottom_level",
                    format!("{:?} is not a bottom-level structure", handle),
                ))
            }
        };
        if !blas.flags.contains(BuildFlags::ALLOW_UPDATE) {
            return Err(Error::precondition(format!("{:?} was built without ALLOW_UPDATE", handle)));
        }
        if triangles.len() != blas.triangles.len() {
            return Err(Error::precondition(format!(
                "refit with {} triangles, built with {}",
                triangles.len(),
                blas.triangles.len()
            )));
        }
        let bounds = triangle_bounds(&triangles);
        blas.triangles = triangles;
        blas.bvh.refit(&bounds);
        self.submissions += 1;
        self.revision += 1;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(instances = instances.len()))]
    fn build_top_level(&mut self, instances: &[InstanceRecord], flags: BuildFlags) -> Result<AccelHandle> {
        let resolved = self.resolve_instances(instances)?;
        let (active, bounds) = self.instance_bounds(&resolved);
        let bvh = build_bvh(&bounds, TLAS_LEAF_SIZE);
        let handle = self.allocate_handle();
        self.structures.insert(
            handle,
            Structure::Top(TopLevel {
                instances: resolved,
                active,
                bvh,
                flags,
            }),
        );
        self.submissions += 1;
        self.revision += 1;
        Ok(handle)
    }

    #[tracing::instrument(skip_all, fields(?handle, instances = instances.len()))]
    fn update_top_level(&mut self, handle: AccelHandle, instances: &[InstanceRecord]) -> Result<()> {
        let resolved = self.resolve_instances(instances)?;
        let (active, bounds) = self.instance_bounds(&resolved);
        let top = match self.structures.get_mut(&handle) {
            Some(Structure::Top(t)) => t,
            _ => {
                return Err(Error::device(
                    "update_top_level",
                    format!("{:?} is not a top-level structure", handle),
                ))
            }
        };
        if !top.flags.contains(BuildFlags::ALLOW_UPDATE) {
            return Err(Error::precondition(format!("{:?} was built without ALLOW_UPDATE", handle)));
        }
        if resolved.len() != top.instances.len() || active != top.active {
            return Err(Error::precondition(format!(
                "top-level refit with {} instances, built with {}",
                resolved.len(),
                top.instances.len()
            )));
        }
        top.instances = resolved;
        top.bvh.refit(&bounds);
        self.submissions += 1;
        self.revision += 1;
        Ok(())
    }

    fn device_address(&self, handle: AccelHandle) -> Result<DeviceAddress> {
        if self.structures.contains_key(&handle) {
            Ok(Self::address_of(handle))
        } else {
            Err(Error::device("device_address", format!("{:?} does not exist", handle)))
        }
    }

    fn destroy(&mut self, handle: AccelHandle) {
        if self.structures.remove(&handle).is_some() {
            self.revision += 1;
        }
    }
}

impl TraceBackend for SoftwareDevice {
    fn allocate_output(&mut self, width: u32, height: u32) -> Result<()> {
        self.output = Some(OutputImage::new(width, height, PixelFormat::Rgba32Float)?);
        tracing::debug!(width, height, "output image allocated");
        Ok(())
    }

    fn output_size(&self) -> Option<(u32, u32)> {
        self.output.as_ref().map(|o| o.size())
    }

    fn upload_objects(&mut self, objects: &[ObjectDesc]) -> Result<()> {
        self.objects = objects.to_vec();
        self.revision += 1;
        Ok(())
    }

    fn update_uniform(&mut self, uniform: &TraceUniform) -> Result<()> {
        self.uniform = *uniform;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(width, height))]
    fn dispatch_rays(&mut self, tlas: AccelHandle, width: u32, height: u32) -> Result<()> {
        let mut output = self
            .output
            .take()
            .ok_or_else(|| Error::device("dispatch_rays", "no output image allocated"))?;
        let result = self.trace_into(tlas, &mut output, width, height);
        self.output = Some(output);
        result?;
        self.submissions += 1;
        Ok(())
    }

    fn read_output(&mut self) -> Result<OutputImage> {
        self.output
            .clone()
            .ok_or_else(|| Error::device("read_output", "no output image allocated"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::{INSTANCE_MASK_ALL, INSTANCE_TRIANGLE_CULL_DISABLE};
    use crate::model::Vertex;
    use glam::Vec2;

    fn triangle_vertices(offset: Vec3) -> Vec<Vertex> {
        [Vec3::ZERO, Vec3::X, Vec3::Y]
            .iter()
            .map(|&p| Vertex::new(p + offset, Vec3::Z, Vec3::ONE, Vec2::ZERO))
            .collect()
    }

    fn build_triangle(device: &mut SoftwareDevice, flags: BuildFlags) -> AccelHandle {
        let vertices = triangle_vertices(Vec3::ZERO);
        let geometry = BlasGeometry {
            vertices: &vertices,
            indices: &[0, 1, 2],
            opaque: true,
        };
        device.build_bottom_level(&geometry, flags).expect("blas")
    }

    fn record(device: &SoftwareDevice, blas: AccelHandle, m: Mat4) -> InstanceRecord {
        let address = device.device_address(blas).expect("address");
        InstanceRecord::new(&m, 0, INSTANCE_MASK_ALL, 0, INSTANCE_TRIANGLE_CULL_DISABLE, address)
    }

    #[test]
    fn test_translated_instance_hit() {
        let mut device = SoftwareDevice::new();
        let blas = build_triangle(&mut device, BuildFlags::BOTTOM_LEVEL);
        let rec = record(&device, blas, Mat4::from_translation(Vec3::new(5.0, 0.0, 0.0)));
        let tlas = device.build_top_level(&[rec], BuildFlags::TOP_LEVEL).expect("tlas");

        let down = Vec3::new(0.0, 0.0, -1.0);
        let hit = device
            .trace(tlas, Vec3::new(5.25, 0.25, 10.0), down)
            .expect("trace")
            .expect("hit at translated location");
        assert!((hit.t - 10.0).abs() < 1e-4);
        assert_eq!(hit.custom_index, 0);
        assert!((hit.normal - Vec3::Z).length() < 1e-5);

        let miss = device.trace(tlas, Vec3::new(0.25, 0.25, 10.0), down).expect("trace");
        assert!(miss.is_none(), "untransformed location must miss");
    }

    #[test]
    fn test_backface_hit_with_culling_disabled() {
        let mut device = SoftwareDevice::new();
        let blas = build_triangle(&mut device, BuildFlags::BOTTOM_LEVEL);
        let rec = record(&device, blas, Mat4::IDENTITY);
        let tlas = device.build_top_level(&[rec], BuildFlags::TOP_LEVEL).expect("tlas");
        let hit = device
            .trace(tlas, Vec3::new(0.25, 0.25, -3.0), Vec3::Z)
            .expect("trace");
        assert!(hit.is_some());
    }

    #[test]
    fn test_addresses_unique_after_rebuild() {
        let mut device = SoftwareDevice::new();
        let a = build_triangle(&mut device, BuildFlags::BOTTOM_LEVEL);
        let addr_a = device.device_address(a).expect("address");
        device.destroy(a);
        let b = build_triangle(&mut device, BuildFlags::BOTTOM_LEVEL);
        assert_ne!(device.device_address(b).expect("address"), addr_a);
        assert!(device.device_address(a).is_err());

        // records pointing at the destroyed structure are rejected
        let stale = InstanceRecord::new(&Mat4::IDENTITY, 0, 0xFF, 0, 0, addr_a);
        let err = device.build_top_level(&[stale], BuildFlags::TOP_LEVEL).unwrap_err();
        assert!(matches!(err, Error::Device { .. }));
    }

    #[test]
    fn test_update_requires_same_count_and_flag() {
        let mut device = SoftwareDevice::new();
        let blas = build_triangle(&mut device, BuildFlags::BOTTOM_LEVEL);
        let vertices = triangle_vertices(Vec3::new(0.0, 0.0, 1.0));
        let two = [0u32, 1, 2, 0, 2, 1];
        let err = device
            .update_bottom_level(
                blas,
                &BlasGeometry {
                    vertices: &vertices,
                    indices: &two,
                    opaque: true,
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));

        let fixed = build_triangle(&mut device, BuildFlags::PREFER_FAST_TRACE);
        let err = device
            .update_bottom_level(
                fixed,
                &BlasGeometry {
                    vertices: &vertices,
                    indices: &[0, 1, 2],
                    opaque: true,
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[test]
    fn test_refit_moves_hit() {
        let mut device = SoftwareDevice::new();
        let blas = build_triangle(&mut device, BuildFlags::BOTTOM_LEVEL);
        let rec = record(&device, blas, Mat4::IDENTITY);
        let tlas = device.build_top_level(&[rec], BuildFlags::TOP_LEVEL).expect("tlas");

        let lifted = triangle_vertices(Vec3::new(0.0, 0.0, 2.0));
        device
            .update_bottom_level(
                blas,
                &BlasGeometry {
                    vertices: &lifted,
                    indices: &[0, 1, 2],
                    opaque: true,
                },
            )
            .expect("refit");
        device.update_top_level(tlas, &[rec]).expect("tlas refit");

        let hit = device
            .trace(tlas, Vec3::new(0.25, 0.25, 10.0), Vec3::NEG_Z)
            .expect("trace")
            .expect("hit");
        assert!((hit.t - 8.0).abs() < 1e-4);
    }

    #[test]
    fn test_dispatch_dimension_mismatch() {
        let mut device = SoftwareDevice::new();
        let blas = build_triangle(&mut device, BuildFlags::BOTTOM_LEVEL);
        let rec = record(&device, blas, Mat4::IDENTITY);
        let tlas = device.build_top_level(&[rec], BuildFlags::TOP_LEVEL).expect("tlas");
        assert!(device.dispatch_rays(tlas, 4, 4).is_err());

        device.allocate_output(4, 4).expect("output");
        let err = device.dispatch_rays(tlas, 8, 8).unwrap_err();
        assert!(matches!(err, Error::Device { .. }));
        // output survives a failed dispatch
        assert_eq!(device.output_size(), Some((4, 4)));
    }

    #[test]
    fn test_empty_scene_is_clear_color() {
        let mut device = SoftwareDevice::new();
        let tlas = device.build_top_level(&[], BuildFlags::TOP_LEVEL).expect("tlas");
        device.allocate_output(3, 2).expect("output");
        device.dispatch_rays(tlas, 3, 2).expect("dispatch");
        let img = device.read_output().expect("read");
        assert!(img.data().iter().all(|&v| v == 1.0));
        assert_eq!(device.submissions(), 2);
    }
}
