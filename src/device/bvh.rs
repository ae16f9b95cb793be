//! SAH-based BVH builder and refit.
//!
//! Builds a flat node array over arbitrary primitive bounds. Used for both
//! bottom-level trees (triangles) and the top-level tree (instance world
//! bounds). Children are always stored after their parent, so a reverse
//! sweep over the node array visits children before parents.

use glam::Vec3;
use smallvec::SmallVec;
use trace_kernel::BvhNode;

use crate::util::Aabb;

/// Number of SAH bins for split evaluation.
const NUM_BINS: usize = 12;

/// Cost ratio: traversal vs intersection.
const TRAVERSAL_COST: f32 = 1.0;
const INTERSECT_COST: f32 = 1.0;

/// Maximum primitives per leaf before forcing a split.
pub const MAX_LEAF_SIZE: usize = 4;

/// Built BVH.
#[derive(Debug, Clone, PartialEq)]
pub struct Bvh {
    /// Flat node array (index 0 = root).
    pub nodes: Vec<BvhNode>,
    /// Primitive ids in leaf order (leaves reference ranges of this).
    pub prim_indices: Vec<u32>,
}

/// SAH bin for evaluating split candidates.
#[derive(Clone, Copy)]
struct Bin {
    bounds: Aabb,
    count: usize,
}

fn node(bounds: &Aabb, left_or_first: usize, count: usize) -> BvhNode {
    BvhNode {
        aabb_min: bounds.min.to_array(),
        left_or_first: left_or_first as u32,
        aabb_max: bounds.max.to_array(),
        count: count as u32,
    }
}

/// Build a BVH over primitive bounds using binned SAH.
///
/// Primitive ids in the result index into `bounds`.
#[tracing::instrument(skip_all, fields(prims = bounds.len()))]
pub fn build_bvh(bounds: &[Aabb], max_leaf_size: usize) -> Bvh {
    let n = bounds.len();
    if n == 0 {
        return Bvh {
            nodes: vec![node(&Aabb::EMPTY, 0, 0)],
            prim_indices: vec![],
        };
    }
    let max_leaf_size = max_leaf_size.max(1);

    let centroids: Vec<Vec3> = bounds.iter().map(|b| b.centroid()).collect();

    // Working index array (reordered by partitioning)
    let mut indices: Vec<u32> = (0..n as u32).collect();
    let mut nodes: Vec<BvhNode> = Vec::with_capacity(2 * n);
    nodes.push(node(&Aabb::EMPTY, 0, 0));

    struct Task {
        node_idx: usize,
        start: usize,
        end: usize, // exclusive
    }

    let mut stack = vec![Task {
        node_idx: 0,
        start: 0,
        end: n,
    }];

    while let Some(task) = stack.pop() {
        let (start, end) = (task.start, task.end);
        let count = end - start;

        let mut node_aabb = Aabb::EMPTY;
        let mut centroid_bounds = Aabb::EMPTY;
        for &idx in &indices[start..end] {
            node_aabb.grow(&bounds[idx as usize]);
            centroid_bounds.grow_point(centroids[idx as usize]);
        }

        if count <= max_leaf_size {
            nodes[task.node_idx] = node(&node_aabb, start, count);
            continue;
        }

        let (best_axis, best_split_pos, best_cost) =
            find_best_split(&indices[start..end], bounds, &centroids, &centroid_bounds);

        // Leaf cost normalized like the split cost (by parent area)
        let leaf_cost = count as f32 * INTERSECT_COST * node_aabb.area();

        // Degenerate centroids or an expensive split: keep as leaf, unless
        // the range is too large to leave unsplit.
        let force_split = count > max_leaf_size * 4;
        if !force_split && (best_axis == usize::MAX || best_cost >= leaf_cost) {
            nodes[task.node_idx] = node(&node_aabb, start, count);
            continue;
        }

        let mid = if best_axis == usize::MAX {
            (start + end) / 2
        } else {
            let split = partition(&mut indices[start..end], |&idx| {
                centroids[idx as usize][best_axis] < best_split_pos
            }) + start;
            // Fallback: degenerate partition splits in the middle
            if split == start || split == end {
                (start + end) / 2
            } else {
                split
            }
        };

        let left_idx = nodes.len();
        let right_idx = left_idx + 1;
        nodes.push(node(&Aabb::EMPTY, 0, 0));
        nodes.push(node(&Aabb::EMPTY, 0, 0));
        nodes[task.node_idx] = node(&node_aabb, left_idx, 0);

        // Right first so left is processed first (depth-first)
        stack.push(Task {
            node_idx: right_idx,
            start: mid,
            end,
        });
        stack.push(Task {
            node_idx: left_idx,
            start,
            end: mid,
        });
    }

    Bvh {
        nodes,
        prim_indices: indices,
    }
}

/// SAH binned split search across all 3 axes.
/// Returns (best_axis, split_position, cost). axis=usize::MAX if no valid split.
fn find_best_split(indices: &[u32], bounds: &[Aabb], centroids: &[Vec3], centroid_bounds: &Aabb) -> (usize, f32, f32) {
    let mut best_axis = usize::MAX;
    let mut best_pos = 0.0f32;
    let mut best_cost = f32::INFINITY;

    for axis in 0..3 {
        let extent = centroid_bounds.max[axis] - centroid_bounds.min[axis];
        if extent < 1e-8 {
            continue; // degenerate axis
        }

        let mut bins = [Bin {
            bounds: Aabb::EMPTY,
            count: 0,
        }; NUM_BINS];
        let inv_extent = NUM_BINS as f32 / extent;

        for &idx in indices {
            let c = centroids[idx as usize][axis];
            let bin_id = (((c - centroid_bounds.min[axis]) * inv_extent) as usize).min(NUM_BINS - 1);
            bins[bin_id].bounds.grow(&bounds[idx as usize]);
            bins[bin_id].count += 1;
        }

        // Sweep from left: prefix areas and counts
        let mut left_area = [0.0f32; NUM_BINS - 1];
        let mut left_count = [0usize; NUM_BINS - 1];
        let mut sweep = Aabb::EMPTY;
        let mut sweep_count = 0;
        for i in 0..NUM_BINS - 1 {
            sweep.grow(&bins[i].bounds);
            sweep_count += bins[i].count;
            left_area[i] = sweep.area();
            left_count[i] = sweep_count;
        }

        // Sweep from right and evaluate SAH cost
        sweep = Aabb::EMPTY;
        sweep_count = 0;
        for i in (1..NUM_BINS).rev() {
            sweep.grow(&bins[i].bounds);
            sweep_count += bins[i].count;
            if left_count[i - 1] == 0 || sweep_count == 0 {
                continue;
            }
            let cost = TRAVERSAL_COST
                + INTERSECT_COST * (left_count[i - 1] as f32 * left_area[i - 1] + sweep_count as f32 * sweep.area());

            if cost < best_cost {
                best_cost = cost;
                best_axis = axis;
                best_pos = centroid_bounds.min[axis] + (i as f32 / NUM_BINS as f32) * extent;
            }
        }
    }

    (best_axis, best_pos, best_cost)
}

/// Partition slice in-place. Returns count of elements where predicate is true.
fn partition<T, F>(slice: &mut [T], pred: F) -> usize
where
    F: Fn(&T) -> bool,
{
    let mut left = 0;
    let mut right = slice.len();
    while left < right {
        if pred(&slice[left]) {
            left += 1;
        } else {
            right -= 1;
            slice.swap(left, right);
        }
    }
    left
}

impl Bvh {
    pub fn is_empty(&self) -> bool {
        self.prim_indices.is_empty()
    }

    /// Bounds of the whole tree.
    pub fn bounds(&self) -> Aabb {
        if self.is_empty() {
            return Aabb::EMPTY;
        }
        let root = &self.nodes[0];
        Aabb::new(root.min(), root.max())
    }

    /// Recompute node bounds bottom-up for moved primitives. Tree shape and
    /// primitive order are unchanged.
    pub fn refit(&mut self, bounds: &[Aabb]) {
        if self.is_empty() {
            return;
        }
        for i in (0..self.nodes.len()).rev() {
            let n = self.nodes[i];
            let mut b = Aabb::EMPTY;
            if n.is_leaf() {
                let first = n.left_or_first as usize;
                for &prim in &self.prim_indices[first..first + n.count as usize] {
                    b.grow(&bounds[prim as usize]);
                }
            } else {
                let left = n.left_or_first as usize;
                b.grow(&Aabb::new(self.nodes[left].min(), self.nodes[left].max()));
                b.grow(&Aabb::new(self.nodes[left + 1].min(), self.nodes[left + 1].max()));
            }
            self.nodes[i].aabb_min = b.min.to_array();
            self.nodes[i].aabb_max = b.max.to_array();
        }
    }

    /// Walk the tree along a ray. `visit` gets each primitive whose leaf the
    /// ray overlaps along with the current closest distance, and returns a
    /// new closest distance on a hit.
    pub fn traverse<F>(&self, origin: Vec3, dir: Vec3, t_min: f32, mut t_max: f32, mut visit: F)
    where
        F: FnMut(u32, f32) -> Option<f32>,
    {
        if self.is_empty() {
            return;
        }
        let inv_dir = dir.recip();
        let mut stack: SmallVec<[u32; 64]> = SmallVec::new();
        stack.push(0);

        while let Some(idx) = stack.pop() {
            let n = &self.nodes[idx as usize];
            let bounds = Aabb::new(n.min(), n.max());
            if bounds.intersect_ray(origin, inv_dir, t_min, t_max).is_none() {
                continue;
            }
            if n.is_leaf() {
                let first = n.left_or_first as usize;
                for &prim in &self.prim_indices[first..first + n.count as usize] {
                    if let Some(t) = visit(prim, t_max) {
                        t_max = t_max.min(t);
                    }
                }
            } else {
                stack.push(n.left_or_first + 1);
                stack.push(n.left_or_first);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_box(cx: f32, cy: f32, cz: f32) -> Aabb {
        Aabb::new(Vec3::new(cx - 0.5, cy - 0.5, cz), Vec3::new(cx + 0.5, cy + 0.5, cz))
    }

    fn leaf_prims(bvh: &Bvh) -> Vec<u32> {
        let mut out: Vec<u32> = bvh
            .nodes
            .iter()
            .filter(|n| n.is_leaf())
            .flat_map(|n| {
                let first = n.left_or_first as usize;
                bvh.prim_indices[first..first + n.count as usize].to_vec()
            })
            .collect();
        out.sort();
        out
    }

    #[test]
    fn test_empty_bvh() {
        let bvh = build_bvh(&[], MAX_LEAF_SIZE);
        assert_eq!(bvh.nodes.len(), 1);
        assert!(bvh.is_empty());
        assert!(bvh.bounds().is_empty());
    }

    #[test]
    fn test_single_prim() {
        let bvh = build_bvh(&[make_box(0.0, 0.0, 0.0)], MAX_LEAF_SIZE);
        assert_eq!(bvh.nodes.len(), 1);
        assert_eq!(bvh.nodes[0].count, 1);
        assert_eq!(bvh.prim_indices.len(), 1);
    }

    #[test]
    fn test_many_prims_builds_tree() {
        let boxes: Vec<Aabb> = (0..100).map(|i| make_box(i as f32 * 2.0, 0.0, 0.0)).collect();
        let bvh = build_bvh(&boxes, MAX_LEAF_SIZE);

        assert!(bvh.nodes.len() > 1, "BVH should have internal nodes");
        assert_eq!(leaf_prims(&bvh), (0..100).collect::<Vec<_>>());

        let root = bvh.bounds();
        assert!(root.min.x < 0.0);
        assert!(root.max.x > 198.0);

        // children after parents
        for (i, n) in bvh.nodes.iter().enumerate() {
            if !n.is_leaf() {
                assert!(n.left_or_first as usize > i);
            }
        }
    }

    #[test]
    fn test_coincident_prims_still_split() {
        let boxes = vec![make_box(0.0, 0.0, 0.0); 40];
        let bvh = build_bvh(&boxes, 1);
        assert_eq!(leaf_prims(&bvh), (0..40).collect::<Vec<_>>());
        assert!(bvh.nodes.iter().all(|n| !n.is_leaf() || n.count <= 4));
    }

    #[test]
    fn test_refit_matches_moved_bounds() {
        let mut boxes: Vec<Aabb> = (0..32).map(|i| make_box(i as f32, 0.0, 0.0)).collect();
        let mut bvh = build_bvh(&boxes, 2);
        let shape: Vec<(u32, u32)> = bvh.nodes.iter().map(|n| (n.left_or_first, n.count)).collect();

        for b in &mut boxes {
            b.min.y += 10.0;
            b.max.y += 10.0;
        }
        bvh.refit(&boxes);
        let after: Vec<(u32, u32)> = bvh.nodes.iter().map(|n| (n.left_or_first, n.count)).collect();
        assert_eq!(shape, after);
        assert_eq!(bvh.bounds().min.y, 9.5);
        assert_eq!(bvh.bounds().max.y, 10.5);
    }

    #[test]
    fn test_traverse_visits_overlapping_leaves() {
        let boxes: Vec<Aabb> = (0..16).map(|i| make_box(i as f32 * 3.0, 0.0, 0.0)).collect();
        let bvh = build_bvh(&boxes, 1);
        let mut seen = Vec::new();
        bvh.traverse(Vec3::new(9.0, 0.0, -5.0), Vec3::Z, 0.0, 100.0, |prim, _| {
            seen.push(prim);
            None
        });
        assert_eq!(seen, vec![3]);
    }
}
