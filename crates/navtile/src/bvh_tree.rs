//! Bounding volume tree construction for tile polygons
//!
//! The tree is stored flattened in depth-first order. A leaf stores the index
//! of its polygon; an internal node stores the negated number of nodes in its
//! subtree (including itself), so a traversal that rejects the node can jump
//! straight past the subtree. Bounds are quantized to `u16` in tile local
//! space.

use super::nav_mesh::BVNode;

/// Quantized polygon bounds fed to the tree builder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BVItem {
    pub bmin: [i32; 3],
    pub bmax: [i32; 3],
    /// Polygon index
    pub i: i32,
}

/// Builds a flattened tree over the items
///
/// Items are reordered in place. Returns one node per item plus one per
/// split, at most `2 * items.len() - 1` nodes.
pub fn build_bv_tree(items: &mut [BVItem]) -> Vec<BVNode> {
    let mut nodes = Vec::with_capacity(items.len() * 2);
    if !items.is_empty() {
        subdivide(items, &mut nodes);
    }
    nodes
}

fn subdivide(items: &mut [BVItem], nodes: &mut Vec<BVNode>) {
    let icur = nodes.len();

    if items.len() == 1 {
        let item = &items[0];
        nodes.push(BVNode {
            bmin: quantize(&item.bmin),
            bmax: quantize(&item.bmax),
            i: item.i,
        });
        return;
    }

    let (bmin, bmax) = calc_extents(items);
    nodes.push(BVNode {
        bmin: quantize(&bmin),
        bmax: quantize(&bmax),
        i: 0,
    });

    let axis = longest_axis(
        bmax[0] - bmin[0],
        bmax[1] - bmin[1],
        bmax[2] - bmin[2],
    );
    items.sort_by_key(|it| it.bmin[axis]);

    let split = items.len() / 2;
    let (left, right) = items.split_at_mut(split);
    subdivide(left, nodes);
    subdivide(right, nodes);

    // Negative index means escape.
    let escape = (nodes.len() - icur) as i32;
    nodes[icur].i = -escape;
}

fn calc_extents(items: &[BVItem]) -> ([i32; 3], [i32; 3]) {
    let mut bmin = items[0].bmin;
    let mut bmax = items[0].bmax;
    for it in &items[1..] {
        for k in 0..3 {
            bmin[k] = bmin[k].min(it.bmin[k]);
            bmax[k] = bmax[k].max(it.bmax[k]);
        }
    }
    (bmin, bmax)
}

fn longest_axis(x: i32, y: i32, z: i32) -> usize {
    let mut axis = 0;
    let mut max_val = x;
    if y > max_val {
        axis = 1;
        max_val = y;
    }
    if z > max_val {
        axis = 2;
    }
    axis
}

fn quantize(v: &[i32; 3]) -> [u16; 3] {
    [
        v[0].clamp(0, 0xffff) as u16,
        v[1].clamp(0, 0xffff) as u16,
        v[2].clamp(0, 0xffff) as u16,
    ]
}
