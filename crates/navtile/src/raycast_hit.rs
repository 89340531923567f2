//! Raycast results

use super::PolyRef;

bitflags::bitflags! {
    /// Raycast behaviour flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RaycastOptions: u32 {
        /// Accumulate filter costs along the ray into `path_cost`
        const USE_COSTS = 0x01;
    }
}

/// Outcome of a raycast along the navigation mesh surface
#[derive(Debug, Clone, PartialEq)]
pub struct RaycastHit {
    /// Fraction of the ray travelled before hitting a wall
    ///
    /// `f32::MAX` when the end point was reached without hitting a wall.
    pub t: f32,

    /// Normal of the wall that was hit, zero when nothing was hit
    pub hit_normal: [f32; 3],

    /// Edge of the last visited polygon that was hit, -1 for none
    pub hit_edge_index: i32,

    /// Polygons visited by the ray, in order
    pub path: Vec<PolyRef>,

    /// Accumulated cost, only computed with [`RaycastOptions::USE_COSTS`]
    pub path_cost: f32,
}

impl Default for RaycastHit {
    fn default() -> Self {
        Self {
            t: 0.0,
            hit_normal: [0.0; 3],
            hit_edge_index: -1,
            path: Vec::new(),
            path_cost: 0.0,
        }
    }
}

impl RaycastHit {
    /// Checks if the ray stopped at a wall
    pub fn hit_wall(&self) -> bool {
        self.t < f32::MAX
    }

    pub fn path_count(&self) -> usize {
        self.path.len()
    }

    /// Position where the ray stopped
    ///
    /// Returns `end` when no wall was hit.
    pub fn hit_position(&self, start: &[f32; 3], end: &[f32; 3]) -> [f32; 3] {
        if self.hit_wall() {
            navtile_common::vlerp(start, end, self.t)
        } else {
            *end
        }
    }

    /// Last polygon visited by the ray
    pub fn last_poly(&self) -> PolyRef {
        self.path.last().copied().unwrap_or(PolyRef::NULL)
    }
}
