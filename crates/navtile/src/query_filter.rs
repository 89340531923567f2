//! Polygon filtering and traversal costs for queries

use navtile_common::vdist;

use super::nav_mesh::{MeshTile, Poly};
use super::{PolyFlags, PolyRef, MAX_AREAS};

/// A polygon together with the tile that owns it
#[derive(Debug, Clone, Copy)]
pub struct PolyContext<'t> {
    pub poly_ref: PolyRef,
    pub tile: &'t MeshTile,
    pub poly: &'t Poly,
}

impl<'t> PolyContext<'t> {
    pub fn new(poly_ref: PolyRef, tile: &'t MeshTile, poly: &'t Poly) -> Self {
        Self {
            poly_ref,
            tile,
            poly,
        }
    }
}

/// Decides which polygons a query may visit and what moving across them costs
pub trait QueryFilter {
    /// Returns true if the polygon can be visited
    fn pass_filter(&self, poly_ref: PolyRef, tile: &MeshTile, poly: &Poly) -> bool;

    /// Cost of moving from `pa` to `pb` across the current polygon
    ///
    /// `pa` lies on the edge shared with `prev` (or is the start position)
    /// and `pb` on the edge shared with `next` (or is the end position).
    fn get_cost(
        &self,
        pa: &[f32; 3],
        pb: &[f32; 3],
        prev: Option<PolyContext<'_>>,
        cur: PolyContext<'_>,
        next: Option<PolyContext<'_>>,
    ) -> f32;
}

/// Flag based filter with per-area cost multipliers
#[derive(Debug, Clone, PartialEq)]
pub struct DefaultQueryFilter {
    /// Cost multiplier per area id
    pub area_cost: [f32; MAX_AREAS],
    /// Polygons must have at least one of these flags
    pub include_flags: PolyFlags,
    /// Polygons must have none of these flags
    pub exclude_flags: PolyFlags,
}

impl Default for DefaultQueryFilter {
    fn default() -> Self {
        Self {
            area_cost: [1.0; MAX_AREAS],
            include_flags: PolyFlags::all(),
            exclude_flags: PolyFlags::empty(),
        }
    }
}

impl DefaultQueryFilter {
    pub fn new(include_flags: PolyFlags, exclude_flags: PolyFlags) -> Self {
        Self {
            include_flags,
            exclude_flags,
            ..Self::default()
        }
    }

    pub fn area_cost(&self, area: u8) -> f32 {
        self.area_cost[area as usize % MAX_AREAS]
    }

    pub fn set_area_cost(&mut self, area: u8, cost: f32) {
        self.area_cost[area as usize % MAX_AREAS] = cost;
    }
}

impl QueryFilter for DefaultQueryFilter {
    fn pass_filter(&self, _poly_ref: PolyRef, _tile: &MeshTile, poly: &Poly) -> bool {
        poly.flags.intersects(self.include_flags) && !poly.flags.intersects(self.exclude_flags)
    }

    fn get_cost(
        &self,
        pa: &[f32; 3],
        pb: &[f32; 3],
        _prev: Option<PolyContext<'_>>,
        cur: PolyContext<'_>,
        _next: Option<PolyContext<'_>>,
    ) -> f32 {
        vdist(pa, pb) * self.area_cost(cur.poly.area)
    }
}

/// Estimates the remaining cost from a node to the goal
pub trait QueryHeuristic {
    fn get_cost(&self, neighbour_pos: &[f32; 3], end_pos: &[f32; 3]) -> f32;
}

/// Straight line distance, scaled slightly below one so that the search
/// stays admissible when area costs are exactly one
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DefaultQueryHeuristic {
    pub scale: f32,
}

impl Default for DefaultQueryHeuristic {
    fn default() -> Self {
        Self { scale: 0.999 }
    }
}

impl QueryHeuristic for DefaultQueryHeuristic {
    fn get_cost(&self, neighbour_pos: &[f32; 3], end_pos: &[f32; 3]) -> f32 {
        vdist(neighbour_pos, end_pos) * self.scale
    }
}
