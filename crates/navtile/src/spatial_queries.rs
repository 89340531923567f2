//! Area queries around a point
//!
//! Flood fills bounded by a circle or a convex shape, local neighbourhoods,
//! wall segments and wall distance, constrained surface movement and random
//! point sampling. The floods share the node pool and open list with the
//! path searches, so each call invalidates the state of the previous search.

use navtile_common::{
    dist_pt_seg_sqr_2d, intersect_segment_poly_2d, overlap_poly_poly_2d, point_in_polygon,
    random_point_in_convex_poly, sqr, tri_area_2d, vdist, vdist_sqr_2d, vert_at, visfinite, vlerp,
    vnormalize, vsub,
};

use super::nav_mesh::{MeshTile, NavMesh, Poly};
use super::nav_mesh_query::{portal_between, NavMeshQuery};
use super::node_pool::{NodeFlags, NodeIndex};
use super::query_filter::{PolyContext, QueryFilter};
use super::status::{QueryResult, Status};
use super::{PolyRef, EXT_LINK};

/// Pending node limit of the local searches
const MAX_LOCAL_STACK: usize = 48;

/// Pending node limit of [`NavMeshQuery::move_along_surface`]
const MAX_SURFACE_MOVE_STACK: usize = 16;

/// Maximum number of neighbours considered per polygon edge
const MAX_EDGE_NEIGHBOURS: usize = 8;

/// Sides of the polygon standing in for the circle when clipping samples
const CIRCLE_SEGMENTS: usize = 12;

/// Polygons reached by a flood fill, ordered by cost
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PolySearchResult {
    pub refs: Vec<PolyRef>,
    /// Polygon each result was reached from, null for the start polygon
    pub parents: Vec<PolyRef>,
    /// Cost from the search center to each result
    pub costs: Vec<f32>,
    pub status: Status,
}

impl PolySearchResult {
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

/// Non-overlapping polygons around a point
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LocalNeighbourhood {
    pub refs: Vec<PolyRef>,
    pub parents: Vec<PolyRef>,
    pub status: Status,
}

/// Edge segment of a polygon
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WallSegment {
    pub start: [f32; 3],
    pub end: [f32; 3],
    /// Polygon on the other side, null for walls
    pub neighbour: PolyRef,
}

impl WallSegment {
    pub fn is_wall(&self) -> bool {
        self.neighbour.is_null()
    }
}

/// Result of [`NavMeshQuery::get_poly_wall_segments`]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WallSegments {
    pub segments: Vec<WallSegment>,
    pub status: Status,
}

impl WallSegments {
    /// Segments without a neighbour
    pub fn walls(&self) -> impl Iterator<Item = &WallSegment> {
        self.segments.iter().filter(|s| s.is_wall())
    }

    /// Segments leading to a neighbour
    pub fn portals(&self) -> impl Iterator<Item = &WallSegment> {
        self.segments.iter().filter(|s| !s.is_wall())
    }
}

/// Nearest wall found by [`NavMeshQuery::find_distance_to_wall`]
///
/// When no wall lies within the search radius, `distance` is the radius,
/// `hit_pos` the center and `hit_normal` zero.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DistanceToWall {
    pub distance: f32,
    pub hit_pos: [f32; 3],
    pub hit_normal: [f32; 3],
    pub status: Status,
}

/// Result of [`NavMeshQuery::move_along_surface`]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SurfaceMove {
    /// Reachable position closest to the requested end
    pub result_pos: [f32; 3],
    /// Polygons from the start polygon to the one holding `result_pos`
    pub visited: Vec<PolyRef>,
}

/// Randomly chosen location on the mesh
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RandomPoint {
    pub poly_ref: PolyRef,
    pub pos: [f32; 3],
    /// Success, with `OUT_OF_NODES` when the circle flood was cut short
    pub status: Status,
}

impl NavMeshQuery {
    /// Finds the polygons touched by a circle, flooding out from the start
    /// polygon
    ///
    /// A neighbour is visited when the portal leading to it lies within the
    /// circle. At most `max_result` polygons are returned; more set
    /// `BUFFER_TOO_SMALL`.
    #[allow(clippy::too_many_arguments)]
    pub fn find_polys_around_circle(
        &mut self,
        nav: &NavMesh,
        start_ref: PolyRef,
        center: &[f32; 3],
        radius: f32,
        filter: &dyn QueryFilter,
        max_result: usize,
    ) -> QueryResult<PolySearchResult> {
        if !nav.is_valid_poly_ref(start_ref) || !visfinite(center) || !radius.is_finite() || radius < 0.0 {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }

        let radius_sqr = sqr(radius);
        let center = *center;
        self.flood_polygons(nav, start_ref, &center, filter, max_result, |va, vb| {
            dist_pt_seg_sqr_2d(&center, va, vb).0 <= radius_sqr
        })
    }

    /// Finds the polygons touched by a convex shape, flooding out from the
    /// start polygon
    ///
    /// The shape is given by its vertices with the same winding as mesh
    /// polygons. Costs are measured from the shape centroid.
    pub fn find_polys_around_shape(
        &mut self,
        nav: &NavMesh,
        start_ref: PolyRef,
        verts: &[[f32; 3]],
        filter: &dyn QueryFilter,
        max_result: usize,
    ) -> QueryResult<PolySearchResult> {
        if !nav.is_valid_poly_ref(start_ref) || verts.len() < 3 || !verts.iter().all(|v| visfinite(v)) {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }

        let mut center = [0.0f32; 3];
        for v in verts {
            for k in 0..3 {
                center[k] += v[k];
            }
        }
        let scale = 1.0 / verts.len() as f32;
        for c in &mut center {
            *c *= scale;
        }

        let shape: Vec<f32> = verts.iter().flatten().copied().collect();
        let nverts = verts.len();
        self.flood_polygons(nav, start_ref, &center, filter, max_result, |va, vb| {
            matches!(
                intersect_segment_poly_2d(va, vb, &shape, nverts),
                Some(hit) if hit.tmin <= 1.0 && hit.tmax >= 0.0
            )
        })
    }

    /// Dijkstra flood over the node pool, visiting a neighbour when
    /// `accept_portal` approves the portal leading to it
    fn flood_polygons(
        &mut self,
        nav: &NavMesh,
        start_ref: PolyRef,
        start_pos: &[f32; 3],
        filter: &dyn QueryFilter,
        max_result: usize,
        accept_portal: impl Fn(&[f32; 3], &[f32; 3]) -> bool,
    ) -> QueryResult<PolySearchResult> {
        self.node_pool.clear();
        self.open_list.clear();

        let start_idx = self.node_pool.get_node(start_ref, 0).ok_or(Status::FAILURE | Status::OUT_OF_NODES)?;
        {
            let node = self.node_pool.node_mut(start_idx);
            node.pos = *start_pos;
            node.pidx = 0;
            node.cost = 0.0;
            node.total = 0.0;
            node.id = start_ref;
            node.flags = NodeFlags::OPEN;
        }
        self.open_list.push(start_idx, &self.node_pool);

        let mut result = PolySearchResult {
            status: Status::SUCCESS,
            ..PolySearchResult::default()
        };

        while let Some(best_idx) = self.open_list.pop(&self.node_pool) {
            let (best_ref, best_pos, best_total, best_pidx) = {
                let best = self.node_pool.node_mut(best_idx);
                best.flags.remove(NodeFlags::OPEN);
                best.flags.insert(NodeFlags::CLOSED);
                (best.id, best.pos, best.total, best.pidx)
            };

            let (best_tile, best_poly) = nav.get_tile_and_poly_by_ref_unsafe(best_ref);
            let parent_ref = self
                .node_pool
                .get_node_at_idx(best_pidx)
                .map_or(PolyRef::NULL, |p| self.node_pool.node(p).id);

            if result.refs.len() < max_result {
                result.refs.push(best_ref);
                result.parents.push(parent_ref);
                result.costs.push(best_total);
            } else {
                result.status |= Status::BUFFER_TOO_SMALL;
            }

            let parent = (!parent_ref.is_null()).then(|| {
                let (tile, poly) = nav.get_tile_and_poly_by_ref_unsafe(parent_ref);
                PolyContext::new(parent_ref, tile, poly)
            });
            let cur = PolyContext::new(best_ref, best_tile, best_poly);
            let best_node_idx = self.node_pool.get_node_idx(best_idx);

            for link in best_tile.links_of(best_ref.poly() as usize) {
                let neighbour_ref = link.reference;
                if neighbour_ref.is_null() || neighbour_ref == parent_ref {
                    continue;
                }

                let (neighbour_tile, neighbour_poly) = nav.get_tile_and_poly_by_ref_unsafe(neighbour_ref);
                if !filter.pass_filter(neighbour_ref, neighbour_tile, neighbour_poly) {
                    continue;
                }

                let neighbour = PolyContext::new(neighbour_ref, neighbour_tile, neighbour_poly);
                let Ok((va, vb)) = portal_between(cur, neighbour) else {
                    continue;
                };
                if !accept_portal(&va, &vb) {
                    continue;
                }

                let Some(neighbour_idx) = self.node_pool.get_node(neighbour_ref, 0) else {
                    result.status |= Status::OUT_OF_NODES;
                    continue;
                };
                if self.node_pool.node(neighbour_idx).flags.contains(NodeFlags::CLOSED) {
                    continue;
                }

                if self.node_pool.node(neighbour_idx).flags.is_empty() {
                    self.node_pool.node_mut(neighbour_idx).pos = vlerp(&va, &vb, 0.5);
                }
                let neighbour_pos = self.node_pool.node(neighbour_idx).pos;

                let total = best_total + filter.get_cost(&best_pos, &neighbour_pos, parent, cur, Some(neighbour));
                if !total.is_finite() {
                    continue;
                }

                let node = self.node_pool.node_mut(neighbour_idx);
                if node.flags.contains(NodeFlags::OPEN) && total >= node.total {
                    continue;
                }

                node.id = neighbour_ref;
                node.pidx = best_node_idx;
                node.total = total;
                if node.flags.contains(NodeFlags::OPEN) {
                    self.open_list.modify(neighbour_idx, &self.node_pool);
                } else {
                    node.flags = NodeFlags::OPEN;
                    self.open_list.push(neighbour_idx, &self.node_pool);
                }
            }
        }

        if result.status.has_detail(Status::OUT_OF_NODES) {
            log::warn!(
                "flood from {} ran out of nodes ({} available)",
                start_ref,
                self.node_pool.max_nodes()
            );
        }

        Ok(result)
    }

    /// Finds non-overlapping polygons around a point
    ///
    /// Breadth first search through the tiny node pool. Polygons that
    /// overlap an already found polygon in 2D are skipped, which keeps the
    /// result usable as a local walkable surface even on multi-level meshes.
    pub fn find_local_neighbourhood(
        &mut self,
        nav: &NavMesh,
        start_ref: PolyRef,
        center: &[f32; 3],
        radius: f32,
        filter: &dyn QueryFilter,
        max_result: usize,
    ) -> QueryResult<LocalNeighbourhood> {
        if !nav.is_valid_poly_ref(start_ref)
            || !visfinite(center)
            || !radius.is_finite()
            || radius < 0.0
            || max_result == 0
        {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }

        self.tiny_node_pool.clear();
        let start_idx = self
            .tiny_node_pool
            .get_node(start_ref, 0)
            .ok_or(Status::FAILURE | Status::OUT_OF_NODES)?;
        {
            let node = self.tiny_node_pool.node_mut(start_idx);
            node.pidx = 0;
            node.id = start_ref;
            node.flags = NodeFlags::CLOSED;
        }

        let radius_sqr = sqr(radius);
        let mut stack = std::collections::VecDeque::with_capacity(MAX_LOCAL_STACK);
        stack.push_back(start_idx);

        let mut result = LocalNeighbourhood {
            refs: vec![start_ref],
            parents: vec![PolyRef::NULL],
            status: Status::SUCCESS,
        };

        while let Some(cur_idx) = stack.pop_front() {
            let cur_ref = self.tiny_node_pool.node(cur_idx).id;
            let (cur_tile, cur_poly) = nav.get_tile_and_poly_by_ref_unsafe(cur_ref);
            let cur = PolyContext::new(cur_ref, cur_tile, cur_poly);
            let cur_node_idx = self.tiny_node_pool.get_node_idx(cur_idx);

            for link in cur_tile.links_of(cur_ref.poly() as usize) {
                let neighbour_ref = link.reference;
                if neighbour_ref.is_null() {
                    continue;
                }

                let Some(neighbour_idx) = self.tiny_node_pool.get_node(neighbour_ref, 0) else {
                    continue;
                };
                if self.tiny_node_pool.node(neighbour_idx).flags.contains(NodeFlags::CLOSED) {
                    continue;
                }

                let (neighbour_tile, neighbour_poly) = nav.get_tile_and_poly_by_ref_unsafe(neighbour_ref);
                if neighbour_poly.is_off_mesh_connection() {
                    continue;
                }
                if !filter.pass_filter(neighbour_ref, neighbour_tile, neighbour_poly) {
                    continue;
                }

                let neighbour = PolyContext::new(neighbour_ref, neighbour_tile, neighbour_poly);
                let Ok((va, vb)) = portal_between(cur, neighbour) else {
                    continue;
                };
                if dist_pt_seg_sqr_2d(center, &va, &vb).0 > radius_sqr {
                    continue;
                }

                // Visited even when rejected below, so it is not tested again.
                {
                    let node = self.tiny_node_pool.node_mut(neighbour_idx);
                    node.flags.insert(NodeFlags::CLOSED);
                    node.pidx = cur_node_idx;
                }

                let (pa, npa) = neighbour_tile.poly_vertices(neighbour_poly);
                let overlaps = result.refs.iter().any(|&past_ref| {
                    // Connected polygons do not overlap.
                    if cur_tile
                        .links_of(cur_ref.poly() as usize)
                        .any(|l| l.reference == past_ref)
                    {
                        return false;
                    }
                    let (past_tile, past_poly) = nav.get_tile_and_poly_by_ref_unsafe(past_ref);
                    let (pb, npb) = past_tile.poly_vertices(past_poly);
                    overlap_poly_poly_2d(&pa, npa, &pb, npb)
                });
                if overlaps {
                    continue;
                }

                if result.refs.len() < max_result {
                    result.refs.push(neighbour_ref);
                    result.parents.push(cur_ref);
                } else {
                    result.status |= Status::BUFFER_TOO_SMALL;
                }

                if stack.len() < MAX_LOCAL_STACK {
                    stack.push_back(neighbour_idx);
                }
            }
        }

        Ok(result)
    }

    /// Returns the wall segments of a polygon, and its portals when
    /// `store_portals` is set
    ///
    /// Tile border edges are split at the sub-ranges covered by neighbour
    /// links, so one edge may yield several portal and wall segments.
    pub fn get_poly_wall_segments(
        &self,
        nav: &NavMesh,
        poly_ref: PolyRef,
        store_portals: bool,
        filter: &dyn QueryFilter,
    ) -> QueryResult<WallSegments> {
        let (tile, poly) = nav
            .get_tile_and_poly_by_ref(poly_ref)
            .map_err(|_| Status::FAILURE | Status::INVALID_PARAM)?;

        let mut out = WallSegments {
            segments: Vec::new(),
            status: Status::SUCCESS,
        };
        let base = tile.poly_ref_base();
        let nv = poly.nverts();

        for j in 0..nv {
            let i = (j + 1) % nv;
            let vj = tile.poly_vert(poly, j);
            let vi = tile.poly_vert(poly, i);

            if poly.neis[j] & EXT_LINK == 0 {
                let mut neighbour = PolyRef::NULL;
                if poly.neis[j] != 0 {
                    let idx = (poly.neis[j] - 1) as usize;
                    let r = base.with_poly(idx as u32);
                    if filter.pass_filter(r, tile, &tile.data.polys[idx]) {
                        neighbour = r;
                    }
                }
                if !neighbour.is_null() && !store_portals {
                    continue;
                }
                out.segments.push(WallSegment {
                    start: vj,
                    end: vi,
                    neighbour,
                });
                continue;
            }

            // Tile border, split by the ranges the links cover.
            let mut intervals: Vec<(i16, i16, PolyRef)> = tile
                .links_of(poly_ref.poly() as usize)
                .filter(|l| l.edge as usize == j && !l.reference.is_null())
                .filter(|l| {
                    let (nt, np) = nav.get_tile_and_poly_by_ref_unsafe(l.reference);
                    filter.pass_filter(l.reference, nt, np)
                })
                .map(|l| (l.bmin as i16, l.bmax as i16, l.reference))
                .collect();
            intervals.push((-1, 0, PolyRef::NULL));
            intervals.push((255, 256, PolyRef::NULL));
            intervals.sort_by_key(|&(tmin, _, _)| tmin);

            for k in 1..intervals.len() {
                let (tmin, tmax, neighbour) = intervals[k];
                if store_portals && !neighbour.is_null() {
                    out.segments.push(WallSegment {
                        start: vlerp(&vj, &vi, tmin as f32 / 255.0),
                        end: vlerp(&vj, &vi, tmax as f32 / 255.0),
                        neighbour,
                    });
                }

                let gap_min = intervals[k - 1].1;
                let gap_max = tmin;
                if gap_min != gap_max {
                    out.segments.push(WallSegment {
                        start: vlerp(&vj, &vi, gap_min as f32 / 255.0),
                        end: vlerp(&vj, &vi, gap_max as f32 / 255.0),
                        neighbour: PolyRef::NULL,
                    });
                }
            }
        }

        Ok(out)
    }

    /// Distance from a point to the nearest wall within `max_radius`
    ///
    /// Walls are polygon edges without a neighbour or whose neighbour the
    /// filter rejects. The search floods outwards and shrinks its radius as
    /// walls are found.
    pub fn find_distance_to_wall(
        &mut self,
        nav: &NavMesh,
        start_ref: PolyRef,
        center: &[f32; 3],
        max_radius: f32,
        filter: &dyn QueryFilter,
    ) -> QueryResult<DistanceToWall> {
        if !nav.is_valid_poly_ref(start_ref)
            || !visfinite(center)
            || !max_radius.is_finite()
            || max_radius < 0.0
        {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }

        self.node_pool.clear();
        self.open_list.clear();

        let start_idx = self.node_pool.get_node(start_ref, 0).ok_or(Status::FAILURE | Status::OUT_OF_NODES)?;
        {
            let node = self.node_pool.node_mut(start_idx);
            node.pos = *center;
            node.pidx = 0;
            node.cost = 0.0;
            node.total = 0.0;
            node.id = start_ref;
            node.flags = NodeFlags::OPEN;
        }
        self.open_list.push(start_idx, &self.node_pool);

        let mut radius_sqr = sqr(max_radius);
        let mut status = Status::SUCCESS;
        let mut hit_pos = *center;
        let mut hit_edge: Option<([f32; 3], [f32; 3])> = None;

        while let Some(best_idx) = self.open_list.pop(&self.node_pool) {
            let (best_ref, best_pos, best_total, best_pidx) = {
                let best = self.node_pool.node_mut(best_idx);
                best.flags.remove(NodeFlags::OPEN);
                best.flags.insert(NodeFlags::CLOSED);
                (best.id, best.pos, best.total, best.pidx)
            };

            let (best_tile, best_poly) = nav.get_tile_and_poly_by_ref_unsafe(best_ref);
            let parent_ref = self
                .node_pool
                .get_node_at_idx(best_pidx)
                .map_or(PolyRef::NULL, |p| self.node_pool.node(p).id);

            // Hit test the solid edges.
            let nv = best_poly.nverts();
            for j in 0..nv {
                if !is_solid_edge(nav, best_tile, best_ref, best_poly, j, filter) {
                    continue;
                }

                let vj = best_tile.poly_vert(best_poly, j);
                let vi = best_tile.poly_vert(best_poly, (j + 1) % nv);
                let (dist_sqr, tseg) = dist_pt_seg_sqr_2d(center, &vj, &vi);
                if dist_sqr > radius_sqr {
                    continue;
                }

                radius_sqr = dist_sqr;
                hit_pos = vlerp(&vj, &vi, tseg);
                hit_edge = Some((vj, vi));
            }

            let cur = PolyContext::new(best_ref, best_tile, best_poly);
            let best_node_idx = self.node_pool.get_node_idx(best_idx);

            for link in best_tile.links_of(best_ref.poly() as usize) {
                let neighbour_ref = link.reference;
                if neighbour_ref.is_null() || neighbour_ref == parent_ref {
                    continue;
                }

                let (neighbour_tile, neighbour_poly) = nav.get_tile_and_poly_by_ref_unsafe(neighbour_ref);
                if neighbour_poly.is_off_mesh_connection() {
                    continue;
                }

                let edge = link.edge as usize;
                let va = best_tile.poly_vert(best_poly, edge);
                let vb = best_tile.poly_vert(best_poly, (edge + 1) % nv);
                if dist_pt_seg_sqr_2d(center, &va, &vb).0 > radius_sqr {
                    continue;
                }

                if !filter.pass_filter(neighbour_ref, neighbour_tile, neighbour_poly) {
                    continue;
                }

                let Some(neighbour_idx) = self.node_pool.get_node(neighbour_ref, 0) else {
                    status |= Status::OUT_OF_NODES;
                    continue;
                };
                if self.node_pool.node(neighbour_idx).flags.contains(NodeFlags::CLOSED) {
                    continue;
                }

                if self.node_pool.node(neighbour_idx).flags.is_empty() {
                    let neighbour = PolyContext::new(neighbour_ref, neighbour_tile, neighbour_poly);
                    if let Ok((l, r)) = portal_between(cur, neighbour) {
                        self.node_pool.node_mut(neighbour_idx).pos = vlerp(&l, &r, 0.5);
                    }
                }

                let node = self.node_pool.node_mut(neighbour_idx);
                let total = best_total + vdist(&best_pos, &node.pos);
                if node.flags.contains(NodeFlags::OPEN) && total >= node.total {
                    continue;
                }

                node.id = neighbour_ref;
                node.pidx = best_node_idx;
                node.total = total;
                if node.flags.contains(NodeFlags::OPEN) {
                    self.open_list.modify(neighbour_idx, &self.node_pool);
                } else {
                    node.flags = NodeFlags::OPEN;
                    self.open_list.push(neighbour_idx, &self.node_pool);
                }
            }
        }

        let hit_normal = match hit_edge {
            Some((vj, vi)) => {
                let tangent = vsub(&vi, &vj);
                vnormalize(&[tangent[2], 0.0, -tangent[0]])
            }
            None => [0.0; 3],
        };

        if status.has_detail(Status::OUT_OF_NODES) {
            log::warn!("wall distance search from {} ran out of nodes", start_ref);
        }

        Ok(DistanceToWall {
            distance: radius_sqr.sqrt(),
            hit_pos,
            hit_normal,
            status,
        })
    }

    /// Moves from `start_pos` towards `end_pos` while staying on the mesh
    ///
    /// The search is limited to the polygons near the segment, so it is
    /// meant for short per-frame moves. When the end is not reachable the
    /// result slides along the nearest wall. The returned position keeps
    /// the height of the input and should be snapped by the caller.
    pub fn move_along_surface(
        &mut self,
        nav: &NavMesh,
        start_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: &dyn QueryFilter,
    ) -> QueryResult<SurfaceMove> {
        if !nav.is_valid_poly_ref(start_ref) || !visfinite(start_pos) || !visfinite(end_pos) {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }

        self.tiny_node_pool.clear();
        let start_idx = self
            .tiny_node_pool
            .get_node(start_ref, 0)
            .ok_or(Status::FAILURE | Status::OUT_OF_NODES)?;
        {
            let node = self.tiny_node_pool.node_mut(start_idx);
            node.pidx = 0;
            node.cost = 0.0;
            node.total = 0.0;
            node.id = start_ref;
            node.flags = NodeFlags::CLOSED;
        }

        let mut stack = std::collections::VecDeque::with_capacity(MAX_SURFACE_MOVE_STACK);
        stack.push_back(start_idx);

        let mut best_pos = *start_pos;
        let mut best_dist = f32::MAX;
        let mut best_idx: NodeIndex = start_idx;

        let search_pos = vlerp(start_pos, end_pos, 0.5);
        let search_rad_sqr = sqr(vdist(start_pos, end_pos) / 2.0 + 0.001);

        while let Some(cur_idx) = stack.pop_front() {
            let cur_ref = self.tiny_node_pool.node(cur_idx).id;
            let (cur_tile, cur_poly) = nav.get_tile_and_poly_by_ref_unsafe(cur_ref);
            let (verts, nv) = cur_tile.poly_vertices(cur_poly);

            if point_in_polygon(end_pos, &verts, nv) {
                best_idx = cur_idx;
                best_pos = *end_pos;
                break;
            }

            let base = cur_tile.poly_ref_base();
            let cur_node_idx = self.tiny_node_pool.get_node_idx(cur_idx);

            for j in 0..nv {
                let i = (j + 1) % nv;
                let mut neis = [PolyRef::NULL; MAX_EDGE_NEIGHBOURS];
                let mut nneis = 0;

                if cur_poly.neis[j] & EXT_LINK != 0 {
                    for link in cur_tile.links_of(cur_ref.poly() as usize) {
                        if link.edge as usize != j || link.reference.is_null() {
                            continue;
                        }
                        let (nt, np) = nav.get_tile_and_poly_by_ref_unsafe(link.reference);
                        if filter.pass_filter(link.reference, nt, np) && nneis < MAX_EDGE_NEIGHBOURS {
                            neis[nneis] = link.reference;
                            nneis += 1;
                        }
                    }
                } else if cur_poly.neis[j] != 0 {
                    let idx = (cur_poly.neis[j] - 1) as usize;
                    let r = base.with_poly(idx as u32);
                    if filter.pass_filter(r, cur_tile, &cur_tile.data.polys[idx]) {
                        neis[0] = r;
                        nneis = 1;
                    }
                }

                let vj = &verts[j * 3..j * 3 + 3];
                let vi = &verts[i * 3..i * 3 + 3];

                if nneis == 0 {
                    // Wall edge, track the closest point to the target.
                    let (dist_sqr, tseg) = dist_pt_seg_sqr_2d(end_pos, vj, vi);
                    if dist_sqr < best_dist {
                        best_pos = vlerp(vj, vi, tseg);
                        best_dist = dist_sqr;
                        best_idx = cur_idx;
                    }
                    continue;
                }

                for &nei in &neis[..nneis] {
                    let Some(nei_idx) = self.tiny_node_pool.get_node(nei, 0) else {
                        continue;
                    };
                    if self.tiny_node_pool.node(nei_idx).flags.contains(NodeFlags::CLOSED) {
                        continue;
                    }
                    if dist_pt_seg_sqr_2d(&search_pos, vj, vi).0 > search_rad_sqr {
                        continue;
                    }

                    if stack.len() < MAX_SURFACE_MOVE_STACK {
                        let node = self.tiny_node_pool.node_mut(nei_idx);
                        node.pidx = cur_node_idx;
                        node.flags.insert(NodeFlags::CLOSED);
                        stack.push_back(nei_idx);
                    }
                }
            }
        }

        let mut visited = Vec::new();
        let mut cur = Some(best_idx);
        while let Some(idx) = cur {
            visited.push(self.tiny_node_pool.node(idx).id);
            cur = self.tiny_node_pool.parent_of(idx);
        }
        visited.reverse();

        Ok(SurfaceMove {
            result_pos: best_pos,
            visited,
        })
    }

    /// Picks a random point on the mesh
    ///
    /// A tile is chosen uniformly, then a polygon weighted by area, then a
    /// point uniformly inside it. `rand` must return values in `[0, 1)`.
    pub fn find_random_point(
        &self,
        nav: &NavMesh,
        filter: &dyn QueryFilter,
        mut rand: impl FnMut() -> f32,
    ) -> QueryResult<RandomPoint> {
        // Tiles are assumed to cover roughly the same area.
        let mut tile: Option<&MeshTile> = None;
        let mut tile_sum = 0.0f32;
        for t in nav.tiles() {
            tile_sum += 1.0;
            if rand() * tile_sum <= 1.0 {
                tile = Some(t);
            }
        }
        let tile = tile.ok_or(Status::FAILURE)?;

        let base = tile.poly_ref_base();
        let mut chosen: Option<(PolyRef, &Poly)> = None;
        let mut area_sum = 0.0f32;
        for (ip, poly) in tile.data.polys.iter().enumerate() {
            if poly.is_off_mesh_connection() {
                continue;
            }
            let r = base.with_poly(ip as u32);
            if !filter.pass_filter(r, tile, poly) {
                continue;
            }

            let area = poly_area_2d(tile, poly);
            area_sum += area;
            if rand() * area_sum <= area {
                chosen = Some((r, poly));
            }
        }
        let (poly_ref, poly) = chosen.ok_or(Status::FAILURE)?;

        let (verts, nv) = tile.poly_vertices(poly);
        let pos = random_point_on_poly(nav, poly_ref, &verts[..nv * 3], rand(), rand());
        Ok(RandomPoint {
            poly_ref,
            pos,
            status: Status::SUCCESS,
        })
    }

    /// Picks a random point on a polygon reachable from the start polygon
    /// within `radius` of `center`
    ///
    /// Polygons are weighted by area. The point lies on a polygon touched by
    /// the circle but may itself lie outside the circle.
    pub fn find_random_point_around_circle(
        &mut self,
        nav: &NavMesh,
        start_ref: PolyRef,
        center: &[f32; 3],
        radius: f32,
        filter: &dyn QueryFilter,
        rand: impl FnMut() -> f32,
    ) -> QueryResult<RandomPoint> {
        self.random_point_in_reach(nav, start_ref, center, radius, filter, rand, false)
    }

    /// Picks a random point inside the circle on a polygon reachable from
    /// the start polygon
    ///
    /// Each polygon is clipped to a 12-sided polygon inscribed in the circle
    /// before it is weighted and sampled, so the point never leaves the
    /// circle.
    pub fn find_random_point_within_circle(
        &mut self,
        nav: &NavMesh,
        start_ref: PolyRef,
        center: &[f32; 3],
        radius: f32,
        filter: &dyn QueryFilter,
        rand: impl FnMut() -> f32,
    ) -> QueryResult<RandomPoint> {
        self.random_point_in_reach(nav, start_ref, center, radius, filter, rand, true)
    }

    #[allow(clippy::too_many_arguments)]
    fn random_point_in_reach(
        &mut self,
        nav: &NavMesh,
        start_ref: PolyRef,
        center: &[f32; 3],
        radius: f32,
        filter: &dyn QueryFilter,
        mut rand: impl FnMut() -> f32,
        clip_to_circle: bool,
    ) -> QueryResult<RandomPoint> {
        if !visfinite(center) || !radius.is_finite() || radius < 0.0 {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }
        let (start_tile, start_poly) = nav
            .get_tile_and_poly_by_ref(start_ref)
            .map_err(|_| Status::FAILURE | Status::INVALID_PARAM)?;
        if !filter.pass_filter(start_ref, start_tile, start_poly) {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }

        let radius_sqr = sqr(radius);
        let center = *center;
        let mut area_sum = 0.0f32;
        let mut chosen: Option<(PolyRef, Vec<f32>)> = None;

        // Flood inside the circle and sample the visited polygons by area.
        let reached = self.flood_polygons(nav, start_ref, &center, filter, usize::MAX, |va, vb| {
            dist_pt_seg_sqr_2d(&center, va, vb).0 <= radius_sqr
        })?;
        for &r in &reached.refs {
            let (tile, poly) = nav.get_tile_and_poly_by_ref_unsafe(r);
            if poly.is_off_mesh_connection() {
                continue;
            }
            let (verts, nv) = tile.poly_vertices(poly);
            let verts = if clip_to_circle {
                match clip_poly_to_circle(&verts[..nv * 3], &center, radius) {
                    Some(clipped) => clipped,
                    None => continue,
                }
            } else {
                verts[..nv * 3].to_vec()
            };

            let area = fan_area_2d(&verts);
            area_sum += area;
            if rand() * area_sum <= area {
                chosen = Some((r, verts));
            }
        }

        let (poly_ref, verts) = chosen.ok_or(Status::FAILURE)?;
        let pos = random_point_on_poly(nav, poly_ref, &verts, rand(), rand());
        Ok(RandomPoint {
            poly_ref,
            pos,
            status: Status::SUCCESS | reached.status.detail(),
        })
    }
}

/// Checks if edge `j` of a polygon blocks movement under `filter`
fn is_solid_edge(
    nav: &NavMesh,
    tile: &MeshTile,
    poly_ref: PolyRef,
    poly: &Poly,
    j: usize,
    filter: &dyn QueryFilter,
) -> bool {
    if poly.neis[j] & EXT_LINK != 0 {
        // Only the first link on the edge is consulted.
        return match tile.links_of(poly_ref.poly() as usize).find(|l| l.edge as usize == j) {
            Some(link) if !link.reference.is_null() => {
                let (nt, np) = nav.get_tile_and_poly_by_ref_unsafe(link.reference);
                !filter.pass_filter(link.reference, nt, np)
            }
            _ => true,
        };
    }

    if poly.neis[j] != 0 {
        let idx = (poly.neis[j] - 1) as usize;
        let r = tile.poly_ref_base().with_poly(idx as u32);
        return !filter.pass_filter(r, tile, &tile.data.polys[idx]);
    }

    true
}

/// Area of a polygon projected on the xz plane
fn poly_area_2d(tile: &MeshTile, poly: &Poly) -> f32 {
    let (verts, nv) = tile.poly_vertices(poly);
    fan_area_2d(&verts[..nv * 3])
}

/// Area of a convex polygon given as packed xyz vertices
fn fan_area_2d(verts: &[f32]) -> f32 {
    let nv = verts.len() / 3;
    (2..nv)
        .map(|j| tri_area_2d(&verts[0..3], &verts[(j - 1) * 3..j * 3], &verts[j * 3..j * 3 + 3]))
        .sum()
}

/// Clips a convex polygon to the regular polygon inscribed in a circle
///
/// A polygon already inside the circle is returned unchanged. `None` when
/// nothing of the polygon is left.
fn clip_poly_to_circle(verts: &[f32], center: &[f32; 3], radius: f32) -> Option<Vec<f32>> {
    let radius_sqr = sqr(radius);
    let mut poly: Vec<[f32; 3]> = (0..verts.len() / 3).map(|i| vert_at(verts, i)).collect();
    if poly.iter().all(|v| vdist_sqr_2d(v, center) <= radius_sqr) {
        return Some(verts.to_vec());
    }
    if radius <= 0.0 {
        return None;
    }

    let circle: Vec<[f32; 3]> = (0..CIRCLE_SEGMENTS)
        .map(|k| {
            let a = k as f32 * std::f32::consts::TAU / CIRCLE_SEGMENTS as f32;
            [center[0] + radius * a.cos(), center[1], center[2] + radius * a.sin()]
        })
        .collect();

    // Sutherland-Hodgman against every side; "inside" is the centre's side,
    // which makes the clip independent of the winding.
    for k in 0..CIRCLE_SEGMENTS {
        let a = circle[k];
        let b = circle[(k + 1) % CIRCLE_SEGMENTS];
        let side = |p: &[f32; 3]| (b[0] - a[0]) * (p[2] - a[2]) - (b[2] - a[2]) * (p[0] - a[0]);
        let center_side = side(center);

        let mut clipped = Vec::with_capacity(poly.len() + 1);
        for i in 0..poly.len() {
            let prev = poly[(i + poly.len() - 1) % poly.len()];
            let cur = poly[i];
            let (sp, sc) = (side(&prev), side(&cur));
            let (prev_in, cur_in) = (sp * center_side >= 0.0, sc * center_side >= 0.0);
            if prev_in != cur_in {
                clipped.push(vlerp(&prev, &cur, sp / (sp - sc)));
            }
            if cur_in {
                clipped.push(cur);
            }
        }
        poly = clipped;
        if poly.len() < 3 {
            return None;
        }
    }

    Some(poly.iter().flatten().copied().collect())
}

/// Uniform point inside a convex outline, moved onto the polygon surface
///
/// Samples can land exactly on the outline, where the strict point in
/// polygon test fails, so the height comes from the closest point.
fn random_point_on_poly(nav: &NavMesh, poly_ref: PolyRef, verts: &[f32], s: f32, t: f32) -> [f32; 3] {
    let pt = random_point_in_convex_poly(verts, verts.len() / 3, s, t);
    nav.closest_point_on_poly(poly_ref, &pt).0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_mesh_helpers::{
        create_grid_mesh, create_rotated_quad_mesh, create_tiled_mesh, grid_poly_ref,
    };
    use crate::{DefaultQueryFilter, PolyFlags};
    use navtile_common::{vdist_2d, Result};

    #[test]
    fn test_circle_flood_stops_at_radius() -> Result<()> {
        let mesh = create_grid_mesh(3, 1.0)?;
        let filter = DefaultQueryFilter::default();
        let mut query = NavMeshQuery::new(64);
        let start = grid_poly_ref(&mesh, 0, 0, 3, 1, 1);
        let center = [1.5, 0.0, 1.5];

        let near = query.find_polys_around_circle(&mesh, start, &center, 0.6, &filter, 32)?;
        assert_eq!(near.status, Status::SUCCESS);
        assert_eq!(near.len(), 5);
        assert_eq!(near.refs[0], start);
        assert!(near.parents[0].is_null());
        assert_eq!(near.costs[0], 0.0);
        for k in 1..near.len() {
            assert_eq!(near.parents[k], start);
            assert!(near.costs[k] >= near.costs[k - 1]);
        }

        let far = query.find_polys_around_circle(&mesh, start, &center, 0.8, &filter, 32)?;
        assert_eq!(far.len(), 9);
        Ok(())
    }

    #[test]
    fn test_circle_flood_limits_results() -> Result<()> {
        let mesh = create_grid_mesh(3, 1.0)?;
        let filter = DefaultQueryFilter::default();
        let mut query = NavMeshQuery::new(64);
        let start = grid_poly_ref(&mesh, 0, 0, 3, 1, 1);

        let result = query.find_polys_around_circle(&mesh, start, &[1.5, 0.0, 1.5], 0.8, &filter, 3)?;
        assert_eq!(result.len(), 3);
        assert!(result.status.has_detail(Status::BUFFER_TOO_SMALL));

        assert!(query
            .find_polys_around_circle(&mesh, start, &[1.5, 0.0, 1.5], -1.0, &filter, 3)
            .is_err());
        Ok(())
    }

    #[test]
    fn test_path_from_dijkstra_search() -> Result<()> {
        let mesh = create_grid_mesh(3, 1.0)?;
        let filter = DefaultQueryFilter::default();
        let mut query = NavMeshQuery::new(64);
        let start = grid_poly_ref(&mesh, 0, 0, 3, 1, 1);
        let corner = grid_poly_ref(&mesh, 0, 0, 3, 2, 2);

        query.find_polys_around_circle(&mesh, start, &[1.5, 0.0, 1.5], 0.8, &filter, 32)?;
        assert!(query.is_in_closed_list(corner));
        let path = query.get_path_from_dijkstra_search(&mesh, corner)?;
        assert_eq!(path.len(), 3);
        assert_eq!(path[0], start);
        assert_eq!(path[2], corner);
        Ok(())
    }

    #[test]
    fn test_shape_flood_follows_shape() -> Result<()> {
        let mesh = create_grid_mesh(3, 1.0)?;
        let filter = DefaultQueryFilter::default();
        let mut query = NavMeshQuery::new(64);
        let start = grid_poly_ref(&mesh, 0, 0, 3, 0, 0);

        // Thin box along the bottom row, same winding as the grid cells.
        let shape = [[0.2, 0.0, 0.2], [0.2, 0.0, 0.8], [2.8, 0.0, 0.8], [2.8, 0.0, 0.2]];
        let result = query.find_polys_around_shape(&mesh, start, &shape, &filter, 32)?;

        let mut refs = result.refs.clone();
        refs.sort();
        let mut expected: Vec<_> = (0..3).map(|x| grid_poly_ref(&mesh, 0, 0, 3, x, 0)).collect();
        expected.sort();
        assert_eq!(refs, expected);

        assert!(query
            .find_polys_around_shape(&mesh, start, &shape[..2], &filter, 32)
            .is_err());
        Ok(())
    }

    #[test]
    fn test_local_neighbourhood() -> Result<()> {
        let mesh = create_grid_mesh(3, 1.0)?;
        let filter = DefaultQueryFilter::default();
        let mut query = NavMeshQuery::new(64);
        let start = grid_poly_ref(&mesh, 0, 0, 3, 1, 1);

        let hood = query.find_local_neighbourhood(&mesh, start, &[1.5, 0.0, 1.5], 0.6, &filter, 16)?;
        assert_eq!(hood.refs.len(), 5);
        assert_eq!(hood.refs[0], start);
        assert!(hood.parents[0].is_null());
        assert!(hood.parents[1..].iter().all(|&p| p == start));

        let small = query.find_local_neighbourhood(&mesh, start, &[1.5, 0.0, 1.5], 0.6, &filter, 2)?;
        assert_eq!(small.refs.len(), 2);
        assert!(small.status.has_detail(Status::BUFFER_TOO_SMALL));
        Ok(())
    }

    #[test]
    fn test_wall_segments_of_corner_cell() -> Result<()> {
        let mesh = create_grid_mesh(3, 1.0)?;
        let filter = DefaultQueryFilter::default();
        let query = NavMeshQuery::new(16);
        let corner = grid_poly_ref(&mesh, 0, 0, 3, 0, 0);

        let walls = query.get_poly_wall_segments(&mesh, corner, false, &filter)?;
        assert_eq!(walls.segments.len(), 2);
        assert!(walls.segments.iter().all(|s| s.is_wall()));
        assert_eq!(walls.segments[0].start, [0.0, 0.0, 0.0]);
        assert_eq!(walls.segments[0].end, [0.0, 0.0, 1.0]);

        let all = query.get_poly_wall_segments(&mesh, corner, true, &filter)?;
        assert_eq!(all.segments.len(), 4);
        assert_eq!(all.portals().count(), 2);
        assert!(all
            .portals()
            .any(|s| s.neighbour == grid_poly_ref(&mesh, 0, 0, 3, 1, 0)));
        Ok(())
    }

    #[test]
    fn test_wall_segments_across_tiles() -> Result<()> {
        let mesh = create_tiled_mesh(2, 1, 3, 1.0)?;
        let filter = DefaultQueryFilter::default();
        let query = NavMeshQuery::new(16);
        let border_cell = grid_poly_ref(&mesh, 0, 0, 3, 2, 1);

        let walls = query.get_poly_wall_segments(&mesh, border_cell, false, &filter)?;
        assert!(walls.segments.is_empty());

        let all = query.get_poly_wall_segments(&mesh, border_cell, true, &filter)?;
        assert_eq!(all.segments.len(), 4);
        let across: Vec<_> = all
            .portals()
            .filter(|s| s.neighbour == grid_poly_ref(&mesh, 1, 0, 3, 0, 1))
            .collect();
        assert_eq!(across.len(), 1);
        assert_eq!(across[0].start[0], 3.0);
        assert_eq!(across[0].end[0], 3.0);
        Ok(())
    }

    #[test]
    fn test_distance_to_wall() -> Result<()> {
        let mut mesh = create_grid_mesh(3, 1.0)?;
        let filter = DefaultQueryFilter::new(PolyFlags::all(), PolyFlags::DISABLED);
        let mut query = NavMeshQuery::new(64);
        let start = grid_poly_ref(&mesh, 0, 0, 3, 1, 1);
        let center = [1.5, 0.0, 1.5];

        let wall = query.find_distance_to_wall(&mesh, start, &center, 5.0, &filter)?;
        assert!((wall.distance - 1.5).abs() < 1e-4);
        assert!((vdist(&wall.hit_pos, &center) - 1.5).abs() < 1e-4);
        assert!((navtile_common::vlen(&wall.hit_normal) - 1.0).abs() < 1e-4);

        let short = query.find_distance_to_wall(&mesh, start, &center, 0.2, &filter)?;
        assert!((short.distance - 0.2).abs() < 1e-5);
        assert_eq!(short.hit_normal, [0.0; 3]);

        // A rejected neighbour turns the shared edge into a wall.
        mesh.set_poly_flags(grid_poly_ref(&mesh, 0, 0, 3, 2, 1), PolyFlags::DISABLED)?;
        let blocked = query.find_distance_to_wall(&mesh, start, &center, 5.0, &filter)?;
        assert!((blocked.distance - 0.5).abs() < 1e-4);
        assert!((blocked.hit_pos[0] - 2.0).abs() < 1e-4);
        assert!((blocked.hit_normal[0] + 1.0).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_move_along_surface() -> Result<()> {
        let mesh = create_grid_mesh(3, 1.0)?;
        let filter = DefaultQueryFilter::default();
        let mut query = NavMeshQuery::new(64);
        let start = grid_poly_ref(&mesh, 0, 0, 3, 0, 0);

        let moved = query.move_along_surface(&mesh, start, &[0.5, 0.0, 0.5], &[2.5, 0.0, 0.5], &filter)?;
        assert_eq!(moved.result_pos, [2.5, 0.0, 0.5]);
        let expected: Vec<_> = (0..3).map(|x| grid_poly_ref(&mesh, 0, 0, 3, x, 0)).collect();
        assert_eq!(moved.visited, expected);

        // Moving off the mesh slides to the wall.
        let blocked = query.move_along_surface(&mesh, start, &[0.5, 0.0, 0.5], &[0.5, 0.0, -1.0], &filter)?;
        assert!((blocked.result_pos[0] - 0.5).abs() < 1e-4);
        assert!(blocked.result_pos[2].abs() < 1e-4);
        assert_eq!(blocked.visited, vec![start]);
        Ok(())
    }

    fn lcg(seed: u32) -> impl FnMut() -> f32 {
        let mut state = seed;
        move || {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 8) as f32 / (1u32 << 24) as f32
        }
    }

    #[test]
    fn test_random_points_lie_on_their_polygon() -> Result<()> {
        let mesh = create_tiled_mesh(2, 2, 3, 1.0)?;
        let filter = DefaultQueryFilter::default();
        let query = NavMeshQuery::new(64);
        let mut rand = lcg(7);

        for _ in 0..32 {
            let p = query.find_random_point(&mesh, &filter, &mut rand)?;
            let (closest, over) = mesh.closest_point_on_poly(p.poly_ref, &p.pos);
            assert!(over);
            assert!(vdist(&closest, &p.pos) < 1e-4);
        }
        Ok(())
    }

    #[test]
    fn test_random_point_around_circle() -> Result<()> {
        let mesh = create_grid_mesh(3, 1.0)?;
        let filter = DefaultQueryFilter::default();
        let mut query = NavMeshQuery::new(64);
        let start = grid_poly_ref(&mesh, 0, 0, 3, 1, 1);
        let allowed = [
            start,
            grid_poly_ref(&mesh, 0, 0, 3, 0, 1),
            grid_poly_ref(&mesh, 0, 0, 3, 2, 1),
            grid_poly_ref(&mesh, 0, 0, 3, 1, 0),
            grid_poly_ref(&mesh, 0, 0, 3, 1, 2),
        ];
        let mut rand = lcg(99);

        for _ in 0..16 {
            let p = query.find_random_point_around_circle(&mesh, start, &[1.5, 0.0, 1.5], 0.5, &filter, &mut rand)?;
            assert!(allowed.contains(&p.poly_ref));
            assert_eq!(p.pos[1], 0.0);
        }
        Ok(())
    }

    /// Smallest and largest values a `[0, 1)` random source can return
    const RAND_ENDPOINTS: [f32; 2] = [0.0, 1.0 - f32::EPSILON];

    fn assert_on_poly(mesh: &NavMesh, p: &RandomPoint) {
        let (closest, _) = mesh.closest_point_on_poly(p.poly_ref, &p.pos);
        assert!(vdist(&closest, &p.pos) < 1e-4, "{:?} is off its polygon", p);
    }

    #[test]
    fn test_random_point_at_range_endpoints() -> Result<()> {
        let filter = DefaultQueryFilter::default();
        let mut query = NavMeshQuery::new(64);

        for mesh in [create_rotated_quad_mesh()?, create_grid_mesh(3, 1.0)?] {
            let start = mesh.get_tile_ref_at(0, 0, 0).with_poly(0);
            for r in RAND_ENDPOINTS {
                let p = query.find_random_point(&mesh, &filter, || r)?;
                assert_on_poly(&mesh, &p);
                assert_eq!(p.status, Status::SUCCESS);

                let p = query.find_random_point_around_circle(&mesh, start, &[0.5, 0.0, 0.5], 2.0, &filter, || r)?;
                assert_on_poly(&mesh, &p);

                let p = query.find_random_point_within_circle(&mesh, start, &[0.5, 0.0, 0.5], 2.0, &filter, || r)?;
                assert_on_poly(&mesh, &p);
            }
        }
        Ok(())
    }

    #[test]
    fn test_random_point_at_first_vertex_of_rotated_quad() -> Result<()> {
        let mesh = create_rotated_quad_mesh()?;
        let filter = DefaultQueryFilter::default();
        let query = NavMeshQuery::new(16);

        // Zero picks the first vertex, which sits on the outline.
        let p = query.find_random_point(&mesh, &filter, || 0.0)?;
        assert_eq!(p.poly_ref, mesh.get_tile_ref_at(0, 0, 0).with_poly(0));
        assert!(vdist(&p.pos, &[1.0, 0.0, 1.0]) < 1e-5);
        Ok(())
    }

    #[test]
    fn test_random_point_within_circle_stays_inside() -> Result<()> {
        let mesh = create_grid_mesh(3, 1.0)?;
        let filter = DefaultQueryFilter::default();
        let mut query = NavMeshQuery::new(64);
        let start = grid_poly_ref(&mesh, 0, 0, 3, 1, 1);
        let center = [1.5, 0.0, 1.5];
        let radius = 0.7;
        let mut rand = lcg(3);

        let mut polys = Vec::new();
        for _ in 0..64 {
            let p = query.find_random_point_within_circle(&mesh, start, &center, radius, &filter, &mut rand)?;
            assert!(vdist_2d(&center, &p.pos) <= radius + 1e-4, "{:?} outside the circle", p.pos);
            assert_on_poly(&mesh, &p);
            if !polys.contains(&p.poly_ref) {
                polys.push(p.poly_ref);
            }
        }
        // The circle pokes into the four side cells but not the corners.
        assert!(polys.len() > 1);
        assert!(!polys.contains(&grid_poly_ref(&mesh, 0, 0, 3, 0, 0)));

        for r in RAND_ENDPOINTS {
            let p = query.find_random_point_within_circle(&mesh, start, &center, radius, &filter, || r)?;
            assert!(vdist_2d(&center, &p.pos) <= radius + 1e-4);
        }

        assert!(query
            .find_random_point_within_circle(&mesh, start, &center, -1.0, &filter, || 0.5)
            .is_err());
        Ok(())
    }

    #[test]
    fn test_random_point_around_circle_reports_out_of_nodes() -> Result<()> {
        let mesh = create_grid_mesh(3, 1.0)?;
        let filter = DefaultQueryFilter::default();
        let mut query = NavMeshQuery::new(2);
        let start = grid_poly_ref(&mesh, 0, 0, 3, 1, 1);

        let p = query.find_random_point_around_circle(&mesh, start, &[1.5, 0.0, 1.5], 5.0, &filter, lcg(11))?;
        assert!(p.status.is_success());
        assert!(p.status.has_detail(Status::OUT_OF_NODES));
        assert_on_poly(&mesh, &p);

        let mut query = NavMeshQuery::new(64);
        let p = query.find_random_point_around_circle(&mesh, start, &[1.5, 0.0, 1.5], 5.0, &filter, lcg(11))?;
        assert_eq!(p.status, Status::SUCCESS);
        Ok(())
    }
}
