//! Navigation mesh query implementation
//!
//! [`NavMeshQuery`] owns the search state (node pools and open list) used by
//! the graph searches. The mesh itself is borrowed per call, so tiles can be
//! added or removed between queries without rebuilding the query object.

use navtile_common::{
    dist_pt_poly_edges_sqr, dist_pt_seg_sqr_2d, intersect_seg_seg_2d, intersect_segment_poly_2d,
    sqr, vdist_sqr, visfinite, visfinite_2d, vlerp, vmad, vnormalize, vsub,
};

use super::nav_mesh::{MeshTile, NavMesh, Poly};
use super::node_pool::{NodeFlags, NodeIndex, NodePool, NodeQueue};
use super::poly_query::{CollectPolysQuery, FindNearestPolyQuery, PolyQuery};
use super::query_filter::{DefaultQueryHeuristic, PolyContext, QueryFilter, QueryHeuristic};
use super::raycast_hit::{RaycastHit, RaycastOptions};
use super::sliced_pathfinding::SlicedFindPathState;
use super::status::{QueryResult, Status};
use super::{PolyRef, PolyType, MAX_VERTS_PER_POLY, RAY_CAST_LIMIT_PROPORTIONS};

/// Size of the node pool used by the small local searches
const TINY_NODE_POOL_SIZE: usize = 64;

/// Number of polygons handed to a [`PolyQuery`] per call
const QUERY_BATCH_SIZE: usize = 32;

bitflags::bitflags! {
    /// Options for [`NavMeshQuery::find_path`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FindPathOptions: u32 {
        /// Use raycasts during the search to shortcut through visible nodes
        const ANY_ANGLE = 0x02;
    }
}

/// Sizing and defaults of a query object
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct QueryConfig {
    /// Number of search nodes available to A* and the Dijkstra searches
    pub max_nodes: usize,
    /// Search box used when a caller does not provide one
    pub default_half_extents: [f32; 3],
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_nodes: 2048,
            default_half_extents: [2.0, 4.0, 2.0],
        }
    }
}

/// Nearest polygon to a point
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NearestPoly {
    /// Null when no polygon was found in the search box
    pub poly_ref: PolyRef,
    /// Closest point on the polygon
    pub point: [f32; 3],
    /// True when the point lies directly above or below the polygon
    pub is_over_poly: bool,
}

impl NearestPoly {
    pub fn found(&self) -> bool {
        !self.poly_ref.is_null()
    }
}

/// Polygon corridor produced by a path search
#[derive(Debug, Clone, PartialEq)]
pub struct PolyPath {
    /// Polygons from start to end (or to the node closest to the end)
    pub polys: Vec<PolyRef>,
    /// Success status with detail flags such as `PARTIAL_RESULT`
    pub status: Status,
}

impl PolyPath {
    /// True if the search did not reach the end polygon
    pub fn is_partial(&self) -> bool {
        self.status.has_detail(Status::PARTIAL_RESULT)
    }

    pub fn len(&self) -> usize {
        self.polys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.polys.is_empty()
    }
}

/// Left and right end of the edge shared by two polygons
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Portal {
    pub left: [f32; 3],
    pub right: [f32; 3],
    pub from_type: PolyType,
    pub to_type: PolyType,
}

/// State of one A* search, shared by the one-shot and the sliced variants
#[derive(Debug, Clone)]
pub(crate) struct PathSearch {
    pub start_ref: PolyRef,
    pub end_ref: PolyRef,
    pub start_pos: [f32; 3],
    pub end_pos: [f32; 3],
    pub options: FindPathOptions,
    pub raycast_limit_sqr: f32,
    pub last_best: Option<NodeIndex>,
    pub last_best_cost: f32,
    pub status: Status,
}

/// Query engine for a navigation mesh
///
/// Not reentrant: every search resets and reuses the node pool, so a query
/// object is used by one caller at a time.
pub struct NavMeshQuery {
    pub(crate) config: QueryConfig,
    pub(crate) node_pool: NodePool,
    pub(crate) tiny_node_pool: NodePool,
    pub(crate) open_list: NodeQueue,
    pub(crate) heuristic: Box<dyn QueryHeuristic + Send>,
    pub(crate) sliced: Option<SlicedFindPathState>,
}

impl std::fmt::Debug for NavMeshQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NavMeshQuery")
            .field("config", &self.config)
            .field("node_count", &self.node_pool.node_count())
            .field("sliced_active", &self.sliced.is_some())
            .finish()
    }
}

impl NavMeshQuery {
    /// Creates a query with room for `max_nodes` search nodes
    pub fn new(max_nodes: usize) -> Self {
        Self::with_config(QueryConfig {
            max_nodes,
            ..QueryConfig::default()
        })
    }

    pub fn with_config(config: QueryConfig) -> Self {
        let max_nodes = config.max_nodes.max(1);
        Self {
            node_pool: NodePool::new(max_nodes, (max_nodes / 4).max(1)),
            tiny_node_pool: NodePool::new(TINY_NODE_POOL_SIZE, 32),
            open_list: NodeQueue::new(max_nodes),
            heuristic: Box::new(DefaultQueryHeuristic::default()),
            sliced: None,
            config,
        }
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Replaces the A* heuristic
    pub fn set_heuristic(&mut self, heuristic: impl QueryHeuristic + Send + 'static) {
        self.heuristic = Box::new(heuristic);
    }

    /// Node pool of the last search
    pub fn node_pool(&self) -> &NodePool {
        &self.node_pool
    }

    /// Finds the polygon nearest to `center` within the search box
    ///
    /// A null `poly_ref` in the result means nothing was found.
    pub fn find_nearest_poly(
        &self,
        nav: &NavMesh,
        center: &[f32; 3],
        half_extents: &[f32; 3],
        filter: &dyn QueryFilter,
    ) -> QueryResult<NearestPoly> {
        let mut query = FindNearestPolyQuery::new(nav, center);
        self.query_polygons(nav, center, half_extents, filter, &mut query)?;

        Ok(NearestPoly {
            poly_ref: query.nearest_ref(),
            point: *query.nearest_point(),
            is_over_poly: query.is_over_poly(),
        })
    }

    /// Same as [`find_nearest_poly`](Self::find_nearest_poly) with the
    /// configured default search box
    pub fn find_nearest_poly_default(
        &self,
        nav: &NavMesh,
        center: &[f32; 3],
        filter: &dyn QueryFilter,
    ) -> QueryResult<NearestPoly> {
        let half_extents = self.config.default_half_extents;
        self.find_nearest_poly(nav, center, &half_extents, filter)
    }

    /// Reports every polygon passing `filter` whose bounds overlap the box
    pub fn query_polygons(
        &self,
        nav: &NavMesh,
        center: &[f32; 3],
        half_extents: &[f32; 3],
        filter: &dyn QueryFilter,
        query: &mut dyn PolyQuery,
    ) -> QueryResult<()> {
        let (bmin, bmax) = search_box(center, half_extents)?;

        let (minx, miny) = nav.calc_tile_loc(&bmin);
        let (maxx, maxy) = nav.calc_tile_loc(&bmax);
        for y in miny..=maxy {
            for x in minx..=maxx {
                for tile in nav.get_tiles_at(x, y) {
                    query_polygons_in_tile(tile, &bmin, &bmax, filter, query);
                }
            }
        }

        Ok(())
    }

    /// Collects up to `max_polys` polygons overlapping the box
    ///
    /// The status carries `BUFFER_TOO_SMALL` when polygons were dropped.
    pub fn query_polygons_collect(
        &self,
        nav: &NavMesh,
        center: &[f32; 3],
        half_extents: &[f32; 3],
        filter: &dyn QueryFilter,
        max_polys: usize,
    ) -> QueryResult<(Vec<PolyRef>, Status)> {
        let mut collector = CollectPolysQuery::new(max_polys);
        self.query_polygons(nav, center, half_extents, filter, &mut collector)?;

        let status = if collector.overflow() {
            Status::SUCCESS | Status::BUFFER_TOO_SMALL
        } else {
            Status::SUCCESS
        };
        Ok((collector.into_polys(), status))
    }

    /// Tiles whose grid cell overlaps the box
    pub fn query_tiles<'m>(
        &self,
        nav: &'m NavMesh,
        center: &[f32; 3],
        half_extents: &[f32; 3],
    ) -> QueryResult<Vec<&'m MeshTile>> {
        let (bmin, bmax) = search_box(center, half_extents)?;

        let (minx, miny) = nav.calc_tile_loc(&bmin);
        let (maxx, maxy) = nav.calc_tile_loc(&bmax);
        let mut tiles = Vec::new();
        for y in miny..=maxy {
            for x in minx..=maxx {
                tiles.extend(nav.get_tiles_at(x, y));
            }
        }
        Ok(tiles)
    }

    /// Closest point on a polygon, and whether `pos` is over it
    pub fn closest_point_on_poly(
        &self,
        nav: &NavMesh,
        poly_ref: PolyRef,
        pos: &[f32; 3],
    ) -> QueryResult<([f32; 3], bool)> {
        if !nav.is_valid_poly_ref(poly_ref) || !visfinite(pos) {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }
        Ok(nav.closest_point_on_poly(poly_ref, pos))
    }

    /// Closest point on the boundary of a polygon
    ///
    /// Uses the polygon outline only, so it is much cheaper than
    /// [`closest_point_on_poly`](Self::closest_point_on_poly). Points inside
    /// the polygon are returned unchanged.
    pub fn closest_point_on_poly_boundary(
        &self,
        nav: &NavMesh,
        poly_ref: PolyRef,
        pos: &[f32; 3],
    ) -> QueryResult<[f32; 3]> {
        let (tile, poly) = nav
            .get_tile_and_poly_by_ref(poly_ref)
            .map_err(|_| Status::FAILURE | Status::INVALID_PARAM)?;
        if !visfinite(pos) {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }

        let (verts, nv) = tile.poly_vertices(poly);
        let mut edge_dist = [0.0; MAX_VERTS_PER_POLY];
        let mut edge_t = [0.0; MAX_VERTS_PER_POLY];
        if dist_pt_poly_edges_sqr(pos, &verts, nv, &mut edge_dist, &mut edge_t) {
            return Ok(*pos);
        }

        let mut imin = 0;
        for i in 1..nv {
            if edge_dist[i] < edge_dist[imin] {
                imin = i;
            }
        }
        let va = &verts[imin * 3..imin * 3 + 3];
        let vb = &verts[((imin + 1) % nv) * 3..((imin + 1) % nv) * 3 + 3];
        Ok(vlerp(va, vb, edge_t[imin]))
    }

    /// Height of a polygon at the xz location of `pos`
    ///
    /// Off-mesh connections interpolate the height between their endpoints.
    pub fn get_poly_height(&self, nav: &NavMesh, poly_ref: PolyRef, pos: &[f32; 3]) -> QueryResult<f32> {
        let (tile, poly) = nav
            .get_tile_and_poly_by_ref(poly_ref)
            .map_err(|_| Status::FAILURE | Status::INVALID_PARAM)?;
        if !visfinite_2d(pos) {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }

        if poly.is_off_mesh_connection() {
            let v0 = tile.poly_vert(poly, 0);
            let v1 = tile.poly_vert(poly, 1);
            let (_, t) = dist_pt_seg_sqr_2d(pos, &v0, &v1);
            return Ok(v0[1] + (v1[1] - v0[1]) * t);
        }

        nav.get_poly_height(tile, poly_ref.poly() as usize, pos)
            .ok_or(Status::FAILURE | Status::INVALID_PARAM)
    }

    /// Checks that a reference is valid and passes the filter
    pub fn is_valid_poly_ref(&self, nav: &NavMesh, poly_ref: PolyRef, filter: &dyn QueryFilter) -> bool {
        match nav.get_tile_and_poly_by_ref(poly_ref) {
            Ok((tile, poly)) => filter.pass_filter(poly_ref, tile, poly),
            Err(_) => false,
        }
    }

    /// Finds a polygon corridor from the start to the end polygon
    ///
    /// When the end polygon cannot be reached, the corridor leads to the
    /// visited polygon nearest to the end and the status carries
    /// `PARTIAL_RESULT`. A negative `raycast_limit` derives the any-angle
    /// shortcut range from the walkable radius of the start tile.
    #[allow(clippy::too_many_arguments)]
    pub fn find_path(
        &mut self,
        nav: &NavMesh,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: &dyn QueryFilter,
        options: FindPathOptions,
        raycast_limit: f32,
    ) -> QueryResult<PolyPath> {
        let mut search =
            self.begin_path_search(nav, start_ref, end_ref, start_pos, end_pos, options, raycast_limit)?;

        if start_ref == end_ref {
            return Ok(PolyPath {
                polys: vec![start_ref],
                status: Status::SUCCESS,
            });
        }

        while !self.open_list.is_empty() {
            if self.expand_best_node(nav, filter, &mut search)? {
                break;
            }
        }

        Ok(self.finish_path_search(&search))
    }

    /// Validates the inputs and seeds the open list with the start node
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn begin_path_search(
        &mut self,
        nav: &NavMesh,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        options: FindPathOptions,
        raycast_limit: f32,
    ) -> QueryResult<PathSearch> {
        if !nav.is_valid_poly_ref(start_ref)
            || !nav.is_valid_poly_ref(end_ref)
            || !visfinite(start_pos)
            || !visfinite(end_pos)
        {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }

        let mut raycast_limit_sqr = sqr(raycast_limit);
        if options.contains(FindPathOptions::ANY_ANGLE) && raycast_limit < 0.0 {
            let (tile, _) = nav.get_tile_and_poly_by_ref_unsafe(start_ref);
            raycast_limit_sqr = sqr(tile.header().walkable_radius * RAY_CAST_LIMIT_PROPORTIONS);
        }

        let mut search = PathSearch {
            start_ref,
            end_ref,
            start_pos: *start_pos,
            end_pos: *end_pos,
            options,
            raycast_limit_sqr,
            last_best: None,
            last_best_cost: f32::MAX,
            status: Status::IN_PROGRESS,
        };

        self.node_pool.clear();
        self.open_list.clear();
        if start_ref == end_ref {
            return Ok(search);
        }

        let start_idx = self
            .node_pool
            .get_node(start_ref, 0)
            .ok_or(Status::FAILURE | Status::OUT_OF_NODES)?;
        let total = self.heuristic.get_cost(start_pos, end_pos);
        {
            let node = self.node_pool.node_mut(start_idx);
            node.pos = *start_pos;
            node.pidx = 0;
            node.cost = 0.0;
            node.total = total;
            node.flags = NodeFlags::OPEN;
            node.shortcut = None;
        }
        self.open_list.push(start_idx, &self.node_pool);

        search.last_best = Some(start_idx);
        search.last_best_cost = total;
        Ok(search)
    }

    /// Pops the cheapest open node and relaxes its neighbours
    ///
    /// Returns `Ok(true)` once the end polygon is popped, `Ok(false)` to keep
    /// going. Fails when a polygon of the current chain has been removed
    /// from the mesh since it was pushed.
    pub(crate) fn expand_best_node(
        &mut self,
        nav: &NavMesh,
        filter: &dyn QueryFilter,
        search: &mut PathSearch,
    ) -> QueryResult<bool> {
        let Some(best_idx) = self.open_list.pop(&self.node_pool) else {
            return Ok(false);
        };

        let (best_ref, best_pos, best_cost, best_pidx) = {
            let best = self.node_pool.node_mut(best_idx);
            best.flags.remove(NodeFlags::OPEN);
            best.flags.insert(NodeFlags::CLOSED);
            (best.id, best.pos, best.cost, best.pidx)
        };

        if best_ref == search.end_ref {
            search.last_best = Some(best_idx);
            return Ok(true);
        }

        let (best_tile, best_poly) = nav
            .get_tile_and_poly_by_ref(best_ref)
            .map_err(|_| Status::FAILURE)?;

        let parent_idx = self.node_pool.get_node_at_idx(best_pidx);
        let grandpa_ref = parent_idx
            .and_then(|p| self.node_pool.parent_of(p))
            .map_or(PolyRef::NULL, |g| self.node_pool.node(g).id);

        let mut parent = None;
        let mut parent_pos = [0.0; 3];
        let mut parent_cost = 0.0;
        if let Some(p) = parent_idx {
            let node = self.node_pool.node(p);
            let (tile, poly) = nav
                .get_tile_and_poly_by_ref(node.id)
                .map_err(|_| Status::FAILURE)?;
            if !grandpa_ref.is_null() && !nav.is_valid_poly_ref(grandpa_ref) {
                return Err(Status::FAILURE);
            }
            parent = Some(PolyContext::new(node.id, tile, poly));
            parent_pos = node.pos;
            parent_cost = node.cost;
        }
        let parent_ref = parent.map_or(PolyRef::NULL, |p| p.poly_ref);

        let try_los = search.options.contains(FindPathOptions::ANY_ANGLE)
            && parent.is_some()
            && (search.raycast_limit_sqr >= f32::MAX
                || vdist_sqr(&parent_pos, &best_pos) < search.raycast_limit_sqr);

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

            let Some(neighbour_idx) = self.node_pool.get_node(neighbour_ref, 0) else {
                search.status |= Status::OUT_OF_NODES;
                continue;
            };

            let (old_pidx, old_pos) = {
                let node = self.node_pool.node(neighbour_idx);
                (node.pidx, node.pos)
            };
            // Already reached from the same parent through a sibling.
            if old_pidx != 0 && old_pidx == best_pidx {
                continue;
            }

            let neighbour = PolyContext::new(neighbour_ref, neighbour_tile, neighbour_poly);
            let neighbour_pos = if neighbour_ref == search.end_ref {
                edge_intersection_point(&best_pos, cur, &search.end_pos, neighbour)
            } else {
                portal_between(cur, neighbour).map(|(l, r)| vlerp(&l, &r, 0.5))
            }
            .unwrap_or(old_pos);

            let mut shortcut = None;
            let mut cost = 0.0;
            if try_los {
                if let Ok(hit) = self.raycast(
                    nav,
                    parent_ref,
                    &parent_pos,
                    &neighbour_pos,
                    filter,
                    RaycastOptions::USE_COSTS,
                    grandpa_ref,
                ) {
                    if hit.t >= 1.0 {
                        cost = parent_cost + hit.path_cost;
                        shortcut = Some(hit.path);
                    }
                }
            }
            if shortcut.is_none() {
                cost = best_cost + filter.get_cost(&best_pos, &neighbour_pos, parent, cur, Some(neighbour));
            }

            let heuristic = if neighbour_ref == search.end_ref {
                cost += filter.get_cost(&neighbour_pos, &search.end_pos, Some(cur), neighbour, None);
                0.0
            } else {
                self.heuristic.get_cost(&neighbour_pos, &search.end_pos)
            };
            let total = cost + heuristic;
            if !total.is_finite() {
                continue;
            }

            let node = self.node_pool.node_mut(neighbour_idx);
            if node.flags.intersects(NodeFlags::OPEN | NodeFlags::CLOSED) && total >= node.total {
                continue;
            }

            node.pidx = if shortcut.is_some() { best_pidx } else { best_node_idx };
            node.id = neighbour_ref;
            node.flags.remove(NodeFlags::CLOSED);
            node.flags.set(NodeFlags::PARENT_DETACHED, shortcut.is_some());
            node.cost = cost;
            node.total = total;
            node.pos = neighbour_pos;
            node.shortcut = shortcut;

            if node.flags.contains(NodeFlags::OPEN) {
                self.open_list.modify(neighbour_idx, &self.node_pool);
            } else {
                node.flags.insert(NodeFlags::OPEN);
                self.open_list.push(neighbour_idx, &self.node_pool);
            }

            if heuristic < search.last_best_cost {
                search.last_best_cost = heuristic;
                search.last_best = Some(neighbour_idx);
            }
        }

        Ok(false)
    }

    /// Builds the corridor to the best node of a finished search
    pub(crate) fn finish_path_search(&self, search: &PathSearch) -> PolyPath {
        let mut status = Status::SUCCESS | search.status.detail();
        let polys = match search.last_best {
            Some(idx) => {
                if self.node_pool.node(idx).id != search.end_ref {
                    status |= Status::PARTIAL_RESULT;
                }
                self.get_path_to_node(idx)
            }
            None => vec![search.start_ref],
        };

        if status.has_detail(Status::OUT_OF_NODES) {
            log::warn!(
                "path search from {} to {} ran out of nodes ({} available)",
                search.start_ref,
                search.end_ref,
                self.node_pool.max_nodes()
            );
        }

        PolyPath { polys, status }
    }

    /// Follows parent links from a node back to the start, splicing in the
    /// polygons crossed by raycast shortcuts
    pub(crate) fn get_path_to_node(&self, end_idx: NodeIndex) -> Vec<PolyRef> {
        let mut path = Vec::new();
        let mut cur = Some(end_idx);
        while let Some(idx) = cur {
            let node = self.node_pool.node(idx);
            path.push(node.id);

            let next = self.node_pool.parent_of(idx);
            if let Some(shortcut) = &node.shortcut {
                let next_id = next.map(|n| self.node_pool.node(n).id);
                for &id in shortcut.iter().rev() {
                    if id != node.id && Some(id) != next_id {
                        path.push(id);
                    }
                }
            }
            cur = next;
        }
        path.reverse();
        path
    }

    /// Path to a polygon explored by the last Dijkstra search
    ///
    /// Only meaningful right after
    /// [`find_polys_around_circle`](Self::find_polys_around_circle) or
    /// [`find_polys_around_shape`](Self::find_polys_around_shape).
    pub fn get_path_from_dijkstra_search(&self, nav: &NavMesh, end_ref: PolyRef) -> QueryResult<Vec<PolyRef>> {
        if !nav.is_valid_poly_ref(end_ref) {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }

        let nodes = self.node_pool.find_nodes(end_ref, 2);
        if nodes.len() != 1 {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }
        let end_idx = nodes[0];
        if !self.node_pool.node(end_idx).flags.contains(NodeFlags::CLOSED) {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }

        Ok(self.get_path_to_node(end_idx))
    }

    /// Checks if a polygon was fully expanded by the last search
    pub fn is_in_closed_list(&self, poly_ref: PolyRef) -> bool {
        self.node_pool
            .find_nodes(poly_ref, crate::node_pool::MAX_STATES_PER_NODE as usize)
            .into_iter()
            .any(|idx| self.node_pool.node(idx).flags.contains(NodeFlags::CLOSED))
    }

    /// Edge shared by two adjacent polygons
    ///
    /// Portals on tile borders are clamped to the linked sub-range; portals
    /// of off-mesh connections collapse to the connection endpoint.
    pub fn get_portal_points(&self, nav: &NavMesh, from: PolyRef, to: PolyRef) -> QueryResult<Portal> {
        let invalid = |_| Status::FAILURE | Status::INVALID_PARAM;
        let (from_tile, from_poly) = nav.get_tile_and_poly_by_ref(from).map_err(invalid)?;
        let (to_tile, to_poly) = nav.get_tile_and_poly_by_ref(to).map_err(invalid)?;

        let (left, right) = portal_between(
            PolyContext::new(from, from_tile, from_poly),
            PolyContext::new(to, to_tile, to_poly),
        )?;
        Ok(Portal {
            left,
            right,
            from_type: from_poly.poly_type,
            to_type: to_poly.poly_type,
        })
    }

    /// Midpoint of the portal between two polygons
    pub fn get_edge_mid_point(&self, nav: &NavMesh, from: PolyRef, to: PolyRef) -> QueryResult<[f32; 3]> {
        let portal = self.get_portal_points(nav, from, to)?;
        Ok(vlerp(&portal.left, &portal.right, 0.5))
    }

    /// Casts a ray along the mesh surface from `start_pos` towards `end_pos`
    ///
    /// The ray is cast in 2D; `hit.t` is `f32::MAX` when the end point is
    /// reached. Off-mesh connections are never followed. `prev_ref` is the
    /// polygon the ray conceptually comes from and only affects costs.
    #[allow(clippy::too_many_arguments)]
    pub fn raycast(
        &self,
        nav: &NavMesh,
        start_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: &dyn QueryFilter,
        options: RaycastOptions,
        prev_ref: PolyRef,
    ) -> QueryResult<RaycastHit> {
        if !nav.is_valid_poly_ref(start_ref)
            || !visfinite(start_pos)
            || !visfinite(end_pos)
            || (!prev_ref.is_null() && !nav.is_valid_poly_ref(prev_ref))
        {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }

        let mut hit = RaycastHit::default();
        let dir = vsub(end_pos, start_pos);
        let mut cur_pos = *start_pos;

        let mut cur_ref = start_ref;
        let (mut tile, mut poly) = nav.get_tile_and_poly_by_ref_unsafe(cur_ref);
        let mut prev = if prev_ref.is_null() {
            None
        } else {
            let (t, p) = nav.get_tile_and_poly_by_ref_unsafe(prev_ref);
            Some(PolyContext::new(prev_ref, t, p))
        };

        loop {
            let (verts, nv) = tile.poly_vertices(poly);
            let cur = PolyContext::new(cur_ref, tile, poly);

            let Some(isect) = intersect_segment_poly_2d(start_pos, end_pos, &verts, nv) else {
                // Could not hit the polygon, keep the old t and report hit.
                return Ok(hit);
            };

            hit.hit_edge_index = isect.seg_max;
            if isect.tmax > hit.t {
                hit.t = isect.tmax;
            }
            hit.path.push(cur_ref);

            // Ray end is inside the polygon.
            if isect.seg_max == -1 {
                hit.t = f32::MAX;
                if options.contains(RaycastOptions::USE_COSTS) {
                    hit.path_cost += filter.get_cost(&cur_pos, end_pos, prev, cur, Some(cur));
                }
                return Ok(hit);
            }

            let seg_max = isect.seg_max as usize;
            let next = next_poly_along_ray(nav, tile, cur_ref, poly, seg_max, start_pos, end_pos, isect.tmax, filter);

            if options.contains(RaycastOptions::USE_COSTS) {
                // Intersection at the far end of the polygon, with the height
                // taken from the exit edge since the ray is cast in 2D.
                let last_pos = cur_pos;
                cur_pos = vmad(start_pos, &dir, hit.t);
                let e1 = &verts[seg_max * 3..seg_max * 3 + 3];
                let e2_idx = (seg_max + 1) % nv;
                let e2 = &verts[e2_idx * 3..e2_idx * 3 + 3];
                let edge_dir = vsub(e2, e1);
                let diff = vsub(&cur_pos, e1);
                let s = if sqr(edge_dir[0]) > sqr(edge_dir[2]) {
                    diff[0] / edge_dir[0]
                } else {
                    diff[2] / edge_dir[2]
                };
                cur_pos[1] = e1[1] + edge_dir[1] * s;

                hit.path_cost += filter.get_cost(&last_pos, &cur_pos, prev, cur, next);
            }

            let Some(next) = next else {
                // No neighbour, the ray hit a wall.
                let a = seg_max;
                let b = if seg_max + 1 < nv { seg_max + 1 } else { 0 };
                let dx = verts[b * 3] - verts[a * 3];
                let dz = verts[b * 3 + 2] - verts[a * 3 + 2];
                hit.hit_normal = vnormalize(&[dz, 0.0, -dx]);
                return Ok(hit);
            };

            prev = Some(cur);
            cur_ref = next.poly_ref;
            tile = next.tile;
            poly = next.poly;
        }
    }
}

/// Validated query box around a center point
fn search_box(center: &[f32; 3], half_extents: &[f32; 3]) -> QueryResult<([f32; 3], [f32; 3])> {
    if !visfinite(center)
        || !visfinite(half_extents)
        || half_extents.iter().any(|&e| e < 0.0)
    {
        return Err(Status::FAILURE | Status::INVALID_PARAM);
    }
    Ok((vsub(center, half_extents), navtile_common::vadd(center, half_extents)))
}

/// Runs a box query on one tile, reporting results in batches
fn query_polygons_in_tile(
    tile: &MeshTile,
    qmin: &[f32; 3],
    qmax: &[f32; 3],
    filter: &dyn QueryFilter,
    query: &mut dyn PolyQuery,
) {
    let base = tile.poly_ref_base();
    let mut refs: Vec<PolyRef> = Vec::with_capacity(QUERY_BATCH_SIZE);
    let mut polys: Vec<&Poly> = Vec::with_capacity(QUERY_BATCH_SIZE);

    for ip in tile.polys_overlapping(qmin, qmax) {
        let poly = &tile.data.polys[ip];
        let r = base.with_poly(ip as u32);
        if !filter.pass_filter(r, tile, poly) {
            continue;
        }

        refs.push(r);
        polys.push(poly);
        if refs.len() == QUERY_BATCH_SIZE {
            query.process(tile, &polys, &refs);
            refs.clear();
            polys.clear();
        }
    }

    if !refs.is_empty() {
        query.process(tile, &polys, &refs);
    }
}

/// Portal between two polygons that share a link
pub(crate) fn portal_between(
    from: PolyContext<'_>,
    to: PolyContext<'_>,
) -> QueryResult<([f32; 3], [f32; 3])> {
    let invalid = Status::FAILURE | Status::INVALID_PARAM;

    let link = from
        .tile
        .links_of(from.poly_ref.poly() as usize)
        .find(|l| l.reference == to.poly_ref)
        .ok_or(invalid)?;

    if from.poly.is_off_mesh_connection() {
        let v = from.tile.poly_vert(from.poly, link.edge as usize);
        return Ok((v, v));
    }

    if to.poly.is_off_mesh_connection() {
        let back = to
            .tile
            .links_of(to.poly_ref.poly() as usize)
            .find(|l| l.reference == from.poly_ref)
            .ok_or(invalid)?;
        let v = to.tile.poly_vert(to.poly, back.edge as usize);
        return Ok((v, v));
    }

    let edge = link.edge as usize;
    let v0 = from.tile.poly_vert(from.poly, edge);
    let v1 = from.tile.poly_vert(from.poly, (edge + 1) % from.poly.nverts());

    // Tile border links may cover only part of the edge.
    if link.side != 0xff && (link.bmin != 0 || link.bmax != 255) {
        let s = 1.0 / 255.0;
        let tmin = link.bmin as f32 * s;
        let tmax = link.bmax as f32 * s;
        return Ok((vlerp(&v0, &v1, tmin), vlerp(&v0, &v1, tmax)));
    }

    Ok((v0, v1))
}

/// Point where the segment `from_pos -> to_pos` crosses the portal, kept
/// away from the portal ends
fn edge_intersection_point(
    from_pos: &[f32; 3],
    from: PolyContext<'_>,
    to_pos: &[f32; 3],
    to: PolyContext<'_>,
) -> QueryResult<[f32; 3]> {
    let (left, right) = portal_between(from, to).map_err(|_| Status::FAILURE)?;
    let t = match intersect_seg_seg_2d(from_pos, to_pos, &left, &right) {
        Some((_, t)) => t.clamp(0.1, 0.9),
        None => 0.5,
    };
    Ok(vlerp(&left, &right, t))
}

/// Polygon the ray enters when leaving `poly` through edge `edge`
#[allow(clippy::too_many_arguments)]
fn next_poly_along_ray<'m>(
    nav: &'m NavMesh,
    tile: &'m MeshTile,
    cur_ref: PolyRef,
    poly: &'m Poly,
    edge: usize,
    start_pos: &[f32; 3],
    end_pos: &[f32; 3],
    tmax: f32,
    filter: &dyn QueryFilter,
) -> Option<PolyContext<'m>> {
    for link in tile.links_of(cur_ref.poly() as usize) {
        if link.edge as usize != edge || link.reference.is_null() {
            continue;
        }

        let (next_tile, next_poly) = nav.get_tile_and_poly_by_ref_unsafe(link.reference);
        if next_poly.is_off_mesh_connection() {
            continue;
        }
        if !filter.pass_filter(link.reference, next_tile, next_poly) {
            continue;
        }
        let next = PolyContext::new(link.reference, next_tile, next_poly);

        // Internal links and border links spanning the whole edge.
        if link.side == 0xff || (link.bmin == 0 && link.bmax == 255) {
            return Some(next);
        }

        // Partial border link: the crossing must lie inside the portal.
        let left = tile.poly_vert(poly, link.edge as usize);
        let right = tile.poly_vert(poly, (link.edge as usize + 1) % poly.nverts());
        let axis = match link.side {
            0 | 4 => 2,
            2 | 6 => 0,
            _ => continue,
        };
        let s = 1.0 / 255.0;
        let mut lmin = left[axis] + (right[axis] - left[axis]) * (link.bmin as f32 * s);
        let mut lmax = left[axis] + (right[axis] - left[axis]) * (link.bmax as f32 * s);
        if lmin > lmax {
            std::mem::swap(&mut lmin, &mut lmax);
        }
        let crossing = start_pos[axis] + (end_pos[axis] - start_pos[axis]) * tmax;
        if crossing >= lmin && crossing <= lmax {
            return Some(next);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_mesh_helpers::{create_grid_mesh, create_tiled_mesh, grid_poly_ref};
    use crate::DefaultQueryFilter;
    use navtile_common::Result;

    #[test]
    fn test_find_nearest_poly() -> Result<()> {
        let mesh = create_grid_mesh(3, 1.0)?;
        let query = NavMeshQuery::new(256);
        let filter = DefaultQueryFilter::default();

        let nearest = query.find_nearest_poly(&mesh, &[1.5, 0.5, 2.5], &[0.5, 1.0, 0.5], &filter)?;
        assert!(nearest.found());
        assert_eq!(nearest.poly_ref, grid_poly_ref(&mesh, 0, 0, 3, 1, 2));
        assert!(nearest.is_over_poly);
        assert_eq!(nearest.point, [1.5, 0.0, 2.5]);

        let nothing = query.find_nearest_poly(&mesh, &[50.0, 0.0, 50.0], &[1.0, 1.0, 1.0], &filter)?;
        assert!(!nothing.found());
        Ok(())
    }

    #[test]
    fn test_find_nearest_poly_rejects_bad_input() -> Result<()> {
        let mesh = create_grid_mesh(2, 1.0)?;
        let query = NavMeshQuery::new(64);
        let filter = DefaultQueryFilter::default();

        let err = query
            .find_nearest_poly(&mesh, &[f32::NAN, 0.0, 0.0], &[1.0, 1.0, 1.0], &filter)
            .unwrap_err();
        assert!(err.is_failure());
        assert!(err.has_detail(Status::INVALID_PARAM));

        assert!(query
            .find_nearest_poly(&mesh, &[0.5, 0.0, 0.5], &[-1.0, 1.0, 1.0], &filter)
            .is_err());
        Ok(())
    }

    #[test]
    fn test_query_polygons_collect() -> Result<()> {
        let mesh = create_grid_mesh(4, 1.0)?;
        let query = NavMeshQuery::new(64);
        let filter = DefaultQueryFilter::default();

        // The BV tree works on quantized bounds, so neighbours of the touched
        // cells may be reported as well.
        let (polys, status) =
            query.query_polygons_collect(&mesh, &[2.0, 0.0, 2.0], &[0.5, 1.0, 0.5], &filter, 16)?;
        for (x, z) in [(1, 1), (1, 2), (2, 1), (2, 2)] {
            assert!(polys.contains(&grid_poly_ref(&mesh, 0, 0, 4, x, z)));
        }
        assert!(!status.has_detail(Status::BUFFER_TOO_SMALL));

        let (polys, status) =
            query.query_polygons_collect(&mesh, &[2.0, 0.0, 2.0], &[5.0, 1.0, 5.0], &filter, 10)?;
        assert_eq!(polys.len(), 10);
        assert!(status.has_detail(Status::BUFFER_TOO_SMALL));
        Ok(())
    }

    #[test]
    fn test_query_tiles() -> Result<()> {
        let mesh = create_tiled_mesh(3, 3, 2, 1.0)?;
        let query = NavMeshQuery::new(64);

        let tiles = query.query_tiles(&mesh, &[3.0, 0.0, 3.0], &[0.5, 1.0, 0.5])?;
        assert_eq!(tiles.len(), 1);
        assert_eq!((tiles[0].header().x, tiles[0].header().y), (1, 1));

        let tiles = query.query_tiles(&mesh, &[2.0, 0.0, 2.0], &[0.5, 1.0, 0.5])?;
        assert_eq!(tiles.len(), 4);
        Ok(())
    }

    #[test]
    fn test_closest_point_on_poly_boundary() -> Result<()> {
        let mesh = create_grid_mesh(1, 2.0)?;
        let query = NavMeshQuery::new(64);
        let r = grid_poly_ref(&mesh, 0, 0, 1, 0, 0);

        let inside = query.closest_point_on_poly_boundary(&mesh, r, &[1.0, 0.0, 1.0])?;
        assert_eq!(inside, [1.0, 0.0, 1.0]);

        let outside = query.closest_point_on_poly_boundary(&mesh, r, &[3.0, 0.0, 1.0])?;
        assert!((outside[0] - 2.0).abs() < 1e-5);
        assert!((outside[2] - 1.0).abs() < 1e-5);

        assert!(query
            .closest_point_on_poly_boundary(&mesh, PolyRef::NULL, &[0.0; 3])
            .is_err());
        Ok(())
    }

    #[test]
    fn test_get_poly_height() -> Result<()> {
        let mesh = create_grid_mesh(2, 1.0)?;
        let query = NavMeshQuery::new(64);
        let r = grid_poly_ref(&mesh, 0, 0, 2, 0, 0);

        assert_eq!(query.get_poly_height(&mesh, r, &[0.5, 3.0, 0.5])?, 0.0);

        let err = query.get_poly_height(&mesh, r, &[1.5, 0.0, 1.5]).unwrap_err();
        assert!(err.has_detail(Status::INVALID_PARAM));
        Ok(())
    }

    #[test]
    fn test_portal_and_mid_point() -> Result<()> {
        let mesh = create_grid_mesh(2, 1.0)?;
        let query = NavMeshQuery::new(64);
        let a = grid_poly_ref(&mesh, 0, 0, 2, 0, 0);
        let b = grid_poly_ref(&mesh, 0, 0, 2, 1, 0);

        let portal = query.get_portal_points(&mesh, a, b)?;
        assert_eq!(portal.left[0], 1.0);
        assert_eq!(portal.right[0], 1.0);
        assert_eq!(portal.from_type, PolyType::Ground);

        let mid = query.get_edge_mid_point(&mesh, a, b)?;
        assert_eq!(mid, [1.0, 0.0, 0.5]);

        // Diagonal cells share no edge.
        let c = grid_poly_ref(&mesh, 0, 0, 2, 1, 1);
        assert!(query.get_portal_points(&mesh, a, c).is_err());
        Ok(())
    }

    #[test]
    fn test_is_valid_poly_ref_with_filter() -> Result<()> {
        let mut mesh = create_grid_mesh(2, 1.0)?;
        let query = NavMeshQuery::new(64);
        let filter = DefaultQueryFilter::default();
        let r = grid_poly_ref(&mesh, 0, 0, 2, 0, 0);

        assert!(query.is_valid_poly_ref(&mesh, r, &filter));
        mesh.set_poly_flags(r, crate::PolyFlags::empty())?;
        assert!(!query.is_valid_poly_ref(&mesh, r, &filter));
        assert!(!query.is_valid_poly_ref(&mesh, PolyRef::NULL, &filter));
        Ok(())
    }
}
