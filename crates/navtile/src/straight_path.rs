//! String pulling of polygon corridors
//!
//! Turns the corridor returned by a path search into the corner points an
//! agent actually walks through, using the simple stupid funnel algorithm.

use navtile_common::{dist_pt_seg_sqr_2d, intersect_seg_seg_2d, sqr, tri_area_2d, visfinite, vequal, vlerp};

use super::nav_mesh::NavMesh;
use super::nav_mesh_query::NavMeshQuery;
use super::status::{QueryResult, Status};
use super::{PolyRef, PolyType};

bitflags::bitflags! {
    /// Describes a point of a straight path
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StraightPathFlags: u8 {
        /// The point is the start position
        const START = 0x01;
        /// The point is the end position
        const END = 0x02;
        /// The point is the start of an off-mesh connection
        const OFFMESH_CONNECTION = 0x04;
    }
}

bitflags::bitflags! {
    /// Extra points to emit while string pulling
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StraightPathOptions: u32 {
        /// Add a point at every portal where the area changes
        const AREA_CROSSINGS = 0x01;
        /// Add a point at every portal
        const ALL_CROSSINGS = 0x02;
    }
}

/// Corner of a straight path
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StraightPathPoint {
    pub pos: [f32; 3],
    pub flags: StraightPathFlags,
    /// Polygon entered at this point, null for the end point
    pub poly_ref: PolyRef,
}

/// Result of [`NavMeshQuery::find_straight_path`]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StraightPath {
    pub points: Vec<StraightPathPoint>,
    /// `BUFFER_TOO_SMALL` is set when the output limit cut the path short.
    /// A corridor that breaks part way yields `FAILURE | INVALID_PARAM`
    /// together with the points up to the break.
    pub status: Status,
}

impl StraightPath {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Positions only
    pub fn positions(&self) -> Vec<[f32; 3]> {
        self.points.iter().map(|p| p.pos).collect()
    }
}

/// Output buffer with the append rules of the funnel
struct PathWriter {
    points: Vec<StraightPathPoint>,
    max_points: usize,
}

impl PathWriter {
    /// Appends a point, merging it with the previous one when they coincide
    ///
    /// Returns `IN_PROGRESS` while more points can be written.
    fn append(&mut self, pos: [f32; 3], flags: StraightPathFlags, poly_ref: PolyRef) -> Status {
        if let Some(last) = self.points.last_mut() {
            if vequal(&last.pos, &pos) {
                last.flags = flags;
                last.poly_ref = poly_ref;
                return Status::IN_PROGRESS;
            }
        }

        self.points.push(StraightPathPoint { pos, flags, poly_ref });

        if self.points.len() >= self.max_points {
            return Status::SUCCESS | Status::BUFFER_TOO_SMALL;
        }
        if flags == StraightPathFlags::END {
            return Status::SUCCESS;
        }
        Status::IN_PROGRESS
    }

    fn is_full(&self) -> bool {
        self.points.len() >= self.max_points
    }

    fn last_pos(&self) -> [f32; 3] {
        self.points.last().map_or([0.0; 3], |p| p.pos)
    }
}

impl NavMeshQuery {
    /// Finds the corners of the straight path through a corridor
    ///
    /// The start and end positions are clamped to the first and last
    /// polygon of the corridor. At most `max_points` points are written.
    pub fn find_straight_path(
        &self,
        nav: &NavMesh,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        path: &[PolyRef],
        max_points: usize,
        options: StraightPathOptions,
    ) -> QueryResult<StraightPath> {
        if !visfinite(start_pos)
            || !visfinite(end_pos)
            || path.is_empty()
            || path[0].is_null()
            || max_points == 0
        {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }

        let invalid = |_| Status::FAILURE | Status::INVALID_PARAM;
        let closest_start = self
            .closest_point_on_poly_boundary(nav, path[0], start_pos)
            .map_err(invalid)?;
        let mut closest_end = self
            .closest_point_on_poly_boundary(nav, path[path.len() - 1], end_pos)
            .map_err(invalid)?;

        let mut out = PathWriter {
            points: Vec::with_capacity(max_points.min(path.len() + 2)),
            max_points,
        };
        let crossings = options.intersects(StraightPathOptions::AREA_CROSSINGS | StraightPathOptions::ALL_CROSSINGS);

        let stat = out.append(closest_start, StraightPathFlags::START, path[0]);
        if !stat.is_in_progress() {
            return Ok(StraightPath { points: out.points, status: stat });
        }

        if path.len() > 1 {
            let mut portal_apex = closest_start;
            let mut portal_left = portal_apex;
            let mut portal_right = portal_apex;
            let mut apex_index = 0;
            let mut left_index = 0;
            let mut right_index = 0;
            let mut left_poly_type = PolyType::Ground;
            let mut right_poly_type = PolyType::Ground;
            let mut left_poly_ref = path[0];
            let mut right_poly_ref = path[0];

            let mut i = 0;
            while i < path.len() {
                let (left, right, to_type) = if i + 1 < path.len() {
                    let portal = match self.get_portal_points(nav, path[i], path[i + 1]) {
                        Ok(portal) => portal,
                        Err(_) => {
                            // path[i + 1] is not adjacent anymore: clamp the end
                            // to path[i] and return what was found so far.
                            closest_end = self
                                .closest_point_on_poly_boundary(nav, path[i], end_pos)
                                .map_err(invalid)?;
                            if crossings {
                                self.append_portals(nav, &mut out, apex_index, i, &closest_end, path, options);
                            }
                            out.append(closest_end, StraightPathFlags::empty(), path[i]);

                            let mut status = Status::FAILURE | Status::INVALID_PARAM;
                            if out.is_full() {
                                status |= Status::BUFFER_TOO_SMALL;
                            }
                            return Ok(StraightPath { points: out.points, status });
                        }
                    };

                    // Starting right on the first portal, skip it.
                    if i == 0 {
                        let (d, _) = dist_pt_seg_sqr_2d(&portal_apex, &portal.left, &portal.right);
                        if d < sqr(0.001) {
                            i += 1;
                            continue;
                        }
                    }
                    (portal.left, portal.right, portal.to_type)
                } else {
                    (closest_end, closest_end, PolyType::Ground)
                };

                // Right vertex.
                if tri_area_2d(&portal_apex, &portal_right, &right) <= 0.0 {
                    if vequal(&portal_apex, &portal_right) || tri_area_2d(&portal_apex, &portal_left, &right) > 0.0 {
                        portal_right = right;
                        right_poly_ref = path.get(i + 1).copied().unwrap_or(PolyRef::NULL);
                        right_poly_type = to_type;
                        right_index = i;
                    } else {
                        // Right over left, the left point becomes the new apex.
                        if crossings {
                            let stat =
                                self.append_portals(nav, &mut out, apex_index, left_index, &portal_left, path, options);
                            if !stat.is_in_progress() {
                                return Ok(StraightPath { points: out.points, status: stat });
                            }
                        }

                        portal_apex = portal_left;
                        apex_index = left_index;

                        let stat = out.append(portal_apex, corner_flags(left_poly_ref, left_poly_type), left_poly_ref);
                        if !stat.is_in_progress() {
                            return Ok(StraightPath { points: out.points, status: stat });
                        }

                        portal_left = portal_apex;
                        portal_right = portal_apex;
                        left_index = apex_index;
                        right_index = apex_index;

                        i = apex_index + 1;
                        continue;
                    }
                }

                // Left vertex.
                if tri_area_2d(&portal_apex, &portal_left, &left) >= 0.0 {
                    if vequal(&portal_apex, &portal_left) || tri_area_2d(&portal_apex, &portal_right, &left) < 0.0 {
                        portal_left = left;
                        left_poly_ref = path.get(i + 1).copied().unwrap_or(PolyRef::NULL);
                        left_poly_type = to_type;
                        left_index = i;
                    } else {
                        // Left over right, the right point becomes the new apex.
                        if crossings {
                            let stat =
                                self.append_portals(nav, &mut out, apex_index, right_index, &portal_right, path, options);
                            if !stat.is_in_progress() {
                                return Ok(StraightPath { points: out.points, status: stat });
                            }
                        }

                        portal_apex = portal_right;
                        apex_index = right_index;

                        let stat =
                            out.append(portal_apex, corner_flags(right_poly_ref, right_poly_type), right_poly_ref);
                        if !stat.is_in_progress() {
                            return Ok(StraightPath { points: out.points, status: stat });
                        }

                        portal_left = portal_apex;
                        portal_right = portal_apex;
                        left_index = apex_index;
                        right_index = apex_index;

                        i = apex_index + 1;
                        continue;
                    }
                }

                i += 1;
            }

            if crossings {
                let stat =
                    self.append_portals(nav, &mut out, apex_index, path.len() - 1, &closest_end, path, options);
                if !stat.is_in_progress() {
                    return Ok(StraightPath { points: out.points, status: stat });
                }
            }
        }

        out.append(closest_end, StraightPathFlags::END, PolyRef::NULL);
        let status = if out.is_full() {
            Status::SUCCESS | Status::BUFFER_TOO_SMALL
        } else {
            Status::SUCCESS
        };
        Ok(StraightPath { points: out.points, status })
    }

    /// Appends the portal crossings of the segment from the last point to
    /// `end_pos`, for the corridor polygons `start_idx..end_idx`
    #[allow(clippy::too_many_arguments)]
    fn append_portals(
        &self,
        nav: &NavMesh,
        out: &mut PathWriter,
        start_idx: usize,
        end_idx: usize,
        end_pos: &[f32; 3],
        path: &[PolyRef],
        options: StraightPathOptions,
    ) -> Status {
        let start_pos = out.last_pos();

        for i in start_idx..end_idx {
            let from = path[i];
            let to = path[i + 1];
            let (Ok((_, from_poly)), Ok((_, to_poly))) =
                (nav.get_tile_and_poly_by_ref(from), nav.get_tile_and_poly_by_ref(to))
            else {
                return Status::FAILURE | Status::INVALID_PARAM;
            };

            let Ok(portal) = self.get_portal_points(nav, from, to) else {
                break;
            };

            if options.contains(StraightPathOptions::AREA_CROSSINGS) && from_poly.area == to_poly.area
            {
                continue;
            }

            if let Some((_, t)) = intersect_seg_seg_2d(&start_pos, end_pos, &portal.left, &portal.right) {
                let pt = vlerp(&portal.left, &portal.right, t);
                let stat = out.append(pt, StraightPathFlags::empty(), to);
                if !stat.is_in_progress() {
                    return stat;
                }
            }
        }

        Status::IN_PROGRESS
    }
}

fn corner_flags(poly_ref: PolyRef, poly_type: PolyType) -> StraightPathFlags {
    if poly_ref.is_null() {
        StraightPathFlags::END
    } else if poly_type == PolyType::OffMeshConnection {
        StraightPathFlags::OFFMESH_CONNECTION
    } else {
        StraightPathFlags::empty()
    }
}
