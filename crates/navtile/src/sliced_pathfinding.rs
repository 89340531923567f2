//! Time-sliced path searches
//!
//! A sliced search runs the same A* as [`NavMeshQuery::find_path`] but
//! expands at most a caller chosen number of nodes per update, so long
//! searches can be spread over several frames. Tiles may be added or removed
//! between updates; the search fails once a polygon it depends on is gone.

use super::nav_mesh::NavMesh;
use super::nav_mesh_query::{FindPathOptions, NavMeshQuery, PathSearch, PolyPath};
use super::query_filter::QueryFilter;
use super::status::{QueryResult, Status};
use super::PolyRef;

/// In-flight sliced search owned by a [`NavMeshQuery`]
pub struct SlicedFindPathState {
    pub(crate) search: PathSearch,
    pub(crate) filter: Box<dyn QueryFilter + Send>,
}

impl SlicedFindPathState {
    pub fn status(&self) -> Status {
        self.search.status
    }

    pub fn start_ref(&self) -> PolyRef {
        self.search.start_ref
    }

    pub fn end_ref(&self) -> PolyRef {
        self.search.end_ref
    }
}

impl std::fmt::Debug for SlicedFindPathState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlicedFindPathState")
            .field("search", &self.search)
            .finish_non_exhaustive()
    }
}

impl NavMeshQuery {
    /// Starts a sliced path search
    ///
    /// The filter is copied into the query and used by every update. Returns
    /// `IN_PROGRESS`, or `SUCCESS` when start and end are the same polygon.
    #[allow(clippy::too_many_arguments)]
    pub fn init_sliced_find_path<F>(
        &mut self,
        nav: &NavMesh,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: &[f32; 3],
        end_pos: &[f32; 3],
        filter: &F,
        options: FindPathOptions,
        raycast_limit: f32,
    ) -> QueryResult<Status>
    where
        F: QueryFilter + Clone + Send + 'static,
    {
        self.sliced = None;

        let mut search =
            self.begin_path_search(nav, start_ref, end_ref, start_pos, end_pos, options, raycast_limit)?;
        search.status = if start_ref == end_ref {
            Status::SUCCESS
        } else {
            Status::IN_PROGRESS
        };

        let status = search.status;
        self.sliced = Some(SlicedFindPathState {
            search,
            filter: Box::new(filter.clone()),
        });
        Ok(status)
    }

    /// Expands up to `max_iter` nodes of the running search
    ///
    /// Returns the search status and the number of nodes expanded. Without
    /// a running search the status is `FAILURE`.
    pub fn update_sliced_find_path(&mut self, nav: &NavMesh, max_iter: usize) -> (Status, usize) {
        let Some(mut state) = self.sliced.take() else {
            return (Status::FAILURE, 0);
        };

        let result = self.run_slice(nav, &mut state, max_iter);
        self.sliced = Some(state);
        result
    }

    fn run_slice(
        &mut self,
        nav: &NavMesh,
        state: &mut SlicedFindPathState,
        max_iter: usize,
    ) -> (Status, usize) {
        let search = &mut state.search;
        if !search.status.is_in_progress() {
            return (search.status, 0);
        }

        if !nav.is_valid_poly_ref(search.start_ref) || !nav.is_valid_poly_ref(search.end_ref) {
            log::debug!("sliced search endpoints vanished, failing the search");
            search.status = Status::FAILURE;
            return (search.status, 0);
        }

        let mut iter = 0;
        while iter < max_iter && !self.open_list.is_empty() {
            iter += 1;
            match self.expand_best_node(nav, state.filter.as_ref(), search) {
                Ok(true) => {
                    search.status = Status::SUCCESS | search.status.detail();
                    return (search.status, iter);
                }
                Ok(false) => {}
                Err(_) => {
                    log::debug!("polygon removed during sliced search, failing the search");
                    search.status = Status::FAILURE;
                    return (search.status, iter);
                }
            }
        }

        // Exhausted all nodes without reaching the end.
        if self.open_list.is_empty() {
            search.status = Status::SUCCESS | search.status.detail();
        }

        (search.status, iter)
    }

    /// Ends the sliced search and returns its corridor
    ///
    /// The corridor leads to the end polygon, or to the visited polygon
    /// nearest to it with `PARTIAL_RESULT` set.
    pub fn finalize_sliced_find_path(&mut self) -> QueryResult<PolyPath> {
        let state = self.sliced.take().ok_or(Status::FAILURE)?;
        let search = state.search;
        if search.status.is_failure() {
            return Err(Status::FAILURE);
        }

        if search.start_ref == search.end_ref {
            return Ok(PolyPath {
                polys: vec![search.start_ref],
                status: Status::SUCCESS | search.status.detail(),
            });
        }

        Ok(self.finish_path_search(&search))
    }

    /// Ends an unfinished sliced search, reusing as much of an existing
    /// corridor as the search has explored
    ///
    /// Returns the path to the furthest polygon of `existing` that was
    /// visited, or to the best node found with `PARTIAL_RESULT` when none was.
    pub fn finalize_sliced_find_path_partial(&mut self, existing: &[PolyRef]) -> QueryResult<PolyPath> {
        if existing.is_empty() {
            return Err(Status::FAILURE | Status::INVALID_PARAM);
        }

        let state = self.sliced.take().ok_or(Status::FAILURE)?;
        let search = state.search;
        if search.status.is_failure() {
            return Err(Status::FAILURE);
        }

        let mut status = Status::SUCCESS | search.status.detail();
        if search.start_ref == search.end_ref {
            return Ok(PolyPath {
                polys: vec![search.start_ref],
                status,
            });
        }

        let visited = existing
            .iter()
            .rev()
            .find_map(|&r| self.node_pool.find_node(r, 0));
        let node = match visited {
            Some(idx) => idx,
            None => {
                status |= Status::PARTIAL_RESULT;
                search.last_best.ok_or(Status::FAILURE)?
            }
        };

        Ok(PolyPath {
            polys: self.get_path_to_node(node),
            status,
        })
    }

    /// Status of the running sliced search, if any
    pub fn sliced_find_path_status(&self) -> Option<Status> {
        self.sliced.as_ref().map(|s| s.status())
    }

    /// Drops the running sliced search
    pub fn cancel_sliced_find_path(&mut self) {
        self.sliced = None;
    }
}
