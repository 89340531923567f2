//! Callbacks for polygon box queries
//!
//! [`NavMeshQuery::query_polygons`](crate::NavMeshQuery::query_polygons)
//! reports the polygons it finds in batches, one or more per tile.

use super::nav_mesh::{MeshTile, NavMesh, Poly};
use super::PolyRef;

/// Receives the polygons found by a box query
pub trait PolyQuery {
    /// Called for each batch of unique polygons touched by the search area.
    /// A single query may call this several times.
    fn process(&mut self, tile: &MeshTile, polys: &[&Poly], refs: &[PolyRef]);
}

/// Collects polygon references up to a fixed count
#[derive(Debug, Clone)]
pub struct CollectPolysQuery {
    polys: Vec<PolyRef>,
    max_polys: usize,
    overflow: bool,
}

impl CollectPolysQuery {
    pub fn new(max_polys: usize) -> Self {
        Self {
            polys: Vec::with_capacity(max_polys.min(1024)),
            max_polys,
            overflow: false,
        }
    }

    pub fn polys(&self) -> &[PolyRef] {
        &self.polys
    }

    pub fn into_polys(self) -> Vec<PolyRef> {
        self.polys
    }

    pub fn num_collected(&self) -> usize {
        self.polys.len()
    }

    /// True if more polygons were found than could be stored
    pub fn overflow(&self) -> bool {
        self.overflow
    }

    pub fn clear(&mut self) {
        self.polys.clear();
        self.overflow = false;
    }
}

impl PolyQuery for CollectPolysQuery {
    fn process(&mut self, _tile: &MeshTile, _polys: &[&Poly], refs: &[PolyRef]) {
        let remaining = self.max_polys.saturating_sub(self.polys.len());
        if remaining < refs.len() {
            self.overflow = true;
            self.polys.extend_from_slice(&refs[..remaining]);
        } else {
            self.polys.extend_from_slice(refs);
        }
    }
}

/// Tracks the polygon nearest to a point
///
/// A point directly above a polygon and within the tile's climb height
/// scores zero, so it wins over polygons that are closer in a straight line.
pub struct FindNearestPolyQuery<'m> {
    nav: &'m NavMesh,
    center: [f32; 3],
    nearest_distance_sqr: f32,
    nearest_ref: PolyRef,
    nearest_point: [f32; 3],
    over_poly: bool,
}

impl<'m> FindNearestPolyQuery<'m> {
    pub fn new(nav: &'m NavMesh, center: &[f32; 3]) -> Self {
        Self {
            nav,
            center: *center,
            nearest_distance_sqr: f32::MAX,
            nearest_ref: PolyRef::NULL,
            nearest_point: *center,
            over_poly: false,
        }
    }

    pub fn nearest_ref(&self) -> PolyRef {
        self.nearest_ref
    }

    pub fn nearest_point(&self) -> &[f32; 3] {
        &self.nearest_point
    }

    /// True if the nearest point is directly over the polygon
    pub fn is_over_poly(&self) -> bool {
        self.over_poly
    }

    pub fn nearest_distance_sqr(&self) -> f32 {
        self.nearest_distance_sqr
    }
}

impl PolyQuery for FindNearestPolyQuery<'_> {
    fn process(&mut self, tile: &MeshTile, _polys: &[&Poly], refs: &[PolyRef]) {
        let climb = tile.header().walkable_climb;
        for &poly_ref in refs {
            let (closest, over_poly) = self.nav.closest_point_on_poly(poly_ref, &self.center);
            let diff = [
                self.center[0] - closest[0],
                self.center[1] - closest[1],
                self.center[2] - closest[2],
            ];

            let d = if over_poly {
                let dy = diff[1].abs() - climb;
                if dy > 0.0 {
                    dy * dy
                } else {
                    0.0
                }
            } else {
                diff[0] * diff[0] + diff[1] * diff[1] + diff[2] * diff[2]
            };

            if d < self.nearest_distance_sqr {
                self.nearest_distance_sqr = d;
                self.nearest_ref = poly_ref;
                self.nearest_point = closest;
                self.over_poly = over_poly;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_mesh_helpers::create_grid_mesh;
    use navtile_common::Result;

    #[test]
    fn test_collect_polys_query() -> Result<()> {
        let mesh = create_grid_mesh(1, 1.0)?;
        let tile = mesh.tiles().next().unwrap();
        let mut query = CollectPolysQuery::new(10);

        let refs = vec![PolyRef::new(1), PolyRef::new(2), PolyRef::new(3)];
        query.process(tile, &[], &refs);
        assert_eq!(query.num_collected(), 3);
        assert!(!query.overflow());
        assert_eq!(query.polys(), &refs[..]);

        let more_refs: Vec<_> = (4..20).map(PolyRef::new).collect();
        query.process(tile, &[], &more_refs);
        assert_eq!(query.num_collected(), 10);
        assert!(query.overflow());

        query.clear();
        assert_eq!(query.num_collected(), 0);
        assert!(!query.overflow());
        Ok(())
    }

    #[test]
    fn test_find_nearest_prefers_poly_below() -> Result<()> {
        let mesh = create_grid_mesh(2, 1.0)?;
        let tile = mesh.tiles().next().unwrap();
        let base = tile.poly_ref_base();
        let refs: Vec<_> = (0..4).map(|i| base.with_poly(i)).collect();

        let mut query = FindNearestPolyQuery::new(&mesh, &[1.5, 0.5, 0.5]);
        query.process(tile, &[], &refs);
        assert_eq!(query.nearest_ref(), base.with_poly(1));
        assert!(query.is_over_poly());
        assert_eq!(query.nearest_distance_sqr(), 0.0);
        assert_eq!(query.nearest_point()[1], 0.0);
        Ok(())
    }
}
