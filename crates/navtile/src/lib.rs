//! Tile-based navigation meshes and the queries that run on them
//!
//! A [`NavMesh`] is a fixed capacity store of tiles. Each tile carries its own
//! vertices, polygons, detail triangles, off-mesh connections and a quantized
//! bounding volume tree. Tiles are produced by [`create_nav_mesh_data`] from a
//! polygon mesh and can be added to and removed from a mesh at runtime; the
//! mesh links polygons across tile borders as tiles come and go.
//!
//! Polygons are addressed through [`PolyRef`] handles. A handle packs a salt,
//! a tile slot and a polygon index, so a handle issued for a tile that has
//! since been removed is detected as stale instead of aliasing whatever tile
//! reuses the slot.
//!
//! [`NavMeshQuery`] implements the search algorithms: nearest polygon lookup,
//! A* (optionally any-angle and optionally time-sliced), string pulling,
//! raycasts, flood fills bounded by a circle or a convex shape, wall distance
//! and random sampling.
//!
//! # Example
//!
//! ```rust,ignore
//! use navtile::{NavMesh, NavMeshQuery, DefaultQueryFilter, FindPathOptions};
//!
//! let mut mesh = NavMesh::new(params)?;
//! mesh.add_tile(create_nav_mesh_data(&create_params)?, 0, PolyRef::NULL)?;
//!
//! let mut query = NavMeshQuery::new(2048);
//! let filter = DefaultQueryFilter::default();
//! let start = query.find_nearest_poly(&mesh, &start_pos, &[2.0, 4.0, 2.0], &filter)?;
//! let end = query.find_nearest_poly(&mesh, &end_pos, &[2.0, 4.0, 2.0], &filter)?;
//! let path = query.find_path(
//!     &mesh, start.poly_ref, end.poly_ref, &start.point, &end.point,
//!     &filter, FindPathOptions::empty(), -1.0,
//! )?;
//! let straight = query.find_straight_path(
//!     &mesh, &start.point, &end.point, &path.polys, 256, StraightPathOptions::empty(),
//! )?;
//! ```
//!
//! # Concurrency
//!
//! Tile mutation takes `&mut NavMesh` while every query borrows `&NavMesh`,
//! so a single writer and quiesced readers are enforced at compile time. A
//! query object owns its node pool and open list and is therefore not
//! reentrant; share a mesh across threads behind a `RwLock` and give every
//! thread its own [`NavMeshQuery`].

pub mod binary_format;
pub mod bvh_tree;
pub mod nav_mesh;
pub mod nav_mesh_builder;
pub mod nav_mesh_query;
pub mod node_pool;
pub mod poly_query;
pub mod query_filter;
pub mod raycast_hit;
pub mod sliced_pathfinding;
pub mod spatial_queries;
pub mod status;
pub mod straight_path;

#[cfg(test)]
pub mod test_mesh_helpers;

#[cfg(test)]
mod builder_tests;
#[cfg(test)]
mod multi_tile_tests;
#[cfg(test)]
mod off_mesh_connection_tests;

pub use nav_mesh::{
    BVNode, Link, MeshData, MeshTile, NavMesh, OffMeshConnection, Poly, PolyDetail, TileHeader,
};
pub use nav_mesh_builder::{create_nav_mesh_data, NavMeshCreateParams};
pub use nav_mesh_query::{FindPathOptions, NavMeshQuery, NearestPoly, PolyPath, QueryConfig};
pub use poly_query::{CollectPolysQuery, FindNearestPolyQuery, PolyQuery};
pub use query_filter::{
    DefaultQueryFilter, DefaultQueryHeuristic, PolyContext, QueryFilter, QueryHeuristic,
};
pub use raycast_hit::{RaycastHit, RaycastOptions};
pub use spatial_queries::{
    DistanceToWall, LocalNeighbourhood, PolySearchResult, RandomPoint, SurfaceMove, WallSegment,
    WallSegments,
};
pub use status::{QueryResult, Status};
pub use straight_path::{StraightPath, StraightPathFlags, StraightPathOptions, StraightPathPoint};

/// Maximum number of vertices per navigation polygon
pub const MAX_VERTS_PER_POLY: usize = 6;

/// Number of distinct area ids
pub const MAX_AREAS: usize = 64;

/// Neighbour entry flag marking a polygon edge that sits on a tile border
pub const EXT_LINK: u16 = 0x8000;

/// Terminates a link list
pub const NULL_LINK: u32 = 0xffff_ffff;

/// Off-mesh connection flag: the connection can be travelled both ways
pub const OFFMESH_CON_BIDIR: u8 = 1;

/// Detail triangle edge flag: the edge lies on the polygon boundary
pub const DETAIL_EDGE_BOUNDARY: u8 = 0x01;

/// Tile data magic number ('DNAV')
pub const NAVMESH_MAGIC: u32 =
    (b'D' as u32) << 24 | (b'N' as u32) << 16 | (b'A' as u32) << 8 | b'V' as u32;

/// Tile data version
pub const NAVMESH_VERSION: u32 = 7;

/// Any-angle raycast shortcuts are limited to this many walkable radii
pub const RAY_CAST_LIMIT_PROPORTIONS: f32 = 50.0;

/// Number of bits used for the salt of a reference
pub const SALT_BITS: u32 = 16;
/// Number of bits used for the tile index of a reference
pub const TILE_BITS: u32 = 28;
/// Number of bits used for the polygon index of a reference
pub const POLY_BITS: u32 = 20;

const SALT_MASK: u64 = (1 << SALT_BITS) - 1;
const TILE_MASK: u64 = (1 << TILE_BITS) - 1;
const POLY_MASK: u64 = (1 << POLY_BITS) - 1;

/// Reference to a polygon in the navigation mesh
///
/// Packs `salt << 48 | tile << 20 | poly`. The null reference never names a
/// polygon because tile salts start at one and skip zero on wrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct PolyRef(u64);

/// Tile references use the polygon reference layout with a zero poly index
pub type TileRef = PolyRef;

impl PolyRef {
    /// The null reference
    pub const NULL: PolyRef = PolyRef(0);

    /// Creates a reference from its raw value
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw value
    pub const fn id(&self) -> u64 {
        self.0
    }

    /// Checks if this is the null reference
    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Packs a salt, tile index and polygon index
    #[inline]
    pub const fn encode(salt: u32, tile: u32, poly: u32) -> Self {
        Self(
            ((salt as u64 & SALT_MASK) << (POLY_BITS + TILE_BITS))
                | ((tile as u64 & TILE_MASK) << POLY_BITS)
                | (poly as u64 & POLY_MASK),
        )
    }

    /// Splits the reference into `(salt, tile, poly)`
    #[inline]
    pub const fn decode(&self) -> (u32, u32, u32) {
        (self.salt(), self.tile(), self.poly())
    }

    #[inline]
    pub const fn salt(&self) -> u32 {
        ((self.0 >> (POLY_BITS + TILE_BITS)) & SALT_MASK) as u32
    }

    #[inline]
    pub const fn tile(&self) -> u32 {
        ((self.0 >> POLY_BITS) & TILE_MASK) as u32
    }

    #[inline]
    pub const fn poly(&self) -> u32 {
        (self.0 & POLY_MASK) as u32
    }

    /// Replaces the polygon index, keeping salt and tile
    #[inline]
    pub const fn with_poly(&self, poly: u32) -> Self {
        Self((self.0 & !POLY_MASK) | (poly as u64 & POLY_MASK))
    }
}

impl From<u64> for PolyRef {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for PolyRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (salt, tile, poly) = self.decode();
        write!(f, "{}:{}:{}", salt, tile, poly)
    }
}

bitflags::bitflags! {
    /// User defined polygon flags consulted by query filters
    ///
    /// The named flags are conventions; any bit pattern is preserved.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(
        feature = "serialization",
        derive(serde::Serialize, serde::Deserialize)
    )]
    pub struct PolyFlags: u16 {
        /// Ground walkable by agents
        const WALK = 0x01;
        /// Water
        const SWIM = 0x02;
        /// Doors
        const DOOR = 0x04;
        /// Jump links
        const JUMP = 0x08;
        /// Temporarily closed
        const DISABLED = 0x10;

        const _ = !0;
    }
}

/// Kind of navigation polygon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum PolyType {
    /// Regular ground polygon
    #[default]
    Ground,
    /// Two vertex polygon standing for an off-mesh connection
    OffMeshConnection,
}

/// Configuration of a navigation mesh
///
/// Fixed at construction; the tile capacity does not grow.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct NavMeshParams {
    /// World space origin of tile (0, 0)
    pub origin: [f32; 3],
    /// Width of each tile along the x-axis
    pub tile_width: f32,
    /// Height of each tile along the z-axis
    pub tile_height: f32,
    /// Maximum number of tiles the mesh can hold
    pub max_tiles: i32,
    /// Maximum number of polygons per tile
    pub max_polys_per_tile: i32,
}

impl Default for NavMeshParams {
    fn default() -> Self {
        Self {
            origin: [0.0; 3],
            tile_width: 32.0,
            tile_height: 32.0,
            max_tiles: 128,
            max_polys_per_tile: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poly_ref_packing() {
        let r = PolyRef::encode(0xbeef, 0x0abc_def1, 0x9_8765);
        assert_eq!(r.salt(), 0xbeef);
        assert_eq!(r.tile(), 0x0abc_def1);
        assert_eq!(r.poly(), 0x9_8765);
        assert_eq!(r.decode(), (0xbeef, 0x0abc_def1, 0x9_8765));
        assert_eq!(r.id() >> 48, 0xbeef);
    }

    #[test]
    fn test_poly_ref_masks_overflowing_fields() {
        let r = PolyRef::encode(0x1_0001, 1 << 28, 1 << 20);
        assert_eq!(r.decode(), (1, 0, 0));
    }

    #[test]
    fn test_poly_ref_with_poly() {
        let base = PolyRef::encode(3, 7, 0);
        let r = base.with_poly(42);
        assert_eq!(r.decode(), (3, 7, 42));
        assert_eq!(r.with_poly(0), base);
        assert!(PolyRef::NULL.is_null());
        assert!(!base.is_null());
        assert_eq!(format!("{}", r), "3:7:42");
    }

    #[test]
    fn test_poly_flags_keep_unknown_bits() {
        let flags = PolyFlags::from_bits_retain(0x8001);
        assert!(flags.contains(PolyFlags::WALK));
        assert_eq!(flags.bits(), 0x8001);
    }
}
