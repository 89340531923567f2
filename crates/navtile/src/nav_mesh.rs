//! Navigation mesh implementation
//!
//! The navigation mesh is a fixed capacity array of tile slots. Each slot
//! carries a salt that is bumped whenever its tile is removed, so polygon
//! references issued for an old tile stop validating once the slot is
//! reused. Adding a tile links its polygons with every tile already present
//! in the same grid cell (layers) and in the eight surrounding cells.

use std::collections::{HashMap, VecDeque};

use super::status::{QueryResult, Status};
use super::{
    NavMeshParams, PolyFlags, PolyRef, PolyType, TileRef, DETAIL_EDGE_BOUNDARY, EXT_LINK,
    MAX_VERTS_PER_POLY, NAVMESH_MAGIC, NAVMESH_VERSION, NULL_LINK, OFFMESH_CON_BIDIR, POLY_BITS,
    SALT_BITS, TILE_BITS,
};
use navtile_common::{
    closest_height_point_triangle, dist_pt_seg_sqr_2d, opposite_tile, overlap_bounds,
    overlap_quant_bounds, overlap_slabs, point_in_polygon, sqr, vert_at, vlerp, vmax, vmin, Error,
    Result,
};

/// Link between two polygons
///
/// Links live in a per-tile arena and form one singly linked list per
/// polygon. `next` indexes into the same arena.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct Link {
    /// Polygon the link leads to
    pub reference: PolyRef,
    /// Next link of the same polygon, [`NULL_LINK`] terminates
    pub next: u32,
    /// Edge of the source polygon the link leaves through
    pub edge: u8,
    /// Tile border side for external links, 0xff for internal ones
    pub side: u8,
    /// Start of the portal sub-range along the edge (0..=255)
    pub bmin: u8,
    /// End of the portal sub-range along the edge (0..=255)
    pub bmax: u8,
}

impl Default for Link {
    fn default() -> Self {
        Self {
            reference: PolyRef::NULL,
            next: NULL_LINK,
            edge: 0,
            side: 0xff,
            bmin: 0,
            bmax: 0,
        }
    }
}

/// Navigation polygon
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct Poly {
    /// Vertex indices into the tile vertex array
    pub verts: [u16; MAX_VERTS_PER_POLY],
    /// Per edge neighbour: 0 border, `index + 1` internal, `EXT_LINK | side` tile border
    pub neis: [u16; MAX_VERTS_PER_POLY],
    /// User flags
    pub flags: PolyFlags,
    /// Number of used entries in `verts`
    pub vert_count: u8,
    /// Area id (0..64)
    pub area: u8,
    /// Ground polygon or off-mesh connection
    pub poly_type: PolyType,
}

impl Poly {
    /// Number of vertices as usize
    #[inline]
    pub fn nverts(&self) -> usize {
        self.vert_count as usize
    }

    #[inline]
    pub fn is_off_mesh_connection(&self) -> bool {
        self.poly_type == PolyType::OffMeshConnection
    }
}

/// Detail sub-mesh of a polygon
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct PolyDetail {
    /// First extra vertex in `detail_verts`
    pub vert_base: u32,
    /// First triangle in `detail_tris`
    pub tri_base: u32,
    /// Number of extra vertices
    pub vert_count: u8,
    /// Number of triangles
    pub tri_count: u8,
}

/// Node of the flattened bounding volume tree
///
/// Leaves hold a polygon index in `i`; internal nodes hold `-escape`, the
/// number of nodes to skip to leave the subtree.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct BVNode {
    pub bmin: [u16; 3],
    pub bmax: [u16; 3],
    pub i: i32,
}

/// Off-mesh connection
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct OffMeshConnection {
    /// Start and end positions
    pub pos: [f32; 6],
    /// Endpoint snapping radius
    pub rad: f32,
    /// Index of the connection polygon within the tile
    pub poly: u16,
    /// Connection flags ([`OFFMESH_CON_BIDIR`])
    pub flags: u8,
    /// Tile border side the end point lies beyond, 0xff inside the tile
    pub side: u8,
    /// User id
    pub user_id: u32,
}

impl OffMeshConnection {
    pub fn start(&self) -> [f32; 3] {
        [self.pos[0], self.pos[1], self.pos[2]]
    }

    pub fn end(&self) -> [f32; 3] {
        [self.pos[3], self.pos[4], self.pos[5]]
    }
}

/// Header of a tile payload
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct TileHeader {
    pub magic: u32,
    pub version: u32,
    /// Grid location
    pub x: i32,
    pub y: i32,
    pub layer: i32,
    pub user_id: u32,
    pub poly_count: i32,
    pub vert_count: i32,
    pub max_link_count: i32,
    pub detail_mesh_count: i32,
    pub detail_vert_count: i32,
    pub detail_tri_count: i32,
    pub bv_node_count: i32,
    /// Index of the first off-mesh connection polygon
    pub off_mesh_base: i32,
    pub off_mesh_con_count: i32,
    pub walkable_height: f32,
    pub walkable_radius: f32,
    pub walkable_climb: f32,
    pub bmin: [f32; 3],
    pub bmax: [f32; 3],
    /// Factor converting world units to BV tree units
    pub bv_quant_factor: f32,
}

/// Tile payload produced by the builder
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct MeshData {
    pub header: TileHeader,
    /// Packed xyz vertices
    pub verts: Vec<f32>,
    pub polys: Vec<Poly>,
    /// One entry per ground polygon
    pub detail_meshes: Vec<PolyDetail>,
    /// Packed xyz detail vertices (only those not shared with the polygon)
    pub detail_verts: Vec<f32>,
    /// Four bytes per triangle: three vertex indices and the edge flags
    pub detail_tris: Vec<u8>,
    pub bv_tree: Vec<BVNode>,
    pub off_mesh_cons: Vec<OffMeshConnection>,
}

#[cfg(feature = "serialization")]
impl MeshData {
    /// Serializes the payload to JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserializes a payload from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Iterator over the links of one polygon
pub struct LinkIter<'a> {
    links: &'a [Link],
    cur: u32,
}

impl<'a> Iterator for LinkIter<'a> {
    type Item = &'a Link;

    fn next(&mut self) -> Option<&'a Link> {
        if self.cur == NULL_LINK {
            return None;
        }
        let link = self.links.get(self.cur as usize)?;
        self.cur = link.next;
        Some(link)
    }
}

/// A tile slot of the navigation mesh
#[derive(Debug, Clone)]
pub struct MeshTile {
    /// Generation counter of the slot
    pub salt: u32,
    /// Tile payload, empty while the slot is free
    pub data: MeshData,
    /// Link arena
    pub links: Vec<Link>,
    /// Head of the link list of each polygon
    pub poly_links: Vec<u32>,
    /// Head of the free list inside `links`
    pub links_free_list: u32,
    /// User flags given to `add_tile`
    pub flags: u32,
    index: usize,
    in_use: bool,
}

impl MeshTile {
    fn new(index: usize) -> Self {
        Self {
            salt: 1,
            data: MeshData::default(),
            links: Vec::new(),
            poly_links: Vec::new(),
            links_free_list: NULL_LINK,
            flags: 0,
            index,
            in_use: false,
        }
    }

    /// Slot index of the tile
    pub fn index(&self) -> usize {
        self.index
    }

    /// Checks if the slot currently holds a tile
    pub fn is_in_use(&self) -> bool {
        self.in_use
    }

    pub fn header(&self) -> &TileHeader {
        &self.data.header
    }

    /// Reference of polygon 0 of this tile
    pub fn poly_ref_base(&self) -> PolyRef {
        PolyRef::encode(self.salt, self.index as u32, 0)
    }

    /// Iterates the links of a polygon
    pub fn links_of(&self, poly_index: usize) -> LinkIter<'_> {
        LinkIter {
            links: &self.links,
            cur: self.poly_links.get(poly_index).copied().unwrap_or(NULL_LINK),
        }
    }

    /// Position of the `k`th vertex of `poly`
    #[inline]
    pub fn poly_vert(&self, poly: &Poly, k: usize) -> [f32; 3] {
        vert_at(&self.data.verts, poly.verts[k] as usize)
    }

    /// Copies the polygon vertices into a packed buffer
    pub fn poly_vertices(&self, poly: &Poly) -> ([f32; MAX_VERTS_PER_POLY * 3], usize) {
        let mut verts = [0.0; MAX_VERTS_PER_POLY * 3];
        let nv = poly.nverts();
        for i in 0..nv {
            verts[i * 3..i * 3 + 3].copy_from_slice(&self.poly_vert(poly, i));
        }
        (verts, nv)
    }

    /// Vertices of detail triangle `j` of the polygon described by `pd`
    pub fn detail_tri_vertices(&self, poly: &Poly, pd: &PolyDetail, j: usize) -> [[f32; 3]; 3] {
        let t = (pd.tri_base as usize + j) * 4;
        let mut v = [[0.0; 3]; 3];
        for (k, out) in v.iter_mut().enumerate() {
            let idx = self.data.detail_tris[t + k] as usize;
            *out = if idx < poly.nverts() {
                self.poly_vert(poly, idx)
            } else {
                vert_at(
                    &self.data.detail_verts,
                    pd.vert_base as usize + idx - poly.nverts(),
                )
            };
        }
        v
    }

    pub(crate) fn alloc_link(&mut self) -> u32 {
        if self.links_free_list == NULL_LINK {
            self.links.push(Link::default());
            return (self.links.len() - 1) as u32;
        }
        let idx = self.links_free_list;
        self.links_free_list = self.links[idx as usize].next;
        idx
    }

    pub(crate) fn free_link(&mut self, idx: u32) {
        self.links[idx as usize].next = self.links_free_list;
        self.links_free_list = idx;
    }

    /// Allocates a link and prepends it to the list of `poly_index`
    fn push_link(&mut self, poly_index: usize, link: Link) {
        let idx = self.alloc_link();
        self.links[idx as usize] = Link {
            next: self.poly_links[poly_index],
            ..link
        };
        self.poly_links[poly_index] = idx;
    }

    /// Indices of the ground polygons whose bounds overlap the query box
    ///
    /// Uses the BV tree when the tile has one, otherwise scans all polygons.
    pub fn polys_overlapping(&self, qmin: &[f32], qmax: &[f32]) -> Vec<usize> {
        let mut result = Vec::new();
        let header = &self.data.header;

        if !self.data.bv_tree.is_empty() {
            let tbmin = header.bmin;
            let tbmax = header.bmax;
            let qfac = header.bv_quant_factor;

            let mut bmin = [0u16; 3];
            let mut bmax = [0u16; 3];
            for k in 0..3 {
                let lo = qmin[k].clamp(tbmin[k], tbmax[k]) - tbmin[k];
                let hi = qmax[k].clamp(tbmin[k], tbmax[k]) - tbmin[k];
                bmin[k] = ((qfac * lo) as i32 & 0x7fff_fffe).min(0xffff) as u16;
                bmax[k] = (((qfac * hi + 1.0) as i32) | 1).min(0xffff) as u16;
            }

            let end = self.data.bv_tree.len();
            let mut node_index = 0;
            while node_index < end {
                let node = &self.data.bv_tree[node_index];
                let overlap = overlap_quant_bounds(&bmin, &bmax, &node.bmin, &node.bmax);
                let is_leaf = node.i >= 0;

                if is_leaf && overlap {
                    result.push(node.i as usize);
                }

                if overlap || is_leaf {
                    node_index += 1;
                } else {
                    node_index += (-node.i) as usize;
                }
            }
        } else {
            for (i, poly) in self.data.polys.iter().enumerate() {
                if poly.is_off_mesh_connection() {
                    continue;
                }
                let mut bmin = self.poly_vert(poly, 0);
                let mut bmax = bmin;
                for j in 1..poly.nverts() {
                    let v = self.poly_vert(poly, j);
                    bmin = vmin(&bmin, &v);
                    bmax = vmax(&bmax, &v);
                }
                if overlap_bounds(qmin, qmax, &bmin, &bmax) {
                    result.push(i);
                }
            }
        }

        result
    }

    /// Height of the polygon surface at the xz location of `pos`
    ///
    /// Returns `None` for off-mesh connections and for points outside the
    /// polygon footprint.
    pub fn get_poly_height(&self, poly_index: usize, pos: &[f32]) -> Option<f32> {
        let poly = &self.data.polys[poly_index];
        if poly.is_off_mesh_connection() {
            return None;
        }

        let (verts, nv) = self.poly_vertices(poly);
        if !point_in_polygon(pos, &verts, nv) {
            return None;
        }

        if let Some(pd) = self.data.detail_meshes.get(poly_index) {
            for j in 0..pd.tri_count as usize {
                let v = self.detail_tri_vertices(poly, pd, j);
                if let Some(h) = closest_height_point_triangle(pos, &v[0], &v[1], &v[2]) {
                    return Some(h);
                }
            }
        } else {
            let v0 = self.poly_vert(poly, 0);
            for j in 1..nv.saturating_sub(1) {
                let v1 = self.poly_vert(poly, j);
                let v2 = self.poly_vert(poly, j + 1);
                if let Some(h) = closest_height_point_triangle(pos, &v0, &v1, &v2) {
                    return Some(h);
                }
            }
        }

        // Degenerate triangles or large coordinates can make every triangle
        // test miss even though the point is inside; it is then on an edge.
        Some(self.closest_point_on_detail_edges(poly_index, pos, false)[1])
    }

    /// Closest point on the detail mesh edges of a polygon
    pub fn closest_point_on_detail_edges(
        &self,
        poly_index: usize,
        pos: &[f32],
        only_boundary: bool,
    ) -> [f32; 3] {
        const ANY_BOUNDARY_EDGE: u8 =
            DETAIL_EDGE_BOUNDARY | (DETAIL_EDGE_BOUNDARY << 2) | (DETAIL_EDGE_BOUNDARY << 4);

        let poly = &self.data.polys[poly_index];
        let mut dmin = f32::MAX;
        let mut tmin = 0.0;
        let mut pmin = [0.0; 3];
        let mut pmax = [0.0; 3];

        if let Some(pd) = self.data.detail_meshes.get(poly_index) {
            for i in 0..pd.tri_count as usize {
                let t = (pd.tri_base as usize + i) * 4;
                let tris = &self.data.detail_tris[t..t + 4];
                if only_boundary && (tris[3] & ANY_BOUNDARY_EDGE) == 0 {
                    continue;
                }

                let v = self.detail_tri_vertices(poly, pd, i);
                for (k, j) in [(0usize, 2usize), (1, 0), (2, 1)] {
                    if (detail_tri_edge_flags(tris[3], j) & DETAIL_EDGE_BOUNDARY) == 0
                        && (only_boundary || tris[j] < tris[k])
                    {
                        // Internal edge, or an inner edge visited from the other side.
                        continue;
                    }

                    let (d, t) = dist_pt_seg_sqr_2d(pos, &v[j], &v[k]);
                    if d < dmin {
                        dmin = d;
                        tmin = t;
                        pmin = v[j];
                        pmax = v[k];
                    }
                }
            }
        } else {
            let nv = poly.nverts();
            for j in 0..nv {
                let k = (j + 1) % nv;
                let va = self.poly_vert(poly, j);
                let vb = self.poly_vert(poly, k);
                let (d, t) = dist_pt_seg_sqr_2d(pos, &va, &vb);
                if d < dmin {
                    dmin = d;
                    tmin = t;
                    pmin = va;
                    pmax = vb;
                }
            }
        }

        vlerp(&pmin, &pmax, tmin)
    }
}

/// Edge flags of edge `edge_index` of a detail triangle
#[inline]
pub fn detail_tri_edge_flags(tri_flags: u8, edge_index: usize) -> u8 {
    (tri_flags >> (edge_index * 2)) & 0x3
}

/// A navigation mesh made of tiles
#[derive(Debug)]
pub struct NavMesh {
    params: NavMeshParams,
    tiles: Vec<MeshTile>,
    pos_lookup: HashMap<(i32, i32), Vec<usize>>,
    free_tiles: VecDeque<usize>,
    tile_count: usize,
}

impl NavMesh {
    /// Creates an empty navigation mesh
    pub fn new(params: NavMeshParams) -> Result<Self> {
        if params.max_tiles <= 0 || params.max_tiles as u64 > (1u64 << TILE_BITS) {
            return Err(Error::InvalidMesh(format!(
                "max_tiles must be in 1..={}, got {}",
                1u64 << TILE_BITS,
                params.max_tiles
            )));
        }
        if params.max_polys_per_tile <= 0 || params.max_polys_per_tile as u64 > (1u64 << POLY_BITS)
        {
            return Err(Error::InvalidMesh(format!(
                "max_polys_per_tile must be in 1..={}, got {}",
                1u64 << POLY_BITS,
                params.max_polys_per_tile
            )));
        }
        if !(params.tile_width > 0.0) || !(params.tile_height > 0.0) {
            return Err(Error::InvalidMesh(format!(
                "tile size must be positive, got {} x {}",
                params.tile_width, params.tile_height
            )));
        }

        let max_tiles = params.max_tiles as usize;
        let tiles = (0..max_tiles).map(MeshTile::new).collect();
        let free_tiles = (0..max_tiles).collect();

        Ok(Self {
            params,
            tiles,
            pos_lookup: HashMap::new(),
            free_tiles,
            tile_count: 0,
        })
    }

    /// Creates a single tile navigation mesh sized after the tile bounds
    pub fn with_single_tile(data: MeshData, flags: u32) -> Result<Self> {
        let header = &data.header;
        let params = NavMeshParams {
            origin: header.bmin,
            tile_width: header.bmax[0] - header.bmin[0],
            tile_height: header.bmax[2] - header.bmin[2],
            max_tiles: 1,
            max_polys_per_tile: header.poly_count.max(1),
        };
        let mut nav_mesh = Self::new(params)?;
        nav_mesh.add_tile(data, flags, PolyRef::NULL)?;
        Ok(nav_mesh)
    }

    /// Parameters the mesh was created with
    pub fn params(&self) -> &NavMeshParams {
        &self.params
    }

    pub fn max_tiles(&self) -> usize {
        self.tiles.len()
    }

    /// Number of tiles currently in the mesh
    pub fn tile_count(&self) -> usize {
        self.tile_count
    }

    /// Number of free tile slots
    pub fn available_tile_count(&self) -> usize {
        self.free_tiles.len()
    }

    /// Tile slot `i`, if it holds a tile
    pub fn tile(&self, i: usize) -> Option<&MeshTile> {
        self.tiles.get(i).filter(|t| t.in_use)
    }

    /// Iterates the tiles in use
    pub fn tiles(&self) -> impl Iterator<Item = &MeshTile> {
        self.tiles.iter().filter(|t| t.in_use)
    }

    /// Reference of polygon 0 of a tile
    pub fn get_poly_ref_base(&self, tile: &MeshTile) -> PolyRef {
        tile.poly_ref_base()
    }

    /// Reference of a tile
    pub fn get_tile_ref(&self, tile: &MeshTile) -> TileRef {
        PolyRef::encode(tile.salt, tile.index as u32, 0)
    }

    /// Grid cell containing a world position
    pub fn calc_tile_loc(&self, pos: &[f32]) -> (i32, i32) {
        let tx = ((pos[0] - self.params.origin[0]) / self.params.tile_width).floor() as i32;
        let ty = ((pos[2] - self.params.origin[2]) / self.params.tile_height).floor() as i32;
        (tx, ty)
    }

    fn tile_index_at(&self, x: i32, y: i32, layer: i32) -> Option<usize> {
        self.pos_lookup.get(&(x, y))?.iter().copied().find(|&i| {
            let h = &self.tiles[i].data.header;
            h.layer == layer
        })
    }

    fn tile_indices_at(&self, x: i32, y: i32) -> Vec<usize> {
        self.pos_lookup.get(&(x, y)).cloned().unwrap_or_default()
    }

    fn neighbour_tile_indices_at(&self, x: i32, y: i32, side: i32) -> Vec<usize> {
        let (nx, ny) = match side {
            0 => (x + 1, y),
            1 => (x + 1, y + 1),
            2 => (x, y + 1),
            3 => (x - 1, y + 1),
            4 => (x - 1, y),
            5 => (x - 1, y - 1),
            6 => (x, y - 1),
            7 => (x + 1, y - 1),
            _ => (x, y),
        };
        self.tile_indices_at(nx, ny)
    }

    /// Tile at a grid location and layer
    pub fn get_tile_at(&self, x: i32, y: i32, layer: i32) -> Option<&MeshTile> {
        self.tile_index_at(x, y, layer).map(|i| &self.tiles[i])
    }

    /// All layers at a grid location
    pub fn get_tiles_at(&self, x: i32, y: i32) -> Vec<&MeshTile> {
        self.tile_indices_at(x, y)
            .into_iter()
            .map(|i| &self.tiles[i])
            .collect()
    }

    /// Reference of the tile at a grid location, null if there is none
    pub fn get_tile_ref_at(&self, x: i32, y: i32, layer: i32) -> TileRef {
        self.get_tile_at(x, y, layer)
            .map(|t| self.get_tile_ref(t))
            .unwrap_or(PolyRef::NULL)
    }

    /// Tile named by a tile reference, if the reference is current
    pub fn get_tile_by_ref(&self, tile_ref: TileRef) -> Option<&MeshTile> {
        if tile_ref.is_null() {
            return None;
        }
        let tile = self.tiles.get(tile_ref.tile() as usize)?;
        (tile.in_use && tile.salt == tile_ref.salt()).then_some(tile)
    }

    /// Adds a tile to the navigation mesh
    ///
    /// With a null `last_ref` the tile goes into the next free slot.
    /// Otherwise the slot named by `last_ref` is used and its salt restored,
    /// which reproduces the polygon references the tile had before it was
    /// removed.
    pub fn add_tile(&mut self, data: MeshData, flags: u32, last_ref: TileRef) -> Result<TileRef> {
        let header = &data.header;
        if header.magic != NAVMESH_MAGIC {
            return Err(Error::WrongMagic(header.magic));
        }
        if header.version != NAVMESH_VERSION {
            return Err(Error::WrongVersion(header.version));
        }
        if data.polys.len() as u64 > (1u64 << POLY_BITS) {
            return Err(Error::InvalidMesh(format!(
                "tile has {} polygons, at most {} are addressable",
                data.polys.len(),
                1u64 << POLY_BITS
            )));
        }

        let (x, y, layer) = (header.x, header.y, header.layer);
        if self.tile_index_at(x, y, layer).is_some() {
            return Err(Error::TileOccupied { x, y, layer });
        }

        let idx = if last_ref.is_null() {
            self.free_tiles
                .pop_front()
                .ok_or(Error::OutOfTiles(self.tiles.len()))?
        } else {
            let idx = last_ref.tile() as usize;
            if idx >= self.tiles.len() {
                return Err(Error::InvalidTileRef(last_ref.id()));
            }
            let pos = self
                .free_tiles
                .iter()
                .position(|&i| i == idx)
                .ok_or(Error::InvalidTileRef(last_ref.id()))?;
            self.free_tiles.remove(pos);
            self.tiles[idx].salt = last_ref.salt();
            idx
        };

        let poly_count = data.polys.len();
        {
            let tile = &mut self.tiles[idx];
            tile.data = data;
            tile.flags = flags;
            tile.links.clear();
            tile.links.reserve(tile.data.header.max_link_count.max(0) as usize);
            tile.links_free_list = NULL_LINK;
            tile.poly_links = vec![NULL_LINK; poly_count];
            tile.in_use = true;
        }
        self.tile_count += 1;
        self.pos_lookup.entry((x, y)).or_default().push(idx);

        self.connect_int_links(idx);
        // Base off-mesh connections to their starting polygons and connect
        // connections inside the tile.
        self.base_off_mesh_links(idx);
        self.connect_ext_off_mesh_links(idx, idx, -1);

        for nei in self.tile_indices_at(x, y) {
            if nei == idx {
                continue;
            }
            self.connect_ext_links(idx, nei, -1);
            self.connect_ext_links(nei, idx, -1);
            self.connect_ext_off_mesh_links(idx, nei, -1);
            self.connect_ext_off_mesh_links(nei, idx, -1);
        }

        for side in 0..8 {
            for nei in self.neighbour_tile_indices_at(x, y, side) {
                self.connect_ext_links(idx, nei, side);
                self.connect_ext_links(nei, idx, opposite_tile(side));
                self.connect_ext_off_mesh_links(idx, nei, side);
                self.connect_ext_off_mesh_links(nei, idx, opposite_tile(side));
            }
        }

        let tile = &self.tiles[idx];
        log::debug!(
            "Added tile ({}, {}, layer {}) to slot {} with {} polys and {} links",
            x,
            y,
            layer,
            idx,
            poly_count,
            tile.links.len()
        );

        Ok(self.get_tile_ref(tile))
    }

    /// Removes a tile and returns its payload with the new tile reference
    ///
    /// The slot salt is bumped, so every polygon reference issued for the
    /// removed tile stops validating. The returned reference can be passed
    /// back to [`NavMesh::add_tile`] to restore the tile into the same slot.
    pub fn remove_tile(&mut self, tile_ref: TileRef) -> Result<(MeshData, TileRef)> {
        let idx = tile_ref.tile() as usize;
        let valid = !tile_ref.is_null()
            && self
                .tiles
                .get(idx)
                .is_some_and(|t| t.in_use && t.salt == tile_ref.salt());
        if !valid {
            return Err(Error::InvalidTileRef(tile_ref.id()));
        }

        let (x, y, layer) = {
            let h = &self.tiles[idx].data.header;
            (h.x, h.y, h.layer)
        };

        if let Some(list) = self.pos_lookup.get_mut(&(x, y)) {
            list.retain(|&i| i != idx);
            if list.is_empty() {
                self.pos_lookup.remove(&(x, y));
            }
        }

        // Disconnect from other layers in the same cell and from neighbours.
        for nei in self.tile_indices_at(x, y) {
            self.unconnect_links(nei, idx);
        }
        for side in 0..8 {
            for nei in self.neighbour_tile_indices_at(x, y, side) {
                self.unconnect_links(nei, idx);
            }
        }

        let tile = &mut self.tiles[idx];
        let data = std::mem::take(&mut tile.data);
        tile.flags = 0;
        tile.links.clear();
        tile.poly_links.clear();
        tile.links_free_list = NULL_LINK;
        tile.in_use = false;

        // Salt 0 would make the tile reference of slot 0 null.
        tile.salt = (tile.salt + 1) & ((1 << SALT_BITS) - 1);
        if tile.salt == 0 {
            tile.salt += 1;
        }

        self.free_tiles.push_front(idx);
        self.tile_count -= 1;

        log::debug!(
            "Removed tile ({}, {}, layer {}) from slot {}, salt now {}",
            x,
            y,
            layer,
            idx,
            self.tiles[idx].salt
        );

        let new_ref = PolyRef::encode(self.tiles[idx].salt, idx as u32, 0);
        Ok((data, new_ref))
    }

    /// Replaces the tile at the payload's grid location, keeping its slot
    pub fn update_tile(&mut self, data: MeshData, flags: u32) -> Result<TileRef> {
        let h = &data.header;
        let existing = self.get_tile_ref_at(h.x, h.y, h.layer);
        let last_ref = if existing.is_null() {
            PolyRef::NULL
        } else {
            self.remove_tile(existing)?.1
        };
        self.add_tile(data, flags, last_ref)
    }

    /// Builds the links between polygons of the same tile
    fn connect_int_links(&mut self, idx: usize) {
        let tile = &mut self.tiles[idx];
        let base = tile.poly_ref_base();

        for i in 0..tile.data.polys.len() {
            let poly = tile.data.polys[i];
            tile.poly_links[i] = NULL_LINK;

            if poly.is_off_mesh_connection() {
                continue;
            }

            // Build edge links backwards so that the list runs from the
            // lowest edge index to the highest.
            for j in (0..poly.nverts()).rev() {
                let nei = poly.neis[j];
                if nei == 0 || (nei & EXT_LINK) != 0 {
                    continue;
                }
                tile.push_link(
                    i,
                    Link {
                        reference: base.with_poly(nei as u32 - 1),
                        edge: j as u8,
                        side: 0xff,
                        bmin: 0,
                        bmax: 0,
                        next: NULL_LINK,
                    },
                );
            }
        }
    }

    /// Connects off-mesh connection start points to the polygons they sit on
    fn base_off_mesh_links(&mut self, idx: usize) {
        let mut found = Vec::new();
        {
            let tile = &self.tiles[idx];
            let climb = tile.data.header.walkable_climb;
            for con in &tile.data.off_mesh_cons {
                let ext = [con.rad, climb, con.rad];
                let p = con.start();
                let Some((land_ref, nearest)) = self.find_nearest_poly_in_tile(tile, &p, &ext)
                else {
                    continue;
                };
                // The nearest poly search may be too optimistic.
                if sqr(nearest[0] - p[0]) + sqr(nearest[2] - p[2]) > sqr(con.rad) {
                    continue;
                }
                found.push((con.poly as usize, land_ref, nearest));
            }
        }

        let tile = &mut self.tiles[idx];
        let base = tile.poly_ref_base();
        for (con_poly, land_ref, nearest) in found {
            // Snap the start vertex onto the mesh.
            let v = tile.data.polys[con_poly].verts[0] as usize;
            tile.data.verts[v * 3..v * 3 + 3].copy_from_slice(&nearest);

            tile.push_link(
                con_poly,
                Link {
                    reference: land_ref,
                    edge: 0,
                    side: 0xff,
                    ..Link::default()
                },
            );

            // The start end-point always links back to the connection.
            tile.push_link(
                land_ref.poly() as usize,
                Link {
                    reference: base.with_poly(con_poly as u32),
                    edge: 0xff,
                    side: 0xff,
                    ..Link::default()
                },
            );
        }
    }

    /// Links off-mesh connections of `target` whose end point lands in `tile`
    fn connect_ext_off_mesh_links(&mut self, tile_idx: usize, target_idx: usize, side: i32) {
        let opposite_side = if side == -1 {
            0xff
        } else {
            opposite_tile(side) as u8
        };

        let mut landings = Vec::new();
        {
            let tile = &self.tiles[tile_idx];
            let target = &self.tiles[target_idx];
            for con in &target.data.off_mesh_cons {
                if con.side != opposite_side {
                    continue;
                }
                let con_poly = con.poly as usize;
                // Skip connections whose start could not be connected.
                if target.poly_links[con_poly] == NULL_LINK {
                    continue;
                }

                let ext = [con.rad, target.data.header.walkable_climb, con.rad];
                let p = con.end();
                let Some((land_ref, nearest)) = self.find_nearest_poly_in_tile(tile, &p, &ext)
                else {
                    continue;
                };
                if sqr(nearest[0] - p[0]) + sqr(nearest[2] - p[2]) > sqr(con.rad) {
                    continue;
                }
                landings.push((
                    con_poly,
                    land_ref,
                    nearest,
                    con.flags & OFFMESH_CON_BIDIR != 0,
                ));
            }
        }

        let target_base = self.tiles[target_idx].poly_ref_base();
        let back_side = if side == -1 { 0xff } else { side as u8 };
        for (con_poly, land_ref, nearest, bidir) in landings {
            let target = &mut self.tiles[target_idx];
            let v = target.data.polys[con_poly].verts[1] as usize;
            target.data.verts[v * 3..v * 3 + 3].copy_from_slice(&nearest);
            target.push_link(
                con_poly,
                Link {
                    reference: land_ref,
                    edge: 1,
                    side: opposite_side,
                    ..Link::default()
                },
            );

            if bidir {
                self.tiles[tile_idx].push_link(
                    land_ref.poly() as usize,
                    Link {
                        reference: target_base.with_poly(con_poly as u32),
                        edge: 0xff,
                        side: back_side,
                        ..Link::default()
                    },
                );
            }
        }
    }

    /// Links the border edges of `tile` facing `side` to polygons of `target`
    fn connect_ext_links(&mut self, tile_idx: usize, target_idx: usize, side: i32) {
        let mut new_links = Vec::new();
        {
            let tile = &self.tiles[tile_idx];
            let target = &self.tiles[target_idx];
            for (i, poly) in tile.data.polys.iter().enumerate() {
                let nv = poly.nverts();
                for j in 0..nv {
                    if poly.neis[j] & EXT_LINK == 0 {
                        continue;
                    }
                    let dir = (poly.neis[j] & 0xff) as i32;
                    if side != -1 && dir != side {
                        continue;
                    }

                    let va = tile.poly_vert(poly, j);
                    let vb = tile.poly_vert(poly, (j + 1) % nv);
                    for (reference, cmin, cmax) in
                        find_connecting_polys(&va, &vb, target, opposite_tile(dir))
                    {
                        // Compress the portal limits to a byte range.
                        let (bmin, bmax) = match dir {
                            0 | 4 => portal_range(cmin, cmax, va[2], vb[2]),
                            2 | 6 => portal_range(cmin, cmax, va[0], vb[0]),
                            _ => (0, 255),
                        };
                        new_links.push((
                            i,
                            Link {
                                reference,
                                edge: j as u8,
                                side: dir as u8,
                                bmin,
                                bmax,
                                next: NULL_LINK,
                            },
                        ));
                    }
                }
            }
        }

        let tile = &mut self.tiles[tile_idx];
        for (poly_index, link) in new_links {
            tile.push_link(poly_index, link);
        }
    }

    /// Removes every link of `tile_idx` that points into `target_idx`
    fn unconnect_links(&mut self, tile_idx: usize, target_idx: usize) {
        let tile = &mut self.tiles[tile_idx];
        for i in 0..tile.poly_links.len() {
            let mut j = tile.poly_links[i];
            let mut pj = NULL_LINK;
            while j != NULL_LINK {
                let link = tile.links[j as usize];
                if link.reference.tile() as usize == target_idx {
                    let nj = link.next;
                    if pj == NULL_LINK {
                        tile.poly_links[i] = nj;
                    } else {
                        tile.links[pj as usize].next = nj;
                    }
                    tile.free_link(j);
                    j = nj;
                } else {
                    pj = j;
                    j = link.next;
                }
            }
        }
    }

    /// Nearest polygon of a single tile, used to anchor off-mesh connections
    pub fn find_nearest_poly_in_tile(
        &self,
        tile: &MeshTile,
        center: &[f32; 3],
        half_extents: &[f32; 3],
    ) -> Option<(PolyRef, [f32; 3])> {
        let bmin = [
            center[0] - half_extents[0],
            center[1] - half_extents[1],
            center[2] - half_extents[2],
        ];
        let bmax = [
            center[0] + half_extents[0],
            center[1] + half_extents[1],
            center[2] + half_extents[2],
        ];

        let base = tile.poly_ref_base();
        let mut nearest = None;
        let mut nearest_dist = f32::MAX;
        for ip in tile.polys_overlapping(&bmin, &bmax) {
            let (closest, over_poly) = self.closest_point_in_tile(tile, ip, center);
            let diff = [
                center[0] - closest[0],
                center[1] - closest[1],
                center[2] - closest[2],
            ];
            // Directly over a polygon and within climb height beats the
            // straight line nearest point.
            let d = if over_poly {
                let d = diff[1].abs() - tile.data.header.walkable_climb;
                if d > 0.0 {
                    d * d
                } else {
                    0.0
                }
            } else {
                diff[0] * diff[0] + diff[1] * diff[1] + diff[2] * diff[2]
            };
            if d < nearest_dist {
                nearest_dist = d;
                nearest = Some((base.with_poly(ip as u32), closest));
            }
        }
        nearest
    }

    /// Tile and polygon for a reference, validating salt and bounds
    ///
    /// A null reference fails with `FAILURE`; any other invalid reference
    /// with `FAILURE | INVALID_PARAM`.
    pub fn get_tile_and_poly_by_ref(&self, r: PolyRef) -> QueryResult<(&MeshTile, &Poly)> {
        if r.is_null() {
            return Err(Status::FAILURE);
        }
        let (salt, it, ip) = r.decode();
        let tile = self
            .tiles
            .get(it as usize)
            .filter(|t| t.in_use && t.salt == salt)
            .ok_or(Status::FAILURE | Status::INVALID_PARAM)?;
        let poly = tile
            .data
            .polys
            .get(ip as usize)
            .ok_or(Status::FAILURE | Status::INVALID_PARAM)?;
        Ok((tile, poly))
    }

    /// Tile and polygon for a reference without validating the salt
    ///
    /// Only for references that were validated during the current borrow of
    /// the mesh, such as link targets. Panics if the slot or polygon index is
    /// out of range.
    #[inline]
    pub fn get_tile_and_poly_by_ref_unsafe(&self, r: PolyRef) -> (&MeshTile, &Poly) {
        let tile = &self.tiles[r.tile() as usize];
        (tile, &tile.data.polys[r.poly() as usize])
    }

    /// Checks if a polygon reference is current
    pub fn is_valid_poly_ref(&self, r: PolyRef) -> bool {
        self.get_tile_and_poly_by_ref(r).is_ok()
    }

    fn poly_mut(&mut self, r: PolyRef) -> QueryResult<&mut Poly> {
        if r.is_null() {
            return Err(Status::FAILURE);
        }
        let (salt, it, ip) = r.decode();
        let tile = self
            .tiles
            .get_mut(it as usize)
            .filter(|t| t.in_use && t.salt == salt)
            .ok_or(Status::FAILURE | Status::INVALID_PARAM)?;
        tile.data
            .polys
            .get_mut(ip as usize)
            .ok_or(Status::FAILURE | Status::INVALID_PARAM)
    }

    pub fn set_poly_flags(&mut self, r: PolyRef, flags: PolyFlags) -> QueryResult<()> {
        self.poly_mut(r)?.flags = flags;
        Ok(())
    }

    pub fn get_poly_flags(&self, r: PolyRef) -> QueryResult<PolyFlags> {
        Ok(self.get_tile_and_poly_by_ref(r)?.1.flags)
    }

    /// Sets the area id, keeping the lower 6 bits
    pub fn set_poly_area(&mut self, r: PolyRef, area: u8) -> QueryResult<()> {
        self.poly_mut(r)?.area = area & 0x3f;
        Ok(())
    }

    pub fn get_poly_area(&self, r: PolyRef) -> QueryResult<u8> {
        Ok(self.get_tile_and_poly_by_ref(r)?.1.area)
    }

    /// Closest point on a polygon, and whether `pos` lies over it
    ///
    /// The reference must be valid.
    pub fn closest_point_on_poly(&self, r: PolyRef, pos: &[f32; 3]) -> ([f32; 3], bool) {
        let (tile, _) = self.get_tile_and_poly_by_ref_unsafe(r);
        self.closest_point_in_tile(tile, r.poly() as usize, pos)
    }

    fn closest_point_in_tile(&self, tile: &MeshTile, ip: usize, pos: &[f32; 3]) -> ([f32; 3], bool) {
        if let Some(h) = tile.get_poly_height(ip, pos) {
            return ([pos[0], h, pos[2]], true);
        }

        let poly = &tile.data.polys[ip];
        if poly.is_off_mesh_connection() {
            let v0 = tile.poly_vert(poly, 0);
            let v1 = tile.poly_vert(poly, 1);
            let (_, t) = dist_pt_seg_sqr_2d(pos, &v0, &v1);
            return (vlerp(&v0, &v1, t), false);
        }

        (tile.closest_point_on_detail_edges(ip, pos, true), false)
    }

    /// Height of a polygon at a position, `None` when outside or off-mesh
    pub fn get_poly_height(&self, tile: &MeshTile, poly_index: usize, pos: &[f32]) -> Option<f32> {
        tile.get_poly_height(poly_index, pos)
    }

    /// Endpoints of an off-mesh connection ordered by direction of travel
    ///
    /// `prev_ref` is the polygon the connection is entered from.
    pub fn get_off_mesh_connection_poly_end_points(
        &self,
        prev_ref: PolyRef,
        poly_ref: PolyRef,
    ) -> QueryResult<([f32; 3], [f32; 3])> {
        let (tile, poly) = self.get_tile_and_poly_by_ref(poly_ref)?;
        if !poly.is_off_mesh_connection() {
            return Err(Status::FAILURE);
        }

        let (mut idx0, mut idx1) = (0, 1);
        if let Some(link) = tile
            .links_of(poly_ref.poly() as usize)
            .find(|l| l.edge == 0)
        {
            if link.reference != prev_ref {
                idx0 = 1;
                idx1 = 0;
            }
        }

        Ok((tile.poly_vert(poly, idx0), tile.poly_vert(poly, idx1)))
    }

    /// Off-mesh connection record of an off-mesh connection polygon
    pub fn get_off_mesh_connection_by_ref(&self, r: PolyRef) -> Option<&OffMeshConnection> {
        let (tile, poly) = self.get_tile_and_poly_by_ref(r).ok()?;
        if !poly.is_off_mesh_connection() {
            return None;
        }
        let idx = (r.poly() as i32 - tile.data.header.off_mesh_base) as usize;
        tile.data.off_mesh_cons.get(idx)
    }

    /// Bounds of every vertex in the mesh
    pub fn compute_bounds(&self) -> ([f32; 3], [f32; 3]) {
        let mut bmin = [f32::INFINITY; 3];
        let mut bmax = [f32::NEG_INFINITY; 3];
        for tile in self.tiles() {
            for v in tile.data.verts.chunks_exact(3) {
                bmin = vmin(&bmin, v);
                bmax = vmax(&bmax, v);
            }
        }
        (bmin, bmax)
    }
}

/// Polygons of `tile` with a border edge on `side` that overlaps `va -> vb`
///
/// Returns the polygon reference and the overlapping range along the border.
fn find_connecting_polys(
    va: &[f32; 3],
    vb: &[f32; 3],
    tile: &MeshTile,
    side: i32,
) -> Vec<(PolyRef, f32, f32)> {
    let mut result = Vec::new();
    let (amin, amax) = calc_slab_end_points(va, vb, side);
    let apos = get_slab_coord(va, side);

    let m = EXT_LINK | side as u16;
    let base = tile.poly_ref_base();
    for (i, poly) in tile.data.polys.iter().enumerate() {
        let nv = poly.nverts();
        for j in 0..nv {
            if poly.neis[j] != m {
                continue;
            }

            let vc = tile.poly_vert(poly, j);
            let vd = tile.poly_vert(poly, (j + 1) % nv);
            let bpos = get_slab_coord(&vc, side);
            if (apos - bpos).abs() > 0.01 {
                continue;
            }

            let (bmin, bmax) = calc_slab_end_points(&vc, &vd, side);
            if !overlap_slabs(
                amin,
                amax,
                bmin,
                bmax,
                0.01,
                tile.data.header.walkable_climb,
            ) {
                continue;
            }

            result.push((
                base.with_poly(i as u32),
                amin[0].max(bmin[0]),
                amax[0].min(bmax[0]),
            ));
            break;
        }
    }
    result
}

fn get_slab_coord(va: &[f32; 3], side: i32) -> f32 {
    match side {
        0 | 4 => va[0],
        2 | 6 => va[2],
        _ => 0.0,
    }
}

/// Edge endpoints as `(u, y)` pairs sorted along the border axis
fn calc_slab_end_points(va: &[f32; 3], vb: &[f32; 3], side: i32) -> ([f32; 2], [f32; 2]) {
    let axis = match side {
        0 | 4 => 2,
        2 | 6 => 0,
        _ => return ([0.0; 2], [0.0; 2]),
    };
    if va[axis] < vb[axis] {
        ([va[axis], va[1]], [vb[axis], vb[1]])
    } else {
        ([vb[axis], vb[1]], [va[axis], va[1]])
    }
}

fn portal_range(cmin: f32, cmax: f32, a: f32, b: f32) -> (u8, u8) {
    let mut tmin = (cmin - a) / (b - a);
    let mut tmax = (cmax - a) / (b - a);
    if tmin > tmax {
        std::mem::swap(&mut tmin, &mut tmax);
    }
    (
        (tmin.clamp(0.0, 1.0) * 255.0).round() as u8,
        (tmax.clamp(0.0, 1.0) * 255.0).round() as u8,
    )
}
