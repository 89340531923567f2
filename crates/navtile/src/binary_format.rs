//! Binary persistence of tiles and navigation meshes
//!
//! Three little-endian formats are supported:
//!
//! - a tile payload ([`MeshData`]) starting with the `DNAV` header, as
//!   produced by [`create_nav_mesh_data`](crate::create_nav_mesh_data);
//! - a mesh set (`MSET`): the mesh parameters followed by every tile with the
//!   reference it had when saved, so polygon references survive a reload;
//! - a tile state (`DNMS`): the runtime flags and areas of a tile's polygons.

use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use navtile_common::{Error, Result};

use super::nav_mesh::{BVNode, MeshData, OffMeshConnection, Poly, PolyDetail, TileHeader};
use super::{
    NavMesh, NavMeshParams, PolyFlags, PolyRef, PolyType, TileRef, EXT_LINK, MAX_VERTS_PER_POLY,
    NAVMESH_MAGIC, NAVMESH_VERSION,
};

/// Mesh set magic number ('MSET')
pub const NAVMESH_SET_MAGIC: u32 =
    (b'M' as u32) << 24 | (b'S' as u32) << 16 | (b'E' as u32) << 8 | b'T' as u32;

/// Mesh set version
pub const NAVMESH_SET_VERSION: u32 = 1;

/// Tile state magic number ('DNMS')
pub const NAVMESH_STATE_MAGIC: u32 =
    (b'D' as u32) << 24 | (b'N' as u32) << 16 | (b'M' as u32) << 8 | b'S' as u32;

/// Tile state version
pub const NAVMESH_STATE_VERSION: u32 = 1;

/// Upper bound on any element count read from a file
const MAX_ELEMENT_COUNT: i32 = 1 << 24;

fn write_header<W: Write>(w: &mut W, h: &TileHeader) -> Result<()> {
    w.write_u32::<LittleEndian>(h.magic)?;
    w.write_u32::<LittleEndian>(h.version)?;
    w.write_i32::<LittleEndian>(h.x)?;
    w.write_i32::<LittleEndian>(h.y)?;
    w.write_i32::<LittleEndian>(h.layer)?;
    w.write_u32::<LittleEndian>(h.user_id)?;
    w.write_i32::<LittleEndian>(h.poly_count)?;
    w.write_i32::<LittleEndian>(h.vert_count)?;
    w.write_i32::<LittleEndian>(h.max_link_count)?;
    w.write_i32::<LittleEndian>(h.detail_mesh_count)?;
    w.write_i32::<LittleEndian>(h.detail_vert_count)?;
    w.write_i32::<LittleEndian>(h.detail_tri_count)?;
    w.write_i32::<LittleEndian>(h.bv_node_count)?;
    w.write_i32::<LittleEndian>(h.off_mesh_con_count)?;
    w.write_i32::<LittleEndian>(h.off_mesh_base)?;
    w.write_f32::<LittleEndian>(h.walkable_height)?;
    w.write_f32::<LittleEndian>(h.walkable_radius)?;
    w.write_f32::<LittleEndian>(h.walkable_climb)?;
    write_f32s(w, &h.bmin)?;
    write_f32s(w, &h.bmax)?;
    w.write_f32::<LittleEndian>(h.bv_quant_factor)?;
    Ok(())
}

fn read_header<R: Read>(r: &mut R) -> Result<TileHeader> {
    let magic = r.read_u32::<LittleEndian>()?;
    if magic != NAVMESH_MAGIC {
        return Err(Error::WrongMagic(magic));
    }
    let version = r.read_u32::<LittleEndian>()?;
    if version != NAVMESH_VERSION {
        return Err(Error::WrongVersion(version));
    }

    let mut h = TileHeader {
        magic,
        version,
        x: r.read_i32::<LittleEndian>()?,
        y: r.read_i32::<LittleEndian>()?,
        layer: r.read_i32::<LittleEndian>()?,
        user_id: r.read_u32::<LittleEndian>()?,
        poly_count: r.read_i32::<LittleEndian>()?,
        vert_count: r.read_i32::<LittleEndian>()?,
        max_link_count: r.read_i32::<LittleEndian>()?,
        detail_mesh_count: r.read_i32::<LittleEndian>()?,
        detail_vert_count: r.read_i32::<LittleEndian>()?,
        detail_tri_count: r.read_i32::<LittleEndian>()?,
        bv_node_count: r.read_i32::<LittleEndian>()?,
        off_mesh_con_count: r.read_i32::<LittleEndian>()?,
        off_mesh_base: r.read_i32::<LittleEndian>()?,
        walkable_height: r.read_f32::<LittleEndian>()?,
        walkable_radius: r.read_f32::<LittleEndian>()?,
        walkable_climb: r.read_f32::<LittleEndian>()?,
        ..TileHeader::default()
    };
    read_f32s(r, &mut h.bmin)?;
    read_f32s(r, &mut h.bmax)?;
    h.bv_quant_factor = r.read_f32::<LittleEndian>()?;
    Ok(h)
}

fn write_f32s<W: Write>(w: &mut W, values: &[f32]) -> Result<()> {
    for &v in values {
        w.write_f32::<LittleEndian>(v)?;
    }
    Ok(())
}

fn read_f32s<R: Read>(r: &mut R, out: &mut [f32]) -> Result<()> {
    r.read_f32_into::<LittleEndian>(out)?;
    Ok(())
}

/// Validates a count read from a header
fn element_count(name: &str, count: i32) -> Result<usize> {
    if !(0..=MAX_ELEMENT_COUNT).contains(&count) {
        return Err(Error::InvalidMesh(format!("{} count {} out of range", name, count)));
    }
    Ok(count as usize)
}

/// Checks that the header counts describe the payload arrays
fn check_counts(data: &MeshData) -> Result<()> {
    let h = &data.header;
    let checks = [
        ("poly", h.poly_count as i64, data.polys.len() as i64),
        ("vertex", h.vert_count as i64 * 3, data.verts.len() as i64),
        ("detail mesh", h.detail_mesh_count as i64, data.detail_meshes.len() as i64),
        ("detail vertex", h.detail_vert_count as i64 * 3, data.detail_verts.len() as i64),
        ("detail triangle", h.detail_tri_count as i64 * 4, data.detail_tris.len() as i64),
        ("bv node", h.bv_node_count as i64, data.bv_tree.len() as i64),
        ("off-mesh connection", h.off_mesh_con_count as i64, data.off_mesh_cons.len() as i64),
    ];
    for (name, expected, actual) in checks {
        if expected != actual {
            return Err(Error::InvalidMesh(format!(
                "header expects {} {} entries, payload has {}",
                expected, name, actual
            )));
        }
    }
    Ok(())
}

/// Checks that every index stored in the payload points inside its array
fn check_indices(data: &MeshData) -> Result<()> {
    let invalid = |msg: String| Err(Error::InvalidMesh(msg));
    let vert_count = data.verts.len() / 3;
    let poly_count = data.polys.len();
    let detail_vert_count = data.detail_verts.len() / 3;
    let detail_tri_count = data.detail_tris.len() / 4;

    for (i, poly) in data.polys.iter().enumerate() {
        let nverts = poly.nverts();
        if let Some(&v) = poly.verts[..nverts].iter().find(|&&v| v as usize >= vert_count) {
            return invalid(format!("poly {} references vertex {} of {}", i, v, vert_count));
        }
        let mut internal = poly.neis[..nverts].iter().filter(|&&n| n != 0 && n & EXT_LINK == 0);
        if let Some(&n) = internal.find(|&&n| n as usize > poly_count) {
            return invalid(format!("poly {} neighbour {} out of {} polys", i, n - 1, poly_count));
        }
    }

    for (i, pd) in data.detail_meshes.iter().enumerate() {
        let nverts = data.polys.get(i).map_or(0, Poly::nverts);
        let vert_end = pd.vert_base as usize + pd.vert_count as usize;
        let tri_end = pd.tri_base as usize + pd.tri_count as usize;
        if vert_end > detail_vert_count || tri_end > detail_tri_count {
            return invalid(format!("detail mesh {} exceeds the detail arrays", i));
        }
        let tris = &data.detail_tris[pd.tri_base as usize * 4..tri_end * 4];
        for tri in tris.chunks_exact(4) {
            if tri[..3].iter().any(|&t| t as usize >= nverts + pd.vert_count as usize) {
                return invalid(format!("detail mesh {} triangle index out of range", i));
            }
        }
    }

    for (i, node) in data.bv_tree.iter().enumerate() {
        let in_range = if node.i >= 0 {
            (node.i as usize) < poly_count
        } else {
            node.i != i32::MIN && i + (-node.i) as usize <= data.bv_tree.len()
        };
        if !in_range {
            return invalid(format!("bv node {} has index {} out of range", i, node.i));
        }
    }

    for (i, con) in data.off_mesh_cons.iter().enumerate() {
        let poly = data.polys.get(con.poly as usize);
        if !poly.is_some_and(Poly::is_off_mesh_connection) {
            return invalid(format!(
                "off-mesh connection {} references poly {} which is not a connection",
                i, con.poly
            ));
        }
    }

    Ok(())
}

fn write_poly<W: Write>(w: &mut W, poly: &Poly) -> Result<()> {
    for &v in &poly.verts {
        w.write_u16::<LittleEndian>(v)?;
    }
    for &n in &poly.neis {
        w.write_u16::<LittleEndian>(n)?;
    }
    w.write_u16::<LittleEndian>(poly.flags.bits())?;
    w.write_u8(poly.vert_count)?;
    let ty = match poly.poly_type {
        PolyType::Ground => 0,
        PolyType::OffMeshConnection => 1,
    };
    w.write_u8((poly.area & 0x3f) | (ty << 6))?;
    Ok(())
}

fn read_poly<R: Read>(r: &mut R) -> Result<Poly> {
    let mut poly = Poly::default();
    r.read_u16_into::<LittleEndian>(&mut poly.verts)?;
    r.read_u16_into::<LittleEndian>(&mut poly.neis)?;
    poly.flags = PolyFlags::from_bits_retain(r.read_u16::<LittleEndian>()?);
    poly.vert_count = r.read_u8()?;
    if poly.vert_count as usize > MAX_VERTS_PER_POLY {
        return Err(Error::InvalidMesh(format!(
            "polygon has {} vertices, at most {} are supported",
            poly.vert_count, MAX_VERTS_PER_POLY
        )));
    }
    let area_and_type = r.read_u8()?;
    poly.area = area_and_type & 0x3f;
    poly.poly_type = match area_and_type >> 6 {
        0 => PolyType::Ground,
        1 => PolyType::OffMeshConnection,
        other => return Err(Error::InvalidMesh(format!("unknown polygon type {}", other))),
    };
    Ok(poly)
}

/// Writes a tile payload
pub fn write_mesh_data<W: Write>(w: &mut W, data: &MeshData) -> Result<()> {
    check_counts(data)?;
    write_header(w, &data.header)?;

    write_f32s(w, &data.verts)?;
    for poly in &data.polys {
        write_poly(w, poly)?;
    }
    for pd in &data.detail_meshes {
        w.write_u32::<LittleEndian>(pd.vert_base)?;
        w.write_u32::<LittleEndian>(pd.tri_base)?;
        w.write_u8(pd.vert_count)?;
        w.write_u8(pd.tri_count)?;
    }
    write_f32s(w, &data.detail_verts)?;
    w.write_all(&data.detail_tris)?;
    for node in &data.bv_tree {
        for &v in node.bmin.iter().chain(node.bmax.iter()) {
            w.write_u16::<LittleEndian>(v)?;
        }
        w.write_i32::<LittleEndian>(node.i)?;
    }
    for con in &data.off_mesh_cons {
        write_f32s(w, &con.pos)?;
        w.write_f32::<LittleEndian>(con.rad)?;
        w.write_u16::<LittleEndian>(con.poly)?;
        w.write_u8(con.flags)?;
        w.write_u8(con.side)?;
        w.write_u32::<LittleEndian>(con.user_id)?;
    }
    Ok(())
}

/// Reads a tile payload, checking its magic number and version
pub fn read_mesh_data<R: Read>(r: &mut R) -> Result<MeshData> {
    let header = read_header(r)?;

    let vert_count = element_count("vertex", header.vert_count)?;
    let poly_count = element_count("poly", header.poly_count)?;
    let detail_mesh_count = element_count("detail mesh", header.detail_mesh_count)?;
    let detail_vert_count = element_count("detail vertex", header.detail_vert_count)?;
    let detail_tri_count = element_count("detail triangle", header.detail_tri_count)?;
    let bv_node_count = element_count("bv node", header.bv_node_count)?;
    let off_mesh_con_count = element_count("off-mesh connection", header.off_mesh_con_count)?;

    let mut verts = vec![0.0; vert_count * 3];
    read_f32s(r, &mut verts)?;

    let polys = (0..poly_count).map(|_| read_poly(r)).collect::<Result<Vec<_>>>()?;

    let mut detail_meshes = Vec::with_capacity(detail_mesh_count);
    for _ in 0..detail_mesh_count {
        detail_meshes.push(PolyDetail {
            vert_base: r.read_u32::<LittleEndian>()?,
            tri_base: r.read_u32::<LittleEndian>()?,
            vert_count: r.read_u8()?,
            tri_count: r.read_u8()?,
        });
    }

    let mut detail_verts = vec![0.0; detail_vert_count * 3];
    read_f32s(r, &mut detail_verts)?;

    let mut detail_tris = vec![0u8; detail_tri_count * 4];
    r.read_exact(&mut detail_tris)?;

    let mut bv_tree = Vec::with_capacity(bv_node_count);
    for _ in 0..bv_node_count {
        let mut node = BVNode::default();
        r.read_u16_into::<LittleEndian>(&mut node.bmin)?;
        r.read_u16_into::<LittleEndian>(&mut node.bmax)?;
        node.i = r.read_i32::<LittleEndian>()?;
        bv_tree.push(node);
    }

    let mut off_mesh_cons = Vec::with_capacity(off_mesh_con_count);
    for _ in 0..off_mesh_con_count {
        let mut con = OffMeshConnection::default();
        read_f32s(r, &mut con.pos)?;
        con.rad = r.read_f32::<LittleEndian>()?;
        con.poly = r.read_u16::<LittleEndian>()?;
        con.flags = r.read_u8()?;
        con.side = r.read_u8()?;
        con.user_id = r.read_u32::<LittleEndian>()?;
        off_mesh_cons.push(con);
    }

    let data = MeshData {
        header,
        verts,
        polys,
        detail_meshes,
        detail_verts,
        detail_tris,
        bv_tree,
        off_mesh_cons,
    };
    check_indices(&data)?;
    Ok(data)
}

/// Encodes a tile payload into a byte buffer
pub fn mesh_data_to_bytes(data: &MeshData) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    write_mesh_data(&mut buffer, data)?;
    Ok(buffer)
}

/// Decodes a tile payload from a byte buffer
pub fn mesh_data_from_bytes(bytes: &[u8]) -> Result<MeshData> {
    read_mesh_data(&mut Cursor::new(bytes))
}

fn write_params<W: Write>(w: &mut W, params: &NavMeshParams) -> Result<()> {
    write_f32s(w, &params.origin)?;
    w.write_f32::<LittleEndian>(params.tile_width)?;
    w.write_f32::<LittleEndian>(params.tile_height)?;
    w.write_i32::<LittleEndian>(params.max_tiles)?;
    w.write_i32::<LittleEndian>(params.max_polys_per_tile)?;
    Ok(())
}

fn read_params<R: Read>(r: &mut R) -> Result<NavMeshParams> {
    let mut params = NavMeshParams::default();
    read_f32s(r, &mut params.origin)?;
    params.tile_width = r.read_f32::<LittleEndian>()?;
    params.tile_height = r.read_f32::<LittleEndian>()?;
    params.max_tiles = r.read_i32::<LittleEndian>()?;
    params.max_polys_per_tile = r.read_i32::<LittleEndian>()?;
    Ok(params)
}

/// Writes every tile of a mesh together with the mesh parameters
pub fn save_nav_mesh<W: Write>(w: &mut W, nav: &NavMesh) -> Result<()> {
    w.write_u32::<LittleEndian>(NAVMESH_SET_MAGIC)?;
    w.write_u32::<LittleEndian>(NAVMESH_SET_VERSION)?;
    w.write_u32::<LittleEndian>(nav.tile_count() as u32)?;
    write_params(w, nav.params())?;

    for tile in nav.tiles() {
        let tile_data = mesh_data_to_bytes(&tile.data)?;
        w.write_u64::<LittleEndian>(nav.get_tile_ref(tile).id())?;
        w.write_u32::<LittleEndian>(tile.flags)?;
        w.write_u32::<LittleEndian>(tile_data.len() as u32)?;
        w.write_all(&tile_data)?;
    }
    Ok(())
}

/// Reads a mesh written by [`save_nav_mesh`]
///
/// Tiles are restored into their original slots, so polygon references
/// obtained before saving remain valid.
pub fn load_nav_mesh<R: Read>(r: &mut R) -> Result<NavMesh> {
    let magic = r.read_u32::<LittleEndian>()?;
    if magic != NAVMESH_SET_MAGIC {
        return Err(Error::WrongMagic(magic));
    }
    let version = r.read_u32::<LittleEndian>()?;
    if version != NAVMESH_SET_VERSION {
        return Err(Error::WrongVersion(version));
    }
    let tile_count = r.read_u32::<LittleEndian>()?;
    let params = read_params(r)?;
    let mut nav = NavMesh::new(params)?;

    for _ in 0..tile_count {
        let tile_ref = TileRef::new(r.read_u64::<LittleEndian>()?);
        let flags = r.read_u32::<LittleEndian>()?;
        let size = r.read_u32::<LittleEndian>()? as usize;

        let mut tile_data = Vec::new();
        r.by_ref().take(size as u64).read_to_end(&mut tile_data)?;
        if tile_data.len() != size {
            return Err(Error::InvalidMesh(format!(
                "tile payload truncated: expected {} bytes, got {}",
                size,
                tile_data.len()
            )));
        }

        let data = mesh_data_from_bytes(&tile_data)?;
        nav.add_tile(data, flags, tile_ref)?;
    }

    log::debug!("Loaded navigation mesh with {} tiles", nav.tile_count());
    Ok(nav)
}

/// Saves a mesh to a file
pub fn save_nav_mesh_to_file(nav: &NavMesh, path: impl AsRef<Path>) -> Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    save_nav_mesh(&mut w, nav)?;
    w.flush()?;
    Ok(())
}

/// Loads a mesh from a file written by [`save_nav_mesh_to_file`]
pub fn load_nav_mesh_from_file(path: impl AsRef<Path>) -> Result<NavMesh> {
    let mut r = BufReader::new(File::open(path)?);
    load_nav_mesh(&mut r)
}

/// Stores the polygon flags and areas of a tile
pub fn store_tile_state(nav: &NavMesh, tile_ref: TileRef) -> Result<Vec<u8>> {
    let tile = nav
        .get_tile_by_ref(tile_ref)
        .ok_or(Error::InvalidTileRef(tile_ref.id()))?;

    let mut buffer = Vec::with_capacity(16 + tile.data.polys.len() * 3);
    buffer.write_u32::<LittleEndian>(NAVMESH_STATE_MAGIC)?;
    buffer.write_u32::<LittleEndian>(NAVMESH_STATE_VERSION)?;
    buffer.write_u64::<LittleEndian>(tile_ref.id())?;
    for poly in &tile.data.polys {
        buffer.write_u16::<LittleEndian>(poly.flags.bits())?;
        buffer.write_u8(poly.area)?;
    }
    Ok(buffer)
}

/// Restores polygon flags and areas saved by [`store_tile_state`]
///
/// The state must have been stored for the same tile reference.
pub fn restore_tile_state(nav: &mut NavMesh, tile_ref: TileRef, state: &[u8]) -> Result<()> {
    let poly_count = nav
        .get_tile_by_ref(tile_ref)
        .ok_or(Error::InvalidTileRef(tile_ref.id()))?
        .data
        .polys
        .len();

    let mut r = Cursor::new(state);
    let magic = r.read_u32::<LittleEndian>()?;
    if magic != NAVMESH_STATE_MAGIC {
        return Err(Error::WrongMagic(magic));
    }
    let version = r.read_u32::<LittleEndian>()?;
    if version != NAVMESH_STATE_VERSION {
        return Err(Error::WrongVersion(version));
    }
    let stored_ref = PolyRef::new(r.read_u64::<LittleEndian>()?);
    if stored_ref != tile_ref {
        return Err(Error::InvalidTileRef(stored_ref.id()));
    }

    for ip in 0..poly_count {
        let flags = PolyFlags::from_bits_retain(r.read_u16::<LittleEndian>()?);
        let area = r.read_u8()?;
        let poly_ref = tile_ref.with_poly(ip as u32);
        nav.set_poly_flags(poly_ref, flags)?;
        nav.set_poly_area(poly_ref, area)?;
    }
    Ok(())
}
