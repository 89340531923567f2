//! Tile payload creation from a polygon mesh
//!
//! [`create_nav_mesh_data`] converts a quantized polygon mesh (as produced by
//! a voxelization pipeline) plus optional detail meshes and off-mesh
//! connections into the [`MeshData`] layout consumed by
//! [`NavMesh::add_tile`](crate::NavMesh::add_tile).

use super::bvh_tree::{build_bv_tree, BVItem};
use super::nav_mesh::{MeshData, OffMeshConnection, Poly, PolyDetail, TileHeader};
use super::{
    PolyFlags, PolyType, EXT_LINK, MAX_VERTS_PER_POLY, NAVMESH_MAGIC, NAVMESH_VERSION,
    OFFMESH_CON_BIDIR,
};
use navtile_common::{Error, Result};

/// Marks an unused polygon vertex slot or a missing neighbour
pub const MESH_NULL_IDX: u16 = 0xffff;

/// Input of [`create_nav_mesh_data`]
///
/// Polygon vertices are in voxel units relative to `bmin` (`cs` on the xz
/// plane, `ch` vertically). `polys` stores `nvp` vertex indices followed by
/// `nvp` neighbour entries per polygon. A neighbour entry is either a polygon
/// index, [`MESH_NULL_IDX`], or `0x8000 | dir` for an edge on the tile border
/// where `dir` is 0 (x-), 1 (z+), 2 (x+), 3 (z-) or 0xf (solid border).
#[derive(Debug, Clone, Default)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct NavMeshCreateParams {
    /// Quantized vertices, three per vertex
    pub verts: Vec<u16>,
    pub vert_count: i32,
    /// Vertex indices and neighbours, `2 * nvp` per polygon
    pub polys: Vec<u16>,
    pub poly_flags: Vec<PolyFlags>,
    pub poly_areas: Vec<u8>,
    pub poly_count: i32,
    /// Maximum number of vertices per polygon
    pub nvp: i32,

    /// Per polygon `[vert_base, vert_count, tri_base, tri_count]`
    ///
    /// Empty when there is no detail mesh; polygons are then fan
    /// triangulated.
    pub detail_meshes: Vec<u32>,
    /// World space detail vertices; each polygon's sub-mesh starts with the
    /// polygon's own vertices
    pub detail_verts: Vec<f32>,
    pub detail_vert_count: i32,
    /// Four bytes per triangle: vertex indices local to the sub-mesh and
    /// edge flags
    pub detail_tris: Vec<u8>,
    pub detail_tri_count: i32,

    /// Start and end point of each connection, six floats per connection
    pub off_mesh_con_verts: Vec<f32>,
    pub off_mesh_con_rad: Vec<f32>,
    pub off_mesh_con_flags: Vec<PolyFlags>,
    pub off_mesh_con_areas: Vec<u8>,
    /// Non-zero for connections that can be travelled both ways
    pub off_mesh_con_dir: Vec<u8>,
    pub off_mesh_con_user_id: Vec<u32>,
    pub off_mesh_con_count: i32,

    pub user_id: u32,
    pub tile_x: i32,
    pub tile_y: i32,
    pub tile_layer: i32,
    /// World space bounds of the tile
    pub bmin: [f32; 3],
    pub bmax: [f32; 3],

    pub walkable_height: f32,
    pub walkable_radius: f32,
    pub walkable_climb: f32,
    /// Cell size on the xz plane
    pub cs: f32,
    /// Cell height
    pub ch: f32,

    /// Build a bounding volume tree for fast polygon lookups
    pub build_bv_tree: bool,
}

const XP: u8 = 1 << 0;
const ZP: u8 = 1 << 1;
const XM: u8 = 1 << 2;
const ZM: u8 = 1 << 3;

/// Compass side of a point relative to tile bounds, 0xff when inside
pub fn classify_off_mesh_point(pt: &[f32], bmin: &[f32; 3], bmax: &[f32; 3]) -> u8 {
    let mut outcode = 0;
    if pt[0] >= bmax[0] {
        outcode |= XP;
    }
    if pt[2] >= bmax[2] {
        outcode |= ZP;
    }
    if pt[0] < bmin[0] {
        outcode |= XM;
    }
    if pt[2] < bmin[2] {
        outcode |= ZM;
    }

    match outcode {
        XP => 0,
        o if o == XP | ZP => 1,
        ZP => 2,
        o if o == XM | ZP => 3,
        XM => 4,
        o if o == XM | ZM => 5,
        ZM => 6,
        o if o == XP | ZM => 7,
        _ => 0xff,
    }
}

fn validate_params(params: &NavMeshCreateParams) -> Result<()> {
    let invalid = |msg: String| Err(Error::InvalidMesh(msg));

    if params.nvp < 3 || params.nvp as usize > MAX_VERTS_PER_POLY {
        return invalid(format!(
            "nvp must be in 3..={}, got {}",
            MAX_VERTS_PER_POLY, params.nvp
        ));
    }
    if params.vert_count <= 0 || params.verts.is_empty() {
        return invalid("mesh has no vertices".to_string());
    }
    if params.vert_count >= 0xffff {
        return invalid(format!("too many vertices: {}", params.vert_count));
    }
    if params.poly_count <= 0 || params.polys.is_empty() {
        return invalid("mesh has no polygons".to_string());
    }

    let nvp = params.nvp as usize;
    let npolys = params.poly_count as usize;
    if params.verts.len() != params.vert_count as usize * 3 {
        return invalid(format!(
            "expected {} vertex components, got {}",
            params.vert_count * 3,
            params.verts.len()
        ));
    }
    if params.polys.len() != npolys * nvp * 2 {
        return invalid(format!(
            "expected {} polygon entries, got {}",
            npolys * nvp * 2,
            params.polys.len()
        ));
    }
    if params.poly_flags.len() != npolys || params.poly_areas.len() != npolys {
        return invalid("poly_flags and poly_areas need one entry per polygon".to_string());
    }

    for (i, poly) in params.polys.chunks_exact(nvp * 2).enumerate() {
        let nv = poly[..nvp].iter().take_while(|&&v| v != MESH_NULL_IDX).count();
        if nv < 3 {
            return invalid(format!("polygon {} has {} vertices", i, nv));
        }
        if let Some(&v) = poly[..nv].iter().find(|&&v| v as i32 >= params.vert_count) {
            return invalid(format!("polygon {} references missing vertex {}", i, v));
        }
        for &nei in &poly[nvp..nvp + nv] {
            if nei != MESH_NULL_IDX && nei & 0x8000 == 0 && nei as i32 >= params.poly_count {
                return invalid(format!("polygon {} references missing neighbour {}", i, nei));
            }
        }
    }

    if !params.detail_meshes.is_empty() {
        if params.detail_meshes.len() != npolys * 4 {
            return invalid("detail_meshes needs four entries per polygon".to_string());
        }
        if params.detail_verts.len() != params.detail_vert_count.max(0) as usize * 3 {
            return invalid("detail vertex count does not match detail_verts".to_string());
        }
        if params.detail_tris.len() != params.detail_tri_count.max(0) as usize * 4 {
            return invalid("detail triangle count does not match detail_tris".to_string());
        }
        for (i, dm) in params.detail_meshes.chunks_exact(4).enumerate() {
            if (dm[0] + dm[1]) as i32 > params.detail_vert_count
                || (dm[2] + dm[3]) as i32 > params.detail_tri_count
            {
                return invalid(format!("detail mesh {} is out of range", i));
            }
        }
    }

    let ncons = params.off_mesh_con_count.max(0) as usize;
    if ncons > 0
        && (params.off_mesh_con_verts.len() != ncons * 6
            || params.off_mesh_con_rad.len() != ncons
            || params.off_mesh_con_flags.len() != ncons
            || params.off_mesh_con_areas.len() != ncons
            || params.off_mesh_con_dir.len() != ncons)
    {
        return invalid("off-mesh connection arrays do not match their count".to_string());
    }
    if !params.off_mesh_con_user_id.is_empty() && params.off_mesh_con_user_id.len() != ncons {
        return invalid("off_mesh_con_user_id needs one entry per connection".to_string());
    }

    if !(params.cs > 0.0) || !(params.ch > 0.0) {
        return invalid(format!(
            "cell size and height must be positive, got {} and {}",
            params.cs, params.ch
        ));
    }

    Ok(())
}

fn poly_vert_count(poly: &[u16], nvp: usize) -> usize {
    poly[..nvp].iter().take_while(|&&v| v != MESH_NULL_IDX).count()
}

/// Builds the tile payload
///
/// Off-mesh connections are stored in the tile that contains their start
/// point; connections starting outside the tile, or at a height the tile
/// cannot reach, are dropped.
pub fn create_nav_mesh_data(params: &NavMeshCreateParams) -> Result<MeshData> {
    validate_params(params)?;

    let nvp = params.nvp as usize;
    let npolys = params.poly_count as usize;
    let nverts = params.vert_count as usize;
    let ncons = params.off_mesh_con_count.max(0) as usize;

    // Classify off-mesh connection end points against the tile bounds with
    // a tight height range.
    let mut con_class = vec![[0u8; 2]; ncons];
    let mut stored_con_count = 0;
    let mut con_link_count = 0;
    if ncons > 0 {
        let (mut hmin, mut hmax) = (f32::MAX, -f32::MAX);
        if !params.detail_verts.is_empty() {
            for v in params.detail_verts.chunks_exact(3) {
                hmin = hmin.min(v[1]);
                hmax = hmax.max(v[1]);
            }
        } else {
            for v in params.verts.chunks_exact(3) {
                let h = params.bmin[1] + v[1] as f32 * params.ch;
                hmin = hmin.min(h);
                hmax = hmax.max(h);
            }
        }
        hmin -= params.walkable_climb;
        hmax += params.walkable_climb;

        let mut bmin = params.bmin;
        let mut bmax = params.bmax;
        bmin[1] = hmin;
        bmax[1] = hmax;

        for (i, class) in con_class.iter_mut().enumerate() {
            let p0 = &params.off_mesh_con_verts[i * 6..i * 6 + 3];
            let p1 = &params.off_mesh_con_verts[i * 6 + 3..i * 6 + 6];
            class[0] = classify_off_mesh_point(p0, &bmin, &bmax);
            class[1] = classify_off_mesh_point(p1, &bmin, &bmax);

            // Drop start points which cannot touch the mesh vertically.
            if class[0] == 0xff && (p0[1] < bmin[1] || p0[1] > bmax[1]) {
                class[0] = 0;
            }

            if class[0] == 0xff {
                con_link_count += 1;
                stored_con_count += 1;
            }
            if class[1] == 0xff {
                con_link_count += 1;
            }
        }
    }

    let tot_poly_count = npolys + stored_con_count;
    let tot_vert_count = nverts + stored_con_count * 2;

    // Count portal edges on tile borders for link storage.
    let mut edge_count = 0;
    let mut portal_count = 0;
    for poly in params.polys.chunks_exact(nvp * 2) {
        let nv = poly_vert_count(poly, nvp);
        edge_count += nv;
        portal_count += poly[nvp..nvp + nv]
            .iter()
            .filter(|&&n| n != MESH_NULL_IDX && n & 0x8000 != 0 && n & 0xf != 0xf)
            .count();
    }
    let max_link_count = edge_count + portal_count * 2 + con_link_count * 2;

    // Vertices, dequantized, followed by the off-mesh end points.
    let mut verts = Vec::with_capacity(tot_vert_count * 3);
    for v in params.verts.chunks_exact(3) {
        verts.push(params.bmin[0] + v[0] as f32 * params.cs);
        verts.push(params.bmin[1] + v[1] as f32 * params.ch);
        verts.push(params.bmin[2] + v[2] as f32 * params.cs);
    }
    for (i, class) in con_class.iter().enumerate() {
        if class[0] == 0xff {
            verts.extend_from_slice(&params.off_mesh_con_verts[i * 6..i * 6 + 6]);
        }
    }

    // Ground polygons with border edges remapped to compass sides.
    let mut polys = Vec::with_capacity(tot_poly_count);
    for (i, src) in params.polys.chunks_exact(nvp * 2).enumerate() {
        let mut poly = Poly {
            flags: params.poly_flags[i],
            area: params.poly_areas[i] & 0x3f,
            poly_type: PolyType::Ground,
            ..Poly::default()
        };
        let nv = poly_vert_count(src, nvp);
        for j in 0..nv {
            poly.verts[j] = src[j];
            let nei = src[nvp + j];
            poly.neis[j] = if nei == MESH_NULL_IDX {
                0
            } else if nei & 0x8000 != 0 {
                match nei & 0xf {
                    0 => EXT_LINK | 4,
                    1 => EXT_LINK | 2,
                    2 => EXT_LINK,
                    3 => EXT_LINK | 6,
                    _ => 0,
                }
            } else {
                nei + 1
            };
        }
        poly.vert_count = nv as u8;
        polys.push(poly);
    }

    let mut off_mesh_cons = Vec::with_capacity(stored_con_count);
    let mut n = 0;
    for (i, class) in con_class.iter().enumerate() {
        if class[0] != 0xff {
            continue;
        }
        let poly_index = npolys + n;
        let vert_index = (nverts + n * 2) as u16;
        let mut poly = Poly {
            flags: params.off_mesh_con_flags[i],
            area: params.off_mesh_con_areas[i] & 0x3f,
            poly_type: PolyType::OffMeshConnection,
            vert_count: 2,
            ..Poly::default()
        };
        poly.verts[0] = vert_index;
        poly.verts[1] = vert_index + 1;
        polys.push(poly);

        let mut pos = [0.0; 6];
        pos.copy_from_slice(&params.off_mesh_con_verts[i * 6..i * 6 + 6]);
        off_mesh_cons.push(OffMeshConnection {
            pos,
            rad: params.off_mesh_con_rad[i],
            poly: poly_index as u16,
            flags: if params.off_mesh_con_dir[i] != 0 {
                OFFMESH_CON_BIDIR
            } else {
                0
            },
            side: class[1],
            user_id: params.off_mesh_con_user_id.get(i).copied().unwrap_or(0),
        });
        n += 1;
    }

    // Detail meshes. Polygon vertices lead each input sub-mesh; only the
    // extra vertices are kept.
    let mut detail_meshes = Vec::with_capacity(npolys);
    let mut detail_verts = Vec::new();
    let detail_tris;
    if !params.detail_meshes.is_empty() {
        for (i, dm) in params.detail_meshes.chunks_exact(4).enumerate() {
            let (vb, ndv) = (dm[0] as usize, dm[1] as usize);
            let nv = polys[i].nverts();
            let extra = ndv.saturating_sub(nv);
            detail_meshes.push(PolyDetail {
                vert_base: (detail_verts.len() / 3) as u32,
                tri_base: dm[2],
                vert_count: extra as u8,
                tri_count: dm[3] as u8,
            });
            if extra > 0 {
                let start = (vb + nv) * 3;
                let src = params.detail_verts.get(start..start + extra * 3).ok_or_else(|| {
                    Error::InvalidMesh(format!("detail mesh {} runs past detail_verts", i))
                })?;
                detail_verts.extend_from_slice(src);
            }
        }
        detail_tris = params.detail_tris.clone();
    } else {
        // Fan triangulate each polygon, flagging edges on its boundary.
        let mut tris = Vec::new();
        for poly in &polys[..npolys] {
            let nv = poly.nverts();
            detail_meshes.push(PolyDetail {
                vert_base: 0,
                tri_base: (tris.len() / 4) as u32,
                vert_count: 0,
                tri_count: (nv - 2) as u8,
            });
            for j in 2..nv {
                let mut edge_flags = 1 << 2;
                if j == 2 {
                    edge_flags |= 1;
                }
                if j == nv - 1 {
                    edge_flags |= 1 << 4;
                }
                tris.extend_from_slice(&[0, (j - 1) as u8, j as u8, edge_flags]);
            }
        }
        detail_tris = tris;
    }

    let bv_tree = if params.build_bv_tree {
        let mut items = bv_items(params);
        build_bv_tree(&mut items)
    } else {
        Vec::new()
    };

    let header = TileHeader {
        magic: NAVMESH_MAGIC,
        version: NAVMESH_VERSION,
        x: params.tile_x,
        y: params.tile_y,
        layer: params.tile_layer,
        user_id: params.user_id,
        poly_count: tot_poly_count as i32,
        vert_count: tot_vert_count as i32,
        max_link_count: max_link_count as i32,
        detail_mesh_count: npolys as i32,
        detail_vert_count: (detail_verts.len() / 3) as i32,
        detail_tri_count: (detail_tris.len() / 4) as i32,
        bv_node_count: bv_tree.len() as i32,
        off_mesh_base: npolys as i32,
        off_mesh_con_count: stored_con_count as i32,
        walkable_height: params.walkable_height,
        walkable_radius: params.walkable_radius,
        walkable_climb: params.walkable_climb,
        bmin: params.bmin,
        bmax: params.bmax,
        bv_quant_factor: 1.0 / params.cs,
    };

    log::debug!(
        "Created tile ({}, {}, layer {}): {} polys, {} verts, {} detail tris, {} BV nodes, {}/{} off-mesh connections",
        header.x,
        header.y,
        header.layer,
        header.poly_count,
        header.vert_count,
        header.detail_tri_count,
        header.bv_node_count,
        stored_con_count,
        ncons
    );

    Ok(MeshData {
        header,
        verts,
        polys,
        detail_meshes,
        detail_verts,
        detail_tris,
        bv_tree,
        off_mesh_cons,
    })
}

/// Quantized bounds of every ground polygon
///
/// The tree uses `cs` for all three axes.
fn bv_items(params: &NavMeshCreateParams) -> Vec<BVItem> {
    let nvp = params.nvp as usize;
    let quant_factor = 1.0 / params.cs;
    let has_detail = !params.detail_meshes.is_empty();

    params
        .polys
        .chunks_exact(nvp * 2)
        .enumerate()
        .map(|(i, poly)| {
            let mut item = BVItem {
                i: i as i32,
                ..BVItem::default()
            };

            if has_detail {
                let vb = params.detail_meshes[i * 4] as usize;
                let ndv = params.detail_meshes[i * 4 + 1] as usize;
                let mut bmin = [f32::MAX; 3];
                let mut bmax = [-f32::MAX; 3];
                for v in params.detail_verts[vb * 3..(vb + ndv) * 3].chunks_exact(3) {
                    for k in 0..3 {
                        bmin[k] = bmin[k].min(v[k]);
                        bmax[k] = bmax[k].max(v[k]);
                    }
                }
                for k in 0..3 {
                    item.bmin[k] = (((bmin[k] - params.bmin[k]) * quant_factor) as i32).max(0);
                    item.bmax[k] = (((bmax[k] - params.bmin[k]) * quant_factor) as i32).max(0);
                }
            } else {
                let nv = poly_vert_count(poly, nvp);
                let first = poly[0] as usize * 3;
                for k in 0..3 {
                    item.bmin[k] = params.verts[first + k] as i32;
                    item.bmax[k] = item.bmin[k];
                }
                for &vi in &poly[1..nv] {
                    let v = &params.verts[vi as usize * 3..vi as usize * 3 + 3];
                    for k in 0..3 {
                        item.bmin[k] = item.bmin[k].min(v[k] as i32);
                        item.bmax[k] = item.bmax[k].max(v[k] as i32);
                    }
                }
                // Remap y from cell height to cell size units.
                item.bmin[1] = (item.bmin[1] as f32 * params.ch * quant_factor).floor() as i32;
                item.bmax[1] = (item.bmax[1] as f32 * params.ch * quant_factor).ceil() as i32;
            }
            item
        })
        .collect()
}
