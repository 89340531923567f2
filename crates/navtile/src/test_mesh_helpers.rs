//! Test mesh creation helpers
//!
//! Meshes are flat grids of square cells on the y = 0 plane. Every cell is
//! one quad polygon; cells on the tile border get portal edges so that
//! neighbouring tiles link up.

use crate::nav_mesh_builder::{create_nav_mesh_data, NavMeshCreateParams, MESH_NULL_IDX};
use crate::{MeshData, NavMesh, NavMeshParams, PolyFlags, PolyRef};
use navtile_common::Result;

/// Mesh parameters for square tiles anchored at the origin
pub fn grid_params(max_tiles: i32, tile_size: f32) -> NavMeshParams {
    NavMeshParams {
        origin: [0.0, 0.0, 0.0],
        tile_width: tile_size,
        tile_height: tile_size,
        max_tiles,
        max_polys_per_tile: 256,
    }
}

/// Creation parameters for a `cells` x `cells` grid tile at `(tx, ty)`
///
/// Polygon `z * cells + x` covers cell `(x, z)`. Its edges are, in order,
/// x-, z+, x+ and z-.
pub fn grid_create_params(tx: i32, ty: i32, cells: usize, cell_size: f32) -> NavMeshCreateParams {
    let n = cells;
    let tile_size = n as f32 * cell_size;

    let mut verts = Vec::new();
    for z in 0..=n {
        for x in 0..=n {
            verts.extend_from_slice(&[x as u16, 0, z as u16]);
        }
    }

    let vid = |x: usize, z: usize| (z * (n + 1) + x) as u16;
    let pid = |x: usize, z: usize| (z * n + x) as u16;

    let nvp = 6;
    let mut polys = Vec::new();
    for z in 0..n {
        for x in 0..n {
            let mut p = [MESH_NULL_IDX; 12];
            p[0] = vid(x, z);
            p[1] = vid(x, z + 1);
            p[2] = vid(x + 1, z + 1);
            p[3] = vid(x + 1, z);
            p[nvp] = if x > 0 { pid(x - 1, z) } else { 0x8000 };
            p[nvp + 1] = if z + 1 < n { pid(x, z + 1) } else { 0x8001 };
            p[nvp + 2] = if x + 1 < n { pid(x + 1, z) } else { 0x8002 };
            p[nvp + 3] = if z > 0 { pid(x, z - 1) } else { 0x8003 };
            polys.extend_from_slice(&p);
        }
    }

    let poly_count = n * n;
    NavMeshCreateParams {
        vert_count: ((n + 1) * (n + 1)) as i32,
        verts,
        polys,
        poly_flags: vec![PolyFlags::WALK; poly_count],
        poly_areas: vec![0; poly_count],
        poly_count: poly_count as i32,
        nvp: nvp as i32,
        tile_x: tx,
        tile_y: ty,
        bmin: [tx as f32 * tile_size, 0.0, ty as f32 * tile_size],
        bmax: [(tx + 1) as f32 * tile_size, 1.0, (ty + 1) as f32 * tile_size],
        walkable_height: 2.0,
        walkable_radius: 0.6,
        walkable_climb: 0.9,
        cs: cell_size,
        ch: 0.2,
        build_bv_tree: true,
        ..NavMeshCreateParams::default()
    }
}

/// Adds an off-mesh connection to creation parameters
pub fn add_off_mesh_connection(
    params: &mut NavMeshCreateParams,
    start: [f32; 3],
    end: [f32; 3],
    rad: f32,
    bidir: bool,
) {
    params.off_mesh_con_verts.extend_from_slice(&start);
    params.off_mesh_con_verts.extend_from_slice(&end);
    params.off_mesh_con_rad.push(rad);
    params.off_mesh_con_flags.push(PolyFlags::JUMP);
    params.off_mesh_con_areas.push(1);
    params.off_mesh_con_dir.push(u8::from(bidir));
    params.off_mesh_con_user_id.push(1000 + params.off_mesh_con_count as u32);
    params.off_mesh_con_count += 1;
}

/// Tile payload for a grid tile
pub fn create_grid_tile(tx: i32, ty: i32, cells: usize, cell_size: f32) -> Result<MeshData> {
    create_nav_mesh_data(&grid_create_params(tx, ty, cells, cell_size))
}

/// Single tile mesh with one square polygon spanning `0..size`
pub fn create_single_quad_mesh(size: f32) -> Result<NavMesh> {
    create_grid_mesh(1, size)
}

/// Single unit quad whose first vertex is the max corner
///
/// Same cell as a one-cell grid, with the outline starting at (1, 1)
/// instead of (0, 0).
pub fn create_rotated_quad_mesh() -> Result<NavMesh> {
    let mut params = grid_create_params(0, 0, 1, 1.0);
    // Vertices (0, 0) = 0, (1, 0) = 1, (0, 1) = 2, (1, 1) = 3.
    params.polys[..4].copy_from_slice(&[3, 1, 0, 2]);
    params.polys[6..10].copy_from_slice(&[0x8002, 0x8003, 0x8000, 0x8001]);

    let mut mesh = NavMesh::new(grid_params(1, 1.0))?;
    mesh.add_tile(create_nav_mesh_data(&params)?, 0, PolyRef::NULL)?;
    Ok(mesh)
}

/// Single tile mesh with a `cells` x `cells` grid
pub fn create_grid_mesh(cells: usize, cell_size: f32) -> Result<NavMesh> {
    let mut mesh = NavMesh::new(grid_params(1, cells as f32 * cell_size))?;
    mesh.add_tile(create_grid_tile(0, 0, cells, cell_size)?, 0, PolyRef::NULL)?;
    Ok(mesh)
}

/// Mesh with `tiles_x` x `tiles_y` grid tiles of `cells` x `cells` cells
pub fn create_tiled_mesh(
    tiles_x: i32,
    tiles_y: i32,
    cells: usize,
    cell_size: f32,
) -> Result<NavMesh> {
    let tile_size = cells as f32 * cell_size;
    let mut mesh = NavMesh::new(grid_params(tiles_x * tiles_y + 4, tile_size))?;
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            mesh.add_tile(create_grid_tile(tx, ty, cells, cell_size)?, 0, PolyRef::NULL)?;
        }
    }
    Ok(mesh)
}

/// Reference of the polygon covering cell `(x, z)` of the tile at `(tx, ty)`
pub fn grid_poly_ref(mesh: &NavMesh, tx: i32, ty: i32, cells: usize, x: usize, z: usize) -> PolyRef {
    mesh.get_tile_ref_at(tx, ty, 0)
        .with_poly((z * cells + x) as u32)
}
