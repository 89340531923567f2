//! Tests for tile payload creation

use crate::nav_mesh_builder::classify_off_mesh_point;
use crate::test_mesh_helpers::{add_off_mesh_connection, grid_create_params};
use crate::{create_nav_mesh_data, PolyType, EXT_LINK, NAVMESH_MAGIC, NAVMESH_VERSION};
use navtile_common::{Error, Result};

#[test]
fn test_grid_tile_header() -> Result<()> {
    let params = grid_create_params(2, 3, 3, 1.0);
    let data = create_nav_mesh_data(&params)?;
    let h = &data.header;

    assert_eq!(h.magic, NAVMESH_MAGIC);
    assert_eq!(h.version, NAVMESH_VERSION);
    assert_eq!((h.x, h.y, h.layer), (2, 3, 0));
    assert_eq!(h.poly_count, 9);
    assert_eq!(h.vert_count, 16);
    assert_eq!(h.detail_mesh_count, 9);
    assert_eq!(h.detail_vert_count, 0);
    assert_eq!(h.detail_tri_count, 18);
    assert_eq!(h.off_mesh_con_count, 0);
    assert_eq!(h.off_mesh_base, 9);
    assert_eq!(h.bmin, params.bmin);
    assert_eq!(h.bv_quant_factor, 1.0);
    // 36 edges plus two links for each of the 12 border edges.
    assert_eq!(h.max_link_count, 36 + 24);
    assert_eq!(h.bv_node_count as usize, data.bv_tree.len());
    assert_eq!(data.bv_tree.len(), 2 * 9 - 1);
    Ok(())
}

#[test]
fn test_vertices_are_dequantized() -> Result<()> {
    let data = create_nav_mesh_data(&grid_create_params(1, 0, 2, 0.5))?;

    // Tile (1, 0) of 2 cells of 0.5 starts at x = 1.
    assert_eq!(&data.verts[..3], &[1.0, 0.0, 0.0]);
    let last = data.verts.len() - 3;
    assert_eq!(&data.verts[last..], &[2.0, 0.0, 1.0]);
    Ok(())
}

#[test]
fn test_border_neighbours_are_remapped_to_sides() -> Result<()> {
    let data = create_nav_mesh_data(&grid_create_params(0, 0, 2, 1.0))?;

    // Cell (0, 0): x- border, internal z+ and x+, z- border.
    let p = &data.polys[0];
    assert_eq!(p.nverts(), 4);
    assert_eq!(p.neis[0], EXT_LINK | 4);
    assert_eq!(p.neis[1], 3);
    assert_eq!(p.neis[2], 2);
    assert_eq!(p.neis[3], EXT_LINK | 6);

    // Cell (1, 1): internal x- and z-, borders to z+ and x+.
    let p = &data.polys[3];
    assert_eq!(p.neis[0], 3);
    assert_eq!(p.neis[1], EXT_LINK | 2);
    assert_eq!(p.neis[2], EXT_LINK);
    assert_eq!(p.neis[3], 2);
    Ok(())
}

#[test]
fn test_detail_triangles_fan_polygons() -> Result<()> {
    let data = create_nav_mesh_data(&grid_create_params(0, 0, 1, 1.0))?;
    let pd = data.detail_meshes[0];
    assert_eq!((pd.tri_base, pd.tri_count, pd.vert_count), (0, 2, 0));
    assert_eq!(&data.detail_tris[..3], &[0, 1, 2]);
    assert_eq!(&data.detail_tris[4..7], &[0, 2, 3]);
    Ok(())
}

#[test]
fn test_bv_tree_is_optional() -> Result<()> {
    let mut params = grid_create_params(0, 0, 3, 1.0);
    params.build_bv_tree = false;
    let data = create_nav_mesh_data(&params)?;
    assert!(data.bv_tree.is_empty());
    assert_eq!(data.header.bv_node_count, 0);
    Ok(())
}

#[test]
fn test_off_mesh_connections_are_stored_by_start_point() -> Result<()> {
    let mut params = grid_create_params(0, 0, 2, 1.0);
    // Inside to inside.
    add_off_mesh_connection(&mut params, [0.5, 0.0, 0.5], [1.5, 0.0, 1.5], 0.4, true);
    // Starts outside the tile: dropped.
    add_off_mesh_connection(&mut params, [-1.0, 0.0, 0.5], [0.5, 0.0, 0.5], 0.4, true);
    // Starts far above the tile: dropped.
    add_off_mesh_connection(&mut params, [0.5, 8.0, 0.5], [1.5, 0.0, 0.5], 0.4, false);
    // Lands in the neighbour across the z+ border.
    add_off_mesh_connection(&mut params, [1.5, 0.0, 1.5], [1.5, 0.0, 2.5], 0.4, false);
    let data = create_nav_mesh_data(&params)?;

    let h = &data.header;
    assert_eq!(h.off_mesh_con_count, 2);
    assert_eq!(h.poly_count, 6);
    assert_eq!(h.vert_count, 9 + 4);

    let first = &data.off_mesh_cons[0];
    assert_eq!(first.poly, 4);
    assert_eq!(first.side, 0xff);
    assert_eq!(first.flags, crate::OFFMESH_CON_BIDIR);
    assert_eq!(first.start(), [0.5, 0.0, 0.5]);
    assert_eq!(first.end(), [1.5, 0.0, 1.5]);

    let second = &data.off_mesh_cons[1];
    assert_eq!(second.poly, 5);
    assert_eq!(second.side, 2);
    assert_eq!(second.flags, 0);
    assert_eq!(second.user_id, 1003);

    let poly = &data.polys[5];
    assert_eq!(poly.poly_type, PolyType::OffMeshConnection);
    assert_eq!(&poly.verts[..2], &[11, 12]);
    assert_eq!(&data.verts[11 * 3..11 * 3 + 3], &[1.5, 0.0, 1.5]);
    Ok(())
}

#[test]
fn test_classify_off_mesh_point() {
    let bmin = [0.0, -1.0, 0.0];
    let bmax = [2.0, 1.0, 2.0];
    assert_eq!(classify_off_mesh_point(&[1.0, 0.0, 1.0], &bmin, &bmax), 0xff);
    assert_eq!(classify_off_mesh_point(&[3.0, 0.0, 1.0], &bmin, &bmax), 0);
    assert_eq!(classify_off_mesh_point(&[3.0, 0.0, 3.0], &bmin, &bmax), 1);
    assert_eq!(classify_off_mesh_point(&[1.0, 0.0, 3.0], &bmin, &bmax), 2);
    assert_eq!(classify_off_mesh_point(&[-1.0, 0.0, 3.0], &bmin, &bmax), 3);
    assert_eq!(classify_off_mesh_point(&[-1.0, 0.0, 1.0], &bmin, &bmax), 4);
    assert_eq!(classify_off_mesh_point(&[-1.0, 0.0, -1.0], &bmin, &bmax), 5);
    assert_eq!(classify_off_mesh_point(&[1.0, 0.0, -1.0], &bmin, &bmax), 6);
    assert_eq!(classify_off_mesh_point(&[3.0, 0.0, -1.0], &bmin, &bmax), 7);
    // The max bound is exclusive.
    assert_eq!(classify_off_mesh_point(&[2.0, 0.0, 1.0], &bmin, &bmax), 0);
}

#[test]
fn test_explicit_detail_mesh_keeps_extra_vertices() -> Result<()> {
    let mut params = grid_create_params(0, 0, 1, 1.0);
    // Four polygon corners and a raised centre vertex, four triangles.
    params.detail_verts = vec![
        0.0, 0.0, 0.0, //
        0.0, 0.0, 1.0, //
        1.0, 0.0, 1.0, //
        1.0, 0.0, 0.0, //
        0.5, 0.2, 0.5,
    ];
    params.detail_vert_count = 5;
    params.detail_tris = vec![
        0, 1, 4, 0, //
        1, 2, 4, 0, //
        2, 3, 4, 0, //
        3, 0, 4, 0,
    ];
    params.detail_tri_count = 4;
    params.detail_meshes = vec![0, 5, 0, 4];
    let data = create_nav_mesh_data(&params)?;

    assert_eq!(data.header.detail_vert_count, 1);
    assert_eq!(data.detail_verts, vec![0.5, 0.2, 0.5]);
    let pd = data.detail_meshes[0];
    assert_eq!((pd.vert_base, pd.vert_count, pd.tri_count), (0, 1, 4));
    Ok(())
}

#[test]
fn test_invalid_params_are_rejected() {
    let mut params = grid_create_params(0, 0, 2, 1.0);
    params.nvp = 2;
    assert!(matches!(create_nav_mesh_data(&params), Err(Error::InvalidMesh(_))));

    let mut params = grid_create_params(0, 0, 2, 1.0);
    params.polys[0] = 200;
    assert!(matches!(create_nav_mesh_data(&params), Err(Error::InvalidMesh(_))));

    let mut params = grid_create_params(0, 0, 2, 1.0);
    params.poly_areas.pop();
    assert!(matches!(create_nav_mesh_data(&params), Err(Error::InvalidMesh(_))));

    let mut params = grid_create_params(0, 0, 2, 1.0);
    params.verts.clear();
    params.vert_count = 0;
    assert!(matches!(create_nav_mesh_data(&params), Err(Error::InvalidMesh(_))));

    let mut params = grid_create_params(0, 0, 2, 1.0);
    add_off_mesh_connection(&mut params, [0.5, 0.0, 0.5], [1.5, 0.0, 1.5], 0.4, true);
    params.off_mesh_con_rad.clear();
    assert!(matches!(create_nav_mesh_data(&params), Err(Error::InvalidMesh(_))));

    let mut params = grid_create_params(0, 0, 2, 1.0);
    params.cs = 0.0;
    assert!(matches!(create_nav_mesh_data(&params), Err(Error::InvalidMesh(_))));
}
