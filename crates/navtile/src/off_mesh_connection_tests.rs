//! Off-mesh connection tests
//!
//! The island mesh is a 4x4 grid whose two middle columns are disabled, so
//! the only way across is the jump link between cells (0, 1) and (3, 1).

use crate::test_mesh_helpers::{add_off_mesh_connection, grid_create_params, grid_params, grid_poly_ref};
use crate::{
    create_nav_mesh_data, DefaultQueryFilter, FindPathOptions, NavMesh, NavMeshQuery, PolyFlags,
    PolyRef, PolyType, Status, StraightPathFlags, StraightPathOptions,
};
use navtile_common::Result;

const JUMP_START: [f32; 3] = [0.5, 0.0, 1.5];
const JUMP_END: [f32; 3] = [3.5, 0.0, 1.5];

fn island_mesh(bidir: bool) -> Result<NavMesh> {
    let mut params = grid_create_params(0, 0, 4, 1.0);
    add_off_mesh_connection(&mut params, JUMP_START, JUMP_END, 0.5, bidir);

    let mut mesh = NavMesh::new(grid_params(1, 4.0))?;
    mesh.add_tile(create_nav_mesh_data(&params)?, 0, PolyRef::NULL)?;
    for z in 0..4 {
        for x in 1..3 {
            let r = grid_poly_ref(&mesh, 0, 0, 4, x, z);
            mesh.set_poly_flags(r, PolyFlags::DISABLED)?;
        }
    }
    Ok(mesh)
}

fn jump_ref(mesh: &NavMesh) -> PolyRef {
    mesh.get_tile_ref_at(0, 0, 0).with_poly(16)
}

fn walk_filter() -> DefaultQueryFilter {
    DefaultQueryFilter::new(PolyFlags::WALK | PolyFlags::JUMP, PolyFlags::DISABLED)
}

fn has_link(mesh: &NavMesh, from: PolyRef, to: PolyRef) -> bool {
    mesh.get_tile_by_ref(from).is_some_and(|tile| {
        tile.links_of(from.poly() as usize)
            .any(|l| l.reference == to)
    })
}

#[test]
fn test_connection_polygon_and_links() -> Result<()> {
    let mesh = island_mesh(true)?;
    let jump = jump_ref(&mesh);
    let (tile, poly) = mesh.get_tile_and_poly_by_ref(jump)?;

    assert_eq!(poly.poly_type, PolyType::OffMeshConnection);
    assert_eq!(poly.nverts(), 2);
    assert_eq!(poly.area, 1);
    assert_eq!(tile.data.header.off_mesh_base, 16);

    let con = mesh.get_off_mesh_connection_by_ref(jump).ok_or(Status::FAILURE)?;
    assert_eq!(con.side, 0xff);
    assert_eq!(con.user_id, 1000);
    assert!(mesh
        .get_off_mesh_connection_by_ref(grid_poly_ref(&mesh, 0, 0, 4, 0, 0))
        .is_none());

    let start_cell = grid_poly_ref(&mesh, 0, 0, 4, 0, 1);
    let end_cell = grid_poly_ref(&mesh, 0, 0, 4, 3, 1);
    assert!(has_link(&mesh, jump, start_cell));
    assert!(has_link(&mesh, jump, end_cell));
    assert!(has_link(&mesh, start_cell, jump));
    assert!(has_link(&mesh, end_cell, jump));
    Ok(())
}

#[test]
fn test_one_way_connection_has_no_back_link() -> Result<()> {
    let mesh = island_mesh(false)?;
    let jump = jump_ref(&mesh);
    let start_cell = grid_poly_ref(&mesh, 0, 0, 4, 0, 1);
    let end_cell = grid_poly_ref(&mesh, 0, 0, 4, 3, 1);

    assert!(has_link(&mesh, start_cell, jump));
    assert!(has_link(&mesh, jump, end_cell));
    assert!(!has_link(&mesh, end_cell, jump));
    Ok(())
}

#[test]
fn test_end_points_follow_direction_of_travel() -> Result<()> {
    let mesh = island_mesh(true)?;
    let jump = jump_ref(&mesh);
    let start_cell = grid_poly_ref(&mesh, 0, 0, 4, 0, 1);
    let end_cell = grid_poly_ref(&mesh, 0, 0, 4, 3, 1);

    let (a, b) = mesh.get_off_mesh_connection_poly_end_points(start_cell, jump)?;
    assert_eq!((a, b), (JUMP_START, JUMP_END));
    let (a, b) = mesh.get_off_mesh_connection_poly_end_points(end_cell, jump)?;
    assert_eq!((a, b), (JUMP_END, JUMP_START));

    assert!(mesh
        .get_off_mesh_connection_poly_end_points(jump, start_cell)
        .is_err());
    Ok(())
}

#[test]
fn test_path_uses_connection() -> Result<()> {
    let mesh = island_mesh(true)?;
    let jump = jump_ref(&mesh);
    let filter = walk_filter();
    let start_ref = grid_poly_ref(&mesh, 0, 0, 4, 0, 0);
    let end_ref = grid_poly_ref(&mesh, 0, 0, 4, 3, 0);
    let start = [0.5, 0.0, 0.5];
    let end = [3.5, 0.0, 0.5];

    let mut query = NavMeshQuery::new(128);
    let path = query.find_path(&mesh, start_ref, end_ref, &start, &end, &filter, FindPathOptions::empty(), -1.0)?;
    assert_eq!(path.status, Status::SUCCESS);
    assert_eq!(
        path.polys,
        vec![
            start_ref,
            grid_poly_ref(&mesh, 0, 0, 4, 0, 1),
            jump,
            grid_poly_ref(&mesh, 0, 0, 4, 3, 1),
            end_ref,
        ]
    );

    let straight =
        query.find_straight_path(&mesh, &start, &end, &path.polys, 16, StraightPathOptions::empty())?;
    assert_eq!(straight.len(), 4);
    let jumps: Vec<_> = straight
        .points
        .iter()
        .filter(|p| p.flags.contains(StraightPathFlags::OFFMESH_CONNECTION))
        .collect();
    assert_eq!(jumps.len(), 1);
    assert_eq!(jumps[0].pos, JUMP_START);
    assert_eq!(jumps[0].poly_ref, jump);
    assert_eq!(straight.points[2].pos, JUMP_END);
    assert_eq!(straight.points[3].flags, StraightPathFlags::END);

    // Without jump links the far side is out of reach.
    let no_jump = DefaultQueryFilter::new(PolyFlags::WALK, PolyFlags::DISABLED | PolyFlags::JUMP);
    let path = query.find_path(&mesh, start_ref, end_ref, &start, &end, &no_jump, FindPathOptions::empty(), -1.0)?;
    assert!(path.is_partial());
    assert!(!path.polys.contains(&jump));
    Ok(())
}

#[test]
fn test_one_way_connection_blocks_return_trip() -> Result<()> {
    let mesh = island_mesh(false)?;
    let filter = walk_filter();
    let left = grid_poly_ref(&mesh, 0, 0, 4, 0, 0);
    let right = grid_poly_ref(&mesh, 0, 0, 4, 3, 0);
    let left_pos = [0.5, 0.0, 0.5];
    let right_pos = [3.5, 0.0, 0.5];

    let mut query = NavMeshQuery::new(128);
    let there = query.find_path(&mesh, left, right, &left_pos, &right_pos, &filter, FindPathOptions::empty(), -1.0)?;
    assert!(!there.is_partial());

    let back = query.find_path(&mesh, right, left, &right_pos, &left_pos, &filter, FindPathOptions::empty(), -1.0)?;
    assert!(back.is_partial());
    assert!(!back.polys.contains(&jump_ref(&mesh)));
    Ok(())
}

#[test]
fn test_raycast_ignores_connections() -> Result<()> {
    let mesh = island_mesh(true)?;
    let query = NavMeshQuery::new(16);
    let start_ref = grid_poly_ref(&mesh, 0, 0, 4, 0, 1);
    let hit = query.raycast(
        &mesh,
        start_ref,
        &JUMP_START,
        &JUMP_END,
        &walk_filter(),
        crate::RaycastOptions::empty(),
        PolyRef::NULL,
    )?;
    assert!(hit.hit_wall());
    assert_eq!(hit.path, vec![start_ref]);
    Ok(())
}

#[test]
fn test_connection_into_neighbour_tile() -> Result<()> {
    let mut left = grid_create_params(0, 0, 2, 1.0);
    // Lands in the neighbour to the x+ side.
    add_off_mesh_connection(&mut left, [0.5, 0.0, 0.5], [3.5, 0.0, 1.5], 0.5, true);

    let mut mesh = NavMesh::new(grid_params(4, 2.0))?;
    let left_ref = mesh.add_tile(create_nav_mesh_data(&left)?, 0, PolyRef::NULL)?;
    let jump = left_ref.with_poly(4);
    let con = mesh.get_off_mesh_connection_by_ref(jump).ok_or(Status::FAILURE)?;
    assert_eq!(con.side, 0);

    // Nothing to land on yet.
    let (tile, _) = mesh.get_tile_and_poly_by_ref(jump)?;
    assert_eq!(tile.links_of(4).count(), 1);

    let right_ref = mesh.add_tile(crate::test_mesh_helpers::create_grid_tile(1, 0, 2, 1.0)?, 0, PolyRef::NULL)?;
    let landing = right_ref.with_poly(3);
    assert!(has_link(&mesh, jump, landing));
    assert!(has_link(&mesh, landing, jump));

    let mut query = NavMeshQuery::new(64);
    let filter = DefaultQueryFilter::default();
    let path = query.find_path(
        &mesh,
        left_ref.with_poly(0),
        landing,
        &[0.5, 0.0, 0.5],
        &[3.5, 0.0, 1.5],
        &filter,
        FindPathOptions::empty(),
        -1.0,
    )?;
    assert!(!path.is_partial());

    mesh.remove_tile(right_ref)?;
    assert!(!has_link(&mesh, jump, landing));
    let (tile, _) = mesh.get_tile_and_poly_by_ref(jump)?;
    assert_eq!(tile.links_of(4).count(), 1);
    Ok(())
}
