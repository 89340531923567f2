//! Tests for meshes built from several tiles

use crate::test_mesh_helpers::{
    create_grid_tile, create_tiled_mesh, grid_create_params, grid_params, grid_poly_ref,
};
use crate::{
    create_nav_mesh_data, DefaultQueryFilter, FindPathOptions, MeshData, NavMesh, NavMeshQuery,
    PolyRef, Status,
};
use navtile_common::Result;

/// Grid tile raised to `height`, stored on `layer`
fn layered_tile(tx: i32, ty: i32, layer: i32, height: f32) -> Result<MeshData> {
    let mut params = grid_create_params(tx, ty, 2, 1.0);
    params.tile_layer = layer;
    params.bmin[1] = height;
    params.bmax[1] = height + 1.0;
    create_nav_mesh_data(&params)
}

fn links_between(mesh: &NavMesh, from: PolyRef, to: PolyRef) -> usize {
    mesh.get_tile_by_ref(from)
        .map_or(0, |tile| {
            tile.links_of(from.poly() as usize)
                .filter(|l| l.reference == to)
                .count()
        })
}

fn find_path(
    query: &mut NavMeshQuery,
    mesh: &NavMesh,
    start_ref: PolyRef,
    end_ref: PolyRef,
    start: [f32; 3],
    end: [f32; 3],
) -> Result<crate::PolyPath> {
    let filter = DefaultQueryFilter::default();
    Ok(query.find_path(
        mesh,
        start_ref,
        end_ref,
        &start,
        &end,
        &filter,
        FindPathOptions::empty(),
        -1.0,
    )?)
}

#[test]
fn test_border_edges_link_both_ways() -> Result<()> {
    let mesh = create_tiled_mesh(2, 1, 2, 1.0)?;
    let left = grid_poly_ref(&mesh, 0, 0, 2, 1, 0);
    let right = grid_poly_ref(&mesh, 1, 0, 2, 0, 0);

    assert_eq!(links_between(&mesh, left, right), 1);
    assert_eq!(links_between(&mesh, right, left), 1);

    let tile = mesh.get_tile_by_ref(left).ok_or(Status::FAILURE)?;
    let link = tile
        .links_of(left.poly() as usize)
        .find(|l| l.reference == right)
        .ok_or(Status::FAILURE)?;
    assert_eq!(link.edge, 2);
    assert_eq!(link.side, 0);
    assert_eq!((link.bmin, link.bmax), (0, 255));

    // Cells on the outer border have nothing to link to.
    let outer = grid_poly_ref(&mesh, 0, 0, 2, 0, 0);
    assert!(tile
        .links_of(outer.poly() as usize)
        .all(|l| l.side == 0xff));
    Ok(())
}

#[test]
fn test_removing_tile_unlinks_neighbours() -> Result<()> {
    let mut mesh = create_tiled_mesh(2, 1, 2, 1.0)?;
    let left = grid_poly_ref(&mesh, 0, 0, 2, 1, 0);
    let right = grid_poly_ref(&mesh, 1, 0, 2, 0, 0);

    let (data, restore_ref) = mesh.remove_tile(mesh.get_tile_ref_at(1, 0, 0))?;
    assert_eq!(links_between(&mesh, left, right), 0);
    assert!(!mesh.is_valid_poly_ref(right));

    // Restoring into the same slot relinks the border.
    let tile_ref = mesh.add_tile(data, 0, restore_ref)?;
    assert_eq!(tile_ref, restore_ref);
    let right = grid_poly_ref(&mesh, 1, 0, 2, 0, 0);
    assert_eq!(right.salt(), restore_ref.salt());
    assert_eq!(links_between(&mesh, left, right), 1);
    assert_eq!(links_between(&mesh, right, left), 1);
    Ok(())
}

#[test]
fn test_stale_refs_stay_invalid_after_slot_reuse() -> Result<()> {
    let mut mesh = create_tiled_mesh(2, 2, 2, 1.0)?;
    let tile_ref = mesh.get_tile_ref_at(1, 1, 0);
    let old_refs: Vec<PolyRef> = (0..4).map(|i| tile_ref.with_poly(i)).collect();
    assert!(old_refs.iter().all(|&r| mesh.is_valid_poly_ref(r)));

    mesh.remove_tile(tile_ref)?;
    for (x, y) in [(5, 5), (6, 5), (7, 5)] {
        mesh.add_tile(create_grid_tile(x, y, 2, 1.0)?, 0, PolyRef::NULL)?;
    }

    let reused = mesh.get_tile_ref_at(5, 5, 0);
    assert_eq!(reused.tile(), tile_ref.tile());
    assert_ne!(reused.salt(), tile_ref.salt());
    assert!(old_refs.iter().all(|&r| !mesh.is_valid_poly_ref(r)));
    Ok(())
}

#[test]
fn test_path_across_tiles() -> Result<()> {
    let mesh = create_tiled_mesh(3, 3, 2, 1.0)?;
    let start_ref = grid_poly_ref(&mesh, 0, 0, 2, 0, 0);
    let end_ref = grid_poly_ref(&mesh, 2, 2, 2, 1, 1);

    let mut query = NavMeshQuery::new(256);
    let path = find_path(&mut query, &mesh, start_ref, end_ref, [0.5, 0.0, 0.5], [5.5, 0.0, 5.5])?;

    assert_eq!(path.status, Status::SUCCESS);
    assert_eq!(path.polys[0], start_ref);
    assert_eq!(path.polys.last(), Some(&end_ref));
    // Manhattan distance of five cells in each direction.
    assert_eq!(path.len(), 11);
    for pair in path.polys.windows(2) {
        assert_eq!(links_between(&mesh, pair[0], pair[1]), 1);
    }
    Ok(())
}

#[test]
fn test_disconnected_tiles_give_partial_result() -> Result<()> {
    let mut mesh = NavMesh::new(grid_params(4, 1.0))?;
    let a = mesh.add_tile(create_grid_tile(0, 0, 1, 1.0)?, 0, PolyRef::NULL)?;
    let b = mesh.add_tile(create_grid_tile(2, 0, 1, 1.0)?, 0, PolyRef::NULL)?;
    let start_ref = a.with_poly(0);
    let end_ref = b.with_poly(0);

    let mut query = NavMeshQuery::new(64);
    let path = find_path(&mut query, &mesh, start_ref, end_ref, [0.5, 0.0, 0.5], [2.5, 0.0, 0.5])?;
    assert!(path.status.is_success());
    assert!(path.is_partial());
    assert_eq!(path.polys, vec![start_ref]);
    Ok(())
}

#[test]
fn test_path_follows_tile_changes() -> Result<()> {
    let mut mesh = create_tiled_mesh(3, 1, 1, 1.0)?;
    let start_ref = grid_poly_ref(&mesh, 0, 0, 1, 0, 0);
    let end_ref = grid_poly_ref(&mesh, 2, 0, 1, 0, 0);
    let start = [0.5, 0.0, 0.5];
    let end = [2.5, 0.0, 0.5];
    let mut query = NavMeshQuery::new(64);

    let path = find_path(&mut query, &mesh, start_ref, end_ref, start, end)?;
    assert_eq!(path.len(), 3);
    assert!(!path.is_partial());

    let (data, restore_ref) = mesh.remove_tile(mesh.get_tile_ref_at(1, 0, 0))?;
    let path = find_path(&mut query, &mesh, start_ref, end_ref, start, end)?;
    assert!(path.is_partial());
    assert_eq!(path.polys, vec![start_ref]);

    mesh.add_tile(data, 0, restore_ref)?;
    let path = find_path(&mut query, &mesh, start_ref, end_ref, start, end)?;
    assert_eq!(path.len(), 3);
    assert_eq!(path.polys[1], restore_ref.with_poly(0));
    Ok(())
}

#[test]
fn test_update_tile_relinks_neighbours() -> Result<()> {
    let mut mesh = create_tiled_mesh(2, 1, 2, 1.0)?;
    let old_ref = mesh.get_tile_ref_at(1, 0, 0);

    let new_ref = mesh.update_tile(create_grid_tile(1, 0, 2, 1.0)?, 0)?;
    assert_eq!(new_ref.tile(), old_ref.tile());
    assert_ne!(new_ref.salt(), old_ref.salt());
    assert!(!mesh.is_valid_poly_ref(old_ref.with_poly(0)));

    let left = grid_poly_ref(&mesh, 0, 0, 2, 1, 0);
    assert_eq!(links_between(&mesh, left, new_ref.with_poly(0)), 1);
    assert_eq!(links_between(&mesh, left, old_ref.with_poly(0)), 0);
    Ok(())
}

#[test]
fn test_layers_share_a_cell_without_linking() -> Result<()> {
    let mut mesh = NavMesh::new(grid_params(4, 2.0))?;
    let ground = mesh.add_tile(layered_tile(0, 0, 0, 0.0)?, 0, PolyRef::NULL)?;
    let upper = mesh.add_tile(layered_tile(0, 0, 1, 5.0)?, 0, PolyRef::NULL)?;
    let next = mesh.add_tile(layered_tile(1, 0, 0, 0.0)?, 0, PolyRef::NULL)?;

    assert_eq!(mesh.get_tiles_at(0, 0).len(), 2);
    assert_eq!(mesh.get_tile_ref_at(0, 0, 1), upper);
    assert!(mesh.get_tile_at(1, 0, 1).is_none());

    // Only the ground layer meets the neighbour at the same height.
    let ground_edge = ground.with_poly(1);
    let upper_edge = upper.with_poly(1);
    let next_edge = next.with_poly(0);
    assert_eq!(links_between(&mesh, ground_edge, next_edge), 1);
    assert_eq!(links_between(&mesh, upper_edge, next_edge), 0);
    assert_eq!(links_between(&mesh, next_edge, upper_edge), 0);

    // Point queries pick the layer at the right height.
    let query = NavMeshQuery::new(64);
    let filter = DefaultQueryFilter::default();
    let nearest = query.find_nearest_poly(&mesh, &[0.5, 5.1, 0.5], &[0.5, 1.0, 0.5], &filter)?;
    assert_eq!(nearest.poly_ref, upper.with_poly(0));
    let nearest = query.find_nearest_poly(&mesh, &[0.5, 0.1, 0.5], &[0.5, 1.0, 0.5], &filter)?;
    assert_eq!(nearest.poly_ref, ground.with_poly(0));

    // Removing one layer leaves the other in place.
    mesh.remove_tile(upper)?;
    assert_eq!(mesh.get_tiles_at(0, 0).len(), 1);
    assert_eq!(links_between(&mesh, ground_edge, next_edge), 1);
    Ok(())
}

#[test]
fn test_box_query_spans_tiles() -> Result<()> {
    let mesh = create_tiled_mesh(2, 2, 2, 1.0)?;
    let query = NavMeshQuery::new(64);
    let filter = DefaultQueryFilter::default();

    let tiles = query.query_tiles(&mesh, &[2.0, 0.0, 2.0], &[0.5, 1.0, 0.5])?;
    assert_eq!(tiles.len(), 4);

    let (mut refs, status) =
        query.query_polygons_collect(&mesh, &[2.0, 0.0, 2.0], &[0.5, 1.0, 0.5], &filter, 64)?;
    assert_eq!(status, Status::SUCCESS);
    refs.sort();
    refs.dedup();
    // The four cells around the shared tile corner.
    for (tx, ty, x, z) in [(0, 0, 1, 1), (1, 0, 0, 1), (0, 1, 1, 0), (1, 1, 0, 0)] {
        assert!(refs.contains(&grid_poly_ref(&mesh, tx, ty, 2, x, z)));
    }
    Ok(())
}
