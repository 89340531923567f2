//! Command line tool for building navtile meshes and running queries on them

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use navtile::binary_format::{
    load_nav_mesh, mesh_data_from_bytes, mesh_data_to_bytes, save_nav_mesh_to_file,
};
use navtile::{
    create_nav_mesh_data, DefaultQueryFilter, FindPathOptions, MeshData, NavMesh,
    NavMeshCreateParams, NavMeshParams, NavMeshQuery, PolyRef, RaycastOptions,
    StraightPathFlags, StraightPathOptions,
};
use navtile_common::{Error, Vec3};

/// Builds tiled navigation meshes and runs path queries on them
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build tiles from polygon mesh descriptions (JSON creation parameters)
    Build {
        /// Tile creation parameters, one file per tile
        #[clap(long = "input", value_parser, required = true)]
        inputs: Vec<PathBuf>,

        /// Output file: `.json` writes a single tile payload as JSON,
        /// `.tile` a single binary tile, anything else a mesh set
        #[clap(long, value_parser)]
        output: PathBuf,

        /// Tile capacity of the mesh set, defaults to the number of inputs
        #[clap(long)]
        max_tiles: Option<i32>,

        /// Skip building the bounding volume trees
        #[clap(long)]
        no_bv_tree: bool,
    },

    /// Print a summary of a navigation mesh file
    Info {
        /// Navigation mesh file
        #[clap(long, value_parser)]
        mesh: PathBuf,
    },

    /// Find a path on a navigation mesh
    FindPath {
        /// Navigation mesh file
        #[clap(long, value_parser)]
        mesh: PathBuf,

        /// Start position (x,y,z)
        #[clap(long, value_parser = parse_vector)]
        start: Vec3,

        /// End position (x,y,z)
        #[clap(long, value_parser = parse_vector)]
        end: Vec3,

        /// Half extents of the nearest polygon search box (x,y,z)
        #[clap(long, value_parser = parse_vector, default_value = "2,4,2")]
        extents: Vec3,

        /// Size of the search node pool
        #[clap(long, default_value = "2048")]
        max_nodes: usize,

        /// Shortcut the corridor with raycasts while searching
        #[clap(long)]
        any_angle: bool,

        /// Output path file
        #[clap(long, value_parser)]
        output: Option<PathBuf>,
    },

    /// Cast a ray along the mesh surface
    Raycast {
        /// Navigation mesh file
        #[clap(long, value_parser)]
        mesh: PathBuf,

        /// Start position (x,y,z)
        #[clap(long, value_parser = parse_vector)]
        start: Vec3,

        /// End position (x,y,z)
        #[clap(long, value_parser = parse_vector)]
        end: Vec3,
    },
}

/// Parse a comma-separated vector
fn parse_vector(s: &str) -> Result<Vec3, String> {
    let parts: Vec<&str> = s.split(',').collect();

    if parts.len() != 3 {
        return Err(format!(
            "Vector must have 3 components, got {}",
            parts.len()
        ));
    }

    let x = parts[0].trim().parse::<f32>().map_err(|e| e.to_string())?;
    let y = parts[1].trim().parse::<f32>().map_err(|e| e.to_string())?;
    let z = parts[2].trim().parse::<f32>().map_err(|e| e.to_string())?;

    Ok(Vec3::new(x, y, z))
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Build {
            inputs,
            output,
            max_tiles,
            no_bv_tree,
        } => build_tiles(&inputs, &output, max_tiles, !no_bv_tree),
        Commands::Info { mesh } => print_info(&mesh),
        Commands::FindPath {
            mesh,
            start,
            end,
            extents,
            max_nodes,
            any_angle,
            output,
        } => find_path(
            &mesh,
            start,
            end,
            extents,
            max_nodes,
            any_angle,
            output.as_deref(),
        ),
        Commands::Raycast { mesh, start, end } => raycast(&mesh, start, end),
    }
}

fn output_extension(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
        .unwrap_or_default()
}

/// Build tiles from creation parameters
fn build_tiles(
    inputs: &[PathBuf],
    output: &Path,
    max_tiles: Option<i32>,
    build_bv_tree: bool,
) -> Result<()> {
    let mut tiles = Vec::with_capacity(inputs.len());
    for input in inputs {
        println!("Loading tile parameters from {}...", input.display());
        let json = fs::read_to_string(input)
            .with_context(|| format!("Failed to read {}", input.display()))?;
        let mut params: NavMeshCreateParams = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse {}", input.display()))?;
        params.build_bv_tree = build_bv_tree;

        let data = create_nav_mesh_data(&params)
            .map_err(|e| anyhow!("Failed to build tile from {}: {}", input.display(), e))?;
        let h = &data.header;
        println!(
            "Tile ({}, {}, layer {}): {} polygons, {} vertices, {} off-mesh connections",
            h.x, h.y, h.layer, h.poly_count, h.vert_count, h.off_mesh_con_count
        );
        tiles.push(data);
    }

    match output_extension(output).as_str() {
        "json" | "tile" => {
            let [data] = tiles.as_slice() else {
                bail!("A single tile output needs exactly one input, got {}", tiles.len());
            };
            if output_extension(output) == "json" {
                fs::write(output, data.to_json()?)?;
                println!("Saved tile as JSON to {}", output.display());
            } else {
                fs::write(output, mesh_data_to_bytes(data)?)?;
                println!("Saved binary tile to {}", output.display());
            }
        }
        _ => {
            let params = mesh_params_for(&tiles, max_tiles)?;
            let mut nav_mesh = NavMesh::new(params)?;
            for data in tiles {
                nav_mesh.add_tile(data, 0, PolyRef::NULL)?;
            }
            save_nav_mesh_to_file(&nav_mesh, output)?;
            println!(
                "Saved mesh set with {} tiles to {}",
                nav_mesh.tile_count(),
                output.display()
            );
        }
    }

    Ok(())
}

/// Grid layout shared by all tiles, taken from the first tile
fn mesh_params_for(tiles: &[MeshData], max_tiles: Option<i32>) -> Result<NavMeshParams> {
    let first = tiles
        .first()
        .ok_or_else(|| anyhow!("No tiles to build"))?
        .header
        .clone();
    let tile_width = first.bmax[0] - first.bmin[0];
    let tile_height = first.bmax[2] - first.bmin[2];
    let max_polys = tiles.iter().map(|t| t.header.poly_count).max().unwrap_or(1);

    Ok(NavMeshParams {
        origin: [
            first.bmin[0] - first.x as f32 * tile_width,
            first.bmin[1],
            first.bmin[2] - first.y as f32 * tile_height,
        ],
        tile_width,
        tile_height,
        max_tiles: max_tiles.unwrap_or(tiles.len() as i32),
        max_polys_per_tile: max_polys.max(1),
    })
}

/// Load a mesh set, a binary tile, or a JSON tile
fn load_mesh(path: &Path) -> Result<NavMesh> {
    println!("Loading navigation mesh from {}...", path.display());

    if output_extension(path) == "json" {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let data = MeshData::from_json(&json)?;
        return Ok(NavMesh::with_single_tile(data, 0)?);
    }

    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    match load_nav_mesh(&mut bytes.as_slice()) {
        Ok(nav_mesh) => Ok(nav_mesh),
        // Not a mesh set, try a single tile payload.
        Err(Error::WrongMagic(_)) => {
            let data = mesh_data_from_bytes(&bytes)?;
            Ok(NavMesh::with_single_tile(data, 0)?)
        }
        Err(e) => Err(anyhow!("Failed to load navigation mesh: {}", e)),
    }
}

/// Print a summary of a navigation mesh
fn print_info(path: &Path) -> Result<()> {
    let nav_mesh = load_mesh(path)?;
    let params = nav_mesh.params();

    println!("Origin: {:?}", params.origin);
    println!("Tile size: {} x {}", params.tile_width, params.tile_height);
    println!(
        "Tiles: {} of {}",
        nav_mesh.tile_count(),
        nav_mesh.max_tiles()
    );

    let (bmin, bmax) = nav_mesh.compute_bounds();
    println!("Bounds: min={:?}, max={:?}", bmin, bmax);

    for tile in nav_mesh.tiles() {
        let h = tile.header();
        println!(
            "  {} ({}, {}, layer {}): {} polygons, {} links, {} BV nodes, {} off-mesh connections",
            nav_mesh.get_tile_ref(tile),
            h.x,
            h.y,
            h.layer,
            h.poly_count,
            tile.links.len(),
            h.bv_node_count,
            h.off_mesh_con_count
        );
    }

    Ok(())
}

/// Find a path on a navigation mesh
fn find_path(
    mesh_path: &Path,
    start: Vec3,
    end: Vec3,
    extents: Vec3,
    max_nodes: usize,
    any_angle: bool,
    output: Option<&Path>,
) -> Result<()> {
    let nav_mesh = load_mesh(mesh_path)?;
    let mut query = NavMeshQuery::new(max_nodes);
    let filter = DefaultQueryFilter::default();

    println!("Finding path from {:?} to {:?}...", start, end);

    let ext = extents.to_array();
    let start_poly = query
        .find_nearest_poly(&nav_mesh, &start.to_array(), &ext, &filter)
        .map_err(|e| anyhow!("Failed to find start polygon: {}", e))?;
    let end_poly = query
        .find_nearest_poly(&nav_mesh, &end.to_array(), &ext, &filter)
        .map_err(|e| anyhow!("Failed to find end polygon: {}", e))?;
    if !start_poly.found() || !end_poly.found() {
        bail!("No polygon near the start or end position");
    }

    println!(
        "Found start polygon: {} at {:?}",
        start_poly.poly_ref, start_poly.point
    );
    println!(
        "Found end polygon: {} at {:?}",
        end_poly.poly_ref, end_poly.point
    );

    let options = if any_angle {
        FindPathOptions::ANY_ANGLE
    } else {
        FindPathOptions::empty()
    };
    let path = query
        .find_path(
            &nav_mesh,
            start_poly.poly_ref,
            end_poly.poly_ref,
            &start_poly.point,
            &end_poly.point,
            &filter,
            options,
            -1.0,
        )
        .map_err(|e| anyhow!("Failed to find path: {}", e))?;

    println!("Found path with {} polygons ({})", path.len(), path.status);

    let straight_path = query
        .find_straight_path(
            &nav_mesh,
            &start_poly.point,
            &end_poly.point,
            &path.polys,
            256,
            StraightPathOptions::empty(),
        )
        .map_err(|e| anyhow!("Failed to find straight path: {}", e))?;

    println!(
        "Generated straight path with {} waypoints",
        straight_path.len()
    );

    if let Some(output_path) = output {
        println!("Saving path to {}...", output_path.display());

        let mut file = File::create(output_path)
            .with_context(|| format!("Failed to create output file: {}", output_path.display()))?;

        writeln!(file, "# Path from {:?} to {:?}", start, end)?;
        writeln!(file, "# {} waypoints", straight_path.len())?;
        for point in &straight_path.points {
            writeln!(file, "{},{},{}", point.pos[0], point.pos[1], point.pos[2])?;
        }
    } else {
        println!("Path:");
        for (i, point) in straight_path.points.iter().enumerate() {
            let jump = if point.flags.contains(StraightPathFlags::OFFMESH_CONNECTION) {
                " (off-mesh connection)"
            } else {
                ""
            };
            println!(
                "{}: {},{},{}{}",
                i, point.pos[0], point.pos[1], point.pos[2], jump
            );
        }
    }

    Ok(())
}

/// Cast a ray from the polygon under `start` towards `end`
fn raycast(mesh_path: &Path, start: Vec3, end: Vec3) -> Result<()> {
    let nav_mesh = load_mesh(mesh_path)?;
    let query = NavMeshQuery::new(64);
    let filter = DefaultQueryFilter::default();

    let start_poly = query
        .find_nearest_poly_default(&nav_mesh, &start.to_array(), &filter)
        .map_err(|e| anyhow!("Failed to find start polygon: {}", e))?;
    if !start_poly.found() {
        bail!("No polygon near the start position");
    }

    let hit = query
        .raycast(
            &nav_mesh,
            start_poly.poly_ref,
            &start_poly.point,
            &end.to_array(),
            &filter,
            RaycastOptions::empty(),
            PolyRef::NULL,
        )
        .map_err(|e| anyhow!("Raycast failed: {}", e))?;

    if hit.hit_wall() {
        println!(
            "Hit wall at {:?} (t = {}, normal {:?})",
            hit.hit_position(&start_poly.point, &end.to_array()),
            hit.t,
            hit.hit_normal
        );
    } else {
        println!("Reached {:?} without hitting a wall", end);
    }
    println!("Visited {} polygons", hit.path_count());

    Ok(())
}
