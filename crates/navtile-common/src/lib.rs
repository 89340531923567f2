//! Common utilities and data structures shared by the navtile crates
//!
//! Holds the workspace error type and the pure geometry helpers used by the
//! navigation mesh, its builder and the query engine.

mod geometry;
mod math;

pub use geometry::*;
pub use math::*;

/// Represents a 3D position
pub type Vec3 = glam::Vec3;

/// Error types for the library
///
/// These report misuse of the tile management API and malformed input data.
/// Expected query outcomes (no path, partial path, exhausted node pool) are
/// reported through the query status bitmask instead.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input mesh: {0}")]
    InvalidMesh(String),

    #[error("invalid tile reference: {0:#x}")]
    InvalidTileRef(u64),

    #[error("tile location ({x}, {y}, layer {layer}) is already occupied")]
    TileOccupied { x: i32, y: i32, layer: i32 },

    #[error("no free tile slots left (capacity {0})")]
    OutOfTiles(usize),

    #[error("tile data has wrong magic number {0:#010x}")]
    WrongMagic(u32),

    #[error("tile data has unsupported version {0}")]
    WrongVersion(u32),

    #[error("pathfinding failed: {0}")]
    Pathfinding(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[cfg(feature = "std")]
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for navtile operations
pub type Result<T> = std::result::Result<T, Error>;
