//! Tiled raster datasets stored in GeoPackage tile pyramid tables.

mod batch;
mod blocks;
mod cache;
mod dataset;
mod level;
mod overview;
mod read;
mod register;
mod shifted;
mod state;
mod store;
mod write;

pub use dataset::{ColorInterpretation, GpkgRaster};
pub use level::RasterLevel;
pub use store::TileIoStats;
