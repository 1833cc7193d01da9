//! GeoPackage tiled raster storage built on top of rusqlite.
//!
//! ## Overview
//!
//! - `Gpkg` represents a whole GeoPackage file.
//! - `GpkgRaster` represents one tile pyramid table, read and written as a
//!   raster of 1 to 4 bands of 8-bit samples.
//! - `RasterLevel` is one zoom level of the pyramid: the full resolution
//!   level or one of its overviews.
//!
//! `Gpkg` is the entry point and supports several open modes:
//!
//! - `Gpkg::open_read_only(path)`: open an existing file without write access.
//! - `Gpkg::open(path)`: open an existing file for read/write.
//! - `Gpkg::new(path)`: create a new file.
//! - `Gpkg::new_in_memory()`: create a transient in-memory GeoPackage.
//!
//! Rasters are addressed by blocks of the tile size (`read_block` /
//! `write_block`) or by arbitrary windows (`read_region` / `write_region`).
//! When the raster origin is not aligned on the tile matrix, each block spans
//! up to four stored tiles; this is handled transparently.
//!
//! Tiles are encoded lazily and committed in batches. Call
//! `GpkgRaster::close()` to see flush errors; dropping a raster flushes too
//! but can only log them.
//!
//! ## Reader
//!
//! ```no_run
//! use rusqlite_gpkg_raster::{Gpkg, RasterOpenOptions};
//!
//! let gpkg = Gpkg::open_read_only("data/tiles.gpkg")?;
//! let tables = gpkg.list_tile_tables()?;
//! let mut raster = gpkg.open_raster(&tables[0], &RasterOpenOptions::default())?;
//! let (width, height) = raster.raster_size();
//! let mut pixels = vec![0u8; raster.band_count() * (width * height) as usize];
//! raster.read_region(0, 0, width, height, &mut pixels)?;
//! # Ok::<(), rusqlite_gpkg_raster::GpkgError>(())
//! ```
//!
//! Open options can also be given as `KEY=VALUE` pairs:
//!
//! ```no_run
//! use rusqlite_gpkg_raster::{Gpkg, RasterOpenOptions};
//!
//! let options = RasterOpenOptions::from_options(&[("ZOOM_LEVEL", "3"), ("BAND_COUNT", "3")])?;
//! let gpkg = Gpkg::open_read_only("data/tiles.gpkg")?;
//! let raster = gpkg.open_raster("imagery", &options)?;
//! println!("{} overviews", raster.overview_count());
//! # Ok::<(), rusqlite_gpkg_raster::GpkgError>(())
//! ```
//!
//! ## Writer
//!
//! ```no_run
//! use rusqlite_gpkg_raster::{Gpkg, RasterCreateOptions, ResamplingMethod};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let gpkg = Gpkg::new("out.gpkg")?;
//!     let options = RasterCreateOptions::from_options(&[
//!         ("TILE_FORMAT", "PNG"),
//!         ("TILING_SCHEME", "GoogleMapsCompatible"),
//!     ])?;
//!
//!     let extent = [0.0, 0.0, 100_000.0, 50_000.0];
//!     let mut raster = gpkg.create_raster_for_extent("imagery", extent, 150.0, 3, &options)?;
//!     let (width, height) = raster.raster_size();
//!     let pixels = vec![128u8; 3 * (width * height) as usize];
//!     raster.write_region(0, 0, width, height, &pixels)?;
//!
//!     raster.build_overviews(ResamplingMethod::Average, &[2, 4, 8], |done| {
//!         println!("{:.0}%", done * 100.0);
//!         true
//!     })?;
//!     raster.close()?;
//!     Ok(())
//! }
//! ```
mod codec;
mod color_table;
mod error;
mod gpkg;
mod ogc_sql;
mod options;
mod raster;
mod tiling;

pub use codec::{DecodedTile, TileDriver, decode_tile, encode_tile};
pub use color_table::{ColorEntry, ColorTable};
pub use error::{GpkgError, Result};
pub use gpkg::Gpkg;
pub use options::{
    CodecOptions, DEFAULT_BLOCK_SIZE, DEFAULT_QUALITY, DEFAULT_ZLEVEL, MAX_BLOCK_SIZE,
    MIN_BLOCK_SIZE, RasterCreateOptions, RasterOpenOptions, ResamplingMethod, TileFormat,
    ZoomLevelStrategy,
};
pub use raster::{ColorInterpretation, GpkgRaster, RasterLevel, TileIoStats};
pub use tiling::{PixelShift, TILING_SCHEMES, TilingScheme};
