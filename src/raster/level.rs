use std::cell::RefCell;
use std::rc::Rc;

use tracing::debug;

use crate::codec::{TileDriver, decode_tile};
use crate::color_table::ColorTable;
use crate::error::{GpkgError, Result};
use crate::options::{CodecOptions, TileFormat};
use crate::tiling::{PixelShift, div_round_up};

use super::batch::DatasetRole;
use super::blocks::BlockStore;
use super::cache::{TileCache, TilePos};
use super::shifted::ShiftedStaging;
use super::store::TileStore;

/// Memory kept for clean blocks of one level before the oldest are dropped.
const CLEAN_BLOCK_BUDGET: usize = 32 << 20;
const MIN_CLEAN_BLOCKS: usize = 16;

/// Dataset color table, shared by every level of a dataset.
#[derive(Debug)]
pub(crate) struct PaletteState {
    /// Set once the table was assigned or looked up in the stored tiles.
    pub(crate) established: bool,
    pub(crate) table: Option<ColorTable>,
    /// Stored palettes are looked up on the full resolution level.
    pub(crate) probe_zoom: i32,
    pub(crate) probe_middle: TilePos,
}

pub(crate) type SharedPalette = Rc<RefCell<PaletteState>>;

impl PaletteState {
    pub(crate) fn shared(probe_zoom: i32, probe_middle: TilePos) -> SharedPalette {
        Rc::new(RefCell::new(Self {
            established: false,
            table: None,
            probe_zoom,
            probe_middle,
        }))
    }
}

/// Placement of a level's raster inside its tile matrix.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct LevelGeometry {
    pub(crate) raster_width: u32,
    pub(crate) raster_height: u32,
    pub(crate) tile_width: u32,
    pub(crate) tile_height: u32,
    pub(crate) matrix_width: i32,
    pub(crate) matrix_height: i32,
    pub(crate) shift: PixelShift,
}

impl LevelGeometry {
    pub(crate) fn contains(&self, pos: TilePos) -> bool {
        pos.row >= 0 && pos.col >= 0 && pos.row < self.matrix_height && pos.col < self.matrix_width
    }

    pub(crate) fn is_shifted(&self) -> bool {
        !self.shift.is_aligned()
    }

    pub(crate) fn blocks_x(&self) -> u32 {
        div_round_up(self.raster_width, self.tile_width)
    }

    pub(crate) fn blocks_y(&self) -> u32 {
        div_round_up(self.raster_height, self.tile_height)
    }

    pub(crate) fn plane_len(&self) -> usize {
        self.tile_width as usize * self.tile_height as usize
    }

    /// Raster pixel offset of the top-left corner of tile `pos`.
    pub(crate) fn tile_origin(&self, pos: TilePos) -> (i64, i64) {
        let x = i64::from(pos.col - self.shift.x_tiles) * i64::from(self.tile_width)
            - i64::from(self.shift.x_pixels_mod);
        let y = i64::from(pos.row - self.shift.y_tiles) * i64::from(self.tile_height)
            - i64::from(self.shift.y_pixels_mod);
        (x, y)
    }

    /// Tiles touched by block (`x`, `y`): first tile and whether the next
    /// column and row are touched too.
    pub(crate) fn block_tiles(&self, x: u32, y: u32) -> (TilePos, TilePos) {
        let first = TilePos::new(
            y as i32 + self.shift.y_tiles,
            x as i32 + self.shift.x_tiles,
        );
        let last = TilePos::new(
            first.row + i32::from(self.shift.y_pixels_mod != 0),
            first.col + i32::from(self.shift.x_pixels_mod != 0),
        );
        (first, last)
    }

    pub(crate) fn middle_tile(&self) -> TilePos {
        TilePos::new(
            self.shift.y_tiles + (self.raster_height / 2 / self.tile_height) as i32,
            self.shift.x_tiles + (self.raster_width / 2 / self.tile_width) as i32,
        )
    }
}

/// A rectangle inside a tile, in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Rect {
    pub(crate) x: usize,
    pub(crate) y: usize,
    pub(crate) width: usize,
    pub(crate) height: usize,
}

impl Rect {
    pub(crate) const fn new(x: usize, y: usize, width: usize, height: usize) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub(crate) fn contains(&self, x: usize, y: usize) -> bool {
        x >= self.x && y >= self.y && x < self.x + self.width && y < self.y + self.height
    }
}

/// Copy a `width` x `height` window between two planes of row length
/// `stride`.
pub(crate) fn copy_window(
    src: &[u8],
    src_origin: (usize, usize),
    dst: &mut [u8],
    dst_origin: (usize, usize),
    stride: usize,
    width: usize,
    height: usize,
) {
    for row in 0..height {
        let s = (src_origin.1 + row) * stride + src_origin.0;
        let d = (dst_origin.1 + row) * stride + dst_origin.0;
        dst[d..d + width].copy_from_slice(&src[s..s + width]);
    }
}

/// One zoom level of a tiled raster: the full resolution dataset or one of
/// its overviews.
///
/// Blocks are the unit of I/O and have the size of a tile. When the raster
/// origin falls on the tile grid each block is exactly one tile; otherwise a
/// block straddles up to four tiles.
#[derive(Debug)]
pub struct RasterLevel<'a> {
    pub(crate) store: TileStore<'a>,
    pub(crate) geometry: LevelGeometry,
    pub(crate) bands: usize,
    pub(crate) codec: CodecOptions,
    pub(crate) update: bool,
    pub(crate) georeferenced: bool,
    pub(crate) role: DatasetRole,
    pub(crate) palette: SharedPalette,
    pub(crate) cache: TileCache,
    pub(crate) blocks: BlockStore,
    pub(crate) staging: ShiftedStaging,
    /// Set while a tile is being encoded.
    pub(crate) writing: bool,
    pub(crate) palette_warned: bool,
    pub(crate) lossy_warned: bool,
}

/// Settings a level is created with.
#[derive(Clone, Copy, Debug)]
pub(crate) struct LevelSettings {
    pub(crate) bands: usize,
    pub(crate) codec: CodecOptions,
    pub(crate) update: bool,
    pub(crate) georeferenced: bool,
}

impl<'a> RasterLevel<'a> {
    pub(crate) fn new(
        store: TileStore<'a>,
        geometry: LevelGeometry,
        settings: LevelSettings,
        role: DatasetRole,
        palette: SharedPalette,
    ) -> Result<Self> {
        let plane_len = geometry.plane_len();
        let max_clean = (CLEAN_BLOCK_BUDGET / plane_len.max(1)).max(MIN_CLEAN_BLOCKS);
        if settings.codec.tile_format == TileFormat::Png8 && settings.update {
            role.batch()?.prepare_arena(geometry.tile_width, geometry.tile_height)?;
        }
        Ok(Self {
            store,
            geometry,
            bands: settings.bands,
            codec: settings.codec,
            update: settings.update,
            georeferenced: settings.georeferenced,
            role,
            palette,
            cache: TileCache::new(geometry.tile_width, geometry.tile_height),
            blocks: BlockStore::new(plane_len, max_clean),
            staging: ShiftedStaging::new(plane_len),
            writing: false,
            palette_warned: false,
            lossy_warned: false,
        })
    }

    /// Zoom level in the tile table.
    pub fn zoom_level(&self) -> i32 {
        self.store.zoom_level()
    }

    /// Width and height in pixels.
    pub fn raster_size(&self) -> (u32, u32) {
        (self.geometry.raster_width, self.geometry.raster_height)
    }

    /// Block size, which is also the tile size.
    pub fn block_size(&self) -> (u32, u32) {
        (self.geometry.tile_width, self.geometry.tile_height)
    }

    /// Number of blocks along each axis.
    pub fn block_count(&self) -> (u32, u32) {
        (self.geometry.blocks_x(), self.geometry.blocks_y())
    }

    pub fn band_count(&self) -> usize {
        self.bands
    }

    pub fn matrix_size(&self) -> (i32, i32) {
        (self.geometry.matrix_width, self.geometry.matrix_height)
    }

    pub fn pixel_shift(&self) -> PixelShift {
        self.geometry.shift
    }

    pub fn is_overview(&self) -> bool {
        !self.role.is_primary()
    }

    pub(crate) fn set_zoom_level(&mut self, zoom_level: i32) {
        self.store.set_zoom_level(zoom_level);
    }

    /// Move the level onto a new tile matrix, dropping everything cached.
    pub(crate) fn relocate(&mut self, zoom_level: i32, geometry: LevelGeometry) {
        self.store.set_zoom_level(zoom_level);
        self.geometry = geometry;
        self.georeferenced = true;
        self.cache.reset();
        self.blocks.clear();
    }

    /// Forget cached tiles and blocks once the stored tiles changed under the
    /// level. Only called on a flushed level.
    pub(crate) fn discard_cache(&mut self) {
        self.cache.reset();
        self.blocks.clear();
    }

    pub(crate) fn check_block(&self, band: usize, x: u32, y: u32, len: usize) -> Result<()> {
        if band >= self.bands {
            return Err(GpkgError::InvalidArgument(format!(
                "band index {band} out of range, the raster has {} bands",
                self.bands
            )));
        }
        if x >= self.geometry.blocks_x() || y >= self.geometry.blocks_y() {
            return Err(GpkgError::InvalidArgument(format!(
                "block ({x}, {y}) is outside of the raster"
            )));
        }
        if len != self.geometry.plane_len() {
            return Err(GpkgError::InvalidArgument(format!(
                "block buffer holds {len} bytes, expected {}",
                self.geometry.plane_len()
            )));
        }
        Ok(())
    }

    /// Look the dataset color table up in the stored tiles the first time it
    /// is needed. Only single band datasets have one.
    pub(crate) fn ensure_palette(&self) -> Result<()> {
        if self.bands != 1 || self.palette.borrow().established {
            return Ok(());
        }
        let (zoom_level, middle) = {
            let state = self.palette.borrow();
            (state.probe_zoom, state.probe_middle)
        };
        let table = self.probe_palette(zoom_level, middle)?;
        let mut state = self.palette.borrow_mut();
        state.established = true;
        state.table = table;
        Ok(())
    }

    /// The first stored tile is tried, then the one in the middle of the
    /// raster when the first one is not a single band PNG.
    fn probe_palette(&self, zoom_level: i32, middle: TilePos) -> Result<Option<ColorTable>> {
        let Some(blob) = self.store.fetch_any(zoom_level)? else {
            return Ok(None);
        };
        if let Some(table) = single_band_png_palette(&blob) {
            return Ok(table);
        }
        debug!(
            row = middle.row,
            col = middle.col,
            "first tile is not a single band PNG, trying the middle tile"
        );
        let Some(blob) = self.store.fetch_at(zoom_level, middle)? else {
            return Ok(None);
        };
        Ok(single_band_png_palette(&blob).flatten())
    }

    pub(crate) fn color_table(&self) -> Result<Option<ColorTable>> {
        if self.bands != 1 {
            return Ok(None);
        }
        self.ensure_palette()?;
        Ok(self.palette.borrow().table.clone())
    }
}

/// `Some(palette)` when `blob` is a single band PNG.
fn single_band_png_palette(blob: &[u8]) -> Option<Option<ColorTable>> {
    if TileDriver::sniff(blob) != Some(TileDriver::Png) {
        return None;
    }
    match decode_tile(blob) {
        Ok(tile) if tile.bands == 1 => Some(tile.palette),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(shift: PixelShift) -> LevelGeometry {
        LevelGeometry {
            raster_width: 600,
            raster_height: 300,
            tile_width: 256,
            tile_height: 256,
            matrix_width: 4,
            matrix_height: 2,
            shift,
        }
    }

    #[test]
    fn aligned_block_maps_to_one_tile() {
        let g = geometry(PixelShift::default());
        assert_eq!((g.blocks_x(), g.blocks_y()), (3, 2));
        assert_eq!(g.block_tiles(2, 1), (TilePos::new(1, 2), TilePos::new(1, 2)));
        assert_eq!(g.tile_origin(TilePos::new(1, 2)), (512, 256));
        assert!(g.contains(TilePos::new(1, 3)));
        assert!(!g.contains(TilePos::new(2, 0)));
        assert!(!g.contains(TilePos::new(0, -1)));
    }

    #[test]
    fn shifted_block_straddles_tiles() {
        let g = geometry(PixelShift {
            x_tiles: 1,
            y_tiles: 0,
            x_pixels_mod: 100,
            y_pixels_mod: 0,
        });
        assert!(g.is_shifted());
        assert_eq!(g.block_tiles(0, 0), (TilePos::new(0, 1), TilePos::new(0, 2)));
        assert_eq!(g.tile_origin(TilePos::new(0, 1)), (-100, 0));
        assert_eq!(g.middle_tile(), TilePos::new(0, 2));
    }

    #[test]
    fn window_copy() {
        let src: Vec<u8> = (0..16).collect();
        let mut dst = vec![0u8; 16];
        copy_window(&src, (1, 1), &mut dst, (0, 2), 4, 2, 2);
        assert_eq!(&dst[8..10], &[5, 6]);
        assert_eq!(&dst[12..14], &[9, 10]);
        assert!(Rect::new(1, 1, 2, 2).contains(2, 2));
        assert!(!Rect::new(1, 1, 2, 2).contains(3, 1));
    }
}
