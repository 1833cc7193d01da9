//! Block reads: tiles are fetched through the cache, decoded and composed
//! into the dataset band layout.

use tracing::{error, trace, warn};

use crate::codec::{DecodedTile, decode_tile};
use crate::color_table::{ColorTable, PaletteRemap};
use crate::error::{GpkgError, Result};

use super::cache::{READ, TEMP, TilePos, WORK};
use super::level::{RasterLevel, copy_window};

/// What a decoded tile is composed into.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Composition<'t> {
    pub(crate) bands: usize,
    pub(crate) tile_width: u32,
    pub(crate) tile_height: u32,
    /// Dataset color table, single band datasets only.
    pub(crate) color_table: Option<&'t ColorTable>,
}

/// Write `tile` into the four planes of `out` following the dataset band
/// layout. Returns whether the tile was stored lossily.
pub(crate) fn compose_tile(
    tile: &DecodedTile,
    target: &Composition<'_>,
    out: &mut [u8],
    palette_warned: &mut bool,
) -> Result<bool> {
    if tile.width != target.tile_width
        || tile.height != target.tile_height
        || !(1..=4).contains(&tile.bands)
    {
        return Err(GpkgError::ShapeMismatch {
            width: tile.width,
            height: tile.height,
            bands: tile.bands,
            expected_width: target.tile_width,
            expected_height: target.tile_height,
        });
    }
    let len = tile.plane_len();
    let lossy = tile.is_lossy();
    out[..tile.bands * len].copy_from_slice(&tile.planes[..tile.bands * len]);

    let dataset_ct = target.color_table.filter(|_| target.bands == 1);
    let tile_ct = tile.palette.as_ref().filter(|_| tile.bands == 1);

    // RGB(A) tiles of a paletted dataset go back to palette indices
    if let Some(ct) = dataset_ct {
        if tile.bands != 1 {
            if tile.bands == 2 {
                gray_alpha_to_rgba(out, len);
            }
            PaletteRemap::new(ct, matches!(tile.bands, 2 | 4)).remap_planes(out, len);
            return Ok(lossy);
        }
    }

    match (dataset_ct, tile_ct) {
        (Some(dataset), Some(stored)) if dataset != stored => {
            if !*palette_warned {
                warn!("tile palette differs from the dataset color table, remapping to the closest entries");
                *palette_warned = true;
            }
            let lut = reconcile_palette(stored, dataset);
            for value in &mut out[..len] {
                *value = lut[*value as usize];
            }
        }
        _ => {
            let inconsistent = (target.bands == 1 && tile.bands >= 3)
                || (target.bands == 1 && tile.bands == 1 && dataset_ct.is_some() && tile_ct.is_none())
                || (target.bands <= 2 && tile.bands == 1 && dataset_ct.is_none() && tile_ct.is_some());
            if inconsistent {
                error!("Inconsistent dataset and tiles band characteristics");
            }
        }
    }

    if target.bands == 2 {
        match tile.bands {
            1 | 3 => out[len..2 * len].fill(255),
            4 => out.copy_within(3 * len..4 * len, len),
            _ => {}
        }
    } else if tile.bands == 2 {
        out.copy_within(len..2 * len, 3 * len);
        out.copy_within(0..len, len);
        out.copy_within(0..len, 2 * len);
    } else if tile.bands == 1 && dataset_ct.is_none() {
        if let Some(ct) = tile_ct {
            let lut = ct.expansion_lut();
            for i in 0..len {
                let [c1, c2, c3, c4] = lut[out[i] as usize];
                out[i] = c1;
                out[len + i] = c2;
                out[2 * len + i] = c3;
                out[3 * len + i] = c4;
            }
        } else {
            out.copy_within(0..len, len);
            out.copy_within(0..len, 2 * len);
            if target.bands == 4 {
                out[3 * len..4 * len].fill(255);
            }
        }
    } else if tile.bands == 3 && target.bands == 4 {
        out[3 * len..4 * len].fill(255);
    }
    Ok(lossy)
}

/// Gray + alpha planes to RGBA in place.
fn gray_alpha_to_rgba(out: &mut [u8], len: usize) {
    out.copy_within(len..2 * len, 3 * len);
    out.copy_within(0..len, len);
    out.copy_within(0..len, 2 * len);
}

/// Index translation from a stored tile palette to the dataset one.
fn reconcile_palette(stored: &ColorTable, dataset: &ColorTable) -> [u8; 256] {
    let mut lut = [0u8; 256];
    for (i, slot) in lut.iter_mut().enumerate() {
        *slot = match stored.get(i) {
            Some(entry) => dataset.find_best_entry(entry.c1, entry.c2, entry.c3, entry.c4, true),
            None => dataset.find_best_entry(0, 0, 0, 0, true),
        };
    }
    lut
}

impl RasterLevel<'_> {
    /// Decode tile `pos` into `buffer`, bypassing the slots. Tiles outside of
    /// the matrix and missing tiles read as zeros. Returns whether the stored
    /// tile was lossy.
    pub(crate) fn read_tile_into(&mut self, pos: TilePos, buffer: usize) -> Result<bool> {
        if !self.geometry.contains(pos) {
            self.cache.buffer_mut(buffer).fill(0);
            return Ok(false);
        }
        match self.store.fetch(pos)? {
            Some(blob) => self.decode_blob_into(pos, &blob, buffer),
            None => {
                let out = self.cache.buffer_mut(buffer);
                let staged = self.geometry.is_shifted() && self.staging.load_into(pos, self.bands, out);
                if !staged {
                    out.fill(0);
                }
                Ok(false)
            }
        }
    }

    /// Decode and compose a stored blob. Undecodable or mismatching tiles
    /// are logged and read as zeros.
    pub(crate) fn decode_blob_into(&mut self, pos: TilePos, blob: &[u8], buffer: usize) -> Result<bool> {
        let tile = match decode_tile(blob) {
            Ok(tile) => tile,
            Err(err) if err.is_tile_corruption() => {
                error!(row = pos.row, col = pos.col, "{err}");
                self.cache.buffer_mut(buffer).fill(0);
                return Ok(false);
            }
            Err(err) => return Err(err),
        };
        if self.bands == 1 || tile.bands == 1 {
            self.ensure_palette()?;
        }
        let state = self.palette.borrow();
        let target = Composition {
            bands: self.bands,
            tile_width: self.geometry.tile_width,
            tile_height: self.geometry.tile_height,
            color_table: state.table.as_ref().filter(|_| self.bands == 1),
        };
        let out = self.cache.buffer_mut(buffer);
        match compose_tile(&tile, &target, out, &mut self.palette_warned) {
            Ok(lossy) => Ok(lossy),
            Err(err) => {
                error!(row = pos.row, col = pos.col, "{err}");
                out.fill(0);
                Ok(false)
            }
        }
    }

    /// Tile `pos` through the slots; returns the buffer holding it.
    fn read_tile_cached(&mut self, pos: TilePos) -> Result<usize> {
        if self.geometry.is_shifted() {
            let Some(slot) = self.cache.find_slot(pos) else {
                return Err(GpkgError::InvalidArgument(format!(
                    "tile (row={},col={}) is outside of the read window",
                    pos.row, pos.col
                )));
            };
            if let Some(buffer) = self.cache.slot(slot).buffer {
                return Ok(buffer);
            }
            let buffer = self.cache.claim_buffer(slot);
            self.read_tile_into(pos, buffer)?;
            return Ok(buffer);
        }

        if !self.cache.any_dirty(self.bands) {
            self.read_tile_into(pos, READ)?;
            return Ok(READ);
        }
        // keep the pending writes of the work buffer
        self.cache.evict_readers();
        self.read_tile_into(pos, TEMP)?;
        self.cache.copy_clean_bands(TEMP, READ, self.bands);
        if self.cache.is_working(pos) {
            self.cache.copy_dirty_bands(WORK, READ, self.bands);
        }
        Ok(READ)
    }

    /// Fill `out` with band `band` of block (`x`, `y`) from the tiles, and
    /// refresh the clean blocks of the other bands on the way.
    pub(crate) fn read_block_internal(&mut self, band: usize, x: u32, y: u32, out: &mut [u8]) -> Result<()> {
        trace!(zoom_level = self.zoom_level(), band, x, y, "read block");
        let geometry = self.geometry;
        let shifted = geometry.is_shifted();
        let (first, last) = geometry.block_tiles(x, y);
        if shifted {
            self.cache.reposition_window(first);
        }
        let tile_width = geometry.tile_width as usize;
        let tile_height = geometry.tile_height as usize;
        let x_mod = geometry.shift.x_pixels_mod as usize;
        let y_mod = geometry.shift.y_pixels_mod as usize;

        for row in first.row..=last.row {
            for col in first.col..=last.col {
                let pos = TilePos::new(row, col);
                if !shifted && !self.cache.is_working(pos) {
                    self.write_tile()?;
                }
                let buffer = self.read_tile_cached(pos)?;

                // source x, width and destination x of the part of the tile
                // inside the block
                let (src_x, width, dst_x) = if x_mod == 0 {
                    (0, tile_width, 0)
                } else if col == first.col {
                    (x_mod, tile_width - x_mod, 0)
                } else {
                    (0, x_mod, tile_width - x_mod)
                };
                let (src_y, height, dst_y) = if y_mod == 0 {
                    (0, tile_height, 0)
                } else if row == first.row {
                    (y_mod, tile_height - y_mod, 0)
                } else {
                    (0, y_mod, tile_height - y_mod)
                };

                for iband in 0..self.bands {
                    let src = self.cache.plane(buffer, iband);
                    let dst: &mut [u8] = if iband == band {
                        &mut *out
                    } else {
                        match self.blocks.clean_mut((iband, x, y)) {
                            Some(block) => block,
                            None => continue,
                        }
                    };
                    if shifted {
                        copy_window(src, (src_x, src_y), dst, (dst_x, dst_y), tile_width, width, height);
                    } else {
                        dst.copy_from_slice(src);
                    }
                }
            }
        }
        Ok(())
    }

    /// Read band `band` (zero-based) of block (`x`, `y`) into `out`, which
    /// holds one tile worth of samples. Pending writes are visible.
    pub fn read_block(&mut self, band: usize, x: u32, y: u32, out: &mut [u8]) -> Result<()> {
        self.check_block(band, x, y, out.len())?;
        if let Some(block) = self.blocks.get((band, x, y)) {
            out.copy_from_slice(block);
            return Ok(());
        }
        self.read_block_internal(band, x, y, out)?;
        self.blocks.put_clean((band, x, y), out);
        Ok(())
    }

    /// Read a window of every band into `out`, band after band.
    pub fn read_region(&mut self, x: u32, y: u32, width: u32, height: u32, out: &mut [u8]) -> Result<()> {
        self.check_region(x, y, width, height, out.len())?;
        let (tile_width, tile_height) = self.block_size();
        let mut block = vec![0u8; self.geometry.plane_len()];
        let plane_len = width as usize * height as usize;
        for band in 0..self.bands {
            let plane = &mut out[band * plane_len..(band + 1) * plane_len];
            for_each_block_span(x, y, width, height, tile_width, tile_height, |span| {
                self.read_block(band, span.block_x, span.block_y, &mut block)?;
                for row in 0..span.height {
                    let s = (span.in_block_y + row) * tile_width as usize + span.in_block_x;
                    let d = (span.in_window_y + row) * width as usize + span.in_window_x;
                    plane[d..d + span.width].copy_from_slice(&block[s..s + span.width]);
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    pub(crate) fn check_region(&self, x: u32, y: u32, width: u32, height: u32, len: usize) -> Result<()> {
        let (raster_width, raster_height) = self.raster_size();
        if width == 0
            || height == 0
            || u64::from(x) + u64::from(width) > u64::from(raster_width)
            || u64::from(y) + u64::from(height) > u64::from(raster_height)
        {
            return Err(GpkgError::InvalidArgument(format!(
                "window {width}x{height} at ({x}, {y}) is outside of the {raster_width}x{raster_height} raster"
            )));
        }
        let expected = self.bands * width as usize * height as usize;
        if len != expected {
            return Err(GpkgError::InvalidArgument(format!(
                "window buffer holds {len} bytes, expected {expected}"
            )));
        }
        Ok(())
    }
}

/// Intersection of a raster window with one block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BlockSpan {
    pub(crate) block_x: u32,
    pub(crate) block_y: u32,
    pub(crate) in_block_x: usize,
    pub(crate) in_block_y: usize,
    pub(crate) in_window_x: usize,
    pub(crate) in_window_y: usize,
    pub(crate) width: usize,
    pub(crate) height: usize,
}

impl BlockSpan {
    pub(crate) fn covers_block(&self, tile_width: u32, tile_height: u32) -> bool {
        self.width == tile_width as usize && self.height == tile_height as usize
    }
}

/// Visit the blocks under a window, row of blocks after row of blocks.
pub(crate) fn for_each_block_span<F>(
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    tile_width: u32,
    tile_height: u32,
    mut visit: F,
) -> Result<()>
where
    F: FnMut(BlockSpan) -> Result<()>,
{
    let x_end = x + width;
    let y_end = y + height;
    for block_y in y / tile_height..y_end.div_ceil(tile_height) {
        let top = (block_y * tile_height).max(y);
        let bottom = ((block_y + 1) * tile_height).min(y_end);
        for block_x in x / tile_width..x_end.div_ceil(tile_width) {
            let left = (block_x * tile_width).max(x);
            let right = ((block_x + 1) * tile_width).min(x_end);
            visit(BlockSpan {
                block_x,
                block_y,
                in_block_x: (left - block_x * tile_width) as usize,
                in_block_y: (top - block_y * tile_height) as usize,
                in_window_x: (left - x) as usize,
                in_window_y: (top - y) as usize,
                width: (right - left) as usize,
                height: (bottom - top) as usize,
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::TileDriver;
    use crate::color_table::ColorEntry;

    fn tile(bands: usize, planes: Vec<u8>, palette: Option<ColorTable>) -> DecodedTile {
        DecodedTile {
            width: 2,
            height: 1,
            bands,
            planes,
            palette,
            driver: TileDriver::Png,
        }
    }

    fn target(bands: usize, color_table: Option<&ColorTable>) -> Composition<'_> {
        Composition {
            bands,
            tile_width: 2,
            tile_height: 1,
            color_table,
        }
    }

    #[test]
    fn gray_tile_fills_rgba() -> Result<()> {
        let mut out = vec![0u8; 8];
        let mut warned = false;
        let lossy = compose_tile(&tile(1, vec![10, 20], None), &target(4, None), &mut out, &mut warned)?;
        assert!(!lossy);
        assert_eq!(out, vec![10, 20, 10, 20, 10, 20, 255, 255]);
        Ok(())
    }

    #[test]
    fn gray_alpha_tile_into_rgba() -> Result<()> {
        let mut out = vec![0u8; 8];
        let mut warned = false;
        compose_tile(&tile(2, vec![10, 20, 0, 255], None), &target(4, None), &mut out, &mut warned)?;
        assert_eq!(out, vec![10, 20, 10, 20, 10, 20, 0, 255]);
        Ok(())
    }

    #[test]
    fn rgba_tile_into_gray_alpha_keeps_alpha() -> Result<()> {
        let mut out = vec![0u8; 8];
        let mut warned = false;
        compose_tile(
            &tile(4, vec![1, 2, 3, 4, 5, 6, 7, 8], None),
            &target(2, None),
            &mut out,
            &mut warned,
        )?;
        assert_eq!(&out[..4], &[1, 2, 7, 8]);
        Ok(())
    }

    #[test]
    fn paletted_tile_expands_for_rgba_dataset() -> Result<()> {
        let ct = ColorTable::new(vec![ColorEntry::rgba(1, 2, 3, 4), ColorEntry::rgba(5, 6, 7, 8)]);
        let mut out = vec![0u8; 8];
        let mut warned = false;
        compose_tile(&tile(1, vec![1, 0], Some(ct)), &target(4, None), &mut out, &mut warned)?;
        assert_eq!(out, vec![5, 1, 6, 2, 7, 3, 8, 4]);
        Ok(())
    }

    #[test]
    fn rgb_tile_maps_onto_dataset_palette() -> Result<()> {
        let ct = ColorTable::new(vec![ColorEntry::rgb(0, 0, 0), ColorEntry::rgb(200, 0, 0)]);
        let mut out = vec![0u8; 8];
        let mut warned = false;
        compose_tile(
            &tile(3, vec![190, 0, 0, 0, 10, 0], None),
            &target(1, Some(&ct)),
            &mut out,
            &mut warned,
        )?;
        assert_eq!(&out[..2], &[1, 0]);
        Ok(())
    }

    #[test]
    fn divergent_palette_is_reconciled() -> Result<()> {
        let dataset = ColorTable::new(vec![ColorEntry::rgb(0, 0, 0), ColorEntry::rgb(255, 255, 255)]);
        let stored = ColorTable::new(vec![ColorEntry::rgb(250, 250, 250), ColorEntry::rgb(5, 5, 5)]);
        let mut out = vec![0u8; 8];
        let mut warned = false;
        compose_tile(&tile(1, vec![0, 1], Some(stored)), &target(1, Some(&dataset)), &mut out, &mut warned)?;
        assert_eq!(&out[..2], &[1, 0]);
        assert!(warned);
        Ok(())
    }

    #[test]
    fn wrong_tile_size_is_rejected() {
        let mut out = vec![0u8; 8];
        let mut warned = false;
        let bad = DecodedTile {
            width: 1,
            height: 1,
            bands: 1,
            planes: vec![0],
            palette: None,
            driver: TileDriver::Png,
        };
        match compose_tile(&bad, &target(1, None), &mut out, &mut warned).unwrap_err() {
            GpkgError::ShapeMismatch { width: 1, expected_width: 2, .. } => {}
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn window_spans_blocks() -> Result<()> {
        let mut spans = Vec::new();
        for_each_block_span(3, 0, 6, 2, 4, 4, |span| {
            spans.push(span);
            Ok(())
        })?;
        assert_eq!(spans.len(), 2);
        assert_eq!((spans[0].block_x, spans[0].in_block_x, spans[0].width), (0, 3, 1));
        assert_eq!((spans[1].block_x, spans[1].in_window_x, spans[1].width), (1, 1, 4));
        assert!(!spans[1].covers_block(4, 4));
        Ok(())
    }
}
