//! Writes of a raster whose origin is not aligned on the tile grid.
//!
//! Each block then covers one quadrant of up to four tiles, so a tile only
//! becomes complete once the four blocks around it have been written for
//! every band. Partial tiles are staged here with one bit per quadrant and
//! band: bit 0 top-left, bit 1 top-right, bit 2 bottom-left, bit 3
//! bottom-right, shifted by `4 * band`.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::Result;

use super::cache::{MAX_BANDS, SCRATCH, TilePos, WORK};
use super::level::{Rect, RasterLevel, copy_window};

const QUADRANT_BITS: u32 = 4;

pub(crate) fn band_flags(band: usize) -> u32 {
    0xF << (QUADRANT_BITS * band as u32)
}

pub(crate) fn full_flags(bands: usize) -> u32 {
    (1 << (QUADRANT_BITS * bands as u32)) - 1
}

/// Quadrant bit of `rect` within a `tile_width` x `tile_height` tile.
pub(crate) fn quadrant_flag(rect: Rect, tile_width: usize, tile_height: usize) -> u32 {
    let left = rect.x == 0;
    let right = rect.x + rect.width == tile_width;
    let top = rect.y == 0;
    let bottom = rect.y + rect.height == tile_height;
    let mut flag = 0;
    if left && top {
        flag |= 1;
    }
    if right && top {
        flag |= 2;
    }
    if left && bottom {
        flag |= 4;
    }
    if right && bottom {
        flag |= 8;
    }
    flag
}

#[derive(Debug)]
pub(crate) struct StagedTile {
    pub(crate) flags: u32,
    pub(crate) planes: Vec<u8>,
}

/// Partially written tiles, ordered by row then column.
#[derive(Debug)]
pub(crate) struct ShiftedStaging {
    tiles: BTreeMap<TilePos, StagedTile>,
    plane_len: usize,
}

impl ShiftedStaging {
    pub(crate) fn new(plane_len: usize) -> Self {
        Self {
            tiles: BTreeMap::new(),
            plane_len,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.tiles.len()
    }

    pub(crate) fn positions(&self) -> Vec<TilePos> {
        self.tiles.keys().copied().collect()
    }

    pub(crate) fn take(&mut self, pos: TilePos) -> Option<StagedTile> {
        self.tiles.remove(&pos)
    }

    pub(crate) fn restore(&mut self, pos: TilePos, tile: StagedTile) {
        self.tiles.insert(pos, tile);
    }

    pub(crate) fn clear(&mut self) {
        self.tiles.clear();
    }

    /// Copy `rect` of `src` into the staged plane of `band`. Returns the
    /// flags the tile had before.
    pub(crate) fn stage(
        &mut self,
        pos: TilePos,
        band: usize,
        rect: Rect,
        src: &[u8],
        tile_width: usize,
        flag: u32,
    ) -> u32 {
        let plane_len = self.plane_len;
        let tile = self.tiles.entry(pos).or_insert_with(|| StagedTile {
            flags: 0,
            planes: vec![0; MAX_BANDS * plane_len],
        });
        let old = tile.flags;
        let plane = &mut tile.planes[band * plane_len..(band + 1) * plane_len];
        if old & band_flags(band) == 0 {
            plane.fill(0);
        }
        copy_window(
            src,
            (rect.x, rect.y),
            plane,
            (rect.x, rect.y),
            tile_width,
            rect.width,
            rect.height,
        );
        tile.flags |= flag;
        old
    }

    /// Fill `out` with what is staged for `pos`: written bands are copied,
    /// the others zeroed. `false` when nothing is staged.
    pub(crate) fn load_into(&self, pos: TilePos, bands: usize, out: &mut [u8]) -> bool {
        let Some(tile) = self.tiles.get(&pos) else {
            return false;
        };
        load_staged(tile, bands, self.plane_len, out);
        true
    }
}

fn load_staged(tile: &StagedTile, bands: usize, plane_len: usize, out: &mut [u8]) {
    for band in 0..bands {
        let range = band * plane_len..(band + 1) * plane_len;
        if tile.flags & band_flags(band) != 0 {
            out[range.clone()].copy_from_slice(&tile.planes[range]);
        } else {
            out[range].fill(0);
        }
    }
}

impl RasterLevel<'_> {
    /// Stage `rect` of band `band`, just copied into the work buffer, as part
    /// of tile `pos`. A tile whose quadrants are all known is written.
    pub(crate) fn write_shifted_tile(&mut self, pos: TilePos, band: usize, rect: Rect) -> Result<()> {
        let tile_width = self.geometry.tile_width as usize;
        let tile_height = self.geometry.tile_height as usize;
        let quadrant = quadrant_flag(rect, tile_width, tile_height);
        let flag = quadrant << (QUADRANT_BITS * band as u32);
        let full = full_flags(self.bands);

        self.cache.evict_readers();
        let src = self.cache.plane(WORK, band);
        let old = self.staging.stage(pos, band, rect, src, tile_width, flag);
        if old & flag != 0 {
            debug!(
                "Rewriting quadrant {} of band {} of tile (row={},col={})",
                quadrant,
                band + 1,
                pos.row,
                pos.col
            );
        }
        if old | flag != full {
            return Ok(());
        }

        let Some(tile) = self.staging.take(pos) else {
            return Ok(());
        };
        let len = self.bands * self.geometry.plane_len();
        self.cache.buffer_mut(WORK)[..len].copy_from_slice(&tile.planes[..len]);
        self.cache.pin_working(pos);
        self.cache.mark_all_dirty();
        if let Err(err) = self.write_tile() {
            // staged again so that the next flush retries it
            self.cache.release_working();
            self.staging.restore(pos, tile);
            return Err(err);
        }
        Ok(())
    }

    /// Write every staged tile, completing the missing quadrants from the
    /// stored tile when there is one.
    pub(crate) fn flush_remaining_shifted_tiles(&mut self) -> Result<()> {
        if self.staging.is_empty() {
            return Ok(());
        }
        debug!(
            zoom_level = self.zoom_level(),
            tiles = self.staging.len(),
            "writing partial tiles"
        );
        self.cache.reset();
        for pos in self.staging.positions() {
            let Some(tile) = self.staging.take(pos) else {
                continue;
            };
            if let Err(err) = self.write_staged_tile(pos, &tile) {
                self.cache.release_working();
                self.staging.restore(pos, tile);
                return Err(err);
            }
        }
        self.staging.clear();
        Ok(())
    }

    fn write_staged_tile(&mut self, pos: TilePos, tile: &StagedTile) -> Result<()> {
        let bands = self.bands;
        let plane_len = self.geometry.plane_len();
        load_staged(tile, bands, plane_len, self.cache.buffer_mut(WORK));

        if tile.flags != full_flags(bands) {
            if let Some(blob) = self.store.fetch(pos)? {
                self.decode_blob_into(pos, &blob, SCRATCH)?;
                self.backfill_quadrants(tile.flags);
            }
        }

        self.cache.pin_working(pos);
        self.cache.mark_all_dirty();
        self.write_tile()
    }

    /// Copy the quadrants absent from `flags` from the scratch buffer.
    fn backfill_quadrants(&mut self, flags: u32) {
        let tile_width = self.geometry.tile_width as usize;
        let tile_height = self.geometry.tile_height as usize;
        let x_mod = self.geometry.shift.x_pixels_mod as usize;
        let y_mod = self.geometry.shift.y_pixels_mod as usize;
        let x_max = usize::from(x_mod != 0);
        let y_max = usize::from(y_mod != 0);
        let span = |i: usize, shift: usize, size: usize| {
            if i == 0 && shift != 0 { (0, shift) } else { (shift, size - shift) }
        };

        for iy in 0..=y_max {
            let (y, height) = span(iy, y_mod, tile_height);
            for ix in 0..=x_max {
                let (x, width) = span(ix, x_mod, tile_width);
                let mut quadrant = 0;
                if ix == 0 && iy == 0 {
                    quadrant |= 1;
                }
                if ix == x_max && iy == 0 {
                    quadrant |= 2;
                }
                if ix == 0 && iy == y_max {
                    quadrant |= 4;
                }
                if ix == x_max && iy == y_max {
                    quadrant |= 8;
                }
                for band in 0..self.bands {
                    if flags & (quadrant << (QUADRANT_BITS * band as u32)) != 0 {
                        continue;
                    }
                    let (work, scratch) = self.cache.buffer_pair_mut(WORK, SCRATCH);
                    let plane = band * tile_width * tile_height;
                    let len = tile_width * tile_height;
                    copy_window(
                        &scratch[plane..plane + len],
                        (x, y),
                        &mut work[plane..plane + len],
                        (x, y),
                        tile_width,
                        width,
                        height,
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quadrant_flags_follow_corners() {
        assert_eq!(quadrant_flag(Rect::new(0, 0, 10, 10), 16, 16), 1);
        assert_eq!(quadrant_flag(Rect::new(6, 0, 10, 10), 16, 16), 2);
        assert_eq!(quadrant_flag(Rect::new(0, 6, 10, 10), 16, 16), 4);
        assert_eq!(quadrant_flag(Rect::new(6, 6, 10, 10), 16, 16), 8);
        // a full-height strip touches both left corners
        assert_eq!(quadrant_flag(Rect::new(0, 0, 10, 16), 16, 16), 5);
        assert_eq!(full_flags(3), 0xFFF);
        assert_eq!(band_flags(2), 0xF00);
    }

    #[test]
    fn staging_accumulates_quadrants() {
        let mut staging = ShiftedStaging::new(4);
        let pos = TilePos::new(0, 1);
        let src = [9u8; 4];
        let old = staging.stage(pos, 1, Rect::new(0, 0, 1, 2), &src, 2, 0x50);
        assert_eq!(old, 0);
        let old = staging.stage(pos, 1, Rect::new(1, 0, 1, 2), &src, 2, 0xA0);
        assert_eq!(old, 0x50);

        let mut out = vec![7u8; 8];
        assert!(staging.load_into(pos, 2, &mut out));
        assert_eq!(&out[..4], &[0, 0, 0, 0]);
        assert_eq!(&out[4..], &[9, 9, 9, 9]);
        assert!(!staging.load_into(TilePos::new(5, 5), 2, &mut out));

        let tile = staging.take(pos).expect("staged tile");
        assert_eq!(tile.flags, 0xF0);
        assert!(staging.is_empty());
    }
}
