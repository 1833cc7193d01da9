//! Block writes: blocks accumulate in the work buffer until a tile is
//! complete, then the tile is encoded and stored.

use tracing::{debug, trace, warn};

use crate::codec::encode_tile;
use crate::codec::select::{TileContent, select_encoding};
use crate::error::{GpkgError, Result};
use crate::options::TileFormat;

use super::cache::{SCRATCH, TilePos, WORK};
use super::level::{Rect, RasterLevel, copy_window};
use super::read::for_each_block_span;

impl RasterLevel<'_> {
    /// Encode and store the tile held by the work buffer, if it has pending
    /// writes. The work buffer stays pinned and dirty until the tile is
    /// stored, so a failed write can be retried by the next flush.
    pub(crate) fn write_tile(&mut self) -> Result<()> {
        if !self.has_pending_tile() {
            return Ok(());
        }
        self.role.batch()?.check_usable()?;
        if self.writing {
            return Err(GpkgError::RecursiveWrite);
        }
        self.writing = true;
        let result = self.write_tile_internal();
        self.writing = false;
        if result.is_ok() {
            self.cache.release_working();
        }
        result
    }

    fn has_pending_tile(&self) -> bool {
        self.update && self.cache.working().is_some() && self.cache.any_dirty(self.bands)
    }

    fn write_tile_internal(&mut self) -> Result<()> {
        let Some(pos) = self.cache.working() else {
            return Ok(());
        };
        let bands = self.bands;

        let mut lossy = false;
        if !self.cache.all_dirty(bands) {
            // complete the bands that were not written from the stored tile
            self.cache.evict_readers();
            lossy = self.read_tile_into(pos, SCRATCH)?;
            self.cache.copy_clean_bands(SCRATCH, WORK, bands);
        }

        let geometry = self.geometry;
        let tile_width = geometry.tile_width as usize;
        let tile_height = geometry.tile_height as usize;
        let raster_width = i64::from(geometry.raster_width);
        let raster_height = i64::from(geometry.raster_height);
        let (x_off, y_off) = geometry.tile_origin(pos);
        if x_off >= raster_width || y_off >= raster_height {
            return Ok(());
        }

        let alpha_band = match bands {
            2 => Some(1),
            4 => Some(3),
            _ => None,
        };
        let mut valid = Rect::new(0, 0, tile_width, tile_height);
        let mut partial = false;
        if alpha_band.is_none() {
            (valid.x, valid.width, partial) =
                clip_span(x_off, tile_width, raster_width, partial);
            (valid.y, valid.height, partial) =
                clip_span(y_off, tile_height, raster_height, partial);
        }

        let mut all_opaque = true;
        if let Some(alpha) = alpha_band {
            let plane = self.cache.plane(WORK, alpha);
            let first = plane[0];
            if plane.iter().all(|v| *v == first) {
                if first == 0 {
                    trace!(row = pos.row, col = pos.col, "tile is fully transparent");
                    return self.store.delete(pos);
                }
                all_opaque = first == 255;
            } else {
                all_opaque = false;
            }
        }

        if lossy {
            debug!(
                "Had to read tile (row={},col={}) at zoom_level={}, stored in a lossy format, \
                 before rewriting it, causing potential extra quality loss",
                pos.row,
                pos.col,
                self.zoom_level()
            );
            if !self.lossy_warned {
                warn!(
                    zoom_level = self.zoom_level(),
                    "rewriting tiles stored in a lossy format, quality may degrade"
                );
                self.lossy_warned = true;
            }
        }

        let color_table = self.color_table()?;
        let content = TileContent {
            dataset_bands: bands,
            has_color_table: color_table.is_some(),
            color_table_has_transparency: color_table
                .as_ref()
                .is_some_and(|ct| ct.has_transparent_entry()),
            partial,
            all_opaque,
        };
        let encoding = select_encoding(self.codec.tile_format, &content);

        if encoding.needs_synthetic_alpha(&content) {
            let plane = self.cache.plane_mut(WORK, encoding.tile_bands - 1);
            plane.fill(0);
            for row in valid.y..valid.y + valid.height {
                let start = row * tile_width + valid.x;
                plane[start..start + valid.width].fill(255);
            }
        }

        let plane_len = geometry.plane_len();
        let mut quantized = None;
        let mut expanded = false;
        if self.codec.tile_format == TileFormat::Png8 && encoding.tile_bands == 1 && bands >= 3 {
            let batch = self.role.batch()?;
            let dither = self.codec.dither;
            let (work, scratch) = self.cache.buffer_pair_mut(WORK, SCRATCH);
            let table = batch.with_arena(geometry.tile_width, geometry.tile_height, |arena| {
                arena.quantize(
                    &work[..plane_len],
                    &work[plane_len..2 * plane_len],
                    &work[2 * plane_len..3 * plane_len],
                    dither,
                    &mut scratch[..plane_len],
                )
            })?;
            quantized = Some(table);
        } else if let Some(ct) = color_table.as_ref().filter(|_| encoding.tile_bands > 1) {
            // paletted dataset written with a driver that cannot store a
            // palette; the indices in the work buffer are kept for a retry
            let lut = ct.expansion_lut();
            let (work, scratch) = self.cache.buffer_pair_mut(WORK, SCRATCH);
            for row in 0..tile_height {
                for col in 0..tile_width {
                    let i = row * tile_width + col;
                    let rgba = if valid.contains(col, row) {
                        lut[work[i] as usize]
                    } else {
                        [0; 4]
                    };
                    for (band, value) in rgba.into_iter().enumerate() {
                        scratch[band * plane_len + i] = value;
                    }
                }
            }
            expanded = true;
        }

        let palette = if encoding.tile_bands == 1 {
            quantized.as_ref().or(color_table.as_ref())
        } else {
            None
        };
        let from_scratch = quantized.is_some();
        let planes: Vec<&[u8]> = (0..encoding.tile_bands)
            .map(|band| {
                if from_scratch {
                    self.cache.plane(SCRATCH, 0)
                } else if expanded {
                    self.cache.plane(SCRATCH, band)
                } else {
                    self.cache.plane(WORK, encoding.source_plane(&content, band))
                }
            })
            .collect();
        let blob = encode_tile(
            encoding.driver,
            &planes,
            geometry.tile_width,
            geometry.tile_height,
            palette,
            &self.codec,
        )?;

        trace!(
            row = pos.row,
            col = pos.col,
            driver = encoding.driver.mime_type(),
            bands = encoding.tile_bands,
            "encoded tile"
        );
        self.role.batch()?.before_insert(self.store.conn())?;
        self.store.insert(pos, &blob)
    }

    /// Move block (`x`, `y`) of band `band` into the tiles it covers.
    pub(crate) fn write_block_internal(&mut self, band: usize, x: u32, y: u32) -> Result<()> {
        let batch = self.role.batch()?;
        if !self.update {
            return Err(GpkgError::ReadOnly);
        }
        if !self.georeferenced {
            return Err(GpkgError::GeoreferencingNotSet);
        }
        let key = (band, x, y);
        if !self.blocks.is_dirty(key) {
            return Ok(());
        }
        batch.mark_modified();
        trace!(zoom_level = self.zoom_level(), band, x, y, "write block");

        let geometry = self.geometry;
        let shifted = geometry.is_shifted();
        let tile_width = geometry.tile_width as usize;
        let tile_height = geometry.tile_height as usize;
        let x_mod = geometry.shift.x_pixels_mod as usize;
        let y_mod = geometry.shift.y_pixels_mod as usize;
        let (first, last) = geometry.block_tiles(x, y);

        for row in first.row..=last.row {
            for col in first.col..=last.col {
                let pos = TilePos::new(row, col);
                if !geometry.contains(pos) {
                    continue;
                }

                if !shifted {
                    if !self.cache.is_working(pos) {
                        self.write_tile()?;
                        self.cache.pin_working(pos);
                    }
                    let mut all_dirty = true;
                    for iband in 0..self.bands {
                        let src = if iband == band {
                            match self.blocks.get(key) {
                                Some(data) => data,
                                None => continue,
                            }
                        } else if self.cache.is_dirty(iband) {
                            continue;
                        } else {
                            match self.blocks.take_dirty((iband, x, y)) {
                                Some(data) => data,
                                None => {
                                    all_dirty = false;
                                    continue;
                                }
                            }
                        };
                        self.cache.plane_mut(WORK, iband).copy_from_slice(src);
                        self.cache.mark_dirty(iband);
                        if self.codec.tile_format != TileFormat::Jpeg {
                            zero_outside_raster(self.cache.plane_mut(WORK, iband), x, y, &geometry);
                        }
                    }
                    if all_dirty {
                        self.write_tile()?;
                    }
                } else {
                    // the block covers the bottom-right part of the first
                    // tile and the top-left part of the next one
                    let (dst_x, width, src_x) = if col == first.col {
                        (x_mod, tile_width - x_mod, 0)
                    } else {
                        (0, x_mod, tile_width - x_mod)
                    };
                    let (dst_y, height, src_y) = if row == first.row {
                        (y_mod, tile_height - y_mod, 0)
                    } else {
                        (0, y_mod, tile_height - y_mod)
                    };
                    let Some(src) = self.blocks.get(key) else {
                        continue;
                    };
                    copy_window(
                        src,
                        (src_x, src_y),
                        self.cache.plane_mut(WORK, band),
                        (dst_x, dst_y),
                        tile_width,
                        width,
                        height,
                    );
                    self.cache.release_working();
                    self.write_shifted_tile(pos, band, Rect::new(dst_x, dst_y, width, height))?;
                }
            }
        }
        self.blocks.mark_clean(key);
        Ok(())
    }

    /// Store band `band` (zero-based) of block (`x`, `y`). Tiles are written
    /// once every band of the block has been given, or on flush.
    pub fn write_block(&mut self, band: usize, x: u32, y: u32, data: &[u8]) -> Result<()> {
        self.check_block(band, x, y, data.len())?;
        if !self.update {
            return Err(GpkgError::ReadOnly);
        }
        if !self.georeferenced {
            return Err(GpkgError::GeoreferencingNotSet);
        }
        self.blocks.put_dirty((band, x, y), data.to_vec());
        if self.blocks.all_bands_dirty(x, y, self.bands) {
            for iband in 0..self.bands {
                self.write_block_internal(iband, x, y)?;
            }
        }
        Ok(())
    }

    /// Write a window of every band given band after band.
    pub fn write_region(&mut self, x: u32, y: u32, width: u32, height: u32, data: &[u8]) -> Result<()> {
        self.check_region(x, y, width, height, data.len())?;
        if !self.update {
            return Err(GpkgError::ReadOnly);
        }
        let (tile_width, tile_height) = self.block_size();
        let mut block = vec![0u8; self.geometry.plane_len()];
        let plane_len = width as usize * height as usize;
        for band in 0..self.bands {
            let plane = &data[band * plane_len..(band + 1) * plane_len];
            for_each_block_span(x, y, width, height, tile_width, tile_height, |span| {
                if !span.covers_block(tile_width, tile_height) {
                    self.read_block(band, span.block_x, span.block_y, &mut block)?;
                }
                for row in 0..span.height {
                    let d = (span.in_block_y + row) * tile_width as usize + span.in_block_x;
                    let s = (span.in_window_y + row) * width as usize + span.in_window_x;
                    block[d..d + span.width].copy_from_slice(&plane[s..s + span.width]);
                }
                self.write_block(band, span.block_x, span.block_y, &block)
            })?;
        }
        Ok(())
    }

    /// Hand every dirty block to the block writer.
    pub(crate) fn flush_blocks(&mut self) -> Result<()> {
        for (band, x, y) in self.blocks.dirty_keys() {
            self.write_block_internal(band, x, y)?;
        }
        Ok(())
    }

    /// Write what the tile buffers still hold and commit the batch.
    pub(crate) fn flush_tiles(&mut self) -> Result<()> {
        let batch = self.role.batch()?;
        batch.check_usable()?;
        let result = if !self.update {
            Ok(())
        } else if self.geometry.is_shifted() {
            self.flush_remaining_shifted_tiles()
        } else {
            self.write_tile()
        };
        batch.commit(self.store.conn())?;
        result
    }

    /// Flush this level alone.
    pub(crate) fn flush_level(&mut self) -> Result<()> {
        self.flush_blocks()?;
        self.flush_tiles()
    }
}

/// Clip a tile span starting at raster offset `offset` to the raster:
/// returns the valid start, length and whether clipping happened.
fn clip_span(offset: i64, tile: usize, raster: i64, partial: bool) -> (usize, usize, bool) {
    let mut start = 0;
    let mut count = tile as i64;
    let mut clipped = partial;
    if offset < 0 {
        start = -offset;
        count += offset;
        clipped = true;
    }
    if offset > raster - tile as i64 {
        count -= offset + tile as i64 - raster;
        clipped = true;
    }
    (start as usize, count.max(0) as usize, clipped)
}

/// Zero the part of an edge block lying beyond the raster.
fn zero_outside_raster(plane: &mut [u8], x: u32, y: u32, geometry: &super::level::LevelGeometry) {
    let tile_width = i64::from(geometry.tile_width);
    let tile_height = i64::from(geometry.tile_height);
    let raster_width = i64::from(geometry.raster_width);
    let raster_height = i64::from(geometry.raster_height);
    let left = i64::from(x) * tile_width;
    let top = i64::from(y) * tile_height;
    if left < raster_width - tile_width && top < raster_height - tile_height {
        return;
    }
    let x_end = (raster_width - left).clamp(0, tile_width) as usize;
    let y_end = (raster_height - top).clamp(0, tile_height) as usize;
    let stride = tile_width as usize;
    for (row, line) in plane.chunks_exact_mut(stride).enumerate() {
        if row < y_end {
            line[x_end..].fill(0);
        } else {
            line.fill(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::level::LevelGeometry;
    use crate::tiling::PixelShift;

    #[test]
    fn spans_are_clipped_to_the_raster() {
        assert_eq!(clip_span(0, 256, 600, false), (0, 256, false));
        assert_eq!(clip_span(-100, 256, 600, false), (100, 156, true));
        assert_eq!(clip_span(512, 256, 600, false), (0, 88, true));
        // a tile larger than a small raster is clipped on both sides
        assert_eq!(clip_span(-10, 256, 100, false), (10, 100, true));
    }

    #[test]
    fn edge_block_is_zeroed_beyond_raster() {
        let geometry = LevelGeometry {
            raster_width: 3,
            raster_height: 3,
            tile_width: 2,
            tile_height: 2,
            matrix_width: 2,
            matrix_height: 2,
            shift: PixelShift::default(),
        };
        let mut plane = vec![9u8; 4];
        zero_outside_raster(&mut plane, 1, 0, &geometry);
        assert_eq!(plane, vec![9, 0, 9, 0]);

        let mut plane = vec![9u8; 4];
        zero_outside_raster(&mut plane, 1, 1, &geometry);
        assert_eq!(plane, vec![9, 0, 0, 0]);
    }
}
