//! Median-cut color reduction used for PNG8 tiles.
//!
//! All working memory lives in a [`QuantizeArena`] sized once from the tile
//! dimensions, so encoding a tile never allocates past the palette itself.

use std::mem::size_of;

use crate::color_table::{ColorEntry, ColorTable};
use crate::error::{GpkgError, Result};

const EMPTY: u32 = u32::MAX;
const MAX_COLORS: usize = 256;
/// 5 bits per channel.
const CELL_COUNT: usize = 1 << 15;

#[derive(Clone, Copy, Debug)]
struct ColorBox {
    start: usize,
    end: usize,
    pixels: u64,
}

/// Scratch buffers for quantizing one tile at a time.
#[derive(Debug)]
pub(crate) struct QuantizeArena {
    width: usize,
    height: usize,
    hash_bits: u32,
    hash_keys: Vec<u32>,
    hash_ids: Vec<u32>,
    colors: Vec<[u8; 3]>,
    counts: Vec<u32>,
    order: Vec<u32>,
    nearest: Vec<u8>,
    pixel_ids: Vec<u32>,
    cells: Vec<i16>,
    errors: Vec<i32>,
}

fn alloc<T: Clone>(len: usize, value: T) -> Result<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|_| GpkgError::QuantizationAlloc {
            bytes: len.saturating_mul(size_of::<T>()),
        })?;
    v.resize(len, value);
    Ok(v)
}

fn reserve<T>(len: usize) -> Result<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|_| GpkgError::QuantizationAlloc {
            bytes: len.saturating_mul(size_of::<T>()),
        })?;
    Ok(v)
}

impl QuantizeArena {
    pub(crate) fn new(width: u32, height: u32) -> Result<Self> {
        let width = width as usize;
        let height = height as usize;
        let pixels = width * height;
        let table_len = (pixels * 2).max(16).next_power_of_two();
        Ok(Self {
            width,
            height,
            hash_bits: table_len.trailing_zeros(),
            hash_keys: alloc(table_len, EMPTY)?,
            hash_ids: alloc(table_len, 0)?,
            colors: reserve(pixels)?,
            counts: reserve(pixels)?,
            order: reserve(pixels)?,
            nearest: reserve(pixels)?,
            pixel_ids: alloc(pixels, 0)?,
            cells: alloc(CELL_COUNT, -1)?,
            // two rows of RGB error, padded by one pixel on each side
            errors: alloc(2 * (width + 2) * 3, 0)?,
        })
    }

    /// Reduce an RGB tile to at most 256 colors. Indices are written to `out`.
    pub(crate) fn quantize(
        &mut self,
        red: &[u8],
        green: &[u8],
        blue: &[u8],
        dither: bool,
        out: &mut [u8],
    ) -> Result<ColorTable> {
        let pixels = self.width * self.height;
        if red.len() < pixels || green.len() < pixels || blue.len() < pixels || out.len() < pixels {
            return Err(GpkgError::InvalidArgument(format!(
                "quantizer sized for {}x{} tiles",
                self.width, self.height
            )));
        }

        self.build_histogram(red, green, blue, pixels);

        if self.colors.len() <= MAX_COLORS {
            let entries = self
                .colors
                .iter()
                .map(|[r, g, b]| ColorEntry::rgb(*r, *g, *b))
                .collect();
            for (slot, id) in out.iter_mut().zip(&self.pixel_ids[..pixels]) {
                *slot = *id as u8;
            }
            return Ok(ColorTable::new(entries));
        }

        let table = self.median_cut();
        if dither {
            self.dither(red, green, blue, &table, out);
        } else {
            self.nearest.clear();
            for [r, g, b] in &self.colors {
                self.nearest.push(table.find_best_entry(*r, *g, *b, 255, false));
            }
            for (slot, id) in out.iter_mut().zip(&self.pixel_ids[..pixels]) {
                *slot = self.nearest[*id as usize];
            }
        }
        Ok(table)
    }

    fn build_histogram(&mut self, red: &[u8], green: &[u8], blue: &[u8], pixels: usize) {
        self.hash_keys.fill(EMPTY);
        self.colors.clear();
        self.counts.clear();
        let mask = self.hash_keys.len() - 1;
        for i in 0..pixels {
            let key = u32::from(red[i]) << 16 | u32::from(green[i]) << 8 | u32::from(blue[i]);
            let mut slot = (key.wrapping_mul(0x9E37_79B1) >> (32 - self.hash_bits)) as usize;
            let id = loop {
                match self.hash_keys[slot] {
                    EMPTY => {
                        let id = self.colors.len() as u32;
                        self.hash_keys[slot] = key;
                        self.hash_ids[slot] = id;
                        self.colors.push([red[i], green[i], blue[i]]);
                        self.counts.push(0);
                        break id;
                    }
                    k if k == key => break self.hash_ids[slot],
                    _ => slot = (slot + 1) & mask,
                }
            };
            self.counts[id as usize] += 1;
            self.pixel_ids[i] = id;
        }
    }

    fn median_cut(&mut self) -> ColorTable {
        self.order.clear();
        self.order.extend(0..self.colors.len() as u32);

        let mut boxes: Vec<ColorBox> = Vec::with_capacity(MAX_COLORS);
        boxes.push(ColorBox {
            start: 0,
            end: self.order.len(),
            pixels: (self.width * self.height) as u64,
        });

        while boxes.len() < MAX_COLORS {
            let candidate = boxes
                .iter()
                .enumerate()
                .filter(|(_, b)| b.end - b.start > 1)
                .max_by_key(|(_, b)| b.pixels)
                .map(|(i, _)| i);
            let Some(index) = candidate else {
                break;
            };
            let (low, high) = self.split(boxes[index]);
            boxes[index] = low;
            boxes.push(high);
        }

        let entries = boxes
            .iter()
            .map(|b| {
                let mut sum = [0u64; 3];
                for &id in &self.order[b.start..b.end] {
                    let count = u64::from(self.counts[id as usize]);
                    let color = self.colors[id as usize];
                    for c in 0..3 {
                        sum[c] += u64::from(color[c]) * count;
                    }
                }
                let mean = |c: usize| ((sum[c] + b.pixels / 2) / b.pixels) as u8;
                ColorEntry::rgb(mean(0), mean(1), mean(2))
            })
            .collect();
        ColorTable::new(entries)
    }

    /// Split along the widest channel at the pixel-weighted median.
    fn split(&mut self, b: ColorBox) -> (ColorBox, ColorBox) {
        let ids = &mut self.order[b.start..b.end];
        let mut min = [255u8; 3];
        let mut max = [0u8; 3];
        for &id in ids.iter() {
            let color = self.colors[id as usize];
            for c in 0..3 {
                min[c] = min[c].min(color[c]);
                max[c] = max[c].max(color[c]);
            }
        }
        let channel = (0..3).max_by_key(|&c| (max[c] - min[c], 2 - c)).unwrap_or(0);
        let colors = &self.colors;
        ids.sort_unstable_by_key(|&id| colors[id as usize][channel]);

        let half = b.pixels / 2;
        let mut acc = 0u64;
        let mut cut = 1;
        for (i, &id) in ids.iter().enumerate() {
            acc += u64::from(self.counts[id as usize]);
            if acc >= half {
                cut = i + 1;
                break;
            }
        }
        let cut = cut.clamp(1, ids.len() - 1);
        let low_pixels: u64 = ids[..cut]
            .iter()
            .map(|&id| u64::from(self.counts[id as usize]))
            .sum();
        (
            ColorBox {
                start: b.start,
                end: b.start + cut,
                pixels: low_pixels,
            },
            ColorBox {
                start: b.start + cut,
                end: b.end,
                pixels: b.pixels - low_pixels,
            },
        )
    }

    /// Floyd-Steinberg error diffusion. Nearest lookups are cached on a
    /// 5-bit-per-channel grid evaluated at each cell centre.
    fn dither(&mut self, red: &[u8], green: &[u8], blue: &[u8], table: &ColorTable, out: &mut [u8]) {
        self.cells.fill(-1);
        self.errors.fill(0);
        let row_len = (self.width + 2) * 3;
        let entries = table.entries();
        for y in 0..self.height {
            let (current, next) = if y % 2 == 0 {
                let (a, b) = self.errors.split_at_mut(row_len);
                (a, b)
            } else {
                let (a, b) = self.errors.split_at_mut(row_len);
                (b, a)
            };
            next.fill(0);
            for x in 0..self.width {
                let i = y * self.width + x;
                let e = (x + 1) * 3;
                let value = [
                    (i32::from(red[i]) + current[e] / 16).clamp(0, 255),
                    (i32::from(green[i]) + current[e + 1] / 16).clamp(0, 255),
                    (i32::from(blue[i]) + current[e + 2] / 16).clamp(0, 255),
                ];
                let cell = ((value[0] >> 3) << 10 | (value[1] >> 3) << 5 | (value[2] >> 3)) as usize;
                let index = match self.cells[cell] {
                    -1 => {
                        let centre = |v: i32| ((v & !7) | 4) as u8;
                        let found =
                            table.find_best_entry(centre(value[0]), centre(value[1]), centre(value[2]), 255, false);
                        self.cells[cell] = i16::from(found);
                        found
                    }
                    cached => cached as u8,
                };
                out[i] = index;

                let chosen = entries[index as usize];
                let diff = [
                    value[0] - i32::from(chosen.c1),
                    value[1] - i32::from(chosen.c2),
                    value[2] - i32::from(chosen.c3),
                ];
                for c in 0..3 {
                    current[e + 3 + c] += diff[c] * 7;
                    next[e - 3 + c] += diff[c] * 3;
                    next[e + c] += diff[c] * 5;
                    next[e + 3 + c] += diff[c];
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        let mut r = Vec::new();
        let mut g = Vec::new();
        let mut b = Vec::new();
        for y in 0..height {
            for x in 0..width {
                r.push((x * 255 / (width - 1)) as u8);
                g.push((y * 255 / (height - 1)) as u8);
                b.push(((x + y) % 7 * 30) as u8);
            }
        }
        (r, g, b)
    }

    #[test]
    fn few_colors_are_kept_exactly() -> Result<()> {
        let mut arena = QuantizeArena::new(4, 1)?;
        let mut out = [0u8; 4];
        let table = arena.quantize(&[9, 1, 9, 2], &[9, 1, 9, 2], &[9, 1, 9, 2], false, &mut out)?;
        assert_eq!(table.len(), 3);
        assert_eq!(table.get(0), Some(&ColorEntry::rgb(9, 9, 9)));
        assert_eq!(out, [0, 1, 0, 2]);
        Ok(())
    }

    #[test]
    fn many_colors_reduce_to_a_full_palette() -> Result<()> {
        let (r, g, b) = gradient(64, 64);
        let mut arena = QuantizeArena::new(64, 64)?;
        let mut out = vec![0u8; 64 * 64];
        let table = arena.quantize(&r, &g, &b, false, &mut out)?;
        assert!(table.len() <= 256);
        assert!(table.len() > 200);
        let mut worst = 0;
        for i in 0..out.len() {
            let entry = table.get(out[i] as usize).expect("index within palette");
            let d = i32::from(entry.c1).abs_diff(i32::from(r[i]))
                + i32::from(entry.c2).abs_diff(i32::from(g[i]));
            worst = worst.max(d);
        }
        assert!(worst < 100, "worst channel error {worst}");
        Ok(())
    }

    #[test]
    fn dithering_stays_within_palette() -> Result<()> {
        let (r, g, b) = gradient(32, 32);
        let mut arena = QuantizeArena::new(32, 32)?;
        let mut out = vec![0u8; 32 * 32];
        let table = arena.quantize(&r, &g, &b, true, &mut out)?;
        assert!(out.iter().all(|&i| (i as usize) < table.len()));

        // the arena is reusable for the next tile
        let table = arena.quantize(&g, &r, &b, true, &mut out)?;
        assert!(out.iter().all(|&i| (i as usize) < table.len()));
        Ok(())
    }

    #[test]
    fn undersized_input_is_rejected() -> Result<()> {
        let mut arena = QuantizeArena::new(8, 8)?;
        let mut out = [0u8; 4];
        let err = arena
            .quantize(&[0; 4], &[0; 4], &[0; 4], false, &mut out)
            .unwrap_err();
        assert!(matches!(err, GpkgError::InvalidArgument(_)));
        Ok(())
    }
}
