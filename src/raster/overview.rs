//! Overview building: matching reduction factors to zoom levels, inserting
//! missing levels and resampling each level from the previous finer one.

use std::f64::consts::PI;
use std::ops::Range;

use tracing::{debug, warn};

use crate::error::{GpkgError, Result};
use crate::ogc_sql::{
    EXTENSION_ZOOM_OTHER, SQL_UPDATE_TILE_MATRIX_ZOOM, sql_delete_tiles_below,
    sql_update_tiles_zoom,
};
use crate::options::ResamplingMethod;
use crate::tiling::div_round_up;

use super::dataset::GpkgRaster;
use super::level::RasterLevel;
use super::register::{TileMatrix, plan_level, raster_extent, register_extension};

/// Overviews narrower than this in either axis are refused.
const MIN_OVERVIEW_SIZE: u32 = 8;

/// Reduction factor of an overview of `ov_x` x `ov_y` pixels, measured on
/// the larger axis.
pub(crate) fn compute_ov_factor(ov_x: u32, x: u32, ov_y: u32, y: u32) -> u32 {
    if x != 1 && x >= y / 2 {
        (0.5 + f64::from(x) / f64::from(ov_x.max(1))) as u32
    } else {
        (0.5 + f64::from(y) / f64::from(ov_y.max(1))) as u32
    }
}

/// The factor an overview built with `level` actually ends up with once its
/// size is rounded.
pub(crate) fn ov_level_adjust(level: u32, x: u32, y: u32) -> u32 {
    if x >= y / 2 && !(x < y && x < level) {
        let ov_x = x.div_ceil(level);
        (0.5 + f64::from(x) / f64::from(ov_x)) as u32
    } else {
        let ov_y = y.div_ceil(level);
        (0.5 + f64::from(y) / f64::from(ov_y)) as u32
    }
}

pub(crate) fn floor_power_of_two(n: u32) -> u32 {
    if n == 0 { 1 } else { 1 << (31 - n.leading_zeros()) }
}

/// Factor of `level` relative to a full resolution raster of `width` x
/// `height`; large factors close to a power of two are snapped to it.
fn level_factor(level: &RasterLevel<'_>, width: u32, height: u32) -> u32 {
    let (ov_x, ov_y) = level.raster_size();
    let factor = compute_ov_factor(ov_x, width, ov_y, height);
    let power = floor_power_of_two(factor);
    if factor > 64 && factor.abs_diff(power) <= 2 {
        power
    } else {
        factor
    }
}

#[derive(Debug, PartialEq, Eq)]
enum OverviewMatch {
    Found(usize),
    /// Not found: the index a new level would be inserted at and the factor
    /// of the coarsest existing overview.
    Missing { insert_at: usize, max_factor: u32 },
}

impl<'a> GpkgRaster<'a> {
    fn find_overview(&self, factor: u32) -> OverviewMatch {
        let (width, height) = self.raster_size();
        let adjusted = ov_level_adjust(factor, width, height);
        let mut insert_at = None;
        let mut max_factor = 0;
        for (index, overview) in self.overviews.iter().enumerate() {
            let ov_factor = level_factor(overview, width, height);
            max_factor = ov_factor;
            if ov_factor == factor || ov_factor == adjusted {
                return OverviewMatch::Found(index);
            }
            if insert_at.is_none() && ov_factor > factor {
                insert_at = Some(index);
            }
        }
        OverviewMatch::Missing {
            insert_at: insert_at.unwrap_or(self.overviews.len()),
            max_factor,
        }
    }

    /// Add a zoom level for `factor` between the overviews `insert_at - 1` and
    /// `insert_at`. The finer levels are renumbered one zoom level up.
    fn insert_overview(&mut self, factor: u32, insert_at: usize, max_factor: u32) -> Result<()> {
        let (width, height) = self.raster_size();
        let (ov_width, ov_height) = (width / factor, height / factor);
        if ov_width < MIN_OVERVIEW_SIZE || ov_height < MIN_OVERVIEW_SIZE {
            return Err(GpkgError::Overview(format!(
                "Too big overview factor : {factor}. Would result in a {ov_width}x{ov_height} overview"
            )));
        }
        let geo_transform = self.geo_transform.ok_or(GpkgError::GeoreferencingNotSet)?;
        let conn = self.conn();
        let table_name = self.table_name().to_string();

        let next_power = insert_at == self.overviews.len() && factor == 2 * max_factor;
        if !next_power && !self.zoom_other {
            warn!("Use of overview factor {factor} causes gpkg_zoom_other extension to be needed");
            register_extension(conn, &table_name, None, EXTENSION_ZOOM_OTHER)?;
            self.zoom_other = true;
        }

        // finest first, so that each level moves to a vacated zoom level
        let mut finer = Vec::with_capacity(insert_at + 1);
        finer.push(self.primary.zoom_level());
        finer.extend(self.overviews[..insert_at].iter().map(|ov| ov.zoom_level()));
        let new_zoom = finer[finer.len() - 1];

        let (tile_width, tile_height) = self.block_size();
        let mut matrix = TileMatrix {
            zoom_level: new_zoom,
            pixel_x_size: geo_transform[1] * f64::from(factor),
            pixel_y_size: geo_transform[5].abs() * f64::from(factor),
            tile_width,
            tile_height,
            matrix_width: 1,
            matrix_height: 1,
        };
        let extent = raster_extent(&geo_transform, width, height);
        let mut plan = plan_level(&extent, self.tms_min_x, self.tms_max_y, matrix);
        let shift = plan.geometry.shift;
        matrix.matrix_width = (shift.x_tiles
            + div_round_up(shift.x_pixels_mod + plan.geometry.raster_width, tile_width) as i32)
            .max(1);
        matrix.matrix_height = (shift.y_tiles
            + div_round_up(shift.y_pixels_mod + plan.geometry.raster_height, tile_height) as i32)
            .max(1);
        plan.geometry.matrix_width = matrix.matrix_width;
        plan.geometry.matrix_height = matrix.matrix_height;

        let tx = conn.unchecked_transaction()?;
        for &zoom in &finer {
            tx.execute(
                SQL_UPDATE_TILE_MATRIX_ZOOM,
                rusqlite::params![zoom + 1, table_name, zoom],
            )?;
            tx.execute(&sql_update_tiles_zoom(&table_name), [zoom + 1, zoom])?;
        }
        matrix.insert(&tx, &table_name)?;
        tx.commit()?;

        let primary_zoom = self.primary.zoom_level() + 1;
        self.primary.set_zoom_level(primary_zoom);
        for overview in &mut self.overviews[..insert_at] {
            let zoom = overview.zoom_level() + 1;
            overview.set_zoom_level(zoom);
        }
        self.primary.palette.borrow_mut().probe_zoom = primary_zoom;

        let level = self.new_overview(new_zoom, plan.geometry, self.level_settings())?;
        self.overviews.insert(insert_at, level);
        debug!(
            table = %table_name,
            factor,
            zoom_level = new_zoom,
            "inserted overview level"
        );
        Ok(())
    }

    fn level_pair(&mut self, source: Option<usize>, target: usize) -> (&mut RasterLevel<'a>, &mut RasterLevel<'a>) {
        match source {
            None => (&mut self.primary, &mut self.overviews[target]),
            Some(source) => {
                let (finer, coarser) = self.overviews.split_at_mut(target);
                (&mut finer[source], &mut coarser[0])
            }
        }
    }

    /// Compute the overviews of the given reduction factors, creating the
    /// missing zoom levels. An empty `factors` deletes every overview tile.
    ///
    /// `progress` receives the fraction done and stops the build with
    /// [`GpkgError::Cancelled`] when it returns `false`.
    pub fn build_overviews<F>(&mut self, resampling: ResamplingMethod, factors: &[u32], mut progress: F) -> Result<()>
    where
        F: FnMut(f64) -> bool,
    {
        if !self.update {
            return Err(GpkgError::Overview(
                "Overview building not supported on a database opened in read-only mode"
                    .to_string(),
            ));
        }

        if factors.is_empty() {
            for overview in &mut self.overviews {
                overview.flush_level()?;
            }
            let deleted = self.conn().execute(
                &sql_delete_tiles_below(self.table_name()),
                [self.primary.zoom_level()],
            )?;
            for overview in &mut self.overviews {
                overview.discard_cache();
            }
            debug!(table = self.table_name(), deleted, "deleted overview tiles");
            return Ok(());
        }

        if self.overviews.is_empty() {
            return Err(GpkgError::Overview(
                "Image too small to support overviews".to_string(),
            ));
        }

        self.flush()?;
        for &factor in factors {
            if factor < 2 {
                return Err(GpkgError::Overview(
                    "Overview factor must be >= 2".to_string(),
                ));
            }
            if let OverviewMatch::Missing {
                insert_at,
                max_factor,
            } = self.find_overview(factor)
            {
                self.insert_overview(factor, insert_at, max_factor)?;
            }
        }

        let mut targets = Vec::with_capacity(factors.len());
        for &factor in factors {
            match self.find_overview(factor) {
                OverviewMatch::Found(index) => targets.push(index),
                OverviewMatch::Missing { .. } => {
                    return Err(GpkgError::Overview(format!(
                        "no overview level matches factor {factor}"
                    )));
                }
            }
        }
        targets.sort_unstable();
        targets.dedup();

        let total: u64 = targets
            .iter()
            .map(|&index| u64::from(self.overviews[index].raster_size().1))
            .sum();
        let mut done = 0u64;
        let mut on_rows = |rows: u32| {
            done += u64::from(rows);
            progress(done as f64 / total.max(1) as f64)
        };

        let mut source = None;
        for &target in &targets {
            let (src, dst) = self.level_pair(source, target);
            debug!(
                from = src.zoom_level(),
                to = dst.zoom_level(),
                ?resampling,
                "computing overview"
            );
            // keep what was computed before a cancellation
            let result = regenerate(src, dst, resampling, &mut on_rows);
            let flushed = dst.flush_level();
            result?;
            flushed?;
            source = Some(target);
        }
        self.flush()
    }
}

/// Resample `source` into `target`, one row of target blocks at a time.
fn regenerate(
    source: &mut RasterLevel<'_>,
    target: &mut RasterLevel<'_>,
    method: ResamplingMethod,
    on_rows: &mut dyn FnMut(u32) -> bool,
) -> Result<()> {
    let (src_width, src_height) = source.raster_size();
    let (dst_width, dst_height) = target.raster_size();
    let bands = target.band_count();
    let (_, chunk) = target.block_size();
    let resampler = Resampler::new(method, (src_width, src_height), (dst_width, dst_height));

    let mut src = Vec::new();
    let mut out = Vec::new();
    let mut y = 0;
    while y < dst_height {
        let rows = chunk.min(dst_height - y);
        let src_rows = resampler.source_rows(y..y + rows);
        let src_plane = src_width as usize * src_rows.len();
        src.resize(bands * src_plane, 0);
        source.read_region(0, src_rows.start, src_width, src_rows.len() as u32, &mut src)?;

        let dst_plane = dst_width as usize * rows as usize;
        out.resize(bands * dst_plane, 0);
        for band in 0..bands {
            resampler.resample(
                &src[band * src_plane..(band + 1) * src_plane],
                src_rows.start,
                y..y + rows,
                &mut out[band * dst_plane..(band + 1) * dst_plane],
            );
        }
        target.write_region(0, y, dst_width, rows, &out)?;

        y += rows;
        if !on_rows(rows) {
            return Err(GpkgError::Cancelled);
        }
    }
    Ok(())
}

/// Source pixels and weights contributing to one destination pixel.
type Taps = Vec<(usize, f32)>;

/// Separable resampling from a `src` sized raster to a `dst` sized one.
#[derive(Debug)]
pub(crate) struct Resampler {
    method: ResamplingMethod,
    src_width: usize,
    x_taps: Vec<Taps>,
    y_taps: Vec<Taps>,
}

impl Resampler {
    pub(crate) fn new(method: ResamplingMethod, src: (u32, u32), dst: (u32, u32)) -> Self {
        Self {
            method,
            src_width: src.0 as usize,
            x_taps: axis_taps(method, src.0, dst.0),
            y_taps: axis_taps(method, src.1, dst.1),
        }
    }

    /// Source rows read to compute destination rows `rows`.
    pub(crate) fn source_rows(&self, rows: Range<u32>) -> Range<u32> {
        let mut first = usize::MAX;
        let mut last = 0;
        for taps in &self.y_taps[rows.start as usize..rows.end as usize] {
            for &(index, _) in taps {
                first = first.min(index);
                last = last.max(index);
            }
        }
        if first > last {
            return 0..0;
        }
        first as u32..last as u32 + 1
    }

    /// Compute destination rows `rows` of one band. `src` holds the source
    /// rows from `src_first_row` on.
    pub(crate) fn resample(&self, src: &[u8], src_first_row: u32, rows: Range<u32>, out: &mut [u8]) {
        let dst_width = self.x_taps.len();
        let src_first_row = src_first_row as usize;
        if self.method == ResamplingMethod::Mode {
            for (out_row, dy) in rows.enumerate() {
                for dx in 0..dst_width {
                    out[out_row * dst_width + dx] =
                        self.mode(src, src_first_row, &self.y_taps[dy as usize], &self.x_taps[dx]);
                }
            }
            return;
        }

        let squared = self.method == ResamplingMethod::Rms;
        let src_rows = src.len() / self.src_width.max(1);
        let mut horizontal = vec![0f32; src_rows * dst_width];
        for row in 0..src_rows {
            let line = &src[row * self.src_width..(row + 1) * self.src_width];
            for (dx, taps) in self.x_taps.iter().enumerate() {
                let mut acc = 0.0;
                for &(sx, weight) in taps {
                    let v = f32::from(line[sx]);
                    acc += weight * if squared { v * v } else { v };
                }
                horizontal[row * dst_width + dx] = acc;
            }
        }

        for (out_row, dy) in rows.enumerate() {
            let taps = &self.y_taps[dy as usize];
            for dx in 0..dst_width {
                let mut acc = 0.0;
                for &(sy, weight) in taps {
                    acc += weight * horizontal[(sy - src_first_row) * dst_width + dx];
                }
                let value = if squared { acc.max(0.0).sqrt() } else { acc };
                out[out_row * dst_width + dx] = value.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    /// Most frequent value of the box, the smallest one on ties.
    fn mode(&self, src: &[u8], src_first_row: usize, y_taps: &Taps, x_taps: &Taps) -> u8 {
        let mut counts = [0u32; 256];
        for &(sy, _) in y_taps {
            let line = &src[(sy - src_first_row) * self.src_width..];
            for &(sx, _) in x_taps {
                counts[line[sx] as usize] += 1;
            }
        }
        let mut best = 0;
        for value in 1..256 {
            if counts[value] > counts[best] {
                best = value;
            }
        }
        best as u8
    }
}

fn axis_taps(method: ResamplingMethod, src_len: u32, dst_len: u32) -> Vec<Taps> {
    let ratio = f64::from(src_len) / f64::from(dst_len.max(1));
    let last = src_len.max(1) as usize - 1;
    (0..dst_len)
        .map(|d| {
            let d = f64::from(d);
            match method {
                ResamplingMethod::Nearest => {
                    vec![((((d + 0.5) * ratio) as usize).min(last), 1.0)]
                }
                ResamplingMethod::Average | ResamplingMethod::Rms | ResamplingMethod::Mode => {
                    let start = ((0.5 + d * ratio) as usize).min(last);
                    let end = ((0.5 + (d + 1.0) * ratio) as usize).clamp(start + 1, last + 1);
                    let weight = 1.0 / (end - start) as f32;
                    (start..end).map(|i| (i, weight)).collect()
                }
                _ => convolution_taps(method, d, ratio, last),
            }
        })
        .collect()
}

fn convolution_taps(method: ResamplingMethod, d: f64, ratio: f64, last: usize) -> Taps {
    let (radius, kernel): (f64, fn(f64) -> f64) = match method {
        ResamplingMethod::Bilinear => (1.0, bilinear),
        ResamplingMethod::Cubic => (2.0, cubic),
        ResamplingMethod::CubicSpline => (2.0, cubic_spline),
        _ => (3.0, lanczos),
    };
    // widen the kernel when downsampling so that every source pixel counts
    let scale = ratio.max(1.0);
    let center = (d + 0.5) * ratio - 0.5;
    let support = radius * scale;
    let first = (center - support).floor() as i64 + 1;
    let end = (center + support).floor() as i64;

    let mut taps = Vec::new();
    let mut total = 0.0;
    for i in first..=end {
        let weight = kernel((i as f64 - center) / scale);
        if weight == 0.0 {
            continue;
        }
        taps.push((i.clamp(0, last as i64) as usize, weight));
        total += weight;
    }
    if taps.is_empty() || total.abs() < 1e-12 {
        let nearest = (center.round().max(0.0) as usize).min(last);
        return vec![(nearest, 1.0)];
    }
    taps.into_iter()
        .map(|(i, weight)| (i, (weight / total) as f32))
        .collect()
}

fn bilinear(t: f64) -> f64 {
    (1.0 - t.abs()).max(0.0)
}

// Keys cubic, a = -0.5
fn cubic(t: f64) -> f64 {
    let a = -0.5;
    let t = t.abs();
    if t < 1.0 {
        (a + 2.0) * t * t * t - (a + 3.0) * t * t + 1.0
    } else if t < 2.0 {
        a * t * t * t - 5.0 * a * t * t + 8.0 * a * t - 4.0 * a
    } else {
        0.0
    }
}

// cubic B-spline
fn cubic_spline(t: f64) -> f64 {
    let t = t.abs();
    if t < 1.0 {
        (4.0 - 6.0 * t * t + 3.0 * t * t * t) / 6.0
    } else if t < 2.0 {
        (2.0 - t).powi(3) / 6.0
    } else {
        0.0
    }
}

fn lanczos(t: f64) -> f64 {
    if t == 0.0 {
        return 1.0;
    }
    if t.abs() >= 3.0 {
        return 0.0;
    }
    let x = PI * t;
    3.0 * x.sin() * (x / 3.0).sin() / (x * x)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(method: ResamplingMethod, src: &[u8], size: (u32, u32), dst: (u32, u32)) -> Vec<u8> {
        let resampler = Resampler::new(method, size, dst);
        let rows = resampler.source_rows(0..dst.1);
        let window = &src[(rows.start * size.0) as usize..(rows.end * size.0) as usize];
        let mut out = vec![0u8; (dst.0 * dst.1) as usize];
        resampler.resample(window, rows.start, 0..dst.1, &mut out);
        out
    }

    #[test]
    fn factors_follow_the_larger_axis() {
        assert_eq!(compute_ov_factor(500, 1000, 300, 600), 2);
        assert_eq!(compute_ov_factor(10, 10, 100, 1000), 10);
        assert_eq!(ov_level_adjust(3, 1000, 600), 3);
        assert_eq!(ov_level_adjust(2, 1001, 600), 2);
        assert_eq!(floor_power_of_two(100), 64);
        assert_eq!(floor_power_of_two(128), 128);
        assert_eq!(floor_power_of_two(0), 1);
    }

    #[test]
    fn average_and_nearest() {
        #[rustfmt::skip]
        let src = [
            0, 2, 10, 10,
            4, 6, 10, 10,
            1, 1, 200, 0,
            1, 1, 0, 0,
        ];
        assert_eq!(run(ResamplingMethod::Average, &src, (4, 4), (2, 2)), vec![3, 10, 1, 50]);
        assert_eq!(run(ResamplingMethod::Nearest, &src, (4, 4), (2, 2)), vec![6, 10, 1, 0]);
        assert_eq!(run(ResamplingMethod::Mode, &src, (4, 4), (2, 2)), vec![0, 10, 1, 0]);
    }

    #[test]
    fn rms_weights_bright_pixels() {
        assert_eq!(run(ResamplingMethod::Rms, &[0, 10], (2, 1), (1, 1)), vec![7]);
        assert_eq!(run(ResamplingMethod::Average, &[0, 10], (2, 1), (1, 1)), vec![5]);
    }

    #[test]
    fn kernels_preserve_flat_areas() {
        let src = vec![77u8; 64];
        for method in [
            ResamplingMethod::Bilinear,
            ResamplingMethod::Cubic,
            ResamplingMethod::CubicSpline,
            ResamplingMethod::Lanczos,
        ] {
            let out = run(method, &src, (8, 8), (3, 3));
            assert!(out.iter().all(|&v| v == 77), "{method:?}: {out:?}");
        }
    }

    #[test]
    fn chunked_rows_read_a_window_of_the_source() {
        let resampler = Resampler::new(ResamplingMethod::Bilinear, (16, 16), (8, 8));
        let rows = resampler.source_rows(4..8);
        assert!(rows.start >= 6 && rows.start <= 8, "{rows:?}");
        assert_eq!(rows.end, 16);

        // a vertical ramp keeps increasing once halved
        let src: Vec<u8> = (0..16u8).flat_map(|row| [row * 10; 16]).collect();
        let window = &src[rows.start as usize * 16..];
        let mut out = vec![0u8; 8 * 4];
        resampler.resample(window, rows.start, 4..8, &mut out);
        let column: Vec<u8> = out.chunks(8).map(|line| line[0]).collect();
        assert!(column.windows(2).all(|w| w[0] < w[1]), "{column:?}");
    }
}
