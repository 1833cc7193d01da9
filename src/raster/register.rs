//! Tile matrix metadata: `gpkg_contents`, `gpkg_tile_matrix_set`,
//! `gpkg_tile_matrix` and the tile table extensions.

use rusqlite::OptionalExtension;
use tracing::{debug, warn};

use crate::error::{GpkgError, Result};
use crate::ogc_sql::{
    EXTENSION_WEBP, EXTENSION_ZOOM_OTHER, SQL_EXTENSION_EXISTS, SQL_INSERT_EXTENSION, SQL_INSERT_TILE_MATRIX,
    SQL_INSERT_TILE_MATRIX_SET, SQL_INSERT_TILES_CONTENTS, SQL_SELECT_RASTER_CONTENTS,
    sql_create_tile_table, sql_max_tile_zoom, sql_select_tile_matrices, sql_tile_extent,
    sql_tile_level_exists, sql_tile_table_triggers,
};
use crate::options::{RasterOpenOptions, TileFormat};
use crate::tiling::{PixelShift, TilingScheme, custom_zoom_level, div_round_up};

use super::level::LevelGeometry;

/// One `gpkg_tile_matrix` row.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct TileMatrix {
    pub(crate) zoom_level: i32,
    pub(crate) pixel_x_size: f64,
    pub(crate) pixel_y_size: f64,
    pub(crate) tile_width: u32,
    pub(crate) tile_height: u32,
    pub(crate) matrix_width: i32,
    pub(crate) matrix_height: i32,
}

impl TileMatrix {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            zoom_level: row.get(0)?,
            pixel_x_size: row.get(1)?,
            pixel_y_size: row.get(2)?,
            tile_width: row.get(3)?,
            tile_height: row.get(4)?,
            matrix_width: row.get(5)?,
            matrix_height: row.get(6)?,
        })
    }

    pub(crate) fn insert(&self, conn: &rusqlite::Connection, table_name: &str) -> Result<()> {
        conn.execute(
            SQL_INSERT_TILE_MATRIX,
            rusqlite::params![
                table_name,
                self.zoom_level,
                self.matrix_width,
                self.matrix_height,
                self.tile_width,
                self.tile_height,
                self.pixel_x_size,
                self.pixel_y_size
            ],
        )?;
        Ok(())
    }
}

/// Bounding box as `[min_x, min_y, max_x, max_y]`.
pub(crate) type Extent = [f64; 4];

pub(crate) fn raster_extent(geo_transform: &[f64; 6], width: u32, height: u32) -> Extent {
    [
        geo_transform[0],
        geo_transform[3] + f64::from(height) * geo_transform[5],
        geo_transform[0] + f64::from(width) * geo_transform[1],
        geo_transform[3],
    ]
}

/// A level ready to be instantiated: its matrix row, where its raster sits in
/// the matrix and its geotransform.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct LevelPlan {
    pub(crate) matrix: TileMatrix,
    pub(crate) geometry: LevelGeometry,
    pub(crate) geo_transform: [f64; 6],
}

/// Size and position of the part of `extent` covered by `matrix`.
pub(crate) fn plan_level(extent: &Extent, tms_min_x: f64, tms_max_y: f64, matrix: TileMatrix) -> LevelPlan {
    let width = (0.5 + (extent[2] - extent[0]) / matrix.pixel_x_size) as i64;
    let height = (0.5 + (extent[3] - extent[1]) / matrix.pixel_y_size) as i64;
    let geo_transform = [
        extent[0],
        matrix.pixel_x_size,
        0.0,
        extent[3],
        0.0,
        -matrix.pixel_y_size,
    ];
    let shift = PixelShift::compute(
        &geo_transform,
        tms_min_x,
        tms_max_y,
        matrix.tile_width,
        matrix.tile_height,
    );
    LevelPlan {
        matrix,
        geometry: LevelGeometry {
            raster_width: width.clamp(1, i64::from(u32::MAX)) as u32,
            raster_height: height.clamp(1, i64::from(u32::MAX)) as u32,
            tile_width: matrix.tile_width,
            tile_height: matrix.tile_height,
            matrix_width: matrix.matrix_width,
            matrix_height: matrix.matrix_height,
            shift,
        },
        geo_transform,
    }
}

/// Tile matrix set and levels of a raster that is being georeferenced.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Layout {
    pub(crate) zoom_level: i32,
    pub(crate) tms_min_x: f64,
    pub(crate) tms_min_y: f64,
    pub(crate) tms_max_x: f64,
    pub(crate) tms_max_y: f64,
    /// Finest first: the full resolution level, then the overviews.
    pub(crate) matrices: Vec<TileMatrix>,
}

/// Lay out the tile matrices of a raster of `width` x `height` pixels with
/// the given geotransform. A custom matrix set starts at the raster origin
/// and stops at the level that fits in one tile; a tiling scheme imposes its
/// origin and resolutions.
pub(crate) fn plan_layout(
    geo_transform: &[f64; 6],
    width: u32,
    height: u32,
    tile_width: u32,
    tile_height: u32,
    scheme: Option<&TilingScheme>,
) -> Result<Layout> {
    let (zoom, tms_min_x, tms_max_y, pixel_x0, pixel_y0, count_x0, count_y0) = match scheme {
        Some(scheme) => {
            let zoom = scheme.zoom_level_for_pixel_size(geo_transform[1])?;
            (
                zoom,
                scheme.min_x,
                scheme.max_y,
                scheme.pixel_x_size_zoom0,
                scheme.pixel_y_size_zoom0,
                scheme.tile_matrix_width_zoom0,
                scheme.tile_matrix_height_zoom0,
            )
        }
        None => {
            let zoom = custom_zoom_level(width, height, tile_width, tile_height);
            let scale = f64::from(1u32 << zoom);
            (
                zoom,
                geo_transform[0],
                geo_transform[3],
                geo_transform[1] * scale,
                geo_transform[5].abs() * scale,
                div_round_up(width >> zoom, tile_width).max(1),
                div_round_up(height >> zoom, tile_height).max(1),
            )
        }
    };

    let mut matrices = Vec::with_capacity(zoom as usize + 1);
    for level in (0..=zoom).rev() {
        let (pixel_x_size, pixel_y_size, matrix_width, matrix_height) = match scheme {
            Some(_) => (
                pixel_x0 / f64::from(1u32 << level),
                pixel_y0 / f64::from(1u32 << level),
                count_x0 << level,
                count_y0 << level,
            ),
            None => {
                let reduction = zoom - level;
                let scale = f64::from(1u32 << reduction);
                (
                    geo_transform[1] * scale,
                    geo_transform[5].abs() * scale,
                    div_round_up(width >> reduction, tile_width).max(1),
                    div_round_up(height >> reduction, tile_height).max(1),
                )
            }
        };
        matrices.push(TileMatrix {
            zoom_level: level as i32,
            pixel_x_size,
            pixel_y_size,
            tile_width,
            tile_height,
            matrix_width: matrix_width as i32,
            matrix_height: matrix_height as i32,
        });
    }

    Ok(Layout {
        zoom_level: zoom as i32,
        tms_min_x,
        tms_min_y: tms_max_y - f64::from(count_y0) * f64::from(tile_height) * pixel_y0,
        tms_max_x: tms_min_x + f64::from(count_x0) * f64::from(tile_width) * pixel_x0,
        tms_max_y,
        matrices,
    })
}

/// Contents row of a tile table being registered.
#[derive(Debug)]
pub(crate) struct ContentsRow<'r> {
    pub(crate) table_name: &'r str,
    pub(crate) identifier: &'r str,
    pub(crate) description: &'r str,
    pub(crate) srs_id: i32,
    pub(crate) extent: Extent,
}

/// Insert the contents, matrix set and matrix rows of a raster at once.
pub(crate) fn write_layout(conn: &rusqlite::Connection, contents: &ContentsRow<'_>, layout: &Layout) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        SQL_INSERT_TILES_CONTENTS,
        rusqlite::params![
            contents.table_name,
            contents.identifier,
            contents.description,
            contents.extent[0],
            contents.extent[1],
            contents.extent[2],
            contents.extent[3],
            contents.srs_id
        ],
    )?;
    tx.execute(
        SQL_INSERT_TILE_MATRIX_SET,
        rusqlite::params![
            contents.table_name,
            contents.srs_id,
            layout.tms_min_x,
            layout.tms_min_y,
            layout.tms_max_x,
            layout.tms_max_y
        ],
    )?;
    for matrix in layout.matrices.iter().rev() {
        matrix.insert(&tx, contents.table_name)?;
    }
    tx.commit()?;
    debug!(
        table = contents.table_name,
        zoom_level = layout.zoom_level,
        levels = layout.matrices.len(),
        "registered tile matrices"
    );
    Ok(())
}

pub(crate) fn create_tile_table(conn: &rusqlite::Connection, table_name: &str) -> Result<()> {
    conn.execute_batch(&sql_create_tile_table(table_name))?;
    conn.execute_batch(&sql_tile_table_triggers(table_name))?;
    Ok(())
}

pub(crate) fn has_extension(conn: &rusqlite::Connection, table_name: &str, extension_name: &str) -> Result<bool> {
    let exists: i64 = conn.query_row(
        SQL_EXTENSION_EXISTS,
        rusqlite::params![table_name, extension_name],
        |row| row.get(0),
    )?;
    Ok(exists != 0)
}

/// Declare `extension` for `table_name` unless it already is.
pub(crate) fn register_extension(
    conn: &rusqlite::Connection,
    table_name: &str,
    column_name: Option<&str>,
    extension: (&str, &str),
) -> Result<()> {
    let (name, definition) = extension;
    if has_extension(conn, table_name, name)? {
        return Ok(());
    }
    conn.execute(
        SQL_INSERT_EXTENSION,
        rusqlite::params![table_name, column_name, name, definition],
    )?;
    debug!(table = table_name, extension = name, "registered extension");
    Ok(())
}

/// What `open_raster` found in the metadata tables.
#[derive(Debug)]
pub(crate) struct StoredRaster {
    pub(crate) table_name: String,
    pub(crate) identifier: String,
    pub(crate) description: String,
    pub(crate) srs_id: i32,
    pub(crate) tms_min_x: f64,
    pub(crate) tms_max_y: f64,
    /// Full resolution level first.
    pub(crate) levels: Vec<LevelPlan>,
    pub(crate) tile_format: Option<TileFormat>,
    pub(crate) zoom_other: bool,
}

struct ContentsQuery {
    table_name: String,
    identifier: Option<String>,
    description: Option<String>,
    srs_id: Option<i32>,
    extent: [Option<f64>; 4],
    tms: Extent,
}

fn select_contents(conn: &rusqlite::Connection, table_name: &str) -> Result<ContentsQuery> {
    conn.query_row(SQL_SELECT_RASTER_CONTENTS, [table_name], |row| {
        Ok(ContentsQuery {
            table_name: row.get(0)?,
            identifier: row.get(1)?,
            description: row.get(2)?,
            srs_id: row.get(3)?,
            extent: [row.get(4)?, row.get(5)?, row.get(6)?, row.get(7)?],
            tms: [row.get(8)?, row.get(9)?, row.get(10)?, row.get(11)?],
        })
    })
    .optional()?
    .ok_or_else(|| GpkgError::TableNotFound {
        table_name: table_name.to_string(),
    })
}

/// Extra condition on the tile matrices considered when opening.
fn zoom_filter(table_name: &str, zoom_level: Option<i32>, update: bool) -> String {
    let exists = sql_tile_level_exists(table_name);
    match (zoom_level, update) {
        (Some(zoom), true) => format!(" AND zoom_level <= {zoom}"),
        (Some(zoom), false) => {
            format!(" AND (zoom_level = {zoom} OR (zoom_level < {zoom} AND {exists}))")
        }
        (None, true) => format!(" AND zoom_level <= ({})", sql_max_tile_zoom(table_name)),
        (None, false) => format!(" AND {exists}"),
    }
}

fn select_matrices(conn: &rusqlite::Connection, table_name: &str, extra: &str) -> Result<Vec<TileMatrix>> {
    let mut stmt = conn.prepare(&sql_select_tile_matrices(extra))?;
    let matrices = stmt
        .query_map([table_name], TileMatrix::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(matrices)
}

/// Read the registration of `table_name` and lay out its levels.
pub(crate) fn load_raster(
    conn: &rusqlite::Connection,
    table_name: &str,
    options: &RasterOpenOptions,
    update: bool,
) -> Result<StoredRaster> {
    let contents = select_contents(conn, table_name)?;
    let table_name = contents.table_name.as_str();
    let [tms_min_x, tms_min_y, tms_max_x, tms_max_y] = contents.tms;
    if !(tms_min_x < tms_max_x && tms_min_y < tms_max_y) {
        return Err(GpkgError::InvalidArgument(format!(
            "invalid tile matrix set extent for {table_name}"
        )));
    }

    let extra = zoom_filter(table_name, options.zoom_level, update);
    let mut matrices = select_matrices(conn, table_name, &extra)?;
    let contents_extent = match contents.extent {
        [Some(min_x), Some(min_y), Some(max_x), Some(max_y)] => Some([min_x, min_y, max_x, max_y]),
        _ => None,
    };
    if matrices.is_empty() && contents_extent.is_some() {
        // no tile written yet: fall back to the registered matrices
        matrices = select_matrices(conn, table_name, "")?;
        if !update {
            matrices.truncate(1);
        }
    }
    let Some(primary) = matrices.first().copied() else {
        return Err(GpkgError::InvalidArgument(format!(
            "no usable tile matrix for {table_name}"
        )));
    };

    let mut extent = contents_extent.unwrap_or(contents.tms);
    if options.use_tile_extent {
        let tiles: [Option<i32>; 4] = conn.query_row(
            &sql_tile_extent(table_name),
            [primary.zoom_level],
            |row| Ok([row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?]),
        )?;
        let [Some(min_col), Some(min_row), Some(max_col), Some(max_row)] = tiles else {
            return Err(GpkgError::InvalidArgument(format!(
                "no tile found at zoom level {} of {table_name}",
                primary.zoom_level
            )));
        };
        let tile_x = primary.pixel_x_size * f64::from(primary.tile_width);
        let tile_y = primary.pixel_y_size * f64::from(primary.tile_height);
        extent = [
            tms_min_x + tile_x * f64::from(min_col),
            tms_max_y - tile_y * f64::from(1 + max_row),
            tms_min_x + tile_x * f64::from(1 + max_col),
            tms_max_y - tile_y * f64::from(min_row),
        ];
    }
    for (value, bound) in [options.min_x, options.min_y, options.max_x, options.max_y]
        .into_iter()
        .zip(extent.iter_mut())
    {
        if let Some(value) = value {
            *bound = value;
        }
    }
    if !(extent[0] < extent[2] && extent[1] < extent[3]) {
        return Err(GpkgError::InvalidArgument(format!(
            "invalid raster extent for {table_name}"
        )));
    }

    let mut levels = Vec::with_capacity(matrices.len());
    for matrix in matrices {
        let plan = plan_level(&extent, tms_min_x, tms_max_y, matrix);
        let smaller_than_tile = plan.geometry.raster_width < matrix.tile_width
            && plan.geometry.raster_height < matrix.tile_height;
        levels.push(plan);
        if levels.len() > 1 && smaller_than_tile {
            break;
        }
    }

    let mut tile_format = None;
    if has_extension(conn, table_name, EXTENSION_WEBP.0)? {
        tile_format = Some(TileFormat::Webp);
    }
    if let Some(requested) = options.tile_format {
        if !update {
            warn!("TILE_FORMAT open option ignored in read-only mode");
        } else {
            if requested == TileFormat::Webp && tile_format != Some(TileFormat::Webp) {
                register_extension(conn, table_name, Some("tile_data"), EXTENSION_WEBP)?;
            }
            tile_format = Some(requested);
        }
    }
    let zoom_other = has_extension(conn, table_name, EXTENSION_ZOOM_OTHER.0)?;

    debug!(
        table = table_name,
        zoom_level = primary.zoom_level,
        overviews = levels.len() - 1,
        "opened tile table"
    );
    Ok(StoredRaster {
        table_name: contents.table_name.clone(),
        identifier: contents.identifier.unwrap_or_default(),
        description: contents.description.unwrap_or_default(),
        srs_id: contents.srs_id.unwrap_or(-1),
        tms_min_x,
        tms_max_y,
        levels,
        tile_format,
        zoom_other,
    })
}
