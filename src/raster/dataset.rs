use std::rc::Rc;

use tracing::{debug, error, warn};

use crate::color_table::ColorTable;
use crate::error::{GpkgError, Result};
use crate::ogc_sql::{
    EXTENSION_WEBP, SQL_TABLE_EXISTS, SQL_UPDATE_CONTENTS_LAST_CHANGE, SQL_UPDATE_CONTENTS_SRS,
    SQL_UPDATE_TILE_MATRIX_SET_SRS, ensure_builtin_srs,
};
use crate::options::{CodecOptions, RasterCreateOptions, RasterOpenOptions, TileFormat};
use crate::tiling::{PixelShift, TilingScheme};

use super::batch::{DatasetRole, TileBatch};
use super::cache::TilePos;
use super::level::{LevelGeometry, LevelSettings, PaletteState, RasterLevel, SharedPalette};
use super::register::{
    ContentsRow, create_tile_table, load_raster, plan_layout, plan_level, raster_extent,
    register_extension, write_layout,
};
use super::state::FlushGate;
use super::store::{IoCounters, TileIoStats, TileStore};

/// Meaning of a band, derived from the band count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColorInterpretation {
    Gray,
    Palette,
    Red,
    Green,
    Blue,
    Alpha,
}

/// A tiled raster stored in a GeoPackage tile table, with one overview per
/// coarser zoom level of its tile matrix set.
///
/// Tiles are written lazily: a tile is encoded once every band of the blocks
/// covering it has been written, and whatever remains is written by
/// [`GpkgRaster::flush`], [`GpkgRaster::close`] or when the raster is
/// dropped.
#[derive(Debug)]
pub struct GpkgRaster<'a> {
    conn: &'a rusqlite::Connection,
    table_name: String,
    identifier: String,
    description: String,
    pub(crate) primary: RasterLevel<'a>,
    pub(crate) overviews: Vec<RasterLevel<'a>>,
    batch: Rc<TileBatch>,
    gate: Rc<FlushGate>,
    counters: Rc<IoCounters>,
    pub(crate) geo_transform: Option<[f64; 6]>,
    srs_id: i32,
    tiling_scheme: Option<&'static TilingScheme>,
    pub(crate) tms_min_x: f64,
    pub(crate) tms_max_y: f64,
    pub(crate) zoom_other: bool,
    is_new: bool,
    pub(crate) update: bool,
    closed: bool,
}

impl<'a> GpkgRaster<'a> {
    /// Create the tile table of a new raster. The raster is registered in the
    /// metadata tables once its geotransform is set.
    pub(crate) fn create(
        conn: &'a rusqlite::Connection,
        table_name: &str,
        width: u32,
        height: u32,
        bands: usize,
        options: &RasterCreateOptions,
    ) -> Result<Self> {
        if !(1..=4).contains(&bands) {
            return Err(GpkgError::InvalidArgument(format!(
                "band count must be between 1 and 4, got {bands}"
            )));
        }
        if width == 0 || height == 0 {
            return Err(GpkgError::InvalidArgument(format!(
                "invalid raster size {width}x{height}"
            )));
        }
        options.validate()?;
        let exists: i64 = conn.query_row(SQL_TABLE_EXISTS, [table_name], |row| row.get(0))?;
        if exists != 0 {
            return Err(GpkgError::TableAlreadyExists {
                table_name: table_name.to_string(),
            });
        }

        create_tile_table(conn, table_name)?;
        if options.codec.tile_format == TileFormat::Webp {
            register_extension(conn, table_name, Some("tile_data"), EXTENSION_WEBP)?;
        }

        let counters = Rc::new(IoCounters::default());
        let batch = Rc::new(TileBatch::default());
        // no tile matrix until the raster is georeferenced
        let geometry = LevelGeometry {
            raster_width: width,
            raster_height: height,
            tile_width: options.block_width,
            tile_height: options.block_height,
            matrix_width: 0,
            matrix_height: 0,
            shift: PixelShift::default(),
        };
        let settings = LevelSettings {
            bands,
            codec: options.codec,
            update: true,
            georeferenced: false,
        };
        let palette = PaletteState::shared(0, TilePos::new(0, 0));
        let primary = RasterLevel::new(
            TileStore::new(conn, table_name, 0, Rc::clone(&counters)),
            geometry,
            settings,
            DatasetRole::Primary(Rc::clone(&batch)),
            palette,
        )?;

        let mut raster = Self {
            conn,
            table_name: table_name.to_string(),
            identifier: options
                .identifier
                .clone()
                .unwrap_or_else(|| table_name.to_string()),
            description: options.description.clone().unwrap_or_default(),
            primary,
            overviews: Vec::new(),
            batch,
            gate: Rc::new(FlushGate::default()),
            counters,
            geo_transform: None,
            srs_id: -1,
            tiling_scheme: options.tiling_scheme,
            tms_min_x: 0.0,
            tms_max_y: 0.0,
            zoom_other: false,
            is_new: true,
            update: true,
            closed: false,
        };
        if let Some(scheme) = options.tiling_scheme {
            raster.set_srs_id(scheme.epsg_code)?;
        }
        debug!(
            table = table_name,
            width,
            height,
            bands,
            tile_format = %options.codec.tile_format,
            "created tile table"
        );
        Ok(raster)
    }

    pub(crate) fn open(
        conn: &'a rusqlite::Connection,
        table_name: &str,
        options: &RasterOpenOptions,
        update: bool,
    ) -> Result<Self> {
        let stored = load_raster(conn, table_name, options, update)?;
        let bands = if (1..=4).contains(&options.band_count) {
            options.band_count
        } else {
            4
        };
        let settings = LevelSettings {
            bands,
            codec: CodecOptions {
                tile_format: stored.tile_format.unwrap_or_default(),
                quality: options.quality,
                zlevel: options.zlevel,
                dither: options.dither,
            },
            update,
            georeferenced: true,
        };

        let counters = Rc::new(IoCounters::default());
        let batch = Rc::new(TileBatch::default());
        let role = DatasetRole::Primary(Rc::clone(&batch));
        let mut plans = stored.levels.iter();
        let Some(first) = plans.next() else {
            return Err(GpkgError::TableNotFound {
                table_name: table_name.to_string(),
            });
        };
        let palette = PaletteState::shared(first.matrix.zoom_level, first.geometry.middle_tile());
        let mut overviews = Vec::with_capacity(stored.levels.len() - 1);
        for plan in plans {
            overviews.push(RasterLevel::new(
                TileStore::new(conn, &stored.table_name, plan.matrix.zoom_level, Rc::clone(&counters)),
                plan.geometry,
                settings,
                role.overview_role()?,
                Rc::clone(&palette),
            )?);
        }
        let primary = RasterLevel::new(
            TileStore::new(conn, &stored.table_name, first.matrix.zoom_level, Rc::clone(&counters)),
            first.geometry,
            settings,
            role,
            palette,
        )?;

        Ok(Self {
            conn,
            geo_transform: Some(first.geo_transform),
            table_name: stored.table_name,
            identifier: stored.identifier,
            description: stored.description,
            primary,
            overviews,
            batch,
            gate: Rc::new(FlushGate::default()),
            counters,
            srs_id: stored.srs_id,
            tiling_scheme: None,
            tms_min_x: stored.tms_min_x,
            tms_max_y: stored.tms_max_y,
            zoom_other: stored.zoom_other,
            is_new: false,
            update,
            closed: false,
        })
    }

    pub(crate) fn conn(&self) -> &'a rusqlite::Connection {
        self.conn
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn raster_size(&self) -> (u32, u32) {
        self.primary.raster_size()
    }

    pub fn band_count(&self) -> usize {
        self.primary.band_count()
    }

    pub fn block_size(&self) -> (u32, u32) {
        self.primary.block_size()
    }

    /// Zoom level of the full resolution tiles.
    pub fn zoom_level(&self) -> i32 {
        self.primary.zoom_level()
    }

    pub fn geo_transform(&self) -> Option<[f64; 6]> {
        self.geo_transform
    }

    pub fn srs_id(&self) -> i32 {
        self.srs_id
    }

    pub fn tile_format(&self) -> TileFormat {
        self.primary.codec.tile_format
    }

    pub fn tiling_scheme(&self) -> Option<&'static TilingScheme> {
        self.tiling_scheme
    }

    /// Full resolution level.
    pub fn level(&self) -> &RasterLevel<'a> {
        &self.primary
    }

    pub fn overview_count(&self) -> usize {
        self.overviews.len()
    }

    /// Overview `index`, finest first.
    pub fn overview(&self, index: usize) -> Option<&RasterLevel<'a>> {
        self.overviews.get(index)
    }

    pub fn overview_mut(&mut self, index: usize) -> Option<&mut RasterLevel<'a>> {
        self.overviews.get_mut(index)
    }

    /// Tile statements issued so far by every level of the raster.
    pub fn io_stats(&self) -> TileIoStats {
        self.counters.snapshot()
    }

    /// Color table of a single band raster, looked up in the stored tiles the
    /// first time.
    pub fn color_table(&self) -> Result<Option<ColorTable>> {
        self.primary.color_table()
    }

    /// Assign the color table of a newly created single band raster. Tiles are
    /// then written as paletted PNG.
    pub fn set_color_table(&mut self, table: ColorTable) -> Result<()> {
        if self.primary.band_count() != 1 {
            return Err(GpkgError::InvalidArgument(
                "SetColorTable() only supported for a single band dataset".to_string(),
            ));
        }
        let mut state = self.primary.palette.borrow_mut();
        if !self.is_new || state.established {
            return Err(GpkgError::InvalidArgument(
                "SetColorTable() only supported on a newly created dataset".to_string(),
            ));
        }
        state.established = true;
        state.table = Some(table);
        Ok(())
    }

    /// `band` is zero-based.
    pub fn color_interpretation(&self, band: usize) -> Result<ColorInterpretation> {
        let bands = self.band_count();
        if band >= bands {
            return Err(GpkgError::InvalidArgument(format!(
                "band index {band} out of range, the raster has {bands} bands"
            )));
        }
        let paletted = bands == 1 && self.color_table()?.is_some();
        Ok(match (bands, band) {
            (1, _) if paletted => ColorInterpretation::Palette,
            (1, _) | (2, 0) => ColorInterpretation::Gray,
            (2, _) => ColorInterpretation::Alpha,
            (_, 0) => ColorInterpretation::Red,
            (_, 1) => ColorInterpretation::Green,
            (_, 2) => ColorInterpretation::Blue,
            _ => ColorInterpretation::Alpha,
        })
    }

    /// Set the spatial reference system, which must already be in
    /// `gpkg_spatial_ref_sys` (EPSG:3857 is added on demand).
    pub fn set_srs_id(&mut self, srs_id: i32) -> Result<()> {
        if !self.update {
            return Err(GpkgError::ReadOnly);
        }
        if let Some(scheme) = self.tiling_scheme {
            if srs_id != scheme.epsg_code {
                return Err(GpkgError::Config(format!(
                    "Projection should be EPSG:{} for {} tiling scheme",
                    scheme.epsg_code, scheme.name
                )));
            }
        }
        if !ensure_builtin_srs(self.conn, srs_id)? {
            return Err(GpkgError::MissingSpatialRefSysId { srs_id });
        }
        self.srs_id = srs_id;
        if self.geo_transform.is_some() {
            self.conn
                .execute(SQL_UPDATE_CONTENTS_SRS, rusqlite::params![srs_id, self.table_name])?;
            self.conn.execute(
                SQL_UPDATE_TILE_MATRIX_SET_SRS,
                rusqlite::params![srs_id, self.table_name],
            )?;
        }
        Ok(())
    }

    /// Georeference the raster and register its tile matrices. Only a north-up
    /// geotransform can be set, and only once.
    pub fn set_geo_transform(&mut self, geo_transform: [f64; 6]) -> Result<()> {
        if !self.update {
            return Err(GpkgError::ReadOnly);
        }
        if self.geo_transform.is_some() {
            return Err(GpkgError::InvalidArgument(
                "Cannot modify geotransform once set".to_string(),
            ));
        }
        if geo_transform[2] != 0.0
            || geo_transform[4] != 0.0
            || geo_transform[5] >= 0.0
            || geo_transform[1] <= 0.0
        {
            return Err(GpkgError::InvalidArgument(
                "Only north-up non rotated geotransform supported".to_string(),
            ));
        }

        let (width, height) = self.primary.raster_size();
        let (tile_width, tile_height) = self.primary.block_size();
        let layout = plan_layout(
            &geo_transform,
            width,
            height,
            tile_width,
            tile_height,
            self.tiling_scheme,
        )?;
        let extent = raster_extent(&geo_transform, width, height);
        write_layout(
            self.conn,
            &ContentsRow {
                table_name: &self.table_name,
                identifier: &self.identifier,
                description: &self.description,
                srs_id: self.srs_id,
                extent,
            },
            &layout,
        )?;

        let mut matrices = layout.matrices.iter();
        let Some(first) = matrices.next() else {
            return Err(GpkgError::InvalidArgument(
                "no tile matrix could be laid out".to_string(),
            ));
        };
        let mut geometry = plan_level(&extent, layout.tms_min_x, layout.tms_max_y, *first).geometry;
        geometry.raster_width = width;
        geometry.raster_height = height;
        self.primary.relocate(first.zoom_level, geometry);
        {
            let mut palette = self.primary.palette.borrow_mut();
            palette.probe_zoom = first.zoom_level;
            palette.probe_middle = geometry.middle_tile();
        }

        let settings = LevelSettings {
            bands: self.primary.bands,
            codec: self.primary.codec,
            update: true,
            georeferenced: true,
        };
        for matrix in matrices {
            let plan = plan_level(&extent, layout.tms_min_x, layout.tms_max_y, *matrix);
            let level = self.new_overview(matrix.zoom_level, plan.geometry, settings)?;
            self.overviews.push(level);
        }

        self.geo_transform = Some(geo_transform);
        self.tms_min_x = layout.tms_min_x;
        self.tms_max_y = layout.tms_max_y;
        Ok(())
    }

    pub(crate) fn new_overview(
        &self,
        zoom_level: i32,
        geometry: LevelGeometry,
        settings: LevelSettings,
    ) -> Result<RasterLevel<'a>> {
        RasterLevel::new(
            TileStore::new(self.conn, &self.table_name, zoom_level, Rc::clone(&self.counters)),
            geometry,
            settings,
            self.primary.role.overview_role()?,
            self.shared_palette(),
        )
    }

    fn shared_palette(&self) -> SharedPalette {
        Rc::clone(&self.primary.palette)
    }

    pub(crate) fn level_settings(&self) -> LevelSettings {
        LevelSettings {
            bands: self.primary.bands,
            codec: self.primary.codec,
            update: self.update,
            georeferenced: true,
        }
    }

    /// Read band `band` (zero-based) of block (`x`, `y`) of the full
    /// resolution level.
    pub fn read_block(&mut self, band: usize, x: u32, y: u32, out: &mut [u8]) -> Result<()> {
        self.primary.read_block(band, x, y, out)
    }

    pub fn write_block(&mut self, band: usize, x: u32, y: u32, data: &[u8]) -> Result<()> {
        self.primary.write_block(band, x, y, data)
    }

    /// Read a window of every band, band after band.
    pub fn read_region(&mut self, x: u32, y: u32, width: u32, height: u32, out: &mut [u8]) -> Result<()> {
        self.primary.read_region(x, y, width, height, out)
    }

    pub fn write_region(&mut self, x: u32, y: u32, width: u32, height: u32, data: &[u8]) -> Result<()> {
        self.primary.write_region(x, y, width, height, data)
    }

    /// Write every pending block and tile, overviews first, and commit.
    pub fn flush(&mut self) -> Result<()> {
        let Some(_guard) = FlushGate::enter(&self.gate) else {
            return Ok(());
        };
        for overview in &mut self.overviews {
            overview.flush_level()?;
        }
        self.primary.flush_blocks()?;
        if self.batch.take_modified() {
            if let Err(err) = self
                .conn
                .execute(SQL_UPDATE_CONTENTS_LAST_CHANGE, [&self.table_name])
            {
                warn!("cannot update last_change of {}: {err}", self.table_name);
            }
        }
        self.primary.flush_tiles()
    }

    /// Flush and release the raster, reporting the errors a drop would only
    /// log.
    pub fn close(mut self) -> Result<()> {
        let result = self.flush();
        self.closed = true;
        result
    }
}

impl Drop for GpkgRaster<'_> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(err) = self.flush() {
            error!("failed to flush {}: {err}", self.table_name);
        }
    }
}
