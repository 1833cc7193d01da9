use crate::error::{GpkgError, Result};
use crate::ogc_sql::{
    SQL_DELETE_CONTENTS, SQL_DELETE_EXTENSIONS, SQL_DELETE_TILE_MATRIX,
    SQL_DELETE_TILE_MATRIX_SET, SQL_INSERT_SRS, SQL_LIST_TILE_TABLES, SQL_TABLE_EXISTS,
    initialize_gpkg, sql_drop_table,
};
use crate::options::{RasterCreateOptions, RasterOpenOptions};
use crate::raster::GpkgRaster;
use rusqlite::OpenFlags;
use std::path::Path;
use tracing::debug;

#[derive(Debug)]
/// GeoPackage connection wrapper giving access to its tiled rasters.
pub struct Gpkg {
    conn: rusqlite::Connection,
    read_only: bool,
}

impl Gpkg {
    /// Open a GeoPackage in read-only mode.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = rusqlite::Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Ok(Self {
            conn,
            read_only: true,
        })
    }

    /// Open an existing GeoPackage in read-write mode.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(GpkgError::FileNotFound(path.display().to_string()));
        }

        let conn = rusqlite::Connection::open(path)?;
        Ok(Self {
            conn,
            read_only: false,
        })
    }

    /// Create a new GeoPackage
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Err(GpkgError::FileAlreadyExists(path.display().to_string()));
        }

        let conn = rusqlite::Connection::open(path)?;
        initialize_gpkg(&conn)?;

        Ok(Self {
            conn,
            read_only: false,
        })
    }

    /// Create a new GeoPackage in memory
    pub fn new_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()?;
        initialize_gpkg(&conn)?;

        Ok(Self {
            conn,
            read_only: false,
        })
    }

    /// Expert-only: register a spatial reference system in gpkg_spatial_ref_sys.
    ///
    /// Rasters must reference an `srs_id` present in `gpkg_spatial_ref_sys`.
    /// EPSG:4326 and the two undefined systems are created with the file, and
    /// EPSG:3857 is added when a raster asks for it. Anything else has to be
    /// inserted here first, with its full WKT definition. No validation of the
    /// WKT or of the authority fields is done.
    ///
    /// Example: register EPSG:32631 (WGS 84 / UTM zone 31N).
    /// ```
    /// # use rusqlite_gpkg_raster::Gpkg;
    /// let gpkg = Gpkg::new_in_memory().expect("new gpkg");
    /// let definition = r#"PROJCS["WGS 84 / UTM zone 31N",GEOGCS["WGS 84",DATUM["WGS_1984",SPHEROID["WGS 84",6378137,298.257223563]],PRIMEM["Greenwich",0],UNIT["degree",0.0174532925199433]],PROJECTION["Transverse_Mercator"],PARAMETER["latitude_of_origin",0],PARAMETER["central_meridian",3],PARAMETER["scale_factor",0.9996],PARAMETER["false_easting",500000],PARAMETER["false_northing",0],UNIT["metre",1],AUTHORITY["EPSG","32631"]]"#;
    /// gpkg.register_srs(
    ///     "WGS 84 / UTM zone 31N",
    ///     32631,
    ///     "EPSG",
    ///     32631,
    ///     definition,
    ///     "UTM zone 31N",
    /// ).expect("register srs");
    /// ```
    pub fn register_srs(
        &self,
        srs_name: &str,
        srs_id: i32,
        organization: &str,
        organization_coordsys_id: i32,
        definition: &str,
        description: &str,
    ) -> Result<()> {
        if self.read_only {
            return Err(GpkgError::ReadOnly);
        }

        self.conn.execute(
            SQL_INSERT_SRS,
            rusqlite::params![
                srs_name,
                srs_id,
                organization,
                organization_coordsys_id,
                definition,
                description
            ],
        )?;
        Ok(())
    }

    /// List the names of the tile tables.
    pub fn list_tile_tables(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(SQL_LIST_TILE_TABLES)?;
        let tables = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(tables)
    }

    /// Open a raster by tile table name. Writes are allowed unless the
    /// GeoPackage was opened read-only.
    pub fn open_raster<'a>(
        &'a self,
        table_name: &str,
        options: &RasterOpenOptions,
    ) -> Result<GpkgRaster<'a>> {
        GpkgRaster::open(&self.conn, table_name, options, !self.read_only)
    }

    /// Create a raster of `width` x `height` pixels and `bands` bands (1 to
    /// 4). Tiles can be written once [`GpkgRaster::set_geo_transform`] has
    /// been called.
    pub fn create_raster<'a>(
        &'a self,
        table_name: &str,
        width: u32,
        height: u32,
        bands: usize,
        options: &RasterCreateOptions,
    ) -> Result<GpkgRaster<'a>> {
        if self.read_only {
            return Err(GpkgError::ReadOnly);
        }
        GpkgRaster::create(&self.conn, table_name, width, height, bands, options)
    }

    /// Create a georeferenced raster covering `extent` (`[min_x, min_y,
    /// max_x, max_y]`) on the grid of the tiling scheme of `options`. The
    /// resolution is snapped to a zoom level of the scheme according to
    /// `options.zoom_level_strategy`.
    pub fn create_raster_for_extent<'a>(
        &'a self,
        table_name: &str,
        extent: [f64; 4],
        resolution: f64,
        bands: usize,
        options: &RasterCreateOptions,
    ) -> Result<GpkgRaster<'a>> {
        let Some(scheme) = options.tiling_scheme else {
            return Err(GpkgError::Config(
                "a tiling scheme is required to create a raster from an extent".to_string(),
            ));
        };
        let [min_x, min_y, max_x, max_y] = extent;
        if !(min_x < max_x && min_y < max_y) || !(resolution > 0.0) {
            return Err(GpkgError::InvalidArgument(format!(
                "invalid extent {extent:?} or resolution {resolution}"
            )));
        }
        let zoom_level = scheme.snap_zoom_level(resolution, options.zoom_level_strategy)?;
        let pixel_size = scheme.pixel_x_size(zoom_level);
        let width = ((0.5 + (max_x - min_x) / pixel_size) as u32).max(1);
        let height = ((0.5 + (max_y - min_y) / pixel_size) as u32).max(1);
        debug!(table = table_name, zoom_level, width, height, "snapped raster to tiling scheme");

        let mut raster = self.create_raster(table_name, width, height, bands, options)?;
        raster.set_geo_transform([min_x, pixel_size, 0.0, max_y, 0.0, -pixel_size])?;
        Ok(raster)
    }

    /// Delete a tile table and its metadata.
    pub fn delete_raster(&self, table_name: &str) -> Result<()> {
        if self.read_only {
            return Err(GpkgError::ReadOnly);
        }
        let exists: i64 = self
            .conn
            .query_row(SQL_TABLE_EXISTS, [table_name], |row| row.get(0))?;
        if exists == 0 {
            return Err(GpkgError::TableNotFound {
                table_name: table_name.to_string(),
            });
        }

        let tx = self.conn.unchecked_transaction()?;
        tx.execute_batch(&sql_drop_table(table_name))?;
        for sql in [
            SQL_DELETE_TILE_MATRIX,
            SQL_DELETE_TILE_MATRIX_SET,
            SQL_DELETE_EXTENSIONS,
            SQL_DELETE_CONTENTS,
        ] {
            tx.execute(sql, [table_name])?;
        }
        tx.commit()?;
        Ok(())
    }

    pub(crate) fn connection(&self) -> &rusqlite::Connection {
        &self.conn
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
}

#[cfg(test)]
mod tests {
    use super::Gpkg;
    use crate::codec::{TileDriver, decode_tile};
    use crate::color_table::{ColorEntry, ColorTable};
    use crate::error::{GpkgError, Result};
    use crate::options::{
        RasterCreateOptions, RasterOpenOptions, ResamplingMethod, TileFormat,
    };
    use crate::raster::ColorInterpretation;
    use crate::tiling::TilingScheme;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_path(prefix: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time")
            .as_nanos();
        path.push(format!("{prefix}_{nanos}.gpkg"));
        path
    }

    fn png_options() -> RasterCreateOptions {
        let mut options = RasterCreateOptions::default();
        options.codec.tile_format = TileFormat::Png;
        options
    }

    fn pattern(width: u32, height: u32, bands: usize) -> Vec<u8> {
        let mut data = Vec::with_capacity(bands * (width * height) as usize);
        for band in 0..bands {
            for y in 0..height {
                for x in 0..width {
                    data.push(((x + 3 * y + 7 * band as u32) % 256) as u8);
                }
            }
        }
        data
    }

    fn format_options(tile_format: TileFormat) -> RasterCreateOptions {
        let mut options = RasterCreateOptions::default();
        options.codec.tile_format = tile_format;
        options
    }

    fn tile_blob(gpkg: &Gpkg, table_name: &str, zoom: i32, row: i32, col: i32) -> Result<Vec<u8>> {
        let blob = gpkg.connection().query_row(
            &format!(
                r#"SELECT tile_data FROM "{table_name}"
                   WHERE zoom_level = ?1 AND tile_row = ?2 AND tile_column = ?3"#
            ),
            [zoom, row, col],
            |row| row.get(0),
        )?;
        Ok(blob)
    }

    fn read_back(gpkg: &Gpkg, table_name: &str, band_count: usize) -> Result<Vec<u8>> {
        let options = RasterOpenOptions {
            band_count,
            ..RasterOpenOptions::default()
        };
        let mut raster = gpkg.open_raster(table_name, &options)?;
        let (width, height) = raster.raster_size();
        let mut out = vec![0u8; band_count * (width * height) as usize];
        raster.read_region(0, 0, width, height, &mut out)?;
        Ok(out)
    }

    fn count_tiles(gpkg: &Gpkg, table_name: &str) -> Result<i64> {
        let count = gpkg.connection().query_row(
            &format!(r#"SELECT COUNT(*) FROM "{table_name}""#),
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    #[test]
    fn new_fails_if_file_exists() {
        let path = temp_path("gpkg_raster_exists");
        std::fs::write(&path, []).expect("create temp file");
        let err = Gpkg::new(&path).expect_err("existing file should fail");
        match err {
            GpkgError::FileAlreadyExists(message) => {
                assert!(message.contains("gpkg_raster_exists"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn open_fails_if_missing_file() {
        let path = temp_path("gpkg_raster_missing");
        let err = Gpkg::open(&path).expect_err("missing file should fail");
        match err {
            GpkgError::FileNotFound(_) => {}
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn written_pixels_survive_a_reopen() -> Result<()> {
        let gpkg = Gpkg::new_in_memory()?;
        let data = pattern(300, 200, 3);
        {
            let mut raster = gpkg.create_raster("rgb", 300, 200, 3, &png_options())?;
            raster.set_geo_transform([0.0, 1.0, 0.0, 200.0, 0.0, -1.0])?;
            raster.write_region(0, 0, 300, 200, &data)?;
            raster.close()?;
        }
        assert_eq!(gpkg.list_tile_tables()?, vec!["rgb".to_string()]);

        let options = RasterOpenOptions {
            band_count: 3,
            ..RasterOpenOptions::default()
        };
        let mut raster = gpkg.open_raster("rgb", &options)?;
        assert_eq!(raster.raster_size(), (300, 200));
        assert_eq!(raster.geo_transform(), Some([0.0, 1.0, 0.0, 200.0, 0.0, -1.0]));
        assert_eq!(raster.overview_count(), 1);
        let mut out = vec![0u8; data.len()];
        raster.read_region(0, 0, 300, 200, &mut out)?;
        assert!(out == data);
        Ok(())
    }

    #[test]
    fn shifted_raster_round_trip_and_scan() -> Result<()> {
        let gpkg = Gpkg::new_in_memory()?;
        let options = RasterCreateOptions {
            tiling_scheme: TilingScheme::by_name("GoogleMapsCompatible"),
            ..png_options()
        };
        let scheme = options.tiling_scheme.expect("known scheme");
        let res = scheme.pixel_x_size(2);
        let data = pattern(512, 256, 3);
        {
            let mut raster = gpkg.create_raster("shifted", 512, 256, 3, &options)?;
            raster.set_geo_transform([scheme.min_x + 100.0 * res, res, 0.0, scheme.max_y, 0.0, -res])?;
            assert_eq!(raster.level().pixel_shift().x_pixels_mod, 100);
            raster.write_region(0, 0, 512, 256, &data)?;
            raster.close()?;
        }

        let options = RasterOpenOptions {
            band_count: 3,
            ..RasterOpenOptions::default()
        };
        let mut raster = gpkg.open_raster("shifted", &options)?;
        let mut block = vec![0u8; 256 * 256];
        raster.read_block(0, 0, 0, &mut block)?;
        assert_eq!(raster.io_stats().selects, 2);
        // the tile shared by both blocks stays cached
        raster.read_block(0, 1, 0, &mut block)?;
        assert_eq!(raster.io_stats().selects, 3);

        let mut out = vec![0u8; data.len()];
        raster.read_region(0, 0, 512, 256, &mut out)?;
        assert!(out == data);
        Ok(())
    }

    #[test]
    fn flushing_twice_writes_nothing_new() -> Result<()> {
        let gpkg = Gpkg::new_in_memory()?;
        let mut raster = gpkg.create_raster("flush", 256, 256, 3, &png_options())?;
        raster.set_geo_transform([0.0, 1.0, 0.0, 256.0, 0.0, -1.0])?;
        raster.write_region(0, 0, 256, 256, &pattern(256, 256, 3))?;
        raster.flush()?;
        let first = raster.io_stats();
        assert_eq!(first.inserts, 1);

        raster.flush()?;
        assert_eq!(raster.io_stats(), first);
        Ok(())
    }

    #[test]
    fn transparent_tiles_are_deleted() -> Result<()> {
        let gpkg = Gpkg::new_in_memory()?;
        let mut raster = gpkg.create_raster("alpha", 256, 256, 4, &png_options())?;
        raster.set_geo_transform([0.0, 1.0, 0.0, 256.0, 0.0, -1.0])?;

        let mut data = vec![120u8; 4 * 256 * 256];
        raster.write_region(0, 0, 256, 256, &data)?;
        raster.flush()?;
        assert_eq!(count_tiles(&gpkg, "alpha")?, 1);

        data[3 * 256 * 256..].fill(0);
        raster.write_region(0, 0, 256, 256, &data)?;
        raster.flush()?;
        assert_eq!(count_tiles(&gpkg, "alpha")?, 0);
        assert_eq!(raster.io_stats().deletes, 1);
        Ok(())
    }

    #[test]
    fn writing_before_georeferencing_fails() -> Result<()> {
        let gpkg = Gpkg::new_in_memory()?;
        let mut raster = gpkg.create_raster("nogeo", 64, 64, 1, &png_options())?;
        let block = vec![0u8; 256 * 256];
        let err = raster
            .write_block(0, 0, 0, &block)
            .expect_err("no geotransform yet");
        match err {
            GpkgError::GeoreferencingNotSet => {}
            other => panic!("unexpected error: {other:?}"),
        }

        raster.set_geo_transform([0.0, 1.0, 0.0, 64.0, 0.0, -1.0])?;
        let err = raster
            .set_geo_transform([0.0, 2.0, 0.0, 64.0, 0.0, -2.0])
            .expect_err("geotransform is set once");
        match err {
            GpkgError::InvalidArgument(message) => assert!(message.contains("once set")),
            other => panic!("unexpected error: {other:?}"),
        }
        raster.write_block(0, 0, 0, &block)?;
        Ok(())
    }

    #[test]
    fn color_table_only_on_new_single_band_rasters() -> Result<()> {
        let gpkg = Gpkg::new_in_memory()?;
        let table = ColorTable::new(vec![
            ColorEntry::rgb(0, 0, 0),
            ColorEntry::rgb(255, 0, 0),
        ]);

        let mut rgb = gpkg.create_raster("rgb", 64, 64, 3, &png_options())?;
        match rgb.set_color_table(table.clone()) {
            Err(GpkgError::InvalidArgument(message)) => {
                assert!(message.contains("single band"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(rgb.color_interpretation(0)?, ColorInterpretation::Red);
        assert_eq!(rgb.color_interpretation(2)?, ColorInterpretation::Blue);

        let mut gray = gpkg.create_raster("paletted", 64, 64, 1, &png_options())?;
        assert_eq!(gray.color_interpretation(0)?, ColorInterpretation::Gray);
        gray.set_color_table(table.clone())?;
        assert_eq!(gray.color_interpretation(0)?, ColorInterpretation::Palette);
        assert_eq!(gray.color_table()?, Some(table.clone()));
        match gray.set_color_table(table) {
            Err(GpkgError::InvalidArgument(message)) => {
                assert!(message.contains("newly created"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn read_only_gpkg_rejects_writes() -> Result<()> {
        let path = temp_path("gpkg_raster_read_only");
        {
            let gpkg = Gpkg::new(&path)?;
            let mut raster = gpkg.create_raster("ro", 256, 256, 1, &png_options())?;
            raster.set_geo_transform([0.0, 1.0, 0.0, 256.0, 0.0, -1.0])?;
            raster.write_region(0, 0, 256, 256, &vec![9u8; 256 * 256])?;
            raster.close()?;
        }

        let gpkg = Gpkg::open_read_only(&path)?;
        assert!(gpkg.is_read_only());
        assert!(matches!(
            gpkg.create_raster("other", 8, 8, 1, &png_options()),
            Err(GpkgError::ReadOnly)
        ));
        assert!(matches!(gpkg.delete_raster("ro"), Err(GpkgError::ReadOnly)));

        let options = RasterOpenOptions {
            band_count: 1,
            ..RasterOpenOptions::default()
        };
        let mut raster = gpkg.open_raster("ro", &options)?;
        let mut block = vec![0u8; 256 * 256];
        raster.read_block(0, 0, 0, &mut block)?;
        assert!(block.iter().all(|&v| v == 9));
        let err = raster.write_block(0, 0, 0, &block).expect_err("read-only");
        assert!(matches!(err, GpkgError::ReadOnly));
        match raster.build_overviews(ResamplingMethod::Average, &[2], |_| true) {
            Err(GpkgError::Overview(message)) => assert!(message.contains("read-only")),
            other => panic!("unexpected result: {other:?}"),
        }
        drop(raster);
        drop(gpkg);

        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    #[test]
    fn create_from_extent_snaps_to_the_scheme() -> Result<()> {
        let gpkg = Gpkg::new_in_memory()?;
        let options = RasterCreateOptions {
            tiling_scheme: TilingScheme::by_name("GoogleMapsCompatible"),
            ..png_options()
        };
        let scheme = options.tiling_scheme.expect("known scheme");
        let resolution = scheme.pixel_x_size(10);
        let extent = [0.0, 0.0, resolution * 300.0, resolution * 200.0];
        // slightly finer than zoom level 10
        let raster = gpkg.create_raster_for_extent(
            "mercator",
            extent,
            resolution * 0.99,
            3,
            &options,
        )?;
        assert_eq!(raster.srs_id(), 3857);
        assert_eq!(raster.zoom_level(), 10);
        assert_eq!(raster.raster_size(), (300, 200));
        assert_eq!(raster.overview_count(), 10);

        let err = gpkg
            .create_raster_for_extent("custom", extent, 1.0, 3, &png_options())
            .expect_err("needs a tiling scheme");
        assert!(matches!(err, GpkgError::Config(_)));
        Ok(())
    }

    #[test]
    fn delete_raster_drops_metadata() -> Result<()> {
        let gpkg = Gpkg::new_in_memory()?;
        {
            let mut raster = gpkg.create_raster("gone", 64, 64, 1, &png_options())?;
            raster.set_geo_transform([0.0, 1.0, 0.0, 64.0, 0.0, -1.0])?;
        }
        gpkg.delete_raster("gone")?;
        assert!(gpkg.list_tile_tables()?.is_empty());
        let matrices: i64 = gpkg.connection().query_row(
            "SELECT COUNT(*) FROM gpkg_tile_matrix",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(matrices, 0);
        match gpkg.delete_raster("gone") {
            Err(GpkgError::TableNotFound { table_name }) => assert_eq!(table_name, "gone"),
            other => panic!("unexpected result: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn overviews_are_built_and_inserted() -> Result<()> {
        let gpkg = Gpkg::new_in_memory()?;
        let mut raster = gpkg.create_raster("pyramid", 512, 512, 3, &png_options())?;
        raster.set_geo_transform([0.0, 1.0, 0.0, 512.0, 0.0, -1.0])?;
        raster.write_region(0, 0, 512, 512, &vec![100u8; 3 * 512 * 512])?;
        assert_eq!(raster.overview_count(), 1);

        raster.build_overviews(ResamplingMethod::Average, &[2, 4], |_| true)?;
        assert_eq!(raster.zoom_level(), 2);
        assert_eq!(raster.overview_count(), 2);
        let coarsest = raster.overview_mut(1).expect("factor 4 overview");
        assert_eq!(coarsest.raster_size(), (128, 128));
        assert_eq!(coarsest.zoom_level(), 0);
        let mut out = vec![0u8; 3 * 128 * 128];
        coarsest.read_region(0, 0, 128, 128, &mut out)?;
        assert!(out.iter().all(|&v| v == 100));

        let zoom_other: i64 = gpkg.connection().query_row(
            "SELECT COUNT(*) FROM gpkg_extensions WHERE extension_name = 'gpkg_zoom_other'",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(zoom_other, 0);

        raster.build_overviews(ResamplingMethod::Nearest, &[3], |_| true)?;
        assert_eq!(raster.zoom_level(), 3);
        assert_eq!(raster.overview_count(), 3);
        assert_eq!(raster.overview(1).map(|ov| ov.raster_size()), Some((171, 171)));
        let zoom_other: i64 = gpkg.connection().query_row(
            "SELECT COUNT(*) FROM gpkg_extensions WHERE extension_name = 'gpkg_zoom_other'",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(zoom_other, 1);
        raster.close()?;

        let reopened = gpkg.open_raster("pyramid", &RasterOpenOptions::default())?;
        assert_eq!(reopened.zoom_level(), 3);
        // opening stops at the first level smaller than a tile
        assert_eq!(reopened.overview_count(), 2);
        Ok(())
    }

    #[test]
    fn overview_factor_errors() -> Result<()> {
        let gpkg = Gpkg::new_in_memory()?;
        let mut raster = gpkg.create_raster("errors", 512, 512, 1, &png_options())?;
        raster.set_geo_transform([0.0, 1.0, 0.0, 512.0, 0.0, -1.0])?;

        match raster.build_overviews(ResamplingMethod::Average, &[1], |_| true) {
            Err(GpkgError::Overview(message)) => assert!(message.contains(">= 2")),
            other => panic!("unexpected result: {other:?}"),
        }
        match raster.build_overviews(ResamplingMethod::Average, &[128], |_| true) {
            Err(GpkgError::Overview(message)) => {
                assert!(message.contains("Too big overview factor : 128"));
                assert!(message.contains("4x4"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        match raster.build_overviews(ResamplingMethod::Average, &[2], |_| false) {
            Err(GpkgError::Cancelled) => {}
            other => panic!("unexpected result: {other:?}"),
        }

        let mut small = gpkg.create_raster("small", 100, 100, 1, &png_options())?;
        small.set_geo_transform([0.0, 1.0, 0.0, 100.0, 0.0, -1.0])?;
        match small.build_overviews(ResamplingMethod::Average, &[2], |_| true) {
            Err(GpkgError::Overview(message)) => assert!(message.contains("too small")),
            other => panic!("unexpected result: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn empty_factor_list_clears_overview_tiles() -> Result<()> {
        let gpkg = Gpkg::new_in_memory()?;
        let mut raster = gpkg.create_raster("clear", 512, 512, 3, &png_options())?;
        raster.set_geo_transform([0.0, 1.0, 0.0, 512.0, 0.0, -1.0])?;
        raster.write_region(0, 0, 512, 512, &pattern(512, 512, 3))?;
        raster.build_overviews(ResamplingMethod::Bilinear, &[2], |_| true)?;
        assert_eq!(count_tiles(&gpkg, "clear")?, 5);

        raster.build_overviews(ResamplingMethod::Bilinear, &[], |_| true)?;
        assert_eq!(count_tiles(&gpkg, "clear")?, 4);
        assert_eq!(raster.overview_count(), 1);
        Ok(())
    }

    #[test]
    fn failed_tile_insert_is_retried_on_flush() -> Result<()> {
        let gpkg = Gpkg::new_in_memory()?;
        let data = pattern(256, 256, 3);
        {
            let mut raster = gpkg.create_raster("retry", 256, 256, 3, &png_options())?;
            raster.set_geo_transform([0.0, 1.0, 0.0, 256.0, 0.0, -1.0])?;
            gpkg.connection().execute_batch(
                r#"CREATE TRIGGER reject_tiles BEFORE INSERT ON "retry"
                   BEGIN SELECT RAISE(ABORT, 'tile rejected'); END;"#,
            )?;
            match raster.write_region(0, 0, 256, 256, &data) {
                Err(GpkgError::TileInsert { .. }) => {}
                other => panic!("unexpected result: {other:?}"),
            }
            assert_eq!(count_tiles(&gpkg, "retry")?, 0);

            gpkg.connection().execute_batch("DROP TRIGGER reject_tiles")?;
            raster.flush()?;
            assert_eq!(count_tiles(&gpkg, "retry")?, 1);
            raster.close()?;
        }
        assert!(read_back(&gpkg, "retry", 3)? == data);
        Ok(())
    }

    #[test]
    fn png_jpeg_stores_opaque_gray_tiles_as_jpeg() -> Result<()> {
        let gpkg = Gpkg::new_in_memory()?;
        let mut raster = gpkg.create_raster("gray", 256, 256, 1, &format_options(TileFormat::PngJpeg))?;
        raster.set_geo_transform([0.0, 1.0, 0.0, 256.0, 0.0, -1.0])?;
        raster.write_region(0, 0, 256, 256, &vec![128u8; 256 * 256])?;
        let zoom = raster.zoom_level();
        raster.close()?;

        let blob = tile_blob(&gpkg, "gray", zoom, 0, 0)?;
        assert_eq!(&blob[..3], &[0xFF, 0xD8, 0xFF]);
        let tile = decode_tile(&blob)?;
        assert_eq!(tile.driver, TileDriver::Jpeg);
        assert!(tile.is_lossy());

        let out = read_back(&gpkg, "gray", 1)?;
        assert!(out.iter().all(|v| v.abs_diff(128) <= 2));
        Ok(())
    }

    #[test]
    fn opaque_rgba_tiles_are_stored_as_rgb_jpeg() -> Result<()> {
        let gpkg = Gpkg::new_in_memory()?;
        let mut raster = gpkg.create_raster("rgba", 256, 256, 4, &format_options(TileFormat::PngJpeg))?;
        raster.set_geo_transform([0.0, 1.0, 0.0, 256.0, 0.0, -1.0])?;
        let mut data = Vec::with_capacity(4 * 256 * 256);
        for value in [100u8, 150, 200, 255] {
            data.extend(std::iter::repeat_n(value, 256 * 256));
        }
        raster.write_region(0, 0, 256, 256, &data)?;
        let zoom = raster.zoom_level();
        raster.close()?;

        let tile = decode_tile(&tile_blob(&gpkg, "rgba", zoom, 0, 0)?)?;
        assert_eq!(tile.driver, TileDriver::Jpeg);
        assert_eq!(tile.bands, 3);
        Ok(())
    }

    #[test]
    fn png8_stores_an_indexed_png() -> Result<()> {
        let gpkg = Gpkg::new_in_memory()?;
        let mut raster = gpkg.create_raster("indexed", 256, 256, 3, &format_options(TileFormat::Png8))?;
        raster.set_geo_transform([0.0, 1.0, 0.0, 256.0, 0.0, -1.0])?;
        // one flat color per quadrant
        let colors = [[200u8, 30, 30], [30, 200, 30], [30, 30, 200], [240, 240, 240]];
        let mut data = vec![0u8; 3 * 256 * 256];
        for y in 0..256 {
            for x in 0..256 {
                let color = colors[(y / 128) * 2 + x / 128];
                for band in 0..3 {
                    data[band * 256 * 256 + y * 256 + x] = color[band];
                }
            }
        }
        raster.write_region(0, 0, 256, 256, &data)?;
        let zoom = raster.zoom_level();
        raster.close()?;

        let blob = tile_blob(&gpkg, "indexed", zoom, 0, 0)?;
        // IHDR color type 3: indexed color
        assert_eq!(blob[25], 3);
        let tile = decode_tile(&blob)?;
        assert_eq!(tile.bands, 1);
        let palette = tile.palette.expect("indexed PNG carries a palette");
        assert!(palette.len() <= 256);
        assert!(read_back(&gpkg, "indexed", 3)? == data);
        Ok(())
    }

    #[test]
    fn rewriting_one_band_keeps_the_others() -> Result<()> {
        let gpkg = Gpkg::new_in_memory()?;
        let mut data = pattern(256, 256, 3);
        {
            let mut raster = gpkg.create_raster("bands", 256, 256, 3, &png_options())?;
            raster.set_geo_transform([0.0, 1.0, 0.0, 256.0, 0.0, -1.0])?;
            raster.write_region(0, 0, 256, 256, &data)?;
            raster.close()?;
        }
        {
            let options = RasterOpenOptions {
                band_count: 3,
                ..RasterOpenOptions::default()
            };
            let mut raster = gpkg.open_raster("bands", &options)?;
            raster.write_block(1, 0, 0, &vec![9u8; 256 * 256])?;
            raster.flush()?;
            // the stored tile supplies bands 1 and 3
            assert_eq!(raster.io_stats().selects, 1);
            assert_eq!(raster.io_stats().inserts, 1);
            raster.close()?;
        }
        data[256 * 256..2 * 256 * 256].fill(9);
        assert!(read_back(&gpkg, "bands", 3)? == data);
        Ok(())
    }

    #[test]
    fn partial_edge_tiles_gain_an_alpha_band() -> Result<()> {
        let gpkg = Gpkg::new_in_memory()?;
        let mut raster = gpkg.create_raster("edge", 300, 200, 3, &png_options())?;
        raster.set_geo_transform([0.0, 1.0, 0.0, 200.0, 0.0, -1.0])?;
        raster.write_region(0, 0, 300, 200, &vec![50u8; 3 * 300 * 200])?;
        let zoom = raster.zoom_level();
        raster.close()?;

        let tile = decode_tile(&tile_blob(&gpkg, "edge", zoom, 0, 1)?)?;
        assert_eq!(tile.bands, 4);
        let alpha = &tile.planes[3 * 256 * 256..];
        // the raster ends 44 pixels into the tile and 200 rows down
        assert_eq!(alpha[0], 255);
        assert_eq!(alpha[43], 255);
        assert_eq!(alpha[44], 0);
        assert_eq!(alpha[199 * 256], 255);
        assert_eq!(alpha[200 * 256], 0);
        Ok(())
    }

    #[test]
    fn webp_tiles_round_trip() -> Result<()> {
        let gpkg = Gpkg::new_in_memory()?;
        let data = pattern(256, 256, 3);
        let mut raster = gpkg.create_raster("webp", 256, 256, 3, &format_options(TileFormat::Webp))?;
        raster.set_geo_transform([0.0, 1.0, 0.0, 256.0, 0.0, -1.0])?;
        raster.write_region(0, 0, 256, 256, &data)?;
        let zoom = raster.zoom_level();
        raster.close()?;

        let blob = tile_blob(&gpkg, "webp", zoom, 0, 0)?;
        assert_eq!(&blob[..4], b"RIFF");
        assert_eq!(decode_tile(&blob)?.driver, TileDriver::Webp);
        assert!(read_back(&gpkg, "webp", 3)? == data);
        Ok(())
    }
}
