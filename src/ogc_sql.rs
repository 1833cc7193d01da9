// cf. https://www.geopackage.org/spec140/index.html#table_definition_sql

// gpkg_contents: lists all geospatial contents in the package with identifying
// and descriptive metadata for user display and access.
pub(crate) const SQL_GPKG_CONTENTS: &str = "
CREATE TABLE gpkg_contents (
  table_name TEXT NOT NULL PRIMARY KEY,
  data_type TEXT NOT NULL,
  identifier TEXT UNIQUE,
  description TEXT DEFAULT '',
  last_change DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
  min_x DOUBLE,
  min_y DOUBLE,
  max_x DOUBLE,
  max_y DOUBLE,
  srs_id INTEGER,
  CONSTRAINT fk_gc_r_srs_id FOREIGN KEY (srs_id) REFERENCES gpkg_spatial_ref_sys(srs_id)
);
";

// gpkg_extensions: declares which extensions apply to the GeoPackage, a table,
// or a column so clients can detect requirements without scanning user tables.
pub(crate) const SQL_GPKG_EXTENSIONS: &str = "
CREATE TABLE gpkg_extensions (
  table_name TEXT,
  column_name TEXT,
  extension_name TEXT NOT NULL,
  definition TEXT NOT NULL,
  scope TEXT NOT NULL,
  CONSTRAINT ge_tce UNIQUE (table_name, column_name, extension_name)
);
";

// gpkg_spatial_ref_sys: the SRS catalog referenced by gpkg_contents and
// gpkg_tile_matrix_set to describe spatial reference systems.
pub(crate) const SQL_GPKG_SPATIAL_REF_SYS: &str = "
CREATE TABLE gpkg_spatial_ref_sys (
  srs_name TEXT NOT NULL,
  srs_id INTEGER PRIMARY KEY,
  organization TEXT NOT NULL,
  organization_coordsys_id INTEGER NOT NULL,
  definition  TEXT NOT NULL,
  description TEXT
);
";

// gpkg_tile_matrix: documents tile pyramid structure per zoom level (tile size,
// matrix size, and pixel sizes) to support non-square tiles and varied intervals.
pub(crate) const SQL_GPKG_TILE_MATRIX: &str = "
CREATE TABLE gpkg_tile_matrix(
  table_name TEXT NOT NULL,
  zoom_level INTEGER NOT NULL,
  matrix_width INTEGER NOT NULL,
  matrix_height INTEGER NOT NULL,
  tile_width INTEGER NOT NULL,
  tile_height INTEGER NOT NULL,
  pixel_x_size DOUBLE NOT NULL,
  pixel_y_size DOUBLE NOT NULL,
  CONSTRAINT pk_ttm PRIMARY KEY(table_name, zoom_level),
  CONSTRAINT fk_tmm_table_name FOREIGN KEY(table_name) REFERENCES gpkg_contents(table_name)
);
CREATE TRIGGER 'gpkg_tile_matrix_zoom_level_insert' BEFORE INSERT ON 'gpkg_tile_matrix' FOR EACH ROW BEGIN SELECT RAISE(ABORT, 'insert on table ''gpkg_tile_matrix'' violates constraint: zoom_level cannot be less than 0') WHERE (NEW.zoom_level < 0); END;
CREATE TRIGGER 'gpkg_tile_matrix_zoom_level_update' BEFORE UPDATE of zoom_level ON 'gpkg_tile_matrix' FOR EACH ROW BEGIN SELECT RAISE(ABORT, 'update on table ''gpkg_tile_matrix'' violates constraint: zoom_level cannot be less than 0') WHERE (NEW.zoom_level < 0); END;
CREATE TRIGGER 'gpkg_tile_matrix_matrix_width_insert' BEFORE INSERT ON 'gpkg_tile_matrix' FOR EACH ROW BEGIN SELECT RAISE(ABORT, 'insert on table ''gpkg_tile_matrix'' violates constraint: matrix_width cannot be less than 1') WHERE (NEW.matrix_width < 1); END;
CREATE TRIGGER 'gpkg_tile_matrix_matrix_width_update' BEFORE UPDATE OF matrix_width ON 'gpkg_tile_matrix' FOR EACH ROW BEGIN SELECT RAISE(ABORT, 'update on table ''gpkg_tile_matrix'' violates constraint: matrix_width cannot be less than 1') WHERE (NEW.matrix_width < 1); END;
CREATE TRIGGER 'gpkg_tile_matrix_matrix_height_insert' BEFORE INSERT ON 'gpkg_tile_matrix' FOR EACH ROW BEGIN SELECT RAISE(ABORT, 'insert on table ''gpkg_tile_matrix'' violates constraint: matrix_height cannot be less than 1') WHERE (NEW.matrix_height < 1); END;
CREATE TRIGGER 'gpkg_tile_matrix_matrix_height_update' BEFORE UPDATE OF matrix_height ON 'gpkg_tile_matrix' FOR EACH ROW BEGIN SELECT RAISE(ABORT, 'update on table ''gpkg_tile_matrix'' violates constraint: matrix_height cannot be less than 1') WHERE (NEW.matrix_height < 1); END;
CREATE TRIGGER 'gpkg_tile_matrix_pixel_x_size_insert' BEFORE INSERT ON 'gpkg_tile_matrix' FOR EACH ROW BEGIN SELECT RAISE(ABORT, 'insert on table ''gpkg_tile_matrix'' violates constraint: pixel_x_size must be greater than 0') WHERE NOT (NEW.pixel_x_size > 0); END;
CREATE TRIGGER 'gpkg_tile_matrix_pixel_x_size_update' BEFORE UPDATE OF pixel_x_size ON 'gpkg_tile_matrix' FOR EACH ROW BEGIN SELECT RAISE(ABORT, 'update on table ''gpkg_tile_matrix'' violates constraint: pixel_x_size must be greater than 0') WHERE NOT (NEW.pixel_x_size > 0); END;
CREATE TRIGGER 'gpkg_tile_matrix_pixel_y_size_insert' BEFORE INSERT ON 'gpkg_tile_matrix' FOR EACH ROW BEGIN SELECT RAISE(ABORT, 'insert on table ''gpkg_tile_matrix'' violates constraint: pixel_y_size must be greater than 0') WHERE NOT (NEW.pixel_y_size > 0); END;
CREATE TRIGGER 'gpkg_tile_matrix_pixel_y_size_update' BEFORE UPDATE OF pixel_y_size ON 'gpkg_tile_matrix' FOR EACH ROW BEGIN SELECT RAISE(ABORT, 'update on table ''gpkg_tile_matrix'' violates constraint: pixel_y_size must be greater than 0') WHERE NOT (NEW.pixel_y_size > 0); END;
";

// gpkg_tile_matrix_set: defines SRS and overall bounds for all tiles in a tile
// pyramid user data table.
pub(crate) const SQL_GPKG_TILE_MATRIX_SET: &str = "
CREATE TABLE gpkg_tile_matrix_set (
  table_name TEXT NOT NULL PRIMARY KEY,
  srs_id INTEGER NOT NULL,
  min_x DOUBLE NOT NULL,
  min_y DOUBLE NOT NULL,
  max_x DOUBLE NOT NULL,
  max_y DOUBLE NOT NULL,
  CONSTRAINT fk_gtms_table_name FOREIGN KEY (table_name) REFERENCES gpkg_contents(table_name),
  CONSTRAINT fk_gtms_srs FOREIGN KEY (srs_id) REFERENCES gpkg_spatial_ref_sys (srs_id)
);
";

pub(crate) fn initialize_gpkg(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SQL_GPKG_SPATIAL_REF_SYS)?;
    register_default_srs_ids(conn)?;
    conn.execute_batch(SQL_GPKG_CONTENTS)?;
    conn.execute_batch(SQL_GPKG_TILE_MATRIX_SET)?;
    conn.execute_batch(SQL_GPKG_TILE_MATRIX)?;
    conn.execute_batch(SQL_GPKG_EXTENSIONS)?;
    Ok(())
}

pub(crate) const SQL_INSERT_SRS: &str = "INSERT INTO gpkg_spatial_ref_sys \
    (srs_name, srs_id, organization, organization_coordsys_id, definition, description) \
    VALUES (?1, ?2, ?3, ?4, ?5, ?6)";

pub(crate) const SQL_SRS_EXISTS: &str =
    "SELECT EXISTS(SELECT 1 FROM gpkg_spatial_ref_sys WHERE srs_id = ?1)";

const EPSG4326_WKT: &str = r#"GEOGCS["WGS 84",DATUM["WGS_1984",SPHEROID["WGS 84",6378137,298.257223563,AUTHORITY["EPSG","7030"]],AUTHORITY["EPSG","6326"]],PRIMEM["Greenwich",0,AUTHORITY["EPSG","8901"]],UNIT["degree",0.0174532925199433,AUTHORITY["EPSG","9122"]],AXIS["Latitude",NORTH],AXIS["Longitude",EAST],AUTHORITY["EPSG","4326"]]"#;

const EPSG3857_WKT: &str = r#"PROJCS["WGS 84 / Pseudo-Mercator",GEOGCS["WGS 84",DATUM["WGS_1984",SPHEROID["WGS 84",6378137,298.257223563,AUTHORITY["EPSG","7030"]],AUTHORITY["EPSG","6326"]],PRIMEM["Greenwich",0,AUTHORITY["EPSG","8901"]],UNIT["degree",0.0174532925199433,AUTHORITY["EPSG","9122"]],AUTHORITY["EPSG","4326"]],PROJECTION["Mercator_1SP"],PARAMETER["central_meridian",0],PARAMETER["scale_factor",1],PARAMETER["false_easting",0],PARAMETER["false_northing",0],UNIT["metre",1,AUTHORITY["EPSG","9001"]],AXIS["Easting",EAST],AXIS["Northing",NORTH],EXTENSION["PROJ4","+proj=merc +a=6378137 +b=6378137 +lat_ts=0 +lon_0=0 +x_0=0 +y_0=0 +k=1 +units=m +nadgrids=@null +wktext +no_defs"],AUTHORITY["EPSG","3857"]]"#;

// gpkg_spatial_ref_sys requires the WKT of the SRS. Only the SRSes the tiling
// schemes need are known here; anything else has to go through register_srs().
fn register_default_srs_ids(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    conn.execute(
        SQL_INSERT_SRS,
        rusqlite::params!["WGS 84", 4326, "EPSG", 4326, EPSG4326_WKT, "WGS 84"],
    )?;
    conn.execute(
        SQL_INSERT_SRS,
        rusqlite::params![
            "Undefined Cartesian SRS",
            -1,
            "NONE",
            -1,
            "undefined",
            "undefined Cartesian coordinate reference system"
        ],
    )?;
    conn.execute(
        SQL_INSERT_SRS,
        rusqlite::params![
            "Undefined geographic SRS",
            0,
            "NONE",
            0,
            "undefined",
            "undefined geographic coordinate reference system"
        ],
    )?;
    Ok(())
}

/// Insert a built-in SRS definition if it is missing. Returns `false` when the
/// id is neither registered nor known.
pub(crate) fn ensure_builtin_srs(conn: &rusqlite::Connection, srs_id: i32) -> rusqlite::Result<bool> {
    let exists: i64 = conn.query_row(SQL_SRS_EXISTS, [srs_id], |row| row.get(0))?;
    if exists != 0 {
        return Ok(true);
    }
    if srs_id == 3857 {
        conn.execute(
            SQL_INSERT_SRS,
            rusqlite::params![
                "WGS 84 / Pseudo-Mercator",
                3857,
                "EPSG",
                3857,
                EPSG3857_WKT,
                "Web Mercator / Pseudo-Mercator (EPSG:3857)"
            ],
        )?;
        return Ok(true);
    }
    Ok(false)
}

pub(crate) const SQL_LIST_TILE_TABLES: &str =
    "SELECT table_name FROM gpkg_contents WHERE lower(data_type) = 'tiles' ORDER BY table_name";

pub(crate) const SQL_TABLE_EXISTS: &str = "SELECT EXISTS(SELECT 1 FROM sqlite_master \
    WHERE lower(name) = lower(?1) AND type IN ('table', 'view'))";

pub(crate) const SQL_SELECT_RASTER_CONTENTS: &str = "
SELECT c.table_name, c.identifier, c.description, c.srs_id,
       c.min_x, c.min_y, c.max_x, c.max_y,
       tms.min_x, tms.min_y, tms.max_x, tms.max_y
FROM gpkg_contents c
JOIN gpkg_tile_matrix_set tms ON c.table_name = tms.table_name
WHERE lower(c.data_type) = 'tiles' AND lower(c.table_name) = lower(?1)
";

pub(crate) const SQL_INSERT_TILES_CONTENTS: &str = "
INSERT INTO gpkg_contents
  (table_name, data_type, identifier, description, min_x, min_y, max_x, max_y, last_change, srs_id)
VALUES
  (?1, 'tiles', ?2, ?3, ?4, ?5, ?6, ?7, strftime('%Y-%m-%dT%H:%M:%fZ','now'), ?8)
";

pub(crate) const SQL_INSERT_TILE_MATRIX_SET: &str = "
INSERT INTO gpkg_tile_matrix_set
  (table_name, srs_id, min_x, min_y, max_x, max_y)
VALUES
  (?1, ?2, ?3, ?4, ?5, ?6)
";

pub(crate) const SQL_INSERT_TILE_MATRIX: &str = "
INSERT INTO gpkg_tile_matrix
  (table_name, zoom_level, matrix_width, matrix_height, tile_width, tile_height, pixel_x_size, pixel_y_size)
VALUES
  (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
";

pub(crate) const SQL_UPDATE_TILE_MATRIX_ZOOM: &str = "UPDATE gpkg_tile_matrix SET zoom_level = ?1 \
    WHERE lower(table_name) = lower(?2) AND zoom_level = ?3";

pub(crate) const SQL_UPDATE_CONTENTS_LAST_CHANGE: &str = "UPDATE gpkg_contents SET \
    last_change = strftime('%Y-%m-%dT%H:%M:%fZ','now') \
    WHERE lower(table_name) = lower(?1) AND lower(data_type) = 'tiles'";

pub(crate) const SQL_UPDATE_CONTENTS_SRS: &str =
    "UPDATE gpkg_contents SET srs_id = ?1 WHERE lower(table_name) = lower(?2)";

pub(crate) const SQL_UPDATE_TILE_MATRIX_SET_SRS: &str =
    "UPDATE gpkg_tile_matrix_set SET srs_id = ?1 WHERE lower(table_name) = lower(?2)";

pub(crate) const SQL_EXTENSION_EXISTS: &str = "SELECT EXISTS(SELECT 1 FROM gpkg_extensions \
    WHERE lower(table_name) = lower(?1) AND extension_name = ?2)";

pub(crate) const SQL_INSERT_EXTENSION: &str = "
INSERT INTO gpkg_extensions
  (table_name, column_name, extension_name, definition, scope)
VALUES
  (?1, ?2, ?3, ?4, 'read-write')
";

pub(crate) const SQL_DELETE_TILE_MATRIX: &str =
    "DELETE FROM gpkg_tile_matrix WHERE lower(table_name) = lower(?1)";
pub(crate) const SQL_DELETE_TILE_MATRIX_SET: &str =
    "DELETE FROM gpkg_tile_matrix_set WHERE lower(table_name) = lower(?1)";
pub(crate) const SQL_DELETE_EXTENSIONS: &str =
    "DELETE FROM gpkg_extensions WHERE lower(table_name) = lower(?1)";
pub(crate) const SQL_DELETE_CONTENTS: &str =
    "DELETE FROM gpkg_contents WHERE lower(table_name) = lower(?1)";

// Tiled gridded coverage extensions
pub(crate) const EXTENSION_WEBP: (&str, &str) =
    ("gpkg_webp", "GeoPackage 1.0 Specification Annex P");
pub(crate) const EXTENSION_ZOOM_OTHER: (&str, &str) =
    ("gpkg_zoom_other", "GeoPackage 1.0 Specification Annex O");

/// `gpkg_tile_matrix` rows of a table, finest level first. `extra` narrows
/// the levels (see `RasterOpenOptions`).
pub(crate) fn sql_select_tile_matrices(extra: &str) -> String {
    format!(
        "SELECT zoom_level, pixel_x_size, pixel_y_size, tile_width, tile_height, \
         matrix_width, matrix_height FROM gpkg_tile_matrix tm \
         WHERE lower(table_name) = lower(?1) AND pixel_x_size > 0 AND pixel_y_size > 0 \
         AND tile_width > 0 AND tile_height > 0 AND matrix_width > 0 AND matrix_height > 0{extra} \
         ORDER BY zoom_level DESC"
    )
}

pub(crate) fn sql_tile_level_exists(table_name: &str) -> String {
    format!(
        r#"EXISTS (SELECT 1 FROM "{table_name}" WHERE zoom_level = tm.zoom_level LIMIT 1)"#
    )
}

pub(crate) fn sql_max_tile_zoom(table_name: &str) -> String {
    format!(r#"SELECT MAX(zoom_level) FROM "{table_name}""#)
}

pub(crate) fn sql_tile_extent(table_name: &str) -> String {
    format!(
        r#"SELECT MIN(tile_column), MIN(tile_row), MAX(tile_column), MAX(tile_row) FROM "{table_name}" WHERE zoom_level = ?1"#
    )
}

pub(crate) fn sql_create_tile_table(table_name: &str) -> String {
    format!(
        r#"CREATE TABLE "{table_name}" (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  zoom_level INTEGER NOT NULL,
  tile_column INTEGER NOT NULL,
  tile_row INTEGER NOT NULL,
  tile_data BLOB NOT NULL,
  UNIQUE (zoom_level, tile_column, tile_row)
)"#
    )
}

// cf. https://www.geopackage.org/spec140/index.html#tiles_zoom_levels
pub(crate) fn sql_tile_table_triggers(table_name: &str) -> String {
    format!(
        r#"CREATE TRIGGER "{t}_zoom_insert" BEFORE INSERT ON "{t}" FOR EACH ROW BEGIN
  SELECT RAISE(ABORT, 'insert on table ''{t}'' violates constraint: zoom_level not specified for table in gpkg_tile_matrix')
  WHERE NOT (NEW.zoom_level IN (SELECT zoom_level FROM gpkg_tile_matrix WHERE lower(table_name) = lower('{t}')));
END;
CREATE TRIGGER "{t}_zoom_update" BEFORE UPDATE OF zoom_level ON "{t}" FOR EACH ROW BEGIN
  SELECT RAISE(ABORT, 'update on table ''{t}'' violates constraint: zoom_level not specified for table in gpkg_tile_matrix')
  WHERE NOT (NEW.zoom_level IN (SELECT zoom_level FROM gpkg_tile_matrix WHERE lower(table_name) = lower('{t}')));
END;
CREATE TRIGGER "{t}_tile_column_insert" BEFORE INSERT ON "{t}" FOR EACH ROW BEGIN
  SELECT RAISE(ABORT, 'insert on table ''{t}'' violates constraint: tile_column cannot be < 0')
  WHERE (NEW.tile_column < 0);
  SELECT RAISE(ABORT, 'insert on table ''{t}'' violates constraint: tile_column must by < matrix_width specified for table and zoom level in gpkg_tile_matrix')
  WHERE NOT (NEW.tile_column < (SELECT matrix_width FROM gpkg_tile_matrix WHERE lower(table_name) = lower('{t}') AND zoom_level = NEW.zoom_level));
END;
CREATE TRIGGER "{t}_tile_column_update" BEFORE UPDATE OF tile_column ON "{t}" FOR EACH ROW BEGIN
  SELECT RAISE(ABORT, 'update on table ''{t}'' violates constraint: tile_column cannot be < 0')
  WHERE (NEW.tile_column < 0);
  SELECT RAISE(ABORT, 'update on table ''{t}'' violates constraint: tile_column must by < matrix_width specified for table and zoom level in gpkg_tile_matrix')
  WHERE NOT (NEW.tile_column < (SELECT matrix_width FROM gpkg_tile_matrix WHERE lower(table_name) = lower('{t}') AND zoom_level = NEW.zoom_level));
END;
CREATE TRIGGER "{t}_tile_row_insert" BEFORE INSERT ON "{t}" FOR EACH ROW BEGIN
  SELECT RAISE(ABORT, 'insert on table ''{t}'' violates constraint: tile_row cannot be < 0')
  WHERE (NEW.tile_row < 0);
  SELECT RAISE(ABORT, 'insert on table ''{t}'' violates constraint: tile_row must by < matrix_height specified for table and zoom level in gpkg_tile_matrix')
  WHERE NOT (NEW.tile_row < (SELECT matrix_height FROM gpkg_tile_matrix WHERE lower(table_name) = lower('{t}') AND zoom_level = NEW.zoom_level));
END;
CREATE TRIGGER "{t}_tile_row_update" BEFORE UPDATE OF tile_row ON "{t}" FOR EACH ROW BEGIN
  SELECT RAISE(ABORT, 'update on table ''{t}'' violates constraint: tile_row cannot be < 0')
  WHERE (NEW.tile_row < 0);
  SELECT RAISE(ABORT, 'update on table ''{t}'' violates constraint: tile_row must by < matrix_height specified for table and zoom level in gpkg_tile_matrix')
  WHERE NOT (NEW.tile_row < (SELECT matrix_height FROM gpkg_tile_matrix WHERE lower(table_name) = lower('{t}') AND zoom_level = NEW.zoom_level));
END;"#,
        t = table_name
    )
}

pub(crate) fn sql_drop_table(table_name: &str) -> String {
    format!(r#"DROP TABLE "{table_name}""#)
}

pub(crate) fn sql_select_tile(table_name: &str) -> String {
    format!(
        r#"SELECT tile_data FROM "{table_name}" WHERE zoom_level = ?1 AND tile_row = ?2 AND tile_column = ?3"#
    )
}

pub(crate) fn sql_select_first_tile(table_name: &str) -> String {
    format!(r#"SELECT tile_data FROM "{table_name}" WHERE zoom_level = ?1 LIMIT 1"#)
}

pub(crate) fn sql_insert_tile(table_name: &str) -> String {
    format!(
        r#"INSERT OR REPLACE INTO "{table_name}" (zoom_level, tile_row, tile_column, tile_data) VALUES (?1, ?2, ?3, ?4)"#
    )
}

pub(crate) fn sql_delete_tile(table_name: &str) -> String {
    format!(
        r#"DELETE FROM "{table_name}" WHERE zoom_level = ?1 AND tile_row = ?2 AND tile_column = ?3"#
    )
}

pub(crate) fn sql_delete_tiles_below(table_name: &str) -> String {
    format!(r#"DELETE FROM "{table_name}" WHERE zoom_level < ?1"#)
}

pub(crate) fn sql_update_tiles_zoom(table_name: &str) -> String {
    format!(r#"UPDATE "{table_name}" SET zoom_level = ?1 WHERE zoom_level = ?2"#)
}

