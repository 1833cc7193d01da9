use std::error::Error;
use std::fmt;

/// Crate error type for GeoPackage raster operations.
#[derive(Debug)]
pub enum GpkgError {
    /// Wraps errors returned by `rusqlite`.
    Sql(rusqlite::Error),
    /// Wraps errors returned by the `image` crate (JPEG and WEBP codecs).
    Image(image::ImageError),
    /// Wraps PNG decoding errors returned by the `png` crate.
    PngDecode(png::DecodingError),
    /// Wraps PNG encoding errors returned by the `png` crate.
    PngEncode(png::EncodingError),
    /// A tile blob could not be decoded (unknown container, corrupt stream).
    Decode(String),
    /// A decoded tile does not have the geometry declared by the tile matrix.
    ShapeMismatch {
        width: u32,
        height: u32,
        bands: usize,
        expected_width: u32,
        expected_height: u32,
    },
    /// Invalid creation / open options or tiling scheme combination.
    Config(String),
    /// The quantization histogram could not be allocated.
    QuantizationAlloc {
        bytes: usize,
    },
    /// Inserting an encoded tile failed.
    TileInsert {
        row: i32,
        col: i32,
        zoom_level: i32,
        source: rusqlite::Error,
    },
    /// Deleting a fully transparent tile failed.
    TileDelete {
        row: i32,
        col: i32,
        zoom_level: i32,
        source: rusqlite::Error,
    },
    /// A previous batch commit failed; the dataset refuses further tile writes.
    BatchAborted,
    /// Tile writing was re-entered while a tile was already being written.
    RecursiveWrite,
    /// Writing requires a geotransform and a spatial reference system.
    GeoreferencingNotSet,
    /// The tile table is not registered in `gpkg_contents`.
    TableNotFound {
        table_name: String,
    },
    /// A table with the same name already exists.
    TableAlreadyExists {
        table_name: String,
    },
    /// Referenced `srs_id` does not exist in `gpkg_spatial_ref_sys`.
    MissingSpatialRefSysId {
        srs_id: i32,
    },
    /// The GeoPackage file to create is already on disk.
    FileAlreadyExists(String),
    /// The GeoPackage file to open does not exist.
    FileNotFound(String),
    /// Overview building failed for the given reason.
    Overview(String),
    /// The progress callback asked to stop.
    Cancelled,
    /// An argument is outside the accepted domain.
    InvalidArgument(String),
    ReadOnly,
}

impl fmt::Display for GpkgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sql(err) => write!(f, "{err}"),
            Self::Image(err) => write!(f, "{err}"),
            Self::PngDecode(err) => write!(f, "{err}"),
            Self::PngEncode(err) => write!(f, "{err}"),
            Self::Decode(msg) => write!(f, "cannot parse tile data: {msg}"),
            Self::ShapeMismatch {
                width,
                height,
                bands,
                expected_width,
                expected_height,
            } => write!(
                f,
                "inconsistent tiles characteristics: got {width}x{height} with {bands} band(s), \
                 expected {expected_width}x{expected_height} with 1 to 4 bands"
            ),
            Self::Config(msg) => write!(f, "{msg}"),
            Self::QuantizationAlloc { bytes } => {
                write!(f, "cannot allocate {bytes} bytes for the color histogram")
            }
            Self::TileInsert {
                row,
                col,
                zoom_level,
                source,
            } => write!(
                f,
                "failure when inserting tile (row={row},col={col}) at zoom_level={zoom_level}: {source}"
            ),
            Self::TileDelete {
                row,
                col,
                zoom_level,
                source,
            } => write!(
                f,
                "failure when deleting tile (row={row},col={col}) at zoom_level={zoom_level}: {source}"
            ),
            Self::BatchAborted => write!(f, "a previous tile batch failed to commit"),
            Self::RecursiveWrite => write!(f, "recursive call to tile writing"),
            Self::GeoreferencingNotSet => write!(
                f,
                "writing tiles not supported when the georeferencing is not set"
            ),
            Self::TableNotFound { table_name } => {
                write!(f, "tile table not found: {table_name}")
            }
            Self::TableAlreadyExists { table_name } => {
                write!(f, "table already exists: {table_name}")
            }
            Self::MissingSpatialRefSysId { srs_id } => {
                write!(f, "srs_id {srs_id} not found in gpkg_spatial_ref_sys")
            }
            Self::FileAlreadyExists(path) => write!(f, "GeoPackage file already exists: {path}"),
            Self::FileNotFound(path) => write!(f, "GeoPackage file does not exist: {path}"),
            Self::Overview(msg) => write!(f, "{msg}"),
            Self::Cancelled => write!(f, "operation cancelled by the progress callback"),
            Self::InvalidArgument(msg) => write!(f, "{msg}"),
            Self::ReadOnly => write!(f, "operation not allowed on read-only connection"),
        }
    }
}

impl Error for GpkgError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sql(err) => Some(err),
            Self::Image(err) => Some(err),
            Self::PngDecode(err) => Some(err),
            Self::PngEncode(err) => Some(err),
            Self::TileInsert { source, .. } | Self::TileDelete { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl GpkgError {
    /// Errors that a tile read masks by substituting an empty tile.
    pub(crate) fn is_tile_corruption(&self) -> bool {
        matches!(
            self,
            Self::Decode(_)
                | Self::ShapeMismatch { .. }
                | Self::Image(_)
                | Self::PngDecode(_)
        )
    }
}

impl From<rusqlite::Error> for GpkgError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Sql(err)
    }
}

impl From<image::ImageError> for GpkgError {
    fn from(err: image::ImageError) -> Self {
        Self::Image(err)
    }
}

impl From<png::DecodingError> for GpkgError {
    fn from(err: png::DecodingError) -> Self {
        Self::PngDecode(err)
    }
}

impl From<png::EncodingError> for GpkgError {
    fn from(err: png::EncodingError) -> Self {
        Self::PngEncode(err)
    }
}

pub type Result<T> = std::result::Result<T, GpkgError>;
