use std::fmt;
use std::str::FromStr;

use tracing::warn;

use crate::error::{GpkgError, Result};
use crate::tiling::TilingScheme;

/// Image format used to encode tiles.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TileFormat {
    /// PNG for tiles that need transparency or a palette, JPEG otherwise.
    #[default]
    PngJpeg,
    Png,
    /// Palette PNG, quantizing RGB(A) content down to 256 colors.
    Png8,
    Jpeg,
    Webp,
}

impl TileFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PngJpeg => "PNG_JPEG",
            Self::Png => "PNG",
            Self::Png8 => "PNG8",
            Self::Jpeg => "JPEG",
            Self::Webp => "WEBP",
        }
    }

    /// Lenient parsing: anything unknown falls back to `PNG_JPEG`.
    pub fn parse_lenient(value: &str) -> Self {
        value.parse().unwrap_or_default()
    }
}

impl FromStr for TileFormat {
    type Err = GpkgError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PNG_JPEG" | "AUTO" => Ok(Self::PngJpeg),
            "PNG" => Ok(Self::Png),
            "PNG8" => Ok(Self::Png8),
            "JPEG" => Ok(Self::Jpeg),
            "WEBP" => Ok(Self::Webp),
            other => Err(GpkgError::Config(format!("unsupported TILE_FORMAT: {other}"))),
        }
    }
}

impl fmt::Display for TileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a requested resolution snaps onto a tiling scheme zoom level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ZoomLevelStrategy {
    /// Closest zoom level.
    #[default]
    Auto,
    /// Coarser zoom level.
    Lower,
    /// Finer zoom level.
    Upper,
}

impl FromStr for ZoomLevelStrategy {
    type Err = GpkgError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "AUTO" => Ok(Self::Auto),
            "LOWER" => Ok(Self::Lower),
            "UPPER" => Ok(Self::Upper),
            other => Err(GpkgError::Config(format!(
                "unsupported ZOOM_LEVEL_STRATEGY: {other}"
            ))),
        }
    }
}

/// Resampling kernels available for overview generation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResamplingMethod {
    #[default]
    Nearest,
    Bilinear,
    Cubic,
    CubicSpline,
    Lanczos,
    Mode,
    Average,
    Rms,
}

impl FromStr for ResamplingMethod {
    type Err = GpkgError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "NEAREST" => Ok(Self::Nearest),
            "BILINEAR" => Ok(Self::Bilinear),
            "CUBIC" => Ok(Self::Cubic),
            "CUBICSPLINE" => Ok(Self::CubicSpline),
            "LANCZOS" => Ok(Self::Lanczos),
            "MODE" => Ok(Self::Mode),
            "AVERAGE" => Ok(Self::Average),
            "RMS" => Ok(Self::Rms),
            other => Err(GpkgError::Config(format!(
                "unsupported resampling method: {other}"
            ))),
        }
    }
}

pub const DEFAULT_QUALITY: u8 = 75;
pub const DEFAULT_ZLEVEL: u8 = 6;
pub const DEFAULT_BLOCK_SIZE: u32 = 256;
pub const MIN_BLOCK_SIZE: u32 = 8;
pub const MAX_BLOCK_SIZE: u32 = 4096;

/// Encoder settings shared by a dataset and its overviews.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodecOptions {
    pub tile_format: TileFormat,
    /// JPEG quality, 1-100.
    pub quality: u8,
    /// PNG deflate level, 1-9.
    pub zlevel: u8,
    /// Floyd-Steinberg dithering for PNG8.
    pub dither: bool,
}

impl Default for CodecOptions {
    fn default() -> Self {
        Self {
            tile_format: TileFormat::PngJpeg,
            quality: DEFAULT_QUALITY,
            zlevel: DEFAULT_ZLEVEL,
            dither: false,
        }
    }
}

/// Options for `Gpkg::create_raster`.
#[derive(Clone, Debug, PartialEq)]
pub struct RasterCreateOptions {
    pub codec: CodecOptions,
    pub block_width: u32,
    pub block_height: u32,
    /// `None` is the `CUSTOM` scheme.
    pub tiling_scheme: Option<&'static TilingScheme>,
    pub zoom_level_strategy: ZoomLevelStrategy,
    pub identifier: Option<String>,
    pub description: Option<String>,
}

impl Default for RasterCreateOptions {
    fn default() -> Self {
        Self {
            codec: CodecOptions::default(),
            block_width: DEFAULT_BLOCK_SIZE,
            block_height: DEFAULT_BLOCK_SIZE,
            tiling_scheme: None,
            zoom_level_strategy: ZoomLevelStrategy::Auto,
            identifier: None,
            description: None,
        }
    }
}

impl RasterCreateOptions {
    /// Build options from `KEY=VALUE` style pairs. Keys are case-insensitive.
    pub fn from_options(options: &[(&str, &str)]) -> Result<Self> {
        let mut out = Self::default();
        let mut block_size = None;
        let mut block_x = None;
        let mut block_y = None;
        for (key, value) in options {
            match key.to_ascii_uppercase().as_str() {
                "TILE_FORMAT" => out.codec.tile_format = TileFormat::parse_lenient(value),
                "QUALITY" => out.codec.quality = parse_ranged("QUALITY", value, 1, 100)?,
                "ZLEVEL" => out.codec.zlevel = parse_ranged("ZLEVEL", value, 1, 9)?,
                "DITHER" => out.codec.dither = parse_bool(value),
                "BLOCKSIZE" => block_size = Some(parse_block_size(value)?),
                "BLOCKXSIZE" => block_x = Some(parse_block_size(value)?),
                "BLOCKYSIZE" => block_y = Some(parse_block_size(value)?),
                "TILING_SCHEME" => {
                    out.tiling_scheme = if value.eq_ignore_ascii_case("CUSTOM") {
                        None
                    } else {
                        Some(TilingScheme::by_name(value).ok_or_else(|| {
                            GpkgError::Config(format!("unsupported TILING_SCHEME: {value}"))
                        })?)
                    }
                }
                "ZOOM_LEVEL_STRATEGY" => out.zoom_level_strategy = value.parse()?,
                "IDENTIFIER" => out.identifier = Some(value.to_string()),
                "DESCRIPTION" => out.description = Some(value.to_string()),
                other => warn!("ignoring unknown creation option {other}"),
            }
        }
        let size = block_size.unwrap_or(DEFAULT_BLOCK_SIZE);
        out.block_width = block_x.unwrap_or(size);
        out.block_height = block_y.unwrap_or(size);
        out.validate()?;
        Ok(out)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        for size in [self.block_width, self.block_height] {
            if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&size) {
                return Err(GpkgError::Config("Invalid block dimensions".to_string()));
            }
        }
        if let Some(scheme) = self.tiling_scheme {
            if self.block_width != scheme.tile_width || self.block_height != scheme.tile_height {
                return Err(GpkgError::Config(format!(
                    "Tile dimension should be {}x{} for {} tiling scheme",
                    scheme.tile_width, scheme.tile_height, scheme.name
                )));
            }
        }
        Ok(())
    }
}

/// Options for `Gpkg::open_raster`.
#[derive(Clone, Debug, PartialEq)]
pub struct RasterOpenOptions {
    /// Number of bands exposed, 1-4.
    pub band_count: usize,
    /// Open this zoom level as the full resolution level.
    pub zoom_level: Option<i32>,
    /// Derive the extent from the tiles present at the full resolution level.
    pub use_tile_extent: bool,
    pub min_x: Option<f64>,
    pub min_y: Option<f64>,
    pub max_x: Option<f64>,
    pub max_y: Option<f64>,
    /// Overrides the format of newly written tiles (update mode only).
    pub tile_format: Option<TileFormat>,
    pub quality: u8,
    pub zlevel: u8,
    pub dither: bool,
}

impl Default for RasterOpenOptions {
    fn default() -> Self {
        Self {
            band_count: 4,
            zoom_level: None,
            use_tile_extent: false,
            min_x: None,
            min_y: None,
            max_x: None,
            max_y: None,
            tile_format: None,
            quality: DEFAULT_QUALITY,
            zlevel: DEFAULT_ZLEVEL,
            dither: false,
        }
    }
}

impl RasterOpenOptions {
    pub fn from_options(options: &[(&str, &str)]) -> Result<Self> {
        let mut out = Self::default();
        for (key, value) in options {
            match key.to_ascii_uppercase().as_str() {
                "BAND_COUNT" => {
                    out.band_count = match value.trim().parse::<usize>() {
                        Ok(n) if (1..=4).contains(&n) => n,
                        _ => 4,
                    }
                }
                "ZOOM_LEVEL" => out.zoom_level = Some(parse_number("ZOOM_LEVEL", value)?),
                "USE_TILE_EXTENT" => out.use_tile_extent = parse_bool(value),
                "MINX" => out.min_x = Some(parse_number("MINX", value)?),
                "MINY" => out.min_y = Some(parse_number("MINY", value)?),
                "MAXX" => out.max_x = Some(parse_number("MAXX", value)?),
                "MAXY" => out.max_y = Some(parse_number("MAXY", value)?),
                "TILE_FORMAT" => out.tile_format = Some(TileFormat::parse_lenient(value)),
                "QUALITY" => out.quality = parse_ranged("QUALITY", value, 1, 100)?,
                "ZLEVEL" => out.zlevel = parse_ranged("ZLEVEL", value, 1, 9)?,
                "DITHER" => out.dither = parse_bool(value),
                other => warn!("ignoring unknown open option {other}"),
            }
        }
        Ok(out)
    }
}

/// `NO`, `FALSE`, `OFF` and `0` are false, anything else is true.
pub(crate) fn parse_bool(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_uppercase().as_str(),
        "NO" | "FALSE" | "OFF" | "0"
    )
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| GpkgError::Config(format!("invalid value for {key}: {value}")))
}

fn parse_ranged(key: &str, value: &str, min: u8, max: u8) -> Result<u8> {
    let n: i64 = parse_number(key, value)?;
    if n < min as i64 || n > max as i64 {
        return Err(GpkgError::Config(format!(
            "{key} must be between {min} and {max}, got {n}"
        )));
    }
    Ok(n as u8)
}

fn parse_block_size(value: &str) -> Result<u32> {
    let n: i64 = parse_number("BLOCKSIZE", value)?;
    if n < MIN_BLOCK_SIZE as i64 || n > MAX_BLOCK_SIZE as i64 {
        return Err(GpkgError::Config("Invalid block dimensions".to_string()));
    }
    Ok(n as u32)
}
