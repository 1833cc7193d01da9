use crate::error::{GpkgError, Result};
use crate::options::ZoomLevelStrategy;

/// Highest zoom level the tiling schemes are searched through.
pub(crate) const MAX_ZOOM_LEVEL: u32 = 25;

const WEB_MERCATOR_PIXEL_SIZE_ZOOM0: f64 = 156_543.033_928_041;
const WEB_MERCATOR_HALF_EXTENT: f64 = WEB_MERCATOR_PIXEL_SIZE_ZOOM0 * 256.0 / 2.0;

/// A well-known tile matrix set: SRS, origin and resolution at zoom level 0.
#[derive(Debug, PartialEq)]
pub struct TilingScheme {
    pub name: &'static str,
    pub epsg_code: i32,
    pub min_x: f64,
    pub max_y: f64,
    pub tile_matrix_width_zoom0: u32,
    pub tile_matrix_height_zoom0: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub pixel_x_size_zoom0: f64,
    pub pixel_y_size_zoom0: f64,
}

pub const TILING_SCHEMES: [TilingScheme; 5] = [
    TilingScheme {
        name: "GoogleCRS84Quad",
        epsg_code: 4326,
        min_x: -180.0,
        max_y: 180.0,
        tile_matrix_width_zoom0: 1,
        tile_matrix_height_zoom0: 1,
        tile_width: 256,
        tile_height: 256,
        pixel_x_size_zoom0: 360.0 / 256.0,
        pixel_y_size_zoom0: 360.0 / 256.0,
    },
    TilingScheme {
        name: "GoogleMapsCompatible",
        epsg_code: 3857,
        min_x: -WEB_MERCATOR_HALF_EXTENT,
        max_y: WEB_MERCATOR_HALF_EXTENT,
        tile_matrix_width_zoom0: 1,
        tile_matrix_height_zoom0: 1,
        tile_width: 256,
        tile_height: 256,
        pixel_x_size_zoom0: WEB_MERCATOR_PIXEL_SIZE_ZOOM0,
        pixel_y_size_zoom0: WEB_MERCATOR_PIXEL_SIZE_ZOOM0,
    },
    TilingScheme {
        name: "InspireCRS84Quad",
        epsg_code: 4326,
        min_x: -180.0,
        max_y: 90.0,
        tile_matrix_width_zoom0: 2,
        tile_matrix_height_zoom0: 1,
        tile_width: 256,
        tile_height: 256,
        pixel_x_size_zoom0: 180.0 / 256.0,
        pixel_y_size_zoom0: 180.0 / 256.0,
    },
    TilingScheme {
        name: "PseudoTMS_GlobalGeodetic",
        epsg_code: 4326,
        min_x: -180.0,
        max_y: 90.0,
        tile_matrix_width_zoom0: 2,
        tile_matrix_height_zoom0: 1,
        tile_width: 256,
        tile_height: 256,
        pixel_x_size_zoom0: 180.0 / 256.0,
        pixel_y_size_zoom0: 180.0 / 256.0,
    },
    TilingScheme {
        name: "PseudoTMS_GlobalMercator",
        epsg_code: 3857,
        min_x: -20_037_508.34,
        max_y: 20_037_508.34,
        tile_matrix_width_zoom0: 2,
        tile_matrix_height_zoom0: 2,
        tile_width: 256,
        tile_height: 256,
        pixel_x_size_zoom0: 78_271.516,
        pixel_y_size_zoom0: 78_271.516,
    },
];

impl TilingScheme {
    /// Look up a scheme by name, ignoring ASCII case.
    pub fn by_name(name: &str) -> Option<&'static TilingScheme> {
        TILING_SCHEMES
            .iter()
            .find(|scheme| scheme.name.eq_ignore_ascii_case(name))
    }

    pub fn pixel_x_size(&self, zoom_level: u32) -> f64 {
        self.pixel_x_size_zoom0 / f64::from(1u32 << zoom_level)
    }

    pub fn pixel_y_size(&self, zoom_level: u32) -> f64 {
        self.pixel_y_size_zoom0 / f64::from(1u32 << zoom_level)
    }

    /// The zoom level whose pixel size equals `pixel_x_size` (relative
    /// tolerance 1e-8).
    pub fn zoom_level_for_pixel_size(&self, pixel_x_size: f64) -> Result<u32> {
        (0..MAX_ZOOM_LEVEL)
            .find(|&zoom| {
                let expected = self.pixel_x_size(zoom);
                (pixel_x_size - expected).abs() < 1e-8 * expected
            })
            .ok_or_else(|| {
                GpkgError::Config(format!(
                    "Could not find an appropriate zoom level of {} tiling scheme that matches raster pixel size",
                    self.name
                ))
            })
    }

    /// Snap an arbitrary resolution onto one of the scheme's zoom levels.
    pub fn snap_zoom_level(&self, resolution: f64, strategy: ZoomLevelStrategy) -> Result<u32> {
        let mut previous = 0.0;
        let mut current = 0.0;
        let mut zoom = 0;
        while zoom < MAX_ZOOM_LEVEL {
            current = self.pixel_x_size(zoom);
            if resolution > current || (resolution - current).abs() / current <= 1e-8 {
                break;
            }
            previous = current;
            zoom += 1;
        }
        if zoom == MAX_ZOOM_LEVEL {
            return Err(GpkgError::Config(
                "Could not find an appropriate zoom level".to_string(),
            ));
        }
        if zoom > 0 && (resolution - current).abs() / current > 1e-8 {
            match strategy {
                ZoomLevelStrategy::Lower => zoom -= 1,
                ZoomLevelStrategy::Upper => {}
                ZoomLevelStrategy::Auto => {
                    if previous / resolution < resolution / current {
                        zoom -= 1;
                    }
                }
            }
        }
        Ok(zoom)
    }
}

/// Zoom level used for a `CUSTOM` scheme: the smallest level whose halved
/// raster fits in a single tile.
pub(crate) fn custom_zoom_level(
    raster_width: u32,
    raster_height: u32,
    tile_width: u32,
    tile_height: u32,
) -> u32 {
    let mut zoom = 0;
    while zoom < 31 && ((raster_width >> zoom) > tile_width || (raster_height >> zoom) > tile_height)
    {
        zoom += 1;
    }
    zoom
}

pub(crate) fn div_round_up(value: u32, divisor: u32) -> u32 {
    value.div_ceil(divisor)
}

/// Offset between the raster origin and the tile matrix origin.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PixelShift {
    /// Whole tiles between the matrix origin and the raster origin.
    pub x_tiles: i32,
    pub y_tiles: i32,
    /// Remaining sub-tile offset, always in `0..tile_size`.
    pub x_pixels_mod: u32,
    pub y_pixels_mod: u32,
}

impl PixelShift {
    pub fn compute(
        geo_transform: &[f64; 6],
        tms_min_x: f64,
        tms_max_y: f64,
        tile_width: u32,
        tile_height: u32,
    ) -> Self {
        let shift_x_pixels = (0.5 + (geo_transform[0] - tms_min_x) / geo_transform[1]).floor() as i64;
        let shift_y_pixels = (0.5 + (geo_transform[3] - tms_max_y) / geo_transform[5]).floor() as i64;
        let (x_tiles, x_mod) = split_shift(shift_x_pixels, tile_width);
        let (y_tiles, y_mod) = split_shift(shift_y_pixels, tile_height);
        Self {
            x_tiles,
            y_tiles,
            x_pixels_mod: x_mod,
            y_pixels_mod: y_mod,
        }
    }

    pub fn is_aligned(&self) -> bool {
        self.x_pixels_mod == 0 && self.y_pixels_mod == 0
    }
}

fn split_shift(pixels: i64, tile: u32) -> (i32, u32) {
    let tile = i64::from(tile);
    (pixels.div_euclid(tile) as i32, pixels.rem_euclid(tile) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_name() {
        let scheme = TilingScheme::by_name("googlemapscompatible").expect("known scheme");
        assert_eq!(scheme.epsg_code, 3857);
        assert!((scheme.min_x + 20_037_508.342_789_244).abs() < 1e-6);
        assert!(TilingScheme::by_name("unknown").is_none());
    }

    #[test]
    fn exact_zoom_level_lookup() -> Result<()> {
        let scheme = TilingScheme::by_name("GoogleCRS84Quad").expect("known scheme");
        assert_eq!(scheme.zoom_level_for_pixel_size(360.0 / 256.0 / 8.0)?, 3);
        assert!(scheme.zoom_level_for_pixel_size(0.3).is_err());
        Ok(())
    }

    #[test]
    fn zoom_strategy() -> Result<()> {
        let scheme = TilingScheme::by_name("InspireCRS84Quad").expect("known scheme");
        // between zoom 2 (0.17578125) and zoom 3 (0.087890625), closer to zoom 3
        let res = 0.1;
        assert_eq!(scheme.snap_zoom_level(res, ZoomLevelStrategy::Auto)?, 3);
        assert_eq!(scheme.snap_zoom_level(res, ZoomLevelStrategy::Lower)?, 2);
        assert_eq!(scheme.snap_zoom_level(res, ZoomLevelStrategy::Upper)?, 3);
        // closer to zoom 2
        assert_eq!(scheme.snap_zoom_level(0.16, ZoomLevelStrategy::Auto)?, 2);
        // exact match is kept whatever the strategy
        assert_eq!(
            scheme.snap_zoom_level(scheme.pixel_x_size(4), ZoomLevelStrategy::Lower)?,
            4
        );
        Ok(())
    }

    #[test]
    fn custom_zoom_level_fits_one_tile() {
        assert_eq!(custom_zoom_level(256, 256, 256, 256), 0);
        assert_eq!(custom_zoom_level(257, 100, 256, 256), 1);
        assert_eq!(custom_zoom_level(1000, 600, 256, 256), 2);
    }

    #[test]
    fn pixel_shift_is_euclidean() {
        let gt = [100.0, 1.0, 0.0, 0.0, 0.0, -1.0];
        let shift = PixelShift::compute(&gt, 0.0, 0.0, 256, 256);
        assert_eq!(shift.x_tiles, 0);
        assert_eq!(shift.x_pixels_mod, 100);
        assert!(!shift.is_aligned());

        let gt = [-100.0, 1.0, 0.0, 300.0, 0.0, -1.0];
        let shift = PixelShift::compute(&gt, 0.0, 556.0, 256, 256);
        assert_eq!(shift.x_tiles, -1);
        assert_eq!(shift.x_pixels_mod, 156);
        assert_eq!(shift.y_tiles, 1);
        assert_eq!(shift.y_pixels_mod, 0);
    }
}
