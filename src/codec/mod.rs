//! Tile image codecs.
//!
//! Tiles are stored as PNG, JPEG or WebP blobs. In memory they are always
//! band-sequential 8-bit planes: `planes[band * width * height + y * width + x]`.

mod png;
pub(crate) mod quantize;
pub(crate) mod select;

use image::{DynamicImage, ExtendedColorType, ImageEncoder, ImageFormat};

use crate::color_table::ColorTable;
use crate::error::{GpkgError, Result};
use crate::options::CodecOptions;

/// Image driver a tile blob is written with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TileDriver {
    Png,
    Jpeg,
    Webp,
}

impl TileDriver {
    /// Identify the driver from the blob signature.
    pub fn sniff(blob: &[u8]) -> Option<Self> {
        if blob.starts_with(b"\x89PNG\r\n\x1a\n") {
            Some(Self::Png)
        } else if blob.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(Self::Jpeg)
        } else if blob.len() >= 12 && &blob[..4] == b"RIFF" && &blob[8..12] == b"WEBP" {
            Some(Self::Webp)
        } else {
            None
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::Webp => "image/webp",
        }
    }
}

/// A decoded tile image.
#[derive(Clone, Debug)]
pub struct DecodedTile {
    pub width: u32,
    pub height: u32,
    pub bands: usize,
    /// Band-sequential samples; palette indices for paletted PNG.
    pub planes: Vec<u8>,
    pub palette: Option<ColorTable>,
    pub driver: TileDriver,
}

impl DecodedTile {
    pub fn plane_len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn plane(&self, band: usize) -> &[u8] {
        let len = self.plane_len();
        &self.planes[band * len..(band + 1) * len]
    }

    /// Whether rewriting these samples could lose information: anything that
    /// is not PNG, or a PNG whose palette is already full.
    pub fn is_lossy(&self) -> bool {
        self.driver != TileDriver::Png
            || self.palette.as_ref().is_some_and(|ct| ct.len() == 256)
    }
}

/// Decode a tile blob of any supported driver.
pub fn decode_tile(blob: &[u8]) -> Result<DecodedTile> {
    match TileDriver::sniff(blob) {
        Some(TileDriver::Png) => png::decode(blob),
        Some(driver @ TileDriver::Jpeg) => decode_with_image(blob, ImageFormat::Jpeg, driver),
        Some(driver @ TileDriver::Webp) => decode_with_image(blob, ImageFormat::WebP, driver),
        None => Err(GpkgError::Decode("unrecognized tile image signature".to_string())),
    }
}

fn decode_with_image(blob: &[u8], format: ImageFormat, driver: TileDriver) -> Result<DecodedTile> {
    let image = image::load_from_memory_with_format(blob, format)?;
    let (width, height) = (image.width(), image.height());
    let (bands, interleaved) = match image {
        DynamicImage::ImageLuma8(buf) => (1, buf.into_raw()),
        DynamicImage::ImageLumaA8(buf) => (2, buf.into_raw()),
        DynamicImage::ImageRgb8(buf) => (3, buf.into_raw()),
        DynamicImage::ImageRgba8(buf) => (4, buf.into_raw()),
        other => (4, other.to_rgba8().into_raw()),
    };
    let pixels = width as usize * height as usize;
    let mut planes = vec![0; pixels * bands];
    for (i, pixel) in interleaved.chunks_exact(bands).enumerate() {
        for (band, value) in pixel.iter().enumerate() {
            planes[band * pixels + i] = *value;
        }
    }
    Ok(DecodedTile {
        width,
        height,
        bands,
        planes,
        palette: None,
        driver,
    })
}

/// Encode `planes` (1 to 4 of them) with `driver`. The palette is only used
/// for single-plane PNG output.
pub fn encode_tile(
    driver: TileDriver,
    planes: &[&[u8]],
    width: u32,
    height: u32,
    palette: Option<&ColorTable>,
    options: &CodecOptions,
) -> Result<Vec<u8>> {
    match driver {
        TileDriver::Png => png::encode(planes, width, height, palette, options.zlevel),
        TileDriver::Jpeg => {
            let color = match planes.len() {
                1 => ExtendedColorType::L8,
                3 => ExtendedColorType::Rgb8,
                n => {
                    return Err(GpkgError::InvalidArgument(format!(
                        "cannot encode {n} bands as JPEG"
                    )));
                }
            };
            let data = png::interleave(planes, width as usize * height as usize);
            let mut out = Vec::new();
            image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, options.quality)
                .write_image(&data, width, height, color)?;
            Ok(out)
        }
        TileDriver::Webp => {
            // the WebP encoder is lossless only, so QUALITY has no effect
            let color = match planes.len() {
                3 => ExtendedColorType::Rgb8,
                4 => ExtendedColorType::Rgba8,
                n => {
                    return Err(GpkgError::InvalidArgument(format!(
                        "cannot encode {n} bands as WEBP"
                    )));
                }
            };
            let data = png::interleave(planes, width as usize * height as usize);
            let mut out = Vec::new();
            image::codecs::webp::WebPEncoder::new_lossless(&mut out)
                .write_image(&data, width, height, color)?;
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color_table::ColorEntry;

    #[test]
    fn sniff_signatures() {
        assert_eq!(TileDriver::sniff(b"\x89PNG\r\n\x1a\n...."), Some(TileDriver::Png));
        assert_eq!(TileDriver::sniff(&[0xFF, 0xD8, 0xFF, 0xE0]), Some(TileDriver::Jpeg));
        assert_eq!(TileDriver::sniff(b"RIFF\0\0\0\0WEBPVP8L"), Some(TileDriver::Webp));
        assert_eq!(TileDriver::sniff(b"GIF89a"), None);
    }

    #[test]
    fn garbage_is_a_decode_error() {
        match decode_tile(b"not an image").unwrap_err() {
            GpkgError::Decode(_) => {}
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(decode_tile(b"\x89PNG\r\n\x1a\ntruncated").is_err());
    }

    #[test]
    fn jpeg_is_lossy_and_close() -> Result<()> {
        let r = vec![200u8; 64];
        let g = vec![100u8; 64];
        let b = vec![50u8; 64];
        let blob = encode_tile(
            TileDriver::Jpeg,
            &[&r[..], &g[..], &b[..]],
            8,
            8,
            None,
            &CodecOptions::default(),
        )?;
        let tile = decode_tile(&blob)?;
        assert_eq!(tile.driver, TileDriver::Jpeg);
        assert_eq!(tile.bands, 3);
        assert!(tile.is_lossy());
        assert!(tile.plane(0).iter().all(|v| v.abs_diff(200) <= 5));
        assert!(tile.plane(2).iter().all(|v| v.abs_diff(50) <= 5));
        Ok(())
    }

    #[test]
    fn webp_lossless_round_trip() -> Result<()> {
        let planes: Vec<Vec<u8>> = (0..4u8)
            .map(|band| (0..16u8).map(|i| i * 10 + band).collect())
            .collect();
        let refs: Vec<&[u8]> = planes.iter().map(Vec::as_slice).collect();
        let blob = encode_tile(TileDriver::Webp, &refs, 4, 4, None, &CodecOptions::default())?;
        assert_eq!(TileDriver::sniff(&blob), Some(TileDriver::Webp));
        let tile = decode_tile(&blob)?;
        assert_eq!(tile.bands, 4);
        assert_eq!(tile.plane(1), planes[1].as_slice());
        assert_eq!(tile.plane(3), planes[3].as_slice());
        Ok(())
    }

    #[test]
    fn full_palette_png_counts_as_lossy() -> Result<()> {
        let full = ColorTable::new((0..=255u8).map(|v| ColorEntry::rgb(v, v, v)).collect());
        let indices = [0u8, 255, 17, 3];
        let blob = encode_tile(
            TileDriver::Png,
            &[&indices[..]],
            2,
            2,
            Some(&full),
            &CodecOptions::default(),
        )?;
        assert!(decode_tile(&blob)?.is_lossy());

        let small = ColorTable::new(vec![ColorEntry::rgb(0, 0, 0), ColorEntry::rgb(9, 9, 9)]);
        let indices = [0u8, 1, 1, 0];
        let blob = encode_tile(
            TileDriver::Png,
            &[&indices[..]],
            2,
            2,
            Some(&small),
            &CodecOptions::default(),
        )?;
        assert!(!decode_tile(&blob)?.is_lossy());
        Ok(())
    }

    #[test]
    fn jpeg_rejects_alpha() {
        let plane = [0u8; 4];
        let err = encode_tile(
            TileDriver::Jpeg,
            &[&plane[..], &plane[..]],
            2,
            2,
            None,
            &CodecOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, GpkgError::InvalidArgument(_)));
    }
}
