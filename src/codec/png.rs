use std::borrow::Cow;

use crate::color_table::{ColorEntry, ColorTable};
use crate::error::{GpkgError, Result};

use super::{DecodedTile, TileDriver};

/// Decode a PNG blob into band-sequential planes, keeping palette indices.
pub(crate) fn decode(blob: &[u8]) -> Result<DecodedTile> {
    let mut decoder = png::Decoder::new(blob);
    decoder.set_transformations(png::Transformations::STRIP_16);
    let mut reader = decoder.read_info()?;

    let palette = {
        let info = reader.info();
        info.palette.as_ref().map(|rgb| {
            let trns: &[u8] = info.trns.as_deref().unwrap_or(&[]);
            palette_from_png(rgb, trns)
        })
    };

    let mut buf = vec![0; reader.output_buffer_size()];
    let frame = reader.next_frame(&mut buf)?;
    let width = frame.width;
    let height = frame.height;
    let pixels = width as usize * height as usize;

    let bands = match frame.color_type {
        png::ColorType::Grayscale | png::ColorType::Indexed => 1,
        png::ColorType::GrayscaleAlpha => 2,
        png::ColorType::Rgb => 3,
        png::ColorType::Rgba => 4,
    };

    let bit_depth = frame.bit_depth as u8;
    let mut planes = vec![0; pixels * bands];
    if bit_depth < 8 {
        // only single-sample color types allow sub-byte depths
        unpack_sub_byte(&buf, frame.line_size, width as usize, height as usize, bit_depth, &mut planes);
    } else {
        for y in 0..height as usize {
            let line = &buf[y * frame.line_size..];
            for x in 0..width as usize {
                for band in 0..bands {
                    planes[band * pixels + y * width as usize + x] = line[x * bands + band];
                }
            }
        }
    }

    let palette = if frame.color_type == png::ColorType::Indexed {
        palette
    } else {
        None
    };

    Ok(DecodedTile {
        width,
        height,
        bands,
        planes,
        palette,
        driver: TileDriver::Png,
    })
}

fn palette_from_png(rgb: &[u8], trns: &[u8]) -> ColorTable {
    let entries = rgb
        .chunks_exact(3)
        .enumerate()
        .map(|(i, c)| ColorEntry::rgba(c[0], c[1], c[2], trns.get(i).copied().unwrap_or(255)))
        .collect();
    ColorTable::new(entries)
}

fn unpack_sub_byte(
    buf: &[u8],
    line_size: usize,
    width: usize,
    height: usize,
    bit_depth: u8,
    out: &mut [u8],
) {
    let per_byte = 8 / bit_depth as usize;
    let mask = (1u8 << bit_depth) - 1;
    for y in 0..height {
        let line = &buf[y * line_size..(y + 1) * line_size];
        for x in 0..width {
            let byte = line[x / per_byte];
            let shift = 8 - bit_depth as usize * (x % per_byte + 1);
            out[y * width + x] = (byte >> shift) & mask;
        }
    }
}

/// `ZLEVEL` 1 to 9 folded onto the three presets png 0.17 exposes; levels
/// within a preset compress identically.
fn compression_for_level(zlevel: u8) -> png::Compression {
    match zlevel {
        0..=3 => png::Compression::Fast,
        4..=7 => png::Compression::Default,
        _ => png::Compression::Best,
    }
}

/// Encode 1 to 4 planes as an 8-bit PNG. A palette turns a single plane into
/// an indexed image.
pub(crate) fn encode(
    planes: &[&[u8]],
    width: u32,
    height: u32,
    palette: Option<&ColorTable>,
    zlevel: u8,
) -> Result<Vec<u8>> {
    let color = match (planes.len(), palette) {
        (1, Some(_)) => png::ColorType::Indexed,
        (1, None) => png::ColorType::Grayscale,
        (2, _) => png::ColorType::GrayscaleAlpha,
        (3, _) => png::ColorType::Rgb,
        (4, _) => png::ColorType::Rgba,
        (n, _) => {
            return Err(GpkgError::InvalidArgument(format!(
                "cannot encode {n} bands as PNG"
            )));
        }
    };

    let data = interleave(planes, width as usize * height as usize);
    let mut out = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut out, width, height);
        encoder.set_color(color);
        encoder.set_depth(png::BitDepth::Eight);
        encoder.set_compression(compression_for_level(zlevel));
        if let (png::ColorType::Indexed, Some(table)) = (color, palette) {
            let entries = &table.entries()[..table.len().min(256)];
            let rgb: Vec<u8> = entries.iter().flat_map(|e| [e.c1, e.c2, e.c3]).collect();
            encoder.set_palette(Cow::Owned(rgb));
            if let Some(last) = entries.iter().rposition(|e| e.c4 != 255) {
                let trns: Vec<u8> = entries[..=last].iter().map(|e| e.c4).collect();
                encoder.set_trns(Cow::Owned(trns));
            }
        }
        let mut writer = encoder.write_header()?;
        writer.write_image_data(&data)?;
        writer.finish()?;
    }
    Ok(out)
}

pub(crate) fn interleave(planes: &[&[u8]], pixels: usize) -> Vec<u8> {
    if let [single] = planes {
        return single[..pixels].to_vec();
    }
    let bands = planes.len();
    let mut data = vec![0; pixels * bands];
    for (band, plane) in planes.iter().enumerate() {
        for (i, value) in plane[..pixels].iter().enumerate() {
            data[i * bands + band] = *value;
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgba_round_trip() -> Result<()> {
        let r = [1u8, 2, 3, 4];
        let g = [5u8, 6, 7, 8];
        let b = [9u8, 10, 11, 12];
        let a = [255u8, 0, 128, 255];
        let blob = encode(&[&r[..], &g[..], &b[..], &a[..]], 2, 2, None, 6)?;
        let tile = decode(&blob)?;
        assert_eq!(tile.bands, 4);
        assert_eq!((tile.width, tile.height), (2, 2));
        assert_eq!(&tile.planes[..4], &r);
        assert_eq!(&tile.planes[12..], &a);
        assert!(tile.palette.is_none());
        Ok(())
    }

    #[test]
    fn indexed_round_trip_keeps_palette_and_alpha() -> Result<()> {
        let table = ColorTable::new(vec![
            ColorEntry::rgba(0, 0, 0, 0),
            ColorEntry::rgb(255, 0, 0),
            ColorEntry::rgb(0, 0, 255),
        ]);
        let indices = [0u8, 1, 2, 1, 0, 2];
        let blob = encode(&[&indices[..]], 3, 2, Some(&table), 9)?;
        let tile = decode(&blob)?;
        assert_eq!(tile.bands, 1);
        assert_eq!(tile.planes, indices);
        assert_eq!(tile.palette.as_ref(), Some(&table));
        Ok(())
    }

    #[test]
    fn sub_byte_samples_are_unpacked() {
        // two rows of 1-bit samples: 1010 and 0110
        let buf = [0b1010_0000u8, 0b0110_0000];
        let mut out = [0u8; 8];
        unpack_sub_byte(&buf, 1, 4, 2, 1, &mut out);
        assert_eq!(out, [1, 0, 1, 0, 0, 1, 1, 0]);
    }

    #[test]
    fn zlevels_fold_onto_presets() {
        assert!(matches!(compression_for_level(1), png::Compression::Fast));
        assert!(matches!(compression_for_level(6), png::Compression::Default));
        assert!(matches!(compression_for_level(9), png::Compression::Best));
    }
}
