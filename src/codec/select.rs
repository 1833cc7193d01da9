//! Choice of driver and band layout for an outgoing tile.

use crate::options::TileFormat;

use super::TileDriver;

/// What the chosen driver can store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Capabilities {
    pub(crate) one_band: bool,
    pub(crate) two_bands: bool,
    pub(crate) four_bands: bool,
    pub(crate) color_table: bool,
}

impl Capabilities {
    const PNG: Self = Self {
        one_band: true,
        two_bands: true,
        four_bands: true,
        color_table: true,
    };
    const JPEG: Self = Self {
        one_band: true,
        two_bands: false,
        four_bands: false,
        color_table: false,
    };
    const WEBP: Self = Self {
        one_band: false,
        two_bands: false,
        four_bands: true,
        color_table: false,
    };
}

/// Facts about the tile being written.
#[derive(Clone, Copy, Debug)]
pub(crate) struct TileContent {
    pub(crate) dataset_bands: usize,
    pub(crate) has_color_table: bool,
    pub(crate) color_table_has_transparency: bool,
    /// Straddles the raster edge.
    pub(crate) partial: bool,
    pub(crate) all_opaque: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Encoding {
    pub(crate) driver: TileDriver,
    pub(crate) tile_bands: usize,
}

impl Encoding {
    /// Dataset plane feeding output band `band`.
    pub(crate) fn source_plane(&self, content: &TileContent, band: usize) -> usize {
        match (content.dataset_bands, self.tile_bands) {
            (1, 3) if !content.has_color_table => 0,
            (1, 4) if !content.has_color_table && content.partial => {
                if band < 3 { 0 } else { 3 }
            }
            (2, n) if n >= 3 => {
                if band < 3 { 0 } else { 1 }
            }
            _ => band,
        }
    }

    /// Whether band `tile_bands - 1` is an alpha band synthesized from the
    /// valid area of a partial tile.
    pub(crate) fn needs_synthetic_alpha(&self, content: &TileContent) -> bool {
        content.partial && matches!(self.tile_bands, 2 | 4)
    }
}

pub(crate) fn select_encoding(format: TileFormat, content: &TileContent) -> Encoding {
    let bands = content.dataset_bands;
    let (driver, caps) = match format {
        TileFormat::PngJpeg => {
            let needs_png = content.partial
                || (matches!(bands, 2 | 4) && !content.all_opaque)
                || content.has_color_table;
            if needs_png {
                (TileDriver::Png, Capabilities::PNG)
            } else {
                (TileDriver::Jpeg, Capabilities::JPEG)
            }
        }
        TileFormat::Png | TileFormat::Png8 => (TileDriver::Png, Capabilities::PNG),
        TileFormat::Jpeg => (TileDriver::Jpeg, Capabilities::JPEG),
        TileFormat::Webp => (TileDriver::Webp, Capabilities::WEBP),
    };

    let opaque = content.all_opaque;
    let ct = content.has_color_table;
    let partial = content.partial;
    let tile_bands = if partial && bands == 1 && !ct && caps.two_bands {
        2
    } else if partial && caps.four_bands {
        4
    } else if format == TileFormat::Png8 && bands >= 3 && opaque && !partial {
        1
    } else if bands == 2 {
        if opaque {
            if caps.two_bands { 1 } else { 3 }
        } else if !caps.two_bands {
            if caps.four_bands { 4 } else { 3 }
        } else {
            bands
        }
    } else if bands == 4 && (opaque || !caps.four_bands) {
        3
    } else if bands == 1 && ct && !caps.color_table {
        if caps.four_bands && content.color_table_has_transparency {
            4
        } else {
            3
        }
    } else if bands == 1 && !ct && !caps.one_band {
        3
    } else {
        bands
    };

    Encoding { driver, tile_bands }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content(bands: usize) -> TileContent {
        TileContent {
            dataset_bands: bands,
            has_color_table: false,
            color_table_has_transparency: false,
            partial: false,
            all_opaque: true,
        }
    }

    #[test]
    fn png_jpeg_picks_jpeg_for_opaque_interior_tiles() {
        let enc = select_encoding(TileFormat::PngJpeg, &content(4));
        assert_eq!(enc, Encoding { driver: TileDriver::Jpeg, tile_bands: 3 });

        let translucent = TileContent { all_opaque: false, ..content(4) };
        let enc = select_encoding(TileFormat::PngJpeg, &translucent);
        assert_eq!(enc, Encoding { driver: TileDriver::Png, tile_bands: 4 });
    }

    #[test]
    fn partial_tiles_gain_alpha() {
        let partial = TileContent { partial: true, ..content(1) };
        let enc = select_encoding(TileFormat::Png, &partial);
        assert_eq!(enc.tile_bands, 2);
        assert!(enc.needs_synthetic_alpha(&partial));

        let partial_rgb = TileContent { partial: true, ..content(3) };
        let enc = select_encoding(TileFormat::PngJpeg, &partial_rgb);
        assert_eq!(enc, Encoding { driver: TileDriver::Png, tile_bands: 4 });

        // JPEG cannot carry alpha at all
        let enc = select_encoding(TileFormat::Jpeg, &partial_rgb);
        assert_eq!(enc.tile_bands, 3);
    }

    #[test]
    fn png8_goes_to_one_band_for_opaque_rgb() {
        let enc = select_encoding(TileFormat::Png8, &content(3));
        assert_eq!(enc, Encoding { driver: TileDriver::Png, tile_bands: 1 });
        let translucent = TileContent { all_opaque: false, ..content(4) };
        assert_eq!(select_encoding(TileFormat::Png8, &translucent).tile_bands, 4);
    }

    #[test]
    fn gray_alpha_datasets() {
        assert_eq!(select_encoding(TileFormat::Png, &content(2)).tile_bands, 1);
        assert_eq!(select_encoding(TileFormat::Jpeg, &content(2)).tile_bands, 3);
        let translucent = TileContent { all_opaque: false, ..content(2) };
        assert_eq!(select_encoding(TileFormat::Png, &translucent).tile_bands, 2);
        assert_eq!(select_encoding(TileFormat::Webp, &translucent).tile_bands, 4);

        let enc = select_encoding(TileFormat::Webp, &translucent);
        assert_eq!(enc.source_plane(&translucent, 0), 0);
        assert_eq!(enc.source_plane(&translucent, 2), 0);
        assert_eq!(enc.source_plane(&translucent, 3), 1);
    }

    #[test]
    fn paletted_datasets_expand_without_palette_support() {
        let paletted = TileContent { has_color_table: true, ..content(1) };
        assert_eq!(select_encoding(TileFormat::Png, &paletted).tile_bands, 1);
        assert_eq!(select_encoding(TileFormat::Webp, &paletted).tile_bands, 3);
        let with_holes = TileContent { color_table_has_transparency: true, ..paletted };
        assert_eq!(select_encoding(TileFormat::Webp, &with_holes).tile_bands, 4);
        // PNG_JPEG always picks PNG when a palette is attached
        assert_eq!(
            select_encoding(TileFormat::PngJpeg, &paletted).driver,
            TileDriver::Png
        );
    }

    #[test]
    fn gray_without_one_band_support() {
        let gray = content(1);
        let enc = select_encoding(TileFormat::Webp, &gray);
        assert_eq!(enc.tile_bands, 3);
        assert_eq!(enc.source_plane(&gray, 2), 0);
        assert_eq!(select_encoding(TileFormat::Jpeg, &gray).tile_bands, 1);
    }
}
