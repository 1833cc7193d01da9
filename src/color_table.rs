use std::collections::HashMap;

/// One palette entry. `c1..c3` are red, green and blue; `c4` is alpha.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ColorEntry {
    pub c1: u8,
    pub c2: u8,
    pub c3: u8,
    pub c4: u8,
}

impl ColorEntry {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self {
            c1: r,
            c2: g,
            c3: b,
            c4: 255,
        }
    }

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self {
            c1: r,
            c2: g,
            c3: b,
            c4: a,
        }
    }
}

/// Palette of a single-band indexed dataset or tile.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ColorTable {
    entries: Vec<ColorEntry>,
}

impl ColorTable {
    pub fn new(entries: Vec<ColorEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[ColorEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ColorEntry> {
        self.entries.get(index)
    }

    pub(crate) fn has_transparent_entry(&self) -> bool {
        self.entries.iter().any(|entry| entry.c4 == 0)
    }

    /// RGBA lookup for all 256 index values; indices past the table are
    /// transparent black.
    pub(crate) fn expansion_lut(&self) -> [[u8; 4]; 256] {
        let mut lut = [[0u8; 4]; 256];
        for (slot, entry) in lut.iter_mut().zip(self.entries.iter()) {
            *slot = [entry.c1, entry.c2, entry.c3, entry.c4];
        }
        lut
    }

    /// Nearest entry by squared Euclidean distance over the first 256 entries.
    /// Alpha only counts when `with_alpha` is set. Ties keep the lowest index.
    pub fn find_best_entry(&self, c1: u8, c2: u8, c3: u8, c4: u8, with_alpha: bool) -> u8 {
        let mut best_index = 0;
        let mut best_distance = 4 * 256 * 256;
        for (i, entry) in self.entries.iter().take(256).enumerate() {
            let mut distance = square_diff(entry.c1, c1)
                + square_diff(entry.c2, c2)
                + square_diff(entry.c3, c3);
            if with_alpha {
                distance += square_diff(entry.c4, c4);
            }
            if distance < best_distance {
                best_index = i;
                best_distance = distance;
            }
        }
        best_index as u8
    }
}

fn square_diff(a: u8, b: u8) -> i32 {
    let d = i32::from(a) - i32::from(b);
    d * d
}

fn pack(c1: u8, c2: u8, c3: u8, c4: u8, with_alpha: bool) -> u32 {
    let mut value = u32::from(c1) | (u32::from(c2) << 8) | (u32::from(c3) << 16);
    if with_alpha {
        value |= u32::from(c4) << 24;
    }
    value
}

/// Maps RGB(A) pixels onto the indices of a dataset palette.
pub(crate) struct PaletteRemap<'a> {
    table: &'a ColorTable,
    exact: HashMap<u32, u8>,
    best_for_zero: u8,
    with_alpha: bool,
}

impl<'a> PaletteRemap<'a> {
    pub(crate) fn new(table: &'a ColorTable, with_alpha: bool) -> Self {
        let mut exact = HashMap::with_capacity(table.len().min(256));
        for (i, entry) in table.entries().iter().take(256).enumerate() {
            exact
                .entry(pack(entry.c1, entry.c2, entry.c3, entry.c4, with_alpha))
                .or_insert(i as u8);
        }
        Self {
            table,
            exact,
            best_for_zero: table.find_best_entry(0, 0, 0, 0, with_alpha),
            with_alpha,
        }
    }

    pub(crate) fn lookup(&self, c1: u8, c2: u8, c3: u8, c4: u8) -> u8 {
        let key = pack(c1, c2, c3, c4, self.with_alpha);
        // all-zero pixels mostly come from the outside of partial tiles
        if key == 0 {
            return self.best_for_zero;
        }
        match self.exact.get(&key) {
            Some(index) => *index,
            None => self.table.find_best_entry(c1, c2, c3, c4, self.with_alpha),
        }
    }

    /// Remap band-sequential planes in place; the index lands in `planes[0]`.
    pub(crate) fn remap_planes(&self, planes: &mut [u8], plane_len: usize) {
        let (first, rest) = planes.split_at_mut(plane_len);
        for i in 0..plane_len {
            let c2 = rest[i];
            let c3 = rest[plane_len + i];
            let c4 = rest[2 * plane_len + i];
            first[i] = self.lookup(first[i], c2, c3, c4);
        }
    }
}
