//! Tile staging buffers shared by the block reader and writer.
//!
//! The cache owns four tile buffers of four band planes each. Four slots map
//! tile positions onto those buffers: slot 0 is also the write accumulator
//! (when pinned to [`WORK`]), and all four slots are used as a 2x2 read window
//! when the raster origin is not aligned on the tile grid.

/// Write accumulation buffer; first read buffer of a shifted window.
pub(crate) const WORK: usize = 0;
/// Backfill buffer used before encoding a partially dirty tile.
pub(crate) const SCRATCH: usize = 1;
/// Destination of aligned reads.
pub(crate) const READ: usize = 2;
/// Aligned read while slot 0 holds dirty bands.
pub(crate) const TEMP: usize = 3;

pub(crate) const SLOT_COUNT: usize = 4;
pub(crate) const MAX_BANDS: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct TilePos {
    pub(crate) row: i32,
    pub(crate) col: i32,
}

impl TilePos {
    pub(crate) const fn new(row: i32, col: i32) -> Self {
        Self { row, col }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Slot {
    pub(crate) pos: Option<TilePos>,
    pub(crate) buffer: Option<usize>,
    pub(crate) dirty: [bool; MAX_BANDS],
}

#[derive(Debug)]
pub(crate) struct TileCache {
    slots: [Slot; SLOT_COUNT],
    data: Vec<u8>,
    plane_len: usize,
}

impl TileCache {
    pub(crate) fn new(tile_width: u32, tile_height: u32) -> Self {
        let plane_len = tile_width as usize * tile_height as usize;
        Self {
            slots: [Slot::default(); SLOT_COUNT],
            data: vec![0; SLOT_COUNT * MAX_BANDS * plane_len],
            plane_len,
        }
    }

    pub(crate) fn plane_len(&self) -> usize {
        self.plane_len
    }

    pub(crate) fn slot(&self, index: usize) -> &Slot {
        &self.slots[index]
    }

    /// Buffer of the slot holding `pos`, if that slot has one.
    pub(crate) fn get(&self, pos: TilePos) -> Option<usize> {
        self.slots
            .iter()
            .find(|slot| slot.pos == Some(pos))
            .and_then(|slot| slot.buffer)
    }

    pub(crate) fn find_slot(&self, pos: TilePos) -> Option<usize> {
        self.slots.iter().position(|slot| slot.pos == Some(pos))
    }

    /// Point the 2x2 window at the tiles starting at `origin`. When the
    /// window moves exactly one column to the right, the right-hand buffers
    /// become the left-hand ones and only the new column needs fetching.
    pub(crate) fn reposition_window(&mut self, origin: TilePos) {
        let [s0, s1, s2, s3] = &mut self.slots;
        let scrolled = s0.pos.is_some_and(|p| p.row == origin.row && p.col + 1 == origin.col)
            && s0.buffer.is_some();
        if scrolled {
            s0.buffer = s1.buffer;
            s2.buffer = s3.buffer;
        } else {
            s0.buffer = None;
            s2.buffer = None;
        }
        s0.pos = Some(origin);
        s1.pos = Some(TilePos::new(origin.row, origin.col + 1));
        s2.pos = Some(TilePos::new(origin.row + 1, origin.col));
        s3.pos = Some(TilePos::new(origin.row + 1, origin.col + 1));
        s1.buffer = None;
        s3.buffer = None;
    }

    /// Give a window slot a buffer not used by its horizontal neighbour.
    /// The top row shares buffers 0 and 1, the bottom row 2 and 3.
    pub(crate) fn claim_buffer(&mut self, slot: usize) -> usize {
        let buffer = match slot {
            0 => usize::from(self.slots[1].buffer == Some(0)),
            1 => usize::from(self.slots[0].buffer == Some(0)),
            2 => 2 + usize::from(self.slots[3].buffer == Some(2)),
            _ => 2 + usize::from(self.slots[2].buffer == Some(2)),
        };
        self.slots[slot].buffer = Some(buffer);
        buffer
    }

    pub(crate) fn evict(&mut self, slot: usize) {
        self.slots[slot].pos = None;
        self.slots[slot].buffer = None;
    }

    /// Drop the read-only slots 1 to 3.
    pub(crate) fn evict_readers(&mut self) {
        for slot in 1..SLOT_COUNT {
            self.evict(slot);
        }
    }

    pub(crate) fn reset(&mut self) {
        self.slots = [Slot::default(); SLOT_COUNT];
    }

    /// Slot 0 accumulates writes for `pos` in the [`WORK`] buffer.
    pub(crate) fn pin_working(&mut self, pos: TilePos) {
        self.slots[0].pos = Some(pos);
        self.slots[0].buffer = Some(WORK);
    }

    pub(crate) fn working(&self) -> Option<TilePos> {
        let slot = &self.slots[0];
        match slot.buffer {
            Some(WORK) => slot.pos,
            _ => None,
        }
    }

    pub(crate) fn is_working(&self, pos: TilePos) -> bool {
        self.working() == Some(pos)
    }

    /// Unpin slot 0 and forget its dirty bands.
    pub(crate) fn release_working(&mut self) {
        self.slots[0] = Slot::default();
    }

    pub(crate) fn mark_dirty(&mut self, band: usize) {
        self.slots[0].dirty[band] = true;
    }

    pub(crate) fn mark_all_dirty(&mut self) {
        self.slots[0].dirty = [true; MAX_BANDS];
    }

    pub(crate) fn is_dirty(&self, band: usize) -> bool {
        self.slots[0].dirty[band]
    }

    pub(crate) fn any_dirty(&self, bands: usize) -> bool {
        self.slots[0].dirty[..bands].iter().any(|d| *d)
    }

    pub(crate) fn all_dirty(&self, bands: usize) -> bool {
        self.slots[0].dirty[..bands].iter().all(|d| *d)
    }

    pub(crate) fn buffer(&self, buffer: usize) -> &[u8] {
        let len = MAX_BANDS * self.plane_len;
        &self.data[buffer * len..(buffer + 1) * len]
    }

    pub(crate) fn buffer_mut(&mut self, buffer: usize) -> &mut [u8] {
        let len = MAX_BANDS * self.plane_len;
        &mut self.data[buffer * len..(buffer + 1) * len]
    }

    pub(crate) fn plane(&self, buffer: usize, band: usize) -> &[u8] {
        let start = (buffer * MAX_BANDS + band) * self.plane_len;
        &self.data[start..start + self.plane_len]
    }

    pub(crate) fn plane_mut(&mut self, buffer: usize, band: usize) -> &mut [u8] {
        let start = (buffer * MAX_BANDS + band) * self.plane_len;
        &mut self.data[start..start + self.plane_len]
    }

    /// Two distinct buffers at once, `first < second`.
    pub(crate) fn buffer_pair_mut(&mut self, first: usize, second: usize) -> (&mut [u8], &mut [u8]) {
        debug_assert!(first < second);
        let len = MAX_BANDS * self.plane_len;
        let (low, high) = self.data.split_at_mut(second * len);
        (&mut low[first * len..(first + 1) * len], &mut high[..len])
    }

    /// Copy the bands of `from` that slot 0 does not hold dirty data for.
    pub(crate) fn copy_clean_bands(&mut self, from: usize, to: usize, bands: usize) {
        self.copy_bands(from, to, bands, false);
    }

    pub(crate) fn copy_dirty_bands(&mut self, from: usize, to: usize, bands: usize) {
        self.copy_bands(from, to, bands, true);
    }

    fn copy_bands(&mut self, from: usize, to: usize, bands: usize, dirty: bool) {
        let len = self.plane_len;
        for band in 0..bands {
            if self.slots[0].dirty[band] != dirty {
                continue;
            }
            let src = (from * MAX_BANDS + band) * len;
            let dst = (to * MAX_BANDS + band) * len;
            self.data.copy_within(src..src + len, dst);
        }
    }
}
