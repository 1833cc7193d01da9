use std::collections::{HashMap, VecDeque};

/// Zero-based band and block offsets.
pub(crate) type BlockKey = (usize, u32, u32);

#[derive(Debug)]
struct Block {
    data: Vec<u8>,
    dirty: bool,
}

/// Per-band raster blocks of one level. Dirty blocks wait for the block
/// writer; clean ones are a bounded read cache.
#[derive(Debug)]
pub(crate) struct BlockStore {
    blocks: HashMap<BlockKey, Block>,
    clean_order: VecDeque<BlockKey>,
    max_clean: usize,
    block_len: usize,
}

impl BlockStore {
    pub(crate) fn new(block_len: usize, max_clean: usize) -> Self {
        Self {
            blocks: HashMap::new(),
            clean_order: VecDeque::new(),
            max_clean,
            block_len,
        }
    }

    pub(crate) fn get(&self, key: BlockKey) -> Option<&[u8]> {
        self.blocks.get(&key).map(|block| block.data.as_slice())
    }

    pub(crate) fn is_dirty(&self, key: BlockKey) -> bool {
        self.blocks.get(&key).is_some_and(|block| block.dirty)
    }

    pub(crate) fn all_bands_dirty(&self, x: u32, y: u32, bands: usize) -> bool {
        (0..bands).all(|band| self.is_dirty((band, x, y)))
    }

    pub(crate) fn put_dirty(&mut self, key: BlockKey, data: Vec<u8>) {
        let previous = self.blocks.insert(key, Block { data, dirty: true });
        if previous.is_some_and(|block| !block.dirty) {
            self.clean_order.retain(|queued| *queued != key);
        }
    }

    pub(crate) fn put_clean(&mut self, key: BlockKey, data: &[u8]) {
        if let Some(target) = self.clean_mut(key) {
            target.copy_from_slice(data);
        }
    }

    /// Writable block for compositing read results; `None` when the block
    /// holds unwritten data.
    pub(crate) fn clean_mut(&mut self, key: BlockKey) -> Option<&mut [u8]> {
        if self.is_dirty(key) {
            return None;
        }
        if !self.blocks.contains_key(&key) {
            self.evict_clean();
            self.clean_order.push_back(key);
            self.blocks.insert(
                key,
                Block {
                    data: vec![0; self.block_len],
                    dirty: false,
                },
            );
        }
        self.blocks.get_mut(&key).map(|block| block.data.as_mut_slice())
    }

    /// Hand a dirty block to the writer and mark it clean.
    pub(crate) fn take_dirty(&mut self, key: BlockKey) -> Option<&[u8]> {
        if !self.is_dirty(key) {
            return None;
        }
        self.mark_clean(key);
        self.get(key)
    }

    /// Move a written block to the clean blocks, dropping the oldest clean
    /// ones beyond the limit.
    pub(crate) fn mark_clean(&mut self, key: BlockKey) {
        if !self.is_dirty(key) {
            return;
        }
        self.evict_clean();
        if let Some(block) = self.blocks.get_mut(&key) {
            block.dirty = false;
            self.clean_order.push_back(key);
        }
    }

    /// Dirty blocks ordered by band, then row, then column.
    pub(crate) fn dirty_keys(&self) -> Vec<BlockKey> {
        let mut keys: Vec<BlockKey> = self
            .blocks
            .iter()
            .filter(|(_, block)| block.dirty)
            .map(|(key, _)| *key)
            .collect();
        keys.sort_by_key(|(band, x, y)| (*band, *y, *x));
        keys
    }

    pub(crate) fn clear(&mut self) {
        self.blocks.clear();
        self.clean_order.clear();
    }

    /// Make room for one more clean block. A key is queued at most once and
    /// only while its block is clean.
    fn evict_clean(&mut self) {
        while self.clean_order.len() >= self.max_clean {
            let Some(key) = self.clean_order.pop_front() else {
                break;
            };
            if self.blocks.get(&key).is_some_and(|block| !block.dirty) {
                self.blocks.remove(&key);
            }
        }
    }
}
