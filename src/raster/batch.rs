use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use tracing::debug;

use crate::codec::quantize::QuantizeArena;
use crate::error::{GpkgError, Result};

/// Tiles inserted per transaction before it is committed and restarted.
pub(crate) const TILES_PER_TRANSACTION: usize = 1000;

/// Transaction bookkeeping shared by a dataset and its overviews, along
/// with the PNG8 quantization arena every level encodes with.
#[derive(Debug, Default)]
pub(crate) struct TileBatch {
    pending: Cell<usize>,
    poisoned: Cell<bool>,
    modified: Cell<bool>,
    arena: RefCell<Option<QuantizeArena>>,
}

impl TileBatch {
    pub(crate) fn check_usable(&self) -> Result<()> {
        if self.poisoned.get() {
            return Err(GpkgError::BatchAborted);
        }
        Ok(())
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.get()
    }

    pub(crate) fn mark_modified(&self) {
        self.modified.set(true);
    }

    pub(crate) fn take_modified(&self) -> bool {
        self.modified.replace(false)
    }

    /// Allocate the quantization arena unless a level already did.
    pub(crate) fn prepare_arena(&self, tile_width: u32, tile_height: u32) -> Result<()> {
        let mut arena = self.arena.borrow_mut();
        if arena.is_none() {
            *arena = Some(QuantizeArena::new(tile_width, tile_height)?);
        }
        Ok(())
    }

    pub(crate) fn with_arena<R>(
        &self,
        tile_width: u32,
        tile_height: u32,
        f: impl FnOnce(&mut QuantizeArena) -> Result<R>,
    ) -> Result<R> {
        let mut slot = self.arena.borrow_mut();
        let arena = match &mut *slot {
            Some(arena) => arena,
            empty @ None => empty.insert(QuantizeArena::new(tile_width, tile_height)?),
        };
        f(arena)
    }

    /// Open or roll over the transaction before one more tile insertion.
    pub(crate) fn before_insert(&self, conn: &rusqlite::Connection) -> Result<()> {
        match self.pending.get() {
            0 => conn.execute_batch("BEGIN")?,
            TILES_PER_TRANSACTION => {
                self.commit_or_poison(conn)?;
                debug!("committed {TILES_PER_TRANSACTION} tiles");
                conn.execute_batch("BEGIN")?;
                self.pending.set(0);
            }
            _ => {}
        }
        self.pending.set(self.pending.get() + 1);
        Ok(())
    }

    /// Commit whatever the current transaction holds.
    pub(crate) fn commit(&self, conn: &rusqlite::Connection) -> Result<()> {
        if self.pending.get() > 0 {
            self.commit_or_poison(conn)?;
        }
        self.pending.set(0);
        Ok(())
    }

    fn commit_or_poison(&self, conn: &rusqlite::Connection) -> Result<()> {
        if let Err(err) = conn.execute_batch("COMMIT") {
            self.poisoned.set(true);
            return Err(err.into());
        }
        Ok(())
    }
}

/// Whether a level is the full-resolution dataset or one of its overviews.
/// Only the primary owns the batch; overviews borrow it.
#[derive(Debug)]
pub(crate) enum DatasetRole {
    Primary(Rc<TileBatch>),
    Overview(Weak<TileBatch>),
}

impl DatasetRole {
    pub(crate) fn is_primary(&self) -> bool {
        matches!(self, Self::Primary(_))
    }

    pub(crate) fn batch(&self) -> Result<Rc<TileBatch>> {
        match self {
            Self::Primary(batch) => Ok(Rc::clone(batch)),
            Self::Overview(batch) => batch
                .upgrade()
                .ok_or_else(|| GpkgError::Overview("parent dataset is closed".to_string())),
        }
    }

    pub(crate) fn overview_role(&self) -> Result<DatasetRole> {
        Ok(Self::Overview(Rc::downgrade(&self.batch()?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> rusqlite::Connection {
        let conn = rusqlite::Connection::open_in_memory().expect("in-memory db");
        conn.execute_batch("CREATE TABLE t (v INTEGER)").expect("create");
        conn
    }

    #[test]
    fn transaction_rolls_over_every_thousand_tiles() -> Result<()> {
        let conn = conn();
        let batch = TileBatch::default();
        for i in 0..TILES_PER_TRANSACTION + 1 {
            batch.before_insert(&conn)?;
            conn.execute("INSERT INTO t VALUES (?1)", [i as i64])?;
        }
        assert_eq!(batch.pending(), 1);
        assert!(!conn.is_autocommit());
        batch.commit(&conn)?;
        assert!(conn.is_autocommit());
        assert_eq!(batch.pending(), 0);
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))?;
        assert_eq!(count, TILES_PER_TRANSACTION as i64 + 1);
        Ok(())
    }

    #[test]
    fn failed_commit_poisons_the_batch() -> Result<()> {
        let conn = conn();
        let batch = TileBatch::default();
        batch.before_insert(&conn)?;
        // end the transaction behind the batch's back
        conn.execute_batch("COMMIT")?;
        assert!(batch.commit(&conn).is_err());
        match batch.check_usable() {
            Err(GpkgError::BatchAborted) => {}
            other => panic!("unexpected result: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn overview_role_shares_the_primary_batch() -> Result<()> {
        let primary = DatasetRole::Primary(Rc::new(TileBatch::default()));
        let overview = primary.overview_role()?;
        assert!(!overview.is_primary());
        overview.batch()?.mark_modified();
        assert!(primary.batch()?.take_modified());
        assert!(!primary.batch()?.take_modified());

        drop(primary);
        assert!(overview.batch().is_err());
        Ok(())
    }

    #[test]
    fn levels_share_one_quantization_arena() -> Result<()> {
        let primary = DatasetRole::Primary(Rc::new(TileBatch::default()));
        let overview = primary.overview_role()?;
        primary.batch()?.prepare_arena(8, 8)?;
        overview.batch()?.prepare_arena(8, 8)?;

        let address = |role: &DatasetRole| -> Result<*const QuantizeArena> {
            role.batch()?.with_arena(8, 8, |arena| Ok(arena as *const QuantizeArena))
        };
        assert_eq!(address(&primary)?, address(&overview)?);
        Ok(())
    }
}
