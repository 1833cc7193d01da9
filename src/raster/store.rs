use std::cell::Cell;
use std::rc::Rc;

use rusqlite::OptionalExtension;
use tracing::trace;

use crate::error::{GpkgError, Result};
use crate::ogc_sql::{sql_delete_tile, sql_insert_tile, sql_select_first_tile, sql_select_tile};

use super::cache::TilePos;

/// Number of tile statements issued against a tile table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TileIoStats {
    pub selects: u64,
    pub inserts: u64,
    pub deletes: u64,
}

#[derive(Debug, Default)]
pub(crate) struct IoCounters {
    selects: Cell<u64>,
    inserts: Cell<u64>,
    deletes: Cell<u64>,
}

impl IoCounters {
    pub(crate) fn snapshot(&self) -> TileIoStats {
        TileIoStats {
            selects: self.selects.get(),
            inserts: self.inserts.get(),
            deletes: self.deletes.get(),
        }
    }

    fn bump(counter: &Cell<u64>) {
        counter.set(counter.get() + 1);
    }
}

/// Tile rows of one zoom level of a tile table.
#[derive(Debug)]
pub(crate) struct TileStore<'a> {
    conn: &'a rusqlite::Connection,
    table_name: String,
    zoom_level: i32,
    counters: Rc<IoCounters>,
    select_sql: String,
    insert_sql: String,
    delete_sql: String,
}

impl<'a> TileStore<'a> {
    pub(crate) fn new(
        conn: &'a rusqlite::Connection,
        table_name: &str,
        zoom_level: i32,
        counters: Rc<IoCounters>,
    ) -> Self {
        Self {
            conn,
            table_name: table_name.to_string(),
            zoom_level,
            counters,
            select_sql: sql_select_tile(table_name),
            insert_sql: sql_insert_tile(table_name),
            delete_sql: sql_delete_tile(table_name),
        }
    }

    pub(crate) fn conn(&self) -> &'a rusqlite::Connection {
        self.conn
    }

    pub(crate) fn table_name(&self) -> &str {
        &self.table_name
    }

    pub(crate) fn zoom_level(&self) -> i32 {
        self.zoom_level
    }

    pub(crate) fn set_zoom_level(&mut self, zoom_level: i32) {
        self.zoom_level = zoom_level;
    }

    pub(crate) fn counters(&self) -> &Rc<IoCounters> {
        &self.counters
    }

    pub(crate) fn fetch(&self, pos: TilePos) -> Result<Option<Vec<u8>>> {
        self.fetch_at(self.zoom_level, pos)
    }

    /// Tile of another level of the same table.
    pub(crate) fn fetch_at(&self, zoom_level: i32, pos: TilePos) -> Result<Option<Vec<u8>>> {
        trace!(
            table = %self.table_name,
            zoom_level,
            row = pos.row,
            col = pos.col,
            "select tile"
        );
        IoCounters::bump(&self.counters.selects);
        let mut stmt = self.conn.prepare_cached(&self.select_sql)?;
        let blob = stmt
            .query_row(rusqlite::params![zoom_level, pos.row, pos.col], |row| {
                row.get::<_, Option<Vec<u8>>>(0)
            })
            .optional()?;
        Ok(blob.flatten())
    }

    /// Any tile of `zoom_level`, used to probe the stored palette.
    pub(crate) fn fetch_any(&self, zoom_level: i32) -> Result<Option<Vec<u8>>> {
        IoCounters::bump(&self.counters.selects);
        let blob = self
            .conn
            .query_row(
                &sql_select_first_tile(&self.table_name),
                [zoom_level],
                |row| row.get::<_, Option<Vec<u8>>>(0),
            )
            .optional()?;
        Ok(blob.flatten())
    }

    pub(crate) fn insert(&self, pos: TilePos, blob: &[u8]) -> Result<()> {
        trace!(
            table = %self.table_name,
            zoom_level = self.zoom_level,
            row = pos.row,
            col = pos.col,
            bytes = blob.len(),
            "insert tile"
        );
        IoCounters::bump(&self.counters.inserts);
        let result = self
            .conn
            .prepare_cached(&self.insert_sql)
            .and_then(|mut stmt| {
                stmt.execute(rusqlite::params![self.zoom_level, pos.row, pos.col, blob])
            });
        result.map(|_| ()).map_err(|source| GpkgError::TileInsert {
            row: pos.row,
            col: pos.col,
            zoom_level: self.zoom_level,
            source,
        })
    }

    pub(crate) fn delete(&self, pos: TilePos) -> Result<()> {
        trace!(
            table = %self.table_name,
            zoom_level = self.zoom_level,
            row = pos.row,
            col = pos.col,
            "delete tile"
        );
        IoCounters::bump(&self.counters.deletes);
        let result = self
            .conn
            .prepare_cached(&self.delete_sql)
            .and_then(|mut stmt| stmt.execute(rusqlite::params![self.zoom_level, pos.row, pos.col]));
        result.map(|_| ()).map_err(|source| GpkgError::TileDelete {
            row: pos.row,
            col: pos.col,
            zoom_level: self.zoom_level,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ogc_sql::sql_create_tile_table;

    fn conn() -> rusqlite::Connection {
        let conn = rusqlite::Connection::open_in_memory().expect("in-memory db");
        conn.execute_batch(&sql_create_tile_table("t")).expect("create");
        conn
    }

    #[test]
    fn insert_fetch_delete() -> Result<()> {
        let conn = conn();
        let store = TileStore::new(&conn, "t", 3, Rc::new(IoCounters::default()));
        let pos = TilePos::new(1, 2);
        assert_eq!(store.fetch(pos)?, None);
        store.insert(pos, b"abc")?;
        store.insert(pos, b"def")?;
        assert_eq!(store.fetch(pos)?, Some(b"def".to_vec()));
        assert_eq!(store.fetch_any(3)?, Some(b"def".to_vec()));
        assert_eq!(store.fetch_at(4, pos)?, None);
        store.delete(pos)?;
        assert_eq!(store.fetch(pos)?, None);
        assert_eq!(
            store.counters().snapshot(),
            TileIoStats {
                selects: 5,
                inserts: 2,
                deletes: 1
            }
        );
        Ok(())
    }

    #[test]
    fn insert_failure_names_the_tile() {
        let conn = rusqlite::Connection::open_in_memory().expect("in-memory db");
        let store = TileStore::new(&conn, "missing", 5, Rc::new(IoCounters::default()));
        match store.insert(TilePos::new(7, 8), b"x").unwrap_err() {
            GpkgError::TileInsert {
                row: 7,
                col: 8,
                zoom_level: 5,
                ..
            } => {}
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
