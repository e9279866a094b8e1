//! The database: published snapshots, transactions, and the merge and
//! persist entry points.
//!
//! # Snapshots and the single writer
//!
//! All shared state lives in one `Arc<DbState>` behind a lock that is
//! only held long enough to swap the pointer. Readers clone the Arc and
//! see a stable metadata snapshot (schema HAMT + info HAMT + B-tree
//! roots) for their whole lifetime. Every mutation (commit, create or
//! drop table, merge, persist) serializes through the commit lock,
//! builds a new snapshot copy-on-write, and publishes it with one swap.
//!
//! # Write path
//!
//! 1. A transaction stages edits in private inter-buffers, one per
//!    (table, index), registering written keys with the checker.
//! 2. Commit freezes the buffers and layers them onto the published
//!    overlays (`Meta::with_committed`).
//! 3. A periodic merge folds the oldest layers into each base B-tree
//!    through the redirect table.
//! 4. A less frequent persist saves redirected nodes, chains changed
//!    metadata entries into the directory chunks, and appends a state
//!    chunk to the metadata log; that chunk's offset reopens the database.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::checker::Checker;
use crate::cksum;
use crate::config::DbConfig;
use crate::errcorrupt;
use crate::errinput;
use crate::error::{Error, Result};
use crate::index::btree::BtreeBuilder;
use crate::index::ixkey::RawRecord;
use crate::index::overlay::OverlayIter;
use crate::index::Overlay;
use crate::meta::{IndexMode, Info, Meta, Schema, TableCommit};
use crate::record;
use crate::stor::io::{Reader, Writer};
use crate::stor::Stor;

pub struct Database {
    stor: Arc<Stor>,
    state: RwLock<Arc<DbState>>,
    checker: Mutex<Checker>,
    /// Serializes every path that publishes a new snapshot.
    commit_lock: Mutex<()>,
    config: DbConfig,
}

pub struct DbState {
    pub meta: Arc<Meta>,
    /// Offset of the newest state chunk, 0 before the first persist.
    pub state_off: u64,
}

impl Database {
    /// A fresh database over an empty store.
    pub fn create(stor: Arc<Stor>, config: DbConfig) -> Database {
        if stor.size() == 0 {
            stor.alloc(1); // keep offset 0 as the null offset
        }
        Database {
            stor,
            state: RwLock::new(Arc::new(DbState {
                meta: Arc::new(Meta::new()),
                state_off: 0,
            })),
            checker: Mutex::new(Checker::new()),
            commit_lock: Mutex::new(()),
            config,
        }
    }

    /// Reopens a database from the state chunk a prior `persist`
    /// returned.
    pub fn open(stor: Arc<Stor>, state_off: u64, config: DbConfig) -> Result<Database> {
        let (_, schema_off, info_off) = read_state_chunk(&stor, state_off)?;
        let meta = Meta::read(&stor, schema_off, info_off)?;
        Ok(Database {
            stor,
            state: RwLock::new(Arc::new(DbState {
                meta: Arc::new(meta),
                state_off,
            })),
            checker: Mutex::new(Checker::new()),
            commit_lock: Mutex::new(()),
            config,
        })
    }

    pub fn stor(&self) -> &Arc<Stor> {
        &self.stor
    }

    /// The current published snapshot.
    pub fn state(&self) -> Arc<DbState> {
        self.state.read().expect("state lock poisoned").clone()
    }

    fn publish(&self, meta: Meta, state_off: Option<u64>) {
        let mut state = self.state.write().expect("state lock poisoned");
        let off = state_off.unwrap_or(state.state_off);
        *state = Arc::new(DbState {
            meta: Arc::new(meta),
            state_off: off,
        });
    }

    //-------------------------------------------------------------------

    /// Registers a table. The schema's index specs must reference its
    /// column positions.
    pub fn create_table(&self, schema: Schema) -> Result<()> {
        let _guard = self.commit_lock.lock().expect("commit lock poisoned");
        let meta = self.state().meta.as_ref().clone();
        let mut overlays = Vec::with_capacity(schema.indexes.len());
        for ix in &schema.indexes {
            let bldr = BtreeBuilder::new(
                self.stor.clone(),
                ix.ispec.clone(),
                self.config.max_node_size,
                Arc::new(record::leaf_key),
            );
            overlays.push(Overlay::new(bldr.finish()?));
        }
        let info = Info::new(&schema.table, overlays);
        let meta = meta.with_new_table(schema, info)?;
        self.publish(meta, None);
        Ok(())
    }

    /// Drops a table, leaving tombstones that shadow the chain.
    pub fn drop_table(&self, table: &str) -> Result<()> {
        let _guard = self.commit_lock.lock().expect("commit lock poisoned");
        let meta = self.state().meta.with_dropped_table(table)?;
        self.publish(meta, None);
        Ok(())
    }

    /// Starts a transaction over the current snapshot.
    pub fn transaction(&self) -> Transaction<'_> {
        let id = self
            .checker
            .lock()
            .expect("checker lock poisoned")
            .start_tran();
        Transaction {
            db: self,
            id,
            state: self.state(),
            tables: HashMap::new(),
            ended: false,
        }
    }

    //-------------------------------------------------------------------

    /// Tables with committed layers awaiting a merge.
    pub fn merge_ready(&self) -> Vec<String> {
        let mut tables = Vec::new();
        self.state().meta.for_each_info(|ti| {
            if ti.indexes.iter().any(|ov| ov.layers() > 0) {
                tables.push(ti.table.clone());
            }
        });
        tables
    }

    /// Folds every outstanding committed layer of `table` into its base
    /// trees and publishes the result.
    pub fn merge_table(&self, table: &str) -> Result<()> {
        let _guard = self.commit_lock.lock().expect("commit lock poisoned");
        let meta = self.state().meta.clone();
        let layers = match meta.get_info(table) {
            Some(ti) => ti.indexes.iter().map(|ov| ov.layers()).max().unwrap_or(0),
            None => return Ok(()), // dropped
        };
        if layers == 0 {
            return Ok(());
        }
        // every index carries one layer per commit, so the max is shared
        let mut updates = Vec::new();
        if let Some(update) = meta.merge(table, layers)? {
            updates.push(update);
        }
        let meta = meta.apply_merge(updates);
        self.publish(meta, None);
        Ok(())
    }

    /// One pass of the background merge task.
    pub fn merge_step(&self) -> Result<()> {
        for table in self.merge_ready() {
            self.merge_table(&table)?;
        }
        Ok(())
    }

    /// Merges everything, saves every modified base, chains the changed
    /// metadata, and appends a state chunk. Returns the state chunk
    /// offset to reopen from.
    pub fn persist(&self) -> Result<u64> {
        let _guard = self.commit_lock.lock().expect("commit lock poisoned");
        let mut meta = self.state().meta.as_ref().clone();

        // fold remaining layers so the persisted roots cover them
        let mut merges = Vec::new();
        let mut tables = Vec::new();
        meta.for_each_info(|ti| tables.push(ti.table.clone()));
        for table in tables {
            let layers = match meta.get_info(&table) {
                Some(ti) => ti.indexes.iter().map(|ov| ov.layers()).max().unwrap_or(0),
                None => 0,
            };
            if layers > 0 {
                if let Some(update) = meta.merge(&table, layers)? {
                    merges.push(update);
                }
            }
        }
        meta = meta.apply_merge(merges);

        let saves = meta.persist_updates()?;
        meta = meta.apply_persist(saves);

        let meta = meta.write(&self.stor, false);
        let (schema_off, info_off) = meta.offsets();
        let prev = self.state().state_off;
        let state_off = write_state_chunk(&self.stor, prev, schema_off, info_off);
        self.stor.sync()?;
        tracing::info!(state_off, "database persisted");
        self.publish(meta, Some(state_off));
        Ok(state_off)
    }
}

//-------------------------------------------------------------------

/// One chunk of the metadata log: the chain heads of both directories.
fn write_state_chunk(stor: &Stor, prev: u64, schema_off: u64, info_off: u64) -> u64 {
    let size = 3 + 5 + 5 + 5 + cksum::LEN;
    let (off, buf) = stor.alloc(size);
    {
        let mut w = Writer::new(buf);
        w.put3(size).put5(prev).put5(schema_off).put5(info_off);
    }
    cksum::update(buf);
    off
}

fn read_state_chunk(stor: &Stor, off: u64) -> Result<(u64, u64, u64)> {
    let buf = stor.data(off);
    let total = 3 + 5 + 5 + 5 + cksum::LEN;
    if buf.len() < total {
        return Err(errcorrupt!("short state chunk at {off}"));
    }
    let mut r = Reader::new(buf);
    let size = r.get3();
    if size != total {
        return Err(errcorrupt!("bad state chunk size {size} at {off}"));
    }
    cksum::check(&buf[..size])?;
    Ok((r.get5(), r.get5(), r.get5()))
}

//-------------------------------------------------------------------

pub struct Transaction<'a> {
    db: &'a Database,
    id: u64,
    state: Arc<DbState>,
    tables: HashMap<String, TranTable>,
    ended: bool,
}

struct TranTable {
    /// Transaction-private overlay views, one per index.
    overlays: Vec<Overlay>,
    nrows_delta: isize,
    size_delta: i64,
}

impl<'a> Transaction<'a> {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn schema(&self, table: &str) -> Result<&Schema> {
        self.state
            .meta
            .get_schema(table)
            .ok_or_else(|| errinput!("nonexistent table: {table}"))
    }

    fn table(&mut self, table: &str) -> Result<&mut TranTable> {
        if !self.tables.contains_key(table) {
            let ti = self
                .state
                .meta
                .get_info(table)
                .ok_or_else(|| errinput!("nonexistent table: {table}"))?;
            let overlays = ti.indexes.iter().map(|ov| ov.with_mut()).collect();
            self.tables.insert(
                table.to_string(),
                TranTable {
                    overlays,
                    nrows_delta: 0,
                    size_delta: 0,
                },
            );
        }
        Ok(self.tables.get_mut(table).expect("just inserted"))
    }

    /// The encoded key per index for a record.
    fn index_keys<R: RawRecord + ?Sized>(&self, table: &str, rec: &R) -> Result<Vec<Vec<u8>>> {
        let schema = self.schema(table)?;
        Ok(schema
            .indexes
            .iter()
            .map(|ix| ix.ispec.key(rec))
            .collect())
    }

    /// Appends a record and stages it into every index of the table.
    pub fn write<F: AsRef<[u8]>>(&mut self, table: &str, fields: &[F]) -> Result<()> {
        self.ck_live()?;
        let keys = self.index_keys(table, fields)?;
        let unique: Vec<bool> = self
            .schema(table)?
            .indexes
            .iter()
            .map(|ix| matches!(ix.mode, IndexMode::Key | IndexMode::Unique))
            .collect();
        {
            let tbl = self.table(table)?;
            for (i, key) in keys.iter().enumerate() {
                if unique[i] && !key.is_empty() && tbl.overlays[i].get(key)?.is_some() {
                    return Err(errinput!("duplicate key in {table}"));
                }
            }
        }
        if !self
            .db
            .checker
            .lock()
            .expect("checker lock poisoned")
            .write(self.id, table, &keys)
        {
            return self.conflict();
        }
        let off = record::write(&self.db.stor, fields);
        let size = record::size(&self.db.stor, off) as i64;
        let tbl = self.table(table)?;
        for (i, key) in keys.iter().enumerate() {
            tbl.overlays[i].insert(key, off)?;
        }
        tbl.nrows_delta += 1;
        tbl.size_delta += size;
        Ok(())
    }

    /// Stages tombstones for the record at `rec_off` in every index.
    pub fn erase(&mut self, table: &str, rec_off: u64) -> Result<()> {
        self.ck_live()?;
        let keys = {
            let rec = record::read(&self.db.stor, rec_off)?;
            self.index_keys(table, &rec)?
        };
        if !self
            .db
            .checker
            .lock()
            .expect("checker lock poisoned")
            .write(self.id, table, &keys)
        {
            return self.conflict();
        }
        let size = record::size(&self.db.stor, rec_off) as i64;
        let tbl = self.table(table)?;
        for (i, key) in keys.iter().enumerate() {
            tbl.overlays[i].delete(key, rec_off)?;
        }
        tbl.nrows_delta -= 1;
        tbl.size_delta -= size;
        Ok(())
    }

    /// Replaces the record at `old_off` with new fields, staging updates
    /// (or delete + insert where a key changed) in every index.
    pub fn update<F: AsRef<[u8]>>(&mut self, table: &str, old_off: u64, fields: &[F]) -> Result<()> {
        self.ck_live()?;
        let old_keys = {
            let rec = record::read(&self.db.stor, old_off)?;
            self.index_keys(table, &rec)?
        };
        let new_keys = self.index_keys(table, fields)?;
        let mut all_keys = old_keys.clone();
        for (i, key) in new_keys.iter().enumerate() {
            if *key != old_keys[i] {
                all_keys.push(key.clone());
            }
        }
        if !self
            .db
            .checker
            .lock()
            .expect("checker lock poisoned")
            .write(self.id, table, &all_keys)
        {
            return self.conflict();
        }
        let off = record::write(&self.db.stor, fields);
        let old_size = record::size(&self.db.stor, old_off) as i64;
        let new_size = record::size(&self.db.stor, off) as i64;
        let tbl = self.table(table)?;
        for i in 0..new_keys.len() {
            if new_keys[i] == old_keys[i] {
                tbl.overlays[i].update(&new_keys[i], off)?;
            } else {
                tbl.overlays[i].delete(&old_keys[i], old_off)?;
                tbl.overlays[i].insert(&new_keys[i], off)?;
            }
        }
        tbl.size_delta += new_size - old_size;
        Ok(())
    }

    /// Point read through the transaction's snapshot (plus its own
    /// writes), returning the record's fields.
    pub fn read(&mut self, table: &str, index: usize, key: &[u8]) -> Result<Option<Vec<Vec<u8>>>> {
        self.ck_live()?;
        let off = {
            let tbl = self.table(table)?;
            let Some(ov) = tbl.overlays.get(index) else {
                return Err(errinput!("bad index {index} for {table}"));
            };
            ov.get(key)?
        };
        match off {
            Some(off) => Ok(Some(record::read(&self.db.stor, off)?.fields())),
            None => Ok(None),
        }
    }

    /// Range scan over one index: (key, record offset) pairs in
    /// `lo..=hi`, through the transaction's view.
    pub fn range(&mut self, table: &str, index: usize, lo: &[u8], hi: &[u8]) -> Result<Vec<(Vec<u8>, u64)>> {
        self.ck_live()?;
        self.table(table)?;
        let tbl = self.tables.get(table).expect("just created");
        let Some(ov) = tbl.overlays.get(index) else {
            return Err(errinput!("bad index {index} for {table}"));
        };
        let mut out = Vec::new();
        let mut it: OverlayIter<'_> = ov.iter(true);
        it.seek(lo);
        while let Some((key, off)) = it.next()? {
            if key.as_slice() > hi {
                break;
            }
            out.push((key, off));
        }
        Ok(out)
    }

    /// Reads a record by its offset, for rows found through `range`.
    pub fn record(&self, off: u64) -> Result<Vec<Vec<u8>>> {
        Ok(record::read(&self.db.stor, off)?.fields())
    }

    fn ck_live(&self) -> Result<()> {
        if self.ended {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    fn conflict(&self) -> Result<()> {
        self.db
            .checker
            .lock()
            .expect("checker lock poisoned")
            .conflict(self.id)
    }

    /// Publishes the staged buffers as new overlay layers. Fails (and
    /// leaves the transaction for `abort`) if a conflicting write
    /// poisoned it.
    pub fn commit(mut self) -> Result<()> {
        self.ck_live()?;
        if !self
            .db
            .checker
            .lock()
            .expect("checker lock poisoned")
            .commit(self.id)
        {
            let err = self.conflict();
            self.db
                .checker
                .lock()
                .expect("checker lock poisoned")
                .abort(self.id);
            self.ended = true;
            return err;
        }
        self.ended = true;
        let tables = std::mem::take(&mut self.tables);
        let mut commits = Vec::new();
        for (table, mut tbl) in tables {
            let mut bufs = Vec::with_capacity(tbl.overlays.len());
            let mut any = false;
            for ov in tbl.overlays.iter_mut() {
                match ov.take_mut() {
                    Some(buf) if !buf.is_empty() => {
                        any = true;
                        bufs.push(Some(buf));
                    }
                    _ => bufs.push(None),
                }
            }
            if any {
                commits.push(TableCommit {
                    table,
                    bufs,
                    nrows_delta: tbl.nrows_delta,
                    size_delta: tbl.size_delta,
                });
            }
        }
        if commits.is_empty() {
            return Ok(());
        }
        let _guard = self.db.commit_lock.lock().expect("commit lock poisoned");
        // apply to the currently published meta, not this snapshot
        let meta = self.db.state().meta.with_committed(commits);
        self.db.publish(meta, None);
        Ok(())
    }

    /// Discards the staged buffers without touching the base.
    pub fn abort(mut self) -> Result<()> {
        self.ck_live()?;
        self.ended = true;
        self.db
            .checker
            .lock()
            .expect("checker lock poisoned")
            .abort(self.id);
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.ended {
            self.db
                .checker
                .lock()
                .expect("checker lock poisoned")
                .abort(self.id);
        }
    }
}
