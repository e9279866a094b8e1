//! The metadata directories and their merge/persist pipeline.
//!
//! `Meta` holds two HAMTs keyed by table name: the schema directory
//! (columns and index definitions) and the info directory (row counts,
//! sizes, and the per-index overlay handles). A `Meta` value is an
//! immutable snapshot; every change builds a new snapshot copy-on-write
//! and the database publishes it with one pointer swap.
//!
//! Merge and persist follow a collect-then-apply shape: the collection
//! step reads a snapshot and produces update records without touching it
//! (it may run off the publish lock), and the apply step folds the
//! records into a fresh snapshot. Dropped tables surface as tombstone
//! entries that shadow older chain chunks.
//!
//! Both directories persist as chained chunks, each chunk holding only
//! the entries changed since the one before, newest first.

pub mod info;
pub mod schema;

use std::sync::Arc;

use crate::errinput;
use crate::error::Result;
use crate::hamt::Hamt;
use crate::index::interbuf::InterBuf;
use crate::index::overlay::{MergeResult, SaveResult};
use crate::record;
use crate::stor::Stor;

pub use info::Info;
pub use schema::{FkMode, Fkey, IndexMode, IndexSchema, Schema};

#[derive(Clone)]
pub struct Meta {
    schema: Hamt<Schema>,
    info: Hamt<Info>,
    schema_off: u64,
    info_off: u64,
    /// Stamp for chained persistence: entries modified at the current
    /// clock value are the ones the next write includes.
    clock: u32,
}

/// Per-table merge results, collected without touching meta and applied
/// by `apply_merge`.
pub struct MergeUpdate {
    table: String,
    results: Vec<Option<MergeResult>>,
}

/// Per-table save results, collected without touching meta and applied
/// by `apply_persist`.
pub struct PersistUpdate {
    table: String,
    results: Vec<Option<SaveResult>>,
}

/// A transaction's staged edits for one table.
pub struct TableCommit {
    pub table: String,
    /// One staged buffer per index, None where the index saw no edits.
    pub bufs: Vec<Option<Arc<InterBuf>>>,
    pub nrows_delta: isize,
    pub size_delta: i64,
}

impl Default for Meta {
    fn default() -> Self {
        Meta::new()
    }
}

impl Meta {
    pub fn new() -> Meta {
        Meta {
            schema: Hamt::new(),
            info: Hamt::new(),
            schema_off: 0,
            info_off: 0,
            clock: 1,
        }
    }

    pub fn get_schema(&self, table: &str) -> Option<&Schema> {
        self.schema.get(table).filter(|sc| !sc.is_tomb())
    }

    pub fn get_info(&self, table: &str) -> Option<&Info> {
        self.info.get(table).filter(|ti| !ti.is_tomb())
    }

    pub fn for_each_info(&self, mut f: impl FnMut(&Info)) {
        self.info.for_each(|ti| {
            if !ti.is_tomb() {
                f(ti)
            }
        });
    }

    //-------------------------------------------------------------------

    /// Registers a table: its schema and a fresh info entry. Foreign keys
    /// are linked into their target schemas.
    pub fn with_new_table(&self, sc: Schema, ti: Info) -> Result<Meta> {
        if self.get_schema(&sc.table).is_some() {
            return Err(errinput!("table already exists: {}", sc.table));
        }
        if sc.indexes.len() != ti.indexes.len() {
            return Err(errinput!("schema and info index counts differ"));
        }
        let mut meta = self.clone();
        let mut schema = meta.schema.mutable();
        let mut info = meta.info.mutable();
        for ix in &sc.indexes {
            if let Some(fk) = &ix.fk {
                let target = schema.get(fk.table.as_str()).filter(|sc| !sc.is_tomb());
                let Some(target) = target else {
                    return Err(errinput!("foreign key target missing: {}", fk.table));
                };
                let mut target = target.clone();
                let Some(at) = target.index_of(&fk.columns) else {
                    return Err(errinput!("foreign key target index missing: {}", fk.table));
                };
                target.indexes[at].fk_to_here.push(Fkey {
                    table: sc.table.clone(),
                    columns: ix.columns.clone(),
                    mode: fk.mode,
                });
                target.lastmod = meta.clock;
                schema.put(target);
            }
        }
        let mut sc = sc;
        sc.lastmod = meta.clock;
        let mut ti = ti;
        ti.lastmod = meta.clock;
        schema.put(sc);
        info.put(ti);
        meta.schema = schema.freeze();
        meta.info = info.freeze();
        Ok(meta)
    }

    /// Replaces a table's entries with tombstones, which shadow older
    /// chain chunks on the next persist.
    pub fn with_dropped_table(&self, table: &str) -> Result<Meta> {
        if self.get_schema(table).is_none() {
            return Err(errinput!("nonexistent table: {table}"));
        }
        let mut meta = self.clone();
        let mut schema = meta.schema.mutable();
        let mut info = meta.info.mutable();
        let mut sc = Schema::tomb(table);
        sc.lastmod = meta.clock;
        let mut ti = Info::tomb(table);
        ti.lastmod = meta.clock;
        schema.put(sc);
        info.put(ti);
        meta.schema = schema.freeze();
        meta.info = info.freeze();
        Ok(meta)
    }

    /// Applies committed transaction buffers: each affected info entry is
    /// copied, its overlays gain their new frozen layer, and a new
    /// snapshot is returned.
    pub fn with_committed(&self, commits: Vec<TableCommit>) -> Meta {
        let mut meta = self.clone();
        let mut info = meta.info.mutable();
        for commit in commits {
            let found = info.get(commit.table.as_str()).filter(|ti| !ti.is_tomb());
            let Some(ti) = found else {
                tracing::warn!(table = %commit.table, "commit to dropped table discarded");
                continue;
            };
            let mut ti = ti.clone();
            debug_assert_eq!(ti.indexes.len(), commit.bufs.len());
            for (i, buf) in commit.bufs.into_iter().enumerate() {
                if let Some(buf) = buf {
                    ti.indexes[i] = ti.indexes[i].with_committed(buf);
                }
            }
            ti.nrows = ti.nrows.saturating_add_signed(commit.nrows_delta);
            ti.size = ti.size.saturating_add_signed(commit.size_delta);
            ti.lastmod = meta.clock;
            info.put(ti);
        }
        meta.info = info.freeze();
        meta
    }

    //-------------------------------------------------------------------

    /// Collects merge results for one table, folding its oldest `n`
    /// frozen layers per index. Read-only with respect to this snapshot;
    /// returns None if the table was dropped or has nothing to merge.
    pub fn merge(&self, table: &str, n: usize) -> Result<Option<MergeUpdate>> {
        let Some(ti) = self.get_info(table) else {
            return Ok(None); // table dropped
        };
        let mut results = Vec::with_capacity(ti.indexes.len());
        let mut any = false;
        for ov in &ti.indexes {
            // indexes gain layers independently (an index a transaction
            // never touched gains none), so fold what each one has
            let k = n.min(ov.layers());
            if k > 0 {
                results.push(Some(ov.merge(k)?));
                any = true;
            } else {
                results.push(None);
            }
        }
        if !any {
            return Ok(None);
        }
        Ok(Some(MergeUpdate {
            table: table.to_string(),
            results,
        }))
    }

    /// Applies collected merge updates to a fresh snapshot.
    pub fn apply_merge(&self, updates: Vec<MergeUpdate>) -> Meta {
        let mut meta = self.clone();
        let mut info = meta.info.mutable();
        for up in updates {
            let found = info.get(up.table.as_str()).filter(|ti| !ti.is_tomb());
            let Some(ti) = found else {
                continue; // dropped since collection
            };
            let mut ti = ti.clone();
            for (i, result) in up.results.into_iter().enumerate() {
                if let Some(result) = result {
                    ti.indexes[i] = ti.indexes[i].with_merged(result);
                }
            }
            ti.lastmod = meta.clock;
            info.put(ti);
            tracing::debug!(table = %up.table, "merge applied");
        }
        meta.info = info.freeze();
        meta
    }

    /// Collects save results for every table whose overlays carry unsaved
    /// base changes. Read-only with respect to this snapshot.
    pub fn persist_updates(&self) -> Result<Vec<PersistUpdate>> {
        let mut updates = Vec::new();
        let mut failed = None;
        self.for_each_info(|ti| {
            // indexes save independently, so any unsaved one pulls the
            // table in; only the modified indexes are actually saved
            if failed.is_some() || !ti.indexes.iter().any(|ov| ov.modified()) {
                return;
            }
            let mut results = Vec::with_capacity(ti.indexes.len());
            for ov in &ti.indexes {
                if ov.modified() {
                    match ov.save() {
                        Ok(saved) => results.push(Some(saved)),
                        Err(err) => {
                            failed = Some(err);
                            return;
                        }
                    }
                } else {
                    results.push(None);
                }
            }
            updates.push(PersistUpdate {
                table: ti.table.clone(),
                results,
            });
        });
        match failed {
            Some(err) => Err(err),
            None => Ok(updates),
        }
    }

    /// Applies collected save results to a fresh snapshot.
    pub fn apply_persist(&self, updates: Vec<PersistUpdate>) -> Meta {
        let mut meta = self.clone();
        let mut info = meta.info.mutable();
        for up in updates {
            let found = info.get(up.table.as_str()).filter(|ti| !ti.is_tomb());
            let Some(ti) = found else {
                continue;
            };
            let mut ti = ti.clone();
            for (i, result) in up.results.into_iter().enumerate() {
                if let Some(result) = result {
                    ti.indexes[i] = ti.indexes[i].with_saved(result);
                }
            }
            ti.lastmod = meta.clock;
            info.put(ti);
            tracing::debug!(table = %up.table, "persist applied");
        }
        meta.info = info.freeze();
        meta
    }

    //-------------------------------------------------------------------

    /// Persists both directories, chaining a chunk of changed entries
    /// onto each. With `flatten`, full chunks are written and the chains
    /// restart. Returns the snapshot carrying the new chain heads.
    pub fn write(&self, stor: &Stor, flatten: bool) -> Meta {
        let clock = self.clock;
        let mut meta = self.clone();
        let (schema_prev, info_prev) = if flatten {
            (0, 0)
        } else {
            (self.schema_off, self.info_off)
        };
        let schema_off = meta
            .schema
            .write(stor, schema_prev, |sc| flatten || sc.lastmod == clock);
        let info_off = meta
            .info
            .write(stor, info_prev, |ti| flatten || ti.lastmod == clock);
        if schema_off != 0 {
            meta.schema_off = schema_off;
        }
        if info_off != 0 {
            meta.info_off = info_off;
        }
        meta.clock += 1;
        meta
    }

    pub fn offsets(&self) -> (u64, u64) {
        (self.schema_off, self.info_off)
    }

    /// Reassembles the directories from their chain heads, re-links
    /// index specs from the schemas into the info overlays, and rebuilds
    /// the reverse foreign-key links (which are never persisted).
    pub fn read(stor: &Arc<Stor>, schema_off: u64, info_off: u64) -> Result<Meta> {
        let (raw_schema, _) = Hamt::<Schema>::read_chain(stor, schema_off)?;
        let mut links: Vec<(String, Vec<String>, Fkey)> = Vec::new();
        raw_schema.for_each(|sc| {
            for ix in &sc.indexes {
                if let Some(fk) = &ix.fk {
                    links.push((
                        fk.table.clone(),
                        fk.columns.clone(),
                        Fkey {
                            table: sc.table.clone(),
                            columns: ix.columns.clone(),
                            mode: fk.mode,
                        },
                    ));
                }
            }
        });
        let schema = if links.is_empty() {
            raw_schema
        } else {
            let mut schema = raw_schema.mutable();
            for (target, columns, from) in links {
                let Some(sc) = schema.get(target.as_str()).filter(|sc| !sc.is_tomb()) else {
                    continue; // target dropped; the fk is dangling but harmless
                };
                let mut sc = sc.clone();
                if let Some(at) = sc.index_of(&columns) {
                    sc.indexes[at].fk_to_here.push(from);
                    schema.put(sc);
                }
            }
            schema.freeze()
        };
        let (raw_info, _) = Hamt::<Info>::read_chain(stor, info_off)?;
        let mut info = Hamt::new().mutable();
        let mut failed = None;
        raw_info.for_each(|ti| {
            if failed.is_some() {
                return;
            }
            if ti.is_tomb() {
                info.put(ti.clone());
                return;
            }
            let Some(sc) = schema.get(ti.table.as_str()).filter(|sc| !sc.is_tomb()) else {
                failed = Some(crate::errcorrupt!("info entry without schema: {}", ti.table));
                return;
            };
            if sc.indexes.len() != ti.indexes.len() {
                failed = Some(crate::errcorrupt!("index count mismatch: {}", ti.table));
                return;
            }
            let mut ti = ti.clone();
            for (i, ov) in ti.indexes.iter_mut().enumerate() {
                *ov = ov.with_index_spec(sc.indexes[i].ispec.clone(), Arc::new(record::leaf_key));
            }
            info.put(ti);
        });
        if let Some(err) = failed {
            return Err(err);
        }
        Ok(Meta {
            schema,
            info: info.freeze(),
            schema_off,
            info_off,
            clock: 1,
        })
    }
}
