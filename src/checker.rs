//! Transaction checker: write-set disjointness for serializability.
//!
//! Every transaction registers at start and records the keys it writes
//! per (table, index). A write that overlaps any other transaction with
//! an overlapping lifetime (live, or committed after this transaction
//! started) fails immediately and poisons its transaction: the failed
//! write returns false and the eventual commit is refused, so the caller
//! must abort and retry. Overlaps within one transaction are fine.
//!
//! Ended transactions are retained until no live transaction started
//! before their end, because a late writer may still conflict with them.

use std::collections::{HashMap, HashSet};

use crate::errinput;
use crate::error::Result;

const LIVE: u64 = u64::MAX;

#[derive(Default)]
pub struct Checker {
    seq: u64,
    trans: HashMap<u64, CkTran>,
}

struct CkTran {
    start: u64,
    end: u64,
    poisoned: Option<String>,
    tables: HashMap<String, TableWrites>,
}

#[derive(Default)]
struct TableWrites {
    /// One key set per index position.
    writes: Vec<HashSet<Vec<u8>>>,
}

impl CkTran {
    fn is_live(&self) -> bool {
        self.end == LIVE
    }
}

impl Checker {
    pub fn new() -> Checker {
        Checker::default()
    }

    /// Registers a transaction, returning its id (also its start
    /// sequence).
    pub fn start_tran(&mut self) -> u64 {
        self.seq += 1;
        let id = self.seq;
        self.trans.insert(
            id,
            CkTran {
                start: id,
                end: LIVE,
                poisoned: None,
                tables: HashMap::new(),
            },
        );
        id
    }

    /// Records one write: `keys` holds the encoded key per index, empty
    /// where an index saw no key. Returns false (and poisons the
    /// transaction) on conflict with any overlapping transaction.
    pub fn write(&mut self, id: u64, table: &str, keys: &[Vec<u8>]) -> bool {
        let Some(tran) = self.trans.get(&id) else {
            return false;
        };
        if tran.poisoned.is_some() {
            return false;
        }
        let start = tran.start;
        let mut conflict = None;
        'scan: for (other_id, other) in &self.trans {
            if *other_id == id {
                continue;
            }
            // live transactions always overlap; ended ones only if they
            // committed after we started
            if !other.is_live() && other.end <= start {
                continue;
            }
            if let Some(tbl) = other.tables.get(table) {
                for (i, key) in keys.iter().enumerate() {
                    if key.is_empty() {
                        continue;
                    }
                    if tbl.writes.get(i).is_some_and(|set| set.contains(key)) {
                        conflict =
                            Some(format!("write conflict on {table} with transaction {other_id}"));
                        break 'scan;
                    }
                }
            }
        }
        if let Some(why) = conflict {
            tracing::debug!(tran = id, %why);
            self.trans.get_mut(&id).expect("tran exists").poisoned = Some(why);
            return false;
        }
        let tran = self.trans.get_mut(&id).expect("tran exists");
        let tbl = tran.tables.entry(table.to_string()).or_default();
        if tbl.writes.len() < keys.len() {
            tbl.writes.resize_with(keys.len(), HashSet::new);
        }
        for (i, key) in keys.iter().enumerate() {
            if !key.is_empty() {
                tbl.writes[i].insert(key.clone());
            }
        }
        true
    }

    /// Ends a transaction successfully. Fails if it was poisoned by a
    /// conflicting write (the caller must abort instead) or is unknown.
    pub fn commit(&mut self, id: u64) -> bool {
        match self.trans.get_mut(&id) {
            Some(tran) if tran.poisoned.is_none() => {
                self.seq += 1;
                tran.end = self.seq;
                self.cleanup();
                true
            }
            _ => false,
        }
    }

    /// Discards a live transaction. Succeeds for poisoned transactions
    /// too; ended transactions stay retained for conflict checks.
    pub fn abort(&mut self, id: u64) -> bool {
        match self.trans.get(&id) {
            Some(tran) if tran.is_live() => {
                self.trans.remove(&id);
                self.cleanup();
                true
            }
            _ => false,
        }
    }

    /// Why a transaction cannot commit, as a reportable error.
    pub fn conflict(&self, id: u64) -> Result<()> {
        match self.trans.get(&id).and_then(|t| t.poisoned.as_deref()) {
            Some(why) => Err(crate::error::Error::Conflict(why.to_string())),
            None => Err(errinput!("unknown transaction {id}")),
        }
    }

    /// Drops ended transactions once no live transaction started before
    /// their end.
    fn cleanup(&mut self) {
        let oldest_live = self
            .trans
            .values()
            .filter(|t| t.is_live())
            .map(|t| t.start)
            .min()
            .unwrap_or(u64::MAX);
        self.trans
            .retain(|_, t| t.is_live() || t.end > oldest_live);
    }

    pub fn live_count(&self) -> usize {
        self.trans.values().filter(|t| t.is_live()).count()
    }

    pub fn tran_count(&self) -> usize {
        self.trans.len()
    }
}
