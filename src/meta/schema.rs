//! Table schemas: columns, derived columns, and index definitions.

use std::fmt;
use std::sync::Arc;

use itertools::Itertools;

use crate::hamt::{hash_str, HamtItem, HamtStored};
use crate::index::ixkey::Spec;
use crate::stor::io::{str_size, Reader, Writer};
use crate::stor::Stor;

#[derive(Clone, Debug, PartialEq)]
pub struct Schema {
    pub table: String,
    /// Physical fields in the records, in order.
    pub columns: Vec<String>,
    /// Derived (rule) columns, not stored in records.
    pub derived: Vec<String>,
    pub indexes: Vec<IndexSchema>,
    /// Directory clock value of the last modification, for chained
    /// persistence.
    pub(crate) lastmod: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IndexSchema {
    pub columns: Vec<String>,
    pub ispec: Spec,
    pub mode: IndexMode,
    pub fk: Option<Fkey>,
    /// Foreign keys elsewhere that reference this index. Rebuilt by the
    /// directory, never persisted.
    pub fk_to_here: Vec<Fkey>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexMode {
    Key,
    Index,
    Unique,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Fkey {
    pub table: String,
    pub columns: Vec<String>,
    pub mode: FkMode,
}

/// Foreign key enforcement: block, cascade updates only, cascade deletes
/// only, or cascade both.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FkMode {
    Block,
    CascadeUpdates,
    CascadeDeletes,
    Cascade,
}

impl Schema {
    pub fn new(
        table: &str,
        columns: Vec<String>,
        derived: Vec<String>,
        indexes: Vec<IndexSchema>,
    ) -> Schema {
        Schema {
            table: table.to_string(),
            columns,
            derived,
            indexes,
            lastmod: 0,
        }
    }

    /// A tombstone for a dropped table: no columns, no indexes.
    pub fn tomb(table: &str) -> Schema {
        Schema {
            table: table.to_string(),
            columns: Vec::new(),
            derived: Vec::new(),
            indexes: Vec::new(),
            lastmod: 0,
        }
    }

    pub fn is_tomb(&self) -> bool {
        self.indexes.is_empty()
    }

    pub fn find_index(&self, columns: &[String]) -> Option<&IndexSchema> {
        self.indexes.iter().find(|ix| ix.columns == columns)
    }

    /// The position of the index over `columns`.
    pub fn index_of(&self, columns: &[String]) -> Option<usize> {
        self.indexes.iter().position(|ix| ix.columns == columns)
    }

    pub fn column_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.table)?;
        if !self.columns.is_empty() || !self.derived.is_empty() {
            write!(
                f,
                " ({})",
                self.columns.iter().chain(self.derived.iter()).join(",")
            )?;
        }
        for ix in &self.indexes {
            write!(f, " {ix}")?;
        }
        Ok(())
    }
}

impl fmt::Display for IndexSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.mode {
            IndexMode::Key => "key",
            IndexMode::Index => "index",
            IndexMode::Unique => "index unique",
        };
        write!(f, "{mode}({})", self.columns.iter().join(","))?;
        if let Some(fk) = &self.fk {
            write!(f, " in {}", fk.table)?;
            if fk.columns != self.columns {
                write!(f, "({})", fk.columns.iter().join(","))?;
            }
            match fk.mode {
                FkMode::Cascade => write!(f, " cascade")?,
                FkMode::CascadeUpdates => write!(f, " cascade update")?,
                FkMode::CascadeDeletes => write!(f, " cascade delete")?,
                FkMode::Block => {}
            }
        }
        let mut froms: Vec<String> = self
            .fk_to_here
            .iter()
            .map(|fk| format!(" from {}({})", fk.table, fk.columns.iter().join(",")))
            .collect();
        froms.sort();
        for from in froms {
            write!(f, "{from}")?;
        }
        Ok(())
    }
}

//-------------------------------------------------------------------

impl HamtItem for Schema {
    type Key = str;

    fn key(&self) -> &str {
        &self.table
    }

    fn hash(key: &str) -> u32 {
        hash_str(key)
    }
}

impl HamtStored for Schema {
    fn stor_size(&self) -> usize {
        let mut size = str_size(&self.table) + 1 + 1 + 1;
        size += self.columns.iter().map(|c| str_size(c)).sum::<usize>();
        size += self.derived.iter().map(|c| str_size(c)).sum::<usize>();
        for ix in &self.indexes {
            size += 1 + 1;
            size += ix.columns.iter().map(|c| str_size(c)).sum::<usize>();
            size += 2 * (ix.ispec.fields.len() + ix.ispec.fields2.len()) + 2;
            size += match &ix.fk {
                Some(fk) => {
                    str_size(&fk.table)
                        + 1
                        + 1
                        + fk.columns.iter().map(|c| str_size(c)).sum::<usize>()
                }
                None => str_size(""),
            };
        }
        size
    }

    fn write(&self, w: &mut Writer) {
        w.put_str(&self.table);
        w.put1(self.columns.len());
        for col in &self.columns {
            w.put_str(col);
        }
        w.put1(self.derived.len());
        for col in &self.derived {
            w.put_str(col);
        }
        w.put1(self.indexes.len());
        for ix in &self.indexes {
            w.put1(match ix.mode {
                IndexMode::Key => b'k' as usize,
                IndexMode::Index => b'i' as usize,
                IndexMode::Unique => b'u' as usize,
            });
            w.put1(ix.columns.len());
            for col in &ix.columns {
                w.put_str(col);
            }
            w.put1(ix.ispec.fields.len());
            for &f in &ix.ispec.fields {
                w.put2(f);
            }
            w.put1(ix.ispec.fields2.len());
            for &f in &ix.ispec.fields2 {
                w.put2(f);
            }
            match &ix.fk {
                Some(fk) => {
                    w.put_str(&fk.table);
                    w.put1(match fk.mode {
                        FkMode::Block => 0,
                        FkMode::CascadeUpdates => 1,
                        FkMode::CascadeDeletes => 2,
                        FkMode::Cascade => 3,
                    });
                    w.put1(fk.columns.len());
                    for col in &fk.columns {
                        w.put_str(col);
                    }
                }
                None => {
                    w.put_str("");
                }
            }
        }
    }

    fn read(_stor: &Arc<Stor>, r: &mut Reader) -> crate::error::Result<Schema> {
        let table = r.get_str();
        let ncols = r.get1();
        let columns = (0..ncols).map(|_| r.get_str()).collect();
        let nderived = r.get1();
        let derived = (0..nderived).map(|_| r.get_str()).collect();
        let nindexes = r.get1();
        let mut indexes = Vec::with_capacity(nindexes);
        for _ in 0..nindexes {
            let mode = match r.get1() as u8 {
                b'k' => IndexMode::Key,
                b'u' => IndexMode::Unique,
                _ => IndexMode::Index,
            };
            let nixcols = r.get1();
            let columns: Vec<String> = (0..nixcols).map(|_| r.get_str()).collect();
            let nfields = r.get1();
            let fields = (0..nfields).map(|_| r.get2()).collect();
            let nfields2 = r.get1();
            let fields2 = (0..nfields2).map(|_| r.get2()).collect();
            let fk_table = r.get_str();
            let fk = if fk_table.is_empty() {
                None
            } else {
                let mode = match r.get1() {
                    0 => FkMode::Block,
                    1 => FkMode::CascadeUpdates,
                    2 => FkMode::CascadeDeletes,
                    3 => FkMode::Cascade,
                    other => {
                        return Err(crate::errcorrupt!("bad foreign key mode {other}"));
                    }
                };
                let nfkcols = r.get1();
                let columns = (0..nfkcols).map(|_| r.get_str()).collect();
                Some(Fkey {
                    table: fk_table,
                    columns,
                    mode,
                })
            };
            indexes.push(IndexSchema {
                columns,
                ispec: Spec { fields, fields2 },
                mode,
                fk,
                fk_to_here: Vec::new(),
            });
        }
        Ok(Schema {
            table,
            columns,
            derived,
            indexes,
            lastmod: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Schema {
        Schema {
            table: "orders".into(),
            columns: vec!["id".into(), "customer".into(), "total".into()],
            derived: vec!["Summary".into()],
            indexes: vec![
                IndexSchema {
                    columns: vec!["id".into()],
                    ispec: Spec::new(vec![0]),
                    mode: IndexMode::Key,
                    fk: None,
                    fk_to_here: Vec::new(),
                },
                IndexSchema {
                    columns: vec!["customer".into()],
                    ispec: Spec {
                        fields: vec![1],
                        fields2: vec![0],
                    },
                    mode: IndexMode::Index,
                    fk: Some(Fkey {
                        table: "customers".into(),
                        columns: vec!["customer".into()],
                        mode: FkMode::Cascade,
                    }),
                    fk_to_here: Vec::new(),
                },
            ],
            lastmod: 0,
        }
    }

    #[test]
    fn display() {
        assert_eq!(
            sample().to_string(),
            "orders (id,customer,total,Summary) key(id) \
             index(customer) in customers cascade"
        );
    }

    #[test]
    fn persist_round_trip() {
        let stor = Arc::new(Stor::heap(8192));
        stor.alloc(1);
        let sc = sample();
        let size = sc.stor_size();
        let (_, buf) = stor.alloc(size);
        {
            let mut w = Writer::new(buf);
            sc.write(&mut w);
            assert_eq!(w.len(), size);
        }
        let mut r = Reader::new(stor.data(1));
        let back = Schema::read(&stor, &mut r).unwrap();
        assert_eq!(back, sc);
        assert!(!back.is_tomb());
    }

    #[test]
    fn fk_modes_round_trip() {
        for mode in [
            FkMode::Block,
            FkMode::CascadeUpdates,
            FkMode::CascadeDeletes,
            FkMode::Cascade,
        ] {
            let mut sc = sample();
            sc.indexes[1].fk.as_mut().unwrap().mode = mode;
            let stor = Arc::new(Stor::heap(8192));
            stor.alloc(1);
            let (off, buf) = stor.alloc(sc.stor_size());
            {
                let mut w = Writer::new(buf);
                sc.write(&mut w);
            }
            let mut r = Reader::new(stor.data(off));
            assert_eq!(Schema::read(&stor, &mut r).unwrap(), sc);
        }
        let mut sc = sample();
        sc.indexes[1].fk.as_mut().unwrap().mode = FkMode::CascadeDeletes;
        assert!(sc.to_string().ends_with("in customers cascade delete"));
    }

    #[test]
    fn index_lookup() {
        let sc = sample();
        assert_eq!(sc.index_of(&["id".into()]), Some(0));
        assert_eq!(sc.index_of(&["customer".into()]), Some(1));
        assert_eq!(sc.index_of(&["nope".into()]), None);
        assert!(sc.find_index(&["customer".into()]).is_some());
        assert_eq!(sc.column_of("total"), Some(2));
    }

    #[test]
    fn tombs() {
        let tomb = Schema::tomb("gone");
        assert!(tomb.is_tomb());
    }
}
