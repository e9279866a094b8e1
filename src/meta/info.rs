//! Per-table runtime info: row count, total size, and the overlay handle
//! for each index.

use std::sync::Arc;

use crate::hamt::{hash_str, HamtItem, HamtStored};
use crate::index::Overlay;
use crate::stor::io::{str_size, Reader, Writer};
use crate::stor::Stor;

#[derive(Clone)]
pub struct Info {
    pub table: String,
    pub nrows: usize,
    pub size: u64,
    pub indexes: Vec<Overlay>,
    /// Directory clock value of the last modification, for chained
    /// persistence.
    pub(crate) lastmod: u32,
}

impl Info {
    pub fn new(table: &str, indexes: Vec<Overlay>) -> Info {
        Info {
            table: table.to_string(),
            nrows: 0,
            size: 0,
            indexes,
            lastmod: 0,
        }
    }

    /// A tombstone for a dropped table: no indexes.
    pub fn tomb(table: &str) -> Info {
        Info {
            table: table.to_string(),
            nrows: 0,
            size: 0,
            indexes: Vec::new(),
            lastmod: 0,
        }
    }

    pub fn is_tomb(&self) -> bool {
        self.indexes.is_empty()
    }
}

impl HamtItem for Info {
    type Key = str;

    fn key(&self) -> &str {
        &self.table
    }

    fn hash(key: &str) -> u32 {
        hash_str(key)
    }
}

impl HamtStored for Info {
    fn stor_size(&self) -> usize {
        str_size(&self.table)
            + 4
            + 5
            + 1
            + self.indexes.iter().map(|ov| ov.stor_size()).sum::<usize>()
    }

    fn write(&self, w: &mut Writer) {
        w.put_str(&self.table)
            .put4(self.nrows)
            .put5(self.size)
            .put1(self.indexes.len());
        for ov in &self.indexes {
            ov.write(w);
        }
    }

    fn read(stor: &Arc<Stor>, r: &mut Reader) -> crate::error::Result<Info> {
        let table = r.get_str();
        let nrows = r.get4();
        let size = r.get5();
        let nindexes = r.get1();
        let mut indexes = Vec::with_capacity(nindexes);
        for _ in 0..nindexes {
            indexes.push(Overlay::read(stor, r)?);
        }
        Ok(Info {
            table,
            nrows,
            size,
            indexes,
            lastmod: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hamt::Hamt;
    use crate::index::btree::BtreeBuilder;
    use crate::index::ixkey::Spec;
    use crate::record;

    fn empty_overlay(stor: &Arc<Stor>) -> Overlay {
        let bldr = BtreeBuilder::new(
            stor.clone(),
            Spec::new(vec![0]),
            crate::index::btree::MAX_NODE_SIZE,
            Arc::new(record::leaf_key),
        );
        Overlay::new(bldr.finish().unwrap())
    }

    #[test]
    fn round_trip_two_tables() {
        let stor = Arc::new(Stor::heap(64 * 1024));
        stor.alloc(1);
        let mut tbl = Hamt::new().mutable();
        tbl.put(Info {
            nrows: 100,
            size: 1000,
            ..Info::new("one", vec![empty_overlay(&stor)])
        });
        tbl.put(Info {
            nrows: 200,
            size: 2000,
            ..Info::new("two", vec![empty_overlay(&stor)])
        });
        let tbl = tbl.freeze();

        let off = tbl.write(&stor, 0, |_| true);
        let (tbl, _) = Hamt::<Info>::read_chain(&stor, off).unwrap();
        let one = tbl.get("one").unwrap();
        assert_eq!((one.nrows, one.size), (100, 1000));
        assert_eq!(one.indexes.len(), 1);
        let two = tbl.get("two").unwrap();
        assert_eq!((two.nrows, two.size), (200, 2000));
    }

    #[test]
    fn thousand_tables_chain() {
        use rand::prelude::*;
        let mut rng = StdRng::seed_from_u64(6);
        let stor = Arc::new(Stor::heap(256 * 1024));
        stor.alloc(1);
        let mut names: Vec<String> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let mut tbl = Hamt::new().mutable();
        while names.len() < 1000 {
            let name: String = (0..4).map(|_| rng.gen_range('a'..='z')).collect();
            if !seen.insert(name.clone()) {
                continue;
            }
            tbl.put(Info {
                nrows: names.len(),
                ..Info::new(&name, vec![empty_overlay(&stor)])
            });
            names.push(name);
        }
        let off = tbl.freeze().write(&stor, 0, |_| true);

        let (tbl, _) = Hamt::<Info>::read_chain(&stor, off).unwrap();
        for (i, name) in names.iter().enumerate() {
            let ti = tbl.get(name).expect("table entry lost");
            assert_eq!(ti.table, *name);
            assert_eq!(ti.nrows, i);
            assert!(tbl.get(&format!("{name}Z")).is_none());
        }
    }

    #[test]
    fn tomb_shadows_older_entry() {
        let stor = Arc::new(Stor::heap(64 * 1024));
        stor.alloc(1);
        let mut tbl = Hamt::new().mutable();
        tbl.put(Info {
            nrows: 5,
            ..Info::new("t", vec![empty_overlay(&stor)])
        });
        let off1 = tbl.freeze().write(&stor, 0, |_| true);

        let mut tbl = Hamt::new().mutable();
        tbl.put(Info::tomb("t"));
        let off2 = tbl.freeze().write(&stor, off1, |_| true);

        let (tbl, offs) = Hamt::<Info>::read_chain(&stor, off2).unwrap();
        assert_eq!(offs.len(), 2);
        assert!(tbl.get("t").unwrap().is_tomb());
    }
}
