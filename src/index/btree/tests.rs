use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use rand::prelude::*;

use super::node;
use super::{Btree, BtreeBuilder, LeafKeyFn};
use crate::index::interbuf::InterBuf;
use crate::index::ixkey::Spec;
use crate::stor::Stor;

/// A shared offset -> key registry standing in for record storage, so the
/// leaf-key extractor can reverse test offsets.
#[derive(Clone, Default)]
struct KeySource {
    map: Arc<Mutex<HashMap<u64, Vec<u8>>>>,
}

impl KeySource {
    fn add(&self, off: u64, key: &[u8]) {
        self.map.lock().unwrap().insert(off, key.to_vec());
    }

    fn extractor(&self) -> LeafKeyFn {
        let map = self.map.clone();
        Arc::new(move |_, _, off| map.lock().unwrap().get(&off).cloned().unwrap_or_default())
    }
}

fn digits_extractor() -> LeafKeyFn {
    Arc::new(|_, _, off| off.to_string().into_bytes())
}

fn heap_tree(chunksize: usize, max_node_size: usize, leaf_key: LeafKeyFn) -> Btree {
    let stor = Arc::new(Stor::heap(chunksize));
    stor.alloc(1); // keep offset 0 as null
    Btree::create(stor, Spec::default(), max_node_size, leaf_key)
}

fn unique_random_keys(rng: &mut StdRng, n: usize, lo: usize, hi: usize, alpha: &[u8]) -> Vec<Vec<u8>> {
    let mut seen = std::collections::HashSet::new();
    let mut keys = Vec::with_capacity(n);
    while keys.len() < n {
        let len = rng.gen_range(lo..=hi);
        let key: Vec<u8> = (0..len).map(|_| alpha[rng.gen_range(0..alpha.len())]).collect();
        if seen.insert(key.clone()) {
            keys.push(key);
        }
    }
    keys
}

fn check_data(bt: &Btree, data: &BTreeMap<Vec<u8>, u64>) {
    let (count, _, _) = bt.check().expect("btree check failed");
    assert_eq!(count, data.len());
    for (key, off) in data {
        assert_eq!(bt.search(key).unwrap(), Some(*off), "missing {key:?}");
    }
    let mut it = bt.iter(true);
    for (key, off) in data {
        let (k, o) = it.next().unwrap().expect("iteration ended early");
        assert_eq!(&k, key);
        assert_eq!(o, *off);
    }
    assert_eq!(it.next().unwrap(), None);
}

/// Redirects must be reachable through path-marked ancestors (or be the
/// root), mirroring the redirect/path invariant.
fn check_paths(bt: &Btree) {
    let mut rset = std::collections::HashSet::new();
    bt.redirs().for_each_redir(|r| {
        rset.insert(r.offset);
    });
    rset.remove(&bt.root());
    walk_paths(bt, bt.root(), 0, true, &mut rset);
    assert!(rset.is_empty(), "unreachable redirects: {rset:?}");
}

fn walk_paths(bt: &Btree, off: u64, depth: usize, on_path: bool, rset: &mut std::collections::HashSet<u64>) {
    if depth >= bt.tree_levels() {
        return;
    }
    let marked = bt.redirs().on_path(off);
    for (_, child) in bt.node_entries(off).unwrap() {
        if on_path && marked {
            rset.remove(&child);
        }
        walk_paths(bt, child, depth + 1, on_path && marked, rset);
    }
}

#[test]
fn insert_random_small_nodes() {
    let mut rng = StdRng::seed_from_u64(1);
    for round in 0..3usize {
        let source = KeySource::default();
        let bt = heap_tree(256 * 1024, 44, source.extractor());
        let keys = unique_random_keys(&mut rng, 1000, 3, 6, b"abcde");
        let mut data = BTreeMap::new();
        let bt = bt
            .update(|bt| {
                for (i, key) in keys.iter().enumerate() {
                    let off = (round * 10_000 + i + 1) as u64;
                    source.add(off, key);
                    data.insert(key.clone(), off);
                    bt.insert(key, off)?;
                }
                Ok(())
            })
            .unwrap();
        check_data(&bt, &data);
        check_paths(&bt);
    }
}

#[test]
fn uneven_splits_stay_dense() {
    let mut rng = StdRng::seed_from_u64(2);
    let mut keys = unique_random_keys(&mut rng, 1000, 3, 6, b"abcde");
    let run = |keys: &[Vec<u8>]| {
        let source = KeySource::default();
        let bt = heap_tree(256 * 1024, 128, source.extractor());
        let mut data = BTreeMap::new();
        let bt = bt
            .update(|bt| {
                for (i, key) in keys.iter().enumerate() {
                    let off = (i + 1) as u64;
                    source.add(off, key);
                    data.insert(key.clone(), off);
                    bt.insert(key, off)?;
                }
                Ok(())
            })
            .unwrap();
        let (count, size, nnodes) = bt.check().unwrap();
        assert_eq!(count, 1000);
        let full = size as f64 / nnodes as f64 / 128.0;
        assert!(full > 0.65, "expected fill > 0.65, got {full:.2}");
        check_data(&bt, &data);
    };
    run(&keys);
    keys.sort();
    run(&keys);
    keys.reverse();
    run(&keys);
}

#[test]
fn delete_random_until_empty() {
    let mut rng = StdRng::seed_from_u64(3);
    let source = KeySource::default();
    let bt = heap_tree(256 * 1024, 44, source.extractor());
    let keys = unique_random_keys(&mut rng, 500, 3, 6, b"abcdef");
    let mut data = BTreeMap::new();
    let mut bt = bt
        .update(|bt| {
            for (i, key) in keys.iter().enumerate() {
                let off = (i + 1) as u64;
                source.add(off, key);
                data.insert(key.clone(), off);
                bt.insert(key, off)?;
            }
            Ok(())
        })
        .unwrap();
    check_data(&bt, &data);

    let mut order: Vec<Vec<u8>> = data.keys().cloned().collect();
    order.shuffle(&mut rng);
    for (i, key) in order.iter().enumerate() {
        let off = data.remove(key).unwrap();
        bt = bt
            .update(|bt| {
                bt.delete(key, off)?;
                Ok(())
            })
            .unwrap();
        if i % 11 == 0 {
            check_data(&bt, &data);
        }
    }
    check_data(&bt, &data);
}

#[test]
fn save_round_trip() {
    // matches the redirect lifecycle: one redirect for the fresh root,
    // absorbed by the root holder on save
    let stor = Arc::new(Stor::heap(8192));
    stor.alloc(1);
    let bt = Btree::create(stor.clone(), Spec::default(), 64, digits_extractor());
    assert_eq!(bt.redirs().len(), 1);

    let bt = bt
        .update(|bt| {
            bt.insert(b"1", 1)?;
            bt.insert(b"2", 2)
        })
        .unwrap();
    assert_eq!(bt.redirs().len(), 1);
    assert_eq!(list(&bt), "1 2");

    let bt = bt.save(false).unwrap();
    let bt = Btree::open(
        stor.clone(),
        bt.root(),
        bt.tree_levels(),
        bt.redirs_off(),
        Spec::default(),
        64,
        digits_extractor(),
    )
    .unwrap();
    assert_eq!(bt.redirs().len(), 0);
    assert_eq!(list(&bt), "1 2");

    let bt = bt
        .update(|bt| {
            bt.insert(b"3", 3)?;
            Ok(())
        })
        .unwrap();
    let bt = bt.save(false).unwrap();
    let bt = Btree::open(
        stor,
        bt.root(),
        bt.tree_levels(),
        bt.redirs_off(),
        Spec::default(),
        64,
        digits_extractor(),
    )
    .unwrap();
    assert_eq!(list(&bt), "1 2 3");
}

fn list(bt: &Btree) -> String {
    let mut out = Vec::new();
    let mut it = bt.iter(true);
    while let Some((_, off)) = it.next().unwrap() {
        out.push(off.to_string());
    }
    out.join(" ")
}

#[test]
fn repeated_update_save_cycles() {
    let mut rng = StdRng::seed_from_u64(4);
    let source = KeySource::default();
    let stor = Arc::new(Stor::heap(1024 * 1024));
    stor.alloc(1);
    let mut bt = Btree::create(stor, Spec::default(), 64, source.extractor());
    let mut data = BTreeMap::new();
    let keys = unique_random_keys(&mut rng, 100 * 9 * 7, 5, 9, b"abcdefghi");
    let mut next = keys.iter();
    for i in 0..100 {
        for _ in 0..9 {
            bt = bt
                .update(|bt| {
                    for _ in 0..7 {
                        let key = next.next().unwrap();
                        let off = (data.len() + 1) as u64;
                        source.add(off, key);
                        data.insert(key.clone(), off);
                        bt.insert(key, off)?;
                    }
                    Ok(())
                })
                .unwrap();
        }
        check_paths(&bt);
        bt = bt.save(false).unwrap();
        if i % 10 == 9 {
            check_paths(&bt);
            check_data(&bt, &data);
        }
    }
    // a final flatten clears every redirect and preserves the data
    bt = bt.save(true).unwrap();
    assert_eq!(bt.redirs().len(), 0);
    assert_eq!(bt.redirs().path_count(), 0);
    check_data(&bt, &data);
}

#[test]
fn builder_bulk_load() {
    let source = KeySource::default();
    let stor = Arc::new(Stor::heap(256 * 1024));
    stor.alloc(1);
    let mut bldr = BtreeBuilder::new(stor, Spec::default(), 64, source.extractor());
    let mut data = BTreeMap::new();
    for i in 100..999u64 {
        let key = i.to_string().into_bytes();
        source.add(i, &key);
        data.insert(key.clone(), i);
        bldr.add(&key, i).unwrap();
    }
    let bt = bldr.finish().unwrap();
    assert!(bt.tree_levels() > 0);
    assert_eq!(bt.redirs().len(), 0);
    check_data(&bt, &data);
    // bulk-loaded leaves pack densely
    let (_, size, nnodes) = bt.check().unwrap();
    let full = size as f64 / nnodes as f64 / 64.0;
    assert!(full > 0.8, "expected builder fill > 0.8, got {full:.2}");
}

#[test]
fn builder_rejects_unsorted_keys() {
    let stor = Arc::new(Stor::heap(8192));
    stor.alloc(1);
    let mut bldr = BtreeBuilder::new(stor, Spec::default(), 64, digits_extractor());
    bldr.add(b"b", 1).unwrap();
    assert!(bldr.add(b"a", 2).is_err());
    assert!(bldr.add(b"b", 3).is_err());
}

#[test]
fn builder_empty_tree() {
    let stor = Arc::new(Stor::heap(8192));
    stor.alloc(1);
    let bt = BtreeBuilder::new(stor, Spec::default(), 64, digits_extractor())
        .finish()
        .unwrap();
    assert_eq!(bt.tree_levels(), 0);
    let mut it = bt.iter(true);
    assert_eq!(it.next().unwrap(), None);
    assert!(!bt.prefix_exists(b"").unwrap());
}

#[test]
fn merge_delete_all_empties_tree() {
    let stor = Arc::new(Stor::heap(256 * 1024));
    stor.alloc(1);
    let mut bldr = BtreeBuilder::new(stor, Spec::default(), 64, digits_extractor());
    for i in 100..999u64 {
        bldr.add(i.to_string().as_bytes(), i).unwrap();
    }
    let bt = bldr.finish().unwrap();

    let buf = InterBuf::new();
    for i in 100..999u64 {
        buf.delete(i.to_string().as_bytes(), i).unwrap();
    }
    let bt = bt.merge(buf.iter()).unwrap();

    let mut it = bt.iter(true);
    assert_eq!(it.next().unwrap(), None);
    assert!(!bt.prefix_exists(b"").unwrap());
    assert_eq!(bt.tree_levels(), 0);
}

#[test]
fn merge_random_ops_match_model() {
    let mut rng = StdRng::seed_from_u64(5);
    let source = KeySource::default();
    let stor = Arc::new(Stor::heap(4 * 1024 * 1024));
    stor.alloc(1);
    let mut bt = Btree::create(stor, Spec::default(), 64, source.extractor());
    let mut model: BTreeMap<Vec<u8>, u64> = BTreeMap::new();
    let mut next_off = 1u64;

    for _ in 0..60 {
        let buf = InterBuf::new();
        for _ in 0..200 {
            match rng.gen_range(0..4) {
                0 | 1 => {
                    let key = loop {
                        let k = unique_random_keys(&mut rng, 1, 4, 9, b"abcdef").pop().unwrap();
                        if !model.contains_key(&k) {
                            break k;
                        }
                    };
                    let off = next_off;
                    next_off += 1;
                    source.add(off, &key);
                    buf.insert(&key, off).unwrap();
                    model.insert(key, off);
                }
                2 if !model.is_empty() => {
                    let key = model.keys().nth(rng.gen_range(0..model.len())).cloned().unwrap();
                    let off = next_off;
                    next_off += 1;
                    source.add(off, &key);
                    buf.update(&key, off).unwrap();
                    model.insert(key, off);
                }
                3 if !model.is_empty() => {
                    let key = model.keys().nth(rng.gen_range(0..model.len())).cloned().unwrap();
                    let off = model.remove(&key).unwrap();
                    buf.delete(&key, off).unwrap();
                }
                _ => {}
            }
        }
        // edits staged against the model may mention keys the buffer saw
        // for the first time; the merged tree must match the model anyway
        bt = bt.merge(buf.iter()).unwrap();
    }
    bt = bt.save(false).unwrap();
    check_data(&bt, &model);
}

#[test]
fn prefix_exists_survives_boundary_delete() {
    let key = |i: u64| -> Vec<u8> {
        let group = if i >= 16 { "2" } else { "1" };
        format!("{group}\x00\x00{i:02}").into_bytes()
    };
    let keys: Vec<Vec<u8>> = (0..22u64).map(key).collect();
    let source = KeySource::default();
    let stor = Arc::new(Stor::heap(64 * 1024));
    stor.alloc(1);
    let mut bldr = BtreeBuilder::new(stor, Spec::default(), 200, source.extractor());
    for (i, key) in keys.iter().enumerate() {
        source.add(i as u64 + 1, key);
        bldr.add(key, i as u64 + 1).unwrap();
    }
    let bt = bldr.finish().unwrap();

    // delete the first "2"-group key, which sat at a node boundary
    let buf = InterBuf::new();
    buf.delete(&keys[16], 17).unwrap();
    let bt = bt.merge(buf.iter()).unwrap();

    assert!(bt.prefix_exists(b"2").unwrap());
    assert!(bt.prefix_exists(b"1").unwrap());
    assert!(!bt.prefix_exists(b"3").unwrap());
}

#[test]
fn flatten_with_and_without_saves() {
    let source = KeySource::default();
    for save_first in [false, true] {
        for grow_node in [999usize, 90] {
            let stor = Arc::new(Stor::heap(1024 * 1024));
            stor.alloc(1);
            let mut bldr = BtreeBuilder::new(stor.clone(), Spec::default(), 96, source.extractor());
            let mut data = BTreeMap::new();
            for i in (10_000..10_800u64).step_by(2) {
                let key = i.to_string().into_bytes();
                source.add(i, &key);
                data.insert(key.clone(), i);
                bldr.add(&key, i).unwrap();
            }
            let bt = bldr.finish().unwrap();
            assert!(bt.tree_levels() >= 1);

            // insert into the middle with splitting prevented or forced
            let mut bt = bt.clone();
            bt.max_node_size = grow_node;
            let key = b"10051".to_vec();
            source.add(10051, &key);
            data.insert(key.clone(), 10051);
            let mut bt = bt
                .update(|bt| {
                    bt.insert(b"10051", 10051)?;
                    Ok(())
                })
                .unwrap();
            check_data(&bt, &data);
            if save_first {
                bt = bt.save(false).unwrap();
                check_data(&bt, &data);
            }
            let bt = bt.save(true).unwrap();
            assert_eq!(bt.redirs().len(), 0);
            check_data(&bt, &data);

            // reopen from the flattened root: no redirects on disk either
            let bt2 = Btree::open(
                stor,
                bt.root(),
                bt.tree_levels(),
                bt.redirs_off(),
                Spec::default(),
                96,
                source.extractor(),
            )
            .unwrap();
            assert_eq!(bt2.redirs_off(), 0);
            check_data(&bt2, &data);
        }
    }
}

#[test]
fn split_separators_are_shortest_prefixes() {
    // adjacent keys sharing long prefixes force separator computation
    let source = KeySource::default();
    let bt = heap_tree(64 * 1024, 44, source.extractor());
    let mut data = BTreeMap::new();
    let groups: [&[u8]; 5] = [b"aaaa", b"aaab", b"ab", b"b", b"bbbbbb"];
    let bt = bt
        .update(|bt| {
            let mut off = 1u64;
            for group in groups {
                for i in 0..20u8 {
                    let mut key = group.to_vec();
                    key.push(b'0' + (i % 10));
                    key.push(b'0' + (i / 10));
                    if data.contains_key(&key) {
                        continue;
                    }
                    source.add(off, &key);
                    data.insert(key.clone(), off);
                    bt.insert(&key, off)?;
                    off += 1;
                }
            }
            Ok(())
        })
        .unwrap();
    check_data(&bt, &data);
    // interior keys must never be full keys when a shorter separator works
    let (_, _, nnodes) = bt.check().unwrap();
    assert!(nnodes > 1);
}

#[test]
fn node_sequence_compression_round_trips_on_disk() {
    // spot-check the on-disk entry grammar straight through a chunk
    let stor = Stor::heap(8192);
    let data = node::build(&[
        (b"carrot".to_vec(), 9),
        (b"carrots".to_vec(), 10),
        (b"cart".to_vec(), 11),
    ]);
    let off = Btree::write_node_chunk(&stor, &data);
    let bt_stor = Arc::new(stor);
    let bt = Btree::open(
        bt_stor,
        off,
        0,
        0,
        Spec::default(),
        64,
        digits_extractor(),
    )
    .unwrap();
    assert_eq!(bt.search(b"carrot").unwrap(), Some(9));
    assert_eq!(bt.search(b"carrots").unwrap(), Some(10));
    assert_eq!(bt.search(b"cart").unwrap(), Some(11));
    assert_eq!(bt.search(b"car").unwrap(), None);
}
