use std::sync::Arc;

use cinderdb::config::{DbConfig, SchedulerConfig};
use cinderdb::index::ixkey::Spec;
use cinderdb::meta::{FkMode, Fkey, IndexMode, IndexSchema, Schema};
use cinderdb::{Database, Error, Stor};

fn items_schema() -> Schema {
    Schema::new(
        "items",
        vec!["id".into(), "name".into(), "qty".into()],
        Vec::new(),
        vec![
            IndexSchema {
                columns: vec!["id".into()],
                ispec: Spec::new(vec![0]),
                mode: IndexMode::Key,
                fk: None,
                fk_to_here: Vec::new(),
            },
            IndexSchema {
                columns: vec!["name".into(), "qty".into()],
                ispec: Spec::new(vec![1, 2]),
                mode: IndexMode::Index,
                fk: None,
                fk_to_here: Vec::new(),
            },
        ],
    )
}

fn small_db() -> Database {
    let stor = Arc::new(Stor::heap(1024 * 1024));
    let db = Database::create(stor, DbConfig::default().max_node_size(128));
    db.create_table(items_schema()).unwrap();
    db
}

fn row(id: &str, name: &str, qty: &str) -> Vec<Vec<u8>> {
    vec![id.into(), name.into(), qty.into()]
}

fn write_row(db: &Database, id: &str, name: &str, qty: &str) {
    let mut tran = db.transaction();
    tran.write(
        "items",
        &[id.as_bytes(), name.as_bytes(), qty.as_bytes()],
    )
    .unwrap();
    tran.commit().unwrap();
}

#[test]
fn write_read_commit_visibility() {
    let db = small_db();

    let mut tran = db.transaction();
    tran.write("items", &["a1", "anvil", "3"]).unwrap();
    tran.write("items", &["b2", "bolt", "90"]).unwrap();
    // visible to the writer before commit
    assert_eq!(
        tran.read("items", 0, b"a1").unwrap(),
        Some(row("a1", "anvil", "3"))
    );
    // not visible to a concurrent snapshot
    let mut other = db.transaction();
    assert_eq!(other.read("items", 0, b"a1").unwrap(), None);
    other.abort().unwrap();
    tran.commit().unwrap();

    let mut tran = db.transaction();
    assert_eq!(
        tran.read("items", 0, b"b2").unwrap(),
        Some(row("b2", "bolt", "90"))
    );
    // secondary index: composite key of name and qty
    assert_eq!(
        tran.read("items", 1, b"bolt\x00\x0090").unwrap(),
        Some(row("b2", "bolt", "90"))
    );
    assert_eq!(tran.read("items", 0, b"zz").unwrap(), None);
    tran.abort().unwrap();
}

#[test]
fn range_scans_span_layers() {
    let db = small_db();
    for (id, name, qty) in [
        ("a", "anvil", "1"),
        ("c", "cog", "2"),
        ("e", "edge", "3"),
        ("g", "gear", "4"),
    ] {
        write_row(&db, id, name, qty);
    }
    // half the data merged into the base, half still in layers
    db.merge_table("items").unwrap();
    write_row(&db, "b", "bolt", "5");
    write_row(&db, "f", "flange", "6");

    let mut tran = db.transaction();
    let hits = tran.range("items", 0, b"b", b"f").unwrap();
    let keys: Vec<&[u8]> = hits.iter().map(|(k, _)| k.as_slice()).collect();
    assert_eq!(keys, vec![&b"b"[..], b"c", b"e", b"f"]);
    let fields = tran.record(hits[0].1).unwrap();
    assert_eq!(fields, row("b", "bolt", "5"));
    tran.abort().unwrap();
}

#[test]
fn erase_and_update() {
    let db = small_db();
    write_row(&db, "a1", "anvil", "3");
    write_row(&db, "b2", "bolt", "90");

    let mut tran = db.transaction();
    let hits = tran.range("items", 0, b"a1", b"a1").unwrap();
    assert_eq!(hits.len(), 1);
    tran.erase("items", hits[0].1).unwrap();
    tran.commit().unwrap();

    let mut tran = db.transaction();
    assert_eq!(tran.read("items", 0, b"a1").unwrap(), None);
    // update that changes a secondary key moves the entry
    let hits = tran.range("items", 0, b"b2", b"b2").unwrap();
    tran.update("items", hits[0].1, &["b2", "bracket", "7"])
        .unwrap();
    tran.commit().unwrap();

    let mut tran = db.transaction();
    assert_eq!(
        tran.read("items", 0, b"b2").unwrap(),
        Some(row("b2", "bracket", "7"))
    );
    assert_eq!(tran.read("items", 1, b"bolt\x00\x0090").unwrap(), None);
    assert_eq!(
        tran.read("items", 1, b"bracket\x00\x007").unwrap(),
        Some(row("b2", "bracket", "7"))
    );
    tran.abort().unwrap();
}

#[test]
fn conflicting_writers_fail_fast() {
    let db = small_db();
    let mut t1 = db.transaction();
    let mut t2 = db.transaction();
    t1.write("items", &["k", "first", "1"]).unwrap();
    let err = t2.write("items", &["k", "second", "2"]).unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
    t1.commit().unwrap();
    // the losing transaction is poisoned: commit refuses
    assert!(t2.commit().is_err());

    let mut tran = db.transaction();
    assert_eq!(
        tran.read("items", 0, b"k").unwrap(),
        Some(row("k", "first", "1"))
    );
    tran.abort().unwrap();
}

#[test]
fn duplicate_keys_rejected() {
    let db = small_db();
    write_row(&db, "dup", "one", "1");
    let mut tran = db.transaction();
    let err = tran.write("items", &["dup", "two", "2"]).unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
    tran.abort().unwrap();
}

#[test]
fn snapshot_isolation_across_merge() {
    let db = small_db();
    write_row(&db, "a", "anvil", "1");

    let mut old = db.transaction();
    assert_eq!(
        old.read("items", 0, b"a").unwrap(),
        Some(row("a", "anvil", "1"))
    );

    write_row(&db, "b", "bolt", "2");
    db.merge_table("items").unwrap();

    // the old snapshot still sees only its world
    assert_eq!(old.read("items", 0, b"b").unwrap(), None);
    assert_eq!(
        old.read("items", 0, b"a").unwrap(),
        Some(row("a", "anvil", "1"))
    );
    old.abort().unwrap();

    let mut fresh = db.transaction();
    assert_eq!(
        fresh.read("items", 0, b"b").unwrap(),
        Some(row("b", "bolt", "2"))
    );
    fresh.abort().unwrap();
}

#[test]
fn aborted_writes_vanish() {
    let db = small_db();
    let mut tran = db.transaction();
    tran.write("items", &["gone", "nope", "0"]).unwrap();
    tran.abort().unwrap();

    let mut tran = db.transaction();
    assert_eq!(tran.read("items", 0, b"gone").unwrap(), None);
    tran.abort().unwrap();
}

#[test]
fn merge_then_persist_then_reopen() {
    let stor = Arc::new(Stor::heap(4 * 1024 * 1024));
    let db = Database::create(stor.clone(), DbConfig::default().max_node_size(128));
    db.create_table(items_schema()).unwrap();
    for i in 0..200 {
        let id = format!("id{i:03}");
        write_row(&db, &id, "widget", &i.to_string());
    }
    let state_off = db.persist().unwrap();
    drop(db);

    let db = Database::open(stor, state_off, DbConfig::default().max_node_size(128)).unwrap();
    let mut tran = db.transaction();
    for i in (0..200).step_by(17) {
        let id = format!("id{i:03}");
        let found = tran.read("items", 0, id.as_bytes()).unwrap();
        assert_eq!(found, Some(row(&id, "widget", &i.to_string())));
    }
    let all = tran.range("items", 0, b"id000", b"id999").unwrap();
    assert_eq!(all.len(), 200);
    tran.abort().unwrap();
}

#[test]
fn file_backed_full_cycle() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("items.cdb");
    let state_off;
    {
        let stor = Arc::new(Stor::open(&path).unwrap());
        let db = Database::create(stor, DbConfig::default());
        db.create_table(items_schema()).unwrap();
        write_row(&db, "persisted", "anvil", "3");
        state_off = db.persist().unwrap();
    }
    {
        let stor = Arc::new(Stor::open(&path).unwrap());
        let db = Database::open(stor, state_off, DbConfig::default()).unwrap();
        let mut tran = db.transaction();
        assert_eq!(
            tran.read("items", 0, b"persisted").unwrap(),
            Some(row("persisted", "anvil", "3"))
        );
        tran.abort().unwrap();

        // and the reopened database accepts new work
        write_row(&db, "fresh", "bolt", "1");
        let mut tran = db.transaction();
        assert!(tran.read("items", 0, b"fresh").unwrap().is_some());
        tran.abort().unwrap();
    }
}

#[test]
fn drop_table_hides_and_survives_persist() {
    let stor = Arc::new(Stor::heap(1024 * 1024));
    let db = Database::create(stor.clone(), DbConfig::default());
    db.create_table(items_schema()).unwrap();
    write_row(&db, "a", "anvil", "1");
    let state_off = db.persist().unwrap();

    db.drop_table("items").unwrap();
    let mut tran = db.transaction();
    assert!(tran.read("items", 0, b"a").is_err());
    tran.abort().unwrap();
    assert!(db.drop_table("items").is_err());

    // the tombstone shadows the older chunk after reopen too
    let state_off2 = db.persist().unwrap();
    assert_ne!(state_off, state_off2);
    drop(db);
    let db = Database::open(stor, state_off2, DbConfig::default()).unwrap();
    let mut tran = db.transaction();
    assert!(tran.read("items", 0, b"a").is_err());
    tran.abort().unwrap();
}

#[test]
fn foreign_keys_survive_reopen() {
    let stor = Arc::new(Stor::heap(1024 * 1024));
    let db = Database::create(stor.clone(), DbConfig::default());
    db.create_table(items_schema()).unwrap();
    let orders = Schema::new(
        "orders",
        vec!["oid".into(), "item".into()],
        Vec::new(),
        vec![
            IndexSchema {
                columns: vec!["oid".into()],
                ispec: Spec::new(vec![0]),
                mode: IndexMode::Key,
                fk: None,
                fk_to_here: Vec::new(),
            },
            IndexSchema {
                columns: vec!["item".into()],
                ispec: Spec {
                    fields: vec![1],
                    fields2: vec![0],
                },
                mode: IndexMode::Index,
                fk: Some(Fkey {
                    table: "items".into(),
                    columns: vec!["id".into()],
                    mode: FkMode::Block,
                }),
                fk_to_here: Vec::new(),
            },
        ],
    );
    db.create_table(orders).unwrap();
    let state_off = db.persist().unwrap();
    drop(db);

    let db = Database::open(stor, state_off, DbConfig::default()).unwrap();
    let state = db.state();
    let items = state.meta.get_schema("items").unwrap();
    assert_eq!(items.indexes[0].fk_to_here.len(), 1);
    assert_eq!(items.indexes[0].fk_to_here[0].table, "orders");
    let orders = state.meta.get_schema("orders").unwrap();
    assert_eq!(orders.indexes[1].fk.as_ref().unwrap().table, "items");
}

#[tokio::test]
async fn background_pipeline_end_to_end() {
    use cinderdb::scheduler::Scheduler;
    use std::time::Duration;

    let stor = Arc::new(Stor::heap(4 * 1024 * 1024));
    let config = DbConfig::default().scheduler(
        SchedulerConfig::default()
            .merge_interval(Duration::from_millis(5))
            .persist_interval(Duration::from_millis(25)),
    );
    let db = Arc::new(Database::create(stor, config.clone()));
    db.create_table(items_schema()).unwrap();

    let scheduler = Scheduler::new();
    scheduler.register_pipeline(db.clone(), &config.scheduler);
    for i in 0..50 {
        write_row(&db, &format!("k{i:02}"), "part", &i.to_string());
    }
    tokio::time::sleep(Duration::from_millis(80)).await;
    scheduler.shutdown().await.unwrap();

    assert!(db.merge_ready().is_empty());
    assert_ne!(db.state().state_off, 0);
    let mut tran = db.transaction();
    assert_eq!(tran.range("items", 0, b"k00", b"k99").unwrap().len(), 50);
    tran.abort().unwrap();
}
