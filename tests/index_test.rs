//! Index lifecycle end to end: builds from existing data, temporal build
//! paths, constraint checks inside live transactions, and the check scoping
//! that keeps replay silent.

use rustc_hash::FxHashMap;

use marl::catalog::{Column, Database, Table};
use marl::core::{ConstraintKind, DataType, Error, IndexKey, Pos, ReplayConfig, Value};
use marl::index::Index;
use marl::replay::replay;
use marl::txn::{Change, RowChange};

const PEOPLE: Pos = 10;
const COL_ID: Pos = 100;
const COL_NAME: Pos = 101;
const COL_FROM: Pos = 102;
const PK: Pos = 1;

fn setup() -> Database {
    let db = Database::in_memory("test");
    db.create_table(Table::new(
        PEOPLE,
        "people",
        vec![
            Column::new(COL_ID, "id", DataType::Integer),
            Column::new(COL_NAME, "name", DataType::Text),
            Column::new(COL_FROM, "valid_from", DataType::Integer),
        ],
    ));
    db.create_index(
        Index::new(PK, "people_pk", PEOPLE, ConstraintKind::PrimaryKey, vec![COL_ID]).unwrap(),
    )
    .unwrap();
    db
}

fn person(id: i64, name: &str) -> FxHashMap<Pos, Value> {
    [(COL_ID, Value::integer(id)), (COL_NAME, Value::text(name))]
        .into_iter()
        .collect()
}

#[test]
fn test_build_over_existing_rows() {
    let db = setup();

    let mut txn = db.begin();
    for (id, name) in [(3, "carol"), (1, "ann"), (2, "bob")] {
        txn.insert(PEOPLE, person(id, name)).unwrap();
    }
    txn.commit().unwrap();

    // Built after the fact, the unique name index covers the existing rows
    // (scanning the primary index, since one exists)
    db.create_index(
        Index::new(2, "people_name", PEOPLE, ConstraintKind::Unique, vec![COL_NAME]).unwrap(),
    )
    .unwrap();

    let view = db.snapshot();
    let names: Vec<String> = view
        .index(2)
        .unwrap()
        .rows
        .iter()
        .map(|(k, _)| k.0[0].to_string())
        .collect();
    assert_eq!(names, vec!["'ann'", "'bob'", "'carol'"]);
}

#[test]
fn test_build_without_primary_falls_back_to_table_scan() {
    let db = Database::in_memory("test");
    db.create_table(Table::new(
        PEOPLE,
        "people",
        vec![
            Column::new(COL_ID, "id", DataType::Integer),
            Column::new(COL_NAME, "name", DataType::Text),
        ],
    ));

    // No primary index; rows arrive via replayed history
    let mut source = (0..5i64)
        .map(|i| {
            Ok(Change::Record(RowChange::new(
                1000 + i,
                PEOPLE,
                person(i, &format!("p{}", i)),
            )))
        })
        .collect::<Vec<_>>()
        .into_iter();
    replay(&db, &mut source, &ReplayConfig::default()).unwrap();

    db.create_index(
        Index::new(2, "people_name", PEOPLE, ConstraintKind::Unique, vec![COL_NAME]).unwrap(),
    )
    .unwrap();
    assert_eq!(db.snapshot().index(2).unwrap().rows.len(), 5);
}

#[test]
fn test_build_duplicate_names_table_and_index() {
    let db = setup();

    let mut txn = db.begin();
    txn.insert(PEOPLE, person(1, "ann")).unwrap();
    txn.insert(PEOPLE, person(2, "ann")).unwrap();
    txn.commit().unwrap();

    let err = db
        .create_index(
            Index::new(2, "people_name", PEOPLE, ConstraintKind::Unique, vec![COL_NAME]).unwrap(),
        )
        .unwrap_err();

    match &err {
        Error::DuplicateKey { table, index, .. } => {
            assert_eq!(table, "people");
            assert_eq!(index, "people_name");
        }
        other => panic!("expected DuplicateKey, got {:?}", other),
    }
}

#[test]
fn test_system_temporal_build_skips_null_starts() {
    let db = setup();

    let mut txn = db.begin();
    // Two rows with a validity start, one without
    let mut with_start = person(1, "ann");
    with_start.insert(COL_FROM, Value::integer(2020));
    txn.insert(PEOPLE, with_start).unwrap();

    let mut with_start = person(2, "bob");
    with_start.insert(COL_FROM, Value::integer(2021));
    let bob = txn.insert(PEOPLE, with_start).unwrap();

    txn.insert(PEOPLE, person(3, "carol")).unwrap();
    txn.commit().unwrap();

    // An update creates a second version of bob
    let mut txn = db.begin();
    txn.update(PEOPLE, bob, [(COL_FROM, Value::integer(2022))].into_iter().collect())
        .unwrap();
    txn.commit().unwrap();

    db.create_index(
        Index::new(
            3,
            "people_hist",
            PEOPLE,
            ConstraintKind::SystemTemporal,
            vec![COL_FROM],
        )
        .unwrap(),
    )
    .unwrap();

    // Versions: ann@2020, bob@2021, carol@null (skipped), bob@2022
    let view = db.snapshot();
    let idx = view.index(3).unwrap();
    assert_eq!(idx.rows.entry_count(), 3);
    let starts: Vec<String> = idx.rows.iter().map(|(k, _)| k.0[0].to_string()).collect();
    assert_eq!(starts, vec!["2020", "2021", "2022"]);
}

#[test]
fn test_application_temporal_build_covers_every_version() {
    let db = setup();

    let mut txn = db.begin();
    let ann = txn.insert(PEOPLE, person(1, "ann")).unwrap();
    txn.commit().unwrap();

    let mut txn = db.begin();
    txn.update(PEOPLE, ann, [(COL_NAME, Value::text("anna"))].into_iter().collect())
        .unwrap();
    txn.commit().unwrap();

    db.create_index(
        Index::new(
            3,
            "people_app",
            PEOPLE,
            ConstraintKind::ApplicationTemporal,
            vec![COL_ID],
        )
        .unwrap(),
    )
    .unwrap();

    // Both versions of the row appear, chained under the same key and
    // carrying the log positions that produced them
    let view = db.snapshot();
    let idx = view.index(3).unwrap();
    assert_eq!(idx.rows.len(), 1);
    assert_eq!(idx.rows.entry_count(), 2);
    let chain = idx.rows.rows_for(&IndexKey::new(vec![Value::integer(1)]));
    assert_eq!(chain, &[0, 1]);
}

#[test]
fn test_duplicate_key_live_vs_replay() {
    // Inside a live transaction, the second insert of key 5 is rejected
    let db = setup();
    let mut txn = db.begin();
    txn.insert(PEOPLE, person(5, "ann")).unwrap();
    let err = txn.insert(PEOPLE, person(5, "bob")).unwrap_err();
    assert!(matches!(err, Error::DuplicateKey { .. }));
    txn.rollback().unwrap();

    // The identical sequence replayed as committed history must not raise
    let db = setup();
    let mut source = vec![
        Ok(Change::Record(RowChange::new(1000, PEOPLE, person(5, "ann")))),
        Ok(Change::Record(RowChange::new(1001, PEOPLE, person(5, "bob")))),
    ]
    .into_iter();
    let stats = replay(&db, &mut source, &ReplayConfig::default()).unwrap();
    assert_eq!(stats.applied, 2);
}

#[test]
fn test_foreign_key_checks() {
    let db = setup();
    db.create_table(Table::new(
        20,
        "orders",
        vec![
            Column::new(200, "id", DataType::Integer),
            Column::new(201, "person", DataType::Integer),
        ],
    ));
    db.create_index(
        Index::new(4, "orders_pk", 20, ConstraintKind::PrimaryKey, vec![200]).unwrap(),
    )
    .unwrap();
    db.create_index(Index::foreign(5, "orders_person", 20, vec![201], PEOPLE, PK, None).unwrap())
        .unwrap();

    let mut txn = db.begin();
    txn.insert(PEOPLE, person(1, "ann")).unwrap();

    // Referencing the existing person succeeds
    txn.insert(
        20,
        [(200, Value::integer(1)), (201, Value::integer(1))]
            .into_iter()
            .collect(),
    )
    .unwrap();

    // Absent target key is rejected, naming the referenced table
    let err = txn
        .insert(
            20,
            [(200, Value::integer(2)), (201, Value::integer(99))]
                .into_iter()
                .collect(),
        )
        .unwrap_err();
    match &err {
        Error::MissingForeignKey { ref_table, key } => {
            assert_eq!(ref_table, "people");
            assert_eq!(key, "[99]");
        }
        other => panic!("expected MissingForeignKey, got {:?}", other),
    }

    // A NULL foreign column makes the key malformed, a distinct failure
    let err = txn
        .insert(20, [(200, Value::integer(3))].into_iter().collect())
        .unwrap_err();
    assert_eq!(err, Error::MalformedKey { index: 5 });
}

#[test]
fn test_multi_column_key_roundtrip() {
    let db = Database::in_memory("test");
    db.create_table(Table::new(
        30,
        "readings",
        vec![
            Column::new(300, "sensor", DataType::Integer),
            Column::new(301, "at", DataType::Integer),
            Column::new(302, "value", DataType::Float),
        ],
    ));
    db.create_index(
        Index::new(6, "readings_pk", 30, ConstraintKind::PrimaryKey, vec![300, 301]).unwrap(),
    )
    .unwrap();

    let mut txn = db.begin();
    for sensor in 0..3i64 {
        for at in 0..3i64 {
            txn.insert(
                30,
                [
                    (300, Value::integer(sensor)),
                    (301, Value::integer(at)),
                    (302, Value::float(sensor as f64 + at as f64 / 10.0)),
                ]
                .into_iter()
                .collect(),
            )
            .unwrap();
        }
    }
    // Same composite key is rejected even though each column matches a
    // different existing row
    let err = txn
        .insert(
            30,
            [(300, Value::integer(1)), (301, Value::integer(2))]
                .into_iter()
                .collect(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateKey { .. }));
    txn.commit().unwrap();

    let view = db.snapshot();
    let idx = view.index(6).unwrap();
    assert_eq!(idx.rows.len(), 9);
    // Prefix scan narrows to one sensor
    let prefix = IndexKey::new(vec![Value::integer(1)]);
    assert_eq!(idx.rows.range_prefix(&prefix).count(), 3);
}
