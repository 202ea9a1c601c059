//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

mod common;

use common::*;
use db_replication::message::{decode, encode, maybe_decompress};
use db_replication::session::merge_snapshot;
use db_replication::watch::sort_by_repl_key;
use db_replication::{DefaultMapper, MapperConfig, NameMapper, TableToWatch};
use proptest::prelude::*;
use std::collections::BTreeMap;

fn ident() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,12}"
}

// =============================================================================
// Name Mapping Properties
// =============================================================================

proptest! {
    /// Mapping is deterministic and ignores the case of the source name
    #[test]
    fn mapper_deterministic_and_case_insensitive(
        tables in prop::collection::btree_map(ident(), ident(), 0..8),
        name in ident(),
    ) {
        let config = MapperConfig { tables: tables.clone(), ..Default::default() };
        let mapper = DefaultMapper::new(&config);

        let lower = mapper.map_table(None, None, &name, None);
        let upper = mapper.map_table(None, None, &name.to_uppercase(), None);
        prop_assert_eq!(&lower, &mapper.map_table(None, None, &name, None));

        match tables.get(&name) {
            Some(dst) => {
                prop_assert_eq!(&lower, &Some(dst.clone()));
                prop_assert_eq!(&lower, &upper);
            }
            // Unlisted names keep their spelling
            None => {
                prop_assert_eq!(lower, Some(name.clone()));
                prop_assert_eq!(upper, Some(name.to_uppercase()));
            }
        }
    }

    /// Unlisted columns pass through; columns mapped to empty are dropped
    #[test]
    fn mapper_column_drop(column in ident(), dropped in ident()) {
        prop_assume!(column != dropped);
        let mut config = MapperConfig::default();
        config.columns.insert(dropped.clone(), String::new());
        let mapper = DefaultMapper::new(&config);

        prop_assert_eq!(mapper.map_column(None, None, "t", &column), Some(column.clone()));
        prop_assert_eq!(mapper.map_column(None, None, "t", &dropped), None);
    }
}

// =============================================================================
// Watched Table Configuration Properties
// =============================================================================

proptest! {
    /// `table.<schema>.<table> = <replicate>,<trigger>,<replKey>` parses field by field
    #[test]
    fn table_property_parsing(
        schema in ident(),
        table in ident(),
        replicate in any::<bool>(),
        trigger in ident(),
        repl_key in -1i64..1_000_000,
    ) {
        let key = format!("table.{}.{}", schema, table);
        let value = format!("{},{},{}", replicate, trigger, repl_key);
        let entry = TableToWatch::from_property(&key, &value).unwrap();

        prop_assert_eq!(entry.schema(), Some(schema.as_str()));
        prop_assert_eq!(entry.catalog(), None);
        prop_assert_eq!(&entry.table, &table);
        prop_assert_eq!(entry.replicate, replicate);
        prop_assert_eq!(entry.trigger.as_deref(), Some(trigger.as_str()));
        prop_assert_eq!(entry.repl_key, repl_key);
        prop_assert_eq!(entry.config_key(), key);
    }

    /// Sorting by replKey is stable and ordered
    #[test]
    fn sort_by_repl_key_ordered(keys in prop::collection::vec(-1i64..20, 0..30)) {
        let mut tables: Vec<TableToWatch> = keys
            .iter()
            .enumerate()
            .map(|(i, k)| {
                let mut t = TableToWatch::new(None, None, &format!("t{}", i));
                t.repl_key = *k;
                t
            })
            .collect();
        sort_by_repl_key(&mut tables);

        for pair in tables.windows(2) {
            prop_assert!(pair[0].repl_key <= pair[1].repl_key);
            if pair[0].repl_key == pair[1].repl_key {
                let a: usize = pair[0].table[1..].parse().unwrap();
                let b: usize = pair[1].table[1..].parse().unwrap();
                prop_assert!(a < b);
            }
        }
    }
}

// =============================================================================
// Codec Properties
// =============================================================================

proptest! {
    /// Non-zstd data passes through maybe_decompress unchanged
    #[test]
    fn decompress_passthrough_non_zstd(data in prop::collection::vec(any::<u8>(), 0..1000)) {
        prop_assume!(data.len() < 4 || data[..4] != [0x28, 0xB5, 0x2F, 0xFD]);
        prop_assert_eq!(maybe_decompress(&data).unwrap(), data);
    }

    /// The compression threshold never changes what decodes
    #[test]
    fn encode_threshold_transparent(val in ".{0,200}", threshold in 0usize..400) {
        let msg = insert("t", 1, 1, &val);
        let decoded = decode(&encode(&msg, threshold).unwrap()).unwrap();
        prop_assert_eq!(decoded, msg);
    }
}

// =============================================================================
// Snapshot Merge Properties
// =============================================================================

proptest! {
    /// Held rows below the snapshot start never survive the merge; all others do
    #[test]
    fn merge_drops_exactly_rows_below_snapshot(
        keys in prop::collection::btree_set(1i64..1000, 0..30),
        min in 1i64..1000,
    ) {
        let held: Vec<_> = keys.iter().map(|k| insert("t", *k, *k, "v")).collect();
        let merged = merge_snapshot(Vec::new(), held, min);

        let kept: Vec<i64> = merged
            .iter()
            .flat_map(|m| m.rows.iter().filter_map(|r| r.repl_key()))
            .collect();
        let expected: Vec<i64> = keys.iter().copied().filter(|k| *k >= min).collect();
        prop_assert_eq!(kept, expected);
    }
}

// =============================================================================
// Apply Properties
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Insert(i64, String),
    Update(i64, String),
    Delete(i64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0i64..8, "[a-z]{1,6}").prop_map(|(id, v)| Op::Insert(id, v)),
        (0i64..8, "[a-z]{1,6}").prop_map(|(id, v)| Op::Update(id, v)),
        (0i64..8).prop_map(Op::Delete),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Any valid DML sequence leaves the destination equal to a map model
    #[test]
    fn apply_matches_model(ops in prop::collection::vec(op(), 1..40)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let config = slave_config(dir.path(), false);
            let engine = slave_engine(dir.path(), &config, 1).await;
            engine.store(&create_kv("t")).await.unwrap();

            let mut model: BTreeMap<i64, String> = BTreeMap::new();
            let mut key = 0i64;
            for op in ops {
                key += 1;
                let msg = match op {
                    Op::Insert(id, v) if !model.contains_key(&id) => {
                        model.insert(id, v.clone());
                        insert("t", key, id, &v)
                    }
                    Op::Update(id, v) if model.contains_key(&id) => {
                        model.insert(id, v.clone());
                        update("t", key, id, &v)
                    }
                    Op::Delete(id) if model.contains_key(&id) => {
                        model.remove(&id);
                        delete("t", key, id)
                    }
                    _ => continue,
                };
                engine.store(&msg).await.unwrap();
            }

            let expected: Vec<(i64, Option<String>)> =
                model.into_iter().map(|(id, v)| (id, Some(v))).collect();
            assert_eq!(fetch_kv(engine.pool(), "t").await, expected);
        });
    }
}
