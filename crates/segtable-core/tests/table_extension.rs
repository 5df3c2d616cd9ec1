//! Integration tests: table segments through the container table API.
//!
//! These tests exercise the full put -> key index -> segment log pipeline,
//! plus the background writer, iteration, and recovery after reopening the
//! container directory.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use tempfile::TempDir;

use segtable_core::{
    Config, ContainerTableExtension, IteratorState, KeyHash, KeyHasher, KeyVersion, SegmentAccess,
    SegmentAttributes, SegmentContainer, TableEntry, TableError, TableKey, MAX_SERIALIZATION_LENGTH,
};

const TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn test_tables(config: Config) -> (ContainerTableExtension, Arc<SegmentContainer>, TempDir) {
    let dir = TempDir::new().unwrap();
    let container = Arc::new(SegmentContainer::open(dir.path(), 1).unwrap());
    let tables = ContainerTableExtension::new(Arc::clone(&container), config).unwrap();
    (tables, container, dir)
}

fn get_values(tables: &ContainerTableExtension, segment: &str, keys: &[&str]) -> Vec<Option<String>> {
    let keys: Vec<Vec<u8>> = keys.iter().map(|k| k.as_bytes().to_vec()).collect();
    tables
        .get(segment, &keys, TIMEOUT)
        .unwrap()
        .into_iter()
        .map(|e| e.map(|e| String::from_utf8(e.value).unwrap()))
        .collect()
}

fn segment_length(container: &SegmentContainer, segment: &str) -> u64 {
    container.for_segment(segment).unwrap().info().unwrap().length
}

fn always_seven(_key: &[u8]) -> KeyHash {
    KeyHash::new(7)
}

// ---------------------------------------------------------------------------
// Basic Table Operations
// ---------------------------------------------------------------------------

#[test]
fn test_put_get() {
    let (tables, _container, _dir) = test_tables(Config::default());
    tables.create_segment("t", TIMEOUT).unwrap();

    let versions = tables
        .put("t", vec![TableEntry::unversioned("k1", "1"), TableEntry::unversioned("k2", "2")], TIMEOUT)
        .unwrap();
    assert_eq!(versions.len(), 2);
    assert!(versions[0] < versions[1]);

    assert_eq!(
        get_values(&tables, "t", &["k1", "k2", "k3"]),
        vec![Some("1".to_string()), Some("2".to_string()), None]
    );

    let found = tables.get("t", &[b"k2".to_vec()], TIMEOUT).unwrap();
    assert_eq!(found[0].as_ref().unwrap().version(), Some(versions[1]));
}

#[test]
fn test_overwrite_and_remove() {
    let (tables, _container, _dir) = test_tables(Config::default());
    tables.create_segment("t", TIMEOUT).unwrap();

    tables.put("t", vec![TableEntry::unversioned("k", "old")], TIMEOUT).unwrap();
    tables.put("t", vec![TableEntry::unversioned("k", "new")], TIMEOUT).unwrap();
    assert_eq!(get_values(&tables, "t", &["k"]), vec![Some("new".to_string())]);

    tables.remove("t", vec![TableKey::unversioned("k")], TIMEOUT).unwrap();
    assert_eq!(get_values(&tables, "t", &["k"]), vec![None]);

    // Removing a missing key is not an error.
    tables.remove("t", vec![TableKey::unversioned("missing")], TIMEOUT).unwrap();
}

#[test]
fn test_conditional_put() {
    let (tables, container, _dir) = test_tables(Config::default());
    tables.create_segment("t", TIMEOUT).unwrap();

    let v1 = tables.put("t", vec![TableEntry::not_exists("k", "a")], TIMEOUT).unwrap()[0];
    let v2 = tables.put("t", vec![TableEntry::versioned("k", "b", v1)], TIMEOUT).unwrap()[0];
    assert!(v2 > v1);

    // Stale version: the whole batch is rejected, including the valid entry.
    let length = segment_length(&container, "t");
    let err = tables
        .put("t", vec![TableEntry::unversioned("other", "x"), TableEntry::versioned("k", "c", v1)], TIMEOUT)
        .unwrap_err();
    match err {
        TableError::BadVersion { key, expected, actual } => {
            assert_eq!(key, b"k".to_vec());
            assert_eq!(expected, KeyVersion::Exact(v1));
            assert_eq!(actual, KeyVersion::Exact(v2));
        }
        other => panic!("expected BadVersion, got {:?}", other),
    }
    assert_eq!(segment_length(&container, "t"), length);
    assert_eq!(get_values(&tables, "t", &["k", "other"]), vec![Some("b".to_string()), None]);

    // Key exists, so NotExists fails.
    assert!(matches!(
        tables.put("t", vec![TableEntry::not_exists("k", "d")], TIMEOUT),
        Err(TableError::BadVersion { actual: KeyVersion::Exact(_), .. })
    ));
}

#[test]
fn test_conditional_remove() {
    let (tables, _container, _dir) = test_tables(Config::default());
    tables.create_segment("t", TIMEOUT).unwrap();

    let v1 = tables.put("t", vec![TableEntry::unversioned("k", "a")], TIMEOUT).unwrap()[0];
    assert!(matches!(
        tables.remove("t", vec![TableKey::versioned("k", v1 + 1)], TIMEOUT),
        Err(TableError::BadVersion { .. })
    ));
    assert_eq!(get_values(&tables, "t", &["k"]), vec![Some("a".to_string())]);

    tables.remove("t", vec![TableKey::versioned("k", v1)], TIMEOUT).unwrap();
    assert_eq!(get_values(&tables, "t", &["k"]), vec![None]);

    // A removed key counts as not existing.
    tables.put("t", vec![TableEntry::not_exists("k", "again")], TIMEOUT).unwrap();
}

#[test]
fn test_concurrent_conditional_puts() {
    let (tables, _container, _dir) = test_tables(Config::default());
    tables.create_segment("t", TIMEOUT).unwrap();
    let v1 = tables.put("t", vec![TableEntry::unversioned("k", "base")], TIMEOUT).unwrap()[0];

    let tables = Arc::new(tables);
    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = ["left", "right"]
        .into_iter()
        .map(|value| {
            let tables = Arc::clone(&tables);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                tables.put("t", vec![TableEntry::versioned("k", value, v1)], TIMEOUT)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let successes = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1);
    assert!(results.iter().any(|r| matches!(r, Err(TableError::BadVersion { .. }))));

    let value = get_values(&tables, "t", &["k"]).remove(0).unwrap();
    assert!(value == "left" || value == "right");
}

#[test]
fn test_conditional_puts_with_writer_resets() {
    let (tables, _container, _dir) = test_tables(Config::default());
    tables.create_segment("t", TIMEOUT).unwrap();
    let mut version = tables.put("t", vec![TableEntry::unversioned("k", "base")], TIMEOUT).unwrap()[0];
    let stop = AtomicBool::new(false);
    let barrier = Barrier::new(2);
    let mut failure = None;

    thread::scope(|scope| {
        scope.spawn(|| {
            while !stop.load(Ordering::Acquire) {
                tables.create_writer_processor("t").unwrap().close();
                thread::sleep(Duration::from_micros(50));
            }
        });

        for round in 0..300 {
            let writers: Vec<_> = ["left", "right"]
                .into_iter()
                .map(|side| {
                    let (tables, barrier) = (&tables, &barrier);
                    scope.spawn(move || {
                        barrier.wait();
                        let value = format!("{}-{}", side, round);
                        tables.put("t", vec![TableEntry::versioned("k", value, version)], TIMEOUT)
                    })
                })
                .collect();
            let results: Vec<_> = writers.into_iter().map(|w| w.join().unwrap()).collect();
            let winners: Vec<u64> = results.iter().filter_map(|r| r.as_ref().ok().map(|v| v[0])).collect();
            if winners.len() != 1 {
                failure = Some(format!("round {}: {:?}", round, results));
                break;
            }
            version = winners[0];
        }
        // Stop the resetter before asserting so a failure cannot hang the scope.
        stop.store(true, Ordering::Release);
    });
    assert_eq!(failure, None);

    let value = get_values(&tables, "t", &["k"]).remove(0).unwrap();
    assert!(value.ends_with("-299"));
}

#[test]
fn test_concurrent_unconditional_puts() {
    let (tables, _container, _dir) = test_tables(Config::default());
    tables.create_segment("t", TIMEOUT).unwrap();
    let tables = Arc::new(tables);

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let tables = Arc::clone(&tables);
            thread::spawn(move || {
                for i in 0..25 {
                    let key = format!("t{}-k{}", t, i);
                    tables.put("t", vec![TableEntry::unversioned(key, i.to_string())], TIMEOUT).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for t in 0..4 {
        for i in 0..25 {
            let key = format!("t{}-k{}", t, i);
            assert_eq!(get_values(&tables, "t", &[key.as_str()]), vec![Some(i.to_string())]);
        }
    }
}

#[test]
fn test_hash_collisions_keep_both_keys() {
    let dir = TempDir::new().unwrap();
    let container = Arc::new(SegmentContainer::open(dir.path(), 1).unwrap());
    let tables =
        ContainerTableExtension::with_hasher(container, Config::default(), KeyHasher::custom(always_seven)).unwrap();
    tables.create_segment("t", TIMEOUT).unwrap();

    tables.put("t", vec![TableEntry::unversioned("a", "1")], TIMEOUT).unwrap();
    tables.put("t", vec![TableEntry::unversioned("b", "2")], TIMEOUT).unwrap();
    tables.put("t", vec![TableEntry::unversioned("a", "3")], TIMEOUT).unwrap();
    assert_eq!(get_values(&tables, "t", &["a", "b", "c"]), vec![Some("3".to_string()), Some("2".to_string()), None]);

    tables.remove("t", vec![TableKey::unversioned("a")], TIMEOUT).unwrap();
    assert_eq!(get_values(&tables, "t", &["a", "b"]), vec![None, Some("2".to_string())]);

    let mut iter = tables.entry_iterator("t", None, TIMEOUT).unwrap();
    let item = iter.next().unwrap().unwrap();
    assert_eq!(item.entries.len(), 1);
    assert_eq!(item.entries[0].key.key, b"b".to_vec());
    assert!(iter.next().unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Limits and Failures
// ---------------------------------------------------------------------------

#[test]
fn test_batch_too_large() {
    let (tables, container, _dir) = test_tables(Config::default());
    tables.create_segment("t", TIMEOUT).unwrap();

    let oversized = vec![0u8; MAX_SERIALIZATION_LENGTH];
    let err = tables.put("t", vec![TableEntry::unversioned("k", oversized)], TIMEOUT).unwrap_err();
    assert!(matches!(err, TableError::CapacityExceeded { .. }));
    assert_eq!(segment_length(&container, "t"), 0);

    let mut config = Config::default();
    config.max_batch_size = MAX_SERIALIZATION_LENGTH;
    let (tables, container, _dir) = test_tables(config);
    tables.create_segment("t", TIMEOUT).unwrap();
    let half = vec![0u8; MAX_SERIALIZATION_LENGTH / 2];
    let err = tables
        .put("t", vec![TableEntry::unversioned("a", half.clone()), TableEntry::unversioned("b", half)], TIMEOUT)
        .unwrap_err();
    assert!(matches!(err, TableError::CapacityExceeded { .. }));
    assert_eq!(segment_length(&container, "t"), 0);
}

#[test]
fn test_put_at_offset() {
    let (tables, container, _dir) = test_tables(Config::default());
    tables.create_segment("t", TIMEOUT).unwrap();

    tables.put_at_offset("t", vec![TableEntry::unversioned("k", "v")], 0, TIMEOUT).unwrap();
    let length = segment_length(&container, "t");

    let err = tables.put_at_offset("t", vec![TableEntry::unversioned("k", "w")], 0, TIMEOUT).unwrap_err();
    assert!(matches!(err, TableError::BadOffset { expected: 0, actual } if actual == length));
    assert_eq!(get_values(&tables, "t", &["k"]), vec![Some("v".to_string())]);

    tables.remove_at_offset("t", vec![TableKey::unversioned("k")], length, TIMEOUT).unwrap();
    assert_eq!(get_values(&tables, "t", &["k"]), vec![None]);
}

#[test]
fn test_expired_timeout() {
    let (tables, container, _dir) = test_tables(Config::default());
    tables.create_segment("t", TIMEOUT).unwrap();

    let err = tables.put("t", vec![TableEntry::unversioned("k", "v")], Duration::ZERO).unwrap_err();
    assert!(matches!(err, TableError::Timeout { .. }));
    assert_eq!(segment_length(&container, "t"), 0);
}

#[test]
fn test_missing_and_foreign_segments() {
    let (tables, container, _dir) = test_tables(Config::default());

    assert!(matches!(tables.get("nope", &[b"k".to_vec()], TIMEOUT), Err(TableError::NotFound { .. })));
    assert!(matches!(
        tables.put("nope", vec![TableEntry::unversioned("k", "v")], TIMEOUT),
        Err(TableError::NotFound { .. })
    ));

    tables.create_segment("t", TIMEOUT).unwrap();
    assert!(matches!(tables.create_segment("t", TIMEOUT), Err(TableError::SegmentExists { .. })));

    container.create_segment("plain", SegmentAttributes::default()).unwrap();
    assert!(matches!(tables.get("plain", &[b"k".to_vec()], TIMEOUT), Err(TableError::NotATableSegment { .. })));
    assert_eq!(tables.table_segment_names().unwrap(), vec!["t".to_string()]);
}

#[test]
fn test_unsupported_operations() {
    let (tables, _container, _dir) = test_tables(Config::default());
    tables.create_segment("a", TIMEOUT).unwrap();
    tables.create_segment("b", TIMEOUT).unwrap();

    assert!(matches!(tables.merge("a", "b", TIMEOUT), Err(TableError::Unsupported { .. })));
    assert!(matches!(tables.seal("a", TIMEOUT), Err(TableError::Unsupported { .. })));
}

#[test]
fn test_closed() {
    let (tables, _container, _dir) = test_tables(Config::default());
    tables.create_segment("t", TIMEOUT).unwrap();

    tables.close();
    tables.close();
    assert!(tables.is_closed());
    assert!(matches!(tables.get("t", &[b"k".to_vec()], TIMEOUT), Err(TableError::Closed)));
    assert!(matches!(tables.put("t", vec![TableEntry::unversioned("k", "v")], TIMEOUT), Err(TableError::Closed)));
    assert!(matches!(tables.create_segment("u", TIMEOUT), Err(TableError::Closed)));
}

#[test]
fn test_invalid_config_rejected() {
    let dir = TempDir::new().unwrap();
    let container = Arc::new(SegmentContainer::open(dir.path(), 1).unwrap());
    let mut config = Config::default();
    config.iterator_fetch_buckets = 0;
    assert!(matches!(
        ContainerTableExtension::new(container, config),
        Err(TableError::InvalidConfig { .. })
    ));
}

// ---------------------------------------------------------------------------
// Deletion
// ---------------------------------------------------------------------------

#[test]
fn test_delete_must_be_empty() {
    let (tables, container, _dir) = test_tables(Config::default());
    tables.create_segment("t", TIMEOUT).unwrap();
    tables.put("t", vec![TableEntry::unversioned("k", "v")], TIMEOUT).unwrap();

    assert!(matches!(tables.delete_segment("t", true, TIMEOUT), Err(TableError::NotEmpty { .. })));
    assert!(container.exists("t"));

    tables.remove("t", vec![TableKey::unversioned("k")], TIMEOUT).unwrap();
    tables.delete_segment("t", true, TIMEOUT).unwrap();
    assert!(!container.exists("t"));
    assert!(matches!(tables.get("t", &[b"k".to_vec()], TIMEOUT), Err(TableError::NotFound { .. })));
}

#[test]
fn test_delete_unconditionally() {
    let (tables, container, _dir) = test_tables(Config::default());
    tables.create_segment("t", TIMEOUT).unwrap();
    tables.put("t", vec![TableEntry::unversioned("k", "v")], TIMEOUT).unwrap();

    tables.delete_segment("t", false, TIMEOUT).unwrap();
    assert!(!container.exists("t"));

    // A recreated table starts empty.
    tables.create_segment("t", TIMEOUT).unwrap();
    assert_eq!(get_values(&tables, "t", &["k"]), vec![None]);
}

// ---------------------------------------------------------------------------
// Iteration
// ---------------------------------------------------------------------------

#[test]
fn test_iterate_and_resume() {
    let mut config = Config::default();
    config.iterator_fetch_buckets = 1;
    let (tables, _container, _dir) = test_tables(config);
    tables.create_segment("t", TIMEOUT).unwrap();

    for key in ["a", "b", "c"] {
        tables.put("t", vec![TableEntry::unversioned(key, key.to_uppercase())], TIMEOUT).unwrap();
    }
    tables.remove("t", vec![TableKey::unversioned("b")], TIMEOUT).unwrap();
    tables.put("t", vec![TableEntry::unversioned("d", "D")], TIMEOUT).unwrap();

    let mut iter = tables.key_iterator("t", None, TIMEOUT).unwrap();
    let first = iter.next().unwrap().unwrap();
    assert_eq!(first.entries.len(), 1);
    let mut seen: HashSet<Vec<u8>> = first.entries.iter().map(|k| k.key.clone()).collect();

    // Resume from the first item's state in a fresh iterator.
    let state = IteratorState::from_bytes(&first.state).unwrap();
    let mut resumed = tables.key_iterator("t", Some(&state.to_bytes()), TIMEOUT).unwrap();
    while let Some(item) = resumed.next().unwrap() {
        for key in item.entries {
            assert!(seen.insert(key.key.clone()), "duplicate key {:?}", key.key);
            assert!(matches!(key.version, KeyVersion::Exact(_)));
        }
    }
    assert!(resumed.is_done());

    let expected: HashSet<Vec<u8>> = [b"a".to_vec(), b"c".to_vec(), b"d".to_vec()].into_iter().collect();
    assert_eq!(seen, expected);
}

#[test]
fn test_entry_iterator_after_indexing() {
    let (tables, _container, _dir) = test_tables(Config::default());
    tables.create_segment("t", TIMEOUT).unwrap();
    tables.put("t", vec![TableEntry::unversioned("a", "1"), TableEntry::unversioned("b", "2")], TIMEOUT).unwrap();

    let processor = tables.create_writer_processor("t").unwrap();
    processor.index_step().unwrap();
    tables.put("t", vec![TableEntry::unversioned("c", "3"), TableEntry::unversioned("a", "4")], TIMEOUT).unwrap();

    let mut entries = Vec::new();
    let mut iter = tables.entry_iterator("t", None, TIMEOUT).unwrap();
    while let Some(item) = iter.next().unwrap() {
        entries.extend(item.entries);
    }
    let mut pairs: Vec<(Vec<u8>, Vec<u8>)> = entries.into_iter().map(|e| (e.key.key, e.value)).collect();
    pairs.sort();
    assert_eq!(
        pairs,
        vec![
            (b"a".to_vec(), b"4".to_vec()),
            (b"b".to_vec(), b"2".to_vec()),
            (b"c".to_vec(), b"3".to_vec()),
        ]
    );
}

#[test]
fn test_iterator_rejects_malformed_state() {
    let (tables, _container, _dir) = test_tables(Config::default());
    tables.create_segment("t", TIMEOUT).unwrap();
    assert!(matches!(tables.key_iterator("t", Some(&[1, 2, 3]), TIMEOUT), Err(TableError::DataFormat { .. })));
}

#[test]
fn test_delta_iterator() {
    let (tables, container, _dir) = test_tables(Config::default());
    tables.create_segment("t", TIMEOUT).unwrap();
    tables.put("t", vec![TableEntry::unversioned("a", "1")], TIMEOUT).unwrap();
    tables.put("t", vec![TableEntry::unversioned("b", "2")], TIMEOUT).unwrap();
    tables.remove("t", vec![TableKey::unversioned("a")], TIMEOUT).unwrap();
    let length = segment_length(&container, "t");

    let mut iter = tables.entry_delta_iterator("t", 0, TIMEOUT).unwrap();
    // Appended after creation: outside the window.
    tables.put("t", vec![TableEntry::unversioned("late", "x")], TIMEOUT).unwrap();

    let mut items = Vec::new();
    while let Some(item) = iter.next().unwrap() {
        items.push(item);
    }
    assert_eq!(items.len(), 3);
    assert_eq!(items[0].entry.key.key, b"a".to_vec());
    assert!(!items[0].state.deletion_record);
    assert!(!items[0].state.reached_end);
    assert!(items[2].state.deletion_record);
    assert!(items[2].entry.value.is_empty());
    assert!(items[2].state.reached_end);
    assert_eq!(items[2].state.from_position, length);
    assert!(items.iter().all(|i| !i.state.should_clear));

    // Resume from the middle.
    let mut resumed = tables.entry_delta_iterator("t", items[0].state.from_position, TIMEOUT).unwrap();
    let next = resumed.next().unwrap().unwrap();
    assert_eq!(next.entry.key.key, b"b".to_vec());

    let beyond = segment_length(&container, "t") + 1;
    assert!(matches!(tables.entry_delta_iterator("t", beyond, TIMEOUT), Err(TableError::DataFormat { .. })));
}

// ---------------------------------------------------------------------------
// Writer: Indexing and Compaction
// ---------------------------------------------------------------------------

#[test]
fn test_compaction_keeps_live_entries() {
    let (tables, container, _dir) = test_tables(Config::default());
    tables.create_segment("t", TIMEOUT).unwrap();

    tables.put("t", vec![TableEntry::unversioned("keep", "k")], TIMEOUT).unwrap();
    for i in 0..6 {
        tables.put("t", vec![TableEntry::unversioned("hot", i.to_string())], TIMEOUT).unwrap();
    }
    tables.put("t", vec![TableEntry::unversioned("gone", "g")], TIMEOUT).unwrap();
    tables.remove("t", vec![TableKey::unversioned("gone")], TIMEOUT).unwrap();

    let processor = tables.create_writer_processor("t").unwrap();
    assert!(processor.index_step().unwrap() > 0);
    let compacted = processor.compact_step().unwrap();
    assert!(compacted > 0);

    let info = container.for_segment("t").unwrap().info().unwrap();
    assert_eq!(info.start_offset, compacted);
    assert_eq!(
        get_values(&tables, "t", &["keep", "hot", "gone"]),
        vec![Some("k".to_string()), Some("5".to_string()), None]
    );

    // Relocated entries are indexed again; the live count settles at 2.
    processor.index_step().unwrap();
    let info = container.for_segment("t").unwrap().info().unwrap();
    assert_eq!(info.attributes.entry_count, 2);
    assert_eq!(info.attributes.index_offset, Some(info.length));

    // A delta from before the truncation point restarts and asks to clear.
    let mut iter = tables.entry_delta_iterator("t", 0, TIMEOUT).unwrap();
    let first = iter.next().unwrap().unwrap();
    assert!(first.state.should_clear);
    assert!(first.entry.version().unwrap() >= info.start_offset);
}

#[test]
fn test_background_writer() {
    let mut config = Config::embedded();
    config.writer_cadence = Duration::from_millis(10);
    let (tables, container, _dir) = test_tables(config);
    tables.create_segment("t", TIMEOUT).unwrap();
    tables.put("t", vec![TableEntry::unversioned("k", "v")], TIMEOUT).unwrap();

    tables.start_writer().unwrap();
    let length = segment_length(&container, "t");
    let mut indexed = false;
    for _ in 0..200 {
        let info = container.for_segment("t").unwrap().info().unwrap();
        if info.attributes.index_offset == Some(length) {
            indexed = true;
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    tables.stop_writer();
    assert!(indexed);
    assert_eq!(get_values(&tables, "t", &["k"]), vec![Some("v".to_string())]);
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

#[test]
fn test_reopen_recovers_tables() {
    let dir = TempDir::new().unwrap();
    {
        let container = Arc::new(SegmentContainer::open(dir.path(), 1).unwrap());
        let tables = ContainerTableExtension::new(container, Config::default()).unwrap();
        tables.create_segment("t", TIMEOUT).unwrap();
        tables.put("t", vec![TableEntry::unversioned("indexed", "1")], TIMEOUT).unwrap();
        tables.create_writer_processor("t").unwrap().index_step().unwrap();
        tables.put("t", vec![TableEntry::unversioned("tail", "2")], TIMEOUT).unwrap();
        tables.close();
    }

    let container = Arc::new(SegmentContainer::open(dir.path(), 1).unwrap());
    let tables = ContainerTableExtension::new(container, Config::default()).unwrap();
    assert_eq!(tables.table_segment_names().unwrap(), vec!["t".to_string()]);
    assert_eq!(
        get_values(&tables, "t", &["indexed", "tail"]),
        vec![Some("1".to_string()), Some("2".to_string())]
    );

    // Conditional updates see the recovered versions.
    let current = tables.get("t", &[b"tail".to_vec()], TIMEOUT).unwrap()[0].clone().unwrap();
    tables
        .put("t", vec![TableEntry::versioned("tail", "3", current.version().unwrap())], TIMEOUT)
        .unwrap();
    assert_eq!(get_values(&tables, "t", &["tail"]), vec![Some("3".to_string())]);
}
