//! End-to-end tablet scenarios: the write/read/maintenance loop under
//! concurrent writers, flushes, and compactions.

use std::sync::Arc;

use tempfile::TempDir;

use tabletdb::{
    ColumnDesc, ColumnPredicate, CompactFlags, DataType, Datum, PredicateOp, Row, RowChange,
    ScanRange, ScanSpec, Schema, Tablet, TabletOptions,
};

fn test_schema() -> Schema {
    Schema::new(
        vec![
            ColumnDesc::new(0, "k", DataType::Int64, false),
            ColumnDesc::new(1, "name", DataType::String, true),
            ColumnDesc::new(2, "v", DataType::Int32, true),
        ],
        1,
    )
    .unwrap()
}

fn row(k: i64, name: &str, v: i32) -> Row {
    vec![
        Datum::Int64(k),
        Datum::String(name.to_string()),
        Datum::Int32(v),
    ]
}

fn key(k: i64) -> Vec<Datum> {
    vec![Datum::Int64(k)]
}

/// Route engine tracing through the test harness; repeated calls are fine.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_test_writer()
        .try_init();
}

async fn new_tablet(dir: &TempDir) -> Tablet {
    init_tracing();
    Tablet::create(
        TabletOptions::default_for_test(dir.path().join("tablet")),
        test_schema(),
    )
    .await
    .unwrap()
}

async fn scan_all(tablet: &Tablet) -> Vec<Row> {
    let mut iter = tablet.new_iterator(&[0, 1, 2]).unwrap();
    iter.init(ScanSpec::all()).await.unwrap();
    iter.collect_rows().await.unwrap()
}

#[tokio::test]
async fn test_insert_update_read_at_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let tablet = new_tablet(&dir).await;

    tablet.insert(row(1, "a", 10)).await.unwrap();
    let snap_after_t1 = tablet.snapshot();

    tablet.update(&key(1), [(2, Datum::Int32(20))]).await.unwrap();
    let snap_after_t2 = tablet.snapshot();

    let mut iter = tablet.new_iterator_at(&[0, 2], snap_after_t1).unwrap();
    iter.init(ScanSpec::all()).await.unwrap();
    assert_eq!(
        iter.collect_rows().await.unwrap(),
        vec![vec![Datum::Int64(1), Datum::Int32(10)]]
    );

    let mut iter = tablet.new_iterator_at(&[0, 2], snap_after_t2).unwrap();
    iter.init(ScanSpec::all()).await.unwrap();
    assert_eq!(
        iter.collect_rows().await.unwrap(),
        vec![vec![Datum::Int64(1), Datum::Int32(20)]]
    );
}

#[tokio::test]
async fn test_duplicate_insert_exactly_one_wins() {
    let dir = tempfile::tempdir().unwrap();
    let tablet = Arc::new(new_tablet(&dir).await);

    let mut handles = Vec::new();
    for i in 0..2 {
        let tablet = tablet.clone();
        handles.push(tokio::spawn(async move {
            tablet.insert(row(7, "w", i)).await
        }));
    }
    let results: Vec<_> = futures_join(handles).await;
    let ok = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| r.as_ref().err().map(|e| e.is_conflict()) == Some(true))
        .count();
    assert_eq!((ok, conflicts), (1, 1));
    assert_eq!(tablet.count_rows().await.unwrap(), 1);
}

async fn futures_join<T>(
    handles: Vec<tokio::task::JoinHandle<T>>,
) -> Vec<T> {
    let mut out = Vec::with_capacity(handles.len());
    for handle in handles {
        out.push(handle.await.unwrap());
    }
    out
}

#[tokio::test]
async fn test_flush_midway_through_inserts() {
    let dir = tempfile::tempdir().unwrap();
    let tablet = Arc::new(new_tablet(&dir).await);

    for k in 2..=50 {
        tablet.insert(row(k, "x", k as i32)).await.unwrap();
    }
    let flusher = {
        let tablet = tablet.clone();
        tokio::spawn(async move { tablet.flush().await })
    };
    for k in 51..=100 {
        tablet.insert(row(k, "x", k as i32)).await.unwrap();
    }
    flusher.await.unwrap().unwrap();

    let rows = scan_all(&tablet).await;
    let keys: Vec<i64> = rows
        .iter()
        .map(|r| match r[0] {
            Datum::Int64(k) => k,
            _ => panic!("bad key"),
        })
        .collect();
    assert_eq!(keys, (2..=100).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_flush_invariants() {
    let dir = tempfile::tempdir().unwrap();
    let tablet = new_tablet(&dir).await;

    for k in 0..100 {
        tablet.insert(row(k, "x", k as i32)).await.unwrap();
    }
    let before = scan_all(&tablet).await;
    assert!(tablet.mem_rowset_size() > 0);
    assert_eq!(tablet.num_rowsets(), 0);

    tablet.flush().await.unwrap();

    assert_eq!(tablet.mem_rowset_size(), 0);
    assert_eq!(tablet.num_rowsets(), 1);
    assert_eq!(scan_all(&tablet).await, before);

    // Flushing an empty MemRowSet is a no-op.
    tablet.flush().await.unwrap();
    assert_eq!(tablet.num_rowsets(), 1);
}

#[tokio::test]
async fn test_updates_and_deletes_across_flush() {
    let dir = tempfile::tempdir().unwrap();
    let tablet = new_tablet(&dir).await;

    for k in 0..20 {
        tablet.insert(row(k, "x", 0)).await.unwrap();
    }
    tablet.flush().await.unwrap();

    // Updates and deletes of flushed rows land in the rowset's DMS.
    tablet.update(&key(3), [(2, Datum::Int32(33))]).await.unwrap();
    tablet.delete(&key(4)).await.unwrap();
    let err = tablet
        .update(&key(4), [(2, Datum::Int32(44))])
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    // Reinsert of a key deleted on disk.
    tablet.insert(row(4, "again", 4)).await.unwrap();
    let err = tablet.insert(row(3, "dup", 0)).await.unwrap_err();
    assert!(err.is_conflict());

    let rows = scan_all(&tablet).await;
    assert_eq!(rows.len(), 20);
    assert_eq!(rows[3], row(3, "x", 33));
    assert_eq!(rows[4], row(4, "again", 4));
}

#[tokio::test]
async fn test_compact_with_live_reader_then_vacuum() {
    let dir = tempfile::tempdir().unwrap();
    let tablet = new_tablet(&dir).await;

    for k in 0..10 {
        tablet.insert(row(k, "a", 0)).await.unwrap();
    }
    tablet.flush().await.unwrap();
    for k in 10..20 {
        tablet.insert(row(k, "b", 0)).await.unwrap();
    }
    tablet.flush().await.unwrap();
    assert_eq!(tablet.num_rowsets(), 2);

    // A reader that begins before the compaction.
    let mut iter = tablet.new_iterator(&[0]).unwrap();
    iter.init(ScanSpec::all()).await.unwrap();
    let first_block = iter.next_block(4).await.unwrap().unwrap();
    assert_eq!(first_block.len(), 4);

    tablet
        .compact(CompactFlags {
            force_compact_all: true,
        })
        .await
        .unwrap();
    assert_eq!(tablet.num_rowsets(), 1);

    // The old rowset files are pinned by the live iterator.
    assert!(tablet.vacuum().await.unwrap().is_empty());

    let mut rows = first_block.len();
    while let Some(block) = iter.next_block(1024).await.unwrap() {
        rows += block.len();
    }
    assert_eq!(rows, 20);

    // Dropping the reader releases the inputs; vacuum removes their dirs.
    drop(iter);
    let vacuumed = tablet.vacuum().await.unwrap();
    assert_eq!(vacuumed.len(), 2);
    for id in vacuumed {
        assert!(!dir
            .path()
            .join("tablet")
            .join(format!("rs_{id}"))
            .exists());
    }
    assert_eq!(scan_all(&tablet).await.len(), 20);
}

#[tokio::test]
async fn test_compaction_preserves_visible_state() {
    let dir = tempfile::tempdir().unwrap();
    let tablet = new_tablet(&dir).await;

    for k in 0..30 {
        tablet.insert(row(k, "a", k as i32)).await.unwrap();
        if k % 10 == 9 {
            tablet.flush().await.unwrap();
        }
    }
    tablet.update(&key(5), [(2, Datum::Int32(555))]).await.unwrap();
    tablet.delete(&key(6)).await.unwrap();
    let before = scan_all(&tablet).await;

    tablet
        .compact(CompactFlags {
            force_compact_all: true,
        })
        .await
        .unwrap();

    assert_eq!(scan_all(&tablet).await, before);
    assert_eq!(tablet.count_rows().await.unwrap(), 29);
}

#[tokio::test]
async fn test_major_delta_compaction() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut options = TabletOptions::default_for_test(dir.path().join("tablet"));
    options.block_rows = 256;
    let tablet = Tablet::create(options, test_schema()).await.unwrap();

    const N: i64 = 10_000;
    for k in 0..N {
        tablet.insert(row(k, "orig", 0)).await.unwrap();
    }
    tablet.flush().await.unwrap();

    // Three rounds of updates to column v, each flushed to its own delta
    // file, plus one update to `name` that must survive the compaction.
    for round in 1..=3 {
        for k in 0..N {
            tablet
                .update(&key(k), [(2, Datum::Int32(round * 100))])
                .await
                .unwrap();
        }
        tablet.flush_biggest_dms().await.unwrap().unwrap();
    }
    tablet
        .update(&key(17), [(1, Datum::String("renamed".into()))])
        .await
        .unwrap();
    assert_eq!(tablet.num_delta_files(), 3);

    let rowset_id = {
        // The only rowset is the flushed one.
        assert_eq!(tablet.num_rowsets(), 1);
        0
    };
    tablet.major_delta_compact(rowset_id, &[2]).await.unwrap();

    assert_eq!(tablet.num_delta_files(), 0);
    let rows = scan_all(&tablet).await;
    assert_eq!(rows.len(), N as usize);
    for (k, r) in rows.iter().enumerate() {
        assert_eq!(r[2], Datum::Int32(300), "row {k}");
    }
    assert_eq!(rows[17][1], Datum::String("renamed".into()));
    assert_eq!(rows[18][1], Datum::String("orig".into()));
}

#[tokio::test]
async fn test_minor_compact_worst_deltas() {
    let dir = tempfile::tempdir().unwrap();
    let tablet = new_tablet(&dir).await;

    for k in 0..10 {
        tablet.insert(row(k, "x", 0)).await.unwrap();
    }
    tablet.flush().await.unwrap();
    for round in 0..3 {
        tablet
            .update(&key(1), [(2, Datum::Int32(round))])
            .await
            .unwrap();
        tablet.flush_biggest_dms().await.unwrap();
    }
    assert_eq!(tablet.num_delta_files(), 3);

    tablet.minor_compact_worst_deltas().await.unwrap().unwrap();
    assert_eq!(tablet.num_delta_files(), 1);

    let rows = scan_all(&tablet).await;
    assert_eq!(rows[1][2], Datum::Int32(2));
}

#[tokio::test]
async fn test_reopen_recovers_rows() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tablet");
    {
        let tablet = Tablet::create(
            TabletOptions::default_for_test(path.clone()),
            test_schema(),
        )
        .await
        .unwrap();
        for k in 0..1000 {
            tablet.insert(row(k, "x", k as i32)).await.unwrap();
        }
        tablet.flush().await.unwrap();
        tablet.shutdown().await;
    }

    let tablet = Tablet::open(TabletOptions::default_for_test(path))
        .await
        .unwrap();
    let rows = scan_all(&tablet).await;
    assert_eq!(rows.len(), 1000);
    for (k, r) in rows.iter().enumerate() {
        assert_eq!(r[0], Datum::Int64(k as i64));
        assert_eq!(r[2], Datum::Int32(k as i32));
    }
}

#[tokio::test]
async fn test_reopen_recovers_flushed_deltas_and_cleans_orphans() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tablet");
    let compacted_away: Vec<u64>;
    {
        let tablet = Tablet::create(
            TabletOptions::default_for_test(path.clone()),
            test_schema(),
        )
        .await
        .unwrap();
        for k in 0..10 {
            tablet.insert(row(k, "x", 0)).await.unwrap();
        }
        tablet.flush().await.unwrap();
        tablet.update(&key(2), [(2, Datum::Int32(22))]).await.unwrap();
        tablet.flush_biggest_dms().await.unwrap();
        for k in 10..20 {
            tablet.insert(row(k, "y", 0)).await.unwrap();
        }
        tablet.flush().await.unwrap();

        // Compact while an iterator pins the inputs, then "crash" without
        // vacuuming: the input dirs stay on disk but are dead per the
        // manifest.
        let mut iter = tablet.new_iterator(&[0]).unwrap();
        iter.init(ScanSpec::all()).await.unwrap();
        tablet
            .compact(CompactFlags {
                force_compact_all: true,
            })
            .await
            .unwrap();
        compacted_away = vec![0, 1];
        for id in &compacted_away {
            assert!(path.join(format!("rs_{id}")).exists());
        }
    }

    let tablet = Tablet::open(TabletOptions::default_for_test(path.clone()))
        .await
        .unwrap();
    // Orphan input dirs were removed on open.
    for id in &compacted_away {
        assert!(!path.join(format!("rs_{id}")).exists());
    }
    let rows = scan_all(&tablet).await;
    assert_eq!(rows.len(), 20);
    assert_eq!(rows[2][2], Datum::Int32(22));
}

#[tokio::test]
async fn test_concurrent_disjoint_writers_serialize() {
    let dir = tempfile::tempdir().unwrap();
    let tablet = Arc::new(new_tablet(&dir).await);

    let mut handles = Vec::new();
    for t in 0..8i64 {
        let tablet = tablet.clone();
        handles.push(tokio::spawn(async move {
            use rand::seq::SliceRandom;
            let mut keys: Vec<i64> = (0..50).map(|i| t * 1000 + i).collect();
            keys.shuffle(&mut rand::thread_rng());
            for k in keys {
                tablet.insert(row(k, "w", t as i32)).await.unwrap();
                tablet
                    .update(&key(k), [(2, Datum::Int32(k as i32))])
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let rows = scan_all(&tablet).await;
    assert_eq!(rows.len(), 400);
    for r in rows {
        let (Datum::Int64(k), Datum::Int32(v)) = (&r[0], &r[2]) else {
            panic!("bad row {r:?}");
        };
        assert_eq!(*k as i32, *v);
    }
}

#[tokio::test]
async fn test_projection_predicates_and_range() {
    let dir = tempfile::tempdir().unwrap();
    let tablet = new_tablet(&dir).await;

    for k in 0..100 {
        tablet.insert(row(k, "x", (k % 10) as i32)).await.unwrap();
    }
    tablet.flush().await.unwrap();
    for k in 100..200 {
        tablet.insert(row(k, "y", (k % 10) as i32)).await.unwrap();
    }

    let schema = tablet.schema();
    let lower = schema.encode_key_datums(&key(50)).unwrap();
    let upper = schema.encode_key_datums(&key(150)).unwrap();
    let mut iter = tablet.new_iterator(&[0, 2]).unwrap();
    iter.init(ScanSpec {
        range: ScanRange::new(Some(lower), Some(upper)),
        predicates: vec![ColumnPredicate {
            column_id: 2,
            op: PredicateOp::Eq,
            value: Datum::Int32(3),
        }],
    })
    .await
    .unwrap();

    let rows = iter.collect_rows().await.unwrap();
    let keys: Vec<i64> = rows
        .iter()
        .map(|r| match r[0] {
            Datum::Int64(k) => k,
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(keys, vec![53, 63, 73, 83, 93, 103, 113, 123, 133, 143]);
    // Projection dropped the name column.
    assert!(rows.iter().all(|r| r.len() == 2));
}

#[tokio::test]
async fn test_alter_schema_add_column_and_idempotence() {
    let dir = tempfile::tempdir().unwrap();
    let tablet = new_tablet(&dir).await;

    for k in 0..10 {
        tablet.insert(row(k, "x", 1)).await.unwrap();
    }

    let extended = Schema::new(
        vec![
            ColumnDesc::new(0, "k", DataType::Int64, false),
            ColumnDesc::new(1, "name", DataType::String, true),
            ColumnDesc::new(2, "v", DataType::Int32, true),
            ColumnDesc::new(3, "extra", DataType::Int32, true).with_default(Datum::Int32(-1)),
        ],
        1,
    )
    .unwrap();

    tablet.alter_schema(extended.clone()).await.unwrap();
    // The alter drained the MemRowSet to disk.
    assert_eq!(tablet.mem_rowset_size(), 0);

    // Applying the identical schema again is a no-op.
    let rowsets = tablet.num_rowsets();
    tablet.alter_schema(extended.clone()).await.unwrap();
    assert_eq!(tablet.num_rowsets(), rowsets);

    // Old rows read the added column's default; new rows carry real values.
    tablet
        .insert(vec![
            Datum::Int64(100),
            Datum::String("new".into()),
            Datum::Int32(2),
            Datum::Int32(42),
        ])
        .await
        .unwrap();
    let mut iter = tablet.new_iterator(&[0, 3]).unwrap();
    iter.init(ScanSpec::all()).await.unwrap();
    let rows = iter.collect_rows().await.unwrap();
    assert_eq!(rows.len(), 11);
    assert_eq!(rows[0][1], Datum::Int32(-1));
    assert_eq!(rows[10][1], Datum::Int32(42));

    // Key-incompatible alters are rejected.
    let bad = Schema::new(
        vec![ColumnDesc::new(9, "other", DataType::Int64, false)],
        1,
    )
    .unwrap();
    assert!(tablet.alter_schema(bad).await.is_err());
}

#[tokio::test]
async fn test_historical_snapshot_at() {
    let dir = tempfile::tempdir().unwrap();
    let tablet = new_tablet(&dir).await;

    tablet.insert(row(1, "a", 1)).await.unwrap();
    let mark = tablet.mvcc().clock().now();
    tablet.insert(row(2, "b", 2)).await.unwrap();

    let snap = tablet.snapshot_at(mark).await;
    let mut iter = tablet.new_iterator_at(&[0], snap).unwrap();
    iter.init(ScanSpec::all()).await.unwrap();
    assert_eq!(iter.collect_rows().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_shutdown_aborts_new_operations() {
    let dir = tempfile::tempdir().unwrap();
    let tablet = new_tablet(&dir).await;
    tablet.insert(row(1, "a", 1)).await.unwrap();
    tablet.shutdown().await;

    assert!(tablet.insert(row(2, "b", 2)).await.is_err());
    assert!(tablet.flush().await.is_err());
    assert!(tablet.new_iterator(&[0]).is_err());
}
