//! Behavior every storage engine must share, run once per engine.

mod support;

use std::path::Path;

use chrono::{Local, TimeZone};
use goblin_store::config::{StorageFormat, StorageMode};
use goblin_store::models::LimitsReading;
use goblin_store::storage::Table;
use support::{device, prompt, response, setup_store, with_model, write_source};

macro_rules! contract_tests {
    ($engine:ident, $format:expr, [$($case:ident),* $(,)?]) => {
        mod $engine {
            $(
                #[test]
                fn $case() {
                    super::$case($format);
                }
            )*
        }
    };
}

macro_rules! all_contract_tests {
    ($engine:ident, $format:expr) => {
        contract_tests!($engine, $format, [
            full_mode_never_duplicates_records,
            full_mode_preserves_aged_out_ledger_rows,
            aggregate_mode_adds_onto_ledger,
            aggregate_merge_keeps_existing_device,
            empty_batch_writes_nothing,
            load_records_filters_by_date,
            daily_series_backfills_gaps,
            limits_overwrite_same_timestamp,
            fingerprints_are_idempotent,
            stats_count_unpriced_models_at_zero_cost,
            device_columns_evolve_idempotently,
            replica_push_replaces_by_owner,
        ]);
    };
}

all_contract_tests!(sqlite, super::StorageFormat::Sqlite);

#[cfg(feature = "duckdb")]
all_contract_tests!(duckdb, super::StorageFormat::DuckDb);


fn full_mode_never_duplicates_records(format: StorageFormat) {
    let test_store = setup_store(format);
    let store = test_store.store.as_ref();
    let batch = vec![
        prompt("s1", "u1", "2025-03-01"),
        response("s1", "u2", "2025-03-01", 100, 50),
        response("s2", "u3", "2025-03-01", 10, 5),
    ];

    assert_eq!(store.save(&batch, StorageMode::Full, None).unwrap(), 3);
    assert_eq!(store.save(&batch, StorageMode::Full, None).unwrap(), 0);

    let records = store.load_records(None, None).unwrap();
    assert_eq!(records.len(), 3);

    let snapshots = store.daily_snapshots(None, None).unwrap();
    assert_eq!(snapshots.len(), 1);
    let day = &snapshots[0];
    assert_eq!(day.date, batch[0].date_key());
    assert_eq!(day.total_prompts, 1);
    assert_eq!(day.total_responses, 2);
    assert_eq!(day.total_sessions, 2);
    assert_eq!(day.total_tokens, 165);
    assert_eq!(day.input_tokens, 110);
}


fn full_mode_preserves_aged_out_ledger_rows(format: StorageFormat) {
    let test_store = setup_store(format);
    let store = test_store.store.as_ref();
    let rotated = vec![
        prompt("s1", "u1", "2025-02-10"),
        response("s1", "u2", "2025-02-10", 300, 45),
    ];
    let day = rotated[0].date_key();

    store.save(&rotated, StorageMode::Full, None).unwrap();
    let before = store.daily_snapshots(Some(&day), Some(&day)).unwrap();
    assert_eq!(before.len(), 1);
    assert_eq!(before[0].total_tokens, 345);

    // The source logs for that day rotated away
    delete_raw_records(format, &test_store.path, &day);
    assert!(store.load_records(Some(&day), Some(&day)).unwrap().is_empty());

    store
        .save(&[response("s2", "u3", "2025-03-01", 10, 10)], StorageMode::Full, None)
        .unwrap();

    assert_eq!(store.daily_snapshots(Some(&day), Some(&day)).unwrap(), before);

    let stats = store.stats().unwrap();
    assert_eq!(stats.total_tokens, 345 + 20);
    assert_eq!(stats.total_records, 1);
    assert_eq!(stats.total_days, 1);
}


fn delete_raw_records(format: StorageFormat, path: &Path, date: &str) {
    let sql = format!("DELETE FROM usage_records WHERE date = '{date}'");
    match format {
        StorageFormat::Sqlite => rusqlite::Connection::open(path)
            .unwrap()
            .execute_batch(&sql)
            .unwrap(),
        #[cfg(feature = "duckdb")]
        StorageFormat::DuckDb => ::duckdb::Connection::open(path)
            .unwrap()
            .execute_batch(&sql)
            .unwrap(),
        #[cfg(not(feature = "duckdb"))]
        StorageFormat::DuckDb => unreachable!("duckdb engine is not built"),
    }
}


fn aggregate_mode_adds_onto_ledger(format: StorageFormat) {
    let test_store = setup_store(format);
    let store = test_store.store.as_ref();
    let first = vec![
        prompt("s1", "u1", "2025-03-01"),
        response("s1", "u2", "2025-03-01", 100, 0),
        response("s2", "u3", "2025-03-02", 5, 5),
    ];
    let second = vec![response("s3", "u4", "2025-03-01", 1, 1)];

    assert_eq!(store.save(&first, StorageMode::Aggregate, None).unwrap(), 2);
    assert_eq!(store.save(&second, StorageMode::Aggregate, None).unwrap(), 1);

    // Aggregate mode keeps no raw rows
    assert!(store.load_records(None, None).unwrap().is_empty());

    let snapshots = store.daily_snapshots(None, None).unwrap();
    let day = snapshots
        .iter()
        .find(|s| s.date == first[0].date_key())
        .unwrap();
    assert_eq!(day.total_prompts, 1);
    assert_eq!(day.total_responses, 2);
    assert_eq!(day.total_sessions, 2);
    assert_eq!(day.total_tokens, 102);

    // Saving the same batch again counts it again
    store.save(&second, StorageMode::Aggregate, None).unwrap();
    let snapshots = store.daily_snapshots(Some(&day.date), Some(&day.date)).unwrap();
    assert_eq!(snapshots[0].total_tokens, 104);
}


fn aggregate_merge_keeps_existing_device(format: StorageFormat) {
    let test_store = setup_store(format);
    let store = test_store.store.as_ref();
    let laptop = device("laptop");
    let desktop = device("desktop");

    store
        .save(&[response("s1", "u1", "2025-03-01", 1, 1)], StorageMode::Aggregate, Some(&laptop))
        .unwrap();
    store
        .save(&[response("s2", "u2", "2025-03-01", 1, 1)], StorageMode::Aggregate, Some(&desktop))
        .unwrap();
    store
        .save(&[response("s3", "u3", "2025-03-04", 1, 1)], StorageMode::Aggregate, Some(&desktop))
        .unwrap();

    let snapshots = store.daily_snapshots(None, None).unwrap();
    assert_eq!(snapshots.len(), 2);
    assert_eq!(snapshots[0].device.device_id.as_deref(), Some("laptop"));
    assert_eq!(snapshots[0].device.device_name.as_deref(), Some("laptop-host"));
    assert_eq!(snapshots[1].device.device_id.as_deref(), Some("desktop"));
}


fn empty_batch_writes_nothing(format: StorageFormat) {
    let test_store = setup_store(format);
    let store = test_store.store.as_ref();

    assert_eq!(store.save(&[], StorageMode::Full, None).unwrap(), 0);
    assert_eq!(store.save(&[], StorageMode::Aggregate, None).unwrap(), 0);
    assert!(store.daily_snapshots(None, None).unwrap().is_empty());

    let stats = store.stats().unwrap();
    assert_eq!(stats.total_records, 0);
    assert_eq!(stats.avg_tokens_per_session, 0);
    assert!(stats.oldest_date.is_none());
}


fn load_records_filters_by_date(format: StorageFormat) {
    let test_store = setup_store(format);
    let store = test_store.store.as_ref();
    let laptop = device("laptop");
    let batch = vec![
        response("s1", "u1", "2025-03-01", 1, 0),
        response("s1", "u2", "2025-03-03", 2, 0),
        response("s1", "u3", "2025-03-05", 3, 0),
    ];
    store.save(&batch, StorageMode::Full, Some(&laptop)).unwrap();

    let start = batch[1].date_key();
    let middle = store.load_records(Some(&start), Some(&start)).unwrap();
    assert_eq!(middle.len(), 1);
    assert_eq!(middle[0].message_uuid, "u2");
    assert_eq!(middle[0].timestamp, batch[1].timestamp);
    assert_eq!(middle[0].token_usage, batch[1].token_usage);
    assert_eq!(middle[0].device.device_id.as_deref(), Some("laptop"));

    let from_start = store.load_records(Some(&start), None).unwrap();
    let uuids: Vec<_> = from_start.iter().map(|r| r.message_uuid.as_str()).collect();
    assert_eq!(uuids, vec!["u2", "u3"]);
}


fn daily_series_backfills_gaps(format: StorageFormat) {
    let test_store = setup_store(format);
    let store = test_store.store.as_ref();
    let at = |day: u32, hour: u32| Local.with_ymd_and_hms(2025, 3, day, hour, 0, 0).unwrap();
    let reading = |week_pct: i64| LimitsReading {
        session_pct: 5,
        week_pct,
        opus_pct: week_pct / 2,
        session_reset: "3pm".to_string(),
        week_reset: "Mar 8".to_string(),
        opus_reset: "Mar 8".to_string(),
    };

    store.record_limits_at(&reading(6), None, at(1, 8)).unwrap();
    store.record_limits_at(&reading(10), None, at(1, 20)).unwrap();
    store.record_limits_at(&reading(40), None, at(5, 9)).unwrap();

    let series = store.daily_series().unwrap();
    let dates: Vec<_> = series.keys().cloned().collect();
    assert_eq!(
        dates,
        vec!["2025-03-01", "2025-03-02", "2025-03-03", "2025-03-04", "2025-03-05"]
    );
    assert_eq!(series["2025-03-01"].week_pct, 10);
    for date in ["2025-03-02", "2025-03-03", "2025-03-04", "2025-03-05"] {
        assert_eq!(series[date].week_pct, 40);
        assert_eq!(series[date].opus_pct, 20);
    }

    let latest = store.latest_limits().unwrap().unwrap();
    assert_eq!(latest.date, "2025-03-05");
    assert_eq!(latest.reading, reading(40));
}


fn limits_overwrite_same_timestamp(format: StorageFormat) {
    let test_store = setup_store(format);
    let store = test_store.store.as_ref();
    let observed_at = Local.with_ymd_and_hms(2025, 3, 2, 10, 30, 0).unwrap();
    let mut reading = LimitsReading {
        week_pct: 12,
        ..Default::default()
    };

    assert!(store.latest_limits().unwrap().is_none());
    store.record_limits_at(&reading, None, observed_at).unwrap();
    reading.week_pct = 15;
    store
        .record_limits_at(&reading, Some(&device("laptop")), observed_at)
        .unwrap();

    let series = store.daily_series().unwrap();
    assert_eq!(series.len(), 1);
    assert_eq!(series["2025-03-02"].week_pct, 15);

    let latest = store.latest_limits().unwrap().unwrap();
    assert_eq!(latest.device.device_id.as_deref(), Some("laptop"));
}


fn fingerprints_are_idempotent(format: StorageFormat) {
    let test_store = setup_store(format);
    let store = test_store.store.as_ref();
    let logs = tempfile::tempdir().unwrap();
    let a = write_source(logs.path(), "a.jsonl", "one\n");
    let b = write_source(logs.path(), "b.jsonl", "two\n");
    let missing = logs.path().join("never-written.jsonl");

    let report = store.stale_files(&[a.clone(), b.clone(), missing.clone()]).unwrap();
    assert_eq!(report.stale, vec![a.clone(), b.clone()]);
    assert!(report.deleted.is_empty());

    store.commit_fingerprint(&a, 1).unwrap();
    store.commit_fingerprint(&b, 1).unwrap();
    assert_eq!(store.fingerprint_count().unwrap(), 2);

    let report = store.stale_files(&[a.clone(), b.clone()]).unwrap();
    assert!(report.is_empty());

    // Growth changes the size, so the file is stale again
    std::fs::write(&b, "two\nthree\n").unwrap();
    let report = store.stale_files(&[a.clone(), b.clone()]).unwrap();
    assert_eq!(report.stale, vec![b.clone()]);

    // Dropping a candidate reports it deleted
    let report = store.stale_files(&[b.clone()]).unwrap();
    assert_eq!(report.deleted, vec![a.to_string_lossy().into_owned()]);
    assert_eq!(store.remove_fingerprints(&report.deleted).unwrap(), 1);
    assert_eq!(store.fingerprint_count().unwrap(), 1);
    assert_eq!(store.remove_fingerprints(&report.deleted).unwrap(), 0);
}


fn stats_count_unpriced_models_at_zero_cost(format: StorageFormat) {
    let test_store = setup_store(format);
    let store = test_store.store.as_ref();
    let batch = vec![
        prompt("s1", "u1", "2025-03-01"),
        response("s1", "u2", "2025-03-01", 1_000_000, 100_000),
        with_model(response("s1", "u3", "2025-03-02", 2_000_000, 0), "mystery-model"),
    ];
    store.save(&batch, StorageMode::Full, None).unwrap();

    let stats = store.stats().unwrap();
    assert_eq!(stats.total_records, 3);
    assert_eq!(stats.total_prompts, 1);
    assert_eq!(stats.total_responses, 2);
    assert_eq!(stats.tokens_by_model["mystery-model"], 2_000_000);
    assert_eq!(stats.cost_by_model["mystery-model"], 0.0);

    // Sonnet 4: $3 input, $15 output per million
    let sonnet_cost = stats.cost_by_model[support::SONNET];
    assert!((sonnet_cost - 4.5).abs() < 1e-9);
    assert!((stats.total_cost - 4.5).abs() < 1e-9);
    assert!((stats.avg_cost_per_response - 2.25).abs() < 1e-9);
    assert_eq!(stats.avg_tokens_per_response, 1_550_000);
    assert!(stats.newest_timestamp.is_some());
}


fn device_columns_evolve_idempotently(format: StorageFormat) {
    let test_store = setup_store(format);
    let store = test_store.store.as_ref();
    let batch = vec![
        response("s1", "u1", "2025-03-01", 1, 1),
        response("s1", "u2", "2025-03-02", 1, 1),
    ];
    store.save(&batch, StorageMode::Full, None).unwrap();
    assert!(store.has_device_columns().unwrap());

    // Two raw records plus two ledger rows were untagged
    let laptop = device("laptop");
    assert_eq!(store.add_device_columns(&laptop).unwrap(), 4);
    assert_eq!(store.add_device_columns(&laptop).unwrap(), 0);

    let records = store.load_records(None, None).unwrap();
    assert!(records
        .iter()
        .all(|r| r.device.device_id.as_deref() == Some("laptop")));
}


fn replica_push_replaces_by_owner(format: StorageFormat) {
    let laptop = setup_store(format);
    let desktop = setup_store(format);
    let replica_dir = tempfile::tempdir().unwrap();
    let replica_path = replica_dir
        .path()
        .join(format!("replica{}", format.extension()));

    laptop
        .store
        .save(
            &[
                response("s1", "u1", "2025-03-01", 1, 1),
                response("s1", "u2", "2025-03-02", 1, 1),
            ],
            StorageMode::Full,
            Some(&device("laptop")),
        )
        .unwrap();
    desktop
        .store
        .save(
            &[response("s9", "u9", "2025-03-01", 5, 5)],
            StorageMode::Full,
            Some(&device("desktop")),
        )
        .unwrap();

    let report = laptop.store.push_replica(&replica_path, "laptop").unwrap();
    assert_eq!(report.rows["usage_records"], 2);
    desktop.store.push_replica(&replica_path, "desktop").unwrap();

    // Pushing again replaces rather than duplicates
    let report = laptop.store.push_replica(&replica_path, "laptop").unwrap();
    assert_eq!(report.rows["usage_records"], 2);
    assert_eq!(report.rows["daily_snapshots"], 2);

    let devices = goblin_store::replica::replica_devices(&replica_path, format).unwrap();
    assert_eq!(devices, vec!["desktop".to_string(), "laptop".to_string()]);

    // A smaller local dataset shrinks the owner's rows and nobody else's
    let shrunk = setup_store(format);
    shrunk
        .store
        .save(
            &[response("s1", "u1", "2025-03-01", 1, 1)],
            StorageMode::Full,
            Some(&device("laptop")),
        )
        .unwrap();
    let report = goblin_store::replica::push_replica(shrunk.store.as_ref(), &replica_path, "laptop").unwrap();
    assert_eq!(report.rows["usage_records"], 1);

    let report = desktop.store.push_replica(&replica_path, "desktop").unwrap();
    assert_eq!(report.rows["usage_records"], 1);
    assert!(report.tables.contains(&Table::ModelPricing.name().to_string()));
}
