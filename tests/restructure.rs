#[path = "common/mod.rs"]
mod common;

use common::*;
use restructure::{
    Format, LockManager, FileLockManager, Metrics, NoopLockManager, Restructurer, RunSummary, MAX_WRITE_ATTEMPTS,
};
use serde_json::json;
use std::fs;
use std::path::Path;
use std::sync::Arc;

fn offsets_table(root: &Path, topic: &str) -> Vec<String> {
    read_lines(&root.join("output").join("offsets").join(format!("{topic}.csv")))
}

fn hour_file(root: &Path, topic: &str) -> std::path::PathBuf {
    root.join("output").join("p").join("u").join(topic).join("20200101_0000.csv")
}

#[test]
fn two_files_merge_into_one_offset_range_and_rerun_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input");
    write_topic_file(&input, "t", 0, 0, 2);
    write_topic_file(&input, "t", 0, 2, 2);

    let first = Restructurer::new(test_options(dir.path())).run().unwrap();
    assert_eq!(
        first,
        RunSummary { topics_processed: 1, topics_skipped: 0, topics_failed: 0, files_processed: 2, records_written: 4 }
    );
    assert_eq!(offsets_table(dir.path(), "t"), ["offsetFrom,offsetTo,partition,topic", "0,3,0,t"]);
    assert_eq!(read_lines(&hour_file(dir.path(), "t")).len(), 5);
    let bins = read_lines(&dir.path().join("output").join("bins").join("t.csv"));
    assert_eq!(bins, ["topic,category,timestamp,count", "t,s,20200101_0000,4"]);

    let table_before = fs::read(dir.path().join("output").join("offsets").join("t.csv")).unwrap();
    let second = Restructurer::new(test_options(dir.path())).run().unwrap();
    assert_eq!(second.records_written, 0);
    assert_eq!(second.files_processed, 0);
    assert_eq!(fs::read(dir.path().join("output").join("offsets").join("t.csv")).unwrap(), table_before);
    assert_eq!(read_lines(&hour_file(dir.path(), "t")).len(), 5);
}

#[test]
fn new_files_are_appended_on_a_later_run() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input");
    write_topic_file(&input, "t", 0, 0, 3);
    Restructurer::new(test_options(dir.path())).run().unwrap();

    write_topic_file(&input, "t", 0, 3, 2);
    let summary = Restructurer::new(test_options(dir.path())).run().unwrap();
    assert_eq!(summary.records_written, 2);
    assert_eq!(offsets_table(dir.path(), "t"), ["offsetFrom,offsetTo,partition,topic", "0,4,0,t"]);
    assert_eq!(read_lines(&hour_file(dir.path(), "t")).len(), 6);
}

/// Output written but bookkeeping lost (killed before any flush): the next run
/// processes the offsets again and deduplication removes the repeated rows.
#[test]
fn lost_bookkeeping_is_reprocessed_without_duplicate_rows() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input");
    write_topic_file(&input, "t", 0, 0, 2);
    let opts = test_options(dir.path()).with_deduplicate(true);

    Restructurer::new(opts.clone()).run().unwrap();
    fs::remove_file(opts.offsets_dir().join("t.csv")).unwrap();
    fs::remove_file(opts.bins_dir().join("t.csv")).unwrap();

    let summary = Restructurer::new(opts.clone()).run().unwrap();
    assert_eq!(summary.records_written, 2);
    assert_eq!(offsets_table(dir.path(), "t"), ["offsetFrom,offsetTo,partition,topic", "0,1,0,t"]);
    let lines = read_lines(&hour_file(dir.path(), "t"));
    assert_eq!(lines.len(), 3, "{lines:?}");
}

#[test]
fn only_unseen_offsets_of_a_partially_seen_file_are_written() {
    let dir = tempfile::tempdir().unwrap();
    let opts = test_options(dir.path());
    fs::create_dir_all(opts.offsets_dir()).unwrap();
    fs::write(opts.offsets_dir().join("t.csv"), "offsetFrom,offsetTo,partition,topic\n0,1,0,t\n").unwrap();
    write_topic_file(&dir.path().join("input"), "t", 0, 0, 4);

    let summary = Restructurer::new(opts).run().unwrap();
    assert_eq!(summary.records_written, 2);
    let lines = read_lines(&hour_file(dir.path(), "t"));
    assert_eq!(lines.len(), 3);
    assert!(lines[1].ends_with(",2") && lines[2].ends_with(",3"), "{lines:?}");
    assert_eq!(offsets_table(dir.path(), "t"), ["offsetFrom,offsetTo,partition,topic", "0,3,0,t"]);
}

#[test]
fn conflicting_shapes_in_one_hour_go_to_suffixed_files() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input");
    write_records(
        &topic_file(&input, "t", 0, 0, 2),
        &[
            observation("p", "u", "s", T0, json!({ "x": 1 })),
            observation("p", "u", "s", T0 + 1, json!({ "y": "a" })),
            observation("p", "u", "s", T0 + 2, json!({ "x": 2 })),
        ],
    );

    let summary = Restructurer::new(test_options(dir.path())).run().unwrap();
    assert_eq!(summary.records_written, 3);
    let topic_dir = dir.path().join("output").join("p").join("u").join("t");
    assert_eq!(read_lines(&topic_dir.join("20200101_0000.csv")).len(), 3);
    assert_eq!(read_lines(&topic_dir.join("20200101_0000_1.csv")).len(), 2);
    assert!(topic_dir.join("schema-t.json").exists());
    assert!(topic_dir.join("schema-t_1.json").exists());
}

#[test]
fn retries_stop_after_the_attempt_bound() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input");
    let shapes: Vec<_> = (0..=MAX_WRITE_ATTEMPTS as i64)
        .map(|i| {
            let mut fields = serde_json::Map::new();
            fields.insert(format!("f{i}"), json!(i));
            observation("p", "u", "s", T0, serde_json::Value::Object(fields))
        })
        .collect();
    write_records(&topic_file(&input, "t", 0, 0, shapes.len() as i64 - 1), &shapes);

    let summary = Restructurer::new(test_options(dir.path())).run().unwrap();
    // Every attempt path is taken by an earlier shape, so the last record is left over.
    assert_eq!(summary.records_written, MAX_WRITE_ATTEMPTS as u64);
    let last = MAX_WRITE_ATTEMPTS as i64;
    assert_eq!(
        offsets_table(dir.path(), "t"),
        ["offsetFrom,offsetTo,partition,topic".to_string(), format!("0,{},0,t", last - 1)]
    );
}

#[test]
fn json_output_with_zstd() {
    let dir = tempfile::tempdir().unwrap();
    write_topic_file(&dir.path().join("input"), "t", 0, 0, 3);
    let opts = test_options(dir.path())
        .with_format(Format::Json)
        .with_compression(restructure::Compression::Zstd);
    Restructurer::new(opts).run().unwrap();

    let out = dir.path().join("output").join("p").join("u").join("t").join("20200101_0000.json.zst");
    let lines = read_zst_lines(&out);
    assert_eq!(lines.len(), 3);
    let first: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
    assert_eq!(first["value"]["x"], 0);
}

#[test]
fn transient_empty_and_excluded_inputs_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input");
    write_topic_file(&input, "t", 0, 0, 2);
    write_topic_file(&input, "skipme", 0, 0, 2);
    // Still being written upstream.
    write_topic_file(&input.join("+tmp"), "t", 0, 2, 2);
    // Zero-length file.
    let empty = topic_file(&input, "t", 0, 10, 11);
    fs::write(&empty, b"").unwrap();
    // Not a record file.
    fs::write(input.join("t").join("partition=0").join("README.txt"), b"hi").unwrap();

    let opts = test_options(dir.path()).with_excluded_topics(["skipme"]);
    let summary = Restructurer::new(opts).run().unwrap();
    assert_eq!(summary.topics_processed, 1);
    assert_eq!(summary.records_written, 2);
    assert!(!dir.path().join("output").join("p").join("u").join("skipme").exists());
    assert_eq!(offsets_table(dir.path(), "t"), ["offsetFrom,offsetTo,partition,topic", "0,1,0,t"]);
}

#[test]
fn file_cap_limits_files_per_run_lowest_offsets_first() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input");
    for from in [6, 0, 2, 4] {
        write_topic_file(&input, "t", 0, from, 2);
    }
    let opts = test_options(dir.path()).with_max_files_per_topic(Some(2));

    let first = Restructurer::new(opts.clone()).run().unwrap();
    assert_eq!(first.files_processed, 2);
    assert_eq!(offsets_table(dir.path(), "t"), ["offsetFrom,offsetTo,partition,topic", "0,3,0,t"]);

    Restructurer::new(opts).run().unwrap();
    assert_eq!(offsets_table(dir.path(), "t"), ["offsetFrom,offsetTo,partition,topic", "0,7,0,t"]);
}

#[test]
fn many_topics_and_partitions_run_concurrently() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input");
    for topic in ["a", "b", "c", "d", "e"] {
        for partition in 0..3 {
            write_topic_file(&input, topic, partition, 0, 5);
            write_topic_file(&input, topic, partition, 5, 5);
        }
    }
    let opts = test_options(dir.path()).with_threads(3).with_cache_size(1).with_batch_size(4);
    let summary = Restructurer::new(opts).run().unwrap();
    assert_eq!(summary.topics_processed, 5);
    assert_eq!(summary.records_written, 150);
    for topic in ["a", "b", "c", "d", "e"] {
        assert_eq!(
            offsets_table(dir.path(), topic),
            [
                "offsetFrom,offsetTo,partition,topic".to_string(),
                format!("0,9,0,{topic}"),
                format!("0,9,1,{topic}"),
                format!("0,9,2,{topic}"),
            ]
        );
    }
}

#[test]
fn locked_topics_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    write_topic_file(&dir.path().join("input"), "t", 0, 0, 2);
    let opts = test_options(dir.path());

    let held = FileLockManager::new(opts.locks_dir()).try_acquire("t").unwrap().unwrap();
    assert_eq!(held.topic(), "t");
    let summary = Restructurer::new(opts.clone()).run().unwrap();
    assert_eq!(summary.topics_skipped, 1);
    assert_eq!(summary.records_written, 0);
    assert!(!opts.offsets_dir().join("t.csv").exists());

    drop(held);
    let summary = Restructurer::new(opts).run().unwrap();
    assert_eq!(summary.records_written, 2);
}

#[test]
fn shutdown_flag_prevents_new_topics() {
    let dir = tempfile::tempdir().unwrap();
    write_topic_file(&dir.path().join("input"), "t", 0, 0, 2);
    let restructurer = Restructurer::new(test_options(dir.path())).with_lock_manager(Arc::new(NoopLockManager));
    restructurer.shutdown_flag().store(true, std::sync::atomic::Ordering::SeqCst);

    let summary = restructurer.run().unwrap();
    assert_eq!(summary.topics_skipped, 1);
    assert_eq!(summary.records_written, 0);
    // Service mode returns once the flag is set.
    restructurer.run_service(std::time::Duration::from_secs(60)).unwrap();
}

#[test]
fn invalid_configuration_fails_before_processing() {
    let dir = tempfile::tempdir().unwrap();
    write_topic_file(&dir.path().join("input"), "t", 0, 0, 2);
    let err = Restructurer::new(test_options(dir.path()).with_threads(0)).run().unwrap_err();
    assert!(err.to_string().contains("threads"), "{err:#}");
    assert!(!dir.path().join("output").exists());
}

#[test]
fn injected_metrics_collect_timings() {
    let dir = tempfile::tempdir().unwrap();
    write_topic_file(&dir.path().join("input"), "t", 0, 0, 3);
    let metrics = Metrics::new(true);
    Restructurer::new(test_options(dir.path())).with_metrics(metrics.clone()).run().unwrap();

    assert_eq!(metrics.get("store.write").unwrap().count, 3);
    assert_eq!(metrics.get("topic").unwrap().count, 1);
    assert!(metrics.get("accounting.close").is_some());
}
