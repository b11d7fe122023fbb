//! End-to-end runs over real directories.
//!
//! Each test lays out a small corpus in a temp dir, runs the driver with a
//! given callback and checks what lands on disk and in the store.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use piececas::{ArchiveBuilder, ArchiveEntry, ArchiveError, ArchiveSource, FlatArchiveBuilder, SliceArchive};
use piececonf::SliceConfig;
use piecework::{
    run_loop, run_once, BuildCallback, ExtraFileFeeder, Feeder, LoopParams, MetadataStore, NoFeeder,
    PartitionError, RunContext, RunParams, Status,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// `in/f1` (10 bytes), `in/f2` (10 bytes), `in/nested/f3` (5 bytes).
fn corpus(root: &Path) -> PathBuf {
    let input = root.join("in");
    fs::create_dir_all(input.join("nested")).unwrap();
    fs::write(input.join("f1"), b"aaaaaaaaaa").unwrap();
    fs::write(input.join("f2"), b"bbbbbbbbbb").unwrap();
    fs::write(input.join("nested").join("f3"), b"ccccc").unwrap();
    input
}

fn params(input: &Path, capacity: i64) -> RunParams {
    RunParams {
        parent_path: Some(input.to_path_buf()),
        random_select_file: false,
        skip_filename: false,
        ..RunParams::new(vec![input.to_path_buf()], "dataset", capacity)
    }
}

fn context(callback: BuildCallback, feeder: Arc<dyn Feeder>, store: Option<Arc<MetadataStore>>) -> RunContext {
    RunContext {
        builder: Arc::new(FlatArchiveBuilder),
        callback: Arc::new(callback),
        feeder,
        store,
    }
}

fn layout(detail: &str) -> Vec<(String, u64, u64)> {
    let entries: Vec<ArchiveEntry> = serde_json::from_str(detail).unwrap();
    entries
        .into_iter()
        .map(|e| (e.name.unwrap_or_default(), e.start, e.size))
        .collect()
}

fn entry(name: &str, start: u64, size: u64) -> (String, u64, u64) {
    (name.to_string(), start, size)
}

#[tokio::test]
async fn test_three_files_into_three_slices() {
    let temp_dir = TempDir::new().unwrap();
    let input = corpus(temp_dir.path());
    let ctx = context(BuildCallback::discard(), Arc::new(NoFeeder), None);

    let report = run_once(&params(&input, 12), &ctx, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.files, 3);
    assert_eq!(report.slices, 3);
    assert_eq!(report.input_bytes, 25);
    assert_eq!(report.supplementary_bytes, 0);

    let names: Vec<&str> = report.records.iter().map(|r| r.slice_name.as_str()).collect();
    assert_eq!(
        names,
        vec!["dataset-total-3-part-0", "dataset-total-3-part-1", "dataset-total-3-part-2"]
    );

    let layouts: Vec<_> = report.records.iter().map(|r| layout(&r.detail)).collect();
    assert_eq!(
        layouts,
        vec![
            vec![entry("f1", 0, 10), entry("f2.00000000", 0, 2)],
            vec![entry("f2.00000001", 2, 8), entry("nested/f3.00000000", 0, 4)],
            vec![entry("nested/f3.00000001", 4, 1)],
        ]
    );
    assert!(report.records.iter().all(|r| r.archive_path.is_none()));
}

#[tokio::test]
async fn test_skip_filename_hides_entry_names() {
    let temp_dir = TempDir::new().unwrap();
    let input = corpus(temp_dir.path());
    let ctx = context(BuildCallback::discard(), Arc::new(NoFeeder), None);

    let mut run = params(&input, 100);
    run.skip_filename = true;
    let report = run_once(&run, &ctx, &CancellationToken::new()).await.unwrap();

    assert_eq!(report.slices, 1);
    let detail = &report.records[0].detail;
    assert!(!detail.contains("f1"));
    assert_eq!(
        layout(detail),
        vec![entry("", 0, 10), entry("", 0, 10), entry("", 0, 5)]
    );
}

#[tokio::test]
async fn test_manifest_only_writes_archives_and_rows() {
    let temp_dir = TempDir::new().unwrap();
    let input = corpus(temp_dir.path());
    let car_dir = temp_dir.path().join("cars");
    fs::create_dir(&car_dir).unwrap();
    let ctx = context(BuildCallback::manifest_only(&car_dir), Arc::new(NoFeeder), None);

    let report = run_once(&params(&input, 12), &ctx, &CancellationToken::new())
        .await
        .unwrap();

    for record in &report.records {
        let path = record.archive_path.as_ref().unwrap();
        assert_eq!(path, &car_dir.join(format!("{}.car", record.payload_cid)));
        assert_eq!(fs::metadata(path).unwrap().len(), record.payload_size);
        assert!(record.piece_cid.is_none());
    }

    let manifest = fs::read_to_string(car_dir.join("manifest.csv")).unwrap();
    let lines: Vec<&str> = manifest.split_terminator("\r\n").collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0], "payload_cid,filename,detail");
    for record in &report.records {
        assert!(lines.iter().any(|l| l.starts_with(&format!("{},{},", record.payload_cid, record.slice_name))));
    }
}

#[tokio::test]
async fn test_commitment_recording_with_store() {
    let temp_dir = TempDir::new().unwrap();
    let input = corpus(temp_dir.path());
    let car_dir = temp_dir.path().join("cars");
    fs::create_dir(&car_dir).unwrap();
    let store = Arc::new(MetadataStore::in_memory().unwrap());
    let ctx = context(
        BuildCallback::commitment_recording(&car_dir, true, true),
        Arc::new(NoFeeder),
        Some(store.clone()),
    );

    let report = run_once(&params(&input, 12), &ctx, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.records.len(), 3);

    for record in &report.records {
        let piece_cid = record.piece_cid.as_ref().unwrap().to_string();
        let piece_size = record.piece_size.unwrap();
        assert!(piece_size.is_power_of_two());
        assert!(piece_size >= record.payload_size);

        // Renamed and padded
        let path = record.archive_path.as_ref().unwrap();
        assert_eq!(path, &car_dir.join(&piece_cid));
        assert_eq!(fs::metadata(path).unwrap().len(), piece_size);

        let stored = store
            .get_by_payload_cid(&record.payload_cid.to_string())
            .unwrap()
            .unwrap();
        assert_eq!(stored.piece_cid, piece_cid);
        assert_eq!(stored.filename, record.slice_name);
        assert_eq!(stored.payload_size as u64, record.payload_size);
        assert_eq!(stored.piece_size as u64, piece_size);
        assert_eq!(stored.status, Status::Completed);
    }

    let stats = store.stats_by_status().unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.by_status.get(&Status::Completed), Some(&3));

    let manifest = fs::read_to_string(car_dir.join("manifest.csv")).unwrap();
    let lines: Vec<&str> = manifest.split_terminator("\r\n").collect();
    assert_eq!(lines[0], "payload_cid,filename,piece_cid,payload_size,piece_size,detail");
    assert_eq!(lines.len(), 4);
}

#[tokio::test]
async fn test_rerun_keeps_existing_archives_and_records() {
    let temp_dir = TempDir::new().unwrap();
    let input = corpus(temp_dir.path());
    let car_dir = temp_dir.path().join("cars");
    fs::create_dir(&car_dir).unwrap();
    let store = Arc::new(MetadataStore::in_memory().unwrap());
    let ctx = context(
        BuildCallback::commitment_recording(&car_dir, false, false),
        Arc::new(NoFeeder),
        Some(store.clone()),
    );

    let first = run_once(&params(&input, 12), &ctx, &CancellationToken::new())
        .await
        .unwrap();
    let second = run_once(&params(&input, 12), &ctx, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(first.records, second.records);
    let (_, total) = store.list(0, 10, None).unwrap();
    assert_eq!(total, 3);
}

#[tokio::test]
async fn test_extra_files_ride_in_every_slice() {
    let temp_dir = TempDir::new().unwrap();
    let input = corpus(temp_dir.path());
    let extra_dir = temp_dir.path().join("extra");
    fs::create_dir(&extra_dir).unwrap();
    fs::write(extra_dir.join("x.jpg"), b"xxx").unwrap();
    fs::write(extra_dir.join("y.jpg"), b"yyy").unwrap();

    let feeder = ExtraFileFeeder::from_dir(&extra_dir, 3, false, 2).await.unwrap();
    let ctx = context(BuildCallback::discard(), Arc::new(feeder), None);

    // 15 bytes minus 3 reserved leaves the same 12 byte layout
    let report = run_once(&params(&input, 15), &ctx, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.slices, 3);
    assert_eq!(report.input_bytes, 25);
    assert_eq!(report.supplementary_bytes, 9);

    for record in &report.records {
        let entries = layout(&record.detail);
        let (first_name, first_start, first_size) = &entries[0];
        assert!(first_name == "x.jpg" || first_name == "y.jpg", "unexpected {first_name}");
        assert_eq!((*first_start, *first_size), (0, 3));
        let input_bytes: u64 = entries[1..].iter().map(|(_, _, size)| size).sum();
        assert!(input_bytes <= 12);
    }
}

#[tokio::test]
async fn test_anonymized_names_keep_layout() {
    let temp_dir = TempDir::new().unwrap();
    let input = corpus(temp_dir.path());
    let ctx = context(BuildCallback::discard(), Arc::new(NoFeeder), None);

    let mut run = params(&input, 12);
    run.random_rename_source_file = true;
    let report = run_once(&run, &ctx, &CancellationToken::new()).await.unwrap();

    let all: Vec<(String, u64, u64)> = report.records.iter().flat_map(|r| layout(&r.detail)).collect();
    assert_eq!(all.len(), 5);
    for (name, _, _) in &all {
        let file_name = name.rsplit('/').next().unwrap_or_default();
        assert_eq!(file_name.len(), 32, "{name} was not anonymized");
    }
    let sizes: Vec<u64> = all.iter().map(|(_, _, size)| *size).collect();
    assert_eq!(sizes, vec![10, 2, 8, 4, 1]);
}

#[tokio::test]
async fn test_shuffled_run_conserves_bytes() {
    let temp_dir = TempDir::new().unwrap();
    let input = temp_dir.path().join("in");
    fs::create_dir(&input).unwrap();
    for i in 0..40u64 {
        fs::write(input.join(format!("file{i:02}")), vec![b'z'; (i * 7 % 50) as usize]).unwrap();
    }
    let ctx = context(BuildCallback::discard(), Arc::new(NoFeeder), None);

    let mut run = params(&input, 64);
    run.random_select_file = true;
    run.parallel = 4;
    let report = run_once(&run, &ctx, &CancellationToken::new()).await.unwrap();

    let expected: u64 = (0..40u64).map(|i| i * 7 % 50).sum();
    assert_eq!(report.input_bytes, expected);
    let from_details: u64 = report
        .records
        .iter()
        .flat_map(|r| layout(&r.detail))
        .map(|(_, _, size)| size)
        .sum();
    assert_eq!(from_details, expected);

    let indices: Vec<u64> = report.records.iter().map(|r| r.slice_index).collect();
    assert_eq!(indices, (0..report.slices).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_empty_input_yields_no_slices() {
    let temp_dir = TempDir::new().unwrap();
    let input = temp_dir.path().join("in");
    fs::create_dir(&input).unwrap();
    let car_dir = temp_dir.path().join("cars");
    fs::create_dir(&car_dir).unwrap();
    let ctx = context(BuildCallback::manifest_only(&car_dir), Arc::new(NoFeeder), None);

    let report = run_once(&params(&input, 12), &ctx, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.files, 0);
    assert_eq!(report.slices, 0);
    assert!(report.records.is_empty());
    assert!(!car_dir.join("manifest.csv").exists());
}

#[tokio::test]
async fn test_missing_root_is_skipped() {
    let temp_dir = TempDir::new().unwrap();
    let input = corpus(temp_dir.path());
    let ctx = context(BuildCallback::discard(), Arc::new(NoFeeder), None);

    let mut run = params(&input, 12);
    run.inputs.push(temp_dir.path().join("does-not-exist"));
    let report = run_once(&run, &ctx, &CancellationToken::new()).await.unwrap();

    assert_eq!(report.skipped, 1);
    assert_eq!(report.slices, 3);
}

#[tokio::test]
async fn test_zero_capacity_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let input = corpus(temp_dir.path());
    let ctx = context(BuildCallback::discard(), Arc::new(NoFeeder), None);

    let err = run_once(&params(&input, 0), &ctx, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PartitionError>(),
        Some(PartitionError::InvalidCapacity(0))
    ));
}

/// Builder that fails on one slice name.
struct FailingBuilder {
    fail_on: &'static str,
}

impl ArchiveBuilder for FailingBuilder {
    fn build(&self, name: &str, sources: &[ArchiveSource]) -> Result<SliceArchive, ArchiveError> {
        if name == self.fail_on {
            return Err(ArchiveError::TooManyEntries(sources.len()));
        }
        FlatArchiveBuilder.build(name, sources)
    }
}

#[tokio::test]
async fn test_build_failure_ends_the_run() {
    let temp_dir = TempDir::new().unwrap();
    let input = corpus(temp_dir.path());
    let ctx = RunContext {
        builder: Arc::new(FailingBuilder {
            fail_on: "dataset-total-3-part-1",
        }),
        ..context(BuildCallback::discard(), Arc::new(NoFeeder), None)
    };

    let err = run_once(&params(&input, 12), &ctx, &CancellationToken::new())
        .await
        .unwrap_err();
    let message = format!("{err:#}");
    assert!(message.contains("failed to build slice dataset-total-3-part-1"), "{message}");
}

#[tokio::test]
async fn test_cancelled_token_stops_run() {
    let temp_dir = TempDir::new().unwrap();
    let input = corpus(temp_dir.path());
    let ctx = context(BuildCallback::discard(), Arc::new(NoFeeder), None);

    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(run_once(&params(&input, 12), &ctx, &cancel).await.is_err());
}

#[tokio::test]
async fn test_loop_bumps_and_persists_capacity() {
    let temp_dir = TempDir::new().unwrap();
    let input = corpus(temp_dir.path());
    let config_path = temp_dir.path().join("config.toml");
    let mut config = SliceConfig::with_capacity(12);
    config.save(&config_path).unwrap();

    let ctx = context(BuildCallback::discard(), Arc::new(NoFeeder), None);
    let loop_params = LoopParams {
        config_path: Some(config_path.clone()),
        capacity_step: 1,
        delay: Duration::from_millis(20),
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            cancel.cancel();
        });
    }

    let runs = run_loop(params(&input, 12), &ctx, &mut config, &loop_params, &cancel)
        .await
        .unwrap();

    assert!(runs >= 1);
    assert_eq!(config.slice_size, 12 + runs as i64);
    assert_eq!(SliceConfig::load(&config_path).unwrap().slice_size, config.slice_size);
}

#[tokio::test]
async fn test_loop_exits_when_already_cancelled() {
    let temp_dir = TempDir::new().unwrap();
    let input = corpus(temp_dir.path());
    let mut config = SliceConfig::with_capacity(12);
    let ctx = context(BuildCallback::discard(), Arc::new(NoFeeder), None);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let runs = run_loop(params(&input, 12), &ctx, &mut config, &LoopParams::default(), &cancel)
        .await
        .unwrap();

    assert_eq!(runs, 0);
    assert_eq!(config.slice_size, 12);
}
