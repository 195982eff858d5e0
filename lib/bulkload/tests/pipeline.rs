use anyhow::{bail, Result};
use bulkload::runtime::SpillStages;
use bulkload::stats::Progress;
use bulkload::writer::RunWriter;
use bulkload::{
    Aggregator, FlatPosting, Loader, LoaderOptions, Merger, Phase, PostingListWriter, PostingValue, QueueCapacities, RdfTransformer,
    RecordTransformer, SchemaStore, SharedState, SpillWriter,
};
use crossbeam_channel::{Receiver, Sender};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value as JsonValue;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

// ---------- fixtures ----------

fn options(root: &Path, rdf: &Path, width: usize) -> LoaderOptions {
    let mut o = LoaderOptions::new(rdf, root.join("schema.txt"), root.join("out"), root.join("tmp"), width);
    o.queues = QueueCapacities::default();
    o.spill_bytes = 4 * 1024;
    o.progress_interval = Duration::from_millis(50);
    o.keep_intermediates = false;
    o
}

fn state(opts: LoaderOptions) -> SharedState {
    SharedState::with_schema(opts, SchemaStore::parse("").unwrap()).unwrap()
}

fn write_source(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    if name.ends_with(".gz") {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(content.as_bytes()).unwrap();
        std::fs::write(&path, enc.finish().unwrap()).unwrap();
    } else {
        std::fs::write(&path, content).unwrap();
    }
    path
}

fn numbered_lines(n: usize) -> String {
    (0..n).map(|i| format!("record {}\n", i)).collect()
}

/// One posting per record, keyed by the record text.
#[derive(Default)]
struct CountingTransformer {
    calls: AtomicUsize,
}

impl RecordTransformer for CountingTransformer {
    type Posting = FlatPosting;

    fn transform<F>(&self, record: &str, emit: &mut F) -> Result<()>
    where
        F: FnMut(FlatPosting),
    {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if record.contains("poison") {
            bail!("poisoned record");
        }
        emit(FlatPosting { key: record.as_bytes().to_vec(), posting: PostingValue::Uid(1) });
        Ok(())
    }
}

#[derive(Default)]
struct Collector {
    batches: Mutex<Vec<Vec<FlatPosting>>>,
    finished: AtomicBool,
}

impl Collector {
    fn keys(&self) -> Vec<Vec<u8>> {
        let mut keys: Vec<Vec<u8>> = self.batches.lock().unwrap().iter().map(|b| b[0].key.clone()).collect();
        keys.sort();
        keys
    }

    fn postings(&self) -> usize { self.batches.lock().unwrap().iter().map(|b| b.len()).sum() }
}

impl Aggregator for Collector {
    type Posting = FlatPosting;

    fn aggregate(&self, batch: Vec<FlatPosting>) -> Result<()> {
        assert!(batch.iter().all(|p| p.key == batch[0].key));
        self.batches.lock().unwrap().push(batch);
        Ok(())
    }

    fn finish(&self) -> Result<()> {
        self.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ---------- pipeline properties ----------

#[test]
fn every_record_reaches_a_mapper_once_and_temp_dir_is_removed() {
    let root = tempfile::tempdir().unwrap();
    let rdf = write_source(root.path(), "in.txt", &numbered_lines(500));
    let mut loader = Loader::new(state(options(root.path(), &rdf, 4)), CountingTransformer::default(), Collector::default());

    let runs = loader.map_phase().unwrap().to_vec();
    assert!(runs.len() > 1, "a 4 KiB spill budget should produce several runs");
    let tmp = loader.tmp_dir().unwrap().to_path_buf();
    assert!(runs.iter().all(|r| r.starts_with(&tmp)));

    loader.reduce_phase().unwrap();
    loader.cleanup().unwrap();

    assert_eq!(loader.phase(), Phase::Done);
    assert!(!tmp.exists());
    let snap = loader.state().progress.snapshot();
    assert_eq!(snap.records_read, 500);
    assert_eq!(snap.postings_spilled, 500);
    assert_eq!(snap.batches_reduced, 500);
    let agg = loader.aggregator();
    assert_eq!(agg.postings(), 500);
    assert_eq!(agg.keys().len(), 500);
    assert!(agg.finished.load(Ordering::SeqCst));
}

#[test]
fn mapper_invocations_match_line_count() {
    let root = tempfile::tempdir().unwrap();
    // trailing line without terminator and an empty line still count
    let rdf = write_source(root.path(), "in.txt", "a\n\nb\r\nc");
    let mut loader = Loader::new(state(options(root.path(), &rdf, 3)), CountingTransformer::default(), Collector::default());
    loader.run().unwrap();
    let snap = loader.state().progress.snapshot();
    assert_eq!(loader.transformer().calls.load(Ordering::SeqCst), 4);
    assert_eq!(snap.records_read, 4);
    assert_eq!(snap.postings_mapped, 4);
    assert_eq!(loader.aggregator().keys(), vec![b"".to_vec(), b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
}

#[test]
fn gzip_and_plain_sources_load_identically() {
    let root = tempfile::tempdir().unwrap();
    let content = numbered_lines(300);
    let load = |name: &str| {
        let rdf = write_source(root.path(), name, &content);
        let mut loader = Loader::new(state(options(root.path(), &rdf, 2)), CountingTransformer::default(), Collector::default());
        loader.run().unwrap();
        let calls = loader.state().progress.snapshot().records_read;
        (calls, loader.aggregator().keys())
    };
    let plain = load("in.txt");
    let gz = load("in.txt.gz");
    assert_eq!(plain.0, 300);
    assert_eq!(plain, gz);
}

/// Drains every run, then hands out ten ready batches at once.
struct TenBatches;

impl Merger<FlatPosting> for TenBatches {
    fn shuffle(&self, runs: Vec<Receiver<Result<FlatPosting>>>, batches: Sender<Vec<FlatPosting>>, _progress: &Progress) -> Result<()> {
        for rx in runs {
            for item in rx.iter() {
                item?;
            }
        }
        for i in 0..10u8 {
            batches.send(vec![FlatPosting { key: vec![i], posting: PostingValue::Uid(i as u64) }])?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct ConcurrencyGauge {
    active: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl Aggregator for ConcurrencyGauge {
    type Posting = FlatPosting;

    fn aggregate(&self, _batch: Vec<FlatPosting>) -> Result<()> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn reducer_concurrency_never_exceeds_width() {
    let root = tempfile::tempdir().unwrap();
    let rdf = write_source(root.path(), "in.txt", &numbered_lines(20));
    let opts = options(root.path(), &rdf, 2);
    let mut stages = SpillStages::new(opts.spill_bytes);
    stages.merger = Box::new(TenBatches);
    let mut loader = Loader::with_stages(state(opts), CountingTransformer::default(), ConcurrencyGauge::default(), stages);
    loader.run().unwrap();

    let gauge = loader.aggregator();
    assert_eq!(gauge.calls.load(Ordering::SeqCst), 10);
    let peak = gauge.peak.load(Ordering::SeqCst);
    assert!((1..=2).contains(&peak), "peak concurrency {}", peak);
}

#[test]
fn empty_source_keeps_temp_dir() {
    let root = tempfile::tempdir().unwrap();
    let rdf = write_source(root.path(), "empty.txt", "");
    let mut loader = Loader::new(state(options(root.path(), &rdf, 2)), CountingTransformer::default(), Collector::default());
    assert!(loader.map_phase().unwrap().is_empty());
    loader.reduce_phase().unwrap();
    loader.cleanup().unwrap();

    assert_eq!(loader.phase(), Phase::Done);
    assert!(loader.tmp_dir().unwrap().is_dir());
    assert_eq!(loader.aggregator().postings(), 0);
    assert!(loader.aggregator().finished.load(Ordering::SeqCst));
}

#[test]
fn keep_intermediates_leaves_runs_on_disk() {
    let root = tempfile::tempdir().unwrap();
    let rdf = write_source(root.path(), "in.txt", &numbered_lines(50));
    let mut opts = options(root.path(), &rdf, 2);
    opts.keep_intermediates = true;
    let mut loader = Loader::new(state(opts), CountingTransformer::default(), Collector::default());
    loader.run().unwrap();
    assert!(loader.runs().unwrap().iter().all(|r| r.is_file()));
}

/// Reads slowly, then spills through the regular run writer.
struct SlowWriter;

impl SpillWriter<FlatPosting> for SlowWriter {
    fn write_runs(&self, dir: &Path, postings: Receiver<FlatPosting>, progress: &Progress) -> Result<Vec<PathBuf>> {
        let mut held = Vec::new();
        for (i, p) in postings.iter().enumerate() {
            if i % 100 == 0 {
                thread::sleep(Duration::from_millis(2));
            }
            held.push(p);
        }
        let (tx, rx) = crossbeam_channel::unbounded();
        for p in held {
            tx.send(p)?;
        }
        drop(tx);
        RunWriter::new(8 * 1024).write_runs(dir, rx, progress)
    }
}

#[test]
fn backpressure_loses_nothing() {
    let root = tempfile::tempdir().unwrap();
    let rdf = write_source(root.path(), "in.txt", &numbered_lines(2000));
    let mut opts = options(root.path(), &rdf, 4);
    opts.queues = QueueCapacities { records: 1, postings: 1, runs: 1, batches: 1 };
    let mut stages = SpillStages::new(opts.spill_bytes);
    stages.writer = Box::new(SlowWriter);
    let mut loader = Loader::with_stages(state(opts), CountingTransformer::default(), Collector::default(), stages);
    loader.run().unwrap();

    assert_eq!(loader.state().progress.snapshot().postings_spilled, 2000);
    assert_eq!(loader.aggregator().postings(), 2000);
    assert_eq!(loader.aggregator().keys().len(), 2000);
}

// ---------- failures ----------

#[test]
fn transformer_error_fails_the_map_phase() {
    let root = tempfile::tempdir().unwrap();
    let mut content = numbered_lines(200);
    content.push_str("poison pill\n");
    content.push_str(&numbered_lines(200));
    let rdf = write_source(root.path(), "in.txt", &content);
    let mut loader = Loader::new(state(options(root.path(), &rdf, 3)), CountingTransformer::default(), Collector::default());

    let err = loader.run().unwrap_err();
    assert!(format!("{:#}", err).contains("poisoned record"));
    assert_eq!(loader.phase(), Phase::Mapping);
    assert!(loader.runs().is_none());
    assert!(!loader.is_reporting());
    assert!(loader.reduce_phase().is_err());
}

#[test]
fn transformer_error_stops_the_other_mappers() {
    let root = tempfile::tempdir().unwrap();
    let mut content = numbered_lines(20);
    content.push_str("poison pill\n");
    content.push_str(&numbered_lines(5000));
    let rdf = write_source(root.path(), "in.txt", &content);
    let mut loader = Loader::new(state(options(root.path(), &rdf, 4)), CountingTransformer::default(), Collector::default());

    assert!(loader.map_phase().is_err());
    let calls = loader.transformer().calls.load(Ordering::SeqCst);
    assert!(calls < 2500, "{} records transformed after the failure", calls);
    assert!(loader.state().progress.snapshot().postings_spilled < 2500);
}

struct AlwaysFails;

impl Aggregator for AlwaysFails {
    type Posting = FlatPosting;

    fn aggregate(&self, _batch: Vec<FlatPosting>) -> Result<()> {
        bail!("disk full")
    }
}

#[test]
fn aggregator_errors_do_not_deadlock() {
    let root = tempfile::tempdir().unwrap();
    let rdf = write_source(root.path(), "in.txt", &numbered_lines(100));
    let mut loader = Loader::new(state(options(root.path(), &rdf, 2)), CountingTransformer::default(), AlwaysFails);

    loader.map_phase().unwrap();
    let err = loader.reduce_phase().unwrap_err();
    assert!(format!("{:#}", err).contains("disk full"));
    assert!(!loader.is_reporting());
    // failed reduce: runs stay for inspection
    assert!(loader.cleanup().is_err());
    assert!(loader.tmp_dir().unwrap().is_dir());
}

/// Spreads records over twenty keys, one uid posting per record.
struct TwentyKeys;

impl RecordTransformer for TwentyKeys {
    type Posting = FlatPosting;

    fn transform<F>(&self, record: &str, emit: &mut F) -> Result<()>
    where
        F: FnMut(FlatPosting),
    {
        let n: u64 = record.trim_start_matches("record ").parse()?;
        emit(FlatPosting { key: format!("key{:02}", n % 20).into_bytes(), posting: PostingValue::Uid(n) });
        Ok(())
    }
}

#[test]
fn unreadable_run_aborts_without_partial_posting_lists() {
    let root = tempfile::tempdir().unwrap();
    let rdf = write_source(root.path(), "in.txt", &numbered_lines(400));
    let mut loader = Loader::new(state(options(root.path(), &rdf, 2)), TwentyKeys, Collector::default());
    let runs = loader.map_phase().unwrap().to_vec();
    assert!(runs.len() > 1);

    // tear the first run in the middle of a frame header; every frame has the same size
    let bytes = std::fs::read(&runs[0]).unwrap();
    let frame = 4 + u32::from_le_bytes(bytes[..4].try_into().unwrap()) as usize;
    let cut = (bytes.len() / frame / 2) * frame + 2;
    std::fs::write(&runs[0], &bytes[..cut]).unwrap();

    let err = loader.reduce_phase().unwrap_err();
    assert!(format!("{:#}", err).contains("truncated frame header"), "{:#}", err);

    let agg = loader.aggregator();
    let batches = agg.batches.lock().unwrap();
    assert!(batches.len() < 20);
    for batch in batches.iter() {
        assert_eq!(batch.len(), 20, "incomplete posting list for {:?}", String::from_utf8_lossy(&batch[0].key));
    }
    drop(batches);
    assert!(!agg.finished.load(Ordering::SeqCst));
    assert!(!loader.is_reporting());
    assert!(loader.cleanup().is_err());
    assert!(runs.iter().all(|r| r.is_file()));
}

#[test]
fn setup_failures_start_no_workers() {
    let root = tempfile::tempdir().unwrap();
    let missing = root.path().join("missing.txt");
    let mut loader = Loader::new(state(options(root.path(), &missing, 2)), CountingTransformer::default(), Collector::default());
    assert!(loader.map_phase().is_err());
    assert!(loader.tmp_dir().is_none());

    let fake_gz = write_source(root.path(), "fake.gz", "not compressed\n");
    let mut loader = Loader::new(state(options(root.path(), &fake_gz, 2)), CountingTransformer::default(), Collector::default());
    let err = loader.map_phase().unwrap_err();
    assert!(err.to_string().contains("gzip"));
    assert_eq!(loader.state().progress.snapshot().records_read, 0);

    let mut bad = options(root.path(), &missing, 0);
    assert!(SharedState::with_schema(bad.clone(), SchemaStore::default()).is_err());
    bad.num_workers = 1;
    bad.queues.records = 0;
    assert!(SharedState::with_schema(bad, SchemaStore::default()).is_err());
}

#[test]
fn phases_must_run_in_order() {
    let root = tempfile::tempdir().unwrap();
    let rdf = write_source(root.path(), "in.txt", &numbered_lines(5));
    let mut loader = Loader::new(state(options(root.path(), &rdf, 1)), CountingTransformer::default(), Collector::default());
    assert_eq!(loader.phase(), Phase::Idle);
    assert!(loader.reduce_phase().is_err());
    assert!(loader.cleanup().is_err());

    loader.map_phase().unwrap();
    assert!(loader.map_phase().is_err());
    assert!(loader.cleanup().is_err());
    loader.reduce_phase().unwrap();
    assert!(loader.reduce_phase().is_err());
    loader.cleanup().unwrap();
    assert!(loader.cleanup().is_err());
}

// ---------- end to end ----------

const SCHEMA: &str = "\
name: string @index(term) .
friend: uid @reverse @count .
";

const DUMP: &str = r#"<alice> <name> "Alice Liddell" .
<bob> <name> "Bob" .
<alice> <friend> <bob> .
<alice> <friend> <carol> .
<carol> <friend> <bob> <social> .
# not data

<bob> <age> "31"^^<http://www.w3.org/2001/XMLSchema#int> .
"#;

#[test]
fn rdf_dump_becomes_posting_lists() {
    let root = tempfile::tempdir().unwrap();
    let rdf = write_source(root.path(), "dump.rdf.gz", DUMP);
    std::fs::write(root.path().join("schema.txt"), SCHEMA).unwrap();
    let opts = options(root.path(), &rdf, 3);
    let out = opts.out_dir.clone();

    let state = SharedState::new(opts).unwrap();
    let transformer = RdfTransformer::new(state.uids.clone(), state.schema.clone()).unwrap();
    let aggregator = PostingListWriter::create(&out, state.schema.clone(), state.progress.clone()).unwrap();
    let mut loader = Loader::new(state, transformer, aggregator);
    loader.run().unwrap();

    let lines: Vec<JsonValue> = std::fs::read_to_string(out.join("postings.jsonl"))
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    // data: name x2, friend x2, age x1; reverse: bob, carol; index: alice, liddell, bob
    assert_eq!(lines.len(), 10);
    assert_eq!(loader.state().progress.snapshot().keys_written, 10);

    let uids = &loader.state().uids;
    let (alice, bob, carol) = (uids.lookup("alice").unwrap(), uids.lookup("bob").unwrap(), uids.lookup("carol").unwrap());
    let find = |kind: &str, predicate: &str, uid: u64| {
        lines
            .iter()
            .find(|l| l["kind"] == kind && l["predicate"] == predicate && l["uid"] == uid)
            .unwrap_or_else(|| panic!("no {} {} line for {}", kind, predicate, uid))
    };

    let mut friends: Vec<u64> = find("data", "friend", alice)["uids"].as_array().unwrap().iter().map(|v| v.as_u64().unwrap()).collect();
    friends.sort();
    let mut expected = vec![bob, carol];
    expected.sort();
    assert_eq!(friends, expected);
    assert_eq!(find("data", "friend", alice)["count"], 2);
    assert_eq!(find("reverse", "friend", bob)["uids"].as_array().unwrap().len(), 2);
    assert_eq!(find("data", "age", bob)["values"][0]["value"], 31);

    let tokens: Vec<&str> = lines.iter().filter(|l| l["kind"] == "index").map(|l| l["token"].as_str().unwrap()).collect();
    assert_eq!(tokens.len(), 3);
    for t in ["alice", "liddell", "bob"] {
        assert!(tokens.contains(&t));
    }

    let schema = std::fs::read_to_string(out.join("schema.txt")).unwrap();
    assert!(schema.contains("age: int ."));
    assert!(schema.contains("friend: uid @reverse @count ."));
    assert!(!loader.tmp_dir().unwrap().exists());
}

#[test]
fn single_mapper_delivers_each_key_once() {
    let root = tempfile::tempdir().unwrap();
    let rdf = write_source(root.path(), "in.txt", &numbered_lines(120));
    let mut loader = Loader::new(state(options(root.path(), &rdf, 1)), CountingTransformer::default(), Collector::default());
    loader.run().unwrap();
    let keys = loader.aggregator().keys();
    let mut deduped = keys.clone();
    deduped.dedup();
    assert_eq!(keys.len(), 120);
    assert_eq!(keys, deduped, "a key reached the aggregator twice");
}
