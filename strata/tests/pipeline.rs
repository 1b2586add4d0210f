use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant, UNIX_EPOCH};

use assert2::check;
use metrics_util_020::debugging::{DebugValue, DebuggingRecorder};
use strata::{
    Downsampling, EntityId, GraphError, MetricId, Metrics, MetricsStreamProcessor, Model,
    PersistenceTimer, PipelineConfig, TimeBucket, TimeSource, Worker,
    aggregation::{EventKind, MetricsConsumer, PersistenceWorker, PersistentWorker, PrepareRequest},
    functions::SumMetrics,
    test_util::{ManuallyAdvancedTimeSource, MemoryStorage, RecordingConsumer},
};

fn hour_id(service: &str) -> MetricId {
    MetricId::new(
        EntityId::single(service),
        TimeBucket::new(2024010112, Downsampling::Hour).unwrap(),
    )
}

fn config() -> PipelineConfig {
    PipelineConfig::from_toml_str(
        r#"
        l1_flush_period_ms = 0
        downsampling_persistent_mod = 1

        [pool]
        threads = 1
        consume_cycle_ms = 1
        "#,
    )
    .unwrap()
}

fn stored_value(storage: &MemoryStorage, model: &Model, id: &MetricId) -> Option<i64> {
    storage.row(model, id).map(|row| row.long("value").unwrap())
}

/// Run rounds until `done` holds, giving the first level queue time to drain.
fn run_rounds_until(pipeline: &strata::RunningPipeline, done: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        pipeline.run_round();
        if done() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn records_are_persisted_at_every_level() {
    let clock = ManuallyAdvancedTimeSource::at_time(UNIX_EPOCH + Duration::from_millis(1_704_110_400_000));
    let storage = Arc::new(MemoryStorage::new());
    let totals = Arc::new(RecordingConsumer::<SumMetrics>::only(EventKind::Total));
    let model = Model::new("service_calls", Downsampling::Hour);

    let mut processor = MetricsStreamProcessor::new(config(), storage.clone())
        .unwrap()
        .time_source(TimeSource::custom(clock));
    let graph = processor
        .create::<SumMetrics>(
            model.clone(),
            storage.clone(),
            [totals.clone() as Arc<dyn MetricsConsumer<SumMetrics>>],
        )
        .unwrap();
    check!(graph.stages() == ["day", "hour", "l1", "month", "trans"]);
    let pipeline = processor.start().unwrap();

    for value in [1, 2, 3] {
        graph.start(SumMetrics::new(hour_id("X"), value));
    }
    let day = hour_id("X").downsample(Downsampling::Day).unwrap();
    let month = hour_id("X").downsample(Downsampling::Month).unwrap();
    let persisted = run_rounds_until(&pipeline, || {
        stored_value(&storage, &model, &hour_id("X")) == Some(6)
            && stored_value(&storage, &model.at(Downsampling::Day), &day) == Some(6)
            && stored_value(&storage, &model.at(Downsampling::Month), &month) == Some(6)
    });
    check!(persisted);
    check!(storage.rows() == 3);

    let levels: Vec<_> = totals
        .events()
        .into_iter()
        .map(|(m, _)| m.id().time_bucket().level())
        .collect();
    for level in [Downsampling::Hour, Downsampling::Day, Downsampling::Month] {
        check!(levels.contains(&level));
    }
}

#[test]
fn graphs_are_reachable_through_the_registry() {
    let storage = Arc::new(MemoryStorage::new());
    let model = Model::new("service_calls", Downsampling::Month);
    let mut processor = MetricsStreamProcessor::new(config(), storage.clone()).unwrap();
    let graph = processor.create::<SumMetrics>(model.clone(), storage.clone(), []).unwrap();
    check!(graph.stages() == ["l1", "month"]);
    let pipeline = processor.start().unwrap();

    let id = hour_id("X").downsample(Downsampling::Month).unwrap();
    pipeline
        .registry()
        .start("service_calls", SumMetrics::new(id.clone(), 5))
        .unwrap();
    check!(run_rounds_until(&pipeline, || stored_value(&storage, &model, &id) == Some(5)));
    check!(pipeline.registry().get::<u64>("service_calls").is_err());
}

#[test]
fn the_same_model_is_wired_once() {
    let storage = Arc::new(MemoryStorage::new());
    let model = Model::new("service_calls", Downsampling::Day);
    let mut processor = MetricsStreamProcessor::new(config(), storage.clone()).unwrap();
    processor.create::<SumMetrics>(model.clone(), storage.clone(), []).unwrap();

    let duplicate = processor.create::<SumMetrics>(model, storage.clone(), []);
    check!(duplicate.err() == Some(GraphError::DuplicateGraph("service_calls".to_owned())));
    check!(processor.registry().ids().collect::<Vec<_>>() == ["service_calls"]);
}

#[test]
fn invalid_config_is_rejected() {
    let mut config = config();
    config.max_batch_get_size = 0;
    check!(MetricsStreamProcessor::new(config, Arc::new(MemoryStorage::new())).is_err());
}

#[test]
fn failed_flush_is_reported_and_counted() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    let storage = Arc::new(MemoryStorage::new());
    let worker = Arc::new(
        PersistentWorker::<SumMetrics>::builder(Model::new("service_calls", Downsampling::Hour), storage.clone())
            .build(),
    );
    let mut timer = PersistenceTimer::new(storage.clone());
    timer.register(worker.clone());

    storage.fail_writes(true);
    let summary = metrics_024::with_local_recorder(&recorder, || {
        worker.accept(SumMetrics::new(hour_id("X"), 1));
        worker.accept(SumMetrics::new(hour_id("Y"), 1));
        timer.run_round()
    });
    check!(summary.requests == 2);
    check!(!summary.flushed);
    check!(storage.rows() == 0);

    let counter = |name: &str| {
        snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .find(|(key, _, _, _)| key.key().name() == name)
            .map(|(_, _, _, value)| value)
    };
    check!(counter("strata_persistence_round_failures") == Some(DebugValue::Counter(1)));
}

#[test]
fn empty_rounds_flush_nothing() {
    let storage = Arc::new(MemoryStorage::new());
    let timer = PersistenceTimer::new(storage.clone()).prepare_threads(4);
    let summary = timer.run_round();
    check!(summary.requests == 0);
    check!(summary.flushed);
    check!(storage.executed().is_empty());
}

#[derive(Default)]
struct CountingWorker {
    rounds: AtomicUsize,
}

impl PersistenceWorker for CountingWorker {
    fn name(&self) -> &str {
        "counting"
    }

    fn build_batch_requests(&self) -> Vec<PrepareRequest> {
        vec![]
    }

    fn end_of_round(&self) {
        self.rounds.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test(start_paused = true)]
async fn timer_runs_a_round_every_period_until_shut_down() {
    let worker = Arc::new(CountingWorker::default());
    let mut timer = PersistenceTimer::new(Arc::new(MemoryStorage::new()));
    timer.register(worker.clone());
    let handle = Arc::new(timer).start(Duration::from_secs(1));

    tokio::time::sleep(Duration::from_millis(3500)).await;
    check!(worker.rounds.load(Ordering::SeqCst) == 3);

    handle.shut_down().await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    check!(worker.rounds.load(Ordering::SeqCst) == 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shut_down_persists_what_is_left() {
    let storage = Arc::new(MemoryStorage::new());
    let model = Model::new("service_calls", Downsampling::Hour);
    let mut processor = MetricsStreamProcessor::new(config(), storage.clone()).unwrap();
    let graph = processor.create::<SumMetrics>(model.clone(), storage.clone(), []).unwrap();
    let mut pipeline = processor.start().unwrap();
    pipeline.start_timer();

    for value in [4, 5] {
        graph.start(SumMetrics::new(hour_id("X"), value));
    }
    pipeline.shut_down().await;
    check!(stored_value(&storage, &model, &hour_id("X")) == Some(9));
}
