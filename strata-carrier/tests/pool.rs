use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};
use std::thread;
use std::time::Duration;

use assert2::check;
use metrics_util_020::debugging::{DebugValue, DebuggingRecorder};
use rstest::rstest;
use strata_carrier::{
    CarrierBuilder, ConsumeError, Consumer, ConsumerPoolBuilder, KeyPartitioner, OverflowPolicy,
    ProduceError,
};

#[derive(Default)]
struct Recording {
    seen: Mutex<Vec<(String, u32)>>,
    errors: AtomicUsize,
    idle: AtomicUsize,
    exits: AtomicUsize,
}

struct Recorder(Arc<Recording>);

impl Consumer<u32> for Recorder {
    fn consume(&self, batch: &mut Vec<u32>) -> Result<(), ConsumeError> {
        if batch.contains(&13) {
            return Err(ConsumeError::failed("unlucky batch"));
        }
        let thread = thread::current().name().unwrap_or_default().to_owned();
        self.0
            .seen
            .lock()
            .unwrap()
            .extend(batch.drain(..).map(|item| (thread.clone(), item)));
        Ok(())
    }

    fn on_error(&self, batch: &[u32], _error: &ConsumeError) {
        self.0.errors.fetch_add(batch.len(), Ordering::Relaxed);
    }

    fn nothing_to_consume(&self) {
        self.0.idle.fetch_add(1, Ordering::Relaxed);
    }

    fn on_exit(&self) {
        self.0.exits.fetch_add(1, Ordering::Relaxed);
    }
}

#[rstest]
#[case::one_thread(1, 1)]
#[case::channel_per_thread(4, 4)]
#[case::more_channels_than_threads(2, 5)]
fn pool_consumes_everything(#[case] threads: usize, #[case] channels: usize) {
    let recording = Arc::new(Recording::default());
    let carrier = CarrierBuilder::new()
        .name("numbers")
        .channels(channels)
        .channel_size(64)
        .build();
    let mut pool = ConsumerPoolBuilder::new()
        .name("test-pool")
        .threads(threads)
        .batch_size(8)
        .build();
    pool.attach(&carrier, Recorder(recording.clone()));
    let handle = pool.start().unwrap();

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let carrier = carrier.clone();
            thread::spawn(move || {
                for i in 0..250 {
                    carrier.produce(p * 1000 + i + 100).unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }
    check!(carrier.wait_idle(Duration::from_secs(10)));
    handle.shut_down();

    let mut seen: Vec<u32> = recording.seen.lock().unwrap().iter().map(|(_, i)| *i).collect();
    seen.sort();
    let mut expected: Vec<u32> = (0..4).flat_map(|p| (0..250).map(move |i| p * 1000 + i + 100)).collect();
    expected.sort();
    check!(seen == expected);
    check!(carrier.stats().consumed == 1000);
    check!(recording.exits.load(Ordering::Relaxed) == 1);
}

#[test]
fn failing_batches_do_not_stop_the_pool() {
    let recording = Arc::new(Recording::default());
    let carrier = CarrierBuilder::new().name("flaky").build();
    let mut pool = ConsumerPoolBuilder::new().threads(1).batch_size(1).build();
    pool.attach(&carrier, Recorder(recording.clone()));
    let handle = pool.start().unwrap();

    for i in [1, 13, 2] {
        carrier.produce(i).unwrap();
    }
    check!(carrier.wait_idle(Duration::from_secs(5)));
    drop(handle);

    let seen: Vec<u32> = recording.seen.lock().unwrap().iter().map(|(_, i)| *i).collect();
    check!(seen == [1, 2]);
    check!(recording.errors.load(Ordering::Relaxed) == 1);
    check!(carrier.stats().consumed == 3);
}

#[test]
fn idle_threads_report_nothing_to_consume() {
    let recording = Arc::new(Recording::default());
    let carrier = CarrierBuilder::<u32>::new().name("quiet").build();
    let mut pool = ConsumerPoolBuilder::new()
        .threads(1)
        .consume_cycle(Duration::from_millis(1))
        .build();
    pool.attach(&carrier, Recorder(recording.clone()));
    let handle = pool.start().unwrap();
    thread::sleep(Duration::from_millis(50));
    drop(handle);
    check!(recording.idle.load(Ordering::Relaxed) > 0);
}

#[test]
fn key_partitioning_pins_keys_to_threads() {
    let recording = Arc::new(Recording::default());
    let carrier = CarrierBuilder::new()
        .name("keyed")
        .channels(4)
        .partitioner(KeyPartitioner::new(|item: &u32| item % 10))
        .build();
    let mut pool = ConsumerPoolBuilder::new().threads(4).batch_size(4).build();
    pool.attach(&carrier, Recorder(recording.clone()));
    let handle = pool.start().unwrap();
    for i in 100..400 {
        carrier.produce(i).unwrap();
    }
    check!(carrier.wait_idle(Duration::from_secs(5)));
    drop(handle);

    let seen = recording.seen.lock().unwrap();
    for key in 0..10 {
        let threads: std::collections::HashSet<_> = seen
            .iter()
            .filter(|(_, item)| item % 10 == key)
            .map(|(thread, _)| thread.clone())
            .collect();
        check!(threads.len() == 1);
    }
}

#[test]
fn run_on_caller_processes_overflow_synchronously() {
    let recording = Arc::new(Recording::default());
    let carrier = CarrierBuilder::new()
        .name("inline")
        .channel_size(1)
        .overflow(OverflowPolicy::RunOnCaller)
        .build();
    let mut pool = ConsumerPoolBuilder::new().threads(1).build();
    pool.attach(&carrier, Recorder(recording.clone()));
    let handle = pool.start().unwrap();
    for i in 100..200 {
        carrier.produce(i).unwrap();
    }
    check!(carrier.wait_idle(Duration::from_secs(5)));
    drop(handle);
    check!(recording.seen.lock().unwrap().len() == 100);
    check!(carrier.stats().produced == 100);
}

#[test]
fn dropped_items_are_counted() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    let carrier = CarrierBuilder::new()
        .name("lossy")
        .channel_size(2)
        .overflow(OverflowPolicy::DropOldest)
        .build();
    metrics_024::with_local_recorder(&recorder, || {
        for i in 0..5u32 {
            carrier.produce(i).unwrap();
        }
    });
    check!(carrier.stats().dropped == 3);
    let dropped = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .find(|(key, _, _, _)| key.key().name() == "strata_carrier_dropped")
        .map(|(_, _, _, value)| value);
    check!(dropped == Some(DebugValue::Counter(3)));
}

#[test]
fn items_accepted_during_shutdown_are_consumed() {
    for _ in 0..20 {
        let recording = Arc::new(Recording::default());
        let carrier = CarrierBuilder::new()
            .name("closing")
            .channels(2)
            .channel_size(1024)
            .overflow(OverflowPolicy::Block {
                timeout: Duration::from_secs(10),
            })
            .build();
        let mut pool = ConsumerPoolBuilder::new().threads(2).build();
        pool.attach(&carrier, Recorder(recording.clone()));
        let handle = pool.start().unwrap();

        let accepted = Arc::new(AtomicUsize::new(0));
        let producers: Vec<_> = (0..4)
            .map(|_| {
                let (carrier, accepted) = (carrier.clone(), accepted.clone());
                thread::spawn(move || {
                    while carrier.produce(100).is_ok() {
                        accepted.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        thread::sleep(Duration::from_millis(2));
        drop(handle);
        for producer in producers {
            producer.join().unwrap();
        }

        let accepted = accepted.load(Ordering::Relaxed);
        check!(recording.seen.lock().unwrap().len() == accepted);
        check!(carrier.stats().produced == accepted as u64);
        check!(carrier.wait_idle(Duration::from_millis(100)));
        check!(matches!(carrier.produce(100), Err(ProduceError::Closed(100))));
    }
}
