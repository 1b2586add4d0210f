// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use strata::{
    Downsampling, EntityId, MetricId, Metrics, MetricsStreamProcessor, Model, PipelineConfig,
    TimeBucket,
    aggregation::{EventKind, MetricsConsumer},
    functions::{CpmMetrics, SumMetrics},
    test_util::MemoryStorage,
};

// logs every persisted total
struct PrintTotals;

impl MetricsConsumer<SumMetrics> for PrintTotals {
    fn accept(&self, metrics: &SumMetrics, kind: EventKind) {
        println!("{kind} {} = {}", metrics.id(), metrics.value());
    }

    fn interested_in(&self, kind: EventKind) -> bool {
        kind == EventKind::Total
    }
}

#[tokio::main]
async fn main() {
    // RUST_LOG=strata=debug shows every round
    tracing_subscriber::fmt::init();

    let config = PipelineConfig::from_toml_str(
        r#"
        persistent_period_ms = 1000
        downsampling_persistent_mod = 2
        l1_flush_period_ms = 100
        "#,
    )
    .expect("valid config");
    let storage = Arc::new(MemoryStorage::new());
    let mut processor = MetricsStreamProcessor::new(config, storage.clone()).expect("valid config");
    let calls = processor
        .create::<SumMetrics>(
            Model::new("service_calls", Downsampling::Minute),
            storage.clone(),
            [Arc::new(PrintTotals) as Arc<dyn MetricsConsumer<SumMetrics>>],
        )
        .expect("fresh model");
    let cpm = processor
        .create::<CpmMetrics>(
            Model::new("service_cpm", Downsampling::Minute),
            storage.clone(),
            [],
        )
        .expect("fresh model");

    let mut pipeline = processor.start().expect("consumer threads");
    pipeline.start_timer();

    for request in 0..5_000 {
        let bucket = TimeBucket::from_system_time(SystemTime::now(), Downsampling::Minute).expect("recent time");
        let id = MetricId::new(EntityId::single(["checkout", "search", "login"][request % 3]), bucket);
        calls.start(SumMetrics::new(id.clone(), 1));
        cpm.start(CpmMetrics::new(id, 1));
        if request % 1000 == 0 {
            tokio::time::sleep(Duration::from_millis(700)).await;
        }
    }

    pipeline.shut_down().await;
    println!("{} rows stored", storage.rows());

    // EXAMPLE OUTPUT:
    /*
    total 202610171203_search = 334
    total 202610171203_login = 333
    ...
    total 202610_checkout = 1667
    24 rows stored
    */
}
