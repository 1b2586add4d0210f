use assert2::check;
use rstest::rstest;
use strata_core::functions::{
    CpmMetrics, LatestMetrics, LongAvgMetrics, MaxLongMetrics, PercentileMetrics, SumMetrics,
};
use strata_core::{
    Downsample, Downsampling, EntityId, FromStorageFields, MetricId, Metrics, TimeBucket,
    ToStorageFields,
};

fn id(bucket: u64, level: Downsampling) -> MetricId {
    MetricId::new(
        EntityId::new(["checkout", "pod-1"]),
        TimeBucket::new(bucket, level).unwrap(),
    )
}

fn minute() -> MetricId {
    id(202401011230, Downsampling::Minute)
}

#[test]
fn sum_combines_and_rolls_up() {
    let mut total = SumMetrics::new(minute(), 1);
    check!(total.combine(&SumMetrics::new(minute(), 2)));
    check!(total.combine(&SumMetrics::new(minute(), 3)));
    check!(total.value() == 6);

    let hour = total.downsample(Downsampling::Hour).unwrap();
    check!(hour.id() == &id(2024010112, Downsampling::Hour));
    check!(hour.value() == 6);
    check!(hour.downsample(Downsampling::Minute).is_none());
}

#[rstest]
#[case::minute(Downsampling::Minute, 600)]
#[case::hour(Downsampling::Hour, 10)]
#[case::day(Downsampling::Day, 0)]
fn cpm_divides_by_bucket_span(#[case] level: Downsampling, #[case] expected: i64) {
    let mut cpm = CpmMetrics::new(minute(), 600).downsample(level).unwrap();
    cpm.calculate();
    check!(cpm.total() == 600);
    check!(cpm.value() == expected);
}

#[test]
fn average_merges_exactly() {
    let mut avg = LongAvgMetrics::new(minute(), 10);
    avg.combine(&LongAvgMetrics::new(minute(), 20));
    avg.combine(&LongAvgMetrics::with_count(minute(), 90, 3));
    avg.calculate();
    check!(avg.count() == 5);
    check!(avg.value() == 24);
}

#[test]
fn max_keeps_peak() {
    let mut max = MaxLongMetrics::new(minute(), 7);
    max.combine(&MaxLongMetrics::new(minute(), 3));
    max.combine(&MaxLongMetrics::new(minute(), 9));
    check!(max.value() == 9);
}

#[test]
fn latest_abandons_stale_partials() {
    let mut latest = LatestMetrics::new(minute(), 5, 1_000);
    check!(latest.combine(&LatestMetrics::new(minute(), 8, 2_000)));
    check!(!latest.combine(&LatestMetrics::new(minute(), 1, 1_500)));
    check!(latest.value() == 8);
    check!(latest.observed_at() == 2_000);
}

#[test]
fn percentile_ranks_and_precision_guard() {
    let mut left = PercentileMetrics::new(minute(), 10);
    let mut right = PercentileMetrics::new(minute(), 10);
    for latency in 0..50 {
        left.record(latency * 10);
        right.record((latency + 50) * 10);
    }
    check!(left.combine(&right));
    left.calculate();
    check!(left.count() == 100);
    check!(left.percentile(50) == Some(490));
    check!(left.percentile(99) == Some(980));
    check!(left.percentile(42).is_none());

    let coarse = PercentileMetrics::new(minute(), 100);
    check!(!left.combine(&coarse));
    check!(left.count() == 100);
}

#[test]
fn storage_fields_rebuild_records() {
    let mut avg = LongAvgMetrics::with_count(minute(), 100, 4);
    avg.calculate();
    let decoded = LongAvgMetrics::from_storage_fields(minute(), &avg.to_storage_fields()).unwrap();
    check!(decoded == avg);

    let mut percentile = PercentileMetrics::new(minute(), 10);
    for latency in [5, 15, 15, 250] {
        percentile.record(latency);
    }
    percentile.calculate();
    let fields = percentile.to_storage_fields();
    check!(fields.long("p50") == Ok(10));
    let decoded = PercentileMetrics::from_storage_fields(minute(), &fields).unwrap();
    check!(decoded == percentile);

    let missing = SumMetrics::from_storage_fields(minute(), &Default::default());
    check!(missing.is_err());
}
