//! Criterion benchmarks for the metrics builder.
//!
//! One cycle = record every (cpu, state) point for both metrics, then emit.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use hostmetrics_engine::{
    AttributeState, AttributeVocabulary, BuildInfo, BuilderOption, MetricsBuilder,
    MetricsBuilderConfig, Resource, ResourceMetricsOption, Timestamp,
};

fn cpu_names(cpus: usize) -> Vec<String> {
    (0..cpus).map(|i| format!("cpu{i}")).collect()
}

fn bench_record_emit_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_emit_cycle");
    let resource = Resource::builder().with_host_name("bench-host").build();

    for cpus in [1usize, 8, 64] {
        let names = cpu_names(cpus);
        let mut mb = MetricsBuilder::new(
            &MetricsBuilderConfig::all_enabled(),
            BuildInfo::current(),
            &[BuilderOption::StartTime(Timestamp::from_secs(1_700_000_000))],
        );

        group.bench_with_input(BenchmarkId::from_parameter(cpus), &names, |bench, names| {
            bench.iter(|| {
                let ts = Timestamp::now();
                for cpu in names {
                    for state in AttributeState::ALL {
                        mb.record_system_cpu_time_data_point(ts, 1.0, cpu, *state);
                        mb.record_system_cpu_utilization_data_point(ts, 0.125, cpu, *state);
                    }
                }
                black_box(mb.emit(&[ResourceMetricsOption::WithResource(resource.clone())]))
            });
        });
    }
    group.finish();
}

fn bench_state_lookup(c: &mut Criterion) {
    c.bench_function("state_lookup", |bench| {
        bench.iter(|| {
            for value in ["idle", "softirq", "wait", "unknown"] {
                black_box(AttributeState::lookup(black_box(value)));
            }
        });
    });
}

criterion_group!(benches, bench_record_emit_cycle, bench_state_lookup);
criterion_main!(benches);
