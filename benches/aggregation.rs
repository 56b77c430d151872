use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use nitrogen_scenarios::aggregator::{aggregate, stage_summary};
use nitrogen_scenarios::{Dimension, NormalizedRecord, ScenarioYear, Stage};

const COMMODITIES: &[&str] = &["corn", "soybeans", "wheat", "beef", "milk", "eggs", "poultry"];

fn synthetic_records(count: usize) -> Vec<NormalizedRecord> {
    (0..count)
        .map(|i| {
            let county = format!("{:05}", 24001 + (i % 200));
            let stage = Stage::ALL[i % Stage::ALL.len()];
            let record = NormalizedRecord::new(ScenarioYear::Y2030, county.clone(), stage, (i % 997) as f64 * 1.25)
                .with_commodity(COMMODITIES[i % COMMODITIES.len()]);
            if i % 10 == 0 {
                let dest = format!("{:05}", 24001 + ((i / 10) % 200));
                record.with_flow(county, dest)
            } else {
                record
            }
        })
        .collect()
}

fn bench_groupings(c: &mut Criterion) {
    let records = synthetic_records(100_000);
    let groupings: [(&str, Vec<Dimension>); 4] = [
        ("stage", vec![Dimension::Stage]),
        ("county", vec![Dimension::County]),
        ("county_stage", vec![Dimension::County, Dimension::Stage]),
        ("origin_destination", vec![Dimension::Origin, Dimension::Destination]),
    ];

    let mut group = c.benchmark_group("aggregate");
    for (name, grouping) in &groupings {
        group.bench_with_input(BenchmarkId::from_parameter(name), grouping, |b, grouping| {
            b.iter(|| aggregate(ScenarioYear::Y2030, black_box(&records), grouping))
        });
    }
    group.finish();

    c.bench_function("stage_summary", |b| {
        b.iter(|| stage_summary(ScenarioYear::Y2030, black_box(&records)))
    });
}

criterion_group!(benches, bench_groupings);
criterion_main!(benches);
