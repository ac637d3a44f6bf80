use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use rand::{Rng, SeedableRng};
use rollup::index::IncrementalIndex;
use rollup::index::schema::{AggregationMode, IncrementalIndexSchema, IndexConfig};
use rollup::row::InputRow;

const ROWS: usize = 4096;

fn schema() -> IncrementalIndexSchema {
    serde_json::from_str(
        r#"{
            "granularity": "minute",
            "metrics": [
                {"type": "count", "name": "count"},
                {"type": "longSum", "name": "sum", "fieldName": "v"},
                {"type": "doubleMax", "name": "max", "fieldName": "d"},
                {"type": "longLast", "name": "last", "fieldName": "v"}
            ]
        }"#,
    )
    .unwrap()
}

fn rows(groups: usize) -> Vec<InputRow> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    (0..ROWS)
        .map(|i| {
            InputRow::new(i as i64 * 100)
                .with_dimension("key", format!("k{}", rng.gen_range(0..groups)))
                .with_column("v", rng.r#gen::<i32>() as i64)
                .with_column("d", rng.r#gen::<f64>())
        })
        .collect()
}

fn bench_add(c: &mut Criterion) {
    for groups in [16, 1024] {
        let rows = rows(groups);
        for mode in [AggregationMode::Object, AggregationMode::Buffer] {
            c.bench_function(&format!("add_{mode:?}_{groups}_groups"), |b| {
                b.iter_batched(
                    || {
                        let config = IndexConfig::default().with_mode(mode);
                        (IncrementalIndex::try_new(schema(), config).unwrap(), rows.clone())
                    },
                    |(mut index, rows)| {
                        for row in rows {
                            black_box(index.add(row).unwrap());
                        }
                        index
                    },
                    BatchSize::SmallInput,
                )
            });
        }
    }
}

criterion_group!(benches, bench_add);
criterion_main!(benches);
