//! Ingest synthetic page views, persist the full indexes as json lines and merge the
//! chunks. Run with `RUST_LOG=info` to see the swaps of the indexes

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rollup::common::uuid::ChunkId;
use rollup::granularity::Granularity;
use rollup::index::schema::{IncrementalIndexSchema, IndexConfig};
use rollup::merge::RowMerger;
use rollup::persist::{Appender, JsonLinesPersistTarget, Persister, PersisterConfig};
use rollup::row::{InputRow, RowsTable};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const ROWS: usize = 100_000;
const PAGES: [&str; 5] = ["home", "search", "cart", "checkout", "help"];
const COUNTRIES: [&str; 3] = ["nz", "fr", "br"];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let schema = serde_json::from_str::<IncrementalIndexSchema>(
        r#"{
            "metrics": [
                {"type": "count", "name": "views"},
                {"type": "longSum", "name": "bytes", "fieldName": "bytes"},
                {"type": "doubleMax", "name": "slowest", "fieldName": "latency"},
                {"type": "hyperUnique", "name": "visitors", "fieldName": "user", "round": true},
                {"type": "filtered", "aggregator": {"type": "count", "name": "errors"},
                 "filter": {"type": "expression", "expression": "status >= 500"}}
            ]
        }"#,
    )?
    .with_granularity(Granularity::Hour);
    let config = IndexConfig::default().with_max_rows(16);

    let dir = std::env::temp_dir().join(format!("rollup-ingest-{}", ChunkId::random()));
    let target = Arc::new(JsonLinesPersistTarget::try_new(&dir)?);
    let persister = Arc::new(Persister::try_new(
        PersisterConfig::default(),
        Arc::clone(&target) as _,
    )?);
    let mut appender = Appender::try_new(schema, config, Arc::clone(&persister))?;

    let mut rng = StdRng::seed_from_u64(7);
    let now = std::time::Instant::now();
    for i in 0..ROWS {
        let row = InputRow::new((i as i64) * 360)
            .with_dimension("page", PAGES[rng.gen_range(0..PAGES.len())])
            .with_dimension("country", COUNTRIES[rng.gen_range(0..COUNTRIES.len())])
            .with_column("bytes", rng.gen_range(100..10_000_i64))
            .with_column("latency", rng.gen_range(0.0..2.0_f64))
            .with_column("user", format!("user-{}", rng.gen_range(0..1000)))
            .with_column("status", [200_i64, 200, 200, 404, 503][rng.gen_range(0..5)]);
        appender.add(row)?;
    }
    let chunk_ids = appender.finish(Duration::from_secs(60))?;
    println!(
        "Ingested {} rows into {} chunks in {:?}",
        ROWS,
        chunk_ids.len(),
        now.elapsed()
    );
    println!("{}", persister.metrics().metrics_set());

    let chunks = target.read_chunks()?;
    let merger = RowMerger::try_new(&chunks)?;
    let rows = merger.merge(&chunks, true)?;
    println!("{}", RowsTable(&rows[..rows.len().min(10)]));

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}
