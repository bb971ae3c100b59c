//! Recall and latency benchmark over synthetic vectors.
//!
//! Builds a graph in parallel, tombstones a fraction of it, measures
//! recall@k against brute force, compresses, and measures again. Prints
//! one JSON report on stdout.
//!
//! ```text
//! RUST_LOG=info recall_bench --count 20000 --dims 32 --delete-fraction 0.1
//! ```

use std::collections::HashSet;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use e2e_tests::{brute_force, insert_parallel, random_vectors, recall, TestHarness};
use vector_hnsw::{Graph, HnswConfig};
use vector_pq::PqConfig;
use vector_types::{Settings, VectorId};

#[derive(Parser, Debug)]
#[command(name = "recall_bench", about = "HNSW recall and latency benchmark")]
struct Args {
    /// Path to config file (index and pq sections supply defaults)
    #[arg(short, long)]
    config: Option<String>,

    #[arg(long, default_value_t = 10_000)]
    count: usize,

    #[arg(long, default_value_t = 32)]
    dims: usize,

    #[arg(long, default_value_t = 200)]
    queries: usize,

    #[arg(short, default_value_t = 10)]
    k: usize,

    #[arg(long)]
    ef: Option<usize>,

    #[arg(long)]
    max_connections: Option<usize>,

    #[arg(long)]
    ef_construction: Option<usize>,

    /// PQ segments, must divide dims
    #[arg(long)]
    segments: Option<usize>,

    #[arg(long)]
    centroids: Option<usize>,

    /// Share of inserted vectors tombstoned before measuring
    #[arg(long, default_value_t = 0.0)]
    delete_fraction: f64,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Skip the compressed pass
    #[arg(long)]
    no_compress: bool,
}

#[derive(Debug, Serialize)]
struct Pass {
    recall: f64,
    mean_latency_us: f64,
    p99_latency_us: f64,
}

#[derive(Debug, Serialize)]
struct Report {
    count: usize,
    dims: usize,
    queries: usize,
    k: usize,
    ef: usize,
    max_connections: usize,
    ef_construction: usize,
    deleted: usize,
    build_ms: u128,
    raw: Pass,
    compress_ms: Option<u128>,
    compressed: Option<Pass>,
}

fn measure(
    graph: &Graph,
    queries: &[Vec<f32>],
    truth: &[Vec<VectorId>],
    k: usize,
    ef: usize,
) -> Result<Pass> {
    let mut latencies = Vec::with_capacity(queries.len());
    let mut total_recall = 0.0;
    for (query, expected) in queries.iter().zip(truth) {
        let start = Instant::now();
        let found = graph.search_with_ef(query, k, ef, None)?;
        latencies.push(start.elapsed());
        total_recall += recall(&found, expected);
    }
    latencies.sort();
    let micros = |d: &Duration| d.as_secs_f64() * 1e6;
    let mean = latencies.iter().map(micros).sum::<f64>() / latencies.len().max(1) as f64;
    let p99 = latencies
        .get((latencies.len() * 99 / 100).min(latencies.len().saturating_sub(1)))
        .map(micros)
        .unwrap_or_default();
    Ok(Pass {
        recall: total_recall / queries.len().max(1) as f64,
        mean_latency_us: mean,
        p99_latency_us: p99,
    })
}

fn main() -> Result<()> {
    let args = Args::parse();
    let settings = Settings::load(args.config.as_deref()).context("Failed to load configuration")?;

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&settings.log_level)),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let mut config = HnswConfig::from_settings(args.dims, &settings.index).with_seed(args.seed);
    if let Some(m) = args.max_connections {
        config = config.with_max_connections(m);
    }
    if let Some(ef_construction) = args.ef_construction {
        config = config.with_ef_construction(ef_construction);
    }
    let ef = args.ef.unwrap_or(config.ef).max(args.k);

    let mut pq = PqConfig::from_settings(&settings.pq).with_seed(args.seed);
    if let Some(segments) = args.segments {
        pq.segments = segments;
    }
    if let Some(centroids) = args.centroids {
        pq.centroids = centroids;
    }

    info!(count = args.count, dims = args.dims, threads = args.threads, "Generating vectors");
    let vectors = random_vectors(args.count, args.dims, args.seed);
    let queries = random_vectors(args.queries, args.dims, args.seed.wrapping_add(1));
    let harness = TestHarness::with_vectors(&vectors);
    let graph = harness.graph("bench", config.clone());

    let start = Instant::now();
    insert_parallel(&graph, &vectors, args.threads).context("Build failed")?;
    let build_ms = start.elapsed().as_millis();
    info!(build_ms, "Graph built");

    let mut ids: Vec<VectorId> = (0..args.count as VectorId).collect();
    ids.shuffle(&mut StdRng::seed_from_u64(args.seed));
    let deleted_count = ((args.count as f64) * args.delete_fraction.clamp(0.0, 1.0)) as usize;
    ids.truncate(deleted_count);
    graph.delete(&ids)?;
    let deleted: HashSet<VectorId> = ids.into_iter().collect();

    let distance = config.distance.provider();
    let truth: Vec<Vec<VectorId>> = queries
        .iter()
        .map(|q| brute_force(distance.as_ref(), &vectors, q, args.k, &deleted))
        .collect();

    let raw = measure(&graph, &queries, &truth, args.k, ef)?;
    info!(recall = raw.recall, "Raw pass done");

    let (compress_ms, compressed) = if args.no_compress {
        (None, None)
    } else {
        let start = Instant::now();
        graph.compress(&pq, &CancellationToken::new()).context("Compression failed")?;
        let compress_ms = start.elapsed().as_millis();
        let pass = measure(&graph, &queries, &truth, args.k, ef)?;
        info!(compress_ms, recall = pass.recall, "Compressed pass done");
        (Some(compress_ms), Some(pass))
    };

    let report = Report {
        count: args.count,
        dims: args.dims,
        queries: args.queries,
        k: args.k,
        ef,
        max_connections: config.max_connections,
        ef_construction: config.ef_construction,
        deleted: deleted.len(),
        build_ms,
        raw,
        compress_ms,
        compressed,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
