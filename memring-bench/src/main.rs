//! # memring Bench
//!
//! Purpose: Drive a mixed get/set load through the client against a live
//! cluster and print throughput plus the client's metrics snapshot.
//!
//! Usage: `memring-bench [bench.json]`. The JSON document holds the client
//! config under `client` and the load shape beside it; every field has a
//! default. `RUST_LOG` controls log output.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use memring_client::{CacheClient, ClientConfig, ClientMetrics, Expiration};
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
#[serde(default)]
struct BenchConfig {
    client: ClientConfig,
    threads: usize,
    operations: usize,
    key_space: usize,
    value_size: usize,
    /// Share of operations that are reads, 0.0..=1.0.
    read_ratio: f64,
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            client: ClientConfig::new(["127.0.0.1:11211"]),
            threads: 8,
            operations: 100_000,
            key_space: 10_000,
            value_size: 128,
            read_ratio: 0.9,
        }
    }
}

fn load_config() -> Result<BenchConfig> {
    match std::env::args().nth(1) {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {path}"))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))
        }
        None => Ok(BenchConfig::default()),
    }
}

fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let bench = load_config()?;
    bench.client.validate().context("invalid client config")?;
    info!(
        servers = ?bench.client.servers,
        threads = bench.threads,
        operations = bench.operations,
        "starting bench"
    );

    let metrics = Arc::new(ClientMetrics::new());
    let client = CacheClient::builder(bench.client.clone())
        .observer(metrics.clone())
        .build()?;

    let value = "x".repeat(bench.value_size);
    let threads = bench.threads.max(1);
    let per_thread = bench.operations / threads;
    let key_space = bench.key_space.max(1);
    let reads_per_ten = (bench.read_ratio.clamp(0.0, 1.0) * 10.0).round() as usize;

    let started = Instant::now();
    thread::scope(|scope| {
        for worker in 0..threads {
            let client = &client;
            let value = value.as_str();
            scope.spawn(move || {
                for i in 0..per_thread {
                    let slot = (worker * per_thread + i).wrapping_mul(7919) % key_space;
                    let key = format!("bench:{slot}");
                    if i % 10 < reads_per_ten {
                        client.get_item(&key);
                    } else {
                        client.set(&key, value, Expiration::In(Duration::from_secs(300)));
                    }
                }
            });
        }
    });
    let elapsed = started.elapsed();

    let snapshot = metrics.snapshot();
    let done = per_thread * threads;
    let throughput = done as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    if snapshot.errors_total > 0 {
        warn!(errors = snapshot.errors_total, "operations failed");
    }
    info!(
        operations = done,
        elapsed_ms = elapsed.as_millis() as u64,
        ops_per_sec = throughput as u64,
        p50_us = ?snapshot.latency.quantile_bound_us(0.5),
        p99_us = ?snapshot.latency.quantile_bound_us(0.99),
        "bench finished"
    );
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    client.shutdown();
    Ok(())
}
