// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic cache-engine usage example.
//!
//! Demonstrates:
//! 1. Connecting to Redis (or falling back to the in-memory backend)
//! 2. Writing tagged player data
//! 3. Breaker-protected recomputation
//! 4. Invalidating a player
//! 5. A cleanup pass
//! 6. Displaying metrics (OTEL-compatible)
//!
//! # Run
//!
//! ```bash
//! REDIS_URL=redis://localhost:6379 cargo run --example basic_usage
//! ```

use std::sync::Arc;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;
use tokio::sync::watch;

use cache_engine::{keys, CacheEngineConfig, CacheTtl, InMemoryBackend, SetOptions, TaggedCache};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install metrics recorder (captures all metrics for OTEL export)
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           cache-engine: Basic Usage Example                   ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Connect
    // ─────────────────────────────────────────────────────────────────────────
    let config = CacheEngineConfig {
        redis_url: std::env::var("REDIS_URL").ok(),
        ..Default::default()
    };
    let cache = match TaggedCache::connect(config.clone()).await {
        Ok(cache) if cache.is_enabled() => cache,
        _ => {
            println!("   No Redis available, using the in-memory backend");
            TaggedCache::new(Arc::new(InMemoryBackend::new()), config)
        }
    };
    println!("📦 Backend: {:?}", cache.backend().map(|b| b.name()));

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Tagged writes
    // ─────────────────────────────────────────────────────────────────────────
    let k = cache.keys().clone();
    let player = 42;
    cache
        .set(&k.player_power(player), &json!({"atk": 100, "def": 40}), SetOptions::new(CacheTtl::Medium).tags(keys::player_tags(player)))
        .await?;
    cache
        .set(&k.collection_stats(player), &json!({"cards": 312}), SetOptions::new(CacheTtl::Long).tag(keys::collection_tag(player)))
        .await?;
    let session = uuid::Uuid::new_v4().to_string();
    cache
        .set_default(&k.session(&session), &json!({"player": player}), [keys::social_tag(player)])
        .await?;
    println!("📝 Wrote power, collection and session {session}");

    let power = cache.get(&k.player_power(player), json!(null)).await;
    println!("🔍 Power: {power}");

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Breaker-protected compute
    // ─────────────────────────────────────────────────────────────────────────
    let board: Result<Vec<u64>, cache_engine::ComputeError<String>> = cache
        .get_or_compute(&k.leaderboard("power", 1), SetOptions::new(CacheTtl::Short).tag(keys::GLOBAL_TAG), || async {
            Ok(vec![42, 7, 99])
        })
        .await;
    println!("🏆 Leaderboard page 1: {board:?}");

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Invalidate
    // ─────────────────────────────────────────────────────────────────────────
    let removed = cache.invalidate_player(player).await;
    println!("🧹 invalidate_player({player}) removed {removed} keys");

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Cleanup
    // ─────────────────────────────────────────────────────────────────────────
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let report = cache.run_cleanup(cancel_rx).await;
    println!("🧽 Cleanup: {}", serde_json::to_string_pretty(&report)?);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n💓 Health: {}", serde_json::to_string(&cache.health().await)?);
    println!("📊 Report: {}", serde_json::to_string(&cache.metrics_report().await)?);
    println!("\n📈 Raw Metrics (OTEL export format):");
    dump_metrics(&snapshotter);

    Ok(())
}

/// Dump all captured metrics in OTEL-compatible format
fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines = Vec::new();
    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
        let rendered = match value {
            DebugValue::Counter(v) => format!("{v}"),
            DebugValue::Gauge(v) => format!("{:.2}", v.into_inner()),
            DebugValue::Histogram(samples) => format!("{} samples", samples.len()),
        };
        lines.push(format!("{}{} = {}", key.name(), label_str, rendered));
    }
    lines.sort();

    if lines.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
    for line in lines {
        println!("   └─ {line}");
    }
}
