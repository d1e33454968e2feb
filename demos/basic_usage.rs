// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic resource-sync usage example.
//!
//! Demonstrates:
//! 1. Building a `SyncContext` and a sync engine over an in-memory remote
//! 2. The polling loop picking up a processing resource at fast cadence
//! 3. Authoritative create and delete
//! 4. Offloaded chart transforms with caching
//! 5. Displaying metrics
//! 6. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! RUST_LOG=resource_sync=debug cargo run --example basic_usage
//! ```

use async_trait::async_trait;
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use resource_sync::{
    EngineConfig, Resource, ResourceApi, ResourceDraft, ResourceId, ResourceStatus, ScopeId,
    SyncConfig, SyncContext, SyncError, TransformConfig,
};

/// Remote that marks new resources ready after a few list calls.
#[derive(Default)]
struct InMemoryApi {
    items: Mutex<Vec<(Resource, u32)>>,
    next_id: AtomicU64,
}

#[async_trait]
impl ResourceApi for InMemoryApi {
    async fn list(&self, _scope: &ScopeId) -> Result<Vec<Resource>, SyncError> {
        let mut items = self.items.lock();
        for (resource, polls) in items.iter_mut() {
            *polls += 1;
            if resource.is_processing() && *polls >= 3 {
                resource.status = ResourceStatus::Ready;
            }
        }
        Ok(items.iter().map(|(r, _)| r.clone()).collect())
    }

    async fn create(&self, _scope: &ScopeId, draft: &ResourceDraft) -> Result<Resource, SyncError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut resource = Resource::new(id.to_string(), ResourceStatus::Processing);
        resource.fields = draft.fields.clone();
        self.items.lock().push((resource.clone(), 0));
        Ok(resource)
    }

    async fn update(
        &self,
        _scope: &ScopeId,
        id: &ResourceId,
        patch: &ResourceDraft,
    ) -> Result<Resource, SyncError> {
        let mut items = self.items.lock();
        let (resource, _) = items
            .iter_mut()
            .find(|(r, _)| &r.id == id)
            .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
        resource.fields.extend(patch.fields.clone());
        if let Some(status) = patch.status {
            resource.status = status;
        }
        Ok(resource.clone())
    }

    async fn delete(&self, _scope: &ScopeId, id: &ResourceId) -> Result<(), SyncError> {
        self.items.lock().retain(|(r, _)| &r.id != id);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           resource-sync: Basic Usage Example                  ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure the context and start a sync loop
    // ─────────────────────────────────────────────────────────────────────────
    println!("📦 Configuring resource-sync...");
    let config = EngineConfig {
        // Short intervals so the demo finishes quickly
        sync: SyncConfig {
            base_poll_ms: 2_000,
            fast_poll_ms: 300,
            min_fetch_interval_ms: 100,
            ..Default::default()
        },
        ..Default::default()
    };
    let ctx = SyncContext::new(config);
    let api = Arc::new(InMemoryApi::default());
    let engine = ctx.sync_engine(api.clone(), ScopeId::new("org-demo"));

    let runner = engine.clone();
    let loop_handle = tokio::spawn(async move { runner.run().await });
    println!("   ✅ Sync loop running for scope {}", engine.scope());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Create resources and watch processing finish
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Creating 2 resources...");
    for name in ["sales.csv", "inventory.parquet"] {
        let created = engine
            .create(ResourceDraft::default().with_field("name", json!(name)))
            .await?;
        println!("   └─ Created {} ({}) → {}", created.id, name, created.status);
    }
    println!("   ⏱️  Cadence: {:?} (poll every {:?})", engine.view().cadence, engine.poll_interval());

    let mut views = engine.subscribe();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while engine.items().iter().any(Resource::is_processing) {
        if tokio::time::timeout_at(deadline, views.changed()).await.is_err() {
            println!("   ⚠️  Resources still processing after 5s");
            break;
        }
    }
    for item in engine.items().iter() {
        println!("   └─ {} → {}", item.id, item.status);
    }
    println!("   ⏱️  Cadence: {:?} (poll every {:?})", engine.view().cadence, engine.poll_interval());

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Authoritative delete
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🗑️  Deleting resource 1...");
    engine.delete(&ResourceId::new("1")).await?;
    println!("   └─ Mirror now holds {} item(s)", engine.items().len());

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Offloaded transforms
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Running chart transforms on the offload worker...");
    let rows: Arc<Vec<Value>> = Arc::new(
        (0..50_000)
            .map(|i| json!({"day": i % 365, "region": (["eu", "us", "apac"][i % 3]), "sales": (i * 37) % 1_000}))
            .collect(),
    );
    let transform: TransformConfig = serde_json::from_value(json!({
        "group_by": "region",
        "value_field": "sales",
        "aggregate": "avg",
        "sort_by": "sales",
        "descending": true
    }))?;

    for attempt in 1..=2 {
        let start = std::time::Instant::now();
        let out = ctx.offload().process(rows.clone(), &transform).await;
        println!("   └─ Run {}: {} rows in {:?}", attempt, out.len(), start.elapsed());
    }
    if let Some(stats) = ctx.offload().compute_statistics(&rows, "sales").await {
        println!(
            "   └─ sales: count={} mean={:.1} std_dev={:.1}",
            stats.count,
            stats.mean.unwrap_or_default(),
            stats.std_dev.unwrap_or_default()
        );
    }
    let offload = ctx.offload().stats();
    println!(
        "   ⚡ offloaded={} cache_hits={} inline={} timeouts={}",
        offload.offloaded, offload.cache_hits, offload.inline, offload.timeouts
    );

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Dump metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📊 Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    engine.shutdown();
    loop_handle.await?;
    ctx.shutdown();
    println!("   ✅ Shutdown complete!");

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Dump all captured metrics grouped by kind
fn dump_metrics(snapshotter: &Snapshotter) {
    let mut counters = Vec::new();
    let mut gauges = Vec::new();
    let mut histograms = Vec::new();

    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
        let name = format!("{}{}", key.name(), label_str);

        match value {
            DebugValue::Counter(v) => counters.push((name, v)),
            DebugValue::Gauge(v) => gauges.push((name, v.into_inner())),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                histograms.push((name, count, sum));
            }
        }
    }

    counters.sort();
    gauges.sort_by(|a, b| a.0.cmp(&b.0));
    histograms.sort_by(|a, b| a.0.cmp(&b.0));

    if !counters.is_empty() {
        println!("   ┌─ Counters");
        for (name, value) in &counters {
            println!("   │  └─ {} = {}", name, value);
        }
    }
    if !gauges.is_empty() {
        println!("   ├─ Gauges");
        for (name, value) in &gauges {
            println!("   │  └─ {} = {:.2}", name, value);
        }
    }
    if !histograms.is_empty() {
        println!("   └─ Histograms");
        for (name, count, sum) in &histograms {
            let avg = if *count > 0 { sum / *count as f64 } else { 0.0 };
            println!("      └─ {} count={} avg={:.4}", name, count, avg);
        }
    }
    if counters.is_empty() && gauges.is_empty() && histograms.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
}
