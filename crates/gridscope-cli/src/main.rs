//! Command-line interface for driving a gridscope node over HTTP, plus an
//! in-process soak harness for the engine.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gridscope_core::{BoundingBox, Cluster, Viewport};
use gridscope_engine::{EngineConfig, EngineStats, IngestOutcome, MapEngine, MapSnapshot};
use gridscope_index_rstar::RstarHubIndex;
use gridscope_source_demo::{DemoConfig, DemoSource};
use humantime::parse_duration;
use rand::{rngs::StdRng, Rng, SeedableRng};
use reqwest::Client;
use serde::{Deserialize, Serialize};

#[derive(Parser)]
#[command(author, version, about = "Gridscope CLI", long_about = None)]
struct Cli {
    /// Base URL of the running gridscope-node (e.g., http://127.0.0.1:8080)
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    api: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a single viewport update
    Viewport {
        #[arg(long)]
        min_lon: f64,
        #[arg(long)]
        min_lat: f64,
        #[arg(long)]
        max_lon: f64,
        #[arg(long)]
        max_lat: f64,
        #[arg(long, default_value = "12")]
        zoom: u8,
    },
    /// Fetch the current map snapshot
    Snapshot {
        /// Print residency counts instead of the full snapshot
        #[arg(long)]
        counts: bool,
    },
    /// List clusters as a table
    Clusters,
    /// Fetch engine statistics
    Stats,
    /// Query node readiness
    Health,
    /// Pan the viewport along a straight path, one update per step
    Pan {
        #[arg(long)]
        from_lon: f64,
        #[arg(long)]
        from_lat: f64,
        #[arg(long)]
        to_lon: f64,
        #[arg(long)]
        to_lat: f64,
        /// Number of viewport updates along the path
        #[arg(long, default_value = "10")]
        steps: usize,
        /// Viewport width/height in degrees
        #[arg(long, default_value = "1.0")]
        span: f64,
        #[arg(long, default_value = "12")]
        zoom: u8,
        /// Delay between steps (e.g., 200ms)
        #[arg(long, default_value = "200ms")]
        interval: String,
    },
    /// Extended testing harnesses
    Test {
        #[command(subcommand)]
        command: TestCommands,
    },
}

#[derive(Subcommand)]
enum TestCommands {
    /// Random-walk the viewport against an in-process engine
    Soak {
        /// Duration (e.g., 30s, 5m)
        #[arg(long, default_value = "30s")]
        duration: String,
        /// Seed for the walk and the demo source
        #[arg(long, default_value = "7")]
        seed: u64,
        /// Viewport width/height in degrees
        #[arg(long, default_value = "1.0")]
        span: f64,
        /// Base zoom level; the walk jitters around it
        #[arg(long, default_value = "12")]
        zoom: u8,
        /// Report output path (JSON)
        #[arg(long, default_value = "soak-report.json")]
        report: PathBuf,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct ViewportReply {
    accepted: bool,
    outcome: Option<IngestOutcome>,
}

#[derive(Debug, Serialize, Deserialize)]
struct HealthReply {
    status: String,
    applied_epoch: u64,
    resident_assets: usize,
    asset_cap: usize,
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct SoakReport {
    duration_secs: u64,
    updates: usize,
    accepted: usize,
    suppressed: usize,
    request_p50_ms: f64,
    request_p95_ms: f64,
    resident_assets: usize,
    resident_edges: usize,
    resident_hubs: usize,
    clusters: usize,
    assets_culled: u64,
    edges_culled: u64,
    periodic_culls: u64,
    errors: Vec<String>,
}

async fn send_viewport(
    client: &Client,
    api: &str,
    bounds: BoundingBox,
    zoom: u8,
) -> Result<ViewportReply> {
    let req = serde_json::json!({
        "min_lon": bounds.min_lon,
        "min_lat": bounds.min_lat,
        "max_lon": bounds.max_lon,
        "max_lat": bounds.max_lat,
        "zoom": zoom,
    });
    let reply: ViewportReply = client
        .post(format!("{api}/viewport"))
        .json(&req)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    Ok(reply)
}

async fn viewport(
    client: &Client,
    api: &str,
    min_lon: f64,
    min_lat: f64,
    max_lon: f64,
    max_lat: f64,
    zoom: u8,
) -> Result<()> {
    let bounds = BoundingBox::new(min_lon, min_lat, max_lon, max_lat)?;
    let reply = send_viewport(client, api, bounds, zoom).await?;
    println!("{}", serde_json::to_string_pretty(&reply)?);
    Ok(())
}

async fn snapshot(client: &Client, api: &str, counts: bool) -> Result<()> {
    let snap: MapSnapshot = client
        .get(format!("{api}/snapshot"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    if counts {
        println!(
            "epoch {}: {} assets, {} edges, {} clusters",
            snap.epoch,
            snap.assets.len(),
            snap.edges.len(),
            snap.clusters.len()
        );
    } else {
        println!("{}", serde_json::to_string_pretty(&snap)?);
    }
    Ok(())
}

async fn clusters(client: &Client, api: &str) -> Result<()> {
    let clusters: Vec<Cluster> = client
        .get(format!("{api}/clusters"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    println!(
        "{:<32} {:<10} {:>8} {:>8} {:>8}",
        "Hub", "Status", "Members", "Health", "Load"
    );
    for c in &clusters {
        let health = c
            .avg_health
            .map(|v| format!("{v:.1}"))
            .unwrap_or_else(|| "-".into());
        let load = c
            .avg_load
            .map(|v| format!("{v:.1}"))
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<32} {:<10} {:>8} {:>8} {:>8}",
            c.hub_id,
            c.worst_status,
            c.member_count(),
            health,
            load
        );
    }
    Ok(())
}

async fn stats(client: &Client, api: &str) -> Result<()> {
    let stats: EngineStats = client
        .get(format!("{api}/stats"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

async fn health(client: &Client, api: &str) -> Result<()> {
    let resp = client.get(format!("{api}/readyz")).send().await?;
    let code = resp.status();
    let body: HealthReply = resp.json().await?;
    println!("{} ({})", body.status, code);
    println!(
        "  applied epoch {}, {} / {} assets resident",
        body.applied_epoch, body.resident_assets, body.asset_cap
    );
    if let Some(message) = body.message {
        println!("  {message}");
    }
    Ok(())
}

/// Interpolated centers from `from` to `to`, endpoints included.
fn pan_centers(from: (f64, f64), to: (f64, f64), steps: usize) -> Vec<(f64, f64)> {
    let denom = steps.saturating_sub(1).max(1) as f64;
    (0..steps)
        .map(|i| {
            let t = i as f64 / denom;
            (
                from.0 + (to.0 - from.0) * t,
                from.1 + (to.1 - from.1) * t,
            )
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
async fn pan(
    client: &Client,
    api: &str,
    from: (f64, f64),
    to: (f64, f64),
    steps: usize,
    span: f64,
    zoom: u8,
    interval: Duration,
) -> Result<()> {
    if steps == 0 {
        anyhow::bail!("--steps must be > 0");
    }
    let half = span / 2.0;
    let mut accepted = 0usize;
    let mut suppressed = 0usize;
    for (i, (lon, lat)) in pan_centers(from, to, steps).into_iter().enumerate() {
        let bounds = BoundingBox::new(lon - half, lat - half, lon + half, lat + half)?;
        let reply = send_viewport(client, api, bounds, zoom).await?;
        match reply.outcome {
            Some(outcome) if reply.accepted => {
                accepted += 1;
                println!(
                    "step {i}: +{} assets, -{} culled, {} clusters",
                    outcome.assets_inserted, outcome.assets_culled, outcome.clusters
                );
            }
            _ => {
                suppressed += 1;
                println!("step {i}: suppressed");
            }
        }
        tokio::time::sleep(interval).await;
    }
    println!("pan complete: {accepted} accepted, {suppressed} suppressed");
    Ok(())
}

fn percentile(values: &[f64], pct: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let idx = ((pct / 100.0) * (sorted.len() as f64 - 1.0)).round() as usize;
    sorted[idx]
}

async fn soak_test(
    duration: Duration,
    seed: u64,
    span: f64,
    zoom: u8,
    report: PathBuf,
) -> Result<()> {
    let source = DemoSource::new(DemoConfig {
        seed,
        ..DemoConfig::default()
    })?;
    let engine = MapEngine::new(source, RstarHubIndex::new(), EngineConfig::default())?;

    let mut rng = StdRng::seed_from_u64(seed);
    let mut center = (0.0f64, 0.0f64);
    let mut zoom_now = zoom;
    let half = span / 2.0;

    let start = tokio::time::Instant::now();
    let end_at = start + duration;
    let mut request_lat = Vec::new();
    let mut updates = 0usize;
    let mut accepted = 0usize;
    let mut suppressed = 0usize;
    let mut errors = Vec::new();

    while tokio::time::Instant::now() < end_at {
        center.0 = (center.0 + rng.gen_range(-0.4..0.4)).clamp(-60.0, 60.0);
        center.1 = (center.1 + rng.gen_range(-0.4..0.4)).clamp(-60.0, 60.0);
        if updates % 7 == 6 {
            let lo = zoom.saturating_sub(2);
            let hi = zoom.saturating_add(2).min(18);
            zoom_now = rng.gen_range(lo..=hi);
        }
        updates += 1;

        let bounds = BoundingBox::new(
            center.0 - half,
            center.1 - half,
            center.0 + half,
            center.1 + half,
        )?;
        match engine.update_viewport(Viewport::new(bounds, zoom_now)) {
            None => suppressed += 1,
            Some(changed) => {
                let t0 = tokio::time::Instant::now();
                match engine.request(&changed).await {
                    Ok(_) => {
                        accepted += 1;
                        request_lat.push(t0.elapsed().as_secs_f64() * 1000.0);
                    }
                    Err(e) => errors.push(format!("request: {e}")),
                }
            }
        }
        let _ = engine.cull_periodic();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let stats = engine.stats();
    let report_data = SoakReport {
        duration_secs: duration.as_secs(),
        updates,
        accepted,
        suppressed,
        request_p50_ms: percentile(&request_lat, 50.0),
        request_p95_ms: percentile(&request_lat, 95.0),
        resident_assets: stats.resident_assets,
        resident_edges: stats.resident_edges,
        resident_hubs: stats.resident_hubs,
        clusters: stats.clusters,
        assets_culled: stats.assets_culled,
        edges_culled: stats.edges_culled,
        periodic_culls: stats.periodic_culls,
        errors,
    };
    fs::write(&report, serde_json::to_vec_pretty(&report_data)?)?;
    println!(
        "Soak complete: {} updates, {} accepted, {} suppressed. Report at {}",
        report_data.updates,
        report_data.accepted,
        report_data.suppressed,
        report.display()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Viewport {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
            zoom,
        } => {
            let client = Client::new();
            viewport(&client, &cli.api, min_lon, min_lat, max_lon, max_lat, zoom).await
        }
        Commands::Snapshot { counts } => {
            let client = Client::new();
            snapshot(&client, &cli.api, counts).await
        }
        Commands::Clusters => {
            let client = Client::new();
            clusters(&client, &cli.api).await
        }
        Commands::Stats => {
            let client = Client::new();
            stats(&client, &cli.api).await
        }
        Commands::Health => {
            let client = Client::new();
            health(&client, &cli.api).await
        }
        Commands::Pan {
            from_lon,
            from_lat,
            to_lon,
            to_lat,
            steps,
            span,
            zoom,
            interval,
        } => {
            let client = Client::new();
            let interval = parse_duration(&interval)?;
            pan(
                &client,
                &cli.api,
                (from_lon, from_lat),
                (to_lon, to_lat),
                steps,
                span,
                zoom,
                interval,
            )
            .await
        }
        Commands::Test { command } => match command {
            TestCommands::Soak {
                duration,
                seed,
                span,
                zoom,
                report,
            } => {
                let dur = parse_duration(&duration)?;
                soak_test(dur, seed, span, zoom, report).await
            }
        },
    }
    .context("command failed")
}
