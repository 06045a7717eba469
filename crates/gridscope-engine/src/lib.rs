//! Viewport-driven spatial cache and clustering engine for Gridscope.
//!
//! The engine decides what slice of a large asset graph stays resident as the
//! viewport pans and zooms: it fetches the load region through a
//! [`RegionSource`], caps residency per zoom tier, culls what drifts outside
//! the cull region, and keeps a nearest-hub clustering of everything that
//! remains. Batches are tagged with request epochs so out-of-order arrival
//! can never overwrite newer data with older data.

use core::{future::Future, pin::Pin};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use gridscope_core::{Asset, AssetId, AssetKind, BoundingBox, Edge, EdgeKey, GeoPoint, Level, Viewport};
use gridscope_core::{Cluster, GeoError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod cluster;
mod store;
mod viewport;

pub use store::{BoundedStore, InsertOutcome};
pub use viewport::{ThrottleConfig, ViewportChanged, ViewportTracker};

pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the cache engine layer.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("source error: {0}")]
    Source(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<GeoError> for EngineError {
    fn from(err: GeoError) -> Self {
        EngineError::InvalidInput(err.to_string())
    }
}

/// Asset payload as delivered by the region data service. Loosely typed on
/// purpose: the ingest path filters out what does not validate instead of
/// failing the batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub id: String,
    pub kind: String,
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub health: Option<f32>,
    #[serde(default)]
    pub load: Option<f32>,
}

/// Edge payload as delivered by the region data service. Endpoint
/// coordinates are denormalized from the resident assets at insertion, so
/// the wire shape only carries ids.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub from_id: String,
    pub to_id: String,
}

/// One region fetch result.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RegionBatch {
    pub assets: Vec<AssetRecord>,
    pub edges: Vec<EdgeRecord>,
}

/// Asynchronous source of region data, the engine's only external
/// collaborator. Fetches may fail or never resolve; the engine holds no
/// per-request state, so an abandoned epoch leaks nothing.
pub trait RegionSource {
    #[allow(clippy::type_complexity)]
    fn fetch_region<'a>(
        &'a self,
        region: &'a BoundingBox,
        zoom: u8,
    ) -> Pin<Box<dyn Future<Output = Result<RegionBatch>> + Send + 'a>>;
}

/// Rebuildable nearest-neighbor index over the hub set. Hubs are few and
/// slow-changing, so the index is rebuilt from scratch on hub-set change
/// rather than mutated in place.
pub trait HubIndex: Send {
    /// Replaces the indexed hub set.
    fn rebuild(&mut self, hubs: &[(AssetId, GeoPoint)]);

    /// The `k` hubs nearest to `point`, nearest first. Equal distances are
    /// broken by lowest hub id so assignment is deterministic.
    fn nearest_k(&self, point: GeoPoint, k: usize) -> Vec<AssetId>;

    fn nearest_one(&self, point: GeoPoint) -> Option<AssetId> {
        self.nearest_k(point, 1).into_iter().next()
    }

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One step of the zoom-to-capacity function: applies from `min_zoom` up to
/// the next tier's `min_zoom`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CapacityTier {
    pub min_zoom: u8,
    pub max_assets: usize,
}

/// Engine construction parameters. Validated once at engine construction;
/// the relationships between the knobs matter more than their exact values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Zoom tiers, ascending by `min_zoom`, starting at zoom 0. Coarser zoom
    /// means fewer resident assets.
    pub tiers: Vec<CapacityTier>,
    /// Global edge cap, independent of zoom.
    pub edge_cap: usize,
    /// Load region = viewport expanded by this factor.
    pub load_factor: f64,
    /// Cull region = viewport expanded by this factor. Strictly greater than
    /// `load_factor`, otherwise every pan evicts what it just loaded.
    pub cull_factor: f64,
    pub throttle: ThrottleConfig,
    /// The periodic cull pass runs only while resident edges exceed this
    /// fraction of `edge_cap`.
    pub cull_trigger_fraction: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tiers: vec![
                CapacityTier { min_zoom: 0, max_assets: 2_000 },
                CapacityTier { min_zoom: 8, max_assets: 8_000 },
                CapacityTier { min_zoom: 12, max_assets: 20_000 },
                CapacityTier { min_zoom: 16, max_assets: 40_000 },
            ],
            edge_cap: 30_000,
            load_factor: 1.5,
            cull_factor: 2.5,
            throttle: ThrottleConfig::default(),
            cull_trigger_fraction: 0.1,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tiers.is_empty() {
            return Err(EngineError::InvalidConfig("at least one capacity tier".into()));
        }
        if self.tiers[0].min_zoom != 0 {
            return Err(EngineError::InvalidConfig(
                "first capacity tier must start at zoom 0".into(),
            ));
        }
        for pair in self.tiers.windows(2) {
            if pair[1].min_zoom <= pair[0].min_zoom {
                return Err(EngineError::InvalidConfig(
                    "capacity tiers must ascend by min_zoom".into(),
                ));
            }
            if pair[1].max_assets < pair[0].max_assets {
                return Err(EngineError::InvalidConfig(
                    "capacity caps must not shrink as zoom increases".into(),
                ));
            }
        }
        if self.tiers.iter().any(|t| t.max_assets == 0) || self.edge_cap == 0 {
            return Err(EngineError::InvalidConfig("caps must be positive".into()));
        }
        if !self.load_factor.is_finite() || self.load_factor < 1.0 {
            return Err(EngineError::InvalidConfig("load_factor must be >= 1.0".into()));
        }
        if !self.cull_factor.is_finite() || self.cull_factor <= self.load_factor {
            return Err(EngineError::InvalidConfig(
                "cull_factor must be strictly greater than load_factor".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.cull_trigger_fraction) || self.cull_trigger_fraction == 0.0 {
            return Err(EngineError::InvalidConfig(
                "cull_trigger_fraction must be in (0, 1]".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.throttle.min_move_fraction) {
            return Err(EngineError::InvalidConfig(
                "min_move_fraction must be in [0, 1)".into(),
            ));
        }
        Ok(())
    }

    /// Active asset cap for a zoom level: the highest tier at or below it.
    pub fn asset_cap(&self, zoom: u8) -> usize {
        self.tiers
            .iter()
            .rev()
            .find(|t| zoom >= t.min_zoom)
            .map(|t| t.max_assets)
            .unwrap_or(0)
    }
}

/// Per-batch ingest report.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub epoch: u64,
    /// True when a newer request had superseded this batch; nothing else in
    /// the report is populated in that case.
    pub stale: bool,
    pub assets_inserted: usize,
    pub assets_refreshed: usize,
    pub assets_rejected: usize,
    pub edges_inserted: usize,
    pub edges_refreshed: usize,
    pub edges_rejected: usize,
    pub malformed_dropped: usize,
    pub dangling_dropped: usize,
    pub assets_culled: usize,
    pub edges_culled: usize,
    pub clusters: usize,
}

/// Result of one explicit cull pass.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CullReport {
    pub assets_removed: usize,
    pub edges_removed: usize,
}

/// Counter snapshot plus residency figures, for logging and the stats
/// endpoint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub current_epoch: u64,
    pub applied_epoch: u64,
    pub resident_assets: usize,
    pub resident_edges: usize,
    pub resident_hubs: usize,
    pub clusters: usize,
    pub asset_cap: usize,
    pub edge_cap: usize,
    pub batches_accepted: u64,
    pub batches_stale: u64,
    pub fetch_failures: u64,
    pub assets_truncated: u64,
    pub edges_truncated: u64,
    pub malformed_dropped: u64,
    pub dangling_dropped: u64,
    pub cull_passes: u64,
    pub periodic_culls: u64,
    pub assets_culled: u64,
    pub edges_culled: u64,
    pub viewport_updates: u64,
    pub viewport_suppressed: u64,
}

/// Point-in-time copy of everything the rendering layer consumes. Vectors
/// are sorted by id so identical states produce identical snapshots.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MapSnapshot {
    pub epoch: u64,
    pub viewport: Option<Viewport>,
    pub assets: Vec<Asset>,
    pub edges: Vec<Edge>,
    pub clusters: Vec<Cluster>,
}

#[derive(Debug, Default)]
struct Counters {
    batches_accepted: AtomicU64,
    batches_stale: AtomicU64,
    fetch_failures: AtomicU64,
    assets_truncated: AtomicU64,
    edges_truncated: AtomicU64,
    malformed_dropped: AtomicU64,
    dangling_dropped: AtomicU64,
    cull_passes: AtomicU64,
    periodic_culls: AtomicU64,
    assets_culled: AtomicU64,
    edges_culled: AtomicU64,
    viewport_updates: AtomicU64,
    viewport_suppressed: AtomicU64,
}

struct EngineState<H> {
    assets: BoundedStore<AssetId, Asset>,
    edges: BoundedStore<EdgeKey, Edge>,
    tracker: ViewportTracker,
    index: H,
    clusters: Vec<Cluster>,
    load_seq: u64,
    active_asset_cap: usize,
}

#[derive(Default)]
struct CullSummary {
    ran: bool,
    assets_removed: usize,
    edges_removed: usize,
    hubs_removed: bool,
}

/// The cache engine. All store mutation happens under one lock: inserts,
/// cull passes, index rebuilds, and cluster recomputation run to completion
/// without interleaving. The only concurrency is the asynchronous fetch,
/// made safe by the epoch rule in [`MapEngine::apply_batch`].
pub struct MapEngine<S, H> {
    source: S,
    config: EngineConfig,
    state: Mutex<EngineState<H>>,
    snapshot: RwLock<Arc<MapSnapshot>>,
    epochs: AtomicU64,
    applied_epoch: AtomicU64,
    counters: Counters,
}

impl<S, H> MapEngine<S, H>
where
    H: HubIndex,
{
    pub fn new(source: S, index: H, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let tracker = ViewportTracker::new(
            config.throttle.clone(),
            config.load_factor,
            config.cull_factor,
        );
        Ok(Self::assemble(source, index, config, tracker))
    }

    #[cfg(test)]
    fn with_clock(
        source: S,
        index: H,
        config: EngineConfig,
        clock: Arc<dyn viewport::Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let tracker = ViewportTracker::with_clock(
            config.throttle.clone(),
            config.load_factor,
            config.cull_factor,
            clock,
        );
        Ok(Self::assemble(source, index, config, tracker))
    }

    fn assemble(source: S, index: H, config: EngineConfig, tracker: ViewportTracker) -> Self {
        let active_asset_cap = config.asset_cap(0);
        Self {
            source,
            config,
            state: Mutex::new(EngineState {
                assets: BoundedStore::new(),
                edges: BoundedStore::new(),
                tracker,
                index,
                clusters: Vec::new(),
                load_seq: 0,
                active_asset_cap,
            }),
            snapshot: RwLock::new(Arc::new(MapSnapshot::default())),
            epochs: AtomicU64::new(0),
            applied_epoch: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Issues the next request epoch. Monotonically increasing; a batch is
    /// only applied while no higher epoch has been issued since.
    pub fn next_epoch(&self) -> u64 {
        self.epochs.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn current_epoch(&self) -> u64 {
        self.epochs.load(Ordering::Relaxed)
    }

    pub fn viewport(&self) -> Option<Viewport> {
        self.state.lock().tracker.viewport()
    }

    /// Latest fully-consistent snapshot. Cheap: hands out a shared reference
    /// to the copy published by the last mutation pass, never a view into
    /// live state.
    pub fn current_snapshot(&self) -> Arc<MapSnapshot> {
        self.snapshot.read().clone()
    }

    /// Feeds one raw viewport through the throttle. When the update passes,
    /// the new zoom tier takes effect and a cull pass for the new region
    /// runs immediately, before any fetch: residency invariants hold even if
    /// the subsequent request never resolves.
    pub fn update_viewport(&self, raw: Viewport) -> Option<ViewportChanged> {
        let mut state = self.state.lock();
        let Some(changed) = state.tracker.update(raw) else {
            self.counters.viewport_suppressed.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        self.counters.viewport_updates.fetch_add(1, Ordering::Relaxed);
        state.active_asset_cap = self.config.asset_cap(raw.zoom);
        let cull = self.cull_locked(&mut state);
        self.note_cull(&cull, false);
        let mutated = cull.assets_removed + cull.edges_removed > 0;
        self.finish_mutation_locked(&mut state, cull.hubs_removed, mutated);
        Some(changed)
    }

    /// Applies one batch for the given epoch. Stale batches (a newer epoch
    /// has been issued) are discarded in full; otherwise malformed entries
    /// are filtered, assets are inserted before edges, and a reactive cull
    /// plus recluster run in the same pass.
    pub fn apply_batch(&self, epoch: u64, batch: RegionBatch) -> IngestOutcome {
        let mut outcome = IngestOutcome { epoch, ..Default::default() };
        if epoch < self.epochs.load(Ordering::Relaxed) {
            return self.discard_stale(outcome);
        }
        let mut state = self.state.lock();
        // Re-check under the lock: a newer request may have been issued
        // while this batch was in flight.
        if epoch < self.epochs.load(Ordering::Relaxed) {
            return self.discard_stale(outcome);
        }

        let cap = state.active_asset_cap;
        let mut prepared = Vec::with_capacity(batch.assets.len());
        for rec in &batch.assets {
            let Some((id, kind, point, health, load)) = sanitize_asset(rec) else {
                outcome.malformed_dropped += 1;
                continue;
            };
            state.load_seq += 1;
            let asset = match state.assets.get(&id) {
                Some(existing) => existing.refreshed(health, load, state.load_seq),
                None => Asset::builder(id.clone(), kind, point)
                    .health(health)
                    .load(load)
                    .loaded_at(state.load_seq)
                    .build(),
            };
            prepared.push((id, asset));
        }
        let asset_outcome = state.assets.insert_batch(prepared, cap);
        let hubs_added = asset_outcome
            .accepted
            .iter()
            .filter_map(|id| state.assets.get(id))
            .any(Asset::is_hub);
        outcome.assets_inserted = asset_outcome.inserted();
        outcome.assets_refreshed = asset_outcome.refreshed;
        outcome.assets_rejected = asset_outcome.rejected;

        let mut edge_items = Vec::with_capacity(batch.edges.len());
        for rec in &batch.edges {
            let Some(key) = sanitize_edge(rec) else {
                outcome.malformed_dropped += 1;
                continue;
            };
            let (Some(from), Some(to)) = (state.assets.get(&key.from), state.assets.get(&key.to))
            else {
                outcome.dangling_dropped += 1;
                continue;
            };
            let (from_point, to_point) = (from.point(), to.point());
            state.load_seq += 1;
            edge_items.push((
                key.clone(),
                Edge::new(key, from_point, to_point, state.load_seq),
            ));
        }
        let edge_outcome = state.edges.insert_batch(edge_items, self.config.edge_cap);
        outcome.edges_inserted = edge_outcome.inserted();
        outcome.edges_refreshed = edge_outcome.refreshed;
        outcome.edges_rejected = edge_outcome.rejected;

        let cull = self.cull_locked(&mut state);
        self.note_cull(&cull, false);
        outcome.assets_culled = cull.assets_removed;
        outcome.edges_culled = cull.edges_removed;

        let mutated = outcome.assets_inserted
            + outcome.assets_refreshed
            + outcome.edges_inserted
            + outcome.edges_refreshed
            + cull.assets_removed
            + cull.edges_removed
            > 0;
        self.applied_epoch.fetch_max(epoch, Ordering::Relaxed);
        self.finish_mutation_locked(&mut state, hubs_added || cull.hubs_removed, mutated);
        outcome.clusters = state.clusters.len();
        drop(state);

        self.counters.batches_accepted.fetch_add(1, Ordering::Relaxed);
        self.counters
            .assets_truncated
            .fetch_add(outcome.assets_rejected as u64, Ordering::Relaxed);
        self.counters
            .edges_truncated
            .fetch_add(outcome.edges_rejected as u64, Ordering::Relaxed);
        self.counters
            .malformed_dropped
            .fetch_add(outcome.malformed_dropped as u64, Ordering::Relaxed);
        self.counters
            .dangling_dropped
            .fetch_add(outcome.dangling_dropped as u64, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        {
            gridscope_metrics::record_batch_accepted(
                outcome.assets_inserted as u64,
                outcome.edges_inserted as u64,
            );
            gridscope_metrics::record_capacity_truncated(
                (outcome.assets_rejected + outcome.edges_rejected) as u64,
            );
            gridscope_metrics::record_malformed_dropped(outcome.malformed_dropped as u64);
        }
        outcome
    }

    fn discard_stale(&self, mut outcome: IngestOutcome) -> IngestOutcome {
        outcome.stale = true;
        self.counters.batches_stale.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        gridscope_metrics::record_batch_stale();
        outcome
    }

    /// Timer-driven cull. Runs the two-phase removal only while the resident
    /// edge count sits above the trigger threshold; edges accumulate from
    /// overlapping load regions even without viewport movement, which is why
    /// reactive culling alone is not enough.
    pub fn cull_periodic(&self) -> Option<CullReport> {
        let trigger =
            ((self.config.edge_cap as f64 * self.config.cull_trigger_fraction).ceil() as usize).max(1);
        let mut state = self.state.lock();
        if state.edges.len() < trigger {
            return None;
        }
        let cull = self.cull_locked(&mut state);
        if !cull.ran {
            return None;
        }
        self.note_cull(&cull, true);
        let mutated = cull.assets_removed + cull.edges_removed > 0;
        self.finish_mutation_locked(&mut state, cull.hubs_removed, mutated);
        Some(CullReport {
            assets_removed: cull.assets_removed,
            edges_removed: cull.edges_removed,
        })
    }

    pub fn stats(&self) -> EngineStats {
        let state = self.state.lock();
        EngineStats {
            current_epoch: self.epochs.load(Ordering::Relaxed),
            applied_epoch: self.applied_epoch.load(Ordering::Relaxed),
            resident_assets: state.assets.len(),
            resident_edges: state.edges.len(),
            resident_hubs: state.assets.values().filter(|a| a.is_hub()).count(),
            clusters: state.clusters.len(),
            asset_cap: state.active_asset_cap,
            edge_cap: self.config.edge_cap,
            batches_accepted: self.counters.batches_accepted.load(Ordering::Relaxed),
            batches_stale: self.counters.batches_stale.load(Ordering::Relaxed),
            fetch_failures: self.counters.fetch_failures.load(Ordering::Relaxed),
            assets_truncated: self.counters.assets_truncated.load(Ordering::Relaxed),
            edges_truncated: self.counters.edges_truncated.load(Ordering::Relaxed),
            malformed_dropped: self.counters.malformed_dropped.load(Ordering::Relaxed),
            dangling_dropped: self.counters.dangling_dropped.load(Ordering::Relaxed),
            cull_passes: self.counters.cull_passes.load(Ordering::Relaxed),
            periodic_culls: self.counters.periodic_culls.load(Ordering::Relaxed),
            assets_culled: self.counters.assets_culled.load(Ordering::Relaxed),
            edges_culled: self.counters.edges_culled.load(Ordering::Relaxed),
            viewport_updates: self.counters.viewport_updates.load(Ordering::Relaxed),
            viewport_suppressed: self.counters.viewport_suppressed.load(Ordering::Relaxed),
        }
    }

    /// Two-phase removal under the already-held lock: assets outside the
    /// cull region first (plus oldest-first eviction down to the active cap
    /// when the tier shrank), then edges with a missing endpoint. Edge
    /// validity is defined by asset residency, so the ordering is fixed.
    fn cull_locked(&self, state: &mut EngineState<H>) -> CullSummary {
        let Some(region) = state.tracker.cull_region() else {
            return CullSummary::default();
        };
        let mut removed_assets = state.assets.remove_where(|_, a| !region.contains(a.point()));
        let cap = state.active_asset_cap;
        removed_assets.extend(state.assets.evict_oldest(cap, |a| a.loaded_at()));
        let assets = &state.assets;
        let removed_edges = state
            .edges
            .remove_where(|k, _| !assets.contains(&k.from) || !assets.contains(&k.to));
        CullSummary {
            ran: true,
            hubs_removed: removed_assets.iter().any(Asset::is_hub),
            assets_removed: removed_assets.len(),
            edges_removed: removed_edges.len(),
        }
    }

    fn note_cull(&self, cull: &CullSummary, periodic: bool) {
        if !cull.ran {
            return;
        }
        self.counters.cull_passes.fetch_add(1, Ordering::Relaxed);
        if periodic {
            self.counters.periodic_culls.fetch_add(1, Ordering::Relaxed);
        }
        self.counters
            .assets_culled
            .fetch_add(cull.assets_removed as u64, Ordering::Relaxed);
        self.counters
            .edges_culled
            .fetch_add(cull.edges_removed as u64, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        gridscope_metrics::record_cull_pass(cull.assets_removed as u64, cull.edges_removed as u64);
    }

    /// Index rebuild (hub-set change only), whole-set recluster, invariant
    /// checks, snapshot publication.
    fn finish_mutation_locked(&self, state: &mut EngineState<H>, hubs_changed: bool, mutated: bool) {
        if hubs_changed {
            let hubs: Vec<(AssetId, GeoPoint)> = state
                .assets
                .values()
                .filter(|a| a.is_hub())
                .map(|a| (a.id().clone(), a.point()))
                .collect();
            state.index.rebuild(&hubs);
        }
        if mutated || hubs_changed {
            #[cfg(feature = "metrics")]
            let started = std::time::Instant::now();
            let mut hub_refs: Vec<&Asset> = Vec::new();
            let mut leaf_refs: Vec<&Asset> = Vec::new();
            for asset in state.assets.values() {
                if asset.is_hub() {
                    hub_refs.push(asset);
                } else {
                    leaf_refs.push(asset);
                }
            }
            let clusters = cluster::recompute(&leaf_refs, &hub_refs, &state.index);
            state.clusters = clusters;
            #[cfg(feature = "metrics")]
            gridscope_metrics::record_recompute_latency(started.elapsed());
        }
        self.debug_check_invariants(state);
        self.publish_locked(state);
        #[cfg(feature = "metrics")]
        gridscope_metrics::record_resident(
            state.assets.len() as u64,
            state.edges.len() as u64,
            state.clusters.len() as u64,
        );
    }

    fn publish_locked(&self, state: &EngineState<H>) {
        let mut assets: Vec<Asset> = state.assets.values().cloned().collect();
        assets.sort_by(|a, b| a.id().cmp(b.id()));
        let mut edges: Vec<Edge> = state.edges.values().cloned().collect();
        edges.sort_by(|a, b| a.key().cmp(b.key()));
        let snapshot = MapSnapshot {
            epoch: self.applied_epoch.load(Ordering::Relaxed),
            viewport: state.tracker.viewport(),
            assets,
            edges,
            clusters: state.clusters.clone(),
        };
        *self.snapshot.write() = Arc::new(snapshot);
    }

    fn debug_check_invariants(&self, state: &EngineState<H>) {
        debug_assert!(
            state.assets.len() <= state.active_asset_cap,
            "resident assets exceed the active cap"
        );
        debug_assert!(
            state.edges.len() <= self.config.edge_cap,
            "resident edges exceed the edge cap"
        );
        #[cfg(debug_assertions)]
        {
            for (key, _) in state.edges.iter() {
                debug_assert!(
                    state.assets.contains(&key.from) && state.assets.contains(&key.to),
                    "edge {key} references a non-resident asset"
                );
            }
            for cluster in &state.clusters {
                debug_assert!(state.assets.contains(&cluster.hub_id));
                for id in &cluster.member_ids {
                    debug_assert!(state.assets.contains(id), "cluster member {id} not resident");
                }
            }
        }
    }
}

impl<S, H> MapEngine<S, H>
where
    S: RegionSource,
    H: HubIndex,
{
    /// Issues an epoch, fetches the load region, and applies the result.
    /// Fetch failures propagate to the caller; the engine takes no
    /// corrective action and the epoch simply never resolves.
    pub async fn request(&self, changed: &ViewportChanged) -> Result<IngestOutcome> {
        let epoch = self.next_epoch();
        let batch = match self
            .source
            .fetch_region(&changed.load_region, changed.viewport.zoom)
            .await
        {
            Ok(batch) => batch,
            Err(err) => {
                self.counters.fetch_failures.fetch_add(1, Ordering::Relaxed);
                #[cfg(feature = "metrics")]
                gridscope_metrics::record_fetch_failure();
                return Err(err);
            }
        };
        Ok(self.apply_batch(epoch, batch))
    }
}

fn sanitize_asset(
    rec: &AssetRecord,
) -> Option<(AssetId, AssetKind, GeoPoint, Option<Level>, Option<Level>)> {
    if rec.id.trim().is_empty() {
        return None;
    }
    let kind = AssetKind::parse(&rec.kind)?;
    let point = GeoPoint::new(rec.lon, rec.lat).ok()?;
    // A bad scalar degrades to "no reading"; coordinates are the integrity
    // boundary that rejects the whole record.
    let health = rec.health.and_then(|v| Level::new(v).ok());
    let load = rec.load.and_then(|v| Level::new(v).ok());
    Some((AssetId::new(rec.id.clone()), kind, point, health, load))
}

fn sanitize_edge(rec: &EdgeRecord) -> Option<EdgeKey> {
    if rec.from_id.trim().is_empty() || rec.to_id.trim().is_empty() || rec.from_id == rec.to_id {
        return None;
    }
    Some(EdgeKey::new(
        AssetId::new(rec.from_id.clone()),
        AssetId::new(rec.to_id.clone()),
    ))
}
