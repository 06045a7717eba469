//! Demo region source for Gridscope; synthesizes a plausible asset graph for
//! local development when no real region service is available.
//!
//! The world is a lattice of fixed-size cells. Each cell derives everything it
//! contains from a seed hashed with the cell coordinates, so the same region
//! always yields the same assets regardless of fetch order or overlap.
//! Readings drift slowly across fetches to exercise the refresh path.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::{future::Future, pin::Pin};

use gridscope_core::{AssetKind, BoundingBox};
use gridscope_engine::{AssetRecord, EdgeRecord, EngineError, RegionBatch, RegionSource, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

const HUB_PROBABILITY: f64 = 0.35;
const MISSING_READING_PROBABILITY: f64 = 0.1;
/// Readings re-roll every this many fetches.
const READING_DRIFT_INTERVAL: u64 = 4;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub seed: u64,
    /// Lattice cell size in degrees.
    pub cell_size: f64,
    pub max_assets_per_fetch: usize,
    pub max_edges_per_fetch: usize,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            seed: 7,
            cell_size: 0.25,
            max_assets_per_fetch: 5_000,
            max_edges_per_fetch: 8_000,
        }
    }
}

/// Deterministic lattice-backed region source.
pub struct DemoSource {
    config: DemoConfig,
    fetches: AtomicU64,
}

impl DemoSource {
    pub fn new(config: DemoConfig) -> Result<Self> {
        if !config.cell_size.is_finite() || config.cell_size <= 0.0 {
            return Err(EngineError::InvalidConfig(
                "demo cell_size must be positive".into(),
            ));
        }
        if config.max_assets_per_fetch == 0 || config.max_edges_per_fetch == 0 {
            return Err(EngineError::InvalidConfig(
                "demo fetch caps must be positive".into(),
            ));
        }
        Ok(Self {
            config,
            fetches: AtomicU64::new(0),
        })
    }

    fn stream_seed<T: Hash>(&self, key: T) -> u64 {
        let mut hasher = DefaultHasher::new();
        (self.config.seed, key).hash(&mut hasher);
        hasher.finish()
    }

    fn cell_has_hub(&self, ix: i64, iy: i64) -> bool {
        StdRng::seed_from_u64(self.stream_seed((ix, iy))).gen_bool(HUB_PROBABILITY)
    }

    fn readings(&self, ix: i64, iy: i64, n: usize, tick: u64) -> (Option<f32>, Option<f32>) {
        let seed = self.stream_seed((ix, iy, n, tick / READING_DRIFT_INTERVAL));
        let mut rng = StdRng::seed_from_u64(seed);
        let health = (!rng.gen_bool(MISSING_READING_PROBABILITY))
            .then(|| rng.gen_range(15.0..100.0));
        let load = (!rng.gen_bool(MISSING_READING_PROBABILITY))
            .then(|| rng.gen_range(5.0..100.0));
        (health, load)
    }

    fn generate_cell(&self, ix: i64, iy: i64, zoom: u8, tick: u64, batch: &mut RegionBatch) {
        let cell = self.config.cell_size;
        let mut rng = StdRng::seed_from_u64(self.stream_seed((ix, iy)));
        // First draw decides hub presence so neighbor cells can replay it.
        let has_hub = rng.gen_bool(HUB_PROBABILITY);
        let hub_id = format!("substation:{ix}:{iy}");
        let mut n = 0usize;

        let place = |rng: &mut StdRng, n: usize| {
            let lon = ((ix as f64 + rng.gen::<f64>()) * cell).clamp(-180.0, 180.0);
            let lat = ((iy as f64 + rng.gen::<f64>()) * cell).clamp(-90.0, 90.0);
            let (health, load) = self.readings(ix, iy, n, tick);
            (lon, lat, health, load)
        };

        if has_hub {
            let (lon, lat, health, load) = place(&mut rng, n);
            batch.assets.push(AssetRecord {
                id: hub_id.clone(),
                kind: AssetKind::Substation.as_str().to_string(),
                lat,
                lon,
                health,
                load,
            });
            // Link west and south so each hub pair appears once.
            for (nx, ny) in [(ix - 1, iy), (ix, iy - 1)] {
                if self.cell_has_hub(nx, ny) && batch.edges.len() < self.config.max_edges_per_fetch
                {
                    batch.edges.push(EdgeRecord {
                        from_id: hub_id.clone(),
                        to_id: format!("substation:{nx}:{ny}"),
                    });
                }
            }
        }

        for (kind, count) in kind_mix(zoom) {
            for _ in 0..*count {
                if batch.assets.len() >= self.config.max_assets_per_fetch {
                    return;
                }
                n += 1;
                let (lon, lat, health, load) = place(&mut rng, n);
                let id = format!("{}:{ix}:{iy}:{n}", kind.as_str());
                batch.assets.push(AssetRecord {
                    id: id.clone(),
                    kind: kind.as_str().to_string(),
                    lat,
                    lon,
                    health,
                    load,
                });
                if has_hub && batch.edges.len() < self.config.max_edges_per_fetch {
                    batch.edges.push(EdgeRecord {
                        from_id: id,
                        to_id: hub_id.clone(),
                    });
                }
            }
        }
    }

    fn generate(&self, region: &BoundingBox, zoom: u8) -> RegionBatch {
        let tick = self.fetches.fetch_add(1, Ordering::Relaxed);
        let cell = self.config.cell_size;
        let min_ix = (region.min_lon / cell).floor() as i64;
        let max_ix = (region.max_lon / cell).floor() as i64;
        let min_iy = (region.min_lat / cell).floor() as i64;
        let max_iy = (region.max_lat / cell).floor() as i64;

        let mut batch = RegionBatch::default();
        'cells: for iy in min_iy..=max_iy {
            for ix in min_ix..=max_ix {
                if batch.assets.len() >= self.config.max_assets_per_fetch {
                    break 'cells;
                }
                self.generate_cell(ix, iy, zoom, tick, &mut batch);
            }
        }
        batch
    }
}

/// Leaf kinds and per-cell counts visible at a zoom level. Coarse zooms only
/// see the transmission-level gear; meters and sensors appear close in.
fn kind_mix(zoom: u8) -> &'static [(AssetKind, usize)] {
    match zoom {
        0..=7 => &[(AssetKind::Transformer, 1)],
        8..=11 => &[(AssetKind::Transformer, 2), (AssetKind::Switch, 1)],
        12..=15 => &[
            (AssetKind::Transformer, 2),
            (AssetKind::Switch, 2),
            (AssetKind::Meter, 5),
        ],
        _ => &[
            (AssetKind::Transformer, 2),
            (AssetKind::Switch, 2),
            (AssetKind::Meter, 6),
            (AssetKind::Sensor, 4),
        ],
    }
}

impl RegionSource for DemoSource {
    #[allow(clippy::type_complexity)]
    fn fetch_region<'a>(
        &'a self,
        region: &'a BoundingBox,
        zoom: u8,
    ) -> Pin<Box<dyn Future<Output = Result<RegionBatch>> + Send + 'a>> {
        Box::pin(std::future::ready(Ok(self.generate(region, zoom))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridscope_core::GeoPoint;
    use std::collections::HashSet;

    fn source() -> DemoSource {
        DemoSource::new(DemoConfig::default()).expect("source")
    }

    fn region(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> BoundingBox {
        BoundingBox::new(min_lon, min_lat, max_lon, max_lat).expect("region")
    }

    #[tokio::test]
    async fn same_region_yields_identical_batches_across_sources() {
        let r = region(0.0, 0.0, 1.0, 1.0);
        let a = source().fetch_region(&r, 12).await.expect("fetch");
        let b = source().fetch_region(&r, 12).await.expect("fetch");
        assert!(!a.assets.is_empty());
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn repeat_fetch_keeps_asset_identity() {
        let src = source();
        let r = region(0.0, 0.0, 1.0, 1.0);
        let first = src.fetch_region(&r, 12).await.expect("fetch");
        let second = src.fetch_region(&r, 12).await.expect("fetch");

        let key = |b: &RegionBatch| -> Vec<(String, String, u64, u64)> {
            b.assets
                .iter()
                .map(|a| (a.id.clone(), a.kind.clone(), a.lon.to_bits(), a.lat.to_bits()))
                .collect()
        };
        assert_eq!(key(&first), key(&second));
    }

    #[tokio::test]
    async fn different_seeds_disagree() {
        let r = region(0.0, 0.0, 1.0, 1.0);
        let a = source().fetch_region(&r, 12).await.expect("fetch");
        let other = DemoSource::new(DemoConfig {
            seed: 8,
            ..DemoConfig::default()
        })
        .expect("source");
        let b = other.fetch_region(&r, 12).await.expect("fetch");
        let ids = |b: &RegionBatch| -> HashSet<String> {
            b.assets.iter().map(|a| a.id.clone()).collect()
        };
        assert_ne!(ids(&a), ids(&b));
    }

    #[tokio::test]
    async fn zoom_controls_density_and_kind_mix() {
        let r = region(0.0, 0.0, 2.0, 2.0);
        let coarse = source().fetch_region(&r, 6).await.expect("fetch");
        let fine = source().fetch_region(&r, 16).await.expect("fetch");
        assert!(coarse.assets.len() < fine.assets.len());
        assert!(coarse
            .assets
            .iter()
            .all(|a| a.kind == "substation" || a.kind == "transformer"));
        assert!(fine.assets.iter().any(|a| a.kind == "sensor"));
    }

    #[tokio::test]
    async fn fetch_caps_are_respected() {
        let src = DemoSource::new(DemoConfig {
            max_assets_per_fetch: 10,
            max_edges_per_fetch: 5,
            ..DemoConfig::default()
        })
        .expect("source");
        let batch = src
            .fetch_region(&region(-10.0, -10.0, 10.0, 10.0), 16)
            .await
            .expect("fetch");
        assert!(batch.assets.len() <= 10);
        assert!(batch.edges.len() <= 5);
    }

    #[tokio::test]
    async fn edges_reference_generated_assets_or_neighbor_hubs() {
        let batch = source()
            .fetch_region(&region(0.0, 0.0, 1.5, 1.5), 12)
            .await
            .expect("fetch");
        let ids: HashSet<&str> = batch.assets.iter().map(|a| a.id.as_str()).collect();
        assert!(!batch.edges.is_empty());
        for e in &batch.edges {
            assert!(ids.contains(e.from_id.as_str()));
            if !ids.contains(e.to_id.as_str()) {
                // Hub-to-hub links may point at a hub just outside the
                // requested region; the engine drops them if that hub is
                // not resident.
                assert!(e.to_id.starts_with("substation:"));
            }
        }
    }

    #[tokio::test]
    async fn every_generated_record_validates() {
        let batch = source()
            .fetch_region(&region(-1.0, -1.0, 1.0, 1.0), 16)
            .await
            .expect("fetch");
        for a in &batch.assets {
            assert!(AssetKind::parse(&a.kind).is_some(), "kind {}", a.kind);
            assert!(GeoPoint::new(a.lon, a.lat).is_ok());
            if let Some(h) = a.health {
                assert!((0.0..=100.0).contains(&h));
            }
            if let Some(l) = a.load {
                assert!((0.0..=100.0).contains(&l));
            }
        }
    }

    #[test]
    fn config_validation() {
        assert!(DemoSource::new(DemoConfig {
            cell_size: 0.0,
            ..DemoConfig::default()
        })
        .is_err());
        assert!(DemoSource::new(DemoConfig {
            max_assets_per_fetch: 0,
            ..DemoConfig::default()
        })
        .is_err());
    }
}
