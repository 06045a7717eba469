//! R-tree-backed HubIndex implementation for Gridscope.
//!
//! Hubs are few and slow-changing, so the whole tree is bulk-loaded on every
//! rebuild instead of mutated in place. Queries run on planar lon/lat
//! coordinates, matching the engine's flat-map distance model.

use gridscope_core::{AssetId, GeoPoint};
use gridscope_engine::HubIndex;
use rstar::{primitives::GeomWithData, RTree};

type HubEntry = GeomWithData<[f64; 2], AssetId>;

/// R-tree hub index.
pub struct RstarHubIndex {
    tree: RTree<HubEntry>,
}

impl RstarHubIndex {
    pub fn new() -> Self {
        Self { tree: RTree::new() }
    }

    fn drain_group(group: &mut Vec<&AssetId>, picked: &mut Vec<AssetId>) {
        group.sort();
        picked.extend(group.drain(..).cloned());
    }
}

impl Default for RstarHubIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl HubIndex for RstarHubIndex {
    fn rebuild(&mut self, hubs: &[(AssetId, GeoPoint)]) {
        let entries: Vec<HubEntry> = hubs
            .iter()
            .map(|(id, p)| GeomWithData::new([p.lon, p.lat], id.clone()))
            .collect();
        self.tree = RTree::bulk_load(entries);
    }

    /// Walks neighbors in ascending distance, collecting runs of equal
    /// squared distance so ties come out sorted by id rather than in tree
    /// traversal order.
    fn nearest_k(&self, point: GeoPoint, k: usize) -> Vec<AssetId> {
        if k == 0 {
            return Vec::new();
        }
        let origin = [point.lon, point.lat];
        let mut picked: Vec<AssetId> = Vec::with_capacity(k);
        let mut group: Vec<&AssetId> = Vec::new();
        let mut group_d2 = 0.0_f64;
        for (entry, d2) in self.tree.nearest_neighbor_iter_with_distance_2(&origin) {
            if !group.is_empty() && d2 > group_d2 {
                Self::drain_group(&mut group, &mut picked);
                if picked.len() >= k {
                    break;
                }
            }
            group_d2 = d2;
            group.push(&entry.data);
        }
        if picked.len() < k {
            Self::drain_group(&mut group, &mut picked);
        }
        picked.truncate(k);
        picked
    }

    fn len(&self) -> usize {
        self.tree.size()
    }
}
