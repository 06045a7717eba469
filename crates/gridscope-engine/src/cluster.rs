//! Nearest-hub clustering over the resident asset set.
//!
//! Assignment and aggregation are two separate linear passes. The whole
//! cluster list is rebuilt on every call; nothing is patched incrementally,
//! so aggregates can never drift from membership.

use std::collections::{BTreeMap, HashMap};

use gridscope_core::{Asset, AssetId, Cluster};

use crate::HubIndex;

/// Recomputes the full cluster list. Every leaf is assigned to its nearest
/// hub through the index; ties were already broken by lowest hub id inside
/// the index, so the output is deterministic for a given resident set.
///
/// With no hubs resident there is nothing to anchor on and the result is
/// empty; leaves still reach the rendering layer individually through the
/// snapshot.
pub fn recompute<H>(leaves: &[&Asset], hubs: &[&Asset], index: &H) -> Vec<Cluster>
where
    H: HubIndex + ?Sized,
{
    if hubs.is_empty() {
        return Vec::new();
    }

    let mut members: HashMap<AssetId, Vec<&Asset>> =
        hubs.iter().map(|h| (h.id().clone(), Vec::new())).collect();
    for leaf in leaves {
        let Some(hub_id) = index.nearest_one(leaf.point()) else {
            continue;
        };
        members.entry(hub_id).or_default().push(leaf);
    }

    let mut clusters: Vec<Cluster> = hubs
        .iter()
        .map(|hub| {
            let mut assigned = members.remove(hub.id()).unwrap_or_default();
            assigned.sort_by(|a, b| a.id().cmp(b.id()));

            let mut count_by_kind = BTreeMap::new();
            let mut health_sum = 0.0f64;
            let mut health_n = 0usize;
            let mut load_sum = 0.0f64;
            let mut load_n = 0usize;
            let mut worst = hub.status();
            for member in &assigned {
                *count_by_kind.entry(member.kind()).or_insert(0) += 1;
                if let Some(h) = member.health() {
                    health_sum += f64::from(h.get());
                    health_n += 1;
                }
                if let Some(l) = member.load() {
                    load_sum += f64::from(l.get());
                    load_n += 1;
                }
                worst = worst.max(member.status());
            }

            Cluster {
                hub_id: hub.id().clone(),
                center: hub.point(),
                member_ids: assigned.iter().map(|m| m.id().clone()).collect(),
                count_by_kind,
                avg_health: (health_n > 0).then(|| (health_sum / health_n as f64) as f32),
                avg_load: (load_n > 0).then(|| (load_sum / load_n as f64) as f32),
                worst_status: worst,
            }
        })
        .collect();

    clusters.sort_by(|a, b| a.hub_id.cmp(&b.hub_id));
    clusters
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::LinearIndex;
    use gridscope_core::{AssetKind, GeoPoint, Level, Status};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn point(lon: f64, lat: f64) -> GeoPoint {
        GeoPoint::new(lon, lat).expect("point")
    }

    fn hub(id: &str, lon: f64, lat: f64) -> Asset {
        Asset::builder(AssetId::new(id), AssetKind::Substation, point(lon, lat)).build()
    }

    fn leaf(id: &str, lon: f64, lat: f64, health: Option<f32>, load: Option<f32>) -> Asset {
        Asset::builder(AssetId::new(id), AssetKind::Meter, point(lon, lat))
            .health(health.map(Level::clamped))
            .load(load.map(Level::clamped))
            .build()
    }

    fn index_over(hubs: &[&Asset]) -> LinearIndex {
        let mut index = LinearIndex::default();
        index.rebuild(
            &hubs
                .iter()
                .map(|h| (h.id().clone(), h.point()))
                .collect::<Vec<_>>(),
        );
        index
    }

    #[test]
    fn no_hubs_yields_no_clusters() {
        let l = leaf("m1", 0.0, 0.0, None, None);
        let index = LinearIndex::default();
        assert!(recompute(&[&l], &[], &index).is_empty());
    }

    #[test]
    fn aggregates_cover_members_and_hub_status() {
        let h = hub("sub-a", 0.0, 0.0);
        let m1 = leaf("m1", 0.1, 0.0, Some(80.0), Some(20.0));
        let m2 = leaf("m2", 0.0, 0.1, Some(40.0), None);
        let m3 = leaf("m3", 0.2, 0.2, None, Some(95.0));
        let hubs = [&h];
        let index = index_over(&hubs);

        let clusters = recompute(&[&m1, &m2, &m3], &hubs, &index);
        assert_eq!(clusters.len(), 1);
        let c = &clusters[0];
        assert_eq!(c.hub_id, AssetId::new("sub-a"));
        assert_eq!(c.center, point(0.0, 0.0));
        assert_eq!(
            c.member_ids,
            vec![AssetId::new("m1"), AssetId::new("m2"), AssetId::new("m3")]
        );
        assert_eq!(c.count_by_kind.get(&AssetKind::Meter), Some(&3));
        assert_eq!(c.avg_health, Some(60.0));
        assert_eq!(c.avg_load, Some(57.5));
        // m3 is critical on load; the cluster badge shows it.
        assert_eq!(c.worst_status, Status::Critical);
    }

    #[test]
    fn empty_cluster_reports_hub_status() {
        let h = Asset::builder(AssetId::new("sub-a"), AssetKind::Substation, point(0.0, 0.0))
            .health(Some(Level::clamped(10.0)))
            .build();
        let hubs = [&h];
        let index = index_over(&hubs);
        let clusters = recompute(&[], &hubs, &index);
        assert_eq!(clusters.len(), 1);
        assert!(clusters[0].member_ids.is_empty());
        assert_eq!(clusters[0].avg_health, None);
        assert_eq!(clusters[0].worst_status, Status::Critical);
    }

    #[test]
    fn recompute_twice_is_identical() {
        let h1 = hub("sub-a", 0.0, 0.0);
        let h2 = hub("sub-b", 10.0, 10.0);
        let leaves: Vec<Asset> = (0..50)
            .map(|i| {
                leaf(
                    &format!("m{i}"),
                    f64::from(i % 13),
                    f64::from(i % 7),
                    Some(f64::from(i) as f32),
                    None,
                )
            })
            .collect();
        let leaf_refs: Vec<&Asset> = leaves.iter().collect();
        let hubs = [&h1, &h2];
        let index = index_over(&hubs);

        let a = recompute(&leaf_refs, &hubs, &index);
        let b = recompute(&leaf_refs, &hubs, &index);
        assert_eq!(a, b);
    }

    #[test]
    fn equidistant_leaf_goes_to_lowest_hub_id() {
        let h1 = hub("sub-b", 1.0, 0.0);
        let h2 = hub("sub-a", -1.0, 0.0);
        let l = leaf("m1", 0.0, 0.0, None, None);
        let hubs = [&h1, &h2];
        let index = index_over(&hubs);

        let clusters = recompute(&[&l], &hubs, &index);
        let holder: Vec<&Cluster> = clusters.iter().filter(|c| !c.member_ids.is_empty()).collect();
        assert_eq!(holder.len(), 1);
        assert_eq!(holder[0].hub_id, AssetId::new("sub-a"));
    }

    #[test]
    fn matches_brute_force_on_scattered_leaves() {
        let mut rng = StdRng::seed_from_u64(42);
        let hubs: Vec<Asset> = [
            ("sub-a", -5.0, -5.0),
            ("sub-b", 5.0, -5.0),
            ("sub-c", 0.0, 0.0),
            ("sub-d", -5.0, 5.0),
            ("sub-e", 5.0, 5.0),
        ]
        .into_iter()
        .map(|(id, lon, lat)| hub(id, lon, lat))
        .collect();
        let leaves: Vec<Asset> = (0..500)
            .map(|i| {
                leaf(
                    &format!("m{i:03}"),
                    rng.gen_range(-8.0..8.0),
                    rng.gen_range(-8.0..8.0),
                    None,
                    None,
                )
            })
            .collect();

        let hub_refs: Vec<&Asset> = hubs.iter().collect();
        let leaf_refs: Vec<&Asset> = leaves.iter().collect();
        let index = index_over(&hub_refs);
        let clusters = recompute(&leaf_refs, &hub_refs, &index);

        // Brute force: per leaf, scan all hubs, lowest id on ties.
        let mut expected: HashMap<AssetId, Vec<AssetId>> = HashMap::new();
        for l in &leaves {
            let mut best: Option<(&Asset, f64)> = None;
            for h in &hubs {
                let d = l.point().distance_sq(h.point());
                best = match best {
                    None => Some((h, d)),
                    Some((bh, bd)) => {
                        if d < bd || (d == bd && h.id() < bh.id()) {
                            Some((h, d))
                        } else {
                            Some((bh, bd))
                        }
                    }
                };
            }
            let (winner, _) = best.expect("five hubs");
            expected
                .entry(winner.id().clone())
                .or_default()
                .push(l.id().clone());
        }
        for ids in expected.values_mut() {
            ids.sort();
        }

        assert_eq!(clusters.len(), hubs.len());
        for cluster in &clusters {
            let want = expected.remove(&cluster.hub_id).unwrap_or_default();
            assert_eq!(cluster.member_ids, want, "hub {}", cluster.hub_id);
        }
    }
}
