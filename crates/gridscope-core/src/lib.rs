//! Core data model for Gridscope.
//!
//! Assets are immutable records once resident; a repeat insert with the same id
//! refreshes health/load/status in place and everything else stays fixed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier for an asset (stringly typed, comes straight off the wire).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetId(pub String);

impl AssetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity of an edge: the ordered endpoint pair. Duplicate edges collapse
/// onto the same key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeKey {
    pub from: AssetId,
    pub to: AssetId,
}

impl EdgeKey {
    pub fn new(from: AssetId, to: AssetId) -> Self {
        Self { from, to }
    }
}

impl fmt::Display for EdgeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.from, self.to)
    }
}

/// Kind of asset on the map. `Substation` is the hub kind that anchors
/// clusters; everything else is a leaf.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Substation,
    Transformer,
    Switch,
    Meter,
    Sensor,
}

impl AssetKind {
    pub const ALL: [AssetKind; 5] = [
        AssetKind::Substation,
        AssetKind::Transformer,
        AssetKind::Switch,
        AssetKind::Meter,
        AssetKind::Sensor,
    ];

    pub fn is_hub(self) -> bool {
        matches!(self, AssetKind::Substation)
    }

    /// Parses the wire spelling; unknown kinds yield `None` rather than an
    /// error because the ingest path filters them silently.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "substation" => Some(AssetKind::Substation),
            "transformer" => Some(AssetKind::Transformer),
            "switch" => Some(AssetKind::Switch),
            "meter" => Some(AssetKind::Meter),
            "sensor" => Some(AssetKind::Sensor),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AssetKind::Substation => "substation",
            AssetKind::Transformer => "transformer",
            AssetKind::Switch => "switch",
            AssetKind::Meter => "meter",
            AssetKind::Sensor => "sensor",
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tri-state condition derived from health/load readings. Ordered so that
/// `max` picks the worst.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Healthy,
    Warning,
    Critical,
}

impl Status {
    pub const CRITICAL_HEALTH_FLOOR: f32 = 25.0;
    pub const WARNING_HEALTH_FLOOR: f32 = 60.0;
    pub const CRITICAL_LOAD_CEILING: f32 = 90.0;
    pub const WARNING_LOAD_CEILING: f32 = 75.0;

    /// Derives status from the optional readings. A missing reading never
    /// escalates: an asset with no telemetry reports `Healthy`.
    pub fn from_readings(health: Option<Level>, load: Option<Level>) -> Self {
        let health = health.map(Level::get);
        let load = load.map(Level::get);
        if health.is_some_and(|h| h < Self::CRITICAL_HEALTH_FLOOR)
            || load.is_some_and(|l| l > Self::CRITICAL_LOAD_CEILING)
        {
            return Status::Critical;
        }
        if health.is_some_and(|h| h < Self::WARNING_HEALTH_FLOOR)
            || load.is_some_and(|l| l > Self::WARNING_LOAD_CEILING)
        {
            return Status::Warning;
        }
        Status::Healthy
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Healthy => "healthy",
            Status::Warning => "warning",
            Status::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Health or load reading in the closed range [0.0, 100.0].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Level(f32);

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum LevelError {
    #[error("level must be between 0.0 and 100.0 inclusive, got {0}")]
    OutOfRange(f32),
    #[error("level cannot be NaN")]
    NotANumber,
}

impl Level {
    /// Validates the provided value is finite and within [0.0, 100.0].
    pub fn new(value: f32) -> Result<Self, LevelError> {
        if value.is_nan() {
            return Err(LevelError::NotANumber);
        }
        if !(0.0..=100.0).contains(&value) {
            return Err(LevelError::OutOfRange(value));
        }
        Ok(Self(value))
    }

    /// Clamps the provided value into the valid range; NaN becomes 0.0.
    pub fn clamped(value: f32) -> Self {
        if value.is_nan() {
            return Self(0.0);
        }
        Self(value.clamp(0.0, 100.0))
    }

    pub fn get(self) -> f32 {
        self.0
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Validation failures for geographic values.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum GeoError {
    #[error("coordinate must be finite")]
    NotFinite,
    #[error("latitude out of range [-90, 90], got {0}")]
    LatitudeOutOfRange(f64),
    #[error("longitude out of range [-180, 180], got {0}")]
    LongitudeOutOfRange(f64),
    #[error("bounding box min corner exceeds max corner")]
    InvertedBox,
}

/// A point in plain lon/lat degrees. Distances are planar; the system treats
/// the map as flat, which is adequate for nearest-hub assignment at the
/// regional scale it operates on.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lon: f64,
    pub lat: f64,
}

impl GeoPoint {
    pub fn new(lon: f64, lat: f64) -> Result<Self, GeoError> {
        if !lon.is_finite() || !lat.is_finite() {
            return Err(GeoError::NotFinite);
        }
        if !(-90.0..=90.0).contains(&lat) {
            return Err(GeoError::LatitudeOutOfRange(lat));
        }
        if !(-180.0..=180.0).contains(&lon) {
            return Err(GeoError::LongitudeOutOfRange(lon));
        }
        Ok(Self { lon, lat })
    }

    pub fn distance_sq(self, other: GeoPoint) -> f64 {
        let dx = self.lon - other.lon;
        let dy = self.lat - other.lat;
        dx * dx + dy * dy
    }
}

impl fmt::Display for GeoPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.lon, self.lat)
    }
}

/// Axis-aligned lon/lat rectangle. Both corners inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Result<Self, GeoError> {
        let min = GeoPoint::new(min_lon, min_lat)?;
        let max = GeoPoint::new(max_lon, max_lat)?;
        if min.lon > max.lon || min.lat > max.lat {
            return Err(GeoError::InvertedBox);
        }
        Ok(Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        })
    }

    /// Builds the box spanning two valid points, normalizing corner order.
    pub fn from_corners(a: GeoPoint, b: GeoPoint) -> Self {
        Self {
            min_lon: a.lon.min(b.lon),
            min_lat: a.lat.min(b.lat),
            max_lon: a.lon.max(b.lon),
            max_lat: a.lat.max(b.lat),
        }
    }

    pub fn center(&self) -> GeoPoint {
        GeoPoint {
            lon: (self.min_lon + self.max_lon) / 2.0,
            lat: (self.min_lat + self.max_lat) / 2.0,
        }
    }

    pub fn width(&self) -> f64 {
        self.max_lon - self.min_lon
    }

    pub fn height(&self) -> f64 {
        self.max_lat - self.min_lat
    }

    pub fn contains(&self, p: GeoPoint) -> bool {
        p.lon >= self.min_lon && p.lon <= self.max_lon && p.lat >= self.min_lat && p.lat <= self.max_lat
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        !(self.max_lon < other.min_lon
            || other.max_lon < self.min_lon
            || self.max_lat < other.min_lat
            || other.max_lat < self.min_lat)
    }

    /// Scales the box about its center by `factor`, clamped to world bounds.
    /// A factor of 1.0 returns the box unchanged.
    pub fn expanded(&self, factor: f64) -> BoundingBox {
        let c = self.center();
        let half_w = self.width() / 2.0 * factor;
        let half_h = self.height() / 2.0 * factor;
        BoundingBox {
            min_lon: (c.lon - half_w).max(-180.0),
            min_lat: (c.lat - half_h).max(-90.0),
            max_lon: (c.lon + half_w).min(180.0),
            max_lat: (c.lat + half_h).min(90.0),
        }
    }
}

/// The visible map area plus zoom. Zoom follows web-map convention: larger
/// means closer in.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub bounds: BoundingBox,
    pub zoom: u8,
}

impl Viewport {
    pub fn new(bounds: BoundingBox, zoom: u8) -> Self {
        Self { bounds, zoom }
    }
}

/// Resident asset record.
///
/// Built once on first insertion; a later record with the same id only
/// replaces health, load, status, and the insertion sequence through
/// [`Asset::refreshed`]. Kind and position never change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    id: AssetId,
    kind: AssetKind,
    point: GeoPoint,
    health: Option<Level>,
    load: Option<Level>,
    status: Status,
    loaded_at: u64,
}

impl Asset {
    pub fn builder(id: AssetId, kind: AssetKind, point: GeoPoint) -> AssetBuilder {
        AssetBuilder {
            id,
            kind,
            point,
            health: None,
            load: None,
            loaded_at: 0,
        }
    }

    /// Copy carrying fresh readings and insertion sequence; identity, kind,
    /// and position are taken from `self`.
    pub fn refreshed(&self, health: Option<Level>, load: Option<Level>, loaded_at: u64) -> Asset {
        Asset {
            id: self.id.clone(),
            kind: self.kind,
            point: self.point,
            health,
            load,
            status: Status::from_readings(health, load),
            loaded_at,
        }
    }

    pub fn id(&self) -> &AssetId {
        &self.id
    }

    pub fn kind(&self) -> AssetKind {
        self.kind
    }

    pub fn point(&self) -> GeoPoint {
        self.point
    }

    pub fn health(&self) -> Option<Level> {
        self.health
    }

    pub fn load(&self) -> Option<Level> {
        self.load
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn loaded_at(&self) -> u64 {
        self.loaded_at
    }

    pub fn is_hub(&self) -> bool {
        self.kind.is_hub()
    }
}

/// Builder for resident assets. Status is always derived, never set.
pub struct AssetBuilder {
    id: AssetId,
    kind: AssetKind,
    point: GeoPoint,
    health: Option<Level>,
    load: Option<Level>,
    loaded_at: u64,
}

impl AssetBuilder {
    pub fn health(mut self, health: Option<Level>) -> Self {
        self.health = health;
        self
    }

    pub fn load(mut self, load: Option<Level>) -> Self {
        self.load = load;
        self
    }

    pub fn loaded_at(mut self, seq: u64) -> Self {
        self.loaded_at = seq;
        self
    }

    pub fn build(self) -> Asset {
        let status = Status::from_readings(self.health, self.load);
        Asset {
            id: self.id,
            kind: self.kind,
            point: self.point,
            health: self.health,
            load: self.load,
            status,
            loaded_at: self.loaded_at,
        }
    }
}

/// Resident connection between two assets. Endpoint coordinates are
/// denormalized at insertion so consumers can draw the line without a store
/// lookup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    key: EdgeKey,
    from_point: GeoPoint,
    to_point: GeoPoint,
    loaded_at: u64,
}

impl Edge {
    pub fn new(key: EdgeKey, from_point: GeoPoint, to_point: GeoPoint, loaded_at: u64) -> Self {
        Self {
            key,
            from_point,
            to_point,
            loaded_at,
        }
    }

    pub fn key(&self) -> &EdgeKey {
        &self.key
    }

    pub fn from_id(&self) -> &AssetId {
        &self.key.from
    }

    pub fn to_id(&self) -> &AssetId {
        &self.key.to
    }

    pub fn from_point(&self) -> GeoPoint {
        self.from_point
    }

    pub fn to_point(&self) -> GeoPoint {
        self.to_point
    }

    pub fn loaded_at(&self) -> u64 {
        self.loaded_at
    }
}

/// Derived cluster around one hub. Recomputed wholesale; holds no lifetime of
/// its own. `member_ids` lists leaves only and is sorted for stable output;
/// `worst_status` folds in the hub's own status so an unhealthy hub shows on
/// its collapsed badge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub hub_id: AssetId,
    pub center: GeoPoint,
    pub member_ids: Vec<AssetId>,
    pub count_by_kind: BTreeMap<AssetKind, usize>,
    pub avg_health: Option<f32>,
    pub avg_load: Option<f32>,
    pub worst_status: Status,
}

impl Cluster {
    pub fn member_count(&self) -> usize {
        self.member_ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(lon: f64, lat: f64) -> GeoPoint {
        GeoPoint::new(lon, lat).expect("point")
    }

    fn sample_asset() -> Asset {
        Asset::builder(
            AssetId::new("tx-1"),
            AssetKind::Transformer,
            point(13.4, 52.5),
        )
        .health(Some(Level::new(80.0).expect("level")))
        .load(Some(Level::new(40.0).expect("level")))
        .loaded_at(7)
        .build()
    }

    #[test]
    fn level_validation() {
        assert!(Level::new(0.0).is_ok());
        assert!(Level::new(100.0).is_ok());
        assert!(Level::new(100.5).is_err());
        assert!(Level::new(-0.1).is_err());
        assert!(Level::new(f32::NAN).is_err());
        assert_eq!(Level::clamped(120.0).get(), 100.0);
        assert_eq!(Level::clamped(-3.0).get(), 0.0);
        assert_eq!(Level::clamped(f32::NAN).get(), 0.0);
    }

    #[test]
    fn asset_kind_serde_names_are_stable() {
        let kinds = [
            (AssetKind::Substation, "substation"),
            (AssetKind::Transformer, "transformer"),
            (AssetKind::Switch, "switch"),
            (AssetKind::Meter, "meter"),
            (AssetKind::Sensor, "sensor"),
        ];

        for (kind, expected) in kinds {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{expected}\""));
            assert_eq!(AssetKind::parse(expected), Some(kind));
        }
        assert_eq!(AssetKind::parse("windmill"), None);
    }

    #[test]
    fn only_substation_is_hub() {
        for kind in AssetKind::ALL {
            assert_eq!(kind.is_hub(), kind == AssetKind::Substation);
        }
    }

    #[test]
    fn status_orders_worst_last() {
        assert!(Status::Healthy < Status::Warning);
        assert!(Status::Warning < Status::Critical);
        assert_eq!(Status::Healthy.max(Status::Critical), Status::Critical);
    }

    #[test]
    fn status_from_readings_thresholds() {
        let lvl = |v: f32| Some(Level::new(v).expect("level"));
        assert_eq!(Status::from_readings(None, None), Status::Healthy);
        assert_eq!(Status::from_readings(lvl(80.0), lvl(50.0)), Status::Healthy);
        assert_eq!(Status::from_readings(lvl(50.0), None), Status::Warning);
        assert_eq!(Status::from_readings(None, lvl(80.0)), Status::Warning);
        assert_eq!(Status::from_readings(lvl(10.0), None), Status::Critical);
        assert_eq!(Status::from_readings(lvl(90.0), lvl(95.0)), Status::Critical);
    }

    #[test]
    fn geo_point_rejects_bad_coordinates() {
        assert!(GeoPoint::new(13.4, 52.5).is_ok());
        assert_eq!(GeoPoint::new(f64::NAN, 0.0), Err(GeoError::NotFinite));
        assert_eq!(
            GeoPoint::new(0.0, 91.0),
            Err(GeoError::LatitudeOutOfRange(91.0))
        );
        assert_eq!(
            GeoPoint::new(-200.0, 0.0),
            Err(GeoError::LongitudeOutOfRange(-200.0))
        );
    }

    #[test]
    fn bounding_box_contains_and_intersects() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0).expect("box");
        let b = BoundingBox::new(5.0, 5.0, 15.0, 15.0).expect("box");
        let c = BoundingBox::new(11.0, 11.0, 12.0, 12.0).expect("box");
        assert!(a.contains(point(0.0, 0.0)));
        assert!(a.contains(point(10.0, 10.0)));
        assert!(!a.contains(point(10.1, 5.0)));
        assert!(a.intersects(&b));
        assert!(b.intersects(&a));
        assert!(!a.intersects(&c));
        assert!(BoundingBox::new(1.0, 1.0, 0.0, 0.0).is_err());
    }

    #[test]
    fn expansion_scales_about_center_and_clamps() {
        let b = BoundingBox::new(-10.0, -10.0, 10.0, 10.0).expect("box");
        let e = b.expanded(2.0);
        assert_eq!(e.min_lon, -20.0);
        assert_eq!(e.max_lat, 20.0);
        assert_eq!(b.expanded(1.0), b);

        let edge = BoundingBox::new(170.0, 80.0, 179.0, 89.0).expect("box");
        let clamped = edge.expanded(4.0);
        assert_eq!(clamped.max_lon, 180.0);
        assert_eq!(clamped.max_lat, 90.0);
    }

    #[test]
    fn builder_derives_status() {
        let asset = sample_asset();
        assert_eq!(asset.status(), Status::Healthy);
        assert_eq!(asset.loaded_at(), 7);

        let refreshed = asset.refreshed(Some(Level::clamped(10.0)), None, 9);
        assert_eq!(refreshed.status(), Status::Critical);
        assert_eq!(refreshed.loaded_at(), 9);
        assert_eq!(refreshed.id(), asset.id());
        assert_eq!(refreshed.point(), asset.point());
    }

    #[test]
    fn edge_key_display_and_dedup_identity() {
        let k1 = EdgeKey::new(AssetId::new("a"), AssetId::new("b"));
        let k2 = EdgeKey::new(AssetId::new("a"), AssetId::new("b"));
        let k3 = EdgeKey::new(AssetId::new("b"), AssetId::new("a"));
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
        assert_eq!(k1.to_string(), "a->b");
    }
}
