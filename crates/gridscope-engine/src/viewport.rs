//! Viewport tracking with throttled change emission.
//!
//! Pan and zoom streams arrive at animation-frame rates; the tracker collapses
//! them into occasional change events so every event can afford a fetch and a
//! cull pass downstream. Suppressed updates are dropped, never queued: the
//! next emitted event always carries the latest raw viewport.

use std::sync::Arc;
use std::time::{Duration, Instant};

use gridscope_core::{BoundingBox, Viewport};
use serde::{Deserialize, Serialize};

pub(crate) trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub(crate) struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Throttle knobs for viewport change emission.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Minimum time between emitted change events.
    pub min_interval_ms: u64,
    /// Minimum center shift or resize, as a fraction of the previous
    /// viewport span, for a pan to count as movement. Zoom changes always
    /// count.
    pub min_move_fraction: f64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 150,
            min_move_fraction: 0.15,
        }
    }
}

/// Emitted when the tracked viewport actually changed. Carries the derived
/// regions so consumers never recompute them with mismatched factors.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ViewportChanged {
    pub viewport: Viewport,
    pub load_region: BoundingBox,
    pub cull_region: BoundingBox,
}

/// Holds the current viewport and decides which raw updates are worth
/// reacting to. Only [`ViewportTracker::update`] mutates; the region queries
/// are pure.
pub struct ViewportTracker {
    throttle: ThrottleConfig,
    load_factor: f64,
    cull_factor: f64,
    clock: Arc<dyn Clock>,
    current: Option<Viewport>,
    last_emit: Option<Instant>,
}

impl ViewportTracker {
    pub fn new(throttle: ThrottleConfig, load_factor: f64, cull_factor: f64) -> Self {
        Self::with_clock(throttle, load_factor, cull_factor, Arc::new(SystemClock))
    }

    pub(crate) fn with_clock(
        throttle: ThrottleConfig,
        load_factor: f64,
        cull_factor: f64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            throttle,
            load_factor,
            cull_factor,
            clock,
            current: None,
            last_emit: None,
        }
    }

    /// Feeds one raw viewport through the throttle. Returns a change event
    /// when the update passed, `None` when it was suppressed.
    pub fn update(&mut self, raw: Viewport) -> Option<ViewportChanged> {
        let now = self.clock.now();
        if let Some(prev) = self.current {
            let zoomed = raw.zoom != prev.zoom;
            if !zoomed && !self.moved_enough(&prev.bounds, &raw.bounds) {
                return None;
            }
            if let Some(last) = self.last_emit {
                if now.duration_since(last) < Duration::from_millis(self.throttle.min_interval_ms)
                {
                    return None;
                }
            }
        }
        self.current = Some(raw);
        self.last_emit = Some(now);
        Some(ViewportChanged {
            viewport: raw,
            load_region: raw.bounds.expanded(self.load_factor),
            cull_region: raw.bounds.expanded(self.cull_factor),
        })
    }

    fn moved_enough(&self, prev: &BoundingBox, next: &BoundingBox) -> bool {
        let span = prev.width().max(prev.height());
        if span <= 0.0 {
            return prev != next;
        }
        let pc = prev.center();
        let nc = next.center();
        let shift = (pc.lon - nc.lon).abs().max((pc.lat - nc.lat).abs());
        let resize = (prev.width() - next.width())
            .abs()
            .max((prev.height() - next.height()).abs());
        shift.max(resize) >= self.throttle.min_move_fraction * span
    }

    pub fn viewport(&self) -> Option<Viewport> {
        self.current
    }

    /// Region worth fetching eagerly: the last emitted viewport expanded by
    /// the load factor.
    pub fn load_region(&self) -> Option<BoundingBox> {
        self.current.map(|v| v.bounds.expanded(self.load_factor))
    }

    /// Region worth retaining: the last emitted viewport expanded by the
    /// cull factor. Strictly wider than the load region, which is what gives
    /// the cache its hysteresis.
    pub fn cull_region(&self) -> Option<BoundingBox> {
        self.current.map(|v| v.bounds.expanded(self.cull_factor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct MockClock {
        now: Mutex<Instant>,
    }

    impl MockClock {
        fn advance(&self, by: Duration) {
            let mut guard = self.now.lock().unwrap();
            *guard += by;
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> Instant {
            *self.now.lock().unwrap()
        }
    }

    fn tracker_with_clock() -> (ViewportTracker, Arc<MockClock>) {
        let clock = Arc::new(MockClock {
            now: Mutex::new(Instant::now()),
        });
        let tracker =
            ViewportTracker::with_clock(ThrottleConfig::default(), 1.5, 2.5, clock.clone());
        (tracker, clock)
    }

    fn vp(cx: f64, cy: f64, half: f64, zoom: u8) -> Viewport {
        Viewport::new(
            BoundingBox::new(cx - half, cy - half, cx + half, cy + half).expect("box"),
            zoom,
        )
    }

    #[test]
    fn first_update_always_emits() {
        let (mut tracker, _clock) = tracker_with_clock();
        let changed = tracker.update(vp(0.0, 0.0, 1.0, 12)).expect("first emit");
        assert_eq!(changed.viewport, vp(0.0, 0.0, 1.0, 12));
        assert_eq!(changed.load_region, vp(0.0, 0.0, 1.0, 12).bounds.expanded(1.5));
        assert_eq!(changed.cull_region, vp(0.0, 0.0, 1.0, 12).bounds.expanded(2.5));
    }

    #[test]
    fn identical_viewport_is_suppressed() {
        let (mut tracker, clock) = tracker_with_clock();
        assert!(tracker.update(vp(0.0, 0.0, 1.0, 12)).is_some());
        clock.advance(Duration::from_secs(10));
        assert!(tracker.update(vp(0.0, 0.0, 1.0, 12)).is_none());
    }

    #[test]
    fn small_pan_suppressed_large_pan_emits() {
        let (mut tracker, clock) = tracker_with_clock();
        assert!(tracker.update(vp(0.0, 0.0, 1.0, 12)).is_some());
        clock.advance(Duration::from_secs(1));
        // Span is 2 degrees; the threshold is 0.3 degrees of center shift.
        assert!(tracker.update(vp(0.1, 0.0, 1.0, 12)).is_none());
        assert!(tracker.update(vp(0.5, 0.0, 1.0, 12)).is_some());
    }

    #[test]
    fn interval_gates_even_large_moves() {
        let (mut tracker, clock) = tracker_with_clock();
        assert!(tracker.update(vp(0.0, 0.0, 1.0, 12)).is_some());
        assert!(tracker.update(vp(5.0, 0.0, 1.0, 12)).is_none());
        clock.advance(Duration::from_millis(200));
        let changed = tracker.update(vp(6.0, 0.0, 1.0, 12)).expect("emit");
        // Last value wins: the emitted viewport is the latest raw one, the
        // suppressed intermediate is gone.
        assert_eq!(changed.viewport, vp(6.0, 0.0, 1.0, 12));
    }

    #[test]
    fn zoom_change_counts_as_movement() {
        let (mut tracker, clock) = tracker_with_clock();
        assert!(tracker.update(vp(0.0, 0.0, 1.0, 12)).is_some());
        clock.advance(Duration::from_secs(1));
        assert!(tracker.update(vp(0.0, 0.0, 1.0, 13)).is_some());
    }

    #[test]
    fn region_queries_are_pure_and_empty_before_first_update() {
        let (mut tracker, clock) = tracker_with_clock();
        assert!(tracker.viewport().is_none());
        assert!(tracker.load_region().is_none());
        assert!(tracker.cull_region().is_none());

        tracker.update(vp(0.0, 0.0, 1.0, 12));
        clock.advance(Duration::from_secs(1));
        let first = tracker.cull_region();
        let second = tracker.cull_region();
        assert_eq!(first, second);
        assert_eq!(tracker.viewport(), Some(vp(0.0, 0.0, 1.0, 12)));
    }
}
