use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::trace;

use ovc_protocol::types::PlayerId;

use crate::config::Config;

/// One sampled player position. `timestamp` is the monotonic update time.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// Degrees, normalized into (-180, 180].
    pub yaw: f64,
    pub pitch: f64,
    pub world_id: String,
    pub timestamp: Instant,
}

/// Euclidean distance, infinite across worlds.
pub fn distance(a: &Position, b: &Position) -> f64 {
    if a.world_id != b.world_id {
        return f64::INFINITY;
    }
    let (dx, dy, dz) = (a.x - b.x, a.y - b.y, a.z - b.z);
    (dx * dx + dy * dy + dz * dz).sqrt()
}

/// Fold a degree value into (-180, 180].
pub fn normalize_degrees(d: f64) -> f64 {
    let mut d = d % 360.0;
    if d <= -180.0 {
        d += 360.0;
    } else if d > 180.0 {
        d -= 360.0;
    }
    d
}

fn angle_delta(a: f64, b: f64) -> f64 {
    normalize_degrees(a - b).abs()
}

/// Single-writer, many-reader map of live player positions.
///
/// The game adapter is expected to throttle updates; the tracker still
/// defends against a chatty adapter by dropping sub-interval updates whose
/// movement stays under both the translation and rotation thresholds.
pub struct PositionTracker {
    entries: DashMap<PlayerId, Position>,
    min_interval: Duration,
    min_distance: f64,
    rotation_threshold: f64,
    ttl: Duration,
}

impl PositionTracker {
    pub fn new(config: &Config) -> Self {
        Self {
            entries: DashMap::new(),
            min_interval: Duration::from_millis(config.position_min_interval_ms),
            min_distance: config.position_min_distance,
            rotation_threshold: config.position_rotation_threshold,
            ttl: Duration::from_secs(config.position_ttl_secs),
        }
    }

    /// Record a position sample. Returns whether the update was accepted.
    #[allow(clippy::too_many_arguments)]
    pub fn upsert(
        &self,
        player_id: PlayerId,
        x: f64,
        y: f64,
        z: f64,
        yaw: f64,
        pitch: f64,
        world_id: &str,
    ) -> bool {
        let now = Instant::now();
        let next = Position {
            x,
            y,
            z,
            yaw: normalize_degrees(yaw),
            pitch: normalize_degrees(pitch),
            world_id: world_id.to_string(),
            timestamp: now,
        };

        match self.entries.get_mut(&player_id) {
            Some(mut prev) => {
                let elapsed = now.saturating_duration_since(prev.timestamp);
                let moved = distance(&prev, &next);
                let rotated = angle_delta(prev.yaw, next.yaw)
                    .max(angle_delta(prev.pitch, next.pitch));

                // World changes always pass (distance reads as infinite).
                let significant =
                    moved > self.min_distance || rotated > self.rotation_threshold;
                if elapsed < self.min_interval && !significant {
                    trace!(player = %player_id, "position update throttled");
                    return false;
                }
                *prev = next;
                true
            }
            None => {
                self.entries.insert(player_id, next);
                true
            }
        }
    }

    /// Current position, or `None` if unknown or stale.
    pub fn get(&self, player_id: &PlayerId) -> Option<Position> {
        let entry = self.entries.get(player_id)?;
        if entry.timestamp.elapsed() > self.ttl {
            return None;
        }
        Some(entry.clone())
    }

    pub fn remove(&self, player_id: &PlayerId) {
        self.entries.remove(player_id);
    }

    /// Snapshot of all live (non-expired) positions.
    pub fn snapshot(&self) -> Vec<(PlayerId, Position)> {
        self.entries
            .iter()
            .filter(|e| e.timestamp.elapsed() <= self.ttl)
            .map(|e| (*e.key(), e.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn tracker() -> PositionTracker {
        PositionTracker::new(&Config::default())
    }

    fn pos(x: f64, world: &str) -> Position {
        Position {
            x,
            y: 0.0,
            z: 0.0,
            yaw: 0.0,
            pitch: 0.0,
            world_id: world.into(),
            timestamp: Instant::now(),
        }
    }

    #[test]
    fn distance_same_world() {
        let a = pos(0.0, "overworld");
        let b = pos(3.0, "overworld");
        assert_eq!(distance(&a, &b), 3.0);
        assert_eq!(distance(&a, &a), 0.0);
    }

    #[test]
    fn distance_across_worlds_is_infinite() {
        let a = pos(0.0, "overworld");
        let b = pos(0.0, "nether");
        assert_eq!(distance(&a, &b), f64::INFINITY);
    }

    #[test]
    fn normalize_degrees_range() {
        assert_eq!(normalize_degrees(0.0), 0.0);
        assert_eq!(normalize_degrees(180.0), 180.0);
        assert_eq!(normalize_degrees(-180.0), 180.0);
        assert_eq!(normalize_degrees(190.0), -170.0);
        assert_eq!(normalize_degrees(540.0), 180.0);
        assert_eq!(normalize_degrees(-350.0), 10.0);
    }

    #[test]
    fn first_update_accepted() {
        let t = tracker();
        let p = Uuid::new_v4();
        assert!(t.upsert(p, 1.0, 2.0, 3.0, 10.0, 5.0, "overworld"));
        let stored = t.get(&p).unwrap();
        assert_eq!(stored.x, 1.0);
        assert_eq!(stored.world_id, "overworld");
    }

    #[test]
    fn small_rapid_update_throttled() {
        let t = tracker();
        let p = Uuid::new_v4();
        assert!(t.upsert(p, 0.0, 0.0, 0.0, 0.0, 0.0, "overworld"));
        // Within min interval, moved 0.1 m, rotated 0.5 degrees: dropped.
        assert!(!t.upsert(p, 0.1, 0.0, 0.0, 0.5, 0.0, "overworld"));
        assert_eq!(t.get(&p).unwrap().x, 0.0);
    }

    #[test]
    fn large_translation_bypasses_throttle() {
        let t = tracker();
        let p = Uuid::new_v4();
        assert!(t.upsert(p, 0.0, 0.0, 0.0, 0.0, 0.0, "overworld"));
        assert!(t.upsert(p, 1.0, 0.0, 0.0, 0.0, 0.0, "overworld"));
        assert_eq!(t.get(&p).unwrap().x, 1.0);
    }

    #[test]
    fn rotation_bypasses_throttle() {
        let t = tracker();
        let p = Uuid::new_v4();
        assert!(t.upsert(p, 0.0, 0.0, 0.0, 0.0, 0.0, "overworld"));
        assert!(t.upsert(p, 0.0, 0.0, 0.0, 45.0, 0.0, "overworld"));
        assert_eq!(t.get(&p).unwrap().yaw, 45.0);
    }

    #[test]
    fn world_change_bypasses_throttle() {
        let t = tracker();
        let p = Uuid::new_v4();
        assert!(t.upsert(p, 0.0, 0.0, 0.0, 0.0, 0.0, "overworld"));
        assert!(t.upsert(p, 0.0, 0.0, 0.0, 0.0, 0.0, "nether"));
        assert_eq!(t.get(&p).unwrap().world_id, "nether");
    }

    #[test]
    fn interval_elapse_accepts_small_update() {
        let t = tracker();
        let p = Uuid::new_v4();
        assert!(t.upsert(p, 0.0, 0.0, 0.0, 0.0, 0.0, "overworld"));
        std::thread::sleep(Duration::from_millis(60));
        assert!(t.upsert(p, 0.01, 0.0, 0.0, 0.0, 0.0, "overworld"));
    }

    #[test]
    fn stale_position_reads_as_absent() {
        let config: Config = toml::from_str("position_ttl_secs = 0").unwrap();
        let t = PositionTracker::new(&config);
        let p = Uuid::new_v4();
        t.upsert(p, 1.0, 0.0, 0.0, 0.0, 0.0, "overworld");
        std::thread::sleep(Duration::from_millis(5));
        assert!(t.get(&p).is_none());
        assert!(t.snapshot().is_empty());
    }

    #[test]
    fn remove_clears_entry() {
        let t = tracker();
        let p = Uuid::new_v4();
        t.upsert(p, 1.0, 0.0, 0.0, 0.0, 0.0, "overworld");
        t.remove(&p);
        assert!(t.get(&p).is_none());
    }
}
