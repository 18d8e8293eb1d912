use super::{Projection, SegmentTree, VectorMap};
use crate::config::{MapMatchConfig, SnapFalloff};
use crate::error::{FusionError, FusionResult};

/// Result of snapping a position toward the corridor network
#[derive(Clone, Debug, PartialEq)]
pub struct MapSnap {
    /// Blended position written back to the filter
    pub position: (f64, f64),
    /// Nearest corridor point
    pub projection: Projection,
    /// Blend weight in [0, weight]
    pub weight: f64,
}

/// Corridor snapping with optional wall veto
///
/// # Architecture
/// - Queries the corridor R-Tree for the nearest projection within threshold
/// - Blend weight falls off with distance (`Linear` or `Quadratic`)
/// - A wall crossed by the move from the prior to the blended position
///   vetoes the snap
///
/// # Usage
/// ```no_run
/// use pdr_fusion::config::MapMatchConfig;
/// use pdr_fusion::map_match::{MapMatcher, VectorMap};
///
/// let map = VectorMap { corridors: vec![vec![[0.0, 0.0], [0.0, 100.0]]], walls: vec![] };
/// let matcher = MapMatcher::new(&map, MapMatchConfig::default());
/// if let Ok(snap) = matcher.snap((0.8, 50.0)) {
///     println!("snapped to ({:.2}, {:.2}) with w={:.2}", snap.position.0, snap.position.1, snap.weight);
/// }
/// ```
pub struct MapMatcher {
    corridors: SegmentTree,
    walls: SegmentTree,
    config: MapMatchConfig,
}

impl MapMatcher {
    pub fn new(map: &VectorMap, config: MapMatchConfig) -> Self {
        let corridors = SegmentTree::from_polylines(&map.corridors);
        let walls = SegmentTree::from_segments(&map.walls);
        log::info!(
            "Map matcher ready: {} corridor segments, {} walls",
            corridors.segment_count(),
            walls.segment_count()
        );
        MapMatcher { corridors, walls, config }
    }

    /// Snap `position`; pure in its inputs.
    ///
    /// # Errors
    /// `MapProjectionFailure` when no corridor lies within the threshold or a
    /// wall blocks the move. Callers treat it as "no snap this tick".
    pub fn snap(&self, position: (f64, f64)) -> FusionResult<MapSnap> {
        if !position.0.is_finite() || !position.1.is_finite() {
            return Err(FusionError::InvalidMeasurement("non-finite position".into()));
        }
        let threshold = self.config.threshold_m;

        let projection = self
            .corridors
            .nearest_within(position, threshold)
            .filter(|p| p.distance < threshold)
            .ok_or_else(|| {
                FusionError::MapProjectionFailure(format!(
                    "no corridor within {threshold} m of ({:.2}, {:.2})",
                    position.0, position.1
                ))
            })?;

        let weight = self.config.weight * falloff(self.config.falloff, projection.distance / threshold);
        let blended = (
            position.0 + weight * (projection.point.0 - position.0),
            position.1 + weight * (projection.point.1 - position.1),
        );

        if self.config.wall_veto && blended != position {
            if let Some(wall) = self.walls.first_crossing(position, blended) {
                return Err(FusionError::MapProjectionFailure(format!(
                    "snap blocked by wall {}",
                    wall.owner
                )));
            }
        }

        Ok(MapSnap { position: blended, projection, weight })
    }

    pub fn config(&self) -> &MapMatchConfig {
        &self.config
    }

    pub fn corridor_segment_count(&self) -> usize {
        self.corridors.segment_count()
    }
}

fn falloff(shape: SnapFalloff, ratio: f64) -> f64 {
    let r = ratio.clamp(0.0, 1.0);
    match shape {
        SnapFalloff::Linear => 1.0 - r,
        SnapFalloff::Quadratic => 1.0 - r * r,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn hallway() -> VectorMap {
        VectorMap {
            corridors: vec![vec![[0.0, 0.0], [0.0, 100.0]]],
            walls: vec![],
        }
    }

    #[test]
    fn test_snap_blends_toward_corridor() {
        let matcher = MapMatcher::new(&hallway(), MapMatchConfig::default());
        let snap = matcher.snap((0.8, 50.0)).unwrap();

        // r = 0.4, w = 0.5 * (1 - 0.16)
        assert_abs_diff_eq!(snap.weight, 0.42, epsilon = 1e-12);
        assert_abs_diff_eq!(snap.position.0, 0.464, epsilon = 1e-12);
        assert_abs_diff_eq!(snap.position.1, 50.0, epsilon = 1e-12);
        assert_abs_diff_eq!(snap.projection.distance, 0.8, epsilon = 1e-12);
    }

    #[test]
    fn test_linear_falloff() {
        let config = MapMatchConfig { falloff: SnapFalloff::Linear, ..Default::default() };
        let matcher = MapMatcher::new(&hallway(), config);
        let snap = matcher.snap((0.8, 50.0)).unwrap();
        assert_abs_diff_eq!(snap.weight, 0.3, epsilon = 1e-12);
        assert_abs_diff_eq!(snap.position.0, 0.56, epsilon = 1e-12);
    }

    #[test]
    fn test_on_corridor_is_fixed_point() {
        let matcher = MapMatcher::new(&hallway(), MapMatchConfig::default());
        let snap = matcher.snap((0.0, 20.0)).unwrap();
        assert_eq!(snap.position, (0.0, 20.0));
        assert_abs_diff_eq!(snap.weight, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_beyond_threshold_fails() {
        let matcher = MapMatcher::new(&hallway(), MapMatchConfig::default());
        assert!(matches!(matcher.snap((2.5, 50.0)), Err(FusionError::MapProjectionFailure(_))));
        assert!(matches!(matcher.snap((2.0, 50.0)), Err(FusionError::MapProjectionFailure(_))));
        assert!(matches!(matcher.snap((f64::NAN, 0.0)), Err(FusionError::InvalidMeasurement(_))));
    }

    #[test]
    fn test_empty_map_fails() {
        let matcher = MapMatcher::new(&VectorMap::default(), MapMatchConfig::default());
        assert!(matches!(matcher.snap((0.0, 0.0)), Err(FusionError::MapProjectionFailure(_))));
    }

    #[test]
    fn test_wall_vetoes_snap() {
        let mut map = hallway();
        map.walls.push([[0.5, 0.0], [0.5, 100.0]]);

        let matcher = MapMatcher::new(&map, MapMatchConfig::default());
        assert!(matches!(matcher.snap((0.8, 50.0)), Err(FusionError::MapProjectionFailure(_))));

        let permissive = MapMatchConfig { wall_veto: false, ..Default::default() };
        let matcher = MapMatcher::new(&map, permissive);
        assert!(matcher.snap((0.8, 50.0)).is_ok());
    }

    #[test]
    fn test_wall_beyond_blend_does_not_veto() {
        let mut map = hallway();
        // wall between prior and corridor, but the blend stops short of it
        map.walls.push([[0.3, 0.0], [0.3, 100.0]]);
        let matcher = MapMatcher::new(&map, MapMatchConfig::default());
        let snap = matcher.snap((0.8, 50.0)).unwrap();
        assert!(snap.position.0 > 0.3);
    }
}
