use geo::{Coord, Intersects, Line};
use rstar::{RTree, RTreeObject, AABB};

/// Straight segment with its bounding box, tagged with the polyline it came
/// from and its position in that polyline
#[derive(Clone, Debug)]
pub struct IndexedSegment {
    pub line: Line<f64>,
    pub owner: usize,
    pub index: usize,
    pub envelope: AABB<[f64; 2]>,
}

impl IndexedSegment {
    pub fn new(line: Line<f64>, owner: usize, index: usize) -> Self {
        IndexedSegment {
            envelope: compute_envelope(&line),
            line,
            owner,
            index,
        }
    }
}

impl RTreeObject for IndexedSegment {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// Orthogonal projection of a point onto a segment
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Projection {
    /// Closest point on the segment
    pub point: (f64, f64),
    /// Euclidean distance from the query point (m)
    pub distance: f64,
    /// Clamped projection parameter in [0, 1]
    pub t: f64,
    pub owner: usize,
    pub index: usize,
}

/// R-Tree spatial index over map segments
///
/// # Architecture
/// - Corridor polylines are split into straight segments and indexed by
///   bounding box (envelope)
/// - Radius queries prefilter by envelope, then project exactly
/// - Crossing queries test a motion segment against the walls it may hit
///
/// # Usage
/// ```no_run
/// use pdr_fusion::map_match::SegmentTree;
///
/// let tree = SegmentTree::from_polylines(&[vec![[0.0, 0.0], [0.0, 100.0]]]);
/// let nearest = tree.nearest_within((0.8, 50.0), 2.0);
/// ```
pub struct SegmentTree {
    tree: RTree<IndexedSegment>,
    segment_count: usize,
}

impl SegmentTree {
    pub fn new() -> Self {
        SegmentTree {
            tree: RTree::new(),
            segment_count: 0,
        }
    }

    /// Index every consecutive vertex pair of every polyline.
    pub fn from_polylines(polylines: &[Vec<[f64; 2]>]) -> Self {
        let segments: Vec<IndexedSegment> = polylines
            .iter()
            .enumerate()
            .flat_map(|(owner, vertices)| {
                vertices.windows(2).enumerate().map(move |(index, pair)| {
                    IndexedSegment::new(make_line(pair[0], pair[1]), owner, index)
                })
            })
            .collect();
        Self::bulk(segments)
    }

    /// Index standalone two-point segments (walls).
    pub fn from_segments(segments: &[[[f64; 2]; 2]]) -> Self {
        let segments: Vec<IndexedSegment> = segments
            .iter()
            .enumerate()
            .map(|(owner, [a, b])| IndexedSegment::new(make_line(*a, *b), owner, 0))
            .collect();
        Self::bulk(segments)
    }

    fn bulk(segments: Vec<IndexedSegment>) -> Self {
        let segment_count = segments.len();
        SegmentTree {
            tree: RTree::bulk_load(segments),
            segment_count,
        }
    }

    /// Nearest segment projection within `radius` of `point`, if any.
    pub fn nearest_within(&self, point: (f64, f64), radius: f64) -> Option<Projection> {
        let (x, y) = point;
        let envelope = AABB::from_corners([x - radius, y - radius], [x + radius, y + radius]);

        self.tree
            .locate_in_envelope_intersecting(&envelope)
            .map(|seg| project_onto(&seg.line, point, seg.owner, seg.index))
            .filter(|p| p.distance <= radius)
            .min_by(|a, b| a.distance.total_cmp(&b.distance))
    }

    /// First indexed segment intersected by the motion `from -> to`
    pub fn first_crossing(&self, from: (f64, f64), to: (f64, f64)) -> Option<&IndexedSegment> {
        let motion = make_line([from.0, from.1], [to.0, to.1]);
        self.tree
            .locate_in_envelope_intersecting(&compute_envelope(&motion))
            .find(|seg| seg.line.intersects(&motion))
    }

    pub fn segment_count(&self) -> usize {
        self.segment_count
    }
}

impl Default for SegmentTree {
    fn default() -> Self {
        Self::new()
    }
}

fn make_line(a: [f64; 2], b: [f64; 2]) -> Line<f64> {
    Line::new(Coord { x: a[0], y: a[1] }, Coord { x: b[0], y: b[1] })
}

fn compute_envelope(line: &Line<f64>) -> AABB<[f64; 2]> {
    AABB::from_corners([line.start.x, line.start.y], [line.end.x, line.end.y])
}

/// Projection parameter `t = (p - a)·(b - a) / |b - a|²`, clamped to [0, 1].
pub fn project_onto(line: &Line<f64>, point: (f64, f64), owner: usize, index: usize) -> Projection {
    let (ax, ay) = (line.start.x, line.start.y);
    let dx = line.end.x - ax;
    let dy = line.end.y - ay;
    let length_sq = dx * dx + dy * dy;

    let t = if length_sq < 1e-12 {
        // Degenerate segment (start == end)
        0.0
    } else {
        (((point.0 - ax) * dx + (point.1 - ay) * dy) / length_sq).clamp(0.0, 1.0)
    };

    let closest = (ax + t * dx, ay + t * dy);
    Projection {
        point: closest,
        distance: (point.0 - closest.0).hypot(point.1 - closest.1),
        t,
        owner,
        index,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn make_test_corridors() -> Vec<Vec<[f64; 2]>> {
        vec![
            vec![[0.0, 0.0], [0.0, 10.0], [10.0, 10.0]],
            vec![[20.0, 0.0], [20.0, 30.0]],
        ]
    }

    #[test]
    fn test_build_tree_from_polylines() {
        let tree = SegmentTree::from_polylines(&make_test_corridors());
        assert_eq!(tree.segment_count(), 3);
    }

    #[test]
    fn test_build_tree_from_100_corridors() {
        let corridors: Vec<Vec<[f64; 2]>> = (0..100)
            .map(|i| {
                let offset = i as f64 * 5.0;
                vec![[offset, 0.0], [offset, 50.0]]
            })
            .collect();
        let tree = SegmentTree::from_polylines(&corridors);
        assert_eq!(tree.segment_count(), 100);

        let hit = tree.nearest_within((251.0, 20.0), 2.0).unwrap();
        assert_eq!(hit.owner, 50);
    }

    #[test]
    fn test_nearest_picks_closest_segment() {
        let tree = SegmentTree::from_polylines(&make_test_corridors());

        // Near the corner, closer to the horizontal leg
        let hit = tree.nearest_within((5.0, 9.5), 2.0).unwrap();
        assert_eq!((hit.owner, hit.index), (0, 1));
        assert_abs_diff_eq!(hit.distance, 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(hit.point.0, 5.0, epsilon = 1e-12);
        assert_abs_diff_eq!(hit.point.1, 10.0, epsilon = 1e-12);
    }

    #[test]
    fn test_radius_filter() {
        let tree = SegmentTree::from_polylines(&make_test_corridors());
        assert!(tree.nearest_within((5.0, 5.0), 2.0).is_none());
        assert!(tree.nearest_within((5.0, 5.0), 5.0).is_some());
    }

    #[test]
    fn test_projection_clamps_to_endpoints() {
        let line = make_line([0.0, 0.0], [0.0, 10.0]);
        let p = project_onto(&line, (3.0, -4.0), 0, 0);
        assert_eq!(p.t, 0.0);
        assert_abs_diff_eq!(p.distance, 5.0, epsilon = 1e-12);

        let degenerate = make_line([1.0, 1.0], [1.0, 1.0]);
        let p = project_onto(&degenerate, (4.0, 5.0), 0, 0);
        assert_abs_diff_eq!(p.distance, 5.0, epsilon = 1e-12);
    }

    #[test]
    fn test_wall_crossing() {
        let walls = SegmentTree::from_segments(&[[[1.0, 0.0], [1.0, 10.0]], [[5.0, 0.0], [5.0, 10.0]]]);
        assert_eq!(walls.segment_count(), 2);

        let crossed = walls.first_crossing((0.5, 5.0), (1.5, 5.0)).unwrap();
        assert_eq!(crossed.owner, 0);
        assert!(walls.first_crossing((2.0, 5.0), (4.0, 5.0)).is_none());
        assert!(walls.first_crossing((0.5, 11.0), (1.5, 11.0)).is_none());
    }

    #[test]
    fn test_empty_tree() {
        let tree = SegmentTree::new();
        assert_eq!(tree.segment_count(), 0);
        assert!(tree.nearest_within((0.0, 0.0), 100.0).is_none());
        assert!(tree.first_crossing((0.0, 0.0), (1.0, 1.0)).is_none());
    }
}
