pub mod matcher;
pub mod segment_tree;
pub mod vector_map;

pub use matcher::{MapMatcher, MapSnap};
pub use segment_tree::{IndexedSegment, Projection, SegmentTree};
pub use vector_map::VectorMap;
