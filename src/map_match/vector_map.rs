use serde::{Deserialize, Serialize};

use crate::error::{FusionError, FusionResult};

/// Site-local floor plan in meters (x east, y north).
///
/// ```json
/// { "corridors": [[[0.0, 0.0], [0.0, 100.0]]], "walls": [[[1.0, 0.0], [1.0, 10.0]]] }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorMap {
    /// Corridor center lines, each a polyline of at least two vertices
    pub corridors: Vec<Vec<[f64; 2]>>,
    /// Wall segments
    pub walls: Vec<[[f64; 2]; 2]>,
}

impl VectorMap {
    pub fn from_json_str(json: &str) -> FusionResult<Self> {
        let map: VectorMap = serde_json::from_str(json)
            .map_err(|e| FusionError::InvalidConfig(format!("vector map: {e}")))?;
        map.validate()?;
        Ok(map)
    }

    pub fn validate(&self) -> FusionResult<()> {
        for (i, corridor) in self.corridors.iter().enumerate() {
            if corridor.len() < 2 {
                return Err(FusionError::InvalidConfig(format!(
                    "corridor {i} has {} vertices, need at least 2",
                    corridor.len()
                )));
            }
            if corridor.iter().flatten().any(|v| !v.is_finite()) {
                return Err(FusionError::InvalidConfig(format!("corridor {i} has non-finite vertices")));
            }
        }
        if let Some(i) = self.walls.iter().position(|w| w.iter().flatten().any(|v| !v.is_finite())) {
            return Err(FusionError::InvalidConfig(format!("wall {i} has non-finite endpoints")));
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.corridors.is_empty()
    }

    pub fn corridor_segment_count(&self) -> usize {
        self.corridors.iter().map(|c| c.len().saturating_sub(1)).sum()
    }
}
