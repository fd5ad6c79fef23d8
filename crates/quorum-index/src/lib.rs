//! Spatial proximity queries over a bounded square domain.
//!
//! The simulation core registers agent positions per species each cycle and
//! asks two questions: "which entries lie within a radius of a point" and
//! "which entries lie inside a rectangle". Entries are identified by their
//! insertion index, which callers map back to registry handles; visitors see
//! candidates in ascending insertion order so that ties are broken by
//! registry order rather than by bucket iteration order.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors emitted by spatial index implementations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., non-positive cell size).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Axis-aligned rectangle with inclusive bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub min_x: f32,
    pub min_y: f32,
    pub max_x: f32,
    pub max_y: f32,
}

impl Rect {
    #[must_use]
    pub fn new(min_x: f32, min_y: f32, max_x: f32, max_y: f32) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Returns true when `(x, y)` lies inside the rectangle.
    #[must_use]
    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }
}

/// Common behaviour exposed by proximity indices.
pub trait ProximityIndex {
    /// Rebuild internal structures from entry positions.
    fn rebuild(&mut self, positions: &[(f32, f32)]) -> Result<(), IndexError>;

    /// Visit entries within `radius` of `center` in ascending insertion
    /// order, passing each entry's squared distance. A non-positive radius
    /// visits nothing.
    fn within(
        &self,
        center: (f32, f32),
        radius: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    );

    /// Visit entries inside `region` in ascending insertion order.
    fn inside(&self, region: Rect, visitor: &mut dyn FnMut(usize));
}

/// Uniform grid index bucketing entries by cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniformGridIndex {
    cell_size: f32,
    extent: f32,
    cols: usize,
    #[serde(skip)]
    buckets: Vec<Vec<usize>>,
    #[serde(skip)]
    positions: Vec<(f32, f32)>,
}

impl UniformGridIndex {
    /// Create a grid covering a square domain of side `extent` with square
    /// buckets of side `cell_size`.
    #[must_use]
    pub fn new(cell_size: f32, extent: f32) -> Self {
        Self {
            cell_size,
            extent,
            cols: 0,
            buckets: Vec::new(),
            positions: Vec::new(),
        }
    }

    fn bucket_coord(&self, value: f32) -> usize {
        let clamped = value.clamp(0.0, self.extent);
        let coord = (clamped / self.cell_size) as usize;
        coord.min(self.cols.saturating_sub(1))
    }

    fn bucket_of(&self, x: f32, y: f32) -> usize {
        self.bucket_coord(y) * self.cols + self.bucket_coord(x)
    }
}

impl ProximityIndex for UniformGridIndex {
    fn rebuild(&mut self, positions: &[(f32, f32)]) -> Result<(), IndexError> {
        if self.cell_size <= 0.0 || !self.cell_size.is_finite() {
            return Err(IndexError::InvalidConfig("cell_size must be positive"));
        }
        if self.extent <= 0.0 || !self.extent.is_finite() {
            return Err(IndexError::InvalidConfig("extent must be positive"));
        }
        self.cols = ((self.extent / self.cell_size).ceil() as usize).max(1);
        let bucket_count = self.cols * self.cols;
        if self.buckets.len() != bucket_count {
            self.buckets.resize_with(bucket_count, Vec::new);
        }
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.positions.clear();
        self.positions.extend_from_slice(positions);
        for (idx, &(x, y)) in positions.iter().enumerate() {
            let bucket = self.bucket_of(x, y);
            self.buckets[bucket].push(idx);
        }
        Ok(())
    }

    fn within(
        &self,
        center: (f32, f32),
        radius: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    ) {
        if radius <= 0.0 || !radius.is_finite() || self.cols == 0 {
            return;
        }
        let min_cx = self.bucket_coord(center.0 - radius);
        let max_cx = self.bucket_coord(center.0 + radius);
        let min_cy = self.bucket_coord(center.1 - radius);
        let max_cy = self.bucket_coord(center.1 + radius);

        // Candidates are gathered and sorted so the visit order is the
        // insertion order, independent of bucket layout.
        let mut candidates: Vec<usize> = Vec::new();
        for cy in min_cy..=max_cy {
            for cx in min_cx..=max_cx {
                candidates.extend_from_slice(&self.buckets[cy * self.cols + cx]);
            }
        }
        candidates.sort_unstable();

        let radius_sq = radius * radius;
        for idx in candidates {
            let (x, y) = self.positions[idx];
            let dx = x - center.0;
            let dy = y - center.1;
            let dist_sq = dx * dx + dy * dy;
            if dist_sq <= radius_sq {
                visitor(idx, OrderedFloat(dist_sq));
            }
        }
    }

    fn inside(&self, region: Rect, visitor: &mut dyn FnMut(usize)) {
        if self.cols == 0 {
            return;
        }
        let min_cx = self.bucket_coord(region.min_x);
        let max_cx = self.bucket_coord(region.max_x);
        let min_cy = self.bucket_coord(region.min_y);
        let max_cy = self.bucket_coord(region.max_y);

        let mut candidates: Vec<usize> = Vec::new();
        for cy in min_cy..=max_cy {
            for cx in min_cx..=max_cx {
                candidates.extend_from_slice(&self.buckets[cy * self.cols + cx]);
            }
        }
        candidates.sort_unstable();

        for idx in candidates {
            let (x, y) = self.positions[idx];
            if region.contains(x, y) {
                visitor(idx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn built(positions: &[(f32, f32)]) -> UniformGridIndex {
        let mut index = UniformGridIndex::new(10.0, 100.0);
        index.rebuild(positions).expect("rebuild");
        index
    }

    fn within_ids(index: &UniformGridIndex, center: (f32, f32), radius: f32) -> Vec<usize> {
        let mut ids = Vec::new();
        index.within(center, radius, &mut |idx, _| ids.push(idx));
        ids
    }

    #[test]
    fn within_finds_entries_inside_radius() {
        let index = built(&[(5.0, 5.0), (6.0, 5.0), (50.0, 50.0)]);
        assert_eq!(within_ids(&index, (5.0, 5.0), 2.0), vec![0, 1]);
    }

    #[test]
    fn within_excludes_entries_outside_radius() {
        let index = built(&[(0.0, 0.0), (10.0, 10.0)]);
        assert_eq!(within_ids(&index, (0.0, 0.0), 1.0), vec![0]);
    }

    #[test]
    fn within_visits_in_insertion_order_across_buckets() {
        // Entries land in different grid buckets; order must still be 0, 1, 2.
        let index = built(&[(19.0, 5.0), (5.0, 5.0), (12.0, 14.0)]);
        assert_eq!(within_ids(&index, (12.0, 8.0), 12.0), vec![0, 1, 2]);
    }

    #[test]
    fn within_reports_squared_distances() {
        let index = built(&[(3.0, 4.0)]);
        let mut seen = Vec::new();
        index.within((0.0, 0.0), 6.0, &mut |idx, d| seen.push((idx, d)));
        assert_eq!(seen, vec![(0, OrderedFloat(25.0))]);
    }

    #[test]
    fn non_positive_radius_visits_nothing() {
        let index = built(&[(5.0, 5.0)]);
        assert!(within_ids(&index, (5.0, 5.0), 0.0).is_empty());
        assert!(within_ids(&index, (5.0, 5.0), -1.0).is_empty());
    }

    #[test]
    fn inside_respects_rectangle_bounds() {
        let index = built(&[(2.0, 2.0), (8.0, 8.0), (30.0, 30.0)]);
        let mut ids = Vec::new();
        index.inside(Rect::new(0.0, 0.0, 10.0, 10.0), &mut |idx| ids.push(idx));
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn rebuild_rejects_non_positive_cell_size() {
        let mut index = UniformGridIndex::new(0.0, 100.0);
        assert!(index.rebuild(&[]).is_err());
    }

    #[test]
    fn entries_outside_domain_are_clamped_into_edge_buckets() {
        let index = built(&[(150.0, -3.0)]);
        // Still discoverable by a query near the clamped corner bucket.
        assert_eq!(within_ids(&index, (150.0, -3.0), 1.0), vec![0]);
    }
}
